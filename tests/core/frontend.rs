use std::path::Path;

use tsumufs::error::FsError;
use tsumufs::types::OpenFlags;

use crate::common::{root_call, user_call, Fixture};

#[tokio::test]
async fn control_xattrs_answer_on_the_root() {
    let fixture = Fixture::connected().await;
    let root = Path::new("/");

    assert_eq!(
        fixture.fs.getxattr(root, "tsumufs.version").await.unwrap(),
        tsumufs::VERSION
    );
    assert_eq!(fixture.fs.getxattr(root, "tsumufs.connected").await.unwrap(), "1");

    fixture.disconnect();
    assert_eq!(fixture.fs.getxattr(root, "tsumufs.connected").await.unwrap(), "0");

    // Unknown names and writes to read-only attributes refuse alike.
    assert_eq!(
        fixture.fs.getxattr(root, "tsumufs.nonsense").await.unwrap_err(),
        FsError::Unsupported
    );
    assert_eq!(
        fixture.fs.setxattr(root, "tsumufs.version", "2.0").await.unwrap_err(),
        FsError::Unsupported
    );
}

#[tokio::test]
async fn dirty_and_in_cache_flags_track_state() {
    let fixture = Fixture::disconnected().await;
    let call = root_call();

    fixture.fs.create(Path::new("/flag"), 0o644, &call).await.unwrap();
    fixture.fs.write(Path::new("/flag"), 0, b"data").await.unwrap();

    assert_eq!(
        fixture.fs.getxattr(Path::new("/flag"), "tsumufs.in-cache").await.unwrap(),
        "1"
    );
    assert_eq!(
        fixture.fs.getxattr(Path::new("/flag"), "tsumufs.dirty").await.unwrap(),
        "1"
    );

    fixture.connect();
    fixture.drain().await;
    assert_eq!(
        fixture.fs.getxattr(Path::new("/flag"), "tsumufs.dirty").await.unwrap(),
        "0"
    );
}

#[tokio::test]
async fn should_cache_xattr_round_trips_policy() {
    let fixture = Fixture::connected().await;
    let path = Path::new("/media");

    assert_eq!(fixture.fs.getxattr(path, "tsumufs.should-cache").await.unwrap(), "= (+)");

    fixture.fs.setxattr(path, "tsumufs.should-cache", "-").await.unwrap();
    assert_eq!(fixture.fs.getxattr(path, "tsumufs.should-cache").await.unwrap(), "-");
    assert_eq!(
        fixture
            .fs
            .getxattr(Path::new("/media/big.iso"), "tsumufs.should-cache")
            .await
            .unwrap(),
        "= (-)"
    );

    fixture.fs.setxattr(path, "tsumufs.should-cache", "=").await.unwrap();
    assert_eq!(fixture.fs.getxattr(path, "tsumufs.should-cache").await.unwrap(), "= (+)");

    assert_eq!(
        fixture.fs.setxattr(path, "tsumufs.should-cache", "?").await.unwrap_err(),
        FsError::InvalidArgument
    );
}

#[tokio::test]
async fn pause_and_force_disconnect_flags_flip_signals() {
    let fixture = Fixture::connected().await;
    let root = Path::new("/");

    fixture.fs.setxattr(root, "tsumufs.pause-sync", "1").await.unwrap();
    assert!(fixture.ctx.signals.sync_paused());
    fixture.fs.setxattr(root, "tsumufs.pause-sync", "0").await.unwrap();
    assert!(!fixture.ctx.signals.sync_paused());

    fixture.fs.setxattr(root, "tsumufs.force-disconnect", "1").await.unwrap();
    assert!(fixture.ctx.signals.force_disconnect());
    assert!(!fixture.ctx.signals.upstream_available());
    assert!(!fixture.helper.is_mounted());
    fixture.fs.setxattr(root, "tsumufs.force-disconnect", "0").await.unwrap();
    assert!(!fixture.ctx.signals.force_disconnect());
}

#[tokio::test]
async fn listxattr_scopes_root_only_names() {
    let fixture = Fixture::connected().await;

    let on_root = fixture.fs.listxattr(Path::new("/")).await.unwrap();
    assert!(on_root.contains(&"tsumufs.connected".to_owned()));
    assert!(on_root.contains(&"tsumufs.dirty".to_owned()));
    assert!(on_root.contains(&"tsumufs.metrics".to_owned()));

    let on_file = fixture.fs.listxattr(Path::new("/anything")).await.unwrap();
    assert!(on_file.contains(&"tsumufs.dirty".to_owned()));
    assert!(on_file.contains(&"tsumufs.in-cache".to_owned()));
    assert!(on_file.contains(&"tsumufs.should-cache".to_owned()));
    assert!(!on_file.contains(&"tsumufs.connected".to_owned()));
}

#[tokio::test]
async fn readdir_merges_upstream_and_local_entries() {
    let fixture = Fixture::connected().await;
    fixture.write_upstream("/a", b"1");
    fixture.write_upstream("/b", b"2");

    fixture.fs.create(Path::new("/c"), 0o644, &root_call()).await.unwrap();

    let names: Vec<String> = fixture
        .fs
        .readdir(Path::new("/"))
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.name)
        .collect();
    assert!(names.contains(&"a".to_owned()));
    assert!(names.contains(&"b".to_owned()));
    assert!(names.contains(&"c".to_owned()));
}

#[tokio::test]
async fn readdir_hides_locally_unlinked_entries() {
    let fixture = Fixture::connected().await;
    fixture.write_upstream("/doomed", b"1");

    // Mirror it, then unlink while the upstream copy still exists.
    fixture.fs.read(Path::new("/doomed"), 0, 1).await.unwrap();
    fixture.disconnect();
    fixture.fs.unlink(Path::new("/doomed")).await.unwrap();
    fixture.connect();

    let names: Vec<String> = fixture
        .fs
        .readdir(Path::new("/"))
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.name)
        .collect();
    assert!(!names.contains(&"doomed".to_owned()));

    assert_eq!(
        fixture.fs.getattr(Path::new("/doomed")).await.unwrap_err(),
        FsError::NotFound
    );
}

#[tokio::test]
async fn access_applies_the_overlay_identity() {
    let fixture = Fixture::disconnected().await;

    let owner = user_call(100, 100);
    fixture.fs.create(Path::new("/private"), 0o600, &owner).await.unwrap();

    fixture.fs.access(Path::new("/private"), 0o4, &owner).await.expect("owner may read");
    assert_eq!(
        fixture
            .fs
            .access(Path::new("/private"), 0o4, &user_call(101, 101))
            .await
            .unwrap_err(),
        FsError::PermissionDenied
    );
    assert_eq!(
        fixture.fs.access(Path::new("/private"), 0o1, &owner).await.unwrap_err(),
        FsError::PermissionDenied
    );
    // Root bypasses.
    fixture.fs.access(Path::new("/private"), 0o7, &root_call()).await.unwrap();
}

#[tokio::test]
async fn exclusive_create_refuses_an_existing_path() {
    let fixture = Fixture::disconnected().await;
    let call = root_call();
    fixture.fs.create(Path::new("/once"), 0o644, &call).await.unwrap();

    let flags = OpenFlags {
        write: true,
        create: true,
        exclusive: true,
        ..OpenFlags::default()
    };
    assert_eq!(
        fixture.fs.open(Path::new("/once"), flags, 0o644, &call).await.unwrap_err(),
        FsError::AlreadyExists
    );
}

#[tokio::test]
async fn rename_replaces_an_existing_file() {
    let fixture = Fixture::disconnected().await;
    let call = root_call();

    fixture.fs.create(Path::new("/r1"), 0o644, &call).await.unwrap();
    fixture.fs.write(Path::new("/r1"), 0, b"first").await.unwrap();
    fixture.fs.create(Path::new("/r2"), 0o644, &call).await.unwrap();
    fixture.fs.write(Path::new("/r2"), 0, b"second").await.unwrap();

    fixture.fs.rename(Path::new("/r1"), Path::new("/r2")).await.unwrap();

    assert!(!fixture.cache_exists("/r1"));
    assert_eq!(fixture.fs.read(Path::new("/r2"), 0, 16).await.unwrap(), b"first");
}

#[tokio::test]
async fn rename_into_a_directory_lands_under_it() {
    let fixture = Fixture::disconnected().await;
    let call = root_call();

    fixture.fs.mkdir(Path::new("/dir"), 0o755, &call).await.unwrap();
    fixture.fs.create(Path::new("/file"), 0o644, &call).await.unwrap();
    fixture.fs.write(Path::new("/file"), 0, b"x").await.unwrap();

    fixture.fs.rename(Path::new("/file"), Path::new("/dir")).await.unwrap();

    assert!(fixture.cache_exists("/dir/file"));
    assert_eq!(fixture.fs.read(Path::new("/dir/file"), 0, 1).await.unwrap(), b"x");
}

#[tokio::test]
async fn zero_length_writes_leave_no_journal_trace() {
    let fixture = Fixture::disconnected().await;
    let call = root_call();
    fixture.fs.create(Path::new("/z"), 0o644, &call).await.unwrap();
    fixture.connect();
    fixture.drain().await;

    assert_eq!(fixture.fs.write(Path::new("/z"), 0, b"").await.unwrap(), 0);
    assert!(fixture.ctx.sync_log.is_empty());
}

#[tokio::test]
async fn metrics_xattr_reports_observed_operations() {
    let fixture = Fixture::connected().await;
    fixture.write_upstream("/m", b"1");
    fixture.fs.getattr(Path::new("/m")).await.unwrap();

    let rendered = fixture.fs.getxattr(Path::new("/"), "tsumufs.metrics").await.unwrap();
    assert!(rendered.contains("'getattr'"));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn statfs_answers_in_either_mode() {
    let fixture = Fixture::connected().await;
    let connected = fixture.fs.statfs().await.unwrap();
    assert!(connected.block_size > 0);

    fixture.disconnect();
    let offline = fixture.fs.statfs().await.unwrap();
    assert!(offline.block_size > 0);
}
