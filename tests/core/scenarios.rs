use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::common::{root_call, user_call, Fixture};

#[tokio::test]
async fn disconnected_create_then_reconnect_pushes_upstream() {
    let fixture = Fixture::connected().await;
    fixture.disconnect();

    let call = root_call();
    fixture.fs.create(Path::new("/a"), 0o644, &call).await.expect("create");
    fixture.fs.write(Path::new("/a"), 0, b"hello").await.expect("write");

    assert!(!fixture.upstream_exists("/a"));
    assert!(fixture.ctx.sync_log.is_dirty(Path::new("/a")));

    fixture.connect();
    fixture.drain().await;

    assert_eq!(fixture.read_upstream("/a"), b"hello");
    let mode = std::fs::metadata(fixture.upstream_path("/a"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o7777, 0o644);
    assert!(fixture.ctx.sync_log.is_empty());
    assert!(!fixture.ctx.sync_log.is_dirty(Path::new("/a")));
}

#[tokio::test]
async fn conflicting_change_is_materialized_not_forced() {
    let fixture = Fixture::connected().await;
    fixture.write_upstream("/b", b"aaaaa");

    // Mirror the file while connected so a pre-image exists.
    assert_eq!(fixture.fs.read(Path::new("/b"), 0, 5).await.unwrap(), b"aaaaa");

    fixture.disconnect();
    fixture.fs.write(Path::new("/b"), 0, b"bbbbb").await.expect("local write");

    // Somebody else rewrites the upstream while we are away.
    fixture.write_upstream("/b", b"ccccc");

    fixture.connect();
    fixture.drain().await;

    // The divergent upstream wins; the local bytes land in the artifact.
    assert_eq!(fixture.read_upstream("/b"), b"ccccc");

    let artifact = fixture.cache_path("/tsumufs-conflicts/b");
    let text = std::fs::read_to_string(&artifact).expect("conflict artifact");
    assert!(text.contains("set.addChange(type_=\"patch\", start=0, end=5, data=b\"bbbbb\")"));
    assert!(text.contains("changesets = changesets + [set]"));

    // Local copy was dropped; the next read refetches the upstream truth.
    assert_eq!(fixture.fs.read(Path::new("/b"), 0, 5).await.unwrap(), b"ccccc");
}

#[tokio::test]
async fn new_then_unlink_coalesces_to_nothing() {
    let fixture = Fixture::disconnected().await;

    let call = root_call();
    fixture.fs.create(Path::new("/c"), 0o644, &call).await.expect("create");
    fixture.fs.write(Path::new("/c"), 0, b"x").await.expect("write");
    fixture.fs.unlink(Path::new("/c")).await.expect("unlink");

    assert!(fixture.ctx.sync_log.is_empty());

    fixture.connect();
    fixture.drain().await;
    assert!(!fixture.upstream_exists("/c"));
}

#[tokio::test]
async fn rename_retargets_the_unlink_trace() {
    let fixture = Fixture::disconnected().await;

    let call = root_call();
    fixture.fs.create(Path::new("/d"), 0o644, &call).await.expect("create");
    fixture.fs.write(Path::new("/d"), 0, b"y").await.expect("write");
    fixture.fs.rename(Path::new("/d"), Path::new("/e")).await.expect("rename");
    fixture.fs.unlink(Path::new("/e")).await.expect("unlink");

    assert!(fixture.ctx.sync_log.is_empty());

    fixture.connect();
    fixture.drain().await;
    assert!(!fixture.upstream_exists("/d"));
    assert!(!fixture.upstream_exists("/e"));
}

#[tokio::test]
async fn truncate_clips_queued_regions_and_records_length() {
    let fixture = Fixture::disconnected().await;
    let log = &fixture.ctx.sync_log;

    log.add_change(Path::new("/t"), 42, 0, 10, vec![b'x'; 10]).unwrap();
    log.add_change(Path::new("/t"), 42, 20, 30, vec![b'y'; 10]).unwrap();
    log.truncate_changes(Path::new("/t"), 15);

    let (_, changes) = log.snapshot();
    let change = &changes[&42];
    assert_eq!(change.regions().len(), 1);
    assert_eq!((change.regions()[0].start(), change.regions()[0].end()), (0, 10));
    assert_eq!(change.length(), Some(15));
}

#[tokio::test]
async fn permissions_survive_a_rename_through_the_overlay() {
    let fixture = Fixture::disconnected().await;

    let call = user_call(100, 200);
    fixture.fs.mkdir(Path::new("/f"), 0o750, &call).await.expect("mkdir");
    fixture.fs.rename(Path::new("/f"), Path::new("/g")).await.expect("rename");

    let stat = fixture.fs.getattr(Path::new("/g")).await.expect("getattr");
    assert_eq!(stat.mode & 0o7777, 0o750);
    assert_eq!(stat.uid, 100);
    assert_eq!(stat.gid, 200);
}
