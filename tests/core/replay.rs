use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::common::{root_call, Fixture};

#[tokio::test]
async fn drain_is_idempotent_once_the_queue_is_empty() {
    let fixture = Fixture::connected().await;
    fixture.disconnect();

    let call = root_call();
    fixture.fs.create(Path::new("/idem"), 0o644, &call).await.unwrap();
    fixture.fs.write(Path::new("/idem"), 0, b"stable").await.unwrap();

    fixture.connect();
    fixture.drain().await;
    assert!(fixture.ctx.sync_log.is_empty());
    let first = fixture.read_upstream("/idem");

    fixture.drain().await;
    assert!(fixture.ctx.sync_log.is_empty());
    assert_eq!(fixture.read_upstream("/idem"), first);
}

#[tokio::test]
async fn new_colliding_with_an_upstream_file_routes_to_conflict() {
    let fixture = Fixture::disconnected().await;

    let call = root_call();
    fixture.fs.create(Path::new("/x"), 0o644, &call).await.unwrap();
    fixture.fs.write(Path::new("/x"), 0, b"local").await.unwrap();

    // The same name appears upstream while we are disconnected.
    fixture.write_upstream("/x", b"remote");

    fixture.connect();
    fixture.drain().await;

    assert_eq!(fixture.read_upstream("/x"), b"remote");
    let artifact = fixture.cache_path("/tsumufs-conflicts/x");
    let text = std::fs::read_to_string(artifact).expect("conflict artifact");
    assert!(text.contains("data=b\"local\""));
    assert!(!fixture.cache_exists("/x"));
}

#[tokio::test]
async fn unlink_replay_tolerates_an_already_missing_upstream() {
    let fixture = Fixture::connected().await;
    fixture.write_upstream("/gone", b"data");
    fixture.fs.read(Path::new("/gone"), 0, 4).await.unwrap();

    fixture.disconnect();
    fixture.fs.unlink(Path::new("/gone")).await.unwrap();
    std::fs::remove_file(fixture.upstream_path("/gone")).unwrap();

    fixture.connect();
    fixture.drain().await;
    assert!(fixture.ctx.sync_log.is_empty());
    assert!(!fixture.upstream_exists("/gone"));
}

#[tokio::test]
async fn queued_chmod_reaches_the_upstream() {
    let fixture = Fixture::connected().await;
    fixture.write_upstream("/m", b"data");
    fixture.fs.read(Path::new("/m"), 0, 4).await.unwrap();

    fixture.disconnect();
    fixture.fs.chmod(Path::new("/m"), 0o600, &root_call()).await.unwrap();

    fixture.connect();
    fixture.drain().await;

    let mode = std::fs::metadata(fixture.upstream_path("/m"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o7777, 0o600);
    assert_eq!(fixture.read_upstream("/m"), b"data");
}

#[tokio::test]
async fn queued_shrink_truncates_the_upstream() {
    let fixture = Fixture::connected().await;
    fixture.write_upstream("/s", b"abcdef");
    fixture.fs.read(Path::new("/s"), 0, 6).await.unwrap();

    fixture.disconnect();
    fixture.fs.truncate(Path::new("/s"), 3).await.unwrap();

    fixture.connect();
    fixture.drain().await;
    assert_eq!(fixture.read_upstream("/s"), b"abc");
}

#[tokio::test]
async fn write_past_eof_extends_with_a_zero_padded_preimage() {
    let fixture = Fixture::connected().await;
    fixture.write_upstream("/p", b"ab");
    fixture.fs.read(Path::new("/p"), 0, 2).await.unwrap();

    fixture.disconnect();
    fixture.fs.write(Path::new("/p"), 4, b"zz").await.unwrap();

    // The queued pre-image for the extension is all zeroes.
    let (_, changes) = fixture.ctx.sync_log.snapshot();
    let change = changes.values().next().expect("queued change");
    assert_eq!(change.regions().len(), 1);
    assert_eq!(change.regions()[0].bytes(), &[0, 0]);

    fixture.connect();
    fixture.drain().await;
    assert_eq!(fixture.read_upstream("/p"), b"ab\0\0zz");
}

#[tokio::test]
async fn replayed_symlink_appears_upstream() {
    let fixture = Fixture::disconnected().await;

    let call = root_call();
    fixture
        .fs
        .symlink(Path::new("/target/elsewhere"), Path::new("/l"), &call)
        .await
        .unwrap();

    fixture.connect();
    fixture.drain().await;

    let target = std::fs::read_link(fixture.upstream_path("/l")).unwrap();
    assert_eq!(target, Path::new("/target/elsewhere"));
}

#[tokio::test]
async fn queued_rename_moves_the_upstream_file() {
    let fixture = Fixture::connected().await;
    fixture.write_upstream("/old", b"payload");
    fixture.fs.read(Path::new("/old"), 0, 7).await.unwrap();

    fixture.disconnect();
    fixture.fs.rename(Path::new("/old"), Path::new("/new")).await.unwrap();

    fixture.connect();
    fixture.drain().await;

    assert!(!fixture.upstream_exists("/old"));
    assert_eq!(fixture.read_upstream("/new"), b"payload");
}
