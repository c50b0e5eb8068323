use std::{
    fs,
    time::{Duration, SystemTime},
};

use pmocache::{CacheConfig, CacheError, FileCache};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Configuration de test simple
struct TestConfig;

impl CacheConfig for TestConfig {
    fn file_extension() -> &'static str {
        "mp3"
    }

    fn cache_type() -> &'static str {
        "test"
    }

    fn cache_name() -> &'static str {
        "testcache"
    }
}

type TestCache = FileCache<TestConfig>;

fn create_test_cache() -> (TempDir, TestCache) {
    let temp_dir = tempfile::tempdir().unwrap();
    let cache = TestCache::new(temp_dir.path()).unwrap();
    (temp_dir, cache)
}

/// Recule la date de modification d'un fichier
fn age_file(path: &std::path::Path, by: Duration) {
    let file = fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - by).unwrap();
}

async fn put(cache: &TestCache, name: &str, data: &[u8]) {
    let mut file = cache.write(name).await.unwrap();
    file.write_all(data).await.unwrap();
    file.flush().await.unwrap();
}

#[tokio::test]
async fn test_cache_root_is_segmented_by_name() {
    let (temp_dir, cache) = create_test_cache();
    let expected = fs::canonicalize(temp_dir.path()).unwrap().join("testcache");
    assert_eq!(cache.root(), expected);
    assert_eq!(cache.entry_name("episode-1"), "episode-1.mp3");
    assert_eq!(cache.cache_type(), "test");
}

#[tokio::test]
async fn test_write_then_read() {
    let (_temp_dir, cache) = create_test_cache();
    put(&cache, "shows/daily/ep1.mp3", b"frames").await;

    let mut data = Vec::new();
    cache
        .read("shows/daily/ep1.mp3")
        .await
        .unwrap()
        .read_to_end(&mut data)
        .await
        .unwrap();
    assert_eq!(data, b"frames");
    assert_eq!(cache.list().await.unwrap(), vec!["shows/daily/ep1.mp3"]);
}

#[tokio::test]
async fn test_read_missing_entry() {
    let (_temp_dir, cache) = create_test_cache();
    match cache.read("missing.mp3").await {
        Err(CacheError::NotFound(name)) => assert_eq!(name, "missing.mp3"),
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_staleness() {
    let (_temp_dir, cache) = create_test_cache();
    let hour = Duration::from_secs(3600);

    // absente : périmée
    assert!(cache.is_stale("ep.mp3", hour).await.unwrap());

    put(&cache, "ep.mp3", b"x").await;
    assert!(!cache.is_stale("ep.mp3", hour).await.unwrap());
    assert!(cache.open_if_fresh("ep.mp3", hour).await.unwrap().is_some());

    age_file(&cache.path("ep.mp3").await.unwrap(), 2 * hour);
    assert!(cache.is_stale("ep.mp3", hour).await.unwrap());
    assert!(cache.open_if_fresh("ep.mp3", hour).await.unwrap().is_none());

    // max_age nul : jamais périmée
    assert!(!cache.is_stale("ep.mp3", Duration::ZERO).await.unwrap());

    cache.poke("ep.mp3").await.unwrap();
    assert!(!cache.is_stale("ep.mp3", hour).await.unwrap());
}

#[tokio::test]
async fn test_poke_missing_entry() {
    let (_temp_dir, cache) = create_test_cache();
    assert!(matches!(
        cache.poke("nothing.mp3").await,
        Err(CacheError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_delete() {
    let (_temp_dir, cache) = create_test_cache();
    put(&cache, "ep.mp3", b"x").await;
    assert!(cache.delete("ep.mp3").await.unwrap());
    assert!(!cache.delete("ep.mp3").await.unwrap());
}

#[tokio::test]
async fn test_partial_write_is_invisible_until_commit() {
    let (_temp_dir, cache) = create_test_cache();
    let hour = Duration::from_secs(3600);
    put(&cache, "ep.mp3", b"old").await;

    let mut file = cache.write_partial("ep.mp3").await.unwrap().unwrap();
    file.write_all(b"new").await.unwrap();
    file.flush().await.unwrap();

    // une seule écriture à la fois
    assert!(cache.write_partial("ep.mp3").await.unwrap().is_none());

    // l'ancienne version reste servie
    let mut data = Vec::new();
    cache
        .open_if_fresh("ep.mp3", hour)
        .await
        .unwrap()
        .unwrap()
        .read_to_end(&mut data)
        .await
        .unwrap();
    assert_eq!(data, b"old");
    assert_eq!(cache.list().await.unwrap(), vec!["ep.mp3", "ep.mp3.part"]);

    drop(file);
    cache.commit("ep.mp3").await.unwrap();
    assert_eq!(cache.list().await.unwrap(), vec!["ep.mp3"]);

    let mut data = Vec::new();
    cache
        .read("ep.mp3")
        .await
        .unwrap()
        .read_to_end(&mut data)
        .await
        .unwrap();
    assert_eq!(data, b"new");

    // libre pour une nouvelle écriture
    assert!(cache.write_partial("ep.mp3").await.unwrap().is_some());
}

#[tokio::test]
async fn test_partial_write_abort() {
    let (_temp_dir, cache) = create_test_cache();
    let hour = Duration::from_secs(3600);

    let file = cache.write_partial("ep.mp3").await.unwrap().unwrap();
    assert!(cache.open_if_fresh("ep.mp3", hour).await.unwrap().is_none());
    drop(file);

    assert!(cache.abort("ep.mp3").await.unwrap());
    assert!(!cache.abort("ep.mp3").await.unwrap());
    assert!(cache.list().await.unwrap().is_empty());
    assert!(matches!(
        cache.commit("ep.mp3").await,
        Err(CacheError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_traversal_is_rejected() {
    let (temp_dir, cache) = create_test_cache();
    let outside = temp_dir.path().join("secret.mp3");
    fs::write(&outside, b"secret").unwrap();

    for name in ["../secret.mp3", "a/../../secret.mp3", outside.to_str().unwrap()] {
        assert!(
            matches!(cache.read(name).await, Err(CacheError::PathEscape(_))),
            "read({name}) must be rejected"
        );
        assert!(matches!(cache.write(name).await, Err(CacheError::PathEscape(_))));
        assert!(matches!(cache.delete(name).await, Err(CacheError::PathEscape(_))));
    }
    assert_eq!(fs::read(&outside).unwrap(), b"secret");

    // un `..` qui reste dans la racine est accepté
    put(&cache, "a/../inside.mp3", b"ok").await;
    assert!(cache.read("inside.mp3").await.is_ok());
}

#[cfg(unix)]
#[tokio::test]
async fn test_symlink_escape_is_rejected() {
    let (temp_dir, cache) = create_test_cache();
    let outside_dir = temp_dir.path().join("outside");
    fs::create_dir(&outside_dir).unwrap();
    fs::write(outside_dir.join("victim.mp3"), b"keep me").unwrap();

    std::os::unix::fs::symlink(&outside_dir, cache.root().join("link")).unwrap();
    std::os::unix::fs::symlink(outside_dir.join("victim.mp3"), cache.root().join("file.mp3"))
        .unwrap();
    std::os::unix::fs::symlink(outside_dir.join("ghost.mp3"), cache.root().join("dangling.mp3"))
        .unwrap();

    assert!(matches!(cache.read("link/victim.mp3").await, Err(CacheError::PathEscape(_))));
    assert!(matches!(cache.write("link/new.mp3").await, Err(CacheError::PathEscape(_))));
    assert!(matches!(cache.write("file.mp3").await, Err(CacheError::PathEscape(_))));
    assert!(matches!(cache.write("dangling.mp3").await, Err(CacheError::PathEscape(_))));

    assert_eq!(fs::read(outside_dir.join("victim.mp3")).unwrap(), b"keep me");
    assert!(!outside_dir.join("new.mp3").exists());
    assert!(!outside_dir.join("ghost.mp3").exists());
}

#[tokio::test]
async fn test_import_copy_and_move() {
    let (temp_dir, cache) = create_test_cache();
    let source = temp_dir.path().join("download.mp3");
    fs::write(&source, b"episode").unwrap();

    let name = cache.import(&source, false, false).await.unwrap();
    assert_eq!(name, "download.mp3");
    assert!(source.exists());

    fs::write(&source, b"episode v2").unwrap();
    let name = cache.import(&source, true, false).await.unwrap();
    assert_eq!(name, "download.mp3");
    assert!(!source.exists());

    let mut data = String::new();
    cache
        .read("download.mp3")
        .await
        .unwrap()
        .read_to_string(&mut data)
        .await
        .unwrap();
    assert_eq!(data, "episode v2");
}

#[tokio::test]
async fn test_import_avoids_conflicts() {
    let (temp_dir, cache) = create_test_cache();
    let source = temp_dir.path().join("show.mp3");

    let mut names = Vec::new();
    for i in 0..3 {
        fs::write(&source, format!("take {i}")).unwrap();
        names.push(cache.import(&source, false, true).await.unwrap());
    }
    assert_eq!(names, vec!["show.mp3", "show-1.mp3", "show-2.mp3"]);
    assert_eq!(
        fs::read_to_string(cache.path("show-2.mp3").await.unwrap()).unwrap(),
        "take 2"
    );
}

#[tokio::test]
async fn test_import_missing_source_leaves_no_entry() {
    let (temp_dir, cache) = create_test_cache();
    let missing = temp_dir.path().join("nope.mp3");
    assert!(cache.import(&missing, false, true).await.is_err());
    assert!(cache.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_clear_stale_and_purge() {
    let (_temp_dir, cache) = create_test_cache();
    let hour = Duration::from_secs(3600);

    for name in ["old1.mp3", "old2.mp3", "sub/old3.mp3", "fresh.mp3"] {
        put(&cache, name, b"x").await;
    }
    for name in ["old1.mp3", "old2.mp3", "sub/old3.mp3"] {
        age_file(&cache.path(name).await.unwrap(), 3 * hour);
    }

    assert_eq!(cache.clear_stale(Duration::ZERO).await.unwrap(), 0);
    assert_eq!(cache.clear_stale(hour).await.unwrap(), 3);
    assert_eq!(cache.list().await.unwrap(), vec!["fresh.mp3"]);

    put(&cache, "other.mp3", b"y").await;
    assert_eq!(cache.purge().await.unwrap(), 2);
    assert!(cache.list().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_task() {
    let (_temp_dir, cache) = create_test_cache();
    let cache = std::sync::Arc::new(cache);
    put(&cache, "old.mp3", b"x").await;
    age_file(&cache.path("old.mp3").await.unwrap(), Duration::from_secs(7200));

    let token = tokio_util::sync::CancellationToken::new();
    let task = pmocache::spawn_cleanup_task(
        cache.clone(),
        Duration::from_secs(60),
        Duration::from_secs(3600),
        token.clone(),
    );

    // le premier tick est immédiat
    tokio::time::sleep(Duration::from_secs(1)).await;
    token.cancel();
    task.await.unwrap();
    assert!(cache.list().await.unwrap().is_empty());
}
