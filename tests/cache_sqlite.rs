use quill_harness::cache::{CachedResponse, JudgmentCacheKey, SqliteJudgmentCache};
use quill_harness::JudgmentCache;
use tempfile::tempdir;

#[derive(Debug, serde::Deserialize)]
struct ExportRow {
    key_hash: String,
    model: String,
    template_slug: String,
    raw: String,
    hit_count: i64,
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

fn key(subject_text: &str) -> JudgmentCacheKey {
    JudgmentCacheKey::new(
        "openai/gpt-4o-mini",
        "judge_v1",
        "template_hash",
        "rubric_hash",
        subject_text,
    )
}

fn read_export(path: &std::path::Path) -> Vec<ExportRow> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn sqlite_cache_put_get_and_export_increments_hit_count() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteJudgmentCache::new(&db_path).unwrap();

    let key = key("A short launch post.");
    let value = CachedResponse {
        raw: r#"{"scores": [], "overall": 70}"#.to_string(),
        input_tokens: Some(10),
        output_tokens: Some(5),
    };

    assert!(cache.get(&key).await.unwrap().is_none());
    cache.put(&key, &value).await.unwrap();

    let hit1 = cache.get(&key).await.unwrap().unwrap();
    assert_eq!(hit1, value);
    let _ = cache.get(&key).await.unwrap().unwrap();

    let export_path = dir.path().join("export.jsonl");
    let written = cache.export_jsonl(&export_path).await.unwrap();
    assert_eq!(written, 1);

    let row = read_export(&export_path)
        .into_iter()
        .find(|r| r.key_hash == key.key_hash)
        .unwrap();
    assert_eq!(row.hit_count, 2);
    assert_eq!(row.model, "openai/gpt-4o-mini");
    assert_eq!(row.template_slug, "judge_v1");
    assert_eq!(row.raw, value.raw);
    assert_eq!(row.input_tokens, Some(10));
    assert_eq!(row.output_tokens, Some(5));
}

#[tokio::test]
async fn sqlite_cache_put_overwrites_existing_entry() {
    let dir = tempdir().unwrap();
    let cache = SqliteJudgmentCache::new(dir.path().join("cache.sqlite")).unwrap();
    let key = key("text");

    let first = CachedResponse {
        raw: "first".into(),
        input_tokens: None,
        output_tokens: None,
    };
    let second = CachedResponse {
        raw: "second".into(),
        input_tokens: Some(1),
        output_tokens: Some(2),
    };
    cache.put(&key, &first).await.unwrap();
    cache.put(&key, &second).await.unwrap();

    assert_eq!(cache.get(&key).await.unwrap(), Some(second));
}

#[tokio::test]
async fn sqlite_cache_prune_max_rows_keeps_most_recent() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteJudgmentCache::new(&db_path).unwrap();

    let old_key = key("older draft");
    let new_key = key("newer draft");
    let value = CachedResponse {
        raw: "{}".into(),
        input_tokens: None,
        output_tokens: None,
    };

    cache.put(&old_key, &value).await.unwrap();
    cache.put(&new_key, &value).await.unwrap();

    // Make the "old" row deterministically older so prune ordering is stable.
    let conn = rusqlite::Connection::open(&db_path).unwrap();
    conn.execute(
        "UPDATE judgment_cache SET updated_at = 0 WHERE key_hash = ?1",
        rusqlite::params![old_key.key_hash],
    )
    .unwrap();

    let stats = cache.prune(None, Some(1)).await.unwrap();
    assert_eq!(stats.remaining, 1);
    assert_eq!(stats.deleted, 1);

    let export_path = dir.path().join("export.jsonl");
    cache.export_jsonl(&export_path).await.unwrap();
    let rows = read_export(&export_path);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key_hash, new_key.key_hash);
}

#[tokio::test]
async fn sqlite_cache_prune_by_age_drops_idle_rows() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteJudgmentCache::new(&db_path).unwrap();

    let stale = key("stale");
    let fresh = key("fresh");
    let value = CachedResponse {
        raw: "{}".into(),
        input_tokens: None,
        output_tokens: None,
    };
    cache.put(&stale, &value).await.unwrap();
    cache.put(&fresh, &value).await.unwrap();

    let conn = rusqlite::Connection::open(&db_path).unwrap();
    conn.execute(
        "UPDATE judgment_cache SET updated_at = 0 WHERE key_hash = ?1",
        rusqlite::params![stale.key_hash],
    )
    .unwrap();

    let stats = cache.prune(Some(30), None).await.unwrap();
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.remaining, 1);
    assert!(cache.get(&stale).await.unwrap().is_none());
    assert!(cache.get(&fresh).await.unwrap().is_some());
}

#[test]
fn sqlite_cache_lock_does_not_truncate_lockfile() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteJudgmentCache::new(&db_path).unwrap();

    let mut lock_path = db_path.clone();
    lock_path.set_extension("lock");
    std::fs::write(&lock_path, "keep").unwrap();

    let lock = cache.lock_exclusive().unwrap();
    drop(lock);

    let contents = std::fs::read_to_string(&lock_path).unwrap();
    assert_eq!(contents, "keep");
}
