//! Integration tests for the ranking engine against a real database:
//! owner exclusion, deterministic ordering, threshold filtering, and the
//! duplicate search.

use reclaim::config::Config;
use reclaim::db;
use reclaim::error::DomainError;
use reclaim::items;
use reclaim::migrate;
use reclaim::similarity;
use sqlx::SqlitePool;
use tempfile::TempDir;

// ─── Helpers ────────────────────────────────────────────────────────

fn test_config(tmp: &TempDir) -> Config {
    let db_path = tmp.path().join("reclaim.sqlite");
    let content = format!(
        r#"
[db]
path = "{}"

[server]
bind = "127.0.0.1:0"

[auth]
secret = "test-secret"
"#,
        db_path.display()
    );
    toml::from_str(&content).unwrap()
}

async fn setup() -> (TempDir, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    migrate::run_migrations(&cfg).await.unwrap();
    let pool = db::connect(&cfg).await.unwrap();
    (tmp, pool)
}

async fn seed_users(pool: &SqlitePool) -> (i64, i64) {
    let alice = items::create_user(pool, "alice").await.unwrap();
    let bob = items::create_user(pool, "bob").await.unwrap();
    (alice.id, bob.id)
}

async fn embedded_item(pool: &SqlitePool, owner: i64, title: &str, vec: &[f32]) -> i64 {
    items::create_item(pool, owner, title, None, Some(vec))
        .await
        .unwrap()
        .id
}

// ─── Image search ───────────────────────────────────────────────────

/// The requester's own items never appear, no matter how well they match.
#[tokio::test]
async fn test_search_excludes_the_requesters_items() {
    let (_tmp, pool) = setup().await;
    let (alice, bob) = seed_users(&pool).await;

    let query = [1.0, 0.0];
    embedded_item(&pool, alice, "alice exact match", &query).await;
    let bob_item = embedded_item(&pool, bob, "bob partial match", &[0.6, 0.8]).await;

    let matches = similarity::find_similar_by_image(&pool, alice, &query, 10, 0.0)
        .await
        .unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].item_id, bob_item);
    assert_eq!(matches[0].owner_id, bob);
}

/// Results come back score-descending; equal scores break ties by item id
/// ascending, so the ranking is deterministic.
#[tokio::test]
async fn test_search_orders_by_score_then_id() {
    let (_tmp, pool) = setup().await;
    let (alice, bob) = seed_users(&pool).await;

    let close = embedded_item(&pool, bob, "close", &[0.9, 0.1]).await;
    let exact_a = embedded_item(&pool, bob, "exact a", &[1.0, 0.0]).await;
    let exact_b = embedded_item(&pool, bob, "exact b", &[2.0, 0.0]).await;

    let matches = similarity::find_similar_by_image(&pool, alice, &[1.0, 0.0], 10, 0.0)
        .await
        .unwrap();
    let ids: Vec<i64> = matches.iter().map(|m| m.item_id).collect();
    // Both "exact" vectors score 1.0; the lower id wins the tie.
    assert_eq!(ids, vec![exact_a, exact_b, close]);
    assert!((matches[0].score - 1.0).abs() < 1e-6);
    assert!(matches[2].score < 1.0);
}

/// `min_similarity` drops everything strictly below it; orthogonal and
/// opposite vectors score 0 after clamping.
#[tokio::test]
async fn test_search_filters_below_threshold() {
    let (_tmp, pool) = setup().await;
    let (alice, bob) = seed_users(&pool).await;

    let strong = embedded_item(&pool, bob, "strong", &[1.0, 0.0]).await;
    embedded_item(&pool, bob, "weak", &[0.5, 0.866]).await;
    embedded_item(&pool, bob, "orthogonal", &[0.0, 1.0]).await;
    embedded_item(&pool, bob, "opposite", &[-1.0, 0.0]).await;

    let matches = similarity::find_similar_by_image(&pool, alice, &[1.0, 0.0], 10, 0.9)
        .await
        .unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].item_id, strong);

    // At a zero floor, clamped-to-zero scores still qualify.
    let all = similarity::find_similar_by_image(&pool, alice, &[1.0, 0.0], 10, 0.0)
        .await
        .unwrap();
    assert_eq!(all.len(), 4);
    assert_eq!(all[2].score, 0.0);
    assert_eq!(all[3].score, 0.0);
}

#[tokio::test]
async fn test_search_truncates_to_top_k() {
    let (_tmp, pool) = setup().await;
    let (alice, bob) = seed_users(&pool).await;

    for i in 0..5 {
        embedded_item(&pool, bob, &format!("item {}", i), &[1.0, i as f32 * 0.1]).await;
    }

    let matches = similarity::find_similar_by_image(&pool, alice, &[1.0, 0.0], 2, 0.0)
        .await
        .unwrap();
    assert_eq!(matches.len(), 2);
}

/// Items stored without an embedding are invisible to the scan.
#[tokio::test]
async fn test_search_skips_items_without_embeddings() {
    let (_tmp, pool) = setup().await;
    let (alice, bob) = seed_users(&pool).await;

    items::create_item(&pool, bob, "no photo", None, None)
        .await
        .unwrap();
    let embedded = embedded_item(&pool, bob, "with photo", &[1.0, 0.0]).await;

    let matches = similarity::find_similar_by_image(&pool, alice, &[1.0, 0.0], 10, 0.0)
        .await
        .unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].item_id, embedded);
}

// ─── Duplicate search ───────────────────────────────────────────────

/// The duplicate search ranks against the base item's stored vector and
/// excludes both the base item and the requester's own listings.
#[tokio::test]
async fn test_duplicates_exclude_base_and_own_items() {
    let (_tmp, pool) = setup().await;
    let (alice, bob) = seed_users(&pool).await;

    let base = embedded_item(&pool, bob, "base listing", &[1.0, 0.0]).await;
    let dup = embedded_item(&pool, bob, "same wallet again", &[0.99, 0.01]).await;
    // Alice asking about Bob's item must not see her own listings.
    embedded_item(&pool, alice, "alice copy", &[1.0, 0.0]).await;

    let matches = similarity::find_duplicates(&pool, alice, base, 10, 0.5)
        .await
        .unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].item_id, dup);
}

#[tokio::test]
async fn test_duplicates_require_an_embedded_base() {
    let (_tmp, pool) = setup().await;
    let (alice, bob) = seed_users(&pool).await;

    let bare = items::create_item(&pool, bob, "no photo", None, None)
        .await
        .unwrap();

    let err = similarity::find_duplicates(&pool, alice, bare.id, 10, 0.5)
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::NotFound(_)));

    let err = similarity::find_duplicates(&pool, alice, 9999, 10, 0.5)
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::NotFound(_)));
}

/// Backfilling an embedding makes a previously invisible item rankable.
#[tokio::test]
async fn test_set_embedding_backfill() {
    let (_tmp, pool) = setup().await;
    let (alice, bob) = seed_users(&pool).await;

    let item = items::create_item(&pool, bob, "late photo", None, None)
        .await
        .unwrap();
    items::set_embedding(&pool, item.id, &[1.0, 0.0]).await.unwrap();

    let matches = similarity::find_similar_by_image(&pool, alice, &[1.0, 0.0], 10, 0.9)
        .await
        .unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].item_id, item.id);
}
