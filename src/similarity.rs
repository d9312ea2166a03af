//! Similarity ranking engine.
//!
//! Ranks stored items against a query vector (or another item's vector) by
//! cosine similarity. The requester's own items never appear in results, and
//! the duplicate search additionally excludes the base item itself. Scores
//! are clamped to [0, 1]; ordering is score descending with item id
//! ascending as the tiebreak, so equal scores rank deterministically.

use sqlx::SqlitePool;

use crate::embedding::cosine_similarity;
use crate::error::{DomainError, Result};
use crate::items;
use crate::models::{Item, SimilarityMatch};

/// Rank `candidates` against `query`, returning at most `top_k` matches with
/// score >= `min_similarity`. Candidates without an embedding score 0 and
/// are dropped by any positive threshold.
fn rank(
    candidates: Vec<Item>,
    query: &[f32],
    top_k: usize,
    min_similarity: f64,
) -> Vec<SimilarityMatch> {
    let mut matches: Vec<SimilarityMatch> = candidates
        .into_iter()
        .filter_map(|item| {
            let embedding = item.embedding.as_deref()?;
            let score = f64::from(cosine_similarity(query, embedding)).clamp(0.0, 1.0);
            if score < min_similarity {
                return None;
            }
            Some(SimilarityMatch {
                item_id: item.id,
                owner_id: item.owner_id,
                title: item.title,
                status: item.status,
                image_url: item.image_url,
                score,
            })
        })
        .collect();

    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.item_id.cmp(&b.item_id))
    });
    matches.truncate(top_k);

    matches
}

/// Find items similar to a query vector, excluding the requester's own.
pub async fn find_similar_by_image(
    pool: &SqlitePool,
    requester_id: i64,
    query: &[f32],
    top_k: usize,
    min_similarity: f64,
) -> Result<Vec<SimilarityMatch>> {
    let candidates = items::scan_embedded(pool, requester_id).await?;
    Ok(rank(candidates, query, top_k, min_similarity))
}

/// Find likely duplicates of an existing item.
///
/// Fails with `NotFound` when the base item is missing or has no stored
/// embedding. Excludes the base item and the requester's own items.
pub async fn find_duplicates(
    pool: &SqlitePool,
    requester_id: i64,
    item_id: i64,
    top_k: usize,
    min_similarity: f64,
) -> Result<Vec<SimilarityMatch>> {
    let base = items::get_item(pool, item_id)
        .await?
        .ok_or_else(|| DomainError::NotFound(format!("item {}", item_id)))?;

    let query = base
        .embedding
        .ok_or_else(|| DomainError::NotFound(format!("item {} has no embedding", item_id)))?;

    let candidates: Vec<Item> = items::scan_embedded(pool, requester_id)
        .await?
        .into_iter()
        .filter(|item| item.id != item_id)
        .collect();

    Ok(rank(candidates, &query, top_k, min_similarity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ItemStatus;

    fn make_item(id: i64, owner_id: i64, embedding: Option<Vec<f32>>) -> Item {
        Item {
            id,
            owner_id,
            title: format!("item-{}", id),
            status: ItemStatus::Open,
            image_url: None,
            embedding,
            created_at: 0,
        }
    }

    #[test]
    fn test_rank_orders_by_score_desc() {
        let query = vec![1.0, 0.0];
        let candidates = vec![
            make_item(1, 10, Some(vec![0.5, 0.5])),  // ~0.707
            make_item(2, 10, Some(vec![1.0, 0.0])),  // 1.0
            make_item(3, 10, Some(vec![0.9, 0.1])),  // ~0.994
        ];
        let matches = rank(candidates, &query, 10, 0.0);
        let ids: Vec<i64> = matches.iter().map(|m| m.item_id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn test_rank_tiebreak_by_id_asc() {
        let query = vec![1.0, 0.0];
        let candidates = vec![
            make_item(9, 10, Some(vec![2.0, 0.0])),
            make_item(3, 10, Some(vec![1.0, 0.0])),
            make_item(6, 10, Some(vec![5.0, 0.0])),
        ];
        // All score exactly 1.0; order must be deterministic by id.
        let matches = rank(candidates, &query, 10, 0.0);
        let ids: Vec<i64> = matches.iter().map(|m| m.item_id).collect();
        assert_eq!(ids, vec![3, 6, 9]);
    }

    #[test]
    fn test_rank_threshold_filters() {
        let query = vec![1.0, 0.0];
        let candidates = vec![
            make_item(1, 10, Some(vec![1.0, 0.0])),   // 1.0
            make_item(2, 10, Some(vec![0.0, 1.0])),   // 0.0
            make_item(3, 10, Some(vec![-1.0, 0.0])),  // -1.0 clamped to 0.0
        ];
        let matches = rank(candidates, &query, 10, 0.5);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].item_id, 1);
    }

    #[test]
    fn test_rank_negative_scores_clamped() {
        let query = vec![1.0, 0.0];
        let candidates = vec![make_item(1, 10, Some(vec![-1.0, 0.0]))];
        let matches = rank(candidates, &query, 10, 0.0);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].score, 0.0);
    }

    #[test]
    fn test_rank_truncates_to_top_k() {
        let query = vec![1.0, 0.0];
        let candidates = (1..=8)
            .map(|i| make_item(i, 10, Some(vec![1.0, i as f32 * 0.1])))
            .collect();
        let matches = rank(candidates, &query, 3, 0.0);
        assert_eq!(matches.len(), 3);
    }

    #[test]
    fn test_rank_missing_embedding_never_matches() {
        let query = vec![1.0, 0.0];
        let candidates = vec![
            make_item(1, 10, None),
            make_item(2, 10, Some(vec![])),
        ];
        let matches = rank(candidates, &query, 10, 0.0);
        // No embedding is skipped outright; an empty one scores 0 but survives
        // a zero threshold.
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].item_id, 2);
        assert_eq!(matches[0].score, 0.0);

        let matches = rank(vec![make_item(2, 10, Some(vec![]))], &query, 10, 0.01);
        assert!(matches.is_empty());
    }
}
