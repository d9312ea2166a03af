//! Item and user records.
//!
//! This module is the store the ranking engine scans and the thread
//! lifecycle mutates: single-record fetch, filtered scan over items holding
//! an embedding, and the monotonic status transition. Status never moves
//! backward; `advance_status` expresses the legal transitions as guarded
//! UPDATEs so an illegal or repeated transition is a no-op at the storage
//! layer rather than a race.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::models::{now_ms, Item, ItemStatus, User};

pub async fn create_user(pool: &SqlitePool, name: &str) -> Result<User> {
    let created_at = now_ms();
    let id = sqlx::query("INSERT INTO users (name, created_at) VALUES (?, ?)")
        .bind(name)
        .bind(created_at)
        .execute(pool)
        .await?
        .last_insert_rowid();

    Ok(User {
        id,
        name: name.to_string(),
        created_at,
    })
}

pub async fn get_user(pool: &SqlitePool, id: i64) -> Result<Option<User>> {
    let row = sqlx::query("SELECT id, name, created_at FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|r| User {
        id: r.get("id"),
        name: r.get("name"),
        created_at: r.get("created_at"),
    }))
}

pub async fn create_item(
    pool: &SqlitePool,
    owner_id: i64,
    title: &str,
    image_url: Option<&str>,
    embedding: Option<&[f32]>,
) -> Result<Item> {
    let created_at = now_ms();
    let blob = embedding.map(vec_to_blob);

    let id = sqlx::query(
        "INSERT INTO items (owner_id, title, status, image_url, embedding, created_at) \
         VALUES (?, ?, 'OPEN', ?, ?, ?)",
    )
    .bind(owner_id)
    .bind(title)
    .bind(image_url)
    .bind(blob)
    .bind(created_at)
    .execute(pool)
    .await?
    .last_insert_rowid();

    Ok(Item {
        id,
        owner_id,
        title: title.to_string(),
        status: ItemStatus::Open,
        image_url: image_url.map(str::to_string),
        embedding: embedding.map(|v| v.to_vec()),
        created_at,
    })
}

pub async fn get_item(pool: &SqlitePool, id: i64) -> Result<Option<Item>> {
    let row = sqlx::query(
        "SELECT id, owner_id, title, status, image_url, embedding, created_at \
         FROM items WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(|r| item_from_row(&r)).transpose()
}

/// Store or replace an item's embedding vector.
pub async fn set_embedding(pool: &SqlitePool, item_id: i64, embedding: &[f32]) -> Result<()> {
    sqlx::query("UPDATE items SET embedding = ? WHERE id = ?")
        .bind(vec_to_blob(embedding))
        .bind(item_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// All items that hold an embedding, excluding those owned by `exclude_owner`.
/// This is the candidate set for similarity ranking.
pub async fn scan_embedded(pool: &SqlitePool, exclude_owner: i64) -> Result<Vec<Item>> {
    let rows = sqlx::query(
        "SELECT id, owner_id, title, status, image_url, embedding, created_at \
         FROM items WHERE embedding IS NOT NULL AND owner_id != ?",
    )
    .bind(exclude_owner)
    .fetch_all(pool)
    .await?;

    rows.iter().map(item_from_row).collect()
}

/// Advance an item's status along OPEN -> IN_PROGRESS -> CLOSED.
///
/// Returns `true` if the row changed. A call that would move the status
/// backward, or re-apply the current status, matches no row and returns
/// `false` — callers treat that as the idempotent success it is.
pub async fn advance_status(pool: &SqlitePool, item_id: i64, to: ItemStatus) -> Result<bool> {
    let result = match to {
        // Nothing transitions back to OPEN.
        ItemStatus::Open => return Ok(false),
        ItemStatus::InProgress => {
            sqlx::query("UPDATE items SET status = 'IN_PROGRESS' WHERE id = ? AND status = 'OPEN'")
                .bind(item_id)
                .execute(pool)
                .await?
        }
        ItemStatus::Closed => {
            sqlx::query(
                "UPDATE items SET status = 'CLOSED' WHERE id = ? \
                 AND status IN ('OPEN', 'IN_PROGRESS')",
            )
            .bind(item_id)
            .execute(pool)
            .await?
        }
    };

    Ok(result.rows_affected() > 0)
}

pub(crate) fn item_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Item> {
    let status_str: String = row.get("status");
    let status = ItemStatus::parse(&status_str)
        .ok_or_else(|| anyhow::anyhow!("unknown item status in database: {}", status_str))?;
    let blob: Option<Vec<u8>> = row.get("embedding");

    Ok(Item {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        title: row.get("title"),
        status,
        image_url: row.get("image_url"),
        embedding: blob.map(|b| blob_to_vec(&b)),
        created_at: row.get("created_at"),
    })
}
