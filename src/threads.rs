//! Chat thread lifecycle.
//!
//! One conversation per item: the first thread locks the item to that pair
//! of users, and opening it advances the item OPEN -> IN_PROGRESS. Closing
//! is a two-party handshake — each canonical participant slot carries an
//! independent confirmation flag, and the item reaches CLOSED only when
//! both are set.
//!
//! The flag update and the item status flip are separate commits. A crash
//! between them leaves a fully confirmed thread on a not-yet-closed item;
//! [`repair_thread`] detects and completes that transition, runs on every
//! thread view assembly, and [`repair_all`] sweeps the whole table for the
//! `reclaim repair` command.

use sqlx::{Row, SqlitePool};

use crate::error::{DomainError, Result};
use crate::items;
use crate::models::{canonical_pair, now_ms, ChatMessage, ChatThread, Item, ItemStatus, ThreadView};

pub async fn get_thread(pool: &SqlitePool, id: i64) -> Result<Option<ChatThread>> {
    let row = sqlx::query(
        "SELECT id, item_id, user_low_id, user_high_id, created_at, \
                last_message_at, last_message_text, close_low_confirmed, close_high_confirmed \
         FROM chat_threads WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| thread_from_row(&r)))
}

/// Open (or return) the conversation for an item between the requester and
/// a peer.
///
/// - `InvalidRequest` for a self-chat.
/// - `NotFound` when the item does not exist.
/// - `Forbidden` unless one side of the pair is the item's owner.
/// - `Conflict` when a different pair already holds the item's thread.
///
/// The participant pair is canonicalized to (min, max) before any lookup or
/// insert. Two racing calls for the same pair resolve to one surviving row:
/// the loser's INSERT hits the unique constraint and falls back to fetching
/// the winner's thread.
pub async fn create_or_get_thread(
    pool: &SqlitePool,
    requester_id: i64,
    item_id: i64,
    peer_id: i64,
) -> Result<ThreadView> {
    if peer_id == requester_id {
        return Err(DomainError::InvalidRequest(
            "cannot open a chat with yourself".into(),
        ));
    }

    let item = items::get_item(pool, item_id)
        .await?
        .ok_or_else(|| DomainError::NotFound(format!("item {}", item_id)))?;

    if requester_id != item.owner_id && peer_id != item.owner_id {
        return Err(DomainError::Forbidden(
            "a thread must include the item owner".into(),
        ));
    }

    let (lo, hi) = canonical_pair(requester_id, peer_id);

    if let Some(existing) = find_thread_by_pair(pool, item_id, lo, hi).await? {
        // Backfill: a thread can predate the status rule, or re-entry can
        // race the first creation. Advancing twice is a no-op.
        items::advance_status(pool, item_id, ItemStatus::InProgress).await?;
        return thread_view(pool, &existing, requester_id).await;
    }

    // Only one negotiation per item; a thread held by any other pair locks
    // third parties out. A thread that appeared since the pair lookup can
    // still be ours (a racing create for the same pair), so compare pairs
    // instead of bailing on mere existence.
    if let Some(taken) = find_thread_by_item(pool, item_id).await? {
        if taken.user_low_id == lo && taken.user_high_id == hi {
            items::advance_status(pool, item_id, ItemStatus::InProgress).await?;
            return thread_view(pool, &taken, requester_id).await;
        }
        return Err(DomainError::Conflict(format!(
            "item {} already has a chat",
            item_id
        )));
    }

    let created_at = now_ms();
    let inserted = sqlx::query(
        "INSERT INTO chat_threads (item_id, user_low_id, user_high_id, created_at) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(item_id)
    .bind(lo)
    .bind(hi)
    .bind(created_at)
    .execute(pool)
    .await;

    let thread = match inserted {
        Ok(result) => ChatThread {
            id: result.last_insert_rowid(),
            item_id,
            user_low_id: lo,
            user_high_id: hi,
            created_at,
            last_message_at: None,
            last_message_text: None,
            close_low_confirmed: false,
            close_high_confirmed: false,
        },
        Err(e) if is_unique_violation(&e) => {
            // Lost the creation race for the same pair; the winner's row is
            // the thread.
            find_thread_by_pair(pool, item_id, lo, hi)
                .await?
                .ok_or_else(|| DomainError::Conflict(format!("item {} already has a chat", item_id)))?
        }
        Err(e) => return Err(e.into()),
    };

    items::advance_status(pool, item_id, ItemStatus::InProgress).await?;

    thread_view(pool, &thread, requester_id).await
}

/// All threads the user participates in, ordered for the inbox: closed
/// items last, then most recent message first (threads without messages
/// after those with), then newest thread first.
pub async fn list_threads(pool: &SqlitePool, user_id: i64) -> Result<Vec<ThreadView>> {
    repair_all(pool).await?;

    let rows = sqlx::query(
        "SELECT t.id, t.item_id, t.user_low_id, t.user_high_id, t.created_at, \
                t.last_message_at, t.last_message_text, \
                t.close_low_confirmed, t.close_high_confirmed, \
                i.title AS item_title, i.status AS item_status, i.image_url AS item_image_url \
         FROM chat_threads t \
         JOIN items i ON i.id = t.item_id \
         WHERE t.user_low_id = ? OR t.user_high_id = ? \
         ORDER BY CASE WHEN i.status = 'CLOSED' THEN 1 ELSE 0 END ASC, \
                  t.last_message_at DESC NULLS LAST, \
                  t.created_at DESC",
    )
    .bind(user_id)
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    let mut views = Vec::with_capacity(rows.len());
    for row in &rows {
        let thread = thread_from_row(row);
        let status_str: String = row.get("item_status");
        let status = ItemStatus::parse(&status_str).ok_or_else(|| {
            DomainError::Internal(anyhow::anyhow!("unknown item status: {}", status_str))
        })?;
        views.push(ThreadView {
            id: thread.id,
            item_id: thread.item_id,
            peer_id: thread.peer_of(user_id),
            item_title: row.get("item_title"),
            item_status: status,
            item_image_url: row.get("item_image_url"),
            last_message_at: thread.last_message_at,
            last_message_text: thread.last_message_text,
        });
    }

    Ok(views)
}

/// Messages of a thread in chronological order, capped at `limit` (default
/// 50, at most 200). The caller must be a participant.
pub async fn list_messages(
    pool: &SqlitePool,
    user_id: i64,
    thread_id: i64,
    limit: Option<i64>,
) -> Result<Vec<ChatMessage>> {
    let thread = require_participant(pool, user_id, thread_id).await?;

    let limit = limit.unwrap_or(50).clamp(1, 200);
    fetch_messages_asc(pool, thread.id, limit).await
}

pub async fn fetch_messages_asc(
    pool: &SqlitePool,
    thread_id: i64,
    limit: i64,
) -> Result<Vec<ChatMessage>> {
    // Newest `limit`, replayed oldest-first.
    let rows = sqlx::query(
        "SELECT id, thread_id, sender_id, text, created_at, client_key \
         FROM chat_messages WHERE thread_id = ? \
         ORDER BY created_at DESC, id DESC LIMIT ?",
    )
    .bind(thread_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut messages: Vec<ChatMessage> = rows.iter().map(message_from_row).collect();
    messages.reverse();
    Ok(messages)
}

/// Record the caller's close confirmation.
///
/// The flag belongs to the canonical slot the caller occupies, so
/// re-confirming is a no-op. When both slots have confirmed, the item is
/// advanced to CLOSED in a separate commit.
pub async fn confirm_close(pool: &SqlitePool, user_id: i64, thread_id: i64) -> Result<ThreadView> {
    let thread = require_participant(pool, user_id, thread_id).await?;

    let column = if user_id == thread.user_low_id {
        "close_low_confirmed"
    } else {
        "close_high_confirmed"
    };
    sqlx::query(&format!(
        "UPDATE chat_threads SET {} = 1 WHERE id = ?",
        column
    ))
    .bind(thread_id)
    .execute(pool)
    .await?;

    let thread = get_thread(pool, thread_id)
        .await?
        .ok_or_else(|| DomainError::NotFound(format!("thread {}", thread_id)))?;

    if thread.both_confirmed() {
        if items::advance_status(pool, thread.item_id, ItemStatus::Closed).await? {
            tracing::info!(thread_id, item_id = thread.item_id, "item closed by handshake");
        }
    }

    thread_view(pool, &thread, user_id).await
}

/// Complete the close transition for one thread if both flags are set but
/// the item never reached CLOSED. Idempotent and cheap; safe on every read.
pub async fn repair_thread(pool: &SqlitePool, thread: &ChatThread) -> Result<bool> {
    if !thread.both_confirmed() {
        return Ok(false);
    }
    let repaired = items::advance_status(pool, thread.item_id, ItemStatus::Closed).await?;
    if repaired {
        tracing::warn!(
            thread_id = thread.id,
            item_id = thread.item_id,
            "repaired confirmed-but-not-closed item"
        );
    }
    Ok(repaired)
}

/// Sweep every fully confirmed thread and close its item if a previous
/// close never committed. Returns the number of repaired items.
pub async fn repair_all(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE items SET status = 'CLOSED' \
         WHERE status IN ('OPEN', 'IN_PROGRESS') \
           AND id IN (SELECT item_id FROM chat_threads \
                      WHERE close_low_confirmed = 1 AND close_high_confirmed = 1)",
    )
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Fetch a thread and check membership: `NotFound` when absent, `Forbidden`
/// when the caller is not one of the two participants.
pub async fn require_participant(
    pool: &SqlitePool,
    user_id: i64,
    thread_id: i64,
) -> Result<ChatThread> {
    let thread = get_thread(pool, thread_id)
        .await?
        .ok_or_else(|| DomainError::NotFound(format!("thread {}", thread_id)))?;

    if !thread.is_participant(user_id) {
        return Err(DomainError::Forbidden("not your thread".into()));
    }

    Ok(thread)
}

async fn find_thread_by_item(pool: &SqlitePool, item_id: i64) -> Result<Option<ChatThread>> {
    let row = sqlx::query(
        "SELECT id, item_id, user_low_id, user_high_id, created_at, \
                last_message_at, last_message_text, close_low_confirmed, close_high_confirmed \
         FROM chat_threads WHERE item_id = ? LIMIT 1",
    )
    .bind(item_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| thread_from_row(&r)))
}

async fn find_thread_by_pair(
    pool: &SqlitePool,
    item_id: i64,
    lo: i64,
    hi: i64,
) -> Result<Option<ChatThread>> {
    let row = sqlx::query(
        "SELECT id, item_id, user_low_id, user_high_id, created_at, \
                last_message_at, last_message_text, close_low_confirmed, close_high_confirmed \
         FROM chat_threads WHERE item_id = ? AND user_low_id = ? AND user_high_id = ?",
    )
    .bind(item_id)
    .bind(lo)
    .bind(hi)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| thread_from_row(&r)))
}

/// Assemble the per-requester view; runs the close repair check first so a
/// read never shows a fully confirmed thread on a still-open item.
async fn thread_view(
    pool: &SqlitePool,
    thread: &ChatThread,
    requester_id: i64,
) -> Result<ThreadView> {
    repair_thread(pool, thread).await?;

    let item: Item = items::get_item(pool, thread.item_id)
        .await?
        .ok_or_else(|| DomainError::NotFound(format!("item {}", thread.item_id)))?;

    Ok(ThreadView {
        id: thread.id,
        item_id: thread.item_id,
        peer_id: thread.peer_of(requester_id),
        item_title: item.title,
        item_status: item.status,
        item_image_url: item.image_url,
        last_message_at: thread.last_message_at,
        last_message_text: thread.last_message_text.clone(),
    })
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.message().contains("UNIQUE constraint failed"),
        _ => false,
    }
}

fn thread_from_row(row: &sqlx::sqlite::SqliteRow) -> ChatThread {
    ChatThread {
        id: row.get("id"),
        item_id: row.get("item_id"),
        user_low_id: row.get("user_low_id"),
        user_high_id: row.get("user_high_id"),
        created_at: row.get("created_at"),
        last_message_at: row.get("last_message_at"),
        last_message_text: row.get("last_message_text"),
        close_low_confirmed: row.get("close_low_confirmed"),
        close_high_confirmed: row.get("close_high_confirmed"),
    }
}

pub(crate) fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> ChatMessage {
    ChatMessage {
        id: row.get("id"),
        thread_id: row.get("thread_id"),
        sender_id: row.get("sender_id"),
        text: row.get("text"),
        created_at: row.get("created_at"),
        client_key: row.get("client_key"),
    }
}
