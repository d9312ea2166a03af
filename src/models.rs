//! Core data models for the lost-and-found chat and matching engine.
//!
//! Timestamps are stored as unix milliseconds (`i64`) so that messages sent
//! in quick succession still sort correctly; ordering ties are broken by the
//! autoincrement row id, which reflects commit order.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a posted item. Transitions are one-directional:
/// OPEN -> IN_PROGRESS -> CLOSED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemStatus {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "IN_PROGRESS")]
    InProgress,
    #[serde(rename = "CLOSED")]
    Closed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Open => "OPEN",
            ItemStatus::InProgress => "IN_PROGRESS",
            ItemStatus::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<ItemStatus> {
        match s {
            "OPEN" => Some(ItemStatus::Open),
            "IN_PROGRESS" => Some(ItemStatus::InProgress),
            "CLOSED" => Some(ItemStatus::Closed),
            _ => None,
        }
    }

    /// Rank in the one-directional lifecycle; a transition is legal only if
    /// it strictly increases the rank.
    pub fn rank(&self) -> u8 {
        match self {
            ItemStatus::Open => 0,
            ItemStatus::InProgress => 1,
            ItemStatus::Closed => 2,
        }
    }
}

/// A registered user. Immutable for the purposes of this core.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub created_at: i64,
}

/// A lost/found post. The embedding, when present, is an L2-normalized
/// vector produced by the external embedding service.
#[derive(Debug, Clone, Serialize)]
pub struct Item {
    pub id: i64,
    pub owner_id: i64,
    pub title: String,
    pub status: ItemStatus,
    pub image_url: Option<String>,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    pub created_at: i64,
}

/// A conversation bound to exactly one item and one unordered pair of users.
/// The pair is stored canonically as (low id, high id).
#[derive(Debug, Clone)]
pub struct ChatThread {
    pub id: i64,
    pub item_id: i64,
    pub user_low_id: i64,
    pub user_high_id: i64,
    pub created_at: i64,
    pub last_message_at: Option<i64>,
    pub last_message_text: Option<String>,
    pub close_low_confirmed: bool,
    pub close_high_confirmed: bool,
}

impl ChatThread {
    pub fn is_participant(&self, user_id: i64) -> bool {
        user_id == self.user_low_id || user_id == self.user_high_id
    }

    /// The other side of the conversation, relative to `user_id`.
    pub fn peer_of(&self, user_id: i64) -> i64 {
        if self.user_low_id == user_id {
            self.user_high_id
        } else {
            self.user_low_id
        }
    }

    pub fn both_confirmed(&self) -> bool {
        self.close_low_confirmed && self.close_high_confirmed
    }
}

/// An immutable chat message. `client_key` is the client-supplied
/// idempotency key used to absorb retried sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub thread_id: i64,
    pub sender_id: i64,
    pub text: String,
    pub created_at: i64,
    pub client_key: Option<String>,
}

/// Thread as presented to one participant: the peer id is always the *other*
/// user, and the current item fields are denormalized in for display.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadView {
    pub id: i64,
    pub item_id: i64,
    pub peer_id: i64,
    pub item_title: String,
    pub item_status: ItemStatus,
    pub item_image_url: Option<String>,
    pub last_message_at: Option<i64>,
    pub last_message_text: Option<String>,
}

/// An item paired with its similarity score against a query vector.
/// Ephemeral; never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SimilarityMatch {
    pub item_id: i64,
    pub owner_id: i64,
    pub title: String,
    pub status: ItemStatus,
    pub image_url: Option<String>,
    pub score: f64,
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Canonical participant pair: (min, max). Every thread lookup and insert
/// goes through this so raw (requester, peer) order is never stored.
pub fn canonical_pair(a: i64, b: i64) -> (i64, i64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_pair_orders() {
        assert_eq!(canonical_pair(5, 2), (2, 5));
        assert_eq!(canonical_pair(2, 5), (2, 5));
        assert_eq!(canonical_pair(7, 7), (7, 7));
    }

    #[test]
    fn test_status_rank_monotonic() {
        assert!(ItemStatus::Open.rank() < ItemStatus::InProgress.rank());
        assert!(ItemStatus::InProgress.rank() < ItemStatus::Closed.rank());
    }

    #[test]
    fn test_status_parse_roundtrip() {
        for s in [ItemStatus::Open, ItemStatus::InProgress, ItemStatus::Closed] {
            assert_eq!(ItemStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(ItemStatus::parse("ARCHIVED"), None);
    }

    #[test]
    fn test_thread_peer_of() {
        let t = ChatThread {
            id: 1,
            item_id: 1,
            user_low_id: 2,
            user_high_id: 9,
            created_at: 0,
            last_message_at: None,
            last_message_text: None,
            close_low_confirmed: false,
            close_high_confirmed: false,
        };
        assert_eq!(t.peer_of(2), 9);
        assert_eq!(t.peer_of(9), 2);
        assert!(t.is_participant(2));
        assert!(!t.is_participant(3));
    }
}
