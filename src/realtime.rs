//! Realtime session and room router.
//!
//! Each WebSocket connection is authenticated before the upgrade and bound
//! to one user id for its lifetime. Connections join rooms keyed by thread
//! id; a join replays the most recent history to that connection only, and
//! an accepted send is persisted, folded into the thread's last-message
//! projection, and fanned out to every connection in the room.
//!
//! `join` and `send` fail closed and silently: a missing thread and a
//! foreign thread look identical to the caller (nothing happens). The
//! participant check always goes back to the thread row — room membership
//! is never treated as authorization.
//!
//! Per-thread ordering: persist + projection + broadcast run under a mutex
//! keyed by thread id, so two unsynchronized senders can never interleave a
//! commit with a broadcast and push frames out of persisted order. A join
//! takes the same mutex while it snapshots history and subscribes, which
//! makes the replay gap-free and duplicate-free against racing sends.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::models::{now_ms, ChatMessage};
use crate::threads;

const ROOM_CAPACITY: usize = 256;

/// Frames a client may send over the socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Join {
        thread_id: i64,
    },
    Send {
        thread_id: i64,
        text: String,
        #[serde(default)]
        client_key: Option<String>,
    },
}

/// Frames the server pushes to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// History snapshot, sent exclusively to the joining connection.
    History {
        thread_id: i64,
        messages: Vec<ChatMessage>,
    },
    /// A newly accepted message, broadcast to the whole room.
    Message { message: ChatMessage },
}

struct Room {
    tx: broadcast::Sender<ChatMessage>,
    /// Serializes persist+broadcast for this thread.
    write_lock: Arc<Mutex<()>>,
}

/// Registry of live rooms, shared by all connections.
pub struct Rooms {
    inner: Mutex<HashMap<i64, Room>>,
}

impl Default for Rooms {
    fn default() -> Self {
        Self::new()
    }
}

impl Rooms {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    async fn room(&self, thread_id: i64) -> (broadcast::Sender<ChatMessage>, Arc<Mutex<()>>) {
        let mut rooms = self.inner.lock().await;
        let room = rooms.entry(thread_id).or_insert_with(|| {
            let (tx, _) = broadcast::channel(ROOM_CAPACITY);
            Room {
                tx,
                write_lock: Arc::new(Mutex::new(())),
            }
        });
        (room.tx.clone(), room.write_lock.clone())
    }

    /// Join `user_id` to a thread's room.
    ///
    /// Returns the history snapshot (ascending, at most `history_limit`)
    /// and a live receiver, or `None` — silently — when the thread does not
    /// exist or the user is not a participant.
    pub async fn join(
        &self,
        pool: &SqlitePool,
        user_id: i64,
        thread_id: i64,
        history_limit: i64,
    ) -> Option<(Vec<ChatMessage>, broadcast::Receiver<ChatMessage>)> {
        if thread_id <= 0 {
            return None;
        }
        let thread = threads::require_participant(pool, user_id, thread_id)
            .await
            .ok()?;

        let (tx, write_lock) = self.room(thread.id).await;

        // Subscribe and snapshot under the thread's write lock: everything
        // committed so far lands in the snapshot, everything after arrives
        // on the receiver, nothing does both.
        let _guard = write_lock.lock().await;
        let rx = tx.subscribe();
        let history = threads::fetch_messages_asc(pool, thread.id, history_limit)
            .await
            .ok()?;

        Some((history, rx))
    }

    /// Persist and fan out a message.
    ///
    /// Returns the stored message, or `None` when the send was dropped:
    /// empty text, bad thread id, non-participant, or a replay of an
    /// already-stored `(thread, sender, client_key)` triple. A replay never
    /// produces a second visible message and never tears down the
    /// connection.
    pub async fn send(
        &self,
        pool: &SqlitePool,
        user_id: i64,
        thread_id: i64,
        text: &str,
        client_key: Option<&str>,
    ) -> Option<ChatMessage> {
        let text = text.trim();
        if text.is_empty() || thread_id <= 0 {
            return None;
        }
        let thread = threads::require_participant(pool, user_id, thread_id)
            .await
            .ok()?;

        let (tx, write_lock) = self.room(thread.id).await;
        let _guard = write_lock.lock().await;

        let message = match persist_message(pool, thread.id, user_id, text, client_key).await {
            Ok(Some(m)) => m,
            Ok(None) => {
                // Duplicate idempotency key; the original message stands.
                tracing::debug!(thread_id, user_id, "dropped duplicate send");
                return None;
            }
            Err(e) => {
                tracing::error!(thread_id, user_id, error = %e, "message persist failed");
                return None;
            }
        };

        // Receiver count can be zero (both participants offline); that is
        // not an error.
        let _ = tx.send(message.clone());
        Some(message)
    }
}

/// Insert a message and update the thread's last-message projection.
///
/// Returns `Ok(None)` when the `(thread, sender, client_key)` uniqueness
/// constraint absorbs a retried send.
async fn persist_message(
    pool: &SqlitePool,
    thread_id: i64,
    sender_id: i64,
    text: &str,
    client_key: Option<&str>,
) -> anyhow::Result<Option<ChatMessage>> {
    let created_at = now_ms();

    let inserted = sqlx::query(
        "INSERT INTO chat_messages (thread_id, sender_id, text, created_at, client_key) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(thread_id)
    .bind(sender_id)
    .bind(text)
    .bind(created_at)
    .bind(client_key)
    .execute(pool)
    .await;

    let id = match inserted {
        Ok(result) => result.last_insert_rowid(),
        Err(sqlx::Error::Database(db)) if db.message().contains("UNIQUE constraint failed") => {
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    sqlx::query("UPDATE chat_threads SET last_message_at = ?, last_message_text = ? WHERE id = ?")
        .bind(created_at)
        .bind(text)
        .bind(thread_id)
        .execute(pool)
        .await?;

    Ok(Some(ChatMessage {
        id,
        thread_id,
        sender_id,
        text: text.to_string(),
        created_at,
        client_key: client_key.map(str::to_string),
    }))
}

/// Drive one authenticated WebSocket session until the client goes away.
///
/// Outbound frames are funneled through one mpsc channel so the history
/// snapshot and room broadcasts cannot interleave mid-frame. Each joined
/// room gets a forwarding task that is aborted on disconnect.
pub async fn run_session(
    socket: WebSocket,
    pool: SqlitePool,
    rooms: Arc<Rooms>,
    user_id: i64,
    history_limit: i64,
) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerFrame>();

    let writer: JoinHandle<()> = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let payload = match serde_json::to_string(&frame) {
                Ok(p) => p,
                Err(_) => continue,
            };
            if sink.send(WsMessage::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    // thread_id -> forwarding task for that room's broadcasts.
    let mut joined: HashMap<i64, JoinHandle<()>> = HashMap::new();

    while let Some(Ok(ws_msg)) = stream.next().await {
        let text = match ws_msg {
            WsMessage::Text(t) => t,
            WsMessage::Close(_) => break,
            _ => continue,
        };

        // Unparsable frames are dropped like unauthorized ones: silently.
        let frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(_) => continue,
        };

        match frame {
            ClientFrame::Join { thread_id } => {
                let Some((history, mut rx)) =
                    rooms.join(&pool, user_id, thread_id, history_limit).await
                else {
                    continue;
                };

                if out_tx
                    .send(ServerFrame::History {
                        thread_id,
                        messages: history,
                    })
                    .is_err()
                {
                    break;
                }

                // Re-join replaces the previous subscription.
                if let Some(old) = joined.remove(&thread_id) {
                    old.abort();
                }

                let forward_tx = out_tx.clone();
                let handle = tokio::spawn(async move {
                    loop {
                        match rx.recv().await {
                            Ok(message) => {
                                if forward_tx.send(ServerFrame::Message { message }).is_err() {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                tracing::warn!(thread_id, missed, "room receiver lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                });
                joined.insert(thread_id, handle);
            }
            ClientFrame::Send {
                thread_id,
                text,
                client_key,
            } => {
                // The sender observes its own message through the room
                // broadcast, same as its peer.
                let _ = rooms
                    .send(&pool, user_id, thread_id, &text, client_key.as_deref())
                    .await;
            }
        }
    }

    for (_, handle) in joined {
        handle.abort();
    }
    writer.abort();
}
