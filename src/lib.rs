//! # Reclaim
//!
//! A campus lost-and-found marketplace core: item listings with image
//! embeddings, one-chat-per-item conversations with a two-party close
//! handshake, room-scoped realtime messaging, and similarity search for
//! finding matching or duplicate items.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────┐   ┌──────────┐
//! │   HTTP   │──▶│ threads/items │──▶│  SQLite   │
//! │  (axum)  │   │  similarity   │   │   (WAL)   │
//! └────┬─────┘   └───────────────┘   └────┬─────┘
//!      │                                  │
//!      ▼                                  ▼
//! ┌──────────┐                      ┌──────────┐
//! │ WebSocket│─────── rooms ───────▶│ broadcast │
//! │ sessions │                      │ channels  │
//! └──────────┘                      └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! reclaim init                  # create database
//! reclaim token --user-id 1    # mint a bearer token
//! reclaim serve                 # start HTTP + WebSocket server
//! reclaim repair                # sweep half-finished close handshakes
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`auth`] | HMAC-signed bearer tokens |
//! | [`items`] | Users, items, and the monotonic status machine |
//! | [`threads`] | Thread uniqueness and the close handshake |
//! | [`realtime`] | Room registry and WebSocket sessions |
//! | [`similarity`] | Cosine ranking over item embeddings |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`server`] | HTTP + WebSocket server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod auth;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod items;
pub mod migrate;
pub mod models;
pub mod realtime;
pub mod server;
pub mod similarity;
pub mod threads;
