//! # Reclaim CLI (`reclaim`)
//!
//! The `reclaim` binary is the operational interface for the lost-and-found
//! service: database initialization, the HTTP + WebSocket server, the close
//! handshake repair sweep, and token minting for development.
//!
//! ## Usage
//!
//! ```bash
//! reclaim --config ./config/reclaim.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `reclaim init` | Create the SQLite database and run schema migrations |
//! | `reclaim serve` | Start the HTTP + WebSocket server |
//! | `reclaim repair` | Finalize threads where both parties confirmed close |
//! | `reclaim token --user-id <id>` | Mint a signed bearer token for a user |

mod auth;
mod config;
mod db;
mod embedding;
mod error;
mod items;
mod migrate;
mod models;
mod realtime;
mod server;
mod similarity;
mod threads;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Reclaim CLI — the campus lost-and-found marketplace core.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/reclaim.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "reclaim",
    about = "Reclaim — a campus lost-and-found marketplace core",
    version,
    long_about = "Reclaim manages lost-and-found item listings, one-chat-per-item \
    conversations with a two-party close handshake, room-scoped realtime messaging \
    over WebSockets, and image-embedding similarity search."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/reclaim.toml`. Database, server, auth,
    /// embedding, and similarity settings are read from this file.
    #[arg(long, global = true, default_value = "./config/reclaim.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (users, items, chat_threads, chat_messages). This command is
    /// idempotent — running it multiple times is safe.
    Init,

    /// Start the HTTP + WebSocket server.
    ///
    /// Binds to the address configured in `[server].bind` and serves the
    /// item, chat, search, and realtime endpoints.
    Serve,

    /// Sweep for half-finished close handshakes.
    ///
    /// Finds threads where both parties have confirmed close but the item
    /// was never marked CLOSED (e.g., a crash between the two writes) and
    /// finalizes them. Also runs opportunistically on thread reads.
    Repair,

    /// Mint a signed bearer token for a user.
    ///
    /// Intended for development and operational use; production clients
    /// obtain tokens from the login flow in front of this service.
    Token {
        /// User id the token authenticates as.
        #[arg(long)]
        user_id: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Repair => {
            let pool = db::connect(&cfg).await?;
            let repaired = threads::repair_all(&pool).await?;
            println!("Repaired {} thread(s).", repaired);
        }
        Commands::Token { user_id } => {
            let pool = db::connect(&cfg).await?;
            if items::get_user(&pool, user_id).await?.is_none() {
                anyhow::bail!("user {} does not exist", user_id);
            }
            let token = auth::mint_token(&cfg.auth, user_id)?;
            println!("{}", token);
        }
    }

    Ok(())
}
