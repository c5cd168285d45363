//! Room session coordinator binary.
//!
//! # Usage
//!
//! ```bash
//! # Development: bind locally, secret from the environment
//! JWT_SECRET=dev-secret slate-collab-server --bind 127.0.0.1:9090
//!
//! # Production-ish: explicit storage path and eviction tuning
//! slate-collab-server --bind 0.0.0.0:9090 --storage /var/lib/slate \
//!     --idle-timeout-secs 900
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use slate_collab::{CollabServer, ServerConfig};

/// Collaborative whiteboard session coordinator
#[derive(Parser, Debug)]
#[command(name = "slate-collab-server")]
#[command(about = "WebSocket session coordinator for collaborative whiteboard rooms")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// HS256 signing secret shared with the login service
    #[arg(long, env = "JWT_SECRET")]
    jwt_secret: Option<String>,

    /// Room store directory
    #[arg(short, long, default_value = "slate_data")]
    storage: PathBuf,

    /// Broadcast buffer capacity per room
    #[arg(long, default_value = "256")]
    broadcast_capacity: usize,

    /// Evict resident rooms idle for this many seconds
    #[arg(long, default_value = "900")]
    idle_timeout_secs: u64,

    /// Seconds between eviction sweeps
    #[arg(long, default_value = "60")]
    sweep_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    log::info!("Session coordinator starting");
    log::info!("Binding to {}", args.bind);

    if args.jwt_secret.is_none() {
        log::warn!("No JWT_SECRET configured - all connections will be rejected");
    }

    let config = ServerConfig {
        bind_addr: args.bind,
        jwt_secret: args.jwt_secret,
        broadcast_capacity: args.broadcast_capacity,
        storage_path: args.storage,
        idle_room_timeout: Duration::from_secs(args.idle_timeout_secs),
        sweep_interval: Duration::from_secs(args.sweep_interval_secs),
    };

    let server = CollabServer::new(config)?;
    server.run().await
}
