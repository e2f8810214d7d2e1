//! `logos-sync-server`: standalone WebSocket sync server.

use clap::Parser;
use logos_sync::{ServerConfig, SyncServer};

/// Collaborative document sync server
#[derive(Parser, Debug)]
#[command(name = "logos-sync-server", version, about)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "LOGOS_SYNC_BIND", default_value = "127.0.0.1:1234")]
    bind: String,

    /// Broadcast queue length per room
    #[arg(long, env = "LOGOS_SYNC_BROADCAST_CAPACITY", default_value_t = 256)]
    broadcast_capacity: usize,

    /// Maximum live rooms (unlimited when unset)
    #[arg(long, env = "LOGOS_SYNC_MAX_ROOMS")]
    max_rooms: Option<usize>,

    /// Maximum connections per room
    #[arg(long, env = "LOGOS_SYNC_MAX_CONNECTIONS_PER_ROOM", default_value_t = 100)]
    max_connections_per_room: usize,

    /// Largest accepted frame in bytes
    #[arg(long, env = "LOGOS_SYNC_MAX_MESSAGE_SIZE", default_value_t = 16 * 1024 * 1024)]
    max_message_size: usize,

    /// Seconds before unrenewed presence expires (0 disables)
    #[arg(long, env = "LOGOS_SYNC_AWARENESS_TIMEOUT", default_value_t = 30)]
    awareness_timeout_secs: u64,
}

impl From<Cli> for ServerConfig {
    fn from(cli: Cli) -> Self {
        Self {
            bind_addr: cli.bind,
            broadcast_capacity: cli.broadcast_capacity,
            max_rooms: cli.max_rooms,
            max_connections_per_room: cli.max_connections_per_room,
            max_message_size: cli.max_message_size,
            awareness_timeout_secs: cli.awareness_timeout_secs,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from(Cli::parse());
    log::debug!("Configuration: {config:?}");
    let server = SyncServer::new(config);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down ({} rooms live)", server.registry().room_count().await);
        }
    }
    Ok(())
}
