//! PairPad collaboration server.
//!
//! Configuration comes from the environment (`PAIRPAD_BIND`, `HOST`/`PORT`,
//! `PAIRPAD_CHANNEL_CAPACITY`, `PAIRPAD_IDLE_TIMEOUT_SECS`,
//! `PAIRPAD_DATA_DIR`); log filtering from `RUST_LOG`.

use std::error::Error;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{info, warn};
use pairpad_collab::storage::DEFAULT_LANGUAGE;
use pairpad_collab::{
    suggest, CodeExecutor, CollabServer, ExecutorConfig, MemoryRoomStore, RocksRoomStore,
    Room, RoomStore, ServerConfig, StoreConfig, StoreError,
};

#[derive(Debug, Parser)]
#[command(name = "pairpad-server", about = "Real-time collaborative code rooms")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the WebSocket server (the default).
    Serve {
        /// Create a room with this language in the served store before
        /// accepting connections; its id is logged and printed. Repeatable.
        #[arg(long = "room", value_name = "LANGUAGE")]
        rooms: Vec<String>,
    },
    /// Create a room in the configured store and print its id.
    CreateRoom {
        #[arg(default_value = DEFAULT_LANGUAGE)]
        language: String,
    },
    /// Run a program like the output panel does and print the resulting `code_output` frame.
    Exec {
        #[arg(long, default_value = DEFAULT_LANGUAGE)]
        language: String,
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
        /// Source file (stdin when omitted).
        file: Option<PathBuf>,
    },
    /// Print a completion suggestion as JSON.
    Suggest {
        #[arg(long, default_value = DEFAULT_LANGUAGE)]
        language: String,
        /// Character offset of the cursor (end of input when omitted).
        #[arg(long)]
        cursor: Option<usize>,
        /// Source file (stdin when omitted).
        file: Option<PathBuf>,
    },
}

fn open_store(config: &ServerConfig) -> Result<Arc<dyn RoomStore>, StoreError> {
    match &config.data_dir {
        Some(path) => {
            let store = RocksRoomStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?;
            info!("Room store opened at {}", path.display());
            Ok(Arc::new(store))
        }
        None => {
            info!("No data dir configured, rooms live in memory");
            Ok(Arc::new(MemoryRoomStore::new()))
        }
    }
}

/// Create one room per language in `store`, in order.
fn seed_rooms(store: &dyn RoomStore, languages: &[String]) -> Result<Vec<Room>, StoreError> {
    languages
        .iter()
        .map(|language| {
            let room = store.create(language)?;
            info!("Created {language} room '{}'", room.room_id);
            Ok(room)
        })
        .collect()
}

fn read_source(file: Option<&Path>) -> std::io::Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path),
        None => {
            let mut source = String::new();
            std::io::stdin().read_to_string(&mut source)?;
            Ok(source)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = ServerConfig::from_env()?;

    match cli.command.unwrap_or(Command::Serve { rooms: Vec::new() }) {
        Command::Serve { rooms } => {
            info!("Starting PairPad server...");
            let store = open_store(&config)?;
            for room in seed_rooms(store.as_ref(), &rooms)? {
                println!("{}", room.room_id);
            }
            let server = CollabServer::new(config, store);
            server.run().await?;
        }
        Command::CreateRoom { language } => {
            if config.data_dir.is_none() {
                warn!(
                    "PAIRPAD_DATA_DIR is not set; the room will not outlive this process \
                     (use `serve --room` for in-memory rooms)"
                );
            }
            let store = open_store(&config)?;
            let room = store.create(&language)?;
            println!("{}", room.room_id);
        }
        Command::Exec {
            language,
            timeout_secs,
            file,
        } => {
            let code = read_source(file.as_deref())?;
            let executor = CodeExecutor::new(
                ExecutorConfig::default().with_timeout(Duration::from_secs(timeout_secs)),
            );
            let result = executor.execute(&code, &language).await;
            println!("{}", result.to_envelope().encode()?);
        }
        Command::Suggest {
            language,
            cursor,
            file,
        } => {
            let code = read_source(file.as_deref())?;
            let cursor = cursor.unwrap_or_else(|| code.chars().count());
            let suggestion = suggest(&code, cursor, &language);
            println!("{}", serde_json::to_string(&suggestion)?);
        }
    }

    Ok(())
}
