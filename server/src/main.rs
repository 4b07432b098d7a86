use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};

use clap::Parser;
use log::{error, info};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use realm_server::admin::AdminList;
use realm_server::content::ContentTables;
use realm_server::persistence::Store;
use realm_server::server::GameServer;
use realm_server::session::{handle_connection, SessionDeps};
use realm_server::tick::RunFlag;

// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// WebSocket port to listen on
    #[clap(short, long, env = "PORT", default_value = "8080")]
    port: u16,

    /// Persistence file location
    #[clap(long, env = "DB_PATH", default_value = "realm.db.json")]
    db_path: PathBuf,

    /// Line-delimited admin allowlist, watched for live updates
    #[clap(long, default_value = "admins.txt")]
    admin_file: PathBuf,

    /// Allowed Origin header values (absent Origin is always accepted)
    #[clap(
        long,
        value_delimiter = ',',
        default_value = "http://localhost:3000,https://play.realmshard.example"
    )]
    origins: Vec<String>,

    /// Maximum concurrent connections
    #[clap(long, default_value = "256")]
    max_clients: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::init();
    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Warning: RUST_LOG environment variable not set. Set it to display logs!");
        eprintln!("Recommended: RUST_LOG=info cargo run");
    }

    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);

    let content = Arc::new(ContentTables::builtin());
    info!(
        "content loaded: {} classes, {} items, {} enemies, {} dungeons",
        content.classes.len(),
        content.items.len(),
        content.enemies.len(),
        content.dungeons.len()
    );

    let store = Arc::new(Mutex::new(Store::open(&args.db_path)?));
    let admin = AdminList::load(&args.admin_file);
    // Keep the watcher alive for the life of the process.
    let _watcher = match admin.watch() {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            error!("admin allowlist watch failed: {}", e);
            None
        }
    };

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let flag = RunFlag::new();

    let game = GameServer::new(content.clone(), store.clone(), admin.clone());
    let game_flag = flag.clone();
    let game_task = tokio::spawn(async move {
        game.run(command_rx, game_flag).await;
    });

    let deps = SessionDeps {
        store,
        content,
        commands: command_tx,
        allowed_origins: Arc::new(args.origins),
        connections: Arc::new(AtomicUsize::new(0)),
        max_clients: args.max_clients,
    };

    let listener = TcpListener::bind(&addr).await?;
    info!("listening for WebSocket connections on {}", addr);

    let accept_deps = deps.clone();
    let accept_task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!("new connection from {}", addr);
                    let deps = accept_deps.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, deps).await;
                    });
                }
                Err(e) => {
                    error!("accept failed: {}", e);
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    flag.stop();
    accept_task.abort();
    // Let the game loop finish its final save.
    let _ = game_task.await;
    Ok(())
}
