use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use collabtext_sync::{
    AllowAll, Broker, LocalBroker, ServerConfig, StaticTokens, SyncError, SyncServer,
    TokenAuthority, UpstreamBroker,
};

#[derive(Debug, Parser)]
#[command(name = "collabtext", version, about = "Collaborative text sync server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Central authority: token auth, in-process broker
    Server(ServerArgs),
    /// Editing agent: no auth, linked upstream to a central server
    Agent(AgentArgs),
}

#[derive(Debug, Args)]
struct CommonArgs {
    /// Document served on a bare /ws
    #[arg(long, default_value = "default_doc", env = "COLLABTEXT_DEFAULT_DOCUMENT")]
    default_document: String,

    /// Stable peer identity stamped on created characters (random if unset)
    #[arg(long, env = "COLLABTEXT_PEER_ID")]
    peer_id: Option<String>,
}

#[derive(Debug, Args)]
struct ServerArgs {
    #[arg(long, default_value = "0.0.0.0:8081", env = "COLLABTEXT_BIND")]
    bind: String,

    /// RocksDB directory (in-memory if unset)
    #[arg(long, env = "COLLABTEXT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Accepted credential as TOKEN=USER, repeatable
    #[arg(long = "token", env = "COLLABTEXT_TOKENS", value_delimiter = ',')]
    tokens: Vec<String>,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Args)]
struct AgentArgs {
    #[arg(long, default_value = "0.0.0.0:8080", env = "COLLABTEXT_BIND")]
    bind: String,

    #[arg(long, default_value = "collabtext.db", env = "COLLABTEXT_DATA_DIR")]
    data_dir: PathBuf,

    /// Central server WebSocket root
    #[arg(long, default_value = "ws://localhost:8081/ws", env = "COLLABTEXT_UPSTREAM")]
    upstream: String,

    #[arg(long, env = "COLLABTEXT_UPSTREAM_TOKEN")]
    upstream_token: Option<String>,

    /// Give up on an upstream handshake after this many milliseconds
    #[arg(long, default_value_t = 5000, env = "COLLABTEXT_UPSTREAM_CONNECT_TIMEOUT_MS")]
    upstream_connect_timeout_ms: u64,

    #[command(flatten)]
    common: CommonArgs,
}

fn config(bind: String, data_dir: Option<PathBuf>, common: CommonArgs) -> ServerConfig {
    let mut config = ServerConfig {
        bind_addr: bind,
        default_document: common.default_document,
        storage_path: data_dir,
        ..ServerConfig::default()
    };
    if let Some(peer_id) = common.peer_id {
        config.coordinator.peer_id = peer_id;
    }
    config
}

fn build(command: Command) -> Result<SyncServer, SyncError> {
    match command {
        Command::Server(args) => {
            let tokens = StaticTokens::from_entries(&args.tokens)?;
            if tokens.is_empty() {
                log::warn!("No tokens configured, every connection will be refused");
            }
            let broker: Arc<dyn Broker> = Arc::new(LocalBroker::default());
            let auth: Arc<dyn TokenAuthority> = Arc::new(tokens);
            SyncServer::open(config(args.bind, args.data_dir, args.common), broker, auth)
        }
        Command::Agent(args) => {
            log::info!("Linking documents upstream to {}", args.upstream);
            let broker: Arc<dyn Broker> =
                Arc::new(UpstreamBroker::new(args.upstream, args.upstream_token).with_connect_timeout(
                    Duration::from_millis(args.upstream_connect_timeout_ms),
                ));
            let auth: Arc<dyn TokenAuthority> = Arc::new(AllowAll);
            SyncServer::open(
                config(args.bind, Some(args.data_dir), args.common),
                broker,
                auth,
            )
        }
    }
}

async fn run(command: Command) -> Result<(), SyncError> {
    let server = build(command)?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
        }
    }

    let written = server.registry().flush_all().await;
    log::info!("Flushed {written} documents");
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli.command).await {
        log::error!("{e}");
        std::process::exit(1);
    }
}
