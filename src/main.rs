use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use floranet::config::FileConfig;
use floranet::engine::Engine;
use floranet::interfaces::InterfaceManager;
use floranet::store::{MemoryStore, Store};
use floranet::{admin, gateway};

#[derive(Parser)]
#[command(name = "floranet-server")]
#[command(about = "LoRaWAN 1.0 class-A/C network server")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", default_value = "config.toml")]
    config: PathBuf,

    /// Path to a log file. Defaults to stderr when omitted.
    #[arg(short = 'l', long = "logfile")]
    logfile: Option<PathBuf>,

    /// Stay attached to the terminal instead of daemonizing.
    #[arg(short = 'f', long = "foreground")]
    foreground: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let file_config = FileConfig::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        FileConfig::default()
    });

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&file_config.logging.level));
    match &cli.logfile {
        Some(path) => {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt().with_env_filter(env_filter).with_writer(file).init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
        }
    }

    if !cli.foreground {
        info!("running in background mode (daemonization left to the process supervisor)");
    }

    info!("floranet v{}", env!("CARGO_PKG_VERSION"));

    let config = file_config.to_model();
    config.check().map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    store.save_config(config.clone()).await?;

    let interfaces = Arc::new(InterfaceManager::new());
    let (engine, downlink_rx) = Engine::new(store.clone(), interfaces.clone(), config.clone());
    let engine = Arc::new(engine);

    let admin_state = admin::AdminState {
        store: store.clone(),
        engine: engine.clone(),
        interfaces: interfaces.clone(),
        apitoken: config.apitoken.clone(),
    };

    let admin_listen = config.listen;
    let admin_webport = config.webport;
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin::run_admin_server(admin_listen, admin_webport, admin_state).await {
            tracing::error!("admin server exited: {}", e);
        }
    });

    let gwmp_result = gateway::run_server(&config, engine, downlink_rx).await;

    admin_handle.abort();
    gwmp_result
}
