//! Flux server: sync gateway and bus hub in one binary.
//!
//! ```text
//! flux-server serve --bind 0.0.0.0:1234 --hub ws://hub:6380
//! flux-server hub --bind 0.0.0.0:6380
//! ```
//!
//! Every option can also be given through a `FLUX_*` environment variable.
//! Log output is controlled by `RUST_LOG`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use log::{error, info};
use tokio::sync::watch;

use flux_sync::{
    AllowAnonymous, Authenticator, BusHub, DocumentStore, Gateway, GatewayConfig,
    JwtAuthenticator, NoopPersistence, Persistence, Relay, RelayConfig, RelayPersistence,
    RemoteBus, RemoteBusConfig, RocksConfig, RocksPersistence, StoreConfig,
};

#[derive(Parser)]
#[command(name = "flux-server", about = "Real-time document sync server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the WebSocket sync gateway (default)
    Serve(ServeArgs),
    /// Run a bus hub that several gateways relay through
    Hub {
        #[arg(long, env = "FLUX_HUB_BIND", default_value = "127.0.0.1:6380")]
        bind: String,
    },
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, env = "FLUX_BIND", default_value = "127.0.0.1:1234")]
    bind: String,
    /// Seconds between pings; a silent peer is dropped after one period
    #[arg(long, env = "FLUX_HEARTBEAT_SECS", default_value_t = 30)]
    heartbeat_secs: u64,
    #[arg(long, env = "FLUX_MAX_FRAME_SIZE", default_value_t = 16 * 1024 * 1024)]
    max_frame_size: usize,
    /// Seconds between garbage collection sweeps
    #[arg(long, env = "FLUX_GC_INTERVAL_SECS", default_value_t = 60)]
    gc_interval_secs: u64,
    /// Idle seconds before a document without connections is evicted
    #[arg(long, env = "FLUX_GC_TTL_SECS", default_value_t = 1800)]
    gc_ttl_secs: u64,
    /// Coalesce persistence of update bursts (milliseconds)
    #[arg(long, env = "FLUX_PERSIST_DEBOUNCE_MS")]
    persist_debounce_ms: Option<u64>,
    /// Shared HS256 secret; without it every client is anonymous read-write
    #[arg(long, env = "FLUX_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,
    /// Persist documents in RocksDB at this path
    #[arg(long, env = "FLUX_ROCKS_PATH")]
    rocks_path: Option<PathBuf>,
    /// Relay through the bus hub at this `ws://` URL
    #[arg(long, env = "FLUX_HUB")]
    hub: Option<String>,
    #[arg(long, env = "FLUX_RELAY_PREFIX", default_value = "flux")]
    relay_prefix: String,
    /// Keep snapshots on the hub instead of local storage
    #[arg(long, env = "FLUX_HUB_SNAPSHOTS", requires = "hub", conflicts_with = "rocks_path")]
    hub_snapshots: bool,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self::parse_from(["serve"])
    }
}

#[derive(Parser)]
struct ServeOnly {
    #[command(flatten)]
    args: ServeArgs,
}

impl ServeArgs {
    fn parse_from<I, T>(iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        ServeOnly::parse_from(iter).args
    }

    fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            bind_addr: self.bind.clone(),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            max_frame_size: self.max_frame_size,
        }
    }

    fn store_config(&self) -> StoreConfig {
        StoreConfig {
            gc_interval: Duration::from_secs(self.gc_interval_secs),
            gc_ttl: Duration::from_secs(self.gc_ttl_secs),
            persist_debounce: self.persist_debounce_ms.map(Duration::from_millis),
            ..StoreConfig::default()
        }
    }

    fn relay(&self) -> Option<Arc<Relay>> {
        let url = self.hub.clone()?;
        let bus = RemoteBus::connect(RemoteBusConfig {
            url,
            ..RemoteBusConfig::default()
        });
        let config = RelayConfig {
            prefix: self.relay_prefix.clone(),
            ..RelayConfig::default()
        };
        Some(Arc::new(Relay::new(Arc::new(bus), config)))
    }

    fn persistence(
        &self,
        relay: Option<&Arc<Relay>>,
    ) -> Result<Arc<dyn Persistence>, flux_sync::PersistenceError> {
        if let Some(path) = &self.rocks_path {
            let config = RocksConfig {
                path: path.clone(),
                ..RocksConfig::default()
            };
            return Ok(Arc::new(RocksPersistence::open(config)?));
        }
        match relay {
            Some(relay) if self.hub_snapshots => Ok(Arc::new(RelayPersistence::new(relay.clone()))),
            _ => Ok(Arc::new(NoopPersistence)),
        }
    }

    fn authenticator(&self) -> Arc<dyn Authenticator> {
        match &self.jwt_secret {
            Some(secret) => Arc::new(JwtAuthenticator::new(secret.as_bytes())),
            None => Arc::new(AllowAnonymous),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command.unwrap_or_else(|| Commands::Serve(ServeArgs::default())) {
        Commands::Serve(args) => serve(args).await,
        Commands::Hub { bind } => hub(bind).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let relay = args.relay();
    let persistence = args.persistence(relay.as_ref())?;
    let store = Arc::new(DocumentStore::new(args.store_config(), persistence));

    let mut gateway = Gateway::new(args.gateway_config(), store, args.authenticator());
    if let Some(relay) = relay {
        info!(
            "relaying through {} as server {}",
            args.hub.as_deref().unwrap_or_default(),
            relay.server_id()
        );
        gateway = gateway.with_relay(relay);
    }
    let gateway = Arc::new(gateway);

    {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received, shutting down");
                gateway.shutdown();
            }
        });
    }

    gateway.run().await?;
    Ok(())
}

async fn hub(bind: String) -> Result<(), Box<dyn std::error::Error>> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            shutdown_tx.send_replace(true);
        }
    });
    BusHub::new(bind).run(shutdown_rx).await?;
    Ok(())
}
