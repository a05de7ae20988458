//! kapuad — the Kapua mesh node daemon.
//!
//! Loads configuration (YAML file, then command line overrides), prepares
//! the node's key pair, starts the core, and waits for a stop signal.

use clap::Parser;
use kapua::config::{Config, LogLevel};
use kapua::core::Core;
use kapua::crypto::KeyPair;
use std::path::PathBuf;
use tracing::{error, info};

const DEFAULT_CONFIG_FILE: &str = "config.yaml";
const PUBLIC_KEY_FILE: &str = "public.pem";
const PRIVATE_KEY_FILE: &str = "private.pem";

#[derive(Parser)]
#[command(name = "kapuad", version, about = "Kapua mesh node daemon")]
struct Args {
    /// YAML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Fixed node id (64-bit hex literal)
    #[arg(long = "server.id", value_name = "HEX64")]
    server_id: Option<String>,

    /// Bind address
    #[arg(long = "server.ip4_address", value_name = "ADDR")]
    server_ip4_address: Option<String>,

    /// UDP port
    #[arg(long = "server.port", value_name = "PORT")]
    server_port: Option<String>,

    /// Grace period before a silent peer is evicted
    #[arg(long = "server.peer_expiry", value_name = "DURATION")]
    server_peer_expiry: Option<String>,

    /// Enable the periodic discovery broadcast
    #[arg(long = "local_discovery.enable", value_name = "BOOL")]
    local_discovery_enable: Option<String>,

    /// Discovery broadcast interval (e.g. 5s, 100u, 0.5h)
    #[arg(long = "local_discovery.interval", value_name = "DURATION")]
    local_discovery_interval: Option<String>,

    /// Static peers receiving unicast discovery (comma-separated ip:port)
    #[arg(long = "local_discovery.seeds", value_name = "IP:PORT,..")]
    local_discovery_seeds: Option<String>,

    /// Log level: error|warn|info|debug
    #[arg(long = "logging.level", value_name = "LEVEL")]
    logging_level: Option<String>,

    /// Suppress the startup banner
    #[arg(long = "logging.disable_splash")]
    logging_disable_splash: bool,
}

impl Args {
    /// Command line overrides, in table-key form, applied after the file.
    fn overrides(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        let mut push = |key, value: &Option<String>| {
            if let Some(v) = value {
                pairs.push((key, v.clone()));
            }
        };
        push("server.id", &self.server_id);
        push("server.ip4_address", &self.server_ip4_address);
        push("server.port", &self.server_port);
        push("server.peer_expiry", &self.server_peer_expiry);
        push("local_discovery.enable", &self.local_discovery_enable);
        push("local_discovery.interval", &self.local_discovery_interval);
        push("local_discovery.seeds", &self.local_discovery_seeds);
        push("logging.level", &self.logging_level);
        if self.logging_disable_splash {
            pairs.push(("logging.disable_splash", "true".into()));
        }
        pairs
    }
}

fn main() {
    let args = Args::parse();
    std::process::exit(run(args));
}

fn run(args: Args) -> i32 {
    // Configuration first: the file (explicit, or config.yaml if present),
    // then the command line on top.
    let mut config = Config::default();
    let file = match &args.config {
        Some(path) => Some(path.clone()),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            default.exists().then_some(default)
        }
    };
    if let Some(path) = file {
        if let Err(e) = config.load_yaml(&path) {
            eprintln!("kapuad: {}", e);
            return 1;
        }
    }
    for (key, value) in args.overrides() {
        if let Err(e) = config.set(key, &value) {
            eprintln!("kapuad: {}", e);
            return 1;
        }
    }

    let level = match config.log_level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("kapua={}", level).parse().unwrap()),
        )
        .init();

    if !config.disable_splash {
        println!("----------------------------");
        println!("Kapua v{}", env!("CARGO_PKG_VERSION"));
        println!("----------------------------");
    }

    info!("Configuring...");
    let keys = match KeyPair::load_or_generate(
        PUBLIC_KEY_FILE,
        PRIVATE_KEY_FILE,
        kapua::crypto::RSA_KEY_BITS,
    ) {
        Ok(keys) => keys,
        Err(e) => {
            error!("Cannot prepare key pair: {}", e);
            return 1;
        }
    };

    info!("Starting...");
    let core = match Core::new(config, keys) {
        Ok(core) => core,
        Err(e) => {
            error!("Cannot start node: {}", e);
            return 1;
        }
    };
    if !core.start() {
        error!("Node start failed");
        return 1;
    }

    // Signal handlers ask the core to stop; they do not touch globals.
    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    }) {
        error!("Cannot install signal handler: {}", e);
        core.stop();
        return 1;
    }

    let _ = stop_rx.recv();
    info!("Stopping...");
    core.stop();
    0
}
