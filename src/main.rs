//! Alarm relay: forwards the WAS incident list to display clients.
//!
//! Listens to the WAS dispatch backend, keeps the current incident list and
//! pushes it to every connected display client over the AIC protocol.
//!
//! Usage:
//!   alarm-relay                                  # Defaults: WAS 192.168.130.100:47000, clients on 0.0.0.0:55555
//!   alarm-relay --config relay.json              # Load settings from a JSON file
//!   alarm-relay --was-host 10.0.0.5 --probe tcp  # Override the upstream and use a TCP probe
//!   alarm-relay --print-config                   # Show the effective configuration and exit

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use relay_server::{ListeningManager, ProbeKind, RelayConfig, ServerError, check_upload_url};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "alarm-relay", about = "Alarm relay between the WAS and display clients")]
struct Cli {
    /// JSON configuration file (defaults apply to every key it omits)
    #[arg(long)]
    config: Option<PathBuf>,

    /// WAS host name or address
    #[arg(long)]
    was_host: Option<String>,

    /// WAS port
    #[arg(long)]
    was_port: Option<u16>,

    /// Address to accept display clients on
    #[arg(long)]
    bind: Option<String>,

    /// Port to accept display clients on (0 for OS-assigned)
    #[arg(long)]
    port: Option<u16>,

    /// Reachability probe: icmp or tcp
    #[arg(long)]
    probe: Option<ProbeKind>,

    /// Forward every changed incident to this URL
    #[arg(long)]
    upload_url: Option<String>,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    print_config: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Write logs to a file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Cli {
    /// Defaults, then the config file, then flags.
    fn resolve_config(&self) -> Result<RelayConfig, ServerError> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::load(path)?,
            None => RelayConfig::default(),
        };
        if let Some(host) = &self.was_host {
            config.was.host = host.clone();
        }
        if let Some(port) = self.was_port {
            config.was.port = port;
        }
        if let Some(bind) = &self.bind {
            config.clients.bind = bind.clone();
        }
        if let Some(port) = self.port {
            config.clients.port = port;
        }
        if let Some(probe) = self.probe {
            config.was.probe = probe;
        }
        if let Some(url) = &self.upload_url {
            config.upload.enabled = true;
            config.upload.url = url.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(cli: &Cli) {
    let default = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    if let Some(ref log_path) = cli.log_file {
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let file = match std::fs::OpenOptions::new().create(true).append(true).open(log_path) {
            Ok(file) => file,
            Err(e) => {
                eprintln!("Failed to open log file {}: {e}", log_path.display());
                std::process::exit(1);
            }
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();

        eprintln!("Logging to {}", log_path.display());
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Keep trying to reach the WAS until the first start succeeds. After that
/// the manager's own reconnect loop takes over.
async fn start_was_until_reachable(manager: Arc<ListeningManager>, config: RelayConfig) {
    loop {
        match manager.start_was_listening().await {
            Ok(()) | Err(ServerError::AlreadyRunning(_)) => return,
            Err(e @ ServerError::WasUnreachable { .. }) => {
                warn!("{e}; retrying in {:?}", config.was.reconnect_interval);
            }
            Err(e) => {
                error!(category = %e.category(), "Failed to start WAS listening: {e}");
                return;
            }
        }
        tokio::time::sleep(config.was.reconnect_interval).await;
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match cli.resolve_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    if cli.print_config {
        match serde_json::to_string_pretty(&config) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Failed to render configuration: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    init_tracing(&cli);

    if config.upload.enabled && !check_upload_url(&config.upload.url).await {
        warn!(url = %config.upload.url, "Upload URL doesn't answer; uploads will probably fail");
    }

    let manager = Arc::new(ListeningManager::new(config.clone()));

    let client_addr = match manager.start_client_listening().await {
        Ok(addr) => addr,
        Err(e) => {
            error!("Failed to start client listening: {e}");
            std::process::exit(1);
        }
    };

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         Alarm Relay                          ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("  WAS:        {}:{}", config.was.host, config.was.port);
    println!("  Probe:      {:?}", config.was.probe);
    println!("  Clients:    {client_addr}");
    if config.upload.enabled {
        println!("  Upload:     {}", config.upload.url);
    } else {
        println!("  Upload:     disabled");
    }
    println!();
    println!("  Press Ctrl+C to stop.");
    println!();

    let starter = tokio::spawn(start_was_until_reachable(manager.clone(), config));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {e}");
    }

    println!();
    println!("  Shutting down...");
    starter.abort();
    manager.shutdown().await;
    info!("Alarm relay stopped");
    println!("  Relay stopped.");
}
