mod config;

use anyhow::{Context, Result};
use clap::Parser;
use lanconnect_protocol::{
    plugins::ping::PingPluginFactory, CertificateInfo, DeviceInfo, DeviceStore, LanService,
    Manager, ManagerEvent, PluginRegistry,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use config::Config;

/// KDE Connect compatible LAN daemon
#[derive(Debug, Parser)]
#[command(name = "lanconnect-daemon", version, about)]
struct Cli {
    /// Configuration file (defaults to ~/.config/lanconnect/daemon.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Announce ourselves to one address after startup, e.g. lan://192.168.1.20
    #[arg(long, value_name = "URI")]
    identify: Option<String>,
}

/// Main daemon state
struct Daemon {
    /// Device registry and channel services
    manager: Manager,

    /// This device info
    device_info: DeviceInfo,
}

impl Daemon {
    /// Create a new daemon
    async fn new(config: &Config) -> Result<Self> {
        config
            .ensure_directories()
            .context("Failed to create directories")?;

        let certificate =
            CertificateInfo::load_or_generate(&config.paths.cert_dir, config.device.device_id.as_deref())
                .context("Failed to load certificate")?;
        if let Some(configured) = &config.device.device_id {
            if configured != &certificate.device_id {
                warn!(
                    "Configured device id {} ignored, certificate belongs to {}",
                    configured, certificate.device_id
                );
            }
        }

        let mut registry = PluginRegistry::new();
        if config.plugins.enable_ping {
            info!("Registering ping plugin");
            registry
                .register_factory(Arc::new(PingPluginFactory))
                .context("Failed to register ping plugin")?;
        }
        info!("{} plugin(s) registered", registry.factory_count());

        let device_info = DeviceInfo::with_id(
            &certificate.device_id,
            &config.device.name,
            config.device_type(),
            config.network.port,
        )
        .with_incoming_capabilities(registry.get_all_incoming_capabilities())
        .with_outgoing_capabilities(registry.get_all_outgoing_capabilities());

        let store =
            DeviceStore::open(&config.paths.data_dir).context("Failed to open device registry")?;
        let manager = Manager::new(config.manager_config(), registry, store);

        let lan = LanService::new(
            device_info.clone(),
            &certificate,
            manager.policy(),
            config.lan_config(),
        )
        .context("Failed to create LAN service")?;
        manager.add_service(Arc::new(lan)).await;

        Ok(Self {
            manager,
            device_info,
        })
    }

    /// Run the daemon until Ctrl+C
    async fn run(&self, identify: Option<&str>) -> Result<()> {
        info!(
            "Device: {} ({})",
            self.device_info.device_name, self.device_info.device_id
        );
        info!("Type: {}", self.device_info.device_type);
        info!("Protocol version: {}", self.device_info.protocol_version);
        for cap in &self.device_info.incoming_capabilities {
            info!("  incoming: {}", cap);
        }
        for cap in &self.device_info.outgoing_capabilities {
            info!("  outgoing: {}", cap);
        }

        let events = self.manager.subscribe();
        self.manager
            .start()
            .await
            .context("Failed to start device manager")?;

        if let Some(target) = identify {
            self.manager
                .identify(Some(target))
                .await
                .with_context(|| format!("Failed to identify to {}", target))?;
        } else {
            self.manager
                .identify(None)
                .await
                .context("Failed to announce identity")?;
        }

        info!("Press Ctrl+C to stop");
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for shutdown signal")?;
                info!("Received shutdown signal");
            }
            _ = log_events(events) => {}
        }

        Ok(())
    }

    async fn shutdown(&self) {
        info!("Shutting down daemon...");
        self.manager.stop().await;
        info!("Daemon shutdown complete");
    }
}

async fn log_events(mut events: broadcast::Receiver<ManagerEvent>) {
    loop {
        match events.recv().await {
            Ok(ManagerEvent::PairingRequested { device_id }) => {
                info!("Pairing requested by {}", device_id)
            }
            Ok(ManagerEvent::Paired {
                device_id,
                fingerprint,
            }) => info!("Paired with {} ({})", device_id, fingerprint),
            Ok(ManagerEvent::Error { device_id, message }) => {
                error!("{}: {}", device_id, message)
            }
            Ok(event) => info!("{:?}", event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Missed {} events", skipped)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    info!("Starting lanconnect daemon...");

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    info!("Configuration loaded");
    info!("Device name: {}", config.device.name);
    info!("Port: {}", config.network.port);

    let daemon = Daemon::new(&config)
        .await
        .context("Failed to create daemon")?;

    let result = daemon.run(cli.identify.as_deref()).await;
    daemon.shutdown().await;

    result
}
