//! KNX Bridge Service (knxsrv)
//!
//! Supervises knxd, keeps one client connection to it, and translates between
//! KNX group telegrams and the message bus.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use common::logging::{self, LogConfig};
use errors::{VoltageError, VoltageResult};
use knxsrv::bridge::{Bridge, BridgeOptions, ConnectionSupervisor, HealthReporter, KnxLink, Topics};
use knxsrv::bus::connect_bus;
use knxsrv::config::{KnxSrvConfig, DEFAULT_CONFIG_PATH};
use knxsrv::daemon::{
    BusMonitor, BusObserver, DaemonManager, Endpoint, GroupAddressProvider, KnxdProbe,
    KnxdProcess, ManagerOptions, ProcessControl,
};
use knxsrv::registry::{DeviceRegistry, SqliteDeviceRepository};

/// Link event queue depth between the supervisor and the bridge
const LINK_EVENT_CAPACITY: usize = 1024;

#[derive(Parser, Debug)]
#[command(author, version, about = "KNX bridge service")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> VoltageResult<()> {
    let args = Args::parse();

    let config = KnxSrvConfig::load(&args.config)?;

    let log_config = LogConfig {
        service_name: "knxsrv".to_string(),
        log_dir: logging::resolve_log_dir(Some(config.service.log_dir.as_str())),
        level: args
            .log_level
            .clone()
            .unwrap_or_else(|| config.service.log_level.clone()),
        enable_json: config.service.log_json,
        ..Default::default()
    };
    logging::init_with_config(log_config)
        .map_err(|e| VoltageError::Configuration(format!("Failed to initialize logging: {}", e)))?;
    logging::enable_sighup_log_reopen();

    info!("Starting knxsrv v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration: {}", args.config.display());

    config.validate()?;
    if args.validate {
        info!("Validation completed successfully");
        return Ok(());
    }

    // ============ Device registry ============
    let repository = Arc::new(SqliteDeviceRepository::open(&config.storage.sqlite_path).await?);
    let registry = Arc::new(DeviceRegistry::new(repository.clone()));
    let devices = registry.refresh_cache().await?;
    info!("Device registry loaded: {} devices", devices);

    // ============ Message bus ============
    let topics = Topics::new(&config.service.topic_prefix);
    let will = HealthReporter::last_will(&topics, &config.service.bridge_id);
    let bus = connect_bus(&config.bus, Some(will)).await?;
    info!("Message bus connected: {}", bus.name());

    // ============ knxd supervision ============
    let url = config.connection_url();
    let endpoint = Endpoint::parse(&url)?;
    let probe = Arc::new(
        KnxdProbe::new(endpoint, config.knxd.health_timeout())
            .with_pinned_address(config.storage.health_check_address),
    );
    let process: Option<Arc<dyn ProcessControl>> = if config.knxd.managed {
        Some(Arc::new(KnxdProcess::new(config.knxd.clone())?))
    } else {
        info!("knxd is externally managed at {}", url);
        None
    };
    let (manager, daemon) = DaemonManager::new(
        process,
        probe.clone(),
        ManagerOptions::from_config(&config.knxd),
    );

    // ============ Bridge ============
    let link = Arc::new(KnxLink::new());
    let bridge = Arc::new(Bridge::new(
        BridgeOptions::from_config(&config.service),
        registry.clone(),
        bus.clone(),
        link.clone(),
        Some(daemon.clone()),
    ));
    let provider: Arc<dyn GroupAddressProvider> = bridge.recorder();
    probe.set_address_provider(provider);

    let monitor = config.service.bus_monitor.then(|| {
        let observer: Arc<dyn BusObserver> = bridge.recorder();
        BusMonitor::new(url.clone(), config.client.clone(), observer, Some(daemon.clone()))
    });

    let (link_tx, link_rx) = mpsc::channel(LINK_EVENT_CAPACITY);
    let supervisor =
        ConnectionSupervisor::new(url, config.client.clone(), link, Some(daemon), link_tx);

    // Stopped in reverse dependency order
    let daemon_cancel = CancellationToken::new();
    let link_cancel = CancellationToken::new();
    let bridge_cancel = CancellationToken::new();

    let manager_task = tokio::spawn(manager.run(daemon_cancel.clone()));
    let supervisor_task = tokio::spawn(supervisor.run(link_cancel.clone()));
    let monitor_task = monitor.map(|m| tokio::spawn(m.run(link_cancel.clone())));
    let mut bridge_task = tokio::spawn(bridge.clone().run(link_rx, bridge_cancel.clone()));

    info!("[OK] knxsrv started");

    tokio::select! {
        _ = common::wait_for_shutdown() => info!("Shutdown signal received"),
        result = &mut bridge_task => {
            match result {
                Ok(Ok(())) => warn!("Bridge exited unexpectedly"),
                Ok(Err(e)) => error!("Bridge failed: {}", e),
                Err(e) => error!("Bridge task panicked: {}", e),
            }
        },
    }

    // ============ Shutdown ============
    bridge_cancel.cancel();
    if !bridge_task.is_finished() {
        if let Ok(Err(e)) = bridge_task.await {
            warn!("Bridge stopped with error: {}", e);
        }
    }

    link_cancel.cancel();
    if let Err(e) = supervisor_task.await {
        warn!("Connection supervisor task failed: {}", e);
    }
    if let Some(task) = monitor_task {
        if let Err(e) = task.await {
            warn!("Bus monitor task failed: {}", e);
        }
    }

    daemon_cancel.cancel();
    if let Err(e) = manager_task.await {
        warn!("Daemon manager task failed: {}", e);
    }

    if let Err(e) = bus.close().await {
        warn!("Message bus close failed: {}", e);
    }
    repository.client().close().await;

    info!("knxsrv stopped");
    Ok(())
}
