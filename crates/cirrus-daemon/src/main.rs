//! Cirrus host daemon.
//!
//! Prepares the host for Cloud Hypervisor VMs, installs the port-forwarding
//! chains, then holds the driver until SIGINT or SIGTERM. On exit every VM
//! still registered is force-stopped and its resources released.
//!
//! Configuration is read from `$CIRRUS_CONFIG` (default
//! `/etc/cirrus/cirrus.toml`); `RUST_LOG` controls log filtering.

use anyhow::Context;
use cirrus_core::{Driver, DriverConfig, HostCapabilities, PortForwarder};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("cirrus_core=info".parse()?)
                .add_directive("cirrus_vmm=info".parse()?)
                .add_directive("cirrusd=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Cirrus daemon");

    let config = DriverConfig::from_env().context("failed to load configuration")?;
    tracing::info!(?config, "Configuration loaded");

    let host = HostCapabilities::system(&config);
    let driver = Driver::new(config.clone(), host).context("invalid network configuration")?;
    driver.start().await.context("failed to prepare host")?;

    let forwarder = PortForwarder::from_host(&config.network)?;
    if let Err(e) = forwarder.init().await {
        // VMs still boot; only inbound port mapping is unavailable.
        tracing::error!(error = %e, "Port forwarding setup failed");
    }

    tracing::info!(
        bridge = %config.network.bridge,
        data_dir = %config.data_dir.display(),
        "Daemon ready"
    );

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    tracing::info!("Received shutdown signal, cleaning up...");

    driver.shutdown_all().await;

    tracing::info!("Daemon shutdown complete");
    Ok(())
}
