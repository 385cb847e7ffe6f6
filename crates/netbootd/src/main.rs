use std::sync::Arc;

use nb_common::config::EnvConfig;
use nb_common::BackendSyncer;
use nb_dnsmasq::{DnsmasqBackend, DnsmasqConfig};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,nb_dnsmasq=debug")),
        )
        .init();

    info!("netbootd starting...");

    let env = EnvConfig::from_env();
    let mut config = DnsmasqConfig::load(&env.config_path)?;
    if let Some(root_dir) = env.root_dir {
        config.root_dir = root_dir;
    }

    info!(
        "Config loaded: root {}, TFTP {}, HTTP {}, auto-assign {}",
        config.root_dir.display(),
        config.tftp_server,
        config.http_server,
        if config.auto_assign { "enabled" } else { "disabled" },
    );

    let backend = Arc::new(DnsmasqBackend::new(config).await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = {
        let backend = Arc::clone(&backend);
        tokio::spawn(async move { backend.start(shutdown_rx).await })
    };

    let mut signals = Signals::new([SIGHUP, SIGINT, SIGTERM])?;
    let handle = signals.handle();

    info!("netbootd started, watching leases and netboot config");

    while let Some(signal) = signals.next().await {
        if signal == SIGHUP {
            info!("Received SIGHUP, reloading leases and netboot config...");
            if let Err(e) = backend.sync().await {
                error!("Reload failed: {}", e);
            }
        } else {
            info!("Received signal {}, shutting down", signal);
            break;
        }
    }

    handle.close();
    let _ = shutdown_tx.send(true);
    if let Err(e) = runner.await {
        error!("Backend task failed: {}", e);
    }
    backend.close().await?;

    info!("netbootd stopped");
    Ok(())
}
