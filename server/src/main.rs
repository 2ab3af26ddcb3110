use anyhow::{Context, Result};
use gpgbridge_common::{platform_socket::ensure_directory, BridgeConfig};
use gpgbridge_server::{AgentSupervisor, InstanceGuard, SupervisorEvent};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = BridgeConfig::from_env().context("Failed to load configuration")?;
    init_logging(cfg.gui.debug);

    ensure_directory(&cfg.gui.home)
        .with_context(|| format!("Failed to create {}", cfg.gui.home.display()))?;

    let Some(_instance) = InstanceGuard::acquire(&cfg.gui.home)
        .with_context(|| format!("Failed to take the instance lock in {}", cfg.gui.home.display()))?
    else {
        info!("Another gpgbridge instance is already running, exiting");
        return Ok(());
    };

    let (events, rx) = mpsc::channel(16);
    {
        let events = events.clone();
        ctrlc::set_handler(move || {
            info!("Received shutdown signal, stopping bridge...");
            let _ = events.try_send(SupervisorEvent::Stop);
        })
        .context("Failed to set signal handler")?;
    }

    let supervisor = AgentSupervisor::new(cfg);
    if let Err(e) = supervisor.start().await {
        error!("Startup failed: {e}");
        supervisor.stop().await;
        return Err(e).context("Failed to start bridge");
    }
    info!("Bridge running:\n{}", supervisor.status());

    // Keeps the channel open until a Stop arrives
    let _events = events;
    supervisor.run(rx).await;

    info!("Final status:\n{}", supervisor.status());
    Ok(())
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
