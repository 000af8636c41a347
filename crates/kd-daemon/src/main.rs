//! kindling daemon: serves the environment API and terminal WebSocket.

use anyhow::Result;
use kd_daemon::daemon::{load_config, Daemon, CONFIG_ENV_VAR};
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let explicit = std::env::var_os(CONFIG_ENV_VAR).map(Into::into);
    let config = load_config(explicit)?;

    kd_telemetry::logging::init(
        "kindling",
        &config.daemon.log_level,
        config.daemon.log_json,
    );
    info!(version = env!("CARGO_PKG_VERSION"), "kindling daemon starting");

    let daemon = Daemon::new(config);
    let shutdown = daemon.shutdown_handle();

    // Wire ctrl-c to trigger graceful shutdown.
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    daemon.run().await
}
