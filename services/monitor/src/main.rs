// monitor: Bridges a machine control server onto the telemetry bus.

use mb_core::RedisBus;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "monitor starting");

    let cfg = match std::env::args().nth(1) {
        Some(path) => monitor::config::load_config_from_path(std::path::Path::new(&path)),
        None => monitor::config::load_config(),
    };
    let cfg = match cfg {
        Ok(cfg) => {
            info!(
                machine = %cfg.machine.name,
                host = %cfg.machine.host,
                channel = %cfg.bus.channel,
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let bus = match RedisBus::connect(&cfg.bus.host, cfg.bus.port, cfg.bus.db).await {
        Ok(bus) => bus,
        Err(e) => {
            eprintln!("FATAL: failed to reach the bus: {}", e);
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    monitor::supervisor::run(&cfg, bus, shutdown_rx).await;
    info!("monitor stopped");
}
