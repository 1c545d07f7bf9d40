use clap::{Arg, Command};
use mb_core::RedisBus;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

fn validate_interval(value: &str) -> Result<f64, String> {
    match value.parse::<f64>() {
        Ok(v) if v.is_finite() && v > 0.0 => Ok(v),
        _ => Err("Invalid interval".to_owned()),
    }
}

fn validate_port_value(value: &str) -> Result<u16, String> {
    value
        .parse::<u16>()
        .map_err(|_| "Invalid port number".to_owned())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "collector starting");

    let matches = Command::new("Machine Bridge: Events Collector")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Accumulates machine events from a TCP sink and publishes periodic snapshots")
        .arg(
            Arg::new("bind")
                .help("The address to bind the TCP sink to. Eg. 127.0.0.1:9999")
                .short('b')
                .long("bind")
                .default_value("127.0.0.1:9999"),
        )
        .arg(
            Arg::new("interval")
                .help("Seconds between snapshot publishes")
                .short('i')
                .long("interval")
                .value_parser(validate_interval)
                .default_value("5.0"),
        )
        .arg(
            Arg::new("redis_host")
                .help("The bus host")
                .long("redis-host")
                .default_value("localhost"),
        )
        .arg(
            Arg::new("redis_port")
                .help("The bus port")
                .long("redis-port")
                .value_parser(validate_port_value)
                .default_value("6379"),
        )
        .arg(
            Arg::new("redis_db")
                .help("The bus database index")
                .long("redis-db")
                .value_parser(clap::value_parser!(u32))
                .default_value("0"),
        )
        .arg(
            Arg::new("channel")
                .help("The bus channel to publish snapshots to")
                .short('c')
                .long("channel")
                .default_value("machine_events"),
        )
        .get_matches();

    let bind = matches.get_one::<String>("bind").expect("bind has a default");
    let interval = *matches
        .get_one::<f64>("interval")
        .expect("interval has a default");
    let channel = matches
        .get_one::<String>("channel")
        .expect("channel has a default")
        .clone();

    let bus = match RedisBus::connect(
        matches.get_one::<String>("redis_host").expect("default"),
        *matches.get_one::<u16>("redis_port").expect("default"),
        *matches.get_one::<u32>("redis_db").expect("default"),
    )
    .await
    {
        Ok(bus) => bus,
        Err(e) => {
            eprintln!("FATAL: failed to reach the bus: {}", e);
            std::process::exit(1);
        }
    };

    let collector = match collector::Collector::bind(bind).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("FATAL: failed to bind sink to {}: {}", bind, e);
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

    collector
        .run(bus, channel, Duration::from_secs_f64(interval), shutdown_rx)
        .await;
    info!("collector stopped");
}
