pub mod config;
pub mod datalog_writer;
pub mod mcm;
pub mod monitor;
pub mod options;
pub mod prelude;
pub mod transport;

// Get the package version from Cargo.toml
const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::prelude::*;

use crate::datalog_writer::DatalogWriter;
use crate::mcm::protocol::Engine;
use crate::mcm::registry::Registry;
use crate::monitor::Monitor;
use std::time::Duration;

/// Assembles the registry, transport, engine and csv writer, then hands
/// them to the monitor until shutdown is signalled.
pub async fn app(shutdown_rx: broadcast::Receiver<()>, config: Config) -> Result<()> {
    let mut registry = Registry::with_builtin();
    match registry.load_catalog(&config.catalog_file()) {
        Ok(true) => info!("Loaded parameter catalog from {}", config.catalog_file()),
        Ok(false) => info!(
            "No saved catalog at {}, using built-in parameters",
            config.catalog_file()
        ),
        Err(err) => warn!("Ignoring unusable catalog: {}", err),
    }

    let transport = transport::from_config(config.serial());
    let engine = Engine::new(
        transport,
        registry,
        Duration::from_millis(config.response_timeout_ms()),
    );

    let csv_path = config
        .csv_file()
        .unwrap_or_else(DatalogWriter::default_path);
    let writer = DatalogWriter::new(&csv_path)?;

    let mut monitor = Monitor::new(engine, writer, config);
    monitor.start(shutdown_rx).await
}

/// Application entry point: load configuration, set up logging and the
/// shutdown signals, then run the monitor.
pub async fn run(options: Options) -> Result<()> {
    let config = match Config::new(options.config_file.clone()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load config from {}: {:?}", options.config_file, err);
            std::process::exit(255);
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.loglevel()))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .init();

    info!(
        "mcm-bridge {} starting with config file {}",
        CARGO_PKG_VERSION, options.config_file
    );
    config.log_summary();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    // Set up signal handlers for graceful shutdown
    let ctrlc_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl+c: {}", e);
        }
        let _ = ctrlc_tx.send(());
    });

    if let Some(seconds) = options.runtime {
        let timer_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(seconds)).await;
            info!("Runtime limit of {}s reached, shutting down", seconds);
            let _ = timer_tx.send(());
        });
    }

    app(shutdown_rx, config).await
}
