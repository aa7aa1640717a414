use std::path::PathBuf;

use clap::{Arg, Command};
use rhythm_daemon::config::load_config;
use rhythm_daemon::session::run_session;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rhythm_daemon=debug,boards=info,sensors=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Rhythm daemon starting...");

    let matches = Command::new("rhythm_daemon")
        .about("Rhythm FPGA acquisition daemon")
        .arg(
            Arg::new("config")
                .long("config")
                .default_value("./rhythm_config.json")
                .help("Path to the JSON configuration"),
        )
        .arg(
            Arg::new("batches")
                .long("batches")
                .value_parser(clap::value_parser!(u64))
                .help("Batches to stream; 0 streams until Ctrl-C"),
        )
        .arg(
            Arg::new("impedance-out")
                .long("impedance-out")
                .help("Measure impedances and write the report to this file"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(PathBuf::from).unwrap_or_default();
    let mut config = load_config(&config_path)?;
    if let Some(&batches) = matches.get_one::<u64>("batches") {
        config.batches = batches;
    }
    if let Some(out) = matches.get_one::<String>("impedance-out") {
        config.impedance_out = Some(out.clone());
    }

    let board = config.simulation.build()?;
    tracing::info!("Using simulated Rhythm board with {} chips", config.simulation.chips.len());

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let summary = run_session(&config, &board, shutdown).await?;
    if let Some(path) = &summary.impedance_report {
        tracing::info!("Impedance report written to {}", path.display());
    }

    tracing::info!("Rhythm daemon stopped gracefully.");
    Ok(())
}
