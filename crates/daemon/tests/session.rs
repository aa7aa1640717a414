use std::fs;

use ephys_types::ImpedanceReport;
use rhythm_daemon::config::{load_config, DaemonConfig, SimulatedChipConfig, SimulationConfig};
use rhythm_daemon::session::run_session;

fn fast_simulation() -> SimulationConfig {
    SimulationConfig {
        realtime: false,
        firmware_version: (0, 5),
        chips: vec![SimulatedChipConfig {
            position: "B1".into(),
            model: "rhd2216".into(),
            good_delays: vec![6, 7, 8],
            impedance_ohms: 150_000.0,
        }],
    }
}

#[tokio::test]
async fn test_session_streams_requested_batches() {
    let config = DaemonConfig { batches: 5, simulation: fast_simulation(), ..Default::default() };
    let board = config.simulation.build().unwrap();

    let summary = run_session(&config, &board, std::future::pending()).await.unwrap();
    assert_eq!(summary.electrode_channels, 16);
    assert_eq!(summary.batches, 5);
    assert_eq!(summary.samples, 5 * 128);
    assert!(summary.impedance_report.is_none());
}

#[tokio::test]
async fn test_session_writes_impedance_report() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("z.json");
    let config = DaemonConfig {
        batches: 1,
        impedance_out: Some(out.to_string_lossy().into_owned()),
        simulation: fast_simulation(),
        ..Default::default()
    };
    let board = config.simulation.build().unwrap();

    let summary = run_session(&config, &board, std::future::pending()).await.unwrap();
    assert_eq!(summary.impedance_report.as_deref(), Some(out.as_path()));

    let report = ImpedanceReport::read_from(&out).unwrap();
    let b1 = report.impedances.iter().find(|h| h.name == "B1").unwrap();
    assert_eq!(b1.channels.len(), 16);
    assert!(b1.channels.iter().all(|c| (c.magnitude - 150_000.0).abs() < 45_000.0));
}

#[tokio::test]
async fn test_session_stops_on_shutdown() {
    let config = DaemonConfig { batches: 0, simulation: fast_simulation(), ..Default::default() };
    let board = config.simulation.build().unwrap();

    let shutdown = tokio::time::sleep(std::time::Duration::from_millis(100));
    let summary = run_session(&config, &board, shutdown).await.unwrap();
    assert!(summary.batches > 0);
}

#[tokio::test]
async fn test_session_without_board_fails() {
    let mut config = DaemonConfig { simulation: fast_simulation(), ..Default::default() };
    config.batches = 1;
    let board = config.simulation.build().unwrap();
    board.set_present(false);

    assert!(run_session(&config, &board, std::future::pending()).await.is_err());
}

#[test]
fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rhythm_config.json");

    assert_eq!(load_config(&path).unwrap(), DaemonConfig::default());

    let mut config = DaemonConfig::default();
    config.board.sample_rate_index = 9;
    config.measure_impedance = true;
    fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
    assert_eq!(load_config(&path).unwrap(), config);

    fs::write(&path, "{ not json").unwrap();
    assert!(load_config(&path).is_err());
}
