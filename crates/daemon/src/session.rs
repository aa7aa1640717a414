//! One acquisition session: open, scan, optional impedance run, stream.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use boards::rhythm::RhythmDevice;
use ephys_types::ChannelKind;
use sensors::oni::OniConnector;

use crate::config::DaemonConfig;

const IMPEDANCE_POLL: Duration = Duration::from_millis(50);

/// What a finished session saw.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSummary {
    pub electrode_channels: usize,
    pub total_channels: usize,
    pub batches: u64,
    pub samples: u64,
    pub impedance_report: Option<PathBuf>,
}

/// Runs a session against `connector` until the configured batch count is
/// reached or `shutdown` resolves.
pub async fn run_session(
    config: &DaemonConfig,
    connector: &dyn OniConnector,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<SessionSummary> {
    let mut device = RhythmDevice::new(config.board.clone());
    let found = device.open(connector, |e| {
        tracing::error!("Acquisition board not available: {}", e);
        false
    })?;
    if !found {
        bail!("No acquisition board found");
    }

    let mut summary = SessionSummary {
        electrode_channels: device.num_data_outputs(ChannelKind::Electrode),
        total_channels: device.num_channels(),
        ..Default::default()
    };
    for (i, hs) in device.headstages().iter().enumerate().filter(|(_, h)| h.is_connected()) {
        tracing::info!("Headstage {} ({}): {} channels", i, hs.prefix(), hs.num_active_channels());
    }

    if config.measure_impedance || config.impedance_out.is_some() {
        device.run_impedance_test()?;
        while !device.poll_impedance_test() {
            tokio::time::sleep(IMPEDANCE_POLL).await;
        }
        if let Some(out) = &config.impedance_out {
            let path = PathBuf::from(out);
            device
                .save_impedances(&path)
                .with_context(|| format!("Could not save impedances to '{}'", path.display()))?;
            summary.impedance_report = Some(path);
        }
    }

    let rx = device.start_acquisition()?;
    tokio::pin!(shutdown);
    let result = loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested.");
                break Ok(());
            }
            msg = rx.recv_async() => match msg {
                Ok(Ok(batch)) => {
                    summary.batches += 1;
                    summary.samples += batch.num_samples() as u64;
                    if summary.batches % 100 == 0 {
                        tracing::debug!("{} batches, last timestamp {:?}", summary.batches, batch.timestamps.last());
                    }
                    if config.batches > 0 && summary.batches >= config.batches {
                        break Ok(());
                    }
                }
                Ok(Err(e)) => break Err(anyhow::Error::new(e).context("Acquisition failed")),
                Err(_) => break Err(anyhow::anyhow!("Acquisition thread exited")),
            }
        }
    };

    device.stop_acquisition()?;
    tracing::info!(
        "Session finished: {} batches, {} samples on {} channels",
        summary.batches,
        summary.samples,
        summary.total_channels
    );
    result.map(|_| summary)
}
