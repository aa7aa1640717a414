use std::fs;
use std::path::Path;

use anyhow::{bail, Context};
use boards::rhythm::BoardSettings;
use sensors::mock_rhythm::{MockRhythm, MockRhythmConfig, SimulatedChip};
use sensors::oni::registers::DataSource;
use serde::{Deserialize, Serialize};

/// Port positions in scan order.
const POSITION_LABELS: [&str; 8] = ["A1", "A2", "B1", "B2", "C1", "C2", "D1", "D2"];

/// Amplifier chip placed on the simulated board.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SimulatedChipConfig {
    /// Port position, `A1` .. `D2`.
    pub position: String,
    /// `rhd2132`, `rhd2216` or `rhd2164`.
    pub model: String,
    /// Cable delay settings at which the chip answers.
    #[serde(default = "default_good_delays")]
    pub good_delays: Vec<u32>,
    /// Electrode impedance seen on every channel, in ohms.
    #[serde(default = "default_impedance")]
    pub impedance_ohms: f64,
}

fn default_good_delays() -> Vec<u32> {
    vec![4, 5, 6]
}

fn default_impedance() -> f64 {
    100_000.0
}

impl SimulatedChipConfig {
    pub fn source(&self) -> anyhow::Result<DataSource> {
        POSITION_LABELS
            .iter()
            .position(|label| label.eq_ignore_ascii_case(&self.position))
            .map(|i| DataSource::ALL[i])
            .with_context(|| format!("Unknown headstage position '{}'", self.position))
    }

    pub fn chip(&self) -> anyhow::Result<SimulatedChip> {
        let chip = match self.model.to_ascii_lowercase().as_str() {
            "rhd2132" => SimulatedChip::rhd2132(&self.good_delays),
            "rhd2216" => SimulatedChip::rhd2216(&self.good_delays),
            "rhd2164" => SimulatedChip::rhd2164(&self.good_delays),
            other => bail!("Unknown amplifier chip model '{}'", other),
        };
        Ok(chip.with_impedance(self.impedance_ohms))
    }
}

/// Simulated board the daemon drives when no hardware transport is wired in.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    /// Pace frames at the configured sample rate.
    pub realtime: bool,
    pub firmware_version: (u8, u8),
    pub chips: Vec<SimulatedChipConfig>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            realtime: true,
            firmware_version: (0, 5),
            chips: vec![SimulatedChipConfig {
                position: "A1".into(),
                model: "rhd2132".into(),
                good_delays: default_good_delays(),
                impedance_ohms: default_impedance(),
            }],
        }
    }
}

impl SimulationConfig {
    pub fn build(&self) -> anyhow::Result<MockRhythm> {
        let mut config = MockRhythmConfig {
            realtime: self.realtime,
            firmware_version: self.firmware_version,
            ..Default::default()
        };
        for chip in &self.chips {
            config = config.with_chip(chip.source()?, chip.chip()?);
        }
        Ok(MockRhythm::new(config))
    }
}

/// Configuration for the daemon
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Batches to stream before stopping; 0 streams until interrupted.
    pub batches: u64,
    /// Run an impedance measurement before streaming.
    pub measure_impedance: bool,
    /// Where to write the impedance report, if anywhere.
    pub impedance_out: Option<String>,
    pub board: BoardSettings,
    pub simulation: SimulationConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            batches: 100,
            measure_impedance: false,
            impedance_out: None,
            board: BoardSettings::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

/// Loads the configuration at `path`; a missing file yields the defaults.
pub fn load_config(path: &Path) -> anyhow::Result<DaemonConfig> {
    if !path.exists() {
        tracing::warn!("No configuration at {}; using defaults", path.display());
        return Ok(DaemonConfig::default());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Could not read configuration file at '{}'", path.display()))?;
    let config = serde_json::from_str(&contents)
        .with_context(|| format!("Could not parse configuration file at '{}'", path.display()))?;
    tracing::info!("Loaded configuration from {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: DaemonConfig = serde_json::from_str(
            r#"{ "batches": 5, "board": { "acquire_adc": true },
                 "simulation": { "chips": [ { "position": "c2", "model": "RHD2216" } ] } }"#,
        )
        .unwrap();
        assert_eq!(config.batches, 5);
        assert!(config.board.acquire_adc);
        assert_eq!(config.board.sample_rate_index, BoardSettings::default().sample_rate_index);
        assert!(config.simulation.realtime);
        let chip = &config.simulation.chips[0];
        assert_eq!(chip.source().unwrap(), DataSource::PortC2);
        assert_eq!(chip.good_delays, vec![4, 5, 6]);
        assert!(chip.chip().is_ok());
    }

    #[test]
    fn test_unknown_chip_and_position_are_rejected() {
        let chip = SimulatedChipConfig {
            position: "E1".into(),
            model: "rhd2000".into(),
            good_delays: vec![],
            impedance_ohms: 1.0,
        };
        assert!(chip.source().is_err());
        assert!(chip.chip().is_err());
    }
}
