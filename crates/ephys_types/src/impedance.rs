//! Electrode impedance results and their export document

use serde::{Deserialize, Serialize};
use std::path::Path;

/// One measured channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImpedanceSample {
    /// Hardware data stream the channel was measured on.
    pub stream: usize,
    /// Channel address on the chip.
    pub channel: usize,
    /// Magnitude in ohms.
    pub magnitude: f32,
    /// Phase in degrees.
    pub phase: f32,
}

/// Result set of one impedance run.
///
/// `valid` is only set once every channel of every connected chip has been
/// measured; a default or cancelled run stays invalid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Impedances {
    pub valid: bool,
    pub samples: Vec<ImpedanceSample>,
}

impl Impedances {
    /// Samples belonging to one data stream, in measurement order.
    pub fn for_stream(&self, stream: usize) -> impl Iterator<Item = &ImpedanceSample> {
        self.samples.iter().filter(move |s| s.stream == stream)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ImpedanceExportError {
    #[error("No valid impedance measurement to export")]
    NotValid,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One channel entry of the export document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelImpedanceRecord {
    pub name: String,
    /// Global channel number across all headstages.
    pub number: usize,
    pub magnitude: f32,
    pub phase: f32,
}

/// One headstage entry of the export document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadstageImpedanceRecord {
    pub name: String,
    pub channels: Vec<ChannelImpedanceRecord>,
}

/// Hierarchical impedance document: headstages, then their channels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImpedanceReport {
    pub impedances: Vec<HeadstageImpedanceRecord>,
}

impl ImpedanceReport {
    pub fn to_json(&self) -> Result<String, ImpedanceExportError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), ImpedanceExportError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn read_from(path: impl AsRef<Path>) -> Result<Self, ImpedanceExportError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_stream_filters_in_order() {
        let imp = Impedances {
            valid: true,
            samples: vec![
                ImpedanceSample { stream: 0, channel: 0, magnitude: 1.0, phase: 0.0 },
                ImpedanceSample { stream: 1, channel: 0, magnitude: 2.0, phase: 0.0 },
                ImpedanceSample { stream: 0, channel: 1, magnitude: 3.0, phase: 0.0 },
            ],
        };
        let mags: Vec<f32> = imp.for_stream(0).map(|s| s.magnitude).collect();
        assert_eq!(mags, vec![1.0, 3.0]);
    }

    #[test]
    fn test_report_file_roundtrip() {
        let report = ImpedanceReport {
            impedances: vec![HeadstageImpedanceRecord {
                name: "A1".to_string(),
                channels: vec![ChannelImpedanceRecord {
                    name: "CH1".to_string(),
                    number: 0,
                    magnitude: 1.5e5,
                    phase: -45.0,
                }],
            }],
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("impedances.json");
        report.write_to(&path).unwrap();
        assert_eq!(ImpedanceReport::read_from(&path).unwrap(), report);
    }
}
