//! Channel and event metadata exposed to downstream consumers
//!
//! The board layer regenerates these descriptors whenever the channel
//! topology changes (scan, headstage enable, aux/adc toggles).

use serde::{Deserialize, Serialize};

/// Kind of a continuous channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelKind {
    Electrode,
    Aux,
    Adc,
}

/// Measured electrode impedance attached to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelImpedance {
    /// Magnitude in ohms.
    pub magnitude: f32,
    /// Phase in degrees.
    pub phase: f32,
}

/// Descriptor of one continuous channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuousChannelInfo {
    pub kind: ChannelKind,
    pub name: String,
    pub description: String,
    pub identifier: String,
    /// Units per LSB of the raw hardware value.
    pub scale: f32,
    pub units: String,
    #[serde(default)]
    pub impedance: Option<ChannelImpedance>,
}

/// Descriptor of the TTL event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventChannelInfo {
    pub name: String,
    pub description: String,
    pub identifier: String,
    /// Number of digital lines carried by the event word.
    pub num_lines: usize,
    pub line_names: Vec<String>,
}

/// Full channel layout of a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelLayout {
    pub continuous: Vec<ContinuousChannelInfo>,
    pub events: Vec<EventChannelInfo>,
}

impl ChannelLayout {
    pub fn count(&self, kind: ChannelKind) -> usize {
        self.continuous.iter().filter(|c| c.kind == kind).count()
    }
}
