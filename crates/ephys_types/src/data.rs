use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Represents errors that can occur while streaming from the device.
///
/// These errors are intended to be propagated to the consumer of a sample
/// stream so it can report the state of the hardware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum SensorError {
    /// A hardware-related fault.
    #[error("Sensor hardware fault: {0}")]
    HardwareFault(String),
    /// The consumer fell behind and a batch was dropped.
    #[error("Sensor buffer overrun")]
    BufferOverrun,
    /// The device was disconnected.
    #[error("Sensor disconnected")]
    Disconnected,
    /// A driver-level error.
    #[error("Driver error: {0}")]
    DriverError(String),
}

/// Metadata describing the layout of a decoded sample stream.
///
/// Shared via an `Arc` so that every batch is self-describing without
/// copying the channel list.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StreamMeta {
    /// Human readable name of the source device.
    pub source_type: String,
    /// Per-channel sample rate in Hz.
    pub sample_rate: f32,
    /// Number of electrode channels at the start of each sample.
    pub num_electrode_channels: usize,
    /// Number of auxiliary channels following the electrode channels.
    pub num_aux_channels: usize,
    /// Number of board ADC channels following the aux channels.
    pub num_adc_channels: usize,
    /// Names of all continuous channels, in sample order.
    #[serde(default)]
    pub channel_names: Vec<String>,
}

impl StreamMeta {
    pub fn num_channels(&self) -> usize {
        self.num_electrode_channels + self.num_aux_channels + self.num_adc_channels
    }
}

impl Default for StreamMeta {
    fn default() -> Self {
        Self {
            source_type: "rhythm".to_string(),
            sample_rate: 30_000.0,
            num_electrode_channels: 0,
            num_aux_channels: 0,
            num_adc_channels: 0,
            channel_names: Vec::new(),
        }
    }
}

/// A batch of decoded samples.
///
/// `samples` is sample-major: all channels of sample 0, then all channels of
/// sample 1, and so on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleBatch {
    /// Monotonic batch counter since acquisition start.
    pub batch_id: u64,
    /// Hardware sample counter of every sample in the batch.
    pub timestamps: Vec<u32>,
    /// Decoded channel values.
    pub samples: Vec<f32>,
    /// One 16-bit TTL input word per sample.
    pub ttl_words: Vec<u16>,
    /// Layout of `samples`.
    pub meta: Arc<StreamMeta>,
}

impl SampleBatch {
    pub fn num_samples(&self) -> usize {
        self.timestamps.len()
    }

    /// Returns all channel values of one sample.
    pub fn sample(&self, index: usize) -> Option<&[f32]> {
        let n = self.meta.num_channels();
        let start = index.checked_mul(n)?;
        self.samples.get(start..start + n)
    }

    /// Returns one channel across the whole batch.
    pub fn channel(&self, channel: usize) -> Vec<f32> {
        let n = self.meta.num_channels();
        if channel >= n {
            return Vec::new();
        }
        self.samples.iter().skip(channel).step_by(n).copied().collect()
    }
}
