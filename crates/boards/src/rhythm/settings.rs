//! Board-level settings held by the device controller.

use ephys_types::{AdcRange, BoardVariant, ChannelNamingScheme};
use serde::{Deserialize, Serialize};

use super::board::{NUM_PORTS, SAMPLE_RATE_30K};

/// Amplifier filter settings. Values are the requested ones; the device
/// reports what the chip can actually realise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DspSettings {
    pub enabled: bool,
    /// DSP offset removal cutoff in Hz.
    pub cutoff_freq: f64,
    pub upper_bandwidth: f64,
    pub lower_bandwidth: f64,
}

impl Default for DspSettings {
    fn default() -> Self {
        Self { enabled: true, cutoff_freq: 0.5, upper_bandwidth: 7500.0, lower_bandwidth: 1.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardSettings {
    pub variant: BoardVariant,
    pub acquire_aux: bool,
    pub acquire_adc: bool,
    pub fast_settle_enabled: bool,
    /// Fast settle driven by a TTL input line.
    pub fast_ttl_settle_enabled: bool,
    pub fast_settle_ttl_channel: u32,
    /// TTL outputs follow the DAC thresholds.
    pub ttl_mode: bool,
    pub dsp: DspSettings,
    pub noise_slicer_level: u32,
    pub dac_hpf_enabled: bool,
    pub dac_hpf_cutoff: f64,
    /// Index into the sample rate table restored after scans.
    pub sample_rate_index: usize,
    /// Cable length per port A..D, in meters.
    pub cable_length_meters: [f64; NUM_PORTS],
    pub leds_enabled: bool,
    /// Sync clock output divide factor as written to the board.
    pub clock_divide_factor: u32,
    pub naming_scheme: ChannelNamingScheme,
    pub adc_ranges: [AdcRange; 8],
}

impl Default for BoardSettings {
    fn default() -> Self {
        Self {
            variant: BoardVariant::AcquisitionBoard,
            acquire_aux: false,
            acquire_adc: false,
            fast_settle_enabled: false,
            fast_ttl_settle_enabled: false,
            fast_settle_ttl_channel: 0,
            ttl_mode: false,
            dsp: DspSettings::default(),
            noise_slicer_level: 0,
            dac_hpf_enabled: false,
            dac_hpf_cutoff: 300.0,
            sample_rate_index: SAMPLE_RATE_30K,
            cable_length_meters: [0.914; NUM_PORTS],
            leds_enabled: true,
            clock_divide_factor: 0,
            naming_scheme: ChannelNamingScheme::GlobalIndex,
            adc_ranges: [AdcRange::Bipolar5V; 8],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_fills_defaults() {
        let settings: BoardSettings =
            serde_json::from_str(r#"{ "acquire_aux": true, "dsp": { "cutoff_freq": 2.0 } }"#).unwrap();
        assert!(settings.acquire_aux);
        assert_eq!(settings.dsp.cutoff_freq, 2.0);
        assert_eq!(settings.dsp.upper_bandwidth, 7500.0);
        assert_eq!(settings.cable_length_meters, [0.914; 4]);
        assert_eq!(settings.sample_rate_index, SAMPLE_RATE_30K);
    }
}
