//! Configuration enums shared between the board layer and its consumers

use serde::{Deserialize, Serialize};

/// How electrode channels are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ChannelNamingScheme {
    /// `CH1`, `CH2`, ... numbered across all connected headstages.
    #[default]
    GlobalIndex,
    /// `A1_CH1`, `A1_CH2`, ... numbered within each headstage.
    StreamIndex,
}

/// Which product runs the Rhythm gateware.
///
/// Both variants share the same register protocol; the tag only changes
/// how the device identifies itself in metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum BoardVariant {
    #[default]
    AcquisitionBoard,
    RecordingController,
}

impl BoardVariant {
    pub fn display_name(&self) -> &'static str {
        match self {
            BoardVariant::AcquisitionBoard => "Acquisition Board",
            BoardVariant::RecordingController => "RHD Recording Controller",
        }
    }
}

/// Input range of a board ADC channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum AdcRange {
    /// +/-5 V bipolar input.
    #[default]
    Bipolar5V,
    /// 0-5 V unipolar input.
    Unipolar5V,
}

impl AdcRange {
    /// Volts per LSB for this range.
    pub fn bit_volts(&self) -> f32 {
        match self {
            AdcRange::Bipolar5V => 0.000_152_587_89,
            AdcRange::Unipolar5V => 0.000_305_175_78,
        }
    }
}
