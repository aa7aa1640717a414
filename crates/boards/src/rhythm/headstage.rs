//! One physical connector position and the channels it carries.

use ephys_types::{ChannelNamingScheme, ImpedanceSample, Impedances};
use sensors::oni::registers::DataSource;

const PREFIXES: [&str; 16] = [
    "A1", "A2", "B1", "B2", "C1", "C2", "D1", "D2", "E1", "E2", "F1", "F2", "G1", "G2", "H1", "H2",
];

/// A headstage position carrying zero, one or two data streams.
///
/// Channel names are regenerated only when a value they depend on actually
/// changes, so repeated setter calls leave the name list untouched.
#[derive(Debug, Clone)]
pub struct Headstage {
    source: DataSource,
    num_streams: usize,
    channels_per_stream: usize,
    half_channels: bool,
    stream_index: Option<usize>,
    first_channel: usize,
    naming_scheme: ChannelNamingScheme,
    channel_names: Vec<String>,
    impedances: Vec<ImpedanceSample>,
}

impl Headstage {
    pub fn new(source: DataSource) -> Self {
        Self {
            source,
            num_streams: 0,
            channels_per_stream: 32,
            half_channels: false,
            stream_index: None,
            first_channel: 0,
            naming_scheme: ChannelNamingScheme::GlobalIndex,
            channel_names: Vec::new(),
            impedances: Vec::new(),
        }
    }

    /// Port position label, `A1` .. `H2`.
    pub fn prefix(&self) -> &'static str {
        PREFIXES[self.source.index() as usize % PREFIXES.len()]
    }

    pub fn source(&self) -> DataSource {
        self.source
    }

    /// Hardware data source feeding stream `offset` (0 or 1) of this headstage.
    pub fn data_source(&self, offset: usize) -> DataSource {
        match offset {
            1 => self.source.with_offset(1).unwrap_or(self.source),
            _ => self.source,
        }
    }

    pub fn set_num_streams(&mut self, num: usize) {
        if num == 2 {
            self.half_channels = false;
        }
        if self.num_streams != num {
            self.num_streams = num;
            self.generate_channel_names();
        }
    }

    pub fn num_streams(&self) -> usize {
        self.num_streams
    }

    pub fn set_channels_per_stream(&mut self, channels: usize) {
        if self.channels_per_stream != channels {
            self.channels_per_stream = channels;
            self.generate_channel_names();
        }
    }

    pub fn channels_per_stream(&self) -> usize {
        self.channels_per_stream
    }

    /// Slot of this headstage's first data stream.
    pub fn set_first_stream_index(&mut self, index: usize) {
        self.stream_index = Some(index);
    }

    /// Slot of stream `offset`, if the headstage has been assigned one.
    pub fn stream_index(&self, offset: usize) -> Option<usize> {
        self.stream_index.map(|s| s + offset)
    }

    /// Global index of this headstage's first channel.
    pub fn set_first_channel(&mut self, channel: usize) {
        if self.first_channel != channel {
            self.first_channel = channel;
            if self.naming_scheme == ChannelNamingScheme::GlobalIndex {
                self.generate_channel_names();
            }
        }
    }

    pub fn first_channel(&self) -> usize {
        self.first_channel
    }

    pub fn num_channels(&self) -> usize {
        self.channels_per_stream * self.num_streams
    }

    /// Halves the active channels; ignored on a 64-channel headstage.
    pub fn set_half_channels(&mut self, half: bool) {
        if self.num_channels() == 64 {
            return;
        }
        if self.half_channels != half {
            self.half_channels = half;
            self.generate_channel_names();
        }
    }

    pub fn half_channels(&self) -> bool {
        self.half_channels
    }

    pub fn num_active_channels(&self) -> usize {
        self.num_channels() / if self.half_channels { 2 } else { 1 }
    }

    pub fn is_connected(&self) -> bool {
        self.num_streams > 0
    }

    pub fn set_naming_scheme(&mut self, scheme: ChannelNamingScheme) {
        if self.naming_scheme != scheme {
            self.naming_scheme = scheme;
            self.generate_channel_names();
        }
    }

    pub fn naming_scheme(&self) -> ChannelNamingScheme {
        self.naming_scheme
    }

    /// Name of channel `index`, or `" "` when out of range.
    pub fn channel_name(&self, index: usize) -> &str {
        self.channel_names.get(index).map(String::as_str).unwrap_or(" ")
    }

    pub fn channel_names(&self) -> &[String] {
        &self.channel_names
    }

    pub fn set_channel_name(&mut self, index: usize, name: impl Into<String>) {
        if let Some(slot) = self.channel_names.get_mut(index) {
            *slot = name.into();
        }
    }

    fn generate_channel_names(&mut self) {
        let count = self.num_active_channels();
        self.channel_names = match self.naming_scheme {
            ChannelNamingScheme::GlobalIndex => {
                (0..count).map(|i| format!("CH{}", self.first_channel + i + 1)).collect()
            }
            ChannelNamingScheme::StreamIndex => {
                let prefix = self.prefix();
                (0..count).map(|i| format!("{}_CH{}", prefix, i + 1)).collect()
            }
        };
    }

    /// Picks this headstage's entries out of a measurement result set.
    pub fn set_impedances(&mut self, results: &Impedances) {
        self.impedances.clear();
        let Some(first) = self.stream_index else {
            return;
        };
        self.impedances.extend(
            results
                .samples
                .iter()
                .filter(|s| s.stream == first || (self.num_streams == 2 && s.stream == first + 1))
                .copied(),
        );
    }

    pub fn num_impedances(&self) -> usize {
        self.impedances.len()
    }

    /// Magnitude in ohms for channel `index`; 0 when not measured.
    pub fn impedance_magnitude(&self, index: usize) -> f32 {
        self.impedances.get(index).map(|s| s.magnitude).unwrap_or(0.0)
    }

    /// Phase in degrees for channel `index`; 0 when not measured.
    pub fn impedance_phase(&self, index: usize) -> f32 {
        self.impedances.get(index).map(|s| s.phase).unwrap_or(0.0)
    }

    /// Returns to the disconnected state; names and impedances are cleared.
    pub fn reset(&mut self) {
        self.stream_index = None;
        self.set_num_streams(0);
        self.impedances.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample(stream: usize, channel: usize, magnitude: f32) -> ImpedanceSample {
        ImpedanceSample { stream, channel, magnitude, phase: -30.0 }
    }

    #[test]
    fn test_global_names_follow_first_channel() {
        let mut hs = Headstage::new(DataSource::PortB1);
        hs.set_num_streams(1);
        hs.set_channels_per_stream(16);
        hs.set_first_channel(32);
        assert_eq!(hs.channel_names().len(), 16);
        assert_eq!(hs.channel_name(0), "CH33");
        assert_eq!(hs.channel_name(16), " ");
    }

    #[test]
    fn test_stream_names_use_port_prefix() {
        let mut hs = Headstage::new(DataSource::PortC2);
        hs.set_num_streams(1);
        hs.set_naming_scheme(ChannelNamingScheme::StreamIndex);
        assert_eq!(hs.prefix(), "C2");
        assert_eq!(hs.channel_name(31), "C2_CH32");
    }

    #[test]
    fn test_unchanged_values_keep_custom_names() {
        let mut hs = Headstage::new(DataSource::PortA1);
        hs.set_num_streams(1);
        hs.set_channel_name(0, "ref");
        hs.set_num_streams(1);
        hs.set_channels_per_stream(32);
        hs.set_half_channels(false);
        hs.set_naming_scheme(ChannelNamingScheme::GlobalIndex);
        assert_eq!(hs.channel_name(0), "ref");
        hs.set_half_channels(true);
        assert_eq!(hs.channel_name(0), "CH1");
    }

    #[test]
    fn test_two_streams_clear_half_and_ignore_halving() {
        let mut hs = Headstage::new(DataSource::PortD1);
        hs.set_num_streams(1);
        hs.set_half_channels(true);
        hs.set_num_streams(2);
        assert!(!hs.half_channels());
        hs.set_half_channels(true);
        assert_eq!(hs.num_active_channels(), 64);
        assert_eq!(hs.data_source(1), DataSource::PortD1Ddr);
        assert_eq!(hs.data_source(7), DataSource::PortD1);
    }

    #[test]
    fn test_impedances_attach_to_own_streams() {
        let results = Impedances {
            valid: true,
            samples: vec![sample(0, 0, 1.0), sample(1, 0, 2.0), sample(2, 0, 3.0), sample(1, 1, 4.0)],
        };
        let mut single = Headstage::new(DataSource::PortA1);
        single.set_num_streams(1);
        single.set_first_stream_index(1);
        single.set_impedances(&results);
        assert_eq!(single.num_impedances(), 2);
        assert_eq!(single.impedance_magnitude(1), 4.0);
        assert_eq!(single.impedance_magnitude(5), 0.0);

        let mut dual = Headstage::new(DataSource::PortB1);
        dual.set_num_streams(2);
        dual.set_first_stream_index(1);
        dual.set_impedances(&results);
        assert_eq!(dual.num_impedances(), 3);
        assert_eq!(dual.impedance_phase(2), -30.0);
    }

    #[test]
    fn test_unassigned_headstage_takes_no_impedances() {
        let results = Impedances { valid: true, samples: vec![sample(0, 0, 1.0)] };
        let mut hs = Headstage::new(DataSource::PortA2);
        hs.set_impedances(&results);
        assert_eq!(hs.num_impedances(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Streams(usize),
        Channels(usize),
        Half(bool),
        First(usize),
        Scheme(bool),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..=2).prop_map(Op::Streams),
            prop_oneof![Just(16usize), Just(32usize)].prop_map(Op::Channels),
            any::<bool>().prop_map(Op::Half),
            (0usize..512).prop_map(Op::First),
            any::<bool>().prop_map(Op::Scheme),
        ]
    }

    proptest! {
        #[test]
        fn prop_active_channel_count_holds_after_every_mutation(ops in prop::collection::vec(op(), 1..40)) {
            let mut hs = Headstage::new(DataSource::PortA1);
            for op in ops {
                match op {
                    Op::Streams(n) => hs.set_num_streams(n),
                    Op::Channels(c) => hs.set_channels_per_stream(c),
                    Op::Half(h) => hs.set_half_channels(h),
                    Op::First(f) => hs.set_first_channel(f),
                    Op::Scheme(s) => hs.set_naming_scheme(if s {
                        ChannelNamingScheme::StreamIndex
                    } else {
                        ChannelNamingScheme::GlobalIndex
                    }),
                }
                let expected = hs.channels_per_stream() * hs.num_streams() / if hs.half_channels() { 2 } else { 1 };
                prop_assert_eq!(hs.num_active_channels(), expected);
                prop_assert_eq!(hs.is_connected(), hs.num_streams() > 0);
            }
        }
    }
}
