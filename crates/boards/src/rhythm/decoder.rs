//! Rhythm frame demultiplexing.
//!
//! Payload layout after the 8-byte hub timestamp, all little endian:
//!
//! | bytes            | content                                  |
//! |------------------|------------------------------------------|
//! | 8                | magic `0xc691199927021942`               |
//! | 4                | sample counter                           |
//! | 2 x 3 x ns       | aux command results, slot-major          |
//! | 2 x 32 x ns      | amplifier words, channel-major           |
//! | 2 x ns           | filler                                   |
//! | 2 x 8            | board ADCs                               |
//! | 2                | TTL in                                   |
//! | 2                | TTL out                                  |

use std::sync::Arc;

use ephys_types::{AdcRange, SampleBatch, StreamMeta};
use log::error;

use sensors::oni::{OniFrame, RHYTHM_FRAME_MAGIC};
use sensors::rhd2000::{
    AMPLIFIER_UV_PER_BIT, AUX_MV_PER_BIT, CHIP_ID_RHD2132, CHIP_ID_RHD2164_B, RHD2132_16CH_OFFSET,
};
use sensors::DriverError;

/// Samples decoded per streaming-loop iteration.
pub const SAMPLES_PER_BATCH: usize = 128;
pub const NUM_ADC_CHANNELS: usize = 8;
const AUX_SLOTS: usize = 3;
const CHANNELS_PER_STREAM: usize = 32;
const MAGIC_OFFSET: usize = 0;
const TIMESTAMP_OFFSET: usize = 8;
const AUX_OFFSET: usize = 12;

/// What one enabled data stream carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLayout {
    /// Chip id seen during the last scan; `CHIP_ID_RHD2164_B` for the
    /// second MISO line of an RHD2164.
    pub chip_id: i32,
    /// Channels decoded from this stream (16 or 32).
    pub channels: usize,
}

/// Payload bytes of one frame with `num_streams` enabled streams.
pub fn frame_len(num_streams: usize) -> usize {
    AUX_OFFSET + 2 * (AUX_SLOTS * num_streams + CHANNELS_PER_STREAM * num_streams + num_streams + NUM_ADC_CHANNELS + 2)
}

fn word(payload: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([payload[offset], payload[offset + 1]])
}

fn check_frame(payload: &[u8], num_streams: usize) -> Result<(), DriverError> {
    let expected = frame_len(num_streams);
    if payload.len() < expected {
        return Err(DriverError::FramingError(format!(
            "Frame payload of {} bytes, expected {} for {} streams",
            payload.len(),
            expected,
            num_streams
        )));
    }
    let mut magic = [0u8; 8];
    magic.copy_from_slice(&payload[MAGIC_OFFSET..MAGIC_OFFSET + 8]);
    let magic = u64::from_le_bytes(magic);
    if magic != RHYTHM_FRAME_MAGIC {
        return Err(DriverError::FramingError(format!("Incorrect frame header 0x{:016x}", magic)));
    }
    Ok(())
}

fn timestamp(payload: &[u8]) -> u32 {
    u32::from_le_bytes([
        payload[TIMESTAMP_OFFSET],
        payload[TIMESTAMP_OFFSET + 1],
        payload[TIMESTAMP_OFFSET + 2],
        payload[TIMESTAMP_OFFSET + 3],
    ])
}

/// Converts a batch of Rhythm frames into decoded samples.
///
/// Aux inputs are sampled once every four frames; the decoder holds the last
/// complete set and repeats it so every sample carries all three values.
pub struct FrameDecoder {
    streams: Vec<StreamLayout>,
    acquire_aux: bool,
    acquire_adc: bool,
    adc_ranges: [AdcRange; NUM_ADC_CHANNELS],
    aux_samples: Vec<[f32; AUX_SLOTS]>,
    aux_hold: Vec<[f32; AUX_SLOTS]>,
    meta: Arc<StreamMeta>,
    next_batch_id: u64,
}

impl FrameDecoder {
    pub fn new(
        streams: Vec<StreamLayout>,
        acquire_aux: bool,
        acquire_adc: bool,
        adc_ranges: [AdcRange; NUM_ADC_CHANNELS],
        meta: Arc<StreamMeta>,
    ) -> Self {
        let n = streams.len();
        Self {
            streams,
            acquire_aux,
            acquire_adc,
            adc_ranges,
            aux_samples: vec![[0.0; AUX_SLOTS]; n],
            aux_hold: vec![[0.0; AUX_SLOTS]; n],
            meta,
            next_batch_id: 0,
        }
    }

    pub fn num_streams(&self) -> usize {
        self.streams.len()
    }

    /// Channels produced per sample.
    pub fn num_channels(&self) -> usize {
        let electrodes: usize = self.streams.iter().map(|s| s.channels).sum();
        let aux = if self.acquire_aux {
            AUX_SLOTS * self.streams.iter().filter(|s| s.chip_id != CHIP_ID_RHD2164_B).count()
        } else {
            0
        };
        let adc = if self.acquire_adc { NUM_ADC_CHANNELS } else { 0 };
        electrodes + aux + adc
    }

    pub fn meta(&self) -> &Arc<StreamMeta> {
        &self.meta
    }

    /// Decodes `frames` in order. Any bad frame fails the whole batch.
    pub fn decode_batch(&mut self, frames: &[OniFrame]) -> Result<SampleBatch, DriverError> {
        let n = frames.len();
        let width = self.num_channels();
        let mut batch = SampleBatch {
            batch_id: self.next_batch_id,
            timestamps: Vec::with_capacity(n),
            samples: Vec::with_capacity(n * width),
            ttl_words: Vec::with_capacity(n),
            meta: Arc::clone(&self.meta),
        };

        for (samp, frame) in frames.iter().enumerate() {
            let (ts, ttl) = self.decode_frame(frame.payload(), samp, &mut batch.samples).map_err(|e| {
                error!("Aborting batch {} at sample {}: {}", self.next_batch_id, samp, e);
                e
            })?;
            batch.timestamps.push(ts);
            batch.ttl_words.push(ttl);
        }

        self.next_batch_id += 1;
        Ok(batch)
    }

    /// Appends one sample's channel values to `out`; returns the hardware
    /// timestamp and the TTL input word.
    fn decode_frame(&mut self, payload: &[u8], samp: usize, out: &mut Vec<f32>) -> Result<(u32, u16), DriverError> {
        let ns = self.streams.len();
        check_frame(payload, ns)?;
        let ts = timestamp(payload);

        let mut index = AUX_OFFSET + 2 * AUX_SLOTS * ns;
        for (stream, layout) in self.streams.iter().enumerate() {
            let mut chan_index = index + 2 * stream;
            if layout.chip_id == CHIP_ID_RHD2132 && layout.channels == 16 {
                chan_index += 2 * RHD2132_16CH_OFFSET * ns;
            }
            for _ in 0..layout.channels {
                out.push((word(payload, chan_index) as f32 - 32768.0) * AMPLIFIER_UV_PER_BIT);
                chan_index += 2 * ns;
            }
        }
        index += 2 * CHANNELS_PER_STREAM * ns;

        if self.acquire_aux {
            // aux inputs are converted by the second command slot
            let mut aux_index = AUX_OFFSET + 2 * ns;
            let aux_num = (samp + 3) % 4;
            for (stream, layout) in self.streams.iter().enumerate() {
                if layout.chip_id != CHIP_ID_RHD2164_B {
                    if aux_num < AUX_SLOTS {
                        self.aux_samples[stream][aux_num] =
                            (word(payload, aux_index) as f32 - 32768.0) * AUX_MV_PER_BIT;
                    } else {
                        self.aux_hold[stream] = self.aux_samples[stream];
                    }
                    out.extend_from_slice(&self.aux_hold[stream]);
                }
                aux_index += 2;
            }
        }
        index += 2 * ns;

        if self.acquire_adc {
            for range in self.adc_ranges {
                let raw = word(payload, index) as f32;
                out.push(match range {
                    AdcRange::Bipolar5V => range.bit_volts() * raw - 5.0 - 0.4096,
                    // literal scaling; half of this would match a 0-5 V span
                    AdcRange::Unipolar5V => range.bit_volts() * raw,
                });
                index += 2;
            }
        } else {
            index += 2 * NUM_ADC_CHANNELS;
        }

        Ok((ts, word(payload, index)))
    }
}

/// Raw contents of a run of frames, as used by the scan and impedance
/// routines.
///
/// `aux[slot][stream][t]` holds aux command results; `amplifier[ch][stream][t]`
/// holds amplifier words.
#[derive(Debug, Clone, Default)]
pub struct DataBlock {
    pub timestamps: Vec<u32>,
    pub aux: Vec<Vec<Vec<u16>>>,
    pub amplifier: Vec<Vec<Vec<u16>>>,
    pub ttl_in: Vec<u16>,
}

impl DataBlock {
    pub fn from_frames(frames: &[OniFrame], num_streams: usize) -> Result<Self, DriverError> {
        let n = frames.len();
        let mut block = DataBlock {
            timestamps: Vec::with_capacity(n),
            aux: vec![vec![Vec::with_capacity(n); num_streams]; AUX_SLOTS],
            amplifier: vec![vec![Vec::with_capacity(n); num_streams]; CHANNELS_PER_STREAM],
            ttl_in: Vec::with_capacity(n),
        };

        for frame in frames {
            let payload = frame.payload();
            check_frame(payload, num_streams)?;
            block.timestamps.push(timestamp(payload));

            let mut index = AUX_OFFSET;
            for slot in 0..AUX_SLOTS {
                for stream in 0..num_streams {
                    block.aux[slot][stream].push(word(payload, index));
                    index += 2;
                }
            }
            for ch in 0..CHANNELS_PER_STREAM {
                for stream in 0..num_streams {
                    block.amplifier[ch][stream].push(word(payload, index));
                    index += 2;
                }
            }
            index += 2 * num_streams + 2 * NUM_ADC_CHANNELS;
            block.ttl_in.push(word(payload, index));
        }
        Ok(block)
    }

    pub fn num_samples(&self) -> usize {
        self.timestamps.len()
    }

    /// Amplifier trace of one channel on one stream, in microvolts.
    pub fn amplifier_microvolts(&self, channel: usize, stream: usize) -> Vec<f64> {
        self.amplifier
            .get(channel)
            .and_then(|c| c.get(stream))
            .map(|trace| {
                trace.iter().map(|&raw| (raw as f64 - 32768.0) * AMPLIFIER_UV_PER_BIT as f64).collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};
    use sensors::oni::registers::DEVICE_RHYTHM;

    /// Builds a frame where stream `s` channel `c` carries `amp(s, c)` and
    /// stream `s` aux slot `k` carries `aux(s, k)`.
    fn frame(
        sample: u32,
        ns: usize,
        amp: impl Fn(usize, usize) -> u16,
        aux: impl Fn(usize, usize) -> u16,
        adc: [u16; 8],
        ttl_in: u16,
    ) -> OniFrame {
        let mut data = BytesMut::new();
        data.put_u64_le(sample as u64);
        data.put_u64_le(RHYTHM_FRAME_MAGIC);
        data.put_u32_le(sample);
        for k in 0..3 {
            for s in 0..ns {
                data.put_u16_le(aux(s, k));
            }
        }
        for c in 0..32 {
            for s in 0..ns {
                data.put_u16_le(amp(s, c));
            }
        }
        for _ in 0..ns {
            data.put_u16_le(0);
        }
        for v in adc {
            data.put_u16_le(v);
        }
        data.put_u16_le(ttl_in);
        data.put_u16_le(0);
        OniFrame { time: sample as u64, dev_idx: DEVICE_RHYTHM, data: data.freeze() }
    }

    fn decoder(streams: Vec<StreamLayout>, aux: bool, adc: bool) -> FrameDecoder {
        FrameDecoder::new(streams, aux, adc, [AdcRange::Bipolar5V; 8], Arc::new(StreamMeta::default()))
    }

    const RHD2132: StreamLayout = StreamLayout { chip_id: CHIP_ID_RHD2132, channels: 32 };

    #[test]
    fn test_amplifier_values_are_exact() {
        let mut dec = decoder(vec![RHD2132, RHD2132], false, false);
        let raw = |s: usize, c: usize| (30000 + 100 * s + c) as u16;
        let frames: Vec<OniFrame> = (0..4).map(|t| frame(t, 2, raw, |_, _| 0, [0; 8], 0)).collect();
        let batch = dec.decode_batch(&frames).unwrap();
        assert_eq!(batch.num_samples(), 4);
        assert_eq!(batch.timestamps, vec![0, 1, 2, 3]);
        let sample = &batch.samples[..64];
        for s in 0..2 {
            for c in 0..32 {
                let expected = (raw(s, c) as f32 - 32768.0) * 0.195;
                assert_eq!(sample[32 * s + c], expected);
            }
        }
    }

    #[test]
    fn test_rhd2132_sixteen_channel_offset() {
        let layout = StreamLayout { chip_id: CHIP_ID_RHD2132, channels: 16 };
        let mut dec = decoder(vec![layout], false, false);
        let frames = vec![frame(0, 1, |_, c| 32768 + c as u16, |_, _| 0, [0; 8], 0)];
        let batch = dec.decode_batch(&frames).unwrap();
        assert_eq!(batch.samples.len(), 16);
        assert_eq!(batch.samples[0], 8.0 * 0.195);
        assert_eq!(batch.samples[15], 23.0 * 0.195);
    }

    #[test]
    fn test_aux_values_hold_for_four_samples() {
        let mut dec = decoder(vec![RHD2132], true, false);
        let aux = |t: u32| move |_: usize, k: usize| if k == 1 { 32768 + 100 * t as u16 } else { 0 };
        let frames: Vec<OniFrame> =
            (0..12).map(|t| frame(t, 1, |_, _| 32768, aux(t), [0; 8], 0)).collect();
        let batch = dec.decode_batch(&frames).unwrap();
        assert_eq!(batch.samples.len(), 12 * 35);
        let aux_of = |t: usize| batch.sample(t).map(|s| s[32..35].to_vec()).unwrap_or_default();
        // samples 1..3 of a cycle fill the buffer, sample 4 publishes it
        let expected: Vec<f32> = [1u16, 2, 3].iter().map(|&t| (100 * t) as f32 * 0.0000374).collect();
        assert_eq!(aux_of(4), expected);
        for t in 5..8 {
            assert_eq!(aux_of(t), aux_of(4));
        }
        assert_ne!(aux_of(8), aux_of(4));
    }

    #[test]
    fn test_second_rhd2164_stream_has_no_aux() {
        let streams = vec![
            StreamLayout { chip_id: 4, channels: 32 },
            StreamLayout { chip_id: CHIP_ID_RHD2164_B, channels: 32 },
        ];
        let mut dec = decoder(streams, true, false);
        assert_eq!(dec.num_channels(), 67);
        let frames = vec![frame(0, 2, |_, _| 32768, |_, _| 32768, [0; 8], 0)];
        assert_eq!(dec.decode_batch(&frames).unwrap().samples.len(), 67);
    }

    #[test]
    fn test_adc_ranges_and_ttl_word() {
        let mut dec = FrameDecoder::new(
            vec![RHD2132],
            false,
            true,
            [AdcRange::Bipolar5V, AdcRange::Unipolar5V, AdcRange::Bipolar5V, AdcRange::Bipolar5V,
             AdcRange::Bipolar5V, AdcRange::Bipolar5V, AdcRange::Bipolar5V, AdcRange::Bipolar5V],
            Arc::new(StreamMeta::default()),
        );
        let frames = vec![frame(0, 1, |_, _| 32768, |_, _| 0, [32768, 1000, 0, 0, 0, 0, 0, 0], 0xA5)];
        let batch = dec.decode_batch(&frames).unwrap();
        let s = batch.sample(0).map(|s| s.to_vec()).unwrap_or_default();
        assert_eq!(s.len(), 40);
        assert!((s[32] - (0.00015258789 * 32768.0 - 5.0 - 0.4096)).abs() < 1e-6);
        assert!((s[33] - 0.00030517578 * 1000.0).abs() < 1e-6);
        assert_eq!(batch.ttl_words, vec![0xA5]);
    }

    #[test]
    fn test_ttl_word_found_with_adcs_disabled() {
        let mut dec = decoder(vec![RHD2132], false, false);
        let frames = vec![frame(0, 1, |_, _| 32768, |_, _| 0, [7; 8], 0x0F0F)];
        assert_eq!(dec.decode_batch(&frames).unwrap().ttl_words, vec![0x0F0F]);
    }

    #[test]
    fn test_bad_magic_fails_the_batch() {
        let mut dec = decoder(vec![RHD2132], false, false);
        let good = frame(0, 1, |_, _| 32768, |_, _| 0, [0; 8], 0);
        let mut raw = good.data.to_vec();
        raw[8] ^= 0xFF;
        let bad = OniFrame { time: 1, dev_idx: DEVICE_RHYTHM, data: raw.into() };
        let err = dec.decode_batch(&[good.clone(), bad, good]).unwrap_err();
        assert!(matches!(err, DriverError::FramingError(_)));
        // the failed batch does not consume a batch id
        assert_eq!(dec.decode_batch(&[frame(1, 1, |_, _| 32768, |_, _| 0, [0; 8], 0)]).unwrap().batch_id, 0);
    }

    #[test]
    fn test_data_block_matrices() {
        let frames: Vec<OniFrame> = (0..3)
            .map(|t| frame(t, 2, |s, c| (s * 1000 + c) as u16, |s, k| (10 * s + k) as u16 + t as u16, [0; 8], 3))
            .collect();
        let block = DataBlock::from_frames(&frames, 2).unwrap();
        assert_eq!(block.num_samples(), 3);
        assert_eq!(block.aux[2][1], vec![12, 13, 14]);
        assert_eq!(block.amplifier[5][1], vec![1005; 3]);
        assert_eq!(block.ttl_in, vec![3; 3]);
        assert_eq!(block.amplifier_microvolts(0, 0)[0], -32768.0 * 0.195f32 as f64);
    }
}
