//! Register file, command RAM and frame synthesis of the simulated board.

use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use log::{debug, trace};

use super::chip::ChipState;
use super::MockRhythmConfig;
use crate::oni::registers::*;
use crate::oni::{ContextOption, OniFrame, ONI_EINVALSTATE, ONI_EREADFAILURE, RHYTHM_FRAME_MAGIC};
use crate::types::DriverError;

const NUM_STREAMS: u32 = 16;
const NUM_PORTS: usize = 4;

pub(super) struct MockState {
    pub(super) config: MockRhythmConfig,
    registers: HashMap<(u32, u32), u32>,
    chips: Vec<Option<ChipState>>,
    pub(super) acquiring: bool,
    started_at: Option<Instant>,
    sample: u32,
    hub_time: u64,
    ttl_out: u16,
    clock_busy_reads: u32,
    mem_init_reads: u32,
    pub(super) fail_frame_reads: bool,
    pub(super) register_writes: Vec<(u32, u32, u32)>,
    pub(super) frame_writes: Vec<(u32, Vec<u8>)>,
    pub(super) connections: usize,
}

impl MockState {
    pub(super) fn new(config: MockRhythmConfig) -> Self {
        let mut chips: Vec<Option<ChipState>> = vec![None; 8];
        for (source, chip) in &config.chips {
            if let Some(slot) = chips.get_mut(source.index() as usize) {
                *slot = Some(ChipState::new(chip.clone()));
            }
        }
        let mem_init_reads = config.mem_init_reads;
        Self {
            config,
            registers: HashMap::new(),
            chips,
            acquiring: false,
            started_at: None,
            sample: 0,
            hub_time: 0,
            ttl_out: 0,
            clock_busy_reads: 0,
            mem_init_reads,
            fail_frame_reads: false,
            register_writes: Vec::new(),
            frame_writes: Vec::new(),
            connections: 0,
        }
    }

    pub(super) fn peek(&self, dev_idx: u32, addr: u32) -> u32 {
        *self.registers.get(&(dev_idx, addr)).unwrap_or(&0)
    }

    fn rhythm(&self, addr: u32) -> u32 {
        self.peek(DEVICE_RHYTHM, addr)
    }

    pub(super) fn read_register(&mut self, dev_idx: u32, addr: u32) -> Result<u32, DriverError> {
        let value = match (dev_idx, addr) {
            (DEVICE_BOARD_INFO, BOARD_FIRMWARE_VERSION) => {
                let (major, minor) = self.config.firmware_version;
                ((major as u32) << 8) | minor as u32
            }
            (DEVICE_BOARD_INFO, BOARD_MEM_STATE) => {
                if self.mem_init_reads > 0 {
                    self.mem_init_reads -= 1;
                    BoardMemState::Init as u32
                } else {
                    self.config.mem_state as u32
                }
            }
            (RHYTHM_HUB_MANAGER, HUB_CLOCK_BUSY) => {
                if self.clock_busy_reads > 0 {
                    if self.config.clock_busy_reads.is_some() {
                        self.clock_busy_reads -= 1;
                    }
                    1
                } else {
                    0
                }
            }
            (DEVICE_RHYTHM, SPI_RUNNING) => (self.acquiring && self.continuous()) as u32,
            _ => self.peek(dev_idx, addr),
        };
        Ok(value)
    }

    pub(super) fn write_register(&mut self, dev_idx: u32, addr: u32, value: u32) -> Result<(), DriverError> {
        if (dev_idx, addr) == (RHYTHM_HUB_MANAGER, HUB_CLOCK_SEL) {
            self.clock_busy_reads = self.config.clock_busy_reads.unwrap_or(u32::MAX);
        }
        self.registers.insert((dev_idx, addr), value);
        self.register_writes.push((dev_idx, addr, value));
        Ok(())
    }

    pub(super) fn write_frame(&mut self, dev_idx: u32, payload: &[u8]) -> Result<(), DriverError> {
        trace!("mock frame write to 0x{:04x}: {} bytes", dev_idx, payload.len());
        if dev_idx == DEVICE_TTL && payload.len() >= 4 {
            self.ttl_out = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as u16;
        }
        self.frame_writes.push((dev_idx, payload.to_vec()));
        Ok(())
    }

    pub(super) fn set_option(&mut self, option: ContextOption, value: u32) -> Result<(), DriverError> {
        match option {
            ContextOption::Reset => {
                self.acquiring = false;
                self.sample = 0;
            }
            ContextOption::ResetAcqCounter => {
                debug!("mock board run, max timestep {}", self.rhythm(MAX_TIMESTEP));
                self.acquiring = true;
                self.started_at = Some(Instant::now());
                self.sample = 0;
            }
            ContextOption::Running => {
                self.acquiring = value != 0;
                if !self.acquiring {
                    debug!("mock board stopped after {} samples", self.sample);
                }
            }
            ContextOption::BlockReadSize => {}
        }
        Ok(())
    }

    fn continuous(&self) -> bool {
        self.rhythm(MODE) & (1 << MODE_SPI_RUN_CONTINUOUS) != 0
    }

    /// Sample rate encoded in the hub clock register.
    pub(super) fn sample_rate(&self) -> f64 {
        let sel = match self.registers.get(&(RHYTHM_HUB_MANAGER, HUB_CLOCK_SEL)) {
            Some(&v) => v,
            None => return 30000.0,
        };
        let div_enable = sel & 1 != 0;
        let clock_sel = (sel >> 1) & 0x3;
        let divider = (sel >> 3) & 0xF;
        let base = match clock_sel {
            0 => 30000.0,
            1 => 25000.0,
            _ => 20000.0,
        };
        if div_enable {
            base / (2.0 * (divider as f64 + 1.0))
        } else {
            base
        }
    }

    /// Streams enabled in `DATA_STREAM_EN`, as (stream, source) in stream order.
    fn enabled_streams(&self) -> Vec<(u32, u32)> {
        let enabled = self.rhythm(DATA_STREAM_EN);
        (0..NUM_STREAMS)
            .filter(|s| enabled & (1 << s) != 0)
            .map(|s| {
                let sel = self.rhythm(DATA_STREAM_1_8_SEL + s / 8);
                (s, (sel >> (4 * (s % 8))) & 0xF)
            })
            .collect()
    }

    fn command_index(&self, slot: u32, sample: u32) -> u32 {
        let loop_index = self.rhythm(LOOP_AUXCMD_INDEX_1 + slot);
        let end = self.rhythm(MAX_AUXCMD_INDEX_1 + slot);
        if sample <= end {
            sample
        } else if loop_index > end {
            0
        } else {
            loop_index + (sample - end - 1) % (end - loop_index + 1)
        }
    }

    fn command_word(&self, port: usize, slot: u32, sample: u32) -> u16 {
        let bank = (self.rhythm(AUXCMD_BANK_1 + slot) >> (4 * port)) & 0xF;
        let index = self.command_index(slot, sample);
        self.rhythm(aux_command_address(slot, bank, index)) as u16
    }

    fn cable_delay(&self, port: usize) -> u32 {
        (self.rhythm(CABLE_DELAY) >> (4 * port)) & 0xF
    }

    pub(super) fn read_frame(&mut self) -> Result<OniFrame, DriverError> {
        if self.fail_frame_reads {
            return Err(DriverError::transport(ONI_EREADFAILURE, "simulated frame read failure"));
        }
        if !self.acquiring {
            return Err(DriverError::transport(ONI_EINVALSTATE, "acquisition not running"));
        }
        if !self.continuous() && self.sample >= self.rhythm(MAX_TIMESTEP) / MAX_TIMESTEP_UNITS_PER_SAMPLE {
            return Err(DriverError::transport(ONI_EREADFAILURE, "no frames pending"));
        }

        if let Some(interval) = self.config.foreign_frame_interval {
            if interval > 0 && self.hub_time % interval as u64 == interval as u64 - 1 {
                self.hub_time += 1;
                let mut data = BytesMut::with_capacity(12);
                data.put_u64_le(self.hub_time);
                data.put_u32_le(0);
                return Ok(OniFrame { time: self.hub_time, dev_idx: DEVICE_TTL, data: data.freeze() });
            }
        }

        if self.config.realtime {
            self.pace();
        }
        let frame = self.synthesize_frame();
        self.sample = self.sample.wrapping_add(1);
        self.hub_time += 1;
        Ok(frame)
    }

    fn pace(&self) {
        if let Some(start) = self.started_at {
            let due = Duration::from_secs_f64(self.sample as f64 / self.sample_rate());
            let elapsed = start.elapsed();
            if due > elapsed {
                thread::sleep(due - elapsed);
            }
        }
    }

    fn synthesize_frame(&mut self) -> OniFrame {
        let sample = self.sample;
        let sample_rate = self.sample_rate();
        let (major, minor) = self.config.firmware_version;
        let delayed = ((major as u32) << 8) + minor as u32 <= 4;

        for port in 0..NUM_PORTS {
            let commands = [0, 1, 2].map(|slot| self.command_word(port, slot, sample));
            for base in [2 * port, 2 * port + 1] {
                if let Some(chip) = self.chips[base].as_mut() {
                    chip.step(commands, sample_rate);
                }
            }
        }

        let streams = self.enabled_streams();
        let lanes: Vec<Option<(&ChipState, bool)>> = streams
            .iter()
            .map(|&(_, source)| {
                let base = (source % 8) as usize;
                let miso_b = source >= 8;
                let port = base / 2;
                self.chips[base]
                    .as_ref()
                    .filter(|c| c.chip.good_delays.contains(&self.cable_delay(port)))
                    .filter(|c| !miso_b || c.chip.chip_id == crate::rhd2000::CHIP_ID_RHD2164)
                    .map(|c| (c, miso_b))
            })
            .collect();

        let ns = lanes.len();
        let mut data = BytesMut::with_capacity(OniFrame::HUB_TIMESTAMP_BYTES + 16 + 2 * (38 * ns + 10));
        data.put_u64_le(self.hub_time);
        data.put_u64_le(RHYTHM_FRAME_MAGIC);
        data.put_u32_le(sample);
        for slot in 0..3 {
            for lane in &lanes {
                data.put_u16_le(match lane {
                    Some((chip, miso_b)) => chip.response(slot, *miso_b, delayed),
                    None => 0xFFFF,
                });
            }
        }
        for ch in 0..32 {
            for lane in &lanes {
                data.put_u16_le(match lane {
                    Some((chip, miso_b)) => chip.amplifier_word(ch + if *miso_b { 32 } else { 0 }, sample_rate),
                    None => 0xFFFF,
                });
            }
        }
        for _ in 0..ns {
            data.put_u16_le(0);
        }
        for adc in 0..8u16 {
            data.put_u16_le(self.config.adc_value.wrapping_add(adc * 256));
        }
        data.put_u16_le(self.config.ttl_in);
        data.put_u16_le(self.ttl_out);

        OniFrame { time: self.hub_time, dev_idx: DEVICE_RHYTHM, data: data.freeze() }
    }
}

/// Payload bytes of a single Rhythm frame with `num_streams` streams.
pub fn rhythm_frame_len(num_streams: usize) -> usize {
    8 + 4 + 2 * (3 * num_streams + 32 * num_streams + num_streams + 8 + 2)
}
