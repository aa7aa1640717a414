//! Headstage detection by sweeping the MISO sampling delay.
//!
//! For every delay setting the board runs a short command sequence that
//! reads the chip ROM through aux slot 3. Chips answer with `INTAN`/`RHD`
//! only when sampled at a usable delay, so counting the delays with a valid
//! signature both detects chips and picks a robust cable delay.

use log::{debug, info};

use sensors::oni::registers::DataSource;
use sensors::rhd2000::sequences::{
    ROM_CHIP_ID_INDEX, ROM_CHIP_NAME_INDEX, ROM_COMPANY_NAME_INDEX, ROM_REGISTER_59_INDEX,
};
use sensors::rhd2000::{
    CHIP_ID_RHD2132, CHIP_ID_RHD2164, CHIP_ID_RHD2164_B, CHIP_ID_RHD2216, REGISTER_59_MISO_A, ROM_CHIP_NAME,
    ROM_COMPANY_NAME,
};
use sensors::DriverError;

use super::board::{AuxCmdSlot, RhythmBoard, MAX_NUM_DATA_STREAMS, NUM_PORTS};
use super::decoder::{DataBlock, StreamLayout};

/// Samples acquired per delay setting.
pub const INIT_STEP: usize = 64;
pub const NUM_DELAYS: u32 = 16;
/// Headstage positions probed: A1, A2 .. D2.
pub const NUM_SCAN_POSITIONS: usize = 8;

/// Chip identity read from the ROM of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipSignature {
    pub chip_id: i32,
    pub register_59: i32,
}

impl ChipSignature {
    /// Chips the scan accepts; only the MISO A half of an RHD2164 counts.
    pub fn is_supported(&self) -> bool {
        self.chip_id == CHIP_ID_RHD2132
            || self.chip_id == CHIP_ID_RHD2216
            || (self.chip_id == CHIP_ID_RHD2164 && self.register_59 == REGISTER_59_MISO_A)
    }
}

/// Reads the ROM signature of `stream` out of a scan run.
///
/// `reg_offset` is 1 on firmware that reports aux results one sample late.
/// Returns `None` when the `INTAN`/`RHD` check fails.
pub fn read_chip_signature(block: &DataBlock, stream: usize, reg_offset: usize) -> Option<ChipSignature> {
    let trace = block.aux.get(2)?.get(stream)?;
    let at = |index: usize| trace.get(index + reg_offset).copied();
    let byte_at = |index: usize| at(index).map(|w| (w & 0xFF) as u8);

    let company = ROM_COMPANY_NAME
        .iter()
        .enumerate()
        .all(|(i, &c)| byte_at(ROM_COMPANY_NAME_INDEX + i) == Some(c));
    let name = ROM_CHIP_NAME
        .iter()
        .enumerate()
        .all(|(i, &c)| byte_at(ROM_CHIP_NAME_INDEX + i) == Some(c));
    if !(company && name) {
        return None;
    }

    Some(ChipSignature {
        chip_id: at(ROM_CHIP_ID_INDEX)? as i32,
        register_59: at(ROM_REGISTER_59_INDEX)? as i32,
    })
}

/// Good delays recorded for one headstage position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DelayHits {
    pub count: u32,
    pub first: Option<u32>,
    pub second: Option<u32>,
    /// Chip id seen at the first or second good delay; 0 when none.
    pub chip_id: i32,
}

impl DelayHits {
    pub fn record(&mut self, delay: u32, chip_id: i32) {
        self.count += 1;
        if self.first.is_none() {
            self.first = Some(delay);
            self.chip_id = chip_id;
        } else if self.second.is_none() {
            self.second = Some(delay);
            self.chip_id = chip_id;
        }
    }

    /// First good delay for one or two hits, the second for more, else 0.
    pub fn optimum_delay(&self) -> u32 {
        match self.count {
            0 => 0,
            1 | 2 => self.first.unwrap_or(0),
            _ => self.second.unwrap_or(0),
        }
    }
}

/// Delay for `port`: the larger optimum of its two positions.
pub fn port_delay(hits: &[DelayHits; NUM_SCAN_POSITIONS], port: usize) -> u32 {
    hits[2 * port].optimum_delay().max(hits[2 * port + 1].optimum_delay())
}

/// Stream assignment for one detected headstage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadstagePlan {
    /// Index into the headstage table (same as the scan position).
    pub headstage: usize,
    pub num_streams: usize,
    pub channels_per_stream: usize,
}

/// Allocates data streams to detected chips in position order.
///
/// An RHD2164 takes two streams while at least two remain; otherwise it
/// gets a single stream. Returns the plans and the per-stream layout.
pub fn plan_streams(hits: &[DelayHits; NUM_SCAN_POSITIONS]) -> (Vec<HeadstagePlan>, Vec<StreamLayout>) {
    let mut plans = Vec::new();
    let mut streams: Vec<StreamLayout> = Vec::new();

    for (headstage, hit) in hits.iter().enumerate() {
        if hit.chip_id <= 0 || streams.len() >= MAX_NUM_DATA_STREAMS {
            continue;
        }
        let (num_streams, channels) = match hit.chip_id {
            CHIP_ID_RHD2164 if streams.len() < MAX_NUM_DATA_STREAMS - 1 => (2, 32),
            CHIP_ID_RHD2164 => (1, 32),
            CHIP_ID_RHD2132 => (1, 32),
            _ => (1, 16),
        };
        streams.push(StreamLayout { chip_id: hit.chip_id, channels });
        if num_streams == 2 {
            streams.push(StreamLayout { chip_id: CHIP_ID_RHD2164_B, channels });
        }
        plans.push(HeadstagePlan { headstage, num_streams, channels_per_stream: channels });
    }
    (plans, streams)
}

/// Runs the 16-step delay sweep. The board must already hold the register
/// configuration list in AuxCmd3 bank 0.
pub fn sweep_delays(board: &mut RhythmBoard, reg_offset: usize) -> Result<[DelayHits; NUM_SCAN_POSITIONS], DriverError> {
    for (stream, &source) in DataSource::ALL[..NUM_SCAN_POSITIONS].iter().enumerate() {
        board.set_data_source(stream, source)?;
        board.enable_data_stream(stream, true)?;
    }
    for stream in NUM_SCAN_POSITIONS..MAX_NUM_DATA_STREAMS {
        board.enable_data_stream(stream, false)?;
    }
    board.update_stream_block_size()?;
    debug!("Scanning with {} enabled data streams", board.num_enabled_data_streams());

    board.select_aux_command_bank_all_ports(AuxCmdSlot::AuxCmd3, 0)?;
    board.set_max_samples(INIT_STEP)?;
    board.set_continuous_run_mode(false)?;

    let mut hits = [DelayHits::default(); NUM_SCAN_POSITIONS];
    info!("Checking for connected amplifier chips...");

    for delay in 0..NUM_DELAYS {
        for port in 0..NUM_PORTS {
            board.set_cable_delay(port, delay as i32)?;
        }
        board.run()?;
        let frames = board.read_frames(INIT_STEP);
        board.stop()?;
        let block = DataBlock::from_frames(&frames?, NUM_SCAN_POSITIONS)?;

        for (position, hit) in hits.iter_mut().enumerate() {
            if let Some(signature) = read_chip_signature(&block, position, reg_offset) {
                if signature.is_supported() {
                    debug!("Delay {}: chip id {} on {:?}", delay, signature.chip_id, DataSource::ALL[position]);
                    hit.record(delay, signature.chip_id);
                }
            }
        }
    }
    Ok(hits)
}
