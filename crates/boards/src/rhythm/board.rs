//! Low-level Rhythm FPGA control.
//!
//! `RhythmBoard` owns the register transport exclusively and translates
//! board operations (sample rate, cable delay, stream routing, DACs, TTL)
//! into register and frame writes. It holds no policy: the device layer
//! decides when each operation runs.

use std::f64::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use sensors::oni::registers::*;
use sensors::oni::{ContextOption, OniConnector, OniFrame, RegisterTransport, ONI_EBUSYTIMEOUT};
use sensors::DriverError;

pub const MAX_NUM_DATA_STREAMS: usize = 16;
pub const NUM_PORTS: usize = 4;
pub const NUM_DACS: usize = 8;
pub const NUM_TTL_LINES: usize = 16;

/// Bytes fetched per low-level read.
pub const BLOCK_READ_SIZE: u32 = 24 * 1024;
/// Upper bound on the hub clock busy poll after a sample-rate change.
pub const CLOCK_BUSY_TIMEOUT: Duration = Duration::from_secs(2);
const CLOCK_BUSY_POLL: Duration = Duration::from_millis(1);

// Cable delay model: MISO sampling runs at 2800x the sample rate
const CABLE_VELOCITY: f64 = 0.555 * 2.99792458e8; // m/s
const XILINX_LVDS_OUTPUT_DELAY: f64 = 1.9e-9;
const XILINX_LVDS_INPUT_DELAY: f64 = 1.4e-9;
const RHD2000_DELAY: f64 = 9.0e-9;
const MISO_SETTLE_TIME: f64 = 6.7e-9;
const FIXED_DELAY: f64 = XILINX_LVDS_OUTPUT_DELAY + RHD2000_DELAY + XILINX_LVDS_INPUT_DELAY + MISO_SETTLE_TIME;
pub const FEET_TO_METERS: f64 = 0.3048;

/// One entry of the sample rate table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleRateEntry {
    pub rate: f64,
    div_enable: u32,
    clock_sel: u32,
    divider: u32,
}

impl SampleRateEntry {
    const fn new(div_enable: u32, clock_sel: u32, divider: u32, rate: f64) -> Self {
        Self { rate, div_enable, clock_sel, divider }
    }

    /// Hub clock register encoding.
    pub fn register_value(&self) -> u32 {
        ((self.divider & 0xF) << 3) + ((self.clock_sel & 0x3) << 1) + (self.div_enable & 0x1)
    }
}

/// Supported sample rates, indexed 0..=14.
pub const SAMPLE_RATES: [SampleRateEntry; 15] = [
    SampleRateEntry::new(1, 2, 9, 1000.0),
    SampleRateEntry::new(1, 1, 9, 1250.0),
    SampleRateEntry::new(1, 0, 9, 1500.0),
    SampleRateEntry::new(1, 2, 4, 2000.0),
    SampleRateEntry::new(1, 1, 4, 2500.0),
    SampleRateEntry::new(1, 0, 4, 3000.0),
    SampleRateEntry::new(1, 2, 2, 10000.0 / 3.0),
    SampleRateEntry::new(1, 2, 1, 5000.0),
    SampleRateEntry::new(1, 1, 1, 6250.0),
    SampleRateEntry::new(1, 2, 0, 10000.0),
    SampleRateEntry::new(1, 1, 0, 12500.0),
    SampleRateEntry::new(1, 0, 0, 15000.0),
    SampleRateEntry::new(0, 2, 0, 20000.0),
    SampleRateEntry::new(0, 1, 0, 25000.0),
    SampleRateEntry::new(0, 0, 0, 30000.0),
];
pub const SAMPLE_RATE_30K: usize = 14;

/// One of the three auxiliary command slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxCmdSlot {
    AuxCmd1 = 0,
    AuxCmd2 = 1,
    AuxCmd3 = 2,
}

impl AuxCmdSlot {
    fn index(self) -> u32 {
        self as u32
    }
}

/// Default stream routing: A1, B1, C1, D1, A2, B2, C2, D2, repeated.
const DEFAULT_SOURCES: [DataSource; 8] = [
    DataSource::PortA1,
    DataSource::PortB1,
    DataSource::PortC1,
    DataSource::PortD1,
    DataSource::PortA2,
    DataSource::PortB2,
    DataSource::PortC2,
    DataSource::PortD2,
];

pub struct RhythmBoard {
    transport: RegisterTransport,
    sample_rate_index: usize,
    cable_delay: [u32; NUM_PORTS],
    stream_enabled: [bool; MAX_NUM_DATA_STREAMS],
}

impl RhythmBoard {
    pub fn new(transport: RegisterTransport) -> Self {
        Self {
            transport,
            sample_rate_index: SAMPLE_RATE_30K,
            cable_delay: [0; NUM_PORTS],
            stream_enabled: [false; MAX_NUM_DATA_STREAMS],
        }
    }

    /// Acquires a hardware context through `connector`.
    pub fn open(connector: &dyn OniConnector) -> Result<Self, DriverError> {
        let ctx = connector.connect()?;
        info!("Rhythm board context opened.");
        Ok(Self::new(RegisterTransport::new(ctx)))
    }

    fn write(&mut self, addr: u32, value: u32) -> Result<(), DriverError> {
        self.transport.write(DEVICE_RHYTHM, addr, value)
    }

    fn write_masked(&mut self, addr: u32, value: u32, mask: u32) -> Result<(), DriverError> {
        self.transport.write_masked(DEVICE_RHYTHM, addr, value, mask)
    }

    /// Puts the board into its default state.
    pub fn initialize(&mut self) -> Result<(), DriverError> {
        info!("Initializing Rhythm board to defaults...");
        self.reset_board()?;
        self.set_sample_rate(SAMPLE_RATE_30K)?;

        for slot in [AuxCmdSlot::AuxCmd1, AuxCmdSlot::AuxCmd2, AuxCmdSlot::AuxCmd3] {
            self.select_aux_command_bank_all_ports(slot, 0)?;
            self.select_aux_command_length(slot, 0, 0)?;
        }

        self.set_continuous_run_mode(true)?;
        self.set_max_time_step(u32::MAX)?;

        for port in 0..NUM_PORTS {
            self.set_cable_length_feet(port, 3.0)?;
        }
        self.set_dsp_settle(false)?;

        for (stream, &source) in DEFAULT_SOURCES.iter().chain(DEFAULT_SOURCES.iter()).enumerate() {
            self.set_data_source(stream, source)?;
        }

        self.enable_data_stream(0, true)?;
        for stream in 1..MAX_NUM_DATA_STREAMS {
            self.enable_data_stream(stream, false)?;
        }
        self.update_stream_block_size()?;

        self.clear_ttl_out()?;

        for dac in 0..NUM_DACS {
            self.enable_dac(dac, false)?;
            self.select_dac_data_stream(dac, 0)?;
            self.select_dac_data_channel(dac, 0)?;
        }
        self.set_dac_manual(32768)?;
        self.set_dac_gain(0)?;
        self.set_audio_noise_suppress(0)?;
        self.set_ttl_mode(true)?;

        for dac in 0..NUM_DACS {
            self.set_dac_threshold(dac, 32768, true)?;
        }

        self.enable_external_fast_settle(false)?;
        self.set_external_fast_settle_channel(0)?;
        for port in 0..NUM_PORTS {
            self.enable_external_dig_out(port, false)?;
            self.set_external_dig_out_channel(port, 0)?;
        }

        self.enable_board_leds(true)?;
        info!("Rhythm board initialized.");
        Ok(())
    }

    pub fn reset_board(&mut self) -> Result<(), DriverError> {
        self.transport.set_option(ContextOption::Reset, 1)?;
        self.transport.set_option(ContextOption::BlockReadSize, BLOCK_READ_SIZE)
    }

    /// Programs the hub clock for rate `index` and waits for it to settle.
    pub fn set_sample_rate(&mut self, index: usize) -> Result<(), DriverError> {
        let entry = SAMPLE_RATES.get(index).copied().ok_or_else(|| {
            DriverError::out_of_range(format!("Sample rate index {} out of range 0..=14", index))
        })?;
        self.transport.write(RHYTHM_HUB_MANAGER, HUB_CLOCK_SEL, entry.register_value())?;

        let start = Instant::now();
        while self.transport.read(RHYTHM_HUB_MANAGER, HUB_CLOCK_BUSY)? != 0 {
            if start.elapsed() > CLOCK_BUSY_TIMEOUT {
                return Err(DriverError::transport(
                    ONI_EBUSYTIMEOUT,
                    format!("Hub clock still busy {:?} after selecting {} Hz", CLOCK_BUSY_TIMEOUT, entry.rate),
                ));
            }
            thread::sleep(CLOCK_BUSY_POLL);
        }

        self.sample_rate_index = index;
        debug!("Sample rate set to {:.2} Hz", entry.rate);
        Ok(())
    }

    pub fn sample_rate(&self) -> f64 {
        SAMPLE_RATES[self.sample_rate_index].rate
    }

    pub fn sample_rate_index(&self) -> usize {
        self.sample_rate_index
    }

    pub fn upload_command_list(&mut self, commands: &[u16], slot: AuxCmdSlot, bank: u32) -> Result<(), DriverError> {
        check_bank(bank)?;
        if commands.len() > 1024 {
            return Err(DriverError::out_of_range(format!(
                "Command list of {} words exceeds one bank",
                commands.len()
            )));
        }
        for (i, &word) in commands.iter().enumerate() {
            self.write(aux_command_address(slot.index(), bank, i as u32), word as u32)?;
        }
        debug!("Uploaded {} commands to {:?} bank {}", commands.len(), slot, bank);
        Ok(())
    }

    pub fn select_aux_command_bank(&mut self, port: usize, slot: AuxCmdSlot, bank: u32) -> Result<(), DriverError> {
        check_bank(bank)?;
        check_port(port)?;
        let shift = 4 * port as u32;
        self.write_masked(AUXCMD_BANK_1 + slot.index(), bank << shift, 0xF << shift)
    }

    pub fn select_aux_command_bank_all_ports(&mut self, slot: AuxCmdSlot, bank: u32) -> Result<(), DriverError> {
        for port in 0..NUM_PORTS {
            self.select_aux_command_bank(port, slot, bank)?;
        }
        Ok(())
    }

    /// Sets the loop start and last index (0..=1023) of a slot's command sequence.
    pub fn select_aux_command_length(&mut self, slot: AuxCmdSlot, loop_index: u32, end_index: u32) -> Result<(), DriverError> {
        if loop_index > 1023 || end_index > 1023 {
            return Err(DriverError::out_of_range(format!(
                "Aux command loop {} / end {} out of range 0..=1023",
                loop_index, end_index
            )));
        }
        self.write(LOOP_AUXCMD_INDEX_1 + slot.index(), loop_index)?;
        self.write(MAX_AUXCMD_INDEX_1 + slot.index(), end_index)
    }

    pub fn set_continuous_run_mode(&mut self, continuous: bool) -> Result<(), DriverError> {
        self.set_mode_bit(MODE_SPI_RUN_CONTINUOUS, continuous)
    }

    /// Raw `MAX_TIMESTEP` value, in 1/128 sample units.
    pub fn set_max_time_step(&mut self, max_time_step: u32) -> Result<(), DriverError> {
        self.write(MAX_TIMESTEP, max_time_step)
    }

    /// Samples to acquire when not in continuous mode.
    pub fn set_max_samples(&mut self, samples: usize) -> Result<(), DriverError> {
        let units = (samples as u64).saturating_mul(MAX_TIMESTEP_UNITS_PER_SAMPLE as u64).min(u32::MAX as u64);
        self.set_max_time_step(units as u32)
    }

    pub fn run(&mut self) -> Result<(), DriverError> {
        self.transport.set_option(ContextOption::ResetAcqCounter, 2)
    }

    pub fn stop(&mut self) -> Result<(), DriverError> {
        self.transport.set_option(ContextOption::Running, 0)
    }

    pub fn is_running(&mut self) -> Result<bool, DriverError> {
        Ok(self.transport.read(DEVICE_RHYTHM, SPI_RUNNING)? != 0)
    }

    /// MISO sampling delay for `port`, clamped to 0..=15.
    pub fn set_cable_delay(&mut self, port: usize, delay: i32) -> Result<(), DriverError> {
        check_port(port)?;
        if !(0..=15).contains(&delay) {
            warn!("Cable delay {} for port {} out of range; clamping to 0..=15", delay, port);
        }
        let delay = delay.clamp(0, 15) as u32;
        let shift = 4 * port as u32;
        self.write_masked(CABLE_DELAY, delay << shift, 0xF << shift)?;
        self.cable_delay[port] = delay;
        Ok(())
    }

    pub fn cable_delay(&self, port: usize) -> u32 {
        self.cable_delay.get(port).copied().unwrap_or(0)
    }

    /// Delay setting for a cable of `meters` at the current sample rate.
    pub fn cable_delay_for_length(&self, meters: f64) -> i32 {
        let t_step = 1.0 / (2800.0 * self.sample_rate());
        let time_delay = 2.0 * meters / CABLE_VELOCITY + FIXED_DELAY;
        let mut delay = (time_delay / t_step + 1.0 + 0.5).floor() as i32;
        if delay < 1 {
            delay = 1;
        }
        // one extra step of margin
        delay + 1
    }

    pub fn set_cable_length_meters(&mut self, port: usize, meters: f64) -> Result<(), DriverError> {
        let delay = self.cable_delay_for_length(meters);
        debug!("Port {} cable {:.2} m -> delay {}", port, meters, delay);
        self.set_cable_delay(port, delay)
    }

    pub fn set_cable_length_feet(&mut self, port: usize, feet: f64) -> Result<(), DriverError> {
        self.set_cable_length_meters(port, FEET_TO_METERS * feet)
    }

    /// Cable length in meters implied by a delay setting.
    pub fn estimate_cable_length_meters(&self, delay: u32) -> f64 {
        let t_step = 1.0 / (2800.0 * self.sample_rate());
        let delay = delay as f64 - 1.0;
        let distance = CABLE_VELOCITY * ((delay - 1.0) * t_step - FIXED_DELAY);
        distance.max(0.0) / 2.0
    }

    pub fn set_dsp_settle(&mut self, enabled: bool) -> Result<(), DriverError> {
        self.set_mode_bit(MODE_DSP_SETTLE, enabled)
    }

    pub fn set_data_source(&mut self, stream: usize, source: DataSource) -> Result<(), DriverError> {
        check_stream(stream)?;
        let shift = 4 * (stream % 8) as u32;
        self.write_masked(DATA_STREAM_1_8_SEL + (stream / 8) as u32, source.index() << shift, 0xF << shift)
    }

    pub fn enable_data_stream(&mut self, stream: usize, enabled: bool) -> Result<(), DriverError> {
        check_stream(stream)?;
        let bit = 1 << stream;
        self.write_masked(DATA_STREAM_EN, if enabled { bit } else { 0 }, bit)?;
        self.stream_enabled[stream] = enabled;
        Ok(())
    }

    pub fn is_stream_enabled(&self, stream: usize) -> bool {
        self.stream_enabled.get(stream).copied().unwrap_or(false)
    }

    pub fn num_enabled_data_streams(&self) -> usize {
        self.stream_enabled.iter().filter(|&&e| e).count()
    }

    /// Frame size follows the enabled streams; the context is reset to pick it up.
    pub fn update_stream_block_size(&mut self) -> Result<(), DriverError> {
        self.reset_board()
    }

    pub fn enable_dac(&mut self, dac: usize, enabled: bool) -> Result<(), DriverError> {
        check_dac(dac)?;
        self.write_masked(DAC_SEL_1 + dac as u32, if enabled { 0x0400 } else { 0 }, 0x0400)
    }

    /// DAC gain 0..=7.
    pub fn set_dac_gain(&mut self, gain: u32) -> Result<(), DriverError> {
        check_max("DAC gain", gain, 7)?;
        self.write_masked(DAC_CTL, gain << 7, 0x0380)
    }

    /// Audio noise suppression 0..=127.
    pub fn set_audio_noise_suppress(&mut self, level: u32) -> Result<(), DriverError> {
        check_max("Noise suppress level", level, 127)?;
        self.write_masked(DAC_CTL, level, 0x007F)
    }

    /// Routes `dac` to stream 0..=17 (16 and 17 are the DAC manual sources).
    pub fn select_dac_data_stream(&mut self, dac: usize, stream: u32) -> Result<(), DriverError> {
        check_dac(dac)?;
        check_max("DAC data stream", stream, 17)?;
        self.write_masked(DAC_SEL_1 + dac as u32, stream << 5, 0x1F << 5)
    }

    pub fn select_dac_data_channel(&mut self, dac: usize, channel: u32) -> Result<(), DriverError> {
        check_dac(dac)?;
        check_max("DAC data channel", channel, 31)?;
        self.write_masked(DAC_SEL_1 + dac as u32, channel, 0x1F)
    }

    pub fn enable_external_fast_settle(&mut self, enabled: bool) -> Result<(), DriverError> {
        self.write_masked(EXTERNAL_FAST_SETTLE, if enabled { 1 << 4 } else { 0 }, 1 << 4)
    }

    pub fn set_external_fast_settle_channel(&mut self, channel: u32) -> Result<(), DriverError> {
        check_max("Fast settle TTL channel", channel, 15)?;
        self.write_masked(EXTERNAL_FAST_SETTLE, channel, 0xF)
    }

    pub fn enable_external_dig_out(&mut self, port: usize, enabled: bool) -> Result<(), DriverError> {
        check_port(port)?;
        self.write_masked(EXTERNAL_DIGOUT_A + port as u32, if enabled { 1 << 4 } else { 0 }, 1 << 4)
    }

    pub fn set_external_dig_out_channel(&mut self, port: usize, channel: u32) -> Result<(), DriverError> {
        check_port(port)?;
        check_max("Digital out TTL channel", channel, 15)?;
        self.write_masked(EXTERNAL_DIGOUT_A + port as u32, channel, 0xF)
    }

    pub fn enable_dac_highpass_filter(&mut self, enabled: bool) -> Result<(), DriverError> {
        self.write_masked(HPF, if enabled { 1 << 16 } else { 0 }, 1 << 16)
    }

    /// First-order high-pass on the DAC outputs; `cutoff` in Hz.
    pub fn set_dac_highpass_filter(&mut self, cutoff: f64) -> Result<(), DriverError> {
        let b = 1.0 - (-2.0 * PI * cutoff / self.sample_rate()).exp();
        let coefficient = (65536.0 * b + 0.5).floor().clamp(1.0, 65535.0) as u32;
        self.write_masked(HPF, coefficient, 0xFFFF)
    }

    /// Threshold 0..=65535; `trigger_on_high` selects the crossing polarity.
    pub fn set_dac_threshold(&mut self, dac: usize, threshold: u32, trigger_on_high: bool) -> Result<(), DriverError> {
        check_dac(dac)?;
        check_max("DAC threshold", threshold, 65535)?;
        self.write(DAC_THRESH_1 + dac as u32, (threshold & 0xFFFF) + ((trigger_on_high as u32) << 16))
    }

    /// TTL outputs follow the DAC thresholds when `threshold_mode` is set.
    pub fn set_ttl_mode(&mut self, threshold_mode: bool) -> Result<(), DriverError> {
        self.set_mode_bit(MODE_TTL_OUT, threshold_mode)
    }

    pub fn enable_board_leds(&mut self, enabled: bool) -> Result<(), DriverError> {
        self.set_mode_bit(MODE_LED_ENABLE, enabled)
    }

    /// Sync clock output divide factor.
    pub fn set_clock_divider(&mut self, factor: u32) -> Result<(), DriverError> {
        self.write(SYNC_CLKOUT_DIVIDE, factor)
    }

    /// Drives the 16 TTL outputs; bit n is line n.
    pub fn set_ttl_out(&mut self, lines: u16) -> Result<(), DriverError> {
        let word = lines as i32;
        self.transport.write_frame(DEVICE_TTL, &word.to_le_bytes())
    }

    pub fn clear_ttl_out(&mut self) -> Result<(), DriverError> {
        self.set_ttl_out(0)
    }

    /// Level of the DAC manual channels.
    pub fn set_dac_manual(&mut self, value: u16) -> Result<(), DriverError> {
        let word = value as u32 + ((value as u32) << 16);
        let mut payload = Vec::with_capacity(16);
        for _ in 0..4 {
            payload.extend_from_slice(&word.to_le_bytes());
        }
        self.transport.write_frame(DEVICE_DAC, &payload)
    }

    /// Firmware version as (major, minor).
    pub fn firmware_version(&mut self) -> Result<(u8, u8), DriverError> {
        let value = self.transport.read(DEVICE_BOARD_INFO, BOARD_FIRMWARE_VERSION)?;
        Ok((((value >> 8) & 0xFF) as u8, (value & 0xFF) as u8))
    }

    pub fn board_mem_state(&mut self) -> Result<BoardMemState, DriverError> {
        Ok(BoardMemState::from_register(self.transport.read(DEVICE_BOARD_INFO, BOARD_MEM_STATE)?))
    }

    /// Next frame from the Rhythm device.
    pub fn read_frame(&mut self) -> Result<OniFrame, DriverError> {
        self.transport.read_device_frame(DEVICE_RHYTHM)
    }

    /// Reads `n` consecutive Rhythm frames.
    pub fn read_frames(&mut self, n: usize) -> Result<Vec<OniFrame>, DriverError> {
        (0..n).map(|_| self.read_frame()).collect()
    }

    fn set_mode_bit(&mut self, bit: u32, enabled: bool) -> Result<(), DriverError> {
        self.write_masked(MODE, if enabled { 1 << bit } else { 0 }, 1 << bit)
    }
}

/// Takes the hardware lock shared by the streaming and impedance threads.
pub fn lock_board(board: &Arc<Mutex<RhythmBoard>>) -> Result<MutexGuard<'_, RhythmBoard>, DriverError> {
    board
        .lock()
        .map_err(|_| DriverError::Other("Rhythm board lock poisoned".into()))
}

fn check_max(what: &str, value: u32, max: u32) -> Result<(), DriverError> {
    if value > max {
        return Err(DriverError::out_of_range(format!("{} {} out of range 0..={}", what, value, max)));
    }
    Ok(())
}

fn check_bank(bank: u32) -> Result<(), DriverError> {
    check_max("Command bank", bank, 15)
}

fn check_port(port: usize) -> Result<(), DriverError> {
    check_max("Port", port as u32, NUM_PORTS as u32 - 1)
}

fn check_stream(stream: usize) -> Result<(), DriverError> {
    check_max("Data stream", stream as u32, MAX_NUM_DATA_STREAMS as u32 - 1)
}

fn check_dac(dac: usize) -> Result<(), DriverError> {
    check_max("DAC channel", dac as u32, NUM_DACS as u32 - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensors::mock_rhythm::{MockRhythm, MockRhythmConfig};

    fn board() -> (MockRhythm, RhythmBoard) {
        let mock = MockRhythm::new(MockRhythmConfig::default());
        let board = RhythmBoard::open(&mock).unwrap();
        (mock, board)
    }

    #[test]
    fn test_sample_rate_register_encoding() {
        assert_eq!(SAMPLE_RATES[0].register_value(), (9 << 3) + (2 << 1) + 1);
        assert_eq!(SAMPLE_RATES[SAMPLE_RATE_30K].register_value(), 0);
        assert_eq!(SAMPLE_RATES[6].rate, 10000.0 / 3.0);
    }

    #[test]
    fn test_cable_delay_is_clamped_and_masked() {
        let (mock, mut board) = board();
        board.set_cable_delay(1, 7).unwrap();
        board.set_cable_delay(3, 22).unwrap();
        assert_eq!(board.cable_delay(3), 15);
        assert_eq!(mock.register(DEVICE_RHYTHM, CABLE_DELAY), (7 << 4) | (15 << 12));
    }

    #[test]
    fn test_cable_length_round_trip_is_close() {
        let (_, board) = board();
        let delay = board.cable_delay_for_length(0.914);
        assert_eq!(delay, 5);
        let estimate = board.estimate_cable_length_meters(delay as u32);
        assert!((estimate - 0.914).abs() < 1.0, "estimate {}", estimate);
    }

    #[test]
    fn test_stream_enable_tracks_count() {
        let (mock, mut board) = board();
        board.enable_data_stream(0, true).unwrap();
        board.enable_data_stream(5, true).unwrap();
        board.enable_data_stream(0, false).unwrap();
        assert_eq!(board.num_enabled_data_streams(), 1);
        assert_eq!(mock.register(DEVICE_RHYTHM, DATA_STREAM_EN), 1 << 5);
    }

    #[test]
    fn test_data_source_nibbles() {
        let (mock, mut board) = board();
        board.set_data_source(9, DataSource::PortC2).unwrap();
        assert_eq!(mock.register(DEVICE_RHYTHM, DATA_STREAM_9_16_SEL), 5 << 4);
    }

    #[test]
    fn test_dac_threshold_polarity_bit() {
        let (mock, mut board) = board();
        board.set_dac_threshold(2, 1000, true).unwrap();
        assert_eq!(mock.register(DEVICE_RHYTHM, DAC_THRESH_1 + 2), 1000 + (1 << 16));
        assert!(board.set_dac_threshold(8, 0, true).is_err());
    }

    #[test]
    fn test_dac_highpass_coefficient_is_clamped() {
        let (mock, mut board) = board();
        board.set_dac_highpass_filter(0.0).unwrap();
        assert_eq!(mock.register(DEVICE_RHYTHM, HPF) & 0xFFFF, 1);
        board.set_dac_highpass_filter(300.0).unwrap();
        let expected = (65536.0 * (1.0 - (-2.0 * PI * 300.0 / 30000.0f64).exp()) + 0.5).floor() as u32;
        assert_eq!(mock.register(DEVICE_RHYTHM, HPF) & 0xFFFF, expected);
    }

    #[test]
    fn test_ttl_and_dac_manual_frames() {
        let (mock, mut board) = board();
        board.set_ttl_out(0b1000).unwrap();
        board.set_dac_manual(0x1234).unwrap();
        assert_eq!(mock.ttl_outputs(), vec![8]);
        let dac = mock.frames_written(DEVICE_DAC);
        assert_eq!(dac[0].len(), 16);
        assert_eq!(u32::from_le_bytes([dac[0][0], dac[0][1], dac[0][2], dac[0][3]]), 0x1234_1234);
    }

    #[test]
    fn test_clock_busy_timeout_is_a_transport_error() {
        let mock = MockRhythm::new(MockRhythmConfig { clock_busy_reads: None, ..Default::default() });
        let mut board = RhythmBoard::open(&mock).unwrap();
        let err = board.set_sample_rate(3).unwrap_err();
        assert!(matches!(err, DriverError::TransportError { code: ONI_EBUSYTIMEOUT, .. }));
        assert_eq!(board.sample_rate_index(), SAMPLE_RATE_30K);
    }

    #[test]
    fn test_non_continuous_run_length_uses_timestep_units() {
        let (mock, mut board) = board();
        board.set_max_samples(256).unwrap();
        assert_eq!(mock.register(DEVICE_RHYTHM, MAX_TIMESTEP), 256 * 128);
        board.set_continuous_run_mode(false).unwrap();
        board.run().unwrap();
        assert_eq!(board.read_frames(256).unwrap().len(), 256);
        assert!(board.read_frames(1).is_err());

        board.set_max_samples(usize::MAX).unwrap();
        assert_eq!(mock.register(DEVICE_RHYTHM, MAX_TIMESTEP), u32::MAX);
    }

    #[test]
    fn test_initialize_enables_only_stream_zero() {
        let (mock, mut board) = board();
        board.initialize().unwrap();
        assert_eq!(board.num_enabled_data_streams(), 1);
        assert_eq!(mock.register(DEVICE_RHYTHM, DATA_STREAM_1_8_SEL), 0x7531_6420);
        assert_eq!(mock.register(DEVICE_RHYTHM, MAX_TIMESTEP), u32::MAX);
        assert_eq!(mock.register(DEVICE_RHYTHM, MODE) & (1 << MODE_LED_ENABLE), 1 << MODE_LED_ENABLE);
        assert_eq!(mock.ttl_outputs(), vec![0]);
    }
}
