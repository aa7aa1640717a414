//! Rhythm device controller.
//!
//! `RhythmDevice` owns the board behind a shared lock and drives it through
//! open, port scan, configuration, streaming and impedance measurement.
//! Configuration calls on a device that was never found only update the
//! stored settings.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ephys_types::{
    AdcRange, ChannelImpedance, ChannelImpedanceRecord, ChannelKind, ChannelLayout, ChannelNamingScheme,
    ContinuousChannelInfo, EventChannelInfo, HeadstageImpedanceRecord, ImpedanceExportError, ImpedanceReport,
    Impedances, SampleBatch, SensorError, StreamMeta,
};
use flume::{Receiver, Sender};
use log::{debug, error, info, warn};
use thread_priority::ThreadPriority;

use sensors::oni::registers::{BoardMemState, DataSource};
use sensors::oni::OniConnector;
use sensors::rhd2000::{
    ChipRegisters, AMPLIFIER_UV_PER_BIT, AUX_MV_PER_BIT, CHIP_ID_RHD2132, CHIP_ID_RHD2164, CHIP_ID_RHD2164_B,
    CHIP_ID_RHD2216,
};
use sensors::{DriverError, DriverStatus};

use super::board::{
    lock_board, AuxCmdSlot, RhythmBoard, FEET_TO_METERS, MAX_NUM_DATA_STREAMS, NUM_DACS, NUM_PORTS, SAMPLE_RATE_30K,
};
use super::decoder::{FrameDecoder, StreamLayout, NUM_ADC_CHANNELS, SAMPLES_PER_BATCH};
use super::digital_out::{parse_broadcast, DigitalOutScheduler};
use super::headstage::Headstage;
use super::impedance::{ImpedanceTask, MeasurementResult, MeasurementSetup};
use super::scanner::{plan_streams, port_delay, sweep_delays, INIT_STEP};
use super::settings::BoardSettings;

/// Headstage positions A1..D2.
pub const NUM_HEADSTAGES: usize = 8;
pub const NUM_TTL_INPUT_LINES: usize = 8;
const AUX_CHANNELS_PER_HEADSTAGE: usize = 3;
/// Decoded batches buffered between the streaming thread and its consumer.
const STREAM_CHANNEL_CAPACITY: usize = 256;
const MEMORY_INIT_POLL: Duration = Duration::from_millis(500);
const MEMORY_INIT_TIMEOUT: Duration = Duration::from_secs(25);
const RUN_COMPLETE_TIMEOUT: Duration = Duration::from_secs(2);
const ACQ_STOP_TIMEOUT: Duration = Duration::from_millis(500);
const ERROR_REPORT_TIMEOUT: Duration = Duration::from_secs(1);
const MIN_VARIABLE_RATE_FIRMWARE: u32 = 0x0003;
const LATE_AUX_FIRMWARE: u32 = 0x0004;

const ELECTRODE_IDENTIFIER: &str = "rhythm-fpga-device.continuous.headstage";
const AUX_IDENTIFIER: &str = "rhythm-fpga-device.continuous.aux";
const ADC_IDENTIFIER: &str = "rhythm-fpga-device.continuous.adc";
const EVENT_IDENTIFIER: &str = "rhythm-fpga-device.events";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Uninitialized,
    Configured,
    Scanning,
    Streaming,
    ImpedanceTesting,
}

/// Gateware version as `(major << 8) + minor`; `None` when it could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FirmwareInfo {
    pub version: Option<u32>,
}

impl FirmwareInfo {
    pub fn variable_sample_rate(&self) -> bool {
        matches!(self.version, Some(v) if v >= MIN_VARIABLE_RATE_FIRMWARE)
    }

    /// Samples by which aux results trail their command on this gateware.
    pub fn aux_register_offset(&self) -> usize {
        match self.version {
            Some(v) if v <= LATE_AUX_FIRMWARE => 1,
            _ => 0,
        }
    }
}

/// What one analog output follows.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DacRouting {
    /// (stream slot, channel within the stream); `None` disables the DAC.
    pub target: Option<(usize, usize)>,
    /// Threshold in microvolts.
    pub threshold: f32,
}

/// Board outputs rewritten together at a batch boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
struct OutputSettings {
    ttl_mode: bool,
    fast_ttl_settle_enabled: bool,
    fast_settle_ttl_channel: u32,
    dac_hpf_enabled: bool,
    dac_hpf_cutoff: f64,
    leds_enabled: bool,
    clock_divide_factor: u32,
}

impl OutputSettings {
    fn from_settings(settings: &BoardSettings) -> Self {
        Self {
            ttl_mode: settings.ttl_mode,
            fast_ttl_settle_enabled: settings.fast_ttl_settle_enabled,
            fast_settle_ttl_channel: settings.fast_settle_ttl_channel,
            dac_hpf_enabled: settings.dac_hpf_enabled,
            dac_hpf_cutoff: settings.dac_hpf_cutoff,
            leds_enabled: settings.leds_enabled,
            clock_divide_factor: settings.clock_divide_factor,
        }
    }

    fn write(&self, board: &mut RhythmBoard) -> Result<(), DriverError> {
        board.set_ttl_mode(self.ttl_mode)?;
        board.enable_external_fast_settle(self.fast_ttl_settle_enabled)?;
        board.set_external_fast_settle_channel(self.fast_settle_ttl_channel)?;
        board.set_dac_highpass_filter(self.dac_hpf_cutoff)?;
        board.enable_dac_highpass_filter(self.dac_hpf_enabled)?;
        board.enable_board_leds(self.leds_enabled)?;
        board.set_clock_divider(self.clock_divide_factor)
    }
}

/// DAC threshold register value and polarity for a threshold in microvolts.
fn dac_threshold_word(threshold: f32) -> (u32, bool) {
    let level = (threshold as f64 / AMPLIFIER_UV_PER_BIT as f64 + 32768.0).abs();
    ((level as u32).min(65535), threshold >= 0.0)
}

/// Changes the streaming thread applies between batches.
#[derive(Debug, Default)]
struct PendingChanges {
    dacs: [DacRouting; NUM_DACS],
    dac_dirty: [bool; NUM_DACS],
    outputs: Option<OutputSettings>,
    digital_out: DigitalOutScheduler,
}

impl PendingChanges {
    fn apply(&mut self, board: &mut RhythmBoard, now: Instant) -> Result<(), DriverError> {
        for dac in 0..NUM_DACS {
            if !self.dac_dirty[dac] {
                continue;
            }
            self.dac_dirty[dac] = false;
            let routing = self.dacs[dac];
            match routing.target {
                Some((stream, channel)) => {
                    board.enable_dac(dac, true)?;
                    board.select_dac_data_stream(dac, stream as u32)?;
                    board.select_dac_data_channel(dac, channel as u32)?;
                    let (threshold, trigger_on_high) = dac_threshold_word(routing.threshold);
                    board.set_dac_threshold(dac, threshold, trigger_on_high)?;
                }
                None => board.enable_dac(dac, false)?,
            }
        }

        if let Some(outputs) = self.outputs.take() {
            outputs.write(board)?;
        }

        if let Some(word) = self.digital_out.drain(now) {
            debug!("TTL output state {:016b}", word);
            board.set_ttl_out(word)?;
        }
        Ok(())
    }

    fn discard(&mut self) {
        self.dac_dirty = [false; NUM_DACS];
        self.outputs = None;
        self.digital_out.clear();
    }
}

fn lock_pending(pending: &Mutex<PendingChanges>) -> Result<std::sync::MutexGuard<'_, PendingChanges>, DriverError> {
    pending.lock().map_err(|_| DriverError::Other("Pending settings lock poisoned".into()))
}

/// One enabled data stream slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EnabledStream {
    source: DataSource,
    layout: StreamLayout,
}

pub type BatchReceiver = Receiver<Result<SampleBatch, SensorError>>;

pub struct RhythmDevice {
    board: Option<Arc<Mutex<RhythmBoard>>>,
    state: DeviceState,
    status: Arc<Mutex<DriverStatus>>,
    settings: BoardSettings,
    chip_registers: ChipRegisters,
    common_commands_set: bool,
    firmware: FirmwareInfo,
    headstages: Vec<Headstage>,
    streams: Vec<EnabledStream>,
    pending: Arc<Mutex<PendingChanges>>,
    stop_acq_thread: Arc<AtomicBool>,
    acq_thread_handle: Option<JoinHandle<()>>,
    impedance_task: Option<ImpedanceTask>,
    impedances: Impedances,
}

impl RhythmDevice {
    pub fn new(settings: BoardSettings) -> Self {
        let mut headstages: Vec<Headstage> =
            DataSource::ALL[..NUM_HEADSTAGES].iter().map(|&source| Headstage::new(source)).collect();
        for hs in headstages.iter_mut() {
            hs.set_naming_scheme(settings.naming_scheme);
        }

        Self {
            board: None,
            state: DeviceState::Uninitialized,
            status: Arc::new(Mutex::new(DriverStatus::NotInitialized)),
            chip_registers: ChipRegisters::new(30000.0),
            settings,
            common_commands_set: false,
            firmware: FirmwareInfo::default(),
            headstages,
            streams: Vec::new(),
            pending: Arc::new(Mutex::new(PendingChanges::default())),
            stop_acq_thread: Arc::new(AtomicBool::new(false)),
            acq_thread_handle: None,
            impedance_task: None,
            impedances: Impedances::default(),
        }
    }

    /// Opens the board and brings it to a scanned, configured state.
    ///
    /// When no board answers, `confirm_retry` decides whether to try again.
    /// Returns `Ok(false)` if the user gave up; the device then stays
    /// uninitialized and configuration calls only touch settings.
    pub fn open(
        &mut self,
        connector: &dyn OniConnector,
        mut confirm_retry: impl FnMut(&DriverError) -> bool,
    ) -> Result<bool, DriverError> {
        let board = loop {
            match RhythmBoard::open(connector) {
                Ok(board) => break board,
                Err(e @ DriverError::DeviceNotFound(_)) => {
                    warn!("Acquisition board not found: {}", e);
                    if !confirm_retry(&e) {
                        info!("Continuing without an acquisition board.");
                        return Ok(false);
                    }
                }
                Err(e) => return Err(e),
            }
        };
        let board = Arc::new(Mutex::new(board));
        self.board = Some(Arc::clone(&board));
        self.set_status(DriverStatus::Stopped);

        self.firmware = {
            let mut b = lock_board(&board)?;
            match b.firmware_version() {
                Ok((major, minor)) => {
                    info!("Rhythm gateware v{}.{}", major, minor);
                    FirmwareInfo { version: Some(((major as u32) << 8) + minor as u32) }
                }
                Err(e) => {
                    error!("Could not read gateware version: {}", e);
                    FirmwareInfo { version: None }
                }
            }
        };
        if !self.firmware.variable_sample_rate() {
            warn!("This gateware does not support variable sample rates; update it to gain that functionality.");
        }

        self.initialize_board()?;
        self.wait_for_board_memory(&board)?;
        self.state = DeviceState::Configured;

        self.scan_ports()?;

        {
            let mut pending = lock_pending(&self.pending)?;
            pending.dacs = [DacRouting::default(); NUM_DACS];
            pending.dac_dirty = [true; NUM_DACS];
        }
        self.apply_pending_now()?;
        info!("Rhythm device ready with {} electrode channels.", self.num_data_outputs(ChannelKind::Electrode));
        Ok(true)
    }

    fn wait_for_board_memory(&self, board: &Arc<Mutex<RhythmBoard>>) -> Result<(), DriverError> {
        let start = Instant::now();
        let mut state = lock_board(board)?.board_mem_state()?;
        if state == BoardMemState::Init {
            info!("On-board memory still initializing. This might take up to 20 seconds.");
            while state == BoardMemState::Init {
                if start.elapsed() > MEMORY_INIT_TIMEOUT {
                    return Err(DriverError::TimeoutError(format!(
                        "Board memory still initializing after {:?}",
                        MEMORY_INIT_TIMEOUT
                    )));
                }
                thread::sleep(MEMORY_INIT_POLL);
                state = lock_board(board)?.board_mem_state()?;
            }
            info!("Memory init completed.");
        }
        Ok(())
    }

    /// Default board state, then one short run with the calibrating
    /// register bank so the chip ADCs are calibrated.
    pub fn initialize_board(&mut self) -> Result<(), DriverError> {
        let Some(board) = self.board.clone() else {
            return Ok(());
        };
        info!("Initializing RHD2000 board.");
        lock_board(&board)?.initialize()?;
        self.set_sample_rate(SAMPLE_RATE_30K, true)?;

        let mut b = lock_board(&board)?;
        for port in 0..NUM_PORTS {
            b.set_cable_length_meters(port, self.settings.cable_length_meters[port])?;
        }
        b.select_aux_command_bank_all_ports(AuxCmdSlot::AuxCmd3, 0)?;
        b.set_max_samples(INIT_STEP)?;
        b.set_continuous_run_mode(false)?;
        b.run()?;

        let start = Instant::now();
        while b.is_running()? {
            if start.elapsed() > RUN_COMPLETE_TIMEOUT {
                warn!("Calibration run still active after {:?}; stopping it.", RUN_COMPLETE_TIMEOUT);
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        b.stop()?;

        b.select_aux_command_bank_all_ports(AuxCmdSlot::AuxCmd3, self.register_config_bank())?;
        Ok(())
    }

    /// `Ok` and `Invalid` (not reported by this gateware) pass.
    pub fn check_board_mem(&self) -> Result<(), DriverError> {
        let Some(board) = &self.board else {
            return Ok(());
        };
        match lock_board(board)?.board_mem_state()? {
            BoardMemState::Ok | BoardMemState::Invalid => Ok(()),
            state => {
                error!(
                    "On-board memory error ({:?}). Try again after 30 seconds or after power cycling the board.",
                    state
                );
                Err(DriverError::BoardMemoryFault(format!("Board memory reports {:?}", state)))
            }
        }
    }

    pub fn is_device_found(&self) -> bool {
        self.board.is_some()
    }

    pub fn state(&self) -> DeviceState {
        if self.state == DeviceState::Streaming && !self.is_acquiring() {
            return DeviceState::Configured;
        }
        self.state
    }

    pub fn status(&self) -> DriverStatus {
        self.status.lock().map(|s| s.clone()).unwrap_or_else(|e| e.into_inner().clone())
    }

    fn set_status(&self, status: DriverStatus) {
        match self.status.lock() {
            Ok(mut s) => *s = status,
            Err(e) => *e.into_inner() = status,
        }
    }

    pub fn settings(&self) -> &BoardSettings {
        &self.settings
    }

    pub fn firmware(&self) -> FirmwareInfo {
        self.firmware
    }

    pub fn headstages(&self) -> &[Headstage] {
        &self.headstages
    }

    pub fn headstage(&self, hs: usize) -> Option<&Headstage> {
        self.headstages.get(hs)
    }

    /// Layout of the enabled data streams, in slot order.
    pub fn stream_layouts(&self) -> Vec<StreamLayout> {
        self.streams.iter().map(|s| s.layout).collect()
    }

    /// Current board sample rate; the configured one when no board is open.
    pub fn sample_rate(&self) -> f64 {
        match &self.board {
            Some(board) => lock_board(board).map(|b| b.sample_rate()).unwrap_or(0.0),
            None => super::board::SAMPLE_RATES[self.settings.sample_rate_index.min(SAMPLE_RATE_30K)].rate,
        }
    }

    /// True while the streaming thread runs. A thread that ended after a
    /// hardware error no longer counts.
    pub fn is_acquiring(&self) -> bool {
        self.state == DeviceState::Streaming && self.acq_thread_handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Joins a streaming thread that exited on its own.
    fn reap_acq_thread(&mut self) {
        if !self.acq_thread_handle.as_ref().is_some_and(|h| h.is_finished()) {
            return;
        }
        if let Some(handle) = self.acq_thread_handle.take() {
            if handle.join().is_err() {
                error!("Acquisition thread panicked.");
            }
        }
        if let Ok(mut pending) = lock_pending(&self.pending) {
            pending.digital_out.reset_state();
        }
        if self.state == DeviceState::Streaming {
            self.state = DeviceState::Configured;
            info!("Acquisition thread ended; device back to configured.");
        }
    }

    fn register_config_bank(&self) -> u32 {
        if self.settings.fast_settle_enabled {
            2
        } else {
            1
        }
    }

    // ---- port scan ----

    /// Detects connected chips, assigns data streams and picks cable delays.
    pub fn scan_ports(&mut self) -> Result<(), DriverError> {
        let Some(board) = self.board.clone() else {
            return Ok(());
        };
        self.check_board_mem()?;
        self.stop_impedance_safely();

        self.state = DeviceState::Scanning;
        let result = self.run_scan(&board);
        self.state = DeviceState::Configured;
        if let Err(e) = &result {
            error!("Port scan failed: {}", e);
        }
        result
    }

    fn run_scan(&mut self, board: &Arc<Mutex<RhythmBoard>>) -> Result<(), DriverError> {
        self.streams.clear();
        for hs in self.headstages.iter_mut() {
            hs.reset();
        }

        self.set_sample_rate(SAMPLE_RATE_30K, true)?;
        let hits = {
            let mut b = lock_board(board)?;
            sweep_delays(&mut b, self.firmware.aux_register_offset())?
        };

        let (plans, layouts) = plan_streams(&hits);
        let mut layouts = layouts.into_iter();
        for plan in &plans {
            let assigned: Vec<StreamLayout> = layouts.by_ref().take(plan.num_streams).collect();
            self.attach_headstage(plan.headstage, plan.channels_per_stream, &assigned);
        }
        self.update_board_streams()?;
        info!("Scan found {} headstages on {} data streams.", plans.len(), self.streams.len());

        {
            let mut b = lock_board(board)?;
            for port in 0..NUM_PORTS {
                let delay = port_delay(&hits, port);
                b.set_cable_delay(port, delay as i32)?;
                self.settings.cable_length_meters[port] = b.estimate_cable_length_meters(delay);
                debug!("Port {} delay {} (~{:.2} m)", port, delay, self.settings.cable_length_meters[port]);
            }
        }

        self.set_sample_rate(self.settings.sample_rate_index, false)
    }

    // ---- headstages and streams ----

    fn attach_headstage(&mut self, hs: usize, channels_per_stream: usize, layouts: &[StreamLayout]) {
        let first_channel = self.num_data_outputs(ChannelKind::Electrode);
        let first_stream = self.streams.len();
        let Some(headstage) = self.headstages.get_mut(hs) else {
            return;
        };
        debug!("Enabling headstage {} with {} streams of {} channels", hs, layouts.len(), channels_per_stream);

        headstage.set_first_channel(first_channel);
        headstage.set_num_streams(layouts.len());
        headstage.set_channels_per_stream(channels_per_stream);
        headstage.set_first_stream_index(first_stream);
        for (offset, &layout) in layouts.iter().enumerate() {
            self.streams.push(EnabledStream { source: headstage.data_source(offset), layout });
        }
    }

    /// Enables or disables a headstage position. Stream slots are assigned
    /// in enable order; call `update_board_streams` to push them to the board.
    pub fn enable_headstage(
        &mut self,
        hs: usize,
        enabled: bool,
        num_streams: usize,
        channels_per_stream: usize,
    ) -> Result<(), DriverError> {
        if hs >= self.headstages.len() {
            return Err(DriverError::out_of_range(format!("Headstage {} out of range", hs)));
        }

        if enabled {
            if !(1..=2).contains(&num_streams) || self.streams.len() + num_streams > MAX_NUM_DATA_STREAMS {
                return Err(DriverError::out_of_range(format!(
                    "Cannot add {} streams to {} enabled",
                    num_streams,
                    self.streams.len()
                )));
            }
            let layouts: Vec<StreamLayout> = match (num_streams, channels_per_stream) {
                (2, channels) => vec![
                    StreamLayout { chip_id: CHIP_ID_RHD2164, channels },
                    StreamLayout { chip_id: CHIP_ID_RHD2164_B, channels },
                ],
                (_, 16) => vec![StreamLayout { chip_id: CHIP_ID_RHD2216, channels: 16 }],
                (_, channels) => vec![StreamLayout { chip_id: CHIP_ID_RHD2132, channels }],
            };
            self.attach_headstage(hs, channels_per_stream, &layouts);
        } else {
            let headstage = &mut self.headstages[hs];
            let mut sources = vec![headstage.data_source(0)];
            if headstage.num_streams() > 1 {
                sources.push(headstage.data_source(1));
            }
            self.streams.retain(|s| !sources.contains(&s.source));
            headstage.reset();
            self.reassign_stream_indices();
        }
        Ok(())
    }

    fn reassign_stream_indices(&mut self) {
        for hs in self.headstages.iter_mut().filter(|h| h.is_connected()) {
            if let Some(slot) = self.streams.iter().position(|s| s.source == hs.data_source(0)) {
                hs.set_first_stream_index(slot);
            }
        }
    }

    /// Routes the enabled streams to the first slots and disables the rest.
    pub fn update_board_streams(&mut self) -> Result<(), DriverError> {
        self.stop_impedance_safely();
        let Some(board) = &self.board else {
            return Ok(());
        };
        let mut b = lock_board(board)?;
        for slot in 0..MAX_NUM_DATA_STREAMS {
            match self.streams.get(slot) {
                Some(stream) => {
                    b.enable_data_stream(slot, true)?;
                    b.set_data_source(slot, stream.source)?;
                }
                None => b.enable_data_stream(slot, false)?,
            }
        }
        b.update_stream_block_size()
    }

    /// Switches a 32-channel headstage between full (32) and half (16)
    /// channel count; other headstages keep theirs. Returns the active
    /// channel count of `hs`.
    pub fn set_num_channels(&mut self, hs: usize, num_channels: usize) -> Result<usize, DriverError> {
        if num_channels != 16 && num_channels != 32 {
            return Err(DriverError::out_of_range(format!(
                "Headstage channel count {} is not 16 or 32",
                num_channels
            )));
        }
        let headstage = self
            .headstages
            .get_mut(hs)
            .ok_or_else(|| DriverError::out_of_range(format!("Headstage {} out of range", hs)))?;
        if headstage.num_channels() == 32 {
            headstage.set_half_channels(num_channels < 32);
            let active = headstage.num_active_channels();
            if let Some(stream) = headstage.stream_index(0).and_then(|slot| self.streams.get_mut(slot)) {
                stream.layout.channels = active;
            }
        }
        let active = headstage.num_active_channels();

        let mut channel_index = 0;
        for hs in self.headstages.iter_mut().filter(|h| h.is_connected()) {
            hs.set_first_channel(channel_index);
            channel_index += hs.num_active_channels();
        }
        Ok(active)
    }

    pub fn set_naming_scheme(&mut self, scheme: ChannelNamingScheme) {
        self.settings.naming_scheme = scheme;
        for hs in self.headstages.iter_mut() {
            hs.set_naming_scheme(scheme);
        }
    }

    // ---- sample rate and amplifier registers ----

    /// Selects rate `index` (0..=14). A temporary change does not replace
    /// the rate restored after scans.
    pub fn set_sample_rate(&mut self, index: usize, temporary: bool) -> Result<(), DriverError> {
        self.stop_impedance_safely();
        if index > SAMPLE_RATE_30K {
            return Err(DriverError::out_of_range(format!("Sample rate index {} out of range 0..=14", index)));
        }
        if !temporary {
            self.settings.sample_rate_index = index;
        }
        let Some(board) = self.board.clone() else {
            return Ok(());
        };

        if !self.firmware.variable_sample_rate() {
            debug!("Board not capable of sample rate change");
            return self.update_registers();
        }

        {
            let mut b = lock_board(&board)?;
            b.set_sample_rate(index)?;
            info!("Sample rate set to {:.2} Hz", b.sample_rate());
            for port in 0..NUM_PORTS {
                b.set_cable_length_meters(port, self.settings.cable_length_meters[port])?;
            }
        }
        self.update_registers()
    }

    /// Regenerates the command lists for the current rate and amplifier
    /// settings and uploads them. Bandwidth settings are replaced with the
    /// values the chip can realise.
    pub fn update_registers(&mut self) -> Result<(), DriverError> {
        let Some(board) = self.board.clone() else {
            return Ok(());
        };
        let mut b = lock_board(&board)?;
        self.chip_registers.define_sample_rate(b.sample_rate());

        // digital-out and temperature lists do not depend on the rate
        if !self.common_commands_set {
            debug!("Uploading common commands");
            self.chip_registers.set_dig_out_low();
            let commands = self.chip_registers.command_list_update_dig_out();
            b.upload_command_list(&commands, AuxCmdSlot::AuxCmd1, 0)?;
            b.select_aux_command_length(AuxCmdSlot::AuxCmd1, 0, commands.len() as u32 - 1)?;
            b.select_aux_command_bank_all_ports(AuxCmdSlot::AuxCmd1, 0)?;

            let commands = self.chip_registers.command_list_temp_sensor();
            b.upload_command_list(&commands, AuxCmdSlot::AuxCmd2, 0)?;
            b.select_aux_command_length(AuxCmdSlot::AuxCmd2, 0, commands.len() as u32 - 1)?;
            b.select_aux_command_bank_all_ports(AuxCmdSlot::AuxCmd2, 0)?;
            self.common_commands_set = true;
        }

        let dsp = &mut self.settings.dsp;
        dsp.cutoff_freq = self.chip_registers.set_dsp_cutoff_freq(dsp.cutoff_freq);
        dsp.lower_bandwidth = self.chip_registers.set_lower_bandwidth(dsp.lower_bandwidth);
        dsp.upper_bandwidth = self.chip_registers.set_upper_bandwidth(dsp.upper_bandwidth);
        self.chip_registers.enable_dsp(dsp.enabled);
        self.chip_registers.enable_aux1(self.settings.acquire_aux);
        self.chip_registers.enable_aux2(self.settings.acquire_aux);
        self.chip_registers.enable_aux3(self.settings.acquire_aux);

        let calibrate = self.chip_registers.command_list_register_config(true);
        b.upload_command_list(&calibrate, AuxCmdSlot::AuxCmd3, 0)?;
        b.select_aux_command_length(AuxCmdSlot::AuxCmd3, 0, calibrate.len() as u32 - 1)?;

        let plain = self.chip_registers.command_list_register_config(false);
        b.upload_command_list(&plain, AuxCmdSlot::AuxCmd3, 1)?;

        self.chip_registers.set_fast_settle(true);
        let fast_settle = self.chip_registers.command_list_register_config(false);
        b.upload_command_list(&fast_settle, AuxCmdSlot::AuxCmd3, 2)?;
        self.chip_registers.set_fast_settle(false);

        b.select_aux_command_bank_all_ports(AuxCmdSlot::AuxCmd3, self.register_config_bank())?;
        debug!(
            "Registers updated: DSP {:.3} Hz, bandwidth {:.3}..{:.1} Hz",
            self.settings.dsp.cutoff_freq, self.settings.dsp.lower_bandwidth, self.settings.dsp.upper_bandwidth
        );
        Ok(())
    }

    /// Returns the upper bandwidth actually realised.
    pub fn set_upper_bandwidth(&mut self, upper: f64) -> Result<f64, DriverError> {
        self.stop_impedance_safely();
        self.settings.dsp.upper_bandwidth = upper;
        self.update_registers()?;
        Ok(self.settings.dsp.upper_bandwidth)
    }

    /// Returns the lower bandwidth actually realised.
    pub fn set_lower_bandwidth(&mut self, lower: f64) -> Result<f64, DriverError> {
        self.stop_impedance_safely();
        self.settings.dsp.lower_bandwidth = lower;
        self.update_registers()?;
        Ok(self.settings.dsp.lower_bandwidth)
    }

    /// Returns the DSP cutoff actually realised.
    pub fn set_dsp_cutoff_freq(&mut self, freq: f64) -> Result<f64, DriverError> {
        self.stop_impedance_safely();
        self.settings.dsp.cutoff_freq = freq;
        self.update_registers()?;
        Ok(self.settings.dsp.cutoff_freq)
    }

    pub fn set_dsp_offset(&mut self, enabled: bool) -> Result<(), DriverError> {
        self.stop_impedance_safely();
        self.settings.dsp.enabled = enabled;
        self.update_registers()
    }

    pub fn set_fast_settle(&mut self, enabled: bool) -> Result<(), DriverError> {
        self.stop_impedance_safely();
        self.settings.fast_settle_enabled = enabled;
        if let Some(board) = &self.board {
            lock_board(board)?.select_aux_command_bank_all_ports(AuxCmdSlot::AuxCmd3, self.register_config_bank())?;
        }
        Ok(())
    }

    pub fn enable_aux(&mut self, enabled: bool) -> Result<(), DriverError> {
        self.stop_impedance_safely();
        self.settings.acquire_aux = enabled;
        self.update_registers()
    }

    pub fn enable_adc(&mut self, enabled: bool) {
        self.settings.acquire_adc = enabled;
    }

    pub fn set_adc_range(&mut self, channel: usize, range: AdcRange) -> Result<(), DriverError> {
        let slot = self
            .settings
            .adc_ranges
            .get_mut(channel)
            .ok_or_else(|| DriverError::out_of_range(format!("ADC channel {} out of range", channel)))?;
        *slot = range;
        Ok(())
    }

    pub fn adc_range(&self, channel: usize) -> Option<AdcRange> {
        self.settings.adc_ranges.get(channel).copied()
    }

    /// Sets the MISO delay of `port` (0..=3) for a cable of `feet`. The
    /// length is kept so rate changes recompute the delay from it.
    pub fn set_cable_length(&mut self, port: usize, feet: f64) -> Result<(), DriverError> {
        self.stop_impedance_safely();
        let meters = self
            .settings
            .cable_length_meters
            .get_mut(port)
            .ok_or_else(|| DriverError::out_of_range(format!("Port {} out of range", port)))?;
        *meters = FEET_TO_METERS * feet;
        let meters = *meters;
        let Some(board) = &self.board else {
            return Ok(());
        };
        lock_board(board)?.set_cable_length_meters(port, meters)
    }

    // ---- outputs applied at batch boundaries ----

    fn queue_outputs(&mut self) -> Result<(), DriverError> {
        lock_pending(&self.pending)?.outputs = Some(OutputSettings::from_settings(&self.settings));
        self.apply_pending_now()
    }

    /// Writes pending changes directly when no streaming thread will.
    fn apply_pending_now(&mut self) -> Result<(), DriverError> {
        if self.is_acquiring() {
            return Ok(());
        }
        let Some(board) = &self.board else {
            return Ok(());
        };
        let mut b = lock_board(board)?;
        lock_pending(&self.pending)?.apply(&mut b, Instant::now())
    }

    pub fn set_ttl_output_mode(&mut self, threshold_mode: bool) -> Result<(), DriverError> {
        self.settings.ttl_mode = threshold_mode;
        self.queue_outputs()
    }

    pub fn set_dac_hpf(&mut self, cutoff: f64, enabled: bool) -> Result<(), DriverError> {
        self.settings.dac_hpf_cutoff = cutoff;
        self.settings.dac_hpf_enabled = enabled;
        self.queue_outputs()
    }

    pub fn set_fast_ttl_settle(&mut self, enabled: bool, channel: u32) -> Result<(), DriverError> {
        self.settings.fast_ttl_settle_enabled = enabled;
        self.settings.fast_settle_ttl_channel = channel;
        self.queue_outputs()
    }

    pub fn enable_board_leds(&mut self, enabled: bool) -> Result<(), DriverError> {
        self.settings.leds_enabled = enabled;
        self.queue_outputs()
    }

    /// Sync clock output divider. Ratios other than 1 are rounded down to
    /// an even number; returns the ratio in effect.
    pub fn set_clock_divider(&mut self, divide_ratio: u32) -> Result<u32, DriverError> {
        if self.board.is_none() {
            return Ok(1);
        }
        let mut ratio = divide_ratio.max(1);
        if ratio != 1 && ratio % 2 == 1 {
            ratio -= 1;
        }
        self.settings.clock_divide_factor = if ratio == 1 { 0 } else { ratio / 2 };
        self.queue_outputs()?;
        Ok(ratio)
    }

    pub fn set_noise_slicer_level(&mut self, level: u32) -> Result<u32, DriverError> {
        self.stop_impedance_safely();
        self.settings.noise_slicer_level = level;
        if let Some(board) = &self.board {
            lock_board(board)?.set_audio_noise_suppress(level)?;
        }
        Ok(level)
    }

    /// Routes `dac` to global electrode `channel`. Returns the routing that
    /// will be applied, or `None` when the channel does not exist and the
    /// DAC is left alone.
    pub fn set_dac_channel(&mut self, dac: usize, channel: usize) -> Result<Option<DacRouting>, DriverError> {
        if dac >= NUM_DACS {
            return Err(DriverError::out_of_range(format!("DAC {} out of range", dac)));
        }
        if channel >= self.num_data_outputs(ChannelKind::Electrode) {
            debug!("DAC {}: no electrode channel {}; routing unchanged", dac, channel);
            return Ok(None);
        }

        let mut count = 0;
        let mut target = None;
        for (slot, stream) in self.streams.iter().enumerate() {
            if channel < count + stream.layout.channels {
                target = Some((slot, channel - count));
                break;
            }
            count += stream.layout.channels;
        }
        let routing = {
            let mut pending = lock_pending(&self.pending)?;
            pending.dacs[dac].target = target;
            pending.dac_dirty[dac] = true;
            pending.dacs[dac]
        };
        self.apply_pending_now()?;
        Ok(Some(routing))
    }

    /// Threshold of `dac` in microvolts.
    pub fn set_dac_threshold(&mut self, dac: usize, threshold: f32) -> Result<(), DriverError> {
        if dac >= NUM_DACS {
            return Err(DriverError::out_of_range(format!("DAC {} out of range", dac)));
        }
        {
            let mut pending = lock_pending(&self.pending)?;
            pending.dacs[dac].threshold = threshold;
            pending.dac_dirty[dac] = true;
        }
        self.apply_pending_now()
    }

    pub fn dac_routing(&self, dac: usize) -> Option<DacRouting> {
        lock_pending(&self.pending).ok().and_then(|p| p.dacs.get(dac).copied())
    }

    /// Handles an inter-module text command. Returns true when a TTL pulse
    /// was queued.
    pub fn handle_broadcast(&mut self, message: &str) -> bool {
        let Some(command) = parse_broadcast(message) else {
            return false;
        };
        match lock_pending(&self.pending) {
            Ok(mut pending) => {
                pending.digital_out.trigger(command.line, command.duration, Instant::now());
                true
            }
            Err(e) => {
                error!("{}", e);
                false
            }
        }
    }

    // ---- channel metadata ----

    pub fn num_data_outputs(&self, kind: ChannelKind) -> usize {
        let connected = self.headstages.iter().filter(|h| h.is_connected());
        match kind {
            ChannelKind::Electrode => connected.map(|h| h.num_active_channels()).sum(),
            ChannelKind::Aux if self.settings.acquire_aux => connected.count() * AUX_CHANNELS_PER_HEADSTAGE,
            ChannelKind::Adc if self.settings.acquire_adc => NUM_ADC_CHANNELS,
            _ => 0,
        }
    }

    pub fn num_channels(&self) -> usize {
        self.num_data_outputs(ChannelKind::Electrode)
            + self.num_data_outputs(ChannelKind::Aux)
            + self.num_data_outputs(ChannelKind::Adc)
    }

    /// Continuous channels in sample order plus the TTL input channel.
    pub fn channel_info(&self) -> ChannelLayout {
        let mut layout = ChannelLayout::default();
        if self.board.is_none() {
            return layout;
        }

        for hs in self.headstages.iter().filter(|h| h.is_connected()) {
            for ch in 0..hs.num_active_channels() {
                layout.continuous.push(ContinuousChannelInfo {
                    kind: ChannelKind::Electrode,
                    name: hs.channel_name(ch).to_string(),
                    description: "Headstage channel from a Rhythm FPGA device".into(),
                    identifier: ELECTRODE_IDENTIFIER.into(),
                    scale: AMPLIFIER_UV_PER_BIT,
                    units: "uV".into(),
                    impedance: self.impedances.valid.then(|| ChannelImpedance {
                        magnitude: hs.impedance_magnitude(ch),
                        phase: hs.impedance_phase(ch),
                    }),
                });
            }
        }

        if self.settings.acquire_aux {
            for hs in self.headstages.iter().filter(|h| h.is_connected()) {
                for aux in 0..AUX_CHANNELS_PER_HEADSTAGE {
                    layout.continuous.push(ContinuousChannelInfo {
                        kind: ChannelKind::Aux,
                        name: format!("{}_AUX{}", hs.prefix(), aux + 1),
                        description: "Aux input channel from a Rhythm FPGA device".into(),
                        identifier: AUX_IDENTIFIER.into(),
                        scale: AUX_MV_PER_BIT,
                        units: "mV".into(),
                        impedance: None,
                    });
                }
            }
        }

        if self.settings.acquire_adc {
            for (ch, range) in self.settings.adc_ranges.iter().enumerate() {
                layout.continuous.push(ContinuousChannelInfo {
                    kind: ChannelKind::Adc,
                    name: format!("ADC{}", ch + 1),
                    description: "ADC input channel from a Rhythm FPGA device".into(),
                    identifier: ADC_IDENTIFIER.into(),
                    scale: range.bit_volts(),
                    units: "V".into(),
                    impedance: None,
                });
            }
        }

        layout.events.push(EventChannelInfo {
            name: "Rhythm FPGA TTL Input".into(),
            description: "Events on digital input lines of a Rhythm FPGA device".into(),
            identifier: EVENT_IDENTIFIER.into(),
            num_lines: NUM_TTL_INPUT_LINES,
            line_names: (1..=NUM_TTL_INPUT_LINES).map(|i| format!("TTL{}", i)).collect(),
        });
        layout
    }

    /// Names of all continuous channels, in sample order.
    pub fn channel_names(&self) -> Vec<String> {
        self.channel_info().continuous.into_iter().map(|c| c.name).collect()
    }

    pub fn channel_name(&self, index: usize) -> Option<String> {
        self.channel_names().into_iter().nth(index)
    }

    /// Global channel index of channel `ch` of headstage `hs`. Channels past
    /// the electrodes address the headstage's aux inputs; `hs ==
    /// NUM_HEADSTAGES` addresses the board ADCs.
    pub fn get_channel_from_headstage(&self, hs: usize, ch: usize) -> Option<usize> {
        if hs == self.headstages.len() {
            return (self.num_data_outputs(ChannelKind::Adc) > 0).then(|| {
                self.num_data_outputs(ChannelKind::Electrode) + self.num_data_outputs(ChannelKind::Aux) + ch
            });
        }
        let headstage = self.headstages.get(hs)?;
        if !headstage.is_connected() {
            return None;
        }

        let active = headstage.num_active_channels();
        if ch < active {
            let before: usize = self.headstages[..hs].iter().map(|h| h.num_active_channels()).sum();
            Some(before + ch)
        } else if ch < active + AUX_CHANNELS_PER_HEADSTAGE {
            let connected_before = self.headstages[..hs].iter().filter(|h| h.is_connected()).count();
            Some(self.num_data_outputs(ChannelKind::Electrode) + AUX_CHANNELS_PER_HEADSTAGE * connected_before + ch - active)
        } else {
            None
        }
    }

    /// Inverse of `get_channel_from_headstage` for electrode and aux
    /// channels: returns (headstage, channel within headstage).
    pub fn get_headstage_channel(&self, channel: usize) -> Option<(usize, usize)> {
        let mut count = 0;
        let mut connected = Vec::new();
        for (i, hs) in self.headstages.iter().enumerate().filter(|(_, h)| h.is_connected()) {
            let active = hs.num_active_channels();
            if channel >= count && channel < count + active {
                return Some((i, channel - count));
            }
            count += active;
            connected.push(i);
        }

        let aux_index = channel.checked_sub(count)?;
        let hs = *connected.get(aux_index / AUX_CHANNELS_PER_HEADSTAGE)?;
        Some((hs, self.headstages[hs].num_active_channels() + aux_index % AUX_CHANNELS_PER_HEADSTAGE))
    }

    fn stream_meta(&self, sample_rate: f64) -> StreamMeta {
        StreamMeta {
            source_type: self.settings.variant.display_name().to_string(),
            sample_rate: sample_rate as f32,
            num_electrode_channels: self.num_data_outputs(ChannelKind::Electrode),
            num_aux_channels: self.num_data_outputs(ChannelKind::Aux),
            num_adc_channels: self.num_data_outputs(ChannelKind::Adc),
            channel_names: self.channel_names(),
        }
    }

    // ---- streaming ----

    /// Starts continuous acquisition; decoded batches arrive on the
    /// returned channel until `stop_acquisition`.
    pub fn start_acquisition(&mut self) -> Result<BatchReceiver, DriverError> {
        let Some(board) = self.board.clone() else {
            return Err(DriverError::DeviceNotFound("No acquisition board is open".into()));
        };
        self.reap_acq_thread();
        if self.is_acquiring() {
            return Err(DriverError::Other("Acquisition already running".into()));
        }
        if self.num_channels() == 0 {
            return Err(DriverError::out_of_range("No channels to acquire"));
        }
        self.check_board_mem()?;
        self.wait_impedance_safely();

        lock_pending(&self.pending)?.digital_out.reset_state();

        let sample_rate = lock_board(&board)?.sample_rate();
        let meta = Arc::new(self.stream_meta(sample_rate));
        let decoder = FrameDecoder::new(
            self.stream_layouts(),
            self.settings.acquire_aux,
            self.settings.acquire_adc,
            self.settings.adc_ranges,
            meta,
        );
        debug!("Expecting {} channels.", decoder.num_channels());

        {
            let mut b = lock_board(&board)?;
            b.set_continuous_run_mode(true)?;
            b.run()?;
        }

        self.stop_acq_thread.store(false, Ordering::Relaxed);
        let (batch_tx, batch_rx) = flume::bounded(STREAM_CHANNEL_CAPACITY);
        let stop_flag = Arc::clone(&self.stop_acq_thread);
        let pending = Arc::clone(&self.pending);
        let status = Arc::clone(&self.status);

        let acq_thread = thread::Builder::new()
            .name("rhythm_acq".into())
            .spawn(move || {
                if let Err(e) = thread_priority::set_current_thread_priority(ThreadPriority::Max) {
                    warn!("Failed to set acquisition thread priority: {:?}", e);
                }
                info!("Acquisition thread started with high priority.");
                stream_batches(&board, &pending, decoder, &batch_tx, &stop_flag, &status);
                info!("Acquisition thread shutting down.");
            })
            .map_err(|e| DriverError::Other(format!("Failed to spawn thread: {}", e)))?;

        self.acq_thread_handle = Some(acq_thread);
        self.state = DeviceState::Streaming;
        self.set_status(DriverStatus::Running);
        info!("Acquisition started at {:.2} Hz.", sample_rate);
        Ok(batch_rx)
    }

    /// Stops the streaming thread (waiting at most 500 ms for it) and
    /// returns the board to idle. Pending output changes are discarded.
    pub fn stop_acquisition(&mut self) -> Result<(), DriverError> {
        self.stop_acq_thread.store(true, Ordering::Relaxed);

        if let Some(handle) = self.acq_thread_handle.take() {
            let start = Instant::now();
            while !handle.is_finished() && start.elapsed() < ACQ_STOP_TIMEOUT {
                thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    error!("Acquisition thread panicked.");
                }
                info!("Acquisition thread joined.");
            } else {
                warn!("Acquisition thread did not exit within {:?}; continuing anyway.", ACQ_STOP_TIMEOUT);
            }
        }

        if let Some(board) = &self.board {
            let mut b = lock_board(board)?;
            b.set_continuous_run_mode(false)?;
            b.set_max_time_step(0)?;
            b.stop()?;
            b.reset_board()?;
        }

        lock_pending(&self.pending)?.discard();
        if self.state == DeviceState::Streaming {
            self.state = DeviceState::Configured;
            self.set_status(DriverStatus::Stopped);
            info!("Acquisition stopped.");
        }
        Ok(())
    }

    // ---- impedance ----

    /// Starts an impedance measurement in the background. Any measurement
    /// already running is stopped first.
    pub fn run_impedance_test(&mut self) -> Result<(), DriverError> {
        let Some(board) = self.board.clone() else {
            return Ok(());
        };
        self.reap_acq_thread();
        if self.is_acquiring() {
            return Err(DriverError::Other("Cannot measure impedance while acquiring".into()));
        }
        self.check_board_mem()?;
        self.stop_impedance_safely();

        let setup = MeasurementSetup {
            sample_rate: lock_board(&board)?.sample_rate(),
            dsp: self.settings.dsp.clone(),
            fast_settle_enabled: self.settings.fast_settle_enabled,
            fast_ttl_settle_enabled: self.settings.fast_ttl_settle_enabled,
            streams: self.stream_layouts(),
            registers: self.chip_registers.clone(),
        };
        self.impedances = Impedances::default();
        self.impedance_task = Some(ImpedanceTask::spawn(board, setup)?);
        self.state = DeviceState::ImpedanceTesting;
        Ok(())
    }

    pub fn is_impedance_test_running(&self) -> bool {
        self.impedance_task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Collects a finished measurement. Returns true once no measurement is
    /// outstanding.
    pub fn poll_impedance_test(&mut self) -> bool {
        let Some(task) = self.impedance_task.as_mut() else {
            return true;
        };
        match task.try_result() {
            Some(result) => {
                self.impedance_task = None;
                self.finish_impedance(Some(result));
                true
            }
            None => false,
        }
    }

    /// Cancels a running measurement; no results are committed unless it
    /// had already completed.
    pub fn stop_impedance_safely(&mut self) {
        if let Some(mut task) = self.impedance_task.take() {
            let result = match &self.board {
                Some(board) => task.stop_safely(board),
                None => None,
            };
            self.finish_impedance(result);
        }
    }

    /// Waits for a running measurement to finish, aborting it after two minutes.
    pub fn wait_impedance_safely(&mut self) {
        if let Some(mut task) = self.impedance_task.take() {
            let result = match &self.board {
                Some(board) => task.wait_safely(board),
                None => None,
            };
            self.finish_impedance(result);
        }
    }

    fn finish_impedance(&mut self, result: Option<MeasurementResult>) {
        if self.state == DeviceState::ImpedanceTesting {
            self.state = DeviceState::Configured;
        }
        match result {
            Some(Ok(impedances)) if impedances.valid => {
                debug!("Updating headstage impedance values");
                for hs in self.headstages.iter_mut().filter(|h| h.is_connected()) {
                    hs.set_impedances(&impedances);
                }
                self.impedances = impedances;
            }
            Some(Ok(_)) => warn!("Impedance measurement returned no valid results."),
            Some(Err(e)) => warn!("Impedance measurement failed: {}", e),
            None => warn!("Impedance measurement was aborted."),
        }
    }

    pub fn impedances(&self) -> &Impedances {
        &self.impedances
    }

    /// Export document for the last valid measurement.
    pub fn impedance_report(&self) -> Result<ImpedanceReport, ImpedanceExportError> {
        if !self.impedances.valid {
            return Err(ImpedanceExportError::NotValid);
        }
        let mut number = 0;
        let impedances = self
            .headstages
            .iter()
            .map(|hs| HeadstageImpedanceRecord {
                name: hs.prefix().to_string(),
                channels: (0..hs.num_active_channels())
                    .map(|ch| {
                        let record = ChannelImpedanceRecord {
                            name: hs.channel_name(ch).to_string(),
                            number,
                            magnitude: hs.impedance_magnitude(ch),
                            phase: hs.impedance_phase(ch),
                        };
                        number += 1;
                        record
                    })
                    .collect(),
            })
            .collect();
        Ok(ImpedanceReport { impedances })
    }

    pub fn save_impedances(&self, path: impl AsRef<Path>) -> Result<(), ImpedanceExportError> {
        let report = self.impedance_report()?;
        report.write_to(path.as_ref())?;
        info!("Saved impedances to {}", path.as_ref().display());
        Ok(())
    }
}

impl Drop for RhythmDevice {
    fn drop(&mut self) {
        self.stop_impedance_safely();
        if self.acq_thread_handle.is_some() {
            if let Err(e) = self.stop_acquisition() {
                error!("Failed to stop acquisition on drop: {}", e);
            }
        }
    }
}

/// Streaming loop: read and decode one batch under the board lock, apply
/// pending output changes, hand the batch on. Exits on stop or on a
/// disconnected consumer. A hardware error stops the board and is reported
/// before the loop exits.
fn stream_batches(
    board: &Arc<Mutex<RhythmBoard>>,
    pending: &Arc<Mutex<PendingChanges>>,
    mut decoder: FrameDecoder,
    batch_tx: &Sender<Result<SampleBatch, SensorError>>,
    stop_flag: &AtomicBool,
    status: &Arc<Mutex<DriverStatus>>,
) {
    let mut dropped: u64 = 0;
    while !stop_flag.load(Ordering::Relaxed) {
        let result = (|| {
            let mut b = lock_board(board)?;
            let frames = b.read_frames(SAMPLES_PER_BATCH)?;
            let batch = decoder.decode_batch(&frames)?;
            lock_pending(pending)?.apply(&mut b, Instant::now())?;
            Ok::<_, DriverError>(batch)
        })();

        match result {
            Ok(batch) => match batch_tx.try_send(Ok(batch)) {
                Ok(()) => {}
                Err(flume::TrySendError::Full(_)) => {
                    dropped += 1;
                    if dropped.is_power_of_two() {
                        warn!("Consumer is falling behind; {} batches dropped so far.", dropped);
                    }
                }
                Err(flume::TrySendError::Disconnected(_)) => {
                    error!("Sample channel disconnected. Stopping acquisition thread.");
                    return;
                }
            },
            Err(e) => {
                if stop_flag.load(Ordering::Relaxed) {
                    return;
                }
                error!("Error reading Rhythm frames: {}", e);
                let stopped = lock_board(board).and_then(|mut b| {
                    b.set_continuous_run_mode(false)?;
                    b.stop()
                });
                if let Err(stop_err) = stopped {
                    error!("Failed to stop board after read error: {}", stop_err);
                }
                if let Ok(mut s) = status.lock() {
                    *s = DriverStatus::Error(e.to_string());
                }
                if batch_tx.send_timeout(Err(e.into()), ERROR_REPORT_TIMEOUT).is_err() {
                    error!("Acquisition error could not be delivered to the consumer.");
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensors::mock_rhythm::{MockRhythm, MockRhythmConfig, SimulatedChip};
    use sensors::oni::registers::{CABLE_DELAY, DEVICE_RHYTHM};

    fn opened(config: MockRhythmConfig) -> (MockRhythm, RhythmDevice) {
        let mock = MockRhythm::new(config);
        let mut device = RhythmDevice::new(BoardSettings::default());
        assert!(device.open(&mock, |_| false).unwrap());
        (mock, device)
    }

    fn one_chip() -> MockRhythmConfig {
        MockRhythmConfig::default().with_chip(DataSource::PortA1, SimulatedChip::rhd2132(&[4, 5, 6]))
    }

    #[test]
    fn test_firmware_gating() {
        assert!(!FirmwareInfo { version: Some(0x0002) }.variable_sample_rate());
        assert!(FirmwareInfo { version: Some(0x0003) }.variable_sample_rate());
        assert_eq!(FirmwareInfo { version: Some(0x0004) }.aux_register_offset(), 1);
        assert_eq!(FirmwareInfo { version: Some(0x0005) }.aux_register_offset(), 0);
        assert!(!FirmwareInfo { version: None }.variable_sample_rate());
        assert_eq!(FirmwareInfo { version: None }.aux_register_offset(), 0);
    }

    #[test]
    fn test_dac_threshold_word() {
        assert_eq!(dac_threshold_word(0.0), (32768, true));
        assert_eq!(dac_threshold_word(-195.0), (31768, false));
        assert_eq!(dac_threshold_word(1.0e6), (65535, true));
    }

    #[test]
    fn test_missing_board_makes_configuration_a_no_op() {
        let mock = MockRhythm::new(MockRhythmConfig { present: false, ..Default::default() });
        let mut device = RhythmDevice::new(BoardSettings::default());
        let mut asked = 0;
        let found = device
            .open(&mock, |_| {
                asked += 1;
                asked < 3
            })
            .unwrap();
        assert!(!found);
        assert_eq!(asked, 3);
        assert_eq!(device.state(), DeviceState::Uninitialized);

        device.set_sample_rate(3, false).unwrap();
        assert_eq!(device.settings().sample_rate_index, 3);
        assert_eq!(device.set_clock_divider(6).unwrap(), 1);
        device.scan_ports().unwrap();
        assert!(device.channel_info().continuous.is_empty());
        assert!(matches!(device.start_acquisition(), Err(DriverError::DeviceNotFound(_))));
    }

    #[test]
    fn test_retry_reaches_board_once_present() {
        let mock = MockRhythm::new(MockRhythmConfig { present: false, ..one_chip() });
        let mut device = RhythmDevice::new(BoardSettings::default());
        let handle = mock.clone();
        let found = device
            .open(&mock, |_| {
                handle.set_present(true);
                true
            })
            .unwrap();
        assert!(found);
        assert_eq!(device.state(), DeviceState::Configured);
        assert_eq!(mock.connections(), 1);
    }

    #[test]
    fn test_scan_detects_chip_and_sets_delay() {
        let (mock, device) = opened(one_chip());
        let hs = device.headstage(0).unwrap();
        assert!(hs.is_connected());
        assert_eq!(hs.num_active_channels(), 32);
        assert_eq!(device.num_data_outputs(ChannelKind::Electrode), 32);
        assert_eq!(device.stream_layouts(), vec![StreamLayout { chip_id: CHIP_ID_RHD2132, channels: 32 }]);
        assert!(!device.headstage(1).unwrap().is_connected());
        // three good delays: the second one wins
        let board = device.board.as_ref().unwrap();
        assert_eq!(lock_board(board).unwrap().cable_delay(0), 5);
        assert_eq!(mock.sample_rate(), 30000.0);
    }

    #[test]
    fn test_memory_fault_blocks_scan() {
        let (mock, mut device) = opened(one_chip());
        mock.set_mem_state(BoardMemState::Error);
        assert!(matches!(device.scan_ports(), Err(DriverError::BoardMemoryFault(_))));
        assert!(matches!(device.start_acquisition(), Err(DriverError::BoardMemoryFault(_))));
    }

    #[test]
    fn test_memory_init_is_polled() {
        let config = MockRhythmConfig { mem_init_reads: 2, ..one_chip() };
        let start = Instant::now();
        let (_, device) = opened(config);
        assert!(start.elapsed() >= MEMORY_INIT_POLL);
        assert_eq!(device.state(), DeviceState::Configured);
    }

    #[test]
    fn test_clock_divider_rounds_to_even() {
        let (_, mut device) = opened(one_chip());
        assert_eq!(device.set_clock_divider(1).unwrap(), 1);
        assert_eq!(device.settings().clock_divide_factor, 0);
        assert_eq!(device.set_clock_divider(7).unwrap(), 6);
        assert_eq!(device.settings().clock_divide_factor, 3);
    }

    #[test]
    fn test_bandwidth_setters_return_realised_values() {
        let (_, mut device) = opened(one_chip());
        let upper = device.set_upper_bandwidth(7000.0).unwrap();
        assert!(upper > 0.0 && (upper - 7000.0).abs() / 7000.0 < 0.2, "upper {}", upper);
        let lower = device.set_lower_bandwidth(0.1).unwrap();
        assert!(lower > 0.0 && lower < 0.2, "lower {}", lower);
        assert_eq!(device.settings().dsp.lower_bandwidth, lower);
    }

    #[test]
    fn test_dac_channel_resolves_stream_and_channel() {
        let config = one_chip().with_chip(DataSource::PortB1, SimulatedChip::rhd2216(&[4, 5, 6]));
        let (_, mut device) = opened(config);
        assert_eq!(device.num_data_outputs(ChannelKind::Electrode), 48);
        let applied = device.set_dac_channel(2, 40).unwrap().unwrap();
        assert_eq!(applied.target, Some((1, 8)));
        assert_eq!(device.dac_routing(2), Some(applied));
        // out of range channel leaves the routing alone
        assert_eq!(device.set_dac_channel(2, 48).unwrap(), None);
        assert_eq!(device.dac_routing(2).unwrap().target, Some((1, 8)));
    }

    #[test]
    fn test_cable_length_survives_rate_change() {
        let (mock, mut device) = opened(one_chip());
        device.set_cable_length(0, 20.0).unwrap();
        assert!((device.settings().cable_length_meters[0] - 20.0 * FEET_TO_METERS).abs() < 1e-9);
        let delay = mock.register(DEVICE_RHYTHM, CABLE_DELAY) & 0xF;

        device.set_sample_rate(SAMPLE_RATE_30K, false).unwrap();
        assert_eq!(mock.register(DEVICE_RHYTHM, CABLE_DELAY) & 0xF, delay);
        assert_ne!(delay, 5);
        assert!(matches!(device.set_cable_length(4, 3.0), Err(DriverError::ConfigurationOutOfRange(_))));
    }

    #[test]
    fn test_half_channels_renumber_following_headstages() {
        let config = one_chip().with_chip(DataSource::PortB1, SimulatedChip::rhd2132(&[4, 5, 6]));
        let (_, mut device) = opened(config);
        assert_eq!(device.set_num_channels(0, 16).unwrap(), 16);
        assert_eq!(device.headstage(0).unwrap().num_active_channels(), 16);
        assert_eq!(device.headstage(2).unwrap().first_channel(), 16);
        assert_eq!(device.stream_layouts()[0].channels, 16);
        assert_eq!(device.num_data_outputs(ChannelKind::Electrode), 48);
    }

    #[test]
    fn test_channel_mapping_round_trip() {
        let config = one_chip().with_chip(DataSource::PortC1, SimulatedChip::rhd2216(&[4, 5, 6]));
        let (_, mut device) = opened(config);
        device.enable_aux(true).unwrap();
        device.enable_adc(true);

        // A1: 32 electrodes, C1 (headstage 4): 16 electrodes, then 6 aux, then 8 ADC
        assert_eq!(device.get_channel_from_headstage(4, 3), Some(35));
        assert_eq!(device.get_channel_from_headstage(4, 16), Some(48 + 3));
        assert_eq!(device.get_channel_from_headstage(0, 33), Some(49));
        assert_eq!(device.get_channel_from_headstage(NUM_HEADSTAGES, 2), Some(56));
        assert_eq!(device.get_channel_from_headstage(1, 0), None);
        assert_eq!(device.get_channel_from_headstage(4, 19), None);

        assert_eq!(device.get_headstage_channel(35), Some((4, 3)));
        assert_eq!(device.get_headstage_channel(51), Some((4, 16)));
        assert_eq!(device.get_headstage_channel(49), Some((0, 33)));
        assert_eq!(device.get_headstage_channel(54), None);
    }

    #[test]
    fn test_channel_info_lists_all_kinds() {
        let (_, mut device) = opened(one_chip());
        device.enable_aux(true).unwrap();
        device.enable_adc(true);
        device.set_adc_range(1, AdcRange::Unipolar5V).unwrap();

        let info = device.channel_info();
        assert_eq!(info.count(ChannelKind::Electrode), 32);
        assert_eq!(info.count(ChannelKind::Aux), 3);
        assert_eq!(info.count(ChannelKind::Adc), 8);
        assert_eq!(info.continuous[0].name, "CH1");
        assert_eq!(info.continuous[0].units, "uV");
        assert!(info.continuous[0].impedance.is_none());
        assert_eq!(info.continuous[32].name, "A1_AUX1");
        assert_eq!(info.continuous[36].scale, AdcRange::Unipolar5V.bit_volts());
        assert_eq!(info.events[0].num_lines, 8);
        assert_eq!(info.events[0].line_names[7], "TTL8");
        assert_eq!(device.num_channels(), 43);
        assert_eq!(device.channel_name(35).as_deref(), Some("ADC1"));
    }

    #[test]
    fn test_disable_headstage_frees_its_streams() {
        let config = MockRhythmConfig::default()
            .with_chip(DataSource::PortA1, SimulatedChip::rhd2164(&[4, 5, 6]))
            .with_chip(DataSource::PortB1, SimulatedChip::rhd2132(&[4, 5, 6]));
        let (_, mut device) = opened(config);
        assert_eq!(device.stream_layouts().len(), 3);
        assert_eq!(device.headstage(0).unwrap().num_active_channels(), 64);

        device.enable_headstage(0, false, 0, 0).unwrap();
        device.update_board_streams().unwrap();
        assert_eq!(device.stream_layouts(), vec![StreamLayout { chip_id: CHIP_ID_RHD2132, channels: 32 }]);
        assert_eq!(device.headstage(2).unwrap().stream_index(0), Some(0));
        assert!(device.enable_headstage(NUM_HEADSTAGES, true, 1, 32).is_err());
    }

    #[test]
    fn test_export_requires_valid_results() {
        let (_, device) = opened(one_chip());
        assert!(matches!(device.impedance_report(), Err(ImpedanceExportError::NotValid)));
    }
}
