//! Simulated Rhythm board behind an ONI context.
//!
//! The simulation keeps a register file and command RAM, executes the
//! uploaded auxiliary command lists against modelled RHD2000 chips and
//! synthesizes Rhythm frames for whatever streams are enabled. Chips only
//! answer correctly at the cable delays listed for them, so port scans and
//! impedance measurements run end to end without hardware.

mod chip;
mod device;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{info, warn};

pub use chip::SimulatedChip;
pub use device::rhythm_frame_len;

use self::device::MockState;
use crate::oni::registers::{BoardMemState, DataSource};
use crate::oni::{ContextOption, OniConnector, OniContext, OniFrame};
use crate::types::DriverError;

/// What the simulated board looks like.
#[derive(Debug, Clone)]
pub struct MockRhythmConfig {
    /// When false, every connect attempt fails with `DeviceNotFound`.
    pub present: bool,
    /// Firmware (major, minor). Versions up to 0.4 report aux results one sample late.
    pub firmware_version: (u8, u8),
    /// Chips keyed by the MISO line they answer on.
    pub chips: Vec<(DataSource, SimulatedChip)>,
    /// Memory state reported after the initial `Init` reads.
    pub mem_state: BoardMemState,
    /// Number of memory-state reads that report `Init` first.
    pub mem_init_reads: u32,
    /// Busy reads after a clock change; `None` keeps the clock busy forever.
    pub clock_busy_reads: Option<u32>,
    /// Constant TTL input word.
    pub ttl_in: u16,
    /// Raw value of ADC 0; ADC n reads `adc_value + 256 * n`.
    pub adc_value: u16,
    /// Emit a frame from another device every `n` frames.
    pub foreign_frame_interval: Option<u32>,
    /// Throttle frame reads to the configured sample rate.
    pub realtime: bool,
}

impl Default for MockRhythmConfig {
    fn default() -> Self {
        Self {
            present: true,
            firmware_version: (0, 5),
            chips: Vec::new(),
            mem_state: BoardMemState::Ok,
            mem_init_reads: 0,
            clock_busy_reads: Some(2),
            ttl_in: 0,
            adc_value: 32768,
            foreign_frame_interval: None,
            realtime: false,
        }
    }
}

impl MockRhythmConfig {
    pub fn with_chip(mut self, source: DataSource, chip: SimulatedChip) -> Self {
        self.chips.push((source, chip));
        self
    }
}

/// Connector and inspection handle for a simulated board.
///
/// Contexts opened through [`OniConnector::connect`] share state with this
/// handle, so tests can look at register writes and TTL frames while a
/// device drives the board.
#[derive(Clone)]
pub struct MockRhythm {
    state: Arc<Mutex<MockState>>,
}

impl MockRhythm {
    pub fn new(config: MockRhythmConfig) -> Self {
        Self { state: Arc::new(Mutex::new(MockState::new(config))) }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current value of a register.
    pub fn register(&self, dev_idx: u32, addr: u32) -> u32 {
        self.lock().peek(dev_idx, addr)
    }

    /// Every register write so far, as (device, address, value).
    pub fn register_writes(&self) -> Vec<(u32, u32, u32)> {
        self.lock().register_writes.clone()
    }

    /// Payloads written to `dev_idx`, oldest first.
    pub fn frames_written(&self, dev_idx: u32) -> Vec<Vec<u8>> {
        self.lock()
            .frame_writes
            .iter()
            .filter(|(dev, _)| *dev == dev_idx)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// TTL output words written so far.
    pub fn ttl_outputs(&self) -> Vec<u32> {
        self.frames_written(crate::oni::registers::DEVICE_TTL)
            .iter()
            .filter(|p| p.len() >= 4)
            .map(|p| u32::from_le_bytes([p[0], p[1], p[2], p[3]]))
            .collect()
    }

    pub fn clear_logs(&self) {
        let mut state = self.lock();
        state.register_writes.clear();
        state.frame_writes.clear();
    }

    /// True between a run and the following stop.
    pub fn is_acquiring(&self) -> bool {
        self.lock().acquiring
    }

    /// Number of contexts opened.
    pub fn connections(&self) -> usize {
        self.lock().connections
    }

    /// Makes every following frame read fail.
    pub fn set_frame_read_failure(&self, fail: bool) {
        self.lock().fail_frame_reads = fail;
    }

    pub fn set_mem_state(&self, state: BoardMemState) {
        self.lock().config.mem_state = state;
    }

    pub fn set_present(&self, present: bool) {
        self.lock().config.present = present;
    }

    /// Sample rate the hub clock is currently programmed for.
    pub fn sample_rate(&self) -> f64 {
        self.lock().sample_rate()
    }
}

impl OniConnector for MockRhythm {
    fn connect(&self) -> Result<Box<dyn OniContext>, DriverError> {
        let mut state = self.lock();
        if !state.config.present {
            warn!("Simulated Rhythm board is not present");
            return Err(DriverError::DeviceNotFound("No Rhythm board answered".to_string()));
        }
        state.connections += 1;
        let (major, minor) = state.config.firmware_version;
        info!(
            "Opened simulated Rhythm board (firmware {}.{}, {} chips)",
            major,
            minor,
            state.config.chips.len()
        );
        Ok(Box::new(MockContext { state: Arc::clone(&self.state) }))
    }
}

/// Context handed to the transport.
struct MockContext {
    state: Arc<Mutex<MockState>>,
}

impl MockContext {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl OniContext for MockContext {
    fn read_register(&mut self, dev_idx: u32, addr: u32) -> Result<u32, DriverError> {
        self.lock().read_register(dev_idx, addr)
    }

    fn write_register(&mut self, dev_idx: u32, addr: u32, value: u32) -> Result<(), DriverError> {
        self.lock().write_register(dev_idx, addr, value)
    }

    fn read_frame(&mut self) -> Result<OniFrame, DriverError> {
        self.lock().read_frame()
    }

    fn write_frame(&mut self, dev_idx: u32, payload: &[u8]) -> Result<(), DriverError> {
        self.lock().write_frame(dev_idx, payload)
    }

    fn set_option(&mut self, option: ContextOption, value: u32) -> Result<(), DriverError> {
        self.lock().set_option(option, value)
    }
}
