//! Electrode impedance measurement.
//!
//! The on-chip Zcheck DAC drives a sine through one of three series
//! capacitors into the selected electrode. The resulting voltage is
//! captured on every stream and its component at the test frequency is
//! extracted by correlating against a reference sine and cosine. Per
//! channel, the capacitor whose reading lies closest to 250 uV is kept and
//! converted to an impedance.
//!
//! The measurement runs on its own thread and takes the hardware lock for
//! one capture at a time, checking for cancellation in between.

use std::f64::consts::PI;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ephys_types::{ImpedanceSample, Impedances};
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use sensors::rhd2000::{ChipRegisters, ZcheckScale, CHIP_ID_RHD2132, CHIP_ID_RHD2164_B, RHD2132_16CH_OFFSET};
use sensors::DriverError;

use super::board::{lock_board, AuxCmdSlot, RhythmBoard};
use super::decoder::{DataBlock, StreamLayout};
use super::settings::DspSettings;

pub const IMPEDANCE_TEST_FREQUENCY: f64 = 1000.0;
/// Samples per capture block.
pub const SAMPLES_PER_BLOCK: usize = 256;
/// Grace period for a cancelled measurement before the board is stopped directly.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(3);
/// Longest a full measurement may take before it is aborted.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(120);

const DAC_AMPLITUDE: f64 = 128.0;
const DAC_VOLTAGE_AMPLITUDE: f64 = DAC_AMPLITUDE * (1.225 / 256.0);
/// Reading favoured when choosing between capacitor ranges, in uV.
const BEST_AMPLITUDE: f64 = 250.0;
/// On-chip parasitic capacitance including amplifier input capacitance.
const PARASITIC_CAPACITANCE: f64 = 14.0e-12;
/// Bank used for the Zcheck register configuration.
const ZCHECK_CONFIG_BANK: u32 = 3;
const ZCHECK_DAC_BANK: u32 = 1;
const CHANNELS_PER_CHIP: usize = 32;

/// Returns the realisable test frequency for `desired`, or
/// `ConfigurationOutOfRange` when it falls outside the amplifier passband
/// margins or needs a period outside 4..=1024 samples.
pub fn validate_frequency(desired: f64, sample_rate: f64, dsp: &DspSettings) -> Result<f64, DriverError> {
    let upper_limit = dsp.upper_bandwidth / 1.5;
    let mut lower_limit = dsp.lower_bandwidth * 1.5;
    if dsp.enabled && dsp.cutoff_freq > dsp.lower_bandwidth {
        lower_limit = dsp.cutoff_freq * 1.5;
    }

    if desired > 0.0 {
        let period = (sample_rate / desired) as i64;
        if (4..=1024).contains(&period) && desired >= lower_limit && desired <= upper_limit {
            return Ok(sample_rate / period as f64);
        }
    }
    Err(DriverError::out_of_range(format!(
        "Impedance test frequency {} Hz invalid for {} Hz sampling and a {:.2}..{:.2} Hz window",
        desired, sample_rate, lower_limit, upper_limit
    )))
}

/// Capture length and analysis window for one test frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturePlan {
    /// Samples per stimulus period.
    pub period: usize,
    /// Periods inside the analysis window.
    pub num_periods: usize,
    /// Blocks of `SAMPLES_PER_BLOCK` per capture.
    pub num_blocks: usize,
}

impl CapturePlan {
    /// At least 20 ms and 5 periods of signal, plus two periods to settle.
    pub fn new(sample_rate: f64, frequency: f64) -> Self {
        let num_periods = ((0.020 * frequency) as usize).max(5);
        let exact_period = sample_rate / frequency;
        let num_blocks = (((num_periods as f64 + 2.0) * exact_period / 60.0).ceil() as usize).max(2);
        Self { period: exact_period as usize, num_periods, num_blocks }
    }

    pub fn num_samples(&self) -> usize {
        SAMPLES_PER_BLOCK * self.num_blocks
    }

    /// Inclusive window of whole periods pushed to the end of the capture.
    pub fn window(&self) -> (usize, usize) {
        let period = self.period as i64;
        let mut start = 0i64;
        let mut end = start + self.num_periods as i64 * period - 1;
        while end < self.num_samples() as i64 - period {
            start += period;
            end += period;
        }
        (start.max(0) as usize, end.max(0) as usize)
    }
}

/// Magnitude (uV) and phase (degrees) of one channel at one capacitor range.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Reading {
    pub magnitude: f64,
    pub phase: f64,
}

/// In-phase and quadrature amplitude of `frequency` within
/// `data[start..=end]`. The reference phase counts from sample 0.
pub fn amplitude_of_freq_component(data: &[f64], start: usize, end: usize, sample_rate: f64, frequency: f64) -> (f64, f64) {
    let Some(window) = data.get(start..=end) else {
        return (0.0, 0.0);
    };
    let k = 2.0 * PI * frequency / sample_rate;
    let (mut mean_i, mut mean_q) = (0.0, 0.0);
    for (offset, &x) in window.iter().enumerate() {
        let t = (start + offset) as f64;
        mean_i += x * (k * t).cos();
        mean_q += x * -(k * t).sin();
    }
    let length = window.len() as f64;
    (2.0 * mean_i / length, 2.0 * mean_q / length)
}

pub fn measure_complex_amplitude(data: &[f64], plan: &CapturePlan, sample_rate: f64, frequency: f64) -> Reading {
    let (start, end) = plan.window();
    let (i, q) = amplitude_of_freq_component(data, start, end, sample_rate, frequency);
    Reading { magnitude: i.hypot(q), phase: q.atan2(i).to_degrees() }
}

/// Index of the reading closest to 250 uV on a log scale; 0 if none compare.
pub fn select_best_range(magnitudes: &[f64; 3]) -> usize {
    let mut best = 0;
    let mut min_distance = f64::MAX;
    for (index, &magnitude) in magnitudes.iter().enumerate() {
        let distance = (magnitude / BEST_AMPLITUDE).ln().abs();
        if distance < min_distance {
            best = index;
            min_distance = distance;
        }
    }
    best
}

/// Removes a parallel capacitance from a measured impedance.
pub fn factor_out_parallel_capacitance(magnitude: f64, phase: f64, frequency: f64, capacitance: f64) -> (f64, f64) {
    let measured_r = magnitude * phase.to_radians().cos();
    let measured_x = magnitude * phase.to_radians().sin();

    let cap_term = 2.0 * PI * frequency * capacitance;
    let x_term = cap_term * (measured_r * measured_r + measured_x * measured_x);
    let denominator = cap_term * x_term + 2.0 * cap_term * measured_x + 1.0;
    let true_r = measured_r / denominator;
    let true_x = (measured_x + x_term) / denominator;

    (true_r.hypot(true_x), true_x.atan2(true_r).to_degrees())
}

/// Empirical fit for the resistance overestimate at low sample rates.
pub fn empirical_resistance_correction(magnitude: f64, phase: f64, sample_rate: f64) -> (f64, f64) {
    let mut r = magnitude * phase.to_radians().cos();
    let x = magnitude * phase.to_radians().sin();
    r /= 10.0 * (-sample_rate / 2500.0).exp() * (2.0 * PI * sample_rate / 15000.0).cos() + 1.0;
    (r.hypot(x), x.atan2(r).to_degrees())
}

/// Converts the per-range readings into impedances.
///
/// `readings[stream][chip_channel][range]`; results carry the stream slot
/// and the chip channel.
pub fn reduce(
    readings: &[Vec<[Reading; 3]>],
    streams: &[StreamLayout],
    frequency: f64,
    sample_rate: f64,
) -> Vec<ImpedanceSample> {
    let relative_freq = frequency / sample_rate;
    let period = sample_rate / frequency;
    let mut samples = Vec::new();

    for (stream, layout) in streams.iter().enumerate() {
        let ch_offset = if layout.chip_id == CHIP_ID_RHD2132 && layout.channels == 16 {
            RHD2132_16CH_OFFSET
        } else {
            0
        };
        for channel in 0..layout.channels {
            let Some(ranges) = readings.get(stream).and_then(|r| r.get(channel + ch_offset)) else {
                continue;
            };
            let best = select_best_range(&[ranges[0].magnitude, ranges[1].magnitude, ranges[2].magnitude]);
            let c_series = ZcheckScale::ALL[best].capacitance();

            let current = 2.0 * PI * frequency * DAC_VOLTAGE_AMPLITUDE * c_series;
            let magnitude = 1.0e-6 * (ranges[best].magnitude / current) * (18.0 * relative_freq * relative_freq + 1.0);
            // three-command SPI pipeline delay
            let phase = ranges[best].phase + 360.0 * (3.0 / period);

            let (magnitude, phase) =
                factor_out_parallel_capacitance(magnitude, phase, frequency, PARASITIC_CAPACITANCE);
            let (magnitude, phase) = empirical_resistance_correction(magnitude, phase, sample_rate);

            samples.push(ImpedanceSample {
                stream,
                channel: channel + ch_offset,
                magnitude: magnitude as f32,
                phase: phase as f32,
            });
        }
    }
    samples
}

/// Everything a measurement needs from the device, captured when it starts.
#[derive(Debug, Clone)]
pub struct MeasurementSetup {
    pub sample_rate: f64,
    pub dsp: DspSettings,
    pub fast_settle_enabled: bool,
    pub fast_ttl_settle_enabled: bool,
    /// Enabled streams in slot order.
    pub streams: Vec<StreamLayout>,
    /// Chip register state the Zcheck configuration is derived from.
    pub registers: ChipRegisters,
}

fn check_cancel(cancel: &CancellationToken) -> Result<(), DriverError> {
    if cancel.is_cancelled() {
        return Err(DriverError::Cancelled);
    }
    Ok(())
}

pub struct ImpedanceMeter {
    board: Arc<Mutex<RhythmBoard>>,
    setup: MeasurementSetup,
}

impl ImpedanceMeter {
    pub fn new(board: Arc<Mutex<RhythmBoard>>, setup: MeasurementSetup) -> Self {
        Self { board, setup }
    }

    /// Runs a full measurement. The board is returned to its streaming
    /// command banks afterwards, whether or not the measurement completed.
    pub fn run(&mut self, cancel: &CancellationToken) -> Result<Impedances, DriverError> {
        info!("Running impedance measurement");
        let measured = self.measure(cancel);
        debug!("Restoring board settings");
        let restored = self.restore();
        let impedances = measured?;
        restored?;
        info!("Impedance measurement finished: {} channels", impedances.samples.len());
        Ok(impedances)
    }

    fn measure(&mut self, cancel: &CancellationToken) -> Result<Impedances, DriverError> {
        let sample_rate = self.setup.sample_rate;
        let frequency = validate_frequency(IMPEDANCE_TEST_FREQUENCY, sample_rate, &self.setup.dsp)?;
        check_cancel(cancel)?;

        let mut registers = self.setup.registers.clone();
        {
            let dac = registers.command_list_zcheck_dac(frequency, DAC_AMPLITUDE)?;
            let mut board = lock_board(&self.board)?;
            board.upload_command_list(&dac, AuxCmdSlot::AuxCmd1, ZCHECK_DAC_BANK)?;
            board.select_aux_command_length(AuxCmdSlot::AuxCmd1, 0, dac.len() as u32 - 1)?;
            if self.setup.fast_ttl_settle_enabled {
                board.enable_external_fast_settle(false)?;
            }
            board.select_aux_command_bank_all_ports(AuxCmdSlot::AuxCmd1, ZCHECK_DAC_BANK)?;
        }

        let plan = CapturePlan::new(sample_rate, frequency);
        debug!("Impedance test at {:.2} Hz: {:?}", frequency, plan);
        check_cancel(cancel)?;

        let dsp = &self.setup.dsp;
        registers.set_dsp_cutoff_freq(dsp.cutoff_freq);
        registers.set_lower_bandwidth(dsp.lower_bandwidth);
        registers.set_upper_bandwidth(dsp.upper_bandwidth);
        registers.enable_dsp(dsp.enabled);
        registers.enable_zcheck(true);
        {
            let config = registers.command_list_register_config(false);
            let mut board = lock_board(&self.board)?;
            board.upload_command_list(&config, AuxCmdSlot::AuxCmd3, ZCHECK_CONFIG_BANK)?;
            board.select_aux_command_length(AuxCmdSlot::AuxCmd3, 0, config.len() as u32 - 1)?;
            board.select_aux_command_bank_all_ports(AuxCmdSlot::AuxCmd3, ZCHECK_CONFIG_BANK)?;
            board.set_continuous_run_mode(false)?;
            board.set_max_samples(plan.num_samples())?;
        }
        check_cancel(cancel)?;

        let streams = self.setup.streams.clone();
        let has_second_miso = streams.iter().any(|s| s.chip_id == CHIP_ID_RHD2164_B);
        let mut readings = vec![vec![[Reading::default(); 3]; CHANNELS_PER_CHIP]; streams.len()];

        for (range, scale) in ZcheckScale::ALL.into_iter().enumerate() {
            info!("Measuring impedances with {:?} series capacitor", scale);
            registers.set_zcheck_scale(scale);

            for channel in 0..CHANNELS_PER_CHIP {
                check_cancel(cancel)?;
                let block = self.capture(&mut registers, channel as u8, &plan)?;
                for (stream, layout) in streams.iter().enumerate() {
                    if layout.chip_id != CHIP_ID_RHD2164_B {
                        let data = block.amplifier_microvolts(channel, stream);
                        readings[stream][channel][range] = measure_complex_amplitude(&data, &plan, sample_rate, frequency);
                    }
                }

                // second die of an RHD2164 answers on channels 32-63
                if has_second_miso {
                    check_cancel(cancel)?;
                    let block = self.capture(&mut registers, (channel + CHANNELS_PER_CHIP) as u8, &plan)?;
                    for (stream, layout) in streams.iter().enumerate() {
                        if layout.chip_id == CHIP_ID_RHD2164_B {
                            let data = block.amplifier_microvolts(channel, stream);
                            readings[stream][channel][range] =
                                measure_complex_amplitude(&data, &plan, sample_rate, frequency);
                        }
                    }
                }
            }
        }

        Ok(Impedances { valid: true, samples: reduce(&readings, &streams, frequency, sample_rate) })
    }

    fn capture(&self, registers: &mut ChipRegisters, zcheck_channel: u8, plan: &CapturePlan) -> Result<DataBlock, DriverError> {
        registers.set_zcheck_channel(zcheck_channel)?;
        let config = registers.command_list_register_config(false);

        let mut board = lock_board(&self.board)?;
        board.upload_command_list(&config, AuxCmdSlot::AuxCmd3, ZCHECK_CONFIG_BANK)?;
        board.run()?;
        let frames = board.read_frames(plan.num_samples());
        board.stop()?;
        DataBlock::from_frames(&frames?, self.setup.streams.len())
    }

    fn restore(&self) -> Result<(), DriverError> {
        let mut board = lock_board(&self.board)?;
        board.set_continuous_run_mode(false)?;
        board.set_max_time_step(0)?;
        // back to the flat digital-out list
        board.select_aux_command_bank_all_ports(AuxCmdSlot::AuxCmd1, 0)?;
        board.select_aux_command_length(AuxCmdSlot::AuxCmd1, 0, 1)?;
        board.select_aux_command_bank_all_ports(
            AuxCmdSlot::AuxCmd3,
            if self.setup.fast_settle_enabled { 2 } else { 1 },
        )?;
        if self.setup.fast_ttl_settle_enabled {
            board.enable_external_fast_settle(true)?;
        }
        Ok(())
    }
}

pub type MeasurementResult = Result<Impedances, DriverError>;

/// Handle to a measurement running on its own thread.
pub struct ImpedanceTask {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    done_rx: flume::Receiver<MeasurementResult>,
}

impl ImpedanceTask {
    pub fn spawn(board: Arc<Mutex<RhythmBoard>>, setup: MeasurementSetup) -> Result<Self, DriverError> {
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = flume::bounded(1);
        let token = cancel.clone();
        let mut meter = ImpedanceMeter::new(board, setup);

        let handle = thread::Builder::new()
            .name("rhythm_zcheck".into())
            .spawn(move || {
                let result = meter.run(&token);
                if let Err(e) = &result {
                    warn!("Impedance measurement ended without results: {}", e);
                }
                let _ = done_tx.send(result);
            })
            .map_err(|e| DriverError::Other(format!("Failed to spawn impedance thread: {}", e)))?;

        Ok(Self { cancel, handle: Some(handle), done_rx })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Result of a finished measurement, without blocking.
    pub fn try_result(&mut self) -> Option<MeasurementResult> {
        match self.done_rx.try_recv() {
            Ok(result) => {
                self.join();
                Some(result)
            }
            Err(flume::TryRecvError::Empty) => None,
            Err(flume::TryRecvError::Disconnected) => {
                self.join();
                Some(Err(DriverError::Other("Impedance thread exited without a result".into())))
            }
        }
    }

    fn wait(&mut self, timeout: Duration) -> Option<MeasurementResult> {
        match self.done_rx.recv_timeout(timeout) {
            Ok(result) => {
                self.join();
                Some(result)
            }
            Err(flume::RecvTimeoutError::Timeout) => None,
            Err(flume::RecvTimeoutError::Disconnected) => {
                self.join();
                Some(Err(DriverError::Other("Impedance thread exited without a result".into())))
            }
        }
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Impedance thread panicked.");
            }
        }
    }

    /// Cancels the measurement and waits up to `STOP_TIMEOUT`; if the thread
    /// is still busy the board is stopped directly. Returns the outcome when
    /// the thread delivered one.
    pub fn stop_safely(&mut self, board: &Arc<Mutex<RhythmBoard>>) -> Option<MeasurementResult> {
        if self.handle.is_none() {
            return None;
        }
        info!("Impedance measurement in progress. Stopping it.");
        self.cancel.cancel();
        let result = self.wait(STOP_TIMEOUT);
        if result.is_none() {
            error!("Impedance measurement did not exit; stopping the board.");
            match lock_board(board) {
                Ok(mut b) => {
                    if let Err(e) = b.stop() {
                        error!("Forced board stop failed: {}", e);
                    }
                }
                Err(e) => error!("{}", e),
            }
            // the thread is left to finish on its own
            self.handle = None;
        }
        result
    }

    /// Waits up to `WAIT_TIMEOUT` for the measurement to finish, then stops it.
    pub fn wait_safely(&mut self, board: &Arc<Mutex<RhythmBoard>>) -> Option<MeasurementResult> {
        if self.handle.is_none() {
            return None;
        }
        match self.wait(WAIT_TIMEOUT) {
            Some(result) => Some(result),
            None => {
                warn!("Impedance measurement took too much time. Aborting.");
                self.stop_safely(board)
            }
        }
    }
}

impl Drop for ImpedanceTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dsp() -> DspSettings {
        DspSettings::default()
    }

    #[test]
    fn test_frequency_validation() {
        assert_eq!(validate_frequency(1000.0, 30000.0, &dsp()).unwrap(), 1000.0);
        // 30000 / 7 truncates to a 4285 Hz period of 7 samples
        let actual = validate_frequency(4285.0, 30000.0, &dsp()).unwrap();
        assert_eq!(actual, 30000.0 / 7.0);
        // above upper bandwidth / 1.5
        assert!(validate_frequency(6000.0, 30000.0, &dsp()).is_err());
        // period below 4 samples
        assert!(validate_frequency(1000.0, 3000.0, &dsp()).is_err());
        assert!(validate_frequency(0.0, 30000.0, &dsp()).is_err());
    }

    #[test]
    fn test_dsp_cutoff_raises_lower_limit() {
        let settings = DspSettings { enabled: true, cutoff_freq: 800.0, lower_bandwidth: 1.0, ..dsp() };
        assert!(matches!(
            validate_frequency(1000.0, 30000.0, &settings),
            Err(DriverError::ConfigurationOutOfRange(_))
        ));
        let disabled = DspSettings { enabled: false, ..settings };
        assert!(validate_frequency(1000.0, 30000.0, &disabled).is_ok());
    }

    #[test]
    fn test_capture_plan_at_30k() {
        let plan = CapturePlan::new(30000.0, 1000.0);
        assert_eq!(plan, CapturePlan { period: 30, num_periods: 20, num_blocks: 11 });
        let (start, end) = plan.window();
        assert_eq!(end - start + 1, 600);
        assert!(end < plan.num_samples());
        assert!(end >= plan.num_samples() - plan.period);
        assert_eq!(start % plan.period, 0);
    }

    #[test]
    fn test_capture_plan_minimums() {
        let plan = CapturePlan::new(1000.0, 100.0);
        assert_eq!(plan.num_periods, 5);
        assert_eq!(plan.num_blocks, 2);
    }

    #[test]
    fn test_lock_in_recovers_amplitude_and_phase() {
        let fs = 30000.0;
        let f = 1000.0;
        let plan = CapturePlan::new(fs, f);
        let data: Vec<f64> = (0..plan.num_samples())
            .map(|t| 250.0 * (2.0 * PI * f * t as f64 / fs + 0.5).cos() + 12.0)
            .collect();
        let reading = measure_complex_amplitude(&data, &plan, fs, f);
        assert!((reading.magnitude - 250.0).abs() < 1e-6, "{:?}", reading);
        assert!((reading.phase - 0.5f64.to_degrees()).abs() < 1e-6, "{:?}", reading);
    }

    #[test]
    fn test_best_range_is_closest_on_log_scale() {
        assert_eq!(select_best_range(&[50.0, 250.0, 900.0]), 1);
        assert_eq!(select_best_range(&[240.0, 2500.0, 25000.0]), 0);
        assert_eq!(select_best_range(&[0.0, 0.0, 0.0]), 0);
    }

    #[test]
    fn test_parasitic_correction_without_capacitance_is_identity() {
        let (m, p) = factor_out_parallel_capacitance(1.0e5, -45.0, 1000.0, 0.0);
        assert!((m - 1.0e5).abs() < 1e-6);
        assert!((p + 45.0).abs() < 1e-9);
    }

    #[test]
    fn test_parasitic_correction_raises_magnitude_of_capacitive_load() {
        let (m, _) = factor_out_parallel_capacitance(1.0e6, -80.0, 1000.0, PARASITIC_CAPACITANCE);
        assert!(m > 1.0e6);
    }

    #[test]
    fn test_empirical_correction_vanishes_at_high_rates() {
        let (m, p) = empirical_resistance_correction(1.0e5, -30.0, 30000.0);
        assert!((m - 1.0e5).abs() / 1.0e5 < 1e-3);
        assert!((p + 30.0).abs() < 0.1);
        let (low, _) = empirical_resistance_correction(1.0e5, 0.0, 1000.0);
        assert!(low < 1.0e5);
    }

    #[test]
    fn test_reduce_uses_best_range_and_offsets_16_channel_chips() {
        let fs = 30000.0;
        let f = 1000.0;
        // 1 pF range reading for a 100 kOhm electrode
        let expected_uv = 1.0e5 * 2.0 * PI * f * DAC_VOLTAGE_AMPLITUDE * 1.0e-12 * 1.0e6;
        let mut per_channel = vec![[Reading::default(); 3]; 32];
        for ranges in per_channel.iter_mut() {
            *ranges = [
                Reading { magnitude: expected_uv / 10.0, phase: -90.0 },
                Reading { magnitude: expected_uv, phase: -90.0 },
                Reading { magnitude: expected_uv * 10.0, phase: -90.0 },
            ];
        }
        let streams = [StreamLayout { chip_id: CHIP_ID_RHD2132, channels: 16 }];
        let samples = reduce(&[per_channel], &streams, f, fs);
        assert_eq!(samples.len(), 16);
        assert_eq!(samples[0].channel, 8);
        assert_eq!(samples[15].channel, 23);
        let m = samples[0].magnitude as f64;
        assert!((m - 1.0e5).abs() / 1.0e5 < 0.05, "magnitude {}", m);
    }
}
