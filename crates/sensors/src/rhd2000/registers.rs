//! Register model of the RHD2000 amplifier chip.
//!
//! Holds the bit fields of RAM registers 0 to 21 and derives their byte
//! values. Bandwidth and DSP setters quantize the request to what the
//! on-chip resistor DACs can realize and return the value actually obtained.

use std::f64::consts::PI;

use crate::types::DriverError;

/// Series capacitor used by the impedance test DAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZcheckScale {
    Cs100fF,
    Cs1pF,
    Cs10pF,
}

impl ZcheckScale {
    pub const ALL: [ZcheckScale; 3] = [ZcheckScale::Cs100fF, ZcheckScale::Cs1pF, ZcheckScale::Cs10pF];

    fn register_bits(self) -> u8 {
        match self {
            ZcheckScale::Cs100fF => 0x00,
            ZcheckScale::Cs1pF => 0x01,
            ZcheckScale::Cs10pF => 0x03,
        }
    }

    /// Capacitance in farads.
    pub fn capacitance(self) -> f64 {
        match self {
            ZcheckScale::Cs100fF => 0.1e-12,
            ZcheckScale::Cs1pF => 1.0e-12,
            ZcheckScale::Cs10pF => 10.0e-12,
        }
    }
}

// RH1 resistor DAC
const RH1_BASE: f64 = 2200.0;
const RH1_DAC1_UNIT: f64 = 600.0;
const RH1_DAC2_UNIT: f64 = 29400.0;
const RH1_DAC1_STEPS: u32 = 63;
const RH1_DAC2_STEPS: u32 = 31;

// RH2 resistor DAC
const RH2_BASE: f64 = 8700.0;
const RH2_DAC1_UNIT: f64 = 763.0;
const RH2_DAC2_UNIT: f64 = 38400.0;
const RH2_DAC1_STEPS: u32 = 63;
const RH2_DAC2_STEPS: u32 = 31;

// RL resistor DAC
const RL_BASE: f64 = 3500.0;
const RL_DAC1_UNIT: f64 = 175.0;
const RL_DAC2_UNIT: f64 = 12700.0;
const RL_DAC3_UNIT: f64 = 3_000_000.0;
const RL_DAC1_STEPS: u32 = 127;
const RL_DAC2_STEPS: u32 = 63;

pub const MAX_UPPER_BANDWIDTH: f64 = 30000.0;
pub const MAX_LOWER_BANDWIDTH: f64 = 1500.0;

/// Bit-level model of RHD2000 RAM registers 0..=21.
#[derive(Debug, Clone, PartialEq)]
pub struct ChipRegisters {
    sample_rate: f64,

    // Register 0
    adc_reference_bw: u8,
    amp_fast_settle: u8,
    amp_vref_enable: u8,
    adc_comparator_bias: u8,
    adc_comparator_select: u8,
    // Register 1
    vdd_sense_enable: u8,
    adc_buffer_bias: u8,
    // Register 2
    mux_bias: u8,
    // Register 3
    mux_load: u8,
    temp_s1: u8,
    temp_s2: u8,
    temp_en: u8,
    dig_out_hiz: u8,
    dig_out: u8,
    // Register 4
    weak_miso: u8,
    twos_comp: u8,
    abs_mode: u8,
    dsp_en: u8,
    dsp_cutoff_freq: u8,
    // Register 5
    zcheck_dac_power: u8,
    zcheck_load: u8,
    zcheck_scale: u8,
    zcheck_conn_all: u8,
    zcheck_sel_pol: u8,
    zcheck_en: u8,
    // Register 7
    zcheck_select: u8,
    // Registers 8-13
    off_chip_rh1: u8,
    off_chip_rh2: u8,
    off_chip_rl: u8,
    adc_aux1_en: u8,
    adc_aux2_en: u8,
    adc_aux3_en: u8,
    rh1_dac1: u8,
    rh1_dac2: u8,
    rh2_dac1: u8,
    rh2_dac2: u8,
    rl_dac1: u8,
    rl_dac2: u8,
    rl_dac3: u8,
    // Registers 14-21
    amp_pwr: [bool; 64],
}

impl ChipRegisters {
    /// Power-on configuration for a chip sampled at `sample_rate` Hz.
    pub fn new(sample_rate: f64) -> Self {
        let mut regs = ChipRegisters {
            sample_rate,
            adc_reference_bw: 3,
            amp_fast_settle: 0,
            amp_vref_enable: 1,
            adc_comparator_bias: 3,
            adc_comparator_select: 2,
            vdd_sense_enable: 1,
            adc_buffer_bias: 0,
            mux_bias: 0,
            mux_load: 0,
            temp_s1: 0,
            temp_s2: 0,
            temp_en: 0,
            dig_out_hiz: 1,
            dig_out: 0,
            weak_miso: 1,
            twos_comp: 0,
            abs_mode: 0,
            dsp_en: 1,
            dsp_cutoff_freq: 0,
            zcheck_dac_power: 1,
            zcheck_load: 0,
            zcheck_scale: ZcheckScale::Cs100fF.register_bits(),
            zcheck_conn_all: 0,
            zcheck_sel_pol: 0,
            zcheck_en: 0,
            zcheck_select: 0,
            off_chip_rh1: 0,
            off_chip_rh2: 0,
            off_chip_rl: 0,
            adc_aux1_en: 1,
            adc_aux2_en: 1,
            adc_aux3_en: 1,
            rh1_dac1: 0,
            rh1_dac2: 0,
            rh2_dac1: 0,
            rh2_dac2: 0,
            rl_dac1: 0,
            rl_dac2: 0,
            rl_dac3: 0,
            amp_pwr: [true; 64],
        };
        regs.define_sample_rate(sample_rate);
        regs.set_dsp_cutoff_freq(1.0);
        regs.set_upper_bandwidth(10000.0);
        regs.set_lower_bandwidth(1.0);
        regs
    }

    /// Sets the per-channel sample rate and the MUX/ADC bias currents it requires.
    pub fn define_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
        self.mux_load = 0;
        let (mux_bias, adc_buffer_bias) = if sample_rate < 3334.0 {
            (40, 32)
        } else if sample_rate < 4001.0 {
            (40, 16)
        } else if sample_rate < 5001.0 {
            (40, 8)
        } else if sample_rate < 6251.0 {
            (32, 8)
        } else if sample_rate < 8001.0 {
            (26, 8)
        } else if sample_rate < 10001.0 {
            (18, 4)
        } else if sample_rate < 12501.0 {
            (16, 3)
        } else if sample_rate < 15001.0 {
            (7, 3)
        } else {
            (4, 2)
        };
        self.mux_bias = mux_bias;
        self.adc_buffer_bias = adc_buffer_bias;
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn set_fast_settle(&mut self, enabled: bool) {
        self.amp_fast_settle = enabled as u8;
    }

    pub fn set_dig_out_low(&mut self) {
        self.dig_out = 0;
        self.dig_out_hiz = 0;
    }

    pub fn set_dig_out_high(&mut self) {
        self.dig_out = 1;
        self.dig_out_hiz = 0;
    }

    pub fn set_dig_out_hiz(&mut self) {
        self.dig_out = 0;
        self.dig_out_hiz = 1;
    }

    pub fn enable_aux1(&mut self, enabled: bool) {
        self.adc_aux1_en = enabled as u8;
    }

    pub fn enable_aux2(&mut self, enabled: bool) {
        self.adc_aux2_en = enabled as u8;
    }

    pub fn enable_aux3(&mut self, enabled: bool) {
        self.adc_aux3_en = enabled as u8;
    }

    pub fn enable_dsp(&mut self, enabled: bool) {
        self.dsp_en = enabled as u8;
    }

    pub fn enable_zcheck(&mut self, enabled: bool) {
        self.zcheck_en = enabled as u8;
    }

    pub fn set_zcheck_dac_power(&mut self, enabled: bool) {
        self.zcheck_dac_power = enabled as u8;
    }

    pub fn set_zcheck_scale(&mut self, scale: ZcheckScale) {
        self.zcheck_scale = scale.register_bits();
    }

    pub fn set_zcheck_polarity_negative(&mut self, negative: bool) {
        self.zcheck_sel_pol = negative as u8;
    }

    /// Routes the impedance test DAC to amplifier `channel` (0..=63).
    pub fn set_zcheck_channel(&mut self, channel: u8) -> Result<(), DriverError> {
        if channel > 63 {
            return Err(DriverError::out_of_range(format!(
                "Zcheck channel {} out of range 0..=63",
                channel
            )));
        }
        self.zcheck_select = channel;
        Ok(())
    }

    pub fn zcheck_channel(&self) -> u8 {
        self.zcheck_select
    }

    pub fn set_amp_powered(&mut self, channel: usize, powered: bool) {
        if let Some(p) = self.amp_pwr.get_mut(channel) {
            *p = powered;
        }
    }

    pub fn power_up_all_amps(&mut self) {
        self.amp_pwr = [true; 64];
    }

    pub fn power_down_all_amps(&mut self) {
        self.amp_pwr = [false; 64];
    }

    pub(super) fn set_temp_sensor_switches(&mut self, s1: bool, s2: bool) {
        self.temp_s1 = s1 as u8;
        self.temp_s2 = s2 as u8;
    }

    pub(super) fn enable_temp_sensor(&mut self, enabled: bool) {
        self.temp_en = enabled as u8;
    }

    /// Byte value of RAM register `reg`; registers outside 0..=21 read as zero.
    pub fn register_value(&self, reg: u8) -> u8 {
        match reg {
            0 => {
                (self.adc_reference_bw << 6)
                    | (self.amp_fast_settle << 5)
                    | (self.amp_vref_enable << 4)
                    | (self.adc_comparator_bias << 2)
                    | self.adc_comparator_select
            }
            1 => (self.vdd_sense_enable << 6) | self.adc_buffer_bias,
            2 => self.mux_bias,
            3 => {
                (self.mux_load << 5)
                    | (self.temp_s2 << 4)
                    | (self.temp_s1 << 3)
                    | (self.temp_en << 2)
                    | (self.dig_out_hiz << 1)
                    | self.dig_out
            }
            4 => {
                (self.weak_miso << 7)
                    | (self.twos_comp << 6)
                    | (self.abs_mode << 5)
                    | (self.dsp_en << 4)
                    | self.dsp_cutoff_freq
            }
            5 => {
                (self.zcheck_dac_power << 6)
                    | (self.zcheck_load << 5)
                    | (self.zcheck_scale << 3)
                    | (self.zcheck_conn_all << 2)
                    | (self.zcheck_sel_pol << 1)
                    | self.zcheck_en
            }
            6 => 128,
            7 => self.zcheck_select,
            8 => (self.off_chip_rh1 << 7) | self.rh1_dac1,
            9 => (self.adc_aux1_en << 7) | self.rh1_dac2,
            10 => (self.off_chip_rh2 << 7) | self.rh2_dac1,
            11 => (self.adc_aux2_en << 7) | self.rh2_dac2,
            12 => (self.off_chip_rl << 7) | self.rl_dac1,
            13 => (self.adc_aux3_en << 7) | (self.rl_dac3 << 6) | self.rl_dac2,
            14..=21 => {
                let first = (reg as usize - 14) * 8;
                self.amp_pwr[first..first + 8]
                    .iter()
                    .enumerate()
                    .fold(0u8, |acc, (bit, &on)| acc | ((on as u8) << bit))
            }
            _ => 0,
        }
    }

    /// Selects the DSP offset-removal cutoff closest to `freq` on a log scale.
    pub fn set_dsp_cutoff_freq(&mut self, freq: f64) -> f64 {
        let cutoffs = dsp_cutoff_table(self.sample_rate);
        let index = if freq > cutoffs[1] {
            1
        } else if freq < cutoffs[15] {
            15
        } else {
            let log_freq = freq.log10();
            let mut best = 1;
            let mut min_diff = f64::MAX;
            for (n, cutoff) in cutoffs.iter().enumerate().skip(1) {
                let diff = (log_freq - cutoff.log10()).abs();
                if diff < min_diff {
                    min_diff = diff;
                    best = n;
                }
            }
            best
        };
        self.dsp_cutoff_freq = index as u8;
        cutoffs[index]
    }

    pub fn dsp_cutoff_freq(&self) -> f64 {
        dsp_cutoff_table(self.sample_rate)[self.dsp_cutoff_freq as usize]
    }

    /// Programs RH1/RH2 for an upper bandwidth at most 30 kHz. Returns the realized bandwidth.
    pub fn set_upper_bandwidth(&mut self, upper: f64) -> f64 {
        let upper = upper.min(MAX_UPPER_BANDWIDTH);

        let rh1_target = rh1_from_upper_bandwidth(upper);
        let (rh1_actual, rh1_dac1, rh1_dac2) = quantize_two_stage(
            RH1_BASE,
            rh1_target,
            (RH1_DAC1_UNIT, RH1_DAC1_STEPS),
            (RH1_DAC2_UNIT, RH1_DAC2_STEPS),
        );
        self.rh1_dac1 = rh1_dac1;
        self.rh1_dac2 = rh1_dac2;

        let rh2_target = rh2_from_upper_bandwidth(upper);
        let (rh2_actual, rh2_dac1, rh2_dac2) = quantize_two_stage(
            RH2_BASE,
            rh2_target,
            (RH2_DAC1_UNIT, RH2_DAC1_STEPS),
            (RH2_DAC2_UNIT, RH2_DAC2_STEPS),
        );
        self.rh2_dac1 = rh2_dac1;
        self.rh2_dac2 = rh2_dac2;

        (upper_bandwidth_from_rh1(rh1_actual) * upper_bandwidth_from_rh2(rh2_actual)).sqrt()
    }

    /// Programs RL for a lower bandwidth at most 1.5 kHz. Returns the realized bandwidth.
    pub fn set_lower_bandwidth(&mut self, lower: f64) -> f64 {
        let lower = lower.min(MAX_LOWER_BANDWIDTH);
        let rl_target = rl_from_lower_bandwidth(lower);

        let mut base = RL_BASE;
        self.rl_dac3 = 0;
        if lower < 0.15 {
            base += RL_DAC3_UNIT;
            self.rl_dac3 = 1;
        }
        let (rl_actual, rl_dac1, rl_dac2) = quantize_two_stage(
            base,
            rl_target,
            (RL_DAC1_UNIT, RL_DAC1_STEPS),
            (RL_DAC2_UNIT, RL_DAC2_STEPS),
        );
        self.rl_dac1 = rl_dac1;
        self.rl_dac2 = rl_dac2;

        lower_bandwidth_from_rl(rl_actual)
    }
}

/// Cutoff frequency for each DSP register code; index 0 is unused.
fn dsp_cutoff_table(sample_rate: f64) -> [f64; 16] {
    let mut table = [0.0; 16];
    for (n, entry) in table.iter_mut().enumerate().skip(1) {
        let x = 2f64.powi(n as i32);
        *entry = sample_rate * (x / (x - 1.0)).ln() / (2.0 * PI);
    }
    table
}

/// Coarse DAC first, then fine DAC, each step taken only while it keeps the
/// resistance below target. Returns `(actual, fine_steps, coarse_steps)`.
fn quantize_two_stage(base: f64, target: f64, fine: (f64, u32), coarse: (f64, u32)) -> (f64, u8, u8) {
    let (fine_unit, fine_steps) = fine;
    let (coarse_unit, coarse_steps) = coarse;
    let mut actual = base;
    let mut coarse_count = 0u8;
    for _ in 0..coarse_steps {
        if actual < target - (coarse_unit - fine_unit / 2.0) {
            actual += coarse_unit;
            coarse_count += 1;
        }
    }
    let mut fine_count = 0u8;
    for _ in 0..fine_steps {
        if actual < target - fine_unit / 2.0 {
            actual += fine_unit;
            fine_count += 1;
        }
    }
    (actual, fine_count, coarse_count)
}

fn rh1_from_upper_bandwidth(upper: f64) -> f64 {
    let l = upper.log10();
    0.9730 * 10f64.powf(8.0968 - 1.1892 * l + 0.04767 * l * l)
}

fn rh2_from_upper_bandwidth(upper: f64) -> f64 {
    let l = upper.log10();
    1.0191 * 10f64.powf(8.1009 - 1.0821 * l + 0.03383 * l * l)
}

fn rl_from_lower_bandwidth(lower: f64) -> f64 {
    let l = lower.log10();
    if lower < 4.0 {
        1.0061 * 10f64.powf(4.9391 - 1.2088 * l + 0.5698 * l * l + 0.1442 * l * l * l)
    } else {
        1.0061 * 10f64.powf(4.7351 - 0.5916 * l + 0.08482 * l * l)
    }
}

fn solve_log_quadratic(a: f64, b: f64, c: f64) -> f64 {
    10f64.powf((-b - (b * b - 4.0 * a * c).sqrt()) / (2.0 * a))
}

fn upper_bandwidth_from_rh1(rh1: f64) -> f64 {
    solve_log_quadratic(0.04767, -1.1892, 8.0968 - (rh1 / 0.9730).log10())
}

fn upper_bandwidth_from_rh2(rh2: f64) -> f64 {
    solve_log_quadratic(0.03383, -1.0821, 8.1009 - (rh2 / 1.0191).log10())
}

fn lower_bandwidth_from_rl(rl: f64) -> f64 {
    let rl = rl.max(5100.0);
    if rl < 30000.0 {
        solve_log_quadratic(0.08482, -0.5916, 4.7351 - (rl / 1.0061).log10())
    } else {
        solve_log_quadratic(0.3303, -1.2100, 4.9873 - (rl / 1.0061).log10())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel_close(actual: f64, expected: f64, tol: f64) -> bool {
        ((actual - expected) / expected).abs() < tol
    }

    #[test]
    fn test_default_register_values() {
        let regs = ChipRegisters::new(30000.0);
        assert_eq!(regs.register_value(0), 0xDE);
        assert_eq!(regs.register_value(1), 0x42);
        assert_eq!(regs.register_value(2), 4);
        assert_eq!(regs.register_value(3), 0x02);
        assert_eq!(regs.register_value(5), 0x40);
        assert_eq!(regs.register_value(6), 128);
        for reg in 14..=21 {
            assert_eq!(regs.register_value(reg), 0xFF);
        }
        assert_eq!(regs.register_value(22), 0);
    }

    #[test]
    fn test_mux_bias_follows_sample_rate() {
        let mut regs = ChipRegisters::new(1000.0);
        assert_eq!(regs.register_value(2), 40);
        assert_eq!(regs.register_value(1) & 0x3F, 32);
        regs.define_sample_rate(10000.0);
        assert_eq!(regs.register_value(2), 18);
        regs.define_sample_rate(15000.0);
        assert_eq!(regs.register_value(2), 7);
    }

    #[test]
    fn test_dsp_cutoff_quantization() {
        let mut regs = ChipRegisters::new(30000.0);
        // n = 10 at 30 kS/s is about 4.665 Hz
        let actual = regs.set_dsp_cutoff_freq(4.7);
        assert!(rel_close(actual, 30000.0 * (1024.0f64 / 1023.0).ln() / (2.0 * PI), 1e-12));
        assert_eq!(regs.register_value(4) & 0x0F, 10);
        assert_eq!(regs.set_dsp_cutoff_freq(1e6), regs.dsp_cutoff_freq());
        assert_eq!(regs.register_value(4) & 0x0F, 1);
        regs.set_dsp_cutoff_freq(1e-6);
        assert_eq!(regs.register_value(4) & 0x0F, 15);
    }

    #[test]
    fn test_upper_bandwidth_is_close_and_clamped() {
        let mut regs = ChipRegisters::new(30000.0);
        let actual = regs.set_upper_bandwidth(7500.0);
        assert!(rel_close(actual, 7500.0, 0.05), "got {}", actual);
        let clamped = regs.set_upper_bandwidth(100_000.0);
        assert!(clamped < 40_000.0);
    }

    #[test]
    fn test_lower_bandwidth_uses_dac3_below_threshold() {
        let mut regs = ChipRegisters::new(30000.0);
        let actual = regs.set_lower_bandwidth(1.0);
        assert!(rel_close(actual, 1.0, 0.2), "got {}", actual);
        assert_eq!(regs.register_value(13) & 0x40, 0);
        regs.set_lower_bandwidth(0.1);
        assert_eq!(regs.register_value(13) & 0x40, 0x40);
    }

    #[test]
    fn test_zcheck_fields() {
        let mut regs = ChipRegisters::new(30000.0);
        regs.set_zcheck_scale(ZcheckScale::Cs10pF);
        regs.enable_zcheck(true);
        assert_eq!(regs.register_value(5), 0x40 | (0x03 << 3) | 1);
        regs.set_zcheck_channel(40).unwrap();
        assert_eq!(regs.register_value(7), 40);
        assert!(regs.set_zcheck_channel(64).is_err());
        assert_eq!(regs.zcheck_channel(), 40);
    }

    #[test]
    fn test_aux_enable_bits() {
        let mut regs = ChipRegisters::new(30000.0);
        regs.enable_aux1(false);
        regs.enable_aux3(false);
        assert_eq!(regs.register_value(9) & 0x80, 0);
        assert_eq!(regs.register_value(11) & 0x80, 0x80);
        assert_eq!(regs.register_value(13) & 0x80, 0);
    }
}
