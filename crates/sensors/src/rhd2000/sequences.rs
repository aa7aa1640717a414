//! Auxiliary command lists uploaded to the FPGA command RAM.
//!
//! Each list is a sequence of 16-bit command words the FPGA replays in a
//! loop on one of its three auxiliary command slots, one word per sample.

use std::f64::consts::PI;

use log::debug;

use super::commands::{CMD_CALIBRATE, CMD_CALIBRATE_CLEAR};
use super::registers::ChipRegisters;
use crate::types::DriverError;

/// Longest command list one RAM bank can hold.
pub const MAX_COMMAND_LENGTH: usize = 1024;
/// Length of the fixed-size lists (digital out, sensors, register config).
pub const STANDARD_LIST_LENGTH: usize = 60;

// Command list indices whose read results identify the chip
pub const ROM_CHIP_ID_INDEX: usize = 19;
pub const ROM_REGISTER_59_INDEX: usize = 23;
pub const ROM_CHIP_NAME_INDEX: usize = 24;
pub const ROM_COMPANY_NAME_INDEX: usize = 32;

const fn convert(channel: u8) -> u16 {
    ((channel & 0x3f) as u16) << 8
}

const fn write(reg: u8, data: u8) -> u16 {
    0x8000 | (((reg & 0x3f) as u16) << 8) | data as u16
}

const fn read(reg: u8) -> u16 {
    0xc000 | (((reg & 0x3f) as u16) << 8)
}

impl ChipRegisters {
    /// Re-asserts register 3 so the aux digital output follows its register value.
    pub fn command_list_update_dig_out(&self) -> Vec<u16> {
        vec![write(3, self.register_value(3)); STANDARD_LIST_LENGTH]
    }

    /// Samples the three aux inputs every fourth command and cycles the
    /// temperature sensor and supply voltage measurements.
    pub fn command_list_temp_sensor(&mut self) -> Vec<u16> {
        let mut list = Vec::with_capacity(STANDARD_LIST_LENGTH);
        let aux = [convert(32), convert(33), convert(34)];

        self.enable_temp_sensor(true);

        list.extend_from_slice(&aux);
        self.set_temp_sensor_switches(true, false);
        list.push(write(3, self.register_value(3)));

        list.extend_from_slice(&aux);
        self.set_temp_sensor_switches(true, true);
        list.push(write(3, self.register_value(3)));

        list.extend_from_slice(&aux);
        list.push(convert(49));

        list.extend_from_slice(&aux);
        self.set_temp_sensor_switches(false, true);
        list.push(write(3, self.register_value(3)));

        list.extend_from_slice(&aux);
        list.push(convert(49));

        list.extend_from_slice(&aux);
        self.set_temp_sensor_switches(false, false);
        list.push(write(3, self.register_value(3)));

        list.extend_from_slice(&aux);
        list.push(convert(48));

        for _ in 0..8 {
            list.extend_from_slice(&aux);
            list.push(read(63));
        }

        list
    }

    /// Full register program: writes, ROM identification reads, read-back,
    /// then ADC calibration or a dummy read.
    pub fn command_list_register_config(&self, calibrate: bool) -> Vec<u16> {
        let mut list = Vec::with_capacity(STANDARD_LIST_LENGTH);

        list.push(read(63));
        list.push(read(63));

        // Register 6 carries the impedance DAC waveform from its own list
        for reg in (0..=5).chain(7..=17) {
            list.push(write(reg, self.register_value(reg)));
        }

        for reg in [63, 62, 61, 60, 59] {
            list.push(read(reg));
        }
        for reg in 48..=55 {
            list.push(read(reg));
        }
        for reg in 40..=44 {
            list.push(read(reg));
        }
        for reg in 0..=17 {
            list.push(read(reg));
        }

        list.push(if calibrate { CMD_CALIBRATE } else { read(63) });

        // Amplifier power for channels 32-63 of dual-die chips; not read back
        for reg in 18..=21 {
            list.push(write(reg, self.register_value(reg)));
        }

        list
    }

    /// Clears the ADC calibration, padded with dummy reads.
    pub fn command_list_calibrate_clear(&self) -> Vec<u16> {
        let mut list = vec![read(63); STANDARD_LIST_LENGTH];
        list[2] = CMD_CALIBRATE_CLEAR;
        list
    }

    /// One period of the impedance test sine on register 6.
    ///
    /// `frequency` of zero produces a full bank of mid-scale writes.
    /// `amplitude` is in DAC steps, 0..=128.
    pub fn command_list_zcheck_dac(&self, frequency: f64, amplitude: f64) -> Result<Vec<u16>, DriverError> {
        if !(0.0..=128.0).contains(&amplitude) {
            return Err(DriverError::out_of_range(format!(
                "Zcheck DAC amplitude {} out of range 0..=128",
                amplitude
            )));
        }
        if frequency < 0.0 {
            return Err(DriverError::out_of_range(format!(
                "Zcheck DAC frequency {} is negative",
                frequency
            )));
        }
        let sample_rate = self.sample_rate();
        if frequency > sample_rate / 4.0 {
            return Err(DriverError::out_of_range(format!(
                "Zcheck DAC frequency {} above {} (fs/4)",
                frequency,
                sample_rate / 4.0
            )));
        }

        if frequency == 0.0 {
            return Ok(vec![write(6, 128); MAX_COMMAND_LENGTH]);
        }

        let period = (sample_rate / frequency + 0.5).floor() as usize;
        if period > MAX_COMMAND_LENGTH {
            return Err(DriverError::out_of_range(format!(
                "Zcheck DAC period {} samples exceeds {}",
                period, MAX_COMMAND_LENGTH
            )));
        }

        let list: Vec<u16> = (0..period)
            .map(|i| {
                let t = i as f64 / sample_rate;
                let value = (amplitude * (2.0 * PI * frequency * t).sin() + 128.0 + 0.5).floor();
                write(6, value.clamp(0.0, 255.0) as u8)
            })
            .collect();
        debug!(
            "Zcheck DAC list: {} Hz, amplitude {}, {} commands",
            frequency,
            amplitude,
            list.len()
        );
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rhd2000::Rhd2000Command;

    #[test]
    fn test_fixed_lists_have_standard_length() {
        let mut regs = ChipRegisters::new(30000.0);
        assert_eq!(regs.command_list_update_dig_out().len(), STANDARD_LIST_LENGTH);
        assert_eq!(regs.command_list_temp_sensor().len(), STANDARD_LIST_LENGTH);
        assert_eq!(regs.command_list_register_config(true).len(), STANDARD_LIST_LENGTH);
        assert_eq!(regs.command_list_register_config(false).len(), STANDARD_LIST_LENGTH);
    }

    #[test]
    fn test_register_config_layout() {
        let regs = ChipRegisters::new(30000.0);
        let list = regs.command_list_register_config(true);
        assert_eq!(list[ROM_CHIP_ID_INDEX], read(63));
        assert_eq!(list[ROM_REGISTER_59_INDEX], read(59));
        assert_eq!(list[ROM_CHIP_NAME_INDEX], read(48));
        assert_eq!(list[ROM_COMPANY_NAME_INDEX], read(40));
        assert_eq!(list[ROM_COMPANY_NAME_INDEX + 4], read(44));
        assert!(list.contains(&CMD_CALIBRATE));
        assert!(!list.iter().any(|&w| w == write(6, 128)));

        let no_cal = regs.command_list_register_config(false);
        assert!(!no_cal.contains(&CMD_CALIBRATE));
        assert_eq!(no_cal[55], read(63));
        assert_eq!(
            Rhd2000Command::decode(no_cal[59]),
            Some(Rhd2000Command::RegisterWrite { reg: 21, data: 0xFF })
        );
    }

    #[test]
    fn test_fast_settle_variant_differs_in_register_0() {
        let mut regs = ChipRegisters::new(30000.0);
        let normal = regs.command_list_register_config(false);
        regs.set_fast_settle(true);
        let settle = regs.command_list_register_config(false);
        assert_ne!(normal[2], settle[2]);
        assert_eq!(normal[3..], settle[3..]);
    }

    #[test]
    fn test_temp_sensor_list_samples_aux_every_fourth_command() {
        let mut regs = ChipRegisters::new(30000.0);
        let list = regs.command_list_temp_sensor();
        for chunk in list.chunks(4) {
            assert_eq!(&chunk[..3], &[convert(32), convert(33), convert(34)]);
        }
        assert_eq!(list[11], convert(49));
        assert_eq!(list[27], convert(48));
        assert_eq!(list[59], read(63));
    }

    #[test]
    fn test_zcheck_dac_waveform() {
        let regs = ChipRegisters::new(30000.0);
        let list = regs.command_list_zcheck_dac(1000.0, 128.0).unwrap();
        assert_eq!(list.len(), 30);
        assert_eq!(list[0], write(6, 128));
        assert_eq!(list[7] & 0xFF, 255);
        assert_eq!(list[22] & 0xFF, 1);
        assert!(list.iter().all(|w| w & 0xFF00 == 0x8600));

        let flat = regs.command_list_zcheck_dac(0.0, 128.0).unwrap();
        assert_eq!(flat.len(), MAX_COMMAND_LENGTH);
        assert!(flat.iter().all(|&w| w == write(6, 128)));
    }

    #[test]
    fn test_zcheck_dac_rejects_bad_arguments() {
        let regs = ChipRegisters::new(30000.0);
        assert!(regs.command_list_zcheck_dac(1000.0, 129.0).is_err());
        assert!(regs.command_list_zcheck_dac(-1.0, 10.0).is_err());
        assert!(regs.command_list_zcheck_dac(7501.0, 10.0).is_err());
        // period of 1500 samples exceeds one bank
        assert!(regs.command_list_zcheck_dac(20.0, 10.0).is_err());
    }

    #[test]
    fn test_calibrate_clear_list() {
        let regs = ChipRegisters::new(30000.0);
        let list = regs.command_list_calibrate_clear();
        assert_eq!(list.iter().filter(|&&w| w == CMD_CALIBRATE_CLEAR).count(), 1);
    }
}
