//! Behavioural model of one RHD2000 chip answering auxiliary commands.

use crate::rhd2000::{
    Rhd2000Command, ZcheckScale, CHIP_ID_RHD2132, CHIP_ID_RHD2164, CHIP_ID_RHD2216, REGISTER_59_MISO_A,
    REGISTER_59_MISO_B,
};

// Samples between a DAC update and its effect on the amplifier output
const ZCHECK_PIPELINE_DELAY: usize = 3;
const ZCHECK_DAC_VOLTS_PER_STEP: f64 = 1.225 / 256.0;
const AMPLIFIER_VOLTS_PER_BIT: f64 = 0.195e-6;

/// A chip attached to one MISO line of the simulated board.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedChip {
    /// Value of ROM register 63.
    pub chip_id: i32,
    /// Cable delay settings at which this chip's data is sampled correctly.
    pub good_delays: Vec<u32>,
    /// Electrode impedance seen by every amplifier channel, in ohms.
    pub electrode_impedance: f64,
}

impl SimulatedChip {
    pub fn rhd2132(good_delays: &[u32]) -> Self {
        Self::new(CHIP_ID_RHD2132, good_delays)
    }

    pub fn rhd2216(good_delays: &[u32]) -> Self {
        Self::new(CHIP_ID_RHD2216, good_delays)
    }

    pub fn rhd2164(good_delays: &[u32]) -> Self {
        Self::new(CHIP_ID_RHD2164, good_delays)
    }

    fn new(chip_id: i32, good_delays: &[u32]) -> Self {
        Self { chip_id, good_delays: good_delays.to_vec(), electrode_impedance: 100_000.0 }
    }

    pub fn with_impedance(mut self, ohms: f64) -> Self {
        self.electrode_impedance = ohms;
        self
    }

    fn rom_name(&self) -> &'static [u8; 7] {
        match self.chip_id {
            CHIP_ID_RHD2164 => b"RHD2164",
            CHIP_ID_RHD2216 => b"RHD2216",
            _ => b"RHD2132",
        }
    }

    fn num_amplifiers(&self) -> u8 {
        match self.chip_id {
            CHIP_ID_RHD2164 => 64,
            CHIP_ID_RHD2216 => 16,
            _ => 32,
        }
    }

    fn is_dual_miso(&self) -> bool {
        self.chip_id == CHIP_ID_RHD2164
    }
}

/// Runtime state of a simulated chip: register file, the responses from the
/// last executed commands and recent impedance DAC values.
#[derive(Debug, Clone)]
pub(super) struct ChipState {
    pub(super) chip: SimulatedChip,
    registers: [u8; 22],
    responses: [[u16; 3]; 2],
    previous: [[u16; 3]; 2],
    dac_history: [u8; ZCHECK_PIPELINE_DELAY + 2],
}

impl ChipState {
    pub(super) fn new(chip: SimulatedChip) -> Self {
        let mut registers = [0u8; 22];
        registers[6] = 128;
        Self {
            chip,
            registers,
            responses: [[0; 3]; 2],
            previous: [[0; 3]; 2],
            dac_history: [128; ZCHECK_PIPELINE_DELAY + 2],
        }
    }

    /// Executes one command word per aux slot for the current sample.
    pub(super) fn step(&mut self, commands: [u16; 3], sample_rate: f64) {
        self.previous = self.responses;
        self.dac_history.rotate_right(1);
        self.dac_history[0] = self.registers[6];
        for (slot, &word) in commands.iter().enumerate() {
            for miso in 0..2 {
                self.responses[miso][slot] = self.respond(word, miso == 1, sample_rate);
            }
            if let Some(Rhd2000Command::RegisterWrite { reg, data }) = Rhd2000Command::decode(word) {
                if let Some(r) = self.registers.get_mut(reg as usize) {
                    *r = data;
                }
            }
        }
    }

    /// Result word of `slot` for this sample; `delayed` reports the previous
    /// sample's result, as older firmware does.
    pub(super) fn response(&self, slot: usize, miso_b: bool, delayed: bool) -> u16 {
        let miso = miso_b as usize;
        if delayed {
            self.previous[miso][slot]
        } else {
            self.responses[miso][slot]
        }
    }

    fn respond(&self, word: u16, miso_b: bool, sample_rate: f64) -> u16 {
        match Rhd2000Command::decode(word) {
            Some(Rhd2000Command::RegisterRead(reg)) => self.read_register(reg, miso_b) as u16,
            Some(Rhd2000Command::RegisterWrite { data, .. }) => 0xFF00 | data as u16,
            Some(Rhd2000Command::Convert(ch)) if ch < 32 => {
                let channel = ch as usize + if miso_b { 32 } else { 0 };
                self.amplifier_word(channel, sample_rate)
            }
            Some(Rhd2000Command::Convert(ch)) => 0x8000 + ((ch as u16) << 4),
            Some(Rhd2000Command::Calibrate) | Some(Rhd2000Command::CalibrateClear) => 0x8000,
            None => 0,
        }
    }

    fn read_register(&self, reg: u8, miso_b: bool) -> u8 {
        match reg {
            63 => self.chip.chip_id as u8,
            62 => self.chip.num_amplifiers(),
            61 => 1,
            60 => 1,
            59 if self.chip.is_dual_miso() => {
                if miso_b {
                    REGISTER_59_MISO_B as u8
                } else {
                    REGISTER_59_MISO_A as u8
                }
            }
            48..=54 => self.chip.rom_name()[(reg - 48) as usize],
            40..=44 => b"INTAN"[(reg - 40) as usize],
            r => self.registers.get(r as usize).copied().unwrap_or(0),
        }
    }

    /// Amplifier output word for chip channel `channel`.
    pub(super) fn amplifier_word(&self, channel: usize, sample_rate: f64) -> u16 {
        let baseline = 32768.0 + (channel as f64 - 16.0) * 8.0;
        let zcheck_enabled = self.registers[5] & 0x01 != 0;
        let selected = (self.registers[7] & 0x3F) as usize;
        if !zcheck_enabled || selected != channel {
            return baseline as u16;
        }
        let capacitance = match (self.registers[5] >> 3) & 0x03 {
            0 => ZcheckScale::Cs100fF.capacitance(),
            1 => ZcheckScale::Cs1pF.capacitance(),
            _ => ZcheckScale::Cs10pF.capacitance(),
        };
        let step = self.dac_history[ZCHECK_PIPELINE_DELAY] as f64 - self.dac_history[ZCHECK_PIPELINE_DELAY + 1] as f64;
        let current = capacitance * step * ZCHECK_DAC_VOLTS_PER_STEP * sample_rate;
        let volts = current * self.chip.electrode_impedance;
        (baseline + volts / AMPLIFIER_VOLTS_PER_BIT).round().clamp(0.0, 65535.0) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(reg: u8) -> u16 {
        Rhd2000Command::RegisterRead(reg).encode()
    }

    #[test]
    fn test_rom_reads_identify_chip() {
        let mut state = ChipState::new(SimulatedChip::rhd2164(&[3]));
        state.step([read(63), read(59), read(40)], 30000.0);
        assert_eq!(state.response(0, false, false), 4);
        assert_eq!(state.response(1, false, false), 53);
        assert_eq!(state.response(1, true, false), 58);
        assert_eq!(state.response(2, false, false), b'I' as u16);
    }

    #[test]
    fn test_delayed_response_reports_previous_sample() {
        let mut state = ChipState::new(SimulatedChip::rhd2132(&[3]));
        state.step([read(63), read(63), read(63)], 30000.0);
        state.step([read(62), read(62), read(62)], 30000.0);
        assert_eq!(state.response(2, false, true), 1);
        assert_eq!(state.response(2, false, false), 32);
    }

    #[test]
    fn test_register_writes_are_echoed_and_stored() {
        let mut state = ChipState::new(SimulatedChip::rhd2132(&[3]));
        let w = Rhd2000Command::RegisterWrite { reg: 7, data: 12 }.encode();
        state.step([w, read(7), 0], 30000.0);
        assert_eq!(state.response(0, false, false), 0xFF0C);
        assert_eq!(state.response(1, false, false), 12);
    }

    #[test]
    fn test_zcheck_signal_only_on_selected_channel() {
        let mut state = ChipState::new(SimulatedChip::rhd2132(&[3]));
        let enable = Rhd2000Command::RegisterWrite { reg: 5, data: 0x49 }.encode();
        let select = Rhd2000Command::RegisterWrite { reg: 7, data: 2 }.encode();
        state.step([enable, select, 0], 30000.0);
        for value in [128u8, 160, 160, 160, 160, 160] {
            let dac = Rhd2000Command::RegisterWrite { reg: 6, data: value }.encode();
            state.step([dac, 0, 0], 30000.0);
        }
        // 32 DAC steps through 1 pF into 100 kOhm is about 2355 LSB
        let baseline = (32768.0 + (2.0 - 16.0) * 8.0) as u16;
        assert!(state.amplifier_word(2, 30000.0) > baseline + 2000);
        assert_eq!(state.amplifier_word(3, 30000.0), (32768.0 + (3.0 - 16.0) * 8.0) as u16);
    }
}
