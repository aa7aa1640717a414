//! RHD2000 SPI command words.

use std::fmt;

use crate::types::DriverError;

pub const CMD_CALIBRATE: u16 = 0x5500;
pub const CMD_CALIBRATE_CLEAR: u16 = 0x6a00;
const CMD_WRITE_BASE: u16 = 0x8000;
const CMD_READ_BASE: u16 = 0xc000;
const CMD_TYPE_MASK: u16 = 0xc000;

/// Highest register or channel address the chip accepts.
pub const MAX_ADDRESS: u8 = 63;

/// One command of the RHD2000 SPI protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rhd2000Command {
    /// Sample amplifier or auxiliary channel 0..=63.
    Convert(u8),
    /// Run ADC self-calibration.
    Calibrate,
    /// Clear ADC calibration.
    CalibrateClear,
    RegisterWrite { reg: u8, data: u8 },
    RegisterRead(u8),
}

impl Rhd2000Command {
    pub fn convert(channel: u8) -> Result<Self, DriverError> {
        check_address("channel", channel)?;
        Ok(Rhd2000Command::Convert(channel))
    }

    pub fn register_write(reg: u8, data: u8) -> Result<Self, DriverError> {
        check_address("register", reg)?;
        Ok(Rhd2000Command::RegisterWrite { reg, data })
    }

    pub fn register_read(reg: u8) -> Result<Self, DriverError> {
        check_address("register", reg)?;
        Ok(Rhd2000Command::RegisterRead(reg))
    }

    /// 16-bit word as clocked out on MOSI.
    pub fn encode(self) -> u16 {
        match self {
            Rhd2000Command::Convert(ch) => ((ch & MAX_ADDRESS) as u16) << 8,
            Rhd2000Command::Calibrate => CMD_CALIBRATE,
            Rhd2000Command::CalibrateClear => CMD_CALIBRATE_CLEAR,
            Rhd2000Command::RegisterWrite { reg, data } => {
                CMD_WRITE_BASE | (((reg & MAX_ADDRESS) as u16) << 8) | data as u16
            }
            Rhd2000Command::RegisterRead(reg) => CMD_READ_BASE | (((reg & MAX_ADDRESS) as u16) << 8),
        }
    }

    /// Parses a command word. Returns `None` for words outside the command set.
    pub fn decode(word: u16) -> Option<Self> {
        match word {
            CMD_CALIBRATE => return Some(Rhd2000Command::Calibrate),
            CMD_CALIBRATE_CLEAR => return Some(Rhd2000Command::CalibrateClear),
            _ => {}
        }
        let addr = ((word & 0x3f00) >> 8) as u8;
        match word & CMD_TYPE_MASK {
            0x0000 if word & 0x00ff == 0 => Some(Rhd2000Command::Convert(addr)),
            CMD_WRITE_BASE => Some(Rhd2000Command::RegisterWrite { reg: addr, data: (word & 0xff) as u8 }),
            CMD_READ_BASE if word & 0x00ff == 0 => Some(Rhd2000Command::RegisterRead(addr)),
            _ => None,
        }
    }
}

impl fmt::Display for Rhd2000Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rhd2000Command::Convert(ch) => write!(f, "CONVERT({})", ch),
            Rhd2000Command::Calibrate => write!(f, "CALIBRATE"),
            Rhd2000Command::CalibrateClear => write!(f, "CLEAR"),
            Rhd2000Command::RegisterWrite { reg, data } => write!(f, "WRITE({},{:02X})", reg, data),
            Rhd2000Command::RegisterRead(reg) => write!(f, "READ({})", reg),
        }
    }
}

fn check_address(what: &str, value: u8) -> Result<(), DriverError> {
    if value > MAX_ADDRESS {
        return Err(DriverError::out_of_range(format!(
            "RHD2000 {} {} out of range 0..={}",
            what, value, MAX_ADDRESS
        )));
    }
    Ok(())
}

/// Renders a command list one command per line, for debug logging.
pub fn format_command_list(commands: &[u16]) -> String {
    commands
        .iter()
        .enumerate()
        .map(|(i, &word)| match Rhd2000Command::decode(word) {
            Some(cmd) => format!("command[{}] = {}", i, cmd),
            None => format!("command[{}] = INVALID COMMAND: {:04X}", i, word),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encodings() {
        assert_eq!(Rhd2000Command::convert(5).unwrap().encode(), 0x0500);
        assert_eq!(Rhd2000Command::register_write(3, 0xAB).unwrap().encode(), 0x83AB);
        assert_eq!(Rhd2000Command::register_read(63).unwrap().encode(), 0xFF00);
        assert_eq!(Rhd2000Command::Calibrate.encode(), 0x5500);
        assert_eq!(Rhd2000Command::CalibrateClear.encode(), 0x6a00);
    }

    #[test]
    fn test_out_of_range_arguments_rejected() {
        assert!(matches!(
            Rhd2000Command::convert(64),
            Err(DriverError::ConfigurationOutOfRange(_))
        ));
        assert!(Rhd2000Command::register_write(64, 0).is_err());
        assert!(Rhd2000Command::register_read(200).is_err());
    }

    #[test]
    fn test_decode_recognises_each_kind() {
        assert_eq!(Rhd2000Command::decode(0x2000), Some(Rhd2000Command::Convert(32)));
        assert_eq!(Rhd2000Command::decode(0x5500), Some(Rhd2000Command::Calibrate));
        assert_eq!(
            Rhd2000Command::decode(0x8680),
            Some(Rhd2000Command::RegisterWrite { reg: 6, data: 0x80 })
        );
        assert_eq!(Rhd2000Command::decode(0xFB00), Some(Rhd2000Command::RegisterRead(59)));
        assert_eq!(Rhd2000Command::decode(0x4123), None);
    }

    #[test]
    fn test_format_command_list() {
        let text = format_command_list(&[0xFF00, 0x5500, 0x4123]);
        assert!(text.contains("command[0] = READ(63)"));
        assert!(text.contains("command[1] = CALIBRATE"));
        assert!(text.contains("INVALID COMMAND: 4123"));
    }
}
