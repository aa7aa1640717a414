//! RHD2000 amplifier chip: command words, register model and the
//! auxiliary command lists built from it.

pub mod commands;
pub mod registers;
pub mod sequences;

pub use commands::{format_command_list, Rhd2000Command};
pub use registers::{ChipRegisters, ZcheckScale};
pub use sequences::{MAX_COMMAND_LENGTH, STANDARD_LIST_LENGTH};

// Values of ROM register 63
pub const CHIP_ID_RHD2132: i32 = 1;
pub const CHIP_ID_RHD2216: i32 = 2;
pub const CHIP_ID_RHD2164: i32 = 4;
/// Pseudo id for the second MISO stream of an RHD2164.
pub const CHIP_ID_RHD2164_B: i32 = 1000;

// Values of ROM register 59 on dual-MISO chips
pub const REGISTER_59_MISO_A: i32 = 53;
pub const REGISTER_59_MISO_B: i32 = 58;

/// Channel rows an RHD2132 16-channel headstage is shifted by within its 32-row slot.
pub const RHD2132_16CH_OFFSET: usize = 8;

/// Amplifier LSB in microvolts.
pub const AMPLIFIER_UV_PER_BIT: f32 = 0.195;
/// Aux input LSB in millivolts, as scaled for downstream display.
pub const AUX_MV_PER_BIT: f32 = 0.0000374;

/// Chip-name ROM content (registers 48-50).
pub const ROM_CHIP_NAME: &[u8; 3] = b"RHD";
/// Company-name ROM content (registers 40-44).
pub const ROM_COMPANY_NAME: &[u8; 5] = b"INTAN";
