//! Address map of the Rhythm FPGA behind the ONI hub.

// ONI device indices
pub const DEVICE_RHYTHM: u32 = 0x0101;
pub const DEVICE_TTL: u32 = 0x0102;
pub const DEVICE_DAC: u32 = 0x0103;
pub const RHYTHM_HUB_MANAGER: u32 = 0x01FE;
/// Board management device holding firmware and memory status.
pub const DEVICE_BOARD_INFO: u32 = 254;

// Hub manager registers
pub const HUB_CLOCK_SEL: u32 = 0x2000;
pub const HUB_CLOCK_BUSY: u32 = 0x2001;

/// `MAX_TIMESTEP` counts this many units per sample.
pub const MAX_TIMESTEP_UNITS_PER_SAMPLE: u32 = 128;

// Board info registers
pub const BOARD_FIRMWARE_VERSION: u32 = 2;
pub const BOARD_MEM_STATE: u32 = 0x1000;

// Rhythm device registers
pub const ENABLE: u32 = 0;
pub const MODE: u32 = 1;
pub const MAX_TIMESTEP: u32 = 2;
pub const CABLE_DELAY: u32 = 3;
pub const AUXCMD_BANK_1: u32 = 4;
pub const AUXCMD_BANK_2: u32 = 5;
pub const AUXCMD_BANK_3: u32 = 6;
pub const MAX_AUXCMD_INDEX_1: u32 = 7;
pub const MAX_AUXCMD_INDEX_2: u32 = 8;
pub const MAX_AUXCMD_INDEX_3: u32 = 9;
pub const LOOP_AUXCMD_INDEX_1: u32 = 10;
pub const LOOP_AUXCMD_INDEX_2: u32 = 11;
pub const LOOP_AUXCMD_INDEX_3: u32 = 12;
pub const DATA_STREAM_1_8_SEL: u32 = 13;
pub const DATA_STREAM_9_16_SEL: u32 = 14;
pub const DATA_STREAM_EN: u32 = 15;
pub const EXTERNAL_FAST_SETTLE: u32 = 16;
pub const EXTERNAL_DIGOUT_A: u32 = 17;
pub const EXTERNAL_DIGOUT_B: u32 = 18;
pub const EXTERNAL_DIGOUT_C: u32 = 19;
pub const EXTERNAL_DIGOUT_D: u32 = 20;
pub const SYNC_CLKOUT_DIVIDE: u32 = 21;
pub const DAC_CTL: u32 = 22;
pub const DAC_SEL_1: u32 = 23;
pub const DAC_THRESH_1: u32 = 31;
pub const HPF: u32 = 39;
pub const SPI_RUNNING: u32 = 40;

// MODE register bit positions
pub const MODE_SPI_RUN_CONTINUOUS: u32 = 1;
pub const MODE_DSP_SETTLE: u32 = 2;
pub const MODE_TTL_OUT: u32 = 3;
pub const MODE_LED_ENABLE: u32 = 4;

/// Base of the auxiliary command RAM.
pub const AUX_CMD_RAM_BASE: u32 = 0x4000;

/// Register address of command `index` in `bank` of aux slot `slot`.
pub fn aux_command_address(slot: u32, bank: u32, index: u32) -> u32 {
    AUX_CMD_RAM_BASE + (bank << 10) + (slot << 14) + index
}

/// Inverse of [`aux_command_address`]: `(slot, bank, index)`.
pub fn decode_aux_command_address(addr: u32) -> Option<(u32, u32, u32)> {
    if addr < AUX_CMD_RAM_BASE {
        return None;
    }
    let offset = addr - AUX_CMD_RAM_BASE;
    let slot = offset >> 14;
    if slot > 2 {
        return None;
    }
    Some((slot, (offset >> 10) & 0xF, offset & 0x3FF))
}

/// MISO line a data stream is routed from.
///
/// The `Ddr` variants carry the second MISO line of dual-die chips and are
/// encoded as the single-line source plus 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataSource {
    PortA1 = 0,
    PortA2 = 1,
    PortB1 = 2,
    PortB2 = 3,
    PortC1 = 4,
    PortC2 = 5,
    PortD1 = 6,
    PortD2 = 7,
    PortA1Ddr = 8,
    PortA2Ddr = 9,
    PortB1Ddr = 10,
    PortB2Ddr = 11,
    PortC1Ddr = 12,
    PortC2Ddr = 13,
    PortD1Ddr = 14,
    PortD2Ddr = 15,
}

impl DataSource {
    pub const ALL: [DataSource; 16] = [
        DataSource::PortA1,
        DataSource::PortA2,
        DataSource::PortB1,
        DataSource::PortB2,
        DataSource::PortC1,
        DataSource::PortC2,
        DataSource::PortD1,
        DataSource::PortD2,
        DataSource::PortA1Ddr,
        DataSource::PortA2Ddr,
        DataSource::PortB1Ddr,
        DataSource::PortB2Ddr,
        DataSource::PortC1Ddr,
        DataSource::PortC2Ddr,
        DataSource::PortD1Ddr,
        DataSource::PortD2Ddr,
    ];

    pub fn from_index(index: u32) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    pub fn index(self) -> u32 {
        self as u32
    }

    /// Physical port 0..=3 (A..D).
    pub fn port(self) -> usize {
        (self.index() % 8) as usize / 2
    }

    pub fn is_ddr(self) -> bool {
        self.index() >= 8
    }

    /// Source `offset` lines above this one; offset 1 is the DDR line.
    pub fn with_offset(self, offset: u32) -> Option<Self> {
        Self::from_index(self.index() + 8 * offset)
    }
}

/// Memory states reported by the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardMemState {
    Init = 0,
    Ok = 1,
    /// Firmware does not report a memory state.
    Invalid = 2,
    Error = 3,
}

impl BoardMemState {
    pub fn from_register(value: u32) -> Self {
        match value & 0x03 {
            0 => BoardMemState::Init,
            1 => BoardMemState::Ok,
            2 => BoardMemState::Invalid,
            _ => BoardMemState::Error,
        }
    }
}
