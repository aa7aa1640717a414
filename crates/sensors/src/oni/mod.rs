//! Register and frame transport over an ONI hardware context.
//!
//! `OniContext` is the seam to the hardware: a real ONI driver or the
//! simulated device in `mock_rhythm` implements it. `RegisterTransport`
//! owns one context and layers masked writes and device-filtered frame
//! reads on top.

pub mod registers;

use bytes::Bytes;
use log::{error, trace};

use crate::types::DriverError;

// Status codes reported by ONI contexts
pub const ONI_ESUCCESS: i32 = 0;
pub const ONI_EREADFAILURE: i32 = -5;
pub const ONI_EWRITEFAILURE: i32 = -6;
pub const ONI_ENULLCTX: i32 = -7;
pub const ONI_EINVALSTATE: i32 = -9;
pub const ONI_EINVALARG: i32 = -11;
/// Returned when a hardware busy flag never clears.
pub const ONI_EBUSYTIMEOUT: i32 = -100;

/// Header word at the start of every Rhythm frame payload.
pub const RHYTHM_FRAME_MAGIC: u64 = 0xc691_1999_2702_1942;

/// Context-wide options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextOption {
    /// Start (non-zero) or stop (zero) frame production.
    Running,
    /// Reset the hardware context.
    Reset,
    /// Number of bytes fetched per low-level read.
    BlockReadSize,
    /// Reset the acquisition counter and start running.
    ResetAcqCounter,
}

/// One frame read from or written to the hardware.
#[derive(Debug, Clone, PartialEq)]
pub struct OniFrame {
    /// Acquisition clock counter when the frame was produced.
    pub time: u64,
    /// Device the frame belongs to.
    pub dev_idx: u32,
    /// Raw frame data; starts with an 8-byte hub timestamp.
    pub data: Bytes,
}

impl OniFrame {
    pub const HUB_TIMESTAMP_BYTES: usize = 8;

    /// Device payload after the hub timestamp.
    pub fn payload(&self) -> &[u8] {
        self.data.get(Self::HUB_TIMESTAMP_BYTES..).unwrap_or(&[])
    }
}

/// Low-level operations of an open hardware context.
pub trait OniContext: Send {
    fn read_register(&mut self, dev_idx: u32, addr: u32) -> Result<u32, DriverError>;
    fn write_register(&mut self, dev_idx: u32, addr: u32, value: u32) -> Result<(), DriverError>;
    /// Blocks until the next frame is available.
    fn read_frame(&mut self) -> Result<OniFrame, DriverError>;
    fn write_frame(&mut self, dev_idx: u32, payload: &[u8]) -> Result<(), DriverError>;
    fn set_option(&mut self, option: ContextOption, value: u32) -> Result<(), DriverError>;
}

/// Opens hardware contexts.
pub trait OniConnector {
    /// Acquire a context. Fails with `DeviceNotFound` when no hardware answers.
    fn connect(&self) -> Result<Box<dyn OniContext>, DriverError>;
}

/// Register/frame transport owning one hardware context.
pub struct RegisterTransport {
    ctx: Box<dyn OniContext>,
}

impl RegisterTransport {
    pub fn new(ctx: Box<dyn OniContext>) -> Self {
        Self { ctx }
    }

    pub fn read(&mut self, dev_idx: u32, addr: u32) -> Result<u32, DriverError> {
        let value = self.ctx.read_register(dev_idx, addr).map_err(|e| {
            error!("Register read failed (dev 0x{:04x}, addr 0x{:04x}): {}", dev_idx, addr, e);
            e
        })?;
        trace!("read dev 0x{:04x} addr 0x{:04x} -> 0x{:08x}", dev_idx, addr, value);
        Ok(value)
    }

    pub fn write(&mut self, dev_idx: u32, addr: u32, value: u32) -> Result<(), DriverError> {
        trace!("write dev 0x{:04x} addr 0x{:04x} <- 0x{:08x}", dev_idx, addr, value);
        self.ctx.write_register(dev_idx, addr, value).map_err(|e| {
            error!("Register write failed (dev 0x{:04x}, addr 0x{:04x}): {}", dev_idx, addr, e);
            e
        })
    }

    /// Read-modify-write of the bits selected by `mask`.
    ///
    /// Not atomic: concurrent callers must hold the hardware lock.
    pub fn write_masked(&mut self, dev_idx: u32, addr: u32, value: u32, mask: u32) -> Result<(), DriverError> {
        let current = self.read(dev_idx, addr)?;
        let updated = (current & !mask) | (value & mask);
        self.write(dev_idx, addr, updated)
    }

    pub fn read_frame(&mut self) -> Result<OniFrame, DriverError> {
        self.ctx.read_frame()
    }

    /// Reads frames until one from `dev_idx` arrives; other devices' frames are dropped.
    pub fn read_device_frame(&mut self, dev_idx: u32) -> Result<OniFrame, DriverError> {
        loop {
            let frame = self.ctx.read_frame()?;
            if frame.dev_idx == dev_idx {
                return Ok(frame);
            }
            trace!("Discarding frame from device 0x{:04x}", frame.dev_idx);
        }
    }

    pub fn write_frame(&mut self, dev_idx: u32, payload: &[u8]) -> Result<(), DriverError> {
        self.ctx.write_frame(dev_idx, payload).map_err(|e| {
            error!("Frame write to device 0x{:04x} failed: {}", dev_idx, e);
            e
        })
    }

    pub fn set_option(&mut self, option: ContextOption, value: u32) -> Result<(), DriverError> {
        self.ctx.set_option(option, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};

    #[derive(Default)]
    struct FakeContext {
        regs: HashMap<(u32, u32), u32>,
        frames: VecDeque<OniFrame>,
        fail_reads: bool,
    }

    impl OniContext for FakeContext {
        fn read_register(&mut self, dev_idx: u32, addr: u32) -> Result<u32, DriverError> {
            if self.fail_reads {
                return Err(DriverError::transport(ONI_EREADFAILURE, "fake"));
            }
            Ok(*self.regs.get(&(dev_idx, addr)).unwrap_or(&0))
        }
        fn write_register(&mut self, dev_idx: u32, addr: u32, value: u32) -> Result<(), DriverError> {
            self.regs.insert((dev_idx, addr), value);
            Ok(())
        }
        fn read_frame(&mut self) -> Result<OniFrame, DriverError> {
            self.frames
                .pop_front()
                .ok_or_else(|| DriverError::transport(ONI_EREADFAILURE, "empty"))
        }
        fn write_frame(&mut self, _dev_idx: u32, _payload: &[u8]) -> Result<(), DriverError> {
            Ok(())
        }
        fn set_option(&mut self, _option: ContextOption, _value: u32) -> Result<(), DriverError> {
            Ok(())
        }
    }

    fn frame(dev_idx: u32) -> OniFrame {
        OniFrame { time: 0, dev_idx, data: Bytes::from(vec![0u8; 12]) }
    }

    #[test]
    fn test_write_masked_preserves_other_bits() {
        let mut ctx = FakeContext::default();
        ctx.regs.insert((1, 2), 0xFFFF_0000);
        let mut t = RegisterTransport::new(Box::new(ctx));
        t.write_masked(1, 2, 0x0000_00A5, 0x0000_00FF).unwrap();
        assert_eq!(t.read(1, 2).unwrap(), 0xFFFF_00A5);
        t.write_masked(1, 2, 0, 0xF000_0000).unwrap();
        assert_eq!(t.read(1, 2).unwrap(), 0x0FFF_00A5);
    }

    #[test]
    fn test_masked_write_aborts_on_read_failure() {
        let ctx = FakeContext { fail_reads: true, ..Default::default() };
        let mut t = RegisterTransport::new(Box::new(ctx));
        let err = t.write_masked(1, 2, 1, 1).unwrap_err();
        assert!(matches!(err, DriverError::TransportError { code: ONI_EREADFAILURE, .. }));
    }

    #[test]
    fn test_read_device_frame_skips_other_devices() {
        let mut ctx = FakeContext::default();
        ctx.frames.extend([frame(0x0102), frame(0x0103), frame(0x0101)]);
        let mut t = RegisterTransport::new(Box::new(ctx));
        let f = t.read_device_frame(0x0101).unwrap();
        assert_eq!(f.dev_idx, 0x0101);
        assert_eq!(f.payload().len(), 4);
        assert!(t.read_frame().is_err());
    }
}
