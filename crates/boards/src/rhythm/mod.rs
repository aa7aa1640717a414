pub mod board;
pub mod decoder;
pub mod device;
pub mod digital_out;
pub mod headstage;
pub mod impedance;
pub mod scanner;
pub mod settings;

pub use board::{lock_board, AuxCmdSlot, RhythmBoard, SAMPLE_RATES};
pub use decoder::{FrameDecoder, StreamLayout};
pub use device::{BatchReceiver, DacRouting, DeviceState, FirmwareInfo, RhythmDevice, NUM_HEADSTAGES};
pub use headstage::Headstage;
pub use settings::{BoardSettings, DspSettings};
