pub mod rhythm;

pub use rhythm::device::RhythmDevice;
pub use rhythm::settings::BoardSettings;
