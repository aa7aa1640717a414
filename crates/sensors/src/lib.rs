pub mod types;
pub mod oni;
pub mod rhd2000;
pub mod mock_rhythm;

// Re-export the main types that users need
pub use types::{DriverStatus, DriverError};
pub use oni::{ContextOption, OniConnector, OniContext, OniFrame, RegisterTransport};

// Lower-level access to the simulated board
pub mod raw {
    pub use crate::mock_rhythm::*;
}
