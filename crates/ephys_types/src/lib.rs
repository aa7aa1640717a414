//! Shared types for the Rhythm acquisition system
//!
//! This crate contains the hardware-independent types used throughout the
//! acquisition stack: decoded sample batches, channel and event metadata,
//! naming configuration and impedance results.

pub mod event;
pub mod config;
pub mod data;
pub mod impedance;

// Re-export commonly used types
pub use event::*;
pub use config::*;
pub use data::*;
pub use impedance::*;
