//! yantra-core - Motion-control and device-communication core for a CoreXY printer
//!
//! This library provides the two central subsystems of the firmware:
//!
//! - Precise CoreXY homing refinement: resolves the true machine origin from
//!   stepper phase information using sensorless bump measurements and a
//!   multi-point centroid calibration ([`motion`]).
//! - The MMU protocol state machine: a retrying, timeout-aware
//!   request/response driver for the external multi-material unit over a
//!   serial or register-bus link ([`mmu`]).
//!
//! Hardware is consumed through narrow trait interfaces
//! ([`motion::hal::MotionSystem`], [`mmu::transport::MmuLink`]), with
//! deterministic simulations under [`devices::mock`] for hardware-free
//! testing.

pub mod config;
pub mod devices;
pub mod error;
pub mod mmu;
pub mod motion;
pub mod transport;
pub mod util;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use mmu::logic::{ProtocolLogic, StepStatus};
pub use motion::homing::{CalibrationMode, HomingEngine};
