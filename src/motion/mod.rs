//! CoreXY precise homing and origin calibration
//!
//! The refinement pipeline, leaves first:
//!
//! - [`kinematics`]: AB step / Cartesian conversion and stepper phase math
//! - [`hal`]: the narrow trait surface consumed from the motion stack
//! - [`probe`]: one sensorless bump on one motor
//! - [`cycle`]: opposed bump pairs reduced to one phase-cycle sample
//! - [`calibration`]: 9-point grid centroid with per-point revalidation
//! - [`homing`]: the orchestrating [`homing::HomingEngine`]

pub mod calibration;
pub mod cycle;
pub mod hal;
pub mod homing;
pub mod kinematics;
pub mod probe;
