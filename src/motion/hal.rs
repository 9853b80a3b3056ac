//! Narrow interface consumed from the motion stack
//!
//! The homing refinement does not own the planner, stepper drivers,
//! endstops or input shaper - it drives them through [`MotionSystem`].
//! Production firmware implements this over the real planner; tests use
//! [`crate::devices::mock::SimCoreXy`].

use super::kinematics::{AbAxis, AbSteps};
use crate::error::Result;

/// RMS current and hold multiplier of one stepper driver
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurrentSetting {
    pub rms_ma: u32,
    pub hold_multiplier: f32,
}

/// Input shaper configuration of one logical axis
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShaperConfig {
    pub frequency_hz: f32,
    pub damping_ratio: f32,
}

/// Motion stack surface used by the homing refinement.
///
/// Contract notes:
///
/// - Both move calls block until motion settles, cooperatively yielding to
///   lower-level processing; the caller polls [`MotionSystem::draining`]
///   afterwards to detect cancellation.
/// - [`MotionSystem::plan_raw_ab_move`] must be *step-exact*: outside of a
///   stall the motors must land on exactly the commanded step counts. The
///   refinement treats any residual as an unrecoverable planner bug
///   (`Error::MotionFault`), so an implementation over a new motion stack
///   must either guarantee exactness or revisit that boundary.
pub trait MotionSystem {
    /// Planned absolute move in logical Cartesian mm; blocks until done
    fn move_to_xy(&mut self, x: f32, y: f32, feedrate_mm_s: f32) -> Result<()>;

    /// Raw step-exact move of both motors; blocks until done. A stall
    /// during an active sensorless window ends the move early.
    fn plan_raw_ab_move(&mut self, target: AbSteps, feedrate_mm_s: f32) -> Result<()>;

    /// Finish all queued motion
    fn synchronize(&mut self);

    /// Wait until both motors are electrically at standstill, so the
    /// phase counters are stable to read
    fn wait_for_standstill(&mut self);

    /// True while the motion stack is discarding moves (user abort,
    /// crash recovery). Refinement routines must return failure promptly.
    fn draining(&self) -> bool;

    /// Hardware step counter of one motor (authoritative after a stall)
    fn position(&self, axis: AbAxis) -> i32;

    /// Driver phase counter snapshot, 0..1023
    fn phase(&self, axis: AbAxis) -> u16;

    /// Re-derive the logical planner position from the hardware step
    /// counters after a stall ended a move early
    fn resync_from_steppers(&mut self);

    /// Open a sensorless-stall endstop window on one motor
    fn begin_sensorless(&mut self, axis: AbAxis);

    /// Close the sensorless window and restore normal driver thresholds
    fn end_sensorless(&mut self, axis: AbAxis);

    /// Consume the stall/endstop trigger latched during the last move
    fn take_endstop_trigger(&mut self) -> bool;

    /// Enable or disable normal endstop interrupt handling; returns the
    /// previous setting so it can be restored
    fn set_endstops_enabled(&mut self, enabled: bool) -> bool;

    fn current(&self, axis: AbAxis) -> CurrentSetting;
    fn set_current(&mut self, axis: AbAxis, setting: CurrentSetting);

    fn shaper(&self, axis: AbAxis) -> Option<ShaperConfig>;
    fn set_shaper(&mut self, axis: AbAxis, config: Option<ShaperConfig>);

    /// Current logical Cartesian position (mm)
    fn logical_xy(&self) -> (f32, f32);

    /// Commit a new logical machine position without motion
    fn set_machine_position(&mut self, x: f32, y: f32);
}
