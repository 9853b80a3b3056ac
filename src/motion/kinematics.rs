//! CoreXY kinematics and stepper phase math
//!
//! A CoreXY pair drives the carriage through two motors A and B; Cartesian
//! position is a linear combination of the two motor step counts:
//! `x = (a + b) / 2`, `y = coresign * (a - b) / 2`. The TMC drivers expose a
//! phase (microstep) counter 0..1023 per motor, which gives sub-step
//! position information independent of the commanded step count - the
//! homing refinement uses it to land both motors on an exact phase-zero
//! crossing.

use serde::{Deserialize, Serialize};

/// Full electrical cycle of the stepper driver phase counter
pub const PHASE_CYCLE: i32 = 1024;

/// One of the two CoreXY motors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbAxis {
    A,
    B,
}

impl AbAxis {
    /// Index into per-motor configuration arrays (A maps to the X-axis
    /// slot, B to the Y-axis slot)
    #[inline]
    pub fn index(self) -> usize {
        match self {
            AbAxis::A => 0,
            AbAxis::B => 1,
        }
    }

    /// The other motor of the pair
    #[inline]
    pub fn other(self) -> AbAxis {
        match self {
            AbAxis::A => AbAxis::B,
            AbAxis::B => AbAxis::A,
        }
    }
}

/// Raw step position of both CoreXY motors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AbSteps {
    pub a: i32,
    pub b: i32,
}

impl AbSteps {
    pub fn new(a: i32, b: i32) -> Self {
        Self { a, b }
    }

    #[inline]
    pub fn get(&self, axis: AbAxis) -> i32 {
        match axis {
            AbAxis::A => self.a,
            AbAxis::B => self.b,
        }
    }

    #[inline]
    pub fn get_mut(&mut self, axis: AbAxis) -> &mut i32 {
        match axis {
            AbAxis::A => &mut self.a,
            AbAxis::B => &mut self.b,
        }
    }
}

/// Cartesian position in mm
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct XyMm {
    pub x: f32,
    pub y: f32,
}

/// Static CoreXY machine geometry and stepper configuration.
///
/// Per-axis arrays are indexed `[X, Y]`; motor A takes its driver
/// configuration from the X slot, motor B from the Y slot (matching the
/// physical wiring of the pair).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoreXyGeometry {
    /// Driver microstep resolution per axis
    pub microsteps: [u16; 2],
    /// Carriage travel per logical step (mm)
    pub mm_per_step: [f32; 2],
    /// Homing direction per axis: -1 homes to min, +1 to max
    pub home_dir: [i8; 2],
    /// Motor direction inversion per motor (A, B): true when a positive
    /// logical step decrements the driver phase counter
    pub invert_dir: [bool; 2],
    /// Sign convention of the Y term in the AB->XY transform (+1 or -1)
    pub coresign: i8,
    /// Nominal home position (mm)
    pub home_pos: [f32; 2],
}

impl Default for CoreXyGeometry {
    fn default() -> Self {
        Self {
            microsteps: [16, 16],
            mm_per_step: [0.0125, 0.0125],
            home_dir: [-1, -1],
            invert_dir: [false, false],
            coresign: 1,
            home_pos: [0.0, 0.0],
        }
    }
}

impl CoreXyGeometry {
    /// Driver phase counts per logical step (256 at full-step resolution)
    #[inline]
    pub fn phase_per_ustep(&self, axis: AbAxis) -> i32 {
        256 / i32::from(self.microsteps[axis.index()])
    }

    /// Logical steps per full phase cycle of one motor
    #[inline]
    pub fn phase_cycle_steps(&self, axis: AbAxis) -> i32 {
        PHASE_CYCLE / self.phase_per_ustep(axis)
    }

    /// Convert raw AB steps to Cartesian step units (unscaled)
    #[inline]
    pub fn ab_to_xy_steps(&self, steps: AbSteps) -> (f32, f32) {
        let x = (steps.a + steps.b) as f32 / 2.0;
        let y = f32::from(self.coresign) * (steps.a - steps.b) as f32 / 2.0;
        (x, y)
    }

    /// Convert raw AB steps to Cartesian mm
    pub fn ab_to_xy_mm(&self, steps: AbSteps) -> XyMm {
        let (x, y) = self.ab_to_xy_steps(steps);
        XyMm {
            x: x * self.mm_per_step[0],
            y: y * self.mm_per_step[1],
        }
    }

    /// Convert Cartesian step units back to AB motor steps (rounded)
    pub fn xy_steps_to_ab(&self, x: f32, y: f32) -> AbSteps {
        let ys = f32::from(self.coresign) * y;
        AbSteps {
            a: (x + ys).round() as i32,
            b: (x - ys).round() as i32,
        }
    }

    /// Direction in which the phase counter moves per positive logical step
    #[inline]
    fn stepper_count_dir(&self, axis: AbAxis) -> i32 {
        if self.invert_dir[axis.index()] {
            -1
        } else {
            1
        }
    }

    /// Signed step delta that moves the motor away from its endstop onto
    /// the nearest phase-zero crossing, rounded to whole microsteps.
    ///
    /// Derived from first principles rather than a per-axis sign table:
    /// backing out means moving the effector in `-home_dir`; when that
    /// motion decreases the phase counter the distance to the crossing is
    /// the current phase count, otherwise it is the remainder of the
    /// cycle. A wrong sign here produces systematic homing drift, hence
    /// the exhaustive tests below.
    pub fn phase_backoff_steps(&self, axis: AbAxis, phase: u16) -> i32 {
        let backout_dir = -i32::from(self.home_dir[axis.index()]);
        let count_dir = self.stepper_count_dir(axis);

        // moving `backout_dir` changes the phase counter by
        // `backout_dir * count_dir * pps` per step; we need the counter to
        // reach 0 (equivalently 1024)
        let phase = i32::from(phase);
        let phase_delta = if backout_dir * count_dir < 0 {
            phase
        } else {
            (PHASE_CYCLE - phase) % PHASE_CYCLE
        };
        let pps = self.phase_per_ustep(axis);
        ((phase_delta + pps / 2) / pps) * backout_dir
    }

    /// True when the phase counter is within half a microstep of the
    /// zero crossing (wraparound-aware)
    pub fn phase_aligned(&self, axis: AbAxis, phase: u16) -> bool {
        let half = self.phase_per_ustep(axis) / 2;
        let phase = i32::from(phase);
        phase <= half || phase >= PHASE_CYCLE - half
    }

    /// The motor measured during origin calibration. The probe geometry
    /// requires the motor whose single-motor diagonal runs between the two
    /// homing walls, which depends on the homing corner.
    pub fn measured_axis(&self) -> AbAxis {
        if self.home_dir[0] == self.home_dir[1] {
            AbAxis::B
        } else {
            AbAxis::A
        }
    }

    /// Direction of the first bump probe for the given motor
    pub fn measure_dir(&self, axis: AbAxis) -> i32 {
        match axis {
            AbAxis::B => -i32::from(self.home_dir[0]),
            AbAxis::A => -i32::from(self.home_dir[1]),
        }
    }

    /// Translate a full-AB-cycle grid offset (relative to the homing
    /// corner) into absolute motor steps around `origin_steps`
    pub fn abgrid_to_ab_steps(&self, origin_steps: AbSteps, off: [i32; 2]) -> AbSteps {
        let dirs_equal = self.home_dir[0] == self.home_dir[1];
        let a_cycles = off[if dirs_equal { 0 } else { 1 }] * -i32::from(self.home_dir[1]);
        let b_cycles = off[if dirs_equal { 1 } else { 0 }] * -i32::from(self.home_dir[0]);
        AbSteps {
            a: origin_steps.a + self.phase_cycle_steps(AbAxis::A) * a_cycles,
            b: origin_steps.b + self.phase_cycle_steps(AbAxis::B) * b_cycles,
        }
    }
}
