//! Simulated CoreXY mechanics for tests
//!
//! Models the two motors, the driver phase counters and a pair of rigid
//! walls at the machine minimum that stop single-motor diagonal moves,
//! which is all the refinement pipeline observes. Wall-bias hooks and
//! seeded step noise let tests inject measurement faults per probe.

use crate::motion::hal::{CurrentSetting, MotionSystem, ShaperConfig};
use crate::motion::kinematics::{AbAxis, AbSteps, CoreXyGeometry, PHASE_CYCLE};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ops::Range;

/// Simulated CoreXY machine. Assumes the default sign conventions
/// (`coresign = 1`, homing to the min/min corner): the walls sit at
/// `x_wall`/`y_wall` in Cartesian step units and only block motion toward
/// the minimum.
pub struct SimCoreXy {
    geom: CoreXyGeometry,
    x_wall: f32,
    y_wall: f32,
    pos: AbSteps,
    logical: (f32, f32),
    draining: bool,
    sensorless: Option<AbAxis>,
    trigger: bool,
    endstops_enabled: bool,
    currents: [CurrentSetting; 2],
    shapers: [Option<ShaperConfig>; 2],
    probes: usize,
    wall_biases: Vec<(Range<usize>, f32)>,
    alternating_noise: f32,
    step_noise: Option<(StdRng, i32)>,
}

impl SimCoreXy {
    pub fn new(geom: CoreXyGeometry, x_wall: f32, y_wall: f32) -> Self {
        Self {
            geom,
            x_wall,
            y_wall,
            pos: AbSteps::default(),
            logical: (0.0, 0.0),
            draining: false,
            sensorless: None,
            trigger: false,
            endstops_enabled: false,
            currents: [CurrentSetting {
                rms_ma: 800,
                hold_multiplier: 0.5,
            }; 2],
            shapers: [None; 2],
            probes: 0,
            wall_biases: Vec::new(),
            alternating_noise: 0.0,
            step_noise: None,
        }
    }

    /// Teleport the motors, bypassing the wall model
    pub fn set_motor_positions(&mut self, a: i32, b: i32) {
        self.pos = AbSteps::new(a, b);
    }

    pub fn set_draining(&mut self, draining: bool) {
        self.draining = draining;
    }

    /// Total sensorless probe moves executed so far
    pub fn probe_count(&self) -> usize {
        self.probes
    }

    /// Lengthen (or shorten, when negative) the travel of the probes in
    /// the given index range by `steps`
    pub fn set_wall_bias(&mut self, probes: Range<usize>, steps: f32) {
        self.wall_biases.push((probes, steps));
    }

    /// Bias every other probe pair by `steps`, so consecutive pairs never
    /// agree
    pub fn set_alternating_noise(&mut self, steps: f32) {
        self.alternating_noise = steps;
    }

    /// Uniform per-probe travel noise in `-max_steps..=max_steps`,
    /// deterministic for a given seed
    pub fn set_step_noise(&mut self, seed: u64, max_steps: i32) {
        self.step_noise = Some((StdRng::seed_from_u64(seed), max_steps));
    }

    fn probe_bias(&mut self, probe: usize) -> f32 {
        let mut bias: f32 = self
            .wall_biases
            .iter()
            .filter(|(range, _)| range.contains(&probe))
            .map(|(_, steps)| steps)
            .sum();
        if (probe / 2) % 2 == 1 {
            bias += self.alternating_noise;
        }
        if let Some((rng, max)) = &mut self.step_noise {
            bias += rng.gen_range(-*max..=*max) as f32;
        }
        bias
    }

    /// Wall contact point of a single-motor move, if the commanded target
    /// lies beyond a wall
    fn wall_hit(&mut self, axis: AbAxis, from: AbSteps, target: i32) -> Option<i32> {
        let start = from.get(axis);
        let dir = (target - start).signum();
        if dir == 0 {
            return None;
        }

        let other = from.get(axis.other()) as f32;
        // contact coordinates along the moving motor, walls in Cartesian
        // step units: x = (a+b)/2, y = (a-b)/2
        let hit = match (axis, dir > 0) {
            // b+ lowers y, b- lowers x
            (AbAxis::B, true) => Some(other - 2.0 * self.y_wall),
            (AbAxis::B, false) => Some(2.0 * self.x_wall - other),
            // a+ raises both x and y, away from the walls
            (AbAxis::A, true) => None,
            // a- lowers both; the first contact wins
            (AbAxis::A, false) => {
                Some((2.0 * self.x_wall - other).max(2.0 * self.y_wall + other))
            }
        }?;

        let probe = self.probes;
        let hit = (hit + dir as f32 * self.probe_bias(probe)).round() as i32;
        let beyond = if dir > 0 { target >= hit } else { target <= hit };
        beyond.then_some(hit)
    }
}

impl MotionSystem for SimCoreXy {
    fn move_to_xy(&mut self, x: f32, y: f32, _feedrate_mm_s: f32) -> crate::Result<()> {
        if self.draining {
            return Ok(());
        }
        let x_steps = x / self.geom.mm_per_step[0];
        let y_steps = y / self.geom.mm_per_step[1];
        self.pos = self.geom.xy_steps_to_ab(x_steps, y_steps);
        self.logical = (x, y);
        Ok(())
    }

    fn plan_raw_ab_move(&mut self, target: AbSteps, _feedrate_mm_s: f32) -> crate::Result<()> {
        if self.draining {
            return Ok(());
        }
        if let Some(axis) = self.sensorless {
            let hit = self.wall_hit(axis, self.pos, target.get(axis));
            self.probes += 1;
            match hit {
                Some(stop) => {
                    *self.pos.get_mut(axis) = stop;
                    self.trigger = true;
                }
                None => self.pos = target,
            }
        } else {
            self.pos = target;
        }
        Ok(())
    }

    fn synchronize(&mut self) {}

    fn wait_for_standstill(&mut self) {}

    fn draining(&self) -> bool {
        self.draining
    }

    fn position(&self, axis: AbAxis) -> i32 {
        self.pos.get(axis)
    }

    fn phase(&self, axis: AbAxis) -> u16 {
        let count_dir = if self.geom.invert_dir[axis.index()] {
            -1
        } else {
            1
        };
        let pps = self.geom.phase_per_ustep(axis);
        (self.pos.get(axis) * count_dir * pps).rem_euclid(PHASE_CYCLE) as u16
    }

    fn resync_from_steppers(&mut self) {
        // step counters are authoritative here already
    }

    fn begin_sensorless(&mut self, axis: AbAxis) {
        self.sensorless = Some(axis);
    }

    fn end_sensorless(&mut self, _axis: AbAxis) {
        self.sensorless = None;
    }

    fn take_endstop_trigger(&mut self) -> bool {
        std::mem::take(&mut self.trigger)
    }

    fn set_endstops_enabled(&mut self, enabled: bool) -> bool {
        std::mem::replace(&mut self.endstops_enabled, enabled)
    }

    fn current(&self, axis: AbAxis) -> CurrentSetting {
        self.currents[axis.index()]
    }

    fn set_current(&mut self, axis: AbAxis, setting: CurrentSetting) {
        self.currents[axis.index()] = setting;
    }

    fn shaper(&self, axis: AbAxis) -> Option<ShaperConfig> {
        self.shapers[axis.index()]
    }

    fn set_shaper(&mut self, axis: AbAxis, config: Option<ShaperConfig>) {
        self.shapers[axis.index()] = config;
    }

    fn logical_xy(&self) -> (f32, f32) {
        self.logical
    }

    fn set_machine_position(&mut self, x: f32, y: f32) {
        self.logical = (x, y);
    }
}
