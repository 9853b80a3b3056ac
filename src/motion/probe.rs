//! Single-motor sensorless bump probe

use super::hal::MotionSystem;
use super::kinematics::{AbAxis, AbSteps, CoreXyGeometry};
use crate::config::HomingConfig;
use crate::error::{Error, Result};

/// Result of one bump probe
#[derive(Debug, Clone, Copy)]
pub struct ProbeSample {
    /// Whether the stall endstop fired before reaching the target
    pub hit: bool,
    /// Signed travel of the probed motor (steps)
    pub steps: i32,
    /// Euclidean XY travel (mm), always non-negative
    pub dist_mm: f32,
}

/// Bump one motor toward its wall and measure the travel until the stall
/// trigger, then move back to `origin`.
///
/// Holds the other motor fixed, so the carriage moves along the
/// single-motor diagonal. On a stall the logical position is resynced from
/// the hardware step counters, which are authoritative for the hit point.
///
/// Returns `Ok(None)` when the motion stack is draining (cooperative
/// cancellation, not a fault). Any post-move step-count deviation on
/// either motor is a fatal [`Error::MotionFault`]: it means the planner
/// and steppers disagree, which no retry can fix.
pub fn measure_axis_distance<M: MotionSystem>(
    machine: &mut M,
    geom: &CoreXyGeometry,
    cfg: &HomingConfig,
    axis: AbAxis,
    origin: AbSteps,
    dist: i32,
) -> Result<Option<ProbeSample>> {
    let initial_mm = geom.ab_to_xy_mm(origin);

    let mut target = origin;
    *target.get_mut(axis) += dist;

    machine.begin_sensorless(axis);
    machine.plan_raw_ab_move(target, cfg.measure_feedrate_mm_s)?;
    let hit = machine.take_endstop_trigger();

    let hit_steps = if hit {
        machine.resync_from_steppers();
        AbSteps::new(machine.position(AbAxis::A), machine.position(AbAxis::B))
    } else {
        target
    };
    machine.end_sensorless(axis);

    // move back to the starting point
    machine.plan_raw_ab_move(origin, cfg.home_feedrate_mm_s)?;
    if machine.draining() {
        return Ok(None);
    }

    // consistency checks; see MotionSystem::plan_raw_ab_move contract
    let fixed = axis.other();
    if hit_steps.get(fixed) != origin.get(fixed) || origin.get(fixed) != machine.position(fixed) {
        return Err(Error::MotionFault("holding motor moved during probe"));
    }
    if origin.get(axis) != machine.position(axis) {
        return Err(Error::MotionFault("probed motor did not return to origin"));
    }

    let hit_mm = geom.ab_to_xy_mm(hit_steps);
    Ok(Some(ProbeSample {
        hit,
        steps: hit_steps.get(axis) - origin.get(axis),
        dist_mm: (hit_mm.x - initial_mm.x).hypot(hit_mm.y - initial_mm.y),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HomingConfig;
    use crate::devices::mock::SimCoreXy;
    use crate::motion::kinematics::CoreXyGeometry;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn setup() -> (SimCoreXy, CoreXyGeometry, HomingConfig) {
        let geom = CoreXyGeometry::default();
        let mut sim = SimCoreXy::new(geom.clone(), 4.0, 4.0);
        sim.set_motor_positions(832, 0);
        (sim, geom, HomingConfig::default())
    }

    #[test]
    fn test_probe_hits_wall_and_returns() {
        let (mut sim, geom, cfg) = setup();
        let origin = AbSteps::new(832, 0);
        let sample = measure_axis_distance(&mut sim, &geom, &cfg, AbAxis::B, origin, 1600)
            .unwrap()
            .unwrap();
        assert!(sample.hit);
        // y wall at 4 step units: b travels a0 - b0 - 2*y_wall = 824
        assert_eq!(sample.steps, 824);
        assert!(sample.dist_mm > 0.0);
        // carriage is back at the origin
        assert_eq!(sim.position(AbAxis::A), 832);
        assert_eq!(sim.position(AbAxis::B), 0);
    }

    #[test]
    fn test_probe_never_moves_holding_motor() {
        let (mut sim, geom, cfg) = setup();
        let mut rng = StdRng::seed_from_u64(11);
        // random origins and signed distances, hitting and missing walls
        for round in 0..128 {
            let origin = AbSteps::new(rng.gen_range(16..2000), rng.gen_range(-500..500));
            let dist = rng.gen_range(1..2000) * if rng.gen_bool(0.5) { 1 } else { -1 };
            let axis = if round % 2 == 0 { AbAxis::B } else { AbAxis::A };
            sim.set_motor_positions(origin.a, origin.b);

            let sample = measure_axis_distance(&mut sim, &geom, &cfg, axis, origin, dist)
                .unwrap()
                .unwrap();
            assert_eq!(
                sim.position(AbAxis::A),
                origin.a,
                "axis {:?} origin {:?} dist {}",
                axis,
                origin,
                dist
            );
            assert_eq!(
                sim.position(AbAxis::B),
                origin.b,
                "axis {:?} origin {:?} dist {}",
                axis,
                origin,
                dist
            );
            let _ = sample;
        }
    }

    #[test]
    fn test_probe_miss_reports_no_hit() {
        let (mut sim, geom, cfg) = setup();
        let origin = AbSteps::new(832, 0);
        // too short to reach either wall
        let sample = measure_axis_distance(&mut sim, &geom, &cfg, AbAxis::B, origin, 100)
            .unwrap()
            .unwrap();
        assert!(!sample.hit);
        assert_eq!(sample.steps, 100);
    }

    #[test]
    fn test_probe_cancelled_while_draining() {
        let (mut sim, geom, cfg) = setup();
        sim.set_draining(true);
        let origin = AbSteps::new(832, 0);
        let out = measure_axis_distance(&mut sim, &geom, &cfg, AbAxis::B, origin, 1600).unwrap();
        assert!(out.is_none());
    }
}
