//! Origin refinement orchestration
//!
//! After conventional sensorless homing lands the carriage *near* the
//! corner, [`HomingEngine::home_refine`] resolves the exact machine origin:
//! it aligns both motors to a phase-zero crossing, calibrates (or loads)
//! the grid origin, validates the current corner against it and commits
//! the resulting Cartesian offset as the logical machine position.

use super::calibration::{
    cdist_translate, measure_origin_multipoint, point_is_unstable, OriginMeasurement,
};
use super::cycle::measure_phase_cycles;
use super::hal::MotionSystem;
use super::kinematics::{AbAxis, AbSteps, CoreXyGeometry};
use crate::config::HomingConfig;
use crate::error::{Error, Result};
use crate::util::restore_after;
use serde::{Deserialize, Serialize};

/// Grid offset of the secondary validation point, chosen away from the
/// calibration grid
const VALIDATION_OFFSET: [i32; 2] = [-1, 3];

/// Persisted grid-origin calibration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibratedOrigin {
    /// Fractional AB-cycle origin (grid centroid)
    pub origin: [f32; 2],
    /// Averaged bump travel per direction (mm)
    pub distance: [f32; 2],
}

impl From<OriginMeasurement> for CalibratedOrigin {
    fn from(m: OriginMeasurement) -> Self {
        Self {
            origin: m.origin,
            distance: m.distance,
        }
    }
}

/// Persistence hook for the grid-origin calibration. The storage format
/// is owned by the integrating firmware; this crate only needs load and
/// store.
pub trait OriginStore {
    fn load(&self) -> Result<Option<CalibratedOrigin>>;
    fn save(&mut self, origin: &CalibratedOrigin) -> Result<()>;
}

/// Volatile store, for tests and bench setups without persistent config
#[derive(Debug, Default)]
pub struct MemoryOriginStore {
    origin: Option<CalibratedOrigin>,
    saves: usize,
}

impl MemoryOriginStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times a calibration has been written
    pub fn save_count(&self) -> usize {
        self.saves
    }
}

impl OriginStore for MemoryOriginStore {
    fn load(&self) -> Result<Option<CalibratedOrigin>> {
        Ok(self.origin)
    }

    fn save(&mut self, origin: &CalibratedOrigin) -> Result<()> {
        self.origin = Some(*origin);
        self.saves += 1;
        Ok(())
    }
}

/// When to run the full grid calibration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationMode {
    /// Calibrate only when no persisted origin exists
    OnDemand,
    /// Always recalibrate and persist the result
    Force,
}

/// Drives the refinement over a [`MotionSystem`] and an [`OriginStore`].
pub struct HomingEngine<'a, M: MotionSystem, S: OriginStore> {
    machine: &'a mut M,
    geom: &'a CoreXyGeometry,
    cfg: &'a HomingConfig,
    store: &'a mut S,
    unstable: bool,
}

impl<'a, M: MotionSystem, S: OriginStore> HomingEngine<'a, M, S> {
    pub fn new(
        machine: &'a mut M,
        geom: &'a CoreXyGeometry,
        cfg: &'a HomingConfig,
        store: &'a mut S,
    ) -> Self {
        Self {
            machine,
            geom,
            cfg,
            store,
            unstable: false,
        }
    }

    /// True once a grid-origin calibration has been persisted
    pub fn is_calibrated(&self) -> Result<bool> {
        Ok(self.store.load()?.is_some())
    }

    /// True when the machine is uncalibrated or the last refinement saw
    /// marginal measurements
    pub fn is_unstable(&self) -> Result<bool> {
        Ok(self.store.load()?.is_none() || self.unstable)
    }

    /// Refine the machine origin from the current near-corner position.
    ///
    /// `Ok(false)` is a non-fatal failure (measurement did not converge,
    /// validation mismatch, or cancellation): the caller may re-home and
    /// retry. Internal consistency violations are returned as
    /// [`Error::MotionFault`] since they indicate a planner or stepper
    /// bug that retrying would only mask.
    pub fn home_refine(&mut self, mode: CalibrationMode) -> Result<bool> {
        self.machine.synchronize();
        self.unstable = false;

        // main endstop handling is off for the whole refinement
        let endstops_were = self.machine.set_endstops_enabled(false);
        restore_after(
            self,
            |eng| eng.refine(mode),
            |eng| {
                eng.machine.set_endstops_enabled(endstops_were);
            },
        )
    }

    fn refine(&mut self, mode: CalibrationMode) -> Result<bool> {
        let geom = self.geom;
        let cfg = self.cfg;

        // reposition parallel to the origin
        let origin_tmp = [
            geom.home_pos[0] - cfg.origin_offset_mm * f32::from(geom.home_dir[0]),
            geom.home_pos[1] - cfg.origin_offset_mm * f32::from(geom.home_dir[1]),
        ];
        self.machine
            .move_to_xy(origin_tmp[0], origin_tmp[1], cfg.home_feedrate_mm_s)?;
        self.machine.synchronize();

        // align both motors to a full phase
        self.machine.wait_for_standstill();
        let origin_steps = AbSteps::new(
            self.machine.position(AbAxis::A)
                + geom.phase_backoff_steps(AbAxis::A, self.machine.phase(AbAxis::A)),
            self.machine.position(AbAxis::B)
                + geom.phase_backoff_steps(AbAxis::B, self.machine.phase(AbAxis::B)),
        );

        self.machine
            .plan_raw_ab_move(origin_steps, cfg.home_feedrate_mm_s)?;
        let raw_diff = AbSteps::new(
            self.machine.position(AbAxis::A) - origin_steps.a,
            self.machine.position(AbAxis::B) - origin_steps.b,
        );
        if raw_diff != AbSteps::default() {
            if self.machine.draining() {
                return Ok(false);
            }
            log::error!("raw move failed, diff A:{} B:{}", raw_diff.a, raw_diff.b);
            return Err(Error::MotionFault("raw move didn't reach requested position"));
        }

        self.machine.wait_for_standstill();
        if !geom.phase_aligned(AbAxis::A, self.machine.phase(AbAxis::A))
            || !geom.phase_aligned(AbAxis::B, self.machine.phase(AbAxis::B))
        {
            if self.machine.draining() {
                return Ok(false);
            }
            log::error!(
                "phase alignment failed, phase A:{} B:{}",
                self.machine.phase(AbAxis::A),
                self.machine.phase(AbAxis::B)
            );
            return Err(Error::MotionFault("phase alignment failed"));
        }

        let measured_axis = geom.measured_axis();

        // calibrate if not done already
        let calibrated = match (mode, self.store.load()?) {
            (CalibrationMode::OnDemand, Some(existing)) => existing,
            _ => {
                log::info!("recalibrating homing origin");
                let measured = match measure_origin_multipoint(
                    self.machine,
                    geom,
                    cfg,
                    measured_axis,
                    origin_steps,
                    &mut self.unstable,
                )? {
                    Some(m) => m,
                    None => {
                        log::warn!("home origin calibration failed");
                        return Ok(false);
                    }
                };
                let calibrated = CalibratedOrigin::from(measured);
                self.store.save(&calibrated)?;
                calibrated
            }
        };

        // measure from the current origin
        let c_dist = match measure_phase_cycles(self.machine, geom, cfg, measured_axis)? {
            Some(s) => s.c_dist,
            None => return Ok(false),
        };
        if point_is_unstable(c_dist, calibrated.origin, cfg.stability_threshold) {
            self.unstable = true;
            log::warn!("home point is unstable");
        }

        // validate from another point in the AB grid
        let v_target = geom.abgrid_to_ab_steps(origin_steps, VALIDATION_OFFSET);
        self.machine
            .plan_raw_ab_move(v_target, cfg.home_feedrate_mm_s)?;
        if self.machine.draining() {
            return Ok(false);
        }
        let v_c_dist = match measure_phase_cycles(self.machine, geom, cfg, measured_axis)? {
            Some(s) => s.c_dist,
            None => return Ok(false),
        };

        let c_ab = cdist_translate(c_dist, calibrated.origin);
        let v_c_ab = cdist_translate(v_c_dist, calibrated.origin);
        if [
            v_c_ab[0] - VALIDATION_OFFSET[0],
            v_c_ab[1] - VALIDATION_OFFSET[1],
        ] != c_ab
        {
            self.unstable = true;
            log::warn!("home validation point is invalid");
            return Ok(false);
        }
        if point_is_unstable(v_c_dist, calibrated.origin, cfg.stability_threshold) {
            self.unstable = true;
            log::warn!("home validation point is unstable");
        }

        // move back to the origin
        self.machine
            .plan_raw_ab_move(origin_steps, cfg.home_feedrate_mm_s)?;
        if self.machine.draining() {
            return Ok(false);
        }

        // commit the calibrated origin as the logical machine position
        let dirs_equal = geom.home_dir[0] == geom.home_dir[1];
        let c_ab_steps = AbSteps::new(
            c_ab[if dirs_equal { 0 } else { 1 }]
                * geom.phase_cycle_steps(AbAxis::A)
                * -i32::from(geom.home_dir[1]),
            c_ab[if dirs_equal { 1 } else { 0 }]
                * geom.phase_cycle_steps(AbAxis::B)
                * -i32::from(geom.home_dir[0]),
        );
        let c_mm = geom.ab_to_xy_mm(c_ab_steps);
        self.machine.set_machine_position(
            c_mm.x + origin_tmp[0] + cfg.origin_offset_mm * f32::from(geom.home_dir[0]),
            c_mm.y + origin_tmp[1] + cfg.origin_offset_mm * f32::from(geom.home_dir[1]),
        );
        log::debug!("calibrated home cycle A:{} B:{}", c_ab[0], c_ab[1]);

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::mock::SimCoreXy;

    fn setup() -> (SimCoreXy, CoreXyGeometry, HomingConfig, MemoryOriginStore) {
        let _ = env_logger::builder().is_test(true).try_init();
        let geom = CoreXyGeometry::default();
        let sim = SimCoreXy::new(geom.clone(), 4.0, 4.0);
        (sim, geom, HomingConfig::default(), MemoryOriginStore::new())
    }

    #[test]
    fn test_first_refine_calibrates_and_commits_origin() {
        let (mut sim, geom, cfg, mut store) = setup();
        let mut engine = HomingEngine::new(&mut sim, &geom, &cfg, &mut store);
        assert!(!engine.is_calibrated().unwrap());
        assert!(engine.is_unstable().unwrap());

        assert!(engine.home_refine(CalibrationMode::OnDemand).unwrap());
        assert!(engine.is_calibrated().unwrap());
        assert!(!engine.is_unstable().unwrap());

        assert_eq!(store.save_count(), 1);
        let origin = store.load().unwrap().unwrap();
        assert!((origin.origin[0] - 12.875).abs() < 1e-4);
        assert!(origin.origin[1].abs() < 1e-4);

        // 36 calibration probes + 4 at the origin + 4 at the validation point
        assert_eq!(sim.probe_count(), 44);
        // motors aligned on the phase grid at the refined origin
        assert_eq!(sim.position(AbAxis::A), 832);
        assert_eq!(sim.position(AbAxis::B), 0);
        let (x, y) = sim.logical_xy();
        assert!((x - 5.2).abs() < 1e-4);
        assert!((y - 5.2).abs() < 1e-4);
    }

    #[test]
    fn test_second_refine_reuses_calibration() {
        let (mut sim, geom, cfg, mut store) = setup();
        {
            let mut engine = HomingEngine::new(&mut sim, &geom, &cfg, &mut store);
            assert!(engine.home_refine(CalibrationMode::OnDemand).unwrap());
        }
        let first_probes = sim.probe_count();

        let mut engine = HomingEngine::new(&mut sim, &geom, &cfg, &mut store);
        assert!(engine.home_refine(CalibrationMode::OnDemand).unwrap());
        // only origin + validation measurements this time
        assert_eq!(sim.probe_count() - first_probes, 8);
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn test_force_mode_recalibrates() {
        let (mut sim, geom, cfg, mut store) = setup();
        {
            let mut engine = HomingEngine::new(&mut sim, &geom, &cfg, &mut store);
            assert!(engine.home_refine(CalibrationMode::OnDemand).unwrap());
        }
        let mut engine = HomingEngine::new(&mut sim, &geom, &cfg, &mut store);
        assert!(engine.home_refine(CalibrationMode::Force).unwrap());
        assert_eq!(store.save_count(), 2);
    }

    #[test]
    fn test_cancellation_is_non_fatal() {
        let (mut sim, geom, cfg, mut store) = setup();
        sim.set_draining(true);
        let mut engine = HomingEngine::new(&mut sim, &geom, &cfg, &mut store);
        assert!(!engine.home_refine(CalibrationMode::OnDemand).unwrap());
        assert_eq!(store.save_count(), 0);
    }

    #[test]
    fn test_endstop_state_restored() {
        let (mut sim, geom, cfg, mut store) = setup();
        sim.set_endstops_enabled(true);
        {
            let mut engine = HomingEngine::new(&mut sim, &geom, &cfg, &mut store);
            assert!(engine.home_refine(CalibrationMode::OnDemand).unwrap());
        }
        assert!(sim.set_endstops_enabled(true)); // previous state was restored
    }

    #[test]
    fn test_validation_mismatch_rejects_home() {
        let (mut sim, geom, cfg, mut store) = setup();
        {
            let mut engine = HomingEngine::new(&mut sim, &geom, &cfg, &mut store);
            assert!(engine.home_refine(CalibrationMode::OnDemand).unwrap());
        }
        let first_probes = sim.probe_count();
        // the second refinement probes 0..3 at the origin and 4..7 at the
        // validation point; skew only the validation measurement
        sim.set_wall_bias(first_probes + 4..first_probes + 8, -64.0);

        let mut engine = HomingEngine::new(&mut sim, &geom, &cfg, &mut store);
        assert!(!engine.home_refine(CalibrationMode::OnDemand).unwrap());
        assert!(engine.is_unstable().unwrap());
    }
}
