//! Multi-point origin calibration
//!
//! A single phase-cycle sample is only accurate to a fraction of a cycle
//! and is biased by belt tension at the probed point. Probing a 3x3 grid
//! of full-cycle offsets around the homing corner and averaging the
//! samples cancels the per-point asymmetry; each point is then checked
//! against the centroid, both for gross errors (wrong integer cycle) and
//! for samples sitting too close to a half-cycle boundary to round
//! reliably.

use super::cycle::measure_phase_cycles;
use super::hal::MotionSystem;
use super::kinematics::{AbAxis, AbSteps, CoreXyGeometry};
use crate::config::HomingConfig;
use crate::error::Result;

/// Grid probing order, in full AB cycles away from the homing corner.
/// Deliberately scrambled so consecutive moves pull the belts in varying
/// directions, redistributing tension before the corner itself is probed
/// last.
pub const POINT_SEQUENCE: [[i32; 2]; 9] = [
    [1, 0],
    [-1, 0],
    [0, 1],
    [0, -1],
    [-1, -1],
    [1, 1],
    [1, -1],
    [-1, 1],
    [0, 0],
];

/// Calibrated grid centroid and the averaged bump distances behind it
#[derive(Debug, Clone, Copy)]
pub struct OriginMeasurement {
    /// Fractional AB-cycle origin (grid centroid)
    pub origin: [f32; 2],
    /// Averaged bump travel per direction (mm)
    pub distance: [f32; 2],
}

/// True when a sample sits within `threshold` of a half-cycle grid line
/// relative to `origin`, where rounding to the integer grid can flip
pub fn point_is_unstable(c_dist: [f32; 2], origin: [f32; 2], threshold: f32) -> bool {
    c_dist
        .iter()
        .zip(origin.iter())
        .any(|(c, o)| ((c - o).rem_euclid(1.0) - 0.5).abs() < threshold)
}

/// Translate a fractional cycle sample by `origin` and round onto the
/// integer AB grid
pub fn cdist_translate(c_dist: [f32; 2], origin: [f32; 2]) -> [i32; 2] {
    let mut c_ab = [0i32; 2];
    for axis in 0..2 {
        let o_int = origin[axis].round() as i32;
        c_ab[axis] = (c_dist[axis] - origin[axis]).round() as i32 + o_int;
    }
    c_ab
}

struct PointData {
    c_dist: [f32; 2],
    m_dist: [f32; 2],
    revalidate: bool,
}

/// Probe the 9-point grid around `origin_steps` and compute a stable
/// centroid origin.
///
/// Points flagged unstable are re-probed on the next outer iteration
/// while the rest are kept cached, so a single marginal point does not
/// cost a full grid pass. The loop ends as soon as every point is stable;
/// it gives up when the unstable count stops decreasing (the centroid
/// itself is likely drifting) or when a point rounds to the wrong integer
/// cell (a skipped step, which no amount of re-probing fixes).
///
/// `unstable` is latched whenever any point misbehaves, even on runs that
/// eventually fail. `Ok(None)` covers rejection and cancellation; motion
/// faults propagate as errors.
pub fn measure_origin_multipoint<M: MotionSystem>(
    machine: &mut M,
    geom: &CoreXyGeometry,
    cfg: &HomingConfig,
    axis: AbAxis,
    origin_steps: AbSteps,
    unstable: &mut bool,
) -> Result<Option<OriginMeasurement>> {
    let mut points: Vec<PointData> = (0..POINT_SEQUENCE.len())
        .map(|_| PointData {
            c_dist: [0.0; 2],
            m_dist: [0.0; 2],
            revalidate: true,
        })
        .collect();

    let mut result = OriginMeasurement {
        origin: [0.0; 2],
        distance: [0.0; 2],
    };

    let mut rev_cnt = POINT_SEQUENCE.len();
    for _ in 0..POINT_SEQUENCE.len() / 2 {
        let mut c_acc = [0.0f32; 2];
        let mut m_acc = [0.0f32; 2];

        for (seq, data) in POINT_SEQUENCE.iter().zip(points.iter_mut()) {
            if data.revalidate {
                let target = geom.abgrid_to_ab_steps(origin_steps, *seq);
                machine.plan_raw_ab_move(target, cfg.home_feedrate_mm_s)?;
                if machine.draining() {
                    return Ok(None);
                }

                let sample = match measure_phase_cycles(machine, geom, cfg, axis)? {
                    Some(s) => s,
                    None => return Ok(None),
                };
                data.c_dist = sample.c_dist;
                data.m_dist = sample.m_dist;
            }
            for k in 0..2 {
                c_acc[k] += data.c_dist[k];
                m_acc[k] += data.m_dist[k];
            }
        }
        let n = POINT_SEQUENCE.len() as f32;
        result.origin = [c_acc[0] / n, c_acc[1] / n];
        result.distance = [m_acc[0] / n, m_acc[1] / n];

        // verify every point against the fresh centroid
        let o_int = [
            result.origin[0].round() as i32,
            result.origin[1].round() as i32,
        ];
        let mut new_rev_cnt = 0;
        for (seq, data) in POINT_SEQUENCE.iter().zip(points.iter_mut()) {
            let c_ab = cdist_translate(data.c_dist, result.origin);
            let c_diff = [c_ab[0] - seq[0] - o_int[0], c_ab[1] - seq[1] - o_int[1]];
            if c_diff != [0, 0] {
                *unstable = true;
                log::warn!(
                    "calibration point ({},{}) invalid A:{} B:{} with origin A:{} B:{}",
                    seq[0],
                    seq[1],
                    c_diff[0],
                    c_diff[1],
                    o_int[0],
                    o_int[1]
                );
                // a wrong integer cell means a skipped step or a false
                // centroid, which revalidation cannot recover
                return Ok(None);
            }

            data.revalidate = point_is_unstable(data.c_dist, result.origin, cfg.stability_threshold);
            if data.revalidate {
                *unstable = true;
                log::warn!(
                    "calibration point ({},{}) unstable A:{:.4} B:{:.4} with origin A:{:.4} B:{:.4}",
                    seq[0],
                    seq[1],
                    data.c_dist[0],
                    data.c_dist[1],
                    result.origin[0],
                    result.origin[1]
                );
                new_rev_cnt += 1;
            }
        }

        if new_rev_cnt == 0 {
            log::info!(
                "grid origin A:{:.4} B:{:.4}",
                result.origin[0],
                result.origin[1]
            );
            return Ok(Some(result));
        }
        if new_rev_cnt >= rev_cnt {
            // not improving between iterations: the centroid has likely
            // shifted under us
            return Ok(None);
        }
        rev_cnt = new_rev_cnt;
    }

    // out of iterations with unstable points left
    Ok(None)
}
