//! Inertial-only optimization for IMU initialization.
//!
//! With the visual trajectory held fixed, estimates:
//! - the gravity direction `R_wg` (2 DoF, rotation about the vertical is unobservable)
//! - the map scale (monocular only)
//! - shared gyroscope and accelerometer biases, with a prior towards zero
//! - one metric velocity per KeyFrame
//!
//! Each pair of consecutive KeyFrames contributes a 9-dimensional
//! preintegration residual `[e_R, e_v, e_p]`, whitened by the square root of
//! the diagonal of its information:
//!
//! ```text
//! e_R = Log(ΔR(bg)ᵀ · R_wbiᵀ R_wbj)
//! e_v = R_wbiᵀ (v_j − v_i − g dt) − Δv(bg, ba)
//! e_p = R_wbiᵀ (s (c_j − c_i) + (R_wcj − R_wci) t_cb − v_i dt − ½ g dt²) − Δp(bg, ba)
//! ```
//!
//! Solved with the `levenberg-marquardt` crate on a forward-difference
//! Jacobian; the problem has only `9 + 3n` parameters.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::storage::Owned;
use nalgebra::{DMatrix, DVector, Dyn, Matrix3, Vector3};
use tracing::debug;

use crate::atlas::map::{KeyFrameId, Map};
use crate::error::{Result, SlamError};
use crate::geometry::so3;
use crate::imu::{ImuBias, ImuCalib, Preintegrated, GRAVITY_MAGNITUDE};

/// Relative step of the numeric Jacobian.
const JACOBIAN_STEP: f64 = 1e-7;

/// Prior weights `(gyro, accel)` on the biases.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiasPriors {
    pub gyro: f64,
    pub accel: f64,
}

#[derive(Debug, Clone)]
struct Segment {
    /// Indices of the KeyFrames at both ends.
    i: usize,
    j: usize,
    preintegrated: Preintegrated,
    /// `sqrt(diag(information))` of `[δθ, δv, δp]`.
    sqrt_info: [f64; 9],
}

#[derive(Debug, Clone)]
struct KeyFrameState {
    /// Camera rotation and center in the visual frame.
    r_wc: Matrix3<f64>,
    center: Vector3<f64>,
    /// Body rotation `R_wc R_cb`.
    r_wb: Matrix3<f64>,
}

/// Snapshot of the inertial initialization inputs.
#[derive(Debug, Clone)]
pub struct InertialInitProblem {
    pub keyframes: Vec<KeyFrameId>,
    states: Vec<KeyFrameState>,
    segments: Vec<Segment>,
    t_cb: Vector3<f64>,
    r_wg0: Matrix3<f64>,
    scale0: f64,
    bias0: ImuBias,
    velocities0: Vec<Vector3<f64>>,
    pub fix_scale: bool,
    pub priors: BiasPriors,
}

#[derive(Debug, Clone)]
pub struct InertialInitResult {
    /// Rotation from the gravity-aligned frame to the current map frame.
    pub r_wg: Matrix3<f64>,
    /// Multiply map lengths by this to make them metric.
    pub scale: f64,
    pub bias: ImuBias,
    /// Metric velocities in the current map frame.
    pub velocities: Vec<(KeyFrameId, Vector3<f64>)>,
    pub initial_cost: f64,
    pub final_cost: f64,
}

/// Gravity direction from the accumulated velocity deltas, as `R_wg` with
/// `R_wg · (0, 0, −1)` pointing down.
fn gravity_rotation_from_deltas(states: &[KeyFrameState], segments: &[Segment]) -> Matrix3<f64> {
    let mut dir = Vector3::zeros();
    for s in segments {
        dir -= states[s.i].r_wb * s.preintegrated.updated_delta_velocity();
    }
    let norm = dir.norm();
    if norm < 1e-9 {
        return Matrix3::identity();
    }
    so3::rotation_between(&Vector3::new(0.0, 0.0, -1.0), &(dir / norm))
}

impl InertialInitProblem {
    /// Collect the temporally ordered KeyFrames of `map` that are linked by
    /// preintegrated IMU data.
    pub fn collect(map: &Map, calib: &ImuCalib, priors: BiasPriors, fix_scale: bool) -> Option<Self> {
        let ordered = map.keyframes_temporal_order();
        if ordered.len() < 3 {
            return None;
        }
        let r_cb = calib.t_cb.rotation_matrix();
        let mut keyframes = Vec::with_capacity(ordered.len());
        let mut states = Vec::with_capacity(ordered.len());
        for kf in &ordered {
            let r_wc = kf.pose.rotation_matrix();
            keyframes.push(kf.id);
            states.push(KeyFrameState {
                r_wc,
                center: kf.pose.translation,
                r_wb: r_wc * r_cb,
            });
        }

        let mut segments = Vec::new();
        for (j, kf) in ordered.iter().enumerate().skip(1) {
            let Some(pre) = kf.imu_preintegrated.as_ref() else {
                continue;
            };
            if pre.is_empty() || pre.d_t <= 0.0 || kf.prev_kf != Some(ordered[j - 1].id) {
                continue;
            }
            let info = pre.information9();
            let mut sqrt_info = [0.0; 9];
            for (k, w) in sqrt_info.iter_mut().enumerate() {
                *w = info[(k, k)].max(0.0).sqrt();
            }
            segments.push(Segment {
                i: j - 1,
                j,
                preintegrated: pre.clone(),
                sqrt_info,
            });
        }
        if segments.len() < 2 {
            return None;
        }

        let initialized = map.is_imu_initialized();
        let r_wg0 = if initialized {
            Matrix3::identity()
        } else {
            gravity_rotation_from_deltas(&states, &segments)
        };

        let mut velocities0 = vec![Vector3::zeros(); ordered.len()];
        if initialized {
            for (v, kf) in velocities0.iter_mut().zip(&ordered) {
                *v = kf.velocity;
            }
        } else {
            for s in &segments {
                let dt = s.preintegrated.d_t;
                let v = (states[s.j].center - states[s.i].center) / dt;
                velocities0[s.i] = v;
                velocities0[s.j] = v;
            }
        }

        Some(Self {
            keyframes,
            states,
            segments,
            t_cb: calib.t_cb.translation,
            r_wg0,
            scale0: 1.0,
            bias0: map.imu_bias,
            velocities0,
            fix_scale,
            priors,
        })
    }

    fn num_params(&self) -> usize {
        2 + usize::from(!self.fix_scale) + 6 + 3 * self.keyframes.len()
    }

    fn initial_params(&self) -> DVector<f64> {
        let mut x = DVector::zeros(self.num_params());
        let mut k = 2;
        if !self.fix_scale {
            x[k] = self.scale0.ln();
            k += 1;
        }
        x.fixed_rows_mut::<3>(k).copy_from(&self.bias0.gyro);
        x.fixed_rows_mut::<3>(k + 3).copy_from(&self.bias0.accel);
        k += 6;
        for v in &self.velocities0 {
            x.fixed_rows_mut::<3>(k).copy_from(v);
            k += 3;
        }
        x
    }

    fn unpack(&self, x: &DVector<f64>) -> (Matrix3<f64>, f64, ImuBias, Vec<Vector3<f64>>) {
        let r_wg = self.r_wg0 * so3::exp(&Vector3::new(x[0], x[1], 0.0));
        let mut k = 2;
        let scale = if self.fix_scale {
            1.0
        } else {
            k += 1;
            x[2].exp()
        };
        let bias = ImuBias::new(x.fixed_rows::<3>(k).into_owned(), x.fixed_rows::<3>(k + 3).into_owned());
        k += 6;
        let velocities = (0..self.keyframes.len())
            .map(|n| x.fixed_rows::<3>(k + 3 * n).into_owned())
            .collect();
        (r_wg, scale, bias, velocities)
    }

    fn residuals_at(&self, x: &DVector<f64>) -> DVector<f64> {
        let (r_wg, scale, bias, velocities) = self.unpack(x);
        let g = r_wg * Vector3::new(0.0, 0.0, -GRAVITY_MAGNITUDE);
        let mut r = DVector::zeros(9 * self.segments.len() + 6);
        for (n, s) in self.segments.iter().enumerate() {
            let (a, b) = (&self.states[s.i], &self.states[s.j]);
            let pre = &s.preintegrated;
            let dt = pre.d_t;
            let r_bw = a.r_wb.transpose();

            let e_r = so3::log(&(pre.delta_rotation(&bias).transpose() * r_bw * b.r_wb));
            let e_v = r_bw * (velocities[s.j] - velocities[s.i] - g * dt) - pre.delta_velocity(&bias);
            let dp = scale * (b.center - a.center) + (b.r_wc - a.r_wc) * self.t_cb;
            let e_p = r_bw * (dp - velocities[s.i] * dt - 0.5 * g * dt * dt) - pre.delta_position(&bias);

            for k in 0..3 {
                r[9 * n + k] = e_r[k] * s.sqrt_info[k];
                r[9 * n + 3 + k] = e_v[k] * s.sqrt_info[3 + k];
                r[9 * n + 6 + k] = e_p[k] * s.sqrt_info[6 + k];
            }
        }
        let base = 9 * self.segments.len();
        let (wg, wa) = (self.priors.gyro.sqrt(), self.priors.accel.sqrt());
        for k in 0..3 {
            r[base + k] = wg * bias.gyro[k];
            r[base + 3 + k] = wa * bias.accel[k];
        }
        r
    }
}

/// Adapter between the problem snapshot and the LM solver.
struct InertialAlignment<'a> {
    problem: &'a InertialInitProblem,
    params: DVector<f64>,
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for InertialAlignment<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.copy_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let r = self.problem.residuals_at(&self.params);
        r.iter().all(|v| v.is_finite()).then_some(r)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let r0 = self.residuals()?;
        let mut j = DMatrix::zeros(r0.len(), self.params.len());
        let mut x = self.params.clone();
        for k in 0..x.len() {
            let h = JACOBIAN_STEP * x[k].abs().max(1.0);
            let saved = x[k];
            x[k] = saved + h;
            let r = self.problem.residuals_at(&x);
            x[k] = saved;
            j.set_column(k, &((r - &r0) / h));
        }
        Some(j)
    }
}

/// Run the inertial-only optimization.
pub fn solve(problem: &InertialInitProblem) -> Result<InertialInitResult> {
    let x0 = problem.initial_params();
    let initial = problem.residuals_at(&x0);
    let initial_cost = 0.5 * initial.norm_squared();
    if !initial_cost.is_finite() {
        return Err(SlamError::OptimizationDivergence("inertial init cost is not finite".into()));
    }

    let (solved, report) = LevenbergMarquardt::new().with_patience(50).minimize(InertialAlignment {
        problem,
        params: x0,
    });
    let final_cost = report.objective_function;
    if !final_cost.is_finite() || final_cost > initial_cost {
        return Err(SlamError::OptimizationDivergence(format!(
            "inertial init cost went from {initial_cost:.3} to {final_cost:.3} ({:?})",
            report.termination
        )));
    }

    let (r_wg, scale, bias, velocities) = problem.unpack(&solved.params);
    if !(scale.is_finite() && scale > 1e-3) || !bias.is_finite() {
        return Err(SlamError::OptimizationDivergence(format!("inertial init gave scale {scale}")));
    }
    debug!(
        "[InertialInit] {} keyframes: cost {:.3} -> {:.3}, scale {:.3}, {:?}",
        problem.keyframes.len(),
        initial_cost,
        final_cost,
        scale,
        report.termination
    );
    Ok(InertialInitResult {
        r_wg,
        scale,
        bias,
        velocities: problem.keyframes.iter().copied().zip(velocities).collect(),
        initial_cost,
        final_cost,
    })
}

/// Align the map with gravity, fix its scale and propagate the biases.
///
/// Velocities are expressed in the map frame before the alignment and become
/// metric gravity-aligned velocities after it.
pub fn apply(map: &mut Map, result: &InertialInitResult) {
    for (id, v) in &result.velocities {
        if let Some(kf) = map.get_keyframe_mut(*id) {
            kf.velocity = *v / result.scale;
        }
    }
    for kf in map.keyframes_mut() {
        kf.imu_bias = result.bias;
        if let Some(pre) = kf.imu_preintegrated.as_mut() {
            pre.set_new_bias(result.bias);
            pre.reintegrate();
        }
    }
    map.imu_bias = result.bias;
    map.apply_inertial_alignment(&result.r_wg.transpose(), result.scale);
    map.bump_big_change();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::map::{IdAllocator, MapId};
    use crate::features::Features;
    use crate::geometry::{CameraModel, SE3};
    use crate::imu::GRAVITY;
    use crate::tracking::frame::{Frame, FrameFeatures};
    use approx::assert_relative_eq;
    use std::sync::Arc;

    /// Body motion in a gravity-aligned metric frame.
    fn motion(t: f64) -> (Matrix3<f64>, Vector3<f64>, Vector3<f64>, Vector3<f64>) {
        let yaw_rate = 0.3;
        let r = so3::exp(&Vector3::new(0.0, 0.0, yaw_rate * t));
        let p = Vector3::new((0.8 * t).sin(), 0.5 * (0.6 * t).cos(), 0.1 * t * t);
        let a = Vector3::new(-0.64 * (0.8 * t).sin(), -0.18 * (0.6 * t).cos(), 0.2);
        (r, p, a, Vector3::new(0.0, 0.0, yaw_rate))
    }

    /// A monocular-inertial map whose visual frame is rotated by `r_vg` and
    /// shrunk by `1 / true_scale`.
    fn synthetic_map(r_vg: &Matrix3<f64>, true_scale: f64) -> Map {
        let calib = ImuCalib::default();
        let camera = CameraModel::pinhole(400.0, 400.0, 320.0, 240.0, 640, 480);
        let mut map = Map::new(MapId::new(0), Arc::new(IdAllocator::default()));
        let dt: f64 = 0.001;
        let kf_interval = 0.25;
        let mut t = 0.0;
        let mut pre: Option<Preintegrated> = None;
        for _ in 0..13 {
            let (r, p, _, _) = motion(t);
            let pose = SE3::from_rt(&(r_vg * r), r_vg * p / true_scale);
            let mut frame = Frame::new(0, t, FrameFeatures::new(Features::default(), &camera));
            frame.pose = Some(pose);
            frame.preintegrated_keyframe = pre.take();
            map.create_keyframe(&frame);

            let mut next = Preintegrated::new(ImuBias::zero(), &calib);
            let steps = (kf_interval / dt).round() as usize;
            for k in 0..steps {
                let tm = t + (k as f64 + 0.5) * dt;
                let (r, _, a, w) = motion(tm);
                next.integrate_measurement(r.transpose() * (a - GRAVITY), w, dt);
            }
            pre = Some(next);
            t += kf_interval;
        }
        map
    }

    fn priors() -> BiasPriors {
        BiasPriors {
            gyro: 1e2,
            accel: 1e5,
        }
    }

    #[test]
    fn test_recovers_gravity_and_scale() {
        let r_vg = so3::exp(&Vector3::new(0.3, -0.2, 0.5));
        let map = synthetic_map(&r_vg, 2.0);
        let problem = InertialInitProblem::collect(&map, &ImuCalib::default(), priors(), false).unwrap();
        let result = solve(&problem).unwrap();

        let down = result.r_wg * Vector3::new(0.0, 0.0, -1.0);
        let expected = r_vg * Vector3::new(0.0, 0.0, -1.0);
        assert!(down.angle(&expected) < 0.02, "gravity off by {} rad", down.angle(&expected));
        assert_relative_eq!(result.scale, 2.0, epsilon = 0.05);
        assert!(result.bias.gyro.norm() < 1e-2);
    }

    #[test]
    fn test_apply_aligns_map_with_gravity() {
        let r_vg = so3::exp(&Vector3::new(0.3, -0.2, 0.5));
        let mut map = synthetic_map(&r_vg, 2.0);
        let problem = InertialInitProblem::collect(&map, &ImuCalib::default(), priors(), false).unwrap();
        let result = solve(&problem).unwrap();
        let before = map.big_change();
        apply(&mut map, &result);
        assert_eq!(map.big_change(), before + 1);

        // The last KeyFrame sits at its metric position up to the yaw left free.
        let last = map.keyframes_temporal_order().last().map(|k| k.pose.translation).unwrap();
        let (_, p, _, _) = motion(12.0 * 0.25);
        assert_relative_eq!(last.norm(), p.norm(), epsilon = 0.1);
        assert_relative_eq!(last.z, p.z, epsilon = 0.05);
    }

    #[test]
    fn test_needs_linked_keyframes() {
        let map = Map::new(MapId::new(0), Arc::new(IdAllocator::default()));
        assert!(InertialInitProblem::collect(&map, &ImuCalib::default(), priors(), false).is_none());
    }
}
