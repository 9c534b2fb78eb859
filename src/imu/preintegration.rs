//! On-manifold IMU preintegration (Forster et al.).
//!
//! Integrates raw samples between two frames or keyframes into a relative
//! motion `[ΔR, Δv, Δp]` expressed in the body frame of the first one, with:
//! - first-order bias Jacobians so a bias update does not require reintegration
//! - a 15x15 covariance over `[δθ, δv, δp, δbg, δba]`
//! - the raw measurement list, kept for `reintegrate` and `merge_previous`

use nalgebra::{Matrix3, SMatrix, Vector3};

use super::sample::{ImuSample, GRAVITY};
use super::types::{ImuBias, ImuCalib, Matrix15, Matrix6, Matrix9};
use crate::geometry::so3;

#[derive(Debug, Clone, Copy)]
struct Measurement {
    accel: Vector3<f64>,
    gyro: Vector3<f64>,
    dt: f64,
}

/// Body pose and velocity in the world frame.
#[derive(Debug, Clone, Copy)]
pub struct NavState {
    pub r_wb: Matrix3<f64>,
    pub p_wb: Vector3<f64>,
    pub v_wb: Vector3<f64>,
}

#[derive(Debug, Clone)]
pub struct Preintegrated {
    pub d_t: f64,
    d_r: Matrix3<f64>,
    d_v: Vector3<f64>,
    d_p: Vector3<f64>,
    pub j_rg: Matrix3<f64>,
    pub j_vg: Matrix3<f64>,
    pub j_va: Matrix3<f64>,
    pub j_pg: Matrix3<f64>,
    pub j_pa: Matrix3<f64>,
    pub covariance: Matrix15,
    /// Bias the deltas were integrated with.
    bias: ImuBias,
    /// Latest bias estimate; the getters correct towards it to first order.
    updated_bias: ImuBias,
    cov_noise: Matrix6,
    cov_walk: Matrix6,
    measurements: Vec<Measurement>,
}

impl Preintegrated {
    pub fn new(bias: ImuBias, calib: &ImuCalib) -> Self {
        Self {
            d_t: 0.0,
            d_r: Matrix3::identity(),
            d_v: Vector3::zeros(),
            d_p: Vector3::zeros(),
            j_rg: Matrix3::zeros(),
            j_vg: Matrix3::zeros(),
            j_va: Matrix3::zeros(),
            j_pg: Matrix3::zeros(),
            j_pa: Matrix3::zeros(),
            covariance: Matrix15::zeros(),
            bias,
            updated_bias: bias,
            cov_noise: calib.cov_noise,
            cov_walk: calib.cov_walk,
            measurements: Vec::new(),
        }
    }

    fn reset_deltas(&mut self, bias: ImuBias) {
        self.d_t = 0.0;
        self.d_r = Matrix3::identity();
        self.d_v = Vector3::zeros();
        self.d_p = Vector3::zeros();
        self.j_rg = Matrix3::zeros();
        self.j_vg = Matrix3::zeros();
        self.j_va = Matrix3::zeros();
        self.j_pg = Matrix3::zeros();
        self.j_pa = Matrix3::zeros();
        self.covariance = Matrix15::zeros();
        self.bias = bias;
        self.updated_bias = bias;
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    pub fn bias(&self) -> ImuBias {
        self.bias
    }

    pub fn updated_bias(&self) -> ImuBias {
        self.updated_bias
    }

    /// Add one constant-rate interval to the preintegrated deltas.
    pub fn integrate_measurement(&mut self, accel: Vector3<f64>, gyro: Vector3<f64>, dt: f64) {
        if !(dt > 0.0) {
            return;
        }
        self.measurements.push(Measurement { accel, gyro, dt });
        self.integrate_step(accel, gyro, dt);
    }

    fn integrate_step(&mut self, accel: Vector3<f64>, gyro: Vector3<f64>, dt: f64) {
        let acc = accel - self.bias.accel;
        let w = gyro - self.bias.gyro;
        let dt2 = dt * dt;
        let w_acc = so3::skew(&acc);

        let mut a = Matrix9::identity();
        let mut b = SMatrix::<f64, 9, 6>::zeros();

        // Position and velocity use the rotation at the start of the step.
        self.d_p += self.d_v * dt + 0.5 * self.d_r * acc * dt2;
        self.d_v += self.d_r * acc * dt;

        a.fixed_view_mut::<3, 3>(3, 0).copy_from(&(-self.d_r * dt * w_acc));
        a.fixed_view_mut::<3, 3>(6, 0).copy_from(&(-0.5 * self.d_r * dt2 * w_acc));
        a.fixed_view_mut::<3, 3>(6, 3).copy_from(&(Matrix3::identity() * dt));
        b.fixed_view_mut::<3, 3>(3, 3).copy_from(&(self.d_r * dt));
        b.fixed_view_mut::<3, 3>(6, 3).copy_from(&(0.5 * self.d_r * dt2));

        self.j_pa += self.j_va * dt - 0.5 * self.d_r * dt2;
        self.j_pg += self.j_vg * dt - 0.5 * self.d_r * dt2 * w_acc * self.j_rg;
        self.j_va -= self.d_r * dt;
        self.j_vg -= self.d_r * dt * w_acc * self.j_rg;

        let phi = w * dt;
        let d_ri = so3::exp(&phi);
        let jr = so3::right_jacobian(&phi);
        self.d_r = so3::normalize_rotation(&(self.d_r * d_ri));

        a.fixed_view_mut::<3, 3>(0, 0).copy_from(&d_ri.transpose());
        b.fixed_view_mut::<3, 3>(0, 0).copy_from(&(jr * dt));

        let c9 = self.covariance.fixed_view::<9, 9>(0, 0).into_owned();
        let c9 = a * c9 * a.transpose() + b * self.cov_noise * b.transpose();
        self.covariance.fixed_view_mut::<9, 9>(0, 0).copy_from(&c9);
        let walk = self.covariance.fixed_view::<6, 6>(9, 9).into_owned() + self.cov_walk * dt;
        self.covariance.fixed_view_mut::<6, 6>(9, 9).copy_from(&walk);

        self.j_rg = d_ri.transpose() * self.j_rg - jr * dt;
        self.d_t += dt;
    }

    /// Integrate samples over `[t_start, t_end]`.
    ///
    /// `carried` is the last sample before this batch, if any. Intervals are
    /// clipped to the frame boundaries with linear interpolation, and the
    /// outermost samples are held constant where the batch does not cover the
    /// whole window.
    pub fn integrate_window(&mut self, carried: Option<&ImuSample>, samples: &[ImuSample], t_start: f64, t_end: f64) {
        let seq: Vec<ImuSample> = carried.into_iter().chain(samples.iter()).copied().collect();
        let (Some(first), Some(last)) = (seq.first(), seq.last()) else {
            return;
        };
        if first.timestamp > t_start {
            let hi = first.timestamp.min(t_end);
            self.integrate_measurement(first.accel, first.gyro, hi - t_start);
        }
        for pair in seq.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            let lo = a.timestamp.max(t_start);
            let hi = b.timestamp.min(t_end);
            if hi <= lo {
                continue;
            }
            let s0 = a.interpolate(b, lo);
            let s1 = a.interpolate(b, hi);
            self.integrate_measurement(0.5 * (s0.accel + s1.accel), 0.5 * (s0.gyro + s1.gyro), hi - lo);
        }
        if last.timestamp < t_end {
            let lo = last.timestamp.max(t_start);
            self.integrate_measurement(last.accel, last.gyro, t_end - lo);
        }
    }

    pub fn set_new_bias(&mut self, bias: ImuBias) {
        self.updated_bias = bias;
    }

    fn bias_delta(&self, b: &ImuBias) -> (Vector3<f64>, Vector3<f64>) {
        (b.gyro - self.bias.gyro, b.accel - self.bias.accel)
    }

    pub fn delta_rotation(&self, b: &ImuBias) -> Matrix3<f64> {
        let (dbg, _) = self.bias_delta(b);
        so3::normalize_rotation(&(self.d_r * so3::exp(&(self.j_rg * dbg))))
    }

    pub fn delta_velocity(&self, b: &ImuBias) -> Vector3<f64> {
        let (dbg, dba) = self.bias_delta(b);
        self.d_v + self.j_vg * dbg + self.j_va * dba
    }

    pub fn delta_position(&self, b: &ImuBias) -> Vector3<f64> {
        let (dbg, dba) = self.bias_delta(b);
        self.d_p + self.j_pg * dbg + self.j_pa * dba
    }

    pub fn updated_delta_rotation(&self) -> Matrix3<f64> {
        self.delta_rotation(&self.updated_bias)
    }

    pub fn updated_delta_velocity(&self) -> Vector3<f64> {
        self.delta_velocity(&self.updated_bias)
    }

    pub fn updated_delta_position(&self) -> Vector3<f64> {
        self.delta_position(&self.updated_bias)
    }

    /// Integrate again from the raw measurements with the updated bias.
    pub fn reintegrate(&mut self) {
        let bias = self.updated_bias;
        self.reset_deltas(bias);
        let measurements = std::mem::take(&mut self.measurements);
        for m in &measurements {
            self.integrate_step(m.accel, m.gyro, m.dt);
        }
        self.measurements = measurements;
    }

    /// Prepend the interval covered by `previous`, used when the keyframe
    /// between the two is culled.
    pub fn merge_previous(&mut self, previous: &Preintegrated) {
        let bias = self.updated_bias;
        let mut measurements = previous.measurements.clone();
        measurements.append(&mut self.measurements);
        self.reset_deltas(bias);
        for m in &measurements {
            self.integrate_step(m.accel, m.gyro, m.dt);
        }
        self.measurements = measurements;
    }

    /// Propagate a body state through this interval.
    pub fn predict(&self, start: &NavState, bias: &ImuBias) -> NavState {
        let dt = self.d_t;
        NavState {
            r_wb: so3::normalize_rotation(&(start.r_wb * self.delta_rotation(bias))),
            p_wb: start.p_wb + start.v_wb * dt + 0.5 * GRAVITY * dt * dt + start.r_wb * self.delta_position(bias),
            v_wb: start.v_wb + GRAVITY * dt + start.r_wb * self.delta_velocity(bias),
        }
    }

    /// Information of the `[δθ, δv, δp]` block, regularized for inversion.
    pub fn information9(&self) -> Matrix9 {
        let c = self.covariance.fixed_view::<9, 9>(0, 0).into_owned() + Matrix9::identity() * 1e-12;
        c.try_inverse().unwrap_or_else(Matrix9::identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imu::GRAVITY_MAGNITUDE;
    use approx::assert_relative_eq;

    fn constant_samples(accel: Vector3<f64>, gyro: Vector3<f64>, t0: f64, t1: f64, rate: f64) -> Vec<ImuSample> {
        let n = ((t1 - t0) * rate).round() as usize;
        (1..=n)
            .map(|i| ImuSample {
                timestamp: t0 + i as f64 / rate,
                accel,
                gyro,
            })
            .collect()
    }

    #[test]
    fn test_static_body_matches_gravity() {
        let calib = ImuCalib::default();
        let mut pre = Preintegrated::new(ImuBias::zero(), &calib);
        let up = Vector3::new(0.0, 0.0, GRAVITY_MAGNITUDE);
        let samples = constant_samples(up, Vector3::zeros(), 0.0, 1.0, 200.0);
        pre.integrate_window(Some(&ImuSample { timestamp: 0.0, accel: up, gyro: Vector3::zeros() }), &samples, 0.0, 1.0);
        assert_relative_eq!(pre.d_t, 1.0, epsilon = 1e-9);

        let start = NavState {
            r_wb: Matrix3::identity(),
            p_wb: Vector3::zeros(),
            v_wb: Vector3::zeros(),
        };
        let end = pre.predict(&start, &ImuBias::zero());
        assert_relative_eq!(end.p_wb, Vector3::zeros(), epsilon = 1e-9);
        assert_relative_eq!(end.v_wb, Vector3::zeros(), epsilon = 1e-9);
        assert!(pre.covariance[(0, 0)] > 0.0);
    }

    #[test]
    fn test_constant_rotation_rate() {
        let calib = ImuCalib::default();
        let mut pre = Preintegrated::new(ImuBias::zero(), &calib);
        let gyro = Vector3::new(0.0, 0.0, 0.5);
        for _ in 0..100 {
            pre.integrate_measurement(Vector3::zeros(), gyro, 0.01);
        }
        let angle = so3::log(&pre.updated_delta_rotation());
        assert_relative_eq!(angle.z, 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_bias_correction_matches_reintegration() {
        let calib = ImuCalib::default();
        let mut pre = Preintegrated::new(ImuBias::zero(), &calib);
        for i in 0..50 {
            let t = i as f64 * 0.005;
            pre.integrate_measurement(
                Vector3::new(0.3 * t.sin(), 0.1, GRAVITY_MAGNITUDE),
                Vector3::new(0.05, -0.02, 0.2 * t.cos()),
                0.005,
            );
        }
        let new_bias = ImuBias::new(Vector3::new(1e-3, -2e-3, 5e-4), Vector3::new(0.02, -0.01, 0.03));
        pre.set_new_bias(new_bias);
        let dv = pre.updated_delta_velocity();
        let dp = pre.updated_delta_position();
        let dr = pre.updated_delta_rotation();

        pre.reintegrate();
        assert_eq!(pre.bias(), new_bias);
        assert_relative_eq!(pre.updated_delta_velocity(), dv, epsilon = 1e-5);
        assert_relative_eq!(pre.updated_delta_position(), dp, epsilon = 1e-6);
        assert_relative_eq!(pre.updated_delta_rotation(), dr, epsilon = 1e-6);
    }

    #[test]
    fn test_merge_previous_equals_joint_integration() {
        let calib = ImuCalib::default();
        let accel = Vector3::new(0.2, 0.0, GRAVITY_MAGNITUDE);
        let gyro = Vector3::new(0.0, 0.1, 0.0);

        let mut joint = Preintegrated::new(ImuBias::zero(), &calib);
        let mut first = Preintegrated::new(ImuBias::zero(), &calib);
        let mut second = Preintegrated::new(ImuBias::zero(), &calib);
        for i in 0..40 {
            joint.integrate_measurement(accel, gyro, 0.005);
            if i < 20 {
                first.integrate_measurement(accel, gyro, 0.005);
            } else {
                second.integrate_measurement(accel, gyro, 0.005);
            }
        }
        second.merge_previous(&first);
        assert_relative_eq!(second.d_t, joint.d_t, epsilon = 1e-12);
        assert_relative_eq!(second.updated_delta_position(), joint.updated_delta_position(), epsilon = 1e-12);
        assert_relative_eq!(second.covariance, joint.covariance, epsilon = 1e-15);
    }

    #[test]
    fn test_window_clips_to_frame_boundaries() {
        let calib = ImuCalib::default();
        let mut pre = Preintegrated::new(ImuBias::zero(), &calib);
        let samples = constant_samples(Vector3::zeros(), Vector3::zeros(), 0.0, 0.1, 200.0);
        pre.integrate_window(None, &samples, 0.012, 0.093);
        assert_relative_eq!(pre.d_t, 0.093 - 0.012, epsilon = 1e-12);
    }
}
