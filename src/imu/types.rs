//! Bias and calibration types shared by preintegration and the optimizers.

use nalgebra::{SMatrix, Vector3, Vector6};

use crate::config::ImuConfig;
use crate::geometry::SE3;

/// 6x6 noise covariance `[gyro, accel]`.
pub type Matrix6 = SMatrix<f64, 6, 6>;

/// 9x9 covariance of `[δθ, δv, δp]`.
pub type Matrix9 = SMatrix<f64, 9, 9>;

/// 15x15 covariance of `[δθ, δv, δp, δbg, δba]`.
pub type Matrix15 = SMatrix<f64, 15, 15>;

/// Gyroscope and accelerometer biases.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuBias {
    pub gyro: Vector3<f64>,
    pub accel: Vector3<f64>,
}

impl ImuBias {
    pub fn zero() -> Self {
        Self {
            gyro: Vector3::zeros(),
            accel: Vector3::zeros(),
        }
    }

    pub fn new(gyro: Vector3<f64>, accel: Vector3<f64>) -> Self {
        Self { gyro, accel }
    }

    /// `[bg, ba]`
    pub fn to_vector(&self) -> Vector6<f64> {
        Vector6::new(
            self.gyro.x,
            self.gyro.y,
            self.gyro.z,
            self.accel.x,
            self.accel.y,
            self.accel.z,
        )
    }

    pub fn is_finite(&self) -> bool {
        self.gyro.iter().chain(self.accel.iter()).all(|v| v.is_finite())
    }
}

impl Default for ImuBias {
    fn default() -> Self {
        Self::zero()
    }
}

/// Discrete-time IMU calibration.
#[derive(Debug, Clone)]
pub struct ImuCalib {
    /// Camera-to-body transform.
    pub t_bc: SE3,
    /// Body-to-camera transform.
    pub t_cb: SE3,
    /// Measurement noise per sample.
    pub cov_noise: Matrix6,
    /// Bias random walk per second.
    pub cov_walk: Matrix6,
}

impl ImuCalib {
    /// Continuous densities become per-sample sigmas through the sensor rate.
    pub fn from_config(config: &ImuConfig) -> Self {
        let sf = config.frequency.sqrt();
        let ng = config.noise_gyro * sf;
        let na = config.noise_acc * sf;
        let ngw = config.gyro_walk / sf;
        let naw = config.acc_walk / sf;
        let t_bc = SE3::from_matrix(&config.t_body_camera_matrix());
        Self {
            t_cb: t_bc.inverse(),
            t_bc,
            cov_noise: Matrix6::from_diagonal(&Vector6::new(
                ng * ng,
                ng * ng,
                ng * ng,
                na * na,
                na * na,
                na * na,
            )),
            cov_walk: Matrix6::from_diagonal(&Vector6::new(
                ngw * ngw,
                ngw * ngw,
                ngw * ngw,
                naw * naw,
                naw * naw,
                naw * naw,
            )),
        }
    }
}

impl Default for ImuCalib {
    fn default() -> Self {
        Self::from_config(&ImuConfig::default())
    }
}
