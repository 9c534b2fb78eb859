use nalgebra::Vector3;

use crate::error::{Result, SlamError};

/// Gravity magnitude (m/s²).
pub const GRAVITY_MAGNITUDE: f64 = 9.81;

/// Gravity vector in the gravity-aligned world frame.
pub const GRAVITY: Vector3<f64> = Vector3::new(0.0, 0.0, -GRAVITY_MAGNITUDE);

/// Single IMU measurement in the body frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    pub timestamp: f64,
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
}

impl ImuSample {
    pub fn new(ax: f64, ay: f64, az: f64, wx: f64, wy: f64, wz: f64, timestamp: f64) -> Self {
        Self {
            timestamp,
            accel: Vector3::new(ax, ay, az),
            gyro: Vector3::new(wx, wy, wz),
        }
    }

    /// Linear interpolation towards `other` at time `t`.
    pub fn interpolate(&self, other: &ImuSample, t: f64) -> ImuSample {
        let span = other.timestamp - self.timestamp;
        if span <= 0.0 {
            return *self;
        }
        let a = ((t - self.timestamp) / span).clamp(0.0, 1.0);
        ImuSample {
            timestamp: t,
            accel: self.accel + (other.accel - self.accel) * a,
            gyro: self.gyro + (other.gyro - self.gyro) * a,
        }
    }
}

/// Check an IMU batch for the interval `(prev_ts, ts]`.
///
/// Samples must be finite and strictly increasing in time. A batch may only be
/// empty for the first frame of a session (`prev_ts == None`).
pub fn validate_batch(samples: &[ImuSample], prev_ts: Option<f64>, ts: f64) -> Result<()> {
    if samples.is_empty() {
        return match prev_ts {
            None => Ok(()),
            Some(_) => Err(SlamError::invalid_input("empty IMU batch in an inertial mode")),
        };
    }
    for s in samples {
        let finite = s.timestamp.is_finite()
            && s.accel.iter().chain(s.gyro.iter()).all(|v| v.is_finite());
        if !finite {
            return Err(SlamError::invalid_input("IMU sample with non-finite values"));
        }
    }
    if samples.windows(2).any(|w| w[1].timestamp <= w[0].timestamp) {
        return Err(SlamError::invalid_input("IMU timestamps are not strictly increasing"));
    }
    let first = samples[0].timestamp;
    let last = samples[samples.len() - 1].timestamp;
    if last > ts {
        return Err(SlamError::invalid_input(format!(
            "IMU sample at {last:.6} is later than the frame at {ts:.6}"
        )));
    }
    if let Some(prev) = prev_ts {
        if first <= prev {
            return Err(SlamError::invalid_input(format!(
                "IMU sample at {first:.6} is not after the previous frame at {prev:.6}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn at(t: f64) -> ImuSample {
        ImuSample::new(0.0, 0.0, GRAVITY_MAGNITUDE, 0.0, 0.0, 0.1, t)
    }

    #[test]
    fn test_validate_batch() {
        assert!(validate_batch(&[], None, 1.0).is_ok());
        assert!(validate_batch(&[], Some(0.5), 1.0).is_err());
        assert!(validate_batch(&[at(0.6), at(0.8), at(1.0)], Some(0.5), 1.0).is_ok());
        // Out of order.
        assert!(validate_batch(&[at(0.8), at(0.7)], Some(0.5), 1.0).is_err());
        // Outside (prev, ts].
        assert!(validate_batch(&[at(0.5), at(0.7)], Some(0.5), 1.0).is_err());
        assert!(validate_batch(&[at(0.7), at(1.1)], Some(0.5), 1.0).is_err());
    }

    #[test]
    fn test_interpolate() {
        let a = ImuSample::new(0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0);
        let b = ImuSample::new(2.0, 0.0, 0.0, 0.0, 0.0, 4.0, 1.0);
        let m = a.interpolate(&b, 0.25);
        assert_relative_eq!(m.accel.x, 0.5);
        assert_relative_eq!(m.gyro.z, 1.0);
        assert_relative_eq!(m.timestamp, 0.25);
    }
}
