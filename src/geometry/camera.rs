//! Pinhole camera with radial-tangential distortion.

use nalgebra::{Vector2, Vector3};

use crate::config::CameraConfig;

#[derive(Debug, Clone)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub inv_fx: f64,
    pub inv_fy: f64,
    pub width: u32,
    pub height: u32,
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    /// Baseline times fx (pixels · meters). Zero for monocular.
    pub bf: f64,
    pub baseline: f64,
    /// Points closer than this are "close" and trusted from a single view.
    pub th_depth: f64,
}

impl CameraModel {
    pub fn from_config(config: &CameraConfig) -> Self {
        let baseline = config.baseline.unwrap_or(0.0);
        Self {
            fx: config.fx,
            fy: config.fy,
            cx: config.cx,
            cy: config.cy,
            inv_fx: 1.0 / config.fx,
            inv_fy: 1.0 / config.fy,
            width: config.width,
            height: config.height,
            k1: config.k1,
            k2: config.k2,
            p1: config.p1,
            p2: config.p2,
            bf: baseline * config.fx,
            baseline,
            th_depth: baseline * config.th_depth,
        }
    }

    pub fn pinhole(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self::from_config(&CameraConfig {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
            ..CameraConfig::default()
        })
    }

    fn is_distorted(&self) -> bool {
        self.k1 != 0.0 || self.k2 != 0.0 || self.p1 != 0.0 || self.p2 != 0.0
    }

    /// Project a camera-frame point. No bounds check.
    #[inline]
    pub fn project(&self, p: &Vector3<f64>) -> Vector2<f64> {
        let inv_z = 1.0 / p.z;
        Vector2::new(self.fx * p.x * inv_z + self.cx, self.fy * p.y * inv_z + self.cy)
    }

    /// Right-image horizontal coordinate of a camera-frame point.
    #[inline]
    pub fn project_right_u(&self, p: &Vector3<f64>) -> f64 {
        self.fx * p.x / p.z + self.cx - self.bf / p.z
    }

    /// Project and keep only points in front of the camera and inside the image.
    pub fn project_checked(&self, p: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p.z <= 0.0 {
            return None;
        }
        let uv = self.project(p);
        self.is_in_image(uv.x, uv.y).then_some(uv)
    }

    pub fn is_in_image(&self, u: f64, v: f64) -> bool {
        u >= 0.0 && v >= 0.0 && u < self.width as f64 && v < self.height as f64
    }

    /// Bearing on the normalized plane (z = 1) for an undistorted pixel.
    #[inline]
    pub fn unproject(&self, u: f64, v: f64) -> Vector3<f64> {
        Vector3::new((u - self.cx) * self.inv_fx, (v - self.cy) * self.inv_fy, 1.0)
    }

    /// Remove lens distortion from a raw pixel.
    ///
    /// Fixed-point inversion of the radial-tangential model; converges in a
    /// handful of iterations for the distortion levels seen in practice.
    pub fn undistort_point(&self, u: f64, v: f64) -> (f64, f64) {
        if !self.is_distorted() {
            return (u, v);
        }
        let xd = (u - self.cx) * self.inv_fx;
        let yd = (v - self.cy) * self.inv_fy;
        let (mut x, mut y) = (xd, yd);
        for _ in 0..8 {
            let r2 = x * x + y * y;
            let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2;
            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            x = (xd - dx) / radial;
            y = (yd - dy) / radial;
        }
        (x * self.fx + self.cx, y * self.fy + self.cy)
    }

    /// Apply lens distortion to an ideal pixel.
    pub fn distort_point(&self, u: f64, v: f64) -> (f64, f64) {
        let x = (u - self.cx) * self.inv_fx;
        let y = (v - self.cy) * self.inv_fy;
        let r2 = x * x + y * y;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2;
        let xd = x * radial + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        (xd * self.fx + self.cx, yd * self.fy + self.cy)
    }

    /// Bounds of the undistorted image, used to size the feature grid.
    pub fn undistorted_bounds(&self) -> (f64, f64, f64, f64) {
        if !self.is_distorted() {
            return (0.0, self.width as f64, 0.0, self.height as f64);
        }
        let (w, h) = (self.width as f64, self.height as f64);
        let corners = [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h)].map(|(u, v)| self.undistort_point(u, v));
        let min_x = corners[0].0.min(corners[2].0);
        let max_x = corners[1].0.max(corners[3].0);
        let min_y = corners[0].1.min(corners[1].1);
        let max_y = corners[2].1.max(corners[3].1);
        (min_x, max_x, min_y, max_y)
    }
}
