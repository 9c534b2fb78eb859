//! Keypoints, binary descriptors and the feature-extractor seam.
//!
//! The engine only depends on the [`FeatureExtractor`] contract: one image in,
//! keypoints with 256-bit descriptors out. [`OrbExtractor`] is the built-in
//! implementation; callers can plug in their own through
//! `SlamSystem::with_extractor`.

pub mod orb;

use image::GrayImage;

use crate::config::ExtractorConfig;

pub use orb::OrbExtractor;

/// 256-bit binary descriptor.
pub type Descriptor = [u8; 32];

/// Hamming distance between two descriptors.
#[inline]
pub fn hamming_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// A detected keypoint in level-0 pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    pub x: f64,
    pub y: f64,
    /// Orientation in radians.
    pub angle: f64,
    /// Pyramid level the keypoint was detected at.
    pub octave: u32,
    pub response: f64,
}

impl KeyPoint {
    pub fn new(x: f64, y: f64, octave: u32) -> Self {
        Self {
            x,
            y,
            angle: 0.0,
            octave,
            response: 0.0,
        }
    }
}

/// Keypoints and descriptors for one image, index-aligned.
#[derive(Debug, Clone, Default)]
pub struct Features {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
}

impl Features {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// Turns an image into keypoints with descriptors.
pub trait FeatureExtractor: Send {
    fn extract(&mut self, image: &GrayImage) -> Features;
}

/// Per-level scale factors and keypoint uncertainties.
#[derive(Debug, Clone)]
pub struct ScalePyramid {
    pub scale_factor: f64,
    pub log_scale_factor: f64,
    pub n_levels: u32,
    pub scale_factors: Vec<f64>,
    pub inv_scale_factors: Vec<f64>,
    pub level_sigma2: Vec<f64>,
    pub inv_level_sigma2: Vec<f64>,
}

impl ScalePyramid {
    pub fn new(scale_factor: f64, n_levels: u32) -> Self {
        let scale_factors: Vec<f64> = (0..n_levels).map(|l| scale_factor.powi(l as i32)).collect();
        let level_sigma2: Vec<f64> = scale_factors.iter().map(|s| s * s).collect();
        Self {
            scale_factor,
            log_scale_factor: scale_factor.ln(),
            n_levels,
            inv_scale_factors: scale_factors.iter().map(|s| 1.0 / s).collect(),
            inv_level_sigma2: level_sigma2.iter().map(|s| 1.0 / s).collect(),
            scale_factors,
            level_sigma2,
        }
    }

    pub fn from_config(config: &ExtractorConfig) -> Self {
        Self::new(config.scale_factor, config.n_levels)
    }

    pub fn scale(&self, octave: u32) -> f64 {
        self.scale_factors[(octave as usize).min(self.scale_factors.len() - 1)]
    }

    pub fn sigma2(&self, octave: u32) -> f64 {
        self.level_sigma2[(octave as usize).min(self.level_sigma2.len() - 1)]
    }

    pub fn inv_sigma2(&self, octave: u32) -> f64 {
        self.inv_level_sigma2[(octave as usize).min(self.inv_level_sigma2.len() - 1)]
    }

    /// Level at which a point with observation distance range `max_distance`
    /// would be detected when seen from `distance`.
    pub fn predict_level(&self, max_distance: f64, distance: f64) -> u32 {
        let ratio = max_distance / distance;
        let level = (ratio.ln() / self.log_scale_factor).ceil();
        if !level.is_finite() || level < 0.0 {
            0
        } else {
            (level as u32).min(self.n_levels - 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_hamming_distance() {
        let a = [0u8; 32];
        let mut b = [0u8; 32];
        assert_eq!(hamming_distance(&a, &b), 0);
        b[0] = 0b1011;
        b[31] = 0xFF;
        assert_eq!(hamming_distance(&a, &b), 11);
    }

    #[test]
    fn test_scale_pyramid() {
        let p = ScalePyramid::new(1.2, 8);
        assert_relative_eq!(p.scale(0), 1.0);
        assert_relative_eq!(p.scale(2), 1.44, epsilon = 1e-12);
        assert_relative_eq!(p.sigma2(1) * p.inv_sigma2(1), 1.0, epsilon = 1e-12);
        assert_eq!(p.scale(20), p.scale(7));
    }

    #[test]
    fn test_predict_level() {
        let p = ScalePyramid::new(1.2, 8);
        // Seen from max distance the point sits at the finest level.
        assert_eq!(p.predict_level(10.0, 10.0), 0);
        assert_eq!(p.predict_level(10.0, 10.0 / 1.3), 2);
        assert_eq!(p.predict_level(10.0, 0.01), 7);
    }
}
