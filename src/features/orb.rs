//! Built-in ORB-style extractor.
//!
//! Per pyramid level:
//! 1. FAST-9 corners (imageproc) with the initial threshold, falling back to
//!    the minimum threshold in cells that come up empty.
//! 2. 3x3 non-maximum suppression on the FAST score.
//! 3. Bucketing over a cell grid so the budget is spread across the image.
//! 4. Intensity-centroid orientation and a steered BRIEF descriptor on a
//!    Gaussian-blurred copy of the level.

use image::imageops::{self, FilterType};
use image::GrayImage;
use imageproc::corners::{corners_fast9, Corner};
use imageproc::filter::gaussian_blur_f32;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{Descriptor, FeatureExtractor, Features, KeyPoint};
use crate::config::ExtractorConfig;

const EDGE_THRESHOLD: i32 = 19;
const HALF_PATCH: i32 = 15;
const CELL_SIZE: u32 = 30;
const PATTERN_SEED: u64 = 0x0_5eed_b41e;

pub struct OrbExtractor {
    config: ExtractorConfig,
    features_per_level: Vec<usize>,
    pattern: Vec<[(i32, i32); 2]>,
    /// Half-width of the centroid disc per row offset.
    umax: Vec<i32>,
}

impl OrbExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        let n_levels = config.n_levels.max(1) as usize;
        let inv = 1.0 / config.scale_factor;
        let first = config.n_features as f64 * (1.0 - inv) / (1.0 - inv.powi(n_levels as i32));
        let mut features_per_level = Vec::with_capacity(n_levels);
        let mut assigned = 0;
        let mut desired = first;
        for _ in 0..n_levels.saturating_sub(1) {
            let n = desired.round() as usize;
            features_per_level.push(n);
            assigned += n;
            desired *= inv;
        }
        features_per_level.push(config.n_features.saturating_sub(assigned));

        // Sampling pairs inside the 31x31 patch, Gaussian-like around the center.
        let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
        let draw = |rng: &mut StdRng| -> (i32, i32) {
            let sample = |rng: &mut StdRng| {
                let s: f64 = (0..4).map(|_| rng.gen_range(-1.0..1.0)).sum::<f64>() * 6.0;
                (s.round() as i32).clamp(-13, 13)
            };
            (sample(rng), sample(rng))
        };
        let pattern = (0..256).map(|_| [draw(&mut rng), draw(&mut rng)]).collect();

        let umax = (0..=HALF_PATCH)
            .map(|v| {
                let r2 = (HALF_PATCH * HALF_PATCH - v * v) as f64;
                r2.sqrt().round() as i32
            })
            .collect();

        Self {
            config,
            features_per_level,
            pattern,
            umax,
        }
    }

    fn build_pyramid(&self, image: &GrayImage) -> Vec<GrayImage> {
        let mut levels = vec![image.clone()];
        for l in 1..self.config.n_levels {
            let s = self.config.scale_factor.powi(l as i32);
            let w = (image.width() as f64 / s).round() as u32;
            let h = (image.height() as f64 / s).round() as u32;
            if w < (2 * EDGE_THRESHOLD) as u32 || h < (2 * EDGE_THRESHOLD) as u32 {
                break;
            }
            levels.push(imageops::resize(image, w, h, FilterType::Triangle));
        }
        levels
    }

    fn detect_level(&self, img: &GrayImage, budget: usize) -> Vec<(i32, i32, f64)> {
        let (w, h) = (img.width() as i32, img.height() as i32);
        if w <= 2 * EDGE_THRESHOLD || h <= 2 * EDGE_THRESHOLD || budget == 0 {
            return Vec::new();
        }
        let (x0, y0) = (EDGE_THRESHOLD - 3, EDGE_THRESHOLD - 3);
        let (x1, y1) = (w - EDGE_THRESHOLD + 3, h - EDGE_THRESHOLD + 3);
        let cw = (x1 - x0) as usize;
        let chh = (y1 - y0) as usize;

        // FAST-9 response per pixel of the detection window, offset by one so
        // zero means "no corner".
        let mut scores = vec![0i16; cw * chh];
        let cells_x = ((x1 - x0) as u32).div_ceil(CELL_SIZE) as usize;
        let cells_y = ((y1 - y0) as u32).div_ceil(CELL_SIZE) as usize;
        let cell_of = |x: i32, y: i32| {
            ((y - y0) as u32 / CELL_SIZE) as usize * cells_x + ((x - x0) as u32 / CELL_SIZE) as usize
        };
        let in_window = |c: &Corner| {
            let (x, y) = (c.x as i32, c.y as i32);
            x >= x0 && x < x1 && y >= y0 && y < y1
        };

        let mut cell_found = vec![false; cells_x * cells_y];
        for c in corners_fast9(img, self.config.ini_th_fast).iter().filter(|&c| in_window(c)) {
            let (x, y) = (c.x as i32, c.y as i32);
            scores[(y - y0) as usize * cw + (x - x0) as usize] = c.score as i16 + 1;
            cell_found[cell_of(x, y)] = true;
        }
        // Cells that stay empty retry with the lower threshold.
        if cell_found.iter().any(|f| !f) && self.config.min_th_fast < self.config.ini_th_fast {
            for c in corners_fast9(img, self.config.min_th_fast).iter().filter(|&c| in_window(c)) {
                let (x, y) = (c.x as i32, c.y as i32);
                if !cell_found[cell_of(x, y)] {
                    scores[(y - y0) as usize * cw + (x - x0) as usize] = c.score as i16 + 1;
                }
            }
        }

        // Non-maximum suppression, then bucket by cell.
        let mut buckets: Vec<Vec<(i32, i32, f64)>> = vec![Vec::new(); cells_x * cells_y];
        for yy in 1..chh.saturating_sub(1) {
            for xx in 1..cw.saturating_sub(1) {
                let s = scores[yy * cw + xx];
                if s == 0 {
                    continue;
                }
                let is_max = (-1i32..=1).all(|dy| {
                    (-1i32..=1).all(|dx| {
                        (dx == 0 && dy == 0)
                            || scores[(yy as i32 + dy) as usize * cw + (xx as i32 + dx) as usize] <= s
                    })
                });
                if is_max {
                    let cell = (yy / CELL_SIZE as usize) * cells_x + xx / CELL_SIZE as usize;
                    buckets[cell].push((xx as i32 + x0, yy as i32 + y0, s as f64));
                }
            }
        }
        for b in buckets.iter_mut() {
            b.sort_by(|a, b| b.2.total_cmp(&a.2));
        }

        let mut out = Vec::with_capacity(budget);
        let mut rank = 0;
        loop {
            let mut added = false;
            for b in &buckets {
                if let Some(&kp) = b.get(rank) {
                    out.push(kp);
                    added = true;
                    if out.len() == budget {
                        return out;
                    }
                }
            }
            if !added {
                return out;
            }
            rank += 1;
        }
    }

    fn orientation(&self, img: &GrayImage, x: i32, y: i32) -> f64 {
        let px = |u: i32, v: i32| img.get_pixel((x + u) as u32, (y + v) as u32).0[0] as f64;
        let mut m01 = 0.0;
        let mut m10 = 0.0;
        for u in -HALF_PATCH..=HALF_PATCH {
            m10 += u as f64 * px(u, 0);
        }
        for v in 1..=HALF_PATCH {
            let d = self.umax[v as usize];
            for u in -d..=d {
                let (top, bottom) = (px(u, -v), px(u, v));
                m10 += u as f64 * (top + bottom);
                m01 += v as f64 * (bottom - top);
            }
        }
        m01.atan2(m10)
    }

    fn describe(&self, blurred: &GrayImage, x: i32, y: i32, angle: f64) -> Descriptor {
        let (s, c) = angle.sin_cos();
        let (w, h) = (blurred.width() as i32, blurred.height() as i32);
        let sample = |(px, py): (i32, i32)| -> u8 {
            let rx = (c * px as f64 - s * py as f64).round() as i32;
            let ry = (s * px as f64 + c * py as f64).round() as i32;
            let u = (x + rx).clamp(0, w - 1);
            let v = (y + ry).clamp(0, h - 1);
            blurred.get_pixel(u as u32, v as u32).0[0]
        };
        let mut desc = [0u8; 32];
        for (bit, pair) in self.pattern.iter().enumerate() {
            if sample(pair[0]) < sample(pair[1]) {
                desc[bit / 8] |= 1 << (bit % 8);
            }
        }
        desc
    }
}

impl FeatureExtractor for OrbExtractor {
    fn extract(&mut self, image: &GrayImage) -> Features {
        let mut features = Features::default();
        for (level, img) in self.build_pyramid(image).iter().enumerate() {
            let budget = self.features_per_level.get(level).copied().unwrap_or(0);
            let corners = self.detect_level(img, budget);
            if corners.is_empty() {
                continue;
            }
            let blurred = gaussian_blur_f32(img, 2.0);
            let scale = self.config.scale_factor.powi(level as i32);
            for (x, y, response) in corners {
                let angle = self.orientation(img, x, y);
                features.descriptors.push(self.describe(&blurred, x, y, angle));
                features.keypoints.push(KeyPoint {
                    x: x as f64 * scale,
                    y: y as f64 * scale,
                    angle,
                    octave: level as u32,
                    response,
                });
            }
        }
        features
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    /// Bright squares on a dark background; every square corner is a FAST corner.
    fn blocks(w: u32, h: u32, period: u32, contrast: u8) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            if x % period < period / 2 && y % period < period / 2 {
                Luma([60 + contrast])
            } else {
                Luma([60])
            }
        })
    }

    #[test]
    fn test_blank_image_has_no_features() {
        let mut ex = OrbExtractor::new(ExtractorConfig::default());
        let img = GrayImage::from_pixel(320, 240, Luma([128]));
        assert!(ex.extract(&img).is_empty());
    }

    #[test]
    fn test_textured_image_respects_budget() {
        let config = ExtractorConfig {
            n_features: 300,
            ..ExtractorConfig::default()
        };
        let mut ex = OrbExtractor::new(config);
        let f = ex.extract(&blocks(320, 240, 20, 120));
        assert!(!f.is_empty());
        assert!(f.len() <= 300);
        assert_eq!(f.keypoints.len(), f.descriptors.len());
        assert!(f.keypoints.iter().all(|k| k.x >= 0.0 && k.x < 320.0 && k.y >= 0.0 && k.y < 240.0));
    }

    #[test]
    fn test_weak_corners_use_low_threshold() {
        let img = blocks(320, 240, 20, 12);
        let mut ex = OrbExtractor::new(ExtractorConfig::default());
        assert!(!ex.extract(&img).is_empty());

        let strict = ExtractorConfig {
            min_th_fast: 20,
            ..ExtractorConfig::default()
        };
        assert!(OrbExtractor::new(strict).extract(&img).is_empty());
    }

    #[test]
    fn test_level_budget_sums_to_total() {
        let ex = OrbExtractor::new(ExtractorConfig::default());
        assert_eq!(ex.features_per_level.iter().sum::<usize>(), 1000);
    }

    #[test]
    fn test_deterministic_descriptors() {
        let img = blocks(200, 160, 16, 120);
        let mut a = OrbExtractor::new(ExtractorConfig::default());
        let mut b = OrbExtractor::new(ExtractorConfig::default());
        assert_eq!(a.extract(&img).descriptors, b.extract(&img).descriptors);
    }
}
