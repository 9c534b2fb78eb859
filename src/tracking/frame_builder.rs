//! Frame construction: validation, extraction, depth association and IMU
//! preintegration.
//!
//! Nothing here touches the map. A sample is validated completely before any
//! builder state changes, so a rejected sample leaves the engine untouched.

use image::{GrayImage, ImageBuffer, Luma};
use tracing::debug;

use crate::config::{SensorMode, SlamConfig};
use crate::error::{Result, SlamError};
use crate::features::{hamming_distance, FeatureExtractor, Features, ScalePyramid};
use crate::geometry::CameraModel;
use crate::imu::{validate_batch, ImuBias, ImuCalib, ImuSample, Preintegrated};
use crate::tracking::frame::{Frame, FrameFeatures};
use crate::tracking::matcher::{TH_HIGH, TH_LOW};

/// 16-bit depth image, as delivered by RGB-D sensors.
pub type DepthImage = ImageBuffer<Luma<u16>, Vec<u16>>;

/// Half window of the SAD patch.
const SAD_HALF_WINDOW: i64 = 5;
/// Horizontal shifts tried around the descriptor match.
const SAD_SEARCH: i64 = 5;

/// One camera sample.
#[derive(Debug, Clone, Copy)]
pub enum SensorInput<'a> {
    Monocular { image: &'a GrayImage },
    Stereo { left: &'a GrayImage, right: &'a GrayImage },
    Rgbd { image: &'a GrayImage, depth: &'a DepthImage },
}

impl SensorInput<'_> {
    fn name(&self) -> &'static str {
        match self {
            SensorInput::Monocular { .. } => "monocular",
            SensorInput::Stereo { .. } => "stereo",
            SensorInput::Rgbd { .. } => "rgbd",
        }
    }

    fn matches(&self, sensor: SensorMode) -> bool {
        match self {
            SensorInput::Monocular { .. } => sensor.is_monocular(),
            SensorInput::Stereo { .. } => sensor.is_stereo(),
            SensorInput::Rgbd { .. } => sensor.is_rgbd(),
        }
    }
}

/// Builds [`Frame`]s from raw sensor samples.
pub struct FrameBuilder {
    sensor: SensorMode,
    camera: CameraModel,
    pyramid: ScalePyramid,
    depth_map_factor: f64,
    imu_calib: Option<ImuCalib>,
    extractor: Box<dyn FeatureExtractor>,

    next_id: u64,
    last_timestamp: Option<f64>,
    /// Last IMU sample, carried into the next interval.
    last_imu: Option<ImuSample>,
}

impl FrameBuilder {
    pub fn new(config: &SlamConfig, extractor: Box<dyn FeatureExtractor>) -> Self {
        Self {
            sensor: config.sensor,
            camera: CameraModel::from_config(&config.camera),
            pyramid: ScalePyramid::from_config(&config.extractor),
            depth_map_factor: config.camera.depth_map_factor,
            imu_calib: config.sensor.is_inertial().then(|| ImuCalib::from_config(&config.imu)),
            extractor,
            next_id: 0,
            last_timestamp: None,
            last_imu: None,
        }
    }

    pub fn camera(&self) -> &CameraModel {
        &self.camera
    }

    pub fn pyramid(&self) -> &ScalePyramid {
        &self.pyramid
    }

    pub fn imu_calib(&self) -> Option<&ImuCalib> {
        self.imu_calib.as_ref()
    }

    pub fn last_timestamp(&self) -> Option<f64> {
        self.last_timestamp
    }

    /// Check a sample without changing any state.
    pub fn validate(&self, input: &SensorInput<'_>, timestamp: f64, imu: Option<&[ImuSample]>) -> Result<()> {
        if !input.matches(self.sensor) {
            return Err(SlamError::invalid_input(format!(
                "{} input in {:?} mode",
                input.name(),
                self.sensor
            )));
        }
        let (w, h) = (self.camera.width, self.camera.height);
        let check = |name: &str, dims: (u32, u32)| {
            if dims == (w, h) {
                Ok(())
            } else {
                Err(SlamError::invalid_input(format!(
                    "{name} image is {}x{}, expected {w}x{h}",
                    dims.0, dims.1
                )))
            }
        };
        match input {
            SensorInput::Monocular { image } => check("image", image.dimensions())?,
            SensorInput::Stereo { left, right } => {
                check("left", left.dimensions())?;
                check("right", right.dimensions())?;
            }
            SensorInput::Rgbd { image, depth } => {
                check("image", image.dimensions())?;
                check("depth", depth.dimensions())?;
            }
        }

        if !timestamp.is_finite() {
            return Err(SlamError::invalid_input("timestamp is not finite"));
        }
        if let Some(prev) = self.last_timestamp {
            if timestamp <= prev {
                return Err(SlamError::invalid_input(format!(
                    "timestamp {timestamp:.6} is not after the previous frame at {prev:.6}"
                )));
            }
        }

        match (self.sensor.is_inertial(), imu) {
            (true, Some(samples)) => validate_batch(samples, self.last_timestamp, timestamp),
            (true, None) => Err(SlamError::invalid_input("inertial mode needs IMU samples")),
            (false, Some(_)) => Err(SlamError::invalid_input(format!(
                "IMU samples passed in {:?} mode",
                self.sensor
            ))),
            (false, None) => Ok(()),
        }
    }

    /// Validate and build a frame. `bias` seeds the IMU preintegration.
    pub fn build(
        &mut self,
        input: SensorInput<'_>,
        timestamp: f64,
        imu: Option<&[ImuSample]>,
        bias: ImuBias,
    ) -> Result<Frame> {
        self.validate(&input, timestamp, imu)?;

        let features = match input {
            SensorInput::Monocular { image } => FrameFeatures::new(self.extractor.extract(image), &self.camera),
            SensorInput::Stereo { left, right } => {
                let mut ff = FrameFeatures::new(self.extractor.extract(left), &self.camera);
                let right_features = self.extractor.extract(right);
                let n = compute_stereo_matches(&mut ff, &right_features, left, right, &self.camera, &self.pyramid);
                debug!("[FrameBuilder] {} stereo matches of {} features", n, ff.len());
                ff
            }
            SensorInput::Rgbd { image, depth } => {
                let mut ff = FrameFeatures::new(self.extractor.extract(image), &self.camera);
                compute_depth_from_image(&mut ff, depth, self.depth_map_factor, &self.camera);
                ff
            }
        };

        let mut frame = Frame::new(self.next_id, timestamp, features);
        frame.imu_bias = bias;
        if let (Some(calib), Some(samples), Some(prev)) = (self.imu_calib.as_ref(), imu, self.last_timestamp) {
            let mut pre = Preintegrated::new(bias, calib);
            pre.integrate_window(self.last_imu.as_ref(), samples, prev, timestamp);
            frame.preintegrated_frame = Some(pre);
        }
        if let Some(last) = imu.and_then(|s| s.last()) {
            self.last_imu = Some(*last);
        }
        self.next_id += 1;
        self.last_timestamp = Some(timestamp);
        Ok(frame)
    }

    /// Forget timing state; frame ids keep increasing.
    pub fn reset(&mut self) {
        self.last_timestamp = None;
        self.last_imu = None;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stereo
// ─────────────────────────────────────────────────────────────────────────────

/// Match left keypoints to right keypoints along image rows and fill
/// `u_right` and `depth`. Returns the number of matched features.
///
/// For each left keypoint the right keypoints on nearby rows within the
/// valid disparity range are compared by descriptor; the best one is then
/// refined by SAD block matching on the images with a parabola fit.
pub fn compute_stereo_matches(
    left: &mut FrameFeatures,
    right: &Features,
    left_image: &GrayImage,
    right_image: &GrayImage,
    camera: &CameraModel,
    pyramid: &ScalePyramid,
) -> usize {
    if camera.bf <= 0.0 || right.is_empty() {
        return 0;
    }
    let height = camera.height as usize;
    // Right keypoint indices per image row, widened by the keypoint scale.
    let mut rows: Vec<Vec<usize>> = vec![Vec::new(); height];
    for (i, kp) in right.keypoints.iter().enumerate() {
        let r = 2.0 * pyramid.scale(kp.octave);
        let lo = (kp.y - r).floor().max(0.0) as usize;
        let hi = ((kp.y + r).ceil() as usize).min(height.saturating_sub(1));
        for row in rows.iter_mut().take(hi + 1).skip(lo) {
            row.push(i);
        }
    }

    let th_orb = (TH_HIGH + TH_LOW) / 2;
    let min_d = 0.0;
    let max_d = camera.bf / camera.baseline.max(1e-6);

    let mut sad_scores: Vec<(usize, u32)> = Vec::new();
    for il in 0..left.len() {
        let kp = left.keypoints[il];
        if kp.y < 0.0 || kp.y as usize >= height {
            continue;
        }
        let (ul, vl) = (kp.x, kp.y);
        let min_u = ul - max_d;
        let max_u = ul - min_d;
        if max_u < 0.0 {
            continue;
        }
        let mut best = (u32::MAX, None);
        for &ir in &rows[vl as usize] {
            let rkp = &right.keypoints[ir];
            if rkp.octave + 1 < kp.octave || rkp.octave > kp.octave + 1 {
                continue;
            }
            if rkp.x < min_u || rkp.x > max_u {
                continue;
            }
            let d = hamming_distance(&left.descriptors[il], &right.descriptors[ir]);
            if d < best.0 {
                best = (d, Some(ir));
            }
        }
        let (dist, Some(ir)) = best else {
            continue;
        };
        if dist >= th_orb {
            continue;
        }
        let mut ur = right.keypoints[ir].x;
        let mut sad = 0;
        if kp.octave == 0 {
            match refine_with_sad(left_image, right_image, ul, vl, ur) {
                SadRefinement::Refined(u, score) => {
                    ur = u;
                    sad = score;
                }
                SadRefinement::Flat => {}
                SadRefinement::Rejected => continue,
            }
        }
        let mut disparity = ul - ur;
        if disparity < min_d || disparity >= max_d {
            continue;
        }
        if disparity <= 0.0 {
            disparity = 0.01;
            ur = ul - 0.01;
        }
        left.depth[il] = Some(camera.bf / disparity);
        left.u_right[il] = Some(ur);
        sad_scores.push((il, sad));
    }

    // Drop matches whose block distance is far above the median.
    let mut scores: Vec<u32> = sad_scores.iter().map(|(_, s)| *s).collect();
    scores.sort_unstable();
    if let Some(&median) = scores.get(scores.len() / 2) {
        let threshold = 1.5 * 1.4 * median as f64;
        for (il, s) in &sad_scores {
            if median > 0 && *s as f64 > threshold {
                left.depth[*il] = None;
                left.u_right[*il] = None;
            }
        }
    }
    left.depth.iter().filter(|d| d.is_some()).count()
}

enum SadRefinement {
    Refined(f64, u32),
    /// Textureless patch; keep the keypoint estimate.
    Flat,
    Rejected,
}

fn refine_with_sad(left: &GrayImage, right: &GrayImage, ul: f64, vl: f64, ur: f64) -> SadRefinement {
    let (w, h) = (left.width() as i64, left.height() as i64);
    let (cx, cy, cr) = (ul.round() as i64, vl.round() as i64, ur.round() as i64);
    let w2 = SAD_HALF_WINDOW;
    if cy - w2 < 0 || cy + w2 >= h || cx - w2 < 0 || cx + w2 >= w {
        return SadRefinement::Flat;
    }
    if cr - w2 - SAD_SEARCH < 0 || cr + w2 + SAD_SEARCH >= w {
        return SadRefinement::Flat;
    }
    let center = |img: &GrayImage, x: i64, y: i64| img.get_pixel(x as u32, y as u32).0[0] as i32;
    let ref_center = center(left, cx, cy);
    let sad = |shift: i64| -> u32 {
        let r_center = center(right, cr + shift, cy);
        let mut total = 0u32;
        for dy in -w2..=w2 {
            for dx in -w2..=w2 {
                let a = center(left, cx + dx, cy + dy) - ref_center;
                let b = center(right, cr + shift + dx, cy + dy) - r_center;
                total += (a - b).unsigned_abs();
            }
        }
        total
    };
    let dists: Vec<u32> = (-SAD_SEARCH..=SAD_SEARCH).map(sad).collect();
    if dists.iter().all(|d| *d == dists[0]) {
        return SadRefinement::Flat;
    }
    let (best_i, best) = dists
        .iter()
        .enumerate()
        .min_by_key(|(_, d)| **d)
        .map(|(i, d)| (i, *d))
        .unwrap_or((SAD_SEARCH as usize, 0));
    if best_i == 0 || best_i == dists.len() - 1 {
        return SadRefinement::Rejected;
    }
    let (d1, d2, d3) = (dists[best_i - 1] as f64, dists[best_i] as f64, dists[best_i + 1] as f64);
    let denom = 2.0 * (d1 + d3 - 2.0 * d2);
    if denom.abs() < 1e-9 {
        return SadRefinement::Rejected;
    }
    let delta = (d1 - d3) / denom;
    if !(-1.0..=1.0).contains(&delta) {
        return SadRefinement::Rejected;
    }
    let shift = best_i as i64 - SAD_SEARCH;
    SadRefinement::Refined((cr + shift) as f64 + delta, best)
}

// ─────────────────────────────────────────────────────────────────────────────
// RGB-D
// ─────────────────────────────────────────────────────────────────────────────

/// Read depth at each raw keypoint and synthesize a right coordinate.
pub fn compute_depth_from_image(features: &mut FrameFeatures, depth: &DepthImage, factor: f64, camera: &CameraModel) {
    for i in 0..features.len() {
        let kp = features.keypoints[i];
        let (x, y) = (kp.x.round(), kp.y.round());
        if x < 0.0 || y < 0.0 || x >= depth.width() as f64 || y >= depth.height() as f64 {
            continue;
        }
        let raw = depth.get_pixel(x as u32, y as u32).0[0];
        let d = raw as f64 / factor;
        if raw > 0 && d.is_finite() {
            features.depth[i] = Some(d);
            features.u_right[i] = Some(features.keypoints_un[i].x - camera.bf / d);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::KeyPoint;
    use crate::system::test_support::{tagged_image, ScriptedExtractor, SyntheticScene, BASELINE, DEPTH_FACTOR};
    use approx::assert_relative_eq;

    fn config(sensor: SensorMode) -> SlamConfig {
        let mut config = SlamConfig::default();
        config.sensor = sensor;
        config.camera.fx = 450.0;
        config.camera.fy = 450.0;
        config.camera.cx = 320.0;
        config.camera.cy = 240.0;
        config.camera.width = 640;
        config.camera.height = 480;
        config.camera.k1 = 0.0;
        config.camera.k2 = 0.0;
        config.camera.p1 = 0.0;
        config.camera.p2 = 0.0;
        config.camera.baseline = Some(BASELINE);
        config.camera.depth_map_factor = DEPTH_FACTOR;
        config
    }

    fn builder(sensor: SensorMode, scripts: Vec<Features>) -> FrameBuilder {
        FrameBuilder::new(&config(sensor), Box::new(ScriptedExtractor { scripts }))
    }

    #[test]
    fn test_rejects_wrong_image_size() {
        let mut b = builder(SensorMode::Monocular, vec![]);
        let small = GrayImage::new(320, 240);
        let err = b
            .build(SensorInput::Monocular { image: &small }, 0.0, None, ImuBias::zero())
            .unwrap_err();
        assert!(matches!(err, SlamError::InvalidInput(_)));
        assert!(b.last_timestamp().is_none());
    }

    #[test]
    fn test_rejects_mode_mismatch_and_time_regression() {
        let mut b = builder(SensorMode::Monocular, vec![]);
        let img = tagged_image(0);
        let depth = DepthImage::new(640, 480);
        assert!(b
            .build(SensorInput::Rgbd { image: &img, depth: &depth }, 0.0, None, ImuBias::zero())
            .is_err());
        b.build(SensorInput::Monocular { image: &img }, 1.0, None, ImuBias::zero())
            .unwrap();
        assert!(b.build(SensorInput::Monocular { image: &img }, 1.0, None, ImuBias::zero()).is_err());
        assert!(b.build(SensorInput::Monocular { image: &img }, f64::NAN, None, ImuBias::zero()).is_err());
        let frame = b
            .build(SensorInput::Monocular { image: &img }, 1.5, None, ImuBias::zero())
            .unwrap();
        assert_eq!(frame.id, 1);
    }

    #[test]
    fn test_inertial_mode_requires_samples_after_first_frame() {
        let mut b = builder(SensorMode::ImuMonocular, vec![]);
        let img = tagged_image(0);
        b.build(SensorInput::Monocular { image: &img }, 0.0, Some(&[]), ImuBias::zero())
            .unwrap();
        assert!(b.build(SensorInput::Monocular { image: &img }, 0.1, Some(&[]), ImuBias::zero()).is_err());
        let samples: Vec<ImuSample> = (1..=10)
            .map(|i| ImuSample::new(0.0, 0.0, 9.81, 0.0, 0.0, 0.0, i as f64 * 0.01))
            .collect();
        let frame = b
            .build(SensorInput::Monocular { image: &img }, 0.1, Some(&samples), ImuBias::zero())
            .unwrap();
        let pre = frame.preintegrated_frame.unwrap();
        assert_relative_eq!(pre.d_t, 0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_rgbd_depth_association() {
        let scene = SyntheticScene::new(1, 100);
        let pose = SyntheticScene::pose_at(0.0);
        let (features, ids) = scene.observe(&pose);
        let depth = scene.depth_image(&pose);
        let mut b = builder(SensorMode::Rgbd, vec![features]);
        let img = tagged_image(1);
        let frame = b
            .build(SensorInput::Rgbd { image: &img, depth: &depth }, 0.0, None, ImuBias::zero())
            .unwrap();
        let pose_cw = pose.inverse();
        let mut with_depth = 0;
        for (i, l) in ids.iter().enumerate() {
            if let Some(d) = frame.features.depth[i] {
                let z = pose_cw.transform_point(&scene.points[*l]).z;
                assert!((d - z).abs() < 5e-3);
                with_depth += 1;
            }
        }
        assert!(with_depth > ids.len() / 2);
    }

    #[test]
    fn test_stereo_matching_recovers_depth() {
        let scene = SyntheticScene::new(2, 150);
        let pose = SyntheticScene::pose_at(0.0);
        let (left, ids) = scene.observe(&pose);
        let pose_cw = pose.inverse();
        let mut right = Features::default();
        for (i, l) in ids.iter().enumerate() {
            let pc = pose_cw.transform_point(&scene.points[*l]);
            let kp = left.keypoints[i];
            right.keypoints.push(KeyPoint::new(scene.camera.project_right_u(&pc), kp.y, kp.octave));
            right.descriptors.push(left.descriptors[i]);
        }
        let mut b = builder(SensorMode::Stereo, vec![left, right]);
        let (l_img, r_img) = (tagged_image(1), tagged_image(2));
        let frame = b
            .build(SensorInput::Stereo { left: &l_img, right: &r_img }, 0.0, None, ImuBias::zero())
            .unwrap();
        let matched = frame.features.depth.iter().filter(|d| d.is_some()).count();
        assert!(matched > ids.len() * 9 / 10);
        for (i, l) in ids.iter().enumerate() {
            if let Some(d) = frame.features.depth[i] {
                let z = pose_cw.transform_point(&scene.points[*l]).z;
                assert_relative_eq!(d, z, epsilon = 1e-6);
            }
        }
    }
}
