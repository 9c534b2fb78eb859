//! Synthetic scenes and scripted inputs for unit and scenario tests.

use std::collections::HashMap;
use std::sync::Arc;

use image::{GrayImage, ImageBuffer, Luma};
use nalgebra::{UnitQuaternion, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::atlas::map::{IdAllocator, KeyFrameId, Map, MapId};
use crate::features::{Descriptor, FeatureExtractor, Features, KeyPoint, ScalePyramid};
use crate::geometry::{CameraModel, SE3};
use crate::tracking::frame::{Frame, FrameFeatures};
use crate::vocabulary::OrbVocabulary;

pub const WIDTH: u32 = 640;
pub const HEIGHT: u32 = 480;
pub const BASELINE: f64 = 0.1;
pub const DEPTH_FACTOR: f64 = 1000.0;

/// Random landmarks in front of a camera looking down +z.
pub struct SyntheticScene {
    pub camera: CameraModel,
    pub pyramid: ScalePyramid,
    pub points: Vec<Vector3<f64>>,
    pub descriptors: Vec<Descriptor>,
    pub vocabulary: Arc<OrbVocabulary>,
}

impl SyntheticScene {
    pub fn new(seed: u64, n_points: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut camera = CameraModel::pinhole(450.0, 450.0, 320.0, 240.0, WIDTH, HEIGHT);
        camera.baseline = BASELINE;
        camera.bf = BASELINE * camera.fx;
        camera.th_depth = BASELINE * 40.0;
        let points = (0..n_points)
            .map(|_| {
                Vector3::new(
                    rng.gen_range(-3.5..3.5),
                    rng.gen_range(-2.5..2.5),
                    rng.gen_range(5.0..9.0),
                )
            })
            .collect();
        let descriptors: Vec<Descriptor> = (0..n_points).map(|_| rng.gen()).collect();
        let vocabulary = Arc::new(OrbVocabulary::from_words(&descriptors));
        Self {
            camera,
            pyramid: ScalePyramid::new(1.2, 8),
            points,
            descriptors,
            vocabulary,
        }
    }

    /// Camera-to-world pose at `x` along the baseline, with a small yaw.
    pub fn pose_at(x: f64) -> SE3 {
        SE3::new(UnitQuaternion::from_euler_angles(0.0, 0.02 * x, 0.0), Vector3::new(x, 0.0, 0.0))
    }

    /// Keypoints of every landmark visible from `pose_wc`, plus the landmark
    /// index of each keypoint.
    pub fn observe(&self, pose_wc: &SE3) -> (Features, Vec<usize>) {
        let pose_cw = pose_wc.inverse();
        let mut features = Features::default();
        let mut ids = Vec::new();
        for (i, p) in self.points.iter().enumerate() {
            let pc = pose_cw.transform_point(p);
            let Some(uv) = self.camera.project_checked(&pc) else {
                continue;
            };
            if uv.x < 1.0 || uv.y < 1.0 || uv.x >= WIDTH as f64 - 1.0 || uv.y >= HEIGHT as f64 - 1.0 {
                continue;
            }
            features.keypoints.push(KeyPoint::new(uv.x, uv.y, 0));
            features.descriptors.push(self.descriptors[i]);
            ids.push(i);
        }
        (features, ids)
    }

    /// Observed features with exact stereo coordinates and depth.
    pub fn stereo_features(&self, pose_wc: &SE3) -> (FrameFeatures, Vec<usize>) {
        let (features, ids) = self.observe(pose_wc);
        let mut ff = FrameFeatures::new(features, &self.camera);
        let pose_cw = pose_wc.inverse();
        for (k, i) in ids.iter().enumerate() {
            let pc = pose_cw.transform_point(&self.points[*i]);
            ff.depth[k] = Some(pc.z);
            ff.u_right[k] = Some(self.camera.project_right_u(&pc));
        }
        (ff, ids)
    }

    /// A posed stereo frame at `x`.
    pub fn frame_at(&self, id: u64, timestamp: f64, x: f64) -> (Frame, Vec<usize>) {
        let pose = Self::pose_at(x);
        let (ff, ids) = self.stereo_features(&pose);
        let mut frame = Frame::new(id, timestamp, ff);
        frame.pose = Some(pose);
        frame.compute_bow(&self.vocabulary);
        (frame, ids)
    }

    /// A map with one stereo KeyFrame per entry of `xs` and a MapPoint at the
    /// true position of every observed landmark.
    pub fn build_map(&self, xs: &[f64]) -> (Map, Vec<KeyFrameId>) {
        let ids = Arc::new(IdAllocator::default());
        let mut map = Map::new(MapId::new(0), ids);
        let kfs = self.populate(&mut map, xs);
        (map, kfs)
    }

    /// Add the KeyFrames and MapPoints of [`SyntheticScene::build_map`] to an
    /// existing map, e.g. the active map of a shared Atlas.
    pub fn populate(&self, map: &mut Map, xs: &[f64]) -> Vec<KeyFrameId> {
        let mut landmark_to_mp = HashMap::new();
        let mut kfs = Vec::new();
        for (n, x) in xs.iter().enumerate() {
            let (frame, landmarks) = self.frame_at(n as u64, n as f64 * 0.1, *x);
            let kf_id = map.create_keyframe(&frame);
            for (idx, l) in landmarks.iter().enumerate() {
                let mp = *landmark_to_mp
                    .entry(*l)
                    .or_insert_with(|| map.create_map_point(self.points[*l], self.descriptors[*l], kf_id));
                map.associate(kf_id, idx, mp);
            }
            kfs.push(kf_id);
        }
        for kf in &kfs {
            map.update_connections(*kf);
        }
        for mp in landmark_to_mp.values() {
            map.update_map_point(*mp, &self.pyramid);
        }
        kfs
    }

    /// RGB-D depth image for `pose_wc`, in units of `1 / DEPTH_FACTOR` m.
    pub fn depth_image(&self, pose_wc: &SE3) -> ImageBuffer<Luma<u16>, Vec<u16>> {
        let mut img = ImageBuffer::new(WIDTH, HEIGHT);
        let pose_cw = pose_wc.inverse();
        for p in &self.points {
            let pc = pose_cw.transform_point(p);
            if let Some(uv) = self.camera.project_checked(&pc) {
                let (u, v) = (uv.x.round() as i64, uv.y.round() as i64);
                if u >= 0 && v >= 0 && u < WIDTH as i64 && v < HEIGHT as i64 {
                    img.put_pixel(u as u32, v as u32, Luma([(pc.z * DEPTH_FACTOR).round() as u16]));
                }
            }
        }
        img
    }
}

/// A gray image whose top-left pixel selects a script entry. Zero is blank.
pub fn tagged_image(tag: u8) -> GrayImage {
    let mut img = GrayImage::new(WIDTH, HEIGHT);
    img.put_pixel(0, 0, Luma([tag]));
    img
}

/// Feature extractor that replays prepared features.
///
/// The value of pixel (0, 0) picks the entry: 0 gives no features (a blank
/// frame), `n` gives `scripts[n - 1]`.
pub struct ScriptedExtractor {
    pub scripts: Vec<Features>,
}

impl FeatureExtractor for ScriptedExtractor {
    fn extract(&mut self, image: &GrayImage) -> Features {
        let tag = image.get_pixel(0, 0).0[0] as usize;
        if tag == 0 {
            return Features::default();
        }
        self.scripts.get(tag - 1).cloned().unwrap_or_default()
    }
}
