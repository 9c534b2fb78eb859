//! Engine configuration.
//!
//! Every section derives `Deserialize` with `#[serde(default)]`, so a YAML
//! settings file only needs to list the values that differ from the defaults.
//! Policy thresholds (keyframe insertion, culling, loss handling) live here
//! rather than in the code that applies them.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::Context;
use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SlamError};

/// Sensor configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorMode {
    Monocular,
    Stereo,
    Rgbd,
    ImuMonocular,
    ImuStereo,
    ImuRgbd,
}

impl SensorMode {
    pub fn is_inertial(self) -> bool {
        matches!(self, Self::ImuMonocular | Self::ImuStereo | Self::ImuRgbd)
    }

    pub fn is_monocular(self) -> bool {
        matches!(self, Self::Monocular | Self::ImuMonocular)
    }

    pub fn is_stereo(self) -> bool {
        matches!(self, Self::Stereo | Self::ImuStereo)
    }

    pub fn is_rgbd(self) -> bool {
        matches!(self, Self::Rgbd | Self::ImuRgbd)
    }

    /// Whether metric depth is observed directly, which fixes the map scale.
    pub fn has_depth(self) -> bool {
        !self.is_monocular()
    }
}

impl Default for SensorMode {
    fn default() -> Self {
        Self::Monocular
    }
}

/// Pinhole intrinsics, radial-tangential distortion and depth parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: u32,
    pub height: u32,
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    /// Stereo baseline in meters. Required for stereo and RGB-D.
    pub baseline: Option<f64>,
    /// Raw depth units per meter (e.g. 5000 for TUM RGB-D).
    pub depth_map_factor: f64,
    /// Close/far threshold as a multiple of the baseline.
    pub th_depth: f64,
    pub fps: f64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            fx: 458.654,
            fy: 457.296,
            cx: 367.215,
            cy: 248.375,
            width: 752,
            height: 480,
            k1: 0.0,
            k2: 0.0,
            p1: 0.0,
            p2: 0.0,
            baseline: None,
            depth_map_factor: 1.0,
            th_depth: 40.0,
            fps: 20.0,
        }
    }
}

/// IMU noise model, extrinsics and initialization schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuConfig {
    /// Gyroscope noise density (rad/s/√Hz).
    pub noise_gyro: f64,
    /// Accelerometer noise density (m/s²/√Hz).
    pub noise_acc: f64,
    /// Gyroscope random walk (rad/s²/√Hz).
    pub gyro_walk: f64,
    /// Accelerometer random walk (m/s³/√Hz).
    pub acc_walk: f64,
    pub frequency: f64,
    /// Body-from-camera transform, row-major 4x4.
    pub t_body_camera: [f64; 16],
    /// Map age (s) before the first inertial initialization, monocular.
    pub init_time_mono: f64,
    /// Map age (s) before the first inertial initialization, stereo/RGB-D.
    pub init_time_stereo: f64,
    pub first_refinement_time: f64,
    pub second_refinement_time: f64,
    pub min_keyframes_for_init: usize,
}

impl ImuConfig {
    pub fn t_body_camera_matrix(&self) -> Matrix4<f64> {
        Matrix4::from_row_slice(&self.t_body_camera)
    }
}

impl Default for ImuConfig {
    fn default() -> Self {
        #[rustfmt::skip]
        let identity = [
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        Self {
            noise_gyro: 1.7e-4,
            noise_acc: 2.0e-3,
            gyro_walk: 1.9e-5,
            acc_walk: 3.0e-3,
            frequency: 200.0,
            t_body_camera: identity,
            init_time_mono: 2.0,
            init_time_stereo: 1.0,
            first_refinement_time: 5.0,
            second_refinement_time: 15.0,
            min_keyframes_for_init: 10,
        }
    }
}

/// Parameters of the built-in ORB extractor and of the scale pyramid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub n_features: usize,
    pub scale_factor: f64,
    pub n_levels: u32,
    pub ini_th_fast: u8,
    pub min_th_fast: u8,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            n_features: 1000,
            scale_factor: 1.2,
            n_levels: 8,
            ini_th_fast: 20,
            min_th_fast: 7,
        }
    }
}

/// Tracking thresholds and keyframe / loss policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub min_init_features: usize,
    pub min_init_matches: usize,
    pub min_init_triangulated: usize,
    pub min_init_parallax_deg: f64,
    pub init_ransac_iterations: usize,
    pub min_init_features_stereo: usize,

    pub min_matches_motion_model: usize,
    pub min_matches_reference: usize,
    pub min_inliers_ok: usize,
    pub min_inliers_after_relocalization: usize,
    pub max_local_keyframes: usize,

    pub min_frames: u64,
    /// Maximum frames between keyframes. Zero means one second of frames.
    pub max_frames: u64,
    pub tracked_ratio: f64,
    pub tracked_ratio_single_keyframe: f64,
    pub close_points_ratio: f64,
    /// Before inertial initialization, insert a keyframe at least this often.
    pub inertial_keyframe_interval_s: f64,
    pub max_queued_keyframes: usize,

    pub min_keyframes_for_recently_lost: usize,
    pub recently_lost_window_s: f64,
    pub lost_frames_before_new_map: u32,
    pub relocalization_min_bow_matches: usize,
    pub relocalization_min_inliers: usize,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            min_init_features: 100,
            min_init_matches: 100,
            min_init_triangulated: 50,
            min_init_parallax_deg: 1.0,
            init_ransac_iterations: 200,
            min_init_features_stereo: 500,
            min_matches_motion_model: 20,
            min_matches_reference: 15,
            min_inliers_ok: 30,
            min_inliers_after_relocalization: 50,
            max_local_keyframes: 80,
            min_frames: 0,
            max_frames: 0,
            tracked_ratio: 0.9,
            tracked_ratio_single_keyframe: 0.4,
            close_points_ratio: 0.35,
            inertial_keyframe_interval_s: 0.25,
            max_queued_keyframes: 3,
            min_keyframes_for_recently_lost: 10,
            recently_lost_window_s: 5.0,
            lost_frames_before_new_map: 30,
            relocalization_min_bow_matches: 15,
            relocalization_min_inliers: 50,
        }
    }
}

/// Local mapping policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalMappingConfig {
    pub min_found_ratio: f64,
    pub min_observations_mono: usize,
    pub min_observations_stereo: usize,
    /// Keyframes a new point stays on probation.
    pub recent_point_window: u64,
    pub redundancy_ratio: f64,
    pub redundancy_ratio_inertial: f64,
    pub redundant_observers: usize,
    /// Inertial maps keep a keyframe if removing it opens a gap longer than this.
    pub max_inertial_gap_s: f64,
    pub triangulation_neighbors: usize,
    pub triangulation_neighbors_mono: usize,
    pub min_parallax_cos: f64,
    pub min_parallax_cos_inertial: f64,
    pub fuse_neighbors: usize,
    pub fuse_neighbors_mono: usize,
    pub local_ba_iterations: usize,
    pub max_local_ba_keyframes: usize,
}

impl Default for LocalMappingConfig {
    fn default() -> Self {
        Self {
            min_found_ratio: 0.25,
            min_observations_mono: 2,
            min_observations_stereo: 3,
            recent_point_window: 3,
            redundancy_ratio: 0.9,
            redundancy_ratio_inertial: 0.5,
            redundant_observers: 3,
            max_inertial_gap_s: 3.0,
            triangulation_neighbors: 10,
            triangulation_neighbors_mono: 20,
            min_parallax_cos: 0.9998,
            min_parallax_cos_inertial: 0.9996,
            fuse_neighbors: 10,
            fuse_neighbors_mono: 20,
            local_ba_iterations: 10,
            max_local_ba_keyframes: 20,
        }
    }
}

/// Loop closing and map merging policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopClosingConfig {
    pub enabled: bool,
    pub merge_enabled: bool,
    pub min_keyframes_between: u64,
    pub min_map_keyframes: usize,
    pub consistency_threshold: usize,
    pub bow_match_ratio: f64,
    pub min_bow_matches: usize,
    pub ransac_iterations: usize,
    pub ransac_min_inliers: usize,
    pub min_projection_matches: usize,
    pub essential_graph_min_weight: usize,
    pub pose_graph_iterations: usize,
    pub global_ba: bool,
    pub global_ba_iterations: usize,
}

impl Default for LoopClosingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            merge_enabled: true,
            min_keyframes_between: 10,
            min_map_keyframes: 10,
            consistency_threshold: 3,
            bow_match_ratio: 0.75,
            min_bow_matches: 20,
            ransac_iterations: 300,
            ransac_min_inliers: 20,
            min_projection_matches: 40,
            essential_graph_min_weight: 100,
            pose_graph_iterations: 20,
            global_ba: true,
            global_ba_iterations: 10,
        }
    }
}

/// 2D occupancy export.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OccupancyConfig {
    /// Cell size in map units.
    pub resolution: f64,
    /// Height band (relative to the map origin, along the up axis).
    pub min_height: f64,
    pub max_height: f64,
    pub occupied_min_points: u32,
    pub margin_cells: usize,
    pub max_cells_per_side: usize,
}

impl Default for OccupancyConfig {
    fn default() -> Self {
        Self {
            resolution: 0.05,
            min_height: -0.5,
            max_height: 0.5,
            occupied_min_points: 2,
            margin_cells: 5,
            max_cells_per_side: 2000,
        }
    }
}

/// Top-level settings record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlamConfig {
    pub sensor: SensorMode,
    pub camera: CameraConfig,
    pub imu: ImuConfig,
    pub extractor: ExtractorConfig,
    pub tracking: TrackingConfig,
    pub local_mapping: LocalMappingConfig,
    pub loop_closing: LoopClosingConfig,
    pub occupancy: OccupancyConfig,
    /// DBoW2 text vocabulary, loaded at `initialize` when no vocabulary is supplied.
    pub vocabulary_path: Option<PathBuf>,
}

impl SlamConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: SlamConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a settings file. IO and parse failures surface as `Configuration`.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let config = Self::read_yaml(path.as_ref()).map_err(|e| SlamError::Configuration(format!("{e:#}")))?;
        config.validate()?;
        Ok(config)
    }

    fn read_yaml(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        serde_yaml::from_reader(file).with_context(|| format!("Failed to parse settings {:?}", path))
    }

    /// Frames between forced keyframes.
    pub fn max_frames_between_keyframes(&self) -> u64 {
        if self.tracking.max_frames > 0 {
            self.tracking.max_frames
        } else {
            self.camera.fps.round().max(1.0) as u64
        }
    }

    /// Reject calibrations and parameters the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let cam = &self.camera;
        let bad = |msg: String| Err(SlamError::Configuration(msg));

        for (name, v) in [("fx", cam.fx), ("fy", cam.fy)] {
            if !v.is_finite() || v <= 0.0 {
                return bad(format!("camera.{name} must be positive, got {v}"));
            }
        }
        if !cam.cx.is_finite() || !cam.cy.is_finite() {
            return bad("camera principal point must be finite".into());
        }
        if cam.width == 0 || cam.height == 0 {
            return bad(format!("camera size {}x{} is empty", cam.width, cam.height));
        }
        if !cam.fps.is_finite() || cam.fps <= 0.0 {
            return bad(format!("camera.fps must be positive, got {}", cam.fps));
        }
        if self.sensor.has_depth() {
            match cam.baseline {
                Some(b) if b.is_finite() && b > 0.0 => {}
                _ => return bad("stereo and RGB-D modes need a positive camera.baseline".into()),
            }
            if cam.th_depth <= 0.0 {
                return bad("camera.th_depth must be positive".into());
            }
        }
        if self.sensor.is_rgbd() && !(cam.depth_map_factor.is_finite() && cam.depth_map_factor > 0.0) {
            return bad("camera.depth_map_factor must be positive".into());
        }

        if self.sensor.is_inertial() {
            let imu = &self.imu;
            let noise = [imu.noise_gyro, imu.noise_acc, imu.gyro_walk, imu.acc_walk, imu.frequency];
            if noise.iter().any(|v| !v.is_finite() || *v <= 0.0) {
                return bad("IMU noise parameters and frequency must be positive".into());
            }
            let t = imu.t_body_camera_matrix();
            let r = t.fixed_view::<3, 3>(0, 0).into_owned();
            let orthonormal = (r.transpose() * r - nalgebra::Matrix3::identity()).abs().max() < 1e-3;
            if !orthonormal || (r.determinant() - 1.0).abs() > 1e-3 {
                return bad("imu.t_body_camera is not a rigid transform".into());
            }
        }

        let ex = &self.extractor;
        if ex.n_features == 0 || ex.n_levels == 0 || !(ex.scale_factor > 1.0) {
            return bad("extractor needs n_features > 0, n_levels > 0 and scale_factor > 1".into());
        }
        if ex.min_th_fast == 0 || ex.min_th_fast > ex.ini_th_fast {
            return bad("extractor FAST thresholds must satisfy 0 < min <= ini".into());
        }

        let occ = &self.occupancy;
        if !(occ.resolution > 0.0) || occ.min_height >= occ.max_height {
            return bad("occupancy needs resolution > 0 and min_height < max_height".into());
        }
        if self.tracking.max_queued_keyframes == 0 {
            return bad("tracking.max_queued_keyframes must be at least 1".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_monocular_is_valid() {
        assert!(SlamConfig::default().validate().is_ok());
    }

    #[test]
    fn test_stereo_requires_baseline() {
        let mut config = SlamConfig {
            sensor: SensorMode::Stereo,
            ..SlamConfig::default()
        };
        assert!(matches!(config.validate(), Err(SlamError::Configuration(_))));
        config.camera.baseline = Some(0.11);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "sensor: imu_monocular\ncamera:\n  fx: 500.0\n  fy: 500.0\n  width: 640\n  height: 480\n";
        let config = SlamConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.sensor, SensorMode::ImuMonocular);
        assert_eq!(config.camera.width, 640);
        assert_eq!(config.extractor.n_levels, 8);
        assert_eq!(config.tracking.max_queued_keyframes, 3);
    }

    #[test]
    fn test_settings_file_errors_are_configuration_errors() {
        let missing = std::env::temp_dir().join("orbslam_engine_no_such_settings.yaml");
        match SlamConfig::from_yaml_file(&missing) {
            Err(SlamError::Configuration(msg)) => assert!(msg.contains("Failed to open")),
            other => panic!("unexpected {other:?}"),
        }

        let bad = std::env::temp_dir().join(format!("orbslam_engine_bad_{}.yaml", std::process::id()));
        std::fs::write(&bad, "camera: [not, a, map\n").unwrap();
        let result = SlamConfig::from_yaml_file(&bad);
        std::fs::remove_file(&bad).unwrap();
        match result {
            Err(SlamError::Configuration(msg)) => assert!(msg.contains("Failed to parse settings")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_settings_file_round_trip() {
        let path = std::env::temp_dir().join(format!("orbslam_engine_ok_{}.yaml", std::process::id()));
        std::fs::write(&path, "sensor: rgbd\ncamera:\n  baseline: 0.08\n  depth_map_factor: 1000.0\n").unwrap();
        let result = SlamConfig::from_yaml_file(&path);
        std::fs::remove_file(&path).unwrap();
        assert_eq!(result.unwrap().sensor, SensorMode::Rgbd);
    }

    #[test]
    fn test_malformed_yaml_is_configuration_error() {
        let err = SlamConfig::from_yaml_str("camera: [1, 2").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_negative_focal_length_rejected() {
        let mut config = SlamConfig::default();
        config.camera.fx = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_frames_defaults_to_fps() {
        let config = SlamConfig::default();
        assert_eq!(config.max_frames_between_keyframes(), 20);
    }
}
