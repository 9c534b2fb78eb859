//! Sim3 solver using Horn's method with RANSAC.
//!
//! Estimates `S12`, the similarity taking camera-2 coordinates to camera-1
//! coordinates, from MapPoints matched between two KeyFrames. Hypotheses
//! come from three correspondences at a time; a correspondence is an inlier
//! when it reprojects within bounds in both images. The best hypothesis is
//! refined on its inliers with Levenberg-Marquardt.
//!
//! Scale is fixed to 1 for stereo, RGB-D and inertial maps with a known scale.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::storage::Owned;
use nalgebra::{DMatrix, DVector, Dyn, Matrix3, Rotation3, UnitQuaternion, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use tracing::debug;

use crate::atlas::map::{KeyFrame, Map, MapPointId};
use crate::error::{Result, SlamError};
use crate::features::ScalePyramid;
use crate::geometry::{CameraModel, Sim3};

/// χ² bound (2 DoF, 99%) on the reprojection error of a correspondence.
const CHI2_SIM3: f64 = 9.21;
/// Success probability for the adaptive iteration count.
const RANSAC_PROBABILITY: f64 = 0.99;
const JACOBIAN_STEP: f64 = 1e-7;

/// One matched MapPoint pair, in the two camera frames.
#[derive(Debug, Clone)]
pub struct Sim3Correspondence {
    /// Feature index in KeyFrame 1.
    pub idx1: usize,
    /// MapPoint of KeyFrame 2 matched to `idx1`.
    pub mp2: MapPointId,
    pub p1: Vector3<f64>,
    pub p2: Vector3<f64>,
    pub uv1: Vector2<f64>,
    pub uv2: Vector2<f64>,
    /// Squared pixel bounds for the reprojection test, per image.
    pub max_err1: f64,
    pub max_err2: f64,
    /// `1/σ` of the observing octave, per image.
    pub inv_sigma1: f64,
    pub inv_sigma2: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct RansacParams {
    pub max_iterations: usize,
    pub min_inliers: usize,
    pub fix_scale: bool,
}

/// Result of a successful estimation.
#[derive(Debug, Clone)]
pub struct Sim3Estimate {
    pub s12: Sim3,
    /// Inlier flags, aligned with the solver's correspondences.
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
}

pub struct Sim3Solver {
    correspondences: Vec<Sim3Correspondence>,
    camera: CameraModel,
    params: RansacParams,
}

impl Sim3Solver {
    pub fn new(correspondences: Vec<Sim3Correspondence>, camera: &CameraModel, params: RansacParams) -> Self {
        Self {
            correspondences,
            camera: camera.clone(),
            params,
        }
    }

    /// Build correspondences from `matches12` (per feature of `kf1`, the
    /// matched MapPoint of `kf2`). Pairs without a good point on either
    /// side are skipped.
    pub fn from_matches(
        kf1: &KeyFrame,
        kf2: &KeyFrame,
        matches12: &[Option<MapPointId>],
        map: &Map,
        camera: &CameraModel,
        pyramid: &ScalePyramid,
        params: RansacParams,
    ) -> Self {
        let t1w = kf1.pose_cw();
        let t2w = kf2.pose_cw();
        let mut correspondences = Vec::new();
        for (idx1, m) in matches12.iter().enumerate() {
            let Some(mp2_id) = m else {
                continue;
            };
            let Some(mp1) = kf1.get_map_point(idx1).and_then(|id| map.get_map_point(id)) else {
                continue;
            };
            let Some(mp2) = map.get_map_point(*mp2_id) else {
                continue;
            };
            if mp1.is_bad || mp2.is_bad {
                continue;
            }
            let Some(&idx2) = mp2.observations.get(&kf2.id) else {
                continue;
            };
            let kp1 = &kf1.features.keypoints_un[idx1];
            let kp2 = &kf2.features.keypoints_un[idx2];
            correspondences.push(Sim3Correspondence {
                idx1,
                mp2: *mp2_id,
                p1: t1w.transform_point(&mp1.position),
                p2: t2w.transform_point(&mp2.position),
                uv1: Vector2::new(kp1.x, kp1.y),
                uv2: Vector2::new(kp2.x, kp2.y),
                max_err1: CHI2_SIM3 * pyramid.sigma2(kp1.octave),
                max_err2: CHI2_SIM3 * pyramid.sigma2(kp2.octave),
                inv_sigma1: pyramid.inv_sigma2(kp1.octave).sqrt(),
                inv_sigma2: pyramid.inv_sigma2(kp2.octave).sqrt(),
            });
        }
        Self::new(correspondences, camera, params)
    }

    pub fn len(&self) -> usize {
        self.correspondences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.correspondences.is_empty()
    }

    pub fn correspondences(&self) -> &[Sim3Correspondence] {
        &self.correspondences
    }

    /// Run RANSAC and refine the winner. `None` when no hypothesis reaches
    /// `min_inliers`.
    pub fn solve(&self, seed: u64) -> Option<Sim3Estimate> {
        let n = self.correspondences.len();
        if n < 3 || n < self.params.min_inliers {
            return None;
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut best: Option<Sim3Estimate> = None;
        let mut max_iter = self.params.max_iterations;
        let mut iteration = 0;
        while iteration < max_iter {
            iteration += 1;
            let picked = sample(&mut rng, n, 3);
            let p1: Vec<Vector3<f64>> = picked.iter().map(|i| self.correspondences[i].p1).collect();
            let p2: Vec<Vector3<f64>> = picked.iter().map(|i| self.correspondences[i].p2).collect();
            let Some(s12) = horn(&p2, &p1, self.params.fix_scale) else {
                continue;
            };
            let inliers = self.check_inliers(&s12);
            let count = inliers.iter().filter(|b| **b).count();
            if best.as_ref().map_or(true, |b| count > b.num_inliers) {
                if count >= self.params.min_inliers {
                    let ratio = count as f64 / n as f64;
                    max_iter = max_iter.min(iteration.saturating_add(adaptive_iterations(ratio, 3)));
                }
                best = Some(Sim3Estimate {
                    s12,
                    inliers,
                    num_inliers: count,
                });
            }
        }

        let best = best.filter(|b| b.num_inliers >= self.params.min_inliers)?;
        let refined = match self.refine(&best) {
            Ok(refined) => refined,
            Err(e) => {
                debug!("[Sim3] Refinement discarded: {}", e);
                return Some(best);
            }
        };
        let inliers = self.check_inliers(&refined);
        let count = inliers.iter().filter(|b| **b).count();
        if count >= self.params.min_inliers {
            debug!(
                "[Sim3] {} correspondences: {} inliers after {} iterations, refined to {}",
                n, best.num_inliers, iteration, count
            );
            Some(Sim3Estimate {
                s12: refined,
                inliers,
                num_inliers: count,
            })
        } else {
            Some(best)
        }
    }

    /// Reprojection test in both images.
    pub fn check_inliers(&self, s12: &Sim3) -> Vec<bool> {
        let s21 = s12.inverse();
        self.correspondences
            .iter()
            .map(|c| {
                let in1 = reprojection_error2(&self.camera, &s12.transform_point(&c.p2), &c.uv1);
                let in2 = reprojection_error2(&self.camera, &s21.transform_point(&c.p1), &c.uv2);
                matches!((in1, in2), (Some(e1), Some(e2)) if e1 <= c.max_err1 && e2 <= c.max_err2)
            })
            .collect()
    }

    /// Minimize the two-sided reprojection error over the inliers.
    fn refine(&self, estimate: &Sim3Estimate) -> Result<Sim3> {
        let inliers: Vec<&Sim3Correspondence> = self
            .correspondences
            .iter()
            .zip(&estimate.inliers)
            .filter_map(|(c, inlier)| inlier.then_some(c))
            .collect();
        let dof = if self.params.fix_scale { 6 } else { 7 };
        let problem = Sim3Alignment {
            base: estimate.s12,
            inliers: &inliers,
            camera: &self.camera,
            dof,
            params: DVector::zeros(dof),
        };
        let initial_cost = problem.cost();
        if !initial_cost.is_finite() {
            return Err(SlamError::OptimizationDivergence("sim3 cost is not finite".into()));
        }
        let (solved, report) = LevenbergMarquardt::new().with_patience(20).minimize(problem);
        let final_cost = report.objective_function;
        if !final_cost.is_finite() || final_cost > initial_cost {
            return Err(SlamError::OptimizationDivergence(format!(
                "sim3 cost went from {initial_cost:.3} to {final_cost:.3}"
            )));
        }
        let s12 = solved.current();
        if !(s12.scale.is_finite() && s12.scale > 0.0) {
            return Err(SlamError::OptimizationDivergence("sim3 scale is invalid".into()));
        }
        Ok(s12)
    }
}

/// Squared pixel error of `pc` against `uv`, `None` behind the camera.
fn reprojection_error2(camera: &CameraModel, pc: &Vector3<f64>, uv: &Vector2<f64>) -> Option<f64> {
    if pc.z <= 0.0 {
        return None;
    }
    Some((camera.project(pc) - uv).norm_squared())
}

/// Adapter between the inlier set and the LM solver. Parameters are a
/// left increment on the RANSAC estimate.
struct Sim3Alignment<'a> {
    base: Sim3,
    inliers: &'a [&'a Sim3Correspondence],
    camera: &'a CameraModel,
    dof: usize,
    params: DVector<f64>,
}

impl Sim3Alignment<'_> {
    fn at(&self, x: &DVector<f64>) -> Sim3 {
        let mut v = [0.0; 7];
        v[..self.dof].copy_from_slice(x.as_slice());
        Sim3::exp(&v).compose(&self.base)
    }

    fn current(&self) -> Sim3 {
        self.at(&self.params)
    }

    fn residuals_at(&self, x: &DVector<f64>) -> DVector<f64> {
        let s12 = self.at(x);
        let s21 = s12.inverse();
        let mut r = DVector::zeros(4 * self.inliers.len());
        for (k, c) in self.inliers.iter().enumerate() {
            let e1 = self.camera.project(&s12.transform_point(&c.p2)) - c.uv1;
            let e2 = self.camera.project(&s21.transform_point(&c.p1)) - c.uv2;
            r[4 * k] = e1.x * c.inv_sigma1;
            r[4 * k + 1] = e1.y * c.inv_sigma1;
            r[4 * k + 2] = e2.x * c.inv_sigma2;
            r[4 * k + 3] = e2.y * c.inv_sigma2;
        }
        r
    }

    fn cost(&self) -> f64 {
        0.5 * self.residuals_at(&self.params).norm_squared()
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for Sim3Alignment<'_> {
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
        let r = self.residuals_at(&self.params);
        r.iter().all(|v| v.is_finite()).then_some(r)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let r0 = self.residuals()?;
        let mut j = DMatrix::zeros(r0.len(), self.dof);
        let mut x = self.params.clone();
        for k in 0..self.dof {
            let saved = x[k];
            x[k] = saved + JACOBIAN_STEP;
            let r = self.residuals_at(&x);
            x[k] = saved;
            j.set_column(k, &((r - &r0) / JACOBIAN_STEP));
        }
        Some(j)
    }
}

/// Closed-form similarity with `target ≈ S · source` (Horn / Umeyama).
pub fn horn(source: &[Vector3<f64>], target: &[Vector3<f64>], fix_scale: bool) -> Option<Sim3> {
    let n = source.len();
    if n < 3 || n != target.len() {
        return None;
    }
    let c_src: Vector3<f64> = source.iter().sum::<Vector3<f64>>() / n as f64;
    let c_dst: Vector3<f64> = target.iter().sum::<Vector3<f64>>() / n as f64;

    let mut h = Matrix3::zeros();
    let mut var_src = 0.0;
    for (s, d) in source.iter().zip(target) {
        let (s, d) = (s - c_src, d - c_dst);
        h += s * d.transpose();
        var_src += s.norm_squared();
    }
    if var_src < 1e-12 {
        return None;
    }

    let svd = h.svd(true, true);
    let (u, v_t) = (svd.u?, svd.v_t?);
    let mut v = v_t.transpose();
    let mut sigma = svd.singular_values;
    if (v * u.transpose()).determinant() < 0.0 {
        let mut last = v.column_mut(2);
        last *= -1.0;
        sigma[2] = -sigma[2];
    }
    let r = v * u.transpose();
    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r));

    let scale = if fix_scale { 1.0 } else { sigma.sum() / var_src };
    if !(scale.is_finite() && scale > 0.0) {
        return None;
    }
    let translation = c_dst - scale * (rotation * c_src);
    Some(Sim3::new(rotation, translation, scale))
}

/// Iterations needed to draw one all-inlier sample with `RANSAC_PROBABILITY`.
fn adaptive_iterations(inlier_ratio: f64, sample_size: i32) -> usize {
    if inlier_ratio >= 1.0 {
        return 1;
    }
    let w_n = inlier_ratio.powi(sample_size);
    let denom = (1.0 - w_n).ln();
    if !denom.is_finite() || denom.abs() < 1e-12 {
        return usize::MAX;
    }
    ((1.0 - RANSAC_PROBABILITY).ln() / denom).ceil().max(1.0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::Rng;

    fn camera() -> CameraModel {
        CameraModel::pinhole(450.0, 450.0, 320.0, 240.0, 640, 480)
    }

    /// Correspondences of `n` points seen from two cameras related by `s12`,
    /// with the first `outliers` of them scrambled in camera 2.
    fn correspondences(s12: &Sim3, n: usize, outliers: usize, seed: u64) -> Vec<Sim3Correspondence> {
        let mut rng = StdRng::seed_from_u64(seed);
        let cam = camera();
        let s21 = s12.inverse();
        (0..n)
            .map(|k| {
                let p1 = Vector3::new(rng.gen_range(-2.0..2.0), rng.gen_range(-1.5..1.5), rng.gen_range(4.0..8.0));
                let mut p2 = s21.transform_point(&p1);
                if k < outliers {
                    p2 += Vector3::new(rng.gen_range(0.5..1.0), rng.gen_range(-1.0..-0.5), 0.0);
                }
                Sim3Correspondence {
                    idx1: k,
                    mp2: MapPointId(k as u64),
                    p1,
                    p2,
                    uv1: cam.project(&p1),
                    uv2: cam.project(&s21.transform_point(&p1)),
                    max_err1: CHI2_SIM3,
                    max_err2: CHI2_SIM3,
                    inv_sigma1: 1.0,
                    inv_sigma2: 1.0,
                }
            })
            .collect()
    }

    fn params(fix_scale: bool) -> RansacParams {
        RansacParams {
            max_iterations: 300,
            min_inliers: 20,
            fix_scale,
        }
    }

    #[test]
    fn test_horn_recovers_similarity() {
        let s = Sim3::new(
            UnitQuaternion::from_euler_angles(0.1, -0.3, 0.2),
            Vector3::new(0.5, -1.0, 2.0),
            1.7,
        );
        let source: Vec<Vector3<f64>> = (0..10)
            .map(|i| Vector3::new(i as f64, (i * i) as f64 * 0.1, 1.0 + (i % 3) as f64))
            .collect();
        let target: Vec<Vector3<f64>> = source.iter().map(|p| s.transform_point(p)).collect();
        let est = horn(&source, &target, false).unwrap();
        assert_relative_eq!(est.scale, 1.7, epsilon = 1e-9);
        for (p, q) in source.iter().zip(&target) {
            assert_relative_eq!(est.transform_point(p), *q, epsilon = 1e-9);
        }
        let rigid = horn(&source, &source, true).unwrap();
        assert_relative_eq!(rigid.scale, 1.0);
        assert_relative_eq!(rigid.translation.norm(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_ransac_rejects_scrambled_matches() {
        let s12 = Sim3::new(
            UnitQuaternion::from_euler_angles(0.0, 0.2, 0.0),
            Vector3::new(0.4, 0.0, 0.1),
            1.0,
        );
        let solver = Sim3Solver::new(correspondences(&s12, 60, 15, 3), &camera(), params(true));
        let est = solver.solve(7).unwrap();
        assert_eq!(est.num_inliers, 45);
        assert!(est.inliers[..15].iter().all(|b| !b));
        assert_relative_eq!(est.s12.translation, s12.translation, epsilon = 1e-6);
        assert_relative_eq!(est.s12.scale, 1.0);
    }

    #[test]
    fn test_monocular_scale_is_estimated() {
        let s12 = Sim3::new(
            UnitQuaternion::from_euler_angles(0.05, 0.1, 0.0),
            Vector3::new(0.3, 0.1, -0.2),
            1.4,
        );
        let solver = Sim3Solver::new(correspondences(&s12, 40, 0, 4), &camera(), params(false));
        let est = solver.solve(1).unwrap();
        assert_eq!(est.num_inliers, 40);
        assert_relative_eq!(est.s12.scale, 1.4, epsilon = 1e-6);
    }

    #[test]
    fn test_guided_rescore_reuses_params() {
        let s12 = Sim3::new(
            UnitQuaternion::from_euler_angles(0.0, -0.1, 0.05),
            Vector3::new(-0.2, 0.0, 0.3),
            1.0,
        );
        let ransac = params(true);
        let est = Sim3Solver::new(correspondences(&s12, 50, 10, 6), &camera(), ransac)
            .solve(3)
            .unwrap();
        let guided = Sim3Solver::new(correspondences(&s12, 50, 0, 8), &camera(), ransac);
        let inliers = guided.check_inliers(&est.s12);
        assert_eq!(inliers.iter().filter(|b| **b).count(), 50);
        assert_eq!(ransac.min_inliers, 20);
    }

    #[test]
    fn test_too_few_correspondences() {
        let solver = Sim3Solver::new(correspondences(&Sim3::identity(), 10, 0, 5), &camera(), params(true));
        assert!(solver.solve(0).is_none());
    }
}
