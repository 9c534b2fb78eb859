//! Two-view reconstruction for monocular map initialization.
//!
//! 1. RANSAC over eight-point essential matrices, scored with the
//!    symmetric epipolar distance (χ² 3.841, score offset 5.991).
//! 2. Decompose the best E into the four `[R | t]` hypotheses.
//! 3. Triangulate the inliers under each hypothesis and keep the one that
//!    is clearly better than the rest with enough parallax.

use cv_core::sample_consensus::Estimator;
use eight_point::EightPoint;
use nalgebra::{Matrix3, Vector3};
use rand::seq::index::sample;
use rand::Rng;

use super::triangulation::triangulate_dlt;
use super::{rustcv, so3, SE3};

const CHI2_1DOF: f64 = 3.841;
const SCORE_OFFSET: f64 = 5.991;

#[derive(Debug, Clone)]
pub struct TwoViewParams {
    pub iterations: usize,
    /// Keypoint standard deviation in pixels.
    pub sigma: f64,
    /// Focal length used to express normalized errors in pixels.
    pub focal: f64,
    pub min_parallax_deg: f64,
    pub min_triangulated: usize,
}

#[derive(Debug, Clone)]
pub struct TwoViewResult {
    /// Camera 2 from camera 1.
    pub t21: SE3,
    /// Triangulated point (camera 1 frame) per correspondence.
    pub points: Vec<Option<Vector3<f64>>>,
    pub num_triangulated: usize,
    pub parallax_deg: f64,
}

/// Essential matrix (`x2ᵀ E x1 = 0`) from the first eight correspondences
/// listed in `idx`.
pub fn eight_point(x1: &[Vector3<f64>], x2: &[Vector3<f64>], idx: &[usize]) -> Option<Matrix3<f64>> {
    if idx.len() < <EightPoint as Estimator<rustcv::EpipolarMatch>>::MIN_SAMPLES {
        return None;
    }
    let matches = idx.iter().map(|&i| rustcv::feature_match(&x1[i], &x2[i]));
    let e = rustcv::matrix3(&EightPoint::new().estimate(matches)?.0);
    if !e.iter().all(|v| v.is_finite()) {
        return None;
    }

    // Project onto the essential manifold: singular values (1, 1, 0).
    let svd_e = e.svd(true, true);
    let (u, v_t) = (svd_e.u?, svd_e.v_t?);
    let mut s = svd_e.singular_values;
    let (i_min, i_max) = (s.imin(), s.imax());
    if i_min == i_max {
        return None;
    }
    let i_mid = 3 - i_min - i_max;
    let mean = 0.5 * (s[i_max] + s[i_mid]);
    s[i_max] = mean;
    s[i_mid] = mean;
    s[i_min] = 0.0;
    Some(u * Matrix3::from_diagonal(&s) * v_t)
}

fn score_essential(
    e: &Matrix3<f64>,
    x1: &[Vector3<f64>],
    x2: &[Vector3<f64>],
    params: &TwoViewParams,
    inliers: &mut [bool],
) -> f64 {
    let inv_sigma2 = 1.0 / (params.sigma * params.sigma);
    let f2 = params.focal * params.focal;
    let mut score = 0.0;
    for i in 0..x1.len() {
        let (p1, p2) = (&x1[i], &x2[i]);
        let l2 = e * p1;
        let l1 = e.transpose() * p2;
        let num2 = l2.dot(p2);
        let d2 = num2 * num2 / (l2.x * l2.x + l2.y * l2.y) * f2 * inv_sigma2;
        let num1 = l1.dot(p1);
        let d1 = num1 * num1 / (l1.x * l1.x + l1.y * l1.y) * f2 * inv_sigma2;
        let ok = d1.is_finite() && d2.is_finite() && d1 < CHI2_1DOF && d2 < CHI2_1DOF;
        inliers[i] = ok;
        if ok {
            score += 2.0 * SCORE_OFFSET - d1 - d2;
        }
    }
    score
}

struct Hypothesis {
    t21: SE3,
    points: Vec<Option<Vector3<f64>>>,
    good: usize,
    parallax_deg: f64,
}

fn check_rt(
    t21: SE3,
    x1: &[Vector3<f64>],
    x2: &[Vector3<f64>],
    inliers: &[bool],
    params: &TwoViewParams,
) -> Hypothesis {
    let th2 = 4.0 * params.sigma * params.sigma;
    let f2 = params.focal * params.focal;
    let identity = SE3::identity();
    let c2 = t21.inverse().translation;

    let mut points = vec![None; x1.len()];
    let mut cos_parallaxes = Vec::new();
    let mut good = 0;

    for i in 0..x1.len() {
        if !inliers[i] {
            continue;
        }
        let Some(p) = triangulate_dlt(&x1[i], &x2[i], &identity, &t21) else {
            continue;
        };
        let cos_par = super::triangulation::parallax_cos(&p, &Vector3::zeros(), &c2);
        let p2 = t21.transform_point(&p);
        if (p.z <= 0.0 || p2.z <= 0.0) && cos_par < 0.99998 {
            continue;
        }
        let e1 = (p.x / p.z - x1[i].x).powi(2) + (p.y / p.z - x1[i].y).powi(2);
        let e2 = (p2.x / p2.z - x2[i].x).powi(2) + (p2.y / p2.z - x2[i].y).powi(2);
        if e1 * f2 > th2 || e2 * f2 > th2 {
            continue;
        }
        cos_parallaxes.push(cos_par);
        good += 1;
        if cos_par < 0.99998 {
            points[i] = Some(p);
        }
    }

    let parallax_deg = if cos_parallaxes.is_empty() {
        0.0
    } else {
        // Ascending cosine is descending parallax; take the 50th largest angle.
        cos_parallaxes.sort_by(|a, b| a.total_cmp(b));
        let idx = 50.min(cos_parallaxes.len() - 1);
        cos_parallaxes[idx].clamp(-1.0, 1.0).acos().to_degrees()
    };

    Hypothesis {
        t21,
        points,
        good,
        parallax_deg,
    }
}

/// Reconstruct relative motion and structure from normalized bearings.
pub fn reconstruct<R: Rng>(
    x1: &[Vector3<f64>],
    x2: &[Vector3<f64>],
    params: &TwoViewParams,
    rng: &mut R,
) -> Option<TwoViewResult> {
    let n = x1.len();
    if n < 8 || n != x2.len() {
        return None;
    }

    let mut best_score = 0.0;
    let mut best_e = None;
    let mut best_inliers = vec![false; n];
    let mut inliers = vec![false; n];
    for _ in 0..params.iterations {
        let idx: Vec<usize> = sample(rng, n, 8).into_vec();
        let Some(e) = eight_point(x1, x2, &idx) else {
            continue;
        };
        let score = score_essential(&e, x1, x2, params, &mut inliers);
        if score > best_score {
            best_score = score;
            best_e = Some(e);
            best_inliers.copy_from_slice(&inliers);
        }
    }
    let e = best_e?;
    let n_inliers = best_inliers.iter().filter(|&&b| b).count();

    let svd = e.svd(true, true);
    let (mut u, mut v_t) = (svd.u?, svd.v_t?);
    let i_min = svd.singular_values.imin();
    // Reorder so the null direction is the third column.
    if i_min != 2 {
        u.swap_columns(i_min, 2);
        v_t.swap_rows(i_min, 2);
    }
    let t = u.column(2).normalize();
    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let mut r1 = u * w * v_t;
    if r1.determinant() < 0.0 {
        r1 = -r1;
    }
    let mut r2 = u * w.transpose() * v_t;
    if r2.determinant() < 0.0 {
        r2 = -r2;
    }

    let hypotheses: Vec<Hypothesis> = [(r1, t), (r1, -t), (r2, t), (r2, -t)]
        .into_iter()
        .map(|(r, t)| check_rt(SE3::from_rt(&so3::normalize_rotation(&r), t), x1, x2, &best_inliers, params))
        .collect();

    let max_good = hypotheses.iter().map(|h| h.good).max().unwrap_or(0);
    let min_good = ((0.9 * n_inliers as f64) as usize).max(params.min_triangulated);
    let similar = hypotheses.iter().filter(|h| h.good as f64 > 0.7 * max_good as f64).count();
    if max_good < min_good || similar > 1 {
        return None;
    }

    let best = hypotheses.into_iter().find(|h| h.good == max_good)?;
    if best.parallax_deg < params.min_parallax_deg {
        return None;
    }
    let num_triangulated = best.points.iter().filter(|p| p.is_some()).count();
    Some(TwoViewResult {
        t21: best.t21,
        points: best.points,
        num_triangulated,
        parallax_deg: best.parallax_deg,
    })
}
