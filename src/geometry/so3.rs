//! SO(3) helpers shared by preintegration and the optimizers.
//!
//! Conventions follow Forster et al., "On-Manifold Preintegration": right
//! Jacobians, `exp` as the Rodrigues formula, `log` returning a rotation vector.

use nalgebra::{Matrix3, Vector3};

const EPS: f64 = 1e-5;

/// `[v]×`, so that `skew(v) * u == v.cross(u)`.
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Rodrigues exponential, re-orthonormalized.
pub fn exp(w: &Vector3<f64>) -> Matrix3<f64> {
    let theta = w.norm();
    let wx = skew(w);
    if theta < EPS {
        normalize_rotation(&(Matrix3::identity() + wx + 0.5 * wx * wx))
    } else {
        Matrix3::identity()
            + wx * (theta.sin() / theta)
            + wx * wx * ((1.0 - theta.cos()) / (theta * theta))
    }
}

/// Rotation vector of `r`.
/// The angle is `atan2(sin, cos)`; `acos` of the trace rounds tiny angles to zero.
pub fn log(r: &Matrix3<f64>) -> Vector3<f64> {
    let r = normalize_rotation(r);
    let v = Vector3::new(r[(2, 1)] - r[(1, 2)], r[(0, 2)] - r[(2, 0)], r[(1, 0)] - r[(0, 1)]);
    let sin = 0.5 * v.norm();
    let cos = 0.5 * (r.trace() - 1.0);
    let theta = sin.atan2(cos);
    if theta < EPS {
        // R ≈ I + [w]×
        return 0.5 * v;
    }
    if sin < EPS {
        // Near π the axis comes from the symmetric part: (R + I) / 2 = a aᵀ.
        let b = 0.5 * (r + Matrix3::identity());
        let i = (0..3).fold(0, |best, k| if b[(k, k)] > b[(best, best)] { k } else { best });
        let mut axis = (b.column(i) / b[(i, i)].max(f64::MIN_POSITIVE).sqrt()).normalize();
        if axis.dot(&v) < 0.0 {
            axis = -axis;
        }
        return theta * axis;
    }
    (0.5 * theta / sin) * v
}

/// Closest rotation in the Frobenius sense (via SVD).
pub fn normalize_rotation(r: &Matrix3<f64>) -> Matrix3<f64> {
    let svd = r.svd(true, true);
    match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => {
            let mut rot = u * v_t;
            if rot.determinant() < 0.0 {
                let mut u_fixed = u;
                u_fixed.column_mut(2).neg_mut();
                rot = u_fixed * v_t;
            }
            rot
        }
        _ => Matrix3::identity(),
    }
}

/// Right Jacobian `Jr(φ)`.
pub fn right_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let w = skew(phi);
    if theta < EPS {
        return Matrix3::identity();
    }
    let t2 = theta * theta;
    Matrix3::identity() - w * ((1.0 - theta.cos()) / t2) + w * w * ((theta - theta.sin()) / (t2 * theta))
}

/// Inverse right Jacobian `Jr⁻¹(φ)`.
pub fn inverse_right_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let w = skew(phi);
    if theta < EPS {
        return Matrix3::identity();
    }
    let coeff = 1.0 / (theta * theta) - (1.0 + theta.cos()) / (2.0 * theta * theta.sin());
    Matrix3::identity() + 0.5 * w + coeff * w * w
}

/// Shortest rotation taking direction `from` onto direction `to`.
pub fn rotation_between(from: &Vector3<f64>, to: &Vector3<f64>) -> Matrix3<f64> {
    let a = from.normalize();
    let b = to.normalize();
    let axis = a.cross(&b);
    let sin = axis.norm();
    let cos = a.dot(&b);
    if sin < 1e-10 {
        if cos > 0.0 {
            return Matrix3::identity();
        }
        let helper = if a.x.abs() < 0.9 { Vector3::x() } else { Vector3::y() };
        let perp = a.cross(&helper).normalize();
        return exp(&(perp * std::f64::consts::PI));
    }
    exp(&(axis / sin * sin.atan2(cos)))
}
