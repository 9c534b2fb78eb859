//! Two-view linear triangulation.

use nalgebra::{Matrix3x4, Matrix4, Vector3};

use super::SE3;

fn projection(t_cw: &SE3) -> Matrix3x4<f64> {
    let mut p = Matrix3x4::zeros();
    p.fixed_view_mut::<3, 3>(0, 0).copy_from(&t_cw.rotation_matrix());
    p.fixed_view_mut::<3, 1>(0, 3).copy_from(&t_cw.translation);
    p
}

/// Triangulate from normalized bearings (z = 1) and world-to-camera poses.
///
/// Solves the homogeneous DLT system with an SVD and returns the world point,
/// or `None` when the solution lies at infinity.
pub fn triangulate_dlt(
    xn1: &Vector3<f64>,
    xn2: &Vector3<f64>,
    t1_cw: &SE3,
    t2_cw: &SE3,
) -> Option<Vector3<f64>> {
    let p1 = projection(t1_cw);
    let p2 = projection(t2_cw);

    let mut a = Matrix4::zeros();
    a.row_mut(0).copy_from(&(xn1.x * p1.row(2) - p1.row(0)));
    a.row_mut(1).copy_from(&(xn1.y * p1.row(2) - p1.row(1)));
    a.row_mut(2).copy_from(&(xn2.x * p2.row(2) - p2.row(0)));
    a.row_mut(3).copy_from(&(xn2.y * p2.row(2) - p2.row(1)));

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let x = v_t.row(svd.singular_values.imin());
    if x[3].abs() < 1e-12 {
        return None;
    }
    let point = Vector3::new(x[0] / x[3], x[1] / x[3], x[2] / x[3]);
    point.iter().all(|v| v.is_finite()).then_some(point)
}

/// Cosine of the angle between the two viewing rays of `point`.
pub fn parallax_cos(point: &Vector3<f64>, center1: &Vector3<f64>, center2: &Vector3<f64>) -> f64 {
    let r1 = point - center1;
    let r2 = point - center2;
    let denom = r1.norm() * r2.norm();
    if denom < 1e-12 {
        return 1.0;
    }
    r1.dot(&r2) / denom
}
