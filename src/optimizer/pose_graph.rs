//! Essential graph optimization for loop closing.
//!
//! Vertices are KeyFrame similarities `S_iw`; edges are relative Sim3
//! constraints from the spanning tree, strong covisibility, past loop and
//! merge edges and the new loop connections. Scale is a free parameter for
//! monocular maps (7-DoF) and fixed otherwise (6-DoF). The map origin is the
//! gauge anchor.
//!
//! This module uses the three-phase pattern:
//! 1. COLLECT: Extract poses and edges from the map
//! 2. SOLVE: Run LM optimization without locks
//! 3. APPLY: Write back optimized poses and correct MapPoints

use std::collections::{HashMap, HashSet};

use nalgebra::{DMatrix, DVector, SMatrix, SVector};
use tracing::debug;

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::error::{Result, SlamError};
use crate::features::ScalePyramid;
use crate::geometry::Sim3;

use super::{LAMBDA_DOWN, LAMBDA_INIT, LAMBDA_MAX, LAMBDA_MIN, LAMBDA_UP};

type Vector7 = SVector<f64, 7>;
type Matrix7 = SMatrix<f64, 7, 7>;

/// Type of pose graph edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeType {
    SpanningTree,
    Covisibility,
    Loop,
    Merge,
    /// Created by the loop being corrected.
    NewLoop,
}

#[derive(Debug, Clone)]
pub struct PoseGraphEdge {
    /// Vertex indices.
    pub i: usize,
    pub j: usize,
    /// Relative similarity `S_ji = S_jw · S_iw⁻¹`.
    pub measurement: Sim3,
    pub edge_type: EdgeType,
}

#[derive(Debug, Clone)]
pub struct PoseGraphProblem {
    pub keyframes: Vec<KeyFrameId>,
    /// Initial `S_iw`, already corrected for the loop group.
    pub initial: Vec<Sim3>,
    pub fixed: Vec<bool>,
    pub edges: Vec<PoseGraphEdge>,
    pub fix_scale: bool,
}

/// Relative similarity from vertex `i` to vertex `j`.
fn relative(s_iw: &Sim3, s_jw: &Sim3) -> Sim3 {
    s_jw.compose(&s_iw.inverse())
}

impl PoseGraphProblem {
    /// Build the essential graph of `map`.
    ///
    /// `corrected` holds the loop-corrected `S_iw` of the current KeyFrame's
    /// group and `non_corrected` their poses before correction; relative
    /// constraints are measured on the uncorrected geometry so that the loop
    /// error is spread along the graph. `loop_connections` are the new
    /// covisibility links created by fusing the loop points; `loop_pair` is
    /// the (current, matched) KeyFrame pair, always kept regardless of weight.
    pub fn collect(
        map: &Map,
        corrected: &HashMap<KeyFrameId, Sim3>,
        non_corrected: &HashMap<KeyFrameId, Sim3>,
        loop_connections: &HashMap<KeyFrameId, HashSet<KeyFrameId>>,
        loop_pair: Option<(KeyFrameId, KeyFrameId)>,
        min_weight: usize,
        fix_scale: bool,
    ) -> Option<Self> {
        let keyframes = map.keyframe_ids();
        if keyframes.len() < 2 {
            return None;
        }
        let index: HashMap<KeyFrameId, usize> = keyframes.iter().enumerate().map(|(n, id)| (*id, n)).collect();
        let origin = map.origin_keyframe();

        let mut initial = Vec::with_capacity(keyframes.len());
        let mut basis = Vec::with_capacity(keyframes.len());
        let mut fixed = Vec::with_capacity(keyframes.len());
        for id in &keyframes {
            let kf = map.get_keyframe(*id)?;
            let current = Sim3::from_se3(&kf.pose_cw());
            initial.push(corrected.get(id).copied().unwrap_or(current));
            basis.push(non_corrected.get(id).copied().unwrap_or(current));
            fixed.push(Some(*id) == origin);
        }
        if !fixed.iter().any(|f| *f) {
            fixed[0] = true;
        }

        let mut edges = Vec::new();
        let mut inserted: HashSet<(usize, usize)> = HashSet::new();
        let mut push = |edges: &mut Vec<PoseGraphEdge>, i: usize, j: usize, measurement: Sim3, edge_type: EdgeType| {
            if i == j || !inserted.insert((i.min(j), i.max(j))) {
                return;
            }
            edges.push(PoseGraphEdge {
                i,
                j,
                measurement,
                edge_type,
            });
        };

        // New loop links are measured on the corrected poses.
        let mut connections: Vec<(&KeyFrameId, &HashSet<KeyFrameId>)> = loop_connections.iter().collect();
        connections.sort_by_key(|(k, _)| **k);
        for (kf_id, linked) in connections {
            let (Some(&i), Some(kf)) = (index.get(kf_id), map.get_keyframe(*kf_id)) else {
                continue;
            };
            let mut linked: Vec<KeyFrameId> = linked.iter().copied().collect();
            linked.sort();
            for other in linked {
                let Some(&j) = index.get(&other) else {
                    continue;
                };
                let is_loop_pair = loop_pair == Some((*kf_id, other)) || loop_pair == Some((other, *kf_id));
                if !is_loop_pair && kf.get_covisibility_weight(other) < min_weight {
                    continue;
                }
                push(&mut edges, i, j, relative(&initial[i], &initial[j]), EdgeType::NewLoop);
            }
        }

        for (i, id) in keyframes.iter().enumerate() {
            let kf = map.get_keyframe(*id)?;
            if let Some(&j) = kf.parent_id.as_ref().and_then(|p| index.get(p)) {
                push(&mut edges, i, j, relative(&basis[i], &basis[j]), EdgeType::SpanningTree);
            }
            let mut loops: Vec<KeyFrameId> = kf.loop_edges.iter().copied().collect();
            loops.sort();
            for other in loops {
                if let Some(&j) = index.get(&other) {
                    push(&mut edges, i, j, relative(&basis[i], &basis[j]), EdgeType::Loop);
                }
            }
            let mut merges: Vec<KeyFrameId> = kf.merge_edges.iter().copied().collect();
            merges.sort();
            for other in merges {
                if let Some(&j) = index.get(&other) {
                    push(&mut edges, i, j, relative(&basis[i], &basis[j]), EdgeType::Merge);
                }
            }
        }
        // Covisibility only fills pairs not already linked by the tree or a loop.
        for (i, id) in keyframes.iter().enumerate() {
            let kf = map.get_keyframe(*id)?;
            for other in kf.get_covisibles_above_weight(min_weight) {
                if let Some(&j) = index.get(&other) {
                    push(&mut edges, i, j, relative(&basis[i], &basis[j]), EdgeType::Covisibility);
                }
            }
        }

        Some(Self {
            keyframes,
            initial,
            fixed,
            edges,
            fix_scale,
        })
    }

    fn dof(&self) -> usize {
        if self.fix_scale {
            6
        } else {
            7
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoseGraphSolution {
    /// Optimized `S_iw`, index-aligned with `PoseGraphProblem::keyframes`.
    pub poses: Vec<Sim3>,
    pub iterations: usize,
    pub initial_error: f64,
    pub final_error: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Solve
// ─────────────────────────────────────────────────────────────────────────────

fn log7(s: &Sim3) -> Vector7 {
    Vector7::from_column_slice(&s.log())
}

fn retract(s: &Sim3, delta: &[f64], dof: usize) -> Sim3 {
    let mut v = [0.0; 7];
    v[..dof].copy_from_slice(&delta[..dof]);
    Sim3::exp(&v).compose(s)
}

fn edge_residual(edge: &PoseGraphEdge, s_iw: &Sim3, s_jw: &Sim3) -> Vector7 {
    log7(&edge.measurement.compose(s_iw).compose(&s_jw.inverse()))
}

fn total_error(problem: &PoseGraphProblem, poses: &[Sim3]) -> f64 {
    problem
        .edges
        .iter()
        .map(|e| edge_residual(e, &poses[e.i], &poses[e.j]).norm_squared())
        .sum()
}

/// Forward-difference Jacobian of an edge residual with respect to one endpoint.
fn numeric_jacobian(edge: &PoseGraphEdge, poses: &[Sim3], wrt_i: bool, dof: usize) -> Matrix7 {
    const H: f64 = 1e-7;
    let r0 = edge_residual(edge, &poses[edge.i], &poses[edge.j]);
    let mut j = Matrix7::zeros();
    for k in 0..dof {
        let mut d = [0.0; 7];
        d[k] = H;
        let r = if wrt_i {
            edge_residual(edge, &retract(&poses[edge.i], &d, dof), &poses[edge.j])
        } else {
            edge_residual(edge, &poses[edge.i], &retract(&poses[edge.j], &d, dof))
        };
        j.set_column(k, &((r - r0) / H));
    }
    j
}

/// Optimize the essential graph. `Ok(None)` when `should_stop` fired.
pub fn solve(
    problem: &PoseGraphProblem,
    max_iterations: usize,
    should_stop: &dyn Fn() -> bool,
) -> Result<Option<PoseGraphSolution>> {
    let dof = problem.dof();
    let mut param = Vec::with_capacity(problem.keyframes.len());
    let mut n_free = 0;
    for fixed in &problem.fixed {
        if *fixed {
            param.push(None);
        } else {
            param.push(Some(n_free));
            n_free += 1;
        }
    }

    let mut poses = problem.initial.clone();
    let initial_error = total_error(problem, &poses);
    if !initial_error.is_finite() {
        return Err(SlamError::OptimizationDivergence("pose graph error is not finite".into()));
    }
    let mut error = initial_error;
    let n = n_free * dof;
    if n == 0 || problem.edges.is_empty() {
        return Ok(Some(PoseGraphSolution {
            poses,
            iterations: 0,
            initial_error,
            final_error: error,
        }));
    }

    let mut lambda = LAMBDA_INIT;
    let mut iterations = 0;
    for _ in 0..max_iterations {
        if should_stop() {
            return Ok(None);
        }
        iterations += 1;

        let mut h = DMatrix::<f64>::zeros(n, n);
        let mut b = DVector::<f64>::zeros(n);
        for edge in &problem.edges {
            let r = edge_residual(edge, &poses[edge.i], &poses[edge.j]);
            let blocks = [
                (param[edge.i], numeric_jacobian(edge, &poses, true, dof)),
                (param[edge.j], numeric_jacobian(edge, &poses, false, dof)),
            ];
            for (pa, ja) in &blocks {
                let Some(a) = pa else {
                    continue;
                };
                let ja = ja.columns(0, dof);
                let mut rhs = b.rows_mut(a * dof, dof);
                rhs -= ja.transpose() * r;
                for (pb, jb) in &blocks {
                    let Some(bb) = pb else {
                        continue;
                    };
                    let jb = jb.columns(0, dof);
                    let mut block = h.view_mut((a * dof, bb * dof), (dof, dof));
                    block += ja.transpose() * jb;
                }
            }
        }

        for i in 0..n {
            h[(i, i)] += lambda * h[(i, i)].max(1e-6);
        }
        let delta = match h.clone().cholesky() {
            Some(c) => c.solve(&b),
            None => match h.lu().solve(&b) {
                Some(d) => d,
                None => {
                    lambda = (lambda * LAMBDA_UP).min(LAMBDA_MAX);
                    continue;
                }
            },
        };

        let candidate: Vec<Sim3> = poses
            .iter()
            .zip(&param)
            .map(|(s, p)| match p {
                Some(k) => {
                    let d: Vec<f64> = delta.rows(k * dof, dof).iter().copied().collect();
                    retract(s, &d, dof)
                }
                None => *s,
            })
            .collect();
        let new_error = total_error(problem, &candidate);
        if new_error.is_finite() && new_error < error {
            let relative = (error - new_error) / error.max(1e-12);
            poses = candidate;
            error = new_error;
            lambda = (lambda * LAMBDA_DOWN).max(LAMBDA_MIN);
            if relative < 1e-8 {
                break;
            }
        } else {
            lambda *= LAMBDA_UP;
            if lambda > LAMBDA_MAX {
                break;
            }
        }
    }

    if poses.iter().any(|s| !(s.scale.is_finite() && s.scale > 0.0)) {
        return Err(SlamError::OptimizationDivergence("pose graph produced an invalid scale".into()));
    }
    debug!(
        "[PoseGraph] {} vertices, {} edges: error {:.4} -> {:.4} in {} iterations",
        problem.keyframes.len(),
        problem.edges.len(),
        initial_error,
        error,
        iterations
    );
    Ok(Some(PoseGraphSolution {
        poses,
        iterations,
        initial_error,
        final_error: error,
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Apply
// ─────────────────────────────────────────────────────────────────────────────

/// Write the optimized poses back and move every MapPoint with its
/// reference KeyFrame. Returns the number of updated KeyFrames.
pub fn apply(map: &mut Map, problem: &PoseGraphProblem, solution: &PoseGraphSolution, pyramid: &ScalePyramid) -> usize {
    // Per KeyFrame: (S_iw before, S_wi after).
    let mut corrections: HashMap<KeyFrameId, (Sim3, Sim3)> = HashMap::new();
    let mut updated = 0;
    for ((id, before), after) in problem.keyframes.iter().zip(&problem.initial).zip(&solution.poses) {
        let Some(kf) = map.get_keyframe_mut(*id) else {
            continue;
        };
        kf.pose = after.to_se3_unscaled().inverse();
        kf.velocity /= after.scale;
        corrections.insert(*id, (*before, after.inverse()));
        updated += 1;
    }

    let point_ids: Vec<MapPointId> = map.map_points().map(|m| m.id).collect();
    for mp_id in point_ids {
        let Some(mp) = map.get_map_point_mut(mp_id) else {
            continue;
        };
        if let Some((s_rw, s_wr)) = corrections.get(&mp.reference_kf) {
            mp.position = s_wr.transform_point(&s_rw.transform_point(&mp.position));
        }
        map.update_map_point(mp_id, pyramid);
    }
    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    /// Camera poses on a circle, returned as `S_iw`.
    fn ring(n: usize) -> Vec<Sim3> {
        (0..n)
            .map(|k| {
                let a = k as f64 * std::f64::consts::TAU / n as f64;
                let center = Vector3::new(3.0 * a.cos(), 0.0, 3.0 * a.sin());
                let rot = UnitQuaternion::from_euler_angles(0.0, -a, 0.0);
                Sim3::new(rot, center, 1.0).inverse()
            })
            .collect()
    }

    fn problem_with_drift(fix_scale: bool) -> (PoseGraphProblem, Vec<Sim3>) {
        let truth = ring(8);
        let mut edges = Vec::new();
        for k in 0..truth.len() {
            let next = (k + 1) % truth.len();
            edges.push(PoseGraphEdge {
                i: k,
                j: next,
                measurement: relative(&truth[k], &truth[next]),
                edge_type: if next == 0 { EdgeType::NewLoop } else { EdgeType::SpanningTree },
            });
        }
        // Odometry drift grows along the ring.
        let initial: Vec<Sim3> = truth
            .iter()
            .enumerate()
            .map(|(k, s)| {
                let drift = Sim3::new(
                    UnitQuaternion::from_euler_angles(0.0, 0.01 * k as f64, 0.0),
                    Vector3::new(0.05 * k as f64, 0.0, 0.0),
                    if fix_scale { 1.0 } else { 1.0 + 0.02 * k as f64 },
                );
                drift.compose(s)
            })
            .collect();
        let mut fixed = vec![false; truth.len()];
        fixed[0] = true;
        let problem = PoseGraphProblem {
            keyframes: (0..truth.len() as u64).map(KeyFrameId::new).collect(),
            initial,
            fixed,
            edges,
            fix_scale,
        };
        (problem, truth)
    }

    #[test]
    fn test_loop_edge_removes_drift_6dof() {
        let (problem, truth) = problem_with_drift(true);
        let solution = solve(&problem, 30, &|| false).unwrap().unwrap();
        assert!(solution.final_error < solution.initial_error * 1e-4);
        for (s, t) in solution.poses.iter().zip(&truth) {
            assert_relative_eq!(s.translation, t.translation, epsilon = 1e-3);
            assert_relative_eq!(s.scale, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_scale_drift_corrected_7dof() {
        let (problem, truth) = problem_with_drift(false);
        let solution = solve(&problem, 50, &|| false).unwrap().unwrap();
        for (s, t) in solution.poses.iter().zip(&truth) {
            assert_relative_eq!(s.scale, t.scale, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_stop_request_aborts() {
        let (problem, _) = problem_with_drift(true);
        assert!(solve(&problem, 30, &|| true).unwrap().is_none());
    }

    #[test]
    fn test_tree_and_loop_edges_win_over_covisibility() {
        let scene = crate::system::test_support::SyntheticScene::new(12, 150);
        let (mut map, kfs) = scene.build_map(&[0.0, 0.15, 0.3, 0.45]);
        map.add_loop_edge(kfs[0], kfs[2]);
        let problem =
            PoseGraphProblem::collect(&map, &HashMap::new(), &HashMap::new(), &HashMap::new(), None, 1, true).unwrap();
        let index = |id: KeyFrameId| problem.keyframes.iter().position(|k| *k == id).unwrap();
        let edge_type = |a: usize, b: usize| {
            problem
                .edges
                .iter()
                .find(|e| (e.i, e.j) == (a, b) || (e.i, e.j) == (b, a))
                .map(|e| e.edge_type)
        };

        for id in &kfs {
            if let Some(parent) = map.get_keyframe(*id).unwrap().parent_id {
                assert_eq!(edge_type(index(*id), index(parent)), Some(EdgeType::SpanningTree));
            }
        }
        assert_eq!(edge_type(index(kfs[0]), index(kfs[2])), Some(EdgeType::Loop));

        let mut pairs = HashSet::new();
        for e in &problem.edges {
            assert!(pairs.insert((e.i.min(e.j), e.i.max(e.j))));
        }
    }

    #[test]
    fn test_apply_moves_points_with_reference_keyframe() {
        let scene = crate::system::test_support::SyntheticScene::new(11, 120);
        let (mut map, kfs) = scene.build_map(&[0.0, 0.3, 0.6]);
        let problem = PoseGraphProblem::collect(
            &map,
            &HashMap::new(),
            &HashMap::new(),
            &HashMap::new(),
            None,
            100,
            true,
        )
        .unwrap();
        assert!(problem.edges.iter().any(|e| e.edge_type == EdgeType::SpanningTree));

        // Shift every non-origin KeyFrame by the same amount.
        let shift = Sim3::new(UnitQuaternion::identity(), Vector3::new(0.0, 0.2, 0.0), 1.0);
        let poses: Vec<Sim3> = problem
            .initial
            .iter()
            .zip(&problem.fixed)
            .map(|(s, f)| if *f { *s } else { s.compose(&shift.inverse()) })
            .collect();
        let solution = PoseGraphSolution {
            poses,
            iterations: 0,
            initial_error: 0.0,
            final_error: 0.0,
        };
        let mp = map.map_points().find(|m| m.reference_kf == kfs[1]).map(|m| (m.id, m.position));
        apply(&mut map, &problem, &solution, &scene.pyramid);
        if let Some((id, before)) = mp {
            let after = map.get_map_point(id).unwrap().position;
            assert_relative_eq!(after, before + Vector3::new(0.0, 0.2, 0.0), epsilon = 1e-9);
        }
    }
}
