//! Rigid alignment: pairwise similarity estimation and tree composition.
//!
//! Each candidate pair is matched and fit independently at the shared
//! working resolution. Composition then walks the registration graph from
//! the reference outward, chaining child-to-parent similarities and
//! translating everything into a common non-negative canvas.

use std::collections::HashMap;

use nalgebra::Matrix3;

use crate::config::RegistrarConfig;
use crate::features::ransac::{self, RansacParams};
use crate::features::{match_descriptors, FeatureSet};
use crate::graph::RegistrationGraph;
use crate::transform::{CanvasInfo, RigidTransform};

// =============================================================================
// Pair Alignment
// =============================================================================

/// Outcome of aligning one candidate pair.
///
/// `transform` maps slide `b` working coordinates onto slide `a`; it is
/// `None` when matching produced too little consensus to trust. Inlier
/// coordinates are kept for diagnostics, descriptors are not.
#[derive(Debug, Clone)]
pub struct PairAlignment {
    pub a: usize,
    pub b: usize,

    /// Similarity mapping `b` onto `a` at working scale, if trusted
    pub transform: Option<Matrix3<f64>>,

    /// Ratio-test survivors before consensus
    pub match_count: usize,

    /// Consensus inliers supporting the transform
    pub inlier_count: usize,

    /// Mean inlier residual in working pixels
    pub mean_residual: f64,

    /// Inlier keypoint positions on slide `a`
    pub points_a: Vec<(f64, f64)>,

    /// Inlier keypoint positions on slide `b`, index-aligned with
    /// `points_a`
    pub points_b: Vec<(f64, f64)>,
}

impl PairAlignment {
    /// Edge quality for graph construction.
    pub fn quality(&self) -> f64 {
        self.inlier_count as f64
    }

    fn untrusted(a: usize, b: usize, match_count: usize) -> Self {
        Self {
            a,
            b,
            transform: None,
            match_count,
            inlier_count: 0,
            mean_residual: f64::INFINITY,
            points_a: Vec::new(),
            points_b: Vec::new(),
        }
    }
}

/// Match two feature sets and fit a similarity by seeded consensus.
///
/// The pair is untrusted (no transform) when fewer than
/// `config.min_matches` correspondences survive the ratio test, or when
/// consensus support stays below that same floor.
pub fn align_pair(
    a: usize,
    b: usize,
    features_a: &FeatureSet,
    features_b: &FeatureSet,
    config: &RegistrarConfig,
    seed: u64,
) -> PairAlignment {
    let matches = match_descriptors(features_a, features_b, config.match_ratio);
    let match_count = matches.len();
    if match_count < config.min_matches {
        return PairAlignment::untrusted(a, b, match_count);
    }

    let src: Vec<(f64, f64)> = matches.iter().map(|m| features_b.point(m.b)).collect();
    let dst: Vec<(f64, f64)> = matches.iter().map(|m| features_a.point(m.a)).collect();

    let params = RansacParams {
        iterations: config.ransac_iterations,
        tolerance: config.inlier_tolerance,
        seed,
    };
    let Some(estimate) = ransac::estimate_similarity(&src, &dst, &params) else {
        return PairAlignment::untrusted(a, b, match_count);
    };
    if estimate.inliers.len() < config.min_matches {
        return PairAlignment::untrusted(a, b, match_count);
    }

    let points_a = estimate.inliers.iter().map(|&i| dst[i]).collect();
    let points_b = estimate.inliers.iter().map(|&i| src[i]).collect();
    PairAlignment {
        a,
        b,
        transform: Some(estimate.matrix),
        match_count,
        inlier_count: estimate.inliers.len(),
        mean_residual: estimate.mean_residual,
        points_a,
        points_b,
    }
}

/// Deterministic per-pair seed derived from the run seed.
pub fn pair_seed(base: u64, a: usize, b: usize) -> u64 {
    base.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(((a as u64) << 32) | b as u64)
}

// =============================================================================
// Composition
// =============================================================================

/// Rigid transforms for all slides in one shared canvas.
#[derive(Debug, Clone)]
pub struct ComposedRigid {
    /// Per-slide transform into canvas coordinates, at working scale
    pub transforms: Vec<RigidTransform>,

    /// The canvas all transforms land in
    pub canvas: CanvasInfo,

    /// Slides whose pair produced no trusted transform and were placed
    /// with an identity relative to their parent
    pub low_confidence: Vec<bool>,
}

/// Chain pairwise similarities along the registration graph and shift the
/// result into a non-negative canvas.
///
/// `pairs` is keyed by the `(a, b)` of each [`PairAlignment`];
/// `working_dims` holds each slide's working-resolution size. The
/// reference keeps the identity (up to the final canvas shift), so
/// re-running composition on an already composed set changes nothing.
pub fn compose_into_canvas(
    graph: &RegistrationGraph,
    pairs: &HashMap<(usize, usize), PairAlignment>,
    working_dims: &[(u32, u32)],
    scale: f64,
) -> ComposedRigid {
    let n = graph.node_count();
    debug_assert_eq!(working_dims.len(), n);

    let mut raw: Vec<Matrix3<f64>> = vec![Matrix3::identity(); n];
    let mut low_confidence = vec![false; n];

    for &node in graph.compose_order() {
        let Some(parent) = graph.parent(node) else {
            continue;
        };
        let to_parent = child_to_parent(pairs, node, parent);
        match to_parent {
            Some(m) => raw[node] = raw[parent] * m,
            None => {
                raw[node] = raw[parent];
                low_confidence[node] = true;
            }
        }
    }

    // Union bounds of every transformed slide.
    let mut min_x = f64::INFINITY;
    let mut min_y = f64::INFINITY;
    let mut max_x = f64::NEG_INFINITY;
    let mut max_y = f64::NEG_INFINITY;
    for (i, &(w, h)) in working_dims.iter().enumerate() {
        let t = RigidTransform::new(raw[i], scale);
        let (x0, y0, x1, y1) = t.transformed_bounds(w, h);
        min_x = min_x.min(x0);
        min_y = min_y.min(y0);
        max_x = max_x.max(x1);
        max_y = max_y.max(y1);
    }

    let transforms: Vec<RigidTransform> = raw
        .into_iter()
        .map(|m| RigidTransform::new(m, scale).translated(-min_x, -min_y))
        .collect();
    let canvas = CanvasInfo {
        width: (max_x - min_x).ceil().max(1.0) as u32,
        height: (max_y - min_y).ceil().max(1.0) as u32,
        scale,
    };

    ComposedRigid {
        transforms,
        canvas,
        low_confidence,
    }
}

/// Child-to-parent similarity from the pair table, inverting the stored
/// direction when the pair was aligned the other way around.
fn child_to_parent(
    pairs: &HashMap<(usize, usize), PairAlignment>,
    child: usize,
    parent: usize,
) -> Option<Matrix3<f64>> {
    if let Some(pair) = pairs.get(&(parent, child)) {
        return pair.transform;
    }
    if let Some(pair) = pairs.get(&(child, parent)) {
        return pair.transform.and_then(|m| m.try_inverse());
    }
    None
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Descriptor, Keypoint};
    use approx::assert_relative_eq;

    fn config() -> RegistrarConfig {
        RegistrarConfig::default()
    }

    /// Feature set with unique descriptors at the given positions.
    fn features_at(points: &[(f64, f64)]) -> FeatureSet {
        let keypoints = points
            .iter()
            .map(|&(x, y)| Keypoint {
                x: x as f32,
                y: y as f32,
                response: 1.0,
                angle: 0.0,
            })
            .collect();
        let descriptors = (0..points.len())
            .map(|i| {
                let mut bytes = [0u8; 32];
                // Spread indices so pairwise distances are large.
                for (j, b) in bytes.iter_mut().enumerate() {
                    *b = ((i * 37 + j * 11) % 251) as u8;
                }
                Descriptor(bytes)
            })
            .collect();
        FeatureSet {
            keypoints,
            descriptors,
        }
    }

    fn apply(m: &Matrix3<f64>, p: (f64, f64)) -> (f64, f64) {
        (
            m[(0, 0)] * p.0 + m[(0, 1)] * p.1 + m[(0, 2)],
            m[(1, 0)] * p.0 + m[(1, 1)] * p.1 + m[(1, 2)],
        )
    }

    #[test]
    fn test_align_pair_recovers_translation() {
        let base: Vec<(f64, f64)> = (0..12)
            .map(|i| (10.0 + (i % 4) as f64 * 30.0, 15.0 + (i / 4) as f64 * 25.0))
            .collect();
        let shifted: Vec<(f64, f64)> = base.iter().map(|&(x, y)| (x + 20.0, y - 5.0)).collect();

        // a holds the shifted copy, so b -> a is the (+20, -5) shift.
        let features_a = features_at(&shifted);
        let features_b = features_at(&base);

        let pair = align_pair(0, 1, &features_a, &features_b, &config(), 42);
        assert_eq!(pair.match_count, 12);
        assert_eq!(pair.inlier_count, 12);
        let m = pair.transform.unwrap();
        let (x, y) = apply(&m, (50.0, 50.0));
        assert_relative_eq!(x, 70.0, epsilon = 1e-6);
        assert_relative_eq!(y, 45.0, epsilon = 1e-6);
        assert_eq!(pair.points_a.len(), 12);
        assert_eq!(pair.points_b.len(), 12);
    }

    #[test]
    fn test_align_pair_too_few_matches() {
        let features_a = features_at(&[(10.0, 10.0), (50.0, 20.0)]);
        let features_b = features_at(&[(12.0, 11.0), (52.0, 21.0)]);
        let pair = align_pair(0, 1, &features_a, &features_b, &config(), 42);
        assert!(pair.transform.is_none());
        assert_eq!(pair.inlier_count, 0);
    }

    #[test]
    fn test_pair_seed_is_stable_and_distinct() {
        assert_eq!(pair_seed(42, 0, 1), pair_seed(42, 0, 1));
        assert_ne!(pair_seed(42, 0, 1), pair_seed(42, 1, 0));
        assert_ne!(pair_seed(42, 0, 1), pair_seed(43, 0, 1));
    }

    fn translation_pair(a: usize, b: usize, dx: f64, dy: f64) -> PairAlignment {
        PairAlignment {
            a,
            b,
            transform: Some(Matrix3::new(
                1.0, 0.0, dx, //
                0.0, 1.0, dy, //
                0.0, 0.0, 1.0,
            )),
            match_count: 20,
            inlier_count: 20,
            mean_residual: 0.1,
            points_a: Vec::new(),
            points_b: Vec::new(),
        }
    }

    #[test]
    fn test_compose_two_slides() {
        let graph = RegistrationGraph::chain(2, Some(0));
        let mut pairs = HashMap::new();
        // Slide 1 sits 50px to the right of slide 0.
        pairs.insert((0, 1), translation_pair(0, 1, 50.0, 0.0));

        let composed =
            compose_into_canvas(&graph, &pairs, &[(100, 100), (100, 100)], 0.5);
        assert_eq!(composed.canvas.width, 150);
        assert_eq!(composed.canvas.height, 100);
        assert!(composed.transforms[0].is_identity(1e-9));
        assert_eq!(composed.transforms[1].translation(), (50.0, 0.0));
        assert!(!composed.low_confidence[0]);
        assert!(!composed.low_confidence[1]);
    }

    #[test]
    fn test_compose_inverts_reversed_pair() {
        let graph = RegistrationGraph::chain(2, Some(0));
        let mut pairs = HashMap::new();
        // Stored direction maps 0 onto 1; composition needs 1 onto 0.
        pairs.insert((1, 0), translation_pair(1, 0, 50.0, 0.0));

        let composed =
            compose_into_canvas(&graph, &pairs, &[(100, 100), (100, 100)], 0.5);
        // Slide 1 lands at -50, the canvas shift moves everything right.
        assert_eq!(composed.canvas.width, 150);
        assert_eq!(composed.transforms[0].translation(), (50.0, 0.0));
        assert_eq!(composed.transforms[1].translation(), (0.0, 0.0));
    }

    #[test]
    fn test_compose_chains_through_tree() {
        let graph = RegistrationGraph::chain(3, Some(0));
        let mut pairs = HashMap::new();
        pairs.insert((0, 1), translation_pair(0, 1, 10.0, 0.0));
        pairs.insert((1, 2), translation_pair(1, 2, 0.0, 20.0));

        let composed = compose_into_canvas(
            &graph,
            &pairs,
            &[(50, 50), (50, 50), (50, 50)],
            1.0,
        );
        // Slide 2 composes both steps: (+10, 0) then (0, +20).
        assert_eq!(composed.transforms[2].translation(), (10.0, 20.0));
        assert_eq!(composed.canvas.width, 60);
        assert_eq!(composed.canvas.height, 70);
    }

    #[test]
    fn test_compose_untrusted_pair_flags_child() {
        let graph = RegistrationGraph::chain(3, Some(0));
        let mut pairs = HashMap::new();
        pairs.insert((0, 1), translation_pair(0, 1, 10.0, 0.0));
        pairs.insert(
            (1, 2),
            PairAlignment::untrusted(1, 2, 1),
        );

        let composed = compose_into_canvas(
            &graph,
            &pairs,
            &[(50, 50), (50, 50), (50, 50)],
            1.0,
        );
        assert!(composed.low_confidence[2]);
        assert!(!composed.low_confidence[1]);
        // Child inherits its parent's placement.
        assert_eq!(
            composed.transforms[2].translation(),
            composed.transforms[1].translation()
        );
    }

    #[test]
    fn test_compose_is_idempotent_for_reference() {
        // Composing twice from the same pair table yields the same result.
        let graph = RegistrationGraph::chain(2, Some(0));
        let mut pairs = HashMap::new();
        pairs.insert((0, 1), translation_pair(0, 1, -30.0, -40.0));

        let first = compose_into_canvas(&graph, &pairs, &[(80, 80), (80, 80)], 1.0);
        let second = compose_into_canvas(&graph, &pairs, &[(80, 80), (80, 80)], 1.0);
        for (a, b) in first.transforms.iter().zip(&second.transforms) {
            assert_eq!(a.matrix(), b.matrix());
        }
        assert_eq!(first.canvas, second.canvas);
    }
}
