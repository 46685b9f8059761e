//! Seeded consensus estimation of similarity transforms.
//!
//! Minimal two-point samples propose candidate similarities; the candidate
//! with the largest inlier support wins and is refit on all of its inliers
//! in closed form. The sampler is seeded by the caller, so a given match
//! set and seed always produce the same estimate.

use nalgebra::{Matrix2, Matrix3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Consensus sampling parameters.
#[derive(Debug, Clone, Copy)]
pub struct RansacParams {
    /// Number of minimal samples to draw
    pub iterations: usize,

    /// Inlier distance tolerance in pixels
    pub tolerance: f64,

    /// Seed for the sampler
    pub seed: u64,
}

/// A fitted similarity with its supporting correspondences.
#[derive(Debug, Clone)]
pub struct SimilarityEstimate {
    /// Homogeneous 3x3 similarity matrix mapping `src` points onto `dst`
    pub matrix: Matrix3<f64>,

    /// Indices of supporting correspondences
    pub inliers: Vec<usize>,

    /// Mean residual distance over the inliers, in pixels
    pub mean_residual: f64,
}

#[inline]
fn apply(m: &Matrix3<f64>, p: (f64, f64)) -> (f64, f64) {
    (
        m[(0, 0)] * p.0 + m[(0, 1)] * p.1 + m[(0, 2)],
        m[(1, 0)] * p.0 + m[(1, 1)] * p.1 + m[(1, 2)],
    )
}

/// Closed-form least-squares similarity (Umeyama) mapping `src` onto `dst`.
///
/// Returns `None` for fewer than two points or a degenerate (coincident)
/// source configuration.
pub fn fit_similarity(src: &[(f64, f64)], dst: &[(f64, f64)]) -> Option<Matrix3<f64>> {
    let n = src.len();
    if n < 2 || dst.len() != n {
        return None;
    }
    let nf = n as f64;

    let (mut sx, mut sy, mut dx, mut dy) = (0.0, 0.0, 0.0, 0.0);
    for i in 0..n {
        sx += src[i].0;
        sy += src[i].1;
        dx += dst[i].0;
        dy += dst[i].1;
    }
    let src_mean = (sx / nf, sy / nf);
    let dst_mean = (dx / nf, dy / nf);

    let mut src_var = 0.0;
    let mut cov = Matrix2::zeros();
    for i in 0..n {
        let s = (src[i].0 - src_mean.0, src[i].1 - src_mean.1);
        let d = (dst[i].0 - dst_mean.0, dst[i].1 - dst_mean.1);
        src_var += s.0 * s.0 + s.1 * s.1;
        cov[(0, 0)] += d.0 * s.0;
        cov[(0, 1)] += d.0 * s.1;
        cov[(1, 0)] += d.1 * s.0;
        cov[(1, 1)] += d.1 * s.1;
    }
    src_var /= nf;
    cov /= nf;

    if src_var < 1e-12 {
        return None;
    }

    let svd = cov.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return None;
    };

    // Reflection guard: similarities have det(R) = +1.
    let d = if u.determinant() * v_t.determinant() < 0.0 {
        -1.0
    } else {
        1.0
    };
    let correction = Matrix2::new(1.0, 0.0, 0.0, d);
    let rotation = u * correction * v_t;
    let scale = (svd.singular_values[0] + d * svd.singular_values[1]) / src_var;

    let sr = rotation * scale;
    let tx = dst_mean.0 - (sr[(0, 0)] * src_mean.0 + sr[(0, 1)] * src_mean.1);
    let ty = dst_mean.1 - (sr[(1, 0)] * src_mean.0 + sr[(1, 1)] * src_mean.1);

    Some(Matrix3::new(
        sr[(0, 0)],
        sr[(0, 1)],
        tx,
        sr[(1, 0)],
        sr[(1, 1)],
        ty,
        0.0,
        0.0,
        1.0,
    ))
}

fn inliers_of(matrix: &Matrix3<f64>, src: &[(f64, f64)], dst: &[(f64, f64)], tol: f64) -> Vec<usize> {
    let tol_sq = tol * tol;
    (0..src.len())
        .filter(|&i| {
            let (px, py) = apply(matrix, src[i]);
            let (ex, ey) = (px - dst[i].0, py - dst[i].1);
            ex * ex + ey * ey <= tol_sq
        })
        .collect()
}

/// Estimate a similarity from point correspondences by seeded consensus.
///
/// `src[i]` corresponds to `dst[i]`. Returns `None` when no sample produces
/// a model with at least two inliers.
pub fn estimate_similarity(
    src: &[(f64, f64)],
    dst: &[(f64, f64)],
    params: &RansacParams,
) -> Option<SimilarityEstimate> {
    let n = src.len();
    if n < 2 || dst.len() != n {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut best_inliers: Vec<usize> = Vec::new();
    let mut best_matrix: Option<Matrix3<f64>> = None;

    for _ in 0..params.iterations {
        let i = rng.gen_range(0..n);
        let j = loop {
            let j = rng.gen_range(0..n);
            if j != i {
                break j;
            }
        };

        let sample_src = [src[i], src[j]];
        let sample_dst = [dst[i], dst[j]];
        let Some(candidate) = fit_similarity(&sample_src, &sample_dst) else {
            continue;
        };

        let inliers = inliers_of(&candidate, src, dst, params.tolerance);
        if inliers.len() > best_inliers.len() {
            best_inliers = inliers;
            best_matrix = Some(candidate);
        }
    }

    let matrix = best_matrix?;
    if best_inliers.len() < 2 {
        return None;
    }

    // Refit on the full inlier set, then recompute support once.
    let inlier_src: Vec<(f64, f64)> = best_inliers.iter().map(|&i| src[i]).collect();
    let inlier_dst: Vec<(f64, f64)> = best_inliers.iter().map(|&i| dst[i]).collect();
    let refined = fit_similarity(&inlier_src, &inlier_dst).unwrap_or(matrix);
    let inliers = inliers_of(&refined, src, dst, params.tolerance);
    let inliers = if inliers.len() >= best_inliers.len() {
        inliers
    } else {
        best_inliers
    };

    let mean_residual = if inliers.is_empty() {
        f64::INFINITY
    } else {
        inliers
            .iter()
            .map(|&i| {
                let (px, py) = apply(&refined, src[i]);
                ((px - dst[i].0).powi(2) + (py - dst[i].1).powi(2)).sqrt()
            })
            .sum::<f64>()
            / inliers.len() as f64
    };

    Some(SimilarityEstimate {
        matrix: refined,
        inliers,
        mean_residual,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn true_transform() -> Matrix3<f64> {
        let (s, theta, tx, ty) = (1.2, 0.5, 15.0, -7.0);
        let (sin, cos) = f64::sin_cos(theta);
        Matrix3::new(
            s * cos,
            -s * sin,
            tx,
            s * sin,
            s * cos,
            ty,
            0.0,
            0.0,
            1.0,
        )
    }

    fn scattered_points(count: usize) -> Vec<(f64, f64)> {
        let mut rng = StdRng::seed_from_u64(7);
        (0..count)
            .map(|_| (rng.gen_range(0.0..200.0), rng.gen_range(0.0..150.0)))
            .collect()
    }

    #[test]
    fn test_fit_recovers_exact_similarity() {
        let truth = true_transform();
        let src = scattered_points(10);
        let dst: Vec<(f64, f64)> = src.iter().map(|&p| apply(&truth, p)).collect();

        let fitted = fit_similarity(&src, &dst).unwrap();
        for r in 0..2 {
            for c in 0..3 {
                assert_relative_eq!(fitted[(r, c)], truth[(r, c)], epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_fit_rejects_degenerate() {
        assert!(fit_similarity(&[(1.0, 1.0)], &[(2.0, 2.0)]).is_none());
        let same = vec![(5.0, 5.0); 4];
        let dst = vec![(1.0, 2.0), (3.0, 4.0), (5.0, 6.0), (7.0, 8.0)];
        assert!(fit_similarity(&same, &dst).is_none());
    }

    #[test]
    fn test_consensus_ignores_outliers() {
        let truth = true_transform();
        let src = scattered_points(30);
        let mut dst: Vec<(f64, f64)> = src.iter().map(|&p| apply(&truth, p)).collect();

        // Corrupt the last five correspondences.
        for (k, d) in dst.iter_mut().rev().take(5).enumerate() {
            d.0 += 50.0 + k as f64 * 13.0;
            d.1 -= 80.0;
        }

        let params = RansacParams {
            iterations: 200,
            tolerance: 2.0,
            seed: 42,
        };
        let estimate = estimate_similarity(&src, &dst, &params).unwrap();

        assert_eq!(estimate.inliers.len(), 25);
        assert!(estimate.inliers.iter().all(|&i| i < 25));
        assert!(estimate.mean_residual < 1e-6);
        for r in 0..2 {
            for c in 0..3 {
                assert_relative_eq!(estimate.matrix[(r, c)], truth[(r, c)], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_consensus_is_deterministic() {
        let truth = true_transform();
        let src = scattered_points(20);
        let dst: Vec<(f64, f64)> = src.iter().map(|&p| apply(&truth, p)).collect();
        let params = RansacParams {
            iterations: 100,
            tolerance: 3.0,
            seed: 11,
        };

        let a = estimate_similarity(&src, &dst, &params).unwrap();
        let b = estimate_similarity(&src, &dst, &params).unwrap();
        assert_eq!(a.inliers, b.inliers);
        assert_eq!(a.matrix, b.matrix);
    }

    #[test]
    fn test_consensus_requires_two_points() {
        let params = RansacParams {
            iterations: 10,
            tolerance: 3.0,
            seed: 1,
        };
        assert!(estimate_similarity(&[(0.0, 0.0)], &[(1.0, 1.0)], &params).is_none());
    }
}
