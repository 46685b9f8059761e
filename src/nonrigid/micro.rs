//! Feature-driven refinement for high-resolution passes.

use crate::config::RegistrarConfig;
use crate::features::{extract_features, match_descriptors};
use crate::raster::WorkingImage;
use crate::transform::DisplacementField;

use super::{warp_working, AlignedPair, NonRigidRefiner, Refinement};

/// Fewer matched samples than this and the refiner reports a zero field
/// rather than extrapolating from noise.
const MIN_SAMPLES: usize = 8;

/// Control grid spacing in pixels for scattered interpolation.
const GRID_STEP: u32 = 8;

/// A sparse displacement sample: where a matched feature sits in the
/// fixed image and how far its counterpart moved.
#[derive(Debug, Clone, Copy)]
struct FlowSample {
    x: f64,
    y: f64,
    dx: f64,
    dy: f64,
}

/// Residual estimation from dense local feature matches.
///
/// Instead of intensity gradients, this refiner detects corners in both
/// images, matches their descriptors, and interpolates the matched
/// displacements into a smooth field. At high resolution the tissue
/// texture carries far more corners than the base working images do,
/// which is what makes this the engine behind the micro pass.
#[derive(Debug, Clone)]
pub struct MicroFeatureRefiner {
    max_features: usize,
    match_ratio: f64,
    smooth_sigma: f64,
}

impl MicroFeatureRefiner {
    pub fn new(max_features: usize, match_ratio: f64, smooth_sigma: f64) -> Self {
        Self {
            max_features: max_features.max(MIN_SAMPLES),
            match_ratio,
            smooth_sigma,
        }
    }

    pub fn from_config(config: &RegistrarConfig) -> Self {
        Self::new(
            config.max_features,
            config.match_ratio,
            config.flow_smooth_sigma,
        )
    }

    /// Matched feature displacements in fixed-image coordinates.
    fn collect_samples(&self, fixed: &WorkingImage, moving: &WorkingImage) -> Vec<FlowSample> {
        let fixed_set = extract_features(fixed, self.max_features);
        let moving_set = extract_features(moving, self.max_features);
        let matches = match_descriptors(&fixed_set, &moving_set, self.match_ratio);

        matches
            .iter()
            .map(|m| {
                let (fx, fy) = fixed_set.point(m.a);
                let (mx, my) = moving_set.point(m.b);
                FlowSample {
                    x: fx,
                    y: fy,
                    dx: mx - fx,
                    dy: my - fy,
                }
            })
            .collect()
    }
}

/// Component-wise median of a sample list through `select`.
fn median_of(samples: &[FlowSample], select: impl Fn(&FlowSample) -> f64) -> f64 {
    let mut values: Vec<f64> = samples.iter().map(select).collect();
    values.sort_unstable_by(|a, b| a.total_cmp(b));
    values[values.len() / 2]
}

/// Discard samples that disagree with the bulk of the matches. Deviation
/// beyond three median absolute deviations (floored at one pixel) from
/// the component median marks a mismatch.
fn reject_outliers(samples: Vec<FlowSample>) -> Vec<FlowSample> {
    if samples.len() < MIN_SAMPLES {
        return samples;
    }
    let med_dx = median_of(&samples, |s| s.dx);
    let med_dy = median_of(&samples, |s| s.dy);
    let mad_dx = median_of(&samples, |s| (s.dx - med_dx).abs()).max(1.0);
    let mad_dy = median_of(&samples, |s| (s.dy - med_dy).abs()).max(1.0);

    samples
        .into_iter()
        .filter(|s| (s.dx - med_dx).abs() <= 3.0 * mad_dx && (s.dy - med_dy).abs() <= 3.0 * mad_dy)
        .collect()
}

/// Gaussian-weighted scattered interpolation of the samples onto a
/// coarse control grid, bilinearly expanded to the full grid. Cells far
/// from every sample fall back to the median displacement.
fn interpolate_field(
    samples: &[FlowSample],
    width: u32,
    height: u32,
    scale: f64,
) -> DisplacementField {
    let grid_w = (width + GRID_STEP - 1) / GRID_STEP;
    let grid_h = (height + GRID_STEP - 1) / GRID_STEP;

    // Kernel wide enough to bridge the typical gap between features.
    let spacing = ((width as f64 * height as f64) / samples.len() as f64).sqrt();
    let sigma = (2.0 * spacing).max(4.0);
    let inv_two_sigma_sq = 1.0 / (2.0 * sigma * sigma);

    let med_dx = median_of(samples, |s| s.dx);
    let med_dy = median_of(samples, |s| s.dy);

    let mut coarse_dx = vec![0.0f64; (grid_w * grid_h) as usize];
    let mut coarse_dy = vec![0.0f64; (grid_w * grid_h) as usize];
    for gy in 0..grid_h {
        let cy = (gy as f64 + 0.5) * GRID_STEP as f64;
        for gx in 0..grid_w {
            let cx = (gx as f64 + 0.5) * GRID_STEP as f64;
            let mut sum_w = 0.0;
            let mut sum_dx = 0.0;
            let mut sum_dy = 0.0;
            for s in samples {
                let d2 = (s.x - cx).powi(2) + (s.y - cy).powi(2);
                let w = (-d2 * inv_two_sigma_sq).exp();
                sum_w += w;
                sum_dx += w * s.dx;
                sum_dy += w * s.dy;
            }
            let idx = (gy * grid_w + gx) as usize;
            if sum_w > 1e-9 {
                coarse_dx[idx] = sum_dx / sum_w;
                coarse_dy[idx] = sum_dy / sum_w;
            } else {
                coarse_dx[idx] = med_dx;
                coarse_dy[idx] = med_dy;
            }
        }
    }

    // Expand control values bilinearly; displacements are already in
    // full-grid pixel units so only positions rescale.
    let mut field = DisplacementField::zeros(width, height, scale);
    let lookup = |gx: i64, gy: i64| -> (f64, f64) {
        let gx = gx.clamp(0, grid_w as i64 - 1) as u32;
        let gy = gy.clamp(0, grid_h as i64 - 1) as u32;
        let idx = (gy * grid_w + gx) as usize;
        (coarse_dx[idx], coarse_dy[idx])
    };
    for y in 0..height {
        let gy = (y as f64 + 0.5) / GRID_STEP as f64 - 0.5;
        let y0 = gy.floor();
        let fy = gy - y0;
        for x in 0..width {
            let gx = (x as f64 + 0.5) / GRID_STEP as f64 - 0.5;
            let x0 = gx.floor();
            let fx = gx - x0;
            let (d00x, d00y) = lookup(x0 as i64, y0 as i64);
            let (d10x, d10y) = lookup(x0 as i64 + 1, y0 as i64);
            let (d01x, d01y) = lookup(x0 as i64, y0 as i64 + 1);
            let (d11x, d11y) = lookup(x0 as i64 + 1, y0 as i64 + 1);
            let top_x = d00x + (d10x - d00x) * fx;
            let bot_x = d01x + (d11x - d01x) * fx;
            let top_y = d00y + (d10y - d00y) * fx;
            let bot_y = d01y + (d11y - d01y) * fx;
            field.set(
                x,
                y,
                (top_x + (bot_x - top_x) * fy) as f32,
                (top_y + (bot_y - top_y) * fy) as f32,
            );
        }
    }
    field
}

impl NonRigidRefiner for MicroFeatureRefiner {
    fn refine(&self, pair: &AlignedPair) -> Refinement {
        let residual_before = pair.fixed.mean_abs_diff(&pair.moving);
        let (w, h) = (pair.fixed.width(), pair.fixed.height());

        let samples = reject_outliers(self.collect_samples(&pair.fixed, &pair.moving));
        if samples.len() < MIN_SAMPLES {
            // Too little agreement to trust: report the unchanged pair.
            return Refinement {
                field: DisplacementField::zeros(w, h, pair.scale),
                residual_before,
                residual_after: residual_before,
            };
        }

        let field = interpolate_field(&samples, w, h, pair.scale).smoothed(self.smooth_sigma);
        let warped = warp_working(&pair.moving, &field);
        let residual_after = pair.fixed.mean_abs_diff(&warped);
        Refinement {
            field,
            residual_before,
            residual_after,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Deterministic block-noise texture. Shifting `shift_x` slides the
    /// block pattern right without changing its content.
    fn block_noise(width: u32, height: u32, shift_x: f64) -> WorkingImage {
        WorkingImage::from_fn(width, height, |x, y| {
            let bx = ((x as f64 - shift_x) / 8.0).floor();
            let by = (y as f64 / 8.0).floor();
            let v = ((bx * 12.9898 + by * 78.233).sin() * 43758.5453).fract().abs();
            (v * 0.8 + 0.1) as f32
        })
    }

    fn pair(fixed: WorkingImage, moving: WorkingImage) -> AlignedPair {
        AlignedPair {
            fixed: Arc::new(fixed),
            moving: Arc::new(moving),
            scale: 1.0,
        }
    }

    #[test]
    fn test_recovers_block_translation() {
        let fixed = block_noise(96, 96, 0.0);
        let moving = block_noise(96, 96, 4.0);
        let refiner = MicroFeatureRefiner::new(300, 0.8, 1.0);
        let result = refiner.refine(&pair(fixed, moving));

        assert!(!result.diverged());
        assert!(
            result.residual_after < result.residual_before * 0.7,
            "residual {} -> {}",
            result.residual_before,
            result.residual_after
        );
        let (dx, dy) = result.field.sample(48.0, 48.0);
        assert!((dx - 4.0).abs() < 1.5, "dx = {dx}");
        assert!(dy.abs() < 1.5, "dy = {dy}");
    }

    #[test]
    fn test_flat_images_produce_zero_field() {
        let flat = WorkingImage::from_fn(64, 64, |_, _| 0.5);
        let refiner = MicroFeatureRefiner::new(200, 0.8, 1.0);
        let result = refiner.refine(&pair(flat.clone(), flat));

        assert!(result.field.max_magnitude() < 1e-9);
        assert!(!result.diverged());
    }

    #[test]
    fn test_refine_is_deterministic() {
        let fixed = block_noise(80, 80, 0.0);
        let moving = block_noise(80, 80, 3.0);
        let refiner = MicroFeatureRefiner::new(200, 0.8, 1.0);

        let a = refiner.refine(&pair(fixed.clone(), moving.clone()));
        let b = refiner.refine(&pair(fixed, moving));
        assert_eq!(a.field, b.field);
    }

    #[test]
    fn test_outlier_rejection_drops_stray_matches() {
        let mut samples: Vec<FlowSample> = (0..20)
            .map(|i| FlowSample {
                x: (i * 4) as f64,
                y: (i * 3) as f64,
                dx: 2.0,
                dy: -1.0,
            })
            .collect();
        samples.push(FlowSample {
            x: 40.0,
            y: 40.0,
            dx: 50.0,
            dy: 0.0,
        });

        let kept = reject_outliers(samples);
        assert_eq!(kept.len(), 20);
        assert!(kept.iter().all(|s| (s.dx - 2.0).abs() < 1e-9));
    }
}
