//! Coarse-to-fine windowed flow refinement.

use crate::config::RegistrarConfig;
use crate::raster::{ImagePyramid, WorkingImage};
use crate::transform::DisplacementField;

use super::{warp_working, AlignedPair, NonRigidRefiner, Refinement};

/// Largest per-iteration update in pixels. Coarse levels cover large
/// motion through the pyramid, not through big single steps.
const MAX_STEP: f32 = 1.0;

/// Structure tensors below this determinant are treated as textureless.
const DET_EPS: f32 = 1e-12;

/// Dense displacement estimation by iterative windowed least squares over
/// an image pyramid.
///
/// At each level the current field warps the moving image, a local
/// structure tensor and intensity residual are gathered over a Gaussian
/// window, and the per-pixel normal equations yield an update. The field
/// is smoothed between iterations and upsampled between levels.
#[derive(Debug, Clone)]
pub struct FlowRefiner {
    levels: usize,
    iterations: usize,
    window_radius: usize,
    smooth_sigma: f64,
}

impl FlowRefiner {
    pub fn new(levels: usize, iterations: usize, window_radius: usize, smooth_sigma: f64) -> Self {
        Self {
            levels: levels.max(1),
            iterations: iterations.max(1),
            window_radius: window_radius.max(1),
            smooth_sigma,
        }
    }

    pub fn from_config(config: &RegistrarConfig) -> Self {
        Self::new(
            config.flow_levels,
            config.flow_iterations,
            config.flow_window_radius,
            config.flow_smooth_sigma,
        )
    }

    fn window_sigma(&self) -> f64 {
        (self.window_radius as f64 / 2.0).max(0.5)
    }

    /// One least-squares update of the field at a single pyramid level.
    fn update_level(
        &self,
        fixed: &WorkingImage,
        moving: &WorkingImage,
        field: &DisplacementField,
    ) -> DisplacementField {
        let (w, h) = (fixed.width(), fixed.height());
        let warped = warp_working(moving, field);
        let (gx, gy) = warped.gradients();

        // Structure tensor and residual correlation, window-averaged.
        let sigma = self.window_sigma();
        let gxx = WorkingImage::from_fn(w, h, |x, y| gx.get(x, y) * gx.get(x, y))
            .gaussian_blurred(sigma);
        let gxy = WorkingImage::from_fn(w, h, |x, y| gx.get(x, y) * gy.get(x, y))
            .gaussian_blurred(sigma);
        let gyy = WorkingImage::from_fn(w, h, |x, y| gy.get(x, y) * gy.get(x, y))
            .gaussian_blurred(sigma);
        let gxe = WorkingImage::from_fn(w, h, |x, y| {
            gx.get(x, y) * (fixed.get(x, y) - warped.get(x, y))
        })
        .gaussian_blurred(sigma);
        let gye = WorkingImage::from_fn(w, h, |x, y| {
            gy.get(x, y) * (fixed.get(x, y) - warped.get(x, y))
        })
        .gaussian_blurred(sigma);

        let mut next = field.clone();
        for y in 0..h {
            for x in 0..w {
                let (a, b, c) = (gxx.get(x, y), gxy.get(x, y), gyy.get(x, y));
                let det = a * c - b * b;
                if det <= DET_EPS {
                    continue;
                }
                let (bx, by) = (gxe.get(x, y), gye.get(x, y));
                let du = ((c * bx - b * by) / det).clamp(-MAX_STEP, MAX_STEP);
                let dv = ((a * by - b * bx) / det).clamp(-MAX_STEP, MAX_STEP);
                let (dx, dy) = field.get(x, y);
                next.set(x, y, dx + du, dy + dv);
            }
        }
        next.smoothed(self.smooth_sigma)
    }
}

/// Upsample a field between pyramid levels. Vector components scale by
/// the exact per-axis dimension ratio, which can differ slightly from a
/// power of two for odd level sizes.
fn upsample_field(field: &DisplacementField, w: u32, h: u32, scale: f64) -> DisplacementField {
    let rx = (w as f64 / field.width() as f64) as f32;
    let ry = (h as f64 / field.height() as f64) as f32;
    let sx = field.width() as f64 / w as f64;
    let sy = field.height() as f64 / h as f64;

    let mut out = DisplacementField::zeros(w, h, scale);
    for y in 0..h {
        let gy = (y as f64 + 0.5) * sy - 0.5;
        for x in 0..w {
            let gx = (x as f64 + 0.5) * sx - 0.5;
            let (dx, dy) = field.sample(gx, gy);
            out.set(x, y, dx as f32 * rx, dy as f32 * ry);
        }
    }
    out
}

impl NonRigidRefiner for FlowRefiner {
    fn refine(&self, pair: &AlignedPair) -> Refinement {
        let residual_before = pair.fixed.mean_abs_diff(&pair.moving);

        let fixed_pyr = ImagePyramid::build((*pair.fixed).clone(), self.levels);
        let moving_pyr = ImagePyramid::build((*pair.moving).clone(), self.levels);
        let level_count = fixed_pyr.level_count().min(moving_pyr.level_count());

        let base_w = pair.fixed.width();
        let coarsest = fixed_pyr.level(level_count - 1);
        let mut field = DisplacementField::zeros(
            coarsest.width(),
            coarsest.height(),
            pair.scale * coarsest.width() as f64 / base_w as f64,
        );

        for li in (0..level_count).rev() {
            let fixed = fixed_pyr.level(li);
            let moving = moving_pyr.level(li);
            if field.width() != fixed.width() || field.height() != fixed.height() {
                let level_scale = pair.scale * fixed.width() as f64 / base_w as f64;
                field = upsample_field(&field, fixed.width(), fixed.height(), level_scale);
            }
            for _ in 0..self.iterations {
                field = self.update_level(fixed, moving, &field);
            }
        }

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
