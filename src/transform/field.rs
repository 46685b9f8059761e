//! Dense displacement fields.
//!
//! A [`DisplacementField`] stores per-pixel `(dx, dy)` displacements on the
//! canvas grid at the resolution scale it was estimated at. Like rigid
//! transforms, fields carry their scale and can be re-expressed at any
//! other: displacement vectors scale by the resolution ratio and the grid
//! is resampled.

use crate::raster::blur_plane;

/// Dense per-pixel displacement over the canvas grid.
///
/// Displacements are in pixels at `scale`. `sample` follows the same
/// pixel-center convention as image resampling, with border replication
/// outside the grid.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplacementField {
    width: u32,
    height: u32,
    scale: f64,
    dx: Vec<f32>,
    dy: Vec<f32>,
}

impl DisplacementField {
    /// Zero field on a `width x height` grid at `scale`.
    pub fn zeros(width: u32, height: u32, scale: f64) -> Self {
        let len = width as usize * height as usize;
        Self {
            width,
            height,
            scale,
            dx: vec![0.0; len],
            dy: vec![0.0; len],
        }
    }

    /// Wrap existing planes. Both must hold `width * height` values.
    pub fn from_planes(width: u32, height: u32, scale: f64, dx: Vec<f32>, dy: Vec<f32>) -> Self {
        let len = width as usize * height as usize;
        debug_assert_eq!(dx.len(), len);
        debug_assert_eq!(dy.len(), len);
        Self {
            width,
            height,
            scale,
            dx,
            dy,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Resolution scale the field is expressed at.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn dx(&self) -> &[f32] {
        &self.dx
    }

    pub fn dy(&self) -> &[f32] {
        &self.dy
    }

    #[inline]
    fn idx(&self, x: u32, y: u32) -> usize {
        debug_assert!(x < self.width && y < self.height);
        y as usize * self.width as usize + x as usize
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> (f32, f32) {
        let i = self.idx(x, y);
        (self.dx[i], self.dy[i])
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, dx: f32, dy: f32) {
        let i = self.idx(x, y);
        self.dx[i] = dx;
        self.dy[i] = dy;
    }

    #[inline]
    fn plane_clamped(plane: &[f32], width: u32, height: u32, x: i64, y: i64) -> f32 {
        let cx = x.clamp(0, width as i64 - 1) as usize;
        let cy = y.clamp(0, height as i64 - 1) as usize;
        plane[cy * width as usize + cx]
    }

    fn sample_plane(&self, plane: &[f32], x: f64, y: f64) -> f64 {
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = x - x0;
        let fy = y - y0;
        let x0 = x0 as i64;
        let y0 = y0 as i64;

        let p00 = Self::plane_clamped(plane, self.width, self.height, x0, y0) as f64;
        let p10 = Self::plane_clamped(plane, self.width, self.height, x0 + 1, y0) as f64;
        let p01 = Self::plane_clamped(plane, self.width, self.height, x0, y0 + 1) as f64;
        let p11 = Self::plane_clamped(plane, self.width, self.height, x0 + 1, y0 + 1) as f64;

        let a = p00 + fx * (p10 - p00);
        let b = p01 + fx * (p11 - p01);
        a + fy * (b - a)
    }

    /// Bilinear displacement at continuous grid coordinates, in pixels at
    /// this field's scale.
    pub fn sample(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.sample_plane(&self.dx, x, y),
            self.sample_plane(&self.dy, x, y),
        )
    }

    /// Displacement at a full-resolution canvas position, in full-resolution
    /// pixels.
    pub fn displacement_at_full(&self, x_full: f64, y_full: f64) -> (f64, f64) {
        let gx = (x_full + 0.5) * self.scale - 0.5;
        let gy = (y_full + 0.5) * self.scale - 0.5;
        let (dx, dy) = self.sample(gx, gy);
        (dx / self.scale, dy / self.scale)
    }

    /// Re-express at a different resolution scale: the grid is resampled
    /// and every displacement vector is multiplied by the resolution ratio.
    pub fn rescaled(&self, to_scale: f64) -> Self {
        let ratio = to_scale / self.scale;
        let out_w = ((self.width as f64 * ratio).round().max(1.0)) as u32;
        let out_h = ((self.height as f64 * ratio).round().max(1.0)) as u32;
        self.resampled_to(out_w, out_h, to_scale)
    }

    /// Resample onto an exact grid, scaling the vectors by the resolution
    /// ratio. Grids at different scales can be off by a pixel from pure
    /// ratio arithmetic, so composition pins the output dimensions.
    pub(crate) fn resampled_to(&self, out_w: u32, out_h: u32, to_scale: f64) -> Self {
        let ratio = to_scale / self.scale;
        let mut out = Self::zeros(out_w, out_h, to_scale);
        let sx = self.width as f64 / out_w as f64;
        let sy = self.height as f64 / out_h as f64;
        for y in 0..out_h {
            let gy = (y as f64 + 0.5) * sy - 0.5;
            for x in 0..out_w {
                let gx = (x as f64 + 0.5) * sx - 0.5;
                let (dx, dy) = self.sample(gx, gy);
                out.set(x, y, (dx * ratio) as f32, (dy * ratio) as f32);
            }
        }
        out
    }

    /// Total field from this prior plus a finer residual: the prior is
    /// brought onto the residual's grid and scale, then added.
    pub fn compose(&self, residual: &DisplacementField) -> Self {
        let mut base = self.resampled_to(residual.width, residual.height, residual.scale);
        for i in 0..base.dx.len() {
            base.dx[i] += residual.dx[i];
            base.dy[i] += residual.dy[i];
        }
        base
    }

    /// Gaussian-smoothed copy of the field.
    pub fn smoothed(&self, sigma: f64) -> Self {
        let mut out = self.clone();
        blur_plane(&mut out.dx, out.width, out.height, sigma);
        blur_plane(&mut out.dy, out.width, out.height, sigma);
        out
    }

    /// Mean displacement magnitude in pixels at this field's scale.
    pub fn mean_magnitude(&self) -> f64 {
        if self.dx.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .dx
            .iter()
            .zip(&self.dy)
            .map(|(dx, dy)| ((*dx as f64).powi(2) + (*dy as f64).powi(2)).sqrt())
            .sum();
        sum / self.dx.len() as f64
    }

    /// Largest displacement magnitude in pixels at this field's scale.
    pub fn max_magnitude(&self) -> f64 {
        self.dx
            .iter()
            .zip(&self.dy)
            .map(|(dx, dy)| ((*dx as f64).powi(2) + (*dy as f64).powi(2)).sqrt())
            .fold(0.0, f64::max)
    }
}

// =============================================================================
// Tests
// =============================================================================
