//! Working-resolution raster buffers.
//!
//! Registration math runs on [`WorkingImage`], a single-channel `f32` buffer
//! holding luminance in `[0, 1]`. Full-resolution pixel data never passes
//! through this module; it stays in the tile path.

pub mod preprocess;

pub use preprocess::{LuminancePreprocessor, Preprocessor};

use image::{GrayImage, Luma};

// =============================================================================
// Working Image
// =============================================================================

/// Single-channel `f32` image, row-major, values in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkingImage {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl WorkingImage {
    /// Create a zero-filled image.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; (width as usize) * (height as usize)],
        }
    }

    /// Create an image by evaluating `f` at every pixel.
    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> f32) -> Self {
        let mut data = Vec::with_capacity((width as usize) * (height as usize));
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    /// Wrap an existing buffer. `data.len()` must equal `width * height`.
    pub fn from_vec(width: u32, height: u32, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), (width as usize) * (height as usize));
        Self {
            width,
            height,
            data,
        }
    }

    /// Convert an 8-bit grayscale image, mapping 255 to 1.0.
    pub fn from_luma8(img: &GrayImage) -> Self {
        let data = img.as_raw().iter().map(|&v| v as f32 / 255.0).collect();
        Self {
            width: img.width(),
            height: img.height(),
            data,
        }
    }

    /// Convert a row-major plane of 8-bit samples, mapping 255 to 1.0.
    pub fn from_u8_plane(width: u32, height: u32, plane: &[u8]) -> Self {
        debug_assert_eq!(plane.len(), (width as usize) * (height as usize));
        let data = plane.iter().map(|&v| v as f32 / 255.0).collect();
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    #[inline]
    fn idx(&self, x: u32, y: u32) -> usize {
        (y as usize) * (self.width as usize) + (x as usize)
    }

    /// Pixel value at integer coordinates inside the image.
    #[inline]
    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[self.idx(x, y)]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, value: f32) {
        let i = self.idx(x, y);
        self.data[i] = value;
    }

    /// Pixel value with border-replicate clamping for out-of-range
    /// coordinates.
    #[inline]
    pub fn get_clamped(&self, x: i64, y: i64) -> f32 {
        let cx = x.clamp(0, self.width as i64 - 1) as u32;
        let cy = y.clamp(0, self.height as i64 - 1) as u32;
        self.get(cx, cy)
    }

    /// Bilinear sample at continuous coordinates; borders replicate.
    #[inline]
    pub fn sample_bilinear(&self, x: f64, y: f64) -> f32 {
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = (x - x0) as f32;
        let fy = (y - y0) as f32;
        let x0 = x0 as i64;
        let y0 = y0 as i64;

        let p00 = self.get_clamped(x0, y0);
        let p10 = self.get_clamped(x0 + 1, y0);
        let p01 = self.get_clamped(x0, y0 + 1);
        let p11 = self.get_clamped(x0 + 1, y0 + 1);

        let a = p00 + fx * (p10 - p00);
        let b = p01 + fx * (p11 - p01);
        a + fy * (b - a)
    }

    /// Bilinear resize to an arbitrary size.
    pub fn resized(&self, out_width: u32, out_height: u32) -> Self {
        if out_width == self.width && out_height == self.height {
            return self.clone();
        }
        let scale_x = self.width as f64 / out_width as f64;
        let scale_y = self.height as f64 / out_height as f64;
        Self::from_fn(out_width, out_height, |x, y| {
            let sx = (x as f64 + 0.5) * scale_x - 0.5;
            let sy = (y as f64 + 0.5) * scale_y - 0.5;
            self.sample_bilinear(sx, sy)
        })
    }

    /// Downsample by two with a 2x2 box filter.
    pub fn half(&self) -> Self {
        let out_w = (self.width / 2).max(1);
        let out_h = (self.height / 2).max(1);
        Self::from_fn(out_w, out_h, |x, y| {
            let x0 = (x * 2) as i64;
            let y0 = (y * 2) as i64;
            (self.get_clamped(x0, y0)
                + self.get_clamped(x0 + 1, y0)
                + self.get_clamped(x0, y0 + 1)
                + self.get_clamped(x0 + 1, y0 + 1))
                * 0.25
        })
    }

    /// Separable Gaussian blur.
    pub fn gaussian_blurred(&self, sigma: f64) -> Self {
        let mut out = self.clone();
        blur_plane(&mut out.data, self.width, self.height, sigma);
        out
    }

    /// Central-difference gradients `(dx, dy)`.
    pub fn gradients(&self) -> (Self, Self) {
        let dx = Self::from_fn(self.width, self.height, |x, y| {
            let x = x as i64;
            let y = y as i64;
            0.5 * (self.get_clamped(x + 1, y) - self.get_clamped(x - 1, y))
        });
        let dy = Self::from_fn(self.width, self.height, |x, y| {
            let x = x as i64;
            let y = y as i64;
            0.5 * (self.get_clamped(x, y + 1) - self.get_clamped(x, y - 1))
        });
        (dx, dy)
    }

    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.data.iter().map(|&v| v as f64).sum();
        (sum / self.data.len() as f64) as f32
    }

    pub fn min_max(&self) -> (f32, f32) {
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        for &v in &self.data {
            min = min.min(v);
            max = max.max(v);
        }
        if min > max {
            (0.0, 0.0)
        } else {
            (min, max)
        }
    }

    /// Mean absolute intensity difference against another image of the same
    /// size. Used as the refinement residual.
    pub fn mean_abs_diff(&self, other: &Self) -> f64 {
        debug_assert_eq!(self.width, other.width);
        debug_assert_eq!(self.height, other.height);
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(&a, &b)| (a as f64 - b as f64).abs())
            .sum();
        sum / self.data.len() as f64
    }

    /// Convert to an 8-bit grayscale image, mapping 1.0 to 255.
    pub fn to_luma8(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            Luma([(self.get(x, y).clamp(0.0, 1.0) * 255.0).round() as u8])
        })
    }
}

// =============================================================================
// Gaussian Filtering
// =============================================================================

/// Build a normalized 1D Gaussian kernel. Radius is `ceil(3 * sigma)`.
pub fn gaussian_kernel(sigma: f64) -> Vec<f32> {
    let radius = (3.0 * sigma).ceil().max(1.0) as i64;
    let mut kernel = Vec::with_capacity((2 * radius + 1) as usize);
    let denom = 2.0 * sigma * sigma;
    let mut sum = 0.0f64;
    for i in -radius..=radius {
        let w = (-(i * i) as f64 / denom).exp();
        kernel.push(w as f32);
        sum += w;
    }
    for w in &mut kernel {
        *w = (*w as f64 / sum) as f32;
    }
    kernel
}

/// Separable Gaussian blur on a raw row-major plane, in place.
///
/// Shared by [`WorkingImage`] and the displacement-field grids, which store
/// their two components as separate planes.
pub fn blur_plane(data: &mut [f32], width: u32, height: u32, sigma: f64) {
    if sigma <= 0.0 || data.is_empty() {
        return;
    }
    let kernel = gaussian_kernel(sigma);
    let radius = (kernel.len() / 2) as i64;
    let w = width as i64;
    let h = height as i64;

    // Horizontal pass
    let mut tmp = vec![0.0f32; data.len()];
    for y in 0..h {
        let row = (y * w) as usize;
        for x in 0..w {
            let mut acc = 0.0f32;
            for (k, &kw) in kernel.iter().enumerate() {
                let sx = (x + k as i64 - radius).clamp(0, w - 1);
                acc += kw * data[row + sx as usize];
            }
            tmp[row + x as usize] = acc;
        }
    }

    // Vertical pass
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0f32;
            for (k, &kw) in kernel.iter().enumerate() {
                let sy = (y + k as i64 - radius).clamp(0, h - 1);
                acc += kw * tmp[(sy * w + x) as usize];
            }
            data[(y * w + x) as usize] = acc;
        }
    }
}

// =============================================================================
// Image Pyramid
// =============================================================================

/// Gaussian pyramid over a working image.
///
/// Level 0 is the finest (the input). Each subsequent level is blurred and
/// halved. Construction stops when the next level would drop below
/// `min_dim` on either axis.
#[derive(Debug, Clone)]
pub struct ImagePyramid {
    levels: Vec<WorkingImage>,
}

impl ImagePyramid {
    /// Smallest level edge the pyramid will produce.
    pub const MIN_DIM: u32 = 32;

    pub fn build(base: WorkingImage, max_levels: usize) -> Self {
        let mut levels = vec![base];
        while levels.len() < max_levels {
            let last = levels.last().map(|l| (l.width(), l.height()));
            let Some((w, h)) = last else { break };
            if w / 2 < Self::MIN_DIM || h / 2 < Self::MIN_DIM {
                break;
            }
            let next = levels[levels.len() - 1].gaussian_blurred(1.0).half();
            levels.push(next);
        }
        Self { levels }
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, index: usize) -> &WorkingImage {
        &self.levels[index]
    }

    /// Finest level (the original image).
    pub fn finest(&self) -> &WorkingImage {
        &self.levels[0]
    }

    /// Coarsest level.
    pub fn coarsest(&self) -> &WorkingImage {
        &self.levels[self.levels.len() - 1]
    }
}

// =============================================================================
// Tests
// =============================================================================
