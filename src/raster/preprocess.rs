//! Preprocessing of decoded regions into registration-ready images.
//!
//! Stain- or modality-specific normalization is a collaborator concern:
//! registration only requires that both images of a pair pass through the
//! same [`Preprocessor`]. The default [`LuminancePreprocessor`] covers the
//! common case of brightfield and single-channel fluorescence slides.

use crate::slide::PixelRegion;

use super::WorkingImage;

/// Turns a decoded pixel region into a normalized grayscale working image.
///
/// Implementations must be deterministic: the same region always produces
/// the same image, since downstream estimation is required to be
/// reproducible.
pub trait Preprocessor: Send + Sync {
    fn process(&self, region: &PixelRegion) -> WorkingImage;
}

// =============================================================================
// Luminance Preprocessor
// =============================================================================

/// Default preprocessor: channel-mean luminance, percentile contrast stretch,
/// and inversion of bright-background (brightfield) images so tissue is
/// bright on a dark background in every modality.
#[derive(Debug, Clone)]
pub struct LuminancePreprocessor {
    /// Percentile mapped to 0.0 during the contrast stretch.
    pub low_percentile: f64,

    /// Percentile mapped to 1.0 during the contrast stretch.
    pub high_percentile: f64,

    /// Invert images whose mean luminance is above 0.5.
    pub invert_bright_background: bool,
}

impl Default for LuminancePreprocessor {
    fn default() -> Self {
        Self {
            low_percentile: 1.0,
            high_percentile: 99.0,
            invert_bright_background: true,
        }
    }
}

impl LuminancePreprocessor {
    /// Percentile cut points from a 256-bin histogram of the image.
    fn percentile_bounds(img: &WorkingImage, low_pct: f64, high_pct: f64) -> (f32, f32) {
        let total = img.data().len();
        if total == 0 {
            return (0.0, 1.0);
        }
        let mut histogram = [0usize; 256];
        for &v in img.data() {
            let bin = (v.clamp(0.0, 1.0) * 255.0) as usize;
            histogram[bin.min(255)] += 1;
        }

        let low_target = (total as f64 * low_pct / 100.0) as usize;
        let high_target = (total as f64 * high_pct / 100.0) as usize;

        let mut low = 0u32;
        let mut high = 255u32;
        let mut seen = 0usize;
        for (bin, &count) in histogram.iter().enumerate() {
            let next = seen + count;
            if seen <= low_target && low_target < next {
                low = bin as u32;
            }
            if seen <= high_target && high_target < next {
                high = bin as u32;
            }
            seen = next;
        }
        (low as f32 / 255.0, high as f32 / 255.0)
    }
}

impl Preprocessor for LuminancePreprocessor {
    fn process(&self, region: &PixelRegion) -> WorkingImage {
        let mut img = region.luminance();

        if self.invert_bright_background && img.mean() > 0.5 {
            for v in img.data_mut() {
                *v = 1.0 - *v;
            }
        }

        let (low, high) = Self::percentile_bounds(&img, self.low_percentile, self.high_percentile);
        let range = (high - low).max(1.0 / 255.0);
        for v in img.data_mut() {
            *v = ((*v - low) / range).clamp(0.0, 1.0);
        }

        img
    }
}

// =============================================================================
// Tests
// =============================================================================
