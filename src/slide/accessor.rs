//! Pyramid access trait and decoded pixel regions.
//!
//! [`PyramidAccessor`] is the narrow seam between the registration engine
//! and whatever decodes the slide container. Implementations only provide
//! metadata and `read_region`; scaled reads are layered on top here so
//! every decoder gets identical resampling behavior.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::SlideError;
use crate::raster::WorkingImage;

use super::{Level, PhysicalPixelSize};

// =============================================================================
// Region Box
// =============================================================================

/// Axis-aligned pixel region in the coordinates of one pyramid level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl RegionBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Region covering a full `width x height` extent.
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    /// Exclusive right edge.
    pub fn right(&self) -> u64 {
        self.x as u64 + self.width as u64
    }

    /// Exclusive bottom edge.
    pub fn bottom(&self) -> u64 {
        self.y as u64 + self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Intersection with another region, `None` when disjoint.
    pub fn intersect(&self, other: &RegionBox) -> Option<RegionBox> {
        let x0 = self.x.max(other.x) as u64;
        let y0 = self.y.max(other.y) as u64;
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(RegionBox {
            x: x0 as u32,
            y: y0 as u32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }
}

// =============================================================================
// Pixel Region
// =============================================================================

/// A decoded region: interleaved 8-bit samples, row-major.
///
/// The buffer is shared (`Bytes`), so cloning a region is cheap; the region
/// cache relies on this.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelRegion {
    width: u32,
    height: u32,
    channels: u16,
    data: Bytes,
}

impl PixelRegion {
    /// Wrap an interleaved buffer. `data.len()` must equal
    /// `width * height * channels`.
    pub fn from_interleaved(width: u32, height: u32, channels: u16, data: Vec<u8>) -> Self {
        debug_assert_eq!(
            data.len(),
            width as usize * height as usize * channels as usize
        );
        Self {
            width,
            height,
            channels,
            data: Bytes::from(data),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Buffer size in bytes.
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    fn sample_index(&self, x: u32, y: u32, channel: usize) -> usize {
        (y as usize * self.width as usize + x as usize) * self.channels as usize + channel
    }

    /// Raw sample value at integer coordinates.
    #[inline]
    pub fn sample(&self, x: u32, y: u32, channel: usize) -> u8 {
        self.data[self.sample_index(x, y, channel)]
    }

    #[inline]
    fn sample_clamped(&self, x: i64, y: i64, channel: usize) -> u8 {
        let cx = x.clamp(0, self.width as i64 - 1) as u32;
        let cy = y.clamp(0, self.height as i64 - 1) as u32;
        self.sample(cx, cy, channel)
    }

    /// Bilinear sample of one channel at continuous coordinates; borders
    /// replicate.
    pub fn sample_bilinear(&self, x: f64, y: f64, channel: usize) -> f32 {
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = (x - x0) as f32;
        let fy = (y - y0) as f32;
        let x0 = x0 as i64;
        let y0 = y0 as i64;

        let p00 = self.sample_clamped(x0, y0, channel) as f32;
        let p10 = self.sample_clamped(x0 + 1, y0, channel) as f32;
        let p01 = self.sample_clamped(x0, y0 + 1, channel) as f32;
        let p11 = self.sample_clamped(x0 + 1, y0 + 1, channel) as f32;

        let a = p00 + fx * (p10 - p00);
        let b = p01 + fx * (p11 - p01);
        a + fy * (b - a)
    }

    /// Extract one channel as a contiguous plane.
    pub fn channel_plane(&self, channel: usize) -> Result<Vec<u8>, SlideError> {
        if channel >= self.channels as usize {
            return Err(SlideError::ChannelOutOfRange {
                channel,
                channel_count: self.channels as usize,
            });
        }
        let stride = self.channels as usize;
        Ok(self.data.iter().skip(channel).step_by(stride).copied().collect())
    }

    /// Channel-mean luminance as a working image in `[0, 1]`.
    pub fn luminance(&self) -> WorkingImage {
        let channels = self.channels as usize;
        let scale = 1.0 / (255.0 * channels as f32);
        WorkingImage::from_fn(self.width, self.height, |x, y| {
            let base = self.sample_index(x, y, 0);
            let mut sum = 0u32;
            for c in 0..channels {
                sum += self.data[base + c] as u32;
            }
            sum as f32 * scale
        })
    }

    /// Bilinear resample to an arbitrary size, all channels.
    pub fn resampled(&self, out_width: u32, out_height: u32) -> Self {
        if out_width == self.width && out_height == self.height {
            return self.clone();
        }
        let channels = self.channels as usize;
        let scale_x = self.width as f64 / out_width as f64;
        let scale_y = self.height as f64 / out_height as f64;
        let mut out = Vec::with_capacity(out_width as usize * out_height as usize * channels);
        for y in 0..out_height {
            let sy = (y as f64 + 0.5) * scale_y - 0.5;
            for x in 0..out_width {
                let sx = (x as f64 + 0.5) * scale_x - 0.5;
                for c in 0..channels {
                    let v = self.sample_bilinear(sx, sy, c);
                    out.push(v.round().clamp(0.0, 255.0) as u8);
                }
            }
        }
        Self::from_interleaved(out_width, out_height, self.channels, out)
    }
}

// =============================================================================
// PyramidAccessor Trait
// =============================================================================

/// Format-agnostic pyramid access for one slide.
///
/// Implementations are expected to uphold the level-stack invariant checked
/// by [`super::validate_levels`]: level 0 is full resolution and downsample
/// factors strictly increase.
///
/// # Errors
///
/// `read_region` fails with [`SlideError::UnsupportedFormat`] or
/// [`SlideError::CorruptData`] when decoding fails. Callers treat these as
/// fatal for the slide, not for the run.
#[async_trait]
pub trait PyramidAccessor: Send + Sync {
    /// Source path or logical id of the slide.
    fn identity(&self) -> &str;

    /// Pyramid levels, finest first.
    fn levels(&self) -> &[Level];

    /// Channel names in storage order.
    fn channel_names(&self) -> &[String];

    /// Physical pixel calibration, when the container provides it.
    fn pixel_size(&self) -> Option<PhysicalPixelSize>;

    /// Decode a region of one level.
    async fn read_region(&self, level: usize, region: RegionBox)
        -> Result<PixelRegion, SlideError>;

    /// Number of pyramid levels.
    fn level_count(&self) -> usize {
        self.levels().len()
    }

    /// Full-resolution dimensions `(width, height)`.
    fn dimensions(&self) -> (u32, u32) {
        self.levels()
            .first()
            .map(|l| (l.width, l.height))
            .unwrap_or((0, 0))
    }

    /// Index of the finest level whose downsample does not exceed the
    /// requested factor, so resampling only ever sharpens within one level
    /// step. Falls back to level 0 for factors below 1.
    fn level_for_downsample(&self, downsample: f64) -> usize {
        let mut best = 0;
        for (index, level) in self.levels().iter().enumerate() {
            if level.downsample <= downsample * 1.001 {
                best = index;
            } else {
                break;
            }
        }
        best
    }

    /// Read an arbitrary full-resolution region resampled to `scale`
    /// (fraction of full resolution, `0 < scale <= 1`).
    ///
    /// The nearest sufficient pyramid level is decoded and bilinearly
    /// resampled to the output size, so callers never touch more source
    /// pixels than one level step above the request.
    async fn read_scaled_region(
        &self,
        scale: f64,
        region: RegionBox,
    ) -> Result<PixelRegion, SlideError> {
        let (full_w, full_h) = self.dimensions();
        if region.is_empty() || region.right() > full_w as u64 || region.bottom() > full_h as u64 {
            return Err(SlideError::RegionOutOfBounds {
                level: 0,
                x: region.x,
                y: region.y,
                width: region.width,
                height: region.height,
                level_width: full_w,
                level_height: full_h,
            });
        }
        if !(scale > 0.0 && scale <= 1.0) {
            return Err(SlideError::CorruptData {
                detail: format!("requested scale {scale} outside (0, 1]"),
            });
        }

        let out_w = ((region.width as f64) * scale).round().max(1.0) as u32;
        let out_h = ((region.height as f64) * scale).round().max(1.0) as u32;

        let level_index = self.level_for_downsample(1.0 / scale);
        let level = self.levels()[level_index];
        let ds = level.downsample;

        // Source patch covering the region at the chosen level.
        let lx0 = ((region.x as f64 / ds).floor().max(0.0) as u32).min(level.width - 1);
        let ly0 = ((region.y as f64 / ds).floor().max(0.0) as u32).min(level.height - 1);
        let lx1 = ((region.right() as f64 / ds).ceil() as u32).clamp(lx0 + 1, level.width);
        let ly1 = ((region.bottom() as f64 / ds).ceil() as u32).clamp(ly0 + 1, level.height);

        let patch = self
            .read_region(
                level_index,
                RegionBox::new(lx0, ly0, lx1 - lx0, ly1 - ly0),
            )
            .await?;

        let channels = patch.channels() as usize;
        let mut out = Vec::with_capacity(out_w as usize * out_h as usize * channels);
        for j in 0..out_h {
            let fy = region.y as f64 + (j as f64 + 0.5) * region.height as f64 / out_h as f64;
            let py = fy / ds - 0.5 - ly0 as f64;
            for i in 0..out_w {
                let fx = region.x as f64 + (i as f64 + 0.5) * region.width as f64 / out_w as f64;
                let px = fx / ds - 0.5 - lx0 as f64;
                for c in 0..channels {
                    let v = patch.sample_bilinear(px, py, c);
                    out.push(v.round().clamp(0.0, 255.0) as u8);
                }
            }
        }
        Ok(PixelRegion::from_interleaved(
            out_w,
            out_h,
            patch.channels(),
            out,
        ))
    }

    /// Read the whole slide resampled to `scale`.
    async fn read_scaled(&self, scale: f64) -> Result<PixelRegion, SlideError> {
        let (full_w, full_h) = self.dimensions();
        self.read_scaled_region(scale, RegionBox::full(full_w, full_h))
            .await
    }
}

// =============================================================================
// Tests
// =============================================================================
