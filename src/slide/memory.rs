//! In-memory slides.
//!
//! [`MemoryPyramid`] holds a fully decoded pyramid and implements
//! [`PyramidAccessor`] over it. It backs synthetic fixtures in tests and
//! lets callers register images that never lived in a slide container.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::SlideError;

use super::{
    Level, PhysicalPixelSize, PixelRegion, PyramidAccessor, RegionBox, SlideSource,
};

/// Halving stops once both dimensions fit within this.
const MIN_LEVEL_DIM: u32 = 64;

// =============================================================================
// Memory Pyramid
// =============================================================================

/// A decoded pyramid held entirely in memory.
///
/// Levels below full resolution are derived by repeated 2x2 box filtering,
/// so downsample factors are close to powers of two but track the exact
/// integer dimensions.
#[derive(Debug, Clone)]
pub struct MemoryPyramid {
    identity: String,
    levels: Vec<Level>,
    planes: Vec<Bytes>,
    channels: u16,
    channel_names: Vec<String>,
    pixel_size: Option<PhysicalPixelSize>,
}

impl MemoryPyramid {
    /// Build a pyramid from full-resolution interleaved data.
    ///
    /// `data.len()` must equal `width * height * channel_names.len()`.
    pub fn build(
        identity: impl Into<String>,
        width: u32,
        height: u32,
        channel_names: Vec<String>,
        data: Vec<u8>,
    ) -> Self {
        let channels = channel_names.len() as u16;
        debug_assert_eq!(
            data.len(),
            width as usize * height as usize * channels as usize
        );

        let mut levels = vec![Level {
            index: 0,
            width,
            height,
            downsample: 1.0,
        }];
        let mut current = Bytes::from(data);
        let mut planes = vec![current.clone()];

        let (mut w, mut h) = (width, height);
        while w.max(h) > MIN_LEVEL_DIM && (w > 1 || h > 1) {
            let (nw, nh) = ((w / 2).max(1), (h / 2).max(1));
            current = Bytes::from(halve_interleaved(&current, w, h, channels, nw, nh));
            levels.push(Level {
                index: levels.len(),
                width: nw,
                height: nh,
                downsample: width as f64 / nw as f64,
            });
            planes.push(current.clone());
            (w, h) = (nw, nh);
        }

        Self {
            identity: identity.into(),
            levels,
            planes,
            channels,
            channel_names,
            pixel_size: None,
        }
    }

    /// Build a single-channel pyramid named `gray`.
    pub fn from_gray(identity: impl Into<String>, width: u32, height: u32, data: Vec<u8>) -> Self {
        Self::build(identity, width, height, vec!["gray".to_string()], data)
    }

    /// Attach physical pixel calibration.
    pub fn with_pixel_size(mut self, pixel_size: PhysicalPixelSize) -> Self {
        self.pixel_size = Some(pixel_size);
        self
    }
}

/// 2x2 box filter on interleaved data, floor-halved dimensions.
fn halve_interleaved(src: &[u8], w: u32, h: u32, channels: u16, nw: u32, nh: u32) -> Vec<u8> {
    let channels = channels as usize;
    let stride = w as usize * channels;
    let mut out = Vec::with_capacity(nw as usize * nh as usize * channels);
    for y in 0..nh {
        let y0 = (2 * y) as usize;
        let y1 = (2 * y + 1).min(h - 1) as usize;
        for x in 0..nw {
            let x0 = (2 * x) as usize;
            let x1 = (2 * x + 1).min(w - 1) as usize;
            for c in 0..channels {
                let sum = src[y0 * stride + x0 * channels + c] as u32
                    + src[y0 * stride + x1 * channels + c] as u32
                    + src[y1 * stride + x0 * channels + c] as u32
                    + src[y1 * stride + x1 * channels + c] as u32;
                out.push(((sum + 2) / 4) as u8);
            }
        }
    }
    out
}

#[async_trait]
impl PyramidAccessor for MemoryPyramid {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn levels(&self) -> &[Level] {
        &self.levels
    }

    fn channel_names(&self) -> &[String] {
        &self.channel_names
    }

    fn pixel_size(&self) -> Option<PhysicalPixelSize> {
        self.pixel_size.clone()
    }

    async fn read_region(
        &self,
        level: usize,
        region: RegionBox,
    ) -> Result<PixelRegion, SlideError> {
        let info = self
            .levels
            .get(level)
            .copied()
            .ok_or(SlideError::InvalidLevel {
                level,
                level_count: self.levels.len(),
            })?;
        if region.is_empty()
            || region.right() > info.width as u64
            || region.bottom() > info.height as u64
        {
            return Err(SlideError::RegionOutOfBounds {
                level,
                x: region.x,
                y: region.y,
                width: region.width,
                height: region.height,
                level_width: info.width,
                level_height: info.height,
            });
        }

        let channels = self.channels as usize;
        let stride = info.width as usize * channels;
        let row_bytes = region.width as usize * channels;
        let plane = &self.planes[level];

        let mut out = Vec::with_capacity(region.height as usize * row_bytes);
        for row in 0..region.height {
            let y = (region.y + row) as usize;
            let start = y * stride + region.x as usize * channels;
            out.extend_from_slice(&plane[start..start + row_bytes]);
        }
        Ok(PixelRegion::from_interleaved(
            region.width,
            region.height,
            self.channels,
            out,
        ))
    }
}

// =============================================================================
// Memory Slide Source
// =============================================================================

/// A [`SlideSource`] over in-memory pyramids.
#[derive(Debug, Default, Clone)]
pub struct MemorySlideSource {
    slides: HashMap<String, MemoryPyramid>,
}

impl MemorySlideSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a slide, keyed by its identity. Builder form.
    pub fn with_slide(mut self, pyramid: MemoryPyramid) -> Self {
        self.insert(pyramid);
        self
    }

    pub fn insert(&mut self, pyramid: MemoryPyramid) {
        self.slides.insert(pyramid.identity.clone(), pyramid);
    }

    pub fn len(&self) -> usize {
        self.slides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slides.is_empty()
    }
}

#[async_trait]
impl SlideSource for MemorySlideSource {
    type Accessor = MemoryPyramid;

    async fn list_slides(&self) -> Result<Vec<String>, SlideError> {
        let mut ids: Vec<String> = self.slides.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn open(&self, slide_id: &str) -> Result<Self::Accessor, SlideError> {
        self.slides
            .get(slide_id)
            .cloned()
            .ok_or_else(|| SlideError::NotFound(slide_id.to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================
