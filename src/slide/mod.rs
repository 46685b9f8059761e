//! Slide abstraction: pyramid metadata, region access, and sources.
//!
//! A slide is exposed to the registration engine as a stack of resolution
//! levels with pixel-region read access, behind the [`PyramidAccessor`]
//! trait. Actual container decoding (SVS, OME-TIFF, vendor formats) is a
//! collaborator concern: an external decoder implements [`PyramidAccessor`]
//! and [`SlideSource`], and the engine never sees format specifics.
//!
//! # Components
//!
//! - [`PyramidAccessor`]: level metadata plus `read_region`, with scaled
//!   reads provided on top
//! - [`SlideSource`]: factory that lists and opens slides, with a scoped
//!   `close` for decoder runtimes that need explicit shutdown
//! - [`MemoryPyramid`] / [`MemorySlideSource`]: in-memory implementation
//!   used by tests and synthetic pipelines
//! - [`RegionCache`] / [`CachedAccessor`]: LRU cache of decoded regions with
//!   byte-size eviction, and the decorator that routes reads through it

mod accessor;
mod cache;
mod memory;
mod source;

pub use accessor::{PixelRegion, PyramidAccessor, RegionBox};
pub use cache::{CachedAccessor, RegionCache, RegionCacheKey, DEFAULT_REGION_CACHE_CAPACITY};
pub use memory::{MemoryPyramid, MemorySlideSource};
pub use source::SlideSource;

use serde::{Deserialize, Serialize};

use crate::error::SlideError;

// =============================================================================
// Level Metadata
// =============================================================================

/// A single pyramid level.
///
/// Level 0 is full resolution with downsample 1.0; downsample factors
/// strictly increase with the level index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Level {
    /// Level index (0 = full resolution)
    pub index: usize,

    /// Width of this level in pixels
    pub width: u32,

    /// Height of this level in pixels
    pub height: u32,

    /// Downsample factor relative to level 0
    pub downsample: f64,
}

/// Check the level-stack invariant: non-empty, level 0 at downsample 1.0,
/// strictly increasing downsamples, non-zero dimensions.
pub fn validate_levels(levels: &[Level]) -> Result<(), SlideError> {
    if levels.is_empty() {
        return Err(SlideError::CorruptData {
            detail: "slide exposes no pyramid levels".to_string(),
        });
    }
    if (levels[0].downsample - 1.0).abs() > 1e-6 {
        return Err(SlideError::CorruptData {
            detail: format!(
                "level 0 must be full resolution, got downsample {}",
                levels[0].downsample
            ),
        });
    }
    let mut previous = 0.0f64;
    for level in levels {
        if level.width == 0 || level.height == 0 {
            return Err(SlideError::CorruptData {
                detail: format!("level {} has zero dimension", level.index),
            });
        }
        if level.downsample <= previous {
            return Err(SlideError::CorruptData {
                detail: format!(
                    "downsample factors must strictly increase, level {} has {}",
                    level.index, level.downsample
                ),
            });
        }
        previous = level.downsample;
    }
    Ok(())
}

// =============================================================================
// Physical Calibration
// =============================================================================

/// Physical size of a full-resolution pixel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalPixelSize {
    /// Pixel width in `unit`
    pub x: f64,

    /// Pixel height in `unit`
    pub y: f64,

    /// Unit name, typically micrometers
    pub unit: String,
}

impl PhysicalPixelSize {
    /// Square micron-per-pixel calibration.
    pub fn microns(per_pixel: f64) -> Self {
        Self {
            x: per_pixel,
            y: per_pixel,
            unit: "\u{00b5}m".to_string(),
        }
    }
}

// =============================================================================
// Slide Metadata
// =============================================================================

/// Immutable identity and pyramid metadata of one slide.
///
/// Captured once when the slide set is scanned; the mutable registration
/// state (transform, displacement field, stage) lives on the registrar's
/// slide entries, not here.
#[derive(Debug, Clone)]
pub struct Slide {
    /// Source path or logical id
    pub identity: String,

    /// Pyramid levels, finest first
    pub levels: Vec<Level>,

    /// Channel names, in the slide's storage order
    pub channel_names: Vec<String>,

    /// Physical pixel calibration, when the container provides it
    pub pixel_size: Option<PhysicalPixelSize>,
}

impl Slide {
    /// Snapshot the metadata of an accessor.
    pub fn from_accessor<A: PyramidAccessor + ?Sized>(accessor: &A) -> Self {
        Self {
            identity: accessor.identity().to_string(),
            levels: accessor.levels().to_vec(),
            channel_names: accessor.channel_names().to_vec(),
            pixel_size: accessor.pixel_size(),
        }
    }

    /// Full-resolution dimensions `(width, height)`.
    pub fn dimensions(&self) -> (u32, u32) {
        self.levels
            .first()
            .map(|l| (l.width, l.height))
            .unwrap_or((0, 0))
    }

    pub fn channel_count(&self) -> usize {
        self.channel_names.len()
    }
}

// =============================================================================
// Registration State
// =============================================================================

/// Per-slide registration progress.
///
/// States are strictly ordered; a stage only ever advances a slide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RegistrationState {
    /// No transform computed yet
    Unregistered,

    /// Rigid transform into the common reference frame computed
    RigidAligned,

    /// Displacement field refining the rigid result computed
    NonRigidRefined,

    /// Displacement field re-estimated at micro resolution
    MicroRefined,
}

impl std::fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unregistered => "unregistered",
            Self::RigidAligned => "rigid-aligned",
            Self::NonRigidRefined => "non-rigid-refined",
            Self::MicroRefined => "micro-refined",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Tests
// =============================================================================
