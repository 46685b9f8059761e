//! Configuration for the registration engine.
//!
//! All tuning knobs live in [`RegistrarConfig`]. The defaults are chosen for
//! serial-section slides at typical scanner resolutions; most callers only
//! ever override `max_processed_dim` and `worker_count`.
//!
//! # Example
//!
//! ```
//! use wsi_registrar::config::RegistrarConfig;
//!
//! let mut config = RegistrarConfig::default();
//! config.max_processed_dim = 600;
//! config.ordered = true;
//! assert!(config.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};

use crate::slide::DEFAULT_REGION_CACHE_CAPACITY;

// =============================================================================
// Default Values
// =============================================================================

/// Default cap on the largest dimension of the processed (working) images
/// used for feature matching and rigid estimation.
pub const DEFAULT_MAX_PROCESSED_DIM: u32 = 850;

/// Default cap on the largest dimension of the grid used for non-rigid
/// refinement.
pub const DEFAULT_MAX_NON_RIGID_DIM: u32 = 850;

/// Default fraction of full resolution used by the micro refinement pass.
pub const DEFAULT_MICRO_FRACTION: f64 = 0.25;

/// Default output tile edge in pixels.
pub const DEFAULT_TILE_SIZE: u32 = 512;

/// Default maximum number of keypoints retained per image.
pub const DEFAULT_MAX_FEATURES: usize = 2000;

/// Default Lowe ratio for descriptor match filtering.
pub const DEFAULT_MATCH_RATIO: f64 = 0.8;

/// Default number of consensus sampling iterations.
pub const DEFAULT_RANSAC_ITERATIONS: usize = 1000;

/// Default inlier distance tolerance in working-resolution pixels.
pub const DEFAULT_INLIER_TOLERANCE: f64 = 3.0;

/// Default minimum number of consensus inliers for a usable pair.
pub const DEFAULT_MIN_MATCHES: usize = 4;

/// Default seed for the consensus sampler. Registration must be
/// reproducible, so the sampler is always explicitly seeded.
pub const DEFAULT_SEED: u64 = 42;

/// Default number of coarse-to-fine pyramid levels for flow refinement.
pub const DEFAULT_FLOW_LEVELS: usize = 4;

/// Default number of update iterations per flow pyramid level.
pub const DEFAULT_FLOW_ITERATIONS: usize = 10;

/// Default half-width of the local window used by flow updates.
pub const DEFAULT_FLOW_WINDOW_RADIUS: usize = 7;

/// Default Gaussian sigma applied to the displacement field between
/// iterations, keeping the field spatially smooth.
pub const DEFAULT_FLOW_SMOOTH_SIGMA: f64 = 2.0;

/// Default fill value for warped pixels that map outside the source slide.
pub const DEFAULT_BACKGROUND: u8 = 0;

/// Default largest dimension of diagnostic thumbnails.
pub const DEFAULT_THUMBNAIL_DIM: u32 = 500;

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

// =============================================================================
// Registrar Configuration
// =============================================================================

/// Tuning knobs for the full registration pipeline.
///
/// The configuration is embedded in snapshots so deferred warping runs with
/// the same working resolutions the registration was computed at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrarConfig {
    // =========================================================================
    // Working Resolution
    // =========================================================================
    /// Cap on the largest dimension of processed images used for matching
    /// and rigid estimation.
    pub max_processed_dim: u32,

    /// Cap on the largest dimension of the non-rigid displacement grid.
    pub max_non_rigid_dim: u32,

    /// Fraction of full resolution targeted by `register_micro` when the
    /// caller does not pass an explicit cap.
    pub micro_fraction: f64,

    // =========================================================================
    // Ordering
    // =========================================================================
    /// Treat the scanned slide order as the physical section order.
    ///
    /// When set, consecutive slides are aligned as a chain and the full
    /// pairwise search is skipped.
    pub ordered: bool,

    /// Identity of the slide to use as the reference frame.
    ///
    /// When unset, the reference is chosen automatically: the slide with the
    /// smallest total alignment distance to all others (unordered), or the
    /// middle of the stack (ordered).
    pub reference: Option<String>,

    // =========================================================================
    // Feature Matching
    // =========================================================================
    /// Maximum number of keypoints retained per image.
    pub max_features: usize,

    /// Lowe ratio threshold: a descriptor match is kept only if its best
    /// distance is below `match_ratio` times its second-best distance.
    pub match_ratio: f64,

    /// Number of consensus sampling iterations per pair.
    pub ransac_iterations: usize,

    /// Inlier distance tolerance in working-resolution pixels.
    pub inlier_tolerance: f64,

    /// Minimum consensus inliers for a pair to contribute a transform.
    /// Below this, the pair degrades to identity and is flagged
    /// low-confidence.
    pub min_matches: usize,

    /// Seed for the consensus sampler.
    pub seed: u64,

    // =========================================================================
    // Non-Rigid Refinement
    // =========================================================================
    /// Number of coarse-to-fine pyramid levels for flow refinement.
    pub flow_levels: usize,

    /// Update iterations per flow pyramid level.
    pub flow_iterations: usize,

    /// Half-width of the local intensity window used by flow updates.
    pub flow_window_radius: usize,

    /// Gaussian sigma applied to the displacement field between iterations.
    pub flow_smooth_sigma: f64,

    // =========================================================================
    // Warping
    // =========================================================================
    /// Output tile edge in pixels.
    pub tile_size: u32,

    /// Maximum number of tiles or pairs processed concurrently.
    pub worker_count: usize,

    /// Capacity of the decoded-region cache in bytes.
    pub region_cache_bytes: usize,

    /// Fill value for output pixels that map outside the source slide.
    pub background: u8,

    // =========================================================================
    // Diagnostics
    // =========================================================================
    /// Largest dimension of diagnostic thumbnails.
    pub thumbnail_dim: u32,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            max_processed_dim: DEFAULT_MAX_PROCESSED_DIM,
            max_non_rigid_dim: DEFAULT_MAX_NON_RIGID_DIM,
            micro_fraction: DEFAULT_MICRO_FRACTION,
            ordered: false,
            reference: None,
            max_features: DEFAULT_MAX_FEATURES,
            match_ratio: DEFAULT_MATCH_RATIO,
            ransac_iterations: DEFAULT_RANSAC_ITERATIONS,
            inlier_tolerance: DEFAULT_INLIER_TOLERANCE,
            min_matches: DEFAULT_MIN_MATCHES,
            seed: DEFAULT_SEED,
            flow_levels: DEFAULT_FLOW_LEVELS,
            flow_iterations: DEFAULT_FLOW_ITERATIONS,
            flow_window_radius: DEFAULT_FLOW_WINDOW_RADIUS,
            flow_smooth_sigma: DEFAULT_FLOW_SMOOTH_SIGMA,
            tile_size: DEFAULT_TILE_SIZE,
            worker_count: default_worker_count(),
            region_cache_bytes: DEFAULT_REGION_CACHE_CAPACITY,
            background: DEFAULT_BACKGROUND,
            thumbnail_dim: DEFAULT_THUMBNAIL_DIM,
        }
    }
}

impl RegistrarConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_processed_dim < 64 {
            return Err("max_processed_dim must be at least 64 pixels".to_string());
        }
        if self.max_non_rigid_dim < 64 {
            return Err("max_non_rigid_dim must be at least 64 pixels".to_string());
        }
        if !(self.micro_fraction > 0.0 && self.micro_fraction <= 1.0) {
            return Err("micro_fraction must be in (0, 1]".to_string());
        }

        if self.max_features < self.min_matches {
            return Err("max_features must be at least min_matches".to_string());
        }
        if !(self.match_ratio > 0.0 && self.match_ratio < 1.0) {
            return Err("match_ratio must be in (0, 1)".to_string());
        }
        if self.ransac_iterations == 0 {
            return Err("ransac_iterations must be greater than 0".to_string());
        }
        if self.inlier_tolerance <= 0.0 {
            return Err("inlier_tolerance must be greater than 0".to_string());
        }
        if self.min_matches < 2 {
            return Err("min_matches must be at least 2 (the similarity minimal sample)".to_string());
        }

        if self.flow_levels == 0 {
            return Err("flow_levels must be greater than 0".to_string());
        }
        if self.flow_iterations == 0 {
            return Err("flow_iterations must be greater than 0".to_string());
        }
        if self.flow_window_radius == 0 {
            return Err("flow_window_radius must be greater than 0".to_string());
        }
        if self.flow_smooth_sigma < 0.0 {
            return Err("flow_smooth_sigma must not be negative".to_string());
        }

        if self.tile_size < 64 || self.tile_size > 4096 {
            return Err("tile_size must be between 64 and 4096".to_string());
        }
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".to_string());
        }
        if self.region_cache_bytes < 1024 * 1024 {
            return Err("region_cache_bytes must be at least 1MB".to_string());
        }

        if self.thumbnail_dim < 32 {
            return Err("thumbnail_dim must be at least 32 pixels".to_string());
        }

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
