//! Non-rigid refinement.
//!
//! After rigid composition, every slide lives on the shared canvas but
//! serial sections still disagree locally: tissue stretches, folds, and
//! tears between cuts. Refiners estimate a dense displacement field over
//! the canvas grid that absorbs those residuals.
//!
//! The refiner seam is deliberately narrow. The driver prepares an
//! [`AlignedPair`] with both images already warped into canvas space (the
//! moving image by its rigid transform plus any prior field), so a refiner
//! only ever solves the residual problem at the resolution it is handed.
//! Swapping the flow engine for another algorithm touches nothing but the
//! trait implementation.

mod flow;
mod micro;

pub use flow::FlowRefiner;
pub use micro::MicroFeatureRefiner;

use std::sync::Arc;

use crate::raster::WorkingImage;
use crate::transform::DisplacementField;

// =============================================================================
// Refiner Seam
// =============================================================================

/// A fixed/moving image pair in canvas space, ready for refinement.
///
/// Images are behind `Arc` so a pair can move into a blocking worker
/// without copying pixels.
#[derive(Debug, Clone)]
pub struct AlignedPair {
    /// Reference-side image on the canvas grid
    pub fixed: Arc<WorkingImage>,

    /// Moving image on the same grid, rigidly aligned (and pre-warped by
    /// any prior field)
    pub moving: Arc<WorkingImage>,

    /// Resolution scale of both images
    pub scale: f64,
}

/// Result of one refinement: the residual field and the alignment error
/// on either side of it.
#[derive(Debug, Clone)]
pub struct Refinement {
    /// Residual displacement over the canvas grid at the pair's scale
    pub field: DisplacementField,

    /// Mean absolute intensity difference before applying the field
    pub residual_before: f64,

    /// Mean absolute intensity difference after applying the field
    pub residual_after: f64,
}

impl Refinement {
    /// Whether the field made the alignment error worse. The driver falls
    /// back to the prior alignment in that case. A field that leaves an
    /// already-perfect pair unchanged is kept.
    pub fn diverged(&self) -> bool {
        self.residual_after > self.residual_before
    }
}

/// Dense residual estimation between two canvas-space images.
pub trait NonRigidRefiner: Send + Sync {
    /// Estimate the displacement field aligning `pair.moving` onto
    /// `pair.fixed`.
    fn refine(&self, pair: &AlignedPair) -> Refinement;
}

// =============================================================================
// Field Warping
// =============================================================================

/// Warp an image by a displacement field on the same grid: each output
/// pixel reads from `position + displacement`.
pub fn warp_working(image: &WorkingImage, field: &DisplacementField) -> WorkingImage {
    debug_assert_eq!(image.width(), field.width());
    debug_assert_eq!(image.height(), field.height());
    WorkingImage::from_fn(image.width(), image.height(), |x, y| {
        let (dx, dy) = field.get(x, y);
        image.sample_bilinear(x as f64 + dx as f64, y as f64 + dy as f64)
    })
}

// =============================================================================
// Tests
// =============================================================================
