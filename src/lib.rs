//! # WSI Registrar
//!
//! A registration engine for serial Whole Slide Images (WSI).
//!
//! This library aligns a series of gigapixel slides (serial sections,
//! re-stains, or multiplexed staining rounds) into one shared coordinate
//! frame and warps them tile by tile in bounded memory. Slide decoding and
//! output encoding stay outside the crate behind narrow async traits, so any
//! pyramid format or storage backend can plug in.
//!
//! ## Features
//!
//! - **Feature-based rigid alignment**: FAST corners, oriented binary
//!   descriptors, ratio-tested matching, and a seeded consensus similarity fit
//! - **Graph ordering**: unordered collections reduce to a maximum-quality
//!   spanning tree; ordered series align along their acquisition chain
//! - **Coarse-to-fine non-rigid refinement**: dense displacement fields from
//!   windowed flow, plus a feature-driven micro pass at higher resolution
//! - **Bounded-memory warping**: output renders tile by tile through the
//!   pyramid accessor; a full-resolution image is never materialized
//! - **Portable state**: versioned JSON snapshots let registration run on one
//!   machine and warping happen later on another
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`slide`] - Pyramid accessor seam, slide metadata, and the region cache
//! - [`raster`] - Working images, preprocessing, and Gaussian pyramids
//! - [`features`] - Keypoint detection, description, matching, and consensus
//! - [`graph`] / [`rigid`] - Registration tree and rigid composition
//! - [`nonrigid`] - Displacement-field refiners
//! - [`warp`] - Tile-streaming warp, channel merge, and the encoder seam
//! - [`registrar`] - Stage-ordered orchestration over a slide source
//! - [`diagnostics`] - Per-pair error tables and visual artifacts
//! - [`snapshot`] - Versioned registration state
//! - [`config`] - Tuning knobs with documented defaults
//!
//! ## Example
//!
//! ```rust,no_run
//! use wsi_registrar::{
//!     Compression, MemoryPyramid, MemorySlideSource, PngDirEncoder, Registrar, RegistrarConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Any PyramidAccessor-backed source works; the in-memory one is the
//!     // simplest to stand up.
//!     let source = MemorySlideSource::new()
//!         .with_slide(MemoryPyramid::from_gray("section_01", 512, 512, vec![0; 512 * 512]))
//!         .with_slide(MemoryPyramid::from_gray("section_02", 512, 512, vec![0; 512 * 512]));
//!
//!     let mut registrar = Registrar::new(source, "out/series", RegistrarConfig::default())?;
//!     registrar.scan().await?;
//!     let result = registrar.register().await?;
//!     println!(
//!         "aligned to '{}' with max rigid error {:.2}px",
//!         result.reference,
//!         result.errors.max_rigid_d()
//!     );
//!
//!     let encoder = PngDirEncoder::new("out/registered");
//!     registrar
//!         .warp_and_save_slides(&encoder, Compression::Lossless)
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod features;
pub mod graph;
pub mod nonrigid;
pub mod raster;
pub mod registrar;
pub mod rigid;
pub mod slide;
pub mod snapshot;
pub mod transform;
pub mod warp;

// Re-export commonly used types
pub use config::RegistrarConfig;
pub use diagnostics::{ErrorTable, PairErrorRow};
pub use error::{RegisterError, SlideError, SnapshotError, WarpError};
pub use features::{extract_features, FeatureSet, Keypoint};
pub use graph::{PairEdge, RegistrationGraph};
pub use nonrigid::{AlignedPair, FlowRefiner, MicroFeatureRefiner, NonRigidRefiner, Refinement};
pub use raster::{LuminancePreprocessor, Preprocessor, WorkingImage};
pub use registrar::{MergeOutput, MicroResult, Registrar, RegistrationResult};
pub use rigid::PairAlignment;
pub use slide::{
    CachedAccessor, Level, MemoryPyramid, MemorySlideSource, PhysicalPixelSize, PixelRegion,
    PyramidAccessor, RegionBox, RegionCache, RegistrationState, Slide, SlideSource,
};
pub use snapshot::{Snapshot, SNAPSHOT_VERSION};
pub use transform::{CanvasInfo, DisplacementField, RigidTransform};
pub use warp::{
    Compression, MergeChannel, MergePlan, OutputMetadata, PngDirEncoder, SlideEncoder,
    SlidePlacement, TileSink, WarpOptions, WarpStats,
};
