//! Warping registered slides to outputs.
//!
//! This module turns registration results into pixels. The warper walks
//! the output canvas tile by tile, inverse-maps each tile through a
//! slide's transform chain, and hands finished tiles to an encoder sink;
//! merging interleaves channels from several registered slides into one
//! multi-channel output through the same tile path.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │               Registrar                 │
//! └────────────────────┬────────────────────┘
//!                      │ SlidePlacement per slide
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │                Warper                   │
//! │  ┌──────────────┐  ┌─────────────────┐  │
//! │  │ inverse map  │  │  MergePlan      │  │
//! │  │ tile render  │  │  (interleave)   │  │
//! │  └──────────────┘  └─────────────────┘  │
//! └────────────────────┬────────────────────┘
//!                      │ row-major tiles
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │        SlideEncoder / TileSink          │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`SlidePlacement`]: one slide's rigid transform, optional field, and
//!   canvas geometry; also maps individual points both ways
//! - [`warp_slide`] / [`warp_and_merge`]: tile-streaming drivers
//! - [`MergePlan`]: merged channel layout with duplicate dropping
//! - [`SlideEncoder`] / [`TileSink`]: the external encoder seam
//! - [`PngDirEncoder`]: shipped tile-per-file sink used by tests and
//!   simple exports

mod encoder;
mod merge;
mod warper;

pub use encoder::{
    clamp_quality, is_valid_quality, Compression, DirManifest, OutputMetadata, PngDirEncoder,
    PngDirSink, SlideEncoder, TileSink, DEFAULT_OUTPUT_QUALITY, MAX_OUTPUT_QUALITY,
    MIN_OUTPUT_QUALITY,
};
pub use merge::{warp_and_merge, MergeChannel, MergePlan};
pub use warper::{warp_slide, SlidePlacement, WarpOptions, WarpStats};
