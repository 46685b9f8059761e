//! Output encoding seam for warped slides.
//!
//! The warper produces finished tiles; everything after that is the
//! encoder's business. Keeping the seam at the tile level means the
//! engine never holds a full-resolution output image and an external
//! encoder (an OME-TIFF writer, a cloud uploader) can stream tiles as
//! they arrive.
//!
//! # Design Decisions
//!
//! - **Ordered tiles**: sinks may assume tiles arrive in row-major order
//!   per channel layout, so append-only writers need no reordering buffer.
//!
//! - **Completion marker**: a sink that never sees `finish()` must leave
//!   recognizably incomplete output. The shipped directory sink writes its
//!   metadata file only on `finish()`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use serde::{Deserialize, Serialize};

use crate::error::WarpError;
use crate::slide::{PhysicalPixelSize, PixelRegion};

/// Default lossy output quality (1-100).
pub const DEFAULT_OUTPUT_QUALITY: u8 = 90;

/// Minimum allowed lossy quality.
pub const MIN_OUTPUT_QUALITY: u8 = 1;

/// Maximum allowed lossy quality.
pub const MAX_OUTPUT_QUALITY: u8 = 100;

// =============================================================================
// Compression
// =============================================================================

/// Output compression choice carried in the encoder metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "codec", rename_all = "snake_case")]
pub enum Compression {
    /// Lossy JPEG at the given quality (1-100).
    Jpeg { quality: u8 },

    /// Lossy JPEG 2000 at the given quality (1-100). Requires an encoder
    /// with a JPEG 2000 codec; the shipped directory sink rejects it.
    Jp2k { quality: u8 },

    /// Lossless output.
    Lossless,
}

impl Compression {
    /// The quality factor, for the lossy variants.
    pub fn quality(&self) -> Option<u8> {
        match self {
            Self::Jpeg { quality } | Self::Jp2k { quality } => Some(*quality),
            Self::Lossless => None,
        }
    }

    /// Reject quality factors outside the valid range.
    pub fn validate(&self) -> Result<(), WarpError> {
        match self.quality() {
            Some(q) if !is_valid_quality(q) => Err(WarpError::InvalidQuality { quality: q }),
            _ => Ok(()),
        }
    }
}

impl Default for Compression {
    fn default() -> Self {
        Self::Lossless
    }
}

/// Validate a lossy quality factor.
///
/// Returns `true` if quality is in the valid range (1-100).
#[inline]
pub fn is_valid_quality(quality: u8) -> bool {
    (MIN_OUTPUT_QUALITY..=MAX_OUTPUT_QUALITY).contains(&quality)
}

/// Clamp a quality factor to the valid range.
#[inline]
pub fn clamp_quality(quality: u8) -> u8 {
    quality.clamp(MIN_OUTPUT_QUALITY, MAX_OUTPUT_QUALITY)
}

// =============================================================================
// Encoder Seam
// =============================================================================

/// Everything an encoder needs to know about one output slide before the
/// first tile arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputMetadata {
    /// Output name, used by file-backed sinks as the directory or file stem
    pub name: String,

    /// Output width in pixels
    pub width: u32,

    /// Output height in pixels
    pub height: u32,

    /// Tile edge in pixels; edge tiles may be smaller
    pub tile_size: u32,

    /// Channel names in storage order
    pub channel_names: Vec<String>,

    /// Physical calibration of the output grid, when known
    pub pixel_size: Option<PhysicalPixelSize>,

    /// Compression the tiles should be stored with
    pub compression: Compression,
}

impl OutputMetadata {
    /// Number of tile columns.
    pub fn tiles_across(&self) -> u32 {
        self.width.div_ceil(self.tile_size)
    }

    /// Number of tile rows.
    pub fn tiles_down(&self) -> u32 {
        self.height.div_ceil(self.tile_size)
    }
}

/// Destination for one output slide's tiles.
///
/// Tiles arrive in row-major order. `finish` must be called after the last
/// tile; sinks treat a missing `finish` as an aborted write.
#[async_trait]
pub trait TileSink: Send {
    /// Write the tile at tile-grid position `(tx, ty)`.
    async fn write_tile(&mut self, tx: u32, ty: u32, tile: PixelRegion) -> Result<(), WarpError>;

    /// Seal the output. After this the sink's output is complete.
    async fn finish(&mut self) -> Result<(), WarpError>;
}

/// Factory for tile sinks, one per output slide.
#[async_trait]
pub trait SlideEncoder: Send + Sync {
    type Sink: TileSink + Send;

    /// Open a sink for one output slide.
    ///
    /// # Errors
    ///
    /// Returns [`WarpError::InvalidQuality`] for an out-of-range quality
    /// factor and [`WarpError::Encoding`] when the requested compression is
    /// not available.
    async fn begin(&self, metadata: OutputMetadata) -> Result<Self::Sink, WarpError>;
}

// =============================================================================
// Directory Sink
// =============================================================================

/// Completion record the directory sink writes on `finish`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirManifest {
    pub metadata: OutputMetadata,
    pub tiles_written: u64,
}

/// Tile-per-file encoder writing into a directory tree.
///
/// Each output slide becomes a directory of `tile_<row>_<col>` image files
/// plus a `metadata.json` manifest written only once the slide is complete,
/// so a crashed run leaves no manifest behind. Gray and RGB tiles become one
/// file each; other channel counts are written plane by plane.
///
/// # Example
///
/// ```ignore
/// use wsi_registrar::warp::{Compression, PngDirEncoder, OutputMetadata, SlideEncoder};
///
/// let encoder = PngDirEncoder::new("/data/registered");
/// let mut sink = encoder.begin(metadata).await?;
/// // ... write tiles ...
/// sink.finish().await?;
/// ```
#[derive(Debug, Clone)]
pub struct PngDirEncoder {
    root: PathBuf,
}

impl PngDirEncoder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SlideEncoder for PngDirEncoder {
    type Sink = PngDirSink;

    async fn begin(&self, metadata: OutputMetadata) -> Result<Self::Sink, WarpError> {
        metadata.compression.validate()?;
        if matches!(metadata.compression, Compression::Jp2k { .. }) {
            return Err(WarpError::Encoding {
                detail: "directory sink has no JPEG 2000 codec; use Jpeg or Lossless".to_string(),
            });
        }

        let dir = self.root.join(&metadata.name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| WarpError::Io(e.to_string()))?;

        Ok(PngDirSink {
            dir,
            metadata,
            tiles_written: 0,
        })
    }
}

/// Sink half of [`PngDirEncoder`].
#[derive(Debug)]
pub struct PngDirSink {
    dir: PathBuf,
    metadata: OutputMetadata,
    tiles_written: u64,
}

impl PngDirSink {
    /// Directory the tiles are written into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl TileSink for PngDirSink {
    async fn write_tile(&mut self, tx: u32, ty: u32, tile: PixelRegion) -> Result<(), WarpError> {
        let stem = format!("tile_{ty:04}_{tx:04}");
        for (suffix, bytes) in encode_tile_files(&tile, self.metadata.compression)? {
            let path = self.dir.join(format!("{stem}{suffix}"));
            tokio::fs::write(&path, bytes)
                .await
                .map_err(|e| WarpError::Io(e.to_string()))?;
        }
        self.tiles_written += 1;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), WarpError> {
        let manifest = DirManifest {
            metadata: self.metadata.clone(),
            tiles_written: self.tiles_written,
        };
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| WarpError::Encoding { detail: e.to_string() })?;
        tokio::fs::write(self.dir.join("metadata.json"), json)
            .await
            .map_err(|e| WarpError::Io(e.to_string()))
    }
}

// =============================================================================
// Tile Encoding
// =============================================================================

/// Encode one tile into `(file suffix, bytes)` pairs.
///
/// Gray and RGB tiles map straight onto image formats; any other channel
/// count is split into per-channel gray planes named `_c<channel>`.
fn encode_tile_files(
    tile: &PixelRegion,
    compression: Compression,
) -> Result<Vec<(String, Vec<u8>)>, WarpError> {
    match tile.channels() {
        1 => {
            let bytes = encode_plane(tile.data(), tile.width(), tile.height(), 1, compression)?;
            Ok(vec![(extension(compression).to_string(), bytes)])
        }
        3 => {
            let bytes = encode_plane(tile.data(), tile.width(), tile.height(), 3, compression)?;
            Ok(vec![(extension(compression).to_string(), bytes)])
        }
        n => {
            let mut files = Vec::with_capacity(n as usize);
            for c in 0..n as usize {
                let plane = tile
                    .channel_plane(c)
                    .map_err(|e| WarpError::Encoding { detail: e.to_string() })?;
                let bytes = encode_plane(&plane, tile.width(), tile.height(), 1, compression)?;
                files.push((format!("_c{c:02}{}", extension(compression)), bytes));
            }
            Ok(files)
        }
    }
}

fn extension(compression: Compression) -> &'static str {
    match compression {
        Compression::Jpeg { .. } => ".jpg",
        Compression::Jp2k { .. } => ".jp2",
        Compression::Lossless => ".png",
    }
}

fn encode_plane(
    data: &[u8],
    width: u32,
    height: u32,
    channels: u8,
    compression: Compression,
) -> Result<Vec<u8>, WarpError> {
    let color = match channels {
        1 => ExtendedColorType::L8,
        3 => ExtendedColorType::Rgb8,
        n => {
            return Err(WarpError::Encoding {
                detail: format!("unsupported channel count {n} for a single file"),
            })
        }
    };

    let mut out = Vec::new();
    match compression {
        Compression::Jpeg { quality } => {
            JpegEncoder::new_with_quality(&mut out, clamp_quality(quality))
                .write_image(data, width, height, color)
                .map_err(|e| WarpError::Encoding { detail: e.to_string() })?;
        }
        Compression::Lossless => {
            PngEncoder::new(&mut out)
                .write_image(data, width, height, color)
                .map_err(|e| WarpError::Encoding { detail: e.to_string() })?;
        }
        Compression::Jp2k { .. } => {
            return Err(WarpError::Encoding {
                detail: "no JPEG 2000 codec available".to_string(),
            })
        }
    }
    Ok(out)
}

// =============================================================================
// Tests
// =============================================================================
