//! Test utilities for integration tests.
//!
//! This module provides synthetic slide series with known ground-truth
//! placements, plus a capturing encoder that reassembles warped tiles into
//! full in-memory images for inspection.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use wsi_registrar::config::RegistrarConfig;
use wsi_registrar::error::WarpError;
use wsi_registrar::slide::{MemoryPyramid, PixelRegion};
use wsi_registrar::warp::{OutputMetadata, SlideEncoder, TileSink};

// =============================================================================
// Tracing
// =============================================================================

/// Install a subscriber once so `RUST_LOG=debug cargo test` shows stage logs.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// =============================================================================
// Synthetic Tissue
// =============================================================================

/// Deterministic block-noise "tissue" defined on the whole plane.
///
/// Two block scales give the corner detector plenty of structure at working
/// resolution while keeping the pattern stable under small rotations, so a
/// slide rendered through any nearby similarity still matches.
pub fn tissue(x: f64, y: f64) -> u8 {
    let coarse = block_hash(x, y, 16.0);
    let fine = block_hash(x + 311.0, y - 173.0, 7.0);
    (40.0 + coarse * 140.0 + fine * 60.0) as u8
}

fn block_hash(x: f64, y: f64, period: f64) -> f64 {
    let bx = (x / period).floor();
    let by = (y / period).floor();
    ((bx * 12.9898 + by * 78.233).sin() * 43758.5453)
        .fract()
        .abs()
}

/// Similarity placement of a synthetic slide on the shared tissue plane:
/// slide pixel `(x, y)` shows the tissue at `forward(x, y)`.
///
/// Two slides `a` (identity) and `b` therefore observe the same tissue point
/// at `a`-pixel `b.forward(p)` and `b`-pixel `p`, which is the ground truth
/// the registration should recover.
#[derive(Debug, Clone, Copy)]
pub struct Placement {
    pub theta: f64,
    pub dx: f64,
    pub dy: f64,
}

impl Placement {
    pub fn identity() -> Self {
        Self::shift(0.0, 0.0)
    }

    pub fn shift(dx: f64, dy: f64) -> Self {
        Self {
            theta: 0.0,
            dx,
            dy,
        }
    }

    pub fn forward(&self, x: f64, y: f64) -> (f64, f64) {
        let (sin, cos) = self.theta.sin_cos();
        (cos * x - sin * y + self.dx, sin * x + cos * y + self.dy)
    }
}

/// Render one single-channel slide of the shared tissue plane.
pub fn render_slide(
    identity: &str,
    width: u32,
    height: u32,
    placement: Placement,
) -> MemoryPyramid {
    let mut data = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            let (tx, ty) = placement.forward(x as f64, y as f64);
            data.push(tissue(tx, ty));
        }
    }
    MemoryPyramid::from_gray(identity, width, height, data)
}

/// Render a multi-channel slide. Each channel samples a shifted copy of the
/// tissue plane so the planes are distinguishable in merged output.
pub fn render_multichannel(
    identity: &str,
    width: u32,
    height: u32,
    placement: Placement,
    channels: &[&str],
) -> MemoryPyramid {
    let count = channels.len();
    let mut data = Vec::with_capacity((width * height) as usize * count);
    for y in 0..height {
        for x in 0..width {
            let (tx, ty) = placement.forward(x as f64, y as f64);
            for c in 0..count {
                data.push(tissue(tx + 37.0 * c as f64, ty - 19.0 * c as f64));
            }
        }
    }
    let names = channels.iter().map(|c| c.to_string()).collect();
    MemoryPyramid::build(identity, width, height, names, data)
}

/// A flat gray slide. Produces no corners, so every pair involving it is
/// untrusted.
pub fn blank_slide(identity: &str, width: u32, height: u32) -> MemoryPyramid {
    MemoryPyramid::from_gray(identity, width, height, vec![128; (width * height) as usize])
}

/// Configuration sized for the small synthetic series used in these tests.
pub fn test_config() -> RegistrarConfig {
    RegistrarConfig {
        worker_count: 2,
        ..RegistrarConfig::default()
    }
}

// =============================================================================
// Capturing Encoder
// =============================================================================

/// One assembled output slide: metadata plus the full interleaved buffer.
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub metadata: OutputMetadata,
    pub pixels: Vec<u8>,
}

impl CapturedOutput {
    /// Sample one channel value at output coordinates.
    pub fn sample(&self, x: u32, y: u32, channel: usize) -> u8 {
        let channels = self.metadata.channel_names.len();
        let index = (y as usize * self.metadata.width as usize + x as usize) * channels + channel;
        self.pixels[index]
    }
}

/// Encoder that reassembles tiles into whole images in memory.
///
/// Useful for asserting on warped pixels without a filesystem round trip;
/// outputs only become visible once the sink is finished, mirroring the
/// completion contract of the shipped directory sink.
#[derive(Debug, Default, Clone)]
pub struct CaptureEncoder {
    outputs: Arc<Mutex<HashMap<String, CapturedOutput>>>,
}

impl CaptureEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn output(&self, name: &str) -> Option<CapturedOutput> {
        self.outputs.lock().await.get(name).cloned()
    }

    pub async fn output_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.outputs.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl SlideEncoder for CaptureEncoder {
    type Sink = CaptureSink;

    async fn begin(&self, metadata: OutputMetadata) -> Result<Self::Sink, WarpError> {
        metadata.compression.validate()?;
        let len =
            metadata.width as usize * metadata.height as usize * metadata.channel_names.len();
        Ok(CaptureSink {
            metadata,
            pixels: vec![0; len],
            outputs: Arc::clone(&self.outputs),
        })
    }
}

/// Sink half of [`CaptureEncoder`].
pub struct CaptureSink {
    metadata: OutputMetadata,
    pixels: Vec<u8>,
    outputs: Arc<Mutex<HashMap<String, CapturedOutput>>>,
}

#[async_trait]
impl TileSink for CaptureSink {
    async fn write_tile(&mut self, tx: u32, ty: u32, tile: PixelRegion) -> Result<(), WarpError> {
        let channels = tile.channels() as usize;
        let width = self.metadata.width as usize;
        let x0 = (tx * self.metadata.tile_size) as usize;
        let y0 = (ty * self.metadata.tile_size) as usize;
        for y in 0..tile.height() {
            for x in 0..tile.width() {
                for c in 0..channels {
                    let index =
                        ((y0 + y as usize) * width + x0 + x as usize) * channels + c;
                    self.pixels[index] = tile.sample(x, y, c);
                }
            }
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), WarpError> {
        self.outputs.lock().await.insert(
            self.metadata.name.clone(),
            CapturedOutput {
                metadata: self.metadata.clone(),
                pixels: std::mem::take(&mut self.pixels),
            },
        );
        Ok(())
    }
}
