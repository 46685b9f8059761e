//! Tile-streaming warper.
//!
//! The output canvas is walked tile by tile. Each tile's pixels are
//! inverse-mapped through the slide's transform chain into source
//! coordinates, the bounding source patch is fetched through the pyramid
//! accessor at a matching resolution, and the tile is resampled from the
//! patch. Peak memory is one tile plus its source patch per worker, no
//! matter how large the slide, and a full-resolution warped image is never
//! materialized.

use std::sync::Arc;

use tokio::task;
use tracing::debug;

use crate::config::RegistrarConfig;
use crate::error::WarpError;
use crate::slide::{PixelRegion, PyramidAccessor, RegionBox};
use crate::transform::{CanvasInfo, DisplacementField, RigidTransform};

use super::encoder::TileSink;

/// Fixed-point iterations for forward point mapping.
const FORWARD_MAP_ITERATIONS: usize = 12;

/// Convergence tolerance for forward point mapping, in pixels.
const FORWARD_MAP_TOLERANCE: f64 = 1e-3;

// =============================================================================
// Placement
// =============================================================================

/// Where one registered slide sits in the shared canvas.
///
/// The rigid transform maps working-scale slide pixels into the canvas;
/// the optional displacement field holds the non-rigid residual on the
/// canvas grid at its own scale. Together they define the full-resolution
/// mapping both for pixels and for points.
#[derive(Debug, Clone)]
pub struct SlidePlacement {
    /// Rigid transform from working-scale slide pixels into the canvas
    pub rigid: RigidTransform,

    /// Non-rigid displacement over the canvas grid, when refined
    pub field: Option<DisplacementField>,

    /// Canvas geometry shared by the whole series
    pub canvas: CanvasInfo,

    /// Full-resolution source dimensions
    pub source_dims: (u32, u32),
}

impl SlidePlacement {
    /// Displacement at a full-resolution canvas point, zero without a field.
    fn displacement(&self, x: f64, y: f64) -> (f64, f64) {
        match &self.field {
            Some(field) => field.displacement_at_full(x, y),
            None => (0.0, 0.0),
        }
    }

    /// Map a full-resolution canvas point back to full-resolution source
    /// coordinates: the displacement is added, then the rigid transform is
    /// inverted. Returns `None` for a degenerate rigid transform.
    pub fn source_point(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let inverse = self.rigid.rescaled(1.0).inverse()?;
        let (dx, dy) = self.displacement(x, y);
        Some(inverse.apply(x + dx, y + dy))
    }

    /// Map a full-resolution source point into the canvas.
    ///
    /// The rigid part is closed-form; the field term is folded in by
    /// fixed-point iteration, which converges quickly because displacement
    /// varies slowly relative to its magnitude.
    pub fn registered_point(&self, x: f64, y: f64) -> (f64, f64) {
        let full = self.rigid.rescaled(1.0);
        let (tx, ty) = full.apply(x, y);
        if self.field.is_none() {
            return (tx, ty);
        }

        let (mut qx, mut qy) = (tx, ty);
        for _ in 0..FORWARD_MAP_ITERATIONS {
            let (dx, dy) = self.displacement(qx, qy);
            let (nx, ny) = (tx - dx, ty - dy);
            let step = (nx - qx).abs().max((ny - qy).abs());
            qx = nx;
            qy = ny;
            if step < FORWARD_MAP_TOLERANCE {
                break;
            }
        }
        (qx, qy)
    }
}

// =============================================================================
// Options
// =============================================================================

/// Knobs for one warp run.
#[derive(Debug, Clone)]
pub struct WarpOptions {
    /// Output tile edge in pixels
    pub tile_size: u32,

    /// Number of tiles rendered concurrently
    pub worker_count: usize,

    /// Fill value for pixels mapping outside the source
    pub background: u8,

    /// Output resolution as a fraction of full resolution
    pub output_scale: f64,
}

impl WarpOptions {
    pub fn from_config(config: &RegistrarConfig) -> Self {
        Self {
            tile_size: config.tile_size,
            worker_count: config.worker_count,
            background: config.background,
            output_scale: 1.0,
        }
    }

    pub fn with_output_scale(mut self, scale: f64) -> Self {
        self.output_scale = scale;
        self
    }
}

/// What a warp run produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarpStats {
    /// Tiles handed to the sink
    pub tiles: u64,

    /// Output width in pixels
    pub width: u32,

    /// Output height in pixels
    pub height: u32,
}

// =============================================================================
// Tile Rendering
// =============================================================================

/// Inverse-map every pixel of one output tile into source coordinates.
///
/// Returns the per-pixel coordinates and the bounding source region of the
/// in-bounds ones, `None` when the tile misses the source entirely.
fn map_tile_coords(
    placement: &SlidePlacement,
    output_scale: f64,
    tile: RegionBox,
) -> Result<(Vec<(f32, f32)>, Option<RegionBox>), WarpError> {
    let inverse = placement
        .rigid
        .rescaled(1.0)
        .inverse()
        .ok_or_else(|| WarpError::Worker {
            detail: "rigid transform is not invertible".to_string(),
        })?;

    let (src_w, src_h) = placement.source_dims;
    let (max_sx, max_sy) = (src_w as f64 - 0.5, src_h as f64 - 0.5);
    let mut coords = Vec::with_capacity(tile.width as usize * tile.height as usize);
    let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
    let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);

    for oy in tile.y..tile.y + tile.height {
        let qy = (oy as f64 + 0.5) / output_scale - 0.5;
        for ox in tile.x..tile.x + tile.width {
            let qx = (ox as f64 + 0.5) / output_scale - 0.5;
            let (dx, dy) = placement.displacement(qx, qy);
            let (sx, sy) = inverse.apply(qx + dx, qy + dy);
            if sx >= -0.5 && sx <= max_sx && sy >= -0.5 && sy <= max_sy {
                min_x = min_x.min(sx);
                min_y = min_y.min(sy);
                max_x = max_x.max(sx);
                max_y = max_y.max(sy);
            }
            coords.push((sx as f32, sy as f32));
        }
    }

    if !min_x.is_finite() {
        return Ok((coords, None));
    }
    // Pad for bilinear support, clamp to the source.
    let x0 = (min_x.floor() - 1.0).max(0.0) as u32;
    let y0 = (min_y.floor() - 1.0).max(0.0) as u32;
    let x1 = ((max_x.ceil() + 2.0).max(0.0) as u64).min(src_w as u64) as u32;
    let y1 = ((max_y.ceil() + 2.0).max(0.0) as u64).min(src_h as u64) as u32;
    if x1 <= x0 || y1 <= y0 {
        return Ok((coords, None));
    }
    Ok((coords, Some(RegionBox::new(x0, y0, x1 - x0, y1 - y0))))
}

/// Resample one output tile from its fetched source patch.
fn resample_tile(
    tile: RegionBox,
    coords: &[(f32, f32)],
    src_box: RegionBox,
    patch: &PixelRegion,
    source_dims: (u32, u32),
    background: u8,
) -> PixelRegion {
    let channels = patch.channels() as usize;
    let ratio_x = patch.width() as f64 / src_box.width as f64;
    let ratio_y = patch.height() as f64 / src_box.height as f64;
    let (max_sx, max_sy) = (
        source_dims.0 as f64 - 0.5,
        source_dims.1 as f64 - 0.5,
    );

    let mut data = Vec::with_capacity(coords.len() * channels);
    for &(sx, sy) in coords {
        let (sx, sy) = (sx as f64, sy as f64);
        if sx < -0.5 || sx > max_sx || sy < -0.5 || sy > max_sy {
            data.extend(std::iter::repeat(background).take(channels));
            continue;
        }
        let px = (sx - src_box.x as f64 + 0.5) * ratio_x - 0.5;
        let py = (sy - src_box.y as f64 + 0.5) * ratio_y - 0.5;
        for c in 0..channels {
            data.push(patch.sample_bilinear(px, py, c).round().clamp(0.0, 255.0) as u8);
        }
    }
    PixelRegion::from_interleaved(tile.width, tile.height, patch.channels(), data)
}

fn background_tile(tile: RegionBox, channels: u16, background: u8) -> PixelRegion {
    let len = tile.width as usize * tile.height as usize * channels as usize;
    PixelRegion::from_interleaved(tile.width, tile.height, channels, vec![background; len])
}

/// Render one output tile for one slide.
pub(crate) async fn render_tile<A>(
    accessor: Arc<A>,
    placement: Arc<SlidePlacement>,
    options: WarpOptions,
    tile: RegionBox,
    channels: u16,
) -> Result<PixelRegion, WarpError>
where
    A: PyramidAccessor + Send + Sync + 'static,
{
    let map_placement = Arc::clone(&placement);
    let output_scale = options.output_scale;
    let (coords, bbox) =
        task::spawn_blocking(move || map_tile_coords(&map_placement, output_scale, tile))
            .await
            .map_err(|e| WarpError::Worker { detail: e.to_string() })??;

    let Some(src_box) = bbox else {
        return Ok(background_tile(tile, channels, options.background));
    };

    // Fetch at a resolution matching the output so no more than one level's
    // worth of extra source pixels is ever decoded.
    let fetch_scale = (output_scale / placement.rigid.scale_factor()).clamp(1e-3, 1.0);
    let patch = accessor
        .read_scaled_region(fetch_scale, src_box)
        .await
        .map_err(|e| WarpError::for_slide(accessor.identity(), e))?;

    let background = options.background;
    task::spawn_blocking(move || {
        resample_tile(tile, &coords, src_box, &patch, placement.source_dims, background)
    })
    .await
    .map_err(|e| WarpError::Worker { detail: e.to_string() })
}

// =============================================================================
// Slide Warping
// =============================================================================

/// Row-major output tiles for a canvas at the options' output scale.
pub(crate) fn tile_grid(canvas: &CanvasInfo, options: &WarpOptions) -> (u32, u32, Vec<RegionBox>) {
    let (out_w, out_h) = canvas.dimensions_at(options.output_scale);
    let ts = options.tile_size;
    let mut tiles = Vec::new();
    for ty in 0..out_h.div_ceil(ts) {
        let y = ty * ts;
        for tx in 0..out_w.div_ceil(ts) {
            let x = tx * ts;
            tiles.push(RegionBox::new(x, y, ts.min(out_w - x), ts.min(out_h - y)));
        }
    }
    (out_w, out_h, tiles)
}

/// Warp one registered slide onto the canvas, streaming tiles to `sink`.
///
/// Tiles render concurrently in groups of `worker_count` but are written
/// in row-major order, so the sink output is deterministic.
///
/// # Errors
///
/// Fails on accessor errors, a worker panic, or a sink write failure; any
/// of these abandons the slide's output without a completion marker.
pub async fn warp_slide<A, S>(
    accessor: Arc<A>,
    placement: Arc<SlidePlacement>,
    channels: u16,
    options: &WarpOptions,
    sink: &mut S,
) -> Result<WarpStats, WarpError>
where
    A: PyramidAccessor + Send + Sync + 'static,
    S: TileSink + ?Sized,
{
    let (out_w, out_h, tiles) = tile_grid(&placement.canvas, options);
    let mut stats = WarpStats {
        tiles: 0,
        width: out_w,
        height: out_h,
    };

    for batch in tiles.chunks(options.worker_count.max(1)) {
        let mut handles = Vec::with_capacity(batch.len());
        for tile in batch {
            let accessor = Arc::clone(&accessor);
            let placement = Arc::clone(&placement);
            let options = options.clone();
            let tile = *tile;
            handles.push(tokio::spawn(async move {
                render_tile(accessor, placement, options, tile, channels).await
            }));
        }
        for (tile, handle) in batch.iter().zip(handles) {
            let region = handle
                .await
                .map_err(|e| WarpError::Worker { detail: e.to_string() })??;
            sink.write_tile(tile.x / options.tile_size, tile.y / options.tile_size, region)
                .await?;
            stats.tiles += 1;
        }
    }

    debug!(
        slide = accessor.identity(),
        tiles = stats.tiles,
        width = out_w,
        height = out_h,
        "warp complete"
    );
    Ok(stats)
}

// =============================================================================
// Tests
// =============================================================================
