//! Channel merging across registered slides.
//!
//! Cyclic staining rounds image the same section repeatedly with different
//! markers. After registration those rounds share one canvas, so their
//! channels can be interleaved into a single multi-channel output. The
//! merged layout is decided up front by a [`MergePlan`]; pixels then flow
//! through the same tiled warp path as single-slide output.

use std::sync::Arc;

use tracing::debug;

use crate::error::WarpError;
use crate::slide::{PixelRegion, PyramidAccessor};

use super::encoder::TileSink;
use super::warper::{render_tile, tile_grid, SlidePlacement, WarpOptions, WarpStats};

// =============================================================================
// Merge Plan
// =============================================================================

/// One channel of the merged output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeChannel {
    /// Index of the contributing slide in merge input order
    pub slide_index: usize,

    /// Channel index within that slide
    pub channel_index: usize,

    /// Output channel name
    pub name: String,
}

/// Ordered channel layout of a merged output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    entries: Vec<MergeChannel>,
}

impl MergePlan {
    /// Build the merged channel list from per-slide channel names.
    ///
    /// Slides contribute channels in input order. With `drop_duplicates`
    /// set, only the first occurrence of each channel name survives and
    /// later duplicates are omitted without disturbing the order, so
    /// `[A, B]` followed by `[B, C]` merges to exactly `[A, B, C]`.
    ///
    /// # Errors
    ///
    /// Returns [`WarpError::NothingToMerge`] when no channels remain.
    pub fn build(channel_lists: &[Vec<String>], drop_duplicates: bool) -> Result<Self, WarpError> {
        let mut entries: Vec<MergeChannel> = Vec::new();
        for (slide_index, names) in channel_lists.iter().enumerate() {
            for (channel_index, name) in names.iter().enumerate() {
                if drop_duplicates && entries.iter().any(|e| &e.name == name) {
                    continue;
                }
                entries.push(MergeChannel {
                    slide_index,
                    channel_index,
                    name: name.clone(),
                });
            }
        }
        if entries.is_empty() {
            return Err(WarpError::NothingToMerge);
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[MergeChannel] {
        &self.entries
    }

    /// Output channel names in storage order.
    pub fn channel_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct contributing slides in first-use order.
    fn slides_used(&self) -> Vec<usize> {
        let mut slides = Vec::new();
        for entry in &self.entries {
            if !slides.contains(&entry.slide_index) {
                slides.push(entry.slide_index);
            }
        }
        slides
    }
}

// =============================================================================
// Merged Warping
// =============================================================================

/// Interleave per-slide tiles into one multi-channel tile per the plan.
fn interleave_tile(
    plan: &MergePlan,
    rendered: &[(usize, PixelRegion)],
    width: u32,
    height: u32,
) -> Result<PixelRegion, WarpError> {
    let mut sources = Vec::with_capacity(plan.len());
    for entry in plan.entries() {
        let tile = rendered
            .iter()
            .find(|(slide, _)| *slide == entry.slide_index)
            .map(|(_, tile)| tile)
            .ok_or_else(|| WarpError::Worker {
                detail: format!("no rendered tile for slide {}", entry.slide_index),
            })?;
        sources.push((tile, entry.channel_index));
    }

    let channels = plan.len();
    let mut data = Vec::with_capacity(width as usize * height as usize * channels);
    for y in 0..height {
        for x in 0..width {
            for (tile, channel) in &sources {
                data.push(tile.sample(x, y, *channel));
            }
        }
    }
    Ok(PixelRegion::from_interleaved(width, height, channels as u16, data))
}

/// Warp every contributing slide and interleave their channels into one
/// multi-channel output, streaming merged tiles to `sink`.
///
/// All placements must share the same canvas; tiles are emitted in
/// row-major order. Within a tile the contributing slides render
/// concurrently.
pub async fn warp_and_merge<A, S>(
    accessors: &[Arc<A>],
    placements: &[Arc<SlidePlacement>],
    plan: &MergePlan,
    options: &WarpOptions,
    sink: &mut S,
) -> Result<WarpStats, WarpError>
where
    A: PyramidAccessor + Send + Sync + 'static,
    S: TileSink + ?Sized,
{
    let slides = plan.slides_used();
    if let Some(&bad) = slides
        .iter()
        .find(|&&s| s >= accessors.len() || s >= placements.len())
    {
        return Err(WarpError::Worker {
            detail: format!("merge plan references slide index {bad} out of range"),
        });
    }
    debug_assert!(placements
        .iter()
        .all(|p| p.canvas == placements[0].canvas));

    let canvas = placements[slides[0]].canvas;
    let (out_w, out_h, tiles) = tile_grid(&canvas, options);
    let mut stats = WarpStats {
        tiles: 0,
        width: out_w,
        height: out_h,
    };

    for tile in tiles {
        let mut handles = Vec::with_capacity(slides.len());
        for &slide in &slides {
            let accessor = Arc::clone(&accessors[slide]);
            let placement = Arc::clone(&placements[slide]);
            let options = options.clone();
            let channels = accessor.channel_names().len() as u16;
            handles.push(tokio::spawn(async move {
                let region = render_tile(accessor, placement, options, tile, channels).await?;
                Ok::<_, WarpError>((slide, region))
            }));
        }

        let mut rendered = Vec::with_capacity(slides.len());
        for handle in handles {
            rendered.push(
                handle
                    .await
                    .map_err(|e| WarpError::Worker { detail: e.to_string() })??,
            );
        }

        let merged = interleave_tile(plan, &rendered, tile.width, tile.height)?;
        sink.write_tile(tile.x / options.tile_size, tile.y / options.tile_size, merged)
            .await?;
        stats.tiles += 1;
    }

    debug!(
        channels = plan.len(),
        slides = slides.len(),
        tiles = stats.tiles,
        "merge complete"
    );
    Ok(stats)
}

// =============================================================================
// Tests
// =============================================================================
