//! Warp surface tests on registered synthetic series.
//!
//! Tests verify:
//! - Tiled output is identical to output produced in one big tile
//! - Merged output stacks channels in registration order and dedups names
//! - Registered slide corners stay inside the composed canvas
//! - Rename validation rejects mismatched channel lists

use std::collections::HashMap;

use wsi_registrar::config::RegistrarConfig;
use wsi_registrar::error::WarpError;
use wsi_registrar::slide::MemorySlideSource;
use wsi_registrar::warp::Compression;
use wsi_registrar::Registrar;

use super::test_utils::{
    init_tracing, render_multichannel, render_slide, test_config, CaptureEncoder, CapturedOutput,
    Placement,
};

const W: u32 = 160;
const H: u32 = 144;

/// Integer-shift pair: the recovered similarity is a pure translation, so
/// warping reads the source through the exact-crop fast path and output
/// bytes are fully deterministic.
async fn registered_pair(
    config: RegistrarConfig,
    dst: &tempfile::TempDir,
) -> Registrar<MemorySlideSource> {
    let source = MemorySlideSource::new()
        .with_slide(render_slide("fixed", W, H, Placement::identity()))
        .with_slide(render_slide("moving", W, H, Placement::shift(7.0, -5.0)));
    let mut registrar = Registrar::new(source, dst.path(), config).unwrap();
    registrar.scan().await.unwrap();
    registrar.register().await.unwrap();
    registrar
}

// =============================================================================
// Tiling Equivalence
// =============================================================================

async fn warp_with_tile_size(tile_size: u32) -> (CapturedOutput, CapturedOutput) {
    let dst = tempfile::TempDir::new().unwrap();
    let mut config = test_config();
    config.tile_size = tile_size;
    let registrar = registered_pair(config, &dst).await;

    let encoder = CaptureEncoder::new();
    let stats = registrar
        .warp_and_save_slides(&encoder, Compression::Lossless)
        .await
        .unwrap();
    assert_eq!(stats.len(), 2);
    (
        encoder.output("fixed").await.unwrap(),
        encoder.output("moving").await.unwrap(),
    )
}

#[tokio::test]
async fn test_tiled_output_matches_single_tile_output() {
    init_tracing();
    // Same series registered twice; the configs differ only in tiling, so
    // the recovered placements are identical and the warped bytes must be
    // too, tile seams included.
    let (fixed_tiled, moving_tiled) = warp_with_tile_size(64).await;
    let (fixed_whole, moving_whole) = warp_with_tile_size(1024).await;

    assert!(fixed_whole.metadata.tiles_across() == 1 && fixed_whole.metadata.tiles_down() == 1);
    assert!(fixed_tiled.metadata.tiles_across() > 1);

    assert_eq!(fixed_tiled.metadata.width, fixed_whole.metadata.width);
    assert_eq!(fixed_tiled.metadata.height, fixed_whole.metadata.height);
    assert_eq!(fixed_tiled.pixels, fixed_whole.pixels);
    assert_eq!(moving_tiled.pixels, moving_whole.pixels);
}

#[tokio::test]
async fn test_warped_outputs_overlap_on_shared_tissue() {
    let dst = tempfile::TempDir::new().unwrap();
    let registrar = registered_pair(test_config(), &dst).await;

    let encoder = CaptureEncoder::new();
    registrar
        .warp_and_save_slides(&encoder, Compression::Lossless)
        .await
        .unwrap();
    let fixed = encoder.output("fixed").await.unwrap();
    let moving = encoder.output("moving").await.unwrap();

    // In the overlap interior both warped slides show the same tissue.
    let mut checked = 0u32;
    let mut differing = 0u32;
    for y in (20..fixed.metadata.height.min(H) - 20).step_by(7) {
        for x in (20..fixed.metadata.width.min(W) - 20).step_by(7) {
            checked += 1;
            let a = fixed.sample(x, y, 0) as i32;
            let b = moving.sample(x, y, 0) as i32;
            if (a - b).abs() > 8 {
                differing += 1;
            }
        }
    }
    assert!(checked > 100);
    // Block-noise boundaries tolerate a few interpolated pixels.
    assert!(
        differing * 20 < checked,
        "{differing} of {checked} probes differ"
    );
}

// =============================================================================
// Merged Output
// =============================================================================

#[tokio::test]
async fn test_merge_stacks_and_dedups_channels() {
    init_tracing();
    let dst = tempfile::TempDir::new().unwrap();
    let source = MemorySlideSource::new()
        .with_slide(render_multichannel(
            "round1",
            W,
            H,
            Placement::identity(),
            &["dapi", "cd3"],
        ))
        .with_slide(render_multichannel(
            "round2",
            W,
            H,
            Placement::shift(6.0, 3.0),
            &["dapi", "cd8"],
        ));
    let mut registrar = Registrar::new(source, dst.path(), test_config()).unwrap();
    registrar.scan().await.unwrap();
    registrar.register().await.unwrap();

    let encoder = CaptureEncoder::new();
    let merged = registrar
        .warp_and_merge_slides(&encoder, "panel", None, true, Compression::Lossless)
        .await
        .unwrap();

    // Channels concatenate in registration order; the repeated "dapi"
    // keeps its first occurrence only.
    let names: Vec<&str> = merged.channels.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["dapi", "cd3", "cd8"]);
    assert_eq!(merged.channels[2].slide_index, 1);
    assert_eq!(merged.channels[2].channel_index, 1);

    let output = encoder.output("panel").await.unwrap();
    assert_eq!(
        output.metadata.channel_names,
        vec!["dapi".to_string(), "cd3".to_string(), "cd8".to_string()]
    );

    // The merged planes are the slides' own warped planes: compare the
    // "cd8" plane against round2 warped on its own.
    let separate = CaptureEncoder::new();
    registrar
        .warp_and_save_slides(&separate, Compression::Lossless)
        .await
        .unwrap();
    let round2 = separate.output("round2").await.unwrap();
    for y in (0..output.metadata.height).step_by(17) {
        for x in (0..output.metadata.width).step_by(13) {
            assert_eq!(output.sample(x, y, 2), round2.sample(x, y, 1));
        }
    }
}

#[tokio::test]
async fn test_merge_rejects_wrong_rename_length() {
    let dst = tempfile::TempDir::new().unwrap();
    let registrar = registered_pair(test_config(), &dst).await;

    let mut renames = HashMap::new();
    renames.insert("moving".to_string(), vec!["a".to_string(), "b".to_string()]);
    let result = registrar
        .warp_and_merge_slides(
            &CaptureEncoder::new(),
            "panel",
            Some(&renames),
            false,
            Compression::Lossless,
        )
        .await;
    match result {
        Err(WarpError::ChannelMismatch {
            slide,
            given,
            expected,
        }) => {
            assert_eq!(slide, "moving");
            assert_eq!(given, 2);
            assert_eq!(expected, 1);
        }
        other => panic!("expected ChannelMismatch, got {other:?}"),
    }
}

// =============================================================================
// Canvas Containment
// =============================================================================

#[tokio::test]
async fn test_registered_corners_stay_inside_canvas() {
    let dst = tempfile::TempDir::new().unwrap();
    let registrar = registered_pair(test_config(), &dst).await;
    let canvas = registrar.canvas().unwrap();
    let (full_w, full_h) = canvas.full_dimensions();

    let corners = [
        (0.0, 0.0),
        (W as f64 - 1.0, 0.0),
        (0.0, H as f64 - 1.0),
        (W as f64 - 1.0, H as f64 - 1.0),
    ];
    for slide in ["fixed", "moving"] {
        for &(px, py) in &corners {
            let (cx, cy) = registrar.warp_point(slide, px, py).unwrap();
            assert!(
                cx > -3.0 && cx < full_w as f64 + 3.0,
                "{slide} corner ({px}, {py}) maps to ({cx}, {cy})"
            );
            assert!(
                cy > -3.0 && cy < full_h as f64 + 3.0,
                "{slide} corner ({px}, {py}) maps to ({cx}, {cy})"
            );
        }
    }
}
