//! Snapshot persistence across process boundaries.
//!
//! Tests verify:
//! - A restored registrar produces byte-identical warp output
//! - `register()` leaves a loadable snapshot among its artifacts

use wsi_registrar::slide::{MemorySlideSource, RegistrationState};
use wsi_registrar::snapshot::{Snapshot, SNAPSHOT_VERSION};
use wsi_registrar::warp::Compression;
use wsi_registrar::Registrar;

use super::test_utils::{init_tracing, render_slide, test_config, CaptureEncoder, Placement};

const W: u32 = 160;
const H: u32 = 144;

fn pair_source() -> MemorySlideSource {
    MemorySlideSource::new()
        .with_slide(render_slide("fixed", W, H, Placement::identity()))
        .with_slide(render_slide("moving", W, H, Placement::shift(7.0, -5.0)))
}

#[tokio::test]
async fn test_restored_registrar_warps_identically() {
    init_tracing();
    let dst = tempfile::TempDir::new().unwrap();
    let mut registrar = Registrar::new(pair_source(), dst.path(), test_config()).unwrap();
    registrar.scan().await.unwrap();
    registrar.register().await.unwrap();

    let live = CaptureEncoder::new();
    registrar
        .warp_and_save_slides(&live, Compression::Lossless)
        .await
        .unwrap();

    let path = dst.path().join("state.json");
    registrar.save_snapshot(&path).unwrap();

    // Restore into a fresh registrar over a re-opened source, as a later
    // process would.
    let dst2 = tempfile::TempDir::new().unwrap();
    let restored = Registrar::load_snapshot(&path, pair_source(), dst2.path())
        .await
        .unwrap();
    for name in ["fixed", "moving"] {
        let state = restored.slide_state(name).unwrap();
        assert!(state >= RegistrationState::RigidAligned, "{name}: {state:?}");
    }

    let reloaded = CaptureEncoder::new();
    restored
        .warp_and_save_slides(&reloaded, Compression::Lossless)
        .await
        .unwrap();

    for name in ["fixed", "moving"] {
        let a = live.output(name).await.unwrap();
        let b = reloaded.output(name).await.unwrap();
        assert_eq!(a.metadata, b.metadata, "{name} metadata");
        assert_eq!(a.pixels, b.pixels, "{name} pixels");
    }

    // Point mapping survives the round trip as well.
    let (ax, ay) = registrar.warp_point("moving", 45.0, 81.0).unwrap();
    let (bx, by) = restored.warp_point("moving", 45.0, 81.0).unwrap();
    assert!((ax - bx).abs() < 1e-9 && (ay - by).abs() < 1e-9);
}

#[tokio::test]
async fn test_register_writes_loadable_snapshot() {
    let dst = tempfile::TempDir::new().unwrap();
    let mut registrar = Registrar::new(pair_source(), dst.path(), test_config()).unwrap();
    registrar.scan().await.unwrap();
    let result = registrar.register().await.unwrap();

    let snapshot = Snapshot::load(&dst.path().join("data").join("registrar.json")).unwrap();
    assert_eq!(snapshot.version, SNAPSHOT_VERSION);

    let identities: Vec<&str> = snapshot.slides.iter().map(|s| s.identity.as_str()).collect();
    assert_eq!(identities, ["fixed", "moving"]);
    assert_eq!(snapshot.slides[snapshot.reference].identity, result.reference);

    let canvas = registrar.canvas().unwrap();
    let restored = snapshot.canvas.restore();
    assert_eq!(restored.width, canvas.width);
    assert_eq!(restored.height, canvas.height);
    assert!((restored.scale - canvas.scale).abs() < 1e-12);

    // The reference anchors the canvas; everything else hangs off it with
    // a trusted transform in this clean series.
    assert!(snapshot.slides[snapshot.reference].field.is_none());
    for slide in &snapshot.slides {
        assert!(!slide.low_confidence, "{} flagged", slide.identity);
        assert!((slide.rigid.scale - snapshot.working_scale).abs() < 1e-12);
    }
}
