//! End-to-end registration of synthetic slide series.
//!
//! Tests verify:
//! - Recovered placements on an unordered three-slide series
//! - Error reduction from the unregistered to the rigid stage
//! - Idempotence on an already-aligned pair
//! - Chain ordering, reference choice, and degradation paths

use wsi_registrar::error::RegisterError;
use wsi_registrar::slide::{MemorySlideSource, RegistrationState};
use wsi_registrar::Registrar;

use super::test_utils::{
    blank_slide, init_tracing, render_slide, test_config, Placement,
};

const W: u32 = 192;
const H: u32 = 168;

/// Three views of the same tissue: identity, a shift, and a small
/// rotation with a shift.
fn three_slide_placements() -> [Placement; 3] {
    [
        Placement::identity(),
        Placement::shift(11.0, -7.0),
        Placement {
            theta: 0.03,
            dx: -6.0,
            dy: 9.0,
        },
    ]
}

fn three_slide_source() -> MemorySlideSource {
    let placements = three_slide_placements();
    MemorySlideSource::new()
        .with_slide(render_slide("s0", W, H, placements[0]))
        .with_slide(render_slide("s1", W, H, placements[1]))
        .with_slide(render_slide("s2", W, H, placements[2]))
}

// =============================================================================
// Unordered Series
// =============================================================================

#[tokio::test]
async fn test_unordered_series_recovers_placements() {
    init_tracing();
    let dst = tempfile::TempDir::new().unwrap();
    let mut registrar = Registrar::new(three_slide_source(), dst.path(), test_config()).unwrap();
    assert_eq!(registrar.scan().await.unwrap(), 3);
    let result = registrar.register().await.unwrap();

    assert!(result.skipped.is_empty());
    assert!(result.low_confidence.is_empty());

    // Two tree edges for three slides, each improved by the rigid stage.
    assert_eq!(result.errors.rows().len(), 2);
    for row in result.errors.rows() {
        assert!(row.original_d > 5.0, "pair starts misaligned: {row:?}");
        assert!(row.rigid_d < 2.5, "rigid stage must align: {row:?}");
        assert!(row.rigid_d < row.original_d);
        assert!(!row.low_confidence);
    }

    // Every slide sees the same tissue point at the same registered
    // position. s0 is the identity placement, so tissue coordinates are
    // s0 pixel coordinates.
    let placements = three_slide_placements();
    let probes = [(70.0, 70.0), (120.0, 90.0), (95.0, 120.0)];
    for (index, name) in ["s1", "s2"].iter().enumerate() {
        for &(px, py) in &probes {
            let (tx, ty) = placements[index + 1].forward(px, py);
            let from_base = registrar.warp_point("s0", tx, ty).unwrap();
            let from_slide = registrar.warp_point(name, px, py).unwrap();
            assert!(
                (from_base.0 - from_slide.0).abs() < 2.5
                    && (from_base.1 - from_slide.1).abs() < 2.5,
                "{name} probe ({px}, {py}): {from_base:?} vs {from_slide:?}"
            );
        }
    }
}

#[tokio::test]
async fn test_register_reports_all_stages_complete() {
    let dst = tempfile::TempDir::new().unwrap();
    let mut registrar = Registrar::new(three_slide_source(), dst.path(), test_config()).unwrap();
    registrar.scan().await.unwrap();
    let result = registrar.register().await.unwrap();

    assert!((result.working_scale - 1.0).abs() < 1e-9);
    for name in ["s0", "s1", "s2"] {
        assert_eq!(
            registrar.slide_state(name),
            Some(RegistrationState::NonRigidRefined),
            "{name} should be refined"
        );
    }
    assert_eq!(registrar.reference(), Some(result.reference.as_str()));
}

// =============================================================================
// Idempotence
// =============================================================================

#[tokio::test]
async fn test_aligned_pair_stays_in_place() {
    init_tracing();
    let source = MemorySlideSource::new()
        .with_slide(render_slide("left", W, H, Placement::identity()))
        .with_slide(render_slide("right", W, H, Placement::identity()));
    let dst = tempfile::TempDir::new().unwrap();
    let mut registrar = Registrar::new(source, dst.path(), test_config()).unwrap();
    registrar.scan().await.unwrap();
    let result = registrar.register().await.unwrap();

    // Identical slides: the recovered relative motion is the identity and
    // the canvas is no larger than one slide (plus bounds rounding).
    let row = &result.errors.rows()[0];
    assert!(row.original_d < 1.0, "identical slides match in place: {row:?}");
    assert!(row.rigid_d < 1.0);
    assert!(result.canvas.width >= W && result.canvas.width <= W + 1);
    assert!(result.canvas.height >= H && result.canvas.height <= H + 1);

    for &(px, py) in &[(40.0, 40.0), (130.0, 100.0)] {
        let a = registrar.warp_point("left", px, py).unwrap();
        let b = registrar.warp_point("right", px, py).unwrap();
        assert!(
            (a.0 - b.0).abs() < 1.0 && (a.1 - b.1).abs() < 1.0,
            "probe ({px}, {py}): {a:?} vs {b:?}"
        );
    }
}

// =============================================================================
// Ordered Series
// =============================================================================

#[tokio::test]
async fn test_ordered_series_anchors_on_middle_slide() {
    let mut config = test_config();
    config.ordered = true;
    let dst = tempfile::TempDir::new().unwrap();
    let mut registrar = Registrar::new(three_slide_source(), dst.path(), config).unwrap();
    registrar.scan().await.unwrap();
    let result = registrar.register().await.unwrap();

    // Serial sections chain consecutively and anchor on the middle slide.
    assert_eq!(result.reference, "s1");
    assert_eq!(result.errors.rows().len(), 2);
    for row in result.errors.rows() {
        assert!(row.rigid_d < row.original_d, "{row:?}");
    }
}

#[tokio::test]
async fn test_untrusted_pair_inherits_parent_placement() {
    let mut config = test_config();
    config.ordered = true;
    let source = MemorySlideSource::new()
        .with_slide(render_slide("s0", W, H, Placement::identity()))
        .with_slide(render_slide("s1", W, H, Placement::shift(9.0, 4.0)))
        .with_slide(blank_slide("s2_blank", W, H));
    let dst = tempfile::TempDir::new().unwrap();
    let mut registrar = Registrar::new(source, dst.path(), config).unwrap();
    registrar.scan().await.unwrap();
    let result = registrar.register().await.unwrap();

    // The featureless slide cannot be matched; in an ordered series it is
    // kept at its parent's placement and flagged instead of failing the run.
    assert_eq!(result.low_confidence, vec!["s2_blank".to_string()]);

    let snapshot = registrar.snapshot().unwrap();
    let by_name = |name: &str| {
        snapshot
            .slides
            .iter()
            .find(|s| s.identity == name)
            .unwrap()
    };
    assert_eq!(by_name("s2_blank").rigid.rows, by_name("s1").rigid.rows);
    assert!(by_name("s2_blank").low_confidence);
    assert!(!by_name("s1").low_confidence);
}

// =============================================================================
// Degradation
// =============================================================================

#[tokio::test]
async fn test_featureless_slide_disconnects_unordered_graph() {
    let source = MemorySlideSource::new()
        .with_slide(render_slide("s0", W, H, Placement::identity()))
        .with_slide(render_slide("s1", W, H, Placement::shift(9.0, 4.0)))
        .with_slide(blank_slide("void", W, H));
    let dst = tempfile::TempDir::new().unwrap();
    let mut registrar = Registrar::new(source, dst.path(), test_config()).unwrap();
    registrar.scan().await.unwrap();

    // Without an assumed order there is no parent to inherit from, so an
    // unmatchable slide leaves the graph disconnected.
    match registrar.register().await {
        Err(RegisterError::GraphDisconnected { unreachable }) => {
            assert_eq!(unreachable, vec!["void".to_string()]);
        }
        other => panic!("expected GraphDisconnected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_point_mapping_requires_registration() {
    let dst = tempfile::TempDir::new().unwrap();
    let mut registrar = Registrar::new(three_slide_source(), dst.path(), test_config()).unwrap();
    registrar.scan().await.unwrap();

    match registrar.warp_point("s0", 10.0, 10.0) {
        Err(RegisterError::StageNotReady(_)) => {}
        other => panic!("expected StageNotReady, got {other:?}"),
    }
}
