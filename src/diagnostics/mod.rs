//! Registration quality reporting.
//!
//! The engine never decides whether a registration is "good enough"; it
//! measures and reports. For every aligned pair the retained feature
//! correspondences are re-measured through each stage's transform chain,
//! giving a target registration error before alignment, after the rigid
//! stage, and after non-rigid refinement. The rows are exposed as data and
//! written as a plain CSV so acceptance thresholds can live outside the
//! engine.

mod artifacts;

pub use artifacts::{
    draw_deformation_mesh, draw_match_overlay, overlay_images, save_gray_png, save_rgb_png,
    slide_color, ArtifactLayout,
};

use std::path::Path;

use crate::error::RegisterError;
use crate::slide::PhysicalPixelSize;
use crate::warp::SlidePlacement;

// =============================================================================
// Error Table
// =============================================================================

/// Alignment error of one registered pair, measured on its retained
/// feature correspondences.
#[derive(Debug, Clone, PartialEq)]
pub struct PairErrorRow {
    /// Parent-side slide name
    pub from: String,

    /// Child-side slide name
    pub to: String,

    /// Full-resolution dimensions of the child slide
    pub width: u64,
    pub height: u64,

    /// Unit the distance columns are expressed in (`px` when uncalibrated)
    pub physical_unit: String,

    /// Mean correspondence distance before any alignment
    pub original_d: f64,

    /// Mean correspondence distance after the rigid stage
    pub rigid_d: f64,

    /// Mean correspondence distance after non-rigid refinement, absent
    /// when no field was estimated for either slide
    pub non_rigid_d: Option<f64>,

    /// Mean displacement magnitude of the child's field
    pub mean_displacement: f64,

    /// Pair degraded to an inherited transform during rigid composition
    pub low_confidence: bool,

    /// Non-rigid refinement diverged and was discarded
    pub non_rigid_fallback: bool,
}

/// The per-pair error rows of one registration run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorTable {
    rows: Vec<PairErrorRow>,
}

impl ErrorTable {
    pub fn new(rows: Vec<PairErrorRow>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[PairErrorRow] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Largest rigid error across all pairs.
    pub fn max_rigid_d(&self) -> f64 {
        self.rows.iter().map(|r| r.rigid_d).fold(0.0, f64::max)
    }

    /// Render as CSV text, header first.
    pub fn to_csv(&self) -> String {
        let mut out = String::from(
            "from,to,width,height,physical_units,original_d,rigid_d,non_rigid_d,\
             mean_displacement,low_confidence,non_rigid_fallback\n",
        );
        for row in &self.rows {
            let non_rigid = row
                .non_rigid_d
                .map(|d| format!("{d:.4}"))
                .unwrap_or_default();
            out.push_str(&format!(
                "{},{},{},{},{},{:.4},{:.4},{},{:.4},{},{}\n",
                csv_field(&row.from),
                csv_field(&row.to),
                row.width,
                row.height,
                csv_field(&row.physical_unit),
                row.original_d,
                row.rigid_d,
                non_rigid,
                row.mean_displacement,
                row.low_confidence,
                row.non_rigid_fallback,
            ));
        }
        out
    }

    /// Write the CSV to disk.
    pub fn write_csv(&self, path: &Path) -> Result<(), RegisterError> {
        std::fs::write(path, self.to_csv()).map_err(|e| RegisterError::Artifact {
            path: path.display().to_string(),
            detail: e.to_string(),
        })
    }
}

/// Quote a CSV field when it carries a delimiter.
fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

// =============================================================================
// Pair Measurement
// =============================================================================

/// Everything needed to measure one pair.
pub struct PairMeasurement<'a> {
    pub from: &'a str,
    pub to: &'a str,

    /// Retained correspondences at working scale, parent side
    pub points_from: &'a [(f64, f64)],

    /// Retained correspondences at working scale, child side
    pub points_to: &'a [(f64, f64)],

    pub placement_from: &'a SlidePlacement,
    pub placement_to: &'a SlidePlacement,

    /// Shared working scale the points are expressed at
    pub working_scale: f64,

    /// Calibration of the child slide, when known
    pub pixel_size: Option<&'a PhysicalPixelSize>,

    /// Full-resolution dimensions of the child slide
    pub full_dims: (u64, u64),

    pub low_confidence: bool,
    pub non_rigid_fallback: bool,
}

/// Measure one pair's error through every stage.
///
/// Distances are computed in full-resolution pixels and converted to the
/// physical unit when calibration is available.
pub fn measure_pair(input: &PairMeasurement<'_>) -> PairErrorRow {
    let unit_scale = input.pixel_size.map(|p| (p.x + p.y) / 2.0).unwrap_or(1.0);
    let unit_name = input
        .pixel_size
        .map(|p| p.unit.clone())
        .unwrap_or_else(|| "px".to_string());
    let n = input.points_from.len().min(input.points_to.len());

    let mut original = 0.0;
    let mut rigid = 0.0;
    let mut non_rigid = 0.0;
    let rigid_from = input.placement_from.rigid.rescaled(1.0);
    let rigid_to = input.placement_to.rigid.rescaled(1.0);
    for i in 0..n {
        let (fx, fy) = input.points_from[i];
        let (tx, ty) = input.points_to[i];
        // Working-scale points up to full resolution.
        let pf = (fx / input.working_scale, fy / input.working_scale);
        let pt = (tx / input.working_scale, ty / input.working_scale);

        original += distance(pf, pt);

        let qf = rigid_from.apply(pf.0, pf.1);
        let qt = rigid_to.apply(pt.0, pt.1);
        rigid += distance(qf, qt);

        let wf = input.placement_from.registered_point(pf.0, pf.1);
        let wt = input.placement_to.registered_point(pt.0, pt.1);
        non_rigid += distance(wf, wt);
    }
    let norm = if n > 0 { n as f64 } else { 1.0 };
    let has_field =
        input.placement_from.field.is_some() || input.placement_to.field.is_some();

    let mean_displacement = input
        .placement_to
        .field
        .as_ref()
        .map(|f| f.mean_magnitude() / f.scale())
        .unwrap_or(0.0);

    PairErrorRow {
        from: input.from.to_string(),
        to: input.to.to_string(),
        width: input.full_dims.0,
        height: input.full_dims.1,
        physical_unit: unit_name,
        original_d: original / norm * unit_scale,
        rigid_d: rigid / norm * unit_scale,
        non_rigid_d: has_field.then_some(non_rigid / norm * unit_scale),
        mean_displacement: mean_displacement * unit_scale,
        low_confidence: input.low_confidence,
        non_rigid_fallback: input.non_rigid_fallback,
    }
}

fn distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

// =============================================================================
// Tests
// =============================================================================
