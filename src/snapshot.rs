//! Registration snapshots.
//!
//! A snapshot captures everything needed to warp without re-registering:
//! slide identities and pyramid metadata, the shared canvas, per-slide
//! transforms including displacement fields, and the configuration the run
//! used. The format is versioned JSON so registration can happen on one
//! machine and warping on another, or months later.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::RegistrarConfig;
use crate::error::SnapshotError;
use crate::slide::{Level, PhysicalPixelSize};
use crate::transform::{CanvasInfo, DisplacementField, RigidTransform};

/// Version written by this crate. Loading rejects anything else.
pub const SNAPSHOT_VERSION: u32 = 1;

// =============================================================================
// Snapshot Types
// =============================================================================

/// Serialized rigid transform: row-major matrix plus its resolution scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformSnapshot {
    pub rows: [[f64; 3]; 3],
    pub scale: f64,
}

impl TransformSnapshot {
    pub fn capture(transform: &RigidTransform) -> Self {
        Self {
            rows: transform.to_rows(),
            scale: transform.scale(),
        }
    }

    pub fn restore(&self) -> RigidTransform {
        RigidTransform::from_rows(self.rows, self.scale)
    }
}

/// Serialized displacement field: flat planes plus grid geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSnapshot {
    pub width: u32,
    pub height: u32,
    pub scale: f64,
    pub dx: Vec<f32>,
    pub dy: Vec<f32>,
}

impl FieldSnapshot {
    pub fn capture(field: &DisplacementField) -> Self {
        Self {
            width: field.width(),
            height: field.height(),
            scale: field.scale(),
            dx: field.dx().to_vec(),
            dy: field.dy().to_vec(),
        }
    }

    pub fn restore(&self) -> DisplacementField {
        DisplacementField::from_planes(
            self.width,
            self.height,
            self.scale,
            self.dx.clone(),
            self.dy.clone(),
        )
    }
}

/// Serialized canvas geometry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CanvasSnapshot {
    pub width: u32,
    pub height: u32,
    pub scale: f64,
}

impl CanvasSnapshot {
    pub fn capture(canvas: &CanvasInfo) -> Self {
        Self {
            width: canvas.width,
            height: canvas.height,
            scale: canvas.scale,
        }
    }

    pub fn restore(&self) -> CanvasInfo {
        CanvasInfo {
            width: self.width,
            height: self.height,
            scale: self.scale,
        }
    }
}

/// One slide's registered state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlideSnapshot {
    pub identity: String,
    pub levels: Vec<Level>,
    pub channel_names: Vec<String>,
    pub pixel_size: Option<PhysicalPixelSize>,
    pub rigid: TransformSnapshot,
    pub field: Option<FieldSnapshot>,
    pub low_confidence: bool,
    pub non_rigid_fallback: bool,
}

/// Complete registration state of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub config: RegistrarConfig,
    pub working_scale: f64,
    pub reference: usize,
    pub canvas: CanvasSnapshot,
    pub slides: Vec<SlideSnapshot>,
}

// =============================================================================
// Save / Load
// =============================================================================

impl Snapshot {
    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String, SnapshotError> {
        serde_json::to_string_pretty(self).map_err(|e| SnapshotError::Json(e.to_string()))
    }

    /// Parse from JSON, rejecting unknown versions before the body is
    /// interpreted.
    pub fn from_json(json: &str) -> Result<Self, SnapshotError> {
        let value: serde_json::Value =
            serde_json::from_str(json).map_err(|e| SnapshotError::Json(e.to_string()))?;
        let found = value
            .get("version")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| SnapshotError::Json("missing version field".to_string()))?
            as u32;
        if found != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion {
                found,
                supported: SNAPSHOT_VERSION,
            });
        }
        serde_json::from_value(value).map_err(|e| SnapshotError::Json(e.to_string()))
    }

    /// Write to a file.
    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        let json = self.to_json()?;
        std::fs::write(path, json).map_err(|e| SnapshotError::Io(e.to_string()))
    }

    /// Read from a file.
    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let json = std::fs::read_to_string(path).map_err(|e| SnapshotError::Io(e.to_string()))?;
        Self::from_json(&json)
    }
}

// =============================================================================
// Tests
// =============================================================================
