//! Geometric transforms and the registration canvas.
//!
//! All transforms are estimated once at the shared working resolution and
//! rescaled on demand. The scale a transform is expressed at travels with
//! it, so rescaling is a local operation with no global bookkeeping:
//! changing resolution multiplies the translation column while the linear
//! part stays fixed.

mod field;

pub use field::DisplacementField;

use nalgebra::Matrix3;

// =============================================================================
// Rigid Transform
// =============================================================================

/// A similarity transform (rotation, isotropic scale, translation) mapping
/// source coordinates into canvas coordinates, expressed at `scale` times
/// full resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidTransform {
    matrix: Matrix3<f64>,
    scale: f64,
}

impl RigidTransform {
    /// Identity transform at the given resolution scale.
    pub fn identity(scale: f64) -> Self {
        Self {
            matrix: Matrix3::identity(),
            scale,
        }
    }

    pub fn new(matrix: Matrix3<f64>, scale: f64) -> Self {
        Self { matrix, scale }
    }

    /// Build from similarity parameters: `factor` isotropic scale, `theta`
    /// rotation in radians, then translation.
    pub fn from_similarity(factor: f64, theta: f64, tx: f64, ty: f64, scale: f64) -> Self {
        let (sin, cos) = theta.sin_cos();
        let matrix = Matrix3::new(
            factor * cos,
            -factor * sin,
            tx,
            factor * sin,
            factor * cos,
            ty,
            0.0,
            0.0,
            1.0,
        );
        Self { matrix, scale }
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    /// Resolution scale this transform is expressed at (fraction of full
    /// resolution, `1.0` = full).
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Apply to a point.
    #[inline]
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let m = &self.matrix;
        (
            m[(0, 0)] * x + m[(0, 1)] * y + m[(0, 2)],
            m[(1, 0)] * x + m[(1, 1)] * y + m[(1, 2)],
        )
    }

    /// Inverse transform at the same scale, `None` when singular.
    pub fn inverse(&self) -> Option<Self> {
        self.matrix.try_inverse().map(|matrix| Self {
            matrix,
            scale: self.scale,
        })
    }

    /// Composition applying `self` first, then `after`. Both transforms
    /// must be expressed at the same scale.
    pub fn then(&self, after: &RigidTransform) -> Self {
        debug_assert!((self.scale - after.scale).abs() < 1e-9);
        Self {
            matrix: after.matrix * self.matrix,
            scale: self.scale,
        }
    }

    /// Append a translation in canvas pixels.
    pub fn translated(&self, dx: f64, dy: f64) -> Self {
        let mut matrix = self.matrix;
        matrix[(0, 2)] += dx;
        matrix[(1, 2)] += dy;
        Self {
            matrix,
            scale: self.scale,
        }
    }

    /// Re-express at a different resolution scale.
    ///
    /// Coordinates at two scales differ by a pure ratio, so only the
    /// translation column changes; rotation and scale factor are
    /// resolution-independent.
    pub fn rescaled(&self, to_scale: f64) -> Self {
        let ratio = to_scale / self.scale;
        let mut matrix = self.matrix;
        matrix[(0, 2)] *= ratio;
        matrix[(1, 2)] *= ratio;
        Self {
            matrix,
            scale: to_scale,
        }
    }

    /// Isotropic scale factor of the similarity.
    pub fn scale_factor(&self) -> f64 {
        let m = &self.matrix;
        (m[(0, 0)] * m[(1, 1)] - m[(0, 1)] * m[(1, 0)]).abs().sqrt()
    }

    /// Rotation angle in radians.
    pub fn rotation(&self) -> f64 {
        self.matrix[(1, 0)].atan2(self.matrix[(0, 0)])
    }

    /// Translation components in pixels at this transform's scale.
    pub fn translation(&self) -> (f64, f64) {
        (self.matrix[(0, 2)], self.matrix[(1, 2)])
    }

    pub fn is_identity(&self, tol: f64) -> bool {
        let diff = self.matrix - Matrix3::identity();
        diff.iter().all(|v| v.abs() <= tol)
    }

    /// Bounding box of a transformed `width x height` extent:
    /// `(min_x, min_y, max_x, max_y)` in canvas coordinates.
    pub fn transformed_bounds(&self, width: u32, height: u32) -> (f64, f64, f64, f64) {
        let w = width as f64;
        let h = height as f64;
        let corners = [
            self.apply(0.0, 0.0),
            self.apply(w, 0.0),
            self.apply(0.0, h),
            self.apply(w, h),
        ];
        let mut min_x = f64::INFINITY;
        let mut min_y = f64::INFINITY;
        let mut max_x = f64::NEG_INFINITY;
        let mut max_y = f64::NEG_INFINITY;
        for (x, y) in corners {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
        (min_x, min_y, max_x, max_y)
    }

    /// Matrix rows for serialization.
    pub fn to_rows(&self) -> [[f64; 3]; 3] {
        let m = &self.matrix;
        [
            [m[(0, 0)], m[(0, 1)], m[(0, 2)]],
            [m[(1, 0)], m[(1, 1)], m[(1, 2)]],
            [m[(2, 0)], m[(2, 1)], m[(2, 2)]],
        ]
    }

    /// Rebuild from serialized rows.
    pub fn from_rows(rows: [[f64; 3]; 3], scale: f64) -> Self {
        let matrix = Matrix3::new(
            rows[0][0], rows[0][1], rows[0][2], //
            rows[1][0], rows[1][1], rows[1][2], //
            rows[2][0], rows[2][1], rows[2][2],
        );
        Self { matrix, scale }
    }
}

// =============================================================================
// Canvas
// =============================================================================

/// The shared output space all slides are registered into: the union
/// bounding box of every rigidly transformed slide, at working scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CanvasInfo {
    /// Canvas width in pixels at `scale`
    pub width: u32,

    /// Canvas height in pixels at `scale`
    pub height: u32,

    /// Resolution scale the canvas is expressed at
    pub scale: f64,
}

impl CanvasInfo {
    /// Canvas dimensions re-expressed at full resolution.
    pub fn full_dimensions(&self) -> (u64, u64) {
        (
            (self.width as f64 / self.scale).round() as u64,
            (self.height as f64 / self.scale).round() as u64,
        )
    }

    /// Canvas dimensions at an arbitrary scale.
    pub fn dimensions_at(&self, scale: f64) -> (u32, u32) {
        let ratio = scale / self.scale;
        (
            (self.width as f64 * ratio).round().max(1.0) as u32,
            (self.height as f64 * ratio).round().max(1.0) as u32,
        )
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_apply_and_inverse_round_trip() {
        let t = RigidTransform::from_similarity(1.2, 0.3, 15.0, -4.0, 0.5);
        let (x, y) = t.apply(10.0, 20.0);
        let inv = t.inverse().unwrap();
        let (bx, by) = inv.apply(x, y);
        assert_relative_eq!(bx, 10.0, epsilon = 1e-9);
        assert_relative_eq!(by, 20.0, epsilon = 1e-9);
    }

    #[test]
    fn test_parameter_extraction() {
        let t = RigidTransform::from_similarity(1.5, 0.4, 7.0, -2.0, 1.0);
        assert_relative_eq!(t.scale_factor(), 1.5, epsilon = 1e-12);
        assert_relative_eq!(t.rotation(), 0.4, epsilon = 1e-12);
        assert_eq!(t.translation(), (7.0, -2.0));
    }

    #[test]
    fn test_rescale_only_touches_translation() {
        let t = RigidTransform::from_similarity(1.1, 0.25, 40.0, 60.0, 0.25);
        let full = t.rescaled(1.0);

        assert_relative_eq!(full.scale_factor(), t.scale_factor(), epsilon = 1e-12);
        assert_relative_eq!(full.rotation(), t.rotation(), epsilon = 1e-12);
        assert_eq!(full.translation(), (160.0, 240.0));
        assert_eq!(full.scale(), 1.0);
    }

    #[test]
    fn test_rescale_round_trip() {
        let t = RigidTransform::from_similarity(0.9, -0.7, 12.5, 3.25, 0.5);
        let back = t.rescaled(0.125).rescaled(0.5);
        for r in 0..3 {
            for c in 0..3 {
                assert_relative_eq!(
                    back.matrix()[(r, c)],
                    t.matrix()[(r, c)],
                    epsilon = 1e-12
                );
            }
        }
    }

    #[test]
    fn test_rescale_commutes_with_apply() {
        // Mapping a point at working scale then rescaling the result must
        // agree with rescaling the transform and mapping the scaled point.
        let t = RigidTransform::from_similarity(1.05, 0.1, 9.0, -6.0, 0.25);
        let (x, y) = (33.0, 21.0);

        let (cx, cy) = t.apply(x, y);
        let (fx, fy) = t.rescaled(1.0).apply(x / 0.25, y / 0.25);
        assert_relative_eq!(fx, cx / 0.25, epsilon = 1e-9);
        assert_relative_eq!(fy, cy / 0.25, epsilon = 1e-9);
    }

    #[test]
    fn test_then_applies_in_order() {
        let first = RigidTransform::from_similarity(1.0, 0.0, 10.0, 0.0, 1.0);
        let second = RigidTransform::from_similarity(2.0, 0.0, 0.0, 0.0, 1.0);
        let both = first.then(&second);

        // (1, 1) -> translate -> (11, 1) -> double -> (22, 2)
        let (x, y) = both.apply(1.0, 1.0);
        assert_relative_eq!(x, 22.0, epsilon = 1e-12);
        assert_relative_eq!(y, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_transformed_bounds_rotation() {
        // 90-degree rotation of a 100x50 extent about the origin.
        let t = RigidTransform::from_similarity(1.0, std::f64::consts::FRAC_PI_2, 0.0, 0.0, 1.0);
        let (min_x, min_y, max_x, max_y) = t.transformed_bounds(100, 50);
        assert_relative_eq!(min_x, -50.0, epsilon = 1e-9);
        assert_relative_eq!(min_y, 0.0, epsilon = 1e-9);
        assert_relative_eq!(max_x, 0.0, epsilon = 1e-9);
        assert_relative_eq!(max_y, 100.0, epsilon = 1e-9);
    }

    #[test]
    fn test_rows_round_trip() {
        let t = RigidTransform::from_similarity(1.3, 0.2, 5.0, 6.0, 0.5);
        let back = RigidTransform::from_rows(t.to_rows(), t.scale());
        assert_eq!(t, back);
    }

    #[test]
    fn test_is_identity() {
        assert!(RigidTransform::identity(0.5).is_identity(1e-12));
        let nudged = RigidTransform::identity(0.5).translated(0.5, 0.0);
        assert!(!nudged.is_identity(1e-3));
        assert!(nudged.is_identity(1.0));
    }

    #[test]
    fn test_canvas_dimensions() {
        let canvas = CanvasInfo {
            width: 400,
            height: 300,
            scale: 0.25,
        };
        assert_eq!(canvas.full_dimensions(), (1600, 1200));
        assert_eq!(canvas.dimensions_at(0.5), (800, 600));
        assert_eq!(canvas.dimensions_at(0.25), (400, 300));
    }
}
