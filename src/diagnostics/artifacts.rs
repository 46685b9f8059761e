//! Diagnostic artifact rendering and layout.
//!
//! Thumbnails, overlays, match visualizations, and deformation meshes are
//! written under the destination directory so a registration run can be
//! judged at a glance without opening the full-size outputs.

use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};

use crate::error::RegisterError;
use crate::raster::WorkingImage;
use crate::transform::DisplacementField;

/// Per-slide tint palette for overlays, cycled by slide index.
const SLIDE_COLORS: [[u8; 3]; 6] = [
    [230, 60, 60],
    [60, 200, 90],
    [70, 110, 240],
    [230, 200, 60],
    [200, 80, 220],
    [70, 210, 220],
];

/// The overlay tint assigned to a slide index.
pub fn slide_color(index: usize) -> [u8; 3] {
    SLIDE_COLORS[index % SLIDE_COLORS.len()]
}

// =============================================================================
// Directory Layout
// =============================================================================

/// The artifact directory tree under one destination root.
///
/// ```text
/// <dst>/
///   data/                     summary CSV + snapshot
///   overlaps/                 false-color stage overlays
///   rigid_registration/       per-slide rigidly aligned thumbnails
///   non_rigid_registration/   per-slide refined thumbnails
///   deformation_fields/       field meshes over thumbnails
///   processed/                normalized working images
///   matches/                  per-pair match visualizations
/// ```
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn overlaps_dir(&self) -> PathBuf {
        self.root.join("overlaps")
    }

    pub fn rigid_dir(&self) -> PathBuf {
        self.root.join("rigid_registration")
    }

    pub fn non_rigid_dir(&self) -> PathBuf {
        self.root.join("non_rigid_registration")
    }

    pub fn deformation_dir(&self) -> PathBuf {
        self.root.join("deformation_fields")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.root.join("processed")
    }

    pub fn matches_dir(&self) -> PathBuf {
        self.root.join("matches")
    }

    pub fn summary_csv(&self) -> PathBuf {
        self.data_dir().join("summary.csv")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir().join("registrar.json")
    }

    /// Create every directory of the layout.
    pub fn ensure_dirs(&self) -> Result<(), RegisterError> {
        for dir in [
            self.data_dir(),
            self.overlaps_dir(),
            self.rigid_dir(),
            self.non_rigid_dir(),
            self.deformation_dir(),
            self.processed_dir(),
            self.matches_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| RegisterError::Artifact {
                path: dir.display().to_string(),
                detail: e.to_string(),
            })?;
        }
        Ok(())
    }
}

// =============================================================================
// Saving
// =============================================================================

fn artifact_error(path: &Path, detail: impl ToString) -> RegisterError {
    RegisterError::Artifact {
        path: path.display().to_string(),
        detail: detail.to_string(),
    }
}

/// Save a working image as an 8-bit grayscale PNG.
pub fn save_gray_png(path: &Path, image: &WorkingImage) -> Result<(), RegisterError> {
    image
        .to_luma8()
        .save(path)
        .map_err(|e| artifact_error(path, e))
}

/// Save an RGB image as PNG.
pub fn save_rgb_png(path: &Path, image: &RgbImage) -> Result<(), RegisterError> {
    image.save(path).map_err(|e| artifact_error(path, e))
}

// =============================================================================
// Rendering
// =============================================================================

/// Additive false-color overlay of aligned slide thumbnails.
///
/// Each slide is tinted by [`slide_color`] and summed, so aligned tissue
/// turns gray-white while misaligned structures fringe in their slides'
/// colors. Images must share dimensions; returns `None` for an empty or
/// mismatched input.
pub fn overlay_images(images: &[WorkingImage]) -> Option<RgbImage> {
    let first = images.first()?;
    let (w, h) = (first.width(), first.height());
    if images.iter().any(|i| i.width() != w || i.height() != h) {
        return None;
    }

    let mut out = RgbImage::new(w, h);
    for (index, image) in images.iter().enumerate() {
        let [r, g, b] = slide_color(index);
        for y in 0..h {
            for x in 0..w {
                let v = image.get(x, y).clamp(0.0, 1.0);
                let px = out.get_pixel_mut(x, y);
                px[0] = (px[0] as f32 + v * r as f32).min(255.0) as u8;
                px[1] = (px[1] as f32 + v * g as f32).min(255.0) as u8;
                px[2] = (px[2] as f32 + v * b as f32).min(255.0) as u8;
            }
        }
    }
    Some(out)
}

fn put_pixel_checked(img: &mut RgbImage, x: i64, y: i64, color: [u8; 3]) {
    if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
        img.put_pixel(x as u32, y as u32, Rgb(color));
    }
}

/// Integer line segment, clipped to the image.
fn draw_line(img: &mut RgbImage, from: (f64, f64), to: (f64, f64), color: [u8; 3]) {
    let (x0, y0) = (from.0.round() as i64, from.1.round() as i64);
    let (x1, y1) = (to.0.round() as i64, to.1.round() as i64);
    let steps = (x1 - x0).abs().max((y1 - y0).abs()).max(1);
    for i in 0..=steps {
        let t = i as f64 / steps as f64;
        let x = x0 as f64 + (x1 - x0) as f64 * t;
        let y = y0 as f64 + (y1 - y0) as f64 * t;
        put_pixel_checked(img, x.round() as i64, y.round() as i64, color);
    }
}

fn draw_marker(img: &mut RgbImage, at: (f64, f64), color: [u8; 3]) {
    let (cx, cy) = (at.0.round() as i64, at.1.round() as i64);
    for dy in -1..=1 {
        for dx in -1..=1 {
            put_pixel_checked(img, cx + dx, cy + dy, color);
        }
    }
}

/// Side-by-side match visualization: both images with a colored segment
/// per retained correspondence.
pub fn draw_match_overlay(
    a: &WorkingImage,
    b: &WorkingImage,
    points_a: &[(f64, f64)],
    points_b: &[(f64, f64)],
) -> RgbImage {
    let height = a.height().max(b.height());
    let width = a.width() + b.width();
    let mut out = RgbImage::new(width, height);

    for (image, x_off) in [(a, 0u32), (b, a.width())] {
        for y in 0..image.height() {
            for x in 0..image.width() {
                let v = (image.get(x, y).clamp(0.0, 1.0) * 255.0) as u8;
                out.put_pixel(x + x_off, y, Rgb([v, v, v]));
            }
        }
    }

    let offset = a.width() as f64;
    for (i, (pa, pb)) in points_a.iter().zip(points_b).enumerate() {
        let color = slide_color(i);
        let shifted = (pb.0 + offset, pb.1);
        draw_line(&mut out, *pa, shifted, color);
        draw_marker(&mut out, *pa, color);
        draw_marker(&mut out, shifted, color);
    }
    out
}

/// Triangulated mesh deformed by the field, drawn over the image.
///
/// Grid nodes every `spacing` pixels are displaced by the field and joined
/// to their right, lower, and lower-right neighbors, which makes local
/// stretching and shearing of the refinement directly visible.
pub fn draw_deformation_mesh(
    base: &WorkingImage,
    field: &DisplacementField,
    spacing: u32,
) -> RgbImage {
    let (w, h) = (base.width(), base.height());
    let mut out = RgbImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let v = (base.get(x, y).clamp(0.0, 1.0) * 180.0) as u8;
            out.put_pixel(x, y, Rgb([v, v, v]));
        }
    }

    let spacing = spacing.max(2);
    // Field grid coordinates per drawn node; the field may be at a
    // different resolution than the thumbnail.
    let fx_ratio = field.width() as f64 / w as f64;
    let fy_ratio = field.height() as f64 / h as f64;
    let node = |x: u32, y: u32| -> (f64, f64) {
        let (dx, dy) = field.sample(x as f64 * fx_ratio, y as f64 * fy_ratio);
        (x as f64 + dx / fx_ratio, y as f64 + dy / fy_ratio)
    };

    let color = [240, 170, 40];
    let mut y = 0;
    while y < h {
        let mut x = 0;
        while x < w {
            let p = node(x, y);
            if x + spacing < w {
                draw_line(&mut out, p, node(x + spacing, y), color);
            }
            if y + spacing < h {
                draw_line(&mut out, p, node(x, y + spacing), color);
            }
            if x + spacing < w && y + spacing < h {
                draw_line(&mut out, p, node(x + spacing, y + spacing), color);
            }
            x += spacing;
        }
        y += spacing;
    }
    out
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let layout = ArtifactLayout::new("/out/run1");
        assert_eq!(layout.summary_csv(), PathBuf::from("/out/run1/data/summary.csv"));
        assert_eq!(
            layout.snapshot_path(),
            PathBuf::from("/out/run1/data/registrar.json")
        );
        assert!(layout.matches_dir().ends_with("matches"));
    }

    #[test]
    fn test_ensure_dirs_creates_tree() {
        let tmp = TempDir::new().unwrap();
        let layout = ArtifactLayout::new(tmp.path());
        layout.ensure_dirs().unwrap();

        for dir in [
            "data",
            "overlaps",
            "rigid_registration",
            "non_rigid_registration",
            "deformation_fields",
            "processed",
            "matches",
        ] {
            assert!(tmp.path().join(dir).is_dir(), "{dir} missing");
        }
    }

    #[test]
    fn test_overlay_requires_matching_dimensions() {
        let a = WorkingImage::from_fn(8, 8, |_, _| 0.5);
        let b = WorkingImage::from_fn(9, 8, |_, _| 0.5);
        assert!(overlay_images(&[a.clone(), b]).is_none());
        assert!(overlay_images(&[]).is_none());
        assert!(overlay_images(&[a]).is_some());
    }

    #[test]
    fn test_overlay_sums_tints() {
        let bright = WorkingImage::from_fn(4, 4, |_, _| 1.0);
        let overlay = overlay_images(&[bright.clone(), bright]).unwrap();
        let px = overlay.get_pixel(2, 2);
        // First slide red plus second slide green dominate the blue channel.
        assert!(px[0] > 200);
        assert!(px[1] > 200);
        assert!(px[2] < 160);
    }

    #[test]
    fn test_match_overlay_dimensions() {
        let a = WorkingImage::from_fn(16, 12, |_, _| 0.2);
        let b = WorkingImage::from_fn(10, 20, |_, _| 0.8);
        let out = draw_match_overlay(&a, &b, &[(2.0, 2.0)], &[(3.0, 4.0)]);
        assert_eq!(out.width(), 26);
        assert_eq!(out.height(), 20);
        // Marker drawn on the left image.
        assert_ne!(*out.get_pixel(2, 2), Rgb([51, 51, 51]));
    }

    #[test]
    fn test_deformation_mesh_draws_grid() {
        let base = WorkingImage::from_fn(32, 32, |_, _| 0.0);
        let field = DisplacementField::zeros(32, 32, 1.0);
        let out = draw_deformation_mesh(&base, &field, 8);
        // Undisplaced mesh lines run along grid rows.
        let px = out.get_pixel(4, 0);
        assert_eq!(*px, Rgb([240, 170, 40]));
    }

    #[test]
    fn test_save_round_trip() {
        let tmp = TempDir::new().unwrap();
        let image = WorkingImage::from_fn(8, 8, |x, _| x as f32 / 8.0);
        let path = tmp.path().join("thumb.png");
        save_gray_png(&path, &image).unwrap();

        let back = image::open(&path).unwrap().to_luma8();
        assert_eq!(back.width(), 8);
        assert_eq!(back.height(), 8);
    }
}
