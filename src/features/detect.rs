//! FAST corner detection with orientation.

use crate::raster::WorkingImage;

use super::Keypoint;

/// Bresenham circle of radius 3, clockwise from north.
const CIRCLE: [(i64, i64); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

/// Contiguous arc length required for a corner (FAST-9).
const ARC_LENGTH: usize = 9;

/// Default intensity threshold on `[0, 1]` images (roughly 20/255).
const DEFAULT_THRESHOLD: f32 = 0.08;

/// Suppression cell edge in pixels.
const SUPPRESSION_RADIUS: f32 = 5.0;

/// Radius of the patch used for the intensity-centroid orientation.
const ORIENTATION_RADIUS: i64 = 15;

/// FAST-9 detector with grid non-maximum suppression.
///
/// Detection is fully deterministic: candidates are ranked by response
/// with position as the tie-breaker, then greedily accepted unless a
/// stronger corner already claimed a neighboring suppression cell.
#[derive(Debug, Clone)]
pub struct FastDetector {
    threshold: f32,
    max_keypoints: usize,
}

impl FastDetector {
    pub fn new(max_keypoints: usize) -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            max_keypoints,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Detect corners, strongest first, at most `max_keypoints` of them.
    pub fn detect(&self, image: &WorkingImage) -> Vec<Keypoint> {
        let (width, height) = (image.width(), image.height());
        if width <= 6 || height <= 6 {
            return Vec::new();
        }

        let mut candidates = Vec::new();
        for y in 3..(height as i64 - 3) {
            for x in 3..(width as i64 - 3) {
                let center = image.get(x as u32, y as u32);
                if !self.pre_check(image, x, y, center) {
                    continue;
                }
                if let Some(response) = self.corner_response(image, x, y, center) {
                    candidates.push(Keypoint {
                        x: x as f32,
                        y: y as f32,
                        response,
                        angle: 0.0,
                    });
                }
            }
        }

        let mut selected = self.suppress(candidates);
        for kp in &mut selected {
            kp.angle = orientation(image, kp.x as i64, kp.y as i64);
        }
        selected
    }

    /// Cardinal-point rejection. A contiguous nine-pixel arc always covers
    /// at least two of the four compass pixels, so anything with fewer on
    /// one side of the threshold cannot be a corner.
    fn pre_check(&self, image: &WorkingImage, x: i64, y: i64, center: f32) -> bool {
        let bright = center + self.threshold;
        let dark = center - self.threshold;
        let cardinal = [
            image.get_clamped(x, y - 3),
            image.get_clamped(x + 3, y),
            image.get_clamped(x, y + 3),
            image.get_clamped(x - 3, y),
        ];
        let bright_count = cardinal.iter().filter(|&&p| p > bright).count();
        let dark_count = cardinal.iter().filter(|&&p| p < dark).count();
        bright_count >= 2 || dark_count >= 2
    }

    /// Full segment test. Returns the response (mean absolute contrast of
    /// the circle against the center) when the arc criterion holds.
    fn corner_response(&self, image: &WorkingImage, x: i64, y: i64, center: f32) -> Option<f32> {
        let bright = center + self.threshold;
        let dark = center - self.threshold;

        let mut ring = [0.0f32; 16];
        for (i, (dx, dy)) in CIRCLE.iter().enumerate() {
            ring[i] = image.get_clamped(x + dx, y + dy);
        }

        let mut max_bright_run = 0usize;
        let mut max_dark_run = 0usize;
        let mut bright_run = 0usize;
        let mut dark_run = 0usize;
        // Walk the ring twice to catch runs that wrap around.
        for i in 0..(2 * ring.len()) {
            let p = ring[i % ring.len()];
            if p > bright {
                bright_run += 1;
                dark_run = 0;
                max_bright_run = max_bright_run.max(bright_run);
            } else if p < dark {
                dark_run += 1;
                bright_run = 0;
                max_dark_run = max_dark_run.max(dark_run);
            } else {
                bright_run = 0;
                dark_run = 0;
            }
        }

        if max_bright_run < ARC_LENGTH && max_dark_run < ARC_LENGTH {
            return None;
        }
        let contrast: f32 = ring.iter().map(|p| (p - center).abs()).sum();
        Some(contrast / ring.len() as f32)
    }

    /// Grid non-maximum suppression, capped at `max_keypoints`.
    fn suppress(&self, mut candidates: Vec<Keypoint>) -> Vec<Keypoint> {
        if candidates.is_empty() {
            return candidates;
        }

        // Total order: response descending, then scan order.
        candidates.sort_unstable_by(|a, b| {
            b.response
                .partial_cmp(&a.response)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| (a.y as u32, a.x as u32).cmp(&(b.y as u32, b.x as u32)))
        });

        let mut selected = Vec::new();
        let mut occupied = std::collections::HashSet::new();
        for kp in candidates {
            let gx = (kp.x / SUPPRESSION_RADIUS) as i32;
            let gy = (kp.y / SUPPRESSION_RADIUS) as i32;

            let mut free = true;
            'cells: for dy in -1..=1 {
                for dx in -1..=1 {
                    if occupied.contains(&(gx + dx, gy + dy)) {
                        free = false;
                        break 'cells;
                    }
                }
            }
            if free {
                occupied.insert((gx, gy));
                selected.push(kp);
                if selected.len() >= self.max_keypoints {
                    break;
                }
            }
        }
        selected
    }
}

/// Dominant orientation from the intensity centroid of a circular patch.
fn orientation(image: &WorkingImage, x: i64, y: i64) -> f32 {
    let mut m01 = 0.0f32;
    let mut m10 = 0.0f32;
    for dy in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
        for dx in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
            if dx * dx + dy * dy > ORIENTATION_RADIUS * ORIENTATION_RADIUS {
                continue;
            }
            let v = image.get_clamped(x + dx, y + dy);
            m01 += v * dy as f32;
            m10 += v * dx as f32;
        }
    }
    m01.atan2(m10)
}

// =============================================================================
// Tests
// =============================================================================
