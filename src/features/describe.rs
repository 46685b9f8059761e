//! Rotated binary descriptors.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::raster::WorkingImage;

use super::{Descriptor, FeatureSet, Keypoint};

/// Number of binary intensity tests per descriptor.
const TEST_COUNT: usize = 256;

/// Half-width of the sampling patch.
const PATTERN_RADIUS: i32 = 13;

/// The test pattern is drawn once from this fixed seed so descriptors are
/// comparable across processes.
const PATTERN_SEED: u64 = 0x5157_49EE;

/// BRIEF-style descriptor extractor with per-keypoint rotation.
///
/// Each of the 256 tests compares two offsets around the keypoint; the
/// offsets are rotated by the keypoint's orientation before sampling, which
/// makes the descriptor rotation-invariant up to sampling error.
#[derive(Debug, Clone)]
pub struct BriefExtractor {
    pattern: Vec<(f32, f32, f32, f32)>,
}

impl BriefExtractor {
    pub fn new() -> Self {
        let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
        let mut pattern = Vec::with_capacity(TEST_COUNT);
        for _ in 0..TEST_COUNT {
            pattern.push((
                rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS) as f32,
                rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS) as f32,
                rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS) as f32,
                rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS) as f32,
            ));
        }
        Self { pattern }
    }

    /// Describe keypoints on a blurred image.
    pub fn describe(&self, blurred: &WorkingImage, keypoints: Vec<Keypoint>) -> FeatureSet {
        let descriptors = keypoints
            .iter()
            .map(|kp| self.describe_one(blurred, kp))
            .collect();
        FeatureSet {
            keypoints,
            descriptors,
        }
    }

    fn describe_one(&self, image: &WorkingImage, kp: &Keypoint) -> Descriptor {
        let (sin, cos) = kp.angle.sin_cos();
        let x = kp.x as i64;
        let y = kp.y as i64;

        let mut bits = [0u8; 32];
        for (byte_index, tests) in self.pattern.chunks(8).enumerate() {
            let mut byte = 0u8;
            for (bit_index, &(ax, ay, bx, by)) in tests.iter().enumerate() {
                let ra = (
                    (ax * cos - ay * sin).round() as i64,
                    (ax * sin + ay * cos).round() as i64,
                );
                let rb = (
                    (bx * cos - by * sin).round() as i64,
                    (bx * sin + by * cos).round() as i64,
                );
                let pa = image.get_clamped(x + ra.0, y + ra.1);
                let pb = image.get_clamped(x + rb.0, y + rb.1);
                if pa < pb {
                    byte |= 1 << bit_index;
                }
            }
            bits[byte_index] = byte;
        }
        Descriptor(bits)
    }
}

impl Default for BriefExtractor {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn keypoint(x: f32, y: f32, angle: f32) -> Keypoint {
        Keypoint {
            x,
            y,
            response: 1.0,
            angle,
        }
    }

    fn textured() -> WorkingImage {
        WorkingImage::from_fn(96, 96, |x, y| {
            ((x as f32 * 0.37).sin() + (y as f32 * 0.23).cos() + 2.0) / 4.0
        })
    }

    #[test]
    fn test_pattern_is_stable() {
        let a = BriefExtractor::new();
        let b = BriefExtractor::new();
        assert_eq!(a.pattern, b.pattern);
        assert_eq!(a.pattern.len(), TEST_COUNT);
    }

    #[test]
    fn test_same_patch_zero_distance() {
        let image = textured();
        let extractor = BriefExtractor::new();
        let set = extractor.describe(
            &image,
            vec![keypoint(40.0, 40.0, 0.5), keypoint(40.0, 40.0, 0.5)],
        );
        assert_eq!(set.descriptors[0].distance(&set.descriptors[1]), 0);
    }

    #[test]
    fn test_distinct_patches_differ() {
        let image = textured();
        let extractor = BriefExtractor::new();
        let set = extractor.describe(
            &image,
            vec![keypoint(30.0, 30.0, 0.0), keypoint(70.0, 55.0, 0.0)],
        );
        assert!(set.descriptors[0].distance(&set.descriptors[1]) > 20);
    }

    #[test]
    fn test_orientation_changes_sampling() {
        let image = textured();
        let extractor = BriefExtractor::new();
        let set = extractor.describe(
            &image,
            vec![
                keypoint(48.0, 48.0, 0.0),
                keypoint(48.0, 48.0, std::f32::consts::FRAC_PI_2),
            ],
        );
        assert!(set.descriptors[0].distance(&set.descriptors[1]) > 0);
    }

    #[test]
    fn test_keypoints_and_descriptors_aligned() {
        let image = textured();
        let extractor = BriefExtractor::new();
        let kps: Vec<Keypoint> = (0..7).map(|i| keypoint(10.0 + i as f32 * 9.0, 20.0, 0.0)).collect();
        let set = extractor.describe(&image, kps);
        assert_eq!(set.keypoints.len(), 7);
        assert_eq!(set.descriptors.len(), 7);
    }
}
