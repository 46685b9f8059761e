//! Feature detection, description, and matching.
//!
//! Rigid alignment is driven by sparse correspondences: FAST corners with
//! orientation from the intensity centroid, binary descriptors sampled
//! from a rotated test pattern, and Hamming-distance matching with a ratio
//! test. Everything here is deterministic for a given input; the only
//! randomness is the consensus sampler in [`ransac`], which is explicitly
//! seeded.

mod describe;
mod detect;
mod matcher;
pub mod ransac;

pub use describe::BriefExtractor;
pub use detect::FastDetector;
pub use matcher::match_descriptors;

use crate::raster::WorkingImage;

/// Sigma of the blur applied before descriptor sampling. Binary intensity
/// tests are noise-sensitive without it.
const DESCRIPTOR_BLUR_SIGMA: f64 = 2.0;

// =============================================================================
// Types
// =============================================================================

/// A detected corner in working-resolution pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,

    /// Detection strength, used for ranking during suppression.
    pub response: f32,

    /// Dominant orientation in radians, from the intensity centroid.
    pub angle: f32,
}

/// 256-bit binary descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub [u8; 32]);

impl Descriptor {
    /// Hamming distance to another descriptor.
    #[inline]
    pub fn distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// Keypoints with their descriptors, index-aligned.
#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    /// Keypoint position as `f64` pair.
    pub fn point(&self, index: usize) -> (f64, f64) {
        let kp = &self.keypoints[index];
        (kp.x as f64, kp.y as f64)
    }
}

/// One descriptor correspondence between two feature sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorMatch {
    /// Index into the first set
    pub a: usize,

    /// Index into the second set
    pub b: usize,

    /// Hamming distance of the matched pair
    pub distance: u32,
}

// =============================================================================
// Extraction Pipeline
// =============================================================================

/// Detect corners and describe them in one pass.
///
/// Detection runs on the image as given; descriptor tests sample a blurred
/// copy. Keypoints too weak to survive suppression or ranked beyond
/// `max_features` are dropped.
pub fn extract_features(image: &WorkingImage, max_features: usize) -> FeatureSet {
    let detector = FastDetector::new(max_features);
    let keypoints = detector.detect(image);

    let blurred = image.gaussian_blurred(DESCRIPTOR_BLUR_SIGMA);
    let extractor = BriefExtractor::new();
    extractor.describe(&blurred, keypoints)
}
