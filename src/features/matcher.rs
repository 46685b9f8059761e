//! Descriptor matching.

use super::{DescriptorMatch, FeatureSet};

/// Matches farther than this Hamming distance are never kept, whatever the
/// ratio test says. Random 256-bit descriptors sit near 128.
const MAX_MATCH_DISTANCE: u32 = 100;

/// Nearest-neighbor matching with Lowe's ratio test.
///
/// For each descriptor in `a`, the two closest descriptors in `b` are
/// found; the best is kept only when it beats the runner-up by `ratio`
/// and stays under the absolute distance cap. Iteration is in index order,
/// ties resolve to the lower index, so the result is deterministic.
pub fn match_descriptors(a: &FeatureSet, b: &FeatureSet, ratio: f64) -> Vec<DescriptorMatch> {
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }

    let mut matches = Vec::new();
    for (ia, da) in a.descriptors.iter().enumerate() {
        let mut best = u32::MAX;
        let mut second = u32::MAX;
        let mut best_index = 0usize;

        for (ib, db) in b.descriptors.iter().enumerate() {
            let d = da.distance(db);
            if d < best {
                second = best;
                best = d;
                best_index = ib;
            } else if d < second {
                second = d;
            }
        }

        if best > MAX_MATCH_DISTANCE {
            continue;
        }
        if (best as f64) < ratio * second as f64 {
            matches.push(DescriptorMatch {
                a: ia,
                b: best_index,
                distance: best,
            });
        }
    }
    matches
}

// =============================================================================
// Tests
// =============================================================================
