//! Surfel correspondence search
//!
//! Builds an immutable k-d tree over the window's surfel centroids and, for
//! each surfel, pairs it with later surfels that look at the same plane:
//! normals must agree up to a configured angle and the point-to-plane
//! distance must be small from both sides. Every emitted pair is ordered
//! `earlier.timestamp < later.timestamp` by construction; same-time surfels
//! never match.

use std::collections::VecDeque;

use kiddo::immutable::float::kdtree::ImmutableKdTree;
use kiddo::SquaredEuclidean;

use crate::config::MatcherConfig;
use crate::state::Surfel;

/// Ordered correspondence: indices into the window surfel deque with
/// `surfels[earlier].timestamp < surfels[later].timestamp`. Valid only for
/// the solve iteration it was produced in.
#[derive(Debug, Clone, Copy)]
pub struct SurfelCorrespondence {
    pub earlier: usize,
    pub later: usize,
}

/// k-NN matcher over the current window's surfels
pub struct KnnSurfelMatcher {
    kdtree: Option<ImmutableKdTree<f64, u64, 3, 32>>,
}

impl KnnSurfelMatcher {
    /// Index the window's surfel centroids. Entry order matches the deque,
    /// so tree items map straight back to deque indices.
    pub fn build_index(surfels: &VecDeque<Surfel>) -> Self {
        if surfels.is_empty() {
            return Self { kdtree: None };
        }
        let centroids: Vec<[f64; 3]> = surfels
            .iter()
            .map(|s| [s.centroid.x, s.centroid.y, s.centroid.z])
            .collect();
        Self {
            kdtree: Some((&*centroids).into()),
        }
    }

    /// Produce ordered correspondences for the whole window.
    pub fn match_surfels(
        &self,
        surfels: &VecDeque<Surfel>,
        config: &MatcherConfig,
    ) -> Vec<SurfelCorrespondence> {
        let Some(kdtree) = &self.kdtree else {
            return Vec::new();
        };
        let cos_max = config.max_normal_angle.cos();

        let mut corrs = Vec::new();
        for (i, s1) in surfels.iter().enumerate() {
            let query = [s1.centroid.x, s1.centroid.y, s1.centroid.z];
            // One extra neighbor because the query surfel finds itself
            let neighbors =
                kdtree.nearest_n::<SquaredEuclidean>(&query, config.neighbors + 1);

            for nn in neighbors {
                let j = nn.item as usize;
                if j == i {
                    continue;
                }
                let s2 = &surfels[j];
                // Keep only later partners; the reverse pair is found from
                // the other side, and exact ties never match.
                if s2.timestamp <= s1.timestamp {
                    continue;
                }
                if s1.normal.dot(&s2.normal).abs() < cos_max {
                    continue;
                }
                let offset = s2.centroid - s1.centroid;
                if s1.normal.dot(&offset).abs() > config.max_distance
                    || s2.normal.dot(&offset).abs() > config.max_distance
                {
                    continue;
                }
                corrs.push(SurfelCorrespondence {
                    earlier: i,
                    later: j,
                });
            }
        }
        corrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surfel::VoxelKey;
    use nalgebra::Vector3;

    fn surfel(centroid: Vector3<f64>, normal: Vector3<f64>, timestamp: f64) -> Surfel {
        Surfel {
            centroid,
            normal,
            local_centroid: centroid,
            local_normal: normal,
            timestamp,
            voxel: VoxelKey::new(0, 0, 0),
        }
    }

    #[test]
    fn test_single_ordered_correspondence() {
        let surfels: VecDeque<Surfel> = vec![
            surfel(Vector3::new(0.0, 0.0, 1.0), Vector3::z(), 0.05),
            surfel(Vector3::new(0.02, 0.0, 1.0), Vector3::z(), 0.15),
        ]
        .into();

        let matcher = KnnSurfelMatcher::build_index(&surfels);
        let corrs = matcher.match_surfels(&surfels, &MatcherConfig::default());

        assert_eq!(corrs.len(), 1);
        assert_eq!(corrs[0].earlier, 0);
        assert_eq!(corrs[0].later, 1);
        assert!(surfels[corrs[0].earlier].timestamp < surfels[corrs[0].later].timestamp);
    }

    #[test]
    fn test_same_time_surfels_never_match() {
        let surfels: VecDeque<Surfel> = vec![
            surfel(Vector3::new(0.0, 0.0, 1.0), Vector3::z(), 0.05),
            surfel(Vector3::new(0.01, 0.0, 1.0), Vector3::z(), 0.05),
        ]
        .into();

        let matcher = KnnSurfelMatcher::build_index(&surfels);
        assert!(matcher
            .match_surfels(&surfels, &MatcherConfig::default())
            .is_empty());
    }

    #[test]
    fn test_normal_disagreement_rejected() {
        let surfels: VecDeque<Surfel> = vec![
            surfel(Vector3::new(0.0, 0.0, 1.0), Vector3::z(), 0.05),
            surfel(Vector3::new(0.02, 0.0, 1.0), Vector3::x(), 0.15),
        ]
        .into();

        let matcher = KnnSurfelMatcher::build_index(&surfels);
        assert!(matcher
            .match_surfels(&surfels, &MatcherConfig::default())
            .is_empty());
    }

    #[test]
    fn test_flipped_normal_still_matches() {
        // Plane normals are sign-ambiguous; agreement uses |n1·n2|
        let surfels: VecDeque<Surfel> = vec![
            surfel(Vector3::new(0.0, 0.0, 1.0), Vector3::z(), 0.05),
            surfel(Vector3::new(0.02, 0.0, 1.0), -Vector3::z(), 0.15),
        ]
        .into();

        let matcher = KnnSurfelMatcher::build_index(&surfels);
        assert_eq!(
            matcher
                .match_surfels(&surfels, &MatcherConfig::default())
                .len(),
            1
        );
    }

    #[test]
    fn test_point_to_plane_gate_is_symmetric() {
        // Centroids offset along the shared normal beyond max_distance
        let surfels: VecDeque<Surfel> = vec![
            surfel(Vector3::new(0.0, 0.0, 1.0), Vector3::z(), 0.05),
            surfel(Vector3::new(0.0, 0.0, 1.5), Vector3::z(), 0.15),
        ]
        .into();

        let matcher = KnnSurfelMatcher::build_index(&surfels);
        assert!(matcher
            .match_surfels(&surfels, &MatcherConfig::default())
            .is_empty());
    }

    #[test]
    fn test_all_pairs_ordered() {
        let surfels: VecDeque<Surfel> = (0..6)
            .map(|i| {
                surfel(
                    Vector3::new(0.01 * i as f64, 0.0, 1.0),
                    Vector3::z(),
                    0.05 * i as f64,
                )
            })
            .collect();

        let matcher = KnnSurfelMatcher::build_index(&surfels);
        let corrs = matcher.match_surfels(&surfels, &MatcherConfig::default());

        assert!(!corrs.is_empty());
        for c in &corrs {
            assert!(surfels[c.earlier].timestamp < surfels[c.later].timestamp);
        }
    }

    #[test]
    fn test_empty_window() {
        let surfels = VecDeque::new();
        let matcher = KnnSurfelMatcher::build_index(&surfels);
        assert!(matcher
            .match_surfels(&surfels, &MatcherConfig::default())
            .is_empty());
    }
}
