//! Nearest-match comparison of a probe against the gallery.

use crate::types::{Encoding, Gallery, MatchResult};
use serde::{Deserialize, Serialize};

/// Strategy for comparing a probe encoding against a gallery of enrolled faces.
pub trait Matcher: Send + Sync {
    /// Score every gallery entry; results are sorted ascending by distance.
    fn compare(&self, probe: Option<&Encoding>, gallery: &Gallery) -> Vec<MatchResult>;
}

/// Euclidean-distance matcher with a two-stage acceptance gate.
///
/// An entry matches when `distance < distance_threshold` AND the derived
/// confidence `1 - distance / distance_threshold` reaches `min_confidence`.
/// With the defaults (0.4, 0.75) only distances below 0.1 are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EuclideanMatcher {
    pub distance_threshold: f32,
    pub min_confidence: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            distance_threshold: 0.4,
            min_confidence: 0.75,
        }
    }
}

impl EuclideanMatcher {
    /// `(is_match, confidence)` for a distance.
    pub fn score(&self, distance: f32) -> (bool, f32) {
        if !(distance < self.distance_threshold) {
            return (false, 0.0);
        }
        let confidence = (1.0 - distance / self.distance_threshold).clamp(0.0, 1.0);
        if confidence < self.min_confidence {
            return (false, 0.0);
        }
        (true, confidence)
    }
}

/// The top result of a sorted comparison, when it is a confident match.
pub fn best_match(results: &[MatchResult]) -> Option<&MatchResult> {
    results.first().filter(|r| r.is_match)
}

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: Option<&Encoding>, gallery: &Gallery) -> Vec<MatchResult> {
        let Some(probe) = probe else {
            return Vec::new();
        };

        let mut results: Vec<MatchResult> = gallery
            .values()
            .map(|entry| {
                let distance = probe.euclidean_distance(&entry.encoding);
                let (is_match, confidence) = self.score(distance);
                MatchResult {
                    record_id: entry.record_id,
                    person_id: entry.person_id,
                    display_name: entry.display_name.clone(),
                    distance,
                    is_match,
                    confidence,
                }
            })
            .collect();

        results.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then(a.record_id.cmp(&b.record_id))
        });
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CacheEntry, ENCODING_DIM};
    use approx::assert_relative_eq;
    use rstest::rstest;

    /// Encoding at `offset` along the first axis.
    fn at(offset: f32) -> Encoding {
        let mut v = vec![0.0; ENCODING_DIM];
        v[0] = offset;
        Encoding::new(v).unwrap()
    }

    fn gallery(offsets: &[f32]) -> Gallery {
        offsets
            .iter()
            .enumerate()
            .map(|(i, &o)| {
                let id = i as i64 + 1;
                (
                    id,
                    CacheEntry {
                        record_id: id,
                        person_id: id * 10,
                        display_name: format!("Person {id}"),
                        encoding: at(o),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_identical_encoding_matches_with_full_confidence() {
        let probe = at(0.25);
        let results = EuclideanMatcher::default().compare(Some(&probe), &gallery(&[0.25]));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].distance, 0.0);
        assert!(results[0].is_match);
        assert_eq!(results[0].confidence, 1.0);
    }

    #[rstest]
    #[case(0.0, true)]
    #[case(0.05, true)]
    #[case(0.09, true)]
    #[case(0.11, false)]
    #[case(0.2, false)]
    #[case(0.39, false)]
    #[case(0.4, false)]
    #[case(1.5, false)]
    fn test_double_gate_boundary(#[case] distance: f32, #[case] expected: bool) {
        let (is_match, confidence) = EuclideanMatcher::default().score(distance);
        assert_eq!(is_match, expected, "distance {distance}");
        if !expected {
            assert_eq!(confidence, 0.0);
        }
    }

    #[test]
    fn test_confidence_formula() {
        let (is_match, confidence) = EuclideanMatcher::default().score(0.04);
        assert!(is_match);
        assert_relative_eq!(confidence, 0.9, epsilon = 1e-6);
    }

    #[test]
    fn test_distance_gate_only_when_min_confidence_zero() {
        let m = EuclideanMatcher { distance_threshold: 0.4, min_confidence: 0.0 };
        let (is_match, confidence) = m.score(0.3);
        assert!(is_match);
        assert_relative_eq!(confidence, 0.25, epsilon = 1e-6);
    }

    #[test]
    fn test_results_sorted_ascending() {
        let probe = at(0.0);
        let results = EuclideanMatcher::default().compare(Some(&probe), &gallery(&[0.9, 0.05, 0.3, 0.3, 2.0]));
        assert_eq!(results.len(), 5);
        assert!(results.windows(2).all(|w| w[0].distance <= w[1].distance));
        assert_eq!(results[0].record_id, 2);
        // Ties broken by record id.
        assert_eq!((results[1].record_id, results[2].record_id), (3, 4));
    }

    #[test]
    fn test_all_entries_returned_including_non_matches() {
        let probe = at(0.0);
        let results = EuclideanMatcher::default().compare(Some(&probe), &gallery(&[0.05, 1.0]));
        assert!(results[0].is_match);
        assert!(!results[1].is_match);
        assert_eq!(results[1].confidence, 0.0);
    }

    #[test]
    fn test_empty_gallery_or_missing_probe() {
        let m = EuclideanMatcher::default();
        assert!(m.compare(Some(&at(0.0)), &Gallery::new()).is_empty());
        assert!(m.compare(None, &gallery(&[0.0])).is_empty());
    }

    #[test]
    fn test_best_requires_match() {
        let m = EuclideanMatcher::default();
        let probe = at(0.0);
        let near_miss = m.compare(Some(&probe), &gallery(&[0.2]));
        assert!(best_match(&near_miss).is_none());
        let hit = m.compare(Some(&probe), &gallery(&[0.01, 0.2]));
        assert_eq!(best_match(&hit).map(|r| r.record_id), Some(1));
    }
}
