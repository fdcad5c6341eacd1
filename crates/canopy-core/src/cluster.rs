//! Point-cluster detection over one lidar sweep.
//!
//! Samples live in a flat (angle, distance) plane: the Euclidean distance
//! between two samples mixes degrees and millimetres. Clustering is one hop.
//! A seed absorbs every unvisited sample within [`LINK_DISTANCE`] of itself,
//! and absorbed samples never absorb further ones, so long thin objects can
//! come out split in two. Cost is O(n²) in the sample count, which is fine
//! for a single sweep.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Samples at or below this distance are discarded.
pub const MIN_DISTANCE: f64 = 100.0;
/// Samples at or above this distance are discarded.
pub const MAX_DISTANCE: f64 = 5000.0;
/// Samples at or below this quality are discarded.
pub const MIN_QUALITY: f64 = 50.0;
/// Seed-to-sample distance under which a sample joins the seed's cluster.
pub const LINK_DISTANCE: f64 = 50.0;
/// Clusters smaller than this are not reported.
pub const MIN_MEMBERS: usize = 6;
/// Member count at which confidence saturates at 1.0.
pub const FULL_CONFIDENCE_MEMBERS: f64 = 20.0;

/// One range reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RangeSample {
    /// Bearing in degrees.
    pub angle: f64,
    /// Range in millimetres.
    pub distance: f64,
    /// Sensor-reported signal quality.
    pub quality: f64,
}

impl RangeSample {
    /// Build a sample.
    #[must_use]
    pub const fn new(angle: f64, distance: f64, quality: f64) -> Self {
        Self {
            angle,
            distance,
            quality,
        }
    }

    fn is_usable(&self) -> bool {
        self.distance > MIN_DISTANCE && self.distance < MAX_DISTANCE && self.quality > MIN_QUALITY
    }

    fn distance_to(&self, other: &Self) -> f64 {
        (self.angle - other.angle).hypot(self.distance - other.distance)
    }
}

/// Mean position of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ClusterCenter {
    /// Mean bearing of the members.
    pub angle: f64,
    /// Mean range of the members.
    pub distance: f64,
}

/// An object reported by [`ClusterDetector::detect`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DetectedObject {
    /// 1-based position in this detection's output.
    pub id: usize,
    /// Mean of the member samples.
    pub center: ClusterCenter,
    /// Largest pairwise member distance.
    pub diameter: f64,
    /// Number of member samples.
    pub member_count: usize,
    /// `min(member_count / 20, 1.0)`.
    pub confidence: f64,
}

/// Turns a sweep of range samples into detected objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClusterDetector;

impl ClusterDetector {
    /// Detect objects in `samples`, visited in input order.
    #[must_use]
    pub fn detect(samples: &[RangeSample]) -> Vec<DetectedObject> {
        let usable: Vec<RangeSample> = samples.iter().copied().filter(RangeSample::is_usable).collect();

        Self::cluster(&usable)
            .into_iter()
            .filter(|members| members.len() >= MIN_MEMBERS)
            .enumerate()
            .map(|(index, members)| Self::describe(index + 1, &members))
            .collect()
    }

    fn cluster(points: &[RangeSample]) -> Vec<Vec<RangeSample>> {
        let mut visited = vec![false; points.len()];
        let mut clusters = Vec::new();

        for (seed_index, seed) in points.iter().enumerate() {
            if visited[seed_index] {
                continue;
            }
            visited[seed_index] = true;
            let mut members = vec![*seed];

            for (index, candidate) in points.iter().enumerate() {
                if !visited[index] && seed.distance_to(candidate) < LINK_DISTANCE {
                    visited[index] = true;
                    members.push(*candidate);
                }
            }
            clusters.push(members);
        }

        clusters
    }

    #[allow(clippy::cast_precision_loss)]
    fn describe(id: usize, members: &[RangeSample]) -> DetectedObject {
        let count = members.len() as f64;
        let center = ClusterCenter {
            angle: members.iter().map(|s| s.angle).sum::<f64>() / count,
            distance: members.iter().map(|s| s.distance).sum::<f64>() / count,
        };

        let mut diameter = 0.0_f64;
        for (i, a) in members.iter().enumerate() {
            for b in &members[i + 1..] {
                diameter = diameter.max(a.distance_to(b));
            }
        }

        DetectedObject {
            id,
            center,
            diameter,
            member_count: members.len(),
            confidence: (count / FULL_CONFIDENCE_MEMBERS).min(1.0),
        }
    }
}
