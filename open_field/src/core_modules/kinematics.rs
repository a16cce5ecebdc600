// THEORY:
// The `kinematics` module turns one pose into the per-frame measurements the
// experiment cares about: where the animal is, which zone it occupies and how
// its head is turned relative to its body.
//
// Key architectural principles:
// 1.  **Arena Coordinates**: Positions are reported relative to the arena
//     center with the vertical axis pointing up, so angles and quadrants read
//     the way they would on paper.
// 2.  **Majority Zone**: A mouse straddling a boundary is assigned to the zone
//     holding most of its seven keypoints. Ties go to the innermost zone.
// 3.  **Pure Computation**: The extractor holds only configuration. Speed needs
//     history and lives in the `speed` module; the two are combined into a
//     `KinematicRecord` by the session.

use crate::core_modules::arena::{ArenaGeometry, Zone};
use crate::core_modules::keypoints::{BodyPart, KeypointSet};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Head and body vectors shorter than this make the heading undefined.
pub const DEFAULT_ANGLE_EPSILON: f64 = 0.1;

/// Everything measured for one frame with a valid pose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KinematicRecord {
    /// Seconds since the start of the video.
    pub time_s: f64,
    /// Mouse centroid in arena coordinates (origin at the arena center, y up).
    pub position: (f64, f64),
    pub zone: Zone,
    /// Head-to-body angle in degrees, counter-clockwise, in `[0, 360)`.
    pub angle_deg: f64,
    pub speed_mps: f64,
}

impl KinematicRecord {
    /// The zone as `[central, internal, middle, outer]` flags.
    pub fn zone_onehot(&self) -> [u8; 4] {
        let mut onehot = [0; 4];
        onehot[self.zone as usize] = 1;
        onehot
    }
}

/// Weighted centroid of the nose, neck and tail in image coordinates.
///
/// Computed as the midpoint of the head center (nose, neck) and the body
/// center (neck, tail), which gives the neck half of the weight.
pub fn mouse_centroid(keypoints: &KeypointSet) -> (f64, f64) {
    let (nose, neck, tail) = anchor_points(keypoints);
    let head = midpoint(nose, neck);
    let body = midpoint(neck, tail);
    midpoint(head, body)
}

/// `(body, head)` vectors in image coordinates: neck minus tail, nose minus neck.
pub fn body_vectors(keypoints: &KeypointSet) -> ((f64, f64), (f64, f64)) {
    let (nose, neck, tail) = anchor_points(keypoints);
    ((neck.0 - tail.0, neck.1 - tail.1), (nose.0 - neck.0, nose.1 - neck.1))
}

/// Pixel length of the animal: |head vector| + |body vector|.
pub fn body_length_px(keypoints: &KeypointSet) -> f64 {
    let (body, head) = body_vectors(keypoints);
    norm(body) + norm(head)
}

fn anchor_points(keypoints: &KeypointSet) -> ((f64, f64), (f64, f64), (f64, f64)) {
    let as_f64 = |(x, y): (i32, i32)| (x as f64, y as f64);
    (
        as_f64(keypoints.get(BodyPart::Nose)),
        as_f64(keypoints.get(BodyPart::Neck)),
        as_f64(keypoints.get(BodyPart::Tail)),
    )
}

fn midpoint(a: (f64, f64), b: (f64, f64)) -> (f64, f64) {
    ((a.0 + b.0) / 2.0, (a.1 + b.1) / 2.0)
}

fn norm(v: (f64, f64)) -> f64 {
    (v.0 * v.0 + v.1 * v.1).sqrt()
}

/// Per-frame position, zone and heading.
#[derive(Debug, Clone)]
pub struct KinematicExtractor {
    angle_epsilon: f64,
}

impl Default for KinematicExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_ANGLE_EPSILON)
    }
}

impl KinematicExtractor {
    pub fn new(angle_epsilon: f64) -> Self {
        Self { angle_epsilon }
    }

    /// Builds the record for one frame. Speed is left at zero for the caller.
    pub fn extract(&self, keypoints: &KeypointSet, geometry: &ArenaGeometry, time_s: f64) -> KinematicRecord {
        KinematicRecord {
            time_s,
            position: to_arena(mouse_centroid(keypoints), geometry),
            zone: self.zone(keypoints, geometry),
            angle_deg: self.heading_angle(keypoints),
            speed_mps: 0.0,
        }
    }

    /// Zone holding most keypoints. Keypoints outside the arena are not counted.
    pub fn zone(&self, keypoints: &KeypointSet, geometry: &ArenaGeometry) -> Zone {
        let mut counts = [0usize; 4];
        for (_, point) in keypoints.iter() {
            let (x, y) = to_arena((point.0 as f64, point.1 as f64), geometry);
            if let Some(zone) = geometry.zone_at((x * x + y * y).sqrt()) {
                counts[zone as usize] += 1;
            }
        }

        let mut best = 0;
        for i in 1..counts.len() {
            if counts[i] > counts[best] {
                best = i;
            }
        }
        Zone::ALL[best]
    }

    /// Counter-clockwise angle from the body vector to the head vector, in
    /// degrees, rounded to one decimal.
    pub fn heading_angle(&self, keypoints: &KeypointSet) -> f64 {
        let (body, head) = body_vectors(keypoints);
        if norm(body) < self.angle_epsilon || norm(head) < self.angle_epsilon {
            debug!(body = norm(body), head = norm(head), "degenerate pose, heading set to 0");
            return 0.0;
        }

        // Flip y so the rotation sense is the Cartesian one.
        let (bx, by) = (body.0, -body.1);
        let (hx, hy) = (head.0, -head.1);
        let cross = bx * hy - by * hx;
        let dot = bx * hx + by * hy;

        let mut angle = cross.atan2(dot).to_degrees();
        if angle < 0.0 {
            angle += 360.0;
        }
        let rounded = (angle * 10.0).round() / 10.0;
        if rounded >= 360.0 { rounded - 360.0 } else { rounded }
    }
}

/// Image coordinates to arena coordinates.
fn to_arena(point: (f64, f64), geometry: &ArenaGeometry) -> (f64, f64) {
    let (cx, cy) = geometry.center();
    (point.0 - cx as f64, cy as f64 - point.1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::arena::ZoneBand;

    fn geometry(center: (i32, i32)) -> ArenaGeometry {
        ArenaGeometry::new(
            center,
            300,
            [
                ZoneBand { r_min: 0, r_max: 50 },
                ZoneBand { r_min: 50, r_max: 150 },
                ZoneBand { r_min: 150, r_max: 250 },
                ZoneBand { r_min: 250, r_max: 300 },
            ],
        )
        .expect("valid bands")
    }

    fn pose(nose: (i32, i32), neck: (i32, i32), tail: (i32, i32)) -> KeypointSet {
        KeypointSet::new([nose, nose, nose, neck, neck, tail, tail])
    }

    #[test]
    fn straight_pose_has_zero_heading() {
        let extractor = KinematicExtractor::default();
        let keypoints = pose((100, 50), (100, 60), (100, 80));
        assert_eq!(extractor.heading_angle(&keypoints), 0.0);
    }

    #[test]
    fn head_turned_left_is_ninety_degrees() {
        // Body points up the screen, head turns toward screen-left.
        let extractor = KinematicExtractor::default();
        let keypoints = pose((90, 60), (100, 60), (100, 80));
        assert_eq!(extractor.heading_angle(&keypoints), 90.0);
        let right = pose((110, 60), (100, 60), (100, 80));
        assert_eq!(extractor.heading_angle(&right), 270.0);
    }

    #[test]
    fn degenerate_pose_has_zero_heading() {
        let extractor = KinematicExtractor::default();
        let keypoints = pose((100, 60), (100, 60), (100, 80));
        assert_eq!(extractor.heading_angle(&keypoints), 0.0);
    }

    #[test]
    fn heading_stays_below_full_turn() {
        let extractor = KinematicExtractor::default();
        // A tiny clockwise turn rounds to 360.0 before folding.
        let keypoints = pose((10001, -100000), (10000, 0), (10000, 100000));
        let angle = extractor.heading_angle(&keypoints);
        assert!((0.0..360.0).contains(&angle), "angle {angle}");
    }

    #[test]
    fn keypoints_at_distance_two_hundred_are_middle() {
        let extractor = KinematicExtractor::default();
        let keypoints = KeypointSet::new([(200, 0); 7]);
        let record = extractor.extract(&keypoints, &geometry((0, 0)), 0.0);
        assert_eq!(record.zone, Zone::Middle);
        assert_eq!(record.zone_onehot(), [0, 0, 1, 0]);
        assert_eq!(record.zone_onehot().iter().map(|&v| v as u32).sum::<u32>(), 1);
    }

    #[test]
    fn zone_ties_and_empty_counts_go_inward() {
        let extractor = KinematicExtractor::default();
        let geometry = geometry((0, 0));
        // Three central, three internal, one outside the arena.
        let tie = KeypointSet::new([(10, 0), (20, 0), (30, 0), (60, 0), (70, 0), (80, 0), (400, 0)]);
        assert_eq!(extractor.zone(&tie, &geometry), Zone::Central);
        let outside = KeypointSet::new([(500, 0); 7]);
        assert_eq!(extractor.zone(&outside, &geometry), Zone::Central);
    }

    #[test]
    fn position_is_centered_with_y_up() {
        let extractor = KinematicExtractor::default();
        let keypoints = pose((300, 200), (300, 220), (300, 260));
        let record = extractor.extract(&keypoints, &geometry((320, 240)), 1.5);
        // Centroid (300, 225) in image space.
        assert_eq!(record.position, (-20.0, 15.0));
        assert_eq!(record.time_s, 1.5);
        assert_eq!(mouse_centroid(&keypoints), (300.0, 225.0));
        assert_eq!(body_length_px(&keypoints), 60.0);
    }
}
