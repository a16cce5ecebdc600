// THEORY:
// The `speed` module converts frame-to-frame centroid displacement into a
// physical speed. There is no fixed pixels-per-meter calibration: each frame
// scales itself by comparing the animal's known body length with its pixel
// length in that frame.
//
// Key architectural principles:
// 1.  **Self-Calibrating Scale**: meters-per-pixel = body length in meters /
//     current pixel body length. This follows zoom and perspective changes.
// 2.  **Carry-Forward Scale**: When the current pose is too short to measure
//     (keypoints collapsed onto each other), the last trustworthy scale is
//     reused. Until one exists, the speed is reported as zero.
// 3.  **Unconditional State Update**: Every call replaces the stored pose and
//     timestamp, whatever the outcome, so one bad frame never poisons the next.

use crate::core_modules::keypoints::KeypointSet;
use crate::core_modules::kinematics::{body_length_px, mouse_centroid};
use tracing::warn;

/// Real-world nose-to-tail length of a mouse.
pub const DEFAULT_MOUSE_LENGTH_M: f64 = 0.08;
/// Shortest pixel body length that still yields a usable scale.
pub const DEFAULT_MIN_BODY_LENGTH_PX: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct SpeedEstimator {
    mouse_length_m: f64,
    min_body_length_px: f64,
    previous: Option<(KeypointSet, f64)>,
    /// Meters per pixel from the most recent well-formed pose.
    last_scale: Option<f64>,
}

impl Default for SpeedEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_MOUSE_LENGTH_M, DEFAULT_MIN_BODY_LENGTH_PX)
    }
}

impl SpeedEstimator {
    pub fn new(mouse_length_m: f64, min_body_length_px: f64) -> Self {
        Self {
            mouse_length_m,
            min_body_length_px,
            previous: None,
            last_scale: None,
        }
    }

    /// Speed in m/s since the previous call, rounded to millimeters per second.
    pub fn update(&mut self, keypoints: &KeypointSet, time_s: f64) -> f64 {
        let scale = self.scale_for(keypoints);
        let speed = match self.previous {
            None => 0.0,
            Some((previous, previous_time)) => {
                let elapsed = time_s - previous_time;
                if elapsed <= 0.0 {
                    warn!(previous_time, time_s, "non-increasing timestamp, speed set to 0");
                    0.0
                } else {
                    let (x0, y0) = mouse_centroid(&previous);
                    let (x1, y1) = mouse_centroid(keypoints);
                    let pixels = ((x1 - x0).powi(2) + (y1 - y0).powi(2)).sqrt();
                    scale.map_or(0.0, |scale| pixels / elapsed * scale)
                }
            }
        };

        self.previous = Some((*keypoints, time_s));
        (speed * 1000.0).round() / 1000.0
    }

    /// Clears the stored pose and scale.
    pub fn reset(&mut self) {
        self.previous = None;
        self.last_scale = None;
    }

    fn scale_for(&mut self, keypoints: &KeypointSet) -> Option<f64> {
        let length = body_length_px(keypoints);
        if length >= self.min_body_length_px {
            self.last_scale = Some(self.mouse_length_m / length);
        } else {
            warn!(
                length,
                carried = self.last_scale.is_some(),
                "body length below floor, reusing previous scale"
            );
        }
        self.last_scale
    }
}
