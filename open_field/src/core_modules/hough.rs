// THEORY:
// The `hough` module finds the arena wall: the one large circle in the
// calibration frame. It wraps OpenCV's gradient Hough transform, which runs
// its own Canny edge pass (upper threshold `param1`, lower `param1 / 2`), lets
// every edge pixel vote along its gradient, and keeps accumulator peaks above
// `param2` that are at least `min_dist` apart. Circles come back strongest first.

use crate::error::CalibrationError;
use opencv::core::{Mat, Vec3f, Vector};
use opencv::imgproc;

/// Tunable parameters of the circle transform.
#[derive(Debug, Clone, PartialEq)]
pub struct HoughParams {
    /// Inverse ratio of accumulator resolution to image resolution.
    pub dp: f64,
    /// Minimum distance between detected circle centers, in pixels.
    pub min_dist: f64,
    /// Upper Canny threshold; the lower one is half of it.
    pub param1: f64,
    /// Accumulator vote threshold for a center candidate.
    pub param2: f64,
    pub min_radius: u32,
    /// Zero means "up to the larger image dimension".
    pub max_radius: u32,
}

impl Default for HoughParams {
    fn default() -> Self {
        Self {
            dp: 1.0,
            min_dist: 50.0,
            param1: 40.0,
            param2: 70.0,
            min_radius: 250,
            max_radius: 500,
        }
    }
}

/// A detected circle, in image coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Circle {
    pub center: (f64, f64),
    pub radius: f64,
}

/// Detects circles in an 8-bit grayscale image, strongest first.
pub fn detect_circles(image: &Mat, params: &HoughParams) -> Result<Vec<Circle>, CalibrationError> {
    if params.dp <= 0.0 || (params.max_radius != 0 && params.min_radius > params.max_radius) {
        return Ok(Vec::new());
    }

    let mut found: Vector<Vec3f> = Vector::new();
    imgproc::hough_circles(
        image,
        &mut found,
        imgproc::HOUGH_GRADIENT,
        params.dp,
        params.min_dist,
        params.param1,
        params.param2,
        params.min_radius as i32,
        params.max_radius as i32,
    )?;

    Ok(found
        .into_iter()
        .map(|circle| Circle {
            center: (circle[0] as f64, circle[1] as f64),
            radius: circle[2] as f64,
        })
        .collect())
}
