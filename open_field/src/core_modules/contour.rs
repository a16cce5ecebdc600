// THEORY:
// The `contour` module is the thin layer between calibration and OpenCV's
// shape analysis. Calibration only asks three things of a marker: how long is
// its boundary, where is its area centroid, and how far is a point from it
// (signed, positive inside). Everything else stays inside `imgproc`.
//
// Key architectural principles:
// 1.  **Holes Are Markers**: Markers are dark paint on a bright floor, so after
//     the binary threshold they are holes. Contours are retrieved as a flat
//     list (`RETR_LIST`), which reports hole borders next to outer borders.
// 2.  **Frame Coordinates**: Contours found in a region of interest are shifted
//     back by the region's offset while they are extracted.
// 3.  **Degenerate Means None**: A contour that encloses no area has no
//     centroid; it is never divided by zero.

use crate::error::CalibrationError;
use opencv::core::{Mat, Point, Point2f, Vector};
use opencv::imgproc;

/// A closed boundary polygon in image coordinates (x right, y down).
pub struct Contour {
    points: Vector<Point>,
}

impl Contour {
    pub fn from_points(points: &[(i32, i32)]) -> Self {
        Self {
            points: points.iter().map(|&(x, y)| Point::new(x, y)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Perimeter of the closed polygon.
    pub fn arc_length(&self) -> Result<f64, CalibrationError> {
        Ok(imgproc::arc_length(&self.points, true)?)
    }

    /// Area centroid from the polygon moments, or `None` when it encloses no area.
    pub fn centroid(&self) -> Result<Option<(f64, f64)>, CalibrationError> {
        let moments = imgproc::moments(&self.points, false)?;
        if moments.m00.abs() < 1e-9 {
            return Ok(None);
        }
        Ok(Some((moments.m10 / moments.m00, moments.m01 / moments.m00)))
    }

    /// Distance from `point` to the boundary: positive inside, negative
    /// outside, zero on an edge.
    pub fn signed_distance(&self, point: (f64, f64)) -> Result<f64, CalibrationError> {
        let point = Point2f::new(point.0 as f32, point.1 as f32);
        Ok(imgproc::point_polygon_test(&self.points, point, true)?)
    }
}

/// Binary threshold: pixels strictly brighter than `thresh` become `max_value`.
pub fn threshold(image: &Mat, thresh: u8, max_value: u8) -> Result<Mat, CalibrationError> {
    let mut binary = Mat::default();
    imgproc::threshold(image, &mut binary, thresh as f64, max_value as f64, imgproc::THRESH_BINARY)?;
    Ok(binary)
}

/// Every outer and hole border of a binary image, shifted by `offset`.
pub fn find_contours(binary: &Mat, offset: (i32, i32)) -> Result<Vec<Contour>, CalibrationError> {
    let mut found: Vector<Vector<Point>> = Vector::new();
    imgproc::find_contours(
        binary,
        &mut found,
        imgproc::RETR_LIST,
        imgproc::CHAIN_APPROX_SIMPLE,
        Point::new(offset.0, offset.1),
    )?;
    Ok(found.into_iter().map(|points| Contour { points }).collect())
}
