// THEORY:
// The `arena` module owns the one-shot calibration step. From a single
// reference frame it recovers where the arena is and how it is split into four
// concentric zones. Every per-frame measurement later depends on this result,
// so any doubt here is reported as a `CalibrationError` instead of guessed.
//
// Key architectural principles:
// 1.  **Two Independent Detectors**: The arena wall comes from a Hough circle on
//     the whole blurred frame. The center and the central zone come from small
//     painted markers found as contours inside a region of interest around the
//     middle of the frame. The circle only says which marker is the center one;
//     the marker's centroid is what is finally trusted.
// 2.  **Derived Zones**: Only the central zone is measured. The internal and
//     middle boundaries are placed at one and two thirds of the remaining radius.
// 3.  **Immutable Output**: `ArenaGeometry` can only be built through a
//     constructor that checks the band ordering, so downstream code never has
//     to re-validate it.

use crate::core_modules::contour::{self, Contour};
use crate::core_modules::hough::{self, HoughParams};
use crate::core_modules::utils::mat_helper::{gray_to_mat, mat_to_gray};
use crate::error::CalibrationError;
use image::{GrayImage, RgbImage};
use opencv::core::{self, Mat, Size};
use opencv::imgproc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// The four concentric zones, innermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Zone {
    Central,
    Internal,
    Middle,
    Outer,
}

impl Zone {
    /// Band order, used for counting and tie-breaking.
    pub const ALL: [Zone; 4] = [Zone::Central, Zone::Internal, Zone::Middle, Zone::Outer];

    pub fn name(&self) -> &'static str {
        match self {
            Zone::Central => "Central",
            Zone::Internal => "Internal",
            Zone::Middle => "Middle",
            Zone::Outer => "Outer",
        }
    }
}

/// A radial band `[r_min, r_max)` around the arena center, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneBand {
    pub r_min: i32,
    pub r_max: i32,
}

/// Arena center, wall radius and zone bands for one video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArenaGeometry {
    center: (i32, i32),
    radius_arena: i32,
    bands: [ZoneBand; 4],
}

impl ArenaGeometry {
    /// Builds the geometry from explicit bands, checking that they tile the
    /// arena from the center outward.
    pub fn new(center: (i32, i32), radius_arena: i32, bands: [ZoneBand; 4]) -> Result<Self, CalibrationError> {
        if bands[0].r_min != 0 {
            return Err(CalibrationError::InvalidZones(format!(
                "central zone starts at {} instead of 0",
                bands[0].r_min
            )));
        }
        for (i, band) in bands.iter().enumerate() {
            if band.r_max <= band.r_min {
                return Err(CalibrationError::InvalidZones(format!(
                    "{} zone is empty ({}..{})",
                    Zone::ALL[i].name(),
                    band.r_min,
                    band.r_max
                )));
            }
            if i > 0 && bands[i - 1].r_max != band.r_min {
                return Err(CalibrationError::InvalidZones(format!(
                    "{} zone does not start where {} ends",
                    Zone::ALL[i].name(),
                    Zone::ALL[i - 1].name()
                )));
            }
        }
        if bands[3].r_max != radius_arena {
            return Err(CalibrationError::InvalidZones(format!(
                "outer zone ends at {} but the arena radius is {}",
                bands[3].r_max, radius_arena
            )));
        }
        Ok(Self {
            center,
            radius_arena,
            bands,
        })
    }

    /// Splits the ring between the central radius and the wall into thirds.
    pub fn from_central_radius(
        center: (i32, i32),
        radius_arena: i32,
        central_radius: i32,
    ) -> Result<Self, CalibrationError> {
        let remaining = (radius_arena - central_radius) as f64;
        let internal_max = (central_radius as f64 + remaining / 3.0).round() as i32;
        let middle_max = (central_radius as f64 + 2.0 * remaining / 3.0).round() as i32;
        Self::new(
            center,
            radius_arena,
            [
                ZoneBand { r_min: 0, r_max: central_radius },
                ZoneBand { r_min: central_radius, r_max: internal_max },
                ZoneBand { r_min: internal_max, r_max: middle_max },
                ZoneBand { r_min: middle_max, r_max: radius_arena },
            ],
        )
    }

    pub fn center(&self) -> (i32, i32) {
        self.center
    }

    pub fn radius_arena(&self) -> i32 {
        self.radius_arena
    }

    pub fn band(&self, zone: Zone) -> ZoneBand {
        self.bands[zone as usize]
    }

    pub fn bands(&self) -> &[ZoneBand; 4] {
        &self.bands
    }

    /// The zone whose band contains `distance`. The outer band also owns the
    /// wall itself; anything beyond it is outside the arena.
    pub fn zone_at(&self, distance: f64) -> Option<Zone> {
        Zone::ALL.into_iter().find(|&zone| {
            let band = self.band(zone);
            let inside_upper = if zone == Zone::Outer {
                distance <= band.r_max as f64
            } else {
                distance < band.r_max as f64
            };
            distance >= band.r_min as f64 && inside_upper
        })
    }
}

/// Tunable thresholds for calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationConfig {
    /// Side of the square Gaussian kernel applied after grayscale conversion.
    pub blur_kernel: i32,
    /// Gaussian sigma; zero derives it from the kernel size.
    pub blur_sigma: f64,
    /// Binary threshold for marker search; pixels above it become foreground.
    pub threshold: u8,
    pub threshold_max_value: u8,
    /// ROI offset as a fraction of frame width/height.
    pub roi_offset: f64,
    /// ROI size as a fraction of frame width/height.
    pub roi_size: f64,
    /// Contours with a perimeter at or above this are not markers.
    pub max_contour_length: f64,
    pub hough: HoughParams,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            blur_kernel: 5,
            blur_sigma: 0.0,
            threshold: 90,
            threshold_max_value: 255,
            roi_offset: 0.375,
            roi_size: 0.25,
            max_contour_length: 100.0,
            hough: HoughParams::default(),
        }
    }
}

/// Finds the arena geometry in a reference frame.
#[derive(Debug, Clone)]
pub struct ArenaCalibrator {
    config: CalibrationConfig,
}

impl ArenaCalibrator {
    pub fn new(config: CalibrationConfig) -> Self {
        Self { config }
    }

    /// Grayscale conversion followed by the calibration blur.
    pub fn preprocess(&self, frame: &RgbImage) -> Result<GrayImage, CalibrationError> {
        let gray = gray_to_mat(&image::imageops::grayscale(frame))?;
        let mut blurred = Mat::default();
        let kernel = Size::new(self.config.blur_kernel, self.config.blur_kernel);
        imgproc::gaussian_blur(
            &gray,
            &mut blurred,
            kernel,
            self.config.blur_sigma,
            self.config.blur_sigma,
            core::BORDER_DEFAULT,
        )?;
        mat_to_gray(&blurred)
    }

    /// Calibrates from a raw color frame.
    pub fn calibrate_frame(&self, frame: &RgbImage) -> Result<ArenaGeometry, CalibrationError> {
        self.calibrate(&self.preprocess(frame)?)
    }

    /// Calibrates from an already grayscale-blurred frame.
    pub fn calibrate(&self, blurred: &GrayImage) -> Result<ArenaGeometry, CalibrationError> {
        // --- 1. Marker contours inside the ROI ---
        let markers = self.marker_contours(blurred)?;
        debug!(count = markers.len(), "marker contours in search region");

        // --- 2. Arena wall ---
        let circles = hough::detect_circles(&gray_to_mat(blurred)?, &self.config.hough)?;
        let wall = circles.first().ok_or(CalibrationError::NoArenaCircle)?;
        let radius_arena = wall.radius.round() as i32;
        debug!(x = wall.center.0, y = wall.center.1, radius = radius_arena, "arena wall");

        // --- 3. Arena center from the marker nearest the wall's center ---
        let (center_index, center_marker) =
            nearest_contour(&markers, wall.center, None)?.ok_or(CalibrationError::NoMarkers)?;
        let (cx, cy) = center_marker.centroid()?.ok_or(CalibrationError::DegenerateMarker)?;
        let center = (cx.round() as i32, cy.round() as i32);

        // --- 4. Central zone radius from the next nearest marker ---
        let (_, zone_marker) = nearest_contour(&markers, (center.0 as f64, center.1 as f64), Some(center_index))?
            .ok_or(CalibrationError::MissingZoneMarker)?;
        let (zx, zy) = zone_marker.centroid()?.ok_or(CalibrationError::DegenerateMarker)?;
        let central_radius = ((center.0 as f64 - zx).powi(2) + (center.1 as f64 - zy).powi(2)).sqrt().round() as i32;

        // --- 5. Remaining zones ---
        let geometry = ArenaGeometry::from_central_radius(center, radius_arena, central_radius)?;
        let bands = geometry.bands();
        info!(
            center_x = center.0,
            center_y = center.1,
            radius = radius_arena,
            central = bands[0].r_max,
            internal = bands[1].r_max,
            middle = bands[2].r_max,
            "arena calibrated"
        );
        Ok(geometry)
    }

    /// Small closed contours of the thresholded ROI, in frame coordinates.
    fn marker_contours(&self, blurred: &GrayImage) -> Result<Vec<Contour>, CalibrationError> {
        let width = blurred.width();
        let height = blurred.height();
        let roi_x = (width as f64 * self.config.roi_offset) as u32;
        let roi_y = (height as f64 * self.config.roi_offset) as u32;
        let roi_w = ((width as f64 * self.config.roi_size) as u32).min(width.saturating_sub(roi_x));
        let roi_h = ((height as f64 * self.config.roi_size) as u32).min(height.saturating_sub(roi_y));
        if roi_w == 0 || roi_h == 0 {
            return Ok(Vec::new());
        }

        let roi = gray_to_mat(&image::imageops::crop_imm(blurred, roi_x, roi_y, roi_w, roi_h).to_image())?;
        let binary = contour::threshold(&roi, self.config.threshold, self.config.threshold_max_value)?;

        let mut markers = Vec::new();
        for candidate in contour::find_contours(&binary, (roi_x as i32, roi_y as i32))? {
            if candidate.arc_length()? < self.config.max_contour_length {
                markers.push(candidate);
            }
        }
        Ok(markers)
    }
}

/// The contour whose boundary passes closest to `point`, skipping `exclude`.
fn nearest_contour(
    contours: &[Contour],
    point: (f64, f64),
    exclude: Option<usize>,
) -> Result<Option<(usize, &Contour)>, CalibrationError> {
    let mut best: Option<(usize, &Contour, f64)> = None;
    for (i, candidate) in contours.iter().enumerate() {
        if Some(i) == exclude {
            continue;
        }
        let distance = candidate.signed_distance(point)?.abs();
        if best.is_none_or(|(_, _, best_distance)| distance < best_distance) {
            best = Some((i, candidate, distance));
        }
    }
    Ok(best.map(|(i, c, _)| (i, c)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn paint_square(frame: &mut RgbImage, center: (i32, i32), half: i32, value: u8) {
        for y in center.1 - half..=center.1 + half {
            for x in center.0 - half..=center.0 + half {
                frame.put_pixel(x as u32, y as u32, Rgb([value, value, value]));
            }
        }
    }

    /// Dark frame with a bright disc-shaped floor and 7x7 dark markers.
    fn arena_frame(size: (u32, u32), center: (i32, i32), radius: f64, markers: &[(i32, i32)]) -> RgbImage {
        let mut frame = RgbImage::new(size.0, size.1);
        for (x, y, pixel) in frame.enumerate_pixels_mut() {
            let d = ((x as f64 - center.0 as f64).powi(2) + (y as f64 - center.1 as f64).powi(2)).sqrt();
            if d <= radius {
                *pixel = Rgb([200, 200, 200]);
            }
        }
        for &marker in markers {
            paint_square(&mut frame, marker, 3, 0);
        }
        frame
    }

    /// Arena floor of radius 200 at (320, 240), a center marker at the middle
    /// and a zone marker 50 px to the right.
    fn synthetic_arena() -> RgbImage {
        arena_frame((640, 480), (320, 240), 200.0, &[(320, 240), (370, 240)])
    }

    fn test_config() -> CalibrationConfig {
        CalibrationConfig {
            hough: HoughParams {
                min_radius: 150,
                max_radius: 250,
                param2: 40.0,
                ..HoughParams::default()
            },
            ..CalibrationConfig::default()
        }
    }

    #[test]
    fn calibrates_synthetic_arena() {
        let calibrator = ArenaCalibrator::new(test_config());
        let geometry = calibrator.calibrate_frame(&synthetic_arena()).expect("calibration");

        assert_eq!(geometry.center(), (320, 240));
        assert!((geometry.radius_arena() - 200).abs() <= 4, "radius {}", geometry.radius_arena());
        assert_eq!(geometry.band(Zone::Central).r_max, 50);

        let bands = geometry.bands();
        assert_eq!(bands[0].r_min, 0);
        assert!(bands[0].r_max < bands[1].r_max);
        assert!(bands[1].r_max < bands[2].r_max);
        assert!(bands[2].r_max < bands[3].r_max);
        assert_eq!(bands[3].r_max, geometry.radius_arena());
    }

    #[test]
    fn default_config_calibrates_a_full_size_arena() {
        let frame = arena_frame((1280, 960), (640, 480), 350.0, &[(640, 480), (720, 480)]);
        let geometry = ArenaCalibrator::new(CalibrationConfig::default())
            .calibrate_frame(&frame)
            .expect("calibration");

        assert_eq!(geometry.center(), (640, 480));
        assert!((geometry.radius_arena() - 350).abs() <= 4, "radius {}", geometry.radius_arena());
        assert_eq!(geometry.band(Zone::Central).r_max, 80);
    }

    #[test]
    fn preprocess_keeps_frame_size() {
        let calibrator = ArenaCalibrator::new(CalibrationConfig::default());
        let blurred = calibrator.preprocess(&synthetic_arena()).expect("preprocess");
        assert_eq!(blurred.dimensions(), (640, 480));
        assert_eq!(blurred.get_pixel(320, 100)[0], 200);
        assert_eq!(blurred.get_pixel(5, 5)[0], 0);
    }

    #[test]
    fn blank_frame_has_no_arena() {
        let calibrator = ArenaCalibrator::new(test_config());
        let frame = RgbImage::new(640, 480);
        assert_eq!(calibrator.calibrate_frame(&frame), Err(CalibrationError::NoArenaCircle));
    }

    #[test]
    fn arena_without_markers_fails() {
        let mut frame = synthetic_arena();
        paint_square(&mut frame, (320, 240), 3, 200);
        paint_square(&mut frame, (370, 240), 3, 200);
        let calibrator = ArenaCalibrator::new(test_config());
        assert_eq!(calibrator.calibrate_frame(&frame), Err(CalibrationError::NoMarkers));
    }

    #[test]
    fn single_marker_leaves_central_zone_unknown() {
        let mut frame = synthetic_arena();
        paint_square(&mut frame, (370, 240), 3, 200);
        let calibrator = ArenaCalibrator::new(test_config());
        assert_eq!(calibrator.calibrate_frame(&frame), Err(CalibrationError::MissingZoneMarker));
    }

    #[test]
    fn derived_bands_split_the_ring_in_thirds() {
        let geometry = ArenaGeometry::from_central_radius((0, 0), 200, 50).expect("valid bands");
        assert_eq!(
            geometry.bands(),
            &[
                ZoneBand { r_min: 0, r_max: 50 },
                ZoneBand { r_min: 50, r_max: 100 },
                ZoneBand { r_min: 100, r_max: 150 },
                ZoneBand { r_min: 150, r_max: 200 },
            ]
        );
    }

    #[test]
    fn rejects_out_of_order_bands() {
        assert!(matches!(
            ArenaGeometry::from_central_radius((0, 0), 200, 0),
            Err(CalibrationError::InvalidZones(_))
        ));
        assert!(matches!(
            ArenaGeometry::from_central_radius((0, 0), 200, 199),
            Err(CalibrationError::InvalidZones(_))
        ));
        let gap = [
            ZoneBand { r_min: 0, r_max: 50 },
            ZoneBand { r_min: 60, r_max: 150 },
            ZoneBand { r_min: 150, r_max: 250 },
            ZoneBand { r_min: 250, r_max: 300 },
        ];
        assert!(ArenaGeometry::new((0, 0), 300, gap).is_err());
    }

    #[test]
    fn zone_lookup_follows_bands() {
        let geometry = ArenaGeometry::new(
            (0, 0),
            300,
            [
                ZoneBand { r_min: 0, r_max: 50 },
                ZoneBand { r_min: 50, r_max: 150 },
                ZoneBand { r_min: 150, r_max: 250 },
                ZoneBand { r_min: 250, r_max: 300 },
            ],
        )
        .expect("valid bands");
        assert_eq!(geometry.zone_at(200.0), Some(Zone::Middle));
        assert_eq!(geometry.zone_at(0.0), Some(Zone::Central));
        assert_eq!(geometry.zone_at(50.0), Some(Zone::Internal));
        assert_eq!(geometry.zone_at(300.0), Some(Zone::Outer));
        assert_eq!(geometry.zone_at(300.5), None);
    }
}
