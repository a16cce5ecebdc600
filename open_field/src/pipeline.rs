// THEORY:
// The `pipeline` module is the top-level API of the engine. A `FieldSession`
// owns every stateful piece of one recording (arena geometry, speed history,
// composite window, recorded streams) and is driven one frame at a time, in
// order. When the video ends, `finish` reconciles the streams and produces the
// merged table and the session summary.
//
// Per-frame stages:
// 1.  **Calibration** on the very first frame. Without an arena nothing else is
//     meaningful, so a failure here aborts the run.
// 2.  **Pose** from the pose oracle, turned into a kinematic record when the
//     animal was found. A missing pose skips this frame's record only.
// 3.  **Composite** window update. Every frame enters the window, with or
//     without a pose, and every full window is classified.

use crate::core_modules::alignment::{DEFAULT_BLOCK_SIZE, MergedTable, StreamAligner};
use crate::core_modules::arena::{ArenaCalibrator, ArenaGeometry, CalibrationConfig};
use crate::core_modules::composite::{CompositeFrame, CompositeFrameBuilder, DEFAULT_WINDOW_SIZE};
use crate::core_modules::kalman::{self, KalmanConfig};
use crate::core_modules::keypoints::KeypointSet;
use crate::core_modules::kinematics::{DEFAULT_ANGLE_EPSILON, KinematicExtractor, KinematicRecord};
use crate::core_modules::smoothing::{self, DEFAULT_SPEED_ORDER, DEFAULT_SPEED_WINDOW};
use crate::core_modules::speed::{DEFAULT_MIN_BODY_LENGTH_PX, DEFAULT_MOUSE_LENGTH_M, SpeedEstimator};
use crate::core_modules::summary::{ArenaHeatmap, DEFAULT_HEATMAP_BINS, SessionSummary};
use crate::error::{FieldError, Result};
use crate::oracle::{BehaviorOracle, PoseOracle};
use image::RgbImage;
use tracing::{debug, info};

/// Configuration for a `FieldSession`.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldConfig {
    pub calibration: CalibrationConfig,
    /// Frames per composite window. Must be odd; the composite describes the middle frame.
    pub window_size: usize,
    /// Rows per block-majority label.
    pub block_size: usize,
    /// Real nose-to-tail length of the animal, used to convert pixels to meters.
    pub mouse_length_m: f64,
    /// Head or body vectors shorter than this (pixels) give a heading of 0.
    pub angle_epsilon: f64,
    /// Pixel body length below which the previous meters-per-pixel scale is reused.
    pub min_body_length_px: f64,
    pub kalman: KalmanConfig,
    /// Savitzky-Golay window over the speed column. Must be odd.
    pub speed_smoothing_window: usize,
    pub speed_smoothing_order: usize,
    /// Cells per side of the position heatmap.
    pub heatmap_bins: usize,
}

impl Default for FieldConfig {
    fn default() -> Self {
        Self {
            calibration: CalibrationConfig::default(),
            window_size: DEFAULT_WINDOW_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            mouse_length_m: DEFAULT_MOUSE_LENGTH_M,
            angle_epsilon: DEFAULT_ANGLE_EPSILON,
            min_body_length_px: DEFAULT_MIN_BODY_LENGTH_PX,
            kalman: KalmanConfig::default(),
            speed_smoothing_window: DEFAULT_SPEED_WINDOW,
            speed_smoothing_order: DEFAULT_SPEED_ORDER,
            heatmap_bins: DEFAULT_HEATMAP_BINS,
        }
    }
}

impl FieldConfig {
    /// Rejects values no run could work with.
    pub fn validate(&self) -> Result<()> {
        if self.window_size < 3 || self.window_size % 2 == 0 {
            return Err(FieldError::Config(format!(
                "window_size must be odd and at least 3, got {}",
                self.window_size
            )));
        }
        if self.block_size == 0 {
            return Err(FieldError::Config("block_size must be positive".to_string()));
        }
        if self.mouse_length_m <= 0.0 {
            return Err(FieldError::Config(format!(
                "mouse_length_m must be positive, got {}",
                self.mouse_length_m
            )));
        }
        if self.angle_epsilon < 0.0 || self.min_body_length_px <= 0.0 {
            return Err(FieldError::Config(
                "angle_epsilon must be non-negative and min_body_length_px positive".to_string(),
            ));
        }
        smoothing::check_params(self.speed_smoothing_window, self.speed_smoothing_order)?;
        if self.heatmap_bins == 0 {
            return Err(FieldError::Config("heatmap_bins must be positive".to_string()));
        }

        let calibration = &self.calibration;
        let fraction_ok = |f: f64| f > 0.0 && f < 1.0;
        if !fraction_ok(calibration.roi_offset)
            || !fraction_ok(calibration.roi_size)
            || calibration.roi_offset + calibration.roi_size > 1.0
        {
            return Err(FieldError::Config("calibration ROI must lie inside the frame".to_string()));
        }
        let hough = &calibration.hough;
        if hough.dp <= 0.0 || (hough.max_radius != 0 && hough.min_radius > hough.max_radius) {
            return Err(FieldError::Config(format!(
                "invalid Hough parameters: dp {}, radius {}..{}",
                hough.dp, hough.min_radius, hough.max_radius
            )));
        }

        self.kalman.validate()
    }
}

/// What one call to `process_frame` produced.
#[derive(Debug, Clone)]
pub struct FrameReport {
    pub frame_index: usize,
    /// Present when the pose oracle found the animal.
    pub kinematic: Option<KinematicRecord>,
    /// The composite built on this frame, if the window was full.
    pub composite: Option<CompositeFrame>,
    /// Classifier output for `composite`.
    pub behavior: Option<Vec<f64>>,
}

/// Everything a finished session produced.
#[derive(Debug, Clone)]
pub struct AnalysisOutput {
    /// `None` only when no frame was processed.
    pub geometry: Option<ArenaGeometry>,
    pub table: MergedTable,
    pub summary: SessionSummary,
    /// `None` only when no frame was processed.
    pub heatmap: Option<ArenaHeatmap>,
}

/// Analysis state for one recording.
pub struct FieldSession<P: PoseOracle, B: BehaviorOracle> {
    pose_oracle: P,
    behavior_oracle: B,
    calibrator: ArenaCalibrator,
    geometry: Option<ArenaGeometry>,
    extractor: KinematicExtractor,
    speed: SpeedEstimator,
    composite: CompositeFrameBuilder,
    aligner: StreamAligner,
    /// Kinematic records with the index of the frame they were measured on.
    kinematic: Vec<(usize, KinematicRecord)>,
    behavior: Vec<Vec<f64>>,
    frames_seen: usize,
    heatmap_bins: usize,
}

impl<P: PoseOracle, B: BehaviorOracle> FieldSession<P, B> {
    pub fn new(config: FieldConfig, pose_oracle: P, behavior_oracle: B) -> Result<Self> {
        config.validate()?;
        if behavior_oracle.classes().is_empty() {
            return Err(FieldError::Config("behavior oracle reports no classes".to_string()));
        }

        Ok(Self {
            pose_oracle,
            behavior_oracle,
            calibrator: ArenaCalibrator::new(config.calibration.clone()),
            geometry: None,
            extractor: KinematicExtractor::new(config.angle_epsilon),
            speed: SpeedEstimator::new(config.mouse_length_m, config.min_body_length_px),
            composite: CompositeFrameBuilder::new(config.window_size)?,
            aligner: StreamAligner::new(config.window_size, config.block_size, config.kalman.clone())?
                .with_speed_smoothing(config.speed_smoothing_window, config.speed_smoothing_order)?,
            kinematic: Vec::new(),
            behavior: Vec::new(),
            frames_seen: 0,
            heatmap_bins: config.heatmap_bins,
        })
    }

    pub fn geometry(&self) -> Option<&ArenaGeometry> {
        self.geometry.as_ref()
    }

    pub fn classes(&self) -> &[String] {
        self.behavior_oracle.classes()
    }

    pub fn frames_seen(&self) -> usize {
        self.frames_seen
    }

    /// Runs one frame through every stage. Frames must arrive in video order.
    pub fn process_frame(&mut self, frame: &RgbImage, time_s: f64) -> Result<FrameReport> {
        let frame_index = self.frames_seen;

        // Stage 1: Arena calibration (first frame only)
        let geometry = match &self.geometry {
            Some(geometry) => geometry.clone(),
            None => {
                let geometry = self.calibrator.calibrate_frame(frame)?;
                self.geometry = Some(geometry.clone());
                geometry
            }
        };

        // Stage 2: Pose and kinematics
        let keypoints = KeypointSet::from_oracle(self.pose_oracle.infer(frame)?)?;
        let kinematic = match keypoints {
            Some(keypoints) => {
                let mut record = self.extractor.extract(&keypoints, &geometry, time_s);
                record.speed_mps = self.speed.update(&keypoints, time_s);
                self.kinematic.push((frame_index, record.clone()));
                Some(record)
            }
            None => {
                debug!(frame = frame_index, "pose missing, frame kept for the composite window");
                None
            }
        };

        // Stage 3: Composite window and behavior classification
        let composite = self.composite.push(frame.clone())?;
        let behavior = match &composite {
            Some(composite) => {
                let probabilities = self.behavior_oracle.infer(&composite.image)?;
                let expected = self.behavior_oracle.classes().len();
                if probabilities.len() != expected {
                    return Err(FieldError::ClassCountMismatch {
                        expected,
                        got: probabilities.len(),
                    });
                }
                kalman::check_probabilities(&probabilities)?;
                self.behavior.push(probabilities.clone());
                Some(probabilities)
            }
            None => None,
        };

        self.frames_seen += 1;
        Ok(FrameReport {
            frame_index,
            kinematic,
            composite,
            behavior,
        })
    }

    /// Aligns, denoises and labels the recorded streams.
    pub fn finish(self) -> Result<AnalysisOutput> {
        let classes = self.behavior_oracle.classes().to_vec();
        let frames_total = self.frames_seen;
        info!(
            frames = frames_total,
            poses = self.kinematic.len(),
            windows = self.behavior.len(),
            "frame loop finished"
        );

        let table = self
            .aligner
            .align_frames(classes, self.kinematic, &self.behavior, frames_total)?;
        let summary = SessionSummary::from_table(&table, Some(frames_total));
        info!(
            distance_m = summary.distance_m,
            mean_speed_mps = summary.mean_speed_mps,
            labeled = summary.labeled_rows,
            "session summarized"
        );

        let heatmap = self
            .geometry
            .as_ref()
            .map(|geometry| ArenaHeatmap::from_table(&table, geometry.radius_arena() as f64, self.heatmap_bins))
            .transpose()?;

        Ok(AnalysisOutput {
            geometry: self.geometry,
            table,
            summary,
            heatmap,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::arena::Zone;
    use crate::core_modules::hough::HoughParams;
    use crate::error::CalibrationError;
    use image::Rgb;
    use std::collections::HashSet;

    /// Bright arena floor of radius 200 at (320, 240) with a center marker and
    /// a zone marker 50 px to the right.
    fn arena_frame() -> RgbImage {
        let mut frame = RgbImage::new(640, 480);
        for (x, y, pixel) in frame.enumerate_pixels_mut() {
            let d = ((x as f64 - 320.0).powi(2) + (y as f64 - 240.0).powi(2)).sqrt();
            if d <= 200.0 {
                *pixel = Rgb([200, 200, 200]);
            }
        }
        for (cx, cy) in [(320u32, 240u32), (370, 240)] {
            for y in cy - 3..=cy + 3 {
                for x in cx - 3..=cx + 3 {
                    frame.put_pixel(x, y, Rgb([0, 0, 0]));
                }
            }
        }
        frame
    }

    fn test_config() -> FieldConfig {
        FieldConfig {
            calibration: CalibrationConfig {
                hough: HoughParams {
                    min_radius: 150,
                    max_radius: 250,
                    param2: 40.0,
                    ..HoughParams::default()
                },
                ..CalibrationConfig::default()
            },
            window_size: 3,
            block_size: 2,
            ..FieldConfig::default()
        }
    }

    /// Straight 80 px mouse with its neck at `(x, 300)`, moving right each frame.
    struct ScriptedPose {
        frame: i32,
        missing: HashSet<i32>,
    }

    impl PoseOracle for ScriptedPose {
        fn infer(&mut self, _frame: &RgbImage) -> Result<Vec<(i32, i32)>> {
            let frame = self.frame;
            self.frame += 1;
            if self.missing.contains(&frame) {
                return Ok(Vec::new());
            }
            let x = 300 + 10 * frame;
            let nose = (x, 280);
            let neck = (x, 300);
            let tail = (x, 360);
            Ok(vec![nose, nose, nose, neck, neck, tail, tail])
        }
    }

    struct FixedBehavior {
        classes: Vec<String>,
        output: Vec<f64>,
    }

    impl BehaviorOracle for FixedBehavior {
        fn classes(&self) -> &[String] {
            &self.classes
        }

        fn infer(&mut self, _composite: &RgbImage) -> Result<Vec<f64>> {
            Ok(self.output.clone())
        }
    }

    fn behavior(output: Vec<f64>) -> FixedBehavior {
        FixedBehavior {
            classes: vec!["groom".into(), "run".into(), "sit".into()],
            output,
        }
    }

    fn pose(missing: &[i32]) -> ScriptedPose {
        ScriptedPose {
            frame: 0,
            missing: missing.iter().copied().collect(),
        }
    }

    #[test]
    fn full_session_aligns_by_frame() {
        let mut session =
            FieldSession::new(test_config(), pose(&[2]), behavior(vec![0.1, 0.8, 0.1])).expect("valid config");
        let frame = arena_frame();

        let reports: Vec<FrameReport> = (0..6)
            .map(|i| session.process_frame(&frame, i as f64 * 0.04).expect("frame"))
            .collect();

        assert_eq!(session.geometry().map(|g| g.center()), Some((320, 240)));
        assert!(reports[2].kinematic.is_none());
        assert!(reports[1].composite.is_none());
        assert_eq!(reports[2].composite.as_ref().map(|c| c.center_index), Some(1));
        assert_eq!(reports[5].behavior, Some(vec![0.1, 0.8, 0.1]));

        let first = reports[0].kinematic.as_ref().expect("pose on frame 0");
        assert_eq!(first.speed_mps, 0.0);
        // Centroid (300, 310): 20 px left of and 70 px below the center.
        assert_eq!(first.position, (-20.0, -70.0));
        // Three nose points are central, neck and tail points split internal/middle.
        assert_eq!(first.zone, Zone::Central);
        // 10 px per 0.04 s at 1 mm per px.
        assert_eq!(reports[1].kinematic.as_ref().map(|k| k.speed_mps), Some(0.25));

        let output = session.finish().expect("finish");
        let observed: Vec<bool> = output.table.records.iter().map(|r| r.raw.is_some()).collect();
        assert_eq!(observed, vec![false, true, true, true, false]);
        assert!(output.table.records.iter().flat_map(|r| r.label).all(|label| label == 1));
        assert_eq!(output.summary.frames_total, Some(6));
        // Pose rows at 0.0 to 0.2 s with frame 2 missing: the gap is still counted.
        let zones = &output.summary.zone_seconds;
        assert!((zones.central + zones.internal + zones.middle + zones.outer - 0.2).abs() < 1e-9);
        let percent = &output.summary.zone_percent;
        assert!((percent.central + percent.internal + percent.middle + percent.outer - 100.0).abs() < 1e-9);
        let heatmap = output.heatmap.expect("arena was calibrated");
        assert_eq!(heatmap.bins, DEFAULT_HEATMAP_BINS);
        assert_eq!(heatmap.counts.iter().flatten().sum::<u32>(), 5);
        assert_eq!(output.summary.frames_with_pose, 5);
        assert_eq!(output.summary.behaviors[1].share, 1.0);
    }

    #[test]
    fn blank_first_frame_aborts() {
        let mut session =
            FieldSession::new(test_config(), pose(&[]), behavior(vec![0.1, 0.8, 0.1])).expect("valid config");
        let err = session.process_frame(&RgbImage::new(640, 480), 0.0).expect_err("no arena");
        assert!(matches!(err, FieldError::Calibration(CalibrationError::NoArenaCircle)));
    }

    #[test]
    fn wrong_probability_width_is_fatal() {
        let mut session =
            FieldSession::new(test_config(), pose(&[]), behavior(vec![0.5, 0.5])).expect("valid config");
        let frame = arena_frame();
        session.process_frame(&frame, 0.0).expect("frame 0");
        session.process_frame(&frame, 0.04).expect("frame 1");
        let err = session.process_frame(&frame, 0.08).expect_err("window full");
        assert!(matches!(err, FieldError::ClassCountMismatch { expected: 3, got: 2 }));
    }

    #[test]
    fn nan_probability_is_fatal() {
        let mut session =
            FieldSession::new(test_config(), pose(&[]), behavior(vec![0.1, f64::NAN, 0.1])).expect("valid config");
        let frame = arena_frame();
        session.process_frame(&frame, 0.0).expect("frame 0");
        session.process_frame(&frame, 0.04).expect("frame 1");
        let err = session.process_frame(&frame, 0.08).expect_err("window full");
        assert!(matches!(err, FieldError::InvalidProbability { class: 1, .. }));
    }

    #[test]
    fn short_video_has_no_labels() {
        let mut session =
            FieldSession::new(test_config(), pose(&[]), behavior(vec![0.1, 0.8, 0.1])).expect("valid config");
        let frame = arena_frame();
        session.process_frame(&frame, 0.0).expect("frame 0");
        session.process_frame(&frame, 0.04).expect("frame 1");
        let output = session.finish().expect("finish");
        assert_eq!(output.table.records.len(), 2);
        assert!(output.table.records.iter().all(|r| r.label.is_none()));
        assert_eq!(output.summary.labeled_rows, 0);
    }

    #[test]
    fn config_validation() {
        assert!(FieldConfig::default().validate().is_ok());
        let even = FieldConfig {
            window_size: 20,
            ..FieldConfig::default()
        };
        assert!(matches!(even.validate(), Err(FieldError::Config(_))));
        let no_blocks = FieldConfig {
            block_size: 0,
            ..FieldConfig::default()
        };
        assert!(no_blocks.validate().is_err());
        let mut roi = FieldConfig::default();
        roi.calibration.roi_offset = 0.9;
        assert!(roi.validate().is_err());
        let even_smoothing = FieldConfig {
            speed_smoothing_window: 90,
            ..FieldConfig::default()
        };
        assert!(even_smoothing.validate().is_err());
        let no_bins = FieldConfig {
            heatmap_bins: 0,
            ..FieldConfig::default()
        };
        assert!(no_bins.validate().is_err());
    }

    #[test]
    fn behavior_oracle_without_classes_is_rejected() {
        let empty = FixedBehavior {
            classes: Vec::new(),
            output: Vec::new(),
        };
        assert!(FieldSession::new(FieldConfig::default(), pose(&[]), empty).is_err());
    }
}
