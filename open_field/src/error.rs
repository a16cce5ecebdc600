// THEORY:
// Every failure the engine can surface lives here. Calibration failures are
// grouped in their own enum because they share one consequence: without an
// arena there is nothing to measure, so the whole run stops. Missing or
// degenerate poses are not errors at all; they are handled where they occur.

use thiserror::Error;

/// Result type alias used across the crate.
pub type Result<T> = std::result::Result<T, FieldError>;

/// Reasons the arena could not be calibrated from the reference frame.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    #[error("no arena circle detected in the reference frame")]
    NoArenaCircle,

    #[error("no marker contours found inside the search region")]
    NoMarkers,

    #[error("marker contour has zero area")]
    DegenerateMarker,

    #[error("central-zone marker not found")]
    MissingZoneMarker,

    #[error("zone boundaries out of order: {0}")]
    InvalidZones(String),

    #[error("image processing failed: {0}")]
    Vision(String),
}

impl From<opencv::Error> for CalibrationError {
    fn from(e: opencv::Error) -> Self {
        CalibrationError::Vision(e.to_string())
    }
}

/// Errors that abort a run.
#[derive(Debug, Error)]
pub enum FieldError {
    #[error("calibration failed: {0}")]
    Calibration(#[from] CalibrationError),

    #[error(
        "behavior stream of {behavior} rows shifted by {shift} does not fit a kinematic stream of {kinematic} rows"
    )]
    AlignmentMismatch {
        behavior: usize,
        shift: usize,
        kinematic: usize,
    },

    #[error("pose oracle returned {0} keypoints, expected 0 or 7")]
    MalformedPose(usize),

    #[error("behavior vector has {got} classes, expected {expected}")]
    ClassCountMismatch { expected: usize, got: usize },

    #[error("behavior probability {value} for class {class} is not in [0, 1]")]
    InvalidProbability { class: usize, value: f64 },

    #[error("frame is {got_width}x{got_height}, window holds {width}x{height} frames")]
    FrameSizeMismatch {
        width: u32,
        height: u32,
        got_width: u32,
        got_height: u32,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("oracle error: {0}")]
    Oracle(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
