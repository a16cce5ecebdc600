// Layered from raw pixels up to per-session statistics:
// contour/hough (image geometry) -> arena (calibration) -> keypoints/kinematics/speed
// (per frame) -> composite (per window) -> kalman/smoothing/alignment (per run) -> summary.

pub mod alignment;
pub mod arena;
pub mod composite;
pub mod contour;
pub mod hough;
pub mod kalman;
pub mod keypoints;
pub mod kinematics;
pub mod smoothing;
pub mod speed;
pub mod summary;
pub mod utils;
