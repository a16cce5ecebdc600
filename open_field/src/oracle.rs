// THEORY:
// The pose estimator and the behavior classifier are neural networks that live
// outside this crate. The session only needs one call from each, so each is a
// trait with a single inference method, injected when the session is built.
//
// Two replay implementations ship with the crate. They feed back output that
// was recorded earlier, which lets a run be repeated without the models (and
// lets tests script exactly what the models "see").

use crate::error::{FieldError, Result};
use crate::export;
use image::RgbImage;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{info, warn};

/// Finds the seven body keypoints in a frame.
pub trait PoseOracle {
    /// Keypoints in anatomical order, or an empty list when no animal is visible.
    fn infer(&mut self, frame: &RgbImage) -> Result<Vec<(i32, i32)>>;
}

/// Classifies a composite frame into behavior probabilities.
pub trait BehaviorOracle {
    /// Class names, in the order of the probability vector.
    fn classes(&self) -> &[String];

    fn infer(&mut self, composite: &RgbImage) -> Result<Vec<f64>>;
}

/// Replays recorded poses, one JSON array of `[x, y]` pairs per line.
#[derive(Debug, Clone, Default)]
pub struct PoseReplay {
    poses: VecDeque<Vec<(i32, i32)>>,
    exhausted_warned: bool,
}

impl PoseReplay {
    pub fn new(poses: impl IntoIterator<Item = Vec<(i32, i32)>>) -> Self {
        Self {
            poses: poses.into_iter().collect(),
            exhausted_warned: false,
        }
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut poses = VecDeque::new();
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let pose: Vec<(i32, i32)> = serde_json::from_str(line)
                .map_err(|e| FieldError::Parse(format!("pose line {}: {e}", number + 1)))?;
            poses.push_back(pose);
        }
        info!(frames = poses.len(), "pose replay loaded");
        Ok(Self {
            poses,
            exhausted_warned: false,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }

    pub fn remaining(&self) -> usize {
        self.poses.len()
    }
}

impl PoseOracle for PoseReplay {
    fn infer(&mut self, _frame: &RgbImage) -> Result<Vec<(i32, i32)>> {
        match self.poses.pop_front() {
            Some(pose) => Ok(pose),
            None => {
                if !self.exhausted_warned {
                    warn!("pose replay exhausted, reporting no detections");
                    self.exhausted_warned = true;
                }
                Ok(Vec::new())
            }
        }
    }
}

/// Replays a recorded behavior CSV, one row per composite window.
#[derive(Debug, Clone)]
pub struct BehaviorReplay {
    classes: Vec<String>,
    rows: VecDeque<Vec<f64>>,
}

impl BehaviorReplay {
    pub fn new(classes: Vec<String>, rows: impl IntoIterator<Item = Vec<f64>>) -> Self {
        Self {
            classes,
            rows: rows.into_iter().collect(),
        }
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let (classes, rows) = export::read_behavior_csv(reader)?;
        info!(windows = rows.len(), classes = classes.len(), "behavior replay loaded");
        Ok(Self::new(classes, rows))
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }

    pub fn remaining(&self) -> usize {
        self.rows.len()
    }
}

impl BehaviorOracle for BehaviorReplay {
    fn classes(&self) -> &[String] {
        &self.classes
    }

    fn infer(&mut self, _composite: &RgbImage) -> Result<Vec<f64>> {
        self.rows
            .pop_front()
            .ok_or_else(|| FieldError::Oracle("behavior replay exhausted".to_string()))
    }
}
