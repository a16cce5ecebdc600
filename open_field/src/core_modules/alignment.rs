// THEORY:
// The `alignment` module reconciles the two streams a run produces. Kinematic
// records exist for every frame with a pose. Behavior probabilities exist for
// every full composite window and describe the frame in the middle of that
// window, so they lag the frame stream by `window_size / 2` rows and stop the
// same distance before its end.
//
// Stages:
// 1.  **Shift-Align**: Missing rows are prepended to the behavior stream so row
//     `i` describes frame `i`, then appended until it is as long as the frame
//     stream. A behavior stream that cannot fit this pattern is an error, never
//     a silent truncation.
// 2.  **Denoise**: The aligned probabilities go through the `kalman` filter.
// 3.  **Discretize**: Observed rows are cut into blocks of `block_size` and every
//     row of a block gets the block's majority class.
// The speed column of the pose rows is smoothed alongside, since it is the
// only kinematic column read as a series.

use crate::core_modules::kalman::{self, KalmanConfig};
use crate::core_modules::kinematics::KinematicRecord;
use crate::core_modules::smoothing::{self, DEFAULT_SPEED_ORDER, DEFAULT_SPEED_WINDOW};
use crate::error::{FieldError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const DEFAULT_BLOCK_SIZE: usize = 25;

/// One row of the merged output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignedRecord {
    pub kinematic: KinematicRecord,
    /// Savitzky-Golay smoothed speed over the pose rows.
    pub speed_smoothed_mps: f64,
    /// Classifier output for this frame, if the frame had a full window.
    pub raw: Option<Vec<f64>>,
    pub filtered: Option<Vec<f64>>,
    /// Index into the class list of the block label.
    pub label: Option<usize>,
}

impl AlignedRecord {
    pub fn label_onehot(&self, classes: usize) -> Option<Vec<u8>> {
        self.label.map(|label| (0..classes).map(|i| u8::from(i == label)).collect())
    }
}

/// Kinematic and behavior columns joined row by row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedTable {
    pub classes: Vec<String>,
    pub records: Vec<AlignedRecord>,
}

/// Pads a behavior stream to line up with a stream of `target_len` frames.
///
/// `shift` missing rows go in front and the remainder at the back. The back
/// padding may not exceed `window_size - 1 - shift` rows, the frames that can
/// never be the center of a full window.
pub fn shift_align(
    behavior: &[Vec<f64>],
    shift: usize,
    target_len: usize,
    window_size: usize,
) -> Result<Vec<Option<Vec<f64>>>> {
    if behavior.is_empty() {
        return Ok(vec![None; target_len]);
    }

    let mismatch = || FieldError::AlignmentMismatch {
        behavior: behavior.len(),
        shift,
        kinematic: target_len,
    };
    let shifted_len = shift + behavior.len();
    if shifted_len > target_len {
        return Err(mismatch());
    }
    let tail = target_len - shifted_len;
    if tail > window_size.saturating_sub(1 + shift) {
        return Err(mismatch());
    }

    let mut aligned = Vec::with_capacity(target_len);
    aligned.extend(std::iter::repeat_n(None, shift));
    aligned.extend(behavior.iter().cloned().map(Some));
    aligned.extend(std::iter::repeat_n(None, tail));
    Ok(aligned)
}

/// First index of the largest value.
pub fn argmax(row: &[f64]) -> usize {
    let mut best = 0;
    for (i, value) in row.iter().enumerate().skip(1) {
        if *value > row[best] {
            best = i;
        }
    }
    best
}

/// Block-majority labels for the observed rows. Missing rows stay unlabeled
/// and do not count toward block size.
pub fn discretize(rows: &[Option<Vec<f64>>], block_size: usize) -> Vec<Option<usize>> {
    let mut labels = vec![None; rows.len()];
    let observed: Vec<usize> = rows
        .iter()
        .enumerate()
        .filter_map(|(i, row)| row.as_ref().map(|_| i))
        .collect();

    for block in observed.chunks(block_size.max(1)) {
        let block_rows: Vec<&[f64]> = block
            .iter()
            .filter_map(|&i| rows[i].as_deref())
            .collect();
        let label = block_label(&block_rows);
        for &i in block {
            labels[i] = Some(label);
        }
    }
    labels
}

/// Majority argmax of a block. Ties go to the class with the highest mean
/// probability over the rows voting for any tied class, then to the lowest index.
fn block_label(rows: &[&[f64]]) -> usize {
    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    let votes: Vec<usize> = rows.iter().map(|row| argmax(row)).collect();
    for &vote in &votes {
        *counts.entry(vote).or_default() += 1;
    }
    let top = counts.values().copied().max().unwrap_or(0);
    let tied: Vec<usize> = counts.iter().filter(|&(_, &n)| n == top).map(|(&class, _)| class).collect();
    if tied.len() == 1 {
        return tied[0];
    }

    let tied_rows: Vec<&[f64]> = rows
        .iter()
        .zip(&votes)
        .filter(|(_, vote)| tied.contains(*vote))
        .map(|(row, _)| *row)
        .collect();
    let mean = |class: usize| tied_rows.iter().map(|row| row[class]).sum::<f64>() / tied_rows.len() as f64;

    let mut best = tied[0];
    for &class in &tied[1..] {
        if mean(class) > mean(best) {
            best = class;
        }
    }
    debug!(tied = ?tied, winner = best, "block majority tie resolved by mean probability");
    best
}

/// Joins, denoises and labels the two streams of a finished run.
#[derive(Debug, Clone)]
pub struct StreamAligner {
    window_size: usize,
    block_size: usize,
    kalman: KalmanConfig,
    speed_window: usize,
    speed_order: usize,
}

impl StreamAligner {
    pub fn new(window_size: usize, block_size: usize, kalman: KalmanConfig) -> Result<Self> {
        if block_size == 0 {
            return Err(FieldError::Config("block size must be positive".to_string()));
        }
        kalman.validate()?;
        Ok(Self {
            window_size,
            block_size,
            kalman,
            speed_window: DEFAULT_SPEED_WINDOW,
            speed_order: DEFAULT_SPEED_ORDER,
        })
    }

    /// Replaces the Savitzky-Golay window and polynomial order used for speed.
    pub fn with_speed_smoothing(mut self, window: usize, order: usize) -> Result<Self> {
        smoothing::check_params(window, order)?;
        self.speed_window = window;
        self.speed_order = order;
        Ok(self)
    }

    pub fn shift(&self) -> usize {
        self.window_size / 2
    }

    /// Positional alignment: behavior row `j` belongs to kinematic row `j + shift`.
    pub fn align(
        &self,
        classes: Vec<String>,
        kinematic: Vec<KinematicRecord>,
        behavior: &[Vec<f64>],
    ) -> Result<MergedTable> {
        let raw = shift_align(behavior, self.shift(), kinematic.len(), self.window_size)?;
        self.finish(classes, kinematic, raw)
    }

    /// Alignment by frame number, for runs where some frames had no pose.
    ///
    /// `frame_count` is the number of frames pushed through the composite
    /// window; each kinematic record carries the frame it was measured on.
    pub fn align_frames(
        &self,
        classes: Vec<String>,
        kinematic: Vec<(usize, KinematicRecord)>,
        behavior: &[Vec<f64>],
        frame_count: usize,
    ) -> Result<MergedTable> {
        let per_frame = shift_align(behavior, self.shift(), frame_count, self.window_size)?;
        let mut raw = Vec::with_capacity(kinematic.len());
        let mut records = Vec::with_capacity(kinematic.len());
        for (frame, record) in kinematic {
            let row = per_frame.get(frame).ok_or(FieldError::AlignmentMismatch {
                behavior: behavior.len(),
                shift: self.shift(),
                kinematic: frame_count,
            })?;
            raw.push(row.clone());
            records.push(record);
        }
        self.finish(classes, records, raw)
    }

    fn finish(
        &self,
        classes: Vec<String>,
        kinematic: Vec<KinematicRecord>,
        raw: Vec<Option<Vec<f64>>>,
    ) -> Result<MergedTable> {
        let filtered = kalman::denoise(&raw, classes.len(), &self.kalman)?;
        let labels = discretize(&filtered, self.block_size);
        let speeds: Vec<f64> = kinematic.iter().map(|k| k.speed_mps).collect();
        let smoothed = smoothing::savitzky_golay(&speeds, self.speed_window, self.speed_order)?;

        let records: Vec<AlignedRecord> = kinematic
            .into_iter()
            .zip(smoothed)
            .zip(raw)
            .zip(filtered)
            .zip(labels)
            .map(|((((kinematic, speed_smoothed_mps), raw), filtered), label)| AlignedRecord {
                kinematic,
                speed_smoothed_mps,
                raw,
                filtered,
                label,
            })
            .collect();

        info!(
            rows = records.len(),
            labeled = records.iter().filter(|r| r.label.is_some()).count(),
            "streams aligned"
        );
        Ok(MergedTable { classes, records })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::arena::Zone;
    use pretty_assertions::assert_eq;

    fn record(i: usize) -> KinematicRecord {
        KinematicRecord {
            time_s: i as f64 * 0.04,
            position: (i as f64, 0.0),
            zone: Zone::Central,
            angle_deg: 0.0,
            speed_mps: 0.0,
        }
    }

    fn classes() -> Vec<String> {
        vec!["groom".to_string(), "run".to_string(), "sit".to_string()]
    }

    #[test]
    fn shift_pads_front_and_back() {
        let behavior: Vec<Vec<f64>> = (0..90).map(|i| vec![i as f64]).collect();
        let aligned = shift_align(&behavior, 10, 100, 21).expect("fits");
        assert_eq!(aligned.len(), 100);
        assert!(aligned[..10].iter().all(Option::is_none));
        assert_eq!(aligned[10], Some(vec![0.0]));
        assert_eq!(aligned[99], Some(vec![89.0]));

        let shorter = shift_align(&behavior[..80], 10, 100, 21).expect("fits");
        assert_eq!(shorter[89], Some(vec![79.0]));
        assert!(shorter[90..].iter().all(Option::is_none));
    }

    #[test]
    fn overlong_or_short_behavior_is_a_mismatch() {
        let behavior = vec![vec![1.0]; 95];
        assert!(matches!(
            shift_align(&behavior, 10, 100, 21),
            Err(FieldError::AlignmentMismatch {
                behavior: 95,
                shift: 10,
                kinematic: 100
            })
        ));
        let sparse = vec![vec![1.0]; 50];
        assert!(shift_align(&sparse, 10, 100, 21).is_err());
    }

    #[test]
    fn empty_behavior_is_all_missing() {
        let aligned = shift_align(&[], 10, 5, 21).expect("empty fits");
        assert_eq!(aligned, vec![None; 5]);
    }

    #[test]
    fn block_majority_wins() {
        // Block 1: 15 rows vote class 0, 10 vote class 1. Block 2: all class 2.
        let mut rows: Vec<Option<Vec<f64>>> = Vec::new();
        rows.extend(vec![Some(vec![0.6, 0.3, 0.1]); 15]);
        rows.extend(vec![Some(vec![0.2, 0.7, 0.1]); 10]);
        rows.extend(vec![Some(vec![0.1, 0.1, 0.8]); 25]);
        let labels = discretize(&rows, 25);
        assert_eq!(labels[..25].to_vec(), vec![Some(0); 25]);
        assert_eq!(labels[25..].to_vec(), vec![Some(2); 25]);
    }

    #[test]
    fn tie_goes_to_higher_mean_probability() {
        let mut rows = vec![Some(vec![0.5, 0.4, 0.1]); 2];
        rows.extend(vec![Some(vec![0.05, 0.9, 0.05]); 2]);
        // Means over the four tied rows: class 0 = 0.275, class 1 = 0.65.
        assert_eq!(discretize(&rows, 4), vec![Some(1); 4]);
    }

    #[test]
    fn exact_tie_goes_to_lowest_index() {
        let rows = vec![Some(vec![0.6, 0.4]), Some(vec![0.4, 0.6])];
        assert_eq!(discretize(&rows, 2), vec![Some(0); 2]);
    }

    #[test]
    fn blocks_skip_missing_rows_and_last_block_may_be_short() {
        let mut rows = vec![None, None];
        rows.extend(vec![Some(vec![0.9, 0.1]); 3]);
        rows.push(Some(vec![0.1, 0.9]));
        rows.push(None);
        let labels = discretize(&rows, 3);
        assert_eq!(labels, vec![None, None, Some(0), Some(0), Some(0), Some(1), None]);
    }

    #[test]
    fn aligner_merges_streams() {
        let aligner = StreamAligner::new(5, 3, KalmanConfig::default()).expect("valid");
        let kinematic: Vec<KinematicRecord> = (0..8).map(record).collect();
        let behavior = vec![vec![0.8, 0.1, 0.1]; 4];
        let table = aligner.align(classes(), kinematic, &behavior).expect("aligned");

        assert_eq!(table.records.len(), 8);
        let observed: Vec<bool> = table.records.iter().map(|r| r.raw.is_some()).collect();
        assert_eq!(observed, vec![false, false, true, true, true, true, false, false]);
        for r in &table.records {
            assert_eq!(r.raw.is_some(), r.filtered.is_some());
            assert_eq!(r.raw.is_some(), r.label.is_some());
        }
        assert_eq!(table.records[2].label, Some(0));
        assert_eq!(table.records[2].label_onehot(3), Some(vec![1, 0, 0]));
        assert_eq!(table.records[0].label_onehot(3), None);
    }

    #[test]
    fn frame_alignment_skips_frames_without_pose() {
        let aligner = StreamAligner::new(3, 25, KalmanConfig::default()).expect("valid");
        // Six frames, shift 1, behavior for frames 1..=4; frame 2 had no pose.
        let kinematic: Vec<(usize, KinematicRecord)> =
            [0, 1, 3, 4, 5].into_iter().map(|frame| (frame, record(frame))).collect();
        let behavior = vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 1.0], vec![1.0, 0.0, 0.0]];
        let table = aligner.align_frames(classes(), kinematic, &behavior, 6).expect("aligned");

        let raw: Vec<Option<Vec<f64>>> = table.records.iter().map(|r| r.raw.clone()).collect();
        assert_eq!(
            raw,
            vec![
                None,
                Some(vec![1.0, 0.0, 0.0]),
                Some(vec![0.0, 0.0, 1.0]),
                Some(vec![1.0, 0.0, 0.0]),
                None,
            ]
        );
    }

    #[test]
    fn zero_block_size_is_rejected() {
        assert!(StreamAligner::new(21, 0, KalmanConfig::default()).is_err());
    }

    #[test]
    fn speed_column_is_smoothed() {
        let aligner = StreamAligner::new(3, 25, KalmanConfig::default())
            .expect("valid")
            .with_speed_smoothing(5, 1)
            .expect("valid smoothing");
        let kinematic: Vec<KinematicRecord> = (0..9)
            .map(|i| KinematicRecord {
                speed_mps: if i == 4 { 0.5 } else { 0.0 },
                ..record(i)
            })
            .collect();
        let table = aligner.align(classes(), kinematic, &[]).expect("aligned");

        let smoothed: Vec<f64> = table.records.iter().map(|r| r.speed_smoothed_mps).collect();
        // A straight-line fit over five samples spreads the spike evenly.
        for value in &smoothed[2..7] {
            assert!((value - 0.1).abs() < 1e-9, "{smoothed:?}");
        }
        // Edge rows are read off the line fitted to the outermost window.
        assert!((smoothed[0] + 0.1).abs() < 1e-9, "{smoothed:?}");
        assert!((smoothed[8] + 0.1).abs() < 1e-9, "{smoothed:?}");
        assert_eq!(table.records[4].kinematic.speed_mps, 0.5);

        assert!(StreamAligner::new(3, 25, KalmanConfig::default())
            .expect("valid")
            .with_speed_smoothing(4, 1)
            .is_err());
    }
}
