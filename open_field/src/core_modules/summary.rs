// THEORY:
// The `summary` module reduces a merged table to what an experimenter reports
// per animal: where it spent its time, how far and how fast it moved, and what
// it was doing. It reads only the finished table, so it can be recomputed from
// exported files without re-running the video.
//
// Key architectural principles:
// 1.  **Time, Not Rows**: Zone time is the elapsed time since the previous pose
//     row, credited to the zone of the current row. Frames without a pose then
//     count toward whichever zone the animal was found in next, instead of
//     vanishing from the total.
// 2.  **Gaps Break Bouts**: A bout is a run of rows carrying the same label. An
//     unlabeled row ends the run.
// 3.  **Heatmaps Are Data**: Position counts and mean speed are binned on a
//     square grid over the arena. Drawing them is left to the consumer.

use crate::core_modules::alignment::MergedTable;
use crate::core_modules::arena::Zone;
use crate::error::{FieldError, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_HEATMAP_BINS: usize = 75;

/// One value per zone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneTimes {
    pub central: f64,
    pub internal: f64,
    pub middle: f64,
    pub outer: f64,
}

impl ZoneTimes {
    fn from_array(values: [f64; 4]) -> Self {
        Self {
            central: values[Zone::Central as usize],
            internal: values[Zone::Internal as usize],
            middle: values[Zone::Middle as usize],
            outer: values[Zone::Outer as usize],
        }
    }
}

/// Time budget of one behavior class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorBudget {
    pub class: String,
    /// Share of labeled rows carrying this label.
    pub share: f64,
    /// Number of uninterrupted runs of this label.
    pub bouts: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Frames read from the video; unknown when summarizing exported files.
    pub frames_total: Option<usize>,
    pub frames_with_pose: usize,
    /// Time between the first and the last pose frame.
    pub duration_s: f64,
    pub zone_seconds: ZoneTimes,
    /// `zone_seconds` as percentages of their sum.
    pub zone_percent: ZoneTimes,
    /// Sum of speed times elapsed time between consecutive pose frames.
    pub distance_m: f64,
    pub mean_speed_mps: f64,
    pub max_speed_mps: f64,
    pub labeled_rows: usize,
    pub behaviors: Vec<BehaviorBudget>,
}

impl SessionSummary {
    pub fn from_table(table: &MergedTable, frames_total: Option<usize>) -> Self {
        let records = &table.records;
        let frames_with_pose = records.len();

        let duration_s = match (records.first(), records.last()) {
            (Some(first), Some(last)) => last.kinematic.time_s - first.kinematic.time_s,
            _ => 0.0,
        };

        // --- Zone time ---
        let mut seconds = [0.0f64; 4];
        for pair in records.windows(2) {
            let step = (pair[1].kinematic.time_s - pair[0].kinematic.time_s).max(0.0);
            seconds[pair[1].kinematic.zone as usize] += step;
        }
        let total_seconds: f64 = seconds.iter().sum();
        let percent = seconds.map(|s| if total_seconds > 0.0 { s / total_seconds * 100.0 } else { 0.0 });

        // --- Motion ---
        let distance_m = records
            .windows(2)
            .map(|pair| pair[1].kinematic.speed_mps * (pair[1].kinematic.time_s - pair[0].kinematic.time_s).max(0.0))
            .sum();
        let total_speed: f64 = records.iter().map(|r| r.kinematic.speed_mps).sum();
        let mean_speed_mps = if frames_with_pose == 0 { 0.0 } else { total_speed / frames_with_pose as f64 };
        let max_speed_mps = records.iter().map(|r| r.kinematic.speed_mps).fold(0.0, f64::max);

        // --- Behavior budget over the labeled rows ---
        let mut label_counts = vec![0usize; table.classes.len()];
        let mut bouts = vec![0usize; table.classes.len()];
        let mut labeled_rows = 0;
        let mut previous = None;
        for record in records {
            let label = record.label.filter(|&label| label < label_counts.len());
            if let Some(label) = label {
                labeled_rows += 1;
                label_counts[label] += 1;
                if previous != Some(label) {
                    bouts[label] += 1;
                }
            }
            previous = label;
        }
        let share = |count: usize| if labeled_rows == 0 { 0.0 } else { count as f64 / labeled_rows as f64 };
        let behaviors = table
            .classes
            .iter()
            .enumerate()
            .map(|(i, class)| BehaviorBudget {
                class: class.clone(),
                share: share(label_counts[i]),
                bouts: bouts[i],
            })
            .collect();

        Self {
            frames_total,
            frames_with_pose,
            duration_s,
            zone_seconds: ZoneTimes::from_array(seconds),
            zone_percent: ZoneTimes::from_array(percent),
            distance_m,
            mean_speed_mps,
            max_speed_mps,
            labeled_rows,
            behaviors,
        }
    }
}

/// Position density and mean speed on a `bins x bins` grid spanning
/// `[-radius_px, radius_px]` on both axes. Cells are indexed `[x][y]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArenaHeatmap {
    pub bins: usize,
    pub radius_px: f64,
    /// Pose rows per cell.
    pub counts: Vec<Vec<u32>>,
    /// Mean speed of the rows in each cell, 0 for empty cells.
    pub mean_speed_mps: Vec<Vec<f64>>,
}

impl ArenaHeatmap {
    pub fn from_table(table: &MergedTable, radius_px: f64, bins: usize) -> Result<Self> {
        if bins == 0 || radius_px.is_nan() || radius_px <= 0.0 {
            return Err(FieldError::Config(format!(
                "heatmap needs a positive bin count and radius, got {bins} bins over {radius_px} px"
            )));
        }

        let cell = 2.0 * radius_px / bins as f64;
        // The upper edge belongs to the last cell; anything outside the square is dropped.
        let bin_of = |value: f64| -> Option<usize> {
            if !(-radius_px..=radius_px).contains(&value) {
                return None;
            }
            Some((((value + radius_px) / cell) as usize).min(bins - 1))
        };

        let mut counts = vec![vec![0u32; bins]; bins];
        let mut speed_sums = vec![vec![0.0f64; bins]; bins];
        for record in &table.records {
            let (x, y) = record.kinematic.position;
            if let (Some(ix), Some(iy)) = (bin_of(x), bin_of(y)) {
                counts[ix][iy] += 1;
                speed_sums[ix][iy] += record.kinematic.speed_mps;
            }
        }

        let mean_speed_mps = speed_sums
            .iter()
            .zip(&counts)
            .map(|(sums, counts)| {
                sums.iter()
                    .zip(counts)
                    .map(|(&sum, &count)| if count > 0 { sum / count as f64 } else { 0.0 })
                    .collect()
            })
            .collect();

        Ok(Self {
            bins,
            radius_px,
            counts,
            mean_speed_mps,
        })
    }
}
