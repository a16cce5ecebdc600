// THEORY:
// The `export` module persists what a run measured. Everything is plain
// comma-separated text so the files open in any spreadsheet, plus a JSON
// summary and a JSON heatmap per video.
//
// Key architectural principles:
// 1.  **Incremental Writers**: Kinematic and behavior rows are written as they
//     are produced, so a crash mid-video still leaves usable files.
// 2.  **Round-Trippable**: Both incremental files can be read back, which lets
//     the alignment stage run later from files alone.
// 3.  **Empty Means Missing**: A cell with no value is left empty; there is no
//     sentinel number that could be mistaken for data.
// 4.  **Deterministic Names**: All outputs of a video are named after its file
//     stem, so repeated runs overwrite instead of accumulating.

use crate::core_modules::alignment::MergedTable;
use crate::core_modules::arena::Zone;
use crate::core_modules::kalman;
use crate::core_modules::kinematics::KinematicRecord;
use crate::core_modules::summary::{ArenaHeatmap, SessionSummary};
use crate::error::{FieldError, Result};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

pub const KINEMATIC_HEADER: [&str; 9] = [
    "Time(m:s)",
    "X(px)",
    "Y(px)",
    "Central",
    "Internal",
    "Middle",
    "Outer",
    "Angle(deg)",
    "Speed(m/s)",
];

/// Seconds as `m:ss.ss`.
pub fn format_timestamp(seconds: f64) -> String {
    let hundredths = (seconds.max(0.0) * 100.0).round() as u64;
    let minutes = hundredths / 6000;
    let rest = hundredths % 6000;
    format!("{}:{:02}.{:02}", minutes, rest / 100, rest % 100)
}

/// Inverse of [`format_timestamp`].
pub fn parse_timestamp(text: &str) -> Result<f64> {
    let (minutes, seconds) = text
        .trim()
        .split_once(':')
        .ok_or_else(|| FieldError::Parse(format!("timestamp '{text}' has no ':'")))?;
    let minutes: u64 = minutes
        .parse()
        .map_err(|_| FieldError::Parse(format!("bad minutes in timestamp '{text}'")))?;
    let seconds: f64 = seconds
        .parse()
        .map_err(|_| FieldError::Parse(format!("bad seconds in timestamp '{text}'")))?;
    Ok(minutes as f64 * 60.0 + seconds)
}

fn kinematic_cells(record: &KinematicRecord) -> Vec<String> {
    let mut cells = vec![
        format_timestamp(record.time_s),
        format!("{:.2}", record.position.0),
        format!("{:.2}", record.position.1),
    ];
    cells.extend(record.zone_onehot().iter().map(|v| v.to_string()));
    cells.push(format!("{:.1}", record.angle_deg));
    cells.push(format!("{:.3}", record.speed_mps));
    cells
}

/// Writes `<stem>_static.csv` one row at a time.
pub struct KinematicCsvWriter<W: Write> {
    writer: W,
    rows: usize,
}

impl<W: Write> KinematicCsvWriter<W> {
    pub fn new(mut writer: W) -> Result<Self> {
        writeln!(writer, "{}", KINEMATIC_HEADER.join(","))?;
        Ok(Self { writer, rows: 0 })
    }

    pub fn write_record(&mut self, record: &KinematicRecord) -> Result<()> {
        writeln!(self.writer, "{}", kinematic_cells(record).join(","))?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn finish(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// Writes `<stem>_behavior.csv` one window at a time.
pub struct BehaviorCsvWriter<W: Write> {
    writer: W,
    classes: usize,
}

impl<W: Write> BehaviorCsvWriter<W> {
    pub fn new(mut writer: W, classes: &[String]) -> Result<Self> {
        if let Some(bad) = classes
            .iter()
            .find(|class| class.trim().is_empty() || class.contains([',', '"', '\n', '\r']))
        {
            return Err(FieldError::Config(format!(
                "class name '{bad}' cannot be stored in a CSV header"
            )));
        }
        writeln!(writer, "{}", classes.join(","))?;
        Ok(Self {
            writer,
            classes: classes.len(),
        })
    }

    pub fn write_row(&mut self, probabilities: &[f64]) -> Result<()> {
        if probabilities.len() != self.classes {
            return Err(FieldError::ClassCountMismatch {
                expected: self.classes,
                got: probabilities.len(),
            });
        }
        let cells: Vec<String> = probabilities.iter().map(|p| format!("{p:.3}")).collect();
        writeln!(self.writer, "{}", cells.join(","))?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

fn split_row(line: &str) -> Vec<&str> {
    line.trim_end_matches(['\r', '\n']).split(',').map(str::trim).collect()
}

fn parse_cell<T: std::str::FromStr>(cell: &str, line: usize, column: &str) -> Result<T> {
    cell.parse()
        .map_err(|_| FieldError::Parse(format!("line {line}: bad {column} value '{cell}'")))
}

pub const SMOOTHED_SPEED_COLUMN: &str = "SpeedSmoothed(m/s)";

/// Reads back a kinematic CSV.
pub fn read_kinematic_csv<R: BufRead>(reader: R) -> Result<Vec<KinematicRecord>> {
    let mut lines = reader.lines();
    let header = lines
        .next()
        .transpose()?
        .ok_or_else(|| FieldError::Parse("kinematic CSV is empty".to_string()))?;
    if split_row(&header) != KINEMATIC_HEADER {
        return Err(FieldError::Parse(format!("unexpected kinematic header '{header}'")));
    }

    let mut records = Vec::new();
    for (index, line) in lines.enumerate() {
        let line = line?;
        let number = index + 2;
        if line.trim().is_empty() {
            continue;
        }
        let cells = split_row(&line);
        if cells.len() != KINEMATIC_HEADER.len() {
            return Err(FieldError::Parse(format!(
                "line {number}: expected {} cells, found {}",
                KINEMATIC_HEADER.len(),
                cells.len()
            )));
        }

        let flags: Vec<u8> = cells[3..7]
            .iter()
            .zip(&KINEMATIC_HEADER[3..7])
            .map(|(cell, column)| parse_cell(cell, number, column))
            .collect::<Result<_>>()?;
        let zone = match flags.iter().position(|&flag| flag == 1) {
            Some(i) if flags.iter().map(|&f| f as u32).sum::<u32>() == 1 => Zone::ALL[i],
            _ => return Err(FieldError::Parse(format!("line {number}: zone columns are not one-hot"))),
        };

        records.push(KinematicRecord {
            time_s: parse_timestamp(cells[0])?,
            position: (parse_cell(cells[1], number, "X")?, parse_cell(cells[2], number, "Y")?),
            zone,
            angle_deg: parse_cell(cells[7], number, "angle")?,
            speed_mps: parse_cell(cells[8], number, "speed")?,
        });
    }
    Ok(records)
}

/// Reads back a behavior CSV as `(classes, rows)`.
pub fn read_behavior_csv<R: BufRead>(reader: R) -> Result<(Vec<String>, Vec<Vec<f64>>)> {
    let mut lines = reader.lines();
    let header = lines
        .next()
        .transpose()?
        .ok_or_else(|| FieldError::Parse("behavior CSV is empty".to_string()))?;
    let classes: Vec<String> = split_row(&header).into_iter().map(str::to_string).collect();
    if classes.iter().any(String::is_empty) {
        return Err(FieldError::Parse(format!("behavior header '{header}' has an empty class name")));
    }

    let mut rows = Vec::new();
    for (index, line) in lines.enumerate() {
        let line = line?;
        let number = index + 2;
        if line.trim().is_empty() {
            continue;
        }
        let row: Vec<f64> = split_row(&line)
            .into_iter()
            .map(|cell| parse_cell(cell, number, "probability"))
            .collect::<Result<_>>()?;
        if row.len() != classes.len() {
            return Err(FieldError::ClassCountMismatch {
                expected: classes.len(),
                got: row.len(),
            });
        }
        kalman::check_probabilities(&row)?;
        rows.push(row);
    }
    Ok((classes, rows))
}

/// Writes the merged table: kinematic columns, smoothed speed, raw
/// probabilities, filtered probabilities and one-hot block labels.
pub fn write_merged_csv<W: Write>(mut writer: W, table: &MergedTable) -> Result<()> {
    let classes = &table.classes;
    let mut header: Vec<String> = KINEMATIC_HEADER.iter().map(|h| h.to_string()).collect();
    header.push(SMOOTHED_SPEED_COLUMN.to_string());
    header.extend(classes.iter().cloned());
    header.extend(classes.iter().map(|c| format!("{c}_filtered")));
    header.extend(classes.iter().map(|c| format!("{c}_label")));
    writeln!(writer, "{}", header.join(","))?;

    let blanks = || std::iter::repeat_n(String::new(), classes.len());
    for record in &table.records {
        let mut cells = kinematic_cells(&record.kinematic);
        cells.push(format!("{:.3}", record.speed_smoothed_mps));
        match &record.raw {
            Some(raw) => cells.extend(raw.iter().map(|p| format!("{p:.3}"))),
            None => cells.extend(blanks()),
        }
        match &record.filtered {
            Some(filtered) => cells.extend(filtered.iter().map(|p| format!("{p:.3}"))),
            None => cells.extend(blanks()),
        }
        match record.label_onehot(classes.len()) {
            Some(onehot) => cells.extend(onehot.iter().map(|v| v.to_string())),
            None => cells.extend(blanks()),
        }
        writeln!(writer, "{}", cells.join(","))?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_summary_json<W: Write>(mut writer: W, summary: &SessionSummary) -> Result<()> {
    serde_json::to_writer_pretty(&mut writer, summary)?;
    writer.flush()?;
    Ok(())
}

pub fn write_heatmap_json<W: Write>(mut writer: W, heatmap: &ArenaHeatmap) -> Result<()> {
    serde_json::to_writer(&mut writer, heatmap)?;
    writer.flush()?;
    Ok(())
}

/// Output file locations for one video.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputPaths {
    pub static_csv: PathBuf,
    pub behavior_csv: PathBuf,
    pub merged_csv: PathBuf,
    pub summary_json: PathBuf,
    pub heatmap_json: PathBuf,
}

impl OutputPaths {
    pub fn for_video(video: &Path, output_dir: &Path) -> Self {
        let stem = video
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".to_string());
        Self {
            static_csv: output_dir.join(format!("{stem}_static.csv")),
            behavior_csv: output_dir.join(format!("{stem}_behavior.csv")),
            merged_csv: output_dir.join(format!("{stem}_data.csv")),
            summary_json: output_dir.join(format!("{stem}_summary.json")),
            heatmap_json: output_dir.join(format!("{stem}_heatmap.json")),
        }
    }
}
