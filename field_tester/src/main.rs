use anyhow::{Context, bail};
use futures::stream::{self, StreamExt};
use image::RgbImage;
use open_field::core_modules::alignment::StreamAligner;
use open_field::core_modules::summary::{ArenaHeatmap, SessionSummary};
use open_field::core_modules::utils::image_helper;
use open_field::export::{self, BehaviorCsvWriter, KinematicCsvWriter, OutputPaths};
use open_field::oracle::{BehaviorReplay, PoseReplay};
use open_field::{FieldConfig, FieldSession};
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture},
};
use serde::Deserialize;
use std::env;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Batch description: which recordings to analyse and where to put the results.
#[derive(Debug, Clone, Deserialize)]
struct Manifest {
    output_dir: PathBuf,
    jobs: Vec<Job>,
}

#[derive(Debug, Clone, Deserialize)]
struct Job {
    video: PathBuf,
    /// Recorded pose oracle output, one JSON array per frame.
    poses: PathBuf,
    /// Recorded behavior oracle output, one CSV row per window.
    behaviors: PathBuf,
    /// Where to drop composite frames as PNG, if anywhere.
    #[serde(default)]
    composites_dir: Option<PathBuf>,
}

fn print_usage() {
    println!("Usage:");
    println!("  field_tester <manifest.json>");
    println!("  field_tester merge <static.csv> <behavior.csv> <merged.csv> [arena_radius_px]");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // --- 1. Argument Parsing ---
    let args: Vec<String> = env::args().collect();
    match args.as_slice() {
        [_, command, static_csv, behavior_csv, merged_csv] if command == "merge" => {
            merge(Path::new(static_csv), Path::new(behavior_csv), Path::new(merged_csv), None)
        }
        [_, command, static_csv, behavior_csv, merged_csv, radius] if command == "merge" => {
            let radius: f64 = radius
                .parse()
                .with_context(|| format!("arena radius '{radius}' is not a number"))?;
            merge(Path::new(static_csv), Path::new(behavior_csv), Path::new(merged_csv), Some(radius))
        }
        [_, manifest] => run_manifest(Path::new(manifest)).await,
        _ => {
            print_usage();
            Ok(())
        }
    }
}

async fn run_manifest(path: &Path) -> anyhow::Result<()> {
    let manifest: Manifest = serde_json::from_reader(BufReader::new(
        File::open(path).with_context(|| format!("opening manifest {}", path.display()))?,
    ))
    .with_context(|| format!("parsing manifest {}", path.display()))?;
    std::fs::create_dir_all(&manifest.output_dir)
        .with_context(|| format!("creating {}", manifest.output_dir.display()))?;

    // --- 2. Concurrent Recordings ---
    // Each recording is independent and CPU bound, so it runs on the blocking pool.
    let workers = num_cpus::get();
    info!(jobs = manifest.jobs.len(), workers, "starting batch");
    let output_dir = manifest.output_dir.clone();
    let results: Vec<(PathBuf, anyhow::Result<SessionSummary>)> = stream::iter(manifest.jobs)
        .map(|job| {
            let output_dir = output_dir.clone();
            async move {
                let video = job.video.clone();
                let result = tokio::task::spawn_blocking(move || run_job(&job, &output_dir))
                    .await
                    .context("analysis task panicked")
                    .and_then(|result| result);
                (video, result)
            }
        })
        .buffer_unordered(workers)
        .collect()
        .await;

    // --- 3. Report ---
    let mut failures = 0;
    for (video, result) in results {
        match result {
            Ok(summary) => info!(
                video = %video.display(),
                frames = ?summary.frames_total,
                distance_m = summary.distance_m,
                "recording done"
            ),
            Err(e) => {
                failures += 1;
                error!(video = %video.display(), "recording failed: {e:#}");
            }
        }
    }
    if failures > 0 {
        bail!("{failures} recording(s) failed");
    }
    Ok(())
}

/// Analyses one recording end to end and writes every output file.
fn run_job(job: &Job, output_dir: &Path) -> anyhow::Result<SessionSummary> {
    // --- Video I/O Initialization ---
    let video_path = job.video.to_string_lossy();
    let mut cap = VideoCapture::from_file(&video_path, videoio::CAP_ANY)?;
    if !cap.is_opened()? {
        bail!("cannot open video {}", job.video.display());
    }
    let fps = cap.get(videoio::CAP_PROP_FPS)?;
    if fps <= 0.0 {
        bail!("video {} reports no frame rate", job.video.display());
    }

    // --- Session Initialization ---
    let pose = PoseReplay::open(&job.poses).with_context(|| format!("loading {}", job.poses.display()))?;
    let behavior =
        BehaviorReplay::open(&job.behaviors).with_context(|| format!("loading {}", job.behaviors.display()))?;
    let mut session = FieldSession::new(FieldConfig::default(), pose, behavior)?;

    let paths = OutputPaths::for_video(&job.video, output_dir);
    let mut kinematic_writer = KinematicCsvWriter::new(BufWriter::new(File::create(&paths.static_csv)?))?;
    let mut behavior_writer = BehaviorCsvWriter::new(BufWriter::new(File::create(&paths.behavior_csv)?), session.classes())?;
    if let Some(dir) = &job.composites_dir {
        std::fs::create_dir_all(dir)?;
    }
    let stem = job
        .video
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());

    // --- Main Processing Loop ---
    let mut frame = Mat::default();
    let mut index = 0usize;
    loop {
        match cap.read(&mut frame) {
            Ok(true) if !frame.empty() => {}
            Ok(_) => break,
            Err(e) => {
                warn!(frame = index, "error reading frame, stopping: {e}");
                break;
            }
        }

        // OpenCV decodes to BGR; the session works on RGB.
        let mut rgb = Mat::default();
        imgproc::cvt_color(&frame, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;
        let image = RgbImage::from_raw(rgb.cols() as u32, rgb.rows() as u32, rgb.data_bytes()?.to_vec())
            .context("decoded frame does not match its dimensions")?;

        let report = session.process_frame(&image, index as f64 / fps)?;
        if let Some(record) = &report.kinematic {
            kinematic_writer.write_record(record)?;
        }
        if let Some(probabilities) = &report.behavior {
            behavior_writer.write_row(probabilities)?;
        }
        if let (Some(dir), Some(composite)) = (&job.composites_dir, &report.composite) {
            let path = dir.join(format!("{stem}_{:06}.png", composite.center_index));
            image_helper::save_png(&path, &composite.image)?;
        }
        index += 1;
    }
    kinematic_writer.finish()?;
    behavior_writer.finish()?;

    // --- Alignment and Summary ---
    let output = session.finish()?;
    export::write_merged_csv(BufWriter::new(File::create(&paths.merged_csv)?), &output.table)?;
    export::write_summary_json(BufWriter::new(File::create(&paths.summary_json)?), &output.summary)?;
    if let Some(heatmap) = &output.heatmap {
        export::write_heatmap_json(BufWriter::new(File::create(&paths.heatmap_json)?), heatmap)?;
    }
    info!(
        video = %job.video.display(),
        merged = %paths.merged_csv.display(),
        "outputs written"
    );
    Ok(output.summary)
}

/// `<merged stem>_heatmap.json` next to the merged table.
fn merged_heatmap_path(merged_csv: &Path) -> PathBuf {
    let stem = merged_csv
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "merged".to_string());
    merged_csv.with_file_name(format!("{stem}_heatmap.json"))
}

/// Re-runs alignment from previously written kinematic and behavior CSVs.
/// The video is not read, so the summary leaves `frames_total` unset. The
/// heatmap needs the arena radius and is only written when one is given.
fn merge(static_csv: &Path, behavior_csv: &Path, merged_csv: &Path, radius_px: Option<f64>) -> anyhow::Result<()> {
    let records = export::read_kinematic_csv(BufReader::new(
        File::open(static_csv).with_context(|| format!("opening {}", static_csv.display()))?,
    ))?;
    let (classes, rows) = export::read_behavior_csv(BufReader::new(
        File::open(behavior_csv).with_context(|| format!("opening {}", behavior_csv.display()))?,
    ))?;

    let config = FieldConfig::default();
    let aligner = StreamAligner::new(config.window_size, config.block_size, config.kalman)?
        .with_speed_smoothing(config.speed_smoothing_window, config.speed_smoothing_order)?;
    let table = aligner.align(classes, records, &rows)?;
    let summary = SessionSummary::from_table(&table, None);

    export::write_merged_csv(BufWriter::new(File::create(merged_csv)?), &table)?;
    let summary_path = merged_csv.with_extension("json");
    export::write_summary_json(BufWriter::new(File::create(&summary_path)?), &summary)?;
    if let Some(radius_px) = radius_px {
        let heatmap = ArenaHeatmap::from_table(&table, radius_px, config.heatmap_bins)?;
        export::write_heatmap_json(BufWriter::new(File::create(merged_heatmap_path(merged_csv))?), &heatmap)?;
    }
    info!(
        rows = table.records.len(),
        merged = %merged_csv.display(),
        summary = %summary_path.display(),
        "merge complete"
    );
    Ok(())
}
