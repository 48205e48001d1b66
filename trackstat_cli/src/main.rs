use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueHint};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use trackstat::{
    format_pace, import_activity_streams, load_from_store, ActivityLocator, HrZones,
    ImportOptions, LoadedTrack, PipelineParams, Split, SqliteStreamStore, StreamStore,
    TrackPoint,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Activity track import and analysis CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON file overriding pipeline parameters
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Heart-rate zone upper bounds (comma separated bpm, e.g. 145,164,174,188)
    #[arg(long, global = true)]
    zones: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import TCX/FIT activity files into the stream database
    Import(ImportArgs),
    /// Decode one activity file and print its derived metrics
    Analyze(AnalyzeArgs),
    /// Print derived metrics for an activity already in the database
    Show(ShowArgs),
}

#[derive(Parser, Debug)]
struct ImportArgs {
    /// SQLite database path
    #[arg(default_value = "data/strava.db", value_hint = ValueHint::FilePath)]
    db: PathBuf,

    /// Directory holding <id>.tcx[.gz] / <id>.fit[.gz] files
    #[arg(long, default_value = "data/activities", value_hint = ValueHint::DirPath)]
    activities_dir: PathBuf,

    /// Re-import activities that already have stream data
    #[arg(long, action = ArgAction::SetTrue)]
    no_skip_existing: bool,
}

#[derive(Parser, Debug)]
struct AnalyzeArgs {
    /// TCX/FIT file, optionally gzip-compressed
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Write the derived per-point table as CSV
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,

    /// Write the splits table as CSV
    #[arg(long, value_hint = ValueHint::FilePath)]
    splits_output: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct ShowArgs {
    activity_id: i64,

    /// SQLite database path
    #[arg(long, default_value = "data/strava.db", value_hint = ValueHint::FilePath)]
    db: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    let params = load_params(cli.config.as_deref(), cli.zones.as_deref())?;
    match cli.command {
        Command::Import(args) => handle_import(args, params),
        Command::Analyze(args) => handle_analyze(args, &params),
        Command::Show(args) => handle_show(args, &params),
    }
}

fn load_params(config: Option<&Path>, zones: Option<&str>) -> Result<PipelineParams> {
    let mut params = match config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str::<PipelineParams>(&text)
                .with_context(|| format!("invalid config {}", path.display()))?
        }
        None => PipelineParams::default(),
    };
    if let Some(zones) = zones {
        params.hr_zones = zones
            .parse::<HrZones>()
            .with_context(|| format!("invalid --zones '{zones}'"))?;
    }
    params.validate().context("invalid pipeline parameters")?;
    debug!("Pipeline parameters: {:?}", params);
    Ok(params)
}

fn handle_import(args: ImportArgs, params: PipelineParams) -> Result<()> {
    if let Some(parent) = args.db.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut store = SqliteStreamStore::open(&args.db)
        .with_context(|| format!("failed to open {}", args.db.display()))?;

    let options = ImportOptions {
        skip_existing: !args.no_skip_existing,
        params,
        ..ImportOptions::default()
    };
    let t_import = Instant::now();
    let summary = import_activity_streams(&args.activities_dir, &mut store, &options)
        .with_context(|| format!("import from {} failed", args.activities_dir.display()))?;
    info!("Import stage: {:.1} s", t_import.elapsed().as_secs_f64());

    let stats = store.stats()?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "Imported: {} activities ({} records)", summary.imported, summary.total_records)?;
    writeln!(out, "Skipped (already imported): {}", summary.skipped)?;
    if summary.errors > 0 {
        writeln!(out, "Errors: {} files", summary.errors)?;
    }
    writeln!(out, "Activities with streams: {}", stats.activities_with_streams)?;
    writeln!(out, "Total stream records: {}", stats.total_stream_records)?;
    Ok(())
}

fn handle_analyze(args: AnalyzeArgs, params: &PipelineParams) -> Result<()> {
    let dir = args
        .input
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = args
        .input
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("invalid input path {}", args.input.display()))?;

    let t_parse = Instant::now();
    let track = ActivityLocator::new(dir)
        .load(name, params)
        .with_context(|| format!("failed to load {}", args.input.display()))?
        .ok_or_else(|| anyhow!("file not found: {}", args.input.display()))?;
    debug!(
        "Parse stage: {:.1} ms ({} points)",
        t_parse.elapsed().as_secs_f64() * 1000.0,
        track.points.len()
    );
    if let Some(diag) = &track.diagnostic {
        warn!("Track may be incomplete: {}", diag);
    }

    let splits = track.splits(params);
    print_report(&track, &splits, params)?;

    if let Some(path) = args.output.as_ref() {
        write_points_csv(&track.points, path)?;
        info!("Wrote points CSV: {}", path.display());
    }
    if let Some(path) = args.splits_output.as_ref() {
        write_splits_csv(&splits, path)?;
        info!("Wrote splits CSV: {}", path.display());
    }
    Ok(())
}

fn handle_show(args: ShowArgs, params: &PipelineParams) -> Result<()> {
    if !args.db.exists() {
        bail!("database not found: {}", args.db.display());
    }
    let store = SqliteStreamStore::open(&args.db)
        .with_context(|| format!("failed to open {}", args.db.display()))?;
    let track = load_from_store(&store, args.activity_id, params)?
        .ok_or_else(|| anyhow!("no stored streams for activity {}", args.activity_id))?;
    let splits = track.splits(params);
    print_report(&track, &splits, params)
}

fn print_report(track: &LoadedTrack, splits: &[Split], params: &PipelineParams) -> Result<()> {
    let stdout = io::stdout();
    write_report(&mut stdout.lock(), track, splits, params)
}

fn write_report<W: Write>(
    out: &mut W,
    track: &LoadedTrack,
    splits: &[Split],
    params: &PipelineParams,
) -> Result<()> {
    let summary = track.summary();

    writeln!(out, "Source: {} ({} points)", track.format, summary.points)?;
    writeln!(out, "Distance: {:.2} km", summary.total_distance_m / 1000.0)?;
    writeln!(out, "Elapsed: {}", format_duration(summary.total_elapsed_s))?;
    writeln!(out, "Moving: {}", format_duration(summary.moving_time_s))?;
    writeln!(out, "Avg pace: {} /km", format_pace(summary.avg_pace_min_per_km))?;
    writeln!(
        out,
        "Heart rate: avg {} / max {}",
        format_opt(summary.avg_heart_rate, 0),
        format_opt(summary.max_heart_rate, 0)
    )?;
    writeln!(out, "Elevation gain: {:.0} m", summary.elevation_gain_m)?;

    if !splits.is_empty() {
        writeln!(out, "\nSplits")?;
        writeln!(
            out,
            "{:>4} {:>8} {:>9} {:>7} {:>6} {:>6}",
            "#", "km", "time", "pace", "hr", "cad"
        )?;
        for s in splits {
            writeln!(
                out,
                "{:>4} {:>8.3} {:>9} {:>7} {:>6} {:>6}",
                s.index,
                s.covered_distance_km,
                format_duration(s.elapsed_s),
                format_pace(Some(s.pace_min_per_km)),
                format_opt(s.avg_heart_rate, 0),
                format_opt(s.avg_cadence, 0)
            )?;
        }
    }

    if !track.laps.is_empty() {
        writeln!(out, "\nLaps")?;
        writeln!(
            out,
            "{:>4} {:>8} {:>9} {:>7} {:>6} {:>6}",
            "#", "km", "time", "pace", "hr", "cad"
        )?;
        for lap in &track.laps {
            writeln!(
                out,
                "{:>4} {:>8.3} {:>9} {:>7} {:>6} {:>6}",
                lap.index,
                lap.distance_km,
                lap.elapsed_s.map_or_else(|| "-".to_string(), format_duration),
                format_pace(Some(lap.pace_min_per_km)),
                format_opt(lap.avg_heart_rate, 0),
                format_opt(lap.avg_cadence, 0)
            )?;
        }
    }

    let zones = track.zones(params);
    if zones.iter().any(|z| z.seconds > 0.0) {
        writeln!(out, "\nHeart-rate zones")?;
        for z in &zones {
            writeln!(
                out,
                "{:<7} {:>9} {:>5.1}%",
                z.zone.to_string(),
                format_duration(z.seconds),
                z.percent
            )?;
        }
    }
    Ok(())
}

fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{}:{:02}", m, s)
    }
}

fn format_opt(value: Option<f64>, decimals: usize) -> String {
    value
        .map(|v| format!("{:.*}", decimals, v))
        .unwrap_or_else(|| "-".into())
}

fn csv_opt(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.3}", v))
        .unwrap_or_else(|| "".into())
}

fn write_points_csv(points: &[TrackPoint], path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    write_point_rows(points, &mut writer)
}

fn write_point_rows<W: Write>(points: &[TrackPoint], writer: &mut csv::Writer<W>) -> Result<()> {
    writer.write_record([
        "time",
        "elapsed_s",
        "distance_m",
        "altitude_m",
        "altitude_smoothed_m",
        "heart_rate",
        "cadence",
        "power",
        "latitude",
        "longitude",
        "speed_m_s",
        "speed_smoothed_m_s",
        "is_moving",
        "grade",
        "gap_factor",
        "pace_min_per_km",
        "gap_pace_min_per_km",
        "elevation_gain_step_m",
    ])?;
    for p in points {
        writer.write_record([
            p.time.to_rfc3339(),
            format!("{:.3}", p.elapsed_s),
            csv_opt(p.distance),
            csv_opt(p.altitude),
            csv_opt(p.altitude_smoothed),
            csv_opt(p.heart_rate),
            csv_opt(p.cadence),
            csv_opt(p.power),
            p.latitude.map(|v| format!("{:.7}", v)).unwrap_or_default(),
            p.longitude.map(|v| format!("{:.7}", v)).unwrap_or_default(),
            csv_opt(p.speed_m_s),
            csv_opt(p.speed_smoothed),
            p.is_moving.to_string(),
            format!("{:.4}", p.grade),
            format!("{:.4}", p.gap_factor),
            csv_opt(p.pace_decimal),
            csv_opt(p.gap_pace_decimal),
            format!("{:.3}", p.elevation_gain_step),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_splits_csv(splits: &[Split], path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    writer.write_record([
        "split",
        "covered_distance_km",
        "elapsed_s",
        "pace_min_per_km",
        "pace",
        "avg_heart_rate",
        "avg_cadence",
    ])?;
    for s in splits {
        writer.write_record([
            s.index.to_string(),
            format!("{:.3}", s.covered_distance_km),
            format!("{:.1}", s.elapsed_s),
            format!("{:.3}", s.pace_min_per_km),
            format_pace(Some(s.pace_min_per_km)),
            csv_opt(s.avg_heart_rate),
            csv_opt(s.avg_cadence),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
