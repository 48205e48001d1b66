//! Batch import of activity files into a [`StreamStore`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::source::{decode_bytes, SourceFormat};
use crate::store::{stream_records_from_track, StreamRecord, StreamStore};
use crate::{PipelineParams, Result, TrackError};

const PROGRESS_EVERY: usize = 10;
/// Files decoded in parallel before their rows are written.
const DECODE_CHUNK: usize = 64;

#[derive(Clone, Debug)]
pub struct ImportOptions {
    pub skip_existing: bool,
    pub batch_size: usize,
    pub params: PipelineParams,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            skip_existing: true,
            batch_size: 1000,
            params: PipelineParams::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
    pub errors: usize,
    pub total_records: usize,
}

/// An importable file. `activity_id` is `None` when the name does not start
/// with an integer id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivityFile {
    pub path: PathBuf,
    pub activity_id: Option<i64>,
    pub format: SourceFormat,
}

const EXTENSIONS: [&str; 4] = [".tcx", ".tcx.gz", ".fit", ".fit.gz"];

/// List `*.tcx`, `*.tcx.gz`, `*.fit` and `*.fit.gz` files directly under
/// `dir`, sorted by path.
pub fn discover_activity_files(dir: &Path) -> Result<Vec<ActivityFile>> {
    let io_err = |source: io::Error| TrackError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if !entry.file_type().map_err(io_err)?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let lower = name.to_ascii_lowercase();
        if !EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
            continue;
        }
        let Some(format) = SourceFormat::from_filename(&lower) else {
            continue;
        };
        files.push(ActivityFile {
            path: entry.path(),
            activity_id: activity_id_from_name(&name),
            format,
        });
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

/// `"12345.fit.gz"` → `12345`.
pub fn activity_id_from_name(name: &str) -> Option<i64> {
    name.split('.').next()?.parse().ok()
}

enum Pending {
    Decode(i64),
    Skipped,
    Failed,
}

/// Import every activity file under `dir`.
///
/// Files are decoded in parallel; rows are written sequentially in batches of
/// `options.batch_size`. A file that cannot be read, decodes to nothing or
/// fails to store is counted as an error and the run continues. When
/// `skip_existing` is off, existing rows for an activity are replaced.
pub fn import_activity_streams<S>(
    dir: &Path,
    store: &mut S,
    options: &ImportOptions,
) -> Result<ImportSummary>
where
    S: StreamStore + ?Sized,
{
    let files = discover_activity_files(dir)?;
    let tcx = files.iter().filter(|f| f.format == SourceFormat::Tcx).count();
    info!(
        "Found {} TCX files and {} FIT files in {}",
        tcx,
        files.len() - tcx,
        dir.display()
    );

    let total = files.len();
    let mut summary = ImportSummary::default();
    let mut processed = 0usize;

    for chunk in files.chunks(DECODE_CHUNK) {
        let pending: Vec<Pending> = chunk
            .iter()
            .map(|file| plan_file(file, &*store, options))
            .collect();

        let decoded: Vec<Option<Result<Vec<StreamRecord>>>> = chunk
            .par_iter()
            .zip(pending.par_iter())
            .map(|(file, plan)| match plan {
                Pending::Decode(id) => Some(read_stream_records(file, *id, &options.params)),
                _ => None,
            })
            .collect();

        for ((file, plan), decoded) in chunk.iter().zip(&pending).zip(decoded) {
            match (plan, decoded) {
                (Pending::Skipped, _) => summary.skipped += 1,
                (Pending::Decode(id), Some(Ok(records))) => {
                    // an earlier file in this run may already hold the activity
                    let exists = if options.skip_existing {
                        store.activity_has_streams(*id)
                    } else {
                        Ok(false)
                    };
                    let written = match exists {
                        Ok(true) => {
                            debug!("Activity {} already imported from another file", id);
                            summary.skipped += 1;
                            None
                        }
                        Ok(false) => Some(write_records(store, *id, &records, options)),
                        Err(err) => Some(Err(err)),
                    };
                    match written {
                        Some(Ok(())) => {
                            summary.imported += 1;
                            summary.total_records += records.len();
                        }
                        Some(Err(err)) => {
                            warn!("Failed to store {}: {}", file.path.display(), err);
                            summary.errors += 1;
                        }
                        None => {}
                    }
                }
                (Pending::Decode(_), Some(Err(err))) => {
                    warn!("Failed to import {}: {}", file.path.display(), err);
                    summary.errors += 1;
                }
                _ => summary.errors += 1,
            }

            processed += 1;
            if processed % PROGRESS_EVERY == 0 {
                info!(
                    "Processed {}/{} files (imported: {}, skipped: {}, errors: {})",
                    processed, total, summary.imported, summary.skipped, summary.errors
                );
            }
        }
    }

    info!(
        "Import complete: {} activities ({} records), {} skipped, {} errors",
        summary.imported, summary.total_records, summary.skipped, summary.errors
    );
    Ok(summary)
}

fn plan_file<S>(file: &ActivityFile, store: &S, options: &ImportOptions) -> Pending
where
    S: StreamStore + ?Sized,
{
    let Some(id) = file.activity_id else {
        warn!("No activity id in file name {}", file.path.display());
        return Pending::Failed;
    };
    if !options.skip_existing {
        return Pending::Decode(id);
    }
    match store.activity_has_streams(id) {
        Ok(true) => {
            debug!("Activity {} already has streams; skipping", id);
            Pending::Skipped
        }
        Ok(false) => Pending::Decode(id),
        Err(err) => {
            warn!("Failed to check streams for activity {}: {}", id, err);
            Pending::Failed
        }
    }
}

fn read_stream_records(
    file: &ActivityFile,
    activity_id: i64,
    params: &PipelineParams,
) -> Result<Vec<StreamRecord>> {
    let bytes = fs::read(&file.path).map_err(|source| TrackError::Io {
        path: file.path.clone(),
        source,
    })?;
    let decoded = decode_bytes(file.format, &bytes)?;
    if let Some(diag) = &decoded.diagnostic {
        warn!("Partial decode of {}: {}", file.path.display(), diag);
    }
    if decoded.is_empty() {
        return Err(TrackError::NoData);
    }
    Ok(stream_records_from_track(activity_id, &decoded, params))
}

/// Write one activity's rows. A failed batch removes whatever this activity
/// already committed, so no partial activity is left behind.
fn write_records<S>(
    store: &mut S,
    activity_id: i64,
    records: &[StreamRecord],
    options: &ImportOptions,
) -> Result<()>
where
    S: StreamStore + ?Sized,
{
    if !options.skip_existing {
        store.delete_activity_streams(activity_id)?;
    }
    for batch in records.chunks(options.batch_size.max(1)) {
        if let Err(err) = store.insert_stream_batch(batch) {
            if let Err(cleanup) = store.delete_activity_streams(activity_id) {
                warn!(
                    "Failed to remove partial streams for activity {}: {}",
                    activity_id, cleanup
                );
            }
            return Err(err);
        }
    }
    Ok(())
}
