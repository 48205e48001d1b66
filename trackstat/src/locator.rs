//! Locating activity files and turning them (or stored streams) into
//! derived tracks.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::metrics::calculate_metrics;
use crate::normalize::{create_track, RawStreams};
use crate::source::{decode_bytes, DecodedTrack, SourceFormat};
use crate::splits::{calculate_splits, Split};
use crate::store::StreamStore;
use crate::summary::{summarize, TrackSummary};
use crate::zones::{zone_distribution, ZoneTime};
use crate::{Lap, PipelineParams, Result, TrackError, TrackPoint};

/// A normalized track with derived metrics, ready for reporting.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadedTrack {
    pub format: SourceFormat,
    pub points: Vec<TrackPoint>,
    pub laps: Vec<Lap>,
    pub diagnostic: Option<String>,
}

impl LoadedTrack {
    pub fn from_decoded(decoded: DecodedTrack, params: &PipelineParams) -> Self {
        let streams = RawStreams::from_samples(&decoded.samples);
        Self {
            format: decoded.format,
            points: derive_points(&streams, params),
            laps: decoded.laps,
            diagnostic: decoded.diagnostic,
        }
    }

    pub fn summary(&self) -> TrackSummary {
        summarize(&self.points)
    }

    pub fn splits(&self, params: &PipelineParams) -> Vec<Split> {
        calculate_splits(&self.points, params)
    }

    pub fn zones(&self, params: &PipelineParams) -> Vec<ZoneTime> {
        zone_distribution(&self.points, &params.hr_zones)
    }
}

/// Normalize then derive metrics.
pub fn derive_points(streams: &RawStreams, params: &PipelineParams) -> Vec<TrackPoint> {
    let mut points = create_track(streams);
    calculate_metrics(&mut points, params);
    points
}

/// Resolves activity filenames under a fixed directory.
#[derive(Clone, Debug)]
pub struct ActivityLocator {
    root: PathBuf,
}

impl ActivityLocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Accepts names with or without a leading `activities/` component, as
    /// stored on activity summaries.
    pub fn resolve(&self, filename: &str) -> PathBuf {
        let rel = Path::new(filename);
        let rel = match (rel.strip_prefix("activities"), self.root.file_name()) {
            (Ok(stripped), Some(name)) if name == "activities" => stripped,
            _ => rel,
        };
        self.root.join(rel)
    }

    /// Decode and derive one activity. A missing file is `Ok(None)`.
    pub fn load(&self, filename: &str, params: &PipelineParams) -> Result<Option<LoadedTrack>> {
        let path = self.resolve(filename);
        let format = SourceFormat::from_filename(filename)
            .ok_or_else(|| TrackError::UnsupportedFormat(filename.to_string()))?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("Activity file not found: {}", path.display());
                return Ok(None);
            }
            Err(source) => return Err(TrackError::Io { path, source }),
        };
        let decoded = decode_bytes(format, &bytes)?;
        if let Some(diag) = &decoded.diagnostic {
            warn!("Partial decode of {}: {}", path.display(), diag);
        }
        Ok(Some(LoadedTrack::from_decoded(decoded, params)))
    }
}

/// Rebuild a derived track from previously imported stream rows, skipping
/// file parsing. `Ok(None)` when the activity has no stored rows.
pub fn load_from_store(
    store: &dyn StreamStore,
    activity_id: i64,
    params: &PipelineParams,
) -> Result<Option<LoadedTrack>> {
    let records = store.get_activity_stream(activity_id)?;
    let Some(first) = records.first() else {
        return Ok(None);
    };
    let streams = RawStreams::from_stream_records(&records);
    Ok(Some(LoadedTrack {
        format: first.source_type,
        points: derive_points(&streams, params),
        laps: Vec::new(),
        diagnostic: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::testdata::sample_fit;
    use crate::store::{stream_records_from_track, MemoryStreamStore};

    #[test]
    fn test_resolve() {
        let locator = ActivityLocator::new("/data/activities");
        assert_eq!(
            locator.resolve("activities/123.fit.gz"),
            PathBuf::from("/data/activities/123.fit.gz")
        );
        assert_eq!(locator.resolve("123.tcx"), PathBuf::from("/data/activities/123.tcx"));

        let other = ActivityLocator::new("/data/raw");
        assert_eq!(
            other.resolve("activities/1.fit"),
            PathBuf::from("/data/raw/activities/1.fit")
        );
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let locator = ActivityLocator::new(dir.path());
        let loaded = locator.load("404.fit", &PipelineParams::default()).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let locator = ActivityLocator::new(dir.path());
        assert!(matches!(
            locator.load("1.gpx", &PipelineParams::default()),
            Err(TrackError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_load_fit_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("42.fit"), sample_fit()).unwrap();
        let locator = ActivityLocator::new(dir.path());
        let track = locator
            .load("42.fit", &PipelineParams::default())
            .unwrap()
            .unwrap();
        assert_eq!(track.format, SourceFormat::Fit);
        assert_eq!(track.points.len(), 2);
        assert_eq!(track.laps.len(), 1);
        assert_eq!(track.points[1].cadence, Some(182.0));
        assert!(track.points[1].speed_m_s.is_some());
        assert!(track.diagnostic.is_none());
    }

    #[test]
    fn test_store_and_file_paths_agree() {
        let params = PipelineParams::default();
        let decoded = decode_bytes(SourceFormat::Fit, &sample_fit()).unwrap();
        let mut store = MemoryStreamStore::new();
        store
            .insert_stream_batch(&stream_records_from_track(42, &decoded, &params))
            .unwrap();

        let from_file = LoadedTrack::from_decoded(decoded, &params);
        let from_store = load_from_store(&store, 42, &params).unwrap().unwrap();
        assert_eq!(from_store.format, SourceFormat::Fit);
        assert_eq!(from_store.points, from_file.points);
        assert!(load_from_store(&store, 7, &params).unwrap().is_none());
    }
}
