//! Activity track decoding and training-metric derivation.
//!
//! The pipeline is: a format reader ([`tcx`], [`fit`]) decodes a file into
//! [`RawSample`]s and device [`Lap`]s, the [`normalize`] stage turns the raw
//! columns into an ordered [`TrackPoint`] table, [`metrics`] appends the
//! derived columns (speed, grade, GAP, pace) and [`splits`]/[`zones`]
//! aggregate the result. [`store`] persists per-sample stream records so a
//! previously imported track can be rebuilt without re-parsing the file.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod cache;
pub mod fit;
pub mod import;
pub mod locator;
pub mod metrics;
pub mod normalize;
pub mod source;
pub mod splits;
pub mod store;
pub mod summary;
pub mod tcx;
pub mod zones;

pub use cache::{CacheKey, SourceKey, TrackCache};
pub use import::{discover_activity_files, import_activity_streams, ImportOptions, ImportSummary};
pub use locator::{load_from_store, ActivityLocator, LoadedTrack};
pub use metrics::calculate_metrics;
pub use normalize::{create_track, RawStreams};
pub use source::{decode_bytes, reader_for, DecodedTrack, SourceFormat, TrackReader};
pub use splits::{calculate_splits, Split};
pub use store::{MemoryStreamStore, SqliteStreamStore, StoreStats, StreamRecord, StreamStore};
pub use summary::{format_pace, summarize, TrackSummary};
pub use zones::{zone_distribution, HrZone, HrZones, ZoneTime};

#[derive(Error, Debug)]
pub enum TrackError {
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to parse FIT data: {0}")]
    FitParse(String),
    #[error("failed to parse TCX data: {0}")]
    TcxParse(String),
    #[error("failed to decompress gzip data: {0}")]
    Decompress(String),
    #[error("failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("stream store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("no usable track data")]
    NoData,
}

pub type Result<T> = std::result::Result<T, TrackError>;

/// Factor converting FIT semicircles to degrees (2^31 semicircles = 180°).
pub const SEMICIRCLE_TO_DEGREES: f64 = 180.0 / 2_147_483_648.0;

pub fn semicircles_to_degrees(value: f64) -> f64 {
    value * SEMICIRCLE_TO_DEGREES
}

/// Round to the nearest integer; `None` outside `0..=u16::MAX`.
pub(crate) fn to_u16(value: f64) -> Option<u16> {
    let rounded = value.round();
    if (0.0..=u16::MAX as f64).contains(&rounded) {
        Some(rounded as u16)
    } else {
        None
    }
}

/// A timestamp as it arrives from a source, before the normalizer resolves it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RawTime {
    Instant(DateTime<Utc>),
    Text(String),
    Missing,
}

impl RawTime {
    pub fn resolve(&self) -> Option<DateTime<Utc>> {
        match self {
            RawTime::Instant(ts) => Some(*ts),
            RawTime::Text(text) => parse_timestamp(text),
            RawTime::Missing => None,
        }
    }
}

impl From<DateTime<Utc>> for RawTime {
    fn from(value: DateTime<Utc>) -> Self {
        RawTime::Instant(value)
    }
}

impl From<&str> for RawTime {
    fn from(value: &str) -> Self {
        RawTime::Text(value.to_string())
    }
}

/// Parse RFC 3339 or a bare `YYYY-MM-DD HH:MM:SS[.f]` (taken as UTC).
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// One decoded record from a source file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub timestamp: DateTime<Utc>,
    pub heart_rate: Option<u16>,
    pub altitude: Option<f64>,
    pub distance: Option<f64>,
    pub cadence: Option<u16>,
    pub power: Option<u16>,
    pub speed: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub source: SourceFormat,
}

impl RawSample {
    pub fn new(timestamp: DateTime<Utc>, source: SourceFormat) -> Self {
        Self {
            timestamp,
            heart_rate: None,
            altitude: None,
            distance: None,
            cadence: None,
            power: None,
            speed: None,
            latitude: None,
            longitude: None,
            source,
        }
    }
}

/// A device-recorded lap.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lap {
    pub index: usize,
    pub start_time: Option<DateTime<Utc>>,
    pub distance_km: f64,
    pub elapsed_s: Option<f64>,
    pub pace_min_per_km: f64,
    pub avg_heart_rate: Option<f64>,
    pub avg_cadence: Option<f64>,
}

impl Lap {
    pub fn new(
        index: usize,
        start_time: Option<DateTime<Utc>>,
        distance_m: f64,
        elapsed_s: Option<f64>,
        avg_heart_rate: Option<f64>,
        avg_cadence: Option<f64>,
    ) -> Self {
        let distance_km = distance_m / 1000.0;
        Self {
            index,
            start_time,
            distance_km,
            elapsed_s,
            pace_min_per_km: elapsed_s.map_or(0.0, |t| pace_from_elapsed(t, distance_km)),
            avg_heart_rate,
            avg_cadence,
        }
    }
}

/// Minutes per km for a segment, 0 when no distance was covered.
pub(crate) fn pace_from_elapsed(elapsed_s: f64, distance_km: f64) -> f64 {
    if distance_km > 0.0 {
        (elapsed_s / distance_km) / 60.0
    } else {
        0.0
    }
}

/// One row of the normalized track. The derived columns stay at their
/// neutral values until [`calculate_metrics`] fills them in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub time: DateTime<Utc>,
    pub elapsed_s: f64,
    pub heart_rate: Option<f64>,
    pub altitude: Option<f64>,
    pub distance: Option<f64>,
    pub cadence: Option<f64>,
    pub power: Option<f64>,
    pub speed: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude_smoothed: Option<f64>,
    pub dist_diff: Option<f64>,
    pub time_diff: Option<f64>,
    pub alt_diff: Option<f64>,
    pub speed_m_s: Option<f64>,
    pub is_moving: bool,
    pub speed_smoothed: Option<f64>,
    pub grade: f64,
    pub gap_factor: f64,
    pub speed_gap: Option<f64>,
    pub pace_decimal: Option<f64>,
    pub gap_pace_decimal: Option<f64>,
    pub elevation_gain_step: f64,
}

impl TrackPoint {
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            time,
            elapsed_s: 0.0,
            heart_rate: None,
            altitude: None,
            distance: None,
            cadence: None,
            power: None,
            speed: None,
            latitude: None,
            longitude: None,
            altitude_smoothed: None,
            dist_diff: None,
            time_diff: None,
            alt_diff: None,
            speed_m_s: None,
            is_moving: false,
            speed_smoothed: None,
            grade: 0.0,
            gap_factor: 1.0,
            speed_gap: None,
            pace_decimal: None,
            gap_pace_decimal: None,
            elevation_gain_step: 0.0,
        }
    }
}

/// Tunables for the metrics, splits and zone stages.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineParams {
    pub altitude_window: usize,
    pub speed_window: usize,
    pub moving_speed_mps: f64,
    pub pace_floor_mps: f64,
    pub grade_min_distance_m: f64,
    pub grade_clip: f64,
    pub gap_uphill_coeff: f64,
    pub gap_downhill_coeff: f64,
    pub split_distance_m: f64,
    pub hr_zones: HrZones,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            altitude_window: 15,
            speed_window: 10,
            moving_speed_mps: 0.5,
            pace_floor_mps: 0.1,
            grade_min_distance_m: 1.0,
            grade_clip: 0.4,
            gap_uphill_coeff: 9.0,
            gap_downhill_coeff: 4.0,
            split_distance_m: 1000.0,
            hr_zones: HrZones::default(),
        }
    }
}

impl PipelineParams {
    pub fn validate(&self) -> Result<()> {
        if self.altitude_window == 0 || self.speed_window == 0 {
            return Err(TrackError::InvalidParameter(
                "smoothing windows must be at least one sample".into(),
            ));
        }
        if !(self.split_distance_m > 0.0) {
            return Err(TrackError::InvalidParameter(format!(
                "split distance must be positive, got {}",
                self.split_distance_m
            )));
        }
        if !(self.grade_clip >= 0.0) {
            return Err(TrackError::InvalidParameter(format!(
                "grade clip must be non-negative, got {}",
                self.grade_clip
            )));
        }
        self.hr_zones.validate()
    }

    /// Grade-adjusted-pace multiplier for a clipped grade.
    pub fn gap_factor(&self, grade: f64) -> f64 {
        if grade > 0.0 {
            1.0 + self.gap_uphill_coeff * grade
        } else {
            1.0 + self.gap_downhill_coeff * grade
        }
    }

    /// Minutes per km, undefined at or below the pace floor.
    pub fn pace_from_speed(&self, speed_mps: Option<f64>) -> Option<f64> {
        match speed_mps {
            Some(speed) if speed > self.pace_floor_mps => Some((1000.0 / speed) / 60.0),
            _ => None,
        }
    }
}
