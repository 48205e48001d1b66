//! Persisted per-sample stream rows and the stores that hold them.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::SecondsFormat;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::metrics::trailing_mean;
use crate::normalize::seconds_between;
use crate::source::{DecodedTrack, SourceFormat};
use crate::{PipelineParams, Result};

const SCHEMA: &str = include_str!("schema.sql");

/// One stored sample. `timestamp` is RFC 3339 text so stored rows sort
/// chronologically as strings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub activity_id: i64,
    pub timestamp: String,
    pub elapsed_seconds: f64,
    pub heart_rate: Option<u16>,
    pub altitude: Option<f64>,
    pub distance: Option<f64>,
    pub speed: Option<f64>,
    pub cadence: Option<u16>,
    pub power: Option<u16>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub pace: Option<f64>,
    pub source_type: SourceFormat,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub activities_with_streams: usize,
    pub total_stream_records: usize,
}

/// Build stream rows for one decoded file.
///
/// Pace comes from the device speed when present, otherwise from a trailing
/// mean of distance/time speed between consecutive samples.
pub fn stream_records_from_track(
    activity_id: i64,
    track: &DecodedTrack,
    params: &PipelineParams,
) -> Vec<StreamRecord> {
    let Some(first) = track.samples.first() else {
        return Vec::new();
    };
    let t0 = first.timestamp;

    let mut derived = Vec::with_capacity(track.samples.len());
    derived.push(None);
    for w in track.samples.windows(2) {
        let dt = seconds_between(w[0].timestamp, w[1].timestamp);
        let speed = match (w[0].distance, w[1].distance) {
            (Some(a), Some(b)) if dt > 0.0 => Some((b - a) / dt),
            _ => None,
        };
        derived.push(speed);
    }
    let derived = trailing_mean(&derived, params.speed_window);

    track
        .samples
        .iter()
        .zip(derived)
        .map(|(s, derived_speed)| StreamRecord {
            activity_id,
            timestamp: s.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            elapsed_seconds: seconds_between(t0, s.timestamp),
            heart_rate: s.heart_rate,
            altitude: s.altitude,
            distance: s.distance,
            speed: s.speed,
            cadence: s.cadence,
            power: s.power,
            latitude: s.latitude,
            longitude: s.longitude,
            pace: params.pace_from_speed(s.speed.or(derived_speed)),
            source_type: track.format,
        })
        .collect()
}

pub trait StreamStore {
    /// Append rows; returns how many were written.
    fn insert_stream_batch(&mut self, records: &[StreamRecord]) -> Result<usize>;

    /// All rows for an activity in timestamp order.
    fn get_activity_stream(&self, activity_id: i64) -> Result<Vec<StreamRecord>>;

    fn activity_has_streams(&self, activity_id: i64) -> Result<bool>;

    /// Returns how many rows were removed.
    fn delete_activity_streams(&mut self, activity_id: i64) -> Result<usize>;

    fn stats(&self) -> Result<StoreStats>;
}

#[derive(Debug, Default)]
pub struct MemoryStreamStore {
    streams: BTreeMap<i64, Vec<StreamRecord>>,
}

impl MemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamStore for MemoryStreamStore {
    fn insert_stream_batch(&mut self, records: &[StreamRecord]) -> Result<usize> {
        for r in records {
            self.streams.entry(r.activity_id).or_default().push(r.clone());
        }
        Ok(records.len())
    }

    fn get_activity_stream(&self, activity_id: i64) -> Result<Vec<StreamRecord>> {
        let mut rows = self.streams.get(&activity_id).cloned().unwrap_or_default();
        rows.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(rows)
    }

    fn activity_has_streams(&self, activity_id: i64) -> Result<bool> {
        Ok(self.streams.get(&activity_id).is_some_and(|rows| !rows.is_empty()))
    }

    fn delete_activity_streams(&mut self, activity_id: i64) -> Result<usize> {
        Ok(self.streams.remove(&activity_id).map_or(0, |rows| rows.len()))
    }

    fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            activities_with_streams: self.streams.values().filter(|r| !r.is_empty()).count(),
            total_stream_records: self.streams.values().map(Vec::len).sum(),
        })
    }
}

/// SQLite-backed store. Each batch is written in one transaction.
#[derive(Debug)]
pub struct SqliteStreamStore {
    conn: Connection,
}

impl SqliteStreamStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Opening stream store at {}", path.display());
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }
}

impl StreamStore for SqliteStreamStore {
    fn insert_stream_batch(&mut self, records: &[StreamRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO activity_streams (
                    activity_id,
                    timestamp,
                    elapsed_seconds,
                    heart_rate,
                    altitude,
                    distance,
                    speed,
                    cadence,
                    power,
                    latitude,
                    longitude,
                    pace,
                    source_type
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )?;
            for r in records {
                stmt.execute(params![
                    r.activity_id,
                    r.timestamp,
                    r.elapsed_seconds,
                    r.heart_rate,
                    r.altitude,
                    r.distance,
                    r.speed,
                    r.cadence,
                    r.power,
                    r.latitude,
                    r.longitude,
                    r.pace,
                    r.source_type,
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    fn get_activity_stream(&self, activity_id: i64) -> Result<Vec<StreamRecord>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT
                activity_id,
                timestamp,
                elapsed_seconds,
                heart_rate,
                altitude,
                distance,
                speed,
                cadence,
                power,
                latitude,
                longitude,
                pace,
                source_type
            FROM activity_streams
            WHERE activity_id = ?1
            ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![activity_id], record_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn activity_has_streams(&self, activity_id: i64) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT 1 FROM activity_streams WHERE activity_id = ?1 LIMIT 1")?;
        Ok(stmt.exists(params![activity_id])?)
    }

    fn delete_activity_streams(&mut self, activity_id: i64) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM activity_streams WHERE activity_id = ?1",
            params![activity_id],
        )?)
    }

    fn stats(&self) -> Result<StoreStats> {
        let (activities, records): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(DISTINCT activity_id), COUNT(*) FROM activity_streams",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(StoreStats {
            activities_with_streams: activities.max(0) as usize,
            total_stream_records: records.max(0) as usize,
        })
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<StreamRecord> {
    Ok(StreamRecord {
        activity_id: row.get(0)?,
        timestamp: row.get(1)?,
        elapsed_seconds: row.get(2)?,
        heart_rate: row.get(3)?,
        altitude: row.get(4)?,
        distance: row.get(5)?,
        speed: row.get(6)?,
        cadence: row.get(7)?,
        power: row.get(8)?,
        latitude: row.get(9)?,
        longitude: row.get(10)?,
        pace: row.get(11)?,
        source_type: row.get(12)?,
    })
}

impl ToSql for SourceFormat {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for SourceFormat {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let tag = value.as_str()?;
        SourceFormat::parse(tag)
            .ok_or_else(|| FromSqlError::Other(format!("unknown source type '{tag}'").into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RawSample;
    use chrono::{Duration, TimeZone, Utc};

    fn decoded(format: SourceFormat, speeds: Option<f64>) -> DecodedTrack {
        let t0 = Utc.with_ymd_and_hms(2023, 1, 1, 10, 0, 0).unwrap();
        let mut track = DecodedTrack::empty(format);
        for i in 0..5i64 {
            let mut s = RawSample::new(t0 + Duration::seconds(i * 10), format);
            s.distance = Some(i as f64 * 30.0);
            s.heart_rate = Some(140 + i as u16);
            s.speed = speeds;
            track.samples.push(s);
        }
        track
    }

    fn record(activity_id: i64, timestamp: &str) -> StreamRecord {
        StreamRecord {
            activity_id,
            timestamp: timestamp.to_string(),
            elapsed_seconds: 0.0,
            heart_rate: Some(150),
            altitude: None,
            distance: Some(12.5),
            speed: None,
            cadence: Some(170),
            power: None,
            latitude: Some(52.5),
            longitude: None,
            pace: Some(5.0),
            source_type: SourceFormat::Fit,
        }
    }

    #[test]
    fn test_records_derive_pace_from_distance() {
        let params = PipelineParams::default();
        let records = stream_records_from_track(7, &decoded(SourceFormat::Tcx, None), &params);
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].timestamp, "2023-01-01T10:00:00.000Z");
        assert_eq!(records[0].pace, None);
        assert_eq!(records[4].elapsed_seconds, 40.0);
        // 3 m/s
        assert!((records[1].pace.unwrap() - (1000.0 / 3.0) / 60.0).abs() < 1e-9);
        assert!(records.iter().all(|r| r.activity_id == 7 && r.source_type == SourceFormat::Tcx));
    }

    #[test]
    fn test_records_prefer_device_speed() {
        let params = PipelineParams::default();
        let records = stream_records_from_track(7, &decoded(SourceFormat::Fit, Some(4.0)), &params);
        assert!(records.iter().all(|r| (r.pace.unwrap() - (1000.0 / 4.0) / 60.0).abs() < 1e-9));

        let stopped_track = decoded(SourceFormat::Fit, Some(0.05));
        let stopped = stream_records_from_track(7, &stopped_track, &params);
        assert!(stopped.iter().all(|r| r.pace.is_none()));
    }

    fn exercise_store(store: &mut dyn StreamStore) {
        assert!(!store.activity_has_streams(1).unwrap());
        let batch = vec![
            record(1, "2023-01-01T10:00:02.000Z"),
            record(1, "2023-01-01T10:00:00.000Z"),
            record(2, "2023-01-02T08:00:00.000Z"),
        ];
        assert_eq!(store.insert_stream_batch(&batch).unwrap(), 3);
        assert_eq!(store.insert_stream_batch(&[]).unwrap(), 0);

        assert!(store.activity_has_streams(1).unwrap());
        let rows = store.get_activity_stream(1).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timestamp, "2023-01-01T10:00:00.000Z");
        assert_eq!(rows[0], batch[1]);
        assert!(store.get_activity_stream(99).unwrap().is_empty());

        assert_eq!(
            store.stats().unwrap(),
            StoreStats {
                activities_with_streams: 2,
                total_stream_records: 3
            }
        );

        assert_eq!(store.delete_activity_streams(1).unwrap(), 2);
        assert!(!store.activity_has_streams(1).unwrap());
        assert_eq!(store.stats().unwrap().total_stream_records, 1);
    }

    #[test]
    fn test_memory_store() {
        exercise_store(&mut MemoryStreamStore::new());
    }

    #[test]
    fn test_sqlite_store() {
        exercise_store(&mut SqliteStreamStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streams.db");
        {
            let mut store = SqliteStreamStore::open(&path).unwrap();
            store.insert_stream_batch(&[record(5, "2023-01-01T10:00:00.000Z")]).unwrap();
        }
        let store = SqliteStreamStore::open(&path).unwrap();
        assert!(store.activity_has_streams(5).unwrap());
        assert_eq!(store.get_activity_stream(5).unwrap()[0].source_type, SourceFormat::Fit);
    }
}
