//! Raw per-field columns to an ordered [`TrackPoint`] table.

use tracing::{debug, warn};

use crate::store::StreamRecord;
use crate::{semicircles_to_degrees, RawSample, RawTime, TrackPoint};

/// Parallel per-field arrays. `timestamps` is authoritative for the row
/// count; every other column is padded with nulls or truncated to match.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawStreams {
    pub timestamps: Vec<RawTime>,
    pub heart_rate: Vec<Option<f64>>,
    pub altitude: Vec<Option<f64>>,
    pub distance: Vec<Option<f64>>,
    pub cadence: Vec<Option<f64>>,
    pub power: Vec<Option<f64>>,
    pub speed: Vec<Option<f64>>,
    pub latitude: Vec<Option<f64>>,
    pub longitude: Vec<Option<f64>>,
}

impl RawStreams {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn from_samples(samples: &[RawSample]) -> Self {
        let mut out = RawStreams::default();
        for s in samples {
            out.timestamps.push(RawTime::Instant(s.timestamp));
            out.heart_rate.push(s.heart_rate.map(f64::from));
            out.altitude.push(s.altitude);
            out.distance.push(s.distance);
            out.cadence.push(s.cadence.map(f64::from));
            out.power.push(s.power.map(f64::from));
            out.speed.push(s.speed);
            out.latitude.push(s.latitude);
            out.longitude.push(s.longitude);
        }
        out
    }

    pub fn from_stream_records(records: &[StreamRecord]) -> Self {
        let mut out = RawStreams::default();
        for r in records {
            out.timestamps.push(RawTime::Text(r.timestamp.clone()));
            out.heart_rate.push(r.heart_rate.map(f64::from));
            out.altitude.push(r.altitude);
            out.distance.push(r.distance);
            out.cadence.push(r.cadence.map(f64::from));
            out.power.push(r.power.map(f64::from));
            out.speed.push(r.speed);
            out.latitude.push(r.latitude);
            out.longitude.push(r.longitude);
        }
        out
    }
}

/// Build the ordered track table.
///
/// Rows whose time does not resolve are dropped, as are rows whose time does
/// not advance past the previous retained row after a stable sort. Distance,
/// altitude, heart rate and cadence are then forward-filled.
pub fn create_track(streams: &RawStreams) -> Vec<TrackPoint> {
    let n = streams.len();
    if n == 0 {
        return Vec::new();
    }

    let heart_rate = fit_column("heart_rate", &streams.heart_rate, n);
    let altitude = fit_column("altitude", &streams.altitude, n);
    let distance = fit_column("distance", &streams.distance, n);
    let cadence = fit_column("cadence", &streams.cadence, n);
    let power = fit_column("power", &streams.power, n);
    let speed = fit_column("speed", &streams.speed, n);
    let latitude = fit_column("latitude", &streams.latitude, n);
    let longitude = fit_column("longitude", &streams.longitude, n);

    let mut points = Vec::with_capacity(n);
    for (i, raw_time) in streams.timestamps.iter().enumerate() {
        let Some(time) = raw_time.resolve() else {
            continue;
        };
        let mut point = TrackPoint::new(time);
        point.heart_rate = heart_rate[i];
        point.altitude = altitude[i];
        point.distance = distance[i];
        point.cadence = cadence[i];
        point.power = power[i];
        point.speed = speed[i];
        point.latitude = latitude[i].map(coordinate_to_degrees);
        point.longitude = longitude[i].map(coordinate_to_degrees);
        points.push(point);
    }
    let unparsed = n - points.len();
    if unparsed > 0 {
        debug!("Dropped {} rows with unparseable timestamps", unparsed);
    }

    points.sort_by_key(|p| p.time);
    let before = points.len();
    points.dedup_by(|later, earlier| later.time <= earlier.time);
    if points.len() < before {
        debug!("Dropped {} rows with duplicate timestamps", before - points.len());
    }

    forward_fill(points.iter_mut().map(|p| &mut p.distance));
    forward_fill(points.iter_mut().map(|p| &mut p.altitude));
    forward_fill(points.iter_mut().map(|p| &mut p.heart_rate));
    forward_fill(points.iter_mut().map(|p| &mut p.cadence));

    if let Some(t0) = points.first().map(|p| p.time) {
        for p in points.iter_mut() {
            p.elapsed_s = seconds_between(t0, p.time);
        }
    }
    points
}

/// Pad with nulls or truncate to `len`, dropping non-finite values.
fn fit_column(name: &str, column: &[Option<f64>], len: usize) -> Vec<Option<f64>> {
    if column.len() > len {
        warn!(
            "Column {} has {} values for {} timestamps; truncating",
            name,
            column.len(),
            len
        );
    }
    let mut out: Vec<Option<f64>> = column
        .iter()
        .take(len)
        .map(|v| v.filter(|x| x.is_finite()))
        .collect();
    out.resize(len, None);
    out
}

/// Values above 180 in magnitude cannot be degrees, so they are taken to be
/// semicircles. Genuine degree values near ±180 are indistinguishable.
pub fn coordinate_to_degrees(value: f64) -> f64 {
    if value.abs() > 180.0 {
        semicircles_to_degrees(value)
    } else {
        value
    }
}

pub(crate) fn forward_fill<'a>(values: impl Iterator<Item = &'a mut Option<f64>>) {
    let mut last = None;
    for slot in values {
        match *slot {
            Some(v) => last = Some(v),
            None => *slot = last,
        }
    }
}

pub(crate) fn seconds_between(
    start: chrono::DateTime<chrono::Utc>,
    end: chrono::DateTime<chrono::Utc>,
) -> f64 {
    let delta = end - start;
    match delta.num_nanoseconds() {
        Some(ns) => ns as f64 / 1e9,
        // beyond ~292 years of nanoseconds
        None => delta.num_milliseconds() as f64 / 1000.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(values: &[&str]) -> Vec<RawTime> {
        values.iter().map(|v| RawTime::from(*v)).collect()
    }

    #[test]
    fn test_two_point_scenario() {
        let streams = RawStreams {
            timestamps: texts(&["2023-01-01T10:00:00Z", "2023-01-01T10:00:10Z"]),
            distance: vec![Some(0.0), Some(100.0)],
            heart_rate: vec![Some(140.0), Some(150.0)],
            ..RawStreams::default()
        };
        let track = create_track(&streams);
        assert_eq!(track.len(), 2);
        assert_eq!(track[0].elapsed_s, 0.0);
        assert_eq!(track[1].elapsed_s, 10.0);
        assert_eq!(track[1].distance, Some(100.0));
        assert_eq!(track[0].altitude, None);
    }

    #[test]
    fn test_empty_timestamps() {
        let streams = RawStreams {
            heart_rate: vec![Some(120.0)],
            ..RawStreams::default()
        };
        assert!(create_track(&streams).is_empty());
    }

    #[test]
    fn test_pad_and_truncate() {
        let streams = RawStreams {
            timestamps: texts(&[
                "2023-01-01T10:00:00Z",
                "2023-01-01T10:00:01Z",
                "2023-01-01T10:00:02Z",
            ]),
            heart_rate: vec![Some(120.0)],
            altitude: vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0), Some(5.0)],
            ..RawStreams::default()
        };
        let track = create_track(&streams);
        assert_eq!(track.len(), 3);
        // padded heart rate is forward-filled
        assert!(track.iter().all(|p| p.heart_rate == Some(120.0)));
        let alts: Vec<_> = track.iter().map(|p| p.altitude).collect();
        assert_eq!(alts, vec![Some(1.0), Some(2.0), Some(3.0)]);
    }

    #[test]
    fn test_bad_timestamps_are_dropped() {
        let streams = RawStreams {
            timestamps: vec![
                RawTime::from("2023-01-01T10:00:00Z"),
                RawTime::from("nonsense"),
                RawTime::Missing,
                RawTime::from("2023-01-01T10:00:05Z"),
            ],
            distance: vec![Some(0.0), Some(10.0), Some(20.0), Some(30.0)],
            ..RawStreams::default()
        };
        let track = create_track(&streams);
        assert_eq!(track.len(), 2);
        assert_eq!(track[1].distance, Some(30.0));
        assert_eq!(track[1].elapsed_s, 5.0);
    }

    #[test]
    fn test_duplicate_and_out_of_order_times() {
        let streams = RawStreams {
            timestamps: texts(&[
                "2023-01-01T10:00:00Z",
                "2023-01-01T10:00:02Z",
                "2023-01-01T10:00:02Z",
                "2023-01-01T10:00:01Z",
            ]),
            distance: vec![Some(0.0), Some(20.0), Some(21.0), Some(10.0)],
            ..RawStreams::default()
        };
        let track = create_track(&streams);
        let elapsed: Vec<f64> = track.iter().map(|p| p.elapsed_s).collect();
        assert_eq!(elapsed, vec![0.0, 1.0, 2.0]);
        assert_eq!(track[2].distance, Some(20.0));
        assert!(track.windows(2).all(|w| w[1].elapsed_s > w[0].elapsed_s));
    }

    #[test]
    fn test_sub_millisecond_times_stay_increasing() {
        let streams = RawStreams {
            timestamps: texts(&[
                "2023-01-01T10:00:00Z",
                "2023-01-01T10:00:00.000000001Z",
                "2023-01-01T10:00:00.0005Z",
            ]),
            ..RawStreams::default()
        };
        let track = create_track(&streams);
        assert_eq!(track.len(), 3);
        assert!(track.windows(2).all(|w| w[1].elapsed_s > w[0].elapsed_s));
        assert!((track[2].elapsed_s - 0.0005).abs() < 1e-12);
    }

    #[test]
    fn test_forward_fill_never_regresses_to_null() {
        let streams = RawStreams {
            timestamps: texts(&[
                "2023-01-01T10:00:00Z",
                "2023-01-01T10:00:01Z",
                "2023-01-01T10:00:02Z",
                "2023-01-01T10:00:03Z",
                "2023-01-01T10:00:04Z",
            ]),
            distance: vec![None, Some(3.0), None, None, Some(9.0)],
            altitude: vec![Some(100.0), None, None, None, None],
            heart_rate: vec![None, None, Some(130.0), Some(f64::NAN), None],
            ..RawStreams::default()
        };
        let track = create_track(&streams);
        assert_eq!(track[0].distance, None);
        for column in [
            track.iter().map(|p| p.distance).collect::<Vec<_>>(),
            track.iter().map(|p| p.altitude).collect::<Vec<_>>(),
            track.iter().map(|p| p.heart_rate).collect::<Vec<_>>(),
        ] {
            let first = column.iter().position(|v| v.is_some()).unwrap();
            assert!(column[first..].iter().all(|v| v.is_some()));
        }
        assert_eq!(track[2].distance, Some(3.0));
        assert_eq!(track[3].heart_rate, Some(130.0));
    }

    #[test]
    fn test_semicircle_heuristic() {
        let semis = 123_456_789.0;
        assert!((coordinate_to_degrees(semis) - semis * 180.0 / 2f64.powi(31)).abs() < 1e-12);
        assert!((coordinate_to_degrees(-200.0) - (-200.0 * 180.0 / 2f64.powi(31))).abs() < 1e-15);
        assert_eq!(coordinate_to_degrees(52.5), 52.5);
        assert_eq!(coordinate_to_degrees(-180.0), -180.0);

        let streams = RawStreams {
            timestamps: texts(&["2023-01-01 10:00:00", "2023-01-01 10:00:01"]),
            latitude: vec![Some(semis), Some(45.0)],
            longitude: vec![Some(-semis), None],
            ..RawStreams::default()
        };
        let track = create_track(&streams);
        assert!(track[0].latitude.unwrap().abs() < 180.0);
        assert_eq!(track[1].latitude, Some(45.0));
        assert_eq!(track[1].longitude, None);
    }

    #[test]
    fn test_from_samples() {
        use crate::SourceFormat;
        use chrono::{TimeZone, Utc};

        let mut sample = RawSample::new(
            Utc.with_ymd_and_hms(2023, 1, 1, 10, 0, 0).unwrap(),
            SourceFormat::Fit,
        );
        sample.heart_rate = Some(150);
        sample.cadence = Some(180);
        let streams = RawStreams::from_samples(&[sample]);
        assert_eq!(streams.len(), 1);
        assert_eq!(streams.heart_rate, vec![Some(150.0)]);
        assert_eq!(streams.cadence, vec![Some(180.0)]);
    }
}
