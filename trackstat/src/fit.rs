//! FIT reader built on `fitparser`.
//!
//! Only `record` and `lap` messages are consumed. Positions are converted
//! from semicircles and cadence is doubled (devices store one leg).

use chrono::{DateTime, Utc};
use fitparser::de::{from_bytes, FitObject, FitStreamProcessor};
use fitparser::profile::MesgNum;
use fitparser::{FitDataRecord, Value};
use tracing::warn;

use crate::source::{maybe_gunzip, DecodedTrack, SourceFormat, TrackReader};
use crate::{semicircles_to_degrees, to_u16, Lap, RawSample, Result, TrackError};

#[derive(Clone, Copy, Debug, Default)]
pub struct FitReader;

impl TrackReader for FitReader {
    fn format(&self) -> SourceFormat {
        SourceFormat::Fit
    }

    fn decode(&self, bytes: &[u8]) -> Result<DecodedTrack> {
        let bytes = maybe_gunzip(bytes)?;
        let (messages, diagnostic) = decode_messages(&bytes)?;

        let mut track = DecodedTrack::empty(SourceFormat::Fit);
        track.diagnostic = diagnostic;
        for message in &messages {
            match message.kind() {
                MesgNum::Record => {
                    if let Some(sample) = record_sample(message) {
                        track.samples.push(sample);
                    }
                }
                MesgNum::Lap => {
                    let index = track.laps.len() + 1;
                    track.laps.push(lap_entry(message, index));
                }
                _ => {}
            }
        }
        Ok(track)
    }
}

/// Strict decode, falling back to a message-by-message pass that keeps
/// whatever decoded before the first failure.
fn decode_messages(input: &[u8]) -> Result<(Vec<FitDataRecord>, Option<String>)> {
    match from_bytes(input) {
        Ok(records) => Ok((records, None)),
        Err(err) => {
            let partial = decode_until_error(input);
            if partial.is_empty() {
                return Err(TrackError::FitParse(err.to_string()));
            }
            warn!(
                "FIT decode stopped early ({}); keeping {} decoded messages",
                err,
                partial.len()
            );
            Ok((partial, Some(err.to_string())))
        }
    }
}

fn decode_until_error(mut input: &[u8]) -> Vec<FitDataRecord> {
    let mut processor = FitStreamProcessor::new();
    let mut out = Vec::new();
    while !input.is_empty() {
        let (remaining, object) = match processor.deserialize_next(input) {
            Ok(next) => next,
            Err(_) => break,
        };
        match object {
            FitObject::Crc(_) => processor.reset(),
            FitObject::DataMessage(msg) => match processor.decode_message(msg) {
                Ok(record) => out.push(record),
                Err(_) => break,
            },
            _ => {}
        }
        input = remaining;
    }
    out
}

fn record_sample(record: &FitDataRecord) -> Option<RawSample> {
    let mut timestamp: Option<DateTime<Utc>> = None;
    let mut altitude = None;
    let mut enhanced_altitude = None;
    let mut speed = None;
    let mut enhanced_speed = None;
    let mut heart_rate = None;
    let mut distance = None;
    let mut cadence = None;
    let mut power = None;
    let mut lat = None;
    let mut lon = None;

    for field in record.fields() {
        let value = field.value();
        match field.name() {
            "timestamp" => timestamp = fit_timestamp(value),
            "altitude" => altitude = fit_value_to_f64(value),
            "enhanced_altitude" => enhanced_altitude = fit_value_to_f64(value),
            "speed" => speed = fit_value_to_f64(value),
            "enhanced_speed" => enhanced_speed = fit_value_to_f64(value),
            "heart_rate" => heart_rate = fit_value_to_f64(value),
            "distance" => distance = fit_value_to_f64(value),
            "cadence" => cadence = fit_value_to_f64(value),
            "power" => power = fit_value_to_f64(value),
            "position_lat" => lat = fit_value_to_f64(value),
            "position_long" => lon = fit_value_to_f64(value),
            _ => {}
        }
    }

    let mut sample = RawSample::new(timestamp?, SourceFormat::Fit);
    sample.heart_rate = heart_rate.and_then(to_u16);
    sample.altitude = enhanced_altitude.or(altitude);
    sample.distance = distance;
    sample.speed = enhanced_speed.or(speed);
    sample.cadence = cadence.map(|c| c * 2.0).and_then(to_u16);
    sample.power = power.and_then(to_u16);
    sample.latitude = lat.map(semicircles_to_degrees);
    sample.longitude = lon.map(semicircles_to_degrees);
    Some(sample)
}

fn lap_entry(lap: &FitDataRecord, index: usize) -> Lap {
    let mut start_time = None;
    let mut distance = None;
    let mut elapsed = None;
    let mut timer = None;
    let mut moving = None;
    let mut avg_hr = None;
    let mut running_cadence = None;
    let mut cadence = None;

    for field in lap.fields() {
        let value = field.value();
        match field.name() {
            "start_time" => start_time = fit_timestamp(value),
            "total_distance" => distance = fit_value_to_f64(value),
            "total_elapsed_time" => elapsed = fit_value_to_f64(value),
            "total_timer_time" => timer = fit_value_to_f64(value),
            "total_moving_time" => moving = fit_value_to_f64(value),
            "avg_heart_rate" => avg_hr = fit_value_to_f64(value),
            "avg_running_cadence" => running_cadence = fit_value_to_f64(value),
            "avg_cadence" => cadence = fit_value_to_f64(value),
            _ => {}
        }
    }

    Lap::new(
        index,
        start_time,
        distance.unwrap_or(0.0),
        elapsed.or(timer).or(moving),
        avg_hr,
        running_cadence.or(cadence).map(|c| c * 2.0),
    )
}

fn fit_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Timestamp(ts) => Some(ts.with_timezone(&Utc)),
        _ => None,
    }
}

fn fit_value_to_f64(value: &Value) -> Option<f64> {
    let v = match value {
        Value::Float32(v) => *v as f64,
        Value::Float64(v) => *v,
        Value::SInt8(v) => *v as f64,
        Value::UInt8(v) => *v as f64,
        Value::UInt8z(v) => *v as f64,
        Value::Byte(v) => *v as f64,
        Value::SInt16(v) => *v as f64,
        Value::UInt16(v) => *v as f64,
        Value::UInt16z(v) => *v as f64,
        Value::SInt32(v) => *v as f64,
        Value::UInt32(v) => *v as f64,
        Value::UInt32z(v) => *v as f64,
        Value::SInt64(v) => *v as f64,
        Value::UInt64(v) => *v as f64,
        Value::UInt64z(v) => *v as f64,
        Value::Array(values) => return values.iter().find_map(fit_value_to_f64),
        _ => return None,
    };
    v.is_finite().then_some(v)
}
