//! Training Center XML reader.
//!
//! Elements are matched by local name, so both the default Garmin namespace
//! and prefixed extension elements (`ns3:TPX/ns3:Watts`) are found.

use roxmltree::{Document, Node};
use tracing::debug;

use crate::source::{maybe_gunzip, DecodedTrack, SourceFormat, TrackReader};
use crate::{parse_timestamp, to_u16, Lap, RawSample, Result, TrackError};

#[derive(Clone, Copy, Debug, Default)]
pub struct TcxReader;

impl TrackReader for TcxReader {
    fn format(&self) -> SourceFormat {
        SourceFormat::Tcx
    }

    fn decode(&self, bytes: &[u8]) -> Result<DecodedTrack> {
        let bytes = maybe_gunzip(bytes)?;
        let text = std::str::from_utf8(&bytes)
            .map_err(|e| TrackError::TcxParse(format!("content is not UTF-8: {e}")))?;
        parse_tcx(text)
    }
}

/// Parse TCX text. Zero trackpoints yields an empty track rather than an error.
pub fn parse_tcx(text: &str) -> Result<DecodedTrack> {
    let text = text.trim_start_matches('\u{feff}').trim_start();
    let doc = Document::parse(text).map_err(|e| TrackError::TcxParse(e.to_string()))?;

    let mut track = DecodedTrack::empty(SourceFormat::Tcx);
    let mut skipped = 0usize;

    for point in doc.descendants().filter(|n| is_element(n, "Trackpoint")) {
        match trackpoint_sample(point) {
            Some(sample) => track.samples.push(sample),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!("Skipped {} TCX trackpoints without a usable time", skipped);
    }

    track.laps = doc
        .descendants()
        .filter(|n| is_element(n, "Lap"))
        .enumerate()
        .map(|(i, lap)| {
            let start_time = lap.attribute("StartTime").and_then(parse_timestamp);
            Lap::new(
                i + 1,
                start_time,
                child_number(lap, "DistanceMeters").unwrap_or(0.0),
                child_number(lap, "TotalTimeSeconds"),
                child(lap, "AverageHeartRateBpm").and_then(|hr| child_number(hr, "Value")),
                child_number(lap, "Cadence"),
            )
        })
        .collect();

    Ok(track)
}

fn trackpoint_sample(point: Node<'_, '_>) -> Option<RawSample> {
    let timestamp = child_text(point, "Time").and_then(parse_timestamp)?;
    let mut sample = RawSample::new(timestamp, SourceFormat::Tcx);

    sample.heart_rate = child(point, "HeartRateBpm")
        .and_then(|hr| child_number(hr, "Value"))
        .and_then(to_u16);
    sample.altitude = child_number(point, "AltitudeMeters");
    sample.distance = child_number(point, "DistanceMeters");
    sample.cadence = child_number(point, "Cadence").and_then(to_u16);

    if let Some(position) = child(point, "Position") {
        sample.latitude = child_number(position, "LatitudeDegrees");
        sample.longitude = child_number(position, "LongitudeDegrees");
    }

    if let Some(ext) = child(point, "Extensions") {
        sample.speed = descendant_number(ext, "Speed");
        sample.power = descendant_number(ext, "Watts").and_then(to_u16);
    }

    Some(sample)
}

fn is_element(node: &Node<'_, '_>, name: &str) -> bool {
    node.is_element() && node.tag_name().name() == name
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|c| is_element(c, name))
}

fn child_text<'a>(node: Node<'a, '_>, name: &str) -> Option<&'a str> {
    child(node, name).and_then(|c| c.text())
}

fn child_number(node: Node<'_, '_>, name: &str) -> Option<f64> {
    child_text(node, name).and_then(parse_number)
}

fn descendant_number(node: Node<'_, '_>, name: &str) -> Option<f64> {
    node.descendants()
        .find(|c| is_element(c, name))
        .and_then(|c| c.text())
        .and_then(parse_number)
}

fn parse_number(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}
