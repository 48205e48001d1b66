//! Source formats, the reader trait and gzip handling.

use std::borrow::Cow;
use std::fmt;
use std::io::Read;

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};

use crate::fit::FitReader;
use crate::tcx::TcxReader;
use crate::{Lap, RawSample, Result, TrackError};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SourceFormat {
    Tcx,
    Fit,
}

impl SourceFormat {
    /// Detect the container from a file name such as `123.fit.gz` or `456.tcx`.
    pub fn from_filename(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.contains(".fit") {
            Some(SourceFormat::Fit)
        } else if lower.contains(".tcx") {
            Some(SourceFormat::Tcx)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::Tcx => "TCX",
            SourceFormat::Fit => "FIT",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_uppercase().as_str() {
            "TCX" => Some(SourceFormat::Tcx),
            "FIT" => Some(SourceFormat::Fit),
            _ => None,
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a reader recovered from one file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecodedTrack {
    pub format: SourceFormat,
    pub samples: Vec<RawSample>,
    pub laps: Vec<Lap>,
    /// Non-fatal decode problem; samples may be incomplete when set.
    pub diagnostic: Option<String>,
}

impl DecodedTrack {
    pub fn empty(format: SourceFormat) -> Self {
        Self {
            format,
            samples: Vec::new(),
            laps: Vec::new(),
            diagnostic: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

pub trait TrackReader: Send + Sync {
    fn format(&self) -> SourceFormat;

    /// Decode raw (optionally gzip-compressed) file bytes.
    fn decode(&self, bytes: &[u8]) -> Result<DecodedTrack>;
}

pub fn reader_for(format: SourceFormat) -> Box<dyn TrackReader> {
    match format {
        SourceFormat::Tcx => Box::new(TcxReader),
        SourceFormat::Fit => Box::new(FitReader),
    }
}

pub fn decode_bytes(format: SourceFormat, bytes: &[u8]) -> Result<DecodedTrack> {
    reader_for(format).decode(bytes)
}

/// Inflate gzip input in memory; anything else is passed through untouched.
pub fn maybe_gunzip(bytes: &[u8]) -> Result<Cow<'_, [u8]>> {
    if !bytes.starts_with(&GZIP_MAGIC) {
        return Ok(Cow::Borrowed(bytes));
    }
    let mut out = Vec::with_capacity(bytes.len() * 4);
    GzDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(|e| TrackError::Decompress(e.to_string()))?;
    Ok(Cow::Owned(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn test_format_detection() {
        assert_eq!(SourceFormat::from_filename("activities/1.fit.gz"), Some(SourceFormat::Fit));
        assert_eq!(SourceFormat::from_filename("activities/2.TCX"), Some(SourceFormat::Tcx));
        assert_eq!(SourceFormat::from_filename("3.tcx.gz"), Some(SourceFormat::Tcx));
        assert_eq!(SourceFormat::from_filename("4.gpx"), None);
        assert_eq!(SourceFormat::parse("fit"), Some(SourceFormat::Fit));
        assert_eq!(SourceFormat::Tcx.to_string(), "TCX");
    }

    #[test]
    fn test_gunzip_roundtrip_and_passthrough() {
        let payload = b"<TrainingCenterDatabase/>".to_vec();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload).unwrap();
        let compressed = encoder.finish().unwrap();

        let inflated = maybe_gunzip(&compressed).unwrap();
        assert_eq!(inflated.as_ref(), payload.as_slice());
        assert!(matches!(maybe_gunzip(&payload).unwrap(), Cow::Borrowed(_)));
    }

    #[test]
    fn test_corrupt_gzip_is_error() {
        let bad = [0x1f, 0x8b, 0x08, 0x00, 0xde, 0xad];
        assert!(matches!(maybe_gunzip(&bad), Err(TrackError::Decompress(_))));
    }
}
