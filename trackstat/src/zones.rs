//! Heart-rate zones.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Result, TrackError, TrackPoint};

/// Four ascending upper bounds. Each bound belongs to the lower zone.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HrZones {
    pub z1: f64,
    pub z2: f64,
    pub z3: f64,
    pub z4: f64,
}

impl Default for HrZones {
    fn default() -> Self {
        Self {
            z1: 145.0,
            z2: 164.0,
            z3: 174.0,
            z4: 188.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HrZone {
    Zone1,
    Zone2,
    Zone3,
    Zone4,
    Zone5,
}

impl HrZone {
    pub const ALL: [HrZone; 5] = [
        HrZone::Zone1,
        HrZone::Zone2,
        HrZone::Zone3,
        HrZone::Zone4,
        HrZone::Zone5,
    ];

    pub fn number(self) -> u8 {
        self as u8 + 1
    }
}

impl fmt::Display for HrZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Zone {}", self.number())
    }
}

impl HrZones {
    pub fn new(z1: f64, z2: f64, z3: f64, z4: f64) -> Result<Self> {
        let zones = Self { z1, z2, z3, z4 };
        zones.validate()?;
        Ok(zones)
    }

    pub fn validate(&self) -> Result<()> {
        let bounds = self.bounds();
        if bounds.iter().any(|b| !b.is_finite()) {
            return Err(TrackError::InvalidParameter(format!(
                "zone bounds must be finite, got {bounds:?}"
            )));
        }
        if bounds.windows(2).any(|w| w[0] >= w[1]) {
            return Err(TrackError::InvalidParameter(format!(
                "zone bounds must be strictly ascending, got {bounds:?}"
            )));
        }
        Ok(())
    }

    pub fn bounds(&self) -> [f64; 4] {
        [self.z1, self.z2, self.z3, self.z4]
    }

    pub fn classify(&self, heart_rate: f64) -> HrZone {
        if heart_rate <= self.z1 {
            HrZone::Zone1
        } else if heart_rate <= self.z2 {
            HrZone::Zone2
        } else if heart_rate <= self.z3 {
            HrZone::Zone3
        } else if heart_rate <= self.z4 {
            HrZone::Zone4
        } else {
            HrZone::Zone5
        }
    }
}

/// Parses `"145,164,174,188"`.
impl FromStr for HrZones {
    type Err = TrackError;

    fn from_str(s: &str) -> Result<Self> {
        let values = s
            .split(',')
            .map(|part| {
                part.trim().parse::<f64>().map_err(|_| {
                    TrackError::InvalidParameter(format!("invalid zone bound '{}'", part.trim()))
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        match values.as_slice() {
            [z1, z2, z3, z4] => HrZones::new(*z1, *z2, *z3, *z4),
            _ => Err(TrackError::InvalidParameter(format!(
                "expected 4 zone bounds, got {}",
                values.len()
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZoneTime {
    pub zone: HrZone,
    pub seconds: f64,
    pub percent: f64,
}

/// Time spent in each zone, summed from `time_diff`. Points without heart
/// rate count toward neither a zone nor the total.
pub fn zone_distribution(points: &[TrackPoint], zones: &HrZones) -> Vec<ZoneTime> {
    let mut seconds = [0.0f64; 5];
    for p in points {
        if let Some(hr) = p.heart_rate {
            seconds[zones.classify(hr) as usize] += p.time_diff.unwrap_or(0.0);
        }
    }
    let total: f64 = seconds.iter().sum();
    HrZone::ALL
        .iter()
        .map(|&zone| {
            let s = seconds[zone as usize];
            ZoneTime {
                zone,
                seconds: s,
                percent: if total > 0.0 { s / total * 100.0 } else { 0.0 },
            }
        })
        .collect()
}
