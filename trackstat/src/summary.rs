//! Headline numbers for one derived track.

use serde::{Deserialize, Serialize};

use crate::splits::mean;
use crate::TrackPoint;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackSummary {
    pub points: usize,
    pub total_distance_m: f64,
    pub total_elapsed_s: f64,
    pub moving_time_s: f64,
    pub avg_heart_rate: Option<f64>,
    pub max_heart_rate: Option<f64>,
    pub avg_pace_min_per_km: Option<f64>,
    pub elevation_gain_m: f64,
}

pub fn summarize(points: &[TrackPoint]) -> TrackSummary {
    let Some(last) = points.last() else {
        return TrackSummary::default();
    };
    let total_distance_m = points
        .iter()
        .filter_map(|p| p.distance)
        .fold(0.0, f64::max);
    let total_elapsed_s = last.elapsed_s;
    let max_heart_rate = points
        .iter()
        .filter_map(|p| p.heart_rate)
        .fold(None, |acc: Option<f64>, hr| Some(acc.map_or(hr, |m| m.max(hr))));

    TrackSummary {
        points: points.len(),
        total_distance_m,
        total_elapsed_s,
        moving_time_s: points
            .iter()
            .filter(|p| p.is_moving)
            .filter_map(|p| p.time_diff)
            .sum(),
        avg_heart_rate: mean(points.iter().map(|p| p.heart_rate)),
        max_heart_rate,
        avg_pace_min_per_km: (total_distance_m > 0.0)
            .then(|| (total_elapsed_s / 60.0) / (total_distance_m / 1000.0)),
        elevation_gain_m: points.iter().map(|p| p.elevation_gain_step).sum(),
    }
}

/// `m:ss` with the seconds truncated, `--:--` for undefined pace.
pub fn format_pace(min_per_km: Option<f64>) -> String {
    match min_per_km {
        Some(pace) if pace.is_finite() && pace >= 0.0 => {
            let minutes = pace.trunc();
            let seconds = ((pace - minutes) * 60.0).trunc();
            format!("{}:{:02}", minutes as u64, seconds as u64)
        }
        _ => "--:--".to_string(),
    }
}
