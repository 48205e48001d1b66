//! Fixed-distance splits over a derived track.

use serde::{Deserialize, Serialize};

use crate::normalize::seconds_between;
use crate::{pace_from_elapsed, PipelineParams, TrackPoint};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Split {
    /// 1-based.
    pub index: usize,
    /// Distance actually spanned by the samples in the window.
    pub covered_distance_km: f64,
    pub elapsed_s: f64,
    pub pace_min_per_km: f64,
    pub avg_heart_rate: Option<f64>,
    pub avg_cadence: Option<f64>,
}

/// Walk `[k·L, (k+1)·L)` windows (L = `params.split_distance_m`) and emit one
/// split per window that lies wholly below the track's maximum distance.
///
/// The trailing partial window is never emitted. Elapsed time is wall-clock
/// time between the first and last sample in the window, not moving time.
pub fn calculate_splits(points: &[TrackPoint], params: &PipelineParams) -> Vec<Split> {
    let length = params.split_distance_m;
    if !(length > 0.0) {
        return Vec::new();
    }
    let max_distance = points
        .iter()
        .filter_map(|p| p.distance)
        .fold(f64::NEG_INFINITY, f64::max);
    if !max_distance.is_finite() {
        return Vec::new();
    }

    let mut splits = Vec::new();
    let mut k = 0usize;
    while (k as f64) * length < max_distance {
        let start = k as f64 * length;
        let end = start + length;
        k += 1;
        if end > max_distance {
            break;
        }

        let window: Vec<&TrackPoint> = points
            .iter()
            .filter(|p| p.distance.is_some_and(|d| d >= start && d < end))
            .collect();
        let (Some(first), Some(last)) = (window.first(), window.last()) else {
            continue;
        };

        let covered_km = (last.distance.unwrap_or(0.0) - first.distance.unwrap_or(0.0)) / 1000.0;
        let elapsed_s = seconds_between(first.time, last.time);
        splits.push(Split {
            index: k,
            covered_distance_km: covered_km,
            elapsed_s,
            pace_min_per_km: pace_from_elapsed(elapsed_s, covered_km),
            avg_heart_rate: mean(window.iter().map(|p| p.heart_rate)),
            avg_cadence: mean(window.iter().map(|p| p.cadence)),
        });
    }
    splits
}

/// Mean of the present values, `None` if there are none.
pub(crate) fn mean(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    let (sum, count) = values
        .flatten()
        .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}
