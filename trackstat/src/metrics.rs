//! Derived per-point columns: smoothed altitude, speed, grade, GAP and pace.

use std::collections::VecDeque;

use crate::normalize::seconds_between;
use crate::{PipelineParams, TrackPoint};

/// Fill the derived columns of a time-ordered track in place.
///
/// Undefined values (first-row differences, speed over a zero time step,
/// pace below the floor) are left as `None` rather than zero or infinity.
pub fn calculate_metrics(points: &mut [TrackPoint], params: &PipelineParams) {
    let Some(t0) = points.first().map(|p| p.time) else {
        return;
    };
    for p in points.iter_mut() {
        p.elapsed_s = seconds_between(t0, p.time);
    }

    let altitude: Vec<Option<f64>> = points.iter().map(|p| p.altitude).collect();
    let smoothed = centered_mean(&altitude, params.altitude_window);
    for (p, alt) in points.iter_mut().zip(smoothed) {
        p.altitude_smoothed = alt;
    }

    let mut prev: Option<(Option<f64>, f64, Option<f64>)> = None;
    for p in points.iter_mut() {
        if let Some((prev_dist, prev_elapsed, prev_alt)) = prev {
            p.dist_diff = diff(p.distance, prev_dist);
            p.time_diff = Some(p.elapsed_s - prev_elapsed);
            p.alt_diff = diff(p.altitude_smoothed, prev_alt);
        } else {
            p.dist_diff = None;
            p.time_diff = None;
            p.alt_diff = None;
        }
        prev = Some((p.distance, p.elapsed_s, p.altitude_smoothed));

        p.speed_m_s = match (p.dist_diff, p.time_diff) {
            (Some(d), Some(t)) if t != 0.0 => Some(d / t).filter(|s| s.is_finite()),
            _ => None,
        };
        p.is_moving = p.speed_m_s.is_some_and(|s| s > params.moving_speed_mps);
        p.grade = grade(p.alt_diff, p.dist_diff, params);
        p.gap_factor = params.gap_factor(p.grade);
        p.elevation_gain_step = p.alt_diff.filter(|d| *d > 0.0).unwrap_or(0.0);
    }

    let speed: Vec<Option<f64>> = points.iter().map(|p| p.speed_m_s).collect();
    let speed_smoothed = trailing_mean(&speed, params.speed_window);
    for (p, speed) in points.iter_mut().zip(speed_smoothed) {
        p.speed_smoothed = speed;
        p.speed_gap = speed.map(|s| s * p.gap_factor);
        p.pace_decimal = params.pace_from_speed(p.speed_smoothed);
        p.gap_pace_decimal = params.pace_from_speed(p.speed_gap);
    }
}

fn diff(current: Option<f64>, previous: Option<f64>) -> Option<f64> {
    Some(current? - previous?)
}

/// Rise over run, zeroed over sub-threshold distance steps and clipped.
fn grade(alt_diff: Option<f64>, dist_diff: Option<f64>, params: &PipelineParams) -> f64 {
    match (alt_diff, dist_diff) {
        (_, Some(d)) if d < params.grade_min_distance_m => 0.0,
        (Some(a), Some(d)) => {
            let g = a / d;
            if g.is_finite() {
                g.clamp(-params.grade_clip, params.grade_clip)
            } else {
                0.0
            }
        }
        _ => 0.0,
    }
}

/// Fixed-capacity sliding window over nullable samples. Nulls occupy a slot
/// but do not count toward the mean.
#[derive(Debug)]
struct RollingMean {
    window: VecDeque<Option<f64>>,
    capacity: usize,
    sum: f64,
    count: usize,
}

impl RollingMean {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0.0,
            count: 0,
        }
    }

    fn push(&mut self, value: Option<f64>) {
        if self.window.len() == self.capacity {
            if let Some(Some(old)) = self.window.pop_front() {
                self.sum -= old;
                self.count -= 1;
                if self.count == 0 {
                    self.sum = 0.0;
                }
            }
        }
        if let Some(v) = value {
            self.sum += v;
            self.count += 1;
        }
        self.window.push_back(value);
    }

    fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Mean over the current sample and up to `window - 1` before it.
pub fn trailing_mean(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    let mut acc = RollingMean::new(window);
    values
        .iter()
        .map(|v| {
            acc.push(*v);
            acc.mean()
        })
        .collect()
}

/// Centered mean; edge windows use whatever samples exist. For even windows
/// the extra sample falls before the center.
pub fn centered_mean(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    let window = window.max(1);
    let lead = (window - 1) / 2;
    let mut acc = RollingMean::new(window);
    let mut out = Vec::with_capacity(values.len());
    for k in 0..values.len() + lead {
        acc.push(values.get(k).copied().flatten());
        if k >= lead {
            out.push(acc.mean());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{create_track, RawStreams};
    use crate::RawTime;
    use chrono::{Duration, TimeZone, Utc};

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn track(distance: &[f64], altitude: &[f64]) -> Vec<TrackPoint> {
        let t0 = Utc.with_ymd_and_hms(2023, 1, 1, 10, 0, 0).unwrap();
        (0..distance.len())
            .map(|i| {
                let mut p = TrackPoint::new(t0 + Duration::seconds(i as i64));
                p.distance = Some(distance[i]);
                p.altitude = altitude.get(i).copied();
                p
            })
            .collect()
    }

    #[test]
    fn test_two_point_scenario() {
        let streams = RawStreams {
            timestamps: vec![
                RawTime::from("2023-01-01T10:00:00Z"),
                RawTime::from("2023-01-01T10:00:10Z"),
            ],
            distance: vec![Some(0.0), Some(100.0)],
            heart_rate: vec![Some(140.0), Some(150.0)],
            ..RawStreams::default()
        };
        let mut points = create_track(&streams);
        calculate_metrics(&mut points, &PipelineParams::default());

        assert_eq!(points[0].speed_m_s, None);
        assert_eq!(points[0].dist_diff, None);
        assert_eq!(points[0].pace_decimal, None);
        assert!(approx(points[1].speed_m_s.unwrap(), 10.0));
        assert!(points[1].is_moving);
        assert!(approx(points[1].pace_decimal.unwrap(), 1000.0 / 10.0 / 60.0));
        // no altitude: flat grade, GAP equals plain pace
        assert_eq!(points[1].grade, 0.0);
        assert!(approx(points[1].gap_pace_decimal.unwrap(), points[1].pace_decimal.unwrap()));
    }

    #[test]
    fn test_empty_track_is_untouched() {
        let mut points: Vec<TrackPoint> = Vec::new();
        calculate_metrics(&mut points, &PipelineParams::default());
        assert!(points.is_empty());
    }

    #[test]
    fn test_zero_time_step_has_no_speed() {
        let mut points = track(&[0.0, 10.0], &[]);
        points[1].time = points[0].time;
        calculate_metrics(&mut points, &PipelineParams::default());
        assert_eq!(points[1].time_diff, Some(0.0));
        assert_eq!(points[1].speed_m_s, None);
        assert!(!points[1].is_moving);
    }

    #[test]
    fn test_grade_is_clipped() {
        let params = PipelineParams {
            altitude_window: 1,
            ..PipelineParams::default()
        };
        let mut points = track(&[0.0, 10.0, 20.0, 30.0], &[0.0, 10.0, 10.0, 0.0]);
        calculate_metrics(&mut points, &params);
        let grades: Vec<f64> = points.iter().map(|p| p.grade).collect();
        assert_eq!(grades, vec![0.0, 0.4, 0.0, -0.4]);
        assert!(approx(points[1].gap_factor, 1.0 + 9.0 * 0.4));
        assert!(approx(points[3].gap_factor, 1.0 - 4.0 * 0.4));
    }

    #[test]
    fn test_grade_ignored_on_tiny_steps() {
        let params = PipelineParams {
            altitude_window: 1,
            ..PipelineParams::default()
        };
        let mut points = track(&[0.0, 0.5, 10.5], &[0.0, 5.0, 5.5]);
        calculate_metrics(&mut points, &params);
        assert_eq!(points[1].grade, 0.0);
        assert!(approx(points[2].grade, 0.05));
    }

    #[test]
    fn test_pace_floor() {
        let mut points = track(&[0.0, 0.05, 0.1, 0.15], &[]);
        calculate_metrics(&mut points, &PipelineParams::default());
        for p in &points {
            assert!(p.speed_smoothed.map_or(true, |s| s <= 0.1));
            assert_eq!(p.pace_decimal, None);
            assert!(!p.is_moving);
        }
    }

    #[test]
    fn test_elevation_gain_uses_smoothed_altitude() {
        let params = PipelineParams {
            altitude_window: 1,
            ..PipelineParams::default()
        };
        let mut points = track(&[0.0, 10.0, 20.0, 30.0, 40.0], &[5.0, 7.0, 6.0, 9.0, 9.0]);
        calculate_metrics(&mut points, &params);
        let gain: f64 = points.iter().map(|p| p.elevation_gain_step).sum();
        assert!(approx(gain, 5.0));
        assert_eq!(points[0].elevation_gain_step, 0.0);
    }

    #[test]
    fn test_centered_mean_edges() {
        let values: Vec<Option<f64>> = [1.0, 2.0, 3.0, 4.0, 5.0].iter().map(|v| Some(*v)).collect();
        let out = centered_mean(&values, 3);
        assert_eq!(out, vec![Some(1.5), Some(2.0), Some(3.0), Some(4.0), Some(4.5)]);
        let wide = centered_mean(&values, 15);
        assert!(wide.iter().all(|v| approx(v.unwrap(), 3.0)));
        assert_eq!(centered_mean(&[None, None], 15), vec![None, None]);
    }

    #[test]
    fn test_trailing_mean_skips_nulls() {
        let out = trailing_mean(&[None, Some(2.0), Some(4.0), Some(6.0)], 2);
        assert_eq!(out, vec![None, Some(2.0), Some(3.0), Some(5.0)]);
        assert_eq!(trailing_mean(&[], 10), Vec::<Option<f64>>::new());
    }
}
