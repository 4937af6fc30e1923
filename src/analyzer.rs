//! Derived track statistics.
//!
//! Everything here is pure computation over parsed tracks. Results are
//! memoized on the [`Track`] so repeated display does not recompute them.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::UnitSystem;
use crate::geo::distance_between;
use crate::model::{Track, TrackSegment, Waypoint};

/// Number of point-to-point intervals averaged for the smoothed speed.
pub const SPEED_WINDOW_LEN: usize = 5;

const MPS_TO_KMH: f64 = 3.6;

/// Trailing window over the last [`SPEED_WINDOW_LEN`] (distance, time)
/// intervals. Speed is Σdistance / Σtime over whatever the window holds, so
/// the first few points use a partially filled window.
#[derive(Debug, Clone, Default)]
pub struct SpeedWindow {
    intervals: VecDeque<(f64, f64)>,
}

impl SpeedWindow {
    /// Adds an interval (meters, seconds) and returns the new windowed speed in km/h.
    pub fn push(&mut self, distance_m: f64, seconds: f64) -> Option<f64> {
        if self.intervals.len() == SPEED_WINDOW_LEN {
            self.intervals.pop_front();
        }
        self.intervals.push_back((distance_m, seconds));
        self.speed()
    }

    pub fn speed(&self) -> Option<f64> {
        let (distance, seconds) = self
            .intervals
            .iter()
            .fold((0.0, 0.0), |(d, t), (di, ti)| (d + di, t + ti));
        (seconds > 0.0).then(|| distance / seconds * MPS_TO_KMH)
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn clear(&mut self) {
        self.intervals.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bounds<T> {
    pub min: T,
    pub max: T,
}

impl<T: PartialOrd + Copy> Bounds<T> {
    fn widen(bounds: &mut Option<Self>, value: T) {
        match bounds {
            None => *bounds = Some(Self { min: value, max: value }),
            Some(b) => {
                if value < b.min {
                    b.min = value;
                }
                if value > b.max {
                    b.max = value;
                }
            }
        }
    }

    fn merge(bounds: &mut Option<Self>, other: Option<Self>) {
        if let Some(other) = other {
            Self::widen(bounds, other.min);
            Self::widen(bounds, other.max);
        }
    }
}

impl Bounds<f64> {
    /// Altitude bounds converted into the display unit.
    pub fn altitude_in(self, units: UnitSystem) -> Self {
        Self {
            min: units.altitude(self.min),
            max: units.altitude(self.max),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartRateStats {
    pub min: u32,
    pub max: u32,
    pub sum: u64,
    pub count: u32,
}

impl HeartRateStats {
    pub fn average(&self) -> f64 {
        self.sum as f64 / self.count as f64
    }

    fn add(stats: &mut Option<Self>, bpm: u32) {
        match stats {
            None => {
                *stats = Some(Self {
                    min: bpm,
                    max: bpm,
                    sum: u64::from(bpm),
                    count: 1,
                })
            }
            Some(s) => {
                s.min = s.min.min(bpm);
                s.max = s.max.max(bpm);
                s.sum += u64::from(bpm);
                s.count += 1;
            }
        }
    }

    fn merge(stats: &mut Option<Self>, other: Option<Self>) {
        let Some(other) = other else { return };
        match stats {
            None => *stats = Some(other),
            Some(s) => {
                s.min = s.min.min(other.min);
                s.max = s.max.max(other.max);
                s.sum += other.sum;
                s.count += other.count;
            }
        }
    }
}

/// Minutes and seconds per kilometer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pace {
    pub minutes: u64,
    pub seconds: u64,
}

impl Pace {
    fn from_totals(active_seconds: f64, distance_m: f64) -> Option<Self> {
        if active_seconds <= 0.0 || distance_m <= 0.0 {
            return None;
        }
        let per_km = (active_seconds / (distance_m / 1000.0)).round() as u64;
        Some(Self {
            minutes: per_km / 60,
            seconds: per_km % 60,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentStats {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub duration_secs: f64,
    /// `None` when the segment has no waypoints.
    pub distance_m: Option<f64>,
    pub average_speed_kmh: Option<f64>,
    /// Highest windowed speed seen in the segment.
    pub max_speed_kmh: Option<f64>,
    pub altitude: Option<Bounds<f64>>,
    pub heart_rate: Option<HeartRateStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackStats {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Sum of segment durations; pauses between segments are excluded.
    pub active_secs: f64,
    /// `None` when the track has no waypoints.
    pub distance_m: Option<f64>,
    pub average_speed_kmh: Option<f64>,
    pub max_speed_kmh: Option<f64>,
    pub pace: Option<Pace>,
    pub altitude: Option<Bounds<f64>>,
    pub heart_rate: Option<HeartRateStats>,
    pub segments: Vec<SegmentStats>,
}

impl Track {
    /// Statistics for this track, computed on first use.
    pub fn statistics(&self) -> &TrackStats {
        self.stats.get_or_init(|| analyze_track(self))
    }
}

pub fn analyze_track(track: &Track) -> TrackStats {
    let segments: Vec<SegmentStats> = track.segments.iter().map(analyze_segment).collect();

    let mut start: Option<DateTime<Utc>> = None;
    let mut end: Option<DateTime<Utc>> = None;
    let mut active_secs = 0.0;
    let mut max_speed: Option<f64> = None;
    let mut altitude = None;
    let mut heart_rate = None;
    for seg in &segments {
        if let Some(s) = seg.start {
            start = Some(start.map_or(s, |cur| cur.min(s)));
        }
        if let Some(e) = seg.end {
            end = Some(end.map_or(e, |cur| cur.max(e)));
        }
        active_secs += seg.duration_secs;
        if let Some(speed) = seg.max_speed_kmh {
            max_speed = Some(max_speed.map_or(speed, |cur| cur.max(speed)));
        }
        Bounds::merge(&mut altitude, seg.altitude);
        HeartRateStats::merge(&mut heart_rate, seg.heart_rate);
    }

    let distance_m = path_distance(track.waypoints());
    let average_speed_kmh = distance_m
        .filter(|_| active_secs > 0.0)
        .map(|d| d / active_secs * MPS_TO_KMH);
    let pace = distance_m.and_then(|d| Pace::from_totals(active_secs, d));

    TrackStats {
        start,
        end,
        active_secs,
        distance_m,
        average_speed_kmh,
        max_speed_kmh: max_speed,
        pace,
        altitude,
        heart_rate,
        segments,
    }
}

pub fn analyze_segment(segment: &TrackSegment) -> SegmentStats {
    let duration_secs = match (segment.start, segment.end) {
        (Some(s), Some(e)) => seconds_between(s, e),
        _ => 0.0,
    };

    let mut window = SpeedWindow::default();
    let mut max_speed: Option<f64> = None;
    let mut altitude = None;
    for waypoint in &segment.waypoints {
        if let Some(alt) = waypoint.altitude {
            Bounds::widen(&mut altitude, alt);
        }
    }
    for pair in segment.waypoints.windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);
        let (Some(t0), Some(t1)) = (prev.time, cur.time) else {
            continue;
        };
        if let Some(speed) = window.push(step_distance(prev, cur), seconds_between(t0, t1)) {
            max_speed = Some(max_speed.map_or(speed, |m| m.max(speed)));
        }
    }

    let mut heart_rate = None;
    for sample in &segment.heart_rates {
        HeartRateStats::add(&mut heart_rate, sample.bpm);
    }

    let distance_m = path_distance(segment.waypoints.iter());
    let average_speed_kmh = distance_m
        .filter(|_| duration_secs > 0.0)
        .map(|d| d / duration_secs * MPS_TO_KMH);

    SegmentStats {
        start: segment.start,
        end: segment.end,
        duration_secs,
        distance_m,
        average_speed_kmh,
        max_speed_kmh: max_speed,
        altitude,
        heart_rate,
    }
}

/// Sum of consecutive great-circle distances, `None` for an empty path.
pub fn path_distance<'a>(waypoints: impl IntoIterator<Item = &'a Waypoint>) -> Option<f64> {
    let mut iter = waypoints.into_iter();
    let mut prev = iter.next()?;
    let mut total = 0.0;
    for cur in iter {
        total += step_distance(prev, cur);
        prev = cur;
    }
    Some(total)
}

fn step_distance(a: &Waypoint, b: &Waypoint) -> f64 {
    distance_between(a.latitude, a.longitude, b.latitude, b.longitude)
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}
