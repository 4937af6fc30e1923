use std::cell::OnceCell;

use chrono::{DateTime, Utc};

use crate::analyzer::TrackStats;

/// Role of a point inside the document.
///
/// The kind decides where a point is stored (new track, new segment, last
/// segment) and which recording-state transition produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointKind {
    /// First point of a new track; allocates a track id.
    TrackStart,
    /// First point after a pause; opens a new segment in the current track.
    SegmentStart,
    /// Ordinary point appended to the last segment of the current track.
    Track,
    /// First point of a new route; allocates a route id.
    RouteStart,
    /// Ordinary route point.
    Route,
}

impl PointKind {
    pub fn is_route(self) -> bool {
        matches!(self, PointKind::RouteStart | PointKind::Route)
    }

    /// Whether a point of this kind opens a new segment.
    pub fn opens_segment(self) -> bool {
        matches!(self, PointKind::TrackStart | PointKind::SegmentStart)
    }
}

/// A single geolocated sample (used for trkpt and rtept).
#[derive(Debug, Clone, PartialEq)]
pub struct Waypoint {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub time: Option<DateTime<Utc>>,
    pub kind: PointKind,
}

impl Waypoint {
    pub fn new(latitude: f64, longitude: f64, kind: PointKind) -> Self {
        Self {
            latitude,
            longitude,
            altitude: None,
            time: None,
            kind,
        }
    }

    pub fn with_altitude(mut self, altitude: f64) -> Self {
        self.altitude = Some(altitude);
        self
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }
}

/// One heart-rate reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartRateSample {
    pub time: DateTime<Utc>,
    pub bpm: u32,
}

/// A run of samples recorded without a pause in between (<trkseg>).
#[derive(Debug, Clone, Default)]
pub struct TrackSegment {
    pub waypoints: Vec<Waypoint>,
    pub heart_rates: Vec<HeartRateSample>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TrackSegment {
    pub fn push_waypoint(&mut self, waypoint: Waypoint) {
        if let Some(time) = waypoint.time {
            self.extend_time_range(time);
        }
        self.waypoints.push(waypoint);
    }

    pub fn push_heart_rate(&mut self, sample: HeartRateSample) {
        self.extend_time_range(sample.time);
        self.heart_rates.push(sample);
    }

    fn extend_time_range(&mut self, time: DateTime<Utc>) {
        if self.start.is_none_or(|start| time < start) {
            self.start = Some(time);
        }
        if self.end.is_none_or(|end| time > end) {
            self.end = Some(time);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty() && self.heart_rates.is_empty()
    }
}

/// A recorded activity (<trk>).
#[derive(Debug, Clone, Default)]
pub struct Track {
    /// Value of the <number> child; `None` when missing or malformed.
    pub id: Option<u32>,
    pub name: Option<String>,
    pub comment: Option<String>,
    pub segments: Vec<TrackSegment>,
    pub(crate) stats: OnceCell<TrackStats>,
}

impl Track {
    pub fn new(id: Option<u32>) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn waypoints(&self) -> impl Iterator<Item = &Waypoint> {
        self.segments.iter().flat_map(|s| s.waypoints.iter())
    }

    pub fn waypoint_count(&self) -> usize {
        self.segments.iter().map(|s| s.waypoints.len()).sum()
    }

    pub fn heart_rate_count(&self) -> usize {
        self.segments.iter().map(|s| s.heart_rates.len()).sum()
    }

    /// Drops memoized statistics after the segments were edited.
    pub fn invalidate_statistics(&mut self) {
        self.stats = OnceCell::new();
    }
}

/// A planned path (<rte>). Routes have no segments.
#[derive(Debug, Clone, Default)]
pub struct Route {
    pub id: Option<u32>,
    pub name: Option<String>,
    pub comment: Option<String>,
    pub waypoints: Vec<Waypoint>,
}
