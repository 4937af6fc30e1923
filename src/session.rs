//! Recording session: turns live location and heart-rate samples into a
//! persisted track.
//!
//! Everything runs on the caller's event loop. The autosave timer is a
//! deferred one-shot callback on that same loop, so it never overlaps with
//! `add_point` / `add_heart_rate` and no locking is involved.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use instant::Instant;

use crate::analyzer::SpeedWindow;
use crate::config::SessionConfig;
use crate::error::GpxError;
use crate::geo::distance_between;
use crate::model::{HeartRateSample, PointKind, Waypoint};
use crate::storage::{GpxDocument, ParentKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Stopped,
    Started,
    Paused,
}

/// A location fix from the GPS stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub time: DateTime<Utc>,
}

/// Distance and time from the previously recorded point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Step {
    pub distance_m: f64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordedPoint {
    pub sample: LocationSample,
    pub kind: PointKind,
    /// `None` for the first point after the session (re)started.
    pub step: Option<Step>,
}

/// One-shot timer provided by the event loop.
///
/// After `arm`, the loop must call [`TrackSession::on_autosave_timer`] once
/// the delay has elapsed, unless `disarm` was called first.
pub trait AutosaveTimer {
    fn arm(&mut self, after: Duration);
    fn disarm(&mut self);
}

/// Timer for loops that poll: see [`TrackSession::poll_autosave`].
#[derive(Debug, Clone, Default)]
pub struct DeadlineTimer {
    deadline: Option<Instant>,
}

impl DeadlineTimer {
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

impl AutosaveTimer for DeadlineTimer {
    fn arm(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    fn disarm(&mut self) {
        self.deadline = None;
    }
}

#[derive(Debug)]
pub struct TrackSession<T: AutosaveTimer = DeadlineTimer> {
    state: SessionState,
    config: SessionConfig,
    document: GpxDocument,
    current_track_id: Option<u32>,
    points: Vec<RecordedPoint>,
    heart_rates: Vec<HeartRateSample>,
    travelled_distance: f64,
    elapsed_time: Duration,
    last_location: Option<LocationSample>,
    last_sample_time: Option<DateTime<Utc>>,
    speed_window: SpeedWindow,
    timer: T,
    autosave_pending: bool,
}

impl TrackSession<DeadlineTimer> {
    pub fn with_deadline_timer(document: GpxDocument, config: SessionConfig) -> Self {
        Self::new(document, config, DeadlineTimer::default())
    }

    /// Flushes the document if the autosave deadline has passed. Returns
    /// whether a flush happened.
    pub fn poll_autosave(&mut self, now: Instant) -> Result<bool, GpxError> {
        if !self.timer.is_due(now) {
            return Ok(false);
        }
        self.timer.disarm();
        self.on_autosave_timer()?;
        Ok(true)
    }
}

impl<T: AutosaveTimer> TrackSession<T> {
    pub fn new(document: GpxDocument, config: SessionConfig, timer: T) -> Self {
        Self {
            state: SessionState::Stopped,
            config,
            document,
            current_track_id: None,
            points: Vec::new(),
            heart_rates: Vec::new(),
            travelled_distance: 0.0,
            elapsed_time: Duration::ZERO,
            last_location: None,
            last_sample_time: None,
            speed_window: SpeedWindow::default(),
            timer,
            autosave_pending: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn current_track_id(&self) -> Option<u32> {
        self.current_track_id
    }

    /// Points recorded since the last `clear`, in arrival order.
    pub fn points(&self) -> &[RecordedPoint] {
        &self.points
    }

    pub fn heart_rates(&self) -> &[HeartRateSample] {
        &self.heart_rates
    }

    /// Meters travelled while started.
    pub fn travelled_distance(&self) -> f64 {
        self.travelled_distance
    }

    pub fn elapsed_time(&self) -> Duration {
        self.elapsed_time
    }

    /// Smoothed speed over the last few points, in km/h.
    pub fn current_speed(&self) -> Option<f64> {
        self.speed_window.speed()
    }

    /// Travelled distance over elapsed time, in km/h.
    pub fn average_speed(&self) -> Option<f64> {
        let secs = self.elapsed_time.as_secs_f64();
        (secs > 0.0).then(|| self.travelled_distance / secs * 3.6)
    }

    pub fn document(&self) -> &GpxDocument {
        &self.document
    }

    pub fn set_output_path(&mut self, path: impl Into<PathBuf>) {
        self.document.set_path(path);
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    pub fn autosave_pending(&self) -> bool {
        self.autosave_pending
    }

    pub fn add_point(&mut self, sample: LocationSample) -> &RecordedPoint {
        let kind = self.enter_started();
        self.accrue_time(sample.time);

        let step = self.last_location.map(|prev| Step {
            distance_m: distance_between(
                prev.latitude,
                prev.longitude,
                sample.latitude,
                sample.longitude,
            ),
            elapsed: (sample.time - prev.time).to_std().unwrap_or_default(),
        });
        if let Some(step) = step {
            self.travelled_distance += step.distance_m;
            self.speed_window
                .push(step.distance_m, step.elapsed.as_secs_f64());
        }
        self.last_location = Some(sample);

        let mut waypoint = Waypoint::new(sample.latitude, sample.longitude, kind).with_time(sample.time);
        waypoint.altitude = sample.altitude;
        self.store(|document, track_id| document.add_waypoint(&waypoint, track_id));

        self.points.push(RecordedPoint { sample, kind, step });
        &self.points[self.points.len() - 1]
    }

    pub fn add_heart_rate(&mut self, time: DateTime<Utc>, bpm: u32) {
        let kind = self.enter_started();
        self.accrue_time(time);

        let sample = HeartRateSample { time, bpm };
        self.store(|document, track_id| document.add_heart_rate(kind, track_id, &sample));
        self.heart_rates.push(sample);
    }

    pub fn pause(&mut self) {
        if self.state != SessionState::Started {
            tracing::debug!(state = ?self.state, "pause ignored");
            return;
        }
        self.state = SessionState::Paused;
        self.reset_run();
        tracing::debug!(track = ?self.current_track_id, "session paused");
    }

    /// Ends recording and writes the document. A stopped session is left
    /// untouched.
    pub fn stop(&mut self) -> Result<(), GpxError> {
        if self.state == SessionState::Stopped {
            return Ok(());
        }
        self.state = SessionState::Stopped;
        self.reset_run();
        if self.autosave_pending {
            self.timer.disarm();
            self.autosave_pending = false;
        }
        tracing::debug!(track = ?self.current_track_id, "session stopped");
        self.document.write()
    }

    /// Forgets recorded points and accumulators. With `discard_document` the
    /// document is replaced by an empty one without an output path.
    pub fn clear(&mut self, discard_document: bool) -> Result<(), GpxError> {
        if self.state != SessionState::Stopped {
            return Err(GpxError::SessionActive);
        }
        self.points.clear();
        self.heart_rates.clear();
        self.travelled_distance = 0.0;
        self.elapsed_time = Duration::ZERO;
        self.current_track_id = None;
        self.reset_run();
        if self.autosave_pending {
            self.timer.disarm();
            self.autosave_pending = false;
        }
        if discard_document {
            self.document = GpxDocument::new(self.config.gpx.clone());
        }
        Ok(())
    }

    /// Called by the event loop when the armed autosave timer fires.
    pub fn on_autosave_timer(&mut self) -> Result<(), GpxError> {
        if !self.autosave_pending {
            return Ok(());
        }
        self.autosave_pending = false;
        self.document.write()
    }

    /// Writes the document now, cancelling any pending autosave.
    pub fn flush(&mut self) -> Result<(), GpxError> {
        if self.autosave_pending {
            self.timer.disarm();
            self.autosave_pending = false;
        }
        self.document.write()
    }

    pub fn set_track_details(&mut self, name: Option<&str>, comment: Option<&str>) -> bool {
        match self.current_track_id {
            Some(id) => self.document.set_details(ParentKind::Track, id, name, comment),
            None => false,
        }
    }

    /// Moves into `Started` and returns the kind the incoming sample gets.
    fn enter_started(&mut self) -> PointKind {
        let kind = match self.state {
            SessionState::Stopped => PointKind::TrackStart,
            SessionState::Paused => PointKind::SegmentStart,
            SessionState::Started => PointKind::Track,
        };
        if self.state != SessionState::Started {
            tracing::debug!(from = ?self.state, ?kind, "session started");
            self.state = SessionState::Started;
        }
        kind
    }

    fn accrue_time(&mut self, time: DateTime<Utc>) {
        if let Some(last) = self.last_sample_time {
            if let Ok(delta) = (time - last).to_std() {
                self.elapsed_time += delta;
            }
        }
        if self.last_sample_time.is_none_or(|last| time > last) {
            self.last_sample_time = Some(time);
        }
    }

    fn store(&mut self, add: impl FnOnce(&mut GpxDocument, Option<u32>) -> Option<u32>) {
        match add(&mut self.document, self.current_track_id) {
            Some(id) => self.current_track_id = Some(id),
            None => {
                tracing::warn!(track = ?self.current_track_id, "sample not stored in document");
                return;
            }
        }
        if !self.autosave_pending {
            self.timer.arm(self.config.autosave_interval());
            self.autosave_pending = true;
        }
    }

    fn reset_run(&mut self) {
        self.last_location = None;
        self.last_sample_time = None;
        self.speed_window.clear();
    }
}
