//! Streaming GPX reader.
//!
//! The document is walked as an explicit state machine over quick-xml events.
//! Each recognized construct is handed to a caller-supplied handler as a
//! borrowed [`ParseEvent`] that lives only for the duration of the call, so
//! memory stays bounded regardless of file size.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use quick_xml::Reader;
use quick_xml::events::{BytesRef, BytesStart, Event};

use crate::config::GpxConfig;
use crate::error::{FieldIssue, GpxError};
use crate::model::{HeartRateSample, PointKind, Route, Track, TrackSegment, Waypoint};
use crate::time::parse_time;
use crate::xml_tree::{attribute_value, push_general_ref};

type Result<T> = std::result::Result<T, GpxError>;

/// Metadata of a <trk>, complete by the time its first segment starts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackHeader {
    /// `None` when <number> is missing or not a number.
    pub id: Option<u32>,
    pub name: Option<String>,
    pub comment: Option<String>,
}

/// One recognized construct. Borrowed data is only valid inside the handler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParseEvent<'a> {
    /// Fired once per track, at its first segment boundary.
    Track(&'a TrackHeader),
    /// Fired at every <trkseg>; `index` counts segments within the track.
    TrackSegment { index: usize },
    Waypoint(&'a Waypoint),
    HeartRate {
        kind: PointKind,
        sample: &'a HeartRateSample,
    },
}

/// Result of a parse that reached the end of input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Ok,
    /// Some fields were malformed and replaced by "unknown"; everything else
    /// was delivered.
    PartiallyOk(Vec<FieldIssue>),
}

impl ParseOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, ParseOutcome::Ok)
    }

    pub fn issues(&self) -> &[FieldIssue] {
        match self {
            ParseOutcome::Ok => &[],
            ParseOutcome::PartiallyOk(issues) => issues,
        }
    }
}

/// Shared flag that stops a running parse at the next XML event.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GpxParser {
    config: GpxConfig,
    cancel: Option<CancelToken>,
}

impl GpxParser {
    pub fn new(config: GpxConfig) -> Self {
        Self {
            config,
            cancel: None,
        }
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn parse_file<F>(&self, path: impl AsRef<Path>, handler: F) -> Result<ParseOutcome>
    where
        F: FnMut(ParseEvent<'_>),
    {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| GpxError::file(path, e))?;
        self.parse_reader(BufReader::new(file), handler)
    }

    pub fn parse_str<F>(&self, xml: &str, handler: F) -> Result<ParseOutcome>
    where
        F: FnMut(ParseEvent<'_>),
    {
        self.parse_reader(xml.as_bytes(), handler)
    }

    pub fn parse_reader<R, F>(&self, source: R, handler: F) -> Result<ParseOutcome>
    where
        R: BufRead,
        F: FnMut(ParseEvent<'_>),
    {
        let mut reader = Reader::from_reader(source);
        let mut buf = Vec::new();
        let mut machine = Machine::new(self.config.ignore_time_zone, handler);

        loop {
            if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                tracing::debug!(position = reader.buffer_position() as u64, "parse cancelled");
                return Err(GpxError::Cancelled);
            }
            let event = reader.read_event_into(&mut buf).map_err(|source| GpxError::Xml {
                position: reader.buffer_position() as u64,
                source,
            })?;
            match event {
                Event::Start(e) => machine.start(&e)?,
                Event::Empty(e) => {
                    machine.start(&e)?;
                    machine.end();
                }
                Event::End(_) => machine.end(),
                Event::Text(e) => machine.text(e.as_ref()),
                Event::CData(e) => machine.text(e.as_ref()),
                Event::GeneralRef(e) => machine.general_ref(&e),
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        machine.finish()
    }

    /// Parses a whole file into owned tracks.
    pub fn read_tracks_file(&self, path: impl AsRef<Path>) -> Result<(Vec<Track>, ParseOutcome)> {
        let mut collector = TrackCollector::default();
        let outcome = self.parse_file(path, |event| collector.handle(event))?;
        Ok((collector.into_tracks(), outcome))
    }

    pub fn read_tracks_str(&self, xml: &str) -> Result<(Vec<Track>, ParseOutcome)> {
        let mut collector = TrackCollector::default();
        let outcome = self.parse_str(xml, |event| collector.handle(event))?;
        Ok((collector.into_tracks(), outcome))
    }
}

/// Builds owned [`Track`]s from parse events.
#[derive(Debug, Default)]
pub struct TrackCollector {
    tracks: Vec<Track>,
}

impl TrackCollector {
    pub fn handle(&mut self, event: ParseEvent<'_>) {
        match event {
            ParseEvent::Track(header) => {
                let mut track = Track::new(header.id);
                track.name = header.name.clone();
                track.comment = header.comment.clone();
                self.tracks.push(track);
            }
            ParseEvent::TrackSegment { .. } => {
                if let Some(track) = self.tracks.last_mut() {
                    track.segments.push(TrackSegment::default());
                }
            }
            ParseEvent::Waypoint(waypoint) => {
                if let Some(segment) = self.current_segment() {
                    segment.push_waypoint(waypoint.clone());
                }
            }
            ParseEvent::HeartRate { sample, .. } => {
                if let Some(segment) = self.current_segment() {
                    segment.push_heart_rate(*sample);
                }
            }
        }
    }

    fn current_segment(&mut self) -> Option<&mut TrackSegment> {
        self.tracks.last_mut()?.segments.last_mut()
    }

    pub fn into_tracks(self) -> Vec<Track> {
        self.tracks
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    DocStart,
    InRoot,
    InTrack,
    InTrackName,
    InTrackComment,
    InTrackNumber,
    InTrackSegment,
    InTrackWaypoint,
    InWaypointAltitude,
    InWaypointTime,
    InTrackSegmentExtensions,
    InHeartRateList,
    InHeartRate,
    InRoute,
    InRouteNumber,
    InRoutePoint,
    /// Inside an unrecognized subtree; see `Machine::unknown_depth`.
    InUnknown,
    DocEnd,
    UnrecoverableError,
}

impl State {
    /// Element whose text content this state gathers.
    fn text_element(self) -> Option<&'static str> {
        match self {
            State::InTrackName => Some("name"),
            State::InTrackComment => Some("cmt"),
            State::InTrackNumber | State::InRouteNumber => Some("number"),
            State::InWaypointAltitude => Some("ele"),
            State::InWaypointTime => Some("time"),
            _ => None,
        }
    }

    fn collects_text(self) -> bool {
        self.text_element().is_some()
    }
}

struct Machine<F> {
    state: State,
    unknown_depth: u32,
    resume_state: State,
    ignore_time_zone: bool,
    text: String,
    header: TrackHeader,
    track_announced: bool,
    segment_index: usize,
    points_in_track: usize,
    heart_rates_in_track: usize,
    point_kind: PointKind,
    heart_rate_kind: PointKind,
    waypoint: Option<Waypoint>,
    heart_rate: Option<HeartRateSample>,
    route: Route,
    route_point: Option<Waypoint>,
    issues: Vec<FieldIssue>,
    handler: F,
}

impl<F> Machine<F>
where
    F: FnMut(ParseEvent<'_>),
{
    fn new(ignore_time_zone: bool, handler: F) -> Self {
        Self {
            state: State::DocStart,
            unknown_depth: 0,
            resume_state: State::DocStart,
            ignore_time_zone,
            text: String::new(),
            header: TrackHeader::default(),
            track_announced: false,
            segment_index: 0,
            points_in_track: 0,
            heart_rates_in_track: 0,
            point_kind: PointKind::TrackStart,
            heart_rate_kind: PointKind::TrackStart,
            waypoint: None,
            heart_rate: None,
            route: Route::default(),
            route_point: None,
            issues: Vec::new(),
            handler,
        }
    }

    fn start(&mut self, e: &BytesStart<'_>) -> Result<()> {
        let local = e.local_name();
        let local = local.as_ref();
        let next = match (self.state, local) {
            (State::DocStart, b"gpx") => State::InRoot,
            (State::DocStart, other) => {
                self.state = State::UnrecoverableError;
                return Err(GpxError::FileFormat {
                    found: String::from_utf8_lossy(other).into_owned(),
                });
            }
            (State::InUnknown, _) => {
                self.unknown_depth += 1;
                return Ok(());
            }
            (State::InRoot, b"trk") => {
                self.begin_track();
                State::InTrack
            }
            (State::InRoot, b"rte") => {
                self.route = Route::default();
                self.route_point = None;
                State::InRoute
            }
            (State::InTrack, b"name") => State::InTrackName,
            (State::InTrack, b"cmt") => State::InTrackComment,
            (State::InTrack, b"number") => State::InTrackNumber,
            (State::InTrack, b"trkseg") => {
                self.begin_segment();
                State::InTrackSegment
            }
            (State::InTrackSegment, b"trkpt") => match parse_lat_lon(e) {
                Ok((lat, lon)) => {
                    self.waypoint = Some(Waypoint::new(lat, lon, self.point_kind));
                    State::InTrackWaypoint
                }
                Err(issue) => {
                    self.record(issue);
                    self.enter_unknown();
                    return Ok(());
                }
            },
            (State::InTrackSegment, b"extensions") => State::InTrackSegmentExtensions,
            (State::InTrackWaypoint, b"ele") => State::InWaypointAltitude,
            (State::InTrackWaypoint, b"time") => State::InWaypointTime,
            (State::InTrackSegmentExtensions, b"hbtlist") => State::InHeartRateList,
            (State::InHeartRateList, b"hbt") => {
                self.heart_rate = self.parse_heart_rate(e);
                State::InHeartRate
            }
            (State::InRoute, b"number") => State::InRouteNumber,
            (State::InRoute, b"rtept") => {
                match parse_lat_lon(e) {
                    Ok((lat, lon)) => {
                        let kind = if self.route.waypoints.is_empty() {
                            PointKind::RouteStart
                        } else {
                            PointKind::Route
                        };
                        self.route_point = Some(Waypoint::new(lat, lon, kind));
                    }
                    Err(issue) => self.record(issue),
                }
                State::InRoutePoint
            }
            _ => {
                self.enter_unknown();
                return Ok(());
            }
        };
        if next.collects_text() {
            self.text.clear();
        }
        self.state = next;
        Ok(())
    }

    fn end(&mut self) {
        self.state = match self.state {
            State::InUnknown => {
                self.unknown_depth -= 1;
                if self.unknown_depth > 0 {
                    return;
                }
                self.resume_state
            }
            State::InRoot => State::DocEnd,
            State::InTrack => State::InRoot,
            State::InTrackName => {
                self.header.name = Some(self.text.trim().to_string());
                State::InTrack
            }
            State::InTrackComment => {
                self.header.comment = Some(self.text.trim().to_string());
                State::InTrack
            }
            State::InTrackNumber => {
                self.header.id = self.parse_number("number");
                State::InTrack
            }
            State::InTrackSegment => State::InTrack,
            State::InTrackWaypoint => {
                if let Some(waypoint) = self.waypoint.take() {
                    (self.handler)(ParseEvent::Waypoint(&waypoint));
                    self.points_in_track += 1;
                    self.point_kind = PointKind::Track;
                }
                State::InTrackSegment
            }
            State::InWaypointAltitude => {
                let altitude = self.parse_float("ele");
                if let Some(waypoint) = self.waypoint.as_mut() {
                    waypoint.altitude = altitude;
                }
                State::InTrackWaypoint
            }
            State::InWaypointTime => {
                let time = parse_time(&self.text, self.ignore_time_zone);
                if time.is_none() {
                    self.record(FieldIssue::new("time", self.text.clone()));
                }
                if let Some(waypoint) = self.waypoint.as_mut() {
                    waypoint.time = time;
                }
                State::InTrackWaypoint
            }
            State::InTrackSegmentExtensions => State::InTrackSegment,
            State::InHeartRateList => State::InTrackSegmentExtensions,
            State::InHeartRate => {
                if let Some(sample) = self.heart_rate.take() {
                    (self.handler)(ParseEvent::HeartRate {
                        kind: self.heart_rate_kind,
                        sample: &sample,
                    });
                    self.heart_rates_in_track += 1;
                    self.heart_rate_kind = PointKind::Track;
                }
                State::InHeartRateList
            }
            State::InRoute => {
                // Routes are read to keep the document walk in step but are not
                // delivered to the handler.
                let route = std::mem::take(&mut self.route);
                tracing::trace!(id = ?route.id, points = route.waypoints.len(), "skipping route");
                State::InRoot
            }
            State::InRouteNumber => {
                self.route.id = self.parse_number("number");
                State::InRoute
            }
            State::InRoutePoint => {
                if let Some(point) = self.route_point.take() {
                    self.route.waypoints.push(point);
                }
                State::InRoute
            }
            State::DocStart | State::DocEnd | State::UnrecoverableError => self.state,
        };
    }

    fn text(&mut self, raw: &[u8]) {
        let Some(element) = self.state.text_element() else {
            return;
        };
        match std::str::from_utf8(raw) {
            Ok(text) => self.text.push_str(text),
            Err(_) => {
                let text = String::from_utf8_lossy(raw).into_owned();
                self.text.push_str(&text);
                self.record(FieldIssue::new(element, text));
            }
        }
    }

    fn general_ref(&mut self, reference: &BytesRef<'_>) {
        if self.state.collects_text() {
            push_general_ref(&mut self.text, reference);
        }
    }

    fn finish(mut self) -> Result<ParseOutcome> {
        match self.state {
            State::DocStart => {
                return Err(GpxError::FileFormat {
                    found: String::new(),
                });
            }
            State::DocEnd => {}
            state => {
                tracing::warn!(?state, "document ended before </gpx>");
                self.record(FieldIssue::new("gpx", "unexpected end of document"));
            }
        }
        if self.issues.is_empty() {
            Ok(ParseOutcome::Ok)
        } else {
            Ok(ParseOutcome::PartiallyOk(self.issues))
        }
    }

    fn enter_unknown(&mut self) {
        self.resume_state = self.state;
        self.unknown_depth = 1;
        self.state = State::InUnknown;
    }

    fn begin_track(&mut self) {
        self.header = TrackHeader::default();
        self.track_announced = false;
        self.segment_index = 0;
        self.points_in_track = 0;
        self.heart_rates_in_track = 0;
    }

    fn begin_segment(&mut self) {
        if !self.track_announced {
            (self.handler)(ParseEvent::Track(&self.header));
            self.track_announced = true;
        }
        (self.handler)(ParseEvent::TrackSegment {
            index: self.segment_index,
        });
        self.segment_index += 1;
        self.point_kind = opening_kind(self.points_in_track);
        self.heart_rate_kind = opening_kind(self.heart_rates_in_track);
    }

    fn parse_number(&mut self, element: &'static str) -> Option<u32> {
        let parsed = self.text.trim().parse::<u32>().ok();
        if parsed.is_none() {
            self.record(FieldIssue::new(element, self.text.clone()));
        }
        parsed
    }

    fn parse_float(&mut self, element: &'static str) -> Option<f64> {
        let parsed = self.text.trim().parse::<f64>().ok();
        if parsed.is_none() {
            self.record(FieldIssue::new(element, self.text.clone()));
        }
        parsed
    }

    fn parse_heart_rate(&mut self, e: &BytesStart<'_>) -> Option<HeartRateSample> {
        let mut time = None;
        let mut bpm = None;
        for attr in e.attributes().flatten() {
            let value = attribute_value(&attr.value);
            match attr.key.local_name().as_ref() {
                b"time" => match parse_time(&value, self.ignore_time_zone) {
                    Some(t) => time = Some(t),
                    None => self.record(FieldIssue::new("hbt", value)),
                },
                b"value" => match value.trim().parse::<u32>() {
                    Ok(v) => bpm = Some(v),
                    Err(_) => self.record(FieldIssue::new("hbt", value)),
                },
                _ => {}
            }
        }
        Some(HeartRateSample {
            time: time?,
            bpm: bpm?,
        })
    }

    fn record(&mut self, issue: FieldIssue) {
        tracing::warn!(%issue, "recoverable GPX field error");
        self.issues.push(issue);
    }
}

fn opening_kind(delivered_in_track: usize) -> PointKind {
    if delivered_in_track == 0 {
        PointKind::TrackStart
    } else {
        PointKind::SegmentStart
    }
}

/// Parse lat/lon attributes from a point element's start tag.
fn parse_lat_lon(e: &BytesStart<'_>) -> std::result::Result<(f64, f64), FieldIssue> {
    let mut lat: Option<f64> = None;
    let mut lon: Option<f64> = None;

    for attr in e.attributes().flatten() {
        let val = attribute_value(&attr.value);
        match attr.key.local_name().as_ref() {
            b"lat" => {
                lat = Some(
                    val.trim()
                        .parse::<f64>()
                        .map_err(|_| FieldIssue::new("lat", val.clone()))?,
                );
            }
            b"lon" => {
                lon = Some(
                    val.trim()
                        .parse::<f64>()
                        .map_err(|_| FieldIssue::new("lon", val.clone()))?,
                );
            }
            _ => {}
        }
    }

    let lat = lat.ok_or_else(|| FieldIssue::new("lat", ""))?;
    let lon = lon.ok_or_else(|| FieldIssue::new("lon", ""))?;
    Ok((lat, lon))
}
