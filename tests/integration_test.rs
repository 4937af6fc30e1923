use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use gpx_track_recorder::config::{AnalyzerOptions, GpxConfig, SessionConfig, UnitSystem};
use gpx_track_recorder::error::{FieldIssue, GpxError};
use gpx_track_recorder::model::{HeartRateSample, PointKind, Track, Waypoint};
use gpx_track_recorder::parser::{GpxParser, ParseEvent, ParseOutcome};
use gpx_track_recorder::session::{LocationSample, SessionState, TrackSession};
use gpx_track_recorder::storage::{GpxDocument, ParentKind};
use gpx_track_recorder::track_report;

fn fixture(path: &str) -> PathBuf {
    Path::new("tests/fixtures").join(path)
}

fn load_fixture(path: &str) -> String {
    std::fs::read_to_string(fixture(path)).unwrap()
}

fn read_tracks(path: &str) -> (Vec<Track>, ParseOutcome) {
    GpxParser::new(GpxConfig::default())
        .read_tracks_file(fixture(path))
        .unwrap()
}

fn issue(element: &'static str, value: &str) -> FieldIssue {
    FieldIssue {
        element,
        value: value.to_string(),
    }
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("gpx-track-recorder-it-{}-{name}", std::process::id()))
}

fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
}

#[derive(Debug, PartialEq)]
enum Seen {
    Track(Option<u32>),
    Segment(usize),
    Point(PointKind),
    HeartRate(PointKind, u32),
}

fn collect_events(xml: &str) -> (Vec<Seen>, ParseOutcome) {
    let mut seen = Vec::new();
    let outcome = GpxParser::new(GpxConfig::default())
        .parse_str(xml, |event| {
            seen.push(match event {
                ParseEvent::Track(header) => Seen::Track(header.id),
                ParseEvent::TrackSegment { index } => Seen::Segment(index),
                ParseEvent::Waypoint(w) => Seen::Point(w.kind),
                ParseEvent::HeartRate { kind, sample } => Seen::HeartRate(kind, sample.bpm),
            })
        })
        .unwrap();
    (seen, outcome)
}

// ---- parsing fixtures ----

#[test]
fn test_single_track_statistics() {
    let (tracks, outcome) = read_tracks("single_track.gpx");
    assert!(outcome.is_complete());
    assert_eq!(tracks.len(), 1);

    let track = &tracks[0];
    assert_eq!(track.id, Some(1));
    assert_eq!(track.name.as_deref(), Some("Morning run"));
    assert_eq!(track.comment.as_deref(), Some("Three points along the equator"));
    assert_eq!(track.waypoint_count(), 3);

    let stats = track.statistics();
    assert!((stats.distance_m.unwrap() - 20.0).abs() < 0.01);
    assert_eq!(stats.active_secs, 10.0);
    assert!(stats.average_speed_kmh.unwrap() > 0.0);
    assert!((stats.average_speed_kmh.unwrap() - 7.2).abs() < 0.01);
    let altitude = stats.altitude.unwrap();
    assert_eq!((altitude.min, altitude.max), (12.0, 14.5));
    assert!(stats.heart_rate.is_none());
}

#[test]
fn test_unknown_subtree_is_skipped() {
    let (seen, outcome) = collect_events(&load_fixture("unknown_extension.gpx"));
    assert_eq!(outcome, ParseOutcome::Ok);
    assert_eq!(
        seen,
        vec![
            Seen::Track(Some(4)),
            Seen::Segment(0),
            Seen::Point(PointKind::TrackStart),
            Seen::Point(PointKind::Track),
        ]
    );
}

#[test]
fn test_heart_rate_extensions() {
    let (seen, outcome) = collect_events(&load_fixture("heart_rate.gpx"));
    assert!(outcome.is_complete());
    assert_eq!(
        seen,
        vec![
            Seen::Track(Some(1)),
            Seen::Segment(0),
            Seen::Point(PointKind::TrackStart),
            Seen::Point(PointKind::Track),
            Seen::HeartRate(PointKind::TrackStart, 92),
            Seen::HeartRate(PointKind::Track, 118),
            Seen::Segment(1),
            Seen::Point(PointKind::SegmentStart),
            Seen::Point(PointKind::Track),
            Seen::HeartRate(PointKind::SegmentStart, 131),
        ]
    );

    let (tracks, _) = read_tracks("heart_rate.gpx");
    let stats = tracks[0].statistics();
    assert_eq!(stats.segments.len(), 2);
    // Two 10 s segments; the five-minute pause is not active time.
    assert_eq!(stats.active_secs, 20.0);
    let hr = stats.heart_rate.unwrap();
    assert_eq!((hr.min, hr.max, hr.count), (92, 131, 3));
}

#[test]
fn test_time_zone_handling() {
    let xml = load_fixture("heart_rate.gpx");
    let (tracks, _) = GpxParser::new(GpxConfig::default()).read_tracks_str(&xml).unwrap();
    assert_eq!(tracks[0].segments[0].waypoints[0].time, Some(at(8, 0, 0)));

    let wall_clock = GpxConfig {
        ignore_time_zone: true,
        ..Default::default()
    };
    let (tracks, _) = GpxParser::new(wall_clock).read_tracks_str(&xml).unwrap();
    assert_eq!(tracks[0].segments[0].waypoints[0].time, Some(at(10, 0, 0)));
    assert_eq!(tracks[0].segments[1].heart_rates[0].time, at(10, 5, 5));
}

#[test]
fn test_malformed_fields_are_partial() {
    let (tracks, outcome) = read_tracks("malformed_fields.gpx");
    assert_eq!(
        outcome.issues(),
        &[
            issue("number", "two"),
            issue("ele", "high"),
            issue("lat", "north"),
        ]
    );
    let track = &tracks[0];
    assert_eq!(track.id, None);
    assert_eq!(track.waypoint_count(), 2);
    let points: Vec<_> = track.waypoints().collect();
    assert_eq!(points[0].altitude, None);
    assert_eq!(points[1].altitude, Some(20.0));
}

#[test]
fn test_wrong_root_is_unrecoverable() {
    let mut events = 0;
    let result = GpxParser::new(GpxConfig::default())
        .parse_file(fixture("not_gpx.xml"), |_| events += 1);
    assert!(matches!(result, Err(GpxError::FileFormat { found }) if found == "kml"));
    assert_eq!(events, 0);

    assert!(matches!(
        GpxDocument::open(fixture("not_gpx.xml"), GpxConfig::default()),
        Err(GpxError::FileFormat { .. })
    ));
}

#[test]
fn test_missing_file() {
    let result = GpxParser::new(GpxConfig::default()).read_tracks_file(fixture("missing.gpx"));
    assert!(matches!(result, Err(GpxError::File { .. })));
}

// ---- writing ----

#[test]
fn test_document_round_trip() {
    let mut doc = GpxDocument::new(GpxConfig::default());
    let id = doc
        .add_waypoint(
            &Waypoint::new(60.1699, 24.9384, PointKind::TrackStart)
                .with_altitude(15.25)
                .with_time(at(9, 0, 0)),
            None,
        )
        .unwrap();
    doc.add_waypoint(
        &Waypoint::new(60.17, 24.9385, PointKind::Track).with_time(at(9, 0, 4)),
        Some(id),
    );
    doc.add_heart_rate(
        PointKind::Track,
        Some(id),
        &HeartRateSample {
            time: at(9, 0, 2),
            bpm: 101,
        },
    );
    doc.add_waypoint(
        &Waypoint::new(60.1702, 24.9387, PointKind::SegmentStart).with_time(at(9, 10, 0)),
        Some(id),
    );
    assert!(doc.set_details(
        ParentKind::Track,
        id,
        Some("Harbour & back"),
        None,
    ));

    let mut out = Vec::new();
    doc.write_to(&mut out).unwrap();
    let xml = String::from_utf8(out).unwrap();

    let (tracks, outcome) = GpxParser::new(GpxConfig::default()).read_tracks_str(&xml).unwrap();
    assert!(outcome.is_complete());
    assert_eq!(tracks.len(), 1);
    let track = &tracks[0];
    assert_eq!(track.id, Some(id));
    assert_eq!(track.name.as_deref(), Some("Harbour & back"));
    assert_eq!(track.segments.len(), 2);

    let first = &track.segments[0];
    assert_eq!(first.waypoints.len(), 2);
    assert_eq!(first.waypoints[0].latitude, 60.1699);
    assert_eq!(first.waypoints[0].longitude, 24.9384);
    assert_eq!(first.waypoints[0].altitude, Some(15.25));
    assert_eq!(first.waypoints[0].time, Some(at(9, 0, 0)));
    assert_eq!(first.waypoints[1].time, Some(at(9, 0, 4)));
    assert_eq!(
        first.heart_rates,
        vec![HeartRateSample {
            time: at(9, 0, 2),
            bpm: 101
        }]
    );
    assert_eq!(track.segments[1].waypoints[0].kind, PointKind::SegmentStart);
}

#[test]
fn test_session_recording_round_trip() {
    let path = temp_path("session.gpx");
    let mut session = TrackSession::with_deadline_timer(
        GpxDocument::new(GpxConfig::default()),
        SessionConfig::default(),
    );
    session.set_output_path(&path);

    let sample = |lon: f64, time| LocationSample {
        latitude: 0.0,
        longitude: lon,
        altitude: Some(3.0),
        time,
    };
    session.add_point(sample(0.0, at(7, 0, 0)));
    session.add_heart_rate(at(7, 0, 1), 90);
    session.add_point(sample(0.0000899322, at(7, 0, 5)));
    session.pause();
    session.add_point(sample(0.0001798643, at(7, 3, 0)));
    session.add_point(sample(0.0002697965, at(7, 3, 5)));
    session.stop().unwrap();
    assert_eq!(session.state(), SessionState::Stopped);
    assert!((session.travelled_distance() - 20.0).abs() < 0.01);
    assert_eq!(session.elapsed_time().as_secs(), 10);

    let (tracks, outcome) = GpxParser::new(GpxConfig::default())
        .read_tracks_file(&path)
        .unwrap();
    std::fs::remove_file(&path).unwrap();

    assert!(outcome.is_complete());
    assert_eq!(tracks.len(), 1);
    let track = &tracks[0];
    assert_eq!(track.id, session.current_track_id());
    assert_eq!(track.segments.len(), 2);
    assert_eq!(track.waypoint_count(), 4);
    assert_eq!(track.heart_rate_count(), 1);
    // Track distance spans the pause; only the recorded run is session distance.
    assert!((track.statistics().distance_m.unwrap() - 30.0).abs() < 0.01);
}

#[test]
fn test_reopen_and_rewrite_keeps_details() {
    let path = temp_path("details.gpx");
    let mut doc = GpxDocument::new(GpxConfig::default());
    doc.set_path(&path);
    let id = doc
        .add_waypoint(
            &Waypoint::new(60.0, 24.0, PointKind::TrackStart).with_time(at(6, 0, 0)),
            None,
        )
        .unwrap();
    doc.set_details(ParentKind::Track, id, Some("Tom & 'Jerry'"), Some("<x> & y"));
    doc.write().unwrap();

    // Same-file resume: load, save unchanged, load again.
    GpxDocument::open(&path, GpxConfig::default())
        .unwrap()
        .write()
        .unwrap();
    let (tracks, outcome) = GpxParser::new(GpxConfig::default())
        .read_tracks_file(&path)
        .unwrap();
    std::fs::remove_file(&path).unwrap();

    assert!(outcome.is_complete());
    assert_eq!(tracks[0].name.as_deref(), Some("Tom & 'Jerry'"));
    assert_eq!(tracks[0].comment.as_deref(), Some("<x> & y"));
    assert_eq!(tracks[0].waypoint_count(), 1);
}

#[test]
fn test_open_existing_document_reuses_free_ids() {
    let path = temp_path("resume.gpx");
    std::fs::copy(fixture("resume.gpx"), &path).unwrap();

    let mut doc = GpxDocument::open(&path, GpxConfig::default()).unwrap();
    assert_eq!(doc.track_ids().iter().collect::<Vec<_>>(), vec![1, 3]);
    assert_eq!(doc.route_ids().iter().collect::<Vec<_>>(), vec![1]);

    let track_id = doc.add_waypoint(
        &Waypoint::new(60.3, 24.7, PointKind::TrackStart).with_time(at(12, 0, 0)),
        None,
    );
    assert_eq!(track_id, Some(2));
    let route_id = doc.add_waypoint(&Waypoint::new(60.0, 24.0, PointKind::RouteStart), None);
    assert_eq!(route_id, Some(2));
    doc.write().unwrap();

    let (tracks, outcome) = GpxParser::new(GpxConfig::default())
        .read_tracks_file(&path)
        .unwrap();
    std::fs::remove_file(&path).unwrap();

    assert!(outcome.is_complete());
    let ids: Vec<_> = tracks.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![Some(1), Some(3), Some(2)]);
    assert_eq!(tracks[0].name.as_deref(), Some("First"));
    assert_eq!(tracks[1].name.as_deref(), Some("Third"));
}

// ---- wasm-facing report ----

#[test]
fn test_track_report_units() {
    let gpx = load_fixture("single_track.gpx");

    let metric = track_report(&gpx, &AnalyzerOptions::default()).unwrap();
    assert!(metric.issues.is_empty());
    assert_eq!(metric.tracks.len(), 1);
    assert_eq!(metric.tracks[0].waypoint_count, 3);
    assert_eq!(metric.tracks[0].stats.altitude.unwrap().max, 14.5);

    let imperial = AnalyzerOptions {
        units: UnitSystem::Imperial,
        ..Default::default()
    };
    let report = track_report(&gpx, &imperial).unwrap();
    let feet = report.tracks[0].stats.altitude.unwrap();
    assert!((feet.min - 39.370_078_74).abs() < 1e-6);
    assert!((report.tracks[0].stats.segments[0].altitude.unwrap().max - 47.572_178_48).abs() < 1e-6);
    // Distance stays metric.
    assert!((report.tracks[0].stats.distance_m.unwrap() - 20.0).abs() < 0.01);
}

#[test]
fn test_track_report_json() {
    let report = track_report(&load_fixture("malformed_fields.gpx"), &AnalyzerOptions::default()).unwrap();
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["issues"].as_array().unwrap().len(), 3);
    assert_eq!(json["issues"][0], "Invalid value 'two' in <number>");
    assert!(json["tracks"][0]["id"].is_null());
    assert_eq!(json["tracks"][0]["waypointCount"], 2);
    assert!(json["tracks"][0]["stats"]["distanceM"].is_number());
}
