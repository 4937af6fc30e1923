pub mod analyzer;
pub mod config;
pub mod error;
pub mod geo;
pub mod model;
pub mod parser;
pub mod session;
pub mod storage;
pub mod time;
pub mod xml_tree;

use serde::Serialize;
use wasm_bindgen::prelude::*;

pub use crate::analyzer::{SpeedWindow, TrackStats};
pub use crate::config::{AnalyzerOptions, GpxConfig, SessionConfig, UnitSystem};
pub use crate::error::{FieldIssue, GpxError};
pub use crate::model::{HeartRateSample, PointKind, Route, Track, TrackSegment, Waypoint};
pub use crate::parser::{CancelToken, GpxParser, ParseEvent, ParseOutcome};
pub use crate::session::{AutosaveTimer, LocationSample, SessionState, TrackSession};
pub use crate::storage::GpxDocument;

/// Statistics for every track of a GPX document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub tracks: Vec<TrackReport>,
    /// Fields that could not be read; empty for a clean parse.
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackReport {
    pub id: Option<u32>,
    pub name: Option<String>,
    pub comment: Option<String>,
    pub waypoint_count: usize,
    pub heart_rate_count: usize,
    pub stats: TrackStats,
}

/// Parses a GPX string and computes per-track statistics, with altitudes in
/// the requested unit system.
pub fn track_report(gpx_string: &str, opts: &AnalyzerOptions) -> Result<StatsReport, GpxError> {
    let (tracks, outcome) = GpxParser::new(opts.gpx_config()).read_tracks_str(gpx_string)?;
    let tracks = tracks
        .iter()
        .map(|track| TrackReport {
            id: track.id,
            name: track.name.clone(),
            comment: track.comment.clone(),
            waypoint_count: track.waypoint_count(),
            heart_rate_count: track.heart_rate_count(),
            stats: in_units(track.statistics(), opts.units),
        })
        .collect();
    Ok(StatsReport {
        tracks,
        issues: outcome.issues().iter().map(ToString::to_string).collect(),
    })
}

fn in_units(stats: &TrackStats, units: UnitSystem) -> TrackStats {
    let mut stats = stats.clone();
    stats.altitude = stats.altitude.map(|b| b.altitude_in(units));
    for segment in &mut stats.segments {
        segment.altitude = segment.altitude.map(|b| b.altitude_in(units));
    }
    stats
}

/// Compute GPX track statistics, returned as a JS object.
#[wasm_bindgen(js_name = gpxTrackStats)]
pub fn gpx_track_stats(gpx_string: &str, options: JsValue) -> Result<JsValue, JsValue> {
    console_error_panic_hook::set_once();

    let opts = parse_options(options)?;
    let report = track_report(gpx_string, &opts)?;
    serde_wasm_bindgen::to_value(&report).map_err(|e| JsValue::from_str(&e.to_string()))
}

/// Compute GPX track statistics, returned as a JSON string.
#[wasm_bindgen(js_name = gpxTrackStatsString)]
pub fn gpx_track_stats_string(gpx_string: &str, options: JsValue) -> Result<String, JsValue> {
    console_error_panic_hook::set_once();

    let opts = parse_options(options)?;
    let report = track_report(gpx_string, &opts)?;
    serde_json::to_string(&report).map_err(|e| JsValue::from_str(&e.to_string()))
}

fn parse_options(options: JsValue) -> Result<AnalyzerOptions, JsValue> {
    if options.is_undefined() || options.is_null() {
        Ok(AnalyzerOptions::default())
    } else {
        serde_wasm_bindgen::from_value(options).map_err(|e| JsValue::from_str(&e.to_string()))
    }
}
