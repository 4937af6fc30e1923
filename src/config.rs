use std::time::Duration;

use serde::Deserialize;

/// Settings shared by the GPX reader and writer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpxConfig {
    /// Value of the `creator` attribute on written documents
    #[serde(default = "default_creator")]
    pub creator: String,

    /// Write timestamps without an offset and read them as wall-clock UTC (default: false)
    #[serde(default)]
    pub ignore_time_zone: bool,
}

impl Default for GpxConfig {
    fn default() -> Self {
        Self {
            creator: default_creator(),
            ignore_time_zone: false,
        }
    }
}

/// Settings for a recording session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Seconds between the first unsaved change and the autosave flush (default: 30)
    #[serde(default = "default_autosave_interval")]
    pub autosave_interval_secs: u64,

    #[serde(default)]
    pub gpx: GpxConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            autosave_interval_secs: default_autosave_interval(),
            gpx: GpxConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.autosave_interval_secs)
    }
}

/// Options for computing track statistics.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzerOptions {
    /// Unit system for altitude display values (default: metric)
    #[serde(default)]
    pub units: UnitSystem,

    /// Read timestamps as wall-clock UTC, discarding offsets (default: false)
    #[serde(default)]
    pub ignore_time_zone: bool,
}

impl AnalyzerOptions {
    pub fn gpx_config(&self) -> GpxConfig {
        GpxConfig {
            ignore_time_zone: self.ignore_time_zone,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitSystem {
    #[default]
    Metric,
    Imperial,
}

const FEET_PER_METER: f64 = 3.280_839_895;

impl UnitSystem {
    /// Converts a length in meters into the display unit for altitudes.
    pub fn altitude(self, meters: f64) -> f64 {
        match self {
            UnitSystem::Metric => meters,
            UnitSystem::Imperial => meters * FEET_PER_METER,
        }
    }
}

fn default_creator() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_autosave_interval() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_defaults_from_empty_json() {
        let cfg: SessionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, SessionConfig::default());
        assert_eq!(cfg.autosave_interval(), Duration::from_secs(30));
        assert_eq!(cfg.gpx.creator, "gpx-track-recorder");
    }

    #[test]
    fn test_camel_case_keys() {
        let cfg: SessionConfig = serde_json::from_str(
            r#"{"autosaveIntervalSecs": 5, "gpx": {"ignoreTimeZone": true, "creator": "me"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.autosave_interval_secs, 5);
        assert!(cfg.gpx.ignore_time_zone);
        assert_eq!(cfg.gpx.creator, "me");
    }

    #[test]
    fn test_imperial_altitude() {
        let opts: AnalyzerOptions = serde_json::from_str(r#"{"units": "imperial"}"#).unwrap();
        assert_eq!(opts.units, UnitSystem::Imperial);
        assert!((opts.units.altitude(100.0) - 328.084).abs() < 1e-3);
        assert_eq!(UnitSystem::Metric.altitude(100.0), 100.0);
    }
}
