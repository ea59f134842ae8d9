//! Runtime configuration: TOML file, then `SIREN_*` environment overrides,
//! then validation.

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::logging::LogSettings;
use crate::request::Aging;
use crate::worker::WorkerSettings;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    pub workers: usize,
    pub take_timeout_ms: u64,
    pub vehicle_timeout_ms: u64,
    pub responder_timeout_ms: u64,
    /// Real milliseconds per abstract time unit.
    pub time_unit_ms: u64,
    pub aging_interval_ms: u64,
    pub aging_factor: f64,
    pub drain_window_units: u64,
    pub worker_join_timeout_ms: u64,
    pub fleet: FleetConfig,
    pub log: LogSettings,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            take_timeout_ms: 3_000,
            vehicle_timeout_ms: 5_000,
            responder_timeout_ms: 3_000,
            time_unit_ms: 1_000,
            aging_interval_ms: 60_000,
            aging_factor: 0.1,
            drain_window_units: 10,
            worker_join_timeout_ms: 5_000,
            fleet: FleetConfig::default(),
            log: LogSettings::default(),
        }
    }
}

/// Size and layout of the simulated fleet.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FleetConfig {
    pub vehicles: usize,
    /// Leading share of the fleet built as mobile ICUs.
    pub mobile_icu_share: f64,
    /// Share built as advanced units, after the ICUs. The rest are basic.
    pub advanced_share: f64,
    pub responders: usize,
    /// Inclusive `[min, max]` bounds of the service area.
    pub area_x: [f64; 2],
    pub area_y: [f64; 2],
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            vehicles: 10,
            mobile_icu_share: 0.3,
            advanced_share: 0.3,
            responders: 20,
            area_x: [11.2, 11.4],
            area_y: [-74.2, -74.0],
        }
    }
}

impl DispatchConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup, e.g. a map in tests.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        override_from(&lookup, "SIREN_WORKERS", &mut self.workers)?;
        override_from(&lookup, "SIREN_TAKE_TIMEOUT_MS", &mut self.take_timeout_ms)?;
        override_from(&lookup, "SIREN_VEHICLE_TIMEOUT_MS", &mut self.vehicle_timeout_ms)?;
        override_from(&lookup, "SIREN_RESPONDER_TIMEOUT_MS", &mut self.responder_timeout_ms)?;
        override_from(&lookup, "SIREN_TIME_UNIT_MS", &mut self.time_unit_ms)?;
        override_from(&lookup, "SIREN_AGING_INTERVAL_MS", &mut self.aging_interval_ms)?;
        override_from(&lookup, "SIREN_AGING_FACTOR", &mut self.aging_factor)?;
        override_from(&lookup, "SIREN_DRAIN_WINDOW_UNITS", &mut self.drain_window_units)?;
        override_from(&lookup, "SIREN_WORKER_JOIN_TIMEOUT_MS", &mut self.worker_join_timeout_ms)?;
        override_from(&lookup, "SIREN_VEHICLES", &mut self.fleet.vehicles)?;
        override_from(&lookup, "SIREN_RESPONDERS", &mut self.fleet.responders)?;
        if let Some(level) = lookup("SIREN_LOG_LEVEL") {
            self.log.level = level;
        }
        Ok(())
    }

    /// Reject values the dispatcher cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.time_unit_ms == 0 {
            return Err(ConfigError::Invalid("time_unit_ms must be at least 1".into()));
        }
        if self.aging_interval_ms == 0 {
            return Err(ConfigError::Invalid("aging_interval_ms must be at least 1".into()));
        }
        if !self.aging_factor.is_finite() || self.aging_factor < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "aging_factor must be a finite non-negative number, got {}",
                self.aging_factor
            )));
        }
        let fleet = &self.fleet;
        let shares = fleet.mobile_icu_share + fleet.advanced_share;
        if fleet.mobile_icu_share < 0.0 || fleet.advanced_share < 0.0 || !(0.0..=1.0).contains(&shares) {
            return Err(ConfigError::Invalid("vehicle category shares must lie in [0, 1]".into()));
        }
        if fleet.area_x[0] > fleet.area_x[1] || fleet.area_y[0] > fleet.area_y[1] {
            return Err(ConfigError::Invalid("area bounds must be [min, max]".into()));
        }
        Ok(())
    }

    /// Real duration of one abstract time unit.
    pub fn time_unit(&self) -> Duration {
        Duration::from_millis(self.time_unit_ms)
    }

    /// `n` abstract time units as a real duration.
    pub fn units(&self, n: u64) -> Duration {
        Duration::from_millis(self.time_unit_ms.saturating_mul(n))
    }

    pub fn aging(&self) -> Aging {
        Aging {
            interval: Duration::from_millis(self.aging_interval_ms),
            factor: self.aging_factor,
        }
    }

    /// How long shutdown waits for the queue to empty.
    pub fn drain_window(&self) -> Duration {
        self.units(self.drain_window_units)
    }

    pub fn worker_join_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_join_timeout_ms)
    }

    /// Timeouts and time unit handed to each worker.
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            take_timeout: Duration::from_millis(self.take_timeout_ms),
            vehicle_timeout: Duration::from_millis(self.vehicle_timeout_ms),
            responder_timeout: Duration::from_millis(self.responder_timeout_ms),
            time_unit: self.time_unit(),
        }
    }
}

fn override_from<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(());
    };
    *slot = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{key}: cannot parse {raw:?}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogFormat;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn empty_document_yields_defaults() {
        let config = DispatchConfig::from_toml_str("").expect("parse");
        assert_eq!(config, DispatchConfig::default());
        assert_eq!(config.drain_window(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "workers = 2\ntime_unit_ms = 5\n\n[fleet]\nvehicles = 3\n\n[log]\nformat = \"compact\""
        )
        .expect("write config");

        let config = DispatchConfig::from_toml_file(file.path()).expect("load");
        assert_eq!(config.workers, 2);
        assert_eq!(config.units(4), Duration::from_millis(20));
        assert_eq!(config.fleet.vehicles, 3);
        assert_eq!(config.fleet.responders, 20);
        assert_eq!(config.log.format, LogFormat::Compact);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = DispatchConfig::from_toml_str("wrokers = 3").expect_err("typo must fail");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = DispatchConfig::from_toml_file(dir.path().join("absent.toml")).expect_err("no file");
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn env_overrides_win_and_bad_values_fail() {
        let mut vars = HashMap::new();
        vars.insert("SIREN_WORKERS", "7");
        vars.insert("SIREN_AGING_FACTOR", "0.25");
        vars.insert("SIREN_LOG_LEVEL", "warn");
        let mut config = DispatchConfig::default();
        config
            .apply_env_from(|key| vars.get(key).map(|v| v.to_string()))
            .expect("overrides");
        assert_eq!(config.workers, 7);
        assert_eq!(config.aging().factor, 0.25);
        assert_eq!(config.log.level, "warn");

        vars.insert("SIREN_TIME_UNIT_MS", "fast");
        let err = config
            .apply_env_from(|key| vars.get(key).map(|v| v.to_string()))
            .expect_err("unparsable override");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn validation_rejects_degenerate_values() {
        let config = DispatchConfig {
            workers: 0,
            ..DispatchConfig::default()
        };
        assert!(config.validate().is_err());

        let config = DispatchConfig {
            aging_factor: f64::NAN,
            ..DispatchConfig::default()
        };
        assert!(config.validate().is_err());

        let mut config = DispatchConfig::default();
        config.fleet.mobile_icu_share = 0.8;
        assert!(config.validate().is_err());
    }
}
