//! Static tunables for the supervisor.

use log::{info, warn};
use serde_json::Value;
use std::fs::File;
use std::io::Read;

/// Debounce applied to a proxy disconnect before fan-out; 0 disables.
pub const DEFAULT_BT_STATE_CHANGE_DELAY_MS: u64 = 5_000;
/// Hard cap on the proxy-disconnect debounce.
pub const MAX_BT_STATE_CHANGE_DELAY_MS: u64 = 60_000;
/// Debounce applied to an off-body transition before radios are turned off.
pub const DEFAULT_OFF_BODY_DELAY_MS: u64 = 600_000;
/// How long after the first adapter enable we wait for a proxy connection
/// before tearing the shard back down.
pub const DEFAULT_CANCEL_CONNECT_ON_BOOT_DELAY_MS: u64 = 300_000;
/// How long a radio worker waits for the driver's state notification after
/// an enable/disable call.
pub const RADIO_SETTLE_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_PROXY_SCORE_CLASSIC: i32 = 55;
pub const DEFAULT_PROXY_SCORE_ON_CHARGER: i32 = 100;

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub bt_state_change_delay_ms: u64,
    pub off_body_radios_off_enabled: bool,
    pub off_body_delay_ms: u64,
    pub cell_auto: bool,
    pub cell_on: bool,
    pub signal_detector_enabled: bool,
    pub cell_off_in_power_save: bool,
    pub proxy_score_classic: i32,
    pub proxy_score_on_charger: i32,
    pub cancel_connect_on_boot_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bt_state_change_delay_ms: DEFAULT_BT_STATE_CHANGE_DELAY_MS,
            off_body_radios_off_enabled: false,
            off_body_delay_ms: DEFAULT_OFF_BODY_DELAY_MS,
            cell_auto: false,
            cell_on: true,
            signal_detector_enabled: false,
            cell_off_in_power_save: false,
            proxy_score_classic: DEFAULT_PROXY_SCORE_CLASSIC,
            proxy_score_on_charger: DEFAULT_PROXY_SCORE_ON_CHARGER,
            cancel_connect_on_boot_delay_ms: DEFAULT_CANCEL_CONNECT_ON_BOOT_DELAY_MS,
        }
    }
}

impl Config {
    /// Loads tunables from a JSON file, falling back to defaults for missing
    /// keys or an unreadable file.
    pub fn load(path: &str) -> Config {
        match Self::read_json(path) {
            Ok(json) => {
                info!("Config: loaded {}", path);
                Self::from_json(&json).clamped()
            }
            Err(e) => {
                warn!("Config: failed to load {}: {}; using defaults", path, e);
                Config::default()
            }
        }
    }

    fn read_json(path: &str) -> std::io::Result<Value> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(serde_json::from_str::<Value>(contents.as_str())?)
    }

    pub(crate) fn from_json(json: &Value) -> Config {
        let defaults = Config::default();
        let get_u64 =
            |key: &str, default: u64| json.get(key).and_then(|v| v.as_u64()).unwrap_or(default);
        let get_bool =
            |key: &str, default: bool| json.get(key).and_then(|v| v.as_bool()).unwrap_or(default);
        let get_i32 = |key: &str, default: i32| {
            json.get(key).and_then(|v| v.as_i64()).map(|v| v as i32).unwrap_or(default)
        };

        Config {
            bt_state_change_delay_ms: get_u64(
                "bt_state_change_delay_ms",
                defaults.bt_state_change_delay_ms,
            ),
            off_body_radios_off_enabled: get_bool(
                "off_body_radios_off_enabled",
                defaults.off_body_radios_off_enabled,
            ),
            off_body_delay_ms: get_u64("off_body_delay_ms", defaults.off_body_delay_ms),
            cell_auto: get_bool("cell_auto", defaults.cell_auto),
            cell_on: get_bool("cell_on", defaults.cell_on),
            signal_detector_enabled: get_bool(
                "signal_detector_enabled",
                defaults.signal_detector_enabled,
            ),
            cell_off_in_power_save: get_bool(
                "cell_off_in_power_save",
                defaults.cell_off_in_power_save,
            ),
            proxy_score_classic: get_i32("proxy_score_classic", defaults.proxy_score_classic),
            proxy_score_on_charger: get_i32(
                "proxy_score_on_charger",
                defaults.proxy_score_on_charger,
            ),
            cancel_connect_on_boot_delay_ms: get_u64(
                "cancel_connect_on_boot_delay_ms",
                defaults.cancel_connect_on_boot_delay_ms,
            ),
        }
    }

    /// Applies range caps.
    pub fn clamped(mut self) -> Config {
        self.bt_state_change_delay_ms =
            std::cmp::min(self.bt_state_change_delay_ms, MAX_BT_STATE_CHANGE_DELAY_MS);
        self
    }
}

/// Parsed value of the time_only_mode key/value list setting.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TimeOnlyModeSettings {
    pub enabled: bool,
    pub disable_tilt_to_wake: bool,
    pub disable_touch_to_wake: bool,
}

impl TimeOnlyModeSettings {
    /// Parses "enabled=true,disableTiltToWake=false,..." entries; malformed
    /// entries are skipped with a warning.
    pub fn parse(value: &str) -> TimeOnlyModeSettings {
        let mut settings = TimeOnlyModeSettings::default();
        for entry in value.split(',').filter(|e| !e.is_empty()) {
            let mut parts = entry.splitn(2, '=');
            let (key, val) = match (parts.next(), parts.next()) {
                (Some(k), Some(v)) => (k.trim(), v.trim()),
                _ => {
                    warn!("TimeOnlyMode: skipping malformed entry '{}'", entry);
                    continue;
                }
            };
            let parsed = match val {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => {
                    warn!("TimeOnlyMode: skipping non-boolean value '{}'", entry);
                    continue;
                }
            };
            match key {
                "enabled" => settings.enabled = parsed,
                "disableTiltToWake" => settings.disable_tilt_to_wake = parsed,
                "disableTouchToWake" => settings.disable_touch_to_wake = parsed,
                _ => warn!("TimeOnlyMode: unknown key '{}'", key),
            }
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_missing_file_yields_defaults() {
        assert_eq!(Config::load("/nonexistent/config.json"), Config::default());
    }

    #[test]
    fn test_load_from_file_and_clamp() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let contents = json!({
            "bt_state_change_delay_ms": 120000,
            "off_body_radios_off_enabled": true,
            "cell_auto": true,
            "proxy_score_classic": 60,
            "unknown_key": "ignored"
        });
        write!(file, "{}", contents).unwrap();

        let config = Config::load(file.path().to_str().unwrap());
        // Capped at the maximum debounce.
        assert_eq!(config.bt_state_change_delay_ms, MAX_BT_STATE_CHANGE_DELAY_MS);
        assert!(config.off_body_radios_off_enabled);
        assert!(config.cell_auto);
        assert_eq!(config.proxy_score_classic, 60);
        assert_eq!(config.off_body_delay_ms, DEFAULT_OFF_BODY_DELAY_MS);
    }

    #[test]
    fn test_time_only_mode_parsing() {
        let settings =
            TimeOnlyModeSettings::parse("enabled=true,disableTiltToWake=false,disableTouchToWake=1");
        assert_eq!(
            settings,
            TimeOnlyModeSettings {
                enabled: true,
                disable_tilt_to_wake: false,
                disable_touch_to_wake: true,
            }
        );
    }

    #[test]
    fn test_time_only_mode_malformed_entries_skipped() {
        let settings = TimeOnlyModeSettings::parse("enabled=yes,,bogus,disableTiltToWake=true");
        assert_eq!(
            settings,
            TimeOnlyModeSettings {
                enabled: false,
                disable_tilt_to_wake: true,
                disable_touch_to_wake: false,
            }
        );
    }
}
