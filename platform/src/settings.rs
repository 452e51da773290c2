//! Observed platform settings.

/// Allow disabling cellular while the proxy is connected.
pub const SETTING_CELL_AUTO: &str = "cell_auto";
/// Master cellular enable.
pub const SETTING_CELL_ON: &str = "cell_on";
/// Feature flag gating off-body fan-out.
pub const SETTING_OFF_BODY_RADIOS_OFF_ENABLED: &str = "off_body_radios_off_enabled";
/// Off-body debounce in milliseconds.
pub const SETTING_OFF_BODY_DELAY_MS: &str = "off_body_delay_ms";
/// Enable signal-state-driven cellular off.
pub const SETTING_SIGNAL_DETECTOR_ENABLED: &str = "mobile_signal_detector_enabled";
/// Key/value list describing time-only mode.
pub const SETTING_TIME_ONLY_MODE: &str = "time_only_mode";
/// Proxy-disconnect debounce in milliseconds; 0 disables debouncing.
pub const SETTING_BT_STATE_CHANGE_DELAY_MS: &str = "bt_state_change_delay_ms";

/// Capability interface to the platform settings store. Reads are cheap and
/// non-blocking; observation is delivered as `SettingsCallbacks`.
pub trait SettingsStore: Send + Sync {
    fn get_int(&self, key: &str, default: i64) -> i64;

    fn get_bool(&self, key: &str, default: bool) -> bool;

    fn get_string(&self, key: &str) -> Option<String>;
}

/// Callbacks from the settings store.
#[derive(Clone, Debug)]
pub enum SettingsCallbacks {
    /// The value behind `key` changed; re-read through the store.
    Changed { key: String },
}

pub struct SettingsCallbacksDispatcher {
    pub dispatch: Box<dyn Fn(SettingsCallbacks) + Send>,
}
