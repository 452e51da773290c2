//! Device state broadcasts: wear detection, screen, power, user modes.

use crate::RadioKind;

/// Callbacks for device state changes that feed radio decisions.
#[derive(Clone, Debug)]
pub enum DeviceStateCallbacks {
    /// On-body recognition result with the sensor's change timestamp.
    OnBodyState { is_on_body: bool, last_changed_ms: u64 },
    ScreenState { on: bool },
    Charging { plugged: bool },
    PowerSave { enabled: bool },
    AirplaneMode { enabled: bool },
    /// User entered or left an activity mode disabling the listed radios.
    ActivityMode { enabled: bool, affected: Vec<RadioKind> },
    /// Location mode toggled; gates background Wi-Fi scanning.
    LocationMode { enabled: bool },
}

pub struct DeviceStateCallbacksDispatcher {
    pub dispatch: Box<dyn Fn(DeviceStateCallbacks) + Send>,
}
