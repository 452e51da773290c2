//! Typed interface to the Wi-Fi driver layer.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::cast::FromPrimitive;

/// Values broadcast with WIFI_STATE_CHANGED.
#[derive(Clone, Copy, Debug, FromPrimitive, ToPrimitive, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum WifiState {
    Disabling = 0,
    Disabled,
    Enabling,
    Enabled,
    Unknown,
}

impl From<u32> for WifiState {
    fn from(item: u32) -> Self {
        WifiState::from_u32(item).unwrap_or(WifiState::Unknown)
    }
}

/// Values broadcast with WIFI_SCAN_AVAILABLE.
#[derive(Clone, Copy, Debug, FromPrimitive, ToPrimitive, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum ScanAvailableState {
    Unavailable = 0,
    Available,
}

/// Capability interface to the Wi-Fi driver.
///
/// Interface creation is synchronous and returns the interface name; an empty
/// name means the driver refused. Up/down/destroyed transitions arrive later
/// as callbacks.
pub trait WifiDriver: Send + Sync {
    fn create_client_iface(&self) -> String;

    fn create_scan_iface(&self) -> String;

    fn remove_iface(&self, name: &str) -> bool;

    /// Whether scans should probe hidden networks. Client mode only.
    fn set_hidden_network_scan(&self, enabled: bool);

    fn clear_scan_results(&self);

    /// Arms the scan wake-up controller used in scan-only mode.
    fn start_wakeup_controller(&self);

    fn stop_wakeup_controller(&self);

    /// Sticky WIFI_STATE_CHANGED broadcast with {state, previousState}.
    fn broadcast_wifi_state(&self, state: WifiState, previous: WifiState);

    /// Sticky WIFI_SCAN_AVAILABLE broadcast.
    fn broadcast_scan_available(&self, state: ScanAvailableState);
}

/// Callbacks from the Wi-Fi driver.
#[derive(Debug)]
pub enum WifiCallbacks {
    InterfaceUp(String),
    InterfaceDown(String),
    InterfaceDestroyed(String),
    NativeFailure,
}

pub struct WifiCallbacksDispatcher {
    pub dispatch: Box<dyn Fn(WifiCallbacks) + Send>,
}
