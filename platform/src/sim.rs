//! In-memory platform backend.
//!
//! Stands in for the real driver and system-service bindings during
//! development and in tests: commands mutate local state and the matching
//! callbacks are fired through the registered dispatchers, so the full stack
//! can be exercised without hardware.

use log::info;
use std::collections::HashMap;
use std::fs::File;
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::{Arc, Mutex};

use crate::adapter::{
    AclState, AdapterCallbacks, AdapterCallbacksDispatcher, AdapterState, BluetoothService,
    BondState, FdError, LinkKind, RawAddress, Uuid,
};
use crate::connectivity::{
    AgentId, ConnectivityCallbacks, ConnectivityCallbacksDispatcher, LinkProperties,
    NetworkCapabilities, NetworkInfo, NetworkRegistry,
};
use crate::device_state::{DeviceStateCallbacks, DeviceStateCallbacksDispatcher};
use crate::settings::{SettingsCallbacks, SettingsCallbacksDispatcher, SettingsStore};
use crate::sysproxy::{SysproxyBridge, SysproxyCallbacks, SysproxyCallbacksDispatcher};
use crate::telephony::{
    ServiceState, TelephonyCallbacks, TelephonyCallbacksDispatcher, TelephonyControl,
};
use crate::wifi::{ScanAvailableState, WifiCallbacks, WifiCallbacksDispatcher, WifiDriver, WifiState};
use crate::CommandStatus;

#[derive(Clone)]
struct SimAgent {
    info: NetworkInfo,
    caps: NetworkCapabilities,
    link: LinkProperties,
    score: i32,
}

#[derive(Default)]
struct SimInner {
    adapter_dispatcher: Option<AdapterCallbacksDispatcher>,
    telephony_dispatcher: Option<TelephonyCallbacksDispatcher>,
    wifi_dispatcher: Option<WifiCallbacksDispatcher>,
    sysproxy_dispatcher: Option<SysproxyCallbacksDispatcher>,
    connectivity_dispatcher: Option<ConnectivityCallbacksDispatcher>,
    device_state_dispatcher: Option<DeviceStateCallbacksDispatcher>,
    settings_dispatcher: Option<SettingsCallbacksDispatcher>,

    adapter_enabled: bool,
    radio_powered: bool,

    // Behavior knobs for tests and the development mode.
    socket_connects: bool,
    native_accepts: bool,
    native_network_type: i32,
    native_metered: bool,

    next_agent: AgentId,
    agents: HashMap<AgentId, SimAgent>,
    settings: HashMap<String, String>,

    socket_attempts: u32,
    native_connects: u32,
    wakeup_controller_running: bool,
    hidden_network_scan: bool,
}

/// The simulated platform. Cloning shares the underlying state; an
/// `Arc<SimPlatform>` coerces to any of the capability traits.
#[derive(Clone)]
pub struct SimPlatform {
    inner: Arc<Mutex<SimInner>>,
}

impl SimPlatform {
    pub fn new() -> Self {
        let mut inner = SimInner::default();
        inner.socket_connects = true;
        inner.native_accepts = true;
        inner.native_network_type = 1;
        inner.next_agent = 1;
        Self { inner: Arc::new(Mutex::new(inner)) }
    }

    pub fn set_adapter_dispatcher(&self, dispatcher: AdapterCallbacksDispatcher) {
        self.inner.lock().unwrap().adapter_dispatcher = Some(dispatcher);
    }

    pub fn set_telephony_dispatcher(&self, dispatcher: TelephonyCallbacksDispatcher) {
        self.inner.lock().unwrap().telephony_dispatcher = Some(dispatcher);
    }

    pub fn set_wifi_dispatcher(&self, dispatcher: WifiCallbacksDispatcher) {
        self.inner.lock().unwrap().wifi_dispatcher = Some(dispatcher);
    }

    pub fn set_sysproxy_dispatcher(&self, dispatcher: SysproxyCallbacksDispatcher) {
        self.inner.lock().unwrap().sysproxy_dispatcher = Some(dispatcher);
    }

    pub fn set_connectivity_dispatcher(&self, dispatcher: ConnectivityCallbacksDispatcher) {
        self.inner.lock().unwrap().connectivity_dispatcher = Some(dispatcher);
    }

    pub fn set_device_state_dispatcher(&self, dispatcher: DeviceStateCallbacksDispatcher) {
        self.inner.lock().unwrap().device_state_dispatcher = Some(dispatcher);
    }

    pub fn set_settings_dispatcher(&self, dispatcher: SettingsCallbacksDispatcher) {
        self.inner.lock().unwrap().settings_dispatcher = Some(dispatcher);
    }

    fn fire_adapter(&self, callback: AdapterCallbacks) {
        if let Some(d) = &self.inner.lock().unwrap().adapter_dispatcher {
            (d.dispatch)(callback);
        }
    }

    fn fire_telephony(&self, callback: TelephonyCallbacks) {
        if let Some(d) = &self.inner.lock().unwrap().telephony_dispatcher {
            (d.dispatch)(callback);
        }
    }

    fn fire_wifi(&self, callback: WifiCallbacks) {
        if let Some(d) = &self.inner.lock().unwrap().wifi_dispatcher {
            (d.dispatch)(callback);
        }
    }

    fn fire_sysproxy(&self, callback: SysproxyCallbacks) {
        if let Some(d) = &self.inner.lock().unwrap().sysproxy_dispatcher {
            (d.dispatch)(callback);
        }
    }

    fn fire_connectivity(&self, callback: ConnectivityCallbacks) {
        if let Some(d) = &self.inner.lock().unwrap().connectivity_dispatcher {
            (d.dispatch)(callback);
        }
    }

    fn fire_device_state(&self, callback: DeviceStateCallbacks) {
        if let Some(d) = &self.inner.lock().unwrap().device_state_dispatcher {
            (d.dispatch)(callback);
        }
    }

    fn fire_settings(&self, callback: SettingsCallbacks) {
        if let Some(d) = &self.inner.lock().unwrap().settings_dispatcher {
            (d.dispatch)(callback);
        }
    }

    // Injection surface used by tests and the development driver.

    pub fn set_socket_connects(&self, connects: bool) {
        self.inner.lock().unwrap().socket_connects = connects;
    }

    pub fn set_native_accepts(&self, accepts: bool) {
        self.inner.lock().unwrap().native_accepts = accepts;
    }

    pub fn set_native_network_type(&self, network_type: i32) {
        self.inner.lock().unwrap().native_network_type = network_type;
    }

    pub fn inject_acl_state(&self, addr: RawAddress, state: AclState, link: LinkKind) {
        self.fire_adapter(AdapterCallbacks::AclState(addr, state, link));
    }

    pub fn inject_bond_state(&self, addr: RawAddress, state: BondState, link: LinkKind) {
        self.fire_adapter(AdapterCallbacks::BondState(addr, state, link));
    }

    pub fn inject_device_state(&self, callback: DeviceStateCallbacks) {
        self.fire_device_state(callback);
    }

    pub fn inject_native_disconnect(&self, status: i32) {
        self.fire_sysproxy(SysproxyCallbacks::Disconnected { status });
    }

    pub fn inject_request_counts(&self, wifi: u32, cell: u32, high_bandwidth: u32, unmetered: u32) {
        self.fire_connectivity(ConnectivityCallbacks::RequestCounts {
            wifi,
            cell,
            high_bandwidth,
            unmetered,
        });
    }

    pub fn inject_agent_unwanted(&self, agent: AgentId) {
        self.fire_connectivity(ConnectivityCallbacks::AgentUnwanted(agent));
    }

    pub fn set_setting(&self, key: &str, value: &str) {
        self.inner.lock().unwrap().settings.insert(key.to_string(), value.to_string());
        self.fire_settings(SettingsCallbacks::Changed { key: key.to_string() });
    }

    pub fn agent_count(&self) -> usize {
        self.inner.lock().unwrap().agents.len()
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.inner.lock().unwrap().agents.keys().copied().collect()
    }

    pub fn agent_info(&self, agent: AgentId) -> Option<NetworkInfo> {
        self.inner.lock().unwrap().agents.get(&agent).map(|a| a.info.clone())
    }

    pub fn agent_score(&self, agent: AgentId) -> Option<i32> {
        self.inner.lock().unwrap().agents.get(&agent).map(|a| a.score)
    }

    pub fn agent_capabilities(&self, agent: AgentId) -> Option<NetworkCapabilities> {
        self.inner.lock().unwrap().agents.get(&agent).map(|a| a.caps.clone())
    }

    pub fn agent_link(&self, agent: AgentId) -> Option<LinkProperties> {
        self.inner.lock().unwrap().agents.get(&agent).map(|a| a.link.clone())
    }

    pub fn hidden_network_scan(&self) -> bool {
        self.inner.lock().unwrap().hidden_network_scan
    }

    pub fn socket_attempts(&self) -> u32 {
        self.inner.lock().unwrap().socket_attempts
    }

    pub fn native_connects(&self) -> u32 {
        self.inner.lock().unwrap().native_connects
    }

    pub fn wakeup_controller_running(&self) -> bool {
        self.inner.lock().unwrap().wakeup_controller_running
    }
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl BluetoothService for SimPlatform {
    fn enable(&self) -> bool {
        self.inner.lock().unwrap().adapter_enabled = true;
        self.fire_adapter(AdapterCallbacks::AdapterState(AdapterState::On));
        true
    }

    fn disable(&self) -> bool {
        self.inner.lock().unwrap().adapter_enabled = false;
        self.fire_adapter(AdapterCallbacks::AdapterState(AdapterState::Off));
        true
    }

    fn is_enabled(&self) -> bool {
        self.inner.lock().unwrap().adapter_enabled
    }

    fn connect_socket(
        &self,
        _device: RawAddress,
        _uuid: Uuid,
        _flags: i32,
    ) -> (CommandStatus, Result<File, FdError>) {
        let connects = {
            let mut inner = self.inner.lock().unwrap();
            inner.socket_attempts += 1;
            inner.socket_connects && inner.adapter_enabled
        };
        if !connects {
            return (CommandStatus::SocketError, Err("Invalid FD"));
        }
        match File::open("/dev/null") {
            Ok(file) => (CommandStatus::Success, Ok(file)),
            Err(_) => (CommandStatus::SocketError, Err("Invalid FD")),
        }
    }

    fn hfc_connect(&self, _device: RawAddress) -> CommandStatus {
        CommandStatus::Success
    }

    fn hfc_disconnect(&self, _device: RawAddress) -> CommandStatus {
        CommandStatus::Success
    }
}

impl TelephonyControl for SimPlatform {
    fn set_radio_power(&self, powered: bool) -> CommandStatus {
        self.inner.lock().unwrap().radio_powered = powered;
        let state = if powered { ServiceState::InService } else { ServiceState::PowerOff };
        self.fire_telephony(TelephonyCallbacks::ServiceState(state));
        CommandStatus::Success
    }

    fn is_radio_powered(&self) -> bool {
        self.inner.lock().unwrap().radio_powered
    }
}

impl WifiDriver for SimPlatform {
    fn create_client_iface(&self) -> String {
        let name = String::from("wlan0");
        self.fire_wifi(WifiCallbacks::InterfaceUp(name.clone()));
        name
    }

    fn create_scan_iface(&self) -> String {
        let name = String::from("wlan0");
        self.fire_wifi(WifiCallbacks::InterfaceUp(name.clone()));
        name
    }

    fn remove_iface(&self, _name: &str) -> bool {
        true
    }

    fn set_hidden_network_scan(&self, enabled: bool) {
        self.inner.lock().unwrap().hidden_network_scan = enabled;
    }

    fn clear_scan_results(&self) {}

    fn start_wakeup_controller(&self) {
        self.inner.lock().unwrap().wakeup_controller_running = true;
    }

    fn stop_wakeup_controller(&self) {
        self.inner.lock().unwrap().wakeup_controller_running = false;
    }

    fn broadcast_wifi_state(&self, state: WifiState, previous: WifiState) {
        info!("sim: WIFI_STATE_CHANGED {:?} (was {:?})", state, previous);
    }

    fn broadcast_scan_available(&self, state: ScanAvailableState) {
        info!("sim: WIFI_SCAN_AVAILABLE {:?}", state);
    }
}

impl SysproxyBridge for SimPlatform {
    fn connect(&self, fd: RawFd) -> bool {
        // Take ownership of the fd regardless of outcome; the real bridge
        // adopts it into the tunnel on success.
        // SAFETY: the caller transfers ownership of `fd` to this call.
        let _adopted = unsafe { File::from_raw_fd(fd) };

        let (accepts, network_type, metered) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.native_accepts {
                inner.native_connects += 1;
            }
            (inner.native_accepts, inner.native_network_type, inner.native_metered)
        };
        if accepts {
            self.fire_sysproxy(SysproxyCallbacks::Connected { network_type, metered });
        }
        accepts
    }

    fn disconnect(&self) -> bool {
        true
    }
}

impl NetworkRegistry for SimPlatform {
    fn register(
        &self,
        info: &NetworkInfo,
        caps: &NetworkCapabilities,
        link: &LinkProperties,
        score: i32,
    ) -> AgentId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_agent;
        inner.next_agent += 1;
        inner.agents.insert(
            id,
            SimAgent { info: info.clone(), caps: caps.clone(), link: link.clone(), score },
        );
        id
    }

    fn unregister(&self, agent: AgentId) -> bool {
        self.inner.lock().unwrap().agents.remove(&agent).is_some()
    }

    fn send_info(&self, agent: AgentId, info: &NetworkInfo) {
        if let Some(a) = self.inner.lock().unwrap().agents.get_mut(&agent) {
            a.info = info.clone();
        }
    }

    fn send_capabilities(&self, agent: AgentId, caps: &NetworkCapabilities) {
        if let Some(a) = self.inner.lock().unwrap().agents.get_mut(&agent) {
            a.caps = caps.clone();
        }
    }

    fn send_score(&self, agent: AgentId, score: i32) {
        if let Some(a) = self.inner.lock().unwrap().agents.get_mut(&agent) {
            a.score = score;
        }
    }
}

impl SettingsStore for SimPlatform {
    fn get_int(&self, key: &str, default: i64) -> i64 {
        self.inner
            .lock()
            .unwrap()
            .settings
            .get(key)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(default)
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.inner.lock().unwrap().settings.get(key).map(|v| v.as_str()) {
            Some("1") | Some("true") => true,
            Some("0") | Some("false") => false,
            _ => default,
        }
    }

    fn get_string(&self, key: &str) -> Option<String> {
        self.inner.lock().unwrap().settings.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_enable_reflects_state() {
        let sim = SimPlatform::new();
        assert!(!BluetoothService::is_enabled(&sim));
        assert!(BluetoothService::enable(&sim));
        assert!(BluetoothService::is_enabled(&sim));
    }

    #[test]
    fn test_socket_connect_requires_adapter() {
        let sim = SimPlatform::new();
        let (status, fd) = sim.connect_socket(RawAddress::default(), Uuid::default(), 0);
        assert_eq!(status, CommandStatus::SocketError);
        assert!(fd.is_err());

        BluetoothService::enable(&sim);
        let (status, fd) = sim.connect_socket(RawAddress::default(), Uuid::default(), 0);
        assert_eq!(status, CommandStatus::Success);
        assert!(fd.is_ok());
        assert_eq!(sim.socket_attempts(), 2);
    }

    #[test]
    fn test_registry_tracks_agents() {
        let sim = SimPlatform::new();
        let info = NetworkInfo::new(crate::connectivity::DetailedState::Connecting, "test", None);
        let caps = NetworkCapabilities::companion_proxy();
        let link = LinkProperties::default();

        let first = sim.register(&info, &caps, &link, 55);
        let second = sim.register(&info, &caps, &link, 100);
        assert_ne!(first, second);
        assert_eq!(sim.agent_count(), 2);
        assert_eq!(sim.agent_score(second), Some(100));

        assert!(sim.unregister(first));
        assert!(!sim.unregister(first));
        assert_eq!(sim.agent_count(), 1);
    }

    #[test]
    fn test_settings_store_parses_values() {
        let sim = SimPlatform::new();
        assert_eq!(sim.get_int("missing", 7), 7);

        sim.set_setting("cell_auto", "1");
        assert!(sim.get_bool("cell_auto", false));
        sim.set_setting("off_body_delay_ms", "600000");
        assert_eq!(sim.get_int("off_body_delay_ms", 0), 600000);
    }
}
