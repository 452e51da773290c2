//! Wi-Fi radio mediator with client and scan-only modes.
//!
//! Two small state machines share one interface shape: full client mode and
//! scan-only mode. The mediator decides which of them (if either) should be
//! running and relays interface lifecycle callbacks from the driver.

use log::{debug, info, warn};
use std::sync::Arc;

use conn_platform::wifi::{ScanAvailableState, WifiCallbacks, WifiDriver, WifiState};
use conn_platform::RadioKind;

use crate::history::{DecisionHistory, DecisionReason, EventHistory, RadioDecision};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ModeState {
    Idle,
    Started,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WifiRole {
    Client,
    ScanOnly,
}

/// One mode of the Wi-Fi subsystem. `Idle` on start tries to create its
/// interface; an empty name is a driver refusal broadcast as a failure.
/// `Started` publishes the state broadcasts as the interface comes and goes.
struct ModeMachine {
    role: WifiRole,
    state: ModeState,
    iface: Option<String>,
    last_broadcast: WifiState,
    driver: Arc<dyn WifiDriver>,
}

impl ModeMachine {
    fn new(role: WifiRole, driver: Arc<dyn WifiDriver>) -> Self {
        Self { role, state: ModeState::Idle, iface: None, last_broadcast: WifiState::Disabled, driver }
    }

    fn is_started(&self) -> bool {
        self.state == ModeState::Started
    }

    fn owns(&self, iface: &str) -> bool {
        self.iface.as_deref() == Some(iface)
    }

    fn broadcast(&mut self, state: WifiState) {
        let previous = self.last_broadcast;
        self.last_broadcast = state;
        if self.role == WifiRole::Client {
            self.driver.broadcast_wifi_state(state, previous);
        }
    }

    fn start(&mut self) {
        if self.state == ModeState::Started {
            return;
        }
        let name = match self.role {
            WifiRole::Client => self.driver.create_client_iface(),
            WifiRole::ScanOnly => self.driver.create_scan_iface(),
        };
        if name.is_empty() {
            warn!("Wi-Fi driver refused {:?} interface", self.role);
            self.broadcast(WifiState::Unknown);
            return;
        }

        info!("Wi-Fi {:?} starting on {}", self.role, name);
        self.iface = Some(name);
        self.state = ModeState::Started;
        self.broadcast(WifiState::Enabling);
        match self.role {
            WifiRole::Client => {
                self.driver.set_hidden_network_scan(true);
            }
            WifiRole::ScanOnly => {
                self.driver.start_wakeup_controller();
            }
        }
    }

    fn stop(&mut self) {
        if self.state == ModeState::Idle {
            return;
        }
        info!("Wi-Fi {:?} stopping", self.role);
        self.broadcast(WifiState::Disabling);
        if let Some(iface) = self.iface.take() {
            self.driver.remove_iface(&iface);
        }
        match self.role {
            WifiRole::Client => {
                self.driver.set_hidden_network_scan(false);
            }
            WifiRole::ScanOnly => {
                self.driver.stop_wakeup_controller();
                self.driver.broadcast_scan_available(ScanAvailableState::Unavailable);
            }
        }
        self.driver.clear_scan_results();
        self.state = ModeState::Idle;
        self.broadcast(WifiState::Disabled);
    }

    fn on_interface_up(&mut self) {
        if self.state != ModeState::Started {
            return;
        }
        self.broadcast(WifiState::Enabled);
        if self.role == WifiRole::ScanOnly {
            self.driver.broadcast_scan_available(ScanAvailableState::Available);
        }
    }

    fn on_interface_down(&mut self) {
        if self.state != ModeState::Started {
            return;
        }
        debug!("Wi-Fi {:?} interface down", self.role);
    }

    fn on_failure(&mut self) {
        if self.state != ModeState::Started {
            return;
        }
        warn!("Wi-Fi {:?} failed; returning to idle", self.role);
        self.iface = None;
        self.state = ModeState::Idle;
        self.broadcast(WifiState::Unknown);
    }
}

pub struct WifiMediator {
    client: ModeMachine,
    scan_only: ModeMachine,

    boot_completed: bool,
    enabled: bool,
    activity_mode: bool,
    off_body: bool,
    charging: bool,
    time_only_mode: bool,
    proxy_connected: bool,
    scan_always_available: bool,
    wifi_requests: u32,
    unmetered_requests: u32,

    decisions: DecisionHistory,
    events: EventHistory,
}

impl WifiMediator {
    pub fn new(driver: Arc<dyn WifiDriver>) -> Self {
        Self {
            client: ModeMachine::new(WifiRole::Client, driver.clone()),
            scan_only: ModeMachine::new(WifiRole::ScanOnly, driver),
            boot_completed: false,
            enabled: true,
            activity_mode: false,
            off_body: false,
            charging: false,
            time_only_mode: false,
            proxy_connected: false,
            scan_always_available: false,
            wifi_requests: 0,
            unmetered_requests: 0,
            decisions: DecisionHistory::new(),
            events: EventHistory::new("WifiMediator"),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn latest_decision(&self) -> Option<RadioDecision> {
        self.decisions.latest()
    }

    pub fn is_client_started(&self) -> bool {
        self.client.is_started()
    }

    pub fn is_scan_only_started(&self) -> bool {
        self.scan_only.is_started()
    }

    fn compute_decision(&self) -> RadioDecision {
        if self.activity_mode {
            RadioDecision::off(RadioKind::Wifi, DecisionReason::OffActivityMode)
        } else if self.off_body && !self.charging {
            RadioDecision::off(RadioKind::Wifi, DecisionReason::OffOffBody)
        } else if self.time_only_mode {
            RadioDecision::off(RadioKind::Wifi, DecisionReason::OffTimeOnlyMode)
        } else if self.wifi_requests > 0 || self.unmetered_requests > 0 {
            RadioDecision::on(RadioKind::Wifi, DecisionReason::OnNetworkRequest)
        } else if self.proxy_connected {
            // The tunnel carries default traffic; drop the client interface.
            RadioDecision::off(RadioKind::Wifi, DecisionReason::OffProxyConnected)
        } else {
            RadioDecision::on(RadioKind::Wifi, DecisionReason::OnAuto)
        }
    }

    fn evaluate(&mut self) {
        if !self.boot_completed || !self.enabled {
            return;
        }
        let decision = self.compute_decision();
        if !self.decisions.push(decision) {
            return;
        }
        self.events.push(&decision.reason.to_string());
        info!(
            "Wi-Fi mediator: {} ({})",
            if decision.enable { "ON" } else { "OFF" },
            decision.reason
        );
        self.apply(decision.enable);
    }

    fn apply(&mut self, enable: bool) {
        if enable {
            self.scan_only.stop();
            self.client.start();
        } else {
            self.client.stop();
            if self.scan_always_available {
                self.scan_only.start();
            } else {
                self.scan_only.stop();
            }
        }
    }

    pub(crate) fn handle_callback(&mut self, callback: WifiCallbacks) {
        match callback {
            WifiCallbacks::InterfaceUp(iface) => {
                self.events.push("InterfaceUp");
                if self.client.owns(&iface) {
                    self.client.on_interface_up();
                }
                if self.scan_only.owns(&iface) {
                    self.scan_only.on_interface_up();
                }
            }
            WifiCallbacks::InterfaceDown(iface) => {
                self.events.push("InterfaceDown");
                if self.client.owns(&iface) {
                    self.client.on_interface_down();
                }
                if self.scan_only.owns(&iface) {
                    self.scan_only.on_interface_down();
                }
            }
            WifiCallbacks::InterfaceDestroyed(iface) => {
                self.events.push("InterfaceDestroyed");
                if self.client.owns(&iface) {
                    self.client.on_failure();
                }
                if self.scan_only.owns(&iface) {
                    self.scan_only.on_failure();
                }
            }
            WifiCallbacks::NativeFailure => {
                self.events.push("NativeFailure");
                self.client.on_failure();
                self.scan_only.on_failure();
            }
        }
    }

    pub(crate) fn on_boot_completed(&mut self) {
        self.boot_completed = true;
        self.evaluate();
    }

    pub(crate) fn on_activity_mode(&mut self, enabled: bool) {
        self.activity_mode = enabled;
        self.evaluate();
    }

    pub(crate) fn on_off_body(&mut self, off_body: bool) {
        self.off_body = off_body;
        self.evaluate();
    }

    pub(crate) fn on_charging(&mut self, charging: bool) {
        self.charging = charging;
        self.evaluate();
    }

    pub(crate) fn on_time_only_mode(&mut self, enabled: bool) {
        self.time_only_mode = enabled;
        self.evaluate();
    }

    pub(crate) fn on_proxy_change(&mut self, connected: bool) {
        self.proxy_connected = connected;
        self.evaluate();
    }

    pub(crate) fn on_location_mode(&mut self, enabled: bool) {
        self.scan_always_available = enabled;
        // Scan-only availability may change while the power decision doesn't;
        // reapply the current decision.
        if let Some(decision) = self.decisions.latest() {
            self.apply(decision.enable);
        }
    }

    pub(crate) fn on_request_counts(&mut self, wifi: u32, unmetered: u32) {
        self.wifi_requests = wifi;
        self.unmetered_requests = unmetered;
        self.evaluate();
    }

    pub(crate) fn shutdown(&mut self) {
        self.client.stop();
        self.scan_only.stop();
    }

    pub fn dump(&self) -> String {
        format!(
            "WifiMediator:\n  enabled: {} client: {:?} scan_only: {:?}\n  proxy_connected: {} requests: wifi {} unmetered {} scan_always: {}\n  decisions:\n{}\n{}",
            self.enabled,
            self.client.state,
            self.scan_only.state,
            self.proxy_connected,
            self.wifi_requests,
            self.unmetered_requests,
            self.scan_always_available,
            self.decisions.dump(),
            self.events.dump()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conn_platform::sim::SimPlatform;

    fn mediator() -> (WifiMediator, SimPlatform) {
        let sim = SimPlatform::new();
        (WifiMediator::new(Arc::new(sim.clone())), sim)
    }

    #[test]
    fn test_boot_starts_client_mode() {
        let (mut mediator, sim) = mediator();
        assert!(!mediator.is_client_started());

        mediator.on_boot_completed();
        assert!(mediator.is_client_started());
        assert!(sim.hidden_network_scan());
        assert_eq!(mediator.latest_decision().unwrap().reason, DecisionReason::OnAuto);
    }

    #[test]
    fn test_activity_mode_stops_client() {
        let (mut mediator, _sim) = mediator();
        mediator.on_boot_completed();
        assert!(mediator.is_client_started());

        mediator.on_activity_mode(true);
        let decision = mediator.latest_decision().unwrap();
        assert!(!decision.enable);
        assert_eq!(decision.reason, DecisionReason::OffActivityMode);
        assert!(!mediator.is_client_started());
    }

    #[test]
    fn test_proxy_connected_drops_client_until_requests() {
        let (mut mediator, _sim) = mediator();
        mediator.on_boot_completed();

        mediator.on_proxy_change(true);
        assert_eq!(
            mediator.latest_decision().unwrap().reason,
            DecisionReason::OffProxyConnected
        );
        assert!(!mediator.is_client_started());

        mediator.on_request_counts(1, 0);
        assert_eq!(
            mediator.latest_decision().unwrap().reason,
            DecisionReason::OnNetworkRequest
        );
        assert!(mediator.is_client_started());
    }

    #[test]
    fn test_scan_only_when_location_enabled() {
        let (mut mediator, sim) = mediator();
        mediator.on_boot_completed();
        mediator.on_location_mode(true);

        mediator.on_proxy_change(true);
        assert!(!mediator.is_client_started());
        assert!(mediator.is_scan_only_started());
        assert!(sim.wakeup_controller_running());

        // Radio back on: scan-only yields to client mode.
        mediator.on_request_counts(2, 0);
        assert!(mediator.is_client_started());
        assert!(!mediator.is_scan_only_started());
        assert!(!sim.wakeup_controller_running());
    }

    #[test]
    fn test_native_failure_returns_to_idle() {
        let (mut mediator, _sim) = mediator();
        mediator.on_boot_completed();
        assert!(mediator.is_client_started());

        mediator.handle_callback(WifiCallbacks::NativeFailure);
        assert!(!mediator.is_client_started());
    }

    #[test]
    fn test_off_body_gated_by_charging() {
        let (mut mediator, _sim) = mediator();
        mediator.on_boot_completed();

        mediator.on_charging(true);
        mediator.on_off_body(true);
        // Charging holds the radio on.
        assert!(mediator.latest_decision().unwrap().enable);

        mediator.on_charging(false);
        let decision = mediator.latest_decision().unwrap();
        assert!(!decision.enable);
        assert_eq!(decision.reason, DecisionReason::OffOffBody);
    }
}
