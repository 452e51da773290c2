//! Cellular radio mediator.
//!
//! Reconciles telephony state, user settings, request counts, proxy
//! connectivity and the signal detector into a single radio power decision.
//! The priority order of the rules is load-bearing: a disconnected proxy
//! keeps cellular on even when the signal detector reports a bad signal, so
//! the watch stays reachable while its only other transport is down.

use log::{info, warn};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::time::Duration;

use conn_platform::telephony::{
    PhoneState, ServiceState, SignalState, SimState, TelephonyControl,
};
use conn_platform::{CommandStatus, RadioKind};
use conn_utils::notifier::StateNotifier;

use crate::config::{Config, RADIO_SETTLE_TIMEOUT_MS};
use crate::history::{DecisionHistory, DecisionReason, EventHistory, RadioDecision};

pub struct CellMediator {
    telephony: Arc<dyn TelephonyControl>,
    worker: Arc<Runtime>,
    radio_powered: Arc<StateNotifier<bool>>,

    boot_completed: bool,
    enabled: bool,
    in_call: bool,
    activity_mode: bool,
    off_body: bool,
    charging: bool,
    power_save: bool,
    cell_user_setting: bool,
    cell_auto: bool,
    cell_off_in_power_save: bool,
    signal_detector_enabled: bool,
    sim_state: SimState,
    signal: SignalState,
    high_bandwidth_requests: u32,
    cell_requests: u32,
    proxy_connected: bool,

    decisions: DecisionHistory,
    events: EventHistory,
}

impl CellMediator {
    pub fn new(telephony: Arc<dyn TelephonyControl>, worker: Arc<Runtime>, config: Config) -> Self {
        Self {
            telephony,
            worker,
            radio_powered: Arc::new(StateNotifier::new(false)),
            boot_completed: false,
            enabled: true,
            in_call: false,
            activity_mode: false,
            off_body: false,
            charging: false,
            power_save: false,
            cell_user_setting: config.cell_on,
            cell_auto: config.cell_auto,
            cell_off_in_power_save: config.cell_off_in_power_save,
            signal_detector_enabled: config.signal_detector_enabled,
            sim_state: SimState::Unknown,
            signal: SignalState::Stable,
            high_bandwidth_requests: 0,
            cell_requests: 0,
            proxy_connected: false,
            decisions: DecisionHistory::new(),
            events: EventHistory::new("CellMediator"),
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

    /// Cellular is intentionally left untouched by time-only mode: it is the
    /// watch's fallback transport, so bt/wifi mediators react to this
    /// setting but cellular does not.
    pub(crate) fn on_time_only_mode(&mut self, _enabled: bool) {}

    fn signal_detector_running(&self) -> bool {
        // Tied to the setting and the boot latch, not to radio power, so a
        // bad-signal radio-off cannot oscillate the detector.
        self.signal_detector_enabled && self.boot_completed
    }

    /// The decision rules, highest priority first. The proxy-disconnected
    /// rule stays ahead of the signal rules on purpose.
    fn compute_decision(&self) -> RadioDecision {
        if self.in_call {
            RadioDecision::on(RadioKind::Cellular, DecisionReason::OnPhoneCall)
        } else if self.activity_mode {
            RadioDecision::off(RadioKind::Cellular, DecisionReason::OffActivityMode)
        } else if self.off_body && !self.charging {
            RadioDecision::off(RadioKind::Cellular, DecisionReason::OffOffBody)
        } else if !self.cell_user_setting {
            RadioDecision::off(RadioKind::Cellular, DecisionReason::OffUserSetting)
        } else if self.sim_state == SimState::Absent {
            RadioDecision::off(RadioKind::Cellular, DecisionReason::OffSimAbsent)
        } else if self.cell_off_in_power_save && self.power_save {
            RadioDecision::off(RadioKind::Cellular, DecisionReason::OffPowerSave)
        } else if self.high_bandwidth_requests > 0 || self.cell_requests > 0 {
            RadioDecision::on(RadioKind::Cellular, DecisionReason::OnNetworkRequest)
        } else if !self.proxy_connected {
            RadioDecision::on(RadioKind::Cellular, DecisionReason::OnProxyDisconnected)
        } else if self.signal_detector_running() && self.signal == SignalState::NoSignal {
            RadioDecision::off(RadioKind::Cellular, DecisionReason::OffNoSignal)
        } else if self.signal_detector_running() && self.signal == SignalState::Unstable {
            RadioDecision::off(RadioKind::Cellular, DecisionReason::OffUnstableSignal)
        } else if self.cell_auto {
            RadioDecision::off(RadioKind::Cellular, DecisionReason::OffProxyConnected)
        } else {
            RadioDecision::on(RadioKind::Cellular, DecisionReason::OnAuto)
        }
    }

    fn evaluate(&mut self) {
        if !self.boot_completed || !self.enabled {
            return;
        }
        let decision = self.compute_decision();
        self.dispatch_decision(decision);
    }

    /// Same settle contract as the Bluetooth worker: apply, then block until
    /// the telephony service state confirms or the timeout caps the wait.
    fn dispatch_decision(&mut self, decision: RadioDecision) {
        if !self.decisions.push(decision) {
            return;
        }
        self.events.push(&decision.reason.to_string());
        info!(
            "Cell mediator: radio {} ({})",
            if decision.enable { "ON" } else { "OFF" },
            decision.reason
        );

        let telephony = self.telephony.clone();
        let notifier = self.radio_powered.clone();
        let enable = decision.enable;
        self.worker.spawn_blocking(move || {
            match telephony.set_radio_power(enable) {
                CommandStatus::Success => {}
                status => {
                    warn!("setRadioPower({}) failed: {:?}", enable, status);
                    return;
                }
            }
            if !notifier.wait_for(enable, Duration::from_millis(RADIO_SETTLE_TIMEOUT_MS)) {
                warn!(
                    "Cell radio did not settle to {} within {}ms; continuing",
                    enable, RADIO_SETTLE_TIMEOUT_MS
                );
            }
        });
    }

    pub(crate) fn handle_service_state(&mut self, state: ServiceState) {
        self.radio_powered.update(state != ServiceState::PowerOff);
        self.events.push(&format!("ServiceState{:?}", state));
    }

    pub(crate) fn handle_signal_state(&mut self, signal: SignalState) {
        self.signal = signal;
        self.events.push(&format!("Signal{:?}", signal));
        self.evaluate();
    }

    pub(crate) fn handle_sim_state(&mut self, state: SimState) {
        self.sim_state = state;
        self.events.push(&format!("Sim{:?}", state));
        self.evaluate();
    }

    pub(crate) fn handle_phone_state(&mut self, state: PhoneState) {
        self.in_call = state != PhoneState::Idle;
        self.events.push(&format!("Phone{:?}", state));
        self.evaluate();
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

    pub(crate) fn on_power_save(&mut self, enabled: bool) {
        self.power_save = enabled;
        self.evaluate();
    }

    pub(crate) fn on_proxy_change(&mut self, connected: bool) {
        self.proxy_connected = connected;
        self.evaluate();
    }

    pub(crate) fn on_request_counts(&mut self, cell: u32, high_bandwidth: u32) {
        self.cell_requests = cell;
        self.high_bandwidth_requests = high_bandwidth;
        self.evaluate();
    }

    pub(crate) fn on_cell_user_setting(&mut self, enabled: bool) {
        self.cell_user_setting = enabled;
        self.evaluate();
    }

    pub(crate) fn on_cell_auto(&mut self, enabled: bool) {
        self.cell_auto = enabled;
        self.evaluate();
    }

    pub(crate) fn on_signal_detector_enabled(&mut self, enabled: bool) {
        self.signal_detector_enabled = enabled;
        self.evaluate();
    }

    pub fn dump(&self) -> String {
        format!(
            "CellMediator:\n  enabled: {} boot_completed: {} in_call: {}\n  activity: {} off_body: {} charging: {} power_save: {}\n  cell_on: {} cell_auto: {} sim: {:?} signal: {:?} detector: {}\n  requests: cell {} high_bw {} proxy_connected: {}\n  decisions:\n{}\n{}",
            self.enabled,
            self.boot_completed,
            self.in_call,
            self.activity_mode,
            self.off_body,
            self.charging,
            self.power_save,
            self.cell_user_setting,
            self.cell_auto,
            self.sim_state,
            self.signal,
            self.signal_detector_running(),
            self.cell_requests,
            self.high_bandwidth_requests,
            self.proxy_connected,
            self.decisions.dump(),
            self.events.dump()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conn_platform::sim::SimPlatform;

    fn mediator_with(config: Config) -> (CellMediator, SimPlatform) {
        let sim = SimPlatform::new();
        (
            CellMediator::new(
                Arc::new(sim.clone()),
                conn_platform::runtime::get_runtime(),
                config,
            ),
            sim,
        )
    }

    fn mediator() -> (CellMediator, SimPlatform) {
        mediator_with(Config::default())
    }

    #[test]
    fn test_phone_call_overrides_everything() {
        let (mut m, _sim) = mediator();
        m.in_call = true;
        m.activity_mode = true;
        m.off_body = true;
        assert_eq!(m.compute_decision().reason, DecisionReason::OnPhoneCall);
    }

    #[test]
    fn test_activity_beats_off_body() {
        let (mut m, _sim) = mediator();
        m.activity_mode = true;
        m.off_body = true;
        assert_eq!(m.compute_decision().reason, DecisionReason::OffActivityMode);
    }

    #[test]
    fn test_user_setting_and_sim_rules() {
        let (mut m, _sim) = mediator();
        m.cell_user_setting = false;
        m.sim_state = SimState::Absent;
        assert_eq!(m.compute_decision().reason, DecisionReason::OffUserSetting);

        m.cell_user_setting = true;
        assert_eq!(m.compute_decision().reason, DecisionReason::OffSimAbsent);
    }

    #[test]
    fn test_power_save_gated_by_config() {
        let (mut m, _sim) = mediator();
        m.sim_state = SimState::Ready;
        m.power_save = true;
        // Config leaves cell_off_in_power_save off by default.
        assert_ne!(m.compute_decision().reason, DecisionReason::OffPowerSave);

        let mut config = Config::default();
        config.cell_off_in_power_save = true;
        let (mut m, _sim) = mediator_with(config);
        m.sim_state = SimState::Ready;
        m.power_save = true;
        assert_eq!(m.compute_decision().reason, DecisionReason::OffPowerSave);
    }

    #[test]
    fn test_network_requests_turn_radio_on() {
        let (mut m, _sim) = mediator();
        m.sim_state = SimState::Ready;
        m.proxy_connected = true;
        m.cell_requests = 1;
        assert_eq!(m.compute_decision().reason, DecisionReason::OnNetworkRequest);

        m.cell_requests = 0;
        m.high_bandwidth_requests = 2;
        assert_eq!(m.compute_decision().reason, DecisionReason::OnNetworkRequest);
    }

    #[test]
    fn test_proxy_disconnected_overrides_bad_signal() {
        // The ordering here is deliberate: with the proxy down, cellular must
        // stay on even though the detector says the signal is gone.
        let (mut m, _sim) = mediator_with({
            let mut c = Config::default();
            c.signal_detector_enabled = true;
            c
        });
        m.boot_completed = true;
        m.sim_state = SimState::Ready;
        m.proxy_connected = false;
        m.signal = SignalState::NoSignal;
        assert_eq!(m.compute_decision().reason, DecisionReason::OnProxyDisconnected);
    }

    #[test]
    fn test_signal_rules_apply_when_proxy_connected() {
        let (mut m, _sim) = mediator_with({
            let mut c = Config::default();
            c.signal_detector_enabled = true;
            c
        });
        m.boot_completed = true;
        m.sim_state = SimState::Ready;
        m.proxy_connected = true;

        m.signal = SignalState::NoSignal;
        assert_eq!(m.compute_decision().reason, DecisionReason::OffNoSignal);

        m.signal = SignalState::Unstable;
        assert_eq!(m.compute_decision().reason, DecisionReason::OffUnstableSignal);

        // Detector disabled: the signal rules drop out and cell_auto decides.
        m.signal_detector_enabled = false;
        m.cell_auto = true;
        assert_eq!(m.compute_decision().reason, DecisionReason::OffProxyConnected);

        m.cell_auto = false;
        assert_eq!(m.compute_decision().reason, DecisionReason::OnAuto);
    }

    #[test]
    fn test_boot_latch_suppresses_decisions() {
        let (mut m, _sim) = mediator();
        m.on_proxy_change(false);
        assert!(m.latest_decision().is_none());

        m.on_boot_completed();
        assert!(m.latest_decision().is_some());
    }

    #[test]
    fn test_off_body_scenario_records_decision() {
        let (mut m, _sim) = mediator();
        m.on_boot_completed();
        m.on_proxy_change(true);

        m.on_off_body(true);
        let decision = m.latest_decision().unwrap();
        assert!(!decision.enable);
        assert_eq!(decision.reason, DecisionReason::OffOffBody);
    }
}
