//! Connectivity controller.
//!
//! Central mediator between the trackers and the per-radio mediators: it
//! ingests proxy connectivity, off-body, activity mode, charging, request
//! counts and setting changes, applies the debounce policies, and fans the
//! results out. Debounced notifications deliver the value current at the
//! moment the timer fires, never the value captured at scheduling time.

use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use conn_platform::settings::{
    SettingsStore, SETTING_BT_STATE_CHANGE_DELAY_MS, SETTING_CELL_AUTO, SETTING_CELL_ON,
    SETTING_OFF_BODY_DELAY_MS, SETTING_OFF_BODY_RADIOS_OFF_ENABLED,
    SETTING_SIGNAL_DETECTOR_ENABLED, SETTING_TIME_ONLY_MODE,
};
use conn_platform::RadioKind;

use crate::bt_mediator::BtMediator;
use crate::cell_mediator::CellMediator;
use crate::companion_proxy::ProxyStatus;
use crate::companion_tracker::CompanionDevice;
use crate::config::{Config, TimeOnlyModeSettings, MAX_BT_STATE_CHANGE_DELAY_MS};
use crate::history::EventHistory;
use crate::wifi_mediator::WifiMediator;
use crate::Message;

/// Controller events posted to the dispatch loop.
pub enum ControllerActions {
    /// The proxy shard published a connection change.
    ProxyChange(bool),
    /// The proxy-disconnect debounce window elapsed.
    ProxyDebounceFired,
    /// The off-body debounce window elapsed.
    OffBodyDebounceFired,
}

pub struct ConnectivityController {
    tx: Sender<Message>,
    bt: Arc<Mutex<Box<BtMediator>>>,
    wifi: Arc<Mutex<Box<WifiMediator>>>,
    cell: Arc<Mutex<Box<CellMediator>>>,
    settings: Arc<dyn SettingsStore>,
    proxy_status: Arc<ProxyStatus>,

    bt_state_change_delay_ms: u64,
    off_body_delay_ms: u64,
    off_body_enabled: bool,
    time_only_mode: TimeOnlyModeSettings,

    off_body_raw: bool,
    last_proxy_fanout: Option<bool>,
    last_off_body_fanout: Option<bool>,

    proxy_debounce: Option<JoinHandle<()>>,
    off_body_debounce: Option<JoinHandle<()>>,
    shutdown: bool,

    events: EventHistory,
}

impl ConnectivityController {
    pub fn new(
        tx: Sender<Message>,
        bt: Arc<Mutex<Box<BtMediator>>>,
        wifi: Arc<Mutex<Box<WifiMediator>>>,
        cell: Arc<Mutex<Box<CellMediator>>>,
        settings: Arc<dyn SettingsStore>,
        proxy_status: Arc<ProxyStatus>,
        config: Config,
    ) -> Self {
        Self {
            tx,
            bt,
            wifi,
            cell,
            settings,
            proxy_status,
            bt_state_change_delay_ms: config.bt_state_change_delay_ms,
            off_body_delay_ms: config.off_body_delay_ms,
            off_body_enabled: config.off_body_radios_off_enabled,
            time_only_mode: TimeOnlyModeSettings::default(),
            off_body_raw: false,
            last_proxy_fanout: None,
            last_off_body_fanout: None,
            proxy_debounce: None,
            off_body_debounce: None,
            shutdown: false,
            events: EventHistory::new("ConnectivityController"),
        }
    }

    pub(crate) fn handle_action(&mut self, action: ControllerActions) {
        match action {
            ControllerActions::ProxyChange(connected) => self.on_proxy_change(connected),
            ControllerActions::ProxyDebounceFired => self.on_proxy_debounce_fired(),
            ControllerActions::OffBodyDebounceFired => self.on_off_body_debounce_fired(),
        }
    }

    /// A connect propagates immediately and cancels any pending disconnect
    /// notification, giving a flapping link the debounce window to recover.
    pub(crate) fn on_proxy_change(&mut self, connected: bool) {
        if self.shutdown {
            return;
        }
        self.events.push(if connected { "ProxyConnected" } else { "ProxyDisconnected" });

        if connected {
            if let Some(timer) = self.proxy_debounce.take() {
                debug!("Proxy reconnected within the debounce window");
                timer.abort();
            }
            self.fan_out_proxy(true);
            return;
        }

        if self.bt_state_change_delay_ms == 0 {
            self.fan_out_proxy(false);
            return;
        }
        if self.proxy_debounce.is_some() {
            return;
        }
        let delay = Duration::from_millis(self.bt_state_change_delay_ms);
        let tx = self.tx.clone();
        self.proxy_debounce = Some(tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx
                .send(Message::ControllerActions(ControllerActions::ProxyDebounceFired))
                .await;
        }));
    }

    fn on_proxy_debounce_fired(&mut self) {
        self.proxy_debounce = None;
        if self.shutdown {
            return;
        }
        // Deliver whatever the proxy looks like right now.
        let connected = self.proxy_status.is_connected();
        self.fan_out_proxy(connected);
    }

    fn fan_out_proxy(&mut self, connected: bool) {
        if self.last_proxy_fanout == Some(connected) {
            return;
        }
        self.last_proxy_fanout = Some(connected);
        info!("Controller: proxy {} fan-out", if connected { "connected" } else { "disconnected" });
        self.wifi.lock().unwrap().on_proxy_change(connected);
        self.cell.lock().unwrap().on_proxy_change(connected);
    }

    /// Going off-body waits out the configured delay; coming back on-body
    /// propagates immediately and cancels the pending timer.
    pub(crate) fn on_off_body_change(&mut self, off_body: bool) {
        if self.shutdown {
            return;
        }
        self.off_body_raw = off_body;
        self.events.push(if off_body { "OffBody" } else { "OnBody" });

        let effective = off_body && self.off_body_enabled;
        if !effective {
            if let Some(timer) = self.off_body_debounce.take() {
                debug!("Back on body before the radios-off delay elapsed");
                timer.abort();
            }
            self.fan_out_off_body(false);
            return;
        }
        if self.off_body_debounce.is_some() {
            return;
        }
        let delay = Duration::from_millis(self.off_body_delay_ms);
        let tx = self.tx.clone();
        self.off_body_debounce = Some(tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx
                .send(Message::ControllerActions(ControllerActions::OffBodyDebounceFired))
                .await;
        }));
    }

    fn on_off_body_debounce_fired(&mut self) {
        self.off_body_debounce = None;
        if self.shutdown {
            return;
        }
        let effective = self.off_body_raw && self.off_body_enabled;
        self.fan_out_off_body(effective);
    }

    fn fan_out_off_body(&mut self, off_body: bool) {
        if self.last_off_body_fanout == Some(off_body) {
            return;
        }
        self.last_off_body_fanout = Some(off_body);
        info!("Controller: off-body {} fan-out", off_body);
        self.bt.lock().unwrap().on_off_body(off_body);
        self.wifi.lock().unwrap().on_off_body(off_body);
        self.cell.lock().unwrap().on_off_body(off_body);
    }

    /// Activity mode reaches the affected mediators without debounce.
    pub(crate) fn on_activity_mode(&mut self, enabled: bool, affected: &[RadioKind]) {
        if self.shutdown {
            return;
        }
        self.events.push(if enabled { "ActivityModeOn" } else { "ActivityModeOff" });
        for radio in affected {
            match radio {
                RadioKind::Bluetooth => self.bt.lock().unwrap().on_activity_mode(enabled),
                RadioKind::Wifi => self.wifi.lock().unwrap().on_activity_mode(enabled),
                RadioKind::Cellular => self.cell.lock().unwrap().on_activity_mode(enabled),
            }
        }
    }

    pub(crate) fn on_request_counts(
        &mut self,
        wifi: u32,
        cell: u32,
        high_bandwidth: u32,
        unmetered: u32,
    ) {
        if self.shutdown {
            return;
        }
        self.wifi.lock().unwrap().on_request_counts(wifi, unmetered);
        self.cell.lock().unwrap().on_request_counts(cell, high_bandwidth);
    }

    pub(crate) fn on_charging(&mut self, charging: bool) {
        if self.shutdown {
            return;
        }
        self.bt.lock().unwrap().on_charging(charging);
        self.wifi.lock().unwrap().on_charging(charging);
        self.cell.lock().unwrap().on_charging(charging);
    }

    pub(crate) fn on_power_save(&mut self, enabled: bool) {
        if self.shutdown {
            return;
        }
        self.cell.lock().unwrap().on_power_save(enabled);
    }

    pub(crate) fn on_location_mode(&mut self, enabled: bool) {
        if self.shutdown {
            return;
        }
        self.wifi.lock().unwrap().on_location_mode(enabled);
    }

    pub(crate) fn on_companion_changed(&mut self, companion: Option<CompanionDevice>) {
        if self.shutdown {
            return;
        }
        self.events
            .push(if companion.is_some() { "CompanionKnown" } else { "CompanionCleared" });
        self.bt.lock().unwrap().on_companion_changed(companion);
    }

    /// Reads every observed setting once, then unlatches the mediators.
    pub(crate) fn on_boot_completed(&mut self) {
        info!("Controller: boot completed");
        self.events.push("BootCompleted");
        for key in [
            SETTING_BT_STATE_CHANGE_DELAY_MS,
            SETTING_OFF_BODY_RADIOS_OFF_ENABLED,
            SETTING_OFF_BODY_DELAY_MS,
            SETTING_CELL_AUTO,
            SETTING_CELL_ON,
            SETTING_SIGNAL_DETECTOR_ENABLED,
            SETTING_TIME_ONLY_MODE,
        ] {
            self.handle_setting_changed(key);
        }
        self.bt.lock().unwrap().on_boot_completed();
        self.wifi.lock().unwrap().on_boot_completed();
        self.cell.lock().unwrap().on_boot_completed();
    }

    pub(crate) fn handle_setting_changed(&mut self, key: &str) {
        match key {
            SETTING_BT_STATE_CHANGE_DELAY_MS => {
                let value = self
                    .settings
                    .get_int(key, self.bt_state_change_delay_ms as i64)
                    .max(0) as u64;
                self.bt_state_change_delay_ms =
                    std::cmp::min(value, MAX_BT_STATE_CHANGE_DELAY_MS);
            }
            SETTING_OFF_BODY_RADIOS_OFF_ENABLED => {
                self.off_body_enabled = self.settings.get_bool(key, self.off_body_enabled);
                if !self.off_body_enabled {
                    if let Some(timer) = self.off_body_debounce.take() {
                        timer.abort();
                    }
                    self.fan_out_off_body(false);
                }
            }
            SETTING_OFF_BODY_DELAY_MS => {
                self.off_body_delay_ms =
                    self.settings.get_int(key, self.off_body_delay_ms as i64).max(0) as u64;
            }
            SETTING_CELL_AUTO => {
                let value = self.settings.get_bool(key, false);
                self.cell.lock().unwrap().on_cell_auto(value);
            }
            SETTING_CELL_ON => {
                let value = self.settings.get_bool(key, true);
                self.cell.lock().unwrap().on_cell_user_setting(value);
            }
            SETTING_SIGNAL_DETECTOR_ENABLED => {
                let value = self.settings.get_bool(key, false);
                self.cell.lock().unwrap().on_signal_detector_enabled(value);
            }
            SETTING_TIME_ONLY_MODE => {
                let parsed = self
                    .settings
                    .get_string(key)
                    .map(|v| TimeOnlyModeSettings::parse(&v))
                    .unwrap_or_default();
                if parsed != self.time_only_mode {
                    self.time_only_mode = parsed.clone();
                    self.bt.lock().unwrap().on_time_only_mode(parsed.enabled);
                    self.wifi.lock().unwrap().on_time_only_mode(parsed.enabled);
                    self.cell.lock().unwrap().on_time_only_mode(parsed.enabled);
                }
            }
            _ => {
                warn!("Ignoring unobserved setting '{}'", key);
            }
        }
    }

    /// Drops pending debounces and tears the mediators down. Timers that
    /// fire afterwards are no-ops.
    pub(crate) fn shutdown(&mut self) {
        info!("Controller: shutting down");
        self.shutdown = true;
        if let Some(timer) = self.proxy_debounce.take() {
            timer.abort();
        }
        if let Some(timer) = self.off_body_debounce.take() {
            timer.abort();
        }
        // Disabled mediators ignore any notification that still slips
        // through a straggling timer.
        self.bt.lock().unwrap().set_enabled(false);
        self.wifi.lock().unwrap().set_enabled(false);
        self.cell.lock().unwrap().set_enabled(false);
        self.bt.lock().unwrap().shutdown();
        self.wifi.lock().unwrap().shutdown();
    }

    pub fn dump(&self) -> String {
        format!(
            "ConnectivityController:\n  shutdown: {} off_body_enabled: {} off_body_raw: {}\n  bt_delay_ms: {} off_body_delay_ms: {}\n  last_fanout: proxy {:?} off_body {:?}\n  pending: proxy {} off_body {}\n{}",
            self.shutdown,
            self.off_body_enabled,
            self.off_body_raw,
            self.bt_state_change_delay_ms,
            self.off_body_delay_ms,
            self.last_proxy_fanout,
            self.last_off_body_fanout,
            self.proxy_debounce.is_some(),
            self.off_body_debounce.is_some(),
            self.events.dump()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::companion_proxy::ProxyStatus;
    use crate::history::DecisionReason;
    use crate::network_agent::ProxyNetworkAgent;
    use crate::Supervisor;
    use conn_platform::sim::SimPlatform;
    use tokio::sync::mpsc::Receiver;
    use tokio::time::timeout;

    struct Fixture {
        controller: ConnectivityController,
        bt: Arc<Mutex<Box<BtMediator>>>,
        wifi: Arc<Mutex<Box<WifiMediator>>>,
        cell: Arc<Mutex<Box<CellMediator>>>,
        sim: SimPlatform,
        rx: Receiver<Message>,
    }

    fn fixture(mut config: Config) -> Fixture {
        // Short debounces keep the tests quick.
        if config.bt_state_change_delay_ms == crate::config::DEFAULT_BT_STATE_CHANGE_DELAY_MS {
            config.bt_state_change_delay_ms = 100;
        }
        if config.off_body_delay_ms == crate::config::DEFAULT_OFF_BODY_DELAY_MS {
            config.off_body_delay_ms = 100;
        }

        let sim = SimPlatform::new();
        let (tx, rx) = Supervisor::create_channel();
        let proxy_status = Arc::new(ProxyStatus::new());
        let agent: Arc<Mutex<Box<ProxyNetworkAgent>>> = Arc::new(Mutex::new(Box::new(
            ProxyNetworkAgent::new(Arc::new(sim.clone()), config.proxy_score_classic),
        )));
        let bt = Arc::new(Mutex::new(Box::new(BtMediator::new(
            tx.clone(),
            conn_platform::runtime::get_runtime(),
            conn_platform::runtime::get_runtime(),
            Arc::new(sim.clone()),
            Arc::new(sim.clone()),
            agent,
            proxy_status.clone(),
            config.clone(),
        ))));
        let wifi = Arc::new(Mutex::new(Box::new(WifiMediator::new(Arc::new(sim.clone())))));
        let cell = Arc::new(Mutex::new(Box::new(CellMediator::new(
            Arc::new(sim.clone()),
            conn_platform::runtime::get_runtime(),
            config.clone(),
        ))));
        let controller = ConnectivityController::new(
            tx,
            bt.clone(),
            wifi.clone(),
            cell.clone(),
            Arc::new(sim.clone()),
            proxy_status,
            config,
        );
        Fixture { controller, bt, wifi, cell, sim, rx }
    }

    async fn pump_controller_action(f: &mut Fixture) -> bool {
        match timeout(Duration::from_millis(500), f.rx.recv()).await {
            Ok(Some(Message::ControllerActions(action))) => {
                f.controller.handle_action(action);
                true
            }
            Ok(Some(_)) => false,
            _ => false,
        }
    }

    #[tokio::test]
    async fn test_proxy_disconnect_debounce_cancelled_by_reconnect() {
        let mut f = fixture(Config::default());
        f.controller.on_boot_completed();

        f.controller.on_proxy_change(true);
        assert_eq!(
            f.cell.lock().unwrap().latest_decision().unwrap().reason,
            DecisionReason::OnAuto
        );

        f.controller.on_proxy_change(false);
        assert!(f.controller.proxy_debounce.is_some());
        // Reconnect within the window: the pending notification dies.
        f.controller.on_proxy_change(true);
        assert!(f.controller.proxy_debounce.is_none());

        // Nothing fires later.
        assert!(
            timeout(Duration::from_millis(250), f.rx.recv()).await.is_err(),
            "no debounce message expected"
        );
        assert_eq!(
            f.cell.lock().unwrap().latest_decision().unwrap().reason,
            DecisionReason::OnAuto
        );
    }

    #[tokio::test]
    async fn test_proxy_disconnect_fans_out_after_delay() {
        let mut f = fixture(Config::default());
        f.controller.on_boot_completed();
        f.controller.on_proxy_change(true);

        f.controller.on_proxy_change(false);
        assert!(pump_controller_action(&mut f).await);
        assert_eq!(
            f.cell.lock().unwrap().latest_decision().unwrap().reason,
            DecisionReason::OnProxyDisconnected
        );
    }

    #[tokio::test]
    async fn test_zero_delay_bypasses_debounce() {
        let mut f = fixture({
            let mut c = Config::default();
            c.bt_state_change_delay_ms = 0;
            c
        });
        f.controller.on_boot_completed();
        f.controller.on_proxy_change(true);

        f.controller.on_proxy_change(false);
        assert!(f.controller.proxy_debounce.is_none());
        assert_eq!(
            f.cell.lock().unwrap().latest_decision().unwrap().reason,
            DecisionReason::OnProxyDisconnected
        );
    }

    #[tokio::test]
    async fn test_off_body_debounce_cancellation() {
        let mut f = fixture({
            let mut c = Config::default();
            c.off_body_radios_off_enabled = true;
            c
        });
        f.sim.set_setting(SETTING_OFF_BODY_RADIOS_OFF_ENABLED, "1");
        f.controller.on_boot_completed();

        f.controller.on_off_body_change(true);
        assert!(f.controller.off_body_debounce.is_some());

        // Back on the wrist before the delay elapses: immediate false fan-out
        // and no mediator ever sees off-body.
        f.controller.on_off_body_change(false);
        assert!(f.controller.off_body_debounce.is_none());
        assert!(
            timeout(Duration::from_millis(250), f.rx.recv()).await.is_err(),
            "no debounce message expected"
        );
        let bt_reason = f.bt.lock().unwrap().latest_decision().unwrap().reason;
        assert_ne!(bt_reason, DecisionReason::OffOffBody);
    }

    #[tokio::test]
    async fn test_off_body_fans_out_after_delay() {
        let mut f = fixture({
            let mut c = Config::default();
            c.off_body_radios_off_enabled = true;
            c
        });
        f.sim.set_setting(SETTING_OFF_BODY_RADIOS_OFF_ENABLED, "1");
        f.controller.on_boot_completed();

        f.controller.on_off_body_change(true);
        assert!(pump_controller_action(&mut f).await);

        assert_eq!(
            f.bt.lock().unwrap().latest_decision().unwrap().reason,
            DecisionReason::OffOffBody
        );
        assert_eq!(
            f.cell.lock().unwrap().latest_decision().unwrap().reason,
            DecisionReason::OffOffBody
        );
    }

    #[tokio::test]
    async fn test_off_body_feature_flag_gates_fan_out() {
        let mut f = fixture(Config::default());
        f.controller.on_boot_completed();

        // Flag disabled: going off-body never schedules anything.
        f.controller.on_off_body_change(true);
        assert!(f.controller.off_body_debounce.is_none());
    }

    #[tokio::test]
    async fn test_debounce_fire_reads_current_value() {
        let mut f = fixture({
            let mut c = Config::default();
            c.off_body_radios_off_enabled = true;
            c.off_body_delay_ms = 50;
            c
        });
        f.sim.set_setting(SETTING_OFF_BODY_RADIOS_OFF_ENABLED, "1");
        f.controller.on_boot_completed();

        f.controller.on_off_body_change(true);
        // Wait for the timer message, but flip the raw state before handling
        // it; the fired handler must deliver the current (false) value.
        let action = match timeout(Duration::from_millis(500), f.rx.recv()).await {
            Ok(Some(Message::ControllerActions(action))) => action,
            _ => panic!("expected debounce fire"),
        };
        f.controller.off_body_raw = false;
        f.controller.handle_action(action);

        let bt_reason = f.bt.lock().unwrap().latest_decision().unwrap().reason;
        assert_ne!(bt_reason, DecisionReason::OffOffBody);
    }

    #[tokio::test]
    async fn test_activity_mode_fans_to_affected_radios() {
        let mut f = fixture(Config::default());
        f.controller.on_boot_completed();

        f.controller.on_activity_mode(
            true,
            &[RadioKind::Bluetooth, RadioKind::Wifi, RadioKind::Cellular],
        );
        assert_eq!(
            f.bt.lock().unwrap().latest_decision().unwrap().reason,
            DecisionReason::OffActivityMode
        );
        assert_eq!(
            f.wifi.lock().unwrap().latest_decision().unwrap().reason,
            DecisionReason::OffActivityMode
        );
        assert_eq!(
            f.cell.lock().unwrap().latest_decision().unwrap().reason,
            DecisionReason::OffActivityMode
        );
    }

    #[tokio::test]
    async fn test_request_counts_forwarded() {
        let mut f = fixture(Config::default());
        f.controller.on_boot_completed();
        f.controller.on_proxy_change(true);

        f.controller.on_request_counts(0, 2, 0, 0);
        assert_eq!(
            f.cell.lock().unwrap().latest_decision().unwrap().reason,
            DecisionReason::OnNetworkRequest
        );
        f.controller.on_request_counts(1, 0, 0, 0);
        assert_eq!(
            f.wifi.lock().unwrap().latest_decision().unwrap().reason,
            DecisionReason::OnNetworkRequest
        );
    }

    #[tokio::test]
    async fn test_shutdown_drops_pending_debounce() {
        let mut f = fixture(Config::default());
        f.controller.on_boot_completed();
        f.controller.on_proxy_change(true);

        f.controller.on_proxy_change(false);
        assert!(f.controller.proxy_debounce.is_some());
        f.controller.shutdown();
        assert!(f.controller.proxy_debounce.is_none());

        // A straggling timer fire is a no-op after shutdown.
        f.controller.handle_action(ControllerActions::ProxyDebounceFired);
        assert_eq!(
            f.cell.lock().unwrap().latest_decision().unwrap().reason,
            DecisionReason::OnAuto
        );
    }

    #[tokio::test]
    async fn test_settings_changes_reach_cell_mediator() {
        let mut f = fixture(Config::default());
        f.controller.on_boot_completed();
        f.controller.on_proxy_change(true);

        f.sim.set_setting(SETTING_CELL_AUTO, "1");
        f.controller.handle_setting_changed(SETTING_CELL_AUTO);
        assert_eq!(
            f.cell.lock().unwrap().latest_decision().unwrap().reason,
            DecisionReason::OffProxyConnected
        );

        f.sim.set_setting(SETTING_CELL_ON, "0");
        f.controller.handle_setting_changed(SETTING_CELL_ON);
        assert_eq!(
            f.cell.lock().unwrap().latest_decision().unwrap().reason,
            DecisionReason::OffUserSetting
        );
    }

    #[tokio::test]
    async fn test_time_only_mode_setting_fans_out() {
        let mut f = fixture(Config::default());
        f.controller.on_boot_completed();

        f.sim.set_setting(SETTING_TIME_ONLY_MODE, "enabled=true,disableTiltToWake=true");
        f.controller.handle_setting_changed(SETTING_TIME_ONLY_MODE);

        assert_eq!(
            f.bt.lock().unwrap().latest_decision().unwrap().reason,
            DecisionReason::OffTimeOnlyMode
        );
        assert_eq!(
            f.wifi.lock().unwrap().latest_decision().unwrap().reason,
            DecisionReason::OffTimeOnlyMode
        );
    }
}
