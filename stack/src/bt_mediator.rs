//! Bluetooth radio mediator.
//!
//! Owns Bluetooth radio power and the lifecycle of the shards that depend on
//! it: the companion proxy tunnel and the hands-free client. Power decisions
//! run on a dedicated worker that blocks until the adapter's service state
//! settles, so consecutive decisions observe settled hardware.

use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use tokio::runtime::Runtime;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use conn_platform::adapter::{
    AclState, AdapterState, BluetoothService, DisplayAddress, RawAddress,
};
use conn_platform::sysproxy::SysproxyBridge;
use conn_platform::RadioKind;
use conn_utils::notifier::StateNotifier;

use crate::companion_proxy::{
    CompanionProxyShard, ICompanionProxyListener, ProxyActions, ProxyStatus,
};
use crate::companion_tracker::CompanionDevice;
use crate::config::{Config, RADIO_SETTLE_TIMEOUT_MS};
use crate::controller::ControllerActions;
use crate::hfc_client::HfcClient;
use crate::history::{DecisionHistory, DecisionReason, EventHistory, RadioDecision};
use crate::network_agent::ProxyNetworkAgent;
use crate::Message;

/// Mediator events posted to the dispatch loop.
pub enum BtMediatorActions {
    /// The five-minute boot-connect window elapsed.
    CancelConnectOnBoot,
    /// The proxy shard reported a connection change.
    ProxyConnectionChanged(bool),
}

pub struct BtMediator {
    tx: Sender<Message>,
    bt: Arc<dyn BluetoothService>,
    sysproxy: Arc<dyn SysproxyBridge>,
    agent: Arc<Mutex<Box<ProxyNetworkAgent>>>,
    proxy_status: Arc<ProxyStatus>,
    worker: Arc<Runtime>,
    shard_worker: Arc<Runtime>,
    adapter_powered: Arc<StateNotifier<bool>>,
    config: Config,

    companion: Option<CompanionDevice>,
    shard: Option<CompanionProxyShard>,
    hfc: HfcClient,

    first_enable_done: bool,
    boot_completed: bool,
    enabled: bool,
    activity_mode: bool,
    off_body: bool,
    charging: bool,
    time_only_mode: bool,
    acl_connected: bool,

    boot_connect_timer: Option<JoinHandle<()>>,
    decisions: DecisionHistory,
    events: EventHistory,
}

impl BtMediator {
    pub fn new(
        tx: Sender<Message>,
        worker: Arc<Runtime>,
        shard_worker: Arc<Runtime>,
        bt: Arc<dyn BluetoothService>,
        sysproxy: Arc<dyn SysproxyBridge>,
        agent: Arc<Mutex<Box<ProxyNetworkAgent>>>,
        proxy_status: Arc<ProxyStatus>,
        config: Config,
    ) -> Self {
        let hfc = HfcClient::new(bt.clone());
        Self {
            tx,
            bt,
            sysproxy,
            agent,
            proxy_status,
            worker,
            shard_worker,
            adapter_powered: Arc::new(StateNotifier::new(false)),
            config,
            companion: None,
            shard: None,
            hfc,
            first_enable_done: false,
            boot_completed: false,
            enabled: true,
            activity_mode: false,
            off_body: false,
            charging: false,
            time_only_mode: false,
            acl_connected: false,
            boot_connect_timer: None,
            decisions: DecisionHistory::new(),
            events: EventHistory::new("BtMediator"),
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

    pub fn shard_state(&self) -> Option<crate::companion_proxy::ProxyState> {
        self.shard.as_ref().map(|s| s.state())
    }

    pub fn has_boot_connect_timer(&self) -> bool {
        self.boot_connect_timer.is_some()
    }

    fn compute_decision(&self) -> RadioDecision {
        if self.activity_mode {
            RadioDecision::off(RadioKind::Bluetooth, DecisionReason::OffActivityMode)
        } else if self.off_body && !self.charging {
            RadioDecision::off(RadioKind::Bluetooth, DecisionReason::OffOffBody)
        } else if self.time_only_mode {
            RadioDecision::off(RadioKind::Bluetooth, DecisionReason::OffTimeOnlyMode)
        } else {
            RadioDecision::on(RadioKind::Bluetooth, DecisionReason::OnAuto)
        }
    }

    fn evaluate(&mut self) {
        if !self.boot_completed || !self.enabled {
            return;
        }
        let decision = self.compute_decision();
        self.dispatch_decision(decision);
    }

    /// Applies a decision on the dedicated worker. The worker blocks until
    /// the adapter reports the new power state or the settle timeout hits, so
    /// a following decision observes settled state.
    fn dispatch_decision(&mut self, decision: RadioDecision) {
        if !self.decisions.push(decision) {
            return;
        }
        self.events.push(&decision.reason.to_string());
        info!(
            "BT mediator: radio {} ({})",
            if decision.enable { "ON" } else { "OFF" },
            decision.reason
        );

        let bt = self.bt.clone();
        let notifier = self.adapter_powered.clone();
        let enable = decision.enable;
        self.worker.spawn_blocking(move || {
            let accepted = if enable { bt.enable() } else { bt.disable() };
            if !accepted {
                warn!("BT adapter rejected power {}", enable);
                return;
            }
            if !notifier.wait_for(enable, Duration::from_millis(RADIO_SETTLE_TIMEOUT_MS)) {
                warn!(
                    "BT adapter did not settle to {} within {}ms; continuing",
                    enable, RADIO_SETTLE_TIMEOUT_MS
                );
            }
        });
    }

    pub(crate) fn handle_adapter_state(&mut self, state: AdapterState) {
        let powered = state == AdapterState::On;
        self.adapter_powered.update(powered);
        self.events.push(if powered { "AdapterOn" } else { "AdapterOff" });

        match state {
            AdapterState::On => {
                let Some(companion) = self.companion.clone() else {
                    debug!("Adapter on without a companion; nothing to start");
                    return;
                };
                if !self.first_enable_done {
                    self.first_enable_done = true;
                    self.hfc.start(companion.address);
                    self.start_proxy_shard("First Boot");
                    self.arm_boot_connect_timer();
                } else {
                    self.hfc.start(companion.address);
                }
            }
            AdapterState::Off => {
                self.stop_shards();
            }
        }
    }

    pub(crate) fn handle_acl_state(&mut self, addr: RawAddress, state: AclState) {
        let Some(companion) = &self.companion else { return };
        if companion.address != addr {
            debug!("Ignoring ACL change for non-companion {}", DisplayAddress(&addr));
            return;
        }

        match state {
            AclState::Connected => {
                info!("Companion ACL connected");
                self.events.push("CompanionAclConnected");
                self.acl_connected = true;
                if !self.proxy_status.is_connected() {
                    self.start_proxy_shard("Companion Connected");
                }
            }
            AclState::Disconnected => {
                info!("Companion ACL disconnected");
                self.events.push("CompanionAclDisconnected");
                self.acl_connected = false;
                if let Some(shard) = &mut self.shard {
                    shard.stop();
                }
            }
        }
    }

    pub(crate) fn handle_action(&mut self, action: BtMediatorActions) {
        match action {
            BtMediatorActions::CancelConnectOnBoot => {
                self.boot_connect_timer = None;
                if self.proxy_status.is_connected() {
                    return;
                }
                warn!("No proxy connection since boot; tearing the shard down");
                self.events.push("CancelConnectOnBoot");
                if let Some(shard) = &mut self.shard {
                    shard.close();
                }
            }
            BtMediatorActions::ProxyConnectionChanged(connected) => {
                self.events
                    .push(if connected { "ProxyConnected" } else { "ProxyDisconnected" });
                if connected {
                    // A live tunnel satisfies the boot window.
                    if let Some(timer) = self.boot_connect_timer.take() {
                        timer.abort();
                    }
                }
            }
        }
    }

    pub(crate) fn handle_proxy_action(&mut self, action: ProxyActions) {
        match &mut self.shard {
            Some(shard) => shard.handle_action(action),
            None => debug!("Dropping proxy action without a live shard"),
        }
    }

    pub(crate) fn on_companion_changed(&mut self, companion: Option<CompanionDevice>) {
        let previous_address = self.companion.as_ref().map(|c| c.address);
        self.companion = companion;

        match (&self.companion, previous_address) {
            (None, Some(_)) => {
                info!("Companion unpaired; stopping shards");
                self.stop_shards();
            }
            (Some(new), Some(old)) if new.address != old => {
                info!("Companion replaced; stopping shards for the old device");
                self.stop_shards();
            }
            _ => {}
        }

        // Pairing can resolve after the adapter is already powered; run the
        // first-enable path now rather than waiting for the next power cycle.
        if let Some(companion) = self.companion.clone() {
            if self.adapter_powered.get() && !self.first_enable_done {
                self.first_enable_done = true;
                self.hfc.start(companion.address);
                self.start_proxy_shard("First Boot");
                self.arm_boot_connect_timer();
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
        let score = if charging {
            self.config.proxy_score_on_charger
        } else {
            self.config.proxy_score_classic
        };
        if let Some(shard) = &mut self.shard {
            shard.update_score(score);
        }
        self.evaluate();
    }

    pub(crate) fn on_time_only_mode(&mut self, enabled: bool) {
        self.time_only_mode = enabled;
        self.evaluate();
    }

    /// Creates the proxy shard, or signals the live one. At most one shard is
    /// live; a shard for a stale companion is closed first.
    fn start_proxy_shard(&mut self, reason: &str) {
        let Some(companion) = self.companion.clone() else {
            warn!("Proxy shard requested without a companion");
            return;
        };

        if let Some(shard) = &mut self.shard {
            if !shard.is_closed() {
                if shard.companion_address() == companion.address {
                    shard.start(reason);
                    return;
                }
                shard.close();
            }
        }

        let score = if self.charging {
            self.config.proxy_score_on_charger
        } else {
            self.config.proxy_score_classic
        };
        let mut shard = CompanionProxyShard::new(
            self.tx.clone(),
            self.shard_worker.clone(),
            self.bt.clone(),
            self.sysproxy.clone(),
            self.agent.clone(),
            self.proxy_status.clone(),
            companion,
            score,
        );
        shard.register_listener(Box::new(ProxyShardListener { tx: self.tx.clone() }));
        shard.start(reason);
        self.shard = Some(shard);
    }

    fn stop_shards(&mut self) {
        if let Some(shard) = &mut self.shard {
            shard.close();
        }
        self.hfc.stop();
        if let Some(timer) = self.boot_connect_timer.take() {
            timer.abort();
        }
    }

    pub(crate) fn shutdown(&mut self) {
        self.stop_shards();
    }

    fn arm_boot_connect_timer(&mut self) {
        if let Some(timer) = self.boot_connect_timer.take() {
            timer.abort();
        }
        let delay = Duration::from_millis(self.config.cancel_connect_on_boot_delay_ms);
        let tx = self.tx.clone();
        self.boot_connect_timer = Some(tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx
                .send(Message::BtMediatorActions(BtMediatorActions::CancelConnectOnBoot))
                .await;
        }));
    }

    pub fn dump(&self) -> String {
        format!(
            "BtMediator:\n  enabled: {} boot_completed: {} first_enable_done: {}\n  activity: {} off_body: {} charging: {} time_only: {} acl: {}\n  decisions:\n{}\n{}\n{}\n{}",
            self.enabled,
            self.boot_completed,
            self.first_enable_done,
            self.activity_mode,
            self.off_body,
            self.charging,
            self.time_only_mode,
            self.acl_connected,
            self.decisions.dump(),
            self.events.dump(),
            self.hfc.dump(),
            match &self.shard {
                Some(shard) => shard.dump(),
                None => "  no proxy shard".to_string(),
            }
        )
    }
}

/// Forwards shard connectivity into the dispatch loop: the controller gets
/// the (debounced) fan-out signal and the mediator the boot-window signal.
struct ProxyShardListener {
    tx: Sender<Message>,
}

impl ICompanionProxyListener for ProxyShardListener {
    fn on_proxy_connection_change(&mut self, connected: bool, _score: i32) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _ = tx
                .send(Message::ControllerActions(ControllerActions::ProxyChange(connected)))
                .await;
            let _ = tx
                .send(Message::BtMediatorActions(BtMediatorActions::ProxyConnectionChanged(
                    connected,
                )))
                .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::companion_proxy::ProxyState;
    use crate::Supervisor;
    use conn_platform::adapter::{BondState, LinkKind};
    use conn_platform::sim::SimPlatform;

    fn companion_device() -> CompanionDevice {
        CompanionDevice {
            address: RawAddress { address: [2, 2, 2, 2, 2, 2] },
            name: "Pixel".to_string(),
            link_kind: LinkKind::Classic,
            bond_state: BondState::Bonded,
        }
    }

    struct Fixture {
        mediator: BtMediator,
        sim: SimPlatform,
        _rx: tokio::sync::mpsc::Receiver<Message>,
    }

    fn fixture() -> Fixture {
        let sim = SimPlatform::new();
        let (tx, rx) = Supervisor::create_channel();
        let agent: Arc<Mutex<Box<ProxyNetworkAgent>>> = Arc::new(Mutex::new(Box::new(
            ProxyNetworkAgent::new(Arc::new(sim.clone()), 55),
        )));
        let mediator = BtMediator::new(
            tx,
            conn_platform::runtime::get_runtime(),
            conn_platform::runtime::get_runtime(),
            Arc::new(sim.clone()),
            Arc::new(sim.clone()),
            agent,
            Arc::new(ProxyStatus::new()),
            Config::default(),
        );
        Fixture { mediator, sim, _rx: rx }
    }

    #[test]
    fn test_decision_priority_order() {
        let sim = SimPlatform::new();
        let (tx, _rx) = tokio::sync::mpsc::channel(10);
        let agent: Arc<Mutex<Box<ProxyNetworkAgent>>> = Arc::new(Mutex::new(Box::new(
            ProxyNetworkAgent::new(Arc::new(sim.clone()), 55),
        )));
        let mut mediator = BtMediator::new(
            tx,
            conn_platform::runtime::get_runtime(),
            conn_platform::runtime::get_runtime(),
            Arc::new(sim.clone()),
            Arc::new(sim),
            agent,
            Arc::new(ProxyStatus::new()),
            Config::default(),
        );

        assert_eq!(mediator.compute_decision().reason, DecisionReason::OnAuto);

        mediator.time_only_mode = true;
        assert_eq!(mediator.compute_decision().reason, DecisionReason::OffTimeOnlyMode);

        mediator.off_body = true;
        assert_eq!(mediator.compute_decision().reason, DecisionReason::OffOffBody);
        // Charging clears the off-body rule but not time-only.
        mediator.charging = true;
        assert_eq!(mediator.compute_decision().reason, DecisionReason::OffTimeOnlyMode);

        mediator.activity_mode = true;
        assert_eq!(mediator.compute_decision().reason, DecisionReason::OffActivityMode);
    }

    #[tokio::test]
    async fn test_first_enable_starts_shards_and_boot_timer() {
        let mut f = fixture();
        conn_platform::adapter::BluetoothService::enable(&f.sim);

        f.mediator.on_companion_changed(Some(companion_device()));
        f.mediator.on_boot_completed();

        f.mediator.handle_adapter_state(AdapterState::On);
        assert!(f.mediator.first_enable_done);
        assert!(f.mediator.hfc.is_started());
        assert_eq!(f.mediator.shard_state(), Some(ProxyState::SocketRequesting));
        assert!(f.mediator.has_boot_connect_timer());

        // A later enable only re-arms HFC; no new boot window.
        f.mediator.handle_adapter_state(AdapterState::Off);
        assert!(!f.mediator.has_boot_connect_timer());
        f.mediator.handle_adapter_state(AdapterState::On);
        assert!(f.mediator.hfc.is_started());
        assert!(!f.mediator.has_boot_connect_timer());
    }

    #[tokio::test]
    async fn test_adapter_on_without_companion_keeps_latch() {
        let mut f = fixture();
        conn_platform::adapter::BluetoothService::enable(&f.sim);

        f.mediator.handle_adapter_state(AdapterState::On);
        assert!(!f.mediator.first_enable_done);
        assert!(f.mediator.shard_state().is_none());
    }

    #[tokio::test]
    async fn test_acl_events_filtered_to_companion() {
        let mut f = fixture();
        conn_platform::adapter::BluetoothService::enable(&f.sim);
        f.mediator.on_companion_changed(Some(companion_device()));
        f.mediator.on_boot_completed();
        f.mediator.handle_adapter_state(AdapterState::On);

        let stranger = RawAddress { address: [9, 9, 9, 9, 9, 9] };
        f.mediator.handle_acl_state(stranger, AclState::Connected);
        assert!(!f.mediator.acl_connected);

        f.mediator.handle_acl_state(companion_device().address, AclState::Connected);
        assert!(f.mediator.acl_connected);

        f.mediator.handle_acl_state(companion_device().address, AclState::Disconnected);
        assert!(!f.mediator.acl_connected);
    }

    #[tokio::test]
    async fn test_adapter_off_closes_shards() {
        let mut f = fixture();
        conn_platform::adapter::BluetoothService::enable(&f.sim);
        f.mediator.on_companion_changed(Some(companion_device()));
        f.mediator.on_boot_completed();
        f.mediator.handle_adapter_state(AdapterState::On);
        assert!(f.mediator.shard_state().is_some());

        f.mediator.handle_adapter_state(AdapterState::Off);
        assert!(f.mediator.shard.as_ref().unwrap().is_closed());
        assert!(!f.mediator.hfc.is_started());
    }

    #[tokio::test]
    async fn test_boot_window_expiry_closes_unconnected_shard() {
        let mut f = fixture();
        conn_platform::adapter::BluetoothService::enable(&f.sim);
        f.mediator.on_companion_changed(Some(companion_device()));
        f.mediator.on_boot_completed();
        f.mediator.handle_adapter_state(AdapterState::On);

        f.mediator.handle_action(BtMediatorActions::CancelConnectOnBoot);
        assert!(f.mediator.shard.as_ref().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_proxy_connected_cancels_boot_timer() {
        let mut f = fixture();
        conn_platform::adapter::BluetoothService::enable(&f.sim);
        f.mediator.on_companion_changed(Some(companion_device()));
        f.mediator.on_boot_completed();
        f.mediator.handle_adapter_state(AdapterState::On);
        assert!(f.mediator.has_boot_connect_timer());

        f.mediator.handle_action(BtMediatorActions::ProxyConnectionChanged(true));
        assert!(!f.mediator.has_boot_connect_timer());
    }

    #[tokio::test]
    async fn test_charging_rescores_live_shard() {
        let mut f = fixture();
        conn_platform::adapter::BluetoothService::enable(&f.sim);
        f.mediator.on_companion_changed(Some(companion_device()));
        f.mediator.on_boot_completed();
        f.mediator.handle_adapter_state(AdapterState::On);

        f.mediator.on_charging(true);
        assert_eq!(f.mediator.shard.as_ref().unwrap().score(), 100);
        assert!(!f.mediator.shard.as_ref().unwrap().is_closed());

        f.mediator.on_charging(false);
        assert_eq!(f.mediator.shard.as_ref().unwrap().score(), 55);
    }

    #[tokio::test]
    async fn test_activity_mode_records_off_decision() {
        let mut f = fixture();
        f.mediator.on_boot_completed();

        f.mediator.on_activity_mode(true);
        let decision = f.mediator.latest_decision().unwrap();
        assert!(!decision.enable);
        assert_eq!(decision.reason, DecisionReason::OffActivityMode);
    }

    #[tokio::test]
    async fn test_companion_unpair_closes_shard() {
        let mut f = fixture();
        conn_platform::adapter::BluetoothService::enable(&f.sim);
        f.mediator.on_companion_changed(Some(companion_device()));
        f.mediator.on_boot_completed();
        f.mediator.handle_adapter_state(AdapterState::On);
        assert!(f.mediator.shard_state().is_some());

        f.mediator.on_companion_changed(None);
        assert!(f.mediator.shard.as_ref().unwrap().is_closed());
    }
}
