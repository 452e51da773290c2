//! Reconnecting supervisor for the companion IP-over-RFCOMM tunnel.
//!
//! While a companion is paired and the adapter is up, the shard keeps the
//! native sysproxy tunnel either connected or reconnecting: it obtains an
//! RFCOMM socket off-thread, hands the fd to the native bridge, publishes the
//! resulting virtual network, and recovers from every failure through
//! multi-stage exponential backoff. All state transitions happen on the
//! dispatch loop; background tasks only post results back.

use log::{debug, info, warn};
use std::fs::File;
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::Runtime;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use conn_platform::adapter::{
    BluetoothService, BondState, DisplayAddress, SOCK_META_FLAG_SECURE, SYSPROXY_UUID,
};
use conn_platform::connectivity::DetailedState;
use conn_platform::sysproxy::SysproxyBridge;
use conn_platform::CommandStatus;

use crate::callbacks::Callbacks;
use crate::companion_tracker::CompanionDevice;
use crate::history::EventHistory;
use crate::network_agent::ProxyNetworkAgent;
use crate::Message;

const BACKOFF_BASE_INTERVAL: u32 = 2;
const BACKOFF_BASE_PERIOD_SECS: u32 = 5;
const BACKOFF_MAX_PERIOD_SECS: u32 = 300;

static NEXT_INSTANCE: AtomicU32 = AtomicU32::new(1);

/// Tunnel state. Transitions form a cycle through the connect path; any state
/// may fall back to `Disconnected` on failure or close.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyState {
    Disconnected,
    SocketRequesting,
    SocketRetrieved,
    SocketDelivering,
    SocketDelivered,
    Connected,
    DisconnectRequest,
    DisconnectResponse,
}

/// Lock-free view of the tunnel for read-only observers on other threads.
pub struct ProxyStatus {
    connected: AtomicBool,
}

impl ProxyStatus {
    pub fn new() -> Self {
        Self { connected: AtomicBool::new(false) }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl Default for ProxyStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer of tunnel connectivity. Disconnects may be delivered more than
/// once; implementations deduplicate.
pub trait ICompanionProxyListener: Send {
    fn on_proxy_connection_change(&mut self, connected: bool, score: i32);
}

/// Shard events posted to the dispatch loop.
pub enum ProxyActions {
    /// Result of the off-thread RFCOMM socket request.
    SocketResult { instance: u32, socket: Option<File> },
    /// Result of handing the fd to the native bridge.
    DeliverResult { instance: u32, delivered: bool },
    /// Native tunnel established.
    NativeConnected { network_type: i32, metered: bool },
    /// Native tunnel dropped.
    NativeDisconnected { status: i32 },
    /// Tear the connection state back down, then retry.
    Reset { instance: u32 },
    /// Backoff timer fired.
    RetryTick { instance: u32 },
}

pub struct CompanionProxyShard {
    instance: u32,
    companion: CompanionDevice,
    score: i32,
    state: ProxyState,
    closed: bool,
    closed_flag: Arc<AtomicBool>,
    proxy_status: Arc<ProxyStatus>,
    backoff: conn_utils::backoff::MultistageBackoff,
    retry_timer: Option<JoinHandle<()>>,
    last_published: Option<bool>,

    bt: Arc<dyn BluetoothService>,
    sysproxy: Arc<dyn SysproxyBridge>,
    agent: Arc<Mutex<Box<ProxyNetworkAgent>>>,
    listeners: Callbacks<dyn ICompanionProxyListener + Send>,
    events: EventHistory,
    worker: Arc<Runtime>,
    tx: Sender<Message>,
}

impl CompanionProxyShard {
    pub fn new(
        tx: Sender<Message>,
        worker: Arc<Runtime>,
        bt: Arc<dyn BluetoothService>,
        sysproxy: Arc<dyn SysproxyBridge>,
        agent: Arc<Mutex<Box<ProxyNetworkAgent>>>,
        proxy_status: Arc<ProxyStatus>,
        companion: CompanionDevice,
        score: i32,
    ) -> Self {
        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::SeqCst);
        info!(
            "Proxy shard {} created for {}",
            instance,
            DisplayAddress(&companion.address)
        );
        Self {
            instance,
            companion,
            score,
            state: ProxyState::Disconnected,
            closed: false,
            closed_flag: Arc::new(AtomicBool::new(false)),
            proxy_status,
            backoff: conn_utils::backoff::MultistageBackoff::new(
                BACKOFF_BASE_INTERVAL,
                BACKOFF_BASE_PERIOD_SECS,
                BACKOFF_MAX_PERIOD_SECS,
            ),
            retry_timer: None,
            last_published: None,
            bt,
            sysproxy,
            agent,
            listeners: Callbacks::new(),
            events: EventHistory::new("CompanionProxyShard"),
            worker,
            tx,
        }
    }

    pub fn instance(&self) -> u32 {
        self.instance
    }

    pub fn companion_address(&self) -> conn_platform::adapter::RawAddress {
        self.companion.address
    }

    pub fn state(&self) -> ProxyState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn score(&self) -> i32 {
        self.score
    }

    pub fn register_listener(&mut self, listener: Box<dyn ICompanionProxyListener + Send>) -> u32 {
        self.listeners.add_callback(listener)
    }

    pub fn unregister_listener(&mut self, id: u32) -> bool {
        self.listeners.remove_callback(id)
    }

    fn set_state(&mut self, state: ProxyState) {
        if self.state == state {
            return;
        }
        debug!("Proxy shard {}: {:?} -> {:?}", self.instance, self.state, state);
        self.state = state;
        self.events.push(&format!("{:?}", state));
    }

    /// Starts or resumes the connect path.
    pub fn start(&mut self, reason: &str) {
        if self.closed {
            warn!("Proxy shard {}: start({}) after close", self.instance, reason);
            return;
        }
        match self.state {
            ProxyState::Disconnected => {
                if !self.bt.is_enabled() {
                    warn!("Proxy shard {}: start({}) refused, adapter is off", self.instance, reason);
                    self.events.push("StartRefusedAdapterOff");
                    return;
                }
                if self.companion.bond_state != BondState::Bonded {
                    warn!(
                        "Proxy shard {}: start({}) refused, companion not bonded",
                        self.instance, reason
                    );
                    self.events.push("StartRefusedNotBonded");
                    return;
                }
                info!("Proxy shard {}: starting ({})", self.instance, reason);
                self.set_state(ProxyState::SocketRequesting);
                {
                    let mut agent = self.agent.lock().unwrap();
                    agent.ensure(reason);
                    agent.set_current_info(
                        DetailedState::Connecting,
                        reason,
                        Some(self.companion.name.clone()),
                    );
                }
                self.request_socket();
            }
            ProxyState::Connected => {
                debug!("Proxy shard {}: start({}) while connected", self.instance, reason);
                self.agent.lock().unwrap().set_current_info(
                    DetailedState::Connected,
                    reason,
                    Some(self.companion.name.clone()),
                );
            }
            _ => {
                debug!(
                    "Proxy shard {}: start({}) in {:?}, retrying later",
                    self.instance, reason, self.state
                );
                self.schedule_retry();
            }
        }
    }

    /// Drops the connection without closing the shard; the backoff path will
    /// bring it back.
    pub fn stop(&mut self) {
        if self.closed {
            return;
        }
        match self.state {
            ProxyState::Connected => {
                info!("Proxy shard {}: stopping", self.instance);
                self.publish_disconnected("stop");
                self.schedule_retry();
            }
            _ => {
                debug!("Proxy shard {}: stop in {:?} ignored", self.instance, self.state);
            }
        }
    }

    /// Terminal teardown. Idempotent; outstanding background results are
    /// discarded.
    pub fn close(&mut self) {
        if self.closed {
            debug!("Proxy shard {}: already closed", self.instance);
            return;
        }
        info!("Proxy shard {}: closing", self.instance);
        let sysproxy = self.sysproxy.clone();
        if self.last_published == Some(true) {
            // Orderly teardown of a live tunnel: request the native
            // disconnect, acknowledge it, then publish.
            self.set_state(ProxyState::DisconnectRequest);
            self.worker.spawn_blocking(move || {
                sysproxy.disconnect();
            });
            self.set_state(ProxyState::DisconnectResponse);
            self.publish_disconnected("close");
        } else {
            self.worker.spawn_blocking(move || {
                sysproxy.disconnect();
            });
            self.set_state(ProxyState::Disconnected);
            self.proxy_status.set_connected(false);
            self.agent.lock().unwrap().set_current_info(
                DetailedState::Disconnected,
                "close",
                None,
            );
        }
        self.closed = true;
        self.closed_flag.store(true, Ordering::SeqCst);
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }

    /// Charger transitions re-score the network without tearing it down.
    pub fn update_score(&mut self, score: i32) {
        if self.score == score {
            return;
        }
        self.score = score;
        if self.state == ProxyState::Connected {
            self.agent.lock().unwrap().send_score(score);
        }
    }

    pub fn handle_action(&mut self, action: ProxyActions) {
        match action {
            ProxyActions::SocketResult { instance, socket } => {
                if !self.accepts(instance) {
                    return;
                }
                match socket {
                    Some(file) => {
                        if self.state != ProxyState::SocketRequesting {
                            warn!(
                                "Proxy shard {}: socket arrived in {:?}",
                                self.instance, self.state
                            );
                            self.schedule_reset();
                            return;
                        }
                        self.set_state(ProxyState::SocketRetrieved);
                        self.deliver_socket(file);
                    }
                    None => {
                        warn!("Proxy shard {}: socket request failed", self.instance);
                        self.schedule_reset();
                    }
                }
            }

            ProxyActions::DeliverResult { instance, delivered } => {
                if !self.accepts(instance) {
                    return;
                }
                if !delivered {
                    warn!("Proxy shard {}: socket delivery failed", self.instance);
                    self.schedule_reset();
                } else if self.state == ProxyState::SocketDelivering {
                    // The fd now belongs to the native tunnel; wait for its
                    // connected callback.
                    self.set_state(ProxyState::SocketDelivered);
                } else {
                    // The native callback can outrun the delivery result.
                    debug!(
                        "Proxy shard {}: delivery confirmed in {:?}",
                        self.instance, self.state
                    );
                }
            }

            ProxyActions::NativeConnected { network_type, metered } => {
                if self.closed {
                    return;
                }
                if network_type < 0 {
                    warn!(
                        "Proxy shard {}: native connect with invalid type {}",
                        self.instance, network_type
                    );
                    self.schedule_reset();
                    return;
                }
                info!(
                    "Proxy shard {}: tunnel up (type {}, metered {})",
                    self.instance, network_type, metered
                );
                self.set_state(ProxyState::Connected);
                self.backoff.reset();
                if let Some(timer) = self.retry_timer.take() {
                    timer.abort();
                }
                self.proxy_status.set_connected(true);
                {
                    let mut agent = self.agent.lock().unwrap();
                    agent.set_current_info(
                        DetailedState::Connected,
                        "connected",
                        Some(self.companion.name.clone()),
                    );
                    agent.set_metered(metered);
                    agent.send_score(self.score);
                }
                self.last_published = Some(true);
                let score = self.score;
                self.listeners.for_all_callbacks(|listener| {
                    listener.on_proxy_connection_change(true, score);
                });
            }

            ProxyActions::NativeDisconnected { status } => {
                if self.closed {
                    return;
                }
                if self.state == ProxyState::Disconnected {
                    // Repeated native disconnects collapse into the first.
                    debug!("Proxy shard {}: duplicate native disconnect", self.instance);
                    return;
                }
                info!("Proxy shard {}: tunnel down (status {})", self.instance, status);
                self.publish_disconnected("native disconnect");
                self.schedule_retry();
            }

            ProxyActions::Reset { instance } => {
                if !self.accepts(instance) {
                    return;
                }
                self.do_reset();
            }

            ProxyActions::RetryTick { instance } => {
                if !self.accepts(instance) {
                    return;
                }
                self.retry_timer = None;
                self.start("Retry");
            }
        }
    }

    /// Background results and timers are only honored when they belong to
    /// this instance and the shard is still open.
    fn accepts(&self, instance: u32) -> bool {
        if self.closed {
            debug!("Proxy shard {}: dropping result after close", self.instance);
            return false;
        }
        if instance != self.instance {
            debug!(
                "Proxy shard {}: dropping result for stale instance {}",
                self.instance, instance
            );
            return false;
        }
        true
    }

    fn request_socket(&mut self) {
        let instance = self.instance;
        let closed = self.closed_flag.clone();
        let bt = self.bt.clone();
        let address = self.companion.address;
        let tx = self.tx.clone();

        self.worker.spawn_blocking(move || {
            let (status, socket) = bt.connect_socket(address, SYSPROXY_UUID, SOCK_META_FLAG_SECURE);
            if closed.load(Ordering::SeqCst) {
                // Shard went away while we were blocked on the driver; the fd
                // (if any) is dropped and closed here.
                return;
            }
            let socket = match (status, socket) {
                (CommandStatus::Success, Ok(file)) => Some(file),
                (status, _) => {
                    warn!("Socket request finished with {:?}", status);
                    None
                }
            };
            let _ = tx.blocking_send(Message::ProxyActions(ProxyActions::SocketResult {
                instance,
                socket,
            }));
        });
    }

    fn deliver_socket(&mut self, socket: File) {
        self.set_state(ProxyState::SocketDelivering);

        let instance = self.instance;
        let closed = self.closed_flag.clone();
        let sysproxy = self.sysproxy.clone();
        let tx = self.tx.clone();

        self.worker.spawn_blocking(move || {
            let fd = socket.into_raw_fd();
            let delivered = sysproxy.connect(fd);
            if !delivered {
                // Ownership stays with us on failure; reclaim and close.
                // SAFETY: the native side did not adopt the fd.
                drop(unsafe { File::from_raw_fd(fd) });
            }
            if closed.load(Ordering::SeqCst) {
                return;
            }
            let _ = tx.blocking_send(Message::ProxyActions(ProxyActions::DeliverResult {
                instance,
                delivered,
            }));
        });
    }

    fn publish_disconnected(&mut self, reason: &str) {
        self.set_state(ProxyState::Disconnected);
        self.proxy_status.set_connected(false);
        self.agent.lock().unwrap().set_current_info(DetailedState::Disconnected, reason, None);
        if self.last_published != Some(false) {
            self.last_published = Some(false);
            let score = self.score;
            self.listeners.for_all_callbacks(|listener| {
                listener.on_proxy_connection_change(false, score);
            });
        }
    }

    /// Posts a reset so the teardown runs as its own dispatch step.
    fn schedule_reset(&mut self) {
        let instance = self.instance;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(Message::ProxyActions(ProxyActions::Reset { instance })).await;
        });
    }

    fn do_reset(&mut self) {
        self.events.push("Reset");
        let sysproxy = self.sysproxy.clone();
        self.worker.spawn_blocking(move || {
            sysproxy.disconnect();
        });
        self.publish_disconnected("reset");
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        if self.closed || self.retry_timer.is_some() {
            return;
        }
        let period = self.backoff.next_period_secs();
        info!("Proxy shard {}: retrying in {}s", self.instance, period);

        let instance = self.instance;
        let tx = self.tx.clone();
        self.retry_timer = Some(tokio::spawn(async move {
            sleep(Duration::from_secs(period.into())).await;
            let _ = tx.send(Message::ProxyActions(ProxyActions::RetryTick { instance })).await;
        }));
    }

    pub fn has_retry_scheduled(&self) -> bool {
        self.retry_timer.is_some()
    }

    pub fn dump(&self) -> String {
        format!(
            "CompanionProxyShard:\n  instance: {} (created {})\n  companion: {} state: {:?} closed: {} score: {}\n  next_retry_secs: {}\n{}",
            self.instance,
            NEXT_INSTANCE.load(Ordering::SeqCst) - 1,
            DisplayAddress(&self.companion.address),
            self.state,
            self.closed,
            self.score,
            self.backoff.peek_period_secs(),
            self.events.dump()
        )
    }
}

impl Drop for CompanionProxyShard {
    fn drop(&mut self) {
        // Backstop for mediator bugs; a live shard must not leak its timers.
        if !self.closed {
            if let Some(timer) = self.retry_timer.take() {
                timer.abort();
            }
        }
    }
}
