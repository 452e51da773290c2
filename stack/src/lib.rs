//! Wearable connectivity supervisor stack.
//!
//! This crate provides the control plane that decides which radios are
//! powered and which transport carries IP traffic, independent of any
//! particular driver or system-service binding.

pub mod bt_mediator;
pub mod callbacks;
pub mod cell_mediator;
pub mod companion_proxy;
pub mod companion_tracker;
pub mod config;
pub mod controller;
pub mod hfc_client;
pub mod history;
pub mod logging;
pub mod network_agent;
pub mod off_body_tracker;
pub mod power_tracker;
pub mod wifi_mediator;

use log::{error, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::channel;
use tokio::sync::mpsc::{Receiver, Sender};

use conn_platform::adapter::{AdapterCallbacks, AdapterCallbacksDispatcher};
use conn_platform::connectivity::{ConnectivityCallbacks, ConnectivityCallbacksDispatcher};
use conn_platform::device_state::{DeviceStateCallbacks, DeviceStateCallbacksDispatcher};
use conn_platform::settings::{SettingsCallbacks, SettingsCallbacksDispatcher};
use conn_platform::sysproxy::{SysproxyCallbacks, SysproxyCallbacksDispatcher};
use conn_platform::telephony::{TelephonyCallbacks, TelephonyCallbacksDispatcher};
use conn_platform::wifi::{WifiCallbacks, WifiCallbacksDispatcher};

use crate::bt_mediator::{BtMediator, BtMediatorActions};
use crate::cell_mediator::CellMediator;
use crate::companion_proxy::ProxyActions;
use crate::companion_tracker::{CompanionDevice, CompanionTracker};
use crate::controller::{ConnectivityController, ControllerActions};
use crate::network_agent::ProxyNetworkAgent;
use crate::off_body_tracker::OffBodyTracker;
use crate::power_tracker::PowerTracker;
use crate::wifi_mediator::WifiMediator;

/// Where a Dump message writes its output.
const DUMP_LOG: &str = "/tmp/wearconnd_dump.log";

/// Message types that are sent to the supervisor main dispatch loop.
pub enum Message {
    /// Orderly teardown; the dispatch loop exits afterwards.
    Shutdown,
    /// The platform finished booting; mediators may act from here on.
    BootCompleted,
    /// Write the diagnostic dump.
    Dump,

    // Callbacks from the platform edge.
    Adapter(AdapterCallbacks),
    Telephony(TelephonyCallbacks),
    Wifi(WifiCallbacks),
    Sysproxy(SysproxyCallbacks),
    Connectivity(ConnectivityCallbacks),
    DeviceState(DeviceStateCallbacks),
    Settings(SettingsCallbacks),

    // Actions within the stack.
    ControllerActions(ControllerActions),
    BtMediatorActions(BtMediatorActions),
    ProxyActions(ProxyActions),

    // Tracker publications.
    CompanionChanged(Option<CompanionDevice>),
    OffBodyChanged(bool),
    ChargingChanged(bool),
    PowerSaveChanged(bool),
}

/// Returns a callable object that dispatches a platform callback to Message.
///
/// The returned object makes sure callbacks enter the channel in the order
/// they arrived from the platform, even though each send runs as its own
/// task.
pub(crate) fn make_message_dispatcher<F, Cb>(tx: Sender<Message>, f: F) -> Box<dyn Fn(Cb) + Send>
where
    Cb: Send + 'static,
    F: Fn(Cb) -> Message + Send + Copy + 'static,
{
    let async_mutex = Arc::new(tokio::sync::Mutex::new(()));
    let dispatch_queue = Arc::new(Mutex::new(VecDeque::new()));

    Box::new(move |cb| {
        let tx = tx.clone();
        let async_mutex = async_mutex.clone();
        let dispatch_queue = dispatch_queue.clone();
        // Enqueue under the lock so ordering survives the task handoff.
        dispatch_queue.lock().unwrap().push_back(cb);
        conn_platform::runtime::get_runtime().spawn(async move {
            let _guard = async_mutex.lock().await;
            let cb = dispatch_queue.lock().unwrap().pop_front().unwrap();
            let _ = tx.send(f(cb)).await;
        });
    })
}

pub fn get_adapter_dispatcher(tx: Sender<Message>) -> AdapterCallbacksDispatcher {
    AdapterCallbacksDispatcher { dispatch: make_message_dispatcher(tx, Message::Adapter) }
}

pub fn get_telephony_dispatcher(tx: Sender<Message>) -> TelephonyCallbacksDispatcher {
    TelephonyCallbacksDispatcher { dispatch: make_message_dispatcher(tx, Message::Telephony) }
}

pub fn get_wifi_dispatcher(tx: Sender<Message>) -> WifiCallbacksDispatcher {
    WifiCallbacksDispatcher { dispatch: make_message_dispatcher(tx, Message::Wifi) }
}

pub fn get_sysproxy_dispatcher(tx: Sender<Message>) -> SysproxyCallbacksDispatcher {
    SysproxyCallbacksDispatcher { dispatch: make_message_dispatcher(tx, Message::Sysproxy) }
}

pub fn get_connectivity_dispatcher(tx: Sender<Message>) -> ConnectivityCallbacksDispatcher {
    ConnectivityCallbacksDispatcher { dispatch: make_message_dispatcher(tx, Message::Connectivity) }
}

pub fn get_device_state_dispatcher(tx: Sender<Message>) -> DeviceStateCallbacksDispatcher {
    DeviceStateCallbacksDispatcher { dispatch: make_message_dispatcher(tx, Message::DeviceState) }
}

pub fn get_settings_dispatcher(tx: Sender<Message>) -> SettingsCallbacksDispatcher {
    SettingsCallbacksDispatcher { dispatch: make_message_dispatcher(tx, Message::Settings) }
}

/// Umbrella class for the supervisor stack.
pub struct Supervisor {}

impl Supervisor {
    /// Creates an mpsc channel for passing messages to the main dispatch loop.
    pub fn create_channel() -> (Sender<Message>, Receiver<Message>) {
        channel::<Message>(1)
    }

    /// Runs the main dispatch loop. Every component is owned by this loop;
    /// messages are processed strictly in arrival order.
    pub async fn dispatch(
        mut rx: Receiver<Message>,
        controller: Arc<Mutex<Box<ConnectivityController>>>,
        companion_tracker: Arc<Mutex<Box<CompanionTracker>>>,
        power_tracker: Arc<Mutex<Box<PowerTracker>>>,
        off_body_tracker: Arc<Mutex<Box<OffBodyTracker>>>,
        bt_mediator: Arc<Mutex<Box<BtMediator>>>,
        wifi_mediator: Arc<Mutex<Box<WifiMediator>>>,
        cell_mediator: Arc<Mutex<Box<CellMediator>>>,
        network_agent: Arc<Mutex<Box<ProxyNetworkAgent>>>,
    ) {
        loop {
            let m = rx.recv().await;

            if m.is_none() {
                eprintln!("Message dispatch loop quit");
                break;
            }

            match m.unwrap() {
                Message::Shutdown => {
                    info!("Supervisor shutting down");
                    controller.lock().unwrap().shutdown();
                    network_agent.lock().unwrap().tear_down_all();
                    break;
                }

                Message::BootCompleted => {
                    controller.lock().unwrap().on_boot_completed();
                }

                Message::Dump => {
                    let dump = [
                        controller.lock().unwrap().dump(),
                        companion_tracker.lock().unwrap().dump(),
                        power_tracker.lock().unwrap().dump(),
                        off_body_tracker.lock().unwrap().dump(),
                        bt_mediator.lock().unwrap().dump(),
                        wifi_mediator.lock().unwrap().dump(),
                        cell_mediator.lock().unwrap().dump(),
                        network_agent.lock().unwrap().dump(),
                    ]
                    .join("\n");
                    if let Err(e) = std::fs::write(DUMP_LOG, &dump) {
                        error!("Failed to write {}: {}", DUMP_LOG, e);
                    } else {
                        info!("Dump written to {}", DUMP_LOG);
                    }
                }

                Message::Adapter(cb) => match cb {
                    AdapterCallbacks::AdapterState(state) => {
                        bt_mediator.lock().unwrap().handle_adapter_state(state);
                    }
                    AdapterCallbacks::AclState(addr, state, _link) => {
                        bt_mediator.lock().unwrap().handle_acl_state(addr, state);
                    }
                    AdapterCallbacks::BondState(addr, state, link) => {
                        companion_tracker.lock().unwrap().handle_bond_state(addr, state, link);
                    }
                    AdapterCallbacks::RemoteName(addr, name) => {
                        companion_tracker.lock().unwrap().handle_remote_name(addr, name);
                    }
                },

                Message::Telephony(cb) => {
                    let mut cell = cell_mediator.lock().unwrap();
                    match cb {
                        TelephonyCallbacks::ServiceState(state) => cell.handle_service_state(state),
                        TelephonyCallbacks::SignalState(signal) => cell.handle_signal_state(signal),
                        TelephonyCallbacks::SimState(state) => cell.handle_sim_state(state),
                        TelephonyCallbacks::PhoneState(state) => cell.handle_phone_state(state),
                    }
                }

                Message::Wifi(cb) => {
                    wifi_mediator.lock().unwrap().handle_callback(cb);
                }

                Message::Sysproxy(cb) => {
                    let action = match cb {
                        SysproxyCallbacks::Connected { network_type, metered } => {
                            ProxyActions::NativeConnected { network_type, metered }
                        }
                        SysproxyCallbacks::Disconnected { status } => {
                            ProxyActions::NativeDisconnected { status }
                        }
                    };
                    bt_mediator.lock().unwrap().handle_proxy_action(action);
                }

                Message::Connectivity(cb) => match cb {
                    ConnectivityCallbacks::AgentUnwanted(id) => {
                        network_agent.lock().unwrap().handle_unwanted(id);
                    }
                    ConnectivityCallbacks::RequestCounts {
                        wifi,
                        cell,
                        high_bandwidth,
                        unmetered,
                    } => {
                        controller
                            .lock()
                            .unwrap()
                            .on_request_counts(wifi, cell, high_bandwidth, unmetered);
                    }
                },

                Message::DeviceState(cb) => match cb {
                    DeviceStateCallbacks::OnBodyState { is_on_body, last_changed_ms } => {
                        off_body_tracker.lock().unwrap().handle_on_body(is_on_body, last_changed_ms);
                    }
                    DeviceStateCallbacks::ScreenState { on } => {
                        off_body_tracker.lock().unwrap().handle_screen(on);
                    }
                    DeviceStateCallbacks::Charging { plugged } => {
                        power_tracker.lock().unwrap().handle_charging(plugged);
                    }
                    DeviceStateCallbacks::PowerSave { enabled } => {
                        power_tracker.lock().unwrap().handle_power_save(enabled);
                    }
                    DeviceStateCallbacks::AirplaneMode { enabled } => {
                        power_tracker.lock().unwrap().handle_airplane_mode(enabled);
                    }
                    DeviceStateCallbacks::ActivityMode { enabled, affected } => {
                        controller.lock().unwrap().on_activity_mode(enabled, &affected);
                    }
                    DeviceStateCallbacks::LocationMode { enabled } => {
                        controller.lock().unwrap().on_location_mode(enabled);
                    }
                },

                Message::Settings(SettingsCallbacks::Changed { key }) => {
                    controller.lock().unwrap().handle_setting_changed(&key);
                }

                Message::ControllerActions(action) => {
                    controller.lock().unwrap().handle_action(action);
                }

                Message::BtMediatorActions(action) => {
                    bt_mediator.lock().unwrap().handle_action(action);
                }

                Message::ProxyActions(action) => {
                    bt_mediator.lock().unwrap().handle_proxy_action(action);
                }

                Message::CompanionChanged(companion) => {
                    controller.lock().unwrap().on_companion_changed(companion);
                }

                Message::OffBodyChanged(off_body) => {
                    controller.lock().unwrap().on_off_body_change(off_body);
                }

                Message::ChargingChanged(charging) => {
                    controller.lock().unwrap().on_charging(charging);
                }

                Message::PowerSaveChanged(enabled) => {
                    controller.lock().unwrap().on_power_save(enabled);
                }
            }
        }
        warn!("Dispatch loop exited");
    }
}
