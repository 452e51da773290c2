//! Typed interface to the host network stack.

use bitflags::bitflags;
use num_derive::{FromPrimitive, ToPrimitive};

/// Network type advertised for the companion proxy.
pub const NETWORK_TYPE_PROXY: i32 = 16;
pub const NETWORK_SUBTYPE_NONE: i32 = 0;
pub const COMPANION_PROXY_TYPE_NAME: &str = "COMPANION_PROXY";

/// Link bandwidth advertised for the tunnel, both directions.
pub const PROXY_BANDWIDTH_KBPS: u32 = 1600;

/// Detailed state carried in NetworkInfo.
#[derive(Clone, Copy, Debug, FromPrimitive, ToPrimitive, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum DetailedState {
    Connecting = 0,
    Connected,
    Suspended,
    Disconnecting,
    Disconnected,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TransportFlags: u32 {
        const BLUETOOTH = 1 << 0;
        const WIFI = 1 << 1;
        const CELLULAR = 1 << 2;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CapabilityFlags: u32 {
        const INTERNET = 1 << 0;
        const NOT_RESTRICTED = 1 << 1;
        const NOT_ROAMING = 1 << 2;
        const NOT_CONGESTED = 1 << 3;
        const NOT_METERED = 1 << 4;
    }
}

/// NetworkInfo published with an agent. Type fields are fixed for the proxy.
#[derive(Clone, Debug, PartialEq)]
pub struct NetworkInfo {
    pub state: DetailedState,
    pub reason: Option<String>,
    pub extra: Option<String>,
}

impl NetworkInfo {
    pub fn new(state: DetailedState, reason: &str, extra: Option<String>) -> Self {
        Self { state, reason: Some(reason.to_string()), extra }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NetworkCapabilities {
    pub transports: TransportFlags,
    pub capabilities: CapabilityFlags,
    pub link_up_bandwidth_kbps: u32,
    pub link_down_bandwidth_kbps: u32,
}

impl NetworkCapabilities {
    /// Capabilities advertised for the companion proxy tunnel.
    pub fn companion_proxy() -> Self {
        Self {
            transports: TransportFlags::BLUETOOTH,
            capabilities: CapabilityFlags::INTERNET
                | CapabilityFlags::NOT_RESTRICTED
                | CapabilityFlags::NOT_ROAMING
                | CapabilityFlags::NOT_CONGESTED
                | CapabilityFlags::NOT_METERED,
            link_up_bandwidth_kbps: PROXY_BANDWIDTH_KBPS,
            link_down_bandwidth_kbps: PROXY_BANDWIDTH_KBPS,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LinkProperties {
    pub interface_name: String,
}

pub type AgentId = u32;

/// Capability interface to the host network stack's agent registry.
pub trait NetworkRegistry: Send + Sync {
    /// Registers a network agent and returns its id.
    fn register(
        &self,
        info: &NetworkInfo,
        caps: &NetworkCapabilities,
        link: &LinkProperties,
        score: i32,
    ) -> AgentId;

    fn unregister(&self, agent: AgentId) -> bool;

    fn send_info(&self, agent: AgentId, info: &NetworkInfo);

    fn send_capabilities(&self, agent: AgentId, caps: &NetworkCapabilities);

    fn send_score(&self, agent: AgentId, score: i32);
}

/// Callbacks from the host network stack.
#[derive(Clone, Debug)]
pub enum ConnectivityCallbacks {
    /// The stack no longer wants this agent; tear it down.
    AgentUnwanted(AgentId),
    /// Outstanding network request counts changed.
    RequestCounts { wifi: u32, cell: u32, high_bandwidth: u32, unmetered: u32 },
}

pub struct ConnectivityCallbacksDispatcher {
    pub dispatch: Box<dyn Fn(ConnectivityCallbacks) + Send>,
}
