//! Virtual network agents registered with the host network stack.

use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use itertools::Itertools;

use conn_platform::connectivity::{
    AgentId, CapabilityFlags, DetailedState, LinkProperties, NetworkCapabilities, NetworkInfo,
    NetworkRegistry, COMPANION_PROXY_TYPE_NAME, NETWORK_SUBTYPE_NONE, NETWORK_TYPE_PROXY,
};

/// One registered virtual network.
#[derive(Clone, Debug)]
pub struct NetworkAgentRecord {
    pub id: AgentId,
    pub info: NetworkInfo,
    pub caps: NetworkCapabilities,
    pub link: LinkProperties,
    pub score: i32,
}

/// The score advertised to the stack before an agent exists only ratchets
/// upward, so a flapping proxy does not thrash default-route selection; an
/// explicit re-score resets it.
struct ScoreFilter {
    advertised: i32,
}

impl ScoreFilter {
    fn advertise(&mut self, requested: i32) -> i32 {
        self.advertised = std::cmp::max(self.advertised, requested);
        self.advertised
    }

    fn rescore(&mut self, score: i32) -> i32 {
        self.advertised = score;
        score
    }
}

/// Owns every agent record: one may be current, the rest are waiting for the
/// stack's unwanted callback before they are torn down.
pub struct ProxyNetworkAgent {
    registry: Arc<dyn NetworkRegistry>,
    records: HashMap<AgentId, NetworkAgentRecord>,
    current: Option<AgentId>,
    unwanted_pending: HashSet<AgentId>,
    score_filter: ScoreFilter,
    active: bool,

    // Parameters reused when `ensure` has to create an agent outside a full
    // `setup` call.
    caps: NetworkCapabilities,
    link: LinkProperties,
    score: i32,
    companion_name: String,
}

impl ProxyNetworkAgent {
    pub fn new(registry: Arc<dyn NetworkRegistry>, score: i32) -> Self {
        Self {
            registry,
            records: HashMap::new(),
            current: None,
            unwanted_pending: HashSet::new(),
            score_filter: ScoreFilter { advertised: score },
            active: false,
            caps: NetworkCapabilities::companion_proxy(),
            link: LinkProperties::default(),
            score,
            companion_name: String::new(),
        }
    }

    pub fn current_id(&self) -> Option<AgentId> {
        self.current
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Creates a current agent if none exists.
    pub fn ensure(&mut self, reason: &str) {
        if self.current.is_some() {
            return;
        }
        let caps = self.caps.clone();
        let link = self.link.clone();
        let score = self.score;
        let name = self.companion_name.clone();
        self.setup(reason, caps, link, score, &name, false);
    }

    /// Registers a new current agent. With `force_new` false an existing
    /// current agent is kept as-is; with true the previous agent stays in the
    /// record set until the stack reports it unwanted.
    pub fn setup(
        &mut self,
        reason: &str,
        caps: NetworkCapabilities,
        link: LinkProperties,
        score: i32,
        companion_name: &str,
        force_new: bool,
    ) {
        if !force_new && self.current.is_some() {
            debug!("NetworkAgent: setup({}) reusing current agent", reason);
            return;
        }

        self.caps = caps.clone();
        self.link = link.clone();
        self.score = score;
        self.companion_name = companion_name.to_string();

        let advertised = self.score_filter.advertise(score);
        let info = NetworkInfo::new(
            DetailedState::Connecting,
            reason,
            Some(companion_name.to_string()),
        );
        let id = self.registry.register(&info, &caps, &link, score);
        info!(
            "NetworkAgent: registered agent {} ({}) score {} (advertised {})",
            id, reason, score, advertised
        );
        self.records.insert(id, NetworkAgentRecord { id, info, caps, link, score });
        self.current = Some(id);
        self.active = true;
    }

    /// Updates and transmits the current agent's NetworkInfo; silent no-op
    /// without one.
    pub fn set_current_info(&mut self, state: DetailedState, reason: &str, extra: Option<String>) {
        let Some(id) = self.current else { return };
        let Some(record) = self.records.get_mut(&id) else { return };
        record.info = NetworkInfo::new(state, reason, extra);
        self.registry.send_info(id, &record.info);
    }

    pub fn send_capabilities(&mut self, caps: NetworkCapabilities) {
        let Some(id) = self.current else { return };
        let Some(record) = self.records.get_mut(&id) else { return };
        record.caps = caps.clone();
        self.caps = caps;
        self.registry.send_capabilities(id, &record.caps);
    }

    /// Re-scores the current agent and resets the advertised-score ratchet.
    pub fn send_score(&mut self, score: i32) {
        self.score = score;
        self.score_filter.rescore(score);
        let Some(id) = self.current else { return };
        let Some(record) = self.records.get_mut(&id) else { return };
        record.score = score;
        self.registry.send_score(id, score);
    }

    pub fn set_metered(&mut self, metered: bool) {
        let mut caps = self.caps.clone();
        if metered {
            caps.capabilities.remove(CapabilityFlags::NOT_METERED);
        } else {
            caps.capabilities.insert(CapabilityFlags::NOT_METERED);
        }
        self.send_capabilities(caps);
    }

    /// The stack no longer routes through this agent: deliver a final
    /// Disconnected info and drop the registration.
    pub fn handle_unwanted(&mut self, id: AgentId) {
        if !self.records.contains_key(&id) {
            warn!("NetworkAgent: unwanted for unknown agent {}", id);
            return;
        }
        self.unwanted_pending.insert(id);

        let final_info = NetworkInfo::new(DetailedState::Disconnected, "unwanted", None);
        self.registry.send_info(id, &final_info);
        self.registry.unregister(id);

        self.unwanted_pending.remove(&id);
        self.tear_down(id);
    }

    /// Removes a record; if it was current, there is no current agent until
    /// the next setup.
    pub fn tear_down(&mut self, id: AgentId) {
        if self.records.remove(&id).is_none() {
            return;
        }
        if self.current == Some(id) {
            self.current = None;
        }
        self.active = !self.records.is_empty();
        info!("NetworkAgent: tore down agent {}", id);
    }

    /// Unregisters everything. Used at shutdown.
    pub fn tear_down_all(&mut self) {
        let ids: Vec<AgentId> = self.records.keys().copied().collect();
        for id in ids {
            let final_info = NetworkInfo::new(DetailedState::Disconnected, "shutdown", None);
            self.registry.send_info(id, &final_info);
            self.registry.unregister(id);
            self.tear_down(id);
        }
    }

    pub fn dump(&self) -> String {
        format!(
            "ProxyNetworkAgent ({} type {}/{}):\n  active: {} current: {:?} advertised_score: {}\n{}",
            COMPANION_PROXY_TYPE_NAME,
            NETWORK_TYPE_PROXY,
            NETWORK_SUBTYPE_NONE,
            self.active,
            self.current,
            self.score_filter.advertised,
            self.records
                .values()
                .map(|r| format!(
                    "  agent {}: {:?} score {} iface '{}'",
                    r.id, r.info.state, r.score, r.link.interface_name
                ))
                .join("\n")
        )
    }
}
