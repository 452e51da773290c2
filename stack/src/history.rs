//! Bounded histories of radio decisions and mediator events.

use itertools::Itertools;
use std::collections::VecDeque;
use std::fmt::{Display, Formatter, Result};
use std::time::{SystemTime, UNIX_EPOCH};

use conn_platform::RadioKind;

/// Decisions retained per mediator.
pub const DECISION_HISTORY_CAPACITY: usize = 30;

/// Events retained per mediator before the oldest entry is evicted.
const EVENT_HISTORY_CAPACITY: usize = 30;

/// Why a radio power decision was taken, in priority-rule terms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecisionReason {
    OnAuto,
    OnPhoneCall,
    OnNetworkRequest,
    OnProxyDisconnected,
    OffActivityMode,
    OffOffBody,
    OffTimeOnlyMode,
    OffUserSetting,
    OffSimAbsent,
    OffPowerSave,
    OffProxyConnected,
    OffNoSignal,
    OffUnstableSignal,
}

impl Display for DecisionReason {
    fn fmt(&self, f: &mut Formatter) -> Result {
        let name = match self {
            DecisionReason::OnAuto => "ON_AUTO",
            DecisionReason::OnPhoneCall => "ON_PHONE_CALL",
            DecisionReason::OnNetworkRequest => "ON_NETWORK_REQUEST",
            DecisionReason::OnProxyDisconnected => "ON_PROXY_DISCONNECTED",
            DecisionReason::OffActivityMode => "OFF_ACTIVITY_MODE",
            DecisionReason::OffOffBody => "OFF_OFF_BODY",
            DecisionReason::OffTimeOnlyMode => "OFF_TIME_ONLY_MODE",
            DecisionReason::OffUserSetting => "OFF_USER_SETTING",
            DecisionReason::OffSimAbsent => "OFF_SIM_ABSENT",
            DecisionReason::OffPowerSave => "OFF_POWER_SAVE",
            DecisionReason::OffProxyConnected => "OFF_PROXY_CONNECTED",
            DecisionReason::OffNoSignal => "OFF_NO_SIGNAL",
            DecisionReason::OffUnstableSignal => "OFF_UNSTABLE_SIGNAL",
        };
        write!(f, "{}", name)
    }
}

/// A single radio power decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RadioDecision {
    pub radio: RadioKind,
    pub enable: bool,
    pub reason: DecisionReason,
}

impl RadioDecision {
    pub fn on(radio: RadioKind, reason: DecisionReason) -> Self {
        Self { radio, enable: true, reason }
    }

    pub fn off(radio: RadioKind, reason: DecisionReason) -> Self {
        Self { radio, enable: false, reason }
    }
}

struct DecisionEntry {
    decision: RadioDecision,
    timestamp_ms: u64,
}

/// Bounded ring of decisions with adjacent-duplicate suppression.
pub struct DecisionHistory {
    entries: VecDeque<DecisionEntry>,
}

impl DecisionHistory {
    pub fn new() -> Self {
        Self { entries: VecDeque::new() }
    }

    /// Records a decision unless it repeats the latest entry. Returns whether
    /// the decision was recorded.
    pub fn push(&mut self, decision: RadioDecision) -> bool {
        if self.latest() == Some(decision) {
            return false;
        }
        self.entries.push_back(DecisionEntry { decision, timestamp_ms: now_ms() });
        while self.entries.len() > DECISION_HISTORY_CAPACITY {
            self.entries.pop_front();
        }
        true
    }

    pub fn latest(&self) -> Option<RadioDecision> {
        self.entries.back().map(|e| e.decision)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dump(&self) -> String {
        self.entries
            .iter()
            .map(|e| {
                format!(
                    "  {} {} {} ({})",
                    e.timestamp_ms,
                    e.decision.radio,
                    if e.decision.enable { "ON" } else { "OFF" },
                    e.decision.reason
                )
            })
            .join("\n")
    }
}

impl Default for DecisionHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EventHistoryEntry {
    pub name: String,
    pub timestamp_ms: u64,
    pub count: u32,
}

/// Bounded ring of named events; consecutive duplicates collapse into one
/// entry with a count.
pub struct EventHistory {
    name: String,
    entries: VecDeque<EventHistoryEntry>,
}

impl EventHistory {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), entries: VecDeque::new() }
    }

    pub fn push(&mut self, event: &str) {
        if let Some(last) = self.entries.back_mut() {
            if last.name == event {
                last.count += 1;
                last.timestamp_ms = now_ms();
                return;
            }
        }
        self.entries.push_back(EventHistoryEntry {
            name: event.to_string(),
            timestamp_ms: now_ms(),
            count: 1,
        });
        while self.entries.len() > EVENT_HISTORY_CAPACITY {
            self.entries.pop_front();
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &EventHistoryEntry> {
        self.entries.iter()
    }

    pub fn dump(&self) -> String {
        format!(
            "{}:\n{}",
            self.name,
            self.entries
                .iter()
                .map(|e| format!("  {} {} x{}", e.timestamp_ms, e.name, e.count))
                .join("\n")
        )
    }
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_duplicates_suppressed() {
        let mut history = DecisionHistory::new();
        let on = RadioDecision::on(RadioKind::Bluetooth, DecisionReason::OnAuto);
        let off = RadioDecision::off(RadioKind::Bluetooth, DecisionReason::OffActivityMode);

        assert!(history.push(on));
        assert!(!history.push(on));
        assert!(history.push(off));
        assert!(history.push(on));
        assert_eq!(history.len(), 3);
        assert_eq!(history.latest(), Some(on));
    }

    #[test]
    fn test_decision_ring_bounded() {
        let mut history = DecisionHistory::new();
        for i in 0..(DECISION_HISTORY_CAPACITY * 2) {
            let decision = if i % 2 == 0 {
                RadioDecision::on(RadioKind::Cellular, DecisionReason::OnAuto)
            } else {
                RadioDecision::off(RadioKind::Cellular, DecisionReason::OffProxyConnected)
            };
            history.push(decision);
        }
        assert_eq!(history.len(), DECISION_HISTORY_CAPACITY);
    }

    #[test]
    fn test_event_history_collapses_consecutive() {
        let mut history = EventHistory::new("test");
        for event in ["a", "a", "a", "b", "a"] {
            history.push(event);
        }

        let entries: Vec<(String, u32)> =
            history.entries().map(|e| (e.name.clone(), e.count)).collect();
        assert_eq!(
            entries,
            vec![("a".to_string(), 3), ("b".to_string(), 1), ("a".to_string(), 1)]
        );
    }

    #[test]
    fn test_event_history_bounded() {
        let mut history = EventHistory::new("test");
        for i in 0..100 {
            history.push(&format!("event{}", i));
        }
        assert_eq!(history.entries().count(), 30);
    }
}
