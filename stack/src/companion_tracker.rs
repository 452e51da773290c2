//! Tracks which paired device is the companion phone.

use log::{debug, info, warn};
use tokio::sync::mpsc::Sender;

use conn_platform::adapter::{BondState, DisplayAddress, LinkKind, RawAddress};

use crate::history::EventHistory;
use crate::Message;

/// The paired phone. The authoritative identity is the device address.
#[derive(Clone, Debug, PartialEq)]
pub struct CompanionDevice {
    pub address: RawAddress,
    pub name: String,
    pub link_kind: LinkKind,
    pub bond_state: BondState,
}

/// Keeps the current companion derived from bond-state events and publishes
/// changes to the rest of the stack. Companion-known and ACL-connected are
/// distinct signals; this tracker never touches link state.
pub struct CompanionTracker {
    companion: Option<CompanionDevice>,
    events: EventHistory,
    tx: Sender<Message>,
}

impl CompanionTracker {
    pub fn new(tx: Sender<Message>) -> Self {
        Self { companion: None, events: EventHistory::new("CompanionTracker"), tx }
    }

    pub fn companion(&self) -> Option<&CompanionDevice> {
        self.companion.as_ref()
    }

    pub(crate) fn handle_bond_state(
        &mut self,
        addr: RawAddress,
        state: BondState,
        link: LinkKind,
    ) {
        match state {
            BondState::Bonded => {
                if let Some(existing) = &self.companion {
                    if existing.address == addr {
                        debug!("Companion {} re-bonded", DisplayAddress(&addr));
                        return;
                    }
                    warn!(
                        "Replacing companion {} with newly bonded {}",
                        DisplayAddress(&existing.address),
                        DisplayAddress(&addr)
                    );
                }
                info!("Companion paired: {} ({:?})", DisplayAddress(&addr), link);
                self.events.push("CompanionPaired");
                self.companion = Some(CompanionDevice {
                    address: addr,
                    name: String::new(),
                    link_kind: link,
                    bond_state: BondState::Bonded,
                });
                self.publish();
            }
            BondState::Bonding => {
                self.events.push("Bonding");
            }
            BondState::NotBonded => {
                let was_companion =
                    self.companion.as_ref().map_or(false, |c| c.address == addr);
                if !was_companion {
                    return;
                }
                info!("Companion unpaired: {}", DisplayAddress(&addr));
                self.events.push("CompanionUnpaired");
                self.companion = None;
                self.publish();
            }
        }
    }

    pub(crate) fn handle_remote_name(&mut self, addr: RawAddress, name: String) {
        let Some(companion) = &mut self.companion else { return };
        if companion.address != addr || companion.name == name {
            return;
        }
        companion.name = name;
        self.publish();
    }

    fn publish(&self) {
        let tx = self.tx.clone();
        let companion = self.companion.clone();
        tokio::spawn(async move {
            let _ = tx.send(Message::CompanionChanged(companion)).await;
        });
    }

    pub fn dump(&self) -> String {
        format!(
            "CompanionTracker:\n  companion: {}\n{}",
            match &self.companion {
                Some(c) => format!(
                    "{} '{}' ({:?}, {:?})",
                    DisplayAddress(&c.address),
                    c.name,
                    c.link_kind,
                    c.bond_state
                ),
                None => "none".to_string(),
            },
            self.events.dump()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Supervisor;

    fn addr(last: u8) -> RawAddress {
        RawAddress { address: [0, 0, 0, 0, 0, last] }
    }

    #[tokio::test]
    async fn test_bond_and_unbond_publishes_companion() {
        let (tx, mut rx) = Supervisor::create_channel();
        let mut tracker = CompanionTracker::new(tx);

        tracker.handle_bond_state(addr(1), BondState::Bonded, LinkKind::Classic);
        assert_eq!(tracker.companion().unwrap().address, addr(1));
        match rx.recv().await {
            Some(Message::CompanionChanged(Some(companion))) => {
                assert_eq!(companion.address, addr(1));
                assert_eq!(companion.link_kind, LinkKind::Classic);
            }
            _ => panic!("expected CompanionChanged"),
        }

        // Unbonding someone else is ignored.
        tracker.handle_bond_state(addr(2), BondState::NotBonded, LinkKind::Classic);
        assert!(tracker.companion().is_some());

        tracker.handle_bond_state(addr(1), BondState::NotBonded, LinkKind::Classic);
        assert!(tracker.companion().is_none());
        match rx.recv().await {
            Some(Message::CompanionChanged(None)) => {}
            _ => panic!("expected CompanionChanged(None)"),
        }
    }

    #[tokio::test]
    async fn test_remote_name_updates_companion() {
        let (tx, mut rx) = Supervisor::create_channel();
        let mut tracker = CompanionTracker::new(tx);

        tracker.handle_bond_state(addr(7), BondState::Bonded, LinkKind::Ble);
        let _ = rx.recv().await;

        tracker.handle_remote_name(addr(9), "not the companion".to_string());
        assert_eq!(tracker.companion().unwrap().name, "");

        tracker.handle_remote_name(addr(7), "Pixel".to_string());
        assert_eq!(tracker.companion().unwrap().name, "Pixel");
        match rx.recv().await {
            Some(Message::CompanionChanged(Some(companion))) => {
                assert_eq!(companion.name, "Pixel");
            }
            _ => panic!("expected CompanionChanged"),
        }
    }
}
