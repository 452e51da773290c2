//! Publishes charging and power-save state.

use log::debug;
use tokio::sync::mpsc::Sender;

use crate::history::EventHistory;
use crate::Message;

pub struct PowerTracker {
    charging: bool,
    power_save: bool,
    events: EventHistory,
    tx: Sender<Message>,
}

impl PowerTracker {
    pub fn new(tx: Sender<Message>) -> Self {
        Self {
            charging: false,
            power_save: false,
            events: EventHistory::new("PowerTracker"),
            tx,
        }
    }

    pub fn is_charging(&self) -> bool {
        self.charging
    }

    pub fn is_power_save(&self) -> bool {
        self.power_save
    }

    pub(crate) fn handle_charging(&mut self, plugged: bool) {
        if self.charging == plugged {
            return;
        }
        self.charging = plugged;
        self.events.push(if plugged { "Charging" } else { "Discharging" });
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(Message::ChargingChanged(plugged)).await;
        });
    }

    pub(crate) fn handle_power_save(&mut self, enabled: bool) {
        if self.power_save == enabled {
            return;
        }
        self.power_save = enabled;
        self.events.push(if enabled { "PowerSaveOn" } else { "PowerSaveOff" });
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(Message::PowerSaveChanged(enabled)).await;
        });
    }

    pub(crate) fn handle_airplane_mode(&mut self, enabled: bool) {
        // Observational only; the mediators act on the user settings that
        // airplane mode flips underneath them.
        debug!("Airplane mode changed: {}", enabled);
        self.events.push(if enabled { "AirplaneOn" } else { "AirplaneOff" });
    }

    pub fn dump(&self) -> String {
        format!(
            "PowerTracker:\n  charging: {} power_save: {}\n{}",
            self.charging,
            self.power_save,
            self.events.dump()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Supervisor;

    #[tokio::test]
    async fn test_charging_change_published_once() {
        let (tx, mut rx) = Supervisor::create_channel();
        let mut tracker = PowerTracker::new(tx);

        tracker.handle_charging(true);
        tracker.handle_charging(true);
        assert!(tracker.is_charging());

        match rx.recv().await {
            Some(Message::ChargingChanged(true)) => {}
            _ => panic!("expected ChargingChanged(true)"),
        }
        // The duplicate did not produce a second message.
        tracker.handle_charging(false);
        match rx.recv().await {
            Some(Message::ChargingChanged(false)) => {}
            _ => panic!("expected ChargingChanged(false)"),
        }
    }

    #[tokio::test]
    async fn test_power_save_published() {
        let (tx, mut rx) = Supervisor::create_channel();
        let mut tracker = PowerTracker::new(tx);

        tracker.handle_power_save(true);
        assert!(tracker.is_power_save());
        match rx.recv().await {
            Some(Message::PowerSaveChanged(true)) => {}
            _ => panic!("expected PowerSaveChanged(true)"),
        }
    }
}
