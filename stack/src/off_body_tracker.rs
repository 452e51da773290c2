//! Derives the off-body signal from wear detection and screen state.

use log::info;
use tokio::sync::mpsc::Sender;

use crate::history::EventHistory;
use crate::Message;

/// Fuses on-body recognition with screen state: the device counts as off-body
/// only while the sensor says "not worn" and the screen is off.
pub struct OffBodyTracker {
    is_on_body: bool,
    screen_on: bool,
    last_changed_ms: u64,
    last_published: Option<bool>,
    events: EventHistory,
    tx: Sender<Message>,
}

impl OffBodyTracker {
    pub fn new(tx: Sender<Message>) -> Self {
        Self {
            is_on_body: true,
            screen_on: true,
            last_changed_ms: 0,
            last_published: None,
            events: EventHistory::new("OffBodyTracker"),
            tx,
        }
    }

    pub fn is_off_body(&self) -> bool {
        !self.is_on_body && !self.screen_on
    }

    pub(crate) fn handle_on_body(&mut self, is_on_body: bool, last_changed_ms: u64) {
        self.is_on_body = is_on_body;
        self.last_changed_ms = last_changed_ms;
        self.events.push(if is_on_body { "OnBody" } else { "OffBody" });
        self.publish_if_changed();
    }

    pub(crate) fn handle_screen(&mut self, on: bool) {
        self.screen_on = on;
        self.events.push(if on { "ScreenOn" } else { "ScreenOff" });
        self.publish_if_changed();
    }

    fn publish_if_changed(&mut self) {
        let off_body = self.is_off_body();
        if self.last_published == Some(off_body) {
            return;
        }
        self.last_published = Some(off_body);
        info!("Off-body changed: {}", off_body);

        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(Message::OffBodyChanged(off_body)).await;
        });
    }

    pub fn dump(&self) -> String {
        format!(
            "OffBodyTracker:\n  on_body: {} screen_on: {} last_changed_ms: {}\n{}",
            self.is_on_body,
            self.screen_on,
            self.last_changed_ms,
            self.events.dump()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Supervisor;

    #[tokio::test]
    async fn test_off_body_requires_screen_off() {
        let (tx, mut rx) = Supervisor::create_channel();
        let mut tracker = OffBodyTracker::new(tx);

        // Taken off the wrist with the screen still on: not yet off-body.
        tracker.handle_on_body(false, 1000);
        assert!(!tracker.is_off_body());
        match rx.recv().await {
            Some(Message::OffBodyChanged(false)) => {}
            _ => panic!("expected OffBodyChanged(false)"),
        }

        tracker.handle_screen(false);
        assert!(tracker.is_off_body());
        match rx.recv().await {
            Some(Message::OffBodyChanged(true)) => {}
            _ => panic!("expected OffBodyChanged(true)"),
        }
    }

    #[tokio::test]
    async fn test_publishes_only_on_change() {
        let (tx, mut rx) = Supervisor::create_channel();
        let mut tracker = OffBodyTracker::new(tx);

        tracker.handle_screen(false);
        tracker.handle_on_body(false, 10);
        tracker.handle_on_body(true, 20);

        // First publish is the initial on-body (false) state, then the
        // transition to off-body, then back.
        let mut published = vec![];
        for _ in 0..3 {
            match rx.recv().await {
                Some(Message::OffBodyChanged(v)) => published.push(v),
                _ => panic!("expected OffBodyChanged"),
            }
        }
        assert_eq!(published, vec![false, true, false]);
    }
}
