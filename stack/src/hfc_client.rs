//! Hands-free client shard bound to the companion.

use log::{info, warn};
use std::sync::Arc;

use conn_platform::adapter::{BluetoothService, DisplayAddress, RawAddress};
use conn_platform::CommandStatus;

/// Binds the hands-free client profile to the companion while the adapter is
/// up. No reconnection policy of its own; the profile stack re-establishes
/// the service level connection on its side.
pub struct HfcClient {
    bt: Arc<dyn BluetoothService>,
    bound_to: Option<RawAddress>,
}

impl HfcClient {
    pub fn new(bt: Arc<dyn BluetoothService>) -> Self {
        Self { bt, bound_to: None }
    }

    pub fn is_started(&self) -> bool {
        self.bound_to.is_some()
    }

    pub fn start(&mut self, address: RawAddress) {
        if self.bound_to == Some(address) {
            return;
        }
        // Re-binding to a different companion releases the old one first.
        self.stop();

        match self.bt.hfc_connect(address) {
            CommandStatus::Success => {
                info!("HFC bound to {}", DisplayAddress(&address));
                self.bound_to = Some(address);
            }
            status => {
                warn!("HFC connect to {} failed: {:?}", DisplayAddress(&address), status);
            }
        }
    }

    pub fn stop(&mut self) {
        if let Some(address) = self.bound_to.take() {
            info!("HFC released from {}", DisplayAddress(&address));
            self.bt.hfc_disconnect(address);
        }
    }

    pub fn dump(&self) -> String {
        format!(
            "HfcClient:\n  bound_to: {}",
            match &self.bound_to {
                Some(addr) => format!("{}", DisplayAddress(addr)),
                None => "none".to_string(),
            }
        )
    }
}
