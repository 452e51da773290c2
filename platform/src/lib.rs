//! Typed interface between the connectivity supervisor and the platform.
//!
//! The supervisor never talks to a driver or system service directly; it goes
//! through the capability traits defined here, injected at construction.
//! Broadcasts and driver callbacks are translated into the typed callback
//! enums and handed to the stack through per-subsystem dispatchers.

pub mod adapter;
pub mod connectivity;
pub mod device_state;
pub mod runtime;
pub mod settings;
pub mod sim;
pub mod sysproxy;
pub mod telephony;
pub mod wifi;

use num_derive::{FromPrimitive, ToPrimitive};

/// The radios the supervisor arbitrates.
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, Hash, PartialEq, ToPrimitive)]
#[repr(u32)]
pub enum RadioKind {
    Bluetooth = 0,
    Wifi,
    Cellular,
}

impl std::fmt::Display for RadioKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            RadioKind::Bluetooth => write!(f, "BT"),
            RadioKind::Wifi => write!(f, "WIFI"),
            RadioKind::Cellular => write!(f, "CELL"),
        }
    }
}

/// Status returned from platform commands.
#[derive(Clone, Copy, Debug, FromPrimitive, ToPrimitive, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum CommandStatus {
    Success = 0,
    Fail,
    NotReady,
    Busy,
    Unsupported,
    InvalidParam,
    Timeout,
    SocketError,

    // Any statuses that couldn't be cleanly converted
    Unknown = 0xff,
}

impl From<u32> for CommandStatus {
    fn from(item: u32) -> Self {
        num_traits::FromPrimitive::from_u32(item).unwrap_or(CommandStatus::Unknown)
    }
}
