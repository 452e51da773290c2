//! Typed interface to the Bluetooth adapter service.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::cast::FromPrimitive;
use std::fmt::{Debug, Display, Formatter, Result};
use std::fs::File;
use std::os::unix::io::FromRawFd;

use crate::CommandStatus;

#[derive(Clone, Copy, Debug, FromPrimitive, ToPrimitive, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum AdapterState {
    Off = 0,
    On,
}

impl From<u32> for AdapterState {
    fn from(item: u32) -> Self {
        AdapterState::from_u32(item).unwrap_or(AdapterState::Off)
    }
}

#[derive(Clone, Copy, Debug, FromPrimitive, ToPrimitive, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum AclState {
    Connected = 0,
    Disconnected,
}

#[derive(Clone, Copy, Debug, FromPrimitive, ToPrimitive, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum BondState {
    NotBonded = 0,
    Bonding,
    Bonded,
}

impl From<u32> for BondState {
    fn from(item: u32) -> Self {
        BondState::from_u32(item).unwrap_or(BondState::NotBonded)
    }
}

/// Link carrying the companion connection.
#[derive(Clone, Copy, Debug, FromPrimitive, ToPrimitive, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum LinkKind {
    Classic = 0,
    Ble,
}

/// 6-byte Bluetooth device address.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawAddress {
    pub address: [u8; 6],
}

impl RawAddress {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parses "XX:XX:XX:XX:XX:XX" into an address.
    pub fn from_string<S: AsRef<str>>(addr: S) -> Option<RawAddress> {
        let parts: Vec<&str> = addr.as_ref().split(':').collect();
        if parts.len() != 6 {
            return None;
        }

        let mut address = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            address[i] = u8::from_str_radix(part, 16).ok()?;
        }
        Some(RawAddress { address })
    }

    pub fn to_string(&self) -> String {
        format!(
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.address[0],
            self.address[1],
            self.address[2],
            self.address[3],
            self.address[4],
            self.address[5]
        )
    }
}

impl Debug for RawAddress {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "{}", self.to_string())
    }
}

/// Renders only the trailing two bytes so full addresses stay out of logs.
pub struct DisplayAddress<'a>(pub &'a RawAddress);

impl<'a> Display for DisplayAddress<'a> {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "xx:xx:xx:xx:{:02X}:{:02X}", self.0.address[4], self.0.address[5])
    }
}

/// 128-bit service UUID.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Uuid {
    pub uu: [u8; 16],
}

impl From<[u8; 16]> for Uuid {
    fn from(uu: [u8; 16]) -> Self {
        Self { uu }
    }
}

impl Debug for Uuid {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.uu[0], self.uu[1], self.uu[2], self.uu[3],
            self.uu[4], self.uu[5],
            self.uu[6], self.uu[7],
            self.uu[8], self.uu[9],
            self.uu[10], self.uu[11], self.uu[12], self.uu[13], self.uu[14], self.uu[15]
        )
    }
}

/// Service UUID of the companion IP tunnel endpoint on the phone.
pub const SYSPROXY_UUID: Uuid = Uuid {
    uu: [
        0xfa, 0xfb, 0xde, 0xad, 0xbe, 0xef, 0x40, 0x04, 0xa5, 0x8f, 0x8c, 0x2f, 0x95, 0x12, 0xe0,
        0x01,
    ],
};

/// Socket flag: No flags (used for insecure connections).
pub const SOCK_FLAG_NONE: i32 = 0;
/// Socket flag: connection must be encrypted.
pub const SOCK_FLAG_ENCRYPT: i32 = 1 << 0;
/// Socket flag: require authentication.
pub const SOCK_FLAG_AUTH: i32 = 1 << 1;

/// Combination of SOCK_FLAG_ENCRYPT and SOCK_FLAG_AUTH.
pub const SOCK_META_FLAG_SECURE: i32 = SOCK_FLAG_ENCRYPT | SOCK_FLAG_AUTH;

pub type FdError = &'static str;

pub fn try_from_fd(fd: i32) -> std::result::Result<File, FdError> {
    if fd >= 0 {
        // SAFETY: the fd was just handed to us by the driver and is not owned
        // by any other File.
        Ok(unsafe { File::from_raw_fd(fd) })
    } else {
        Err("Invalid FD")
    }
}

/// Capability interface to the Bluetooth service.
///
/// Injected at construction; implementations wrap whatever IPC or driver call
/// the target platform provides. All calls may block and must only be issued
/// from worker threads.
pub trait BluetoothService: Send + Sync {
    /// Requests adapter power. Returns true if the request was accepted; the
    /// settled state arrives later as an `AdapterState` callback.
    fn enable(&self) -> bool;

    /// Requests adapter power off. Same contract as `enable`.
    fn disable(&self) -> bool;

    /// Last settled adapter power state.
    fn is_enabled(&self) -> bool;

    /// Opens an RFCOMM socket to `device` for `uuid`. On success the returned
    /// `File` owns the socket fd.
    fn connect_socket(
        &self,
        device: RawAddress,
        uuid: Uuid,
        flags: i32,
    ) -> (CommandStatus, std::result::Result<File, FdError>);

    /// Connects the hands-free client profile to `device`.
    fn hfc_connect(&self, device: RawAddress) -> CommandStatus;

    /// Disconnects the hands-free client profile from `device`.
    fn hfc_disconnect(&self, device: RawAddress) -> CommandStatus;
}

/// Callbacks from the adapter service.
#[derive(Debug)]
pub enum AdapterCallbacks {
    /// Adapter power state settled.
    AdapterState(AdapterState),
    /// ACL link state changed for a device.
    AclState(RawAddress, AclState, LinkKind),
    /// Bond state changed for a device.
    BondState(RawAddress, BondState, LinkKind),
    /// Remote name resolved for a device.
    RemoteName(RawAddress, String),
}

pub struct AdapterCallbacksDispatcher {
    pub dispatch: Box<dyn Fn(AdapterCallbacks) + Send>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parsing_round_trip() {
        let addr = RawAddress::from_string("00:11:22:33:AA:BB").unwrap();
        assert_eq!(addr.address, [0x00, 0x11, 0x22, 0x33, 0xaa, 0xbb]);
        assert_eq!(addr.to_string(), "00:11:22:33:AA:BB");

        assert!(RawAddress::from_string("00:11:22:33:AA").is_none());
        assert!(RawAddress::from_string("not an address").is_none());
    }

    #[test]
    fn test_display_address_redacts_prefix() {
        let addr = RawAddress::from_string("00:11:22:33:AA:BB").unwrap();
        assert_eq!(format!("{}", DisplayAddress(&addr)), "xx:xx:xx:xx:AA:BB");
    }

    #[test]
    fn test_try_from_fd_rejects_negative() {
        assert!(try_from_fd(-1).is_err());
    }
}
