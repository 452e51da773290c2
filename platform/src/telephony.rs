//! Typed interface to the cellular telephony service.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::cast::FromPrimitive;

use crate::CommandStatus;

#[derive(Clone, Copy, Debug, FromPrimitive, ToPrimitive, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum ServiceState {
    InService = 0,
    OutOfService,
    EmergencyOnly,
    PowerOff,
}

impl From<u32> for ServiceState {
    fn from(item: u32) -> Self {
        ServiceState::from_u32(item).unwrap_or(ServiceState::OutOfService)
    }
}

#[derive(Clone, Copy, Debug, FromPrimitive, ToPrimitive, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum SimState {
    Unknown = 0,
    Absent,
    Ready,
}

impl From<u32> for SimState {
    fn from(item: u32) -> Self {
        SimState::from_u32(item).unwrap_or(SimState::Unknown)
    }
}

#[derive(Clone, Copy, Debug, FromPrimitive, ToPrimitive, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum PhoneState {
    Idle = 0,
    Ringing,
    OffHook,
}

/// Signal quality classification from the signal detector.
#[derive(Clone, Copy, Debug, FromPrimitive, ToPrimitive, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum SignalState {
    Stable = 0,
    Unstable,
    NoSignal,
}

/// Capability interface to the telephony service.
pub trait TelephonyControl: Send + Sync {
    /// Requests cellular radio power. The settled state arrives later as a
    /// `ServiceState` callback.
    fn set_radio_power(&self, powered: bool) -> CommandStatus;

    /// Last settled radio power state.
    fn is_radio_powered(&self) -> bool;
}

/// Callbacks from the telephony service.
#[derive(Debug)]
pub enum TelephonyCallbacks {
    ServiceState(ServiceState),
    SignalState(SignalState),
    SimState(SimState),
    PhoneState(PhoneState),
}

pub struct TelephonyCallbacksDispatcher {
    pub dispatch: Box<dyn Fn(TelephonyCallbacks) + Send>,
}
