// crates/canopen-rs/src/hal.rs

use crate::frame::CanFrame;
use crate::od::{ObjectKey, ObjectValue};
use crate::types::NodeIdError;
use alloc::collections::BTreeMap;
use core::fmt;

/// Defines a portable, descriptive Error type for the CANopen stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanopenError {
    /// An invalid argument or range was passed to an API call.
    Argument,
    /// The requested object dictionary index does not exist.
    ObjectNotFound,
    /// The requested sub-index does not exist for the given index.
    SubIndexNotFound,
    /// Attempt to write a read-only object.
    ReadOnly,
    /// Attempt to read a write-only object.
    WriteOnly,
    /// The payload width does not match the object size.
    SizeMismatch,
    /// The payload is longer than the object can hold.
    LengthTooHigh,
    /// The payload is shorter than the object requires.
    LengthTooLow,
    /// A value was rejected by a per-type range check.
    Range,
    /// The object cannot be mapped into a PDO.
    CannotMap,
    /// The proposed mapping would exceed the 8-byte PDO payload.
    MapLength,
    /// A configuration change was rejected in the current state
    /// (e.g. PDO parameter write while the PDO is enabled).
    Incompatible,
    /// No free slot is left in the timer pool.
    TimerExhausted,
    /// The given timer handle is not pending.
    TimerNotFound,
    /// Invalid PDO identifier configuration (extended frame, RTR, bad bits).
    PdoConfig,
    /// An SDO protocol violation (toggle, command, block sequence).
    SdoProtocol,
    /// An SDO channel rejected a request because a transfer is ongoing.
    SdoBusy,
    /// An SDO channel rejected a request because it is not configured.
    SdoOff,
    /// The CAN driver reported a send, receive or reset failure.
    Driver,
    /// An NMT command or transition is not supported.
    Nmt,
    /// An error occurred in the storage backend.
    Storage(&'static str),
}

impl fmt::Display for CanopenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Argument => write!(f, "Invalid argument"),
            Self::ObjectNotFound => write!(f, "Object dictionary index not found"),
            Self::SubIndexNotFound => write!(f, "Object dictionary sub-index not found"),
            Self::ReadOnly => write!(f, "Object is read-only"),
            Self::WriteOnly => write!(f, "Object is write-only"),
            Self::SizeMismatch => write!(f, "Payload width does not match object size"),
            Self::LengthTooHigh => write!(f, "Payload too long for object"),
            Self::LengthTooLow => write!(f, "Payload too short for object"),
            Self::Range => write!(f, "Value out of range"),
            Self::CannotMap => write!(f, "Object cannot be mapped into a PDO"),
            Self::MapLength => write!(f, "Mapping exceeds PDO payload size"),
            Self::Incompatible => write!(f, "Parameter change incompatible with current state"),
            Self::TimerExhausted => write!(f, "Timer pool exhausted"),
            Self::TimerNotFound => write!(f, "Timer handle not pending"),
            Self::PdoConfig => write!(f, "Invalid PDO identifier configuration"),
            Self::SdoProtocol => write!(f, "SDO protocol violation"),
            Self::SdoBusy => write!(f, "SDO channel busy"),
            Self::SdoOff => write!(f, "SDO channel not configured"),
            Self::Driver => write!(f, "CAN driver failure"),
            Self::Nmt => write!(f, "Unsupported NMT command or transition"),
            Self::Storage(s) => write!(f, "Storage error: {}", s),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CanopenError {}

impl From<NodeIdError> for CanopenError {
    fn from(_: NodeIdError) -> Self {
        CanopenError::Argument
    }
}

/// Hardware Abstraction Layer for the CAN controller.
///
/// This trait abstracts the physical sending and receiving of classic CAN
/// frames, enabling the core protocol logic to remain platform-agnostic
/// (no_std). Implementations are expected to be non-blocking: `receive`
/// returns `Ok(None)` when no frame is pending, and `send` fails fast when
/// the transmit path is full.
pub trait CanDriver {
    /// Enables the controller at the given baudrate (bit/s).
    fn enable(&mut self, baudrate: u32) -> Result<(), CanopenError>;

    /// Sends a single frame. Must not block.
    fn send(&mut self, frame: &CanFrame) -> Result<(), CanopenError>;

    /// Polls for a single received frame. Must not block.
    fn receive(&mut self) -> Result<Option<CanFrame>, CanopenError>;

    /// Resets the controller, keeping the configured baudrate.
    fn reset(&mut self) -> Result<(), CanopenError>;

    /// Shuts the controller down.
    fn close(&mut self) -> Result<(), CanopenError>;
}

/// A trait for abstracting the non-volatile storage of OD parameters.
///
/// This backs the Store Parameters (0x1010) and Restore Default Parameters
/// (0x1011) objects. The restore operation must survive a reboot, so it is
/// implemented as a persistent flag checked during dictionary init.
pub trait NvmStorage {
    /// Loads stored parameters from non-volatile memory.
    fn load(&mut self) -> Result<BTreeMap<ObjectKey, ObjectValue>, CanopenError>;

    /// Saves the given parameters to non-volatile memory.
    fn save(&mut self, parameters: &BTreeMap<ObjectKey, ObjectValue>)
    -> Result<(), CanopenError>;

    /// Clears all stored parameters from non-volatile memory.
    fn clear(&mut self) -> Result<(), CanopenError>;

    /// Checks if a restore-defaults operation is pending from a previous run.
    fn restore_requested(&self) -> bool;

    /// Sets the persistent flag that requests a restore on the next boot.
    /// Called when the "load" signature is written to OD entry 0x1011.
    fn request_restore(&mut self) -> Result<(), CanopenError>;

    /// Clears the persistent restore flag after the restore has completed.
    fn clear_restore_flag(&mut self) -> Result<(), CanopenError>;
}
