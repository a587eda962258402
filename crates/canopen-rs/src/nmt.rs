// crates/canopen-rs/src/nmt.rs

use crate::frame::CanFrame;
use crate::hal::CanopenError;
use crate::od::{ObjectDictionary, ObjectKey};
use crate::tmr::{TimerAction, TimerWheel, TmrHandle};
use crate::types::{COB_HEARTBEAT_BASE, NodeId};
use core::ops::BitOr;
use log::{info, warn};

/// Key of the producer heartbeat time object.
const KEY_HEARTBEAT_TIME: ObjectKey = ObjectKey::new(0x1017, 0);

/// The NMT state of a slave node (CiA 301, Section 7.3.2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NmtState {
    /// Not yet initialised; no communication at all.
    #[default]
    Invalid,
    /// Power-on initialisation; ends with the boot-up message.
    Init,
    /// Configuration phase: SDO communication, no PDO traffic.
    PreOperational,
    /// Full operation including PDO exchange.
    Operational,
    /// Only NMT commands and error control are processed.
    Stopped,
}

impl NmtState {
    /// The state code carried in heartbeat frames (CiA 301, Table 64).
    /// The boot-up message reuses the heartbeat COB-ID with code 0.
    pub fn heartbeat_code(&self) -> u8 {
        match self {
            NmtState::Invalid | NmtState::Init => 0x00,
            NmtState::Stopped => 0x04,
            NmtState::Operational => 0x05,
            NmtState::PreOperational => 0x7F,
        }
    }
}

/// NMT module control commands (CiA 301, Section 7.2.8.3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmtCommand {
    Start = 0x01,
    Stop = 0x02,
    EnterPreOperational = 0x80,
    ResetNode = 0x81,
    ResetCommunication = 0x82,
}

impl TryFrom<u8> for NmtCommand {
    type Error = CanopenError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(NmtCommand::Start),
            0x02 => Ok(NmtCommand::Stop),
            0x80 => Ok(NmtCommand::EnterPreOperational),
            0x81 => Ok(NmtCommand::ResetNode),
            0x82 => Ok(NmtCommand::ResetCommunication),
            _ => Err(CanopenError::Nmt),
        }
    }
}

/// The classes of communication objects an NMT state allows, as a
/// type-safe bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectClassMask(pub u8);

impl ObjectClassMask {
    pub const NMT: Self = Self(1 << 0);
    pub const BOOT: Self = Self(1 << 1);
    pub const EMCY: Self = Self(1 << 2);
    pub const TIME: Self = Self(1 << 3);
    pub const SYNC: Self = Self(1 << 4);
    pub const SDO: Self = Self(1 << 5);
    pub const PDO: Self = Self(1 << 6);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl BitOr for ObjectClassMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Allowed object classes per state (CiA 301, Table 1).
fn allowed_in(state: NmtState) -> ObjectClassMask {
    match state {
        NmtState::Invalid | NmtState::Init => ObjectClassMask::empty(),
        NmtState::PreOperational => {
            ObjectClassMask::NMT
                | ObjectClassMask::BOOT
                | ObjectClassMask::EMCY
                | ObjectClassMask::TIME
                | ObjectClassMask::SYNC
                | ObjectClassMask::SDO
        }
        NmtState::Operational => {
            ObjectClassMask::NMT
                | ObjectClassMask::BOOT
                | ObjectClassMask::EMCY
                | ObjectClassMask::TIME
                | ObjectClassMask::SYNC
                | ObjectClassMask::SDO
                | ObjectClassMask::PDO
        }
        NmtState::Stopped => ObjectClassMask::NMT,
    }
}

/// Manages the NMT state of a slave node and its heartbeat producer.
///
/// The state machine itself is small; the heavy lifting on reset commands
/// (reloading communication parameters, re-arming PDOs) is owned by the
/// node orchestrator, which calls back into this struct to track the
/// resulting state.
pub struct NmtSlave {
    state: NmtState,
    allowed: ObjectClassMask,
    hb_handle: Option<TmrHandle>,
}

impl NmtSlave {
    pub fn new() -> Self {
        Self {
            state: NmtState::Invalid,
            allowed: ObjectClassMask::empty(),
            hb_handle: None,
        }
    }

    pub fn state(&self) -> NmtState {
        self.state
    }

    /// True when the given object class may be processed or produced in the
    /// current state.
    pub fn allowed(&self, class: ObjectClassMask) -> bool {
        self.allowed.contains(class)
    }

    /// Moves to a new state and updates the allowed-object mask.
    pub fn set_state(&mut self, state: NmtState) {
        if state != self.state {
            info!("NMT state change: {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        self.allowed = allowed_in(state);
    }

    /// Decodes an NMT command frame addressed to this node (data byte 1 is
    /// the target, 0 meaning broadcast). Frames for other nodes return
    /// `None`; malformed frames are reported.
    pub fn parse_command(
        &self,
        frame: &CanFrame,
        node_id: NodeId,
    ) -> Result<Option<NmtCommand>, CanopenError> {
        if frame.dlc < 2 {
            return Err(CanopenError::Nmt);
        }
        let target = frame.get_u8(1);
        if target != 0 && target != node_id.0 {
            return Ok(None);
        }
        match NmtCommand::try_from(frame.get_u8(0)) {
            Ok(command) => Ok(Some(command)),
            Err(e) => {
                warn!("Unsupported NMT command {:#04X}", frame.get_u8(0));
                Err(e)
            }
        }
    }

    /// The boot-up message sent when entering pre-operational after init.
    pub fn bootup_frame(&self, node_id: NodeId) -> CanFrame {
        CanFrame::with_payload(COB_HEARTBEAT_BASE + node_id.0 as u16, &[0x00])
    }

    /// One heartbeat frame for the current state.
    pub fn heartbeat_frame(&self, node_id: NodeId) -> CanFrame {
        CanFrame::with_payload(
            COB_HEARTBEAT_BASE + node_id.0 as u16,
            &[self.state.heartbeat_code()],
        )
    }

    /// (Re-)schedules the heartbeat producer from 0x1017:00. A zero period
    /// stops the producer. Called on node start and whenever the object is
    /// written.
    pub fn restart_heartbeat(
        &mut self,
        od: &ObjectDictionary,
        tmr: &mut TimerWheel,
    ) -> Result<(), CanopenError> {
        if let Some(handle) = self.hb_handle.take() {
            // The handle may have been swept by a wheel clear already.
            let _ = tmr.delete(handle);
        }
        let period_ms = od.read_u16(KEY_HEARTBEAT_TIME).unwrap_or(0);
        if period_ms > 0 {
            let handle = tmr.create(period_ms as u32, period_ms as u32, TimerAction::Heartbeat)?;
            self.hb_handle = Some(handle);
        }
        Ok(())
    }

    /// Stops the heartbeat producer without touching 0x1017.
    pub fn stop_heartbeat(&mut self, tmr: &mut TimerWheel) {
        if let Some(handle) = self.hb_handle.take() {
            let _ = tmr.delete(handle);
        }
    }
}

impl Default for NmtSlave {
    fn default() -> Self {
        Self::new()
    }
}
