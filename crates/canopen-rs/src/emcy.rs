// crates/canopen-rs/src/emcy.rs

use crate::frame::CanFrame;
use crate::hal::{CanDriver, CanopenError};
use crate::nmt::{NmtSlave, ObjectClassMask};
use crate::od::{ObjectDictionary, ObjectKey, ObjectValue};
use crate::types::{COBID_OFF, COBID_STD_MASK};
use alloc::vec::Vec;
use log::{debug, warn};

/// Key of the error register object.
const KEY_ERROR_REGISTER: ObjectKey = ObjectKey::new(0x1001, 0);
/// Key of the EMCY COB-ID object.
const KEY_EMCY_COB: ObjectKey = ObjectKey::new(0x1014, 0);
/// Index of the pre-defined error field.
const IDX_ERROR_FIELD: u16 = 0x1003;

/// Error register bits (CiA 301, Section 7.5.2.2).
pub mod error_register {
    pub const GENERIC: u8 = 0;
    pub const CURRENT: u8 = 1;
    pub const VOLTAGE: u8 = 2;
    pub const TEMPERATURE: u8 = 3;
    pub const COMMUNICATION: u8 = 4;
    pub const DEVICE_PROFILE: u8 = 5;
    pub const MANUFACTURER: u8 = 7;
}

/// One application error definition: the emergency error code that goes on
/// the wire and the error register bit it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmcyEntry {
    pub code: u16,
    pub reg_bit: u8,
}

/// The application's error table, indexed by error identifier.
#[derive(Debug, Clone, Default)]
pub struct EmcyTable(pub Vec<EmcyEntry>);

/// The emergency producer: latches application errors, maintains the error
/// register (0x1001) and the pre-defined error field (0x1003), and emits
/// one EMCY frame per error transition.
pub struct EmcyProducer {
    table: Vec<EmcyEntry>,
    latched: Vec<bool>,
    /// Active error count per error register bit.
    counts: [u8; 8],
    hist_max: u8,
}

impl EmcyProducer {
    pub fn new(table: EmcyTable, hist_max: u8) -> Self {
        let latched = alloc::vec![false; table.0.len()];
        Self {
            table: table.0,
            latched,
            counts: [0; 8],
            hist_max,
        }
    }

    /// True while the given error is latched.
    pub fn get_status(&self, err_id: usize) -> bool {
        self.latched.get(err_id).copied().unwrap_or(false)
    }

    /// Number of currently latched errors.
    pub fn active_errors(&self) -> usize {
        self.latched.iter().filter(|&&l| l).count()
    }

    /// Latches an error and transmits its emergency frame. Setting an
    /// already-latched error is a no-op.
    pub fn set(
        &mut self,
        err_id: usize,
        usr_info: Option<[u8; 5]>,
        od: &mut ObjectDictionary,
        driver: &mut dyn CanDriver,
        nmt: &NmtSlave,
    ) -> Result<(), CanopenError> {
        let entry = *self.table.get(err_id).ok_or(CanopenError::Argument)?;
        if self.latched[err_id] {
            return Ok(());
        }
        self.latched[err_id] = true;
        self.counts[(entry.reg_bit & 0x07) as usize] += 1;
        self.update_register(od);
        let usr = usr_info.unwrap_or([0; 5]);
        self.history_add(od, entry.code, &usr);
        debug!("EMCY set: id={} code={:#06X}", err_id, entry.code);
        self.transmit(entry.code, usr, od, driver, nmt)
    }

    /// Clears a latched error and transmits the "error reset" emergency
    /// frame (code 0x0000). Clearing an inactive error is a no-op.
    pub fn clr(
        &mut self,
        err_id: usize,
        od: &mut ObjectDictionary,
        driver: &mut dyn CanDriver,
        nmt: &NmtSlave,
    ) -> Result<(), CanopenError> {
        let entry = *self.table.get(err_id).ok_or(CanopenError::Argument)?;
        if !self.latched[err_id] {
            return Ok(());
        }
        self.latched[err_id] = false;
        let bit = (entry.reg_bit & 0x07) as usize;
        self.counts[bit] = self.counts[bit].saturating_sub(1);
        self.update_register(od);
        debug!("EMCY clear: id={}", err_id);
        self.transmit(0x0000, [0; 5], od, driver, nmt)
    }

    /// Clears every latched error. Unless `silent`, one reset frame per
    /// previously active error is emitted.
    pub fn reset(
        &mut self,
        silent: bool,
        od: &mut ObjectDictionary,
        driver: &mut dyn CanDriver,
        nmt: &NmtSlave,
    ) {
        for err_id in 0..self.latched.len() {
            if !self.latched[err_id] {
                continue;
            }
            if silent {
                let bit = (self.table[err_id].reg_bit & 0x07) as usize;
                self.latched[err_id] = false;
                self.counts[bit] = self.counts[bit].saturating_sub(1);
            } else if let Err(e) = self.clr(err_id, od, driver, nmt) {
                warn!("EMCY reset: clear of {} failed: {}", err_id, e);
            }
        }
        if silent {
            self.update_register(od);
        }
    }

    /// Empties the pre-defined error field (0x1003:00 written with zero).
    pub fn clear_history(&self, od: &mut ObjectDictionary) {
        for sub in 1..=self.hist_max {
            let _ = od.write_unchecked(
                ObjectKey::new(IDX_ERROR_FIELD, sub),
                ObjectValue::Unsigned32(0),
            );
        }
        let _ = od.write_unchecked(
            ObjectKey::new(IDX_ERROR_FIELD, 0),
            ObjectValue::Unsigned8(0),
        );
    }

    /// Rebuilds 0x1001 from the per-bit counters. The generic bit is set
    /// whenever any error is active.
    fn update_register(&self, od: &mut ObjectDictionary) {
        let mut register = 0u8;
        for bit in 0..8 {
            if self.counts[bit] > 0 {
                register |= 1 << bit;
            }
        }
        if register != 0 {
            register |= 1 << error_register::GENERIC;
        }
        let _ = od.write_unchecked(KEY_ERROR_REGISTER, ObjectValue::Unsigned8(register));
    }

    /// Records an error in the pre-defined error field: the newest entry
    /// sits at sub-index 1, older ones shift down, the count saturates at
    /// the field size.
    fn history_add(&self, od: &mut ObjectDictionary, code: u16, usr: &[u8; 5]) {
        if self.hist_max == 0 {
            return;
        }
        let count = od
            .read_u8(ObjectKey::new(IDX_ERROR_FIELD, 0))
            .unwrap_or(0)
            .min(self.hist_max);
        for sub in (1..=count.min(self.hist_max - 1)).rev() {
            if let Ok(older) = od.read_u32(ObjectKey::new(IDX_ERROR_FIELD, sub)) {
                let _ = od.write_unchecked(
                    ObjectKey::new(IDX_ERROR_FIELD, sub + 1),
                    ObjectValue::Unsigned32(older),
                );
            }
        }
        let value = code as u32 | ((usr[0] as u32) << 16) | ((usr[1] as u32) << 24);
        let _ = od.write_unchecked(
            ObjectKey::new(IDX_ERROR_FIELD, 1),
            ObjectValue::Unsigned32(value),
        );
        let _ = od.write_unchecked(
            ObjectKey::new(IDX_ERROR_FIELD, 0),
            ObjectValue::Unsigned8((count + 1).min(self.hist_max)),
        );
    }

    /// Emits one emergency frame: error code, error register, user info.
    fn transmit(
        &self,
        code: u16,
        usr: [u8; 5],
        od: &ObjectDictionary,
        driver: &mut dyn CanDriver,
        nmt: &NmtSlave,
    ) -> Result<(), CanopenError> {
        if !nmt.allowed(ObjectClassMask::EMCY) {
            return Ok(());
        }
        let cob = od.read_u32(KEY_EMCY_COB)?;
        if cob & COBID_OFF != 0 {
            return Ok(());
        }
        let mut frame = CanFrame::new((cob & COBID_STD_MASK) as u16);
        frame.set_u16(0, code);
        frame.set_u8(2, od.read_u8(KEY_ERROR_REGISTER).unwrap_or(0));
        frame.data[3..8].copy_from_slice(&usr);
        frame.dlc = 8;
        driver.send(&frame)
    }
}
