// crates/canopen-rs/src/sync.rs

use crate::hal::CanDriver;
use crate::nmt::NmtSlave;
use crate::od::{ObjectDictionary, ObjectKey, WriteEffect};
use crate::pdo::{RpdoEngine, TpdoEngine};
use crate::tmr::TimerWheel;
use crate::types::COBID_STD_MASK;
use log::trace;

/// Key of the SYNC COB-ID object.
const KEY_SYNC_COB: ObjectKey = ObjectKey::new(0x1005, 0);

/// Consumer of the SYNC object (CiA 301, Section 7.2.5).
///
/// A slave only consumes SYNC; the generator bit of 0x1005 is carried in
/// the dictionary but informational here. Each SYNC point releases the
/// buffered payloads of synchronized RPDOs and advances the transmission
/// countdown of synchronous TPDOs.
pub struct SyncHandler {
    counter: u32,
}

impl SyncHandler {
    pub fn new() -> Self {
        Self { counter: 0 }
    }

    /// Number of SYNC frames seen since the last reset.
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// The identifier SYNC frames arrive on, read live from 0x1005.
    pub fn cob_id(&self, od: &ObjectDictionary) -> Option<u16> {
        od.read_u32(KEY_SYNC_COB)
            .ok()
            .map(|cob| (cob & COBID_STD_MASK) as u16)
    }

    /// Restarts the SYNC schedule (entering Operational, communication
    /// reset).
    pub fn reset(&mut self, tpdo: &mut TpdoEngine) {
        self.counter = 0;
        tpdo.restart_sync();
    }

    /// One SYNC point: apply buffered RPDO payloads first so synchronous
    /// TPDO data reflects the newest inputs, then serve the TPDO schedule.
    pub fn on_sync(
        &mut self,
        od: &mut ObjectDictionary,
        tpdo: &mut TpdoEngine,
        rpdo: &mut RpdoEngine,
        driver: &mut dyn CanDriver,
        nmt: &NmtSlave,
        tmr: &mut TimerWheel,
    ) -> alloc::vec::Vec<WriteEffect> {
        self.counter = self.counter.wrapping_add(1);
        trace!("SYNC #{}", self.counter);
        let effects = rpdo.on_sync(od);
        tpdo.on_sync(od, driver, nmt, tmr);
        effects
    }
}

impl Default for SyncHandler {
    fn default() -> Self {
        Self::new()
    }
}
