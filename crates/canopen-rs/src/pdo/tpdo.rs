// crates/canopen-rs/src/pdo/tpdo.rs

use super::PdoMapping;
use crate::frame::CanFrame;
use crate::hal::{CanDriver, CanopenError};
use crate::nmt::{NmtSlave, ObjectClassMask};
use crate::od::{ObjectDictionary, ObjectKey, PDO_MAP_MAX};
use crate::tmr::{TimerAction, TimerWheel, TmrHandle};
use crate::types::{COBID_EXTENDED, COBID_OFF, COBID_STD_MASK};
use alloc::vec::Vec;
use log::{trace, warn};

/// Sentinel TPDO number marking an unused slot of the reverse map.
pub const TPDO_LINK_UNUSED: u16 = 0xFFFF;

/// One slot of the object-to-TPDO reverse map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpdoLink {
    pub key: ObjectKey,
    pub num: u16,
}

#[derive(Debug, Clone, Copy)]
struct MapSlot {
    key: ObjectKey,
    len: u8,
}

/// Runtime state of one transmit PDO, loaded from 0x1800+n / 0x1A00+n.
pub struct Tpdo {
    /// 11-bit identifier; `None` while the TPDO is disabled.
    cob_id: Option<u16>,
    /// Transmission type: 1..=240 synchronous-cyclic, 254/255 asynchronous.
    ttype: u8,
    sync_countdown: u8,
    map: Vec<MapSlot>,
    /// Inhibit time in wheel ticks. The wire unit is 100 us; it is rounded
    /// up to whole milliseconds here.
    inhibit_ticks: u32,
    /// Event timer period in wheel ticks.
    event_ticks: u32,
    event_tmr: Option<TmrHandle>,
    inhibit_tmr: Option<TmrHandle>,
    /// Transmission currently blocked by the inhibit window.
    inhibited: bool,
    /// An event arrived during the inhibit window; transmit at its end.
    event_deferred: bool,
}

impl Tpdo {
    fn disabled() -> Self {
        Self {
            cob_id: None,
            ttype: 0,
            sync_countdown: 0,
            map: Vec::new(),
            inhibit_ticks: 0,
            event_ticks: 0,
            event_tmr: None,
            inhibit_tmr: None,
            inhibited: false,
            event_deferred: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cob_id.is_some()
    }

    pub fn is_synchronous(&self) -> bool {
        (1..=240).contains(&self.ttype)
    }

    fn clear_timers(&mut self, tmr: &mut TimerWheel) {
        if let Some(handle) = self.event_tmr.take() {
            let _ = tmr.delete(handle);
        }
        if let Some(handle) = self.inhibit_tmr.take() {
            let _ = tmr.delete(handle);
        }
    }
}

/// The transmit-PDO engine: per-PDO timers, the SYNC schedule and the
/// object-to-TPDO reverse map used to resolve write-triggered events
/// without scanning every PDO.
pub struct TpdoEngine {
    pdos: Vec<Tpdo>,
    links: Vec<TpdoLink>,
}

impl TpdoEngine {
    pub fn new(count: u16) -> Self {
        let mut pdos = Vec::with_capacity(count as usize);
        for _ in 0..count {
            pdos.push(Tpdo::disabled());
        }
        let links = alloc::vec![
            TpdoLink {
                key: ObjectKey::new(0, 0),
                num: TPDO_LINK_UNUSED,
            };
            count as usize * PDO_MAP_MAX
        ];
        Self { pdos, links }
    }

    pub fn count(&self) -> u16 {
        self.pdos.len() as u16
    }

    pub fn pdo(&self, num: u16) -> Option<&Tpdo> {
        self.pdos.get(num as usize)
    }

    /// The reverse-map slots; exposed for invariant checks.
    pub fn links(&self) -> &[TpdoLink] {
        &self.links
    }

    /// Disables every TPDO and releases all timers.
    pub fn clear(&mut self, tmr: &mut TimerWheel) {
        for pdo in &mut self.pdos {
            pdo.clear_timers(tmr);
            *pdo = Tpdo::disabled();
        }
        for link in &mut self.links {
            link.num = TPDO_LINK_UNUSED;
        }
    }

    /// Re-reads the configuration of every TPDO.
    pub fn reset_all(&mut self, od: &ObjectDictionary, tmr: &mut TimerWheel) {
        for num in 0..self.count() {
            if let Err(e) = self.reset(num, od, tmr) {
                warn!("TPDO {} left disabled: {}", num, e);
            }
        }
    }

    /// Tears down TPDO `num` and re-reads its communication and mapping
    /// records. A TPDO whose records are absent stays disabled silently;
    /// invalid configuration leaves it disabled and reports the error.
    pub fn reset(
        &mut self,
        num: u16,
        od: &ObjectDictionary,
        tmr: &mut TimerWheel,
    ) -> Result<(), CanopenError> {
        let Some(pdo) = self.pdos.get_mut(num as usize) else {
            return Err(CanopenError::Argument);
        };
        pdo.clear_timers(tmr);
        *pdo = Tpdo::disabled();
        self.unlink(num);

        let comm = 0x1800 + num;
        let Ok(cob) = od.read_u32(ObjectKey::new(comm, 1)) else {
            return Ok(());
        };
        let ttype = od.read_u8(ObjectKey::new(comm, 2)).unwrap_or(254);
        let inhibit_100us = od.read_u16(ObjectKey::new(comm, 3)).unwrap_or(0);
        let event_ms = od.read_u16(ObjectKey::new(comm, 5)).unwrap_or(0);

        // Resolve the mapping regardless of the enable bit so the reverse
        // map mirrors the configuration as soon as the TPDO goes live.
        let map = self.resolve_mapping(num, od)?;

        let pdo = &mut self.pdos[num as usize];
        pdo.map = map;
        if cob & COBID_OFF != 0 {
            return Ok(());
        }
        if cob & COBID_EXTENDED != 0 {
            return Err(CanopenError::PdoConfig);
        }

        pdo.cob_id = Some((cob & COBID_STD_MASK) as u16);
        pdo.ttype = ttype;
        pdo.sync_countdown = ttype;
        pdo.inhibit_ticks = (inhibit_100us as u32).div_ceil(10);
        pdo.event_ticks = event_ms as u32;

        if !pdo.is_synchronous() && pdo.event_ticks > 0 {
            pdo.event_tmr = Some(tmr.create(pdo.event_ticks, 0, TimerAction::TpdoEvent(num))?);
        }
        self.link(num);
        trace!("TPDO {} armed: type={} inhibit={}ms event={}ms", num, ttype,
            self.pdos[num as usize].inhibit_ticks, event_ms);
        Ok(())
    }

    fn resolve_mapping(
        &self,
        num: u16,
        od: &ObjectDictionary,
    ) -> Result<Vec<MapSlot>, CanopenError> {
        let map_index = 0x1A00 + num;
        let count = od.read_u8(ObjectKey::new(map_index, 0)).unwrap_or(0);
        let mut slots = Vec::with_capacity(count as usize);
        let mut total = 0usize;
        for sub in 1..=count.min(PDO_MAP_MAX as u8) {
            let raw = od.read_u32(ObjectKey::new(map_index, sub))?;
            let mapping = PdoMapping::from_u32(raw);
            if mapping.is_empty() {
                continue;
            }
            if mapping.is_dummy() {
                return Err(CanopenError::CannotMap);
            }
            let target = od.find(mapping.key())?;
            if !target.is_pdo_mappable() || !target.is_readable() {
                return Err(CanopenError::CannotMap);
            }
            total += mapping.byte_len();
            if total > 8 {
                return Err(CanopenError::MapLength);
            }
            slots.push(MapSlot {
                key: mapping.key(),
                len: mapping.byte_len() as u8,
            });
        }
        Ok(slots)
    }

    /// Writes the mapping of TPDO `num` into the reverse map.
    fn link(&mut self, num: u16) {
        let keys: Vec<ObjectKey> = self.pdos[num as usize]
            .map
            .iter()
            .map(|slot| slot.key)
            .collect();
        for key in keys {
            if let Some(slot) = self
                .links
                .iter_mut()
                .find(|slot| slot.num == TPDO_LINK_UNUSED)
            {
                slot.key = key;
                slot.num = num;
            } else {
                warn!("TPDO reverse map full, trigger for {:?} lost", key);
            }
        }
    }

    /// Clears every reverse-map slot of TPDO `num`.
    fn unlink(&mut self, num: u16) {
        for slot in &mut self.links {
            if slot.num == num {
                slot.num = TPDO_LINK_UNUSED;
            }
        }
    }

    /// Schedules a transmission for every TPDO that maps the given object.
    /// This is the write-triggered event path: a reverse-map scan instead
    /// of a walk over every PDO.
    pub fn trig_obj(
        &mut self,
        key: ObjectKey,
        od: &ObjectDictionary,
        driver: &mut dyn CanDriver,
        nmt: &NmtSlave,
        tmr: &mut TimerWheel,
    ) {
        let mut nums: Vec<u16> = self
            .links
            .iter()
            .filter(|slot| slot.num != TPDO_LINK_UNUSED && slot.key == key)
            .map(|slot| slot.num)
            .collect();
        nums.sort_unstable();
        nums.dedup();
        for num in nums {
            self.trig_pdo(num, od, driver, nmt, tmr);
        }
    }

    /// Transmits TPDO `num` immediately (subject to state and inhibit).
    pub fn trig_pdo(
        &mut self,
        num: u16,
        od: &ObjectDictionary,
        driver: &mut dyn CanDriver,
        nmt: &NmtSlave,
        tmr: &mut TimerWheel,
    ) {
        if let Err(e) = self.tx(num, od, driver, nmt, tmr) {
            warn!("TPDO {} transmission failed: {}", num, e);
        }
    }

    /// Event-timer expiry for TPDO `num`.
    pub fn on_event_timer(
        &mut self,
        num: u16,
        od: &ObjectDictionary,
        driver: &mut dyn CanDriver,
        nmt: &NmtSlave,
        tmr: &mut TimerWheel,
    ) {
        if let Some(pdo) = self.pdos.get_mut(num as usize) {
            // The one-shot has normally fired already; deleting is a no-op then.
            if let Some(handle) = pdo.event_tmr.take() {
                let _ = tmr.delete(handle);
            }
        }
        self.trig_pdo(num, od, driver, nmt, tmr);
    }

    /// End of the inhibit window for TPDO `num`: a deferred event is
    /// transmitted now.
    pub fn on_inhibit_end(
        &mut self,
        num: u16,
        od: &ObjectDictionary,
        driver: &mut dyn CanDriver,
        nmt: &NmtSlave,
        tmr: &mut TimerWheel,
    ) {
        let Some(pdo) = self.pdos.get_mut(num as usize) else {
            return;
        };
        if let Some(handle) = pdo.inhibit_tmr.take() {
            let _ = tmr.delete(handle);
        }
        pdo.inhibited = false;
        if pdo.event_deferred {
            pdo.event_deferred = false;
            self.trig_pdo(num, od, driver, nmt, tmr);
        }
    }

    /// SYNC point: every synchronous TPDO whose countdown reaches zero
    /// transmits, in ascending TPDO number.
    pub fn on_sync(
        &mut self,
        od: &ObjectDictionary,
        driver: &mut dyn CanDriver,
        nmt: &NmtSlave,
        tmr: &mut TimerWheel,
    ) {
        for num in 0..self.count() {
            let pdo = &mut self.pdos[num as usize];
            if !pdo.is_enabled() || !pdo.is_synchronous() {
                continue;
            }
            pdo.sync_countdown = pdo.sync_countdown.saturating_sub(1);
            if pdo.sync_countdown == 0 {
                pdo.sync_countdown = pdo.ttype;
                if let Err(e) = self.tx(num, od, driver, nmt, tmr) {
                    warn!("TPDO {} SYNC transmission failed: {}", num, e);
                }
            }
        }
    }

    /// Restarts the SYNC countdowns (on transition to Operational).
    pub fn restart_sync(&mut self) {
        for pdo in &mut self.pdos {
            pdo.sync_countdown = pdo.ttype;
        }
    }

    fn tx(
        &mut self,
        num: u16,
        od: &ObjectDictionary,
        driver: &mut dyn CanDriver,
        nmt: &NmtSlave,
        tmr: &mut TimerWheel,
    ) -> Result<(), CanopenError> {
        if !nmt.allowed(ObjectClassMask::PDO) {
            return Ok(());
        }
        let pdo = self
            .pdos
            .get_mut(num as usize)
            .ok_or(CanopenError::Argument)?;
        let Some(cob_id) = pdo.cob_id else {
            return Ok(());
        };
        if pdo.inhibited {
            pdo.event_deferred = true;
            return Ok(());
        }

        let mut frame = CanFrame::new(cob_id);
        let mut dlc = 0usize;
        for slot in &pdo.map {
            let bytes = od.read_bytes(slot.key)?;
            let len = slot.len as usize;
            frame.data[dlc..dlc + len].copy_from_slice(&bytes[..len]);
            dlc += len;
        }
        frame.dlc = dlc as u8;

        // A fresh transmission supersedes a pending event timer.
        if let Some(handle) = pdo.event_tmr.take() {
            let _ = tmr.delete(handle);
        }
        if pdo.inhibit_ticks > 0 {
            pdo.inhibit_tmr = Some(tmr.create(pdo.inhibit_ticks, 0, TimerAction::TpdoInhibit(num))?);
            pdo.inhibited = true;
        }
        if !pdo.is_synchronous() && pdo.event_ticks > 0 {
            pdo.event_tmr = Some(tmr.create(pdo.event_ticks, 0, TimerAction::TpdoEvent(num))?);
        }
        driver.send(&frame).map_err(|e| {
            warn!("TPDO {}: driver rejected frame", num);
            e
        })
    }
}
