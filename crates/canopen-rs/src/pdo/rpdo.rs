// crates/canopen-rs/src/pdo/rpdo.rs

use super::PdoMapping;
use crate::frame::CanFrame;
use crate::hal::CanopenError;
use crate::od::{ObjectDictionary, ObjectKey, ObjectValue, PDO_MAP_MAX, WriteEffect};
use crate::types::{COBID_EXTENDED, COBID_OFF, COBID_STD_MASK};
use alloc::vec::Vec;
use log::{trace, warn};

#[derive(Debug, Clone, Copy)]
struct MapSlot {
    /// `None` marks a dummy slot: the payload bytes are consumed without a
    /// dictionary write.
    key: Option<ObjectKey>,
    len: u8,
}

/// Runtime state of one receive PDO, loaded from 0x1400+n / 0x1600+n.
pub struct Rpdo {
    cob_id: Option<u16>,
    /// Transmission type 0..=240: apply the payload at the next SYNC.
    synchronized: bool,
    map: Vec<MapSlot>,
    /// Most recent frame of a synchronized RPDO, pending the next SYNC.
    buffered: Option<CanFrame>,
}

impl Rpdo {
    fn disabled() -> Self {
        Self {
            cob_id: None,
            synchronized: false,
            map: Vec::new(),
            buffered: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cob_id.is_some()
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }
}

/// The receive-PDO engine: identifier matching, payload distribution into
/// the dictionary, and buffering of synchronized PDOs until the next SYNC.
pub struct RpdoEngine {
    pdos: Vec<Rpdo>,
}

impl RpdoEngine {
    pub fn new(count: u16) -> Self {
        let mut pdos = Vec::with_capacity(count as usize);
        for _ in 0..count {
            pdos.push(Rpdo::disabled());
        }
        Self { pdos }
    }

    pub fn count(&self) -> u16 {
        self.pdos.len() as u16
    }

    pub fn pdo(&self, num: u16) -> Option<&Rpdo> {
        self.pdos.get(num as usize)
    }

    /// Disables every RPDO and drops buffered frames.
    pub fn clear(&mut self) {
        for pdo in &mut self.pdos {
            *pdo = Rpdo::disabled();
        }
    }

    /// Re-reads the configuration of every RPDO.
    pub fn reset_all(&mut self, od: &ObjectDictionary) {
        for num in 0..self.count() {
            if let Err(e) = self.reset(num, od) {
                warn!("RPDO {} left disabled: {}", num, e);
            }
        }
    }

    /// Tears down RPDO `num` and re-reads its communication and mapping
    /// records. Absent records leave it disabled silently.
    pub fn reset(&mut self, num: u16, od: &ObjectDictionary) -> Result<(), CanopenError> {
        let Some(pdo) = self.pdos.get_mut(num as usize) else {
            return Err(CanopenError::Argument);
        };
        *pdo = Rpdo::disabled();

        let comm = 0x1400 + num;
        let Ok(cob) = od.read_u32(ObjectKey::new(comm, 1)) else {
            return Ok(());
        };
        if cob & COBID_OFF != 0 {
            return Ok(());
        }
        if cob & COBID_EXTENDED != 0 {
            return Err(CanopenError::PdoConfig);
        }
        let ttype = od.read_u8(ObjectKey::new(comm, 2)).unwrap_or(254);

        let map_index = 0x1600 + num;
        let count = od.read_u8(ObjectKey::new(map_index, 0)).unwrap_or(0);
        let mut map = Vec::with_capacity(count as usize);
        let mut total = 0usize;
        for sub in 1..=count.min(PDO_MAP_MAX as u8) {
            let raw = od.read_u32(ObjectKey::new(map_index, sub))?;
            let mapping = PdoMapping::from_u32(raw);
            if mapping.is_empty() {
                continue;
            }
            total += mapping.byte_len();
            if total > 8 {
                return Err(CanopenError::MapLength);
            }
            if mapping.is_dummy() {
                map.push(MapSlot {
                    key: None,
                    len: mapping.byte_len() as u8,
                });
                continue;
            }
            let target = od.find(mapping.key())?;
            if !target.is_pdo_mappable() || !target.is_writable() {
                return Err(CanopenError::CannotMap);
            }
            map.push(MapSlot {
                key: Some(mapping.key()),
                len: mapping.byte_len() as u8,
            });
        }

        let pdo = &mut self.pdos[num as usize];
        pdo.cob_id = Some((cob & COBID_STD_MASK) as u16);
        pdo.synchronized = ttype <= 240;
        pdo.map = map;
        trace!("RPDO {} armed: id={:03X} sync={}", num, cob & COBID_STD_MASK, ttype <= 240);
        Ok(())
    }

    /// Finds the enabled RPDO listening on the given identifier.
    pub fn match_frame(&self, id: u16) -> Option<u16> {
        self.pdos
            .iter()
            .position(|pdo| pdo.cob_id == Some(id))
            .map(|idx| idx as u16)
    }

    /// Consumes a received frame: synchronized RPDOs stash the payload
    /// until the next SYNC, asynchronous ones distribute it immediately.
    pub fn on_frame(
        &mut self,
        num: u16,
        frame: &CanFrame,
        od: &mut ObjectDictionary,
    ) -> Vec<WriteEffect> {
        let Some(pdo) = self.pdos.get_mut(num as usize) else {
            return Vec::new();
        };
        if pdo.synchronized {
            pdo.buffered = Some(*frame);
            return Vec::new();
        }
        Self::distribute(&pdo.map, frame, od, num)
    }

    /// SYNC point: buffered payloads of synchronized RPDOs are applied to
    /// the dictionary now.
    pub fn on_sync(&mut self, od: &mut ObjectDictionary) -> Vec<WriteEffect> {
        let mut effects = Vec::new();
        for num in 0..self.pdos.len() {
            if let Some(frame) = self.pdos[num].buffered.take() {
                effects.extend(Self::distribute(&self.pdos[num].map, &frame, od, num as u16));
            }
        }
        effects
    }

    /// Walks the mapping and writes each payload slice to its object.
    /// Dummy slots advance the cursor without a write.
    fn distribute(
        map: &[MapSlot],
        frame: &CanFrame,
        od: &mut ObjectDictionary,
        num: u16,
    ) -> Vec<WriteEffect> {
        let mut effects = Vec::new();
        let payload = frame.payload();
        let mut offset = 0usize;
        for slot in map {
            let len = slot.len as usize;
            if offset + len > payload.len() {
                warn!(
                    "RPDO {}: payload too short ({} bytes, mapping needs {})",
                    num,
                    payload.len(),
                    offset + len
                );
                break;
            }
            if let Some(key) = slot.key {
                let slice = &payload[offset..offset + len];
                let result = od
                    .find(key)
                    .map(|entry| entry.value.clone())
                    .and_then(|template| ObjectValue::deserialize(slice, &template))
                    .and_then(|value| od.write_unchecked(key, value));
                match result {
                    Ok(effect) => effects.push(effect),
                    Err(e) => warn!("RPDO {}: write to {:?} failed: {}", num, key, e),
                }
            }
            offset += len;
        }
        effects
    }
}
