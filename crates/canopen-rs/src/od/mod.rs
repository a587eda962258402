// crates/canopen-rs/src/od/mod.rs

mod entry;
mod predefined;
mod value;

pub use entry::{ObjectEntry, ObjectFlags, ObjectKey, ObjectKind};
pub use predefined::{populate_pdo_defaults, populate_protocol_objects};
pub use value::ObjectValue;

use crate::hal::{CanopenError, NvmStorage};
use crate::types::{COBID_EXTENDED, COBID_OFF, NodeId};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;
use core::mem::discriminant;
use log::{trace, warn};

/// ASCII "save", little-endian, accepted by 0x1010 (CiA 301, Section 7.5.2.14).
pub const STORE_SIGNATURE: u32 = 0x6576_6173;
/// ASCII "load", little-endian, accepted by 0x1011.
pub const RESTORE_SIGNATURE: u32 = 0x6461_6F6C;

/// Maximum number of mapping entries per PDO.
pub const PDO_MAP_MAX: usize = 8;

/// A side effect produced by a dictionary write that must be applied by the
/// node orchestrator. The dictionary never reaches back into the node; it
/// reports what changed and the caller owns the consequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteEffect {
    /// Nothing beyond the stored value changed.
    None,
    /// The value of a TPDO-mapped trigger object changed; every TPDO
    /// mapping it must be scheduled.
    TpdoSignal(ObjectKey),
    /// Communication or mapping parameters of TPDO `n` changed; it must be
    /// torn down and re-read.
    TpdoReset(u16),
    /// Communication or mapping parameters of RPDO `n` changed.
    RpdoReset(u16),
    /// The producer heartbeat time changed; the producer must be
    /// rescheduled immediately.
    HeartbeatRestart,
    /// The pre-defined error field was cleared through 0x1003:00.
    EmcyHistClear,
}

/// The main Object Dictionary structure.
///
/// Entries live in a `BTreeMap` keyed by (index, sub-index), which keeps
/// them unique and sorted and gives O(log n) lookup. The dictionary is
/// populated during node construction and structurally frozen once the
/// node starts; afterwards only the write accessors touch it.
pub struct ObjectDictionary<'a> {
    entries: BTreeMap<ObjectKey, ObjectEntry>,
    node_id: NodeId,
    storage: Option<&'a mut dyn NvmStorage>,
}

impl<'a> fmt::Debug for ObjectDictionary<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectDictionary")
            .field("entries", &self.entries.len())
            .field("node_id", &self.node_id)
            .field(
                "storage",
                &if self.storage.is_some() {
                    "Some(<Storage Backend>)"
                } else {
                    "None"
                },
            )
            .finish()
    }
}

impl<'a> ObjectDictionary<'a> {
    /// Creates a new, empty OD. Call `init()` after populating with
    /// application and device defaults to load persistent parameters and
    /// finish setup.
    pub fn new(node_id: NodeId, storage: Option<&'a mut dyn NvmStorage>) -> Self {
        Self {
            entries: BTreeMap::new(),
            node_id,
            storage,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Initialises the Object Dictionary. This method must be called after
    /// the application has inserted all its default and device-specific
    /// objects. It checks for a pending restore-defaults request, clears
    /// storage if one is flagged, and otherwise overlays the stored
    /// parameters onto the firmware defaults.
    pub fn init(&mut self) -> Result<(), CanopenError> {
        let mut restore_defaults = false;
        if let Some(s) = &mut self.storage {
            if s.restore_requested() {
                restore_defaults = true;
                s.clear_restore_flag()?;
                s.clear()?;
            }
        }

        if !restore_defaults {
            self.load_stored()?;
        }
        Ok(())
    }

    /// Loads values from the persistent storage backend and overwrites any
    /// matching existing entries in the OD. This is called by `init()`.
    fn load_stored(&mut self) -> Result<(), CanopenError> {
        if let Some(s) = &mut self.storage {
            let stored_params = s.load()?;
            for (key, value) in stored_params {
                // Values are persisted in stored (node-ID independent) form,
                // so they go straight into the entry. Objects that exist in
                // storage but not in the current firmware are skipped.
                if let Some(entry) = self.entries.get_mut(&key) {
                    if discriminant(&entry.value) == discriminant(&value) {
                        entry.value = value;
                    } else {
                        warn!("Skipping stored parameter {:?}: type changed", key);
                    }
                }
            }
        }
        Ok(())
    }

    /// Inserts a new object entry into the dictionary.
    pub fn insert(&mut self, key: ObjectKey, entry: ObjectEntry) {
        self.entries.insert(key, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up an entry, distinguishing an unknown index from an unknown
    /// sub-index of a known index (the two map to different SDO aborts).
    pub fn find(&self, key: ObjectKey) -> Result<&ObjectEntry, CanopenError> {
        if let Some(entry) = self.entries.get(&key) {
            return Ok(entry);
        }
        if self.index_exists(key.index) {
            Err(CanopenError::SubIndexNotFound)
        } else {
            Err(CanopenError::ObjectNotFound)
        }
    }

    /// True when any sub-index exists at the given index.
    pub fn index_exists(&self, index: u16) -> bool {
        self.entries
            .range(ObjectKey::new(index, 0)..=ObjectKey::new(index, 255))
            .next()
            .is_some()
    }

    /// Current size of the object in bytes. Stable for the whole duration
    /// of an SDO transfer because nothing else mutates the entry meanwhile.
    pub fn size_of(&self, key: ObjectKey) -> Result<usize, CanopenError> {
        Ok(self.find(key)?.value.size())
    }

    // --- Start of Type-Safe Accessors ---

    pub fn read_u8(&self, key: ObjectKey) -> Result<u8, CanopenError> {
        let entry = self.readable(key)?;
        match entry.value {
            ObjectValue::Unsigned8(v) => Ok(v),
            _ => Err(CanopenError::SizeMismatch),
        }
    }

    pub fn read_u16(&self, key: ObjectKey) -> Result<u16, CanopenError> {
        let entry = self.readable(key)?;
        match entry.value {
            ObjectValue::Unsigned16(v) => Ok(v),
            _ => Err(CanopenError::SizeMismatch),
        }
    }

    /// Reads a 32-bit value. Node-ID-relative entries (default COB-IDs)
    /// come back with the node-ID added in.
    pub fn read_u32(&self, key: ObjectKey) -> Result<u32, CanopenError> {
        let entry = self.readable(key)?;
        match entry.value {
            ObjectValue::Unsigned32(v) => Ok(self.adjust_on_read(entry, v)),
            _ => Err(CanopenError::SizeMismatch),
        }
    }

    pub fn write_u8(&mut self, key: ObjectKey, value: u8) -> Result<WriteEffect, CanopenError> {
        self.write(key, ObjectValue::Unsigned8(value))
    }

    pub fn write_u16(&mut self, key: ObjectKey, value: u16) -> Result<WriteEffect, CanopenError> {
        self.write(key, ObjectValue::Unsigned16(value))
    }

    pub fn write_u32(&mut self, key: ObjectKey, value: u32) -> Result<WriteEffect, CanopenError> {
        self.write(key, ObjectValue::Unsigned32(value))
    }

    // --- End of Type-Safe Accessors ---

    /// Serializes the current value to little-endian wire bytes, applying
    /// the node-ID adjustment where flagged.
    pub fn read_bytes(&self, key: ObjectKey) -> Result<Vec<u8>, CanopenError> {
        let entry = self.readable(key)?;
        if let ObjectValue::Unsigned32(v) = entry.value {
            if entry.flags.contains(ObjectFlags::NODE_ID_REL) {
                return Ok((v + self.node_id.0 as u32).to_le_bytes().to_vec());
            }
        }
        Ok(entry.value.serialize())
    }

    /// Copies a window of the serialized value into `out`, starting at byte
    /// `offset`. Used by segmented and block SDO uploads to stream large
    /// strings and domains without an intermediate copy of the whole value.
    /// Returns the number of bytes copied (zero at end of object).
    pub fn read_segment(
        &self,
        key: ObjectKey,
        out: &mut [u8],
        offset: usize,
    ) -> Result<usize, CanopenError> {
        let entry = self.readable(key)?;
        match &entry.value {
            ObjectValue::VisibleString(s) => Ok(copy_window(s.as_bytes(), out, offset)),
            ObjectValue::Domain(d) => Ok(copy_window(d, out, offset)),
            _ => {
                let bytes = self.read_bytes(key)?;
                Ok(copy_window(&bytes, out, offset))
            }
        }
    }

    /// Compares the current value against wire bytes; used to skip
    /// redundant change triggers.
    pub fn compare(&self, key: ObjectKey, data: &[u8]) -> bool {
        match self.entries.get(&key) {
            Some(entry) => {
                let mut current = entry.value.serialize();
                if entry.flags.contains(ObjectFlags::NODE_ID_REL) {
                    if let ObjectValue::Unsigned32(v) = entry.value {
                        current = (v + self.node_id.0 as u32).to_le_bytes().to_vec();
                    }
                }
                current == data
            }
            None => false,
        }
    }

    /// Writes wire bytes to an entry, deserializing against the current
    /// value as a type template. This is the landing point of SDO
    /// downloads.
    pub fn write_bytes(&mut self, key: ObjectKey, data: &[u8]) -> Result<WriteEffect, CanopenError> {
        let template = &self.find(key)?.value;
        let value = ObjectValue::deserialize(data, template)?;
        self.write(key, value)
    }

    /// Public write: respects access rights and runs the per-kind hooks.
    /// The returned [`WriteEffect`] must be applied by the caller.
    pub fn write(&mut self, key: ObjectKey, value: ObjectValue) -> Result<WriteEffect, CanopenError> {
        self.write_entry(key, value, true)
    }

    /// Write bypassing the access check; used by RPDO dispatch, which may
    /// target objects that are not SDO-writable.
    pub fn write_unchecked(
        &mut self,
        key: ObjectKey,
        value: ObjectValue,
    ) -> Result<WriteEffect, CanopenError> {
        self.write_entry(key, value, false)
    }

    fn readable(&self, key: ObjectKey) -> Result<&ObjectEntry, CanopenError> {
        let entry = self.find(key)?;
        if !entry.is_readable() {
            return Err(CanopenError::WriteOnly);
        }
        Ok(entry)
    }

    fn adjust_on_read(&self, entry: &ObjectEntry, raw: u32) -> u32 {
        if entry.flags.contains(ObjectFlags::NODE_ID_REL) {
            raw + self.node_id.0 as u32
        } else {
            raw
        }
    }

    fn write_entry(
        &mut self,
        key: ObjectKey,
        value: ObjectValue,
        check_access: bool,
    ) -> Result<WriteEffect, CanopenError> {
        let (kind, writable) = {
            let entry = self.find(key)?;
            (entry.kind, entry.is_writable())
        };
        if check_access && !writable {
            return Err(CanopenError::ReadOnly);
        }

        match kind {
            ObjectKind::Plain => {
                self.store(key, value)?;
                Ok(WriteEffect::None)
            }
            ObjectKind::AsyncTrigger => {
                if self.store(key, value)? {
                    Ok(WriteEffect::TpdoSignal(key))
                } else {
                    Ok(WriteEffect::None)
                }
            }
            ObjectKind::PdoCobId => self.write_pdo_cob_id(key, value),
            ObjectKind::PdoType => self.write_pdo_type(key, value),
            ObjectKind::PdoMapCount => self.write_pdo_map_count(key, value),
            ObjectKind::PdoMapEntry => self.write_pdo_map_entry(key, value),
            ObjectKind::PdoEvent => {
                self.store(key, value)?;
                Ok(WriteEffect::TpdoReset(key.index - 0x1800))
            }
            ObjectKind::SyncCobId => {
                let raw = numeric_u32(&value)?;
                if raw & COBID_EXTENDED != 0 {
                    return Err(CanopenError::PdoConfig);
                }
                self.store(key, value)?;
                Ok(WriteEffect::None)
            }
            ObjectKind::EmcyCobId => {
                let raw = numeric_u32(&value)?;
                if raw & COBID_EXTENDED != 0 {
                    return Err(CanopenError::PdoConfig);
                }
                self.store(key, value)?;
                Ok(WriteEffect::None)
            }
            ObjectKind::EmcyHistory => {
                match value {
                    ObjectValue::Unsigned8(0) => {
                        self.store(key, ObjectValue::Unsigned8(0))?;
                        Ok(WriteEffect::EmcyHistClear)
                    }
                    ObjectValue::Unsigned8(_) => Err(CanopenError::Range),
                    _ => Err(CanopenError::SizeMismatch),
                }
            }
            ObjectKind::HeartbeatTime => {
                self.store(key, value)?;
                Ok(WriteEffect::HeartbeatRestart)
            }
            ObjectKind::SdoServerCobId => {
                let raw = numeric_u32(&value)?;
                let current = self.read_u32(key)?;
                if current & COBID_OFF == 0 && raw & COBID_OFF == 0 {
                    return Err(CanopenError::Incompatible);
                }
                if raw & COBID_OFF == 0 && raw & COBID_EXTENDED != 0 {
                    return Err(CanopenError::PdoConfig);
                }
                self.store(key, value)?;
                Ok(WriteEffect::None)
            }
            ObjectKind::ParameterStore => {
                if numeric_u32(&value)? != STORE_SIGNATURE {
                    return Err(CanopenError::Storage("invalid store signature"));
                }
                self.store_parameters(key.sub_index)?;
                // The stored value stays the capability read-back.
                Ok(WriteEffect::None)
            }
            ObjectKind::ParameterRestore => {
                if numeric_u32(&value)? != RESTORE_SIGNATURE {
                    return Err(CanopenError::Storage("invalid restore signature"));
                }
                self.restore_defaults(key.sub_index)?;
                Ok(WriteEffect::None)
            }
        }
    }

    /// Stores a value, applying the node-ID subtraction where flagged and
    /// enforcing that the variant (and thus the width) does not change.
    /// Returns true when the stored value actually changed.
    fn store(&mut self, key: ObjectKey, value: ObjectValue) -> Result<bool, CanopenError> {
        let node_id = self.node_id.0 as u32;
        let entry = self
            .entries
            .get_mut(&key)
            .ok_or(CanopenError::ObjectNotFound)?;
        let value = if entry.flags.contains(ObjectFlags::NODE_ID_REL) {
            match value {
                ObjectValue::Unsigned32(v) => ObjectValue::Unsigned32(v.wrapping_sub(node_id)),
                other => other,
            }
        } else {
            value
        };
        if discriminant(&entry.value) != discriminant(&value) {
            return Err(CanopenError::SizeMismatch);
        }
        let changed = entry.value != value;
        entry.value = value;
        Ok(changed)
    }

    // --- PDO configuration hooks ---

    fn write_pdo_cob_id(
        &mut self,
        key: ObjectKey,
        value: ObjectValue,
    ) -> Result<WriteEffect, CanopenError> {
        let new = numeric_u32(&value)?;
        let current = self.read_u32(key)?;
        // A write may only go through when it disables the PDO or the PDO
        // is currently disabled (CiA 301, Section 7.5.2.33).
        if current & COBID_OFF == 0 && new & COBID_OFF == 0 {
            return Err(CanopenError::Incompatible);
        }
        if new & COBID_OFF == 0 {
            if new & COBID_EXTENDED != 0 {
                return Err(CanopenError::PdoConfig);
            }
            if is_tpdo_index(key.index) && new & crate::types::COBID_NO_RTR == 0 {
                // This stack never answers PDO RTRs; enabling a TPDO that
                // allows them is rejected.
                return Err(CanopenError::PdoConfig);
            }
        }
        self.store(key, value)?;
        Ok(pdo_reset_effect(key.index))
    }

    fn write_pdo_type(
        &mut self,
        key: ObjectKey,
        value: ObjectValue,
    ) -> Result<WriteEffect, CanopenError> {
        let ttype = match value {
            ObjectValue::Unsigned8(v) => v,
            _ => return Err(CanopenError::SizeMismatch),
        };
        if (241..=253).contains(&ttype) {
            return Err(CanopenError::Range);
        }
        if self.pdo_enabled(key.index)? {
            return Err(CanopenError::Incompatible);
        }
        self.store(key, value)?;
        Ok(pdo_reset_effect(key.index))
    }

    fn write_pdo_map_count(
        &mut self,
        key: ObjectKey,
        value: ObjectValue,
    ) -> Result<WriteEffect, CanopenError> {
        let count = match value {
            ObjectValue::Unsigned8(v) => v,
            _ => return Err(CanopenError::SizeMismatch),
        };
        if count as usize > PDO_MAP_MAX {
            return Err(CanopenError::MapLength);
        }
        let comm_index = mapping_to_comm_index(key.index);
        if self.pdo_enabled(comm_index)? {
            return Err(CanopenError::Incompatible);
        }
        let is_tpdo = is_tpdo_mapping_index(key.index);
        let mut total_bytes = 0usize;
        for sub in 1..=count {
            let raw = self.read_u32(ObjectKey::new(key.index, sub))?;
            total_bytes += self.validate_mapping_value(raw, is_tpdo)?;
        }
        if total_bytes > 8 {
            return Err(CanopenError::MapLength);
        }
        self.store(key, value)?;
        Ok(pdo_reset_effect(comm_index))
    }

    fn write_pdo_map_entry(
        &mut self,
        key: ObjectKey,
        value: ObjectValue,
    ) -> Result<WriteEffect, CanopenError> {
        let raw = numeric_u32(&value)?;
        let comm_index = mapping_to_comm_index(key.index);
        if self.pdo_enabled(comm_index)? {
            return Err(CanopenError::Incompatible);
        }
        self.validate_mapping_value(raw, is_tpdo_mapping_index(key.index))?;
        self.store(key, value)?;
        Ok(WriteEffect::None)
    }

    /// Validates a single packed mapping value and returns its byte length.
    fn validate_mapping_value(&self, raw: u32, is_tpdo: bool) -> Result<usize, CanopenError> {
        let index = (raw >> 16) as u16;
        let sub_index = ((raw >> 8) & 0xFF) as u8;
        let bits = (raw & 0xFF) as usize;

        if raw == 0 {
            // An all-zero entry is an inactive placeholder.
            return Ok(0);
        }
        if bits == 0 || bits % 8 != 0 || bits > 64 {
            return Err(CanopenError::CannotMap);
        }
        let bytes = bits / 8;

        // Dummy entries (CiA 301, Section 7.4.3.2) consume payload bytes
        // without touching the dictionary; receive direction only.
        if (0x0002..=0x0007).contains(&index) && sub_index == 0 {
            if is_tpdo {
                return Err(CanopenError::CannotMap);
            }
            let expected = match index {
                0x0002 | 0x0005 => 1,
                0x0003 | 0x0006 => 2,
                0x0004 | 0x0007 => 4,
                _ => unreachable!(),
            };
            if bytes != expected {
                return Err(CanopenError::CannotMap);
            }
            return Ok(bytes);
        }

        let target = self.find(ObjectKey::new(index, sub_index))?;
        if !target.is_pdo_mappable() {
            return Err(CanopenError::CannotMap);
        }
        if is_tpdo && !target.is_readable() {
            return Err(CanopenError::CannotMap);
        }
        if !is_tpdo && !target.is_writable() {
            return Err(CanopenError::CannotMap);
        }
        if bytes > target.value.size() {
            return Err(CanopenError::CannotMap);
        }
        Ok(bytes)
    }

    fn pdo_enabled(&self, comm_index: u16) -> Result<bool, CanopenError> {
        let cob = self.read_u32(ObjectKey::new(comm_index, 1))?;
        Ok(cob & COBID_OFF == 0)
    }

    // --- Parameter store / restore (0x1010 / 0x1011) ---

    /// Collects all storable parameters of the addressed group and tells
    /// the storage backend to save them.
    fn store_parameters(&mut self, group: u8) -> Result<(), CanopenError> {
        let mut storable_params = BTreeMap::new();
        for (&key, entry) in &self.entries {
            let in_group = match group {
                1 => true,                                      // Save All
                2 => (0x1000..=0x1FFF).contains(&key.index),    // Communication
                3 => key.index >= 0x2000,                       // Application
                _ => return Err(CanopenError::SubIndexNotFound),
            };
            if in_group && entry.flags.contains(ObjectFlags::STORE) {
                storable_params.insert(key, entry.value.clone());
            }
        }
        match &mut self.storage {
            Some(s) => {
                trace!("Storing {} parameters of group {}", storable_params.len(), group);
                s.save(&storable_params)
            }
            None => Err(CanopenError::Storage("no storage backend configured")),
        }
    }

    /// Tells the storage backend to set a flag to restore defaults on the
    /// next boot. The actual data clearing happens at startup.
    fn restore_defaults(&mut self, group: u8) -> Result<(), CanopenError> {
        if !(1..=3).contains(&group) {
            return Err(CanopenError::SubIndexNotFound);
        }
        match &mut self.storage {
            Some(s) => s.request_restore(),
            None => Err(CanopenError::Storage("no storage backend configured")),
        }
    }
}

fn copy_window(src: &[u8], out: &mut [u8], offset: usize) -> usize {
    if offset >= src.len() {
        return 0;
    }
    let len = out.len().min(src.len() - offset);
    out[..len].copy_from_slice(&src[offset..offset + len]);
    len
}

fn numeric_u32(value: &ObjectValue) -> Result<u32, CanopenError> {
    match value {
        ObjectValue::Unsigned32(v) => Ok(*v),
        _ => Err(CanopenError::SizeMismatch),
    }
}

fn is_tpdo_index(comm_index: u16) -> bool {
    (0x1800..=0x19FF).contains(&comm_index)
}

fn is_tpdo_mapping_index(map_index: u16) -> bool {
    (0x1A00..=0x1BFF).contains(&map_index)
}

fn mapping_to_comm_index(map_index: u16) -> u16 {
    // 0x1600 -> 0x1400, 0x1A00 -> 0x1800
    map_index - 0x200
}

fn pdo_reset_effect(comm_index: u16) -> WriteEffect {
    if is_tpdo_index(comm_index) {
        WriteEffect::TpdoReset(comm_index - 0x1800)
    } else {
        WriteEffect::RpdoReset(comm_index - 0x1400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::COBID_NO_RTR;
    use alloc::string::ToString;
    use alloc::vec;

    pub(crate) struct MockNvm {
        pub saved: BTreeMap<ObjectKey, ObjectValue>,
        pub restore_requested: bool,
        pub save_called: bool,
        pub clear_called: bool,
    }

    impl MockNvm {
        pub fn new() -> Self {
            Self {
                saved: BTreeMap::new(),
                restore_requested: false,
                save_called: false,
                clear_called: false,
            }
        }
    }

    impl NvmStorage for MockNvm {
        fn load(&mut self) -> Result<BTreeMap<ObjectKey, ObjectValue>, CanopenError> {
            Ok(self.saved.clone())
        }
        fn save(&mut self, params: &BTreeMap<ObjectKey, ObjectValue>) -> Result<(), CanopenError> {
            self.save_called = true;
            self.saved = params.clone();
            Ok(())
        }
        fn clear(&mut self) -> Result<(), CanopenError> {
            self.clear_called = true;
            self.saved.clear();
            Ok(())
        }
        fn restore_requested(&self) -> bool {
            self.restore_requested
        }
        fn request_restore(&mut self) -> Result<(), CanopenError> {
            self.restore_requested = true;
            Ok(())
        }
        fn clear_restore_flag(&mut self) -> Result<(), CanopenError> {
            self.restore_requested = false;
            Ok(())
        }
    }

    fn test_od() -> ObjectDictionary<'static> {
        let mut od = ObjectDictionary::new(NodeId(1), None);
        od.insert(
            ObjectKey::new(0x2000, 0),
            ObjectEntry::new(ObjectValue::Unsigned32(0), "Test_U32", ObjectFlags::RW),
        );
        od.insert(
            ObjectKey::new(0x2001, 0),
            ObjectEntry::new(
                ObjectValue::Integer16(-4),
                "Test_I16",
                ObjectFlags::RW | ObjectFlags::PDO_MAPPABLE,
            ),
        );
        od.insert(
            ObjectKey::new(0x1008, 0),
            ObjectEntry::new(
                ObjectValue::VisibleString("Device".to_string()),
                "ManufacturerDeviceName",
                ObjectFlags::READ,
            ),
        );
        od
    }

    #[test]
    fn test_keys_stay_sorted_and_unique() {
        let mut od = test_od();
        od.insert(
            ObjectKey::new(0x1000, 0),
            ObjectEntry::new(ObjectValue::Unsigned32(0), "DeviceType", ObjectFlags::READ),
        );
        let keys: Vec<ObjectKey> = od.entries.keys().copied().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_round_trip_all_widths() {
        let mut od = ObjectDictionary::new(NodeId(1), None);
        let cases = [
            ObjectValue::Unsigned8(0x12),
            ObjectValue::Unsigned16(0x1234),
            ObjectValue::Unsigned32(0x1234_5678),
            ObjectValue::Integer8(-3),
            ObjectValue::Integer16(-300),
            ObjectValue::Integer32(-70_000),
        ];
        for (i, value) in cases.iter().enumerate() {
            let key = ObjectKey::new(0x2100 + i as u16, 0);
            od.insert(key, ObjectEntry::new(value.clone(), "T", ObjectFlags::RW));
            let bytes = value.serialize();
            od.write_bytes(key, &bytes).unwrap();
            assert_eq!(od.read_bytes(key).unwrap(), bytes);
        }
    }

    #[test]
    fn test_write_read_only_fails_and_keeps_value() {
        let mut od = test_od();
        od.insert(
            ObjectKey::new(0x1000, 0),
            ObjectEntry::new(ObjectValue::Unsigned32(0x191), "DeviceType", ObjectFlags::READ),
        );
        let result = od.write_u32(ObjectKey::new(0x1000, 0), 0xDEAD);
        assert_eq!(result, Err(CanopenError::ReadOnly));
        assert_eq!(od.read_u32(ObjectKey::new(0x1000, 0)).unwrap(), 0x191);
    }

    #[test]
    fn test_missing_entries() {
        let od = test_od();
        assert_eq!(
            od.read_u8(ObjectKey::new(0x5000, 0)),
            Err(CanopenError::ObjectNotFound)
        );
        assert_eq!(
            od.read_u8(ObjectKey::new(0x2000, 9)),
            Err(CanopenError::SubIndexNotFound)
        );
    }

    #[test]
    fn test_width_mismatch() {
        let mut od = test_od();
        assert_eq!(
            od.write_u16(ObjectKey::new(0x2000, 0), 7),
            Err(CanopenError::SizeMismatch)
        );
        assert_eq!(
            od.read_u8(ObjectKey::new(0x2000, 0)),
            Err(CanopenError::SizeMismatch)
        );
    }

    #[test]
    fn test_node_id_relative_read_and_write() {
        let mut od = ObjectDictionary::new(NodeId(5), None);
        od.insert(
            ObjectKey::new(0x1200, 1),
            ObjectEntry::new(
                ObjectValue::Unsigned32(0x600),
                "SdoServerRequestCobId",
                ObjectFlags::READ | ObjectFlags::NODE_ID_REL,
            ),
        );
        assert_eq!(od.read_u32(ObjectKey::new(0x1200, 1)).unwrap(), 0x605);
        assert_eq!(
            od.read_bytes(ObjectKey::new(0x1200, 1)).unwrap(),
            0x605u32.to_le_bytes().to_vec()
        );
    }

    #[test]
    fn test_async_trigger_reports_change_once() {
        let mut od = ObjectDictionary::new(NodeId(1), None);
        let key = ObjectKey::new(0x2100, 1);
        od.insert(
            key,
            ObjectEntry::new(
                ObjectValue::Unsigned32(0),
                "ProcessValue",
                ObjectFlags::RW | ObjectFlags::PDO_MAPPABLE,
            )
            .with_kind(ObjectKind::AsyncTrigger),
        );
        assert_eq!(od.write_u32(key, 42).unwrap(), WriteEffect::TpdoSignal(key));
        // Redundant write: no trigger.
        assert_eq!(od.write_u32(key, 42).unwrap(), WriteEffect::None);
    }

    fn pdo_od() -> ObjectDictionary<'static> {
        let mut od = ObjectDictionary::new(NodeId(1), None);
        od.insert(
            ObjectKey::new(0x1800, 1),
            ObjectEntry::new(
                ObjectValue::Unsigned32(COBID_OFF | COBID_NO_RTR | 0x180),
                "Tpdo1CobId",
                ObjectFlags::RW | ObjectFlags::NODE_ID_REL,
            )
            .with_kind(ObjectKind::PdoCobId),
        );
        od.insert(
            ObjectKey::new(0x1800, 2),
            ObjectEntry::new(ObjectValue::Unsigned8(254), "Tpdo1Type", ObjectFlags::RW)
                .with_kind(ObjectKind::PdoType),
        );
        od.insert(
            ObjectKey::new(0x1A00, 0),
            ObjectEntry::new(ObjectValue::Unsigned8(0), "Tpdo1MapCount", ObjectFlags::RW)
                .with_kind(ObjectKind::PdoMapCount),
        );
        for sub in 1..=2u8 {
            od.insert(
                ObjectKey::new(0x1A00, sub),
                ObjectEntry::new(ObjectValue::Unsigned32(0), "Tpdo1Map", ObjectFlags::RW)
                    .with_kind(ObjectKind::PdoMapEntry),
            );
        }
        od.insert(
            ObjectKey::new(0x2001, 0),
            ObjectEntry::new(
                ObjectValue::Integer16(0),
                "Mappable",
                ObjectFlags::RW | ObjectFlags::PDO_MAPPABLE,
            ),
        );
        od
    }

    #[test]
    fn test_pdo_cob_id_write_rules() {
        let mut od = pdo_od();
        let cob_key = ObjectKey::new(0x1800, 1);
        // Enable with valid identifier while disabled: ok.
        assert_eq!(
            od.write_u32(cob_key, COBID_NO_RTR | 0x181).unwrap(),
            WriteEffect::TpdoReset(0)
        );
        // Changing the identifier while enabled is rejected.
        assert_eq!(
            od.write_u32(cob_key, COBID_NO_RTR | 0x182),
            Err(CanopenError::Incompatible)
        );
        // Disabling is always allowed.
        assert!(od.write_u32(cob_key, COBID_OFF | COBID_NO_RTR | 0x181).is_ok());
        // Extended identifiers are rejected on enable.
        assert_eq!(
            od.write_u32(cob_key, COBID_EXTENDED | COBID_NO_RTR | 0x181),
            Err(CanopenError::PdoConfig)
        );
        // A TPDO that would answer RTRs is rejected.
        assert_eq!(od.write_u32(cob_key, 0x181), Err(CanopenError::PdoConfig));
    }

    #[test]
    fn test_pdo_type_locked_while_enabled() {
        let mut od = pdo_od();
        od.write_u32(ObjectKey::new(0x1800, 1), COBID_NO_RTR | 0x181)
            .unwrap();
        assert_eq!(
            od.write_u8(ObjectKey::new(0x1800, 2), 1),
            Err(CanopenError::Incompatible)
        );
        od.write_u32(ObjectKey::new(0x1800, 1), COBID_OFF | COBID_NO_RTR | 0x181)
            .unwrap();
        assert!(od.write_u8(ObjectKey::new(0x1800, 2), 1).is_ok());
        assert_eq!(
            od.write_u8(ObjectKey::new(0x1800, 2), 245),
            Err(CanopenError::Range)
        );
    }

    #[test]
    fn test_mapping_validation() {
        let mut od = pdo_od();
        let map1 = ObjectKey::new(0x1A00, 1);
        // 0x2001:00, 16 bits: valid.
        assert!(od.write_u32(map1, 0x2001_0010).unwrap() == WriteEffect::None);
        // Non-existing target.
        assert_eq!(
            od.write_u32(map1, 0x5000_0010),
            Err(CanopenError::ObjectNotFound)
        );
        // Dummy objects are rejected in a TPDO mapping.
        assert_eq!(od.write_u32(map1, 0x0005_0008), Err(CanopenError::CannotMap));
        // Length larger than the target object.
        assert_eq!(od.write_u32(map1, 0x2001_0020), Err(CanopenError::CannotMap));
    }

    #[test]
    fn test_map_count_rejects_overrun() {
        let mut od = pdo_od();
        // Two entries of 8 bytes each would exceed the frame.
        od.insert(
            ObjectKey::new(0x2002, 0),
            ObjectEntry::new(
                ObjectValue::Domain(vec![0; 8]),
                "Blob",
                ObjectFlags::RW | ObjectFlags::PDO_MAPPABLE,
            ),
        );
        od.write_u32(ObjectKey::new(0x1A00, 1), 0x2002_0040).unwrap();
        od.write_u32(ObjectKey::new(0x1A00, 2), 0x2002_0040).unwrap();
        assert!(od.write_u8(ObjectKey::new(0x1A00, 0), 1).is_ok());
        assert_eq!(
            od.write_u8(ObjectKey::new(0x1A00, 0), 2),
            Err(CanopenError::MapLength)
        );
    }

    #[test]
    fn test_heartbeat_and_history_effects() {
        let mut od = ObjectDictionary::new(NodeId(1), None);
        od.insert(
            ObjectKey::new(0x1017, 0),
            ObjectEntry::new(ObjectValue::Unsigned16(0), "ProducerHeartbeatTime", ObjectFlags::RW)
                .with_kind(ObjectKind::HeartbeatTime),
        );
        od.insert(
            ObjectKey::new(0x1003, 0),
            ObjectEntry::new(ObjectValue::Unsigned8(3), "ErrorCount", ObjectFlags::RW)
                .with_kind(ObjectKind::EmcyHistory),
        );
        assert_eq!(
            od.write_u16(ObjectKey::new(0x1017, 0), 500).unwrap(),
            WriteEffect::HeartbeatRestart
        );
        assert_eq!(
            od.write_u8(ObjectKey::new(0x1003, 0), 0).unwrap(),
            WriteEffect::EmcyHistClear
        );
        assert_eq!(
            od.write_u8(ObjectKey::new(0x1003, 0), 1),
            Err(CanopenError::Range)
        );
    }

    #[test]
    fn test_store_parameters_signature_and_group() {
        let mut nvm = MockNvm::new();
        {
            let mut od = ObjectDictionary::new(NodeId(1), Some(&mut nvm));
            od.insert(
                ObjectKey::new(0x1010, 1),
                ObjectEntry::new(ObjectValue::Unsigned32(1), "StoreAll", ObjectFlags::RW)
                    .with_kind(ObjectKind::ParameterStore),
            );
            od.insert(
                ObjectKey::new(0x2000, 0),
                ObjectEntry::new(
                    ObjectValue::Unsigned32(77),
                    "AppParam",
                    ObjectFlags::RW | ObjectFlags::STORE,
                ),
            );
            assert_eq!(
                od.write_u32(ObjectKey::new(0x1010, 1), 0x1234),
                Err(CanopenError::Storage("invalid store signature"))
            );
            od.write_u32(ObjectKey::new(0x1010, 1), STORE_SIGNATURE).unwrap();
            // The capability read-back is untouched by the command write.
            assert_eq!(od.read_u32(ObjectKey::new(0x1010, 1)).unwrap(), 1);
        }
        assert!(nvm.save_called);
        assert_eq!(
            nvm.saved.get(&ObjectKey::new(0x2000, 0)),
            Some(&ObjectValue::Unsigned32(77))
        );
    }

    #[test]
    fn test_restore_flags_for_next_boot_and_init_clears() {
        let mut nvm = MockNvm::new();
        nvm.saved
            .insert(ObjectKey::new(0x2000, 0), ObjectValue::Unsigned32(99));
        nvm.restore_requested = true;
        {
            let mut od = ObjectDictionary::new(NodeId(1), Some(&mut nvm));
            od.insert(
                ObjectKey::new(0x2000, 0),
                ObjectEntry::new(
                    ObjectValue::Unsigned32(0),
                    "AppParam",
                    ObjectFlags::RW | ObjectFlags::STORE,
                ),
            );
            od.init().unwrap();
            // Back to firmware default, stored value dropped.
            assert_eq!(od.read_u32(ObjectKey::new(0x2000, 0)).unwrap(), 0);
        }
        assert!(nvm.clear_called);
        assert!(!nvm.restore_requested);
    }

    #[test]
    fn test_init_overlays_stored_parameters() {
        let mut nvm = MockNvm::new();
        nvm.saved
            .insert(ObjectKey::new(0x2000, 0), ObjectValue::Unsigned32(99));
        let mut od = ObjectDictionary::new(NodeId(1), Some(&mut nvm));
        od.insert(
            ObjectKey::new(0x2000, 0),
            ObjectEntry::new(
                ObjectValue::Unsigned32(0),
                "AppParam",
                ObjectFlags::RW | ObjectFlags::STORE,
            ),
        );
        od.init().unwrap();
        assert_eq!(od.read_u32(ObjectKey::new(0x2000, 0)).unwrap(), 99);
    }

    #[test]
    fn test_read_segment_streams_domains() {
        let mut od = ObjectDictionary::new(NodeId(1), None);
        let blob: Vec<u8> = (0u8..20).collect();
        od.insert(
            ObjectKey::new(0x2003, 0),
            ObjectEntry::new(ObjectValue::Domain(blob), "Blob", ObjectFlags::RW),
        );
        let key = ObjectKey::new(0x2003, 0);
        let mut buf = [0u8; 7];
        assert_eq!(od.read_segment(key, &mut buf, 0).unwrap(), 7);
        assert_eq!(buf, [0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(od.read_segment(key, &mut buf, 14).unwrap(), 6);
        assert_eq!(&buf[..6], [14, 15, 16, 17, 18, 19]);
        assert_eq!(od.read_segment(key, &mut buf, 20).unwrap(), 0);
    }
}
