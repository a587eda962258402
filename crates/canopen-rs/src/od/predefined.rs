// crates/canopen-rs/src/od/predefined.rs

use super::{ObjectDictionary, ObjectEntry, ObjectFlags, ObjectKey, ObjectKind, ObjectValue};
use crate::types::{
    COB_RPDO_BASE, COB_SDO_REQUEST_BASE, COB_SDO_RESPONSE_BASE, COB_SYNC, COB_TPDO_BASE,
    COBID_NO_RTR, COBID_OFF,
};

/// Inserts an entry only when the application has not provided its own.
fn insert_default(od: &mut ObjectDictionary, key: ObjectKey, entry: ObjectEntry) {
    if od.find(key).is_err() {
        od.insert(key, entry);
    }
}

/// Populates the mandatory communication-profile objects and the SDO
/// channel records. Application entries inserted beforehand win.
pub fn populate_protocol_objects(
    od: &mut ObjectDictionary,
    sdo_servers: u8,
    sdo_clients: u8,
    emcy_history: u8,
) {
    insert_default(
        od,
        ObjectKey::new(0x1000, 0),
        ObjectEntry::new(ObjectValue::Unsigned32(0), "DeviceType", ObjectFlags::READ),
    );
    insert_default(
        od,
        ObjectKey::new(0x1001, 0),
        ObjectEntry::new(
            ObjectValue::Unsigned8(0),
            "ErrorRegister",
            ObjectFlags::READ | ObjectFlags::PDO_MAPPABLE,
        ),
    );
    if emcy_history > 0 {
        insert_default(
            od,
            ObjectKey::new(0x1003, 0),
            ObjectEntry::new(
                ObjectValue::Unsigned8(0),
                "PredefinedErrorFieldCount",
                ObjectFlags::RW,
            )
            .with_kind(ObjectKind::EmcyHistory),
        );
        for sub in 1..=emcy_history {
            insert_default(
                od,
                ObjectKey::new(0x1003, sub),
                ObjectEntry::new(
                    ObjectValue::Unsigned32(0),
                    "PredefinedErrorField",
                    ObjectFlags::READ,
                ),
            );
        }
    }
    insert_default(
        od,
        ObjectKey::new(0x1005, 0),
        ObjectEntry::new(
            ObjectValue::Unsigned32(COB_SYNC as u32),
            "CobIdSync",
            ObjectFlags::RW,
        )
        .with_kind(ObjectKind::SyncCobId),
    );
    insert_default(
        od,
        ObjectKey::new(0x1014, 0),
        ObjectEntry::new(
            ObjectValue::Unsigned32(0x80),
            "CobIdEmcy",
            ObjectFlags::RW | ObjectFlags::NODE_ID_REL,
        )
        .with_kind(ObjectKind::EmcyCobId),
    );
    insert_default(
        od,
        ObjectKey::new(0x1017, 0),
        ObjectEntry::new(
            ObjectValue::Unsigned16(0),
            "ProducerHeartbeatTime",
            ObjectFlags::RW,
        )
        .with_kind(ObjectKind::HeartbeatTime),
    );

    // Identity object: the application overrides the zeroed defaults.
    insert_default(
        od,
        ObjectKey::new(0x1018, 0),
        ObjectEntry::new(ObjectValue::Unsigned8(4), "IdentityCount", ObjectFlags::READ),
    );
    for (sub, name) in [
        (1u8, "VendorId"),
        (2, "ProductCode"),
        (3, "RevisionNumber"),
        (4, "SerialNumber"),
    ] {
        insert_default(
            od,
            ObjectKey::new(0x1018, sub),
            ObjectEntry::new(ObjectValue::Unsigned32(0), name, ObjectFlags::READ),
        );
    }

    // Parameter store / restore commands; reads report capability bit 0
    // ("saves on command").
    for (index, kind, name) in [
        (0x1010u16, ObjectKind::ParameterStore, "StoreParameters"),
        (0x1011, ObjectKind::ParameterRestore, "RestoreDefaultParameters"),
    ] {
        insert_default(
            od,
            ObjectKey::new(index, 0),
            ObjectEntry::new(ObjectValue::Unsigned8(3), name, ObjectFlags::READ),
        );
        for sub in 1..=3u8 {
            insert_default(
                od,
                ObjectKey::new(index, sub),
                ObjectEntry::new(ObjectValue::Unsigned32(1), name, ObjectFlags::RW).with_kind(kind),
            );
        }
    }

    // SDO server channels. The first channel uses the pre-defined
    // connection set and starts enabled; additional channels start
    // disabled until the application assigns identifiers.
    for k in 0..sdo_servers {
        let index = 0x1200 + k as u16;
        let off = if k == 0 { 0 } else { COBID_OFF };
        insert_default(
            od,
            ObjectKey::new(index, 0),
            ObjectEntry::new(ObjectValue::Unsigned8(2), "SdoServerCount", ObjectFlags::READ),
        );
        insert_default(
            od,
            ObjectKey::new(index, 1),
            ObjectEntry::new(
                ObjectValue::Unsigned32(off | COB_SDO_REQUEST_BASE as u32),
                "SdoServerRequestCobId",
                ObjectFlags::RW | ObjectFlags::NODE_ID_REL,
            )
            .with_kind(ObjectKind::SdoServerCobId),
        );
        insert_default(
            od,
            ObjectKey::new(index, 2),
            ObjectEntry::new(
                ObjectValue::Unsigned32(off | COB_SDO_RESPONSE_BASE as u32),
                "SdoServerResponseCobId",
                ObjectFlags::RW | ObjectFlags::NODE_ID_REL,
            )
            .with_kind(ObjectKind::SdoServerCobId),
        );
    }

    // SDO client channels start unconfigured; the application points them
    // at a server by writing the identifiers and the server node-ID.
    for k in 0..sdo_clients {
        let index = 0x1280 + k as u16;
        insert_default(
            od,
            ObjectKey::new(index, 0),
            ObjectEntry::new(ObjectValue::Unsigned8(3), "SdoClientCount", ObjectFlags::READ),
        );
        insert_default(
            od,
            ObjectKey::new(index, 1),
            ObjectEntry::new(
                ObjectValue::Unsigned32(COBID_OFF | COB_SDO_REQUEST_BASE as u32),
                "SdoClientRequestCobId",
                ObjectFlags::RW,
            ),
        );
        insert_default(
            od,
            ObjectKey::new(index, 2),
            ObjectEntry::new(
                ObjectValue::Unsigned32(COBID_OFF | COB_SDO_RESPONSE_BASE as u32),
                "SdoClientResponseCobId",
                ObjectFlags::RW,
            ),
        );
        insert_default(
            od,
            ObjectKey::new(index, 3),
            ObjectEntry::new(ObjectValue::Unsigned8(0), "SdoClientServerNodeId", ObjectFlags::RW),
        );
    }
}

/// Populates default TPDO/RPDO communication and mapping records. The
/// first four of each use the pre-defined connection set identifiers;
/// further PDOs start disabled.
pub fn populate_pdo_defaults(od: &mut ObjectDictionary, tpdo_count: u16, rpdo_count: u16) {
    for n in 0..tpdo_count {
        let comm = 0x1800 + n;
        let map = 0x1A00 + n;
        let cob = match COB_TPDO_BASE.get(n as usize) {
            Some(&base) => COBID_NO_RTR | base as u32,
            None => COBID_OFF | COBID_NO_RTR,
        };
        insert_default(
            od,
            ObjectKey::new(comm, 0),
            ObjectEntry::new(ObjectValue::Unsigned8(5), "TpdoCommCount", ObjectFlags::READ),
        );
        insert_default(
            od,
            ObjectKey::new(comm, 1),
            ObjectEntry::new(
                ObjectValue::Unsigned32(cob),
                "TpdoCobId",
                ObjectFlags::RW | ObjectFlags::NODE_ID_REL,
            )
            .with_kind(ObjectKind::PdoCobId),
        );
        insert_default(
            od,
            ObjectKey::new(comm, 2),
            ObjectEntry::new(ObjectValue::Unsigned8(254), "TpdoTransmissionType", ObjectFlags::RW)
                .with_kind(ObjectKind::PdoType),
        );
        insert_default(
            od,
            ObjectKey::new(comm, 3),
            ObjectEntry::new(ObjectValue::Unsigned16(0), "TpdoInhibitTime", ObjectFlags::RW),
        );
        insert_default(
            od,
            ObjectKey::new(comm, 5),
            ObjectEntry::new(ObjectValue::Unsigned16(0), "TpdoEventTimer", ObjectFlags::RW)
                .with_kind(ObjectKind::PdoEvent),
        );
        populate_mapping_record(od, map, "TpdoMapping");
    }

    for n in 0..rpdo_count {
        let comm = 0x1400 + n;
        let map = 0x1600 + n;
        let cob = match COB_RPDO_BASE.get(n as usize) {
            Some(&base) => base as u32,
            None => COBID_OFF,
        };
        insert_default(
            od,
            ObjectKey::new(comm, 0),
            ObjectEntry::new(ObjectValue::Unsigned8(2), "RpdoCommCount", ObjectFlags::READ),
        );
        insert_default(
            od,
            ObjectKey::new(comm, 1),
            ObjectEntry::new(
                ObjectValue::Unsigned32(cob),
                "RpdoCobId",
                ObjectFlags::RW | ObjectFlags::NODE_ID_REL,
            )
            .with_kind(ObjectKind::PdoCobId),
        );
        insert_default(
            od,
            ObjectKey::new(comm, 2),
            ObjectEntry::new(ObjectValue::Unsigned8(254), "RpdoTransmissionType", ObjectFlags::RW)
                .with_kind(ObjectKind::PdoType),
        );
        populate_mapping_record(od, map, "RpdoMapping");
    }
}

fn populate_mapping_record(od: &mut ObjectDictionary, index: u16, name: &'static str) {
    insert_default(
        od,
        ObjectKey::new(index, 0),
        ObjectEntry::new(ObjectValue::Unsigned8(0), name, ObjectFlags::RW)
            .with_kind(ObjectKind::PdoMapCount),
    );
    for sub in 1..=super::PDO_MAP_MAX as u8 {
        insert_default(
            od,
            ObjectKey::new(index, sub),
            ObjectEntry::new(ObjectValue::Unsigned32(0), name, ObjectFlags::RW)
                .with_kind(ObjectKind::PdoMapEntry),
        );
    }
}
