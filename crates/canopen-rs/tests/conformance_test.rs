// crates/canopen-rs/tests/conformance_test.rs
//
// Wire-level scenarios for a node with node-ID 1 on a simulated bus,
// plus cross-checks of the documented invariants.

mod simulator;

use simulator::{SimulatedDriver, VirtualCanBus};

use canopen_rs::emcy::{EmcyEntry, EmcyTable, error_register};
use canopen_rs::frame::CanFrame;
use canopen_rs::node::{CanopenNode, NodeConfig};
use canopen_rs::od::{ObjectDictionary, ObjectEntry, ObjectFlags, ObjectKey, ObjectKind, ObjectValue};
use canopen_rs::types::{COBID_NO_RTR, COBID_OFF, NodeId};
use canopen_rs::NmtState;

use std::cell::RefCell;
use std::rc::Rc;

fn rw_mappable() -> ObjectFlags {
    ObjectFlags::RW | ObjectFlags::PDO_MAPPABLE
}

/// A node-ID-1 slave with a small application dictionary:
/// 0x2000:00 u32, 0x2100:01 u32 (write-triggered), 0x2100:02/03 u8,
/// 0x2110:01 a 10-byte domain.
fn make_node(bus: &VirtualCanBus) -> CanopenNode<'static, SimulatedDriver> {
    let mut od = ObjectDictionary::new(NodeId(1), None);
    od.insert(
        ObjectKey::new(0x2000, 0),
        ObjectEntry::new(ObjectValue::Unsigned32(0), "AppVar", ObjectFlags::RW),
    );
    od.insert(
        ObjectKey::new(0x2100, 1),
        ObjectEntry::new(ObjectValue::Unsigned32(0), "ProcessValue", rw_mappable())
            .with_kind(ObjectKind::AsyncTrigger),
    );
    od.insert(
        ObjectKey::new(0x2100, 2),
        ObjectEntry::new(ObjectValue::Unsigned8(0xAA), "StatusA", rw_mappable()),
    );
    od.insert(
        ObjectKey::new(0x2100, 3),
        ObjectEntry::new(ObjectValue::Unsigned8(0xBB), "StatusB", rw_mappable()),
    );
    od.insert(
        ObjectKey::new(0x2110, 1),
        ObjectEntry::new(
            ObjectValue::Domain((0..10).map(|i| 0xB0 + i).collect()),
            "Blob10",
            ObjectFlags::RW,
        ),
    );
    let table = EmcyTable(vec![EmcyEntry {
        code: 0x2310,
        reg_bit: error_register::CURRENT,
    }]);
    CanopenNode::new(NodeConfig::new(NodeId(1)), od, bus.driver(), table).unwrap()
}

fn pump(node: &mut CanopenNode<'static, SimulatedDriver>) {
    for _ in 0..32 {
        let _ = node.process();
    }
}

fn tick(node: &mut CanopenNode<'static, SimulatedDriver>, ms: u32) {
    for _ in 0..ms {
        node.timer_service();
        node.timer_process();
        pump(node);
    }
}

fn sdo_request(data: [u8; 8]) -> CanFrame {
    CanFrame::with_payload(0x601, &data)
}

fn nmt_start() -> CanFrame {
    CanFrame::with_payload(0x000, &[0x01, 0x01])
}

fn sync_frame() -> CanFrame {
    CanFrame::with_payload(0x080, &[])
}

/// Reconfigures TPDO1 through the write path: disable, apply mapping and
/// transmission type, re-enable.
fn configure_tpdo1(
    node: &mut CanopenNode<'static, SimulatedDriver>,
    ttype: u8,
    mappings: &[u32],
) {
    node.write(
        ObjectKey::new(0x1800, 1),
        ObjectValue::Unsigned32(COBID_OFF | COBID_NO_RTR | 0x181),
    )
    .unwrap();
    node.write(ObjectKey::new(0x1800, 2), ObjectValue::Unsigned8(ttype))
        .unwrap();
    for (i, &raw) in mappings.iter().enumerate() {
        node.write(
            ObjectKey::new(0x1A00, (i + 1) as u8),
            ObjectValue::Unsigned32(raw),
        )
        .unwrap();
    }
    node.write(
        ObjectKey::new(0x1A00, 0),
        ObjectValue::Unsigned8(mappings.len() as u8),
    )
    .unwrap();
    node.write(
        ObjectKey::new(0x1800, 1),
        ObjectValue::Unsigned32(COBID_NO_RTR | 0x181),
    )
    .unwrap();
}

#[test]
fn s1_expedited_download_of_u32() {
    let bus = VirtualCanBus::new();
    let mut node = make_node(&bus);
    node.start().unwrap();
    bus.clear_history();

    bus.inject(sdo_request([0x23, 0x00, 0x20, 0x00, 0xDE, 0xAD, 0xBE, 0xEF]));
    pump(&mut node);

    let responses = bus.frames_with_id(0x581);
    assert_eq!(responses.len(), 1);
    assert_eq!(
        responses[0].payload(),
        [0x60, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00]
    );
    assert_eq!(
        node.od().read_u32(ObjectKey::new(0x2000, 0)).unwrap(),
        0xEFBE_ADDE
    );
}

#[test]
fn s2_segmented_upload_of_ten_bytes() {
    let bus = VirtualCanBus::new();
    let mut node = make_node(&bus);
    node.start().unwrap();
    bus.clear_history();

    // Initiate upload of 0x2110:01.
    bus.inject(sdo_request([0x40, 0x10, 0x21, 0x01, 0, 0, 0, 0]));
    pump(&mut node);
    let responses = bus.frames_with_id(0x581);
    assert_eq!(
        responses[0].payload(),
        [0x41, 0x10, 0x21, 0x01, 0x0A, 0x00, 0x00, 0x00]
    );

    // First segment request (t=0): seven data bytes.
    bus.clear_history();
    bus.inject(sdo_request([0x60, 0, 0, 0, 0, 0, 0, 0]));
    pump(&mut node);
    let seg = bus.frames_with_id(0x581)[0];
    assert_eq!(seg.get_u8(0), 0x00);
    assert_eq!(
        &seg.data[1..8],
        [0xB0, 0xB1, 0xB2, 0xB3, 0xB4, 0xB5, 0xB6]
    );

    // Second segment request (t=1): three data bytes, n=4, c=1.
    bus.clear_history();
    bus.inject(sdo_request([0x70, 0, 0, 0, 0, 0, 0, 0]));
    pump(&mut node);
    let seg = bus.frames_with_id(0x581)[0];
    assert_eq!(seg.get_u8(0), 0x10 | (4 << 1) | 1);
    assert_eq!(&seg.data[1..4], [0xB7, 0xB8, 0xB9]);
}

#[test]
fn s3_asynchronous_tpdo_triggered_by_object_write() {
    let bus = VirtualCanBus::new();
    let mut node = make_node(&bus);
    node.start().unwrap();
    configure_tpdo1(&mut node, 254, &[0x2100_0120, 0x2100_0208, 0x2100_0308]);

    bus.inject(nmt_start());
    pump(&mut node);
    assert_eq!(node.nmt_state(), NmtState::Operational);
    bus.clear_history();

    // SDO download 0x01020304 to the write-triggered object.
    bus.inject(sdo_request([0x23, 0x00, 0x21, 0x01, 0x04, 0x03, 0x02, 0x01]));
    pump(&mut node);

    let pdos = bus.frames_with_id(0x181);
    assert_eq!(pdos.len(), 1);
    assert_eq!(pdos[0].dlc, 6);
    assert_eq!(pdos[0].payload(), [0x04, 0x03, 0x02, 0x01, 0xAA, 0xBB]);
}

#[test]
fn s4_synchronous_tpdo_every_third_sync() {
    let bus = VirtualCanBus::new();
    let mut node = make_node(&bus);
    node.start().unwrap();
    configure_tpdo1(&mut node, 3, &[0x2100_0208]);

    bus.inject(nmt_start());
    pump(&mut node);
    bus.clear_history();

    bus.inject(sync_frame());
    pump(&mut node);
    bus.inject(sync_frame());
    pump(&mut node);
    assert!(bus.frames_with_id(0x181).is_empty());

    bus.inject(sync_frame());
    pump(&mut node);
    assert_eq!(bus.frames_with_id(0x181).len(), 1);
}

#[test]
fn s5_heartbeat_producer() {
    let bus = VirtualCanBus::new();
    let mut node = make_node(&bus);
    node.start().unwrap();
    bus.clear_history();

    // Write 500 ms to 0x1017:00 via SDO.
    bus.inject(sdo_request([0x2B, 0x17, 0x10, 0x00, 0xF4, 0x01, 0x00, 0x00]));
    pump(&mut node);
    assert_eq!(bus.frames_with_id(0x581).len(), 1);

    bus.clear_history();
    tick(&mut node, 500);
    let beats = bus.frames_with_id(0x701);
    assert_eq!(beats.len(), 1);
    assert_eq!(beats[0].payload(), [0x7F]);

    // In operational the state byte changes to 0x05.
    bus.inject(nmt_start());
    pump(&mut node);
    bus.clear_history();
    tick(&mut node, 500);
    let beats = bus.frames_with_id(0x701);
    assert_eq!(beats.len(), 1);
    assert_eq!(beats[0].payload(), [0x05]);
}

#[test]
fn s6_nmt_reset_communication() {
    let bus = VirtualCanBus::new();
    let mut node = make_node(&bus);
    node.start().unwrap();
    bus.inject(sdo_request([0x2B, 0x17, 0x10, 0x00, 0x64, 0x00, 0x00, 0x00]));
    bus.inject(nmt_start());
    pump(&mut node);
    bus.clear_history();

    bus.inject(CanFrame::with_payload(0x000, &[0x82, 0x01]));
    pump(&mut node);

    let bootups = bus.frames_with_id(0x701);
    assert_eq!(bootups.len(), 1);
    assert_eq!(bootups[0].payload(), [0x00]);
    // No EMCY is emitted.
    assert!(bus.frames_with_id(0x081).is_empty());
    assert_eq!(node.nmt_state(), NmtState::PreOperational);

    // The heartbeat producer was re-armed from 0x1017.
    bus.clear_history();
    tick(&mut node, 100);
    let beats = bus.frames_with_id(0x701);
    assert_eq!(beats.len(), 1);
    assert_eq!(beats[0].payload(), [0x7F]);
}

#[test]
fn sync_in_preoperational_never_transmits_tpdo() {
    let bus = VirtualCanBus::new();
    let mut node = make_node(&bus);
    node.start().unwrap();
    configure_tpdo1(&mut node, 1, &[0x2100_0208]);
    bus.clear_history();

    for _ in 0..5 {
        bus.inject(sync_frame());
        pump(&mut node);
    }
    assert!(bus.frames_with_id(0x181).is_empty());
}

#[test]
fn range_violation_leaves_object_unchanged() {
    let bus = VirtualCanBus::new();
    let mut node = make_node(&bus);
    node.start().unwrap();
    bus.clear_history();

    // Transmission type 245 is reserved: the download must abort with
    // 0x06090030 and the stored value must stay at its default.
    let before = node.od().read_u8(ObjectKey::new(0x1800, 2)).unwrap();
    bus.inject(sdo_request([0x2F, 0x00, 0x18, 0x02, 245, 0, 0, 0]));
    pump(&mut node);

    let responses = bus.frames_with_id(0x581);
    assert_eq!(responses[0].get_u8(0), 0x80);
    assert_eq!(responses[0].get_u32(4), 0x0609_0030);
    assert_eq!(node.od().read_u8(ObjectKey::new(0x1800, 2)).unwrap(), before);
}

#[test]
fn emcy_set_and_clear_on_the_wire() {
    let bus = VirtualCanBus::new();
    let mut node = make_node(&bus);
    node.start().unwrap();
    bus.clear_history();

    node.emcy_set(0, Some([1, 2, 3, 4, 5])).unwrap();
    node.emcy_clr(0).unwrap();

    let frames = bus.frames_with_id(0x081);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].get_u16(0), 0x2310);
    assert_eq!(frames[0].get_u8(2), 0x03);
    assert_eq!(frames[1].get_u16(0), 0x0000);
    assert_eq!(frames[1].get_u8(2), 0x00);
    // The history recorded the error.
    assert_eq!(node.od().read_u8(ObjectKey::new(0x1003, 0)).unwrap(), 1);
}

#[test]
fn block_download_end_to_end() {
    let bus = VirtualCanBus::new();
    let mut node = make_node(&bus);
    node.start().unwrap();
    bus.clear_history();

    // Initiate a block download of 10 bytes to 0x2110:01.
    bus.inject(sdo_request([0xC2, 0x10, 0x21, 0x01, 10, 0, 0, 0]));
    pump(&mut node);
    let init = bus.frames_with_id(0x581)[0];
    assert_eq!(init.get_u8(0), 0xA0);

    bus.clear_history();
    bus.inject(sdo_request([0x01, b'k', b'l', b'm', b'n', b'o', b'p', b'q']));
    bus.inject(sdo_request([0x82, b'r', b's', b't', 0, 0, 0, 0]));
    pump(&mut node);
    let ack = bus.frames_with_id(0x581)[0];
    assert_eq!(ack.get_u8(0), 0xA2);
    assert_eq!(ack.get_u8(1), 2);

    bus.clear_history();
    bus.inject(sdo_request([0xC1 | (4 << 2), 0, 0, 0, 0, 0, 0, 0]));
    pump(&mut node);
    assert_eq!(bus.frames_with_id(0x581)[0].get_u8(0), 0xA1);
    assert_eq!(
        node.od().read_bytes(ObjectKey::new(0x2110, 1)).unwrap(),
        b"klmnopqrst".to_vec()
    );
}

/// Two nodes on one bus: node 2 runs an SDO client against node 1's
/// default server.
#[test]
fn sdo_client_against_live_server() {
    let bus = VirtualCanBus::new();
    let mut server_node = make_node(&bus);

    let mut od = ObjectDictionary::new(NodeId(2), None);
    // Point client channel 0 at node 1's default SDO server.
    od.insert(
        ObjectKey::new(0x1280, 1),
        ObjectEntry::new(ObjectValue::Unsigned32(0x601), "ClientTx", ObjectFlags::RW),
    );
    od.insert(
        ObjectKey::new(0x1280, 2),
        ObjectEntry::new(ObjectValue::Unsigned32(0x581), "ClientRx", ObjectFlags::RW),
    );
    let mut config = NodeConfig::new(NodeId(2));
    config.sdo_client_count = 1;
    let mut client_node =
        CanopenNode::new(config, od, bus.driver(), EmcyTable::default()).unwrap();

    server_node.start().unwrap();
    client_node.start().unwrap();
    pump(&mut server_node);
    pump(&mut client_node);

    // Download four bytes into the server's 0x2000:00.
    let outcome = Rc::new(RefCell::new(None));
    let seen = outcome.clone();
    client_node
        .sdo_download(
            0,
            ObjectKey::new(0x2000, 0),
            vec![0xDE, 0xAD, 0xBE, 0xEF],
            500,
            Box::new(move |result| {
                *seen.borrow_mut() = Some(result);
            }),
        )
        .unwrap();
    for _ in 0..8 {
        pump(&mut server_node);
        pump(&mut client_node);
    }
    let result = outcome.borrow_mut().take().unwrap();
    assert_eq!(result.abort_code, 0);
    assert_eq!(
        server_node.od().read_u32(ObjectKey::new(0x2000, 0)).unwrap(),
        0xEFBE_ADDE
    );

    // Segmented upload of the 10-byte domain object.
    let outcome = Rc::new(RefCell::new(None));
    let seen = outcome.clone();
    client_node
        .sdo_upload(
            0,
            ObjectKey::new(0x2110, 1),
            500,
            Box::new(move |result| {
                *seen.borrow_mut() = Some(result);
            }),
        )
        .unwrap();
    for _ in 0..8 {
        pump(&mut server_node);
        pump(&mut client_node);
    }
    let result = outcome.borrow_mut().take().unwrap();
    assert_eq!(result.abort_code, 0);
    assert_eq!(result.data, (0..10).map(|i| 0xB0 + i).collect::<Vec<u8>>());
}
