// crates/canopen-rs/src/node.rs

use crate::emcy::{EmcyProducer, EmcyTable};
use crate::frame::CanFrame;
use crate::hal::{CanDriver, CanopenError};
use crate::nmt::{NmtCommand, NmtSlave, NmtState, ObjectClassMask};
use crate::od::{
    ObjectDictionary, ObjectKey, ObjectValue, WriteEffect, populate_pdo_defaults,
    populate_protocol_objects,
};
use crate::pdo::{RpdoEngine, TpdoEngine};
use crate::sdo::{SdoClient, SdoClientCallback, SdoServer};
use crate::sync::SyncHandler;
use crate::tmr::{TimerAction, TimerWheel};
use crate::types::{COB_LSS_REQUEST, COB_NMT, NodeId};
use alloc::vec::Vec;
use log::{debug, info, warn};

/// Handler for frames no protocol consumer claimed.
pub type UnmatchedFrameHandler = fn(&CanFrame);

/// Init-time configuration of a node. Every pool in the stack is sized
/// once from these values; nothing grows afterwards.
#[derive(Clone, Copy)]
pub struct NodeConfig {
    pub node_id: NodeId,
    /// CAN bit rate handed to the driver on start.
    pub baudrate: u32,
    /// Capacity of the timer wheel (simultaneous timed actions).
    pub timer_capacity: usize,
    /// SDO transfer buffer size in 7-byte segments.
    pub sdo_buffer_segments: usize,
    pub sdo_server_count: u8,
    pub sdo_client_count: u8,
    pub tpdo_count: u16,
    pub rpdo_count: u16,
    /// Per-transfer SDO timeout in milliseconds.
    pub sdo_timeout_ms: u32,
    /// Enables the SDO block transfer protocol. When disabled, block
    /// initiates are rejected with abort 0x05040001.
    pub block_transfer: bool,
    /// Depth of the pre-defined error field (0x1003); zero disables it.
    pub emcy_history: u8,
    /// Called with frames no consumer claimed; they are dropped after.
    pub unmatched_frame: Option<UnmatchedFrameHandler>,
}

impl NodeConfig {
    /// Defaults follow the CiA 301 pre-defined connection set: one SDO
    /// server, four PDOs each way.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            baudrate: 125_000,
            timer_capacity: 32,
            sdo_buffer_segments: 16,
            sdo_server_count: 1,
            sdo_client_count: 0,
            tpdo_count: 4,
            rpdo_count: 4,
            sdo_timeout_ms: 500,
            block_transfer: true,
            emcy_history: 4,
            unmatched_frame: None,
        }
    }
}

/// A complete CANopen slave node.
///
/// Owns the dictionary, the CAN driver, the timer wheel and every protocol
/// engine, and routes each received frame to the first consumer that
/// claims it. The application drives the node from exactly two contexts:
/// the main loop calls [`process`] and [`timer_process`], the millisecond
/// tick source calls [`timer_service`].
///
/// [`process`]: CanopenNode::process
/// [`timer_process`]: CanopenNode::timer_process
/// [`timer_service`]: CanopenNode::timer_service
pub struct CanopenNode<'a, D: CanDriver> {
    config: NodeConfig,
    od: ObjectDictionary<'a>,
    driver: D,
    tmr: TimerWheel,
    nmt: NmtSlave,
    sync: SyncHandler,
    emcy: EmcyProducer,
    sdo_servers: Vec<SdoServer>,
    sdo_clients: Vec<SdoClient>,
    tpdo: TpdoEngine,
    rpdo: RpdoEngine,
    last_error: Option<CanopenError>,
}

impl<'a, D: CanDriver> CanopenNode<'a, D> {
    /// Creates a node around an application-populated dictionary. The
    /// mandatory communication-profile objects and PDO records are filled
    /// in (application entries win), then stored parameters are loaded.
    pub fn new(
        config: NodeConfig,
        mut od: ObjectDictionary<'a>,
        driver: D,
        emcy_table: EmcyTable,
    ) -> Result<Self, CanopenError> {
        if od.node_id() != config.node_id {
            return Err(CanopenError::Argument);
        }
        populate_protocol_objects(
            &mut od,
            config.sdo_server_count,
            config.sdo_client_count,
            config.emcy_history,
        );
        populate_pdo_defaults(&mut od, config.tpdo_count, config.rpdo_count);
        od.init()?;

        let mut sdo_servers = Vec::with_capacity(config.sdo_server_count as usize);
        for k in 0..config.sdo_server_count {
            sdo_servers.push(SdoServer::new(
                k,
                config.sdo_buffer_segments,
                config.sdo_timeout_ms,
                config.block_transfer,
            ));
        }
        let mut sdo_clients = Vec::with_capacity(config.sdo_client_count as usize);
        for k in 0..config.sdo_client_count {
            sdo_clients.push(SdoClient::new(k));
        }

        info!("Creating CANopen node {}", config.node_id.0);
        Ok(Self {
            config,
            od,
            driver,
            tmr: TimerWheel::new(config.timer_capacity),
            nmt: NmtSlave::new(),
            sync: SyncHandler::new(),
            emcy: EmcyProducer::new(emcy_table, config.emcy_history),
            sdo_servers,
            sdo_clients,
            tpdo: TpdoEngine::new(config.tpdo_count),
            rpdo: RpdoEngine::new(config.rpdo_count),
            last_error: None,
        })
    }

    /// Brings the node on the bus: enables the driver, loads the
    /// communication configuration and emits the boot-up message. The node
    /// ends up in pre-operational.
    pub fn start(&mut self) -> Result<(), CanopenError> {
        self.driver.enable(self.config.baudrate)?;
        self.nmt.set_state(NmtState::Init);
        self.reset_communication()
    }

    /// Takes the node off the bus and releases every timer.
    pub fn stop(&mut self) -> Result<(), CanopenError> {
        self.nmt.stop_heartbeat(&mut self.tmr);
        self.tpdo.clear(&mut self.tmr);
        self.rpdo.clear();
        self.tmr.clear();
        self.nmt.set_state(NmtState::Invalid);
        self.driver.close()
    }

    pub fn nmt_state(&self) -> NmtState {
        self.nmt.state()
    }

    /// Read access to the dictionary.
    pub fn od(&self) -> &ObjectDictionary<'a> {
        &self.od
    }

    /// Mutable dictionary access for the dynamic build phase before
    /// [`start`]. After start, use [`write`] so side effects are applied.
    ///
    /// [`start`]: CanopenNode::start
    /// [`write`]: CanopenNode::write
    pub fn od_mut(&mut self) -> &mut ObjectDictionary<'a> {
        &mut self.od
    }

    /// Writes a dictionary value on behalf of the application, applying
    /// any resulting side effects (PDO resets, heartbeat rescheduling,
    /// TPDO triggers).
    pub fn write(&mut self, key: ObjectKey, value: ObjectValue) -> Result<(), CanopenError> {
        let effect = self.od.write(key, value)?;
        self.apply_effect(effect);
        Ok(())
    }

    /// Returns and clears the sticky error slot. Internal failures set it
    /// on first occurrence; every affected API also returns its own
    /// `Result`.
    pub fn take_error(&mut self) -> Option<CanopenError> {
        self.last_error.take()
    }

    // --- Application-facing protocol services ---

    /// Triggers every TPDO mapping the given object.
    pub fn tpdo_trigger_obj(&mut self, key: ObjectKey) {
        self.tpdo
            .trig_obj(key, &self.od, &mut self.driver, &self.nmt, &mut self.tmr);
    }

    /// Triggers one TPDO by number.
    pub fn tpdo_trigger(&mut self, num: u16) {
        self.tpdo
            .trig_pdo(num, &self.od, &mut self.driver, &self.nmt, &mut self.tmr);
    }

    /// Latches an application error and emits its emergency frame.
    pub fn emcy_set(&mut self, err_id: usize, usr_info: Option<[u8; 5]>) -> Result<(), CanopenError> {
        self.emcy
            .set(err_id, usr_info, &mut self.od, &mut self.driver, &self.nmt)
    }

    /// Clears an application error and emits the reset emergency frame.
    pub fn emcy_clr(&mut self, err_id: usize) -> Result<(), CanopenError> {
        self.emcy.clr(err_id, &mut self.od, &mut self.driver, &self.nmt)
    }

    pub fn emcy_get_status(&self, err_id: usize) -> bool {
        self.emcy.get_status(err_id)
    }

    /// Clears all latched errors; unless `silent`, one reset frame per
    /// active error is emitted.
    pub fn emcy_reset(&mut self, silent: bool) {
        self.emcy
            .reset(silent, &mut self.od, &mut self.driver, &self.nmt);
    }

    /// Starts an SDO client upload; the result arrives via `callback`.
    pub fn sdo_upload(
        &mut self,
        client: usize,
        key: ObjectKey,
        timeout_ms: u32,
        callback: SdoClientCallback,
    ) -> Result<(), CanopenError> {
        let frame = self
            .sdo_clients
            .get_mut(client)
            .ok_or(CanopenError::Argument)?
            .request_upload(&self.od, &mut self.tmr, key, timeout_ms, callback)?;
        self.driver.send(&frame)
    }

    /// Starts an SDO client download of `data`; the result arrives via
    /// `callback`.
    pub fn sdo_download(
        &mut self,
        client: usize,
        key: ObjectKey,
        data: Vec<u8>,
        timeout_ms: u32,
        callback: SdoClientCallback,
    ) -> Result<(), CanopenError> {
        let frame = self
            .sdo_clients
            .get_mut(client)
            .ok_or(CanopenError::Argument)?
            .request_download(&self.od, &mut self.tmr, key, data, timeout_ms, callback)?;
        self.driver.send(&frame)
    }

    // --- Main-loop and tick entry points ---

    /// Pulls up to one frame from the driver and routes it. Call from the
    /// main loop.
    pub fn process(&mut self) -> Result<(), CanopenError> {
        let frame = match self.driver.receive() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e) => {
                self.record(e);
                return Err(e);
            }
        };
        self.route(frame)
    }

    /// Advances the timer wheel by one millisecond. Call from the tick
    /// source only; all it does is bookkeeping, the callbacks run from
    /// [`timer_process`].
    ///
    /// [`timer_process`]: CanopenNode::timer_process
    pub fn timer_service(&mut self) -> bool {
        self.tmr.service()
    }

    /// Runs every elapsed timer action. Call from the main loop.
    pub fn timer_process(&mut self) {
        for action in self.tmr.process() {
            match action {
                TimerAction::Heartbeat => self.send_heartbeat(),
                TimerAction::TpdoEvent(num) => self.tpdo.on_event_timer(
                    num,
                    &self.od,
                    &mut self.driver,
                    &self.nmt,
                    &mut self.tmr,
                ),
                TimerAction::TpdoInhibit(num) => self.tpdo.on_inhibit_end(
                    num,
                    &self.od,
                    &mut self.driver,
                    &self.nmt,
                    &mut self.tmr,
                ),
                TimerAction::SdoServerTimeout(k) => {
                    if let Some(frame) = self
                        .sdo_servers
                        .get_mut(k as usize)
                        .and_then(|s| s.on_timeout(&self.od, &mut self.tmr))
                    {
                        let result = self.driver.send(&frame);
                        self.record_result(result);
                    }
                }
                TimerAction::SdoClientTimeout(k) => {
                    if let Some(frame) = self
                        .sdo_clients
                        .get_mut(k as usize)
                        .and_then(|c| c.on_timeout(&self.od, &mut self.tmr))
                    {
                        let result = self.driver.send(&frame);
                        self.record_result(result);
                    }
                }
            }
        }
    }

    // --- Frame routing ---

    /// Routing order: NMT command, SYNC, SDO servers, SDO clients, LSS,
    /// RPDO. The first consumer that claims the frame wins; leftovers go
    /// to the unmatched-frame handler and are dropped.
    fn route(&mut self, frame: CanFrame) -> Result<(), CanopenError> {
        if frame.id == COB_NMT {
            if self.nmt.allowed(ObjectClassMask::NMT) {
                return self.handle_nmt_command(&frame);
            }
            return Ok(());
        }

        if self.sync.cob_id(&self.od) == Some(frame.id) {
            if self.nmt.allowed(ObjectClassMask::SYNC) {
                let effects = self.sync.on_sync(
                    &mut self.od,
                    &mut self.tpdo,
                    &mut self.rpdo,
                    &mut self.driver,
                    &self.nmt,
                    &mut self.tmr,
                );
                self.apply_effects(effects);
            }
            return Ok(());
        }

        if self.nmt.allowed(ObjectClassMask::SDO) {
            for k in 0..self.sdo_servers.len() {
                if self.sdo_servers[k].rx_cob_id(&self.od) != Some(frame.id) {
                    continue;
                }
                let reply = self.sdo_servers[k].handle_frame(&frame, &mut self.od, &mut self.tmr);
                for response in &reply.frames {
                    let result = self.driver.send(response);
                    self.record_result(result);
                }
                self.apply_effects(reply.effects);
                return Ok(());
            }
            for k in 0..self.sdo_clients.len() {
                if self.sdo_clients[k].rx_cob_id(&self.od) != Some(frame.id) {
                    continue;
                }
                if let Some(response) =
                    self.sdo_clients[k].handle_frame(&frame, &self.od, &mut self.tmr)
                {
                    let result = self.driver.send(&response);
                    self.record_result(result);
                }
                return Ok(());
            }
        }

        if frame.id == COB_LSS_REQUEST {
            // LSS slave is out of scope; the slot is claimed so the frame
            // is not misrouted as a PDO.
            return Ok(());
        }

        if self.nmt.allowed(ObjectClassMask::PDO) {
            if let Some(num) = self.rpdo.match_frame(frame.id) {
                let effects = self.rpdo.on_frame(num, &frame, &mut self.od);
                self.apply_effects(effects);
                return Ok(());
            }
        }

        if let Some(handler) = self.config.unmatched_frame {
            handler(&frame);
        }
        Ok(())
    }

    fn handle_nmt_command(&mut self, frame: &CanFrame) -> Result<(), CanopenError> {
        let command = match self.nmt.parse_command(frame, self.config.node_id) {
            Ok(Some(command)) => command,
            Ok(None) => return Ok(()),
            Err(e) => {
                self.record(e);
                return Err(e);
            }
        };
        debug!("NMT command {:?}", command);
        match command {
            NmtCommand::Start => {
                self.nmt.set_state(NmtState::Operational);
                self.sync.reset(&mut self.tpdo);
            }
            NmtCommand::Stop => self.nmt.set_state(NmtState::Stopped),
            NmtCommand::EnterPreOperational => self.nmt.set_state(NmtState::PreOperational),
            NmtCommand::ResetCommunication => {
                self.nmt.set_state(NmtState::Init);
                return self.reset_communication();
            }
            NmtCommand::ResetNode => {
                self.nmt.set_state(NmtState::Init);
                return self.reset_node();
            }
        }
        Ok(())
    }

    // --- Reset paths ---

    /// Reloads all communication parameters: SDO transfers die, PDOs and
    /// the heartbeat producer are re-armed from the dictionary, and the
    /// boot-up message announces the node in pre-operational.
    fn reset_communication(&mut self) -> Result<(), CanopenError> {
        for k in 0..self.sdo_servers.len() {
            self.sdo_servers[k].release(&mut self.tmr);
        }
        for k in 0..self.sdo_clients.len() {
            self.sdo_clients[k].cancel(&mut self.tmr);
        }
        self.nmt.stop_heartbeat(&mut self.tmr);
        self.tpdo.clear(&mut self.tmr);
        self.rpdo.clear();
        self.tmr.clear();

        self.sync.reset(&mut self.tpdo);
        self.tpdo.reset_all(&self.od, &mut self.tmr);
        self.rpdo.reset_all(&self.od);
        self.nmt.restart_heartbeat(&self.od, &mut self.tmr)?;

        self.nmt.set_state(NmtState::PreOperational);
        let bootup = self.nmt.bootup_frame(self.config.node_id);
        self.driver.send(&bootup)
    }

    /// Full application reset: stored parameters are re-applied on top of
    /// the firmware defaults, then communication restarts.
    fn reset_node(&mut self) -> Result<(), CanopenError> {
        self.emcy.reset(true, &mut self.od, &mut self.driver, &self.nmt);
        self.od.init()?;
        self.reset_communication()
    }

    // --- Internals ---

    fn send_heartbeat(&mut self) {
        if matches!(self.nmt.state(), NmtState::Invalid | NmtState::Init) {
            return;
        }
        let frame = self.nmt.heartbeat_frame(self.config.node_id);
        let result = self.driver.send(&frame);
        self.record_result(result);
    }

    fn apply_effects(&mut self, effects: Vec<WriteEffect>) {
        for effect in effects {
            self.apply_effect(effect);
        }
    }

    fn apply_effect(&mut self, effect: WriteEffect) {
        match effect {
            WriteEffect::None => {}
            WriteEffect::TpdoSignal(key) => {
                self.tpdo
                    .trig_obj(key, &self.od, &mut self.driver, &self.nmt, &mut self.tmr);
            }
            WriteEffect::TpdoReset(num) => {
                if let Err(e) = self.tpdo.reset(num, &self.od, &mut self.tmr) {
                    warn!("TPDO {} reset failed: {}", num, e);
                    self.record(e);
                }
            }
            WriteEffect::RpdoReset(num) => {
                if let Err(e) = self.rpdo.reset(num, &self.od) {
                    warn!("RPDO {} reset failed: {}", num, e);
                    self.record(e);
                }
            }
            WriteEffect::HeartbeatRestart => {
                let result = self.nmt.restart_heartbeat(&self.od, &mut self.tmr);
                self.record_result(result);
            }
            WriteEffect::EmcyHistClear => self.emcy.clear_history(&mut self.od),
        }
    }

    fn record(&mut self, error: CanopenError) {
        if self.last_error.is_none() {
            self.last_error = Some(error);
        }
    }

    fn record_result<T>(&mut self, result: Result<T, CanopenError>) {
        if let Err(e) = result {
            self.record(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::od::{ObjectEntry, ObjectFlags};
    use alloc::collections::VecDeque;
    use alloc::rc::Rc;
    use core::cell::RefCell;

    #[derive(Default)]
    struct BusState {
        sent: Vec<CanFrame>,
        rx: VecDeque<CanFrame>,
    }

    #[derive(Clone)]
    struct TestDriver(Rc<RefCell<BusState>>);

    impl TestDriver {
        fn new() -> Self {
            Self(Rc::new(RefCell::new(BusState::default())))
        }
        fn push_rx(&self, frame: CanFrame) {
            self.0.borrow_mut().rx.push_back(frame);
        }
        fn sent(&self) -> Vec<CanFrame> {
            self.0.borrow().sent.clone()
        }
        fn clear_sent(&self) {
            self.0.borrow_mut().sent.clear();
        }
    }

    impl CanDriver for TestDriver {
        fn enable(&mut self, _: u32) -> Result<(), CanopenError> {
            Ok(())
        }
        fn send(&mut self, frame: &CanFrame) -> Result<(), CanopenError> {
            self.0.borrow_mut().sent.push(*frame);
            Ok(())
        }
        fn receive(&mut self) -> Result<Option<CanFrame>, CanopenError> {
            Ok(self.0.borrow_mut().rx.pop_front())
        }
        fn reset(&mut self) -> Result<(), CanopenError> {
            Ok(())
        }
        fn close(&mut self) -> Result<(), CanopenError> {
            Ok(())
        }
    }

    fn make_node(driver: TestDriver) -> CanopenNode<'static, TestDriver> {
        let mut od = ObjectDictionary::new(NodeId(1), None);
        od.insert(
            ObjectKey::new(0x2000, 0),
            ObjectEntry::new(ObjectValue::Unsigned32(0), "AppVar", ObjectFlags::RW),
        );
        CanopenNode::new(
            NodeConfig::new(NodeId(1)),
            od,
            driver,
            EmcyTable::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_start_emits_bootup_and_enters_preop() {
        let driver = TestDriver::new();
        let mut node = make_node(driver.clone());
        node.start().unwrap();
        assert_eq!(node.nmt_state(), NmtState::PreOperational);
        let sent = driver.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, 0x701);
        assert_eq!(sent[0].payload(), [0x00]);
    }

    #[test]
    fn test_nmt_commands_drive_state() {
        let driver = TestDriver::new();
        let mut node = make_node(driver.clone());
        node.start().unwrap();

        driver.push_rx(CanFrame::with_payload(0x000, &[0x01, 0x01]));
        node.process().unwrap();
        assert_eq!(node.nmt_state(), NmtState::Operational);

        driver.push_rx(CanFrame::with_payload(0x000, &[0x02, 0x00]));
        node.process().unwrap();
        assert_eq!(node.nmt_state(), NmtState::Stopped);

        driver.push_rx(CanFrame::with_payload(0x000, &[0x80, 0x01]));
        node.process().unwrap();
        assert_eq!(node.nmt_state(), NmtState::PreOperational);

        // A command for another node is ignored.
        driver.push_rx(CanFrame::with_payload(0x000, &[0x01, 0x05]));
        node.process().unwrap();
        assert_eq!(node.nmt_state(), NmtState::PreOperational);
    }

    #[test]
    fn test_reset_communication_rebootups() {
        let driver = TestDriver::new();
        let mut node = make_node(driver.clone());
        node.start().unwrap();
        driver.clear_sent();

        driver.push_rx(CanFrame::with_payload(0x000, &[0x82, 0x01]));
        node.process().unwrap();
        assert_eq!(node.nmt_state(), NmtState::PreOperational);
        let sent = driver.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, 0x701);
        assert_eq!(sent[0].payload(), [0x00]);
    }

    #[test]
    fn test_sdo_request_routed_in_preop() {
        let driver = TestDriver::new();
        let mut node = make_node(driver.clone());
        node.start().unwrap();
        driver.clear_sent();

        driver.push_rx(CanFrame::with_payload(
            0x601,
            &[0x23, 0x00, 0x20, 0x00, 0x78, 0x56, 0x34, 0x12],
        ));
        node.process().unwrap();
        let sent = driver.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, 0x581);
        assert_eq!(sent[0].get_u8(0), 0x60);
        assert_eq!(
            node.od().read_u32(ObjectKey::new(0x2000, 0)).unwrap(),
            0x1234_5678
        );
    }

    #[test]
    fn test_pdo_frames_ignored_outside_operational() {
        let driver = TestDriver::new();
        let mut node = make_node(driver.clone());
        node.start().unwrap();

        // RPDO1 is enabled by default at 0x201; in pre-operational the
        // frame falls through to the unmatched handler (a drop).
        driver.push_rx(CanFrame::with_payload(0x201, &[1, 2, 3, 4]));
        node.process().unwrap();
        assert!(node.take_error().is_none());
    }

    #[test]
    fn test_heartbeat_production() {
        let driver = TestDriver::new();
        let mut node = make_node(driver.clone());
        node.start().unwrap();
        node.write(ObjectKey::new(0x1017, 0), ObjectValue::Unsigned16(5))
            .unwrap();
        driver.clear_sent();

        for _ in 0..5 {
            node.timer_service();
            node.timer_process();
        }
        let sent = driver.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, 0x701);
        assert_eq!(sent[0].payload(), [0x7F]);

        // Another full period, still in pre-operational.
        driver.clear_sent();
        for _ in 0..5 {
            node.timer_service();
            node.timer_process();
        }
        assert_eq!(driver.sent().len(), 1);
    }

    #[test]
    fn test_take_error_is_read_and_clear() {
        let driver = TestDriver::new();
        let mut node = make_node(driver.clone());
        node.start().unwrap();
        assert!(node.take_error().is_none());

        // Malformed NMT command records an error.
        driver.push_rx(CanFrame::with_payload(0x000, &[0x42, 0x01]));
        let _ = node.process();
        assert_eq!(node.take_error(), Some(CanopenError::Nmt));
        assert!(node.take_error().is_none());
    }
}
