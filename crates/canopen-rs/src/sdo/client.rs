// crates/canopen-rs/src/sdo/client.rs

use super::{AbortCode, SDO_SEG_LEN};
use crate::frame::CanFrame;
use crate::hal::CanopenError;
use crate::od::{ObjectDictionary, ObjectKey};
use crate::tmr::{TimerAction, TimerWheel, TmrHandle};
use crate::types::{COBID_OFF, COBID_STD_MASK};
use alloc::boxed::Box;
use alloc::vec::Vec;
use log::{debug, trace, warn};

/// Outcome of a finished client transfer, handed to the request callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdoClientResult {
    pub client: u8,
    pub index: u16,
    pub sub_index: u8,
    /// 0 on success, otherwise the abort code received or generated.
    pub abort_code: u32,
    /// The uploaded bytes; empty for downloads.
    pub data: Vec<u8>,
}

/// Completion callback of a client transfer; invoked exactly once.
pub type SdoClientCallback = Box<dyn FnOnce(SdoClientResult)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ClientState {
    #[default]
    Idle,
    DownloadInit,
    DownloadSegment,
    UploadInit,
    UploadSegment,
}

/// One SDO client channel (COB-IDs from 0x1280+k).
///
/// The client initiates expedited and segmented transfers towards a remote
/// SDO server and reports the outcome through a per-request callback. A
/// channel whose identifiers are disabled rejects requests; so does a
/// channel with a transfer in flight.
pub struct SdoClient {
    num: u8,
    state: ClientState,
    key: ObjectKey,
    toggle: bool,
    offset: usize,
    /// Download payload, or upload accumulation buffer.
    data: Vec<u8>,
    /// Announced upload size; zero when unknown.
    announced: usize,
    timeout_ticks: u32,
    tmr_handle: Option<TmrHandle>,
    callback: Option<SdoClientCallback>,
}

impl SdoClient {
    pub fn new(num: u8) -> Self {
        Self {
            num,
            state: ClientState::Idle,
            key: ObjectKey::new(0, 0),
            toggle: false,
            offset: 0,
            data: Vec::new(),
            announced: 0,
            timeout_ticks: 0,
            tmr_handle: None,
            callback: None,
        }
    }

    pub fn num(&self) -> u8 {
        self.num
    }

    pub fn is_busy(&self) -> bool {
        self.state != ClientState::Idle
    }

    /// The response COB-ID this channel listens on, if configured.
    pub fn rx_cob_id(&self, od: &ObjectDictionary) -> Option<u16> {
        let cob = od.read_u32(ObjectKey::new(0x1280 + self.num as u16, 2)).ok()?;
        if cob & COBID_OFF != 0 {
            return None;
        }
        Some((cob & COBID_STD_MASK) as u16)
    }

    fn tx_cob_id(&self, od: &ObjectDictionary) -> Option<u16> {
        let cob = od.read_u32(ObjectKey::new(0x1280 + self.num as u16, 1)).ok()?;
        if cob & COBID_OFF != 0 {
            return None;
        }
        Some((cob & COBID_STD_MASK) as u16)
    }

    fn channel(&self, od: &ObjectDictionary) -> Result<u16, CanopenError> {
        match (self.tx_cob_id(od), self.rx_cob_id(od)) {
            (Some(tx), Some(_)) => Ok(tx),
            _ => Err(CanopenError::SdoOff),
        }
    }

    /// Starts a download (write) of `data` to the remote object. Returns
    /// the initiate frame for the node to send. Payloads of up to four
    /// bytes go expedited, anything longer is segmented.
    pub fn request_download(
        &mut self,
        od: &ObjectDictionary,
        tmr: &mut TimerWheel,
        key: ObjectKey,
        data: Vec<u8>,
        timeout_ms: u32,
        callback: SdoClientCallback,
    ) -> Result<CanFrame, CanopenError> {
        let tx = self.channel(od)?;
        if self.is_busy() {
            return Err(CanopenError::SdoBusy);
        }
        if data.is_empty() {
            return Err(CanopenError::Argument);
        }

        let mut frame = CanFrame::new(tx);
        frame.set_u16(1, key.index);
        frame.set_u8(3, key.sub_index);
        if data.len() <= 4 {
            frame.set_u8(0, 0x23 | (((4 - data.len()) as u8) << 2));
            frame.data[4..4 + data.len()].copy_from_slice(&data);
        } else {
            frame.set_u8(0, 0x21);
            frame.set_u32(4, data.len() as u32);
        }
        frame.dlc = 8;

        self.state = ClientState::DownloadInit;
        self.key = key;
        self.toggle = false;
        self.offset = 0;
        self.data = data;
        self.timeout_ticks = timeout_ms;
        self.callback = Some(callback);
        self.rearm_timeout(tmr);
        trace!("SDO client {}: download of {:?} started", self.num, key);
        Ok(frame)
    }

    /// Starts an upload (read) of the remote object. Returns the initiate
    /// frame for the node to send; the uploaded bytes arrive through the
    /// callback.
    pub fn request_upload(
        &mut self,
        od: &ObjectDictionary,
        tmr: &mut TimerWheel,
        key: ObjectKey,
        timeout_ms: u32,
        callback: SdoClientCallback,
    ) -> Result<CanFrame, CanopenError> {
        let tx = self.channel(od)?;
        if self.is_busy() {
            return Err(CanopenError::SdoBusy);
        }

        let mut frame = CanFrame::new(tx);
        frame.set_u8(0, 0x40);
        frame.set_u16(1, key.index);
        frame.set_u8(3, key.sub_index);
        frame.dlc = 8;

        self.state = ClientState::UploadInit;
        self.key = key;
        self.toggle = false;
        self.offset = 0;
        self.data = Vec::new();
        self.announced = 0;
        self.timeout_ticks = timeout_ms;
        self.callback = Some(callback);
        self.rearm_timeout(tmr);
        trace!("SDO client {}: upload of {:?} started", self.num, key);
        Ok(frame)
    }

    /// Processes one response frame from the remote server. May return a
    /// follow-up frame (next segment, segment request, or abort).
    pub fn handle_frame(
        &mut self,
        frame: &CanFrame,
        od: &ObjectDictionary,
        tmr: &mut TimerWheel,
    ) -> Option<CanFrame> {
        if self.state == ClientState::Idle {
            return None;
        }
        if frame.dlc != 8 {
            warn!("SDO client {}: dropping response with DLC {}", self.num, frame.dlc);
            return None;
        }
        let tx = self.tx_cob_id(od)?;
        let cmd = frame.get_u8(0);

        // An abort from the server finishes the transfer silently.
        if cmd >> 5 == 4 {
            let code = frame.get_u32(4);
            debug!("SDO client {}: server abort {:#010X}", self.num, code);
            self.finish(tmr, code);
            return None;
        }

        match self.state {
            ClientState::DownloadInit => {
                if cmd >> 5 != 3 {
                    return Some(self.protocol_abort(tmr, tx));
                }
                if self.data.len() <= 4 {
                    // Expedited download confirmed.
                    self.finish(tmr, 0);
                    return None;
                }
                Some(self.next_download_segment(tmr, tx))
            }
            ClientState::DownloadSegment => {
                if cmd >> 5 != 1 {
                    return Some(self.protocol_abort(tmr, tx));
                }
                if (cmd & 0x10 != 0) != self.toggle {
                    let abort = abort_frame(tx, self.key, AbortCode::ToggleNotAlternated);
                    self.finish(tmr, AbortCode::ToggleNotAlternated.as_u32());
                    return Some(abort);
                }
                self.toggle = !self.toggle;
                if self.offset >= self.data.len() {
                    self.finish(tmr, 0);
                    return None;
                }
                Some(self.next_download_segment(tmr, tx))
            }
            ClientState::UploadInit => {
                if cmd >> 5 != 2 {
                    return Some(self.protocol_abort(tmr, tx));
                }
                if cmd & 0x02 != 0 {
                    // Expedited upload: the data sits in bytes 4..8.
                    let len = if cmd & 0x01 != 0 {
                        4 - ((cmd >> 2) & 0x03) as usize
                    } else {
                        4
                    };
                    self.data.extend_from_slice(&frame.data[4..4 + len]);
                    self.finish(tmr, 0);
                    return None;
                }
                // Segmented upload announced.
                if cmd & 0x01 != 0 {
                    self.announced = frame.get_u32(4) as usize;
                    self.data.reserve(self.announced);
                }
                self.state = ClientState::UploadSegment;
                Some(self.next_upload_request(tmr, tx))
            }
            ClientState::UploadSegment => {
                if cmd >> 5 != 0 {
                    return Some(self.protocol_abort(tmr, tx));
                }
                if (cmd & 0x10 != 0) != self.toggle {
                    let abort = abort_frame(tx, self.key, AbortCode::ToggleNotAlternated);
                    self.finish(tmr, AbortCode::ToggleNotAlternated.as_u32());
                    return Some(abort);
                }
                let unused = ((cmd >> 1) & 0x07) as usize;
                self.data
                    .extend_from_slice(&frame.data[1..1 + (SDO_SEG_LEN - unused)]);
                if cmd & 0x01 != 0 {
                    self.finish(tmr, 0);
                    return None;
                }
                self.toggle = !self.toggle;
                Some(self.next_upload_request(tmr, tx))
            }
            ClientState::Idle => None,
        }
    }

    /// Cancels an ongoing transfer without touching the wire, reporting
    /// abort 0x08000022 (device state) to the callback. Used on
    /// communication reset.
    pub fn cancel(&mut self, tmr: &mut TimerWheel) {
        if self.state != ClientState::Idle {
            self.finish(tmr, AbortCode::DeviceState.as_u32());
        }
    }

    /// Handles expiry of the transfer timeout: the transfer is aborted on
    /// the wire and reported to the callback.
    pub fn on_timeout(&mut self, od: &ObjectDictionary, tmr: &mut TimerWheel) -> Option<CanFrame> {
        // The handle has normally fired already; deleting is a no-op then.
        if let Some(handle) = self.tmr_handle.take() {
            let _ = tmr.delete(handle);
        }
        if self.state == ClientState::Idle {
            return None;
        }
        debug!("SDO client {}: transfer timed out", self.num);
        let frame = self
            .tx_cob_id(od)
            .map(|tx| abort_frame(tx, self.key, AbortCode::Timeout));
        self.finish(tmr, AbortCode::Timeout.as_u32());
        frame
    }

    fn next_download_segment(&mut self, tmr: &mut TimerWheel, tx: u16) -> CanFrame {
        let remaining = self.data.len() - self.offset;
        let len = remaining.min(SDO_SEG_LEN);
        let last = remaining <= SDO_SEG_LEN;

        let mut frame = CanFrame::new(tx);
        frame.set_u8(
            0,
            ((self.toggle as u8) << 4) | (((SDO_SEG_LEN - len) as u8) << 1) | last as u8,
        );
        frame.data[1..1 + len].copy_from_slice(&self.data[self.offset..self.offset + len]);
        frame.dlc = 8;

        self.offset += len;
        self.state = ClientState::DownloadSegment;
        self.rearm_timeout(tmr);
        frame
    }

    fn next_upload_request(&mut self, tmr: &mut TimerWheel, tx: u16) -> CanFrame {
        let mut frame = CanFrame::new(tx);
        frame.set_u8(0, 0x60 | ((self.toggle as u8) << 4));
        frame.dlc = 8;
        self.rearm_timeout(tmr);
        frame
    }

    fn protocol_abort(&mut self, tmr: &mut TimerWheel, tx: u16) -> CanFrame {
        let frame = abort_frame(tx, self.key, AbortCode::InvalidCommand);
        self.finish(tmr, AbortCode::InvalidCommand.as_u32());
        frame
    }

    /// Completes the transfer: cancels the timeout, resets to idle and
    /// invokes the callback exactly once.
    fn finish(&mut self, tmr: &mut TimerWheel, abort_code: u32) {
        if let Some(handle) = self.tmr_handle.take() {
            let _ = tmr.delete(handle);
        }
        let result = SdoClientResult {
            client: self.num,
            index: self.key.index,
            sub_index: self.key.sub_index,
            abort_code,
            data: core::mem::take(&mut self.data),
        };
        self.state = ClientState::Idle;
        self.toggle = false;
        self.offset = 0;
        self.announced = 0;
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }

    fn rearm_timeout(&mut self, tmr: &mut TimerWheel) {
        if let Some(handle) = self.tmr_handle.take() {
            let _ = tmr.delete(handle);
        }
        match tmr.create(self.timeout_ticks, 0, TimerAction::SdoClientTimeout(self.num)) {
            Ok(handle) => self.tmr_handle = Some(handle),
            Err(e) => warn!("SDO client {}: failed to arm timeout: {}", self.num, e),
        }
    }
}

fn abort_frame(tx: u16, key: ObjectKey, code: AbortCode) -> CanFrame {
    let mut frame = CanFrame::new(tx);
    frame.set_u8(0, 0x80);
    frame.set_u16(1, key.index);
    frame.set_u8(3, key.sub_index);
    frame.set_u32(4, code.as_u32());
    frame.dlc = 8;
    frame
}
