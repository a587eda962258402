// crates/canopen-rs/src/sdo/server.rs

use super::{AbortCode, SDO_BLOCK_SEQ_MAX, SDO_SEG_LEN};
use crate::frame::CanFrame;
use crate::od::{ObjectDictionary, ObjectKey, WriteEffect};
use crate::tmr::{TimerAction, TimerWheel, TmrHandle};
use crate::types::{COBID_OFF, COBID_STD_MASK};
use alloc::vec::Vec;
use log::{debug, trace, warn};

/// The state of one SDO server channel. `Idle` means no transfer is
/// ongoing; every other state holds a target object and a live timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ServerState {
    #[default]
    Idle,
    SegmentedDownload,
    SegmentedUpload,
    BlockDownload,
    BlockDownloadEnd,
    /// Initiate response sent, waiting for the client's start-upload.
    BlockUploadStart,
    /// A block of segments is out, waiting for the client's acknowledge.
    BlockUpload,
    /// End-of-transfer sent, waiting for the client's confirmation.
    BlockUploadEnd,
}

/// Everything a server sends back for one received frame, plus the
/// dictionary side effects the node must apply afterwards.
#[derive(Debug, Default)]
pub struct SdoReply {
    pub frames: Vec<CanFrame>,
    pub effects: Vec<WriteEffect>,
}

impl SdoReply {
    fn frame(frame: CanFrame) -> Self {
        Self {
            frames: alloc::vec![frame],
            effects: Vec::new(),
        }
    }
}

/// One SDO server channel (request/response COB-IDs from 0x1200+k).
///
/// The channel is a pure state machine: frames in, frames out. It reads
/// and writes the dictionary, re-arms its transfer timeout on every
/// protocol step, and reports resulting write effects upwards.
pub struct SdoServer {
    num: u8,
    state: ServerState,
    key: ObjectKey,
    /// Total transfer size; for uploads fixed at initiate time.
    size: usize,
    /// Bytes streamed so far (upload) or received (download, block mode).
    offset: usize,
    toggle: bool,
    /// Download accumulation buffer, pre-sized at init.
    buf: Vec<u8>,
    buf_capacity: usize,
    timeout_ticks: u32,
    tmr_handle: Option<TmrHandle>,
    block_enabled: bool,
    /// Segments per block: ours on download, the client's on upload.
    blksize: u8,
    /// Expected sequence number (download) or segments sent (upload).
    seq: u8,
    /// Object offset at the start of the current upload block.
    block_base: usize,
    /// Valid data bytes in the most recent upload segment.
    last_seg_len: u8,
    /// Final segment of a block transfer has been seen/sent.
    finished: bool,
}

impl SdoServer {
    pub fn new(num: u8, buf_segments: usize, timeout_ms: u32, block_enabled: bool) -> Self {
        let buf_capacity = buf_segments * SDO_SEG_LEN;
        Self {
            num,
            state: ServerState::Idle,
            key: ObjectKey::new(0, 0),
            size: 0,
            offset: 0,
            toggle: false,
            buf: Vec::with_capacity(buf_capacity),
            buf_capacity,
            timeout_ticks: timeout_ms,
            tmr_handle: None,
            block_enabled,
            blksize: 0,
            seq: 0,
            block_base: 0,
            last_seg_len: 0,
            finished: false,
        }
    }

    pub fn num(&self) -> u8 {
        self.num
    }

    /// True while a transfer is ongoing.
    pub fn is_busy(&self) -> bool {
        self.state != ServerState::Idle
    }

    /// The request COB-ID this channel listens on, if the channel is
    /// enabled. Read live from the dictionary so identifier changes need
    /// no cache invalidation.
    pub fn rx_cob_id(&self, od: &ObjectDictionary) -> Option<u16> {
        let cob = od.read_u32(ObjectKey::new(0x1200 + self.num as u16, 1)).ok()?;
        if cob & COBID_OFF != 0 {
            return None;
        }
        Some((cob & COBID_STD_MASK) as u16)
    }

    fn tx_cob_id(&self, od: &ObjectDictionary) -> Option<u16> {
        let cob = od.read_u32(ObjectKey::new(0x1200 + self.num as u16, 2)).ok()?;
        if cob & COBID_OFF != 0 {
            return None;
        }
        Some((cob & COBID_STD_MASK) as u16)
    }

    /// Releases the transfer and cancels the timeout.
    pub fn release(&mut self, tmr: &mut TimerWheel) {
        if let Some(handle) = self.tmr_handle.take() {
            let _ = tmr.delete(handle);
        }
        self.state = ServerState::Idle;
        self.buf.clear();
        self.size = 0;
        self.offset = 0;
        self.toggle = false;
        self.finished = false;
        self.seq = 0;
    }

    /// Re-arms the per-transfer timeout; called on every protocol step of
    /// an ongoing transfer so a stalled client eventually gets an abort.
    fn rearm_timeout(&mut self, tmr: &mut TimerWheel) {
        if let Some(handle) = self.tmr_handle.take() {
            let _ = tmr.delete(handle);
        }
        match tmr.create(self.timeout_ticks, 0, TimerAction::SdoServerTimeout(self.num)) {
            Ok(handle) => self.tmr_handle = Some(handle),
            Err(e) => warn!("SDO server {}: failed to arm timeout: {}", self.num, e),
        }
    }

    /// Handles the expiry of the transfer timeout: aborts the transfer on
    /// the wire and releases all state.
    pub fn on_timeout(&mut self, od: &ObjectDictionary, tmr: &mut TimerWheel) -> Option<CanFrame> {
        // The handle has normally fired already; deleting is a no-op then.
        if let Some(handle) = self.tmr_handle.take() {
            let _ = tmr.delete(handle);
        }
        if self.state == ServerState::Idle {
            return None;
        }
        debug!("SDO server {}: transfer timed out", self.num);
        let frame = self
            .tx_cob_id(od)
            .map(|tx| abort_frame(tx, self.key, AbortCode::Timeout));
        self.release(tmr);
        frame
    }

    /// Processes one request frame addressed to this channel.
    pub fn handle_frame(
        &mut self,
        frame: &CanFrame,
        od: &mut ObjectDictionary,
        tmr: &mut TimerWheel,
    ) -> SdoReply {
        let Some(tx) = self.tx_cob_id(od) else {
            return SdoReply::default();
        };
        if frame.dlc != 8 {
            warn!("SDO server {}: dropping request with DLC {}", self.num, frame.dlc);
            return SdoReply::default();
        }

        // During the data phase of a block download the frames carry a
        // sequence byte instead of a command specifier.
        if self.state == ServerState::BlockDownload {
            return self.block_download_segment(frame, od, tmr, tx);
        }

        let cmd = frame.get_u8(0);
        match cmd >> 5 {
            0 => self.download_segment(frame, od, tmr, tx),
            1 => self.initiate_download(frame, od, tmr, tx),
            2 => self.initiate_upload(frame, od, tmr, tx),
            3 => self.upload_segment(frame, od, tmr, tx),
            4 => {
                // Abort from the client: release silently.
                trace!(
                    "SDO server {}: client abort {:#010X}",
                    self.num,
                    frame.get_u32(4)
                );
                self.release(tmr);
                SdoReply::default()
            }
            5 => self.block_upload_command(frame, od, tmr, tx),
            6 => self.block_download_command(frame, od, tmr, tx),
            _ => {
                let key = request_key(frame);
                self.release(tmr);
                SdoReply::frame(abort_frame(tx, key, AbortCode::InvalidCommand))
            }
        }
    }

    // --- Expedited and segmented download ---

    fn initiate_download(
        &mut self,
        frame: &CanFrame,
        od: &mut ObjectDictionary,
        tmr: &mut TimerWheel,
        tx: u16,
    ) -> SdoReply {
        if self.is_busy() {
            self.release(tmr);
        }
        let cmd = frame.get_u8(0);
        let key = request_key(frame);
        let expedited = cmd & 0x02 != 0;
        let size_indicated = cmd & 0x01 != 0;

        if expedited {
            let len = if size_indicated {
                4 - ((cmd >> 2) & 0x03) as usize
            } else {
                match od.size_of(key) {
                    Ok(size) => size.min(4),
                    Err(e) => {
                        return SdoReply::frame(abort_frame(tx, key, AbortCode::from_error(e)));
                    }
                }
            };
            return match od.write_bytes(key, &frame.data[4..4 + len]) {
                Ok(effect) => {
                    let mut reply = SdoReply::frame(download_response(tx, key));
                    reply.effects.push(effect);
                    reply
                }
                Err(e) => SdoReply::frame(abort_frame(tx, key, AbortCode::from_error(e))),
            };
        }

        // Segmented download: the request announces the total size.
        let announced = if size_indicated {
            frame.get_u32(4) as usize
        } else {
            0
        };
        if let Err(code) = self.check_download_size(od, key, announced) {
            return SdoReply::frame(abort_frame(tx, key, code));
        }
        self.state = ServerState::SegmentedDownload;
        self.key = key;
        self.size = announced;
        self.toggle = false;
        self.buf.clear();
        self.rearm_timeout(tmr);
        SdoReply::frame(download_response(tx, key))
    }

    fn download_segment(
        &mut self,
        frame: &CanFrame,
        od: &mut ObjectDictionary,
        tmr: &mut TimerWheel,
        tx: u16,
    ) -> SdoReply {
        if self.state != ServerState::SegmentedDownload {
            self.release(tmr);
            return SdoReply::frame(abort_frame(tx, self.key, AbortCode::DeviceState));
        }
        let cmd = frame.get_u8(0);
        let toggle = cmd & 0x10 != 0;
        if toggle != self.toggle {
            let key = self.key;
            self.release(tmr);
            return SdoReply::frame(abort_frame(tx, key, AbortCode::ToggleNotAlternated));
        }
        let last = cmd & 0x01 != 0;
        let unused = ((cmd >> 1) & 0x07) as usize;
        let seg_len = SDO_SEG_LEN - unused;

        if self.buf.len() + seg_len > self.buf_capacity
            || (self.size > 0 && self.buf.len() + seg_len > self.size)
        {
            let key = self.key;
            self.release(tmr);
            return SdoReply::frame(abort_frame(tx, key, AbortCode::LengthTooHigh));
        }
        self.buf.extend_from_slice(&frame.data[1..1 + seg_len]);

        let response = CanFrame::with_payload(
            tx,
            &[0x20 | ((self.toggle as u8) << 4), 0, 0, 0, 0, 0, 0, 0],
        );
        self.toggle = !self.toggle;

        if last {
            if self.size > 0 && self.buf.len() < self.size {
                let key = self.key;
                self.release(tmr);
                return SdoReply::frame(abort_frame(tx, key, AbortCode::LengthTooLow));
            }
            let key = self.key;
            let result = od.write_bytes(key, &self.buf);
            self.release(tmr);
            return match result {
                Ok(effect) => {
                    let mut reply = SdoReply::frame(response);
                    reply.effects.push(effect);
                    reply
                }
                Err(e) => SdoReply::frame(abort_frame(tx, key, AbortCode::from_error(e))),
            };
        }
        self.rearm_timeout(tmr);
        SdoReply::frame(response)
    }

    // --- Expedited and segmented upload ---

    fn initiate_upload(
        &mut self,
        frame: &CanFrame,
        od: &ObjectDictionary,
        tmr: &mut TimerWheel,
        tx: u16,
    ) -> SdoReply {
        if self.is_busy() {
            self.release(tmr);
        }
        let key = request_key(frame);
        let size = match od.size_of(key) {
            Ok(size) => size,
            Err(e) => return SdoReply::frame(abort_frame(tx, key, AbortCode::from_error(e))),
        };
        let bytes = match od.read_bytes(key) {
            Ok(bytes) => bytes,
            Err(e) => return SdoReply::frame(abort_frame(tx, key, AbortCode::from_error(e))),
        };

        if size > 0 && size <= 4 {
            // Expedited response with the data in-line.
            let mut response = CanFrame::new(tx);
            response.set_u8(0, 0x43 | (((4 - size) as u8) << 2));
            response.set_u16(1, key.index);
            response.set_u8(3, key.sub_index);
            response.data[4..4 + size].copy_from_slice(&bytes);
            response.dlc = 8;
            return SdoReply::frame(response);
        }

        // Segmented response announcing the size.
        let mut response = CanFrame::new(tx);
        response.set_u8(0, 0x41);
        response.set_u16(1, key.index);
        response.set_u8(3, key.sub_index);
        response.set_u32(4, size as u32);
        response.dlc = 8;

        self.state = ServerState::SegmentedUpload;
        self.key = key;
        self.size = size;
        self.offset = 0;
        self.toggle = false;
        self.rearm_timeout(tmr);
        SdoReply::frame(response)
    }

    fn upload_segment(
        &mut self,
        frame: &CanFrame,
        od: &ObjectDictionary,
        tmr: &mut TimerWheel,
        tx: u16,
    ) -> SdoReply {
        if self.state != ServerState::SegmentedUpload {
            self.release(tmr);
            return SdoReply::frame(abort_frame(tx, self.key, AbortCode::DeviceState));
        }
        let toggle = frame.get_u8(0) & 0x10 != 0;
        if toggle != self.toggle {
            let key = self.key;
            self.release(tmr);
            return SdoReply::frame(abort_frame(tx, key, AbortCode::ToggleNotAlternated));
        }

        let mut response = CanFrame::new(tx);
        let len = match od.read_segment(self.key, &mut response.data[1..8], self.offset) {
            Ok(len) => len,
            Err(e) => {
                let key = self.key;
                self.release(tmr);
                return SdoReply::frame(abort_frame(tx, key, AbortCode::from_error(e)));
            }
        };
        self.offset += len;
        let last = self.offset >= self.size;
        response.set_u8(
            0,
            ((self.toggle as u8) << 4) | (((SDO_SEG_LEN - len) as u8) << 1) | last as u8,
        );
        response.dlc = 8;
        self.toggle = !self.toggle;

        if last {
            self.release(tmr);
        } else {
            self.rearm_timeout(tmr);
        }
        SdoReply::frame(response)
    }

    // --- Block download ---

    fn block_download_command(
        &mut self,
        frame: &CanFrame,
        od: &mut ObjectDictionary,
        tmr: &mut TimerWheel,
        tx: u16,
    ) -> SdoReply {
        let cmd = frame.get_u8(0);
        if cmd & 0x01 == 0 {
            self.block_download_initiate(frame, od, tmr, tx)
        } else {
            self.block_download_end(frame, od, tmr, tx)
        }
    }

    fn block_download_initiate(
        &mut self,
        frame: &CanFrame,
        od: &ObjectDictionary,
        tmr: &mut TimerWheel,
        tx: u16,
    ) -> SdoReply {
        let key = request_key(frame);
        if !self.block_enabled {
            return SdoReply::frame(abort_frame(tx, key, AbortCode::InvalidCommand));
        }
        if self.is_busy() {
            self.release(tmr);
        }
        let size_indicated = frame.get_u8(0) & 0x02 != 0;
        let announced = if size_indicated {
            frame.get_u32(4) as usize
        } else {
            0
        };
        if let Err(code) = self.check_download_size(od, key, announced) {
            return SdoReply::frame(abort_frame(tx, key, code));
        }

        self.state = ServerState::BlockDownload;
        self.key = key;
        self.size = announced;
        self.buf.clear();
        self.blksize = (self.buf_capacity / SDO_SEG_LEN).min(SDO_BLOCK_SEQ_MAX as usize) as u8;
        self.seq = 1;
        self.finished = false;
        self.rearm_timeout(tmr);

        // No CRC support: sc stays 0 in the response.
        let mut response = CanFrame::new(tx);
        response.set_u8(0, 0xA0);
        response.set_u16(1, key.index);
        response.set_u8(3, key.sub_index);
        response.set_u8(4, self.blksize);
        response.dlc = 8;
        SdoReply::frame(response)
    }

    fn block_download_segment(
        &mut self,
        frame: &CanFrame,
        _od: &mut ObjectDictionary,
        tmr: &mut TimerWheel,
        tx: u16,
    ) -> SdoReply {
        let seq_byte = frame.get_u8(0);
        let last = seq_byte & 0x80 != 0;
        let seq = seq_byte & 0x7F;

        if seq == 0 || seq > self.blksize {
            let key = self.key;
            self.release(tmr);
            return SdoReply::frame(abort_frame(tx, key, AbortCode::InvalidSequenceNumber));
        }

        if seq == self.seq {
            // In-sequence segment: buffer its 7 data bytes. Padding of the
            // final segment is trimmed by the end request.
            if self.buf.len() + SDO_SEG_LEN > self.buf_capacity {
                let key = self.key;
                self.release(tmr);
                return SdoReply::frame(abort_frame(tx, key, AbortCode::LengthTooHigh));
            }
            self.buf.extend_from_slice(&frame.data[1..8]);
            self.seq += 1;
            if last {
                self.finished = true;
            }
        }
        // Out-of-sequence segments are dropped; the acknowledge below makes
        // the client retransmit everything after the last good one.

        if seq == self.blksize || last {
            let acked = self.seq - 1;
            let mut response = CanFrame::new(tx);
            response.set_u8(0, 0xA2);
            response.set_u8(1, acked);
            response.set_u8(2, self.blksize);
            response.dlc = 8;
            self.seq = 1;
            if self.finished {
                self.state = ServerState::BlockDownloadEnd;
            }
            self.rearm_timeout(tmr);
            return SdoReply::frame(response);
        }
        self.rearm_timeout(tmr);
        SdoReply::default()
    }

    fn block_download_end(
        &mut self,
        frame: &CanFrame,
        od: &mut ObjectDictionary,
        tmr: &mut TimerWheel,
        tx: u16,
    ) -> SdoReply {
        if self.state != ServerState::BlockDownloadEnd {
            let key = self.key;
            self.release(tmr);
            return SdoReply::frame(abort_frame(tx, key, AbortCode::DeviceState));
        }
        let unused = ((frame.get_u8(0) >> 2) & 0x07) as usize;
        let key = self.key;
        let size = self.size;
        let len = self.buf.len().saturating_sub(unused);
        self.buf.truncate(len);

        if size > 0 && len != size {
            self.release(tmr);
            let code = if len > size {
                AbortCode::LengthTooHigh
            } else {
                AbortCode::LengthTooLow
            };
            return SdoReply::frame(abort_frame(tx, key, code));
        }
        let result = od.write_bytes(key, &self.buf);
        self.release(tmr);
        match result {
            Ok(effect) => {
                let mut response = CanFrame::new(tx);
                response.set_u8(0, 0xA1);
                response.dlc = 8;
                let mut reply = SdoReply::frame(response);
                reply.effects.push(effect);
                reply
            }
            Err(e) => SdoReply::frame(abort_frame(tx, key, AbortCode::from_error(e))),
        }
    }

    // --- Block upload ---

    fn block_upload_command(
        &mut self,
        frame: &CanFrame,
        od: &ObjectDictionary,
        tmr: &mut TimerWheel,
        tx: u16,
    ) -> SdoReply {
        match frame.get_u8(0) & 0x03 {
            0 => self.block_upload_initiate(frame, od, tmr, tx),
            3 => self.block_upload_start(od, tmr, tx),
            2 => self.block_upload_ack(frame, od, tmr, tx),
            _ => {
                // End confirmation: the transfer is complete.
                if self.state == ServerState::BlockUploadEnd {
                    self.release(tmr);
                    SdoReply::default()
                } else {
                    let key = self.key;
                    self.release(tmr);
                    SdoReply::frame(abort_frame(tx, key, AbortCode::DeviceState))
                }
            }
        }
    }

    fn block_upload_initiate(
        &mut self,
        frame: &CanFrame,
        od: &ObjectDictionary,
        tmr: &mut TimerWheel,
        tx: u16,
    ) -> SdoReply {
        let key = request_key(frame);
        if !self.block_enabled {
            return SdoReply::frame(abort_frame(tx, key, AbortCode::InvalidCommand));
        }
        if self.is_busy() {
            self.release(tmr);
        }
        let blksize = frame.get_u8(4);
        if blksize == 0 || blksize > SDO_BLOCK_SEQ_MAX {
            return SdoReply::frame(abort_frame(tx, key, AbortCode::InvalidBlockSize));
        }
        let size = match od.size_of(key).and_then(|s| od.read_bytes(key).map(|_| s)) {
            Ok(size) => size,
            Err(e) => return SdoReply::frame(abort_frame(tx, key, AbortCode::from_error(e))),
        };

        self.state = ServerState::BlockUploadStart;
        self.key = key;
        self.size = size;
        self.offset = 0;
        self.blksize = blksize;
        self.finished = false;
        self.rearm_timeout(tmr);

        let mut response = CanFrame::new(tx);
        response.set_u8(0, 0xC2);
        response.set_u16(1, key.index);
        response.set_u8(3, key.sub_index);
        response.set_u32(4, size as u32);
        response.dlc = 8;
        SdoReply::frame(response)
    }

    fn block_upload_start(
        &mut self,
        od: &ObjectDictionary,
        tmr: &mut TimerWheel,
        tx: u16,
    ) -> SdoReply {
        if self.state != ServerState::BlockUploadStart {
            let key = self.key;
            self.release(tmr);
            return SdoReply::frame(abort_frame(tx, key, AbortCode::DeviceState));
        }
        self.stream_block(od, tmr, tx)
    }

    fn block_upload_ack(
        &mut self,
        frame: &CanFrame,
        od: &ObjectDictionary,
        tmr: &mut TimerWheel,
        tx: u16,
    ) -> SdoReply {
        if self.state != ServerState::BlockUpload {
            let key = self.key;
            self.release(tmr);
            return SdoReply::frame(abort_frame(tx, key, AbortCode::DeviceState));
        }
        let ackseq = frame.get_u8(1);
        let new_blksize = frame.get_u8(2);
        if new_blksize == 0 || new_blksize > SDO_BLOCK_SEQ_MAX {
            let key = self.key;
            self.release(tmr);
            return SdoReply::frame(abort_frame(tx, key, AbortCode::InvalidBlockSize));
        }
        if ackseq > self.seq {
            let key = self.key;
            self.release(tmr);
            return SdoReply::frame(abort_frame(tx, key, AbortCode::InvalidSequenceNumber));
        }

        if ackseq < self.seq {
            // The client saw a gap: rewind to just after the last segment it
            // confirmed and resend from there.
            trace!(
                "SDO server {}: block ack {} of {}, resending",
                self.num, ackseq, self.seq
            );
            self.offset = self.block_base + ackseq as usize * SDO_SEG_LEN;
            self.finished = false;
        }
        self.blksize = new_blksize;

        if self.finished {
            // All data confirmed: announce the unused bytes of the final
            // segment and wait for the client's confirmation.
            let mut response = CanFrame::new(tx);
            response.set_u8(0, 0xC1 | ((SDO_SEG_LEN as u8 - self.last_seg_len) << 2));
            response.dlc = 8;
            self.state = ServerState::BlockUploadEnd;
            self.rearm_timeout(tmr);
            return SdoReply::frame(response);
        }
        self.stream_block(od, tmr, tx)
    }

    /// Streams one block of up to `blksize` segments from the object.
    fn stream_block(&mut self, od: &ObjectDictionary, tmr: &mut TimerWheel, tx: u16) -> SdoReply {
        let mut reply = SdoReply::default();
        self.block_base = self.offset;
        self.seq = 0;
        for seq in 1..=self.blksize {
            let mut segment = CanFrame::new(tx);
            let len = match od.read_segment(self.key, &mut segment.data[1..8], self.offset) {
                Ok(len) => len,
                Err(e) => {
                    let key = self.key;
                    self.release(tmr);
                    return SdoReply::frame(abort_frame(tx, key, AbortCode::from_error(e)));
                }
            };
            self.offset += len;
            self.seq = seq;
            self.last_seg_len = len as u8;
            let last = self.offset >= self.size;
            segment.set_u8(0, seq | ((last as u8) << 7));
            segment.dlc = 8;
            reply.frames.push(segment);
            if last {
                self.finished = true;
                break;
            }
        }
        self.state = ServerState::BlockUpload;
        self.rearm_timeout(tmr);
        reply
    }

    /// Validates the announced size of a download against the target
    /// object: numeric objects need an exact match, variable-sized objects
    /// are bounded by the transfer buffer.
    fn check_download_size(
        &self,
        od: &ObjectDictionary,
        key: ObjectKey,
        announced: usize,
    ) -> Result<(), AbortCode> {
        let entry = od.find(key).map_err(AbortCode::from_error)?;
        if !entry.is_writable() {
            return Err(AbortCode::ReadOnly);
        }
        if entry.value.is_numeric() {
            let size = entry.value.size();
            if announced > size {
                return Err(AbortCode::LengthTooHigh);
            }
            if announced > 0 && announced < size {
                return Err(AbortCode::LengthTooLow);
            }
        } else if announced > self.buf_capacity {
            return Err(AbortCode::LengthTooHigh);
        }
        Ok(())
    }
}

fn request_key(frame: &CanFrame) -> ObjectKey {
    ObjectKey::new(frame.get_u16(1), frame.get_u8(3))
}

fn download_response(tx: u16, key: ObjectKey) -> CanFrame {
    let mut response = CanFrame::new(tx);
    response.set_u8(0, 0x60);
    response.set_u16(1, key.index);
    response.set_u8(3, key.sub_index);
    response.dlc = 8;
    response
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
