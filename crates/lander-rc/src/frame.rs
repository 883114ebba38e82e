//! Framing of the hand-controller byte stream: `'$' '$' <len> <payload>`.

use bytes::{Buf, Bytes, BytesMut};
use tracing::debug;

use crate::command::RcCommand;

pub const FRAME_MARKER: u8 = b'$';
pub const HEADER_LEN: usize = 3;
pub const MSG_STATE: u8 = 0x40;
/// type + buttons + 3 x u16
pub const STATE_PAYLOAD_LEN: usize = 8;
pub const RX_CAPACITY: usize = 512;

/// Bounded receive buffer. Bytes arrive from the serial reader; complete
/// frames are drained by the parser. When full, the oldest bytes are dropped.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    capacity: usize,
    discarded: u64,
    overflowed: u64,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::with_capacity(RX_CAPACITY)
    }
}

impl FrameBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(HEADER_LEN + u8::MAX as usize);
        Self { buf: BytesMut::with_capacity(capacity), capacity, discarded: 0, overflowed: 0 }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes thrown away while hunting for a frame marker.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Bytes evicted because the buffer was full.
    pub fn overflowed(&self) -> u64 {
        self.overflowed
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > self.capacity {
            let excess = self.buf.len() - self.capacity;
            self.buf.advance(excess);
            self.overflowed += excess as u64;
        }
    }

    /// Next complete frame payload, resynchronizing one byte at a time on
    /// anything that is not a `$$` header. `None` until a full frame is buffered.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        let before = self.discarded;
        let frame = self.take_frame();
        if self.discarded > before {
            debug!("rc: resync skipped {} bytes", self.discarded - before);
        }
        frame
    }

    fn take_frame(&mut self) -> Option<Bytes> {
        loop {
            let first = *self.buf.first()?;
            if first != FRAME_MARKER {
                self.skip_byte();
                continue;
            }

            let second = *self.buf.get(1)?;
            if second != FRAME_MARKER {
                self.skip_byte();
                continue;
            }

            let len = *self.buf.get(2)? as usize;
            if self.buf.len() < HEADER_LEN + len {
                return None;
            }

            self.buf.advance(HEADER_LEN);
            return Some(self.buf.split_to(len).freeze());
        }
    }

    /// Drains every complete frame and decodes the state frames among them.
    pub fn drain_commands(&mut self) -> Vec<RcCommand> {
        let mut out = Vec::new();
        while let Some(frame) = self.next_frame() {
            if let Some(cmd) = decode_payload(&frame) {
                out.push(cmd);
            }
        }
        out
    }

    fn skip_byte(&mut self) {
        self.buf.advance(1);
        self.discarded += 1;
    }
}

/// Decodes a state frame payload. Other message types and short payloads
/// yield `None`.
pub fn decode_payload(payload: &[u8]) -> Option<RcCommand> {
    match payload.first() {
        Some(&MSG_STATE) if payload.len() >= STATE_PAYLOAD_LEN => {
            let axis = |i: usize| u16::from_le_bytes([payload[i], payload[i + 1]]);
            Some(RcCommand::new(payload[1], axis(2), axis(4), axis(6)))
        }
        Some(&MSG_STATE) => {
            debug!("rc: short state frame ({} bytes)", payload.len());
            None
        }
        Some(other) => {
            debug!("rc: ignoring message type 0x{:02x}", other);
            None
        }
        None => None,
    }
}

/// Encodes a state frame, header included.
pub fn encode_state(cmd: &RcCommand) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + STATE_PAYLOAD_LEN);
    out.extend_from_slice(&[FRAME_MARKER, FRAME_MARKER, STATE_PAYLOAD_LEN as u8, MSG_STATE, cmd.buttons]);
    for raw in cmd.axis_raw {
        out.extend_from_slice(&raw.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{BTN_ROCKER_UP, BTN_SWITCH_RED};

    #[test]
    fn decodes_little_endian_axes() {
        let mut fb = FrameBuffer::default();
        fb.push(&[0x24, 0x24, 0x08, 0x40, 0x11, 0xff, 0x03, 0x00, 0x02, 0x01, 0x00]);
        let cmds = fb.drain_commands();
        assert_eq!(cmds, vec![RcCommand::new(BTN_SWITCH_RED | BTN_ROCKER_UP, 1023, 512, 1)]);
        assert!(fb.is_empty());
    }

    #[test]
    fn stray_byte_before_frame_is_discarded() {
        // length 8 so the frame after the stray byte is a complete state frame
        let mut fb = FrameBuffer::default();
        fb.push(&[0x24, 0x41, 0x24, 0x24, 0x08, 0x40, 0x02, 0x00, 0x02, 0x00, 0x02, 0x00, 0x02]);
        let cmds = fb.drain_commands();
        assert_eq!(cmds, vec![RcCommand::new(0x02, 512, 512, 512)]);
        assert_eq!(fb.discarded(), 2);
    }

    #[test]
    fn stray_byte_then_one_byte_state_frame() {
        // a 1-byte 0x40 payload carries no buttons or axes: consumed, not decoded
        let mut fb = FrameBuffer::default();
        fb.push(&[0x24, 0x41, 0x24, 0x24, 0x01, 0x40]);
        fb.push(&encode_state(&RcCommand::new(BTN_SWITCH_RED, 0, 512, 1023)));
        assert_eq!(fb.drain_commands(), vec![RcCommand::new(BTN_SWITCH_RED, 0, 512, 1023)]);
        assert_eq!(fb.discarded(), 2);
        assert!(fb.is_empty());
    }

    #[test]
    fn frame_split_across_reads_waits_for_payload() {
        let frame = encode_state(&RcCommand::new(0x10, 100, 200, 300));
        let mut fb = FrameBuffer::default();
        fb.push(&frame[..5]);
        assert!(fb.drain_commands().is_empty());
        assert_eq!(fb.len(), 5);
        fb.push(&frame[5..]);
        assert_eq!(fb.drain_commands(), vec![RcCommand::new(0x10, 100, 200, 300)]);
    }

    #[test]
    fn back_to_back_frames_all_decode() {
        let mut bytes = Vec::new();
        for i in 0..4u16 {
            bytes.extend(encode_state(&RcCommand::new(i as u8, i, i, i)));
        }
        let mut fb = FrameBuffer::default();
        fb.push(&bytes);
        assert_eq!(fb.drain_commands().len(), 4);
    }

    #[test]
    fn garbage_only_never_yields_frames() {
        let mut fb = FrameBuffer::default();
        fb.push(b"hello world, no markers here");
        assert!(fb.drain_commands().is_empty());
        assert!(fb.is_empty());
    }

    #[test]
    fn short_and_foreign_frames_are_consumed() {
        let mut fb = FrameBuffer::default();
        fb.push(&[0x24, 0x24, 0x01, 0x40]);
        fb.push(&[0x24, 0x24, 0x02, 0x41, 0x00]);
        fb.push(&encode_state(&RcCommand::new(0, 1, 2, 3)));
        assert_eq!(fb.drain_commands(), vec![RcCommand::new(0, 1, 2, 3)]);
        assert!(fb.is_empty());
    }

    #[test]
    fn overflow_drops_oldest_bytes() {
        let mut fb = FrameBuffer::with_capacity(RX_CAPACITY);
        fb.push(&vec![0u8; RX_CAPACITY]);
        fb.push(&encode_state(&RcCommand::new(0, 7, 7, 7)));
        assert_eq!(fb.len(), RX_CAPACITY);
        assert_eq!(fb.overflowed(), (HEADER_LEN + STATE_PAYLOAD_LEN) as u64);
        assert_eq!(fb.drain_commands(), vec![RcCommand::new(0, 7, 7, 7)]);
    }
}
