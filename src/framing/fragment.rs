// ABOUTME: Header/payload state machine for one in-progress length-prefixed packet
// ABOUTME: A single Fragment is recycled across every packet on a connection

use bytes::{Buf, Bytes, BytesMut};
use std::any::Any;

/// The mutable carrier of one in-progress packet.
///
/// `Fragment` is deliberately the only heap-allocating state the framing engine keeps
/// per connection beyond the read buffer itself: the same instance is reused, packet
/// after packet, via [`Fragment::recycle`]. `tag` is the one field that survives a
/// recycle — it's a caller-owned slot that outlives individual packets (the
/// single-instance coordinator uses it to carry per-connection state across several
/// packets; see `single_instance.rs`).
pub struct Fragment {
    header_buf: [u8; 8],
    header_filled: usize,
    header_size: usize,
    full_length: Option<u64>,
    cumulative_read_count: u64,
    current_offset: u64,
    window: Bytes,
    length_found: bool,
    completed: bool,
    accumulator: Option<BytesMut>,
    accumulate_next: bool,
    tag: Option<Box<dyn Any + Send>>,
}

impl Default for Fragment {
    fn default() -> Self {
        Self::new()
    }
}

impl Fragment {
    pub fn new() -> Self {
        Fragment {
            header_buf: [0u8; 8],
            header_filled: 0,
            header_size: 4,
            full_length: None,
            cumulative_read_count: 0,
            current_offset: 0,
            window: Bytes::new(),
            length_found: false,
            completed: false,
            accumulator: None,
            accumulate_next: false,
            tag: None,
        }
    }

    /// Decoded payload length, once the header has been fully read.
    pub fn full_length(&self) -> Option<u64> {
        self.full_length
    }

    /// Offset within the payload where [`Fragment::window`] begins.
    pub fn current_offset(&self) -> u64 {
        self.current_offset
    }

    /// The bytes delivered by the most recent [`Fragment::step`] call.
    pub fn window(&self) -> &[u8] {
        &self.window
    }

    /// Total payload bytes captured so far.
    pub fn cumulative_read_count(&self) -> u64 {
        self.cumulative_read_count
    }

    /// Whether the header has been fully decoded.
    pub fn length_found(&self) -> bool {
        self.length_found
    }

    /// Whether a header is partway through being read (so the header size/accumulate
    /// flag for this packet is already latched and must not be recomputed).
    pub fn header_started(&self) -> bool {
        self.header_filled > 0
    }

    /// Whether the packet currently in progress has been fully captured.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn tag(&self) -> Option<&(dyn Any + Send)> {
        self.tag.as_deref()
    }

    pub fn tag_mut(&mut self) -> Option<&mut (dyn Any + Send)> {
        self.tag.as_deref_mut()
    }

    pub fn set_tag(&mut self, tag: Box<dyn Any + Send>) {
        self.tag = Some(tag);
    }

    /// Consume one delivery's worth of bytes from `buf`, mutating in place.
    ///
    /// `header_size` (4 or 8) only takes effect at the start of a fresh packet —
    /// callers select it by arming `read_next_as_long` before the packet's first byte
    /// arrives. `want_accumulate` likewise only takes effect at the start of a fresh
    /// packet and controls whether a whole-packet buffer is built alongside the
    /// per-read windows.
    ///
    /// Returns `Some(())` once a payload window (possibly empty, for a zero-length
    /// packet) is ready for [`Fragment::window`]/[`Fragment::is_completed`] inspection.
    /// Returns `None` when `buf` was exhausted before a full header or any payload
    /// bytes could be produced — callers should feed more bytes and call again. A
    /// single call only ever produces at most one delivery; residual bytes in `buf`
    /// after a completed packet must be re-fed by calling `step` again following
    /// [`Fragment::recycle`].
    pub fn step(&mut self, buf: &mut BytesMut, header_size: usize, want_accumulate: bool) -> Option<()> {
        loop {
            if !self.length_found {
                if self.header_filled == 0 {
                    self.header_size = header_size;
                    self.accumulate_next = want_accumulate;
                }
                let need = self.header_size - self.header_filled;
                let take = need.min(buf.len());
                if take == 0 {
                    return None;
                }
                self.header_buf[self.header_filled..self.header_filled + take]
                    .copy_from_slice(&buf[..take]);
                buf.advance(take);
                self.header_filled += take;
                if self.header_filled < self.header_size {
                    return None;
                }

                let decoded = if self.header_size == 4 {
                    u32::from_be_bytes(self.header_buf[0..4].try_into().unwrap()) as u64
                } else {
                    u64::from_be_bytes(self.header_buf[0..8].try_into().unwrap())
                };
                self.full_length = Some(decoded);
                self.length_found = true;
                if self.accumulate_next {
                    self.accumulator = Some(BytesMut::with_capacity(decoded.min(64 * 1024) as usize));
                }

                if decoded == 0 {
                    self.current_offset = 0;
                    self.window = Bytes::new();
                    self.completed = true;
                    return Some(());
                }
                continue;
            }

            let remaining = self.full_length.unwrap() - self.cumulative_read_count;
            let take = (remaining.min(buf.len() as u64)) as usize;
            if take == 0 {
                return None;
            }
            let window = buf.split_to(take).freeze();
            if let Some(acc) = self.accumulator.as_mut() {
                acc.extend_from_slice(&window);
            }
            self.current_offset = self.cumulative_read_count;
            self.cumulative_read_count += take as u64;
            self.window = window;
            self.completed = self.cumulative_read_count == self.full_length.unwrap();
            return Some(());
        }
    }

    /// Take the accumulated whole-packet buffer, if whole-packet delivery was
    /// requested and the packet just completed. Call only after `is_completed()`.
    pub fn take_accumulated(&mut self) -> Option<Bytes> {
        self.accumulator.take().map(|b| b.freeze())
    }

    /// Reset per-packet state so the next call to `step` starts a fresh packet.
    /// `tag` is preserved across recycles.
    pub fn recycle(&mut self) {
        self.header_filled = 0;
        self.header_size = 4;
        self.full_length = None;
        self.cumulative_read_count = 0;
        self.current_offset = 0;
        self.window = Bytes::new();
        self.length_found = false;
        self.completed = false;
        self.accumulator = None;
        self.accumulate_next = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_read_whole_packet() {
        let mut buf = BytesMut::from(&b"\x00\x00\x00\x04ABCD"[..]);
        let mut f = Fragment::new();
        assert!(f.step(&mut buf, 4, false).is_some());
        assert_eq!(f.window(), b"ABCD");
        assert!(f.is_completed());
        assert_eq!(f.cumulative_read_count(), 4);
    }

    #[test]
    fn header_split_across_two_feeds() {
        let mut f = Fragment::new();
        let mut buf = BytesMut::from(&b"\x00\x00"[..]);
        assert!(f.step(&mut buf, 4, false).is_none());
        let mut buf2 = BytesMut::from(&b"\x00\x04ABCD"[..]);
        assert!(f.step(&mut buf2, 4, false).is_some());
        assert_eq!(f.window(), b"ABCD");
        assert!(f.is_completed());
    }

    #[test]
    fn two_packets_in_one_read_require_recycle_between() {
        let mut buf = BytesMut::from(&b"\x00\x00\x00\x04AAAA\x00\x00\x00\x04BBBB"[..]);
        let mut f = Fragment::new();
        assert!(f.step(&mut buf, 4, false).is_some());
        assert_eq!(f.window(), b"AAAA");
        assert!(f.is_completed());
        f.recycle();
        assert!(f.step(&mut buf, 4, false).is_some());
        assert_eq!(f.window(), b"BBBB");
        assert!(f.is_completed());
        assert!(buf.is_empty());
    }

    #[test]
    fn payload_split_across_two_feeds() {
        let mut f = Fragment::new();
        let mut buf = BytesMut::from(&b"\x00\x00\x00\x04AB"[..]);
        assert!(f.step(&mut buf, 4, false).is_some());
        assert_eq!(f.window(), b"AB");
        assert!(!f.is_completed());
        let mut buf2 = BytesMut::from(&b"CD"[..]);
        assert!(f.step(&mut buf2, 4, false).is_some());
        assert_eq!(f.window(), b"CD");
        assert!(f.is_completed());
        assert_eq!(f.cumulative_read_count(), 4);
    }

    #[test]
    fn sixty_four_bit_header() {
        let mut buf = BytesMut::from(&b"\x00\x00\x00\x00\x00\x00\x00\x03XYZ"[..]);
        let mut f = Fragment::new();
        assert!(f.step(&mut buf, 8, false).is_some());
        assert_eq!(f.window(), b"XYZ");
        assert_eq!(f.full_length(), Some(3));
    }

    #[test]
    fn zero_length_payload_completes_immediately() {
        let mut buf = BytesMut::from(&b"\x00\x00\x00\x00"[..]);
        let mut f = Fragment::new();
        assert!(f.step(&mut buf, 4, false).is_some());
        assert!(f.is_completed());
        assert_eq!(f.window(), b"");
    }

    #[test]
    fn accumulator_collects_whole_packet() {
        let mut f = Fragment::new();
        let mut buf = BytesMut::from(&b"\x00\x00\x00\x04A"[..]);
        f.step(&mut buf, 4, true);
        let mut buf2 = BytesMut::from(&b"BCD"[..]);
        f.step(&mut buf2, 4, true);
        assert!(f.is_completed());
        assert_eq!(f.take_accumulated().unwrap(), Bytes::from_static(b"ABCD"));
    }

    #[test]
    fn tag_survives_recycle() {
        let mut f = Fragment::new();
        f.set_tag(Box::new(7u32));
        f.recycle();
        assert_eq!(f.tag().unwrap().downcast_ref::<u32>().copied(), Some(7));
    }
}
