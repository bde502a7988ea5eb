// Packet container: fixed header, length-prefixed message framing, and
// in-place fragmentation.
//
// A `Packet` stacks typed messages into a single outbound buffer. When the
// running total crosses the configured size budget, the overflowing message
// and everything after it are deferred to the next emit/reset cycle — a
// message is never split across fragments. The receiving side reassembles
// with `PacketAssembler`, which tolerates arbitrary read boundaries (a TCP
// read may end mid-header or mid-message).
//
// Wire layout (all integers little-endian):
//
//   u16 protocol_version
//   u16 app_version
//   i64 timestamp_ms        millis since Unix epoch
//   i32 total_len           whole packet including this header
//   u32 sender_id           0 from servers/relays
//   u32 sender_secret       0 from servers and in admission packets
//   u8  flags               bit 0 = compression; bits 1-7 free for the app
//   u8  reserved[3]         zero on send, ignored on receive
//
// followed by `[i32 len][len bytes]` message frames until `total_len`.
//
// See also: `transform.rs` (steps run over the emitted frame, and the
// compression step rewrites `total_len`).

use crate::error::{Result, WireError};
use crate::types::ClientId;

/// Fixed header size: 25 bytes of fields padded to 28 with three reserved
/// bytes.
pub const HEADER_LEN: usize = 28;

/// Header flag bit 0: the message region is Huffman-compressed.
pub const FLAG_COMPRESSED: u8 = 0x01;

/// Upper bound on a single reassembled frame. Protects against unbounded
/// allocation from a malformed or malicious length field.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Parsed form of the 28-byte packet header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub protocol_version: u16,
    pub app_version: u16,
    pub timestamp_ms: i64,
    pub total_len: i32,
    pub sender_id: ClientId,
    pub sender_secret: u32,
    pub flags: u8,
}

impl PacketHeader {
    /// Serialize into the first [`HEADER_LEN`] bytes of `buf`.
    pub fn write_into(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.protocol_version.to_le_bytes());
        buf[2..4].copy_from_slice(&self.app_version.to_le_bytes());
        buf[4..12].copy_from_slice(&self.timestamp_ms.to_le_bytes());
        buf[12..16].copy_from_slice(&self.total_len.to_le_bytes());
        buf[16..20].copy_from_slice(&self.sender_id.0.to_le_bytes());
        buf[20..24].copy_from_slice(&self.sender_secret.to_le_bytes());
        buf[24] = self.flags;
        buf[25..28].fill(0);
    }

    /// Parse the first [`HEADER_LEN`] bytes of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<PacketHeader> {
        if bytes.len() < HEADER_LEN {
            return Err(WireError::UnexpectedEof {
                needed: HEADER_LEN - bytes.len(),
            });
        }
        let header = PacketHeader {
            protocol_version: u16::from_le_bytes([bytes[0], bytes[1]]),
            app_version: u16::from_le_bytes([bytes[2], bytes[3]]),
            timestamp_ms: i64::from_le_bytes(bytes[4..12].try_into().unwrap()),
            total_len: i32::from_le_bytes(bytes[12..16].try_into().unwrap()),
            sender_id: ClientId(u32::from_le_bytes(bytes[16..20].try_into().unwrap())),
            sender_secret: u32::from_le_bytes(bytes[20..24].try_into().unwrap()),
            flags: bytes[24],
        };
        if (header.total_len as usize) < HEADER_LEN && header.total_len >= 0 {
            return Err(WireError::BadHeader("total_len shorter than header"));
        }
        if header.total_len < 0 {
            return Err(WireError::BadHeader("negative total_len"));
        }
        Ok(header)
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }
}

/// Outbound packet builder with fragmentation.
///
/// Each peer/transport pair owns one `Packet`; it is filled between sends
/// and reset afterwards. The builder never shrinks its backing store.
pub struct Packet {
    buf: Vec<u8>,
    tail: usize,
    budget: usize,
    split_at: Option<usize>,
}

impl Packet {
    /// Create a builder with the given fragment size budget (the configured
    /// buffer size). The budget must exceed the header size.
    pub fn outbound(budget: usize) -> Packet {
        let budget = budget.max(HEADER_LEN + 8);
        Packet {
            buf: vec![0u8; budget],
            tail: HEADER_LEN,
            budget,
            split_at: None,
        }
    }

    /// Reserve a length-prefixed region of `n` bytes and return it for the
    /// caller to fill. Doubles the backing store when full. The first time
    /// the running total crosses the budget, the tail before this message is
    /// recorded as the end of the current fragment.
    pub fn reserve(&mut self, n: usize) -> &mut [u8] {
        let start = self.tail;
        let end = start + 4 + n;
        if self.buf.len() < end {
            let mut new_len = self.buf.len().max(1);
            while new_len < end {
                new_len *= 2;
            }
            self.buf.resize(new_len, 0);
        }
        // A lone oversized message still goes out whole in its own fragment,
        // so no split is recorded when the overflow starts at the header.
        if self.split_at.is_none() && end > self.budget && start > HEADER_LEN {
            self.split_at = Some(start);
        }
        self.buf[start..start + 4].copy_from_slice(&(n as i32).to_le_bytes());
        self.tail = end;
        &mut self.buf[start + 4..end]
    }

    /// Append a complete message payload.
    pub fn push_message(&mut self, payload: &[u8]) {
        self.reserve(payload.len()).copy_from_slice(payload);
    }

    /// Whether any message bytes are queued in the current fragment.
    pub fn has_messages(&self) -> bool {
        self.tail > HEADER_LEN
    }

    /// Whether messages beyond the current fragment are deferred.
    pub fn is_fragmented(&self) -> bool {
        self.split_at.is_some()
    }

    /// Number of message bytes in the current fragment (excluding deferred
    /// ones).
    pub fn fragment_len(&self) -> usize {
        self.split_at.unwrap_or(self.tail)
    }

    /// Serialize `header` (with `total_len` set to the fragment end) and
    /// return the ready-to-send fragment.
    pub fn emit(&mut self, header: &mut PacketHeader) -> &[u8] {
        let end = self.split_at.unwrap_or(self.tail);
        header.total_len = end as i32;
        let mut head = [0u8; HEADER_LEN];
        header.write_into(&mut head);
        self.buf[..HEADER_LEN].copy_from_slice(&head);
        &self.buf[..end]
    }

    /// Drop everything queued, deferred messages included. The datagram
    /// path uses this instead of `reset`: UDP never fragments, so overflow
    /// is discarded rather than deferred.
    pub fn clear(&mut self) {
        self.tail = HEADER_LEN;
        self.split_at = None;
    }

    /// Discard the emitted fragment. Deferred messages shift to the front
    /// and the next fragment end is recomputed against the same budget.
    pub fn reset(&mut self) {
        match self.split_at.take() {
            None => self.tail = HEADER_LEN,
            Some(split) => {
                self.buf.copy_within(split..self.tail, HEADER_LEN);
                self.tail = HEADER_LEN + (self.tail - split);
                let mut pos = HEADER_LEN;
                while pos < self.tail {
                    let len =
                        i32::from_le_bytes(self.buf[pos..pos + 4].try_into().unwrap()) as usize;
                    let end = pos + 4 + len;
                    if end > self.budget && pos > HEADER_LEN {
                        self.split_at = Some(pos);
                        break;
                    }
                    pos = end;
                }
            }
        }
    }
}

/// Incremental reassembler for inbound packets.
///
/// Feed it whatever the socket produced; it consumes up to one packet's
/// worth of bytes per call and reports how many it took. Once complete, the
/// frame is taken out whole and the assembler is ready for the next packet.
pub struct PacketAssembler {
    buf: Vec<u8>,
    expected: Option<usize>,
}

impl PacketAssembler {
    pub fn new() -> PacketAssembler {
        PacketAssembler {
            buf: Vec::new(),
            expected: None,
        }
    }

    /// Consume bytes toward the current packet. Returns how many bytes were
    /// taken from `bytes`; the caller re-feeds the remainder after taking
    /// the completed frame.
    pub fn ingest(&mut self, bytes: &[u8]) -> Result<usize> {
        let mut consumed = 0;

        if self.expected.is_none() {
            let need = HEADER_LEN - self.buf.len();
            let take = need.min(bytes.len());
            self.buf.extend_from_slice(&bytes[..take]);
            consumed += take;
            if self.buf.len() < HEADER_LEN {
                return Ok(consumed);
            }
            let header = PacketHeader::parse(&self.buf)?;
            let total = header.total_len as usize;
            if total > MAX_FRAME_LEN {
                return Err(WireError::PacketTooLarge {
                    field: total,
                    limit: MAX_FRAME_LEN,
                });
            }
            self.buf.reserve(total - self.buf.len());
            self.expected = Some(total);
        }

        let total = self.expected.unwrap();
        let need = total - self.buf.len();
        let take = need.min(bytes.len() - consumed);
        self.buf
            .extend_from_slice(&bytes[consumed..consumed + take]);
        consumed += take;
        Ok(consumed)
    }

    /// Whether a full packet has been assembled.
    pub fn is_complete(&self) -> bool {
        matches!(self.expected, Some(total) if self.buf.len() == total)
    }

    /// Take the completed frame, resetting for the next packet. Returns
    /// `None` while incomplete.
    pub fn take_frame(&mut self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        self.expected = None;
        Some(std::mem::take(&mut self.buf))
    }

    /// Drop any partial state (used when a connection closes mid-packet).
    pub fn clear(&mut self) {
        self.buf.clear();
        self.expected = None;
    }
}

impl Default for PacketAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterate the `[i32 len][bytes]` message frames of a completed packet.
/// Yields an error (then stops) if a length prefix is malformed.
pub fn iter_messages(frame: &[u8]) -> MessageIter<'_> {
    MessageIter {
        rest: if frame.len() > HEADER_LEN {
            &frame[HEADER_LEN..]
        } else {
            &[]
        },
        poisoned: false,
    }
}

pub struct MessageIter<'a> {
    rest: &'a [u8],
    poisoned: bool,
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = Result<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.poisoned || self.rest.is_empty() {
            return None;
        }
        if self.rest.len() < 4 {
            self.poisoned = true;
            return Some(Err(WireError::UnexpectedEof {
                needed: 4 - self.rest.len(),
            }));
        }
        let len = i32::from_le_bytes(self.rest[..4].try_into().unwrap());
        if len < 0 || self.rest.len() - 4 < len as usize {
            self.poisoned = true;
            return Some(Err(WireError::BadLengthPrefix {
                len: len.max(0) as usize,
                remaining: self.rest.len() - 4,
            }));
        }
        let (message, rest) = self.rest[4..].split_at(len as usize);
        self.rest = rest;
        Some(Ok(message))
    }
}
