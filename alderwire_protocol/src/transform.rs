// Transform pipeline: ordered steps applied to whole packet frames.
//
// A pipeline holds `{priority, step}` pairs in ascending priority order.
// `apply_send` runs the steps low-to-high immediately before the socket
// write; `apply_receive` runs them low-to-high right after the socket read.
// Running receive in the same direction keeps the bandwidth recorder at
// priority 0 observing wire bytes (before decompression at 100), and the
// one at 200 observing wire bytes on send (after compression).
//
// Steps see the whole frame including the 28-byte header. The compression
// step owns header flag bit 0 and rewrites `total_len` when it swaps the
// message region.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Result, WireError};
use crate::huffman;
use crate::packet::{PacketHeader, FLAG_COMPRESSED, HEADER_LEN};

/// Priority of the inbound bandwidth recorder.
pub const PRIORITY_INCOMING_BANDWIDTH: i32 = 0;
/// Priority of the compression step.
pub const PRIORITY_COMPRESSION: i32 = 100;
/// Priority of the outbound bandwidth recorder.
pub const PRIORITY_OUTGOING_BANDWIDTH: i32 = 200;

/// A single pipeline step. Implementations must tolerate frames they did
/// not produce (inbound frames come from the network).
pub trait TransformStep: Send {
    /// Applied to an outbound frame before the socket write.
    fn on_send(&self, frame: &mut Vec<u8>) -> Result<()>;

    /// Applied to an inbound frame after the socket read.
    fn on_receive(&self, frame: &mut Vec<u8>) -> Result<()>;
}

/// Ordered list of transform steps.
pub struct TransformPipeline {
    steps: Vec<(i32, Box<dyn TransformStep>)>,
}

impl TransformPipeline {
    pub fn new() -> TransformPipeline {
        TransformPipeline { steps: Vec::new() }
    }

    /// Insert a step at the given priority. Two steps cannot share one
    /// priority slot.
    pub fn insert(&mut self, priority: i32, step: Box<dyn TransformStep>) -> Result<()> {
        match self.steps.binary_search_by_key(&priority, |(p, _)| *p) {
            Ok(_) => Err(WireError::DuplicatePriority(priority)),
            Err(index) => {
                self.steps.insert(index, (priority, step));
                Ok(())
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn apply_send(&self, frame: &mut Vec<u8>) -> Result<()> {
        for (_, step) in &self.steps {
            step.on_send(frame)?;
        }
        Ok(())
    }

    pub fn apply_receive(&self, frame: &mut Vec<u8>) -> Result<()> {
        for (_, step) in &self.steps {
            step.on_receive(frame)?;
        }
        Ok(())
    }
}

impl Default for TransformPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Compression step. Swaps the message region for its Huffman-compressed
/// form when that is strictly smaller, and marks the swap in the header.
pub struct CompressionStep {
    enabled: bool,
}

impl CompressionStep {
    pub fn new(enabled: bool) -> CompressionStep {
        CompressionStep { enabled }
    }
}

fn set_total_len(frame: &mut [u8], total: usize) {
    frame[12..16].copy_from_slice(&(total as i32).to_le_bytes());
}

impl TransformStep for CompressionStep {
    fn on_send(&self, frame: &mut Vec<u8>) -> Result<()> {
        if frame.len() < HEADER_LEN {
            return Err(WireError::UnexpectedEof {
                needed: HEADER_LEN - frame.len(),
            });
        }
        frame[24] &= !FLAG_COMPRESSED;
        if !self.enabled || frame.len() == HEADER_LEN {
            return Ok(());
        }
        if let Some(region) = huffman::compress(&frame[HEADER_LEN..]) {
            frame.truncate(HEADER_LEN);
            frame.extend_from_slice(&region);
            frame[24] |= FLAG_COMPRESSED;
            let total = frame.len();
            set_total_len(frame, total);
        }
        Ok(())
    }

    fn on_receive(&self, frame: &mut Vec<u8>) -> Result<()> {
        let header = PacketHeader::parse(frame)?;
        if !header.is_compressed() {
            return Ok(());
        }
        let message = huffman::decompress(&frame[HEADER_LEN..])?;
        frame.truncate(HEADER_LEN);
        frame.extend_from_slice(&message);
        frame[24] &= !FLAG_COMPRESSED;
        let total = frame.len();
        set_total_len(frame, total);
        Ok(())
    }
}

/// Byte and packet counters, updated only from the I/O thread but readable
/// anywhere.
#[derive(Default)]
pub struct BandwidthMeter {
    bytes_sent: AtomicU64,
    packets_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_received: AtomicU64,
}

/// Point-in-time copy of the meter's counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BandwidthSnapshot {
    pub bytes_sent: u64,
    pub packets_sent: u64,
    pub bytes_received: u64,
    pub packets_received: u64,
}

impl BandwidthMeter {
    pub fn new() -> Arc<BandwidthMeter> {
        Arc::new(BandwidthMeter::default())
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BandwidthSnapshot {
        BandwidthSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
        }
    }
}

/// Which side of the wire a bandwidth recorder observes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Records frame sizes into a shared [`BandwidthMeter`]. Install one at
/// priority 0 (incoming) and one at 200 (outgoing) to measure wire bytes on
/// both sides of the compression step.
pub struct BandwidthStep {
    direction: Direction,
    meter: Arc<BandwidthMeter>,
}

impl BandwidthStep {
    pub fn new(direction: Direction, meter: Arc<BandwidthMeter>) -> BandwidthStep {
        BandwidthStep { direction, meter }
    }
}

impl TransformStep for BandwidthStep {
    fn on_send(&self, frame: &mut Vec<u8>) -> Result<()> {
        if self.direction == Direction::Outgoing {
            self.meter.record_sent(frame.len());
        }
        Ok(())
    }

    fn on_receive(&self, frame: &mut Vec<u8>) -> Result<()> {
        if self.direction == Direction::Incoming {
            self.meter.record_received(frame.len());
        }
        Ok(())
    }
}
