// Canonical Huffman codec for the packet message region.
//
// The compressed region replaces the message bytes of a packet (the header
// stays uncompressed; flag bit 0 marks the swap). Layout:
//
//   i32 original_len          decompressed message-region length
//   i32 compressed_bit_len    exact bit count of the data section
//   u8  unique_symbols        leaf count of the serialized tree
//   [tree bits]               pre-order, byte-padded: 0 = internal node,
//                             1 = leaf followed by its 8-bit symbol
//   [data bits]               byte-padded
//
// Bits are packed MSB-first. Tree construction breaks frequency ties by
// insertion order over symbols sorted ascending, so the same input always
// yields the same encoding on every platform.
//
// Compression is skipped (the caller sends the original bytes and clears
// the flag) whenever the compressed total would not be strictly smaller —
// including the degenerate cases: empty input and alphabets of all 256
// byte values (whose leaf count does not fit the u8 field).

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::error::{Result, WireError};

/// Byte size of the fixed preamble (two i32 fields plus the leaf count).
pub const PREAMBLE_LEN: usize = 13;

// Depth guard for tree deserialization; a well-formed tree over at most 255
// leaves never nests deeper than the leaf count.
const MAX_TREE_DEPTH: usize = 256;

/// MSB-first bit packer.
struct BitWriter {
    bytes: Vec<u8>,
    current: u8,
    filled: u8,
}

impl BitWriter {
    fn new() -> BitWriter {
        BitWriter {
            bytes: Vec::new(),
            current: 0,
            filled: 0,
        }
    }

    fn push_bit(&mut self, bit: bool) {
        self.current = (self.current << 1) | u8::from(bit);
        self.filled += 1;
        if self.filled == 8 {
            self.bytes.push(self.current);
            self.current = 0;
            self.filled = 0;
        }
    }

    fn push_bits(&mut self, value: u64, count: u8) {
        for i in (0..count).rev() {
            self.push_bit(value >> i & 1 != 0);
        }
    }

    fn bit_len(&self) -> usize {
        self.bytes.len() * 8 + self.filled as usize
    }

    /// Pad the final partial byte with zeros and return the bytes.
    fn finish(mut self) -> Vec<u8> {
        if self.filled > 0 {
            self.bytes.push(self.current << (8 - self.filled));
        }
        self.bytes
    }
}

/// MSB-first bit reader over a byte slice.
struct BitReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(bytes: &'a [u8]) -> BitReader<'a> {
        BitReader { bytes, pos: 0 }
    }

    fn read_bit(&mut self) -> Result<bool> {
        let byte = self.pos / 8;
        if byte >= self.bytes.len() {
            return Err(WireError::Huffman("bit stream exhausted"));
        }
        let bit = self.bytes[byte] >> (7 - self.pos % 8) & 1 != 0;
        self.pos += 1;
        Ok(bit)
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut value = 0u8;
        for _ in 0..8 {
            value = (value << 1) | u8::from(self.read_bit()?);
        }
        Ok(value)
    }
}

// Arena-allocated tree node. Leaves carry a symbol; internal nodes carry
// child indices.
enum Node {
    Leaf(u8),
    Internal(usize, usize),
}

/// Build the tree over the symbols present in `data`. Returns the arena and
/// the root index. Requires at least one symbol.
fn build_tree(freqs: &[u64; 256]) -> (Vec<Node>, usize) {
    let mut arena = Vec::new();
    let mut heap: BinaryHeap<Reverse<(u64, usize)>> = BinaryHeap::new();
    for symbol in 0u16..256 {
        let f = freqs[symbol as usize];
        if f > 0 {
            arena.push(Node::Leaf(symbol as u8));
            heap.push(Reverse((f, arena.len() - 1)));
        }
    }
    // The arena index doubles as the deterministic tie-breaker: leaves enter
    // in symbol order, merged nodes in creation order.
    while heap.len() > 1 {
        let Reverse((fa, a)) = heap.pop().unwrap();
        let Reverse((fb, b)) = heap.pop().unwrap();
        arena.push(Node::Internal(a, b));
        heap.push(Reverse((fa + fb, arena.len() - 1)));
    }
    let root = heap.pop().unwrap().0 .1;
    (arena, root)
}

/// Assign a code (bits, length) to every symbol by walking the tree.
fn assign_codes(arena: &[Node], root: usize) -> [(u64, u8); 256] {
    let mut codes = [(0u64, 0u8); 256];
    let mut stack = vec![(root, 0u64, 0u8)];
    while let Some((idx, bits, len)) = stack.pop() {
        match arena[idx] {
            Node::Leaf(symbol) => codes[symbol as usize] = (bits, len),
            Node::Internal(left, right) => {
                stack.push((left, bits << 1, len + 1));
                stack.push((right, (bits << 1) | 1, len + 1));
            }
        }
    }
    codes
}

/// Serialize the tree pre-order into `out`.
fn write_tree(arena: &[Node], idx: usize, out: &mut BitWriter) {
    match arena[idx] {
        Node::Leaf(symbol) => {
            out.push_bit(true);
            out.push_bits(symbol as u64, 8);
        }
        Node::Internal(left, right) => {
            out.push_bit(false);
            write_tree(arena, left, out);
            write_tree(arena, right, out);
        }
    }
}

/// Parse a pre-order tree, counting consumed leaves against the declared
/// total.
fn read_tree(
    reader: &mut BitReader<'_>,
    arena: &mut Vec<Node>,
    leaves_left: &mut usize,
    depth: usize,
) -> Result<usize> {
    if depth > MAX_TREE_DEPTH {
        return Err(WireError::Huffman("tree nests too deep"));
    }
    if reader.read_bit()? {
        if *leaves_left == 0 {
            return Err(WireError::Huffman("more leaves than declared"));
        }
        *leaves_left -= 1;
        arena.push(Node::Leaf(reader.read_byte()?));
        Ok(arena.len() - 1)
    } else {
        let left = read_tree(reader, arena, leaves_left, depth + 1)?;
        let right = read_tree(reader, arena, leaves_left, depth + 1)?;
        arena.push(Node::Internal(left, right));
        Ok(arena.len() - 1)
    }
}

/// Compress a message region. Returns `None` when compression would not
/// strictly shrink it (the caller then sends the original uncompressed).
pub fn compress(message: &[u8]) -> Option<Vec<u8>> {
    if message.is_empty() {
        return None;
    }
    let mut freqs = [0u64; 256];
    for &b in message {
        freqs[b as usize] += 1;
    }
    let unique = freqs.iter().filter(|&&f| f > 0).count();
    if unique > u8::MAX as usize {
        return None;
    }

    let (arena, root) = build_tree(&freqs);

    let mut tree_bits = BitWriter::new();
    write_tree(&arena, root, &mut tree_bits);
    let tree_bytes = tree_bits.finish();

    let mut data_bits = BitWriter::new();
    if unique > 1 {
        let codes = assign_codes(&arena, root);
        for &b in message {
            let (bits, len) = codes[b as usize];
            data_bits.push_bits(bits, len);
        }
    }
    // A single-symbol alphabet needs no data bits: the decoder replicates
    // the lone leaf original_len times.
    let compressed_bit_len = data_bits.bit_len();
    let data_bytes = data_bits.finish();

    let total = PREAMBLE_LEN + tree_bytes.len() + data_bytes.len();
    if total >= message.len() {
        return None;
    }

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(message.len() as i32).to_le_bytes());
    out.extend_from_slice(&(compressed_bit_len as i32).to_le_bytes());
    out.push(unique as u8);
    out.extend_from_slice(&tree_bytes);
    out.extend_from_slice(&data_bytes);
    Some(out)
}

/// Decompress a region produced by [`compress`].
pub fn decompress(region: &[u8]) -> Result<Vec<u8>> {
    if region.len() < PREAMBLE_LEN {
        return Err(WireError::Huffman("region shorter than preamble"));
    }
    let original_len = i32::from_le_bytes(region[0..4].try_into().unwrap());
    let compressed_bit_len = i32::from_le_bytes(region[4..8].try_into().unwrap());
    let unique = region[12] as usize;
    if original_len < 0 || compressed_bit_len < 0 {
        return Err(WireError::Huffman("negative length field"));
    }
    let original_len = original_len as usize;
    if original_len > crate::packet::MAX_FRAME_LEN {
        return Err(WireError::Huffman("declared length exceeds frame limit"));
    }
    if unique == 0 {
        return if original_len == 0 {
            Ok(Vec::new())
        } else {
            Err(WireError::Huffman("no symbols for nonempty output"))
        };
    }

    let body = &region[PREAMBLE_LEN..];
    let mut tree_reader = BitReader::new(body);
    let mut arena = Vec::new();
    let mut leaves_left = unique;
    let root = read_tree(&mut tree_reader, &mut arena, &mut leaves_left, 0)?;
    if leaves_left != 0 {
        return Err(WireError::Huffman("fewer leaves than declared"));
    }
    let tree_bytes = tree_reader.pos.div_ceil(8);

    if let Node::Leaf(symbol) = arena[root] {
        // Single-symbol alphabet: zero data bits.
        return Ok(vec![symbol; original_len]);
    }

    let data = &body[tree_bytes..];
    let mut reader = BitReader::new(data);
    let mut out = Vec::with_capacity(original_len);
    while out.len() < original_len {
        let mut idx = root;
        loop {
            match arena[idx] {
                Node::Leaf(symbol) => {
                    out.push(symbol);
                    break;
                }
                Node::Internal(left, right) => {
                    idx = if reader.read_bit()? { right } else { left };
                }
            }
        }
    }
    if reader.pos != compressed_bit_len as usize {
        return Err(WireError::Huffman("bit length mismatch"));
    }
    Ok(out)
}
