// Bounded compound encodables.
//
// Containers that cross the wire carry a compile-time capacity parameter:
// the encoded form is `[i32 count][elements…]` and `count <= N` is enforced
// on both the write and the read path, so a malicious peer cannot force an
// unbounded allocation by lying in the count field. This mirrors the
// oversize guard on framed messages (see `packet.rs`).
//
// The element order of `BoundedMap` on the wire is the iteration order of
// the underlying `BTreeMap`, which keeps encodings deterministic.

use std::collections::BTreeMap;

use crate::encode::{get_i32, Encodable};
use crate::error::{Result, WireError};

fn write_count(count: usize, out: &mut Vec<u8>) {
    out.extend_from_slice(&(count as i32).to_le_bytes());
}

fn read_count(input: &mut &[u8], capacity: usize) -> Result<usize> {
    let raw = get_i32(input)?;
    if raw < 0 || raw as usize > capacity {
        return Err(WireError::CapacityExceeded {
            count: raw.max(0) as usize,
            capacity,
        });
    }
    Ok(raw as usize)
}

/// A list capped at `N` elements on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoundedList<T, const N: usize> {
    items: Vec<T>,
}

impl<T, const N: usize> BoundedList<T, N> {
    pub fn new() -> Self {
        BoundedList { items: Vec::new() }
    }

    pub fn push(&mut self, item: T) -> Result<()> {
        if self.items.len() >= N {
            return Err(WireError::CapacityExceeded {
                count: self.items.len() + 1,
                capacity: N,
            });
        }
        self.items.push(item);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }
}

impl<T, const N: usize> Default for BoundedList<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Encodable, const N: usize> Encodable for BoundedList<T, N> {
    fn encoded_len(&self) -> usize {
        4 + self.items.iter().map(Encodable::encoded_len).sum::<usize>()
    }

    fn write(&self, out: &mut Vec<u8>) {
        write_count(self.items.len(), out);
        for item in &self.items {
            item.write(out);
        }
    }

    fn read(input: &mut &[u8]) -> Result<Self> {
        let count = read_count(input, N)?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(T::read(input)?);
        }
        Ok(BoundedList { items })
    }
}

/// An ordered key/value map capped at `N` entries on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoundedMap<K, V, const N: usize> {
    entries: BTreeMap<K, V>,
}

impl<K: Ord, V, const N: usize> BoundedMap<K, V, N> {
    pub fn new() -> Self {
        BoundedMap {
            entries: BTreeMap::new(),
        }
    }

    /// Insert an entry; replacing an existing key never hits the cap.
    pub fn insert(&mut self, key: K, value: V) -> Result<Option<V>> {
        if !self.entries.contains_key(&key) && self.entries.len() >= N {
            return Err(WireError::CapacityExceeded {
                count: self.entries.len() + 1,
                capacity: N,
            });
        }
        Ok(self.entries.insert(key, value))
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::collections::btree_map::Iter<'_, K, V> {
        self.entries.iter()
    }
}

impl<K: Ord, V, const N: usize> Default for BoundedMap<K, V, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Encodable + Ord, V: Encodable, const N: usize> Encodable for BoundedMap<K, V, N> {
    fn encoded_len(&self) -> usize {
        4 + self
            .entries
            .iter()
            .map(|(k, v)| k.encoded_len() + v.encoded_len())
            .sum::<usize>()
    }

    fn write(&self, out: &mut Vec<u8>) {
        write_count(self.entries.len(), out);
        for (k, v) in &self.entries {
            k.write(out);
            v.write(out);
        }
    }

    fn read(input: &mut &[u8]) -> Result<Self> {
        let count = read_count(input, N)?;
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let k = K::read(input)?;
            let v = V::read(input)?;
            entries.insert(k, v);
        }
        Ok(BoundedMap { entries })
    }
}

/// A fixed-capacity bit set; the wire form carries one byte per set bit
/// index group (`[i32 count][u8 payload…]` with `count` = byte count).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoundedBitSet<const N: usize> {
    bits: Vec<u8>,
}

impl<const N: usize> BoundedBitSet<N> {
    const BYTES: usize = N.div_ceil(8);

    pub fn new() -> Self {
        BoundedBitSet {
            bits: vec![0u8; Self::BYTES],
        }
    }

    pub fn set(&mut self, index: usize, value: bool) -> Result<()> {
        if index >= N {
            return Err(WireError::CapacityExceeded {
                count: index + 1,
                capacity: N,
            });
        }
        let byte = index / 8;
        let mask = 1u8 << (index % 8);
        if value {
            self.bits[byte] |= mask;
        } else {
            self.bits[byte] &= !mask;
        }
        Ok(())
    }

    pub fn get(&self, index: usize) -> bool {
        if index >= N {
            return false;
        }
        self.bits[index / 8] & (1u8 << (index % 8)) != 0
    }

    pub fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> Default for BoundedBitSet<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Encodable for BoundedBitSet<N> {
    fn encoded_len(&self) -> usize {
        4 + Self::BYTES
    }

    fn write(&self, out: &mut Vec<u8>) {
        write_count(Self::BYTES, out);
        out.extend_from_slice(&self.bits);
    }

    fn read(input: &mut &[u8]) -> Result<Self> {
        let count = read_count(input, Self::BYTES)?;
        if count != Self::BYTES {
            return Err(WireError::CapacityExceeded {
                count,
                capacity: Self::BYTES,
            });
        }
        let bytes = crate::encode::get_bytes(input, count)?;
        Ok(BoundedBitSet { bits: bytes })
    }
}

/// A UTF-8 string capped at `N` bytes on the wire, for fields where the
/// 255-byte plain-string limit is too loose or too tight.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoundedString<const N: usize> {
    value: String,
}

impl<const N: usize> BoundedString<N> {
    pub fn new(value: &str) -> Result<Self> {
        if value.len() > N {
            return Err(WireError::StringTooLong {
                len: value.len(),
                limit: N,
            });
        }
        Ok(BoundedString {
            value: value.to_owned(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl<const N: usize> Encodable for BoundedString<N> {
    fn encoded_len(&self) -> usize {
        4 + self.value.len()
    }

    fn write(&self, out: &mut Vec<u8>) {
        write_count(self.value.len(), out);
        out.extend_from_slice(self.value.as_bytes());
    }

    fn read(input: &mut &[u8]) -> Result<Self> {
        let count = read_count(input, N)?;
        let bytes = crate::encode::get_bytes(input, count)?;
        let value = String::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8)?;
        Ok(BoundedString { value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_roundtrip_and_cap() {
        let mut list: BoundedList<u32, 3> = BoundedList::new();
        list.push(10).unwrap();
        list.push(20).unwrap();
        list.push(30).unwrap();
        assert!(list.push(40).is_err());

        let mut out = Vec::new();
        list.write(&mut out);
        assert_eq!(out.len(), list.encoded_len());
        let mut input = out.as_slice();
        let back: BoundedList<u32, 3> = BoundedList::read(&mut input).unwrap();
        assert_eq!(back, list);
    }

    #[test]
    fn list_read_rejects_overlong_count() {
        let mut out = Vec::new();
        out.extend_from_slice(&5i32.to_le_bytes());
        let mut input = out.as_slice();
        let result: Result<BoundedList<u32, 3>> = BoundedList::read(&mut input);
        assert!(matches!(
            result,
            Err(WireError::CapacityExceeded { count: 5, capacity: 3 })
        ));
    }

    #[test]
    fn list_read_rejects_negative_count() {
        let mut out = Vec::new();
        out.extend_from_slice(&(-1i32).to_le_bytes());
        let mut input = out.as_slice();
        let result: Result<BoundedList<u32, 3>> = BoundedList::read(&mut input);
        assert!(result.is_err());
    }

    #[test]
    fn map_roundtrip() {
        let mut map: BoundedMap<u32, String, 4> = BoundedMap::new();
        map.insert(2, "two".into()).unwrap();
        map.insert(1, "one".into()).unwrap();

        let mut out = Vec::new();
        map.write(&mut out);
        let mut input = out.as_slice();
        let back: BoundedMap<u32, String, 4> = BoundedMap::read(&mut input).unwrap();
        assert_eq!(back, map);
        // BTreeMap ordering makes the encoding deterministic: key 1 first.
        let mut expected = Vec::new();
        write_count(2, &mut expected);
        1u32.write(&mut expected);
        String::from("one").write(&mut expected);
        2u32.write(&mut expected);
        String::from("two").write(&mut expected);
        assert_eq!(out, expected);
    }

    #[test]
    fn bitset_roundtrip() {
        let mut set: BoundedBitSet<12> = BoundedBitSet::new();
        set.set(0, true).unwrap();
        set.set(9, true).unwrap();
        assert!(set.set(12, true).is_err());
        assert!(set.get(0));
        assert!(set.get(9));
        assert!(!set.get(1));

        let mut out = Vec::new();
        set.write(&mut out);
        let mut input = out.as_slice();
        let back: BoundedBitSet<12> = BoundedBitSet::read(&mut input).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn bounded_string_cap() {
        assert!(BoundedString::<4>::new("abcd").is_ok());
        assert!(BoundedString::<4>::new("abcde").is_err());

        let s = BoundedString::<8>::new("hi").unwrap();
        let mut out = Vec::new();
        s.write(&mut out);
        let mut input = out.as_slice();
        let back: BoundedString<8> = BoundedString::read(&mut input).unwrap();
        assert_eq!(back.as_str(), "hi");
    }
}
