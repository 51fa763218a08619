//! Fragmented, reference-counted byte buffer.
//!
//! An [`IoBuf`] is an ordered list of byte fragments. Sealed fragments are
//! immutable [`Bytes`] handles; the tail is a writable [`BytesMut`] that
//! small appends are packed into. Sharing a range seals the tail first so
//! the new buffer and the original point at the same allocation.
//!
//! There are exactly two ways to obtain a second handle to the bytes:
//! [`IoBuf::share`] (zero-copy, reference counted) and [`IoBuf::copy`]
//! (deep copy). The type is deliberately not `Clone`.

use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CoreError, CoreResult};
use crate::limits::{FRAGMENT_SIZE_BYTES_MAX, FRAGMENT_SIZE_BYTES_MIN};

// ----------------------------------------------------------------------------
// Allocation policy
// ----------------------------------------------------------------------------

/// Chooses the size of the next fragment allocation.
///
/// Sizes start at [`FRAGMENT_SIZE_BYTES_MIN`] and double on every allocation
/// up to [`FRAGMENT_SIZE_BYTES_MAX`]. A write larger than the current step
/// gets a fragment of exactly its own size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationSize {
    next: usize,
}

impl AllocationSize {
    /// Creates the policy at its initial step.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: FRAGMENT_SIZE_BYTES_MIN,
        }
    }

    /// Returns the capacity for a fragment that must hold `min_len` bytes and
    /// advances the policy.
    pub fn next_capacity(&mut self, min_len: usize) -> usize {
        let step = self.next;
        self.next = (self.next * 2).min(FRAGMENT_SIZE_BYTES_MAX);
        step.max(min_len)
    }
}

impl Default for AllocationSize {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// IoBuf
// ----------------------------------------------------------------------------

/// A fragmented byte buffer.
pub struct IoBuf {
    /// Sealed fragments, in order. Never contains empty fragments.
    fragments: VecDeque<Bytes>,
    /// Writable tail; logically the last fragment.
    tail: BytesMut,
    /// Running total of all bytes held.
    size: usize,
    alloc: AllocationSize,
}

impl IoBuf {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            fragments: VecDeque::new(),
            tail: BytesMut::new(),
            size: 0,
            alloc: AllocationSize::new(),
        }
    }

    /// Returns the number of bytes in the buffer. O(1).
    #[must_use]
    pub const fn size_bytes(&self) -> usize {
        self.size
    }

    /// Returns true if the buffer holds no bytes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Returns the number of non-empty fragments.
    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.fragments.len() + usize::from(!self.tail.is_empty())
    }

    /// Appends bytes, packing into spare tail capacity first.
    pub fn append(&mut self, src: &[u8]) {
        if src.is_empty() {
            return;
        }
        let room = self.tail.capacity() - self.tail.len();
        let packed = room.min(src.len());
        self.tail.extend_from_slice(&src[..packed]);
        let rest = &src[packed..];
        if !rest.is_empty() {
            self.seal();
            let capacity = self.alloc.next_capacity(rest.len());
            let mut fresh = BytesMut::with_capacity(capacity);
            fresh.extend_from_slice(rest);
            self.tail = fresh;
        }
        self.size += src.len();
    }

    /// Appends an existing fragment without copying.
    pub fn append_bytes(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.seal();
        self.size += bytes.len();
        self.fragments.push_back(bytes);
    }

    /// Moves every fragment of `other` onto the end of this buffer.
    pub fn append_buf(&mut self, mut other: Self) {
        other.seal();
        self.seal();
        self.size += other.size;
        self.fragments.append(&mut other.fragments);
    }

    /// Prepends bytes as a new head fragment.
    pub fn prepend(&mut self, src: &[u8]) {
        if src.is_empty() {
            return;
        }
        self.prepend_bytes(Bytes::copy_from_slice(src));
    }

    /// Prepends an existing fragment without copying.
    pub fn prepend_bytes(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.size += bytes.len();
        if self.fragments.is_empty() && !self.tail.is_empty() {
            self.seal();
        }
        self.fragments.push_front(bytes);
    }

    /// Returns a buffer that references `len` bytes starting at `pos`
    /// without copying them.
    ///
    /// # Errors
    /// Returns [`CoreError::OutOfRange`] if the range exceeds the buffer.
    pub fn share(&mut self, pos: usize, len: usize) -> CoreResult<Self> {
        let end = pos.checked_add(len).ok_or(CoreError::OutOfRange {
            pos,
            len,
            size: self.size,
        })?;
        if end > self.size {
            return Err(CoreError::OutOfRange {
                pos,
                len,
                size: self.size,
            });
        }
        self.seal();

        let mut out = Self::new();
        let mut skip = pos;
        let mut want = len;
        for frag in &self.fragments {
            if want == 0 {
                break;
            }
            if skip >= frag.len() {
                skip -= frag.len();
                continue;
            }
            let take = (frag.len() - skip).min(want);
            out.fragments.push_back(frag.slice(skip..skip + take));
            out.size += take;
            want -= take;
            skip = 0;
        }
        debug_assert_eq!(out.size, len);
        Ok(out)
    }

    /// Returns a buffer sharing every byte of this one.
    pub fn share_all(&mut self) -> Self {
        self.seal();
        Self {
            fragments: self.fragments.clone(),
            tail: BytesMut::new(),
            size: self.size,
            alloc: AllocationSize::new(),
        }
    }

    /// Returns a deep copy held in a single fresh fragment.
    #[must_use]
    pub fn copy(&self) -> Self {
        let mut data = BytesMut::with_capacity(self.size);
        for frag in self.fragments() {
            data.extend_from_slice(frag);
        }
        let mut out = Self::new();
        out.append_bytes(data.freeze());
        out
    }

    /// Drops `n` bytes from the front.
    ///
    /// # Errors
    /// Returns [`CoreError::OutOfRange`] if `n` exceeds the buffer size.
    pub fn trim_front(&mut self, n: usize) -> CoreResult<()> {
        if n > self.size {
            return Err(CoreError::OutOfRange {
                pos: 0,
                len: n,
                size: self.size,
            });
        }
        self.seal();
        let mut left = n;
        while left > 0 {
            let Some(front) = self.fragments.front_mut() else {
                break;
            };
            if front.len() <= left {
                left -= front.len();
                self.fragments.pop_front();
            } else {
                front.advance(left);
                left = 0;
            }
        }
        self.size -= n;
        Ok(())
    }

    /// Removes and returns the first fragment.
    pub fn pop_front(&mut self) -> Option<Bytes> {
        if self.fragments.is_empty() {
            self.seal();
        }
        let front = self.fragments.pop_front()?;
        self.size -= front.len();
        Some(front)
    }

    /// Releases every fragment.
    pub fn clear(&mut self) {
        self.fragments.clear();
        self.tail = BytesMut::new();
        self.size = 0;
    }

    /// Iterates the fragments as byte slices, in order.
    pub fn fragments(&self) -> impl DoubleEndedIterator<Item = &[u8]> + '_ {
        self.fragments
            .iter()
            .map(|b| &b[..])
            .chain(std::iter::once(&self.tail[..]))
            .filter(|s| !s.is_empty())
    }

    /// Iterates individual bytes across fragment boundaries.
    ///
    /// The iterator is double-ended, so `.rev()` walks the buffer from the
    /// back without linearizing it.
    pub fn bytes(&self) -> impl DoubleEndedIterator<Item = u8> + '_ {
        self.fragments().flat_map(|s| s.iter().copied())
    }

    /// Linearizes the contents. Free when the buffer is one sealed fragment.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        if self.tail.is_empty() && self.fragments.len() == 1 {
            return self.fragments[0].clone();
        }
        let mut data = BytesMut::with_capacity(self.size);
        self.write_to(&mut data);
        data.freeze()
    }

    /// Writes every fragment into `dst`.
    pub fn write_to(&self, dst: &mut impl BufMut) {
        for frag in self.fragments() {
            dst.put_slice(frag);
        }
    }

    /// Converts the buffer into a consuming parser.
    #[must_use]
    pub fn into_parser(mut self) -> IoBufParser {
        self.seal();
        IoBufParser {
            remaining: self.size,
            fragments: self.fragments,
        }
    }

    /// Moves the filled part of the tail into the sealed list.
    ///
    /// The tail keeps any spare capacity, so later appends still pack into
    /// the same allocation.
    fn seal(&mut self) {
        if !self.tail.is_empty() {
            let filled = self.tail.split().freeze();
            self.fragments.push_back(filled);
        }
    }
}

impl Default for IoBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for IoBuf {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size && self.bytes().eq(other.bytes())
    }
}

impl Eq for IoBuf {}

/// Bytes fed to a hasher per call. Fixed so the hash ignores fragment
/// boundaries.
const HASH_CHUNK: usize = 64;

impl Hash for IoBuf {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(self.size);
        let mut chunk = [0u8; HASH_CHUNK];
        let mut len = 0;
        for byte in self.bytes() {
            chunk[len] = byte;
            len += 1;
            if len == HASH_CHUNK {
                state.write(&chunk);
                len = 0;
            }
        }
        state.write(&chunk[..len]);
    }
}

impl PartialEq<[u8]> for IoBuf {
    fn eq(&self, other: &[u8]) -> bool {
        self.size == other.len() && self.bytes().eq(other.iter().copied())
    }
}

impl fmt::Debug for IoBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBuf")
            .field("size", &self.size)
            .field("fragments", &self.fragment_count())
            .finish()
    }
}

impl From<Bytes> for IoBuf {
    fn from(bytes: Bytes) -> Self {
        let mut buf = Self::new();
        buf.append_bytes(bytes);
        buf
    }
}

impl From<Vec<u8>> for IoBuf {
    fn from(data: Vec<u8>) -> Self {
        Self::from(Bytes::from(data))
    }
}

impl From<&[u8]> for IoBuf {
    fn from(data: &[u8]) -> Self {
        let mut buf = Self::new();
        buf.append(data);
        buf
    }
}

impl From<&str> for IoBuf {
    fn from(data: &str) -> Self {
        Self::from(data.as_bytes())
    }
}

// ----------------------------------------------------------------------------
// Parser
// ----------------------------------------------------------------------------

/// Consuming cursor over an [`IoBuf`].
///
/// Implements [`Buf`], so the usual `get_u32_le` style accessors work across
/// fragment boundaries. [`IoBufParser::read_iobuf`] hands out sub-buffers
/// that share the parser's storage.
#[derive(Debug)]
pub struct IoBufParser {
    fragments: VecDeque<Bytes>,
    remaining: usize,
}

impl IoBufParser {
    /// Splits off the next `len` bytes as a zero-copy buffer.
    ///
    /// # Errors
    /// Returns [`CoreError::Truncated`] if fewer than `len` bytes remain.
    pub fn read_iobuf(&mut self, len: usize) -> CoreResult<IoBuf> {
        if len > self.remaining {
            return Err(CoreError::Truncated {
                needed: len,
                available: self.remaining,
            });
        }
        let mut out = IoBuf::new();
        let mut want = len;
        while want > 0 {
            let Some(front) = self.fragments.front_mut() else {
                break;
            };
            if front.len() <= want {
                want -= front.len();
                if let Some(frag) = self.fragments.pop_front() {
                    out.append_bytes(frag);
                }
            } else {
                out.append_bytes(front.split_to(want));
                want = 0;
            }
        }
        self.remaining -= len;
        Ok(out)
    }

    /// Returns an error unless at least `len` bytes remain.
    ///
    /// # Errors
    /// Returns [`CoreError::Truncated`] if the parser is short.
    pub const fn ensure(&self, len: usize) -> CoreResult<()> {
        if self.remaining < len {
            return Err(CoreError::Truncated {
                needed: len,
                available: self.remaining,
            });
        }
        Ok(())
    }
}

impl Buf for IoBufParser {
    fn remaining(&self) -> usize {
        self.remaining
    }

    fn chunk(&self) -> &[u8] {
        self.fragments.front().map_or(&[], |b| &b[..])
    }

    fn advance(&mut self, mut cnt: usize) {
        assert!(cnt <= self.remaining, "advance past end of IoBufParser");
        self.remaining -= cnt;
        while cnt > 0 {
            let Some(front) = self.fragments.front_mut() else {
                break;
            };
            if front.len() <= cnt {
                cnt -= front.len();
                self.fragments.pop_front();
            } else {
                front.advance(cnt);
                cnt = 0;
            }
        }
    }

    fn copy_to_bytes(&mut self, len: usize) -> Bytes {
        assert!(len <= self.remaining, "copy_to_bytes past end of IoBufParser");
        if let Some(front) = self.fragments.front_mut() {
            if front.len() >= len {
                let out = front.split_to(len);
                if front.is_empty() {
                    self.fragments.pop_front();
                }
                self.remaining -= len;
                return out;
            }
        }
        let mut out = BytesMut::with_capacity(len);
        out.put(Buf::take(&mut *self, len));
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragmented(parts: &[&[u8]]) -> IoBuf {
        let mut buf = IoBuf::new();
        for part in parts {
            buf.append_bytes(Bytes::copy_from_slice(part));
        }
        buf
    }

    #[test]
    fn test_small_appends_pack_into_one_fragment() {
        let mut buf = IoBuf::new();
        for _ in 0..100 {
            buf.append(b"abc");
        }
        assert_eq!(buf.size_bytes(), 300);
        assert_eq!(buf.fragment_count(), 1);
    }

    #[test]
    fn test_allocation_size_doubles_and_caps() {
        let mut policy = AllocationSize::new();
        assert_eq!(policy.next_capacity(1), FRAGMENT_SIZE_BYTES_MIN);
        assert_eq!(policy.next_capacity(1), FRAGMENT_SIZE_BYTES_MIN * 2);
        for _ in 0..32 {
            let _ = policy.next_capacity(1);
        }
        assert_eq!(policy.next_capacity(1), FRAGMENT_SIZE_BYTES_MAX);
        assert_eq!(policy.next_capacity(1 << 20), 1 << 20);
    }

    #[test]
    fn test_append_overflowing_tail_spills() {
        let mut buf = IoBuf::new();
        let big = vec![7u8; FRAGMENT_SIZE_BYTES_MIN + 10];
        buf.append(&big);
        buf.append(&big);
        assert_eq!(buf.size_bytes(), big.len() * 2);
        assert!(buf.bytes().all(|b| b == 7));
    }

    #[test]
    fn test_equality_ignores_fragment_shape() {
        let a = fragmented(&[b"hel", b"lo ", b"world"]);
        let b = fragmented(&[b"hello", b" wor", b"ld"]);
        let c = IoBuf::from("hello world");
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_ne!(a, IoBuf::from("hello worle"));
        assert!(a == *b"hello world".as_slice());
    }

    #[test]
    fn test_prepend() {
        let mut buf = IoBuf::from("world");
        buf.prepend(b"hello ");
        assert_eq!(buf, IoBuf::from("hello world"));
        assert_eq!(buf.size_bytes(), 11);
    }

    #[test]
    fn test_share_references_same_storage() {
        let mut buf = fragmented(&[b"0123", b"4567", b"89"]);
        let shared = buf.share(2, 6).unwrap();
        assert_eq!(shared, IoBuf::from("234567"));
        assert_eq!(shared.fragment_count(), 2);

        let first_original = buf.fragments().next().unwrap().as_ptr();
        let first_shared = shared.fragments().next().unwrap().as_ptr();
        // Offset by the two skipped bytes inside the same allocation.
        assert_eq!(first_shared, first_original.wrapping_add(2));
    }

    #[test]
    fn test_share_seals_tail_without_copy() {
        let mut buf = IoBuf::new();
        buf.append(b"abcdef");
        let tail_ptr = buf.fragments().next().unwrap().as_ptr();
        let shared = buf.share(0, 3).unwrap();
        assert_eq!(shared.fragments().next().unwrap().as_ptr(), tail_ptr);
        // Appends after the share still land after the shared bytes.
        buf.append(b"gh");
        assert_eq!(buf, IoBuf::from("abcdefgh"));
        assert_eq!(shared, IoBuf::from("abc"));
    }

    #[test]
    fn test_share_out_of_range() {
        let mut buf = IoBuf::from("abc");
        assert!(matches!(
            buf.share(2, 5),
            Err(CoreError::OutOfRange { pos: 2, len: 5, size: 3 })
        ));
        assert!(buf.share(usize::MAX, 2).is_err());
    }

    #[test]
    fn test_copy_is_independent() {
        let buf = fragmented(&[b"ab", b"cd"]);
        let copy = buf.copy();
        assert_eq!(copy, buf);
        assert_eq!(copy.fragment_count(), 1);
        let a = buf.fragments().next().unwrap().as_ptr();
        let b = copy.fragments().next().unwrap().as_ptr();
        assert_ne!(a, b);
    }

    #[test]
    fn test_trim_front_and_pop_front() {
        let mut buf = fragmented(&[b"abc", b"def", b"ghi"]);
        buf.trim_front(4).unwrap();
        assert_eq!(buf, IoBuf::from("efghi"));
        assert_eq!(buf.pop_front().unwrap(), Bytes::from_static(b"ef"));
        assert_eq!(buf.size_bytes(), 3);
        assert!(buf.trim_front(4).is_err());
        buf.clear();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_reverse_byte_iteration() {
        let buf = fragmented(&[b"ab", b"c", b"de"]);
        let rev: Vec<u8> = buf.bytes().rev().collect();
        assert_eq!(rev, b"edcba");
    }

    #[test]
    fn test_hash_ignores_fragmentation() {
        use std::collections::hash_map::DefaultHasher;
        use std::collections::HashSet;

        fn hash_of(buf: &IoBuf) -> u64 {
            let mut hasher = DefaultHasher::new();
            buf.hash(&mut hasher);
            hasher.finish()
        }

        let long: Vec<u8> = (0..200u8).collect();
        let whole = IoBuf::from(&long[..]);
        let split = fragmented(&[&long[..1], &long[1..70], &long[70..128], &long[128..]]);
        assert_eq!(whole, split);
        assert_eq!(hash_of(&whole), hash_of(&split));
        assert_ne!(hash_of(&whole), hash_of(&IoBuf::from(&long[..199])));

        let mut set = HashSet::new();
        set.insert(fragmented(&[b"ab", b"cd"]));
        assert!(set.contains(&IoBuf::from("abcd")));
        assert!(!set.contains(&IoBuf::from("abdc")));
    }

    #[test]
    fn test_parser_reads_across_fragments() {
        let mut raw = BytesMut::new();
        raw.put_u32_le(0xDEAD_BEEF);
        raw.put_u64_le(42);
        let bytes = raw.freeze();
        let buf = fragmented(&[&bytes[..3], &bytes[3..7], &bytes[7..]]);

        let mut parser = buf.into_parser();
        assert_eq!(parser.get_u32_le(), 0xDEAD_BEEF);
        assert_eq!(parser.get_u64_le(), 42);
        assert_eq!(parser.remaining(), 0);
    }

    #[test]
    fn test_parser_read_iobuf_is_zero_copy() {
        let source = Bytes::from_static(b"headerpayload");
        let ptr = source.as_ptr();
        let mut parser = IoBuf::from(source).into_parser();
        parser.advance(6);
        let payload = parser.read_iobuf(7).unwrap();
        assert_eq!(payload, IoBuf::from("payload"));
        assert_eq!(payload.fragments().next().unwrap().as_ptr(), ptr.wrapping_add(6));
        assert!(parser.read_iobuf(1).is_err());
    }
}
