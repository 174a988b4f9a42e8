//! # Internal key format
//!
//! Every record in the engine is keyed by an internal key:
//!
//! ```text
//! InternalKey := user_key  fixed64le((sequence << 8) | type)
//! ```
//!
//! Internal keys order by user key ascending, then by the packed trailer
//! descending, so the newest version of a user key sorts first.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::util::coding::{decode_fixed64, put_fixed64, put_varint32, varint_length};

/// MVCC timestamp assigned to each operation at commit time.
pub type SequenceNumber = u64;

/// Sequence numbers occupy 56 bits so they can share a u64 with the type tag.
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

/// The kind of a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ValueType {
    /// A tombstone marking the key as deleted.
    Deletion = 0,
    /// A live value.
    Value = 1,
}

/// Tag used when building seek targets: the largest type sorts first among
/// entries with equal user key and sequence.
pub const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Value;

impl ValueType {
    /// Converts a raw tag byte, rejecting unknown values.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ValueType::Deletion),
            1 => Some(ValueType::Value),
            _ => None,
        }
    }
}

/// Packs a sequence number and value type into the 8-byte internal key tag.
pub fn pack_sequence_and_type(sequence: SequenceNumber, value_type: ValueType) -> u64 {
    debug_assert!(sequence <= MAX_SEQUENCE_NUMBER);
    (sequence << 8) | value_type as u64
}

/// Appends the encoding of an internal key to `dst`.
pub fn append_internal_key(
    dst: &mut Vec<u8>,
    user_key: &[u8],
    sequence: SequenceNumber,
    value_type: ValueType,
) {
    dst.extend_from_slice(user_key);
    put_fixed64(dst, pack_sequence_and_type(sequence, value_type));
}

/// Returns the user-key portion of an encoded internal key.
pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    debug_assert!(internal_key.len() >= 8);
    &internal_key[..internal_key.len() - 8]
}

/// A borrowed, decoded view of an internal key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    /// The user-supplied key bytes.
    pub user_key: &'a [u8],
    /// Commit sequence of the record.
    pub sequence: SequenceNumber,
    /// Whether the record is a value or a tombstone.
    pub value_type: ValueType,
}

/// Splits an encoded internal key into its parts.
pub fn parse_internal_key(internal_key: &[u8]) -> Result<ParsedInternalKey<'_>> {
    if internal_key.len() < 8 {
        return Err(Error::corruption("internal key too short"));
    }
    let tag = decode_fixed64(&internal_key[internal_key.len() - 8..]);
    let value_type = ValueType::from_u8((tag & 0xff) as u8)
        .ok_or_else(|| Error::corruption(format!("bad value type tag {:#x}", tag & 0xff)))?;
    Ok(ParsedInternalKey {
        user_key: extract_user_key(internal_key),
        sequence: tag >> 8,
        value_type,
    })
}

/// An owned internal key, stored in its encoded form.
///
/// `Ord` realises the internal ordering for bytewise user keys, which is what
/// the skiplist memtable relies on.
#[derive(Clone, PartialEq, Eq)]
pub struct InternalKey {
    rep: Vec<u8>,
}

impl InternalKey {
    /// Builds an internal key from its parts.
    pub fn new(user_key: &[u8], sequence: SequenceNumber, value_type: ValueType) -> Self {
        let mut rep = Vec::with_capacity(user_key.len() + 8);
        append_internal_key(&mut rep, user_key, sequence, value_type);
        Self { rep }
    }

    /// Wraps an already-encoded internal key.
    pub fn decode(encoded: &[u8]) -> Result<Self> {
        parse_internal_key(encoded)?;
        Ok(Self { rep: encoded.to_vec() })
    }

    /// The encoded bytes: `user_key  tag`.
    pub fn encoded(&self) -> &[u8] {
        &self.rep
    }

    /// The user-key portion.
    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.rep)
    }

    /// The commit sequence.
    pub fn sequence(&self) -> SequenceNumber {
        decode_fixed64(&self.rep[self.rep.len() - 8..]) >> 8
    }

    /// The value type tag.
    pub fn value_type(&self) -> ValueType {
        let tag = decode_fixed64(&self.rep[self.rep.len() - 8..]);
        ValueType::from_u8((tag & 0xff) as u8).unwrap_or(ValueType::Value)
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.user_key().cmp(other.user_key()) {
            Ordering::Equal => {
                let a = decode_fixed64(&self.rep[self.rep.len() - 8..]);
                let b = decode_fixed64(&other.rep[other.rep.len() - 8..]);
                // Newer entries (larger tag) sort first.
                b.cmp(&a)
            }
            ord => ord,
        }
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InternalKey({:?} @ {} : {:?})",
            String::from_utf8_lossy(self.user_key()),
            self.sequence(),
            self.value_type()
        )
    }
}

/// A pre-encoded lookup target carrying both the memtable key and the
/// internal key for a `(user_key, snapshot_sequence)` probe.
pub struct LookupKey {
    // varint32(user_key.len() + 8)  user_key  tag
    data: Vec<u8>,
    kstart: usize,
}

impl LookupKey {
    /// Builds the lookup key for `user_key` at `sequence`.
    pub fn new(user_key: &[u8], sequence: SequenceNumber) -> Self {
        let internal_len = user_key.len() + 8;
        let kstart = varint_length(internal_len as u64);
        let mut data = Vec::with_capacity(kstart + internal_len);
        put_varint32(&mut data, internal_len as u32);
        append_internal_key(&mut data, user_key, sequence, VALUE_TYPE_FOR_SEEK);
        Self { data, kstart }
    }

    /// Key formatted for a memtable probe (length-prefixed internal key).
    pub fn memtable_key(&self) -> &[u8] {
        &self.data
    }

    /// The internal key portion.
    pub fn internal_key(&self) -> &[u8] {
        &self.data[self.kstart..]
    }

    /// The user key portion.
    pub fn user_key(&self) -> &[u8] {
        &self.data[self.kstart..self.data.len() - 8]
    }

    /// The snapshot sequence this lookup was built for.
    pub fn sequence(&self) -> SequenceNumber {
        decode_fixed64(&self.data[self.data.len() - 8..]) >> 8
    }
}

/// A total order over user keys.
///
/// Implementations must be stateless and consistent: the same comparator
/// (identified by `name`) has to be used every time a database is opened.
pub trait Comparator: Send + Sync {
    /// Identifies the ordering; persisted in the manifest.
    fn name(&self) -> &'static str;

    /// Three-way comparison of two user keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Returns a key `k` with `start <= k < limit` that is as short as
    /// possible, for use as an index separator. Returning `start` unchanged
    /// is always correct.
    fn find_shortest_separator(&self, start: &[u8], limit: &[u8]) -> Vec<u8>;

    /// Returns a short key `k >= key`, for terminating index entries.
    fn find_short_successor(&self, key: &[u8]) -> Vec<u8>;
}

/// Lexicographic byte ordering; the default comparator.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn name(&self) -> &'static str {
        "siltdb.BytewiseComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn find_shortest_separator(&self, start: &[u8], limit: &[u8]) -> Vec<u8> {
        let min_len = start.len().min(limit.len());
        let mut diff = 0;
        while diff < min_len && start[diff] == limit[diff] {
            diff += 1;
        }

        if diff < min_len {
            let byte = start[diff];
            if byte < 0xff && byte + 1 < limit[diff] {
                let mut sep = start[..=diff].to_vec();
                sep[diff] += 1;
                return sep;
            }
        }
        // One is a prefix of the other, or the bytes differ by at most one:
        // no shortening is possible.
        start.to_vec()
    }

    fn find_short_successor(&self, key: &[u8]) -> Vec<u8> {
        for (i, &byte) in key.iter().enumerate() {
            if byte != 0xff {
                let mut succ = key[..=i].to_vec();
                succ[i] += 1;
                return succ;
            }
        }
        // All 0xff: the key is its own successor.
        key.to_vec()
    }
}

/// Orders encoded internal keys by wrapping a user comparator.
#[derive(Clone)]
pub struct InternalKeyComparator {
    user: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
    /// Wraps `user` as the user-key ordering.
    pub fn new(user: Arc<dyn Comparator>) -> Self {
        Self { user }
    }

    /// The wrapped user comparator.
    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.user
    }

    /// Compares two user keys with the wrapped comparator.
    pub fn compare_user_keys(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.user.compare(a, b)
    }
}

impl Comparator for InternalKeyComparator {
    fn name(&self) -> &'static str {
        "siltdb.InternalKeyComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        debug_assert!(a.len() >= 8 && b.len() >= 8);
        match self.user.compare(extract_user_key(a), extract_user_key(b)) {
            Ordering::Equal => {
                let atag = decode_fixed64(&a[a.len() - 8..]);
                let btag = decode_fixed64(&b[b.len() - 8..]);
                btag.cmp(&atag)
            }
            ord => ord,
        }
    }

    fn find_shortest_separator(&self, start: &[u8], limit: &[u8]) -> Vec<u8> {
        let user_start = extract_user_key(start);
        let user_limit = extract_user_key(limit);
        let tmp = self.user.find_shortest_separator(user_start, user_limit);
        if tmp.len() < user_start.len() && self.user.compare(user_start, &tmp) == Ordering::Less {
            // The user key shrank; attach the tag that sorts before every
            // real entry for that user key.
            let mut sep = tmp;
            put_fixed64(
                &mut sep,
                pack_sequence_and_type(MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK),
            );
            debug_assert_eq!(self.compare(start, &sep), Ordering::Less);
            debug_assert_eq!(self.compare(&sep, limit), Ordering::Less);
            sep
        } else {
            start.to_vec()
        }
    }

    fn find_short_successor(&self, key: &[u8]) -> Vec<u8> {
        let user_key = extract_user_key(key);
        let tmp = self.user.find_short_successor(user_key);
        if tmp.len() < user_key.len() && self.user.compare(user_key, &tmp) == Ordering::Less {
            let mut succ = tmp;
            put_fixed64(
                &mut succ,
                pack_sequence_and_type(MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK),
            );
            succ
        } else {
            key.to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ikey(user_key: &[u8], seq: u64, vt: ValueType) -> Vec<u8> {
        let mut buf = Vec::new();
        append_internal_key(&mut buf, user_key, seq, vt);
        buf
    }

    #[test]
    fn test_pack_unpack() {
        let cases: &[(&[u8], u64)] = &[
            (b"", 0),
            (b"k", 1),
            (b"hello", 197),
            (b"longer key material", MAX_SEQUENCE_NUMBER),
        ];
        for &(key, seq) in cases {
            for vt in [ValueType::Value, ValueType::Deletion] {
                let encoded = ikey(key, seq, vt);
                let parsed = parse_internal_key(&encoded).unwrap();
                assert_eq!(parsed.user_key, key);
                assert_eq!(parsed.sequence, seq);
                assert_eq!(parsed.value_type, vt);
            }
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_internal_key(b"short").is_err());
        let mut bad = ikey(b"k", 7, ValueType::Value);
        let pos = bad.len() - 8;
        bad[pos] = 99; // unknown type tag
        assert!(parse_internal_key(&bad).is_err());
    }

    #[test]
    fn test_internal_key_ordering() {
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));

        // Ascending by user key.
        assert_eq!(
            icmp.compare(&ikey(b"a", 5, ValueType::Value), &ikey(b"b", 5, ValueType::Value)),
            Ordering::Less
        );
        // Descending by sequence for equal user keys.
        assert_eq!(
            icmp.compare(&ikey(b"k", 9, ValueType::Value), &ikey(b"k", 5, ValueType::Value)),
            Ordering::Less
        );
        // Value sorts before Deletion at the same sequence.
        assert_eq!(
            icmp.compare(&ikey(b"k", 5, ValueType::Value), &ikey(b"k", 5, ValueType::Deletion)),
            Ordering::Less
        );
    }

    #[test]
    fn test_owned_key_order_matches_comparator() {
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        let keys = [
            InternalKey::new(b"apple", 10, ValueType::Value),
            InternalKey::new(b"apple", 3, ValueType::Deletion),
            InternalKey::new(b"banana", 7, ValueType::Value),
            InternalKey::new(b"apple", 3, ValueType::Value),
        ];
        for a in &keys {
            for b in &keys {
                assert_eq!(a.cmp(b), icmp.compare(a.encoded(), b.encoded()));
            }
        }
    }

    #[test]
    fn test_lookup_key_views() {
        let lk = LookupKey::new(b"needle", 42);
        assert_eq!(lk.user_key(), b"needle");
        assert_eq!(lk.sequence(), 42);
        assert_eq!(extract_user_key(lk.internal_key()), b"needle");

        let mut mem_key = lk.memtable_key();
        let ik = crate::util::coding::get_length_prefixed_slice(&mut mem_key).unwrap();
        assert_eq!(ik, lk.internal_key());
        assert!(mem_key.is_empty());
    }

    #[test]
    fn test_bytewise_separator() {
        let cmp = BytewiseComparator;

        // Typical shortening.
        assert_eq!(cmp.find_shortest_separator(b"abcdef", b"abzzzz"), b"abd".to_vec());
        // Prefix relationship: no shortening.
        assert_eq!(cmp.find_shortest_separator(b"abc", b"abcdef"), b"abc".to_vec());
        // Adjacent bytes: no room to bump.
        assert_eq!(cmp.find_shortest_separator(b"abc", b"abd"), b"abc".to_vec());
    }

    #[test]
    fn test_bytewise_successor() {
        let cmp = BytewiseComparator;
        assert_eq!(cmp.find_short_successor(b"abc"), b"b".to_vec());
        assert_eq!(cmp.find_short_successor(&[0xff, 0xff, 0x01]), vec![0xff, 0xff, 0x02]);
        assert_eq!(cmp.find_short_successor(&[0xff, 0xff]), vec![0xff, 0xff]);
    }

    #[test]
    fn test_internal_separator_keeps_ordering() {
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        let a = ikey(b"foobar", 100, ValueType::Value);
        let b = ikey(b"hello", 200, ValueType::Value);
        let sep = icmp.find_shortest_separator(&a, &b);
        assert_eq!(icmp.compare(&a, &sep), Ordering::Less);
        assert_eq!(icmp.compare(&sep, &b), Ordering::Less);
    }
}
