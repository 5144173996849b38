//! Typed Entries and the On-Disk Codec
//!
//! Every key in a database maps to one [`Entry`]: the key bytes plus a tagged
//! value. Only string values have wire behavior today; the other tags are
//! reserved so the file format does not shift when they land.
//!
//! ## Entry layout
//!
//! ```text
//! +------+----------------+-----------+------------------+-------------+
//! | tag  | key length     | key bytes | value length     | value bytes |
//! | 1 B  | 8 B, LE u64    | keyLen B  | 8 B, LE u64      | valueLen B  |
//! +------+----------------+-----------+------------------+-------------+
//! ```
//!
//! The value length/bytes pair is the string payload; reserved tags have no
//! defined payload and the decoder refuses them. A database file is the plain
//! concatenation of entries in ascending key order with no outer framing —
//! the file size is the end marker.

use bytes::{Buf, BufMut, Bytes};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use thiserror::Error;

/// The value type tag of an entry.
///
/// The discriminants are the on-disk tag bytes and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    String = 0,
    Hash = 1,
    List = 2,
    Set = 3,
    SortedSet = 4,
}

impl Kind {
    /// The display name used by the TYPE command.
    pub fn name(self) -> &'static str {
        match self {
            Kind::String => "string",
            Kind::Hash => "hash",
            Kind::List => "list",
            Kind::Set => "set",
            Kind::SortedSet => "zset",
        }
    }
}

/// The tagged value of an entry. The tag determines which shape is populated.
///
/// Only `String` is reachable from the current command set; the remaining
/// shapes exist for the type vocabulary and are refused by the codec until
/// their commands are wired up.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(Bytes),
    Hash(HashMap<Bytes, Bytes>),
    List(VecDeque<Bytes>),
    Set(BTreeSet<Bytes>),
    SortedSet(BTreeMap<Bytes, f64>),
}

impl Value {
    /// The tag for this value shape.
    pub fn kind(&self) -> Kind {
        match self {
            Value::String(_) => Kind::String,
            Value::Hash(_) => Kind::Hash,
            Value::List(_) => Kind::List,
            Value::Set(_) => Kind::Set,
            Value::SortedSet(_) => Kind::SortedSet,
        }
    }
}

/// A keyed, typed value. Keys are non-empty and unique within a database.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    key: Bytes,
    value: Value,
}

/// Errors produced while decoding serialized entries.
///
/// Any of these in a database file is fatal at startup; a file either
/// round-trips or the process refuses to serve from it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The input ended in the middle of an entry.
    #[error("serialized entry truncated")]
    Truncated,

    /// A type tag that is assigned but has no defined payload yet.
    #[error("reserved type tag: {0}")]
    ReservedTag(u8),

    /// A type tag outside the assigned range.
    #[error("unknown type tag: {0:#04x}")]
    UnknownTag(u8),
}

impl Entry {
    /// Creates a string entry.
    pub fn string(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: Value::String(value.into()),
        }
    }

    /// The entry's key bytes.
    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// The entry's type tag.
    pub fn kind(&self) -> Kind {
        self.value.kind()
    }

    /// The entry's value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// The string payload, if this entry is string-typed.
    pub fn as_string(&self) -> Option<&Bytes> {
        match &self.value {
            Value::String(data) => Some(data),
            _ => None,
        }
    }

    /// Serializes this entry in the on-disk layout.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes this entry into an existing buffer.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        buf.put_u8(self.kind() as u8);
        buf.put_u64_le(self.key.len() as u64);
        buf.put_slice(&self.key);

        match &self.value {
            Value::String(data) => {
                buf.put_u64_le(data.len() as u64);
                buf.put_slice(data);
            }
            // Reserved shapes carry no payload until their layout is fixed;
            // nothing in the current command set can construct them.
            _ => {}
        }
    }

    /// Decodes one entry from the front of `buf`, advancing it.
    pub fn decode(buf: &mut Bytes) -> Result<Entry, DecodeError> {
        if buf.remaining() < 1 {
            return Err(DecodeError::Truncated);
        }
        let tag = buf.get_u8();
        match tag {
            0 => {}
            1..=4 => return Err(DecodeError::ReservedTag(tag)),
            other => return Err(DecodeError::UnknownTag(other)),
        }

        let key = take_prefixed(buf)?;
        let value = take_prefixed(buf)?;

        Ok(Entry {
            key,
            value: Value::String(value),
        })
    }
}

/// Reads an 8-byte LE length followed by that many bytes.
fn take_prefixed(buf: &mut Bytes) -> Result<Bytes, DecodeError> {
    if buf.remaining() < 8 {
        return Err(DecodeError::Truncated);
    }
    let len = buf.get_u64_le() as usize;
    if buf.remaining() < len {
        return Err(DecodeError::Truncated);
    }
    Ok(buf.copy_to_bytes(len))
}

/// Decodes a concatenation of entries until the buffer is exhausted.
pub fn decode_all(data: Bytes) -> Result<Vec<Entry>, DecodeError> {
    let mut buf = data;
    let mut entries = Vec::new();
    while buf.has_remaining() {
        entries.push(Entry::decode(&mut buf)?);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_layout() {
        let entry = Entry::string("ab", "xyz");
        let bytes = entry.serialize();

        let mut expected = Vec::new();
        expected.push(0u8); // string tag
        expected.extend_from_slice(&2u64.to_le_bytes());
        expected.extend_from_slice(b"ab");
        expected.extend_from_slice(&3u64.to_le_bytes());
        expected.extend_from_slice(b"xyz");

        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_roundtrip() {
        let entry = Entry::string("key", "value with spaces");
        let mut buf = Bytes::from(entry.serialize());
        let decoded = Entry::decode(&mut buf).unwrap();

        assert_eq!(decoded, entry);
        assert!(!buf.has_remaining());
    }

    #[test]
    fn test_empty_value() {
        let entry = Entry::string("k", "");
        let mut buf = Bytes::from(entry.serialize());
        let decoded = Entry::decode(&mut buf).unwrap();
        assert_eq!(decoded.as_string().unwrap().len(), 0);
    }

    #[test]
    fn test_decode_all() {
        let mut raw = Vec::new();
        Entry::string("a", "1").serialize_into(&mut raw);
        Entry::string("b", "2").serialize_into(&mut raw);

        let entries = decode_all(Bytes::from(raw)).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(&entries[0].key()[..], b"a");
        assert_eq!(&entries[1].key()[..], b"b");
    }

    #[test]
    fn test_reserved_tag_refused() {
        let mut raw = Entry::string("k", "v").serialize();
        raw[0] = 2; // list tag
        let mut buf = Bytes::from(raw);
        assert_eq!(Entry::decode(&mut buf), Err(DecodeError::ReservedTag(2)));
    }

    #[test]
    fn test_unknown_tag_refused() {
        let mut raw = Entry::string("k", "v").serialize();
        raw[0] = 99;
        let mut buf = Bytes::from(raw);
        assert_eq!(Entry::decode(&mut buf), Err(DecodeError::UnknownTag(99)));
    }

    #[test]
    fn test_truncated_refused() {
        let raw = Entry::string("key", "value").serialize();
        for cut in [0, 1, 5, raw.len() - 1] {
            let mut buf = Bytes::copy_from_slice(&raw[..cut]);
            assert_eq!(Entry::decode(&mut buf), Err(DecodeError::Truncated));
        }
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(Kind::String.name(), "string");
        assert_eq!(Kind::Hash.name(), "hash");
        assert_eq!(Kind::List.name(), "list");
        assert_eq!(Kind::Set.name(), "set");
        assert_eq!(Kind::SortedSet.name(), "zset");
    }
}
