//! Request Frame Codec
//!
//! Clients talk to the server in fixed-header frames rather than a textual
//! protocol. Every request is one frame:
//!
//! ```text
//! +-------------+------------------+----------------------+
//! | command tag | database id      | statement            |
//! | 1 byte      | 8 bytes, LE      | rest of the frame    |
//! +-------------+------------------+----------------------+
//! ```
//!
//! There is no length prefix; the receive path delimits a frame by the socket
//! draining, so one frame always arrives as one request unit. The statement is
//! UTF-8 text whose grammar is command-specific and parsed by the dispatcher.
//!
//! The command tag ordinals are part of the wire contract and must match on
//! both ends. Tags `10..=24` are reserved for commands that are not wired up
//! yet; they decode but the dispatcher rejects them.

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

/// Size of the fixed frame header: one tag byte plus the 64-bit database id.
pub const HEADER_LEN: usize = 1 + 8;

/// Command tags as they appear on the wire.
///
/// The discriminants are fixed; reordering variants would silently break
/// every deployed client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Select = 0,
    Del = 1,
    Exists = 2,
    Move = 3,
    Rename = 4,
    RenameNx = 5,
    Type = 6,
    Set = 7,
    Get = 8,
    GetRange = 9,
    MGet = 10,
    SetNx = 11,
    SetRange = 12,
    StrLen = 13,
    MSet = 14,
    MSetNx = 15,
    Incr = 16,
    IncrBy = 17,
    Decr = 18,
    DecrBy = 19,
    Append = 20,
    HDel = 21,
    HExists = 22,
    HGet = 23,
    HGetAll = 24,
    Dump = 25,
}

impl Command {
    /// Decodes a wire tag byte.
    pub fn from_tag(tag: u8) -> Result<Self, FrameError> {
        Ok(match tag {
            0 => Command::Select,
            1 => Command::Del,
            2 => Command::Exists,
            3 => Command::Move,
            4 => Command::Rename,
            5 => Command::RenameNx,
            6 => Command::Type,
            7 => Command::Set,
            8 => Command::Get,
            9 => Command::GetRange,
            10 => Command::MGet,
            11 => Command::SetNx,
            12 => Command::SetRange,
            13 => Command::StrLen,
            14 => Command::MSet,
            15 => Command::MSetNx,
            16 => Command::Incr,
            17 => Command::IncrBy,
            18 => Command::Decr,
            19 => Command::DecrBy,
            20 => Command::Append,
            21 => Command::HDel,
            22 => Command::HExists,
            23 => Command::HGet,
            24 => Command::HGetAll,
            25 => Command::Dump,
            other => return Err(FrameError::UnknownTag(other)),
        })
    }

    /// The wire tag byte for this command.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Maps a client-side command word (upper case) to its tag.
    ///
    /// Only the commands implemented in v0 are accepted here; this is what
    /// the interactive client uses, so reserved tags stay unreachable from
    /// the REPL.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "SELECT" => Command::Select,
            "DEL" => Command::Del,
            "DUMP" => Command::Dump,
            "EXISTS" => Command::Exists,
            "MOVE" => Command::Move,
            "RENAME" => Command::Rename,
            "RENAMENX" => Command::RenameNx,
            "TYPE" => Command::Type,
            "SET" => Command::Set,
            "GET" => Command::Get,
            "GETRANGE" => Command::GetRange,
            _ => return None,
        })
    }
}

/// Errors that can occur while decoding a request frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The frame is shorter than the fixed header.
    #[error("frame truncated: {0} bytes, header needs {HEADER_LEN}")]
    Truncated(usize),

    /// The command tag byte is not assigned.
    #[error("unknown command tag: {0:#04x}")]
    UnknownTag(u8),
}

/// One decoded request unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The command tag.
    pub command: Command,
    /// Target database id.
    pub db: u64,
    /// Command-specific statement text (may be empty, e.g. for SELECT).
    pub statement: Bytes,
}

impl Frame {
    /// Decodes a frame from one request unit.
    pub fn parse(mut data: &[u8]) -> Result<Frame, FrameError> {
        if data.len() < HEADER_LEN {
            return Err(FrameError::Truncated(data.len()));
        }

        let command = Command::from_tag(data.get_u8())?;
        let db = data.get_u64_le();

        Ok(Frame {
            command,
            db,
            statement: Bytes::copy_from_slice(data),
        })
    }

    /// Encodes a request frame; the inverse of [`Frame::parse`].
    pub fn encode(command: Command, db: u64, statement: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + statement.len());
        buf.put_u8(command.tag());
        buf.put_u64_le(db);
        buf.put_slice(statement);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let encoded = Frame::encode(Command::Set, 3, b"key \"value\"");
        let frame = Frame::parse(&encoded).unwrap();

        assert_eq!(frame.command, Command::Set);
        assert_eq!(frame.db, 3);
        assert_eq!(&frame.statement[..], b"key \"value\"");
    }

    #[test]
    fn test_header_layout() {
        let encoded = Frame::encode(Command::Get, 0x0102, b"k");
        assert_eq!(encoded[0], 8);
        assert_eq!(&encoded[1..9], &[0x02, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&encoded[9..], b"k");
    }

    #[test]
    fn test_empty_statement() {
        let encoded = Frame::encode(Command::Select, 7, b"");
        let frame = Frame::parse(&encoded).unwrap();
        assert_eq!(frame.command, Command::Select);
        assert_eq!(frame.db, 7);
        assert!(frame.statement.is_empty());
    }

    #[test]
    fn test_truncated_frame() {
        assert_eq!(Frame::parse(b""), Err(FrameError::Truncated(0)));
        assert_eq!(Frame::parse(&[7, 0, 0, 0]), Err(FrameError::Truncated(4)));
    }

    #[test]
    fn test_unknown_tag() {
        let mut raw = Frame::encode(Command::Get, 0, b"k");
        raw[0] = 200;
        assert_eq!(Frame::parse(&raw), Err(FrameError::UnknownTag(200)));
    }

    #[test]
    fn test_tag_ordinals_are_fixed() {
        assert_eq!(Command::Select.tag(), 0);
        assert_eq!(Command::Del.tag(), 1);
        assert_eq!(Command::Exists.tag(), 2);
        assert_eq!(Command::Move.tag(), 3);
        assert_eq!(Command::Rename.tag(), 4);
        assert_eq!(Command::RenameNx.tag(), 5);
        assert_eq!(Command::Type.tag(), 6);
        assert_eq!(Command::Set.tag(), 7);
        assert_eq!(Command::Get.tag(), 8);
        assert_eq!(Command::GetRange.tag(), 9);
        assert_eq!(Command::HGetAll.tag(), 24);
        assert_eq!(Command::Dump.tag(), 25);
    }

    #[test]
    fn test_reserved_tags_decode() {
        let raw = Frame::encode(Command::Incr, 0, b"counter");
        let frame = Frame::parse(&raw).unwrap();
        assert_eq!(frame.command, Command::Incr);
    }
}
