//! Response Rendering
//!
//! The server answers every request with raw display bytes; there is no reply
//! framing, the client prints what the socket drains. This module is the
//! vocabulary of those responses:
//!
//! - bare simple text: `OK`
//! - double-quoted byte strings: `"value"`
//! - integers: `(integer) 2`
//! - absent values: `(nil)`
//! - errors: `(error) no such key`
//!
//! Quoting follows the original protocol exactly — some commands answer with
//! a quoted `"OK"`, SELECT answers with a bare `OK` — so the construction
//! sites pick the variant and this module only renders it.

use bytes::Bytes;
use std::fmt;

/// A single response unit, rendered to raw bytes with [`Reply::into_bytes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Bare text with no decoration, e.g. `OK`.
    Simple(&'static str),

    /// A byte string surrounded by ASCII double quotes. Internal quotes are
    /// not escaped in v0.
    Quoted(Bytes),

    /// `(integer) N`.
    Integer(u64),

    /// `(nil)`.
    Nil,

    /// `(error) <message>`.
    Error(String),
}

impl Reply {
    /// Quoted `"OK"`, the acknowledgement most mutating commands use.
    pub fn ok() -> Self {
        Reply::Quoted(Bytes::from_static(b"OK"))
    }

    /// Convenience constructor for quoted byte strings.
    pub fn quoted(data: impl Into<Bytes>) -> Self {
        Reply::Quoted(data.into())
    }

    /// Convenience constructor for errors.
    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error(message.into())
    }

    /// Renders the reply to the bytes that go on the wire.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Reply::Simple(text) => text.as_bytes().to_vec(),
            Reply::Quoted(data) => {
                let mut buf = Vec::with_capacity(data.len() + 2);
                buf.push(b'"');
                buf.extend_from_slice(&data);
                buf.push(b'"');
                buf
            }
            Reply::Integer(n) => format!("(integer) {}", n).into_bytes(),
            Reply::Nil => b"(nil)".to_vec(),
            Reply::Error(message) => format!("(error) {}", message).into_bytes(),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Simple(text) => write!(f, "{}", text),
            Reply::Quoted(data) => write!(f, "\"{}\"", String::from_utf8_lossy(data)),
            Reply::Integer(n) => write!(f, "(integer) {}", n),
            Reply::Nil => write!(f, "(nil)"),
            Reply::Error(message) => write!(f, "(error) {}", message),
        }
    }
}
