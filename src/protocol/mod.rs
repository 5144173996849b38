//! Wire Protocol
//!
//! Everything the server and client must agree on: the request frame and the
//! response text.
//!
//! ## Request direction
//!
//! One request per frame, delimited by the socket drain:
//!
//! ```text
//! | 1 byte command tag | 8 bytes LE db-id | statement bytes... |
//! ```
//!
//! ## Response direction
//!
//! Raw display bytes with no framing; the server sends exactly one response
//! per request, and per-connection requests are processed in order, so the
//! client never sees interleaved replies.
//!
//! ## Modules
//!
//! - `frame`: command tags and the request frame codec
//! - `reply`: the response vocabulary and its rendering

pub mod frame;
pub mod reply;

// Re-export commonly used types for convenience
pub use frame::{Command, Frame, FrameError};
pub use reply::Reply;
