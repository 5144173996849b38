//! Command Processing
//!
//! This module is the bridge between the wire and the storage engine: it
//! consumes one framed request and produces one reply.
//!
//! ```text
//! framed request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │  Frame::parse   │  (protocol module)
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  (this module)
//! │  - resolve db   │
//! │  - parse stmt   │
//! │  - execute      │
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐
//! │    Registry     │  (storage module)
//! └─────────────────┘
//! ```
//!
//! ## Implemented commands
//!
//! `SELECT`, `DEL`, `DUMP`, `EXISTS`, `MOVE`, `RENAME`, `RENAMENX`, `TYPE`,
//! `SET`, `GET`, `GETRANGE`. The remaining wire tags are reserved and answer
//! `(error) unknown command`.

pub mod handler;

// Re-export the main command handler
pub use handler::CommandHandler;
