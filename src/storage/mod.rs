//! Storage Engine
//!
//! The in-memory data plane: typed entries, the ordered skiplist index, and
//! the numbered databases wrapping one skiplist each behind a reader-writer
//! lock, all reached through the process-wide registry.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        Registry                            │
//! │            id → Database (0..=15 preallocated)             │
//! │                           │                                │
//! │                           ▼                                │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │ Database: RwLock<Skiplist>                           │  │
//! │  │                                                      │  │
//! │  │   Skiplist: ordered probabilistic index              │  │
//! │  │       └── Arc<Entry>: key + tagged value             │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Persistence
//!
//! Databases load from and save to `data/<id>.db` using the entry codec in
//! [`entry`]; the file body is the skiplist content in ascending key order
//! with no outer framing.
//!
//! ## Modules
//!
//! - `entry`: typed entries and the binary codec
//! - `skiplist`: the ordered index
//! - `database`: databases, the registry, and snapshot persistence

pub mod database;
pub mod entry;
pub mod skiplist;

// Re-export commonly used types
pub use database::{Database, Registry};
pub use entry::{DecodeError, Entry, Kind, Value};
pub use skiplist::Skiplist;
