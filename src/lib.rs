//! # tinyredis - A Multi-Database In-Memory Key-Value Store
//!
//! tinyredis is a single-host key-value server in the familiar style: clients
//! hold a persistent connection, send small tagged command frames, and get
//! human-readable replies. Every database is an ordered in-memory index that
//! survives restarts through binary snapshot files.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                             tinyredis                                │
//! │                                                                      │
//! │   worker thread 0        worker thread 1        worker thread n      │
//! │  ┌───────────────┐      ┌───────────────┐      ┌───────────────┐     │
//! │  │  Scheduler    │      │  Scheduler    │      │  Scheduler    │     │
//! │  │  (io_uring)   │      │  (io_uring)   │      │  (io_uring)   │     │
//! │  │ accept/recv/  │      │      …        │      │      …        │     │
//! │  │ send/timer    │      │               │      │               │     │
//! │  └───────┬───────┘      └───────┬───────┘      └───────┬───────┘     │
//! │          │ CommandHandler       │                      │             │
//! │          ▼                      ▼                      ▼             │
//! │  ┌────────────────────────────────────────────────────────────────┐  │
//! │  │                     Registry (shared)                          │  │
//! │  │   id → Database { RwLock<Skiplist over Arc<Entry>> }           │  │
//! │  └────────────────────────────────────────────────────────────────┘  │
//! │          │                                                           │
//! │          ▼  on clean shutdown                                        │
//! │     data/<id>.db  (atomic replace)                                   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design highlights
//!
//! ### Completion-driven scheduling
//!
//! Each worker owns one io_uring and drives every connection it accepted as
//! cooperative tasks: exactly one in-flight submission per task, demuxed back
//! by the 64-bit userData echoed on completions. Receives use a registered
//! provided-buffer ring, so no per-client receive buffer is pinned while a
//! connection idles.
//!
//! ### Ordered storage
//!
//! Databases index entries with a probabilistic skiplist (geometric level
//! draw, byte-lexicographic order) behind a reader-writer lock. Entries hand
//! out as shared snapshots, so reads never copy values.
//!
//! ### Persistence
//!
//! Each database serializes to `data/<id>.db` on clean shutdown with
//! write-to-temp + fsync + rename; files load back at startup and a corrupt
//! file refuses to serve rather than serving half a namespace.
//!
//! ## Module Overview
//!
//! - [`protocol`]: the wire frame and reply rendering
//! - [`storage`]: entries, the skiplist, databases, the registry
//! - [`commands`]: the command dispatcher
//! - [`ring`]: io_uring wrapper and the provided-buffer ring
//! - [`scheduler`]: the per-thread reactor and its tasks
//! - [`connection`]: per-client state and the reuseport listener
//! - [`logger`]: the reactor's non-blocking log sink

pub mod commands;
pub mod connection;
pub mod logger;
pub mod protocol;
pub mod ring;
pub mod scheduler;
pub mod storage;

// Re-export commonly used types for convenience
pub use commands::CommandHandler;
pub use protocol::{Command, Frame, Reply};
pub use scheduler::Scheduler;
pub use storage::{Database, Entry, Registry, Skiplist};

/// The default port the server listens on.
pub const DEFAULT_PORT: u16 = 6379;

/// The default host the server binds to.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// The default data directory for database snapshots.
pub const DEFAULT_DATA_DIR: &str = "data";

/// Version of tinyredis
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
