//! Reactor Log Sink
//!
//! The reactor must never block on its log output, so in-loop log records
//! are not written where they happen: they are pushed onto this queue and
//! flushed through the ring by a dedicated write task whenever the queue is
//! writable. The sink fd is registered at a fixed slot like the listener and
//! the timer, and is closed through the ring during shutdown like everything
//! else.
//!
//! Records are double-buffered: `push` appends to the incoming queue, a
//! write task snapshots it into the in-flight buffer (whose bytes must stay
//! put while the kernel works), and `wrote` retires whatever the write
//! covered, keeping any unwritten tail for the next pass.
//!
//! Process-level logging outside the reactor loop (startup, shutdown, worker
//! lifecycle) goes through `tracing` instead; this sink exists for the paths
//! where a synchronous write would stall every connection on the worker.

use std::io;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::time::{SystemTime, UNIX_EPOCH};

/// Severity of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Level {
    fn name(self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

/// One log record.
#[derive(Debug, Clone)]
pub struct Log {
    pub level: Level,
    pub message: String,
}

impl Log {
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

/// Queued log records draining to a fixed fd through the ring.
#[derive(Debug)]
pub struct Logger {
    fd: OwnedFd,
    /// Records formatted and waiting for a write task.
    queue: Vec<u8>,
    /// Bytes currently exposed to the kernel; stable until `wrote`.
    inflight: Vec<u8>,
    /// A write task holds the in-flight buffer right now.
    writing: bool,
}

impl Logger {
    /// Creates a logger over a dup of stderr.
    pub fn stderr() -> io::Result<Logger> {
        // Safety: dup of a standard descriptor; ownership of the duplicate
        // transfers to the OwnedFd.
        let fd = unsafe { libc::dup(libc::STDERR_FILENO) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Logger {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            queue: Vec::new(),
            inflight: Vec::new(),
            writing: false,
        })
    }

    /// The sink's raw fd, registered at a fixed slot by the scheduler.
    pub fn raw_fd(&self) -> RawFd {
        use std::os::unix::io::AsRawFd;
        self.fd.as_raw_fd()
    }

    /// Queues one record.
    pub fn push(&mut self, log: Log) {
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        self.queue
            .extend_from_slice(format!("{} {} {}\n", seconds, log.level.name(), log.message).as_bytes());
    }

    /// Whether a write task should be submitted.
    pub fn writable(&self) -> bool {
        !self.writing && (!self.queue.is_empty() || !self.inflight.is_empty())
    }

    /// Stages pending bytes for one ring write.
    ///
    /// # Returns
    ///
    /// The pointer/length pair for the submission. The pointed-to bytes stay
    /// valid until [`Logger::wrote`].
    pub fn begin_write(&mut self) -> (*const u8, usize) {
        debug_assert!(!self.writing);
        if self.inflight.is_empty() {
            std::mem::swap(&mut self.inflight, &mut self.queue);
        }
        self.writing = true;
        (self.inflight.as_ptr(), self.inflight.len())
    }

    /// Retires `written` bytes after a write completion; a short write keeps
    /// the tail in flight for the next pass.
    pub fn wrote(&mut self, written: usize) {
        self.inflight.drain(..written.min(self.inflight.len()));
        self.writing = false;
    }

    /// Abandons an in-flight write after an error, keeping the bytes queued.
    pub fn write_failed(&mut self) {
        self.writing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_formats_records() {
        let mut logger = Logger::stderr().unwrap();
        logger.push(Log::new(Level::Warn, "connection closed"));

        assert!(logger.writable());
        let (_, len) = logger.begin_write();
        let staged = String::from_utf8(logger.inflight[..len].to_vec()).unwrap();
        assert!(staged.ends_with("warn connection closed\n"));
    }

    #[test]
    fn test_write_cycle() {
        let mut logger = Logger::stderr().unwrap();
        logger.push(Log::new(Level::Info, "one"));

        let (_, len) = logger.begin_write();
        assert!(!logger.writable(), "no second write while one is in flight");

        // Records arriving mid-write queue up for the next pass.
        logger.push(Log::new(Level::Info, "two"));

        logger.wrote(len);
        assert!(logger.writable());
        let (_, len) = logger.begin_write();
        let staged = String::from_utf8(logger.inflight[..len].to_vec()).unwrap();
        assert!(staged.contains("two"));
        logger.wrote(len);
        assert!(!logger.writable());
    }

    #[test]
    fn test_short_write_keeps_tail() {
        let mut logger = Logger::stderr().unwrap();
        logger.push(Log::new(Level::Error, "abcdefgh"));

        let (_, len) = logger.begin_write();
        logger.wrote(len - 3);

        assert!(logger.writable());
        let (_, remaining) = logger.begin_write();
        assert_eq!(remaining, 3);
    }
}
