//! Client Connections
//!
//! Per-client state on the server side, plus the listening socket the accept
//! stream runs over.
//!
//! ## Connection lifecycle
//!
//! ```text
//! 1. multishot accept completion delivers a fixed-file slot
//!        │
//!        ▼
//! 2. Client record created, receive task armed
//!        │
//!        ▼
//! 3. ┌───────────────────────────────────────────────┐
//!    │ receive completion: append chunk to buffer    │
//!    │ socket drained? → dispatch, send reply, clear │
//!    └───────────────────────────────────────────────┘
//!        │
//!        ▼
//! 4. recv result <= 0 / stream ends → close task, record removed
//! ```
//!
//! A client is bound to the worker that accepted it for its whole life, so
//! none of this state is shared between threads.

use bytes::BytesMut;
use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::{FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};

/// Initial capacity of the per-client accumulation buffer.
const INITIAL_BUFFER_SIZE: usize = 4096;

/// One connected client.
#[derive(Debug)]
pub struct Client {
    /// The client's slot in the ring's fixed-file table.
    index: u32,
    /// Accumulates received bytes until the socket drains into one request.
    buffer: BytesMut,
}

impl Client {
    /// Creates the record for a freshly accepted connection.
    pub fn new(index: u32) -> Self {
        Self {
            index,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
        }
    }

    /// The fixed-file slot this client's socket occupies.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Appends one received chunk.
    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Takes the accumulated request, leaving the buffer empty for the next
    /// one.
    pub fn take_request(&mut self) -> BytesMut {
        self.buffer.split()
    }
}

/// Per-worker connection counters, reported when the worker exits.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total requests dispatched
    pub requests_processed: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn request_processed(&self) {
        self.requests_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Creates the listening socket for one worker.
///
/// Every worker binds its own listener with `SO_REUSEPORT`, so the kernel
/// spreads incoming connections across the reactors and no accept lock is
/// shared between threads.
pub fn listen(host: Ipv4Addr, port: u16, backlog: i32) -> io::Result<OwnedFd> {
    // Safety: raw socket setup; each call's return code is checked and the
    // fd is owned immediately after creation.
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = OwnedFd::from_raw_fd(fd);

        let one: libc::c_int = 1;
        for option in [libc::SO_REUSEADDR, libc::SO_REUSEPORT] {
            let rc = libc::setsockopt(
                raw(&fd),
                libc::SOL_SOCKET,
                option,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of_val(&one) as libc::socklen_t,
            );
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = u32::from(host).to_be();

        let rc = libc::bind(
            raw(&fd),
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        if libc::listen(raw(&fd), backlog) != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(fd)
    }
}

fn raw(fd: &OwnedFd) -> libc::c_int {
    use std::os::unix::io::AsRawFd;
    fd.as_raw_fd()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_accumulates_until_taken() {
        let mut client = Client::new(9);
        assert_eq!(client.index(), 9);

        client.push_bytes(b"hello ");
        client.push_bytes(b"world");
        assert_eq!(&client.take_request()[..], b"hello world");

        // The buffer starts over after a request is taken.
        client.push_bytes(b"next");
        assert_eq!(&client.take_request()[..], b"next");
    }

    #[test]
    fn test_stats_counters() {
        let stats = ConnectionStats::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        stats.request_processed();
        stats.bytes_read(10);
        stats.bytes_written(20);

        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 2);
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 1);
        assert_eq!(stats.requests_processed.load(Ordering::Relaxed), 1);
        assert_eq!(stats.bytes_read.load(Ordering::Relaxed), 10);
        assert_eq!(stats.bytes_written.load(Ordering::Relaxed), 20);
    }

    #[test]
    fn test_listen_binds_ephemeral_port() {
        let fd = listen(Ipv4Addr::LOCALHOST, 0, 16).unwrap();
        drop(fd);
    }
}
