//! Submission/Completion Ring
//!
//! A thin wrapper over one io_uring instance, owned by exactly one reactor
//! thread. The reactor pushes submissions tagged with a 64-bit `userData`,
//! blocks for completions, and drains them through a callback; the
//! `userData` echoed on each completion is how it finds the task to resume.
//!
//! ## Ring configuration
//!
//! Rings are built with `CLAMP | SUBMIT_ALL | COOP_TASKRUN | TASKRUN_FLAG |
//! SINGLE_ISSUER | DEFER_TASKRUN`: one issuer per ring, completion work
//! deferred to the waiting thread, no IPIs for task work. All rings after
//! the first attach to the first ring's kernel work queue (`ATTACH_WQ`), so
//! the per-process worker pool is shared.
//!
//! ## Fixed files
//!
//! Each ring registers a sparse fixed-file table sized to the process fd
//! soft limit. Well-known fds (logger, listener, timer) occupy fixed slots;
//! accepted sockets are allocated into free slots by the kernel and all
//! per-client operations address those slots directly.

pub mod buffer;

pub use buffer::BufferRing;

use io_uring::{cqueue, squeue, IoUring};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

/// The result/flags pair delivered by one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Operation result: a length or fd on success, a negated errno on
    /// failure.
    pub result: i32,
    /// Completion flags (buffer id, MORE, SOCK_NONEMPTY, NOTIF).
    pub flags: u32,
}

impl Outcome {
    /// The OS error this outcome encodes, if it is a failure.
    pub fn error(&self) -> Option<io::Error> {
        (self.result < 0).then(|| io::Error::from_raw_os_error(-self.result))
    }
}

/// One drained completion event.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    /// The tag stamped on the originating submission.
    pub user_data: u64,
    /// The delivered result and flags.
    pub outcome: Outcome,
}

/// Whether more completions will follow on the same submission
/// (multishot accept/recv streams).
pub fn has_more(flags: u32) -> bool {
    cqueue::more(flags)
}

/// Whether the socket still holds unread bytes after this receive.
pub fn sock_nonempty(flags: u32) -> bool {
    cqueue::sock_nonempty(flags)
}

/// The provided-buffer id selected for this completion, if any.
pub fn selected_buffer(flags: u32) -> Option<u16> {
    cqueue::buffer_select(flags)
}

/// Whether this completion is a zero-copy send notification rather than an
/// operation result. The crate does not expose this flag; the bit is part of
/// the kernel ABI (IORING_CQE_F_NOTIF).
pub fn is_notification(flags: u32) -> bool {
    const CQE_NOTIF: u32 = 1 << 3;
    flags & CQE_NOTIF != 0
}

/// One reactor's io_uring instance.
pub struct Ring {
    ring: IoUring,
}

impl Ring {
    /// Creates a ring with `depth` submission entries, optionally attaching
    /// to another ring's kernel work queue.
    pub fn new(depth: u32, attach_wq: Option<RawFd>) -> io::Result<Ring> {
        let mut builder = IoUring::builder();
        builder
            .setup_clamp()
            .setup_submit_all()
            .setup_coop_taskrun()
            .setup_taskrun_flag()
            .setup_single_issuer()
            .setup_defer_taskrun();
        if let Some(fd) = attach_wq {
            builder.setup_attach_wq(fd);
        }

        Ok(Ring {
            ring: builder.build(depth)?,
        })
    }

    /// The ring's own file descriptor (used for the shared work queue).
    pub fn fd(&self) -> RawFd {
        self.ring.as_raw_fd()
    }

    /// Registers a sparse fixed-file table of `count` slots.
    pub fn register_sparse_files(&self, count: u32) -> io::Result<()> {
        self.ring.submitter().register_files_sparse(count)
    }

    /// Installs `fds` into the fixed-file table starting at `offset`.
    pub fn register_fixed_files(&self, offset: u32, fds: &[RawFd]) -> io::Result<()> {
        self.ring.submitter().register_files_update(offset, fds)?;
        Ok(())
    }

    /// Registers a provided-buffer ring for zero-copy receives.
    pub fn register_buffer_ring(
        &self,
        entries: u16,
        buffer_size: usize,
        group: u16,
    ) -> io::Result<BufferRing> {
        BufferRing::register(&self.ring.submitter(), entries, buffer_size, group)
    }

    /// Queues one submission. A full submission queue is flushed to the
    /// kernel and the push retried.
    pub fn push(&mut self, entry: squeue::Entry) -> io::Result<()> {
        loop {
            // Safety: every entry is built over resources that stay alive
            // until its completion is reaped — tasks own their buffers for
            // the duration of the await.
            let pushed = unsafe { self.ring.submission().push(&entry).is_ok() };
            if pushed {
                return Ok(());
            }
            self.ring.submit()?;
        }
    }

    /// Submits queued entries and blocks until at least `want` completions
    /// are available. Interruption by a signal is not an error; the caller
    /// rechecks its run flag and comes back.
    pub fn wait(&self, want: usize) -> io::Result<usize> {
        match self.ring.submitter().submit_and_wait(want) {
            Ok(n) => Ok(n),
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => Ok(0),
            Err(err) => Err(err),
        }
    }

    /// Drains the completion queue, invoking `visit` for each event.
    ///
    /// # Returns
    ///
    /// The number of completions drained.
    pub fn poll(&mut self, mut visit: impl FnMut(Completion)) -> usize {
        let mut drained = 0;
        let mut completions = self.ring.completion();
        completions.sync();
        for cqe in &mut completions {
            visit(Completion {
                user_data: cqe.user_data(),
                outcome: Outcome {
                    result: cqe.result(),
                    flags: cqe.flags(),
                },
            });
            drained += 1;
        }
        drained
    }
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring").field("fd", &self.fd()).finish()
    }
}

/// The process fd soft limit, which sizes the fixed-file table.
pub fn file_descriptor_limit() -> u32 {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // Safety: plain getrlimit into a zeroed struct.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if rc != 0 {
        return 1024;
    }
    limit.rlim_cur.min(u32::MAX as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_error() {
        let ok = Outcome { result: 12, flags: 0 };
        assert!(ok.error().is_none());

        let err = Outcome {
            result: -libc::ECONNRESET,
            flags: 0,
        };
        assert_eq!(
            err.error().unwrap().raw_os_error(),
            Some(libc::ECONNRESET)
        );
    }

    #[test]
    fn test_notification_flag() {
        assert!(!is_notification(0));
        assert!(is_notification(1 << 3));
    }

    #[test]
    fn test_fd_limit_is_sane() {
        assert!(file_descriptor_limit() >= 64);
    }
}
