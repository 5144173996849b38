//! Provided-Buffer Ring
//!
//! Receives do not carry caller buffers: the kernel picks a buffer out of a
//! pre-registered pool and echoes its id in the completion flags. This keeps
//! one multishot receive armed per client without pinning a buffer per
//! client.
//!
//! The pool is a shared ring of `io_uring_buf` descriptors in memory both
//! sides can see. The kernel consumes descriptors as data arrives; after the
//! reactor copies a completion's bytes out, it writes the descriptor back at
//! the tail and, once per reactor frame, publishes the new tail with a
//! release store.

use io_uring::types::BufRingEntry;
use io_uring::Submitter;
use std::alloc::{self, Layout};
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU16, Ordering};

/// A registered pool of equal-sized receive buffers.
pub struct BufferRing {
    descriptors: NonNull<BufRingEntry>,
    layout: Layout,
    buffers: Vec<Box<[u8]>>,
    buffer_size: usize,
    mask: u16,
    /// Last tail value published to the kernel.
    tail: u16,
    /// Descriptors written back but not yet published.
    pending: u16,
    group: u16,
}

// The descriptor memory is owned by this struct and only touched from the
// owning reactor thread; the kernel side synchronizes through the tail.
unsafe impl Send for BufferRing {}

impl BufferRing {
    /// Allocates and registers a buffer ring of `entries` buffers of
    /// `buffer_size` bytes under buffer group `group`.
    ///
    /// `entries` must be a power of two (kernel requirement).
    pub fn register(
        submitter: &Submitter<'_>,
        entries: u16,
        buffer_size: usize,
        group: u16,
    ) -> io::Result<BufferRing> {
        assert!(entries.is_power_of_two(), "buffer ring size must be 2^n");

        let layout = Layout::array::<BufRingEntry>(entries as usize)
            .and_then(|layout| layout.align_to(4096))
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

        // Safety: layout has non-zero size for any entries >= 1.
        let descriptors = unsafe { alloc::alloc_zeroed(layout) } as *mut BufRingEntry;
        let descriptors = NonNull::new(descriptors).ok_or(io::ErrorKind::OutOfMemory)?;

        // Safety: the memory stays alive (and pinned in this struct) for as
        // long as the registration; the ring fd releases it on close.
        unsafe { submitter.register_buf_ring(descriptors.as_ptr() as u64, entries, group)? };

        let buffers = (0..entries)
            .map(|_| vec![0u8; buffer_size].into_boxed_slice())
            .collect();

        let mut ring = BufferRing {
            descriptors,
            layout,
            buffers,
            buffer_size,
            mask: entries - 1,
            tail: 0,
            pending: 0,
            group,
        };

        // Hand the whole pool to the kernel up front.
        for id in 0..entries {
            ring.recycle(id);
        }
        ring.publish();

        Ok(ring)
    }

    /// The buffer group id to pass on provided-buffer receives.
    pub fn group(&self) -> u16 {
        self.group
    }

    /// The bytes the kernel placed in buffer `id` for a completion of
    /// `len` bytes.
    pub fn data(&self, id: u16, len: usize) -> &[u8] {
        &self.buffers[id as usize][..len.min(self.buffer_size)]
    }

    /// Queues buffer `id` to be handed back to the kernel.
    pub fn recycle(&mut self, id: u16) {
        let slot = (self.tail.wrapping_add(self.pending) & self.mask) as usize;
        let buffer = &mut self.buffers[id as usize];
        // Safety: slot is within the registered descriptor array.
        unsafe {
            let descriptor = &mut *self.descriptors.as_ptr().add(slot);
            descriptor.set_addr(buffer.as_mut_ptr() as u64);
            descriptor.set_len(self.buffer_size as u32);
            descriptor.set_bid(id);
        }
        self.pending += 1;
    }

    /// Publishes all recycled buffers to the kernel. Called once per reactor
    /// frame after the completion queue is drained.
    pub fn publish(&mut self) {
        if self.pending == 0 {
            return;
        }
        self.tail = self.tail.wrapping_add(self.pending);
        self.pending = 0;
        // Safety: the tail field lives inside the registered descriptor
        // array; the release store pairs with the kernel's acquire load.
        unsafe {
            let tail = BufRingEntry::tail(self.descriptors.as_ptr()) as *const AtomicU16;
            (*tail).store(self.tail, Ordering::Release);
        }
    }
}

impl Drop for BufferRing {
    fn drop(&mut self) {
        // Safety: allocated with the identical layout in register().
        unsafe { alloc::dealloc(self.descriptors.as_ptr() as *mut u8, self.layout) };
    }
}

impl std::fmt::Debug for BufferRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferRing")
            .field("group", &self.group)
            .field("entries", &self.buffers.len())
            .field("buffer_size", &self.buffer_size)
            .finish()
    }
}
