//! Per-Thread Reactor
//!
//! One `Scheduler` per worker thread drives all I/O for the connections that
//! worker accepted. Everything is completion-driven: the reactor submits
//! operations tagged with a userData, blocks for completions, and resumes
//! the one task each completion belongs to.
//!
//! ```text
//! ┌────────────────────────── worker thread ──────────────────────────┐
//! │                                                                   │
//! │   Ring (io_uring) ── wait(1) ── poll ──┐                          │
//! │        ▲                               ▼                          │
//! │   submissions                   userData → Task                   │
//! │        │                               │                          │
//! │   ┌────┴───────────────────────────────▼───────────────────────┐  │
//! │   │ accept task   receive task/client   send task   timing …   │  │
//! │   └─────────────────────────┬────────────────────────────────-─┘  │
//! │                             ▼                                     │
//! │                      CommandHandler ─── Registry (shared)         │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Scheduling model
//!
//! Within a worker, tasks are single-threaded and cooperative; the only
//! suspension points are awaited ring operations (accept, recv, send, timer
//! read, close, logger write). There is no work stealing: a client is bound
//! to the worker that accepted it for the connection's lifetime, which is
//! what guarantees in-order replies on a connection.
//!
//! Across workers, rings share one kernel work queue (the first ring's), a
//! mutex-guarded fd table used only at construction/destruction, and the
//! atomic run flag cleared by SIGINT/SIGTERM.

pub mod task;

pub use task::{Op, OpChannel, Task, TaskFuture};

use crate::commands::CommandHandler;
use crate::connection::{self, Client, ConnectionStats};
use crate::logger::{Level, Log, Logger};
use crate::ring::{self, BufferRing, Outcome, Ring};
use crate::storage::Registry;
use anyhow::Context as _;
use io_uring::{opcode, squeue, types};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info};

/// Fixed-file slots for the well-known descriptors, in registration order.
pub const LOGGER_SLOT: u32 = 0;
pub const SERVER_SLOT: u32 = 1;
pub const TIMER_SLOT: u32 = 2;

/// Submission-queue entries shared across all reactors; each ring gets an
/// equal share.
const TOTAL_RING_ENTRIES: u32 = 2048;

/// Provided-buffer pool shape: group id, buffer count, bytes per buffer.
const BUFFER_GROUP: u16 = 0;
const RING_BUFFERS: u16 = 256;
const RECV_BUFFER_SIZE: usize = 8192;

/// Listen backlog for each worker's reuseport listener.
const LISTEN_BACKLOG: i32 = 1024;

/// Tick interval for the timing task.
const TICK: Duration = Duration::from_secs(1);

/// Process-wide run flag. Signal handlers clear it; every reactor notices at
/// the top of its loop and shuts down in order.
pub static SWITCHER: AtomicBool = AtomicBool::new(true);

thread_local! {
    static SCHEDULER_ON_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// The process-wide table of ring fds: one slot per hardware thread, plus
/// the fd of the ring whose kernel work queue everyone attaches to. Touched
/// only while reactors are constructed or destroyed.
struct RingTable {
    slots: Vec<RawFd>,
    shared_wq: RawFd,
}

static RING_TABLE: Mutex<RingTable> = Mutex::new(RingTable {
    slots: Vec::new(),
    shared_wq: -1,
});

/// Installs the SIGINT/SIGTERM handlers that clear [`SWITCHER`].
pub fn install_signal_handlers() -> io::Result<()> {
    extern "C" fn clear_switcher(_signal: libc::c_int) {
        SWITCHER.store(false, Ordering::Relaxed);
    }

    // Safety: sigaction with a handler that only touches an atomic.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        let handler: extern "C" fn(libc::c_int) = clear_switcher;
        action.sa_sigaction = handler as usize;

        for signal in [libc::SIGINT, libc::SIGTERM] {
            if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

/// Constructs a scheduler on the current thread and runs it to completion.
pub fn run_worker(registry: Arc<Registry>, host: Ipv4Addr, port: u16) -> anyhow::Result<()> {
    let scheduler = Scheduler::new(registry, host, port)?;
    scheduler.run()
}

/// State shared between the reactor loop and its task bodies.
struct Shared {
    ring: RefCell<Ring>,
    buffers: RefCell<BufferRing>,
    channel: Rc<OpChannel>,
    tasks: RefCell<HashMap<u64, Rc<Task>>>,
    clients: RefCell<HashMap<u32, Client>>,
    logger: RefCell<Logger>,
    handler: CommandHandler,
    stats: ConnectionStats,
    /// userData of the task being resumed, so a task can delete itself.
    current_user_data: Cell<u64>,
    next_user_data: Cell<u64>,
    /// Set by fatal task failures (accept or timer stream ending); the run
    /// loop exits at its next top.
    halted: Cell<bool>,
    /// Keep the raw descriptors alive for the scheduler's lifetime; ring
    /// operations address their fixed slots.
    _server: OwnedFd,
    _timer: OwnedFd,
}

impl Shared {
    /// Builds the awaitable for one ring operation.
    fn op(&self, entry: squeue::Entry) -> Op {
        Op::new(Rc::clone(&self.channel), entry)
    }

    /// Primes a task, pushes its staged submission, and files it under a
    /// fresh userData.
    fn submit(self: &Rc<Self>, future: TaskFuture) {
        let task = Task::new(future);
        if task.poll().is_ready() {
            self.channel.clear();
            return;
        }
        let entry = match self.channel.take_staged() {
            Some(entry) => entry,
            None => return,
        };

        let user_data = self.next_user_data.get();
        self.next_user_data.set(user_data + 1);

        if let Err(err) = self.ring.borrow_mut().push(entry.user_data(user_data)) {
            self.warn(format!("submission failed: {}", err));
            return;
        }
        self.tasks.borrow_mut().insert(user_data, task);
    }

    /// Resumes the task a completion belongs to.
    fn resume(&self, user_data: u64, outcome: Outcome) {
        let task = match self.tasks.borrow().get(&user_data) {
            Some(task) => Rc::clone(task),
            // The task already erased itself (e.g. a late completion after a
            // send task finished); nothing to resume.
            None => return,
        };
        self.current_user_data.set(user_data);
        self.channel.deliver(outcome);
        let _ = task.poll();
        self.channel.clear();
    }

    /// Removes the task currently being resumed. Every task calls this on
    /// its way out.
    fn erase_current_task(&self) {
        self.tasks.borrow_mut().remove(&self.current_user_data.get());
    }

    fn warn(&self, message: String) {
        self.logger.borrow_mut().push(Log::new(Level::Warn, message));
    }

    fn has_client(&self, index: u32) -> bool {
        self.clients.borrow().contains_key(&index)
    }
}

/// Which fixed descriptor a close task targets.
#[derive(Debug, Clone, Copy)]
enum Owner {
    Logger,
    Server,
    Timer,
    Client(u32),
}

impl Owner {
    fn slot(self) -> u32 {
        match self {
            Owner::Logger => LOGGER_SLOT,
            Owner::Server => SERVER_SLOT,
            Owner::Timer => TIMER_SLOT,
            Owner::Client(index) => index,
        }
    }
}

/// One worker's reactor.
pub struct Scheduler {
    shared: Rc<Shared>,
}

impl Scheduler {
    /// Builds the reactor for the current thread: ring, CPU pin, fixed-file
    /// table, listener, timer, logger, and buffer ring.
    pub fn new(registry: Arc<Registry>, host: Ipv4Addr, port: u16) -> anyhow::Result<Scheduler> {
        if SCHEDULER_ON_THREAD.with(|flag| flag.replace(true)) {
            anyhow::bail!("one thread can only run one scheduler");
        }

        let (ring, slot) = create_ring()?;
        pin_to_cpu(slot);

        ring.register_sparse_files(ring::file_descriptor_limit())
            .context("register sparse fixed-file table")?;

        let logger = Logger::stderr().context("create logger sink")?;
        let server = connection::listen(host, port, LISTEN_BACKLOG)
            .with_context(|| format!("listen on {}:{}", host, port))?;
        let timer = create_timer(TICK).context("create timerfd")?;

        ring.register_fixed_files(
            LOGGER_SLOT,
            &[logger.raw_fd(), server.as_raw_fd(), timer.as_raw_fd()],
        )
        .context("register fixed descriptors")?;

        let buffers = ring
            .register_buffer_ring(RING_BUFFERS, RECV_BUFFER_SIZE, BUFFER_GROUP)
            .context("register buffer ring")?;

        info!(slot, port, "scheduler ready");

        Ok(Scheduler {
            shared: Rc::new(Shared {
                ring: RefCell::new(ring),
                buffers: RefCell::new(buffers),
                channel: OpChannel::new(),
                tasks: RefCell::new(HashMap::new()),
                clients: RefCell::new(HashMap::new()),
                logger: RefCell::new(logger),
                handler: CommandHandler::new(registry),
                stats: ConnectionStats::new(),
                current_user_data: Cell::new(0),
                next_user_data: Cell::new(1),
                halted: Cell::new(false),
                _server: server,
                _timer: timer,
            }),
        })
    }

    /// Runs the reactor until the run flag clears or a fatal stream ends,
    /// then shuts down in order.
    pub fn run(&self) -> anyhow::Result<()> {
        self.shared.submit(accept_stream(Rc::clone(&self.shared)));
        self.shared.submit(timing(Rc::clone(&self.shared)));

        while SWITCHER.load(Ordering::Relaxed) && !self.shared.halted.get() {
            if self.shared.logger.borrow().writable() {
                self.shared.submit(flush_logs(Rc::clone(&self.shared)));
            }

            self.shared.ring.borrow().wait(1).context("ring wait")?;
            self.frame();
        }

        self.close_all();

        let stats = &self.shared.stats;
        info!(
            connections = stats.connections_accepted.load(Ordering::Relaxed),
            requests = stats.requests_processed.load(Ordering::Relaxed),
            bytes_in = stats.bytes_read.load(Ordering::Relaxed),
            bytes_out = stats.bytes_written.load(Ordering::Relaxed),
            "scheduler stopped"
        );
        Ok(())
    }

    /// One reactor frame: drain completions, resume their tasks, publish
    /// recycled receive buffers.
    ///
    /// Zero-length zero-copy notifications carry no task work and are
    /// skipped; their operation's real completion already resumed the task.
    fn frame(&self) {
        let mut completions = Vec::new();
        self.shared
            .ring
            .borrow_mut()
            .poll(|completion| completions.push(completion));

        for completion in completions {
            let outcome = completion.outcome;
            if outcome.result != 0 || !ring::is_notification(outcome.flags) {
                self.shared.resume(completion.user_data, outcome);
            }
        }

        self.shared.buffers.borrow_mut().publish();
    }

    /// Orderly shutdown: close every client, then the timer, server, and
    /// logger, and reap exactly those completions.
    fn close_all(&self) {
        let indices: Vec<u32> = self.shared.clients.borrow().keys().copied().collect();
        for index in &indices {
            self.shared
                .submit(close_owner(Rc::clone(&self.shared), Owner::Client(*index)));
        }
        self.shared
            .submit(close_owner(Rc::clone(&self.shared), Owner::Timer));
        self.shared
            .submit(close_owner(Rc::clone(&self.shared), Owner::Server));
        self.shared
            .submit(close_owner(Rc::clone(&self.shared), Owner::Logger));

        if let Err(err) = self.shared.ring.borrow().wait(3 + indices.len()) {
            error!(error = %err, "shutdown wait failed");
            return;
        }
        self.frame();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let mut table = RING_TABLE.lock().unwrap();
        let fd = self.shared.ring.borrow().fd();

        if let Some(slot) = table.slots.iter().position(|&entry| entry == fd) {
            table.slots[slot] = -1;
        }
        if table.shared_wq == fd {
            table.shared_wq = table
                .slots
                .iter()
                .copied()
                .find(|&entry| entry != -1)
                .unwrap_or(-1);
        }

        SCHEDULER_ON_THREAD.with(|flag| flag.set(false));
    }
}

/// Creates this reactor's ring through the process-wide table: the first
/// ring donates its kernel work queue, later rings attach to it, and each
/// ring takes one table slot (its CPU assignment).
fn create_ring() -> anyhow::Result<(Ring, usize)> {
    let mut table = RING_TABLE.lock().unwrap();
    if table.slots.is_empty() {
        table.slots = vec![-1; num_cpus::get().max(1)];
    }

    let depth = (TOTAL_RING_ENTRIES / table.slots.len() as u32).max(8);
    let attach_wq = (table.shared_wq != -1).then_some(table.shared_wq);

    let ring = Ring::new(depth, attach_wq).context("create io_uring")?;

    if table.shared_wq == -1 {
        table.shared_wq = ring.fd();
    }

    let slot = table
        .slots
        .iter()
        .position(|&entry| entry == -1)
        .context("more schedulers than ring-table slots")?;
    table.slots[slot] = ring.fd();

    Ok((ring, slot))
}

fn pin_to_cpu(slot: usize) {
    if let Some(cores) = core_affinity::get_core_ids() {
        if !cores.is_empty() {
            core_affinity::set_for_current(cores[slot % cores.len()]);
        }
    }
}

/// Creates the 1-second tick descriptor.
fn create_timer(interval: Duration) -> io::Result<OwnedFd> {
    // Safety: timerfd creation and arming; return codes checked.
    unsafe {
        let fd = libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_CLOEXEC);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = OwnedFd::from_raw_fd(fd);

        let tick = libc::timespec {
            tv_sec: interval.as_secs() as libc::time_t,
            tv_nsec: interval.subsec_nanos() as libc::c_long,
        };
        let spec = libc::itimerspec {
            it_interval: tick,
            it_value: tick,
        };
        if libc::timerfd_settime(fd.as_raw_fd(), 0, &spec, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fd)
    }
}

fn outcome_error_text(outcome: Outcome) -> String {
    outcome
        .error()
        .map(|err| err.to_string())
        .unwrap_or_else(|| "connection closed".to_string())
}

/// The multishot accept stream. Each completion with MORE set is one new
/// client; a completion without MORE means the stream died and the reactor
/// cannot serve anymore.
fn accept_stream(shared: Rc<Shared>) -> TaskFuture {
    Box::pin(async move {
        loop {
            let entry = opcode::AcceptMulti::new(types::Fixed(SERVER_SLOT))
                .allocate_file_index(true)
                .build();
            let outcome = shared.op(entry).await;

            if outcome.result >= 0 && ring::has_more(outcome.flags) {
                let index = outcome.result as u32;
                shared.clients.borrow_mut().insert(index, Client::new(index));
                shared.stats.connection_opened();
                shared.submit(receive_stream(Rc::clone(&shared), index));
            } else {
                shared.logger.borrow_mut().push(Log::new(
                    Level::Fatal,
                    format!("accept stream ended: {}", outcome_error_text(outcome)),
                ));
                shared.halted.set(true);
                break;
            }
        }
        shared.erase_current_task();
    })
}

/// One client's multishot receive stream. Chunks accumulate until the
/// socket drains, at which point the buffered bytes are one request.
fn receive_stream(shared: Rc<Shared>, index: u32) -> TaskFuture {
    Box::pin(async move {
        let group = shared.buffers.borrow().group();
        loop {
            let entry = opcode::RecvMulti::new(types::Fixed(index), group).build();
            let outcome = shared.op(entry).await;

            if outcome.result > 0 && ring::has_more(outcome.flags) {
                let length = outcome.result as usize;
                shared.stats.bytes_read(length);

                if let Some(id) = ring::selected_buffer(outcome.flags) {
                    let mut buffers = shared.buffers.borrow_mut();
                    let data = buffers.data(id, length);
                    if let Some(client) = shared.clients.borrow_mut().get_mut(&index) {
                        client.push_bytes(data);
                    }
                    buffers.recycle(id);
                }

                // SOCK_NONEMPTY clear = the socket drained = frame complete.
                if !ring::sock_nonempty(outcome.flags) {
                    let request = shared
                        .clients
                        .borrow_mut()
                        .get_mut(&index)
                        .map(|client| client.take_request());
                    if let Some(request) = request {
                        let response = shared.handler.query(&request);
                        shared.stats.request_processed();
                        shared.submit(send_reply(Rc::clone(&shared), index, response));
                    }
                }
            } else {
                let reason = if outcome.result == 0 {
                    "connection closed".to_string()
                } else {
                    outcome_error_text(outcome)
                };
                shared.warn(reason);
                if shared.has_client(index) {
                    shared.submit(close_owner(Rc::clone(&shared), Owner::Client(index)));
                }
                break;
            }
        }
        shared.erase_current_task();
    })
}

/// Writes one reply to a client. The task owns the reply bytes until the
/// kernel is done with them.
fn send_reply(shared: Rc<Shared>, index: u32, response: Vec<u8>) -> TaskFuture {
    Box::pin(async move {
        let region = libc::iovec {
            iov_base: response.as_ptr() as *mut libc::c_void,
            iov_len: response.len(),
        };
        let entry = opcode::Writev::new(types::Fixed(index), &region, 1).build();
        let outcome = shared.op(entry).await;

        if outcome.result <= 0 {
            let reason = if outcome.result == 0 {
                "connection closed".to_string()
            } else {
                outcome_error_text(outcome)
            };
            shared.warn(reason);
            if shared.has_client(index) {
                shared.submit(close_owner(Rc::clone(&shared), Owner::Client(index)));
            }
        } else {
            shared.stats.bytes_written(outcome.result as usize);
        }

        drop(response);
        shared.erase_current_task();
    })
}

/// One tick of the 1-second timer. Each tick resubmits a fresh task; a read
/// of the wrong size means the timer stream is gone, which is fatal.
fn timing(shared: Rc<Shared>) -> TaskFuture {
    Box::pin(async move {
        let mut ticks = [0u8; 8];
        let entry =
            opcode::Read::new(types::Fixed(TIMER_SLOT), ticks.as_mut_ptr(), ticks.len() as u32)
                .build();
        let outcome = shared.op(entry).await;

        if outcome.result == ticks.len() as i32 {
            shared.submit(timing(Rc::clone(&shared)));
        } else {
            shared.logger.borrow_mut().push(Log::new(
                Level::Fatal,
                format!("timer stream ended: {}", outcome_error_text(outcome)),
            ));
            shared.halted.set(true);
        }
        shared.erase_current_task();
    })
}

/// Flushes the logger's pending bytes through the ring.
fn flush_logs(shared: Rc<Shared>) -> TaskFuture {
    Box::pin(async move {
        let (data, length) = shared.logger.borrow_mut().begin_write();
        let entry = opcode::Write::new(types::Fixed(LOGGER_SLOT), data, length as u32).build();
        let outcome = shared.op(entry).await;

        match outcome.error() {
            Some(err) => {
                shared.logger.borrow_mut().write_failed();
                error!(error = %err, "log flush failed");
            }
            None => shared.logger.borrow_mut().wrote(outcome.result as usize),
        }
        shared.erase_current_task();
    })
}

/// Closes one fixed descriptor: a client slot, or the timer/server/logger
/// during shutdown. Closed clients leave the map whatever the result.
fn close_owner(shared: Rc<Shared>, owner: Owner) -> TaskFuture {
    Box::pin(async move {
        let entry = opcode::Close::new(types::Fixed(owner.slot())).build();
        let outcome = shared.op(entry).await;

        if let Owner::Client(index) = owner {
            if shared.clients.borrow_mut().remove(&index).is_some() {
                shared.stats.connection_closed();
            }
        }
        if let Some(err) = outcome.error() {
            shared.warn(err.to_string());
        }
        shared.erase_current_task();
    })
}
