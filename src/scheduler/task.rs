//! Tasks and Awaitable Ring Operations
//!
//! A task is one suspended computation waiting on one ring completion. The
//! pairing is strict: when a task is submitted, its first poll runs the body
//! up to the first awaited operation, which stages a submission entry; the
//! scheduler stamps that entry with a fresh userData, pushes it to the ring,
//! and files the task under the same userData. The completion (or, for
//! multishot operations, each completion) carries the userData back and the
//! reactor resumes exactly that task with the delivered outcome.
//!
//! Awaiting again inside a task body does not create a new submission — a
//! staged entry outside the initial submit is discarded. Loops like the
//! accept and receive tasks ride one multishot stream: every iteration's
//! await is woken by the next completion of the original submission. A task
//! that needs a genuinely new operation submits a fresh task (the timing
//! task does exactly this every tick).
//!
//! Tasks run on the reactor thread only; there are no wakers to fire, so
//! polling uses the no-op waker and resumption is always explicit.

use crate::ring::Outcome;
use io_uring::squeue;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// The boxed body of a task.
pub type TaskFuture = Pin<Box<dyn Future<Output = ()>>>;

/// The rendezvous between the reactor and the operation a task is awaiting:
/// outcomes travel in, staged submissions travel out.
#[derive(Default)]
pub struct OpChannel {
    delivered: Cell<Option<Outcome>>,
    staged: RefCell<Option<squeue::Entry>>,
}

impl OpChannel {
    pub fn new() -> Rc<OpChannel> {
        Rc::new(OpChannel::default())
    }

    /// Hands the next poll of the resumed task its completion outcome.
    pub fn deliver(&self, outcome: Outcome) {
        self.delivered.set(Some(outcome));
    }

    /// Takes the submission staged by a freshly primed task.
    pub fn take_staged(&self) -> Option<squeue::Entry> {
        self.staged.borrow_mut().take()
    }

    /// Drops any leftover outcome or staged entry after a resume; re-awaits
    /// on a multishot stream stage entries that must not be resubmitted.
    pub fn clear(&self) {
        self.delivered.take();
        self.staged.borrow_mut().take();
    }
}

/// One awaited ring operation.
///
/// The first poll stages the submission and suspends; the poll after
/// [`OpChannel::deliver`] yields the outcome.
pub struct Op {
    channel: Rc<OpChannel>,
    entry: Option<squeue::Entry>,
}

impl Op {
    pub fn new(channel: Rc<OpChannel>, entry: squeue::Entry) -> Op {
        Op {
            channel,
            entry: Some(entry),
        }
    }
}

impl Future for Op {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Outcome> {
        let op = self.get_mut();
        if let Some(outcome) = op.channel.delivered.take() {
            return Poll::Ready(outcome);
        }
        if let Some(entry) = op.entry.take() {
            *op.channel.staged.borrow_mut() = Some(entry);
        }
        Poll::Pending
    }
}

/// A suspended computation keyed by its submission's userData.
pub struct Task {
    future: RefCell<TaskFuture>,
}

impl Task {
    pub fn new(future: TaskFuture) -> Rc<Task> {
        Rc::new(Task {
            future: RefCell::new(future),
        })
    }

    /// Advances the task to its next suspension point or completion.
    pub fn poll(&self) -> Poll<()> {
        let mut context = Context::from_waker(Waker::noop());
        self.future.borrow_mut().as_mut().poll(&mut context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use io_uring::opcode;

    fn nop_entry() -> squeue::Entry {
        opcode::Nop::new().build()
    }

    #[test]
    fn test_op_stages_then_yields_outcome() {
        let channel = OpChannel::new();
        let captured = Rc::new(Cell::new(None));

        let task = Task::new(Box::pin({
            let channel = Rc::clone(&channel);
            let captured = Rc::clone(&captured);
            async move {
                let outcome = Op::new(channel, nop_entry()).await;
                captured.set(Some(outcome));
            }
        }));

        // Priming runs to the await and stages the submission.
        assert!(task.poll().is_pending());
        assert!(channel.take_staged().is_some());
        assert!(channel.take_staged().is_none());

        // Resuming with an outcome completes the body.
        let outcome = Outcome { result: 7, flags: 2 };
        channel.deliver(outcome);
        assert!(task.poll().is_ready());
        assert_eq!(captured.get(), Some(outcome));
    }

    #[test]
    fn test_reawait_stages_without_resubmission() {
        let channel = OpChannel::new();
        let rounds = Rc::new(Cell::new(0u32));

        let task = Task::new(Box::pin({
            let channel = Rc::clone(&channel);
            let rounds = Rc::clone(&rounds);
            async move {
                loop {
                    let outcome = Op::new(Rc::clone(&channel), nop_entry()).await;
                    rounds.set(rounds.get() + 1);
                    if outcome.result == 0 {
                        break;
                    }
                }
            }
        }));

        assert!(task.poll().is_pending());
        assert!(channel.take_staged().is_some());

        // A multishot-style second completion: the re-await staged an entry,
        // but clear() throws it away the way the reactor does.
        channel.deliver(Outcome { result: 1, flags: 0 });
        assert!(task.poll().is_pending());
        channel.clear();
        assert!(channel.take_staged().is_none());

        channel.deliver(Outcome { result: 0, flags: 0 });
        assert!(task.poll().is_ready());
        assert_eq!(rounds.get(), 2);
    }
}
