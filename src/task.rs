//! Deferred task queue
//!
//! Tasks are ordered by target time and, for equal target times, by
//! submission order. Each live task has exactly one current heap entry.
//! Moving a task earlier replaces that entry; moving it later only records
//! the new target, and the entry is requeued when it reaches the top.
//! Superseded and cancelled entries are skipped when popped.

use log::error;
use std::cell::{Cell, RefCell};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

type Callback = Box<dyn FnOnce()>;

/// Stand-in for delays too large to represent as an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// `delay` from now, saturating at a far-future instant.
fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE)
}

struct TaskState {
    callback: RefCell<Option<Callback>>,
    // Target time and ordering key the task should run at
    deadline: Cell<Instant>,
    seq: Cell<u64>,
    // Key of the entry currently in the heap; its deadline is never later
    // than `deadline`
    queued_deadline: Cell<Instant>,
    queued_seq: Cell<u64>,
    queue: Weak<TaskQueue>,
}

struct Entry {
    deadline: Instant,
    seq: u64,
    task: Rc<TaskState>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

impl Entry {
    fn is_live(&self) -> bool {
        self.task.queued_seq.get() == self.seq && self.task.callback.borrow().is_some()
    }

    /// Whether the task was moved later since this entry was queued.
    fn is_moved(&self) -> bool {
        self.task.seq.get() != self.seq
    }
}

/// Handle to a task scheduled with `RawServer::add_task`.
#[derive(Clone)]
pub struct TaskHandle {
    state: Rc<TaskState>,
}

impl TaskHandle {
    /// Prevent the task from running. Has no effect once it has run.
    pub fn cancel(&self) {
        self.state.callback.borrow_mut().take();
    }

    /// Whether the task is still waiting to run.
    pub fn is_active(&self) -> bool {
        self.state.callback.borrow().is_some()
    }

    /// Move the task so it runs `delay` from now.
    pub fn reset(&self, delay: Duration) {
        if !self.is_active() {
            return;
        }
        if let Some(queue) = self.state.queue.upgrade() {
            queue.reschedule(&self.state, deadline_after(delay));
        }
    }

    pub fn deadline(&self) -> Instant {
        self.state.deadline.get()
    }
}

/// Handle to a task submitted with `external_add_task`. It may be sent to
/// and cancelled from any thread.
#[derive(Debug, Clone, Default)]
pub struct ExternalTaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl ExternalTaskHandle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Ask the scheduler not to run the task. Best effort: a task that is
    /// already running is not interrupted.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }
}

/// Timer heap drained by the scheduler thread.
pub(crate) struct TaskQueue {
    heap: RefCell<BinaryHeap<Reverse<Entry>>>,
    next_seq: Cell<u64>,
    changed: Notify,
    this: Weak<TaskQueue>,
}

impl TaskQueue {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            heap: RefCell::new(BinaryHeap::new()),
            next_seq: Cell::new(0),
            changed: Notify::new(),
            this: this.clone(),
        })
    }

    pub(crate) fn schedule<F>(&self, delay: Duration, callback: F) -> TaskHandle
    where
        F: FnOnce() + 'static,
    {
        let deadline = deadline_after(delay);
        let state = Rc::new(TaskState {
            callback: RefCell::new(Some(Box::new(callback))),
            deadline: Cell::new(deadline),
            seq: Cell::new(0),
            queued_deadline: Cell::new(deadline),
            queued_seq: Cell::new(0),
            queue: self.this.clone(),
        });
        self.push(&state, deadline);
        TaskHandle { state }
    }

    fn take_seq(&self) -> u64 {
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        seq
    }

    fn push(&self, state: &Rc<TaskState>, deadline: Instant) {
        let seq = self.take_seq();
        state.deadline.set(deadline);
        state.seq.set(seq);
        enqueue(&mut self.heap.borrow_mut(), state);
        self.changed.notify_one();
    }

    /// Move a task to `deadline`. Only an earlier deadline touches the heap.
    fn reschedule(&self, state: &Rc<TaskState>, deadline: Instant) {
        if deadline < state.queued_deadline.get() {
            self.push(state, deadline);
        } else {
            state.deadline.set(deadline);
            state.seq.set(self.take_seq());
        }
    }

    /// Earliest deadline of a live task, discarding dead entries on the way.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let mut heap = self.heap.borrow_mut();
        settle(&mut heap);
        heap.peek().map(|Reverse(entry)| entry.deadline)
    }

    /// Pop the next task due at `now`, ignoring tasks submitted at or after
    /// sequence number `limit` so a batch cannot grow while it runs.
    fn pop_due(&self, now: Instant, limit: u64) -> Option<Callback> {
        let mut heap = self.heap.borrow_mut();
        settle(&mut heap);
        let Reverse(entry) = heap.peek()?;
        if entry.deadline > now || entry.seq >= limit {
            return None;
        }
        let Reverse(entry) = heap.pop()?;
        entry.task.callback.take()
    }

    /// Run every task due at `now`. Returns how many ran.
    pub(crate) fn run_due(&self, now: Instant) -> usize {
        let limit = self.next_seq.get();
        let mut ran = 0;
        while let Some(callback) = self.pop_due(now, limit) {
            ran += 1;
            if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                error!("scheduled task panicked");
            }
        }
        ran
    }

    /// Heap entries, superseded ones included.
    #[cfg(test)]
    pub(crate) fn entry_count(&self) -> usize {
        self.heap.borrow().len()
    }

    /// Number of live tasks waiting to run.
    pub(crate) fn len(&self) -> usize {
        self.heap
            .borrow()
            .iter()
            .filter(|Reverse(entry)| entry.is_live())
            .count()
    }

    /// Drive the queue forever on the current `LocalSet`.
    pub(crate) async fn drive(self: Rc<Self>) {
        loop {
            if self.run_due(Instant::now()) > 0 {
                tokio::task::yield_now().await;
                continue;
            }
            match self.next_deadline() {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline.into()) => {}
                        _ = self.changed.notified() => {}
                    }
                }
                None => self.changed.notified().await,
            }
        }
    }
}

fn enqueue(heap: &mut BinaryHeap<Reverse<Entry>>, state: &Rc<TaskState>) {
    let (deadline, seq) = (state.deadline.get(), state.seq.get());
    state.queued_deadline.set(deadline);
    state.queued_seq.set(seq);
    heap.push(Reverse(Entry {
        deadline,
        seq,
        task: Rc::clone(state),
    }));
}

/// Bring the heap top to a live entry at its task's current target:
/// dead entries are dropped and entries of tasks moved later are requeued.
fn settle(heap: &mut BinaryHeap<Reverse<Entry>>) {
    while let Some(Reverse(entry)) = heap.peek() {
        if !entry.is_live() {
            heap.pop();
        } else if entry.is_moved() {
            if let Some(Reverse(entry)) = heap.pop() {
                enqueue(heap, &entry.task);
            }
        } else {
            return;
        }
    }
}
