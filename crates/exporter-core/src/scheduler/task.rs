//! Task record types for the scheduler queues.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

/// Output of a single task execution.
///
/// Created fresh for every execution and discarded afterwards. The action sets
/// `requeue` (optionally with a delay) to ask for another execution;
/// `was_requeued` tells it whether this execution is such a repeat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOutcome {
    requeue: bool,
    requeue_delay: Duration,
    was_requeued: bool,
}

impl TaskOutcome {
    pub(crate) fn new(was_requeued: bool) -> Self {
        Self {
            requeue: false,
            requeue_delay: Duration::ZERO,
            was_requeued,
        }
    }

    /// Run this task again as soon as the tasks ahead of it are done.
    pub fn requeue(&mut self) {
        self.requeue_after(Duration::ZERO);
    }

    /// Run this task again once `delay` has elapsed.
    /// A zero delay behaves like [`TaskOutcome::requeue`].
    pub fn requeue_after(&mut self, delay: Duration) {
        self.requeue = true;
        self.requeue_delay = delay;
    }

    /// True when this execution happens because the task asked to be requeued.
    pub fn was_requeued(&self) -> bool {
        self.was_requeued
    }

    pub fn requeue_requested(&self) -> bool {
        self.requeue
    }

    pub fn requeue_delay(&self) -> Duration {
        self.requeue_delay
    }
}

pub(crate) type Action = Box<dyn FnMut(&mut TaskOutcome) + Send + 'static>;

/// A unit of work owned by the scheduler once submitted.
pub(crate) struct Task {
    pub(crate) identity: String,
    pub(crate) priority: i32,
    pub(crate) requeued: bool,
    pub(crate) action: Action,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("identity", &self.identity)
            .field("priority", &self.priority)
            .field("requeued", &self.requeued)
            .finish_non_exhaustive()
    }
}

/// Entry of the ready queue.
///
/// `BinaryHeap` is a max-heap, so the ordering is reversed: the lowest priority
/// value wins, then the lowest arrival sequence (FIFO).
#[derive(Debug)]
pub(crate) struct ReadyTask {
    pub(crate) seq: u64,
    pub(crate) task: Task,
}

impl PartialEq for ReadyTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ReadyTask {}

impl PartialOrd for ReadyTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .task
            .priority
            .cmp(&self.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Entry of the delayed set: not eligible before `due_at`.
///
/// Same trick as the ready queue: reversed ordering turns the heap into a
/// min-heap on `due_at` (ties by sequence).
#[derive(Debug)]
pub(crate) struct PendingTask {
    pub(crate) due_at: Instant,
    pub(crate) seq: u64,
    pub(crate) task: Task,
}

impl PartialEq for PendingTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PendingTask {}

impl PartialOrd for PendingTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due_at
            .cmp(&self.due_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
