//! TaskScheduler - 単一コンシューマの協調型タスク実行器
//!
//! どのスレッドからでも `submit` できるが、タスクの実行は `run()` を呼んだ
//! スレッド 1 本だけで行う。セッションの状態遷移やリクエスト処理はすべて
//! ここに載せることで、ビジネスロジック側はロックを意識しなくてよくなる。
//!
//! # 順序
//! - priority の値が小さいものから実行
//! - 同じ priority なら投入順（FIFO）
//! - requeue されたタスクは新規投入と同じ扱い（列の先頭には戻らない）
//! - 遅延 requeue は due 時刻を過ぎるまで ready に戻らない
//!
//! # シャットダウン
//! `request_shutdown()` はフラグを立てるだけ。`run()` は ready と遅延セットの
//! 両方が空になるまで処理を続けてから戻る。

mod task;

use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

pub use self::task::TaskOutcome;
use self::task::{PendingTask, ReadyTask, Task};

pub const DEFAULT_POLL_QUANTUM: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound of the consumer's idle wait between two queue passes.
    pub poll_quantum: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_quantum: DEFAULT_POLL_QUANTUM,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler is already running on another thread")]
    AlreadyRunning,
}

/// Number of tasks waiting in each queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub ready: usize,
    pub delayed: usize,
}

/// Ready queue + delayed set, guarded together by one mutex.
/// A task lives in at most one of them at any instant.
#[derive(Default)]
struct Queues {
    ready: BinaryHeap<ReadyTask>,
    delayed: BinaryHeap<PendingTask>,
    next_seq: u64,
}

impl Queues {
    fn allocate_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn push_ready(&mut self, task: Task) {
        let seq = self.allocate_seq();
        self.ready.push(ReadyTask { seq, task });
    }

    fn push_delayed(&mut self, task: Task, due_at: Instant) {
        let seq = self.allocate_seq();
        self.delayed.push(PendingTask { due_at, seq, task });
    }

    /// Move delayed tasks whose due time has passed into the ready queue.
    fn promote_due(&mut self, now: Instant) {
        while let Some(entry) = self.delayed.peek() {
            if entry.due_at > now {
                break; // heap is sorted by due time
            }
            if let Some(entry) = self.delayed.pop() {
                debug!(
                    id = %entry.task.identity,
                    remaining = self.delayed.len(),
                    "re-queuing delayed task"
                );
                self.push_ready(entry.task);
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.peek().map(|entry| entry.due_at)
    }
}

struct Shared {
    queues: Mutex<Queues>,
    wakeup: Condvar,
    shutting_down: AtomicBool,
    running: AtomicBool,
    stopped: AtomicBool,
    config: SchedulerConfig,
}

/// Cheap to clone handle; every clone feeds the same queues.
#[derive(Clone)]
pub struct TaskScheduler {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("pending", &self.pending())
            .field("shutting_down", &self.is_shutting_down())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        info!(poll_quantum_ms = config.poll_quantum.as_millis() as u64, "TaskScheduler created");
        Self {
            shared: Arc::new(Shared {
                queues: Mutex::new(Queues::default()),
                wakeup: Condvar::new(),
                shutting_down: AtomicBool::new(false),
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                config,
            }),
        }
    }

    /// Enqueue an action at priority 0.
    pub fn submit<F>(&self, identity: impl Into<String>, action: F)
    where
        F: FnMut(&mut TaskOutcome) + Send + 'static,
    {
        self.submit_with_priority(identity, 0, action);
    }

    /// Enqueue an action. Lower `priority` values run first.
    ///
    /// Never blocks beyond the queue mutex and may be called from any thread,
    /// including from inside a running task.
    pub fn submit_with_priority<F>(&self, identity: impl Into<String>, priority: i32, action: F)
    where
        F: FnMut(&mut TaskOutcome) + Send + 'static,
    {
        let task = Task {
            identity: identity.into(),
            priority,
            requeued: false,
            action: Box::new(action),
        };
        debug!(id = %task.identity, priority, "submit");

        self.shared.queues.lock().push_ready(task);
        self.shared.wakeup.notify_one();
    }

    /// Raise the one-way shutdown flag. Idempotent.
    ///
    /// Already queued and delayed work still runs; `run()` returns once both
    /// queues are empty.
    pub fn request_shutdown(&self) {
        if !self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            info!("Shutting down");
        }
        // take the lock so the notification cannot slip between the consumer's
        // emptiness check and its wait
        let _queues = self.shared.queues.lock();
        self.shared.wakeup.notify_all();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::Acquire)
    }

    /// True once `run()` has drained everything after a shutdown request.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> PendingCounts {
        let queues = self.shared.queues.lock();
        PendingCounts {
            ready: queues.ready.len(),
            delayed: queues.delayed.len(),
        }
    }

    /// Consumer loop. Blocks the calling thread until shutdown was requested
    /// and both the ready queue and the delayed set are empty.
    pub fn run(&self) -> Result<(), SchedulerError> {
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SchedulerError::AlreadyRunning);
        }
        debug!("run started");

        let quantum = self.shared.config.poll_quantum;
        loop {
            while let Some(task) = self.pop_ready() {
                self.execute(task);
            }

            let mut queues = self.shared.queues.lock();
            let now = Instant::now();
            queues.promote_due(now);
            if !queues.ready.is_empty() {
                continue;
            }
            if self.is_shutting_down() && queues.delayed.is_empty() {
                break;
            }

            let wait = queues
                .next_due()
                .map(|due| due.saturating_duration_since(now).min(quantum))
                .unwrap_or(quantum);
            self.shared.wakeup.wait_for(&mut queues, wait);
        }

        self.shared.stopped.store(true, Ordering::Release);
        self.shared.running.store(false, Ordering::Release);
        debug!("run finished");
        Ok(())
    }

    fn pop_ready(&self) -> Option<Task> {
        let mut queues = self.shared.queues.lock();
        let ready = queues.ready.pop()?;
        debug!(
            id = %ready.task.identity,
            priority = ready.task.priority,
            remaining = queues.ready.len(),
            "executing"
        );
        Some(ready.task)
    }

    fn execute(&self, mut task: Task) {
        let mut outcome = TaskOutcome::new(task.requeued);
        let action = &mut task.action;
        if panic::catch_unwind(AssertUnwindSafe(|| action(&mut outcome))).is_err() {
            error!(id = %task.identity, "task panicked; dropping it");
            return;
        }

        if !outcome.requeue_requested() {
            return;
        }

        task.requeued = true;
        let delay = outcome.requeue_delay();
        let mut queues = self.shared.queues.lock();
        if delay.is_zero() {
            debug!(id = %task.identity, "re-queuing");
            queues.push_ready(task);
        } else {
            debug!(
                id = %task.identity,
                after_ms = delay.as_millis() as u64,
                "moving task to delayed set"
            );
            queues.push_delayed(task, Instant::now() + delay);
        }
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}
