//! StateMachine - スケジューラ経由で遷移を適用する汎用ステートマシン
//!
//! `dispatch` はその場では何もしない。遷移関数の評価はスケジューラの
//! タスクとして行うので、イベントがどのスレッドから来ても状態の読み書きは
//! 常に 1 スレッドに直列化される。
//!
//! # 学習ポイント
//! - 遷移は dispatch 時点ではなく「実行時点」の状態に対して評価される
//! - 一致しない (state, event) は明示的なデフォルト分岐で無視する（[`ignore_event`]）

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::scheduler::TaskScheduler;

/// Identity of the scheduler task that applies a dispatched event.
pub const DISPATCH_TASK: &str = "StateMachineDispatch";

/// Transition function of a [`StateMachine`].
///
/// Runs on the scheduler thread only. The machine is passed in so a
/// transition can dispatch follow-up events or hand a clone to scheduled
/// tasks. It must not call [`StateMachine::with_transitions`] on the same
/// machine (the transitions are already borrowed).
pub trait Transitions<S, E>: Send + Sized + 'static {
    /// Returns the next state, or `None` to stay in `state`.
    fn transition(&mut self, machine: &StateMachine<S, E, Self>, state: &S, event: E) -> Option<S>;
}

/// Default branch for `(state, event)` pairs without a rule.
///
/// Spurious events (e.g. a duplicate disconnect callback) are expected from
/// native libraries, so this only warns.
pub fn ignore_event<S: Debug, E: Debug>(state: &S, event: &E) -> Option<S> {
    warn!(?state, ?event, "no transition for event; ignoring");
    None
}

struct Inner<S, T> {
    state: Mutex<S>,
    transitions: Mutex<T>,
}

pub struct StateMachine<S, E, T> {
    inner: Arc<Inner<S, T>>,
    scheduler: TaskScheduler,
    _event: PhantomData<fn(E)>,
}

impl<S, E, T> Clone for StateMachine<S, E, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            scheduler: self.scheduler.clone(),
            _event: PhantomData,
        }
    }
}

impl<S, E, T> StateMachine<S, E, T>
where
    S: Clone + Debug + Send + 'static,
    E: Debug + Send + 'static,
    T: Transitions<S, E>,
{
    pub fn new(initial: S, transitions: T, scheduler: TaskScheduler) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(initial),
                transitions: Mutex::new(transitions),
            }),
            scheduler,
            _event: PhantomData,
        }
    }

    /// Queue `event`. Thread-safe; the transition runs later on the scheduler
    /// thread against whatever state is current by then.
    pub fn dispatch(&self, event: E) {
        let machine = self.clone();
        let mut event = Some(event);
        self.scheduler.submit(DISPATCH_TASK, move |_outcome| {
            if let Some(event) = event.take() {
                machine.apply(event);
            }
        });
    }

    /// Last committed state.
    pub fn state(&self) -> S {
        self.inner.state.lock().clone()
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Access the transition object together with the current state.
    /// Meant for scheduler tasks that need the same data the transitions own.
    /// The state seen here is always the one committed together with the
    /// transitions' current contents.
    pub fn with_transitions<R>(&self, f: impl FnOnce(&S, &mut T) -> R) -> R {
        let mut transitions = self.inner.transitions.lock();
        let state = self.state();
        f(&state, &mut transitions)
    }

    fn apply(&self, event: E) {
        // transitions -> state の順でロックする（with_transitions と同じ）
        let mut transitions = self.inner.transitions.lock();
        let current = self.state();
        if let Some(next) = transitions.transition(self, &current, event) {
            debug!(from = ?current, to = ?next, "state transition");
            *self.inner.state.lock() = next;
        }
    }
}
