//! ConnectionSession - メッセージングクライアントのライフサイクル管理
//!
//! connect / reconnect（固定バックオフ）/ resubscribe / メッセージ配送を
//! [`StateMachine`] の上に実装する。ネイティブのコールバックスレッドは
//! イベントを dispatch するかタスクを submit するだけで、状態には触れない。
//!
//! # 再接続ポリシー
//! - `start()` で有効化、`stop()` で無効化
//! - 接続失敗・切断時、有効ならバックオフ後に `Connect` を dispatch
//! - バックオフ中に `stop()` されたら何もしない

mod state;
mod transitions;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

pub use self::state::{SessionEvent, SessionState};
pub use self::transitions::SessionTransitions;
use crate::ports::{Message, Transport, TransportCallbacks};
use crate::scheduler::TaskScheduler;
use crate::state_machine::StateMachine;

pub const SUBSCRIBE_TASK: &str = "MqttSubscribe";
pub const MESSAGE_TASK: &str = "MqttMessage";

pub type SessionMachine = StateMachine<SessionState, SessionEvent, SessionTransitions>;

/// Called on the scheduler thread with `(topic, payload)`.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub client_id: String,
    pub broker_address: String,
    pub broker_port: u16,
    pub keepalive: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Fixed delay before a reconnect attempt.
    pub reconnect_backoff: Duration,
    /// Poll interval while waiting for a requested disconnect to complete.
    pub disconnect_recheck: Duration,
    /// Give up waiting for the disconnect callback after this long.
    pub disconnect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_id: "PrometheusMqttExporter".to_string(),
            broker_address: "localhost".to_string(),
            broker_port: 1883,
            keepalive: Duration::from_secs(60),
            username: None,
            password: None,
            reconnect_backoff: Duration::from_secs(5),
            disconnect_recheck: Duration::from_millis(100),
            disconnect_timeout: Duration::from_secs(5),
        }
    }
}

/// State shared between the session handle, its transitions and the tasks
/// they schedule.
pub(crate) struct SessionShared {
    scheduler: TaskScheduler,
    should_reconnect: AtomicBool,
    recheck_active: AtomicBool,
    /// Bumped every time the session reaches `Disconnected`. A recheck loop
    /// only acts while the epoch it was started in is still current.
    disconnect_epoch: AtomicU64,
    message_handler: Mutex<Option<MessageHandler>>,
}

impl SessionShared {
    fn should_reconnect(&self) -> bool {
        self.should_reconnect.load(Ordering::Acquire)
    }

    /// Hand an inbound message to the scheduler thread.
    fn deliver(self: &Arc<Self>, message: Message) {
        debug!(
            topic = %message.topic,
            bytes = message.payload.len(),
            qos = message.qos,
            retain = message.retain,
            "message received"
        );
        let shared = Arc::clone(self);
        let mut message = Some(message);
        self.scheduler.submit(MESSAGE_TASK, move |_| {
            let Some(message) = message.take() else {
                return;
            };
            let handler = shared.message_handler.lock().clone();
            match handler {
                Some(handler) => handler(&message.topic, &message.payload),
                None => debug!(topic = %message.topic, "no message handler; dropping message"),
            }
        });
    }
}

/// Callbacks for a freshly opened handle. They only enqueue work.
pub(crate) fn callbacks_for(machine: &SessionMachine, shared: &Arc<SessionShared>) -> TransportCallbacks {
    let on_connect = machine.clone();
    let on_disconnect = machine.clone();
    let shared = Arc::clone(shared);

    TransportCallbacks::new(
        move |success| {
            if success {
                on_connect.dispatch(SessionEvent::Connected);
            } else {
                on_connect.dispatch(SessionEvent::Disconnected {
                    reason: Some("connect failed".to_string()),
                });
            }
        },
        move |reason| on_disconnect.dispatch(SessionEvent::Disconnected { reason }),
        move |message| shared.deliver(message),
    )
}

/// Owner-facing handle of one logical broker connection.
#[derive(Clone)]
pub struct ConnectionSession {
    machine: SessionMachine,
    shared: Arc<SessionShared>,
}

impl ConnectionSession {
    pub fn new(config: SessionConfig, transport: Arc<dyn Transport>, scheduler: TaskScheduler) -> Self {
        info!(
            broker = %config.broker_address,
            port = config.broker_port,
            "ConnectionSession created"
        );
        let shared = Arc::new(SessionShared {
            scheduler: scheduler.clone(),
            should_reconnect: AtomicBool::new(false),
            recheck_active: AtomicBool::new(false),
            disconnect_epoch: AtomicU64::new(0),
            message_handler: Mutex::new(None),
        });
        let transitions = SessionTransitions::new(config, transport, Arc::clone(&shared));
        let machine = StateMachine::new(SessionState::Disconnected, transitions, scheduler);
        Self { machine, shared }
    }

    /// Set the handler invoked for every inbound message. Replaces any previous one.
    pub fn set_message_handler(&self, handler: impl Fn(&str, &[u8]) + Send + Sync + 'static) {
        *self.shared.message_handler.lock() = Some(Arc::new(handler));
    }

    /// Track `topic` for the lifetime of the session.
    /// Subscribes immediately if the session is connected at execution time.
    pub fn subscribe(&self, topic: impl Into<String>) {
        let machine = self.machine.clone();
        let mut topic = Some(topic.into());
        self.shared.scheduler.submit(SUBSCRIBE_TASK, move |_| {
            if let Some(topic) = topic.take() {
                machine.with_transitions(|state, transitions| transitions.track(topic, *state));
            }
        });
    }

    /// Enable the reconnect policy and connect.
    pub fn start(&self) {
        info!("session start requested");
        self.shared.should_reconnect.store(true, Ordering::Release);
        self.machine.dispatch(SessionEvent::Connect);
    }

    /// Disable the reconnect policy and disconnect.
    pub fn stop(&self) {
        info!("session stop requested");
        self.shared.should_reconnect.store(false, Ordering::Release);
        self.machine.dispatch(SessionEvent::Disconnect);
    }

    /// Last committed state. Exact on the scheduler thread, eventually
    /// consistent elsewhere.
    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    /// Tracked topics in request order.
    pub fn topics(&self) -> Vec<String> {
        self.machine.with_transitions(|_, transitions| transitions.topics().to_vec())
    }

    pub fn is_reconnect_enabled(&self) -> bool {
        self.shared.should_reconnect()
    }

    #[cfg(test)]
    pub(crate) fn dispatch(&self, event: SessionEvent) {
        self.machine.dispatch(event);
    }
}
