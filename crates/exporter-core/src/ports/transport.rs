//! Transport port - メッセージングクライアントの抽象化
//!
//! ブローカーのワイヤプロトコルはここでは実装しない。セッションが必要とする
//! 操作（connect / disconnect / subscribe / close）とコールバックだけを定義し、
//! 実装は `impls::mqtt`（本番）やテスト用の fake が提供する。
//!
//! # スレッドモデル
//! - `Transport` / `TransportHandle` のメソッドはスケジューラスレッドから呼ばれる
//! - `TransportCallbacks` はトランスポート自身のネットワークスレッドから呼ばれる

use std::sync::Arc;

use crate::session::SessionConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The driver rejected the call because of its connection state
    /// (e.g. disconnecting a client that is already disconnected).
    #[error("transport is in an invalid state: {0}")]
    InvalidState(String),

    #[error("failed to initialize transport: {0}")]
    Init(String),

    #[error("transport request failed: {0}")]
    Request(String),
}

/// An inbound publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

/// Creates native client handles.
pub trait Transport: Send + Sync {
    /// Create a handle and register `callbacks` on it. Nothing is sent yet.
    fn open(
        &self,
        config: &SessionConfig,
        callbacks: TransportCallbacks,
    ) -> Result<Box<dyn TransportHandle>, TransportError>;
}

/// One native client, owned by the session while it is not `Disconnected`.
pub trait TransportHandle: Send {
    /// Start the network loop and issue an asynchronous connect.
    /// The result arrives later through `on_connect_result`.
    fn connect(&mut self) -> Result<(), TransportError>;

    /// Issue an asynchronous disconnect; completion arrives via `on_disconnect`.
    fn disconnect(&mut self) -> Result<(), TransportError>;

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    /// Stop the network loop and destroy the handle. Callbacks raised by the
    /// old network thread after this point must be suppressed.
    fn close(self: Box<Self>);
}

type ConnectResultFn = dyn Fn(bool) + Send + Sync;
type DisconnectFn = dyn Fn(Option<String>) + Send + Sync;
type MessageFn = dyn Fn(Message) + Send + Sync;

/// Callbacks a transport raises from its own thread.
///
/// Implementations behind these only enqueue work; they never touch session
/// state directly.
#[derive(Clone)]
pub struct TransportCallbacks {
    on_connect_result: Arc<ConnectResultFn>,
    on_disconnect: Arc<DisconnectFn>,
    on_message: Arc<MessageFn>,
}

impl TransportCallbacks {
    pub fn new(
        on_connect_result: impl Fn(bool) + Send + Sync + 'static,
        on_disconnect: impl Fn(Option<String>) + Send + Sync + 'static,
        on_message: impl Fn(Message) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_connect_result: Arc::new(on_connect_result),
            on_disconnect: Arc::new(on_disconnect),
            on_message: Arc::new(on_message),
        }
    }

    pub fn on_connect_result(&self, success: bool) {
        (self.on_connect_result)(success);
    }

    pub fn on_disconnect(&self, reason: Option<String>) {
        (self.on_disconnect)(reason);
    }

    pub fn on_message(&self, message: Message) {
        (self.on_message)(message);
    }
}

impl std::fmt::Debug for TransportCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportCallbacks").finish_non_exhaustive()
    }
}

/// In-memory transport for tests: records every call and lets the test raise
/// callbacks from its own thread, the way a network thread would.
#[cfg(test)]
pub(crate) mod fake {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Call {
        Open,
        Connect,
        Subscribe(String),
        Disconnect,
        Close,
    }

    #[derive(Default)]
    struct State {
        calls: Vec<Call>,
        callbacks: Option<TransportCallbacks>,
        open_failures: VecDeque<TransportError>,
        disconnect_failures: VecDeque<TransportError>,
    }

    #[derive(Clone, Default)]
    pub(crate) struct FakeTransport {
        state: Arc<Mutex<State>>,
    }

    impl FakeTransport {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn count(&self, call: &Call) -> usize {
            self.state.lock().calls.iter().filter(|c| *c == call).count()
        }

        pub(crate) fn subscriptions(&self) -> Vec<String> {
            self.state
                .lock()
                .calls
                .iter()
                .filter_map(|call| match call {
                    Call::Subscribe(topic) => Some(topic.clone()),
                    _ => None,
                })
                .collect()
        }

        pub(crate) fn fail_next_open(&self, error: TransportError) {
            self.state.lock().open_failures.push_back(error);
        }

        pub(crate) fn fail_next_disconnect(&self, error: TransportError) {
            self.state.lock().disconnect_failures.push_back(error);
        }

        fn callbacks(&self) -> TransportCallbacks {
            self.state
                .lock()
                .callbacks
                .clone()
                .expect("no handle has been opened")
        }

        pub(crate) fn raise_connect_result(&self, success: bool) {
            self.callbacks().on_connect_result(success);
        }

        pub(crate) fn raise_disconnect(&self, reason: &str) {
            self.callbacks().on_disconnect(Some(reason.to_string()));
        }

        pub(crate) fn raise_message(&self, topic: &str, payload: &[u8]) {
            self.callbacks().on_message(Message {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                qos: 0,
                retain: false,
            });
        }
    }

    impl Transport for FakeTransport {
        fn open(
            &self,
            _config: &SessionConfig,
            callbacks: TransportCallbacks,
        ) -> Result<Box<dyn TransportHandle>, TransportError> {
            let mut state = self.state.lock();
            state.calls.push(Call::Open);
            if let Some(error) = state.open_failures.pop_front() {
                return Err(error);
            }
            state.callbacks = Some(callbacks);
            Ok(Box::new(FakeHandle {
                state: Arc::clone(&self.state),
            }))
        }
    }

    struct FakeHandle {
        state: Arc<Mutex<State>>,
    }

    impl TransportHandle for FakeHandle {
        fn connect(&mut self) -> Result<(), TransportError> {
            self.state.lock().calls.push(Call::Connect);
            Ok(())
        }

        fn disconnect(&mut self) -> Result<(), TransportError> {
            let mut state = self.state.lock();
            state.calls.push(Call::Disconnect);
            match state.disconnect_failures.pop_front() {
                Some(error) => Err(error),
                None => Ok(()),
            }
        }

        fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
            self.state.lock().calls.push(Call::Subscribe(topic.to_string()));
            Ok(())
        }

        fn close(self: Box<Self>) {
            self.state.lock().calls.push(Call::Close);
        }
    }
}
