//! RumqttTransport - rumqttc の同期クライアントによる Transport 実装
//!
//! # 設計
//! - `open` は `Client` / `Connection` を作るだけ（ネットワークには触れない）
//! - `connect` で名前付きネットワークスレッドを起動し、`Connection` を回す
//! - rumqttc 自身の再接続は使わない。エラーや切断を通知したらスレッドは終了し、
//!   再接続はセッションのポリシーに任せる
//! - `close` 後に古いスレッドから届くコールバックは `closed` フラグで捨てる
//!
//! 呼び出し側（スケジューラスレッド）をブロックしないよう、リクエストは
//! すべて `try_*` 系で投げる。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use rumqttc::{
    Client, ConnectReturnCode, Connection, ConnectionError, Event, MqttOptions, Outgoing, Packet,
    QoS,
};
use tracing::{debug, info, warn};

use crate::ports::{Message, Transport, TransportCallbacks, TransportError, TransportHandle};
use crate::session::SessionConfig;

/// Bound of the client -> event loop request channel.
const REQUEST_CAPACITY: usize = 64;

const NETWORK_THREAD: &str = "mqtt-network";

#[derive(Debug, Clone, Default)]
pub struct RumqttTransport;

impl RumqttTransport {
    pub fn new() -> Self {
        Self
    }
}

/// Clean session, optional credentials (only when a username is set).
pub(crate) fn mqtt_options(config: &SessionConfig) -> MqttOptions {
    let mut options = MqttOptions::new(
        config.client_id.clone(),
        config.broker_address.clone(),
        config.broker_port,
    );

    // rumqttc は 0 (無効) か 1 秒以上しか受け付けない
    let keepalive = if config.keepalive.is_zero() {
        Duration::ZERO
    } else {
        config.keepalive.max(Duration::from_secs(1))
    };
    options.set_keep_alive(keepalive);
    options.set_clean_session(true);

    if let Some(username) = &config.username {
        options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
    }
    options
}

impl Transport for RumqttTransport {
    fn open(
        &self,
        config: &SessionConfig,
        callbacks: TransportCallbacks,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        if config.broker_address.is_empty() {
            return Err(TransportError::Init("broker address is empty".to_string()));
        }

        let (client, connection) = Client::new(mqtt_options(config), REQUEST_CAPACITY);
        debug!(
            broker = %config.broker_address,
            port = config.broker_port,
            client_id = %config.client_id,
            "mqtt client created"
        );

        Ok(Box::new(RumqttHandle {
            client,
            connection: Some(connection),
            callbacks,
            closed: Arc::new(AtomicBool::new(false)),
            finished: Arc::new(AtomicBool::new(false)),
        }))
    }
}

pub struct RumqttHandle {
    client: Client,
    /// Moved onto the network thread by `connect`.
    connection: Option<Connection>,
    callbacks: TransportCallbacks,
    /// Set by `close`; the network thread stops reporting once it sees it.
    closed: Arc<AtomicBool>,
    /// Set by the network thread when it exits.
    finished: Arc<AtomicBool>,
}

impl RumqttHandle {
    fn is_live(&self) -> bool {
        self.connection.is_none() && !self.finished.load(Ordering::Acquire)
    }
}

impl TransportHandle for RumqttHandle {
    fn connect(&mut self) -> Result<(), TransportError> {
        let Some(connection) = self.connection.take() else {
            return Err(TransportError::InvalidState("already connecting".to_string()));
        };

        let callbacks = self.callbacks.clone();
        let closed = Arc::clone(&self.closed);
        let finished = Arc::clone(&self.finished);
        thread::Builder::new()
            .name(NETWORK_THREAD.to_string())
            .spawn(move || {
                network_loop(connection, &callbacks, &closed);
                finished.store(true, Ordering::Release);
            })
            .map_err(|e| TransportError::Request(format!("can't start network thread: {e}")))?;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        if !self.is_live() {
            return Err(TransportError::InvalidState("not connected".to_string()));
        }
        self.client
            .try_disconnect()
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    fn close(self: Box<Self>) {
        self.closed.store(true, Ordering::Release);
        if self.is_live()
            && let Err(e) = self.client.try_disconnect()
        {
            debug!(error = %e, "disconnect on close failed");
        }
        // Client と一緒にリクエストチャネルが閉じ、イベントループが終わる
        debug!("mqtt handle closed");
    }
}

/// Drive the connection until the first terminal event, reporting it once.
fn network_loop(mut connection: Connection, callbacks: &TransportCallbacks, closed: &AtomicBool) {
    let report = |f: &dyn Fn()| {
        if !closed.load(Ordering::Acquire) {
            f();
        }
    };
    let mut acknowledged = false;

    for notification in connection.iter() {
        match notification {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    info!("broker accepted connection");
                    acknowledged = true;
                    report(&|| callbacks.on_connect_result(true));
                } else {
                    warn!(code = ?ack.code, "broker refused connection");
                    report(&|| callbacks.on_connect_result(false));
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = Message {
                    topic: String::from_utf8_lossy(publish.topic.as_ref()).into_owned(),
                    payload: publish.payload.to_vec(),
                    qos: publish.qos as u8,
                    retain: publish.retain,
                };
                report(&|| callbacks.on_message(message.clone()));
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                report(&|| callbacks.on_disconnect(Some("broker closed the session".to_string())));
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                report(&|| callbacks.on_disconnect(None));
                break;
            }
            Ok(_) => {}
            Err(ConnectionError::RequestsDone) => {
                debug!("mqtt client dropped; network loop exiting");
                break;
            }
            Err(e) => {
                if acknowledged {
                    warn!(error = %e, "connection lost");
                    report(&|| callbacks.on_disconnect(Some(e.to_string())));
                } else {
                    warn!(error = %e, "connect failed");
                    report(&|| callbacks.on_connect_result(false));
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn config() -> SessionConfig {
        SessionConfig {
            client_id: "exporter-test".to_string(),
            broker_address: "broker.test".to_string(),
            broker_port: 1884,
            keepalive: Duration::from_secs(30),
            ..SessionConfig::default()
        }
    }

    fn counting_callbacks() -> (TransportCallbacks, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let (a, b, c) = (Arc::clone(&calls), Arc::clone(&calls), Arc::clone(&calls));
        let callbacks = TransportCallbacks::new(
            move |_| {
                a.fetch_add(1, Ordering::SeqCst);
            },
            move |_| {
                b.fetch_add(1, Ordering::SeqCst);
            },
            move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );
        (callbacks, calls)
    }

    #[test]
    fn options_follow_the_session_config() {
        let options = mqtt_options(&config());

        assert_eq!(options.client_id(), "exporter-test");
        assert_eq!(options.broker_address(), ("broker.test".to_string(), 1884));
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert!(options.clean_session());
        assert_eq!(options.credentials(), None);
    }

    #[test]
    fn credentials_need_a_username() {
        let with_user = SessionConfig {
            username: Some("exporter".to_string()),
            ..config()
        };
        assert_eq!(
            mqtt_options(&with_user).credentials(),
            Some(("exporter".to_string(), String::new()))
        );

        let password_only = SessionConfig {
            password: Some("secret".to_string()),
            ..config()
        };
        assert_eq!(mqtt_options(&password_only).credentials(), None);
    }

    #[test]
    fn sub_second_keepalive_is_raised() {
        let short = SessionConfig {
            keepalive: Duration::from_millis(200),
            ..config()
        };
        assert_eq!(mqtt_options(&short).keep_alive(), Duration::from_secs(1));
    }

    #[test]
    fn empty_broker_address_fails_to_open() {
        let (callbacks, _) = counting_callbacks();
        let config = SessionConfig {
            broker_address: String::new(),
            ..config()
        };
        let result = RumqttTransport::new().open(&config, callbacks);
        assert!(matches!(result, Err(TransportError::Init(_))));
    }

    #[test]
    fn disconnect_before_connect_is_an_invalid_state() {
        let (callbacks, calls) = counting_callbacks();
        let mut handle = RumqttTransport::new().open(&config(), callbacks).unwrap();

        assert!(matches!(handle.disconnect(), Err(TransportError::InvalidState(_))));
        handle.close();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
