//! Transition rules of the connection session.
//!
//! Everything in here runs on the scheduler thread, so the native handle and
//! the topic list need no further synchronization.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::state::{SessionEvent, SessionState};
use super::{SessionConfig, SessionMachine, SessionShared, callbacks_for};
use crate::ports::{Transport, TransportError, TransportHandle};
use crate::state_machine::{Transitions, ignore_event};

pub(crate) const RECONNECT_TASK: &str = "MqttReconnect";
pub(crate) const DISCONNECT_RECHECK_TASK: &str = "MqttDisconnectRecheck";

pub struct SessionTransitions {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    handle: Option<Box<dyn TransportHandle>>,
    /// Requested topics in request order. Append-only, duplicates allowed.
    topics: Vec<String>,
    shared: Arc<SessionShared>,
}

impl Transitions<SessionState, SessionEvent> for SessionTransitions {
    fn transition(
        &mut self,
        machine: &SessionMachine,
        state: &SessionState,
        event: SessionEvent,
    ) -> Option<SessionState> {
        use SessionEvent as E;
        use SessionState as S;

        match (*state, event) {
            (S::Disconnected, E::Connect) => self.connect(machine),
            (S::Connecting, E::Connected) => self.connected(),
            (S::Connecting | S::Connected | S::Disconnecting, E::Disconnect) => {
                self.disconnect(machine)
            }
            (S::Connecting | S::Connected | S::Disconnecting, E::Disconnected { reason }) => {
                self.disconnected(machine, reason)
            }
            (state, event) => ignore_event(&state, &event),
        }
    }
}

impl SessionTransitions {
    pub(crate) fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        shared: Arc<SessionShared>,
    ) -> Self {
        Self {
            config,
            transport,
            handle: None,
            topics: Vec::new(),
            shared,
        }
    }

    pub(crate) fn topics(&self) -> &[String] {
        &self.topics
    }

    pub(crate) fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    /// Track `topic`; subscribe right away when a live connection exists.
    pub(crate) fn track(&mut self, topic: String, state: SessionState) {
        debug!(%topic, ?state, "tracking topic");
        if state == SessionState::Connected
            && let Some(handle) = self.handle.as_mut()
            && let Err(e) = handle.subscribe(&topic)
        {
            warn!(%topic, error = %e, "subscribe failed");
        }
        self.topics.push(topic);
    }

    fn connect(&mut self, machine: &SessionMachine) -> Option<SessionState> {
        info!(
            broker = %self.config.broker_address,
            port = self.config.broker_port,
            client_id = %self.config.client_id,
            "connecting"
        );

        let callbacks = callbacks_for(machine, &self.shared);
        let mut handle = match self.transport.open(&self.config, callbacks) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "can't create transport handle");
                self.schedule_reconnect(machine);
                return None;
            }
        };

        if let Err(e) = handle.connect() {
            warn!(error = %e, "connect request failed");
            handle.close();
            self.schedule_reconnect(machine);
            return None;
        }

        self.handle = Some(handle);
        Some(SessionState::Connecting)
    }

    fn connected(&mut self) -> Option<SessionState> {
        info!(topics = self.topics.len(), "connected");

        // The broker keeps nothing for a clean session: resubscribe everything.
        if let Some(handle) = self.handle.as_mut() {
            for topic in &self.topics {
                if let Err(e) = handle.subscribe(topic) {
                    warn!(%topic, error = %e, "subscribe failed");
                }
            }
        }
        Some(SessionState::Connected)
    }

    fn disconnect(&mut self, machine: &SessionMachine) -> Option<SessionState> {
        let Some(handle) = self.handle.as_mut() else {
            warn!("disconnect requested without a transport handle");
            return None;
        };

        match handle.disconnect() {
            Err(TransportError::InvalidState(reason)) => {
                debug!(%reason, "transport refused disconnect; staying put");
                return None;
            }
            Err(e) => warn!(error = %e, "disconnect request failed; waiting for teardown"),
            Ok(()) => debug!("disconnect requested"),
        }

        self.schedule_disconnect_recheck(machine);
        Some(SessionState::Disconnecting)
    }

    fn disconnected(
        &mut self,
        machine: &SessionMachine,
        reason: Option<String>,
    ) -> Option<SessionState> {
        match &reason {
            Some(reason) => info!(%reason, "disconnected"),
            None => info!("disconnected"),
        }

        if let Some(handle) = self.handle.take() {
            handle.close();
        }
        // 進行中の再確認ループはこの時点で役目を終える
        self.shared.disconnect_epoch.fetch_add(1, Ordering::AcqRel);
        self.shared.recheck_active.store(false, Ordering::Release);
        self.schedule_reconnect(machine);
        Some(SessionState::Disconnected)
    }

    /// Dispatch `Connect` after the backoff, unless `stop()` came first.
    fn schedule_reconnect(&self, machine: &SessionMachine) {
        if !self.shared.should_reconnect() {
            return;
        }

        let backoff = self.config.reconnect_backoff;
        info!(backoff_ms = backoff.as_millis() as u64, "scheduling reconnect");

        let machine = machine.clone();
        let shared = Arc::clone(&self.shared);
        self.shared.scheduler.submit(RECONNECT_TASK, move |outcome| {
            if !outcome.was_requeued() {
                outcome.requeue_after(backoff);
                return;
            }
            if !shared.should_reconnect() {
                debug!("reconnect cancelled");
                return;
            }
            machine.dispatch(SessionEvent::Connect);
        });
    }

    /// Poll until this disconnect reaches `Disconnected`; force it after the
    /// timeout. The loop ends as soon as the session has left the epoch it was
    /// started in, so it never touches a later connection.
    fn schedule_disconnect_recheck(&self, machine: &SessionMachine) {
        if self.shared.recheck_active.swap(true, Ordering::AcqRel) {
            return;
        }

        let interval = self.config.disconnect_recheck;
        let deadline = Instant::now() + self.config.disconnect_timeout;
        let epoch = self.shared.disconnect_epoch.load(Ordering::Acquire);
        let machine = machine.clone();
        let shared = Arc::clone(&self.shared);
        self.shared.scheduler.submit(DISCONNECT_RECHECK_TASK, move |outcome| {
            if shared.disconnect_epoch.load(Ordering::Acquire) != epoch {
                debug!("disconnect completed");
                return;
            }
            let state = machine.state();
            if state != SessionState::Disconnecting {
                debug!(?state, "session left Disconnecting; recheck ends");
                shared.recheck_active.store(false, Ordering::Release);
                return;
            }
            if Instant::now() >= deadline {
                warn!(?state, "disconnect did not complete in time; forcing teardown");
                shared.recheck_active.store(false, Ordering::Release);
                machine.dispatch(SessionEvent::Disconnected {
                    reason: Some("disconnect timed out".to_string()),
                });
                return;
            }
            outcome.requeue_after(interval);
        });
    }
}
