//! RequestBridge - コールバックスレッドからスケジューラスレッドへの受け渡し
//!
//! 同期 API のサーバー（接続スレッド上でレスポンスを返す必要がある）と、
//! スケジューラ上でしか動かないビジネスロジックをつなぐ。
//!
//! # フロー
//! 1. メソッドとエンドポイントの許可リストを呼び出しスレッド上で検証
//! 2. `PendingRequest` を作ってハンドラ実行タスクを submit
//! 3. 完了シグナルをタイムアウト付きで待つ
//! 4. タイムアウトなら 500 を返す（遅れて来た結果は捨てる）
//!
//! 完了シグナルは容量 1 のチャネル。`PendingRequest` はハンドラ側が所有し、
//! 待つ側はチャネルの受信側だけを持つので、タイムアウト後の書き込みは
//! 誰にも観測されない。

mod request;

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError};
use tracing::{debug, info, warn};

pub use self::request::{Headers, PendingRequest, RawRequest, RawResponse};
use crate::scheduler::TaskScheduler;

pub const REQUEST_TASK: &str = "HttpRequest";

pub const STATUS_NOT_FOUND: u16 = 404;
pub const STATUS_METHOD_NOT_ALLOWED: u16 = 405;
pub const STATUS_INTERNAL_ERROR: u16 = 500;
pub const STATUS_UNAVAILABLE: u16 = 503;

/// Called on the scheduler thread; must eventually `finish` the request.
pub type RequestHandler = Arc<dyn Fn(PendingRequest) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub allowed_endpoints: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub request_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            allowed_endpoints: vec!["/metrics".to_string()],
            allowed_methods: vec!["GET".to_string()],
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl BridgeConfig {
    fn allows_method(&self, method: &str) -> bool {
        self.allowed_methods
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(method))
    }

    fn allows_endpoint(&self, endpoint: &str) -> bool {
        self.allowed_endpoints.iter().any(|allowed| allowed == endpoint)
    }
}

/// Configured once before the server accepts connections; immutable after.
pub struct RequestBridge {
    config: BridgeConfig,
    scheduler: TaskScheduler,
    handler: Option<RequestHandler>,
}

impl std::fmt::Debug for RequestBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBridge")
            .field("config", &self.config)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl RequestBridge {
    pub fn new(config: BridgeConfig, scheduler: TaskScheduler) -> Self {
        info!(
            endpoints = ?config.allowed_endpoints,
            timeout_ms = config.request_timeout.as_millis() as u64,
            "RequestBridge created"
        );
        Self {
            config,
            scheduler,
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: impl Fn(PendingRequest) + Send + Sync + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Serve one request. Runs on the transport's connection thread and blocks
    /// it for at most the configured timeout.
    pub fn handle(&self, request: RawRequest) -> RawResponse {
        debug!(method = %request.method, url = %request.url, "request received");

        if !self.config.allows_method(&request.method) {
            return RawResponse::text(STATUS_METHOD_NOT_ALLOWED, "Method Not Allowed\r\n");
        }
        let endpoint = request.endpoint().to_string();
        if !self.config.allows_endpoint(&endpoint) {
            return RawResponse::text(STATUS_NOT_FOUND, "Not Found\r\n");
        }
        let Some(handler) = self.handler.clone() else {
            warn!(%endpoint, "no request handler registered");
            return RawResponse::text(STATUS_UNAVAILABLE, "No Handler\r\n");
        };

        let (completion, response) = channel::bounded(1);
        let mut pending = Some(PendingRequest::new(endpoint.clone(), request.headers, completion));
        self.scheduler.submit(REQUEST_TASK, move |_| {
            if let Some(pending) = pending.take() {
                handler(pending);
            }
        });

        match response.recv_timeout(self.config.request_timeout) {
            Ok(response) => {
                debug!(%endpoint, status = response.status, "request completed");
                response
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    %endpoint,
                    timeout_ms = self.config.request_timeout.as_millis() as u64,
                    "request handler timed out"
                );
                RawResponse::text(STATUS_INTERNAL_ERROR, "Handler timed out\r\n")
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!(%endpoint, "request handler dropped the request without finishing it");
                RawResponse::text(STATUS_INTERNAL_ERROR, "Handler did not respond\r\n")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;

    use parking_lot::Mutex;

    use super::*;
    use crate::scheduler::testing::{shutdown_and_join, spawn_consumer};

    fn config(timeout: Duration) -> BridgeConfig {
        BridgeConfig {
            request_timeout: timeout,
            ..BridgeConfig::default()
        }
    }

    fn echo_handler(request: PendingRequest) {
        let mut request = request;
        let body = format!("endpoint {}", request.endpoint());
        request.add_response_header("Content-Type", "text/plain");
        request.set_response_body(body);
        request.finish();
    }

    #[test]
    fn rejects_without_touching_the_scheduler() {
        // No consumer is running: anything that reached the scheduler would hang.
        let scheduler = TaskScheduler::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let bridge = {
            let calls = Arc::clone(&calls);
            RequestBridge::new(config(Duration::from_secs(5)), scheduler.clone()).with_handler(
                move |request| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    request.finish();
                },
            )
        };

        let post = RawRequest {
            method: "POST".to_string(),
            ..RawRequest::get("/metrics")
        };
        assert_eq!(bridge.handle(post).status, STATUS_METHOD_NOT_ALLOWED);
        assert_eq!(bridge.handle(RawRequest::get("/admin")).status, STATUS_NOT_FOUND);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending().ready, 0);
    }

    #[test]
    fn missing_handler_is_rejected() {
        let bridge = RequestBridge::new(config(Duration::from_secs(5)), TaskScheduler::default());
        let response = bridge.handle(RawRequest::get("/metrics"));
        assert_eq!(response.status, STATUS_UNAVAILABLE);
    }

    #[test]
    fn returns_what_the_handler_set() {
        let scheduler = TaskScheduler::default();
        let consumer = spawn_consumer(&scheduler);
        let bridge = RequestBridge::new(config(Duration::from_secs(5)), scheduler.clone())
            .with_handler(echo_handler);

        let response = bridge.handle(RawRequest::get("/metrics?format=text"));

        assert_eq!(response.status, 200);
        assert_eq!(response.body, "endpoint /metrics");
        assert_eq!(response.headers["Content-Type"], "text/plain");
        shutdown_and_join(&scheduler, consumer);
    }

    #[test]
    fn handler_runs_on_the_scheduler_thread_with_request_headers() {
        let scheduler = TaskScheduler::default();
        let consumer = spawn_consumer(&scheduler);
        let bridge = RequestBridge::new(config(Duration::from_secs(5)), scheduler.clone())
            .with_handler(|mut request| {
                let thread_name = thread::current().name().unwrap_or_default().to_string();
                let agent = request.request_headers().get("user-agent").cloned().unwrap_or_default();
                request.set_response_body(format!("{thread_name} {agent}"));
                request.finish();
            });

        let mut request = RawRequest::get("/metrics");
        request.headers.insert("user-agent".to_string(), "prometheus".to_string());
        let response = bridge.handle(request);

        assert_eq!(response.body, "scheduler prometheus");
        shutdown_and_join(&scheduler, consumer);
    }

    #[test]
    fn unfinished_request_times_out_with_server_error() {
        let scheduler = TaskScheduler::default();
        let consumer = spawn_consumer(&scheduler);
        let parked = Arc::new(Mutex::new(Vec::<PendingRequest>::new()));
        let bridge = {
            let parked = Arc::clone(&parked);
            RequestBridge::new(config(Duration::from_millis(100)), scheduler.clone())
                .with_handler(move |request| parked.lock().push(request))
        };

        let started = Instant::now();
        let response = bridge.handle(RawRequest::get("/metrics"));
        let elapsed = started.elapsed();

        assert_eq!(response.status, STATUS_INTERNAL_ERROR);
        assert_eq!(response.body, "Handler timed out\r\n");
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(1));

        // A late completion lands nowhere.
        for request in parked.lock().drain(..) {
            request.finish();
        }
        shutdown_and_join(&scheduler, consumer);
    }

    #[test]
    fn dropped_request_fails_fast() {
        let scheduler = TaskScheduler::default();
        let consumer = spawn_consumer(&scheduler);
        let bridge = RequestBridge::new(config(Duration::from_secs(5)), scheduler.clone())
            .with_handler(drop);

        let started = Instant::now();
        let response = bridge.handle(RawRequest::get("/metrics"));

        assert_eq!(response.status, STATUS_INTERNAL_ERROR);
        assert!(started.elapsed() < Duration::from_secs(1));
        shutdown_and_join(&scheduler, consumer);
    }

    #[test]
    fn concurrent_callers_each_get_their_own_response() {
        let scheduler = TaskScheduler::default();
        let consumer = spawn_consumer(&scheduler);
        let bridge = Arc::new(
            RequestBridge::new(
                BridgeConfig {
                    allowed_endpoints: (0..8).map(|i| format!("/e{i}")).collect(),
                    ..config(Duration::from_secs(5))
                },
                scheduler.clone(),
            )
            .with_handler(echo_handler),
        );

        let callers: Vec<_> = (0..8)
            .map(|i| {
                let bridge = Arc::clone(&bridge);
                thread::spawn(move || bridge.handle(RawRequest::get(format!("/e{i}"))))
            })
            .collect();

        for (i, caller) in callers.into_iter().enumerate() {
            let response = caller.join().unwrap();
            assert_eq!(response.status, 200);
            assert_eq!(response.body, format!("endpoint /e{i}"));
        }
        shutdown_and_join(&scheduler, consumer);
    }
}
