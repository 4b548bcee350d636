//! App - コンポジションルート
//!
//! スケジューラ・セッション・メトリクス・bridge・HTTP サーバーを組み合わせる。
//!
//! # 主要コンポーネント
//! - **ExporterBuilder**: 構築とワイヤリング
//! - **Exporter**: `run()` でスケジューラを呼び出しスレッド上で回す
//! - **ShutdownHandle**: シグナルスレッドから後片付けと停止を要求する
//!
//! # 停止手順
//! 1. `HttpServerStop` / `MqttSessionStop` を priority 0 で投入
//! 2. `Shutdown`（priority 1）で `request_shutdown()`
//! 3. スケジューラは切断の再確認ループが終わるまで drain してから戻る
//!
//! `run()` より先に停止が要求された場合、開始タスクは何もしない。

pub mod builder;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

pub use self::builder::{BuildError, ExporterBuilder};
use crate::bridge::PendingRequest;
use crate::config::Configuration;
use crate::impls::HttpServer;
use crate::metrics::{CONTENT_TYPE, MetricsAccumulator, MetricsPresenter};
use crate::ports::Transport;
use crate::scheduler::{SchedulerError, TaskScheduler};
use crate::session::ConnectionSession;

pub const HTTP_START_TASK: &str = "HttpServerStart";
pub const HTTP_STOP_TASK: &str = "HttpServerStop";
pub const SESSION_START_TASK: &str = "MqttSessionStart";
pub const SESSION_STOP_TASK: &str = "MqttSessionStop";
pub const SHUTDOWN_TASK: &str = "Shutdown";

pub const METRICS_ENDPOINT: &str = "/metrics";

pub struct Exporter {
    scheduler: TaskScheduler,
    session: ConnectionSession,
    server: Arc<HttpServer>,
    metrics: Arc<Mutex<MetricsAccumulator>>,
    /// Shared by every `ShutdownHandle`.
    shutdown_requested: Arc<AtomicBool>,
}

impl Exporter {
    pub fn build(
        config: Configuration,
        runtime: Handle,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, BuildError> {
        ExporterBuilder::new(config)
            .runtime(runtime)
            .transport(transport)
            .build()
    }

    /// Start the server and the session, then consume tasks on the calling
    /// thread until a shutdown has drained.
    pub fn run(&self) -> Result<(), SchedulerError> {
        let server = Arc::clone(&self.server);
        let requested = Arc::clone(&self.shutdown_requested);
        self.scheduler.submit(HTTP_START_TASK, move |_| {
            if requested.load(Ordering::Acquire) {
                info!("shutdown already requested; http server not started");
                return;
            }
            // bind に失敗しても MQTT 側は動かし続ける
            if let Err(e) = server.start() {
                error!(error = %e, "http server failed to start");
            }
        });

        let session = self.session.clone();
        let requested = Arc::clone(&self.shutdown_requested);
        self.scheduler.submit(SESSION_START_TASK, move |_| {
            if requested.load(Ordering::Acquire) {
                info!("shutdown already requested; mqtt session not started");
                return;
            }
            session.start();
        });

        info!("exporter running");
        self.scheduler.run()?;
        info!("exporter stopped");
        Ok(())
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            scheduler: self.scheduler.clone(),
            session: self.session.clone(),
            server: Arc::clone(&self.server),
            requested: Arc::clone(&self.shutdown_requested),
        }
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn session(&self) -> &ConnectionSession {
        &self.session
    }

    pub fn server(&self) -> &HttpServer {
        &self.server
    }

    pub fn metrics(&self) -> &Arc<Mutex<MetricsAccumulator>> {
        &self.metrics
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Cleanup was queued; the scheduler stops once it has drained.
    Initiated,
    /// Shutdown had already been requested. The caller should exit hard.
    Forced,
}

/// Cloneable; safe to call from a signal-handling thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    scheduler: TaskScheduler,
    session: ConnectionSession,
    server: Arc<HttpServer>,
    requested: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) -> ShutdownOutcome {
        if self.requested.swap(true, Ordering::AcqRel) {
            warn!("shutdown requested again; forcing exit");
            return ShutdownOutcome::Forced;
        }
        info!("shutdown requested");

        let server = Arc::clone(&self.server);
        self.scheduler
            .submit_with_priority(HTTP_STOP_TASK, 0, move |_| server.stop());

        let session = self.session.clone();
        self.scheduler
            .submit_with_priority(SESSION_STOP_TASK, 0, move |_| session.stop());

        let scheduler = self.scheduler.clone();
        self.scheduler
            .submit_with_priority(SHUTDOWN_TASK, 1, move |_| scheduler.request_shutdown());

        ShutdownOutcome::Initiated
    }
}

/// Every inbound message becomes the latest value of its topic's metric.
pub(crate) fn message_handler(
    metrics: Arc<Mutex<MetricsAccumulator>>,
) -> impl Fn(&str, &[u8]) + Send + Sync + 'static {
    move |topic, payload| {
        metrics.lock().add(topic, String::from_utf8_lossy(payload));
    }
}

/// `/metrics` renders the store; any other allowed endpoint is a 404.
pub(crate) fn request_handler(
    metrics: Arc<Mutex<MetricsAccumulator>>,
    presenter: MetricsPresenter,
) -> impl Fn(PendingRequest) + Send + Sync + 'static {
    move |mut request| {
        if request.endpoint() == METRICS_ENDPOINT {
            let body = presenter.present(&metrics.lock());
            request.add_response_header("Content-Type", CONTENT_TYPE);
            request.set_response_body(body);
        } else {
            request.set_response_code(404);
            request.set_response_body("Not Found\r\n");
        }
        request.finish();
    }
}
