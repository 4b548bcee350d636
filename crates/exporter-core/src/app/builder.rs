//! ExporterBuilder - コンポーネントの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - ランタイムと transport が揃っていなければ build() でエラー
//! - 許可エンドポイントは `/` で始まるパスでなければならない

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::info;

use super::{Exporter, message_handler, request_handler};
use crate::bridge::RequestBridge;
use crate::config::Configuration;
use crate::impls::HttpServer;
use crate::metrics::{MetricsAccumulator, MetricsPresenter};
use crate::ports::Transport;
use crate::scheduler::TaskScheduler;
use crate::session::ConnectionSession;

/// BuildError は Exporter 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no tokio runtime handle was supplied for the http server")]
    MissingRuntime,

    #[error("no messaging transport was supplied")]
    MissingTransport,

    #[error("allowed endpoint {0:?} is not an absolute path")]
    InvalidEndpoint(String),
}

/// # 使用例
/// ```ignore
/// let exporter = ExporterBuilder::new(config)
///     .runtime(runtime.handle().clone())
///     .transport(Arc::new(RumqttTransport::new()))
///     .build()?;
/// ```
pub struct ExporterBuilder {
    config: Configuration,
    runtime: Option<Handle>,
    transport: Option<Arc<dyn Transport>>,
}

impl ExporterBuilder {
    pub fn new(config: Configuration) -> Self {
        Self {
            config,
            runtime: None,
            transport: None,
        }
    }

    /// Runtime the http server is spawned on.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<Exporter, BuildError> {
        let runtime = self.runtime.ok_or(BuildError::MissingRuntime)?;
        let transport = self.transport.ok_or(BuildError::MissingTransport)?;
        if let Some(invalid) = self
            .config
            .http
            .allowed_endpoints
            .iter()
            .find(|endpoint| !endpoint.starts_with('/'))
        {
            return Err(BuildError::InvalidEndpoint(invalid.clone()));
        }

        let scheduler = TaskScheduler::new(self.config.scheduler_config());
        let metrics = Arc::new(Mutex::new(MetricsAccumulator::new()));

        let session = ConnectionSession::new(self.config.session_config(), transport, scheduler.clone());
        session.set_message_handler(message_handler(Arc::clone(&metrics)));
        for topic in &self.config.mqtt.topics {
            session.subscribe(topic.clone());
        }

        let bridge = RequestBridge::new(self.config.bridge_config(), scheduler.clone())
            .with_handler(request_handler(Arc::clone(&metrics), MetricsPresenter::default()));
        let server = Arc::new(HttpServer::new(
            self.config.server_config(),
            Arc::new(bridge),
            runtime,
        ));

        info!(topics = self.config.mqtt.topics.len(), "exporter built");
        Ok(Exporter {
            scheduler,
            session,
            server,
            metrics,
            shutdown_requested: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::transport::fake::FakeTransport;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn build_success() {
        let runtime = runtime();
        let exporter = ExporterBuilder::new(Configuration::default())
            .runtime(runtime.handle().clone())
            .transport(Arc::new(FakeTransport::new()))
            .build();
        assert!(exporter.is_ok());
    }

    #[test]
    fn build_requires_runtime_and_transport() {
        let result = ExporterBuilder::new(Configuration::default())
            .transport(Arc::new(FakeTransport::new()))
            .build();
        assert!(matches!(result, Err(BuildError::MissingRuntime)));

        let runtime = runtime();
        let result = ExporterBuilder::new(Configuration::default())
            .runtime(runtime.handle().clone())
            .build();
        assert!(matches!(result, Err(BuildError::MissingTransport)));
    }

    #[test]
    fn build_rejects_relative_endpoints() {
        let mut config = Configuration::default();
        config.http.allowed_endpoints = vec!["/metrics".to_string(), "health".to_string()];

        let runtime = runtime();
        let result = ExporterBuilder::new(config)
            .runtime(runtime.handle().clone())
            .transport(Arc::new(FakeTransport::new()))
            .build();
        assert!(matches!(result, Err(BuildError::InvalidEndpoint(e)) if e == "health"));
    }

    #[test]
    fn configured_topics_are_queued_for_subscription() {
        let mut config = Configuration::default();
        config.mqtt.topics = vec!["a/b".to_string(), "c".to_string()];

        let runtime = runtime();
        let exporter = ExporterBuilder::new(config)
            .runtime(runtime.handle().clone())
            .transport(Arc::new(FakeTransport::new()))
            .build()
            .unwrap();

        // 2 subscribe tasks, nothing has run yet
        assert_eq!(exporter.scheduler().pending().ready, 2);
    }
}
