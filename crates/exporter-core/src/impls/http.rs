//! HttpServer - axum による RequestBridge のフロントエンド
//!
//! ルーターは fallback だけを持ち、全メソッド・全パスを受けて
//! [`RequestBridge::handle`] に渡す。bridge はタイムアウトまでブロックするので
//! ランタイムのワーカーではなく blocking プールで動かす。
//!
//! `start` / `stop` はスケジューラタスクから呼ばれる同期 API。サーバー本体は
//! 外から渡された tokio ランタイム上で動く。

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bridge::{Headers, RawRequest, RawResponse, RequestBridge};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("can't bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("listener setup failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8888 }
    }
}

struct Running {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct HttpServer {
    config: ServerConfig,
    bridge: Arc<RequestBridge>,
    runtime: Handle,
    running: Mutex<Option<Running>>,
}

impl HttpServer {
    pub fn new(config: ServerConfig, bridge: Arc<RequestBridge>, runtime: Handle) -> Self {
        info!(port = config.port, "HttpServer created");
        Self {
            config,
            bridge,
            runtime,
            running: Mutex::new(None),
        }
    }

    /// Bind and start serving. Must not be called from inside the runtime.
    pub fn start(&self) -> Result<(), ServerError> {
        let mut running = self.running.lock();
        if let Some(current) = running.as_ref() {
            warn!(addr = %current.local_addr, "server already started");
            return Ok(());
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = std::net::TcpListener::bind(addr)
            .map_err(|source| ServerError::Bind { addr, source })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let _guard = self.runtime.enter();
        let listener = tokio::net::TcpListener::from_std(listener)?;
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let app = router(Arc::clone(&self.bridge));

        let task = self.runtime.spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                error!(error = ?e, "http server error");
            }
        });

        info!(addr = %local_addr, "http server listening");
        *running = Some(Running {
            local_addr,
            shutdown,
            task,
        });
        Ok(())
    }

    /// Begin graceful shutdown. In-flight requests are allowed to finish.
    pub fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            warn!("server not running");
            return;
        };
        if running.shutdown.send(()).is_err() && running.task.is_finished() {
            warn!("server task had already exited");
        }
        info!(addr = %running.local_addr, "http server stopping");
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|running| running.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

/// Catch-all router in front of `bridge`.
pub fn router(bridge: Arc<RequestBridge>) -> Router {
    Router::new().fallback(forward).with_state(bridge)
}

async fn forward(
    State(bridge): State<Arc<RequestBridge>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let request = RawRequest {
        method: method.as_str().to_string(),
        url: uri
            .path_and_query()
            .map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string()),
        headers: collect_headers(&headers),
    };

    match tokio::task::spawn_blocking(move || bridge.handle(request)).await {
        Ok(response) => into_response(response),
        Err(e) => {
            error!(error = %e, "request handling task failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error\r\n").into_response()
        }
    }
}

/// Non UTF-8 header values are skipped.
fn collect_headers(headers: &HeaderMap) -> Headers {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn into_response(raw: RawResponse) -> Response {
    let status = StatusCode::from_u16(raw.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, raw.body).into_response();
    for (name, value) in raw.headers {
        match (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str())) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => warn!(header = %name, "dropping invalid response header"),
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::bridge::BridgeConfig;
    use crate::scheduler::TaskScheduler;
    use crate::scheduler::testing::{shutdown_and_join, spawn_consumer};

    fn bridge(scheduler: &TaskScheduler) -> Arc<RequestBridge> {
        Arc::new(
            RequestBridge::new(BridgeConfig::default(), scheduler.clone()).with_handler(
                |mut request| {
                    let agent = request.request_headers().get("user-agent").cloned();
                    request.add_response_header("Content-Type", "text/plain; version=0.0.4");
                    request.set_response_body(format!("up 1 {}\n", agent.unwrap_or_default()));
                    request.finish();
                },
            ),
        )
    }

    async fn send(app: Router, method: Method, uri: &str) -> (StatusCode, HeaderMap, String) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("user-agent", "prometheus")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn forwards_to_the_bridge() {
        let scheduler = TaskScheduler::default();
        let consumer = spawn_consumer(&scheduler);

        let (status, headers, body) = send(router(bridge(&scheduler)), Method::GET, "/metrics?x=1").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["content-type"], "text/plain; version=0.0.4");
        assert_eq!(body, "up 1 prometheus\n");
        shutdown_and_join(&scheduler, consumer);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bridge_rejections_become_http_statuses() {
        let scheduler = TaskScheduler::default();
        let app = router(bridge(&scheduler));

        let (status, _, _) = send(app.clone(), Method::POST, "/metrics").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

        let (status, _, _) = send(app, Method::GET, "/other").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn invalid_status_and_headers_are_contained() {
        let mut raw = RawResponse::text(1000, "x");
        raw.headers.insert("bad header".to_string(), "v".to_string());
        raw.headers.insert("x-ok".to_string(), "yes".to_string());

        let response = into_response(raw);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()["x-ok"], "yes");
        assert!(!response.headers().contains_key("bad header"));
    }

    #[test]
    fn serves_over_tcp_until_stopped() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let scheduler = TaskScheduler::default();
        let consumer = spawn_consumer(&scheduler);
        let server = HttpServer::new(ServerConfig { port: 0 }, bridge(&scheduler), runtime.handle().clone());

        server.start().unwrap();
        let addr = server.local_addr().unwrap();
        // 二回目は警告だけ
        server.start().unwrap();
        assert_eq!(server.local_addr(), Some(addr));

        let mut stream = TcpStream::connect(("127.0.0.1", addr.port())).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).unwrap();

        assert!(reply.starts_with("HTTP/1.1 200"), "{reply}");
        assert!(reply.ends_with("up 1 \n"), "{reply}");

        server.stop();
        assert!(!server.is_running());
        server.stop();

        shutdown_and_join(&scheduler, consumer);
        runtime.shutdown_timeout(Duration::from_secs(1));
    }

    #[test]
    fn port_in_use_is_a_bind_error() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let taken = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let scheduler = TaskScheduler::default();
        let server = HttpServer::new(ServerConfig { port }, bridge(&scheduler), runtime.handle().clone());

        assert!(matches!(server.start(), Err(ServerError::Bind { .. })));
        assert!(!server.is_running());
    }
}
