//! Request / response values crossing the bridge.

use std::collections::BTreeMap;

use crossbeam::channel::Sender;
use tracing::debug;

pub type Headers = BTreeMap<String, String>;

/// What the transport hands over on its connection thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequest {
    pub method: String,
    /// Request target as received (path plus optional query).
    pub url: String,
    pub headers: Headers,
}

impl RawRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Headers::new(),
        }
    }

    /// Path part of the target, without the query string.
    pub fn endpoint(&self) -> &str {
        self.url.split(['?', '#']).next().unwrap_or_default()
    }
}

/// What the transport sends back on the same thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: String,
}

impl RawResponse {
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: body.into(),
        }
    }
}

/// One in-flight request, owned by the registered handler on the scheduler
/// thread.
///
/// `finish` consumes the request, so it can be completed at most once. A
/// request dropped without `finish` is reported to the waiting caller as a
/// handler failure.
#[derive(Debug)]
pub struct PendingRequest {
    endpoint: String,
    request_headers: Headers,
    response_code: u16,
    response_headers: Headers,
    response_body: String,
    completion: Sender<RawResponse>,
}

impl PendingRequest {
    pub(crate) fn new(endpoint: String, request_headers: Headers, completion: Sender<RawResponse>) -> Self {
        Self {
            endpoint,
            request_headers,
            response_code: 200,
            response_headers: Headers::new(),
            response_body: String::new(),
            completion,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn request_headers(&self) -> &Headers {
        &self.request_headers
    }

    pub fn set_response_code(&mut self, code: u16) {
        self.response_code = code;
    }

    pub fn add_response_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.response_headers.insert(key.into(), value.into());
    }

    pub fn set_response_body(&mut self, body: impl Into<String>) {
        self.response_body = body.into();
    }

    /// Complete the request. If the caller already gave up (timeout) the
    /// response is discarded.
    pub fn finish(self) {
        let response = RawResponse {
            status: self.response_code,
            headers: self.response_headers,
            body: self.response_body,
        };
        if self.completion.send(response).is_err() {
            debug!(endpoint = %self.endpoint, "caller no longer waiting; response discarded");
        }
    }
}
