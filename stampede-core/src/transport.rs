use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;

use crate::stats::RunStats;
use stampede_metrics::{MetricHandle, MetricKind};

pub mod names {
    pub const REQUESTS: &str = "requests";
    pub const REQUEST_DURATION: &str = "request_duration";
    pub const REQUEST_FAILED: &str = "request_failed";
    pub const DATA_SENT: &str = "data_sent";
    pub const DATA_RECEIVED: &str = "data_received";
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("request timed out")]
    Timeout,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: Bytes::new(),
            timeout: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }
}

/// Protocol seam. Scenario bodies reach the system under test only through
/// this trait; the harness itself never interprets status codes or payloads.
/// Connect failures and timeouts surface as errors, like any other failed
/// result.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn perform(&self, request: Request) -> Result<Response, TransportError>;
}

/// Wraps any transport and feeds the request metric family: a counter, a
/// duration trend in milliseconds, a failure rate, and byte counters, tagged
/// with method and url.
pub struct RecordingTransport<T> {
    inner: T,
    requests: MetricHandle,
    request_duration: MetricHandle,
    request_failed: MetricHandle,
    data_sent: MetricHandle,
    data_received: MetricHandle,
}

impl<T: Transport> RecordingTransport<T> {
    pub fn new(inner: T, stats: &Arc<RunStats>) -> Self {
        let registry = stats.registry();
        Self {
            inner,
            requests: registry.handle(MetricKind::Counter, names::REQUESTS),
            request_duration: registry.handle(MetricKind::Trend, names::REQUEST_DURATION),
            request_failed: registry.handle(MetricKind::Rate, names::REQUEST_FAILED),
            data_sent: registry.handle(MetricKind::Counter, names::DATA_SENT),
            data_received: registry.handle(MetricKind::Counter, names::DATA_RECEIVED),
        }
    }
}

#[async_trait]
impl<T: Transport> Transport for RecordingTransport<T> {
    async fn perform(&self, request: Request) -> Result<Response, TransportError> {
        let method = request.method.clone();
        let url = request.url.clone();
        let tags = [("method", method.as_str()), ("url", url.as_str())];
        let sent = request.body.len() as f64;

        let started = Instant::now();
        let result = self.inner.perform(request).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        self.requests.add_with_tags(1.0, &tags);
        self.request_duration.add_with_tags(elapsed_ms, &tags);
        self.data_sent.add_with_tags(sent, &tags);

        match &result {
            Ok(response) => {
                self.request_failed
                    .add_bool_with_tags(!response.is_success(), &tags);
                self.data_received
                    .add_with_tags(response.body.len() as f64, &tags);
            }
            Err(_) => {
                self.request_failed.add_bool_with_tags(true, &tags);
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stampede_metrics::SinkValue;

    struct Echo {
        status: u16,
    }

    #[async_trait]
    impl Transport for Echo {
        async fn perform(&self, request: Request) -> Result<Response, TransportError> {
            Ok(Response {
                status: self.status,
                headers: Vec::new(),
                body: request.body,
            })
        }
    }

    struct Unreachable;

    #[async_trait]
    impl Transport for Unreachable {
        async fn perform(&self, _request: Request) -> Result<Response, TransportError> {
            Err(TransportError::Connect("refused".into()))
        }
    }

    fn rate_counts(stats: &RunStats, name: &str) -> (u64, u64) {
        let snap = stats.snapshot();
        let series = match snap.base_series(name) {
            Some(s) => s,
            None => panic!("missing series {name}"),
        };
        match &series.values {
            SinkValue::Rate { total, trues, .. } => (*total, *trues),
            other => panic!("expected rate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn recording_transport_feeds_the_request_family() {
        let stats = Arc::new(RunStats::new());
        let transport = RecordingTransport::new(Echo { status: 200 }, &stats);

        let request = Request::new("POST", "/orders").body("hello");
        let response = match transport.perform(request).await {
            Ok(r) => r,
            Err(e) => panic!("perform failed: {e}"),
        };
        assert!(response.is_success());

        let snap = stats.snapshot();
        let requests = match snap.base_series(names::REQUESTS) {
            Some(s) => s,
            None => panic!("missing requests series"),
        };
        match &requests.values {
            SinkValue::Counter { total } => assert_eq!(*total, 1.0),
            other => panic!("expected counter, got {other:?}"),
        }

        let sent = match snap.base_series(names::DATA_SENT) {
            Some(s) => s,
            None => panic!("missing data_sent series"),
        };
        match &sent.values {
            SinkValue::Counter { total } => assert_eq!(*total, 5.0),
            other => panic!("expected counter, got {other:?}"),
        }

        assert_eq!(rate_counts(&stats, names::REQUEST_FAILED), (1, 0));
    }

    #[tokio::test]
    async fn non_success_status_counts_as_failed() {
        let stats = Arc::new(RunStats::new());
        let transport = RecordingTransport::new(Echo { status: 503 }, &stats);

        match transport.perform(Request::new("GET", "/health")).await {
            Ok(r) => assert!(!r.is_success()),
            Err(e) => panic!("perform failed: {e}"),
        }

        assert_eq!(rate_counts(&stats, names::REQUEST_FAILED), (1, 1));
    }

    #[tokio::test]
    async fn transport_errors_count_as_failed_requests() {
        let stats = Arc::new(RunStats::new());
        let transport = RecordingTransport::new(Unreachable, &stats);

        match transport.perform(Request::new("GET", "/down")).await {
            Ok(_) => panic!("expected error"),
            Err(TransportError::Connect(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }

        assert_eq!(rate_counts(&stats, names::REQUEST_FAILED), (1, 1));
    }
}
