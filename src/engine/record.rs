//! Record path: forward, capture, store

use tracing::{debug, info, warn};

use super::{Engine, RecordOutcome};
use crate::message::Request;
use crate::storage::Recording;

impl Engine {
    /// Forward `request` upstream and persist the response under its fingerprint
    ///
    /// A failed upstream call stores nothing. A failed store still returns the
    /// upstream response, with `stored` set to false.
    pub async fn handle_record(&self, request: &Request) -> RecordOutcome {
        let response = match self.upstream.forward(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Not recording {} {}: {}", request.method, request.uri, e);
                return RecordOutcome::UpstreamFailed(e);
            }
        };

        let key = self.fingerprint(request);
        let recording = Recording::new(key, response);

        let stored = match self.store.put(&recording).await {
            Ok(()) => {
                info!(
                    "Recorded {} {} -> {} ({})",
                    request.method,
                    request.uri,
                    recording.response.status,
                    recording.key.short()
                );
                true
            }
            Err(e) => {
                warn!(
                    "Failed to store recording {} for {} {}: {}",
                    recording.key.short(),
                    request.method,
                    request.uri,
                    e
                );
                false
            }
        };
        debug!("Record path complete (stored: {})", stored);

        RecordOutcome::Forwarded {
            response: recording.response,
            stored,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use http::header::{HeaderName, HeaderValue};
    use http::{Method, StatusCode};

    use super::super::testing::*;
    use crate::config::Mode;
    use crate::fingerprint::{fingerprint, FingerprintPolicy};
    use crate::message::Response;
    use crate::GenproxyError;

    use super::*;

    fn request(uri: &str) -> Request {
        Request::new(Method::GET, uri.parse().unwrap())
    }

    #[tokio::test]
    async fn test_record_stores_and_returns_response() {
        let upstream_response = Response::new(StatusCode::CREATED, "made").with_header(
            HeaderName::from_static("content-type"),
            HeaderValue::from_static("text/plain"),
        );
        let (engine, backend) =
            memory_engine(Mode::Record, StubUpstream::answering(vec![upstream_response.clone()]));
        let req = request("http://example.com/items");

        match engine.handle_record(&req).await {
            RecordOutcome::Forwarded { response, stored } => {
                assert_eq!(response, upstream_response);
                assert!(stored);
            }
            RecordOutcome::UpstreamFailed(e) => panic!("unexpected failure: {e}"),
        }

        let key = fingerprint(&req, &FingerprintPolicy::default());
        assert!(backend.contains(&engine.store().key_for(&key)));
        let stored = engine.store().get(&key).await.unwrap().unwrap();
        assert_eq!(stored.response, upstream_response);
    }

    #[tokio::test]
    async fn test_upstream_failure_stores_nothing() {
        let (engine, backend) = memory_engine(Mode::Record, StubUpstream::failing());

        let outcome = engine.handle_record(&request("http://example.com/")).await;

        assert!(matches!(
            outcome,
            RecordOutcome::UpstreamFailed(GenproxyError::UpstreamUnavailable(_))
        ));
        assert_eq!(backend.stats().sets, 0);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_still_returns_response() {
        let engine = engine_with(
            Mode::Record,
            Arc::new(BrokenStore),
            StubUpstream::answering(vec![Response::new(StatusCode::OK, "ok")]),
        );

        match engine.handle_record(&request("http://example.com/")).await {
            RecordOutcome::Forwarded { response, stored } => {
                assert_eq!(response.body, "ok");
                assert!(!stored);
            }
            RecordOutcome::UpstreamFailed(e) => panic!("unexpected failure: {e}"),
        }
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let (engine, backend) = memory_engine(
            Mode::Record,
            StubUpstream::answering(vec![
                Response::new(StatusCode::OK, "first"),
                Response::new(StatusCode::OK, "second"),
            ]),
        );
        let req = request("http://example.com/counter");

        engine.handle_record(&req).await;
        engine.handle_record(&req).await;

        let key = fingerprint(&req, &FingerprintPolicy::default());
        let stored = engine.store().get(&key).await.unwrap().unwrap();
        assert_eq!(stored.response.body, "second");
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn test_degraded_request_is_still_recorded() {
        let (engine, backend) = memory_engine(
            Mode::Record,
            StubUpstream::answering(vec![Response::new(StatusCode::OK, "ok")]),
        );

        let outcome = engine.handle_record(&request("/no-host")).await;

        assert!(matches!(
            outcome,
            RecordOutcome::Forwarded { stored: true, .. }
        ));
        assert_eq!(backend.len(), 1);
    }
}
