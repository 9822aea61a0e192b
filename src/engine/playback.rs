//! Playback path: fingerprint, look up, serve

use tracing::{debug, info, warn};

use super::{Engine, PlaybackOutcome};
use crate::message::Request;

impl Engine {
    /// Answer `request` from its recording without contacting the upstream
    ///
    /// A storage failure or an undecodable recording is reported as a miss.
    pub async fn handle_playback(&self, request: &Request) -> PlaybackOutcome {
        let key = self.fingerprint(request);

        match self.store.get(&key).await {
            Ok(Some(recording)) => {
                info!(
                    "Playback hit {} {} -> {} ({})",
                    request.method,
                    request.uri,
                    recording.response.status,
                    key.short()
                );
                PlaybackOutcome::Hit(recording.response)
            }
            Ok(None) => {
                warn!(
                    "No recording for {} {} ({})",
                    request.method,
                    request.uri,
                    key.short()
                );
                PlaybackOutcome::NotFound(key)
            }
            Err(e) => {
                warn!(
                    "Lookup failed for {} {} ({}), treating as miss: {}",
                    request.method,
                    request.uri,
                    key.short(),
                    e
                );
                debug!("Unusable recording key: {}", self.store.key_for(&key));
                PlaybackOutcome::NotFound(key)
            }
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
    use crate::storage::{KvStore, Recording};

    use super::*;

    fn request(uri: &str) -> Request {
        Request::new(Method::GET, uri.parse().unwrap())
    }

    #[tokio::test]
    async fn test_hit_is_byte_equal_and_offline() {
        let upstream = StubUpstream::failing();
        let (engine, _) = memory_engine(Mode::Playback, upstream.clone());
        let req = request("http://example.com/a");
        let recorded = Response::new(StatusCode::OK, vec![0u8, 159, 146, 150])
            .with_header(
                HeaderName::from_static("set-cookie"),
                HeaderValue::from_static("a=1"),
            )
            .with_header(
                HeaderName::from_static("set-cookie"),
                HeaderValue::from_static("b=2"),
            );

        let key = fingerprint(&req, &FingerprintPolicy::default());
        engine
            .store()
            .put(&Recording::new(key, recorded.clone()))
            .await
            .unwrap();

        assert_eq!(
            engine.handle_playback(&req).await,
            PlaybackOutcome::Hit(recorded)
        );
        assert_eq!(upstream.calls(), 0);
    }

    #[tokio::test]
    async fn test_miss_is_not_found_with_fingerprint() {
        let (engine, _) = memory_engine(Mode::Playback, StubUpstream::failing());
        let req = request("http://example.com/never-recorded");

        let outcome = engine.handle_playback(&req).await;

        assert_eq!(
            outcome,
            PlaybackOutcome::NotFound(fingerprint(&req, &FingerprintPolicy::default()))
        );
    }

    #[tokio::test]
    async fn test_storage_failure_is_miss() {
        let engine = engine_with(Mode::Playback, Arc::new(BrokenStore), StubUpstream::failing());

        assert!(matches!(
            engine.handle_playback(&request("http://example.com/")).await,
            PlaybackOutcome::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_corrupt_recording_is_miss() {
        let (engine, backend) = memory_engine(Mode::Playback, StubUpstream::failing());
        let req = request("http://example.com/corrupt");
        let key = fingerprint(&req, &FingerprintPolicy::default());

        backend
            .set(&engine.store().key_for(&key), b"garbage".to_vec(), None)
            .await
            .unwrap();

        assert_eq!(
            engine.handle_playback(&req).await,
            PlaybackOutcome::NotFound(key)
        );
    }
}
