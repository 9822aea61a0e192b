//! Record/playback decision engine
//!
//! Only requests the interception rule marks as managed reach the engine.
//! In record mode they are forwarded and captured; in playback mode they are
//! answered from the recording store.

mod playback;
mod record;

use std::sync::Arc;

use tracing::warn;

use crate::config::Mode;
use crate::fingerprint::{canonical_form, fingerprint, Fingerprint, FingerprintPolicy};
use crate::message::{Request, Response};
use crate::network::Upstream;
use crate::storage::RecordingStore;
use crate::GenproxyError;

/// Result of the record path
#[derive(Debug)]
pub enum RecordOutcome {
    /// Upstream answered; `stored` is false when persisting failed
    Forwarded {
        /// Upstream response, returned to the client unchanged
        response: Response,
        /// Whether the recording was written
        stored: bool,
    },
    /// Upstream could not be reached; nothing was stored
    UpstreamFailed(GenproxyError),
}

/// Result of the playback path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Recorded response
    Hit(Response),
    /// No usable recording for this fingerprint
    NotFound(Fingerprint),
}

/// Outcome of [`Engine::handle`], one variant per mode
#[derive(Debug)]
pub enum Outcome {
    /// Record mode
    Record(RecordOutcome),
    /// Playback mode
    Playback(PlaybackOutcome),
}

/// Record/playback engine
///
/// Holds no per-request state; share it behind an `Arc`.
pub struct Engine {
    mode: Mode,
    policy: FingerprintPolicy,
    store: RecordingStore,
    upstream: Arc<dyn Upstream>,
}

impl Engine {
    /// Create an engine fixed to `mode`
    #[must_use]
    pub fn new(
        mode: Mode,
        policy: FingerprintPolicy,
        store: RecordingStore,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        Self {
            mode,
            policy,
            store,
            upstream,
        }
    }

    /// Mode chosen at startup
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Store the engine reads and writes
    #[must_use]
    pub fn store(&self) -> &RecordingStore {
        &self.store
    }

    /// Handle a managed request according to the engine's mode
    pub async fn handle(&self, request: &Request) -> Outcome {
        match self.mode {
            Mode::Record => Outcome::Record(self.handle_record(request).await),
            Mode::Playback => Outcome::Playback(self.handle_playback(request).await),
        }
    }

    fn fingerprint(&self, request: &Request) -> Fingerprint {
        let key = fingerprint(request, &self.policy);
        if key.is_degraded() {
            warn!(
                "Degraded fingerprint {} for {}",
                key.short(),
                canonical_form(request, &self.policy)
            );
        }
        key
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::storage::{KvStore, MemoryStore};
    use crate::Result;

    /// Upstream answering from a fixed script
    pub struct StubUpstream {
        responses: Mutex<Vec<Response>>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl StubUpstream {
        /// Answer each call with the next response; the last one repeats
        pub fn answering(responses: Vec<Response>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                fail: false,
                calls: AtomicUsize::new(0),
            })
        }

        /// Fail every call
        pub fn failing() -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(Vec::new()),
                fail: true,
                calls: AtomicUsize::new(0),
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Upstream for StubUpstream {
        async fn forward(&self, request: &Request) -> Result<Response> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(GenproxyError::UpstreamUnavailable(format!(
                    "connection refused: {}",
                    request.uri
                )));
            }

            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                Ok(responses.remove(0))
            } else {
                Ok(responses[0].clone())
            }
        }
    }

    /// Backend whose every call fails
    pub struct BrokenStore;

    #[async_trait]
    impl KvStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Err(GenproxyError::StorageUnavailable("connection reset".to_string()))
        }

        async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Option<Duration>) -> Result<()> {
            Err(GenproxyError::StorageUnavailable("connection reset".to_string()))
        }

        async fn delete(&self, _key: &str) -> Result<bool> {
            Err(GenproxyError::StorageUnavailable("connection reset".to_string()))
        }
    }

    pub fn engine_with(
        mode: Mode,
        backend: Arc<dyn KvStore>,
        upstream: Arc<dyn Upstream>,
    ) -> Engine {
        let store = RecordingStore::new(backend, "test:", Duration::from_secs(1));
        Engine::new(mode, FingerprintPolicy::default(), store, upstream)
    }

    pub fn memory_engine(mode: Mode, upstream: Arc<dyn Upstream>) -> (Engine, Arc<MemoryStore>) {
        let backend = Arc::new(MemoryStore::new());
        let engine = engine_with(mode, backend.clone(), upstream);
        (engine, backend)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use http::{Method, StatusCode};

    #[tokio::test]
    async fn test_handle_dispatches_on_mode() {
        let upstream = StubUpstream::answering(vec![Response::new(StatusCode::OK, "ok")]);
        let request = Request::new(Method::GET, "http://example.com/".parse().unwrap());

        let (recorder, _) = memory_engine(Mode::Record, upstream.clone());
        assert!(matches!(
            recorder.handle(&request).await,
            Outcome::Record(RecordOutcome::Forwarded { .. })
        ));

        let (player, _) = memory_engine(Mode::Playback, upstream.clone());
        assert!(matches!(
            player.handle(&request).await,
            Outcome::Playback(PlaybackOutcome::NotFound(_))
        ));

        // Only the recorder touched the upstream
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test]
    async fn test_recorded_then_played_back() {
        // RECORD GET /a?b=1&c=2, then PLAYBACK the same request with the
        // query reordered
        let upstream = StubUpstream::answering(vec![Response::new(StatusCode::OK, "ok")]);
        let backend = Arc::new(crate::storage::MemoryStore::new());

        let recorder = engine_with(Mode::Record, backend.clone(), upstream.clone());
        let recorded = Request::new(Method::GET, "http://example.com/a?b=1&c=2".parse().unwrap());
        recorder.handle(&recorded).await;

        let player = engine_with(Mode::Playback, backend.clone(), StubUpstream::failing());
        let replayed = Request::new(Method::GET, "http://example.com/a?c=2&b=1".parse().unwrap());

        match player.handle(&replayed).await {
            Outcome::Playback(PlaybackOutcome::Hit(response)) => {
                assert_eq!(response.status, StatusCode::OK);
                assert_eq!(response.body, "ok");
            }
            other => panic!("expected a hit, got {other:?}"),
        }
        assert_eq!(upstream.calls(), 1);
    }
}
