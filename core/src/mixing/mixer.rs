// Mixer — decouples inbound request timing from outbound backend timing
//
// Dispatch loops drain bounded batches from the mixing queue. Every drained
// request gets its own task that sleeps an independently sampled delay and
// only then calls the backend, so completion order inside a batch is
// unrelated to arrival order. Results travel back through the pending table,
// keyed by correlation key, to the slot of the caller that submitted them.

use super::pending::{PendingRequest, PendingTable};
use super::queue::MixingQueue;
use super::slot::{ResultSlot, SlotError, SlotOutcome};
use super::timing::TimingJitter;
use crate::backend::BackendClient;
use crate::config::{ConfigError, MixerConfig};
use crate::hashing::{CorrelationHasher, CorrelationKey};
use crate::metrics::Metrics;
use crate::{Verification, VerifyError};
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Handle returned to the frontend for one accepted request
#[derive(Debug, Clone)]
pub struct Submission {
    pub key: CorrelationKey,
    pub slot: Arc<ResultSlot>,
}

struct MixerShared {
    config: MixerConfig,
    hasher: CorrelationHasher,
    jitter: TimingJitter,
    pending: PendingTable,
    queue: MixingQueue,
    backend: Arc<dyn BackendClient>,
    metrics: Arc<Metrics>,
    sequence: AtomicU64,
    shutdown: watch::Sender<bool>,
}

/// The request-mixing engine
pub struct Mixer {
    shared: Arc<MixerShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Mixer {
    /// Validate `config` and spawn the dispatch loops.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: MixerConfig, backend: Arc<dyn BackendClient>) -> Result<Self, ConfigError> {
        config.validate()?;

        let jitter =
            TimingJitter::new(config.jitter()).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let hasher = CorrelationHasher::new(
            &config.hash_salt,
            config.cache_max_size,
            config.cache_eviction_block_size,
        )
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if !hasher.has_salt() {
            warn!("hash_salt is empty; correlation keys are derived without a secret");
        }

        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(MixerShared {
            config,
            hasher,
            jitter,
            pending: PendingTable::new(),
            queue: MixingQueue::new(),
            backend,
            metrics: Arc::new(Metrics::new()),
            sequence: AtomicU64::new(0),
            shutdown,
        });

        let workers = (0..shared.config.dispatch_workers)
            .map(|worker| tokio::spawn(dispatch_loop(shared.clone(), worker)))
            .collect();

        info!(
            batch_size = shared.config.batch_size,
            min_delay_ms = shared.config.min_delay_ms,
            max_delay_ms = shared.config.max_delay_ms,
            workers = shared.config.dispatch_workers,
            "mixer started"
        );

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Accept a request for mixing. Never blocks.
    pub fn submit(&self, original_value: &str) -> Result<Submission, VerifyError> {
        if original_value.is_empty() {
            return Err(VerifyError::MalformedRequest(
                "Empty 'idval' parameter".to_string(),
            ));
        }
        if self.shared.queue.is_closed() {
            return Err(VerifyError::Cancelled);
        }

        self.shared.metrics.record_request();

        let sequence = self.shared.sequence.fetch_add(1, Ordering::Relaxed);
        let key = self.shared.hasher.correlation_key(original_value, sequence);
        let slot = Arc::new(ResultSlot::new());

        if let Err(e) = self.shared.pending.insert(key.clone(), slot.clone()) {
            self.shared.metrics.record_collision();
            self.shared.metrics.record_error();
            error!(
                pending = self.shared.pending.len(),
                "correlation key collision; rejecting request"
            );
            return Err(e);
        }

        let request = Arc::new(PendingRequest::new(key.clone(), original_value, slot.clone()));
        if self.shared.queue.push(request).is_err() {
            // Shutdown raced with this submit
            self.shared.pending.remove(&key);
            slot.cancel();
            return Err(VerifyError::Cancelled);
        }

        Ok(Submission { key, slot })
    }

    /// Wait for a submission's outcome using the configured overall timeout
    pub async fn resolve(&self, submission: Submission) -> Result<Verification, VerifyError> {
        let timeout = self.shared.config.overall_wait_timeout();
        self.resolve_within(submission, timeout).await
    }

    /// Wait at most `timeout` for a submission's outcome.
    ///
    /// The pending entry is removed on every path. On the normal path the
    /// dispatch task already removed it and this is a no-op.
    pub async fn resolve_within(
        &self,
        submission: Submission,
        timeout: Duration,
    ) -> Result<Verification, VerifyError> {
        let outcome = submission.slot.wait(timeout).await;
        self.shared.pending.remove(&submission.key);

        match &outcome {
            Ok(_) => self.shared.metrics.record_success(),
            Err(VerifyError::RequestTimeout) => {
                self.shared.metrics.record_timeout();
                warn!(timeout_ms = timeout.as_millis() as u64, "verification request timed out");
            }
            // Counted when the slot was cancelled
            Err(VerifyError::Cancelled) => {}
            Err(_) => self.shared.metrics.record_error(),
        }
        outcome
    }

    /// Submit and wait: the whole round trip for one identifier
    pub async fn verify(&self, original_value: &str) -> Result<Verification, VerifyError> {
        let submission = self.submit(original_value)?;
        self.resolve(submission).await
    }

    /// Stop accepting work, cancel every waiting caller, and join the
    /// dispatch loops
    pub async fn shutdown(&self) {
        let undispatched = self.shared.queue.close();
        self.shared.shutdown.send_replace(true);

        let mut cancelled = 0usize;
        for slot in self.shared.pending.drain() {
            if slot.cancel() {
                cancelled += 1;
                self.shared.metrics.record_cancelled();
            }
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("dispatch loop ended abnormally: {}", e);
            }
        }

        info!(
            cancelled,
            undispatched = undispatched.len(),
            "mixer shut down"
        );
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.queue.is_closed()
    }

    /// Requests accepted but not yet resolved
    pub fn pending_len(&self) -> usize {
        self.shared.pending.len()
    }

    /// Requests accepted but not yet drained by a dispatch loop
    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn cache_len(&self) -> usize {
        self.shared.hasher.cache().len()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.shared.metrics.clone()
    }

    pub fn config(&self) -> &MixerConfig {
        &self.shared.config
    }
}

impl Drop for Mixer {
    fn drop(&mut self) {
        // Lets detached dispatch loops and delayed tasks wind down
        self.shared.queue.close();
        self.shared.shutdown.send_replace(true);
    }
}

async fn dispatch_loop(shared: Arc<MixerShared>, worker: usize) {
    debug!(worker, "dispatch loop started");

    while let Some(batch) = shared.queue.next_batch(shared.config.batch_size).await {
        debug!(worker, batch = batch.len(), "mixing batch drained");
        for request in batch {
            tokio::spawn(shared.clone().dispatch(request));
        }
    }

    debug!(worker, "dispatch loop stopped");
}

impl MixerShared {
    async fn dispatch(self: Arc<Self>, request: Arc<PendingRequest>) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return;
        }

        let delay = self.jitter.compute_jitter();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            // The slot was cancelled by shutdown
            _ = shutdown.changed() => return,
        }

        let outcome = self.call_backend(request.original_value()).await;
        self.complete(request.key(), outcome);
    }

    async fn call_backend(&self, original_value: &str) -> SlotOutcome {
        let call = AssertUnwindSafe(self.backend.verify(original_value)).catch_unwind();

        match tokio::time::timeout(self.config.backend_timeout(), call).await {
            Ok(Ok(result)) => result.map_err(VerifyError::from),
            Ok(Err(_)) => {
                error!("backend client panicked during verification");
                Err(VerifyError::BackendUnavailable(
                    "backend client panicked".to_string(),
                ))
            }
            Err(_) => Err(VerifyError::BackendUnavailable(format!(
                "backend call timed out after {} ms",
                self.config.backend_timeout_ms
            ))),
        }
    }

    fn complete(&self, key: &CorrelationKey, outcome: SlotOutcome) {
        if let Err(e) = &outcome {
            warn!(kind = e.kind(), "backend verification failed");
        }

        let Some(slot) = self.pending.remove(key) else {
            self.metrics.record_late_completion();
            debug!("completion for an evicted request discarded");
            return;
        };

        match slot.fulfill(outcome) {
            Ok(()) => {}
            Err(SlotError::Closed(state)) => {
                self.metrics.record_late_completion();
                debug!(?state, "late completion discarded");
            }
            Err(SlotError::AlreadyFulfilled) => {
                error!("result slot fulfilled twice");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, MockBackendClient};
    use async_trait::async_trait;

    struct EchoBackend;

    #[async_trait]
    impl BackendClient for EchoBackend {
        async fn verify(&self, original_value: &str) -> Result<Verification, BackendError> {
            match original_value {
                "fail" => Err(BackendError::Unavailable("refused".into())),
                "garbled" => Err(BackendError::InvalidResponse("not json".into())),
                "panic" => panic!("backend bug"),
                other => Ok(Verification::new(other.starts_with("ok"))),
            }
        }
    }

    fn fast_config() -> MixerConfig {
        MixerConfig {
            min_delay_ms: 0,
            max_delay_ms: 5,
            batch_size: 4,
            hash_salt: "unit".to_string(),
            backend_timeout_ms: 200,
            overall_wait_timeout_ms: 1000,
            ..MixerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let config = MixerConfig {
            overall_wait_timeout_ms: 10,
            ..fast_config()
        };
        assert!(Mixer::start(config, Arc::new(EchoBackend)).is_err());
    }

    #[tokio::test]
    async fn test_verify_round_trip() {
        let mixer = Mixer::start(fast_config(), Arc::new(EchoBackend)).unwrap();
        assert_eq!(mixer.verify("ok-1").await, Ok(Verification::new(true)));
        assert_eq!(mixer.verify("nope").await, Ok(Verification::new(false)));
        assert_eq!(mixer.pending_len(), 0);

        let snap = mixer.metrics().snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.successes, 2);
        mixer.shutdown().await;
    }

    #[tokio::test]
    async fn test_backend_errors_are_typed() {
        let mixer = Mixer::start(fast_config(), Arc::new(EchoBackend)).unwrap();
        assert!(matches!(
            mixer.verify("fail").await,
            Err(VerifyError::BackendUnavailable(_))
        ));
        assert!(matches!(
            mixer.verify("garbled").await,
            Err(VerifyError::BackendInvalidResponse(_))
        ));
        assert_eq!(mixer.metrics().snapshot().errors, 2);
        mixer.shutdown().await;
    }

    #[tokio::test]
    async fn test_backend_panic_stays_in_its_slot() {
        let mixer = Mixer::start(fast_config(), Arc::new(EchoBackend)).unwrap();
        let bad = mixer.submit("panic").unwrap();
        let good = mixer.submit("ok-2").unwrap();

        assert!(matches!(
            mixer.resolve(bad).await,
            Err(VerifyError::BackendUnavailable(_))
        ));
        assert_eq!(mixer.resolve(good).await, Ok(Verification::new(true)));

        // Loop survives for later requests
        assert_eq!(mixer.verify("ok-3").await, Ok(Verification::new(true)));
        mixer.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_identifier_rejected_before_queueing() {
        let mixer = Mixer::start(fast_config(), Arc::new(EchoBackend)).unwrap();
        assert!(matches!(
            mixer.submit(""),
            Err(VerifyError::MalformedRequest(_))
        ));
        assert_eq!(mixer.pending_len(), 0);
        assert_eq!(mixer.metrics().snapshot().requests, 0);
        mixer.shutdown().await;
    }

    #[tokio::test]
    async fn test_same_identifier_in_flight_twice() {
        let mixer = Mixer::start(fast_config(), Arc::new(EchoBackend)).unwrap();
        let first = mixer.submit("ok-dup").unwrap();
        let second = mixer.submit("ok-dup").unwrap();
        assert_ne!(first.key, second.key);

        assert!(mixer.resolve(first).await.is_ok());
        assert!(mixer.resolve(second).await.is_ok());
        assert_eq!(mixer.cache_len(), 1);
        mixer.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_waiters() {
        let config = MixerConfig {
            min_delay_ms: 5000,
            max_delay_ms: 5000,
            overall_wait_timeout_ms: 20_000,
            ..fast_config()
        };
        let mixer = Mixer::start(config, Arc::new(EchoBackend)).unwrap();
        let submission = mixer.submit("ok-late").unwrap();
        let slot = submission.slot.clone();

        mixer.shutdown().await;

        assert_eq!(slot.wait(Duration::from_millis(10)).await, Err(VerifyError::Cancelled));
        assert_eq!(mixer.pending_len(), 0);
        assert_eq!(mixer.metrics().snapshot().cancelled, 1);
        assert!(matches!(mixer.submit("ok-after"), Err(VerifyError::Cancelled)));
    }

    #[tokio::test]
    async fn test_backend_called_with_original_value() {
        let mut backend = MockBackendClient::new();
        backend
            .expect_verify()
            .withf(|value: &str| value == "user123")
            .times(1)
            .returning(|_| Ok(Verification::new(true)));

        let mixer = Mixer::start(fast_config(), Arc::new(backend)).unwrap();
        assert_eq!(mixer.verify("user123").await, Ok(Verification::new(true)));
        mixer.shutdown().await;
    }
}
