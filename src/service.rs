//! Streaming service orchestration: connect supervision and consumer loops.
//!
//! One supervisory task validates configuration, owns the shared
//! cancellation token, drives the channel-connect loop under the backoff
//! table, and spawns the consumer group. Each consumer owns exactly one
//! stream and applies the send/retry/recreate protocol; every failure path
//! resolves into retry-with-backoff, retry-immediately, or fatal shutdown.
//! No consumer ever terminates the host process.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;
use tracing::{debug, error, info, warn};

use crate::backoff::{BackoffState, RETRY_DELAY_MS};
use crate::config::StreamingConfig;
use crate::error::{FailureClass, TransportError};
use crate::health::HealthReporter;
use crate::queue::{SpanQueue, StreamItem};
use crate::transport::{ChannelManager, SendOutcome, build_headers};

/// Poll interval for the best-effort drain in [`StreamingService::wait`].
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle of the streaming service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Not started, or disabled by invalid configuration.
    Disabled,
    /// Checking the configuration snapshot.
    Validating,
    /// Attempting to establish the collector channel.
    Connecting,
    /// Consumers are draining the outbound queue.
    Streaming,
    /// A caller is waiting for the queue to empty.
    Draining,
    /// Shut down; no further connection attempts are made.
    Shutdown,
}

/// Streaming span exporter.
///
/// Owns the collector channel (through its [`ChannelManager`]) and the
/// consumer group draining the shared outbound queue.
pub struct StreamingService<M: ChannelManager> {
    inner: Arc<ServiceInner<M>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

struct ServiceInner<M: ChannelManager> {
    manager: M,
    health: Arc<dyn HealthReporter>,
    config: StreamingConfig,
    enabled: AtomicBool,
    state: Mutex<ServiceState>,
    token: Mutex<CancellationToken>,
    headers: Mutex<Option<MetadataMap>>,
    queue: Mutex<Option<SpanQueue<M::Item>>>,
    in_flight: AtomicUsize,
    consumer_seq: AtomicUsize,
}

impl<M: ChannelManager> StreamingService<M> {
    /// Create a service around a channel manager and a health reporter.
    ///
    /// Nothing connects until [`StreamingService::start_consuming`] is
    /// called; the internal token starts cancelled so anything that depends
    /// on it stays parked until then.
    pub fn new(manager: M, health: Arc<dyn HealthReporter>, config: StreamingConfig) -> Self {
        let token = CancellationToken::new();
        token.cancel();

        Self {
            inner: Arc::new(ServiceInner {
                manager,
                health,
                config,
                enabled: AtomicBool::new(false),
                state: Mutex::new(ServiceState::Disabled),
                token: Mutex::new(token),
                headers: Mutex::new(None),
                queue: Mutex::new(None),
                in_flight: AtomicUsize::new(0),
                consumer_seq: AtomicUsize::new(0),
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        self.inner.state()
    }

    /// True when the last validation pass accepted the configuration.
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// True while the service is enabled, connected, and streaming.
    pub fn is_available(&self) -> bool {
        self.is_enabled()
            && self.inner.manager.is_connected()
            && matches!(
                self.state(),
                ServiceState::Streaming | ServiceState::Draining
            )
    }

    /// Validate the configuration snapshot.
    ///
    /// Every invalid field is logged individually; any single invalid field
    /// disables the service without raising an error.
    pub fn read_and_validate_configuration(&self) -> bool {
        let valid = self.inner.config.validate();
        self.inner.enabled.store(valid, Ordering::SeqCst);
        if !valid {
            self.inner.set_state(ServiceState::Disabled);
        }
        valid
    }

    /// Start draining `queue` on a background supervisor task.
    ///
    /// Designed to be called by the upstream aggregator. Any previous run is
    /// cancelled; the supervisor tears down the old channel, re-validates
    /// configuration, connects under the backoff policy, and spawns the
    /// consumer group.
    pub fn start_consuming(&self, queue: SpanQueue<M::Item>) {
        if let Ok(token) = self.inner.token.lock() {
            token.cancel();
        }
        if let Ok(mut slot) = self.inner.queue.lock() {
            *slot = Some(queue.clone());
        }

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run(queue).await });
        if let Ok(mut supervisor) = self.supervisor.lock() {
            *supervisor = Some(handle);
        }
    }

    /// Wait for the supervisor task, and with it every consumer, to finish.
    ///
    /// Returns immediately when the service was never started. Useful for a
    /// deterministic teardown after [`StreamingService::shutdown`].
    pub async fn join(&self) {
        let handle = self
            .supervisor
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "supervisor task ended abnormally");
                }
            }
        }
    }

    /// Best-effort drain: poll until the queue is empty and no consumer
    /// holds an in-flight record, or until `timeout` elapses.
    pub async fn wait(&self, timeout: Duration) -> bool {
        debug!(
            timeout_ms = timeout.as_millis() as u64,
            "waiting for queued records to finish streaming"
        );
        let was_streaming = self
            .inner
            .transition(ServiceState::Streaming, ServiceState::Draining);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let queued = self
                .inner
                .queue
                .lock()
                .ok()
                .and_then(|slot| slot.as_ref().map(SpanQueue::len))
                .unwrap_or(0);
            let in_flight = self.inner.in_flight.load(Ordering::SeqCst);

            if queued == 0 && in_flight == 0 {
                debug!("finished streaming queued records");
                if was_streaming {
                    let _ = self
                        .inner
                        .transition(ServiceState::Draining, ServiceState::Streaming);
                }
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                debug!(
                    queued,
                    in_flight, "could not finish streaming queued records before the timeout"
                );
                if was_streaming {
                    let _ = self
                        .inner
                        .transition(ServiceState::Draining, ServiceState::Streaming);
                }
                return false;
            }

            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Shut the service down.
    ///
    /// Cancels the shared token, clears cached call metadata, and tears down
    /// the channel. Safe to call repeatedly or before the service was ever
    /// started.
    pub fn shutdown(&self) {
        self.inner.shutdown_now();
    }
}

impl<M: ChannelManager> Drop for StreamingService<M> {
    fn drop(&mut self) {
        self.inner.shutdown_now();
    }
}

impl<M: ChannelManager> ServiceInner<M> {
    fn state(&self) -> ServiceState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ServiceState::Shutdown)
    }

    fn set_state(&self, next: ServiceState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    fn transition(&self, from: ServiceState, to: ServiceState) -> bool {
        if let Ok(mut state) = self.state.lock() {
            if *state == from {
                *state = to;
                return true;
            }
        }
        false
    }

    fn shutdown_now(&self) {
        debug!("shutdown requested");
        self.set_state(ServiceState::Shutdown);
        if let Ok(token) = self.token.lock() {
            token.cancel();
        }
        if let Ok(mut headers) = self.headers.lock() {
            *headers = None;
        }
        self.manager.shutdown();
    }

    fn log_configuration(&self) {
        info!(
            host = %self.config.endpoint_host,
            port = self.config.endpoint_port,
            consumers = self.config.consumer_count,
            connect_timeout_ms = self.config.connect_timeout_ms,
            send_timeout_ms = self.config.send_timeout_ms,
            "streaming service configuration"
        );
        #[cfg(feature = "test-faults")]
        debug!(
            flaky = ?self.config.test_flaky,
            delay_ms = ?self.config.test_delay_ms,
            "test fault-injection configuration"
        );
    }

    /// Supervisor body: validate, connect, then run the consumer group to
    /// completion.
    async fn run(self: Arc<Self>, queue: SpanQueue<M::Item>) {
        self.manager.shutdown();

        self.set_state(ServiceState::Validating);
        let valid = self.config.validate();
        self.enabled.store(valid, Ordering::SeqCst);
        if !valid {
            self.set_state(ServiceState::Disabled);
            return;
        }
        self.log_configuration();

        let headers = build_headers(&self.config);
        if let Ok(mut slot) = self.headers.lock() {
            *slot = Some(headers.clone());
        }

        let token = CancellationToken::new();
        if let Ok(mut slot) = self.token.lock() {
            *slot = token.clone();
        }

        if !self.connect_channel(&headers, &token).await {
            return;
        }

        self.set_state(ServiceState::Streaming);
        info!(
            consumers = self.config.consumer_count,
            "streaming records to collector"
        );

        let mut consumers = JoinSet::new();
        for _ in 0..self.config.consumer_count {
            let inner = Arc::clone(&self);
            let queue = queue.clone();
            let headers = headers.clone();
            let token = token.clone();
            consumers.spawn(async move { inner.run_consumer(queue, headers, token).await });
        }

        while let Some(joined) = consumers.join_next().await {
            if let Err(err) = joined {
                if !err.is_cancelled() {
                    warn!(error = %err, "consumer task ended abnormally");
                }
            }
        }
        debug!("all consumers stopped");
    }

    /// Channel-connect loop under the shared backoff sequence.
    ///
    /// Returns true once the channel is ready. A `Fatal` classification
    /// aborts permanently; a `Rebalance` counts as success.
    async fn connect_channel(&self, headers: &MetadataMap, token: &CancellationToken) -> bool {
        self.set_state(ServiceState::Connecting);
        let mut backoff = BackoffState::new();
        info!(
            host = %self.config.endpoint_host,
            port = self.config.endpoint_port,
            "creating channel to collector"
        );

        loop {
            if token.is_cancelled() {
                return false;
            }

            match self.manager.create_channel(headers, token).await {
                Ok(true) => {
                    info!(attempt = backoff.attempt(), "collector channel connected");
                    return true;
                }
                Ok(false) => {
                    if token.is_cancelled() {
                        return false;
                    }
                    debug!(
                        attempt = backoff.attempt(),
                        timeout_ms = self.config.connect_timeout_ms,
                        "timeout creating collector channel"
                    );
                }
                Err(err) => {
                    self.health.response_error();
                    if let Some(label) = err.status_label() {
                        self.health.grpc_error(label);
                    }
                    match err.class() {
                        FailureClass::Fatal => {
                            error!(
                                host = %self.config.endpoint_host,
                                port = self.config.endpoint_port,
                                "collector endpoint is not available and no reconnection attempts will be made"
                            );
                            self.shutdown_now();
                            return false;
                        }
                        FailureClass::Rebalance => {
                            debug!("channel considered ready after rebalance signal");
                            return true;
                        }
                        FailureClass::Transient | FailureClass::Unknown => {
                            debug!(
                                error = %err,
                                attempt = backoff.attempt(),
                                "error creating collector channel"
                            );
                        }
                    }
                }
            }

            let delay = backoff.next_delay();
            debug!(
                delay_ms = delay.as_millis() as u64,
                "backing off before reconnecting to the collector"
            );
            if !sleep_unless_cancelled(delay, token).await {
                return false;
            }
        }
    }

    /// One consumer: obtain a stream, drain the queue onto it, recreate the
    /// stream on failure. Loops until the shared token is cancelled.
    async fn run_consumer(
        self: Arc<Self>,
        queue: SpanQueue<M::Item>,
        headers: MetadataMap,
        token: CancellationToken,
    ) {
        let consumer_id = self.consumer_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let send_timeout = self.config.send_timeout();
        let mut backoff = BackoffState::new();
        debug!(consumer_id, "consumer started");

        'streams: while !token.is_cancelled() {
            let mut stream = match self
                .connect_stream(consumer_id, &mut backoff, &headers, &token)
                .await
            {
                Some(stream) => stream,
                None => break 'streams,
            };

            loop {
                let Some(item) = queue.take(&token).await else {
                    self.manager.close_stream(stream);
                    break 'streams;
                };

                let _ = self.in_flight.fetch_add(1, Ordering::SeqCst);
                let outcome = self
                    .manager
                    .try_send(&mut stream, item, send_timeout, &token)
                    .await;
                let _ = self.in_flight.fetch_sub(1, Ordering::SeqCst);

                match outcome {
                    SendOutcome::Sent => {
                        self.health.successful_send(1);
                    }
                    SendOutcome::Cancelled(item) => {
                        self.requeue_or_drop(&queue, item);
                        self.manager.close_stream(stream);
                        break 'streams;
                    }
                    SendOutcome::TimedOut(item) => {
                        self.health.send_timeout();
                        debug!(
                            consumer_id,
                            item = item.display_name(),
                            timeout_ms = self.config.send_timeout_ms,
                            "send timed out, recreating request stream"
                        );
                        self.requeue_or_drop(&queue, item);
                        self.manager.close_stream(stream);
                        if !sleep_unless_cancelled(Duration::from_millis(RETRY_DELAY_MS), &token)
                            .await
                        {
                            break 'streams;
                        }
                        continue 'streams;
                    }
                    SendOutcome::Failed(item, err) => {
                        self.health.response_error();
                        if let Some(label) = err.status_label() {
                            self.health.grpc_error(label);
                        }
                        debug!(
                            consumer_id,
                            item = item.display_name(),
                            error = %err,
                            "send failed"
                        );
                        self.requeue_or_drop(&queue, item);
                        self.manager.close_stream(stream);

                        match err.class() {
                            FailureClass::Fatal => {
                                error!(
                                    consumer_id,
                                    "collector endpoint is no longer available, shutting down streaming service"
                                );
                                self.shutdown_now();
                                break 'streams;
                            }
                            FailureClass::Rebalance => {
                                debug!(
                                    consumer_id,
                                    "stream closed for rebalance, reconnecting immediately"
                                );
                                backoff.reset();
                                continue 'streams;
                            }
                            FailureClass::Transient | FailureClass::Unknown => {
                                if !sleep_unless_cancelled(
                                    Duration::from_millis(RETRY_DELAY_MS),
                                    &token,
                                )
                                .await
                                {
                                    break 'streams;
                                }
                                continue 'streams;
                            }
                        }
                    }
                }
            }
        }

        debug!(consumer_id, "consumer stopped");
    }

    /// Stream creation under this consumer's own backoff counter.
    ///
    /// Returns `None` when cancelled or after a fatal classification (which
    /// shuts down the whole service, not just this consumer).
    async fn connect_stream(
        &self,
        consumer_id: usize,
        backoff: &mut BackoffState,
        headers: &MetadataMap,
        token: &CancellationToken,
    ) -> Option<M::Stream> {
        loop {
            if token.is_cancelled() {
                return None;
            }

            match self.manager.create_stream(headers, token).await {
                Ok(stream) => {
                    debug!(
                        consumer_id,
                        attempt = backoff.attempt(),
                        "request stream connected"
                    );
                    backoff.reset();
                    return Some(stream);
                }
                Err(err) => {
                    if !matches!(err, TransportError::ConnectTimedOut(_)) {
                        self.health.response_error();
                        if let Some(label) = err.status_label() {
                            self.health.grpc_error(label);
                        }
                    }

                    match err.class() {
                        FailureClass::Fatal => {
                            error!(
                                consumer_id,
                                "request stream could not be created because the collector endpoint is gone, shutting down streaming service"
                            );
                            self.shutdown_now();
                            return None;
                        }
                        FailureClass::Rebalance => {
                            debug!(
                                consumer_id,
                                "stream rebalanced by collector, reconnecting immediately"
                            );
                            backoff.reset();
                        }
                        FailureClass::Transient | FailureClass::Unknown => {
                            let delay = backoff.next_delay();
                            debug!(
                                consumer_id,
                                error = %err,
                                delay_ms = delay.as_millis() as u64,
                                "backing off before recreating request stream"
                            );
                            if !sleep_unless_cancelled(delay, token).await {
                                return None;
                            }
                        }
                    }
                }
            }
        }
    }

    fn requeue_or_drop(&self, queue: &SpanQueue<M::Item>, item: M::Item) {
        if !queue.requeue(item) {
            self.health.items_dropped(1);
        }
    }
}

/// Cancellable sleep; false when cancellation fired first.
async fn sleep_unless_cancelled(delay: Duration, token: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !token.is_cancelled();
    }
    tokio::select! {
        biased;

        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::NoopHealthReporter;
    use crate::wire::SpanRecord;
    use async_trait::async_trait;

    /// Manager that connects instantly and accepts every record.
    struct AlwaysUpManager {
        connected: AtomicBool,
    }

    impl AlwaysUpManager {
        fn new() -> Self {
            Self {
                connected: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ChannelManager for AlwaysUpManager {
        type Item = SpanRecord;
        type Stream = ();

        async fn create_channel(
            &self,
            _headers: &MetadataMap,
            _token: &CancellationToken,
        ) -> Result<bool, TransportError> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(true)
        }

        async fn create_stream(
            &self,
            _headers: &MetadataMap,
            _token: &CancellationToken,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn try_send(
            &self,
            _stream: &mut (),
            _item: SpanRecord,
            _timeout: Duration,
            _token: &CancellationToken,
        ) -> SendOutcome<SpanRecord> {
            SendOutcome::Sent
        }

        fn close_stream(&self, _stream: ()) {}

        fn shutdown(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    fn enabled_config() -> StreamingConfig {
        StreamingConfig {
            endpoint_host: "collector.example.com".to_string(),
            consumer_count: 2,
            ..StreamingConfig::default()
        }
    }

    #[tokio::test]
    async fn test_shutdown_before_start_is_safe() {
        let service = StreamingService::new(
            AlwaysUpManager::new(),
            Arc::new(NoopHealthReporter),
            enabled_config(),
        );

        service.shutdown();
        service.shutdown();
        assert_eq!(service.state(), ServiceState::Shutdown);
        assert!(!service.is_available());
    }

    #[tokio::test]
    async fn test_invalid_configuration_disables_service() {
        let config = StreamingConfig {
            endpoint_port: 0,
            ..enabled_config()
        };
        let service =
            StreamingService::new(AlwaysUpManager::new(), Arc::new(NoopHealthReporter), config);

        assert!(!service.read_and_validate_configuration());
        assert!(!service.is_enabled());
        assert_eq!(service.state(), ServiceState::Disabled);
    }

    #[tokio::test]
    async fn test_valid_configuration_enables_service() {
        let service = StreamingService::new(
            AlwaysUpManager::new(),
            Arc::new(NoopHealthReporter),
            enabled_config(),
        );

        assert!(service.read_and_validate_configuration());
        assert!(service.is_enabled());
    }

    #[tokio::test]
    async fn test_wait_without_queue_returns_immediately() {
        let service = StreamingService::new(
            AlwaysUpManager::new(),
            Arc::new(NoopHealthReporter),
            enabled_config(),
        );

        assert!(service.wait(Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn test_sleep_unless_cancelled() {
        let token = CancellationToken::new();
        assert!(sleep_unless_cancelled(Duration::from_millis(1), &token).await);
        assert!(sleep_unless_cancelled(Duration::ZERO, &token).await);

        token.cancel();
        assert!(!sleep_unless_cancelled(Duration::from_secs(60), &token).await);
        assert!(!sleep_unless_cancelled(Duration::ZERO, &token).await);
    }
}
