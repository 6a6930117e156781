//! Channel and stream mechanics for the collector connection.
//!
//! The channel manager owns every raw tonic primitive: the channel itself,
//! the per-consumer duplex streams, the bounded send path, and teardown.
//! Retry policy lives entirely with the callers; this layer only reports
//! classified failures. The live channel is published with an atomic swap,
//! so consumers never observe a half-torn-down channel.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Status, Streaming};
use tracing::{debug, warn};

use crate::config::StreamingConfig;
use crate::error::{TransportError, code_label};
use crate::health::HealthReporter;
use crate::queue::StreamItem;
use crate::wire::{RecordAck, SpanIngestClient, SpanRecord};

/// Buffered records per stream; one keeps the hand-off to the wire tight so
/// the send timeout reflects actual stream progress.
const STREAM_SEND_BUFFER: usize = 1;

/// Outcome of a single bounded-wait send attempt.
///
/// Every non-success variant hands the record back so the caller can requeue
/// it; retry policy is decided by matching on this value.
#[derive(Debug)]
pub enum SendOutcome<T> {
    /// The record was handed to the stream within the timeout.
    Sent,
    /// The timeout elapsed before the stream accepted the record.
    TimedOut(T),
    /// Cancellation fired while waiting on the stream.
    Cancelled(T),
    /// The stream or channel failed with a classified error.
    Failed(T, TransportError),
}

/// Channel and stream operations used by the streaming service.
///
/// The production implementation is [`GrpcChannelManager`]; tests drive the
/// service with a scripted fake.
#[async_trait]
pub trait ChannelManager: Send + Sync + 'static {
    /// Record type carried by this manager's streams.
    type Item: StreamItem;
    /// One duplex stream, owned by exactly one consumer.
    type Stream: Send + 'static;

    /// Tear down any prior channel, then open and validate a new one.
    ///
    /// Returns `Ok(true)` when the channel is ready, `Ok(false)` when the
    /// connect timed out or was cancelled, and a classified error otherwise.
    /// On any failure the channel is left fully torn down.
    async fn create_channel(
        &self,
        headers: &MetadataMap,
        token: &CancellationToken,
    ) -> Result<bool, TransportError>;

    /// Open one duplex stream bound to the current channel.
    ///
    /// Fails with [`TransportError::NoChannel`] when no channel is published.
    async fn create_stream(
        &self,
        headers: &MetadataMap,
        token: &CancellationToken,
    ) -> Result<Self::Stream, TransportError>;

    /// Bounded-wait single-record write.
    async fn try_send(
        &self,
        stream: &mut Self::Stream,
        item: Self::Item,
        timeout: Duration,
        token: &CancellationToken,
    ) -> SendOutcome<Self::Item>;

    /// Close a stream its consumer is abandoning.
    fn close_stream(&self, stream: Self::Stream);

    /// Tear down the channel. Idempotent and best-effort.
    fn shutdown(&self);

    /// True while a channel is published.
    fn is_connected(&self) -> bool;
}

/// Build the call metadata sent on every RPC.
pub fn build_headers(config: &StreamingConfig) -> MetadataMap {
    let mut headers = MetadataMap::new();

    if !config.run_token.is_empty() {
        insert_header(&mut headers, "agent_run_token", &config.run_token);
    }
    if !config.license_key.is_empty() {
        insert_header(&mut headers, "license_key", &config.license_key);
    }

    #[cfg(feature = "test-faults")]
    {
        if let Some(flaky) = config.test_flaky {
            insert_header(&mut headers, "flaky", &flaky.to_string());
        }
        if let Some(delay) = config.test_delay_ms {
            insert_header(&mut headers, "delay", &delay.to_string());
        }
    }

    headers
}

fn insert_header(headers: &mut MetadataMap, name: &'static str, value: &str) {
    match MetadataValue::try_from(value) {
        Ok(value) => {
            let _ = headers.insert(name, value);
        }
        Err(_) => warn!(header = name, "metadata value is not valid ascii, header skipped"),
    }
}

/// One duplex stream bound to the current channel.
///
/// The send half is a bounded hand-off into the gRPC request stream; acks
/// are drained by a background reader which parks the terminal status so a
/// failed send can be classified.
pub struct SpanStream {
    id: u64,
    tx: mpsc::Sender<SpanRecord>,
    terminal: Arc<Mutex<Option<Status>>>,
    reader: tokio::task::JoinHandle<()>,
}

impl Drop for SpanStream {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl SpanStream {
    fn terminal_status(&self) -> Option<Status> {
        self.terminal.lock().ok().and_then(|slot| slot.clone())
    }
}

/// Channel manager speaking gRPC to the collector endpoint.
pub struct GrpcChannelManager {
    endpoint_host: String,
    endpoint_port: u32,
    connect_timeout: Duration,
    channel: ArcSwapOption<Channel>,
    connected: AtomicBool,
    stream_seq: AtomicU64,
    health: Arc<dyn HealthReporter>,
}

impl GrpcChannelManager {
    /// Create a manager for the configured endpoint. No connection is opened
    /// until [`ChannelManager::create_channel`] is called.
    pub fn new(config: &StreamingConfig, health: Arc<dyn HealthReporter>) -> Self {
        Self {
            endpoint_host: config.endpoint_host.clone(),
            endpoint_port: config.endpoint_port,
            connect_timeout: config.connect_timeout(),
            channel: ArcSwapOption::from(None),
            connected: AtomicBool::new(false),
            stream_seq: AtomicU64::new(0),
            health,
        }
    }

    fn endpoint_uri(&self) -> String {
        format!("http://{}:{}", self.endpoint_host, self.endpoint_port)
    }

    fn teardown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if self.channel.swap(None).is_some() {
            debug!(
                host = %self.endpoint_host,
                port = self.endpoint_port,
                "collector channel torn down"
            );
        }
    }

    /// Validate a fresh channel by opening a throwaway duplex stream and
    /// closing it immediately. A clean or rebalanced close both mean the
    /// channel is usable.
    async fn validate_channel(
        &self,
        channel: &Channel,
        headers: &MetadataMap,
    ) -> Result<bool, TransportError> {
        let mut client = SpanIngestClient::new(channel.clone());

        let (tx, rx) = mpsc::channel::<SpanRecord>(STREAM_SEND_BUFFER);
        drop(tx);
        let mut request = Request::new(ReceiverStream::new(rx));
        *request.metadata_mut() = headers.clone();

        match tokio::time::timeout(self.connect_timeout, client.record_spans(request)).await {
            Err(_) => Ok(false),
            Ok(Ok(_response)) => Ok(true),
            Ok(Err(status)) if status.code() == Code::Ok => {
                // The validation stream was rebalanced; the channel is fine.
                debug!(
                    host = %self.endpoint_host,
                    port = self.endpoint_port,
                    "validation stream rebalanced by collector"
                );
                Ok(true)
            }
            Ok(Err(status)) => Err(TransportError::Grpc(status)),
        }
    }
}

#[async_trait]
impl ChannelManager for GrpcChannelManager {
    type Item = SpanRecord;
    type Stream = SpanStream;

    async fn create_channel(
        &self,
        headers: &MetadataMap,
        token: &CancellationToken,
    ) -> Result<bool, TransportError> {
        self.teardown();

        let endpoint = Endpoint::from_shared(self.endpoint_uri())
            .map_err(TransportError::Connect)?
            .connect_timeout(self.connect_timeout);

        let channel = tokio::select! {
            biased;

            _ = token.cancelled() => return Ok(false),
            connected = tokio::time::timeout(self.connect_timeout, endpoint.connect()) => {
                match connected {
                    Err(_) => return Ok(false),
                    Ok(Err(err)) => return Err(TransportError::Connect(err)),
                    Ok(Ok(channel)) => channel,
                }
            }
        };

        if !self.validate_channel(&channel, headers).await? {
            return Ok(false);
        }

        self.channel.store(Some(Arc::new(channel)));
        self.connected.store(true, Ordering::SeqCst);
        debug!(
            host = %self.endpoint_host,
            port = self.endpoint_port,
            "collector channel connected"
        );
        Ok(true)
    }

    async fn create_stream(
        &self,
        headers: &MetadataMap,
        token: &CancellationToken,
    ) -> Result<SpanStream, TransportError> {
        let channel = self.channel.load_full().ok_or(TransportError::NoChannel)?;
        let mut client = SpanIngestClient::new((*channel).clone());

        let (tx, rx) = mpsc::channel::<SpanRecord>(STREAM_SEND_BUFFER);
        let mut request = Request::new(ReceiverStream::new(rx));
        *request.metadata_mut() = headers.clone();

        let response = match tokio::time::timeout(self.connect_timeout, client.record_spans(request))
            .await
        {
            Err(_) => return Err(TransportError::ConnectTimedOut(self.connect_timeout)),
            Ok(Err(status)) => return Err(TransportError::Grpc(status)),
            Ok(Ok(response)) => response,
        };

        let id = self.stream_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let terminal = Arc::new(Mutex::new(None));
        let reader = tokio::spawn(read_acks(
            id,
            response.into_inner(),
            Arc::clone(&terminal),
            Arc::clone(&self.health),
            token.clone(),
        ));

        debug!(stream_id = id, "request stream connected");
        Ok(SpanStream {
            id,
            tx,
            terminal,
            reader,
        })
    }

    async fn try_send(
        &self,
        stream: &mut SpanStream,
        item: SpanRecord,
        timeout: Duration,
        token: &CancellationToken,
    ) -> SendOutcome<SpanRecord> {
        let reserved = tokio::select! {
            biased;

            _ = token.cancelled() => return SendOutcome::Cancelled(item),
            reserved = tokio::time::timeout(timeout, stream.tx.reserve()) => reserved,
        };

        match reserved {
            Err(_elapsed) => SendOutcome::TimedOut(item),
            Ok(Err(_closed)) => match stream.terminal_status() {
                Some(status) => SendOutcome::Failed(item, TransportError::Grpc(status)),
                None => SendOutcome::Failed(item, TransportError::StreamClosed),
            },
            Ok(Ok(permit)) => {
                permit.send(item);
                SendOutcome::Sent
            }
        }
    }

    fn close_stream(&self, stream: SpanStream) {
        debug!(stream_id = stream.id, "request stream closed");
        drop(stream);
    }

    fn shutdown(&self) {
        self.teardown();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Drain acknowledgement frames until the stream or the service ends.
///
/// Acks never gate sends; they feed log records and health reporting. The
/// terminal status is parked so the owning consumer's next failed send can
/// be classified.
async fn read_acks(
    stream_id: u64,
    mut acks: Streaming<RecordAck>,
    terminal: Arc<Mutex<Option<Status>>>,
    health: Arc<dyn HealthReporter>,
    token: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = token.cancelled() => break,
            message = acks.message() => message,
        };

        match message {
            Ok(Some(ack)) => {
                debug!(
                    stream_id,
                    messages_seen = ack.messages_seen,
                    "ack received from collector"
                );
            }
            Ok(None) => {
                // Clean close: the collector finished the stream, which is
                // the rebalance signal.
                if let Ok(mut slot) = terminal.lock() {
                    *slot = Some(Status::new(Code::Ok, "stream completed by collector"));
                }
                debug!(stream_id, "ack stream completed by collector");
                break;
            }
            Err(status) => {
                health.response_error();
                health.grpc_error(code_label(status.code()));
                debug!(
                    stream_id,
                    status = code_label(status.code()),
                    message = status.message(),
                    "ack stream ended with error"
                );
                if let Ok(mut slot) = terminal.lock() {
                    *slot = Some(status);
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureClass;
    use crate::health::NoopHealthReporter;

    fn test_config() -> StreamingConfig {
        StreamingConfig {
            endpoint_host: "collector.example.com".to_string(),
            license_key: "key-123".to_string(),
            run_token: "token-456".to_string(),
            ..StreamingConfig::default()
        }
    }

    fn test_manager() -> GrpcChannelManager {
        GrpcChannelManager::new(&test_config(), Arc::new(NoopHealthReporter))
    }

    fn idle_stream(capacity: usize) -> (SpanStream, mpsc::Receiver<SpanRecord>) {
        let (tx, rx) = mpsc::channel(capacity);
        let stream = SpanStream {
            id: 1,
            tx,
            terminal: Arc::new(Mutex::new(None)),
            reader: tokio::spawn(async {}),
        };
        (stream, rx)
    }

    #[test]
    fn test_build_headers_includes_auth_metadata() {
        let headers = build_headers(&test_config());
        assert_eq!(
            headers.get("agent_run_token").map(|v| v.to_str().unwrap()),
            Some("token-456")
        );
        assert_eq!(
            headers.get("license_key").map(|v| v.to_str().unwrap()),
            Some("key-123")
        );
    }

    #[test]
    fn test_build_headers_skips_empty_values() {
        let headers = build_headers(&StreamingConfig::default());
        assert!(headers.get("agent_run_token").is_none());
        assert!(headers.get("license_key").is_none());
    }

    #[cfg(feature = "test-faults")]
    #[test]
    fn test_build_headers_includes_fault_knobs_when_set() {
        let config = StreamingConfig {
            test_flaky: Some(12.5),
            test_delay_ms: Some(250),
            ..test_config()
        };
        let headers = build_headers(&config);
        assert_eq!(
            headers.get("flaky").map(|v| v.to_str().unwrap()),
            Some("12.5")
        );
        assert_eq!(
            headers.get("delay").map(|v| v.to_str().unwrap()),
            Some("250")
        );
    }

    #[tokio::test]
    async fn test_create_stream_without_channel_is_classified() {
        let manager = test_manager();
        let token = CancellationToken::new();
        let err = match manager.create_stream(&MetadataMap::new(), &token).await {
            Err(err) => err,
            Ok(_) => panic!("stream creation must fail while no channel is published"),
        };
        assert!(matches!(err, TransportError::NoChannel));
        assert_eq!(err.class(), FailureClass::Transient);
    }

    #[tokio::test]
    async fn test_try_send_hands_record_to_stream() {
        let manager = test_manager();
        let token = CancellationToken::new();
        let (mut stream, mut rx) = idle_stream(1);

        let outcome = manager
            .try_send(
                &mut stream,
                SpanRecord::new("span", vec![1]),
                Duration::from_millis(100),
                &token,
            )
            .await;
        assert!(matches!(outcome, SendOutcome::Sent));
        assert_eq!(rx.recv().await.unwrap().display_name, "span");
    }

    #[tokio::test]
    async fn test_try_send_times_out_and_returns_item() {
        let manager = test_manager();
        let token = CancellationToken::new();
        let (mut stream, _rx) = idle_stream(1);

        // Occupy the single buffer slot so the next send has to wait.
        let first = manager
            .try_send(
                &mut stream,
                SpanRecord::new("first", Vec::new()),
                Duration::from_millis(100),
                &token,
            )
            .await;
        assert!(matches!(first, SendOutcome::Sent));

        let second = manager
            .try_send(
                &mut stream,
                SpanRecord::new("second", Vec::new()),
                Duration::from_millis(50),
                &token,
            )
            .await;
        match second {
            SendOutcome::TimedOut(item) => assert_eq!(item.display_name, "second"),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_try_send_on_closed_stream_without_status() {
        let manager = test_manager();
        let token = CancellationToken::new();
        let (mut stream, rx) = idle_stream(1);
        drop(rx);

        let outcome = manager
            .try_send(
                &mut stream,
                SpanRecord::new("span", Vec::new()),
                Duration::from_millis(100),
                &token,
            )
            .await;
        match outcome {
            SendOutcome::Failed(item, err) => {
                assert_eq!(item.display_name, "span");
                assert!(matches!(err, TransportError::StreamClosed));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_try_send_on_closed_stream_uses_parked_status() {
        let manager = test_manager();
        let token = CancellationToken::new();
        let (mut stream, rx) = idle_stream(1);
        drop(rx);
        if let Ok(mut slot) = stream.terminal.lock() {
            *slot = Some(Status::new(Code::Ok, "rebalanced"));
        }

        let outcome = manager
            .try_send(
                &mut stream,
                SpanRecord::new("span", Vec::new()),
                Duration::from_millis(100),
                &token,
            )
            .await;
        match outcome {
            SendOutcome::Failed(_, err) => assert_eq!(err.class(), FailureClass::Rebalance),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_try_send_cancelled_returns_item() {
        let manager = test_manager();
        let token = CancellationToken::new();
        token.cancel();
        let (mut stream, _rx) = idle_stream(1);

        let outcome = manager
            .try_send(
                &mut stream,
                SpanRecord::new("span", Vec::new()),
                Duration::from_millis(100),
                &token,
            )
            .await;
        assert!(matches!(outcome, SendOutcome::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let manager = test_manager();
        assert!(!manager.is_connected());
        manager.shutdown();
        manager.shutdown();
        assert!(!manager.is_connected());
    }
}
