//! Span Streamer Library
//!
//! This library provides a streaming span exporter for agent-to-collector
//! telemetry shipping:
//!
//! - **config**: validated configuration snapshot for the streaming service
//! - **backoff**: delay table and attempt counters for connect retries
//! - **error**: closed failure classification deciding the retry policy
//! - **wire**: record/ack frames and the span-ingest client binding
//! - **transport**: channel and stream mechanics on the collector connection
//! - **queue**: shared outbound queue drained by the consumer loops
//! - **health**: fire-and-forget health signals for the embedding agent
//! - **service**: the orchestrator and its consumer loops
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use span_streamer::config::StreamingConfig;
//! use span_streamer::health::HealthCounters;
//! use span_streamer::queue::SpanQueue;
//! use span_streamer::service::StreamingService;
//! use span_streamer::transport::GrpcChannelManager;
//! use span_streamer::wire::SpanRecord;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = StreamingConfig {
//!         endpoint_host: "collector.example.com".to_string(),
//!         license_key: "license".to_string(),
//!         run_token: "run-1".to_string(),
//!         ..StreamingConfig::default()
//!     };
//!
//!     let health = Arc::new(HealthCounters::new());
//!     let manager = GrpcChannelManager::new(&config, health.clone());
//!     let service = StreamingService::new(manager, health, config);
//!
//!     let queue: SpanQueue<SpanRecord> = SpanQueue::bounded(10_000);
//!     queue
//!         .enqueue(SpanRecord::new("span 1", vec![0x0a]))
//!         .await
//!         .ok();
//!
//!     service.start_consuming(queue);
//! }
//! ```

// Module declarations
pub mod backoff;
pub mod config;
pub mod error;
pub mod health;
pub mod queue;
pub mod service;
pub mod transport;
pub mod wire;

// Re-export commonly used types at crate root for convenience
pub use backoff::{BackoffState, CONNECT_BACKOFF_MS, RETRY_DELAY_MS};
pub use config::StreamingConfig;
pub use error::{FailureClass, TransportError};
pub use health::{HealthCounters, HealthReporter, HealthSnapshot, NoopHealthReporter};
pub use queue::{QueueError, QueueStats, SpanQueue, StreamItem};
pub use service::{ServiceState, StreamingService};
pub use transport::{ChannelManager, GrpcChannelManager, SendOutcome, SpanStream};
pub use wire::{RecordAck, SpanIngestClient, SpanRecord};
