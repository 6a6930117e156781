//! Wire types for the collector's span-ingest RPC.
//!
//! The service exposes a single bidirectional stream: span records flow out,
//! acknowledgement frames flow back. Record payloads are opaque to this
//! crate; the caller serializes them before enqueueing. Message structs are
//! derived with prost and the client binding is written directly against
//! `tonic::client::Grpc`, so no protobuf compiler is needed at build time.

use tonic::codegen::*;

/// A single span record bound for the collector.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SpanRecord {
    /// Human-readable identifier used in log records.
    #[prost(string, tag = "1")]
    pub display_name: ::prost::alloc::string::String,
    /// Caller-serialized span payload.
    #[prost(bytes = "vec", tag = "2")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
}

impl SpanRecord {
    /// Create a record from a display name and a serialized payload.
    pub fn new(display_name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            display_name: display_name.into(),
            payload,
        }
    }
}

/// Acknowledgement frame sent back by the collector.
///
/// Acks are informational only: they are never correlated with individual
/// records and never gate sends.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RecordAck {
    /// Running count of records the collector has seen on this stream.
    #[prost(uint64, tag = "1")]
    pub messages_seen: u64,
}

/// Client binding for the collector's `SpanIngest` service.
#[derive(Debug, Clone)]
pub struct SpanIngestClient<T> {
    inner: tonic::client::Grpc<T>,
}

impl<T> SpanIngestClient<T>
where
    T: tonic::client::GrpcService<tonic::body::BoxBody>,
    T::Error: Into<StdError>,
    T::ResponseBody: Body<Data = Bytes> + std::marker::Send + 'static,
    <T::ResponseBody as Body>::Error: Into<StdError> + std::marker::Send,
{
    /// Wrap an established transport.
    pub fn new(inner: T) -> Self {
        Self {
            inner: tonic::client::Grpc::new(inner),
        }
    }

    /// Open the bidirectional record stream: span records out, acks back.
    pub async fn record_spans(
        &mut self,
        request: impl tonic::IntoStreamingRequest<Message = SpanRecord>,
    ) -> std::result::Result<tonic::Response<tonic::codec::Streaming<RecordAck>>, tonic::Status>
    {
        self.inner
            .ready()
            .await
            .map_err(|e| tonic::Status::unknown(format!("Service was not ready: {}", e.into())))?;
        let codec = tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static("/spanstream.v1.SpanIngest/RecordSpans");
        let mut req = request.into_streaming_request();
        req.extensions_mut()
            .insert(GrpcMethod::new("spanstream.v1.SpanIngest", "RecordSpans"));
        self.inner.streaming(req, path, codec).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_record_new() {
        let record = SpanRecord::new("span 1f2a", vec![1, 2, 3]);
        assert_eq!(record.display_name, "span 1f2a");
        assert_eq!(record.payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_default_frames_are_empty() {
        let record = SpanRecord::default();
        assert!(record.display_name.is_empty());
        assert!(record.payload.is_empty());

        let ack = RecordAck::default();
        assert_eq!(ack.messages_seen, 0);
    }
}
