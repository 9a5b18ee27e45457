// src/context.rs

use crate::dialect::ApiDialect;
use crate::keys::record::{BoundKey, Service};
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

/// Request-scoped id minted once at the HTTP edge and threaded through the
/// pipeline: the tracing span, every preprocess/dispatch log record, and the
/// `request_id` of any error response all carry the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-request mutable record, owned by the pipeline for the lifetime of one
/// inbound HTTP request. The bound key is present from queue admission
/// onward.
#[derive(Debug)]
pub struct RequestContext {
    pub correlation_id: CorrelationId,
    pub inbound_api: ApiDialect,
    pub outbound_api: ApiDialect,
    pub service: Service,
    /// Model id as it will be sent upstream.
    pub model: String,
    pub key: Option<BoundKey>,
    pub prompt_tokens: usize,
    pub output_tokens: usize,
    pub is_streaming: bool,
    pub received_at: Instant,
    pub dequeued_at: Option<Instant>,
}

impl RequestContext {
    pub fn new(
        correlation_id: CorrelationId,
        inbound_api: ApiDialect,
        outbound_api: ApiDialect,
        service: Service,
        model: String,
        is_streaming: bool,
    ) -> Self {
        Self {
            correlation_id,
            inbound_api,
            outbound_api,
            service,
            model,
            key: None,
            prompt_tokens: 0,
            output_tokens: 0,
            is_streaming,
            received_at: Instant::now(),
            dequeued_at: None,
        }
    }

    /// Hash of the bound key, for log records.
    pub fn key_hash(&self) -> &str {
        self.key.as_ref().map_or("unbound", |k| k.hash.as_str())
    }

    pub fn bind(&mut self, key: BoundKey) {
        self.key = Some(key);
        self.dequeued_at = Some(Instant::now());
    }

    /// Queue latency, once dequeued.
    pub fn wait_time(&self) -> Option<std::time::Duration> {
        self.dequeued_at
            .map(|t| t.saturating_duration_since(self.received_at))
    }
}
