//! Usage tracking via the UsageSink trait.
//!
//! The gateway reports every call through a UsageSink so the CLI can log
//! token totals without the gateway knowing where they go. Tests use
//! `NoopUsageSink`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Status of a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
        }
    }
}

/// Record of a provider API call.
#[derive(Debug, Clone)]
pub struct ProviderCallRecord {
    pub provider: &'static str,
    pub endpoint: &'static str,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub session_id: Option<Uuid>,
    pub latency_ms: u64,
    /// 0 for the first try, incremented for each gateway retry.
    pub attempt: u32,
    pub status: CallStatus,
    pub error_code: Option<String>,
    pub caller: &'static str,
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    pub fn new(
        provider: &'static str,
        endpoint: &'static str,
        model: impl Into<String>,
        caller: &'static str,
    ) -> Self {
        Self {
            provider,
            endpoint,
            model: model.into(),
            input_tokens: 0,
            output_tokens: 0,
            session_id: None,
            latency_ms: 0,
            attempt: 0,
            status: CallStatus::Success,
            error_code: None,
            caller,
            timestamp: Utc::now(),
        }
    }

    pub fn tokens(mut self, input: u32, output: u32) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn session(mut self, session_id: Option<Uuid>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn error(mut self, code: impl Into<String>) -> Self {
        self.status = CallStatus::Error;
        self.error_code = Some(code.into());
        self
    }
}

/// Trait for recording provider call usage.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Record a provider call. Fire-and-forget: failures are logged by the
    /// sink, never propagated.
    async fn record(&self, record: ProviderCallRecord);
}

/// No-op usage sink that discards all records.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {}
}

/// Usage sink that emits each call as a `tracing` event under the
/// `quill::usage` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        match record.status {
            CallStatus::Success => tracing::debug!(
                target: "quill::usage",
                provider = record.provider,
                endpoint = record.endpoint,
                model = %record.model,
                caller = record.caller,
                input_tokens = record.input_tokens,
                output_tokens = record.output_tokens,
                latency_ms = record.latency_ms,
                attempt = record.attempt,
                "provider call"
            ),
            CallStatus::Error => tracing::warn!(
                target: "quill::usage",
                provider = record.provider,
                model = %record.model,
                caller = record.caller,
                attempt = record.attempt,
                error_code = record.error_code.as_deref().unwrap_or("unknown"),
                "provider call failed"
            ),
        }
    }
}
