//! Adapters - upstream text-generation integrations.

mod gemini;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use gemini::GeminiClient;

/// A single text-generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// System instruction, if the caller has one
    pub system: Option<String>,
    /// User prompt
    pub prompt: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
    /// Ask the upstream for a directly parseable JSON reply
    pub json_response: bool,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            max_output_tokens: 1024,
            temperature: 0.2,
            json_response: false,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn json(mut self) -> Self {
        self.json_response = true;
        self
    }
}

/// Upstream reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    pub text: String,
    pub tokens_used: u64,
    pub latency_ms: u64,
}

/// Transport-level failures talking to an upstream tier.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited (429): {0}")]
    RateLimited(String),

    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("could not decode upstream reply: {0}")]
    Decode(String),

    #[error("no upstream credentials configured")]
    MissingCredentials,
}

impl TransportError {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::RateLimited(_) | Self::Network(_) => true,
            Self::Status { status, .. } => *status == 408 || *status >= 500,
            Self::Decode(_) | Self::MissingCredentials => false,
        }
    }

    /// Whether the upstream signalled that the metered budget is used up.
    pub fn is_quota_exhausted(&self) -> bool {
        match self {
            Self::RateLimited(_) => true,
            Self::Status { body, .. } => {
                let body = body.to_lowercase();
                body.contains("quota") || body.contains("resource_exhausted")
            }
            _ => false,
        }
    }
}

/// Truncate to at most `max` characters on a char boundary.
pub(crate) fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Trait for text-generation backends.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Issue one request/response call.
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, TransportError>;

    /// Model identifier used for this backend
    fn model(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_counts_as_quota_and_retryable() {
        let err = TransportError::RateLimited("RPM exceeded".to_string());
        assert!(err.is_retryable());
        assert!(err.is_quota_exhausted());
    }

    #[test]
    fn quota_in_body_is_detected() {
        let err = TransportError::Status {
            status: 403,
            body: "Quota exceeded for project".to_string(),
        };
        assert!(err.is_quota_exhausted());
        assert!(!err.is_retryable());
    }

    #[test]
    fn server_errors_are_retryable() {
        let err = TransportError::Status {
            status: 503,
            body: String::new(),
        };
        assert!(err.is_retryable());
        assert!(!err.is_quota_exhausted());
        assert!(!TransportError::Decode("bad".into()).is_retryable());
    }
}
