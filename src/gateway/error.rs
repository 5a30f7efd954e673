//! Failures of a single judge call.

use std::time::Duration;
use thiserror::Error;

/// Which judge issued the failed call and what the endpoint said about it.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Code path that issued the call, e.g. "judge::novelty".
    pub caller: &'static str,
    /// Endpoint error code such as "model_not_found".
    pub provider_code: Option<String>,
    /// `x-request-id` of the failed response.
    pub request_id: Option<String>,
}

impl CallContext {
    pub fn new(caller: &'static str) -> Self {
        Self {
            caller,
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{caller}: rate limited, retry after {retry_after:?}", caller = .context.caller)]
    RateLimited {
        retry_after: Duration,
        context: CallContext,
    },

    /// Non-success status other than 429. Server errors are retried.
    #[error("{caller}: HTTP {status}: {message}", caller = .context.caller)]
    Status {
        status: u16,
        message: String,
        context: CallContext,
    },

    /// The judge declined to compare the cards.
    #[error("{caller}: judge refused: {message}", caller = .context.caller)]
    Refused {
        message: String,
        context: CallContext,
    },

    /// A 200 that carries no usable judgement: no choices, empty text, a
    /// reply cut at the token limit, or a body that is not JSON.
    #[error("{caller}: unusable reply: {reason}", caller = .context.caller)]
    UnusableReply {
        reason: String,
        context: CallContext,
    },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Missing API key or an unbuildable client.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn unusable(reason: impl Into<String>, context: CallContext) -> Self {
        Self::UnusableReply {
            reason: reason.into(),
            context,
        }
    }

    /// Worth another attempt of the same request.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Status { status, .. } => *status >= 500,
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Refused { .. } | Self::UnusableReply { .. } | Self::Config(_) => false,
        }
    }

    /// The call went through but produced no judgement. The comparator treats
    /// these like a malformed judgement and repairs them.
    pub fn is_judgement_failure(&self) -> bool {
        matches!(self, Self::Refused { .. } | Self::UnusableReply { .. })
    }

    /// Short code for logs and usage records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Status { status, .. } if *status >= 500 => "server_error",
            Self::Status { .. } => "client_error",
            Self::Refused { .. } => "refused",
            Self::UnusableReply { .. } => "unusable_reply",
            Self::Transport(_) => "transport",
            Self::Config(_) => "config",
        }
    }

    pub fn context(&self) -> Option<&CallContext> {
        match self {
            Self::RateLimited { context, .. }
            | Self::Status { context, .. }
            | Self::Refused { context, .. }
            | Self::UnusableReply { context, .. } => Some(context),
            Self::Transport(_) | Self::Config(_) => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.context().and_then(|c| c.request_id.as_deref())
    }
}
