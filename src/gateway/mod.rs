//! Provider gateway for judge chat completions.

pub mod chat_completions;
pub mod error;
pub mod retry;
pub mod types;
pub mod usage;

use std::sync::Arc;

use tokio::time::sleep;
use tracing::debug;

use chat_completions::{ChatCompletionsAdapter, PROVIDER_NAME};
use usage::{ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use error::{CallContext, ProviderError};
pub use retry::{Backoff, RetryPolicy};
pub use types::*;
pub use usage::{CallStatus, NoopUsageSink, TracingUsageSink, UsageSink};

/// The seam every judge call goes through.
#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

pub struct ProviderGateway<U: UsageSinkTrait> {
    provider: ChatCompletionsAdapter,
    usage_sink: Arc<U>,
    retry: RetryPolicy,
}

#[async_trait::async_trait]
impl<U: UsageSinkTrait> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl<U: UsageSinkTrait> ProviderGateway<U> {
    pub fn from_env(usage_sink: Arc<U>, retry: RetryPolicy) -> Result<Self, ProviderError> {
        let provider = ChatCompletionsAdapter::from_env()?;
        Ok(Self {
            provider,
            usage_sink,
            retry,
        })
    }

    pub fn with_config(
        provider: ChatCompletionsAdapter,
        usage_sink: Arc<U>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            usage_sink,
            retry,
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut attempt: u32 = 0;
        loop {
            match self.provider.complete(&req).await {
                Ok(resp) => {
                    self.record_usage(&req, Some(&resp), None, attempt).await;
                    return Ok(resp);
                }
                Err(err) => {
                    self.record_usage(&req, None, Some(&err), attempt).await;

                    if !err.is_retryable() || attempt >= self.retry.max_retries {
                        return Err(err);
                    }

                    let delay = self.retry.delay_for(attempt);
                    debug!(
                        attempt,
                        code = err.code(),
                        delay_ms = delay.as_millis() as u64,
                        "retrying provider call"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn record_usage(
        &self,
        req: &ChatRequest,
        resp: Option<&ChatResponse>,
        err: Option<&ProviderError>,
        attempt: u32,
    ) {
        let mut record = ProviderCallRecord::new(
            PROVIDER_NAME,
            req.model.model_id(),
            req.attribution.caller,
        )
        .run(req.attribution.run_id)
        .attempt(attempt);

        if let Some(resp) = resp {
            record = record
                .tokens(resp.input_tokens, resp.output_tokens)
                .latency(resp.latency.as_millis() as u64);
        }
        if let Some(err) = err {
            record = record
                .error(err.code())
                .request_id(err.request_id().map(str::to_string));
        }

        self.usage_sink.record(record).await;
    }
}
