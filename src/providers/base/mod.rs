use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::MetaloopError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One conversation entry. History is an append-only `Vec<Message>` owned by the task driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool that produced this entry (role="tool" only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn with_role(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            tool_name: None,
            is_error: false,
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role("user", content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Option<Vec<ToolCallRequest>>) -> Self {
        Self {
            tool_calls,
            ..Self::with_role("assistant", content)
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            tool_name: Some(tool_name.into()),
            is_error,
            ..Self::with_role("tool", content)
        }
    }

    /// Number of tool calls requested by this entry.
    pub fn tool_call_count(&self) -> usize {
        self.tool_calls.as_ref().map_or(0, Vec::len)
    }

    /// Validate a message supplied from outside the model stream (initial prompt,
    /// `add_message`, cognition injections).
    pub fn validate_external(&self) -> Result<(), MetaloopError> {
        if !matches!(self.role.as_str(), "system" | "user") {
            return Err(MetaloopError::InvalidInput(format!(
                "injected message role must be 'system' or 'user', got '{}'",
                self.role
            )));
        }
        if self.content.trim().is_empty() {
            return Err(MetaloopError::InvalidInput(
                "message content must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Streamed output of one model request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelEvent {
    /// Partial assistant text; forwarded to the caller but never stored.
    TextDelta { content: String },
    /// A completed conversation entry.
    Message { message: Message },
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    /// The request finished.
    Completed,
}

impl ModelEvent {
    /// The history entry this event contributes, if any.
    pub fn to_history_message(&self) -> Option<Message> {
        match self {
            Self::Message { message } => Some(message.clone()),
            Self::ToolResult {
                tool_call_id,
                tool_name,
                content,
                is_error,
            } => Some(Message::tool_result(
                tool_call_id.clone(),
                tool_name.clone(),
                content.clone(),
                *is_error,
            )),
            Self::TextDelta { .. } | Self::ToolCall { .. } | Self::Completed => None,
        }
    }
}

/// Agent configuration handed to the model service and the cognitive analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub instructions: String,
    /// Alternative models the cognitive analyzer may score or disable.
    #[serde(default)]
    pub models: Vec<String>,
}

impl AgentProfile {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            instructions: String::new(),
            models: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), MetaloopError> {
        if self.name.trim().is_empty() {
            return Err(MetaloopError::InvalidInput(
                "agent name must not be empty".into(),
            ));
        }
        if self.model.trim().is_empty() {
            return Err(MetaloopError::InvalidInput(
                "agent model must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Parameters for one model request.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub messages: Vec<Message>,
    pub agent: AgentProfile,
    /// Model to use; differs from `agent.model` when cognition disabled the default.
    pub model: String,
    pub request_number: u32,
}

pub type ModelEventStream = BoxStream<'static, anyhow::Result<ModelEvent>>;

/// Configuration for retry behavior when opening a request stream
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 10000,
            backoff_multiplier: 2.0,
        }
    }
}

#[async_trait]
pub trait ModelRequestService: Send + Sync {
    async fn request(&self, req: ModelRequest) -> anyhow::Result<ModelEventStream>;

    /// Open a request stream, retrying transient failures with jittered backoff.
    /// Errors raised after the stream is open are not retried.
    async fn request_with_retry(
        &self,
        req: ModelRequest,
        retry_config: Option<RetryConfig>,
    ) -> anyhow::Result<ModelEventStream> {
        let config = retry_config.unwrap_or_default();
        let mut last_error = None;

        for attempt in 0..=config.max_retries {
            debug!(
                "Opening model request {} (attempt {})",
                req.request_number, attempt
            );
            match self.request(req.clone()).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    let is_transient = e
                        .downcast_ref::<MetaloopError>()
                        .is_none_or(MetaloopError::is_retryable);
                    warn!("Model request failed on attempt {}: {}", attempt, e);
                    if !is_transient {
                        return Err(e);
                    }
                    last_error = Some(e);
                    if attempt < config.max_retries {
                        let base = (config.initial_delay_ms as f64
                            * config.backoff_multiplier.powi(attempt as i32))
                        .min(config.max_delay_ms as f64) as u64;
                        // Add jitter (up to 25% of delay) to avoid thundering herd
                        let jitter = (base as f64 * 0.25 * fastrand::f64()) as u64;
                        tokio::time::sleep(tokio::time::Duration::from_millis(base + jitter))
                            .await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("All retry attempts failed")))
    }
}
