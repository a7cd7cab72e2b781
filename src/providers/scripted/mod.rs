//! Replays a fixed script of model events, one entry per request.
//!
//! Used by the `metaloop run` command to drive a task without a live model.

use crate::providers::base::{ModelEvent, ModelEventStream, ModelRequest, ModelRequestService};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptedRequest {
    /// Pause before each event, simulating a streaming model.
    #[serde(default, rename = "delayMs")]
    pub delay_ms: u64,
    pub events: Vec<ModelEvent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Script {
    pub requests: Vec<ScriptedRequest>,
}

pub struct ScriptedModelService {
    remaining: Mutex<VecDeque<ScriptedRequest>>,
}

impl ScriptedModelService {
    pub fn new(script: Script) -> Self {
        Self {
            remaining: Mutex::new(script.requests.into()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read script {}", path.display()))?;
        let script: Script = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse script {}", path.display()))?;
        Ok(Self::new(script))
    }

    pub fn remaining(&self) -> usize {
        self.remaining
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl ModelRequestService for ScriptedModelService {
    async fn request(&self, req: ModelRequest) -> Result<ModelEventStream> {
        let next = self
            .remaining
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front();
        let Some(entry) = next else {
            debug!(
                "Script exhausted at request {}, replying with an empty turn",
                req.request_number
            );
            return Ok(futures_util::stream::iter(vec![Ok(ModelEvent::Completed)]).boxed());
        };

        let delay = Duration::from_millis(entry.delay_ms);
        let mut events = entry.events;
        if !matches!(events.last(), Some(ModelEvent::Completed)) {
            events.push(ModelEvent::Completed);
        }
        Ok(futures_util::stream::iter(events)
            .then(move |event| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(event)
            })
            .boxed())
    }
}
