//! Test doubles for the LLM and webhook seams.
//!
//! Used by unit and integration tests and by local runs without network
//! access. Each double records every request it receives.

use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use crate::llm::{LlmClient, LlmRequest};
use crate::webhook::{WebhookRequest, WebhookSink};

/// What a [`MockLlm`] does when called.
pub enum LlmBehaviour {
    /// Return the same completion text every time.
    Reply(String),
    /// Fail every call with the given message.
    Fail(String),
}

pub struct MockLlm {
    pub behaviour: LlmBehaviour,
    pub calls: Arc<Mutex<Vec<LlmRequest>>>,
}

impl MockLlm {
    pub fn replying(text: impl Into<String>) -> Self {
        Self {
            behaviour: LlmBehaviour::Reply(text.into()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing(msg: impl Into<String>) -> Self {
        Self {
            behaviour: LlmBehaviour::Fail(msg.into()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(&self, request: &LlmRequest) -> Result<String> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        match &self.behaviour {
            LlmBehaviour::Reply(text) => Ok(text.clone()),
            LlmBehaviour::Fail(msg) => Err(anyhow!("{msg}")),
        }
    }
}

/// Webhook sink answering with a fixed status, or failing like a dropped
/// connection when `status` is `None`.
pub struct MockWebhookSink {
    pub status: Option<u16>,
    pub calls: Arc<Mutex<Vec<WebhookRequest>>>,
}

impl MockWebhookSink {
    pub fn responding(status: u16) -> Self {
        Self {
            status: Some(status),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            status: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn requests(&self) -> Vec<WebhookRequest> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl WebhookSink for MockWebhookSink {
    async fn deliver(&self, request: &WebhookRequest) -> Result<u16> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        self.status
            .ok_or_else(|| anyhow!("connection refused: {}", request.url))
    }
}
