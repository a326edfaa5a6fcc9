use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{CoreError, Result};

/// External verdict provider. Returns the model's free-text answer.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, system: &str, prompt: &str) -> Result<String>;

    fn name(&self) -> &str;

    fn model(&self) -> &str;
}

// ---------------------------------------------------------------------------
// OpenAI-compatible chat completions
// ---------------------------------------------------------------------------

pub struct OpenAiClassifier {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiClassifier {
    pub fn new(api_key: String, model: String, base_url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            max_tokens: 500,
            temperature: 0.1,
        })
    }
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    async fn classify(&self, system: &str, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": prompt },
            ],
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(CoreError::Classifier(format!(
                "chat completion failed ({}): {}",
                status, error_body
            )));
        }

        let payload: serde_json::Value = response.json().await?;
        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CoreError::Classifier("response carried no message content".to_string()))
    }

    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// Mock provider
// ---------------------------------------------------------------------------

/// Canned classifier for tests and offline runs.
pub struct MockClassifier {
    reply: String,
    should_fail: bool,
    call_count: AtomicUsize,
    last_prompt: Mutex<Option<String>>,
}

impl MockClassifier {
    pub fn replying(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            should_fail: false,
            call_count: AtomicUsize::new(0),
            last_prompt: Mutex::new(None),
        }
    }

    pub fn failing() -> Self {
        let mut mock = Self::replying("");
        mock.should_fail = true;
        mock
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.last_prompt.lock().ok().and_then(|p| p.clone())
    }
}

#[async_trait]
impl Classifier for MockClassifier {
    async fn classify(&self, _system: &str, prompt: &str) -> Result<String> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_prompt.lock() {
            *last = Some(prompt.to_string());
        }
        if self.should_fail {
            return Err(CoreError::Classifier("mock provider unavailable".to_string()));
        }
        Ok(self.reply.clone())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock"
    }
}
