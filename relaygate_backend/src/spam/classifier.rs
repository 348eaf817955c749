use crate::config::ClassifierConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;
use std::time::Duration;

const SYSTEM_PROMPT: &str = "You are a spam filter for a support inbox. Classify the user's message. \
Respond with JSON only: {\"is_spam\": bool, \"confidence\": number between 0 and 1, \
\"category\": string, \"signals\": [string]}.";

/// Normalized model verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub is_spam: bool,
    pub confidence: f32,
    pub category: String,
    pub signals: Vec<String>,
}

impl Classification {
    /// Fills missing or out-of-range fields with conservative defaults.
    fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let is_spam = match object.get("is_spam")? {
            Value::Bool(flag) => *flag,
            Value::String(raw) => matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "yes"),
            _ => return None,
        };
        let confidence = object
            .get("confidence")
            .and_then(|raw| match raw {
                Value::Number(num) => num.as_f64(),
                Value::String(text) => text.trim().parse().ok(),
                _ => None,
            })
            .filter(|conf| conf.is_finite())
            .map(|conf| conf.clamp(0.0, 1.0) as f32)
            .unwrap_or(0.0);
        let category = value["category"]
            .as_str()
            .unwrap_or("unknown")
            .to_string();
        let signals = value["signals"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        Some(Self {
            is_spam,
            confidence,
            category,
            signals,
        })
    }
}

#[async_trait]
pub trait TextClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Classification>;
}

/// Classifier backed by an OpenAI-compatible chat completion endpoint.
#[derive(Clone)]
pub struct LlmClassifier {
    api_url: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: String,
}

impl LlmClassifier {
    /// `None` when no endpoint is configured.
    pub fn from_config(config: &ClassifierConfig) -> Result<Option<Self>> {
        let Some(api_url) = config.api_url.clone() else {
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("failed to build classifier http client")?;
        Ok(Some(Self {
            api_url,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            client,
        }))
    }
}

#[async_trait]
impl TextClassifier for LlmClassifier {
    async fn classify(&self, text: &str) -> Result<Classification> {
        let url = format!("{}/chat/completions", self.api_url);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: text,
                },
            ],
            temperature: 0.0,
            max_tokens: 200,
        };

        let mut req = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req.send().await.context("failed to send classifier request")?;
        if !response.status().is_success() {
            let status = response.status();
            anyhow::bail!("classifier returned {status}");
        }
        let completion: ChatResponse = response
            .json()
            .await
            .context("failed to decode classifier response")?;
        let content = completion
            .choices
            .first()
            .map(|choice| choice.message.content.as_str())
            .context("empty classifier response")?;
        parse_classification(content).context("classifier output did not contain a verdict")
    }
}

/// Tries progressively looser readings of the model output: the whole
/// reply, a fenced code block, the outermost brace span, and finally bare
/// `is_spam`/`confidence` fields.
pub fn parse_classification(raw: &str) -> Option<Classification> {
    let trimmed = raw.trim();
    if let Some(found) = serde_json::from_str::<Value>(trimmed)
        .ok()
        .and_then(|value| Classification::from_value(&value))
    {
        return Some(found);
    }

    if let Some(block) = fenced_block(trimmed) {
        if let Some(found) = serde_json::from_str::<Value>(block)
            .ok()
            .and_then(|value| Classification::from_value(&value))
        {
            return Some(found);
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Some(found) = serde_json::from_str::<Value>(&trimmed[start..=end])
                .ok()
                .and_then(|value| Classification::from_value(&value))
            {
                return Some(found);
            }
        }
    }

    salvage_fields(trimmed)
}

fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let rest = &text[start + 3..];
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let end = rest.find("```")?;
    Some(rest[..end].trim())
}

fn salvage_fields(text: &str) -> Option<Classification> {
    static SPAM_FIELD: OnceLock<Regex> = OnceLock::new();
    static CONFIDENCE_FIELD: OnceLock<Regex> = OnceLock::new();
    let spam_re = SPAM_FIELD.get_or_init(|| {
        Regex::new(r#"(?i)"?is_spam"?\s*[:=]\s*"?(true|false)"#).expect("valid is_spam pattern")
    });
    let conf_re = CONFIDENCE_FIELD.get_or_init(|| {
        Regex::new(r#"(?i)"?confidence"?\s*[:=]\s*"?([0-9]*\.?[0-9]+)"#)
            .expect("valid confidence pattern")
    });
    let is_spam = spam_re
        .captures(text)?
        .get(1)?
        .as_str()
        .eq_ignore_ascii_case("true");
    let confidence = conf_re
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f32>().ok())
        .map(|conf| conf.clamp(0.0, 1.0))
        .unwrap_or(0.0);
    Some(Classification {
        is_spam,
        confidence,
        category: "unknown".to_string(),
        signals: Vec::new(),
    })
}
