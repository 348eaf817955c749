use super::retry::{RetryDecision, RetryPolicy};
use super::types::{ForumTopic, InlineKeyboard, MemberStatus, OutgoingText, SentMessage, ThreadProbe};
use super::{Transport, TransportError, TransportResult};
use crate::config::TransportConfig;
use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MessageIdResult {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct ChatMemberResult {
    status: MemberStatus,
}

/// JSON-over-HTTPS client for the bot API.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    policy: RetryPolicy,
}

impl HttpTransport {
    pub fn new(config: &TransportConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("failed to build transport http client")?;
        Ok(Self {
            client,
            base_url: format!("{}/bot{}", config.api_base, config.bot_token),
            policy: RetryPolicy::new(&config.retry),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, payload: Value) -> TransportResult<T> {
        let mut payload = payload;
        let mut attempt = 0u32;
        let mut stripped = false;
        loop {
            attempt += 1;
            let error = match self.call_once(method, &payload).await {
                Ok(result) => {
                    return serde_json::from_value(result)
                        .map_err(|err| TransportError::Malformed(err.to_string()));
                }
                Err(err) => err,
            };
            match self.policy.decide(attempt, &error) {
                RetryDecision::Retry(delay) => {
                    tracing::debug!(method, attempt, ?delay, error = %error, "retrying transport call");
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Fallback if !stripped && strip_formatting(&mut payload) => {
                    tracing::debug!(method, "retrying without formatting");
                    stripped = true;
                }
                RetryDecision::Fallback | RetryDecision::GiveUp => return Err(error),
            }
        }
    }

    async fn call_once(&self, method: &str, payload: &Value) -> TransportResult<Value> {
        let url = format!("{}/{}", self.base_url, method);
        let response = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|err| TransportError::Transient(err.without_url().to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| TransportError::Transient(err.without_url().to_string()))?;
        let envelope: Envelope = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(_) if status.as_u16() == 429 => {
                return Err(TransportError::RateLimited { retry_after: None })
            }
            Err(_) if status.is_server_error() => {
                return Err(TransportError::Transient(format!("http {status}")))
            }
            Err(err) => return Err(TransportError::Malformed(format!("http {status}: {err}"))),
        };
        if envelope.ok {
            return Ok(envelope.result.unwrap_or(Value::Bool(true)));
        }
        let code = envelope.error_code.unwrap_or(i64::from(status.as_u16()));
        let retry_after = envelope
            .parameters
            .and_then(|params| params.retry_after)
            .map(Duration::from_secs);
        if code == 429 {
            return Err(TransportError::RateLimited { retry_after });
        }
        if code >= 500 {
            return Err(TransportError::Transient(
                envelope.description.unwrap_or_else(|| format!("http {code}")),
            ));
        }
        Err(TransportError::api(
            code,
            envelope.description.unwrap_or_default(),
        ))
    }
}

/// Drops `parse_mode` so the text is sent verbatim. Returns false when there
/// was nothing to strip.
fn strip_formatting(payload: &mut Value) -> bool {
    payload
        .as_object_mut()
        .and_then(|object| object.remove("parse_mode"))
        .is_some()
}

fn with_thread(mut object: Map<String, Value>, thread_id: Option<i64>) -> Value {
    if let Some(thread_id) = thread_id {
        object.insert("message_thread_id".into(), json!(thread_id));
    }
    Value::Object(object)
}

fn markup(keyboard: Option<InlineKeyboard>) -> Value {
    json!(keyboard.unwrap_or_else(InlineKeyboard::empty))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_text(&self, chat_id: i64, message: OutgoingText) -> TransportResult<SentMessage> {
        let mut object = Map::new();
        object.insert("chat_id".into(), json!(chat_id));
        object.insert("text".into(), json!(message.text));
        object.insert("disable_web_page_preview".into(), json!(true));
        if let Some(mode) = message.parse_mode {
            object.insert("parse_mode".into(), json!(mode));
        }
        if let Some(keyboard) = message.keyboard {
            object.insert("reply_markup".into(), json!(keyboard));
        }
        self.call("sendMessage", with_thread(object, message.thread_id))
            .await
    }

    async fn forward(
        &self,
        to_chat: i64,
        thread_id: Option<i64>,
        from_chat: i64,
        message_id: i64,
    ) -> TransportResult<i64> {
        let mut object = Map::new();
        object.insert("chat_id".into(), json!(to_chat));
        object.insert("from_chat_id".into(), json!(from_chat));
        object.insert("message_id".into(), json!(message_id));
        let sent: SentMessage = self
            .call("forwardMessage", with_thread(object, thread_id))
            .await?;
        Ok(sent.message_id)
    }

    async fn copy(
        &self,
        to_chat: i64,
        thread_id: Option<i64>,
        from_chat: i64,
        message_id: i64,
    ) -> TransportResult<i64> {
        let mut object = Map::new();
        object.insert("chat_id".into(), json!(to_chat));
        object.insert("from_chat_id".into(), json!(from_chat));
        object.insert("message_id".into(), json!(message_id));
        let copied: MessageIdResult = self
            .call("copyMessage", with_thread(object, thread_id))
            .await?;
        Ok(copied.message_id)
    }

    async fn copy_group(
        &self,
        to_chat: i64,
        thread_id: Option<i64>,
        from_chat: i64,
        message_ids: &[i64],
    ) -> TransportResult<Vec<i64>> {
        let mut object = Map::new();
        object.insert("chat_id".into(), json!(to_chat));
        object.insert("from_chat_id".into(), json!(from_chat));
        object.insert("message_ids".into(), json!(message_ids));
        let copied: Vec<MessageIdResult> = self
            .call("copyMessages", with_thread(object, thread_id))
            .await?;
        Ok(copied.into_iter().map(|item| item.message_id).collect())
    }

    async fn create_thread(&self, chat_id: i64, name: &str) -> TransportResult<ForumTopic> {
        self.call(
            "createForumTopic",
            json!({ "chat_id": chat_id, "name": name }),
        )
        .await
    }

    async fn delete_thread(&self, chat_id: i64, thread_id: i64) -> TransportResult<()> {
        let _: Value = self
            .call(
                "deleteForumTopic",
                json!({ "chat_id": chat_id, "message_thread_id": thread_id }),
            )
            .await?;
        Ok(())
    }

    async fn probe_thread(&self, _chat_id: i64, _thread_id: i64) -> TransportResult<ThreadProbe> {
        Err(TransportError::Unsupported("read-only thread lookup"))
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> TransportResult<()> {
        let _: Value = self
            .call(
                "deleteMessage",
                json!({ "chat_id": chat_id, "message_id": message_id }),
            )
            .await?;
        Ok(())
    }

    async fn member_status(&self, chat_id: i64, user_id: i64) -> TransportResult<MemberStatus> {
        let member: ChatMemberResult = self
            .call(
                "getChatMember",
                json!({ "chat_id": chat_id, "user_id": user_id }),
            )
            .await?;
        Ok(member.status)
    }

    async fn edit_keyboard(
        &self,
        chat_id: i64,
        message_id: i64,
        keyboard: Option<InlineKeyboard>,
    ) -> TransportResult<()> {
        let result: TransportResult<Value> = self
            .call(
                "editMessageReplyMarkup",
                json!({
                    "chat_id": chat_id,
                    "message_id": message_id,
                    "reply_markup": markup(keyboard),
                }),
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_modified() => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> TransportResult<()> {
        let mut object = Map::new();
        object.insert("callback_query_id".into(), json!(callback_id));
        if let Some(text) = text {
            object.insert("text".into(), json!(text));
        }
        let _: Value = self
            .call("answerCallbackQuery", Value::Object(object))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stripping_formatting_only_reports_real_changes() {
        let mut payload = json!({"text": "<b>x</b>", "parse_mode": "HTML"});
        assert!(strip_formatting(&mut payload));
        assert!(payload.get("parse_mode").is_none());
        assert!(!strip_formatting(&mut payload));
    }

    #[test]
    fn thread_id_is_attached_only_when_present() {
        let with = with_thread(Map::new(), Some(9));
        assert_eq!(with, json!({"message_thread_id": 9}));
        let without = with_thread(Map::new(), None);
        assert_eq!(without, json!({}));
    }

    #[test]
    fn error_envelope_decodes_retry_hint() {
        let raw = r#"{"ok":false,"error_code":429,"description":"Too Many Requests","parameters":{"retry_after":3}}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert!(!envelope.ok);
        assert_eq!(envelope.parameters.and_then(|p| p.retry_after), Some(3));
    }
}
