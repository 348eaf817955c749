//! Inbound webhook payloads. Only the fields the relay reads are modelled;
//! everything else is ignored by serde.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
    Channel,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ChatKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

impl User {
    pub fn display_name(&self) -> String {
        let full = match &self.last_name {
            Some(last) if !last.trim().is_empty() => format!("{} {}", self.first_name.trim(), last.trim()),
            _ => self.first_name.trim().to_string(),
        };
        if full.is_empty() {
            self.username.clone().unwrap_or_default()
        } else {
            full
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    #[serde(default)]
    pub date: i64,
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub message_thread_id: Option<i64>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub media_group_id: Option<String>,
    #[serde(default)]
    pub forum_topic_created: Option<Value>,
    #[serde(default)]
    pub forum_topic_edited: Option<Value>,
    #[serde(default)]
    pub forum_topic_closed: Option<Value>,
    #[serde(default)]
    pub forum_topic_reopened: Option<Value>,
    #[serde(default)]
    pub new_chat_members: Option<Value>,
    #[serde(default)]
    pub left_chat_member: Option<Value>,
    #[serde(default)]
    pub pinned_message: Option<Value>,
}

impl Message {
    /// Text or media caption.
    pub fn text_content(&self) -> Option<&str> {
        self.text.as_deref().or(self.caption.as_deref())
    }

    /// Membership changes, pins and topic bookkeeping.
    pub fn is_service(&self) -> bool {
        self.forum_topic_created.is_some()
            || self.forum_topic_edited.is_some()
            || self.forum_topic_closed.is_some()
            || self.forum_topic_reopened.is_some()
            || self.new_chat_members.is_some()
            || self.left_chat_member.is_some()
            || self.pinned_message.is_some()
    }

    pub fn is_command(&self, name: &str) -> bool {
        let Some(text) = self.text.as_deref() else {
            return false;
        };
        let Some(first) = text.split_whitespace().next() else {
            return false;
        };
        let command = first.split('@').next().unwrap_or(first);
        command.strip_prefix('/') == Some(name)
    }

    pub fn sent_by_bot(&self) -> bool {
        self.from.as_ref().is_some_and(|user| user.is_bot)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackMessage {
    pub message_id: i64,
    pub chat: Chat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub message: Option<CallbackMessage>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    Answer { challenge_id: String, option: String },
    Finalize { token: String },
    Refresh,
    Unknown,
}

impl CallbackAction {
    pub fn parse(data: Option<&str>) -> Self {
        let Some(data) = data else {
            return CallbackAction::Unknown;
        };
        if data == "r" {
            return CallbackAction::Refresh;
        }
        if let Some(token) = data.strip_prefix("f:") {
            return CallbackAction::Finalize {
                token: token.to_string(),
            };
        }
        if let Some(rest) = data.strip_prefix("q:") {
            if let Some((challenge_id, option)) = rest.rsplit_once(':') {
                if !challenge_id.is_empty() && !option.is_empty() {
                    return CallbackAction::Answer {
                        challenge_id: challenge_id.to_string(),
                        option: option.to_string(),
                    };
                }
            }
        }
        CallbackAction::Unknown
    }
}
