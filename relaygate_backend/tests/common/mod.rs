#![allow(dead_code)]

use async_trait::async_trait;
use relaygate_backend::config::{RelayConfig, RelayPaths, TransportConfig};
use relaygate_backend::database::Database;
use relaygate_backend::node::RelayServices;
use relaygate_backend::relay::Update;
use relaygate_backend::store::keys;
use relaygate_backend::transport::{
    ForumTopic, InlineKeyboard, MemberStatus, OutgoingText, SentMessage, ThreadProbe, Transport,
    TransportError, TransportResult,
};
use relaygate_backend::verification::quiz::{answer_callback_data, QuizChallenge};
use relaygate_backend::verification::{CaptchaVerifier, ProviderKind, VerificationSession};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const GROUP: i64 = -100_777;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    SendText {
        chat_id: i64,
        thread_id: Option<i64>,
        text: String,
        keyboard: Option<InlineKeyboard>,
    },
    Forward {
        to_chat: i64,
        thread_id: Option<i64>,
        from_chat: i64,
        message_id: i64,
    },
    Copy {
        to_chat: i64,
        thread_id: Option<i64>,
        from_chat: i64,
        message_id: i64,
    },
    CopyGroup {
        to_chat: i64,
        thread_id: Option<i64>,
        from_chat: i64,
        message_ids: Vec<i64>,
    },
    CreateThread {
        chat_id: i64,
        name: String,
    },
    DeleteThread {
        chat_id: i64,
        thread_id: i64,
    },
    DeleteMessage {
        chat_id: i64,
        message_id: i64,
    },
    EditKeyboard {
        chat_id: i64,
        message_id: i64,
    },
    AnswerCallback {
        callback_id: String,
        text: Option<String>,
    },
}

#[derive(Default)]
struct FakeState {
    next_id: i64,
    calls: Vec<Call>,
    /// Threads that answer every send with "thread not found".
    missing_threads: HashSet<i64>,
    /// Threads whose sends land in the group's general area instead.
    redirected_threads: HashSet<i64>,
    /// Users who blocked the bot.
    unreachable_users: HashSet<i64>,
    /// Users whose messages cannot be natively forwarded.
    protected_users: HashSet<i64>,
    /// Private-chat message ids that can be neither forwarded nor copied.
    undeliverable: HashSet<i64>,
}

/// Scripted in-memory transport. Thread lookups are unsupported so the
/// relay falls back to its write probe, as with the HTTP transport.
#[derive(Default)]
pub struct FakeTransport {
    state: Mutex<FakeState>,
}

impl FakeTransport {
    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    fn next_id(state: &mut FakeState) -> i64 {
        state.next_id += 1;
        1000 + state.next_id
    }

    pub fn calls(&self) -> Vec<Call> {
        self.with_state(|state| state.calls.clone())
    }

    pub fn clear_calls(&self) {
        self.with_state(|state| state.calls.clear());
    }

    pub fn mark_missing(&self, thread_id: i64) {
        self.with_state(|state| {
            state.missing_threads.insert(thread_id);
        });
    }

    pub fn mark_redirected(&self, thread_id: i64) {
        self.with_state(|state| {
            state.redirected_threads.insert(thread_id);
        });
    }

    pub fn mark_unreachable(&self, user_id: i64) {
        self.with_state(|state| {
            state.unreachable_users.insert(user_id);
        });
    }

    pub fn mark_reachable(&self, user_id: i64) {
        self.with_state(|state| {
            state.unreachable_users.remove(&user_id);
        });
    }

    /// Makes a private-chat message behave as if the user deleted it.
    pub fn mark_undeliverable(&self, message_id: i64) {
        self.with_state(|state| {
            state.undeliverable.insert(message_id);
        });
    }

    pub fn mark_deliverable(&self, message_id: i64) {
        self.with_state(|state| {
            state.undeliverable.remove(&message_id);
        });
    }

    pub fn mark_protected(&self, user_id: i64) {
        self.with_state(|state| {
            state.protected_users.insert(user_id);
        });
    }

    /// Texts sent to a private chat, in order.
    pub fn texts_to(&self, chat_id: i64) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::SendText { chat_id: to, text, .. } if to == chat_id => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Every keyboard sent to `chat_id`, in order.
    pub fn keyboards_to(&self, chat_id: i64) -> Vec<InlineKeyboard> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::SendText {
                    chat_id: to,
                    keyboard: Some(keyboard),
                    ..
                } if to == chat_id => Some(keyboard),
                _ => None,
            })
            .collect()
    }

    /// Message ids that reached the destination group from a user, in call
    /// order, whether forwarded or copied.
    pub fn delivered_from(&self, user_id: i64) -> Vec<i64> {
        let mut ids = Vec::new();
        for call in self.calls() {
            match call {
                Call::Forward {
                    to_chat: GROUP,
                    from_chat,
                    message_id,
                    ..
                }
                | Call::Copy {
                    to_chat: GROUP,
                    from_chat,
                    message_id,
                    ..
                } if from_chat == user_id => ids.push(message_id),
                Call::CopyGroup {
                    to_chat: GROUP,
                    from_chat,
                    message_ids,
                    ..
                } if from_chat == user_id => ids.extend(message_ids),
                _ => {}
            }
        }
        ids
    }

    pub fn created_threads(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::CreateThread { .. }))
            .count()
    }

    fn check_thread(state: &FakeState, thread_id: Option<i64>) -> TransportResult<()> {
        match thread_id {
            Some(thread_id) if state.missing_threads.contains(&thread_id) => {
                Err(TransportError::api(400, "Bad Request: message thread not found"))
            }
            _ => Ok(()),
        }
    }

    fn check_user(state: &FakeState, chat_id: i64) -> TransportResult<()> {
        if state.unreachable_users.contains(&chat_id) {
            return Err(TransportError::api(403, "Forbidden: bot was blocked by the user"));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send_text(&self, chat_id: i64, message: OutgoingText) -> TransportResult<SentMessage> {
        self.with_state(|state| {
            Self::check_user(state, chat_id)?;
            Self::check_thread(state, message.thread_id)?;
            state.calls.push(Call::SendText {
                chat_id,
                thread_id: message.thread_id,
                text: message.text.clone(),
                keyboard: message.keyboard.clone(),
            });
            let landed = match message.thread_id {
                Some(thread_id) if state.redirected_threads.contains(&thread_id) => None,
                other => other,
            };
            Ok(SentMessage {
                message_id: Self::next_id(state),
                message_thread_id: landed,
            })
        })
    }

    async fn forward(
        &self,
        to_chat: i64,
        thread_id: Option<i64>,
        from_chat: i64,
        message_id: i64,
    ) -> TransportResult<i64> {
        self.with_state(|state| {
            Self::check_thread(state, thread_id)?;
            if state.protected_users.contains(&from_chat) {
                return Err(TransportError::api(400, "Bad Request: message can't be forwarded"));
            }
            if state.undeliverable.contains(&message_id) {
                return Err(TransportError::api(400, "Bad Request: message to forward not found"));
            }
            state.calls.push(Call::Forward {
                to_chat,
                thread_id,
                from_chat,
                message_id,
            });
            Ok(Self::next_id(state))
        })
    }

    async fn copy(
        &self,
        to_chat: i64,
        thread_id: Option<i64>,
        from_chat: i64,
        message_id: i64,
    ) -> TransportResult<i64> {
        self.with_state(|state| {
            Self::check_user(state, to_chat)?;
            Self::check_thread(state, thread_id)?;
            if state.undeliverable.contains(&message_id) {
                return Err(TransportError::api(400, "Bad Request: message to copy not found"));
            }
            state.calls.push(Call::Copy {
                to_chat,
                thread_id,
                from_chat,
                message_id,
            });
            Ok(Self::next_id(state))
        })
    }

    async fn copy_group(
        &self,
        to_chat: i64,
        thread_id: Option<i64>,
        from_chat: i64,
        message_ids: &[i64],
    ) -> TransportResult<Vec<i64>> {
        self.with_state(|state| {
            Self::check_user(state, to_chat)?;
            Self::check_thread(state, thread_id)?;
            state.calls.push(Call::CopyGroup {
                to_chat,
                thread_id,
                from_chat,
                message_ids: message_ids.to_vec(),
            });
            Ok(message_ids.iter().map(|_| Self::next_id(state)).collect())
        })
    }

    async fn create_thread(&self, chat_id: i64, name: &str) -> TransportResult<ForumTopic> {
        self.with_state(|state| {
            state.calls.push(Call::CreateThread {
                chat_id,
                name: name.to_string(),
            });
            Ok(ForumTopic {
                message_thread_id: Self::next_id(state),
                name: name.to_string(),
            })
        })
    }

    async fn delete_thread(&self, chat_id: i64, thread_id: i64) -> TransportResult<()> {
        self.with_state(|state| {
            state.calls.push(Call::DeleteThread { chat_id, thread_id });
            Ok(())
        })
    }

    async fn probe_thread(&self, _chat_id: i64, _thread_id: i64) -> TransportResult<ThreadProbe> {
        Err(TransportError::Unsupported("probe_thread"))
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> TransportResult<()> {
        self.with_state(|state| {
            state.calls.push(Call::DeleteMessage {
                chat_id,
                message_id,
            });
            Ok(())
        })
    }

    async fn member_status(&self, _chat_id: i64, _user_id: i64) -> TransportResult<MemberStatus> {
        Ok(MemberStatus::Administrator)
    }

    async fn edit_keyboard(
        &self,
        chat_id: i64,
        message_id: i64,
        _keyboard: Option<InlineKeyboard>,
    ) -> TransportResult<()> {
        self.with_state(|state| {
            state.calls.push(Call::EditKeyboard {
                chat_id,
                message_id,
            });
            Ok(())
        })
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> TransportResult<()> {
        self.with_state(|state| {
            state.calls.push(Call::AnswerCallback {
                callback_id: callback_id.to_string(),
                text: text.map(str::to_string),
            });
            Ok(())
        })
    }
}

pub struct Harness {
    pub transport: Arc<FakeTransport>,
    pub services: RelayServices,
}

pub fn test_config() -> RelayConfig {
    let mut config = RelayConfig::new(
        RelayPaths::default(),
        TransportConfig::new("4242:test-token", Some(GROUP)),
    );
    config.tuning.media_group_debounce = Duration::from_millis(50);
    config
}

pub fn harness() -> Harness {
    harness_with(test_config())
}

pub fn harness_with(config: RelayConfig) -> Harness {
    build(config, None)
}

/// Harness whose new sessions use the hosted verification page.
pub fn captcha_harness(verifier: Arc<dyn CaptchaVerifier>) -> Harness {
    let mut config = test_config();
    config.verification.default_provider = ProviderKind::WebCaptcha;
    config.verification.public_url = Some("https://relay.example".into());
    build(config, Some(verifier))
}

fn build(config: RelayConfig, captcha: Option<Arc<dyn CaptchaVerifier>>) -> Harness {
    let transport = Arc::new(FakeTransport::default());
    let database = Database::open_in_memory().expect("in-memory database");
    let services = RelayServices::assemble(&config, database, transport.clone(), captcha, None);
    Harness {
        transport,
        services,
    }
}

/// Siteverify stand-in with a fixed verdict.
pub struct StaticVerifier(pub bool);

#[async_trait]
impl CaptchaVerifier for StaticVerifier {
    async fn verify(&self, _token: &str, _remote_ip: Option<&str>) -> anyhow::Result<bool> {
        Ok(self.0)
    }
}

/// Siteverify that never answers in time.
pub struct TimedOutVerifier;

#[async_trait]
impl CaptchaVerifier for TimedOutVerifier {
    async fn verify(&self, _token: &str, _remote_ip: Option<&str>) -> anyhow::Result<bool> {
        anyhow::bail!("siteverify request timed out")
    }
}

fn user_json(user_id: i64) -> serde_json::Value {
    json!({"id": user_id, "is_bot": false, "first_name": "User", "last_name": user_id.to_string()})
}

pub fn private_text(user_id: i64, message_id: i64, text: &str) -> Update {
    serde_json::from_value(json!({
        "update_id": message_id,
        "message": {
            "message_id": message_id,
            "date": 1_700_000_000,
            "chat": {"id": user_id, "type": "private"},
            "from": user_json(user_id),
            "text": text
        }
    }))
    .expect("valid update")
}

pub fn private_album_item(user_id: i64, message_id: i64, group_id: &str) -> Update {
    serde_json::from_value(json!({
        "update_id": message_id,
        "message": {
            "message_id": message_id,
            "chat": {"id": user_id, "type": "private"},
            "from": user_json(user_id),
            "media_group_id": group_id,
            "caption": "photo"
        }
    }))
    .expect("valid update")
}

pub fn thread_reply(thread_id: i64, message_id: i64, from_bot: bool) -> Update {
    serde_json::from_value(json!({
        "update_id": message_id,
        "message": {
            "message_id": message_id,
            "chat": {"id": GROUP, "type": "supergroup"},
            "from": {"id": 1, "is_bot": from_bot, "first_name": "Agent"},
            "message_thread_id": thread_id,
            "text": "hello from support"
        }
    }))
    .expect("valid update")
}

pub fn callback(user_id: i64, data: &str) -> Update {
    serde_json::from_value(json!({
        "update_id": 1,
        "callback_query": {
            "id": format!("cb-{data}"),
            "from": user_json(user_id),
            "data": data
        }
    }))
    .expect("valid update")
}

impl Harness {
    pub async fn send(&self, update: Update) {
        self.services.relay.handle_update(update).await;
    }

    /// Challenge id carried by the most recent quiz keyboard sent to the user.
    pub fn current_challenge(&self, user_id: i64) -> String {
        let keyboard = self
            .transport
            .keyboards_to(user_id)
            .into_iter()
            .last()
            .expect("a challenge keyboard was sent");
        let data = keyboard.inline_keyboard[0][0]
            .callback_data
            .clone()
            .expect("quiz buttons carry callback data");
        let rest = data.strip_prefix("q:").expect("quiz callback");
        rest.rsplit_once(':').expect("challenge id and option").0.to_string()
    }

    pub async fn quiz(&self, challenge_id: &str) -> QuizChallenge {
        self.services
            .storage
            .get_json::<QuizChallenge>(&keys::challenge(challenge_id))
            .await
            .unwrap()
            .expect("challenge stored")
    }

    pub async fn answer_data(&self, challenge_id: &str, correct: bool) -> String {
        let quiz = self.quiz(challenge_id).await;
        let option = if correct {
            quiz.correct_index
        } else {
            (quiz.correct_index + 1) % quiz.options.len()
        };
        answer_callback_data(challenge_id, option)
    }

    /// Callback data of the first button on the most recent keyboard.
    pub fn last_button_data(&self, user_id: i64) -> Option<String> {
        self.transport
            .keyboards_to(user_id)
            .last()
            .and_then(|keyboard| keyboard.inline_keyboard[0][0].callback_data.clone())
    }

    pub async fn session(&self, user_id: i64) -> Option<VerificationSession> {
        self.services
            .relay
            .verification()
            .active_session(user_id)
            .await
            .unwrap()
    }

    /// Moves the stored session's start back past its lifetime.
    pub async fn age_session(&self, user_id: i64, by: Duration) {
        let mut session = self
            .services
            .relay
            .verification()
            .load_session(user_id)
            .await
            .unwrap()
            .expect("session stored");
        session.created_at -= by.as_secs() as i64;
        self.services
            .storage
            .put_json(&keys::session(user_id), &session, None)
            .await
            .unwrap();
    }

    pub async fn pending(&self, user_id: i64) -> Vec<i64> {
        self.services
            .storage
            .get_json(&keys::pending(user_id))
            .await
            .unwrap()
            .unwrap_or_default()
    }

    /// Runs a user through /start and a correct answer.
    pub async fn verify(&self, user_id: i64) {
        self.send(private_text(user_id, 1, "/start")).await;
        let challenge = self.current_challenge(user_id);
        let data = self.answer_data(&challenge, true).await;
        self.send(callback(user_id, &data)).await;
    }
}
