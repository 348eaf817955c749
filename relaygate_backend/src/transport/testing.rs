//! Transport double for unit tests: every call succeeds with fresh ids.

use super::{
    ForumTopic, InlineKeyboard, MemberStatus, OutgoingText, SentMessage, ThreadProbe, Transport,
    TransportResult,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug, Default)]
pub struct NullTransport {
    next_id: AtomicI64,
}

impl NullTransport {
    fn next(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl Transport for NullTransport {
    async fn send_text(&self, _chat_id: i64, message: OutgoingText) -> TransportResult<SentMessage> {
        Ok(SentMessage {
            message_id: self.next(),
            message_thread_id: message.thread_id,
        })
    }

    async fn forward(&self, _to: i64, _thread: Option<i64>, _from: i64, _id: i64) -> TransportResult<i64> {
        Ok(self.next())
    }

    async fn copy(&self, _to: i64, _thread: Option<i64>, _from: i64, _id: i64) -> TransportResult<i64> {
        Ok(self.next())
    }

    async fn copy_group(&self, _to: i64, _thread: Option<i64>, _from: i64, ids: &[i64]) -> TransportResult<Vec<i64>> {
        Ok(ids.iter().map(|_| self.next()).collect())
    }

    async fn create_thread(&self, _chat_id: i64, name: &str) -> TransportResult<ForumTopic> {
        Ok(ForumTopic {
            message_thread_id: self.next(),
            name: name.to_string(),
        })
    }

    async fn delete_thread(&self, _chat_id: i64, _thread_id: i64) -> TransportResult<()> {
        Ok(())
    }

    async fn probe_thread(&self, _chat_id: i64, _thread_id: i64) -> TransportResult<ThreadProbe> {
        Ok(ThreadProbe::Exists)
    }

    async fn delete_message(&self, _chat_id: i64, _message_id: i64) -> TransportResult<()> {
        Ok(())
    }

    async fn member_status(&self, _chat_id: i64, _user_id: i64) -> TransportResult<MemberStatus> {
        Ok(MemberStatus::Administrator)
    }

    async fn edit_keyboard(&self, _chat: i64, _id: i64, _kb: Option<InlineKeyboard>) -> TransportResult<()> {
        Ok(())
    }

    async fn answer_callback(&self, _callback_id: &str, _text: Option<&str>) -> TransportResult<()> {
        Ok(())
    }
}
