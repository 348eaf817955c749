//! Inbound dispatch and the two relay directions.
//!
//! Direction A carries private messages from a user into that user's thread
//! in the destination group. Direction B carries replies posted in a thread
//! back to the user who owns it.

pub mod media_group;
pub mod update;

pub use media_group::{Direction, MediaGroupBuffer};
pub use update::{CallbackAction, CallbackQuery, ChatKind, Message, Update, User};

use crate::directory::{ThreadDirectory, ThreadLookup, UserProfile, UserRecord};
use crate::error::{RelayError, Result};
use crate::health::{recovery_action, ProbeOutcome, RecoveryAction};
use crate::notices::Notice;
use crate::queue::PendingQueue;
use crate::settings::Settings;
use crate::spam::SpamFilter;
use crate::store::{keys, Storage};
use crate::transport::{OutgoingText, Transport, TransportError};
use crate::utils::spawn_background;
use crate::verification::{
    AnswerOutcome, BeginOutcome, CompletionOutcome, ExternalOutcome, ExternalProof, VerificationService,
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Thread was lost before the user was verified; the ids went back to
    /// the pending queue and a challenge was issued.
    Deferred,
}

#[derive(Debug, Clone)]
enum GroupTarget {
    Thread(UserProfile),
    User { user_id: i64, thread_id: i64 },
}

impl From<&User> for UserProfile {
    fn from(user: &User) -> Self {
        UserProfile {
            user_id: user.id,
            display_name: user.display_name(),
        }
    }
}

#[derive(Clone)]
pub struct RelayService {
    storage: Storage,
    transport: Arc<dyn Transport>,
    settings: Settings,
    directory: ThreadDirectory,
    verification: VerificationService,
    queue: PendingQueue,
    spam: SpamFilter,
    media: MediaGroupBuffer<GroupTarget>,
    media_debounce: Duration,
}

impl RelayService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Storage,
        transport: Arc<dyn Transport>,
        settings: Settings,
        directory: ThreadDirectory,
        verification: VerificationService,
        queue: PendingQueue,
        spam: SpamFilter,
        media_debounce: Duration,
    ) -> Self {
        Self {
            storage,
            transport,
            settings,
            directory,
            verification,
            queue,
            spam,
            media: MediaGroupBuffer::new(),
            media_debounce,
        }
    }

    pub fn verification(&self) -> &VerificationService {
        &self.verification
    }

    pub fn directory(&self) -> &ThreadDirectory {
        &self.directory
    }

    pub async fn handle_update(&self, update: Update) {
        if let Some(message) = update.message {
            self.handle_message(message).await;
        } else if let Some(callback) = update.callback_query {
            self.handle_callback(callback).await;
        } else {
            tracing::debug!(update_id = update.update_id, "ignoring update without message or callback");
        }
    }

    pub async fn handle_message(&self, message: Message) {
        match message.chat.kind {
            ChatKind::Private => {
                let Some(user) = message.from.clone() else {
                    return;
                };
                if user.is_bot {
                    return;
                }
                if let Err(err) = self.handle_private(&message, &user).await {
                    self.report(user.id, err).await;
                }
            }
            ChatKind::Group | ChatKind::Supergroup => {
                if Some(message.chat.id) != self.directory.group_chat_id().ok()
                    || message.message_thread_id.is_none()
                    || message.sent_by_bot()
                    || message.is_service()
                {
                    return;
                }
                if let Err(err) = self.handle_reply(&message).await {
                    tracing::warn!(
                        thread_id = message.message_thread_id,
                        error = %err,
                        "failed to relay reply"
                    );
                }
            }
            ChatKind::Channel | ChatKind::Other => {}
        }
    }

    async fn handle_private(&self, message: &Message, user: &User) -> Result<()> {
        let user_id = user.id;
        if self.storage.quota_exceeded().await {
            return Err(RelayError::QuotaExceeded);
        }
        if self.storage.exists(&keys::ban(user_id)).await? {
            tracing::debug!(user_id, "dropping message from banned user");
            return Ok(());
        }
        let trusted = self.storage.exists(&keys::trust(user_id)).await?;
        if !trusted && !self.settings.bot_enabled().await? {
            self.notify_user(user_id, Notice::Unavailable).await;
            return Ok(());
        }

        if message.is_command("start") {
            if trusted || self.verification.is_verified(user_id).await? {
                self.notify_user(user_id, Notice::AlreadyVerified).await;
            } else {
                self.verification.begin_or_continue(user_id, false).await?;
            }
            return Ok(());
        }

        if trusted {
            return self.deliver_to_thread(message, user).await;
        }

        if self.is_spam(message).await? {
            tracing::info!(user_id, message_id = message.message_id, "message blocked as spam");
            self.notify_user(user_id, Notice::SpamBlocked).await;
            return Ok(());
        }

        if self.verification.is_verified(user_id).await? {
            return self.deliver_to_thread(message, user).await;
        }
        self.hold_for_verification(user, message.message_id).await
    }

    async fn is_spam(&self, message: &Message) -> Result<bool> {
        let Some(text) = message.text_content() else {
            return Ok(false);
        };
        if !self.settings.spam_enabled().await? {
            return Ok(false);
        }
        let rules = self.settings.spam_rules().await?;
        Ok(match self.spam.check(text, &rules).await {
            Some(verdict) => {
                tracing::debug!(source = ?verdict.source, score = verdict.score, reason = %verdict.reason, "spam verdict");
                true
            }
            None => false,
        })
    }

    /// Buffers the message and makes sure a challenge is out. The message
    /// is queued first so a failed challenge send cannot lose it.
    async fn hold_for_verification(&self, user: &User, message_id: i64) -> Result<()> {
        let user_id = user.id;
        let queued = self.queue.enqueue(user_id, message_id).await?;
        let begun = self.verification.begin_or_continue(user_id, true).await?;
        if begun == BeginOutcome::AlreadyVerified {
            // verification finished between the checks
            return self.flush_pending(&UserProfile::from(user)).await;
        }
        if queued.duplicate {
            return Ok(());
        }
        if let Some(session) = self.verification.active_session(user_id).await? {
            if self.queue.claim_saved_notice(user_id, &session.session_id).await? {
                self.notify_user(
                    user_id,
                    Notice::MessageSaved {
                        capacity: self.queue.capacity(),
                    },
                )
                .await;
            }
        }
        Ok(())
    }

    async fn deliver_to_thread(&self, message: &Message, user: &User) -> Result<()> {
        let profile = UserProfile::from(user);
        if let Some(group_id) = &message.media_group_id {
            self.buffer_group(
                Direction::ToThread,
                user.id,
                group_id,
                message.message_id,
                GroupTarget::Thread(profile),
            );
            return Ok(());
        }
        if self.relay_to_thread(&profile, &[message.message_id]).await? == Delivery::Delivered {
            // leftovers from an earlier flush get another try
            self.flush_pending(&profile).await?;
        }
        Ok(())
    }

    /// Sends `message_ids` from the user's private chat into their thread.
    /// A thread that turns out to be missing is recovered and the send is
    /// retried once.
    pub async fn relay_to_thread(&self, profile: &UserProfile, message_ids: &[i64]) -> Result<Delivery> {
        let chat_id = self.directory.group_chat_id()?;
        let record = match self.directory.get_or_create(profile).await? {
            ThreadLookup::Ready(record) | ThreadLookup::Created(record) => record,
            ThreadLookup::Lost { stale, outcome } => {
                match self.recover(profile, stale, outcome, message_ids).await? {
                    Some(record) => record,
                    None => return Ok(Delivery::Deferred),
                }
            }
        };

        match self
            .send_into_thread(chat_id, record.thread_id, profile.user_id, message_ids)
            .await
        {
            Ok(()) => Ok(Delivery::Delivered),
            Err(err) if err.is_thread_missing() => {
                tracing::warn!(user_id = profile.user_id, thread_id = record.thread_id, "thread vanished during send");
                self.directory.health().forget(record.thread_id).await;
                let Some(record) = self
                    .recover(profile, record, ProbeOutcome::Missing, message_ids)
                    .await?
                else {
                    return Ok(Delivery::Deferred);
                };
                self.send_into_thread(chat_id, record.thread_id, profile.user_id, message_ids)
                    .await?;
                Ok(Delivery::Delivered)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Applies the recovery policy for a lost thread. `None` means the user
    /// was sent back to verification.
    async fn recover(
        &self,
        profile: &UserProfile,
        stale: UserRecord,
        outcome: ProbeOutcome,
        in_flight: &[i64],
    ) -> Result<Option<UserRecord>> {
        let user_id = profile.user_id;
        let verified = self.storage.exists(&keys::trust(user_id)).await?
            || self.verification.is_verified(user_id).await?;
        match recovery_action(outcome, verified) {
            RecoveryAction::UseExisting => Ok(Some(stale)),
            RecoveryAction::Recreate => {
                let record = self.directory.recreate(profile, stale).await?;
                let chat_id = self.directory.group_chat_id()?;
                let transport = self.transport.clone();
                let thread_id = record.thread_id;
                spawn_background("report-thread-recreated", async move {
                    transport
                        .send_text(
                            chat_id,
                            OutgoingText::html(Notice::ThreadRecreated { user_id }.thread_note())
                                .in_thread(thread_id),
                        )
                        .await
                        .map(|_| ())
                });
                Ok(Some(record))
            }
            RecoveryAction::ResetVerification => {
                tracing::warn!(user_id, ?outcome, "thread lost for unverified user; starting over");
                self.directory.remove(user_id).await?;
                self.verification.reset(user_id).await?;
                for id in in_flight {
                    self.queue.enqueue(user_id, *id).await?;
                }
                self.verification.begin_or_continue(user_id, true).await?;
                Ok(None)
            }
        }
    }

    async fn send_into_thread(
        &self,
        chat_id: i64,
        thread_id: i64,
        user_id: i64,
        message_ids: &[i64],
    ) -> std::result::Result<(), TransportError> {
        match message_ids {
            [] => Ok(()),
            [single] => {
                match self
                    .transport
                    .forward(chat_id, Some(thread_id), user_id, *single)
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(err) if err.is_forward_rejected() && !err.is_thread_missing() => {
                        tracing::debug!(user_id, error = %err, "forward refused; copying instead");
                        self.transport
                            .copy(chat_id, Some(thread_id), user_id, *single)
                            .await
                            .map(|_| ())
                    }
                    Err(err) => Err(err),
                }
            }
            many => self
                .transport
                .copy_group(chat_id, Some(thread_id), user_id, many)
                .await
                .map(|_| ()),
        }
    }

    /// Delivers everything buffered for a verified user, oldest first, and
    /// tells them how it went. Runs on verification and again after each
    /// later delivery while anything is left.
    pub async fn flush_pending(&self, profile: &UserProfile) -> Result<()> {
        let user_id = profile.user_id;
        let ids = self.queue.snapshot(user_id).await?;
        if ids.is_empty() {
            return Ok(());
        }
        let mut delivered = Vec::with_capacity(ids.len());
        let mut failed = Vec::new();
        for id in &ids {
            match self.relay_to_thread(profile, &[*id]).await {
                Ok(Delivery::Delivered) => delivered.push(*id),
                // back in verification; the rest stay queued untouched
                Ok(Delivery::Deferred) => break,
                Err(err @ (RelayError::Configuration(_) | RelayError::QuotaExceeded)) => return Err(err),
                Err(err) => {
                    tracing::warn!(user_id, message_id = *id, error = %err, "pending delivery failed");
                    failed.push(*id);
                }
            }
        }

        let settled = self.queue.settle(user_id, &delivered, &failed).await?;
        tracing::info!(
            user_id,
            delivered = settled.delivered,
            retained = settled.retained.len(),
            abandoned = settled.abandoned.len(),
            "pending queue flushed"
        );
        if settled.delivered > 0 {
            self.notify_user(
                user_id,
                Notice::Delivered {
                    count: settled.delivered,
                },
            )
            .await;
        }
        if !settled.abandoned.is_empty() {
            self.notify_user(
                user_id,
                Notice::ManualResend {
                    count: settled.abandoned.len(),
                },
            )
            .await;
        }
        Ok(())
    }

    async fn handle_reply(&self, message: &Message) -> Result<()> {
        let Some(thread_id) = message.message_thread_id else {
            return Ok(());
        };
        let Some(user_id) = self.directory.resolve_user(thread_id).await? else {
            tracing::debug!(thread_id, "reply in a thread with no known owner");
            return Ok(());
        };
        let chat_id = self.directory.group_chat_id()?;
        if let Some(group_id) = &message.media_group_id {
            self.buffer_group(
                Direction::ToUser,
                chat_id,
                group_id,
                message.message_id,
                GroupTarget::User { user_id, thread_id },
            );
            return Ok(());
        }
        self.relay_to_user(user_id, chat_id, thread_id, &[message.message_id])
            .await
    }

    async fn relay_to_user(&self, user_id: i64, chat_id: i64, thread_id: i64, message_ids: &[i64]) -> Result<()> {
        let sent = match message_ids {
            [] => return Ok(()),
            [single] => self
                .transport
                .copy(user_id, None, chat_id, *single)
                .await
                .map(|_| ()),
            many => self
                .transport
                .copy_group(user_id, None, chat_id, many)
                .await
                .map(|_| ()),
        };
        match sent {
            Ok(()) => Ok(()),
            Err(err) if err.is_user_unreachable() => {
                tracing::info!(user_id, error = %err, "user unreachable");
                self.transport
                    .send_text(
                        chat_id,
                        OutgoingText::html(Notice::UserUnreachable.thread_note()).in_thread(thread_id),
                    )
                    .await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn buffer_group(
        &self,
        direction: Direction,
        source_chat: i64,
        group_id: &str,
        message_id: i64,
        target: GroupTarget,
    ) {
        let generation = self
            .media
            .push(direction, source_chat, group_id, message_id, target);
        let this = self.clone();
        let group_id = group_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(this.media_debounce).await;
            let Some((target, ids)) =
                this.media
                    .take_if_latest(direction, source_chat, &group_id, generation)
            else {
                return;
            };
            tracing::debug!(?direction, group_id = %group_id, items = ids.len(), "flushing media group");
            let result = match target {
                GroupTarget::Thread(profile) => {
                    let outcome = match this.relay_to_thread(&profile, &ids).await {
                        Ok(Delivery::Delivered) => this.flush_pending(&profile).await,
                        Ok(Delivery::Deferred) => Ok(()),
                        Err(err) => Err(err),
                    };
                    outcome.map_err(|err| (profile.user_id, err))
                }
                GroupTarget::User { user_id, thread_id } => {
                    let outcome = match this.directory.group_chat_id() {
                        Ok(chat_id) => this.relay_to_user(user_id, chat_id, thread_id, &ids).await,
                        Err(err) => Err(err),
                    };
                    if let Err(err) = outcome {
                        tracing::warn!(user_id, error = %err, "failed to relay media group to user");
                    }
                    Ok(())
                }
            };
            if let Err((user_id, err)) = result {
                this.report(user_id, err).await;
            }
        });
    }

    pub async fn handle_callback(&self, callback: CallbackQuery) {
        let user_id = callback.from.id;
        let toast = match self.callback_action(&callback).await {
            Ok(toast) => toast,
            Err(err) => {
                let toast = err.notice().text();
                self.report(user_id, err).await;
                Some(toast)
            }
        };
        if let Err(err) = self
            .transport
            .answer_callback(&callback.id, toast.as_deref())
            .await
        {
            tracing::debug!(user_id, error = %err, "failed to acknowledge callback");
        }
    }

    /// Returns the short text shown on the pressed button, if any.
    async fn callback_action(&self, callback: &CallbackQuery) -> Result<Option<String>> {
        let user = &callback.from;
        let user_id = user.id;
        if self.storage.quota_exceeded().await {
            return Err(RelayError::QuotaExceeded);
        }
        if self.storage.exists(&keys::ban(user_id)).await? {
            return Ok(None);
        }

        match CallbackAction::parse(callback.data.as_deref()) {
            CallbackAction::Answer {
                challenge_id,
                option,
            } => match self.verification.answer(user_id, &challenge_id, &option).await? {
                AnswerOutcome::Completed(outcome) => {
                    self.after_verified(user, outcome).await?;
                    Ok(None)
                }
                AnswerOutcome::Reissued { .. } => Ok(None),
                AnswerOutcome::Stale => Ok(Some(Notice::ChallengeStale.text())),
            },
            CallbackAction::Finalize { token } => {
                match self.verification.finalize(user_id, &token).await {
                    Ok(outcome) => {
                        self.after_verified(user, outcome).await?;
                        Ok(None)
                    }
                    Err(RelayError::Validation(reason)) => {
                        tracing::info!(user_id, %reason, "finalize token rejected");
                        self.verification.begin_or_continue(user_id, false).await?;
                        Ok(Some(Notice::ChallengeStale.text()))
                    }
                    Err(err) => Err(err),
                }
            }
            CallbackAction::Refresh => {
                self.verification.refresh(user_id).await?;
                Ok(None)
            }
            CallbackAction::Unknown => Ok(None),
        }
    }

    async fn after_verified(&self, user: &User, _outcome: CompletionOutcome) -> Result<()> {
        // an empty queue makes repeated flushes harmless
        self.flush_pending(&UserProfile::from(user)).await
    }

    /// Proof posted by the external verification page. A rejected proof
    /// still leaves the user with a working challenge, but only when the
    /// caller named the user's live session; anything else is refused
    /// without touching the user.
    pub async fn handle_external_proof(
        &self,
        session_id: &str,
        user_id: i64,
        proof: ExternalProof,
    ) -> Result<ExternalOutcome> {
        // read before the callback, which drops a lapsed session
        let owns_session = self
            .verification
            .load_session(user_id)
            .await?
            .is_some_and(|session| session.session_id == session_id);
        match self
            .verification
            .external_callback(session_id, user_id, proof)
            .await
        {
            Err(RelayError::Validation(reason)) => {
                tracing::info!(user_id, %reason, "external proof refused");
                if owns_session {
                    if let Err(err) = self.verification.refresh(user_id).await {
                        tracing::warn!(user_id, error = %err, "could not re-issue challenge");
                    }
                }
                Err(RelayError::Validation(reason))
            }
            other => other,
        }
    }

    async fn notify_user(&self, user_id: i64, notice: Notice) {
        if let Err(err) = self
            .transport
            .send_text(user_id, OutgoingText::plain(notice.text()))
            .await
        {
            tracing::warn!(user_id, error = %err, "failed to notify user");
        }
    }

    /// Logs the failure and tells the user in fixed wording. Quota notices go
    /// out once per user per breaker window.
    async fn report(&self, user_id: i64, err: RelayError) {
        match &err {
            RelayError::QuotaExceeded => {
                tracing::warn!(user_id, "store quota exhausted");
                if !self.storage.breaker().should_notify(user_id) {
                    return;
                }
            }
            RelayError::Configuration(reason) => {
                tracing::error!(user_id, %reason, "relay misconfigured");
            }
            other => tracing::warn!(user_id, error = %other, "relay operation failed"),
        }
        self.notify_user(user_id, err.notice()).await;
    }
}
