//! In-chat arithmetic quiz.

use super::provider::{AttemptOutcome, ChallengeProvider, ExternalProof, IssuedChallenge};
use super::session::VerificationSession;
use super::ProviderKind;
use crate::error::{RelayError, Result};
use crate::notices::Notice;
use crate::store::{keys, Storage};
use crate::transport::{InlineButton, InlineKeyboard};
use crate::utils::now_unix;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const OPTION_COUNT: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizChallenge {
    pub user_id: i64,
    pub session_id: String,
    pub prompt: String,
    pub options: Vec<i64>,
    pub correct_index: usize,
    pub created_at: i64,
}

/// Builds a question with one correct option and distinct distractors.
pub fn generate_quiz<R: Rng + ?Sized>(rng: &mut R) -> (String, Vec<i64>, usize) {
    let (prompt, answer) = if rng.random_bool(0.5) {
        let a = rng.random_range(2..=20);
        let b = rng.random_range(2..=20);
        (format!("What is {a} + {b}?"), a + b)
    } else {
        let a = rng.random_range(2..=9);
        let b = rng.random_range(2..=9);
        (format!("What is {a} × {b}?"), a * b)
    };

    let mut options = vec![answer];
    while options.len() < OPTION_COUNT {
        let offset = rng.random_range(1..=9);
        let candidate = if rng.random_bool(0.5) {
            answer + offset
        } else {
            answer - offset
        };
        if candidate > 0 && !options.contains(&candidate) {
            options.push(candidate);
        }
    }
    options.shuffle(rng);
    let correct_index = options
        .iter()
        .position(|option| *option == answer)
        .unwrap_or_default();
    (prompt, options, correct_index)
}

pub fn answer_callback_data(challenge_id: &str, option: usize) -> String {
    format!("q:{challenge_id}:{option}")
}

#[derive(Clone)]
pub struct QuizProvider {
    storage: Storage,
    challenge_ttl: Duration,
}

impl QuizProvider {
    pub fn new(storage: Storage, challenge_ttl: Duration) -> Self {
        Self {
            storage,
            challenge_ttl,
        }
    }
}

#[async_trait]
impl ChallengeProvider for QuizProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Quiz
    }

    async fn issue_challenge(&self, session: &VerificationSession) -> Result<IssuedChallenge> {
        let (prompt, options, correct_index) = generate_quiz(&mut rand::rng());
        let challenge_id = uuid::Uuid::new_v4().simple().to_string();
        let record = QuizChallenge {
            user_id: session.user_id,
            session_id: session.session_id.clone(),
            prompt: prompt.clone(),
            options: options.clone(),
            correct_index,
            created_at: now_unix(),
        };
        self.storage
            .put_json(&keys::challenge(&challenge_id), &record, Some(self.challenge_ttl))
            .await?;

        let buttons = options
            .iter()
            .enumerate()
            .map(|(idx, option)| {
                InlineButton::callback(option.to_string(), answer_callback_data(&challenge_id, idx))
            })
            .collect();
        Ok(IssuedChallenge {
            challenge_id,
            notice: Notice::QuizPrompt { prompt },
            keyboard: InlineKeyboard::single_row(buttons),
        })
    }

    async fn validate_attempt(
        &self,
        session: &VerificationSession,
        challenge_id: &str,
        answer: &str,
    ) -> Result<AttemptOutcome> {
        if session.challenge_id() != Some(challenge_id) {
            return Ok(AttemptOutcome::Stale);
        }
        // a malformed press leaves the challenge usable
        let chosen: usize = answer
            .trim()
            .parse()
            .map_err(|_| RelayError::Validation(format!("bad quiz answer {answer:?}")))?;
        let key = keys::challenge(challenge_id);
        let Some(record) = self.storage.get_json::<QuizChallenge>(&key).await? else {
            return Ok(AttemptOutcome::Stale);
        };
        if record.user_id != session.user_id || record.session_id != session.session_id {
            return Ok(AttemptOutcome::Stale);
        }
        let ttl = self.challenge_ttl.as_secs() as i64;
        if now_unix() >= record.created_at + ttl {
            self.storage.delete(&key).await?;
            return Ok(AttemptOutcome::Stale);
        }
        // one attempt per challenge
        self.storage.delete(&key).await?;
        if chosen == record.correct_index {
            Ok(AttemptOutcome::Passed)
        } else {
            Ok(AttemptOutcome::Failed)
        }
    }

    async fn on_external_callback(
        &self,
        _session: &VerificationSession,
        _proof: &ExternalProof,
    ) -> Result<AttemptOutcome> {
        Err(RelayError::Validation(
            "quiz sessions do not accept external proofs".into(),
        ))
    }

    async fn discard(&self, challenge_id: &str) -> Result<()> {
        self.storage.delete(&keys::challenge(challenge_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::database::Database;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn generated_quiz_has_one_correct_distinct_option() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let (prompt, options, correct) = generate_quiz(&mut rng);
            assert!(prompt.starts_with("What is "));
            assert_eq!(options.len(), OPTION_COUNT);
            let mut deduped = options.clone();
            deduped.sort_unstable();
            deduped.dedup();
            assert_eq!(deduped.len(), OPTION_COUNT);
            assert!(options.iter().all(|option| *option > 0));
            assert!(correct < OPTION_COUNT);
        }
    }

    #[tokio::test]
    async fn a_challenge_accepts_exactly_one_attempt() {
        let storage = Storage::sqlite(Database::open_in_memory().unwrap(), &StoreConfig::default());
        let provider = QuizProvider::new(storage.clone(), Duration::from_secs(300));
        let mut session = VerificationSession::new(9, ProviderKind::Quiz, now_unix());
        let issued = provider.issue_challenge(&session).await.unwrap();
        session.challenge = Some(super::super::session::ChallengeState {
            challenge_id: issued.challenge_id.clone(),
            issued_at: now_unix(),
            prompt_message_id: None,
        });

        let record: QuizChallenge = storage
            .get_json(&keys::challenge(&issued.challenge_id))
            .await
            .unwrap()
            .unwrap();
        let answer = record.correct_index.to_string();

        assert_eq!(
            provider
                .validate_attempt(&session, &issued.challenge_id, &answer)
                .await
                .unwrap(),
            AttemptOutcome::Passed
        );
        assert_eq!(
            provider
                .validate_attempt(&session, &issued.challenge_id, &answer)
                .await
                .unwrap(),
            AttemptOutcome::Stale
        );
    }

    #[tokio::test]
    async fn answers_for_other_challenges_are_stale() {
        let storage = Storage::sqlite(Database::open_in_memory().unwrap(), &StoreConfig::default());
        let provider = QuizProvider::new(storage, Duration::from_secs(300));
        let session = VerificationSession::new(9, ProviderKind::Quiz, now_unix());
        let issued = provider.issue_challenge(&session).await.unwrap();
        // session never recorded this challenge as current
        assert_eq!(
            provider
                .validate_attempt(&session, &issued.challenge_id, "0")
                .await
                .unwrap(),
            AttemptOutcome::Stale
        );
    }

    #[tokio::test]
    async fn malformed_answer_keeps_the_challenge_alive() {
        let storage = Storage::sqlite(Database::open_in_memory().unwrap(), &StoreConfig::default());
        let provider = QuizProvider::new(storage.clone(), Duration::from_secs(300));
        let mut session = VerificationSession::new(9, ProviderKind::Quiz, now_unix());
        let issued = provider.issue_challenge(&session).await.unwrap();
        session.challenge = Some(super::super::session::ChallengeState {
            challenge_id: issued.challenge_id.clone(),
            issued_at: now_unix(),
            prompt_message_id: None,
        });

        let err = provider
            .validate_attempt(&session, &issued.challenge_id, "not-a-number")
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));

        let record: QuizChallenge = storage
            .get_json(&keys::challenge(&issued.challenge_id))
            .await
            .unwrap()
            .expect("challenge survives a malformed press");
        assert_eq!(
            provider
                .validate_attempt(&session, &issued.challenge_id, &record.correct_index.to_string())
                .await
                .unwrap(),
            AttemptOutcome::Passed
        );
    }
}
