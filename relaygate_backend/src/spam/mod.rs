//! Pre-relay spam screening: deterministic rules first, then an optional
//! model-backed classifier.

pub mod classifier;
pub mod rules;

pub use classifier::{Classification, LlmClassifier, TextClassifier};
pub use rules::{CompiledRules, RuleVerdict, SpamRules};

use crate::utils::truncate_chars;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictSource {
    Rules,
    Model,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpamVerdict {
    pub source: VerdictSource,
    pub score: f32,
    pub reason: String,
}

#[derive(Clone)]
pub struct SpamFilter {
    classifier: Option<Arc<dyn TextClassifier>>,
    compiled: Arc<Mutex<Option<(SpamRules, Arc<CompiledRules>)>>>,
}

impl SpamFilter {
    pub fn new(classifier: Option<Arc<dyn TextClassifier>>) -> Self {
        Self {
            classifier,
            compiled: Arc::new(Mutex::new(None)),
        }
    }

    /// `Some` when the text should be dropped. Classifier failures never
    /// block delivery.
    pub async fn check(&self, text: &str, rules: &SpamRules) -> Option<SpamVerdict> {
        if text.trim().is_empty() {
            return None;
        }
        match self.compiled_for(rules).evaluate(text) {
            RuleVerdict::Allowed => return None,
            RuleVerdict::Spam { reason, score } => {
                return Some(SpamVerdict {
                    source: VerdictSource::Rules,
                    score,
                    reason,
                })
            }
            RuleVerdict::NoMatch => {}
        }

        let classifier = self.classifier.as_ref().filter(|_| rules.ai.enabled)?;
        let sample = truncate_chars(text, rules.ai.max_chars.max(1));
        match classifier.classify(sample).await {
            Ok(result) if result.is_spam && result.confidence >= rules.ai.threshold => {
                Some(SpamVerdict {
                    source: VerdictSource::Model,
                    score: result.confidence,
                    reason: result.category,
                })
            }
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(error = ?err, "spam classifier failed; letting message through");
                None
            }
        }
    }

    fn compiled_for(&self, rules: &SpamRules) -> Arc<CompiledRules> {
        let mut guard = self.compiled.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((source, compiled)) = guard.as_ref() {
            if source == rules {
                return compiled.clone();
            }
        }
        let compiled = Arc::new(CompiledRules::compile(rules));
        *guard = Some((rules.clone(), compiled.clone()));
        compiled
    }
}
