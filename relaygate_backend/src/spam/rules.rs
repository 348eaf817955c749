use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

pub const LINK_SCORE: f32 = 0.7;
pub const REGEX_SCORE: f32 = 0.85;
pub const KEYWORD_SCORE: f32 = 0.9;

/// Global filter configuration, stored as one versioned JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpamRules {
    pub version: u32,
    pub allow_keywords: Vec<String>,
    pub allow_regex: Vec<String>,
    #[serde(alias = "keywords")]
    pub block_keywords: Vec<String>,
    #[serde(alias = "regex")]
    pub block_regex: Vec<String>,
    /// Messages with at least this many links are spam. Zero disables the rule.
    pub max_links: usize,
    pub ai: AiRules,
}

impl Default for SpamRules {
    fn default() -> Self {
        Self {
            version: 1,
            allow_keywords: Vec::new(),
            allow_regex: Vec::new(),
            block_keywords: Vec::new(),
            block_regex: Vec::new(),
            max_links: 3,
            ai: AiRules::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiRules {
    pub enabled: bool,
    /// Minimum model confidence required to call a message spam.
    pub threshold: f32,
    /// Characters of text sent to the model.
    pub max_chars: usize,
}

impl Default for AiRules {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.8,
            max_chars: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleVerdict {
    /// An allow rule matched; nothing else is consulted.
    Allowed,
    Spam { reason: String, score: f32 },
    NoMatch,
}

/// [`SpamRules`] with every pattern compiled. Invalid patterns are dropped
/// with a warning.
#[derive(Debug)]
pub struct CompiledRules {
    pub version: u32,
    allow_keywords: Vec<String>,
    allow_regex: Vec<Regex>,
    block_keywords: Vec<String>,
    block_regex: Vec<Regex>,
    max_links: usize,
}

impl CompiledRules {
    pub fn compile(rules: &SpamRules) -> Self {
        Self {
            version: rules.version,
            allow_keywords: lowercase_all(&rules.allow_keywords),
            allow_regex: compile_all(&rules.allow_regex),
            block_keywords: lowercase_all(&rules.block_keywords),
            block_regex: compile_all(&rules.block_regex),
            max_links: rules.max_links,
        }
    }

    pub fn evaluate(&self, text: &str) -> RuleVerdict {
        let lowered = text.to_lowercase();
        if self
            .allow_keywords
            .iter()
            .any(|keyword| lowered.contains(keyword.as_str()))
            || self.allow_regex.iter().any(|re| re.is_match(text))
        {
            return RuleVerdict::Allowed;
        }

        if self.max_links > 0 {
            let links = link_pattern().find_iter(text).count();
            if links >= self.max_links {
                return RuleVerdict::Spam {
                    reason: format!("{links} links"),
                    score: LINK_SCORE,
                };
            }
        }

        if let Some(keyword) = self
            .block_keywords
            .iter()
            .find(|keyword| lowered.contains(keyword.as_str()))
        {
            return RuleVerdict::Spam {
                reason: format!("keyword {keyword:?}"),
                score: KEYWORD_SCORE,
            };
        }

        if let Some(re) = self.block_regex.iter().find(|re| re.is_match(text)) {
            return RuleVerdict::Spam {
                reason: format!("pattern {:?}", re.as_str()),
                score: REGEX_SCORE,
            };
        }

        RuleVerdict::NoMatch
    }
}

fn lowercase_all(words: &[String]) -> Vec<String> {
    words
        .iter()
        .map(|word| word.trim().to_lowercase())
        .filter(|word| !word.is_empty())
        .collect()
}

fn compile_all(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| {
            match RegexBuilder::new(pattern)
                .case_insensitive(true)
                .size_limit(1 << 20)
                .build()
            {
                Ok(re) => Some(re),
                Err(err) => {
                    tracing::warn!(pattern = %pattern, error = %err, "skipping invalid spam pattern");
                    None
                }
            }
        })
        .collect()
}

fn link_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(?:https?://|www\.|t\.me/)\S+").expect("valid link pattern"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(json: &str) -> CompiledRules {
        let rules: SpamRules = serde_json::from_str(json).unwrap();
        CompiledRules::compile(&rules)
    }

    #[test]
    fn link_threshold_is_inclusive() {
        let compiled = rules(r#"{"max_links": 2, "keywords": ["foo"]}"#);
        assert_eq!(
            compiled.evaluate("see https://a.example"),
            RuleVerdict::NoMatch
        );
        assert!(matches!(
            compiled.evaluate("see https://a.example and www.b.example"),
            RuleVerdict::Spam { .. }
        ));
    }

    #[test]
    fn block_keyword_flags_regardless_of_links() {
        let compiled = rules(r#"{"max_links": 2, "keywords": ["foo"]}"#);
        assert_eq!(
            compiled.evaluate("foo bar"),
            RuleVerdict::Spam {
                reason: "keyword \"foo\"".into(),
                score: KEYWORD_SCORE
            }
        );
        assert!(matches!(compiled.evaluate("FOO"), RuleVerdict::Spam { .. }));
    }

    #[test]
    fn allow_rules_override_block_rules() {
        let compiled = rules(
            r#"{"max_links": 1, "keywords": ["foo"], "allow_keywords": ["invoice"]}"#,
        );
        assert_eq!(
            compiled.evaluate("foo invoice https://x.example"),
            RuleVerdict::Allowed
        );
    }

    #[test]
    fn zero_max_links_disables_link_rule() {
        let compiled = rules(r#"{"max_links": 0}"#);
        assert_eq!(
            compiled.evaluate("https://a https://b https://c"),
            RuleVerdict::NoMatch
        );
    }

    #[test]
    fn invalid_regex_is_skipped_not_fatal() {
        let compiled = rules(r#"{"regex": ["(unclosed", "cheap\\s+pills"]}"#);
        assert!(matches!(
            compiled.evaluate("Cheap   pills here"),
            RuleVerdict::Spam { score, .. } if score == REGEX_SCORE
        ));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let parsed: SpamRules = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed, SpamRules::default());
    }
}
