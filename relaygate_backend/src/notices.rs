//! Every string an end user can see. Error paths pick one of these; raw error
//! detail only goes to the log.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Maintenance,
    TryAgainLater,
    QuotaExceeded,
    Unavailable,
    InvalidRequest,
    QuizPrompt { prompt: String },
    WebChallengePrompt,
    ChallengeActive,
    ChallengeRateLimited,
    ChallengeRenewed,
    IncorrectAnswer { prompt: String },
    ChallengeStale,
    FinalizePrompt,
    Verified,
    AlreadyVerified,
    MessageSaved { capacity: usize },
    Delivered { count: usize },
    ManualResend { count: usize },
    SpamBlocked,
    ThreadRecreated { user_id: i64 },
    ThreadHeader { user_id: i64, display_name: String },
    UserUnreachable,
}

impl Notice {
    pub fn text(&self) -> String {
        match self {
            Notice::Maintenance => {
                "The service is under maintenance. Please try again later.".to_string()
            }
            Notice::TryAgainLater => {
                "Something went wrong while delivering your message. Please try again in a moment."
                    .to_string()
            }
            Notice::QuotaExceeded => {
                "The service has reached its daily limit. Your message could not be processed; please try again tomorrow."
                    .to_string()
            }
            Notice::Unavailable => "The service is temporarily unavailable.".to_string(),
            Notice::InvalidRequest => "Invalid request.".to_string(),
            Notice::QuizPrompt { prompt } => {
                format!("Please verify you are human before chatting.\n\n{prompt}")
            }
            Notice::WebChallengePrompt => {
                "Please verify you are human before chatting. Open the verification page with the button below."
                    .to_string()
            }
            Notice::ChallengeActive => {
                "You already have a verification challenge open. Please complete it first."
                    .to_string()
            }
            Notice::ChallengeRateLimited => {
                "Too many verification attempts. Please wait a few minutes and try again."
                    .to_string()
            }
            Notice::ChallengeRenewed => {
                "Your previous verification expired, so here is a new one.".to_string()
            }
            Notice::IncorrectAnswer { prompt } => {
                format!("Incorrect answer, a new question has been issued.\n\n{prompt}")
            }
            Notice::ChallengeStale => "This challenge is no longer valid.".to_string(),
            Notice::FinalizePrompt => {
                "Verification passed. Tap the button below to finish.".to_string()
            }
            Notice::Verified => "Verification complete. You can now send messages.".to_string(),
            Notice::AlreadyVerified => "You are already verified.".to_string(),
            Notice::MessageSaved { capacity } => format!(
                "Your message has been saved and will be delivered once you pass verification (up to {capacity} messages are kept)."
            ),
            Notice::Delivered { count } => {
                format!("{count} saved message(s) delivered.")
            }
            Notice::ManualResend { count } => format!(
                "{count} saved message(s) could not be delivered. Please send them again."
            ),
            Notice::SpamBlocked => {
                "Your message was flagged as spam and was not delivered.".to_string()
            }
            Notice::ThreadRecreated { user_id } => {
                format!("The conversation thread for user {user_id} was lost and has been recreated.")
            }
            Notice::ThreadHeader {
                user_id,
                display_name,
            } => format!("New conversation with {display_name} (id {user_id})."),
            Notice::UserUnreachable => {
                "Message not delivered: the user has blocked the bot or is unreachable.".to_string()
            }
        }
    }

    /// HTML note posted into a thread for the people answering there.
    pub fn thread_note(&self) -> String {
        format!("<b>relay</b>\n{}", escape_html(&self.text()))
    }
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_notes_escape_user_supplied_names() {
        let note = Notice::ThreadHeader {
            user_id: 7,
            display_name: "<script> & co".into(),
        }
        .thread_note();
        assert_eq!(
            note,
            "<b>relay</b>\nNew conversation with &lt;script&gt; &amp; co (id 7)."
        );
    }
}
