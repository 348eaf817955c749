//! Logical key layout.
//!
//! Ban records, trust records and global settings keep their logical key as
//! the physical key so they survive a bulk wipe. Every other key is stored
//! under [`DATA_PREFIX`], which turns "wipe everything" into a single prefix
//! scan.

use std::borrow::Cow;

pub const DATA_PREFIX: &str = "data:";

const PERMANENT_PREFIXES: &[&str] = &["ban:", "trust:", "setting:"];

pub const USER_PREFIX: &str = "user:";

pub fn is_permanent(logical: &str) -> bool {
    PERMANENT_PREFIXES
        .iter()
        .any(|prefix| logical.starts_with(prefix))
}

pub fn to_physical(logical: &str) -> Cow<'_, str> {
    if is_permanent(logical) {
        Cow::Borrowed(logical)
    } else {
        Cow::Owned(format!("{DATA_PREFIX}{logical}"))
    }
}

pub fn to_logical(physical: &str) -> &str {
    physical.strip_prefix(DATA_PREFIX).unwrap_or(physical)
}

pub fn user(user_id: i64) -> String {
    format!("{USER_PREFIX}{user_id}")
}

pub fn thread_index(thread_id: i64) -> String {
    format!("thread:{thread_id}")
}

pub fn thread_ok(thread_id: i64) -> String {
    format!("thread_ok:{thread_id}")
}

pub fn verified(user_id: i64) -> String {
    format!("verified:{user_id}")
}

pub fn grace(user_id: i64) -> String {
    format!("grace:{user_id}")
}

pub fn session(user_id: i64) -> String {
    format!("session:{user_id}")
}

pub fn challenge(challenge_id: &str) -> String {
    format!("challenge:{challenge_id}")
}

pub fn session_starts(user_id: i64) -> String {
    format!("session_starts:{user_id}")
}

pub fn notice_cooldown(user_id: i64) -> String {
    format!("notice_cooldown:{user_id}")
}

pub fn pending(user_id: i64) -> String {
    format!("pending:{user_id}")
}

pub fn pending_notice(user_id: i64) -> String {
    format!("pending_notice:{user_id}")
}

pub fn pending_failures(user_id: i64) -> String {
    format!("pending_failures:{user_id}")
}

pub fn ban(user_id: i64) -> String {
    format!("ban:{user_id}")
}

pub fn trust(user_id: i64) -> String {
    format!("trust:{user_id}")
}

pub fn setting(name: &str) -> String {
    format!("setting:{name}")
}
