mod common;

use common::{
    callback, harness, private_album_item, private_text, thread_reply, Call, Harness, GROUP,
};
use futures_util::future::join_all;
use relaygate_backend::directory::{ThreadLookup, UserProfile};
use relaygate_backend::notices::Notice;
use relaygate_backend::relay::Delivery;
use relaygate_backend::spam::SpamRules;
use relaygate_backend::store::keys;
use relaygate_backend::verification::CompletionOutcome;
use std::collections::HashSet;
use std::time::Duration;

const USER: i64 = 5_001;

async fn pass_current_challenge(h: &Harness, user_id: i64) {
    let challenge = h.current_challenge(user_id);
    let data = h.answer_data(&challenge, true).await;
    h.send(callback(user_id, &data)).await;
}

fn profile(user_id: i64) -> UserProfile {
    UserProfile {
        user_id,
        display_name: format!("User {user_id}"),
    }
}

fn count_of(texts: &[String], wanted: &str) -> usize {
    texts.iter().filter(|text| text.as_str() == wanted).count()
}

#[tokio::test]
async fn second_start_does_not_issue_another_challenge() {
    let h = harness();
    h.send(private_text(USER, 1, "/start")).await;
    h.send(private_text(USER, 2, "/start")).await;

    assert_eq!(h.transport.keyboards_to(USER).len(), 1);
    let first = h.current_challenge(USER);
    assert!(h.quiz(&first).await.prompt.starts_with("What is"));
}

#[tokio::test]
async fn wrong_answer_reissues_once_and_burns_the_old_challenge() {
    let h = harness();
    h.send(private_text(USER, 1, "/start")).await;
    let original = h.current_challenge(USER);
    let wrong = h.answer_data(&original, false).await;

    h.send(callback(USER, &wrong)).await;

    let incorrect_prefix = "Incorrect answer, a new question has been issued.";
    let texts = h.transport.texts_to(USER);
    assert_eq!(
        texts.iter().filter(|text| text.starts_with(incorrect_prefix)).count(),
        1
    );
    let replacement = h.current_challenge(USER);
    assert_ne!(replacement, original);

    // The old id is gone; pressing it again changes nothing.
    let sent_before = h.transport.texts_to(USER).len();
    h.send(callback(USER, &wrong)).await;
    assert_eq!(h.transport.texts_to(USER).len(), sent_before);
    assert_eq!(h.current_challenge(USER), replacement);
    let session = h
        .services
        .relay
        .verification()
        .active_session(USER)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.challenge_id(), Some(replacement.as_str()));
}

#[tokio::test]
async fn queued_messages_are_delivered_in_order_after_verification() {
    let h = harness();
    for (id, text) in [(11, "first"), (12, "second"), (13, "third")] {
        h.send(private_text(USER, id, text)).await;
    }

    // Nothing reaches the group while the user is unverified.
    assert!(h.transport.delivered_from(USER).is_empty());
    assert_eq!(h.transport.created_threads(), 0);
    let saved = Notice::MessageSaved { capacity: 10 }.text();
    assert_eq!(
        h.transport.texts_to(USER).iter().filter(|text| **text == saved).count(),
        1
    );
    assert_eq!(h.transport.keyboards_to(USER).len(), 1);

    let challenge = h.current_challenge(USER);
    let data = h.answer_data(&challenge, true).await;
    h.send(callback(USER, &data)).await;

    assert_eq!(h.transport.delivered_from(USER), vec![11, 12, 13]);
    let delivered = Notice::Delivered { count: 3 }.text();
    assert_eq!(
        h.transport.texts_to(USER).iter().filter(|text| **text == delivered).count(),
        1
    );
    assert!(h.services.relay.verification().is_verified(USER).await.unwrap());
    assert!(h.services.storage.get(&keys::pending(USER)).await.unwrap().is_none());
}

#[tokio::test]
async fn repeated_completion_does_not_flush_twice() {
    let h = harness();
    h.send(private_text(USER, 21, "hello")).await;
    let challenge = h.current_challenge(USER);
    let data = h.answer_data(&challenge, true).await;

    h.send(callback(USER, &data)).await;
    h.send(callback(USER, &data)).await;
    let again = h.services.relay.verification().complete(USER).await.unwrap();

    assert_eq!(again, CompletionOutcome::AlreadyVerified);
    assert_eq!(h.transport.delivered_from(USER), vec![21]);
    assert_eq!(h.transport.created_threads(), 1);
}

#[tokio::test]
async fn verified_messages_are_forwarded_into_one_thread() {
    let h = harness();
    h.verify(USER).await;
    h.send(private_text(USER, 30, "one")).await;
    h.send(private_text(USER, 31, "two")).await;

    assert_eq!(h.transport.delivered_from(USER), vec![30, 31]);
    assert_eq!(h.transport.created_threads(), 1);
    let record = h.services.relay.directory().get(USER).await.unwrap().unwrap();
    assert_eq!(record.title, format!("User {USER} | {USER}"));
    assert_eq!(
        h.services.relay.directory().resolve_user(record.thread_id).await.unwrap(),
        Some(USER)
    );
}

#[tokio::test]
async fn protected_content_is_copied_instead_of_forwarded() {
    let h = harness();
    h.verify(USER).await;
    h.transport.mark_protected(USER);
    h.send(private_text(USER, 40, "secret")).await;

    assert!(h
        .transport
        .calls()
        .iter()
        .any(|call| matches!(call, Call::Copy { to_chat: GROUP, message_id: 40, .. })));
}

#[tokio::test]
async fn redirected_thread_is_recreated_for_verified_user() {
    let h = harness();
    h.verify(USER).await;
    h.send(private_text(USER, 50, "before")).await;
    let stale = h.services.relay.directory().get(USER).await.unwrap().unwrap();

    h.transport.mark_redirected(stale.thread_id);
    h.services.relay.directory().health().forget(stale.thread_id).await;
    h.send(private_text(USER, 51, "after")).await;

    let fresh = h.services.relay.directory().get(USER).await.unwrap().unwrap();
    assert_ne!(fresh.thread_id, stale.thread_id);
    let storage = &h.services.storage;
    assert!(storage.get(&keys::thread_index(stale.thread_id)).await.unwrap().is_none());
    assert_eq!(
        storage.get(&keys::thread_index(fresh.thread_id)).await.unwrap(),
        Some(USER.to_string())
    );
    assert!(h.transport.calls().iter().any(|call| matches!(
        call,
        Call::Forward { thread_id: Some(tid), message_id: 51, .. } if *tid == fresh.thread_id
    )));
}

#[tokio::test]
async fn vanished_thread_is_recreated_and_the_send_retried() {
    let h = harness();
    h.verify(USER).await;
    h.send(private_text(USER, 60, "first")).await;
    let stale = h.services.relay.directory().get(USER).await.unwrap().unwrap();

    // Still marked healthy, so the failure only shows up on send.
    h.transport.mark_missing(stale.thread_id);
    h.send(private_text(USER, 61, "second")).await;

    let fresh = h.services.relay.directory().get(USER).await.unwrap().unwrap();
    assert_ne!(fresh.thread_id, stale.thread_id);
    assert_eq!(h.transport.delivered_from(USER), vec![60, 61]);
}

#[tokio::test]
async fn spam_from_verified_user_is_blocked() {
    let h = harness();
    h.verify(USER).await;
    h.services
        .settings
        .set_spam_rules(SpamRules {
            block_keywords: vec!["foo".into()],
            max_links: 2,
            ..SpamRules::default()
        })
        .await
        .unwrap();

    h.send(private_text(USER, 70, "foo bar")).await;
    h.send(private_text(USER, 71, "see https://a.example and https://b.example")).await;
    h.send(private_text(USER, 72, "see https://a.example only")).await;

    assert_eq!(h.transport.delivered_from(USER), vec![72]);
    let blocked = Notice::SpamBlocked.text();
    assert_eq!(
        h.transport.texts_to(USER).iter().filter(|text| **text == blocked).count(),
        2
    );
}

#[tokio::test]
async fn spam_from_unverified_user_is_not_queued() {
    let h = harness();
    h.services
        .settings
        .set_spam_rules(SpamRules {
            block_keywords: vec!["casino".into()],
            ..SpamRules::default()
        })
        .await
        .unwrap();

    h.send(private_text(USER, 80, "best casino bonus")).await;

    assert!(h.transport.keyboards_to(USER).is_empty());
    assert!(h.services.storage.get(&keys::pending(USER)).await.unwrap().is_none());
}

#[tokio::test]
async fn banned_users_are_ignored() {
    let h = harness();
    h.services.admin.ban(USER).await.unwrap();
    h.send(private_text(USER, 90, "hello")).await;
    assert!(h.transport.calls().is_empty());
}

#[tokio::test]
async fn trusted_users_skip_verification() {
    let h = harness();
    h.services.admin.trust(USER).await.unwrap();
    h.send(private_text(USER, 95, "hello")).await;
    assert_eq!(h.transport.delivered_from(USER), vec![95]);
    assert!(h.transport.keyboards_to(USER).is_empty());
}

#[tokio::test]
async fn disabled_bot_answers_with_unavailable_notice() {
    let h = harness();
    h.services.settings.set_bot_enabled(false).await.unwrap();
    h.send(private_text(USER, 100, "hello")).await;
    assert_eq!(h.transport.texts_to(USER), vec![Notice::Unavailable.text()]);
}

#[tokio::test]
async fn replies_in_a_thread_reach_the_user() {
    let h = harness();
    h.verify(USER).await;
    h.send(private_text(USER, 110, "question")).await;
    let record = h.services.relay.directory().get(USER).await.unwrap().unwrap();

    h.send(thread_reply(record.thread_id, 500, false)).await;
    h.send(thread_reply(record.thread_id, 501, true)).await;

    let copies: Vec<_> = h
        .transport
        .calls()
        .into_iter()
        .filter(|call| matches!(call, Call::Copy { to_chat: USER, .. }))
        .collect();
    assert_eq!(
        copies,
        vec![Call::Copy {
            to_chat: USER,
            thread_id: None,
            from_chat: GROUP,
            message_id: 500,
        }]
    );
}

#[tokio::test]
async fn unreachable_user_is_reported_in_the_thread() {
    let h = harness();
    h.verify(USER).await;
    h.send(private_text(USER, 120, "question")).await;
    let record = h.services.relay.directory().get(USER).await.unwrap().unwrap();

    h.transport.mark_unreachable(USER);
    h.send(thread_reply(record.thread_id, 600, false)).await;

    let notice = Notice::UserUnreachable.thread_note();
    assert!(h.transport.calls().iter().any(|call| matches!(
        call,
        Call::SendText { chat_id: GROUP, thread_id: Some(tid), text, .. }
            if *tid == record.thread_id && *text == notice
    )));
}

#[tokio::test]
async fn albums_are_relayed_as_one_group() {
    let h = harness();
    h.verify(USER).await;
    h.send(private_album_item(USER, 131, "album-1")).await;
    h.send(private_album_item(USER, 130, "album-1")).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let groups: Vec<_> = h
        .transport
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::CopyGroup { to_chat: GROUP, message_ids, .. } => Some(message_ids),
            _ => None,
        })
        .collect();
    assert_eq!(groups, vec![vec![130, 131]]);
}

#[tokio::test]
async fn wipe_user_starts_verification_over() {
    let h = harness();
    h.verify(USER).await;
    h.services.admin.wipe_user(USER).await.unwrap();

    h.transport.clear_calls();
    h.send(private_text(USER, 140, "back again")).await;

    assert!(h.transport.delivered_from(USER).is_empty());
    assert_eq!(h.transport.keyboards_to(USER).len(), 1);
}

#[tokio::test]
async fn retained_message_goes_out_with_the_next_delivery() {
    let h = harness();
    h.transport.mark_undeliverable(12);
    h.send(private_text(USER, 11, "first")).await;
    h.send(private_text(USER, 12, "second")).await;
    pass_current_challenge(&h, USER).await;

    assert_eq!(h.transport.delivered_from(USER), vec![11]);
    assert_eq!(h.pending(USER).await, vec![12]);

    h.transport.mark_deliverable(12);
    h.send(private_text(USER, 13, "third")).await;

    assert_eq!(h.transport.delivered_from(USER), vec![11, 13, 12]);
    assert!(h.pending(USER).await.is_empty());
    let texts = h.transport.texts_to(USER);
    assert_eq!(count_of(&texts, &Notice::Delivered { count: 1 }.text()), 2);
    assert_eq!(count_of(&texts, &Notice::ManualResend { count: 1 }.text()), 0);
}

#[tokio::test]
async fn message_failing_twice_asks_for_a_manual_resend() {
    let h = harness();
    h.transport.mark_undeliverable(12);
    h.send(private_text(USER, 11, "first")).await;
    h.send(private_text(USER, 12, "second")).await;
    pass_current_challenge(&h, USER).await;

    // second failure happens on the flush after this delivery
    h.send(private_text(USER, 13, "third")).await;
    h.send(private_text(USER, 14, "fourth")).await;

    assert_eq!(h.transport.delivered_from(USER), vec![11, 13, 14]);
    assert!(h.pending(USER).await.is_empty());
    let failures = h.services.storage.get(&keys::pending_failures(USER)).await.unwrap();
    assert!(failures.is_none());
    let texts = h.transport.texts_to(USER);
    assert_eq!(count_of(&texts, &Notice::ManualResend { count: 1 }.text()), 1);
}

#[tokio::test]
async fn message_is_kept_when_the_challenge_cannot_be_sent() {
    let h = harness();
    h.transport.mark_unreachable(USER);
    h.send(private_text(USER, 15, "hello")).await;

    assert!(h.transport.keyboards_to(USER).is_empty());
    assert_eq!(h.pending(USER).await, vec![15]);

    h.transport.mark_reachable(USER);
    h.send(private_text(USER, 16, "/start")).await;
    pass_current_challenge(&h, USER).await;

    assert_eq!(h.transport.delivered_from(USER), vec![15]);
}

#[tokio::test]
async fn quota_notice_is_sent_once_per_window() {
    let h = harness();
    h.services.storage.breaker().trip(Duration::from_secs(3600));

    h.send(private_text(USER, 1, "one")).await;
    h.send(private_text(USER, 2, "two")).await;
    h.send(private_text(USER, 3, "three")).await;

    let texts = h.transport.texts_to(USER);
    assert_eq!(texts.len(), 1);
    assert_eq!(count_of(&texts, &Notice::QuotaExceeded.text()), 1);
    assert!(h.transport.keyboards_to(USER).is_empty());
    assert!(h.transport.delivered_from(USER).is_empty());

    // a new window tells the user again
    h.services.storage.breaker().reset();
    h.services.storage.breaker().trip(Duration::from_secs(3600));
    h.send(private_text(USER, 4, "four")).await;
    assert_eq!(count_of(&h.transport.texts_to(USER), &Notice::QuotaExceeded.text()), 2);
}

#[tokio::test]
async fn lost_thread_without_verification_sends_the_user_back() {
    let h = harness();
    h.verify(USER).await;
    h.send(private_text(USER, 50, "before")).await;
    let stale = h.services.relay.directory().get(USER).await.unwrap().unwrap();

    // verification lapsed while the thread was deleted by hand
    h.services
        .storage
        .delete_many([keys::verified(USER), keys::grace(USER)])
        .await
        .unwrap();
    h.transport.mark_missing(stale.thread_id);

    let delivery = h
        .services
        .relay
        .relay_to_thread(&profile(USER), &[51])
        .await
        .unwrap();

    assert_eq!(delivery, Delivery::Deferred);
    assert!(h.services.relay.directory().get(USER).await.unwrap().is_none());
    assert!(h
        .services
        .storage
        .get(&keys::thread_index(stale.thread_id))
        .await
        .unwrap()
        .is_none());
    assert_eq!(h.pending(USER).await, vec![51]);
    assert_eq!(h.transport.keyboards_to(USER).len(), 2);
    assert_eq!(h.transport.delivered_from(USER), vec![50]);
    assert_eq!(h.transport.created_threads(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_lookups_create_one_thread() {
    let h = harness();
    let directory = h.services.relay.directory().clone();
    let lookups = (0..8).map(|_| {
        let directory = directory.clone();
        tokio::spawn(async move { directory.get_or_create(&profile(USER)).await })
    });

    let threads: HashSet<i64> = join_all(lookups)
        .await
        .into_iter()
        .map(|joined| match joined.unwrap().unwrap() {
            ThreadLookup::Ready(record) | ThreadLookup::Created(record) => record.thread_id,
            other => panic!("unexpected lookup {other:?}"),
        })
        .collect();

    assert_eq!(threads.len(), 1);
    assert_eq!(h.transport.created_threads(), 1);
    let stored = h.services.relay.directory().get(USER).await.unwrap().unwrap();
    assert!(threads.contains(&stored.thread_id));
}
