//! End-to-end sync tests against an in-memory ledger
//!
//! Each test scripts a ledger history, runs the engine for one account and
//! checks the resulting cache.

mod common;

use std::sync::Arc;

use common::{harness, harness_over, harness_with, hbd, FailingBackend, FlakyMinimums};
use hivechat_core::chunks::split_payload;
use hivechat_core::{
    DecryptFailure, LoopbackKeyHolder, MemoryLedger, MessageCache, SyncConfig, SyncCursor,
    SyncEvent,
};

// ============================================================================
// Direct messages
// ============================================================================

#[tokio::test]
async fn test_encrypted_message_reaches_recipient() {
    let h = harness("bob");
    let memo = LoopbackKeyHolder::seal("alice", "bob", "hello");
    let tx_id = h.ledger.transfer("alice", "bob", "0.010 HBD", &memo);

    let report = h.engine.sync_once().await.unwrap();
    assert_eq!(report.messages_written, 1);
    assert_eq!(report.cursor, Some(0));

    let messages = h.engine.conversation("alice").unwrap();
    assert_eq!(messages.len(), 1);
    let msg = &messages[0];
    assert_eq!(msg.tx_id, tx_id);
    assert_eq!(msg.content.as_deref(), Some("hello"));
    assert_eq!(msg.encrypted_payload, memo);
    assert_eq!(msg.amount, Some(hbd("0.010 HBD")));
    assert!(msg.is_decrypted);
    assert!(msg.confirmed);
    assert_eq!(msg.conversation_key, "alice|bob");
}

#[tokio::test]
async fn test_plain_memo_needs_no_key_holder() {
    let h = harness("bob");
    h.keys.set_online(false);
    h.ledger.transfer("alice", "bob", "0.010 HBD", "hi bob");

    h.engine.sync_once().await.unwrap();
    let messages = h.engine.conversation("alice").unwrap();
    assert_eq!(messages[0].content.as_deref(), Some("hi bob"));
    assert_eq!(h.keys.decrypt_calls(), 0);
}

#[tokio::test]
async fn test_resync_is_idempotent() {
    let h = harness("bob");
    for i in 0..5 {
        let memo = LoopbackKeyHolder::seal("alice", "bob", &format!("msg {}", i));
        h.ledger.transfer("alice", "bob", "0.010 HBD", &memo);
    }

    h.engine.sync_once().await.unwrap();
    let first = h.engine.conversation("alice").unwrap();
    assert_eq!(first.len(), 5);

    // Nothing new: no batches at all.
    let report = h.engine.sync_once().await.unwrap();
    assert_eq!(report.batches, 0);

    // Replaying from scratch rewrites the same records.
    SyncCursor::new(h.state.clone()).reset("bob").unwrap();
    h.engine.sync_once().await.unwrap();
    assert_eq!(h.engine.conversation("alice").unwrap(), first);
}

#[tokio::test]
async fn test_messages_ordered_when_provider_pages_are_reversed() {
    let ledger = Arc::new(MemoryLedger::new());
    ledger.set_reverse_pages(true);
    for i in 0..12 {
        ledger.transfer("alice", "bob", "0.010 HBD", &format!("m{:02}", i));
    }

    let config = SyncConfig {
        page_limit: 5,
        ..SyncConfig::default()
    };
    let h = harness_with("bob", ledger, config);
    let report = h.engine.sync_once().await.unwrap();
    assert_eq!(report.batches, 3);
    assert_eq!(report.cursor, Some(11));

    let contents: Vec<String> = h
        .engine
        .conversation("alice")
        .unwrap()
        .into_iter()
        .filter_map(|m| m.content)
        .collect();
    let expected: Vec<String> = (0..12).map(|i| format!("m{:02}", i)).collect();
    assert_eq!(contents, expected);
}

#[tokio::test]
async fn test_unrelated_operations_are_skipped() {
    let h = harness("bob");
    h.ledger
        .custom_json("bob", "follow", &serde_json::json!({"what": ["blog"]}), &[]);
    h.ledger.transfer("alice", "bob", "0.010 HBD", "hi");

    let report = h.engine.sync_once().await.unwrap();
    assert_eq!(report.unrelated, 1);
    assert_eq!(report.messages_written, 1);
    assert_eq!(report.cursor, Some(1));
}

// ============================================================================
// Decryption failures
// ============================================================================

#[tokio::test]
async fn test_decrypt_failure_is_stored_and_retried() {
    let h = harness("bob");
    h.keys.set_online(false);
    let memo = LoopbackKeyHolder::seal("alice", "bob", "later");
    h.ledger.transfer("alice", "bob", "0.010 HBD", &memo);

    let report = h.engine.sync_once().await.unwrap();
    assert_eq!(report.decrypt_failures, 1);
    assert_eq!(report.cursor, Some(0), "a decrypt failure does not hold the cursor");

    let msg = &h.engine.conversation("alice").unwrap()[0];
    assert!(!msg.is_decrypted);
    assert_eq!(msg.decrypt_error, Some(DecryptFailure::KeyHolderUnavailable));

    h.keys.set_online(true);
    assert_eq!(h.engine.retry_decryption().await.unwrap(), 1);
    let msg = &h.engine.conversation("alice").unwrap()[0];
    assert_eq!(msg.content.as_deref(), Some("later"));
    assert!(msg.decrypt_error.is_none());
    assert!(h.cache.undecrypted().unwrap().is_empty());
}

#[tokio::test]
async fn test_wrong_key_failure_is_recorded() {
    let h = harness("bob");
    // Sealed for someone else but delivered to bob's history.
    let memo = LoopbackKeyHolder::seal("alice", "carol", "not for bob");
    h.ledger.transfer("alice", "bob", "0.010 HBD", &memo);

    h.engine.sync_once().await.unwrap();
    let msg = &h.engine.conversation("alice").unwrap()[0];
    assert_eq!(msg.decrypt_error, Some(DecryptFailure::WrongKey));
    assert_eq!(h.engine.retry_decryption().await.unwrap(), 0);
}

// ============================================================================
// Chunked memos
// ============================================================================

fn chunked_memo(plaintext: &str, session: &str, max_len: usize) -> (String, Vec<String>) {
    let memo = LoopbackKeyHolder::seal("alice", "bob", plaintext);
    let pieces = split_payload(session, &memo, max_len);
    (memo, pieces)
}

#[tokio::test]
async fn test_chunks_out_of_order_reassemble_once() {
    let h = harness("bob");
    let plaintext = "a long message that will not fit into a single memo field";
    let (memo, pieces) = chunked_memo(plaintext, "s1", 64);
    assert!(pieces.len() >= 3);

    let mut order: Vec<usize> = (0..pieces.len()).collect();
    order.reverse();
    for i in &order {
        h.ledger.transfer("alice", "bob", "0.010 HBD", &pieces[*i]);
    }

    let report = h.engine.sync_once().await.unwrap();
    assert_eq!(report.messages_written, 1);
    assert_eq!(report.chunks_pending, pieces.len() - 1);

    let messages = h.engine.conversation("alice").unwrap();
    assert_eq!(messages.len(), 1);
    let msg = &messages[0];
    assert_eq!(msg.encrypted_payload, memo);
    assert_eq!(msg.content.as_deref(), Some(plaintext));
    assert_eq!(msg.session_id.as_deref(), Some("s1"));
    assert_eq!(msg.chunk_count, Some(pieces.len() as u32));
    assert_eq!(
        msg.amount.map(|a| a.micro),
        Some(10_000 * pieces.len() as u64)
    );
    assert!(h.engine.incomplete_chunk_sets().unwrap().is_empty());
}

#[tokio::test]
async fn test_partial_chunk_set_waits_across_syncs() {
    let h = harness("bob");
    let (_, pieces) = chunked_memo("split across two sync passes for sure", "s2", 64);
    let (first, rest) = pieces.split_at(1);

    h.ledger.transfer("alice", "bob", "0.010 HBD", &first[0]);
    h.engine.sync_once().await.unwrap();
    assert!(h.engine.conversation("alice").unwrap().is_empty());

    let open = h.engine.incomplete_chunk_sets().unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].session_id, "s2");
    assert_eq!(open[0].received, vec![0]);
    assert_eq!(open[0].missing().len(), rest.len());

    for piece in rest {
        h.ledger.transfer("alice", "bob", "0.010 HBD", piece);
    }
    h.engine.sync_once().await.unwrap();
    let messages = h.engine.conversation("alice").unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(
        messages[0].content.as_deref(),
        Some("split across two sync passes for sure")
    );
}

#[tokio::test]
async fn test_duplicate_chunk_after_completion_is_ignored() {
    let h = harness("bob");
    let (_, pieces) = chunked_memo("duplicates must not resurrect chunk sets", "s3", 64);
    for piece in &pieces {
        h.ledger.transfer("alice", "bob", "0.010 HBD", piece);
    }
    h.engine.sync_once().await.unwrap();

    h.ledger.transfer("alice", "bob", "0.010 HBD", &pieces[0]);
    let report = h.engine.sync_once().await.unwrap();
    assert_eq!(report.messages_written, 0);
    assert_eq!(h.engine.conversation("alice").unwrap().len(), 1);
    assert!(h.engine.incomplete_chunk_sets().unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_chunk_header_is_dropped() {
    let h = harness("bob");
    h.ledger
        .transfer("alice", "bob", "0.010 HBD", "hivechat-chunk:s9:x:2:abc");
    h.ledger.transfer("alice", "bob", "0.010 HBD", "still here");

    let report = h.engine.sync_once().await.unwrap();
    assert_eq!(report.invalid_chunks, 1);
    assert_eq!(report.cursor, Some(1));
    assert_eq!(h.engine.conversation("alice").unwrap().len(), 1);
}

// ============================================================================
// Spam filter
// ============================================================================

#[tokio::test]
async fn test_below_minimum_is_filtered_then_released_by_exception() {
    let h = harness("bob");
    h.ledger.set_minimum("bob", hbd("0.005 HBD"));
    h.ledger.transfer("mallory", "bob", "0.001 HBD", "buy now");
    h.ledger.transfer("alice", "bob", "0.005 HBD", "hi");

    let report = h.engine.sync_once().await.unwrap();
    assert_eq!(report.filtered, 1);
    assert!(h.engine.conversation("mallory").unwrap().is_empty());
    assert_eq!(h.engine.conversation("alice").unwrap().len(), 1);

    let filtered = h.engine.filtered().unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].operation.from, "mallory");
    assert_eq!(filtered[0].minimum, hbd("0.005 HBD"));

    assert_eq!(h.engine.add_exception("mallory").await.unwrap(), 1);
    assert!(h.engine.filtered().unwrap().is_empty());
    let released = h.engine.conversation("mallory").unwrap();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].content.as_deref(), Some("buy now"));

    // Later messages from an exception skip the minimum.
    h.ledger.transfer("mallory", "bob", "0.001 HBD", "again");
    h.engine.sync_once().await.unwrap();
    assert_eq!(h.engine.conversation("mallory").unwrap().len(), 2);

    assert!(h.engine.remove_exception("mallory").unwrap());
    h.ledger.transfer("mallory", "bob", "0.001 HBD", "third");
    let report = h.engine.sync_once().await.unwrap();
    assert_eq!(report.filtered, 1);
}

#[tokio::test]
async fn test_outgoing_transfers_bypass_minimum() {
    let h = harness("bob");
    h.ledger.set_minimum("bob", hbd("1.000 HBD"));
    h.ledger.transfer("bob", "alice", "0.001 HBD", "cheap reply");

    let report = h.engine.sync_once().await.unwrap();
    assert_eq!(report.filtered, 0);
    assert_eq!(h.engine.conversation("alice").unwrap().len(), 1);
}

#[tokio::test]
async fn test_unverified_admission_reevaluated_once_minimum_is_known() {
    let ledger = Arc::new(MemoryLedger::new());
    let client = Arc::new(FlakyMinimums::new(ledger.clone()));
    let h = harness_over(
        "bob",
        ledger.clone(),
        client.clone(),
        MessageCache::in_memory(),
        SyncConfig::default(),
    );

    client.set_minimums_online(false);
    ledger.transfer("alice", "bob", "0.002 HBD", "cheap");
    ledger.transfer("carol", "bob", "0.020 HBD", "generous");
    h.engine.sync_once().await.unwrap();

    let unverified = h.cache.unverified().unwrap();
    assert_eq!(unverified.len(), 2);

    // Still unknown: nothing changes.
    let outcome = h.engine.reevaluate_unverified().await.unwrap();
    assert_eq!(outcome.verified + outcome.filtered, 0);

    ledger.set_minimum("bob", hbd("0.010 HBD"));
    client.set_minimums_online(true);
    let outcome = h.engine.reevaluate_unverified().await.unwrap();
    assert_eq!(outcome.verified, 1);
    assert_eq!(outcome.filtered, 1);

    assert!(h.engine.conversation("alice").unwrap().is_empty());
    let kept = h.engine.conversation("carol").unwrap();
    assert!(!kept[0].spam_unverified);
    assert_eq!(h.engine.filtered().unwrap()[0].operation.from, "alice");
}

// ============================================================================
// Backfill window
// ============================================================================

#[tokio::test]
async fn test_backlog_of_exactly_max_backfill_is_fetched_fully() {
    let ledger = Arc::new(MemoryLedger::new());
    let config = SyncConfig {
        max_backfill: 20,
        page_limit: 7,
        ..SyncConfig::default()
    };
    let h = harness_with("bob", ledger.clone(), config);
    ledger.transfer("alice", "bob", "0.010 HBD", "seed");
    h.engine.sync_once().await.unwrap();

    for i in 0..20 {
        ledger.transfer("alice", "bob", "0.010 HBD", &format!("n{}", i));
    }
    let report = h.engine.sync_once().await.unwrap();
    assert!(!report.gap_exceeded);
    assert_eq!(report.messages_written, 20);
    assert_eq!(report.cursor, Some(20));
}

#[tokio::test]
async fn test_backlog_beyond_max_backfill_reports_gap() {
    let ledger = Arc::new(MemoryLedger::new());
    let config = SyncConfig {
        max_backfill: 20,
        page_limit: 7,
        ..SyncConfig::default()
    };
    let h = harness_with("bob", ledger.clone(), config);
    ledger.transfer("alice", "bob", "0.010 HBD", "seed");
    h.engine.sync_once().await.unwrap();
    let mut events = h.engine.subscribe_events();

    for i in 0..21 {
        ledger.transfer("alice", "bob", "0.010 HBD", &format!("n{}", i));
    }
    let report = h.engine.sync_once().await.unwrap();
    assert!(report.gap_exceeded);
    assert_eq!(report.messages_written, 20);
    assert_eq!(report.cursor, Some(21));

    let mut gap = None;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::GapExceeded {
            cursor,
            head,
            skipped_through,
            ..
        } = event
        {
            gap = Some((cursor, head, skipped_through));
        }
    }
    assert_eq!(gap, Some((Some(0), 21, 1)));
    // "n0" sat at op_index 1 and was skipped.
    let contents: Vec<_> = h
        .engine
        .conversation("alice")
        .unwrap()
        .into_iter()
        .filter_map(|m| m.content)
        .collect();
    assert!(!contents.contains(&"n0".to_string()));
    assert!(contents.contains(&"n20".to_string()));
}

#[tokio::test]
async fn test_first_sync_takes_recent_window() {
    let ledger = Arc::new(MemoryLedger::new());
    for i in 0..30 {
        ledger.transfer("alice", "bob", "0.010 HBD", &format!("n{}", i));
    }
    let config = SyncConfig {
        max_backfill: 10,
        ..SyncConfig::default()
    };
    let h = harness_with("bob", ledger, config);

    let report = h.engine.sync_once().await.unwrap();
    assert!(!report.gap_exceeded);
    assert_eq!(report.messages_written, 10);
    assert_eq!(report.cursor, Some(29));
}

// ============================================================================
// Atomicity
// ============================================================================

#[tokio::test]
async fn test_failed_commit_leaves_cursor_and_cache_untouched() {
    let ledger = Arc::new(MemoryLedger::new());
    let backend = Arc::new(FailingBackend::new());
    let cache = MessageCache::with_backend(backend.clone());
    let h = harness_over("bob", ledger.clone(), ledger.clone(), cache, SyncConfig::default());

    ledger.transfer("alice", "bob", "0.010 HBD", "one");
    ledger.transfer("alice", "bob", "0.010 HBD", "two");

    backend.set_failing(true);
    assert!(h.engine.sync_once().await.is_err());
    assert_eq!(h.engine.cursor().unwrap(), None);
    assert!(h.engine.conversation("alice").unwrap().is_empty());

    backend.set_failing(false);
    let report = h.engine.sync_once().await.unwrap();
    assert_eq!(report.messages_written, 2);
    assert_eq!(h.engine.cursor().unwrap(), Some(1));
}

#[tokio::test]
async fn test_provider_outage_mid_backfill_keeps_committed_pages() {
    let ledger = Arc::new(MemoryLedger::new());
    let config = SyncConfig {
        page_limit: 2,
        ..SyncConfig::default()
    };
    let h = harness_with("bob", ledger.clone(), config);
    for i in 0..4 {
        ledger.transfer("alice", "bob", "0.010 HBD", &format!("n{}", i));
    }
    h.engine.sync_once().await.unwrap();

    ledger.set_available(false);
    ledger.transfer("alice", "bob", "0.010 HBD", "queued");
    assert!(h.engine.sync_once().await.is_err());
    assert_eq!(h.engine.cursor().unwrap(), Some(3));

    ledger.set_available(true);
    h.engine.sync_once().await.unwrap();
    assert_eq!(h.engine.cursor().unwrap(), Some(4));
    assert_eq!(h.engine.conversation("alice").unwrap().len(), 5);
}

#[tokio::test]
async fn test_state_survives_reopen_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(MemoryLedger::new());
    ledger.transfer("alice", "bob", "0.010 HBD", "persisted");
    let keys = Arc::new(LoopbackKeyHolder::new(["bob"]));

    {
        let engine = hivechat_core::SyncEngine::open(
            "bob",
            ledger.clone(),
            keys.clone(),
            dir.path(),
            SyncConfig::default(),
        )
        .unwrap();
        engine.sync_once().await.unwrap();
    }

    let engine =
        hivechat_core::SyncEngine::open("bob", ledger, keys, dir.path(), SyncConfig::default())
            .unwrap();
    assert_eq!(engine.cursor().unwrap(), Some(0));
    let messages = engine.conversation("alice").unwrap();
    assert_eq!(messages[0].content.as_deref(), Some("persisted"));
}
