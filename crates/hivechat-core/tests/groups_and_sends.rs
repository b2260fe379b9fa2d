//! Group membership, group messages and local sends
//!
//! Control operations are scripted as the other party would broadcast them;
//! the engine under test only ever sees its own account's history.

mod common;

use common::{harness, hbd};
use hivechat_core::classifier::{GROUP_CONTROL_ID, GROUP_MESSAGE_ID};
use hivechat_core::groups::payment_memo;
use hivechat_core::{
    GroupControl, GroupPayment, JoinStatus, LoopbackKeyHolder, RankMode, RequestOrigin,
    SyncError,
};

fn create(ledger: &hivechat_core::MemoryLedger, creator: &str, group_id: &str, control: GroupControl) {
    assert_eq!(control.group_id(), group_id);
    ledger.custom_json(creator, GROUP_CONTROL_ID, &control.to_json(), &["bob"]);
}

// ============================================================================
// Group membership
// ============================================================================

#[tokio::test]
async fn test_join_flow_with_creator_approval() {
    let h = harness("bob");
    create(
        &h.ledger,
        "carol",
        "rust",
        GroupControl::Create {
            group_id: "rust".into(),
            name: "Rustaceans".into(),
            auto_approve: false,
            payment: None,
        },
    );
    h.engine.sync_once().await.unwrap();
    let group = h.engine.group("rust").unwrap().unwrap();
    assert_eq!(group.creator, "carol");
    assert_eq!(group.name, "Rustaceans");

    let (request, outgoing) = h.engine.request_join("rust").unwrap();
    assert_eq!(request.status, JoinStatus::Pending);
    assert_eq!(request.origin, RequestOrigin::Optimistic);
    assert_eq!(outgoing.id, GROUP_CONTROL_ID);
    assert_eq!(outgoing.required_posting_auths, vec!["bob".to_string()]);

    // Bob broadcasts; carol approves.
    h.ledger
        .custom_json("bob", &outgoing.id, &outgoing.json, &["carol"]);
    let approve = GroupControl::Approve {
        group_id: "rust".into(),
        username: "bob".into(),
    };
    h.ledger
        .custom_json("carol", GROUP_CONTROL_ID, &approve.to_json(), &["bob"]);

    let report = h.engine.sync_once().await.unwrap();
    assert!(report.conflicts.is_empty());

    let requests = h.engine.join_requests("rust").unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].status, JoinStatus::Approved);
    assert_eq!(requests[0].origin, RequestOrigin::Confirmed);
    assert_eq!(h.engine.group("rust").unwrap().unwrap().member_count, 1);
}

#[tokio::test]
async fn test_request_join_unknown_group_fails() {
    let h = harness("bob");
    assert!(matches!(
        h.engine.request_join("nowhere"),
        Err(SyncError::GroupNotFound(_))
    ));
}

#[tokio::test]
async fn test_paid_auto_approval_overridden_by_creator() {
    let h = harness("bob");
    create(
        &h.ledger,
        "carol",
        "vip",
        GroupControl::Create {
            group_id: "vip".into(),
            name: "VIP".into(),
            auto_approve: true,
            payment: Some(GroupPayment {
                amount: hbd("1.000 HBD"),
                recurring_days: None,
            }),
        },
    );
    h.engine.sync_once().await.unwrap();

    let payment = h.engine.group_payment("vip").unwrap();
    assert_eq!(payment.to, "carol");
    assert_eq!(payment.memo, payment_memo("vip"));
    h.ledger
        .transfer("bob", "carol", &payment.amount.to_string(), &payment.memo);
    let report = h.engine.sync_once().await.unwrap();
    assert_eq!(report.control_applied, 1);
    assert!(
        h.engine.conversation("carol").unwrap().is_empty(),
        "payments are not chat messages"
    );

    let (request, _) = h.engine.request_join("vip").unwrap();
    assert_eq!(request.status, JoinStatus::AutoApproved);
    assert_eq!(request.origin, RequestOrigin::Optimistic);

    let reject = GroupControl::Reject {
        group_id: "vip".into(),
        username: "bob".into(),
    };
    h.ledger
        .custom_json("carol", GROUP_CONTROL_ID, &reject.to_json(), &["bob"]);
    let report = h.engine.sync_once().await.unwrap();

    assert_eq!(report.conflicts.len(), 1);
    let conflict = &report.conflicts[0];
    assert_eq!(conflict.local_status, JoinStatus::AutoApproved);
    assert_eq!(conflict.confirmed_status, JoinStatus::Rejected);

    let stored = &h.engine.join_requests("vip").unwrap()[0];
    assert_eq!(stored.status, JoinStatus::Rejected);
    assert_eq!(stored.origin, RequestOrigin::Confirmed);
}

#[tokio::test]
async fn test_decision_from_non_creator_is_ignored() {
    let h = harness("bob");
    create(
        &h.ledger,
        "carol",
        "g1",
        GroupControl::Create {
            group_id: "g1".into(),
            name: "g1".into(),
            auto_approve: false,
            payment: None,
        },
    );
    h.engine.sync_once().await.unwrap();
    h.engine.request_join("g1").unwrap();

    let forged = GroupControl::Approve {
        group_id: "g1".into(),
        username: "bob".into(),
    };
    h.ledger
        .custom_json("mallory", GROUP_CONTROL_ID, &forged.to_json(), &["bob"]);
    h.engine.sync_once().await.unwrap();

    assert_eq!(
        h.engine.join_requests("g1").unwrap()[0].status,
        JoinStatus::Pending
    );
}

#[tokio::test]
async fn test_rank_groups_by_mode() {
    let h = harness("bob");
    for id in ["old", "new"] {
        create(
            &h.ledger,
            "carol",
            id,
            GroupControl::Create {
                group_id: id.into(),
                name: id.into(),
                auto_approve: false,
                payment: None,
            },
        );
    }
    h.engine.sync_once().await.unwrap();

    let newest: Vec<String> = h
        .engine
        .rank_groups(RankMode::Newest)
        .unwrap()
        .into_iter()
        .map(|g| g.group_id)
        .collect();
    assert_eq!(newest, vec!["new".to_string(), "old".to_string()]);
}

// ============================================================================
// Group messages
// ============================================================================

#[tokio::test]
async fn test_group_message_lands_in_group_conversation() {
    let h = harness("bob");
    let body = serde_json::json!({"group_id": "rust", "message": "hello all"});
    h.ledger.custom_json("carol", GROUP_MESSAGE_ID, &body, &["bob"]);

    let report = h.engine.sync_once().await.unwrap();
    assert_eq!(report.messages_written, 1);
    assert!(report.conversations.contains("group:rust"));

    let messages = h.engine.group_conversation("rust").unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content.as_deref(), Some("hello all"));
    assert_eq!(messages[0].group_id.as_deref(), Some("rust"));
    assert_eq!(messages[0].amount, None);

    let summaries = h.engine.conversations().unwrap();
    assert_eq!(summaries.len(), 1);
    assert!(summaries[0].is_group);
    assert_eq!(summaries[0].peer, "rust");
}

// ============================================================================
// Local sends
// ============================================================================

#[tokio::test]
async fn test_send_is_pending_until_observed() {
    let h = harness("alice");
    h.keys.add_account("bob");
    let outgoing = h
        .engine
        .send_message("bob", "hi bob", hbd("0.001 HBD"))
        .await
        .unwrap();
    assert!(outgoing.local_id.starts_with("local:"));
    assert_eq!(outgoing.transfers.len(), 1);

    let pending = h.engine.conversation("bob").unwrap();
    assert_eq!(pending.len(), 1);
    assert!(!pending[0].confirmed);
    assert_eq!(pending[0].content.as_deref(), Some("hi bob"));

    let transfer = &outgoing.transfers[0];
    let tx_id = h.ledger.transfer(
        &transfer.from,
        &transfer.to,
        &transfer.amount.to_string(),
        &transfer.memo,
    );
    h.engine.sync_once().await.unwrap();

    let messages = h.engine.conversation("bob").unwrap();
    assert_eq!(messages.len(), 1, "pending record replaced, not duplicated");
    assert_eq!(messages[0].tx_id, tx_id);
    assert!(messages[0].confirmed);
    assert_eq!(messages[0].content.as_deref(), Some("hi bob"));
}

#[tokio::test]
async fn test_long_send_is_split_and_confirmed_as_one() {
    let config = hivechat_core::SyncConfig {
        max_memo_len: 80,
        ..Default::default()
    };
    let h = common::harness_with("alice", std::sync::Arc::new(Default::default()), config);
    let text = "x".repeat(200);
    let outgoing = h
        .engine
        .send_message("bob", &text, hbd("0.001 HBD"))
        .await
        .unwrap();
    assert!(outgoing.transfers.len() > 1);
    assert!(outgoing.transfers.iter().all(|t| t.memo.len() <= 80));

    for transfer in outgoing.transfers.iter().rev() {
        h.ledger
            .transfer("alice", "bob", &transfer.amount.to_string(), &transfer.memo);
    }
    h.engine.sync_once().await.unwrap();

    let messages = h.engine.conversation("bob").unwrap();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].confirmed);
    assert_eq!(messages[0].content.as_deref(), Some(text.as_str()));
}

#[tokio::test]
async fn test_send_fails_without_key_holder() {
    let h = harness("alice");
    h.keys.set_online(false);
    let err = h
        .engine
        .send_message("bob", "hi", hbd("0.001 HBD"))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(h.engine.conversation("bob").unwrap().is_empty());
}

#[tokio::test]
async fn test_purge_conversation_removes_only_that_peer() {
    let h = harness("bob");
    h.ledger.transfer("alice", "bob", "0.010 HBD", "a1");
    h.ledger.transfer("alice", "bob", "0.010 HBD", "a2");
    let memo = LoopbackKeyHolder::seal("carol", "bob", "c1");
    h.ledger.transfer("carol", "bob", "0.010 HBD", &memo);
    h.engine.sync_once().await.unwrap();

    assert_eq!(h.engine.purge_conversation("alice").unwrap(), 2);
    assert!(h.engine.conversation("alice").unwrap().is_empty());
    assert_eq!(h.engine.conversation("carol").unwrap().len(), 1);
}
