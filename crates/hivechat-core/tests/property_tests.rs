//! Property-based tests for reassembly, planning, amounts and conversation keys

mod common;

use proptest::prelude::*;

use hivechat_core::chunks::{parse_chunk, split_payload};
use hivechat_core::{
    compute_backfill_plan, conversation_key, Amount, Asset, ConversationSummary, LoopbackKeyHolder,
};

// ============================================================================
// Strategy Generators
// ============================================================================

fn message_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9 .,!?éü]{1,300}").expect("valid regex")
}

/// A chunked message plus a delivery order for its pieces
fn delivery_strategy() -> impl Strategy<Value = (String, Vec<usize>)> {
    message_strategy().prop_flat_map(|text| {
        let memo = LoopbackKeyHolder::seal("alice", "bob", &text);
        let count = split_payload("sess", &memo, 64).len();
        let order: Vec<usize> = (0..count).collect();
        (Just(text), Just(order).prop_shuffle())
    })
}

fn account_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9.-]{2,15}").expect("valid regex")
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Chunks arriving in any order produce exactly one message with the
    /// original plaintext.
    #[test]
    fn chunk_delivery_order_is_irrelevant((text, order) in delivery_strategy()) {
        let rt = runtime();
        rt.block_on(async {
            let h = common::harness("bob");
            let memo = LoopbackKeyHolder::seal("alice", "bob", &text);
            let pieces = split_payload("sess", &memo, 64);
            for i in &order {
                h.ledger.transfer("alice", "bob", "0.010 HBD", &pieces[*i]);
            }
            h.engine.sync_once().await.unwrap();

            let messages = h.engine.conversation("alice").unwrap();
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].content.as_deref(), Some(text.as_str()));
            assert!(h.engine.incomplete_chunk_sets().unwrap().is_empty());
        });
    }

    /// Splitting then parsing every piece rebuilds the payload within the size limit.
    #[test]
    fn split_pieces_fit_and_rejoin(payload in "[ -~]{1,2000}", max_len in 64usize..400) {
        let memos = split_payload("01hz", &payload, max_len);
        prop_assert!(memos.iter().all(|m| m.len() <= max_len));
        if memos.len() == 1 {
            prop_assert_eq!(&memos[0], &payload);
        } else {
            let mut rebuilt = String::new();
            for (i, memo) in memos.iter().enumerate() {
                let header = parse_chunk(memo).unwrap().unwrap();
                prop_assert_eq!(header.index as usize, i);
                prop_assert_eq!(header.count as usize, memos.len());
                rebuilt.push_str(&header.piece);
            }
            prop_assert_eq!(rebuilt, payload);
        }
    }

    /// A plan never covers more than `max_backfill` positions and always ends at the head.
    #[test]
    fn backfill_plan_is_bounded(
        cursor in prop::option::of(0u64..5000),
        head in 0u64..5000,
        max in 1u64..2000,
    ) {
        match compute_backfill_plan(cursor, Some(head), max) {
            None => prop_assert!(cursor.is_some_and(|c| c >= head)),
            Some(plan) => {
                prop_assert_eq!(plan.through, head);
                prop_assert!(plan.span() <= max);
                prop_assert!(plan.start <= plan.through);
                if let Some(c) = cursor {
                    prop_assert_eq!(plan.gap_exceeded, head - c > max);
                    if !plan.gap_exceeded {
                        prop_assert_eq!(plan.start, c + 1);
                    }
                }
            }
        }
    }

    /// Amounts print back to a string that parses to the same value.
    #[test]
    fn amount_display_parses_back(micro in 0u64..10_000_000_000, hive in any::<bool>()) {
        let asset = if hive { Asset::Hive } else { Asset::Hbd };
        let amount = Amount::new(micro, asset);
        let parsed: Amount = amount.to_string().parse().unwrap();
        prop_assert_eq!(parsed, amount);
    }

    /// Both parties derive the same key, and each sees the other as the peer.
    #[test]
    fn conversation_key_is_symmetric(a in account_strategy(), b in account_strategy()) {
        let key = conversation_key(&a, &b);
        prop_assert_eq!(&key, &conversation_key(&b, &a));
        prop_assert_eq!(ConversationSummary::peer_for(&key, &a), (b.clone(), false));
        prop_assert_eq!(ConversationSummary::peer_for(&key, &b), (a.clone(), false));
    }
}
