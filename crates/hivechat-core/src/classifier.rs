//! Operation classification
//!
//! Routes each ledger operation to the handler that owns it. Classification is
//! a pure function of the operation and the viewing account.
//!
//! | Operation | Condition | Class |
//! |-----------|-----------|-------|
//! | transfer | memo `hivechat-group-pay:<id>`, viewer involved | `GroupControl` |
//! | transfer | viewer is `to` / `from` | `Direct` incoming / outgoing |
//! | custom_json | id `hivechat-group-msg` | `GroupMessage` |
//! | custom_json | id `hivechat-group` | `GroupControl` |
//! | anything else | | `Unrelated` |

use serde::{Deserialize, Serialize};

use crate::types::{Operation, OperationPayload};

/// custom_json id of messages posted to a group
pub const GROUP_MESSAGE_ID: &str = "hivechat-group-msg";
/// custom_json id of group lifecycle operations
pub const GROUP_CONTROL_ID: &str = "hivechat-group";
/// Memo prefix marking a transfer as a group membership payment
pub const GROUP_PAYMENT_MEMO_PREFIX: &str = "hivechat-group-pay:";

/// Which side of a direct message the viewer is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationClass {
    Direct { direction: Direction },
    GroupMessage,
    GroupControl,
    Unrelated,
}

/// Group id of a payment memo, if the memo is one.
pub fn group_payment_target(memo: &str) -> Option<&str> {
    memo.strip_prefix(GROUP_PAYMENT_MEMO_PREFIX)
        .map(str::trim)
        .filter(|id| !id.is_empty())
}

/// Classify `op` from the point of view of `viewer`.
pub fn classify(op: &Operation, viewer: &str) -> OperationClass {
    match &op.payload {
        OperationPayload::Transfer(transfer) => {
            let incoming = op
                .to
                .as_deref()
                .is_some_and(|to| to.eq_ignore_ascii_case(viewer));
            let outgoing = op.from.eq_ignore_ascii_case(viewer);

            if !incoming && !outgoing {
                return OperationClass::Unrelated;
            }
            if group_payment_target(&transfer.memo).is_some() {
                return OperationClass::GroupControl;
            }
            // A transfer to oneself reads as outgoing.
            let direction = if outgoing {
                Direction::Outgoing
            } else {
                Direction::Incoming
            };
            OperationClass::Direct { direction }
        }
        OperationPayload::CustomJson(custom) => match custom.id.as_str() {
            GROUP_MESSAGE_ID => OperationClass::GroupMessage,
            GROUP_CONTROL_ID => OperationClass::GroupControl,
            _ => OperationClass::Unrelated,
        },
    }
}
