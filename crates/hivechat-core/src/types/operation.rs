//! Typed ledger operations
//!
//! An [`Operation`] is one entry of an account's append-only history, already
//! decoded from the wire shape returned by the ledger RPC. Operations are
//! immutable once observed; `op_index` is the per-account sequence number used
//! as the sync watermark.

use serde::{Deserialize, Serialize};

use super::Amount;

/// Kind of ledger operation hivechat understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Transfer,
    CustomJson,
}

/// Value transfer with an optional memo
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub amount: Amount,
    pub memo: String,
}

/// Arbitrary tagged metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomJson {
    /// Application tag (e.g. `hivechat-group`)
    pub id: String,
    /// Parsed JSON body
    pub json: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationPayload {
    Transfer(Transfer),
    CustomJson(CustomJson),
}

/// One decoded entry of an account's ledger history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Strictly increasing per-account sequence number
    pub op_index: u64,
    pub block_num: u64,
    /// Transaction id (primary key of derived messages)
    pub tx_id: String,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    pub from: String,
    /// Recipient for transfers; optional target account for custom_json
    pub to: Option<String>,
    pub payload: OperationPayload,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self.payload {
            OperationPayload::Transfer(_) => OperationKind::Transfer,
            OperationPayload::CustomJson(_) => OperationKind::CustomJson,
        }
    }

    pub fn as_transfer(&self) -> Option<&Transfer> {
        match &self.payload {
            OperationPayload::Transfer(t) => Some(t),
            OperationPayload::CustomJson(_) => None,
        }
    }

    pub fn as_custom_json(&self) -> Option<&CustomJson> {
        match &self.payload {
            OperationPayload::CustomJson(c) => Some(c),
            OperationPayload::Transfer(_) => None,
        }
    }

    /// Whether `username` is the sender or the recipient.
    pub fn involves(&self, username: &str) -> bool {
        self.from.eq_ignore_ascii_case(username)
            || self
                .to
                .as_deref()
                .is_some_and(|to| to.eq_ignore_ascii_case(username))
    }
}
