//! Cached message records
//!
//! A [`Message`] is the derived, query-ready form of one conversation entry.
//! It is created on first sighting of the originating operation (possibly
//! still encrypted) and mutated in place when decryption succeeds, more
//! chunks arrive or ledger confirmation is observed.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{Amount, Operation, GROUP_CONVERSATION_PREFIX};
use crate::error::DecryptFailure;

/// A cached conversation entry, keyed by transaction id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Transaction id (`local:<ulid>` for not yet confirmed outgoing messages)
    pub tx_id: String,
    /// Ledger sequence number of the originating operation
    pub op_index: Option<u64>,
    /// Multi-part session this record belongs to
    pub session_id: Option<String>,
    pub chunk_index: Option<u32>,
    pub chunk_count: Option<u32>,
    pub conversation_key: String,
    /// Set for messages posted to a group
    pub group_id: Option<String>,
    pub from: String,
    /// Recipient username, or the group id for group messages
    pub to: String,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Payload exactly as observed on the ledger (or reassembled)
    pub encrypted_payload: String,
    /// Plaintext once decoded
    pub content: Option<String>,
    /// Structured fields when the plaintext is a JSON object
    pub decoded_fields: Option<serde_json::Value>,
    /// SHA-256 of the payload, used to match local sends with confirmations
    pub hash: Option<String>,
    pub amount: Option<Amount>,
    pub is_decrypted: bool,
    pub decrypt_error: Option<DecryptFailure>,
    /// Observed on the ledger
    pub confirmed: bool,
    /// Admitted on a default minimum that has not been verified yet
    pub spam_unverified: bool,
}

impl Message {
    /// Build the initial, not yet decrypted record for a ledger operation.
    pub fn observed(
        op: &Operation,
        conversation_key: String,
        to: String,
        payload: String,
        amount: Option<Amount>,
    ) -> Self {
        Self {
            tx_id: op.tx_id.clone(),
            op_index: Some(op.op_index),
            session_id: None,
            chunk_index: None,
            chunk_count: None,
            conversation_key,
            group_id: None,
            from: op.from.clone(),
            to,
            timestamp: op.timestamp,
            hash: Some(payload_hash(&payload)),
            encrypted_payload: payload,
            content: None,
            decoded_fields: None,
            amount,
            is_decrypted: false,
            decrypt_error: None,
            confirmed: true,
            spam_unverified: false,
        }
    }

    /// Whether this record is an intermediate chunk rather than a full message.
    pub fn is_chunk(&self) -> bool {
        self.session_id.is_some() && self.chunk_index.is_some()
    }

    pub fn is_group(&self) -> bool {
        self.group_id.is_some()
    }

    pub fn is_mine(&self, viewer: &str) -> bool {
        self.from.eq_ignore_ascii_case(viewer)
    }

    /// Record a successful decode.
    pub fn set_plaintext(&mut self, plaintext: String) {
        self.decoded_fields = serde_json::from_str::<serde_json::Value>(&plaintext)
            .ok()
            .filter(|v| v.is_object());
        self.content = Some(plaintext);
        self.is_decrypted = true;
        self.decrypt_error = None;
    }

    /// Record a failed decode, leaving any earlier plaintext untouched.
    pub fn set_decrypt_error(&mut self, failure: DecryptFailure) {
        if !self.is_decrypted {
            self.decrypt_error = Some(failure);
        }
    }
}

/// Hex SHA-256 of a payload string.
pub fn payload_hash(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}

/// Why an operation was kept out of the conversation view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterReason {
    /// The transfer amount was below the recipient's minimum
    BelowMinimum,
}

/// An operation rejected by the spam filter, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilteredRecord {
    pub operation: Operation,
    pub reason: FilterReason,
    /// Minimum in effect when the decision was made
    pub minimum: Amount,
    /// Unix timestamp in milliseconds
    pub filtered_at: i64,
}

/// Aggregated view of one conversation for listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_key: String,
    /// Other participant, or the group id
    pub peer: String,
    pub is_group: bool,
    pub message_count: usize,
    pub undecrypted_count: usize,
    pub unconfirmed_count: usize,
    /// Timestamp of the newest message
    pub last_activity: i64,
    pub last_message: Option<String>,
}

impl ConversationSummary {
    /// Derive the peer name shown for a conversation key from the viewer's side.
    pub fn peer_for(conversation_key: &str, viewer: &str) -> (String, bool) {
        if let Some(group_id) = conversation_key.strip_prefix(GROUP_CONVERSATION_PREFIX) {
            return (group_id.to_string(), true);
        }
        let viewer = viewer.to_ascii_lowercase();
        let peer = match conversation_key.split_once('|') {
            Some((a, b)) if a == viewer => b,
            Some((a, _)) => a,
            None => conversation_key,
        };
        (peer.to_string(), false)
    }

    /// Last message truncated to `max_len` characters.
    pub fn preview(&self, max_len: usize) -> Option<String> {
        self.last_message.as_ref().map(|m| {
            if m.chars().count() > max_len {
                format!("{}...", m.chars().take(max_len).collect::<String>())
            } else {
                m.clone()
            }
        })
    }
}
