//! Message records and their secondary indexes
//!
//! ## Storage Design
//!
//! - **Primary table**: `messages`, keyed by tx_id
//! - **Conversation index**: ordered by timestamp then op_index, full messages only
//! - **Timestamp index**: global time range queries, full messages only
//! - **Session index**: chunk records of incomplete multi-part sessions
//! - **Pending hash index**: unconfirmed local sends, matched on confirmation
//!
//! Index entries are derived from the record being written; replacing a
//! record first removes the entries of its previous version.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{sortable_ts, sortable_u64, CacheTxn, MessageCache, Table};
use crate::error::SyncResult;
use crate::types::{ConversationSummary, FilteredRecord, Message};

/// A multi-part session that has been reassembled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedSession {
    pub session_id: String,
    /// tx_id of the reassembled message (chunk 0's transaction)
    pub tx_id: String,
    pub completed_at: i64,
}

/// Filters for [`MessageCache::query`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationQuery {
    pub conversation_key: Option<String>,
    /// Inclusive lower bound, Unix milliseconds
    pub since: Option<i64>,
    /// Exclusive upper bound, Unix milliseconds
    pub until: Option<i64>,
    pub only_undecrypted: bool,
    pub limit: Option<usize>,
}

fn conversation_index_key(msg: &Message) -> String {
    format!(
        "{}\0{}\0{}\0{}",
        msg.conversation_key,
        sortable_ts(msg.timestamp),
        sortable_u64(msg.op_index.unwrap_or(u64::MAX)),
        msg.tx_id
    )
}

fn timestamp_index_key(msg: &Message) -> String {
    format!("{}\0{}", sortable_ts(msg.timestamp), msg.tx_id)
}

fn session_index_key(session_id: &str, chunk_index: u32, tx_id: &str) -> String {
    format!("{}\0{:010}\0{}", session_id, chunk_index, tx_id)
}

fn pending_hash_key(hash: &str, tx_id: &str) -> String {
    format!("{}\0{}", hash, tx_id)
}

fn filtered_key(record: &FilteredRecord) -> String {
    format!(
        "{}\0{}",
        sortable_u64(record.operation.op_index),
        record.operation.tx_id
    )
}

impl CacheTxn<'_> {
    // ═══════════════════════════════════════════════════════════════════════
    // Messages
    // ═══════════════════════════════════════════════════════════════════════

    pub fn get_message(&self, tx_id: &str) -> SyncResult<Option<Message>> {
        self.get_json(Table::Messages, tx_id)
    }

    /// Insert or replace a message, keeping every index consistent.
    pub fn put_message(&mut self, msg: &Message) -> SyncResult<()> {
        if let Some(previous) = self.get_message(&msg.tx_id)? {
            self.remove_indexes(&previous);
        }
        self.put_json(Table::Messages, msg.tx_id.clone(), msg)?;
        self.add_indexes(msg);
        Ok(())
    }

    /// Delete a message and its index entries. Returns whether it existed.
    pub fn delete_message(&mut self, tx_id: &str) -> SyncResult<bool> {
        match self.get_message(tx_id)? {
            Some(previous) => {
                self.remove_indexes(&previous);
                self.delete_raw(Table::Messages, tx_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn add_indexes(&mut self, msg: &Message) {
        let tx = msg.tx_id.as_bytes().to_vec();
        if let (Some(session), Some(index)) = (&msg.session_id, msg.chunk_index) {
            self.put_raw(
                Table::SessionIndex,
                session_index_key(session, index, &msg.tx_id),
                tx,
            );
            return;
        }
        self.put_raw(Table::ConversationIndex, conversation_index_key(msg), tx.clone());
        self.put_raw(Table::TimestampIndex, timestamp_index_key(msg), tx.clone());
        if !msg.confirmed {
            if let Some(hash) = &msg.hash {
                self.put_raw(Table::PendingHashes, pending_hash_key(hash, &msg.tx_id), tx);
            }
        }
    }

    fn remove_indexes(&mut self, msg: &Message) {
        if let (Some(session), Some(index)) = (&msg.session_id, msg.chunk_index) {
            self.delete_raw(
                Table::SessionIndex,
                session_index_key(session, index, &msg.tx_id),
            );
            return;
        }
        self.delete_raw(Table::ConversationIndex, conversation_index_key(msg));
        self.delete_raw(Table::TimestampIndex, timestamp_index_key(msg));
        if let Some(hash) = &msg.hash {
            self.delete_raw(Table::PendingHashes, pending_hash_key(hash, &msg.tx_id));
        }
    }

    fn resolve_index(&self, entries: Vec<(String, Vec<u8>)>) -> SyncResult<Vec<Message>> {
        let mut messages = Vec::with_capacity(entries.len());
        for (_, tx) in entries {
            let tx_id = String::from_utf8_lossy(&tx);
            if let Some(msg) = self.get_message(&tx_id)? {
                messages.push(msg);
            }
        }
        Ok(messages)
    }

    /// Full messages of one conversation in display order.
    pub fn conversation_messages(&self, conversation_key: &str) -> SyncResult<Vec<Message>> {
        let entries =
            self.scan_prefix_raw(Table::ConversationIndex, &format!("{}\0", conversation_key))?;
        self.resolve_index(entries)
    }

    /// Full messages with `since <= timestamp < until`.
    pub fn messages_between(&self, since: i64, until: i64) -> SyncResult<Vec<Message>> {
        let entries =
            self.scan_range_raw(Table::TimestampIndex, &sortable_ts(since), &sortable_ts(until))?;
        self.resolve_index(entries)
    }

    /// Stored chunk records of a session, ordered by chunk index.
    pub fn session_chunks(&self, session_id: &str) -> SyncResult<Vec<Message>> {
        let entries = self.scan_prefix_raw(Table::SessionIndex, &format!("{}\0", session_id))?;
        self.resolve_index(entries)
    }

    /// Chunk records of every incomplete session, keyed by session id.
    pub fn open_sessions(&self) -> SyncResult<BTreeMap<String, Vec<Message>>> {
        let mut sessions: BTreeMap<String, Vec<Message>> = BTreeMap::new();
        for msg in self.resolve_index(self.scan_prefix_raw(Table::SessionIndex, "")?)? {
            if let Some(session) = msg.session_id.clone() {
                sessions.entry(session).or_default().push(msg);
            }
        }
        Ok(sessions)
    }

    /// Unconfirmed local sends whose payload hashes to `hash`.
    pub fn pending_by_hash(&self, hash: &str) -> SyncResult<Vec<Message>> {
        let entries = self.scan_prefix_raw(Table::PendingHashes, &format!("{}\0", hash))?;
        self.resolve_index(entries)
    }

    /// Every stored record, chunk records included.
    pub fn all_messages(&self) -> SyncResult<Vec<Message>> {
        Ok(self
            .scan_json::<Message>(Table::Messages, "")?
            .into_iter()
            .map(|(_, m)| m)
            .collect())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Completed sessions
    // ═══════════════════════════════════════════════════════════════════════

    pub fn completed_session(&self, session_id: &str) -> SyncResult<Option<CompletedSession>> {
        self.get_json(Table::CompletedSessions, session_id)
    }

    pub fn mark_session_completed(&mut self, session: &CompletedSession) -> SyncResult<()> {
        self.put_json(Table::CompletedSessions, session.session_id.clone(), session)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Filtered operations
    // ═══════════════════════════════════════════════════════════════════════

    pub fn put_filtered(&mut self, record: &FilteredRecord) -> SyncResult<()> {
        self.put_json(Table::Filtered, filtered_key(record), record)
    }

    pub fn delete_filtered(&mut self, record: &FilteredRecord) {
        self.delete_raw(Table::Filtered, filtered_key(record));
    }

    /// Filtered operations in ledger order.
    pub fn filtered(&self) -> SyncResult<Vec<FilteredRecord>> {
        Ok(self
            .scan_json::<FilteredRecord>(Table::Filtered, "")?
            .into_iter()
            .map(|(_, r)| r)
            .collect())
    }
}

impl MessageCache {
    pub fn message(&self, tx_id: &str) -> SyncResult<Option<Message>> {
        self.begin().get_message(tx_id)
    }

    pub fn conversation(&self, conversation_key: &str) -> SyncResult<Vec<Message>> {
        self.begin().conversation_messages(conversation_key)
    }

    pub fn messages_between(&self, since: i64, until: i64) -> SyncResult<Vec<Message>> {
        self.begin().messages_between(since, until)
    }

    /// Messages matching every set filter.
    pub fn query(&self, query: &ConversationQuery) -> SyncResult<Vec<Message>> {
        let txn = self.begin();
        let mut messages = match &query.conversation_key {
            Some(key) => txn.conversation_messages(key)?,
            None => txn.messages_between(
                query.since.unwrap_or(0),
                query.until.unwrap_or(i64::MAX),
            )?,
        };
        messages.retain(|m| {
            query.since.map_or(true, |s| m.timestamp >= s)
                && query.until.map_or(true, |u| m.timestamp < u)
                && (!query.only_undecrypted || !m.is_decrypted)
        });
        if let Some(limit) = query.limit {
            let skip = messages.len().saturating_sub(limit);
            messages.drain(..skip);
        }
        Ok(messages)
    }

    /// Full messages still holding only ciphertext.
    pub fn undecrypted(&self) -> SyncResult<Vec<Message>> {
        let mut messages: Vec<Message> = self
            .begin()
            .all_messages()?
            .into_iter()
            .filter(|m| !m.is_decrypted && !m.is_chunk())
            .collect();
        messages.sort_by_key(|m| (m.timestamp, m.op_index));
        Ok(messages)
    }

    /// Messages admitted under an unverified minimum.
    pub fn unverified(&self) -> SyncResult<Vec<Message>> {
        let mut messages: Vec<Message> = self
            .begin()
            .all_messages()?
            .into_iter()
            .filter(|m| m.spam_unverified && !m.is_chunk())
            .collect();
        messages.sort_by_key(|m| (m.timestamp, m.op_index));
        Ok(messages)
    }

    pub fn filtered(&self) -> SyncResult<Vec<FilteredRecord>> {
        self.begin().filtered()
    }

    pub fn open_sessions(&self) -> SyncResult<BTreeMap<String, Vec<Message>>> {
        self.begin().open_sessions()
    }

    /// One summary per conversation, most recent activity first.
    pub fn summaries(&self, viewer: &str) -> SyncResult<Vec<ConversationSummary>> {
        let mut by_key: BTreeMap<String, Vec<Message>> = BTreeMap::new();
        for msg in self.begin().all_messages()? {
            if msg.is_chunk() {
                continue;
            }
            by_key.entry(msg.conversation_key.clone()).or_default().push(msg);
        }

        let mut summaries: Vec<ConversationSummary> = by_key
            .into_iter()
            .map(|(key, mut messages)| {
                messages.sort_by_key(|m| (m.timestamp, m.op_index.unwrap_or(u64::MAX)));
                let (peer, is_group) = ConversationSummary::peer_for(&key, viewer);
                let last = messages.last();
                ConversationSummary {
                    peer,
                    is_group,
                    message_count: messages.len(),
                    undecrypted_count: messages.iter().filter(|m| !m.is_decrypted).count(),
                    unconfirmed_count: messages.iter().filter(|m| !m.confirmed).count(),
                    last_activity: last.map_or(0, |m| m.timestamp),
                    last_message: last.and_then(|m| m.content.clone()),
                    conversation_key: key,
                }
            })
            .collect();
        summaries.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.conversation_key.cmp(&b.conversation_key))
        });
        Ok(summaries)
    }

    /// Delete every message of a conversation. Returns how many were removed.
    pub fn purge_conversation(&self, conversation_key: &str) -> SyncResult<usize> {
        let mut txn = self.begin();
        let messages = txn.conversation_messages(conversation_key)?;
        for msg in &messages {
            txn.delete_message(&msg.tx_id)?;
        }
        txn.commit()?;
        Ok(messages.len())
    }
}
