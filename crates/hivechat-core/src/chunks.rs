//! Multi-part payload reassembly
//!
//! Memos have a length limit, so long payloads travel as several transfers:
//!
//! ```text
//! hivechat-chunk:<session_id>:<index>:<count>:<piece>
//! ```
//!
//! The pieces, concatenated in index order, form the complete (usually
//! encrypted) payload. Each session moves through
//! `collecting -> complete -> discarded`: chunk records are stored until every
//! index `0..count` is present, then replaced by one message keyed by chunk
//! 0's transaction and the session is remembered as completed so that replays
//! do not start it over.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::SyncResult;
use crate::storage::{CacheTxn, CompletedSession, MessageCache};
use crate::types::{payload_hash, Amount, Message};

pub const CHUNK_PREFIX: &str = "hivechat-chunk:";

/// Parsed chunk header plus its piece of the payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub session_id: String,
    pub index: u32,
    pub count: u32,
    pub piece: String,
}

/// Parse a chunk memo.
///
/// `None` when the payload is not a chunk at all; `Some(Err)` when it claims
/// to be one but the header is unusable.
pub fn parse_chunk(payload: &str) -> Option<Result<ChunkHeader, String>> {
    let rest = payload.strip_prefix(CHUNK_PREFIX)?;
    let mut parts = rest.splitn(4, ':');
    let (Some(session_id), Some(index), Some(count), Some(piece)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Some(Err("truncated chunk header".into()));
    };

    if session_id.is_empty() {
        return Some(Err("empty session id".into()));
    }
    let Ok(index) = index.parse::<u32>() else {
        return Some(Err(format!("bad chunk index {:?}", index)));
    };
    let Ok(count) = count.parse::<u32>() else {
        return Some(Err(format!("bad chunk count {:?}", count)));
    };
    if count == 0 {
        return Some(Err("chunk count is zero".into()));
    }
    if index >= count {
        return Some(Err(format!("chunk index {} out of range 0..{}", index, count)));
    }

    Some(Ok(ChunkHeader {
        session_id: session_id.to_string(),
        index,
        count,
        piece: piece.to_string(),
    }))
}

fn digits(n: usize) -> usize {
    n.to_string().len()
}

/// Split `payload` into memos of at most `max_len` bytes.
///
/// Payloads that already fit are returned as-is, without a chunk header.
pub fn split_payload(session_id: &str, payload: &str, max_len: usize) -> Vec<String> {
    if payload.len() <= max_len {
        return vec![payload.to_string()];
    }

    // The header grows with the digit count of `count`; settle on a width.
    let mut width = 1;
    let piece_len = loop {
        let header = CHUNK_PREFIX.len() + session_id.len() + 2 * width + 3;
        let piece_len = max_len.saturating_sub(header).max(1);
        let count = payload.len().div_ceil(piece_len);
        if digits(count) <= width {
            break piece_len;
        }
        width += 1;
    };

    let mut pieces: Vec<&str> = Vec::new();
    let mut rest = payload;
    while !rest.is_empty() {
        let mut cut = piece_len.min(rest.len());
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            cut = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (piece, tail) = rest.split_at(cut);
        pieces.push(piece);
        rest = tail;
    }

    let count = pieces.len();
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| format!("{}{}:{}:{}:{}", CHUNK_PREFIX, session_id, i, count, piece))
        .collect()
}

/// Result of feeding one chunk record to the reassembler
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    /// Stored; the session still waits for more chunks
    Collecting { received: u32, count: u32 },
    /// Every chunk arrived; the reassembled message (not yet stored)
    Complete(Message),
    /// This index of the session was already stored
    Duplicate,
    /// The session was reassembled before
    AlreadyCompleted,
    /// Rejected: disagrees with chunks already stored
    Invalid(String),
}

/// Progress of an incomplete session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSetStatus {
    pub session_id: String,
    pub conversation_key: String,
    pub from: String,
    pub count: u32,
    /// Indices received so far, ascending
    pub received: Vec<u32>,
    /// Timestamp of the oldest stored chunk
    pub first_seen: i64,
}

impl ChunkSetStatus {
    pub fn missing(&self) -> Vec<u32> {
        (0..self.count)
            .filter(|i| !self.received.contains(i))
            .collect()
    }
}

/// Collects chunk records per session and completes them.
#[derive(Debug, Clone, Default)]
pub struct ChunkReassembler {
    eviction_after: Option<Duration>,
}

impl ChunkReassembler {
    pub fn new(eviction_after: Option<Duration>) -> Self {
        Self { eviction_after }
    }

    /// Store one chunk record and complete its session when possible.
    ///
    /// `chunk` must carry `session_id`, `chunk_index` and `chunk_count`, with
    /// the piece in `encrypted_payload`.
    pub fn ingest(&self, txn: &mut CacheTxn<'_>, chunk: Message, now: i64) -> SyncResult<ChunkOutcome> {
        let (Some(session_id), Some(index), Some(count)) =
            (chunk.session_id.clone(), chunk.chunk_index, chunk.chunk_count)
        else {
            return Ok(ChunkOutcome::Invalid("record is not a chunk".into()));
        };
        if index >= count {
            return Ok(ChunkOutcome::Invalid(format!(
                "chunk index {} out of range 0..{}",
                index, count
            )));
        }
        if txn.completed_session(&session_id)?.is_some() {
            return Ok(ChunkOutcome::AlreadyCompleted);
        }

        let mut stored = txn.session_chunks(&session_id)?;
        if let Some(other) = stored.iter().find(|c| c.chunk_count != Some(count)) {
            warn!(
                session_id = %session_id,
                expected = ?other.chunk_count,
                got = count,
                "Chunk count disagrees with stored chunks"
            );
            return Ok(ChunkOutcome::Invalid(format!(
                "chunk count {} disagrees with {:?}",
                count, other.chunk_count
            )));
        }
        if stored.iter().any(|c| c.chunk_index == Some(index)) {
            return Ok(ChunkOutcome::Duplicate);
        }

        txn.put_message(&chunk)?;
        stored.push(chunk);

        let received = stored.len() as u32;
        if received < count {
            debug!(session_id = %session_id, received, count, "Chunk stored");
            return Ok(ChunkOutcome::Collecting { received, count });
        }

        stored.sort_by_key(|c| c.chunk_index);
        let payload: String = stored.iter().map(|c| c.encrypted_payload.as_str()).collect();

        let first = &stored[0];
        let amount = stored
            .iter()
            .filter_map(|c| c.amount)
            .reduce(|a, b| Amount::new(a.micro.saturating_add(b.micro), a.asset));
        let message = Message {
            tx_id: first.tx_id.clone(),
            op_index: first.op_index,
            session_id: Some(session_id.clone()),
            chunk_index: None,
            chunk_count: Some(count),
            conversation_key: first.conversation_key.clone(),
            group_id: first.group_id.clone(),
            from: first.from.clone(),
            to: first.to.clone(),
            timestamp: first.timestamp,
            hash: Some(payload_hash(&payload)),
            encrypted_payload: payload,
            content: None,
            decoded_fields: None,
            amount,
            is_decrypted: false,
            decrypt_error: None,
            confirmed: stored.iter().all(|c| c.confirmed),
            spam_unverified: stored.iter().any(|c| c.spam_unverified),
        };

        for part in &stored {
            txn.delete_message(&part.tx_id)?;
        }
        txn.mark_session_completed(&CompletedSession {
            session_id: session_id.clone(),
            tx_id: message.tx_id.clone(),
            completed_at: now,
        })?;
        debug!(session_id = %session_id, count, tx_id = %message.tx_id, "Chunk set complete");

        Ok(ChunkOutcome::Complete(message))
    }

    /// Sessions still collecting, oldest first.
    pub fn incomplete_chunk_sets(&self, cache: &MessageCache) -> SyncResult<Vec<ChunkSetStatus>> {
        let mut sets: Vec<ChunkSetStatus> = cache
            .open_sessions()?
            .into_iter()
            .filter_map(|(session_id, chunks)| {
                let first = chunks.first()?;
                let mut received: Vec<u32> = chunks.iter().filter_map(|c| c.chunk_index).collect();
                received.sort_unstable();
                Some(ChunkSetStatus {
                    conversation_key: first.conversation_key.clone(),
                    from: first.from.clone(),
                    count: first.chunk_count.unwrap_or(0),
                    first_seen: chunks.iter().map(|c| c.timestamp).min().unwrap_or(0),
                    received,
                    session_id,
                })
            })
            .collect();
        sets.sort_by(|a, b| {
            a.first_seen
                .cmp(&b.first_seen)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(sets)
    }

    /// Drop incomplete sessions whose oldest chunk is older than the
    /// configured window. Never evicts when no window is configured.
    pub fn evict_stale(&self, txn: &mut CacheTxn<'_>, now: i64) -> SyncResult<usize> {
        let Some(after) = self.eviction_after else {
            return Ok(0);
        };
        let cutoff = now.saturating_sub(after.as_millis() as i64);

        let mut evicted = 0;
        for (session_id, chunks) in txn.open_sessions()? {
            let oldest = chunks.iter().map(|c| c.timestamp).min().unwrap_or(now);
            if oldest >= cutoff {
                continue;
            }
            for chunk in &chunks {
                txn.delete_message(&chunk.tx_id)?;
            }
            debug!(session_id = %session_id, chunks = chunks.len(), "Evicted stale chunk set");
            evicted += 1;
        }
        Ok(evicted)
    }
}
