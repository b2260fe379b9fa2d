//! Sync engine: one service instance per viewing account
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │ SyncEngine                                                           │
//! │                                                                      │
//! │  OperationStream ─► SyncCursor plan ─► classify ─┬─ Direct ──────────┤
//! │                                                  │   SpamFilter      │
//! │                                                  │   ChunkReassembler│
//! │                                                  │   MemoCodec       │
//! │                                                  ├─ GroupMessage ────┤
//! │                                                  ├─ GroupControl ────┤
//! │                                                  │   GroupDirectory  │
//! │                                                  └─ Unrelated (drop) │
//! │                                                                      │
//! │  one page = one CacheTxn ─► commit ─► cursor.advance ─► SyncEvent    │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Writes of a page are committed atomically and the cursor moves only after
//! the commit, so a crash or provider failure mid-batch replays the batch on
//! the next run. Replays are harmless because every handler is idempotent.
//!
//! Live mode polls on an interval inside a single task; a cycle never starts
//! before the previous one settled, and a cancelled cycle commits nothing.
//! Each poll reuses the backfill path instead of
//! [`OperationStream::subscribe`], so live pages share the page transactions,
//! gap handling and cursor of [`SyncEngine::sync_once`]. `subscribe` serves
//! callers that want a raw ordered feed of operations.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::chunks::{parse_chunk, split_payload, ChunkOutcome, ChunkReassembler, ChunkSetStatus};
use crate::classifier::{classify, Direction, OperationClass};
use crate::codec::{KeyHolder, MemoCodec};
use crate::config::SyncConfig;
use crate::cursor::{compute_backfill_plan, SyncCursor};
use crate::error::{SyncError, SyncResult};
use crate::events::{SyncEvent, SyncStatus};
use crate::groups::{
    payment_memo, rank_groups, ConflictingControlOperation, ControlOutcome, GroupControl,
    GroupDirectory, OutgoingCustomJson, RankMode,
};
use crate::ledger::LedgerClient;
use crate::spam::{evaluate, SpamFilter};
use crate::storage::{ExceptionEntry, LocalState, MessageCache};
use crate::stream::OperationStream;
use crate::types::{
    conversation_key, group_conversation_key, now_millis, payload_hash, Amount,
    ConversationSummary, FilterReason, FilteredRecord, GroupAnnouncement, GroupPayment,
    JoinRequest, Message, Operation, OperationPayload, Transfer,
};

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Key inside a group message body holding the payload
const GROUP_MESSAGE_FIELD: &str = "message";

/// Summary of one sync pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub batches: usize,
    pub operations_seen: usize,
    pub messages_written: usize,
    pub filtered: usize,
    pub unrelated: usize,
    pub decrypt_failures: usize,
    /// Chunks stored while their session is still collecting
    pub chunks_pending: usize,
    pub invalid_chunks: usize,
    /// Operations the ledger returned that could not be decoded
    pub skipped_operations: usize,
    pub control_applied: usize,
    pub conflicts: Vec<ConflictingControlOperation>,
    pub gap_exceeded: bool,
    /// Cursor after the pass
    pub cursor: Option<u64>,
    pub conversations: BTreeSet<String>,
}

impl SyncReport {
    fn absorb(&mut self, batch: SyncReport) {
        self.batches += 1;
        self.operations_seen += batch.operations_seen;
        self.messages_written += batch.messages_written;
        self.filtered += batch.filtered;
        self.unrelated += batch.unrelated;
        self.decrypt_failures += batch.decrypt_failures;
        self.chunks_pending += batch.chunks_pending;
        self.invalid_chunks += batch.invalid_chunks;
        self.control_applied += batch.control_applied;
        self.conflicts.extend(batch.conflicts);
        self.conversations.extend(batch.conversations);
    }

    fn record_control(&mut self, outcome: ControlOutcome) {
        match outcome {
            ControlOutcome::Ignored(reason) => debug!(reason = %reason, "Control operation ignored"),
            ControlOutcome::Conflict(conflict) => {
                self.control_applied += 1;
                self.conflicts.push(conflict);
            }
            _ => self.control_applied += 1,
        }
    }
}

/// A transfer the caller must sign and broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingTransfer {
    pub from: String,
    pub to: String,
    pub amount: Amount,
    pub memo: String,
}

/// Result of [`SyncEngine::send_message`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingMessage {
    /// Key of the pending record (`local:<ulid>`)
    pub local_id: String,
    /// One transfer per memo chunk, in order
    pub transfers: Vec<OutgoingTransfer>,
}

/// Result of [`SyncEngine::reevaluate_unverified`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Reevaluation {
    pub verified: usize,
    pub filtered: usize,
}

/// Sync service for one account.
pub struct SyncEngine {
    viewer: String,
    config: SyncConfig,
    stream: OperationStream,
    cursor: SyncCursor,
    codec: MemoCodec,
    chunks: ChunkReassembler,
    spam: SpamFilter,
    groups: GroupDirectory,
    cache: MessageCache,
    event_tx: broadcast::Sender<SyncEvent>,
    status: RwLock<SyncStatus>,
    /// Serializes sync cycles: the cache has a single writer
    sync_lock: Mutex<()>,
}

impl SyncEngine {
    /// Open the account's stores under `data_dir/<viewer>/`.
    pub fn open(
        viewer: &str,
        ledger: Arc<dyn LedgerClient>,
        key_holder: Arc<dyn KeyHolder>,
        data_dir: impl AsRef<Path>,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        let account_dir = data_dir.as_ref().join(viewer.to_ascii_lowercase());
        let cache = MessageCache::open(account_dir.join("cache.redb"))?;
        let state = LocalState::open(account_dir.join("state.redb"))?;
        info!(viewer, path = %account_dir.display(), "Opened account stores");
        Self::with_stores(viewer, ledger, key_holder, cache, state, config)
    }

    /// Build an engine over existing stores.
    pub fn with_stores(
        viewer: &str,
        ledger: Arc<dyn LedgerClient>,
        key_holder: Arc<dyn KeyHolder>,
        cache: MessageCache,
        state: LocalState,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        config.validate()?;
        let viewer = viewer.to_ascii_lowercase();
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            stream: OperationStream::new(ledger.clone()),
            cursor: SyncCursor::new(state.clone()),
            codec: MemoCodec::new(key_holder, config.decrypt_timeout()),
            chunks: ChunkReassembler::new(config.chunk_eviction_after()),
            spam: SpamFilter::new(
                &viewer,
                ledger,
                state,
                config.default_minimum,
                config.minimum_ttl(),
            ),
            groups: GroupDirectory::new(&viewer),
            cache,
            event_tx,
            status: RwLock::new(SyncStatus::Idle),
            sync_lock: Mutex::new(()),
            viewer,
            config,
        })
    }

    pub fn viewer(&self) -> &str {
        &self.viewer
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn cache(&self) -> &MessageCache {
        &self.cache
    }

    pub fn status(&self) -> SyncStatus {
        self.status.read().clone()
    }

    pub fn cursor(&self) -> SyncResult<Option<u64>> {
        self.cursor.get_cursor(&self.viewer)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        // No receivers is fine.
        let _ = self.event_tx.send(event);
    }

    fn set_status(&self, status: SyncStatus) {
        {
            let mut current = self.status.write();
            if *current == status {
                return;
            }
            *current = status.clone();
        }
        self.emit(SyncEvent::StatusChanged {
            username: self.viewer.clone(),
            status,
        });
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync
    // ═══════════════════════════════════════════════════════════════════════

    /// Bring the cache up to the ledger head once.
    pub async fn sync_once(&self) -> SyncResult<SyncReport> {
        let _guard = self.sync_lock.lock().await;
        self.set_status(SyncStatus::Syncing);
        let result = self.run_backfill(None).await;
        self.finish_cycle(&result, SyncStatus::Idle);
        result
    }

    fn finish_cycle(&self, result: &SyncResult<SyncReport>, settled: SyncStatus) {
        match result {
            Ok(_) => self.set_status(settled),
            Err(SyncError::Cancelled) => {}
            Err(e) => {
                warn!(viewer = %self.viewer, error = %e, "Sync cycle failed");
                self.emit(SyncEvent::SyncError {
                    username: self.viewer.clone(),
                    message: e.to_string(),
                    retryable: e.is_retryable(),
                });
                self.set_status(SyncStatus::Error(e.to_string()));
            }
        }
    }

    async fn run_backfill(&self, cancel: Option<&CancellationToken>) -> SyncResult<SyncReport> {
        let cancelled = || cancel.is_some_and(|c| c.is_cancelled());

        let head = self.stream.head(&self.viewer).await?;
        let cursor = self.cursor.get_cursor(&self.viewer)?;
        let mut report = SyncReport {
            cursor,
            ..Default::default()
        };

        let Some(plan) = compute_backfill_plan(cursor, head, self.config.max_backfill) else {
            return Ok(report);
        };
        debug!(viewer = %self.viewer, ?cursor, start = plan.start, through = plan.through, "Backfill planned");

        if plan.gap_exceeded {
            warn!(
                viewer = %self.viewer,
                ?cursor,
                head = plan.through,
                max_backfill = self.config.max_backfill,
                "Backlog exceeds max_backfill; skipping older operations"
            );
            report.gap_exceeded = true;
            self.emit(SyncEvent::GapExceeded {
                username: self.viewer.clone(),
                cursor,
                head: plan.through,
                skipped_through: plan.start.saturating_sub(1),
            });
        }

        let mut next = plan.start;
        while next <= plan.through {
            if cancelled() {
                return Err(SyncError::Cancelled);
            }
            let page = self
                .stream
                .fetch_page(&self.viewer, next, Some(plan.through), self.config.page_limit)
                .await?;
            report.skipped_operations += page.skipped;

            let Some(last) = page.last_op_index else {
                // Nothing matching the filter up to the plan's end.
                if cancelled() {
                    return Err(SyncError::Cancelled);
                }
                self.cursor.advance(&self.viewer, plan.through)?;
                report.cursor = Some(report.cursor.map_or(plan.through, |c| c.max(plan.through)));
                break;
            };

            let now = now_millis();
            let mut txn = self.cache.begin();
            let mut batch = SyncReport::default();
            for op in &page.operations {
                self.process_operation(&mut txn, op, now, &mut batch).await?;
            }
            self.chunks.evict_stale(&mut txn, now)?;

            // A cancelled cycle must not commit.
            if cancelled() {
                debug!(viewer = %self.viewer, "Discarding batch of cancelled cycle");
                return Err(SyncError::Cancelled);
            }
            let writes = txn.commit()?;
            self.cursor.advance(&self.viewer, last)?;

            info!(
                viewer = %self.viewer,
                through = last,
                operations = batch.operations_seen,
                messages = batch.messages_written,
                filtered = batch.filtered,
                writes,
                "Batch committed"
            );
            self.emit(SyncEvent::BatchCommitted {
                username: self.viewer.clone(),
                through_op_index: last,
                messages_written: batch.messages_written,
                conversations: batch.conversations.iter().cloned().collect(),
            });
            report.absorb(batch);
            report.cursor = Some(last);
            next = last + 1;
        }

        Ok(report)
    }

    async fn process_operation(
        &self,
        txn: &mut crate::storage::CacheTxn<'_>,
        op: &Operation,
        now: i64,
        stats: &mut SyncReport,
    ) -> SyncResult<()> {
        stats.operations_seen += 1;
        match classify(op, &self.viewer) {
            OperationClass::Unrelated => {
                stats.unrelated += 1;
                Ok(())
            }
            OperationClass::Direct { direction } => {
                self.ingest_direct(txn, op, direction, now, stats).await
            }
            OperationClass::GroupMessage => self.ingest_group_message(txn, op, now, stats).await,
            OperationClass::GroupControl => {
                let outcome = self.groups.apply(txn, op, now)?;
                stats.record_control(outcome);
                Ok(())
            }
        }
    }

    async fn ingest_direct(
        &self,
        txn: &mut crate::storage::CacheTxn<'_>,
        op: &Operation,
        direction: Direction,
        now: i64,
        stats: &mut SyncReport,
    ) -> SyncResult<()> {
        let (Some(transfer), Some(to)) = (op.as_transfer(), op.to.clone()) else {
            return Ok(());
        };

        let mut unverified = false;
        if direction == Direction::Incoming {
            let admission = self.spam.admit(&op.from, &transfer.amount).await?;
            if !admission.admitted {
                debug!(
                    from = %op.from,
                    amount = %transfer.amount,
                    minimum = %admission.minimum,
                    "Transfer below minimum; filtered"
                );
                txn.put_filtered(&FilteredRecord {
                    operation: op.clone(),
                    reason: FilterReason::BelowMinimum,
                    minimum: admission.minimum,
                    filtered_at: now,
                })?;
                stats.filtered += 1;
                return Ok(());
            }
            unverified = admission.unverified;
        }

        let mut msg = Message::observed(
            op,
            conversation_key(&op.from, &to),
            to,
            transfer.memo.clone(),
            Some(transfer.amount),
        );
        msg.spam_unverified = unverified;
        self.ingest_payload(txn, msg, now, stats).await
    }

    async fn ingest_group_message(
        &self,
        txn: &mut crate::storage::CacheTxn<'_>,
        op: &Operation,
        now: i64,
        stats: &mut SyncReport,
    ) -> SyncResult<()> {
        let Some(custom) = op.as_custom_json() else {
            return Ok(());
        };
        let group_id = custom.json.get("group_id").and_then(|v| v.as_str());
        let payload = custom.json.get(GROUP_MESSAGE_FIELD).and_then(|v| v.as_str());
        let (Some(group_id), Some(payload)) = (group_id, payload) else {
            warn!(tx_id = %op.tx_id, "Group message without group_id or message");
            stats.unrelated += 1;
            return Ok(());
        };

        let mut msg = Message::observed(
            op,
            group_conversation_key(group_id),
            group_id.to_string(),
            payload.to_string(),
            None,
        );
        msg.group_id = Some(group_id.to_string());
        self.ingest_payload(txn, msg, now, stats).await
    }

    /// Chunk handling, decoding and the final write shared by every message kind.
    async fn ingest_payload(
        &self,
        txn: &mut crate::storage::CacheTxn<'_>,
        mut msg: Message,
        now: i64,
        stats: &mut SyncReport,
    ) -> SyncResult<()> {
        match parse_chunk(&msg.encrypted_payload) {
            None => {}
            Some(Err(reason)) => {
                warn!(tx_id = %msg.tx_id, reason = %reason, "Dropping malformed chunk");
                stats.invalid_chunks += 1;
                return Ok(());
            }
            Some(Ok(header)) => {
                msg.session_id = Some(header.session_id);
                msg.chunk_index = Some(header.index);
                msg.chunk_count = Some(header.count);
                msg.encrypted_payload = header.piece;
                msg.hash = None;
                match self.chunks.ingest(txn, msg, now)? {
                    ChunkOutcome::Complete(full) => msg = full,
                    ChunkOutcome::Collecting { .. } => {
                        stats.chunks_pending += 1;
                        return Ok(());
                    }
                    ChunkOutcome::Duplicate | ChunkOutcome::AlreadyCompleted => return Ok(()),
                    ChunkOutcome::Invalid(reason) => {
                        warn!(reason = %reason, "Dropping inconsistent chunk");
                        stats.invalid_chunks += 1;
                        return Ok(());
                    }
                }
            }
        }

        if let Some(existing) = txn.get_message(&msg.tx_id)? {
            if existing.is_decrypted && existing.confirmed {
                return Ok(());
            }
        }

        // Our own send coming back: take over the pending record's plaintext.
        if msg.is_mine(&self.viewer) {
            if let Some(hash) = msg.hash.clone() {
                for pending in txn.pending_by_hash(&hash)? {
                    if pending.conversation_key != msg.conversation_key {
                        continue;
                    }
                    if let (false, Some(content)) = (msg.is_decrypted, pending.content.clone()) {
                        msg.set_plaintext(content);
                    }
                    txn.delete_message(&pending.tx_id)?;
                    debug!(local_id = %pending.tx_id, tx_id = %msg.tx_id, "Pending send confirmed");
                }
            }
        }

        if !msg.is_decrypted && !self.resolve_content(&mut msg).await {
            stats.decrypt_failures += 1;
        }

        stats.conversations.insert(msg.conversation_key.clone());
        txn.put_message(&msg)?;
        stats.messages_written += 1;
        Ok(())
    }

    /// Decode `msg` in place. Returns whether it now holds plaintext.
    async fn resolve_content(&self, msg: &mut Message) -> bool {
        match self.codec.decrypt(&msg.encrypted_payload, &self.viewer).await {
            Ok(plaintext) => {
                msg.set_plaintext(plaintext);
                true
            }
            Err(failure) => {
                debug!(tx_id = %msg.tx_id, error = %failure, "Decryption failed");
                msg.set_decrypt_error(failure);
                false
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Live tail
    // ═══════════════════════════════════════════════════════════════════════

    /// Poll the ledger every `poll_interval` until the handle is cancelled.
    pub fn start_live(self: &Arc<Self>) -> LiveHandle {
        let token = CancellationToken::new();
        let engine = Arc::clone(self);
        let cycle_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.poll_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            engine.set_status(SyncStatus::Live);
            info!(viewer = %engine.viewer, "Live sync started");

            loop {
                tokio::select! {
                    _ = cycle_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let guard = engine.sync_lock.lock().await;
                let result = engine.run_backfill(Some(&cycle_token)).await;
                drop(guard);
                if matches!(result, Err(SyncError::Cancelled)) {
                    break;
                }
                engine.finish_cycle(&result, SyncStatus::Live);
            }

            engine.set_status(SyncStatus::Idle);
            info!(viewer = %engine.viewer, "Live sync stopped");
        });

        LiveHandle {
            token,
            handle: Some(handle),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Outgoing
    // ═══════════════════════════════════════════════════════════════════════

    /// Encrypt a message for `to` and record it as pending.
    ///
    /// Returns the transfers to broadcast; long memos are split into chunk
    /// transfers of `amount` each. The pending record is replaced by the
    /// confirmed one when the transfers are observed on the ledger.
    pub async fn send_message(
        &self,
        to: &str,
        plaintext: &str,
        amount: Amount,
    ) -> SyncResult<OutgoingMessage> {
        let to = to.to_ascii_lowercase();
        let memo = self.codec.encrypt(&self.viewer, &to, plaintext).await?;
        let session_id = Ulid::new().to_string().to_ascii_lowercase();
        let memos = split_payload(&session_id, &memo, self.config.max_memo_len);

        let transfers: Vec<OutgoingTransfer> = memos
            .iter()
            .map(|m| OutgoingTransfer {
                from: self.viewer.clone(),
                to: to.clone(),
                amount,
                memo: m.clone(),
            })
            .collect();

        let local_id = format!("local:{}", Ulid::new());
        let mut msg = Message {
            tx_id: local_id.clone(),
            op_index: None,
            session_id: (transfers.len() > 1).then(|| session_id.clone()),
            chunk_index: None,
            chunk_count: (transfers.len() > 1).then_some(transfers.len() as u32),
            conversation_key: conversation_key(&self.viewer, &to),
            group_id: None,
            from: self.viewer.clone(),
            to,
            timestamp: now_millis(),
            hash: Some(payload_hash(&memo)),
            encrypted_payload: memo,
            content: None,
            decoded_fields: None,
            amount: Some(Amount::new(
                amount.micro.saturating_mul(transfers.len() as u64),
                amount.asset,
            )),
            is_decrypted: false,
            decrypt_error: None,
            confirmed: false,
            spam_unverified: false,
        };
        msg.set_plaintext(plaintext.to_string());

        let mut txn = self.cache.begin();
        txn.put_message(&msg)?;
        txn.commit()?;
        info!(local_id = %local_id, to = %msg.to, chunks = transfers.len(), "Message queued");

        Ok(OutgoingMessage {
            local_id,
            transfers,
        })
    }

    /// custom_json announcing a new group created by the viewer.
    pub fn create_group(
        &self,
        name: &str,
        auto_approve: bool,
        payment: Option<GroupPayment>,
    ) -> OutgoingCustomJson {
        let control = GroupControl::Create {
            group_id: Ulid::new().to_string().to_ascii_lowercase(),
            name: name.to_string(),
            auto_approve,
            payment,
        };
        OutgoingCustomJson::control(&self.viewer, &control)
    }

    /// Record the viewer's join request and return the custom_json to broadcast.
    pub fn request_join(&self, group_id: &str) -> SyncResult<(JoinRequest, OutgoingCustomJson)> {
        let mut txn = self.cache.begin();
        let request = self.groups.request_join(&mut txn, group_id, now_millis())?;
        txn.commit()?;
        let control = GroupControl::Join {
            group_id: group_id.to_string(),
        };
        Ok((request, OutgoingCustomJson::control(&self.viewer, &control)))
    }

    /// Creator decision on a join request.
    pub fn decide_join(
        &self,
        group_id: &str,
        username: &str,
        approve: bool,
    ) -> SyncResult<OutgoingCustomJson> {
        let group = self
            .cache
            .group(group_id)?
            .ok_or_else(|| SyncError::GroupNotFound(group_id.to_string()))?;
        if group.creator != self.viewer {
            return Err(SyncError::InvalidOperation(format!(
                "{} is not the creator of {}",
                self.viewer, group_id
            )));
        }
        let username = username.to_ascii_lowercase();
        let group_id = group_id.to_string();
        let control = if approve {
            GroupControl::Approve { group_id, username }
        } else {
            GroupControl::Reject { group_id, username }
        };
        Ok(OutgoingCustomJson::control(&self.viewer, &control))
    }

    /// Transfer paying the group's membership fee.
    pub fn group_payment(&self, group_id: &str) -> SyncResult<OutgoingTransfer> {
        let group = self
            .cache
            .group(group_id)?
            .ok_or_else(|| SyncError::GroupNotFound(group_id.to_string()))?;
        let terms = group.payment.ok_or_else(|| {
            SyncError::InvalidOperation(format!("group {} requires no payment", group_id))
        })?;
        Ok(OutgoingTransfer {
            from: self.viewer.clone(),
            to: group.creator,
            amount: terms.amount,
            memo: payment_memo(group_id),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Maintenance
    // ═══════════════════════════════════════════════════════════════════════

    /// Re-attempt every message still holding only ciphertext.
    ///
    /// Returns how many were decrypted. Failures keep their record untouched
    /// apart from the latest error.
    pub async fn retry_decryption(&self) -> SyncResult<usize> {
        let _guard = self.sync_lock.lock().await;
        let pending = self.cache.undecrypted()?;
        let mut txn = self.cache.begin();
        let mut decrypted = 0;
        for mut msg in pending {
            let before = msg.clone();
            if self.resolve_content(&mut msg).await {
                decrypted += 1;
            }
            if msg != before {
                txn.put_message(&msg)?;
            }
        }
        txn.commit()?;
        info!(viewer = %self.viewer, decrypted, "Decryption retry finished");
        Ok(decrypted)
    }

    pub fn exceptions(&self) -> SyncResult<Vec<ExceptionEntry>> {
        self.spam.exceptions()
    }

    /// Allow-list a sender and release their filtered operations.
    ///
    /// Returns the number of released operations.
    pub async fn add_exception(&self, username: &str) -> SyncResult<usize> {
        let _guard = self.sync_lock.lock().await;
        self.spam.add_exception(username, now_millis())?;

        let released: Vec<FilteredRecord> = self
            .cache
            .filtered()?
            .into_iter()
            .filter(|r| r.operation.from.eq_ignore_ascii_case(username))
            .collect();
        if released.is_empty() {
            return Ok(0);
        }

        let now = now_millis();
        let mut txn = self.cache.begin();
        let mut stats = SyncReport::default();
        for record in &released {
            txn.delete_filtered(record);
            self.process_operation(&mut txn, &record.operation, now, &mut stats)
                .await?;
        }
        txn.commit()?;
        info!(username, released = released.len(), "Released filtered operations");
        Ok(released.len())
    }

    pub fn remove_exception(&self, username: &str) -> SyncResult<bool> {
        self.spam.remove_exception(username)
    }

    pub fn filtered(&self) -> SyncResult<Vec<FilteredRecord>> {
        self.cache.filtered()
    }

    /// Re-check messages admitted under an unverified minimum.
    ///
    /// Does nothing while the minimum still cannot be verified.
    pub async fn reevaluate_unverified(&self) -> SyncResult<Reevaluation> {
        let _guard = self.sync_lock.lock().await;
        self.spam.invalidate(&self.viewer);
        let status = self.spam.resolve_minimum(&self.viewer).await;
        if !status.is_verified() {
            return Ok(Reevaluation::default());
        }

        let now = now_millis();
        let mut outcome = Reevaluation::default();
        let mut txn = self.cache.begin();
        for mut msg in self.cache.unverified()? {
            let amount = msg.amount.unwrap_or_else(Amount::zero);
            let admission = evaluate(
                self.spam.is_exception(&msg.from)?,
                &amount,
                status,
                self.spam.default_minimum(),
            );
            if admission.admitted {
                msg.spam_unverified = false;
                txn.put_message(&msg)?;
                outcome.verified += 1;
            } else {
                txn.delete_message(&msg.tx_id)?;
                txn.put_filtered(&FilteredRecord {
                    operation: Operation {
                        op_index: msg.op_index.unwrap_or(0),
                        block_num: 0,
                        tx_id: msg.tx_id.clone(),
                        timestamp: msg.timestamp,
                        from: msg.from.clone(),
                        to: Some(msg.to.clone()),
                        payload: OperationPayload::Transfer(Transfer {
                            amount,
                            memo: msg.encrypted_payload.clone(),
                        }),
                    },
                    reason: FilterReason::BelowMinimum,
                    minimum: admission.minimum,
                    filtered_at: now,
                })?;
                outcome.filtered += 1;
            }
        }
        txn.commit()?;
        Ok(outcome)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════

    /// Direct conversation with `peer`.
    pub fn conversation(&self, peer: &str) -> SyncResult<Vec<Message>> {
        self.cache.conversation(&conversation_key(&self.viewer, peer))
    }

    pub fn group_conversation(&self, group_id: &str) -> SyncResult<Vec<Message>> {
        self.cache.conversation(&group_conversation_key(group_id))
    }

    pub fn conversations(&self) -> SyncResult<Vec<ConversationSummary>> {
        self.cache.summaries(&self.viewer)
    }

    pub fn messages_between(&self, since: i64, until: i64) -> SyncResult<Vec<Message>> {
        self.cache.messages_between(since, until)
    }

    /// Delete the direct conversation with `peer`.
    pub fn purge_conversation(&self, peer: &str) -> SyncResult<usize> {
        let removed = self
            .cache
            .purge_conversation(&conversation_key(&self.viewer, peer))?;
        info!(viewer = %self.viewer, peer, removed, "Conversation purged");
        Ok(removed)
    }

    pub fn incomplete_chunk_sets(&self) -> SyncResult<Vec<ChunkSetStatus>> {
        self.chunks.incomplete_chunk_sets(&self.cache)
    }

    pub fn group(&self, group_id: &str) -> SyncResult<Option<GroupAnnouncement>> {
        self.cache.group(group_id)
    }

    pub fn join_requests(&self, group_id: &str) -> SyncResult<Vec<JoinRequest>> {
        self.cache.join_requests(group_id)
    }

    /// Known groups in discovery order.
    pub fn rank_groups(&self, mode: RankMode) -> SyncResult<Vec<GroupAnnouncement>> {
        Ok(rank_groups(
            &self.cache.groups()?,
            mode,
            now_millis(),
            self.config.trending_window_millis(),
        ))
    }
}

/// Handle to a live sync task. Dropping it cancels the task.
pub struct LiveHandle {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl LiveHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel and wait until the task has stopped.
    pub async fn stop(mut self) -> SyncResult<()> {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|e| SyncError::Storage(format!("live sync task failed: {}", e)))?;
        }
        Ok(())
    }
}

impl Drop for LiveHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
