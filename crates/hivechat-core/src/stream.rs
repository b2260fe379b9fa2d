//! Ledger operation stream
//!
//! Wraps a [`LedgerClient`] with paging, decoding and ordering. Providers may
//! return a page in any order; everything leaving this module is sorted by
//! `op_index` and free of duplicates.
//!
//! Live-tail mode runs a polling task per subscription:
//!
//! ```text
//!  interval tick ──► get_operations(after watermark) ──► reorder buffer
//!        ▲                                                     │
//!        │                                          drain in op_index order
//!   CancellationToken                                          ▼
//!                                                     mpsc ──► StreamSubscription
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::ledger::{LedgerClient, OperationFilter};
use crate::types::Operation;

/// Buffered operations per live subscription.
const SUBSCRIPTION_CHANNEL_CAPACITY: usize = 256;

/// One decoded page of history.
#[derive(Debug, Clone, Default)]
pub struct FetchedPage {
    /// Decoded operations, ascending by `op_index`
    pub operations: Vec<Operation>,
    /// Highest index the provider returned, including undecodable entries
    pub last_op_index: Option<u64>,
    /// Entries dropped because they could not be decoded
    pub skipped: usize,
}

/// Paged, ordered access to an account's ledger history.
#[derive(Clone)]
pub struct OperationStream {
    ledger: Arc<dyn LedgerClient>,
    filter: OperationFilter,
}

impl OperationStream {
    pub fn new(ledger: Arc<dyn LedgerClient>) -> Self {
        Self {
            ledger,
            filter: OperationFilter::messaging(),
        }
    }

    pub fn with_filter(mut self, filter: OperationFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Index of the newest operation in the account's history.
    pub async fn head(&self, username: &str) -> SyncResult<Option<u64>> {
        self.ledger.head_op_index(username).await
    }

    /// Up to `limit` operations after `since_op_index` (all when `None`).
    pub async fn fetch(
        &self,
        username: &str,
        since_op_index: Option<u64>,
        limit: u32,
    ) -> SyncResult<Vec<Operation>> {
        let from = since_op_index.map_or(0, |i| i + 1);
        Ok(self.fetch_page(username, from, None, limit).await?.operations)
    }

    /// Operations with `from <= op_index <= through`, at most `limit` of them.
    pub async fn fetch_page(
        &self,
        username: &str,
        from: u64,
        through: Option<u64>,
        limit: u32,
    ) -> SyncResult<FetchedPage> {
        let raw = self
            .ledger
            .get_operations(username, limit, &self.filter, from)
            .await?;

        // Re-sort and dedupe: providers are not trusted to do either.
        let mut ordered = BTreeMap::new();
        for (op_index, op) in raw {
            if op_index < from || through.is_some_and(|t| op_index > t) {
                continue;
            }
            ordered.entry(op_index).or_insert(op);
        }

        let mut page = FetchedPage {
            last_op_index: ordered.keys().next_back().copied(),
            ..Default::default()
        };
        for (op_index, raw_op) in ordered {
            match raw_op.decode(op_index) {
                Ok(op) => page.operations.push(op),
                Err(e) => {
                    warn!(username, op_index, error = %e, "Skipping undecodable operation");
                    page.skipped += 1;
                }
            }
        }
        Ok(page)
    }

    /// Live-tail every operation after `from`, exactly once and in order.
    ///
    /// Provider errors are forwarded to the subscriber and polling continues;
    /// the subscriber decides whether to give up.
    pub fn subscribe(
        &self,
        username: &str,
        from: Option<u64>,
        poll_interval: Duration,
        page_limit: u32,
    ) -> StreamSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let stream = self.clone();
        let username = username.to_string();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut delivered = from;
            let mut buffer: BTreeMap<u64, Operation> = BTreeMap::new();
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(username = %username, "Subscription cancelled");
                        break;
                    }
                    _ = ticker.tick() => {}
                }

                // Drain everything available since the watermark.
                loop {
                    let next = delivered.map_or(0, |d| d + 1);
                    let page = match stream.fetch_page(&username, next, None, page_limit).await {
                        Ok(page) => page,
                        Err(e) => {
                            if tx.send(Err(e)).await.is_err() {
                                return;
                            }
                            break;
                        }
                    };
                    let Some(last) = page.last_op_index else { break };
                    for op in page.operations {
                        buffer.insert(op.op_index, op);
                    }
                    if token.is_cancelled() {
                        return;
                    }
                    while let Some((_, op)) = buffer.pop_first() {
                        if tx.send(Ok(op)).await.is_err() {
                            return;
                        }
                    }
                    delivered = Some(last);
                }
            }
        });

        StreamSubscription {
            rx,
            cancel,
            handle: Some(handle),
        }
    }
}

/// Handle to a live-tail subscription. Dropping it cancels polling.
pub struct StreamSubscription {
    rx: mpsc::Receiver<SyncResult<Operation>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl StreamSubscription {
    /// Next operation, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<SyncResult<Operation>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            item = self.rx.recv() => item,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel and wait for the polling task to stop.
    pub async fn shutdown(mut self) -> SyncResult<()> {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|e| SyncError::Storage(format!("subscription task failed: {}", e)))?;
        }
        Ok(())
    }
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
