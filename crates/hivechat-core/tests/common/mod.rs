//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hivechat_core::storage::{CacheBackend, MemoryBackend, Table, WriteBatch};
use hivechat_core::{
    Amount, LedgerClient, LedgerOperation, LocalState, LoopbackKeyHolder, MemoryLedger,
    MessageCache, OperationFilter, SyncConfig, SyncEngine, SyncError, SyncResult,
};

/// Engine plus handles to everything behind it.
pub struct Harness {
    pub engine: Arc<SyncEngine>,
    pub ledger: Arc<MemoryLedger>,
    pub keys: Arc<LoopbackKeyHolder>,
    pub state: LocalState,
    pub cache: MessageCache,
}

pub fn harness(viewer: &str) -> Harness {
    harness_with(viewer, Arc::new(MemoryLedger::new()), SyncConfig::default())
}

pub fn harness_with(viewer: &str, ledger: Arc<MemoryLedger>, config: SyncConfig) -> Harness {
    harness_over(viewer, ledger.clone(), ledger, MessageCache::in_memory(), config)
}

/// Harness whose engine talks to `client` while tests script `ledger`.
pub fn harness_over(
    viewer: &str,
    ledger: Arc<MemoryLedger>,
    client: Arc<dyn LedgerClient>,
    cache: MessageCache,
    config: SyncConfig,
) -> Harness {
    let keys = Arc::new(LoopbackKeyHolder::new([viewer]));
    let state = LocalState::in_memory();
    let engine = SyncEngine::with_stores(
        viewer,
        client,
        keys.clone(),
        cache.clone(),
        state.clone(),
        config,
    )
    .unwrap();
    Harness {
        engine: Arc::new(engine),
        ledger,
        keys,
        state,
        cache,
    }
}

pub fn hbd(s: &str) -> Amount {
    s.parse().unwrap()
}

/// Ledger whose minimum-payment lookups can be switched off on their own.
pub struct FlakyMinimums {
    pub inner: Arc<MemoryLedger>,
    pub minimums_online: AtomicBool,
}

impl FlakyMinimums {
    pub fn new(inner: Arc<MemoryLedger>) -> Self {
        Self {
            inner,
            minimums_online: AtomicBool::new(true),
        }
    }

    pub fn set_minimums_online(&self, online: bool) {
        self.minimums_online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl LedgerClient for FlakyMinimums {
    async fn get_operations(
        &self,
        account: &str,
        limit: u32,
        filter: &OperationFilter,
        from_op_index: u64,
    ) -> SyncResult<Vec<(u64, LedgerOperation)>> {
        self.inner
            .get_operations(account, limit, filter, from_op_index)
            .await
    }

    async fn head_op_index(&self, account: &str) -> SyncResult<Option<u64>> {
        self.inner.head_op_index(account).await
    }

    async fn get_minimum_payment(&self, account: &str) -> SyncResult<Option<Amount>> {
        if !self.minimums_online.load(Ordering::SeqCst) {
            return Err(SyncError::ProviderUnavailable("profile lookup down".into()));
        }
        self.inner.get_minimum_payment(account).await
    }
}

/// Backend whose commits can be made to fail.
pub struct FailingBackend {
    pub inner: MemoryBackend,
    pub fail_commits: AtomicBool,
}

impl FailingBackend {
    pub fn new() -> Self {
        Self {
            inner: MemoryBackend::new(),
            fail_commits: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_commits.store(failing, Ordering::SeqCst);
    }
}

impl CacheBackend for FailingBackend {
    fn get(&self, table: Table, key: &str) -> SyncResult<Option<Vec<u8>>> {
        self.inner.get(table, key)
    }

    fn scan_prefix(&self, table: Table, prefix: &str) -> SyncResult<Vec<(String, Vec<u8>)>> {
        self.inner.scan_prefix(table, prefix)
    }

    fn scan_range(
        &self,
        table: Table,
        start: &str,
        end: &str,
    ) -> SyncResult<Vec<(String, Vec<u8>)>> {
        self.inner.scan_range(table, start, end)
    }

    fn commit(&self, batch: WriteBatch) -> SyncResult<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(SyncError::Storage("disk full".into()));
        }
        self.inner.commit(batch)
    }
}
