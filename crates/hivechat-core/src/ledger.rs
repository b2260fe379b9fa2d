//! Ledger read contract
//!
//! The RPC client itself lives outside this crate. Anything that can answer
//! [`LedgerClient`] can feed the sync engine: a JSON-RPC node client, a
//! replay file, or the in-memory [`MemoryLedger`] used by tests and the CLI.
//!
//! Operations arrive in their wire shape ([`LedgerOperation`]) and are decoded
//! into typed [`Operation`]s here, so the rest of the pipeline never touches
//! raw strings for amounts or timestamps.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::types::{Amount, CustomJson, Operation, OperationKind, OperationPayload, Transfer};

/// Which operation kinds a history request should return
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationFilter {
    pub kinds: Vec<OperationKind>,
}

impl OperationFilter {
    /// Transfers and custom_json: everything the messaging pipeline consumes.
    pub fn messaging() -> Self {
        Self {
            kinds: vec![OperationKind::Transfer, OperationKind::CustomJson],
        }
    }

    pub fn accepts(&self, kind: OperationKind) -> bool {
        self.kinds.contains(&kind)
    }
}

impl Default for OperationFilter {
    fn default() -> Self {
        Self::messaging()
    }
}

/// Operation as returned by the ledger RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerOperation {
    /// `"transfer"` or `"custom_json"`
    #[serde(rename = "type")]
    pub op_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_auths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_posting_auths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<String>,
    pub trx_id: String,
    pub block: u64,
    /// `2024-03-01T12:00:00` (UTC, no zone) or RFC 3339
    pub timestamp: String,
}

impl LedgerOperation {
    pub fn kind(&self) -> Option<OperationKind> {
        match self.op_type.as_str() {
            "transfer" => Some(OperationKind::Transfer),
            "custom_json" => Some(OperationKind::CustomJson),
            _ => None,
        }
    }

    /// Decode into a typed [`Operation`] at the given history position.
    pub fn decode(&self, op_index: u64) -> SyncResult<Operation> {
        let invalid = |what: &str| {
            SyncError::InvalidOperation(format!("op {} ({}): {}", op_index, self.trx_id, what))
        };
        let timestamp = parse_timestamp(&self.timestamp).ok_or_else(|| invalid("bad timestamp"))?;

        match self.kind() {
            Some(OperationKind::Transfer) => {
                let from = self.from.clone().ok_or_else(|| invalid("transfer without from"))?;
                let to = self.to.clone().ok_or_else(|| invalid("transfer without to"))?;
                let amount: Amount = self
                    .amount
                    .as_deref()
                    .ok_or_else(|| invalid("transfer without amount"))?
                    .parse()
                    .map_err(|_| invalid("bad amount"))?;
                Ok(Operation {
                    op_index,
                    block_num: self.block,
                    tx_id: self.trx_id.clone(),
                    timestamp,
                    from: from.to_ascii_lowercase(),
                    to: Some(to.to_ascii_lowercase()),
                    payload: OperationPayload::Transfer(Transfer {
                        amount,
                        memo: self.memo.clone().unwrap_or_default(),
                    }),
                })
            }
            Some(OperationKind::CustomJson) => {
                let from = self
                    .required_auths
                    .first()
                    .or_else(|| self.required_posting_auths.first())
                    .or(self.from.as_ref())
                    .cloned()
                    .ok_or_else(|| invalid("custom_json without authority"))?;
                let id = self.id.clone().ok_or_else(|| invalid("custom_json without id"))?;
                let json = match self.json.as_deref() {
                    Some(raw) => serde_json::from_str(raw).map_err(|_| invalid("bad json body"))?,
                    None => serde_json::Value::Null,
                };
                Ok(Operation {
                    op_index,
                    block_num: self.block,
                    tx_id: self.trx_id.clone(),
                    timestamp,
                    from: from.to_ascii_lowercase(),
                    to: self.to.as_ref().map(|t| t.to_ascii_lowercase()),
                    payload: OperationPayload::CustomJson(CustomJson { id, json }),
                })
            }
            None => Err(invalid("unsupported operation type")),
        }
    }
}

/// Parse a ledger timestamp into Unix milliseconds.
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc().timestamp_millis());
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// Format Unix milliseconds the way the ledger does.
pub fn format_timestamp(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .unwrap_or_default()
        .format("%Y-%m-%dT%H:%M:%S")
        .to_string()
}

/// Read access to an account's ledger history.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Up to `limit` operations with index `>= from_op_index`, matching
    /// `filter`, as `(op_index, operation)` pairs.
    async fn get_operations(
        &self,
        account: &str,
        limit: u32,
        filter: &OperationFilter,
        from_op_index: u64,
    ) -> SyncResult<Vec<(u64, LedgerOperation)>>;

    /// Index of the newest operation in the account's history.
    async fn head_op_index(&self, account: &str) -> SyncResult<Option<u64>>;

    /// Minimum transfer the account accepts messages for, from its profile
    /// metadata. `None` when the account never configured one.
    async fn get_minimum_payment(&self, account: &str) -> SyncResult<Option<Amount>>;
}

/// Serialized form of a [`MemoryLedger`] (replay files).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    #[serde(default)]
    pub accounts: BTreeMap<String, Vec<LedgerOperation>>,
    /// Per-account minimum payment, as `"0.001 HBD"`
    #[serde(default)]
    pub minimums: BTreeMap<String, String>,
}

/// In-memory ledger keeping per-account histories.
///
/// Recording a transfer appends it to both the sender's and the recipient's
/// history, the way account history indexes work on the real chain.
pub struct MemoryLedger {
    histories: RwLock<HashMap<String, Vec<LedgerOperation>>>,
    minimums: RwLock<HashMap<String, Amount>>,
    available: AtomicBool,
    reverse_pages: AtomicBool,
    next_tx: AtomicU64,
    clock: AtomicU64,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            histories: RwLock::new(HashMap::new()),
            minimums: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            reverse_pages: AtomicBool::new(false),
            next_tx: AtomicU64::new(1),
            clock: AtomicU64::new(1_700_000_000_000),
        }
    }

    /// Load a replay file.
    pub fn load(path: impl AsRef<Path>) -> SyncResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let snapshot: LedgerSnapshot = serde_json::from_str(&raw)?;
        Self::from_snapshot(snapshot)
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot) -> SyncResult<Self> {
        let ledger = Self::new();
        {
            let mut histories = ledger.histories.write();
            for (account, ops) in snapshot.accounts {
                histories.insert(account.to_ascii_lowercase(), ops);
            }
        }
        for (account, minimum) in snapshot.minimums {
            ledger.set_minimum(&account, minimum.parse()?);
        }
        Ok(ledger)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            accounts: self
                .histories
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            minimums: self
                .minimums
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect(),
        }
    }

    /// Simulate the RPC node going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Return pages newest-first, like providers that do not sort.
    pub fn set_reverse_pages(&self, reverse: bool) {
        self.reverse_pages.store(reverse, Ordering::SeqCst);
    }

    pub fn set_minimum(&self, account: &str, minimum: Amount) {
        self.minimums
            .write()
            .insert(account.to_ascii_lowercase(), minimum);
    }

    fn next_tx_id(&self) -> String {
        let n = self.next_tx.fetch_add(1, Ordering::SeqCst);
        format!("{:040x}", n)
    }

    fn next_timestamp(&self) -> String {
        let millis = self.clock.fetch_add(3_000, Ordering::SeqCst);
        format_timestamp(millis as i64)
    }

    /// Append a raw operation to the listed accounts' histories.
    pub fn push(&self, accounts: &[&str], op: LedgerOperation) {
        let mut histories = self.histories.write();
        let mut seen = Vec::new();
        for account in accounts {
            let account = account.to_ascii_lowercase();
            if seen.contains(&account) {
                continue;
            }
            histories.entry(account.clone()).or_default().push(op.clone());
            seen.push(account);
        }
    }

    /// Record a transfer in both parties' histories; returns the tx id.
    pub fn transfer(&self, from: &str, to: &str, amount: &str, memo: &str) -> String {
        let trx_id = self.next_tx_id();
        let op = LedgerOperation {
            op_type: "transfer".to_string(),
            from: Some(from.to_string()),
            to: Some(to.to_string()),
            required_auths: Vec::new(),
            required_posting_auths: Vec::new(),
            amount: Some(amount.to_string()),
            memo: Some(memo.to_string()),
            id: None,
            json: None,
            trx_id: trx_id.clone(),
            block: self.next_tx.load(Ordering::SeqCst),
            timestamp: self.next_timestamp(),
        };
        self.push(&[from, to], op);
        trx_id
    }

    /// Record a custom_json signed by `author` and visible to `audience`.
    pub fn custom_json(
        &self,
        author: &str,
        id: &str,
        json: &serde_json::Value,
        audience: &[&str],
    ) -> String {
        let trx_id = self.next_tx_id();
        let op = LedgerOperation {
            op_type: "custom_json".to_string(),
            from: None,
            to: None,
            required_auths: Vec::new(),
            required_posting_auths: vec![author.to_string()],
            amount: None,
            memo: None,
            id: Some(id.to_string()),
            json: Some(json.to_string()),
            trx_id: trx_id.clone(),
            block: self.next_tx.load(Ordering::SeqCst),
            timestamp: self.next_timestamp(),
        };
        let mut accounts = vec![author];
        accounts.extend_from_slice(audience);
        self.push(&accounts, op);
        trx_id
    }

    fn ensure_available(&self) -> SyncResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::ProviderUnavailable("memory ledger offline".into()))
        }
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn get_operations(
        &self,
        account: &str,
        limit: u32,
        filter: &OperationFilter,
        from_op_index: u64,
    ) -> SyncResult<Vec<(u64, LedgerOperation)>> {
        self.ensure_available()?;
        let histories = self.histories.read();
        let Some(history) = histories.get(&account.to_ascii_lowercase()) else {
            return Ok(Vec::new());
        };
        let mut page: Vec<(u64, LedgerOperation)> = history
            .iter()
            .enumerate()
            .skip(from_op_index.min(usize::MAX as u64) as usize)
            .filter(|(_, op)| op.kind().is_some_and(|k| filter.accepts(k)))
            .take(limit as usize)
            .map(|(i, op)| (i as u64, op.clone()))
            .collect();
        if self.reverse_pages.load(Ordering::SeqCst) {
            page.reverse();
        }
        Ok(page)
    }

    async fn head_op_index(&self, account: &str) -> SyncResult<Option<u64>> {
        self.ensure_available()?;
        let histories = self.histories.read();
        Ok(histories
            .get(&account.to_ascii_lowercase())
            .and_then(|h| h.len().checked_sub(1))
            .map(|i| i as u64))
    }

    async fn get_minimum_payment(&self, account: &str) -> SyncResult<Option<Amount>> {
        self.ensure_available()?;
        Ok(self
            .minimums
            .read()
            .get(&account.to_ascii_lowercase())
            .copied())
    }
}
