//! Minimum-payment admission control
//!
//! Every direct message is a transfer, so a recipient can price out spam by
//! publishing a minimum amount. Senders on the recipient's exception list are
//! always admitted.
//!
//! The recipient's minimum comes from the ledger and is cached per recipient
//! for `minimum_ttl`. Until a lookup succeeds the configured default applies
//! and the decision is marked *unverified*; such messages carry
//! `spam_unverified` and are re-checked once the minimum is known.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SyncResult;
use crate::ledger::LedgerClient;
use crate::storage::{ExceptionEntry, LocalState};
use crate::types::Amount;

/// What is known about a recipient's minimum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MinimumStatus {
    /// Published by the account and fetched successfully
    Verified(Amount),
    /// The account has no minimum configured; the default applies (verified)
    DefaultUnset,
    /// No lookup has completed yet
    Pending,
    /// The last lookup failed
    FetchFailed,
}

impl MinimumStatus {
    pub fn is_verified(&self) -> bool {
        matches!(self, MinimumStatus::Verified(_) | MinimumStatus::DefaultUnset)
    }

    /// Threshold in force for this status.
    pub fn effective(&self, default: Amount) -> Amount {
        match self {
            MinimumStatus::Verified(minimum) => *minimum,
            _ => default,
        }
    }
}

/// Outcome of one admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub admitted: bool,
    /// Decided against an unverified default
    pub unverified: bool,
    /// Threshold the decision used
    pub minimum: Amount,
}

/// Pure admission rule.
pub fn evaluate(
    is_exception: bool,
    amount: &Amount,
    status: MinimumStatus,
    default: Amount,
) -> Admission {
    let minimum = status.effective(default);
    if is_exception {
        return Admission {
            admitted: true,
            unverified: false,
            minimum,
        };
    }
    Admission {
        admitted: amount.meets(&minimum),
        unverified: !status.is_verified(),
        minimum,
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedMinimum {
    status: MinimumStatus,
    fetched_at: Instant,
}

/// Admission control for one viewing account.
#[derive(Clone)]
pub struct SpamFilter {
    owner: String,
    ledger: Arc<dyn LedgerClient>,
    state: LocalState,
    default_minimum: Amount,
    ttl: Duration,
    minimums: Arc<Mutex<HashMap<String, CachedMinimum>>>,
}

impl SpamFilter {
    pub fn new(
        owner: &str,
        ledger: Arc<dyn LedgerClient>,
        state: LocalState,
        default_minimum: Amount,
        ttl: Duration,
    ) -> Self {
        Self {
            owner: owner.to_ascii_lowercase(),
            ledger,
            state,
            default_minimum,
            ttl,
            minimums: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn default_minimum(&self) -> Amount {
        self.default_minimum
    }

    /// Cached status without touching the ledger.
    pub fn cached_minimum(&self, recipient: &str) -> MinimumStatus {
        let minimums = self.minimums.lock();
        match minimums.get(&recipient.to_ascii_lowercase()) {
            Some(cached) if cached.fetched_at.elapsed() < self.ttl => cached.status,
            _ => MinimumStatus::Pending,
        }
    }

    /// Cached status, refreshed from the ledger when stale.
    ///
    /// Failed lookups are not cached, so the next call tries again.
    pub async fn resolve_minimum(&self, recipient: &str) -> MinimumStatus {
        let cached = self.cached_minimum(recipient);
        if cached != MinimumStatus::Pending {
            return cached;
        }

        let status = match self.ledger.get_minimum_payment(recipient).await {
            Ok(Some(minimum)) => MinimumStatus::Verified(minimum),
            Ok(None) => MinimumStatus::DefaultUnset,
            Err(e) => {
                warn!(recipient, error = %e, "Minimum payment lookup failed");
                return MinimumStatus::FetchFailed;
            }
        };
        debug!(recipient, ?status, "Minimum payment refreshed");
        self.minimums.lock().insert(
            recipient.to_ascii_lowercase(),
            CachedMinimum {
                status,
                fetched_at: Instant::now(),
            },
        );
        status
    }

    /// Drop the cached minimum so the next check refetches it.
    pub fn invalidate(&self, recipient: &str) {
        self.minimums.lock().remove(&recipient.to_ascii_lowercase());
    }

    /// Admission of a transfer from `from` to the owner.
    pub async fn admit(&self, from: &str, amount: &Amount) -> SyncResult<Admission> {
        let is_exception = self.is_exception(from)?;
        let status = if is_exception {
            self.cached_minimum(&self.owner)
        } else {
            self.resolve_minimum(&self.owner).await
        };
        Ok(evaluate(is_exception, amount, status, self.default_minimum))
    }

    pub fn is_exception(&self, username: &str) -> SyncResult<bool> {
        self.state.is_exception(&self.owner, username)
    }

    pub fn exceptions(&self) -> SyncResult<Vec<ExceptionEntry>> {
        self.state.exceptions(&self.owner)
    }

    pub fn add_exception(&self, username: &str, at: i64) -> SyncResult<bool> {
        self.state.add_exception(&self.owner, username, at)
    }

    pub fn remove_exception(&self, username: &str) -> SyncResult<bool> {
        self.state.remove_exception(&self.owner, username)
    }
}
