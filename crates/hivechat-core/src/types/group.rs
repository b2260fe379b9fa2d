//! Group directory types
//!
//! Groups are announced on the ledger by their creator; membership is a
//! join-request state machine driven by control operations, optionally gated
//! on a payment.

use serde::{Deserialize, Serialize};

use super::Amount;

const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Most recent join timestamps kept per announcement for trending scores.
pub const MAX_TRACKED_JOINS: usize = 256;

/// Payment a group requires from members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPayment {
    pub amount: Amount,
    /// Renewal interval; `None` means a one-time payment
    pub recurring_days: Option<u32>,
}

impl GroupPayment {
    pub fn is_recurring(&self) -> bool {
        self.recurring_days.is_some()
    }

    /// Validity window of one payment in milliseconds.
    pub fn interval_millis(&self) -> Option<i64> {
        self.recurring_days.map(|d| i64::from(d) * MILLIS_PER_DAY)
    }
}

/// Publicly indexed record of a created group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupAnnouncement {
    pub group_id: String,
    /// Transaction that created the group (tie-breaker for ranking)
    pub tx_id: String,
    pub creator: String,
    pub name: String,
    /// Unix timestamp in milliseconds
    pub created_at: i64,
    pub auto_approve: bool,
    pub payment: Option<GroupPayment>,
    pub member_count: u32,
    /// Timestamps of the most recent join requests (bounded)
    pub join_times: Vec<i64>,
}

impl GroupAnnouncement {
    pub fn requires_payment(&self) -> bool {
        self.payment.as_ref().is_some_and(|p| !p.amount.is_zero())
    }

    /// Join requests observed at or after `since`.
    pub fn joins_since(&self, since: i64) -> usize {
        self.join_times.iter().filter(|t| **t >= since).count()
    }

    pub fn record_join(&mut self, at: i64) {
        self.join_times.push(at);
        self.join_times.sort_unstable();
        if self.join_times.len() > MAX_TRACKED_JOINS {
            let excess = self.join_times.len() - MAX_TRACKED_JOINS;
            self.join_times.drain(..excess);
        }
    }
}

/// Status of a join request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStatus {
    Pending,
    Approved,
    Rejected,
    AutoApproved,
}

impl JoinStatus {
    pub fn is_member(&self) -> bool {
        matches!(self, JoinStatus::Approved | JoinStatus::AutoApproved)
    }
}

impl std::fmt::Display for JoinStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinStatus::Pending => write!(f, "pending"),
            JoinStatus::Approved => write!(f, "approved"),
            JoinStatus::Rejected => write!(f, "rejected"),
            JoinStatus::AutoApproved => write!(f, "auto_approved"),
        }
    }
}

/// Where the current status of a join request came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestOrigin {
    /// Evaluated locally; may be overwritten by the creator's decision
    Optimistic,
    /// Backed by a control operation observed on the ledger
    Confirmed,
}

/// A user's request to join a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub group_id: String,
    pub username: String,
    pub status: JoinStatus,
    pub origin: RequestOrigin,
    pub payment_tx_id: Option<String>,
    /// Transaction carrying the join operation, once observed
    pub request_tx_id: Option<String>,
    /// Unix timestamp in milliseconds
    pub requested_at: i64,
    pub updated_at: i64,
}

impl JoinRequest {
    pub fn pending(group_id: &str, username: &str, origin: RequestOrigin, at: i64) -> Self {
        Self {
            group_id: group_id.to_string(),
            username: username.to_ascii_lowercase(),
            status: JoinStatus::Pending,
            origin,
            payment_tx_id: None,
            request_tx_id: None,
            requested_at: at,
            updated_at: at,
        }
    }
}

/// Status of a group payment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Active,
    Expired,
}

/// A transfer paying for group membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub username: String,
    pub group_id: String,
    pub amount: Amount,
    /// Unix timestamp in milliseconds
    pub paid_at: i64,
    pub tx_id: String,
    /// End of validity for recurring payments
    pub expires_at: Option<i64>,
    pub status: PaymentStatus,
    /// Account the transfer was sent to
    #[serde(default)]
    pub recipient: Option<String>,
}

impl PaymentRecord {
    pub fn new(
        username: &str,
        group_id: &str,
        amount: Amount,
        paid_at: i64,
        tx_id: &str,
        terms: Option<&GroupPayment>,
        now: i64,
    ) -> Self {
        let mut record = Self {
            username: username.to_ascii_lowercase(),
            group_id: group_id.to_string(),
            amount,
            paid_at,
            tx_id: tx_id.to_string(),
            expires_at: None,
            status: PaymentStatus::Active,
            recipient: None,
        };
        record.apply_terms(terms, now);
        record
    }

    /// Recompute expiry from the group's terms, then refresh `status`.
    pub fn apply_terms(&mut self, terms: Option<&GroupPayment>, now: i64) {
        self.expires_at = terms
            .and_then(GroupPayment::interval_millis)
            .map(|interval| self.paid_at.saturating_add(interval));
        self.refresh_status(now);
    }

    /// Recompute `status` against the current time.
    pub fn refresh_status(&mut self, now: i64) {
        self.status = match self.expires_at {
            Some(expires_at) if now >= expires_at => PaymentStatus::Expired,
            _ => PaymentStatus::Active,
        };
    }

    pub fn is_active(&self) -> bool {
        self.status == PaymentStatus::Active
    }

    /// Whether this payment satisfies the group's terms.
    pub fn satisfies(&self, terms: &GroupPayment) -> bool {
        self.is_active() && self.amount.meets(&terms.amount)
    }
}
