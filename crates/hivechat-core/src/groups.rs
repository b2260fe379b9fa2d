//! Group directory: announcements, join requests and payments
//!
//! Groups live entirely on the ledger as `hivechat-group` custom_json
//! operations signed by their members:
//!
//! ```json
//! {"action":"create","group_id":"01H...","name":"Rustaceans","auto_approve":true,
//!  "payment":{"amount":"1.000 HBD","recurring_days":30}}
//! {"action":"join","group_id":"01H..."}
//! {"action":"approve","group_id":"01H...","username":"carol"}
//! ```
//!
//! Membership payments are transfers to the creator with memo
//! `hivechat-group-pay:<group_id>`.
//!
//! ## Join request state machine
//!
//! ```text
//!             creator approves (Confirmed)
//!   pending ───────────────────────────────► approved
//!      │  └──── creator rejects (Confirmed) ─► rejected
//!      │
//!      └── auto_approve && payment active ──► auto_approved   (Optimistic)
//! ```
//!
//! The auto-approval is evaluated by the requesting user's own client. When
//! the creator's decision shows up it always wins; a disagreement with the
//! optimistic state is reported as a [`ConflictingControlOperation`].

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::classifier::{group_payment_target, GROUP_CONTROL_ID, GROUP_PAYMENT_MEMO_PREFIX};
use crate::error::{SyncError, SyncResult};
use crate::storage::CacheTxn;
use crate::types::{
    Amount, GroupAnnouncement, GroupPayment, JoinRequest, JoinStatus, Operation,
    OperationPayload, PaymentRecord, RequestOrigin,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PaymentBody {
    amount: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    recurring_days: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ControlBody {
    action: String,
    group_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auto_approve: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payment: Option<PaymentBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
}

/// A decoded `hivechat-group` operation body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupControl {
    Create {
        group_id: String,
        name: String,
        auto_approve: bool,
        payment: Option<GroupPayment>,
    },
    Join {
        group_id: String,
    },
    Approve {
        group_id: String,
        username: String,
    },
    Reject {
        group_id: String,
        username: String,
    },
}

impl GroupControl {
    pub fn group_id(&self) -> &str {
        match self {
            GroupControl::Create { group_id, .. }
            | GroupControl::Join { group_id }
            | GroupControl::Approve { group_id, .. }
            | GroupControl::Reject { group_id, .. } => group_id,
        }
    }

    pub fn parse(json: &serde_json::Value) -> SyncResult<Self> {
        let body: ControlBody = serde_json::from_value(json.clone())?;
        if body.group_id.is_empty() {
            return Err(SyncError::InvalidOperation("group control without group_id".into()));
        }
        let target = |body: &ControlBody| {
            body.username
                .as_ref()
                .map(|u| u.to_ascii_lowercase())
                .ok_or_else(|| {
                    SyncError::InvalidOperation(format!("{} without username", body.action))
                })
        };

        match body.action.as_str() {
            "create" => {
                let payment = match &body.payment {
                    Some(p) => Some(GroupPayment {
                        amount: p.amount.parse()?,
                        recurring_days: p.recurring_days.filter(|d| *d > 0),
                    }),
                    None => None,
                };
                Ok(GroupControl::Create {
                    name: body.name.clone().unwrap_or_else(|| body.group_id.clone()),
                    auto_approve: body.auto_approve.unwrap_or(false),
                    group_id: body.group_id,
                    payment,
                })
            }
            "join" => Ok(GroupControl::Join {
                group_id: body.group_id,
            }),
            "approve" => Ok(GroupControl::Approve {
                username: target(&body)?,
                group_id: body.group_id,
            }),
            "reject" => Ok(GroupControl::Reject {
                username: target(&body)?,
                group_id: body.group_id,
            }),
            other => Err(SyncError::InvalidOperation(format!(
                "unknown group action {:?}",
                other
            ))),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut body = ControlBody {
            action: String::new(),
            group_id: self.group_id().to_string(),
            name: None,
            auto_approve: None,
            payment: None,
            username: None,
        };
        match self {
            GroupControl::Create {
                name,
                auto_approve,
                payment,
                ..
            } => {
                body.action = "create".into();
                body.name = Some(name.clone());
                body.auto_approve = Some(*auto_approve);
                body.payment = payment.as_ref().map(|p| PaymentBody {
                    amount: p.amount.to_string(),
                    recurring_days: p.recurring_days,
                });
            }
            GroupControl::Join { .. } => body.action = "join".into(),
            GroupControl::Approve { username, .. } => {
                body.action = "approve".into();
                body.username = Some(username.clone());
            }
            GroupControl::Reject { username, .. } => {
                body.action = "reject".into();
                body.username = Some(username.clone());
            }
        }
        serde_json::to_value(body).unwrap_or(serde_json::Value::Null)
    }
}

/// custom_json the caller must sign and broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingCustomJson {
    pub id: String,
    pub required_posting_auths: Vec<String>,
    pub json: serde_json::Value,
}

impl OutgoingCustomJson {
    pub fn control(author: &str, control: &GroupControl) -> Self {
        Self {
            id: GROUP_CONTROL_ID.to_string(),
            required_posting_auths: vec![author.to_ascii_lowercase()],
            json: control.to_json(),
        }
    }
}

/// Memo of a membership payment transfer.
pub fn payment_memo(group_id: &str) -> String {
    format!("{}{}", GROUP_PAYMENT_MEMO_PREFIX, group_id)
}

/// The creator's decision disagreed with a locally evaluated status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictingControlOperation {
    pub group_id: String,
    pub username: String,
    pub local_status: JoinStatus,
    pub confirmed_status: JoinStatus,
    pub tx_id: String,
}

/// What applying one group-control operation did
#[derive(Debug, Clone, PartialEq)]
pub enum ControlOutcome {
    Created,
    JoinRecorded { auto_approved: bool },
    Decided { status: JoinStatus },
    Conflict(ConflictingControlOperation),
    PaymentRecorded { auto_approved: bool },
    Ignored(String),
}

/// Group discovery ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankMode {
    /// Most recently created first
    Newest,
    /// Most join requests within the trending window first
    Trending,
    /// Recent joins discounted by group age
    Hot,
}

impl FromStr for RankMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "newest" => Ok(RankMode::Newest),
            "trending" => Ok(RankMode::Trending),
            "hot" => Ok(RankMode::Hot),
            other => Err(SyncError::Config(format!("unknown ranking {:?}", other))),
        }
    }
}

fn hot_score(ann: &GroupAnnouncement, now: i64, window_millis: i64) -> f64 {
    let recent = ann.joins_since(now.saturating_sub(window_millis)) as f64;
    let age_hours = (now.saturating_sub(ann.created_at)).max(0) as f64 / 3_600_000.0;
    (recent + f64::from(ann.member_count) + 1.0) / (age_hours + 2.0).powf(1.5)
}

/// Order announcements for discovery. Ties break by `tx_id` ascending.
pub fn rank_groups(
    announcements: &[GroupAnnouncement],
    mode: RankMode,
    now: i64,
    window_millis: i64,
) -> Vec<GroupAnnouncement> {
    let mut ranked = announcements.to_vec();
    match mode {
        RankMode::Newest => ranked.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.tx_id.cmp(&b.tx_id))
        }),
        RankMode::Trending => {
            let since = now.saturating_sub(window_millis);
            ranked.sort_by(|a, b| {
                b.joins_since(since)
                    .cmp(&a.joins_since(since))
                    .then_with(|| a.tx_id.cmp(&b.tx_id))
            })
        }
        RankMode::Hot => ranked.sort_by(|a, b| {
            hot_score(b, now, window_millis)
                .total_cmp(&hot_score(a, now, window_millis))
                .then_with(|| a.tx_id.cmp(&b.tx_id))
        }),
    }
    ranked
}

/// Applies group-control operations for one viewing account.
#[derive(Debug, Clone)]
pub struct GroupDirectory {
    viewer: String,
}

impl GroupDirectory {
    pub fn new(viewer: &str) -> Self {
        Self {
            viewer: viewer.to_ascii_lowercase(),
        }
    }

    /// Apply a group-control operation (custom_json or payment transfer).
    pub fn apply(
        &self,
        txn: &mut CacheTxn<'_>,
        op: &Operation,
        now: i64,
    ) -> SyncResult<ControlOutcome> {
        match &op.payload {
            OperationPayload::Transfer(transfer) => {
                match group_payment_target(&transfer.memo) {
                    Some(group_id) => {
                        let group_id = group_id.to_string();
                        self.record_payment(txn, op, &group_id, transfer.amount, now)
                    }
                    None => Ok(ControlOutcome::Ignored("not a group payment".into())),
                }
            }
            OperationPayload::CustomJson(custom) => {
                let control = match GroupControl::parse(&custom.json) {
                    Ok(control) => control,
                    Err(e) => {
                        warn!(tx_id = %op.tx_id, error = %e, "Ignoring malformed group control");
                        return Ok(ControlOutcome::Ignored(e.to_string()));
                    }
                };
                self.apply_control(txn, op, control, now)
            }
        }
    }

    fn apply_control(
        &self,
        txn: &mut CacheTxn<'_>,
        op: &Operation,
        control: GroupControl,
        now: i64,
    ) -> SyncResult<ControlOutcome> {
        match control {
            GroupControl::Create {
                group_id,
                name,
                auto_approve,
                payment,
            } => {
                if let Some(existing) = txn.group(&group_id)? {
                    if existing.tx_id != op.tx_id {
                        debug!(group_id = %group_id, "Ignoring second create for existing group");
                    }
                    return Ok(ControlOutcome::Ignored("group already exists".into()));
                }
                let announcement = GroupAnnouncement {
                    group_id: group_id.clone(),
                    tx_id: op.tx_id.clone(),
                    creator: op.from.clone(),
                    name,
                    created_at: op.timestamp,
                    auto_approve,
                    payment,
                    member_count: 0,
                    join_times: Vec::new(),
                };
                txn.put_group(&announcement)?;
                self.settle_early_payments(txn, &announcement, now)?;
                info!(group_id = %group_id, creator = %op.from, "Group announced");
                Ok(ControlOutcome::Created)
            }
            GroupControl::Join { group_id } => self.record_join(txn, op, &group_id, now),
            GroupControl::Approve { group_id, username } => {
                self.decide(txn, op, &group_id, &username, JoinStatus::Approved)
            }
            GroupControl::Reject { group_id, username } => {
                self.decide(txn, op, &group_id, &username, JoinStatus::Rejected)
            }
        }
    }

    fn record_join(
        &self,
        txn: &mut CacheTxn<'_>,
        op: &Operation,
        group_id: &str,
        now: i64,
    ) -> SyncResult<ControlOutcome> {
        let username = op.from.clone();
        let mut request = match txn.join_request(group_id, &username)? {
            Some(existing) if existing.request_tx_id.as_deref() == Some(op.tx_id.as_str()) => {
                return Ok(ControlOutcome::Ignored("join already recorded".into()));
            }
            Some(existing) => existing,
            None => JoinRequest::pending(group_id, &username, RequestOrigin::Confirmed, op.timestamp),
        };
        request.request_tx_id = Some(op.tx_id.clone());
        request.updated_at = op.timestamp;
        txn.put_join_request(&request)?;

        if let Some(mut group) = txn.group(group_id)? {
            group.record_join(op.timestamp);
            txn.put_group(&group)?;
        }

        let auto_approved = if username == self.viewer {
            self.evaluate_auto_approve(txn, group_id, &username, now)?
                .is_some_and(|r| r.status == JoinStatus::AutoApproved)
        } else {
            false
        };
        Ok(ControlOutcome::JoinRecorded { auto_approved })
    }

    fn decide(
        &self,
        txn: &mut CacheTxn<'_>,
        op: &Operation,
        group_id: &str,
        username: &str,
        decision: JoinStatus,
    ) -> SyncResult<ControlOutcome> {
        let Some(group) = txn.group(group_id)? else {
            debug!(group_id, "Decision for unknown group");
            return Ok(ControlOutcome::Ignored("unknown group".into()));
        };
        if !op.from.eq_ignore_ascii_case(&group.creator) {
            warn!(
                group_id,
                from = %op.from,
                creator = %group.creator,
                "Ignoring control operation from non-creator"
            );
            return Ok(ControlOutcome::Ignored("not the group creator".into()));
        }

        let mut request = txn.join_request(group_id, username)?.unwrap_or_else(|| {
            JoinRequest::pending(group_id, username, RequestOrigin::Confirmed, op.timestamp)
        });

        let conflict = (request.origin == RequestOrigin::Optimistic
            && request.status != JoinStatus::Pending
            && request.status.is_member() != decision.is_member())
            .then(|| ConflictingControlOperation {
                group_id: group_id.to_string(),
                username: request.username.clone(),
                local_status: request.status,
                confirmed_status: decision,
                tx_id: op.tx_id.clone(),
            });

        request.status = decision;
        request.origin = RequestOrigin::Confirmed;
        request.updated_at = op.timestamp;
        txn.put_join_request(&request)?;
        self.recount_members(txn, group)?;

        match conflict {
            Some(conflict) => {
                warn!(
                    group_id,
                    username = %conflict.username,
                    local = %conflict.local_status,
                    confirmed = %conflict.confirmed_status,
                    "Creator decision overrides local status"
                );
                Ok(ControlOutcome::Conflict(conflict))
            }
            None => Ok(ControlOutcome::Decided { status: decision }),
        }
    }

    fn record_payment(
        &self,
        txn: &mut CacheTxn<'_>,
        op: &Operation,
        group_id: &str,
        amount: Amount,
        now: i64,
    ) -> SyncResult<ControlOutcome> {
        let group = txn.group(group_id)?;
        if let (Some(group), Some(to)) = (&group, &op.to) {
            if !to.eq_ignore_ascii_case(&group.creator) {
                return Ok(ControlOutcome::Ignored("payment not sent to the creator".into()));
            }
        }

        let terms = group.as_ref().and_then(|g| g.payment.as_ref());
        let mut record = PaymentRecord::new(&op.from, group_id, amount, op.timestamp, &op.tx_id, terms, now);
        record.recipient = op.to.as_ref().map(|to| to.to_ascii_lowercase());
        txn.put_payment(&record)?;
        debug!(group_id, payer = %op.from, amount = %amount, "Group payment recorded");

        let auto_approved = if op.from.eq_ignore_ascii_case(&self.viewer) {
            self.evaluate_auto_approve(txn, group_id, &op.from, now)?
                .is_some_and(|r| r.status == JoinStatus::AutoApproved)
        } else {
            false
        };
        Ok(ControlOutcome::PaymentRecorded { auto_approved })
    }

    /// Apply a new announcement's terms to payments seen before it.
    ///
    /// Payments not addressed to the creator are dropped; the rest get their
    /// expiry from the announced interval.
    fn settle_early_payments(
        &self,
        txn: &mut CacheTxn<'_>,
        group: &GroupAnnouncement,
        now: i64,
    ) -> SyncResult<()> {
        for mut payment in txn.group_payments(&group.group_id)? {
            let misaddressed = payment
                .recipient
                .as_deref()
                .is_some_and(|to| !to.eq_ignore_ascii_case(&group.creator));
            if misaddressed {
                debug!(group_id = %group.group_id, tx_id = %payment.tx_id, "Dropping payment not sent to the creator");
                txn.delete_payment(&payment);
                continue;
            }
            payment.apply_terms(group.payment.as_ref(), now);
            txn.put_payment(&payment)?;
        }
        Ok(())
    }

    /// Whether `username` holds an active payment satisfying the group's terms.
    pub fn payment_satisfied(
        &self,
        txn: &CacheTxn<'_>,
        group: &GroupAnnouncement,
        username: &str,
        now: i64,
    ) -> SyncResult<bool> {
        let Some(terms) = group.payment.as_ref().filter(|_| group.requires_payment()) else {
            return Ok(true);
        };
        Ok(txn
            .payments(&group.group_id, username)?
            .into_iter()
            .any(|mut p| {
                p.refresh_status(now);
                p.satisfies(terms)
            }))
    }

    /// Locally promote a pending request to `auto_approved` when eligible.
    ///
    /// Returns the request as stored afterwards.
    pub fn evaluate_auto_approve(
        &self,
        txn: &mut CacheTxn<'_>,
        group_id: &str,
        username: &str,
        now: i64,
    ) -> SyncResult<Option<JoinRequest>> {
        let Some(mut request) = txn.join_request(group_id, username)? else {
            return Ok(None);
        };
        if request.status != JoinStatus::Pending {
            return Ok(Some(request));
        }
        let Some(group) = txn.group(group_id)? else {
            return Ok(Some(request));
        };
        if !group.auto_approve || !self.payment_satisfied(txn, &group, username, now)? {
            return Ok(Some(request));
        }

        request.status = JoinStatus::AutoApproved;
        request.origin = RequestOrigin::Optimistic;
        request.updated_at = now;
        if let Some(payment) = txn.payments(group_id, username)?.last() {
            request.payment_tx_id = Some(payment.tx_id.clone());
        }
        txn.put_join_request(&request)?;
        info!(group_id, username, "Join request auto-approved locally");
        Ok(Some(request))
    }

    /// Record the viewer's own join request before it is broadcast.
    pub fn request_join(
        &self,
        txn: &mut CacheTxn<'_>,
        group_id: &str,
        now: i64,
    ) -> SyncResult<JoinRequest> {
        if txn.group(group_id)?.is_none() {
            return Err(SyncError::GroupNotFound(group_id.to_string()));
        }
        let request = match txn.join_request(group_id, &self.viewer)? {
            Some(existing) => existing,
            None => {
                let request =
                    JoinRequest::pending(group_id, &self.viewer, RequestOrigin::Optimistic, now);
                txn.put_join_request(&request)?;
                request
            }
        };
        Ok(self
            .evaluate_auto_approve(txn, group_id, &self.viewer, now)?
            .unwrap_or(request))
    }

    fn recount_members(&self, txn: &mut CacheTxn<'_>, mut group: GroupAnnouncement) -> SyncResult<()> {
        let members = txn
            .join_requests(&group.group_id)?
            .iter()
            .filter(|r| r.origin == RequestOrigin::Confirmed && r.status.is_member())
            .count();
        group.member_count = members as u32;
        txn.put_group(&group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MessageCache;
    use crate::types::{CustomJson, Transfer};

    fn control_op(tx_id: &str, from: &str, control: &GroupControl, ts: i64) -> Operation {
        Operation {
            op_index: 0,
            block_num: 0,
            tx_id: tx_id.into(),
            timestamp: ts,
            from: from.into(),
            to: None,
            payload: OperationPayload::CustomJson(CustomJson {
                id: GROUP_CONTROL_ID.into(),
                json: control.to_json(),
            }),
        }
    }

    fn payment_op(tx_id: &str, from: &str, to: &str, amount: Amount, group_id: &str, ts: i64) -> Operation {
        Operation {
            op_index: 0,
            block_num: 0,
            tx_id: tx_id.into(),
            timestamp: ts,
            from: from.into(),
            to: Some(to.into()),
            payload: OperationPayload::Transfer(Transfer {
                amount,
                memo: payment_memo(group_id),
            }),
        }
    }

    fn create(auto_approve: bool, payment: Option<GroupPayment>) -> GroupControl {
        GroupControl::Create {
            group_id: "g1".into(),
            name: "Rustaceans".into(),
            auto_approve,
            payment,
        }
    }

    #[test]
    fn test_control_json_roundtrip() {
        let control = create(
            true,
            Some(GroupPayment {
                amount: Amount::hbd_milli(1000),
                recurring_days: Some(30),
            }),
        );
        let json = control.to_json();
        assert_eq!(json["action"], "create");
        assert_eq!(json["payment"]["amount"], "1.000 HBD");
        assert_eq!(GroupControl::parse(&json).unwrap(), control);

        let bad = serde_json::json!({"action": "approve", "group_id": "g1"});
        assert!(GroupControl::parse(&bad).is_err());
    }

    #[test]
    fn test_creator_decisions_and_non_creator_ignored() {
        let cache = MessageCache::in_memory();
        let directory = GroupDirectory::new("carol");
        let mut txn = cache.begin();

        directory
            .apply(&mut txn, &control_op("t1", "dave", &create(false, None), 1), 1)
            .unwrap();
        directory
            .apply(&mut txn, &control_op("t2", "carol", &GroupControl::Join { group_id: "g1".into() }, 2), 2)
            .unwrap();

        let approve = GroupControl::Approve {
            group_id: "g1".into(),
            username: "carol".into(),
        };
        let outcome = directory
            .apply(&mut txn, &control_op("t3", "mallory", &approve, 3), 3)
            .unwrap();
        assert!(matches!(outcome, ControlOutcome::Ignored(_)));
        assert_eq!(txn.join_request("g1", "carol").unwrap().unwrap().status, JoinStatus::Pending);

        let outcome = directory
            .apply(&mut txn, &control_op("t4", "dave", &approve, 4), 4)
            .unwrap();
        assert_eq!(outcome, ControlOutcome::Decided { status: JoinStatus::Approved });
        let request = txn.join_request("g1", "carol").unwrap().unwrap();
        assert_eq!(request.origin, RequestOrigin::Confirmed);
        assert_eq!(txn.group("g1").unwrap().unwrap().member_count, 1);
    }

    #[test]
    fn test_auto_approve_waits_for_payment() {
        let cache = MessageCache::in_memory();
        let directory = GroupDirectory::new("carol");
        let terms = GroupPayment {
            amount: Amount::hbd_milli(1000),
            recurring_days: None,
        };
        let mut txn = cache.begin();
        directory
            .apply(&mut txn, &control_op("t1", "dave", &create(true, Some(terms)), 1), 1)
            .unwrap();

        let request = directory.request_join(&mut txn, "g1", 2).unwrap();
        assert_eq!(request.status, JoinStatus::Pending);
        assert_eq!(request.origin, RequestOrigin::Optimistic);

        let outcome = directory
            .apply(&mut txn, &payment_op("t2", "carol", "dave", Amount::hbd_milli(1000), "g1", 3), 3)
            .unwrap();
        assert_eq!(outcome, ControlOutcome::PaymentRecorded { auto_approved: true });
        let request = txn.join_request("g1", "carol").unwrap().unwrap();
        assert_eq!(request.status, JoinStatus::AutoApproved);
        assert_eq!(request.payment_tx_id.as_deref(), Some("t2"));
    }

    #[test]
    fn test_creator_rejection_overrides_optimistic_approval() {
        let cache = MessageCache::in_memory();
        let directory = GroupDirectory::new("carol");
        let mut txn = cache.begin();
        directory
            .apply(&mut txn, &control_op("t1", "dave", &create(true, None), 1), 1)
            .unwrap();
        let request = directory.request_join(&mut txn, "g1", 2).unwrap();
        assert_eq!(request.status, JoinStatus::AutoApproved);

        let reject = GroupControl::Reject {
            group_id: "g1".into(),
            username: "carol".into(),
        };
        let outcome = directory
            .apply(&mut txn, &control_op("t3", "dave", &reject, 3), 3)
            .unwrap();
        let ControlOutcome::Conflict(conflict) = outcome else {
            panic!("expected conflict");
        };
        assert_eq!(conflict.local_status, JoinStatus::AutoApproved);
        assert_eq!(conflict.confirmed_status, JoinStatus::Rejected);

        let request = txn.join_request("g1", "carol").unwrap().unwrap();
        assert_eq!(request.status, JoinStatus::Rejected);
        assert_eq!(request.origin, RequestOrigin::Confirmed);
    }

    #[test]
    fn test_creator_approval_agrees_with_optimistic_approval() {
        let cache = MessageCache::in_memory();
        let directory = GroupDirectory::new("carol");
        let mut txn = cache.begin();
        directory
            .apply(&mut txn, &control_op("t1", "dave", &create(true, None), 1), 1)
            .unwrap();
        let request = directory.request_join(&mut txn, "g1", 2).unwrap();
        assert_eq!(request.status, JoinStatus::AutoApproved);

        let approve = GroupControl::Approve {
            group_id: "g1".into(),
            username: "carol".into(),
        };
        let outcome = directory
            .apply(&mut txn, &control_op("t3", "dave", &approve, 3), 3)
            .unwrap();
        assert_eq!(outcome, ControlOutcome::Decided { status: JoinStatus::Approved });

        let request = txn.join_request("g1", "carol").unwrap().unwrap();
        assert_eq!(request.status, JoinStatus::Approved);
        assert_eq!(request.origin, RequestOrigin::Confirmed);
    }

    #[test]
    fn test_payment_before_announcement_gets_terms() {
        let cache = MessageCache::in_memory();
        let directory = GroupDirectory::new("carol");
        let day = 24 * 3_600_000;
        let terms = GroupPayment {
            amount: Amount::hbd_milli(1000),
            recurring_days: Some(30),
        };
        let mut txn = cache.begin();

        directory
            .apply(&mut txn, &payment_op("t1", "carol", "dave", Amount::hbd_milli(1000), "g1", 10), 10)
            .unwrap();
        directory
            .apply(&mut txn, &payment_op("t2", "erin", "mallory", Amount::hbd_milli(1000), "g1", 10), 10)
            .unwrap();
        assert_eq!(txn.payments("g1", "carol").unwrap()[0].expires_at, None);

        directory
            .apply(&mut txn, &control_op("t3", "dave", &create(true, Some(terms)), 20), 20)
            .unwrap();

        let payments = txn.payments("g1", "carol").unwrap();
        assert_eq!(payments[0].expires_at, Some(10 + 30 * day));
        assert!(txn.payments("g1", "erin").unwrap().is_empty());

        let group = txn.group("g1").unwrap().unwrap();
        assert!(directory.payment_satisfied(&txn, &group, "carol", 20 + day).unwrap());
        assert!(!directory.payment_satisfied(&txn, &group, "carol", 10 + 30 * day).unwrap());
    }

    #[test]
    fn test_own_payment_matches_viewer_case_insensitively() {
        let cache = MessageCache::in_memory();
        let directory = GroupDirectory::new("carol");
        let terms = GroupPayment {
            amount: Amount::hbd_milli(1000),
            recurring_days: None,
        };
        let mut txn = cache.begin();
        directory
            .apply(&mut txn, &control_op("t1", "dave", &create(true, Some(terms)), 1), 1)
            .unwrap();
        directory.request_join(&mut txn, "g1", 2).unwrap();

        let outcome = directory
            .apply(&mut txn, &payment_op("t2", "Carol", "dave", Amount::hbd_milli(1000), "g1", 3), 3)
            .unwrap();
        assert_eq!(outcome, ControlOutcome::PaymentRecorded { auto_approved: true });
    }

    #[test]
    fn test_request_join_unknown_group() {
        let cache = MessageCache::in_memory();
        let directory = GroupDirectory::new("carol");
        let mut txn = cache.begin();
        assert!(matches!(
            directory.request_join(&mut txn, "nope", 0),
            Err(SyncError::GroupNotFound(_))
        ));
    }

    fn announcement(tx_id: &str, created_at: i64, joins: &[i64]) -> GroupAnnouncement {
        let mut ann = GroupAnnouncement {
            group_id: format!("g-{}", tx_id),
            tx_id: tx_id.into(),
            creator: "dave".into(),
            name: tx_id.into(),
            created_at,
            auto_approve: false,
            payment: None,
            member_count: 0,
            join_times: Vec::new(),
        };
        for t in joins {
            ann.record_join(*t);
        }
        ann
    }

    #[test]
    fn test_rank_newest_and_ties() {
        let anns = vec![
            announcement("b", 100, &[]),
            announcement("a", 100, &[]),
            announcement("c", 200, &[]),
        ];
        let ranked: Vec<_> = rank_groups(&anns, RankMode::Newest, 1_000, 100)
            .into_iter()
            .map(|a| a.tx_id)
            .collect();
        assert_eq!(ranked, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_rank_trending_counts_window_only() {
        let anns = vec![
            announcement("old-busy", 0, &[10, 20, 30, 40]),
            announcement("fresh", 0, &[950, 960]),
            announcement("quiet", 0, &[]),
        ];
        let ranked: Vec<_> = rank_groups(&anns, RankMode::Trending, 1_000, 100)
            .into_iter()
            .map(|a| a.tx_id)
            .collect();
        assert_eq!(ranked, vec!["fresh", "old-busy", "quiet"]);
    }

    #[test]
    fn test_rank_hot_prefers_young_active_groups() {
        let hour = 3_600_000;
        let now = 100 * hour;
        let anns = vec![
            announcement("ancient", 0, &[now - 10]),
            announcement("young", now - hour, &[now - 10]),
        ];
        let ranked = rank_groups(&anns, RankMode::Hot, now, 24 * hour);
        assert_eq!(ranked[0].tx_id, "young");
        assert_eq!("hot".parse::<RankMode>().unwrap(), RankMode::Hot);
    }
}
