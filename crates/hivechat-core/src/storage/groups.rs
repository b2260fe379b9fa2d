//! Group announcements, join requests and payments

use super::{CacheTxn, MessageCache, Table};
use crate::error::SyncResult;
use crate::types::{GroupAnnouncement, JoinRequest, PaymentRecord};

fn join_key(group_id: &str, username: &str) -> String {
    format!("{}\0{}", group_id, username.to_ascii_lowercase())
}

fn payment_prefix(group_id: &str, username: &str) -> String {
    format!("{}\0{}\0", group_id, username.to_ascii_lowercase())
}

impl CacheTxn<'_> {
    pub fn group(&self, group_id: &str) -> SyncResult<Option<GroupAnnouncement>> {
        self.get_json(Table::Groups, group_id)
    }

    pub fn put_group(&mut self, group: &GroupAnnouncement) -> SyncResult<()> {
        self.put_json(Table::Groups, group.group_id.clone(), group)
    }

    pub fn groups(&self) -> SyncResult<Vec<GroupAnnouncement>> {
        Ok(self
            .scan_json::<GroupAnnouncement>(Table::Groups, "")?
            .into_iter()
            .map(|(_, g)| g)
            .collect())
    }

    pub fn join_request(&self, group_id: &str, username: &str) -> SyncResult<Option<JoinRequest>> {
        self.get_json(Table::JoinRequests, &join_key(group_id, username))
    }

    pub fn put_join_request(&mut self, request: &JoinRequest) -> SyncResult<()> {
        self.put_json(
            Table::JoinRequests,
            join_key(&request.group_id, &request.username),
            request,
        )
    }

    pub fn join_requests(&self, group_id: &str) -> SyncResult<Vec<JoinRequest>> {
        Ok(self
            .scan_json::<JoinRequest>(Table::JoinRequests, &format!("{}\0", group_id))?
            .into_iter()
            .map(|(_, r)| r)
            .collect())
    }

    pub fn put_payment(&mut self, payment: &PaymentRecord) -> SyncResult<()> {
        let key = format!(
            "{}{}",
            payment_prefix(&payment.group_id, &payment.username),
            payment.tx_id
        );
        self.put_json(Table::Payments, key, payment)
    }

    pub fn delete_payment(&mut self, payment: &PaymentRecord) {
        let key = format!(
            "{}{}",
            payment_prefix(&payment.group_id, &payment.username),
            payment.tx_id
        );
        self.delete_raw(Table::Payments, key);
    }

    /// Every payment recorded for `group_id`, by any account.
    pub fn group_payments(&self, group_id: &str) -> SyncResult<Vec<PaymentRecord>> {
        Ok(self
            .scan_json::<PaymentRecord>(Table::Payments, &format!("{}\0", group_id))?
            .into_iter()
            .map(|(_, p)| p)
            .collect())
    }

    /// Payments by `username` for `group_id`, oldest first.
    pub fn payments(&self, group_id: &str, username: &str) -> SyncResult<Vec<PaymentRecord>> {
        let mut payments: Vec<PaymentRecord> = self
            .scan_json::<PaymentRecord>(Table::Payments, &payment_prefix(group_id, username))?
            .into_iter()
            .map(|(_, p)| p)
            .collect();
        payments.sort_by_key(|p| p.paid_at);
        Ok(payments)
    }
}

impl MessageCache {
    pub fn group(&self, group_id: &str) -> SyncResult<Option<GroupAnnouncement>> {
        self.begin().group(group_id)
    }

    pub fn groups(&self) -> SyncResult<Vec<GroupAnnouncement>> {
        self.begin().groups()
    }

    pub fn join_request(&self, group_id: &str, username: &str) -> SyncResult<Option<JoinRequest>> {
        self.begin().join_request(group_id, username)
    }

    pub fn join_requests(&self, group_id: &str) -> SyncResult<Vec<JoinRequest>> {
        self.begin().join_requests(group_id)
    }

    pub fn payments(&self, group_id: &str, username: &str) -> SyncResult<Vec<PaymentRecord>> {
        self.begin().payments(group_id, username)
    }
}
