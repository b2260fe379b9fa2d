//! Core types for hivechat

pub mod group;
pub mod message;
pub mod operation;

pub use group::{
    GroupAnnouncement, GroupPayment, JoinRequest, JoinStatus, PaymentRecord, PaymentStatus,
    RequestOrigin,
};
pub use message::{payload_hash, ConversationSummary, FilterReason, FilteredRecord, Message};
pub use operation::{CustomJson, Operation, OperationKind, OperationPayload, Transfer};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Prefix of conversation keys that belong to a group rather than a pair.
pub const GROUP_CONVERSATION_PREFIX: &str = "group:";

/// Asset a transfer is denominated in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Asset {
    /// Hive-backed dollars
    Hbd,
    /// The native token
    Hive,
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Asset::Hbd => write!(f, "HBD"),
            Asset::Hive => write!(f, "HIVE"),
        }
    }
}

/// Fixed-point ledger amount.
///
/// The ledger itself uses three decimals, but amounts are kept in millionths
/// so that sub-precision values (`"0.0005 HBD"`) still compare correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Amount {
    pub micro: u64,
    pub asset: Asset,
}

const MICRO_PER_UNIT: u64 = 1_000_000;
const MAX_DECIMALS: usize = 6;

impl Amount {
    pub const fn new(micro: u64, asset: Asset) -> Self {
        Self { micro, asset }
    }

    /// Amount in HBD thousandths (the ledger precision).
    pub const fn hbd_milli(milli: u64) -> Self {
        Self::new(milli * 1000, Asset::Hbd)
    }

    pub const fn zero() -> Self {
        Self::new(0, Asset::Hbd)
    }

    pub fn is_zero(&self) -> bool {
        self.micro == 0
    }

    /// Compare magnitudes only.
    ///
    /// Minimums are configured in HBD and there is no price feed, so HIVE
    /// transfers are compared one-to-one.
    pub fn meets(&self, minimum: &Amount) -> bool {
        self.micro >= minimum.micro
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.micro / MICRO_PER_UNIT;
        let frac = self.micro % MICRO_PER_UNIT;
        if frac % 1000 == 0 {
            write!(f, "{}.{:03} {}", whole, frac / 1000, self.asset)
        } else {
            let digits = format!("{:06}", frac);
            write!(f, "{}.{} {}", whole, digits.trim_end_matches('0'), self.asset)
        }
    }
}

impl FromStr for Amount {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SyncError::InvalidAmount(s.to_string());

        let mut parts = s.split_whitespace();
        let number = parts.next().ok_or_else(invalid)?;
        let asset = match parts.next().ok_or_else(invalid)? {
            "HBD" => Asset::Hbd,
            "HIVE" => Asset::Hive,
            _ => return Err(invalid()),
        };
        if parts.next().is_some() {
            return Err(invalid());
        }

        let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() || frac.len() > MAX_DECIMALS {
            return Err(invalid());
        }
        if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }
        let whole: u64 = whole.parse().map_err(|_| invalid())?;
        let frac_micro: u64 = if frac.is_empty() {
            0
        } else {
            format!("{:0<6}", frac).parse().map_err(|_| invalid())?
        };
        let micro = whole
            .checked_mul(MICRO_PER_UNIT)
            .and_then(|m| m.checked_add(frac_micro))
            .ok_or_else(invalid)?;

        Ok(Amount { micro, asset })
    }
}

/// Canonical, order-independent key for a two-party conversation.
///
/// Usernames are compared case-insensitively (ledger account names are
/// lowercase) and joined with `|`.
pub fn conversation_key(a: &str, b: &str) -> String {
    let a = a.to_ascii_lowercase();
    let b = b.to_ascii_lowercase();
    if a <= b {
        format!("{}|{}", a, b)
    } else {
        format!("{}|{}", b, a)
    }
}

/// Conversation key for messages posted to a group.
pub fn group_conversation_key(group_id: &str) -> String {
    format!("{}{}", GROUP_CONVERSATION_PREFIX, group_id)
}

/// Current time in Unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
