use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::UserId;
use crate::clock::DayId;

/// Closed set of engagement events that earn dynamic points
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    CheckIn,
    HeadlineRead,
    Reaction,
    Comment,
    Share,
    Quiz,
    Referral,
}

/// Identity events that may credit static points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaticSource {
    SignupBonus,
    FollowerAttestation,
    ProfileVerification,
}

/// One per user. `version` increments on every committed change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PointsAccount {
    pub user_id: UserId,
    pub static_points: i64,
    pub dynamic_points: i64,
    pub lifetime_dynamic_converted: i64,
    pub keys_balance: i64,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl PointsAccount {
    /// An account that has never been persisted (version 0)
    pub fn empty(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            static_points: 0,
            dynamic_points: 0,
            lifetime_dynamic_converted: 0,
            keys_balance: 0,
            version: 0,
            updated_at: now,
        }
    }
}

/// Per-(user, day) accrual counters. Only these reset at the day boundary; the running
/// `PointsAccount::dynamic_points` balance carries over until converted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayActivity {
    pub user_id: UserId,
    pub day_id: DayId,
    /// Dynamic points credited this day, never above the daily cap
    pub earned: i64,
    /// Points awarded before the cap was applied
    pub raw_points: i64,
    pub converted: i64,
    pub tickets_granted: i64,
    pub event_counts: BTreeMap<ActivityKind, i64>,
    pub first_earned_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl DayActivity {
    pub fn empty(user_id: UserId, day_id: DayId) -> Self {
        Self {
            user_id,
            day_id,
            earned: 0,
            raw_points: 0,
            converted: 0,
            tickets_granted: 0,
            event_counts: BTreeMap::new(),
            first_earned_at: None,
            version: 0,
        }
    }

    pub fn count_of(&self, kind: ActivityKind) -> i64 {
        self.event_counts.get(&kind).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerEntry {
    Activity {
        activity: ActivityKind,
        awarded: i64,
        applied: i64,
        discarded: i64,
    },
    Conversion {
        points: i64,
        keys: i64,
    },
    StaticCredit {
        amount: i64,
        source: StaticSource,
    },
}

impl LedgerEntry {
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerEntry::Activity { .. } => "activity",
            LedgerEntry::Conversion { .. } => "conversion",
            LedgerEntry::StaticCredit { .. } => "static_credit",
        }
    }
}

/// Append-only audit record of a balance change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub id: Uuid,
    pub user_id: UserId,
    pub day_id: Option<DayId>,
    pub entry: LedgerEntry,
    pub created_at: DateTime<Utc>,
}

impl LedgerEvent {
    pub fn new(
        user_id: UserId,
        day_id: Option<DayId>,
        entry: LedgerEntry,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            day_id,
            entry,
            created_at,
        }
    }
}

/// The next committed state of a user's ledger. Each record's `version` must be exactly one
/// above the stored version (version 1 meaning "insert, nothing stored yet").
#[derive(Debug, Clone)]
pub struct LedgerUpdate {
    pub account: PointsAccount,
    pub activity: Option<DayActivity>,
    pub events: Vec<LedgerEvent>,
}
