use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::UserId;
use crate::clock::DayId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: i64,
    pub user_id: UserId,
    /// Dynamic points earned on the snapshotted day only
    pub dynamic_points: i64,
    /// Frozen ticket count; the draw weighs entrants by this
    pub tickets: i64,
    pub first_earned_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardSnapshot {
    pub day_id: DayId,
    pub entries: Vec<LeaderboardEntry>,
    pub captured_at: DateTime<Utc>,
}

impl LeaderboardSnapshot {
    pub fn tickets_of(&self, user_id: &UserId) -> i64 {
        self.entries
            .iter()
            .find(|e| &e.user_id == user_id)
            .map(|e| e.tickets)
            .unwrap_or(0)
    }
}
