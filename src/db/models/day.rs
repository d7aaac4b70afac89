use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::UserId;
use crate::clock::DayId;

/// Shared resources for a single day: every user's state for that day points at these
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DayRecord {
    pub day_id: DayId,
    pub headline_id: String,
    pub draw_id: Uuid,
    pub opened_at: DateTime<Utc>,
}

/// Per-(user, day) materialized state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DailyState {
    pub user_id: UserId,
    pub day_id: DayId,
    pub headline_id: String,
    pub draw_id: Uuid,
    pub engaged: bool,
    pub created_at: DateTime<Utc>,
}

impl DailyState {
    pub fn for_day(user_id: UserId, day: &DayRecord, created_at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            day_id: day.day_id,
            headline_id: day.headline_id.clone(),
            draw_id: day.draw_id,
            engaged: false,
            created_at,
        }
    }
}
