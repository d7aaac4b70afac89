use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::DayId;

/// Persisted progress of the day's open/close job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RolloverJob {
    pub day_id: DayId,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}
