use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::UserId;
use crate::clock::DayId;

/// One-directional: pending -> closing -> executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrawStatus {
    Pending,
    Closing,
    Executed,
}

impl DrawStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DrawStatus::Pending => "pending",
            DrawStatus::Closing => "closing",
            DrawStatus::Executed => "executed",
        }
    }
}

impl fmt::Display for DrawStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DrawStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DrawStatus::Pending),
            "closing" => Ok(DrawStatus::Closing),
            "executed" => Ok(DrawStatus::Executed),
            other => Err(format!("unknown draw status '{other}'")),
        }
    }
}

/// Prize tiers. Raw currency is deliberately absent: a `Keys` prize is an entitlement fulfilled
/// outside the ledger, it never credits `keys_balance`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tier", rename_all = "snake_case")]
pub enum Prize {
    Keys { amount: i64 },
    Boost { multiplier_pct: i64, hours: i64 },
    Access { feature: String },
    Badge { badge: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Winner {
    /// Zero-based prize slot, in draw order
    pub slot: i64,
    pub user_id: UserId,
    pub tickets: i64,
    pub prize: Prize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draw {
    pub day_id: DayId,
    pub draw_id: Uuid,
    pub status: DrawStatus,
    pub prize_pool: Vec<Prize>,
    pub winners: Vec<Winner>,
    /// Hex digest the draw's rng seed was taken from, published once executed
    pub seed_digest: Option<String>,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl Draw {
    pub fn pending(day_id: DayId, prize_pool: Vec<Prize>, created_at: DateTime<Utc>) -> Self {
        Self {
            day_id,
            draw_id: Uuid::new_v4(),
            status: DrawStatus::Pending,
            prize_pool,
            winners: Vec::new(),
            seed_digest: None,
            created_at,
            executed_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TicketEntry {
    pub user_id: UserId,
    pub day_id: DayId,
    pub count: i64,
}

/// Default prize slots, in draw order
pub fn default_prize_pool() -> Vec<Prize> {
    vec![
        Prize::Keys { amount: 50 },
        Prize::Boost {
            multiplier_pct: 150,
            hours: 24,
        },
        Prize::Access {
            feature: String::from("early-headline"),
        },
        Prize::Badge {
            badge: String::from("daily-winner"),
        },
    ]
}
