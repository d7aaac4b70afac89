use core::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::clock::DayId;

pub mod memory;
pub mod models;
pub mod pg;
pub mod redis;

pub mod prelude {
    pub use crate::db::models::UserId;
    pub use crate::db::models::day::{DailyState, DayRecord};
    pub use crate::db::models::draw::{Draw, DrawStatus, Prize, TicketEntry, Winner};
    pub use crate::db::models::leaderboard::{LeaderboardEntry, LeaderboardSnapshot};
    pub use crate::db::models::points::{
        ActivityKind, DayActivity, LedgerEntry, LedgerEvent, LedgerUpdate, PointsAccount,
        StaticSource,
    };
    pub use crate::db::models::rollover::RolloverJob;

    pub use crate::db::{Inserted, Store, StoreError, StoreResult};
}

use prelude::*;

/// Outcome of a conditional insert. `Existing` carries the record that won the uniqueness race,
/// the caller's own write having been discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inserted<T> {
    Created(T),
    Existing(T),
}

impl<T> Inserted<T> {
    pub fn into_inner(self) -> T {
        match self {
            Inserted::Created(v) | Inserted::Existing(v) => v,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Inserted::Created(_))
    }
}

/// Transactional record store.
///
/// Everything the engine persists goes through these primitives: point reads, conditional
/// inserts keyed on the record's natural identity, and conditional updates guarded by a status,
/// flag or version. Implementations must make every call atomic on its own.
#[async_trait]
pub trait Store: Send + Sync + fmt::Debug {
    async fn get_day(&self, day: DayId) -> StoreResult<Option<DayRecord>>;
    async fn insert_day(&self, record: &DayRecord) -> StoreResult<Inserted<DayRecord>>;

    async fn get_daily_state(&self, user: &UserId, day: DayId) -> StoreResult<Option<DailyState>>;
    async fn insert_daily_state(&self, state: &DailyState) -> StoreResult<Inserted<DailyState>>;
    /// Flips `engaged` on if it is currently off, returning whether this call flipped it.
    async fn mark_engaged(&self, user: &UserId, day: DayId) -> StoreResult<bool>;

    async fn get_account(&self, user: &UserId) -> StoreResult<Option<PointsAccount>>;
    async fn get_activity(&self, user: &UserId, day: DayId) -> StoreResult<Option<DayActivity>>;
    async fn list_activity(&self, day: DayId) -> StoreResult<Vec<DayActivity>>;
    /// Applies the update in a single transaction if every record's stored version is still one
    /// below the update's. Returns `false`, with nothing written, when a version moved.
    async fn commit_ledger(&self, update: &LedgerUpdate) -> StoreResult<bool>;
    async fn list_ledger_events(&self, user: &UserId) -> StoreResult<Vec<LedgerEvent>>;

    /// Atomically adds `count` tickets, returning the new total for (user, day).
    async fn add_tickets(&self, user: &UserId, day: DayId, count: i64) -> StoreResult<i64>;
    async fn get_tickets(&self, user: &UserId, day: DayId) -> StoreResult<i64>;
    async fn list_tickets(&self, day: DayId) -> StoreResult<Vec<TicketEntry>>;

    async fn get_draw(&self, day: DayId) -> StoreResult<Option<Draw>>;
    async fn insert_draw(&self, draw: &Draw) -> StoreResult<Inserted<Draw>>;
    /// Replaces the stored draw with `next` only while its status still equals `expected`.
    async fn cas_draw(&self, expected: DrawStatus, next: &Draw) -> StoreResult<bool>;

    async fn get_snapshot(&self, day: DayId) -> StoreResult<Option<LeaderboardSnapshot>>;
    async fn insert_snapshot(
        &self,
        snapshot: &LeaderboardSnapshot,
    ) -> StoreResult<Inserted<LeaderboardSnapshot>>;

    async fn get_rollover(&self, day: DayId) -> StoreResult<Option<RolloverJob>>;
    /// Records the day as opened unless it already was; returns whether this call recorded it.
    async fn mark_opened(&self, day: DayId, at: DateTime<Utc>) -> StoreResult<bool>;
    /// Records the day as closed unless it already was; returns whether this call recorded it.
    async fn mark_closed(&self, day: DayId, at: DateTime<Utc>) -> StoreResult<bool>;
    async fn latest_closed_day(&self) -> StoreResult<Option<DayId>>;
}

/// Runs a storage future under a deadline, mapping expiry onto [`StoreError::Timeout`]
pub async fn bounded<T, F>(timeout: Duration, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}

pub type StoreResult<T> = core::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call exceeded {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    SqlxError(#[from] sqlx::Error),

    #[error(transparent)]
    RedisError(#[from] ::redis::RedisError),

    #[error(transparent)]
    SerdeError(#[from] serde_json::Error),

    #[error(transparent)]
    EnvError(#[from] crate::util::env::EnvErr),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether retrying the same call later can succeed
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) | StoreError::Timeout(_) => true,
            StoreError::SqlxError(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Protocol(_)
            ),
            StoreError::RedisError(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            StoreError::SerdeError(_) | StoreError::EnvError(_) | StoreError::Corrupt(_) => false,
        }
    }
}
