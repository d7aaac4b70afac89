//! Postgres-backed [`Store`].
//!
//! Conditional inserts are `INSERT .. ON CONFLICT DO NOTHING` followed by a re-read of the
//! winning row; conditional updates carry their guard in the `WHERE` clause and report success
//! through `rows_affected`. Every call is bounded by the configured store timeout.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::OnceCell;
use tracing::instrument;
use uuid::Uuid;

use crate::clock::DayId;
use crate::db::bounded;
use crate::db::prelude::*;
use crate::util::env;

const SCHEMA: &str = include_str!("../../migrations/0001_daily_cycle.sql");

static DB_POOL: LazyLock<OnceCell<PgPool>> = LazyLock::new(OnceCell::new);
pub async fn db_pool() -> StoreResult<&'static PgPool> {
    DB_POOL
        .get_or_try_init(|| async {
            let url = env::env()
                .await?
                .database_url
                .clone()
                .ok_or_else(|| StoreError::Unavailable(String::from("DATABASE_URL is not set")))?;

            tracing::debug!("connecting to postgres");
            Ok::<_, StoreError>(PgPool::connect(&url).await?)
        })
        .await
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: &'static PgPool,
    timeout: Duration,
}

impl PgStore {
    pub fn new(pool: &'static PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    /// Applies the embedded schema; every statement is idempotent
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA).execute(self.pool).await?;
        tracing::info!("schema up to date");
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct ActivityRow {
    user_id: UserId,
    day_id: DayId,
    earned: i64,
    raw_points: i64,
    converted: i64,
    tickets_granted: i64,
    event_counts: Json<BTreeMap<ActivityKind, i64>>,
    first_earned_at: Option<DateTime<Utc>>,
    version: i64,
}

impl From<ActivityRow> for DayActivity {
    fn from(row: ActivityRow) -> Self {
        Self {
            user_id: row.user_id,
            day_id: row.day_id,
            earned: row.earned,
            raw_points: row.raw_points,
            converted: row.converted,
            tickets_granted: row.tickets_granted,
            event_counts: row.event_counts.0,
            first_earned_at: row.first_earned_at,
            version: row.version,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DrawRow {
    day_id: DayId,
    draw_id: Uuid,
    status: String,
    prize_pool: Json<Vec<Prize>>,
    winners: Json<Vec<Winner>>,
    seed_digest: Option<String>,
    created_at: DateTime<Utc>,
    executed_at: Option<DateTime<Utc>>,
}

impl TryFrom<DrawRow> for Draw {
    type Error = StoreError;

    fn try_from(row: DrawRow) -> Result<Self, Self::Error> {
        Ok(Self {
            day_id: row.day_id,
            draw_id: row.draw_id,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            prize_pool: row.prize_pool.0,
            winners: row.winners.0,
            seed_digest: row.seed_digest,
            created_at: row.created_at,
            executed_at: row.executed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    day_id: DayId,
    entries: Json<Vec<LeaderboardEntry>>,
    captured_at: DateTime<Utc>,
}

impl From<SnapshotRow> for LeaderboardSnapshot {
    fn from(row: SnapshotRow) -> Self {
        Self {
            day_id: row.day_id,
            entries: row.entries.0,
            captured_at: row.captured_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct LedgerEventRow {
    id: Uuid,
    user_id: UserId,
    day_id: Option<DayId>,
    entry: Json<LedgerEntry>,
    created_at: DateTime<Utc>,
}

impl From<LedgerEventRow> for LedgerEvent {
    fn from(row: LedgerEventRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            day_id: row.day_id,
            entry: row.entry.0,
            created_at: row.created_at,
        }
    }
}

fn lost_winner(what: &str) -> StoreError {
    StoreError::Corrupt(format!("{what} conflicted on insert but could not be re-read"))
}

#[async_trait]
impl Store for PgStore {
    #[instrument(skip(self))]
    async fn get_day(&self, day: DayId) -> StoreResult<Option<DayRecord>> {
        bounded(self.timeout, async {
            Ok::<_, StoreError>(sqlx::query_as::<_, DayRecord>(
                "SELECT day_id, headline_id, draw_id, opened_at FROM day_record WHERE day_id = $1",
            )
            .bind(day)
            .fetch_optional(self.pool)
            .await?)
        })
        .await
    }

    #[instrument(skip(self, record), fields(day = %record.day_id))]
    async fn insert_day(&self, record: &DayRecord) -> StoreResult<Inserted<DayRecord>> {
        let created = bounded(self.timeout, async {
            Ok::<_, StoreError>(sqlx::query_as::<_, DayRecord>(
                r#"
                INSERT INTO day_record (day_id, headline_id, draw_id, opened_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (day_id) DO NOTHING
                RETURNING day_id, headline_id, draw_id, opened_at
                "#,
            )
            .bind(record.day_id)
            .bind(&record.headline_id)
            .bind(record.draw_id)
            .bind(record.opened_at)
            .fetch_optional(self.pool)
            .await?)
        })
        .await?;

        match created {
            Some(rec) => Ok(Inserted::Created(rec)),
            None => self
                .get_day(record.day_id)
                .await?
                .map(Inserted::Existing)
                .ok_or_else(|| lost_winner("day_record")),
        }
    }

    #[instrument(skip(self))]
    async fn get_daily_state(&self, user: &UserId, day: DayId) -> StoreResult<Option<DailyState>> {
        bounded(self.timeout, async {
            Ok::<_, StoreError>(sqlx::query_as::<_, DailyState>(
                r#"
                SELECT user_id, day_id, headline_id, draw_id, engaged, created_at
                FROM daily_state
                WHERE user_id = $1 AND day_id = $2
                "#,
            )
            .bind(user)
            .bind(day)
            .fetch_optional(self.pool)
            .await?)
        })
        .await
    }

    #[instrument(skip(self, state), fields(user = %state.user_id, day = %state.day_id))]
    async fn insert_daily_state(&self, state: &DailyState) -> StoreResult<Inserted<DailyState>> {
        let created = bounded(self.timeout, async {
            Ok::<_, StoreError>(sqlx::query_as::<_, DailyState>(
                r#"
                INSERT INTO daily_state (user_id, day_id, headline_id, draw_id, engaged, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (user_id, day_id) DO NOTHING
                RETURNING user_id, day_id, headline_id, draw_id, engaged, created_at
                "#,
            )
            .bind(&state.user_id)
            .bind(state.day_id)
            .bind(&state.headline_id)
            .bind(state.draw_id)
            .bind(state.engaged)
            .bind(state.created_at)
            .fetch_optional(self.pool)
            .await?)
        })
        .await?;

        match created {
            Some(s) => Ok(Inserted::Created(s)),
            None => self
                .get_daily_state(&state.user_id, state.day_id)
                .await?
                .map(Inserted::Existing)
                .ok_or_else(|| lost_winner("daily_state")),
        }
    }

    #[instrument(skip(self))]
    async fn mark_engaged(&self, user: &UserId, day: DayId) -> StoreResult<bool> {
        bounded(self.timeout, async {
            let res = sqlx::query(
                r#"
                UPDATE daily_state SET engaged = TRUE
                WHERE user_id = $1 AND day_id = $2 AND engaged = FALSE
                "#,
            )
            .bind(user)
            .bind(day)
            .execute(self.pool)
            .await?;

            Ok::<_, StoreError>(res.rows_affected() == 1)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn get_account(&self, user: &UserId) -> StoreResult<Option<PointsAccount>> {
        bounded(self.timeout, async {
            Ok::<_, StoreError>(sqlx::query_as::<_, PointsAccount>(
                r#"
                SELECT user_id, static_points, dynamic_points, lifetime_dynamic_converted,
                       keys_balance, version, updated_at
                FROM points_account
                WHERE user_id = $1
                "#,
            )
            .bind(user)
            .fetch_optional(self.pool)
            .await?)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn get_activity(&self, user: &UserId, day: DayId) -> StoreResult<Option<DayActivity>> {
        bounded(self.timeout, async {
            let row = sqlx::query_as::<_, ActivityRow>(
                r#"
                SELECT user_id, day_id, earned, raw_points, converted, tickets_granted,
                       event_counts, first_earned_at, version
                FROM day_activity
                WHERE user_id = $1 AND day_id = $2
                "#,
            )
            .bind(user)
            .bind(day)
            .fetch_optional(self.pool)
            .await?;

            Ok::<_, StoreError>(row.map(DayActivity::from))
        })
        .await
    }

    #[instrument(skip(self))]
    async fn list_activity(&self, day: DayId) -> StoreResult<Vec<DayActivity>> {
        bounded(self.timeout, async {
            let rows = sqlx::query_as::<_, ActivityRow>(
                r#"
                SELECT user_id, day_id, earned, raw_points, converted, tickets_granted,
                       event_counts, first_earned_at, version
                FROM day_activity
                WHERE day_id = $1
                "#,
            )
            .bind(day)
            .fetch_all(self.pool)
            .await?;

            Ok::<_, StoreError>(rows.into_iter().map(DayActivity::from).collect())
        })
        .await
    }

    #[instrument(skip(self, update), fields(user = %update.account.user_id))]
    async fn commit_ledger(&self, update: &LedgerUpdate) -> StoreResult<bool> {
        bounded(self.timeout, async {
            let mut tx = self.pool.begin().await?;

            if !write_account(&mut tx, &update.account).await? {
                tx.rollback().await?;
                return Ok(false);
            }

            if let Some(activity) = &update.activity {
                if !write_activity(&mut tx, activity).await? {
                    tx.rollback().await?;
                    return Ok(false);
                }
            }

            for event in &update.events {
                sqlx::query(
                    r#"
                    INSERT INTO ledger_event (id, user_id, day_id, kind, entry, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(event.id)
                .bind(&event.user_id)
                .bind(event.day_id)
                .bind(event.entry.kind())
                .bind(Json(&event.entry))
                .bind(event.created_at)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            Ok::<_, StoreError>(true)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn list_ledger_events(&self, user: &UserId) -> StoreResult<Vec<LedgerEvent>> {
        bounded(self.timeout, async {
            let rows = sqlx::query_as::<_, LedgerEventRow>(
                r#"
                SELECT id, user_id, day_id, entry, created_at
                FROM ledger_event
                WHERE user_id = $1
                ORDER BY created_at ASC
                "#,
            )
            .bind(user)
            .fetch_all(self.pool)
            .await?;

            Ok::<_, StoreError>(rows.into_iter().map(LedgerEvent::from).collect())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn add_tickets(&self, user: &UserId, day: DayId, count: i64) -> StoreResult<i64> {
        bounded(self.timeout, async {
            Ok::<_, StoreError>(sqlx::query_scalar::<_, i64>(
                r#"
                INSERT INTO ticket (user_id, day_id, count)
                VALUES ($1, $2, $3)
                ON CONFLICT (user_id, day_id)
                DO UPDATE SET count = ticket.count + $3
                RETURNING count
                "#,
            )
            .bind(user)
            .bind(day)
            .bind(count)
            .fetch_one(self.pool)
            .await?)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn get_tickets(&self, user: &UserId, day: DayId) -> StoreResult<i64> {
        bounded(self.timeout, async {
            let count = sqlx::query_scalar::<_, i64>(
                "SELECT count FROM ticket WHERE user_id = $1 AND day_id = $2",
            )
            .bind(user)
            .bind(day)
            .fetch_optional(self.pool)
            .await?;

            Ok::<_, StoreError>(count.unwrap_or(0))
        })
        .await
    }

    #[instrument(skip(self))]
    async fn list_tickets(&self, day: DayId) -> StoreResult<Vec<TicketEntry>> {
        bounded(self.timeout, async {
            Ok::<_, StoreError>(sqlx::query_as::<_, TicketEntry>(
                "SELECT user_id, day_id, count FROM ticket WHERE day_id = $1 AND count > 0",
            )
            .bind(day)
            .fetch_all(self.pool)
            .await?)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn get_draw(&self, day: DayId) -> StoreResult<Option<Draw>> {
        bounded(self.timeout, async {
            let row = sqlx::query_as::<_, DrawRow>(
                r#"
                SELECT day_id, draw_id, status, prize_pool, winners, seed_digest,
                       created_at, executed_at
                FROM draw
                WHERE day_id = $1
                "#,
            )
            .bind(day)
            .fetch_optional(self.pool)
            .await?;

            row.map(Draw::try_from).transpose()
        })
        .await
    }

    #[instrument(skip(self, draw), fields(day = %draw.day_id))]
    async fn insert_draw(&self, draw: &Draw) -> StoreResult<Inserted<Draw>> {
        let created = bounded(self.timeout, async {
            let res = sqlx::query(
                r#"
                INSERT INTO draw (day_id, draw_id, status, prize_pool, winners, seed_digest,
                                  created_at, executed_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (day_id) DO NOTHING
                "#,
            )
            .bind(draw.day_id)
            .bind(draw.draw_id)
            .bind(draw.status.as_str())
            .bind(Json(&draw.prize_pool))
            .bind(Json(&draw.winners))
            .bind(&draw.seed_digest)
            .bind(draw.created_at)
            .bind(draw.executed_at)
            .execute(self.pool)
            .await?;

            Ok::<_, StoreError>(res.rows_affected() == 1)
        })
        .await?;

        if created {
            return Ok(Inserted::Created(draw.clone()));
        }

        self.get_draw(draw.day_id)
            .await?
            .map(Inserted::Existing)
            .ok_or_else(|| lost_winner("draw"))
    }

    #[instrument(skip(self, next), fields(day = %next.day_id, to = %next.status))]
    async fn cas_draw(&self, expected: DrawStatus, next: &Draw) -> StoreResult<bool> {
        bounded(self.timeout, async {
            let res = sqlx::query(
                r#"
                UPDATE draw
                SET status = $2, winners = $3, seed_digest = $4, executed_at = $5
                WHERE day_id = $1 AND status = $6
                "#,
            )
            .bind(next.day_id)
            .bind(next.status.as_str())
            .bind(Json(&next.winners))
            .bind(&next.seed_digest)
            .bind(next.executed_at)
            .bind(expected.as_str())
            .execute(self.pool)
            .await?;

            Ok::<_, StoreError>(res.rows_affected() == 1)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn get_snapshot(&self, day: DayId) -> StoreResult<Option<LeaderboardSnapshot>> {
        bounded(self.timeout, async {
            let row = sqlx::query_as::<_, SnapshotRow>(
                "SELECT day_id, entries, captured_at FROM leaderboard_snapshot WHERE day_id = $1",
            )
            .bind(day)
            .fetch_optional(self.pool)
            .await?;

            Ok::<_, StoreError>(row.map(LeaderboardSnapshot::from))
        })
        .await
    }

    #[instrument(skip(self, snapshot), fields(day = %snapshot.day_id))]
    async fn insert_snapshot(
        &self,
        snapshot: &LeaderboardSnapshot,
    ) -> StoreResult<Inserted<LeaderboardSnapshot>> {
        let created = bounded(self.timeout, async {
            let res = sqlx::query(
                r#"
                INSERT INTO leaderboard_snapshot (day_id, entries, captured_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (day_id) DO NOTHING
                "#,
            )
            .bind(snapshot.day_id)
            .bind(Json(&snapshot.entries))
            .bind(snapshot.captured_at)
            .execute(self.pool)
            .await?;

            Ok::<_, StoreError>(res.rows_affected() == 1)
        })
        .await?;

        if created {
            return Ok(Inserted::Created(snapshot.clone()));
        }

        self.get_snapshot(snapshot.day_id)
            .await?
            .map(Inserted::Existing)
            .ok_or_else(|| lost_winner("leaderboard_snapshot"))
    }

    #[instrument(skip(self))]
    async fn get_rollover(&self, day: DayId) -> StoreResult<Option<RolloverJob>> {
        bounded(self.timeout, async {
            Ok::<_, StoreError>(sqlx::query_as::<_, RolloverJob>(
                "SELECT day_id, opened_at, closed_at FROM rollover_job WHERE day_id = $1",
            )
            .bind(day)
            .fetch_optional(self.pool)
            .await?)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn mark_opened(&self, day: DayId, at: DateTime<Utc>) -> StoreResult<bool> {
        bounded(self.timeout, async {
            let res = sqlx::query(
                r#"
                INSERT INTO rollover_job (day_id, opened_at)
                VALUES ($1, $2)
                ON CONFLICT (day_id)
                DO UPDATE SET opened_at = $2
                WHERE rollover_job.opened_at IS NULL
                "#,
            )
            .bind(day)
            .bind(at)
            .execute(self.pool)
            .await?;

            Ok::<_, StoreError>(res.rows_affected() == 1)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn mark_closed(&self, day: DayId, at: DateTime<Utc>) -> StoreResult<bool> {
        bounded(self.timeout, async {
            let res = sqlx::query(
                r#"
                INSERT INTO rollover_job (day_id, closed_at)
                VALUES ($1, $2)
                ON CONFLICT (day_id)
                DO UPDATE SET closed_at = $2
                WHERE rollover_job.closed_at IS NULL
                "#,
            )
            .bind(day)
            .bind(at)
            .execute(self.pool)
            .await?;

            Ok::<_, StoreError>(res.rows_affected() == 1)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn latest_closed_day(&self) -> StoreResult<Option<DayId>> {
        bounded(self.timeout, async {
            Ok::<_, StoreError>(sqlx::query_scalar::<_, DayId>(
                r#"
                SELECT day_id FROM rollover_job
                WHERE closed_at IS NOT NULL
                ORDER BY day_id DESC
                LIMIT 1
                "#,
            )
            .fetch_optional(self.pool)
            .await?)
        })
        .await
    }
}

/// Inserts (version 1) or version-guards the account row; `false` when another writer won
async fn write_account(
    tx: &mut Transaction<'_, Postgres>,
    account: &PointsAccount,
) -> StoreResult<bool> {
    let res = if account.version == 1 {
        sqlx::query(
            r#"
            INSERT INTO points_account (user_id, static_points, dynamic_points,
                lifetime_dynamic_converted, keys_balance, version, updated_at)
            VALUES ($1, $2, $3, $4, $5, 1, $6)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(&account.user_id)
        .bind(account.static_points)
        .bind(account.dynamic_points)
        .bind(account.lifetime_dynamic_converted)
        .bind(account.keys_balance)
        .bind(account.updated_at)
        .execute(&mut **tx)
        .await?
    } else {
        sqlx::query(
            r#"
            UPDATE points_account
            SET static_points = $2,
                dynamic_points = $3,
                lifetime_dynamic_converted = $4,
                keys_balance = $5,
                version = $6,
                updated_at = $7
            WHERE user_id = $1 AND version = $6 - 1
            "#,
        )
        .bind(&account.user_id)
        .bind(account.static_points)
        .bind(account.dynamic_points)
        .bind(account.lifetime_dynamic_converted)
        .bind(account.keys_balance)
        .bind(account.version)
        .bind(account.updated_at)
        .execute(&mut **tx)
        .await?
    };

    Ok(res.rows_affected() == 1)
}

async fn write_activity(
    tx: &mut Transaction<'_, Postgres>,
    activity: &DayActivity,
) -> StoreResult<bool> {
    let res = if activity.version == 1 {
        sqlx::query(
            r#"
            INSERT INTO day_activity (user_id, day_id, earned, raw_points, converted,
                tickets_granted, event_counts, first_earned_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 1)
            ON CONFLICT (user_id, day_id) DO NOTHING
            "#,
        )
        .bind(&activity.user_id)
        .bind(activity.day_id)
        .bind(activity.earned)
        .bind(activity.raw_points)
        .bind(activity.converted)
        .bind(activity.tickets_granted)
        .bind(Json(&activity.event_counts))
        .bind(activity.first_earned_at)
        .execute(&mut **tx)
        .await?
    } else {
        sqlx::query(
            r#"
            UPDATE day_activity
            SET earned = $3,
                raw_points = $4,
                converted = $5,
                tickets_granted = $6,
                event_counts = $7,
                first_earned_at = $8,
                version = $9
            WHERE user_id = $1 AND day_id = $2 AND version = $9 - 1
            "#,
        )
        .bind(&activity.user_id)
        .bind(activity.day_id)
        .bind(activity.earned)
        .bind(activity.raw_points)
        .bind(activity.converted)
        .bind(activity.tickets_granted)
        .bind(Json(&activity.event_counts))
        .bind(activity.first_earned_at)
        .bind(activity.version)
        .execute(&mut **tx)
        .await?
    };

    Ok(res.rows_affected() == 1)
}
