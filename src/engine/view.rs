//! Composite read models served by the api

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::instrument;

use super::ledger::{ActivityOutcome, ConversionOutcome};
use super::{Engine, EngineResult};
use crate::clock::DayId;
use crate::db::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TodayView {
    pub day_id: DayId,
    pub headline_id: String,
    pub draw_status: DrawStatus,
    pub tickets: i64,
    pub dynamic_points_today: i64,
    pub static_points: i64,
    pub keys_balance: i64,
    pub engaged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngageView {
    #[serde(flatten)]
    pub today: TodayView,
    pub activity: ActivityOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PointsView {
    pub static_points: i64,
    pub dynamic_points_today: i64,
    pub dynamic_cap: i64,
    pub keys_balance: i64,
    pub conversion_cap_remaining: i64,
    pub dynamic_balance: i64,
}

/// Winners stay hidden until the draw has executed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrawView {
    pub day_id: DayId,
    pub status: DrawStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winners: Option<Vec<Winner>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed_digest: Option<String>,
}

impl From<Draw> for DrawView {
    fn from(draw: Draw) -> Self {
        let executed = draw.status == DrawStatus::Executed;
        Self {
            day_id: draw.day_id,
            status: draw.status,
            winners: executed.then_some(draw.winners),
            seed_digest: if executed { draw.seed_digest } else { None },
        }
    }
}

impl Engine {
    #[instrument(skip(self, now))]
    pub async fn today(&self, user: &UserId, now: DateTime<Utc>) -> EngineResult<TodayView> {
        let state = self.daily.get_or_create(user, now).await?;
        self.compose(state, now).await
    }

    async fn compose(&self, state: DailyState, now: DateTime<Utc>) -> EngineResult<TodayView> {
        let day = state.day_id;
        // opening the day created its draw
        let draw = self
            .draws
            .get(day)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("draw missing for opened day {day}")))?;
        let tickets = self.draws.tickets(&state.user_id, day).await?;
        let account = self.ledger.account(&state.user_id, now).await?;
        let activity = self.ledger.day_activity(&state.user_id, day).await?;

        Ok(TodayView {
            day_id: day,
            headline_id: state.headline_id,
            draw_status: draw.status,
            tickets,
            dynamic_points_today: activity.earned,
            static_points: account.static_points,
            keys_balance: account.keys_balance,
            engaged: state.engaged,
        })
    }

    /// Marks the user engaged and credits the activity. The mark goes first because it is
    /// idempotent: when the credit fails after the mark committed, a retry credits exactly once.
    #[instrument(skip(self, now))]
    pub async fn engage(
        &self,
        user: &UserId,
        kind: ActivityKind,
        now: DateTime<Utc>,
    ) -> EngineResult<EngageView> {
        let state = self.daily.record_engagement(user, now).await?;
        let activity = self.ledger.record_activity(user, kind, now).await?;
        let today = self.compose(state, now).await?;

        Ok(EngageView { today, activity })
    }

    #[instrument(skip(self, now))]
    pub async fn points(&self, user: &UserId, now: DateTime<Utc>) -> EngineResult<PointsView> {
        let day = crate::clock::day_id(now);
        let account = self.ledger.account(user, now).await?;
        let activity = self.ledger.day_activity(user, day).await?;

        Ok(PointsView {
            static_points: account.static_points,
            dynamic_points_today: activity.earned,
            dynamic_cap: self.config.dynamic_daily_cap,
            keys_balance: account.keys_balance,
            conversion_cap_remaining: (self.config.conversion_daily_cap - activity.converted).max(0),
            dynamic_balance: account.dynamic_points,
        })
    }

    pub async fn convert(
        &self,
        user: &UserId,
        points: i64,
        now: DateTime<Utc>,
    ) -> EngineResult<ConversionOutcome> {
        self.ledger.convert(user, points, now).await
    }

    #[instrument(skip(self, now))]
    pub async fn today_draw(&self, user: &UserId, now: DateTime<Utc>) -> EngineResult<DrawView> {
        let state = self.daily.get_or_create(user, now).await?;
        Ok(self.draws.ensure_draw(state.day_id, now).await?.into())
    }

    pub async fn draw_view(&self, day: DayId) -> EngineResult<Option<DrawView>> {
        Ok(self.draws.get(day).await?.map(DrawView::from))
    }

    pub async fn leaderboard(&self, day: DayId) -> EngineResult<Option<LeaderboardSnapshot>> {
        self.leaderboard.get(day).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::test::{at, day};
    use crate::engine::test::engine;

    #[tokio::test]
    async fn test_today_view() {
        let (engine, _) = engine();
        let user = UserId::from("u1");
        let now = at(2025, 6, 1, 12, 0);

        let fresh = engine.today(&user, now).await.unwrap();
        assert_eq!(fresh.day_id, day(2025, 6, 1));
        assert_eq!(fresh.draw_status, DrawStatus::Pending);
        assert!(!fresh.engaged);
        assert_eq!(fresh.tickets, 0);

        let engaged = engine.engage(&user, ActivityKind::Share, now).await.unwrap();
        assert!(engaged.today.engaged);
        assert_eq!(engaged.today.dynamic_points_today, 25);
        assert_eq!(engaged.today.tickets, 1);
        assert_eq!(engaged.activity.applied, 25);

        let json = serde_json::to_value(&engaged).unwrap();
        assert_eq!(json["day_id"], "2025-06-01");
        assert_eq!(json["draw_status"], "pending");
        assert_eq!(json["activity"]["activity"], "share");
    }

    #[tokio::test]
    async fn test_engage_retry_after_partial_write_credits_once() {
        let (engine, _) = engine();
        let user = UserId::from("u1");
        let now = at(2025, 6, 1, 12, 0);

        // the engagement mark committed but the credit never landed
        engine.daily.record_engagement(&user, now).await.unwrap();

        let retried = engine.engage(&user, ActivityKind::Share, now).await.unwrap();
        assert!(retried.today.engaged);
        assert_eq!(retried.activity.applied, 25);
        assert_eq!(retried.today.dynamic_points_today, 25);
        assert_eq!(retried.today.tickets, 1);
    }

    #[tokio::test]
    async fn test_points_view() {
        let (engine, _) = engine();
        let user = UserId::from("u1");
        let now = at(2025, 6, 1, 12, 0);

        engine
            .ledger
            .credit_static(&user, 40, StaticSource::FollowerAttestation, now)
            .await
            .unwrap();
        engine.ledger.record_activity(&user, ActivityKind::Quiz, now).await.unwrap();
        engine.convert(&user, 20, now).await.unwrap();

        let view = engine.points(&user, now).await.unwrap();
        assert_eq!(
            view,
            PointsView {
                static_points: 40,
                dynamic_points_today: 30,
                dynamic_cap: 100,
                keys_balance: 2,
                conversion_cap_remaining: 30,
                dynamic_balance: 10,
            }
        );
    }

    #[tokio::test]
    async fn test_draw_view_hides_winners_until_executed() {
        let (engine, _) = engine();
        let user = UserId::from("u1");
        let d = day(2025, 6, 1);

        engine
            .engage(&user, ActivityKind::Referral, at(2025, 6, 1, 12, 0))
            .await
            .unwrap();

        let pending = engine.today_draw(&user, at(2025, 6, 1, 12, 1)).await.unwrap();
        assert_eq!(pending.status, DrawStatus::Pending);
        assert!(pending.winners.is_none());

        engine.scheduler().close(d, at(2025, 6, 2, 10, 0)).await.unwrap();

        let done = engine.draw_view(d).await.unwrap().unwrap();
        assert_eq!(done.status, DrawStatus::Executed);
        assert_eq!(done.winners.unwrap()[0].user_id, user);
        assert!(done.seed_digest.is_some());

        let board = engine.leaderboard(d).await.unwrap().unwrap();
        assert_eq!(board.entries[0].rank, 1);
        assert!(engine.draw_view(day(2025, 1, 1)).await.unwrap().is_none());
    }
}
