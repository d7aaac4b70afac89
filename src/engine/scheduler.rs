//! Opens and closes days. Every step is idempotent, so ticks may repeat, overlap with an admin
//! trigger, or arrive days late after downtime.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::instrument;

use super::daily::DailyStateManager;
use super::draw::DrawEngine;
use super::leaderboard::LeaderboardSnapshotter;
use super::{EngineConfig, EngineError, EngineResult};
use crate::clock::{DayId, day_id, next_boundary};
use crate::constants::SCHEDULER_FALLBACK_TICK_SECS;
use crate::db::prelude::*;

#[derive(Debug, Clone, Serialize)]
pub struct CloseReport {
    pub day_id: DayId,
    /// False when an earlier run had already closed the day
    pub newly_closed: bool,
    pub snapshot: LeaderboardSnapshot,
    pub draw: Draw,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub opened: Vec<DayId>,
    pub closed: Vec<DayId>,
    /// Missed days left open for the following tick
    pub deferred: Vec<DayId>,
}

#[derive(Debug, Clone)]
pub struct DayRolloverScheduler {
    store: Arc<dyn Store>,
    config: Arc<EngineConfig>,
    daily: DailyStateManager,
    draws: DrawEngine,
    leaderboard: LeaderboardSnapshotter,
}

impl DayRolloverScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        config: Arc<EngineConfig>,
        daily: DailyStateManager,
        draws: DrawEngine,
        leaderboard: LeaderboardSnapshotter,
    ) -> Self {
        Self {
            store,
            config,
            daily,
            draws,
            leaderboard,
        }
    }

    #[instrument(skip(self, now))]
    pub async fn open(&self, day: DayId, now: DateTime<Utc>) -> EngineResult<DayRecord> {
        let record = self.daily.open_day(day, now).await?;
        if self.store.mark_opened(day, now).await? {
            tracing::debug!(%day, "rollover job opened");
        }

        Ok(record)
    }

    /// Snapshots the day, runs its draw, then records the close. Nothing is written before the
    /// day's boundary has passed.
    #[instrument(skip(self, now))]
    pub async fn close(&self, day: DayId, now: DateTime<Utc>) -> EngineResult<CloseReport> {
        if now < day.ends_at() {
            return Err(EngineError::DrawNotClosable(day));
        }

        let already = self
            .store
            .get_rollover(day)
            .await?
            .is_some_and(|job| job.closed_at.is_some());

        let snapshot = self.leaderboard.snapshot(day, now).await?;
        let draw = self.draws.execute_draw(day, now).await?;
        let newly_closed = !already && self.store.mark_closed(day, now).await?;

        if newly_closed {
            tracing::info!(
                %day,
                entries = snapshot.entries.len(),
                winners = draw.winners.len(),
                "closed day"
            );
        } else {
            tracing::info!(%day, "day already closed");
        }

        Ok(CloseReport {
            day_id: day,
            newly_closed,
            snapshot,
            draw,
        })
    }

    /// Brings the rollover state up to date with `now`: opens the current day (and the next one
    /// when its boundary is within the open lead), then closes the days since the last close in
    /// day order. A long backlog is worked off `max_catchup_days` at a time; the rest is reported
    /// as deferred and picked up by the next tick, so no missed day goes without its draw.
    #[instrument(skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> EngineResult<TickReport> {
        let current = day_id(now);
        let mut report = TickReport::default();

        self.open(current, now).await?;
        report.opened.push(current);

        if next_boundary(now) - now <= self.config.open_lead {
            self.open(current.next(), now).await?;
            report.opened.push(current.next());
        }

        let Some(latest) = self.store.latest_closed_day().await? else {
            self.close(current.prev(), now).await?;
            report.closed.push(current.prev());
            return Ok(report);
        };

        let gap = latest.days_until(current) - 1;
        if gap < 0 {
            tracing::warn!(%latest, %current, "latest closed day is ahead of the clock");
            return Ok(report);
        }
        if gap > 1 {
            tracing::warn!(%latest, %current, missed = gap, "missed rollover, catching up");
        }

        let mut day = latest.next();
        let mut budget = self.config.max_catchup_days.max(1);
        while day < current && budget > 0 {
            self.close(day, now).await?;
            report.closed.push(day);

            if day.next() < current {
                self.open(day.next(), now).await?;
                report.opened.push(day.next());
            }
            day = day.next();
            budget -= 1;
        }

        while day < current {
            report.deferred.push(day);
            day = day.next();
        }
        if !report.deferred.is_empty() {
            tracing::warn!(deferred = report.deferred.len(), "catch-up continues on the next tick");
        }

        Ok(report)
    }

    /// How long to sleep before the next tick: until the next open instant or boundary,
    /// whichever comes first, but never longer than the fallback interval
    pub fn next_wake(&self, now: DateTime<Utc>) -> Duration {
        let boundary = next_boundary(now);
        let open_at = boundary - self.config.open_lead;
        let wake = if open_at > now { open_at } else { boundary };

        let fallback = Duration::from_secs(SCHEDULER_FALLBACK_TICK_SECS);
        (wake - now).to_std().unwrap_or(Duration::ZERO).min(fallback)
    }

    pub async fn run(self) {
        tracing::info!("starting rollover scheduler");

        loop {
            let backlog = match self.tick(Utc::now()).await {
                Ok(report) => {
                    tracing::debug!(?report, "tick");
                    !report.deferred.is_empty()
                }
                Err(e) => {
                    tracing::error!(error = %e, transient = e.is_transient(), "rollover tick failed");
                    false
                }
            };

            if !backlog {
                tokio::time::sleep(self.next_wake(Utc::now())).await;
            }
        }
    }
}
