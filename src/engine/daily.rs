use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::instrument;

use super::draw::DrawEngine;
use super::{EngineConfig, EngineResult};
use crate::clock::{DayId, day_id};
use crate::constants::DEFAULT_HEADLINE_ID;
use crate::db::prelude::*;

/// Materializes per-user day state on demand
#[derive(Debug, Clone)]
pub struct DailyStateManager {
    store: Arc<dyn Store>,
    config: Arc<EngineConfig>,
    draws: DrawEngine,
}

impl DailyStateManager {
    pub fn new(store: Arc<dyn Store>, config: Arc<EngineConfig>, draws: DrawEngine) -> Self {
        Self {
            store,
            config,
            draws,
        }
    }

    /// Rotates through the headline catalog by day ordinal
    pub fn headline_for(&self, day: DayId) -> String {
        let catalog = &self.config.headline_ids;
        if catalog.is_empty() {
            return DEFAULT_HEADLINE_ID.to_string();
        }

        let idx = day.ordinal().rem_euclid(catalog.len() as i64) as usize;
        catalog[idx].clone()
    }

    /// Creates the day's shared resources if they do not exist yet. The draw is ensured before
    /// the day record, so any visible record points at a draw that exists.
    #[instrument(skip(self, now))]
    pub async fn open_day(&self, day: DayId, now: DateTime<Utc>) -> EngineResult<DayRecord> {
        if let Some(record) = self.store.get_day(day).await? {
            return Ok(record);
        }

        let draw = self.draws.ensure_draw(day, now).await?;
        let record = DayRecord {
            day_id: day,
            headline_id: self.headline_for(day),
            draw_id: draw.draw_id,
            opened_at: now,
        };

        match self.store.insert_day(&record).await? {
            Inserted::Created(record) => {
                tracing::info!(%day, headline = %record.headline_id, "opened day");
                Ok(record)
            }
            Inserted::Existing(record) => Ok(record),
        }
    }

    #[instrument(skip(self, now))]
    pub async fn get_or_create(&self, user: &UserId, now: DateTime<Utc>) -> EngineResult<DailyState> {
        let day = day_id(now);
        if let Some(state) = self.store.get_daily_state(user, day).await? {
            return Ok(state);
        }

        let record = self.open_day(day, now).await?;
        let state = DailyState::for_day(user.clone(), &record, now);

        Ok(match self.store.insert_daily_state(&state).await? {
            Inserted::Created(state) => {
                tracing::debug!(%day, "materialized daily state");
                state
            }
            Inserted::Existing(state) => {
                tracing::debug!(%day, "lost daily state race, using stored record");
                state
            }
        })
    }

    /// Marks the user engaged with today's headline; repeats are no-ops
    #[instrument(skip(self, now))]
    pub async fn record_engagement(
        &self,
        user: &UserId,
        now: DateTime<Utc>,
    ) -> EngineResult<DailyState> {
        let state = self.get_or_create(user, now).await?;
        if state.engaged {
            return Ok(state);
        }

        if self.store.mark_engaged(user, state.day_id).await? {
            tracing::debug!(day = %state.day_id, "engaged");
        }

        Ok(DailyState {
            engaged: true,
            ..state
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::test::{at, day};
    use crate::engine::EngineError;
    use crate::engine::test::engine;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create_converges() {
        let (engine, store) = engine();
        let user = UserId::from("u1");
        let now = at(2025, 6, 1, 12, 0);

        let handles = (0..16)
            .map(|i| {
                let daily = engine.daily.clone();
                let user = user.clone();
                let now = now + chrono::TimeDelta::milliseconds(i);
                tokio::spawn(async move { daily.get_or_create(&user, now).await })
            })
            .collect::<Vec<_>>();

        let states = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect::<Vec<_>>();

        assert!(states.windows(2).all(|w| w[0] == w[1]));

        let stored = store.get_daily_state(&user, day(2025, 6, 1)).await.unwrap().unwrap();
        assert_eq!(stored, states[0]);

        let draw = store.get_draw(day(2025, 6, 1)).await.unwrap().unwrap();
        let record = store.get_day(day(2025, 6, 1)).await.unwrap().unwrap();
        assert_eq!(stored.draw_id, draw.draw_id);
        assert_eq!(record.draw_id, draw.draw_id);
    }

    #[tokio::test]
    async fn test_state_is_day_scoped() {
        let (engine, _) = engine();
        let user = UserId::from("u1");

        let before = engine.daily.get_or_create(&user, at(2025, 6, 2, 9, 59)).await.unwrap();
        let after = engine.daily.get_or_create(&user, at(2025, 6, 2, 10, 0)).await.unwrap();

        assert_eq!(before.day_id, day(2025, 6, 1));
        assert_eq!(after.day_id, day(2025, 6, 2));
        assert_ne!(before.draw_id, after.draw_id);
        assert_ne!(before.headline_id, after.headline_id);
    }

    #[tokio::test]
    async fn test_store_outage_surfaces_transient() {
        let (engine, store) = engine();
        store.set_available(false);

        let err = engine
            .daily
            .get_or_create(&"u1".into(), at(2025, 6, 1, 12, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));
        assert!(err.is_transient());

        store.set_available(true);
        assert!(store.get_day(day(2025, 6, 1)).await.unwrap().is_none());
        assert!(
            store
                .get_daily_state(&"u1".into(), day(2025, 6, 1))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_engagement_is_idempotent() {
        let (engine, store) = engine();
        let user = UserId::from("u1");
        let now = at(2025, 6, 1, 12, 0);

        for _ in 0..3 {
            let state = engine.daily.record_engagement(&user, now).await.unwrap();
            assert!(state.engaged);
        }

        let stored = store.get_daily_state(&user, day(2025, 6, 1)).await.unwrap().unwrap();
        assert!(stored.engaged);
    }

    #[test]
    fn test_headline_rotation_without_catalog() {
        let (engine, _) = engine();
        let bare = DailyStateManager::new(
            engine.store.clone(),
            Arc::new(EngineConfig::default()),
            engine.draws.clone(),
        );

        assert_eq!(bare.headline_for(day(2025, 6, 1)), DEFAULT_HEADLINE_ID);
        assert_ne!(
            engine.daily.headline_for(day(2025, 6, 1)),
            engine.daily.headline_for(day(2025, 6, 2))
        );
    }
}
