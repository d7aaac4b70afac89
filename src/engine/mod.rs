//! The daily-cycle engine: per-user day state, the points ledger, the daily draw, leaderboard
//! snapshots and the rollover job that ties a closed day together.

use std::sync::Arc;

use chrono::TimeDelta;
use thiserror::Error;

use crate::clock::DayId;
use crate::constants::*;
use crate::db::models::draw::default_prize_pool;
use crate::db::prelude::*;
use crate::db::redis::SnapshotCache;
use crate::util::env::Env;

pub mod daily;
pub mod draw;
pub mod leaderboard;
pub mod ledger;
pub mod scheduler;
pub mod view;

use daily::DailyStateManager;
use draw::DrawEngine;
use leaderboard::LeaderboardSnapshotter;
use ledger::PointsLedger;
use scheduler::DayRolloverScheduler;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub dynamic_daily_cap: i64,
    pub conversion_daily_cap: i64,
    pub points_per_key: i64,
    pub ticket_threshold: i64,
    pub headline_ids: Vec<String>,
    pub prize_pool: Vec<Prize>,
    pub draw_secret: String,
    pub open_lead: TimeDelta,
    pub max_catchup_days: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dynamic_daily_cap: DEFAULT_DYNAMIC_DAILY_CAP,
            conversion_daily_cap: DEFAULT_CONVERSION_DAILY_CAP,
            points_per_key: DEFAULT_POINTS_PER_KEY,
            ticket_threshold: DEFAULT_TICKET_THRESHOLD,
            headline_ids: Vec::new(),
            prize_pool: default_prize_pool(),
            draw_secret: String::new(),
            open_lead: TimeDelta::seconds(DEFAULT_OPEN_LEAD_SECS),
            max_catchup_days: DEFAULT_MAX_CATCHUP_DAYS,
        }
    }
}

impl From<&Env> for EngineConfig {
    fn from(env: &Env) -> Self {
        Self {
            dynamic_daily_cap: env.dynamic_daily_cap.max(0),
            conversion_daily_cap: env.conversion_daily_cap.max(0),
            points_per_key: env.points_per_key.max(1),
            ticket_threshold: env.ticket_threshold.max(1),
            headline_ids: env.headline_ids.clone(),
            prize_pool: default_prize_pool(),
            draw_secret: env.draw_secret.clone(),
            open_lead: TimeDelta::seconds(env.open_lead_secs.max(0)),
            max_catchup_days: env.max_catchup_days.max(1),
        }
    }
}

/// Every engine component, sharing one store and one config
#[derive(Debug, Clone)]
pub struct Engine {
    pub store: Arc<dyn Store>,
    pub config: Arc<EngineConfig>,
    pub draws: DrawEngine,
    pub ledger: PointsLedger,
    pub daily: DailyStateManager,
    pub leaderboard: LeaderboardSnapshotter,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, config: EngineConfig, cache: Option<SnapshotCache>) -> Self {
        let config = Arc::new(config);
        let draws = DrawEngine::new(store.clone(), config.clone());

        Self {
            ledger: PointsLedger::new(store.clone(), config.clone(), draws.clone()),
            daily: DailyStateManager::new(store.clone(), config.clone(), draws.clone()),
            leaderboard: LeaderboardSnapshotter::new(store.clone(), cache),
            draws,
            store,
            config,
        }
    }

    pub fn scheduler(&self) -> DayRolloverScheduler {
        DayRolloverScheduler::new(
            self.store.clone(),
            self.config.clone(),
            self.daily.clone(),
            self.draws.clone(),
            self.leaderboard.clone(),
        )
    }
}

pub type EngineResult<T> = core::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("ledger for '{0}' kept changing underneath the update")]
    Contention(UserId),

    #[error("requested {requested} dynamic points but only {available} are available")]
    InsufficientDynamicPoints { requested: i64, available: i64 },

    #[error("converting {requested} points exceeds today's remaining conversion cap of {remaining}")]
    ConversionCapExceeded { requested: i64, remaining: i64 },

    #[error("invalid amount {amount}: {reason}")]
    InvalidAmount { amount: i64, reason: &'static str },

    #[error("draw for {0} cannot execute before the day has closed")]
    DrawNotClosable(DayId),

    #[error("draw for {0} no longer accepts tickets")]
    DrawClosed(DayId),
}

impl EngineError {
    /// Retryable by the caller; nothing was committed
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Storage(e) => e.is_transient(),
            EngineError::Contention(_) => true,
            _ => false,
        }
    }
}
