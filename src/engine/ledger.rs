use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::instrument;

use super::draw::DrawEngine;
use super::{EngineConfig, EngineError, EngineResult};
use crate::clock::{DayId, day_id};
use crate::constants::{DIMINISHING_RETURNS_PCT, LEDGER_MAX_ATTEMPTS};
use crate::db::prelude::*;

/// Points for the first occurrence of an activity within a day
pub fn base_award(kind: ActivityKind) -> i64 {
    match kind {
        ActivityKind::CheckIn => 10,
        ActivityKind::HeadlineRead => 5,
        ActivityKind::Reaction => 10,
        ActivityKind::Comment => 20,
        ActivityKind::Share => 25,
        ActivityKind::Quiz => 30,
        ActivityKind::Referral => 50,
    }
}

/// Award for an activity that has already occurred `prior` times today
pub fn award_for(kind: ActivityKind, prior: i64) -> i64 {
    let idx = (prior.max(0) as usize).min(DIMINISHING_RETURNS_PCT.len() - 1);
    base_award(kind) * DIMINISHING_RETURNS_PCT[idx] / 100
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityOutcome {
    pub day_id: DayId,
    pub activity: ActivityKind,
    pub awarded: i64,
    pub applied: i64,
    pub discarded: i64,
    pub tickets_granted: i64,
    pub dynamic_points_today: i64,
    pub dynamic_balance: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversionOutcome {
    pub points: i64,
    pub keys: i64,
    pub dynamic_balance: i64,
    pub keys_balance: i64,
    pub static_points: i64,
    pub conversion_cap_remaining: i64,
}

#[derive(Debug, Clone)]
pub struct PointsLedger {
    store: Arc<dyn Store>,
    config: Arc<EngineConfig>,
    draws: DrawEngine,
}

impl PointsLedger {
    pub fn new(store: Arc<dyn Store>, config: Arc<EngineConfig>, draws: DrawEngine) -> Self {
        Self {
            store,
            config,
            draws,
        }
    }

    pub async fn account(&self, user: &UserId, now: DateTime<Utc>) -> EngineResult<PointsAccount> {
        Ok(self
            .store
            .get_account(user)
            .await?
            .unwrap_or_else(|| PointsAccount::empty(user.clone(), now)))
    }

    pub async fn day_activity(&self, user: &UserId, day: DayId) -> EngineResult<DayActivity> {
        Ok(self
            .store
            .get_activity(user, day)
            .await?
            .unwrap_or_else(|| DayActivity::empty(user.clone(), day)))
    }

    pub async fn ledger_events(&self, user: &UserId) -> EngineResult<Vec<LedgerEvent>> {
        Ok(self.store.list_ledger_events(user).await?)
    }

    async fn load(
        &self,
        user: &UserId,
        day: DayId,
        now: DateTime<Utc>,
    ) -> EngineResult<(PointsAccount, DayActivity)> {
        Ok((self.account(user, now).await?, self.day_activity(user, day).await?))
    }

    /// Credits dynamic points for one engagement event.
    ///
    /// The award shrinks with each repeat of the same activity on the same day, and whatever would
    /// push the day's total past the cap is discarded. Every `ticket_threshold` raw points crossed
    /// enters the user into the day's draw once more.
    #[instrument(skip(self, now))]
    pub async fn record_activity(
        &self,
        user: &UserId,
        kind: ActivityKind,
        now: DateTime<Utc>,
    ) -> EngineResult<ActivityOutcome> {
        let day = day_id(now);
        let cap = self.config.dynamic_daily_cap;
        let threshold = self.config.ticket_threshold;

        for attempt in 1..=LEDGER_MAX_ATTEMPTS {
            let (mut account, mut activity) = self.load(user, day, now).await?;

            let awarded = award_for(kind, activity.count_of(kind));
            let applied = awarded.min((cap - activity.earned).max(0));
            let discarded = awarded - applied;

            let raw_before = activity.raw_points;
            let raw_after = raw_before + awarded;
            let crossings = raw_after / threshold - raw_before / threshold;

            *activity.event_counts.entry(kind).or_insert(0) += 1;
            activity.raw_points = raw_after;
            activity.earned += applied;
            activity.tickets_granted += crossings;
            if applied > 0 && activity.first_earned_at.is_none() {
                activity.first_earned_at = Some(now);
            }
            activity.version += 1;

            account.dynamic_points += applied;
            account.updated_at = now;
            account.version += 1;

            let event = LedgerEvent::new(
                user.clone(),
                Some(day),
                LedgerEntry::Activity {
                    activity: kind,
                    awarded,
                    applied,
                    discarded,
                },
                now,
            );

            let dynamic_points_today = activity.earned;
            let dynamic_balance = account.dynamic_points;
            let update = LedgerUpdate {
                account,
                activity: Some(activity),
                events: vec![event],
            };

            if !self.store.commit_ledger(&update).await? {
                tracing::debug!(attempt, "ledger version moved, retrying");
                continue;
            }

            if discarded > 0 {
                tracing::debug!(discarded, "daily cap reached, excess discarded");
            }

            if crossings > 0 {
                // the committed activity row remembers the grant, so a failure here is healed
                // from `tickets_granted` when the day is snapshotted
                match self.draws.accrue_ticket(user, day, crossings).await {
                    Ok(total) => tracing::info!(crossings, total, "ticket threshold crossed"),
                    Err(EngineError::DrawClosed(_)) => {
                        tracing::warn!(crossings, "draw already closing, tickets not entered")
                    }
                    Err(e) => tracing::error!(error = %e, crossings, "failed to accrue tickets"),
                }
            }

            return Ok(ActivityOutcome {
                day_id: day,
                activity: kind,
                awarded,
                applied,
                discarded,
                tickets_granted: crossings,
                dynamic_points_today,
                dynamic_balance,
            });
        }

        Err(EngineError::Contention(user.clone()))
    }

    /// Converts dynamic points into keys. Irreversible.
    #[instrument(skip(self, now))]
    pub async fn convert(
        &self,
        user: &UserId,
        points: i64,
        now: DateTime<Utc>,
    ) -> EngineResult<ConversionOutcome> {
        let per_key = self.config.points_per_key;
        if points <= 0 {
            return Err(EngineError::InvalidAmount {
                amount: points,
                reason: "conversion amount must be positive",
            });
        }
        if points % per_key != 0 {
            return Err(EngineError::InvalidAmount {
                amount: points,
                reason: "conversion amount must be a whole number of keys",
            });
        }

        let day = day_id(now);
        let cap = self.config.conversion_daily_cap;

        for attempt in 1..=LEDGER_MAX_ATTEMPTS {
            let (mut account, mut activity) = self.load(user, day, now).await?;

            if points > account.dynamic_points {
                return Err(EngineError::InsufficientDynamicPoints {
                    requested: points,
                    available: account.dynamic_points,
                });
            }

            let remaining = (cap - activity.converted).max(0);
            if points > remaining {
                return Err(EngineError::ConversionCapExceeded {
                    requested: points,
                    remaining,
                });
            }

            let keys = points / per_key;
            account.dynamic_points -= points;
            account.keys_balance += keys;
            account.lifetime_dynamic_converted += points;
            account.updated_at = now;
            account.version += 1;

            activity.converted += points;
            activity.version += 1;

            let update = LedgerUpdate {
                events: vec![LedgerEvent::new(
                    user.clone(),
                    Some(day),
                    LedgerEntry::Conversion { points, keys },
                    now,
                )],
                account,
                activity: Some(activity),
            };

            if !self.store.commit_ledger(&update).await? {
                tracing::debug!(attempt, "ledger version moved, retrying");
                continue;
            }

            tracing::info!(points, keys, "converted dynamic points");
            return Ok(ConversionOutcome {
                points,
                keys,
                dynamic_balance: update.account.dynamic_points,
                keys_balance: update.account.keys_balance,
                static_points: update.account.static_points,
                conversion_cap_remaining: remaining - points,
            });
        }

        Err(EngineError::Contention(user.clone()))
    }

    /// Credits identity points. Static points only ever grow and never feed conversion.
    #[instrument(skip(self, now))]
    pub async fn credit_static(
        &self,
        user: &UserId,
        amount: i64,
        source: StaticSource,
        now: DateTime<Utc>,
    ) -> EngineResult<PointsAccount> {
        if amount < 0 {
            return Err(EngineError::InvalidAmount {
                amount,
                reason: "static credits cannot be negative",
            });
        }
        if amount == 0 {
            return self.account(user, now).await;
        }

        for attempt in 1..=LEDGER_MAX_ATTEMPTS {
            let mut account = self.account(user, now).await?;
            account.static_points += amount;
            account.updated_at = now;
            account.version += 1;

            let update = LedgerUpdate {
                events: vec![LedgerEvent::new(
                    user.clone(),
                    None,
                    LedgerEntry::StaticCredit { amount, source },
                    now,
                )],
                account,
                activity: None,
            };

            if self.store.commit_ledger(&update).await? {
                tracing::info!(amount, "credited static points");
                return Ok(update.account);
            }
            tracing::debug!(attempt, "ledger version moved, retrying");
        }

        Err(EngineError::Contention(user.clone()))
    }
}
