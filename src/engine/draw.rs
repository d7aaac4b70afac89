use std::sync::Arc;

use chrono::{DateTime, Utc};
use ring::digest;
use tinyrand::{RandRange, Seeded, Wyrand};
use tracing::instrument;

use super::{EngineConfig, EngineError, EngineResult};
use crate::clock::DayId;
use crate::db::prelude::*;

#[derive(Debug, Clone)]
pub struct DrawEngine {
    store: Arc<dyn Store>,
    config: Arc<EngineConfig>,
}

impl DrawEngine {
    pub fn new(store: Arc<dyn Store>, config: Arc<EngineConfig>) -> Self {
        Self { store, config }
    }

    /// Returns the day's draw, creating it in `pending` if no draw exists yet
    #[instrument(skip(self, now))]
    pub async fn ensure_draw(&self, day: DayId, now: DateTime<Utc>) -> EngineResult<Draw> {
        if let Some(draw) = self.store.get_draw(day).await? {
            return Ok(draw);
        }

        let pending = Draw::pending(day, self.config.prize_pool.clone(), now);
        let inserted = self.store.insert_draw(&pending).await?;
        if inserted.was_created() {
            tracing::info!(%day, draw_id = %pending.draw_id, "opened draw");
        }

        Ok(inserted.into_inner())
    }

    pub async fn get(&self, day: DayId) -> EngineResult<Option<Draw>> {
        Ok(self.store.get_draw(day).await?)
    }

    pub async fn tickets(&self, user: &UserId, day: DayId) -> EngineResult<i64> {
        Ok(self.store.get_tickets(user, day).await?)
    }

    /// Adds `count` tickets for the user's entry into the day's draw
    #[instrument(skip(self))]
    pub async fn accrue_ticket(&self, user: &UserId, day: DayId, count: i64) -> EngineResult<i64> {
        if count <= 0 {
            return Err(EngineError::InvalidAmount {
                amount: count,
                reason: "ticket count must be positive",
            });
        }

        if let Some(draw) = self.store.get_draw(day).await? {
            if draw.status != DrawStatus::Pending {
                return Err(EngineError::DrawClosed(day));
            }
        }

        let total = self.store.add_tickets(user, day, count).await?;
        tracing::debug!(total, "accrued tickets");
        Ok(total)
    }

    /// Runs the day's draw once.
    ///
    /// Status moves pending -> closing -> executed, each step a compare-and-swap. Winner selection
    /// is a pure function of the day and the frozen weights, so a run interrupted while `closing`
    /// resumes to the same result, and any call that finds the draw `executed` returns the stored
    /// winners untouched.
    #[instrument(skip(self, now))]
    pub async fn execute_draw(&self, day: DayId, now: DateTime<Utc>) -> EngineResult<Draw> {
        if now < day.ends_at() {
            return Err(EngineError::DrawNotClosable(day));
        }

        let mut draw = self.ensure_draw(day, now).await?;
        loop {
            match draw.status {
                DrawStatus::Executed => {
                    tracing::info!(%day, winners = draw.winners.len(), "draw already executed");
                    return Ok(draw);
                }

                DrawStatus::Pending => {
                    let closing = Draw {
                        status: DrawStatus::Closing,
                        ..draw.clone()
                    };

                    draw = if self.store.cas_draw(DrawStatus::Pending, &closing).await? {
                        tracing::debug!(%day, "draw closing");
                        closing
                    } else {
                        self.reread(day).await?
                    };
                }

                DrawStatus::Closing => {
                    let entrants = self.entrants(day).await?;
                    let (seed, seed_digest) = draw_seed(&self.config.draw_secret, day);
                    let winners = select_winners(seed, &draw.prize_pool, entrants);

                    let executed = Draw {
                        status: DrawStatus::Executed,
                        winners,
                        seed_digest: Some(seed_digest),
                        executed_at: Some(now),
                        ..draw.clone()
                    };

                    if self.store.cas_draw(DrawStatus::Closing, &executed).await? {
                        tracing::info!(%day, winners = executed.winners.len(), "draw executed");
                        return Ok(executed);
                    }

                    draw = self.reread(day).await?;
                }
            }
        }
    }

    /// Weighted entrants: the frozen snapshot's ticket column when the day has been snapshotted,
    /// the live ticket counts otherwise
    async fn entrants(&self, day: DayId) -> EngineResult<Vec<(UserId, i64)>> {
        Ok(match self.store.get_snapshot(day).await? {
            Some(snapshot) => snapshot
                .entries
                .into_iter()
                .map(|e| (e.user_id, e.tickets))
                .collect(),
            None => self
                .store
                .list_tickets(day)
                .await?
                .into_iter()
                .map(|t| (t.user_id, t.count))
                .collect(),
        })
    }

    async fn reread(&self, day: DayId) -> EngineResult<Draw> {
        self.store
            .get_draw(day)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("draw for {day} vanished")).into())
    }
}

/// Derives the day's rng seed from the draw secret. The full digest is published with the
/// executed draw so the selection can be replayed for audit.
pub fn draw_seed(secret: &str, day: DayId) -> (u64, String) {
    let mut ctx = digest::Context::new(&digest::SHA256);
    ctx.update(secret.as_bytes());
    ctx.update(b"draw:");
    ctx.update(day.to_string().as_bytes());
    let digest = ctx.finish();

    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_ref()[..8]);

    (u64::from_le_bytes(head), hex::encode(digest.as_ref()))
}

/// Draws one winner per prize slot, without replacement, each entrant weighted by tickets.
///
/// Entrants are ordered by user id before drawing so equal inputs always walk the pool the same
/// way. Zero-weight entrants never win; once the pool is empty the remaining slots stay unfilled.
pub fn select_winners(seed: u64, prize_pool: &[Prize], mut pool: Vec<(UserId, i64)>) -> Vec<Winner> {
    pool.retain(|(_, weight)| *weight > 0);
    pool.sort_by(|a, b| a.0.cmp(&b.0));

    let mut rng = Wyrand::seed(seed);
    let mut winners = Vec::with_capacity(prize_pool.len().min(pool.len()));

    for (slot, prize) in prize_pool.iter().enumerate() {
        let total: i64 = pool.iter().map(|(_, weight)| *weight).sum();
        if total <= 0 {
            break;
        }

        let mut pick = rng.next_range(0..total as usize) as i64;
        let idx = pool
            .iter()
            .position(|(_, weight)| {
                if pick < *weight {
                    true
                } else {
                    pick -= weight;
                    false
                }
            })
            .unwrap_or(pool.len() - 1);

        let (user_id, tickets) = pool.remove(idx);
        winners.push(Winner {
            slot: slot as i64,
            user_id,
            tickets,
            prize: prize.clone(),
        });
    }

    winners
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;
    use crate::clock::test::{at, day};
    use crate::db::models::draw::default_prize_pool;
    use crate::engine::test::engine;

    fn one_slot() -> Vec<Prize> {
        vec![Prize::Badge {
            badge: String::from("winner"),
        }]
    }

    #[test]
    fn test_weights_three_to_one() {
        let mut wins: HashMap<UserId, i64> = HashMap::new();
        let pool = vec![(UserId::from("alice"), 3), (UserId::from("bob"), 1)];

        for seed in 0..4_000u64 {
            let winners = select_winners(seed, &one_slot(), pool.clone());
            assert_eq!(winners.len(), 1);
            *wins.entry(winners[0].user_id.clone()).or_default() += 1;
        }

        let alice = wins[&UserId::from("alice")];
        let bob = wins[&UserId::from("bob")];
        assert_eq!(alice + bob, 4_000);
        assert!((2_800..=3_200).contains(&alice), "alice won {alice} of 4000");
    }

    #[test]
    fn test_zero_tickets_never_win() {
        let pool = vec![
            (UserId::from("a"), 2),
            (UserId::from("ghost"), 0),
            (UserId::from("c"), 1),
        ];

        for seed in 0..500u64 {
            let winners = select_winners(seed, &default_prize_pool(), pool.clone());
            // two ticket holders, four slots: the rest stay empty
            assert_eq!(winners.len(), 2);
            assert!(winners.iter().all(|w| w.user_id.0 != "ghost"));
            assert_ne!(winners[0].user_id, winners[1].user_id);
        }

        assert!(select_winners(1, &default_prize_pool(), Vec::new()).is_empty());
    }

    #[test]
    fn test_selection_is_reproducible_and_order_independent() {
        let pool = vec![
            (UserId::from("m"), 4),
            (UserId::from("b"), 1),
            (UserId::from("x"), 7),
        ];
        let mut shuffled = pool.clone();
        shuffled.reverse();

        let (seed, digest) = draw_seed("secret", day(2025, 6, 1));
        assert_eq!(digest.len(), 64);
        assert_eq!(draw_seed("secret", day(2025, 6, 1)).0, seed);
        assert_ne!(draw_seed("other", day(2025, 6, 1)).0, seed);
        assert_ne!(draw_seed("secret", day(2025, 6, 2)).0, seed);

        assert_eq!(
            select_winners(seed, &default_prize_pool(), pool),
            select_winners(seed, &default_prize_pool(), shuffled)
        );
    }

    #[tokio::test]
    async fn test_execute_draw_is_idempotent() {
        let (engine, store) = engine();
        let d = day(2025, 6, 1);
        let during = at(2025, 6, 1, 15, 0);
        let after = at(2025, 6, 2, 10, 0);

        engine.draws.ensure_draw(d, during).await.unwrap();
        engine.draws.accrue_ticket(&"u1".into(), d, 3).await.unwrap();
        engine.draws.accrue_ticket(&"u2".into(), d, 1).await.unwrap();

        let first = engine.draws.execute_draw(d, after).await.unwrap();
        assert_eq!(first.status, DrawStatus::Executed);
        assert_eq!(first.winners.len(), 2);

        for _ in 0..5 {
            let again = engine.draws.execute_draw(d, at(2025, 6, 3, 12, 0)).await.unwrap();
            assert_eq!(again, first);
        }

        assert_eq!(store.get_draw(d).await.unwrap().unwrap(), first);
    }

    #[tokio::test]
    async fn test_execute_draw_refuses_open_day() {
        let (engine, _) = engine();
        let d = day(2025, 6, 1);

        let err = engine
            .draws
            .execute_draw(d, at(2025, 6, 2, 9, 59))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DrawNotClosable(_)));
    }

    #[tokio::test]
    async fn test_resumes_interrupted_close() {
        let (engine, store) = engine();
        let d = day(2025, 6, 1);
        let after = at(2025, 6, 2, 10, 5);

        let draw = engine.draws.ensure_draw(d, at(2025, 6, 1, 11, 0)).await.unwrap();
        engine.draws.accrue_ticket(&"u1".into(), d, 2).await.unwrap();

        // a previous run died right after moving to closing
        let closing = Draw {
            status: DrawStatus::Closing,
            ..draw
        };
        assert!(store.cas_draw(DrawStatus::Pending, &closing).await.unwrap());

        let err = engine.draws.accrue_ticket(&"u2".into(), d, 1).await.unwrap_err();
        assert!(matches!(err, EngineError::DrawClosed(_)));

        let executed = engine.draws.execute_draw(d, after).await.unwrap();
        assert_eq!(executed.status, DrawStatus::Executed);
        assert_eq!(executed.winners.len(), 1);
        assert_eq!(executed.winners[0].user_id, UserId::from("u1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_executions_agree() {
        let (engine, _) = engine();
        let d = day(2025, 6, 1);

        for (user, n) in [("a", 5), ("b", 2), ("c", 9), ("d", 1)] {
            engine.draws.accrue_ticket(&user.into(), d, n).await.unwrap();
        }

        let handles = (0..8)
            .map(|_| {
                let draws = engine.draws.clone();
                tokio::spawn(async move { draws.execute_draw(d, at(2025, 6, 2, 10, 0)).await })
            })
            .collect::<Vec<_>>();

        let results = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect::<Vec<_>>();

        assert!(results.windows(2).all(|w| w[0] == w[1]));
    }
}
