use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::instrument;

use super::{EngineError, EngineResult};
use crate::clock::DayId;
use crate::db::prelude::*;
use crate::db::redis::SnapshotCache;

#[derive(Debug, Clone)]
pub struct LeaderboardSnapshotter {
    store: Arc<dyn Store>,
    cache: Option<SnapshotCache>,
}

impl LeaderboardSnapshotter {
    pub fn new(store: Arc<dyn Store>, cache: Option<SnapshotCache>) -> Self {
        Self { store, cache }
    }

    /// Freezes the day's ranking. Once a snapshot exists it is returned as is; the ticket column
    /// it captures is what the day's draw weighs entrants by. A day still in progress cannot be
    /// captured.
    #[instrument(skip(self, now))]
    pub async fn snapshot(&self, day: DayId, now: DateTime<Utc>) -> EngineResult<LeaderboardSnapshot> {
        if let Some(existing) = self.store.get_snapshot(day).await? {
            return Ok(existing);
        }

        if now < day.ends_at() {
            return Err(EngineError::DrawNotClosable(day));
        }

        let activity = self.store.list_activity(day).await?;
        let tickets = self.store.list_tickets(day).await?;

        let snapshot = LeaderboardSnapshot {
            day_id: day,
            entries: rank_entries(activity, tickets),
            captured_at: now,
        };

        let snapshot = match self.store.insert_snapshot(&snapshot).await? {
            Inserted::Created(snapshot) => {
                tracing::info!(%day, entries = snapshot.entries.len(), "captured leaderboard");
                snapshot
            }
            Inserted::Existing(snapshot) => snapshot,
        };

        self.publish(&snapshot).await;
        Ok(snapshot)
    }

    /// Reads a captured snapshot, preferring the cache when one is configured
    #[instrument(skip(self))]
    pub async fn get(&self, day: DayId) -> EngineResult<Option<LeaderboardSnapshot>> {
        if let Some(cache) = &self.cache {
            match cache.get(day).await {
                Ok(Some(snapshot)) => return Ok(Some(snapshot)),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "snapshot cache read failed"),
            }
        }

        let snapshot = self.store.get_snapshot(day).await?;
        if let Some(snapshot) = &snapshot {
            self.publish(snapshot).await;
        }

        Ok(snapshot)
    }

    async fn publish(&self, snapshot: &LeaderboardSnapshot) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(snapshot).await {
                tracing::warn!(error = %e, "failed to cache snapshot");
            }
        }
    }
}

/// Ranks by points earned that day (desc), then earliest first earn, then user id.
///
/// A user's ticket count is the larger of the live ticket table and the activity row's granted
/// tickets, covering grants whose ticket write never landed. Users with neither points nor
/// tickets are left out.
pub fn rank_entries(activity: Vec<DayActivity>, tickets: Vec<TicketEntry>) -> Vec<LeaderboardEntry> {
    let mut rows: BTreeMap<UserId, LeaderboardEntry> = BTreeMap::new();

    for t in tickets {
        rows.insert(
            t.user_id.clone(),
            LeaderboardEntry {
                rank: 0,
                user_id: t.user_id,
                dynamic_points: 0,
                tickets: t.count,
                first_earned_at: None,
            },
        );
    }

    for a in activity {
        let row = rows.entry(a.user_id.clone()).or_insert_with(|| LeaderboardEntry {
            rank: 0,
            user_id: a.user_id.clone(),
            dynamic_points: 0,
            tickets: 0,
            first_earned_at: None,
        });
        row.dynamic_points = a.earned;
        row.first_earned_at = a.first_earned_at;
        row.tickets = row.tickets.max(a.tickets_granted);
    }

    let mut entries = rows
        .into_values()
        .filter(|e| e.dynamic_points > 0 || e.tickets > 0)
        .collect::<Vec<_>>();

    entries.sort_by(|a, b| {
        b.dynamic_points
            .cmp(&a.dynamic_points)
            .then_with(|| match (a.first_earned_at, b.first_earned_at) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => core::cmp::Ordering::Less,
                (None, Some(_)) => core::cmp::Ordering::Greater,
                (None, None) => core::cmp::Ordering::Equal,
            })
            .then_with(|| a.user_id.cmp(&b.user_id))
    });

    for (i, entry) in entries.iter_mut().enumerate() {
        entry.rank = i as i64 + 1;
    }

    entries
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::test::{at, day};
    use crate::engine::test::engine;

    fn activity(user: &str, earned: i64, first: Option<DateTime<Utc>>) -> DayActivity {
        DayActivity {
            earned,
            raw_points: earned,
            first_earned_at: first,
            ..DayActivity::empty(user.into(), day(2025, 6, 1))
        }
    }

    #[test]
    fn test_rank_order_and_tiebreaks() {
        let early = Some(at(2025, 6, 1, 11, 0));
        let late = Some(at(2025, 6, 1, 15, 0));

        let entries = rank_entries(
            vec![
                activity("carol", 40, late),
                activity("bob", 40, early),
                activity("alice", 40, late),
                activity("dave", 90, late),
                activity("idle", 0, None),
            ],
            vec![TicketEntry {
                user_id: "erin".into(),
                day_id: day(2025, 6, 1),
                count: 1,
            }],
        );

        let order = entries
            .iter()
            .map(|e| (e.rank, e.user_id.0.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            order,
            vec![(1, "dave"), (2, "bob"), (3, "alice"), (4, "carol"), (5, "erin")]
        );
    }

    #[test]
    fn test_tickets_heal_from_activity() {
        let mut a = activity("alice", 60, Some(at(2025, 6, 1, 11, 0)));
        a.tickets_granted = 3;

        let entries = rank_entries(
            vec![a],
            vec![TicketEntry {
                user_id: "alice".into(),
                day_id: day(2025, 6, 1),
                count: 2,
            }],
        );
        assert_eq!(entries[0].tickets, 3);
    }

    #[tokio::test]
    async fn test_snapshot_is_frozen() {
        let (engine, _) = engine();
        let d = day(2025, 6, 1);
        let user = UserId::from("u1");

        engine
            .ledger
            .record_activity(&user, ActivityKind::Quiz, at(2025, 6, 1, 12, 0))
            .await
            .unwrap();

        let first = engine.leaderboard.snapshot(d, at(2025, 6, 2, 10, 0)).await.unwrap();
        assert_eq!(first.entries.len(), 1);
        assert_eq!(first.tickets_of(&user), 1);

        // late tickets after capture do not move the frozen weights
        engine.draws.accrue_ticket(&user, d, 4).await.unwrap();
        let again = engine.leaderboard.snapshot(d, at(2025, 6, 2, 11, 0)).await.unwrap();
        assert_eq!(again, first);
        assert_eq!(engine.leaderboard.get(d).await.unwrap(), Some(first));
    }
}
