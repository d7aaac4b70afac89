//! Write-once redis cache for closed days' leaderboard snapshots.
//!
//! Postgres (or whichever [`Store`](crate::db::Store) is configured) stays the source of truth; a
//! snapshot never changes once captured, so entries are written with `SET NX` and never expire.

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::instrument;

use crate::clock::DayId;
use crate::db::prelude::*;

#[derive(Debug, Clone, Copy)]
pub enum RedisKey {
    /// Serialized snapshot JSON
    Snapshot(DayId),
    /// Sorted set of user ids scored by the day's dynamic points
    Ranking(DayId),
}

impl core::fmt::Display for RedisKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RedisKey::Snapshot(day) => write!(f, "leaderboard:{day}:snapshot"),
            RedisKey::Ranking(day) => write!(f, "leaderboard:{day}:ranking"),
        }
    }
}

#[derive(Clone)]
pub struct SnapshotCache {
    manager: ConnectionManager,
}

impl core::fmt::Debug for SnapshotCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SnapshotCache").finish_non_exhaustive()
    }
}

impl SnapshotCache {
    #[instrument(skip(redis_url))]
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        tracing::debug!("connecting to redis server");
        let client = Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;

        Ok(Self { manager })
    }

    #[instrument(skip(self))]
    pub async fn get(&self, day: DayId) -> StoreResult<Option<LeaderboardSnapshot>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.get(RedisKey::Snapshot(day).to_string()).await?;

        Ok(match raw {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        })
    }

    #[instrument(skip(self, snapshot), fields(day = %snapshot.day_id))]
    pub async fn put(&self, snapshot: &LeaderboardSnapshot) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let json = serde_json::to_string(snapshot)?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.set_nx(RedisKey::Snapshot(snapshot.day_id).to_string(), json);

        let ranking = RedisKey::Ranking(snapshot.day_id).to_string();
        for entry in &snapshot.entries {
            pipe.zadd(&ranking, entry.user_id.0.as_str(), entry.dynamic_points);
        }

        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::test::day;

    #[test]
    fn test_redis_key_format() {
        let d = day(2025, 7, 4);
        assert_eq!(
            RedisKey::Snapshot(d).to_string(),
            "leaderboard:2025-07-04:snapshot"
        );
        assert_eq!(
            RedisKey::Ranking(d).to_string(),
            "leaderboard:2025-07-04:ranking"
        );
    }
}
