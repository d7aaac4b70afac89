//! In-process [`Store`] used for local development and the test suites.
//!
//! All tables sit behind one async mutex, so every trait call is trivially atomic. Nothing here
//! survives a restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::instrument;

use crate::clock::DayId;
use crate::db::prelude::*;

#[derive(Debug, Default)]
struct Tables {
    days: BTreeMap<DayId, DayRecord>,
    states: HashMap<(UserId, DayId), DailyState>,
    accounts: HashMap<UserId, PointsAccount>,
    activity: HashMap<(UserId, DayId), DayActivity>,
    ledger: Vec<LedgerEvent>,
    tickets: HashMap<(UserId, DayId), i64>,
    draws: BTreeMap<DayId, Draw>,
    snapshots: BTreeMap<DayId, LeaderboardSnapshot>,
    rollovers: BTreeMap<DayId, RolloverJob>,
}

#[derive(Debug)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates an outage: while unavailable every call fails with a transient error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(String::from("memory store offline")))
        }
    }
}

fn insert_once<K: Ord + Clone, V: Clone>(map: &mut BTreeMap<K, V>, key: K, value: &V) -> Inserted<V> {
    match map.get(&key) {
        Some(existing) => Inserted::Existing(existing.clone()),
        None => {
            map.insert(key, value.clone());
            Inserted::Created(value.clone())
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_day(&self, day: DayId) -> StoreResult<Option<DayRecord>> {
        self.check()?;
        Ok(self.tables.lock().await.days.get(&day).cloned())
    }

    #[instrument(skip(self, record), fields(day = %record.day_id))]
    async fn insert_day(&self, record: &DayRecord) -> StoreResult<Inserted<DayRecord>> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        Ok(insert_once(&mut tables.days, record.day_id, record))
    }

    async fn get_daily_state(&self, user: &UserId, day: DayId) -> StoreResult<Option<DailyState>> {
        self.check()?;
        let tables = self.tables.lock().await;
        Ok(tables.states.get(&(user.clone(), day)).cloned())
    }

    #[instrument(skip(self, state), fields(user = %state.user_id, day = %state.day_id))]
    async fn insert_daily_state(&self, state: &DailyState) -> StoreResult<Inserted<DailyState>> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        let key = (state.user_id.clone(), state.day_id);

        Ok(match tables.states.get(&key) {
            Some(existing) => Inserted::Existing(existing.clone()),
            None => {
                tables.states.insert(key, state.clone());
                Inserted::Created(state.clone())
            }
        })
    }

    async fn mark_engaged(&self, user: &UserId, day: DayId) -> StoreResult<bool> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        match tables.states.get_mut(&(user.clone(), day)) {
            Some(state) if !state.engaged => {
                state.engaged = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_account(&self, user: &UserId) -> StoreResult<Option<PointsAccount>> {
        self.check()?;
        Ok(self.tables.lock().await.accounts.get(user).cloned())
    }

    async fn get_activity(&self, user: &UserId, day: DayId) -> StoreResult<Option<DayActivity>> {
        self.check()?;
        let tables = self.tables.lock().await;
        Ok(tables.activity.get(&(user.clone(), day)).cloned())
    }

    async fn list_activity(&self, day: DayId) -> StoreResult<Vec<DayActivity>> {
        self.check()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .activity
            .values()
            .filter(|a| a.day_id == day)
            .cloned()
            .collect())
    }

    #[instrument(skip(self, update), fields(user = %update.account.user_id))]
    async fn commit_ledger(&self, update: &LedgerUpdate) -> StoreResult<bool> {
        self.check()?;
        let mut tables = self.tables.lock().await;

        let stored_account = tables
            .accounts
            .get(&update.account.user_id)
            .map(|a| a.version)
            .unwrap_or(0);
        if stored_account + 1 != update.account.version {
            return Ok(false);
        }

        if let Some(activity) = &update.activity {
            let key = (activity.user_id.clone(), activity.day_id);
            let stored_activity = tables.activity.get(&key).map(|a| a.version).unwrap_or(0);
            if stored_activity + 1 != activity.version {
                return Ok(false);
            }
            tables.activity.insert(key, activity.clone());
        }

        tables
            .accounts
            .insert(update.account.user_id.clone(), update.account.clone());
        tables.ledger.extend(update.events.iter().cloned());

        Ok(true)
    }

    async fn list_ledger_events(&self, user: &UserId) -> StoreResult<Vec<LedgerEvent>> {
        self.check()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .ledger
            .iter()
            .filter(|e| &e.user_id == user)
            .cloned()
            .collect())
    }

    async fn add_tickets(&self, user: &UserId, day: DayId, count: i64) -> StoreResult<i64> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        let total = tables.tickets.entry((user.clone(), day)).or_insert(0);
        *total += count;
        Ok(*total)
    }

    async fn get_tickets(&self, user: &UserId, day: DayId) -> StoreResult<i64> {
        self.check()?;
        let tables = self.tables.lock().await;
        Ok(tables.tickets.get(&(user.clone(), day)).copied().unwrap_or(0))
    }

    async fn list_tickets(&self, day: DayId) -> StoreResult<Vec<TicketEntry>> {
        self.check()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .tickets
            .iter()
            .filter(|((_, d), _)| *d == day)
            .map(|((user_id, day_id), count)| TicketEntry {
                user_id: user_id.clone(),
                day_id: *day_id,
                count: *count,
            })
            .collect())
    }

    async fn get_draw(&self, day: DayId) -> StoreResult<Option<Draw>> {
        self.check()?;
        Ok(self.tables.lock().await.draws.get(&day).cloned())
    }

    #[instrument(skip(self, draw), fields(day = %draw.day_id))]
    async fn insert_draw(&self, draw: &Draw) -> StoreResult<Inserted<Draw>> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        Ok(insert_once(&mut tables.draws, draw.day_id, draw))
    }

    #[instrument(skip(self, next), fields(day = %next.day_id, to = %next.status))]
    async fn cas_draw(&self, expected: DrawStatus, next: &Draw) -> StoreResult<bool> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        match tables.draws.get_mut(&next.day_id) {
            Some(stored) if stored.status == expected => {
                *stored = next.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_snapshot(&self, day: DayId) -> StoreResult<Option<LeaderboardSnapshot>> {
        self.check()?;
        Ok(self.tables.lock().await.snapshots.get(&day).cloned())
    }

    async fn insert_snapshot(
        &self,
        snapshot: &LeaderboardSnapshot,
    ) -> StoreResult<Inserted<LeaderboardSnapshot>> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        Ok(insert_once(&mut tables.snapshots, snapshot.day_id, snapshot))
    }

    async fn get_rollover(&self, day: DayId) -> StoreResult<Option<RolloverJob>> {
        self.check()?;
        Ok(self.tables.lock().await.rollovers.get(&day).cloned())
    }

    async fn mark_opened(&self, day: DayId, at: DateTime<Utc>) -> StoreResult<bool> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        let job = tables.rollovers.entry(day).or_insert_with(|| RolloverJob {
            day_id: day,
            opened_at: None,
            closed_at: None,
        });

        if job.opened_at.is_some() {
            return Ok(false);
        }
        job.opened_at = Some(at);
        Ok(true)
    }

    async fn mark_closed(&self, day: DayId, at: DateTime<Utc>) -> StoreResult<bool> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        let job = tables.rollovers.entry(day).or_insert_with(|| RolloverJob {
            day_id: day,
            opened_at: None,
            closed_at: None,
        });

        if job.closed_at.is_some() {
            return Ok(false);
        }
        job.closed_at = Some(at);
        Ok(true)
    }

    async fn latest_closed_day(&self) -> StoreResult<Option<DayId>> {
        self.check()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .rollovers
            .values()
            .rev()
            .find(|job| job.closed_at.is_some())
            .map(|job| job.day_id))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::test::{at, day};

    #[tokio::test]
    async fn test_commit_ledger_rejects_stale_versions() {
        let store = MemoryStore::new();
        let user = UserId::from("u-1");
        let now = at(2025, 5, 1, 12, 0);

        let mut account = PointsAccount::empty(user.clone(), now);
        account.version = 1;
        account.static_points = 5;
        let update = LedgerUpdate {
            account: account.clone(),
            activity: None,
            events: Vec::new(),
        };

        assert!(store.commit_ledger(&update).await.unwrap());
        // same version again is stale now
        assert!(!store.commit_ledger(&update).await.unwrap());

        let stored = store.get_account(&user).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.static_points, 5);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_transiently() {
        let store = MemoryStore::new();
        store.set_available(false);

        let err = store.get_draw(day(2025, 5, 1)).await.unwrap_err();
        assert!(err.is_transient());

        store.set_available(true);
        assert!(store.get_draw(day(2025, 5, 1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rollover_marks_are_idempotent() {
        let store = MemoryStore::new();
        let d = day(2025, 5, 1);
        let now = at(2025, 5, 2, 10, 0);

        assert!(store.mark_opened(d, now).await.unwrap());
        assert!(!store.mark_opened(d, now).await.unwrap());
        assert_eq!(store.latest_closed_day().await.unwrap(), None);

        assert!(store.mark_closed(d, now).await.unwrap());
        assert!(!store.mark_closed(d, now).await.unwrap());
        assert!(store.mark_closed(d.next(), now).await.unwrap());
        assert_eq!(store.latest_closed_day().await.unwrap(), Some(d.next()));
    }
}
