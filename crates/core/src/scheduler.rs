//! [`Scheduler`]: the public entry point (§4.5). Stateless with respect to
//! capacity — all arbitration lives in the pools it delegates to; its own
//! storage is the observability map of in-flight waiters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use buildsched_config::HostConfigTable;
use buildsched_error::{Result, SchedError};

use crate::item::{MonotonicClock, RequestClass, SchedItem};
use crate::pool::PoolSelector;
use crate::provider::WorkerClient;

type WaiterId = u64;

struct WaiterRecord {
    item: SchedItem,
}

struct HostTypeWaiters {
    waiters: DashMap<WaiterId, WaiterRecord>,
    last_grant: std::sync::Mutex<Option<chrono::DateTime<Utc>>>,
}

impl HostTypeWaiters {
    fn new() -> Self {
        Self {
            waiters: DashMap::new(),
            last_grant: std::sync::Mutex::new(None),
        }
    }
}

/// How many waiters ahead of a candidate item are more important (§4.5
/// `WaiterState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaiterState {
    /// Count of currently-waiting items that `precede` the candidate.
    pub ahead: usize,
}

/// Per-host-type aggregate for [`Scheduler::state`].
#[derive(Debug, Clone)]
pub struct HostTypeSnapshot {
    pub host_type: String,
    pub by_class: HashMap<RequestClass, usize>,
    pub oldest_waiter_age: Option<Duration>,
    pub newest_waiter_age: Option<Duration>,
    pub time_since_last_grant: Option<Duration>,
}

/// Whole-scheduler snapshot.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub host_types: Vec<HostTypeSnapshot>,
}

/// Public entry point for buildlet requests (§4.5).
pub struct Scheduler {
    hosts: Arc<HostConfigTable>,
    selector: Arc<PoolSelector>,
    clock: MonotonicClock,
    next_waiter_id: AtomicU64,
    by_host_type: DashMap<String, Arc<HostTypeWaiters>>,
}

impl Scheduler {
    #[must_use]
    pub fn new(hosts: Arc<HostConfigTable>, selector: Arc<PoolSelector>) -> Self {
        Self {
            hosts,
            selector,
            clock: MonotonicClock::new(),
            next_waiter_id: AtomicU64::new(0),
            by_host_type: DashMap::new(),
        }
    }

    fn bucket(&self, host_type: &str) -> Arc<HostTypeWaiters> {
        self.by_host_type
            .entry(host_type.to_string())
            .or_insert_with(|| Arc::new(HostTypeWaiters::new()))
            .clone()
    }

    /// Stamp `item`'s `request_time`, validate its host type, record it for
    /// observability, and delegate to the right pool (§4.5).
    pub async fn acquire(
        &self,
        mut item: SchedItem,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn WorkerClient>> {
        item.request_time = Some(self.clock.next());

        let host_config = self
            .hosts
            .get(&item.host_type)
            .ok_or_else(|| SchedError::unknown_host_type(item.host_type.clone()))?
            .clone();

        let bucket = self.bucket(&item.host_type);
        let waiter_id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        bucket.waiters.insert(waiter_id, WaiterRecord { item: item.clone() });

        let pool = self.selector.select(&host_config);
        let result = pool.acquire(&item.host_type, &item, cancel).await;

        bucket.waiters.remove(&waiter_id);
        if result.is_ok() {
            *bucket.last_grant.lock().unwrap() = Some(Utc::now());
        }
        result
    }

    /// Count currently-waiting items in `item`'s host-type bucket that
    /// `precede` it (§4.5 `WaiterState`).
    #[must_use]
    pub fn waiter_state(&self, item: &SchedItem) -> WaiterState {
        let Some(bucket) = self.by_host_type.get(&item.host_type) else {
            return WaiterState { ahead: 0 };
        };
        let ahead = bucket
            .waiters
            .iter()
            .filter(|entry| entry.value().item.precedes(item))
            .count();
        WaiterState { ahead }
    }

    /// Aggregate snapshot across every host type with waiters (§4.5
    /// `State`).
    #[must_use]
    pub fn state(&self) -> Snapshot {
        let now = Utc::now();
        let mut host_types = Vec::new();
        for entry in &self.by_host_type {
            let bucket = entry.value();
            if bucket.waiters.is_empty() {
                continue;
            }
            let mut by_class: HashMap<RequestClass, usize> = HashMap::new();
            let mut oldest = None;
            let mut newest = None;
            for waiter in bucket.waiters.iter() {
                let item = &waiter.value().item;
                *by_class.entry(item.class).or_insert(0) += 1;
                if let Some(request_time) = item.request_time {
                    let age = (now - request_time).to_std().unwrap_or(Duration::ZERO);
                    oldest = Some(oldest.map_or(age, |o: Duration| o.max(age)));
                    newest = Some(newest.map_or(age, |n: Duration| n.min(age)));
                }
            }
            let time_since_last_grant = bucket
                .last_grant
                .lock()
                .unwrap()
                .and_then(|t| (now - t).to_std().ok());

            host_types.push(HostTypeSnapshot {
                host_type: entry.key().clone(),
                by_class,
                oldest_waiter_age: oldest,
                newest_waiter_age: newest,
                time_since_last_grant,
            });
        }
        Snapshot { host_types }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ReversePool;
    use buildsched_config::{HostConfig, PoolKind};
    use std::collections::HashMap as StdHashMap;

    fn table_with_reverse(host_type: &str) -> Arc<HostConfigTable> {
        let mut entries = StdHashMap::new();
        entries.insert(
            host_type.to_string(),
            HostConfig {
                machine_type: String::new(),
                kind: PoolKind::Reverse,
                root_disk_size_gb: 0,
                expected_count: 0,
                ssh_username: None,
                container_image: None,
                container_on_host: false,
            },
        );
        Arc::new(HostConfigTable::new(entries).unwrap())
    }

    #[test]
    fn fresh_scheduler_has_no_waiters() {
        let hosts = table_with_reverse("linux-amd64");
        let reverse = ReversePool::new(b"k".to_vec());
        let selector = Arc::new(PoolSelector::new(
            reverse.clone() as Arc<dyn crate::pool::Pool>,
            reverse.clone() as Arc<dyn crate::pool::Pool>,
            reverse.clone() as Arc<dyn crate::pool::Pool>,
            reverse as Arc<dyn crate::pool::Pool>,
        ));
        let scheduler = Scheduler::new(hosts, selector);
        assert!(scheduler.by_host_type.is_empty());
    }

    #[test]
    fn waiter_state_is_zero_for_unknown_host_type() {
        let hosts = table_with_reverse("linux-amd64");
        let reverse = ReversePool::new(b"k".to_vec());
        let selector = Arc::new(PoolSelector::new(
            reverse.clone() as Arc<dyn crate::pool::Pool>,
            reverse.clone() as Arc<dyn crate::pool::Pool>,
            reverse.clone() as Arc<dyn crate::pool::Pool>,
            reverse as Arc<dyn crate::pool::Pool>,
        ));
        let scheduler = Scheduler::new(hosts, selector);
        let item = SchedItem::new("darwin-arm64", RequestClass::Batch, "main");
        assert_eq!(scheduler.waiter_state(&item), WaiterState { ahead: 0 });
    }
}
