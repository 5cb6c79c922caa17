//! [`ReversePool`]: manages workers that dial in rather than being
//! launched, health-checks them, and serves them via per-host-type
//! quotas (§4.4).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use md5::Md5;
use parking_lot::Mutex;
use rand::Rng;
use subtle::ConstantTimeEq;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use buildsched_error::{Result, SchedError};

use crate::item::SchedItem;
use crate::pool::Pool;
use crate::provider::WorkerClient;
use crate::quota::{QuotaQueue, QuotaStats};

/// Lowest `revdial`-style protocol version this controller still accepts
/// (§4.4 registration).
pub const MIN_PROTOCOL_VERSION: u32 = 23;

const HEALTH_CHECK_MIN_INTERVAL: Duration = Duration::from_secs(10);
const HEALTH_CHECK_MAX_JITTER_MILLIS: u64 = 5_000;
const HEALTH_CHECK_DEADLINE: Duration = Duration::from_secs(20);
const ACQUIRE_RETRY_BUDGET: Duration = Duration::from_secs(10);

/// Compute the builder-key registration token for `host_type` (§4.4,
/// §6): `HMAC-MD5(master_key, host_type)`, hex-encoded.
///
/// MD5 here is a protocol-compatibility constant, not a security design
/// choice this crate gets to revisit.
#[must_use]
pub fn builder_key_token(master_key: &[u8], host_type: &str) -> String {
    let mut mac = Hmac::<Md5>::new_from_slice(master_key).expect("HMAC accepts any key length");
    mac.update(host_type.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a registration token in constant time.
#[must_use]
pub fn verify_builder_key(master_key: &[u8], host_type: &str, presented_token: &str) -> bool {
    let expected = builder_key_token(master_key, host_type);
    let expected_bytes = expected.as_bytes();
    let presented_bytes = presented_token.as_bytes();
    expected_bytes.len() == presented_bytes.len() && bool::from(expected_bytes.ct_eq(presented_bytes))
}

/// Headers presented by an inbound worker during registration (§4.4).
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    pub host_type: String,
    pub hostname: String,
    pub protocol_version: u32,
    pub builder_key_token: String,
}

/// A passively-connected worker (§3).
pub struct ReverseWorker {
    pub hostname: String,
    pub host_type: String,
    pub protocol_version: u32,
    pub reg_time: DateTime<Utc>,
    in_use: Mutex<bool>,
    in_use_time: Mutex<Option<DateTime<Utc>>>,
    in_health_check: Mutex<bool>,
    client: Box<dyn WorkerClient>,
}

impl ReverseWorker {
    /// `true` if currently handed out to a caller.
    #[must_use]
    pub fn is_in_use(&self) -> bool {
        *self.in_use.lock()
    }
}

struct HostTypeState {
    workers: Mutex<Vec<Arc<ReverseWorker>>>,
    queue: Arc<QuotaQueue>,
}

impl HostTypeState {
    fn new() -> Self {
        Self {
            workers: Mutex::new(Vec::new()),
            queue: Arc::new(QuotaQueue::new(0)),
        }
    }

    /// Refresh `limit`/`used` from the live worker list (§4.4: "refreshed
    /// after every registration, removal, grab, and release").
    fn refresh_quota(&self) {
        let workers = self.workers.lock();
        let limit = workers.len() as u64;
        let used = workers.iter().filter(|w| w.is_in_use()).count() as u64;
        self.queue.update_limit(limit);
        self.queue.update_used(used);
    }
}

/// Keyed by both `hostname` and `host_type:hostname`, since hostnames are
/// not globally unique (§4.4 health-check loop).
type LastGoodMap = Arc<DashMap<String, DateTime<Utc>>>;

/// Manages reverse-connected workers (§4.4).
pub struct ReversePool {
    master_key: Vec<u8>,
    host_types: DashMap<String, Arc<HostTypeState>>,
    last_good: LastGoodMap,
    shutdown: CancellationToken,
    health_check_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ReversePool {
    /// Construct an empty pool. `master_key` authenticates the builder-key
    /// header on registration.
    #[must_use]
    pub fn new(master_key: impl Into<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            master_key: master_key.into(),
            host_types: DashMap::new(),
            last_good: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
            health_check_tasks: Mutex::new(HashMap::new()),
        })
    }

    fn state_for(&self, host_type: &str) -> Arc<HostTypeState> {
        self.host_types
            .entry(host_type.to_string())
            .or_insert_with(|| Arc::new(HostTypeState::new()))
            .clone()
    }

    /// Validate and admit an inbound worker (§4.4 registration).
    pub fn register(self: &Arc<Self>, request: RegistrationRequest, client: Box<dyn WorkerClient>) -> Result<()> {
        if request.host_type.is_empty() || request.hostname.is_empty() {
            return Err(SchedError::internal("registration missing required header"));
        }
        if !verify_builder_key(&self.master_key, &request.host_type, &request.builder_key_token) {
            return Err(SchedError::internal("builder key token mismatch"));
        }
        if request.protocol_version < MIN_PROTOCOL_VERSION {
            return Err(SchedError::internal(format!(
                "protocol version {} older than minimum {MIN_PROTOCOL_VERSION}",
                request.protocol_version
            )));
        }

        let worker = Arc::new(ReverseWorker {
            hostname: request.hostname.clone(),
            host_type: request.host_type.clone(),
            protocol_version: request.protocol_version,
            reg_time: Utc::now(),
            in_use: Mutex::new(false),
            in_use_time: Mutex::new(None),
            in_health_check: Mutex::new(false),
            client,
        });

        let state = self.state_for(&request.host_type);
        state.workers.lock().push(worker.clone());
        state.refresh_quota();

        self.spawn_health_check(request.host_type.clone(), worker);
        Ok(())
    }

    /// Remove `worker` from its host-type's pool; always refreshes quota
    /// (§4.4: "Removal always triggers a queue-limit refresh").
    fn remove_worker(&self, host_type: &str, hostname: &str) {
        if let Some(state) = self.host_types.get(host_type) {
            state.workers.lock().retain(|w| w.hostname != hostname);
            state.refresh_quota();
        }
    }

    fn spawn_health_check(self: &Arc<Self>, host_type: String, worker: Arc<ReverseWorker>) {
        let pool = self.clone();
        let task = tokio::spawn(async move {
            loop {
                let jitter = rand::rng().random_range(0..HEALTH_CHECK_MAX_JITTER_MILLIS);
                let delay = HEALTH_CHECK_MIN_INTERVAL + Duration::from_millis(jitter);
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = pool.shutdown.cancelled() => return,
                }

                if worker.is_in_use() {
                    continue;
                }
                *worker.in_health_check.lock() = true;
                let outcome = tokio::time::timeout(HEALTH_CHECK_DEADLINE, worker.client.status()).await;
                *worker.in_health_check.lock() = false;

                match outcome {
                    Ok(Ok(())) => {
                        let now = Utc::now();
                        pool.last_good.insert(worker.hostname.clone(), now);
                        pool.last_good.insert(format!("{host_type}:{}", worker.hostname), now);
                    }
                    _ => {
                        let _ = worker.client.close().await;
                        pool.remove_worker(&host_type, &worker.hostname);
                        return;
                    }
                }
            }
        });
        self.health_check_tasks.lock().insert(worker.hostname.clone(), task);
    }

    /// Last known-healthy timestamp for `hostname` (not host-type
    /// qualified).
    #[must_use]
    pub fn last_good(&self, hostname: &str) -> Option<DateTime<Utc>> {
        self.last_good.get(hostname).map(|entry| *entry)
    }
}

#[async_trait]
impl Pool for ReversePool {
    async fn acquire(
        &self,
        host_type: &str,
        item: &SchedItem,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn WorkerClient>> {
        let state = self.state_for(host_type);

        loop {
            let handle = state.queue.enqueue(item, 1);
            state.queue.wait(handle, cancel).await?;

            let idle = {
                let workers = state.workers.lock();
                workers.iter().find(|w| !w.is_in_use()).cloned()
            };

            let Some(worker) = idle else {
                // Race with removal/health-check: the grant doesn't
                // correspond to a worker anymore. Release it before
                // retrying so the arena slot doesn't stay Granted forever.
                state.queue.release(handle);
                tokio::select! {
                    () = tokio::time::sleep(ACQUIRE_RETRY_BUDGET) => continue,
                    () = cancel.cancelled() => return Err(SchedError::cancelled()),
                }
            };

            *worker.in_use.lock() = true;
            *worker.in_use_time.lock() = Some(Utc::now());
            state.refresh_quota();

            if let Err(err) = worker.client.remove_all(".").await {
                tracing::warn!(hostname = %worker.hostname, error = %err, "cleanup before handing out reverse worker failed");
            }

            return Ok(Box::new(HandedOutClient {
                pool_state: state,
                worker,
            }));
        }
    }

    fn close_idle(&self) {
        self.shutdown.cancel();
        for (_, task) in self.health_check_tasks.lock().drain() {
            task.abort();
        }
    }

    fn quota_stats(&self) -> HashMap<String, QuotaStats> {
        self.host_types
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().queue.stats()))
            .collect()
    }

    fn html_status(&self) -> String {
        let mut out = String::from("<p>reverse pool:</p><ul>");
        for entry in &self.host_types {
            let stats = entry.value().queue.stats();
            out.push_str(&format!(
                "<li>{}: {}/{} in use</li>",
                entry.key(),
                stats.used,
                stats.limit
            ));
        }
        out.push_str("</ul>");
        out
    }
}

/// Wraps the underlying [`WorkerClient`] so releasing it back marks the
/// worker idle and refreshes quota, instead of requiring callers to
/// remember to do so.
struct HandedOutClient {
    pool_state: Arc<HostTypeState>,
    worker: Arc<ReverseWorker>,
}

#[async_trait]
impl WorkerClient for HandedOutClient {
    async fn status(&self) -> Result<()> {
        self.worker.client.status().await
    }

    async fn remove_all(&self, path: &str) -> Result<()> {
        self.worker.client.remove_all(path).await
    }

    async fn close(&self) -> Result<()> {
        let result = self.worker.client.close().await;
        *self.worker.in_use.lock() = false;
        *self.worker.in_use_time.lock() = None;
        self.pool_state.refresh_quota();
        result
    }

    fn set_description(&self, description: &str) {
        self.worker.client.set_description(description);
    }

    fn set_instance_name(&self, name: &str) {
        self.worker.client.set_instance_name(name);
    }

    fn set_on_heartbeat_failure(&self, callback: Box<dyn Fn() + Send + Sync>) {
        self.worker.client.set_on_heartbeat_failure(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_key_round_trips() {
        let token = builder_key_token(b"s3cr3t", "linux-amd64");
        assert!(verify_builder_key(b"s3cr3t", "linux-amd64", &token));
        assert!(!verify_builder_key(b"s3cr3t", "linux-arm64", &token));
        assert!(!verify_builder_key(b"wrong", "linux-amd64", &token));
    }

    #[test]
    fn protocol_version_floor_is_23() {
        assert_eq!(MIN_PROTOCOL_VERSION, 23);
    }
}
