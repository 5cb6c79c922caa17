//! [`CloudPool`]: provisions workers by creating cloud VMs, subject to
//! per-family CPU and instance-count quota, and runs the two
//! reconciliation loops that keep that quota honest (§4.3).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use buildsched_config::HostConfigTable;
use buildsched_error::{Result, SchedError, QUOTA_EXCEEDED_RETRY_DELAY};

use crate::item::SchedItem;
use crate::ledger::Ledger;
use crate::pool::Pool;
use crate::provider::{ProvisionCallbacks, StartOpts, VmProvisioner, WorkerClient};
use crate::quota::{QuotaQueue, QuotaStats};

/// Instance-name prefix that marks a VM as owned by this controller (§6).
pub const BUILDLET_PREFIX: &str = "buildlet-";

const QUOTA_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const REAPER_INTERVAL: Duration = Duration::from_secs(60);
const STRAY_AGE_WITHOUT_DELETE_AT: chrono::Duration = chrono::Duration::hours(3);
const RECENTLY_DELETED_CAPACITY: usize = 64;

/// CPU families the cloud pool tracks as independent quota dimensions
/// (§4.3 "Family routing").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuFamily {
    General,
    C2,
    N2,
    N2D,
    T2A,
}

impl CpuFamily {
    /// Dimension name used in `QuotaStats` snapshots and provider lookups.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::General => "CPUs",
            Self::C2 => "C2_CPUs",
            Self::N2 => "N2_CPUs",
            Self::N2D => "N2D_CPUs",
            Self::T2A => "T2A_CPUs",
        }
    }

    /// All families, in a stable order.
    #[must_use]
    pub fn all() -> [Self; 5] {
        [Self::General, Self::C2, Self::N2, Self::N2D, Self::T2A]
    }
}

/// Map a machine-type string to the family whose quota it consumes (§4.3).
#[must_use]
pub fn family_for_machine_type(machine_type: &str) -> CpuFamily {
    if machine_type.starts_with("n2d-") {
        CpuFamily::N2D
    } else if machine_type.starts_with("n2-") {
        CpuFamily::N2
    } else if machine_type.starts_with("c2-") {
        CpuFamily::C2
    } else if machine_type.starts_with("t2a-") {
        CpuFamily::T2A
    } else {
        CpuFamily::General
    }
}

/// Parse the vCPU count from a machine-type string's trailing numeric
/// component; shared-core variants are always 2 regardless of the number
/// in their name (§4.3).
#[must_use]
pub fn vcpu_count(machine_type: &str) -> u64 {
    if machine_type.ends_with("-micro") || machine_type.ends_with("-small") || machine_type.ends_with("-medium") {
        return 2;
    }
    machine_type
        .rsplit('-')
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(1)
}

/// Predicate identifying remote-interactive instances, which the stray
/// reaper must never delete regardless of age (§4.3).
pub type RemoteInteractivePredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

struct StartCallbacks {
    ledger: Arc<Ledger>,
    name: String,
    created: Arc<AtomicBool>,
}

impl ProvisionCallbacks for StartCallbacks {
    fn on_requested(&self) {
        tracing::debug!(name = %self.name, "vm requested");
    }

    fn on_created(&self) {
        self.created.store(true, Ordering::Release);
        tracing::debug!(name = %self.name, "vm created");
    }

    fn on_info(&self, instance: &crate::provider::Instance) {
        self.ledger.assign_id(&self.name, instance.id.clone());
    }
}

/// Provisions workers from a cloud VM API under quota (§4.3).
pub struct CloudPool {
    enabled: AtomicBool,
    hosts: Arc<HostConfigTable>,
    provisioner: Arc<dyn VmProvisioner>,
    ledger: Arc<Ledger>,
    instance_queue: Arc<QuotaQueue>,
    family_queues: HashMap<CpuFamily, Arc<QuotaQueue>>,
    recently_deleted: Mutex<VecDeque<String>>,
    is_remote_interactive: RemoteInteractivePredicate,
    quota_retry_delay: Duration,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CloudPool {
    /// Construct a pool and start its reconciliation loops immediately.
    /// Callers must eventually call [`CloudPool::close_idle`] (or drop
    /// every clone) to stop them (§9 "Reconciliation loops").
    ///
    /// Retries a provider-reported `QuotaExceeded` after the fixed
    /// [`QUOTA_EXCEEDED_RETRY_DELAY`] (§9's open question: the delay stays
    /// at its historical default, but callers who need a different one
    /// can use [`CloudPool::with_quota_retry_delay`]).
    #[must_use]
    pub fn new(
        hosts: Arc<HostConfigTable>,
        provisioner: Arc<dyn VmProvisioner>,
        instance_limit: u64,
    ) -> Arc<Self> {
        Self::with_quota_retry_delay(
            hosts,
            provisioner,
            instance_limit,
            Arc::new(|_| false),
            QUOTA_EXCEEDED_RETRY_DELAY,
        )
    }

    /// As [`CloudPool::new`], with an explicit remote-interactive
    /// predicate instead of the always-false default.
    #[must_use]
    pub fn with_remote_interactive_predicate(
        hosts: Arc<HostConfigTable>,
        provisioner: Arc<dyn VmProvisioner>,
        instance_limit: u64,
        is_remote_interactive: RemoteInteractivePredicate,
    ) -> Arc<Self> {
        Self::with_quota_retry_delay(
            hosts,
            provisioner,
            instance_limit,
            is_remote_interactive,
            QUOTA_EXCEEDED_RETRY_DELAY,
        )
    }

    /// As [`CloudPool::new`], with an explicit `QuotaExceeded` retry delay
    /// instead of the historical 10 s default.
    #[must_use]
    pub fn with_quota_retry_delay(
        hosts: Arc<HostConfigTable>,
        provisioner: Arc<dyn VmProvisioner>,
        instance_limit: u64,
        is_remote_interactive: RemoteInteractivePredicate,
        quota_retry_delay: Duration,
    ) -> Arc<Self> {
        let instance_queue = Arc::new(QuotaQueue::new(instance_limit));
        let family_queues: HashMap<CpuFamily, Arc<QuotaQueue>> = CpuFamily::all()
            .into_iter()
            .map(|family| (family, Arc::new(QuotaQueue::new(0))))
            .collect();

        let general_queue = family_queues[&CpuFamily::General].clone();
        let families_for_router = family_queues.clone();
        let cpu_dimension_for: crate::ledger::CpuDimensionFn = Arc::new(move |machine_type: &str| {
            let family = family_for_machine_type(machine_type);
            (families_for_router[&family].clone(), vcpu_count(machine_type))
        });
        let ledger = Arc::new(Ledger::new(instance_queue.clone(), general_queue, cpu_dimension_for));

        let pool = Arc::new(Self {
            enabled: AtomicBool::new(true),
            hosts,
            provisioner,
            ledger,
            instance_queue,
            family_queues,
            recently_deleted: Mutex::new(VecDeque::new()),
            is_remote_interactive,
            quota_retry_delay,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(Self::run_quota_refresh(pool.clone())));
        tasks.push(tokio::spawn(Self::run_stray_reaper(pool.clone())));
        *pool.tasks.lock() = tasks;
        pool
    }

    /// Disable this pool: subsequent `acquire` calls fail fast with
    /// `PoolDisabled` instead of provisioning anything.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    async fn cleanup(&self, name: &str) {
        if let Some(id) = self.ledger.lookup_id(name) {
            if let Err(err) = self.provisioner.destroy_instances(&[id]).await {
                tracing::warn!(name, error = %err, "failed to destroy instance during cleanup");
            }
        }
        self.ledger.remove(name);
    }

    fn generate_instance_name(host_type: &str) -> String {
        const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        let mut rng = rand::rng();
        let suffix: String = (0..8)
            .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
            .collect();
        let sanitized_host_type: String = host_type
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        format!("{BUILDLET_PREFIX}{sanitized_host_type}-{suffix}")
    }

    async fn run_quota_refresh(self: Arc<Self>) {
        loop {
            tokio::select! {
                () = tokio::time::sleep(QUOTA_REFRESH_INTERVAL) => {}
                () = self.shutdown.cancelled() => return,
            }
            self.refresh_quota_once().await;
        }
    }

    async fn refresh_quota_once(&self) {
        for family in CpuFamily::all() {
            match self.provisioner.quota("compute", family.as_str()).await {
                Ok(limit) => self.family_queues[&family].update_limit(limit),
                Err(err) => tracing::warn!(family = family.as_str(), error = %err, "quota lookup failed"),
            }
        }

        let instances = match self.provisioner.running_instances().await {
            Ok(instances) => instances,
            Err(err) => {
                tracing::warn!(error = %err, "failed to list instances for quota reconciliation");
                return;
            }
        };

        let mut untracked: HashMap<CpuFamily, u64> = HashMap::new();
        for instance in &instances {
            if instance.name.starts_with(BUILDLET_PREFIX) && self.ledger.contains(&instance.name) {
                continue;
            }
            let family = family_for_machine_type(&instance.machine_type);
            *untracked.entry(family).or_default() += vcpu_count(&instance.machine_type);
        }
        for family in CpuFamily::all() {
            self.family_queues[&family].update_untracked_used(untracked.get(&family).copied().unwrap_or(0));
        }
    }

    async fn run_stray_reaper(self: Arc<Self>) {
        loop {
            tokio::select! {
                () = tokio::time::sleep(REAPER_INTERVAL) => {}
                () = self.shutdown.cancelled() => return,
            }
            self.reap_strays_once().await;
        }
    }

    async fn reap_strays_once(&self) {
        let instances = match self.provisioner.running_instances().await {
            Ok(instances) => instances,
            Err(err) => {
                tracing::warn!(error = %err, "failed to list instances for stray reaping");
                return;
            }
        };

        let now = Utc::now();
        let mut to_delete = Vec::new();
        for instance in &instances {
            if !instance.name.starts_with(BUILDLET_PREFIX) {
                continue;
            }
            if (self.is_remote_interactive)(&instance.name) {
                continue;
            }
            let tracked = self.ledger.contains(&instance.name);
            let reason = if instance.delete_at.is_some_and(|at| at < now) {
                "delete-at expiration"
            } else if instance.delete_at.is_none() && now - instance.created_at > STRAY_AGE_WITHOUT_DELETE_AT && !tracked {
                "no delete-at, created long ago"
            } else if instance.delete_at.is_some() && !tracked && !self.was_recently_deleted(&instance.name) {
                "from earlier coordinator generation"
            } else {
                ""
            };
            if !reason.is_empty() {
                tracing::info!(name = %instance.name, reason, "reaping stray instance");
                to_delete.push(instance.id.clone());
                self.mark_recently_deleted(&instance.name);
            }
        }

        if !to_delete.is_empty() {
            if let Err(err) = self.provisioner.destroy_instances(&to_delete).await {
                tracing::warn!(error = %err, "failed to destroy stray instances");
            }
        }
    }

    fn was_recently_deleted(&self, name: &str) -> bool {
        self.recently_deleted.lock().iter().any(|n| n == name)
    }

    fn mark_recently_deleted(&self, name: &str) {
        let mut recently_deleted = self.recently_deleted.lock();
        recently_deleted.push_back(name.to_string());
        while recently_deleted.len() > RECENTLY_DELETED_CAPACITY {
            recently_deleted.pop_front();
        }
    }
}

#[async_trait]
impl Pool for CloudPool {
    async fn acquire(
        &self,
        host_type: &str,
        item: &SchedItem,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn WorkerClient>> {
        if !self.enabled.load(Ordering::Acquire) {
            return Err(SchedError::pool_disabled(host_type));
        }
        let host_config = self
            .hosts
            .get(host_type)
            .ok_or_else(|| SchedError::unknown_host_type(host_type))?
            .clone();

        let name = Self::generate_instance_name(host_type);
        self.ledger
            .reserve(&name, &host_config.machine_type, cancel, item)
            .await?;

        loop {
            let created = Arc::new(AtomicBool::new(false));
            let callbacks = Arc::new(StartCallbacks {
                ledger: self.ledger.clone(),
                name: name.clone(),
                created: created.clone(),
            });
            let opts = StartOpts {
                delete_deadline: Utc::now() + chrono::Duration::hours(12),
                tls_cert_pem: Vec::new(),
                tls_key_pem: Vec::new(),
                zone_hint: None,
                metadata: HashMap::new(),
                callbacks,
            };

            match self
                .provisioner
                .start_vm(&name, host_type, &host_config.machine_type, opts)
                .await
            {
                Ok(client) => {
                    let ledger = self.ledger.clone();
                    let provisioner = self.provisioner.clone();
                    let cleanup_name = name.clone();
                    client.set_on_heartbeat_failure(Box::new(move || {
                        let ledger = ledger.clone();
                        let provisioner = provisioner.clone();
                        let name = cleanup_name.clone();
                        tokio::spawn(async move {
                            if let Some(id) = ledger.lookup_id(&name) {
                                let _ = provisioner.destroy_instances(&[id]).await;
                            }
                            ledger.remove(&name);
                        });
                    }));
                    return Ok(client);
                }
                Err(err) if err.is_retryable() => {
                    let delay = err.retry_after().unwrap_or(self.quota_retry_delay);
                    tokio::select! {
                        () = tokio::time::sleep(delay) => continue,
                        () = cancel.cancelled() => {
                            if created.load(Ordering::Acquire) {
                                self.cleanup(&name).await;
                            } else {
                                self.ledger.remove(&name);
                            }
                            return Err(SchedError::cancelled());
                        }
                    }
                }
                Err(err) => {
                    if created.load(Ordering::Acquire) {
                        self.cleanup(&name).await;
                    } else {
                        self.ledger.remove(&name);
                    }
                    return Err(err);
                }
            }
        }
    }

    fn close_idle(&self) {
        self.shutdown.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn quota_stats(&self) -> HashMap<String, QuotaStats> {
        let mut stats: HashMap<String, QuotaStats> = self
            .family_queues
            .iter()
            .map(|(family, queue)| (family.as_str().to_string(), queue.stats()))
            .collect();
        stats.insert("instances".to_string(), self.instance_queue.stats());
        stats
    }

    fn html_status(&self) -> String {
        let snapshot = self.ledger.snapshot();
        format!(
            "<p>cloud pool: {} instances, {}/{} cpus</p>",
            snapshot.instance_count, snapshot.cpu_used, snapshot.cpu_limit
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_routing_matches_machine_type_prefixes() {
        assert_eq!(family_for_machine_type("n2-standard-8"), CpuFamily::N2);
        assert_eq!(family_for_machine_type("n2d-standard-8"), CpuFamily::N2D);
        assert_eq!(family_for_machine_type("c2-standard-16"), CpuFamily::C2);
        assert_eq!(family_for_machine_type("t2a-standard-4"), CpuFamily::T2A);
        assert_eq!(family_for_machine_type("e2-medium"), CpuFamily::General);
    }

    #[test]
    fn vcpu_count_parses_trailing_number() {
        assert_eq!(vcpu_count("n2-standard-8"), 8);
        assert_eq!(vcpu_count("c2-standard-16"), 16);
    }

    #[test]
    fn shared_core_variants_always_cost_two() {
        assert_eq!(vcpu_count("e2-micro"), 2);
        assert_eq!(vcpu_count("e2-small"), 2);
        assert_eq!(vcpu_count("n1-standard-medium"), 2);
    }

    use crate::item::{RequestClass, SchedItem};
    use crate::provider::{Instance, RunningInstance, WorkerClient};
    use buildsched_config::{HostConfig, PoolKind};
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex as StdMutex;

    struct FakeClient;

    #[async_trait]
    impl WorkerClient for FakeClient {
        async fn status(&self) -> Result<()> {
            Ok(())
        }
        async fn remove_all(&self, _path: &str) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
        fn set_description(&self, _description: &str) {}
        fn set_instance_name(&self, _name: &str) {}
        fn set_on_heartbeat_failure(&self, _callback: Box<dyn Fn() + Send + Sync>) {}
    }

    #[derive(Default)]
    struct FakeProvisioner {
        running: StdMutex<Vec<RunningInstance>>,
        destroyed: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl VmProvisioner for FakeProvisioner {
        async fn start_vm(
            &self,
            name: &str,
            _host_type: &str,
            machine_type: &str,
            opts: StartOpts,
        ) -> Result<Box<dyn WorkerClient>> {
            opts.callbacks.on_requested();
            opts.callbacks.on_created();
            opts.callbacks.on_info(&Instance {
                id: format!("{name}-id"),
                name: name.to_string(),
                zone: "us-central1-a".to_string(),
                machine_type: machine_type.to_string(),
                created_at: Utc::now(),
            });
            Ok(Box::new(FakeClient))
        }

        async fn destroy_instances(&self, ids: &[String]) -> Result<()> {
            self.destroyed.lock().unwrap().extend(ids.iter().cloned());
            Ok(())
        }

        async fn running_instances(&self) -> Result<Vec<RunningInstance>> {
            Ok(self.running.lock().unwrap().clone())
        }

        async fn quota(&self, _service: &str, _code: &str) -> Result<u64> {
            Ok(64)
        }

        async fn instance_types_arm(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn host_table() -> Arc<HostConfigTable> {
        let mut entries = StdHashMap::new();
        entries.insert(
            "linux-amd64".to_string(),
            HostConfig {
                machine_type: "n2-standard-4".to_string(),
                kind: PoolKind::CloudVm,
                root_disk_size_gb: 20,
                expected_count: 1,
                ssh_username: Some("gopher".to_string()),
                container_image: None,
                container_on_host: false,
            },
        );
        Arc::new(HostConfigTable::new(entries).unwrap())
    }

    #[tokio::test]
    async fn acquire_reserves_quota_and_returns_a_client() {
        let provisioner = Arc::new(FakeProvisioner::default());
        let pool = CloudPool::new(host_table(), provisioner, 10);
        let item = SchedItem::new("linux-amd64", RequestClass::Batch, "main");
        let cancel = CancellationToken::new();

        let client = pool.acquire("linux-amd64", &item, &cancel).await.unwrap();
        client.status().await.unwrap();

        let stats = pool.quota_stats();
        assert_eq!(stats["N2_CPUs"].used, 4);
        assert_eq!(stats["instances"].used, 1);

        pool.close_idle();
    }

    #[tokio::test]
    async fn stray_reaper_deletes_untracked_instance_with_expired_delete_at() {
        let provisioner = Arc::new(FakeProvisioner::default());
        provisioner.running.lock().unwrap().push(RunningInstance {
            id: "stray-id".to_string(),
            name: "buildlet-test-foo".to_string(),
            zone: "us-central1-a".to_string(),
            machine_type: "n2-standard-4".to_string(),
            created_at: Utc::now() - chrono::Duration::hours(1),
            delete_at: Some(Utc::now() - chrono::Duration::seconds(1)),
        });

        let pool = CloudPool::new(host_table(), provisioner.clone(), 10);
        pool.reap_strays_once().await;
        pool.close_idle();

        assert_eq!(provisioner.destroyed.lock().unwrap().as_slice(), ["stray-id"]);
    }
}
