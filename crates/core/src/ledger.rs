//! [`Ledger`]: double-booking prevention and per-request CPU reservation
//! for the cloud pool (§4.2).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use buildsched_error::{Result, SchedError};

use crate::item::SchedItem;
use crate::quota::{QuotaHandle, QuotaQueue};

/// Resolves a machine-type string to the CPU [`QuotaQueue`] that should
/// track it and the number of vCPUs it costs. [`crate::pool::cloud::CloudPool`]
/// owns the family-specific queues and supplies this as routing glue; the
/// ledger itself is family-agnostic.
pub type CpuDimensionFn = Arc<dyn Fn(&str) -> (Arc<QuotaQueue>, u64) + Send + Sync>;

/// One in-flight or active cloud worker, by logical instance name (§3).
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    /// Set once the provisioner's `onCreated` callback fires.
    pub created_at: Option<DateTime<Utc>>,
    /// Set once the provisioner's `onInfo` callback reports the cloud ID.
    pub instance_id: Option<String>,
    /// vCPU cost charged against the family CPU queue.
    pub vcpu_count: u64,
    /// Machine-type string requested.
    pub instance_type: String,
    cpu_queue: Arc<QuotaQueue>,
    cpu_handle: QuotaHandle,
    instance_handle: QuotaHandle,
}

/// Aggregate view for status reporting (§4.2 `Snapshot`).
#[derive(Debug, Clone)]
pub struct LedgerSnapshot {
    /// Number of entries currently held.
    pub instance_count: usize,
    /// Used capacity on the general CPU dimension.
    pub cpu_used: u64,
    /// Configured limit on the general CPU dimension.
    pub cpu_limit: u64,
    /// `(name, created_at)` for every entry, unsorted.
    pub entries: Vec<(String, Option<DateTime<Utc>>)>,
}

/// Reservation table for the cloud pool, mediated by a single mutex (§4.2,
/// §5: "every component owns a single mutex that guards all its internal
/// state").
pub struct Ledger {
    instance_queue: Arc<QuotaQueue>,
    general_cpu_queue: Arc<QuotaQueue>,
    cpu_dimension_for: CpuDimensionFn,
    entries: Mutex<HashMap<String, LedgerEntry>>,
    known_instance_types: Mutex<Vec<String>>,
}

impl Ledger {
    /// `instance_queue` tracks the instance-count dimension (cost 1 per
    /// worker); `general_cpu_queue` is the default/fallback CPU dimension
    /// (also the one `set_cpu_limit` updates); `cpu_dimension_for` routes a
    /// machine-type string to its family-specific CPU queue and vCPU cost.
    #[must_use]
    pub fn new(
        instance_queue: Arc<QuotaQueue>,
        general_cpu_queue: Arc<QuotaQueue>,
        cpu_dimension_for: CpuDimensionFn,
    ) -> Self {
        Self {
            instance_queue,
            general_cpu_queue,
            cpu_dimension_for,
            entries: Mutex::new(HashMap::new()),
            known_instance_types: Mutex::new(Vec::new()),
        }
    }

    /// Reserve quota for a new worker named `name` of the given
    /// `instance_type`. Blocks until both the CPU and instance-count
    /// quotas are granted, or `cancel` fires first.
    pub async fn reserve(
        &self,
        name: &str,
        instance_type: &str,
        cancel: &CancellationToken,
        item: &SchedItem,
    ) -> Result<()> {
        if self.entries.lock().contains_key(name) {
            return Err(SchedError::double_reservation(name));
        }
        {
            let known = self.known_instance_types.lock();
            if !known.is_empty() && !known.iter().any(|t| t == instance_type) {
                return Err(SchedError::internal(format!(
                    "unknown instance type: {instance_type}"
                )));
            }
        }

        let (cpu_queue, vcpu_count) = (self.cpu_dimension_for)(instance_type);
        let cpu_handle = cpu_queue.enqueue(item, vcpu_count);
        let instance_handle = self.instance_queue.enqueue(item, 1);

        if let Err(err) = cpu_queue.wait(cpu_handle, cancel).await {
            self.instance_queue.release(instance_handle);
            return Err(err);
        }
        if let Err(err) = self.instance_queue.wait(instance_handle, cancel).await {
            cpu_queue.release(cpu_handle);
            return Err(err);
        }

        self.entries.lock().insert(
            name.to_string(),
            LedgerEntry {
                created_at: None,
                instance_id: None,
                vcpu_count,
                instance_type: instance_type.to_string(),
                cpu_queue,
                cpu_handle,
                instance_handle,
            },
        );
        Ok(())
    }

    /// Record the cloud-assigned instance ID once provisioning reports it.
    pub fn assign_id(&self, name: &str, instance_id: impl Into<String>) {
        if let Some(entry) = self.entries.lock().get_mut(name) {
            entry.created_at = Some(Utc::now());
            entry.instance_id = Some(instance_id.into());
        }
    }

    /// Release both quotas held by `name` and forget it. No-op if unknown.
    pub fn remove(&self, name: &str) {
        if let Some(entry) = self.entries.lock().remove(name) {
            entry.cpu_queue.release(entry.cpu_handle);
            self.instance_queue.release(entry.instance_handle);
        }
    }

    /// Look up the cloud-assigned ID for `name`, if provisioning has
    /// reported one yet.
    #[must_use]
    pub fn lookup_id(&self, name: &str) -> Option<String> {
        self.entries.lock().get(name)?.instance_id.clone()
    }

    /// `true` if `name` currently holds a reservation.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().contains_key(name)
    }

    /// Update the general CPU dimension's limit from provider-reported
    /// quota (§4.3 quota refresh).
    pub fn set_cpu_limit(&self, limit: u64) {
        self.general_cpu_queue.update_limit(limit);
    }

    /// Replace the set of instance types known to be valid. An empty list
    /// disables the `reserve` validity check (the initial state, before
    /// the provider has reported anything).
    pub fn update_instance_types(&self, types: Vec<String>) {
        *self.known_instance_types.lock() = types;
    }

    /// Point-in-time snapshot for status reporting.
    #[must_use]
    pub fn snapshot(&self) -> LedgerSnapshot {
        let entries = self.entries.lock();
        let stats = self.general_cpu_queue.stats();
        LedgerSnapshot {
            instance_count: entries.len(),
            cpu_used: stats.used,
            cpu_limit: stats.limit,
            entries: entries
                .iter()
                .map(|(name, entry)| (name.clone(), entry.created_at))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::RequestClass;

    fn router() -> CpuDimensionFn {
        let queue = Arc::new(QuotaQueue::new(16));
        Arc::new(move |_machine_type: &str| (queue.clone(), 4))
    }

    #[tokio::test]
    async fn reserve_then_remove_leaves_cpu_used_unchanged() {
        let ledger = Ledger::new(
            Arc::new(QuotaQueue::new(10)),
            Arc::new(QuotaQueue::new(16)),
            router(),
        );
        let item = SchedItem::new("linux-amd64", RequestClass::Batch, "main");
        let cancel = CancellationToken::new();

        ledger.reserve("buildlet-a", "n2-standard-4", &cancel, &item).await.unwrap();
        ledger.assign_id("buildlet-a", "instance-123");
        assert_eq!(ledger.lookup_id("buildlet-a").as_deref(), Some("instance-123"));

        ledger.remove("buildlet-a");
        assert!(ledger.lookup_id("buildlet-a").is_none());
        assert_eq!(ledger.snapshot().instance_count, 0);
    }

    #[tokio::test]
    async fn double_reservation_of_same_name_fails() {
        let ledger = Ledger::new(
            Arc::new(QuotaQueue::new(10)),
            Arc::new(QuotaQueue::new(16)),
            router(),
        );
        let item = SchedItem::new("linux-amd64", RequestClass::Batch, "main");
        let cancel = CancellationToken::new();
        ledger.reserve("buildlet-a", "n2-standard-4", &cancel, &item).await.unwrap();

        let err = ledger
            .reserve("buildlet-a", "n2-standard-4", &cancel, &item)
            .await
            .unwrap_err();
        assert!(err.is_caller_error());
    }

    #[tokio::test]
    async fn reserve_rejects_unknown_instance_type_once_types_are_loaded() {
        let ledger = Ledger::new(
            Arc::new(QuotaQueue::new(10)),
            Arc::new(QuotaQueue::new(16)),
            router(),
        );
        ledger.update_instance_types(vec!["n2-standard-4".to_string()]);
        let item = SchedItem::new("linux-amd64", RequestClass::Batch, "main");
        let cancel = CancellationToken::new();

        let err = ledger
            .reserve("buildlet-b", "bogus-type", &cancel, &item)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
