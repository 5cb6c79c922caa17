//! Pool implementations and the selector that routes a host configuration
//! to the right one (§4.6).

pub mod cloud;
pub mod reverse;

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use buildsched_config::{HostConfig, PoolKind};
use buildsched_error::Result;

use crate::item::SchedItem;
use crate::provider::WorkerClient;
use crate::quota::QuotaStats;

pub use cloud::CloudPool;
pub use reverse::ReversePool;

/// Common contract every pool implementation satisfies (§4.3, §4.4).
#[async_trait]
pub trait Pool: Send + Sync {
    /// Obtain a worker of `host_type` for `item`, blocking until one is
    /// available or `cancel` fires.
    async fn acquire(
        &self,
        host_type: &str,
        item: &SchedItem,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn WorkerClient>>;

    /// Stop this pool's background reconciliation loops.
    fn close_idle(&self);

    /// Per-dimension quota snapshot, keyed by dimension name.
    fn quota_stats(&self) -> HashMap<String, QuotaStats>;

    /// Short textual snapshot for `StatusReporter`.
    fn html_status(&self) -> String;
}

type OverrideFn = dyn Fn(&HostConfig) -> Option<Arc<dyn Pool>> + Send + Sync;

/// Routes a [`HostConfig`] to its [`Pool`] (§4.6).
///
/// Holds one instance of each concrete pool kind plus a single
/// process-wide override hook, written once before concurrent use begins
/// (§9 "Global state"/§5 "a single pointer written once at test-setup").
pub struct PoolSelector {
    cloud_vm: Arc<dyn Pool>,
    cloud_ec2: Arc<dyn Pool>,
    container: Arc<dyn Pool>,
    reverse: Arc<dyn Pool>,
    override_hook: ArcSwapOption<Box<OverrideFn>>,
}

impl PoolSelector {
    /// Build a selector from one concrete pool per kind. `cloud_vm` is
    /// also used for `Container` host types with `container_on_host` set.
    #[must_use]
    pub fn new(
        cloud_vm: Arc<dyn Pool>,
        cloud_ec2: Arc<dyn Pool>,
        container: Arc<dyn Pool>,
        reverse: Arc<dyn Pool>,
    ) -> Self {
        Self {
            cloud_vm,
            cloud_ec2,
            container,
            reverse,
            override_hook: ArcSwapOption::empty(),
        }
    }

    /// Install a test override consulted before the normal kind-based
    /// routing. Intended to be set once, before any concurrent `select`
    /// calls begin.
    pub fn set_override(&self, hook: impl Fn(&HostConfig) -> Option<Arc<dyn Pool>> + Send + Sync + 'static) {
        self.override_hook.store(Some(Arc::new(Box::new(hook))));
    }

    /// Remove a previously installed override.
    pub fn clear_override(&self) {
        self.override_hook.store(None);
    }

    /// Resolve `config` to the pool that should serve it.
    #[must_use]
    pub fn select(&self, config: &HostConfig) -> Arc<dyn Pool> {
        if let Some(hook) = self.override_hook.load().as_ref() {
            if let Some(pool) = hook(config) {
                return pool;
            }
        }
        match config.kind {
            PoolKind::CloudVm => self.cloud_vm.clone(),
            PoolKind::CloudEc2 => self.cloud_ec2.clone(),
            PoolKind::Container if config.container_on_host => self.cloud_vm.clone(),
            PoolKind::Container => self.container.clone(),
            PoolKind::Reverse => self.reverse.clone(),
        }
    }
}
