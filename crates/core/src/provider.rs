//! External collaborators the scheduling substrate consumes (§6): the
//! cloud VM provisioner and the worker client it hands back. Everything in
//! this module is an interface — the cloud SDK and the buildlet wire
//! protocol it ultimately talks to are out of scope.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use buildsched_error::Result;

/// One running (or just-created) cloud instance, as reported by the
/// provisioner.
#[derive(Debug, Clone)]
pub struct Instance {
    /// Cloud-assigned identifier.
    pub id: String,
    /// Logical name this controller gave it at creation.
    pub name: String,
    /// Zone the instance landed in.
    pub zone: String,
    /// Machine-type string it was created with.
    pub machine_type: String,
    /// When the provider reports it as created.
    pub created_at: DateTime<Utc>,
}

/// An instance discovered by listing the account, independent of whether
/// this controller created it (§4.3 stray reaper).
#[derive(Debug, Clone)]
pub struct RunningInstance {
    /// Cloud-assigned identifier.
    pub id: String,
    /// Instance name as reported by the provider.
    pub name: String,
    /// Zone the instance lives in.
    pub zone: String,
    /// Machine-type string.
    pub machine_type: String,
    /// When the provider reports it as created.
    pub created_at: DateTime<Utc>,
    /// Parsed `delete-at` metadata, if the instance carries one.
    pub delete_at: Option<DateTime<Utc>>,
}

/// Callbacks threaded through [`VmProvisioner::start_vm`] so the ledger and
/// logs can react to provisioning milestones without the provisioner
/// needing to know about either (§4.3 step 6).
///
/// A trait, not a closure bundle, so it stays object-safe: the cloud pool
/// stores `Arc<dyn ProvisionCallbacks>` and the same implementation can be
/// reused across concurrent `Acquire` calls.
pub trait ProvisionCallbacks: Send + Sync {
    /// The provisioner has accepted the start request.
    fn on_requested(&self) {}
    /// The provider confirms the VM now exists; from this point a failure
    /// must be cleaned up with a delete, not just a quota release.
    fn on_created(&self) {}
    /// The provider has returned full instance details (ID, zone).
    fn on_info(&self, instance: &Instance) {
        let _ = instance;
    }
}

/// No-op callbacks, useful in tests and as a default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallbacks;

impl ProvisionCallbacks for NoopCallbacks {}

/// Options for [`VmProvisioner::start_vm`] (§6).
pub struct StartOpts {
    /// Unix-seconds deadline written as `delete-at` metadata; the stray
    /// reaper deletes the instance once this passes.
    pub delete_deadline: DateTime<Utc>,
    /// PEM-encoded TLS certificate and private key for the buildlet's
    /// HTTPS listener.
    pub tls_cert_pem: Vec<u8>,
    /// See `tls_cert_pem`.
    pub tls_key_pem: Vec<u8>,
    /// Preferred zone; empty means let the provider choose.
    pub zone_hint: Option<String>,
    /// Extra instance metadata beyond `delete-at`.
    pub metadata: HashMap<String, String>,
    /// Provisioning-milestone callbacks.
    pub callbacks: std::sync::Arc<dyn ProvisionCallbacks>,
}

impl fmt::Debug for StartOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartOpts")
            .field("delete_deadline", &self.delete_deadline)
            .field("zone_hint", &self.zone_hint)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// The buildlet wire-protocol client handed back by a successful
/// `Acquire` (§6). Exec/push/status framing itself is out of scope; only
/// the lifecycle surface the pools need is specified here.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Query the worker's current status.
    async fn status(&self) -> Result<()>;
    /// Remove files under `path` (cleanup between reverse-worker grabs).
    async fn remove_all(&self, path: &str) -> Result<()>;
    /// Tear down the connection.
    async fn close(&self) -> Result<()>;
    /// Attach a human-readable description for status pages.
    fn set_description(&self, description: &str);
    /// Attach an instance name, once known.
    fn set_instance_name(&self, name: &str);
    /// Register a callback invoked once if the worker's heartbeat fails.
    /// Pools use this to trigger the same cleanup path as a failed
    /// `Acquire` (§4.3 step 8).
    fn set_on_heartbeat_failure(&self, callback: Box<dyn Fn() + Send + Sync>);
}

/// The cloud SDK surface the cloud pool consumes (§6). Interface only —
/// the real implementation talks to the provider's HTTP API.
#[async_trait]
pub trait VmProvisioner: Send + Sync {
    /// Start a new VM of `machine_type` named `name` for `host_type`, and
    /// return a client once it is reachable.
    ///
    /// Errors map to `buildsched_error::SchedError::quota_exceeded`,
    /// `SchedError::cancelled`, or `SchedError::provider_transient`.
    async fn start_vm(
        &self,
        name: &str,
        host_type: &str,
        machine_type: &str,
        opts: StartOpts,
    ) -> Result<Box<dyn WorkerClient>>;

    /// Destroy the given cloud-assigned instance IDs.
    async fn destroy_instances(&self, ids: &[String]) -> Result<()>;

    /// List every instance currently in the account/region this pool
    /// manages, tracked or not.
    async fn running_instances(&self) -> Result<Vec<RunningInstance>>;

    /// Current provider-reported quota value for `(service, code)`, e.g.
    /// `("compute", "N2_CPUS")`.
    async fn quota(&self, service: &str, code: &str) -> Result<u64>;

    /// ARM-capable instance types available in this region (used to
    /// populate [`crate::ledger::Ledger::update_instance_types`]).
    async fn instance_types_arm(&self) -> Result<Vec<String>>;
}
