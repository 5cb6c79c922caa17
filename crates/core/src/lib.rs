//! # buildsched-core
//!
//! The buildlet scheduling and capacity-management substrate: a priority
//! queue with quota admission control across multiple resource
//! dimensions, two provisioning backends (cloud VMs and passively
//! reverse-connected hardware), and the reconciliation loops that keep
//! quota honest against reality.
//!
//! Durable queue persistence, cross-region placement, preemption of
//! already-granted workers, billing, and SLA proofs are explicitly out of
//! scope; see the component modules for what is in it.

pub mod item;
pub mod ledger;
pub mod pool;
pub mod provider;
pub mod quota;
pub mod scheduler;
pub mod status;

pub use item::{MonotonicClock, RequestClass, SchedItem};
pub use ledger::{Ledger, LedgerEntry, LedgerSnapshot};
pub use pool::{CloudPool, Pool, PoolSelector, ReversePool};
pub use provider::{Instance, NoopCallbacks, ProvisionCallbacks, RunningInstance, StartOpts, VmProvisioner, WorkerClient};
pub use quota::{QuotaHandle, QuotaQueue, QuotaStats};
pub use scheduler::{Scheduler, Snapshot, WaiterState};
pub use status::StatusReporter;
