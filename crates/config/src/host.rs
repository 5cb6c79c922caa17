//! Host-configuration types (§3, §6).

use serde::Deserialize;

/// Which pool implementation a host type is provisioned from.
///
/// Drives [`crate::table::HostConfigTable`] validation and is consumed
/// directly by the scheduler's pool selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolKind {
    /// A VM the controller creates on demand through the cloud SDK.
    CloudVm,
    /// Same as `CloudVm` but through the EC2-shaped API surface.
    CloudEc2,
    /// A container workload; routed to the container pool unless
    /// `container_on_host` prefers running it on the VM pool instead.
    Container,
    /// Hardware that dials into the controller rather than being launched.
    Reverse,
}

/// One entry of the process-wide host-configuration table.
///
/// Read-only after process init (§3); no field here is ever mutated once
/// the table is built.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HostConfig {
    /// Cloud provider SKU string, e.g. `"n2-standard-8"`. Empty for `Reverse`.
    #[serde(default)]
    pub machine_type: String,
    /// Which pool provisions this host type.
    pub kind: PoolKind,
    /// Root disk size in GiB. Ignored for `Reverse`.
    #[serde(default)]
    pub root_disk_size_gb: u32,
    /// Number of workers of this type the fleet is expected to maintain;
    /// purely advisory, used by [`crate::table::HostConfigTable::validate`]
    /// to flag configuration that looks obviously wrong (zero for a
    /// cloud-provisioned type is legal, negative is not representable).
    #[serde(default)]
    pub expected_count: u32,
    /// SSH login user for cloud-provisioned workers.
    #[serde(default)]
    pub ssh_username: Option<String>,
    /// OCI image reference for `Container` host types.
    #[serde(default)]
    pub container_image: Option<String>,
    /// When `kind == Container`, prefer scheduling onto the VM pool as a
    /// container-on-host workload instead of the dedicated container pool.
    #[serde(default)]
    pub container_on_host: bool,
}

impl HostConfig {
    /// `true` if this host type is provisioned from a cloud API (VM or EC2).
    #[must_use]
    pub fn is_cloud(&self) -> bool {
        matches!(self.kind, PoolKind::CloudVm | PoolKind::CloudEc2)
    }
}
