//! Backend contract abstraction.
//!
//! The [`CloudBackend`] trait is the pluggable CPI (cloud provider interface)
//! whose contract the lifecycle runs exercise. [`CloudInspector`] is the
//! provider-side view used to check what the backend actually did (server
//! addresses, volume metadata, ports), and [`CloudProvider`] ties the two
//! together: one shared provider environment hands out CPI instances
//! configured with per-run [`CpiOptions`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │  ResourceProvisioner │──────────────┐
//! └──────────┬───────────┘              │
//!            ▼                          ▼
//!   ┌──────────────┐          ┌────────────────┐
//!   │ CloudBackend │ (trait)  │ CloudInspector │ (trait)
//!   └──────┬───────┘          └───────┬────────┘
//!          ▼                          ▼
//!     SimulatedCpi  ────shares────  SimulatedCloud
//! ```
//!
//! # Error Handling
//!
//! Every method returns a classified [`CpiError`]:
//! - `VmCreationFailed`: the VM never came into existence
//! - `Cloud`: generic provider rejection
//! - `ResourceNotFound`: the referenced handle does not exist (or, for
//!   `detach_disk`, is not attached)

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use lifecheck_core::network::NetworkSpec;
use lifecheck_core::types::{
    DiskCloudProperties, Metadata, ResourcePool, StemcellCloudProperties,
};

use crate::error::CpiError;
use crate::registry::AgentRegistry;

/// Agent environment passed through `create_vm`.
pub type AgentEnv = BTreeMap<String, serde_json::Value>;

/// Metadata keys a disk inherits from the VM it is attached to.
pub const DISK_METADATA_WHITELIST: [&str; 4] = ["id", "deployment", "job", "index"];

/// Device path of a boot volume.
pub const BOOT_VOLUME_DEVICE: &str = "/dev/vda";

/// Config drive mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigDrive {
    /// Attached as a CD-ROM device
    Cdrom,
    /// Attached as a block device
    Disk,
}

impl ConfigDrive {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cdrom => "cdrom",
            Self::Disk => "disk",
        }
    }

    /// Parses a config value; an empty string means "no config drive".
    pub fn parse(value: &str) -> Result<Option<Self>, CpiError> {
        match value {
            "" => Ok(None),
            "cdrom" => Ok(Some(Self::Cdrom)),
            "disk" => Ok(Some(Self::Disk)),
            other => Err(CpiError::Cloud(format!(
                "unknown config drive mode '{other}'"
            ))),
        }
    }
}

impl fmt::Display for ConfigDrive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options a CPI instance is created with.
///
/// These differ per scenario while the provider state is shared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpiOptions {
    /// Boot VMs from a volume instead of the image root disk
    pub boot_from_volume: bool,
    /// Deliver metadata through a config drive
    pub config_drive: Option<ConfigDrive>,
    /// Default DHCP flag for networks that do not set `use_dhcp`
    pub use_dhcp: bool,
    /// Rename VMs from the `name` metadata key
    pub human_readable_vm_names: bool,
    /// Resolve security groups through compute instead of the network API
    pub use_nova_networking: bool,
}

impl Default for CpiOptions {
    fn default() -> Self {
        Self {
            boot_from_volume: false,
            config_drive: None,
            use_dhcp: true,
            human_readable_vm_names: false,
            use_nova_networking: false,
        }
    }
}

/// Operations of the backend contract (used for logging and fault injection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpiOperation {
    CreateStemcell,
    DeleteStemcell,
    CreateVm,
    DeleteVm,
    HasVm,
    SetVmMetadata,
    CreateDisk,
    HasDisk,
    DeleteDisk,
    AttachDisk,
    DetachDisk,
    SnapshotDisk,
    DeleteSnapshot,
}

impl CpiOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateStemcell => "create_stemcell",
            Self::DeleteStemcell => "delete_stemcell",
            Self::CreateVm => "create_vm",
            Self::DeleteVm => "delete_vm",
            Self::HasVm => "has_vm",
            Self::SetVmMetadata => "set_vm_metadata",
            Self::CreateDisk => "create_disk",
            Self::HasDisk => "has_disk",
            Self::DeleteDisk => "delete_disk",
            Self::AttachDisk => "attach_disk",
            Self::DetachDisk => "detach_disk",
            Self::SnapshotDisk => "snapshot_disk",
            Self::DeleteSnapshot => "delete_snapshot",
        }
    }
}

impl fmt::Display for CpiOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait abstracting the CPI backend contract.
///
/// Implementations are `Send + Sync + 'static` so a provisioner can share them
/// across async contexts. Timeouts and retries toward the provider are the
/// implementation's responsibility; callers never retry.
pub trait CloudBackend: Send + Sync + 'static {
    /// Uploads a stemcell image, or registers a light stemcell when
    /// `cloud_properties.image_id` is set (`"<image_id> light"`).
    ///
    /// # Errors
    ///
    /// - `CpiError::Cloud`: the referenced image does not exist
    fn create_stemcell(
        &self,
        image_path: &str,
        cloud_properties: &StemcellCloudProperties,
    ) -> impl Future<Output = Result<String, CpiError>> + Send;

    /// Deletes a stemcell. Light stemcells leave the referenced image alone.
    fn delete_stemcell(
        &self,
        stemcell_id: &str,
    ) -> impl Future<Output = Result<(), CpiError>> + Send;

    /// Creates a VM and returns its id.
    ///
    /// # Errors
    ///
    /// - `CpiError::VmCreationFailed`: unallocatable floating IP, unknown network id
    /// - `CpiError::Cloud`: unknown image/flavor, zero root disk without override
    fn create_vm(
        &self,
        agent_id: &str,
        stemcell_id: &str,
        resource_pool: &ResourcePool,
        networks: &NetworkSpec,
        disk_locality: &[String],
        env: &AgentEnv,
    ) -> impl Future<Output = Result<String, CpiError>> + Send;

    /// Deletes a VM together with its ports and boot volume.
    fn delete_vm(&self, vm_id: &str) -> impl Future<Output = Result<(), CpiError>> + Send;

    /// Returns whether the VM exists.
    fn has_vm(&self, vm_id: &str) -> impl Future<Output = Result<bool, CpiError>> + Send;

    /// Merges metadata into the VM's metadata.
    fn set_vm_metadata(
        &self,
        vm_id: &str,
        metadata: &Metadata,
    ) -> impl Future<Output = Result<(), CpiError>> + Send;

    /// Creates a persistent disk, optionally co-located with `vm_id`.
    fn create_disk(
        &self,
        size_mb: u32,
        cloud_properties: &DiskCloudProperties,
        vm_id: Option<&str>,
    ) -> impl Future<Output = Result<String, CpiError>> + Send;

    /// Returns whether the disk exists.
    fn has_disk(&self, disk_id: &str) -> impl Future<Output = Result<bool, CpiError>> + Send;

    /// Deletes a disk.
    fn delete_disk(&self, disk_id: &str) -> impl Future<Output = Result<(), CpiError>> + Send;

    /// Attaches a disk to a VM. The disk inherits the VM's whitelisted metadata.
    fn attach_disk(
        &self,
        vm_id: &str,
        disk_id: &str,
    ) -> impl Future<Output = Result<(), CpiError>> + Send;

    /// Detaches a disk from a VM.
    ///
    /// # Errors
    ///
    /// - `CpiError::ResourceNotFound`: the disk is not attached to the VM
    fn detach_disk(
        &self,
        vm_id: &str,
        disk_id: &str,
    ) -> impl Future<Output = Result<(), CpiError>> + Send;

    /// Snapshots a disk and returns the snapshot id.
    fn snapshot_disk(
        &self,
        disk_id: &str,
        metadata: &Metadata,
    ) -> impl Future<Output = Result<String, CpiError>> + Send;

    /// Deletes a snapshot.
    fn delete_snapshot(
        &self,
        snapshot_id: &str,
    ) -> impl Future<Output = Result<(), CpiError>> + Send;
}

/// Lifecycle state of a server as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Active,
    Error,
}

/// Address entry of a server (`addresses` in the compute API).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    /// Network id the address belongs to
    pub net_id: String,
    /// Assigned address
    pub addr: IpAddr,
    /// Port MAC address (`OS-EXT-IPS-MAC:mac_addr`)
    pub mac_addr: String,
    /// `fixed` or `floating`
    pub address_type: String,
}

/// Volume attached to a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeAttachment {
    pub volume_id: String,
    pub device: String,
}

/// Detailed provider view of one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDetails {
    pub id: String,
    pub name: String,
    pub state: ServerState,
    pub addresses: Vec<NetworkInterface>,
    pub volume_attachments: Vec<VolumeAttachment>,
    pub config_drive: Option<ConfigDrive>,
    pub metadata: Metadata,
}

impl ServerDetails {
    /// Fixed (non-floating) addresses.
    pub fn fixed_addresses(&self) -> impl Iterator<Item = &NetworkInterface> {
        self.addresses.iter().filter(|a| a.address_type == "fixed")
    }

    /// Address entry for a given IP.
    pub fn interface_with_ip(&self, ip: IpAddr) -> Option<&NetworkInterface> {
        self.addresses.iter().find(|a| a.addr == ip)
    }
}

/// Summary row of the server list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSummary {
    pub id: String,
    pub private_ip: Option<IpAddr>,
    pub state: ServerState,
}

/// Counts of releasable resources held by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCounts {
    pub vms: usize,
    pub disks: usize,
    pub snapshots: usize,
    pub ports: usize,
}

impl ResourceCounts {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Display for ResourceCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "vms={} disks={} snapshots={} ports={}",
            self.vms, self.disks, self.snapshots, self.ports
        )
    }
}

/// Provider-side view used to verify what the backend did.
pub trait CloudInspector: Send + Sync + 'static {
    /// Details of one server, `None` if it does not exist.
    fn server(
        &self,
        vm_id: &str,
    ) -> impl Future<Output = Result<Option<ServerDetails>, CpiError>> + Send;

    /// All servers.
    fn servers(&self) -> impl Future<Output = Result<Vec<ServerSummary>, CpiError>> + Send;

    /// Metadata of a volume, `None` if it does not exist.
    fn volume_metadata(
        &self,
        disk_id: &str,
    ) -> impl Future<Output = Result<Option<Metadata>, CpiError>> + Send;

    /// Ids of the ports bound to a device (server).
    fn ports_for_device(
        &self,
        device_id: &str,
    ) -> impl Future<Output = Result<Vec<String>, CpiError>> + Send;

    /// Returns whether a port still exists.
    fn port_exists(&self, port_id: &str) -> impl Future<Output = Result<bool, CpiError>> + Send;

    /// Current resource counts.
    fn resource_counts(&self) -> impl Future<Output = Result<ResourceCounts, CpiError>> + Send;

    /// Number of security-group lookups sent to the network API.
    fn network_api_security_group_lookups(
        &self,
    ) -> impl Future<Output = Result<u64, CpiError>> + Send;
}

/// A provider environment shared by every scenario of a session.
pub trait CloudProvider: CloudInspector {
    /// CPI type handed out for each run
    type Cpi: CloudBackend;
    /// Agent registry the CPI writes settings to
    type Registry: AgentRegistry;

    /// Creates a CPI instance with the given options.
    fn cpi(&self, options: &CpiOptions) -> Self::Cpi;

    /// Registry side channel.
    fn registry(&self) -> &Self::Registry;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_drive_parse_accepts_known_modes() {
        assert_eq!(ConfigDrive::parse("").unwrap(), None);
        assert_eq!(ConfigDrive::parse("cdrom").unwrap(), Some(ConfigDrive::Cdrom));
        assert_eq!(ConfigDrive::parse("disk").unwrap(), Some(ConfigDrive::Disk));
        assert!(ConfigDrive::parse("floppy").is_err());
    }

    #[test]
    fn cpi_options_default_uses_dhcp() {
        let options = CpiOptions::default();
        assert!(options.use_dhcp);
        assert!(!options.boot_from_volume);
        assert!(options.config_drive.is_none());
    }

    #[test]
    fn resource_counts_zero() {
        assert!(ResourceCounts::default().is_zero());
        let counts = ResourceCounts {
            ports: 1,
            ..Default::default()
        };
        assert!(!counts.is_zero());
        assert_eq!(counts.to_string(), "vms=0 disks=0 snapshots=0 ports=1");
    }

    #[test]
    fn operation_names_are_snake_case() {
        assert_eq!(CpiOperation::CreateVm.as_str(), "create_vm");
        assert_eq!(CpiOperation::DeleteSnapshot.to_string(), "delete_snapshot");
    }

    #[test]
    fn server_details_find_interface_by_ip() {
        let details = ServerDetails {
            id: "vm-1".into(),
            name: "vm-1".into(),
            state: ServerState::Active,
            addresses: vec![
                NetworkInterface {
                    net_id: "net-1".into(),
                    addr: "10.0.0.5".parse().unwrap(),
                    mac_addr: "fa:16:3e:00:00:01".into(),
                    address_type: "fixed".into(),
                },
                NetworkInterface {
                    net_id: "net-1".into(),
                    addr: "203.0.113.10".parse().unwrap(),
                    mac_addr: "fa:16:3e:00:00:01".into(),
                    address_type: "floating".into(),
                },
            ],
            volume_attachments: Vec::new(),
            config_drive: None,
            metadata: Metadata::new(),
        };
        assert_eq!(details.fixed_addresses().count(), 1);
        let iface = details
            .interface_with_ip("10.0.0.5".parse().unwrap())
            .unwrap();
        assert_eq!(iface.mac_addr, "fa:16:3e:00:00:01");
    }
}
