//! In-memory cloud used to exercise the backend contract.
//!
//! [`SimulatedCloud`] holds the provider state shared by a session (images,
//! flavors, networks, floating IP pool, volume types, servers, volumes,
//! snapshots, ports). [`SimulatedCpi`] is the per-run CPI handed out by
//! [`CloudProvider::cpi`]; it applies its [`CpiOptions`] on top of the shared
//! state.
//!
//! Faults are injected per operation with [`SimulatedCloud::inject_fault`]:
//! the next `times` calls of that operation fail with the given error before
//! touching any state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use lifecheck_core::config::IntegrationConfig;
use lifecheck_core::network::{NetworkKind, NetworkSpec};
use lifecheck_core::types::{
    DiskCloudProperties, Metadata, ResourceHandle, ResourceKind, ResourcePool,
    StemcellCloudProperties, heavy_image_id, light_stemcell_id, LIGHT_STEMCELL_SUFFIX,
};

use crate::cpi::{
    AgentEnv, BOOT_VOLUME_DEVICE, CloudBackend, CloudInspector, CloudProvider, ConfigDrive,
    CpiOperation, CpiOptions, DISK_METADATA_WHITELIST, NetworkInterface, ResourceCounts,
    ServerDetails, ServerState, ServerSummary, VolumeAttachment,
};
use crate::error::CpiError;
use crate::registry::{AgentRegistry, AgentSettings, InMemoryRegistry, NetworkSettings};

/// Root disk size of flavors registered without an explicit size (GiB).
const DEFAULT_ROOT_DISK_GB: u32 = 10;

/// Smallest disk the simulated block storage accepts (MiB).
const MIN_DISK_SIZE_MB: u32 = 1024;

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpiCall {
    pub operation: CpiOperation,
    pub target: String,
}

#[derive(Debug)]
struct Flavor {
    root_disk_gb: u32,
}

#[derive(Debug)]
struct Server {
    name: String,
    state: ServerState,
    floating_ip: Option<IpAddr>,
    attachments: Vec<VolumeAttachment>,
    boot_volume: Option<String>,
    config_drive: Option<ConfigDrive>,
    metadata: Metadata,
    availability_zone: Option<String>,
}

#[derive(Debug)]
struct Volume {
    size_mb: u32,
    volume_type: Option<String>,
    metadata: Metadata,
    attached_to: Option<String>,
    availability_zone: Option<String>,
}

#[derive(Debug)]
struct Snapshot {
    disk_id: String,
    metadata: Metadata,
}

#[derive(Debug)]
struct Port {
    device_id: String,
    net_id: String,
    ip: IpAddr,
    mac: String,
}

#[derive(Debug)]
struct Fault {
    operation: CpiOperation,
    error: CpiError,
    remaining: u32,
}

#[derive(Debug, Default)]
struct CloudState {
    images: HashSet<String>,
    flavors: HashMap<String, Flavor>,
    networks: HashSet<String>,
    floating_ips: BTreeMap<IpAddr, Option<String>>,
    volume_types: HashSet<String>,
    servers: BTreeMap<String, Server>,
    volumes: BTreeMap<String, Volume>,
    snapshots: BTreeMap<String, Snapshot>,
    ports: BTreeMap<String, Port>,
    faults: Vec<Fault>,
    calls: Vec<CpiCall>,
    security_group_lookups: u64,
    next_mac: u32,
    next_dynamic_ip: u32,
}

impl CloudState {
    /// Records the call and fails it if a fault is pending for the operation.
    fn begin(&mut self, operation: CpiOperation, target: &str) -> Result<(), CpiError> {
        debug!(operation = %operation, target, "simulated cpi call");
        self.calls.push(CpiCall {
            operation,
            target: target.to_owned(),
        });
        let Some(pos) = self
            .faults
            .iter()
            .position(|f| f.operation == operation && f.remaining > 0)
        else {
            return Ok(());
        };
        let fault = &mut self.faults[pos];
        fault.remaining -= 1;
        let error = fault.error.clone();
        if fault.remaining == 0 {
            self.faults.remove(pos);
        }
        Err(error)
    }

    fn allocate_mac(&mut self) -> String {
        self.next_mac += 1;
        let n = self.next_mac;
        format!(
            "fa:16:3e:{:02x}:{:02x}:{:02x}",
            (n >> 16) & 0xff,
            (n >> 8) & 0xff,
            n & 0xff
        )
    }

    fn allocate_dynamic_ip(&mut self) -> IpAddr {
        self.next_dynamic_ip += 1;
        let n = self.next_dynamic_ip;
        IpAddr::V4(Ipv4Addr::new(172, 16, ((n >> 8) & 0xff) as u8, (n & 0xff) as u8))
    }

    /// Removes a server with its ports, floating IP binding and boot volume.
    fn destroy_server(&mut self, vm_id: &str) -> Option<Server> {
        let server = self.servers.remove(vm_id)?;
        self.ports.retain(|_, port| port.device_id != vm_id);
        if let Some(ip) = server.floating_ip {
            if let Some(holder) = self.floating_ips.get_mut(&ip) {
                *holder = None;
            }
        }
        for attachment in &server.attachments {
            if server.boot_volume.as_deref() == Some(attachment.volume_id.as_str()) {
                self.volumes.remove(&attachment.volume_id);
            } else if let Some(volume) = self.volumes.get_mut(&attachment.volume_id) {
                volume.attached_to = None;
            }
        }
        Some(server)
    }

    fn details(&self, vm_id: &str, server: &Server) -> ServerDetails {
        let mut addresses: Vec<NetworkInterface> = self
            .ports
            .values()
            .filter(|port| port.device_id == vm_id)
            .map(|port| NetworkInterface {
                net_id: port.net_id.clone(),
                addr: port.ip,
                mac_addr: port.mac.clone(),
                address_type: "fixed".to_owned(),
            })
            .collect();
        if let Some(ip) = server.floating_ip {
            if let Some(first) = addresses.first().cloned() {
                addresses.push(NetworkInterface {
                    addr: ip,
                    address_type: "floating".to_owned(),
                    ..first
                });
            }
        }
        ServerDetails {
            id: vm_id.to_owned(),
            name: server.name.clone(),
            state: server.state,
            addresses,
            volume_attachments: server.attachments.clone(),
            config_drive: server.config_drive,
            metadata: server.metadata.clone(),
        }
    }
}

struct Shared {
    state: Mutex<CloudState>,
    registry: InMemoryRegistry,
}

/// Shared simulated provider environment.
///
/// Cloning is cheap; clones observe the same state.
#[derive(Clone)]
pub struct SimulatedCloud {
    shared: Arc<Shared>,
}

impl SimulatedCloud {
    pub fn builder() -> SimulatedCloudBuilder {
        SimulatedCloudBuilder::default()
    }

    /// Builds an environment holding every flavor, network, floating IP and
    /// volume type the session config refers to.
    pub fn from_config(config: &IntegrationConfig) -> Self {
        let mut builder = Self::builder()
            .flavor(&config.cloud.instance_type, DEFAULT_ROOT_DISK_GB)
            .flavor(&config.cloud.instance_type_with_no_root_disk, 0)
            .network(&config.network.net_id)
            .network(&config.network.net_id_no_dhcp_1)
            .network(&config.network.net_id_no_dhcp_2)
            .volume_type(&config.cloud.volume_type);
        if let Ok(ip) = config.network.floating_ip.parse() {
            builder = builder.floating_ip(ip);
        }
        builder.build()
    }

    /// Makes the next `times` calls of `operation` fail with `error`.
    pub async fn inject_fault(&self, operation: CpiOperation, error: CpiError, times: u32) {
        if times == 0 {
            return;
        }
        self.shared.state.lock().await.faults.push(Fault {
            operation,
            error,
            remaining: times,
        });
    }

    /// Backend calls received so far, in order.
    pub async fn calls(&self) -> Vec<CpiCall> {
        self.shared.state.lock().await.calls.clone()
    }

    /// Removes a resource without going through the backend contract.
    ///
    /// Returns whether the resource existed.
    pub async fn expunge(&self, handle: &ResourceHandle) -> bool {
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;
        match handle.kind {
            ResourceKind::Vm => state.destroy_server(&handle.id).is_some(),
            ResourceKind::Disk => {
                let removed = state.volumes.remove(&handle.id);
                if let Some(vm_id) = removed.as_ref().and_then(|v| v.attached_to.as_deref()) {
                    if let Some(server) = state.servers.get_mut(vm_id) {
                        server.attachments.retain(|a| a.volume_id != handle.id);
                    }
                }
                removed.is_some()
            }
            ResourceKind::Snapshot => state.snapshots.remove(&handle.id).is_some(),
            ResourceKind::Stemcell => state.images.remove(heavy_image_id(&handle.id)),
        }
    }
}

/// Builder for [`SimulatedCloud`].
#[derive(Default)]
pub struct SimulatedCloudBuilder {
    state: CloudState,
}

impl SimulatedCloudBuilder {
    pub fn image(mut self, image_id: impl Into<String>) -> Self {
        self.state.images.insert(image_id.into());
        self
    }

    pub fn flavor(mut self, name: impl Into<String>, root_disk_gb: u32) -> Self {
        self.state
            .flavors
            .insert(name.into(), Flavor { root_disk_gb });
        self
    }

    pub fn network(mut self, net_id: impl Into<String>) -> Self {
        self.state.networks.insert(net_id.into());
        self
    }

    pub fn floating_ip(mut self, ip: IpAddr) -> Self {
        self.state.floating_ips.insert(ip, None);
        self
    }

    pub fn volume_type(mut self, name: impl Into<String>) -> Self {
        self.state.volume_types.insert(name.into());
        self
    }

    pub fn build(self) -> SimulatedCloud {
        SimulatedCloud {
            shared: Arc::new(Shared {
                state: Mutex::new(self.state),
                registry: InMemoryRegistry::new(),
            }),
        }
    }
}

impl CloudProvider for SimulatedCloud {
    type Cpi = SimulatedCpi;
    type Registry = InMemoryRegistry;

    fn cpi(&self, options: &CpiOptions) -> SimulatedCpi {
        SimulatedCpi {
            shared: Arc::clone(&self.shared),
            options: options.clone(),
        }
    }

    fn registry(&self) -> &InMemoryRegistry {
        &self.shared.registry
    }
}

impl CloudInspector for SimulatedCloud {
    async fn server(&self, vm_id: &str) -> Result<Option<ServerDetails>, CpiError> {
        let state = self.shared.state.lock().await;
        Ok(state
            .servers
            .get(vm_id)
            .map(|server| state.details(vm_id, server)))
    }

    async fn servers(&self) -> Result<Vec<ServerSummary>, CpiError> {
        let state = self.shared.state.lock().await;
        Ok(state
            .servers
            .iter()
            .map(|(id, server)| ServerSummary {
                id: id.clone(),
                private_ip: state
                    .ports
                    .values()
                    .find(|port| &port.device_id == id)
                    .map(|port| port.ip),
                state: server.state,
            })
            .collect())
    }

    async fn volume_metadata(&self, disk_id: &str) -> Result<Option<Metadata>, CpiError> {
        let state = self.shared.state.lock().await;
        Ok(state.volumes.get(disk_id).map(|v| v.metadata.clone()))
    }

    async fn ports_for_device(&self, device_id: &str) -> Result<Vec<String>, CpiError> {
        let state = self.shared.state.lock().await;
        Ok(state
            .ports
            .iter()
            .filter(|(_, port)| port.device_id == device_id)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn port_exists(&self, port_id: &str) -> Result<bool, CpiError> {
        Ok(self.shared.state.lock().await.ports.contains_key(port_id))
    }

    async fn resource_counts(&self) -> Result<ResourceCounts, CpiError> {
        let state = self.shared.state.lock().await;
        Ok(ResourceCounts {
            vms: state.servers.len(),
            disks: state.volumes.len(),
            snapshots: state.snapshots.len(),
            ports: state.ports.len(),
        })
    }

    async fn network_api_security_group_lookups(&self) -> Result<u64, CpiError> {
        Ok(self.shared.state.lock().await.security_group_lookups)
    }
}

/// Per-run CPI over a [`SimulatedCloud`].
pub struct SimulatedCpi {
    shared: Arc<Shared>,
    options: CpiOptions,
}

impl CloudBackend for SimulatedCpi {
    async fn create_stemcell(
        &self,
        image_path: &str,
        cloud_properties: &StemcellCloudProperties,
    ) -> Result<String, CpiError> {
        let mut state = self.shared.state.lock().await;
        state.begin(CpiOperation::CreateStemcell, image_path)?;
        if let Some(image_id) = &cloud_properties.image_id {
            if !state.images.contains(image_id) {
                return Err(CpiError::Cloud(format!(
                    "Image '{image_id}' could not be found"
                )));
            }
            return Ok(light_stemcell_id(image_id));
        }
        if image_path.is_empty() {
            return Err(CpiError::Cloud("stemcell image path is empty".to_owned()));
        }
        let image_id = format!("img-{}", Uuid::new_v4());
        state.images.insert(image_id.clone());
        Ok(image_id)
    }

    async fn delete_stemcell(&self, stemcell_id: &str) -> Result<(), CpiError> {
        let mut state = self.shared.state.lock().await;
        state.begin(CpiOperation::DeleteStemcell, stemcell_id)?;
        if stemcell_id.ends_with(LIGHT_STEMCELL_SUFFIX) {
            debug!(stemcell_id, "light stemcell, image left in place");
            return Ok(());
        }
        if !state.images.remove(stemcell_id) {
            return Err(CpiError::not_found(ResourceKind::Stemcell, stemcell_id));
        }
        Ok(())
    }

    async fn create_vm(
        &self,
        agent_id: &str,
        stemcell_id: &str,
        resource_pool: &ResourcePool,
        networks: &NetworkSpec,
        disk_locality: &[String],
        env: &AgentEnv,
    ) -> Result<String, CpiError> {
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;
        state.begin(CpiOperation::CreateVm, agent_id)?;

        let image_id = heavy_image_id(stemcell_id);
        if !state.images.contains(image_id) {
            return Err(CpiError::Cloud(format!(
                "Image '{image_id}' could not be found"
            )));
        }

        let flavor_name = &resource_pool.instance_type;
        let root_disk_gb = state
            .flavors
            .get(flavor_name)
            .map(|f| f.root_disk_gb)
            .ok_or_else(|| CpiError::Cloud(format!("Flavor '{flavor_name}' not found")))?;
        // a zero root disk only matters for boot-from-volume
        if self.options.boot_from_volume
            && root_disk_gb == 0
            && resource_pool.root_disk.is_none()
        {
            return Err(CpiError::Cloud(format!(
                "Flavor '{flavor_name}' has a root disk size of 0. \
                 Either pick a different flavor or define root_disk.size in your VM cloud_properties"
            )));
        }

        if !self.options.use_nova_networking {
            state.security_group_lookups += 1;
        }

        for (_, network) in networks.private_networks() {
            let net_id = network.net_id().unwrap_or_default();
            if !state.networks.contains(net_id) {
                return Err(CpiError::VmCreationFailed(format!(
                    "network with id '{net_id}' could not be found"
                )));
            }
            if let Some(ip) = network.ip() {
                if state.ports.values().any(|p| p.ip == ip && p.net_id == net_id) {
                    return Err(CpiError::VmCreationFailed(format!(
                        "IP address '{ip}' is already in use on network '{net_id}'"
                    )));
                }
            }
        }

        if !disk_locality.is_empty() {
            debug!(?disk_locality, "disk locality requested");
        }

        let vm_id = format!("vm-{}", Uuid::new_v4());
        let mut network_settings = BTreeMap::new();
        for (name, network) in networks.private_networks() {
            let ip = match network.ip() {
                Some(ip) => ip,
                None => state.allocate_dynamic_ip(),
            };
            let mac = state.allocate_mac();
            state.ports.insert(
                format!("port-{}", Uuid::new_v4()),
                Port {
                    device_id: vm_id.clone(),
                    net_id: network.net_id().unwrap_or_default().to_owned(),
                    ip,
                    mac: mac.clone(),
                },
            );
            network_settings.insert(
                name.to_owned(),
                NetworkSettings {
                    kind: network.kind().as_str().to_owned(),
                    ip: Some(ip),
                    mac: Some(mac),
                    use_dhcp: network.use_dhcp().unwrap_or(self.options.use_dhcp),
                },
            );
        }

        let mut server = Server {
            name: vm_id.clone(),
            state: ServerState::Active,
            floating_ip: None,
            attachments: Vec::new(),
            boot_volume: None,
            config_drive: self.options.config_drive,
            metadata: Metadata::new(),
            availability_zone: resource_pool.availability_zone.clone(),
        };

        if self.options.boot_from_volume {
            let volume_id = format!("vol-{}", Uuid::new_v4());
            let size_gb = resource_pool.root_disk.map_or(root_disk_gb, |r| r.size);
            state.volumes.insert(
                volume_id.clone(),
                Volume {
                    size_mb: size_gb * 1024,
                    volume_type: None,
                    metadata: Metadata::new(),
                    attached_to: Some(vm_id.clone()),
                    availability_zone: resource_pool.availability_zone.clone(),
                },
            );
            server.attachments.push(VolumeAttachment {
                volume_id: volume_id.clone(),
                device: BOOT_VOLUME_DEVICE.to_owned(),
            });
            server.boot_volume = Some(volume_id);
        }

        let vip = networks
            .vip()
            .and_then(|(name, network)| network.ip().map(|ip| (name.to_owned(), ip)));
        if let Some((name, ip)) = vip {
            if !state.floating_ips.contains_key(&ip) {
                // the server already booted; it goes to error and is cleaned up
                server.state = ServerState::Error;
                state.servers.insert(vm_id.clone(), server);
                state.destroy_server(&vm_id);
                return Err(CpiError::VmCreationFailed(format!(
                    "Floating IP '{ip}' not allocated"
                )));
            }
            let previous = state
                .floating_ips
                .insert(ip, Some(vm_id.clone()))
                .flatten();
            if let Some(previous) = previous {
                if let Some(holder) = state.servers.get_mut(&previous) {
                    holder.floating_ip = None;
                }
            }
            server.floating_ip = Some(ip);
            network_settings.insert(
                name,
                NetworkSettings {
                    kind: NetworkKind::Vip.as_str().to_owned(),
                    ip: Some(ip),
                    mac: None,
                    use_dhcp: false,
                },
            );
        }

        state.servers.insert(vm_id.clone(), server);
        drop(guard);

        let settings = AgentSettings {
            agent_id: agent_id.to_owned(),
            vm_name: vm_id.clone(),
            networks: network_settings,
            persistent_disks: BTreeMap::new(),
            env: env.clone(),
        };
        self.shared.registry.update_settings(&vm_id, settings).await?;
        Ok(vm_id)
    }

    async fn delete_vm(&self, vm_id: &str) -> Result<(), CpiError> {
        {
            let mut state = self.shared.state.lock().await;
            state.begin(CpiOperation::DeleteVm, vm_id)?;
            if state.destroy_server(vm_id).is_none() {
                return Err(CpiError::not_found(ResourceKind::Vm, vm_id));
            }
        }
        self.shared.registry.delete_settings(vm_id).await
    }

    async fn has_vm(&self, vm_id: &str) -> Result<bool, CpiError> {
        let mut state = self.shared.state.lock().await;
        state.begin(CpiOperation::HasVm, vm_id)?;
        Ok(state.servers.contains_key(vm_id))
    }

    async fn set_vm_metadata(&self, vm_id: &str, metadata: &Metadata) -> Result<(), CpiError> {
        let mut state = self.shared.state.lock().await;
        state.begin(CpiOperation::SetVmMetadata, vm_id)?;
        let server = state
            .servers
            .get_mut(vm_id)
            .ok_or_else(|| CpiError::not_found(ResourceKind::Vm, vm_id))?;
        server
            .metadata
            .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        if self.options.human_readable_vm_names {
            if let Some(name) = metadata.get("name") {
                server.name = name.clone();
            }
        }
        Ok(())
    }

    async fn create_disk(
        &self,
        size_mb: u32,
        cloud_properties: &DiskCloudProperties,
        vm_id: Option<&str>,
    ) -> Result<String, CpiError> {
        let mut state = self.shared.state.lock().await;
        state.begin(CpiOperation::CreateDisk, vm_id.unwrap_or_default())?;
        if size_mb < MIN_DISK_SIZE_MB {
            return Err(CpiError::Cloud(format!(
                "Minimum disk size is 1 GiB, requested {size_mb} MiB"
            )));
        }
        if let Some(volume_type) = &cloud_properties.volume_type {
            if !state.volume_types.contains(volume_type) {
                return Err(CpiError::Cloud(format!(
                    "Volume type '{volume_type}' could not be found"
                )));
            }
        }
        let availability_zone = match vm_id {
            Some(vm_id) => state
                .servers
                .get(vm_id)
                .ok_or_else(|| CpiError::not_found(ResourceKind::Vm, vm_id))?
                .availability_zone
                .clone(),
            None => None,
        };
        let disk_id = format!("vol-{}", Uuid::new_v4());
        state.volumes.insert(
            disk_id.clone(),
            Volume {
                size_mb,
                volume_type: cloud_properties.volume_type.clone(),
                metadata: Metadata::new(),
                attached_to: None,
                availability_zone,
            },
        );
        Ok(disk_id)
    }

    async fn has_disk(&self, disk_id: &str) -> Result<bool, CpiError> {
        let mut state = self.shared.state.lock().await;
        state.begin(CpiOperation::HasDisk, disk_id)?;
        Ok(state.volumes.contains_key(disk_id))
    }

    async fn delete_disk(&self, disk_id: &str) -> Result<(), CpiError> {
        let mut state = self.shared.state.lock().await;
        state.begin(CpiOperation::DeleteDisk, disk_id)?;
        let volume = state
            .volumes
            .get(disk_id)
            .ok_or_else(|| CpiError::not_found(ResourceKind::Disk, disk_id))?;
        if let Some(vm_id) = &volume.attached_to {
            return Err(CpiError::Cloud(format!(
                "Volume '{disk_id}' is still attached to VM '{vm_id}'"
            )));
        }
        if state.snapshots.values().any(|s| s.disk_id == disk_id) {
            return Err(CpiError::Cloud(format!(
                "Volume '{disk_id}' still has dependent snapshots"
            )));
        }
        state.volumes.remove(disk_id);
        Ok(())
    }

    async fn attach_disk(&self, vm_id: &str, disk_id: &str) -> Result<(), CpiError> {
        let device = {
            let mut guard = self.shared.state.lock().await;
            let state = &mut *guard;
            state.begin(CpiOperation::AttachDisk, disk_id)?;
            let server = state
                .servers
                .get_mut(vm_id)
                .ok_or_else(|| CpiError::not_found(ResourceKind::Vm, vm_id))?;
            let volume = state
                .volumes
                .get_mut(disk_id)
                .ok_or_else(|| CpiError::not_found(ResourceKind::Disk, disk_id))?;
            match volume.attached_to.as_deref() {
                Some(current) if current == vm_id => return Ok(()),
                Some(other) => {
                    return Err(CpiError::Cloud(format!(
                        "Volume '{disk_id}' is already attached to VM '{other}'"
                    )));
                }
                None => {}
            }
            let device = (b'b'..=b'z')
                .map(|c| format!("/dev/vd{}", c as char))
                .find(|d| !server.attachments.iter().any(|a| &a.device == d))
                .ok_or_else(|| {
                    CpiError::Cloud(format!("no free device name left on VM '{vm_id}'"))
                })?;
            for key in DISK_METADATA_WHITELIST {
                if let Some(value) = server.metadata.get(key) {
                    volume.metadata.insert(key.to_owned(), value.clone());
                }
            }
            volume.attached_to = Some(vm_id.to_owned());
            server.attachments.push(VolumeAttachment {
                volume_id: disk_id.to_owned(),
                device: device.clone(),
            });
            device
        };

        if let Some(mut settings) = self.shared.registry.read_settings(vm_id).await? {
            settings.persistent_disks.insert(disk_id.to_owned(), device);
            self.shared.registry.update_settings(vm_id, settings).await?;
        }
        Ok(())
    }

    async fn detach_disk(&self, vm_id: &str, disk_id: &str) -> Result<(), CpiError> {
        {
            let mut guard = self.shared.state.lock().await;
            let state = &mut *guard;
            state.begin(CpiOperation::DetachDisk, disk_id)?;
            let server = state
                .servers
                .get_mut(vm_id)
                .ok_or_else(|| CpiError::not_found(ResourceKind::Vm, vm_id))?;
            let pos = server
                .attachments
                .iter()
                .position(|a| a.volume_id == disk_id)
                .ok_or_else(|| CpiError::not_found(ResourceKind::Disk, disk_id))?;
            server.attachments.remove(pos);
            if let Some(volume) = state.volumes.get_mut(disk_id) {
                volume.attached_to = None;
            }
        }

        if let Some(mut settings) = self.shared.registry.read_settings(vm_id).await? {
            settings.persistent_disks.remove(disk_id);
            self.shared.registry.update_settings(vm_id, settings).await?;
        }
        Ok(())
    }

    async fn snapshot_disk(&self, disk_id: &str, metadata: &Metadata) -> Result<String, CpiError> {
        let mut state = self.shared.state.lock().await;
        state.begin(CpiOperation::SnapshotDisk, disk_id)?;
        let volume = state
            .volumes
            .get(disk_id)
            .ok_or_else(|| CpiError::not_found(ResourceKind::Disk, disk_id))?;
        debug!(
            disk_id,
            size_mb = volume.size_mb,
            volume_type = ?volume.volume_type,
            availability_zone = ?volume.availability_zone,
            "snapshotting volume"
        );
        let snapshot_id = format!("snap-{}", Uuid::new_v4());
        state.snapshots.insert(
            snapshot_id.clone(),
            Snapshot {
                disk_id: disk_id.to_owned(),
                metadata: metadata.clone(),
            },
        );
        Ok(snapshot_id)
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CpiError> {
        let mut state = self.shared.state.lock().await;
        state.begin(CpiOperation::DeleteSnapshot, snapshot_id)?;
        let snapshot = state
            .snapshots
            .remove(snapshot_id)
            .ok_or_else(|| CpiError::not_found(ResourceKind::Snapshot, snapshot_id))?;
        debug!(
            snapshot_id,
            disk_id = %snapshot.disk_id,
            tags = snapshot.metadata.len(),
            "snapshot deleted"
        );
        Ok(())
    }
}
