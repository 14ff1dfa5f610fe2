//! 시나리오 매트릭스
//!
//! 시나리오 하나는 절차([`Procedure`])와 축(네트워크 토폴로지, 부팅 소스,
//! config drive, 디스크 모드, 디스크 cloud properties, 유도된 장애)의 조합,
//! 실행 중/후 확인할 [`Expectation`] 목록, 그리고 기대 결과로 이루어집니다.
//!
//! [`ScenarioMatrix::standard`]는 세션 설정으로부터 전체 표를 만듭니다.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;

use lifecheck_core::config::{IntegrationConfig, NetworkConfig};
use lifecheck_core::error::NetworkSpecError;
use lifecheck_core::network::{Network, NetworkSpec};
use lifecheck_core::types::{DiskCloudProperties, ResourcePool};

use crate::config::LifecycleConfig;
use crate::cpi::{BOOT_VOLUME_DEVICE, ConfigDrive, CpiOptions};
use crate::error::{ErrorClass, LifecycleError};
use crate::provisioner::{JOB_NAME, standard_vm_metadata};

/// 네트워크 ID 오류 시나리오에서 쓰는 존재하지 않는 ID
pub const UNKNOWN_NET_ID: &str = "00000000-0000-0000-0000-000000000000";

/// 풀에 없는 floating IP
pub const UNALLOCATED_FLOATING_IP: IpAddr = IpAddr::V4(std::net::Ipv4Addr::BROADCAST);

/// light 스템셀 시나리오에서 쓰는 존재하지 않는 이미지
pub const MISSING_IMAGE_ID: &str = "non-existing-id";

/// 네트워크 토폴로지
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topology {
    SingleDynamic,
    SingleManual,
    DynamicVip,
    ManualVip,
    /// DHCP 없는 manual 네트워크 두 개, 두 번째는 `use_dhcp: false`
    MultiManualMixedDhcp,
    /// 존재하지 않는 net_id를 가진 dynamic 네트워크
    InvalidNetId(String),
}

impl Topology {
    /// 세션 네트워크 설정으로 네트워크 스펙을 구성합니다.
    pub fn networks(&self, net: &NetworkConfig) -> Result<NetworkSpec, NetworkSpecError> {
        match self {
            Self::SingleDynamic => NetworkSpec::new([("default", Network::dynamic(&net.net_id))]),
            Self::SingleManual => NetworkSpec::new([(
                "default",
                Network::manual(parse_ip("default", &net.manual_ip)?, &net.net_id),
            )]),
            Self::DynamicVip => NetworkSpec::new([
                ("default", Network::dynamic(&net.net_id)),
                ("vip_network", Network::vip(parse_ip("vip_network", &net.floating_ip)?)),
            ]),
            Self::ManualVip => NetworkSpec::new([
                (
                    "default",
                    Network::manual(parse_ip("default", &net.manual_ip)?, &net.net_id),
                ),
                ("vip_network", Network::vip(parse_ip("vip_network", &net.floating_ip)?)),
            ]),
            Self::MultiManualMixedDhcp => NetworkSpec::new([
                (
                    "network_1",
                    Network::manual(
                        parse_ip("network_1", &net.no_dhcp_manual_ip_1)?,
                        &net.net_id_no_dhcp_1,
                    ),
                ),
                (
                    "network_2",
                    Network::manual(
                        parse_ip("network_2", &net.no_dhcp_manual_ip_2)?,
                        &net.net_id_no_dhcp_2,
                    )
                    .with_use_dhcp(false),
                ),
            ]),
            Self::InvalidNetId(net_id) => NetworkSpec::new([("default", Network::dynamic(net_id))]),
        }
    }
}

fn parse_ip(network: &str, ip: &str) -> Result<IpAddr, NetworkSpecError> {
    ip.parse().map_err(|_| NetworkSpecError::InvalidIp {
        network: network.to_owned(),
        ip: ip.to_owned(),
    })
}

/// 부팅 소스
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BootSource {
    #[default]
    Image,
    /// 부팅 볼륨, 선택적으로 `root_disk.size` (GiB) 지정
    Volume { root_disk_gb: Option<u32> },
}

/// 디스크 모드
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DiskMode {
    /// VM 옆에 새 디스크
    #[default]
    Fresh,
    /// 임시 VM으로 미리 만들어 둔 분리된 디스크
    PreExisting,
}

/// 디스크 cloud properties
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DiskProperties {
    #[default]
    Default,
    VolumeType(String),
}

impl DiskProperties {
    pub fn cloud_properties(&self) -> DiskCloudProperties {
        match self {
            Self::Default => DiskCloudProperties::default(),
            Self::VolumeType(volume_type) => DiskCloudProperties::with_volume_type(volume_type),
        }
    }
}

/// 유도된 장애
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// vip 네트워크를 풀에 없는 floating IP로 교체
    UnallocatedFloatingIp(IpAddr),
    /// 루트 디스크 0 flavor 사용
    ZeroRootDiskFlavor(String),
    /// 라이프사이클의 분리 단계 전에 디스크를 미리 분리
    DiskAlreadyDetached,
}

/// light 스템셀이 참조하는 이미지
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightImage {
    /// 세션 스템셀 이미지
    Existing,
    /// 존재하지 않는 이미지
    Missing,
}

/// 시나리오 절차
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Procedure {
    /// 전체 `vm_lifecycle`
    #[default]
    Lifecycle,
    /// VM 생성, 실행 중 확인, 정리
    CreateVm,
    /// VM 메타데이터 설정 후 디스크 연결, 디스크 메타데이터 확인
    AttachMetadataDisk,
    /// 연결되지 않은 디스크 분리가 에러 없이 끝나야 함
    DetachUnattachedDisk,
    /// light 스템셀 생성
    LightStemcell(LightImage),
    /// light 스템셀로 전체 라이프사이클
    LightStemcellLifecycle,
}

/// 확인 시점
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    VmReady,
    DiskAttached,
    AfterTeardown,
}

/// 시나리오 확인 항목
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    NoResidualResources,
    DiskMetadataWhitelist,
    MacAddressesMatchRegistry,
    PortsReleased,
    BootVolumeAt(String),
    VmNamedFromMetadata(String),
    NoActiveVmWithIp(IpAddr),
    NoNetworkApiSecurityGroupLookups,
    ConfigDriveAttached,
}

impl Expectation {
    /// 이 항목을 확인하는 시점
    ///
    /// `PortsReleased`는 VM이 살아 있을 때 포트를 기록하고 해체 후 확인합니다.
    pub fn stage(&self) -> Stage {
        match self {
            Self::MacAddressesMatchRegistry
            | Self::BootVolumeAt(_)
            | Self::VmNamedFromMetadata(_)
            | Self::NoNetworkApiSecurityGroupLookups
            | Self::ConfigDriveAttached => Stage::VmReady,
            Self::DiskMetadataWhitelist => Stage::DiskAttached,
            Self::NoResidualResources | Self::PortsReleased | Self::NoActiveVmWithIp(_) => {
                Stage::AfterTeardown
            }
        }
    }
}

/// 기대 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedOutcome {
    Success,
    /// 주어진 분류의 실패, 메시지에 `fragment` 포함
    Failure { class: ErrorClass, fragment: String },
}

impl ExpectedOutcome {
    pub fn failure(class: ErrorClass, fragment: impl Into<String>) -> Self {
        Self::Failure {
            class,
            fragment: fragment.into(),
        }
    }

    /// 실행 결과가 기대와 일치하는지 여부
    pub fn matches(&self, result: &Result<(), LifecycleError>) -> bool {
        match (self, result) {
            (Self::Success, Ok(())) => true,
            (Self::Failure { class, fragment }, Err(err)) => {
                err.class() == *class && err.to_string().contains(fragment.as_str())
            }
            _ => false,
        }
    }
}

impl fmt::Display for ExpectedOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failure { class, fragment } => write!(f, "{class} containing '{fragment}'"),
        }
    }
}

/// 시나리오별 CPI 옵션 토글
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScenarioOptions {
    pub use_dhcp: bool,
    pub human_readable_vm_names: bool,
    pub use_nova_networking: bool,
}

impl Default for ScenarioOptions {
    fn default() -> Self {
        Self {
            use_dhcp: true,
            human_readable_vm_names: false,
            use_nova_networking: false,
        }
    }
}

/// 시나리오 하나
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scenario {
    pub name: String,
    pub procedure: Procedure,
    pub topology: Topology,
    pub boot: BootSource,
    pub config_drive: Option<ConfigDrive>,
    pub disk_mode: DiskMode,
    pub disk_properties: DiskProperties,
    pub fault: Option<Fault>,
    pub options: ScenarioOptions,
    /// 실행 전에 floating IP를 쥔 VM을 하나 만들어 둠
    pub floating_ip_holder: bool,
    pub expectations: Vec<Expectation>,
    pub expected: ExpectedOutcome,
}

impl Scenario {
    /// 기본 축과 `NoResidualResources` 확인을 가진 시나리오
    pub fn new(name: impl Into<String>, procedure: Procedure, topology: Topology) -> Self {
        Self {
            name: name.into(),
            procedure,
            topology,
            boot: BootSource::default(),
            config_drive: None,
            disk_mode: DiskMode::default(),
            disk_properties: DiskProperties::default(),
            fault: None,
            options: ScenarioOptions::default(),
            floating_ip_holder: false,
            expectations: vec![Expectation::NoResidualResources],
            expected: ExpectedOutcome::Success,
        }
    }

    pub fn with_boot(mut self, boot: BootSource) -> Self {
        self.boot = boot;
        self
    }

    pub fn with_config_drive(mut self, drive: Option<ConfigDrive>) -> Self {
        self.config_drive = drive;
        self
    }

    pub fn with_disk_mode(mut self, mode: DiskMode) -> Self {
        self.disk_mode = mode;
        self
    }

    pub fn with_disk_properties(mut self, properties: DiskProperties) -> Self {
        self.disk_properties = properties;
        self
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = Some(fault);
        self
    }

    pub fn with_options(mut self, options: ScenarioOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_floating_ip_holder(mut self) -> Self {
        self.floating_ip_holder = true;
        self
    }

    pub fn expect(mut self, expectation: Expectation) -> Self {
        self.expectations.push(expectation);
        self
    }

    pub fn expect_failure(mut self, class: ErrorClass, fragment: impl Into<String>) -> Self {
        self.expected = ExpectedOutcome::failure(class, fragment);
        self
    }

    /// 주어진 시점에 확인할 항목들
    pub fn expectations_at(&self, stage: Stage) -> impl Iterator<Item = &Expectation> {
        self.expectations.iter().filter(move |e| e.stage() == stage)
    }

    /// 이 시나리오에 쓸 CPI 옵션을 반영한 실행 설정
    pub fn lifecycle_config(&self, base: &LifecycleConfig) -> LifecycleConfig {
        LifecycleConfig {
            cpi: CpiOptions {
                boot_from_volume: matches!(self.boot, BootSource::Volume { .. }),
                config_drive: self.config_drive,
                use_dhcp: self.options.use_dhcp,
                human_readable_vm_names: self.options.human_readable_vm_names,
                use_nova_networking: self.options.use_nova_networking,
            },
            ..base.clone()
        }
    }

    /// 장애와 부팅 소스를 반영한 resource pool
    pub fn resource_pool(&self, base: &LifecycleConfig) -> ResourcePool {
        let mut pool = base.resource_pool();
        if let Some(Fault::ZeroRootDiskFlavor(flavor)) = &self.fault {
            pool.instance_type = flavor.clone();
        }
        if let BootSource::Volume {
            root_disk_gb: Some(size),
        } = self.boot
        {
            pool = pool.with_root_disk_size(size);
        }
        pool
    }

    /// 토폴로지와 장애를 반영한 네트워크 스펙
    pub fn networks(&self, net: &NetworkConfig) -> Result<NetworkSpec, NetworkSpecError> {
        let spec = self.topology.networks(net)?;
        match &self.fault {
            Some(Fault::UnallocatedFloatingIp(ip)) => {
                let name = spec
                    .vip()
                    .map(|(name, _)| name.to_owned())
                    .unwrap_or_else(|| "vip".to_owned());
                spec.with_network(name, Network::vip(*ip))
            }
            _ => Ok(spec),
        }
    }

    pub fn disk_cloud_properties(&self) -> DiskCloudProperties {
        self.disk_properties.cloud_properties()
    }
}

/// 시나리오 표
#[derive(Debug, Clone, Default)]
pub struct ScenarioMatrix {
    scenarios: Vec<Scenario>,
}

impl ScenarioMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// 시나리오를 추가합니다. 이름이 겹치면 거부합니다.
    pub fn push(&mut self, scenario: Scenario) -> Result<(), LifecycleError> {
        if self.scenarios.iter().any(|s| s.name == scenario.name) {
            return Err(LifecycleError::Config {
                field: "scenario.name".to_owned(),
                reason: format!("duplicate scenario '{}'", scenario.name),
            });
        }
        self.scenarios.push(scenario);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Scenario> {
        self.scenarios.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Scenario> {
        self.scenarios.iter().find(|s| s.name == name)
    }

    /// 이름이 주어진 집합에 속하는 시나리오만 남깁니다.
    pub fn retain_named(&mut self, names: &HashSet<&str>) {
        self.scenarios.retain(|s| names.contains(s.name.as_str()));
    }

    /// 세션 설정으로 전체 표를 만듭니다.
    ///
    /// # Errors
    ///
    /// `cloud.config_drive`나 `network.manual_ip`를 해석할 수 없으면 에러.
    pub fn standard(config: &IntegrationConfig) -> Result<Self, LifecycleError> {
        use Procedure::*;
        use Topology::*;

        let configured_drive = ConfigDrive::parse(&config.cloud.config_drive)?;
        let manual_ip = parse_ip("default", &config.network.manual_ip)?;
        let zero_root_flavor = config.cloud.instance_type_with_no_root_disk.clone();
        let metadata_name = standard_vm_metadata()
            .get("name")
            .cloned()
            .unwrap_or_else(|| format!("{JOB_NAME}/instance_id"));

        let scenarios = [
            // dynamic network
            Scenario::new("dynamic_vip_reassigns_floating_ip", Lifecycle, DynamicVip)
                .with_floating_ip_holder(),
            Scenario::new("dynamic_existing_disk", Lifecycle, SingleDynamic)
                .with_disk_mode(DiskMode::PreExisting),
            Scenario::new("dynamic_human_readable_vm_name", CreateVm, SingleDynamic)
                .with_options(ScenarioOptions {
                    human_readable_vm_names: true,
                    ..Default::default()
                })
                .expect(Expectation::VmNamedFromMetadata(metadata_name)),
            Scenario::new("dynamic_attach_disk_copies_metadata", AttachMetadataDisk, SingleDynamic)
                .expect(Expectation::DiskMetadataWhitelist),
            Scenario::new("dynamic_disk_detached_out_of_band", Lifecycle, SingleDynamic)
                .with_fault(Fault::DiskAlreadyDetached),
            // manual network
            Scenario::new("manual_fresh_disk", Lifecycle, SingleManual),
            Scenario::new("manual_existing_disk", Lifecycle, SingleManual)
                .with_disk_mode(DiskMode::PreExisting),
            Scenario::new("manual_vip", Lifecycle, ManualVip),
            Scenario::new("manual_multiple_networks_config_drive", CreateVm, MultiManualMixedDhcp)
                .with_config_drive(Some(ConfigDrive::Cdrom))
                .with_options(ScenarioOptions {
                    use_dhcp: false,
                    ..Default::default()
                })
                .expect(Expectation::MacAddressesMatchRegistry)
                .expect(Expectation::ConfigDriveAttached)
                .expect(Expectation::PortsReleased),
            Scenario::new("manual_multiple_networks_lifecycle", Lifecycle, MultiManualMixedDhcp)
                .with_options(ScenarioOptions {
                    use_dhcp: false,
                    ..Default::default()
                })
                .expect(Expectation::MacAddressesMatchRegistry),
            // boot from volume
            Scenario::new("boot_from_volume", CreateVm, SingleManual)
                .with_boot(BootSource::Volume { root_disk_gb: None })
                .expect(Expectation::BootVolumeAt(BOOT_VOLUME_DEVICE.to_owned())),
            Scenario::new("boot_from_volume_zero_root_with_size", CreateVm, SingleManual)
                .with_boot(BootSource::Volume {
                    root_disk_gb: Some(20),
                })
                .with_fault(Fault::ZeroRootDiskFlavor(zero_root_flavor.clone()))
                .expect(Expectation::BootVolumeAt(BOOT_VOLUME_DEVICE.to_owned())),
            Scenario::new("boot_from_volume_zero_root_without_size", Lifecycle, SingleManual)
                .with_boot(BootSource::Volume { root_disk_gb: None })
                .with_fault(Fault::ZeroRootDiskFlavor(zero_root_flavor.clone()))
                .expect_failure(
                    ErrorClass::CloudError,
                    format!("Flavor '{zero_root_flavor}' has a root disk size of 0"),
                ),
            // cloud properties / config drive
            Scenario::new("disk_volume_type", Lifecycle, SingleDynamic).with_disk_properties(
                DiskProperties::VolumeType(config.cloud.volume_type.clone()),
            ),
            Scenario::new("config_drive_from_config", Lifecycle, SingleDynamic)
                .with_config_drive(configured_drive)
                .expect(Expectation::ConfigDriveAttached),
            // vm creation failures
            Scenario::new("unallocated_floating_ip_cleans_up_vm", CreateVm, SingleManual)
                .with_fault(Fault::UnallocatedFloatingIp(UNALLOCATED_FLOATING_IP))
                .expect(Expectation::NoActiveVmWithIp(manual_ip))
                .expect_failure(
                    ErrorClass::VmCreationFailed,
                    format!("Floating IP '{UNALLOCATED_FLOATING_IP}' not allocated"),
                ),
            Scenario::new("invalid_net_id", CreateVm, InvalidNetId(UNKNOWN_NET_ID.to_owned()))
                .expect_failure(ErrorClass::VmCreationFailed, format!("'{UNKNOWN_NET_ID}'")),
            Scenario::new("detach_unattached_disk", DetachUnattachedDisk, SingleDynamic),
            Scenario::new("nova_networking_security_groups", CreateVm, SingleDynamic)
                .with_options(ScenarioOptions {
                    use_nova_networking: true,
                    ..Default::default()
                })
                .expect(Expectation::NoNetworkApiSecurityGroupLookups),
            // light stemcell
            Scenario::new(
                "light_stemcell_create",
                LightStemcell(LightImage::Existing),
                SingleDynamic,
            ),
            Scenario::new(
                "light_stemcell_missing_image",
                LightStemcell(LightImage::Missing),
                SingleDynamic,
            )
            .expect_failure(ErrorClass::CloudError, MISSING_IMAGE_ID),
            Scenario::new("light_stemcell_lifecycle", LightStemcellLifecycle, SingleDynamic),
        ];

        let mut matrix = Self::new();
        for scenario in scenarios {
            matrix.push(scenario)?;
        }
        Ok(matrix)
    }
}

impl<'a> IntoIterator for &'a ScenarioMatrix {
    type Item = &'a Scenario;
    type IntoIter = std::slice::Iter<'a, Scenario>;

    fn into_iter(self) -> Self::IntoIter {
        self.scenarios.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CpiError;
    use lifecheck_core::network::NetworkKind;

    fn standard() -> ScenarioMatrix {
        ScenarioMatrix::standard(&IntegrationConfig::default()).unwrap()
    }

    #[test]
    fn standard_matrix_covers_every_procedure() {
        let matrix = standard();
        let procedures: Vec<Procedure> = matrix.iter().map(|s| s.procedure).collect();
        for procedure in [
            Procedure::Lifecycle,
            Procedure::CreateVm,
            Procedure::AttachMetadataDisk,
            Procedure::DetachUnattachedDisk,
            Procedure::LightStemcell(LightImage::Existing),
            Procedure::LightStemcell(LightImage::Missing),
            Procedure::LightStemcellLifecycle,
        ] {
            assert!(procedures.contains(&procedure), "{procedure:?} missing");
        }
    }

    #[test]
    fn every_scenario_checks_residual_resources() {
        for scenario in &standard() {
            assert!(
                scenario
                    .expectations
                    .contains(&Expectation::NoResidualResources),
                "{}",
                scenario.name
            );
        }
    }

    #[test]
    fn duplicate_scenario_name_is_rejected() {
        let mut matrix = ScenarioMatrix::new();
        matrix
            .push(Scenario::new("a", Procedure::Lifecycle, Topology::SingleDynamic))
            .unwrap();
        let err = matrix
            .push(Scenario::new("a", Procedure::CreateVm, Topology::SingleManual))
            .unwrap_err();
        assert!(err.to_string().contains("duplicate scenario 'a'"));
        assert_eq!(matrix.len(), 1);
    }

    #[test]
    fn zero_root_failure_names_configured_flavor() {
        let matrix = standard();
        let scenario = matrix.get("boot_from_volume_zero_root_without_size").unwrap();
        let err: LifecycleError = CpiError::Cloud(
            "Flavor 'm1.zero' has a root disk size of 0. Either pick a different flavor".into(),
        )
        .into();
        assert!(scenario.expected.matches(&Err(err)));
        assert!(!scenario.expected.matches(&Ok(())));
        assert_eq!(
            scenario.resource_pool(&LifecycleConfig::default()).instance_type,
            "m1.zero"
        );
    }

    #[test]
    fn zero_root_with_size_sets_root_disk() {
        let matrix = standard();
        let scenario = matrix.get("boot_from_volume_zero_root_with_size").unwrap();
        let pool = scenario.resource_pool(&LifecycleConfig::default());
        assert_eq!(pool.root_disk.map(|r| r.size), Some(20));
        assert!(scenario.lifecycle_config(&LifecycleConfig::default()).cpi.boot_from_volume);
    }

    #[test]
    fn expected_failure_requires_matching_class() {
        let expected = ExpectedOutcome::failure(ErrorClass::VmCreationFailed, "net");
        let wrong_class: LifecycleError = CpiError::Cloud("bad net".into()).into();
        assert!(!expected.matches(&Err(wrong_class)));
        let right: LifecycleError = CpiError::VmCreationFailed("bad net".into()).into();
        assert!(expected.matches(&Err(right)));
    }

    #[test]
    fn topologies_build_valid_specs() {
        let net = NetworkConfig::default();
        assert_eq!(Topology::SingleDynamic.networks(&net).unwrap().len(), 1);
        let vip = Topology::DynamicVip.networks(&net).unwrap();
        assert_eq!(vip.vip().map(|(name, _)| name), Some("vip_network"));
        let multi = Topology::MultiManualMixedDhcp.networks(&net).unwrap();
        assert_eq!(multi.get("network_2").and_then(Network::use_dhcp), Some(false));
        assert_eq!(multi.get("network_1").and_then(Network::use_dhcp), None);
        let invalid = Topology::InvalidNetId(UNKNOWN_NET_ID.into())
            .networks(&net)
            .unwrap();
        assert_eq!(invalid.get("default").and_then(Network::net_id), Some(UNKNOWN_NET_ID));
    }

    #[test]
    fn manual_topology_rejects_bad_ip() {
        let net = NetworkConfig {
            manual_ip: "not-an-ip".to_owned(),
            ..Default::default()
        };
        let err = Topology::SingleManual.networks(&net).unwrap_err();
        assert!(matches!(err, NetworkSpecError::InvalidIp { .. }));
    }

    #[test]
    fn unallocated_floating_ip_adds_vip() {
        let net = NetworkConfig::default();
        let scenario = Scenario::new("s", Procedure::CreateVm, Topology::SingleManual)
            .with_fault(Fault::UnallocatedFloatingIp(UNALLOCATED_FLOATING_IP));
        let spec = scenario.networks(&net).unwrap();
        let (_, vip) = spec.vip().unwrap();
        assert_eq!(vip.kind(), NetworkKind::Vip);
        assert_eq!(vip.ip(), Some(UNALLOCATED_FLOATING_IP));
    }

    #[test]
    fn unallocated_floating_ip_replaces_existing_vip() {
        let net = NetworkConfig::default();
        let scenario = Scenario::new("s", Procedure::CreateVm, Topology::ManualVip)
            .with_fault(Fault::UnallocatedFloatingIp(UNALLOCATED_FLOATING_IP));
        let spec = scenario.networks(&net).unwrap();
        assert_eq!(spec.len(), 2);
        assert_eq!(
            spec.get("vip_network").and_then(Network::ip),
            Some(UNALLOCATED_FLOATING_IP)
        );
    }

    #[test]
    fn expectation_stages() {
        assert_eq!(Expectation::PortsReleased.stage(), Stage::AfterTeardown);
        assert_eq!(Expectation::DiskMetadataWhitelist.stage(), Stage::DiskAttached);
        assert_eq!(Expectation::ConfigDriveAttached.stage(), Stage::VmReady);
    }

    #[test]
    fn scenario_config_overrides_cpi_options() {
        let base = LifecycleConfig {
            disable_snapshots: true,
            ..Default::default()
        };
        let scenario = Scenario::new("s", Procedure::CreateVm, Topology::SingleDynamic)
            .with_options(ScenarioOptions {
                use_nova_networking: true,
                ..Default::default()
            });
        let config = scenario.lifecycle_config(&base);
        assert!(config.cpi.use_nova_networking);
        assert!(config.cpi.config_drive.is_none());
        assert!(config.disable_snapshots);
    }

    #[test]
    fn retain_named_filters() {
        let mut matrix = standard();
        let names: HashSet<&str> = ["manual_vip", "invalid_net_id"].into_iter().collect();
        matrix.retain_named(&names);
        assert_eq!(matrix.len(), 2);
    }
}
