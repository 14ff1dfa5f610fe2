//! 라이프사이클 검증 -- 단계 사이 사후 조건
//!
//! 존재 확인(`expect_vm_exists` 등)은 백엔드 계약만으로 판단하고,
//! [`LifecycleVerifier`]는 프로바이더 조회([`CloudInspector`])와 레지스트리를
//! 이용해 백엔드가 실제로 만든 상태를 대조합니다.
//! 모든 실패는 `LifecycleError::Verification`으로 보고됩니다.

use std::net::IpAddr;

use tracing::{debug, info};

use lifecheck_core::types::Metadata;

use crate::cpi::{
    CloudBackend, CloudInspector, ConfigDrive, DISK_METADATA_WHITELIST, ServerDetails, ServerState,
};
use crate::error::LifecycleError;
use crate::registry::AgentRegistry;

/// VM이 존재해야 합니다.
pub async fn expect_vm_exists<B: CloudBackend>(
    backend: &B,
    vm_id: &str,
) -> Result<(), LifecycleError> {
    info!(vm_id, "checking vm existence");
    if backend.has_vm(vm_id).await? {
        Ok(())
    } else {
        Err(LifecycleError::verification(
            "has_vm",
            format!("vm '{vm_id}' does not exist after creation"),
        ))
    }
}

/// VM이 더 이상 존재하지 않아야 합니다.
pub async fn expect_vm_absent<B: CloudBackend>(
    backend: &B,
    vm_id: &str,
) -> Result<(), LifecycleError> {
    info!(vm_id, "checking vm absence");
    if backend.has_vm(vm_id).await? {
        Err(LifecycleError::verification(
            "has_vm",
            format!("vm '{vm_id}' still exists after deletion"),
        ))
    } else {
        Ok(())
    }
}

/// 디스크가 존재해야 합니다.
pub async fn expect_disk_exists<B: CloudBackend>(
    backend: &B,
    disk_id: &str,
) -> Result<(), LifecycleError> {
    info!(disk_id, "checking disk existence");
    if backend.has_disk(disk_id).await? {
        Ok(())
    } else {
        Err(LifecycleError::verification(
            "has_disk",
            format!("disk '{disk_id}' does not exist"),
        ))
    }
}

/// 디스크 메타데이터가 VM 메타데이터의 화이트리스트 부분집합과 정확히 일치해야 합니다.
///
/// 화이트리스트(`id`, `deployment`, `job`, `index`) 키는 값이 같아야 하고,
/// 그 밖의 VM 키는 디스크에 나타나면 안 됩니다.
pub fn expect_disk_inherits_vm_metadata(
    vm_metadata: &Metadata,
    disk_metadata: &Metadata,
) -> Result<(), LifecycleError> {
    const STEP: &str = "disk_metadata";

    for key in DISK_METADATA_WHITELIST {
        match (vm_metadata.get(key), disk_metadata.get(key)) {
            (Some(expected), Some(actual)) if expected == actual => {}
            (Some(expected), actual) => {
                return Err(LifecycleError::verification(
                    STEP,
                    format!("disk key '{key}' is {actual:?}, vm has '{expected}'"),
                ));
            }
            (None, Some(actual)) => {
                return Err(LifecycleError::verification(
                    STEP,
                    format!("disk carries '{key}'='{actual}' which the vm does not have"),
                ));
            }
            (None, None) => {}
        }
    }

    if let Some(leaked) = vm_metadata
        .keys()
        .filter(|key| !DISK_METADATA_WHITELIST.contains(&key.as_str()))
        .find(|key| disk_metadata.contains_key(key.as_str()))
    {
        return Err(LifecycleError::verification(
            STEP,
            format!("non-whitelisted key '{leaked}' was propagated to the disk"),
        ));
    }

    Ok(())
}

/// 프로바이더 조회 기반 검증기
pub struct LifecycleVerifier<'a, I: CloudInspector, R: AgentRegistry> {
    inspector: &'a I,
    registry: &'a R,
}

impl<'a, I: CloudInspector, R: AgentRegistry> LifecycleVerifier<'a, I, R> {
    pub fn new(inspector: &'a I, registry: &'a R) -> Self {
        Self {
            inspector,
            registry,
        }
    }

    async fn server(&self, step: &str, vm_id: &str) -> Result<ServerDetails, LifecycleError> {
        self.inspector
            .server(vm_id)
            .await?
            .ok_or_else(|| LifecycleError::verification(step, format!("vm '{vm_id}' not found")))
    }

    /// 부팅 볼륨이 정확히 하나, 지정된 장치에 연결되어 있어야 합니다.
    pub async fn expect_boot_volume_at(
        &self,
        vm_id: &str,
        device: &str,
    ) -> Result<(), LifecycleError> {
        const STEP: &str = "boot_volume";

        let server = self.server(STEP, vm_id).await?;
        match server.volume_attachments.as_slice() {
            [attachment] if attachment.device == device => Ok(()),
            [attachment] => Err(LifecycleError::verification(
                STEP,
                format!(
                    "volume '{}' attached at '{}', expected '{device}'",
                    attachment.volume_id, attachment.device
                ),
            )),
            attachments => Err(LifecycleError::verification(
                STEP,
                format!("expected one attached volume, found {}", attachments.len()),
            )),
        }
    }

    /// VM 이름이 메타데이터에서 온 이름이어야 합니다.
    pub async fn expect_vm_named(&self, vm_id: &str, name: &str) -> Result<(), LifecycleError> {
        let server = self.server("vm_name", vm_id).await?;
        if server.name == name {
            Ok(())
        } else {
            Err(LifecycleError::verification(
                "vm_name",
                format!("vm '{vm_id}' is named '{}', expected '{name}'", server.name),
            ))
        }
    }

    /// 레지스트리의 `networks.<name>.mac`과 서버의 고정 인터페이스가 일대일로 맞아야 합니다.
    ///
    /// MAC이 기록된 네트워크마다 같은 IP의 인터페이스가 있어야 하고, 반대로
    /// 모든 고정 인터페이스는 레지스트리에 있어야 합니다.
    pub async fn expect_macs_match_registry(&self, vm_id: &str) -> Result<(), LifecycleError> {
        const STEP: &str = "mac_addresses";

        let server = self.server(STEP, vm_id).await?;
        let settings = self.registry.read_settings(vm_id).await?.ok_or_else(|| {
            LifecycleError::verification(STEP, format!("no registry settings for vm '{vm_id}'"))
        })?;

        for (name, network) in &settings.networks {
            let Some(mac) = network.mac.as_deref() else {
                continue;
            };
            let iface = server
                .fixed_addresses()
                .find(|iface| match network.ip {
                    Some(ip) => iface.addr == ip,
                    None => iface.mac_addr == mac,
                })
                .ok_or_else(|| {
                    LifecycleError::verification(
                        STEP,
                        format!("network '{name}' has no interface on vm '{vm_id}'"),
                    )
                })?;
            if iface.mac_addr != mac {
                return Err(LifecycleError::verification(
                    STEP,
                    format!(
                        "network '{name}': provider reports mac '{}', registry has '{mac}'",
                        iface.mac_addr
                    ),
                ));
            }
            debug!(vm_id, network = %name, mac, "mac matches registry");
        }

        for iface in server.fixed_addresses() {
            let known = settings.networks.values().any(|n| {
                n.ip == Some(iface.addr) || n.mac.as_deref() == Some(iface.mac_addr.as_str())
            });
            if !known {
                return Err(LifecycleError::verification(
                    STEP,
                    format!("address {} is not in the registry", iface.addr),
                ));
            }
        }
        Ok(())
    }

    /// VM에 묶인 포트 ID 목록 (삭제 전에 기록해 두기 위함)
    pub async fn ports_for(&self, vm_id: &str) -> Result<Vec<String>, LifecycleError> {
        Ok(self.inspector.ports_for_device(vm_id).await?)
    }

    /// 주어진 포트가 모두 사라져야 합니다.
    pub async fn expect_ports_released(&self, port_ids: &[String]) -> Result<(), LifecycleError> {
        for port_id in port_ids {
            if self.inspector.port_exists(port_id).await? {
                return Err(LifecycleError::verification(
                    "ports_released",
                    format!("port '{port_id}' still exists after vm deletion"),
                ));
            }
        }
        Ok(())
    }

    /// 주어진 사설 IP를 가진 active VM이 없어야 합니다.
    pub async fn expect_no_active_vm_with_ip(&self, ip: IpAddr) -> Result<(), LifecycleError> {
        let servers = self.inspector.servers().await?;
        match servers
            .iter()
            .find(|s| s.state == ServerState::Active && s.private_ip == Some(ip))
        {
            Some(server) => Err(LifecycleError::verification(
                "no_active_vm_with_ip",
                format!("vm '{}' is active with ip {ip}", server.id),
            )),
            None => Ok(()),
        }
    }

    /// VM/디스크/스냅샷/포트가 하나도 남지 않아야 합니다.
    pub async fn expect_no_residual_resources(&self) -> Result<(), LifecycleError> {
        let counts = self.inspector.resource_counts().await?;
        if counts.is_zero() {
            Ok(())
        } else {
            Err(LifecycleError::verification(
                "residual_resources",
                format!("resources left behind: {counts}"),
            ))
        }
    }

    /// 현재 네트워크 API 보안 그룹 조회 횟수
    pub async fn security_group_lookups(&self) -> Result<u64, LifecycleError> {
        Ok(self.inspector.network_api_security_group_lookups().await?)
    }

    /// 기준값 이후 네트워크 API 보안 그룹 조회가 없어야 합니다.
    pub async fn expect_no_security_group_lookups_since(
        &self,
        baseline: u64,
    ) -> Result<(), LifecycleError> {
        let current = self.security_group_lookups().await?;
        if current == baseline {
            Ok(())
        } else {
            Err(LifecycleError::verification(
                "security_groups",
                format!("{} security group lookups went to the network api", current - baseline),
            ))
        }
    }

    /// config drive 모드가 기대값과 같아야 합니다.
    pub async fn expect_config_drive(
        &self,
        vm_id: &str,
        expected: Option<ConfigDrive>,
    ) -> Result<(), LifecycleError> {
        let server = self.server("config_drive", vm_id).await?;
        if server.config_drive == expected {
            Ok(())
        } else {
            Err(LifecycleError::verification(
                "config_drive",
                format!(
                    "vm '{vm_id}' has config drive {:?}, expected {expected:?}",
                    server.config_drive
                ),
            ))
        }
    }

    /// 연결된 디스크가 VM 메타데이터의 화이트리스트만 물려받았어야 합니다.
    pub async fn expect_disk_metadata_whitelist(
        &self,
        vm_id: &str,
        disk_id: &str,
    ) -> Result<(), LifecycleError> {
        let server = self.server("disk_metadata", vm_id).await?;
        let disk_metadata = self.inspector.volume_metadata(disk_id).await?.ok_or_else(|| {
            LifecycleError::verification("disk_metadata", format!("disk '{disk_id}' not found"))
        })?;
        expect_disk_inherits_vm_metadata(&server.metadata, &disk_metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn vm_metadata() -> Metadata {
        metadata(&[
            ("id", "ins-1"),
            ("deployment", "deployment"),
            ("job", "cpi_spec"),
            ("index", "0"),
            ("some_key", "some_value"),
        ])
    }

    #[test]
    fn whitelisted_subset_is_accepted() {
        let disk = metadata(&[
            ("id", "ins-1"),
            ("deployment", "deployment"),
            ("job", "cpi_spec"),
            ("index", "0"),
        ]);
        expect_disk_inherits_vm_metadata(&vm_metadata(), &disk).unwrap();
    }

    #[test]
    fn leaked_key_is_rejected() {
        let disk = metadata(&[
            ("id", "ins-1"),
            ("deployment", "deployment"),
            ("job", "cpi_spec"),
            ("index", "0"),
            ("some_key", "some_value"),
        ]);
        let err = expect_disk_inherits_vm_metadata(&vm_metadata(), &disk).unwrap_err();
        assert!(err.to_string().contains("some_key"));
    }

    #[test]
    fn missing_whitelisted_key_is_rejected() {
        let disk = metadata(&[("id", "ins-1"), ("deployment", "deployment"), ("job", "cpi_spec")]);
        let err = expect_disk_inherits_vm_metadata(&vm_metadata(), &disk).unwrap_err();
        assert!(err.to_string().contains("'index'"));
    }

    #[test]
    fn mismatched_value_is_rejected() {
        let mut disk = metadata(&[
            ("id", "ins-1"),
            ("deployment", "other"),
            ("job", "cpi_spec"),
            ("index", "0"),
        ]);
        assert!(expect_disk_inherits_vm_metadata(&vm_metadata(), &disk).is_err());
        disk.insert("deployment".into(), "deployment".into());
        assert!(expect_disk_inherits_vm_metadata(&vm_metadata(), &disk).is_ok());
    }

    #[test]
    fn empty_vm_metadata_requires_empty_disk_whitelist() {
        let disk = metadata(&[("job", "cpi_spec")]);
        assert!(expect_disk_inherits_vm_metadata(&Metadata::new(), &disk).is_err());
        assert!(expect_disk_inherits_vm_metadata(&Metadata::new(), &Metadata::new()).is_ok());
    }

    mod registry_macs {
        use super::*;
        use crate::cpi::{AgentEnv, CloudBackend, CloudProvider, CpiOptions};
        use crate::error::ErrorClass;
        use crate::registry::{AgentRegistry, NetworkSettings};
        use crate::verifier::LifecycleVerifier;
        use crate::simulated::SimulatedCloud;
        use lifecheck_core::network::{Network, NetworkSpec};
        use lifecheck_core::types::ResourcePool;

        const IMAGE: &str = "img-base";

        fn cloud() -> SimulatedCloud {
            SimulatedCloud::builder()
                .image(IMAGE)
                .flavor("m1.small", 10)
                .network("net-no-dhcp-1")
                .network("net-no-dhcp-2")
                .build()
        }

        async fn boot(cloud: &SimulatedCloud) -> String {
            let networks = NetworkSpec::new([(
                "network_1",
                Network::manual("10.1.0.10".parse().unwrap(), "net-no-dhcp-1")
                    .with_use_dhcp(false),
            )])
            .unwrap();
            cloud
                .cpi(&CpiOptions::default())
                .create_vm(
                    "agent-007",
                    IMAGE,
                    &ResourcePool::new("m1.small"),
                    &networks,
                    &[],
                    &AgentEnv::new(),
                )
                .await
                .unwrap()
        }

        #[tokio::test]
        async fn registry_written_by_create_vm_matches() {
            let cloud = cloud();
            let vm_id = boot(&cloud).await;
            let verifier = LifecycleVerifier::new(&cloud, cloud.registry());
            verifier.expect_macs_match_registry(&vm_id).await.unwrap();
        }

        #[tokio::test]
        async fn registry_network_without_interface_is_rejected() {
            let cloud = cloud();
            let vm_id = boot(&cloud).await;
            let registry = cloud.registry();
            let mut settings = registry.read_settings(&vm_id).await.unwrap().unwrap();
            settings.networks.insert(
                "network_2".to_owned(),
                NetworkSettings {
                    kind: "manual".to_owned(),
                    ip: Some("10.2.0.10".parse().unwrap()),
                    mac: Some("fa:16:3e:ff:ff:ff".to_owned()),
                    use_dhcp: false,
                },
            );
            registry.update_settings(&vm_id, settings).await.unwrap();

            let verifier = LifecycleVerifier::new(&cloud, registry);
            let err = verifier.expect_macs_match_registry(&vm_id).await.unwrap_err();
            assert_eq!(err.class(), ErrorClass::Verification);
            assert!(err.to_string().contains("network 'network_2'"));
        }

        #[tokio::test]
        async fn mismatched_mac_is_rejected() {
            let cloud = cloud();
            let vm_id = boot(&cloud).await;
            let registry = cloud.registry();
            let mut settings = registry.read_settings(&vm_id).await.unwrap().unwrap();
            if let Some(network) = settings.networks.get_mut("network_1") {
                network.mac = Some("fa:16:3e:00:00:00".to_owned());
            }
            registry.update_settings(&vm_id, settings).await.unwrap();

            let verifier = LifecycleVerifier::new(&cloud, registry);
            let err = verifier.expect_macs_match_registry(&vm_id).await.unwrap_err();
            assert!(err.to_string().contains("registry has 'fa:16:3e:00:00:00'"));
        }
    }
}
