//! 리소스 프로비저너 -- 백엔드 계약 위의 얇은 래퍼
//!
//! [`ResourceProvisioner`]는 백엔드 호출을 발행하고 불투명 [`ResourceHandle`]을
//! 돌려줍니다. 리소스를 획득하는 호출은 성공 즉시 [`TeardownAggregator`]에 해제
//! 액션을 등록한 뒤에야 사후 확인(존재 검증 등)을 수행하므로, 확인이 실패해도
//! 리소스가 정리 대상에서 빠지지 않습니다.

use std::sync::Arc;

use tracing::info;

use lifecheck_core::metrics as m;
use lifecheck_core::network::NetworkSpec;
use lifecheck_core::types::{
    DiskCloudProperties, Metadata, ResourceHandle, ResourcePool, StemcellCloudProperties,
};

use crate::cpi::{AgentEnv, CloudBackend};
use crate::error::LifecycleError;
use crate::teardown::{CleanupAction, ResourceReleaser, TeardownAggregator};
use crate::verifier;

/// 표준 VM 메타데이터의 deployment 값
pub const DEPLOYMENT_NAME: &str = "deployment";

/// 표준 VM 메타데이터와 스냅샷 태그의 job 값
pub const JOB_NAME: &str = "lifecheck";

/// VM 생성 직후 부여하는 표준 메타데이터
pub fn standard_vm_metadata() -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("deployment".to_owned(), DEPLOYMENT_NAME.to_owned());
    metadata.insert("name".to_owned(), format!("{JOB_NAME}/instance_id"));
    metadata
}

/// `create_vm` 인자 묶음
#[derive(Debug, Clone, Copy)]
pub struct VmRequest<'a> {
    pub agent_id: &'a str,
    pub stemcell_id: &'a str,
    pub resource_pool: &'a ResourcePool,
    pub networks: &'a NetworkSpec,
    pub disk_locality: &'a [String],
    pub env: &'a AgentEnv,
}

/// 리소스 프로비저너
pub struct ResourceProvisioner<B: CloudBackend> {
    backend: Arc<B>,
}

impl<B: CloudBackend> ResourceProvisioner<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn acquired(
        &self,
        teardown: &mut TeardownAggregator,
        handle: &ResourceHandle,
    ) -> Result<(), LifecycleError> {
        metrics::counter!(m::RESOURCES_CREATED_TOTAL, m::LABEL_KIND => handle.kind.as_str())
            .increment(1);
        teardown.register_release(handle)
    }

    /// 스템셀을 업로드(또는 light 스템셀로 등록)합니다.
    pub async fn create_stemcell(
        &self,
        teardown: &mut TeardownAggregator,
        image_path: &str,
        cloud_properties: &StemcellCloudProperties,
    ) -> Result<ResourceHandle, LifecycleError> {
        info!(image_path, image_id = ?cloud_properties.image_id, "creating stemcell");
        let stemcell_id = self
            .backend
            .create_stemcell(image_path, cloud_properties)
            .await?;
        let handle = ResourceHandle::stemcell(&stemcell_id);
        self.acquired(teardown, &handle)?;
        info!(stemcell_id = %stemcell_id, "stemcell created");
        Ok(handle)
    }

    /// VM을 생성하고, 존재를 확인한 뒤 표준 메타데이터를 부여합니다.
    pub async fn create_vm(
        &self,
        teardown: &mut TeardownAggregator,
        request: VmRequest<'_>,
    ) -> Result<ResourceHandle, LifecycleError> {
        info!(
            stemcell_id = request.stemcell_id,
            agent_id = request.agent_id,
            instance_type = %request.resource_pool.instance_type,
            "creating vm"
        );
        let vm_id = self
            .backend
            .create_vm(
                request.agent_id,
                request.stemcell_id,
                request.resource_pool,
                request.networks,
                request.disk_locality,
                request.env,
            )
            .await?;
        let handle = ResourceHandle::vm(&vm_id);
        self.acquired(teardown, &handle)?;

        verifier::expect_vm_exists(self.backend.as_ref(), &vm_id).await?;

        info!(vm_id = %vm_id, "setting vm metadata");
        self.backend
            .set_vm_metadata(&vm_id, &standard_vm_metadata())
            .await?;
        Ok(handle)
    }

    /// 영구 디스크를 생성하고 존재를 확인합니다.
    pub async fn create_disk(
        &self,
        teardown: &mut TeardownAggregator,
        size_mb: u32,
        cloud_properties: &DiskCloudProperties,
        vm_id: Option<&str>,
    ) -> Result<ResourceHandle, LifecycleError> {
        info!(vm_id, size_mb, volume_type = ?cloud_properties.volume_type, "creating disk");
        let disk_id = self
            .backend
            .create_disk(size_mb, cloud_properties, vm_id)
            .await?;
        let handle = ResourceHandle::disk(&disk_id);
        self.acquired(teardown, &handle)?;

        verifier::expect_disk_exists(self.backend.as_ref(), &disk_id).await?;
        Ok(handle)
    }

    /// 디스크를 연결하고 분리 액션을 등록합니다.
    pub async fn attach_disk(
        &self,
        teardown: &mut TeardownAggregator,
        vm_id: &str,
        disk_id: &str,
    ) -> Result<(), LifecycleError> {
        info!(vm_id, disk_id, "attaching disk");
        self.backend.attach_disk(vm_id, disk_id).await?;
        teardown.register(CleanupAction::DetachDisk {
            vm_id: vm_id.to_owned(),
            disk_id: disk_id.to_owned(),
        })
    }

    /// 디스크를 분리합니다. 연결되어 있지 않은 디스크는 성공으로 취급합니다.
    pub async fn detach_disk(&self, vm_id: &str, disk_id: &str) -> Result<(), LifecycleError> {
        info!(vm_id, disk_id, "detaching disk");
        match self.backend.detach_disk(vm_id, disk_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let err = LifecycleError::from(e);
                if err.is_not_found() {
                    info!(vm_id, disk_id, error = %err, "disk was not attached");
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    /// 디스크 스냅샷을 생성합니다.
    pub async fn snapshot_disk(
        &self,
        teardown: &mut TeardownAggregator,
        disk_id: &str,
        tags: &Metadata,
    ) -> Result<ResourceHandle, LifecycleError> {
        info!(disk_id, "creating disk snapshot");
        let snapshot_id = self.backend.snapshot_disk(disk_id, tags).await?;
        let handle = ResourceHandle::snapshot(&snapshot_id);
        self.acquired(teardown, &handle)?;
        info!(disk_id, disk_snapshot_id = %snapshot_id, "disk snapshot created");
        Ok(handle)
    }

    /// VM을 삭제하고 부재를 확인합니다.
    pub async fn delete_vm(&self, vm_id: &str) -> Result<(), LifecycleError> {
        info!(vm_id, "deleting vm");
        self.backend.delete_vm(vm_id).await?;
        verifier::expect_vm_absent(self.backend.as_ref(), vm_id).await
    }

    pub async fn delete_disk(&self, disk_id: &str) -> Result<(), LifecycleError> {
        info!(disk_id, "deleting disk");
        Ok(self.backend.delete_disk(disk_id).await?)
    }

    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), LifecycleError> {
        info!(disk_snapshot_id = snapshot_id, "deleting disk snapshot");
        Ok(self.backend.delete_snapshot(snapshot_id).await?)
    }

    pub async fn delete_stemcell(&self, stemcell_id: &str) -> Result<(), LifecycleError> {
        info!(stemcell_id, "deleting stemcell");
        Ok(self.backend.delete_stemcell(stemcell_id).await?)
    }

    pub async fn set_vm_metadata(
        &self,
        vm_id: &str,
        metadata: &Metadata,
    ) -> Result<(), LifecycleError> {
        info!(vm_id, keys = metadata.len(), "setting vm metadata");
        Ok(self.backend.set_vm_metadata(vm_id, metadata).await?)
    }

    pub async fn has_vm(&self, vm_id: &str) -> Result<bool, LifecycleError> {
        Ok(self.backend.has_vm(vm_id).await?)
    }

    pub async fn has_disk(&self, disk_id: &str) -> Result<bool, LifecycleError> {
        Ok(self.backend.has_disk(disk_id).await?)
    }
}

impl<B: CloudBackend> ResourceReleaser for ResourceProvisioner<B> {
    async fn release(&self, action: &CleanupAction) -> Result<(), LifecycleError> {
        match action {
            CleanupAction::DeleteSnapshot(id) => self.delete_snapshot(id).await,
            CleanupAction::DeleteDisk(id) => self.delete_disk(id).await,
            // 이미 분리된 경우 NotFound를 그대로 돌려 "already gone"으로 집계되게 함
            CleanupAction::DetachDisk { vm_id, disk_id } => {
                info!(vm_id = %vm_id, disk_id = %disk_id, "detaching disk");
                Ok(self.backend.detach_disk(vm_id, disk_id).await?)
            }
            CleanupAction::DeleteVm(id) => self.delete_vm(id).await,
            CleanupAction::DeleteStemcell(id) => self.delete_stemcell(id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpi::{CloudInspector, CloudProvider, CpiOperation, CpiOptions};
    use crate::error::CpiError;
    use crate::simulated::{SimulatedCloud, SimulatedCpi};
    use lifecheck_core::network::Network;
    use lifecheck_core::types::ResourceKind;

    const IMAGE: &str = "img-base";

    fn setup() -> (SimulatedCloud, ResourceProvisioner<SimulatedCpi>) {
        let cloud = SimulatedCloud::builder()
            .image(IMAGE)
            .flavor("m1.small", 10)
            .network("net-1")
            .build();
        let provisioner = ResourceProvisioner::new(Arc::new(cloud.cpi(&CpiOptions::default())));
        (cloud, provisioner)
    }

    async fn create_vm(
        provisioner: &ResourceProvisioner<SimulatedCpi>,
        teardown: &mut TeardownAggregator,
    ) -> Result<ResourceHandle, LifecycleError> {
        let pool = ResourcePool::new("m1.small");
        let networks = NetworkSpec::new([("default", Network::dynamic("net-1"))]).unwrap();
        provisioner
            .create_vm(
                teardown,
                VmRequest {
                    agent_id: "agent-007",
                    stemcell_id: IMAGE,
                    resource_pool: &pool,
                    networks: &networks,
                    disk_locality: &[],
                    env: &AgentEnv::new(),
                },
            )
            .await
    }

    #[test]
    fn standard_metadata_has_deployment_and_name() {
        let metadata = standard_vm_metadata();
        assert_eq!(metadata["deployment"], "deployment");
        assert_eq!(metadata["name"], "lifecheck/instance_id");
    }

    #[tokio::test]
    async fn create_vm_registers_cleanup_and_sets_metadata() {
        let (cloud, provisioner) = setup();
        let mut teardown = TeardownAggregator::new();
        let handle = create_vm(&provisioner, &mut teardown).await.unwrap();

        assert_eq!(handle.kind, ResourceKind::Vm);
        assert!(teardown.context().contains(&handle));
        let details = cloud.server(&handle.id).await.unwrap().unwrap();
        assert_eq!(details.metadata, standard_vm_metadata());
    }

    #[tokio::test]
    async fn failed_existence_check_keeps_vm_registered() {
        let (cloud, provisioner) = setup();
        cloud
            .inject_fault(CpiOperation::HasVm, CpiError::Cloud("api down".into()), 1)
            .await;
        let mut teardown = TeardownAggregator::new();
        let err = create_vm(&provisioner, &mut teardown).await.unwrap_err();
        assert!(err.to_string().contains("api down"));
        assert_eq!(teardown.context().len(), 1);

        let report = teardown.unwind(&provisioner).await;
        assert!(report.is_clean());
        assert!(cloud.resource_counts().await.unwrap().is_zero());
    }

    #[tokio::test]
    async fn vm_that_never_existed_fails_verification() {
        let (_cloud, provisioner) = setup();
        let err = verifier::expect_vm_exists(provisioner.backend(), "vm-ghost")
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Verification { .. }));
    }

    #[tokio::test]
    async fn detach_of_unattached_disk_is_absorbed() {
        let (_cloud, provisioner) = setup();
        let mut teardown = TeardownAggregator::new();
        let vm = create_vm(&provisioner, &mut teardown).await.unwrap();
        provisioner
            .detach_disk(&vm.id, "non-existing-disk")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn disk_lifecycle_unwinds_in_reverse() {
        let (cloud, provisioner) = setup();
        let mut teardown = TeardownAggregator::new();
        let vm = create_vm(&provisioner, &mut teardown).await.unwrap();
        let disk = provisioner
            .create_disk(&mut teardown, 2048, &DiskCloudProperties::default(), Some(&vm.id))
            .await
            .unwrap();
        provisioner
            .attach_disk(&mut teardown, &vm.id, &disk.id)
            .await
            .unwrap();
        provisioner.detach_disk(&vm.id, &disk.id).await.unwrap();
        let snapshot = provisioner
            .snapshot_disk(&mut teardown, &disk.id, &Metadata::new())
            .await
            .unwrap();

        let report = teardown.unwind(&provisioner).await;
        assert!(report.is_clean());
        assert_eq!(
            report.released().collect::<Vec<_>>(),
            vec![snapshot, disk.clone(), vm]
        );
        // 전진 단계에서 이미 분리됨
        assert_eq!(report.already_gone.len(), 1);
        assert_eq!(report.already_gone[0].handle(), disk);
        assert!(cloud.resource_counts().await.unwrap().is_zero());
    }

    #[tokio::test]
    async fn release_of_attached_disk_detaches_first() {
        let (cloud, provisioner) = setup();
        let mut teardown = TeardownAggregator::new();
        let vm = create_vm(&provisioner, &mut teardown).await.unwrap();
        let disk = provisioner
            .create_disk(&mut teardown, 2048, &DiskCloudProperties::default(), None)
            .await
            .unwrap();
        provisioner
            .attach_disk(&mut teardown, &vm.id, &disk.id)
            .await
            .unwrap();

        let report = teardown.unwind(&provisioner).await;
        assert!(report.is_clean(), "{:?}", report.errors);
        assert_eq!(report.completed.len(), 3);
        assert!(cloud.resource_counts().await.unwrap().is_zero());
    }

    #[tokio::test]
    async fn missing_light_stemcell_image_is_cloud_error() {
        let (_cloud, provisioner) = setup();
        let mut teardown = TeardownAggregator::new();
        let err = provisioner
            .create_stemcell(&mut teardown, "", &StemcellCloudProperties::light("img-nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Cpi(CpiError::Cloud(_))));
        assert!(teardown.context().is_empty());
    }
}
