//! VM 라이프사이클 실행
//!
//! [`VmLifecycle`]은 실행 하나의 상태 머신과 정리 스택을 소유하고,
//! 단계별 메서드(`create_vm`, `create_disk`, `attach_disk`, ...)를 제공합니다.
//! 각 단계는 [`LifecycleState`] 전이를 검사하며, 허용되지 않은 전이는 거부됩니다.
//!
//! [`vm_lifecycle`]은 전체 시퀀스(VM 생성 → 디스크 생성/재사용 → 연결 → 분리 →
//! 스냅샷)를 실행하고, 어떤 단계에서 끝났든 해체를 수행합니다.
//!
//! ```text
//! Unprovisioned ─▶ VmCreated ─▶ DiskCreated ─┐
//!                       │                    ├─▶ Attached ─▶ Detached ─▶ SnapshotTaken ─▶ TornDown
//!                       └────▶ DiskReused ───┘                  │                           ▲
//!                                                               └───────────────────────────┘
//! ```

use std::fmt;
use std::future::Future;

use tracing::{debug, info};

use lifecheck_core::network::NetworkSpec;
use lifecheck_core::types::{DiskCloudProperties, Metadata, ResourceHandle, ResourcePool};

use crate::config::LifecycleConfig;
use crate::cpi::{AgentEnv, CloudBackend};
use crate::error::LifecycleError;
use crate::provisioner::{DEPLOYMENT_NAME, JOB_NAME, ResourceProvisioner, VmRequest};
use crate::teardown::{TeardownAggregator, TeardownReport};
use crate::verifier;

/// 스냅샷 태그의 director 이름
const DIRECTOR_NAME: &str = "lifecheck";

/// 스냅샷 태그의 director UUID
const DIRECTOR_UUID: &str = "6d06b0cc-2c08-43c5-95be-f1b2dd247e18";

/// 실행 하나의 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Unprovisioned,
    VmCreated,
    DiskCreated,
    DiskReused,
    Attached,
    Detached,
    SnapshotTaken,
    TornDown,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unprovisioned => "unprovisioned",
            Self::VmCreated => "vm_created",
            Self::DiskCreated => "disk_created",
            Self::DiskReused => "disk_reused",
            Self::Attached => "attached",
            Self::Detached => "detached",
            Self::SnapshotTaken => "snapshot_taken",
            Self::TornDown => "torn_down",
        }
    }

    /// `next`로의 전이가 허용되는지 여부
    ///
    /// 해체(`TornDown`)는 이미 해체된 상태가 아니라면 어디서든 가능합니다.
    pub fn can_transition_to(self, next: Self) -> bool {
        use LifecycleState::*;

        match (self, next) {
            (TornDown, _) => false,
            (_, TornDown) => true,
            (Unprovisioned, VmCreated)
            | (VmCreated, DiskCreated | DiskReused)
            | (DiskCreated | DiskReused, Attached)
            | (Attached, Detached)
            | (Detached, SnapshotTaken) => true,
            _ => false,
        }
    }

    /// 전이를 검사한 뒤 다음 상태를 반환합니다.
    pub fn transition(self, next: Self) -> Result<Self, LifecycleError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(LifecycleError::InvalidTransition {
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 실행 도중 VM이 살아 있는 동안 수행할 확인
///
/// 기본 구현은 아무것도 하지 않습니다.
pub trait LifecycleProbe: Send + Sync {
    /// VM 생성과 표준 메타데이터 부여 직후
    fn vm_ready(&self, _vm_id: &str) -> impl Future<Output = Result<(), LifecycleError>> + Send {
        async { Ok(()) }
    }

    /// 디스크 연결 직후
    fn disk_attached(
        &self,
        _vm_id: &str,
        _disk_id: &str,
    ) -> impl Future<Output = Result<(), LifecycleError>> + Send {
        async { Ok(()) }
    }
}

/// 아무 확인도 하지 않는 probe
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProbe;

impl LifecycleProbe for NoProbe {}

/// 디스크 준비 방식
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskSource {
    /// VM 옆에 새 디스크 생성
    Fresh(DiskCloudProperties),
    /// 이미 존재하는 디스크 재사용
    Existing(String),
}

/// 전체 라이프사이클 실행 인자
#[derive(Debug, Clone)]
pub struct LifecycleRequest<'a> {
    pub stemcell_id: &'a str,
    pub networks: &'a NetworkSpec,
    pub resource_pool: ResourcePool,
    pub disk: DiskSource,
}

/// 전진 단계에서 획득한 리소스
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleHandles {
    pub vm: ResourceHandle,
    pub disk: ResourceHandle,
    pub snapshot: Option<ResourceHandle>,
}

/// 실행 결과
#[derive(Debug)]
pub struct LifecycleReport<T> {
    /// 우선순위 규칙이 적용된 최종 결과
    pub result: Result<T, LifecycleError>,
    /// 해체 상세
    pub teardown: TeardownReport,
}

/// `create_vm`에 넘기는 에이전트 환경
pub fn default_agent_env() -> AgentEnv {
    let mut env = AgentEnv::new();
    env.insert("key".to_owned(), serde_json::Value::from("value"));
    env
}

/// 스냅샷 태그
pub fn snapshot_tags(agent_id: &str) -> Metadata {
    [
        ("deployment", DEPLOYMENT_NAME),
        ("job", JOB_NAME),
        ("index", "0"),
        ("instance_id", "instance"),
        ("agent_id", agent_id),
        ("director_name", DIRECTOR_NAME),
        ("director_uuid", DIRECTOR_UUID),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_owned(), v.to_owned()))
    .collect()
}

/// 실행 하나의 단계 실행기
pub struct VmLifecycle<'a, B: CloudBackend> {
    provisioner: &'a ResourceProvisioner<B>,
    config: &'a LifecycleConfig,
    teardown: TeardownAggregator,
    state: LifecycleState,
}

impl<'a, B: CloudBackend> VmLifecycle<'a, B> {
    pub fn new(provisioner: &'a ResourceProvisioner<B>, config: &'a LifecycleConfig) -> Self {
        Self {
            provisioner,
            config,
            teardown: TeardownAggregator::new(),
            state: LifecycleState::Unprovisioned,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn teardown(&self) -> &TeardownAggregator {
        &self.teardown
    }

    fn advance(&mut self, next: LifecycleState) -> Result<(), LifecycleError> {
        self.state = self.state.transition(next)?;
        debug!(state = %self.state, "lifecycle state changed");
        Ok(())
    }

    /// VM을 생성합니다 (존재 확인, 표준 메타데이터 포함).
    pub async fn create_vm(
        &mut self,
        stemcell_id: &str,
        networks: &NetworkSpec,
        resource_pool: &ResourcePool,
        disk_locality: &[String],
    ) -> Result<ResourceHandle, LifecycleError> {
        self.state.transition(LifecycleState::VmCreated)?;
        info!(stemcell_id, "creating vm");
        let env = default_agent_env();
        let vm = self
            .provisioner
            .create_vm(
                &mut self.teardown,
                VmRequest {
                    agent_id: &self.config.agent_id,
                    stemcell_id,
                    resource_pool,
                    networks,
                    disk_locality,
                    env: &env,
                },
            )
            .await?;
        self.advance(LifecycleState::VmCreated)?;
        Ok(vm)
    }

    /// VM 메타데이터를 덧붙입니다.
    pub async fn set_vm_metadata(
        &self,
        vm_id: &str,
        metadata: &Metadata,
    ) -> Result<(), LifecycleError> {
        self.provisioner.set_vm_metadata(vm_id, metadata).await
    }

    /// VM 옆에 새 디스크를 생성합니다.
    pub async fn create_disk(
        &mut self,
        vm_id: &str,
        cloud_properties: &DiskCloudProperties,
    ) -> Result<ResourceHandle, LifecycleError> {
        self.state.transition(LifecycleState::DiskCreated)?;
        info!(vm_id, "creating disk for vm");
        let disk = self
            .provisioner
            .create_disk(
                &mut self.teardown,
                self.config.disk_size_mb,
                cloud_properties,
                Some(vm_id),
            )
            .await?;
        self.advance(LifecycleState::DiskCreated)?;
        Ok(disk)
    }

    /// 기존 디스크를 재사용합니다. 실행이 끝나면 삭제됩니다.
    pub async fn reuse_disk(&mut self, disk_id: &str) -> Result<ResourceHandle, LifecycleError> {
        self.state.transition(LifecycleState::DiskReused)?;
        info!(disk_id, "reusing disk");
        let disk = ResourceHandle::disk(disk_id);
        self.teardown.register_release(&disk)?;
        verifier::expect_disk_exists(self.provisioner.backend(), disk_id).await?;
        self.advance(LifecycleState::DiskReused)?;
        Ok(disk)
    }

    pub async fn attach_disk(&mut self, vm_id: &str, disk_id: &str) -> Result<(), LifecycleError> {
        self.state.transition(LifecycleState::Attached)?;
        self.provisioner
            .attach_disk(&mut self.teardown, vm_id, disk_id)
            .await?;
        self.advance(LifecycleState::Attached)
    }

    pub async fn detach_disk(&mut self, vm_id: &str, disk_id: &str) -> Result<(), LifecycleError> {
        self.state.transition(LifecycleState::Detached)?;
        self.provisioner.detach_disk(vm_id, disk_id).await?;
        self.advance(LifecycleState::Detached)
    }

    pub async fn snapshot_disk(&mut self, disk_id: &str) -> Result<ResourceHandle, LifecycleError> {
        self.state.transition(LifecycleState::SnapshotTaken)?;
        let tags = snapshot_tags(&self.config.agent_id);
        let snapshot = self
            .provisioner
            .snapshot_disk(&mut self.teardown, disk_id, &tags)
            .await?;
        self.advance(LifecycleState::SnapshotTaken)?;
        Ok(snapshot)
    }

    /// 등록된 모든 리소스를 해제하고 우선순위 규칙을 적용합니다.
    pub async fn tear_down<T>(mut self, outcome: Result<T, LifecycleError>) -> LifecycleReport<T> {
        info!(
            state = %self.state,
            pending = self.teardown.context().len(),
            failed = outcome.is_err(),
            "tearing down"
        );
        self.state = LifecycleState::TornDown;
        let teardown = self.teardown.unwind(self.provisioner).await;
        let result = TeardownAggregator::finish(outcome, &teardown);
        LifecycleReport { result, teardown }
    }

    async fn forward<P: LifecycleProbe>(
        &mut self,
        request: &LifecycleRequest<'_>,
        probe: &P,
    ) -> Result<LifecycleHandles, LifecycleError> {
        let disk_locality: Vec<String> = match &request.disk {
            DiskSource::Existing(disk_id) => vec![disk_id.clone()],
            DiskSource::Fresh(_) => Vec::new(),
        };
        let vm = self
            .create_vm(
                request.stemcell_id,
                request.networks,
                &request.resource_pool,
                &disk_locality,
            )
            .await?;
        probe.vm_ready(&vm.id).await?;

        let disk = match &request.disk {
            DiskSource::Fresh(cloud_properties) => self.create_disk(&vm.id, cloud_properties).await?,
            DiskSource::Existing(disk_id) => self.reuse_disk(disk_id).await?,
        };

        self.attach_disk(&vm.id, &disk.id).await?;
        probe.disk_attached(&vm.id, &disk.id).await?;
        self.detach_disk(&vm.id, &disk.id).await?;

        let snapshot = if self.config.disable_snapshots {
            info!(disk_id = %disk.id, "snapshots disabled");
            None
        } else {
            Some(self.snapshot_disk(&disk.id).await?)
        };

        Ok(LifecycleHandles {
            vm,
            disk,
            snapshot,
        })
    }
}

/// 전체 VM 라이프사이클을 실행합니다.
///
/// 전진 단계가 어디서 실패하든 획득한 리소스는 모두 역순으로 해제되며,
/// 첫 전진 단계 에러가 최종 결과가 됩니다.
pub async fn vm_lifecycle<B: CloudBackend, P: LifecycleProbe>(
    provisioner: &ResourceProvisioner<B>,
    config: &LifecycleConfig,
    request: &LifecycleRequest<'_>,
    probe: &P,
) -> LifecycleReport<LifecycleHandles> {
    let mut run = VmLifecycle::new(provisioner, config);
    let outcome = run.forward(request, probe).await;
    run.tear_down(outcome).await
}

/// 임시 VM 옆에 디스크를 만들고 VM은 지운 뒤, 분리된 디스크를 돌려줍니다.
///
/// 디스크의 해제 액션은 `outer`에 등록됩니다.
pub async fn prepare_existing_disk<B: CloudBackend>(
    provisioner: &ResourceProvisioner<B>,
    config: &LifecycleConfig,
    outer: &mut TeardownAggregator,
    stemcell_id: &str,
    networks: &NetworkSpec,
) -> Result<ResourceHandle, LifecycleError> {
    let mut scratch = TeardownAggregator::new();
    let env = default_agent_env();
    let resource_pool = config.resource_pool();
    let outcome = async {
        let vm = provisioner
            .create_vm(
                &mut scratch,
                VmRequest {
                    agent_id: &config.agent_id,
                    stemcell_id,
                    resource_pool: &resource_pool,
                    networks,
                    disk_locality: &[],
                    env: &env,
                },
            )
            .await?;
        info!(vm_id = %vm.id, "creating disk on throwaway vm");
        provisioner
            .create_disk(outer, config.disk_size_mb, &DiskCloudProperties::default(), Some(&vm.id))
            .await
    }
    .await;
    let report = scratch.unwind(provisioner).await;
    TeardownAggregator::finish(outcome, &report)
}
