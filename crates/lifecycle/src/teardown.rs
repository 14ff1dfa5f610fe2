//! 해체 집계 -- 정리 액션 등록과 역순 해제
//!
//! [`CleanupAction`]은 하나의 리소스에 묶인 해제 동작입니다.
//! [`TeardownAggregator`]는 획득 순서대로 정리 액션을 쌓아 두었다가
//! 실행이 어떻게 끝났든 [`TeardownAggregator::unwind`]로 전부 역순 실행합니다.
//!
//! # 에러 우선순위
//!
//! - 각 정리 액션의 실패는 독립적으로 포착되어 로그로 남고 나머지 해제를 막지 않습니다.
//! - 이미 사라진 리소스(`ResourceNotFound`)는 해제된 것으로 취급합니다.
//! - 전진 단계(프로비저닝/검증)의 첫 에러가 있으면 그 에러를 그대로 반환하고,
//!   해체 중 에러는 로그만 남기고 버립니다.
//! - 전진 단계 에러가 없으면 해체 중 첫 에러를 반환합니다.

use std::fmt;
use std::future::Future;

use tracing::{error, info, warn};

use lifecheck_core::metrics as m;
use lifecheck_core::types::{ResourceHandle, ResourceKind};

use crate::error::{ErrorRecord, LifecycleError};

/// 리소스 하나에 묶인 해제 동작
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CleanupAction {
    /// 스냅샷 삭제
    DeleteSnapshot(String),
    /// 디스크 삭제
    DeleteDisk(String),
    /// 디스크 분리 (이미 분리된 경우 성공으로 취급)
    DetachDisk {
        vm_id: String,
        disk_id: String,
    },
    /// VM 삭제 후 부재 확인
    DeleteVm(String),
    /// 스템셀 삭제
    DeleteStemcell(String),
}

impl CleanupAction {
    /// 핸들을 해제하는 액션을 반환합니다.
    pub fn release(handle: &ResourceHandle) -> Self {
        let id = handle.id.clone();
        match handle.kind {
            ResourceKind::Vm => Self::DeleteVm(id),
            ResourceKind::Disk => Self::DeleteDisk(id),
            ResourceKind::Snapshot => Self::DeleteSnapshot(id),
            ResourceKind::Stemcell => Self::DeleteStemcell(id),
        }
    }

    /// 액션이 묶인 리소스 핸들
    pub fn handle(&self) -> ResourceHandle {
        match self {
            Self::DeleteSnapshot(id) => ResourceHandle::snapshot(id),
            Self::DeleteDisk(id) => ResourceHandle::disk(id),
            Self::DetachDisk { disk_id, .. } => ResourceHandle::disk(disk_id),
            Self::DeleteVm(id) => ResourceHandle::vm(id),
            Self::DeleteStemcell(id) => ResourceHandle::stemcell(id),
        }
    }

    /// 리소스를 없애는 액션인지 여부 (분리는 해당 없음)
    pub fn releases_handle(&self) -> bool {
        !matches!(self, Self::DetachDisk { .. })
    }

    /// 로그/메트릭용 고정 액션 이름
    pub fn action_type_name(&self) -> &'static str {
        match self {
            Self::DeleteSnapshot(_) => "delete_snapshot",
            Self::DeleteDisk(_) => "delete_disk",
            Self::DetachDisk { .. } => "detach_disk",
            Self::DeleteVm(_) => "delete_vm",
            Self::DeleteStemcell(_) => "delete_stemcell",
        }
    }
}

impl fmt::Display for CleanupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DetachDisk { vm_id, disk_id } => write!(f, "detach_disk({vm_id}, {disk_id})"),
            Self::DeleteSnapshot(id)
            | Self::DeleteDisk(id)
            | Self::DeleteVm(id)
            | Self::DeleteStemcell(id) => write!(f, "{}({id})", self.action_type_name()),
        }
    }
}

/// 정리 액션을 실제로 수행하는 쪽
///
/// 이미 없는 리소스는 `ResourceNotFound` 분류의 에러로 보고해야 합니다.
pub trait ResourceReleaser: Send + Sync {
    fn release(
        &self,
        action: &CleanupAction,
    ) -> impl Future<Output = Result<(), LifecycleError>> + Send;
}

/// 획득 순서대로 쌓인 (핸들, 정리 액션) 목록
#[derive(Debug, Clone, Default)]
pub struct LifecycleContext {
    entries: Vec<(ResourceHandle, CleanupAction)>,
}

impl LifecycleContext {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 획득 순서대로 순회합니다.
    pub fn iter(&self) -> impl Iterator<Item = &(ResourceHandle, CleanupAction)> {
        self.entries.iter()
    }

    /// 핸들에 등록된 정리 액션이 있는지 여부
    pub fn contains(&self, handle: &ResourceHandle) -> bool {
        self.entries.iter().any(|(h, _)| h == handle)
    }
}

/// 해체 결과
#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    /// 실행 순서대로 성공한 액션
    pub completed: Vec<CleanupAction>,
    /// 이미 사라진 리소스에 대한 액션
    pub already_gone: Vec<CleanupAction>,
    /// 포착된 해체 에러
    pub errors: Vec<ErrorRecord>,
}

impl TeardownReport {
    /// 해체 에러가 없었는지 여부
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// 해제된 리소스 핸들 (이미 사라진 것 포함)
    pub fn released(&self) -> impl Iterator<Item = ResourceHandle> + '_ {
        self.completed
            .iter()
            .chain(self.already_gone.iter())
            .filter(|a| a.releases_handle())
            .map(CleanupAction::handle)
    }

    /// 다른 해체 결과를 이어 붙입니다.
    pub fn merge(&mut self, other: TeardownReport) {
        self.completed.extend(other.completed);
        self.already_gone.extend(other.already_gone);
        self.errors.extend(other.errors);
    }
}

/// 해체 집계기
///
/// 실행 하나(또는 세션 하나)의 정리 액션 스택을 소유합니다.
#[derive(Debug, Default)]
pub struct TeardownAggregator {
    context: LifecycleContext,
}

impl TeardownAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 정리 액션을 등록합니다.
    ///
    /// # Errors
    ///
    /// 같은 액션이 이미 등록되어 있으면 `LifecycleError::DuplicateCleanup`.
    pub fn register(&mut self, action: CleanupAction) -> Result<(), LifecycleError> {
        let handle = action.handle();
        if self.context.entries.iter().any(|(_, a)| a == &action) {
            return Err(LifecycleError::DuplicateCleanup(handle));
        }
        info!(
            resource_kind = handle.kind.as_str(),
            resource_id = %handle.id,
            action = %action,
            "cleanup registered"
        );
        self.context.entries.push((handle, action));
        Ok(())
    }

    /// 핸들의 해제 액션을 등록합니다.
    pub fn register_release(&mut self, handle: &ResourceHandle) -> Result<(), LifecycleError> {
        self.register(CleanupAction::release(handle))
    }

    /// 아직 실행되지 않은 정리 액션
    pub fn context(&self) -> &LifecycleContext {
        &self.context
    }

    /// 등록된 모든 정리 액션을 역순으로 실행합니다.
    ///
    /// 실패는 액션마다 독립적으로 포착되어 보고서에 쌓이며, 해체를 중단하지 않습니다.
    /// 재시도는 하지 않습니다.
    pub async fn unwind<R: ResourceReleaser>(&mut self, releaser: &R) -> TeardownReport {
        let mut report = TeardownReport::default();

        while let Some((handle, action)) = self.context.entries.pop() {
            let kind = handle.kind.as_str();
            info!(
                resource_kind = kind,
                resource_id = %handle.id,
                action = %action,
                "running cleanup"
            );

            match releaser.release(&action).await {
                Ok(()) => {
                    if action.releases_handle() {
                        metrics::counter!(m::RESOURCES_RELEASED_TOTAL, m::LABEL_KIND => kind)
                            .increment(1);
                    }
                    report.completed.push(action);
                }
                Err(e) if e.is_not_found() => {
                    info!(
                        resource_kind = kind,
                        resource_id = %handle.id,
                        action = %action,
                        "resource already gone"
                    );
                    report.already_gone.push(action);
                }
                Err(e) => {
                    error!(
                        resource_kind = kind,
                        resource_id = %handle.id,
                        action = %action,
                        error = %e,
                        "cleanup failed"
                    );
                    metrics::counter!(m::TEARDOWN_FAILURES_TOTAL, m::LABEL_KIND => kind)
                        .increment(1);
                    report.errors.push(ErrorRecord::teardown(handle, e));
                }
            }
        }

        report
    }

    /// 전진 단계 결과와 해체 결과에 우선순위 규칙을 적용합니다.
    ///
    /// 전진 단계 에러가 있으면 그대로 반환하고 해체 에러는 버립니다.
    /// 없으면 첫 해체 에러를 반환합니다.
    pub fn finish<T>(
        outcome: Result<T, LifecycleError>,
        report: &TeardownReport,
    ) -> Result<T, LifecycleError> {
        match outcome {
            Err(primary) => {
                if !report.errors.is_empty() {
                    warn!(
                        primary = %primary,
                        discarded = report.errors.len(),
                        "primary failure preserved, teardown errors discarded"
                    );
                }
                Err(primary)
            }
            Ok(value) => match report.errors.first() {
                Some(first) => Err(first.error.clone()),
                None => Ok(value),
            },
        }
    }
}
