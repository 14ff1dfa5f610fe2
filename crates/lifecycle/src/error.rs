//! 라이프사이클 에러 타입
//!
//! [`CpiError`]는 백엔드(CPI)가 분류해 돌려주는 에러이고,
//! [`LifecycleError`]는 프로비저닝/검증/해체 전 과정에서 발생하는 모든 에러를
//! 표현합니다. `From<LifecycleError> for LifecheckError` 변환이 구현되어 있어
//! 상위 레이어에서 `?` 연산자로 전파할 수 있습니다.

use std::fmt;

use lifecheck_core::error::{ConfigError, LifecheckError, NetworkSpecError, RunError};
use lifecheck_core::types::{ResourceHandle, ResourceKind};

/// 백엔드 계약이 반환하는 분류된 에러
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CpiError {
    /// VM이 생성되지 않음 (할당 불가능한 floating IP, 존재하지 않는 네트워크 등)
    #[error("vm creation failed: {0}")]
    VmCreationFailed(String),

    /// 일반적인 프로바이더 거부 (존재하지 않는 이미지, 루트 디스크 0 flavor 등)
    #[error("cloud error: {0}")]
    Cloud(String),

    /// 대상 리소스가 없음
    #[error("{kind} '{id}' not found")]
    ResourceNotFound {
        /// 리소스 종류
        kind: ResourceKind,
        /// 리소스 ID
        id: String,
    },
}

impl CpiError {
    pub fn not_found(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self::ResourceNotFound {
            kind,
            id: id.into(),
        }
    }
}

/// 라이프사이클 도메인 에러
#[derive(Debug, Clone, thiserror::Error)]
pub enum LifecycleError {
    /// 백엔드 호출 실패
    #[error(transparent)]
    Cpi(#[from] CpiError),

    /// 단계 사이 사후 조건 실패
    #[error("verification failed at {step}: {reason}")]
    Verification {
        /// 검증 단계명
        step: String,
        /// 실패 사유
        reason: String,
    },

    /// 네트워크 스펙 거부
    #[error("invalid network spec: {0}")]
    Network(#[from] NetworkSpecError),

    /// 해체 중 정리 액션 실패
    #[error("teardown of {handle} failed: {source}")]
    Teardown {
        /// 해제하려던 리소스
        handle: ResourceHandle,
        /// 원인
        #[source]
        source: Box<LifecycleError>,
    },

    /// 허용되지 않은 상태 전이
    #[error("invalid lifecycle transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    /// 같은 리소스에 대한 정리 액션 중복 등록
    #[error("cleanup already registered for {0}")]
    DuplicateCleanup(ResourceHandle),

    /// 설정 에러
    #[error("config error: {field}: {reason}")]
    Config {
        /// 설정 필드명
        field: String,
        /// 에러 사유
        reason: String,
    },
}

impl LifecycleError {
    /// 검증 실패 에러를 생성합니다.
    pub fn verification(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Verification {
            step: step.into(),
            reason: reason.into(),
        }
    }

    /// 에러 분류를 반환합니다.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Cpi(CpiError::VmCreationFailed(_)) => ErrorClass::VmCreationFailed,
            Self::Cpi(CpiError::Cloud(_)) => ErrorClass::CloudError,
            Self::Cpi(CpiError::ResourceNotFound { .. }) => ErrorClass::ResourceNotFound,
            Self::Verification { .. } => ErrorClass::Verification,
            Self::Teardown { .. } => ErrorClass::Teardown,
            Self::Network(_)
            | Self::InvalidTransition { .. }
            | Self::DuplicateCleanup(_)
            | Self::Config { .. } => ErrorClass::InvalidInput,
        }
    }

    /// 전진 단계에서 발생했을 때의 단계 구분
    pub fn phase(&self) -> Phase {
        match self {
            Self::Verification { .. } => Phase::Verification,
            Self::Teardown { .. } => Phase::Teardown,
            _ => Phase::Provisioning,
        }
    }

    /// 백엔드가 리소스를 찾지 못한 경우인지 여부
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Cpi(CpiError::ResourceNotFound { .. }))
    }
}

/// 에러 분류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    VmCreationFailed,
    CloudError,
    ResourceNotFound,
    Verification,
    InvalidInput,
    Teardown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VmCreationFailed => "vm_creation_failed",
            Self::CloudError => "cloud_error",
            Self::ResourceNotFound => "resource_not_found",
            Self::Verification => "verification",
            Self::InvalidInput => "invalid_input",
            Self::Teardown => "teardown",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 에러가 발생한 실행 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Provisioning,
    Verification,
    Teardown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Provisioning => "provisioning",
            Self::Verification => "verification",
            Self::Teardown => "teardown",
        })
    }
}

/// 포착된 실패 기록
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    /// 원인 에러
    pub error: LifecycleError,
    /// 분류
    pub class: ErrorClass,
    /// 발생 단계
    pub phase: Phase,
}

impl ErrorRecord {
    /// 해체 단계 에러를 기록합니다.
    ///
    /// 원인은 `LifecycleError::Teardown`으로 감싸지고, 분류는 원인의 분류를 따릅니다.
    pub fn teardown(handle: ResourceHandle, source: LifecycleError) -> Self {
        Self {
            class: source.class(),
            phase: Phase::Teardown,
            error: LifecycleError::Teardown {
                handle,
                source: Box::new(source),
            },
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}] {}", self.phase, self.class, self.error)
    }
}

impl From<LifecycleError> for LifecheckError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::Cpi(CpiError::VmCreationFailed(msg)) => {
                LifecheckError::Run(RunError::VmCreationFailed(msg))
            }
            LifecycleError::Cpi(CpiError::Cloud(msg)) => LifecheckError::Run(RunError::Cloud(msg)),
            LifecycleError::Cpi(CpiError::ResourceNotFound { kind, id }) => {
                LifecheckError::Run(RunError::NotFound { kind, id })
            }
            LifecycleError::Network(e) => LifecheckError::Network(e),
            LifecycleError::Config { field, reason } => {
                LifecheckError::Config(ConfigError::InvalidValue { field, reason })
            }
            err @ LifecycleError::Teardown { .. } => {
                LifecheckError::Run(RunError::Teardown(err.to_string()))
            }
            err @ (LifecycleError::Verification { .. }
            | LifecycleError::InvalidTransition { .. }
            | LifecycleError::DuplicateCleanup(_)) => {
                LifecheckError::Run(RunError::Verification(err.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_creation_failed_display_keeps_identifier() {
        let err = CpiError::VmCreationFailed("Floating IP '255.255.255.255' not allocated".into());
        assert!(err.to_string().contains("'255.255.255.255'"));
    }

    #[test]
    fn cpi_error_is_transparent_in_lifecycle_error() {
        let err: LifecycleError = CpiError::Cloud("Image 'x' could not be found".into()).into();
        assert_eq!(err.to_string(), "cloud error: Image 'x' could not be found");
        assert_eq!(err.class(), ErrorClass::CloudError);
        assert_eq!(err.phase(), Phase::Provisioning);
    }

    #[test]
    fn verification_error_display() {
        let err = LifecycleError::verification("has_vm", "vm 'i-1' does not exist");
        let msg = err.to_string();
        assert!(msg.contains("has_vm"));
        assert!(msg.contains("i-1"));
        assert_eq!(err.phase(), Phase::Verification);
    }

    #[test]
    fn teardown_error_chains_source() {
        let err = LifecycleError::Teardown {
            handle: ResourceHandle::disk("vol-1"),
            source: Box::new(CpiError::Cloud("volume busy".into()).into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("disk 'vol-1'"));
        assert!(msg.contains("volume busy"));
        assert_eq!(err.class(), ErrorClass::Teardown);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn not_found_is_detected() {
        let err: LifecycleError = CpiError::not_found(ResourceKind::Vm, "i-9").into();
        assert!(err.is_not_found());
        assert_eq!(err.class(), ErrorClass::ResourceNotFound);
    }

    #[test]
    fn error_record_teardown_phase() {
        let teardown = ErrorRecord::teardown(
            ResourceHandle::snapshot("snap-1"),
            CpiError::Cloud("boom".into()).into(),
        );
        assert_eq!(teardown.phase, Phase::Teardown);
        assert_eq!(teardown.class, ErrorClass::CloudError);
        assert!(matches!(teardown.error, LifecycleError::Teardown { .. }));
        let msg = teardown.to_string();
        assert!(msg.starts_with("[teardown/cloud_error]"));
        assert!(msg.contains("snapshot 'snap-1'"));
    }

    #[test]
    fn converts_to_lifecheck_error_vm_creation_failed() {
        let err: LifecheckError =
            LifecycleError::from(CpiError::VmCreationFailed("bad net".into())).into();
        assert!(matches!(
            err,
            LifecheckError::Run(RunError::VmCreationFailed(_))
        ));
    }

    #[test]
    fn converts_to_lifecheck_error_network() {
        let err: LifecheckError = LifecycleError::Network(NetworkSpecError::NoUsableNetwork).into();
        assert!(matches!(err, LifecheckError::Network(_)));
    }

    #[test]
    fn converts_to_lifecheck_error_teardown() {
        let err: LifecheckError = LifecycleError::Teardown {
            handle: ResourceHandle::vm("i-1"),
            source: Box::new(LifecycleError::verification("has_vm", "still present")),
        }
        .into();
        assert!(matches!(err, LifecheckError::Run(RunError::Teardown(_))));
    }
}
