//! 에러 타입: 설정, 네트워크 스펙, 실행 단계 에러

use crate::types::ResourceKind;

/// lifecheck 최상위 에러 타입
#[derive(Debug, thiserror::Error)]
pub enum LifecheckError {
    /// 설정 관련 에러
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// 네트워크 스펙 검증 에러
    #[error("network spec error: {0}")]
    Network(#[from] NetworkSpecError),

    /// 라이프사이클 실행 에러
    #[error("lifecycle error: {0}")]
    Run(#[from] RunError),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 설정 관련 에러
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 설정 파일을 찾을 수 없음
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// 설정 파싱 실패
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// 유효하지 않은 설정 값
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// 네트워크 스펙 검증 에러
///
/// 프로비저닝 호출 전에 잘못된 조합을 거부하기 위해 사용됩니다.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkSpecError {
    /// 네트워크가 하나도 없음
    #[error("network spec must contain at least one non-vip network")]
    NoUsableNetwork,

    /// vip 네트워크가 둘 이상
    #[error("only one vip network is allowed, found '{first}' and '{second}'")]
    MultipleVip { first: String, second: String },

    /// IP가 필요한 네트워크에 IP가 없음
    #[error("network '{network}' of type {kind} requires an ip")]
    MissingIp { network: String, kind: String },

    /// IP 주소 형식 오류
    #[error("network '{network}' has an invalid ip '{ip}'")]
    InvalidIp { network: String, ip: String },

    /// net_id 누락
    #[error("network '{network}' requires cloud_properties.net_id")]
    MissingNetId { network: String },

    /// 알 수 없는 네트워크 타입
    #[error("network '{network}' has unknown type '{kind}'")]
    UnknownType { network: String, kind: String },

    /// 와이어 형식 파싱 실패
    #[error("malformed network spec: {reason}")]
    Malformed { reason: String },
}

/// 라이프사이클 실행 에러
///
/// 라이프사이클 크레이트의 도메인 에러가 최상위로 전파될 때의 형태입니다.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// 백엔드가 VM 생성을 거부함
    #[error("vm creation failed: {0}")]
    VmCreationFailed(String),

    /// 일반적인 프로바이더 거부
    #[error("cloud error: {0}")]
    Cloud(String),

    /// 리소스를 찾을 수 없음
    #[error("{kind} '{id}' not found")]
    NotFound { kind: ResourceKind, id: String },

    /// 단계 사이 검증 실패
    #[error("verification failed: {0}")]
    Verification(String),

    /// 해체 중 실패
    #[error("teardown failed: {0}")]
    Teardown(String),
}
