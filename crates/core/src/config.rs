//! 설정 관리: lifecheck.toml 파싱 및 세션 설정
//!
//! [`IntegrationConfig`]는 테스트 세션 전체가 공유하는 최상위 설정입니다.
//! 세션 시작 시 한 번 생성되어 `Arc`로 프로비저너와 시나리오 매트릭스에
//! 전달되며, 생성 이후에는 읽기 전용입니다.
//!
//! # 설정 로딩 우선순위
//! 1. 환경변수 (`LIFECHECK_NETWORK_MANUAL_IP=10.0.0.5` 형식)
//! 2. 설정 파일 (`lifecheck.toml`)
//! 3. 기본값 (`Default` 구현)
//!
//! # 사용 예시
//! ```no_run
//! # async fn example() -> Result<(), lifecheck_core::error::LifecheckError> {
//! use lifecheck_core::config::IntegrationConfig;
//!
//! // 파일에서 로드 + 환경변수 오버라이드
//! let config = IntegrationConfig::load("lifecheck.toml").await?;
//!
//! // TOML 문자열에서 직접 파싱
//! let config = IntegrationConfig::parse("[general]\nlog_level = \"debug\"")?;
//! # Ok(())
//! # }
//! ```

use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, LifecheckError};

/// 연결 타임아웃 상한 (초)
const MAX_CONNECTION_TIMEOUT_SECS: u64 = 600;

/// lifecheck 세션 설정
///
/// `lifecheck.toml` 파일의 최상위 구조를 나타냅니다.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrationConfig {
    /// 일반 설정
    #[serde(default)]
    pub general: GeneralConfig,
    /// 프로바이더 자격 증명
    #[serde(default)]
    pub openstack: OpenStackConfig,
    /// 이미지/flavor/볼륨 설정
    #[serde(default)]
    pub cloud: CloudConfig,
    /// 토폴로지별 네트워크 식별자
    #[serde(default)]
    pub network: NetworkConfig,
}

impl IntegrationConfig {
    /// TOML 파일에서 설정을 로드하고 환경변수 오버라이드를 적용합니다.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, LifecheckError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 설정을 로드합니다 (환경변수 오버라이드 없음).
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, LifecheckError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LifecheckError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                LifecheckError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// TOML 문자열에서 설정을 파싱합니다.
    pub fn parse(toml_str: &str) -> Result<Self, LifecheckError> {
        toml::from_str(toml_str).map_err(|e| {
            LifecheckError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// 환경변수로 설정값을 오버라이드합니다.
    ///
    /// 환경변수 네이밍 규칙: `LIFECHECK_{SECTION}_{FIELD}`
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "LIFECHECK_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "LIFECHECK_GENERAL_LOG_FORMAT");

        // OpenStack
        override_string(&mut self.openstack.auth_url, "LIFECHECK_OPENSTACK_AUTH_URL");
        override_string(&mut self.openstack.username, "LIFECHECK_OPENSTACK_USERNAME");
        override_string(&mut self.openstack.api_key, "LIFECHECK_OPENSTACK_API_KEY");
        override_string(&mut self.openstack.project, "LIFECHECK_OPENSTACK_PROJECT");
        override_string(&mut self.openstack.domain, "LIFECHECK_OPENSTACK_DOMAIN");
        override_string(&mut self.openstack.region, "LIFECHECK_OPENSTACK_REGION");
        override_u64(
            &mut self.openstack.connection_timeout_secs,
            "LIFECHECK_OPENSTACK_CONNECTION_TIMEOUT_SECS",
        );

        // Cloud
        override_string(&mut self.cloud.stemcell_path, "LIFECHECK_CLOUD_STEMCELL_PATH");
        override_string(&mut self.cloud.instance_type, "LIFECHECK_CLOUD_INSTANCE_TYPE");
        override_string(
            &mut self.cloud.instance_type_with_no_root_disk,
            "LIFECHECK_CLOUD_INSTANCE_TYPE_WITH_NO_ROOT_DISK",
        );
        override_string(
            &mut self.cloud.availability_zone,
            "LIFECHECK_CLOUD_AVAILABILITY_ZONE",
        );
        override_string(&mut self.cloud.volume_type, "LIFECHECK_CLOUD_VOLUME_TYPE");
        override_string(&mut self.cloud.config_drive, "LIFECHECK_CLOUD_CONFIG_DRIVE");
        override_bool(
            &mut self.cloud.disable_snapshots,
            "LIFECHECK_CLOUD_DISABLE_SNAPSHOTS",
        );
        override_u32(&mut self.cloud.disk_size_mb, "LIFECHECK_CLOUD_DISK_SIZE_MB");

        // Network
        override_string(&mut self.network.net_id, "LIFECHECK_NETWORK_NET_ID");
        override_string(&mut self.network.manual_ip, "LIFECHECK_NETWORK_MANUAL_IP");
        override_string(&mut self.network.floating_ip, "LIFECHECK_NETWORK_FLOATING_IP");
        override_string(
            &mut self.network.net_id_no_dhcp_1,
            "LIFECHECK_NETWORK_NET_ID_NO_DHCP_1",
        );
        override_string(
            &mut self.network.net_id_no_dhcp_2,
            "LIFECHECK_NETWORK_NET_ID_NO_DHCP_2",
        );
        override_string(
            &mut self.network.no_dhcp_manual_ip_1,
            "LIFECHECK_NETWORK_NO_DHCP_MANUAL_IP_1",
        );
        override_string(
            &mut self.network.no_dhcp_manual_ip_2,
            "LIFECHECK_NETWORK_NO_DHCP_MANUAL_IP_2",
        );
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), LifecheckError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(invalid(
                "general.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        if self.openstack.connection_timeout_secs == 0
            || self.openstack.connection_timeout_secs > MAX_CONNECTION_TIMEOUT_SECS
        {
            return Err(invalid(
                "openstack.connection_timeout_secs",
                format!("must be 1-{MAX_CONNECTION_TIMEOUT_SECS}"),
            ));
        }

        // config drive: 비어 있으면 사용하지 않음
        let valid_drives = ["", "cdrom", "disk"];
        if !valid_drives.contains(&self.cloud.config_drive.as_str()) {
            return Err(invalid(
                "cloud.config_drive",
                "must be empty, 'cdrom' or 'disk'".to_owned(),
            ));
        }

        if self.cloud.disk_size_mb == 0 {
            return Err(invalid(
                "cloud.disk_size_mb",
                "must be greater than 0".to_owned(),
            ));
        }

        if self.cloud.instance_type.is_empty() {
            return Err(invalid(
                "cloud.instance_type",
                "must not be empty".to_owned(),
            ));
        }

        if self.network.net_id.is_empty() {
            return Err(invalid("network.net_id", "must not be empty".to_owned()));
        }

        let manual_ips = [
            ("network.manual_ip", &self.network.manual_ip),
            ("network.no_dhcp_manual_ip_1", &self.network.no_dhcp_manual_ip_1),
            ("network.no_dhcp_manual_ip_2", &self.network.no_dhcp_manual_ip_2),
        ];
        let mut seen: Vec<(&str, IpAddr)> = Vec::with_capacity(manual_ips.len());
        for (field, value) in manual_ips {
            let ip = parse_ip(field, value)?;
            // 시나리오끼리 같은 백엔드를 공유하므로 manual IP는 서로 달라야 함
            if let Some((other, _)) = seen.iter().find(|(_, existing)| *existing == ip) {
                return Err(invalid(field, format!("duplicates {other} ({ip})")));
            }
            seen.push((field, ip));
        }
        parse_ip("network.floating_ip", &self.network.floating_ip)?;

        Ok(())
    }

    /// config drive 모드 (비어 있으면 `None`)
    pub fn config_drive(&self) -> Option<&str> {
        if self.cloud.config_drive.is_empty() {
            None
        } else {
            Some(self.cloud.config_drive.as_str())
        }
    }
}

fn invalid(field: &str, reason: String) -> LifecheckError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason,
    }
    .into()
}

fn parse_ip(field: &str, value: &str) -> Result<IpAddr, LifecheckError> {
    value
        .parse::<IpAddr>()
        .map_err(|_| invalid(field, format!("'{value}' is not a valid ip address")))
}

/// 일반 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 로그 레벨 (trace, debug, info, warn, error)
    pub log_level: String,
    /// 로그 형식 (json, pretty)
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "pretty".to_owned(),
        }
    }
}

/// 프로바이더 자격 증명
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenStackConfig {
    /// Keystone 엔드포인트
    pub auth_url: String,
    /// 사용자명
    pub username: String,
    /// API 키 (비밀번호)
    pub api_key: String,
    /// 프로젝트 (tenant)
    pub project: String,
    /// 도메인
    pub domain: String,
    /// 리전
    pub region: String,
    /// API 연결 타임아웃 (초)
    pub connection_timeout_secs: u64,
}

impl Default for OpenStackConfig {
    fn default() -> Self {
        Self {
            auth_url: "http://127.0.0.1:5000/v3".to_owned(),
            username: "admin".to_owned(),
            api_key: String::new(),
            project: "lifecheck".to_owned(),
            domain: "Default".to_owned(),
            region: "RegionOne".to_owned(),
            connection_timeout_secs: 60,
        }
    }
}

/// 이미지/flavor/볼륨 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// 세션 시작 시 업로드할 스템셀 경로
    pub stemcell_path: String,
    /// 기본 flavor
    pub instance_type: String,
    /// 루트 디스크 크기가 0인 flavor (boot-from-volume 테스트용)
    pub instance_type_with_no_root_disk: String,
    /// 가용 영역
    pub availability_zone: String,
    /// cloud_properties 시나리오에서 사용할 볼륨 타입
    pub volume_type: String,
    /// config drive 모드 ("", "cdrom", "disk")
    pub config_drive: String,
    /// 스냅샷 단계 생략
    pub disable_snapshots: bool,
    /// 생성할 영구 디스크 크기 (MB)
    pub disk_size_mb: u32,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            stemcell_path: "/tmp/stemcell/image".to_owned(),
            instance_type: "m1.small".to_owned(),
            instance_type_with_no_root_disk: "m1.zero".to_owned(),
            availability_zone: "nova".to_owned(),
            volume_type: "standard".to_owned(),
            config_drive: "cdrom".to_owned(),
            disable_snapshots: false,
            disk_size_mb: 2048,
        }
    }
}

/// 토폴로지별 네트워크 식별자
///
/// 같은 환경에서 실행되는 시나리오들이 서로 겹치지 않도록 외부에서 공급합니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// 기본 네트워크 ID
    pub net_id: String,
    /// manual 네트워크 IP
    pub manual_ip: String,
    /// 할당 가능한 floating IP
    pub floating_ip: String,
    /// DHCP가 없는 첫 번째 네트워크
    pub net_id_no_dhcp_1: String,
    /// DHCP가 없는 두 번째 네트워크
    pub net_id_no_dhcp_2: String,
    /// 첫 번째 no-DHCP 네트워크 IP
    pub no_dhcp_manual_ip_1: String,
    /// 두 번째 no-DHCP 네트워크 IP
    pub no_dhcp_manual_ip_2: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            net_id: "net-default".to_owned(),
            manual_ip: "10.0.0.10".to_owned(),
            floating_ip: "203.0.113.10".to_owned(),
            net_id_no_dhcp_1: "net-no-dhcp-1".to_owned(),
            net_id_no_dhcp_2: "net-no-dhcp-2".to_owned(),
            no_dhcp_manual_ip_1: "10.1.0.10".to_owned(),
            no_dhcp_manual_ip_2: "10.2.0.10".to_owned(),
        }
    }
}

// --- 환경변수 오버라이드 헬퍼 ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<bool>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse bool from env var, ignoring"
            ),
        }
    }
}

fn override_u32(target: &mut u32, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u32>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u32 from env var, ignoring"
            ),
        }
    }
}

fn override_u64(target: &mut u64, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u64>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u64 from env var, ignoring"
            ),
        }
    }
}
