//! 라이프사이클 실행 설정
//!
//! [`LifecycleConfig`]는 core의 [`IntegrationConfig`]를 기반으로 실행 하나에
//! 필요한 CPI 옵션과 디스크/스냅샷 설정을 제공합니다. 시나리오마다 CPI 옵션이
//! 달라지므로 보통 `from_core`로 기본값을 만든 뒤 필드를 바꿔 사용합니다.
//!
//! # 사용 예시
//! ```
//! use lifecheck_core::config::IntegrationConfig;
//! use lifecheck_lifecycle::config::LifecycleConfig;
//!
//! let core_config = IntegrationConfig::default();
//! let config = LifecycleConfig::from_core(&core_config).unwrap();
//! assert_eq!(config.disk_size_mb, 2048);
//! ```

use serde::{Deserialize, Serialize};

use lifecheck_core::config::IntegrationConfig;
use lifecheck_core::types::{DiskCloudProperties, ResourcePool};

use crate::cpi::{ConfigDrive, CpiOptions};
use crate::error::LifecycleError;

/// 기본 에이전트 ID
pub const DEFAULT_AGENT_ID: &str = "agent-007";

/// 설정 범위 상수
const MIN_DISK_SIZE_MB: u32 = 1024;
const MAX_DISK_SIZE_MB: u32 = 16 * 1024 * 1024;

/// 라이프사이클 실행 설정
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// CPI 생성 옵션
    pub cpi: CpiOptions,
    /// 스냅샷 단계 생략
    pub disable_snapshots: bool,
    /// 영구 디스크 크기 (MiB)
    pub disk_size_mb: u32,
    /// `create_vm`에 넘기는 에이전트 ID
    pub agent_id: String,
    /// flavor 이름
    pub instance_type: String,
    /// 가용 영역 (비어 있으면 지정하지 않음)
    pub availability_zone: String,
    /// 볼륨 타입 시나리오에서 사용할 타입
    pub volume_type: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            cpi: CpiOptions::default(),
            disable_snapshots: false,
            disk_size_mb: 2048,
            agent_id: DEFAULT_AGENT_ID.to_owned(),
            instance_type: "m1.small".to_owned(),
            availability_zone: String::new(),
            volume_type: "standard".to_owned(),
        }
    }
}

impl LifecycleConfig {
    /// 세션 설정에서 실행 설정을 생성합니다.
    ///
    /// # Errors
    ///
    /// `cloud.config_drive`가 알 수 없는 값이면 `LifecycleError::Config`.
    pub fn from_core(core: &IntegrationConfig) -> Result<Self, LifecycleError> {
        let config_drive =
            ConfigDrive::parse(&core.cloud.config_drive).map_err(|e| LifecycleError::Config {
                field: "cloud.config_drive".to_owned(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            cpi: CpiOptions {
                config_drive,
                ..CpiOptions::default()
            },
            disable_snapshots: core.cloud.disable_snapshots,
            disk_size_mb: core.cloud.disk_size_mb,
            agent_id: DEFAULT_AGENT_ID.to_owned(),
            instance_type: core.cloud.instance_type.clone(),
            availability_zone: core.cloud.availability_zone.clone(),
            volume_type: core.cloud.volume_type.clone(),
        })
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), LifecycleError> {
        if !(MIN_DISK_SIZE_MB..=MAX_DISK_SIZE_MB).contains(&self.disk_size_mb) {
            return Err(LifecycleError::Config {
                field: "disk_size_mb".to_owned(),
                reason: format!("must be {MIN_DISK_SIZE_MB}-{MAX_DISK_SIZE_MB}"),
            });
        }

        if self.agent_id.is_empty() {
            return Err(LifecycleError::Config {
                field: "agent_id".to_owned(),
                reason: "must not be empty".to_owned(),
            });
        }

        if self.instance_type.is_empty() {
            return Err(LifecycleError::Config {
                field: "instance_type".to_owned(),
                reason: "must not be empty".to_owned(),
            });
        }

        Ok(())
    }

    /// 기본 resource pool (flavor + 가용 영역)
    pub fn resource_pool(&self) -> ResourcePool {
        let pool = ResourcePool::new(&self.instance_type);
        if self.availability_zone.is_empty() {
            pool
        } else {
            pool.with_availability_zone(&self.availability_zone)
        }
    }

    /// 볼륨 타입을 지정한 디스크 cloud properties
    pub fn typed_disk_properties(&self) -> DiskCloudProperties {
        DiskCloudProperties::with_volume_type(&self.volume_type)
    }
}

/// 라이프사이클 설정 빌더
#[derive(Default)]
pub struct LifecycleConfigBuilder {
    config: LifecycleConfig,
}

impl LifecycleConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 세션 설정에서 파생된 값으로 시작합니다.
    pub fn from_core(core: &IntegrationConfig) -> Result<Self, LifecycleError> {
        Ok(Self {
            config: LifecycleConfig::from_core(core)?,
        })
    }

    pub fn boot_from_volume(mut self, enabled: bool) -> Self {
        self.config.cpi.boot_from_volume = enabled;
        self
    }

    pub fn config_drive(mut self, drive: Option<ConfigDrive>) -> Self {
        self.config.cpi.config_drive = drive;
        self
    }

    pub fn use_dhcp(mut self, enabled: bool) -> Self {
        self.config.cpi.use_dhcp = enabled;
        self
    }

    pub fn human_readable_vm_names(mut self, enabled: bool) -> Self {
        self.config.cpi.human_readable_vm_names = enabled;
        self
    }

    pub fn use_nova_networking(mut self, enabled: bool) -> Self {
        self.config.cpi.use_nova_networking = enabled;
        self
    }

    pub fn disable_snapshots(mut self, disabled: bool) -> Self {
        self.config.disable_snapshots = disabled;
        self
    }

    pub fn disk_size_mb(mut self, size_mb: u32) -> Self {
        self.config.disk_size_mb = size_mb;
        self
    }

    pub fn agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.config.agent_id = agent_id.into();
        self
    }

    pub fn instance_type(mut self, instance_type: impl Into<String>) -> Self {
        self.config.instance_type = instance_type.into();
        self
    }

    pub fn availability_zone(mut self, zone: impl Into<String>) -> Self {
        self.config.availability_zone = zone.into();
        self
    }

    pub fn volume_type(mut self, volume_type: impl Into<String>) -> Self {
        self.config.volume_type = volume_type.into();
        self
    }

    /// 설정을 검증하고 `LifecycleConfig`를 생성합니다.
    pub fn build(self) -> Result<LifecycleConfig, LifecycleError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
