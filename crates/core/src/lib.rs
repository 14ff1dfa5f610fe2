#![doc = include_str!("../README.md")]

pub mod config;
pub mod error;
pub mod metrics;
pub mod network;
pub mod types;

// --- 주요 타입 re-export ---

// 에러
pub use error::{ConfigError, LifecheckError, NetworkSpecError, RunError};

// 설정
pub use config::IntegrationConfig;

// 네트워크 스펙
pub use network::{Network, NetworkKind, NetworkSpec};

// 도메인 타입
pub use types::{
    DiskCloudProperties, Metadata, ResourceHandle, ResourceKind, ResourcePool,
    StemcellCloudProperties,
};
