//! 에이전트 레지스트리: 메타데이터 등록 사이드 채널
//!
//! 백엔드는 VM을 만들 때 에이전트 설정(네트워크별 MAC, IP, DHCP 여부)을
//! 레지스트리에 기록합니다. 검증기는 이 기록을 프로바이더가 보고하는
//! 인터페이스 정보와 대조합니다.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::CpiError;

/// 네트워크별 에이전트 설정 (`networks.<name>`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// 네트워크 타입 (`dynamic` / `manual` / `vip`)
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    /// 포트 MAC 주소 (vip에는 없음)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    pub use_dhcp: bool,
}

/// VM 하나의 에이전트 설정
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSettings {
    pub agent_id: String,
    pub vm_name: String,
    pub networks: BTreeMap<String, NetworkSettings>,
    /// 디스크 ID → 장치 경로
    pub persistent_disks: BTreeMap<String, String>,
    pub env: BTreeMap<String, serde_json::Value>,
}

/// 에이전트 설정 저장소
pub trait AgentRegistry: Send + Sync + 'static {
    /// 설정을 기록(덮어쓰기)합니다.
    fn update_settings(
        &self,
        instance_id: &str,
        settings: AgentSettings,
    ) -> impl Future<Output = Result<(), CpiError>> + Send;

    /// 설정을 읽습니다. 없으면 `None`.
    fn read_settings(
        &self,
        instance_id: &str,
    ) -> impl Future<Output = Result<Option<AgentSettings>, CpiError>> + Send;

    /// 설정을 삭제합니다. 없는 항목 삭제는 성공으로 취급합니다.
    fn delete_settings(
        &self,
        instance_id: &str,
    ) -> impl Future<Output = Result<(), CpiError>> + Send;
}

/// 메모리 기반 레지스트리
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    settings: Mutex<HashMap<String, AgentSettings>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 등록된 인스턴스 수
    pub async fn len(&self) -> usize {
        self.settings.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.settings.lock().await.is_empty()
    }
}

impl AgentRegistry for InMemoryRegistry {
    async fn update_settings(
        &self,
        instance_id: &str,
        settings: AgentSettings,
    ) -> Result<(), CpiError> {
        self.settings
            .lock()
            .await
            .insert(instance_id.to_owned(), settings);
        Ok(())
    }

    async fn read_settings(&self, instance_id: &str) -> Result<Option<AgentSettings>, CpiError> {
        Ok(self.settings.lock().await.get(instance_id).cloned())
    }

    async fn delete_settings(&self, instance_id: &str) -> Result<(), CpiError> {
        self.settings.lock().await.remove(instance_id);
        Ok(())
    }
}
