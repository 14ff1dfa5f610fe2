//! 도메인 타입: 라이프사이클 전역에서 사용되는 공통 타입
//!
//! 프로비저너, 검증기, 해체 집계기가 공유하는 리소스 식별자와
//! 백엔드 호출 인자(cloud properties) 구조를 정의합니다.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// VM/디스크에 부여되는 메타데이터 (key-value)
///
/// 순서가 안정적이어야 로그와 비교 결과가 결정적이므로 `BTreeMap`을 사용합니다.
pub type Metadata = BTreeMap<String, String>;

/// 리소스 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// 가상 머신
    Vm,
    /// 블록 스토리지 디스크
    Disk,
    /// 디스크 스냅샷
    Snapshot,
    /// 부팅 이미지 템플릿
    Stemcell,
}

impl ResourceKind {
    /// 메트릭 레이블/로그 필드용 고정 이름을 반환합니다.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vm => "vm",
            Self::Disk => "disk",
            Self::Snapshot => "snapshot",
            Self::Stemcell => "stemcell",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 프로비저너가 반환하는 불투명 리소스 핸들
///
/// 백엔드가 발급한 ID와 리소스 종류만 담습니다. ID의 형식은 백엔드마다
/// 다르므로 해석하지 않습니다.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceHandle {
    /// 리소스 종류
    pub kind: ResourceKind,
    /// 백엔드 리소스 ID
    pub id: String,
}

impl ResourceHandle {
    /// 새 핸들을 생성합니다.
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn vm(id: impl Into<String>) -> Self {
        Self::new(ResourceKind::Vm, id)
    }

    pub fn disk(id: impl Into<String>) -> Self {
        Self::new(ResourceKind::Disk, id)
    }

    pub fn snapshot(id: impl Into<String>) -> Self {
        Self::new(ResourceKind::Snapshot, id)
    }

    pub fn stemcell(id: impl Into<String>) -> Self {
        Self::new(ResourceKind::Stemcell, id)
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.id)
    }
}

/// 부팅 볼륨 크기 지정 (`resource_pool.root_disk`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootDisk {
    /// 크기 (GiB)
    pub size: u32,
}

/// VM 생성 시 resource pool (VM cloud properties)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePool {
    /// flavor 이름
    pub instance_type: String,
    /// 가용 영역
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
    /// 부팅 볼륨 크기 오버라이드
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_disk: Option<RootDisk>,
}

impl ResourcePool {
    /// flavor 이름만 지정한 resource pool을 생성합니다.
    pub fn new(instance_type: impl Into<String>) -> Self {
        Self {
            instance_type: instance_type.into(),
            ..Self::default()
        }
    }

    pub fn with_availability_zone(mut self, zone: impl Into<String>) -> Self {
        self.availability_zone = Some(zone.into());
        self
    }

    pub fn with_root_disk_size(mut self, size_gib: u32) -> Self {
        self.root_disk = Some(RootDisk { size: size_gib });
        self
    }
}

/// 디스크 생성 시 cloud properties
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskCloudProperties {
    /// 볼륨 타입 (없으면 백엔드 기본값)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,
}

impl DiskCloudProperties {
    pub fn with_volume_type(volume_type: impl Into<String>) -> Self {
        Self {
            volume_type: Some(volume_type.into()),
        }
    }
}

/// 스템셀 업로드 시 cloud properties
///
/// `image_id`가 있으면 이미지를 다시 업로드하지 않고 기존 이미지를 참조하는
/// light 스템셀로 등록됩니다.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StemcellCloudProperties {
    /// 참조할 기존 이미지 ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
}

impl StemcellCloudProperties {
    pub fn light(image_id: impl Into<String>) -> Self {
        Self {
            image_id: Some(image_id.into()),
        }
    }
}

/// light 스템셀 ID 접미어
pub const LIGHT_STEMCELL_SUFFIX: &str = " light";

/// 이미지 ID로부터 light 스템셀 ID를 만듭니다 (`"<image_id> light"`).
pub fn light_stemcell_id(image_id: &str) -> String {
    format!("{image_id}{LIGHT_STEMCELL_SUFFIX}")
}

/// light 스템셀 ID라면 참조하는 이미지 ID를 반환합니다.
pub fn heavy_image_id(stemcell_id: &str) -> &str {
    stemcell_id
        .strip_suffix(LIGHT_STEMCELL_SUFFIX)
        .unwrap_or(stemcell_id)
}
