//! 네트워크 스펙: `create_vm`에 전달되는 네트워크 구성
//!
//! 와이어 형식은 네트워크 이름 → `{type, ip?, cloud_properties, use_dhcp?}` 맵입니다.
//! [`NetworkSpec`]은 생성 시점에 검증되므로, 잘못된 조합(vip 두 개, IP 없는
//! manual 등)은 어떤 프로비저닝 호출보다도 먼저 거부됩니다.
//!
//! # 사용 예시
//! ```
//! use lifecheck_core::network::{Network, NetworkSpec};
//!
//! let spec = NetworkSpec::new([
//!     ("default", Network::manual("10.0.0.5".parse().unwrap(), "net-1")),
//!     ("vip", Network::vip("203.0.113.10".parse().unwrap())),
//! ])
//! .unwrap();
//! assert!(spec.vip().is_some());
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::NetworkSpecError;

/// 네트워크 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    /// 백엔드가 IP를 할당 (DHCP)
    Dynamic,
    /// 지정된 IP로 포트를 생성
    Manual,
    /// floating IP
    Vip,
}

impl NetworkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dynamic => "dynamic",
            Self::Manual => "manual",
            Self::Vip => "vip",
        }
    }
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 프로바이더별 네트워크 cloud properties
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkCloudProperties {
    /// 연결할 네트워크 ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_id: Option<String>,
    /// 그 외 프로바이더 전용 키 (security_groups 등)
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// 단일 네트워크 항목
#[derive(Debug, Clone, PartialEq)]
pub struct Network {
    kind: NetworkKind,
    ip: Option<IpAddr>,
    cloud_properties: NetworkCloudProperties,
    use_dhcp: Option<bool>,
}

impl Network {
    /// dynamic 네트워크를 생성합니다.
    pub fn dynamic(net_id: impl Into<String>) -> Self {
        Self::with_net_id(NetworkKind::Dynamic, None, net_id)
    }

    /// manual 네트워크를 생성합니다.
    pub fn manual(ip: IpAddr, net_id: impl Into<String>) -> Self {
        Self::with_net_id(NetworkKind::Manual, Some(ip), net_id)
    }

    /// vip(floating IP) 네트워크를 생성합니다.
    pub fn vip(ip: IpAddr) -> Self {
        Self {
            kind: NetworkKind::Vip,
            ip: Some(ip),
            cloud_properties: NetworkCloudProperties::default(),
            use_dhcp: None,
        }
    }

    fn with_net_id(kind: NetworkKind, ip: Option<IpAddr>, net_id: impl Into<String>) -> Self {
        Self {
            kind,
            ip,
            cloud_properties: NetworkCloudProperties {
                net_id: Some(net_id.into()),
                extra: BTreeMap::new(),
            },
            use_dhcp: None,
        }
    }

    /// DHCP 사용 여부를 명시합니다.
    pub fn with_use_dhcp(mut self, use_dhcp: bool) -> Self {
        self.use_dhcp = Some(use_dhcp);
        self
    }

    pub fn kind(&self) -> NetworkKind {
        self.kind
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    pub fn net_id(&self) -> Option<&str> {
        self.cloud_properties.net_id.as_deref()
    }

    pub fn cloud_properties(&self) -> &NetworkCloudProperties {
        &self.cloud_properties
    }

    /// 명시된 DHCP 플래그 (와이어에 없으면 `None`)
    pub fn use_dhcp(&self) -> Option<bool> {
        self.use_dhcp
    }

    fn validate(&self, name: &str) -> Result<(), NetworkSpecError> {
        match self.kind {
            NetworkKind::Manual | NetworkKind::Vip if self.ip.is_none() => {
                return Err(NetworkSpecError::MissingIp {
                    network: name.to_owned(),
                    kind: self.kind.to_string(),
                });
            }
            _ => {}
        }
        if self.kind != NetworkKind::Vip && self.net_id().is_none_or(str::is_empty) {
            return Err(NetworkSpecError::MissingNetId {
                network: name.to_owned(),
            });
        }
        Ok(())
    }
}

/// 와이어 형식의 네트워크 항목
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawNetwork {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default)]
    pub cloud_properties: NetworkCloudProperties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_dhcp: Option<bool>,
}

impl From<Network> for RawNetwork {
    fn from(network: Network) -> Self {
        Self {
            kind: network.kind.as_str().to_owned(),
            ip: network.ip.map(|ip| ip.to_string()),
            cloud_properties: network.cloud_properties,
            use_dhcp: network.use_dhcp,
        }
    }
}

impl Network {
    fn from_raw(name: &str, raw: RawNetwork) -> Result<Self, NetworkSpecError> {
        let kind = match raw.kind.as_str() {
            "dynamic" => NetworkKind::Dynamic,
            "manual" => NetworkKind::Manual,
            "vip" => NetworkKind::Vip,
            other => {
                return Err(NetworkSpecError::UnknownType {
                    network: name.to_owned(),
                    kind: other.to_owned(),
                });
            }
        };
        let ip = raw
            .ip
            .map(|ip| {
                ip.parse::<IpAddr>().map_err(|_| NetworkSpecError::InvalidIp {
                    network: name.to_owned(),
                    ip: ip.clone(),
                })
            })
            .transpose()?;
        Ok(Self {
            kind,
            ip,
            cloud_properties: raw.cloud_properties,
            use_dhcp: raw.use_dhcp,
        })
    }
}

/// 검증된 네트워크 스펙
///
/// 불변식:
/// - vip 항목은 최대 하나
/// - manual/vip 항목은 IP를 가짐
/// - dynamic/manual 항목은 `net_id`를 가짐
/// - vip가 아닌 항목이 최소 하나 존재
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, RawNetwork>",
    into = "BTreeMap<String, RawNetwork>"
)]
pub struct NetworkSpec {
    networks: BTreeMap<String, Network>,
}

impl NetworkSpec {
    /// 항목들로부터 스펙을 구성하고 검증합니다.
    pub fn new<N, I>(entries: I) -> Result<Self, NetworkSpecError>
    where
        N: Into<String>,
        I: IntoIterator<Item = (N, Network)>,
    {
        let networks = entries
            .into_iter()
            .map(|(name, network)| (name.into(), network))
            .collect();
        let spec = Self { networks };
        spec.validate()?;
        Ok(spec)
    }

    /// JSON 문자열(와이어 형식)에서 파싱합니다.
    pub fn from_json(json: &str) -> Result<Self, NetworkSpecError> {
        let raw: BTreeMap<String, RawNetwork> =
            serde_json::from_str(json).map_err(|e| NetworkSpecError::Malformed {
                reason: e.to_string(),
            })?;
        Self::try_from(raw)
    }

    /// JSON 값(와이어 형식)에서 파싱합니다.
    pub fn from_value(value: serde_json::Value) -> Result<Self, NetworkSpecError> {
        let raw: BTreeMap<String, RawNetwork> =
            serde_json::from_value(value).map_err(|e| NetworkSpecError::Malformed {
                reason: e.to_string(),
            })?;
        Self::try_from(raw)
    }

    /// 항목을 추가한 새 스펙을 반환합니다. 결과도 검증됩니다.
    pub fn with_network(
        &self,
        name: impl Into<String>,
        network: Network,
    ) -> Result<Self, NetworkSpecError> {
        let mut networks = self.networks.clone();
        networks.insert(name.into(), network);
        let spec = Self { networks };
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<(), NetworkSpecError> {
        let mut vip: Option<&str> = None;
        for (name, network) in &self.networks {
            network.validate(name)?;
            if network.kind == NetworkKind::Vip {
                if let Some(first) = vip {
                    return Err(NetworkSpecError::MultipleVip {
                        first: first.to_owned(),
                        second: name.clone(),
                    });
                }
                vip = Some(name);
            }
        }
        if self.private_networks().next().is_none() {
            return Err(NetworkSpecError::NoUsableNetwork);
        }
        Ok(())
    }

    /// 이름 순으로 모든 항목을 순회합니다.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Network)> {
        self.networks.iter().map(|(name, n)| (name.as_str(), n))
    }

    /// vip를 제외한 항목 (포트가 생성되는 네트워크)
    pub fn private_networks(&self) -> impl Iterator<Item = (&str, &Network)> {
        self.iter().filter(|(_, n)| n.kind != NetworkKind::Vip)
    }

    /// vip 항목
    pub fn vip(&self) -> Option<(&str, &Network)> {
        self.iter().find(|(_, n)| n.kind == NetworkKind::Vip)
    }

    pub fn get(&self, name: &str) -> Option<&Network> {
        self.networks.get(name)
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    /// 와이어 형식 JSON 값으로 변환합니다.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl TryFrom<BTreeMap<String, RawNetwork>> for NetworkSpec {
    type Error = NetworkSpecError;

    fn try_from(raw: BTreeMap<String, RawNetwork>) -> Result<Self, Self::Error> {
        let mut networks = BTreeMap::new();
        for (name, entry) in raw {
            let network = Network::from_raw(&name, entry)?;
            networks.insert(name, network);
        }
        let spec = Self { networks };
        spec.validate()?;
        Ok(spec)
    }
}

impl From<NetworkSpec> for BTreeMap<String, RawNetwork> {
    fn from(spec: NetworkSpec) -> Self {
        spec.networks
            .into_iter()
            .map(|(name, network)| (name, RawNetwork::from(network)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn parses_dynamic_network_from_wire() {
        let spec = NetworkSpec::from_value(json!({
            "default": {"type": "dynamic", "cloud_properties": {"net_id": "net-1"}}
        }))
        .unwrap();
        let network = spec.get("default").unwrap();
        assert_eq!(network.kind(), NetworkKind::Dynamic);
        assert_eq!(network.net_id(), Some("net-1"));
        assert!(network.ip().is_none());
        assert!(network.use_dhcp().is_none());
    }

    #[test]
    fn parses_manual_with_vip_and_dhcp_flag() {
        let spec = NetworkSpec::from_json(
            r#"{
                "default": {"type": "manual", "ip": "10.0.0.5",
                            "cloud_properties": {"net_id": "net-1", "security_groups": ["default"]},
                            "use_dhcp": false},
                "vip_network": {"type": "vip", "ip": "203.0.113.10"}
            }"#,
        )
        .unwrap();
        assert_eq!(spec.len(), 2);
        let (vip_name, vip) = spec.vip().unwrap();
        assert_eq!(vip_name, "vip_network");
        assert_eq!(vip.ip(), Some(ip("203.0.113.10")));
        let manual = spec.get("default").unwrap();
        assert_eq!(manual.use_dhcp(), Some(false));
        assert!(
            manual
                .cloud_properties()
                .extra
                .contains_key("security_groups")
        );
        assert_eq!(spec.private_networks().count(), 1);
    }

    #[test]
    fn rejects_multiple_vips() {
        let err = NetworkSpec::new([
            ("default", Network::dynamic("net-1")),
            ("vip_a", Network::vip(ip("203.0.113.1"))),
            ("vip_b", Network::vip(ip("203.0.113.2"))),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            NetworkSpecError::MultipleVip {
                first: "vip_a".to_owned(),
                second: "vip_b".to_owned(),
            }
        );
    }

    #[test]
    fn rejects_manual_without_ip() {
        let err = NetworkSpec::from_value(json!({
            "default": {"type": "manual", "cloud_properties": {"net_id": "net-1"}}
        }))
        .unwrap_err();
        assert!(matches!(err, NetworkSpecError::MissingIp { ref network, .. } if network == "default"));
    }

    #[test]
    fn rejects_missing_net_id() {
        let err = NetworkSpec::from_value(json!({"default": {"type": "dynamic"}})).unwrap_err();
        assert!(matches!(err, NetworkSpecError::MissingNetId { .. }));
    }

    #[test]
    fn rejects_unknown_type() {
        let err = NetworkSpec::from_value(json!({
            "default": {"type": "bridged", "cloud_properties": {"net_id": "net-1"}}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("bridged"));
    }

    #[test]
    fn rejects_invalid_ip() {
        let err = NetworkSpec::from_value(json!({
            "default": {"type": "manual", "ip": "10.0.0", "cloud_properties": {"net_id": "net-1"}}
        }))
        .unwrap_err();
        assert!(matches!(err, NetworkSpecError::InvalidIp { .. }));
    }

    #[test]
    fn rejects_vip_only_spec() {
        let err = NetworkSpec::new([("vip", Network::vip(ip("203.0.113.1")))]).unwrap_err();
        assert_eq!(err, NetworkSpecError::NoUsableNetwork);
    }

    #[test]
    fn rejects_malformed_wire_shape() {
        let err = NetworkSpec::from_json(r#"{"default": "dynamic"}"#).unwrap_err();
        assert!(matches!(err, NetworkSpecError::Malformed { .. }));
    }

    #[test]
    fn with_network_revalidates() {
        let spec = NetworkSpec::new([
            ("default", Network::dynamic("net-1")),
            ("vip", Network::vip(ip("203.0.113.1"))),
        ])
        .unwrap();
        assert!(
            spec.with_network("vip2", Network::vip(ip("203.0.113.2")))
                .is_err()
        );
    }

    #[test]
    fn serializes_back_to_wire_shape() {
        let spec = NetworkSpec::new([
            (
                "default",
                Network::manual(ip("10.0.0.5"), "net-1").with_use_dhcp(false),
            ),
            ("vip", Network::vip(ip("203.0.113.1"))),
        ])
        .unwrap();
        let value = spec.to_value();
        assert_eq!(value["default"]["type"], "manual");
        assert_eq!(value["default"]["ip"], "10.0.0.5");
        assert_eq!(value["default"]["cloud_properties"]["net_id"], "net-1");
        assert_eq!(value["default"]["use_dhcp"], false);
        assert_eq!(value["vip"]["type"], "vip");
        assert!(value["vip"].get("use_dhcp").is_none());
    }
}
