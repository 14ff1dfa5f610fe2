//! lifecheck.toml 통합 설정 테스트
//!
//! - lifecheck.toml.example 파싱
//! - 파일 로딩 (tempfile)
//! - 환경변수 우선순위

use std::io::Write;

use lifecheck_core::config::IntegrationConfig;
use lifecheck_core::error::{ConfigError, LifecheckError};

const EXAMPLE: &str = include_str!("../../../lifecheck.toml.example");

/// 환경변수를 설정한 상태로 `f`를 실행하고 원래 값을 복원합니다.
fn with_env<T>(key: &str, value: &str, f: impl FnOnce() -> T) -> T {
    let original = std::env::var(key).ok();
    // SAFETY: serial_test로 직렬화된 테스트에서만 호출
    unsafe {
        std::env::set_var(key, value);
    }
    let result = f();
    // SAFETY: 테스트 정리
    unsafe {
        match original {
            Some(val) => std::env::set_var(key, val),
            None => std::env::remove_var(key),
        }
    }
    result
}

// =============================================================================
// lifecheck.toml.example 파싱 테스트
// =============================================================================

#[test]
fn example_config_parses_and_validates() {
    let config = IntegrationConfig::parse(EXAMPLE).expect("example config should parse");
    config.validate().expect("example config should validate");

    assert_eq!(config.general.log_level, "info");
    assert_eq!(config.openstack.region, "RegionOne");
    assert_eq!(config.cloud.instance_type_with_no_root_disk, "m1.zero");
    assert_eq!(config.network.net_id_no_dhcp_2, "net-no-dhcp-2");
    assert_eq!(config.config_drive(), Some("cdrom"));
}

#[test]
fn example_config_matches_code_defaults() {
    let from_file = IntegrationConfig::parse(EXAMPLE).expect("should parse");
    let from_code = IntegrationConfig::default();

    assert_eq!(from_file.general.log_format, from_code.general.log_format);
    assert_eq!(from_file.openstack.auth_url, from_code.openstack.auth_url);
    assert_eq!(
        from_file.openstack.connection_timeout_secs,
        from_code.openstack.connection_timeout_secs
    );
    assert_eq!(from_file.cloud.stemcell_path, from_code.cloud.stemcell_path);
    assert_eq!(from_file.cloud.disk_size_mb, from_code.cloud.disk_size_mb);
    assert_eq!(
        from_file.cloud.disable_snapshots,
        from_code.cloud.disable_snapshots
    );
    assert_eq!(from_file.network.manual_ip, from_code.network.manual_ip);
    assert_eq!(from_file.network.floating_ip, from_code.network.floating_ip);
    assert_eq!(
        from_file.network.no_dhcp_manual_ip_1,
        from_code.network.no_dhcp_manual_ip_1
    );
}

#[test]
fn partial_config_network_only() {
    let toml = r#"
[network]
manual_ip = "192.168.50.5"
"#;
    let config = IntegrationConfig::parse(toml).expect("should parse");
    config.validate().expect("should validate");

    assert_eq!(config.network.manual_ip, "192.168.50.5");
    // 나머지는 기본값
    assert_eq!(config.network.net_id, "net-default");
    assert_eq!(config.cloud.instance_type, "m1.small");
}

#[test]
fn disabled_config_drive_is_none() {
    let toml = r#"
[cloud]
config_drive = ""
"#;
    let config = IntegrationConfig::parse(toml).expect("should parse");
    config.validate().expect("should validate");
    assert_eq!(config.config_drive(), None);
}

#[test]
fn floating_ip_must_be_an_address() {
    let toml = r#"
[network]
floating_ip = "not-an-ip"
"#;
    let config = IntegrationConfig::parse(toml).expect("should parse");
    let err = config.validate().unwrap_err();
    assert!(matches!(
        err,
        LifecheckError::Config(ConfigError::InvalidValue { ref field, .. })
            if field == "network.floating_ip"
    ));
}

// =============================================================================
// 파일 로딩 테스트
// =============================================================================

#[tokio::test]
#[serial_test::serial]
async fn load_reads_file_from_disk() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(b"[cloud]\ndisk_size_mb = 4096\n")
        .expect("write config");

    let config = IntegrationConfig::load(file.path())
        .await
        .expect("should load");
    assert_eq!(config.cloud.disk_size_mb, 4096);
}

#[tokio::test]
async fn missing_file_is_file_not_found() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("lifecheck.toml");

    let err = IntegrationConfig::from_file(&path).await.unwrap_err();
    assert!(matches!(
        err,
        LifecheckError::Config(ConfigError::FileNotFound { .. })
    ));
    assert!(err.to_string().contains("lifecheck.toml"));
}

#[tokio::test]
async fn malformed_file_is_parse_error() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(b"[cloud\ndisk_size_mb = ").expect("write config");

    let err = IntegrationConfig::from_file(file.path()).await.unwrap_err();
    assert!(matches!(
        err,
        LifecheckError::Config(ConfigError::ParseFailed { .. })
    ));
}

#[tokio::test]
#[serial_test::serial]
async fn load_rejects_invalid_values_after_overrides() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(EXAMPLE.as_bytes()).expect("write config");

    let original = std::env::var("LIFECHECK_CLOUD_DISK_SIZE_MB").ok();
    // SAFETY: serial_test로 직렬화됨
    unsafe {
        std::env::set_var("LIFECHECK_CLOUD_DISK_SIZE_MB", "0");
    }
    let result = IntegrationConfig::load(file.path()).await;
    // SAFETY: 테스트 정리
    unsafe {
        match original {
            Some(val) => std::env::set_var("LIFECHECK_CLOUD_DISK_SIZE_MB", val),
            None => std::env::remove_var("LIFECHECK_CLOUD_DISK_SIZE_MB"),
        }
    }

    let err = result.unwrap_err();
    assert!(err.to_string().contains("cloud.disk_size_mb"));
}

// =============================================================================
// 환경변수 우선순위 테스트
// =============================================================================

#[test]
#[serial_test::serial]
fn env_override_takes_precedence_over_toml() {
    let config = with_env("LIFECHECK_NETWORK_MANUAL_IP", "10.9.9.9", || {
        let mut config = IntegrationConfig::parse(EXAMPLE).expect("should parse");
        config.apply_env_overrides();
        config
    });
    assert_eq!(config.network.manual_ip, "10.9.9.9");
}

#[test]
#[serial_test::serial]
fn env_override_bool_field() {
    let config = with_env("LIFECHECK_CLOUD_DISABLE_SNAPSHOTS", "true", || {
        let mut config = IntegrationConfig::parse("").expect("should parse");
        config.apply_env_overrides();
        config
    });
    assert!(config.cloud.disable_snapshots);
}

#[test]
#[serial_test::serial]
fn env_override_numeric_field() {
    let config = with_env(
        "LIFECHECK_OPENSTACK_CONNECTION_TIMEOUT_SECS",
        "120",
        || {
            let mut config = IntegrationConfig::parse("").expect("should parse");
            config.apply_env_overrides();
            config
        },
    );
    assert_eq!(config.openstack.connection_timeout_secs, 120);
}

#[test]
#[serial_test::serial]
fn unparsable_env_value_is_ignored() {
    let config = with_env("LIFECHECK_CLOUD_DISK_SIZE_MB", "lots", || {
        let mut config = IntegrationConfig::parse("").expect("should parse");
        config.apply_env_overrides();
        config
    });
    assert_eq!(config.cloud.disk_size_mb, 2048);
}
