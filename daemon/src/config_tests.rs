use super::*;

#[test]
fn test_default_config() {
    let config = DaemonConfig::default();
    assert_eq!(config.port, 8030);
    assert_eq!(config.bind_addr().to_string(), "0.0.0.0:8030");
    assert_eq!(config.archive.program, PathBuf::from("evr"));
    assert!(config.user.is_empty());
    assert!(!config.monitoring.prometheus_enabled);
}

#[test]
fn test_parse_full_config() {
    let config = DaemonConfig::parse(
        r#"
host = "127.0.0.1"
port = 9000

[archive]
program = "/usr/local/bin/evr"

[user.alice]
password = "wonderland"

[user.bob]
password = "builder"

[monitoring]
prometheus_enabled = true
prometheus_bind = "127.0.0.1:9191"
"#,
    )
    .unwrap();

    assert_eq!(config.bind_addr().to_string(), "127.0.0.1:9000");
    assert_eq!(config.archive.program, PathBuf::from("/usr/local/bin/evr"));
    assert_eq!(config.user.len(), 2);
    assert_eq!(config.user["alice"].password, "wonderland");
    assert!(config.monitoring.prometheus_enabled);
    assert_eq!(config.monitoring.prometheus_bind.port(), 9191);
}

#[test]
fn test_minimal_config_uses_defaults() {
    let config = DaemonConfig::parse("port = 1234\n").unwrap();
    assert_eq!(config.port, 1234);
    assert_eq!(config.archive.program, PathBuf::from("evr"));
}

#[test]
fn test_malformed_config_is_rejected() {
    assert!(DaemonConfig::parse("port = \"not a port\"").is_err());
    assert!(DaemonConfig::parse("[user.alice]\n").is_err());
    assert!(DaemonConfig::parse("[archive]\nprogram = \"\"\n").is_err());
}

#[test]
fn test_password_is_not_logged() {
    let config = DaemonConfig::parse("[user.alice]\npassword = \"wonderland\"\n").unwrap();
    let debug = format!("{:?}", config);
    assert!(!debug.contains("wonderland"));
}

#[tokio::test]
async fn test_load_missing_file() {
    let err = DaemonConfig::load("/nonexistent/gateway.toml").await.unwrap_err();
    assert!(err.to_string().contains("/nonexistent/gateway.toml"));
}

#[tokio::test]
async fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gateway.toml");
    std::fs::write(&path, "port = 4242\n[user.alice]\npassword = \"pw\"\n").unwrap();

    let config = DaemonConfig::load(&path).await.unwrap();
    assert_eq!(config.port, 4242);
    assert!(config.user.contains_key("alice"));
}
