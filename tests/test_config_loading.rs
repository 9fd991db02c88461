//! Tuning file loading and the virtual mesh it describes


use casambi_mqtt::bridge::{BridgeLifecycle, BridgeState};
use casambi_mqtt::config::{BridgeConfig, ConfigError, ENV_NETWORK_PASSWORD};
use casambi_mqtt::mesh::{FirstNetworkSelector, MeshCommand, VirtualMesh};
use casambi_mqtt::testing::MockBroker;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;
use test_helpers::wait_until;

const TUNING: &str = r#"
[mqtt]
keep_alive_secs = 20

[reconnect]
max_attempts = 5

[health]
interval_secs = 30

[casambi]
disconnect_timeout_secs = 1

[casambi.backend]
kind = "virtual"

[[casambi.backend.networks]]
address = "aa:bb:cc:dd:ee:ff"
name = "Cabin"

[[casambi.backend.networks.units]]
id = 1
name = "Porch"

[[casambi.backend.networks.units]]
id = 2
name = "Shade"
dimmer = false
vertical = true
"#;

fn tuning_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn environment(name: &str) -> Option<String> {
    match name {
        "CASAMBI_NETWORK_PASSWORD" => Some("secret".to_string()),
        "MQTT_BROKER" => Some("broker.local".to_string()),
        "MQTT_PORT" => Some("1884".to_string()),
        "MQTT_BASE_TOPIC" => Some("home/casambi".to_string()),
        _ => None,
    }
}

fn loaded_config() -> BridgeConfig {
    let file = tuning_file(TUNING);
    let mut config = BridgeConfig::load_from_file(file.path()).unwrap();
    config.apply_environment(environment).unwrap();
    config.validate().unwrap();
    config
}

#[test]
fn test_file_and_environment_combine() {
    let config = loaded_config();

    assert_eq!(config.mqtt.broker, "broker.local");
    assert_eq!(config.mqtt.port, 1884);
    assert_eq!(config.mqtt.base_topic, "home/casambi");
    assert_eq!(config.mqtt.keep_alive_secs, 20);
    assert_eq!(config.reconnect.max_attempts, 5);
    assert_eq!(config.reconnect.max_delay_secs, 60);
    assert_eq!(config.health.interval_secs, 30);
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = BridgeConfig::load_from_file(&dir.path().join("absent.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_invalid_toml_is_an_error() {
    let file = tuning_file("[mqtt\nkeep_alive_secs = ");
    assert!(matches!(
        BridgeConfig::load_from_file(file.path()),
        Err(ConfigError::TomlParse(_))
    ));
}

#[test]
fn test_network_password_required() {
    let file = tuning_file(TUNING);
    let mut config = BridgeConfig::load_from_file(file.path()).unwrap();
    let result = config.apply_environment(|name| {
        if name == ENV_NETWORK_PASSWORD {
            None
        } else {
            environment(name)
        }
    });
    assert!(matches!(
        result,
        Err(ConfigError::EnvVarNotFound(name)) if name == ENV_NETWORK_PASSWORD
    ));
}

#[test]
fn test_rendered_configuration_hides_secrets() {
    let mut config = loaded_config();
    config.mqtt.password = Some("broker-pw".to_string());

    let rendered = config.render_redacted().unwrap();
    assert!(!rendered.contains("secret"));
    assert!(!rendered.contains("broker-pw"));
    assert!(rendered.contains("broker.local"));
}

#[tokio::test]
async fn test_bridge_runs_on_configured_virtual_mesh() {
    let config = loaded_config();
    let broker = Arc::new(MockBroker::new());
    let mesh = Arc::new(VirtualMesh::from_backend(&config.casambi.backend));
    let mut bridge = BridgeLifecycle::new(
        config,
        broker.clone(),
        mesh.clone(),
        Arc::new(FirstNetworkSelector),
    );

    bridge.start().await.unwrap();
    assert_eq!(
        broker.subscriptions(),
        vec![
            "home/casambi/Cabin/Porch/cmnd".to_string(),
            "home/casambi/Cabin/Shade/cmnd".to_string(),
        ]
    );

    broker
        .inject_message("home/casambi/Cabin/Shade/cmnd", br#"{"vertical": 60.4}"#)
        .await;
    assert!(wait_until(|| !mesh.commands().is_empty()).await);
    assert_eq!(
        mesh.commands(),
        vec![MeshCommand::SetVertical {
            unit: "Shade".to_string(),
            value: 60
        }]
    );

    bridge.shutdown().await;
    assert_eq!(bridge.state(), BridgeState::Stopped);
}
