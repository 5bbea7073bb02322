//! Two-layer configuration: a raw, `serde`-deserialized TOML document
//! (`ConfFile`) converted into a validated [`Config`]. Mirrors the teacher's
//! `dto::ConfFile` / `Conf` split in `devolutions-gateway/src/config.rs`.

use anyhow::{Context as _, bail, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

const ENV_MQTT_URL: &str = "DNSTAPIR_BRIDGE_MQTT_URL";
const ENV_NATS_URL: &str = "DNSTAPIR_BRIDGE_NATS_URL";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConfFile {
    #[serde(default)]
    debug: bool,
    #[serde(default)]
    quiet: bool,
    mqtt_url: String,
    mqtt_ca_cert: Option<Utf8PathBuf>,
    mqtt_client_cert: Option<Utf8PathBuf>,
    mqtt_client_key: Option<Utf8PathBuf>,
    mqtt_keylog_file: Option<Utf8PathBuf>,
    nats_url: String,
    nodeman_api_url: String,
    /// Not in spec.md's recognized-options table (that table covers the
    /// core bridge only); ambient logging needs somewhere to write to.
    log_file: Option<Utf8PathBuf>,
    #[serde(default)]
    bridges: Vec<BridgeRecordFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BridgeRecordFile {
    direction: String,
    mqtt_topic: String,
    nats_subject: String,
    #[serde(default)]
    nats_queue: String,
    key: Option<Utf8PathBuf>,
    schema: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub direction: Direction,
    pub mqtt_topic: String,
    pub nats_subject: String,
    pub nats_queue: String,
    pub key_path: Option<Utf8PathBuf>,
    pub schema_path: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub debug: bool,
    pub quiet: bool,
    pub mqtt_url: url::Url,
    pub mqtt_ca_cert: Option<Utf8PathBuf>,
    pub mqtt_client_cert: Option<Utf8PathBuf>,
    pub mqtt_client_key: Option<Utf8PathBuf>,
    pub mqtt_keylog_file: Option<Utf8PathBuf>,
    pub nats_url: String,
    pub nodeman_api_url: String,
    pub log_file: Utf8PathBuf,
    pub bridges: Vec<BridgeConfig>,
}

impl Config {
    /// The `EnvFilter` directive string derived from `Debug`/`Quiet`, mirroring
    /// the teacher's `VerbosityProfile::to_log_filter`.
    pub fn log_filter(&self) -> &'static str {
        match (self.debug, self.quiet) {
            (true, _) => "debug",
            (false, true) => "warn",
            (false, false) => "info",
        }
    }
}

/// Load the configuration file at `path`, apply environment overrides, and
/// validate every invariant from the bridge-configuration data model. Never
/// panics: every failure is returned as an `anyhow::Error` with context,
/// matching the teacher's `Conf::from_conf_file` discipline.
pub fn load(path: &Utf8Path) -> anyhow::Result<Config> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("couldn't read config file {path}"))?;
    let mut conf_file: ConfFile = toml::from_str(&raw).context("couldn't parse config file as TOML")?;

    if let Ok(value) = std::env::var(ENV_MQTT_URL) {
        conf_file.mqtt_url = value;
    }
    if let Ok(value) = std::env::var(ENV_NATS_URL) {
        conf_file.nats_url = value;
    }

    from_conf_file(conf_file)
}

fn from_conf_file(conf_file: ConfFile) -> anyhow::Result<Config> {
    let mqtt_url = url::Url::parse(&conf_file.mqtt_url).context("invalid MqttUrl")?;

    ensure!(!conf_file.nats_url.trim().is_empty(), "NatsUrl is required");
    ensure!(!conf_file.nodeman_api_url.trim().is_empty(), "NodemanApiUrl is required");

    let bridges = conf_file
        .bridges
        .into_iter()
        .enumerate()
        .map(|(index, record)| to_bridge_config(record).with_context(|| format!("Bridge at position {index}")))
        .collect::<anyhow::Result<Vec<_>>>()?;

    ensure!(!bridges.is_empty(), "at least one bridge must be configured");

    Ok(Config {
        debug: conf_file.debug,
        quiet: conf_file.quiet,
        mqtt_url,
        mqtt_ca_cert: conf_file.mqtt_ca_cert,
        mqtt_client_cert: conf_file.mqtt_client_cert,
        mqtt_client_key: conf_file.mqtt_client_key,
        mqtt_keylog_file: conf_file.mqtt_keylog_file,
        nats_url: conf_file.nats_url,
        nodeman_api_url: conf_file.nodeman_api_url,
        log_file: conf_file.log_file.unwrap_or_else(|| Utf8PathBuf::from("dnstapir-bridge")),
        bridges,
    })
}

fn to_bridge_config(record: BridgeRecordFile) -> anyhow::Result<BridgeConfig> {
    let direction = match record.direction.as_str() {
        "up" => Direction::Up,
        "down" => Direction::Down,
        other => bail!("Direction must be `up` or `down`, got `{other}`"),
    };

    match direction {
        Direction::Up => ensure!(!record.nats_queue.trim().is_empty(), "NatsQueue is required for direction=up"),
        Direction::Down => ensure!(record.key.is_some(), "Key is required for direction=down"),
    }

    ensure!(
        direction == Direction::Up || !has_mqtt_wildcard(&record.mqtt_topic),
        "MqttTopic may only use `+`/`#` wildcards for direction=up"
    );
    ensure!(
        direction == Direction::Down || !has_nats_wildcard(&record.nats_subject),
        "NatsSubject may only use `*`/`>` wildcards for direction=down"
    );

    Ok(BridgeConfig {
        direction,
        mqtt_topic: record.mqtt_topic,
        nats_subject: record.nats_subject,
        nats_queue: record.nats_queue,
        key_path: record.key,
        schema_path: record.schema,
    })
}

fn has_mqtt_wildcard(topic: &str) -> bool {
    topic.split('/').any(|level| level == "+" || level == "#")
}

fn has_nats_wildcard(subject: &str) -> bool {
    subject.split('.').any(|token| token == "*" || token == ">")
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(toml_str: &str) -> anyhow::Result<Config> {
        let conf_file: ConfFile = toml::from_str(toml_str).unwrap();
        from_conf_file(conf_file)
    }

    #[test]
    fn rejects_empty_bridge_list() {
        let toml_str = r#"
            MqttUrl = "mqtt://localhost:1883"
            NatsUrl = "nats://localhost:4222"
            NodemanApiUrl = "https://keys.example"
        "#;
        assert!(parse(toml_str).is_err());
    }

    #[test]
    fn up_bridge_requires_nats_queue() {
        let toml_str = r#"
            MqttUrl = "mqtt://localhost:1883"
            NatsUrl = "nats://localhost:4222"
            NodemanApiUrl = "https://keys.example"

            [[Bridges]]
            Direction = "up"
            MqttTopic = "observations/+/tapir-pop"
            NatsSubject = "observations.up.tapir-pop"
        "#;
        let error = parse(toml_str).unwrap_err();
        assert!(format!("{error:#}").contains("NatsQueue"));
    }

    #[test]
    fn down_bridge_requires_key() {
        let toml_str = r#"
            MqttUrl = "mqtt://localhost:1883"
            NatsUrl = "nats://localhost:4222"
            NodemanApiUrl = "https://keys.example"

            [[Bridges]]
            Direction = "down"
            MqttTopic = "observations/down/tapir-pop"
            NatsSubject = "observations.down.tapir-pop"
        "#;
        let error = parse(toml_str).unwrap_err();
        assert!(format!("{error:#}").contains("Key is required"));
    }

    #[test]
    fn mqtt_wildcard_rejected_on_downbridge() {
        let toml_str = r#"
            MqttUrl = "mqtt://localhost:1883"
            NatsUrl = "nats://localhost:4222"
            NodemanApiUrl = "https://keys.example"

            [[Bridges]]
            Direction = "down"
            MqttTopic = "observations/down/#"
            NatsSubject = "observations.down.tapir-pop"
            Key = "signing.jwk"
        "#;
        let error = parse(toml_str).unwrap_err();
        assert!(format!("{error:#}").contains("wildcards"));
    }

    #[test]
    fn accepts_a_well_formed_config() {
        let toml_str = r#"
            Debug = true
            MqttUrl = "mqtt://localhost:1883"
            NatsUrl = "nats://localhost:4222"
            NodemanApiUrl = "https://keys.example"

            [[Bridges]]
            Direction = "up"
            MqttTopic = "observations/+/tapir-pop"
            NatsSubject = "observations.up.tapir-pop"
            NatsQueue = "bridge-up"
        "#;
        let config = parse(toml_str).unwrap();
        assert!(config.debug);
        assert_eq!(config.bridges.len(), 1);
    }
}
