//! The two mirror-image per-bridge pipelines: downbound (NATS → sign → MQTT)
//! and upbound (MQTT → verify → NATS). Both are built once at construction —
//! an invalid key or schema is a construction error, never a runtime one —
//! and run as a [`bridge_task::Task`] that never lets a single poisoned
//! message stop the loop.

use async_trait::async_trait;
use bridge_cache::KeyCache;
use bridge_mqtt::MqttData;
use bridge_nats::{HEADER_KEY_IDENTIFIER, HEADER_KEY_THUMBPRINT, HEADER_MESSAGE_SCHEMA, HEADER_MQTT_TOPIC, NatsData};
use bridge_resolver::Resolver;
use bridge_schema::{Validator, Validity};
use bridge_task::{ShutdownSignal, Task};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DownbridgeError {
    #[error(transparent)]
    Schema(#[from] bridge_schema::SchemaError),
    #[error(transparent)]
    Key(#[from] bridge_keys::KeyError),
}

#[derive(Debug, Error)]
pub enum UpbridgeError {
    #[error(transparent)]
    Schema(#[from] bridge_schema::SchemaError),
    #[error("local validation key loaded for pre-seeding has no `kid`")]
    LocalKeyMissingKid,
    #[error("couldn't load local validation key")]
    Key(#[source] bridge_keys::KeyError),
}

/// NATS → validate → sign → MQTT.
pub struct Downbridge {
    schema: Validator,
    signing_key: bridge_keys::SigningKey,
}

impl Downbridge {
    pub fn new(schema_path: Option<&camino::Utf8Path>, key_path: &camino::Utf8Path) -> Result<Self, DownbridgeError> {
        let schema = Validator::new(schema_path)?;
        let signing_key = bridge_keys::load_signing(key_path)?;
        Ok(Self { schema, signing_key })
    }
}

pub struct DownbridgeTask {
    bridge: Downbridge,
    input: mpsc::Receiver<Vec<u8>>,
    output: mpsc::Sender<Vec<u8>>,
}

impl DownbridgeTask {
    pub fn new(bridge: Downbridge, input: mpsc::Receiver<Vec<u8>>, output: mpsc::Sender<Vec<u8>>) -> Self {
        Self { bridge, input, output }
    }
}

#[async_trait]
impl Task for DownbridgeTask {
    type Output = ();

    const NAME: &'static str = "downbridge";

    async fn run(mut self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        debug!("Task started");

        loop {
            let payload = tokio::select! {
                message = self.input.recv() => match message {
                    Some(payload) => payload,
                    None => break,
                },
                _ = shutdown_signal.wait() => break,
            };

            match self.bridge.schema.check(&payload) {
                Validity::Valid => {}
                Validity::MalformedJson => {
                    warn!("Dropping downbound message: malformed JSON");
                    continue;
                }
                Validity::SchemaViolation => {
                    warn!("Dropping downbound message: schema violation");
                    continue;
                }
            }

            // A signing failure here means the key passed construction-time
            // validation but crypto itself failed — an invariant violation,
            // not a message-level error.
            let signed = bridge_keys::sign(&payload, &self.bridge.signing_key)
                .unwrap_or_else(|error| panic!("signing failed with a previously-validated key: {error}"));

            if self.output.send(signed).await.is_err() {
                break;
            }
        }

        debug!("Task terminated");
    }
}

/// MQTT → extract kid → resolve (cache/remote) → verify → validate → NATS.
pub struct Upbridge {
    schema: Validator,
    schema_id: String,
    resolver: Resolver,
    cache: KeyCache,
}

impl Upbridge {
    pub fn new(
        schema_path: Option<&camino::Utf8Path>,
        resolver: Resolver,
        local_validation_key_path: Option<&camino::Utf8Path>,
    ) -> Result<Self, UpbridgeError> {
        let schema = Validator::new(schema_path)?;
        let schema_id = schema_path.map(|path| path.as_str().to_owned()).unwrap_or_else(|| "none".to_owned());
        let cache = KeyCache::new();

        if let Some(path) = local_validation_key_path {
            let key = bridge_keys::load_validation(path).map_err(UpbridgeError::Key)?;
            let kid = key.kid().ok_or(UpbridgeError::LocalKeyMissingKid)?.to_owned();
            cache.put(kid, key);
        }

        Ok(Self { schema, schema_id, resolver, cache })
    }
}

pub struct UpbridgeTask {
    bridge: Upbridge,
    input: mpsc::Receiver<MqttData>,
    output: mpsc::Sender<NatsData>,
}

impl UpbridgeTask {
    pub fn new(bridge: Upbridge, input: mpsc::Receiver<MqttData>, output: mpsc::Sender<NatsData>) -> Self {
        Self { bridge, input, output }
    }
}

#[async_trait]
impl Task for UpbridgeTask {
    type Output = ();

    const NAME: &'static str = "upbridge";

    async fn run(mut self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        debug!("Task started");

        loop {
            let message = tokio::select! {
                message = self.input.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
                _ = shutdown_signal.wait() => break,
            };

            let Some((plaintext, kid, validation_key)) = self.process(&message).await else {
                continue;
            };

            let mut headers = std::collections::HashMap::new();
            headers.insert(HEADER_MESSAGE_SCHEMA.to_owned(), self.bridge.schema_id.clone());
            headers.insert(HEADER_MQTT_TOPIC.to_owned(), message.topic);
            headers.insert(HEADER_KEY_IDENTIFIER.to_owned(), kid);
            headers.insert(HEADER_KEY_THUMBPRINT.to_owned(), validation_key.thumbprint());

            if self.output.send(NatsData { headers, payload: plaintext }).await.is_err() {
                break;
            }
        }

        debug!("Task terminated");
    }
}

impl UpbridgeTask {
    async fn process(&self, message: &MqttData) -> Option<(Vec<u8>, String, bridge_keys::ValidationKey)> {
        let kid = match bridge_keys::extract_kid(&message.payload) {
            Ok(kid) => kid,
            Err(error) => {
                warn!(%error, topic = %message.topic, "Dropping upbound message: couldn't extract kid");
                return None;
            }
        };

        let validation_key = match self.bridge.cache.get(&kid) {
            Some(key) => key,
            None => match self.bridge.resolver.fetch(&kid).await {
                Ok(bytes) => match bridge_keys::parse_validation(&bytes) {
                    Ok(key) => {
                        self.bridge.cache.put(kid.clone(), key.clone());
                        key
                    }
                    Err(error) => {
                        warn!(%error, kid, "Dropping upbound message: resolver returned an unparseable key");
                        return None;
                    }
                },
                Err(error) => {
                    warn!(%error, kid, "Dropping upbound message: key resolution failed");
                    return None;
                }
            },
        };

        let plaintext = match bridge_keys::verify(&message.payload, &validation_key) {
            Ok(plaintext) => plaintext,
            Err(error) => {
                warn!(%error, kid, topic = %message.topic, "Dropping upbound message: verification failed");
                return None;
            }
        };

        match self.bridge.schema.check(&plaintext) {
            Validity::Valid => Some((plaintext, kid, validation_key)),
            Validity::MalformedJson => {
                warn!(kid, topic = %message.topic, "Dropping upbound message: malformed JSON payload");
                None
            }
            Validity::SchemaViolation => {
                warn!(kid, topic = %message.topic, "Dropping upbound message: schema violation");
                None
            }
        }
    }
}

#[cfg(test)]
mod test {
    use base64::Engine as _;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD as b64url;

    use super::*;

    fn write_signing_jwk(dir: &tempfile::TempDir, seed: u8) -> (camino::Utf8PathBuf, camino::Utf8PathBuf) {
        let seed_bytes = [seed; 32];
        let public = picky::key::ed25519_public_from_private(&seed_bytes).unwrap();
        let d = b64url.encode(seed_bytes);
        let x = b64url.encode(public);

        let signing_path = camino::Utf8PathBuf::try_from(dir.path().join("signing.jwk")).unwrap();
        std::fs::write(&signing_path, format!(r#"{{"kty":"OKP","crv":"Ed25519","x":"{x}","d":"{d}","kid":"k1"}}"#)).unwrap();

        let validation_path = camino::Utf8PathBuf::try_from(dir.path().join("validation.jwk")).unwrap();
        std::fs::write(&validation_path, format!(r#"{{"kty":"OKP","crv":"Ed25519","x":"{x}","kid":"k1"}}"#)).unwrap();

        (signing_path, validation_path)
    }

    #[tokio::test]
    async fn downbridge_signs_schema_valid_payload() {
        let dir = tempfile::tempdir().unwrap();
        let (signing_path, validation_path) = write_signing_jwk(&dir, 9);

        let downbridge = Downbridge::new(None, &signing_path).unwrap();
        let (in_tx, in_rx) = mpsc::channel(1);
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let task = DownbridgeTask::new(downbridge, in_rx, out_tx);
        let (_shutdown, shutdown_signal) = bridge_task::ShutdownHandle::new();
        tokio::spawn(task.run(shutdown_signal));

        in_tx.send(br#"{"foo":"bar"}"#.to_vec()).await.unwrap();
        let signed = out_rx.recv().await.unwrap();

        let validation_key = bridge_keys::load_validation(&validation_path).unwrap();
        let plaintext = bridge_keys::verify(&signed, &validation_key).unwrap();
        assert_eq!(plaintext, br#"{"foo":"bar"}"#);
    }

    #[tokio::test]
    async fn downbridge_drops_schema_violations_but_stays_alive() {
        let dir = tempfile::tempdir().unwrap();
        let (signing_path, _validation_path) = write_signing_jwk(&dir, 10);
        let schema_path = camino::Utf8PathBuf::try_from(dir.path().join("schema.json")).unwrap();
        std::fs::write(
            &schema_path,
            r#"{"type":"object","properties":{"lala":{"type":"integer"}},"required":["lala"]}"#,
        )
        .unwrap();

        let downbridge = Downbridge::new(Some(&schema_path), &signing_path).unwrap();
        let (in_tx, in_rx) = mpsc::channel(2);
        let (out_tx, mut out_rx) = mpsc::channel(2);
        let task = DownbridgeTask::new(downbridge, in_rx, out_tx);
        let (_shutdown, shutdown_signal) = bridge_task::ShutdownHandle::new();
        tokio::spawn(task.run(shutdown_signal));

        in_tx.send(br#"{"lala":"not-a-number"}"#.to_vec()).await.unwrap();
        in_tx.send(br#"{"lala":1}"#.to_vec()).await.unwrap();

        let signed = out_rx.recv().await.unwrap();
        assert_eq!(bridge_keys::extract_kid(&signed).unwrap(), "k1");
    }

    #[tokio::test]
    async fn upbridge_with_local_key_verifies_and_emits_headers() {
        let dir = tempfile::tempdir().unwrap();
        let (signing_path, validation_path) = write_signing_jwk(&dir, 11);
        let signing_key = bridge_keys::load_signing(&signing_path).unwrap();
        let signed = bridge_keys::sign(br#"{"lala":1}"#, &signing_key).unwrap();

        let resolver = Resolver::new("https://unused.example").unwrap();
        let upbridge = Upbridge::new(None, resolver, Some(&validation_path)).unwrap();

        let (in_tx, in_rx) = mpsc::channel(1);
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let task = UpbridgeTask::new(upbridge, in_rx, out_tx);
        let (_shutdown, shutdown_signal) = bridge_task::ShutdownHandle::new();
        tokio::spawn(task.run(shutdown_signal));

        in_tx.send(MqttData { topic: "observations/up/tapir-pop".to_owned(), payload: signed }).await.unwrap();
        let emitted = out_rx.recv().await.unwrap();

        assert_eq!(emitted.payload, br#"{"lala":1}"#);
        assert_eq!(emitted.headers.get(HEADER_KEY_IDENTIFIER), Some(&"k1".to_owned()));
    }

    #[tokio::test]
    async fn upbridge_drops_malformed_jws_but_stays_alive() {
        let dir = tempfile::tempdir().unwrap();
        let (signing_path, validation_path) = write_signing_jwk(&dir, 12);
        let signing_key = bridge_keys::load_signing(&signing_path).unwrap();

        let resolver = Resolver::new("https://unused.example").unwrap();
        let upbridge = Upbridge::new(None, resolver, Some(&validation_path)).unwrap();

        let (in_tx, in_rx) = mpsc::channel(2);
        let (out_tx, mut out_rx) = mpsc::channel(2);
        let task = UpbridgeTask::new(upbridge, in_rx, out_tx);
        let (_shutdown, shutdown_signal) = bridge_task::ShutdownHandle::new();
        tokio::spawn(task.run(shutdown_signal));

        in_tx.send(MqttData { topic: "t".to_owned(), payload: b"not json".to_vec() }).await.unwrap();
        let signed = bridge_keys::sign(br#"{"lala":2}"#, &signing_key).unwrap();
        in_tx.send(MqttData { topic: "t".to_owned(), payload: signed }).await.unwrap();

        let emitted = out_rx.recv().await.unwrap();
        assert_eq!(emitted.payload, br#"{"lala":2}"#);
    }
}
