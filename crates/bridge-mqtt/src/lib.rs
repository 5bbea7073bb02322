//! MQTT transport: one persistent session per process, auto-reconnecting,
//! exposing one delivery channel per subscription and one publish channel per
//! publishing topic.
//!
//! Grounded on the half-bridge connection-manager idiom: a background task
//! owns the `EventLoop` and polls it in a loop, re-subscribing everything on
//! every reconnect and tracking readiness so publishers can await it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bridge_task::{ShutdownSignal, Task};
use parking_lot::Mutex;
use rumqttc::v5::mqttbytes::{QoS, SubscribeFilter};
use rumqttc::v5::{AsyncClient, ClientError, Event, EventLoop, Incoming, MqttOptions, Publish};
use rumqttc::{TlsConfiguration, Transport};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

const KEEP_ALIVE: Duration = Duration::from_secs(20);
/// MQTT v5 CONNECT property: false so queued messages survive a transient
/// disconnect for the life of the broker-side session.
const CLEAN_START: bool = false;
/// MQTT v5 CONNECT property (seconds), paired with `CLEAN_START = false`.
const SESSION_EXPIRY_INTERVAL: u32 = 500;
const AWAIT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
const UNSUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(30);
const DELIVERY_CHANNEL_CAPACITY: usize = 1024;
/// Approximates an unbuffered channel: tokio's mpsc has no true zero-capacity
/// variant, so capacity 1 is the idiomatic stand-in for a rendezvous point
/// where the sender feels backpressure from the consumer task.
const PUBLISH_CHANNEL_CAPACITY: usize = 1;
const EVENT_LOOP_CAP: usize = 64;

#[derive(Debug, Clone)]
pub struct MqttData {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub client_id: String,
    pub url: url::Url,
    pub ca_cert: Option<camino::Utf8PathBuf>,
    pub client_cert: Option<camino::Utf8PathBuf>,
    pub client_key: Option<camino::Utf8PathBuf>,
    pub keylog_file: Option<camino::Utf8PathBuf>,
}

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("unsupported MQTT URL scheme {scheme}")]
    UnsupportedScheme { scheme: String },
    #[error("MQTT URL is missing a host")]
    MissingHost,
    #[error("couldn't read TLS material at {path}")]
    TlsMaterial {
        path: camino::Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("couldn't build TLS configuration")]
    TlsConfig(#[source] anyhow::Error),
    #[error("timed out awaiting a live MQTT connection")]
    AwaitConnectionTimeout,
    #[error("client error")]
    Client(#[source] ClientError),
}

struct SubscriptionRecord {
    topic: String,
    sender: mpsc::Sender<MqttData>,
}

/// One persistent MQTT session for the whole process.
pub struct MqttTransport {
    client: AsyncClient,
    ready_rx: watch::Receiver<bool>,
    subscriptions: Arc<Mutex<Vec<SubscriptionRecord>>>,
    shutdown: bridge_task::ShutdownHandle,
    _driver: bridge_task::ChildTask<anyhow::Result<()>>,
}

impl MqttTransport {
    pub fn connect(config: MqttConfig) -> Result<Self, MqttError> {
        let mut options = build_options(&config)?;
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_start(CLEAN_START);
        options.set_session_expiry_interval(Some(SESSION_EXPIRY_INTERVAL));

        let (client, event_loop) = AsyncClient::new(options, EVENT_LOOP_CAP);

        let (ready_tx, ready_rx) = watch::channel(false);
        let subscriptions = Arc::new(Mutex::new(Vec::new()));
        let (shutdown, shutdown_signal) = bridge_task::ShutdownHandle::new();

        let driver = EventLoopDriver {
            event_loop,
            client: client.clone(),
            ready_tx,
            subscriptions: subscriptions.clone(),
        };
        let driver_task = bridge_task::spawn_task(driver, shutdown_signal);

        Ok(Self {
            client,
            ready_rx,
            subscriptions,
            shutdown,
            _driver: driver_task,
        })
    }

    /// Register a subscription and return its dedicated delivery channel.
    /// If the session is currently up, the subscribe is issued immediately;
    /// regardless, every future reconnect re-subscribes everything recorded
    /// here in one batch.
    pub async fn subscribe(&self, topic: impl Into<String>) -> mpsc::Receiver<MqttData> {
        let topic = topic.into();
        let (sender, receiver) = mpsc::channel(DELIVERY_CHANNEL_CAPACITY);

        self.subscriptions.lock().push(SubscriptionRecord { topic: topic.clone(), sender });

        if *self.ready_rx.borrow() {
            if let Err(error) = self.client.subscribe(&topic, QoS::AtMostOnce).await {
                warn!(%error, topic, "Immediate subscribe failed, relying on reconnect resubscription");
            }
        }

        receiver
    }

    /// Spawn a publish task for `topic`, returning the channel feeding it.
    pub fn start_publishing(&self, topic: impl Into<String>) -> mpsc::Sender<Vec<u8>> {
        let topic = topic.into();
        let (sender, receiver) = mpsc::channel(PUBLISH_CHANNEL_CAPACITY);
        let client = self.client.clone();
        let ready_rx = self.ready_rx.clone();

        tokio::spawn(publish_task(client, topic, ready_rx, receiver));

        sender
    }

    pub fn check_connection(&self) -> bool {
        *self.ready_rx.borrow()
    }

    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let topics: Vec<String> = self.subscriptions.lock().iter().map(|record| record.topic.clone()).collect();

        for topic in topics {
            match timeout(UNSUBSCRIBE_TIMEOUT, self.client.unsubscribe(&topic)).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!(%error, topic, "Unsubscribe failed during shutdown"),
                Err(_) => warn!(topic, "Unsubscribe timed out during shutdown"),
            }
        }

        self.shutdown.signal();
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.subscriptions.lock().clear();
    }
}

async fn publish_task(client: AsyncClient, topic: String, mut ready_rx: watch::Receiver<bool>, mut receiver: mpsc::Receiver<Vec<u8>>) {
    while let Some(payload) = receiver.recv().await {
        if let Err(error) = await_ready(&mut ready_rx, AWAIT_CONNECTION_TIMEOUT).await {
            warn!(%error, topic, "Dropping outgoing MQTT message, connection never became ready");
            continue;
        }

        if let Err(error) = client.publish(&topic, QoS::AtMostOnce, false, payload).await {
            warn!(%error, topic, "Publish failed");
        }
    }

    debug!(topic, "Publish task terminated (channel closed)");
}

async fn await_ready(ready_rx: &mut watch::Receiver<bool>, timeout_dur: Duration) -> Result<(), MqttError> {
    if *ready_rx.borrow() {
        return Ok(());
    }

    timeout(timeout_dur, async {
        loop {
            if ready_rx.changed().await.is_err() || *ready_rx.borrow() {
                return;
            }
        }
    })
    .await
    .map_err(|_| MqttError::AwaitConnectionTimeout)
}

fn build_options(config: &MqttConfig) -> Result<MqttOptions, MqttError> {
    let host = config.url.host_str().ok_or(MqttError::MissingHost)?;
    let port = config.url.port().unwrap_or(1883);

    let mut options = MqttOptions::new(&config.client_id, host, port);

    match config.url.scheme() {
        "mqtt" => {}
        "mqtts" | "tls" => {
            let tls_config = build_tls_config(config)?;
            options.set_transport(Transport::tls_with_config(tls_config));
        }
        scheme => return Err(MqttError::UnsupportedScheme { scheme: scheme.to_owned() }),
    }

    Ok(options)
}

fn build_tls_config(config: &MqttConfig) -> Result<TlsConfiguration, MqttError> {
    let mut root_store = tokio_rustls::rustls::RootCertStore::empty();

    if let Some(ca_path) = &config.ca_cert {
        let ca_bytes = std::fs::read(ca_path).map_err(|source| MqttError::TlsMaterial { path: ca_path.clone(), source })?;
        let mut reader = std::io::Cursor::new(ca_bytes);
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|source| MqttError::TlsMaterial { path: ca_path.clone(), source })?;
            root_store.add(cert).map_err(|error| MqttError::TlsConfig(anyhow::anyhow!(error)))?;
        }
    } else {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    let builder = tokio_rustls::rustls::ClientConfig::builder_with_protocol_versions(&[&tokio_rustls::rustls::version::TLS13])
        .with_root_certificates(root_store);

    let mut client_config = match (&config.client_cert, &config.client_key) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_private_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|error| MqttError::TlsConfig(anyhow::anyhow!(error)))?
        }
        _ => builder.with_no_client_auth(),
    };

    if let Some(keylog_path) = &config.keylog_file {
        client_config.key_log = Arc::new(tokio_rustls::rustls::KeyLogFile::new(keylog_path.as_str()));
    }

    Ok(TlsConfiguration::Rustls(Arc::new(client_config)))
}

fn load_certs(path: &camino::Utf8Path) -> Result<Vec<tokio_rustls::rustls::pki_types::CertificateDer<'static>>, MqttError> {
    let bytes = std::fs::read(path).map_err(|source| MqttError::TlsMaterial { path: path.to_owned(), source })?;
    let mut reader = std::io::Cursor::new(bytes);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| MqttError::TlsMaterial { path: path.to_owned(), source })
}

fn load_private_key(path: &camino::Utf8Path) -> Result<tokio_rustls::rustls::pki_types::PrivateKeyDer<'static>, MqttError> {
    let bytes = std::fs::read(path).map_err(|source| MqttError::TlsMaterial { path: path.to_owned(), source })?;
    let mut reader = std::io::Cursor::new(bytes);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| MqttError::TlsMaterial { path: path.to_owned(), source })?
        .ok_or_else(|| MqttError::TlsConfig(anyhow::anyhow!("no private key found in {path}")))
}

/// Owns the `EventLoop`; this is the only task allowed to poll it.
struct EventLoopDriver {
    event_loop: EventLoop,
    client: AsyncClient,
    ready_tx: watch::Sender<bool>,
    subscriptions: Arc<Mutex<Vec<SubscriptionRecord>>>,
}

#[async_trait]
impl Task for EventLoopDriver {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "mqtt event loop";

    async fn run(mut self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        loop {
            let event = tokio::select! {
                event = self.event_loop.poll() => event,
                _ = shutdown_signal.wait() => break,
            };

            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    let _ = self.ready_tx.send(true);
                    self.resubscribe_all().await;
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    self.dispatch(publish);
                }
                Ok(Event::Incoming(Incoming::Disconnect(_))) => {
                    let _ = self.ready_tx.send(false);
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(%error, "MQTT connection error, awaiting internal reconnect backoff");
                    let _ = self.ready_tx.send(false);
                }
            }
        }

        Ok(())
    }
}

impl EventLoopDriver {
    #[instrument(skip(self))]
    async fn resubscribe_all(&self) {
        let filters: Vec<SubscribeFilter> = self
            .subscriptions
            .lock()
            .iter()
            .map(|record| SubscribeFilter::new(record.topic.clone(), QoS::AtMostOnce))
            .collect();

        if filters.is_empty() {
            return;
        }

        info!(count = filters.len(), "Resubscribing after connection-up");
        if let Err(error) = self.client.subscribe_many(filters).await {
            warn!(%error, "Batched resubscribe failed");
        }
    }

    fn dispatch(&self, publish: Publish) {
        let topic = publish.topic;
        let payload = publish.payload.to_vec();

        let matching: Vec<mpsc::Sender<MqttData>> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|record| topic_matches(&record.topic, &topic))
            .map(|record| record.sender.clone())
            .collect();

        for sender in matching {
            let data = MqttData { topic: topic.clone(), payload: payload.clone() };
            // Enqueue on a detached task so the event loop returns to polling promptly.
            tokio::spawn(async move {
                if sender.try_send(data.clone()).is_err() {
                    if sender.send(data).await.is_err() {
                        warn!(topic = %data.topic, "Delivery channel closed, dropping message");
                    }
                }
            });
        }
    }
}

/// MQTT topic matching with `+` (single level) and `#` (trailing, multi level).
fn topic_matches(filter: &str, topic: &str) -> bool {
    let filter_levels: Vec<&str> = filter.split('/').collect();
    let topic_levels: Vec<&str> = topic.split('/').collect();

    let mut f = filter_levels.iter();
    let mut t = topic_levels.iter();

    loop {
        match (f.next(), t.next()) {
            (Some(&"#"), _) => return true,
            (Some(&"+"), Some(_)) => continue,
            (Some(flevel), Some(tlevel)) if flevel == tlevel => continue,
            (Some(_), _) => return false,
            (None, None) => return true,
            (None, Some(_)) => return false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exact_topic_matches() {
        assert!(topic_matches("observations/down/tapir-pop", "observations/down/tapir-pop"));
        assert!(!topic_matches("observations/down/tapir-pop", "observations/down/other"));
    }

    #[test]
    fn plus_matches_single_level() {
        assert!(topic_matches("observations/+/tapir-pop", "observations/down/tapir-pop"));
        assert!(!topic_matches("observations/+/tapir-pop", "observations/down/extra/tapir-pop"));
    }

    #[test]
    fn hash_matches_trailing_levels() {
        assert!(topic_matches("observations/#", "observations/down/tapir-pop"));
        assert!(topic_matches("observations/#", "observations"));
        assert!(!topic_matches("observations/#", "other/down"));
    }
}
