//! NATS transport: queue-group subscription with a per-subscription delivery
//! channel, and header-carrying publish from a fixed closed header set.

use std::collections::HashMap;
use std::sync::Arc;

use bridge_task::{ShutdownHandle, ShutdownSignal};
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Duration, timeout};
use tracing::{debug, instrument, warn};

const DELIVERY_CHANNEL_CAPACITY: usize = 1024;
/// See `bridge_mqtt`'s note on the same choice: tokio has no true zero-capacity
/// mpsc, so capacity 1 stands in for "unbuffered".
const PUBLISH_CHANNEL_CAPACITY: usize = 1;
const UNSUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(30);

/// The fixed, closed set of outgoing NATS headers this bridge ever sets.
pub const HEADER_MESSAGE_SCHEMA: &str = "DNSTAPIR-Message-Schema";
pub const HEADER_MQTT_TOPIC: &str = "DNSTAPIR-Mqtt-Topic";
pub const HEADER_KEY_IDENTIFIER: &str = "DNSTAPIR-Key-Identifier";
pub const HEADER_KEY_THUMBPRINT: &str = "DNSTAPIR-Key-Thumbprint";

const FIXED_HEADERS: &[&str] = &[HEADER_MESSAGE_SCHEMA, HEADER_MQTT_TOPIC, HEADER_KEY_IDENTIFIER, HEADER_KEY_THUMBPRINT];

#[derive(Debug, Clone, Default)]
pub struct NatsData {
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum NatsError {
    #[error("already connected")]
    AlreadyConnected,
    #[error("couldn't connect to NATS server")]
    Connect(#[source] async_nats::ConnectError),
    #[error("not connected yet")]
    NotConnected,
    #[error("subscribe failed")]
    Subscribe(#[source] async_nats::SubscribeError),
}

enum ConnectionState {
    Disconnected,
    Connected(async_nats::Client),
}

struct Inner {
    url: String,
    state: Mutex<ConnectionState>,
    shutdown: ShutdownHandle,
}

/// Cheaply cloneable handle onto one NATS connection; every clone shares the
/// same underlying client once connected.
#[derive(Clone)]
pub struct NatsTransport(Arc<Inner>);

impl NatsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        let (shutdown, _initial_signal) = ShutdownHandle::new();
        Self(Arc::new(Inner {
            url: url.into(),
            state: Mutex::new(ConnectionState::Disconnected),
            shutdown,
        }))
    }

    /// Establish the connection. A second call is rejected outright, matching
    /// the spec's "second call returns error" contract.
    pub async fn connect(&self) -> Result<(), NatsError> {
        let mut state = self.0.state.lock().await;
        if matches!(*state, ConnectionState::Connected(_)) {
            return Err(NatsError::AlreadyConnected);
        }

        let client = async_nats::connect(&self.0.url).await.map_err(NatsError::Connect)?;
        *state = ConnectionState::Connected(client);
        Ok(())
    }

    async fn client(&self) -> Result<async_nats::Client, NatsError> {
        match &*self.0.state.lock().await {
            ConnectionState::Connected(client) => Ok(client.clone()),
            ConnectionState::Disconnected => Err(NatsError::NotConnected),
        }
    }

    /// Subscribe on `subject` and fan inbound payloads into a dedicated
    /// delivery channel. `queue`, when non-empty, makes this a queue-group
    /// subscription (distributing messages across every subscriber sharing
    /// that group name); an empty queue is a plain subscription, the shape a
    /// downbridge uses since the data model only requires `nats_queue` for
    /// `direction=up`.
    pub async fn subscribe(
        &self,
        subject: impl async_nats::subject::ToSubject,
        queue: &str,
    ) -> Result<mpsc::Receiver<Vec<u8>>, NatsError> {
        let client = self.client().await?;
        let subscriber = if queue.is_empty() {
            client.subscribe(subject).await.map_err(NatsError::Subscribe)?
        } else {
            client.queue_subscribe(subject, queue.to_owned()).await.map_err(NatsError::Subscribe)?
        };

        let (sender, receiver) = mpsc::channel(DELIVERY_CHANNEL_CAPACITY);
        let shutdown_signal = self.0.shutdown.subscribe();
        tokio::spawn(forward_loop(subscriber, sender, shutdown_signal));

        Ok(receiver)
    }

    /// Spawn a publish task for `subject`, returning the channel feeding it.
    /// For each message, only the fixed closed set of headers is copied from
    /// the message's own header map, and only when present.
    pub fn start_publishing(&self, subject: impl async_nats::subject::ToSubject) -> mpsc::Sender<NatsData> {
        let subject = subject.to_subject();
        let (sender, receiver) = mpsc::channel(PUBLISH_CHANNEL_CAPACITY);
        let transport = self.clone();

        tokio::spawn(async move { publish_loop(transport, subject, receiver).await });

        sender
    }

    /// Signals every forward/publish loop to unsubscribe and terminate
    /// (best-effort) and drains the connection. Bounded by
    /// [`UNSUBSCRIBE_TIMEOUT`] overall: `self` itself holds a clone of the
    /// shutdown signal, so `all_closed` alone would never resolve.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        self.0.shutdown.signal();

        tokio::select! {
            () = self.0.shutdown.all_closed() => {}
            () = tokio::time::sleep(UNSUBSCRIBE_TIMEOUT) => {
                warn!("Some NATS subscriptions didn't terminate within the shutdown window");
            }
        }

        if let ConnectionState::Connected(client) = &*self.0.state.lock().await {
            let _ = client.flush().await;
        }
    }
}

async fn forward_loop(mut subscriber: async_nats::Subscriber, sender: mpsc::Sender<Vec<u8>>, mut shutdown_signal: ShutdownSignal) {
    loop {
        tokio::select! {
            message = subscriber.next() => {
                let Some(message) = message else { break };
                let payload = message.payload.to_vec();

                if sender.try_send(payload.clone()).is_err() {
                    tokio::select! {
                        result = sender.send(payload) => {
                            if result.is_err() {
                                break;
                            }
                        }
                        _ = shutdown_signal.wait() => {
                            warn!("Dropping NATS message: delivery channel full at shutdown");
                        }
                    }
                }
            }
            _ = shutdown_signal.wait() => break,
        }
    }

    if timeout(UNSUBSCRIBE_TIMEOUT, subscriber.unsubscribe()).await.is_err() {
        warn!("Unsubscribe timed out during shutdown");
    }

    debug!("NATS forward loop terminated");
}

async fn publish_loop(transport: NatsTransport, subject: async_nats::Subject, mut receiver: mpsc::Receiver<NatsData>) {
    while let Some(data) = receiver.recv().await {
        let Ok(client) = transport.client().await else {
            warn!(%subject, "Dropping outgoing NATS message, not connected");
            continue;
        };

        let headers = fixed_headers(&data);
        if let Err(error) = client.publish_with_headers(subject.clone(), headers, data.payload.into()).await {
            warn!(%error, %subject, "Publish failed");
        }
    }

    debug!(%subject, "Publish task terminated (channel closed)");
}

fn fixed_headers(data: &NatsData) -> async_nats::HeaderMap {
    let mut headers = async_nats::HeaderMap::new();
    for &name in FIXED_HEADERS {
        if let Some(value) = data.headers.get(name) {
            headers.insert(name, value.as_str());
        }
    }
    headers
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fixed_headers_only_copies_known_names() {
        let mut data = NatsData::default();
        data.headers.insert(HEADER_KEY_IDENTIFIER.to_owned(), "kid-1".to_owned());
        data.headers.insert("X-Unrelated".to_owned(), "ignored".to_owned());

        let headers = fixed_headers(&data);

        assert_eq!(headers.get(HEADER_KEY_IDENTIFIER).map(|v| v.to_string()), Some("kid-1".to_owned()));
        assert!(headers.get("X-Unrelated").is_none());
    }
}
