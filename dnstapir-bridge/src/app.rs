//! The orchestrator (spec.md C9): builds the transports, the resolver and
//! every configured bridge, then supervises them as a group.
//!
//! Mirrors the teacher's `GatewayService`/`AgentService` state machine
//! (`devolutions-gateway/src/service.rs`, `devolutions-agent/src/service.rs`)
//! but spells out all four states spec.md names explicitly
//! (`Created → Initialized → Running → Stopped`) rather than collapsing the
//! first two, since spec.md draws a line between `build()` (construct,
//! validate invariants) and `initialize()` (wire shared state).

use anyhow::{Context as _, ensure};
use bridge_mqtt::{MqttConfig, MqttTransport};
use bridge_nats::NatsTransport;
use bridge_pipeline::{Downbridge, DownbridgeTask, Upbridge, UpbridgeTask};
use bridge_resolver::Resolver;
use bridge_task::{ChildTask, ShutdownHandle, ShutdownSignal};
use tokio::sync::mpsc;
use tracing::info;

use crate::config::{BridgeConfig, Config, Direction};

enum State {
    Created,
    Initialized,
    Running(Running),
    Stopped,
}

struct Running {
    shutdown_handle: ShutdownHandle,
    bridge_tasks: Vec<ChildTask<()>>,
    log_deleter: ChildTask<anyhow::Result<()>>,
    stop_tx: mpsc::Sender<()>,
    supervisor: ChildTask<()>,
}

/// Owns the MQTT transport, the NATS transport, the key resolver, and every
/// per-bridge pipeline task spawned from them.
pub struct App {
    config: Config,
    resolver: Resolver,
    mqtt: MqttTransport,
    nats: NatsTransport,
    state: State,
}

impl App {
    /// Construct the transports and the resolver from `config`. An invalid
    /// MQTT URL/TLS material, an invalid resolver base URL, or an empty
    /// bridge list is a construction error — never a panic.
    pub fn build(config: Config) -> anyhow::Result<Self> {
        ensure!(!config.bridges.is_empty(), "at least one bridge must be configured");

        let resolver = Resolver::new(config.nodeman_api_url.as_str()).context("couldn't build key resolver")?;

        let mqtt_config = MqttConfig {
            client_id: "dnstapir-bridge".to_owned(),
            url: config.mqtt_url.clone(),
            ca_cert: config.mqtt_ca_cert.clone(),
            client_cert: config.mqtt_client_cert.clone(),
            client_key: config.mqtt_client_key.clone(),
            keylog_file: config.mqtt_keylog_file.clone(),
        };
        let mqtt = MqttTransport::connect(mqtt_config).context("couldn't initialize MQTT transport")?;

        let nats = NatsTransport::new(config.nats_url.clone());

        Ok(Self {
            config,
            resolver,
            mqtt,
            nats,
            state: State::Created,
        })
    }

    /// Wires shared state ahead of `run()`. A no-op beyond the state
    /// transition in this crate: there is no process-wide logger to inject
    /// into the key store (`bridge_keys` is pure by design, see DESIGN.md),
    /// so nothing else needs wiring.
    pub fn initialize(&mut self) -> anyhow::Result<()> {
        ensure!(matches!(self.state, State::Created), "initialize() called out of order");
        self.state = State::Initialized;
        Ok(())
    }

    /// Connects to NATS, wires every configured bridge between the two
    /// transports, and returns a channel carrying initialization/connect
    /// errors (spec.md: "the orchestrator surfaces only initialization and
    /// connect errors through its done channel"). Message-level errors never
    /// reach this channel; they are logged and dropped inside each bridge.
    pub async fn run(&mut self) -> anyhow::Result<mpsc::Receiver<anyhow::Error>> {
        ensure!(matches!(self.state, State::Initialized), "run() called on a non-initialized app");

        let (done_tx, done_rx) = mpsc::channel(1 + self.config.bridges.len());

        if let Err(error) = self.nats.connect().await {
            let _ = done_tx.send(anyhow::Error::new(error)).await;
            return Ok(done_rx);
        }

        let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();
        let mut bridge_tasks = Vec::with_capacity(self.config.bridges.len());

        for bridge in &self.config.bridges {
            match wire_bridge(bridge, &self.mqtt, &self.nats, &self.resolver, shutdown_signal.clone()).await {
                Ok(task) => bridge_tasks.push(task),
                Err(error) => {
                    let _ = done_tx.send(error).await;
                }
            }
        }

        let log_deleter = bridge_log::LogDeleterTask::<crate::log::BridgeLog>::new(self.config.log_file.clone());
        let log_deleter = bridge_task::spawn_task(log_deleter, shutdown_signal.clone());

        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let supervisor = ChildTask::spawn(async move {
            stop_rx.recv().await;
        });

        self.state = State::Running(Running {
            shutdown_handle,
            bridge_tasks,
            log_deleter,
            stop_tx,
            supervisor,
        });

        Ok(done_rx)
    }

    /// Idempotent: stopping an app that never started, or is already
    /// stopped, only logs. Otherwise runs the graceful-stop sequence to
    /// completion regardless of what each step returns.
    pub async fn stop(&mut self) {
        match std::mem::replace(&mut self.state, State::Stopped) {
            State::Running(running) => {
                info!("Stopping bridge");

                let _ = running.stop_tx.send(()).await;
                let _ = running.supervisor.join().await;

                running.shutdown_handle.signal();
                for task in running.bridge_tasks {
                    let _ = task.join().await;
                }
                let _ = running.log_deleter.join().await;

                self.mqtt.stop().await;
                self.nats.stop().await;
            }
            State::Created | State::Initialized => {
                info!("Attempted to stop the bridge, but it never started running");
            }
            State::Stopped => {
                info!("Attempted to stop the bridge, but it's already stopped");
            }
        }
    }
}

async fn wire_bridge(
    bridge: &BridgeConfig,
    mqtt: &MqttTransport,
    nats: &NatsTransport,
    resolver: &Resolver,
    shutdown_signal: ShutdownSignal,
) -> anyhow::Result<ChildTask<()>> {
    match bridge.direction {
        Direction::Up => {
            let upbridge = Upbridge::new(bridge.schema_path.as_deref(), resolver.clone(), bridge.key_path.as_deref())
                .with_context(|| format!("couldn't build upbridge for MQTT topic {}", bridge.mqtt_topic))?;

            let mqtt_rx = mqtt.subscribe(bridge.mqtt_topic.clone()).await;
            let nats_tx = nats.start_publishing(bridge.nats_subject.clone());

            let task = UpbridgeTask::new(upbridge, mqtt_rx, nats_tx);
            Ok(bridge_task::spawn_task(task, shutdown_signal))
        }
        Direction::Down => {
            let key_path = bridge.key_path.as_deref().context("downbridge is missing its signing key path")?;
            let downbridge = Downbridge::new(bridge.schema_path.as_deref(), key_path)
                .with_context(|| format!("couldn't build downbridge for NATS subject {}", bridge.nats_subject))?;

            let nats_rx = nats
                .subscribe(bridge.nats_subject.clone(), &bridge.nats_queue)
                .await
                .with_context(|| format!("couldn't subscribe to NATS subject {}", bridge.nats_subject))?;
            let mqtt_tx = mqtt.start_publishing(bridge.mqtt_topic.clone());

            let task = DownbridgeTask::new(downbridge, nats_rx, mqtt_tx);
            Ok(bridge_task::spawn_task(task, shutdown_signal))
        }
    }
}
