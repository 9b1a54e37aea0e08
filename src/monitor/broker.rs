//! Broker worker
//!
//! Blocking MQTT consumption on a dedicated worker context, plus the
//! `user_config` publishing handle. This side of the service never touches
//! client connections; it only feeds the ingestion gateway and the dispatch
//! queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rumqttc::{Client, Connection, Event, MqttOptions, Packet, QoS, SubscribeFilter};

use super::gateway::IngestionGateway;
use super::message::UserConfig;
use crate::config::BrokerConfig;

/// Sensor topics consumed from the broker: one per vital plus the generic
/// catch-all.
pub const SENSOR_TOPICS: [&str; 5] = [
    "temperatura",
    "presion",
    "oxigeno",
    "ritmo_cardiaco",
    "sensores",
];

/// Routing key for acquisition-device configuration.
pub const USER_CONFIG_TOPIC: &str = "user_config";

/// Backoff ceiling between reconnect attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Broker-side failures.
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("broker request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("broker unreachable after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

/// Anything able to push a `user_config` message toward the device side.
pub trait UserConfigSink: Send + Sync {
    fn publish_user_config(&self, config: &UserConfig) -> Result<()>;
}

/// Cloneable publishing handle over the shared MQTT client.
#[derive(Clone)]
pub struct BrokerPublisher {
    client: Client,
}

impl UserConfigSink for BrokerPublisher {
    fn publish_user_config(&self, config: &UserConfig) -> Result<()> {
        let payload = serde_json::to_vec(config)?;
        self.client
            .try_publish(USER_CONFIG_TOPIC, QoS::AtLeastOnce, false, payload)?;
        Ok(())
    }
}

impl BrokerPublisher {
    /// Request a clean disconnect; the consumption loop winds down after it.
    pub fn disconnect(&self) {
        if let Err(e) = self.client.try_disconnect() {
            tracing::debug!(error = %e, "broker disconnect request failed");
        }
    }
}

/// Blocking consumption worker. Runs on its own thread via
/// `spawn_blocking`; the async side only ever sees the dispatch queue.
pub struct BrokerWorker {
    client: Client,
    connection: Connection,
    gateway: IngestionGateway,
    stop: Arc<AtomicBool>,
    max_retries: u32,
    backoff_base: Duration,
}

impl BrokerWorker {
    /// Build the MQTT client and split off the publishing handle.
    pub fn connect(
        config: &BrokerConfig,
        gateway: IngestionGateway,
        stop: Arc<AtomicBool>,
    ) -> (BrokerPublisher, Self) {
        let mut options =
            MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, connection) = Client::new(options, 64);
        let publisher = BrokerPublisher {
            client: client.clone(),
        };

        let worker = Self {
            client,
            connection,
            gateway,
            stop,
            max_retries: config.max_retries,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
        };

        (publisher, worker)
    }

    /// Consume until shutdown, restarting consumption whenever the retry
    /// budget is exhausted. Only a failed subscribe request is fatal.
    pub fn run_supervised(mut self) -> Result<(), BrokerError> {
        loop {
            match self.run() {
                Ok(()) => return Ok(()),
                Err(BrokerError::RetriesExhausted { attempts }) => {
                    if self.stop.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    tracing::error!(attempts, "broker consumption restarting after exhausted retries");
                    std::thread::sleep(MAX_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One consumption pass: runs until shutdown or until the retry budget
    /// is exhausted.
    fn run(&mut self) -> Result<(), BrokerError> {
        subscribe(&self.client)?;
        tracing::info!(topics = ?SENSOR_TOPICS, "broker worker consuming");

        let mut attempts: u32 = 0;
        let Self {
            client,
            connection,
            gateway,
            stop,
            max_retries,
            backoff_base,
        } = self;

        for notification in connection.iter() {
            if stop.load(Ordering::SeqCst) {
                tracing::info!("broker worker stopping");
                break;
            }

            match notification {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    attempts = 0;
                    gateway.handle_publish(&publish.topic, &publish.payload);
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    // Reconnected: the session is clean, so subscriptions
                    // must be re-established.
                    attempts = 0;
                    if let Err(e) = subscribe(client) {
                        tracing::error!(error = %e, "resubscribe after reconnect failed");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    attempts += 1;
                    if attempts >= *max_retries {
                        tracing::error!(attempts, error = %e, "broker retry budget exhausted");
                        return Err(BrokerError::RetriesExhausted { attempts });
                    }
                    let delay = backoff_delay(attempts, *backoff_base);
                    tracing::warn!(attempts, error = %e, delay_ms = delay.as_millis() as u64,
                        "broker connection error, backing off");
                    std::thread::sleep(delay);
                }
            }
        }

        Ok(())
    }
}

fn subscribe(client: &Client) -> Result<(), BrokerError> {
    let filters = SENSOR_TOPICS
        .iter()
        .map(|topic| SubscribeFilter::new(topic.to_string(), QoS::AtLeastOnce));
    client.subscribe_many(filters)?;
    Ok(())
}

/// Exponential backoff for attempt `n` (1-based), capped.
fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1u32 << exp);
    delay.min(MAX_BACKOFF)
}
