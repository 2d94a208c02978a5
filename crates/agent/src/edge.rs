//! Local MQTT broker connection: edge-configuration discovery, inbound
//! command delivery and the outbound twin channel.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use uplift_protocol::Envelope;

use crate::config::BrokerConfig;
use crate::uploadable::TwinChannel;

/// Topic on which the local twin layer announces the edge configuration.
const EDGE_RESPONSE_TOPIC: &str = "edge/thing/response";
/// Topic used to request the current edge configuration.
const EDGE_REQUEST_TOPIC: &str = "edge/thing/request";
/// Subscription filter for inbound feature operations.
const COMMAND_REQUEST_FILTER: &str = "command///req/#";
/// Topic for operation replies.
const COMMAND_RESPONSE_TOPIC: &str = "command///res";

/// Local Edge Thing configuration: device, tenant and policy identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeConfiguration {
    pub device_id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub policy_id: String,
}

/// Events surfaced by the connector to the application.
#[derive(Debug)]
pub enum EdgeEvent {
    /// A new edge configuration was announced.
    Configuration(EdgeConfiguration),
    /// An operation envelope arrived on the command topic.
    Command(Envelope),
}

/// Errors raised while connecting to the local broker.
#[derive(Debug, thiserror::Error)]
pub enum EdgeError {
    #[error("invalid broker address '{0}'")]
    BadAddress(String),

    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection to the local MQTT broker.
///
/// Subscribes for edge-configuration announcements and inbound commands,
/// decodes both into [`EdgeEvent`]s, and offers non-blocking publication of
/// replies and twin events.
#[derive(Clone)]
pub struct EdgeConnector {
    client: AsyncClient,
    cancel: CancellationToken,
}

impl EdgeConnector {
    /// Connects to the broker and spawns the event pump. Decoded events are
    /// delivered through `events`; the pump stops when the receiver is
    /// dropped or [`close`](Self::close) is called.
    pub async fn connect(
        cfg: &BrokerConfig,
        events: mpsc::Sender<EdgeEvent>,
    ) -> Result<Self, EdgeError> {
        let (host, port) = parse_broker_address(&cfg.broker)?;

        let mut options = MqttOptions::new(uuid::Uuid::new_v4().to_string(), host, port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);
        if !cfg.username.is_empty() {
            options.set_credentials(cfg.username.clone(), cfg.password.clone());
        }
        if !cfg.cert.is_empty() {
            options.set_transport(Transport::Tls(tls_configuration(cfg)?));
        }

        let (client, mut event_loop) = AsyncClient::new(options, 10);
        client.subscribe(EDGE_RESPONSE_TOPIC, QoS::AtLeastOnce).await?;
        client
            .subscribe(COMMAND_REQUEST_FILTER, QoS::AtLeastOnce)
            .await?;
        client
            .publish(EDGE_REQUEST_TOPIC, QoS::AtLeastOnce, false, Vec::new())
            .await?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            let mut last_configuration: Option<EdgeConfiguration> = None;

            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = event_loop.poll() => event,
                };

                match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if publish.topic == EDGE_RESPONSE_TOPIC {
                            match serde_json::from_slice::<EdgeConfiguration>(&publish.payload) {
                                Ok(configuration) => {
                                    if last_configuration.as_ref() == Some(&configuration) {
                                        continue;
                                    }
                                    info!(?configuration, "new edge configuration received");
                                    last_configuration = Some(configuration.clone());
                                    if events
                                        .send(EdgeEvent::Configuration(configuration))
                                        .await
                                        .is_err()
                                    {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    error!("could not unmarshal edge configuration: {e}");
                                }
                            }
                        } else if publish.topic.starts_with("command//") {
                            match serde_json::from_slice::<Envelope>(&publish.payload) {
                                Ok(envelope) => {
                                    if events.send(EdgeEvent::Command(envelope)).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    warn!(
                                        topic = %publish.topic,
                                        "ignoring malformed command envelope: {e}"
                                    );
                                }
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT connection error: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }

            debug!("edge event pump stopped");
        });

        Ok(Self { client, cancel })
    }

    /// Builds the outbound twin channel bound to the given edge identity.
    pub fn twin_channel(&self, edge: &EdgeConfiguration) -> Arc<MqttTwinChannel> {
        Arc::new(MqttTwinChannel {
            client: self.client.clone(),
            topic: format!("e/{}/{}", edge.tenant_id, edge.device_id),
        })
    }

    /// Publishes an operation reply. Non-blocking; a saturated send queue is
    /// logged and dropped.
    pub fn send_reply(&self, envelope: Envelope) {
        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                error!("could not serialize reply envelope: {e}");
                return;
            }
        };

        if let Err(e) = self
            .client
            .try_publish(COMMAND_RESPONSE_TOPIC, QoS::AtLeastOnce, false, payload)
        {
            error!("could not send operation reply: {e}");
        }
    }

    /// Disconnects from the broker and stops the event pump.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Err(e) = self.client.disconnect().await {
            debug!("disconnect: {e}");
        }
        info!("disconnected from MQTT broker");
    }
}

/// Publishes twin envelopes to the edge event topic.
pub struct MqttTwinChannel {
    client: AsyncClient,
    topic: String,
}

impl TwinChannel for MqttTwinChannel {
    fn publish(&self, envelope: Envelope) {
        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                error!("could not serialize twin envelope: {e}");
                return;
            }
        };

        if let Err(e) = self
            .client
            .try_publish(&self.topic, QoS::AtLeastOnce, false, payload)
        {
            error!("could not send twin message: {e}");
        }
    }
}

/// Splits a broker address like `tcp://localhost:1883` into host and port.
fn parse_broker_address(address: &str) -> Result<(String, u16), EdgeError> {
    let trimmed = address
        .strip_prefix("tcp://")
        .or_else(|| address.strip_prefix("mqtt://"))
        .or_else(|| address.strip_prefix("ssl://"))
        .unwrap_or(address);

    match trimmed.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| EdgeError::BadAddress(address.to_string()))?;
            Ok((host.to_string(), port))
        }
        None if !trimmed.is_empty() => Ok((trimmed.to_string(), 1883)),
        None => Err(EdgeError::BadAddress(address.to_string())),
    }
}

fn tls_configuration(cfg: &BrokerConfig) -> Result<TlsConfiguration, EdgeError> {
    let ca = if cfg.ca_cert.is_empty() {
        Vec::new()
    } else {
        std::fs::read(&cfg.ca_cert)?
    };

    let client_auth = if cfg.cert.is_empty() {
        None
    } else {
        Some((std::fs::read(&cfg.cert)?, std::fs::read(&cfg.key)?))
    };

    Ok(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    })
}
