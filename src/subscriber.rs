use std::time::Duration;

use log::{debug, error, info, warn};
use rumqttc::{
    AsyncClient, ClientError, ConnectionError, Event, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode, Transport,
};
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{sleep, timeout},
};

use crate::{config::BrokerConfig, ingest::Pipeline};

const REQUEST_CAPACITY: usize = 10;
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(thiserror::Error, Debug)]
pub enum SubscribeError {
    #[error("fail to request subscription to `{0}`: {1}")]
    Request(String, ClientError),
    #[error("broker rejected subscription to `{0}`")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Disconnected,
    Connecting,
    Connected { subscribed: bool },
}

/// Anything that can queue a SUBSCRIBE packet.
pub(crate) trait Subscribe {
    fn request_subscribe(&self, topic: &str, qos: QoS) -> Result<(), ClientError>;
}

impl Subscribe for AsyncClient {
    fn request_subscribe(&self, topic: &str, qos: QoS) -> Result<(), ClientError> {
        // The request channel is drained by the same task that calls this, so
        // it must not wait for capacity.
        self.try_subscribe(topic, qos)
    }
}

/// Reacts to broker events: subscribes on every new connection and feeds
/// publishes into the pipeline once the subscription is acknowledged.
pub(crate) struct Controller {
    topic: String,
    qos: QoS,
    state: State,
    pipeline: Pipeline,
}

impl Controller {
    pub fn new(topic: String, qos: QoS, pipeline: Pipeline) -> Self {
        Self {
            topic,
            qos,
            state: State::Disconnected,
            pipeline,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn connecting(&mut self) {
        self.state = State::Connecting;
    }

    pub fn disconnected(&mut self, e: &ConnectionError) {
        error!("connection to broker lost: {}", e);
        self.state = State::Disconnected;
    }

    /// Handles one event. Returns the storage write dispatched for a
    /// publish, if any.
    pub async fn handle<C: Subscribe>(
        &mut self,
        event: Event,
        client: &C,
    ) -> Option<JoinHandle<()>> {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                info!("connected to broker: {:?}", ack.code);
                self.state = State::Connected { subscribed: false };
                if let Err(e) = self.subscribe(client) {
                    error!("{}", e);
                }
                None
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    error!("{}", SubscribeError::Rejected(self.topic.clone()));
                } else if let State::Connected { .. } = self.state {
                    info!("subscribed to topic `{}`", self.topic);
                    self.state = State::Connected { subscribed: true };
                }
                None
            }
            Event::Incoming(Packet::Publish(publish)) => {
                if self.state != (State::Connected { subscribed: true }) {
                    debug!(
                        "ignoring message on `{}` received before subscription",
                        publish.topic
                    );
                    return None;
                }
                debug!(
                    "received message on `{}`: {:x?}",
                    publish.topic, publish.payload
                );
                self.pipeline.ingest_or_discard(&publish.payload).await
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("broker closed the session");
                self.state = State::Disconnected;
                None
            }
            other => {
                debug!("broker event: {:?}", other);
                None
            }
        }
    }

    fn subscribe<C: Subscribe>(&self, client: &C) -> Result<(), SubscribeError> {
        debug!("subscribing to topic `{}`", self.topic);
        client
            .request_subscribe(&self.topic, self.qos)
            .map_err(|e| SubscribeError::Request(self.topic.clone(), e))
    }
}

fn mqtt_options(config: &BrokerConfig, host: &str) -> MqttOptions {
    let client_id = config
        .client_id
        .clone()
        .unwrap_or_else(|| format!("lixo_{:08x}", rand::random::<u32>()));
    let mut options = MqttOptions::new(client_id, host, config.port);
    options.set_keep_alive(config.keep_alive);
    if let Some(username) = config.username.as_ref() {
        options.set_credentials(
            username.clone(),
            config.password.clone().unwrap_or_default(),
        );
    }
    if config.tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    options
}

/// Drives the broker connection until a termination signal arrives.
pub(crate) async fn run(
    config: BrokerConfig,
    pipeline: Pipeline,
    mut termination_receiver: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let host = config.host()?;
    let qos = config.qos()?;
    let (client, mut eventloop) =
        AsyncClient::new(mqtt_options(&config, host), REQUEST_CAPACITY);
    let mut controller = Controller::new(config.topic.clone(), qos, pipeline);

    info!(
        "connecting to broker {}:{} (tls: {})",
        host, config.port, config.tls
    );
    controller.connecting();
    loop {
        tokio::select! {
            _ = termination_receiver.recv() => break,
            event = eventloop.poll() => {
                match event {
                    Ok(event) => {
                        controller.handle(event, &client).await;
                    }
                    Err(e) => {
                        controller.disconnected(&e);
                        tokio::select! {
                            _ = termination_receiver.recv() => break,
                            _ = sleep(config.reconnect_delay) => {
                                debug!("reconnecting to broker {}:{}", host, config.port);
                                controller.connecting();
                            }
                        }
                    }
                }
            }
        }
    }

    if let State::Connected { .. } = controller.state() {
        info!("disconnecting from broker");
        if client.try_disconnect().is_ok() {
            let flush = async {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            };
            if timeout(DISCONNECT_TIMEOUT, flush).await.is_err() {
                warn!("broker did not take the disconnect in time");
            }
        }
    }
    Ok(())
}
