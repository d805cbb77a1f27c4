//! Event source adapter: MQTT subscription feeding the ingest queue.
//!
//! The adapter owns the `rumqttc` event loop. It subscribes to the telemetry
//! topic on every successful CONNACK (so a reconnect restores the
//! subscription), decodes each PUBLISH payload and hands it to the ingest
//! queue without waiting. Connection errors are logged and the loop keeps
//! polling, which makes `rumqttc` reconnect.

use crate::config::MqttConfig;
use crate::ingest::{decode_payload, enqueue, InboundReading};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Capacity of the request channel between `AsyncClient` and its event loop.
const CLIENT_REQUEST_CAPACITY: usize = 16;

/// Upper bound on how long shutdown waits for the DISCONNECT to flush.
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Subscribes to the broker topic and forwards decoded readings.
pub struct EventSourceAdapter {
    settings: MqttConfig,
    queue: mpsc::Sender<InboundReading>,
}

impl EventSourceAdapter {
    pub fn new(settings: MqttConfig, queue: mpsc::Sender<InboundReading>) -> Self {
        Self { settings, queue }
    }

    /// Client options derived from configuration.
    pub fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.settings.client_id.clone(),
            self.settings.host.clone(),
            self.settings.port,
        );
        options.set_keep_alive(Duration::from_secs(self.settings.keep_alive_secs.max(5)));
        options
    }

    /// Decodes one PUBLISH payload and enqueues it.
    ///
    /// Undecodable payloads are logged and discarded. Returns whether the
    /// record reached the queue.
    pub fn handle_payload(&self, topic: &str, payload: &[u8]) -> bool {
        match decode_payload(payload) {
            Ok(inbound) => enqueue(&self.queue, inbound, "mqtt"),
            Err(e) => {
                tracing::warn!(
                    topic,
                    payload_len = payload.len(),
                    "discarding telemetry message: {}",
                    e
                );
                false
            }
        }
    }

    /// Runs the subscription until `shutdown` flips to `true` or its sender
    /// is dropped, then disconnects from the broker.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let (client, mut eventloop) = AsyncClient::new(self.options(), CLIENT_REQUEST_CAPACITY);
        let reconnect_delay = Duration::from_millis(self.settings.reconnect_delay_ms);

        tracing::info!(
            host = %self.settings.host,
            port = self.settings.port,
            topic = %self.settings.topic,
            "starting broker subscription"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            tracing::info!(topic = %self.settings.topic, "connected to broker, subscribing");
                            if let Err(e) = client.try_subscribe(self.settings.topic.clone(), QoS::AtLeastOnce) {
                                tracing::warn!(topic = %self.settings.topic, "failed to request subscription: {}", e);
                            }
                        } else {
                            tracing::warn!(code = ?ack.code, "broker refused connection");
                        }
                    }
                    Ok(Event::Incoming(Packet::SubAck(_))) => {
                        tracing::debug!(topic = %self.settings.topic, "subscription acknowledged");
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.handle_payload(&publish.topic, &publish.payload);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(
                            host = %self.settings.host,
                            port = self.settings.port,
                            "broker connection error, retrying in {:?}: {}",
                            reconnect_delay,
                            e
                        );
                        tokio::select! {
                            () = tokio::time::sleep(reconnect_delay) => {}
                            _ = shutdown.changed() => {}
                        }
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                },
            }
        }

        disconnect(&client, &mut eventloop).await;
        tracing::info!("broker subscription stopped");
    }
}

/// Sends DISCONNECT and drives the event loop until it is written out.
async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop) {
    if let Err(e) = client.try_disconnect() {
        tracing::debug!("could not queue broker disconnect: {}", e);
        return;
    }

    let flushed = tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;

    if flushed.is_err() {
        tracing::debug!("timed out flushing broker disconnect");
    }
}
