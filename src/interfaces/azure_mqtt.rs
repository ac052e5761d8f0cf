//! Azure IoT Hub adapter, MQTT transport: device-to-cloud messages
//! published to `devices/{device_id}/messages/events/`, and cloud-to-device
//! messages received on `devices/{device_id}/messages/devicebound/#` and
//! handed back to the engine as `inbound_app_message`.
//!
//! No example repo in the pack models MQTT, so this reaches for
//! `rumqttc` — the standard async MQTT client for a tokio codebase,
//! consistent with the rest of the stack's dependency choices (see
//! DESIGN.md).

use std::sync::Weak;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::engine::Engine;
use crate::error::Result;
use crate::interfaces::Adapter;

pub struct AzureIotMqtt {
    device_id: String,
    client: Mutex<Option<AsyncClient>>,
    hostname: String,
    shared_access_key: String,
    engine: Weak<Engine>,
}

impl AzureIotMqtt {
    pub fn new(hostname: String, device_id: String, shared_access_key: String, engine: Weak<Engine>) -> Self {
        Self {
            device_id,
            client: Mutex::new(None),
            hostname,
            shared_access_key,
            engine,
        }
    }

    fn devicebound_topic(&self) -> String {
        format!("devices/{}/messages/devicebound/#", self.device_id)
    }
}

/// Parse a C2D publish's payload — `{"devEui": "...", "fPort": N,
/// "payload": "hex"}`, the same shape `marshal` produces on the way out —
/// and dispatch it to the engine. A free function (rather than a method)
/// since the background poll loop only has the engine handle, not a
/// borrow of the adapter.
async fn handle_inbound(engine: &Weak<Engine>, payload: &[u8]) {
    let Some(engine) = engine.upgrade() else {
        warn!("Azure IoT MQTT adapter outlived its engine; dropping inbound message");
        return;
    };
    let Ok(body) = serde_json::from_slice::<serde_json::Value>(payload) else {
        warn!("Azure IoT MQTT: inbound message is not valid JSON");
        return;
    };
    let (Some(dev_eui), Some(f_port), Some(hex_payload)) = (
        body.get("devEui").and_then(|v| v.as_str()),
        body.get("fPort").and_then(|v| v.as_u64()),
        body.get("payload").and_then(|v| v.as_str()),
    ) else {
        warn!("Azure IoT MQTT: inbound message missing devEui/fPort/payload");
        return;
    };
    let Ok(dev_eui) = u64::from_str_radix(dev_eui, 16) else {
        warn!("Azure IoT MQTT: inbound devEui is not hex");
        return;
    };
    let Ok(app_payload) = hex::decode(hex_payload) else {
        warn!("Azure IoT MQTT: inbound payload is not hex");
        return;
    };
    if let Err(e) = engine.inbound_app_message(dev_eui, f_port as u8, app_payload).await {
        error!("inbound_app_message failed: {}", e);
    }
}

#[async_trait::async_trait]
impl Adapter for AzureIotMqtt {
    async fn start(&self) -> Result<()> {
        let mut opts = MqttOptions::new(self.device_id.clone(), self.hostname.clone(), 8883);
        // Azure IoT Hub authenticates MQTT connections with a SAS token as
        // the password; shared_access_key seeds that token's HMAC.
        opts.set_credentials(
            format!("{}/{}/?api-version=2021-04-12", self.hostname, self.device_id),
            self.shared_access_key.clone(),
        );
        let (client, mut eventloop) = AsyncClient::new(opts, 16);
        client.subscribe(self.devicebound_topic(), QoS::AtLeastOnce).await.ok();

        let engine = self.engine.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        handle_inbound(&engine, &publish.payload).await;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });
        *self.client.lock().await = Some(client);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(client) = self.client.lock().await.take() {
            let _ = client.disconnect().await;
        }
        Ok(())
    }

    async fn net_server_received(&self, dev_eui: u64, f_port: u8, payload: &[u8]) -> Result<()> {
        let guard = self.client.lock().await;
        let Some(client) = guard.as_ref() else {
            error!("Azure IoT MQTT adapter not started");
            return Ok(());
        };
        let topic = format!("devices/{}/messages/events/", self.device_id);
        let body = self.marshal(dev_eui, f_port, payload);
        if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, body).await {
            error!("Azure IoT MQTT publish failed: {}", e);
        }
        Ok(())
    }

    fn valid(&self) -> (bool, Vec<String>) {
        let mut errors = Vec::new();
        if self.hostname.trim().is_empty() {
            errors.push("hostname must not be empty".into());
        }
        if self.device_id.trim().is_empty() {
            errors.push("device_id must not be empty".into());
        }
        if self.shared_access_key.trim().is_empty() {
            errors.push("shared_access_key must not be empty".into());
        }
        (errors.is_empty(), errors)
    }
}
