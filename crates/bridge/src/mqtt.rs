//! MQTT multiplexer: publishes every device's data under `pdu/<device_id>/…`,
//! routes wildcard outlet commands back to the owning poller, queues retained
//! publishes across disconnects, and emits Home Assistant discovery configs.
//!
//! One connection serves the whole fleet. The Last-Will is set for the first
//! configured device (MQTT allows one will per connection); `online` /
//! `offline` are published retained for every registered device on connect
//! and shutdown.

use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use serde_json::json;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::automation::RuleEvent;
use crate::config::BridgeConfig;
use crate::model::{DeviceIdentity, OutletAction, Snapshot};
use crate::state::SharedState;

/// Cap on publishes queued while disconnected. Newer retained publishes are
/// dropped (and counted) once full; the oldest entries keep their slot.
const MAX_PENDING: usize = 100;

/// Reconnect backoff bounds in seconds.
const BACKOFF_MIN: f64 = 1.0;
const BACKOFF_MAX: f64 = 30.0;

struct PendingPublish {
    topic: String,
    payload: String,
    retain: bool,
    qos: QoS,
}

#[derive(Default)]
struct MqttShared {
    connected: bool,
    reconnect_count: u64,
    last_connect: Option<f64>,
    last_disconnect: Option<f64>,
    total_publishes: u64,
    publish_errors: u64,
    dropped_retained: u64,
    pending: VecDeque<PendingPublish>,
    ha_discovery_sent: HashSet<String>,
    registered: BTreeSet<String>,
}

#[derive(Clone)]
pub struct MqttHandler {
    client: AsyncClient,
    broker: String,
    port: u16,
    shared: Arc<Mutex<MqttShared>>,
}

impl MqttHandler {
    pub fn new(config: &BridgeConfig, primary_device: &str) -> (Self, EventLoop) {
        let mut options = MqttOptions::new(
            format!("pdu-bridge-{primary_device}"),
            &config.mqtt_broker,
            config.mqtt_port,
        );
        options.set_keep_alive(Duration::from_secs(60));
        options.set_last_will(LastWill::new(
            format!("pdu/{primary_device}/bridge/status"),
            b"offline".to_vec(),
            QoS::AtLeastOnce,
            true,
        ));
        if !config.mqtt_username.is_empty() {
            options.set_credentials(&config.mqtt_username, &config.mqtt_password);
            info!(user = %config.mqtt_username, "mqtt: using password authentication");
        }

        let (client, eventloop) = AsyncClient::new(options, 64);

        let handler = Self {
            client,
            broker: config.mqtt_broker.clone(),
            port: config.mqtt_port,
            shared: Arc::new(Mutex::new(MqttShared::default())),
        };
        (handler, eventloop)
    }

    /// Register a device for online/offline announcements and discovery
    /// bookkeeping. Command routing uses the state's commander map.
    pub async fn register_device(&self, device_id: &str) {
        self.shared
            .lock()
            .await
            .registered
            .insert(device_id.to_string());
        info!(device = device_id, "registered device with mqtt handler");
    }

    // -- Event loop ---------------------------------------------------------

    /// Drive the network event loop until the running flag drops. Handles
    /// re-subscription and pending-queue drain on every reconnect, and
    /// routes incoming commands to the per-device commander map.
    pub async fn run_event_loop(
        &self,
        mut eventloop: EventLoop,
        state: SharedState,
        mut running: watch::Receiver<bool>,
    ) {
        let mut consecutive_errors: u32 = 0;

        loop {
            tokio::select! {
                changed = running.changed() => {
                    if changed.is_err() || !*running.borrow() {
                        break;
                    }
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        consecutive_errors = 0;
                        self.on_connect().await;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        route_command(&state, &publish.topic, &publish.payload).await;
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("mqtt disconnected");
                        self.mark_disconnected().await;
                    }
                    Ok(_) => {
                        consecutive_errors = 0;
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        self.mark_disconnected().await;
                        let delay = reconnect_delay(consecutive_errors);
                        warn!(
                            consecutive_errors,
                            delay_secs = format!("{delay:.1}"),
                            "mqtt connection error: {e}"
                        );
                        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                    }
                },
            }
        }
    }

    async fn on_connect(&self) {
        info!("mqtt connected");
        let (registered, drained) = {
            let mut shared = self.shared.lock().await;
            if shared.last_connect.is_some() {
                shared.reconnect_count += 1;
            }
            shared.connected = true;
            shared.last_connect = Some(now_secs());
            let registered: Vec<String> = shared.registered.iter().cloned().collect();
            let drained: Vec<PendingPublish> = shared.pending.drain(..).collect();
            (registered, drained)
        };

        // Re-subscribe on every (re)connect; the broker may have dropped
        // the session.
        if let Err(e) = self
            .client
            .subscribe("pdu/+/outlet/+/command", QoS::AtLeastOnce)
            .await
        {
            error!("mqtt: re-subscribe failed: {e}");
        }

        for device_id in &registered {
            self.publish(
                &format!("pdu/{device_id}/bridge/status"),
                "online".to_string(),
                true,
                QoS::AtLeastOnce,
            )
            .await;
        }

        if !drained.is_empty() {
            info!(count = drained.len(), "draining pending publishes after reconnect");
            for p in drained {
                self.publish(&p.topic, p.payload, p.retain, p.qos).await;
            }
        }
    }

    async fn mark_disconnected(&self) {
        let mut shared = self.shared.lock().await;
        if shared.connected {
            shared.connected = false;
            shared.last_disconnect = Some(now_secs());
        }
    }

    // -- Publishing ---------------------------------------------------------

    async fn publish(&self, topic: &str, payload: String, retain: bool, qos: QoS) {
        {
            self.shared.lock().await.total_publishes += 1;
        }

        let result = self
            .client
            .publish(topic, qos, retain, payload.clone())
            .await;

        if result.is_err() {
            let mut shared = self.shared.lock().await;
            shared.publish_errors += 1;
            if shared.publish_errors % 100 == 1 {
                warn!(topic, errors = shared.publish_errors, "mqtt publish failed");
            }
            if retain {
                if shared.pending.len() < MAX_PENDING {
                    shared.pending.push_back(PendingPublish {
                        topic: topic.to_string(),
                        payload,
                        retain,
                        qos,
                    });
                } else {
                    shared.dropped_retained += 1;
                }
            }
        }
    }

    /// Publish the full per-device topic tree for one snapshot (retained).
    pub async fn publish_snapshot(&self, device_id: &str, data: &Snapshot) -> anyhow::Result<()> {
        let prefix = format!("pdu/{device_id}");

        let mut status = json!({
            "device_name": data.device_name,
            "outlet_count": data.outlet_count,
            "phase_count": data.phase_count,
            "input_voltage": data.input_voltage,
            "input_frequency": data.input_frequency,
            "timestamp": now_secs(),
        });
        if let Some(identity) = &data.identity {
            status["identity"] = json!({
                "serial": identity.serial,
                "model": identity.model,
                "firmware_main": identity.firmware_main,
                "firmware_secondary": identity.firmware_secondary,
                "hardware_rev": identity.hardware_rev,
            });
        }
        self.publish(&format!("{prefix}/status"), status.to_string(), true, QoS::AtMostOnce)
            .await;

        if let Some(v) = data.input_voltage {
            self.publish(&format!("{prefix}/input/voltage"), v.to_string(), true, QoS::AtMostOnce)
                .await;
        }
        if let Some(f) = data.input_frequency {
            self.publish(&format!("{prefix}/input/frequency"), f.to_string(), true, QoS::AtMostOnce)
                .await;
        }

        for (n, outlet) in &data.outlets {
            let op = format!("{prefix}/outlet/{n}");
            self.publish(&format!("{op}/state"), outlet.state.to_string(), true, QoS::AtMostOnce)
                .await;
            self.publish(&format!("{op}/name"), outlet.name.clone(), true, QoS::AtMostOnce)
                .await;
            if let Some(current) = outlet.current {
                self.publish(&format!("{op}/current"), current.to_string(), true, QoS::AtMostOnce)
                    .await;
            }
            if let Some(power) = outlet.power {
                self.publish(&format!("{op}/power"), power.to_string(), true, QoS::AtMostOnce)
                    .await;
            }
            if let Some(energy) = outlet.energy {
                self.publish(&format!("{op}/energy"), energy.to_string(), true, QoS::AtMostOnce)
                    .await;
            }
        }

        for (idx, bank) in &data.banks {
            let bp = format!("{prefix}/bank/{idx}");
            if let Some(voltage) = bank.voltage {
                self.publish(&format!("{bp}/voltage"), voltage.to_string(), true, QoS::AtMostOnce)
                    .await;
            }
            if let Some(current) = bank.current {
                self.publish(&format!("{bp}/current"), current.to_string(), true, QoS::AtMostOnce)
                    .await;
            }
            if let Some(power) = bank.power {
                self.publish(&format!("{bp}/power"), power.to_string(), true, QoS::AtMostOnce)
                    .await;
            }
            if let Some(apparent) = bank.apparent_power {
                self.publish(
                    &format!("{bp}/apparent_power"),
                    apparent.to_string(),
                    true,
                    QoS::AtMostOnce,
                )
                .await;
            }
            if let Some(pf) = bank.power_factor {
                self.publish(
                    &format!("{bp}/power_factor"),
                    pf.to_string(),
                    true,
                    QoS::AtMostOnce,
                )
                .await;
            }
            self.publish(
                &format!("{bp}/load_state"),
                bank.load_state.as_str().to_string(),
                true,
                QoS::AtMostOnce,
            )
            .await;
        }

        // ATS scalars.
        if let Some(preferred) = data.ats_preferred_source {
            self.publish(
                &format!("{prefix}/ats/preferred_source"),
                preferred.to_string(),
                true,
                QoS::AtMostOnce,
            )
            .await;
        }
        if let Some(current) = data.ats_current_source {
            self.publish(
                &format!("{prefix}/ats/current_source"),
                current.to_string(),
                true,
                QoS::AtMostOnce,
            )
            .await;
        }
        self.publish(
            &format!("{prefix}/ats/auto_transfer"),
            data.ats_auto_transfer.to_string(),
            true,
            QoS::AtMostOnce,
        )
        .await;
        if let Some(ok) = data.redundancy_ok {
            self.publish(
                &format!("{prefix}/ats/redundancy_ok"),
                ok.to_string(),
                true,
                QoS::AtMostOnce,
            )
            .await;
        }

        // Totals.
        self.publish(
            &format!("{prefix}/total/power"),
            format!("{:.1}", data.total_power()),
            true,
            QoS::AtMostOnce,
        )
        .await;
        self.publish(
            &format!("{prefix}/total/active_outlets"),
            data.active_outlets().to_string(),
            true,
            QoS::AtMostOnce,
        )
        .await;

        // Environment scalars, only when a sensor is attached.
        if let Some(env) = data.environment.as_ref().filter(|e| e.sensor_present) {
            if let Some(t) = env.temperature {
                self.publish(
                    &format!("{prefix}/environment/temperature"),
                    t.to_string(),
                    true,
                    QoS::AtMostOnce,
                )
                .await;
            }
            if let Some(h) = env.humidity {
                self.publish(
                    &format!("{prefix}/environment/humidity"),
                    h.to_string(),
                    true,
                    QoS::AtMostOnce,
                )
                .await;
            }
            for (n, closed) in &env.contacts {
                self.publish(
                    &format!("{prefix}/environment/contact_{n}"),
                    closed.to_string(),
                    true,
                    QoS::AtMostOnce,
                )
                .await;
            }
        }

        Ok(())
    }

    /// Command completion response (QoS 1, not retained).
    pub async fn publish_command_response(
        &self,
        device_id: &str,
        outlet: u16,
        command: &str,
        success: bool,
        error: Option<&str>,
    ) {
        let response = json!({
            "success": success,
            "command": command,
            "outlet": outlet,
            "error": error,
            "ts": now_secs(),
        });
        self.publish(
            &format!("pdu/{device_id}/outlet/{outlet}/command/response"),
            response.to_string(),
            false,
            QoS::AtLeastOnce,
        )
        .await;
    }

    /// Retained snapshot of the device's rule list.
    pub async fn publish_automation_status(&self, device_id: &str, rules: &[serde_json::Value]) {
        self.publish(
            &format!("pdu/{device_id}/automation/status"),
            serde_json::Value::Array(rules.to_vec()).to_string(),
            true,
            QoS::AtMostOnce,
        )
        .await;
    }

    /// One automation event (QoS 1, not retained).
    pub async fn publish_automation_event(&self, device_id: &str, event: &RuleEvent) {
        let payload = serde_json::to_string(event).unwrap_or_default();
        self.publish(
            &format!("pdu/{device_id}/automation/event"),
            payload,
            false,
            QoS::AtLeastOnce,
        )
        .await;
    }

    // -- Home Assistant discovery -------------------------------------------

    /// Emit discovery configs for a device. Idempotent per device per
    /// process lifetime: a second call is a no-op.
    pub async fn publish_ha_discovery(
        &self,
        device_id: &str,
        outlet_count: u16,
        num_banks: u16,
        identity: Option<&DeviceIdentity>,
    ) {
        {
            let mut shared = self.shared.lock().await;
            if !shared.ha_discovery_sent.insert(device_id.to_string()) {
                return;
            }
        }

        let messages = ha_discovery_configs(device_id, outlet_count, num_banks, identity);
        let count = messages.len();
        for (topic, payload) in messages {
            self.publish(&topic, payload, true, QoS::AtMostOnce).await;
        }
        info!(
            device = device_id,
            outlets = outlet_count,
            banks = num_banks,
            configs = count,
            "published home assistant discovery"
        );
    }

    // -- Shutdown -----------------------------------------------------------

    /// Publish retained `offline` for every registered device, then
    /// disconnect the client.
    pub async fn shutdown(&self) {
        let registered: Vec<String> = {
            let shared = self.shared.lock().await;
            shared.registered.iter().cloned().collect()
        };
        for device_id in registered {
            self.publish(
                &format!("pdu/{device_id}/bridge/status"),
                "offline".to_string(),
                true,
                QoS::AtLeastOnce,
            )
            .await;
        }
        if let Err(e) = self.client.disconnect().await {
            warn!("mqtt: error during disconnect: {e}");
        }
    }

    // -- Health -------------------------------------------------------------

    pub async fn connected(&self) -> bool {
        self.shared.lock().await.connected
    }

    pub async fn get_status(&self) -> serde_json::Value {
        let shared = self.shared.lock().await;
        json!({
            "connected": shared.connected,
            "reconnect_count": shared.reconnect_count,
            "last_connect": shared.last_connect,
            "last_disconnect": shared.last_disconnect,
            "broker": self.broker,
            "port": self.port,
            "total_publishes": shared.total_publishes,
            "publish_errors": shared.publish_errors,
            "pending_publishes": shared.pending.len(),
            "dropped_retained": shared.dropped_retained,
            "ha_discovery_sent": shared.ha_discovery_sent.iter().cloned().collect::<Vec<_>>(),
            "registered_devices": shared.registered.iter().cloned().collect::<Vec<_>>(),
        })
    }

    #[cfg(test)]
    async fn total_publishes(&self) -> u64 {
        self.shared.lock().await.total_publishes
    }
}

// ---------------------------------------------------------------------------
// Command routing
// ---------------------------------------------------------------------------

/// Parse `pdu/<device_id>/outlet/<n>/command` into its parts.
pub fn parse_command_topic(topic: &str) -> Option<(&str, u16)> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 5 && parts[0] == "pdu" && parts[2] == "outlet" && parts[4] == "command" {
        let outlet: u16 = parts[3].parse().ok()?;
        Some((parts[1], outlet))
    } else {
        None
    }
}

/// Route one incoming command publish to the owning poller. Unknown devices
/// and malformed topics or payloads are logged and dropped.
pub async fn route_command(state: &SharedState, topic: &str, payload: &[u8]) {
    let Some((device_id, outlet)) = parse_command_topic(topic) else {
        warn!(topic, "mqtt: unhandled topic");
        return;
    };

    let text = String::from_utf8_lossy(payload);
    let Some(action) = OutletAction::parse(&text) else {
        warn!(topic, payload = %text.trim(), "mqtt: unknown outlet command");
        return;
    };

    info!(device = device_id, outlet, action = %action, "mqtt command received");

    match state.commander_for(device_id).await {
        Some(commander) => {
            if !commander.dispatch(outlet, action) {
                warn!(device = device_id, outlet, "mqtt: poller unavailable, command dropped");
            }
        }
        None => {
            warn!(device = device_id, "mqtt: no callback registered for device");
        }
    }
}

fn reconnect_delay(consecutive_errors: u32) -> f64 {
    let base = BACKOFF_MIN * 2f64.powi(consecutive_errors.saturating_sub(1).min(8) as i32);
    let capped = base.min(BACKOFF_MAX);
    // Jitter up to half the delay to avoid fleet-wide thundering herds.
    capped + fastrand::f64() * capped * 0.5
}

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

// ---------------------------------------------------------------------------
// Home Assistant discovery payloads
// ---------------------------------------------------------------------------

/// Build the retained discovery messages for one device. Pure so the
/// payload set is testable without a broker.
pub fn ha_discovery_configs(
    device_id: &str,
    outlet_count: u16,
    num_banks: u16,
    identity: Option<&DeviceIdentity>,
) -> Vec<(String, String)> {
    let base = format!("pdu/{device_id}");

    let identifiers = match identity {
        Some(id) if !id.serial.is_empty() => vec![format!("cyberpdu_{}", id.serial)],
        _ => vec![format!("cyberpdu_{device_id}")],
    };
    let model = identity
        .map(|id| id.model.as_str())
        .filter(|m| !m.is_empty())
        .unwrap_or("PDU44001");

    let mut device_info = json!({
        "identifiers": identifiers,
        "name": format!("CyberPower {}", device_id.to_uppercase()),
        "manufacturer": "CyberPower",
        "model": model,
    });
    if let Some(id) = identity {
        if !id.firmware_main.is_empty() {
            device_info["sw_version"] = json!(id.firmware_main);
        }
        if id.hardware_rev != 0 {
            device_info["hw_version"] = json!(id.hardware_rev.to_string());
        }
    }

    let availability = json!({
        "topic": format!("{base}/bridge/status"),
        "payload_available": "online",
        "payload_not_available": "offline",
    });

    let mut messages = Vec::new();

    // Outlet switches.
    for n in 1..=outlet_count {
        let uid = format!("{device_id}_outlet_{n}");
        let config = json!({
            "name": format!("Outlet {n}"),
            "unique_id": uid,
            "device": device_info.clone(),
            "availability": availability.clone(),
            "state_topic": format!("{base}/outlet/{n}/state"),
            "command_topic": format!("{base}/outlet/{n}/command"),
            "payload_on": "on",
            "payload_off": "off",
            "state_on": "on",
            "state_off": "off",
            "icon": "mdi:power-socket-us",
        });
        messages.push((
            format!("homeassistant/switch/{uid}/config"),
            config.to_string(),
        ));
    }

    // Bank sensors.
    let bank_metrics: [(&str, &str, Option<&str>, &str); 6] = [
        ("voltage", "V", Some("voltage"), "mdi:flash-triangle"),
        ("current", "A", Some("current"), "mdi:current-ac"),
        ("power", "W", Some("power"), "mdi:flash"),
        ("apparent_power", "VA", None, "mdi:flash-outline"),
        ("power_factor", "", Some("power_factor"), "mdi:angle-acute"),
        ("load_state", "", None, "mdi:gauge"),
    ];
    for idx in 1..=num_banks {
        for (metric, unit, device_class, icon) in &bank_metrics {
            let uid = format!("{device_id}_bank_{idx}_{metric}");
            let mut config = json!({
                "name": format!("Bank {idx} {}", title_case(metric)),
                "unique_id": uid,
                "device": device_info.clone(),
                "availability": availability.clone(),
                "state_topic": format!("{base}/bank/{idx}/{metric}"),
                "icon": icon,
            });
            if !unit.is_empty() {
                config["unit_of_measurement"] = json!(unit);
            }
            if let Some(class) = device_class {
                config["device_class"] = json!(class);
            }
            if *metric != "load_state" {
                config["state_class"] = json!("measurement");
            }
            messages.push((
                format!("homeassistant/sensor/{uid}/config"),
                config.to_string(),
            ));
        }
    }

    // Input sensors.
    for (metric, unit, device_class, icon) in [
        ("voltage", "V", "voltage", "mdi:flash-triangle"),
        ("frequency", "Hz", "frequency", "mdi:sine-wave"),
    ] {
        let uid = format!("{device_id}_input_{metric}");
        let config = json!({
            "name": format!("Input {}", title_case(metric)),
            "unique_id": uid,
            "device": device_info.clone(),
            "availability": availability.clone(),
            "state_topic": format!("{base}/input/{metric}"),
            "unit_of_measurement": unit,
            "device_class": device_class,
            "state_class": "measurement",
            "icon": icon,
        });
        messages.push((
            format!("homeassistant/sensor/{uid}/config"),
            config.to_string(),
        ));
    }

    // Bridge status binary sensor.
    let uid = format!("{device_id}_bridge_status");
    let config = json!({
        "name": "Bridge Status",
        "unique_id": uid,
        "device": device_info.clone(),
        "state_topic": format!("{base}/bridge/status"),
        "payload_on": "online",
        "payload_off": "offline",
        "device_class": "connectivity",
        "icon": "mdi:bridge",
    });
    messages.push((
        format!("homeassistant/binary_sensor/{uid}/config"),
        config.to_string(),
    ));

    messages
}

fn title_case(s: &str) -> String {
    s.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ===========================================================================
// Tests
// ===========================================================================
