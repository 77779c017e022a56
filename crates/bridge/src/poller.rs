//! Per-device poll loop.
//!
//! Each poller owns exactly one transport and one rule engine. It drives the
//! health state machine (HEALTHY -> DEGRADED -> RECOVERING -> LOST) from the
//! transport's consecutive failure count, relocates the device by serial
//! after an IP change, and fans every snapshot out to MQTT, history, the web
//! cache, and rule evaluation, each behind its own error isolator so one
//! sick subsystem never starves the others.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{error, info, warn};

use crate::automation::{OutletCommander, RuleEngine};
use crate::discovery::{recovery_subnet, SerialFinder};
use crate::history::HistoryStore;
use crate::model::{DeviceIdentity, OutletAction, Snapshot};
use crate::mqtt::MqttHandler;
use crate::state::{OutletNameStore, PollerRequest, SharedState};
use crate::transport::{StartupData, Transport};

/// Consecutive failures before HEALTHY degrades.
const DEGRADED_THRESHOLD: u32 = 10;

/// Consecutive failures before DEGRADED starts recovery scanning.
const RECOVERING_THRESHOLD: u32 = 30;

/// Failed recovery scans before the device is declared LOST.
const MAX_RECOVERY_SCANS: u32 = 5;

/// Minimum seconds between recovery scans while LOST.
const LOST_RESCAN_SECS: u64 = 300;

/// Poll interval while LOST.
const LOST_POLL_INTERVAL: f64 = 30.0;

/// Idle sleep while latched on a serial mismatch.
const MISMATCH_IDLE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerHealth {
    Healthy,
    Degraded,
    Recovering,
    Lost,
}

impl PollerHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollerHealth::Healthy => "healthy",
            PollerHealth::Degraded => "degraded",
            PollerHealth::Recovering => "recovering",
            PollerHealth::Lost => "lost",
        }
    }
}

#[derive(Default)]
struct SubsystemErrors {
    mqtt: u64,
    history: u64,
    automation: u64,
}

pub struct PduPoller {
    device_id: String,
    transport: Box<dyn Transport>,
    engine: Arc<Mutex<RuleEngine>>,
    mqtt: MqttHandler,
    history: HistoryStore,
    state: SharedState,
    outlet_names: Arc<RwLock<OutletNameStore>>,
    finder: Option<Arc<dyn SerialFinder>>,
    recovery_enabled: bool,
    default_num_banks: u16,
    cmd_rx: mpsc::Receiver<PollerRequest>,
    running: watch::Receiver<bool>,

    identity: Option<DeviceIdentity>,
    outlet_count: u16,
    num_banks: u16,
    startup_data: StartupData,
    last_sys_uptime: Option<i64>,
    serial_mismatch: bool,

    health: PollerHealth,
    recovery_scan_count: u32,
    last_recovery_scan: Option<Instant>,

    poll_count: u64,
    poll_errors: u64,
    subsystem_errors: SubsystemErrors,
}

impl PduPoller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_id: String,
        transport: Box<dyn Transport>,
        engine: Arc<Mutex<RuleEngine>>,
        mqtt: MqttHandler,
        history: HistoryStore,
        state: SharedState,
        outlet_names: Arc<RwLock<OutletNameStore>>,
        finder: Option<Arc<dyn SerialFinder>>,
        recovery_enabled: bool,
        default_num_banks: u16,
        cmd_rx: mpsc::Receiver<PollerRequest>,
        running: watch::Receiver<bool>,
    ) -> Self {
        Self {
            device_id,
            transport,
            engine,
            mqtt,
            history,
            state,
            outlet_names,
            finder,
            recovery_enabled,
            default_num_banks,
            cmd_rx,
            running,
            identity: None,
            outlet_count: 0,
            num_banks: 0,
            startup_data: StartupData::default(),
            last_sys_uptime: None,
            serial_mismatch: false,
            health: PollerHealth::Healthy,
            recovery_scan_count: 0,
            last_recovery_scan: None,
            poll_count: 0,
            poll_errors: 0,
            subsystem_errors: SubsystemErrors::default(),
        }
    }

    // -- Startup -----------------------------------------------------------

    /// Identity discovery, serial validation, bank detection, startup data,
    /// and the (idempotent) discovery emission.
    async fn startup(&mut self) {
        if let Err(e) = self.transport.connect().await {
            warn!(device = %self.device_id, "transport connect failed: {e}");
        }

        match self.transport.get_identity().await {
            Ok(identity) => {
                info!(
                    device = %self.device_id,
                    model = %identity.model,
                    serial = %identity.serial,
                    outlets = identity.outlet_count,
                    phases = identity.phase_count,
                    "device identity"
                );
                self.validate_serial(&identity).await;
                self.outlet_count = if identity.outlet_count > 0 {
                    identity.outlet_count
                } else {
                    10
                };
                self.identity = Some(identity);
            }
            Err(e) => {
                error!(device = %self.device_id, "identity discovery failed: {e}");
                self.outlet_count = 10;
            }
        }

        if self.serial_mismatch {
            return;
        }

        self.num_banks = match self.transport.discover_num_banks().await {
            Ok(count) if count >= 1 => {
                info!(device = %self.device_id, banks = count, "device reports bank count");
                count
            }
            _ => {
                info!(
                    device = %self.device_id,
                    default = self.default_num_banks,
                    "could not read bank count, using config default"
                );
                self.default_num_banks
            }
        };

        match self.transport.query_startup_data(self.outlet_count).await {
            Ok(data) => {
                info!(
                    device = %self.device_id,
                    assignments = data.bank_assignments.len(),
                    max_loads = data.max_loads.len(),
                    "startup data cached"
                );
                self.startup_data = data;
            }
            Err(e) => warn!(device = %self.device_id, "startup data query failed: {e}"),
        }

        self.mqtt
            .publish_ha_discovery(
                &self.device_id,
                self.outlet_count,
                self.num_banks,
                self.identity.as_ref(),
            )
            .await;
    }

    /// Compare a discovered serial against the saved config serial. A saved
    /// serial that disagrees latches the poller; an empty one is persisted.
    async fn validate_serial(&mut self, identity: &DeviceIdentity) {
        let saved = self
            .state
            .configs()
            .await
            .iter()
            .find(|c| c.device_id == self.device_id)
            .map(|c| c.serial.clone())
            .unwrap_or_default();
        let discovered = &identity.serial;

        if !saved.is_empty() && !discovered.is_empty() && saved != *discovered {
            error!(
                device = %self.device_id,
                saved = %saved,
                discovered = %discovered,
                "serial mismatch, wrong PDU at this address? idling poller"
            );
            self.serial_mismatch = true;
            return;
        }

        if saved.is_empty() && !discovered.is_empty() {
            info!(
                device = %self.device_id,
                serial = %discovered,
                "first-run serial discovery, persisting"
            );
            let device_id = self.device_id.clone();
            let discovered = discovered.clone();
            if let Err(e) = self
                .state
                .update_configs(move |configs| {
                    if let Some(cfg) = configs.iter_mut().find(|c| c.device_id == device_id) {
                        cfg.serial = discovered;
                    }
                })
                .await
            {
                error!(device = %self.device_id, "failed to persist serial: {e:#}");
            }
        } else if !saved.is_empty() {
            info!(device = %self.device_id, serial = %saved, "serial verified");
        }
    }

    // -- Main loop ---------------------------------------------------------

    pub async fn run(mut self) {
        self.startup().await;

        let mut running = self.running.clone();
        loop {
            if !*running.borrow() {
                break;
            }

            if self.serial_mismatch {
                self.idle(MISMATCH_IDLE, &mut running).await;
                continue;
            }

            self.tick().await;

            let interval = if self.health == PollerHealth::Lost {
                LOST_POLL_INTERVAL
            } else {
                self.state.poll_interval()
            };
            self.idle(Duration::from_secs_f64(interval), &mut running).await;
        }

        self.transport.close();
        info!(device = %self.device_id, "poller stopped");
    }

    /// One poll iteration: poll, fan out, update the health FSM, and kick
    /// recovery scans when warranted.
    async fn tick(&mut self) {
        let poll_start = Instant::now();

        match self.transport.poll().await {
            Ok(mut snapshot) => {
                // Overrides and startup caches are applied before any
                // fan-out so every subsystem sees the same snapshot.
                self.outlet_names.read().await.apply(&mut snapshot);
                self.merge_startup_data(&mut snapshot);
                self.detect_reboot(&snapshot);

                self.safe_publish(&snapshot).await;
                self.safe_record(&snapshot).await;
                self.state
                    .update_snapshot(&self.device_id, snapshot.clone())
                    .await;
                self.safe_evaluate(&snapshot).await;

                self.poll_count += 1;
                if self.poll_count % 60 == 1 {
                    info!(
                        device = %self.device_id,
                        poll = self.poll_count,
                        state = self.health.as_str(),
                        voltage = snapshot.input_voltage.unwrap_or(0.0),
                        outlets = snapshot.outlets.len(),
                        banks = snapshot.banks.len(),
                        elapsed_ms = poll_start.elapsed().as_millis() as u64,
                        "poll"
                    );
                }
            }
            Err(e) => {
                self.poll_errors += 1;
                if self.poll_errors <= 5 || self.poll_errors % 30 == 0 {
                    error!(
                        device = %self.device_id,
                        errors = self.poll_errors,
                        "poll failed: {e}"
                    );
                }
            }
        }

        self.update_health(self.transport.consecutive_failures());

        match self.health {
            PollerHealth::Recovering => self.attempt_recovery().await,
            PollerHealth::Lost => {
                let due = self
                    .last_recovery_scan
                    .map(|t| t.elapsed().as_secs() >= LOST_RESCAN_SECS)
                    .unwrap_or(true);
                if due {
                    self.attempt_recovery().await;
                }
            }
            _ => {}
        }
    }

    fn merge_startup_data(&self, snapshot: &mut Snapshot) {
        for (n, outlet) in snapshot.outlets.iter_mut() {
            if outlet.bank_assignment.is_none() {
                outlet.bank_assignment = self.startup_data.bank_assignments.get(n).copied();
            }
            if outlet.max_load.is_none() {
                outlet.max_load = self.startup_data.max_loads.get(n).copied();
            }
        }
    }

    fn detect_reboot(&mut self, snapshot: &Snapshot) {
        let Some(uptime) = snapshot.identity.as_ref().map(|i| i.sys_uptime) else {
            return;
        };
        if let Some(previous) = self.last_sys_uptime {
            if uptime < previous {
                warn!(
                    device = %self.device_id,
                    previous,
                    current = uptime,
                    "device reboot detected"
                );
            }
        }
        self.last_sys_uptime = Some(uptime);
    }

    // -- Health FSM ---------------------------------------------------------

    fn update_health(&mut self, consecutive_failures: u32) {
        if consecutive_failures == 0 {
            if self.health != PollerHealth::Healthy {
                info!(device = %self.device_id, "state -> healthy");
            }
            self.health = PollerHealth::Healthy;
            self.recovery_scan_count = 0;
            return;
        }

        if self.health == PollerHealth::Healthy && consecutive_failures >= DEGRADED_THRESHOLD {
            self.health = PollerHealth::Degraded;
            warn!(
                device = %self.device_id,
                consecutive_failures,
                "state -> degraded"
            );
        }

        if self.health == PollerHealth::Degraded && consecutive_failures >= RECOVERING_THRESHOLD {
            self.health = PollerHealth::Recovering;
            warn!(
                device = %self.device_id,
                consecutive_failures,
                "state -> recovering"
            );
        }
    }

    // -- Recovery ------------------------------------------------------------

    /// Scan the recovery subnet for this device's serial at a new address.
    async fn attempt_recovery(&mut self) {
        if !self.recovery_enabled {
            return;
        }
        let Some(finder) = self.finder.clone() else {
            return;
        };

        let Some(cfg) = self
            .state
            .configs()
            .await
            .into_iter()
            .find(|c| c.device_id == self.device_id)
        else {
            return;
        };

        if cfg.serial.is_empty() {
            warn!(device = %self.device_id, "cannot recover, no serial number saved");
            return;
        }
        let Some(subnet) = recovery_subnet(&cfg.recovery_subnet, &cfg.host) else {
            warn!(device = %self.device_id, "cannot recover, no subnet to scan");
            return;
        };

        self.recovery_scan_count += 1;
        self.last_recovery_scan = Some(Instant::now());
        info!(
            device = %self.device_id,
            scan = self.recovery_scan_count,
            subnet = %subnet,
            serial = %cfg.serial,
            "recovery scan"
        );

        let found = finder
            .find_by_serial(&cfg.serial, &subnet, &cfg.community_read, cfg.snmp_port)
            .await;

        match found {
            Some(found) if found.host != cfg.host => {
                info!(
                    device = %self.device_id,
                    new_host = %found.host,
                    old_host = %cfg.host,
                    "device found at new address"
                );
                let device_id = self.device_id.clone();
                let new_host = found.host.clone();
                if let Err(e) = self
                    .state
                    .update_configs(move |configs| {
                        if let Some(c) = configs.iter_mut().find(|c| c.device_id == device_id) {
                            c.host = new_host;
                        }
                    })
                    .await
                {
                    error!(device = %self.device_id, "failed to persist new host: {e:#}");
                }

                self.transport.update_target(&found.host, Some(cfg.snmp_port));
                self.transport.reset_health();

                // Re-verify identity; a mismatch here latches like startup.
                match self.transport.get_identity().await {
                    Ok(identity) => {
                        self.validate_serial(&identity).await;
                        self.identity = Some(identity);
                    }
                    Err(e) => {
                        error!(device = %self.device_id, "post-recovery identity check failed: {e}")
                    }
                }

                if !self.serial_mismatch {
                    self.health = PollerHealth::Healthy;
                    self.recovery_scan_count = 0;
                    info!(device = %self.device_id, "recovery successful, resuming polls");
                }
            }
            Some(_) => {
                // Same address; the device just came back.
                self.transport.reset_health();
                self.health = PollerHealth::Healthy;
                self.recovery_scan_count = 0;
                info!(device = %self.device_id, "device back online at same address");
            }
            None => {
                warn!(
                    device = %self.device_id,
                    scan = self.recovery_scan_count,
                    "recovery scan found nothing"
                );
                if self.recovery_scan_count >= MAX_RECOVERY_SCANS {
                    if self.health != PollerHealth::Lost {
                        error!(
                            device = %self.device_id,
                            scans = self.recovery_scan_count,
                            "device declared lost"
                        );
                    }
                    self.health = PollerHealth::Lost;
                }
            }
        }
    }

    // -- Subsystem isolation --------------------------------------------------

    async fn safe_publish(&mut self, snapshot: &Snapshot) {
        if let Err(e) = self.mqtt.publish_snapshot(&self.device_id, snapshot).await {
            self.subsystem_errors.mqtt += 1;
            if should_log_subsystem(self.subsystem_errors.mqtt) {
                error!(
                    device = %self.device_id,
                    errors = self.subsystem_errors.mqtt,
                    "mqtt publish error: {e:#}"
                );
            }
        }
    }

    async fn safe_record(&mut self, snapshot: &Snapshot) {
        if let Err(e) = self.history.record(snapshot, &self.device_id).await {
            self.subsystem_errors.history += 1;
            if should_log_subsystem(self.subsystem_errors.history) {
                error!(
                    device = %self.device_id,
                    errors = self.subsystem_errors.history,
                    "history record error: {e:#}"
                );
            }
        }
    }

    async fn safe_evaluate(&mut self, snapshot: &Snapshot) {
        let engine = self.engine.clone();
        let mut engine = engine.lock().await;

        let failures_before = engine.command_failures();
        let mut commander = PollerCommander {
            device_id: &self.device_id,
            transport: &mut self.transport,
            mqtt: &self.mqtt,
        };
        let events = engine.evaluate(snapshot, &mut commander).await;

        let new_failures = engine.command_failures().saturating_sub(failures_before);
        if new_failures > 0 {
            self.subsystem_errors.automation += new_failures;
            if should_log_subsystem(self.subsystem_errors.automation) {
                error!(
                    device = %self.device_id,
                    errors = self.subsystem_errors.automation,
                    "automation command errors this tick: {new_failures}"
                );
            }
        }

        self.mqtt
            .publish_automation_status(&self.device_id, &engine.list_rules())
            .await;
        for event in &events {
            self.mqtt.publish_automation_event(&self.device_id, event).await;
        }
    }

    // -- Commands ------------------------------------------------------------

    async fn handle_request(&mut self, request: PollerRequest) {
        match request {
            PollerRequest::Outlet {
                outlet,
                action,
                reply,
            } => {
                let success = if self.serial_mismatch {
                    false
                } else {
                    self.transport.command_outlet(outlet, action).await
                };
                let error = if success {
                    None
                } else if self.serial_mismatch {
                    Some("poller latched on serial mismatch")
                } else {
                    Some("command failed")
                };
                self.mqtt
                    .publish_command_response(
                        &self.device_id,
                        outlet,
                        action.as_str(),
                        success,
                        error,
                    )
                    .await;
                info!(
                    device = %self.device_id,
                    outlet,
                    action = %action,
                    success,
                    "outlet command"
                );
                if let Some(reply) = reply {
                    let _ = reply.send(success);
                }
            }
            PollerRequest::SetField { field, value, reply } => {
                let success = if self.serial_mismatch {
                    false
                } else {
                    self.transport.set_device_field(field, &value).await
                };
                if let Some(reply) = reply {
                    let _ = reply.send(success);
                }
            }
        }
    }

    /// Sleep until the deadline while serving command requests, so commands
    /// issued mid-interval do not wait for the next poll.
    async fn idle(&mut self, duration: Duration, running: &mut watch::Receiver<bool>) {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline || !*running.borrow() {
                return;
            }
            let remaining = deadline - now;

            enum IdleEvent {
                Timeout,
                Request(Option<PollerRequest>),
                Stopped,
            }

            let event = tokio::select! {
                _ = tokio::time::sleep(remaining) => IdleEvent::Timeout,
                request = self.cmd_rx.recv() => IdleEvent::Request(request),
                _ = running.changed() => IdleEvent::Stopped,
            };

            match event {
                IdleEvent::Timeout | IdleEvent::Stopped => return,
                IdleEvent::Request(Some(request)) => self.handle_request(request).await,
                IdleEvent::Request(None) => {
                    // Channel closed; nothing more to serve.
                    tokio::time::sleep(deadline.saturating_duration_since(Instant::now())).await;
                    return;
                }
            }
        }
    }

    pub fn health(&self) -> PollerHealth {
        self.health
    }
}

fn should_log_subsystem(count: u64) -> bool {
    count <= 3 || count % 30 == 0
}

// ---------------------------------------------------------------------------
// Rule-engine commander over the poller's transport
// ---------------------------------------------------------------------------

struct PollerCommander<'a> {
    device_id: &'a str,
    transport: &'a mut Box<dyn Transport>,
    mqtt: &'a MqttHandler,
}

#[async_trait]
impl OutletCommander for PollerCommander<'_> {
    async fn command(&mut self, outlet: u16, action: OutletAction) -> anyhow::Result<()> {
        let success = self.transport.command_outlet(outlet, action).await;
        self.mqtt
            .publish_command_response(
                self.device_id,
                outlet,
                action.as_str(),
                success,
                if success { None } else { Some("command failed") },
            )
            .await;
        if success {
            Ok(())
        } else {
            anyhow::bail!("outlet {outlet} {action} command failed")
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
