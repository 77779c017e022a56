//! Top-level orchestration: loads device configs, builds the shared history
//! store, MQTT handler, and web state, launches one poller task per enabled
//! PDU (staggered to avoid a thundering herd), runs the hourly report and
//! retention task, and coordinates shutdown.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::automation::RuleEngine;
use crate::config::BridgeConfig;
use crate::discovery::SerialFinder;
use crate::history::HistoryStore;
use crate::mqtt::MqttHandler;
use crate::pdu_config::{check_unique_device_ids, load_pdu_configs, PduConfig};
use crate::poller::PduPoller;
use crate::state::{BridgeState, CommandHandle, DeviceHandles, OutletNameStore, SharedState};
use crate::transport::Transport;
use crate::web::{AppState, PduDiscoverer};

/// Delay between poller launches.
const POLLER_STAGGER: Duration = Duration::from_millis(100);

/// Report generation / retention cleanup cadence.
const REPORT_INTERVAL: Duration = Duration::from_secs(3600);

/// Builds a transport for a device config. The SNMP and serial back-ends
/// live outside this crate; mock mode wires [`crate::mock::MockPdu`].
pub type TransportFactory =
    Arc<dyn Fn(&PduConfig) -> Result<Box<dyn Transport>> + Send + Sync>;

pub struct BridgeManager {
    config: BridgeConfig,
    state: SharedState,
    history: HistoryStore,
    mqtt: MqttHandler,
    eventloop: rumqttc::EventLoop,
    pollers: Vec<PduPoller>,
    discovery: Option<Arc<dyn PduDiscoverer>>,
    running_tx: watch::Sender<bool>,
    running_rx: watch::Receiver<bool>,
}

impl BridgeManager {
    pub async fn new(
        config: BridgeConfig,
        transport_factory: TransportFactory,
        finder: Option<Arc<dyn SerialFinder>>,
        discovery: Option<Arc<dyn PduDiscoverer>>,
    ) -> Result<Self> {
        let pdu_configs = load_pdu_configs(
            &config.pdus_file,
            &config.pdu_host,
            config.pdu_snmp_port,
            &config.pdu_community_read,
            &config.pdu_community_write,
            &config.device_id,
            config.mock_mode,
        )?;
        check_unique_device_ids(&pdu_configs)?;

        let enabled: Vec<PduConfig> = pdu_configs
            .iter()
            .filter(|c| c.enabled)
            .cloned()
            .collect();
        let single_pdu = pdu_configs.len() == 1;
        let primary_device = enabled
            .first()
            .or(pdu_configs.first())
            .map(|c| c.device_id.clone())
            .context("no PDU configured")?;

        let history = HistoryStore::open(
            &config.history_db,
            config.history_retention_days,
            config.house_monthly_kwh,
        )
        .await?;

        let state = BridgeState::new(
            pdu_configs.clone(),
            config.pdus_file.clone(),
            config.poll_interval,
        );

        let (mqtt, eventloop) = MqttHandler::new(&config, &primary_device);

        let (running_tx, running_rx) = watch::channel(true);

        let mut pollers = Vec::new();
        for pdu_cfg in &pdu_configs {
            if !pdu_cfg.enabled {
                info!(device = %pdu_cfg.device_id, "skipping disabled PDU");
                continue;
            }

            let transport = transport_factory(pdu_cfg)
                .with_context(|| format!("building transport for {:?}", pdu_cfg.device_id))?;

            let engine = Arc::new(Mutex::new(RuleEngine::load(
                config.rules_file_for(&pdu_cfg.device_id, single_pdu),
            )));
            let outlet_names = Arc::new(RwLock::new(OutletNameStore::load(
                config.outlet_names_file_for(&pdu_cfg.device_id, single_pdu),
            )));
            let (commander, cmd_rx) = CommandHandle::channel(16);

            state
                .register_device(
                    &pdu_cfg.device_id,
                    DeviceHandles {
                        engine: engine.clone(),
                        commander,
                        outlet_names: outlet_names.clone(),
                    },
                )
                .await;
            mqtt.register_device(&pdu_cfg.device_id).await;

            pollers.push(PduPoller::new(
                pdu_cfg.device_id.clone(),
                transport,
                engine,
                mqtt.clone(),
                history.clone(),
                state.clone(),
                outlet_names,
                finder.clone(),
                config.recovery_enabled,
                pdu_cfg.num_banks,
                cmd_rx,
                running_rx.clone(),
            ));
        }

        info!(
            configured = pdu_configs.len(),
            active = pollers.len(),
            "bridge manager ready"
        );

        Ok(Self {
            config,
            state,
            history,
            mqtt,
            eventloop,
            pollers,
            discovery,
            running_tx,
            running_rx,
        })
    }

    pub fn poller_count(&self) -> usize {
        self.pollers.len()
    }

    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    /// Run until SIGINT/SIGTERM, then shut everything down in order: stop
    /// pollers, announce offline over MQTT, close the history store.
    pub async fn run(self) -> Result<()> {
        let Self {
            config,
            state,
            history,
            mqtt,
            eventloop,
            pollers,
            discovery,
            running_tx,
            running_rx,
        } = self;

        // MQTT network loop.
        let mqtt_task = {
            let mqtt = mqtt.clone();
            let state = state.clone();
            let running = running_rx.clone();
            tokio::spawn(async move {
                mqtt.run_event_loop(eventloop, state, running).await;
            })
        };

        // Web server.
        let web_task = {
            let app = AppState {
                state: state.clone(),
                history: history.clone(),
                mqtt: mqtt.clone(),
                discovery,
            };
            let port = config.web_port;
            tokio::spawn(async move {
                if let Err(e) = crate::web::serve(app, port).await {
                    error!("web server exited: {e:#}");
                }
            })
        };

        // Hourly reports + retention cleanup.
        let report_task = {
            let history = history.clone();
            let state = state.clone();
            let mut running = running_rx.clone();
            tokio::spawn(async move {
                loop {
                    for device_id in state.registered_devices().await {
                        match history.generate_weekly_report(&device_id).await {
                            Ok(Some(_)) => {}
                            Ok(None) => {}
                            Err(e) => error!(device = %device_id, "report generation failed: {e:#}"),
                        }
                    }
                    if let Err(e) = history.cleanup().await {
                        error!("history cleanup failed: {e:#}");
                    }

                    tokio::select! {
                        _ = tokio::time::sleep(REPORT_INTERVAL) => {}
                        _ = running.changed() => {
                            if !*running.borrow() {
                                return;
                            }
                        }
                    }
                }
            })
        };

        // Pollers, staggered to spread broker and database load.
        let mut poller_tasks: Vec<JoinHandle<()>> = Vec::new();
        let total = pollers.len();
        for (i, poller) in pollers.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(POLLER_STAGGER).await;
            }
            info!(launched = i + 1, total, "launching poller");
            poller_tasks.push(tokio::spawn(poller.run()));
        }

        // Wait for a shutdown signal.
        let signal = wait_for_shutdown().await;
        warn!(signal, "shutting down");

        let _ = running_tx.send(false);

        for task in poller_tasks {
            if let Err(e) = task.await {
                error!("poller task join error: {e}");
            }
        }

        mqtt.shutdown().await;
        let _ = mqtt_task.await;
        web_task.abort();
        let _ = report_task.await;

        history.close().await;
        info!("shutdown complete");
        Ok(())
    }
}

async fn wait_for_shutdown() -> &'static str {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                let _ = ctrl_c.await;
                return "SIGINT";
            }
        };
    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPdu;
    use std::path::PathBuf;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("pdu_manager_{}_{}", std::process::id(), name));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn mock_factory() -> TransportFactory {
        Arc::new(|cfg: &PduConfig| {
            Ok(Box::new(MockPdu::new(10, cfg.num_banks, "PDU44001")) as Box<dyn Transport>)
        })
    }

    fn config_in(dir: &std::path::Path) -> BridgeConfig {
        BridgeConfig {
            pdu_host: String::new(),
            pdu_snmp_port: 161,
            pdu_community_read: "public".into(),
            pdu_community_write: "private".into(),
            device_id: "pdu44001".into(),
            mqtt_broker: "127.0.0.1".into(),
            mqtt_port: 1883,
            mqtt_username: String::new(),
            mqtt_password: String::new(),
            poll_interval: 1.0,
            mock_mode: true,
            log_level: "info".into(),
            snmp_timeout: 2.0,
            snmp_retries: 1,
            rules_file: dir.join("rules.json"),
            web_port: 8080,
            history_db: dir.join("history.db"),
            history_retention_days: 60,
            house_monthly_kwh: 0.0,
            outlet_names_file: dir.join("outlet_names.json"),
            pdus_file: dir.join("pdus.json"),
            recovery_enabled: true,
        }
    }

    #[tokio::test]
    async fn mock_mode_builds_one_poller() {
        let dir = temp_dir("mockmode");
        let manager = BridgeManager::new(config_in(&dir), mock_factory(), None, None)
            .await
            .unwrap();
        assert_eq!(manager.poller_count(), 1);
        assert_eq!(
            manager.state().registered_devices().await,
            vec!["pdu44001".to_string()]
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn disabled_pdus_get_no_poller() {
        let dir = temp_dir("disabled");
        let mut a = PduConfig::new("p1", "10.0.0.5");
        a.serial = "SN1".into();
        let mut b = PduConfig::new("p2", "10.0.0.6");
        b.enabled = false;
        crate::pdu_config::save_pdu_configs(&[a, b], &dir.join("pdus.json")).unwrap();

        let manager = BridgeManager::new(config_in(&dir), mock_factory(), None, None)
            .await
            .unwrap();
        assert_eq!(manager.poller_count(), 1);
        // Both stay visible to the web layer.
        assert_eq!(manager.state().registered_devices().await.len(), 2);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn duplicate_device_ids_rejected() {
        let dir = temp_dir("dup");
        let a = PduConfig::new("p1", "10.0.0.5");
        let b = PduConfig::new("p1", "10.0.0.6");
        crate::pdu_config::save_pdu_configs(&[a, b], &dir.join("pdus.json")).unwrap();

        let result = BridgeManager::new(config_in(&dir), mock_factory(), None, None).await;
        assert!(result.is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn failing_transport_factory_aborts_startup() {
        let dir = temp_dir("nofactory");
        let factory: TransportFactory =
            Arc::new(|_: &PduConfig| anyhow::bail!("no transport linked into this build"));
        let result = BridgeManager::new(config_in(&dir), factory, None, None).await;
        assert!(result.is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn multi_pdu_uses_per_device_rules_files() {
        let dir = temp_dir("multirules");
        let mut a = PduConfig::new("p1", "10.0.0.5");
        a.num_banks = 2;
        let b = PduConfig::new("p2", "10.0.0.6");
        crate::pdu_config::save_pdu_configs(&[a, b], &dir.join("pdus.json")).unwrap();

        let config = config_in(&dir);
        let manager = BridgeManager::new(config.clone(), mock_factory(), None, None)
            .await
            .unwrap();
        assert_eq!(manager.poller_count(), 2);

        // Creating a rule through p1's engine writes the per-device file.
        let engine = manager.state().engine_for("p1").await.unwrap();
        engine
            .lock()
            .await
            .create_rule(&serde_json::json!({
                "name": "r1",
                "input": 1,
                "condition": "voltage_below",
                "threshold": 100.0,
                "outlet": 1,
                "action": "off",
            }))
            .unwrap();
        assert!(dir.join("rules_p1.json").exists());
        assert!(!dir.join("rules.json").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
