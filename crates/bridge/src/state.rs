//! Shared live state: the snapshot cache the web layer reads, the PDU config
//! list, per-device rule engines, command handles into each poller, and
//! outlet-name overrides. One instance is shared by the manager, every
//! poller, the MQTT router, and the web server.

use anyhow::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{error, info, warn};

use crate::automation::RuleEngine;
use crate::model::{OutletAction, Snapshot};
use crate::pdu_config::{save_pdu_configs, write_atomic, PduConfig};
use crate::transport::DeviceField;

pub type SharedState = Arc<BridgeState>;

// ---------------------------------------------------------------------------
// Poller command hand-off
// ---------------------------------------------------------------------------

/// A request crossing from the MQTT router or a web handler into the poller
/// task that owns the transport.
pub enum PollerRequest {
    Outlet {
        outlet: u16,
        action: OutletAction,
        reply: Option<oneshot::Sender<bool>>,
    },
    SetField {
        field: DeviceField,
        value: String,
        reply: Option<oneshot::Sender<bool>>,
    },
}

/// Sender half of a poller's command channel. Cloned into the per-device
/// commander map; the poller drains the receiver between polls.
#[derive(Clone)]
pub struct CommandHandle {
    tx: mpsc::Sender<PollerRequest>,
}

impl CommandHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PollerRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Fire-and-forget dispatch (MQTT path; the poller publishes the
    /// command response itself). Returns false when the poller is gone or
    /// its queue is full.
    pub fn dispatch(&self, outlet: u16, action: OutletAction) -> bool {
        self.tx
            .try_send(PollerRequest::Outlet {
                outlet,
                action,
                reply: None,
            })
            .is_ok()
    }

    /// Dispatch and wait for the transport result (web path). `None` means
    /// the poller is unavailable.
    pub async fn execute(&self, outlet: u16, action: OutletAction) -> Option<bool> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PollerRequest::Outlet {
                outlet,
                action,
                reply: Some(reply_tx),
            })
            .await
            .ok()?;
        reply_rx.await.ok()
    }

    pub async fn set_field(&self, field: DeviceField, value: String) -> Option<bool> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PollerRequest::SetField {
                field,
                value,
                reply: Some(reply_tx),
            })
            .await
            .ok()?;
        reply_rx.await.ok()
    }
}

// ---------------------------------------------------------------------------
// Outlet-name overrides
// ---------------------------------------------------------------------------

/// Device-local outlet name overrides, persisted as an object of
/// outlet-number string -> name. Applied to every snapshot before fan-out.
pub struct OutletNameStore {
    path: PathBuf,
    names: HashMap<u16, String>,
}

impl OutletNameStore {
    pub fn load(path: PathBuf) -> Self {
        let mut names = HashMap::new();
        if path.exists() {
            match std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|s| {
                    serde_json::from_str::<HashMap<u16, String>>(&s).map_err(Into::into)
                }) {
                Ok(loaded) => {
                    info!(count = loaded.len(), file = %path.display(), "loaded outlet name overrides");
                    names = loaded;
                }
                Err(e) => error!(file = %path.display(), "failed to load outlet names: {e:#}"),
            }
        }
        Self { path, names }
    }

    pub fn names(&self) -> &HashMap<u16, String> {
        &self.names
    }

    /// Set or (with `None`) delete an override and persist atomically.
    pub fn set(&mut self, outlet: u16, name: Option<String>) -> Result<()> {
        match name {
            Some(name) => {
                self.names.insert(outlet, name);
            }
            None => {
                self.names.remove(&outlet);
            }
        }
        self.save()
    }

    fn save(&self) -> Result<()> {
        let data = serde_json::to_string_pretty(&self.names)?;
        write_atomic(&self.path, &data)
    }

    pub fn apply(&self, snapshot: &mut Snapshot) {
        for (n, outlet) in snapshot.outlets.iter_mut() {
            if let Some(name) = self.names.get(n) {
                outlet.name = name.clone();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-device registration
// ---------------------------------------------------------------------------

struct CachedSnapshot {
    snapshot: Snapshot,
    received: Instant,
}

#[derive(Clone)]
pub struct DeviceHandles {
    pub engine: Arc<Mutex<RuleEngine>>,
    pub commander: CommandHandle,
    pub outlet_names: Arc<RwLock<OutletNameStore>>,
}

// ---------------------------------------------------------------------------
// Bridge state
// ---------------------------------------------------------------------------

pub struct BridgeState {
    started_at: Instant,
    pdus_file: PathBuf,
    poll_interval_ms: AtomicU64,
    configs: RwLock<Vec<PduConfig>>,
    snapshots: RwLock<HashMap<String, CachedSnapshot>>,
    devices: RwLock<HashMap<String, DeviceHandles>>,
}

impl BridgeState {
    pub fn new(configs: Vec<PduConfig>, pdus_file: PathBuf, poll_interval: f64) -> SharedState {
        Arc::new(Self {
            started_at: Instant::now(),
            pdus_file,
            poll_interval_ms: AtomicU64::new((poll_interval * 1000.0) as u64),
            configs: RwLock::new(configs),
            snapshots: RwLock::new(HashMap::new()),
            devices: RwLock::new(HashMap::new()),
        })
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    // -- Poll interval (runtime mutable through the web API) ----------------

    pub fn poll_interval(&self) -> f64 {
        self.poll_interval_ms.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn set_poll_interval(&self, seconds: f64) {
        self.poll_interval_ms
            .store((seconds * 1000.0) as u64, Ordering::Relaxed);
    }

    // -- Snapshot cache -----------------------------------------------------

    pub async fn update_snapshot(&self, device_id: &str, snapshot: Snapshot) {
        let mut cache = self.snapshots.write().await;
        cache.insert(
            device_id.to_string(),
            CachedSnapshot {
                snapshot,
                received: Instant::now(),
            },
        );
    }

    /// Latest snapshot and its age in seconds.
    pub async fn snapshot(&self, device_id: &str) -> Option<(Snapshot, f64)> {
        let cache = self.snapshots.read().await;
        cache.get(device_id).map(|c| {
            (
                c.snapshot.clone(),
                c.received.elapsed().as_secs_f64(),
            )
        })
    }

    pub async fn snapshot_age(&self, device_id: &str) -> Option<f64> {
        let cache = self.snapshots.read().await;
        cache.get(device_id).map(|c| c.received.elapsed().as_secs_f64())
    }

    // -- Config list --------------------------------------------------------

    pub async fn configs(&self) -> Vec<PduConfig> {
        self.configs.read().await.clone()
    }

    pub async fn registered_devices(&self) -> Vec<String> {
        self.configs
            .read()
            .await
            .iter()
            .map(|c| c.device_id.clone())
            .collect()
    }

    /// Mutate the config list under the lock and persist it atomically.
    /// Used by serial discovery, IP recovery, and the web CRUD endpoints.
    pub async fn update_configs<F, R>(&self, mutate: F) -> Result<R>
    where
        F: FnOnce(&mut Vec<PduConfig>) -> R,
    {
        let mut configs = self.configs.write().await;
        let result = mutate(&mut configs);
        save_pdu_configs(&configs, &self.pdus_file)?;
        Ok(result)
    }

    // -- Device registration -------------------------------------------------

    pub async fn register_device(&self, device_id: &str, handles: DeviceHandles) {
        self.devices
            .write()
            .await
            .insert(device_id.to_string(), handles);
        info!(device = device_id, "registered device");
    }

    /// Forget everything about a device: cache, rule engine, commander,
    /// outlet names. The config entry is removed separately.
    pub async fn unregister_device(&self, device_id: &str) {
        self.devices.write().await.remove(device_id);
        self.snapshots.write().await.remove(device_id);
        warn!(device = device_id, "unregistered device");
    }

    pub async fn device_handles(&self, device_id: &str) -> Option<DeviceHandles> {
        self.devices.read().await.get(device_id).cloned()
    }

    pub async fn engine_for(&self, device_id: &str) -> Option<Arc<Mutex<RuleEngine>>> {
        self.devices
            .read()
            .await
            .get(device_id)
            .map(|h| h.engine.clone())
    }

    pub async fn commander_for(&self, device_id: &str) -> Option<CommandHandle> {
        self.devices
            .read()
            .await
            .get(device_id)
            .map(|h| h.commander.clone())
    }

    // -- Device resolution ---------------------------------------------------

    /// Resolve the target device for a web request: an explicit
    /// `?device_id=` always wins; with exactly one registered PDU it is
    /// auto-selected; otherwise the request is ambiguous.
    pub async fn resolve_device_id(&self, query: Option<&str>) -> Option<String> {
        if let Some(id) = query {
            if !id.is_empty() {
                return Some(id.to_string());
            }
        }
        let configs = self.configs.read().await;
        if configs.len() == 1 {
            return Some(configs[0].device_id.clone());
        }
        None
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("pdu_state_{}_{}", std::process::id(), name))
    }

    fn state_with(configs: Vec<PduConfig>, name: &str) -> SharedState {
        BridgeState::new(configs, temp_path(name), 1.0)
    }

    // -- resolution ---------------------------------------------------------

    #[tokio::test]
    async fn explicit_device_id_wins() {
        let state = state_with(
            vec![PduConfig::new("p1", "h1"), PduConfig::new("p2", "h2")],
            "resolve1",
        );
        assert_eq!(
            state.resolve_device_id(Some("p2")).await,
            Some("p2".to_string())
        );
    }

    #[tokio::test]
    async fn single_device_auto_selected() {
        let state = state_with(vec![PduConfig::new("only", "h1")], "resolve2");
        assert_eq!(state.resolve_device_id(None).await, Some("only".to_string()));
    }

    #[tokio::test]
    async fn multiple_devices_without_param_is_ambiguous() {
        let state = state_with(
            vec![PduConfig::new("p1", "h1"), PduConfig::new("p2", "h2")],
            "resolve3",
        );
        assert_eq!(state.resolve_device_id(None).await, None);
        assert_eq!(state.resolve_device_id(Some("")).await, None);
    }

    // -- snapshot cache -----------------------------------------------------

    #[tokio::test]
    async fn snapshot_cache_tracks_age() {
        let state = state_with(vec![PduConfig::new("p1", "h1")], "cache");
        assert!(state.snapshot("p1").await.is_none());

        state.update_snapshot("p1", Snapshot::default()).await;
        let (_, age) = state.snapshot("p1").await.unwrap();
        assert!(age < 1.0);
    }

    // -- poll interval ------------------------------------------------------

    #[tokio::test]
    async fn poll_interval_round_trips() {
        let state = state_with(vec![], "interval");
        assert_eq!(state.poll_interval(), 1.0);
        state.set_poll_interval(2.5);
        assert_eq!(state.poll_interval(), 2.5);
    }

    // -- config persistence --------------------------------------------------

    #[tokio::test]
    async fn update_configs_persists_atomically() {
        let path = temp_path("persist");
        let _ = std::fs::remove_file(&path);
        let state = BridgeState::new(vec![PduConfig::new("p1", "10.0.0.5")], path.clone(), 1.0);

        state
            .update_configs(|configs| {
                configs[0].host = "10.0.0.9".to_string();
                configs[0].serial = "SN123".to_string();
            })
            .await
            .unwrap();

        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(on_disk.contains("10.0.0.9"));
        assert!(on_disk.contains("SN123"));
        let _ = std::fs::remove_file(&path);
    }

    // -- command handle -----------------------------------------------------

    #[tokio::test]
    async fn command_handle_round_trip() {
        let (handle, mut rx) = CommandHandle::channel(4);

        let server = tokio::spawn(async move {
            match rx.recv().await {
                Some(PollerRequest::Outlet {
                    outlet,
                    action,
                    reply,
                }) => {
                    assert_eq!(outlet, 5);
                    assert_eq!(action, OutletAction::On);
                    if let Some(reply) = reply {
                        let _ = reply.send(true);
                    }
                }
                _ => panic!("expected outlet request"),
            }
        });

        assert_eq!(handle.execute(5, OutletAction::On).await, Some(true));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn command_handle_execute_none_when_poller_gone() {
        let (handle, rx) = CommandHandle::channel(4);
        drop(rx);
        assert_eq!(handle.execute(1, OutletAction::Off).await, None);
        assert!(!handle.dispatch(1, OutletAction::Off));
    }

    // -- outlet names -------------------------------------------------------

    #[test]
    fn outlet_names_persist_and_apply() {
        let path = temp_path("names.json");
        let _ = std::fs::remove_file(&path);

        let mut store = OutletNameStore::load(path.clone());
        store.set(3, Some("NAS".to_string())).unwrap();
        store.set(4, Some("modem".to_string())).unwrap();
        store.set(4, None).unwrap();

        // Keys serialize as strings.
        let on_disk: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["3"], "NAS");
        assert!(on_disk.get("4").is_none());

        let reloaded = OutletNameStore::load(path.clone());
        assert_eq!(reloaded.names().get(&3).map(String::as_str), Some("NAS"));

        let mut snap = Snapshot::default();
        snap.outlets.insert(
            3,
            crate::model::OutletData {
                number: 3,
                name: "Outlet 3".into(),
                state: crate::model::OutletState::On,
                current: None,
                power: None,
                energy: None,
                bank_assignment: None,
                max_load: None,
            },
        );
        reloaded.apply(&mut snap);
        assert_eq!(snap.outlets[&3].name, "NAS");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn outlet_names_corrupt_file_starts_empty() {
        let path = temp_path("names_bad.json");
        std::fs::write(&path, "not json").unwrap();
        let store = OutletNameStore::load(path.clone());
        assert!(store.names().is_empty());
        let _ = std::fs::remove_file(&path);
    }
}
