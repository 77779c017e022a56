//! Per-device PDU configuration: load from `pdus.json` (with env-var
//! fallback for single-device setups), validate, and save atomically.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

fn default_snmp_port() -> u16 {
    161
}

fn default_community_read() -> String {
    "public".into()
}

fn default_community_write() -> String {
    "private".into()
}

fn default_enabled() -> bool {
    true
}

fn default_num_banks() -> u16 {
    2
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PduConfig {
    /// MQTT topic key; must not contain `/ # +` or spaces.
    pub device_id: String,
    pub host: String,
    #[serde(default = "default_snmp_port")]
    pub snmp_port: u16,
    #[serde(default = "default_community_read")]
    pub community_read: String,
    #[serde(default = "default_community_write")]
    pub community_write: String,
    #[serde(default)]
    pub label: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Default bank count; overridden by discovery at startup.
    #[serde(default = "default_num_banks")]
    pub num_banks: u16,
    /// Persisted on first identity discovery; a later mismatch aborts the
    /// poller.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub serial: String,
    /// Optional /24 override for DHCP-recovery scanning.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub recovery_subnet: String,
}

impl PduConfig {
    pub fn new(device_id: &str, host: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            host: host.to_string(),
            snmp_port: default_snmp_port(),
            community_read: default_community_read(),
            community_write: default_community_write(),
            label: String::new(),
            enabled: true,
            num_banks: default_num_banks(),
            serial: String::new(),
            recovery_subnet: String::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.device_id.is_empty() {
            anyhow::bail!("device_id must not be empty");
        }
        if self.device_id.contains(['/', '#', '+', ' ']) {
            anyhow::bail!(
                "device_id contains invalid MQTT characters: {:?}",
                self.device_id
            );
        }
        if self.host.is_empty() {
            anyhow::bail!("PDU {:?} has no host configured", self.device_id);
        }
        if self.snmp_port == 0 {
            anyhow::bail!("PDU {:?} snmp_port out of range: 0", self.device_id);
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PdusFile {
    #[serde(default)]
    pdus: Vec<PduConfig>,
}

// ---------------------------------------------------------------------------
// Atomic file write, shared by configs / rules / outlet names
// ---------------------------------------------------------------------------

/// Write `contents` to `path` via a `.tmp` sibling plus rename, so a crash
/// mid-write never leaves a truncated file behind.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
    }
    let tmp = path.with_extension("tmp");
    let result = std::fs::write(&tmp, contents)
        .with_context(|| format!("write {}", tmp.display()))
        .and_then(|_| {
            std::fs::rename(&tmp, path)
                .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))
        });
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

/// Load PDU configs. Priority:
/// 1. `pdus.json` if present and non-empty
/// 2. env-var fallback (single device)
/// 3. mock mode generates a simulated device entry
pub fn load_pdu_configs(
    pdus_file: &Path,
    env_host: &str,
    env_port: u16,
    env_community_read: &str,
    env_community_write: &str,
    env_device_id: &str,
    mock_mode: bool,
) -> Result<Vec<PduConfig>> {
    if pdus_file.exists() {
        match std::fs::read_to_string(pdus_file)
            .context("read pdus file")
            .and_then(|s| serde_json::from_str::<PdusFile>(&s).context("parse pdus file"))
        {
            Ok(parsed) => {
                let mut pdus = Vec::new();
                for pdu in parsed.pdus {
                    pdu.validate().with_context(|| {
                        format!("invalid PDU entry {:?}", pdu.device_id)
                    })?;
                    pdus.push(pdu);
                }
                if !pdus.is_empty() {
                    info!(count = pdus.len(), file = %pdus_file.display(), "loaded PDU configs");
                    return Ok(pdus);
                }
                warn!("pdus file exists but has no PDUs, falling back to env vars");
            }
            Err(e) => {
                warn!("failed to load {}: {e:#}; falling back to env vars", pdus_file.display());
            }
        }
    }

    if mock_mode {
        info!("mock mode, using simulated PDU config");
        let mut cfg = PduConfig::new(env_device_id, "127.0.0.1");
        cfg.label = "Mock PDU".into();
        return Ok(vec![cfg]);
    }

    if !env_host.is_empty() {
        let mut cfg = PduConfig::new(env_device_id, env_host);
        cfg.snmp_port = env_port;
        cfg.community_read = env_community_read.to_string();
        cfg.community_write = env_community_write.to_string();
        cfg.validate()?;
        info!(
            device = %cfg.device_id,
            host = %cfg.host,
            port = cfg.snmp_port,
            "using single PDU from env vars"
        );
        return Ok(vec![cfg]);
    }

    anyhow::bail!(
        "No PDU configuration found. Either create a pdus.json file, \
         set PDU_HOST, or enable BRIDGE_MOCK_MODE=true for testing."
    )
}

/// Save all PDU configs atomically.
pub fn save_pdu_configs(pdus: &[PduConfig], pdus_file: &Path) -> Result<()> {
    let data = serde_json::to_string_pretty(&PdusFile { pdus: pdus.to_vec() })
        .context("serialize pdu configs")?;
    write_atomic(pdus_file, &data)?;
    info!(count = pdus.len(), file = %pdus_file.display(), "saved PDU configs");
    Ok(())
}

/// Reject config lists where an enabled device_id appears more than once.
pub fn check_unique_device_ids(pdus: &[PduConfig]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for pdu in pdus.iter().filter(|p| p.enabled) {
        if !seen.insert(pdu.device_id.as_str()) {
            anyhow::bail!("duplicate device_id in PDU configs: {:?}", pdu.device_id);
        }
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("pdu_bridge_{}_{}", std::process::id(), name))
    }

    fn sample_configs() -> Vec<PduConfig> {
        let mut a = PduConfig::new("rack1-pdu", "10.0.0.5");
        a.label = "Rack 1".into();
        a.serial = "SN123".into();
        let mut b = PduConfig::new("rack2-pdu", "10.0.0.6");
        b.enabled = false;
        b.recovery_subnet = "10.0.0.0/24".into();
        vec![a, b]
    }

    // -- validation ---------------------------------------------------------

    #[test]
    fn validate_accepts_sane_config() {
        assert!(PduConfig::new("rack1-pdu", "10.0.0.5").validate().is_ok());
    }

    #[test]
    fn validate_rejects_mqtt_unsafe_chars() {
        for bad in ["a/b", "a#b", "a+b", "a b"] {
            assert!(PduConfig::new(bad, "10.0.0.5").validate().is_err());
        }
    }

    #[test]
    fn validate_rejects_empty_host() {
        assert!(PduConfig::new("p1", "").validate().is_err());
    }

    #[test]
    fn validate_rejects_port_zero() {
        let mut cfg = PduConfig::new("p1", "10.0.0.5");
        cfg.snmp_port = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unique_device_ids_checked_for_enabled_only() {
        let mut a = PduConfig::new("p1", "10.0.0.5");
        let mut b = PduConfig::new("p1", "10.0.0.6");
        assert!(check_unique_device_ids(&[a.clone(), b.clone()]).is_err());

        b.enabled = false;
        assert!(check_unique_device_ids(&[a.clone(), b.clone()]).is_ok());

        a.enabled = false;
        b.enabled = true;
        assert!(check_unique_device_ids(&[a, b]).is_ok());
    }

    // -- save / load round trip ---------------------------------------------

    #[test]
    fn save_then_load_round_trips() {
        let path = temp_path("roundtrip.json");
        let _ = std::fs::remove_file(&path);

        let pdus = sample_configs();
        save_pdu_configs(&pdus, &path).unwrap();

        let loaded =
            load_pdu_configs(&path, "", 161, "public", "private", "fallback", false).unwrap();
        assert_eq!(loaded, pdus);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn load_missing_file_uses_env_fallback() {
        let path = temp_path("missing.json");
        let _ = std::fs::remove_file(&path);

        let loaded =
            load_pdu_configs(&path, "192.168.1.10", 1161, "ro", "rw", "garage-pdu", false)
                .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].device_id, "garage-pdu");
        assert_eq!(loaded[0].host, "192.168.1.10");
        assert_eq!(loaded[0].snmp_port, 1161);
        assert_eq!(loaded[0].community_read, "ro");
    }

    #[test]
    fn load_no_file_no_env_mock_mode_generates_config() {
        let path = temp_path("mockmode.json");
        let _ = std::fs::remove_file(&path);

        let loaded = load_pdu_configs(&path, "", 161, "public", "private", "pdu44001", true)
            .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].label, "Mock PDU");
        assert_eq!(loaded[0].host, "127.0.0.1");
    }

    #[test]
    fn load_no_file_no_env_no_mock_is_error() {
        let path = temp_path("nothing.json");
        let _ = std::fs::remove_file(&path);
        assert!(load_pdu_configs(&path, "", 161, "public", "private", "p", false).is_err());
    }

    #[test]
    fn load_corrupt_file_falls_back_to_env() {
        let path = temp_path("corrupt.json");
        std::fs::write(&path, "{not json").unwrap();

        let loaded =
            load_pdu_configs(&path, "10.1.1.1", 161, "public", "private", "p1", false).unwrap();
        assert_eq!(loaded[0].host, "10.1.1.1");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn serial_omitted_when_empty() {
        let cfg = PduConfig::new("p1", "10.0.0.5");
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("serial"));
        assert!(!json.contains("recovery_subnet"));
    }

    #[test]
    fn from_dict_defaults_applied() {
        let cfg: PduConfig =
            serde_json::from_str(r#"{"device_id":"p1","host":"10.0.0.5"}"#).unwrap();
        assert_eq!(cfg.snmp_port, 161);
        assert_eq!(cfg.community_read, "public");
        assert_eq!(cfg.community_write, "private");
        assert!(cfg.enabled);
        assert_eq!(cfg.num_banks, 2);
        assert!(cfg.serial.is_empty());
    }

    // -- write_atomic -------------------------------------------------------

    #[test]
    fn write_atomic_leaves_no_tmp_file() {
        let path = temp_path("atomic.json");
        write_atomic(&path, "{\"ok\":true}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"ok\":true}");
        assert!(!path.with_extension("tmp").exists());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn write_atomic_replaces_existing_content() {
        let path = temp_path("atomic2.json");
        write_atomic(&path, "old").unwrap();
        write_atomic(&path, "new").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
        let _ = std::fs::remove_file(&path);
    }
}
