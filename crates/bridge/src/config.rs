//! Bridge configuration from environment variables, validated at startup.
//! Out-of-range or unparseable values fail fast with a specific diagnostic
//! and exit code 1.

use std::env;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key}={value:?} is not a valid integer")]
    NotAnInteger { key: &'static str, value: String },
    #[error("{key}={value:?} is not a valid number")]
    NotANumber { key: &'static str, value: String },
    #[error("{key}={value} out of range [{min}, {max}]")]
    IntOutOfRange {
        key: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("{key}={value} out of range [{min}, {max}]")]
    FloatOutOfRange {
        key: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("PDU_DEVICE_ID contains invalid characters: {0:?}")]
    InvalidDeviceId(String),
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub pdu_host: String,
    pub pdu_snmp_port: u16,
    pub pdu_community_read: String,
    pub pdu_community_write: String,
    pub device_id: String,

    pub mqtt_broker: String,
    pub mqtt_port: u16,
    pub mqtt_username: String,
    pub mqtt_password: String,

    pub poll_interval: f64,
    pub mock_mode: bool,
    pub log_level: String,
    pub snmp_timeout: f64,
    pub snmp_retries: u32,

    pub rules_file: PathBuf,
    pub web_port: u16,

    pub history_db: PathBuf,
    pub history_retention_days: u32,
    pub house_monthly_kwh: f64,
    pub outlet_names_file: PathBuf,

    pub pdus_file: PathBuf,
    pub recovery_enabled: bool,
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let device_id = env::var("PDU_DEVICE_ID").unwrap_or_else(|_| "pdu44001".into());
        if device_id.contains(['/', '#', '+', ' ']) {
            return Err(ConfigError::InvalidDeviceId(device_id));
        }

        let config = Self {
            pdu_host: env::var("PDU_HOST").unwrap_or_default(),
            pdu_snmp_port: int_in_range("PDU_SNMP_PORT", &env_or("PDU_SNMP_PORT", "161"), 1, 65535)?
                as u16,
            pdu_community_read: env_or("PDU_COMMUNITY_READ", "public"),
            pdu_community_write: env_or("PDU_COMMUNITY_WRITE", "private"),
            device_id,

            mqtt_broker: env_or("MQTT_BROKER", "mosquitto"),
            mqtt_port: int_in_range("MQTT_PORT", &env_or("MQTT_PORT", "1883"), 1, 65535)? as u16,
            mqtt_username: env::var("MQTT_USERNAME").unwrap_or_default(),
            mqtt_password: env::var("MQTT_PASSWORD").unwrap_or_default(),

            poll_interval: float_in_range(
                "BRIDGE_POLL_INTERVAL",
                &env_or("BRIDGE_POLL_INTERVAL", "1.0"),
                0.1,
                300.0,
            )?,
            mock_mode: env_bool("BRIDGE_MOCK_MODE", false),
            log_level: env_or("BRIDGE_LOG_LEVEL", "info"),
            snmp_timeout: float_in_range(
                "BRIDGE_SNMP_TIMEOUT",
                &env_or("BRIDGE_SNMP_TIMEOUT", "2.0"),
                0.5,
                30.0,
            )?,
            snmp_retries: int_in_range(
                "BRIDGE_SNMP_RETRIES",
                &env_or("BRIDGE_SNMP_RETRIES", "1"),
                0,
                5,
            )? as u32,

            rules_file: env_or("BRIDGE_RULES_FILE", "/data/rules.json").into(),
            web_port: int_in_range("BRIDGE_WEB_PORT", &env_or("BRIDGE_WEB_PORT", "8080"), 1, 65535)?
                as u16,

            history_db: env_or("BRIDGE_HISTORY_DB", "/data/history.db").into(),
            history_retention_days: int_in_range(
                "HISTORY_RETENTION_DAYS",
                &env_or("HISTORY_RETENTION_DAYS", "60"),
                1,
                365,
            )? as u32,
            house_monthly_kwh: float_in_range(
                "HOUSE_MONTHLY_KWH",
                &env_or("HOUSE_MONTHLY_KWH", "0"),
                0.0,
                100_000.0,
            )?,
            outlet_names_file: env_or("BRIDGE_OUTLET_NAMES_FILE", "/data/outlet_names.json").into(),

            pdus_file: env_or("BRIDGE_PDUS_FILE", "/data/pdus.json").into(),
            recovery_enabled: env_bool("BRIDGE_RECOVERY_ENABLED", true),
        };

        config.log_summary();
        Ok(config)
    }

    fn log_summary(&self) {
        info!(
            pdu = %format!("{}:{}", self.pdu_host, self.pdu_snmp_port),
            mock = self.mock_mode,
            poll_interval = self.poll_interval,
            mqtt = %format!("{}:{}", self.mqtt_broker, self.mqtt_port),
            retention_days = self.history_retention_days,
            "configuration loaded"
        );
    }

    /// Per-device rules file. A single-device setup keeps the legacy
    /// `BRIDGE_RULES_FILE` path unchanged; multi-device setups get
    /// `rules_<device_id>.json` next to it.
    pub fn rules_file_for(&self, device_id: &str, single_pdu: bool) -> PathBuf {
        if single_pdu {
            self.rules_file.clone()
        } else {
            sibling(&self.rules_file, &format!("rules_{device_id}.json"))
        }
    }

    /// Per-device outlet-name overrides file, same convention as rules.
    pub fn outlet_names_file_for(&self, device_id: &str, single_pdu: bool) -> PathBuf {
        if single_pdu {
            self.outlet_names_file.clone()
        } else {
            sibling(&self.outlet_names_file, &format!("outlet_names_{device_id}.json"))
        }
    }
}

fn sibling(path: &std::path::Path, file_name: &str) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(file_name),
        _ => PathBuf::from(file_name),
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

fn int_in_range(key: &'static str, raw: &str, min: i64, max: i64) -> Result<i64, ConfigError> {
    let value: i64 = raw.trim().parse().map_err(|_| ConfigError::NotAnInteger {
        key,
        value: raw.to_string(),
    })?;
    if value < min || value > max {
        return Err(ConfigError::IntOutOfRange { key, value, min, max });
    }
    Ok(value)
}

fn float_in_range(key: &'static str, raw: &str, min: f64, max: f64) -> Result<f64, ConfigError> {
    let value: f64 = raw.trim().parse().map_err(|_| ConfigError::NotANumber {
        key,
        value: raw.to_string(),
    })?;
    if !(min..=max).contains(&value) {
        return Err(ConfigError::FloatOutOfRange { key, value, min, max });
    }
    Ok(value)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // Validation helpers are tested directly instead of mutating process
    // env vars, which races across the parallel test harness.

    #[test]
    fn int_in_range_accepts_bounds() {
        assert_eq!(int_in_range("K", "1", 1, 65535).unwrap(), 1);
        assert_eq!(int_in_range("K", "65535", 1, 65535).unwrap(), 65535);
    }

    #[test]
    fn int_in_range_rejects_out_of_range() {
        assert!(int_in_range("K", "0", 1, 65535).is_err());
        assert!(int_in_range("K", "65536", 1, 65535).is_err());
    }

    #[test]
    fn int_in_range_rejects_garbage() {
        let err = int_in_range("K", "abc", 1, 10).unwrap_err();
        assert!(err.to_string().contains("not a valid integer"));
    }

    #[test]
    fn float_in_range_accepts_poll_interval_bounds() {
        assert_eq!(float_in_range("K", "0.1", 0.1, 300.0).unwrap(), 0.1);
        assert_eq!(float_in_range("K", "300", 0.1, 300.0).unwrap(), 300.0);
    }

    #[test]
    fn float_in_range_rejects_below_min() {
        assert!(float_in_range("K", "0.05", 0.1, 300.0).is_err());
    }

    #[test]
    fn float_in_range_error_names_the_key() {
        let err = float_in_range("BRIDGE_SNMP_TIMEOUT", "99", 0.5, 30.0).unwrap_err();
        assert!(err.to_string().contains("BRIDGE_SNMP_TIMEOUT"));
    }

    #[test]
    fn rules_file_per_device() {
        let mut cfg = test_config();
        cfg.rules_file = "/data/rules.json".into();
        assert_eq!(cfg.rules_file_for("p1", true), PathBuf::from("/data/rules.json"));
        assert_eq!(
            cfg.rules_file_for("p1", false),
            PathBuf::from("/data/rules_p1.json")
        );
    }

    #[test]
    fn outlet_names_file_per_device() {
        let cfg = test_config();
        assert_eq!(
            cfg.outlet_names_file_for("rack2", false),
            PathBuf::from("/data/outlet_names_rack2.json")
        );
    }

    fn test_config() -> BridgeConfig {
        BridgeConfig {
            pdu_host: String::new(),
            pdu_snmp_port: 161,
            pdu_community_read: "public".into(),
            pdu_community_write: "private".into(),
            device_id: "pdu44001".into(),
            mqtt_broker: "localhost".into(),
            mqtt_port: 1883,
            mqtt_username: String::new(),
            mqtt_password: String::new(),
            poll_interval: 1.0,
            mock_mode: true,
            log_level: "info".into(),
            snmp_timeout: 2.0,
            snmp_retries: 1,
            rules_file: "/data/rules.json".into(),
            web_port: 8080,
            history_db: "/data/history.db".into(),
            history_retention_days: 60,
            house_monthly_kwh: 0.0,
            outlet_names_file: "/data/outlet_names.json".into(),
            pdus_file: "/data/pdus.json".into(),
            recovery_enabled: true,
        }
    }
}
