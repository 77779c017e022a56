//! Data model for polled PDU snapshots: identity, outlets, banks, ATS
//! sources, and environmental sensors. A [`Snapshot`] is the immutable result
//! of one transport poll; it is serialized into MQTT payloads, history rows,
//! and web responses.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Outlet / bank / source state enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutletState {
    On,
    Off,
    Unknown,
}

impl OutletState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutletState::On => "on",
            OutletState::Off => "off",
            OutletState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for OutletState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bank load thresholds as reported by the PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoadState {
    Normal,
    Low,
    NearOverload,
    Overload,
    Unknown,
}

impl LoadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadState::Normal => "normal",
            LoadState::Low => "low",
            LoadState::NearOverload => "nearOverload",
            LoadState::Overload => "overload",
            LoadState::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VoltageStatus {
    Normal,
    OverVoltage,
    UnderVoltage,
    Unknown,
}

impl VoltageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoltageStatus::Normal => "normal",
            VoltageStatus::OverVoltage => "overVoltage",
            VoltageStatus::UnderVoltage => "underVoltage",
            VoltageStatus::Unknown => "unknown",
        }
    }
}

/// Human label for an ATS source number (1=A, 2=B).
pub fn ats_source_label(source: Option<u8>) -> &'static str {
    match source {
        Some(1) => "A",
        Some(2) => "B",
        _ => "?",
    }
}

// ---------------------------------------------------------------------------
// Outlet commands
// ---------------------------------------------------------------------------

/// Commands a transport may accept for an outlet. `on`/`off`/`reboot` are
/// universal; the delayed variants exist only on transports that support
/// them (`Transport::command_outlet` returns `false` otherwise).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutletAction {
    On,
    Off,
    Reboot,
    DelayOn,
    DelayOff,
    Cancel,
}

impl OutletAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "on" => Some(OutletAction::On),
            "off" => Some(OutletAction::Off),
            "reboot" => Some(OutletAction::Reboot),
            "delayon" => Some(OutletAction::DelayOn),
            "delayoff" => Some(OutletAction::DelayOff),
            "cancel" => Some(OutletAction::Cancel),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutletAction::On => "on",
            OutletAction::Off => "off",
            OutletAction::Reboot => "reboot",
            OutletAction::DelayOn => "delayon",
            OutletAction::DelayOff => "delayoff",
            OutletAction::Cancel => "cancel",
        }
    }

    /// The restore counterpart for automation rules (`on` <-> `off`).
    pub fn inverse(&self) -> OutletAction {
        match self {
            OutletAction::On => OutletAction::Off,
            _ => OutletAction::On,
        }
    }
}

impl fmt::Display for OutletAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Device identity queried once at startup. The hardware serial is the
/// primary unique key across the fleet: DHCP recovery relocates a device by
/// it and a mismatch against the saved serial aborts the poller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    #[serde(default)]
    pub serial: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub firmware_main: String,
    #[serde(default)]
    pub firmware_secondary: String,
    #[serde(default)]
    pub hardware_rev: u32,
    #[serde(default)]
    pub max_current: f64,
    #[serde(default)]
    pub outlet_count: u16,
    #[serde(default)]
    pub phase_count: u16,
    #[serde(default)]
    pub mac_address: String,
    /// Hundredths of seconds since device boot (MIB-II sysUpTime).
    #[serde(default)]
    pub sys_uptime: i64,
}

// ---------------------------------------------------------------------------
// Snapshot components
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutletData {
    pub number: u16,
    #[serde(default)]
    pub name: String,
    pub state: OutletState,
    pub current: Option<f64>,
    pub power: Option<f64>,
    pub energy: Option<f64>,
    pub bank_assignment: Option<u16>,
    pub max_load: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankData {
    pub number: u16,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub power: Option<f64>,
    pub apparent_power: Option<f64>,
    pub power_factor: Option<f64>,
    pub load_state: LoadState,
    pub energy: Option<f64>,
    #[serde(default)]
    pub last_update: String,
}

/// Per-input source readings from the ATS source-status table. On ATS models
/// the bank voltage stays at mains level after a transfer; only these values
/// reflect the health of each input feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceData {
    pub voltage: Option<f64>,
    pub frequency: Option<f64>,
    pub voltage_status: VoltageStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemperatureUnit {
    C,
    F,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentData {
    pub temperature: Option<f64>,
    pub temperature_unit: TemperatureUnit,
    pub humidity: Option<f64>,
    /// Dry-contact closures keyed 1..=4, true = closed.
    #[serde(default)]
    pub contacts: BTreeMap<u8, bool>,
    pub sensor_present: bool,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// One complete poll result. Immutable once produced; cached by the web
/// layer, serialized into history rows and MQTT topics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub outlet_count: u16,
    #[serde(default)]
    pub phase_count: u16,
    pub input_voltage: Option<f64>,
    pub input_frequency: Option<f64>,
    #[serde(default)]
    pub outlets: BTreeMap<u16, OutletData>,
    #[serde(default)]
    pub banks: BTreeMap<u16, BankData>,
    pub ats_preferred_source: Option<u8>,
    pub ats_current_source: Option<u8>,
    #[serde(default = "default_true")]
    pub ats_auto_transfer: bool,
    pub source_a: Option<SourceData>,
    pub source_b: Option<SourceData>,
    pub redundancy_ok: Option<bool>,
    pub environment: Option<EnvironmentData>,
    pub identity: Option<DeviceIdentity>,
}

fn default_true() -> bool {
    true
}

impl Snapshot {
    /// Sum of bank active power, skipping unreported banks.
    pub fn total_power(&self) -> f64 {
        self.banks.values().filter_map(|b| b.power).sum()
    }

    pub fn active_outlets(&self) -> usize {
        self.outlets
            .values()
            .filter(|o| o.state == OutletState::On)
            .count()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
