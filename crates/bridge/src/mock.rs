//! Simulated ATS PDU for development and tests.
//!
//! Generates realistic-looking metering data: slow mains voltage drift,
//! per-bank failure injection, automatic transfer to the surviving input,
//! and outlet reboot timers. Outlet and bank counts are configurable to
//! mimic different members of the product family.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{error, info};

use crate::model::{
    BankData, DeviceIdentity, LoadState, OutletAction, OutletData, OutletState, Snapshot,
    SourceData, VoltageStatus,
};
use crate::transport::{DeviceField, StartupData, Transport, TransportError, TransportHealth};

/// How long a rebooting outlet stays off before coming back.
const REBOOT_OFF_DURATION: Duration = Duration::from_secs(5);

pub struct MockPdu {
    num_outlets: u16,
    num_banks: u16,
    outlet_states: HashMap<u16, OutletState>,
    outlet_names: HashMap<u16, String>,
    reboot_until: HashMap<u16, Instant>,
    failed_banks: HashSet<u16>,
    active_input: u16,
    started_at: Instant,
    identity: DeviceIdentity,
    device_name_override: Option<String>,
    location: String,
    health: TransportHealth,
}

impl MockPdu {
    pub fn new(num_outlets: u16, num_banks: u16, model: &str) -> Self {
        let mut outlet_states = HashMap::new();
        let mut outlet_names = HashMap::new();
        for n in 1..=num_outlets {
            outlet_states.insert(n, OutletState::On);
            outlet_names.insert(n, format!("Outlet {n}"));
        }

        let serial = format!("MOCK{:06}", fastrand::u32(100_000..1_000_000));
        let identity = DeviceIdentity {
            serial,
            model: model.to_string(),
            name: format!("CyberPower {model} (Mock)"),
            firmware_main: "1.2".into(),
            firmware_secondary: "1.3.4".into(),
            hardware_rev: 12,
            max_current: 12.0,
            outlet_count: num_outlets,
            phase_count: 1,
            mac_address: String::new(),
            sys_uptime: 0,
        };

        Self {
            num_outlets,
            num_banks,
            outlet_states,
            outlet_names,
            reboot_until: HashMap::new(),
            failed_banks: HashSet::new(),
            active_input: 1,
            started_at: Instant::now(),
            identity,
            device_name_override: None,
            location: "Rack 1, Row A".into(),
            health: TransportHealth::default(),
        }
    }

    /// Pin the serial to a known value (tests).
    pub fn with_serial(mut self, serial: &str) -> Self {
        self.identity.serial = serial.to_string();
        self
    }

    /// Simulate a power failure on the given input bank.
    pub fn simulate_input_failure(&mut self, bank: u16) {
        if (1..=self.num_banks).contains(&bank) {
            self.failed_banks.insert(bank);
            info!(bank, "mock: simulated power failure");
        }
    }

    /// Restore power on the given input bank.
    pub fn simulate_input_restore(&mut self, bank: u16) {
        self.failed_banks.remove(&bank);
        info!(bank, "mock: simulated power restore");
    }

    fn bank_voltage(&self, bank: u16, base: f64) -> f64 {
        if self.failed_banks.contains(&bank) {
            0.0
        } else {
            base + (fastrand::f64() - 0.5) * 0.6
        }
    }
}

#[async_trait]
impl Transport for MockPdu {
    async fn connect(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn get_identity(&mut self) -> Result<DeviceIdentity, TransportError> {
        self.health.record_success();
        Ok(self.identity.clone())
    }

    async fn discover_num_banks(&mut self) -> Result<u16, TransportError> {
        Ok(self.num_banks)
    }

    async fn query_startup_data(
        &mut self,
        outlet_count: u16,
    ) -> Result<StartupData, TransportError> {
        let mut data = StartupData::default();
        for n in 1..=outlet_count {
            data.bank_assignments
                .insert(n, ((n - 1) % self.num_banks) + 1);
            data.max_loads.insert(n, 12.0);
        }
        Ok(data)
    }

    async fn poll(&mut self) -> Result<Snapshot, TransportError> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.started_at).as_secs_f64();

        self.identity.sys_uptime = (elapsed * 100.0) as i64;

        // Rebooting outlets come back on once their timer expires.
        let done: Vec<u16> = self
            .reboot_until
            .iter()
            .filter(|(_, until)| now >= **until)
            .map(|(n, _)| *n)
            .collect();
        for n in done {
            self.outlet_states.insert(n, OutletState::On);
            self.reboot_until.remove(&n);
            info!(outlet = n, "mock: outlet reboot complete, now on");
        }

        // Slow utility-mains drift.
        let base_voltage = 120.0 + 2.0 * (elapsed / 60.0).sin();
        let frequency = 60.0 + 0.02 * (elapsed / 30.0).sin();

        let mut bank_voltages: BTreeMap<u16, f64> = BTreeMap::new();
        for idx in 1..=self.num_banks {
            bank_voltages.insert(idx, self.bank_voltage(idx, base_voltage));
        }

        // ATS: transfer off a failed active input to any surviving one.
        if self.failed_banks.contains(&self.active_input) {
            if let Some(other) =
                (1..=self.num_banks).find(|b| *b != self.active_input && !self.failed_banks.contains(b))
            {
                self.active_input = other;
                info!(input = other, "mock: ats transferred");
            }
        }

        let mut outlets: BTreeMap<u16, OutletData> = BTreeMap::new();
        let mut on_count = 0u32;
        for n in 1..=self.num_outlets {
            let state = *self.outlet_states.get(&n).unwrap_or(&OutletState::Unknown);
            if state == OutletState::On {
                on_count += 1;
            }
            outlets.insert(
                n,
                OutletData {
                    number: n,
                    name: self.outlet_names.get(&n).cloned().unwrap_or_default(),
                    state,
                    current: None,
                    power: None,
                    energy: None,
                    bank_assignment: Some(((n - 1) % self.num_banks) + 1),
                    max_load: Some(12.0),
                },
            );
        }

        let total_current = on_count as f64 * 0.003 + fastrand::f64() * 0.01;

        let mut banks: BTreeMap<u16, BankData> = BTreeMap::new();
        for idx in 1..=self.num_banks {
            let voltage = bank_voltages[&idx];
            let is_active = idx == self.active_input;

            let (current, power, apparent, pf, load_state) = if is_active && voltage > 10.0 {
                let current = (total_current * 100.0).round() / 100.0;
                let power = (current * voltage * 10.0).round() / 10.0;
                let pf = if current > 0.01 { 0.98 } else { 1.0 };
                (current, power, power, pf, LoadState::Normal)
            } else {
                let load = if voltage > 10.0 {
                    LoadState::Normal
                } else {
                    LoadState::Low
                };
                (0.0, 0.0, 0.0, 1.0, load)
            };

            banks.insert(
                idx,
                BankData {
                    number: idx,
                    voltage: Some((voltage * 10.0).round() / 10.0),
                    current: Some(current),
                    power: Some(power),
                    apparent_power: Some(apparent),
                    power_factor: Some(pf),
                    load_state,
                    energy: if power > 0.0 {
                        Some(elapsed * power / 3600.0 / 1000.0)
                    } else {
                        None
                    },
                    last_update: String::new(),
                },
            );
        }

        let source = |bank: u16| -> SourceData {
            let failed = self.failed_banks.contains(&bank);
            SourceData {
                voltage: Some((bank_voltages.get(&bank).copied().unwrap_or(0.0) * 10.0).round() / 10.0),
                frequency: Some(if failed { 0.0 } else { (frequency * 10.0).round() / 10.0 }),
                voltage_status: if failed {
                    VoltageStatus::UnderVoltage
                } else {
                    VoltageStatus::Normal
                },
            }
        };

        let source_a = Some(source(1));
        let source_b = if self.num_banks >= 2 { Some(source(2)) } else { None };
        let both_ok = (1..=self.num_banks).all(|b| !self.failed_banks.contains(&b));

        self.health.record_success();

        Ok(Snapshot {
            device_name: self
                .device_name_override
                .clone()
                .unwrap_or_else(|| self.identity.name.clone()),
            outlet_count: self.num_outlets,
            phase_count: 1,
            input_voltage: Some(
                (bank_voltages.get(&self.active_input).copied().unwrap_or(0.0) * 10.0).round()
                    / 10.0,
            ),
            input_frequency: Some((frequency * 10.0).round() / 10.0),
            outlets,
            banks,
            ats_preferred_source: Some(1),
            ats_current_source: Some(self.active_input as u8),
            ats_auto_transfer: true,
            source_a,
            source_b,
            redundancy_ok: Some(both_ok),
            environment: None,
            identity: Some(self.identity.clone()),
        })
    }

    async fn command_outlet(&mut self, outlet: u16, action: OutletAction) -> bool {
        if outlet < 1 || outlet > self.num_outlets {
            error!(outlet, "mock: invalid outlet");
            return false;
        }

        match action {
            OutletAction::On => {
                self.outlet_states.insert(outlet, OutletState::On);
                info!(outlet, "mock: outlet -> on");
            }
            OutletAction::Off => {
                self.outlet_states.insert(outlet, OutletState::Off);
                info!(outlet, "mock: outlet -> off");
            }
            OutletAction::Reboot => {
                self.outlet_states.insert(outlet, OutletState::Off);
                self.reboot_until
                    .insert(outlet, Instant::now() + REBOOT_OFF_DURATION);
                info!(outlet, "mock: outlet -> reboot (off for 5s)");
            }
            // Delayed commands are a serial-console feature.
            OutletAction::DelayOn | OutletAction::DelayOff | OutletAction::Cancel => {
                error!(outlet, action = %action, "mock: unsupported command");
                return false;
            }
        }

        true
    }

    async fn set_device_field(&mut self, field: DeviceField, value: &str) -> bool {
        match field {
            DeviceField::Name => {
                self.device_name_override = Some(value.to_string());
                self.identity.name = value.to_string();
            }
            DeviceField::Location => self.location = value.to_string(),
        }
        true
    }

    fn consecutive_failures(&self) -> u32 {
        self.health.consecutive_failures
    }

    fn reset_health(&mut self) {
        self.health.reset();
    }

    fn get_health(&self) -> serde_json::Value {
        self.health.as_json()
    }

    fn update_target(&mut self, _host: &str, _port: Option<u16>) {}

    fn close(&mut self) {}
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn poll_reports_all_outlets_and_banks() {
        let mut pdu = MockPdu::new(10, 2, "PDU44001");
        let snap = pdu.poll().await.unwrap();
        assert_eq!(snap.outlets.len(), 10);
        assert_eq!(snap.banks.len(), 2);
        assert_eq!(snap.outlet_count, 10);
        assert_eq!(snap.ats_current_source, Some(1));
        assert_eq!(snap.redundancy_ok, Some(true));
    }

    #[tokio::test]
    async fn outlets_start_on() {
        let mut pdu = MockPdu::new(4, 2, "PDU44001");
        let snap = pdu.poll().await.unwrap();
        assert!(snap.outlets.values().all(|o| o.state == OutletState::On));
    }

    #[tokio::test]
    async fn input_failure_drops_source_voltage_and_transfers() {
        let mut pdu = MockPdu::new(4, 2, "PDU44001");
        pdu.simulate_input_failure(1);
        let snap = pdu.poll().await.unwrap();

        let a = snap.source_a.as_ref().unwrap();
        assert_eq!(a.voltage, Some(0.0));
        assert_eq!(a.voltage_status, VoltageStatus::UnderVoltage);

        // ATS moved to the surviving input.
        assert_eq!(snap.ats_current_source, Some(2));
        assert_eq!(snap.redundancy_ok, Some(false));

        let b = snap.source_b.as_ref().unwrap();
        assert!(b.voltage.unwrap() > 100.0);
    }

    #[tokio::test]
    async fn input_restore_clears_failure() {
        let mut pdu = MockPdu::new(4, 2, "PDU44001");
        pdu.simulate_input_failure(1);
        pdu.poll().await.unwrap();
        pdu.simulate_input_restore(1);
        let snap = pdu.poll().await.unwrap();
        assert_eq!(snap.redundancy_ok, Some(true));
        // ATS does not transfer back on its own.
        assert_eq!(snap.ats_current_source, Some(2));
    }

    #[tokio::test]
    async fn command_off_and_on() {
        let mut pdu = MockPdu::new(4, 2, "PDU44001");
        assert!(pdu.command_outlet(3, OutletAction::Off).await);
        let snap = pdu.poll().await.unwrap();
        assert_eq!(snap.outlets[&3].state, OutletState::Off);

        assert!(pdu.command_outlet(3, OutletAction::On).await);
        let snap = pdu.poll().await.unwrap();
        assert_eq!(snap.outlets[&3].state, OutletState::On);
    }

    #[tokio::test]
    async fn command_invalid_outlet_fails() {
        let mut pdu = MockPdu::new(4, 2, "PDU44001");
        assert!(!pdu.command_outlet(0, OutletAction::On).await);
        assert!(!pdu.command_outlet(5, OutletAction::On).await);
    }

    #[tokio::test]
    async fn delayed_commands_unsupported() {
        let mut pdu = MockPdu::new(4, 2, "PDU44001");
        assert!(!pdu.command_outlet(1, OutletAction::DelayOn).await);
        assert!(!pdu.command_outlet(1, OutletAction::Cancel).await);
    }

    #[tokio::test]
    async fn reboot_turns_outlet_off_until_timer() {
        let mut pdu = MockPdu::new(4, 2, "PDU44001");
        assert!(pdu.command_outlet(2, OutletAction::Reboot).await);
        let snap = pdu.poll().await.unwrap();
        assert_eq!(snap.outlets[&2].state, OutletState::Off);

        // Force the timer to expire rather than sleeping 5s.
        pdu.reboot_until
            .insert(2, Instant::now() - Duration::from_secs(1));
        let snap = pdu.poll().await.unwrap();
        assert_eq!(snap.outlets[&2].state, OutletState::On);
    }

    #[tokio::test]
    async fn identity_is_stable_across_polls() {
        let mut pdu = MockPdu::new(4, 2, "PDU44001");
        let id1 = pdu.get_identity().await.unwrap();
        pdu.poll().await.unwrap();
        let id2 = pdu.get_identity().await.unwrap();
        assert_eq!(id1.serial, id2.serial);
        assert!(id1.serial.starts_with("MOCK"));
    }

    #[tokio::test]
    async fn with_serial_pins_identity() {
        let mut pdu = MockPdu::new(4, 2, "PDU44001").with_serial("SN123");
        assert_eq!(pdu.get_identity().await.unwrap().serial, "SN123");
    }

    #[tokio::test]
    async fn startup_data_assigns_outlets_round_robin() {
        let mut pdu = MockPdu::new(4, 2, "PDU44001");
        let data = pdu.query_startup_data(4).await.unwrap();
        assert_eq!(data.bank_assignments[&1], 1);
        assert_eq!(data.bank_assignments[&2], 2);
        assert_eq!(data.bank_assignments[&3], 1);
        assert_eq!(data.max_loads[&1], 12.0);
    }

    #[tokio::test]
    async fn set_device_field_updates_name() {
        let mut pdu = MockPdu::new(4, 2, "PDU44001");
        assert!(pdu.set_device_field(DeviceField::Name, "lab-pdu").await);
        let snap = pdu.poll().await.unwrap();
        assert_eq!(snap.device_name, "lab-pdu");
    }

    #[tokio::test]
    async fn poll_success_keeps_failures_at_zero() {
        let mut pdu = MockPdu::new(4, 2, "PDU44001");
        pdu.poll().await.unwrap();
        assert_eq!(pdu.consecutive_failures(), 0);
    }
}
