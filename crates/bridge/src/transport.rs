//! Transport contract for talking to a physical PDU.
//!
//! SNMP, serial-console, and mock back-ends all satisfy [`Transport`]; the
//! poller is transport-agnostic and serializes all access, so implementations
//! only need to be safe for single-task use. Failures must come back as
//! values, never panics: every failed operation increments the consecutive
//! failure counter that drives the poller's health state machine, and every
//! success zeroes it.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::model::{DeviceIdentity, OutletAction, Snapshot};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("target unreachable: {0}")]
    Unreachable(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("transport closed")]
    Closed,
}

/// Startup-only data queried once after identity discovery.
#[derive(Debug, Clone, Default)]
pub struct StartupData {
    /// Outlet number -> bank the outlet is fed from.
    pub bank_assignments: BTreeMap<u16, u16>,
    /// Outlet number -> max current rating in amps.
    pub max_loads: BTreeMap<u16, f64>,
}

/// Which writable device field a `set_device_field` call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceField {
    Name,
    Location,
}

impl DeviceField {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "name" | "device_name" => Some(DeviceField::Name),
            "location" | "sys_location" => Some(DeviceField::Location),
            _ => None,
        }
    }
}

#[async_trait]
pub trait Transport: Send {
    /// Establish the connection. Idempotent; connectionless transports may
    /// treat this as a no-op.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Query device identity. Called once at startup (and again after a
    /// successful IP recovery to re-verify the serial).
    async fn get_identity(&mut self) -> Result<DeviceIdentity, TransportError>;

    /// Detect the number of banks; may fall back to a configured default.
    async fn discover_num_banks(&mut self) -> Result<u16, TransportError>;

    /// Query startup-only data (bank assignments, max loads). May be empty.
    async fn query_startup_data(
        &mut self,
        outlet_count: u16,
    ) -> Result<StartupData, TransportError>;

    /// Poll the device and return one snapshot.
    async fn poll(&mut self) -> Result<Snapshot, TransportError>;

    /// Execute an outlet command. Returns `false` on failure or when the
    /// transport does not support the action.
    async fn command_outlet(&mut self, outlet: u16, action: OutletAction) -> bool;

    /// Set a writable device field. Returns `false` on failure.
    async fn set_device_field(&mut self, field: DeviceField, value: &str) -> bool;

    fn consecutive_failures(&self) -> u32;

    fn reset_health(&mut self);

    fn get_health(&self) -> serde_json::Value;

    /// Point the transport at a new host (and optionally port) after a
    /// DHCP-recovery scan relocated the device.
    fn update_target(&mut self, host: &str, port: Option<u16>);

    fn close(&mut self);
}

// ---------------------------------------------------------------------------
// Shared health bookkeeping for transport implementations
// ---------------------------------------------------------------------------

/// Failure counters every transport carries. A success zeroes the
/// consecutive counter; a failure bumps it and records the error string.
#[derive(Debug, Default, Clone)]
pub struct TransportHealth {
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_requests: u64,
    pub last_error: Option<String>,
    pub last_success_ts: Option<i64>,
}

impl TransportHealth {
    pub fn record_success(&mut self) {
        self.total_requests += 1;
        self.consecutive_failures = 0;
        self.last_success_ts = Some(Utc::now().timestamp());
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.total_requests += 1;
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.last_error = Some(error.into());
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.last_error = None;
    }

    pub fn as_json(&self) -> serde_json::Value {
        json!({
            "consecutive_failures": self.consecutive_failures,
            "total_failures": self.total_failures,
            "total_requests": self.total_requests,
            "last_error": self.last_error,
            "last_success_ts": self.last_success_ts,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_success_zeroes_consecutive() {
        let mut h = TransportHealth::default();
        h.record_failure("timeout");
        h.record_failure("timeout");
        assert_eq!(h.consecutive_failures, 2);

        h.record_success();
        assert_eq!(h.consecutive_failures, 0);
        assert_eq!(h.total_failures, 2);
        assert_eq!(h.total_requests, 3);
    }

    #[test]
    fn health_failure_records_last_error() {
        let mut h = TransportHealth::default();
        h.record_failure("no route to host");
        assert_eq!(h.last_error.as_deref(), Some("no route to host"));
    }

    #[test]
    fn health_reset_clears_streak_only() {
        let mut h = TransportHealth::default();
        h.record_failure("x");
        h.reset();
        assert_eq!(h.consecutive_failures, 0);
        assert_eq!(h.total_failures, 1);
        assert!(h.last_error.is_none());
    }

    #[test]
    fn health_json_has_expected_fields() {
        let h = TransportHealth::default();
        let v = h.as_json();
        assert!(v["consecutive_failures"].is_u64());
        assert!(v["total_requests"].is_u64());
    }

    #[test]
    fn device_field_parse() {
        assert_eq!(DeviceField::parse("name"), Some(DeviceField::Name));
        assert_eq!(DeviceField::parse("sys_location"), Some(DeviceField::Location));
        assert_eq!(DeviceField::parse("bogus"), None);
    }
}
