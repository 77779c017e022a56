//! Automation engine: declarative input-failure outlet control rules.
//!
//! Rules persist as a JSON array, one file per device. Evaluation runs once
//! per snapshot with hysteresis: a condition must hold for `delay` seconds
//! before the rule fires, and a fired rule with `restore` set issues the
//! inverse action once the condition clears. At most one command per rule is
//! in flight: rules are evaluated in insertion order and each command
//! completes before the next rule is considered.

use async_trait::async_trait;
use chrono::{Local, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::model::{OutletAction, Snapshot};
use crate::pdu_config::write_atomic;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 100;

// ---------------------------------------------------------------------------
// Rule definition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    VoltageBelow,
    VoltageAbove,
    AtsSourceIs,
    AtsPreferredLost,
    TimeAfter,
    TimeBefore,
    TimeBetween,
}

impl Condition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::VoltageBelow => "voltage_below",
            Condition::VoltageAbove => "voltage_above",
            Condition::AtsSourceIs => "ats_source_is",
            Condition::AtsPreferredLost => "ats_preferred_lost",
            Condition::TimeAfter => "time_after",
            Condition::TimeBefore => "time_before",
            Condition::TimeBetween => "time_between",
        }
    }

    fn is_time(&self) -> bool {
        matches!(
            self,
            Condition::TimeAfter | Condition::TimeBefore | Condition::TimeBetween
        )
    }
}

/// Rule threshold: volts for voltage conditions, source number (1|2) for
/// `ats_source_is`, `"HH:MM"` / `"HH:MM-HH:MM"` strings for time rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Threshold {
    Number(f64),
    Text(String),
}

impl std::fmt::Display for Threshold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Threshold::Number(n) => write!(f, "{n}"),
            Threshold::Text(s) => f.write_str(s),
        }
    }
}

fn default_restore() -> bool {
    true
}

fn default_delay() -> u64 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    /// 1 (source A) or 2 (source B); 0 for time rules.
    #[serde(default)]
    pub input: u8,
    pub condition: Condition,
    pub threshold: Threshold,
    pub outlet: u16,
    pub action: OutletAction,
    #[serde(default = "default_restore")]
    pub restore: bool,
    /// Seconds the condition must hold before acting.
    #[serde(default = "default_delay")]
    pub delay: u64,
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule {0:?} already exists")]
    Duplicate(String),
    #[error("rule {0:?} not found")]
    NotFound(String),
    #[error("{0}")]
    Invalid(String),
}

impl Rule {
    pub fn from_value(value: &serde_json::Value) -> Result<Rule, RuleError> {
        let rule: Rule = serde_json::from_value(value.clone())
            .map_err(|e| RuleError::Invalid(format!("invalid rule data: {e}")))?;
        rule.validate()?;
        Ok(rule)
    }

    pub fn validate(&self) -> Result<(), RuleError> {
        if self.name.is_empty() {
            return Err(RuleError::Invalid("rule name must not be empty".into()));
        }
        if self.outlet < 1 {
            return Err(RuleError::Invalid(format!(
                "outlet must be >= 1, got {}",
                self.outlet
            )));
        }
        if !matches!(self.action, OutletAction::On | OutletAction::Off) {
            return Err(RuleError::Invalid(format!(
                "action must be 'on' or 'off', got {:?}",
                self.action.as_str()
            )));
        }

        match (&self.condition, &self.threshold) {
            (c, Threshold::Text(s)) if c.is_time() => {
                if *c == Condition::TimeBetween {
                    let (start, end) = s.split_once('-').ok_or_else(|| {
                        RuleError::Invalid(format!(
                            "time_between threshold must be HH:MM-HH:MM, got {s:?}"
                        ))
                    })?;
                    parse_time(start)?;
                    parse_time(end)?;
                } else {
                    parse_time(s)?;
                }
            }
            (c, Threshold::Number(_)) if c.is_time() => {
                return Err(RuleError::Invalid(format!(
                    "{} threshold must be a time string",
                    c.as_str()
                )));
            }
            (Condition::AtsSourceIs, Threshold::Number(n)) => {
                if *n != 1.0 && *n != 2.0 {
                    return Err(RuleError::Invalid(format!(
                        "ats_source_is threshold must be 1 or 2, got {n}"
                    )));
                }
            }
            (Condition::AtsPreferredLost, _) => {}
            (_, Threshold::Text(s)) => {
                return Err(RuleError::Invalid(format!(
                    "{} threshold must be numeric, got {s:?}",
                    self.condition.as_str()
                )));
            }
            _ => {}
        }
        Ok(())
    }
}

/// Parse `"HH:MM"` into minutes since midnight.
fn parse_time(s: &str) -> Result<u32, RuleError> {
    let s = s.trim();
    let (h, m) = s
        .split_once(':')
        .ok_or_else(|| RuleError::Invalid(format!("invalid time format: {s:?} (expected HH:MM)")))?;
    let h: u32 = h
        .parse()
        .map_err(|_| RuleError::Invalid(format!("invalid time format: {s:?} (non-numeric)")))?;
    let m: u32 = m
        .parse()
        .map_err(|_| RuleError::Invalid(format!("invalid time format: {s:?} (non-numeric)")))?;
    if h > 23 || m > 59 {
        return Err(RuleError::Invalid(format!(
            "invalid time: {s:?} (hour 0-23, minute 0-59)"
        )));
    }
    Ok(h * 60 + m)
}

// ---------------------------------------------------------------------------
// Runtime state and events
// ---------------------------------------------------------------------------

/// Per-rule runtime state. Not persisted across restarts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleState {
    pub triggered: bool,
    /// Seconds timestamp when the condition first evaluated true; cleared
    /// once the rule fires or the condition drops.
    pub condition_since: Option<f64>,
    pub fired_at: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleEventKind {
    Created,
    Updated,
    Deleted,
    Triggered,
    Restored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleEvent {
    pub rule: String,
    #[serde(rename = "type")]
    pub kind: RuleEventKind,
    pub details: String,
    pub ts: f64,
}

/// Issues outlet commands on behalf of fired rules. The poller implements
/// this over its transport; tests substitute recorders.
#[async_trait]
pub trait OutletCommander: Send {
    async fn command(&mut self, outlet: u16, action: OutletAction) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct RuleEntry {
    rule: Rule,
    state: RuleState,
}

pub struct RuleEngine {
    path: PathBuf,
    entries: Vec<RuleEntry>,
    events: VecDeque<RuleEvent>,
    command_failures: u64,
}

impl RuleEngine {
    /// Load rules from `path`. Tolerant: an invalid rule is skipped with a
    /// log line, a malformed file starts the engine empty.
    pub fn load(path: PathBuf) -> Self {
        let mut engine = Self {
            path,
            entries: Vec::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
            command_failures: 0,
        };

        if engine.path.exists() {
            match std::fs::read_to_string(&engine.path)
                .map_err(anyhow::Error::from)
                .and_then(|s| {
                    serde_json::from_str::<Vec<serde_json::Value>>(&s).map_err(Into::into)
                }) {
                Ok(values) => {
                    for value in &values {
                        match Rule::from_value(value) {
                            Ok(rule) => engine.entries.push(RuleEntry {
                                rule,
                                state: RuleState::default(),
                            }),
                            Err(e) => error!(
                                rule = %value.get("name").and_then(|v| v.as_str()).unwrap_or("?"),
                                "skipping invalid rule: {e}"
                            ),
                        }
                    }
                    info!(
                        count = engine.entries.len(),
                        file = %engine.path.display(),
                        "loaded automation rules"
                    );
                }
                Err(e) => {
                    error!(file = %engine.path.display(), "failed to load rules: {e:#}");
                }
            }
        } else {
            info!(file = %engine.path.display(), "no rules file, starting empty");
        }

        engine
    }

    fn save(&self) -> anyhow::Result<()> {
        let rules: Vec<&Rule> = self.entries.iter().map(|e| &e.rule).collect();
        let data = serde_json::to_string_pretty(&rules)?;
        write_atomic(&self.path, &data)
    }

    fn add_event(&mut self, rule: &str, kind: RuleEventKind, details: String) -> RuleEvent {
        let event = RuleEvent {
            rule: rule.to_string(),
            kind,
            details,
            ts: now_secs(),
        };
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(event.clone());
        event
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.rule.name == name)
    }

    // -- CRUD --------------------------------------------------------------

    pub fn list_rules(&self) -> Vec<serde_json::Value> {
        self.entries
            .iter()
            .map(|e| {
                let mut value = serde_json::to_value(&e.rule).unwrap_or_default();
                if let Some(obj) = value.as_object_mut() {
                    obj.insert(
                        "state".into(),
                        serde_json::to_value(&e.state).unwrap_or_default(),
                    );
                }
                value
            })
            .collect()
    }

    pub fn create_rule(&mut self, data: &serde_json::Value) -> Result<Rule, RuleError> {
        let rule = Rule::from_value(data)?;
        if self.position(&rule.name).is_some() {
            return Err(RuleError::Duplicate(rule.name));
        }
        self.entries.push(RuleEntry {
            rule: rule.clone(),
            state: RuleState::default(),
        });
        if let Err(e) = self.save() {
            error!("failed to save rules: {e:#}");
        }
        self.add_event(
            &rule.name,
            RuleEventKind::Created,
            format!("Rule '{}' created", rule.name),
        );
        info!(rule = %rule.name, "created rule");
        Ok(rule)
    }

    pub fn update_rule(
        &mut self,
        name: &str,
        data: &serde_json::Value,
    ) -> Result<Rule, RuleError> {
        let idx = self
            .position(name)
            .ok_or_else(|| RuleError::NotFound(name.to_string()))?;

        // The path name wins over any name in the body.
        let mut data = data.clone();
        if let Some(obj) = data.as_object_mut() {
            obj.insert("name".into(), serde_json::Value::String(name.to_string()));
        }
        let rule = Rule::from_value(&data)?;

        self.entries[idx] = RuleEntry {
            rule: rule.clone(),
            state: RuleState::default(),
        };
        if let Err(e) = self.save() {
            error!("failed to save rules: {e:#}");
        }
        self.add_event(
            name,
            RuleEventKind::Updated,
            format!("Rule '{name}' updated"),
        );
        info!(rule = %name, "updated rule");
        Ok(rule)
    }

    pub fn delete_rule(&mut self, name: &str) -> Result<(), RuleError> {
        let idx = self
            .position(name)
            .ok_or_else(|| RuleError::NotFound(name.to_string()))?;
        self.entries.remove(idx);
        if let Err(e) = self.save() {
            error!("failed to save rules: {e:#}");
        }
        self.add_event(
            name,
            RuleEventKind::Deleted,
            format!("Rule '{name}' deleted"),
        );
        info!(rule = %name, "deleted rule");
        Ok(())
    }

    /// Events, newest first.
    pub fn get_events(&self) -> Vec<RuleEvent> {
        self.events.iter().rev().cloned().collect()
    }

    pub fn command_failures(&self) -> u64 {
        self.command_failures
    }

    // -- Evaluation ----------------------------------------------------------

    /// Evaluate every rule against a snapshot. Returns newly emitted
    /// triggered/restored events.
    pub async fn evaluate<C: OutletCommander>(
        &mut self,
        snapshot: &Snapshot,
        commander: &mut C,
    ) -> Vec<RuleEvent> {
        let now = Local::now();
        let now_mins = now.hour() * 60 + now.minute();
        self.evaluate_at(snapshot, commander, now_secs(), now_mins)
            .await
    }

    /// Evaluation with an injected clock, used by `evaluate` and by tests
    /// that drive delay gating deterministically.
    pub async fn evaluate_at<C: OutletCommander>(
        &mut self,
        snapshot: &Snapshot,
        commander: &mut C,
        now: f64,
        now_mins: u32,
    ) -> Vec<RuleEvent> {
        let mut new_events = Vec::new();

        for idx in 0..self.entries.len() {
            let rule = self.entries[idx].rule.clone();

            let condition_met = match check_condition(&rule, snapshot, now_mins) {
                Ok(met) => met,
                Err(e) => {
                    // Treated as not-met for this tick; rule state untouched.
                    error!(rule = %rule.name, "error checking condition: {e}");
                    continue;
                }
            };

            let (triggered, condition_since) = {
                let state = &self.entries[idx].state;
                (state.triggered, state.condition_since)
            };

            if condition_met && !triggered {
                let since = match condition_since {
                    Some(since) => since,
                    None => {
                        self.entries[idx].state.condition_since = Some(now);
                        debug!(rule = %rule.name, "condition met, starting delay");
                        now
                    }
                };

                if now - since >= rule.delay as f64 {
                    let event = self.add_event(
                        &rule.name,
                        RuleEventKind::Triggered,
                        format!(
                            "Input {} {} {} -> outlet {} {}",
                            rule.input,
                            rule.condition.as_str(),
                            rule.threshold,
                            rule.outlet,
                            rule.action
                        ),
                    );
                    new_events.push(event);
                    warn!(
                        rule = %rule.name,
                        outlet = rule.outlet,
                        action = %rule.action,
                        "rule triggered"
                    );

                    match commander.command(rule.outlet, rule.action).await {
                        Ok(()) => {
                            let state = &mut self.entries[idx].state;
                            state.triggered = true;
                            state.fired_at = Some(now);
                        }
                        Err(e) => {
                            self.command_failures += 1;
                            error!(
                                rule = %rule.name,
                                outlet = rule.outlet,
                                action = %rule.action,
                                "command failed: {e:#}"
                            );
                            // Clear so the next tick retries.
                            self.entries[idx].state.condition_since = None;
                        }
                    }
                }
            } else if !condition_met && triggered && rule.restore {
                let restore_action = rule.action.inverse();
                let event = self.add_event(
                    &rule.name,
                    RuleEventKind::Restored,
                    format!(
                        "Input {} recovered -> outlet {} {}",
                        rule.input, rule.outlet, restore_action
                    ),
                );
                new_events.push(event);
                info!(
                    rule = %rule.name,
                    outlet = rule.outlet,
                    action = %restore_action,
                    "rule restored"
                );

                if let Err(e) = commander.command(rule.outlet, restore_action).await {
                    self.command_failures += 1;
                    error!(
                        rule = %rule.name,
                        outlet = rule.outlet,
                        "restore command failed: {e:#}"
                    );
                }
                // Restore clears state regardless of callback outcome.
                let state = &mut self.entries[idx].state;
                state.triggered = false;
                state.condition_since = None;
                state.fired_at = None;
            } else if !condition_met {
                self.entries[idx].state.condition_since = None;
            }
            // condition_met && triggered: no re-fire, leave state alone.
        }

        new_events
    }
}

fn now_secs() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

// ---------------------------------------------------------------------------
// Condition evaluation
// ---------------------------------------------------------------------------

fn check_condition(rule: &Rule, snapshot: &Snapshot, now_mins: u32) -> Result<bool, RuleError> {
    match rule.condition {
        Condition::AtsSourceIs => {
            let threshold = match &rule.threshold {
                Threshold::Number(n) => *n as u8,
                Threshold::Text(s) => {
                    return Err(RuleError::Invalid(format!(
                        "ats_source_is threshold not numeric: {s:?}"
                    )))
                }
            };
            Ok(snapshot.ats_current_source == Some(threshold))
        }
        Condition::AtsPreferredLost => Ok(match (
            snapshot.ats_current_source,
            snapshot.ats_preferred_source,
        ) {
            (Some(current), Some(preferred)) => current != preferred,
            _ => false,
        }),
        Condition::TimeAfter | Condition::TimeBefore | Condition::TimeBetween => {
            check_time_condition(rule, now_mins)
        }
        Condition::VoltageBelow | Condition::VoltageAbove => {
            // Per-input SOURCE voltage, never the load bank voltage: on ATS
            // models the banks keep showing ~120V after a transfer even
            // when an input has failed.
            let source = if rule.input == 1 {
                &snapshot.source_a
            } else {
                &snapshot.source_b
            };
            let voltage = match source.as_ref().and_then(|s| s.voltage) {
                Some(v) => v,
                None => return Ok(false),
            };
            let threshold = match &rule.threshold {
                Threshold::Number(n) => *n,
                Threshold::Text(s) => {
                    return Err(RuleError::Invalid(format!(
                        "voltage threshold not numeric: {s:?}"
                    )))
                }
            };
            Ok(match rule.condition {
                Condition::VoltageBelow => voltage < threshold,
                _ => voltage > threshold,
            })
        }
    }
}

fn check_time_condition(rule: &Rule, now_mins: u32) -> Result<bool, RuleError> {
    let text = match &rule.threshold {
        Threshold::Text(s) => s.as_str(),
        Threshold::Number(n) => {
            return Err(RuleError::Invalid(format!(
                "time threshold not a string: {n}"
            )))
        }
    };

    match rule.condition {
        Condition::TimeAfter => Ok(now_mins >= parse_time(text)?),
        Condition::TimeBefore => Ok(now_mins < parse_time(text)?),
        Condition::TimeBetween => {
            let (start, end) = text.split_once('-').ok_or_else(|| {
                RuleError::Invalid(format!("time_between threshold must be HH:MM-HH:MM: {text:?}"))
            })?;
            let start = parse_time(start)?;
            let end = parse_time(end)?;
            if start <= end {
                // Same-day range, half-open.
                Ok(now_mins >= start && now_mins < end)
            } else {
                // Midnight wrap (e.g. 22:00-06:00).
                Ok(now_mins >= start || now_mins < end)
            }
        }
        _ => unreachable!("not a time condition"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SourceData, VoltageStatus};
    use std::path::PathBuf;

    struct Recorder {
        calls: Vec<(u16, OutletAction)>,
        fail: bool,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                calls: Vec::new(),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl OutletCommander for Recorder {
        async fn command(&mut self, outlet: u16, action: OutletAction) -> anyhow::Result<()> {
            self.calls.push((outlet, action));
            if self.fail {
                anyhow::bail!("simulated command failure");
            }
            Ok(())
        }
    }

    fn temp_rules_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("pdu_rules_{}_{}.json", std::process::id(), name))
    }

    fn empty_engine(name: &str) -> RuleEngine {
        let path = temp_rules_path(name);
        let _ = std::fs::remove_file(&path);
        RuleEngine::load(path)
    }

    fn voltage_rule(name: &str, delay: u64) -> serde_json::Value {
        serde_json::json!({
            "name": name,
            "input": 1,
            "condition": "voltage_below",
            "threshold": 10.0,
            "outlet": 3,
            "action": "off",
            "restore": true,
            "delay": delay,
        })
    }

    fn snapshot_with_sources(a: Option<f64>, b: Option<f64>) -> Snapshot {
        let mut snap = Snapshot::default();
        snap.source_a = a.map(|v| SourceData {
            voltage: Some(v),
            frequency: Some(60.0),
            voltage_status: VoltageStatus::Normal,
        });
        snap.source_b = b.map(|v| SourceData {
            voltage: Some(v),
            frequency: Some(60.0),
            voltage_status: VoltageStatus::Normal,
        });
        snap.ats_current_source = Some(2);
        snap.ats_preferred_source = Some(1);
        snap
    }

    // -- Validation ---------------------------------------------------------

    #[test]
    fn rule_from_value_applies_defaults() {
        let rule = Rule::from_value(&serde_json::json!({
            "name": "r1",
            "condition": "ats_preferred_lost",
            "threshold": 0,
            "outlet": 1,
            "action": "off",
        }))
        .unwrap();
        assert!(rule.restore);
        assert_eq!(rule.delay, 5);
        assert_eq!(rule.input, 0);
    }

    #[test]
    fn rule_rejects_bad_action() {
        let err = Rule::from_value(&serde_json::json!({
            "name": "r1", "input": 1, "condition": "voltage_below",
            "threshold": 10.0, "outlet": 1, "action": "reboot",
        }))
        .unwrap_err();
        assert!(matches!(err, RuleError::Invalid(_)));
    }

    #[test]
    fn rule_rejects_outlet_zero() {
        assert!(Rule::from_value(&serde_json::json!({
            "name": "r1", "input": 1, "condition": "voltage_below",
            "threshold": 10.0, "outlet": 0, "action": "off",
        }))
        .is_err());
    }

    #[test]
    fn rule_rejects_bad_time_format() {
        for bad in ["25:00", "12:61", "noon", "22:00-", "9"] {
            assert!(
                Rule::from_value(&serde_json::json!({
                    "name": "r1", "input": 0, "condition": "time_after",
                    "threshold": bad, "outlet": 1, "action": "off",
                }))
                .is_err(),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn rule_rejects_numeric_threshold_for_time() {
        assert!(Rule::from_value(&serde_json::json!({
            "name": "r1", "input": 0, "condition": "time_after",
            "threshold": 1200, "outlet": 1, "action": "off",
        }))
        .is_err());
    }

    #[test]
    fn rule_rejects_ats_source_threshold_three() {
        assert!(Rule::from_value(&serde_json::json!({
            "name": "r1", "input": 0, "condition": "ats_source_is",
            "threshold": 3, "outlet": 1, "action": "off",
        }))
        .is_err());
    }

    #[test]
    fn time_between_requires_both_halves_valid() {
        assert!(Rule::from_value(&serde_json::json!({
            "name": "r1", "input": 0, "condition": "time_between",
            "threshold": "22:00-26:00", "outlet": 1, "action": "off",
        }))
        .is_err());
    }

    // -- Condition checks ---------------------------------------------------

    #[test]
    fn voltage_below_uses_source_a_for_input_1() {
        let rule = Rule::from_value(&voltage_rule("r", 0)).unwrap();

        // Source A failed, bank/source B still at mains: must trigger.
        let snap = snapshot_with_sources(Some(0.0), Some(120.0));
        assert!(check_condition(&rule, &snap, 0).unwrap());

        // Source A healthy.
        let snap = snapshot_with_sources(Some(120.0), Some(0.0));
        assert!(!check_condition(&rule, &snap, 0).unwrap());
    }

    #[test]
    fn voltage_below_missing_source_is_false() {
        let rule = Rule::from_value(&voltage_rule("r", 0)).unwrap();
        let snap = snapshot_with_sources(None, Some(120.0));
        assert!(!check_condition(&rule, &snap, 0).unwrap());
    }

    #[test]
    fn voltage_above_on_source_b() {
        let rule = Rule::from_value(&serde_json::json!({
            "name": "r", "input": 2, "condition": "voltage_above",
            "threshold": 126.0, "outlet": 1, "action": "off", "delay": 0,
        }))
        .unwrap();
        let snap = snapshot_with_sources(Some(120.0), Some(130.0));
        assert!(check_condition(&rule, &snap, 0).unwrap());
        let snap = snapshot_with_sources(Some(130.0), Some(120.0));
        assert!(!check_condition(&rule, &snap, 0).unwrap());
    }

    #[test]
    fn ats_source_is_matches_current() {
        let rule = Rule::from_value(&serde_json::json!({
            "name": "r", "input": 0, "condition": "ats_source_is",
            "threshold": 2, "outlet": 1, "action": "off", "delay": 0,
        }))
        .unwrap();
        let mut snap = snapshot_with_sources(Some(120.0), Some(120.0));
        assert!(check_condition(&rule, &snap, 0).unwrap());
        snap.ats_current_source = Some(1);
        assert!(!check_condition(&rule, &snap, 0).unwrap());
        snap.ats_current_source = None;
        assert!(!check_condition(&rule, &snap, 0).unwrap());
    }

    #[test]
    fn ats_preferred_lost_needs_both_sources_known() {
        let rule = Rule::from_value(&serde_json::json!({
            "name": "r", "input": 0, "condition": "ats_preferred_lost",
            "threshold": 0, "outlet": 1, "action": "off", "delay": 0,
        }))
        .unwrap();
        let mut snap = snapshot_with_sources(Some(120.0), Some(120.0));
        assert!(check_condition(&rule, &snap, 0).unwrap()); // current=2, preferred=1
        snap.ats_current_source = Some(1);
        assert!(!check_condition(&rule, &snap, 0).unwrap());
        snap.ats_preferred_source = None;
        assert!(!check_condition(&rule, &snap, 0).unwrap());
    }

    #[test]
    fn time_after_and_before() {
        let after = Rule::from_value(&serde_json::json!({
            "name": "a", "input": 0, "condition": "time_after",
            "threshold": "22:00", "outlet": 1, "action": "off", "delay": 0,
        }))
        .unwrap();
        let before = Rule::from_value(&serde_json::json!({
            "name": "b", "input": 0, "condition": "time_before",
            "threshold": "06:00", "outlet": 1, "action": "off", "delay": 0,
        }))
        .unwrap();
        let snap = Snapshot::default();

        assert!(check_condition(&after, &snap, 22 * 60).unwrap());
        assert!(check_condition(&after, &snap, 23 * 60).unwrap());
        assert!(!check_condition(&after, &snap, 21 * 60 + 59).unwrap());

        assert!(check_condition(&before, &snap, 5 * 60).unwrap());
        assert!(!check_condition(&before, &snap, 6 * 60).unwrap());
    }

    #[test]
    fn time_between_midnight_wrap_exact_set() {
        // 22:00-06:00 must be true exactly on [0,360) ∪ [1320,1440).
        let rule = Rule::from_value(&serde_json::json!({
            "name": "r", "input": 0, "condition": "time_between",
            "threshold": "22:00-06:00", "outlet": 1, "action": "off", "delay": 0,
        }))
        .unwrap();
        let snap = Snapshot::default();

        for m in 0..1440u32 {
            let expected = m < 360 || m >= 1320;
            assert_eq!(
                check_condition(&rule, &snap, m).unwrap(),
                expected,
                "minute {m}"
            );
        }
    }

    #[test]
    fn time_between_same_day_half_open() {
        let rule = Rule::from_value(&serde_json::json!({
            "name": "r", "input": 0, "condition": "time_between",
            "threshold": "09:00-17:00", "outlet": 1, "action": "off", "delay": 0,
        }))
        .unwrap();
        let snap = Snapshot::default();
        assert!(check_condition(&rule, &snap, 9 * 60).unwrap());
        assert!(check_condition(&rule, &snap, 16 * 60 + 59).unwrap());
        assert!(!check_condition(&rule, &snap, 17 * 60).unwrap()); // end exclusive
        assert!(!check_condition(&rule, &snap, 8 * 60 + 59).unwrap());
    }

    // -- Firing / hysteresis ------------------------------------------------

    #[tokio::test]
    async fn input_failure_fires_rule_immediately_with_zero_delay() {
        let mut engine = empty_engine("fire");
        engine.create_rule(&voltage_rule("protect", 0)).unwrap();
        let mut commander = Recorder::new();

        // Input A failed; ATS moved to B.
        let snap = snapshot_with_sources(Some(0.0), Some(120.0));
        let events = engine.evaluate_at(&snap, &mut commander, 100.0, 0).await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, RuleEventKind::Triggered);
        assert_eq!(commander.calls, vec![(3, OutletAction::Off)]);

        let rules = engine.list_rules();
        assert_eq!(rules[0]["state"]["triggered"], true);
    }

    #[tokio::test]
    async fn restore_issues_inverse_action() {
        let mut engine = empty_engine("restore");
        engine.create_rule(&voltage_rule("protect", 0)).unwrap();
        let mut commander = Recorder::new();

        let failed = snapshot_with_sources(Some(0.0), Some(120.0));
        engine.evaluate_at(&failed, &mut commander, 100.0, 0).await;

        let recovered = snapshot_with_sources(Some(120.0), Some(120.0));
        let events = engine
            .evaluate_at(&recovered, &mut commander, 110.0, 0)
            .await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, RuleEventKind::Restored);
        assert_eq!(
            commander.calls,
            vec![(3, OutletAction::Off), (3, OutletAction::On)]
        );
        assert_eq!(engine.list_rules()[0]["state"]["triggered"], false);
    }

    #[tokio::test]
    async fn no_restore_leaves_state_latched() {
        let mut engine = empty_engine("norestore");
        let mut rule = voltage_rule("latched", 0);
        rule["restore"] = serde_json::json!(false);
        engine.create_rule(&rule).unwrap();
        let mut commander = Recorder::new();

        let failed = snapshot_with_sources(Some(0.0), Some(120.0));
        engine.evaluate_at(&failed, &mut commander, 100.0, 0).await;

        let recovered = snapshot_with_sources(Some(120.0), Some(120.0));
        let events = engine
            .evaluate_at(&recovered, &mut commander, 110.0, 0)
            .await;

        assert!(events.is_empty());
        assert_eq!(commander.calls.len(), 1);
        assert_eq!(engine.list_rules()[0]["state"]["triggered"], true);
    }

    #[tokio::test]
    async fn delay_gates_firing() {
        let mut engine = empty_engine("delay");
        engine.create_rule(&voltage_rule("slow", 5)).unwrap();
        let mut commander = Recorder::new();

        let failed = snapshot_with_sources(Some(0.0), Some(120.0));

        // t=0: condition starts the delay window, no fire.
        let events = engine.evaluate_at(&failed, &mut commander, 0.0, 0).await;
        assert!(events.is_empty());
        assert!(commander.calls.is_empty());

        // t=3: still inside the window.
        let events = engine.evaluate_at(&failed, &mut commander, 3.0, 0).await;
        assert!(events.is_empty());

        // t=6: delay satisfied, fires.
        let events = engine.evaluate_at(&failed, &mut commander, 6.0, 0).await;
        assert_eq!(events.len(), 1);
        assert_eq!(commander.calls, vec![(3, OutletAction::Off)]);
    }

    #[tokio::test]
    async fn fired_at_minus_condition_since_is_at_least_delay() {
        let mut engine = empty_engine("delaybound");
        engine.create_rule(&voltage_rule("slow", 5)).unwrap();
        let mut commander = Recorder::new();

        let failed = snapshot_with_sources(Some(0.0), Some(120.0));
        engine.evaluate_at(&failed, &mut commander, 10.0, 0).await;
        engine.evaluate_at(&failed, &mut commander, 17.5, 0).await;

        let state = &engine.list_rules()[0]["state"];
        let since = state["condition_since"].as_f64().unwrap();
        let fired = state["fired_at"].as_f64().unwrap();
        assert!(fired - since >= 5.0);
    }

    #[tokio::test]
    async fn condition_blip_resets_delay_window() {
        let mut engine = empty_engine("blip");
        engine.create_rule(&voltage_rule("slow", 5)).unwrap();
        let mut commander = Recorder::new();

        let failed = snapshot_with_sources(Some(0.0), Some(120.0));
        let healthy = snapshot_with_sources(Some(120.0), Some(120.0));

        engine.evaluate_at(&failed, &mut commander, 0.0, 0).await;
        engine.evaluate_at(&healthy, &mut commander, 2.0, 0).await; // clears window
        let events = engine.evaluate_at(&failed, &mut commander, 6.0, 0).await;
        // Only 0s into the new window, must not fire.
        assert!(events.is_empty());
        assert!(commander.calls.is_empty());
    }

    #[tokio::test]
    async fn command_failure_resets_for_retry() {
        let mut engine = empty_engine("cmdfail");
        engine.create_rule(&voltage_rule("protect", 0)).unwrap();
        let mut commander = Recorder::new();
        commander.fail = true;

        let failed = snapshot_with_sources(Some(0.0), Some(120.0));
        engine.evaluate_at(&failed, &mut commander, 100.0, 0).await;
        assert_eq!(engine.command_failures(), 1);
        assert_eq!(engine.list_rules()[0]["state"]["triggered"], false);

        // Next tick retries the command.
        commander.fail = false;
        engine.evaluate_at(&failed, &mut commander, 101.0, 0).await;
        assert_eq!(commander.calls.len(), 2);
        assert_eq!(engine.list_rules()[0]["state"]["triggered"], true);
    }

    #[tokio::test]
    async fn triggered_rule_does_not_refire() {
        let mut engine = empty_engine("norefire");
        engine.create_rule(&voltage_rule("protect", 0)).unwrap();
        let mut commander = Recorder::new();

        let failed = snapshot_with_sources(Some(0.0), Some(120.0));
        engine.evaluate_at(&failed, &mut commander, 100.0, 0).await;
        engine.evaluate_at(&failed, &mut commander, 101.0, 0).await;
        engine.evaluate_at(&failed, &mut commander, 102.0, 0).await;

        assert_eq!(commander.calls.len(), 1);
    }

    #[tokio::test]
    async fn rules_evaluate_in_insertion_order() {
        let mut engine = empty_engine("order");
        let mut first = voltage_rule("first", 0);
        first["outlet"] = serde_json::json!(1);
        let mut second = voltage_rule("second", 0);
        second["outlet"] = serde_json::json!(2);
        engine.create_rule(&first).unwrap();
        engine.create_rule(&second).unwrap();

        let mut commander = Recorder::new();
        let failed = snapshot_with_sources(Some(0.0), Some(120.0));
        engine.evaluate_at(&failed, &mut commander, 100.0, 0).await;

        assert_eq!(
            commander.calls,
            vec![(1, OutletAction::Off), (2, OutletAction::Off)]
        );
    }

    // -- Event ring ---------------------------------------------------------

    #[test]
    fn event_ring_never_exceeds_100() {
        let mut engine = empty_engine("ring");
        for i in 0..250 {
            engine.add_event(&format!("r{i}"), RuleEventKind::Created, format!("e{i}"));
        }
        assert_eq!(engine.events.len(), MAX_EVENTS);
        // Oldest retained is event 150.
        assert_eq!(engine.events.front().unwrap().details, "e150");
    }

    #[test]
    fn get_events_newest_first() {
        let mut engine = empty_engine("newest");
        engine.add_event("a", RuleEventKind::Created, "first".into());
        engine.add_event("b", RuleEventKind::Created, "second".into());
        let events = engine.get_events();
        assert_eq!(events[0].details, "second");
        assert_eq!(events[1].details, "first");
    }

    // -- CRUD + persistence -------------------------------------------------

    #[test]
    fn create_duplicate_is_rejected() {
        let mut engine = empty_engine("dup");
        engine.create_rule(&voltage_rule("r1", 0)).unwrap();
        let err = engine.create_rule(&voltage_rule("r1", 0)).unwrap_err();
        assert!(matches!(err, RuleError::Duplicate(_)));
    }

    #[test]
    fn update_unknown_is_not_found() {
        let mut engine = empty_engine("upd404");
        let err = engine.update_rule("ghost", &voltage_rule("ghost", 0)).unwrap_err();
        assert!(matches!(err, RuleError::NotFound(_)));
    }

    #[test]
    fn delete_unknown_is_not_found() {
        let mut engine = empty_engine("del404");
        assert!(matches!(
            engine.delete_rule("ghost").unwrap_err(),
            RuleError::NotFound(_)
        ));
    }

    #[test]
    fn rules_persist_across_reload() {
        let path = temp_rules_path("persist");
        let _ = std::fs::remove_file(&path);

        {
            let mut engine = RuleEngine::load(path.clone());
            engine.create_rule(&voltage_rule("keepme", 7)).unwrap();
        }

        let engine = RuleEngine::load(path.clone());
        let rules = engine.list_rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0]["name"], "keepme");
        assert_eq!(rules[0]["delay"], 7);
        // Runtime state starts fresh.
        assert_eq!(rules[0]["state"]["triggered"], false);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn load_skips_invalid_rules() {
        let path = temp_rules_path("tolerant");
        std::fs::write(
            &path,
            r#"[
                {"name":"good","input":1,"condition":"voltage_below","threshold":10.0,"outlet":1,"action":"off"},
                {"name":"bad","input":1,"condition":"voltage_below","threshold":10.0,"outlet":0,"action":"off"},
                {"name":"worse","condition":"nonsense"}
            ]"#,
        )
        .unwrap();

        let engine = RuleEngine::load(path.clone());
        assert_eq!(engine.list_rules().len(), 1);
        assert_eq!(engine.list_rules()[0]["name"], "good");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn load_malformed_file_starts_empty() {
        let path = temp_rules_path("malformed");
        std::fs::write(&path, "{definitely not an array").unwrap();
        let engine = RuleEngine::load(path.clone());
        assert!(engine.list_rules().is_empty());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn update_keeps_position_and_resets_state() {
        let mut engine = empty_engine("updpos");
        engine.create_rule(&voltage_rule("a", 0)).unwrap();
        engine.create_rule(&voltage_rule("b", 0)).unwrap();

        let mut patch = voltage_rule("a", 9);
        patch["name"] = serde_json::json!("ignored-by-path");
        engine.update_rule("a", &patch).unwrap();

        let rules = engine.list_rules();
        assert_eq!(rules[0]["name"], "a");
        assert_eq!(rules[0]["delay"], 9);
        assert_eq!(rules[1]["name"], "b");
    }
}
