//! SQLite history store: 1 Hz sample recording with batched commits,
//! auto-downsampling queries, retention cleanup, and weekly energy reports.
//!
//! A single connection serves both writers and readers behind a mutex; WAL
//! journaling keeps the file readable by external tools while a write
//! transaction is open. Write errors roll back, count, and after ten
//! consecutive failures the connection is closed and reopened to recover
//! from journal locks.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use serde::Serialize;
use serde_json::json;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{ConnectOptions, QueryBuilder, Row, Sqlite, SqliteConnection};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::model::Snapshot;

/// Commit after this many recorded snapshots to batch fsync cost.
const COMMIT_BATCH: u32 = 10;

/// Close and reopen the connection after this many consecutive write errors.
const REOPEN_THRESHOLD: u32 = 10;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS bank_samples (
    ts INTEGER NOT NULL,
    bank INTEGER NOT NULL,
    voltage REAL,
    current REAL,
    power REAL,
    apparent REAL,
    pf REAL,
    device_id TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS outlet_samples (
    ts INTEGER NOT NULL,
    outlet INTEGER NOT NULL,
    state TEXT,
    current REAL,
    power REAL,
    energy REAL,
    device_id TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS environment_samples (
    ts INTEGER NOT NULL,
    temperature REAL,
    humidity REAL,
    contact_1 INTEGER,
    contact_2 INTEGER,
    contact_3 INTEGER,
    contact_4 INTEGER,
    device_id TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS energy_reports (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    week_start TEXT NOT NULL,
    week_end TEXT NOT NULL,
    created_at TEXT NOT NULL,
    data TEXT NOT NULL,
    device_id TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_bank_device ON bank_samples(device_id, ts);
CREATE INDEX IF NOT EXISTS idx_outlet_device ON outlet_samples(device_id, ts);
CREATE INDEX IF NOT EXISTS idx_env_device ON environment_samples(device_id, ts);
CREATE UNIQUE INDEX IF NOT EXISTS idx_report_week
    ON energy_reports(week_start, device_id);
"#;

// ---------------------------------------------------------------------------
// Query result rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct BankBucket {
    pub bucket: i64,
    pub bank: i64,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub power: Option<f64>,
    pub apparent: Option<f64>,
    pub pf: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutletBucket {
    pub bucket: i64,
    pub outlet: i64,
    pub current: Option<f64>,
    pub power: Option<f64>,
    pub energy: Option<f64>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

struct HistoryInner {
    conn: SqliteConnection,
    options: SqliteConnectOptions,
    db_label: String,
    in_txn: bool,
    write_count: u32,
    total_writes: u64,
    write_errors: u64,
    consecutive_write_errors: u32,
}

#[derive(Clone)]
pub struct HistoryStore {
    inner: Arc<Mutex<HistoryInner>>,
    retention_days: u32,
    house_monthly_kwh: f64,
}

impl HistoryStore {
    pub async fn open(
        db_path: &Path,
        retention_days: u32,
        house_monthly_kwh: f64,
    ) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create dir {}", parent.display()))?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        Self::open_with(options, db_path.display().to_string(), retention_days, house_monthly_kwh)
            .await
    }

    /// In-memory store for tests.
    pub async fn open_in_memory(retention_days: u32, house_monthly_kwh: f64) -> Result<Self> {
        let options = SqliteConnectOptions::new().filename(":memory:");
        Self::open_with(options, ":memory:".into(), retention_days, house_monthly_kwh).await
    }

    async fn open_with(
        options: SqliteConnectOptions,
        db_label: String,
        retention_days: u32,
        house_monthly_kwh: f64,
    ) -> Result<Self> {
        let mut conn = options
            .connect()
            .await
            .with_context(|| format!("failed to open history db {db_label}"))?;

        create_schema(&mut conn)
            .await
            .context("failed to create history schema")?;

        Ok(Self {
            inner: Arc::new(Mutex::new(HistoryInner {
                conn,
                options,
                db_label,
                in_txn: false,
                write_count: 0,
                total_writes: 0,
                write_errors: 0,
                consecutive_write_errors: 0,
            })),
            retention_days,
            house_monthly_kwh,
        })
    }

    // -- Writing -----------------------------------------------------------

    /// Record one snapshot: one row per bank, one per outlet, and an
    /// environment row when a sensor is present. Commits every
    /// [`COMMIT_BATCH`] records.
    pub async fn record(&self, snapshot: &Snapshot, device_id: &str) -> Result<()> {
        let mut g = self.inner.lock().await;
        g.total_writes += 1;
        let now = Utc::now().timestamp();

        match insert_snapshot(&mut g, snapshot, device_id, now).await {
            Ok(()) => {
                g.consecutive_write_errors = 0;
                g.write_count += 1;
                if g.write_count >= COMMIT_BATCH {
                    if let Err(e) = commit(&mut g).await {
                        return self.handle_write_error(&mut g, e).await;
                    }
                    g.write_count = 0;
                }
                Ok(())
            }
            Err(e) => self.handle_write_error(&mut g, e).await,
        }
    }

    async fn handle_write_error(
        &self,
        g: &mut HistoryInner,
        e: anyhow::Error,
    ) -> Result<()> {
        g.write_errors += 1;
        g.consecutive_write_errors += 1;
        if g.write_errors <= 3 || g.write_errors % 60 == 0 {
            error!(errors = g.write_errors, "history write failed: {e:#}");
        }
        let _ = rollback(g).await;

        if g.consecutive_write_errors >= REOPEN_THRESHOLD {
            warn!(
                consecutive = g.consecutive_write_errors,
                "history: reopening database connection"
            );
            match g.options.connect().await {
                Ok(mut conn) => {
                    if create_schema(&mut conn).await.is_ok() {
                        g.conn = conn;
                        g.in_txn = false;
                        g.write_count = 0;
                        g.consecutive_write_errors = 0;
                        info!("history: database connection reopened");
                    }
                }
                Err(reopen_err) => {
                    error!("history: failed to reopen database: {reopen_err:#}");
                }
            }
        }
        Err(e)
    }

    // -- Querying ----------------------------------------------------------

    pub async fn query_banks(
        &self,
        start: i64,
        end: i64,
        interval: Option<i64>,
        device_id: Option<&str>,
    ) -> Result<Vec<BankBucket>> {
        let interval = interval.unwrap_or_else(|| pick_interval(start, end)).max(1);
        let mut g = self.inner.lock().await;

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT (ts / ");
        qb.push_bind(interval);
        qb.push(") * ");
        qb.push_bind(interval);
        qb.push(
            " AS bucket, bank, AVG(voltage) AS voltage, AVG(current) AS current, \
             AVG(power) AS power, AVG(apparent) AS apparent, AVG(pf) AS pf \
             FROM bank_samples WHERE ts >= ",
        );
        qb.push_bind(start);
        qb.push(" AND ts <= ");
        qb.push_bind(end);
        if let Some(did) = device_id {
            qb.push(" AND device_id = ");
            qb.push_bind(did.to_string());
        }
        qb.push(" GROUP BY bucket, bank ORDER BY bucket");

        let rows = qb
            .build()
            .fetch_all(&mut g.conn)
            .await
            .context("query_banks failed")?;

        Ok(rows
            .into_iter()
            .map(|r| BankBucket {
                bucket: r.get("bucket"),
                bank: r.get("bank"),
                voltage: r.get("voltage"),
                current: r.get("current"),
                power: r.get("power"),
                apparent: r.get("apparent"),
                pf: r.get("pf"),
            })
            .collect())
    }

    pub async fn query_outlets(
        &self,
        start: i64,
        end: i64,
        interval: Option<i64>,
        device_id: Option<&str>,
    ) -> Result<Vec<OutletBucket>> {
        let interval = interval.unwrap_or_else(|| pick_interval(start, end)).max(1);
        let mut g = self.inner.lock().await;

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT (ts / ");
        qb.push_bind(interval);
        qb.push(") * ");
        qb.push_bind(interval);
        // Energy is a monotonic counter, so the bucket metric is MAX.
        qb.push(
            " AS bucket, outlet, AVG(current) AS current, AVG(power) AS power, \
             MAX(energy) AS energy \
             FROM outlet_samples WHERE ts >= ",
        );
        qb.push_bind(start);
        qb.push(" AND ts <= ");
        qb.push_bind(end);
        if let Some(did) = device_id {
            qb.push(" AND device_id = ");
            qb.push_bind(did.to_string());
        }
        qb.push(" GROUP BY bucket, outlet ORDER BY bucket");

        let rows = qb
            .build()
            .fetch_all(&mut g.conn)
            .await
            .context("query_outlets failed")?;

        Ok(rows
            .into_iter()
            .map(|r| OutletBucket {
                bucket: r.get("bucket"),
                outlet: r.get("outlet"),
                current: r.get("current"),
                power: r.get("power"),
                energy: r.get("energy"),
            })
            .collect())
    }

    // -- Retention ---------------------------------------------------------

    /// Delete sample rows older than the retention period. Reports are kept
    /// indefinitely.
    pub async fn cleanup(&self) -> Result<u64> {
        let cutoff = Utc::now().timestamp() - self.retention_days as i64 * 86_400;
        let mut g = self.inner.lock().await;
        commit(&mut g).await.ok();

        let mut total = 0u64;
        for table in ["bank_samples", "outlet_samples", "environment_samples"] {
            let result = sqlx::query(&format!("DELETE FROM {table} WHERE ts < ?"))
                .bind(cutoff)
                .execute(&mut g.conn)
                .await
                .with_context(|| format!("cleanup of {table} failed"))?;
            total += result.rows_affected();
        }
        if total > 0 {
            info!(
                removed = total,
                retention_days = self.retention_days,
                "history cleanup"
            );
        }
        Ok(total)
    }

    // -- Reports -----------------------------------------------------------

    /// Generate the report for the most recent complete Mon–Sun week if it
    /// does not exist yet. Returns the report data, or `None` when it was
    /// already generated or there is no sample data for that week.
    pub async fn generate_weekly_report(
        &self,
        device_id: &str,
    ) -> Result<Option<serde_json::Value>> {
        let (week_start, week_end) = last_complete_week(Local::now());
        self.generate_report_for_week(week_start, week_end, device_id)
            .await
    }

    async fn generate_report_for_week(
        &self,
        week_start: NaiveDate,
        week_end: NaiveDate,
        device_id: &str,
    ) -> Result<Option<serde_json::Value>> {
        let week_start_str = week_start.format("%Y-%m-%d").to_string();
        let week_end_str = week_end.format("%Y-%m-%d").to_string();

        let mut g = self.inner.lock().await;
        commit(&mut g).await.ok();

        let existing = sqlx::query(
            "SELECT id FROM energy_reports WHERE week_start = ? AND device_id = ?",
        )
        .bind(&week_start_str)
        .bind(device_id)
        .fetch_optional(&mut g.conn)
        .await
        .context("report existence check failed")?;
        if existing.is_some() {
            return Ok(None);
        }

        let start_ts = local_midnight_ts(week_start);
        let end_ts = local_midnight_ts(week_end);

        let bank_rows = sqlx::query(
            "SELECT ts, bank, power FROM bank_samples \
             WHERE ts >= ? AND ts < ? AND device_id = ? ORDER BY ts",
        )
        .bind(start_ts)
        .bind(end_ts)
        .bind(device_id)
        .fetch_all(&mut g.conn)
        .await
        .context("report bank query failed")?;

        let outlet_rows = sqlx::query(
            "SELECT ts, outlet, power, energy FROM outlet_samples \
             WHERE ts >= ? AND ts < ? AND device_id = ? ORDER BY ts",
        )
        .bind(start_ts)
        .bind(end_ts)
        .bind(device_id)
        .fetch_all(&mut g.conn)
        .await
        .context("report outlet query failed")?;

        if bank_rows.is_empty() && outlet_rows.is_empty() {
            return Ok(None);
        }

        // Total power per second across banks. Samples are 1 Hz, so each
        // watt-sample contributes 1/3600 Wh.
        let mut total_power_samples: std::collections::BTreeMap<i64, f64> =
            std::collections::BTreeMap::new();
        for row in &bank_rows {
            let ts: i64 = row.get("ts");
            let entry = total_power_samples.entry(ts).or_insert(0.0);
            if let Some(power) = row.get::<Option<f64>, _>("power") {
                *entry += power;
            }
        }

        let total_kwh: f64 = total_power_samples.values().sum::<f64>() / 3600.0 / 1000.0;

        let power_vals: Vec<f64> = total_power_samples
            .values()
            .copied()
            .filter(|v| *v > 0.0)
            .collect();
        let peak_power = power_vals.iter().copied().fold(0.0_f64, f64::max);
        let avg_power = if power_vals.is_empty() {
            0.0
        } else {
            power_vals.iter().sum::<f64>() / power_vals.len() as f64
        };

        // Per-outlet breakdown.
        let mut outlet_powers: std::collections::BTreeMap<i64, Vec<f64>> =
            std::collections::BTreeMap::new();
        for row in &outlet_rows {
            let outlet: i64 = row.get("outlet");
            let entry = outlet_powers.entry(outlet).or_default();
            if let Some(power) = row.get::<Option<f64>, _>("power") {
                entry.push(power);
            }
        }
        let mut per_outlet = serde_json::Map::new();
        for (outlet, powers) in &outlet_powers {
            let kwh = powers.iter().sum::<f64>() / 3600.0 / 1000.0;
            let avg = if powers.is_empty() {
                0.0
            } else {
                powers.iter().sum::<f64>() / powers.len() as f64
            };
            let peak = powers.iter().copied().fold(0.0_f64, f64::max);
            per_outlet.insert(
                outlet.to_string(),
                json!({
                    "kwh": round3(kwh),
                    "avg_power": round1(avg),
                    "peak_power": round1(peak),
                }),
            );
        }

        // Daily breakdown on local calendar days.
        let mut daily: std::collections::BTreeMap<String, Vec<f64>> =
            std::collections::BTreeMap::new();
        for (ts, power) in &total_power_samples {
            let day = Local
                .timestamp_opt(*ts, 0)
                .single()
                .map(|dt| dt.format("%Y-%m-%d").to_string())
                .unwrap_or_default();
            daily.entry(day).or_default().push(*power);
        }
        let mut daily_breakdown = serde_json::Map::new();
        for (day, powers) in &daily {
            daily_breakdown.insert(
                day.clone(),
                json!({
                    "kwh": round3(powers.iter().sum::<f64>() / 3600.0 / 1000.0),
                    "avg_power": round1(powers.iter().sum::<f64>() / powers.len() as f64),
                    "peak_power": round1(powers.iter().copied().fold(0.0_f64, f64::max)),
                }),
            );
        }

        let house_pct = if self.house_monthly_kwh > 0.0 {
            let weekly_house = self.house_monthly_kwh * 7.0 / 30.0;
            Some(round1(total_kwh / weekly_house * 100.0))
        } else {
            None
        };

        let report_data = json!({
            "week_start": week_start_str,
            "week_end": week_end_str,
            "device_id": device_id,
            "total_kwh": round3(total_kwh),
            "peak_power_w": round1(peak_power),
            "avg_power_w": round1(avg_power),
            "per_outlet": per_outlet,
            "daily": daily_breakdown,
            "house_pct": house_pct,
            "sample_count": total_power_samples.len(),
        });

        sqlx::query(
            "INSERT INTO energy_reports (week_start, week_end, created_at, data, device_id) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&week_start_str)
        .bind(&week_end_str)
        .bind(Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string())
        .bind(report_data.to_string())
        .bind(device_id)
        .execute(&mut g.conn)
        .await
        .context("report insert failed")?;

        info!(
            week_start = %week_start_str,
            week_end = %week_end_str,
            device = device_id,
            total_kwh = round3(total_kwh),
            "generated weekly report"
        );
        Ok(Some(report_data))
    }

    pub async fn list_reports(&self, device_id: Option<&str>) -> Result<Vec<serde_json::Value>> {
        let mut g = self.inner.lock().await;

        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT id, week_start, week_end, created_at, device_id FROM energy_reports",
        );
        if let Some(did) = device_id {
            qb.push(" WHERE device_id = ");
            qb.push_bind(did.to_string());
        }
        qb.push(" ORDER BY week_start DESC");

        let rows = qb
            .build()
            .fetch_all(&mut g.conn)
            .await
            .context("list_reports failed")?;

        Ok(rows
            .into_iter()
            .map(|r| {
                json!({
                    "id": r.get::<i64, _>("id"),
                    "week_start": r.get::<String, _>("week_start"),
                    "week_end": r.get::<String, _>("week_end"),
                    "created_at": r.get::<String, _>("created_at"),
                    "device_id": r.get::<String, _>("device_id"),
                })
            })
            .collect())
    }

    pub async fn get_report(&self, report_id: i64) -> Result<Option<serde_json::Value>> {
        let mut g = self.inner.lock().await;
        let row = sqlx::query("SELECT * FROM energy_reports WHERE id = ?")
            .bind(report_id)
            .fetch_optional(&mut g.conn)
            .await
            .context("get_report failed")?;
        Ok(row.map(report_row_to_json))
    }

    pub async fn get_latest_report(
        &self,
        device_id: Option<&str>,
    ) -> Result<Option<serde_json::Value>> {
        let mut g = self.inner.lock().await;

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM energy_reports");
        if let Some(did) = device_id {
            qb.push(" WHERE device_id = ");
            qb.push_bind(did.to_string());
        }
        qb.push(" ORDER BY week_start DESC LIMIT 1");

        let row = qb
            .build()
            .fetch_optional(&mut g.conn)
            .await
            .context("get_latest_report failed")?;
        Ok(row.map(report_row_to_json))
    }

    // -- Health / shutdown ---------------------------------------------------

    pub async fn get_health(&self) -> serde_json::Value {
        let g = self.inner.lock().await;
        let healthy = g.write_errors == 0
            || (g.total_writes > 0 && (g.write_errors as f64 / g.total_writes as f64) < 0.1);
        json!({
            "db_path": g.db_label,
            "total_writes": g.total_writes,
            "write_errors": g.write_errors,
            "retention_days": self.retention_days,
            "healthy": healthy,
        })
    }

    /// Commit any open transaction. Errors are swallowed; shutdown must not
    /// fail on a sick database.
    pub async fn close(&self) {
        let mut g = self.inner.lock().await;
        if let Err(e) = commit(&mut g).await {
            warn!("history: error committing on close: {e:#}");
        }
    }
}

// ---------------------------------------------------------------------------
// Connection helpers
// ---------------------------------------------------------------------------

async fn create_schema(conn: &mut SqliteConnection) -> Result<()> {
    for statement in SCHEMA.split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        sqlx::query(statement).execute(&mut *conn).await?;
    }
    Ok(())
}

async fn insert_snapshot(
    g: &mut HistoryInner,
    snapshot: &Snapshot,
    device_id: &str,
    now: i64,
) -> Result<()> {
    if !g.in_txn {
        sqlx::query("BEGIN").execute(&mut g.conn).await?;
        g.in_txn = true;
    }

    for (idx, bank) in &snapshot.banks {
        sqlx::query(
            "INSERT INTO bank_samples \
             (ts, bank, voltage, current, power, apparent, pf, device_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(now)
        .bind(*idx as i64)
        .bind(bank.voltage)
        .bind(bank.current)
        .bind(bank.power)
        .bind(bank.apparent_power)
        .bind(bank.power_factor)
        .bind(device_id)
        .execute(&mut g.conn)
        .await?;
    }

    for (n, outlet) in &snapshot.outlets {
        sqlx::query(
            "INSERT INTO outlet_samples \
             (ts, outlet, state, current, power, energy, device_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(now)
        .bind(*n as i64)
        .bind(outlet.state.as_str())
        .bind(outlet.current)
        .bind(outlet.power)
        .bind(outlet.energy)
        .bind(device_id)
        .execute(&mut g.conn)
        .await?;
    }

    if let Some(env) = snapshot.environment.as_ref().filter(|e| e.sensor_present) {
        sqlx::query(
            "INSERT INTO environment_samples \
             (ts, temperature, humidity, contact_1, contact_2, contact_3, contact_4, device_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(now)
        .bind(env.temperature)
        .bind(env.humidity)
        .bind(env.contacts.get(&1).copied().unwrap_or(false) as i64)
        .bind(env.contacts.get(&2).copied().unwrap_or(false) as i64)
        .bind(env.contacts.get(&3).copied().unwrap_or(false) as i64)
        .bind(env.contacts.get(&4).copied().unwrap_or(false) as i64)
        .bind(device_id)
        .execute(&mut g.conn)
        .await?;
    }

    Ok(())
}

async fn commit(g: &mut HistoryInner) -> Result<()> {
    if g.in_txn {
        sqlx::query("COMMIT").execute(&mut g.conn).await?;
        g.in_txn = false;
    }
    Ok(())
}

async fn rollback(g: &mut HistoryInner) -> Result<()> {
    if g.in_txn {
        g.in_txn = false;
        sqlx::query("ROLLBACK").execute(&mut g.conn).await?;
    }
    Ok(())
}

fn report_row_to_json(row: sqlx::sqlite::SqliteRow) -> serde_json::Value {
    let raw_data: String = row.get("data");
    // Corrupt report JSON degrades to an empty object, never an error.
    let data = serde_json::from_str::<serde_json::Value>(&raw_data).unwrap_or_else(|_| {
        error!("corrupt report data for id={}", row.get::<i64, _>("id"));
        json!({})
    });
    json!({
        "id": row.get::<i64, _>("id"),
        "week_start": row.get::<String, _>("week_start"),
        "week_end": row.get::<String, _>("week_end"),
        "created_at": row.get::<String, _>("created_at"),
        "device_id": row.get::<String, _>("device_id"),
        "data": data,
    })
}

// ---------------------------------------------------------------------------
// Intervals and week arithmetic
// ---------------------------------------------------------------------------

/// Auto-select a downsampling bucket size for a query span.
pub fn pick_interval(start: i64, end: i64) -> i64 {
    let span = end - start;
    if span <= 3600 {
        1
    } else if span <= 6 * 3600 {
        10
    } else if span <= 24 * 3600 {
        60
    } else if span <= 7 * 86_400 {
        300
    } else if span <= 30 * 86_400 {
        900
    } else {
        1800
    }
}

/// The most recently completed Monday-through-Sunday week in local time.
/// Returns `(week_start, week_end)` dates; the week covers
/// `[week_start 00:00, week_end 00:00)`.
///
/// On Monday before 01:00 the target shifts back one extra week so a report
/// run at Monday midnight covers a fully recorded week.
pub fn last_complete_week(now: DateTime<Local>) -> (NaiveDate, NaiveDate) {
    let days_since_monday = now.weekday().num_days_from_monday() as i64;
    let last_monday = if days_since_monday == 0 && now.hour() < 1 {
        now - chrono::Duration::days(7)
    } else {
        now - chrono::Duration::days(days_since_monday)
    };
    let week_end = last_monday.date_naive();
    let week_start = week_end - chrono::Duration::days(7);
    (week_start, week_end)
}

fn local_midnight_ts(date: NaiveDate) -> i64 {
    let naive = NaiveDateTime::new(date, NaiveTime::MIN);
    match Local.from_local_datetime(&naive).earliest() {
        Some(dt) => dt.timestamp(),
        None => naive.and_utc().timestamp(),
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ===========================================================================
// Tests
// ===========================================================================
