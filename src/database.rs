use crate::archive::{DayArchive, MonthArchive};
use crate::coordinator::PacketStats;
use crate::export::{DeviceInfo, Exporter};
use crate::prelude::*;
use crate::sma::records::{BatterySnapshot, EventRecord, LiveSnapshot};

use async_trait::async_trait;
use sqlx::{any::AnyPoolOptions, Any, Pool};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DatabaseType {
    MySQL,
    Postgres,
    SQLite,
}

#[derive(Clone, Debug)]
enum Value {
    Int(i64),
    Real(f64),
    Text(String),
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS spot_data (
        timestamp BIGINT NOT NULL, serial BIGINT NOT NULL, name VARCHAR(64),
        status BIGINT, grid_relay BIGINT, pac_total BIGINT, pac1 BIGINT, pac2 BIGINT, pac3 BIGINT,
        uac1 DOUBLE PRECISION, uac2 DOUBLE PRECISION, uac3 DOUBLE PRECISION,
        iac1 DOUBLE PRECISION, iac2 DOUBLE PRECISION, iac3 DOUBLE PRECISION,
        frequency DOUBLE PRECISION, pdc_total BIGINT, pdc1 BIGINT, pdc2 BIGINT,
        udc1 DOUBLE PRECISION, udc2 DOUBLE PRECISION, idc1 DOUBLE PRECISION, idc2 DOUBLE PRECISION,
        efficiency DOUBLE PRECISION, e_today BIGINT, e_total BIGINT,
        operation_time BIGINT, feed_in_time BIGINT, temperature DOUBLE PRECISION)",
    "CREATE TABLE IF NOT EXISTS day_data (
        timestamp BIGINT NOT NULL, serial BIGINT NOT NULL, total_wh BIGINT, watt BIGINT)",
    "CREATE TABLE IF NOT EXISTS month_data (
        timestamp BIGINT NOT NULL, serial BIGINT NOT NULL, total_wh BIGINT, day_wh BIGINT)",
    "CREATE TABLE IF NOT EXISTS event_data (
        datetime BIGINT NOT NULL, serial BIGINT NOT NULL, entry_id BIGINT, susy_id BIGINT,
        event_code BIGINT, event_flags BIGINT, event_group BIGINT, tag BIGINT, counter BIGINT,
        parameter BIGINT, new_value BIGINT, old_value BIGINT)",
    "CREATE TABLE IF NOT EXISTS battery_data (
        timestamp BIGINT NOT NULL, serial BIGINT NOT NULL, charge_status BIGINT,
        temperature DOUBLE PRECISION, voltage DOUBLE PRECISION, current DOUBLE PRECISION,
        charge_cycles BIGINT, amp_hours_in BIGINT, amp_hours_out BIGINT)",
];

/// Relational exporter over any database sqlx can reach from a URL.
#[derive(Clone, Debug)]
pub struct Database {
    config: config::Database,
    pool: Arc<RwLock<Option<Pool<Any>>>>,
    shared_stats: Arc<Mutex<PacketStats>>,
}

impl Database {
    pub fn new(config: config::Database, shared_stats: Arc<Mutex<PacketStats>>) -> Self {
        Self {
            config,
            pool: Arc::new(RwLock::new(None)),
            shared_stats,
        }
    }

    /// Connects and creates the tables.
    pub async fn start(&self) -> Result<()> {
        info!("initializing database {}", self.config.url());
        self.connect().await?;
        self.migrate().await?;
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
        }
    }

    fn database(&self) -> Result<DatabaseType> {
        let prefix: Vec<&str> = self.config.url().splitn(2, ':').collect();
        match prefix[0] {
            "sqlite" => Ok(DatabaseType::SQLite),
            "mysql" => Ok(DatabaseType::MySQL),
            "postgres" | "postgresql" => Ok(DatabaseType::Postgres),
            _ => Err(anyhow!("database.rs:unsupported database {}", self.config.url())),
        }
    }

    async fn connect(&self) -> Result<()> {
        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(self.config.url())
            .await?;
        *self.pool.write().await = Some(pool);
        Ok(())
    }

    pub async fn connection(&self) -> Result<Pool<Any>> {
        if let Some(pool) = &*self.pool.read().await {
            return Ok(pool.clone());
        }

        self.start().await?;
        match &*self.pool.read().await {
            Some(pool) => Ok(pool.clone()),
            None => Err(anyhow!("database.rs:Database not connected")),
        }
    }

    async fn migrate(&self) -> Result<()> {
        let pool = self
            .pool
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("database.rs:Database not connected"))?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(())
    }

    fn placeholders(&self, count: usize) -> Result<String> {
        let marks: Vec<String> = match self.database()? {
            DatabaseType::Postgres => (1..=count).map(|i| format!("${}", i)).collect(),
            _ => vec!["?".to_string(); count],
        };
        Ok(format!("({})", marks.join(", ")))
    }

    async fn insert(&self, table: &str, columns: &[&str], rows: Vec<Vec<Value>>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let query = format!(
            "INSERT INTO {} ({}) VALUES {}",
            table,
            columns.join(", "),
            self.placeholders(columns.len())?
        );
        let pool = self.connection().await?;
        let mut tx = pool.begin().await?;

        for row in rows {
            let mut q = sqlx::query(&query);
            for value in row {
                q = match value {
                    Value::Int(v) => q.bind(v),
                    Value::Real(v) => q.bind(v),
                    Value::Text(v) => q.bind(v),
                };
            }
            if let Err(err) = q.execute(&mut *tx).await {
                if let Ok(mut stats) = self.shared_stats.lock() {
                    stats.database_errors += 1;
                }
                return Err(err.into());
            }
        }
        tx.commit().await?;

        if let Ok(mut stats) = self.shared_stats.lock() {
            stats.database_writes += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl Exporter for Database {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn export_live(&self, device: &DeviceInfo, live: &LiveSnapshot) -> Result<()> {
        use Value::*;

        let mut row = vec![
            Int(live.timestamp),
            Int(device.serial as i64),
            Text(device.name.clone()),
            Int(live.device_status as i64),
            Int(live.grid_relay_status as i64),
            Int(live.pac_total as i64),
        ];
        row.extend(live.ac.iter().map(|p| Int(p.power as i64)));
        row.extend(live.ac.iter().map(|p| Real(p.voltage)));
        row.extend(live.ac.iter().map(|p| Real(p.current)));
        row.push(Real(live.grid_frequency));
        row.push(Int(live.pdc_total as i64));
        row.extend(live.dc.iter().map(|d| Int(d.power as i64)));
        row.extend(live.dc.iter().map(|d| Real(d.voltage)));
        row.extend(live.dc.iter().map(|d| Real(d.current)));
        row.extend([
            Real(live.efficiency),
            Int(live.e_today as i64),
            Int(live.e_total as i64),
            Int(live.operation_time as i64),
            Int(live.feed_in_time as i64),
            Real(live.temperature),
        ]);

        self.insert(
            "spot_data",
            &[
                "timestamp", "serial", "name", "status", "grid_relay", "pac_total", "pac1", "pac2",
                "pac3", "uac1", "uac2", "uac3", "iac1", "iac2", "iac3", "frequency", "pdc_total",
                "pdc1", "pdc2", "udc1", "udc2", "idc1", "idc2", "efficiency", "e_today", "e_total",
                "operation_time", "feed_in_time", "temperature",
            ],
            vec![row],
        )
        .await
    }

    async fn export_day(&self, device: &DeviceInfo, day: &DayArchive) -> Result<()> {
        let rows = day
            .filled()
            .map(|(_, s)| {
                vec![
                    Value::Int(s.timestamp),
                    Value::Int(device.serial as i64),
                    Value::Int(s.total_wh as i64),
                    Value::Int(s.watt),
                ]
            })
            .collect();

        self.insert("day_data", &["timestamp", "serial", "total_wh", "watt"], rows)
            .await
    }

    async fn export_month(&self, device: &DeviceInfo, month: &MonthArchive) -> Result<()> {
        let rows = month
            .filled()
            .map(|(_, s)| {
                vec![
                    Value::Int(s.timestamp),
                    Value::Int(device.serial as i64),
                    Value::Int(s.total_wh as i64),
                    Value::Int(s.day_wh as i64),
                ]
            })
            .collect();

        self.insert("month_data", &["timestamp", "serial", "total_wh", "day_wh"], rows)
            .await
    }

    async fn export_events(&self, _device: &DeviceInfo, events: &[EventRecord]) -> Result<()> {
        let rows = events
            .iter()
            .map(|e| {
                [
                    e.datetime as i64,
                    e.serial as i64,
                    e.entry_id as i64,
                    e.susy_id as i64,
                    e.event_code as i64,
                    e.event_flags as i64,
                    e.group as i64,
                    e.tag as i64,
                    e.counter as i64,
                    e.parameter as i64,
                    e.new_value as i64,
                    e.old_value as i64,
                ]
                .into_iter()
                .map(Value::Int)
                .collect()
            })
            .collect();

        self.insert(
            "event_data",
            &[
                "datetime", "serial", "entry_id", "susy_id", "event_code", "event_flags",
                "event_group", "tag", "counter", "parameter", "new_value", "old_value",
            ],
            rows,
        )
        .await
    }

    async fn export_battery(
        &self,
        device: &DeviceInfo,
        timestamp: i64,
        battery: &BatterySnapshot,
    ) -> Result<()> {
        use Value::*;

        self.insert(
            "battery_data",
            &[
                "timestamp", "serial", "charge_status", "temperature", "voltage", "current",
                "charge_cycles", "amp_hours_in", "amp_hours_out",
            ],
            vec![vec![
                Int(timestamp),
                Int(device.serial as i64),
                Int(battery.charge_status as i64),
                Real(battery.temperature),
                Real(battery.voltage),
                Real(battery.current),
                Int(battery.charge_cycles as i64),
                Int(battery.amp_hours_in as i64),
                Int(battery.amp_hours_out as i64),
            ]],
        )
        .await
    }
}
