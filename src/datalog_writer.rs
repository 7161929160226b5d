use crate::archive::{DayArchive, MonthArchive};
use crate::export::{DeviceInfo, Exporter};
use crate::prelude::*;
use crate::sma::records::{BatterySnapshot, EventRecord, LiveSnapshot};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const LIVE_HEADER: &[&str] = &[
    "timestamp", "serial", "name", "status", "grid_relay", "pac_total", "pac1", "pac2", "pac3",
    "uac1", "uac2", "uac3", "iac1", "iac2", "iac3", "frequency", "pdc_total", "pdc1", "pdc2",
    "udc1", "udc2", "idc1", "idc2", "efficiency", "e_today", "e_total", "operation_time",
    "feed_in_time", "temperature",
];
const DAY_HEADER: &[&str] = &["timestamp", "serial", "total_wh", "watt"];
const MONTH_HEADER: &[&str] = &["date", "serial", "total_wh", "day_wh"];
const EVENT_HEADER: &[&str] = &[
    "datetime", "serial", "entry_id", "event_code", "event_flags", "group", "tag", "counter",
    "parameter", "new_value", "old_value",
];
const BATTERY_HEADER: &[&str] = &[
    "timestamp", "serial", "charge_status", "temperature", "voltage", "current", "charge_cycles",
    "amp_hours_in", "amp_hours_out",
];

fn iso(timestamp: i64) -> String {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_default()
}

/// Delimited-text exporter: one file per device and data kind under
/// `directory`, with a header row written when the file is created.
#[derive(Debug, Clone)]
pub struct DatalogWriter {
    directory: PathBuf,
    delimiter: char,
    rows_written: Arc<Mutex<u64>>,
}

impl DatalogWriter {
    pub fn new(config: &config::Datalog) -> Result<Self> {
        Self::with_directory(config.directory(), config.delimiter())
    }

    pub fn with_directory<P: AsRef<Path>>(directory: P, delimiter: char) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        info!("Writing datalog files to {}", directory.display());

        std::fs::create_dir_all(&directory)
            .map_err(|e| file_error_with_source!(e, "failed to create {}", directory.display()))?;

        Ok(Self {
            directory,
            delimiter,
            rows_written: Arc::new(Mutex::new(0)),
        })
    }

    pub fn path(&self, device: &DeviceInfo, kind: &str) -> PathBuf {
        self.directory.join(format!("{}-{}.csv", device.serial, kind))
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written.lock().map(|n| *n).unwrap_or(0)
    }

    fn write_rows(&self, path: &Path, header: &[&str], rows: &[Vec<String>], replace: bool) -> Result<()> {
        let fresh = replace || !path.exists();

        let mut options = OpenOptions::new();
        options.create(true);
        if replace {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        let mut file = options
            .open(path)
            .map_err(|e| file_error_with_source!(e, "failed to open {}", path.display()))?;

        let delimiter = self.delimiter.to_string();
        if fresh {
            writeln!(file, "{}", header.join(&delimiter))?;
        }
        for row in rows {
            writeln!(file, "{}", row.join(&delimiter))?;
        }
        file.flush()?;

        let mut written = self
            .rows_written
            .lock()
            .map_err(|_| anyhow!("Failed to lock rows counter"))?;
        *written += rows.len() as u64;
        debug!("{} rows written to {}", rows.len(), path.display());

        Ok(())
    }
}

#[async_trait]
impl Exporter for DatalogWriter {
    fn name(&self) -> &'static str {
        "datalog"
    }

    async fn export_live(&self, device: &DeviceInfo, live: &LiveSnapshot) -> Result<()> {
        let mut row = vec![
            iso(live.timestamp),
            device.serial.to_string(),
            device.name.clone(),
            live.device_status.to_string(),
            live.grid_relay_status.to_string(),
            live.pac_total.to_string(),
        ];
        row.extend(live.ac.iter().map(|p| p.power.to_string()));
        row.extend(live.ac.iter().map(|p| format!("{:.2}", p.voltage)));
        row.extend(live.ac.iter().map(|p| format!("{:.3}", p.current)));
        row.push(format!("{:.2}", live.grid_frequency));
        row.push(live.pdc_total.to_string());
        row.extend(live.dc.iter().map(|d| d.power.to_string()));
        row.extend(live.dc.iter().map(|d| format!("{:.2}", d.voltage)));
        row.extend(live.dc.iter().map(|d| format!("{:.3}", d.current)));
        row.push(format!("{:.2}", live.efficiency));
        row.push(live.e_today.to_string());
        row.push(live.e_total.to_string());
        row.push(live.operation_time.to_string());
        row.push(live.feed_in_time.to_string());
        row.push(format!("{:.2}", live.temperature));

        self.write_rows(&self.path(device, "live"), LIVE_HEADER, &[row], false)
    }

    async fn export_day(&self, device: &DeviceInfo, day: &DayArchive) -> Result<()> {
        let rows: Vec<Vec<String>> = day
            .filled()
            .map(|(_, slot)| {
                vec![
                    iso(slot.timestamp),
                    device.serial.to_string(),
                    slot.total_wh.to_string(),
                    slot.watt.to_string(),
                ]
            })
            .collect();

        let kind = format!("day-{}", day.date.format("%Y%m%d"));
        self.write_rows(&self.path(device, &kind), DAY_HEADER, &rows, true)
    }

    async fn export_month(&self, device: &DeviceInfo, month: &MonthArchive) -> Result<()> {
        let rows: Vec<Vec<String>> = month
            .filled()
            .map(|(_, slot)| {
                vec![
                    iso(slot.timestamp).chars().take(10).collect(),
                    device.serial.to_string(),
                    slot.total_wh.to_string(),
                    slot.day_wh.to_string(),
                ]
            })
            .collect();

        let kind = format!("month-{}{:02}", month.year, month.month);
        self.write_rows(&self.path(device, &kind), MONTH_HEADER, &rows, true)
    }

    async fn export_events(&self, device: &DeviceInfo, events: &[EventRecord]) -> Result<()> {
        let rows: Vec<Vec<String>> = events
            .iter()
            .map(|e| {
                vec![
                    iso(e.datetime as i64),
                    e.serial.to_string(),
                    e.entry_id.to_string(),
                    e.event_code.to_string(),
                    format!("{:#06x}", e.event_flags),
                    e.group.to_string(),
                    e.tag.to_string(),
                    e.counter.to_string(),
                    e.parameter.to_string(),
                    e.new_value.to_string(),
                    e.old_value.to_string(),
                ]
            })
            .collect();

        self.write_rows(&self.path(device, "events"), EVENT_HEADER, &rows, false)
    }

    async fn export_battery(
        &self,
        device: &DeviceInfo,
        timestamp: i64,
        battery: &BatterySnapshot,
    ) -> Result<()> {
        let row = vec![
            iso(timestamp),
            device.serial.to_string(),
            battery.charge_status.to_string(),
            format!("{:.2}", battery.temperature),
            format!("{:.2}", battery.voltage),
            format!("{:.3}", battery.current),
            battery.charge_cycles.to_string(),
            battery.amp_hours_in.to_string(),
            battery.amp_hours_out.to_string(),
        ];

        self.write_rows(&self.path(device, "battery"), BATTERY_HEADER, &[row], false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::DaySlot;
    use chrono::NaiveDate;

    fn device() -> DeviceInfo {
        DeviceInfo {
            serial: 2_100_000_001,
            susy_id: 0x83,
            name: "roof".to_string(),
            class: DeviceClass::SolarInverter,
            address: Address::Bluetooth(BtAddress::UNKNOWN),
            array_names: Vec::new(),
        }
    }

    #[tokio::test]
    async fn live_rows_append_under_one_header() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let writer = DatalogWriter::with_directory(dir.path(), ';')?;

        let mut live = LiveSnapshot {
            timestamp: 1_700_000_000,
            pac_total: 1234,
            ..Default::default()
        };
        writer.export_live(&device(), &live).await?;
        live.pac_total = 1500;
        writer.export_live(&device(), &live).await?;

        let contents = std::fs::read_to_string(writer.path(&device(), "live"))?;
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp;serial;name;"));
        assert!(lines[1].starts_with("2023-11-14T22:13:20Z;2100000001;roof;0;0;1234;"));
        assert_eq!(writer.rows_written(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn day_file_holds_filled_slots_only() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let writer = DatalogWriter::with_directory(dir.path(), ',')?;

        let mut day = DayArchive::new(NaiveDate::from_ymd_opt(2024, 6, 15).unwrap());
        day.slots[120] = DaySlot {
            timestamp: 1_718_445_600,
            total_wh: 5_000,
            watt: 1_800,
        };
        writer.export_day(&device(), &day).await?;
        // a second export replaces the file
        writer.export_day(&device(), &day).await?;

        let contents = std::fs::read_to_string(writer.path(&device(), "day-20240615"))?;
        assert_eq!(
            contents,
            "timestamp,serial,total_wh,watt\n2024-06-15T10:00:00Z,2100000001,5000,1800\n"
        );
        Ok(())
    }
}
