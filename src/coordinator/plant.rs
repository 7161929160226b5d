use crate::archive::previous_month;
use crate::coordinator::commands::archive_day::ArchiveDay;
use crate::coordinator::commands::archive_events::ArchiveEvents;
use crate::coordinator::commands::archive_month::{ArchiveMonth, MonthOffsetProbe};
use crate::coordinator::commands::device_list::DeviceList;
use crate::coordinator::commands::identify::Identify;
use crate::coordinator::commands::logoff::Logoff;
use crate::coordinator::commands::logon::Logon;
use crate::coordinator::commands::read_data::ReadData;
use crate::coordinator::session::SessionState;
use crate::coordinator::PacketStats;
use crate::export::{self, DeviceInfo};
use crate::prelude::*;
use crate::registry::Registry;
use crate::sma::exchange::Exchange;
use crate::sma::lri::DataSet;

use chrono::{DateTime, Datelike, Days, NaiveDate, TimeZone};
use std::sync::{Arc, Mutex};

/// What one pass over the plant fetches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cycle {
    Live,
    Archive,
    Full,
}

impl Cycle {
    pub fn live(&self) -> bool {
        matches!(self, Cycle::Live | Cycle::Full)
    }

    pub fn archive(&self) -> bool {
        matches!(self, Cycle::Archive | Cycle::Full)
    }
}

/// An address to identify at the start of a pass, with the labels the
/// config attaches to whatever answers there.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    pub address: Address,
    pub name: Option<String>,
    pub array_names: Vec<String>,
}

impl Target {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            name: None,
            array_names: Vec::new(),
        }
    }

    pub fn from_inverter(inverter: &config::Inverter, connection: Connection) -> Result<Self> {
        Ok(Self {
            address: inverter.address(connection)?,
            name: inverter.name().map(str::to_string),
            array_names: inverter.array_names.clone(),
        })
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub user_group: UserGroup,
    pub password: String,
    pub archive_days: u32,
    pub archive_months: u32,
    pub archive_events_months: u32,
}

impl Settings {
    pub fn from_config(config: &ConfigWrapper) -> Self {
        Self {
            user_group: config.user_group(),
            password: config.password().to_string(),
            archive_days: config.archive_days(),
            archive_months: config.archive_months(),
            archive_events_months: config.archive_events_months(),
        }
    }
}

/// One session over every device reachable through a single exchange.
///
/// Failures are kept per device: a device that stops answering is logged,
/// counted and skipped for the rest of the pass while the others carry on.
pub struct Plant {
    pub registry: Registry,
    settings: Settings,
    exporters: Option<broadcast::Sender<export::ChannelData>>,
    stats: Arc<Mutex<PacketStats>>,
}

impl Plant {
    pub fn new(settings: Settings, stats: Arc<Mutex<PacketStats>>) -> Self {
        Self {
            registry: Registry::new(),
            settings,
            exporters: None,
            stats,
        }
    }

    pub fn with_exporters(mut self, exporters: broadcast::Sender<export::ChannelData>) -> Self {
        self.exporters = Some(exporters);
        self
    }

    pub async fn run<Tz: TimeZone>(
        &mut self,
        exchange: &mut Exchange<'_>,
        targets: &[Target],
        cycle: Cycle,
        now: DateTime<Tz>,
    ) -> Result<()> {
        self.identify(exchange, targets).await;
        if self.registry.is_empty() {
            return Err(ProtocolError::InitFailed("no device identified".to_string()).into());
        }

        self.logon(exchange).await;
        self.classify(exchange).await;
        self.enumerate_gateways(exchange).await;

        if cycle.live() {
            self.poll_live(exchange).await;
        }

        if cycle.archive() {
            self.fetch_days(exchange, now.date_naive(), &now.timezone()).await;
            self.fetch_months(exchange, now.year(), now.month(), now.timestamp())
                .await;
            self.fetch_events(exchange, now.year(), now.month()).await;
        }

        self.logoff(exchange).await;
        Ok(())
    }

    pub async fn identify(&mut self, exchange: &mut Exchange<'_>, targets: &[Target]) {
        for target in targets {
            match Identify::new(target.address).run(exchange).await {
                Ok(identity) => {
                    let index =
                        self.registry
                            .add(identity, target.address, DeviceClass::AllDevices, None);
                    if let Some(device) = self.registry.get_mut(index) {
                        device.state = device.state.identified();
                        if target.name.is_some() {
                            device.name = target.name.clone();
                        }
                        device.array_names = target.array_names.clone();
                    }
                }
                Err(e) => {
                    error!("{}: identification failed: {:#}", target.address, e);
                    if let Ok(mut stats) = self.stats.lock() {
                        stats.identify_failures += 1;
                    }
                }
            }
        }
    }

    /// Logs on every device that is identified but not yet authenticated.
    pub async fn logon(&mut self, exchange: &mut Exchange<'_>) {
        self.logon_from(exchange, 0).await;
    }

    /// A device that refuses the credentials is closed for the rest of the
    /// cycle and never asked again.
    async fn logon_from(&mut self, exchange: &mut Exchange<'_>, first: usize) {
        let group = self.settings.user_group;

        for index in first..self.registry.len() {
            let Some(device) = self.registry.get(index) else { continue };
            if device.state != SessionState::Identified {
                continue;
            }

            let command = Logon::new(device.identity, device.address, group, &self.settings.password);
            match command.run(exchange).await {
                Ok(()) => {
                    if let Some(device) = self.registry.get_mut(index) {
                        match device.state.authenticated() {
                            Ok(state) => {
                                device.state = state;
                                info!("{}: logged on as {:?}", device.label(), group);
                            }
                            Err(e) => warn!("{}: {}", device.label(), e),
                        }
                    }
                }
                Err(e) if ProtocolError::of(&e) == Some(&ProtocolError::InvalidPassword) => {
                    error!("{}: invalid password for {:?}", device_label(&self.registry, index), group);
                    if let Ok(mut stats) = self.stats.lock() {
                        stats.invalid_passwords += 1;
                    }
                    self.rejected(index);
                }
                Err(e) if matches!(ProtocolError::of(&e), Some(ProtocolError::LogonFailed(_))) => {
                    self.failed(index, "logon", &e);
                    self.rejected(index);
                }
                Err(e) => self.failed(index, "logon", &e),
            }
        }
    }

    /// Reads the type label of devices whose name and class are still unknown.
    pub async fn classify(&mut self, exchange: &mut Exchange<'_>) {
        for index in self.authenticated() {
            let Some(device) = self.registry.get_mut(index) else { continue };
            if !device.live.device_name.is_empty() {
                continue;
            }

            let command = ReadData::new(device.identity, device.address, vec![DataSet::TypeLabel]);
            let result = command.run(exchange, &mut device.live).await;

            match result {
                Ok(_) => {
                    if device.live.device_class != 0 {
                        device.class = DeviceClass::from(device.live.device_class);
                    }
                    debug!("{}: classified as {:?}", device.label(), device.class);
                }
                Err(e) => self.failed(index, "type label", &e),
            }
        }
    }

    /// Registers the devices behind every authenticated gateway and logs
    /// them on through it.
    pub async fn enumerate_gateways(&mut self, exchange: &mut Exchange<'_>) {
        let known = self.registry.len();

        for gateway in self.registry.gateways() {
            let Some(device) = self.registry.get(gateway) else { continue };
            if !device.state.is_authenticated() {
                continue;
            }
            let (identity, address) = (device.identity, device.address);

            match DeviceList::new(identity, address).run(exchange).await {
                Ok(children) => {
                    info!("{}: {} devices behind gateway", identity, children.len());
                    for child in children {
                        self.registry
                            .add(child.identity(), address, child.class(), Some(gateway));
                    }
                }
                Err(e) => self.failed(gateway, "device list", &e),
            }
        }

        if self.registry.len() > known {
            self.logon_from(exchange, known).await;
            self.classify(exchange).await;
        }
    }

    pub async fn poll_live(&mut self, exchange: &mut Exchange<'_>) {
        for index in self.authenticated() {
            let Some(device) = self.registry.get_mut(index) else { continue };

            let sets = DataSet::for_class(device.class);
            device.live.reset_readings();
            let command = ReadData::new(device.identity, device.address, sets);
            let result = command.run(exchange, &mut device.live).await;

            match result {
                Ok(missing) => {
                    if !missing.is_empty() {
                        debug!("{}: {} registers unanswered", device.label(), missing.len());
                    }
                    if let Ok(mut stats) = self.stats.lock() {
                        stats.live_polls += 1;
                    }
                    self.publish_live(index);
                }
                Err(e) => self.failed(index, "live poll", &e),
            }
        }
    }

    /// Day archives for today and the configured number of days before it.
    pub async fn fetch_days<Tz: TimeZone>(
        &mut self,
        exchange: &mut Exchange<'_>,
        today: NaiveDate,
        tz: &Tz,
    ) {
        for back in 0..self.settings.archive_days {
            let Some(date) = today.checked_sub_days(Days::new(back as u64)) else { break };

            for device in self.registry.devices_mut() {
                device.day = None;
            }

            for index in self.archive_targets() {
                let Some(device) = self.registry.get(index) else { continue };
                let command = ArchiveDay::new(device.identity, device.address, date);

                match command.run(exchange, tz.clone()).await {
                    Ok(day) => {
                        if let Some(device) = self.registry.get_mut(index) {
                            device.day = Some(day);
                        }
                    }
                    Err(e) => self.failed(index, "day archive", &e),
                }
            }

            self.registry.consolidate_gateways();

            let mut archives = Vec::new();
            for device in self.registry.devices() {
                if let Some(day) = device.day.as_ref().filter(|d| d.has_data) {
                    archives.push(export::ChannelData::Day(DeviceInfo::of(device), day.clone()));
                }
            }
            if let Ok(mut stats) = self.stats.lock() {
                stats.day_archives += archives.len() as u64;
            }
            archives.into_iter().for_each(|data| self.publish(data));
        }
    }

    /// Month archives for the current month and the configured number of
    /// months before it.
    pub async fn fetch_months(&mut self, exchange: &mut Exchange<'_>, year: i32, month: u32, now: i64) {
        if self.settings.archive_months == 0 {
            return;
        }

        for index in self.archive_targets() {
            let Some(device) = self.registry.get(index) else { continue };
            let probe = MonthOffsetProbe::new(device.identity, device.address);

            match probe.run(exchange, now).await {
                Ok(offset) => {
                    if let Some(device) = self.registry.get_mut(index) {
                        device.month_data_offset = offset;
                    }
                }
                Err(e) => debug!("{}: month offset probe failed: {:#}", device_label(&self.registry, index), e),
            }
        }

        let (mut year, mut month) = (year, month);
        for _ in 0..self.settings.archive_months {
            for device in self.registry.devices_mut() {
                device.month = None;
            }

            for index in self.archive_targets() {
                let Some(device) = self.registry.get(index) else { continue };
                let command = ArchiveMonth::new(
                    device.identity,
                    device.address,
                    year,
                    month,
                    device.month_data_offset,
                );

                match command.run(exchange).await {
                    Ok(archive) => {
                        if let Some(device) = self.registry.get_mut(index) {
                            device.month = Some(archive);
                        }
                    }
                    Err(e) => self.failed(index, "month archive", &e),
                }
            }

            self.registry.consolidate_gateways();

            let mut archives = Vec::new();
            for device in self.registry.devices() {
                if let Some(archive) = device.month.as_ref().filter(|m| m.has_data) {
                    archives.push(export::ChannelData::Month(DeviceInfo::of(device), archive.clone()));
                }
            }
            if let Ok(mut stats) = self.stats.lock() {
                stats.month_archives += archives.len() as u64;
            }
            archives.into_iter().for_each(|data| self.publish(data));

            (year, month) = previous_month(year, month);
        }
    }

    pub async fn fetch_events(&mut self, exchange: &mut Exchange<'_>, year: i32, month: u32) {
        let months = self.settings.archive_events_months;
        if months == 0 {
            return;
        }

        for index in self.archive_targets() {
            let Some(device) = self.registry.get(index) else { continue };
            let command = ArchiveEvents::new(
                device.identity,
                device.address,
                self.settings.user_group,
                (year, month),
                months,
            );

            match command.run(exchange).await {
                Ok(events) => {
                    if let Ok(mut stats) = self.stats.lock() {
                        stats.event_records += events.len() as u64;
                    }
                    let Some(device) = self.registry.get_mut(index) else { continue };
                    device.events = events;
                    if !device.events.is_empty() {
                        let data = export::ChannelData::Events(DeviceInfo::of(device), device.events.clone());
                        self.publish(data);
                    }
                }
                Err(e) if ProtocolError::of(&e) == Some(&ProtocolError::PrivilegeDenied) => {
                    warn!(
                        "{}: event log not readable as {:?}",
                        device_label(&self.registry, index),
                        self.settings.user_group
                    );
                }
                Err(e) => self.failed(index, "event log", &e),
            }
        }
    }

    /// Sends a logoff for every registered device, children included,
    /// whatever state its session reached.
    pub async fn logoff(&mut self, exchange: &mut Exchange<'_>) {
        for device in self.registry.devices_mut() {
            if let Err(e) = Logoff::new(device.address).run(exchange).await {
                warn!("{}: logoff failed: {:#}", device.label(), e);
            }
            device.state = device.state.logged_out();
        }
    }

    fn authenticated(&self) -> Vec<usize> {
        self.registry
            .devices()
            .iter()
            .filter(|d| d.state.is_authenticated())
            .map(|d| d.index)
            .collect()
    }

    // gateways get their archives summed from their children instead
    fn archive_targets(&self) -> Vec<usize> {
        self.registry
            .devices()
            .iter()
            .filter(|d| d.state.is_authenticated() && !d.is_gateway())
            .map(|d| d.index)
            .collect()
    }

    fn failed(&mut self, index: usize, what: &str, e: &anyhow::Error) {
        let Some(device) = self.registry.get_mut(index) else { return };
        error!("{}: {} failed: {:#}", device.label(), what, e);

        if matches!(
            ProtocolError::of(e),
            Some(ProtocolError::NoData) | Some(ProtocolError::CommunicationError(_))
        ) {
            device.state = device.state.lost();
        }

        let serial = device.identity.serial;
        if let Ok(mut stats) = self.stats.lock() {
            stats.device_failed(serial, format!("{} failed: {:#}", what, e));
        }
    }

    fn rejected(&mut self, index: usize) {
        if let Some(device) = self.registry.get_mut(index) {
            device.state = device.state.logged_out();
        }
    }

    fn publish_live(&self, index: usize) {
        let Some(device) = self.registry.get(index) else { return };
        let info = DeviceInfo::of(device);

        if device.class == DeviceClass::BatteryInverter {
            self.publish(export::ChannelData::Battery(
                info.clone(),
                device.live.timestamp,
                device.live.battery.clone(),
            ));
        }
        self.publish(export::ChannelData::Live(info, device.live.clone()));
    }

    fn publish(&self, data: export::ChannelData) {
        if let Some(exporters) = &self.exporters {
            // no exporter subscribed is fine
            let _ = exporters.send(data);
        }
    }
}

fn device_label(registry: &Registry, index: usize) -> String {
    registry
        .get(index)
        .map(|d| d.label())
        .unwrap_or_else(|| format!("device #{}", index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_parts() {
        assert!(Cycle::Live.live());
        assert!(!Cycle::Live.archive());
        assert!(Cycle::Archive.archive());
        assert!(!Cycle::Archive.live());
        assert!(Cycle::Full.live() && Cycle::Full.archive());
    }

    #[test]
    fn target_from_inverter() {
        let inverter = config::Inverter {
            enabled: true,
            host: Some("192.168.1.20".to_string()),
            bt_address: None,
            device: None,
            name: Some("garage".to_string()),
            array_names: vec!["west".to_string()],
        };

        let target = Target::from_inverter(&inverter, Connection::Speedwire).unwrap();
        assert_eq!(target.address, Address::unicast("192.168.1.20".parse().unwrap()));
        assert_eq!(target.name.as_deref(), Some("garage"));
        assert_eq!(target.array_names, vec!["west".to_string()]);

        assert!(Target::from_inverter(&inverter, Connection::Bluetooth).is_err());
    }
}
