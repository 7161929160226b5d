use crate::archive::{DayArchive, MonthArchive};
use crate::prelude::*;
use crate::registry::Device;
use crate::sma::records::{BatterySnapshot, EventRecord, LiveSnapshot};

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

/// Static description of the device a piece of data belongs to.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub serial: u32,
    pub susy_id: u16,
    pub name: String,
    pub class: DeviceClass,
    pub address: Address,
    pub array_names: Vec<String>,
}

impl DeviceInfo {
    pub fn of(device: &Device) -> Self {
        let name = device
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| device.live.device_name.clone());

        Self {
            serial: device.identity.serial,
            susy_id: device.identity.susy_id,
            name,
            class: device.class,
            address: device.address,
            array_names: device.array_names.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub enum ChannelData {
    Live(DeviceInfo, LiveSnapshot),
    Battery(DeviceInfo, i64, BatterySnapshot),
    Day(DeviceInfo, DayArchive),
    Month(DeviceInfo, MonthArchive),
    Events(DeviceInfo, Vec<EventRecord>),
    Shutdown,
}

/// A destination for decoded plant data.
#[async_trait]
pub trait Exporter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn export_live(&self, device: &DeviceInfo, live: &LiveSnapshot) -> Result<()>;

    async fn export_day(&self, device: &DeviceInfo, day: &DayArchive) -> Result<()>;

    async fn export_month(&self, device: &DeviceInfo, month: &MonthArchive) -> Result<()>;

    async fn export_events(&self, device: &DeviceInfo, events: &[EventRecord]) -> Result<()>;

    async fn export_battery(
        &self,
        device: &DeviceInfo,
        timestamp: i64,
        battery: &BatterySnapshot,
    ) -> Result<()>;
}

pub async fn dispatch(exporter: &dyn Exporter, data: &ChannelData) -> Result<()> {
    match data {
        ChannelData::Live(device, live) => exporter.export_live(device, live).await,
        ChannelData::Battery(device, timestamp, battery) => {
            exporter.export_battery(device, *timestamp, battery).await
        }
        ChannelData::Day(device, day) => exporter.export_day(device, day).await,
        ChannelData::Month(device, month) => exporter.export_month(device, month).await,
        ChannelData::Events(device, events) => exporter.export_events(device, events).await,
        ChannelData::Shutdown => Ok(()),
    }
}

/// Feeds everything published on `receiver` to `exporter` until shutdown.
/// A failed export is logged and the next message is processed.
pub async fn run(
    exporter: Arc<dyn Exporter>,
    mut receiver: broadcast::Receiver<ChannelData>,
) -> Result<()> {
    info!("{} exporter started", exporter.name());

    loop {
        match receiver.recv().await {
            Ok(ChannelData::Shutdown) | Err(RecvError::Closed) => break,
            Ok(data) => {
                if let Err(e) = dispatch(exporter.as_ref(), &data).await {
                    error!("{} export failed: {:#}", exporter.name(), e);
                }
            }
            Err(RecvError::Lagged(n)) => {
                warn!("{} exporter fell behind, {} messages dropped", exporter.name(), n)
            }
        }
    }

    info!("{} exporter stopped", exporter.name());
    Ok(())
}
