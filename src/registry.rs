use crate::archive::{DayArchive, MonthArchive};
use crate::coordinator::session::SessionState;
use crate::prelude::*;
use crate::sma::records::{EventRecord, LiveSnapshot};

#[derive(Clone, Debug)]
pub struct Device {
    pub index: usize,
    pub identity: Identity,
    pub address: Address,
    pub class: DeviceClass,
    /// Registry index of the gateway this device sits behind.
    pub gateway_index: Option<usize>,
    pub state: SessionState,
    pub name: Option<String>,
    pub array_names: Vec<String>,
    pub live: LiveSnapshot,
    pub day: Option<DayArchive>,
    pub month: Option<MonthArchive>,
    pub events: Vec<EventRecord>,
    pub month_data_offset: i64,
}

impl Device {
    pub fn new(index: usize, identity: Identity, address: Address, class: DeviceClass) -> Self {
        Self {
            index,
            identity,
            address,
            class,
            gateway_index: None,
            state: SessionState::Identified,
            name: None,
            array_names: Vec::new(),
            live: LiveSnapshot::default(),
            day: None,
            month: None,
            events: Vec::new(),
            month_data_offset: 0,
        }
    }

    pub fn is_gateway(&self) -> bool {
        self.class.is_gateway()
    }

    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{} ({})", name, self.identity),
            None if !self.live.device_name.is_empty() => {
                format!("{} ({})", self.live.device_name, self.identity)
            }
            None => self.identity.to_string(),
        }
    }
}

/// All devices of the plant, in discovery order.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    devices: Vec<Device>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a device unless its identity is already known; returns its index.
    pub fn add(
        &mut self,
        identity: Identity,
        address: Address,
        class: DeviceClass,
        gateway_index: Option<usize>,
    ) -> usize {
        if let Some(existing) = self.devices.iter_mut().find(|d| d.identity == identity) {
            existing.address = address;
            if gateway_index.is_some() {
                existing.gateway_index = gateway_index;
            }
            return existing.index;
        }

        let index = self.devices.len();
        let mut device = Device::new(index, identity, address, class);
        device.gateway_index = gateway_index;
        info!(
            "registered device {} {:?} at {}{}",
            identity,
            class,
            address,
            gateway_index
                .map(|g| format!(" behind gateway {}", g))
                .unwrap_or_default()
        );
        self.devices.push(device);
        index
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Device> {
        self.devices.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Device> {
        self.devices.get_mut(index)
    }

    pub fn find(&self, identity: &Identity) -> Option<&Device> {
        self.devices.iter().find(|d| d.identity == *identity)
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut [Device] {
        &mut self.devices
    }

    pub fn gateways(&self) -> Vec<usize> {
        self.devices
            .iter()
            .filter(|d| d.is_gateway())
            .map(|d| d.index)
            .collect()
    }

    /// Every device tagged with `gateway`, wherever it sits in the registry.
    pub fn children_of(&self, gateway: usize) -> impl Iterator<Item = &Device> {
        self.devices
            .iter()
            .filter(move |d| d.gateway_index == Some(gateway))
    }

    /// Replaces each gateway's day and month archives with the slot-wise
    /// sum over its children. Run once all devices have been fetched.
    pub fn consolidate_gateways(&mut self) {
        for gateway in self.gateways() {
            let day = self.sum_days(gateway);
            let month = self.sum_months(gateway);

            if let Some(device) = self.devices.get_mut(gateway) {
                if day.is_some() {
                    device.day = day;
                }
                if month.is_some() {
                    device.month = month;
                }
            }
        }
    }

    fn sum_days(&self, gateway: usize) -> Option<DayArchive> {
        let mut total: Option<DayArchive> = None;

        for child in self.children_of(gateway) {
            let Some(day) = &child.day else { continue };
            let sum = total.get_or_insert_with(|| DayArchive::new(day.date));

            for (slot, part) in sum.slots.iter_mut().zip(&day.slots) {
                slot.total_wh += part.total_wh;
                slot.watt += part.watt;
                if part.timestamp != 0 {
                    slot.timestamp = part.timestamp;
                }
            }
            sum.has_data |= day.has_data;
            sum.missing_records = sum.missing_records.max(day.missing_records);
        }

        total
    }

    fn sum_months(&self, gateway: usize) -> Option<MonthArchive> {
        let mut total: Option<MonthArchive> = None;

        for child in self.children_of(gateway) {
            let Some(month) = &child.month else { continue };
            let sum = total.get_or_insert_with(|| MonthArchive::new(month.year, month.month));

            for (slot, part) in sum.slots.iter_mut().zip(&month.slots) {
                slot.total_wh += part.total_wh;
                slot.day_wh += part.day_wh;
                if part.timestamp != 0 {
                    slot.timestamp = part.timestamp;
                }
            }
            sum.has_data |= month.has_data;
        }

        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::DaySlot;
    use chrono::NaiveDate;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(last: u8) -> Address {
        Address::unicast(IpAddr::V4(Ipv4Addr::new(192, 168, 1, last)))
    }

    fn day_with(idx: usize, timestamp: i64, watt: i64) -> DayArchive {
        let mut day = DayArchive::new(NaiveDate::from_ymd_opt(2024, 6, 15).unwrap());
        day.slots[idx] = DaySlot {
            timestamp,
            total_wh: watt as u64,
            watt,
        };
        day.has_data = true;
        day
    }

    #[test]
    fn add_deduplicates_by_identity() {
        let mut registry = Registry::new();
        let a = registry.add(Identity::new(0x83, 1), addr(10), DeviceClass::SolarInverter, None);
        let b = registry.add(Identity::new(0x83, 1), addr(11), DeviceClass::SolarInverter, None);

        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(a).unwrap().address, addr(11));
    }

    #[test]
    fn gateway_sums_children() {
        let mut registry = Registry::new();
        let gw = registry.add(Identity::new(0xA0, 1), addr(2), DeviceClass::CommunicationProduct, None);
        let c1 = registry.add(Identity::new(0x83, 2), addr(2), DeviceClass::SolarInverter, Some(gw));
        let c2 = registry.add(Identity::new(0x83, 3), addr(2), DeviceClass::SolarInverter, Some(gw));

        registry.get_mut(c1).unwrap().day = Some(day_with(100, 1_000, 100));
        registry.get_mut(c2).unwrap().day = Some(day_with(100, 2_000, 150));
        registry.consolidate_gateways();

        let day = registry.get(gw).unwrap().day.clone().unwrap();
        assert_eq!(day.slots[100].watt, 250);
        assert_eq!(day.slots[100].total_wh, 250);
        assert_eq!(day.slots[100].timestamp, 2_000);
        assert!(day.has_data);
    }

    #[test]
    fn every_gateway_finds_its_children() {
        let mut registry = Registry::new();
        let gw1 = registry.add(Identity::new(0xA0, 1), addr(2), DeviceClass::CommunicationProduct, None);
        let gw2 = registry.add(Identity::new(0xA0, 2), addr(3), DeviceClass::CommunicationProduct, None);
        let a = registry.add(Identity::new(0x83, 10), addr(2), DeviceClass::SolarInverter, Some(gw1));
        let b = registry.add(Identity::new(0x83, 20), addr(3), DeviceClass::SolarInverter, Some(gw2));
        let c = registry.add(Identity::new(0x83, 21), addr(3), DeviceClass::SolarInverter, Some(gw2));
        let d = registry.add(Identity::new(0x83, 11), addr(2), DeviceClass::SolarInverter, Some(gw1));

        for (idx, watt) in [(a, 10), (b, 20), (c, 30), (d, 40)] {
            registry.get_mut(idx).unwrap().day = Some(day_with(5, 500, watt));
        }
        registry.consolidate_gateways();

        assert_eq!(registry.gateways(), vec![gw1, gw2]);
        assert_eq!(registry.children_of(gw2).count(), 2);
        assert_eq!(registry.get(gw1).unwrap().day.as_ref().unwrap().slots[5].watt, 50);
        assert_eq!(registry.get(gw2).unwrap().day.as_ref().unwrap().slots[5].watt, 50);
    }

    #[test]
    fn gateway_without_child_archives_is_untouched() {
        let mut registry = Registry::new();
        let gw = registry.add(Identity::new(0xA0, 1), addr(2), DeviceClass::CommunicationProduct, None);
        registry.add(Identity::new(0x83, 2), addr(2), DeviceClass::SolarInverter, Some(gw));
        registry.consolidate_gateways();

        assert!(registry.get(gw).unwrap().day.is_none());
    }
}
