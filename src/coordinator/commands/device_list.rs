use crate::prelude::*;
use crate::sma::exchange::Exchange;
use crate::sma::lri::{CMD_DEVICE_LIST, DEVICE_LIST_FIRST, DEVICE_LIST_LAST};
use crate::sma::packet::Request;
use crate::sma::records::ChildEntry;

/// Lists the devices a gateway talks to on its side of the plant.
pub struct DeviceList {
    gateway: Identity,
    address: Address,
}

impl DeviceList {
    pub fn new(gateway: Identity, address: Address) -> Self {
        Self { gateway, address }
    }

    pub async fn run(&self, exchange: &mut Exchange<'_>) -> Result<Vec<ChildEntry>> {
        let request = Request::query(self.gateway, CMD_DEVICE_LIST, DEVICE_LIST_FIRST, DEVICE_LIST_LAST);
        let telegrams = exchange
            .request(&request, &self.address)
            .await
            .map_err(|e| e.context(format!("device list of gateway {}", self.gateway)))?;

        let mut children: Vec<ChildEntry> = Vec::new();
        for telegram in telegrams {
            if telegram.error_code() != 0 {
                warn!(
                    "gateway {} rejected device list with error {:#06x}",
                    self.gateway,
                    telegram.error_code()
                );
                continue;
            }
            for child in ChildEntry::parse_all(&telegram.payload) {
                if child.identity() != self.gateway && !children.contains(&child) {
                    children.push(child);
                }
            }
        }

        info!("gateway {} lists {} devices", self.gateway, children.len());
        Ok(children)
    }
}
