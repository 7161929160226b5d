use crate::prelude::*;
use crate::sma::inverter::Transport;
use crate::sma::packet::{DISCOVERY_REQUEST, ENERGY_METER_SIZES, SPEEDWIRE_PREAMBLE};

use std::net::IpAddr;
use std::time::Duration;

/// Multicasts the discovery datagram and collects every device that answers
/// within `timeout`.
pub struct Discover {
    timeout: Duration,
}

impl Discover {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn run(&self, transport: &mut dyn Transport) -> Result<Vec<IpAddr>> {
        info!("discovering speedwire devices on {}", Address::multicast());
        transport
            .send(&DISCOVERY_REQUEST, &Address::multicast())
            .await?;

        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut found = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            let Some(datagram) = transport.receive(remaining).await? else {
                break;
            };

            if ENERGY_METER_SIZES.contains(&datagram.bytes.len()) {
                trace!("ignoring energy meter datagram from {}", datagram.from);
                continue;
            }
            if !datagram.bytes.starts_with(&SPEEDWIRE_PREAMBLE[0..4])
                || datagram.bytes == DISCOVERY_REQUEST
            {
                continue;
            }

            if let Some(ip) = datagram.from.ip() {
                if !found.contains(&ip) {
                    info!("device answered discovery from {}", ip);
                    found.push(ip);
                }
            }
        }

        if found.is_empty() {
            return Err(ProtocolError::NoData.into());
        }
        Ok(found)
    }
}
