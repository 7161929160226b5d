use crate::prelude::*;
use crate::sma::exchange::Exchange;
use crate::sma::lri::DataSet;
use crate::sma::packet::Request;
use crate::sma::records::{self, LiveSnapshot};

use std::collections::HashSet;

const PRIVILEGE_DENIED: u16 = 0x0017;

/// Polls a list of data sets from one device into its live snapshot.
pub struct ReadData {
    destination: Identity,
    address: Address,
    sets: Vec<DataSet>,
}

impl ReadData {
    pub fn new(destination: Identity, address: Address, sets: Vec<DataSet>) -> Self {
        Self {
            destination,
            address,
            sets,
        }
    }

    /// Returns the register ids that were asked for but never answered.
    /// A set the device rejects is skipped; a set that gets no reply at all
    /// aborts the poll.
    pub async fn run(
        &self,
        exchange: &mut Exchange<'_>,
        snapshot: &mut LiveSnapshot,
    ) -> Result<HashSet<u32>> {
        let mut pending: HashSet<u32> = self
            .sets
            .iter()
            .flat_map(|set| set.lris().iter().map(|lri| u32::from(*lri)))
            .collect();

        for set in &self.sets {
            let (command, first, last) = set.request();
            let request = Request::query(self.destination, command, first, last);

            let telegrams = exchange
                .request(&request, &self.address)
                .await
                .map_err(|e| e.context(format!("{:?} from {}", set, self.destination)))?;

            for telegram in telegrams {
                match telegram.error_code() {
                    0 => {}
                    PRIVILEGE_DENIED => {
                        debug!("{} denies {:?} to this user group", self.destination, set);
                        continue;
                    }
                    code => {
                        debug!("{} rejected {:?} with error {:#06x}", self.destination, set, code);
                        continue;
                    }
                }

                let applied = records::decode(&telegram.payload, snapshot, &mut pending)?;
                trace!("{:?}: applied {} registers", set, applied.len());
            }
        }

        snapshot.derive_totals();

        if !pending.is_empty() {
            let mut missing: Vec<_> = pending.iter().map(|l| format!("{:#010x}", l)).collect();
            missing.sort();
            debug!("{} left {} registers unanswered: {}", self.destination, missing.len(), missing.join(", "));
        }

        Ok(pending)
    }
}
