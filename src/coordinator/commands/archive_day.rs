use crate::archive::{day_start, day_window, DayArchive, DayReconstructor};
use crate::prelude::*;
use crate::sma::exchange::Exchange;
use crate::sma::lri::CMD_DAY_ARCHIVE;
use crate::sma::packet::Request;
use crate::sma::records::ArchiveSample;

use chrono::{NaiveDate, TimeZone};

pub struct ArchiveDay {
    destination: Identity,
    address: Address,
    date: NaiveDate,
}

impl ArchiveDay {
    pub fn new(destination: Identity, address: Address, date: NaiveDate) -> Self {
        Self {
            destination,
            address,
            date,
        }
    }

    pub async fn run<Tz: TimeZone>(&self, exchange: &mut Exchange<'_>, tz: Tz) -> Result<DayArchive> {
        let (from, to) = day_window(day_start(self.date, &tz)?);
        info!("reading day archive {} of {}", self.date, self.destination);

        let request = Request::archive(self.destination, CMD_DAY_ARCHIVE, from, to);
        let telegrams = exchange
            .request(&request, &self.address)
            .await
            .map_err(|e| e.context(format!("day archive {} from {}", self.date, self.destination)))?;

        let mut reconstructor = DayReconstructor::new(self.date, tz);
        for telegram in telegrams {
            if telegram.error_code() != 0 {
                debug!(
                    "{} rejected day archive with error {:#06x}",
                    self.destination,
                    telegram.error_code()
                );
                continue;
            }
            for sample in ArchiveSample::parse_all(&telegram.payload) {
                reconstructor.push(sample);
            }
        }

        let archive = reconstructor.finish();
        if !archive.has_data {
            debug!("{}: {}", self.destination, ProtocolError::ArchiveNoData);
        }
        Ok(archive)
    }
}
