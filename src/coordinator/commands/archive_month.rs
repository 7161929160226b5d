use crate::archive::{month_data_offset, month_start, month_window, MonthArchive, MonthReconstructor, DAY_SECS};
use crate::prelude::*;
use crate::sma::exchange::Exchange;
use crate::sma::lri::CMD_MONTH_ARCHIVE;
use crate::sma::packet::{Request, Telegram};
use crate::sma::records::ArchiveSample;

fn samples(destination: &Identity, telegrams: Vec<Telegram>) -> Vec<ArchiveSample> {
    let mut samples = Vec::new();
    for telegram in telegrams {
        if telegram.error_code() != 0 {
            debug!(
                "{} rejected month archive with error {:#06x}",
                destination,
                telegram.error_code()
            );
            continue;
        }
        samples.extend(ArchiveSample::parse_all(&telegram.payload));
    }
    samples
}

pub struct ArchiveMonth {
    destination: Identity,
    address: Address,
    year: i32,
    month: u32,
    offset: i64,
}

impl ArchiveMonth {
    pub fn new(destination: Identity, address: Address, year: i32, month: u32, offset: i64) -> Self {
        Self {
            destination,
            address,
            year,
            month,
            offset,
        }
    }

    pub async fn run(&self, exchange: &mut Exchange<'_>) -> Result<MonthArchive> {
        let (from, to) = month_window(month_start(self.year, self.month)?);
        info!(
            "reading month archive {}-{:02} of {}",
            self.year, self.month, self.destination
        );

        let request = Request::archive(self.destination, CMD_MONTH_ARCHIVE, from, to);
        let telegrams = exchange.request(&request, &self.address).await.map_err(|e| {
            e.context(format!(
                "month archive {}-{:02} from {}",
                self.year, self.month, self.destination
            ))
        })?;

        let mut reconstructor = MonthReconstructor::new(self.year, self.month, self.offset);
        for sample in samples(&self.destination, telegrams) {
            reconstructor.push(sample);
        }

        let archive = reconstructor.finish();
        if !archive.has_data {
            debug!("{}: {}", self.destination, ProtocolError::ArchiveNoData);
        }
        Ok(archive)
    }
}

/// Reads the last two days of the month archive to work out whether the
/// device stamps day totals one day late.
pub struct MonthOffsetProbe {
    destination: Identity,
    address: Address,
}

impl MonthOffsetProbe {
    pub fn new(destination: Identity, address: Address) -> Self {
        Self {
            destination,
            address,
        }
    }

    pub async fn run(&self, exchange: &mut Exchange<'_>, now: i64) -> Result<i64> {
        let request = Request::archive(
            self.destination,
            CMD_MONTH_ARCHIVE,
            (now - 2 * DAY_SECS) as u32,
            now as u32,
        );
        let telegrams = exchange.request(&request, &self.address).await?;

        let latest = samples(&self.destination, telegrams)
            .into_iter()
            .filter(|s| !s.is_nan())
            .map(|s| s.timestamp as i64)
            .max();

        let offset = match latest {
            Some(latest) => month_data_offset(latest, now),
            None => 0,
        };
        debug!("{}: month data offset {}", self.destination, offset);
        Ok(offset)
    }
}
