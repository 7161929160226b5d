use crate::archive::{event_window, previous_month};
use crate::prelude::*;
use crate::sma::exchange::Exchange;
use crate::sma::lri::{CMD_EVENTS_INSTALLER, CMD_EVENTS_USER};
use crate::sma::packet::Request;
use crate::sma::records::EventRecord;

const PRIVILEGE_DENIED: u16 = 0x0017;

/// Walks the event log backward one calendar month per request, starting
/// at `year`/`month`, for at most `months` months.
pub struct ArchiveEvents {
    destination: Identity,
    address: Address,
    user_group: UserGroup,
    year: i32,
    month: u32,
    months: u32,
}

impl ArchiveEvents {
    pub fn new(
        destination: Identity,
        address: Address,
        user_group: UserGroup,
        (year, month): (i32, u32),
        months: u32,
    ) -> Self {
        Self {
            destination,
            address,
            user_group,
            year,
            month,
            months,
        }
    }

    fn command(&self) -> u32 {
        match self.user_group {
            UserGroup::User => CMD_EVENTS_USER,
            UserGroup::Installer => CMD_EVENTS_INSTALLER,
        }
    }

    pub async fn run(&self, exchange: &mut Exchange<'_>) -> Result<Vec<EventRecord>> {
        let mut events = Vec::new();
        let (mut year, mut month) = (self.year, self.month);

        for _ in 0..self.months.max(1) {
            match self.page(exchange, year, month, &mut events).await {
                Ok(()) => {}
                Err(e) if ProtocolError::of(&e) == Some(&ProtocolError::EndOfData) => {
                    debug!("{}: oldest event reached in {}-{:02}", self.destination, year, month);
                    break;
                }
                Err(e) => return Err(e),
            }
            (year, month) = previous_month(year, month);
        }

        events.sort_by_key(|e| e.datetime);
        info!("{}: {} events", self.destination, events.len());
        Ok(events)
    }

    /// Appends one month of events. Signals `EndOfData` once the first
    /// record the device ever logged has been seen.
    async fn page(
        &self,
        exchange: &mut Exchange<'_>,
        year: i32,
        month: u32,
        events: &mut Vec<EventRecord>,
    ) -> Result<()> {
        let (from, to) = event_window(year, month)?;
        debug!("reading events {}-{:02} of {}", year, month, self.destination);

        let request = Request::archive(self.destination, self.command(), from, to);
        let telegrams = exchange.request(&request, &self.address).await.map_err(|e| {
            e.context(format!("events {}-{:02} from {}", year, month, self.destination))
        })?;

        let mut oldest_seen = false;
        for telegram in telegrams {
            match telegram.error_code() {
                0 => {}
                PRIVILEGE_DENIED => return Err(ProtocolError::PrivilegeDenied.into()),
                code => {
                    debug!("{} rejected event request with error {:#06x}", self.destination, code);
                    continue;
                }
            }

            for event in EventRecord::parse_all(&telegram.payload) {
                oldest_seen |= event.is_first();
                events.push(event);
            }
        }

        if oldest_seen {
            return Err(ProtocolError::EndOfData.into());
        }
        Ok(())
    }
}
