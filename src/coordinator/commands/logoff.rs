use crate::prelude::*;
use crate::sma::exchange::Exchange;
use crate::sma::packet::Request;

/// Ends the session. Devices do not answer a logoff, so nothing is read.
pub struct Logoff {
    address: Address,
}

impl Logoff {
    pub fn new(address: Address) -> Self {
        Self { address }
    }

    pub async fn run(&self, exchange: &mut Exchange<'_>) -> Result<()> {
        debug!("logging off at {}", self.address);
        exchange
            .send(&Request::logoff(Identity::ANY), &self.address)
            .await?;
        Ok(())
    }
}
