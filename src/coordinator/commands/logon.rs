use crate::prelude::*;
use crate::sma::exchange::Exchange;
use crate::sma::packet::Request;

const INVALID_PASSWORD: u16 = 0x0100;

pub struct Logon {
    destination: Identity,
    address: Address,
    user_group: UserGroup,
    password: String,
}

impl Logon {
    pub fn new(destination: Identity, address: Address, user_group: UserGroup, password: &str) -> Self {
        Self {
            destination,
            address,
            user_group,
            password: password.to_string(),
        }
    }

    pub async fn run(&self, exchange: &mut Exchange<'_>) -> Result<()> {
        let now = chrono::Utc::now().timestamp() as u32;
        let request = Request::logon(self.destination, self.user_group, &self.password, now)?;

        info!(
            "logging on to {} at {} as {:?}",
            self.destination, self.address, self.user_group
        );
        let reply = exchange.request_one(&request, &self.address).await?;

        match reply.error_code() {
            0 => {}
            INVALID_PASSWORD => return Err(ProtocolError::InvalidPassword.into()),
            code => return Err(ProtocolError::LogonFailed(code).into()),
        }

        // payload: command, group, timeout, time, ...
        match reply.word(12) {
            Some(echo) if echo == now => {}
            Some(echo) => warn!(
                "{} echoed logon time {} instead of {}",
                reply.header.source, echo, now
            ),
            None => warn!("{} sent a short logon reply", reply.header.source),
        }

        Ok(())
    }
}
