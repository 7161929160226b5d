use crate::prelude::*;
use crate::sma::exchange::{Exchange, SessionContext};
use crate::sma::inverter::Transport;
use crate::sma::packet::{BluetoothFrame, Frame, FrameCommon, Request, L1_HELLO};

/// Asks a device who it is. The source identity of the reply is the answer.
pub struct Identify {
    address: Address,
}

impl Identify {
    pub fn new(address: Address) -> Self {
        Self { address }
    }

    pub async fn run(&self, exchange: &mut Exchange<'_>) -> Result<Identity> {
        debug!("identifying device at {}", self.address);

        let reply = exchange
            .request_one(&Request::identify(Identity::ANY), &self.address)
            .await
            .map_err(|e| match ProtocolError::of(&e) {
                Some(ProtocolError::NoData) => {
                    anyhow!(ProtocolError::InitFailed(format!("no answer from {}", self.address)))
                }
                _ => e,
            })?;

        let identity = reply.header.source;
        if identity.is_any() || identity.serial == 0 {
            return Err(ProtocolError::InitFailed(format!(
                "{} answered without an identity",
                self.address
            ))
            .into());
        }

        info!("{} is device {} (susy id {})", self.address, identity, identity.susy_id);
        Ok(identity)
    }
}

/// Link setup on the serial transport: the device announces its network
/// with a hello frame, which is echoed back before any L2 traffic.
pub struct BluetoothHandshake {
    peer: BtAddress,
}

impl BluetoothHandshake {
    const DEFAULT_NET_ID: u8 = 1;

    pub fn new(peer: BtAddress) -> Self {
        Self { peer }
    }

    /// Returns the network id of the piconet. Updates `ctx.local_bt` with
    /// the address the device knows us by.
    pub async fn run(&self, ctx: &mut SessionContext, transport: &mut dyn Transport) -> Result<u8> {
        info!("waiting for hello from {}", self.peer);

        let (local, net_id) = {
            let mut exchange = Exchange::new(ctx, &mut *transport);
            let mut budget = exchange.context().max_retries;
            loop {
                match exchange.next_frame(&mut budget).await {
                    Ok(Frame::Bluetooth(frame)) if frame.command == L1_HELLO => {
                        let net_id = frame.raw.get(4).copied().unwrap_or(Self::DEFAULT_NET_ID);
                        break (frame.destination, net_id);
                    }
                    Ok(other) => trace!("ignoring {:?} frame during handshake", other.connection()),
                    Err(e) => match ProtocolError::of(&e) {
                        Some(ProtocolError::NoData) => {
                            return Err(ProtocolError::InitFailed(format!(
                                "no hello from {}",
                                self.peer
                            ))
                            .into())
                        }
                        _ => return Err(e),
                    },
                }
            }
        };

        if local != BtAddress::UNKNOWN && local != BtAddress::BROADCAST {
            ctx.local_bt = local;
        }

        let reply = BluetoothFrame::link(
            ctx.local_bt,
            self.peer,
            L1_HELLO,
            vec![0x00, 0x04, 0x70, 0x00, net_id, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00],
        );
        transport
            .send(&Frame::Bluetooth(reply).bytes(), &Address::Bluetooth(self.peer))
            .await?;

        info!("bluetooth link to {} up, net id {}", self.peer, net_id);
        Ok(net_id)
    }
}
