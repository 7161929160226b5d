use crate::prelude::*;
use crate::sma::inverter::Transport;
use crate::sma::packet::{
    Connection, Frame, FrameCommon, FrameFactory, Parser, Request, Telegram, ENERGY_METER_SIZES,
    SEQUENCE_MASK,
};

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Frames with a stale sequence number, or without a telegram, tolerated
/// before giving up.
const MAX_DISCARDED: u32 = 32;

/// Per-session protocol context: our identity, the link flavour and the
/// outgoing sequence counter, which is shared by every session of the plant.
#[derive(Clone, Debug)]
pub struct SessionContext {
    sequence: Arc<AtomicU16>,
    pub local: Identity,
    pub local_bt: BtAddress,
    pub connection: Connection,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl SessionContext {
    pub fn new(connection: Connection, timeout: Duration, max_retries: u32) -> Self {
        Self {
            sequence: Arc::new(AtomicU16::new(0)),
            local: Identity::app(),
            local_bt: BtAddress::UNKNOWN,
            connection,
            timeout,
            max_retries,
        }
    }

    pub fn from_config(config: &ConfigWrapper) -> Self {
        Self::new(
            config.connection(),
            Duration::from_secs(config.timeout_secs()),
            config.max_retries(),
        )
    }

    /// A context for another device session that keeps drawing from the
    /// same sequence counter.
    pub fn fork(&self) -> Self {
        self.clone()
    }

    pub fn current_sequence(&self) -> u16 {
        self.sequence.load(Ordering::SeqCst) & SEQUENCE_MASK
    }

    pub fn next_sequence(&self) -> u16 {
        self.sequence.fetch_add(1, Ordering::SeqCst).wrapping_add(1) & SEQUENCE_MASK
    }

    pub fn factory(&self) -> FrameFactory {
        FrameFactory::new(self.connection, self.local_bt)
    }

    /// Encodes `request` under a fresh sequence number, drawing new numbers
    /// until the serial checksum bytes come out clean.
    pub fn build(&self, request: &Request, to: &Address) -> (u16, Vec<u8>) {
        let factory = self.factory();
        loop {
            let sequence = self.next_sequence();
            let telegram = Telegram::from_request(request, self.local, sequence);
            let bytes = factory.build(telegram, to).bytes();
            if factory.trailer_is_clean(&bytes) {
                return (sequence, bytes);
            }
            debug!("checksum of sequence {} collides with framing, reissuing", sequence);
        }
    }
}

/// One request/reply conversation over a transport.
pub struct Exchange<'a> {
    ctx: &'a SessionContext,
    transport: &'a mut dyn Transport,
}

impl<'a> Exchange<'a> {
    pub fn new(ctx: &'a SessionContext, transport: &'a mut dyn Transport) -> Self {
        Self { ctx, transport }
    }

    pub fn context(&self) -> &SessionContext {
        self.ctx
    }

    pub async fn send(&mut self, request: &Request, to: &Address) -> Result<u16> {
        let (sequence, bytes) = self.ctx.build(request, to);
        debug!(
            "TX seq {} to {} ({}): {} bytes",
            sequence,
            request.destination,
            to,
            bytes.len()
        );
        self.transport.send(&bytes, to).await?;
        Ok(sequence)
    }

    /// Sends `request` and waits for its complete, possibly fragmented, reply.
    pub async fn request(&mut self, request: &Request, to: &Address) -> Result<Vec<Telegram>> {
        let sequence = self.send(request, to).await?;
        self.wait_for_reply(sequence).await
    }

    /// Like `request`, but returns only the first telegram of the reply.
    pub async fn request_one(&mut self, request: &Request, to: &Address) -> Result<Telegram> {
        self.request(request, to)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ProtocolError::NoData.into())
    }

    /// Reads one parsed frame, spending the retry budget on timeouts and
    /// on datagrams that are not ours.
    pub async fn next_frame(&mut self, budget: &mut u32) -> Result<Frame> {
        loop {
            let datagram = match self.transport.receive(self.ctx.timeout).await? {
                Some(d) => d,
                None => {
                    spend(budget, "timeout")?;
                    continue;
                }
            };

            if self.ctx.connection == Connection::Speedwire
                && ENERGY_METER_SIZES.contains(&datagram.bytes.len())
            {
                trace!("ignoring energy meter datagram from {}", datagram.from);
                spend(budget, "energy meter datagram")?;
                continue;
            }

            match Parser::parse(self.ctx.connection, &datagram.bytes) {
                Ok(frame) => return Ok(frame),
                Err(e) => match ProtocolError::of(&e) {
                    Some(pe) if pe.is_fatal() => return Err(e),
                    _ => {
                        debug!("discarding frame from {}: {}", datagram.from, e);
                        spend(budget, "malformed frame")?;
                    }
                },
            }
        }
    }

    /// Collects the reply telegrams for `sequence`.
    ///
    /// Until the echoed sequence matches, frames are dropped and any partial
    /// reply is forgotten. After the first match the remaining fragments are
    /// taken as they come, until the fragment counter reaches zero.
    pub async fn wait_for_reply(&mut self, sequence: u16) -> Result<Vec<Telegram>> {
        let mut budget = self.ctx.max_retries;
        let mut confirmed = false;
        let mut discarded = 0;
        let mut fragments: Vec<Telegram> = Vec::new();

        loop {
            let frame = self.next_frame(&mut budget).await?;
            let Some(telegram) = frame.into_telegram() else {
                trace!("ignoring link-layer frame while waiting for seq {}", sequence);
                discarded += 1;
                if discarded >= MAX_DISCARDED {
                    return Err(ProtocolError::NoData.into());
                }
                continue;
            };

            if !confirmed {
                if telegram.sequence() != sequence {
                    discarded += 1;
                    warn!(
                        "discarding reply seq {} from {} while waiting for seq {}",
                        telegram.sequence(),
                        telegram.header.source,
                        sequence
                    );
                    fragments.clear();
                    if discarded >= MAX_DISCARDED {
                        return Err(ProtocolError::NoData.into());
                    }
                    continue;
                }
                confirmed = true;
            }

            let remaining = telegram.fragments_remaining();
            debug!(
                "RX seq {} from {}: {} payload bytes, {} fragments left",
                telegram.sequence(),
                telegram.header.source,
                telegram.payload.len(),
                remaining
            );
            fragments.push(telegram);

            if remaining == 0 {
                return Ok(fragments);
            }
        }
    }
}

fn spend(budget: &mut u32, what: &str) -> Result<()> {
    if *budget == 0 {
        debug!("retry budget exhausted after {}", what);
        return Err(ProtocolError::NoData.into());
    }
    *budget -= 1;
    Ok(())
}
