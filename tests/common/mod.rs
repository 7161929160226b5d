#![allow(dead_code)]

pub use sma_bridge::prelude::*;

use async_trait::async_trait;
use sma_bridge::sma::inverter::{Datagram, Transport};
use sma_bridge::sma::packet::{
    BluetoothFrame, Frame, FrameCommon, FrameFactory, Header, Parser, Telegram, L1_TOPOLOGY,
};
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Factory;
impl Factory {
    pub fn ip(last: u8) -> Address {
        Address::unicast(IpAddr::V4(Ipv4Addr::new(192, 168, 1, last)))
    }

    pub fn inverter() -> Identity {
        Identity::new(0x0083, 2_100_000_001)
    }

    /// The device's answer to `request`, echoing its sequence number.
    pub fn reply(request: &Telegram, source: Identity, payload: Vec<u8>) -> Telegram {
        Telegram {
            header: Header {
                longwords: ((Header::LEN + payload.len()) / 4) as u8,
                control: request.header.control,
                destination: request.header.source,
                destination_control: request.header.destination_control,
                source,
                source_control: request.header.source_control,
                packet_id: request.sequence() | 0x8000,
                ..Default::default()
            },
            payload,
        }
    }

    pub fn error_reply(request: &Telegram, source: Identity, code: u16) -> Telegram {
        let mut telegram = Self::reply(request, source, request.payload.clone());
        telegram.header.error_code = code;
        telegram
    }

    pub fn speedwire(telegram: Telegram) -> Vec<u8> {
        FrameFactory::new(Connection::Speedwire, BtAddress::UNKNOWN)
            .build(telegram, &Self::ip(1))
            .bytes()
    }

    pub fn bt_peer() -> BtAddress {
        "00:80:25:1C:2B:3A".parse().unwrap()
    }

    pub fn bluetooth(telegram: Telegram) -> Vec<u8> {
        FrameFactory::new(Connection::Bluetooth, Self::bt_peer())
            .build(telegram, &Address::Bluetooth(BtAddress::UNKNOWN))
            .bytes()
    }

    /// A link-layer frame carrying no telegram.
    pub fn topology() -> Vec<u8> {
        Frame::Bluetooth(BluetoothFrame::link(
            Self::bt_peer(),
            BtAddress::BROADCAST,
            L1_TOPOLOGY,
            vec![0x00, 0x04, 0x70, 0x00],
        ))
        .bytes()
    }

    /// A reply payload: command words then the records.
    pub fn records(records: &[Vec<u8>]) -> Vec<u8> {
        let mut payload = vec![0u8; 12];
        for record in records {
            payload.extend_from_slice(record);
        }
        payload
    }

    pub fn dword(code: u32, timestamp: u32, value: u32) -> Vec<u8> {
        let mut r = vec![0u8; 28];
        r[0..4].copy_from_slice(&code.to_le_bytes());
        r[4..8].copy_from_slice(&timestamp.to_le_bytes());
        for off in [8, 12, 16, 20] {
            r[off..off + 4].copy_from_slice(&value.to_le_bytes());
        }
        r
    }

    /// Device name and class, as a type label reply carries them.
    pub fn type_label(name: &str, class: u32) -> Vec<Vec<u8>> {
        let mut label = vec![0u8; 40];
        label[0..4].copy_from_slice(&0x1082_1E01u32.to_le_bytes());
        label[8..8 + name.len()].copy_from_slice(name.as_bytes());

        let mut main_model = vec![0u8; 40];
        main_model[0..4].copy_from_slice(&0x0882_1F01u32.to_le_bytes());
        main_model[8..12].copy_from_slice(&(0x0100_0000 | class).to_le_bytes());
        main_model[12..16].copy_from_slice(&0x00FF_FFFEu32.to_le_bytes());

        vec![label, main_model]
    }

    pub fn archive_sample(timestamp: u32, total_wh: u64) -> Vec<u8> {
        let mut r = timestamp.to_le_bytes().to_vec();
        r.extend_from_slice(&total_wh.to_le_bytes());
        r
    }

    pub fn event(datetime: u32, entry_id: u16, event_code: u16) -> Vec<u8> {
        let mut r = vec![0u8; 48];
        r[0..4].copy_from_slice(&datetime.to_le_bytes());
        r[4..6].copy_from_slice(&entry_id.to_le_bytes());
        r[6..8].copy_from_slice(&Self::inverter().susy_id.to_le_bytes());
        r[8..12].copy_from_slice(&Self::inverter().serial.to_le_bytes());
        r[12..14].copy_from_slice(&event_code.to_le_bytes());
        r
    }

    pub fn child(identity: Identity, class_offset: u16) -> Vec<u8> {
        let mut r = identity.susy_id.to_le_bytes().to_vec();
        r.extend_from_slice(&identity.serial.to_le_bytes());
        r.extend_from_slice(&class_offset.to_le_bytes());
        r
    }
}

pub type Responder = Box<dyn FnMut(&Telegram, &Address) -> Vec<Vec<u8>> + Send>;

/// A transport whose devices are played by `responder`: every request sent
/// is recorded and the frames returned for it are queued for `receive`.
/// An empty queue reads as a timeout.
pub struct MockTransport {
    pub sent: Vec<Telegram>,
    connection: Connection,
    inbox: VecDeque<Datagram>,
    responder: Responder,
}

impl MockTransport {
    /// Speedwire devices answering with telegrams.
    pub fn new<F>(mut responder: F) -> Self
    where
        F: FnMut(&Telegram, &Address) -> Vec<Telegram> + Send + 'static,
    {
        Self::wire(Connection::Speedwire, move |request, to| {
            responder(request, to).into_iter().map(Factory::speedwire).collect()
        })
    }

    /// Devices answering with raw frames of `connection`.
    pub fn wire<F>(connection: Connection, responder: F) -> Self
    where
        F: FnMut(&Telegram, &Address) -> Vec<Vec<u8>> + Send + 'static,
    {
        Self {
            sent: Vec::new(),
            connection,
            inbox: VecDeque::new(),
            responder: Box::new(responder),
        }
    }

    pub fn sent_commands(&self) -> Vec<u32> {
        self.sent.iter().filter_map(|t| t.command()).collect()
    }

    pub fn count(&self, command: u32) -> usize {
        self.sent_commands().iter().filter(|c| **c == command).count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn connection(&self) -> Connection {
        self.connection
    }

    async fn send(&mut self, bytes: &[u8], to: &Address) -> Result<()> {
        let Some(request) = Parser::parse(self.connection, bytes)?.into_telegram() else {
            bail!("request without telegram");
        };

        for reply in (self.responder)(&request, to) {
            self.inbox.push_back(Datagram { bytes: reply, from: *to });
        }
        self.sent.push(request);
        Ok(())
    }

    async fn receive(&mut self, _timeout: Duration) -> Result<Option<Datagram>> {
        Ok(self.inbox.pop_front())
    }
}
