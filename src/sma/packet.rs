use crate::prelude::*;
use crate::sma::inverter::{Address, BtAddress, Identity};

use bytes::{BufMut, BytesMut};
use enum_dispatch::*;
use nom::number::complete::{le_u16, le_u8};
use nom::IResult;
use std::net::Ipv4Addr;

// {{{ wire constants
pub const SPEEDWIRE_PREAMBLE: [u8; 12] = [
    0x53, 0x4D, 0x41, 0x00, // "SMA\0"
    0x00, 0x04, 0x02, 0xA0, // tag 0x02A0, length 4
    0x00, 0x00, 0x00, 0x01, // group 1
];
pub const SPEEDWIRE_TAG: [u8; 2] = [0x00, 0x10];
pub const SPEEDWIRE_PROTOCOL: [u8; 2] = [0x60, 0x65];
pub const SPEEDWIRE_HEADER_LEN: usize = 16;
pub const SPEEDWIRE_TRAILER_LEN: usize = 4;

pub const BLUETOOTH_SIGNATURE: [u8; 4] = [0xFF, 0x03, 0x60, 0x65];
pub const BLUETOOTH_HEADER_LEN: usize = 18;
pub const BLUETOOTH_MAX_FRAME: usize = 1024;

pub const DELIMITER: u8 = 0x7E;
pub const ESCAPE: u8 = 0x7D;
pub const RESERVED: [u8; 5] = [0x7D, 0x7E, 0x11, 0x12, 0x13];

pub const MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 12, 255, 254);
pub const PORT: u16 = 9522;
pub const DISCOVERY_REQUEST: [u8; 20] = [
    0x53, 0x4D, 0x41, 0x00, 0x00, 0x04, 0x02, 0xA0, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x20,
    0x00, 0x00, 0x00, 0x00,
];
/// Datagram sizes multicast by energy meters sharing the discovery group.
pub const ENERGY_METER_SIZES: [usize; 2] = [600, 608];

pub const SEQUENCE_MASK: u16 = 0x7FFF;
pub const REQUEST_PENDING: u16 = 0x8000;

pub const CONTROL_REQUEST: u8 = 0xA0;
pub const CONTROL_ARCHIVE: u8 = 0xE0;

pub const CMD_IDENTIFY: u32 = 0x0000_0200;
pub const CMD_LOGON: u32 = 0xFFFD_040C;
pub const CMD_LOGOFF: u32 = 0xFFFD_010E;
pub const LOGON_TIMEOUT_SECS: u32 = 900;
pub const PASSWORD_LEN: usize = 12;

/// Offset of the first tagged record inside a telegram payload
/// (command word, first register, last register).
pub const RECORDS_OFFSET: usize = 12;

// link-layer command words on the serial transport
pub const L1_DATA: u16 = 0x0001;
pub const L1_HELLO: u16 = 0x0002;
pub const L1_TOPOLOGY: u16 = 0x0005;
// }}}

// {{{ Connection
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Connection {
    Speedwire,
    Bluetooth,
}
// }}}

// {{{ UserGroup
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UserGroup {
    User,
    Installer,
}

impl UserGroup {
    pub fn code(&self) -> u32 {
        match self {
            UserGroup::User => 0x07,
            UserGroup::Installer => 0x0A,
        }
    }

    fn password_key(&self) -> u8 {
        match self {
            UserGroup::User => 0x88,
            UserGroup::Installer => 0xBB,
        }
    }

    pub fn encode_password(&self, password: &str) -> Result<[u8; PASSWORD_LEN]> {
        if password.len() > PASSWORD_LEN {
            return Err(ProtocolError::BadArgument(format!(
                "password longer than {} characters",
                PASSWORD_LEN
            ))
            .into());
        }

        let key = self.password_key();
        let mut encoded = [key; PASSWORD_LEN];
        for (slot, byte) in encoded.iter_mut().zip(password.bytes()) {
            *slot = byte.wrapping_add(key);
        }
        Ok(encoded)
    }
}
// }}}

/// FCS-16 used by the serial transport (CRC-16/X-25, already complemented).
pub fn fcs16(data: &[u8]) -> u16 {
    crc16::State::<crc16::X_25>::calculate(data)
}

pub fn escape_into(data: &[u8], buf: &mut BytesMut) {
    for &byte in data {
        if RESERVED.contains(&byte) {
            buf.put_u8(ESCAPE);
            buf.put_u8(byte ^ 0x20);
        } else {
            buf.put_u8(byte);
        }
    }
}

pub fn unescape(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    let mut escaped = false;
    for &byte in data {
        if escaped {
            out.push(byte ^ 0x20);
            escaped = false;
        } else if byte == ESCAPE {
            escaped = true;
        } else {
            out.push(byte);
        }
    }
    if escaped {
        return Err(ProtocolError::Format("dangling escape byte".to_string()).into());
    }
    Ok(out)
}

// {{{ Header
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Header {
    pub longwords: u8,
    pub control: u8,
    pub destination: Identity,
    pub destination_control: u16,
    pub source: Identity,
    pub source_control: u16,
    pub error_code: u16,
    pub fragment: u16,
    pub packet_id: u16,
}

impl Header {
    pub const LEN: usize = 24;

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(self.longwords);
        buf.put_u8(self.control);
        buf.put_u16_le(self.destination.susy_id);
        buf.put_u32_le(self.destination.serial);
        buf.put_u16_le(self.destination_control);
        buf.put_u16_le(self.source.susy_id);
        buf.put_u32_le(self.source.serial);
        buf.put_u16_le(self.source_control);
        buf.put_u16_le(self.error_code);
        buf.put_u16_le(self.fragment);
        buf.put_u16_le(self.packet_id);
    }

    fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, longwords) = le_u8(input)?;
        let (input, control) = le_u8(input)?;
        let (input, destination) = Identity::parse(input)?;
        let (input, destination_control) = le_u16(input)?;
        let (input, source) = Identity::parse(input)?;
        let (input, source_control) = le_u16(input)?;
        let (input, error_code) = le_u16(input)?;
        let (input, fragment) = le_u16(input)?;
        let (input, packet_id) = le_u16(input)?;

        Ok((
            input,
            Self {
                longwords,
                control,
                destination,
                destination_control,
                source,
                source_control,
                error_code,
                fragment,
                packet_id,
            },
        ))
    }
} // }}}

// {{{ Request
/// An outgoing data-set request before it is given a sequence number.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Request {
    pub control: u8,
    pub control2: u16,
    pub destination: Identity,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn new(control: u8, control2: u16, destination: Identity, fields: &[u32]) -> Self {
        let mut payload = Vec::with_capacity(fields.len() * 4);
        for field in fields {
            payload.extend_from_slice(&field.to_le_bytes());
        }
        Self {
            control,
            control2,
            destination,
            payload,
        }
    }

    pub fn query(destination: Identity, command: u32, first: u32, last: u32) -> Self {
        Self::new(CONTROL_REQUEST, 0, destination, &[command, first, last])
    }

    pub fn archive(destination: Identity, command: u32, from: u32, to: u32) -> Self {
        Self::new(CONTROL_ARCHIVE, 0, destination, &[command, from, to])
    }

    pub fn identify(destination: Identity) -> Self {
        Self::query(destination, CMD_IDENTIFY, 0, 0)
    }

    pub fn logon(
        destination: Identity,
        user_group: UserGroup,
        password: &str,
        now: u32,
    ) -> Result<Self> {
        let encoded = user_group.encode_password(password)?;
        let mut request = Self::new(
            CONTROL_REQUEST,
            0x0100,
            destination,
            &[CMD_LOGON, user_group.code(), LOGON_TIMEOUT_SECS, now, 0],
        );
        request.payload.extend_from_slice(&encoded);
        Ok(request)
    }

    pub fn logoff(destination: Identity) -> Self {
        Self::new(CONTROL_REQUEST, 0x0300, destination, &[CMD_LOGOFF, 0xFFFF_FFFF])
    }
} // }}}

// {{{ Telegram
/// The transport-independent part of a frame: L2 header and payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Telegram {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Telegram {
    pub fn from_request(request: &Request, source: Identity, sequence: u16) -> Self {
        Self {
            header: Header {
                longwords: ((Header::LEN + request.payload.len()) / 4) as u8,
                control: request.control,
                destination: request.destination,
                destination_control: request.control2,
                source,
                source_control: request.control2,
                error_code: 0,
                fragment: 0,
                packet_id: (sequence & SEQUENCE_MASK) | REQUEST_PENDING,
            },
            payload: request.payload.clone(),
        }
    }

    /// Echoed sequence number, high bit masked off.
    pub fn sequence(&self) -> u16 {
        self.header.packet_id & SEQUENCE_MASK
    }

    pub fn fragments_remaining(&self) -> u16 {
        self.header.fragment
    }

    pub fn error_code(&self) -> u16 {
        self.header.error_code
    }

    pub fn word(&self, offset: usize) -> Option<u32> {
        self.payload
            .get(offset..offset + 4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes)
    }

    pub fn command(&self) -> Option<u32> {
        self.word(0)
    }

    pub fn records(&self) -> &[u8] {
        self.payload.get(RECORDS_OFFSET..).unwrap_or(&[])
    }

    fn body(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Header::LEN + self.payload.len());
        self.header.write(&mut buf);
        buf.put_slice(&self.payload);
        buf
    }

    fn decode(input: &[u8]) -> Result<Self> {
        if input.len() < Header::LEN {
            return Err(ProtocolError::Truncated {
                needed: Header::LEN,
                got: input.len(),
            }
            .into());
        }

        let (payload, header) = Header::parse(input)
            .map_err(|e| ProtocolError::Format(format!("telegram header: {:?}", e)))?;

        Ok(Self {
            header,
            payload: payload.to_vec(),
        })
    }
} // }}}

#[enum_dispatch]
pub trait FrameCommon {
    fn connection(&self) -> Connection;
    fn telegram(&self) -> Option<&Telegram>;
    fn bytes(&self) -> Vec<u8>;
}

#[enum_dispatch(FrameCommon)]
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Frame {
    Speedwire(SpeedwireFrame),
    Bluetooth(BluetoothFrame),
}

impl Frame {
    pub fn into_telegram(self) -> Option<Telegram> {
        match self {
            Frame::Speedwire(f) => Some(f.telegram),
            Frame::Bluetooth(f) => f.telegram,
        }
    }
}

/////////////
//
// SPEEDWIRE
//
/////////////

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpeedwireFrame {
    pub telegram: Telegram,
}

impl SpeedwireFrame {
    fn decode(input: &[u8]) -> Result<Self> {
        let minimum = SPEEDWIRE_HEADER_LEN + SPEEDWIRE_PROTOCOL.len();
        if input.len() < minimum {
            return Err(ProtocolError::Truncated {
                needed: minimum,
                got: input.len(),
            }
            .into());
        }

        if input[0..4] != SPEEDWIRE_PREAMBLE[0..4] {
            return Err(ProtocolError::Format("missing SMA signature".to_string()).into());
        }
        if input[14..16] != SPEEDWIRE_TAG {
            return Err(ProtocolError::Format(format!(
                "unexpected speedwire tag {:02x}{:02x}",
                input[14], input[15]
            ))
            .into());
        }

        let length = u16::from_be_bytes([input[12], input[13]]) as usize;
        let end = SPEEDWIRE_HEADER_LEN + length;
        if input.len() < end {
            return Err(ProtocolError::Truncated {
                needed: end,
                got: input.len(),
            }
            .into());
        }

        if input[16..18] != SPEEDWIRE_PROTOCOL {
            return Err(ProtocolError::Format(format!(
                "unsupported protocol {:02x}{:02x}",
                input[16], input[17]
            ))
            .into());
        }

        Ok(Self {
            telegram: Telegram::decode(&input[18..end])?,
        })
    }
}

impl FrameCommon for SpeedwireFrame {
    fn connection(&self) -> Connection {
        Connection::Speedwire
    }

    fn telegram(&self) -> Option<&Telegram> {
        Some(&self.telegram)
    }

    fn bytes(&self) -> Vec<u8> {
        let body = self.telegram.body();
        let mut buf = BytesMut::with_capacity(
            SPEEDWIRE_HEADER_LEN + SPEEDWIRE_PROTOCOL.len() + body.len() + SPEEDWIRE_TRAILER_LEN,
        );

        buf.put_slice(&SPEEDWIRE_PREAMBLE);
        buf.put_u16(0); // length, filled in below
        buf.put_slice(&SPEEDWIRE_TAG);
        buf.put_slice(&SPEEDWIRE_PROTOCOL);
        buf.put_slice(&body);
        buf.put_u32(0);

        // counts from the protocol signature up to, not including, the trailer
        let length = (buf.len() - SPEEDWIRE_HEADER_LEN - SPEEDWIRE_TRAILER_LEN) as u16;
        buf[12..14].copy_from_slice(&length.to_be_bytes());
        buf[18] = (length / 4) as u8;

        buf.to_vec()
    }
}

/////////////
//
// BLUETOOTH / SERIAL
//
/////////////

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BluetoothFrame {
    pub source: BtAddress,
    pub destination: BtAddress,
    pub command: u16,
    pub telegram: Option<Telegram>,
    /// Link-layer payload of frames that carry no telegram.
    pub raw: Vec<u8>,
}

impl BluetoothFrame {
    pub fn link(source: BtAddress, destination: BtAddress, command: u16, raw: Vec<u8>) -> Self {
        Self {
            source,
            destination,
            command,
            telegram: None,
            raw,
        }
    }

    fn decode(input: &[u8]) -> Result<Self> {
        if input.len() < BLUETOOTH_HEADER_LEN {
            return Err(ProtocolError::Truncated {
                needed: BLUETOOTH_HEADER_LEN,
                got: input.len(),
            }
            .into());
        }
        if input[0] != DELIMITER {
            return Err(ProtocolError::Format("missing start delimiter".to_string()).into());
        }
        if input[0] ^ input[1] ^ input[2] != input[3] {
            return Err(ProtocolError::Format("link header checksum mismatch".to_string()).into());
        }

        let length = u16::from_le_bytes([input[1], input[2]]) as usize;
        if input.len() < length {
            return Err(ProtocolError::Truncated {
                needed: length,
                got: input.len(),
            }
            .into());
        }
        let input = &input[..length];

        let source = BtAddress::from_wire(&input[4..10])?;
        let destination = BtAddress::from_wire(&input[10..16])?;
        let command = u16::from_le_bytes([input[16], input[17]]);
        let body = &input[BLUETOOTH_HEADER_LEN..];

        if command != L1_DATA {
            return Ok(Self::link(source, destination, command, body.to_vec()));
        }

        if body.last() != Some(&DELIMITER) {
            return Err(ProtocolError::Format("missing end delimiter".to_string()).into());
        }

        // checksum goes out unescaped right before the end delimiter
        if body.len() < 3 {
            return Err(ProtocolError::Truncated {
                needed: BLUETOOTH_HEADER_LEN + 3,
                got: input.len(),
            }
            .into());
        }
        let (escaped, trailer) = body[..body.len() - 1].split_at(body.len() - 3);
        let data = unescape(escaped)?;
        let minimum = BLUETOOTH_SIGNATURE.len() + Header::LEN;
        if data.len() < minimum {
            return Err(ProtocolError::Truncated {
                needed: minimum,
                got: data.len(),
            }
            .into());
        }

        let received = u16::from_le_bytes([trailer[0], trailer[1]]);
        let computed = fcs16(&data);
        if computed != received {
            return Err(ProtocolError::ChecksumInvalid { computed, received }.into());
        }

        if data[0..4] != BLUETOOTH_SIGNATURE {
            return Err(ProtocolError::Format("missing L2 signature".to_string()).into());
        }

        Ok(Self {
            source,
            destination,
            command,
            telegram: Some(Telegram::decode(&data[4..])?),
            raw: Vec::new(),
        })
    }
}

impl FrameCommon for BluetoothFrame {
    fn connection(&self) -> Connection {
        Connection::Bluetooth
    }

    fn telegram(&self) -> Option<&Telegram> {
        self.telegram.as_ref()
    }

    fn bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(BLUETOOTH_HEADER_LEN + 64);

        buf.put_u8(DELIMITER);
        buf.put_u16_le(0); // length, filled in below
        buf.put_u8(0); // header checksum
        buf.put_slice(self.source.as_wire());
        buf.put_slice(self.destination.as_wire());
        buf.put_u16_le(self.command);

        match &self.telegram {
            Some(telegram) => {
                let mut data = BytesMut::with_capacity(BLUETOOTH_SIGNATURE.len() + Header::LEN);
                data.put_slice(&BLUETOOTH_SIGNATURE);
                data.put_slice(&telegram.body());

                // checksum covers the original bytes, not the escaped ones
                let fcs = fcs16(&data);
                escape_into(&data, &mut buf);
                buf.put_u16_le(fcs);
                buf.put_u8(DELIMITER);
            }
            None => buf.put_slice(&self.raw),
        }

        let length = buf.len() as u16;
        buf[1..3].copy_from_slice(&length.to_le_bytes());
        buf[3] = buf[0] ^ buf[1] ^ buf[2];

        buf.to_vec()
    }
}

pub struct FrameFactory {
    connection: Connection,
    local_bt: BtAddress,
}

impl FrameFactory {
    pub fn new(connection: Connection, local_bt: BtAddress) -> Self {
        Self {
            connection,
            local_bt,
        }
    }

    pub fn connection(&self) -> Connection {
        self.connection
    }

    pub fn build(&self, telegram: Telegram, destination: &Address) -> Frame {
        match self.connection {
            Connection::Speedwire => Frame::Speedwire(SpeedwireFrame { telegram }),
            Connection::Bluetooth => Frame::Bluetooth(BluetoothFrame {
                source: self.local_bt,
                destination: destination.bt().unwrap_or(BtAddress::UNKNOWN),
                command: L1_DATA,
                telegram: Some(telegram),
                raw: Vec::new(),
            }),
        }
    }

    /// The checksum bytes go out unescaped, so they must never look like a
    /// delimiter or escape byte. Callers re-issue the sequence number when
    /// this returns false.
    pub fn trailer_is_clean(&self, bytes: &[u8]) -> bool {
        if self.connection != Connection::Bluetooth || bytes.len() < 3 {
            return true;
        }
        let checksum = &bytes[bytes.len() - 3..bytes.len() - 1];
        !checksum.iter().any(|b| *b == DELIMITER || *b == ESCAPE)
    }
}

pub struct Parser;
impl Parser {
    pub fn parse(connection: Connection, input: &[u8]) -> Result<Frame> {
        let frame = match connection {
            Connection::Speedwire => Frame::Speedwire(SpeedwireFrame::decode(input)?),
            Connection::Bluetooth => Frame::Bluetooth(BluetoothFrame::decode(input)?),
        };

        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn telegram(payload: Vec<u8>) -> Telegram {
        let request = Request {
            control: CONTROL_REQUEST,
            control2: 0,
            destination: Identity::new(0x0083, 2_100_123_456),
            payload,
        };
        Telegram::from_request(&request, Identity::new(125, 912_345_678), 0x1234)
    }

    #[test]
    fn fcs16_regression_vector() {
        assert_eq!(fcs16(b"123456789"), 0x906E);
    }

    #[test]
    fn escaping_round_trip_with_every_reserved_byte() {
        let payload = vec![0x7E, 0x7D, 0x11, 0x12, 0x13, 0x00, 0x20, 0x5D, 0x5E];
        let frame = Frame::Bluetooth(BluetoothFrame {
            source: BtAddress::UNKNOWN,
            destination: "00:80:25:1C:2B:3A".parse().unwrap(),
            command: L1_DATA,
            telegram: Some(telegram(payload.clone())),
            raw: Vec::new(),
        });

        let bytes = frame.bytes();
        let body = &bytes[BLUETOOTH_HEADER_LEN..bytes.len() - 3];
        assert!(!body.contains(&DELIMITER));

        let decoded = Parser::parse(Connection::Bluetooth, &bytes).unwrap();
        assert_eq!(decoded.telegram().unwrap().payload, payload);
        assert_eq!(decoded, frame);
    }

    #[test]
    fn bluetooth_checksum_mismatch_is_rejected() {
        let frame = Frame::Bluetooth(BluetoothFrame {
            source: BtAddress::UNKNOWN,
            destination: BtAddress::UNKNOWN,
            command: L1_DATA,
            telegram: Some(telegram(vec![1, 2, 3, 4])),
            raw: Vec::new(),
        });
        let mut bytes = frame.bytes();
        // flip a payload bit that is not a reserved byte either way
        let idx = bytes.len() - 6;
        bytes[idx] ^= 0x40;

        let err = Parser::parse(Connection::Bluetooth, &bytes).unwrap_err();
        assert!(matches!(
            ProtocolError::of(&err),
            Some(ProtocolError::ChecksumInvalid { .. })
        ));
    }

    #[test]
    fn speedwire_layout() {
        let frame = Frame::Speedwire(SpeedwireFrame {
            telegram: telegram(vec![0x00, 0x02, 0x00, 0x51, 0, 0x40, 0x46, 0, 0xFF, 0x42, 0x46, 0]),
        });
        let bytes = frame.bytes();

        assert_eq!(bytes[0..12], SPEEDWIRE_PREAMBLE);
        assert_eq!(bytes[14..18], [0x00, 0x10, 0x60, 0x65]);
        let length = u16::from_be_bytes([bytes[12], bytes[13]]) as usize;
        assert_eq!(length, bytes.len() - SPEEDWIRE_HEADER_LEN - SPEEDWIRE_TRAILER_LEN);
        assert_eq!(length, 2 + Header::LEN + 12);
        assert_eq!(bytes[18] as usize, length / 4);
        assert_eq!(bytes[bytes.len() - 4..], [0, 0, 0, 0]);
        // packet id carries the pending bit
        assert_eq!(bytes[bytes.len() - 18..bytes.len() - 16], [0x34, 0x92]);

        let decoded = Parser::parse(Connection::Speedwire, &bytes).unwrap();
        assert_eq!(decoded.telegram().unwrap().sequence(), 0x1234);
        assert_eq!(decoded.telegram().unwrap().command(), Some(0x5100_0200));
    }

    #[test]
    fn truncated_buffers_are_rejected() {
        let bytes = Frame::Speedwire(SpeedwireFrame {
            telegram: telegram(vec![0; 12]),
        })
        .bytes();

        for len in [0, 10, 17, 30, bytes.len() - 8] {
            let err = Parser::parse(Connection::Speedwire, &bytes[..len]).unwrap_err();
            assert!(
                matches!(ProtocolError::of(&err), Some(ProtocolError::Truncated { .. })),
                "len {} gave {:?}",
                len,
                err
            );
        }
        assert!(Parser::parse(Connection::Bluetooth, &[DELIMITER, 0x20]).is_err());
    }

    #[test]
    fn logon_password_encoding() {
        let request = Request::logon(Identity::ANY, UserGroup::User, "0000", 0x5F00_0000).unwrap();
        assert_eq!(request.control2, 0x0100);
        assert_eq!(request.payload.len(), 32);
        assert_eq!(request.payload[0..4], CMD_LOGON.to_le_bytes());
        assert_eq!(request.payload[20..24], [0xB8, 0xB8, 0xB8, 0xB8]);
        assert_eq!(request.payload[24..32], [0x88; 8]);

        assert!(Request::logon(Identity::ANY, UserGroup::Installer, "0123456789abc", 0).is_err());
    }

    #[test]
    fn trailer_collision_is_detected() {
        let factory = FrameFactory::new(Connection::Bluetooth, BtAddress::UNKNOWN);
        assert!(!factory.trailer_is_clean(&[0x00, 0x7E, 0x01, 0x7E]));
        assert!(!factory.trailer_is_clean(&[0x00, 0x01, 0x7D, 0x7E]));
        assert!(factory.trailer_is_clean(&[0x00, 0x01, 0x02, 0x7E]));

        let speedwire = FrameFactory::new(Connection::Speedwire, BtAddress::UNKNOWN);
        assert!(speedwire.trailer_is_clean(&[0x7E, 0x7E, 0x7E]));
    }
}
