use crate::prelude::*;
use crate::sma::decoder::SerialFrameDecoder;
use crate::sma::packet::{Connection, MULTICAST_ADDR, PORT};

use {
    async_trait::async_trait,
    bytes::BytesMut,
    nom::{number::complete::{le_u16, le_u32}, IResult},
    num_enum::{FromPrimitive, IntoPrimitive},
    serde::{Serialize, Serializer},
    std::collections::HashMap,
    std::net::{IpAddr, Ipv4Addr, SocketAddr},
    std::sync::{Arc, Mutex},
    std::time::Duration,
    tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    tokio::net::UdpSocket,
    tokio_util::codec::Decoder,
};

// Identity {{{
/// Device identity on the SMA data link: system id plus serial number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Identity {
    pub susy_id: u16,
    pub serial: u32,
}

impl Identity {
    /// Wildcard destination, accepted by every device.
    pub const ANY: Identity = Identity {
        susy_id: 0xFFFF,
        serial: 0xFFFF_FFFF,
    };

    pub const APP_SUSY_ID: u16 = 125;
    const APP_SERIAL_BASE: u32 = 900_000_000;

    pub fn new(susy_id: u16, serial: u32) -> Self {
        Self { susy_id, serial }
    }

    /// Our own identity for a session. The serial is randomised so that two
    /// clients on the same network do not collide.
    pub fn app() -> Self {
        use rand::Rng;
        let offset: u32 = rand::thread_rng().gen_range(0..100_000_000);
        Self::new(Self::APP_SUSY_ID, Self::APP_SERIAL_BASE + offset)
    }

    pub fn is_any(&self) -> bool {
        *self == Self::ANY
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, susy_id) = le_u16(input)?;
        let (input, serial) = le_u32(input)?;
        Ok((input, Self { susy_id, serial }))
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.serial)
    }
} // }}}

// BtAddress {{{
/// Bluetooth device address, held in the byte order it travels on the wire
/// (reversed relative to the usual text form).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BtAddress([u8; 6]);

impl BtAddress {
    pub const UNKNOWN: BtAddress = BtAddress([0x00; 6]);
    pub const BROADCAST: BtAddress = BtAddress([0xFF; 6]);

    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 6] = bytes
            .try_into()
            .map_err(|_| ProtocolError::Format(format!("bad bluetooth address length {}", bytes.len())))?;
        Ok(Self(bytes))
    }

    pub fn as_wire(&self) -> &[u8; 6] {
        &self.0
    }
}

impl std::str::FromStr for BtAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(anyhow!("{} is not a bluetooth address", s));
        }

        let mut r = [0u8; 6];
        for (slot, part) in r.iter_mut().rev().zip(parts) {
            *slot = u8::from_str_radix(part, 16).map_err(|e| anyhow!("{}: {}", s, e))?;
        }
        Ok(Self(r))
    }
}

impl std::fmt::Display for BtAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[5], b[4], b[3], b[2], b[1], b[0]
        )
    }
}

impl std::fmt::Debug for BtAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl Serialize for BtAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
} // }}}

// Address {{{
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(SocketAddr),
    Bluetooth(BtAddress),
}

impl Address {
    pub fn multicast() -> Self {
        Self::Ip(SocketAddr::new(IpAddr::V4(MULTICAST_ADDR), PORT))
    }

    pub fn unicast(ip: IpAddr) -> Self {
        Self::Ip(SocketAddr::new(ip, PORT))
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Self::Ip(addr) => Some(addr.ip()),
            Self::Bluetooth(_) => None,
        }
    }

    pub fn bt(&self) -> Option<BtAddress> {
        match self {
            Self::Bluetooth(addr) => Some(*addr),
            Self::Ip(_) => None,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{}", addr.ip()),
            Self::Bluetooth(addr) => write!(f, "{}", addr),
        }
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
} // }}}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, FromPrimitive, IntoPrimitive, Serialize)]
#[repr(u32)]
pub enum DeviceClass {
    AllDevices = 8000,
    SolarInverter = 8001,
    WindTurbineInverter = 8002,
    BatteryInverter = 8007,
    EnergyMeter = 8065,
    CommunicationProduct = 8128,
    #[num_enum(catch_all)]
    Other(u32),
}

impl DeviceClass {
    pub fn is_gateway(&self) -> bool {
        *self == DeviceClass::CommunicationProduct
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datagram {
    pub bytes: Vec<u8>,
    pub from: Address,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelData {
    Datagram(Datagram),
    Shutdown,
}
pub type Sender = mpsc::UnboundedSender<ChannelData>;
pub type Receiver = mpsc::UnboundedReceiver<ChannelData>;

/// A byte pipe to one or more devices. `receive` returns `Ok(None)` when
/// nothing arrives within the timeout.
#[async_trait]
pub trait Transport: Send {
    fn connection(&self) -> Connection;

    async fn send(&mut self, bytes: &[u8], to: &Address) -> Result<()>;

    async fn receive(&mut self, timeout: Duration) -> Result<Option<Datagram>>;
}

// UdpTransport {{{
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub fn bind() -> Result<Self> {
        let std_socket = net2::UdpBuilder::new_v4()?
            .reuse_address(true)?
            .bind((Ipv4Addr::UNSPECIFIED, PORT))
            .map_err(|e| file_error_with_source!(e, "failed to bind udp port {}", PORT))?;

        if let Err(e) = std_socket.join_multicast_v4(&MULTICAST_ADDR, &Ipv4Addr::UNSPECIFIED) {
            warn!("failed to join multicast group {}: {}", MULTICAST_ADDR, e);
        }
        if let Err(e) = std_socket.set_multicast_loop_v4(false) {
            warn!("failed to disable multicast loopback: {}", e);
        }
        std_socket.set_nonblocking(true)?;

        Ok(Self {
            socket: Arc::new(UdpSocket::from_std(std_socket)?),
        })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn connection(&self) -> Connection {
        Connection::Speedwire
    }

    async fn send(&mut self, bytes: &[u8], to: &Address) -> Result<()> {
        send_udp(&self.socket, bytes, to).await
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<Datagram>> {
        let mut buf = vec![0u8; 2048];
        match tokio::time::timeout(timeout, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                buf.truncate(len);
                Ok(Some(Datagram {
                    bytes: buf,
                    from: Address::Ip(from),
                }))
            }
            Ok(Err(e)) => Err(ProtocolError::CommunicationError(e.to_string()).into()),
            Err(_) => Ok(None),
        }
    }
}

async fn send_udp(socket: &UdpSocket, bytes: &[u8], to: &Address) -> Result<()> {
    let Address::Ip(addr) = to else {
        return Err(ProtocolError::BadArgument(format!("{} is not an ip address", to)).into());
    };
    socket
        .send_to(bytes, addr)
        .await
        .map_err(|e| ProtocolError::CommunicationError(e.to_string()))?;
    Ok(())
} // }}}

// StreamTransport {{{
/// Serial link to a single device, typically an rfcomm tty.
pub struct StreamTransport<S> {
    stream: S,
    peer: Address,
    buf: BytesMut,
    decoder: SerialFrameDecoder,
}

const MAX_BUFFER_SIZE: usize = 65536;

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, peer: BtAddress) -> Self {
        Self {
            stream,
            peer: Address::Bluetooth(peer),
            buf: BytesMut::with_capacity(4096),
            decoder: SerialFrameDecoder::new(),
        }
    }

    fn datagram(&self, bytes: Vec<u8>) -> Datagram {
        let from = bytes
            .get(4..10)
            .and_then(|b| BtAddress::from_wire(b).ok())
            .map(Address::Bluetooth)
            .unwrap_or(self.peer);
        Datagram { bytes, from }
    }
}

impl StreamTransport<tokio::fs::File> {
    pub async fn open(path: &str, peer: BtAddress) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await
            .map_err(|e| file_error_with_source!(e, "failed to open {}", path))?;

        info!("opened serial link {} to {}", path, peer);
        Ok(Self::new(file, peer))
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn connection(&self) -> Connection {
        Connection::Bluetooth
    }

    async fn send(&mut self, bytes: &[u8], _to: &Address) -> Result<()> {
        self.stream
            .write_all(bytes)
            .await
            .map_err(|e| ProtocolError::CommunicationError(e.to_string()))?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<Datagram>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(bytes) = self.decoder.decode(&mut self.buf)? {
                return Ok(Some(self.datagram(bytes)));
            }

            if self.buf.len() >= MAX_BUFFER_SIZE {
                return Err(ProtocolError::BufferOverflow(self.buf.len()).into());
            }

            match tokio::time::timeout_at(deadline, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(0)) => {
                    return Err(ProtocolError::CommunicationError("link closed by peer".to_string()).into())
                }
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => return Err(ProtocolError::CommunicationError(e.to_string()).into()),
                Err(_) => return Ok(None),
            }
        }
    }
} // }}}

// Multiplexer {{{
/// Shares one UDP socket between concurrent device sessions, routing
/// incoming datagrams by source address.
pub struct Multiplexer {
    socket: Arc<UdpSocket>,
    routes: Arc<Mutex<HashMap<IpAddr, Sender>>>,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl Multiplexer {
    pub fn new(transport: UdpTransport) -> Self {
        let (shutdown, _) = tokio::sync::watch::channel(false);
        Self {
            socket: transport.socket,
            routes: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
        }
    }

    pub fn channel(&self, ip: IpAddr) -> ChannelTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut routes) = self.routes.lock() {
            routes.insert(ip, tx);
        }
        ChannelTransport {
            socket: self.socket.clone(),
            rx,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        let mut buf = vec![0u8; 2048];

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => continue,
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = received?;
                    let datagram = Datagram {
                        bytes: buf[..len].to_vec(),
                        from: Address::Ip(from),
                    };
                    let route = self.routes.lock().ok().and_then(|r| r.get(&from.ip()).cloned());
                    match route {
                        Some(tx) => {
                            let _ = tx.send(ChannelData::Datagram(datagram));
                        }
                        None => trace!("dropping {} bytes from unrouted {}", len, from),
                    }
                }
            }
        }

        if let Ok(routes) = self.routes.lock() {
            for tx in routes.values() {
                let _ = tx.send(ChannelData::Shutdown);
            }
        }
        Ok(())
    }

    /// Ends `run`, also when called before `run` got going.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

pub struct ChannelTransport {
    socket: Arc<UdpSocket>,
    rx: Receiver,
}

impl ChannelTransport {
    pub fn new(socket: Arc<UdpSocket>, rx: Receiver) -> Self {
        Self { socket, rx }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn connection(&self) -> Connection {
        Connection::Speedwire
    }

    async fn send(&mut self, bytes: &[u8], to: &Address) -> Result<()> {
        send_udp(&self.socket, bytes, to).await
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<Datagram>> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(ChannelData::Datagram(datagram))) => Ok(Some(datagram)),
            Ok(Some(ChannelData::Shutdown)) | Ok(None) => {
                bail!("multiplexer shut down while waiting for reply")
            }
            Err(_) => Ok(None),
        }
    }
} // }}}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bt_address_is_reversed_on_the_wire() {
        let addr: BtAddress = "00:80:25:1C:2B:3A".parse().unwrap();
        assert_eq!(addr.as_wire(), &[0x3A, 0x2B, 0x1C, 0x25, 0x80, 0x00]);
        assert_eq!(addr.to_string(), "00:80:25:1C:2B:3A");
        assert!("00:80:25".parse::<BtAddress>().is_err());
        assert!("00:80:25:1C:2B:ZZ".parse::<BtAddress>().is_err());
    }

    #[test]
    fn app_identity_range() {
        for _ in 0..16 {
            let id = Identity::app();
            assert_eq!(id.susy_id, 125);
            assert!((900_000_000..1_000_000_000).contains(&id.serial));
        }
    }

    #[test]
    fn device_classes() {
        assert_eq!(DeviceClass::from(8128), DeviceClass::CommunicationProduct);
        assert!(DeviceClass::from(8128).is_gateway());
        assert_eq!(DeviceClass::from(8009), DeviceClass::Other(8009));
        assert_eq!(u32::from(DeviceClass::SolarInverter), 8001);
    }

    #[tokio::test]
    async fn stream_transport_reads_length_framed() {
        let (client, mut server) = tokio::io::duplex(256);
        let peer: BtAddress = "00:80:25:1C:2B:3A".parse().unwrap();
        let mut transport = StreamTransport::new(client, peer);

        let mut frame = vec![0u8; 22];
        frame[0] = 0x7E;
        frame[1] = 22;
        frame[3] = 0x7E ^ 22;
        frame[4..10].copy_from_slice(peer.as_wire());
        frame[21] = 0x7E;
        server.write_all(&frame).await.unwrap();

        let got = transport.receive(Duration::from_millis(200)).await.unwrap().unwrap();
        assert_eq!(got.bytes, frame);
        assert_eq!(got.from, Address::Bluetooth(peer));

        let none = transport.receive(Duration::from_millis(20)).await.unwrap();
        assert!(none.is_none());
    }
}
