use crate::prelude::*;

pub mod commands;
pub mod plant;
pub mod session;

use commands::discover::Discover;
use commands::identify::BluetoothHandshake;
use plant::{Cycle, Plant, Settings, Target};

use crate::sma::exchange::{Exchange, SessionContext};
use crate::sma::inverter::{Multiplexer, StreamTransport, Transport, UdpTransport};

use chrono::Local;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelData {
    Cycle(Cycle),
    Shutdown,
}

#[derive(Debug, Default)]
pub struct PacketStats {
    pub cycles: u64,
    pub cycles_failed: u64,
    // Plant data
    pub live_polls: u64,
    pub day_archives: u64,
    pub month_archives: u64,
    pub event_records: u64,
    // Session problems
    pub identify_failures: u64,
    pub invalid_passwords: u64,
    // Exporters
    pub mqtt_messages_sent: u64,
    pub mqtt_errors: u64,
    pub database_writes: u64,
    pub database_errors: u64,
    // Failures by device serial
    pub device_failures: HashMap<u32, u64>,
    pub last_errors: HashMap<u32, String>,
}

impl PacketStats {
    pub fn device_failed(&mut self, serial: u32, message: String) {
        *self.device_failures.entry(serial).or_insert(0) += 1;
        self.last_errors.insert(serial, message);
    }

    pub fn print_summary(&self) {
        info!("Plant Statistics:");
        info!("  Cycles run: {}", self.cycles);
        info!("  Cycles failed: {}", self.cycles_failed);
        info!("  Data read:");
        info!("    Live polls: {}", self.live_polls);
        info!("    Day archives: {}", self.day_archives);
        info!("    Month archives: {}", self.month_archives);
        info!("    Event records: {}", self.event_records);
        info!("  Sessions:");
        info!("    Identification failures: {}", self.identify_failures);
        info!("    Invalid passwords: {}", self.invalid_passwords);
        info!("  MQTT:");
        info!("    Messages sent: {}", self.mqtt_messages_sent);
        info!("    Errors: {}", self.mqtt_errors);
        info!("  Database:");
        info!("    Writes: {}", self.database_writes);
        info!("    Errors: {}", self.database_errors);
        info!("  Device failures by serial:");
        for (serial, count) in &self.device_failures {
            info!("    {}: {}", serial, count);
            if let Some(last) = self.last_errors.get(serial) {
                info!("    Last error: {}", last);
            }
        }
    }
}

#[derive(Clone)]
pub struct Coordinator {
    config: ConfigWrapper,
    channels: Channels,
    ctx: SessionContext,
    pub stats: Arc<Mutex<PacketStats>>,
}

impl Coordinator {
    pub fn new(config: ConfigWrapper, channels: Channels) -> Self {
        let ctx = SessionContext::from_config(&config);
        Self {
            config,
            channels,
            ctx,
            stats: Arc::new(Mutex::new(PacketStats::default())),
        }
    }

    /// Runs a plant cycle for every request on the coordinator channel
    /// until told to shut down.
    pub async fn start(&self) -> Result<()> {
        let mut receiver = self.channels.to_coordinator.subscribe();

        loop {
            match receiver.recv().await {
                Ok(ChannelData::Cycle(cycle)) => {
                    if let Err(e) = self.cycle(cycle).await {
                        error!("{:?} cycle failed: {:#}", cycle, e);
                        if let Ok(mut stats) = self.stats.lock() {
                            stats.cycles_failed += 1;
                        }
                    }
                }
                Ok(ChannelData::Shutdown) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(n)) => warn!("{} cycle requests dropped while busy", n),
            }
        }

        info!("coordinator loop exiting");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.channels.to_coordinator.send(ChannelData::Shutdown);
    }

    pub async fn cycle(&self, cycle: Cycle) -> Result<()> {
        info!("starting {:?} cycle", cycle);
        if let Ok(mut stats) = self.stats.lock() {
            stats.cycles += 1;
        }

        match self.config.connection() {
            Connection::Speedwire if self.config.concurrent() => self.speedwire_concurrent(cycle).await,
            Connection::Speedwire => self.speedwire(cycle).await,
            Connection::Bluetooth => self.bluetooth(cycle).await,
        }
    }

    fn plant(&self) -> Plant {
        Plant::new(Settings::from_config(&self.config), self.stats.clone())
            .with_exporters(self.channels.to_exporters.clone())
    }

    async fn speedwire(&self, cycle: Cycle) -> Result<()> {
        let mut transport = self.connect("udp socket", || async { UdpTransport::bind() }).await?;
        let targets = self.speedwire_targets(&mut transport).await?;

        let mut exchange = Exchange::new(&self.ctx, &mut transport);
        self.plant()
            .run(&mut exchange, &targets, cycle, Local::now())
            .await
    }

    // one session per host, all sharing the socket and sequence counter
    async fn speedwire_concurrent(&self, cycle: Cycle) -> Result<()> {
        let mut transport = self.connect("udp socket", || async { UdpTransport::bind() }).await?;
        let targets = self.speedwire_targets(&mut transport).await?;

        let multiplexer = Multiplexer::new(transport);
        let now = Local::now();

        let sessions: Vec<_> = targets
            .iter()
            .filter_map(|target| {
                let mut channel = multiplexer.channel(target.address.ip()?);
                let ctx = self.ctx.fork();
                let mut plant = self.plant();

                Some(async move {
                    let mut exchange = Exchange::new(&ctx, &mut channel);
                    let result = plant
                        .run(&mut exchange, std::slice::from_ref(target), cycle, now)
                        .await;
                    (target.address, result)
                })
            })
            .collect();

        let sessions = async {
            let results = futures::future::join_all(sessions).await;
            multiplexer.stop();
            results
        };
        let (results, routed) = tokio::join!(sessions, multiplexer.run());
        routed?;

        let mut failures = 0;
        for (address, result) in &results {
            if let Err(e) = result {
                error!("{}: session failed: {:#}", address, e);
                failures += 1;
            }
        }
        if !results.is_empty() && failures == results.len() {
            bail!("no device session succeeded");
        }

        Ok(())
    }

    async fn speedwire_targets(&self, transport: &mut dyn Transport) -> Result<Vec<Target>> {
        let targets = self
            .config
            .enabled_inverters()
            .iter()
            .map(|inverter| Target::from_inverter(inverter, Connection::Speedwire))
            .collect::<Result<Vec<_>>>()?;

        if !targets.is_empty() {
            return Ok(targets);
        }

        info!("no hosts configured, discovering devices");
        let found = Discover::new(self.ctx.timeout).run(transport).await?;
        info!("discovered {} devices", found.len());

        Ok(found
            .into_iter()
            .map(|ip| Target::new(Address::unicast(ip)))
            .collect())
    }

    async fn bluetooth(&self, cycle: Cycle) -> Result<()> {
        let inverters = self.config.enabled_inverters();

        let mut failures = 0;
        for inverter in &inverters {
            if let Err(e) = self.bluetooth_session(inverter, cycle).await {
                error!(
                    "{}: bluetooth session failed: {:#}",
                    inverter.bt_address.as_deref().unwrap_or("?"),
                    e
                );
                failures += 1;
            }
        }

        if !inverters.is_empty() && failures == inverters.len() {
            bail!("no bluetooth session succeeded");
        }
        Ok(())
    }

    async fn bluetooth_session(&self, inverter: &config::Inverter, cycle: Cycle) -> Result<()> {
        let target = Target::from_inverter(inverter, Connection::Bluetooth)?;
        let peer = target
            .address
            .bt()
            .ok_or_else(|| anyhow!("coordinator: {} is not a bluetooth address", target.address))?;
        let device = inverter
            .device()
            .ok_or_else(|| anyhow!("coordinator: no serial device configured for {}", peer))?;

        let mut transport = self
            .connect(device, || StreamTransport::open(device, peer))
            .await?;

        let mut ctx = self.ctx.fork();
        let net_id = BluetoothHandshake::new(peer).run(&mut ctx, &mut transport).await?;
        debug!("{}: joined network {} as {}", peer, net_id, ctx.local_bt);

        let mut exchange = Exchange::new(&ctx, &mut transport);
        self.plant()
            .run(&mut exchange, &[target], cycle, Local::now())
            .await
    }

    async fn connect<T, F, Fut>(&self, what: &str, open: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.connect_attempts();
        let mut attempt = 1;

        loop {
            match open().await {
                Ok(transport) => return Ok(transport),
                Err(e) if attempt < attempts => {
                    warn!(
                        "opening {} failed: {:#} - retrying in 5s (attempt {}/{})",
                        what, e, attempt, attempts
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.context(format!("opening {} failed", what))),
            }
        }
    }
}
