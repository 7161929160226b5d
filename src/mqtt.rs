use crate::archive::{DayArchive, MonthArchive};
use crate::coordinator::PacketStats;
use crate::export::{DeviceInfo, Exporter};
use crate::prelude::*;
use crate::sma::records::{BatterySnapshot, EventRecord, LiveSnapshot};

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, QoS};
use serde_json::json;
use std::sync::{Arc, Mutex};

// Message {{{
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub retain: bool,
    pub payload: String,
}

impl Message {
    pub fn for_live(device: &DeviceInfo, live: &LiveSnapshot) -> Result<Message> {
        Ok(Message {
            topic: format!("{}/live", device.serial),
            retain: false,
            payload: serde_json::to_string(&json!({ "device": device, "live": live }))?,
        })
    }

    pub fn for_battery(device: &DeviceInfo, timestamp: i64, battery: &BatterySnapshot) -> Result<Message> {
        Ok(Message {
            topic: format!("{}/battery", device.serial),
            retain: false,
            payload: serde_json::to_string(&json!({
                "device": device,
                "timestamp": timestamp,
                "battery": battery,
            }))?,
        })
    }

    pub fn for_day(device: &DeviceInfo, day: &DayArchive) -> Result<Message> {
        let slots: Vec<_> = day.filled().map(|(_, slot)| slot).collect();
        Ok(Message {
            topic: format!("{}/day", device.serial),
            retain: true,
            payload: serde_json::to_string(&json!({
                "device": device,
                "date": day.date,
                "missing_records": day.missing_records,
                "slots": slots,
            }))?,
        })
    }

    pub fn for_month(device: &DeviceInfo, month: &MonthArchive) -> Result<Message> {
        let slots: Vec<_> = month.filled().map(|(_, slot)| slot).collect();
        Ok(Message {
            topic: format!("{}/month", device.serial),
            retain: true,
            payload: serde_json::to_string(&json!({
                "device": device,
                "year": month.year,
                "month": month.month,
                "slots": slots,
            }))?,
        })
    }

    pub fn for_events(device: &DeviceInfo, events: &[EventRecord]) -> Result<Message> {
        Ok(Message {
            topic: format!("{}/events", device.serial),
            retain: false,
            payload: serde_json::to_string(&json!({ "device": device, "events": events }))?,
        })
    }
} // }}}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ChannelData {
    Message(Message),
    Shutdown,
}

pub type Sender = broadcast::Sender<ChannelData>;

#[derive(Clone)]
pub struct Mqtt {
    config: config::Mqtt,
    channels: Channels,
    shared_stats: Arc<Mutex<PacketStats>>,
}

impl Mqtt {
    pub fn new(config: config::Mqtt, channels: Channels, shared_stats: Arc<Mutex<PacketStats>>) -> Self {
        Self {
            config,
            channels,
            shared_stats,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let c = &self.config;

        let mut options = MqttOptions::new("sma-bridge", c.host(), c.port());

        let will = LastWill {
            topic: self.lwt_topic(),
            message: bytes::Bytes::from("offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        };
        options.set_last_will(will);

        options.set_keep_alive(std::time::Duration::from_secs(60));
        if let (Some(u), Some(p)) = (c.username(), c.password()) {
            options.set_credentials(u, p);
        }

        info!("initializing mqtt at {}:{}", c.host(), c.port());

        let (client, eventloop) = AsyncClient::new(options, 10);
        let receiver = self.channels.to_mqtt.subscribe();

        futures::try_join!(
            self.setup(client.clone()),
            self.connection(eventloop),
            self.sender(client, receiver)
        )?;

        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.channels.to_mqtt.send(ChannelData::Shutdown);
    }

    async fn setup(&self, client: AsyncClient) -> Result<()> {
        client
            .publish(self.lwt_topic(), QoS::AtLeastOnce, true, "online")
            .await?;
        Ok(())
    }

    // drives the connection; nothing is subscribed so incoming traffic is acks only
    async fn connection(&self, mut eventloop: EventLoop) -> Result<()> {
        let mut shutdown = self.channels.to_mqtt.subscribe();

        loop {
            tokio::select! {
                msg = shutdown.recv() => {
                    if matches!(msg, Ok(ChannelData::Shutdown) | Err(broadcast::error::RecvError::Closed)) {
                        break;
                    }
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => info!("mqtt connected"),
                    Ok(_) => {}
                    Err(e) => {
                        error!("{}", e);
                        info!("reconnecting in 5s");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    }
                },
            }
        }

        info!("MQTT connection loop exiting");
        Ok(())
    }

    async fn sender(
        &self,
        client: AsyncClient,
        mut receiver: broadcast::Receiver<ChannelData>,
    ) -> Result<()> {
        use ChannelData::*;

        loop {
            match receiver.recv().await? {
                Shutdown => {
                    let _ = client.disconnect().await;
                    break;
                }
                Message(message) => {
                    let topic = format!("{}/{}", self.config.namespace(), message.topic);
                    debug!("publishing: {} ({} bytes)", topic, message.payload.len());

                    let mut attempt = 1;
                    loop {
                        match client
                            .publish(&topic, QoS::AtLeastOnce, message.retain, message.payload.as_bytes())
                            .await
                        {
                            Ok(_) => {
                                if let Ok(mut stats) = self.shared_stats.lock() {
                                    stats.mqtt_messages_sent += 1;
                                }
                                break;
                            }
                            Err(err) => {
                                if let Ok(mut stats) = self.shared_stats.lock() {
                                    stats.mqtt_errors += 1;
                                }
                                if attempt >= 3 {
                                    error!("MQTT publish to {} failed, giving up: {:?}", topic, err);
                                    break;
                                }
                                error!(
                                    "MQTT publish failed: {:?} - retrying in 10s (attempt {}/3)",
                                    err, attempt
                                );
                                tokio::time::sleep(std::time::Duration::from_secs(10)).await;
                                attempt += 1;
                            }
                        }
                    }
                }
            }
        }

        info!("MQTT sender loop exiting");
        Ok(())
    }

    fn publish(&self, message: Message) -> Result<()> {
        if self.channels.to_mqtt.send(ChannelData::Message(message)).is_err() {
            bail!("send(to_mqtt) failed - channel closed?");
        }
        Ok(())
    }

    fn lwt_topic(&self) -> String {
        format!("{}/LWT", self.config.namespace())
    }
}

#[async_trait]
impl Exporter for Mqtt {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn export_live(&self, device: &DeviceInfo, live: &LiveSnapshot) -> Result<()> {
        self.publish(Message::for_live(device, live)?)
    }

    async fn export_day(&self, device: &DeviceInfo, day: &DayArchive) -> Result<()> {
        self.publish(Message::for_day(device, day)?)
    }

    async fn export_month(&self, device: &DeviceInfo, month: &MonthArchive) -> Result<()> {
        self.publish(Message::for_month(device, month)?)
    }

    async fn export_events(&self, device: &DeviceInfo, events: &[EventRecord]) -> Result<()> {
        self.publish(Message::for_events(device, events)?)
    }

    async fn export_battery(
        &self,
        device: &DeviceInfo,
        timestamp: i64,
        battery: &BatterySnapshot,
    ) -> Result<()> {
        self.publish(Message::for_battery(device, timestamp, battery)?)
    }
}
