use crate::coordinator::plant::Cycle;
use crate::coordinator::ChannelData;
use crate::prelude::*;

use chrono::{DateTime, TimeZone};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

/// Time until `expr` next fires after `now`.
pub fn until_next<Tz: TimeZone>(expr: &str, now: &DateTime<Tz>) -> Result<Duration> {
    let next = cron_parser::parse(expr, now)
        .map_err(|e| anyhow!("scheduler.rs:invalid archive_cron {:?}: {:?}", expr, e))?;
    Ok((next - now.clone()).to_std().unwrap_or(Duration::ZERO))
}

/// Asks the coordinator for a live cycle every poll interval and for an
/// archive cycle whenever `archive_cron` fires. Without a cron expression
/// every cycle fetches archives too.
#[derive(Clone)]
pub struct Scheduler {
    config: ConfigWrapper,
    channels: Channels,
}

impl Scheduler {
    pub fn new(config: ConfigWrapper, channels: Channels) -> Self {
        Self { config, channels }
    }

    pub async fn start(&self) -> Result<()> {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut receiver = self.channels.to_coordinator.subscribe();

        let cron = self.config.archive_cron();
        let live_cycle = if cron.is_some() { Cycle::Live } else { Cycle::Full };

        loop {
            let archive_in = match &cron {
                Some(expr) => Some(until_next(expr, &chrono::Local::now())?),
                None => None,
            };
            let archive = async {
                match archive_in {
                    Some(wait) => tokio::time::sleep(wait).await,
                    None => futures::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = interval.tick() => self.request(live_cycle)?,
                _ = archive => {
                    self.request(Cycle::Archive)?;
                    // step past the minute that just fired
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                message = receiver.recv() => match message {
                    Ok(ChannelData::Shutdown) | Err(RecvError::Closed) => break,
                    _ => {}
                },
            }
        }

        info!("scheduler loop exiting");
        Ok(())
    }

    fn request(&self, cycle: Cycle) -> Result<()> {
        debug!("requesting {:?} cycle", cycle);
        if self
            .channels
            .to_coordinator
            .send(ChannelData::Cycle(cycle))
            .is_err()
        {
            bail!("send(to_coordinator) failed - channel closed?");
        }
        Ok(())
    }
}
