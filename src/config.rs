use crate::prelude::*;

use serde_with::{serde_as, DurationSeconds};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "Config::default_connection")]
    pub connection: Connection,

    #[serde(default = "Config::default_user_group")]
    pub user_group: UserGroup,
    pub password: String,

    #[serde(default = "Vec::new")]
    pub inverters: Vec<Inverter>,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "timeout_secs", default = "Config::default_timeout")]
    pub timeout: Duration,
    #[serde(default = "Config::default_retries")]
    pub max_retries: u32,
    #[serde(default = "Config::default_retries")]
    pub connect_attempts: u32,

    #[serde(default = "Config::default_archive_depth")]
    pub archive_days: u32,
    #[serde(default = "Config::default_archive_depth")]
    pub archive_months: u32,
    #[serde(default = "Config::default_archive_depth")]
    pub archive_events_months: u32,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "poll_interval_secs", default = "Config::default_poll_interval")]
    pub poll_interval: Duration,
    pub archive_cron: Option<String>,

    /// Drive every configured Speedwire device at once instead of in turn.
    #[serde(default)]
    pub concurrent: bool,

    pub datalog: Option<Datalog>,
    pub mqtt: Option<Mqtt>,
    #[serde(default = "Vec::new")]
    pub databases: Vec<Database>,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,
}

// Inverter {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Inverter {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub host: Option<String>,
    pub bt_address: Option<String>,
    /// Serial device bound to the Bluetooth link, e.g. /dev/rfcomm0
    pub device: Option<String>,

    pub name: Option<String>,
    #[serde(default = "Vec::new")]
    pub array_names: Vec<String>,
}

impl Inverter {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    pub fn ip(&self) -> Result<Option<IpAddr>> {
        match &self.host {
            Some(host) => Ok(Some(
                host.parse()
                    .map_err(|e| anyhow!("config.rs:invalid host {}: {}", host, e))?,
            )),
            None => Ok(None),
        }
    }

    pub fn bt_address(&self) -> Result<Option<BtAddress>> {
        self.bt_address.as_deref().map(BtAddress::from_str).transpose()
    }

    pub fn address(&self, connection: Connection) -> Result<Address> {
        match connection {
            Connection::Speedwire => self
                .ip()?
                .map(Address::unicast)
                .ok_or_else(|| anyhow!("config.rs:speedwire inverter needs a host")),
            Connection::Bluetooth => self
                .bt_address()?
                .map(Address::Bluetooth)
                .ok_or_else(|| anyhow!("config.rs:bluetooth inverter needs a bt_address")),
        }
    }
} // }}}

// Datalog {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Datalog {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub directory: String,
    #[serde(default = "Config::default_delimiter")]
    pub delimiter: char,
}

impl Datalog {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn directory(&self) -> &str {
        &self.directory
    }

    pub fn delimiter(&self) -> char {
        self.delimiter
    }
} // }}}

// Mqtt {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Mqtt {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub host: String,
    #[serde(default = "Config::default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default = "Config::default_mqtt_namespace")]
    pub namespace: String,
}

impl Mqtt {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &Option<String> {
        &self.username
    }

    pub fn password(&self) -> &Option<String> {
        &self.password
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
} // }}}

// Database {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Database {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub url: String,
}

impl Database {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn url(&self) -> &str {
        &self.url
    }
} // }}}

#[derive(Clone, Debug)]
pub struct ConfigWrapper {
    config: Arc<Config>,
}

impl ConfigWrapper {
    pub fn new(file: String) -> Result<Self> {
        Ok(Self::from_config(Config::new(file)?))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn connection(&self) -> Connection {
        self.config.connection
    }

    pub fn user_group(&self) -> UserGroup {
        self.config.user_group
    }

    pub fn password(&self) -> &str {
        &self.config.password
    }

    pub fn inverters(&self) -> Vec<Inverter> {
        self.config.inverters.clone()
    }

    pub fn enabled_inverters(&self) -> Vec<Inverter> {
        self.inverters().into_iter().filter(|i| i.enabled()).collect()
    }

    pub fn timeout_secs(&self) -> u64 {
        self.config.timeout.as_secs()
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    pub fn connect_attempts(&self) -> u32 {
        self.config.connect_attempts.max(1)
    }

    pub fn archive_days(&self) -> u32 {
        self.config.archive_days
    }

    pub fn archive_months(&self) -> u32 {
        self.config.archive_months
    }

    pub fn archive_events_months(&self) -> u32 {
        self.config.archive_events_months
    }

    pub fn poll_interval(&self) -> Duration {
        self.config.poll_interval
    }

    pub fn archive_cron(&self) -> Option<String> {
        self.config.archive_cron.clone()
    }

    pub fn concurrent(&self) -> bool {
        self.config.concurrent
    }

    pub fn datalog(&self) -> Option<Datalog> {
        self.config.datalog.clone().filter(|d| d.enabled())
    }

    pub fn mqtt(&self) -> Option<Mqtt> {
        self.config.mqtt.clone().filter(|m| m.enabled())
    }

    pub fn databases(&self) -> Vec<Database> {
        self.config.databases.clone()
    }

    pub fn enabled_databases(&self) -> Vec<Database> {
        self.databases().into_iter().filter(|d| d.enabled()).collect()
    }

    pub fn loglevel(&self) -> String {
        self.config.loglevel.clone()
    }

    pub fn log_summary(&self) {
        self.config.log_summary();
    }
}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        info!("Reading configuration from {}", file);
        let content = std::fs::read_to_string(&file)
            .map_err(|err| anyhow!("config.rs:error reading {}: {}", file, err))?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn log_summary(&self) {
        info!("Configuration loaded successfully:");
        info!("  Connection: {:?}, user group {:?}", self.connection, self.user_group);
        info!(
            "  Inverters: {} configured, {} enabled",
            self.inverters.len(),
            self.inverters.iter().filter(|i| i.enabled).count()
        );
        for (i, inv) in self.inverters.iter().enumerate() {
            info!("    Inverter[{}]:", i);
            info!("      Enabled: {}", inv.enabled);
            if let Some(host) = &inv.host {
                info!("      Host: {}", host);
            }
            if let Some(bt) = &inv.bt_address {
                info!("      Bluetooth: {} via {}", bt, inv.device.as_deref().unwrap_or("-"));
            }
            if let Some(name) = &inv.name {
                info!("      Name: {}", name);
            }
        }
        info!(
            "  Timeout: {}s, {} retries, {} connect attempts",
            self.timeout.as_secs(),
            self.max_retries,
            self.connect_attempts
        );
        info!(
            "  Archive depth: {} days, {} months, {} event months",
            self.archive_days, self.archive_months, self.archive_events_months
        );
        info!("  Poll interval: {}s", self.poll_interval.as_secs());
        if let Some(cron) = &self.archive_cron {
            info!("  Archive cron: {}", cron);
        }
        info!("  Concurrent: {}", self.concurrent);
        info!(
            "  Datalog: {}",
            if self.datalog.as_ref().is_some_and(|d| d.enabled) { "enabled" } else { "disabled" }
        );
        info!(
            "  MQTT: {}",
            if self.mqtt.as_ref().is_some_and(|m| m.enabled) { "enabled" } else { "disabled" }
        );
        info!(
            "  Databases: {} configured, {} enabled",
            self.databases.len(),
            self.databases.iter().filter(|d| d.enabled).count()
        );
        info!("  Log Level: {}", self.loglevel);
    }

    fn validate(&self) -> Result<()> {
        if self.password.is_empty() {
            bail!("password cannot be empty");
        }
        if self.password.len() > crate::sma::packet::PASSWORD_LEN {
            bail!(
                "password must be at most {} characters",
                crate::sma::packet::PASSWORD_LEN
            );
        }

        if self.timeout.is_zero() {
            return Err(anyhow!("config.rs:Invalid timeout: 0"));
        }
        if self.poll_interval.is_zero() {
            return Err(anyhow!("config.rs:Invalid poll interval: 0"));
        }

        for (i, inv) in self.inverters.iter().enumerate() {
            if !inv.enabled {
                continue;
            }
            inv.address(self.connection)
                .map_err(|e| anyhow!("inverter[{}]: {}", i, e))?;
            if self.connection == Connection::Bluetooth && inv.device.is_none() {
                bail!("inverter[{}].device is required for bluetooth", i);
            }
        }

        if self.connection == Connection::Bluetooth && self.inverters.iter().all(|i| !i.enabled) {
            bail!("bluetooth needs at least one enabled inverter");
        }
        if self.concurrent && self.connection == Connection::Bluetooth {
            bail!("concurrent mode is only available for speedwire");
        }

        if let Some(mqtt) = &self.mqtt {
            if mqtt.enabled {
                if mqtt.port == 0 {
                    bail!("mqtt.port must be between 1 and 65535");
                }
                if mqtt.host.is_empty() {
                    return Err(anyhow!("config.rs:MQTT host cannot be empty"));
                }
            }
        }

        if let Some(datalog) = &self.datalog {
            if datalog.enabled && datalog.directory.is_empty() {
                return Err(anyhow!("config.rs:datalog directory cannot be empty"));
            }
        }

        for db in &self.databases {
            if db.enabled {
                if let Err(e) = url::Url::parse(db.url()) {
                    return Err(anyhow!("config.rs:Invalid database URL: {}", e));
                }
            }
        }

        if let Some(cron) = &self.archive_cron {
            if let Err(e) = cron_parser::parse(cron, &chrono::Utc::now()) {
                return Err(anyhow!("config.rs:Invalid archive_cron {}: {:?}", cron, e));
            }
        }

        Ok(())
    }

    fn default_connection() -> Connection {
        Connection::Speedwire
    }

    fn default_user_group() -> UserGroup {
        UserGroup::User
    }

    fn default_timeout() -> Duration {
        Duration::from_secs(5)
    }

    fn default_retries() -> u32 {
        3
    }

    fn default_archive_depth() -> u32 {
        1
    }

    fn default_poll_interval() -> Duration {
        Duration::from_secs(300)
    }

    fn default_delimiter() -> char {
        ';'
    }

    fn default_mqtt_port() -> u16 {
        1883
    }

    fn default_mqtt_namespace() -> String {
        "sma".to_string()
    }

    fn default_enabled() -> bool {
        true
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }
}
