pub use anyhow::{anyhow, bail, Error, Result};
pub use log::{debug, error, info, trace, warn};
pub use serde::{Deserialize, Serialize};
pub use std::io::Write;
pub use std::str::FromStr;
pub use tokio::sync::{broadcast, mpsc, oneshot};

pub use crate::channels::Channels;
pub use crate::config::{self, Config, ConfigWrapper};
pub use crate::error::ProtocolError;
pub use crate::options::Options;
pub use crate::sma::inverter::{Address, BtAddress, DeviceClass, Identity};
pub use crate::sma::packet::{Connection, UserGroup};
pub use crate::{file_error, file_error_with_source};
