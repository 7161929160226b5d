use clap::Parser;

/// SMA Bridge - reads SMA inverters over Speedwire or Bluetooth
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Options {
    /// Config file to read
    #[clap(short = 'c', long = "config", default_value = "config.yaml")]
    pub config_file: String,

    /// Optional runtime limit in seconds
    #[clap(short = 't', long = "time")]
    pub runtime: Option<u64>,

    /// Run one live and archive cycle, then exit
    #[clap(long = "once")]
    pub once: bool,
}

impl Options {
    pub fn new() -> Self {
        Self::parse()
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags() {
        let options = Options::parse_from(["sma-bridge", "-c", "plant.yaml", "--once", "-t", "60"]);
        assert_eq!(options.config_file, "plant.yaml");
        assert_eq!(options.runtime, Some(60));
        assert!(options.once);

        let options = Options::parse_from(["sma-bridge"]);
        assert_eq!(options.config_file, "config.yaml");
        assert!(!options.once);
    }
}
