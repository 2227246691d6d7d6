use crate::prelude::*;

use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub serial: Serial,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,

    #[serde(default = "Config::default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "Config::default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// Optional path for the telemetry csv; a timestamped name is picked
    /// when unset
    pub csv_file: Option<String>,

    #[serde(default = "Config::default_catalog_file")]
    pub catalog_file: String,
}

// Serial {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Serial {
    pub port: String,

    #[serde(default = "Config::default_baud")]
    pub baud: u32,

    #[serde(default = "Config::default_data_bits")]
    pub data_bits: u8,

    #[serde(default = "Config::default_parity")]
    pub parity: String,

    #[serde(default = "Config::default_stop_bits")]
    pub stop_bits: u8,
}
impl Serial {
    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn data_bits(&self) -> u8 {
        self.data_bits
    }

    pub fn parity(&self) -> &str {
        &self.parity
    }

    pub fn stop_bits(&self) -> u8 {
        self.stop_bits
    }
} // }}}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        let content = std::fs::read_to_string(&file)
            .map_err(|err| anyhow!("config.rs:error reading {}: {}", file, err))?;

        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn log_summary(&self) {
        info!("Configuration loaded successfully:");
        info!("  Serial:");
        info!("    Port: {}", self.serial.port);
        info!("    Baud: {}", self.serial.baud);
        info!("    Data Bits: {}", self.serial.data_bits);
        info!("    Parity: {}", self.serial.parity);
        info!("    Stop Bits: {}", self.serial.stop_bits);
        info!("  Poll Interval: {}ms", self.poll_interval_ms);
        info!("  Response Timeout: {}ms", self.response_timeout_ms);
        info!(
            "  CSV File: {}",
            self.csv_file.clone().unwrap_or_else(|| "(auto)".to_string())
        );
        info!("  Catalog File: {}", self.catalog_file);
        info!("  Log Level: {}", self.loglevel);
    }

    fn validate(&self) -> Result<()> {
        // Validate serial configuration
        if self.serial.port.is_empty() {
            return Err(anyhow!("config.rs:Serial port cannot be empty"));
        }
        if self.serial.baud == 0 {
            bail!("serial.baud must be greater than zero");
        }
        if !(5..=8).contains(&self.serial.data_bits) {
            bail!("serial.data_bits must be between 5 and 8");
        }
        match self.serial.parity.to_lowercase().as_str() {
            "none" | "odd" | "even" => {}
            other => bail!("serial.parity must be none, odd or even, not {:?}", other),
        }
        if !(1..=2).contains(&self.serial.stop_bits) {
            bail!("serial.stop_bits must be 1 or 2");
        }

        // Validate timings
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be greater than zero");
        }
        if self.response_timeout_ms == 0 {
            bail!("response_timeout_ms must be greater than zero");
        }

        if self.catalog_file.is_empty() {
            return Err(anyhow!("config.rs:Catalog file path cannot be empty"));
        }
        if self.loglevel.parse::<log::LevelFilter>().is_err() {
            return Err(anyhow!("config.rs:Invalid log level: {}", self.loglevel));
        }
        Ok(())
    }

    pub fn serial(&self) -> &Serial {
        &self.serial
    }

    pub fn loglevel(&self) -> String {
        self.loglevel.clone()
    }

    pub fn poll_interval_ms(&self) -> u64 {
        self.poll_interval_ms
    }

    pub fn response_timeout_ms(&self) -> u64 {
        self.response_timeout_ms
    }

    pub fn csv_file(&self) -> Option<String> {
        self.csv_file.clone()
    }

    pub fn catalog_file(&self) -> String {
        self.catalog_file.clone()
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }

    fn default_poll_interval_ms() -> u64 {
        1000
    }

    fn default_response_timeout_ms() -> u64 {
        500
    }

    fn default_catalog_file() -> String {
        "parameters.json".to_string()
    }

    fn default_baud() -> u32 {
        38400
    }

    fn default_data_bits() -> u8 {
        8
    }

    fn default_parity() -> String {
        "none".to_string()
    }

    fn default_stop_bits() -> u8 {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    fn config_from(yaml: &str) -> Result<Config> {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        Config::new(file.path().to_str().unwrap().to_string())
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config = config_from("serial:\n  port: /dev/ttyUSB0\n").unwrap();
        assert_eq!(config.serial().port(), "/dev/ttyUSB0");
        assert_eq!(config.serial().baud(), 38400);
        assert_eq!(config.serial().data_bits(), 8);
        assert_eq!(config.serial().parity(), "none");
        assert_eq!(config.serial().stop_bits(), 1);
        assert_eq!(config.poll_interval_ms(), 1000);
        assert_eq!(config.response_timeout_ms(), 500);
        assert_eq!(config.csv_file(), None);
        assert_eq!(config.catalog_file(), "parameters.json");
        assert_eq!(config.loglevel(), "info");
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config = config_from(
            "serial:\n  port: COM28\n  baud: 9600\npoll_interval_ms: 2000\ncsv_file: out.csv\n",
        )
        .unwrap();
        assert_eq!(config.serial().port(), "COM28");
        assert_eq!(config.serial().baud(), 9600);
        assert_eq!(config.poll_interval_ms(), 2000);
        assert_eq!(config.csv_file(), Some("out.csv".to_string()));
    }

    #[test]
    fn rejects_bad_parity() {
        assert!(config_from("serial:\n  port: COM1\n  parity: mark\n").is_err());
    }

    #[test]
    fn rejects_zero_poll_interval() {
        assert!(config_from("serial:\n  port: COM1\npoll_interval_ms: 0\n").is_err());
    }

    #[test]
    fn rejects_bad_loglevel() {
        assert!(config_from("serial:\n  port: COM1\nloglevel: noisy\n").is_err());
    }

    #[test]
    fn rejects_missing_serial_section() {
        assert!(config_from("loglevel: info\n").is_err());
    }
}
