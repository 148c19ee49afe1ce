//! Configuration loading and parsing.
//!
//! Parses `braild.toml`, preferring a file in the working directory and
//! falling back to the platform config dir. Unknown fields are ignored and a
//! parse error falls back to defaults so a bad edit can never keep the
//! daemon (and the user's display) from coming up; the error is logged.

use std::{fs, path::PathBuf, time::Duration};

use anyhow::Result;
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ConfigFile {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub braille: BrailleConfig,
    #[serde(default)]
    pub input: InputConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ApiConfig {
    /// Host spec: "" = default local socket, ":N" = local socket N,
    /// "host:N" = TCP.
    #[serde(default)]
    pub host: String,
    /// Auth token, e.g. "keyfile:/etc/braild.key" or "user:1000+none".
    #[serde(default)]
    pub auth: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrailleConfig {
    /// Device identifier, e.g. "serial:/dev/ttyUSB0".
    #[serde(default = "BrailleConfig::default_device")]
    pub device: String,
    #[serde(default = "BrailleConfig::default_baud")]
    pub baud: u32,
    #[serde(default = "BrailleConfig::default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "BrailleConfig::default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "BrailleConfig::default_ack_limit")]
    pub ack_limit: u32,
}

impl BrailleConfig {
    fn default_device() -> String {
        "serial:/dev/ttyUSB0".to_string()
    }
    const fn default_baud() -> u32 {
        9600
    }
    const fn default_retry_interval_ms() -> u64 {
        5000
    }
    const fn default_ack_timeout_ms() -> u64 {
        500
    }
    const fn default_ack_limit() -> u32 {
        3
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl Default for BrailleConfig {
    fn default() -> Self {
        Self {
            device: Self::default_device(),
            baud: Self::default_baud(),
            retry_interval_ms: Self::default_retry_interval_ms(),
            ack_timeout_ms: Self::default_ack_timeout_ms(),
            ack_limit: Self::default_ack_limit(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    #[serde(default = "InputConfig::default_long_press_ms")]
    pub long_press_ms: u64,
    #[serde(default = "InputConfig::default_autorepeat_ms")]
    pub autorepeat_ms: u64,
    #[serde(default = "InputConfig::default_autorelease_s")]
    pub autorelease_s: u64,
    #[serde(default = "InputConfig::default_sticky_timeout_s")]
    pub sticky_timeout_s: u64,
}

impl InputConfig {
    const fn default_long_press_ms() -> u64 {
        300
    }
    const fn default_autorepeat_ms() -> u64 {
        100
    }
    const fn default_autorelease_s() -> u64 {
        20
    }
    const fn default_sticky_timeout_s() -> u64 {
        5
    }

    pub fn long_press(&self) -> Duration {
        Duration::from_millis(self.long_press_ms)
    }
    pub fn autorepeat(&self) -> Duration {
        Duration::from_millis(self.autorepeat_ms)
    }
    pub fn autorelease(&self) -> Duration {
        Duration::from_secs(self.autorelease_s)
    }
    pub fn sticky_timeout(&self) -> Duration {
        Duration::from_secs(self.sticky_timeout_s)
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            long_press_ms: Self::default_long_press_ms(),
            autorepeat_ms: Self::default_autorepeat_ms(),
            autorelease_s: Self::default_autorelease_s(),
            sticky_timeout_s: Self::default_sticky_timeout_s(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub file: ConfigFile,
    pub source: Option<PathBuf>,
}

/// Best-effort config path following platform conventions.
pub fn discover() -> PathBuf {
    let local = PathBuf::from("braild.toml");
    if local.exists() {
        return local;
    }
    if let Some(dir) = dirs::config_dir() {
        return dir.join("braild").join("braild.toml");
    }
    PathBuf::from("braild.toml")
}

pub fn load_from(path: Option<PathBuf>) -> Result<Config> {
    let path = path.unwrap_or_else(discover);
    match fs::read_to_string(&path) {
        Ok(content) => match toml::from_str::<ConfigFile>(&content) {
            Ok(file) => {
                info!(target: "config", path = %path.display(), "config_loaded");
                Ok(Config {
                    file,
                    source: Some(path),
                })
            }
            Err(e) => {
                warn!(target: "config", path = %path.display(), error = %e, "config_parse_failed_using_defaults");
                Ok(Config::default())
            }
        },
        Err(_) => Ok(Config::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_from(Some(PathBuf::from("/nonexistent/braild.toml"))).expect("load");
        assert_eq!(config.file.braille.baud, 9600);
        assert!(config.source.is_none());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "[braille]\ndevice = \"serial:/dev/ttyS3\"").expect("write");
        let config = load_from(Some(file.path().to_path_buf())).expect("load");
        assert_eq!(config.file.braille.device, "serial:/dev/ttyS3");
        assert_eq!(config.file.braille.ack_limit, 3);
        assert_eq!(config.file.input.long_press_ms, 300);
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "[future]\nshiny = true\n[api]\nhost = \":2\"").expect("write");
        let config = load_from(Some(file.path().to_path_buf())).expect("load");
        assert_eq!(config.file.api.host, ":2");
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "not toml [[[").expect("write");
        let config = load_from(Some(file.path().to_path_buf())).expect("load");
        assert!(config.source.is_none());
    }
}
