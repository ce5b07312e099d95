//! Mission package transfer settings
//!
//! Bounded settings object consumed by the mission package orchestrator. Values
//! may be set programmatically through the validating setters or loaded from a
//! configuration file with `COMMO_MP_*` environment overrides.

use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

use crate::error::SettingsError;

pub const DEFAULT_HTTP_PORT: u16 = 8080;
pub const DEFAULT_HTTPS_PORT: u16 = 8443;
pub const MIN_TRY_COUNT: u32 = 1;
pub const DEFAULT_TRY_COUNT: u32 = 10;
pub const MIN_CONN_TIMEOUT_SEC: u32 = 5;
pub const DEFAULT_CONN_TIMEOUT_SEC: u32 = 90;
pub const MIN_XFER_TIMEOUT_SEC: u32 = 15;
pub const DEFAULT_XFER_TIMEOUT_SEC: u32 = 120;

/// Transfer settings applied to new mission package transfers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MpTransferSettings {
    http_port: u16,
    https_port: u16,
    num_tries: u32,
    conn_timeout_sec: u32,
    xfer_timeout_sec: u32,
    server_transfer_enabled: bool,
}

/// Raw shape of the settings as read from file/environment
#[derive(Debug, Deserialize, Default)]
struct SettingsSource {
    http_port: Option<i64>,
    https_port: Option<i64>,
    num_tries: Option<i64>,
    conn_timeout_sec: Option<i64>,
    xfer_timeout_sec: Option<i64>,
    server_transfer_enabled: Option<bool>,
}

impl Default for MpTransferSettings {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            https_port: DEFAULT_HTTPS_PORT,
            num_tries: DEFAULT_TRY_COUNT,
            conn_timeout_sec: DEFAULT_CONN_TIMEOUT_SEC,
            xfer_timeout_sec: DEFAULT_XFER_TIMEOUT_SEC,
            server_transfer_enabled: true,
        }
    }
}

impl MpTransferSettings {
    /// Load settings from `path` (optional file) with `COMMO_MP_*` overrides
    ///
    /// Every loaded value goes through the same validating setter as the
    /// programmatic API, so an out-of-range file value fails the load.
    pub fn load(path: &str) -> Result<Self, SettingsError> {
        let source: SettingsSource = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("COMMO_MP"))
            .build()?
            .try_deserialize()?;

        let mut settings = Self::default();
        if let Some(port) = source.http_port {
            settings.set_http_port(port)?;
        }
        if let Some(port) = source.https_port {
            settings.set_https_port(port)?;
        }
        if let Some(tries) = source.num_tries {
            settings.set_num_tries(tries)?;
        }
        if let Some(secs) = source.conn_timeout_sec {
            settings.set_conn_timeout_sec(secs)?;
        }
        if let Some(secs) = source.xfer_timeout_sec {
            settings.set_xfer_timeout_sec(secs)?;
        }
        if let Some(enabled) = source.server_transfer_enabled {
            settings.set_server_transfer_enabled(enabled);
        }
        Ok(settings)
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn https_port(&self) -> u16 {
        self.https_port
    }

    pub fn num_tries(&self) -> u32 {
        self.num_tries
    }

    pub fn conn_timeout_sec(&self) -> u32 {
        self.conn_timeout_sec
    }

    pub fn xfer_timeout_sec(&self) -> u32 {
        self.xfer_timeout_sec
    }

    pub fn is_server_transfer_enabled(&self) -> bool {
        self.server_transfer_enabled
    }

    /// Connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.conn_timeout_sec))
    }

    /// Low-speed window as Duration
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.xfer_timeout_sec))
    }

    pub fn set_http_port(&mut self, port: i64) -> Result<(), SettingsError> {
        self.http_port = checked_port("http_port", port)?;
        Ok(())
    }

    pub fn set_https_port(&mut self, port: i64) -> Result<(), SettingsError> {
        self.https_port = checked_port("https_port", port)?;
        Ok(())
    }

    pub fn set_num_tries(&mut self, tries: i64) -> Result<(), SettingsError> {
        self.num_tries = checked_min("num_tries", tries, MIN_TRY_COUNT)?;
        Ok(())
    }

    pub fn set_conn_timeout_sec(&mut self, secs: i64) -> Result<(), SettingsError> {
        self.conn_timeout_sec = checked_min("conn_timeout_sec", secs, MIN_CONN_TIMEOUT_SEC)?;
        Ok(())
    }

    pub fn set_xfer_timeout_sec(&mut self, secs: i64) -> Result<(), SettingsError> {
        self.xfer_timeout_sec = checked_min("xfer_timeout_sec", secs, MIN_XFER_TIMEOUT_SEC)?;
        Ok(())
    }

    pub fn set_server_transfer_enabled(&mut self, enabled: bool) {
        self.server_transfer_enabled = enabled;
    }
}

fn checked_port(field: &'static str, value: i64) -> Result<u16, SettingsError> {
    if value <= 0 || value > i64::from(u16::MAX) {
        return Err(SettingsError::OutOfRange {
            field,
            value,
            min: 1,
            max: i64::from(u16::MAX),
        });
    }
    Ok(value as u16)
}

fn checked_min(field: &'static str, value: i64, min: u32) -> Result<u32, SettingsError> {
    if value < i64::from(min) || value > i64::from(u32::MAX) {
        return Err(SettingsError::OutOfRange {
            field,
            value,
            min: i64::from(min),
            max: i64::from(u32::MAX),
        });
    }
    Ok(value as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = MpTransferSettings::default();
        assert_eq!(settings.http_port(), 8080);
        assert_eq!(settings.https_port(), 8443);
        assert_eq!(settings.num_tries(), 10);
        assert_eq!(settings.conn_timeout_sec(), 90);
        assert_eq!(settings.xfer_timeout_sec(), 120);
        assert!(settings.is_server_transfer_enabled());
    }

    #[test]
    fn test_bounded_setters() {
        let mut settings = MpTransferSettings::default();
        assert!(settings.set_http_port(0).is_err());
        assert!(settings.set_http_port(65536).is_err());
        assert!(settings.set_https_port(-1).is_err());
        assert!(settings.set_num_tries(0).is_err());
        assert!(settings.set_conn_timeout_sec(4).is_err());
        assert!(settings.set_xfer_timeout_sec(14).is_err());

        settings.set_http_port(65535).unwrap();
        settings.set_num_tries(1).unwrap();
        settings.set_conn_timeout_sec(5).unwrap();
        settings.set_xfer_timeout_sec(15).unwrap();
        assert_eq!(settings.http_port(), 65535);
        assert_eq!(settings.num_tries(), 1);

        // Failed sets leave the previous value in place
        assert_eq!(settings.https_port(), 8443);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "http_port = 9000\nnum_tries = 3\nserver_transfer_enabled = false").unwrap();
        let path = file.path().with_extension("");
        let path = path.to_string_lossy().to_string();

        let settings = MpTransferSettings::load(&path).unwrap();
        assert_eq!(settings.http_port(), 9000);
        assert_eq!(settings.num_tries(), 3);
        assert!(!settings.is_server_transfer_enabled());
        assert_eq!(settings.https_port(), DEFAULT_HTTPS_PORT);
    }

    #[test]
    fn test_load_rejects_out_of_range() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "conn_timeout_sec = 1").unwrap();
        let path = file.path().with_extension("");
        let path = path.to_string_lossy().to_string();

        assert!(matches!(
            MpTransferSettings::load(&path),
            Err(SettingsError::OutOfRange { field: "conn_timeout_sec", .. })
        ));
    }
}
