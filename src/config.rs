//! Station identity and startup configuration.
//!
//! `station.conf` in the station home directory carries the gateway identity
//! and the coarse radio setup. Per-chip configuration lives in `slave-<i>.conf`
//! files which are handed to the slave processes verbatim.

use crate::error::{ConfigError, Error};
use core::fmt;
use core::str::FromStr;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Station software version reported in the MUXS hello and CUPS request.
pub const STATION_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Package identifier reported to the LNS.
pub const STATION_PACKAGE: &str = concat!("lorastation-", env!("CARGO_PKG_VERSION"));

/// Platform model string.
pub const STATION_MODEL: &str = "linux";

/// LNS protocol revision implemented by the TC engine.
pub const PROTOCOL_VERSION: u32 = 2;

/// Feature flags advertised in the MUXS hello.
pub const STATION_FEATURES: &str = "gps";

/// A 64-bit Extended Unique Identifier.
///
/// Rendered as eight dash-separated decimal bytes, e.g. `1-2-3-4-5-6-7-8`,
/// which is also the accepted parse format alongside plain hex.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Eui(pub u64);

impl fmt::Display for Eui {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0.to_be_bytes();

        write!(
            f,
            "{}-{}-{}-{}-{}-{}-{}-{}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

impl FromStr for Eui {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if s.contains('-') {
            let mut bytes = [0u8; 8];
            let mut parts = s.split('-');

            for slot in bytes.iter_mut() {
                *slot = parts
                    .next()
                    .and_then(|p| p.parse::<u8>().ok())
                    .ok_or_else(|| ConfigError::Eui(s.into()))?;
            }

            if parts.next().is_some() {
                return Err(ConfigError::Eui(s.into()));
            }

            Ok(Self(u64::from_be_bytes(bytes)))
        } else {
            let hex = s.trim_start_matches("0x").replace(':', "");

            u64::from_str_radix(&hex, 16)
                .map(Self)
                .map_err(|_| ConfigError::Eui(s.into()))
        }
    }
}

impl<'de> Deserialize<'de> for Eui {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A logical uplink channel requested by the channel plan.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelDef {
    /// Centre frequency in Hz.
    pub freq: u32,
    /// Minimum spreading factor served on this channel (LoRa), or `0` for FSK.
    #[serde(default = "default_sf")]
    pub sf: u8,
    /// Bandwidth in Hz.
    #[serde(default = "default_bw")]
    pub bw: u32,
}

fn default_sf() -> u8 {
    7
}

fn default_bw() -> u32 {
    125_000
}

/// Parsed `station.conf`.
#[derive(Debug, Clone, Deserialize)]
pub struct StationConf {
    /// Gateway EUI, reported as `router` to INFOS and CUPS.
    pub routerid: Eui,

    /// Hardware specification, `sx1301/N`.
    #[serde(default = "default_hwspec")]
    pub hwspec: String,

    /// Regulatory region code. `0` disables Listen-Before-Talk gating on TX
    /// responses.
    #[serde(default)]
    pub region: u16,

    /// Uplink channel plan distributed over the available chips.
    #[serde(default)]
    pub channels: Vec<ChannelDef>,

    /// Nominal interval between CUPS checks, seconds.
    #[serde(default = "default_cups_interval")]
    pub cups_interval: u64,

    /// Whether a GPS PPS signal is wired to concentrator 0.
    #[serde(default)]
    pub gps: bool,
}

fn default_hwspec() -> String {
    "sx1301/1".into()
}

fn default_cups_interval() -> u64 {
    // One CUPS round-trip per day unless the server asks for more.
    86_400
}

impl StationConf {
    /// Load `station.conf` from the station home directory.
    pub fn load(home: &Path) -> Result<Self, Error> {
        let path = home.join("station.conf");

        let raw = std::fs::read(&path).map_err(|_| ConfigError::Missing(path.clone()))?;

        let conf: StationConf = serde_json::from_slice(&raw)?;

        if conf.hwspec.split('/').count() != 2 {
            return Err(ConfigError::Field("hwspec").into());
        }

        Ok(conf)
    }

    /// Number of chips requested by `hwspec`.
    pub fn hwspec_chips(&self) -> Result<usize, Error> {
        let (family, n) = self
            .hwspec
            .split_once('/')
            .ok_or(ConfigError::Field("hwspec"))?;

        if family != "sx1301" && family != "sx1302" {
            return Err(ConfigError::Field("hwspec").into());
        }

        n.parse::<usize>()
            .map_err(|_| ConfigError::Field("hwspec").into())
    }
}

/// Discover `slave-<i>.conf` files in `home`, in index order.
///
/// The scan stops at the first missing index; slaves must be numbered densely
/// from zero.
pub fn discover_slave_confs(home: &Path) -> Vec<PathBuf> {
    let mut confs = Vec::new();

    for i in 0..crate::MAX_TXUNITS {
        let path = home.join(format!("slave-{}.conf", i));

        if !path.is_file() {
            break;
        }

        confs.push(path);
    }

    confs
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn eui_dash_roundtrip() {
        let eui: Eui = "1-2-3-4-5-6-7-8".parse().unwrap();

        assert_eq!(eui, Eui(0x0102030405060708));
        assert_eq!(eui.to_string(), "1-2-3-4-5-6-7-8");
    }

    #[test]
    fn eui_hex_forms() {
        assert_eq!("0x0102030405060708".parse::<Eui>().unwrap(), Eui(0x0102030405060708));
        assert_eq!(
            "01:02:03:04:05:06:07:08".parse::<Eui>().unwrap(),
            Eui(0x0102030405060708)
        );
    }

    #[test]
    fn eui_rejects_garbage() {
        assert!("1-2-3".parse::<Eui>().is_err());
        assert!("xyz".parse::<Eui>().is_err());
        assert!("1-2-3-4-5-6-7-8-9".parse::<Eui>().is_err());
    }

    #[test]
    fn station_conf_defaults() {
        let conf: StationConf = serde_json::from_str(
            r#"{ "routerid": "1-2-3-4-5-6-7-8", "channels": [ { "freq": 868100000 } ] }"#,
        )
        .unwrap();

        assert_eq!(conf.hwspec, "sx1301/1");
        assert_eq!(conf.hwspec_chips().unwrap(), 1);
        assert_eq!(conf.region, 0);
        assert_eq!(conf.channels[0].bw, 125_000);
        assert_eq!(conf.channels[0].sf, 7);
    }
}
