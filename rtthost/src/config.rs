use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use jlink_rtt::{ProbeConfig, RttConfig};
use serde::{Deserialize, Serialize};

use crate::logging::LevelFilter;
use crate::Opts;

/// Read when `--config` is not given, if it exists.
pub const DEFAULT_CONFIG_FILE: &str = "RttHost.toml";

/// Prefix of environment variables overriding the configuration, e.g.
/// `RTTHOST_PROBE__DEVICE=nRF52840_xxAA`.
pub const ENV_PREFIX: &str = "RTTHOST_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub probe: ProbeConfig,
    pub rtt: RttConfig,
    #[serde(default)]
    pub host: HostConfig,
}

/// Settings of the host program itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// Up channel to stream.
    pub up_channel: u32,
    /// Pause between two polls of the channel.
    pub poll_interval_ms: u64,
    pub log_level: Option<LevelFilter>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            up_channel: 0,
            poll_interval_ms: 10,
            log_level: None,
        }
    }
}

impl Config {
    /// Loads the configuration: defaults, then the config file, then the environment, then the
    /// command line.
    pub fn load(opts: &Opts) -> anyhow::Result<Self> {
        let file = match &opts.config {
            Some(path) if !path.exists() => {
                anyhow::bail!("Config file {} does not exist", path.display())
            }
            Some(path) => path.clone(),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let figment = defaults()
            .merge(Toml::file(&file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        Ok(with_overrides(figment, opts).extract()?)
    }
}

fn defaults() -> Figment {
    Figment::new()
        .merge(Serialized::default("probe", ProbeConfig::default()))
        .merge(Serialized::default("host", HostConfig::default()))
}

/// Layers the options given on the command line on top of `figment`.
fn with_overrides(mut figment: Figment, opts: &Opts) -> Figment {
    if let Some(device) = &opts.device {
        figment = figment.merge(Serialized::default("probe.device", device));
    }
    if let Some(interface) = opts.interface {
        figment = figment.merge(Serialized::default("probe.interface", interface));
    }
    if let Some(speed) = opts.speed {
        figment = figment.merge(Serialized::default("probe.speed_khz", speed));
    }
    if let Some(region) = &opts.scan_region {
        figment = figment.merge(Serialized::default("rtt.scan_region", region));
    }
    if let Some(mode) = opts.mode {
        figment = figment.merge(Serialized::default("rtt.mode", mode));
    }
    if let Some(capacity) = opts.buffer_capacity {
        figment = figment.merge(Serialized::default("rtt.buffer_capacity", capacity));
    }
    if let Some(up) = opts.up {
        figment = figment.merge(Serialized::default("host.up_channel", up));
    }
    if let Some(interval) = opts.poll_interval_ms {
        figment = figment.merge(Serialized::default("host.poll_interval_ms", interval));
    }
    if let Some(level) = opts.log_level {
        figment = figment.merge(Serialized::default("host.log_level", level));
    }
    figment
}

/// Path of the file [`Config::load`] reads for `opts`.
pub fn config_path(opts: &Opts) -> &Path {
    opts.config
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE))
}
