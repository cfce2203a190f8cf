use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use aubstream_tbx::TbxConfig;
use aubstream_types::FailurePolicy;
use thiserror::Error;

pub const ENV_MODE: &str = "AUBSTREAM_MODE";
pub const ENV_AUB_FILE: &str = "AUBSTREAM_AUB_FILE";
pub const ENV_TBX_SERVER: &str = "AUBSTREAM_TBX_SERVER";
pub const ENV_TBX_PORT: &str = "AUBSTREAM_TBX_PORT";
pub const ENV_TBX_FRONTDOOR: &str = "AUBSTREAM_TBX_FRONTDOOR";
pub const ENV_TBX_CONNECT_DELAY_MS: &str = "AUBSTREAM_TBX_CONNECT_DELAY_MS";
pub const ENV_THROW_ON_ERROR: &str = "AUBSTREAM_THROW_ON_ERROR";

pub const DEFAULT_AUB_FILE: &str = "aubstream.aub";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("unknown session mode {0:?} (expected aub, tbx, aub-tbx or tbx-shm)")]
    UnknownMode(String),
}

/// Which backends a session drives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionMode {
    #[default]
    Aub,
    Tbx,
    /// Trace file and simulator together.
    AubTbx,
    /// Simulator with memory served from host-backed pages.
    TbxShm,
}

impl SessionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aub => "aub",
            Self::Tbx => "tbx",
            Self::AubTbx => "aub-tbx",
            Self::TbxShm => "tbx-shm",
        }
    }

    pub fn uses_tbx(self) -> bool {
        !matches!(self, Self::Aub)
    }
}

impl FromStr for SessionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aub" => Ok(Self::Aub),
            "tbx" => Ok(Self::Tbx),
            "aub-tbx" | "aub_tbx" => Ok(Self::AubTbx),
            "tbx-shm" | "tbx_shm" => Ok(Self::TbxShm),
            _ => Err(ConfigError::UnknownMode(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub mode: SessionMode,
    /// Trace path for modes that record.
    pub aub_file: PathBuf,
    pub tbx: TbxConfig,
    pub policy: FailurePolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: SessionMode::default(),
            aub_file: PathBuf::from(DEFAULT_AUB_FILE),
            tbx: TbxConfig::default(),
            policy: FailurePolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds a config from defaults overridden by whatever `lookup` returns for each
    /// `AUBSTREAM_*` variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(mode) = lookup(ENV_MODE) {
            config.mode = mode.parse()?;
        }
        if let Some(path) = lookup(ENV_AUB_FILE).filter(|p| !p.trim().is_empty()) {
            config.aub_file = PathBuf::from(path);
        }
        if let Some(host) = lookup(ENV_TBX_SERVER).filter(|h| !h.trim().is_empty()) {
            config.tbx.host = host.trim().to_string();
        }
        if let Some(raw) = lookup(ENV_TBX_PORT) {
            config.tbx.port = parse(ENV_TBX_PORT, &raw)?;
        }
        if let Some(raw) = lookup(ENV_TBX_FRONTDOOR) {
            config.tbx.frontdoor = parse_bool(ENV_TBX_FRONTDOOR, &raw)?;
        }
        if let Some(raw) = lookup(ENV_TBX_CONNECT_DELAY_MS) {
            config.tbx.connect_delay =
                Duration::from_millis(parse(ENV_TBX_CONNECT_DELAY_MS, &raw)?);
        }
        if let Some(raw) = lookup(ENV_THROW_ON_ERROR) {
            config.policy = FailurePolicy::from_throw_on_error(parse_bool(ENV_THROW_ON_ERROR, &raw)?);
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        value: raw.to_string(),
    })
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var,
            value: raw.to_string(),
        }),
    }
}
