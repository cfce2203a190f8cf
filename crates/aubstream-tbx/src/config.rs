use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 4321;

/// How long [`TbxClient::connect`](crate::TbxClient::connect) keeps retrying.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TbxConfig {
    pub host: String,
    pub port: u16,
    /// Route local-memory traffic through the frontdoor (LMEMBAR-relative) path.
    pub frontdoor: bool,
    /// Sleep before the first connect attempt, for simulators that start slowly.
    pub connect_delay: Duration,
    pub connect_timeout: Duration,
}

impl Default for TbxConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            frontdoor: false,
            connect_delay: Duration::ZERO,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}
