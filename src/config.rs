use std::fs;

use gossip_p2p::P2pConfig;
use serde::Deserialize;
use txpool::TxPoolConfig;

use crate::error::Error;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    /// The address to listen on for HTTP Server.
    pub http_addr: String,
    /// P2p configuration.
    #[serde(default)]
    pub p2p: P2pConfig,
    /// Transaction pool configuration.
    #[serde(default)]
    pub txpool: TxPoolConfig,
}

impl Config {
    /// Load the configuration from the given path.
    pub fn load(path: &str) -> Result<Self, Error> {
        let content =
            fs::read_to_string(path).map_err(|_| Error::ConfigNotExist(path.to_string()))?;

        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}
