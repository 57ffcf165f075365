#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Config file not exist: {0}")]
    ConfigNotExist(String),
    #[error(transparent)]
    InvalidConfig(#[from] toml::de::Error),
    #[error("Invalid http address: {0}")]
    InvalidHttpAddr(#[from] std::net::AddrParseError),
    #[error("Failed to decode requests")]
    BadRequest(#[from] serde_json::Error),
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    P2pError(#[from] gossip_p2p::P2pError),
    #[error(transparent)]
    TxPoolError(#[from] txpool::TxPoolError),
}
