//! Gossip networking for a blockchain node.
//!
//! Peers are discovered through seed nodes, kept in a pool of new, tried and connected peers,
//! and picked for requests and broadcasts by clustering their reported heights.
//!
//! See `tests/network.rs` for usage.

pub mod config;
pub mod discovery;
pub mod error;
pub mod peer;
pub mod pool;
pub mod selection;
pub mod transport;
pub mod types;
pub mod validation;

mod service;

pub use config::*;
pub use error::{FieldError, P2pError};
pub use service::{new, P2p, P2pEvent, P2pState, Server};
pub use transport::P2pRequest;
pub use types::*;
