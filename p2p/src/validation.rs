//! Validation of data received from remote peers.
//!
//! The rules live in a `ValidationContext` built once from the config and passed by reference
//! to whoever needs it. Failures are reported field by field so that a caller can log or return
//! all of them at once.

use std::net::IpAddr;

use serde_json::Value;

use crate::{
    config::P2pConfig,
    error::{FieldError, P2pError},
    types::{InfoOptions, P2pMessagePacket, P2pRequestPacket, PeerInfo},
};

pub const INVALID_CONNECTION_URL_CODE: u16 = 4501;
pub const INVALID_CONNECTION_URL_REASON: &str =
    "Peer did not provide a valid URL as part of the connection";
pub const INVALID_CONNECTION_QUERY_CODE: u16 = 4502;
pub const INVALID_CONNECTION_QUERY_REASON: &str =
    "Peer did not provide valid query parameters as part of the connection";

/// Query parameters of an inbound connection handshake.
#[derive(Clone, Debug, PartialEq)]
pub struct HandshakeQuery {
    pub ws_port: u16,
    pub os: String,
    pub version: String,
    pub height: u64,
    /// Every parameter that is not part of the fixed set.
    pub options: InfoOptions,
}

impl HandshakeQuery {
    pub fn into_peer_info(self, ip_address: IpAddr) -> PeerInfo {
        PeerInfo {
            ip_address,
            ws_port: self.ws_port,
            height: self.height,
            os: Some(self.os),
            version: Some(self.version),
            options: self.options,
            is_tried_peer: false,
        }
    }
}

/// Why an inbound handshake was refused. Each kind maps to its own disconnect code.
#[derive(Clone, Debug, PartialEq)]
pub enum HandshakeRejection {
    InvalidUrl,
    InvalidQuery(Vec<FieldError>),
}

impl HandshakeRejection {
    pub fn code(&self) -> u16 {
        match self {
            Self::InvalidUrl => INVALID_CONNECTION_URL_CODE,
            Self::InvalidQuery(_) => INVALID_CONNECTION_QUERY_CODE,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidUrl => INVALID_CONNECTION_URL_REASON,
            Self::InvalidQuery(_) => INVALID_CONNECTION_QUERY_REASON,
        }
    }
}

impl From<HandshakeRejection> for P2pError {
    fn from(rejection: HandshakeRejection) -> Self {
        match rejection {
            HandshakeRejection::InvalidUrl => P2pError::InvalidHandshake(vec![FieldError::new(
                "url",
                INVALID_CONNECTION_URL_REASON,
            )]),
            HandshakeRejection::InvalidQuery(errors) => P2pError::InvalidHandshake(errors),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ValidationContext {
    max_peer_list_size: usize,
}

impl Default for ValidationContext {
    fn default() -> Self {
        Self {
            max_peer_list_size: crate::config::DEFAULT_MAX_PEER_LIST_SIZE,
        }
    }
}

impl ValidationContext {
    pub fn new(max_peer_list_size: usize) -> Self {
        Self { max_peer_list_size }
    }

    pub fn from_config(config: &P2pConfig) -> Self {
        Self::new(config.max_peer_list_size())
    }

    pub fn is_valid_version(&self, version: &str) -> bool {
        semver::Version::parse(version).is_ok()
    }

    pub fn is_valid_peer_address(&self, ip: &str, ws_port: u64) -> bool {
        ip.parse::<IpAddr>().is_ok() && (1..=u64::from(u16::MAX)).contains(&ws_port)
    }

    /// Validate one entry of a peer list response.
    pub fn validate_peer_info(&self, raw: &Value) -> Result<PeerInfo, P2pError> {
        self.check_peer_info(raw, "")
            .map_err(|errors| P2pError::InvalidPeer(join(&errors)))
    }

    /// Validate a `list` response of the shape `{ "peers": [...] }`.
    pub fn validate_peer_info_list(&self, raw: &Value) -> Result<Vec<PeerInfo>, P2pError> {
        let peers = raw
            .get("peers")
            .and_then(Value::as_array)
            .ok_or_else(|| P2pError::InvalidRpcResponse("Invalid response type".to_owned()))?;

        if peers.len() > self.max_peer_list_size {
            return Err(P2pError::InvalidRpcResponse(format!(
                "Peer list too long: {} > {}",
                peers.len(),
                self.max_peer_list_size
            )));
        }

        let mut infos = Vec::with_capacity(peers.len());
        let mut errors = Vec::new();
        for (i, peer) in peers.iter().enumerate() {
            match self.check_peer_info(peer, &format!(".peers[{i}]")) {
                Ok(info) => infos.push(info),
                Err(mut errs) => errors.append(&mut errs),
            }
        }

        if errors.is_empty() {
            Ok(infos)
        } else {
            Err(P2pError::InvalidRpcResponse(join(&errors)))
        }
    }

    pub fn validate_rpc_request(&self, raw: &Value) -> Result<P2pRequestPacket, P2pError> {
        if !raw.is_object() {
            return Err(P2pError::InvalidRpcRequest("Invalid request".to_owned()));
        }
        let procedure = raw.get("procedure").and_then(Value::as_str).ok_or_else(|| {
            P2pError::InvalidRpcRequest("Request procedure name is not a string".to_owned())
        })?;

        Ok(P2pRequestPacket {
            procedure: procedure.to_owned(),
            data: raw.get("data").cloned().unwrap_or(Value::Null),
        })
    }

    pub fn validate_protocol_message(&self, raw: &Value) -> Result<P2pMessagePacket, P2pError> {
        if !raw.is_object() {
            return Err(P2pError::InvalidProtocolMessage("Invalid message".to_owned()));
        }
        let event = raw.get("event").and_then(Value::as_str).ok_or_else(|| {
            P2pError::InvalidProtocolMessage("Protocol message is not a string".to_owned())
        })?;

        Ok(P2pMessagePacket {
            event: event.to_owned(),
            data: raw.get("data").cloned().unwrap_or(Value::Null),
        })
    }

    /// Validate the URL an inbound peer opened the connection with.
    pub fn validate_handshake_query(&self, url: &str) -> Result<HandshakeQuery, HandshakeRejection> {
        let url = url.trim();
        if url.is_empty() || !url.starts_with('/') {
            return Err(HandshakeRejection::InvalidUrl);
        }

        let query = url.split_once('?').map(|(_, q)| q).unwrap_or_default();
        let pairs: Vec<(String, String)> =
            serde_urlencoded::from_str(query).map_err(|_| HandshakeRejection::InvalidUrl)?;

        let mut errors = Vec::new();
        let mut params = InfoOptions::new();
        for (key, value) in pairs {
            if params.contains_key(&key) {
                errors.push(FieldError::new(format!(".{key}"), "is given more than once"));
                continue;
            }
            params.insert(key, Value::String(value));
        }

        let param = |name: &str| params.get(name).and_then(Value::as_str).map(str::to_owned);

        let ws_port = match param("wsPort") {
            None => {
                errors.push(FieldError::new(".wsPort", "is required"));
                0
            }
            Some(port) => match port.parse::<u16>() {
                Ok(port) if port > 0 => port,
                _ => {
                    errors.push(FieldError::new(".wsPort", "must be a port number"));
                    0
                }
            },
        };

        let os = param("os").unwrap_or_default();
        if os.is_empty() {
            errors.push(FieldError::new(".os", "is required"));
        }

        let version = param("version").unwrap_or_default();
        if !self.is_valid_version(&version) {
            errors.push(FieldError::new(".version", "must be a semantic version"));
        }

        let height = match param("height") {
            None => 0,
            Some(height) => height.parse::<u64>().unwrap_or_else(|_| {
                errors.push(FieldError::new(".height", "must be numeric"));
                0
            }),
        };

        if !errors.is_empty() {
            return Err(HandshakeRejection::InvalidQuery(errors));
        }

        for fixed in ["wsPort", "os", "version", "height"] {
            params.remove(fixed);
        }

        Ok(HandshakeQuery {
            ws_port,
            os,
            version,
            height,
            options: params,
        })
    }

    fn check_peer_info(&self, raw: &Value, path: &str) -> Result<PeerInfo, Vec<FieldError>> {
        let Some(peer) = raw.as_object() else {
            return Err(vec![FieldError::new(path, "Invalid peer object")]);
        };

        let mut errors = Vec::new();
        let ip = peer.get("ip").and_then(Value::as_str).unwrap_or_default();
        let ws_port = peer.get("wsPort").and_then(numeric).unwrap_or_default();
        if !self.is_valid_peer_address(ip, ws_port) {
            errors.push(FieldError::new(format!("{path}.ip"), "Invalid peer ip or port"));
        }

        let version = peer.get("version").and_then(Value::as_str).unwrap_or_default();
        if !self.is_valid_version(version) {
            errors.push(FieldError::new(format!("{path}.version"), "Invalid peer version"));
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        // Anything that is not purely alphabetic is dropped rather than rejected.
        let os = peer
            .get("os")
            .and_then(Value::as_str)
            .filter(|os| !os.is_empty() && os.chars().all(char::is_alphabetic))
            .unwrap_or_default();
        let height = peer.get("height").and_then(numeric).unwrap_or(0);
        let ip_address = ip.parse().map_err(|_| {
            vec![FieldError::new(format!("{path}.ip"), "Invalid peer ip or port")]
        })?;

        Ok(PeerInfo {
            ip_address,
            ws_port: ws_port as u16,
            height,
            os: Some(os.to_owned()),
            version: Some(version.to_owned()),
            options: peer.clone(),
            is_tried_peer: false,
        })
    }
}

/// Accept both JSON numbers and numeric strings.
fn numeric(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn join(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
