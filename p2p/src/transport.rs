//! TCP transport between peers.
//!
//! Every frame is a length-prefixed JSON document. The length is encoded as a varint
//! (variable-width integer).
//! [What is a varint?](https://developers.google.com/protocol-buffers/docs/encoding#varints)
//!
//! The dialer opens with a `handshake` frame carrying its status as a URL query
//! (`/?wsPort=..&os=..&version=..&height=..`). After that both sides may send `request`,
//! `response`, `message` and `disconnect` frames.
//!
//! Each connection runs in its own task. The rest of the crate talks to it through a
//! `Connection` handle, which only holds the sending half of a command channel.

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    select,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    time,
};

use crate::{
    error::P2pError,
    types::{NodeInfo, P2pMessagePacket, P2pRequestPacket, P2pResponsePacket, PeerId},
    validation::{HandshakeQuery, HandshakeRejection, ValidationContext},
};

/// Close code used when we drop a connection on purpose.
pub const INTENTIONAL_DISCONNECT_CODE: u16 = 1000;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    Handshake {
        url: String,
    },
    Request {
        id: u64,
        procedure: String,
        data: Value,
    },
    Response {
        id: u64,
        data: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Message {
        event: String,
        data: Value,
    },
    Disconnect {
        code: u16,
        reason: String,
    },
}

impl Frame {
    /// Decode a raw frame. Requests and messages go through the validation context.
    pub fn parse(raw: &Value, ctx: &ValidationContext) -> Result<Frame, P2pError> {
        let id = || raw.get("id").and_then(Value::as_u64);
        let frame = match raw.get("type").and_then(Value::as_str) {
            Some("handshake") => Frame::Handshake {
                url: raw
                    .get("url")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
            },
            Some("request") => {
                let packet = ctx.validate_rpc_request(raw)?;
                Frame::Request {
                    id: id().ok_or_else(|| {
                        P2pError::InvalidRpcRequest("Request id is missing".to_owned())
                    })?,
                    procedure: packet.procedure,
                    data: packet.data,
                }
            }
            Some("response") => Frame::Response {
                id: id().ok_or_else(|| {
                    P2pError::InvalidRpcResponse("Response id is missing".to_owned())
                })?,
                data: raw.get("data").cloned().unwrap_or(Value::Null),
                error: raw.get("error").and_then(Value::as_str).map(ToOwned::to_owned),
            },
            Some("message") => {
                let packet = ctx.validate_protocol_message(raw)?;
                Frame::Message {
                    event: packet.event,
                    data: packet.data,
                }
            }
            Some("disconnect") => Frame::Disconnect {
                code: raw
                    .get("code")
                    .and_then(Value::as_u64)
                    .and_then(|c| u16::try_from(c).ok())
                    .unwrap_or(INTENTIONAL_DISCONNECT_CODE),
                reason: raw
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
            },
            _ => {
                return Err(P2pError::InvalidProtocolMessage(
                    "Unknown frame type".to_owned(),
                ))
            }
        };

        Ok(frame)
    }
}

/// Write one frame: varint length, then the JSON payload.
pub async fn write_frame<W>(io: &mut W, frame: &Frame, max_frame_size: usize) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(frame)?;
    if payload.len() > max_frame_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "Frame size exceeds limit: {} > {}",
                payload.len(),
                max_frame_size
            ),
        ));
    }

    let mut length = unsigned_varint::encode::usize_buffer();
    io.write_all(unsigned_varint::encode::usize(payload.len(), &mut length))
        .await?;
    io.write_all(&payload).await?;
    io.flush().await
}

/// Read one frame. Returns `Ok(None)` if the stream ended cleanly between two frames.
pub async fn read_frame<R>(io: &mut R, max_frame_size: usize) -> io::Result<Option<Value>>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = unsigned_varint::encode::usize_buffer();
    let mut length = None;
    for i in 0..buffer.len() {
        buffer[i] = match io.read_u8().await {
            Ok(byte) => byte,
            Err(err) if i == 0 && err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err),
        };
        if unsigned_varint::decode::is_last(buffer[i]) {
            let (len, _) = unsigned_varint::decode::usize(&buffer[..=i])
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            length = Some(len);
            break;
        }
    }

    let length = length.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "Frame length prefix overflow")
    })?;
    if length > max_frame_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Frame size exceeds limit: {} > {}", length, max_frame_size),
        ));
    }

    let mut payload = vec![0; length];
    io.read_exact(&mut payload).await?;
    let value = serde_json::from_slice(&payload)?;
    Ok(Some(value))
}

/// Settings shared by every connection of a pool.
#[derive(Clone, Debug)]
pub struct TransportSettings {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_frame_size: usize,
    pub validation: ValidationContext,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionKind {
    Inbound,
    Outbound,
}

/// What a connection reports back to the pool.
#[derive(Debug)]
pub enum ConnectionEvent {
    Request(P2pRequest),
    Message {
        peer_id: PeerId,
        message: P2pMessagePacket,
    },
    Closed {
        peer_id: PeerId,
        connection_id: u64,
        reason: String,
    },
}

enum Command {
    Request {
        procedure: String,
        data: Value,
        responder: oneshot::Sender<Result<Value, String>>,
    },
    Respond {
        id: u64,
        result: Result<Value, String>,
    },
    Send {
        event: String,
        data: Value,
    },
    Disconnect {
        code: u16,
        reason: String,
    },
}

/// Handle to a live connection.
#[derive(Clone, Debug)]
pub struct Connection {
    id: u64,
    peer_id: PeerId,
    kind: ConnectionKind,
    request_timeout: Duration,
    cmd_sender: UnboundedSender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Request { procedure, .. } => write!(f, "Request({procedure})"),
            Command::Respond { id, .. } => write!(f, "Respond({id})"),
            Command::Send { event, .. } => write!(f, "Send({event})"),
            Command::Disconnect { code, .. } => write!(f, "Disconnect({code})"),
        }
    }
}

impl Connection {
    /// Start the task serving `stream` and return its handle.
    pub fn spawn(
        stream: TcpStream,
        peer_id: PeerId,
        kind: ConnectionKind,
        settings: &TransportSettings,
        events: UnboundedSender<ConnectionEvent>,
    ) -> Connection {
        let (cmd_sender, cmd_receiver) = mpsc::unbounded_channel();
        let connection = Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_id,
            kind,
            request_timeout: settings.request_timeout,
            cmd_sender,
        };

        let (reader, writer) = stream.into_split();
        let task = ConnectionTask {
            connection: connection.clone(),
            settings: settings.clone(),
            writer,
            cmd_receiver,
            events,
            pending: HashMap::new(),
            next_request_id: 1,
        };
        tokio::spawn(task.run(reader));

        connection
    }

    /// Dial `addr` and open the connection with our handshake.
    pub async fn connect(
        addr: SocketAddr,
        node_info: &NodeInfo,
        settings: &TransportSettings,
        events: UnboundedSender<ConnectionEvent>,
    ) -> Result<Connection, P2pError> {
        let peer_id = PeerId::from(addr);
        let mut stream = time::timeout(settings.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| P2pError::ConnectTimeout(peer_id.clone()))?
            .map_err(|err| P2pError::transport(&peer_id, err.to_string()))?;

        let handshake = Frame::Handshake {
            url: node_info.handshake_url()?,
        };
        write_frame(&mut stream, &handshake, settings.max_frame_size)
            .await
            .map_err(|err| P2pError::transport(&peer_id, err.to_string()))?;

        Ok(Self::spawn(
            stream,
            peer_id,
            ConnectionKind::Outbound,
            settings,
            events,
        ))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_sender.is_closed()
    }

    /// Send a request and wait for the response, bounded by the request timeout.
    pub async fn request(&self, packet: P2pRequestPacket) -> Result<P2pResponsePacket, P2pError> {
        let (responder, receiver) = oneshot::channel();
        let procedure = packet.procedure.clone();
        self.command(Command::Request {
            procedure: packet.procedure,
            data: packet.data,
            responder,
        })?;

        match time::timeout(self.request_timeout, receiver).await {
            Err(_) => Err(P2pError::transport(
                &self.peer_id,
                format!("Request '{procedure}' timed out"),
            )),
            Ok(Err(_)) => Err(P2pError::transport(
                &self.peer_id,
                "Connection closed before the response arrived",
            )),
            Ok(Ok(Err(message))) => Err(P2pError::RequestFail(format!(
                "Peer {} failed to handle '{}': {}",
                self.peer_id, procedure, message
            ))),
            Ok(Ok(Ok(data))) => Ok(P2pResponsePacket { data }),
        }
    }

    /// Fire-and-forget message.
    pub fn send(&self, message: P2pMessagePacket) -> Result<(), P2pError> {
        self.command(Command::Send {
            event: message.event,
            data: message.data,
        })
    }

    pub fn disconnect(&self, code: u16, reason: &str) {
        let _ = self.command(Command::Disconnect {
            code,
            reason: reason.to_owned(),
        });
    }

    fn respond(&self, id: u64, result: Result<Value, String>) -> Result<(), P2pError> {
        self.command(Command::Respond { id, result })
    }

    fn command(&self, cmd: Command) -> Result<(), P2pError> {
        self.cmd_sender
            .send(cmd)
            .map_err(|_| P2pError::transport(&self.peer_id, "Connection is closed"))
    }
}

/// A request received from a remote peer. It must be answered exactly once.
#[derive(Debug)]
pub struct P2pRequest {
    id: u64,
    procedure: String,
    data: Value,
    connection: Connection,
    responded: bool,
}

impl P2pRequest {
    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn peer_id(&self) -> &PeerId {
        self.connection.peer_id()
    }

    pub fn respond(&mut self, data: Value) -> Result<(), P2pError> {
        self.finish(Ok(data))
    }

    pub fn respond_error(&mut self, message: impl Into<String>) -> Result<(), P2pError> {
        self.finish(Err(message.into()))
    }

    fn finish(&mut self, result: Result<Value, String>) -> Result<(), P2pError> {
        if self.responded {
            return Err(P2pError::RpcResponseAlreadySent(self.procedure.clone()));
        }
        self.responded = true;
        self.connection.respond(self.id, result)
    }
}

impl Drop for P2pRequest {
    fn drop(&mut self) {
        // Unanswered requests would otherwise hang until the remote timeout.
        if !self.responded {
            let message = format!("No handler answered '{}'", self.procedure);
            let _ = self.connection.respond(self.id, Err(message));
        }
    }
}

struct ConnectionTask {
    connection: Connection,
    settings: TransportSettings,
    writer: OwnedWriteHalf,
    cmd_receiver: UnboundedReceiver<Command>,
    events: UnboundedSender<ConnectionEvent>,
    pending: HashMap<u64, oneshot::Sender<Result<Value, String>>>,
    next_request_id: u64,
}

impl ConnectionTask {
    async fn run(mut self, reader: OwnedReadHalf) {
        let (frame_sender, mut frame_receiver) = mpsc::unbounded_channel();
        let max_frame_size = self.settings.max_frame_size;
        let read_task = tokio::spawn(read_loop(reader, max_frame_size, frame_sender));

        let reason = loop {
            select! {
                cmd = self.cmd_receiver.recv() => match cmd {
                    Some(cmd) => {
                        if let Some(reason) = self.handle_command(cmd).await {
                            break reason;
                        }
                    }
                    None => break "Connection handle dropped".to_owned(),
                },
                frame = frame_receiver.recv() => match frame {
                    Some(Ok(raw)) => {
                        if let Some(reason) = self.handle_frame(raw) {
                            break reason;
                        }
                    }
                    Some(Err(err)) => break format!("Read failed: {err}"),
                    None => break "Closed by remote".to_owned(),
                },
            }
        };

        read_task.abort();
        let _ = self.writer.shutdown().await;
        debug!("☕ Connection to {} closed: {}", self.connection.peer_id, reason);

        let _ = self.events.send(ConnectionEvent::Closed {
            peer_id: self.connection.peer_id.clone(),
            connection_id: self.connection.id,
            reason,
        });
    }

    /// Returns the close reason if the connection must end.
    async fn handle_command(&mut self, cmd: Command) -> Option<String> {
        let frame = match cmd {
            Command::Request {
                procedure,
                data,
                responder,
            } => {
                // Forget requests whose caller gave up waiting.
                self.pending.retain(|_, sender| !sender.is_closed());

                let id = self.next_request_id;
                self.next_request_id += 1;
                self.pending.insert(id, responder);
                Frame::Request {
                    id,
                    procedure,
                    data,
                }
            }
            Command::Respond { id, result } => match result {
                Ok(data) => Frame::Response {
                    id,
                    data,
                    error: None,
                },
                Err(message) => Frame::Response {
                    id,
                    data: Value::Null,
                    error: Some(message),
                },
            },
            Command::Send { event, data } => Frame::Message { event, data },
            Command::Disconnect { code, reason } => {
                let frame = Frame::Disconnect {
                    code,
                    reason: reason.clone(),
                };
                let _ = write_frame(&mut self.writer, &frame, self.settings.max_frame_size).await;
                return Some(format!("Disconnected locally ({code}): {reason}"));
            }
        };

        match write_frame(&mut self.writer, &frame, self.settings.max_frame_size).await {
            Ok(()) => None,
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => {
                warn!("❌ Dropped oversized frame to {}: {}", self.connection.peer_id, err);
                None
            }
            Err(err) => Some(format!("Write failed: {err}")),
        }
    }

    fn handle_frame(&mut self, raw: Value) -> Option<String> {
        let frame = match Frame::parse(&raw, &self.settings.validation) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("❌ >> [P2P-IN] Invalid frame from {}: {}", self.connection.peer_id, err);
                return None;
            }
        };

        match frame {
            Frame::Request {
                id,
                procedure,
                data,
            } => {
                let request = P2pRequest {
                    id,
                    procedure,
                    data,
                    connection: self.connection.clone(),
                    responded: false,
                };
                let _ = self.events.send(ConnectionEvent::Request(request));
            }
            Frame::Response { id, data, error } => {
                if let Some(responder) = self.pending.remove(&id) {
                    let _ = responder.send(error.map_or(Ok(data), Err));
                }
            }
            Frame::Message { event, data } => {
                let _ = self.events.send(ConnectionEvent::Message {
                    peer_id: self.connection.peer_id.clone(),
                    message: P2pMessagePacket { event, data },
                });
            }
            Frame::Disconnect { code, reason } => {
                return Some(format!("Disconnected by remote ({code}): {reason}"));
            }
            Frame::Handshake { .. } => {
                warn!("❌ >> [P2P-IN] Unexpected handshake from {}", self.connection.peer_id);
            }
        }

        None
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    max_frame_size: usize,
    frames: UnboundedSender<io::Result<Value>>,
) {
    loop {
        match read_frame(&mut reader, max_frame_size).await {
            Ok(Some(raw)) => {
                if frames.send(Ok(raw)).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                let _ = frames.send(Err(err));
                return;
            }
        }
    }
}

/// Read and validate the handshake of an inbound connection.
pub async fn read_handshake(
    stream: &mut TcpStream,
    settings: &TransportSettings,
) -> Result<HandshakeQuery, HandshakeRejection> {
    let raw = time::timeout(
        settings.connect_timeout,
        read_frame(stream, settings.max_frame_size),
    )
    .await;

    let url = match raw {
        Ok(Ok(Some(raw))) => match Frame::parse(&raw, &settings.validation) {
            Ok(Frame::Handshake { url }) => url,
            _ => String::new(),
        },
        _ => String::new(),
    };

    settings.validation.validate_handshake_query(&url)
}

/// Tell the remote why its handshake was refused and close the stream.
pub async fn reject(mut stream: TcpStream, rejection: &HandshakeRejection, max_frame_size: usize) {
    let frame = Frame::Disconnect {
        code: rejection.code(),
        reason: rejection.reason().to_owned(),
    };
    let _ = write_frame(&mut stream, &frame, max_frame_size).await;
    let _ = stream.shutdown().await;
}
