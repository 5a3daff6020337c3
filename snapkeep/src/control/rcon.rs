//! Source RCON client.
//!
//! # Wire format
//!
//! Every packet is little-endian:
//!
//! ```text
//! ┌──────────┬────────────┬──────────┬──────────────┬──────┐
//! │ len: i32 │ id: i32    │ type: i32│ body (ASCII) │ 0 0  │
//! └──────────┴────────────┴──────────┴──────────────┴──────┘
//!             \_________________ len bytes _________________/
//! ```
//!
//! The client logs in with a type-3 packet carrying the password; the server
//! answers with the same id, or `-1` if the password is wrong. Commands are
//! type 2 and replies type 0.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::ControlClient;
use crate::error::ControlError;

/// Default RCON port.
pub const DEFAULT_PORT: u16 = 25575;

/// Longest command body the server accepts.
pub const MAX_COMMAND_LEN: usize = 1446;

/// Login request.
pub const PACKET_LOGIN: i32 = 3;
/// Command request.
pub const PACKET_COMMAND: i32 = 2;
/// Command response.
pub const PACKET_RESPONSE: i32 = 0;

/// Request id the server uses to signal a failed login.
pub const AUTH_FAILED_ID: i32 = -1;

/// id + type + two terminating NULs.
const HEADER_LEN: usize = 10;
/// Largest packet accepted from the server.
const MAX_PACKET_LEN: usize = 64 * 1024;

/// One RCON packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Client-chosen id, echoed by the server.
    pub request_id: i32,
    /// Packet type.
    pub kind: i32,
    /// Payload text.
    pub body: String,
}

impl Packet {
    /// Creates a packet.
    pub fn new(request_id: i32, kind: i32, body: impl Into<String>) -> Self {
        Self {
            request_id,
            kind,
            body: body.into(),
        }
    }

    /// Encodes the packet, including its length prefix.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::MalformedPacket`] if the body is too large to
    /// describe with an `i32` length.
    pub fn encode(&self) -> Result<Vec<u8>, ControlError> {
        let len = i32::try_from(HEADER_LEN + self.body.len()).map_err(|_| ControlError::MalformedPacket {
            reason: format!("body of {} bytes is too large", self.body.len()),
        })?;

        let mut buf = Vec::with_capacity(4 + HEADER_LEN + self.body.len());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&self.kind.to_le_bytes());
        buf.extend_from_slice(self.body.as_bytes());
        buf.extend_from_slice(&[0, 0]);
        Ok(buf)
    }
}

/// Reads one packet.
///
/// # Errors
///
/// Returns [`ControlError::Io`] on a read failure or early EOF, and
/// [`ControlError::MalformedPacket`] if the length or terminator is wrong.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Packet, ControlError> {
    let len = reader.read_i32_le().await?;
    let len = usize::try_from(len)
        .ok()
        .filter(|len| (HEADER_LEN..=MAX_PACKET_LEN).contains(len))
        .ok_or_else(|| ControlError::MalformedPacket {
            reason: format!("invalid packet length {len}"),
        })?;

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;

    let (head, rest) = buf.split_at(8);
    let Some(body) = rest.strip_suffix(&[0u8, 0]) else {
        return Err(ControlError::MalformedPacket {
            reason: "missing NUL terminator".to_string(),
        });
    };

    let mut id = [0u8; 4];
    let mut kind = [0u8; 4];
    id.copy_from_slice(&head[..4]);
    kind.copy_from_slice(&head[4..]);

    Ok(Packet {
        request_id: i32::from_le_bytes(id),
        kind: i32::from_le_bytes(kind),
        body: String::from_utf8_lossy(body).into_owned(),
    })
}

/// Writes one packet and flushes.
///
/// # Errors
///
/// Returns [`ControlError`] if encoding or the write fails.
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<(), ControlError> {
    writer.write_all(&packet.encode()?).await?;
    writer.flush().await?;
    Ok(())
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Connection settings for [`RconClient`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RconConfig {
    /// Server host name or address.
    pub host: String,
    /// Server RCON port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// RCON password.
    pub password: String,
    /// Limit on each connect and round trip.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl RconConfig {
    /// Creates a configuration with the default port and timeout.
    pub fn new(host: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            password: password.into(),
            timeout: default_timeout(),
        }
    }

    /// `host:port`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// RCON client over TCP.
#[derive(Debug)]
pub struct RconClient {
    config: RconConfig,
    stream: Option<TcpStream>,
    last_id: i32,
}

impl RconClient {
    /// Connects and logs in.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Connect`] if the server is unreachable and
    /// [`ControlError::AuthFailed`] if the password is rejected.
    pub async fn connect(config: RconConfig) -> Result<Self, ControlError> {
        let mut client = Self {
            config,
            stream: None,
            last_id: 0,
        };
        client.reconnect().await?;
        Ok(client)
    }

    /// The connection settings.
    pub fn config(&self) -> &RconConfig {
        &self.config
    }

    /// Returns `true` while a logged-in connection is held.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn next_id(&mut self) -> i32 {
        self.last_id = match self.last_id.checked_add(1) {
            Some(id) if id > 0 => id,
            _ => 1,
        };
        self.last_id
    }

    /// Sends `request` and reads one reply, dropping the connection on any
    /// failure.
    async fn round_trip(&mut self, request: &Packet) -> Result<Packet, ControlError> {
        let timeout = self.config.timeout;
        let stream = self.stream.as_mut().ok_or(ControlError::NotConnected)?;

        let result = tokio::time::timeout(timeout, async {
            write_packet(stream, request).await?;
            let mut reply = read_packet(stream).await?;
            // Some servers precede the login answer with an empty response.
            if request.kind == PACKET_LOGIN && reply.kind == PACKET_RESPONSE && reply.body.is_empty() {
                reply = read_packet(stream).await?;
            }
            Ok::<_, ControlError>(reply)
        })
        .await
        .unwrap_or(Err(ControlError::Timeout(timeout)));

        if result.is_err() {
            self.stream = None;
        }
        result
    }
}

#[async_trait]
impl ControlClient for RconClient {
    #[tracing::instrument(name = "rcon", skip(self), fields(addr = %self.config.addr()))]
    async fn send_command(&mut self, command: &str) -> Result<String, ControlError> {
        if command.len() > MAX_COMMAND_LEN {
            return Err(ControlError::CommandTooLong {
                len: command.len(),
                max: MAX_COMMAND_LEN,
            });
        }

        let id = self.next_id();
        let reply = self.round_trip(&Packet::new(id, PACKET_COMMAND, command)).await?;
        if reply.request_id != id {
            self.stream = None;
            return Err(ControlError::MalformedPacket {
                reason: format!("reply id {} does not match request id {id}", reply.request_id),
            });
        }

        tracing::debug!(response = %reply.body, "command sent");
        Ok(reply.body)
    }

    #[tracing::instrument(name = "rcon", skip(self), fields(addr = %self.config.addr()))]
    async fn reconnect(&mut self) -> Result<(), ControlError> {
        self.stream = None;
        let addr = self.config.addr();
        let timeout = self.config.timeout;

        let stream = tokio::time::timeout(timeout, TcpStream::connect((self.config.host.as_str(), self.config.port)))
            .await
            .map_err(|_| ControlError::Timeout(timeout))?
            .map_err(|source| ControlError::Connect {
                addr: addr.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);

        let id = self.next_id();
        let login = Packet::new(id, PACKET_LOGIN, self.config.password.clone());
        let reply = self.round_trip(&login).await?;

        if reply.request_id == AUTH_FAILED_ID {
            self.stream = None;
            return Err(ControlError::AuthFailed { addr });
        }
        if reply.request_id != id {
            self.stream = None;
            return Err(ControlError::MalformedPacket {
                reason: format!("login reply id {} does not match request id {id}", reply.request_id),
            });
        }

        tracing::info!("rcon connected");
        Ok(())
    }
}
