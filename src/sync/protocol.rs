//! Binary and JSON WebSocket protocol for OT synchronization.
//!
//! Binary frames carry a 5-byte header followed by a bincode payload:
//!
//! ```text
//! [version u8][message type u8][payload length u24][payload ...]
//! ```
//!
//! Text frames carry the same messages as externally tagged JSON
//! (`{"Operation": {...}}`), where operations use the compact
//! `[retain, "insert", -delete]` array form.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use super::{ChannelId, PeerId, SyncError};
use crate::ot::TextOperation;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum message size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;

/// Message type identifiers for the binary frame header
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Connection
    Hello = 0x01,
    Welcome = 0x02,
    Goodbye = 0x03,
    Error = 0x04,

    // Channel membership
    JoinChannel = 0x20,
    LeaveChannel = 0x21,
    Init = 0x22,
    ChannelLeft = 0x23,

    // Operations
    Operation = 0x30,
    Ack = 0x31,
    RemoteOperation = 0x32,
    ResyncRequest = 0x33,
    Resync = 0x34,

    // Keepalive
    Ping = 0xF0,
    Pong = 0xF1,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(MessageType::Hello),
            0x02 => Ok(MessageType::Welcome),
            0x03 => Ok(MessageType::Goodbye),
            0x04 => Ok(MessageType::Error),
            0x20 => Ok(MessageType::JoinChannel),
            0x21 => Ok(MessageType::LeaveChannel),
            0x22 => Ok(MessageType::Init),
            0x23 => Ok(MessageType::ChannelLeft),
            0x30 => Ok(MessageType::Operation),
            0x31 => Ok(MessageType::Ack),
            0x32 => Ok(MessageType::RemoteOperation),
            0x33 => Ok(MessageType::ResyncRequest),
            0x34 => Ok(MessageType::Resync),
            0xF0 => Ok(MessageType::Ping),
            0xF1 => Ok(MessageType::Pong),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("Unexpected message type: {0:?}")]
    UnexpectedMessageType(MessageType),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Version mismatch: expected {0}, got {1}")]
    VersionMismatch(u8, u8),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Initial handshake with client info
    Hello { client_name: String },

    /// Graceful disconnect
    Goodbye { reason: Option<String> },

    /// Join a channel, leaving the current one if any
    JoinChannel { channel_id: ChannelId },

    /// Leave a channel
    LeaveChannel { channel_id: ChannelId },

    /// Submit an edit built against `base_revision`
    Operation {
        channel_id: ChannelId,
        base_revision: u64,
        operation: TextOperation,
    },

    /// Ask for a fresh snapshot of the channel
    ResyncRequest { channel_id: ChannelId },

    /// Ping for keepalive
    Ping { timestamp: u64 },
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Welcome response with assigned peer ID
    Welcome {
        protocol_version: u8,
        peer_id: PeerId,
        server_time: i64,
    },

    /// Error response
    Error {
        code: ErrorCode,
        message: String,
        channel_id: Option<ChannelId>,
    },

    /// Graceful disconnect acknowledgment
    Goodbye { reason: Option<String> },

    /// Document state on join
    Init {
        channel_id: ChannelId,
        document: String,
        revision: u64,
    },

    /// Confirmation of leaving a channel
    ChannelLeft { channel_id: ChannelId },

    /// The sender's operation was committed as `revision`
    Ack { channel_id: ChannelId, revision: u64 },

    /// Another member's operation, already rebased, committed as `revision`
    RemoteOperation {
        channel_id: ChannelId,
        revision: u64,
        operation: TextOperation,
    },

    /// The sender is out of sync and must reload from this snapshot
    Resync {
        channel_id: ChannelId,
        reason: String,
        document: String,
        revision: u64,
    },

    /// Pong response
    Pong { timestamp: u64, server_time: i64 },
}

/// Error codes for server responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    InvalidMessage = 1,
    PeerNotFound = 2,
    ChannelFull = 3,
    TooManyChannels = 4,
    NotJoined = 5,
    DocumentTooLarge = 6,
    StorageError = 7,
    VersionMismatch = 8,
    OutOfSync = 9,
}

impl From<&SyncError> for ErrorCode {
    fn from(err: &SyncError) -> Self {
        match err {
            SyncError::PeerNotFound(_) => ErrorCode::PeerNotFound,
            SyncError::ChannelFull(_) => ErrorCode::ChannelFull,
            SyncError::TooManyChannels => ErrorCode::TooManyChannels,
            SyncError::NotJoined(_) => ErrorCode::NotJoined,
            SyncError::DocumentTooLarge { .. } => ErrorCode::DocumentTooLarge,
            SyncError::InvalidMessage(_) => ErrorCode::InvalidMessage,
            SyncError::StorageError(_) => ErrorCode::StorageError,
            SyncError::RevisionAhead { .. }
            | SyncError::RevisionTooOld { .. }
            | SyncError::Transform(_) => ErrorCode::OutOfSync,
        }
    }
}

impl ClientMessage {
    fn message_type(&self) -> MessageType {
        match self {
            ClientMessage::Hello { .. } => MessageType::Hello,
            ClientMessage::Goodbye { .. } => MessageType::Goodbye,
            ClientMessage::JoinChannel { .. } => MessageType::JoinChannel,
            ClientMessage::LeaveChannel { .. } => MessageType::LeaveChannel,
            ClientMessage::Operation { .. } => MessageType::Operation,
            ClientMessage::ResyncRequest { .. } => MessageType::ResyncRequest,
            ClientMessage::Ping { .. } => MessageType::Ping,
        }
    }
}

impl ServerMessage {
    fn message_type(&self) -> MessageType {
        match self {
            ServerMessage::Welcome { .. } => MessageType::Welcome,
            ServerMessage::Error { .. } => MessageType::Error,
            ServerMessage::Goodbye { .. } => MessageType::Goodbye,
            ServerMessage::Init { .. } => MessageType::Init,
            ServerMessage::ChannelLeft { .. } => MessageType::ChannelLeft,
            ServerMessage::Ack { .. } => MessageType::Ack,
            ServerMessage::RemoteOperation { .. } => MessageType::RemoteOperation,
            ServerMessage::Resync { .. } => MessageType::Resync,
            ServerMessage::Pong { .. } => MessageType::Pong,
        }
    }
}

/// Protocol codec for encoding/decoding messages
pub struct SyncProtocol;

impl SyncProtocol {
    /// Encode a client message to a binary frame
    pub fn encode_client(msg: &ClientMessage) -> Result<Bytes, ProtocolError> {
        encode_frame(msg.message_type(), &bincode::serialize(msg)?)
    }

    /// Encode a server message to a binary frame
    pub fn encode_server(msg: &ServerMessage) -> Result<Bytes, ProtocolError> {
        encode_frame(msg.message_type(), &bincode::serialize(msg)?)
    }

    /// Decode a client message from a binary frame
    pub fn decode_client(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
        let (msg_type, payload) = decode_frame(data)?;
        let msg: ClientMessage = bincode::deserialize(payload)?;
        if msg.message_type() != msg_type {
            return Err(ProtocolError::UnexpectedMessageType(msg_type));
        }
        Ok(msg)
    }

    /// Decode a server message from a binary frame
    pub fn decode_server(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
        let (msg_type, payload) = decode_frame(data)?;
        let msg: ServerMessage = bincode::deserialize(payload)?;
        if msg.message_type() != msg_type {
            return Err(ProtocolError::UnexpectedMessageType(msg_type));
        }
        Ok(msg)
    }

    /// Encode a server message as JSON text
    pub fn encode_server_json(msg: &ServerMessage) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(msg)?)
    }

    /// Decode a client message from JSON text
    pub fn decode_client_json(text: &str) -> Result<ClientMessage, ProtocolError> {
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(text.len(), MAX_MESSAGE_SIZE));
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Create an error response message
    pub fn error_response(
        code: ErrorCode,
        message: impl Into<String>,
        channel_id: Option<ChannelId>,
    ) -> ServerMessage {
        ServerMessage::Error {
            code,
            message: message.into(),
            channel_id,
        }
    }
}

fn encode_frame(msg_type: MessageType, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    if payload.len() + HEADER_LEN > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(
            payload.len() + HEADER_LEN,
            MAX_MESSAGE_SIZE,
        ));
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(msg_type as u8);
    buf.put_u24(payload.len() as u32);
    buf.put_slice(payload);

    Ok(buf.freeze())
}

fn decode_frame(data: &[u8]) -> Result<(MessageType, &[u8]), ProtocolError> {
    if data.len() < HEADER_LEN {
        return Err(ProtocolError::InvalidFormat(
            "Message too short".to_string(),
        ));
    }

    let mut cursor = Cursor::new(data);

    let version = cursor.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, version));
    }

    let msg_type = MessageType::try_from(cursor.get_u8())?;
    let payload_len = cursor.get_uint(3) as usize;

    if data.len() < HEADER_LEN + payload_len {
        return Err(ProtocolError::InvalidFormat(format!(
            "Expected {} bytes, got {}",
            HEADER_LEN + payload_len,
            data.len()
        )));
    }

    Ok((msg_type, &data[HEADER_LEN..HEADER_LEN + payload_len]))
}

/// Extension trait for writing u24 values
trait BufMutExt {
    fn put_u24(&mut self, n: u32);
}

impl BufMutExt for BytesMut {
    fn put_u24(&mut self, n: u32) {
        self.put_u8((n >> 16) as u8);
        self.put_u8((n >> 8) as u8);
        self.put_u8(n as u8);
    }
}
