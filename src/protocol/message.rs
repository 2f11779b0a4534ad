// src/protocol/message.rs

//! Messages exchanged between a worker and the primary.
//!
//! On the wire every message is a flat [`Frame`]. The worker builds frames from
//! [`WorkerMessage`] and interprets inbound frames as [`PrimaryMessage`].

use crate::error::ClusterError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Default value of the envelope `cmd` field marking cluster protocol traffic.
pub const DEFAULT_PROTOCOL_TAG: &str = "RCLUSTER";

// Action names used in the `act` field.
pub const ACT_ONLINE: &str = "online";
pub const ACT_QUERY_SERVER: &str = "queryServer";
pub const ACT_LISTENING: &str = "listening";
pub const ACT_CLOSE: &str = "close";
pub const ACT_EXITED_AFTER_DISCONNECT: &str = "exitedAfterDisconnect";
pub const ACT_NEWCONN: &str = "newconn";
pub const ACT_DISCONNECT: &str = "disconnect";

/// Primary-assigned identifier of a listener. The worker never invents keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HandleKey {
  Int(u64),
  Str(String),
}

impl fmt::Display for HandleKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      HandleKey::Int(k) => write!(f, "{}", k),
      HandleKey::Str(k) => f.write_str(k),
    }
  }
}

impl From<u64> for HandleKey {
  fn from(k: u64) -> Self {
    HandleKey::Int(k)
  }
}

impl From<&str> for HandleKey {
  fn from(k: &str) -> Self {
    HandleKey::Str(k.to_string())
  }
}

impl From<String> for HandleKey {
  fn from(k: String) -> Self {
    HandleKey::Str(k)
  }
}

/// Kind of endpoint a listener binds. Stream listeners and datagram sockets
/// share the same handle identity space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
  Tcp4,
  Tcp6,
  Unix,
  Udp4,
  Udp6,
}

impl AddressType {
  pub fn as_str(&self) -> &'static str {
    match self {
      AddressType::Tcp4 => "tcp4",
      AddressType::Tcp6 => "tcp6",
      AddressType::Unix => "unix",
      AddressType::Udp4 => "udp4",
      AddressType::Udp6 => "udp6",
    }
  }

  /// True for filesystem socket endpoints, whose address is a path.
  pub fn is_path(&self) -> bool {
    matches!(self, AddressType::Unix)
  }
}

impl fmt::Display for AddressType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Socket name reported by the primary for a round-robin listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SockName {
  pub address: String,
  pub family: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub port: Option<u16>,
}

/// Flat wire representation of one protocol message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
  pub cmd: String,
  #[serde(default)]
  pub seq: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ack: Option<u64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub act: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub index: Option<u64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub address: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub port: Option<u16>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub address_type: Option<AddressType>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub fd: Option<i32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub exclusive: Option<bool>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub backlog: Option<i32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub data: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub key: Option<HandleKey>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub errno: Option<i32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sockname: Option<SockName>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub accepted: Option<bool>,
}

impl Frame {
  pub fn new(cmd: impl Into<String>) -> Self {
    Self {
      cmd: cmd.into(),
      ..Default::default()
    }
  }

  pub fn with_act(mut self, act: &str) -> Self {
    self.act = Some(act.to_string());
    self
  }

  pub fn act(&self) -> Option<&str> {
    self.act.as_deref()
  }
}

/// The endpoint description sent with `queryServer` and `listening`.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerQuery {
  pub index: u64,
  pub address: Option<String>,
  pub port: Option<u16>,
  pub address_type: AddressType,
  pub fd: Option<i32>,
  pub exclusive: bool,
  pub backlog: Option<i32>,
  pub data: Option<Value>,
}

impl ServerQuery {
  fn write_into(&self, frame: &mut Frame) {
    frame.index = Some(self.index);
    frame.address = self.address.clone();
    frame.port = self.port;
    frame.address_type = Some(self.address_type);
    frame.fd = self.fd;
    frame.exclusive = Some(self.exclusive);
    frame.backlog = self.backlog;
    frame.data = self.data.clone();
  }
}

/// Worker -> primary messages.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
  Online,
  QueryServer(ServerQuery),
  /// Same fields as the query, with the realized port.
  Listening(ServerQuery),
  Close { key: HandleKey },
  /// Reply to a forwarded connection.
  ConnectionAck { ack: u64, accepted: bool },
  ExitedAfterDisconnect,
}

impl WorkerMessage {
  pub fn variant_name(&self) -> &'static str {
    match self {
      WorkerMessage::Online => "Online",
      WorkerMessage::QueryServer(_) => "QueryServer",
      WorkerMessage::Listening(_) => "Listening",
      WorkerMessage::Close { .. } => "Close",
      WorkerMessage::ConnectionAck { .. } => "ConnectionAck",
      WorkerMessage::ExitedAfterDisconnect => "ExitedAfterDisconnect",
    }
  }

  /// Builds the wire frame, stamping the envelope tag and sequence number.
  pub fn into_frame(self, tag: &str, seq: u64) -> Frame {
    let mut frame = Frame::new(tag);
    frame.seq = seq;
    match self {
      WorkerMessage::Online => frame.act = Some(ACT_ONLINE.into()),
      WorkerMessage::QueryServer(query) => {
        frame.act = Some(ACT_QUERY_SERVER.into());
        query.write_into(&mut frame);
      }
      WorkerMessage::Listening(query) => {
        frame.act = Some(ACT_LISTENING.into());
        query.write_into(&mut frame);
      }
      WorkerMessage::Close { key } => {
        frame.act = Some(ACT_CLOSE.into());
        frame.key = Some(key);
      }
      WorkerMessage::ConnectionAck { ack, accepted } => {
        frame.ack = Some(ack);
        frame.accepted = Some(accepted);
      }
      WorkerMessage::ExitedAfterDisconnect => frame.act = Some(ACT_EXITED_AFTER_DISCONNECT.into()),
    }
    frame
  }
}

/// Payload of a reply frame (one carrying `ack`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplyPayload {
  pub errno: i32,
  pub key: Option<HandleKey>,
  pub sockname: Option<SockName>,
  pub data: Option<Value>,
}

/// Primary -> worker messages.
#[derive(Debug, Clone, PartialEq)]
pub enum PrimaryMessage {
  /// Answer to the worker frame whose `seq` equals `ack`.
  Reply { ack: u64, payload: ReplyPayload },
  /// A connection accepted by the primary; the descriptor travels with the frame.
  NewConnection { key: HandleKey, seq: u64 },
  Disconnect,
  Unknown { act: Option<String> },
}

impl PrimaryMessage {
  pub fn variant_name(&self) -> &'static str {
    match self {
      PrimaryMessage::Reply { .. } => "Reply",
      PrimaryMessage::NewConnection { .. } => "NewConnection",
      PrimaryMessage::Disconnect => "Disconnect",
      PrimaryMessage::Unknown { .. } => "Unknown",
    }
  }

  /// Interprets a frame as a reply, ignoring any `act` it carries.
  pub fn reply_from_frame(frame: &Frame) -> Option<PrimaryMessage> {
    let ack = frame.ack?;
    Some(PrimaryMessage::Reply {
      ack,
      payload: ReplyPayload {
        errno: frame.errno.unwrap_or(0),
        key: frame.key.clone(),
        sockname: frame.sockname.clone(),
        data: frame.data.clone(),
      },
    })
  }

  /// Interprets a frame by its `act`.
  pub fn from_act(frame: &Frame) -> Result<PrimaryMessage, ClusterError> {
    match frame.act() {
      Some(ACT_NEWCONN) => {
        let key = frame
          .key
          .clone()
          .ok_or_else(|| ClusterError::ProtocolViolation("newconn without key".into()))?;
        Ok(PrimaryMessage::NewConnection { key, seq: frame.seq })
      }
      Some(ACT_DISCONNECT) => Ok(PrimaryMessage::Disconnect),
      other => Ok(PrimaryMessage::Unknown {
        act: other.map(str::to_string),
      }),
    }
  }
}
