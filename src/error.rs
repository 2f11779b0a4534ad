// src/error.rs

use crate::protocol::HandleKey;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ClusterError {
  // --- I/O Errors ---
  #[error("I/O error: {0}")]
  Io(#[from] io::Error),

  #[error("Invalid argument provided: {0}")]
  InvalidArgument(String),

  // --- Channel Errors ---
  #[error("Channel to the primary is closed")]
  ConnectionClosed,

  // --- Registration Errors ---
  #[error("Handle key {0} is already registered")]
  DuplicateKey(HandleKey),
  #[error("Primary refused the listener query (errno {errno})")]
  QueryFailed { errno: i32 },
  #[error("Handle is not bound")]
  NotBound,

  // --- State Errors ---
  #[error("Operation is invalid for the current worker state: {0}")]
  InvalidState(&'static str),

  // --- Protocol Errors ---
  #[error("Cluster protocol violation: {0}")]
  ProtocolViolation(String),
  #[error("Frame codec error: {0}")]
  Codec(String),

  // --- Internal Errors ---
  #[error("Internal library error: {0}")]
  Internal(String),
}

impl ClusterError {
  /// Maps transport-level I/O failures onto `ConnectionClosed` where the
  /// channel is plainly gone, keeping everything else as `Io`.
  pub fn from_io_channel(e: io::Error) -> Self {
    match e.kind() {
      io::ErrorKind::BrokenPipe
      | io::ErrorKind::ConnectionReset
      | io::ErrorKind::ConnectionAborted
      | io::ErrorKind::NotConnected
      | io::ErrorKind::UnexpectedEof => ClusterError::ConnectionClosed,
      _ => ClusterError::Io(e),
    }
  }
}

impl From<serde_json::Error> for ClusterError {
  fn from(e: serde_json::Error) -> Self {
    ClusterError::Codec(e.to_string())
  }
}
