// src/config.rs

use crate::error::ClusterError;
use crate::protocol::DEFAULT_PROTOCOL_TAG;

/// Environment variable carrying the worker id assigned by the primary.
pub const ENV_UNIQUE_ID: &str = "RCLUSTER_UNIQUE_ID";
/// Environment variable carrying the inherited channel descriptor (ipc transport).
pub const ENV_CHANNEL_FD: &str = "RCLUSTER_CHANNEL_FD";

pub const DEFAULT_MAILBOX_CAPACITY: usize = 128;
pub const DEFAULT_ACCEPT_QUEUE_CAPACITY: usize = 1024;

/// Settings for one worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
  pub worker_id: u32,
  /// Envelope `cmd` value marking protocol frames.
  pub protocol_tag: String,
  pub mailbox_capacity: usize,
  /// Per-listener queue of forwarded connections not yet accepted locally.
  pub accept_queue_capacity: usize,
  /// Status used whenever the worker forces its own exit.
  pub exit_code: i32,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      worker_id: 0,
      protocol_tag: DEFAULT_PROTOCOL_TAG.to_string(),
      mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
      accept_queue_capacity: DEFAULT_ACCEPT_QUEUE_CAPACITY,
      exit_code: 0,
    }
  }
}

impl WorkerConfig {
  /// Reads the worker id from the environment. A missing or non-numeric id
  /// becomes 0, the same coercion the primary applies.
  pub fn from_env() -> Self {
    let worker_id = std::env::var(ENV_UNIQUE_ID)
      .ok()
      .map(|raw| parse_worker_id(&raw))
      .unwrap_or(0);
    tracing::debug!(worker_id, "WorkerConfig loaded from environment");
    Self {
      worker_id,
      ..Self::default()
    }
  }

  pub fn with_worker_id(mut self, worker_id: u32) -> Self {
    self.worker_id = worker_id;
    self
  }

  pub fn with_protocol_tag(mut self, tag: impl Into<String>) -> Self {
    self.protocol_tag = tag.into();
    self
  }

  pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
    self.mailbox_capacity = capacity;
    self
  }

  pub fn with_accept_queue_capacity(mut self, capacity: usize) -> Self {
    self.accept_queue_capacity = capacity;
    self
  }

  pub fn with_exit_code(mut self, code: i32) -> Self {
    self.exit_code = code;
    self
  }

  pub fn validate(&self) -> Result<(), ClusterError> {
    if self.protocol_tag.is_empty() {
      return Err(ClusterError::InvalidArgument("protocol tag must not be empty".into()));
    }
    if self.mailbox_capacity == 0 {
      return Err(ClusterError::InvalidArgument("mailbox capacity must be positive".into()));
    }
    if self.accept_queue_capacity == 0 {
      return Err(ClusterError::InvalidArgument(
        "accept queue capacity must be positive".into(),
      ));
    }
    Ok(())
  }
}

/// Reads the inherited channel descriptor number, if the primary passed one.
pub fn channel_fd_from_env() -> Option<i32> {
  std::env::var(ENV_CHANNEL_FD).ok()?.trim().parse().ok()
}

fn parse_worker_id(raw: &str) -> u32 {
  raw.trim().parse::<u32>().unwrap_or(0)
}
