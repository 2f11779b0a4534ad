// src/transport/mod.rs

//! The ordered message + descriptor channel between a worker and the primary.

pub mod inproc;
#[cfg(feature = "ipc")]
pub mod ipc;

use crate::error::ClusterError;
use crate::protocol::Frame;

use async_trait::async_trait;
use std::fmt;
use std::os::fd::OwnedFd;
use std::sync::Arc;

/// One received message, with the descriptor that travelled with it.
#[derive(Debug)]
pub struct Inbound {
  pub frame: Frame,
  pub handle: Option<OwnedFd>,
}

/// Inbound messages in send order. The channel closing is the transport's
/// disconnect event.
pub type InboundReceiver = async_channel::Receiver<Inbound>;
pub type InboundSender = async_channel::Sender<Inbound>;

/// Outbound half of the channel to the primary.
///
/// Implementations must deliver frames in the order `send` is called.
#[async_trait]
pub trait IPrimaryChannel: Send + Sync + 'static {
  /// Sends a frame, optionally attaching a descriptor. Resolves once the frame
  /// has been handed to the channel.
  async fn send(&self, frame: Frame, handle: Option<OwnedFd>) -> Result<(), ClusterError>;

  /// Tears the channel down. Idempotent.
  fn disconnect(&self);

  fn is_connected(&self) -> bool;
}

/// Both worker-side ends of a transport.
pub struct ChannelEnds {
  pub channel: Arc<dyn IPrimaryChannel>,
  pub inbound: InboundReceiver,
}

impl fmt::Debug for ChannelEnds {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ChannelEnds")
      .field("connected", &self.channel.is_connected())
      .finish_non_exhaustive()
  }
}
