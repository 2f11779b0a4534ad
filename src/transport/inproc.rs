// src/transport/inproc.rs

//! In-process channel pair. The worker side implements [`IPrimaryChannel`];
//! the [`PrimaryEnd`] lets the same process play the primary.

use crate::error::ClusterError;
use crate::protocol::message::{ACT_DISCONNECT, ACT_NEWCONN};
use crate::protocol::{Frame, HandleKey, ReplyPayload};
use crate::transport::{ChannelEnds, IPrimaryChannel, Inbound, InboundReceiver, InboundSender};

use async_trait::async_trait;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct Shared {
  connected: AtomicBool,
  to_primary: InboundSender,
  to_worker: InboundSender,
}

impl Shared {
  fn close(&self) {
    if self.connected.swap(false, Ordering::AcqRel) {
      // Closing keeps already queued messages readable.
      self.to_primary.close();
      self.to_worker.close();
      tracing::debug!("Inproc channel disconnected");
    }
  }
}

/// Worker-side sender of an inproc pair.
#[derive(Debug, Clone)]
pub struct InprocChannel {
  shared: Arc<Shared>,
}

#[async_trait]
impl IPrimaryChannel for InprocChannel {
  async fn send(&self, frame: Frame, handle: Option<OwnedFd>) -> Result<(), ClusterError> {
    if !self.is_connected() {
      return Err(ClusterError::ConnectionClosed);
    }
    self
      .shared
      .to_primary
      .send(Inbound { frame, handle })
      .await
      .map_err(|_| ClusterError::ConnectionClosed)
  }

  fn disconnect(&self) {
    self.shared.close();
  }

  fn is_connected(&self) -> bool {
    self.shared.connected.load(Ordering::Acquire)
  }
}

/// Creates a connected worker/primary pair.
pub fn pair(protocol_tag: &str) -> (ChannelEnds, PrimaryEnd) {
  let (to_primary, from_worker) = async_channel::unbounded();
  let (to_worker, from_primary) = async_channel::unbounded();
  let shared = Arc::new(Shared {
    connected: AtomicBool::new(true),
    to_primary,
    to_worker,
  });
  let ends = ChannelEnds {
    channel: Arc::new(InprocChannel { shared: shared.clone() }),
    inbound: from_primary,
  };
  let primary = PrimaryEnd {
    shared,
    from_worker,
    tag: protocol_tag.to_string(),
    next_seq: AtomicU64::new(1),
  };
  (ends, primary)
}

/// The primary's side of an inproc pair.
#[derive(Debug)]
pub struct PrimaryEnd {
  shared: Arc<Shared>,
  from_worker: InboundReceiver,
  tag: String,
  next_seq: AtomicU64,
}

impl PrimaryEnd {
  /// Next frame from the worker; `None` once disconnected and drained.
  pub async fn recv(&self) -> Option<Inbound> {
    self.from_worker.recv().await.ok()
  }

  /// A frame already queued by the worker, without waiting.
  pub fn try_recv(&self) -> Option<Inbound> {
    self.from_worker.try_recv().ok()
  }

  /// Sends a raw frame. A zero `seq` is replaced with the next sequence number.
  pub async fn send(&self, mut frame: Frame, handle: Option<OwnedFd>) -> Result<u64, ClusterError> {
    if !self.is_connected() {
      return Err(ClusterError::ConnectionClosed);
    }
    if frame.seq == 0 {
      frame.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
    }
    let seq = frame.seq;
    self
      .shared
      .to_worker
      .send(Inbound { frame, handle })
      .await
      .map_err(|_| ClusterError::ConnectionClosed)?;
    Ok(seq)
  }

  /// Replies to the worker frame numbered `ack`.
  pub async fn reply(&self, ack: u64, payload: ReplyPayload, handle: Option<OwnedFd>) -> Result<u64, ClusterError> {
    let mut frame = Frame::new(self.tag.clone());
    frame.ack = Some(ack);
    if payload.errno != 0 {
      frame.errno = Some(payload.errno);
    }
    frame.key = payload.key;
    frame.sockname = payload.sockname;
    frame.data = payload.data;
    self.send(frame, handle).await
  }

  /// Forwards an accepted connection for `key`. Returns the frame's `seq`,
  /// which the worker's acknowledgement carries in `ack`.
  pub async fn send_connection(&self, key: HandleKey, handle: Option<OwnedFd>) -> Result<u64, ClusterError> {
    let mut frame = Frame::new(self.tag.clone()).with_act(ACT_NEWCONN);
    frame.key = Some(key);
    self.send(frame, handle).await
  }

  pub async fn send_disconnect(&self) -> Result<u64, ClusterError> {
    self.send(Frame::new(self.tag.clone()).with_act(ACT_DISCONNECT), None).await
  }

  pub fn disconnect(&self) {
    self.shared.close();
  }

  pub fn is_connected(&self) -> bool {
    self.shared.connected.load(Ordering::Acquire)
  }
}
