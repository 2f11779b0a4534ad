// src/handle/round_robin.rs

use crate::error::ClusterError;
use crate::handle::{CloseTicket, HandleCore, IServerHandle};
use crate::protocol::SockName;

use async_trait::async_trait;
use std::sync::Arc;

/// Synthetic listening handle for round-robin mode. The primary owns the
/// socket and forwards accepted connections; this handle only speaks the
/// protocol.
#[derive(Debug, Clone)]
pub struct RoundRobinHandle {
  core: Arc<HandleCore>,
  sockname: Option<SockName>,
}

impl RoundRobinHandle {
  pub(crate) fn new(core: Arc<HandleCore>, sockname: Option<SockName>) -> Self {
    Self { core, sockname }
  }

  pub(crate) fn core(&self) -> &Arc<HandleCore> {
    &self.core
  }

  pub(crate) fn take_close_ticket(&self) -> Option<CloseTicket> {
    self.core.take_ticket(|| None)
  }
}

#[async_trait]
impl IServerHandle for RoundRobinHandle {
  /// Backlog is a primary-side aggregate policy; nothing to negotiate here.
  fn listen(&self, backlog: i32) -> Result<(), ClusterError> {
    tracing::trace!(backlog, index = self.core.query.index, "Round-robin listen (backlog ignored)");
    Ok(())
  }

  async fn close(&self) -> Result<(), ClusterError> {
    // The caller treats close as done once it returns, but the primary may
    // still be forwarding connections; the router rejects those.
    match self.take_close_ticket() {
      Some(ticket) => self.core.submit_close(ticket).await,
      None => Ok(()),
    }
  }

  fn getsockname(&self) -> Result<SockName, ClusterError> {
    if !self.core.is_open() {
      return Err(ClusterError::NotBound);
    }
    self.sockname.clone().ok_or(ClusterError::NotBound)
  }

  // The channel to the primary keeps the worker alive; the handle has no say.
  fn ref_handle(&self) {}

  fn unref_handle(&self) {}
}
