// src/worker/router.rs

//! Routes connections forwarded by the primary to the listener registered
//! under their key.

use crate::handle::{HandleRegistry, IListenerOwner, IncomingConnection, ListenHandle};
use crate::protocol::HandleKey;

use std::fmt;
use std::os::fd::OwnedFd;
use std::sync::Arc;

/// A registry entry: the handle, its optional owning listener, and the sending
/// side of its accept queue.
pub(crate) struct HandleEntry {
  pub(crate) handle: ListenHandle,
  pub(crate) owner: Option<Arc<dyn IListenerOwner>>,
  pub(crate) conn_tx: async_channel::Sender<IncomingConnection>,
}

impl fmt::Debug for HandleEntry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HandleEntry")
      .field("handle", &self.handle)
      .field("has_owner", &self.owner.is_some())
      .field("queued", &self.conn_tx.len())
      .finish()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
  UnknownKey,
  MaxConnections,
  QueueFull,
  ListenerGone,
  MissingDescriptor,
}

/// The router's decision for one forwarded connection. Acknowledge first,
/// then [`deliver`](Routing::deliver).
#[derive(Debug)]
pub(crate) enum Routing {
  Accept {
    conn_tx: async_channel::Sender<IncomingConnection>,
    conn: IncomingConnection,
  },
  Reject {
    reason: RejectReason,
    handle: Option<OwnedFd>,
  },
}

impl Routing {
  pub(crate) fn accepted(&self) -> bool {
    matches!(self, Routing::Accept { .. })
  }

  /// Hands an accepted connection to its listener; closes a rejected one.
  pub(crate) fn deliver(self) {
    match self {
      Routing::Accept { conn_tx, conn } => {
        if let Err(e) = conn_tx.try_send(conn) {
          // Only the session core sends on this queue, so the capacity checked
          // in `route` still holds; the listener may have vanished meanwhile.
          tracing::warn!(key = %e.into_inner().key, "Accepted connection could not be queued, closing it");
        }
      }
      Routing::Reject { reason, handle } => {
        tracing::debug!(?reason, "Closing rejected connection");
        drop(handle);
      }
    }
  }
}

pub(crate) fn route(registry: &HandleRegistry<HandleEntry>, key: &HandleKey, handle: Option<OwnedFd>) -> Routing {
  let reject = |reason: RejectReason, handle: Option<OwnedFd>| {
    tracing::debug!(%key, ?reason, "Rejecting forwarded connection");
    Routing::Reject { reason, handle }
  };

  let Some(entry) = registry.get(key) else {
    return reject(RejectReason::UnknownKey, handle);
  };
  if entry.owner.as_ref().is_some_and(|owner| owner.max_connections_reached()) {
    return reject(RejectReason::MaxConnections, handle);
  }
  if entry.conn_tx.is_closed() {
    return reject(RejectReason::ListenerGone, handle);
  }
  if entry.conn_tx.is_full() {
    return reject(RejectReason::QueueFull, handle);
  }
  let Some(fd) = handle else {
    tracing::warn!(%key, "Forwarded connection carried no descriptor");
    return reject(RejectReason::MissingDescriptor, None);
  };
  Routing::Accept {
    conn_tx: entry.conn_tx.clone(),
    conn: IncomingConnection {
      key: key.clone(),
      handle: fd,
    },
  }
}
