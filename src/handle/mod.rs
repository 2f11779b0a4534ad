// src/handle/mod.rs

//! Worker-side listening handles.
//!
//! A listener registration produces either a [`RoundRobinHandle`] (the primary
//! accepts and forwards connections) or a [`SharedHandle`] (the worker owns the
//! real listen socket). Both expose the [`IServerHandle`] capability set so the
//! listener object never needs to know which one it holds.

pub mod index;
pub mod native;
pub mod registry;
pub mod round_robin;
pub mod shared;

pub use index::{ListenerIndexAllocator, ListenerQueryKey};
pub use native::NativeHandle;
pub use registry::HandleRegistry;
pub use round_robin::RoundRobinHandle;
pub use shared::SharedHandle;

use crate::error::ClusterError;
use crate::protocol::{HandleKey, ServerQuery, SockName};
use crate::runtime::{CloseCompletion, Command, MailboxSender};

use async_trait::async_trait;
use parking_lot::Mutex;
use static_assertions::assert_impl_all;
use std::fmt;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use tokio::sync::oneshot;

/// The capability set a listener needs from its underlying handle.
#[async_trait]
pub trait IServerHandle: Send + Sync {
  /// Starts listening. Backlog handling depends on the handle kind.
  fn listen(&self, backlog: i32) -> Result<(), ClusterError>;

  /// Releases the handle. Idempotent.
  async fn close(&self) -> Result<(), ClusterError>;

  /// The bound socket name, or `NotBound` once closed or when unknown.
  fn getsockname(&self) -> Result<SockName, ClusterError>;

  fn ref_handle(&self);

  fn unref_handle(&self);
}

/// The higher-level listener object owning a handle.
///
/// When present, the disconnect drain asks the owner to close instead of
/// closing the raw handle, and the connection router consults it before
/// accepting a forwarded connection.
pub trait IListenerOwner: Send + Sync + 'static {
  /// Close the listener (typically calling `handle.close()` and finishing
  /// in-flight work), then complete `done`.
  fn close(&self, handle: ListenHandle, done: CloseCompletion);

  /// True when the listener cannot take another connection.
  fn max_connections_reached(&self) -> bool {
    false
  }
}

/// A connection forwarded by the primary for a round-robin listener.
#[derive(Debug)]
pub struct IncomingConnection {
  pub key: HandleKey,
  pub handle: OwnedFd,
}

/// Everything the session core needs to finish closing a handle. Produced
/// exactly once per handle, by whoever takes its key first.
#[derive(Debug)]
pub struct CloseTicket {
  pub key: HandleKey,
  pub query_key: ListenerQueryKey,
  pub index: u64,
  pub(crate) native: Option<NativeHandle>,
}

/// State common to both handle kinds.
pub(crate) struct HandleCore {
  /// `None` once closed.
  key: Mutex<Option<HandleKey>>,
  query_key: ListenerQueryKey,
  query: ServerQuery,
  session: MailboxSender,
  incoming: async_channel::Receiver<IncomingConnection>,
}

impl HandleCore {
  pub(crate) fn new(
    key: HandleKey,
    query_key: ListenerQueryKey,
    query: ServerQuery,
    session: MailboxSender,
    incoming: async_channel::Receiver<IncomingConnection>,
  ) -> Self {
    Self {
      key: Mutex::new(Some(key)),
      query_key,
      query,
      session,
      incoming,
    }
  }

  pub(crate) fn key(&self) -> Option<HandleKey> {
    self.key.lock().clone()
  }

  pub(crate) fn is_open(&self) -> bool {
    self.key.lock().is_some()
  }

  /// Takes the key, producing the close ticket. `None` if already closed.
  pub(crate) fn take_ticket(&self, native: impl FnOnce() -> Option<NativeHandle>) -> Option<CloseTicket> {
    let key = self.key.lock().take()?;
    Some(CloseTicket {
      key,
      query_key: self.query_key.clone(),
      index: self.query.index,
      native: native(),
    })
  }

  /// Hands a ticket to the session core and waits for the protocol side.
  pub(crate) async fn submit_close(&self, ticket: CloseTicket) -> Result<(), ClusterError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    let key = ticket.key.clone();
    if self
      .session
      .send(Command::CloseHandle { ticket, reply_tx })
      .await
      .is_err()
    {
      tracing::debug!(%key, "Session core gone while closing handle");
      return Err(ClusterError::ConnectionClosed);
    }
    reply_rx.await.map_err(|_| ClusterError::ConnectionClosed)?
  }

  async fn report_listening(&self, port: Option<u16>) -> Result<(), ClusterError> {
    self
      .session
      .send(Command::ReportListening {
        query: self.query.clone(),
        port,
      })
      .await
      .map_err(|_| ClusterError::ConnectionClosed)
  }

  async fn accept(&self) -> Result<IncomingConnection, ClusterError> {
    self.incoming.recv().await.map_err(|_| ClusterError::ConnectionClosed)
  }
}

impl fmt::Debug for HandleCore {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HandleCore")
      .field("key", &*self.key.lock())
      .field("query_key", &self.query_key)
      .field("index", &self.query.index)
      .finish_non_exhaustive()
  }
}

/// The handle returned by a listener registration.
#[derive(Debug, Clone)]
pub enum ListenHandle {
  RoundRobin(RoundRobinHandle),
  Shared(SharedHandle),
}

assert_impl_all!(ListenHandle: Send, Sync, Clone);

impl ListenHandle {
  fn core(&self) -> &Arc<HandleCore> {
    match self {
      ListenHandle::RoundRobin(h) => h.core(),
      ListenHandle::Shared(h) => h.core(),
    }
  }

  /// The primary-issued key, `None` once closed.
  pub fn key(&self) -> Option<HandleKey> {
    self.core().key()
  }

  pub fn index(&self) -> u64 {
    self.core().query.index
  }

  pub fn is_closed(&self) -> bool {
    !self.core().is_open()
  }

  pub fn is_round_robin(&self) -> bool {
    matches!(self, ListenHandle::RoundRobin(_))
  }

  /// Waits for the next connection forwarded by the primary. Fails with
  /// `ConnectionClosed` once the handle is closed and the queue is drained.
  pub async fn accept(&self) -> Result<IncomingConnection, ClusterError> {
    self.core().accept().await
  }

  /// Tells the primary the listener is up. `port` is the port the OS actually
  /// bound, if known; otherwise the requested port is reported.
  pub async fn report_listening(&self, port: Option<u16>) -> Result<(), ClusterError> {
    self.core().report_listening(port).await
  }

  pub(crate) fn take_close_ticket(&self) -> Option<CloseTicket> {
    match self {
      ListenHandle::RoundRobin(h) => h.take_close_ticket(),
      ListenHandle::Shared(h) => h.take_close_ticket(),
    }
  }
}

#[async_trait]
impl IServerHandle for ListenHandle {
  fn listen(&self, backlog: i32) -> Result<(), ClusterError> {
    match self {
      ListenHandle::RoundRobin(h) => h.listen(backlog),
      ListenHandle::Shared(h) => h.listen(backlog),
    }
  }

  async fn close(&self) -> Result<(), ClusterError> {
    match self {
      ListenHandle::RoundRobin(h) => h.close().await,
      ListenHandle::Shared(h) => h.close().await,
    }
  }

  fn getsockname(&self) -> Result<SockName, ClusterError> {
    match self {
      ListenHandle::RoundRobin(h) => h.getsockname(),
      ListenHandle::Shared(h) => h.getsockname(),
    }
  }

  fn ref_handle(&self) {
    match self {
      ListenHandle::RoundRobin(h) => h.ref_handle(),
      ListenHandle::Shared(h) => h.ref_handle(),
    }
  }

  fn unref_handle(&self) {
    match self {
      ListenHandle::RoundRobin(h) => h.unref_handle(),
      ListenHandle::Shared(h) => h.unref_handle(),
    }
  }
}
