// src/handle/shared.rs

use crate::error::ClusterError;
use crate::handle::{CloseTicket, HandleCore, IServerHandle, NativeHandle};
use crate::protocol::SockName;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::os::fd::OwnedFd;
use std::sync::Arc;

/// Wraps a real listen descriptor received from the primary. Closing it tells
/// the primary, deregisters it, and only then closes the descriptor.
#[derive(Debug, Clone)]
pub struct SharedHandle {
  core: Arc<HandleCore>,
  native: Arc<Mutex<Option<NativeHandle>>>,
}

impl SharedHandle {
  pub(crate) fn new(core: Arc<HandleCore>, native: NativeHandle) -> Self {
    Self {
      core,
      native: Arc::new(Mutex::new(Some(native))),
    }
  }

  pub(crate) fn core(&self) -> &Arc<HandleCore> {
    &self.core
  }

  pub(crate) fn take_close_ticket(&self) -> Option<CloseTicket> {
    self.core.take_ticket(|| self.native.lock().take())
  }

  /// Duplicates the listen descriptor so the listener can accept on it.
  pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
    match self.native.lock().as_ref() {
      Some(native) => native.try_clone_fd(),
      None => Err(io::Error::new(io::ErrorKind::NotConnected, "shared handle is closed")),
    }
  }

  fn with_native<T>(&self, f: impl FnOnce(&NativeHandle) -> Result<T, ClusterError>) -> Result<T, ClusterError> {
    match self.native.lock().as_ref() {
      Some(native) => f(native),
      None => Err(ClusterError::NotBound),
    }
  }
}

#[async_trait]
impl IServerHandle for SharedHandle {
  fn listen(&self, backlog: i32) -> Result<(), ClusterError> {
    self.with_native(|native| native.listen(backlog))
  }

  async fn close(&self) -> Result<(), ClusterError> {
    match self.take_close_ticket() {
      Some(ticket) => self.core.submit_close(ticket).await,
      None => Ok(()),
    }
  }

  fn getsockname(&self) -> Result<SockName, ClusterError> {
    self.with_native(NativeHandle::sockname)
  }

  fn ref_handle(&self) {}

  fn unref_handle(&self) {}
}
