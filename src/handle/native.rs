// src/handle/native.rs

use crate::error::ClusterError;
use crate::protocol::SockName;
use socket2::{SockAddr, SockRef};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

/// A real OS listening descriptor handed over by the primary.
#[derive(Debug)]
pub struct NativeHandle {
  fd: OwnedFd,
}

impl NativeHandle {
  pub fn new(fd: OwnedFd) -> Self {
    Self { fd }
  }

  /// Puts the socket into listening state with the given backlog.
  pub fn listen(&self, backlog: i32) -> Result<(), ClusterError> {
    SockRef::from(&self.fd).listen(backlog).map_err(ClusterError::Io)
  }

  pub fn sockname(&self) -> Result<SockName, ClusterError> {
    let addr = SockRef::from(&self.fd).local_addr()?;
    sockname_from(&addr)
  }

  pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
    self.fd.try_clone()
  }

  /// Closes the descriptor.
  pub fn close(self) {
    tracing::trace!(fd = self.fd.as_raw_fd(), "Closing native handle");
    drop(self.fd);
  }
}

impl AsFd for NativeHandle {
  fn as_fd(&self) -> BorrowedFd<'_> {
    self.fd.as_fd()
  }
}

fn sockname_from(addr: &SockAddr) -> Result<SockName, ClusterError> {
  if let Some(socket_addr) = addr.as_socket() {
    let family = if socket_addr.is_ipv4() { "IPv4" } else { "IPv6" };
    return Ok(SockName {
      address: socket_addr.ip().to_string(),
      family: family.to_string(),
      port: Some(socket_addr.port()),
    });
  }
  if let Some(path) = addr.as_pathname() {
    return Ok(SockName {
      address: path.to_string_lossy().into_owned(),
      family: "unix".to_string(),
      port: None,
    });
  }
  Err(ClusterError::NotBound)
}
