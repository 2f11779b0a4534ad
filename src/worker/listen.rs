// src/worker/listen.rs

use crate::error::ClusterError;
use crate::handle::{ListenHandle, ListenerQueryKey};
use crate::protocol::{AddressType, ServerQuery};

use serde_json::Value;
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};

/// What a listener asks the primary for.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenOptions {
  pub address: Option<String>,
  pub port: Option<u16>,
  pub address_type: AddressType,
  /// An already-open descriptor the listener wants to share, if any.
  pub fd: Option<i32>,
  /// Ask for a socket of our own instead of round-robin distribution.
  pub exclusive: bool,
  /// Passed along to the primary. Round-robin handles do not enforce it.
  pub backlog: Option<i32>,
  /// Opaque application data echoed back in the primary's reply.
  pub data: Option<Value>,
}

impl ListenOptions {
  fn new(address: Option<String>, port: Option<u16>, address_type: AddressType) -> Self {
    Self {
      address,
      port,
      address_type,
      fd: None,
      exclusive: false,
      backlog: None,
      data: None,
    }
  }

  /// A TCP listener. The family is taken from `address`; an unparsable
  /// address (a host name) is treated as IPv4.
  pub fn tcp(address: impl Into<String>, port: u16) -> Self {
    let address = address.into();
    let address_type = match address.parse::<IpAddr>() {
      Ok(IpAddr::V6(_)) => AddressType::Tcp6,
      _ => AddressType::Tcp4,
    };
    Self::new(Some(address), Some(port), address_type)
  }

  pub fn tcp4(address: impl Into<String>, port: u16) -> Self {
    Self::new(Some(address.into()), Some(port), AddressType::Tcp4)
  }

  pub fn tcp6(address: impl Into<String>, port: u16) -> Self {
    Self::new(Some(address.into()), Some(port), AddressType::Tcp6)
  }

  /// A Unix domain socket. Relative paths are resolved against the current
  /// directory before the query is sent.
  pub fn unix(path: impl Into<String>) -> Self {
    Self::new(Some(path.into()), None, AddressType::Unix)
  }

  pub fn udp4(address: impl Into<String>, port: u16) -> Self {
    Self::new(Some(address.into()), Some(port), AddressType::Udp4)
  }

  pub fn udp6(address: impl Into<String>, port: u16) -> Self {
    Self::new(Some(address.into()), Some(port), AddressType::Udp6)
  }

  /// Listen on an inherited descriptor.
  pub fn from_fd(fd: i32, address_type: AddressType) -> Self {
    let mut options = Self::new(None, None, address_type);
    options.fd = Some(fd);
    options
  }

  pub fn with_backlog(mut self, backlog: i32) -> Self {
    self.backlog = Some(backlog);
    self
  }

  pub fn with_data(mut self, data: Value) -> Self {
    self.data = Some(data);
    self
  }

  pub fn with_exclusive(mut self, exclusive: bool) -> Self {
    self.exclusive = exclusive;
    self
  }

  /// Makes a filesystem socket path absolute. Abstract socket names (leading
  /// NUL) and non-path address types pass through.
  pub(crate) fn resolve(mut self) -> Result<Self, ClusterError> {
    if !self.address_type.is_path() {
      return Ok(self);
    }
    if let Some(address) = self.address.take() {
      if address.is_empty() || address.starts_with('\0') {
        self.address = Some(address);
      } else {
        let cwd = std::env::current_dir()?;
        self.address = Some(resolve_socket_path(&cwd, &address).to_string_lossy().into_owned());
      }
    }
    Ok(self)
  }

  pub(crate) fn query_key(&self) -> ListenerQueryKey {
    ListenerQueryKey::new(self.address.as_deref(), self.port, self.address_type, self.fd)
  }

  pub(crate) fn into_query(self, index: u64) -> ServerQuery {
    ServerQuery {
      index,
      address: self.address,
      port: self.port,
      address_type: self.address_type,
      fd: self.fd,
      exclusive: self.exclusive,
      backlog: self.backlog,
      data: self.data,
    }
  }
}

/// The result of a successful listener registration.
#[derive(Debug, Clone)]
pub struct Registration {
  pub handle: ListenHandle,
  /// Application data from the primary's reply.
  pub data: Option<Value>,
}

/// Joins `path` onto `base` and normalizes `.` and `..` lexically.
pub fn resolve_socket_path(base: &Path, path: &str) -> PathBuf {
  let joined = base.join(path);
  let mut resolved = PathBuf::new();
  for component in joined.components() {
    match component {
      Component::CurDir => {}
      Component::ParentDir => {
        resolved.pop();
      }
      other => resolved.push(other.as_os_str()),
    }
  }
  resolved
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn socket_paths_are_made_absolute() {
    let base = Path::new("/srv/app");
    assert_eq!(resolve_socket_path(base, "run/w.sock"), PathBuf::from("/srv/app/run/w.sock"));
    assert_eq!(resolve_socket_path(base, "./w.sock"), PathBuf::from("/srv/app/w.sock"));
    assert_eq!(resolve_socket_path(base, "../w.sock"), PathBuf::from("/srv/w.sock"));
    assert_eq!(resolve_socket_path(base, "/tmp/x/../w.sock"), PathBuf::from("/tmp/w.sock"));
  }

  #[test]
  fn abstract_and_network_addresses_pass_through() {
    let abstract_sock = ListenOptions::unix("\0hidden").resolve().unwrap();
    assert_eq!(abstract_sock.address.as_deref(), Some("\0hidden"));
    let tcp = ListenOptions::tcp("::1", 80).resolve().unwrap();
    assert_eq!(tcp.address_type, AddressType::Tcp6);
    assert_eq!(tcp.address.as_deref(), Some("::1"));
  }

  #[test]
  fn query_key_includes_every_endpoint_field() {
    let a = ListenOptions::tcp4("0.0.0.0", 8000).query_key();
    let b = ListenOptions::tcp4("0.0.0.0", 8001).query_key();
    let c = ListenOptions::udp4("0.0.0.0", 8000).query_key();
    assert_ne!(a, b);
    assert_ne!(a, c);
    assert_eq!(a, ListenOptions::tcp4("0.0.0.0", 8000).with_backlog(10).query_key());
  }
}
