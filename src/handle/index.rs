// src/handle/index.rs

use crate::protocol::AddressType;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Identifies one logical endpoint: `address:port:addressType:fd`.
///
/// Repeated listen attempts on the same endpoint share a key and get
/// distinct indices from [`ListenerIndexAllocator`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerQueryKey(String);

impl ListenerQueryKey {
  pub fn new(address: Option<&str>, port: Option<u16>, address_type: AddressType, fd: Option<i32>) -> Self {
    let port = port.map(|p| p.to_string()).unwrap_or_default();
    let fd = fd.map(|f| f.to_string()).unwrap_or_default();
    Self(format!(
      "{}:{}:{}:{}",
      address.unwrap_or(""),
      port,
      address_type.as_str(),
      fd
    ))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for ListenerQueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, Default)]
struct IndexSet {
  next_index: u64,
  live: HashSet<u64>,
}

/// Per-endpoint monotonic index generator.
#[derive(Debug, Default)]
pub struct ListenerIndexAllocator {
  sets: HashMap<ListenerQueryKey, IndexSet>,
}

impl ListenerIndexAllocator {
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns the next index for `key` and records it as live.
  pub fn allocate(&mut self, key: &ListenerQueryKey) -> u64 {
    let set = self.sets.entry(key.clone()).or_default();
    let index = set.next_index;
    set.next_index += 1;
    set.live.insert(index);
    tracing::trace!(query_key = %key, index, "Allocated listener index");
    index
  }

  /// Marks `index` released. The endpoint's bookkeeping is dropped once no
  /// index is live. Returns false if the index was not live.
  pub fn release(&mut self, key: &ListenerQueryKey, index: u64) -> bool {
    let Some(set) = self.sets.get_mut(key) else {
      return false;
    };
    let removed = set.live.remove(&index);
    if set.live.is_empty() {
      self.sets.remove(key);
      tracing::trace!(query_key = %key, "Released last listener index, dropping endpoint bookkeeping");
    }
    removed
  }

  pub fn is_live(&self, key: &ListenerQueryKey, index: u64) -> bool {
    self.sets.get(key).map_or(false, |set| set.live.contains(&index))
  }

  pub fn live_count(&self, key: &ListenerQueryKey) -> usize {
    self.sets.get(key).map_or(0, |set| set.live.len())
  }

  /// Number of endpoints with at least one live index.
  pub fn tracked_endpoints(&self) -> usize {
    self.sets.len()
  }
}
