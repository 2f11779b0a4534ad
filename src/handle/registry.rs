// src/handle/registry.rs

use crate::error::ClusterError;
use crate::protocol::HandleKey;
use std::collections::HashMap;

/// Maps primary-issued keys to worker-local handles. At most one handle per key.
#[derive(Debug)]
pub struct HandleRegistry<H> {
  handles: HashMap<HandleKey, H>,
}

impl<H> HandleRegistry<H> {
  pub fn new() -> Self {
    Self {
      handles: HashMap::new(),
    }
  }

  /// Registers `handle` under `key`. A second registration for a live key is a
  /// protocol violation and leaves the registry untouched.
  pub fn register(&mut self, key: HandleKey, handle: H) -> Result<(), ClusterError> {
    if self.handles.contains_key(&key) {
      tracing::error!(%key, "Refusing duplicate handle registration");
      return Err(ClusterError::DuplicateKey(key));
    }
    tracing::trace!(%key, "Handle registered");
    self.handles.insert(key, handle);
    Ok(())
  }

  /// Removes and returns the handle for `key`, if any.
  pub fn unregister(&mut self, key: &HandleKey) -> Option<H> {
    let removed = self.handles.remove(key);
    if removed.is_some() {
      tracing::trace!(%key, "Handle unregistered");
    }
    removed
  }

  pub fn get(&self, key: &HandleKey) -> Option<&H> {
    self.handles.get(key)
  }

  pub fn contains(&self, key: &HandleKey) -> bool {
    self.handles.contains_key(key)
  }

  /// Empties the registry, returning every entry.
  pub fn drain(&mut self) -> Vec<(HandleKey, H)> {
    self.handles.drain().collect()
  }

  pub fn len(&self) -> usize {
    self.handles.len()
  }

  pub fn is_empty(&self) -> bool {
    self.handles.is_empty()
  }
}

impl<H> Default for HandleRegistry<H> {
  fn default() -> Self {
    Self::new()
  }
}
