// src/runtime/completion.rs

use crate::protocol::HandleKey;
use crate::runtime::WaitGroup;
use std::fmt;

/// Once-only token handed to a listener owner when the disconnect drain asks
/// it to close. Completing it releases one unit of the drain barrier.
///
/// Dropping the token without calling [`complete`](Self::complete) also counts
/// as completion, so an owner that loses the token cannot wedge shutdown.
pub struct CloseCompletion {
  key: HandleKey,
  barrier: Option<WaitGroup>,
}

impl CloseCompletion {
  pub(crate) fn new(key: HandleKey, barrier: WaitGroup) -> Self {
    Self {
      key,
      barrier: Some(barrier),
    }
  }

  /// Key of the handle this completion belongs to.
  pub fn key(&self) -> &HandleKey {
    &self.key
  }

  /// Signals that the owner finished closing.
  pub fn complete(mut self) {
    self.release();
  }

  fn release(&mut self) {
    if let Some(barrier) = self.barrier.take() {
      tracing::trace!(key = %self.key, "Handle close completed");
      barrier.done();
    }
  }
}

impl Drop for CloseCompletion {
  fn drop(&mut self) {
    if self.barrier.is_some() {
      tracing::debug!(key = %self.key, "CloseCompletion dropped without complete(); releasing barrier");
      self.release();
    }
  }
}

impl fmt::Debug for CloseCompletion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CloseCompletion")
      .field("key", &self.key)
      .field("pending", &self.barrier.is_some())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn complete_releases_exactly_once() {
    let wg = WaitGroup::with_bias(1);
    wg.add(1);
    let done = CloseCompletion::new(HandleKey::Int(1), wg.clone());
    done.complete();
    assert_eq!(wg.get_count(), 1);
  }

  #[test]
  fn drop_counts_as_completion() {
    let wg = WaitGroup::new();
    wg.add(1);
    {
      let _done = CloseCompletion::new(HandleKey::from("k"), wg.clone());
    }
    assert_eq!(wg.get_count(), 0);
  }
}
