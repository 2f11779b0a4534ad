// src/runtime/waitgroup.rs

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// An asynchronous WaitGroup, similar to Go's `sync.WaitGroup`.
///
/// The disconnect drain uses it as its pending-operations barrier: the
/// coordinator adds one unit for the disconnect call itself, one per handle
/// being closed, and waits for the count to return to zero.
#[derive(Debug, Clone)]
pub struct WaitGroup {
  count: Arc<AtomicUsize>,
  notify_on_zero: Arc<Notify>,
}

impl WaitGroup {
  /// Creates a new WaitGroup with an initial count of zero.
  pub fn new() -> Self {
    Self {
      count: Arc::new(AtomicUsize::new(0)),
      notify_on_zero: Arc::new(Notify::new()),
    }
  }

  /// Creates a WaitGroup already holding `bias` units.
  pub fn with_bias(bias: usize) -> Self {
    let wg = Self::new();
    wg.add(bias);
    wg
  }

  /// Adds a delta to the WaitGroup counter.
  pub fn add(&self, delta: usize) {
    if delta == 0 {
      return;
    }
    let old_count = self.count.fetch_add(delta, Ordering::Relaxed);
    if old_count == 0 {
      tracing::trace!(delta, "WaitGroup count increased from zero");
    }
  }

  /// Decrements the WaitGroup counter by one.
  ///
  /// If the counter reaches zero, all tasks waiting on `wait()` are notified.
  ///
  /// Panics if the counter would drop below zero.
  pub fn done(&self) {
    let old_count = self.count.fetch_sub(1, Ordering::AcqRel);

    if old_count == 0 {
      self.count.fetch_add(1, Ordering::Relaxed);
      panic!("WaitGroup::done() called when count was already zero!");
    } else if old_count == 1 {
      self.notify_on_zero.notify_waiters();
      tracing::trace!("WaitGroup count reached zero, notifying waiters");
    }
  }

  /// Waits asynchronously until the WaitGroup counter becomes zero.
  ///
  /// If the counter is already zero when called, returns immediately.
  pub async fn wait(&self) {
    loop {
      // Register interest before reading the count so a `done()` landing in
      // between cannot be missed.
      let notified = self.notify_on_zero.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      if self.count.load(Ordering::Acquire) == 0 {
        tracing::trace!("WaitGroup::wait() released");
        return;
      }
      notified.await;
    }
  }

  /// Returns the current count. Primarily for debugging/testing.
  pub fn get_count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }
}

impl Default for WaitGroup {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;
  use tokio::time::timeout;

  #[tokio::test]
  async fn test_waitgroup_add_done_wait() {
    let wg = WaitGroup::new();
    wg.add(2);
    assert_eq!(wg.get_count(), 2);

    let wg_clone = wg.clone();
    let mut wait_task = tokio::spawn(async move {
      wg_clone.wait().await;
      "Wait Finished"
    });

    wg.done();
    assert!(
      timeout(Duration::from_millis(20), &mut wait_task).await.is_err(),
      "Wait task should not have finished yet"
    );

    wg.done();
    let wait_res = timeout(Duration::from_millis(200), wait_task).await;
    assert_eq!(wait_res.unwrap().unwrap(), "Wait Finished");
    assert_eq!(wg.get_count(), 0);
  }

  #[tokio::test]
  async fn test_waitgroup_wait_on_zero() {
    let wg = WaitGroup::new();
    timeout(Duration::from_millis(50), wg.wait())
      .await
      .expect("wait on an empty group returns immediately");
  }

  #[tokio::test]
  async fn test_waitgroup_bias_holds_until_released() {
    let wg = WaitGroup::with_bias(1);
    wg.add(2);
    wg.done();
    wg.done();
    assert!(timeout(Duration::from_millis(20), wg.wait()).await.is_err());
    wg.done();
    timeout(Duration::from_millis(200), wg.wait()).await.unwrap();
  }

  #[test]
  #[should_panic]
  fn test_waitgroup_done_panic_on_zero() {
    let wg = WaitGroup::new();
    wg.done();
  }
}
