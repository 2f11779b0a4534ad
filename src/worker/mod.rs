// src/worker/mod.rs

//! The worker process side of the cluster protocol.

pub mod disconnect;
pub mod listen;
pub mod process;
pub mod router;
pub mod session;

pub use disconnect::{DisconnectCoordinator, DisconnectPhase, FinalStep};
pub use listen::{ListenOptions, Registration};
pub use process::{IProcessControl, StdProcessControl};
pub use session::{setup_worker, WorkerHandle};

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Online,
  Listening,
  Disconnecting,
  Destroying,
}

impl WorkerState {
  /// No new registrations are accepted once a worker is shutting down.
  pub fn is_shutting_down(&self) -> bool {
    matches!(self, WorkerState::Disconnecting | WorkerState::Destroying)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      WorkerState::Online => "online",
      WorkerState::Listening => "listening",
      WorkerState::Disconnecting => "disconnecting",
      WorkerState::Destroying => "destroying",
    }
  }
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Identity of this worker process, shared by the [`WorkerHandle`] and the
/// session core.
#[derive(Debug)]
pub struct Worker {
  id: u32,
  state: Mutex<WorkerState>,
  exited_after_disconnect: AtomicBool,
}

impl Worker {
  pub fn new(id: u32) -> Self {
    Self {
      id,
      state: Mutex::new(WorkerState::Online),
      exited_after_disconnect: AtomicBool::new(false),
    }
  }

  pub fn id(&self) -> u32 {
    self.id
  }

  pub fn state(&self) -> WorkerState {
    *self.state.lock()
  }

  /// `true` once an orderly shutdown has been started, so a later transport
  /// drop is expected rather than fatal.
  pub fn exited_after_disconnect(&self) -> bool {
    self.exited_after_disconnect.load(Ordering::Acquire)
  }

  pub(crate) fn set_exited_after_disconnect(&self) {
    self.exited_after_disconnect.store(true, Ordering::Release);
  }

  /// Moves to `listening` unless the worker is shutting down.
  pub(crate) fn mark_listening(&self) -> bool {
    let mut state = self.state.lock();
    if state.is_shutting_down() {
      return false;
    }
    *state = WorkerState::Listening;
    true
  }

  /// Moves to `disconnecting`. Returns `false`, changing nothing, when the
  /// worker is already disconnecting or destroying.
  pub(crate) fn begin_disconnect(&self) -> bool {
    let mut state = self.state.lock();
    if state.is_shutting_down() {
      return false;
    }
    *state = WorkerState::Disconnecting;
    self.set_exited_after_disconnect();
    true
  }

  pub(crate) fn begin_destroy(&self) {
    *self.state.lock() = WorkerState::Destroying;
    self.set_exited_after_disconnect();
  }
}
