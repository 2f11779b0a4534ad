// src/worker/disconnect.rs

//! Graceful shutdown sequencing.
//!
//! A drain closes every registered handle, counting outstanding closes on a
//! [`WaitGroup`] whose initial bias of one stands for the disconnect call
//! itself. The final step runs once the count reaches zero.

use crate::handle::CloseTicket;
use crate::protocol::HandleKey;
use crate::runtime::{CloseCompletion, WaitGroup};
use crate::worker::router::HandleEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectPhase {
  Connected,
  Disconnecting,
  Disconnected,
}

/// What to do once every handle has closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalStep {
  /// The primary started the shutdown; just drop the channel.
  DisconnectTransport,
  /// Tell the primary we are leaving on purpose, then drop the channel once it
  /// acknowledges.
  AnnounceExit,
}

#[derive(Debug)]
pub struct DisconnectCoordinator {
  phase: DisconnectPhase,
  primary_initiated: bool,
}

impl DisconnectCoordinator {
  pub fn new() -> Self {
    Self {
      phase: DisconnectPhase::Connected,
      primary_initiated: false,
    }
  }

  pub fn phase(&self) -> DisconnectPhase {
    self.phase
  }

  pub fn is_draining(&self) -> bool {
    self.phase == DisconnectPhase::Disconnecting
  }

  /// Starts a drain and returns its barrier, or `None` if a drain already ran.
  pub fn begin(&mut self, primary_initiated: bool) -> Option<WaitGroup> {
    if self.phase != DisconnectPhase::Connected {
      tracing::debug!(phase = ?self.phase, "Disconnect already in progress, ignoring");
      return None;
    }
    self.phase = DisconnectPhase::Disconnecting;
    self.primary_initiated = primary_initiated;
    Some(WaitGroup::with_bias(1))
  }

  /// Asks each drained entry to close, adding one to `barrier` per close
  /// started. Entries with an owner are closed by the owner. Entries without
  /// one are returned as tickets for the session core to finish, each paired
  /// with the completion to signal afterwards.
  pub(crate) fn drain(
    &self,
    entries: Vec<(HandleKey, HandleEntry)>,
    barrier: &WaitGroup,
  ) -> Vec<(CloseTicket, CloseCompletion)> {
    let mut raw_closes = Vec::new();
    for (key, entry) in entries {
      // Ends the accept queue once already queued connections are taken.
      entry.conn_tx.close();
      match entry.owner {
        Some(owner) => {
          barrier.add(1);
          tracing::debug!(%key, "Asking listener owner to close");
          owner.close(entry.handle, CloseCompletion::new(key, barrier.clone()));
        }
        None => match entry.handle.take_close_ticket() {
          Some(ticket) => {
            barrier.add(1);
            raw_closes.push((ticket, CloseCompletion::new(key, barrier.clone())));
          }
          None => {
            // The handle closed itself; its CloseHandle command is still queued.
            tracing::trace!(%key, "Handle already closing, nothing to drain");
          }
        },
      }
    }
    raw_closes
  }

  /// Marks the drain finished and picks the last step.
  pub fn finish(&mut self) -> FinalStep {
    self.phase = DisconnectPhase::Disconnected;
    if self.primary_initiated {
      FinalStep::DisconnectTransport
    } else {
      FinalStep::AnnounceExit
    }
  }
}

impl Default for DisconnectCoordinator {
  fn default() -> Self {
    Self::new()
  }
}
