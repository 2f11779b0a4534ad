// src/runtime/command.rs

use crate::error::ClusterError;
use crate::handle::{CloseTicket, IListenerOwner};
use crate::protocol::ServerQuery;
use crate::worker::listen::{ListenOptions, Registration};

use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Messages sent to the session core by public handles and helper tasks.
pub enum Command {
  // --- User Requests (WorkerHandle / ListenHandle -> SessionCore) ---
  RegisterListener {
    options: ListenOptions,
    owner: Option<Arc<dyn IListenerOwner>>,
    reply_tx: oneshot::Sender<Result<Registration, ClusterError>>,
  },
  /// The local listener is actively listening; `port` is the realized port if
  /// the OS picked one.
  ReportListening {
    query: ServerQuery,
    port: Option<u16>,
  },
  /// A handle gave up its key; finish the protocol side of the close.
  CloseHandle {
    ticket: CloseTicket,
    reply_tx: oneshot::Sender<Result<(), ClusterError>>,
  },
  Disconnect {
    reply_tx: oneshot::Sender<Result<(), ClusterError>>,
  },
  Destroy {
    reply_tx: oneshot::Sender<Result<(), ClusterError>>,
  },

  // --- Lifecycle ---
  /// Sent by the drain waiter once every handle close has completed.
  DrainComplete,
}

impl Command {
  pub fn variant_name(&self) -> &'static str {
    match self {
      Command::RegisterListener { .. } => "RegisterListener",
      Command::ReportListening { .. } => "ReportListening",
      Command::CloseHandle { .. } => "CloseHandle",
      Command::Disconnect { .. } => "Disconnect",
      Command::Destroy { .. } => "Destroy",
      Command::DrainComplete => "DrainComplete",
    }
  }
}

impl fmt::Debug for Command {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Command::RegisterListener { options, owner, .. } => f
        .debug_struct("RegisterListener")
        .field("options", options)
        .field("has_owner", &owner.is_some())
        .finish_non_exhaustive(),
      Command::ReportListening { query, port } => f
        .debug_struct("ReportListening")
        .field("index", &query.index)
        .field("port", port)
        .finish(),
      Command::CloseHandle { ticket, .. } => f
        .debug_struct("CloseHandle")
        .field("key", &ticket.key)
        .field("index", &ticket.index)
        .finish_non_exhaustive(),
      other => f.write_str(other.variant_name()),
    }
  }
}
