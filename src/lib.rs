//! rcluster - the worker side of a pre-fork cluster protocol on Tokio.
//!
//! A worker registers listeners with its primary and receives either a real
//! listen socket or a round-robin handle through which the primary forwards
//! accepted connections. The crate also runs the graceful disconnect
//! handshake that closes every handle before the worker leaves.

pub mod config;
pub mod error;
pub mod handle;
pub mod protocol;
pub mod runtime;
pub mod transport;
pub mod worker;

// Re-export core types for user convenience
pub use config::WorkerConfig;
pub use error::ClusterError;
pub use handle::{IListenerOwner, IServerHandle, IncomingConnection, ListenHandle};
pub use protocol::{AddressType, HandleKey, SockName};
pub use runtime::CloseCompletion;
pub use transport::{ChannelEnds, IPrimaryChannel};
pub use worker::{
  setup_worker, IProcessControl, ListenOptions, Registration, StdProcessControl, WorkerHandle, WorkerState,
};

// --- Top-Level Functions ---

const VERSION_MAJOR: i32 = 0;
const VERSION_MINOR: i32 = 1;
const VERSION_PATCH: i32 = 0;

/// Returns the library version as a tuple (major, minor, patch).
pub fn version() -> (i32, i32, i32) {
  (VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
}

pub fn version_major() -> i32 {
  VERSION_MAJOR
}

pub fn version_minor() -> i32 {
  VERSION_MINOR
}

pub fn version_patch() -> i32 {
  VERSION_PATCH
}

/// Starts a worker from its environment: the id from `RCLUSTER_UNIQUE_ID` and
/// the channel from the descriptor in `RCLUSTER_CHANNEL_FD`. Exits the real
/// process on forced shutdown.
#[cfg(feature = "ipc")]
pub fn setup_worker_from_env() -> Result<WorkerHandle, ClusterError> {
  let config = WorkerConfig::from_env();
  let ends = transport::ipc::IpcChannel::from_env()?;
  setup_worker(config, ends, std::sync::Arc::new(StdProcessControl))
}
