// src/worker/process.rs

/// Ends the worker process. Abstracted so embedders and tests can observe the
/// exit instead of having the process vanish.
pub trait IProcessControl: Send + Sync + 'static {
  fn exit(&self, code: i32);
}

/// Exits the real process.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdProcessControl;

impl IProcessControl for StdProcessControl {
  fn exit(&self, code: i32) {
    tracing::info!(code, "Worker process exiting");
    std::process::exit(code)
  }
}
