// tests/common.rs
#![allow(dead_code)]

use rcluster::protocol::message::{ACT_ONLINE, ACT_QUERY_SERVER};
use rcluster::protocol::{Frame, ReplyPayload};
use rcluster::transport::inproc::{self, PrimaryEnd};
use rcluster::transport::Inbound;
use rcluster::{
  setup_worker, CloseCompletion, HandleKey, IListenerOwner, IProcessControl, IServerHandle, ListenHandle,
  ListenOptions, Registration, SockName, WorkerConfig, WorkerHandle,
};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use parking_lot::Mutex;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;

pub const TAG: &str = "RCLUSTER";
pub const SHORT_TIMEOUT: Duration = Duration::from_millis(100);
pub const LONG_TIMEOUT: Duration = Duration::from_secs(2);

static TRACING_INIT: Once = Once::new();

fn setup_tracing() {
  TRACING_INIT.call_once(|| {
    // Can be overridden by RUST_LOG
    let default_filter = "rcluster=trace,warn";
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let subscriber = FmtSubscriber::builder()
      .with_max_level(tracing::Level::TRACE)
      .with_env_filter(env_filter)
      .with_target(true)
      .with_line_number(true)
      .with_test_writer()
      .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set global tracing subscriber");
  });
}

/// Records exit requests instead of ending the test process.
#[derive(Debug, Default)]
pub struct RecordingProcess {
  exits: Mutex<Vec<i32>>,
  notify: Notify,
}

impl RecordingProcess {
  pub fn exits(&self) -> Vec<i32> {
    self.exits.lock().clone()
  }

  pub async fn wait_for_exit(&self) -> i32 {
    loop {
      let notified = self.notify.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      if let Some(code) = self.exits.lock().first().copied() {
        return code;
      }
      timeout(LONG_TIMEOUT, notified).await.expect("Timed out waiting for process exit");
    }
  }
}

impl IProcessControl for RecordingProcess {
  fn exit(&self, code: i32) {
    self.exits.lock().push(code);
    self.notify.notify_waiters();
  }
}

/// Scripted primary on the far end of an inproc pair.
pub struct TestPrimary {
  pub end: PrimaryEnd,
}

impl TestPrimary {
  pub async fn recv(&self) -> Inbound {
    timeout(LONG_TIMEOUT, self.end.recv())
      .await
      .expect("Timed out waiting for a worker frame")
      .expect("Worker channel closed")
  }

  pub async fn recv_frame(&self) -> Frame {
    self.recv().await.frame
  }

  /// Receives the next frame and asserts its `act`.
  pub async fn expect_act(&self, act: &str) -> Frame {
    let frame = self.recv_frame().await;
    assert_eq!(frame.act(), Some(act), "unexpected frame {:?}", frame);
    frame
  }

  /// Asserts nothing arrives within `SHORT_TIMEOUT`.
  pub async fn expect_silence(&self) {
    if let Ok(Some(inbound)) = timeout(SHORT_TIMEOUT, self.end.recv()).await {
      panic!("Expected no frame, got {:?}", inbound.frame);
    }
  }

  /// Waits for the worker to drop the channel, returning any frames sent first.
  pub async fn drain_until_closed(&self) -> Vec<Frame> {
    let mut frames = Vec::new();
    loop {
      match timeout(LONG_TIMEOUT, self.end.recv()).await {
        Ok(Some(inbound)) => frames.push(inbound.frame),
        Ok(None) => return frames,
        Err(_) => panic!("Worker never closed the channel; got {:?}", frames),
      }
    }
  }

  pub async fn answer(&self, query: &Frame, payload: ReplyPayload, handle: Option<OwnedFd>) {
    self.end.reply(query.seq, payload, handle).await.expect("reply to worker");
  }

  pub async fn answer_key(&self, query: &Frame, key: impl Into<HandleKey>) {
    self.answer(query, keyed(key), None).await;
  }
}

pub fn keyed(key: impl Into<HandleKey>) -> ReplyPayload {
  ReplyPayload {
    key: Some(key.into()),
    ..Default::default()
  }
}

pub fn sockname(address: &str, port: u16) -> SockName {
  SockName {
    address: address.to_string(),
    family: "IPv4".to_string(),
    port: Some(port),
  }
}

pub struct TestWorker {
  pub worker: WorkerHandle,
  pub primary: TestPrimary,
  pub process: Arc<RecordingProcess>,
}

/// Starts a worker over an inproc pair and consumes its `online` frame.
pub async fn start_worker() -> TestWorker {
  start_worker_with(WorkerConfig::default().with_worker_id(1)).await
}

pub async fn start_worker_with(config: WorkerConfig) -> TestWorker {
  setup_tracing();
  let (ends, end) = inproc::pair(&config.protocol_tag);
  let process = Arc::new(RecordingProcess::default());
  let worker = setup_worker(config, ends, process.clone()).expect("worker setup");
  let primary = TestPrimary { end };
  primary.expect_act(ACT_ONLINE).await;
  TestWorker {
    worker,
    primary,
    process,
  }
}

impl TestWorker {
  /// Registers a listener and lets the primary answer with `payload`.
  pub async fn register_with(
    &self,
    options: ListenOptions,
    owner: Option<Arc<dyn IListenerOwner>>,
    payload: ReplyPayload,
    handle: Option<OwnedFd>,
  ) -> (Frame, Result<Registration, rcluster::ClusterError>) {
    let worker = self.worker.clone();
    let pending = tokio::spawn(async move { worker.register_listener(options, owner).await });
    let query = self.primary.expect_act(ACT_QUERY_SERVER).await;
    self.primary.answer(&query, payload, handle).await;
    let result = timeout(LONG_TIMEOUT, pending)
      .await
      .expect("Timed out waiting for registration")
      .expect("registration task panicked");
    (query, result)
  }

  /// Registers a round-robin listener under `key`.
  pub async fn register_rr(&self, options: ListenOptions, key: impl Into<HandleKey>) -> ListenHandle {
    let (_, result) = self.register_with(options, None, keyed(key), None).await;
    result.expect("registration").handle
  }
}

/// An owner that keeps its completions so the test decides when each close
/// finishes.
#[derive(Default)]
pub struct StashingOwner {
  pub stashed: Mutex<Vec<(ListenHandle, CloseCompletion)>>,
}

impl StashingOwner {
  pub fn take(&self) -> Vec<(ListenHandle, CloseCompletion)> {
    std::mem::take(&mut *self.stashed.lock())
  }

  pub fn len(&self) -> usize {
    self.stashed.lock().len()
  }
}

impl IListenerOwner for StashingOwner {
  fn close(&self, handle: ListenHandle, done: CloseCompletion) {
    self.stashed.lock().push((handle, done));
  }
}

/// An owner that closes its handle and completes right away.
#[derive(Default)]
pub struct ClosingOwner {
  pub full: AtomicBool,
}

impl ClosingOwner {
  pub fn set_full(&self, full: bool) {
    self.full.store(full, Ordering::SeqCst);
  }
}

impl IListenerOwner for ClosingOwner {
  fn close(&self, handle: ListenHandle, done: CloseCompletion) {
    tokio::spawn(async move {
      handle.close().await.expect("owner close");
      done.complete();
    });
  }

  fn max_connections_reached(&self) -> bool {
    self.full.load(Ordering::SeqCst)
  }
}

/// A connected TCP pair; returns the server side as a descriptor to forward.
pub fn connection_fd() -> (OwnedFd, std::net::TcpStream) {
  let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
  let client = std::net::TcpStream::connect(listener.local_addr().expect("addr")).expect("connect");
  let (server, _) = listener.accept().expect("accept");
  (OwnedFd::from(server), client)
}
