// src/worker/session.rs

//! The session core: one actor task per worker process that owns the handle
//! registry, the index allocator, the pending-reply table and the disconnect
//! coordinator. Everything else talks to it through its mailbox.

use crate::config::WorkerConfig;
use crate::error::ClusterError;
use crate::handle::{
  CloseTicket, HandleCore, HandleRegistry, IListenerOwner, IncomingConnection, ListenHandle, ListenerIndexAllocator,
  ListenerQueryKey, NativeHandle, RoundRobinHandle, SharedHandle,
};
use crate::protocol::{HandleKey, PrimaryMessage, ReplyPayload, ServerQuery, WorkerMessage};
use crate::runtime::{mailbox, Command, MailboxReceiver, MailboxSender};
use crate::transport::{ChannelEnds, IPrimaryChannel, Inbound, InboundReceiver};
use crate::worker::disconnect::{DisconnectCoordinator, FinalStep};
use crate::worker::listen::{ListenOptions, Registration};
use crate::worker::process::IProcessControl;
use crate::worker::router::{self, HandleEntry};
use crate::worker::{Worker, WorkerState};

use std::collections::HashMap;
use std::fmt;
use std::ops::ControlFlow;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};

/// An outbound frame waiting for the primary's `ack`.
enum PendingReply {
  Query {
    query: ServerQuery,
    query_key: ListenerQueryKey,
    owner: Option<Arc<dyn IListenerOwner>>,
    reply_tx: oneshot::Sender<Result<Registration, ClusterError>>,
  },
  /// `exitedAfterDisconnect` was sent; drop the channel once it is acknowledged.
  DisconnectOnAck,
}

impl fmt::Debug for PendingReply {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PendingReply::Query { query, query_key, .. } => f
        .debug_struct("Query")
        .field("index", &query.index)
        .field("query_key", query_key)
        .finish_non_exhaustive(),
      PendingReply::DisconnectOnAck => f.write_str("DisconnectOnAck"),
    }
  }
}

struct SessionCore {
  worker: Arc<Worker>,
  config: WorkerConfig,
  channel: Arc<dyn IPrimaryChannel>,
  process: Arc<dyn IProcessControl>,
  mailbox_tx: MailboxSender,
  mailbox_rx: MailboxReceiver,
  inbound: InboundReceiver,
  inbound_open: bool,
  registry: HandleRegistry<HandleEntry>,
  indexes: ListenerIndexAllocator,
  pending: HashMap<u64, PendingReply>,
  next_seq: u64,
  coordinator: DisconnectCoordinator,
}

impl SessionCore {
  async fn run(mut self, stopped_tx: watch::Sender<bool>) {
    let worker_id = self.worker.id();
    tracing::info!(worker_id, "Worker session core started");

    if let Err(e) = self.send(WorkerMessage::Online, None).await {
      tracing::warn!(worker_id, error = %e, "Failed to announce worker online");
    }

    loop {
      let flow = tokio::select! {
        biased;
        cmd = self.mailbox_rx.recv() => match cmd {
          Ok(command) => self.handle_command(command).await,
          Err(_) => {
            tracing::debug!(worker_id, "Mailbox closed");
            ControlFlow::Break(())
          }
        },
        inbound = self.inbound.recv(), if self.inbound_open => match inbound {
          Ok(inbound) => self.handle_inbound(inbound).await,
          Err(_) => self.on_transport_disconnect(),
        },
      };
      if flow.is_break() {
        break;
      }
    }

    self.mailbox_rx.close();
    // Queued requests are dropped so their callers see ConnectionClosed.
    while let Ok(command) = self.mailbox_rx.try_recv() {
      tracing::debug!(worker_id, cmd = command.variant_name(), "Dropping command after stop");
    }
    self.fail_pending();
    tracing::info!(worker_id, "Worker session core stopped");
    let _ = stopped_tx.send(true);
  }

  fn next_seq(&mut self) -> u64 {
    let seq = self.next_seq;
    self.next_seq += 1;
    seq
  }

  /// Stamps and sends one message, returning its `seq`.
  async fn send(&mut self, msg: WorkerMessage, handle: Option<OwnedFd>) -> Result<u64, ClusterError> {
    let seq = self.next_seq();
    tracing::debug!(worker_id = self.worker.id(), seq, msg = msg.variant_name(), "Sending to primary");
    let frame = msg.into_frame(&self.config.protocol_tag, seq);
    self.channel.send(frame, handle).await?;
    Ok(seq)
  }

  // --- Commands ---

  async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
    tracing::trace!(worker_id = self.worker.id(), cmd = command.variant_name(), "Handling command");
    match command {
      Command::RegisterListener {
        options,
        owner,
        reply_tx,
      } => {
        if let Err(e) = self.register_listener(options, owner, reply_tx).await {
          tracing::debug!(worker_id = self.worker.id(), error = %e, "Listener registration not sent");
        }
      }
      Command::ReportListening { query, port } => self.report_listening(query, port).await,
      Command::CloseHandle { ticket, reply_tx } => {
        self.finish_close(ticket).await;
        let _ = reply_tx.send(Ok(()));
      }
      Command::Disconnect { reply_tx } => {
        self.begin_disconnect(false).await;
        let _ = reply_tx.send(Ok(()));
      }
      Command::Destroy { reply_tx } => {
        let flow = self.destroy().await;
        let _ = reply_tx.send(Ok(()));
        return flow;
      }
      Command::DrainComplete => return self.on_drain_complete().await,
    }
    ControlFlow::Continue(())
  }

  /// Sends the query and parks the caller's reply until the primary answers.
  /// Errors are delivered through `reply_tx`; the returned error is for logging.
  async fn register_listener(
    &mut self,
    options: ListenOptions,
    owner: Option<Arc<dyn IListenerOwner>>,
    reply_tx: oneshot::Sender<Result<Registration, ClusterError>>,
  ) -> Result<(), ClusterError> {
    let state = self.worker.state();
    if state.is_shutting_down() {
      let _ = reply_tx.send(Err(ClusterError::InvalidState("worker is shutting down")));
      return Err(ClusterError::InvalidState("worker is shutting down"));
    }
    let options = match options.resolve() {
      Ok(options) => options,
      Err(e) => {
        let _ = reply_tx.send(Err(ClusterError::InvalidArgument(format!("cannot resolve socket path: {}", e))));
        return Err(e);
      }
    };

    let query_key = options.query_key();
    let index = self.indexes.allocate(&query_key);
    let query = options.into_query(index);
    tracing::debug!(worker_id = self.worker.id(), %query_key, index, "Querying primary for listener");

    match self.send(WorkerMessage::QueryServer(query.clone()), None).await {
      Ok(seq) => {
        self.pending.insert(
          seq,
          PendingReply::Query {
            query,
            query_key,
            owner,
            reply_tx,
          },
        );
        Ok(())
      }
      Err(e) => {
        self.indexes.release(&query_key, index);
        let _ = reply_tx.send(Err(ClusterError::ConnectionClosed));
        Err(e)
      }
    }
  }

  async fn report_listening(&mut self, query: ServerQuery, port: Option<u16>) {
    if !self.worker.mark_listening() {
      tracing::debug!(worker_id = self.worker.id(), index = query.index, "Listening reported during shutdown, ignoring");
      return;
    }
    let port = port.or(query.port);
    let msg = WorkerMessage::Listening(ServerQuery { port, ..query });
    if let Err(e) = self.send(msg, None).await {
      tracing::warn!(worker_id = self.worker.id(), error = %e, "Failed to report listening");
    }
  }

  /// Protocol side of a handle close: notify the primary, deregister, release
  /// the index, then release the OS handle if there is one.
  async fn finish_close(&mut self, ticket: CloseTicket) {
    let CloseTicket {
      key,
      query_key,
      index,
      native,
    } = ticket;
    tracing::debug!(worker_id = self.worker.id(), %key, index, "Closing handle");
    if let Err(e) = self.send(WorkerMessage::Close { key: key.clone() }, None).await {
      tracing::debug!(worker_id = self.worker.id(), %key, error = %e, "Close notification not delivered");
    }
    if let Some(entry) = self.registry.unregister(&key) {
      entry.conn_tx.close();
    }
    self.indexes.release(&query_key, index);
    if let Some(native) = native {
      native.close();
    }
  }

  // --- Inbound ---

  async fn handle_inbound(&mut self, inbound: Inbound) -> ControlFlow<()> {
    let Inbound { frame, handle } = inbound;
    if frame.cmd != self.config.protocol_tag {
      tracing::trace!(worker_id = self.worker.id(), cmd = %frame.cmd, "Ignoring non-cluster message");
      return ControlFlow::Continue(());
    }

    if let Some(ack) = frame.ack {
      if let Some(pending) = self.pending.remove(&ack) {
        let payload = match PrimaryMessage::reply_from_frame(&frame) {
          Some(PrimaryMessage::Reply { payload, .. }) => payload,
          _ => ReplyPayload::default(),
        };
        self.resolve_pending(pending, payload, handle).await;
        return ControlFlow::Continue(());
      }
    }

    match PrimaryMessage::from_act(&frame) {
      Ok(PrimaryMessage::NewConnection { key, seq }) => self.on_new_connection(key, seq, handle).await,
      Ok(PrimaryMessage::Disconnect) => {
        tracing::info!(worker_id = self.worker.id(), "Primary requested disconnect");
        self.begin_disconnect(true).await;
      }
      Ok(other) => {
        tracing::debug!(worker_id = self.worker.id(), msg = ?other, "Ignoring unhandled primary message");
      }
      Err(e) => {
        tracing::warn!(worker_id = self.worker.id(), seq = frame.seq, error = %e, "Malformed primary message");
        if frame.act() == Some(crate::protocol::message::ACT_NEWCONN) {
          self.ack_connection(frame.seq, false).await;
        }
      }
    }
    ControlFlow::Continue(())
  }

  async fn resolve_pending(&mut self, pending: PendingReply, payload: ReplyPayload, handle: Option<OwnedFd>) {
    match pending {
      PendingReply::Query {
        query,
        query_key,
        owner,
        reply_tx,
      } => {
        let result = self.install_handle(query, query_key, owner, payload, handle).await;
        match reply_tx.send(result) {
          Ok(()) => {}
          Err(Ok(orphaned)) => {
            tracing::debug!(worker_id = self.worker.id(), "Registration caller went away, closing its handle");
            if let Some(ticket) = orphaned.handle.take_close_ticket() {
              self.finish_close(ticket).await;
            }
          }
          Err(Err(e)) => {
            tracing::debug!(worker_id = self.worker.id(), error = %e, "Registration caller went away");
          }
        }
      }
      PendingReply::DisconnectOnAck => {
        tracing::debug!(worker_id = self.worker.id(), "Primary acknowledged exit, disconnecting");
        self.channel.disconnect();
      }
    }
  }

  /// Turns a query reply into a registered handle.
  async fn install_handle(
    &mut self,
    query: ServerQuery,
    query_key: ListenerQueryKey,
    owner: Option<Arc<dyn IListenerOwner>>,
    payload: ReplyPayload,
    handle: Option<OwnedFd>,
  ) -> Result<Registration, ClusterError> {
    let index = query.index;
    if payload.errno != 0 {
      self.indexes.release(&query_key, index);
      tracing::debug!(worker_id = self.worker.id(), index, errno = payload.errno, "Primary refused listener");
      return Err(ClusterError::QueryFailed { errno: payload.errno });
    }
    let Some(key) = payload.key else {
      self.indexes.release(&query_key, index);
      return Err(ClusterError::ProtocolViolation("query reply without key".into()));
    };

    if self.worker.state().is_shutting_down() {
      tracing::debug!(worker_id = self.worker.id(), %key, "Reply arrived during shutdown, closing at once");
      let native = handle.map(NativeHandle::new);
      self
        .finish_close(CloseTicket {
          key,
          query_key,
          index,
          native,
        })
        .await;
      return Err(ClusterError::InvalidState("worker is shutting down"));
    }

    if self.registry.contains(&key) {
      self.indexes.release(&query_key, index);
      tracing::error!(worker_id = self.worker.id(), %key, "Primary issued a key that is already registered");
      return Err(ClusterError::DuplicateKey(key));
    }

    let (conn_tx, conn_rx) = async_channel::bounded::<IncomingConnection>(self.config.accept_queue_capacity);
    let core = Arc::new(HandleCore::new(
      key.clone(),
      query_key,
      query,
      self.mailbox_tx.clone(),
      conn_rx,
    ));
    let listen_handle = match handle {
      Some(fd) => ListenHandle::Shared(SharedHandle::new(core, NativeHandle::new(fd))),
      None => ListenHandle::RoundRobin(RoundRobinHandle::new(core, payload.sockname)),
    };
    tracing::debug!(
      worker_id = self.worker.id(),
      %key,
      index,
      round_robin = listen_handle.is_round_robin(),
      "Listener handle registered"
    );
    self.registry.register(
      key,
      HandleEntry {
        handle: listen_handle.clone(),
        owner,
        conn_tx,
      },
    )?;
    Ok(Registration {
      handle: listen_handle,
      data: payload.data,
    })
  }

  async fn on_new_connection(&mut self, key: HandleKey, seq: u64, handle: Option<OwnedFd>) {
    let routing = router::route(&self.registry, &key, handle);
    // The primary's accounting waits on this ack, so it goes out before delivery.
    self.ack_connection(seq, routing.accepted()).await;
    routing.deliver();
  }

  async fn ack_connection(&mut self, ack: u64, accepted: bool) {
    if let Err(e) = self.send(WorkerMessage::ConnectionAck { ack, accepted }, None).await {
      tracing::warn!(worker_id = self.worker.id(), ack, error = %e, "Failed to acknowledge connection");
    }
  }

  // --- Shutdown ---

  async fn begin_disconnect(&mut self, primary_initiated: bool) {
    let worker_id = self.worker.id();
    if !self.worker.begin_disconnect() {
      tracing::debug!(worker_id, state = %self.worker.state(), "Disconnect ignored, already shutting down");
      return;
    }
    let Some(barrier) = self.coordinator.begin(primary_initiated) else {
      return;
    };
    let entries = self.registry.drain();
    tracing::info!(worker_id, primary_initiated, handles = entries.len(), "Draining handles for disconnect");

    let raw_closes = self.coordinator.drain(entries, &barrier);
    for (ticket, done) in raw_closes {
      self.finish_close(ticket).await;
      done.complete();
    }
    // Releases the bias held for the disconnect call itself.
    barrier.done();

    let mailbox = self.mailbox_tx.clone();
    tokio::spawn(async move {
      barrier.wait().await;
      if mailbox.send(Command::DrainComplete).await.is_err() {
        tracing::debug!(worker_id, "Session core gone before drain completed");
      }
    });
  }

  async fn on_drain_complete(&mut self) -> ControlFlow<()> {
    let step = self.coordinator.finish();
    let worker_id = self.worker.id();
    tracing::info!(worker_id, ?step, "All handles closed");
    if !self.inbound_open {
      return ControlFlow::Break(());
    }
    match step {
      FinalStep::DisconnectTransport => self.channel.disconnect(),
      FinalStep::AnnounceExit => match self.send(WorkerMessage::ExitedAfterDisconnect, None).await {
        Ok(seq) => {
          self.pending.insert(seq, PendingReply::DisconnectOnAck);
        }
        Err(e) => {
          tracing::warn!(worker_id, error = %e, "Could not announce exit, disconnecting");
          self.channel.disconnect();
        }
      },
    }
    ControlFlow::Continue(())
  }

  async fn destroy(&mut self) -> ControlFlow<()> {
    let worker_id = self.worker.id();
    if self.worker.state() == WorkerState::Destroying {
      tracing::debug!(worker_id, "Destroy ignored, already destroying");
      return ControlFlow::Continue(());
    }
    if !self.channel.is_connected() {
      self.worker.set_exited_after_disconnect();
      tracing::info!(worker_id, "Destroy with channel already down, exiting");
      self.process.exit(self.config.exit_code);
      return ControlFlow::Break(());
    }
    self.worker.begin_destroy();
    tracing::info!(worker_id, "Destroying worker");
    match self.send(WorkerMessage::ExitedAfterDisconnect, None).await {
      Ok(seq) => {
        self.pending.insert(seq, PendingReply::DisconnectOnAck);
        ControlFlow::Continue(())
      }
      Err(e) => {
        tracing::warn!(worker_id, error = %e, "Could not announce exit, exiting");
        self.process.exit(self.config.exit_code);
        ControlFlow::Break(())
      }
    }
  }

  fn on_transport_disconnect(&mut self) -> ControlFlow<()> {
    let worker_id = self.worker.id();
    self.inbound_open = false;
    self.fail_pending();

    let state = self.worker.state();
    if state == WorkerState::Destroying {
      tracing::info!(worker_id, "Channel closed while destroying, exiting");
      self.process.exit(self.config.exit_code);
      return ControlFlow::Break(());
    }
    if !self.worker.exited_after_disconnect() {
      tracing::error!(worker_id, %state, "Channel to primary lost unexpectedly, exiting");
      self.process.exit(self.config.exit_code);
      return ControlFlow::Break(());
    }
    if self.coordinator.is_draining() {
      tracing::debug!(worker_id, "Channel closed mid-drain, waiting for handles");
      return ControlFlow::Continue(());
    }
    tracing::info!(worker_id, "Channel to primary closed after disconnect");
    ControlFlow::Break(())
  }

  /// Replies that can no longer arrive resolve as `ConnectionClosed`.
  fn fail_pending(&mut self) {
    for (seq, pending) in self.pending.drain() {
      if let PendingReply::Query { query, query_key, reply_tx, .. } = pending {
        tracing::debug!(seq, index = query.index, "Failing pending query, channel closed");
        self.indexes.release(&query_key, query.index);
        let _ = reply_tx.send(Err(ClusterError::ConnectionClosed));
      }
    }
  }
}

/// Public handle to a running worker session. Cheap to clone.
#[derive(Clone)]
pub struct WorkerHandle {
  worker: Arc<Worker>,
  mailbox: MailboxSender,
  channel: Arc<dyn IPrimaryChannel>,
  process: Arc<dyn IProcessControl>,
  exit_code: i32,
  stopped_rx: watch::Receiver<bool>,
}

impl fmt::Debug for WorkerHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkerHandle")
      .field("worker", &self.worker)
      .field("connected", &self.channel.is_connected())
      .finish_non_exhaustive()
  }
}

/// Starts the session core for this worker process and announces it to the
/// primary. Must be called inside a tokio runtime.
pub fn setup_worker(
  config: WorkerConfig,
  ends: ChannelEnds,
  process: Arc<dyn IProcessControl>,
) -> Result<WorkerHandle, ClusterError> {
  config.validate()?;
  let worker = Arc::new(Worker::new(config.worker_id));
  let (mailbox_tx, mailbox_rx) = mailbox(config.mailbox_capacity);
  let (stopped_tx, stopped_rx) = watch::channel(false);
  let ChannelEnds { channel, inbound } = ends;

  let handle = WorkerHandle {
    worker: worker.clone(),
    mailbox: mailbox_tx.clone(),
    channel: channel.clone(),
    process: process.clone(),
    exit_code: config.exit_code,
    stopped_rx,
  };
  let core = SessionCore {
    worker,
    config,
    channel,
    process,
    mailbox_tx,
    mailbox_rx,
    inbound,
    inbound_open: true,
    registry: HandleRegistry::new(),
    indexes: ListenerIndexAllocator::new(),
    pending: HashMap::new(),
    next_seq: 1,
    coordinator: DisconnectCoordinator::new(),
  };
  tokio::spawn(core.run(stopped_tx));
  Ok(handle)
}

impl WorkerHandle {
  pub fn id(&self) -> u32 {
    self.worker.id()
  }

  pub fn state(&self) -> WorkerState {
    self.worker.state()
  }

  pub fn is_connected(&self) -> bool {
    self.channel.is_connected()
  }

  pub fn exited_after_disconnect(&self) -> bool {
    self.worker.exited_after_disconnect()
  }

  /// Asks the primary for a listening handle matching `options`. `owner` is
  /// the listener object that will own the handle; the disconnect drain asks
  /// it to close and the router checks its connection limit.
  pub async fn register_listener(
    &self,
    options: ListenOptions,
    owner: Option<Arc<dyn IListenerOwner>>,
  ) -> Result<Registration, ClusterError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    self
      .mailbox
      .send(Command::RegisterListener {
        options,
        owner,
        reply_tx,
      })
      .await
      .map_err(|_| ClusterError::ConnectionClosed)?;
    reply_rx.await.map_err(|_| ClusterError::ConnectionClosed)?
  }

  /// Starts a graceful disconnect: every handle is closed, then the primary is
  /// told and the channel dropped. Returns once the drain has started; a second
  /// call while one is running does nothing.
  pub async fn disconnect(&self) -> Result<(), ClusterError> {
    if self.worker.state().is_shutting_down() {
      tracing::debug!(worker_id = self.worker.id(), "Disconnect ignored, already shutting down");
      return Ok(());
    }
    self.request(|reply_tx| Command::Disconnect { reply_tx }).await
  }

  /// Tears the worker down without draining handles. Exits at once when the
  /// channel is already gone, otherwise once the primary has acknowledged.
  pub async fn destroy(&self) -> Result<(), ClusterError> {
    if self.worker.state() == WorkerState::Destroying {
      tracing::debug!(worker_id = self.worker.id(), "Destroy ignored, already destroying");
      return Ok(());
    }
    if !self.channel.is_connected() {
      self.worker.set_exited_after_disconnect();
      tracing::info!(worker_id = self.worker.id(), "Destroy with channel already down, exiting");
      self.process.exit(self.exit_code);
      return Ok(());
    }
    match self.request(|reply_tx| Command::Destroy { reply_tx }).await {
      Err(ClusterError::ConnectionClosed) => {
        self.worker.set_exited_after_disconnect();
        self.process.exit(self.exit_code);
        Ok(())
      }
      other => other,
    }
  }

  /// Resolves once the session core has stopped.
  pub async fn stopped(&self) {
    let mut rx = self.stopped_rx.clone();
    // An error means the sender is gone, which also means stopped.
    let _ = rx.wait_for(|stopped| *stopped).await;
  }

  pub fn is_stopped(&self) -> bool {
    *self.stopped_rx.borrow()
  }

  async fn request(
    &self,
    make: impl FnOnce(oneshot::Sender<Result<(), ClusterError>>) -> Command,
  ) -> Result<(), ClusterError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    self
      .mailbox
      .send(make(reply_tx))
      .await
      .map_err(|_| ClusterError::ConnectionClosed)?;
    reply_rx.await.map_err(|_| ClusterError::ConnectionClosed)?
  }
}
