// src/transport/ipc.rs

//! Unix stream socket transport. Frames use [`FrameCodec`]; a descriptor rides
//! as `SCM_RIGHTS` ancillary data on the first byte of its frame.

use crate::config::channel_fd_from_env;
use crate::error::ClusterError;
use crate::protocol::{Frame, FrameCodec, WireFrame};
use crate::transport::{ChannelEnds, IPrimaryChannel, Inbound, InboundSender};

use async_trait::async_trait;
use bytes::BytesMut;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr};
use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::Interest;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder};

const READ_CHUNK: usize = 8 * 1024;
const MAX_FDS_PER_READ: usize = 8;

/// Channel to the primary over an inherited or connected Unix stream socket.
#[derive(Debug)]
pub struct IpcChannel {
  stream: Arc<UnixStream>,
  write_lock: Mutex<()>,
  connected: Arc<AtomicBool>,
  reader: JoinHandle<()>,
}

impl IpcChannel {
  /// Wraps a connected std socket and spawns its reader task.
  pub fn connect(stream: std::os::unix::net::UnixStream) -> Result<ChannelEnds, ClusterError> {
    stream.set_nonblocking(true)?;
    let stream = Arc::new(UnixStream::from_std(stream)?);
    let connected = Arc::new(AtomicBool::new(true));
    let (inbound_tx, inbound_rx) = async_channel::unbounded();

    let reader = tokio::spawn(run_reader(stream.clone(), inbound_tx, connected.clone()));
    let channel = IpcChannel {
      stream,
      write_lock: Mutex::new(()),
      connected,
      reader,
    };
    tracing::debug!("IPC channel to primary established");
    Ok(ChannelEnds {
      channel: Arc::new(channel),
      inbound: inbound_rx,
    })
  }

  /// Uses the descriptor named by `RCLUSTER_CHANNEL_FD`.
  pub fn from_env() -> Result<ChannelEnds, ClusterError> {
    let fd = channel_fd_from_env()
      .ok_or_else(|| ClusterError::InvalidArgument("RCLUSTER_CHANNEL_FD is not set".into()))?;
    // SAFETY: the primary hands this descriptor to exactly one worker process,
    // which takes sole ownership of it here.
    let stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
    Self::connect(stream)
  }

  fn send_some(&self, buf: &[u8], fd: Option<RawFd>) -> io::Result<usize> {
    let raw = self.stream.as_raw_fd();
    self.stream.try_io(Interest::WRITABLE, || {
      let iov = [IoSlice::new(buf)];
      let sent = match fd {
        Some(fd) => {
          let fds = [fd];
          let cmsgs = [ControlMessage::ScmRights(&fds)];
          sendmsg::<UnixAddr>(raw, &iov, &cmsgs, MsgFlags::empty(), None)
        }
        None => sendmsg::<UnixAddr>(raw, &iov, &[], MsgFlags::empty(), None),
      };
      sent.map_err(io::Error::from)
    })
  }
}

#[async_trait]
impl IPrimaryChannel for IpcChannel {
  async fn send(&self, frame: Frame, handle: Option<OwnedFd>) -> Result<(), ClusterError> {
    if !self.is_connected() {
      return Err(ClusterError::ConnectionClosed);
    }
    let mut buf = BytesMut::new();
    FrameCodec::new().encode(WireFrame::new(frame, handle.is_some()), &mut buf)?;

    let _guard = self.write_lock.lock().await;
    let mut written = 0;
    let mut pending_fd = handle.as_ref().map(|h| h.as_raw_fd());
    while written < buf.len() {
      self.stream.writable().await.map_err(ClusterError::from_io_channel)?;
      match self.send_some(&buf[written..], pending_fd) {
        Ok(n) => {
          written += n;
          // The kernel attached the descriptor to the first chunk.
          pending_fd = None;
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
        Err(e) => return Err(ClusterError::from_io_channel(e)),
      }
    }
    // Our copy of the descriptor closes here; the peer holds its own.
    drop(handle);
    Ok(())
  }

  fn disconnect(&self) {
    if self.connected.swap(false, Ordering::AcqRel) {
      tracing::debug!("Disconnecting IPC channel");
      if let Err(e) = socket2::SockRef::from(&*self.stream).shutdown(std::net::Shutdown::Both) {
        tracing::debug!(error = %e, "Shutdown on IPC channel failed");
      }
    }
  }

  fn is_connected(&self) -> bool {
    self.connected.load(Ordering::Acquire)
  }
}

impl Drop for IpcChannel {
  fn drop(&mut self) {
    self.reader.abort();
  }
}

/// Reads chunks with any attached descriptors, decodes frames and pushes them
/// inbound. Closes the inbound channel on EOF or error.
async fn run_reader(stream: Arc<UnixStream>, inbound_tx: InboundSender, connected: Arc<AtomicBool>) {
  let mut codec = FrameCodec::new();
  let mut buf = BytesMut::with_capacity(READ_CHUNK);
  let mut fds: VecDeque<OwnedFd> = VecDeque::new();
  let mut chunk = vec![0u8; READ_CHUNK];
  let raw = stream.as_raw_fd();

  'read: loop {
    if let Err(e) = stream.readable().await {
      tracing::warn!(error = %e, "IPC channel readiness failed");
      break;
    }
    match stream.try_io(Interest::READABLE, || recv_with_fds(raw, &mut chunk)) {
      Ok((0, _)) => {
        tracing::debug!("IPC channel reached EOF");
        break;
      }
      Ok((n, received)) => {
        buf.extend_from_slice(&chunk[..n]);
        fds.extend(received);
      }
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
      Err(e) => {
        tracing::warn!(error = %e, "IPC channel read failed");
        break;
      }
    }

    loop {
      match codec.decode(&mut buf) {
        Ok(Some(wire)) => {
          let handle = if wire.has_handle() { fds.pop_front() } else { None };
          if wire.has_handle() && handle.is_none() {
            tracing::warn!(seq = wire.frame.seq, "Frame announced a descriptor but none arrived");
          }
          if inbound_tx.send(Inbound { frame: wire.frame, handle }).await.is_err() {
            break 'read;
          }
        }
        Ok(None) => break,
        Err(e) => {
          tracing::error!(error = %e, "Undecodable frame on IPC channel, closing");
          break 'read;
        }
      }
    }
  }

  connected.store(false, Ordering::Release);
  inbound_tx.close();
}

#[cfg(any(
  target_os = "android",
  target_os = "dragonfly",
  target_os = "freebsd",
  target_os = "linux",
  target_os = "netbsd",
  target_os = "openbsd"
))]
mod cloexec {
  use super::*;

  pub(super) const RECV_FLAGS: MsgFlags = MsgFlags::MSG_CMSG_CLOEXEC;

  pub(super) fn mark(_fd: RawFd) -> io::Result<()> {
    Ok(())
  }
}

// No MSG_CMSG_CLOEXEC on these platforms; each received descriptor is marked.
#[cfg(not(any(
  target_os = "android",
  target_os = "dragonfly",
  target_os = "freebsd",
  target_os = "linux",
  target_os = "netbsd",
  target_os = "openbsd"
)))]
mod cloexec {
  use super::*;
  use nix::fcntl::{fcntl, FcntlArg, FdFlag};

  pub(super) const RECV_FLAGS: MsgFlags = MsgFlags::empty();

  pub(super) fn mark(fd: RawFd) -> io::Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(io::Error::from)?;
    Ok(())
  }
}

fn recv_with_fds(fd: RawFd, chunk: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
  let mut iov = [IoSliceMut::new(chunk)];
  let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_FDS_PER_READ]);
  let msg = recvmsg::<UnixAddr>(fd, &mut iov, Some(&mut cmsg_buf), cloexec::RECV_FLAGS).map_err(io::Error::from)?;
  let mut received = Vec::new();
  for cmsg in msg.cmsgs() {
    if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
      for raw in raw_fds {
        // SAFETY: SCM_RIGHTS installed a fresh descriptor in this process that
        // nothing else refers to yet.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        if let Err(e) = cloexec::mark(fd.as_raw_fd()) {
          tracing::warn!(error = %e, "Could not mark received descriptor close-on-exec");
        }
        received.push(fd);
      }
    }
  }
  Ok((msg.bytes, received))
}
