// tests/ipc_transport.rs
#![cfg(feature = "ipc")]

use rcluster::protocol::message::{ACT_NEWCONN, ACT_ONLINE, ACT_QUERY_SERVER};
use rcluster::protocol::Frame;
use rcluster::transport::ipc::IpcChannel;
use rcluster::transport::ChannelEnds;
use rcluster::{setup_worker, HandleKey, ListenOptions, WorkerConfig};
use std::io::{Read, Write};
use std::sync::Arc;
use tokio::time::timeout;
mod common;

use common::{connection_fd, RecordingProcess, LONG_TIMEOUT, TAG};

async fn next_frame(primary: &ChannelEnds) -> Frame {
  timeout(LONG_TIMEOUT, primary.inbound.recv())
    .await
    .expect("timed out waiting for worker frame")
    .expect("channel closed")
    .frame
}

#[tokio::test]
async fn worker_session_runs_over_a_socketpair() {
  let (worker_sock, primary_sock) = std::os::unix::net::UnixStream::pair().unwrap();
  let primary = IpcChannel::connect(primary_sock).unwrap();
  let process = Arc::new(RecordingProcess::default());
  let worker = setup_worker(
    WorkerConfig::default().with_worker_id(4),
    IpcChannel::connect(worker_sock).unwrap(),
    process.clone(),
  )
  .unwrap();

  assert_eq!(next_frame(&primary).await.act(), Some(ACT_ONLINE));

  let registering = {
    let worker = worker.clone();
    tokio::spawn(async move { worker.register_listener(ListenOptions::tcp4("127.0.0.1", 8000), None).await })
  };
  let query = next_frame(&primary).await;
  assert_eq!(query.act(), Some(ACT_QUERY_SERVER));

  let mut reply = Frame::new(TAG);
  reply.seq = 1;
  reply.ack = Some(query.seq);
  reply.key = Some(HandleKey::Int(1));
  primary.channel.send(reply, None).await.unwrap();
  let handle = timeout(LONG_TIMEOUT, registering).await.unwrap().unwrap().unwrap().handle;

  let (fd, mut client) = connection_fd();
  let mut newconn = Frame::new(TAG).with_act(ACT_NEWCONN);
  newconn.seq = 2;
  newconn.key = Some(HandleKey::Int(1));
  primary.channel.send(newconn, Some(fd)).await.unwrap();

  let ack = next_frame(&primary).await;
  assert_eq!((ack.ack, ack.accepted), (Some(2), Some(true)));

  let conn = timeout(LONG_TIMEOUT, handle.accept()).await.unwrap().unwrap();
  let mut server = std::net::TcpStream::from(conn.handle);
  server.write_all(b"ping").unwrap();
  let mut buf = [0u8; 4];
  client.read_exact(&mut buf).unwrap();
  assert_eq!(&buf, b"ping");

  // Losing the primary without a handshake is fatal for the worker.
  primary.channel.disconnect();
  assert_eq!(process.wait_for_exit().await, 0);
}
