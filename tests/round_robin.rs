// tests/round_robin.rs

use rcluster::protocol::message::{ACT_CLOSE, ACT_LISTENING};
use rcluster::protocol::ReplyPayload;
use rcluster::{ClusterError, HandleKey, IServerHandle, ListenOptions, WorkerState};
use serde_json::json;
mod common;

use common::{keyed, sockname, start_worker};

#[tokio::test]
async fn close_twice_sends_one_notification() {
  let t = start_worker().await;
  let handle = t.register_rr(ListenOptions::tcp4("127.0.0.1", 8000), 7u64).await;
  assert!(handle.is_round_robin());
  assert_eq!(handle.key(), Some(HandleKey::Int(7)));

  handle.close().await.unwrap();
  handle.close().await.unwrap();
  assert!(handle.is_closed());
  assert_eq!(handle.key(), None);

  let close = t.primary.expect_act(ACT_CLOSE).await;
  assert_eq!(close.key, Some(HandleKey::Int(7)));
  t.primary.expect_silence().await;

  // The index was released once and the endpoint forgotten, so numbering restarts.
  let (query, result) = t
    .register_with(ListenOptions::tcp4("127.0.0.1", 8000), None, keyed(8u64), None)
    .await;
  assert!(result.is_ok());
  assert_eq!(query.index, Some(0));
}

#[tokio::test]
async fn getsockname_follows_handle_lifetime() {
  let t = start_worker().await;
  let payload = ReplyPayload {
    sockname: Some(sockname("0.0.0.0", 9100)),
    ..keyed("shared-key")
  };
  let (_, result) = t
    .register_with(ListenOptions::tcp4("0.0.0.0", 9100), None, payload, None)
    .await;
  let handle = result.unwrap().handle;

  assert_eq!(handle.getsockname().unwrap(), sockname("0.0.0.0", 9100));
  handle.close().await.unwrap();
  assert!(matches!(handle.getsockname(), Err(ClusterError::NotBound)));
}

#[tokio::test]
async fn getsockname_without_reply_name_is_not_bound() {
  let t = start_worker().await;
  let handle = t.register_rr(ListenOptions::tcp4("0.0.0.0", 9101), 1u64).await;
  assert!(matches!(handle.getsockname(), Err(ClusterError::NotBound)));
}

#[tokio::test]
async fn listen_and_ref_are_accepted_without_effect() {
  let t = start_worker().await;
  let handle = t.register_rr(ListenOptions::tcp4("0.0.0.0", 9102), 1u64).await;
  handle.listen(511).unwrap();
  handle.listen(-1).unwrap();
  handle.ref_handle();
  handle.unref_handle();
  t.primary.expect_silence().await;
}

#[tokio::test]
async fn indices_are_distinct_per_endpoint() {
  let t = start_worker().await;
  let options = ListenOptions::tcp4("0.0.0.0", 8080);

  let mut handles = Vec::new();
  for (n, key) in [10u64, 11, 12].into_iter().enumerate() {
    let (query, result) = t.register_with(options.clone(), None, keyed(key), None).await;
    assert_eq!(query.index, Some(n as u64));
    handles.push(result.unwrap().handle);
  }
  let indices: Vec<u64> = handles.iter().map(|h| h.index()).collect();
  assert_eq!(indices, vec![0, 1, 2]);

  // A different endpoint has its own numbering.
  let (other, _) = t
    .register_with(ListenOptions::tcp4("0.0.0.0", 8081), None, keyed(20u64), None)
    .await;
  assert_eq!(other.index, Some(0));

  // Releasing one live index keeps the endpoint's counter going.
  handles[0].close().await.unwrap();
  t.primary.expect_act(ACT_CLOSE).await;
  let (query, _) = t.register_with(options.clone(), None, keyed(13u64), None).await;
  assert_eq!(query.index, Some(3));
}

#[tokio::test]
async fn refused_query_fails_and_releases_index() {
  let t = start_worker().await;
  let options = ListenOptions::tcp4("0.0.0.0", 80);
  let refused = ReplyPayload {
    errno: 13,
    ..Default::default()
  };
  let (query, result) = t.register_with(options.clone(), None, refused, None).await;
  assert_eq!(query.index, Some(0));
  assert!(matches!(result, Err(ClusterError::QueryFailed { errno: 13 })));

  let (retry, result) = t.register_with(options, None, keyed(1u64), None).await;
  assert!(result.is_ok());
  assert_eq!(retry.index, Some(0));
}

#[tokio::test]
async fn reply_without_key_is_a_protocol_violation() {
  let t = start_worker().await;
  let (_, result) = t
    .register_with(ListenOptions::tcp4("0.0.0.0", 81), None, ReplyPayload::default(), None)
    .await;
  assert!(matches!(result, Err(ClusterError::ProtocolViolation(_))));
}

#[tokio::test]
async fn duplicate_key_is_refused_and_first_handle_survives() {
  let t = start_worker().await;
  let first = t.register_rr(ListenOptions::tcp4("0.0.0.0", 7000), 5u64).await;
  let (_, second) = t
    .register_with(ListenOptions::tcp4("0.0.0.0", 7000), None, keyed(5u64), None)
    .await;
  assert!(matches!(second, Err(ClusterError::DuplicateKey(HandleKey::Int(5)))));
  t.primary.expect_silence().await;

  assert_eq!(first.key(), Some(HandleKey::Int(5)));
  first.close().await.unwrap();
  let close = t.primary.expect_act(ACT_CLOSE).await;
  assert_eq!(close.key, Some(HandleKey::Int(5)));
}

#[tokio::test]
async fn application_data_round_trips() {
  let t = start_worker().await;
  let options = ListenOptions::tcp4("0.0.0.0", 443).with_data(json!({"ticketKeys": "c2VjcmV0"}));
  let payload = ReplyPayload {
    data: Some(json!({"ticketKeys": "ZnJvbS1wcmltYXJ5"})),
    ..keyed(2u64)
  };
  let (query, result) = t.register_with(options, None, payload, None).await;
  assert_eq!(query.data, Some(json!({"ticketKeys": "c2VjcmV0"})));
  assert_eq!(result.unwrap().data, Some(json!({"ticketKeys": "ZnJvbS1wcmltYXJ5"})));
}

#[tokio::test]
async fn query_carries_endpoint_fields() {
  let t = start_worker().await;
  let options = ListenOptions::tcp6("::", 8443).with_backlog(128).with_exclusive(true);
  let (query, _) = t.register_with(options, None, keyed(3u64), None).await;
  assert_eq!(query.address.as_deref(), Some("::"));
  assert_eq!(query.port, Some(8443));
  assert_eq!(query.address_type, Some(rcluster::AddressType::Tcp6));
  assert_eq!(query.backlog, Some(128));
  assert_eq!(query.exclusive, Some(true));
  assert_eq!(query.fd, None);
}

#[tokio::test]
async fn relative_unix_paths_are_resolved() {
  let t = start_worker().await;
  let (query, _) = t
    .register_with(ListenOptions::unix("run/worker.sock"), None, keyed(4u64), None)
    .await;
  let expected = std::env::current_dir().unwrap().join("run/worker.sock");
  assert_eq!(query.address.as_deref(), Some(expected.to_str().unwrap()));
}

#[tokio::test]
async fn report_listening_sends_realized_port() {
  let t = start_worker().await;
  assert_eq!(t.worker.state(), WorkerState::Online);
  let handle = t.register_rr(ListenOptions::tcp4("127.0.0.1", 0), 9u64).await;

  handle.report_listening(Some(41234)).await.unwrap();
  let listening = t.primary.expect_act(ACT_LISTENING).await;
  assert_eq!(listening.port, Some(41234));
  assert_eq!(listening.index, Some(handle.index()));
  assert_eq!(listening.address.as_deref(), Some("127.0.0.1"));
  assert_eq!(t.worker.state(), WorkerState::Listening);

  handle.report_listening(None).await.unwrap();
  let again = t.primary.expect_act(ACT_LISTENING).await;
  assert_eq!(again.port, Some(0));
}

#[tokio::test]
async fn sequence_numbers_increase_on_every_frame() {
  let t = start_worker().await;
  let handle = t.register_rr(ListenOptions::tcp4("127.0.0.1", 5000), 1u64).await;
  handle.close().await.unwrap();
  handle.report_listening(None).await.unwrap();
  let close = t.primary.recv_frame().await;
  let listening = t.primary.recv_frame().await;
  assert!(close.seq > 0);
  assert!(listening.seq > close.seq);
}
