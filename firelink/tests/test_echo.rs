mod common;

use std::sync::mpsc;

use common::TIMEOUT;
use firelink::{
  AcceptHandler, ConnectHandler, DisconnectHandler, ErrorCode, ReadHandler,
  Socket, WriteHandler,
};

#[test]
fn accept_and_connect_see_each_other() {
  let core = common::core();
  let (listener, addr) = common::listener(&core);
  let accepted = Socket::create(&core);
  let client = common::tcp(&core);

  let (accept_tx, accept_rx) = mpsc::channel();
  listener
    .start_accept(
      &accepted,
      AcceptHandler::new(move |_listener, accepted, local, peer, err| {
        accept_tx.send((accepted, local, peer, err)).unwrap();
      }),
    )
    .unwrap();

  let (connect_tx, connect_rx) = mpsc::channel();
  client
    .start_connect(
      &addr,
      ConnectHandler::new(move |_socket, local, peer, err| {
        connect_tx.send((local, peer, err)).unwrap();
      }),
    )
    .unwrap();

  let (client_local, client_peer, err) = connect_rx.recv_timeout(TIMEOUT).unwrap();
  assert_eq!(err, ErrorCode::Success);
  let (server_socket, server_local, server_peer, err) =
    accept_rx.recv_timeout(TIMEOUT).unwrap();
  assert_eq!(err, ErrorCode::Success);

  assert_eq!(client_peer, addr);
  assert_eq!(server_local, addr);
  assert_eq!(client_local, server_peer);
  assert_eq!(client_peer, server_local);

  assert!(server_socket.is_valid());
  assert!(client.is_bound());
}

#[test]
fn server_receives_client_message() {
  let core = common::core();
  let (client, server) = common::connected_pair(&core);

  let (read_tx, read_rx) = mpsc::channel();
  server
    .start_recv(
      vec![0; 64],
      ReadHandler::new(move |_socket, err, n, buf| {
        read_tx.send((err, n, buf)).unwrap();
      }),
    )
    .unwrap();

  let (write_tx, write_rx) = mpsc::channel();
  client
    .start_send(
      b"client test\0".to_vec(),
      WriteHandler::new(move |_socket, err, n, _buf| {
        write_tx.send((err, n)).unwrap();
      }),
    )
    .unwrap();

  assert_eq!(write_rx.recv_timeout(TIMEOUT).unwrap(), (ErrorCode::Success, 12));
  let (err, n, buf) = read_rx.recv_timeout(TIMEOUT).unwrap();
  assert_eq!(err, ErrorCode::Success);
  assert_eq!(n, 12);
  assert_eq!(&buf[..11], b"client test");
}

#[test]
fn client_sees_eof_after_server_disconnect() {
  let core = common::core();
  let (client, server) = common::connected_pair(&core);

  let (read_tx, read_rx) = mpsc::channel();
  client
    .start_recv(
      vec![0; 64],
      ReadHandler::new(move |_socket, err, n, _buf| {
        read_tx.send((err, n)).unwrap();
      }),
    )
    .unwrap();

  let (disconnect_tx, disconnect_rx) = mpsc::channel();
  server
    .start_disconnect(
      false,
      DisconnectHandler::new(move |_socket, _local, _peer, err| {
        disconnect_tx.send(err).unwrap();
      }),
    )
    .unwrap();

  assert_eq!(disconnect_rx.recv_timeout(TIMEOUT).unwrap(), ErrorCode::Success);
  assert_eq!(read_rx.recv_timeout(TIMEOUT).unwrap(), (ErrorCode::Success, 0));
}

#[test]
fn queued_reads_complete_in_order() {
  let core = common::core();
  let (client, server) = common::connected_pair(&core);

  let (tx, rx) = mpsc::channel();
  for id in 0..3 {
    let tx = tx.clone();
    server
      .start_recv(
        vec![0; 1],
        ReadHandler::new(move |_socket, err, n, buf| {
          tx.send((id, err, n, buf[0])).unwrap();
        }),
      )
      .unwrap();
  }

  for byte in [b'a', b'b', b'c'] {
    assert_eq!(client.send(&[byte]).unwrap(), 1);
  }

  let mut seen: Vec<_> =
    (0..3).map(|_| rx.recv_timeout(TIMEOUT).unwrap()).collect();
  seen.sort_by_key(|(id, ..)| *id);
  assert_eq!(
    seen,
    vec![
      (0, ErrorCode::Success, 1, b'a'),
      (1, ErrorCode::Success, 1, b'b'),
      (2, ErrorCode::Success, 1, b'c'),
    ]
  );
}

#[test]
fn handler_may_start_the_next_operation() {
  let core = common::core();
  let (client, server) = common::connected_pair(&core);
  let (tx, rx) = mpsc::channel();

  let second = tx.clone();
  server
    .start_recv(
      vec![0; 5],
      ReadHandler::new(move |socket, err, n, buf| {
        tx.send((err, n, buf)).unwrap();
        socket
          .start_recv(
            vec![0; 5],
            ReadHandler::new(move |_socket, err, n, buf| {
              second.send((err, n, buf)).unwrap();
            }),
          )
          .unwrap();
      }),
    )
    .unwrap();

  client.send(b"hello").unwrap();
  let (_, n, buf) = rx.recv_timeout(TIMEOUT).unwrap();
  assert_eq!((n, buf.as_slice()), (5, &b"hello"[..]));

  client.send(b"world").unwrap();
  let (_, n, buf) = rx.recv_timeout(TIMEOUT).unwrap();
  assert_eq!((n, buf.as_slice()), (5, &b"world"[..]));
}

#[test]
fn large_send_is_fully_written() {
  let core = common::core();
  let (client, server) = common::connected_pair(&core);
  let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
  let expected = payload.clone();

  let (tx, rx) = mpsc::channel();
  client
    .start_send(
      payload,
      WriteHandler::new(move |_socket, err, n, _buf| {
        tx.send((err, n)).unwrap();
      }),
    )
    .unwrap();

  let mut received = Vec::with_capacity(expected.len());
  let mut chunk = vec![0u8; 64 * 1024];
  while received.len() < expected.len() {
    let n = server.recv(&mut chunk).unwrap();
    assert_ne!(n, 0, "peer closed early");
    received.extend_from_slice(&chunk[..n]);
  }

  let (err, n) = rx.recv_timeout(TIMEOUT).unwrap();
  assert_eq!(err, ErrorCode::Success);
  assert_eq!(n as usize, expected.len());
  assert!(received == expected);
}
