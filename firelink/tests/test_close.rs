mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Duration;

use common::TIMEOUT;
use firelink::{AddressFamily, ErrorCode, Protocol, ReadHandler, Socket, SocketType};

#[test]
fn close_is_idempotent() {
  let core = common::core();
  let socket = common::tcp(&core);
  assert!(socket.is_valid());

  socket.close().unwrap();
  assert!(!socket.is_valid());
  assert_eq!(socket.family(), None);
  assert_eq!(socket.socket_type(), None);
  assert_eq!(socket.protocol(), None);

  socket.close().unwrap();
  assert!(!socket.is_valid());
}

#[test]
fn every_triple_opens_and_closes() {
  let core = common::core();
  let triples = [
    (AddressFamily::Ipv4, SocketType::Stream, Protocol::Tcp),
    (AddressFamily::Ipv4, SocketType::Datagram, Protocol::Udp),
    (AddressFamily::Ipv6, SocketType::Stream, Protocol::Tcp),
    (AddressFamily::Ipv6, SocketType::Datagram, Protocol::Udp),
  ];

  for (family, ty, protocol) in triples {
    let socket = Socket::create(&core);
    socket.socket(family, ty, protocol).unwrap();
    assert!(socket.is_valid());
    socket.close().unwrap();
    assert!(!socket.is_valid());
  }
}

#[test]
fn closed_socket_can_be_reopened() {
  let core = common::core();
  let socket = common::tcp(&core);
  socket.close().unwrap();

  socket
    .socket(AddressFamily::Ipv4, SocketType::Datagram, Protocol::Udp)
    .unwrap();
  assert_eq!(socket.socket_type(), Some(SocketType::Datagram));
}

#[test]
fn close_aborts_pending_receive() {
  let core = common::core();
  let (_client, server) = common::connected_pair(&core);

  let (tx, rx) = mpsc::channel();
  server
    .start_recv(
      vec![0; 16],
      ReadHandler::new(move |_socket, err, n, buf| {
        tx.send((err, n, buf.len())).unwrap();
      }),
    )
    .unwrap();

  server.close().unwrap();
  assert!(!server.is_valid());

  let (err, n, len) = rx.recv_timeout(TIMEOUT).unwrap();
  assert_eq!(err, ErrorCode::OperationAborted);
  assert_eq!(n, -1);
  assert_eq!(len, 16);
  assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn immediate_failure_never_runs_handler() {
  let core = common::core();
  // Never connected, so the receive fails on the spot.
  let socket = common::tcp(&core);
  let fired = Arc::new(AtomicBool::new(false));

  let flag = Arc::clone(&fired);
  let result = socket.start_recv(
    vec![0; 16],
    ReadHandler::new(move |_socket, _err, _n, _buf| {
      flag.store(true, Ordering::SeqCst);
    }),
  );

  assert_eq!(result, Err(ErrorCode::NotConnected));
  std::thread::sleep(Duration::from_millis(100));
  assert!(!fired.load(Ordering::SeqCst));
}

#[test]
fn start_on_closed_socket_fails() {
  let core = common::core();
  let socket = common::tcp(&core);
  socket.close().unwrap();

  assert_eq!(
    socket.start_recv(vec![0; 4], ReadHandler::none()),
    Err(ErrorCode::NotASocket)
  );
}

#[test]
fn release_aborts_pending_operations() {
  let core = common::core();
  let (_client, server) = common::connected_pair(&core);

  let (tx, rx) = mpsc::channel();
  server
    .start_recv(
      vec![0; 16],
      ReadHandler::new(move |_socket, err, _n, _buf| {
        tx.send(err).unwrap();
      }),
    )
    .unwrap();

  core.release().unwrap();
  assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), ErrorCode::OperationAborted);
}

#[test]
fn pending_operation_keeps_socket_alive() {
  let core = common::core();
  let (client, server) = common::connected_pair(&core);

  let (tx, rx) = mpsc::channel();
  server
    .start_recv(
      vec![0; 4],
      ReadHandler::new(move |socket, err, n, _buf| {
        tx.send((socket.is_valid(), err, n)).unwrap();
      }),
    )
    .unwrap();
  drop(server);

  client.send(b"ping").unwrap();
  assert_eq!(
    rx.recv_timeout(TIMEOUT).unwrap(),
    (true, ErrorCode::Success, 4)
  );
}
