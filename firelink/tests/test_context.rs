mod common;

use std::sync::mpsc;
use std::time::Duration;

use common::TIMEOUT;
use firelink::{ErrorCode, IoCore, IoCoreConfig, ReadHandler};

#[test]
fn stopped_context_holds_completions_until_run() {
  let core = common::core();
  let (client, server) = common::connected_pair(&core);

  core.stop().unwrap();
  let (tx, rx) = mpsc::channel();
  server
    .start_recv(
      vec![0; 8],
      ReadHandler::new(move |_socket, err, n, _buf| {
        tx.send((err, n)).unwrap();
      }),
    )
    .unwrap();
  client.send(b"late").unwrap();

  assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
  core.run().unwrap();
  assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (ErrorCode::Success, 4));
}

#[test]
fn run_and_stop_need_initialization() {
  common::init_logging();
  let core = IoCore::new(IoCoreConfig::default());

  assert_eq!(core.run(), Err(ErrorCode::NotInitialized));
  assert_eq!(core.stop(), Err(ErrorCode::NotInitialized));
  assert_eq!(core.post_user_work(|| {}), Err(ErrorCode::NotInitialized));

  core.initialize().unwrap();
  core.initialize().unwrap();
  assert!(core.is_initialized());
  core.run().unwrap();
}

#[test]
fn work_lands_on_the_named_pools() {
  let core = common::core();
  let (tx, rx) = mpsc::channel();

  let io = tx.clone();
  core
    .post_io_work(move || {
      io.send(std::thread::current().name().map(str::to_owned)).unwrap();
    })
    .unwrap();
  core
    .post_user_work(move || {
      tx.send(std::thread::current().name().map(str::to_owned)).unwrap();
    })
    .unwrap();

  let mut names: Vec<String> = (0..2)
    .map(|_| rx.recv_timeout(TIMEOUT).unwrap().unwrap_or_default())
    .collect();
  names.sort();
  assert!(names[0].starts_with("firelink-io-"), "{names:?}");
  assert!(names[1].starts_with("firelink-user-"), "{names:?}");
}

#[test]
fn sockets_outlive_their_context() {
  let core = common::core();
  let socket = common::tcp(&core);
  drop(core);

  assert!(socket.is_valid());
  assert_eq!(
    socket.start_recv(vec![0; 4], ReadHandler::none()),
    Err(ErrorCode::NotInitialized)
  );
  socket.close().unwrap();
  assert!(!socket.is_valid());
}

#[test]
fn slow_handler_does_not_block_other_completions() {
  common::init_logging();
  let core = IoCore::create(IoCoreConfig {
    user_pool_min_threads: 2,
    user_pool_max_threads: 2,
    ..IoCoreConfig::default()
  })
  .unwrap();
  let (client, server) = common::connected_pair(&core);
  let (gate_tx, gate_rx) = mpsc::channel::<()>();
  let (tx, rx) = mpsc::channel();

  core
    .post_user_work(move || {
      let _ = gate_rx.recv_timeout(TIMEOUT);
    })
    .unwrap();

  server
    .start_recv(
      vec![0; 4],
      ReadHandler::new(move |_socket, err, n, _buf| {
        tx.send((err, n)).unwrap();
      }),
    )
    .unwrap();
  client.send(b"fast").unwrap();

  assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (ErrorCode::Success, 4));
  gate_tx.send(()).unwrap();
}
