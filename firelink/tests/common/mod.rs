#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use firelink::{
  AddressFamily, Endpoint, IoCore, IoCoreConfig, Ipv4Address, Protocol,
  Socket, SocketType,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_logging() {
  let _ = env_logger::builder()
    .filter_level(log::LevelFilter::Trace)
    .is_test(true)
    .try_init();
}

pub fn core() -> Arc<IoCore> {
  init_logging();
  IoCore::create(IoCoreConfig::default()).expect("io core")
}

pub fn tcp(core: &Arc<IoCore>) -> Arc<Socket> {
  Socket::open(core, AddressFamily::Ipv4, SocketType::Stream, Protocol::Tcp)
    .expect("tcp socket")
}

pub fn udp(core: &Arc<IoCore>) -> Arc<Socket> {
  let socket =
    Socket::open(core, AddressFamily::Ipv4, SocketType::Datagram, Protocol::Udp)
      .expect("udp socket");
  socket.bind(&Endpoint::V4(Ipv4Address::loopback(0))).expect("bind");
  socket
}

/// A listening socket on `127.0.0.1` with a kernel-chosen port.
pub fn listener(core: &Arc<IoCore>) -> (Arc<Socket>, Endpoint) {
  let socket = tcp(core);
  socket.bind(&Endpoint::V4(Ipv4Address::loopback(0))).expect("bind");
  socket.listen(5).expect("listen");
  let addr = socket.get_sock_name().expect("local address");
  (socket, addr)
}

/// A connected pair `(client, server side)` set up with the sync API.
pub fn connected_pair(core: &Arc<IoCore>) -> (Arc<Socket>, Arc<Socket>) {
  let (listener, addr) = listener(core);
  let client = tcp(core);
  client.connect(&addr).expect("connect");
  let accepted = Socket::create(core);
  listener.accept(&accepted).expect("accept");
  (client, accepted)
}
