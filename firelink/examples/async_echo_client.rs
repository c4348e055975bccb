//! Connects to 127.0.0.1:63000, sends "client test", prints the reply and
//! disconnects.

use std::sync::{Arc, mpsc};

use firelink::{
  AddressFamily, ConnectHandler, DisconnectHandler, Endpoint, ErrorCode,
  IoCore, IoCoreConfig, Ipv4Address, Protocol, ReadHandler, Socket,
  SocketType, WriteHandler,
};

const MESSAGE: &[u8] = b"client test\0";

fn on_recv(done: mpsc::Sender<ErrorCode>) -> ReadHandler {
  ReadHandler::new(move |socket: Arc<Socket>, error: ErrorCode, n, buf| {
    if !error.is_success() {
      eprintln!("recv failed: {error}");
      let _ = done.send(error);
      return;
    }
    if n == 0 {
      println!("disconnected.");
      let _ = done.send(ErrorCode::Success);
      return;
    }

    println!(
      "received {n} bytes, data:\n{}",
      String::from_utf8_lossy(&buf[..n as usize])
    );

    let disconnecting = socket.start_disconnect(
      false,
      DisconnectHandler::new(|_socket, local, peer, error| {
        if error.is_success() {
          println!("{local} disconnecting from {peer}");
        } else {
          eprintln!("disconnect failed: {error}");
        }
      }),
    );
    // The server's EOF arrives on the next read.
    let next = disconnecting.and_then(|()| {
      socket.start_recv(buf, on_recv(done.clone()))
    });
    if let Err(error) = next {
      let _ = done.send(error);
    }
  })
}

fn main() -> firelink::Result<()> {
  env_logger::init();

  let core = IoCore::create(IoCoreConfig::with_threads(2, 2))?;
  let socket =
    Socket::open(&core, AddressFamily::Ipv4, SocketType::Stream, Protocol::Tcp)?;

  let target = Endpoint::V4(Ipv4Address::loopback(63000));
  println!("connecting to {target}");

  let (done_tx, done_rx) = mpsc::channel();
  let on_connect_done = done_tx.clone();
  socket.start_connect(
    &target,
    ConnectHandler::new(move |socket, local, peer, error| {
      if !error.is_success() {
        eprintln!("connect failed: {error}");
        let _ = on_connect_done.send(error);
        return;
      }
      println!("{local} connected to {peer}");

      let sent = socket.start_send(
        MESSAGE.to_vec(),
        WriteHandler::new(|_socket, error, n, _buf| {
          if error.is_success() {
            println!("sent {n} bytes");
          }
        }),
      );
      let next = sent.and_then(|()| {
        socket.start_recv(vec![0; 512], on_recv(on_connect_done.clone()))
      });
      if let Err(error) = next {
        let _ = on_connect_done.send(error);
      }
    }),
  )?;
  drop(done_tx);

  let outcome = done_rx.recv().unwrap_or(ErrorCode::Success);

  socket.close()?;
  println!("socket closed.");
  core.release()?;
  println!("resources released.");
  outcome.into_result()
}
