//! Accepts one client on 127.0.0.1:63000, answers each message with
//! "server test" and exits when the client hangs up.

use std::sync::{Arc, mpsc};

use firelink::{
  AcceptHandler, Endpoint, ErrorCode, IoCore, IoCoreConfig, Ipv4Address,
  ReadHandler, Socket, WriteHandler,
};

const REPLY: &[u8] = b"server test\0";

fn on_recv(done: mpsc::Sender<ErrorCode>) -> ReadHandler {
  ReadHandler::new(move |socket: Arc<Socket>, error: ErrorCode, n, buf| {
    if !error.is_success() {
      eprintln!("recv failed: {error}");
      let _ = done.send(error);
      return;
    }
    if n == 0 {
      println!("client disconnected.");
      let _ = done.send(ErrorCode::Success);
      return;
    }

    println!(
      "received {n} bytes, data:\n{}",
      String::from_utf8_lossy(&buf[..n as usize])
    );

    let sent = socket.start_send(
      REPLY.to_vec(),
      WriteHandler::new(|_socket, error, n, _buf| {
        if error.is_success() {
          println!("sent {n} bytes");
        } else {
          eprintln!("send failed: {error}");
        }
      }),
    );
    let next = sent.and_then(|()| {
      socket.start_recv(buf, on_recv(done.clone()))
    });
    if let Err(error) = next {
      eprintln!("could not continue: {error}");
      let _ = done.send(error);
    }
  })
}

fn main() -> firelink::Result<()> {
  env_logger::init();

  let core = IoCore::create(IoCoreConfig::with_threads(2, 2))?;
  let listener = Socket::open(
    &core,
    firelink::AddressFamily::Ipv4,
    firelink::SocketType::Stream,
    firelink::Protocol::Tcp,
  )?;

  let endpoint = Endpoint::V4(Ipv4Address::loopback(63000));
  listener.bind(&endpoint)?;
  println!("listener bound to {endpoint}");
  listener.listen(5)?;

  let (done_tx, done_rx) = mpsc::channel();
  let accepted = Socket::create(&core);
  let on_accept_done = done_tx.clone();
  listener.start_accept(
    &accepted,
    AcceptHandler::new(move |_listener, accepted, local, peer, error| {
      if !error.is_success() {
        eprintln!("accept failed: {error}");
        let _ = on_accept_done.send(error);
        return;
      }
      println!("{local} accepted connection from {peer}");

      let started = accepted
        .start_recv(vec![0; 512], on_recv(on_accept_done.clone()));
      if let Err(error) = started {
        let _ = on_accept_done.send(error);
      }
    }),
  )?;
  drop(done_tx);

  println!("waiting connections...");
  let outcome = done_rx.recv().unwrap_or(ErrorCode::Success);

  accepted.close()?;
  listener.close()?;
  println!("sockets closed.");
  core.release()?;
  println!("resources released.");
  outcome.into_result()
}
