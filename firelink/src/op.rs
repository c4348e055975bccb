//! Per-call in-flight state for asynchronous socket operations.
//!
//! An [`Operation`] is boxed when a `start_*` call is made and travels:
//!
//! ```text
//! submit ──► pending in the backend ──► I/O pool: complete() ──► user pool: invoke()
//!    └──► immediate failure: dropped, handler never runs
//! ```
//!
//! The box is the only owner at every step, so it is freed exactly once:
//! when `invoke` returns, or on the immediate-failure path.

use std::sync::Arc;

use log::{trace, warn};

use crate::context::{IoRegistration, Job, OpState, Rejected};
use crate::endpoint::Endpoint;
use crate::error::{ErrorCode, Result};
use crate::socket::Socket;

macro_rules! handler {
  (
    $(#[$meta:meta])*
    $name:ident($($arg:ident: $ty:ty),* $(,)?)
  ) => {
    $(#[$meta])*
    ///
    /// Converts from any matching `FnOnce` closure. [`Self::none`] completes
    /// silently.
    pub struct $name(Option<Box<dyn FnOnce($($ty),*) + Send>>);

    impl $name {
      pub fn new<F>(f: F) -> Self
      where
        F: FnOnce($($ty),*) + Send + 'static,
      {
        Self(Some(Box::new(f)))
      }

      pub fn none() -> Self {
        Self(None)
      }

      pub fn is_none(&self) -> bool {
        self.0.is_none()
      }

      /// Returns `false` if there was nothing to call.
      fn call(self, $($arg: $ty),*) -> bool {
        match self.0 {
          Some(f) => {
            f($($arg),*);
            true
          }
          None => false,
        }
      }
    }

    impl<F> From<F> for $name
    where
      F: FnOnce($($ty),*) + Send + 'static,
    {
      fn from(f: F) -> Self {
        Self::new(f)
      }
    }

    impl Default for $name {
      fn default() -> Self {
        Self::none()
      }
    }
  };
}

handler! {
  /// Called with `(listener, accepted, local, peer, error)`.
  AcceptHandler(
    listener: Arc<Socket>,
    accepted: Arc<Socket>,
    local: Endpoint,
    peer: Endpoint,
    error: ErrorCode,
  )
}

handler! {
  /// Called with `(socket, local, peer, error)`.
  ConnectHandler(
    socket: Arc<Socket>,
    local: Endpoint,
    peer: Endpoint,
    error: ErrorCode,
  )
}

handler! {
  /// Called with `(socket, error, bytes_transferred, buffer)`.
  ///
  /// `bytes_transferred` is `0` when the peer closed the connection and `-1`
  /// when `error` is not [`ErrorCode::Success`].
  ReadHandler(
    socket: Arc<Socket>,
    error: ErrorCode,
    bytes_transferred: i32,
    buffer: Vec<u8>,
  )
}

handler! {
  /// Called with `(socket, error, bytes_transferred, buffer)`.
  WriteHandler(
    socket: Arc<Socket>,
    error: ErrorCode,
    bytes_transferred: i32,
    buffer: Vec<u8>,
  )
}

handler! {
  /// Called with `(socket, local, peer, error)`.
  DisconnectHandler(
    socket: Arc<Socket>,
    local: Endpoint,
    peer: Endpoint,
    error: ErrorCode,
  )
}

/// Exactly one of these is stored per operation, matching its [`OpKind`].
pub(crate) enum Handler {
  Accept(AcceptHandler),
  Connect(ConnectHandler),
  Read(ReadHandler),
  Write(WriteHandler),
  Disconnect(DisconnectHandler),
}

pub(crate) enum OpKind {
  Accept { target: Arc<Socket> },
  Connect,
  Recv,
  RecvFrom,
  Send,
  SendTo,
  Disconnect { reuse_socket: bool },
}

impl OpKind {
  /// Whether the operation waits for the handle to become readable.
  pub(crate) fn is_read(&self) -> bool {
    matches!(self, OpKind::Accept { .. } | OpKind::Recv | OpKind::RecvFrom)
  }

  fn name(&self) -> &'static str {
    match self {
      OpKind::Accept { .. } => "accept",
      OpKind::Connect => "connect",
      OpKind::Recv => "recv",
      OpKind::RecvFrom => "recv_from",
      OpKind::Send => "send",
      OpKind::SendTo => "send_to",
      OpKind::Disconnect { .. } => "disconnect",
    }
  }
}

#[repr(C)]
pub(crate) struct Operation {
  /// Platform linkage. Must stay the first field: the completion port hands
  /// back a pointer to it and that pointer is cast to the whole record.
  pub(crate) sys: OpState,
  pub(crate) kind: OpKind,
  pub(crate) socket: Arc<Socket>,
  pub(crate) registration: Arc<IoRegistration>,
  pub(crate) buf: Vec<u8>,
  /// Destination for connect and send_to.
  pub(crate) addr: Option<Endpoint>,
  handler: Handler,
  error: ErrorCode,
  transferred: usize,
  completed: bool,
}

// SAFETY: the platform linkage holds raw pointers into this same record and
// its buffer. Whoever owns the box is the only one touching them.
#[cfg(iocp)]
unsafe impl Send for Operation {}

impl Operation {
  pub(crate) fn new(
    socket: Arc<Socket>,
    registration: Arc<IoRegistration>,
    kind: OpKind,
    handler: Handler,
    buf: Vec<u8>,
    addr: Option<Endpoint>,
  ) -> Box<Self> {
    debug_assert!(matches!(
      (&kind, &handler),
      (OpKind::Accept { .. }, Handler::Accept(_))
        | (OpKind::Connect, Handler::Connect(_))
        | (OpKind::Recv | OpKind::RecvFrom, Handler::Read(_))
        | (OpKind::Send | OpKind::SendTo, Handler::Write(_))
        | (OpKind::Disconnect { .. }, Handler::Disconnect(_))
    ));

    Box::new(Self {
      sys: OpState::default(),
      kind,
      socket,
      registration,
      buf,
      addr,
      handler,
      error: ErrorCode::Success,
      transferred: 0,
      completed: false,
    })
  }

  pub(crate) fn error(&self) -> ErrorCode {
    self.error
  }

  /// Counts the operation against its handle and hands it to `issue`.
  ///
  /// `issue` either takes ownership (pending, or completed and queued for
  /// completion) or gives the operation back with the error that stopped it.
  /// In that case the expected completion is cancelled and the operation is
  /// dropped without running its handler.
  pub(crate) fn submit<F>(self: Box<Self>, issue: F) -> Result<()>
  where
    F: FnOnce(Box<Self>) -> std::result::Result<(), (Box<Self>, ErrorCode)>,
  {
    let registration = Arc::clone(&self.registration);
    let kind = self.kind.name();
    registration.start_io();

    match issue(self) {
      Ok(()) => {
        trace!("{kind}: submitted on {:?}", registration.handle());
        Ok(())
      }
      Err((op, code)) => {
        registration.cancel_io();
        trace!("{kind}: failed immediately with {code:?}, handler skipped");
        drop(op);
        Err(code)
      }
    }
  }

  /// Queues completion on the I/O pool for an operation that finished during
  /// submission. Runs it here if the I/O pool is gone.
  pub(crate) fn complete_later(self: Box<Self>, result: Result<usize>) {
    let Some(core) = self.socket.core() else {
      return self.complete(result);
    };

    let job: Job = Box::new(move || self.complete(result));
    if let Err(Rejected(job)) = core.submit_io(job) {
      job();
    }
  }

  /// I/O pool side: records the outcome, runs the kind-specific fixup and
  /// hands the operation to the user pool.
  pub(crate) fn complete(mut self: Box<Self>, result: Result<usize>) {
    debug_assert!(!self.completed, "operation completed twice");
    match result {
      Ok(transferred) => self.transferred = transferred,
      Err(code) => self.error = code,
    }
    self.completed = true;

    if let Err(code) = crate::context::fixup(&mut self) {
      // I/O errors take precedence for user visibility.
      if self.error.is_success() {
        self.error = code;
      }
    }

    trace!(
      "{}: completed on {:?} with {:?}, {} bytes",
      self.kind.name(),
      self.registration.handle(),
      self.error,
      self.transferred
    );

    let registration = Arc::clone(&self.registration);
    let rejected = self.dispatch();
    // Counted as handed off before an inline run, so a handler that closes
    // its own socket does not wait on itself.
    registration.finish_io();

    if let Some(job) = rejected {
      warn!("user pool unavailable, running completion handler inline");
      job();
    }
  }

  /// Gives the job back if the user pool cannot take it.
  fn dispatch(self: Box<Self>) -> Option<Job> {
    let core = self.socket.core();
    let job: Job = Box::new(move || self.invoke());

    match core {
      Some(core) => core.submit_user(job).err().map(|Rejected(job)| job),
      None => Some(job),
    }
  }

  /// User pool side: runs the one handler and frees the operation.
  fn invoke(self: Box<Self>) {
    let Operation { kind, socket, handler, error, transferred, buf, .. } = *self;
    let name = kind.name();
    let bytes = if error.is_success() {
      i32::try_from(transferred).unwrap_or(i32::MAX)
    } else {
      -1
    };

    let invoked = match (kind, handler) {
      (OpKind::Accept { target }, Handler::Accept(handler)) => {
        let (local, peer) = endpoints(&target);
        handler.call(socket, target, local, peer, error)
      }
      (_, Handler::Connect(handler)) => {
        let (local, peer) = endpoints(&socket);
        handler.call(socket, local, peer, error)
      }
      (_, Handler::Read(handler)) => handler.call(socket, error, bytes, buf),
      (_, Handler::Write(handler)) => handler.call(socket, error, bytes, buf),
      (_, Handler::Disconnect(handler)) => {
        let (local, peer) = endpoints(&socket);
        handler.call(socket, local, peer, error)
      }
      (_, Handler::Accept(_)) => {
        unreachable!("firelink internal error: accept handler without target")
      }
    };

    if invoked {
      trace!("{name}: handler invoked");
    } else {
      trace!("{name}: no handler, completed silently");
    }
  }
}

fn endpoints(socket: &Socket) -> (Endpoint, Endpoint) {
  (
    socket.get_sock_name().unwrap_or_default(),
    socket.get_peer_name().unwrap_or_default(),
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{AddressFamily, IoCore, IoCoreConfig, Protocol, SocketType};
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::mpsc;
  use std::time::Duration;

  fn udp_socket(core: &Arc<IoCore>) -> Arc<Socket> {
    let socket = Socket::create(core);
    socket
      .socket(AddressFamily::Ipv4, SocketType::Datagram, Protocol::Udp)
      .unwrap();
    socket
  }

  fn read_op(socket: &Arc<Socket>, handler: ReadHandler) -> Box<Operation> {
    Operation::new(
      Arc::clone(socket),
      socket.registration().unwrap(),
      OpKind::Recv,
      Handler::Read(handler),
      vec![0; 16],
      None,
    )
  }

  #[test]
  fn immediate_failure_skips_handler() {
    let core = IoCore::create(IoCoreConfig::default()).unwrap();
    let socket = udp_socket(&core);
    let fired = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&fired);
    let op = read_op(&socket, ReadHandler::new(move |_, _, _, _| {
      flag.store(true, Ordering::SeqCst);
    }));
    let registration = Arc::clone(&op.registration);

    let result = op.submit(|op| Err((op, ErrorCode::WouldBlock)));

    assert_eq!(result, Err(ErrorCode::WouldBlock));
    assert_eq!(registration.outstanding(), 0);
    std::thread::sleep(Duration::from_millis(50));
    assert!(!fired.load(Ordering::SeqCst));
  }

  #[test]
  fn completion_runs_handler_on_user_pool() {
    let core = IoCore::create(IoCoreConfig::default()).unwrap();
    let socket = udp_socket(&core);
    let (tx, rx) = mpsc::channel();

    let op = read_op(&socket, ReadHandler::new(move |_, err, n, buf: Vec<u8>| {
      let name = std::thread::current().name().map(str::to_owned);
      tx.send((err, n, buf.len(), name)).unwrap();
    }));
    let registration = Arc::clone(&op.registration);

    op.submit(|op| {
      op.complete_later(Ok(5));
      Ok(())
    })
    .unwrap();

    let (err, n, len, thread) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(err, ErrorCode::Success);
    assert_eq!(n, 5);
    assert_eq!(len, 16);
    assert!(thread.unwrap().starts_with("firelink-user"));
    assert_eq!(registration.outstanding(), 0);
  }

  #[test]
  fn failed_completion_reports_negative_count() {
    let core = IoCore::create(IoCoreConfig::default()).unwrap();
    let socket = udp_socket(&core);
    let (tx, rx) = mpsc::channel();

    let op = read_op(&socket, ReadHandler::new(move |_, err, n, _| {
      tx.send((err, n)).unwrap();
    }));
    op.submit(|op| {
      op.complete_later(Err(ErrorCode::ConnectionReset));
      Ok(())
    })
    .unwrap();

    let (err, n) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(err, ErrorCode::ConnectionReset);
    assert_eq!(n, -1);
  }

  #[test]
  fn handler_runs_inline_once_user_pool_is_gone() {
    let core = IoCore::create(IoCoreConfig::default()).unwrap();
    let socket = udp_socket(&core);
    core.release().unwrap();

    let (tx, rx) = mpsc::channel();
    let op = read_op(&socket, ReadHandler::new(move |_, err, _, _| {
      tx.send(err).unwrap();
    }));
    op.registration.start_io();
    op.complete(Ok(0));

    assert_eq!(rx.try_recv().unwrap(), ErrorCode::Success);
  }

  fn accept_op(
    listener: &Arc<Socket>,
    target: &Arc<Socket>,
    tx: mpsc::Sender<ErrorCode>,
  ) -> Box<Operation> {
    Operation::new(
      Arc::clone(listener),
      listener.registration().unwrap(),
      OpKind::Accept { target: Arc::clone(target) },
      Handler::Accept(AcceptHandler::new(move |_, _, _, _, err| {
        tx.send(err).unwrap();
      })),
      Vec::new(),
      None,
    )
  }

  #[test]
  fn failed_fixup_replaces_success() {
    let core = IoCore::create(IoCoreConfig::default()).unwrap();
    let listener = udp_socket(&core);
    // Never opened, and no accepted connection to install.
    let target = Socket::create(&core);
    let (tx, rx) = mpsc::channel();

    let op = accept_op(&listener, &target, tx);
    op.registration.start_io();
    op.complete(Ok(0));

    let err = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(!err.is_success());
    assert!(!target.is_valid());
  }

  #[test]
  fn io_error_wins_over_fixup() {
    let core = IoCore::create(IoCoreConfig::default()).unwrap();
    let listener = udp_socket(&core);
    let target = Socket::create(&core);
    let (tx, rx) = mpsc::channel();

    let op = accept_op(&listener, &target, tx);
    op.registration.start_io();
    op.complete(Err(ErrorCode::ConnectionReset));

    let err = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(err, ErrorCode::ConnectionReset);
  }

  #[test]
  fn empty_handler_completes_silently() {
    let core = IoCore::create(IoCoreConfig::default()).unwrap();
    let socket = udp_socket(&core);
    let op = read_op(&socket, ReadHandler::none());
    let registration = Arc::clone(&op.registration);

    op.submit(|op| {
      op.complete_later(Ok(0));
      Ok(())
    })
    .unwrap();

    assert!(registration.wait_for_callbacks(Duration::from_secs(5)));
  }
}
