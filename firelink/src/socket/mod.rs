//! One native socket handle and its sync and async surfaces.

#[cfg(unix)]
pub(crate) mod unix;
#[cfg(unix)]
pub(crate) use self::unix as sys;

#[cfg(windows)]
pub(crate) mod windows;
#[cfg(windows)]
pub(crate) use self::windows as sys;

use std::{
  sync::{Arc, Weak},
  time::{Duration, Instant},
};

use log::{debug, warn};

use self::sys::Interest;
use crate::context::{self, IoCore, IoRegistration};
use crate::endpoint::Endpoint;
use crate::error::{ErrorCode, Result};
use crate::op::{
  AcceptHandler, ConnectHandler, DisconnectHandler, Handler, OpKind, Operation,
  ReadHandler, WriteHandler,
};
use crate::sync::Mutex;
use crate::types::{
  AddressFamily, INVALID_HANDLE, NativeHandle, Protocol, ShutdownHow,
  SocketOption, SocketOptionLevel, SocketType,
};

/// Size of the buffer `disconnect` reads leftover bytes into.
const DISCARD_BUFFER_LEN: usize = 512;

struct SocketState {
  handle: NativeHandle,
  family: Option<AddressFamily>,
  ty: Option<SocketType>,
  protocol: Option<Protocol>,
  bound: bool,
  registration: Option<Arc<IoRegistration>>,
}

impl SocketState {
  const fn invalid() -> Self {
    Self {
      handle: INVALID_HANDLE,
      family: None,
      ty: None,
      protocol: None,
      bound: false,
      registration: None,
    }
  }
}

/// A socket handle bound to an [`IoCore`].
///
/// Always handed out as `Arc<Socket>`: every pending asynchronous operation
/// holds a strong reference, so the socket outlives its operations. The
/// socket itself only keeps a weak reference to the context.
///
/// Synchronous calls block the calling thread. `start_*` calls never block;
/// their handler runs exactly once on the context's user pool, unless the
/// call itself returns an error, in which case the handler is dropped
/// without running.
pub struct Socket {
  core: Weak<IoCore>,
  this: Weak<Socket>,
  state: Mutex<SocketState>,
}

impl Socket {
  /// An invalid socket tied to `core`. Call [`Socket::socket`] to open it.
  pub fn create(core: &Arc<IoCore>) -> Arc<Socket> {
    Arc::new_cyclic(|this| Socket {
      core: Arc::downgrade(core),
      this: this.clone(),
      state: Mutex::new(SocketState::invalid()),
    })
  }

  pub fn open(
    core: &Arc<IoCore>,
    family: AddressFamily,
    ty: SocketType,
    protocol: Protocol,
  ) -> Result<Arc<Socket>> {
    let socket = Self::create(core);
    socket.socket(family, ty, protocol)?;
    Ok(socket)
  }

  /// Creates the native handle and registers it with the context.
  pub fn socket(
    &self,
    family: AddressFamily,
    ty: SocketType,
    protocol: Protocol,
  ) -> Result<()> {
    let core = self.core().ok_or(ErrorCode::NotInitialized)?;
    let mut state = self.state.lock();
    if state.handle != INVALID_HANDLE {
      return Err(ErrorCode::InvalidArgument);
    }

    let handle = sys::socket(family, ty, protocol)?;
    let registration = match core.associate_handle(handle) {
      Ok(registration) => registration,
      Err(code) => {
        let _ = sys::close(handle);
        return Err(code);
      }
    };

    *state = SocketState {
      handle,
      family: Some(family),
      ty: Some(ty),
      protocol: Some(protocol),
      bound: false,
      registration: Some(registration),
    };
    debug!("socket: opened {handle:?} ({family:?}, {ty:?}, {protocol:?})");
    Ok(())
  }

  /// Aborts pending operations, waits until their completions are handed to
  /// the user pool, then deregisters and closes the handle. Closing an
  /// invalid socket succeeds.
  pub fn close(&self) -> Result<()> {
    let (handle, registration) = {
      let mut state = self.state.lock();
      if state.handle == INVALID_HANDLE {
        return Ok(());
      }
      let handle = state.handle;
      let registration = state.registration.take();
      *state = SocketState::invalid();
      (handle, registration)
    };

    if let Some(registration) = registration {
      context::cancel(&registration);

      let core = self.core();
      let timeout = core
        .as_ref()
        .map(|core| core.config().drain_timeout)
        .unwrap_or(Duration::from_secs(5));
      if !registration.wait_for_callbacks(timeout) {
        warn!(
          "socket: {handle:?} closed with {} completion(s) outstanding",
          registration.outstanding()
        );
      }

      if let Some(backend) = core.and_then(|core| core.backend().ok()) {
        context::Backend::dissociate(&*backend, &registration);
      }
    }

    sys::close(handle)?;
    debug!("socket: closed {handle:?}");
    Ok(())
  }

  pub fn is_valid(&self) -> bool {
    self.state.lock().handle != INVALID_HANDLE
  }

  pub fn native_handle(&self) -> NativeHandle {
    self.state.lock().handle
  }

  pub fn family(&self) -> Option<AddressFamily> {
    self.state.lock().family
  }

  pub fn socket_type(&self) -> Option<SocketType> {
    self.state.lock().ty
  }

  pub fn protocol(&self) -> Option<Protocol> {
    self.state.lock().protocol
  }

  pub fn is_bound(&self) -> bool {
    self.state.lock().bound
  }

  pub fn bind(&self, endpoint: &Endpoint) -> Result<()> {
    let handle = self.handle()?;
    sys::bind(handle, endpoint)?;
    self.mark_bound();
    Ok(())
  }

  pub fn listen(&self, backlog: i32) -> Result<()> {
    Ok(sys::listen(self.handle()?, backlog)?)
  }

  pub fn shutdown(&self, how: ShutdownHow) -> Result<()> {
    Ok(sys::shutdown(self.handle()?, how)?)
  }

  /// Blocks until a connection arrives and installs it in `target`,
  /// replacing whatever handle `target` held.
  pub fn accept(&self, target: &Arc<Socket>) -> Result<()> {
    let handle = self.handle()?;
    let accepted = sys::blocking(handle, Interest::Read, || sys::accept(handle))?;
    target.install_accepted(
      accepted,
      self.family(),
      self.socket_type(),
      self.protocol(),
    )
  }

  pub fn connect(&self, endpoint: &Endpoint) -> Result<()> {
    sys::connect_blocking(self.handle()?, endpoint)?;
    self.mark_bound();
    Ok(())
  }

  /// `Ok(0)` means the peer closed the connection.
  pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
    let handle = self.handle()?;
    Ok(sys::blocking(handle, Interest::Read, || sys::recv(handle, buf))?)
  }

  pub fn send(&self, buf: &[u8]) -> Result<usize> {
    let handle = self.handle()?;
    Ok(sys::blocking(handle, Interest::Write, || sys::send(handle, buf))?)
  }

  pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Endpoint)> {
    let handle = self.handle()?;
    Ok(sys::blocking(handle, Interest::Read, || sys::recv_from(handle, buf))?)
  }

  pub fn send_to(&self, buf: &[u8], endpoint: &Endpoint) -> Result<usize> {
    let handle = self.handle()?;
    Ok(sys::blocking(handle, Interest::Write, || {
      sys::send_to(handle, buf, endpoint)
    })?)
  }

  /// Graceful close of the send side: shuts down writing, then reads and
  /// discards until the peer closes too. Fails with `TimedOut` if `timeout`
  /// passes first. `None` waits forever.
  pub fn disconnect(&self, timeout: Option<Duration>) -> Result<()> {
    let handle = self.handle()?;
    sys::shutdown(handle, ShutdownHow::Write)?;

    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    let mut scrap = [0u8; DISCARD_BUFFER_LEN];
    loop {
      let remaining = match deadline {
        Some(deadline) => {
          let remaining = deadline.saturating_duration_since(Instant::now());
          if remaining.is_zero() {
            return Err(ErrorCode::TimedOut);
          }
          Some(remaining)
        }
        None => None,
      };

      if !sys::wait(handle, Interest::Read, remaining)? {
        return Err(ErrorCode::TimedOut);
      }
      match sys::recv(handle, &mut scrap) {
        Ok(0) => return Ok(()),
        Ok(_) => {}
        Err(err)
          if matches!(
            err.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
          ) => {}
        Err(err) => return Err(err.into()),
      }
    }
  }

  /// Passes `value` to the OS unchanged.
  pub fn set_socket_option(
    &self,
    level: SocketOptionLevel,
    option: SocketOption,
    value: &[u8],
  ) -> Result<()> {
    Ok(sys::set_option(self.handle()?, level.as_raw(), option.as_raw(), value)?)
  }

  /// Fills `value` and returns how many bytes the OS wrote.
  pub fn get_socket_option(
    &self,
    level: SocketOptionLevel,
    option: SocketOption,
    value: &mut [u8],
  ) -> Result<usize> {
    Ok(sys::get_option(
      self.handle()?,
      level.as_raw(),
      option.as_raw(),
      value,
    )?)
  }

  pub fn get_sock_name(&self) -> Result<Endpoint> {
    Ok(sys::local_addr(self.handle()?)?)
  }

  pub fn get_peer_name(&self) -> Result<Endpoint> {
    Ok(sys::peer_addr(self.handle()?)?)
  }

  /// Accepts one connection into `target`.
  ///
  /// An invalid `target` is first opened with this socket's family, type and
  /// protocol.
  pub fn start_accept(
    &self,
    target: &Arc<Socket>,
    handler: impl Into<AcceptHandler>,
  ) -> Result<()> {
    if !target.is_valid() {
      let (family, ty, protocol) = self.parameters()?;
      target.socket(family, ty, protocol)?;
    }
    self.start(
      OpKind::Accept { target: Arc::clone(target) },
      Handler::Accept(handler.into()),
      Vec::new(),
      None,
    )
  }

  /// Connects to `endpoint`, binding to the wildcard address first if the
  /// socket is not bound yet.
  pub fn start_connect(
    &self,
    endpoint: &Endpoint,
    handler: impl Into<ConnectHandler>,
  ) -> Result<()> {
    if !self.is_bound() {
      let (family, _, _) = self.parameters()?;
      self.bind(&Endpoint::any(family, 0))?;
    }
    self.start(
      OpKind::Connect,
      Handler::Connect(handler.into()),
      Vec::new(),
      Some(*endpoint),
    )
  }

  /// Reads into `buf`, which comes back to the handler.
  pub fn start_recv(
    &self,
    buf: Vec<u8>,
    handler: impl Into<ReadHandler>,
  ) -> Result<()> {
    self.start(OpKind::Recv, Handler::Read(handler.into()), buf, None)
  }

  pub fn start_recv_from(
    &self,
    buf: Vec<u8>,
    handler: impl Into<ReadHandler>,
  ) -> Result<()> {
    self.start(OpKind::RecvFrom, Handler::Read(handler.into()), buf, None)
  }

  /// Writes all of `buf`, which comes back to the handler.
  pub fn start_send(
    &self,
    buf: Vec<u8>,
    handler: impl Into<WriteHandler>,
  ) -> Result<()> {
    self.start(OpKind::Send, Handler::Write(handler.into()), buf, None)
  }

  pub fn start_send_to(
    &self,
    buf: Vec<u8>,
    endpoint: &Endpoint,
    handler: impl Into<WriteHandler>,
  ) -> Result<()> {
    self.start(
      OpKind::SendTo,
      Handler::Write(handler.into()),
      buf,
      Some(*endpoint),
    )
  }

  /// Closes the send side. `reuse_socket` keeps the handle usable for another
  /// accept or connect where the platform supports it.
  pub fn start_disconnect(
    &self,
    reuse_socket: bool,
    handler: impl Into<DisconnectHandler>,
  ) -> Result<()> {
    self.start(
      OpKind::Disconnect { reuse_socket },
      Handler::Disconnect(handler.into()),
      Vec::new(),
      None,
    )
  }

  fn start(
    &self,
    kind: OpKind,
    handler: Handler,
    buf: Vec<u8>,
    addr: Option<Endpoint>,
  ) -> Result<()> {
    let core = self.core().ok_or(ErrorCode::NotInitialized)?;
    let backend = core.backend()?;
    let registration = self.registration()?;
    let this = self.this.upgrade().ok_or(ErrorCode::NotASocket)?;

    let op = Operation::new(this, registration, kind, handler, buf, addr);
    context::Backend::submit(&*backend, op)
  }

  pub(crate) fn core(&self) -> Option<Arc<IoCore>> {
    self.core.upgrade()
  }

  pub(crate) fn registration(&self) -> Result<Arc<IoRegistration>> {
    self.state.lock().registration.clone().ok_or(ErrorCode::NotASocket)
  }

  pub(crate) fn mark_bound(&self) {
    self.state.lock().bound = true;
  }

  /// Makes this socket own `handle`, a freshly accepted connection. The
  /// previous handle, if any, is closed first. `handle` is closed on failure.
  pub(crate) fn install_accepted(
    &self,
    handle: NativeHandle,
    family: Option<AddressFamily>,
    ty: Option<SocketType>,
    protocol: Option<Protocol>,
  ) -> Result<()> {
    if let Err(code) = self.close() {
      warn!("socket: closing placeholder before accept failed: {code}");
    }

    let registration = self
      .core()
      .ok_or(ErrorCode::NotInitialized)
      .and_then(|core| core.associate_handle(handle));
    let registration = match registration {
      Ok(registration) => registration,
      Err(code) => {
        let _ = sys::close(handle);
        return Err(code);
      }
    };

    *self.state.lock() = SocketState {
      handle,
      family,
      ty,
      protocol,
      bound: true,
      registration: Some(registration),
    };
    debug!("socket: accepted {handle:?}");
    Ok(())
  }

  fn handle(&self) -> Result<NativeHandle> {
    let handle = self.state.lock().handle;
    if handle == INVALID_HANDLE { Err(ErrorCode::NotASocket) } else { Ok(handle) }
  }

  fn parameters(&self) -> Result<(AddressFamily, SocketType, Protocol)> {
    let state = self.state.lock();
    match (state.family, state.ty, state.protocol) {
      (Some(family), Some(ty), Some(protocol)) => Ok((family, ty, protocol)),
      _ => Err(ErrorCode::NotASocket),
    }
  }
}

impl Drop for Socket {
  fn drop(&mut self) {
    if let Err(code) = self.close() {
      warn!("socket: close on drop failed: {code}");
    }
  }
}

impl std::fmt::Debug for Socket {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let state = self.state.lock();
    f.debug_struct("Socket")
      .field("handle", &state.handle)
      .field("family", &state.family)
      .field("type", &state.ty)
      .field("protocol", &state.protocol)
      .field("bound", &state.bound)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::IoCoreConfig;

  fn core() -> Arc<IoCore> {
    IoCore::create(IoCoreConfig::default()).unwrap()
  }

  #[test]
  fn open_then_close() {
    let core = core();
    let socket = Socket::create(&core);
    assert!(!socket.is_valid());

    socket
      .socket(AddressFamily::Ipv4, SocketType::Stream, Protocol::Tcp)
      .unwrap();
    assert!(socket.is_valid());
    assert_eq!(socket.family(), Some(AddressFamily::Ipv4));
    assert_eq!(socket.socket_type(), Some(SocketType::Stream));
    assert_eq!(socket.protocol(), Some(Protocol::Tcp));

    socket.close().unwrap();
    assert!(!socket.is_valid());
    assert_eq!(socket.family(), None);
    assert!(!socket.is_bound());
    socket.close().unwrap();
  }

  #[test]
  fn reopening_a_live_socket_is_rejected() {
    let core = core();
    let socket =
      Socket::open(&core, AddressFamily::Ipv4, SocketType::Datagram, Protocol::Udp)
        .unwrap();
    let err = socket
      .socket(AddressFamily::Ipv4, SocketType::Datagram, Protocol::Udp)
      .unwrap_err();
    assert_eq!(err, ErrorCode::InvalidArgument);
  }

  #[test]
  fn calls_on_invalid_socket_fail() {
    let core = core();
    let socket = Socket::create(&core);
    let mut buf = [0u8; 4];

    assert_eq!(socket.recv(&mut buf), Err(ErrorCode::NotASocket));
    assert_eq!(socket.get_sock_name(), Err(ErrorCode::NotASocket));
    assert_eq!(
      socket.start_recv(vec![0; 4], ReadHandler::none()),
      Err(ErrorCode::NotASocket)
    );
  }

  #[test]
  fn socket_needs_a_live_context() {
    let core = core();
    let socket = Socket::create(&core);
    drop(core);

    let err = socket
      .socket(AddressFamily::Ipv4, SocketType::Stream, Protocol::Tcp)
      .unwrap_err();
    assert_eq!(err, ErrorCode::NotInitialized);
  }

  #[test]
  fn bind_marks_bound_and_reports_name() {
    let core = core();
    let socket =
      Socket::open(&core, AddressFamily::Ipv4, SocketType::Stream, Protocol::Tcp)
        .unwrap();
    socket.bind(&Endpoint::V4(crate::Ipv4Address::loopback(0))).unwrap();

    assert!(socket.is_bound());
    let local = socket.get_sock_name().unwrap();
    assert_eq!(local.family(), AddressFamily::Ipv4);
    assert_ne!(local.port(), 0);
    assert_eq!(socket.get_peer_name(), Err(ErrorCode::NotConnected));
  }

  #[test]
  fn socket_options_round_trip() {
    let core = core();
    let socket =
      Socket::open(&core, AddressFamily::Ipv4, SocketType::Stream, Protocol::Tcp)
        .unwrap();

    let on: i32 = 1;
    socket
      .set_socket_option(
        SocketOptionLevel::Socket,
        SocketOption::ReuseAddress,
        &on.to_ne_bytes(),
      )
      .unwrap();

    let mut value = [0u8; 4];
    let len = socket
      .get_socket_option(
        SocketOptionLevel::Socket,
        SocketOption::ReuseAddress,
        &mut value,
      )
      .unwrap();
    assert_eq!(len, 4);
    assert_ne!(i32::from_ne_bytes(value), 0);
  }
}
