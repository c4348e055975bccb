//! Readiness-to-completion adapter over epoll.
//!
//! Each registered handle keeps two FIFO queues of pending operations.
//! An operation is first tried directly; if the kernel says `EAGAIN` it is
//! queued and the handle is armed (`EPOLLONESHOT`) for the matching
//! readiness. When the event fires, an I/O pool job retries the queue heads
//! and completes whatever finished.

use std::{
  collections::VecDeque,
  io, mem,
  os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
  sync::Arc,
  time::Duration,
};

use log::{trace, warn};

use super::store::TokenStore;
use super::{Backend, IoRegistration, Job, Rejected, ThreadPool};
use crate::error::{ErrorCode, Result};
use crate::op::{OpKind, Operation};
use crate::socket::sys;
use crate::sync::Mutex;
use crate::types::{NativeHandle, ShutdownHow};

/// Event key of the wake-up eventfd. Never handed out by the token store.
const NOTIFY_KEY: u64 = u64::MAX;
const MAX_EVENTS: usize = 64;

const READABLE: u32 = (libc::EPOLLIN
  | libc::EPOLLHUP
  | libc::EPOLLERR
  | libc::EPOLLRDHUP) as u32;
const WRITABLE: u32 = (libc::EPOLLOUT | libc::EPOLLHUP | libc::EPOLLERR) as u32;

pub(crate) struct Epoll {
  epoll_fd: OwnedFd,
  notifier: OwnedFd,
  registrations: Mutex<TokenStore<Arc<IoRegistration>>>,
}

#[derive(Default)]
struct Queues {
  readers: VecDeque<Box<Operation>>,
  writers: VecDeque<Box<Operation>>,
  /// Set by `cancel`. Nothing is queued afterwards.
  closed: bool,
}

/// Operations waiting for readiness on one handle.
pub(crate) struct Pending {
  queues: Mutex<Queues>,
}

impl Default for Pending {
  fn default() -> Self {
    Self { queues: Mutex::new(Queues::default()) }
  }
}

pub(crate) struct OpState {
  /// Connection taken by a finished accept, until the fixup installs it.
  accepted: RawFd,
  /// Bytes already written by a send.
  progress: usize,
  /// `connect(2)` returned `EINPROGRESS`.
  connecting: bool,
}

impl Default for OpState {
  fn default() -> Self {
    Self { accepted: -1, progress: 0, connecting: false }
  }
}

impl Drop for OpState {
  fn drop(&mut self) {
    if self.accepted >= 0 {
      let _ = sys::close(self.accepted);
    }
  }
}

#[derive(Debug, Clone, Copy)]
struct Readiness {
  readable: bool,
  writable: bool,
}

impl Backend for Epoll {
  type Pending = Pending;
  type OpState = OpState;

  fn open() -> io::Result<Self> {
    // SAFETY: a successful epoll_create1 returns a fresh descriptor we own.
    let epoll_fd = unsafe {
      OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?)
    };
    // SAFETY: as above, for eventfd.
    let notifier = unsafe {
      OwnedFd::from_raw_fd(syscall!(eventfd(
        0,
        libc::EFD_CLOEXEC | libc::EFD_NONBLOCK
      ))?)
    };

    // Level-triggered: stays readable until the harvester drains it.
    let mut event =
      libc::epoll_event { events: libc::EPOLLIN as u32, u64: NOTIFY_KEY };
    syscall!(epoll_ctl(
      epoll_fd.as_raw_fd(),
      libc::EPOLL_CTL_ADD,
      notifier.as_raw_fd(),
      &mut event,
    ))?;

    trace!("epoll: opened fd {}", epoll_fd.as_raw_fd());
    Ok(Self {
      epoll_fd,
      notifier,
      registrations: Mutex::new(TokenStore::default()),
    })
  }

  fn associate(&self, handle: NativeHandle) -> io::Result<Arc<IoRegistration>> {
    let (token, registration) = {
      let mut store = self.registrations.lock();
      let (token, registration) = store
        .insert_with(|token| Arc::new(IoRegistration::new(handle, token)));
      (token, Arc::clone(registration))
    };

    // Registered disarmed; `rearm` adds interest once something is queued.
    let mut event =
      libc::epoll_event { events: libc::EPOLLONESHOT as u32, u64: token };
    let added = syscall!(epoll_ctl(
      self.epoll_fd.as_raw_fd(),
      libc::EPOLL_CTL_ADD,
      handle,
      &mut event,
    ));
    if let Err(err) = added {
      self.registrations.lock().remove(token);
      return Err(err);
    }

    trace!("epoll: associated fd {handle} as token {token:#x}");
    Ok(registration)
  }

  fn dissociate(&self, registration: &IoRegistration) {
    let removed = syscall!(epoll_ctl(
      self.epoll_fd.as_raw_fd(),
      libc::EPOLL_CTL_DEL,
      registration.handle(),
      std::ptr::null_mut(),
    ));
    if let Err(err) = removed {
      trace!("epoll: deregistering fd {} failed: {err}", registration.handle());
    }
    self.registrations.lock().remove(registration.token());
  }

  fn submit(&self, op: Box<Operation>) -> Result<()> {
    op.submit(|mut op| {
      let registration = Arc::clone(&op.registration);
      let mut guard = registration.pending.queues.lock();
      let queues = &mut *guard;
      if queues.closed {
        return Err((op, ErrorCode::NotASocket));
      }

      let is_read = op.kind.is_read();
      let queue =
        if is_read { &mut queues.readers } else { &mut queues.writers };

      // Only try directly when nothing is ahead of us, to keep FIFO order.
      if queue.is_empty() {
        match attempt(&mut op) {
          Some(Ok(transferred)) => {
            drop(guard);
            op.complete_later(Ok(transferred));
            return Ok(());
          }
          Some(Err(err)) => return Err((op, err.into())),
          None => {}
        }
      }

      queue.push_back(op);
      if let Err(err) = self.rearm(&registration, queues) {
        let queue =
          if is_read { &mut queues.readers } else { &mut queues.writers };
        if let Some(op) = queue.pop_back() {
          return Err((op, err.into()));
        }
      }
      Ok(())
    })
  }

  fn cancel(registration: &IoRegistration) {
    let aborted: Vec<_> = {
      let mut guard = registration.pending.queues.lock();
      let queues = &mut *guard;
      queues.closed = true;
      queues.readers.drain(..).chain(queues.writers.drain(..)).collect()
    };

    if !aborted.is_empty() {
      trace!(
        "epoll: aborting {} pending operation(s) on fd {}",
        aborted.len(),
        registration.handle()
      );
    }
    for op in aborted {
      op.complete(Err(ErrorCode::OperationAborted));
    }
  }

  fn fixup(op: &mut Operation) -> Result<()> {
    if !op.error().is_success() {
      return Ok(());
    }

    match &op.kind {
      OpKind::Accept { target } => {
        let fd = mem::replace(&mut op.sys.accepted, -1);
        target.install_accepted(
          fd,
          op.socket.family(),
          op.socket.socket_type(),
          op.socket.protocol(),
        )
      }
      OpKind::Connect => {
        op.socket.mark_bound();
        Ok(())
      }
      _ => Ok(()),
    }
  }

  fn poll(
    this: &Arc<Self>,
    io_pool: &ThreadPool,
    timeout: Option<Duration>,
  ) -> io::Result<()> {
    // SAFETY: epoll_event is plain data.
    let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { mem::zeroed() };
    let timeout_ms = match timeout {
      Some(timeout) => timeout.as_millis().min(i32::MAX as u128) as i32,
      None => -1,
    };

    let n = syscall!(epoll_wait(
      this.epoll_fd.as_raw_fd(),
      events.as_mut_ptr(),
      MAX_EVENTS as i32,
      timeout_ms,
    ))?;

    for event in &events[..n as usize] {
      // Packed struct: copy the fields out.
      let token = event.u64;
      let flags = event.events;

      if token == NOTIFY_KEY {
        this.drain_notifier();
        continue;
      }

      let Some(registration) = this.registrations.lock().get(token).cloned()
      else {
        trace!("epoll: event for stale token {token:#x}");
        continue;
      };

      let readiness = Readiness {
        readable: flags & READABLE != 0,
        writable: flags & WRITABLE != 0,
      };
      let epoll = Arc::clone(this);
      let job: Job =
        Box::new(move || epoll.on_ready(&registration, readiness));
      if let Err(Rejected(job)) = io_pool.submit(job) {
        job();
      }
    }
    Ok(())
  }

  fn wake(&self) -> io::Result<()> {
    let one: u64 = 1;
    let written = syscall!(write(
      self.notifier.as_raw_fd(),
      std::ptr::from_ref(&one).cast(),
      mem::size_of::<u64>(),
    ));
    match written {
      // Counter saturated: a wake-up is already pending.
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
      result => result.map(drop),
    }
  }
}

impl Drop for Epoll {
  fn drop(&mut self) {
    // Queued operations hold their sockets, which hold the registrations.
    // Abort them so that cycle does not outlive the context.
    let registrations = self.registrations.lock().drain();
    for registration in registrations {
      Self::cancel(&registration);
    }
  }
}

impl Epoll {
  fn drain_notifier(&self) {
    let mut value: u64 = 0;
    let _ = syscall!(read(
      self.notifier.as_raw_fd(),
      std::ptr::from_mut(&mut value).cast(),
      mem::size_of::<u64>(),
    ));
  }

  /// I/O pool side of a readiness event.
  fn on_ready(&self, registration: &IoRegistration, readiness: Readiness) {
    let mut finished = Vec::new();
    {
      let mut guard = registration.pending.queues.lock();
      let queues = &mut *guard;
      if queues.closed {
        return;
      }

      if readiness.readable {
        drain(&mut queues.readers, &mut finished);
      }
      if readiness.writable {
        drain(&mut queues.writers, &mut finished);
      }

      if let Err(err) = self.rearm(registration, queues) {
        warn!("epoll: rearming fd {} failed: {err}", registration.handle());
        let code = ErrorCode::from(err);
        for op in queues.readers.drain(..).chain(queues.writers.drain(..)) {
          finished.push((op, Err(code)));
        }
      }
    }

    for (op, result) in finished {
      op.complete(result);
    }
  }

  /// Arms the handle for whatever the queues are waiting on. Called with the
  /// queue lock held so arming and queueing cannot interleave.
  fn rearm(
    &self,
    registration: &IoRegistration,
    queues: &Queues,
  ) -> io::Result<()> {
    let mut interest = 0;
    if !queues.readers.is_empty() {
      interest |= libc::EPOLLIN | libc::EPOLLRDHUP;
    }
    if !queues.writers.is_empty() {
      interest |= libc::EPOLLOUT;
    }
    if interest == 0 {
      return Ok(());
    }

    let mut event = libc::epoll_event {
      events: (interest | libc::EPOLLONESHOT) as u32,
      u64: registration.token(),
    };
    syscall!(epoll_ctl(
      self.epoll_fd.as_raw_fd(),
      libc::EPOLL_CTL_MOD,
      registration.handle(),
      &mut event,
    ))
    .map(drop)
  }
}

/// Retries queue heads until one would block.
fn drain(
  queue: &mut VecDeque<Box<Operation>>,
  finished: &mut Vec<(Box<Operation>, Result<usize>)>,
) {
  while let Some(mut op) = queue.pop_front() {
    match attempt(&mut op) {
      Some(result) => finished.push((op, result.map_err(ErrorCode::from))),
      None => {
        queue.push_front(op);
        break;
      }
    }
  }
}

/// One non-blocking try. `None` means the kernel wants us to wait.
fn attempt(op: &mut Operation) -> Option<io::Result<usize>> {
  loop {
    match try_once(op) {
      Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => return None,
      Ok(None) => return None,
      Ok(Some(transferred)) => return Some(Ok(transferred)),
      Err(err) => return Some(Err(err)),
    }
  }
}

fn try_once(op: &mut Operation) -> io::Result<Option<usize>> {
  let fd = op.registration.handle();

  match op.kind {
    OpKind::Accept { .. } => {
      op.sys.accepted = sys::accept(fd)?;
      Ok(Some(0))
    }
    OpKind::Connect => try_connect(fd, op),
    OpKind::Recv => sys::recv(fd, &mut op.buf).map(Some),
    // The source address is dropped: read handlers carry no peer.
    OpKind::RecvFrom => sys::recv_from(fd, &mut op.buf).map(|(n, _)| Some(n)),
    OpKind::Send => {
      while op.sys.progress < op.buf.len() {
        op.sys.progress += sys::send(fd, &op.buf[op.sys.progress..])?;
      }
      Ok(Some(op.sys.progress))
    }
    OpKind::SendTo => match op.addr {
      Some(to) => sys::send_to(fd, &op.buf, &to).map(Some),
      None => Err(io::Error::from_raw_os_error(libc::EDESTADDRREQ)),
    },
    OpKind::Disconnect { reuse_socket } => {
      if reuse_socket {
        trace!("epoll: fd {fd} cannot be reused, half-closing instead");
      }
      sys::shutdown(fd, ShutdownHow::Write)?;
      Ok(Some(0))
    }
  }
}

fn try_connect(fd: RawFd, op: &mut Operation) -> io::Result<Option<usize>> {
  if !op.sys.connecting {
    let Some(to) = op.addr else {
      return Err(io::Error::from_raw_os_error(libc::EDESTADDRREQ));
    };
    return match sys::connect(fd, &to) {
      Ok(()) => Ok(Some(0)),
      Err(err)
        if matches!(err.raw_os_error(), Some(libc::EINPROGRESS | libc::EINTR)) =>
      {
        op.sys.connecting = true;
        Ok(None)
      }
      Err(err) => Err(err),
    };
  }

  if let Some(err) = sys::take_error(fd)? {
    return Err(err);
  }
  match sys::peer_addr(fd) {
    Ok(_) => Ok(Some(0)),
    Err(err) if err.raw_os_error() == Some(libc::ENOTCONN) => Ok(None),
    Err(err) => Err(err),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn wake_interrupts_poll() {
    let epoll = Arc::new(Epoll::open().unwrap());
    let pool = ThreadPool::new("epoll-test", 1, 1).unwrap();

    epoll.wake().unwrap();
    epoll.wake().unwrap();
    Epoll::poll(&epoll, &pool, Some(Duration::from_secs(5))).unwrap();

    // Drained: the next poll sees nothing and times out.
    let started = std::time::Instant::now();
    Epoll::poll(&epoll, &pool, Some(Duration::from_millis(30))).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(20));
  }

  #[test]
  fn associate_and_dissociate() {
    let epoll = Epoll::open().unwrap();
    let fd = sys::socket(
      crate::AddressFamily::Ipv4,
      crate::SocketType::Datagram,
      crate::Protocol::Udp,
    )
    .unwrap();

    let registration = epoll.associate(fd).unwrap();
    assert_eq!(registration.handle(), fd);
    assert_eq!(epoll.registrations.lock().len(), 1);

    // A second ADD of the same fd is refused and leaves nothing behind.
    assert!(epoll.associate(fd).is_err());
    assert_eq!(epoll.registrations.lock().len(), 1);

    epoll.dissociate(&registration);
    assert_eq!(epoll.registrations.lock().len(), 0);
    sys::close(fd).unwrap();
  }
}
