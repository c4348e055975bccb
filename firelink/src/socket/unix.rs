//! Raw socket calls for Linux.
//!
//! Every handle is non-blocking. The `blocking*` helpers give the
//! synchronous API its blocking behaviour by waiting in `poll(2)`.

use std::{
  io, mem,
  os::fd::RawFd,
  ptr,
  time::{Duration, Instant},
};

use crate::endpoint::{Endpoint, Ipv4Address, Ipv6Address};
use crate::types::{AddressFamily, Protocol, ShutdownHow, SocketType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interest {
  Read,
  Write,
}

pub(crate) fn socket(
  family: AddressFamily,
  ty: SocketType,
  protocol: Protocol,
) -> io::Result<RawFd> {
  syscall!(socket(
    family.as_raw(),
    ty.as_raw() | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    protocol.as_raw(),
  ))
}

pub(crate) fn close(fd: RawFd) -> io::Result<()> {
  syscall!(close(fd)).map(drop)
}

pub(crate) fn bind(fd: RawFd, endpoint: &Endpoint) -> io::Result<()> {
  let (storage, len) = to_sockaddr(endpoint);
  syscall!(bind(fd, ptr::from_ref(&storage).cast(), len)).map(drop)
}

pub(crate) fn listen(fd: RawFd, backlog: i32) -> io::Result<()> {
  syscall!(listen(fd, backlog)).map(drop)
}

pub(crate) fn shutdown(fd: RawFd, how: ShutdownHow) -> io::Result<()> {
  syscall!(shutdown(fd, how.as_raw())).map(drop)
}

pub(crate) fn accept(fd: RawFd) -> io::Result<RawFd> {
  syscall!(accept4(
    fd,
    ptr::null_mut(),
    ptr::null_mut(),
    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
  ))
}

/// Starts a connect. `EINPROGRESS` comes back as an error.
pub(crate) fn connect(fd: RawFd, endpoint: &Endpoint) -> io::Result<()> {
  let (storage, len) = to_sockaddr(endpoint);
  syscall!(connect(fd, ptr::from_ref(&storage).cast(), len)).map(drop)
}

/// Pending `SO_ERROR`, cleared by reading it.
pub(crate) fn take_error(fd: RawFd) -> io::Result<Option<io::Error>> {
  let mut code: libc::c_int = 0;
  get_option(
    fd,
    libc::SOL_SOCKET,
    libc::SO_ERROR,
    bytes_of_mut(&mut code),
  )?;
  Ok((code != 0).then(|| io::Error::from_raw_os_error(code)))
}

pub(crate) fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
  syscall!(recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0)).map(|n| n as usize)
}

pub(crate) fn send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
  syscall!(send(fd, buf.as_ptr().cast(), buf.len(), libc::MSG_NOSIGNAL))
    .map(|n| n as usize)
}

pub(crate) fn recv_from(
  fd: RawFd,
  buf: &mut [u8],
) -> io::Result<(usize, Endpoint)> {
  // SAFETY: all-zero is a valid sockaddr_storage.
  let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
  let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
  let n = syscall!(recvfrom(
    fd,
    buf.as_mut_ptr().cast(),
    buf.len(),
    0,
    ptr::from_mut(&mut storage).cast(),
    &mut len,
  ))?;
  Ok((n as usize, from_sockaddr(&storage)?))
}

pub(crate) fn send_to(
  fd: RawFd,
  buf: &[u8],
  endpoint: &Endpoint,
) -> io::Result<usize> {
  let (storage, len) = to_sockaddr(endpoint);
  syscall!(sendto(
    fd,
    buf.as_ptr().cast(),
    buf.len(),
    libc::MSG_NOSIGNAL,
    ptr::from_ref(&storage).cast(),
    len,
  ))
  .map(|n| n as usize)
}

pub(crate) fn local_addr(fd: RawFd) -> io::Result<Endpoint> {
  // SAFETY: all-zero is a valid sockaddr_storage.
  let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
  let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
  syscall!(getsockname(fd, ptr::from_mut(&mut storage).cast(), &mut len))?;
  from_sockaddr(&storage)
}

pub(crate) fn peer_addr(fd: RawFd) -> io::Result<Endpoint> {
  // SAFETY: all-zero is a valid sockaddr_storage.
  let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
  let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
  syscall!(getpeername(fd, ptr::from_mut(&mut storage).cast(), &mut len))?;
  from_sockaddr(&storage)
}

pub(crate) fn set_option(
  fd: RawFd,
  level: i32,
  name: i32,
  value: &[u8],
) -> io::Result<()> {
  syscall!(setsockopt(
    fd,
    level,
    name,
    value.as_ptr().cast(),
    value.len() as libc::socklen_t,
  ))
  .map(drop)
}

pub(crate) fn get_option(
  fd: RawFd,
  level: i32,
  name: i32,
  value: &mut [u8],
) -> io::Result<usize> {
  let mut len = value.len() as libc::socklen_t;
  syscall!(getsockopt(fd, level, name, value.as_mut_ptr().cast(), &mut len))?;
  Ok(len as usize)
}

/// Waits for `interest` on `fd`. `Ok(false)` means the timeout elapsed.
pub(crate) fn wait(
  fd: RawFd,
  interest: Interest,
  timeout: Option<Duration>,
) -> io::Result<bool> {
  let events = match interest {
    Interest::Read => libc::POLLIN,
    Interest::Write => libc::POLLOUT,
  };
  let deadline = timeout.map(|timeout| Instant::now() + timeout);

  loop {
    let timeout_ms = match deadline {
      Some(deadline) => {
        let ms = deadline.saturating_duration_since(Instant::now()).as_millis();
        if ms > i32::MAX as u128 { i32::MAX } else { ms as i32 }
      }
      None => -1,
    };

    let mut pollfd = libc::pollfd { fd, events, revents: 0 };
    match syscall!(poll(&mut pollfd, 1, timeout_ms)) {
      Ok(0) => return Ok(false),
      Ok(_) => return Ok(true),
      Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
      Err(err) => return Err(err),
    }
  }
}

/// Retries `f` until it stops reporting `WouldBlock`, waiting for
/// `interest` in between.
pub(crate) fn blocking<T>(
  fd: RawFd,
  interest: Interest,
  mut f: impl FnMut() -> io::Result<T>,
) -> io::Result<T> {
  loop {
    match f() {
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
        wait(fd, interest, None)?;
      }
      Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
      result => return result,
    }
  }
}

pub(crate) fn connect_blocking(fd: RawFd, endpoint: &Endpoint) -> io::Result<()> {
  match connect(fd, endpoint) {
    Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {
      wait(fd, Interest::Write, None)?;
      match take_error(fd)? {
        Some(err) => Err(err),
        None => Ok(()),
      }
    }
    result => result,
  }
}

fn bytes_of_mut(value: &mut libc::c_int) -> &mut [u8] {
  // SAFETY: c_int is plain data; the slice covers exactly its bytes.
  unsafe {
    std::slice::from_raw_parts_mut(
      ptr::from_mut(value).cast::<u8>(),
      mem::size_of::<libc::c_int>(),
    )
  }
}

pub(crate) fn to_sockaddr(
  endpoint: &Endpoint,
) -> (libc::sockaddr_storage, libc::socklen_t) {
  // SAFETY: all-zero is a valid sockaddr_storage.
  let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
  let len = match endpoint {
    Endpoint::V4(v4) => {
      let addr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: v4.port.to_be(),
        sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(v4.octets) },
        sin_zero: [0; 8],
      };
      // SAFETY: sockaddr_in fits in sockaddr_storage, which is suitably
      // aligned for it.
      unsafe {
        ptr::write(ptr::from_mut(&mut storage).cast::<libc::sockaddr_in>(), addr)
      };
      mem::size_of::<libc::sockaddr_in>()
    }
    Endpoint::V6(v6) => {
      let addr = libc::sockaddr_in6 {
        sin6_family: libc::AF_INET6 as libc::sa_family_t,
        sin6_port: v6.port.to_be(),
        sin6_flowinfo: 0,
        sin6_addr: libc::in6_addr { s6_addr: v6.octets },
        sin6_scope_id: 0,
      };
      // SAFETY: as above, for sockaddr_in6.
      unsafe {
        ptr::write(
          ptr::from_mut(&mut storage).cast::<libc::sockaddr_in6>(),
          addr,
        )
      };
      mem::size_of::<libc::sockaddr_in6>()
    }
  };
  (storage, len as libc::socklen_t)
}

pub(crate) fn from_sockaddr(
  storage: &libc::sockaddr_storage,
) -> io::Result<Endpoint> {
  match storage.ss_family as libc::c_int {
    libc::AF_INET => {
      // SAFETY: family says the storage holds a sockaddr_in.
      let addr = unsafe {
        &*ptr::from_ref(storage).cast::<libc::sockaddr_in>()
      };
      Ok(Endpoint::V4(Ipv4Address::new(
        addr.sin_addr.s_addr.to_ne_bytes(),
        u16::from_be(addr.sin_port),
      )))
    }
    libc::AF_INET6 => {
      // SAFETY: family says the storage holds a sockaddr_in6.
      let addr = unsafe {
        &*ptr::from_ref(storage).cast::<libc::sockaddr_in6>()
      };
      Ok(Endpoint::V6(Ipv6Address::new(
        addr.sin6_addr.s6_addr,
        u16::from_be(addr.sin6_port),
      )))
    }
    _ => Err(io::Error::from_raw_os_error(libc::EAFNOSUPPORT)),
  }
}
