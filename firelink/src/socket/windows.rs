//! Raw WinSock calls for Windows.
//!
//! Handles are created overlapped and stay in blocking mode, so the
//! synchronous API calls straight through while the completion port serves
//! the asynchronous one.

use std::{io, mem, ptr, time::Duration};

use windows_sys::Win32::Networking::WinSock::{
  self as ws, AF_INET, AF_INET6, INVALID_SOCKET, SOCKADDR, SOCKADDR_IN,
  SOCKADDR_IN6, SOCKADDR_STORAGE, SOCKET, WSAPOLLFD,
};

use crate::endpoint::{Endpoint, Ipv4Address, Ipv6Address};
use crate::types::{AddressFamily, Protocol, ShutdownHow, SocketType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interest {
  Read,
  Write,
}

fn last_error() -> io::Error {
  // SAFETY: reads thread-local state only.
  io::Error::from_raw_os_error(unsafe { ws::WSAGetLastError() })
}

fn checked(socket: SOCKET) -> io::Result<SOCKET> {
  if socket == INVALID_SOCKET { Err(last_error()) } else { Ok(socket) }
}

fn buf_len(len: usize) -> i32 {
  i32::try_from(len).unwrap_or(i32::MAX)
}

pub(crate) fn socket(
  family: AddressFamily,
  ty: SocketType,
  protocol: Protocol,
) -> io::Result<SOCKET> {
  // SAFETY: no pointers are passed.
  checked(unsafe {
    ws::WSASocketW(
      family.as_raw(),
      ty.as_raw(),
      protocol.as_raw(),
      ptr::null(),
      0,
      ws::WSA_FLAG_OVERLAPPED | ws::WSA_FLAG_NO_HANDLE_INHERIT,
    )
  })
}

pub(crate) fn close(socket: SOCKET) -> io::Result<()> {
  wsa!(closesocket(socket)).map(drop)
}

pub(crate) fn bind(socket: SOCKET, endpoint: &Endpoint) -> io::Result<()> {
  let (storage, len) = to_sockaddr(endpoint);
  wsa!(bind(socket, ptr::from_ref(&storage).cast::<SOCKADDR>(), len)).map(drop)
}

pub(crate) fn listen(socket: SOCKET, backlog: i32) -> io::Result<()> {
  wsa!(listen(socket, backlog)).map(drop)
}

pub(crate) fn shutdown(socket: SOCKET, how: ShutdownHow) -> io::Result<()> {
  wsa!(shutdown(socket, how.as_raw())).map(drop)
}

pub(crate) fn accept(socket: SOCKET) -> io::Result<SOCKET> {
  // SAFETY: null address out-parameters are allowed.
  checked(unsafe { ws::accept(socket, ptr::null_mut(), ptr::null_mut()) })
}

pub(crate) fn connect_blocking(
  socket: SOCKET,
  endpoint: &Endpoint,
) -> io::Result<()> {
  let (storage, len) = to_sockaddr(endpoint);
  wsa!(connect(socket, ptr::from_ref(&storage).cast::<SOCKADDR>(), len))
    .map(drop)
}

pub(crate) fn recv(socket: SOCKET, buf: &mut [u8]) -> io::Result<usize> {
  wsa!(recv(socket, buf.as_mut_ptr(), buf_len(buf.len()), 0))
    .map(|n| n as usize)
}

pub(crate) fn send(socket: SOCKET, buf: &[u8]) -> io::Result<usize> {
  wsa!(send(socket, buf.as_ptr(), buf_len(buf.len()), 0)).map(|n| n as usize)
}

pub(crate) fn recv_from(
  socket: SOCKET,
  buf: &mut [u8],
) -> io::Result<(usize, Endpoint)> {
  // SAFETY: all-zero is a valid SOCKADDR_STORAGE.
  let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
  let mut len = mem::size_of::<SOCKADDR_STORAGE>() as i32;
  let n = wsa!(recvfrom(
    socket,
    buf.as_mut_ptr(),
    buf_len(buf.len()),
    0,
    ptr::from_mut(&mut storage).cast::<SOCKADDR>(),
    &mut len,
  ))?;
  Ok((n as usize, from_sockaddr(&storage)?))
}

pub(crate) fn send_to(
  socket: SOCKET,
  buf: &[u8],
  endpoint: &Endpoint,
) -> io::Result<usize> {
  let (storage, len) = to_sockaddr(endpoint);
  wsa!(sendto(
    socket,
    buf.as_ptr(),
    buf_len(buf.len()),
    0,
    ptr::from_ref(&storage).cast::<SOCKADDR>(),
    len,
  ))
  .map(|n| n as usize)
}

pub(crate) fn local_addr(socket: SOCKET) -> io::Result<Endpoint> {
  // SAFETY: all-zero is a valid SOCKADDR_STORAGE.
  let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
  let mut len = mem::size_of::<SOCKADDR_STORAGE>() as i32;
  wsa!(getsockname(
    socket,
    ptr::from_mut(&mut storage).cast::<SOCKADDR>(),
    &mut len
  ))?;
  from_sockaddr(&storage)
}

pub(crate) fn peer_addr(socket: SOCKET) -> io::Result<Endpoint> {
  // SAFETY: all-zero is a valid SOCKADDR_STORAGE.
  let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
  let mut len = mem::size_of::<SOCKADDR_STORAGE>() as i32;
  wsa!(getpeername(
    socket,
    ptr::from_mut(&mut storage).cast::<SOCKADDR>(),
    &mut len
  ))?;
  from_sockaddr(&storage)
}

pub(crate) fn set_option(
  socket: SOCKET,
  level: i32,
  name: i32,
  value: &[u8],
) -> io::Result<()> {
  wsa!(setsockopt(socket, level, name, value.as_ptr(), buf_len(value.len())))
    .map(drop)
}

pub(crate) fn get_option(
  socket: SOCKET,
  level: i32,
  name: i32,
  value: &mut [u8],
) -> io::Result<usize> {
  let mut len = buf_len(value.len());
  wsa!(getsockopt(socket, level, name, value.as_mut_ptr(), &mut len))?;
  Ok(len as usize)
}

/// Waits for `interest` on `socket`. `Ok(false)` means the timeout elapsed.
pub(crate) fn wait(
  socket: SOCKET,
  interest: Interest,
  timeout: Option<Duration>,
) -> io::Result<bool> {
  let events = match interest {
    Interest::Read => ws::POLLRDNORM,
    Interest::Write => ws::POLLWRNORM,
  };
  let timeout_ms = match timeout {
    Some(timeout) => timeout.as_millis().min(i32::MAX as u128) as i32,
    None => -1,
  };

  let mut pollfd = WSAPOLLFD { fd: socket, events, revents: 0 };
  let ready = wsa!(WSAPoll(&mut pollfd, 1, timeout_ms))?;
  Ok(ready > 0)
}

/// Handles are in blocking mode, so there is nothing to retry.
pub(crate) fn blocking<T>(
  _socket: SOCKET,
  _interest: Interest,
  mut f: impl FnMut() -> io::Result<T>,
) -> io::Result<T> {
  f()
}

pub(crate) fn to_sockaddr(endpoint: &Endpoint) -> (SOCKADDR_STORAGE, i32) {
  // SAFETY: all-zero is a valid SOCKADDR_STORAGE.
  let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
  let len = match endpoint {
    Endpoint::V4(v4) => {
      // SAFETY: all-zero is a valid SOCKADDR_IN.
      let mut addr: SOCKADDR_IN = unsafe { mem::zeroed() };
      addr.sin_family = AF_INET;
      addr.sin_port = v4.port.to_be();
      addr.sin_addr.S_un.S_addr = u32::from_ne_bytes(v4.octets);
      // SAFETY: SOCKADDR_IN fits in SOCKADDR_STORAGE, which is suitably
      // aligned for it.
      unsafe {
        ptr::write(ptr::from_mut(&mut storage).cast::<SOCKADDR_IN>(), addr)
      };
      mem::size_of::<SOCKADDR_IN>()
    }
    Endpoint::V6(v6) => {
      // SAFETY: all-zero is a valid SOCKADDR_IN6.
      let mut addr: SOCKADDR_IN6 = unsafe { mem::zeroed() };
      addr.sin6_family = AF_INET6;
      addr.sin6_port = v6.port.to_be();
      addr.sin6_addr.u.Byte = v6.octets;
      // SAFETY: as above, for SOCKADDR_IN6.
      unsafe {
        ptr::write(ptr::from_mut(&mut storage).cast::<SOCKADDR_IN6>(), addr)
      };
      mem::size_of::<SOCKADDR_IN6>()
    }
  };
  (storage, len as i32)
}

pub(crate) fn from_sockaddr(storage: &SOCKADDR_STORAGE) -> io::Result<Endpoint> {
  match storage.ss_family {
    AF_INET => {
      // SAFETY: family says the storage holds a SOCKADDR_IN.
      let addr = unsafe { &*ptr::from_ref(storage).cast::<SOCKADDR_IN>() };
      // SAFETY: every view of the address union is four plain bytes.
      let raw = unsafe { addr.sin_addr.S_un.S_addr };
      Ok(Endpoint::V4(Ipv4Address::new(
        raw.to_ne_bytes(),
        u16::from_be(addr.sin_port),
      )))
    }
    AF_INET6 => {
      // SAFETY: family says the storage holds a SOCKADDR_IN6.
      let addr = unsafe { &*ptr::from_ref(storage).cast::<SOCKADDR_IN6>() };
      // SAFETY: every view of the address union is sixteen plain bytes.
      let octets = unsafe { addr.sin6_addr.u.Byte };
      Ok(Endpoint::V6(Ipv6Address::new(octets, u16::from_be(addr.sin6_port))))
    }
    _ => Err(io::Error::from_raw_os_error(ws::WSAEAFNOSUPPORT)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sockaddr_round_trip() {
    let endpoints = [
      Endpoint::V4(Ipv4Address::new([10, 0, 0, 7], 9000)),
      Endpoint::V6(Ipv6Address::loopback(443)),
    ];
    for endpoint in endpoints {
      let (storage, _) = to_sockaddr(&endpoint);
      assert_eq!(from_sockaddr(&storage).unwrap(), endpoint);
    }
  }
}
