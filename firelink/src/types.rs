//! Socket parameter enums and their native encodings.

#[cfg(unix)]
use libc as sys;
#[cfg(windows)]
use windows_sys::Win32::Networking::WinSock as sys;

/// OS-level socket descriptor.
#[cfg(unix)]
pub type NativeHandle = std::os::fd::RawFd;
/// OS-level socket descriptor.
#[cfg(windows)]
pub type NativeHandle = windows_sys::Win32::Networking::WinSock::SOCKET;

#[cfg(unix)]
pub(crate) const INVALID_HANDLE: NativeHandle = -1;
#[cfg(windows)]
pub(crate) const INVALID_HANDLE: NativeHandle = sys::INVALID_SOCKET;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
  Unspecified,
  Ipv4,
  Ipv6,
}

impl AddressFamily {
  pub(crate) fn as_raw(self) -> i32 {
    match self {
      AddressFamily::Unspecified => sys::AF_UNSPEC as i32,
      AddressFamily::Ipv4 => sys::AF_INET as i32,
      AddressFamily::Ipv6 => sys::AF_INET6 as i32,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketType {
  Stream,
  Datagram,
}

impl SocketType {
  pub(crate) fn as_raw(self) -> i32 {
    match self {
      SocketType::Stream => sys::SOCK_STREAM as i32,
      SocketType::Datagram => sys::SOCK_DGRAM as i32,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
  Tcp,
  Udp,
}

impl Protocol {
  pub(crate) fn as_raw(self) -> i32 {
    match self {
      Protocol::Tcp => sys::IPPROTO_TCP as i32,
      Protocol::Udp => sys::IPPROTO_UDP as i32,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownHow {
  Read,
  Write,
  Both,
}

impl ShutdownHow {
  #[cfg(unix)]
  pub(crate) fn as_raw(self) -> i32 {
    match self {
      ShutdownHow::Read => libc::SHUT_RD,
      ShutdownHow::Write => libc::SHUT_WR,
      ShutdownHow::Both => libc::SHUT_RDWR,
    }
  }

  #[cfg(windows)]
  pub(crate) fn as_raw(self) -> i32 {
    match self {
      ShutdownHow::Read => sys::SD_RECEIVE as i32,
      ShutdownHow::Write => sys::SD_SEND as i32,
      ShutdownHow::Both => sys::SD_BOTH as i32,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketOptionLevel {
  Socket,
  Ip,
  Ipv6,
  Tcp,
  Udp,
}

impl SocketOptionLevel {
  pub(crate) fn as_raw(self) -> i32 {
    match self {
      SocketOptionLevel::Socket => sys::SOL_SOCKET as i32,
      SocketOptionLevel::Ip => sys::IPPROTO_IP as i32,
      SocketOptionLevel::Ipv6 => sys::IPPROTO_IPV6 as i32,
      SocketOptionLevel::Tcp => sys::IPPROTO_TCP as i32,
      SocketOptionLevel::Udp => sys::IPPROTO_UDP as i32,
    }
  }
}

/// Option names passed through to `setsockopt`/`getsockopt` unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketOption {
  ReuseAddress,
  KeepAlive,
  ReceiveBuffer,
  SendBuffer,
  Broadcast,
  Linger,
  ReceiveTimeout,
  SendTimeout,
  NoDelay,
  IpTtl,
  Ipv6Only,
}

impl SocketOption {
  pub(crate) fn as_raw(self) -> i32 {
    match self {
      SocketOption::ReuseAddress => sys::SO_REUSEADDR as i32,
      SocketOption::KeepAlive => sys::SO_KEEPALIVE as i32,
      SocketOption::ReceiveBuffer => sys::SO_RCVBUF as i32,
      SocketOption::SendBuffer => sys::SO_SNDBUF as i32,
      SocketOption::Broadcast => sys::SO_BROADCAST as i32,
      SocketOption::Linger => sys::SO_LINGER as i32,
      SocketOption::ReceiveTimeout => sys::SO_RCVTIMEO as i32,
      SocketOption::SendTimeout => sys::SO_SNDTIMEO as i32,
      SocketOption::NoDelay => sys::TCP_NODELAY as i32,
      SocketOption::IpTtl => sys::IP_TTL as i32,
      SocketOption::Ipv6Only => sys::IPV6_V6ONLY as i32,
    }
  }
}
