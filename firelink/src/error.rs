//! Portable error codes.
//!
//! Every fallible call in this crate reports one [`ErrorCode`]. Platform
//! failures (errno on Linux, WSA/Win32 codes on Windows) are folded into the
//! portable set by [`ErrorCode::from_raw_os_error`].

use std::io;

/// `Result` alias used across the public API. The `Err` side never holds
/// [`ErrorCode::Success`].
pub type Result<T> = std::result::Result<T, ErrorCode>;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
  #[error("unmapped system error")]
  SystemError,
  #[error("platform not supported")]
  PlatformNotSupported,
  #[error("success")]
  Success,
  #[error("execution context not initialized")]
  NotInitialized,
  #[error("not supported")]
  NotSupported,
  #[error("process or handle limit reached")]
  ProcLimitReached,
  #[error("operation would block")]
  WouldBlock,
  #[error("operation now in progress")]
  InProgress,
  #[error("operation already in progress")]
  AlreadyInProgress,
  #[error("handle is not a socket")]
  NotASocket,
  #[error("destination address required")]
  DestinationAddressRequired,
  #[error("message too long")]
  MessageTooLong,
  #[error("protocol wrong type for socket")]
  WrongProtocol,
  #[error("protocol option unavailable")]
  ProtocolOptionUnavailable,
  #[error("protocol not supported")]
  ProtocolNotSupported,
  #[error("socket type not supported")]
  SocketTypeNotSupported,
  #[error("operation not supported on socket")]
  OperationNotSupported,
  #[error("address family not supported")]
  AddressFamilyNotSupported,
  #[error("address already in use")]
  AddressInUse,
  #[error("address not available")]
  AddressNotAvailable,
  #[error("network is down")]
  NetworkDown,
  #[error("network is unreachable")]
  NetworkUnreachable,
  #[error("network dropped connection on reset")]
  NetworkReset,
  #[error("connection aborted")]
  ConnectionAborted,
  #[error("connection reset by peer")]
  ConnectionReset,
  #[error("no buffer space available")]
  NoBufferSpace,
  #[error("socket is already connected")]
  AlreadyConnected,
  #[error("socket is not connected")]
  NotConnected,
  #[error("socket has been shut down")]
  SocketShutdown,
  #[error("timed out")]
  TimedOut,
  #[error("connection refused")]
  ConnectionRefused,
  #[error("host not found")]
  HostNotFound,
  #[error("host is down")]
  HostDown,
  #[error("host is unreachable")]
  HostUnreachable,
  #[error("invalid argument")]
  InvalidArgument,
  #[error("operation aborted")]
  OperationAborted,
}

impl ErrorCode {
  pub fn is_success(self) -> bool {
    self == ErrorCode::Success
  }

  /// `Ok(())` for [`ErrorCode::Success`], `Err(self)` otherwise.
  pub fn into_result(self) -> Result<()> {
    if self.is_success() { Ok(()) } else { Err(self) }
  }

  /// Folds a `Result<()>` back into a single code.
  pub fn from_result(result: Result<()>) -> ErrorCode {
    match result {
      Ok(()) => ErrorCode::Success,
      Err(code) => code,
    }
  }

  #[cfg(unix)]
  pub fn from_raw_os_error(code: i32) -> ErrorCode {
    match code {
      0 => ErrorCode::Success,
      libc::EAGAIN => ErrorCode::WouldBlock,
      libc::EINPROGRESS => ErrorCode::InProgress,
      libc::EALREADY => ErrorCode::AlreadyInProgress,
      libc::ENOTSOCK | libc::EBADF => ErrorCode::NotASocket,
      libc::EDESTADDRREQ => ErrorCode::DestinationAddressRequired,
      libc::EMSGSIZE => ErrorCode::MessageTooLong,
      libc::EPROTOTYPE => ErrorCode::WrongProtocol,
      libc::ENOPROTOOPT => ErrorCode::ProtocolOptionUnavailable,
      libc::EPROTONOSUPPORT => ErrorCode::ProtocolNotSupported,
      libc::ESOCKTNOSUPPORT => ErrorCode::SocketTypeNotSupported,
      libc::EOPNOTSUPP => ErrorCode::OperationNotSupported,
      libc::EAFNOSUPPORT => ErrorCode::AddressFamilyNotSupported,
      libc::EADDRINUSE => ErrorCode::AddressInUse,
      libc::EADDRNOTAVAIL => ErrorCode::AddressNotAvailable,
      libc::ENETDOWN => ErrorCode::NetworkDown,
      libc::ENETUNREACH => ErrorCode::NetworkUnreachable,
      libc::ENETRESET => ErrorCode::NetworkReset,
      libc::ECONNABORTED => ErrorCode::ConnectionAborted,
      libc::ECONNRESET => ErrorCode::ConnectionReset,
      libc::ENOBUFS | libc::ENOMEM => ErrorCode::NoBufferSpace,
      libc::EISCONN => ErrorCode::AlreadyConnected,
      libc::ENOTCONN => ErrorCode::NotConnected,
      libc::ESHUTDOWN | libc::EPIPE => ErrorCode::SocketShutdown,
      libc::ETIMEDOUT => ErrorCode::TimedOut,
      libc::ECONNREFUSED => ErrorCode::ConnectionRefused,
      libc::EHOSTDOWN => ErrorCode::HostDown,
      libc::EHOSTUNREACH => ErrorCode::HostUnreachable,
      libc::EINVAL => ErrorCode::InvalidArgument,
      libc::EMFILE | libc::ENFILE => ErrorCode::ProcLimitReached,
      libc::ECANCELED => ErrorCode::OperationAborted,
      libc::ENOSYS => ErrorCode::NotSupported,
      _ => ErrorCode::SystemError,
    }
  }

  #[cfg(windows)]
  pub fn from_raw_os_error(code: i32) -> ErrorCode {
    use windows_sys::Win32::Networking::WinSock::*;

    // Win32 codes surfaced by overlapped socket completions.
    const ERROR_NETNAME_DELETED: i32 = 64;
    const ERROR_CONNECTION_REFUSED: i32 = 1225;
    const ERROR_CONNECTION_ABORTED: i32 = 1236;
    const ERROR_SEM_TIMEOUT: i32 = 121;

    match code {
      0 => ErrorCode::Success,
      WSAEWOULDBLOCK => ErrorCode::WouldBlock,
      WSAEINPROGRESS => ErrorCode::InProgress,
      WSAEALREADY => ErrorCode::AlreadyInProgress,
      WSAENOTSOCK => ErrorCode::NotASocket,
      WSAEDESTADDRREQ => ErrorCode::DestinationAddressRequired,
      WSAEMSGSIZE => ErrorCode::MessageTooLong,
      WSAEPROTOTYPE => ErrorCode::WrongProtocol,
      WSAENOPROTOOPT => ErrorCode::ProtocolOptionUnavailable,
      WSAEPROTONOSUPPORT => ErrorCode::ProtocolNotSupported,
      WSAESOCKTNOSUPPORT => ErrorCode::SocketTypeNotSupported,
      WSAEOPNOTSUPP => ErrorCode::OperationNotSupported,
      WSAEAFNOSUPPORT => ErrorCode::AddressFamilyNotSupported,
      WSAEADDRINUSE => ErrorCode::AddressInUse,
      WSAEADDRNOTAVAIL => ErrorCode::AddressNotAvailable,
      WSAENETDOWN => ErrorCode::NetworkDown,
      WSAENETUNREACH => ErrorCode::NetworkUnreachable,
      WSAENETRESET => ErrorCode::NetworkReset,
      WSAECONNABORTED | ERROR_CONNECTION_ABORTED => {
        ErrorCode::ConnectionAborted
      }
      WSAECONNRESET | ERROR_NETNAME_DELETED => ErrorCode::ConnectionReset,
      WSAENOBUFS => ErrorCode::NoBufferSpace,
      WSAEISCONN => ErrorCode::AlreadyConnected,
      WSAENOTCONN => ErrorCode::NotConnected,
      WSAESHUTDOWN => ErrorCode::SocketShutdown,
      WSAETIMEDOUT | ERROR_SEM_TIMEOUT => ErrorCode::TimedOut,
      WSAECONNREFUSED | ERROR_CONNECTION_REFUSED => {
        ErrorCode::ConnectionRefused
      }
      WSAHOST_NOT_FOUND => ErrorCode::HostNotFound,
      WSAEHOSTDOWN => ErrorCode::HostDown,
      WSAEHOSTUNREACH => ErrorCode::HostUnreachable,
      WSAEINVAL | WSAEFAULT => ErrorCode::InvalidArgument,
      WSAEMFILE | WSAEPROCLIM => ErrorCode::ProcLimitReached,
      WSANOTINITIALISED => ErrorCode::NotInitialized,
      WSA_OPERATION_ABORTED => ErrorCode::OperationAborted,
      WSAVERNOTSUPPORTED | WSASYSNOTREADY => ErrorCode::PlatformNotSupported,
      _ => ErrorCode::SystemError,
    }
  }

  /// The calling thread's last OS error.
  pub fn last_os_error() -> ErrorCode {
    io::Error::last_os_error().into()
  }
}

impl From<io::Error> for ErrorCode {
  fn from(err: io::Error) -> Self {
    if let Some(code) = err.raw_os_error() {
      return ErrorCode::from_raw_os_error(code);
    }

    match err.kind() {
      io::ErrorKind::WouldBlock => ErrorCode::WouldBlock,
      io::ErrorKind::InvalidInput => ErrorCode::InvalidArgument,
      io::ErrorKind::TimedOut => ErrorCode::TimedOut,
      io::ErrorKind::Unsupported => ErrorCode::NotSupported,
      io::ErrorKind::ConnectionRefused => ErrorCode::ConnectionRefused,
      io::ErrorKind::ConnectionReset => ErrorCode::ConnectionReset,
      io::ErrorKind::ConnectionAborted => ErrorCode::ConnectionAborted,
      io::ErrorKind::NotConnected => ErrorCode::NotConnected,
      io::ErrorKind::AddrInUse => ErrorCode::AddressInUse,
      io::ErrorKind::AddrNotAvailable => ErrorCode::AddressNotAvailable,
      io::ErrorKind::OutOfMemory => ErrorCode::NoBufferSpace,
      _ => ErrorCode::SystemError,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn success_round_trips_through_result() {
    assert_eq!(ErrorCode::Success.into_result(), Ok(()));
    assert_eq!(ErrorCode::from_result(Ok(())), ErrorCode::Success);
    assert_eq!(
      ErrorCode::from_result(ErrorCode::TimedOut.into_result()),
      ErrorCode::TimedOut
    );
  }

  #[test]
  fn unknown_code_is_system_error() {
    assert_eq!(ErrorCode::from_raw_os_error(0x7fff_0000), ErrorCode::SystemError);
  }

  #[cfg(unix)]
  #[test]
  fn maps_common_errno_values() {
    let cases = [
      (libc::EAGAIN, ErrorCode::WouldBlock),
      (libc::EINPROGRESS, ErrorCode::InProgress),
      (libc::ECONNREFUSED, ErrorCode::ConnectionRefused),
      (libc::ECONNRESET, ErrorCode::ConnectionReset),
      (libc::EADDRINUSE, ErrorCode::AddressInUse),
      (libc::ENOTCONN, ErrorCode::NotConnected),
      (libc::EINVAL, ErrorCode::InvalidArgument),
      (libc::EMFILE, ErrorCode::ProcLimitReached),
    ];
    for (errno, expected) in cases {
      assert_eq!(ErrorCode::from_raw_os_error(errno), expected, "errno {errno}");
    }
  }

  #[cfg(unix)]
  #[test]
  fn io_error_prefers_raw_code() {
    let err = io::Error::from_raw_os_error(libc::ETIMEDOUT);
    assert_eq!(ErrorCode::from(err), ErrorCode::TimedOut);
  }

  #[test]
  fn io_error_without_code_uses_kind() {
    let err = io::Error::new(io::ErrorKind::InvalidInput, "bad");
    assert_eq!(ErrorCode::from(err), ErrorCode::InvalidArgument);

    let err = io::Error::other("mystery");
    assert_eq!(ErrorCode::from(err), ErrorCode::SystemError);
  }

  #[test]
  fn display_is_human_readable() {
    assert_eq!(ErrorCode::ConnectionRefused.to_string(), "connection refused");
  }
}
