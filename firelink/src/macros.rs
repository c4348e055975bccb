/// Calls a `libc` function and turns a `-1` return into the thread's last
/// OS error.
#[cfg(unix)]
macro_rules! syscall {
  ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
      #[allow(unused_unsafe)]
      let res = unsafe { libc::$fn($($arg, )*) };
      if res == -1 {
          Err(std::io::Error::last_os_error())
      } else {
          Ok(res)
      }
  }};
}

/// Calls a WinSock function and turns `SOCKET_ERROR` into the last WSA
/// error.
#[cfg(windows)]
macro_rules! wsa {
  ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
      #[allow(unused_unsafe)]
      let res = unsafe { windows_sys::Win32::Networking::WinSock::$fn($($arg, )*) };
      if res == windows_sys::Win32::Networking::WinSock::SOCKET_ERROR {
          Err(std::io::Error::from_raw_os_error(unsafe {
            windows_sys::Win32::Networking::WinSock::WSAGetLastError()
          }))
      } else {
          Ok(res)
      }
  }};
}
