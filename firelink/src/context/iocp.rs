//! I/O completion port backend.
//!
//! Every operation's `OVERLAPPED` is the first field of its leaked box. The
//! port hands that pointer back on completion and the harvester turns it
//! into the box again, so ownership moves OS -> harvester -> I/O pool.

use std::{
  io, mem, ptr,
  sync::{
    Arc, OnceLock,
    atomic::{AtomicU64, Ordering},
  },
  time::Duration,
};

use log::trace;
use windows_sys::Win32::{
  Foundation::{
    CloseHandle, ERROR_NOT_FOUND, GetLastError, HANDLE, WAIT_TIMEOUT,
  },
  Networking::WinSock::{
    self as ws, SOCKADDR, SOCKADDR_STORAGE, SOCKET, WSABUF, WSADATA,
  },
  System::IO::{
    CancelIoEx, CreateIoCompletionPort, GetQueuedCompletionStatus, OVERLAPPED,
    PostQueuedCompletionStatus,
  },
};

use super::{Backend, IoRegistration, Job, Rejected, ThreadPool};
use crate::error::{ErrorCode, Result};
use crate::op::{OpKind, Operation};
use crate::socket::sys;
use crate::types::NativeHandle;

/// Space AcceptEx needs for one address.
const ACCEPT_ADDR_LEN: usize = mem::size_of::<SOCKADDR_STORAGE>() + 16;

pub(crate) struct Iocp {
  port: HANDLE,
  next_token: AtomicU64,
}

// SAFETY: a completion port handle may be used from any thread.
unsafe impl Send for Iocp {}
// SAFETY: as above.
unsafe impl Sync for Iocp {}

/// Nothing to keep per handle: the port tracks pending operations itself.
#[derive(Default)]
pub(crate) struct Pending;

#[repr(C)]
pub(crate) struct OpState {
  /// Must stay first. See the module docs.
  overlapped: OVERLAPPED,
  flags: u32,
  addr: SOCKADDR_STORAGE,
  addr_len: i32,
  accept_buf: [u8; 2 * ACCEPT_ADDR_LEN],
}

impl Default for OpState {
  fn default() -> Self {
    // SAFETY: every field is plain data for which all-zero is valid.
    unsafe { mem::zeroed() }
  }
}

type AcceptExFn = unsafe extern "system" fn(
  listen: SOCKET,
  accept: SOCKET,
  output: *mut core::ffi::c_void,
  receive_len: u32,
  local_len: u32,
  remote_len: u32,
  received: *mut u32,
  overlapped: *mut OVERLAPPED,
) -> i32;

type ConnectExFn = unsafe extern "system" fn(
  socket: SOCKET,
  name: *const SOCKADDR,
  name_len: i32,
  send: *const core::ffi::c_void,
  send_len: u32,
  sent: *mut u32,
  overlapped: *mut OVERLAPPED,
) -> i32;

type DisconnectExFn = unsafe extern "system" fn(
  socket: SOCKET,
  overlapped: *mut OVERLAPPED,
  flags: u32,
  reserved: u32,
) -> i32;

/// WinSock extension functions, resolved once per process.
struct Extensions {
  accept_ex: AcceptExFn,
  connect_ex: ConnectExFn,
  disconnect_ex: DisconnectExFn,
}

static EXTENSIONS: OnceLock<Extensions> = OnceLock::new();

const WSAID_ACCEPTEX: windows_sys::core::GUID = windows_sys::core::GUID {
  data1: 0xb5367df1,
  data2: 0xcbac,
  data3: 0x11cf,
  data4: [0x95, 0xca, 0x00, 0x80, 0x5f, 0x48, 0xa1, 0x92],
};
const WSAID_CONNECTEX: windows_sys::core::GUID = windows_sys::core::GUID {
  data1: 0x25a207b9,
  data2: 0xddf3,
  data3: 0x4660,
  data4: [0x8e, 0xe9, 0x76, 0xe5, 0x8c, 0x74, 0x06, 0x3e],
};
const WSAID_DISCONNECTEX: windows_sys::core::GUID = windows_sys::core::GUID {
  data1: 0x7fda2e11,
  data2: 0x8630,
  data3: 0x436f,
  data4: [0xa0, 0x31, 0xf5, 0x36, 0xa6, 0xee, 0xc1, 0x57],
};

fn resolve(socket: SOCKET, guid: &windows_sys::core::GUID) -> io::Result<usize> {
  let mut function: usize = 0;
  let mut returned: u32 = 0;
  wsa!(WSAIoctl(
    socket,
    ws::SIO_GET_EXTENSION_FUNCTION_POINTER,
    ptr::from_ref(guid).cast(),
    mem::size_of::<windows_sys::core::GUID>() as u32,
    ptr::from_mut(&mut function).cast(),
    mem::size_of::<usize>() as u32,
    &mut returned,
    ptr::null_mut(),
    None,
  ))?;
  if function == 0 {
    return Err(io::Error::from_raw_os_error(ws::WSAEOPNOTSUPP));
  }
  Ok(function)
}

fn extensions(socket: SOCKET) -> io::Result<&'static Extensions> {
  if let Some(extensions) = EXTENSIONS.get() {
    return Ok(extensions);
  }

  let accept_ex = resolve(socket, &WSAID_ACCEPTEX)?;
  let connect_ex = resolve(socket, &WSAID_CONNECTEX)?;
  let disconnect_ex = resolve(socket, &WSAID_DISCONNECTEX)?;
  // SAFETY: WSAIoctl returned these pointers for exactly these GUIDs, whose
  // signatures the aliases above spell out.
  let resolved = unsafe {
    Extensions {
      accept_ex: mem::transmute::<usize, AcceptExFn>(accept_ex),
      connect_ex: mem::transmute::<usize, ConnectExFn>(connect_ex),
      disconnect_ex: mem::transmute::<usize, DisconnectExFn>(disconnect_ex),
    }
  };
  Ok(EXTENSIONS.get_or_init(|| resolved))
}

/// Maps a `BOOL`-returning overlapped call onto "queued or failed".
fn issued(ok: bool) -> io::Result<()> {
  if ok {
    return Ok(());
  }
  // SAFETY: reads thread-local state only.
  let code = unsafe { ws::WSAGetLastError() };
  if code == ws::WSA_IO_PENDING {
    Ok(())
  } else {
    Err(io::Error::from_raw_os_error(code))
  }
}

/// Starts the overlapped call for `op`.
///
/// # Safety
///
/// `op` must come from `Box::into_raw`. On `Ok` the completion port owns it
/// and the caller must not touch it again. On `Err` nothing was queued and
/// the caller still owns it.
unsafe fn issue(op: *mut Operation) -> io::Result<()> {
  // SAFETY: the caller passes a live, uniquely owned operation. The
  // reference is not used past the system call.
  let op = unsafe { &mut *op };
  let handle = op.registration.handle();
  let overlapped = ptr::from_mut(&mut op.sys.overlapped);
  let mut wsabuf = WSABUF {
    len: u32::try_from(op.buf.len()).unwrap_or(u32::MAX),
    buf: op.buf.as_mut_ptr(),
  };

  match op.kind {
    OpKind::Accept { ref target } => {
      let accept_ex = extensions(handle)?.accept_ex;
      let target = target.native_handle();
      let output = op.sys.accept_buf.as_mut_ptr().cast();
      let mut received = 0u32;
      // SAFETY: the output buffer lives in the operation until completion.
      let ok = unsafe {
        accept_ex(
          handle,
          target,
          output,
          0,
          ACCEPT_ADDR_LEN as u32,
          ACCEPT_ADDR_LEN as u32,
          &mut received,
          overlapped,
        )
      };
      issued(ok != 0)
    }
    OpKind::Connect => {
      let connect_ex = extensions(handle)?.connect_ex;
      let Some(to) = op.addr else {
        return Err(io::Error::from_raw_os_error(ws::WSAEDESTADDRREQ));
      };
      let (storage, len) = sys::to_sockaddr(&to);
      op.sys.addr = storage;
      let name = ptr::from_ref(&op.sys.addr).cast::<SOCKADDR>();
      // SAFETY: the address lives in the operation until completion.
      let ok = unsafe {
        connect_ex(handle, name, len, ptr::null(), 0, ptr::null_mut(), overlapped)
      };
      issued(ok != 0)
    }
    OpKind::Recv => {
      let flags = ptr::from_mut(&mut op.sys.flags);
      // SAFETY: buffer and flags live in the operation until completion.
      let ret = unsafe {
        ws::WSARecv(handle, &wsabuf, 1, ptr::null_mut(), flags, overlapped, None)
      };
      issued(ret == 0)
    }
    OpKind::RecvFrom => {
      op.sys.addr_len = mem::size_of::<SOCKADDR_STORAGE>() as i32;
      let flags = ptr::from_mut(&mut op.sys.flags);
      let from = ptr::from_mut(&mut op.sys.addr).cast::<SOCKADDR>();
      let from_len = ptr::from_mut(&mut op.sys.addr_len);
      // SAFETY: buffer, flags and address live in the operation until
      // completion.
      let ret = unsafe {
        ws::WSARecvFrom(
          handle,
          &mut wsabuf,
          1,
          ptr::null_mut(),
          flags,
          from,
          from_len,
          overlapped,
          None,
        )
      };
      issued(ret == 0)
    }
    OpKind::Send => {
      // SAFETY: the buffer lives in the operation until completion.
      let ret = unsafe {
        ws::WSASend(handle, &wsabuf, 1, ptr::null_mut(), 0, overlapped, None)
      };
      issued(ret == 0)
    }
    OpKind::SendTo => {
      let Some(to) = op.addr else {
        return Err(io::Error::from_raw_os_error(ws::WSAEDESTADDRREQ));
      };
      let (storage, len) = sys::to_sockaddr(&to);
      op.sys.addr = storage;
      let name = ptr::from_ref(&op.sys.addr).cast::<SOCKADDR>();
      // SAFETY: buffer and address live in the operation until completion.
      let ret = unsafe {
        ws::WSASendTo(
          handle,
          &wsabuf,
          1,
          ptr::null_mut(),
          0,
          name,
          len,
          overlapped,
          None,
        )
      };
      issued(ret == 0)
    }
    OpKind::Disconnect { reuse_socket } => {
      let disconnect_ex = extensions(handle)?.disconnect_ex;
      let flags = if reuse_socket { ws::TF_REUSE_SOCKET } else { 0 };
      // SAFETY: only the OVERLAPPED is referenced.
      let ok = unsafe { disconnect_ex(handle, overlapped, flags, 0) };
      issued(ok != 0)
    }
  }
}

impl Backend for Iocp {
  type Pending = Pending;
  type OpState = OpState;

  fn open() -> io::Result<Self> {
    // SAFETY: all-zero is a valid WSADATA for WSAStartup to fill in.
    let mut data: WSADATA = unsafe { mem::zeroed() };
    // SAFETY: `data` outlives the call.
    let started = unsafe { ws::WSAStartup(0x0202, &mut data) };
    if started != 0 {
      return Err(io::Error::from_raw_os_error(started));
    }

    // SAFETY: creates a fresh port; no existing handles are involved.
    let port = unsafe {
      CreateIoCompletionPort(
        windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE,
        ptr::null_mut(),
        0,
        0,
      )
    };
    if port.is_null() {
      let err = io::Error::last_os_error();
      // SAFETY: balances the successful WSAStartup above.
      unsafe { ws::WSACleanup() };
      return Err(err);
    }

    trace!("iocp: opened port {port:?}");
    Ok(Self { port, next_token: AtomicU64::new(1) })
  }

  fn associate(&self, handle: NativeHandle) -> io::Result<Arc<IoRegistration>> {
    let token = self.next_token.fetch_add(1, Ordering::Relaxed);
    // SAFETY: `handle` is an open overlapped socket.
    let port = unsafe {
      CreateIoCompletionPort(handle as HANDLE, self.port, token as usize, 0)
    };
    if port.is_null() {
      return Err(io::Error::last_os_error());
    }

    trace!("iocp: associated socket {handle} as token {token}");
    Ok(Arc::new(IoRegistration::new(handle, token)))
  }

  fn dissociate(&self, registration: &IoRegistration) {
    // The port lets go of a handle when the handle is closed.
    trace!("iocp: releasing socket {}", registration.handle());
  }

  fn submit(&self, op: Box<Operation>) -> Result<()> {
    op.submit(|op| {
      let raw = Box::into_raw(op);
      // SAFETY: `raw` was just leaked from a box.
      match unsafe { issue(raw) } {
        Ok(()) => Ok(()),
        // SAFETY: nothing was queued, so the box is still ours.
        Err(err) => Err((unsafe { Box::from_raw(raw) }, err.into())),
      }
    })
  }

  fn cancel(registration: &IoRegistration) {
    // SAFETY: cancelling I/O on a handle we still own.
    let ok = unsafe { CancelIoEx(registration.handle() as HANDLE, ptr::null()) };
    if ok == 0 {
      // SAFETY: reads thread-local state only.
      let code = unsafe { GetLastError() };
      if code != ERROR_NOT_FOUND {
        trace!(
          "iocp: cancelling I/O on socket {} failed: {code}",
          registration.handle()
        );
      }
    }
  }

  fn fixup(op: &mut Operation) -> Result<()> {
    if !op.error().is_success() {
      return Ok(());
    }

    match &op.kind {
      OpKind::Accept { target } => {
        let listener = op.registration.handle();
        sys::set_option(
          target.native_handle(),
          ws::SOL_SOCKET,
          ws::SO_UPDATE_ACCEPT_CONTEXT,
          &listener.to_ne_bytes(),
        )?;
        target.mark_bound();
        Ok(())
      }
      OpKind::Connect => {
        sys::set_option(
          op.registration.handle(),
          ws::SOL_SOCKET,
          ws::SO_UPDATE_CONNECT_CONTEXT,
          &[],
        )?;
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
    let timeout_ms = match timeout {
      Some(timeout) => timeout.as_millis().min(u32::MAX as u128 - 1) as u32,
      None => u32::MAX,
    };

    let mut transferred = 0u32;
    let mut key = 0usize;
    let mut overlapped: *mut OVERLAPPED = ptr::null_mut();
    // SAFETY: all out-pointers are valid locals.
    let ok = unsafe {
      GetQueuedCompletionStatus(
        this.port,
        &mut transferred,
        &mut key,
        &mut overlapped,
        timeout_ms,
      )
    };

    if overlapped.is_null() {
      if ok != 0 {
        // Wake-up packet.
        return Ok(());
      }
      let err = io::Error::last_os_error();
      if err.raw_os_error() == Some(WAIT_TIMEOUT as i32) {
        return Ok(());
      }
      return Err(err);
    }

    let result = if ok != 0 {
      Ok(transferred as usize)
    } else {
      // SAFETY: reads thread-local state only.
      Err(ErrorCode::from_raw_os_error(unsafe { GetLastError() } as i32))
    };

    // SAFETY: every OVERLAPPED handed to the port is the first field of an
    // operation leaked by `submit`, and each is dequeued exactly once.
    let op = unsafe { Box::from_raw(overlapped.cast::<Operation>()) };
    let job: Job = Box::new(move || op.complete(result));
    if let Err(Rejected(job)) = io_pool.submit(job) {
      job();
    }
    Ok(())
  }

  fn wake(&self) -> io::Result<()> {
    // SAFETY: a null OVERLAPPED marks the packet as a wake-up.
    let ok =
      unsafe { PostQueuedCompletionStatus(self.port, 0, 0, ptr::null()) };
    if ok == 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
  }
}

impl Drop for Iocp {
  fn drop(&mut self) {
    // SAFETY: the port is ours and no longer polled.
    unsafe {
      CloseHandle(self.port);
      ws::WSACleanup();
    }
  }
}
