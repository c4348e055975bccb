#![cfg_attr(docsrs, feature(doc_cfg))]

//! # Firelink - completion-based socket I/O
//!
//! Firelink runs socket operations in the background and calls you back
//! when they finish. An [`IoCore`] owns two thread pools: an I/O pool that
//! harvests completions from the OS, and a user pool that runs your
//! handlers. Slow handlers never delay harvesting.
//!
//! ## Platform support
//!
//! | Platform | Mechanism                        |
//! |----------|----------------------------------|
//! | Linux    | epoll readiness + I/O pool       |
//! | Windows  | I/O completion ports             |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use firelink::{
//!   AddressFamily, Endpoint, IoCore, IoCoreConfig, Protocol, ReadHandler,
//!   Socket, SocketType,
//! };
//!
//! let core = IoCore::create(IoCoreConfig::default())?;
//! let socket =
//!   Socket::open(&core, AddressFamily::Ipv4, SocketType::Stream, Protocol::Tcp)?;
//! socket.connect(&Endpoint::parse(AddressFamily::Ipv4, "127.0.0.1:63000")?)?;
//!
//! socket.start_recv(
//!   vec![0; 1024],
//!   ReadHandler::new(|_socket, error, n, buf| {
//!     if n > 0 {
//!       println!("{:?}", &buf[..n as usize]);
//!     } else {
//!       println!("closed: {error}");
//!     }
//!   }),
//! )?;
//! # Ok::<(), firelink::ErrorCode>(())
//! ```
//!
//! ## Completion rules
//!
//! - A `start_*` call that returns `Err` never runs its handler.
//! - A `start_*` call that returns `Ok` runs its handler exactly once, on the
//!   user pool.
//! - Buffers are moved into the operation and handed back to the handler.
//! - [`Socket::close`] aborts pending operations (their handlers see
//!   [`ErrorCode::OperationAborted`]) and waits until they are delivered.

#[macro_use]
mod macros;

mod config;
mod context;
mod endpoint;
mod error;
mod op;
mod socket;
mod sync;
mod types;

pub use config::IoCoreConfig;
pub use context::{IoCore, IoRegistration};
pub use endpoint::{Endpoint, Ipv4Address, Ipv6Address};
pub use error::{ErrorCode, Result};
pub use op::{
  AcceptHandler, ConnectHandler, DisconnectHandler, ReadHandler, WriteHandler,
};
pub use socket::Socket;
pub use types::{
  AddressFamily, NativeHandle, Protocol, ShutdownHow, SocketOption,
  SocketOptionLevel, SocketType,
};
