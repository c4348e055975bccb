//! IPv4/IPv6 address + port values and their text form.

use std::fmt;
use std::net::{
  IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6,
};

use crate::error::{ErrorCode, Result};
use crate::types::AddressFamily;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Address {
  pub octets: [u8; 4],
  pub port: u16,
}

impl Ipv4Address {
  pub const fn new(octets: [u8; 4], port: u16) -> Self {
    Self { octets, port }
  }

  /// `0.0.0.0:port`
  pub const fn any(port: u16) -> Self {
    Self::new([0; 4], port)
  }

  /// `127.0.0.1:port`
  pub const fn loopback(port: u16) -> Self {
    Self::new([127, 0, 0, 1], port)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv6Address {
  pub octets: [u8; 16],
  pub port: u16,
}

impl Ipv6Address {
  pub const fn new(octets: [u8; 16], port: u16) -> Self {
    Self { octets, port }
  }

  /// `[::]:port`
  pub const fn any(port: u16) -> Self {
    Self::new([0; 16], port)
  }

  /// `[::1]:port`
  pub const fn loopback(port: u16) -> Self {
    let mut octets = [0; 16];
    octets[15] = 1;
    Self::new(octets, port)
  }
}

/// An address + port in one of the two supported families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
  V4(Ipv4Address),
  V6(Ipv6Address),
}

impl Default for Endpoint {
  fn default() -> Self {
    Endpoint::V4(Ipv4Address::any(0))
  }
}

impl Endpoint {
  /// Wildcard address of `family`. `Unspecified` is treated as IPv4.
  pub fn any(family: AddressFamily, port: u16) -> Self {
    match family {
      AddressFamily::Ipv6 => Endpoint::V6(Ipv6Address::any(port)),
      AddressFamily::Ipv4 | AddressFamily::Unspecified => {
        Endpoint::V4(Ipv4Address::any(port))
      }
    }
  }

  pub fn family(&self) -> AddressFamily {
    match self {
      Endpoint::V4(_) => AddressFamily::Ipv4,
      Endpoint::V6(_) => AddressFamily::Ipv6,
    }
  }

  pub fn port(&self) -> u16 {
    match self {
      Endpoint::V4(v4) => v4.port,
      Endpoint::V6(v6) => v6.port,
    }
  }

  /// `a.b.c.d:port` or `[v6]:port`.
  pub fn format(&self) -> String {
    self.to_string()
  }

  /// Parses text of the given family.
  ///
  /// IPv4 expects `a.b.c.d:port`. IPv6 accepts `[addr]:port` or a bare
  /// address, in which case the port is 0.
  pub fn parse(family: AddressFamily, text: &str) -> Result<Endpoint> {
    match family {
      AddressFamily::Ipv4 => parse_v4(text),
      AddressFamily::Ipv6 => parse_v6(text),
      AddressFamily::Unspecified => Err(ErrorCode::AddressFamilyNotSupported),
    }
  }
}

fn parse_port(text: &str) -> Result<u16> {
  text.parse::<u16>().map_err(|_| ErrorCode::InvalidArgument)
}

fn parse_v4(text: &str) -> Result<Endpoint> {
  if text.starts_with('[') {
    return Err(ErrorCode::AddressFamilyNotSupported);
  }
  let (host, port) =
    text.rsplit_once(':').ok_or(ErrorCode::InvalidArgument)?;
  let addr = host.parse::<Ipv4Addr>().map_err(|_| {
    if host.contains(':') {
      ErrorCode::AddressFamilyNotSupported
    } else {
      ErrorCode::InvalidArgument
    }
  })?;
  Ok(Endpoint::V4(Ipv4Address::new(addr.octets(), parse_port(port)?)))
}

fn parse_v6(text: &str) -> Result<Endpoint> {
  let (host, port) = match text.strip_prefix('[') {
    Some(rest) => {
      let (host, tail) =
        rest.split_once(']').ok_or(ErrorCode::InvalidArgument)?;
      let port = match tail {
        "" => 0,
        tail => parse_port(
          tail.strip_prefix(':').ok_or(ErrorCode::InvalidArgument)?,
        )?,
      };
      (host, port)
    }
    None => (text, 0),
  };

  let addr = host.parse::<Ipv6Addr>().map_err(|_| {
    if host.parse::<Ipv4Addr>().is_ok() || text.contains('.') {
      ErrorCode::AddressFamilyNotSupported
    } else {
      ErrorCode::InvalidArgument
    }
  })?;
  Ok(Endpoint::V6(Ipv6Address::new(addr.octets(), port)))
}

impl fmt::Display for Endpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Endpoint::V4(v4) => {
        write!(f, "{}:{}", Ipv4Addr::from(v4.octets), v4.port)
      }
      Endpoint::V6(v6) => {
        write!(f, "[{}]:{}", Ipv6Addr::from(v6.octets), v6.port)
      }
    }
  }
}

impl From<SocketAddr> for Endpoint {
  fn from(addr: SocketAddr) -> Self {
    match addr {
      SocketAddr::V4(v4) => {
        Endpoint::V4(Ipv4Address::new(v4.ip().octets(), v4.port()))
      }
      SocketAddr::V6(v6) => {
        Endpoint::V6(Ipv6Address::new(v6.ip().octets(), v6.port()))
      }
    }
  }
}

impl From<Endpoint> for SocketAddr {
  fn from(endpoint: Endpoint) -> Self {
    match endpoint {
      Endpoint::V4(v4) => SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::from(v4.octets),
        v4.port,
      )),
      Endpoint::V6(v6) => SocketAddr::V6(SocketAddrV6::new(
        Ipv6Addr::from(v6.octets),
        v6.port,
        0,
        0,
      )),
    }
  }
}

impl From<Endpoint> for IpAddr {
  fn from(endpoint: Endpoint) -> Self {
    SocketAddr::from(endpoint).ip()
  }
}
