//! The SOCKS5 wire dialect we speak: version 5, CONNECT only, no
//! authentication, IPv4 and domain destinations.
//!
//! Parsing is cursor-free and re-entrant: each function looks at whatever has
//! accumulated so far and reports `Incomplete` until a full message is
//! present, so arbitrary TCP fragmentation (including one byte at a time)
//! works out of the box.

use std::net::Ipv4Addr;

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;

/// Our answer to any acceptable greeting: version 5, no authentication.
pub(crate) const METHOD_SELECT: [u8; 2] = [VERSION, METHOD_NO_AUTH];

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Greeting {
    Incomplete,
    Malformed,
    Ok { consumed: usize },
}

/// Parses the method-selection greeting: `05 NMETHODS METHODS…`.
///
/// Which methods the client offers is irrelevant; we only ever pick "none".
pub(crate) fn parse_greeting(buf: &[u8]) -> Greeting {
    let Some(&version) = buf.first() else {
        return Greeting::Incomplete;
    };

    if version != VERSION {
        return Greeting::Malformed;
    }

    let Some(&num_methods) = buf.get(1) else {
        return Greeting::Incomplete;
    };

    let len = 2 + usize::from(num_methods);
    if buf.len() < len {
        return Greeting::Incomplete;
    }

    Greeting::Ok { consumed: len }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Request {
    Incomplete,
    Malformed,
    UnsupportedCommand,
    UnsupportedAddressType,
    Connect {
        dest: Dest,
        port: u16,
        consumed: usize,
    },
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Dest {
    Ip(Ipv4Addr),
    Name(String),
}

/// Parses the request: `05 CMD 00 ATYP DST… DST.PORT`.
pub(crate) fn parse_request(buf: &[u8]) -> Request {
    if buf.len() < 4 {
        return Request::Incomplete;
    }

    if buf[0] != VERSION || buf[2] != 0x00 {
        return Request::Malformed;
    }

    if buf[1] != CMD_CONNECT {
        return Request::UnsupportedCommand;
    }

    match buf[3] {
        ATYP_IPV4 => {
            let Some(rest) = buf.get(4..10) else {
                return Request::Incomplete;
            };

            let addr = Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
            let port = u16::from_be_bytes([rest[4], rest[5]]);

            Request::Connect {
                dest: Dest::Ip(addr),
                port,
                consumed: 10,
            }
        }
        ATYP_DOMAIN => {
            let Some(&name_len) = buf.get(4) else {
                return Request::Incomplete;
            };

            let len = 5 + usize::from(name_len) + 2;
            let Some(rest) = buf.get(5..len) else {
                return Request::Incomplete;
            };

            let Ok(name) = std::str::from_utf8(&rest[..usize::from(name_len)]) else {
                return Request::Malformed;
            };
            let port = u16::from_be_bytes([rest[rest.len() - 2], rest[rest.len() - 1]]);

            Request::Connect {
                dest: Dest::Name(name.to_owned()),
                port,
                consumed: len,
            }
        }
        _ => Request::UnsupportedAddressType,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reply {
    Succeeded = 0x00,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Encodes a reply: `05 REP 00 01 BND.ADDR(4) BND.PORT(2)`.
///
/// Failure replies carry an all-zero bound address.
pub(crate) fn reply(code: Reply, bind: Option<(Ipv4Addr, u16)>) -> [u8; 10] {
    let (addr, port) = bind.unwrap_or((Ipv4Addr::UNSPECIFIED, 0));

    let mut out = [0u8; 10];
    out[0] = VERSION;
    out[1] = code as u8;
    out[3] = ATYP_IPV4;
    out[4..8].copy_from_slice(&addr.octets());
    out[8..10].copy_from_slice(&port.to_be_bytes());

    out
}
