//! SOCKS5 wire format.
//!
//! Covers the subset sockd speaks (RFC 1928 + RFC 1929):
//! - Method negotiation with no-auth and username/password
//! - Username/password subnegotiation
//! - CONNECT requests for IPv4 and domain targets
//!
//! Decoders are incremental: they return [`Decoded::Incomplete`] until the
//! buffer holds a whole message, and reject as soon as a bad byte is seen.

use std::fmt;
use std::net::Ipv4Addr;

use crate::error::WireError;

/// Protocol version byte.
pub const SOCKS_VERSION: u8 = 0x05;

/// Username/password subnegotiation version byte.
pub const AUTH_VERSION: u8 = 0x01;

/// Method: no authentication required.
pub const METHOD_NO_AUTH: u8 = 0x00;

/// Method: username/password.
pub const METHOD_USER_PASS: u8 = 0x02;

/// Method: no acceptable methods.
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

/// Command: CONNECT.
pub const CMD_CONNECT: u8 = 0x01;

/// Address type: IPv4.
pub const ATYP_IPV4: u8 = 0x01;

/// Address type: domain name.
pub const ATYP_DOMAIN: u8 = 0x03;

/// Address type: IPv6.
pub const ATYP_IPV6: u8 = 0x04;

/// Subnegotiation status: success.
pub const AUTH_SUCCESS: u8 = 0x00;

/// Subnegotiation status: failure.
pub const AUTH_FAILURE: u8 = 0x01;

/// Length of a reply frame (VER REP RSV ATYP BND.ADDR[4] BND.PORT[2]).
pub const REPLY_LEN: usize = 10;

/// Reply codes sent in the REP field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    HostUnreachable = 0x04,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl ReplyCode {
    /// The byte written on the wire.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Build a reply frame.
///
/// BND.ADDR and BND.PORT are always zero, whatever the local endpoint is.
pub fn reply_frame(code: ReplyCode) -> [u8; REPLY_LEN] {
    [
        SOCKS_VERSION,
        code.as_byte(),
        0x00,
        ATYP_IPV4,
        0x00,
        0x00,
        0x00,
        0x00,
        0x00,
        0x00,
    ]
}

/// Build a method selection message.
pub fn method_selection(method: u8) -> [u8; 2] {
    [SOCKS_VERSION, method]
}

/// Build a username/password subnegotiation status message.
pub fn auth_status(accepted: bool) -> [u8; 2] {
    let status = if accepted { AUTH_SUCCESS } else { AUTH_FAILURE };
    [AUTH_VERSION, status]
}

/// Result of an incremental decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<T> {
    /// A full message was decoded from the first `consumed` bytes.
    Complete { value: T, consumed: usize },
    /// More bytes are needed.
    Incomplete,
}

/// Client greeting: the list of offered authentication methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub methods: Vec<u8>,
}

impl Greeting {
    /// Whether the client offered `method`.
    pub fn offers(&self, method: u8) -> bool {
        self.methods.contains(&method)
    }
}

/// Decode `VER NMETHODS METHODS[NMETHODS]`.
pub fn decode_greeting(buf: &[u8]) -> Result<Decoded<Greeting>, WireError> {
    let Some(&version) = buf.first() else {
        return Ok(Decoded::Incomplete);
    };
    if version != SOCKS_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }

    let Some(&count) = buf.get(1) else {
        return Ok(Decoded::Incomplete);
    };
    let end = 2 + count as usize;
    if buf.len() < end {
        return Ok(Decoded::Incomplete);
    }

    Ok(Decoded::Complete {
        value: Greeting {
            methods: buf[2..end].to_vec(),
        },
        consumed: end,
    })
}

/// Username/password pair as sent by the client.
#[derive(Clone, PartialEq, Eq)]
pub struct UserPass {
    pub username: Vec<u8>,
    pub password: Vec<u8>,
}

impl fmt::Debug for UserPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserPass")
            .field("username", &String::from_utf8_lossy(&self.username))
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Decode `VER ULEN UNAME[ULEN] PLEN PASSWD[PLEN]`.
pub fn decode_user_pass(buf: &[u8]) -> Result<Decoded<UserPass>, WireError> {
    let Some(&version) = buf.first() else {
        return Ok(Decoded::Incomplete);
    };
    if version != AUTH_VERSION {
        return Err(WireError::UnsupportedAuthVersion(version));
    }

    let Some(&ulen) = buf.get(1) else {
        return Ok(Decoded::Incomplete);
    };
    let ulen = ulen as usize;
    let Some(&plen) = buf.get(2 + ulen) else {
        return Ok(Decoded::Incomplete);
    };
    let end = 3 + ulen + plen as usize;
    if buf.len() < end {
        return Ok(Decoded::Incomplete);
    }

    Ok(Decoded::Complete {
        value: UserPass {
            username: buf[2..2 + ulen].to_vec(),
            password: buf[3 + ulen..end].to_vec(),
        },
        consumed: end,
    })
}

/// Destination address of a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr),
    Domain(String),
}

/// Destination of a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub addr: TargetAddr,
    pub port: u16,
}

impl Target {
    pub fn new(addr: TargetAddr, port: u16) -> Self {
        Self { addr, port }
    }

    /// Host part as a string (dotted quad or domain name).
    pub fn host(&self) -> String {
        match &self.addr {
            TargetAddr::Ipv4(ip) => ip.to_string(),
            TargetAddr::Domain(name) => name.clone(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.addr {
            TargetAddr::Ipv4(ip) => write!(f, "{}:{}", ip, self.port),
            TargetAddr::Domain(name) => write!(f, "{}:{}", name, self.port),
        }
    }
}

/// A parsed CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub target: Target,
}

/// Decode `VER CMD RSV ATYP DST.ADDR DST.PORT`.
///
/// Header bytes are checked as soon as they arrive. IPv6 is rejected on the
/// ATYP byte alone; its address bytes are never read.
pub fn decode_request(buf: &[u8]) -> Result<Decoded<ConnectRequest>, WireError> {
    if let Some(&version) = buf.first() {
        if version != SOCKS_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
    }
    if let Some(&command) = buf.get(1) {
        if command != CMD_CONNECT {
            return Err(WireError::UnsupportedCommand(command));
        }
    }
    if let Some(&reserved) = buf.get(2) {
        if reserved != 0x00 {
            return Err(WireError::NonZeroReserved(reserved));
        }
    }
    let Some(&atyp) = buf.get(3) else {
        return Ok(Decoded::Incomplete);
    };

    let (addr, port_at) = match atyp {
        ATYP_IPV4 => {
            if buf.len() < 8 {
                return Ok(Decoded::Incomplete);
            }
            (
                TargetAddr::Ipv4(Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7])),
                8,
            )
        }
        ATYP_DOMAIN => {
            let Some(&len) = buf.get(4) else {
                return Ok(Decoded::Incomplete);
            };
            if len == 0 {
                return Err(WireError::Malformed("empty domain name"));
            }
            let end = 5 + len as usize;
            if buf.len() < end {
                return Ok(Decoded::Incomplete);
            }
            let name = std::str::from_utf8(&buf[5..end])
                .map_err(|_| WireError::Malformed("domain name is not valid UTF-8"))?;
            (TargetAddr::Domain(name.to_string()), end)
        }
        ATYP_IPV6 => return Err(WireError::Ipv6Unsupported),
        other => return Err(WireError::UnsupportedAddressType(other)),
    };

    let end = port_at + 2;
    if buf.len() < end {
        return Ok(Decoded::Incomplete);
    }
    let port = u16::from_be_bytes([buf[port_at], buf[port_at + 1]]);

    Ok(Decoded::Complete {
        value: ConnectRequest {
            target: Target::new(addr, port),
        },
        consumed: end,
    })
}

/// Encode a client greeting offering `methods`.
pub fn encode_greeting(methods: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + methods.len());
    buf.push(SOCKS_VERSION);
    buf.push(methods.len() as u8);
    buf.extend_from_slice(methods);
    buf
}

/// Encode a client username/password subnegotiation message.
///
/// Fields longer than 255 bytes are truncated to fit the length byte.
pub fn encode_user_pass(username: &[u8], password: &[u8]) -> Vec<u8> {
    let username = &username[..username.len().min(255)];
    let password = &password[..password.len().min(255)];

    let mut buf = Vec::with_capacity(3 + username.len() + password.len());
    buf.push(AUTH_VERSION);
    buf.push(username.len() as u8);
    buf.extend_from_slice(username);
    buf.push(password.len() as u8);
    buf.extend_from_slice(password);
    buf
}

/// Encode a client CONNECT request for `target`.
pub fn encode_connect(target: &Target) -> Vec<u8> {
    let mut buf = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    match &target.addr {
        TargetAddr::Ipv4(ip) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        TargetAddr::Domain(name) => {
            let name = &name.as_bytes()[..name.len().min(255)];
            buf.push(ATYP_DOMAIN);
            buf.push(name.len() as u8);
            buf.extend_from_slice(name);
        }
    }
    buf.extend_from_slice(&target.port.to_be_bytes());
    buf
}
