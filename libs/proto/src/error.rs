//! Error types for the SOCKS5 codec.

use thiserror::Error;

use crate::wire::ReplyCode;

/// Decode errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Version byte is not 0x05.
    #[error("unsupported SOCKS version: {0:#04x}")]
    UnsupportedVersion(u8),

    /// Subnegotiation version byte is not 0x01.
    #[error("unsupported auth subnegotiation version: {0:#04x}")]
    UnsupportedAuthVersion(u8),

    /// Command other than CONNECT.
    #[error("unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),

    /// RSV byte is not zero.
    #[error("reserved byte must be zero, got {0:#04x}")]
    NonZeroReserved(u8),

    /// IPv6 target (recognized, never dialed).
    #[error("IPv6 targets are not supported")]
    Ipv6Unsupported,

    /// Unknown address type.
    #[error("unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    /// Structurally invalid message.
    #[error("malformed message: {0}")]
    Malformed(&'static str),
}

impl WireError {
    /// Reply code sent when this error ends the request phase.
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            WireError::UnsupportedVersion(_)
            | WireError::UnsupportedCommand(_)
            | WireError::NonZeroReserved(_) => ReplyCode::CommandNotSupported,
            WireError::Ipv6Unsupported | WireError::UnsupportedAddressType(_) => {
                ReplyCode::AddressTypeNotSupported
            }
            WireError::UnsupportedAuthVersion(_) | WireError::Malformed(_) => {
                ReplyCode::GeneralFailure
            }
        }
    }
}

/// Invalid credential configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialsError {
    #[error("username is {0} bytes, at most 255 allowed")]
    UsernameTooLong(usize),

    #[error("password is {0} bytes, at most 255 allowed")]
    PasswordTooLong(usize),
}
