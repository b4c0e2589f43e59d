//! Configured username/password.

use std::fmt;

use crate::error::CredentialsError;

/// Longest username or password the subnegotiation can carry.
pub const MAX_FIELD_LEN: usize = 255;

/// Username/password required from clients.
///
/// Both fields are always non-empty; an absent `Credentials` means auth is
/// disabled.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    /// Build credentials from configuration values.
    ///
    /// Returns `Ok(None)` when either part is empty (auth disabled).
    pub fn from_parts(
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Option<Self>, CredentialsError> {
        let username = username.into();
        let password = password.into();

        if username.is_empty() || password.is_empty() {
            return Ok(None);
        }
        if username.len() > MAX_FIELD_LEN {
            return Err(CredentialsError::UsernameTooLong(username.len()));
        }
        if password.len() > MAX_FIELD_LEN {
            return Err(CredentialsError::PasswordTooLong(password.len()));
        }

        Ok(Some(Self { username, password }))
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Byte-for-byte comparison against what the client sent.
    pub fn matches(&self, username: &[u8], password: &[u8]) -> bool {
        self.username.as_bytes() == username && self.password.as_bytes() == password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
