//! Request-scoped authorization.
//!
//! Credentials travel with every request and are checked by an
//! [`Authorizer`]; nothing about a login is remembered between requests.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config_file::UserConfig;

#[derive(Clone, Default, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub username: String,
    pub admin: bool,
}

pub trait Authorizer: Send + Sync {
    /// `Some` when the credentials are valid.
    fn authenticate(&self, credentials: &Credentials) -> Option<Principal>;
}

/// Users from configuration, passwords stored as SHA-256 hex digests.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthorizer {
    users: Vec<UserConfig>,
}

impl StaticAuthorizer {
    pub fn new(users: Vec<UserConfig>) -> Self {
        Self { users }
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl Authorizer for StaticAuthorizer {
    fn authenticate(&self, credentials: &Credentials) -> Option<Principal> {
        let user = self
            .users
            .iter()
            .find(|u| u.username == credentials.username)?;
        let digest = hash_password(&credentials.password);
        if constant_time_eq(
            digest.as_bytes(),
            user.password_sha256.to_ascii_lowercase().as_bytes(),
        ) {
            Some(Principal {
                username: user.username.clone(),
                admin: user.admin,
            })
        } else {
            None
        }
    }
}

/// Lowercase hex SHA-256 of `password`.
pub fn hash_password(password: &str) -> String {
    Sha256::digest(password.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
