//! Client authentication for `connection.start-ok`.
//!
//! The broker only needs a yes/no answer for a username and credentials.
//! [`Authenticator`] selects one of a fixed set of strategies from
//! configuration; [`CredentialStore`] is the plug-in point for external user
//! directories.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub const MECHANISM_PLAIN: &str = "PLAIN";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Unsupported SASL mechanism: {0}")]
    UnsupportedMechanism(String),

    #[error("Malformed SASL response: {0}")]
    MalformedResponse(String),

    #[error("Authentication failed for user {0}")]
    InvalidCredentials(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMechanism {
    #[default]
    None,
    Plain,
    External,
}

impl FromStr for AuthMechanism {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(AuthMechanism::None),
            "plain" => Ok(AuthMechanism::Plain),
            "external" => Ok(AuthMechanism::External),
            other => Err(format!("unknown auth mechanism '{}'", other)),
        }
    }
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthMechanism::None => "none",
            AuthMechanism::Plain => "plain",
            AuthMechanism::External => "external",
        };
        f.write_str(name)
    }
}

/// External user directory
pub trait CredentialStore: Send + Sync {
    fn verify(&self, username: &str, password: &[u8]) -> bool;
}

/// Decoded SASL PLAIN response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainCredentials {
    pub authzid: Option<String>,
    pub username: String,
    pub password: Vec<u8>,
}

/// Parse a SASL PLAIN response: `[authzid] NUL authcid NUL passwd`
pub fn parse_plain_response(response: &[u8]) -> Result<PlainCredentials, AuthError> {
    let mut parts = response.splitn(3, |b| *b == 0);
    let (Some(authzid), Some(username), Some(password)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::MalformedResponse(
            "expected authzid, username and password separated by NUL".to_string(),
        ));
    };

    let utf8 = |bytes: &[u8], field: &str| {
        String::from_utf8(bytes.to_vec())
            .map_err(|_| AuthError::MalformedResponse(format!("{} is not valid UTF-8", field)))
    };
    let username = utf8(username, "username")?;
    if username.is_empty() {
        return Err(AuthError::MalformedResponse("empty username".to_string()));
    }
    let authzid = if authzid.is_empty() {
        None
    } else {
        Some(utf8(authzid, "authzid")?)
    };

    Ok(PlainCredentials {
        authzid,
        username,
        password: password.to_vec(),
    })
}

#[derive(Clone)]
pub enum Authenticator {
    /// Accepts every client
    NoOp,
    /// Users from configuration
    Plain(Arc<HashMap<String, String>>),
    External(Arc<dyn CredentialStore>),
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authenticator::NoOp => f.write_str("NoOp"),
            Authenticator::Plain(users) => f
                .debug_struct("Plain")
                .field("users", &users.len())
                .finish(),
            Authenticator::External(_) => f.write_str("External"),
        }
    }
}

impl Authenticator {
    /// Build from configuration. `External` without a store rejects everyone.
    pub fn from_config(
        mechanism: AuthMechanism,
        users: &HashMap<String, String>,
        store: Option<Arc<dyn CredentialStore>>,
    ) -> Self {
        match mechanism {
            AuthMechanism::None => Authenticator::NoOp,
            AuthMechanism::Plain => Authenticator::Plain(Arc::new(users.clone())),
            AuthMechanism::External => match store {
                Some(store) => Authenticator::External(store),
                None => {
                    warn!("External authentication selected without a credential store");
                    Authenticator::External(Arc::new(DenyAll))
                }
            },
        }
    }

    /// Space separated mechanism list for `connection.start`
    pub fn mechanisms(&self) -> &'static str {
        MECHANISM_PLAIN
    }

    pub fn authenticate(&self, username: &str, password: &[u8]) -> bool {
        match self {
            Authenticator::NoOp => true,
            Authenticator::Plain(users) => users
                .get(username)
                .is_some_and(|expected| expected.as_bytes() == password),
            Authenticator::External(store) => store.verify(username, password),
        }
    }

    /// Authenticate a `connection.start-ok` response and return the user
    pub fn authenticate_sasl(&self, mechanism: &str, response: &[u8]) -> Result<String, AuthError> {
        if !mechanism.eq_ignore_ascii_case(MECHANISM_PLAIN) {
            return Err(AuthError::UnsupportedMechanism(mechanism.to_string()));
        }
        let credentials = match (self, parse_plain_response(response)) {
            (_, Ok(credentials)) => credentials,
            // anonymous clients are fine when nobody is checked
            (Authenticator::NoOp, Err(_)) => return Ok("anonymous".to_string()),
            (_, Err(e)) => return Err(e),
        };

        if self.authenticate(&credentials.username, &credentials.password) {
            debug!(user = %credentials.username, "Client authenticated");
            Ok(credentials.username)
        } else {
            Err(AuthError::InvalidCredentials(credentials.username))
        }
    }
}

struct DenyAll;

impl CredentialStore for DenyAll {
    fn verify(&self, _username: &str, _password: &[u8]) -> bool {
        false
    }
}
