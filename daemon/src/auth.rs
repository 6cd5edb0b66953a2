//! Authentication module

use crate::config::UserConfig;
use evr_gateway_protocol::AuthRequest;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("Unsupported authentication type {0:?}")]
    UnsupportedType(Option<String>),

    #[error("Missing user or password")]
    MissingCredentials,

    #[error("Unknown user {0}")]
    UnknownUser(String),

    #[error("Wrong password for user {0}")]
    WrongPassword(String),
}

/// A configured user
#[derive(Clone, PartialEq, Eq)]
pub struct User {
    name: String,
    password: String,
}

impl User {
    pub fn new(name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: password.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User")
            .field("name", &self.name)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Users that may authenticate against the gateway. Read-only after startup.
#[derive(Debug, Clone, Default)]
pub struct UserTable {
    users: HashMap<String, User>,
}

impl UserTable {
    pub fn from_config(users: &HashMap<String, UserConfig>) -> Self {
        users
            .iter()
            .map(|(name, user)| User::new(name.clone(), user.password.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Check an `auth` command's credentials
    pub fn authenticate(&self, request: &AuthRequest) -> Result<&User, AuthError> {
        if request.kind.as_deref() != Some("basic") {
            return Err(AuthError::UnsupportedType(request.kind.clone()));
        }
        let (name, password) = request
            .basic_credentials()
            .ok_or(AuthError::MissingCredentials)?;

        let user = self
            .users
            .get(name)
            .ok_or_else(|| AuthError::UnknownUser(name.to_string()))?;
        if user.password != password {
            return Err(AuthError::WrongPassword(name.to_string()));
        }

        debug!("Authenticated user {}", user.name);
        Ok(user)
    }
}

impl FromIterator<User> for UserTable {
    fn from_iter<I: IntoIterator<Item = User>>(iter: I) -> Self {
        Self {
            users: iter
                .into_iter()
                .map(|user| (user.name.clone(), user))
                .collect(),
        }
    }
}

/// Authentication state of one session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AuthState {
    #[default]
    Unauthenticated,
    Authenticated(String),
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }

    pub fn user(&self) -> Option<&str> {
        match self {
            Self::Authenticated(user) => Some(user),
            Self::Unauthenticated => None,
        }
    }
}
