//! Connection authentication.
//!
//! The gateway makes a single call per connection:
//! `authenticate(token, doc) -> Identity | AuthError`.

use std::collections::HashSet;

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single capability on a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
}

/// Set of permissions granted to a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Permissions(HashSet<Permission>);

impl Permissions {
    pub fn read_only() -> Self {
        Self([Permission::Read].into_iter().collect())
    }

    pub fn read_write() -> Self {
        Self([Permission::Read, Permission::Write].into_iter().collect())
    }

    pub fn can_read(&self) -> bool {
        self.0.contains(&Permission::Read)
    }

    pub fn can_write(&self) -> bool {
        self.0.contains(&Permission::Write)
    }
}

impl FromIterator<Permission> for Permissions {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Who is connecting and what they may do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Option<String>,
    pub permissions: Permissions,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            permissions: Permissions::read_write(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing or invalid token")]
    Unauthenticated,
    #[error("access to document {0} denied")]
    Forbidden(String),
}

#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate(&self, token: Option<&str>, doc: &str) -> Result<Identity, AuthError>;
}

/// Accepts every connection as an anonymous read-write peer.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAnonymous;

#[async_trait]
impl Authenticator for AllowAnonymous {
    async fn authenticate(&self, _token: Option<&str>, _doc: &str) -> Result<Identity, AuthError> {
        Ok(Identity::anonymous())
    }
}

fn default_permissions() -> Vec<Permission> {
    vec![Permission::Read, Permission::Write]
}

/// Claims carried by an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    /// Documents the token may open; empty means any.
    #[serde(default)]
    pub docs: Vec<String>,
    #[serde(default = "default_permissions")]
    pub permissions: Vec<Permission>,
}

/// Verifies HS256 tokens signed with a shared secret.
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, token: Option<&str>, doc: &str) -> Result<Identity, AuthError> {
        let token = token.ok_or(AuthError::Unauthenticated)?;
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            log::debug!("rejected token for {doc}: {e}");
            AuthError::Unauthenticated
        })?;
        let claims = data.claims;

        if !claims.docs.is_empty() && !claims.docs.iter().any(|d| d == doc) {
            return Err(AuthError::Forbidden(doc.to_string()));
        }

        Ok(Identity {
            user_id: Some(claims.sub),
            permissions: claims.permissions.into_iter().collect(),
        })
    }
}
