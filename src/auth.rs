//! Hub-side validation of logins relayed over the mesh.
//!
//! The hub holds the authoritative roster (a replicated collection of user
//! records). A successful check answers with the user record and the hub's
//! whole dataset, so a device with an empty cache is authenticated and
//! bootstrapped by one response.

use crate::network::message::{AuthGrant, Credentials, SyncMessage};
use crate::replication::{Dataset, Record};
use serde_json::Value;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

pub const INVALID_CREDENTIALS: &str = "invalid credentials";
pub const SUSPENDED: &str = "suspended";

#[derive(Debug, Clone, PartialEq)]
pub enum AuthDecision {
    Granted(Record),
    Rejected(&'static str),
}

#[derive(Debug, Clone)]
pub struct CredentialRelay {
    roster_collection: String,
}

impl CredentialRelay {
    pub fn new(roster_collection: impl Into<String>) -> Self {
        Self {
            roster_collection: roster_collection.into(),
        }
    }

    pub fn roster_collection(&self) -> &str {
        &self.roster_collection
    }

    /// Check `credentials` against the roster held in `dataset`.
    pub fn authenticate(&self, dataset: &Dataset, credentials: &Credentials) -> AuthDecision {
        let email = credentials.email.trim();
        let Some(user) = dataset
            .collection(&self.roster_collection)
            .iter()
            .find(|user| email_of(user).is_some_and(|e| e.trim().eq_ignore_ascii_case(email)))
        else {
            return AuthDecision::Rejected(INVALID_CREDENTIALS);
        };

        // Accounts without a password (legacy/migrated) are let through
        if let Some(stored) = password_of(user) {
            let matches: bool = stored
                .as_bytes()
                .ct_eq(credentials.password.as_bytes())
                .into();
            if !matches {
                return AuthDecision::Rejected(INVALID_CREDENTIALS);
            }
        }

        if is_suspended(user) {
            return AuthDecision::Rejected(SUSPENDED);
        }

        AuthDecision::Granted(user.clone())
    }

    /// Build the reply to a `REMOTE_AUTH_REQUEST`.
    pub fn respond(&self, dataset: &Dataset, credentials: &Credentials) -> SyncMessage {
        match self.authenticate(dataset, credentials) {
            AuthDecision::Granted(user) => {
                info!("🔑 Remote login granted for {}", credentials.email);
                SyncMessage::RemoteAuthSuccess {
                    payload: AuthGrant {
                        user,
                        full_data: dataset.snapshot(),
                    },
                }
            }
            AuthDecision::Rejected(message) => {
                warn!("🚫 Remote login rejected for {}: {}", credentials.email, message);
                SyncMessage::RemoteAuthFailure {
                    message: message.to_string(),
                }
            }
        }
    }
}

fn email_of(user: &Record) -> Option<&str> {
    user.field("email").and_then(Value::as_str)
}

fn password_of(user: &Record) -> Option<&str> {
    user.field("password")
        .and_then(Value::as_str)
        .filter(|p| !p.is_empty())
}

fn is_suspended(user: &Record) -> bool {
    let flag = |key: &str| user.field(key).and_then(Value::as_bool).unwrap_or(false);
    let status = user
        .field("status")
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase);

    flag("blocked")
        || flag("deleted")
        || matches!(status.as_deref(), Some("blocked") | Some("deleted"))
}
