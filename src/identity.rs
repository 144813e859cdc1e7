//! Deterministic endpoint identifiers.
//!
//! The hub of a namespace is always reachable at `hub-<namespace>`, so any
//! peer can dial it without discovery. Spokes append a random per-session
//! suffix so the same user can be logged in on several devices at once
//! while the rendezvous still sees globally unique identifiers.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

const HUB_PREFIX: &str = "hub-";
const SPOKE_PREFIX: &str = "node-";
const SESSION_SUFFIX_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Hub,
    Spoke,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Hub => write!(f, "hub"),
            Role::Spoke => write!(f, "spoke"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hub" | "master" => Ok(Role::Hub),
            "spoke" | "node" => Ok(Role::Spoke),
            other => Err(format!("unknown role '{}' (expected hub or spoke)", other)),
        }
    }
}

/// Identity of the local endpoint for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub role: Role,
    /// Already normalized.
    pub namespace: String,
    pub local_id: String,
    /// Present for spokes only.
    pub session_suffix: Option<String>,
}

impl PeerIdentity {
    /// Resolve a fresh identity. Spokes get a new random suffix every call.
    pub fn resolve(role: Role, namespace: &str, local_id: &str) -> Self {
        let session_suffix = match role {
            Role::Hub => None,
            Role::Spoke => Some(random_suffix()),
        };
        Self {
            role,
            namespace: normalize_namespace(namespace),
            local_id: local_id.to_string(),
            session_suffix,
        }
    }

    /// The identifier to bind at the rendezvous.
    pub fn endpoint_id(&self) -> String {
        match (&self.role, &self.session_suffix) {
            (Role::Spoke, Some(suffix)) => {
                format!(
                    "{}{}-{}-{}",
                    SPOKE_PREFIX, self.namespace, self.local_id, suffix
                )
            }
            _ => hub_id(&self.namespace),
        }
    }

    /// Identifier of the hub for this identity's namespace.
    pub fn hub_id(&self) -> String {
        hub_id(&self.namespace)
    }

    pub fn is_hub(&self) -> bool {
        self.role == Role::Hub
    }
}

/// Trim and lower-case so namespace spelling variants land in the same mesh.
pub fn normalize_namespace(namespace: &str) -> String {
    namespace.trim().to_lowercase()
}

pub fn hub_id(namespace: &str) -> String {
    format!("{}{}", HUB_PREFIX, normalize_namespace(namespace))
}

/// Compute an endpoint identifier for `role` in `namespace`.
///
/// Hub identifiers are a pure function of the namespace. Spoke identifiers
/// carry a random suffix and differ on every call.
pub fn compute_id(role: Role, namespace: &str, local_id: &str) -> String {
    PeerIdentity::resolve(role, namespace, local_id).endpoint_id()
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_SUFFIX_LEN)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_id_is_normalized() {
        assert_eq!(compute_id(Role::Hub, "Foo Bar ", "u1"), "hub-foo bar");
        assert_eq!(
            compute_id(Role::Hub, "Foo Bar ", "u1"),
            compute_id(Role::Hub, "foo bar", "someone-else")
        );
    }

    #[test]
    fn test_spoke_ids_unique_per_session() {
        let a = compute_id(Role::Spoke, "Acme", "user-7");
        let b = compute_id(Role::Spoke, "Acme", "user-7");
        assert_ne!(a, b);
        assert!(a.starts_with("node-acme-user-7-"));
        assert_eq!(a.len(), "node-acme-user-7-".len() + SESSION_SUFFIX_LEN);
    }

    #[test]
    fn test_role_from_str() {
        assert_eq!("Hub".parse::<Role>(), Ok(Role::Hub));
        assert_eq!("node".parse::<Role>(), Ok(Role::Spoke));
        assert!("relay".parse::<Role>().is_err());
    }

    #[test]
    fn test_spoke_identity_knows_its_hub() {
        let identity = PeerIdentity::resolve(Role::Spoke, "  ACME ", "u1");
        assert_eq!(identity.namespace, "acme");
        assert_eq!(identity.hub_id(), "hub-acme");
        assert!(!identity.is_hub());
        assert!(identity.session_suffix.is_some());
    }
}
