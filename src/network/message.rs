use crate::replication::{Record, Snapshot};
use serde::{Deserialize, Serialize};

/// Messages exchanged over a mesh channel.
///
/// Serialized as JSON objects tagged by `type`, e.g. `{"type":"PING"}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum SyncMessage {
    /// Full snapshot of every collection held by the sender.
    #[serde(rename = "DATA_UPDATE")]
    DataUpdate { payload: Snapshot },
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "PONG")]
    Pong,
    #[serde(rename = "REMOTE_AUTH_REQUEST")]
    RemoteAuthRequest { payload: Credentials },
    #[serde(rename = "REMOTE_AUTH_SUCCESS")]
    RemoteAuthSuccess { payload: AuthGrant },
    #[serde(rename = "REMOTE_AUTH_FAILURE")]
    RemoteAuthFailure { message: String },
}

#[derive(Serialize, Deserialize, Clone, PartialEq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Successful remote login: the user record plus the hub's whole dataset.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AuthGrant {
    pub user: Record,
    #[serde(rename = "fullData")]
    pub full_data: Snapshot,
}

impl SyncMessage {
    /// Get the message type name as a string (for logging/debugging)
    pub fn message_type(&self) -> &'static str {
        match self {
            SyncMessage::DataUpdate { .. } => "DATA_UPDATE",
            SyncMessage::Ping => "PING",
            SyncMessage::Pong => "PONG",
            SyncMessage::RemoteAuthRequest { .. } => "REMOTE_AUTH_REQUEST",
            SyncMessage::RemoteAuthSuccess { .. } => "REMOTE_AUTH_SUCCESS",
            SyncMessage::RemoteAuthFailure { .. } => "REMOTE_AUTH_FAILURE",
        }
    }

    /// Check if this is a heartbeat message
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, SyncMessage::Ping | SyncMessage::Pong)
    }

    /// Check if this answers a remote login
    pub fn is_auth_response(&self) -> bool {
        matches!(
            self,
            SyncMessage::RemoteAuthSuccess { .. } | SyncMessage::RemoteAuthFailure { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shapes() {
        assert_eq!(
            serde_json::to_value(SyncMessage::Ping).unwrap(),
            json!({"type": "PING"})
        );

        let failure = SyncMessage::RemoteAuthFailure {
            message: "suspended".into(),
        };
        assert_eq!(
            serde_json::to_value(&failure).unwrap(),
            json!({"type": "REMOTE_AUTH_FAILURE", "message": "suspended"})
        );

        let request: SyncMessage = serde_json::from_value(json!({
            "type": "REMOTE_AUTH_REQUEST",
            "payload": {"email": "a@b.c", "password": "pw"}
        }))
        .unwrap();
        assert_eq!(request.message_type(), "REMOTE_AUTH_REQUEST");
    }

    #[test]
    fn test_data_update_from_json() {
        let msg: SyncMessage = serde_json::from_value(json!({
            "type": "DATA_UPDATE",
            "payload": {
                "clients": [{"id": "c1", "updatedAt": "2024-01-01T00:00:00Z", "name": "Jane"}],
                "brokers": []
            }
        }))
        .unwrap();

        match msg {
            SyncMessage::DataUpdate { payload } => {
                assert_eq!(payload.len(), 2);
                assert_eq!(payload["clients"][0].id, "c1");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_data_update_with_null_timestamp_keeps_every_collection() {
        let msg: SyncMessage = serde_json::from_str(
            r#"{"type":"DATA_UPDATE","payload":{
                "clients":[{"id":"c1","updatedAt":"2024-01-01T00:00:00Z"}],
                "brokers":[{"id":"b1","updatedAt":null,"name":"Legacy"}]
            }}"#,
        )
        .unwrap();

        match msg {
            SyncMessage::DataUpdate { payload } => {
                assert_eq!(payload["clients"][0].id, "c1");
                assert_eq!(
                    payload["brokers"][0].updated_at,
                    chrono::DateTime::<chrono::Utc>::default()
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_auth_success_uses_full_data_key() {
        let grant = SyncMessage::RemoteAuthSuccess {
            payload: AuthGrant {
                user: Record::new("u1", chrono::Utc::now()),
                full_data: Snapshot::new(),
            },
        };
        let value = serde_json::to_value(&grant).unwrap();
        assert!(value["payload"].get("fullData").is_some());
        assert!(grant.is_auth_response());
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials {
            email: "a@b.c".into(),
            password: "hunter2".into(),
        };
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }
}
