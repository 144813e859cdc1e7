pub mod connection_registry;
pub mod connection_state;
pub mod heartbeat;
pub mod hub_link;
pub mod message;
pub mod session; // Session actor + SyncHandle
pub mod transport;
pub mod wire;
