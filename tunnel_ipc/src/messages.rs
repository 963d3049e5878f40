//! IPC Message Definitions
//!
//! This module defines the message types exchanged between the tunnel
//! service and its clients. Every request travels inside a
//! [`RequestEnvelope`] carrying a client-chosen id; the service answers with
//! a [`ServiceMessage::Response`] echoing that id. Live notifications for
//! subscribed clients are interleaved on the same stream as
//! [`ServiceMessage::Event`].

use crate::state::TunnelState;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Correlates a response with the request that produced it.
pub type RequestId = u64;

/// Per-transition sequence number assigned by the service registry.
pub type Seq = u64;

/// Request sent from a client to the service
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Simple ping to check if the service is alive
    Ping,

    /// Register a new tunnel in the `Stopped` state
    CreateTunnel(CreateTunnelRequest),

    /// Bring a stopped tunnel up
    StartTunnel { name: String },

    /// Bring a started tunnel down
    StopTunnel { name: String },

    /// Remove a stopped tunnel
    DeleteTunnel { name: String },

    /// Point-in-time snapshot of every tunnel
    ListTunnels,

    /// Current state of a single tunnel
    GetTunnelState { name: String },

    /// Attach this connection to the live notification stream
    Subscribe,

    /// Shut the service down
    Quit { stop_outstanding: bool },
}

/// Details for creating a tunnel
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CreateTunnelRequest {
    /// Unique, case-sensitive tunnel name
    pub name: String,

    /// Configuration text, validated but not interpreted by the service
    pub config: String,
}

/// Envelope wrapping a request with its correlation id.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestEnvelope {
    pub id: RequestId,
    pub request: Request,
}

/// A tunnel's state as of a particular transition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TunnelUpdate {
    pub name: String,
    pub state: TunnelState,
    pub seq: Seq,
}

/// Consistent view of the registry at one instant.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelSnapshot {
    /// Tunnels ordered by name
    pub tunnels: Vec<TunnelUpdate>,

    /// Highest sequence number the registry had assigned when the snapshot
    /// was taken. Every transition that happened later carries a larger one.
    pub as_of: Seq,
}

/// Payload of a response
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// Response to a ping request
    Pong,

    /// Resulting state of the addressed tunnel
    Tunnel(TunnelUpdate),

    /// Generic success response
    Ack,

    /// Response to `ListTunnels`
    Snapshot(TunnelSnapshot),

    /// The connection is registered on the notification stream. Events for
    /// every transition after this point will follow.
    Subscribed,

    /// The request failed
    Error(ServiceError),
}

/// Live notification pushed to subscribed clients
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    /// A tunnel moved to a new state
    StateChanged(TunnelUpdate),

    /// A tunnel finished deleting and left the registry
    Removed { name: String, seq: Seq },

    /// Notifications were dropped for this client; re-list to catch up
    Resync,

    /// The service is halting; the connection will close
    ShuttingDown,
}

/// Everything the service writes to a client connection
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ServiceMessage {
    Response { id: RequestId, body: ResponseBody },
    Event(ServiceEvent),
}

/// Lifecycle command named in transition errors
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Delete,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Errors reported by the service for a single request
#[derive(Error, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("cannot {command} tunnel {name} while it is {from}")]
    InvalidTransition {
        name: String,
        from: TunnelState,
        command: Command,
    },

    #[error("tunnel not found: {0}")]
    NotFound(String),

    #[error("tunnel already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid tunnel name: {0}")]
    InvalidName(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to bring up tunnel {name}: {detail}")]
    BringUpFailed { name: String, detail: String },

    #[error("failed to tear down tunnel {name}: {detail}")]
    TeardownFailed { name: String, detail: String },

    #[error("shutdown aborted: tunnel {0} could not be stopped")]
    ShutdownAborted(String),

    #[error("service is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use bincode::{deserialize, serialize};

    #[test]
    fn test_serialize_deserialize_request() {
        let envelope = RequestEnvelope {
            id: 7,
            request: Request::CreateTunnel(CreateTunnelRequest {
                name: "office".to_string(),
                config: "[Interface]\nAddress = 10.0.0.2/32\n".to_string(),
            }),
        };

        let serialized = serialize(&envelope).expect("Failed to serialize request");
        let deserialized: RequestEnvelope =
            deserialize(&serialized).expect("Failed to deserialize request");

        assert_eq!(deserialized.id, 7);
        match deserialized.request {
            Request::CreateTunnel(create) => {
                assert_eq!(create.name, "office");
                assert!(create.config.starts_with("[Interface]"));
            }
            other => panic!("Deserialized to wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_error_crosses_the_wire() {
        let message = ServiceMessage::Response {
            id: 3,
            body: ResponseBody::Error(ServiceError::InvalidTransition {
                name: "t1".to_string(),
                from: TunnelState::Starting,
                command: Command::Start,
            }),
        };

        let bytes = serialize(&message).expect("Failed to serialize response");
        match deserialize::<ServiceMessage>(&bytes).expect("Failed to deserialize response") {
            ServiceMessage::Response {
                id,
                body: ResponseBody::Error(err),
            } => {
                assert_eq!(id, 3);
                assert_eq!(err.to_string(), "cannot start tunnel t1 while it is starting");
            }
            other => panic!("Deserialized to wrong variant: {other:?}"),
        }
    }
}
