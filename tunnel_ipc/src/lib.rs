//! Tunnel service IPC protocol library
//!
//! This crate defines the protocol and transport used between the privileged
//! tunnel service (`tunneld`) and the unprivileged front-end clients that
//! drive and observe it.

pub mod messages;
pub mod state;
pub mod transport;

/// Re-export common types for convenience
pub use messages::{
    Command, CreateTunnelRequest, Request, RequestEnvelope, RequestId, ResponseBody, Seq,
    ServiceError, ServiceEvent, ServiceMessage, TunnelSnapshot, TunnelUpdate,
};
pub use state::TunnelState;
pub use transport::{IpcError, IpcResult, UnixSocketListener};
