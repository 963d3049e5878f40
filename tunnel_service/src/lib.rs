//! Tunnel lifecycle service.
//!
//! Owns the authoritative state of named tunnels, executes lifecycle
//! commands received over IPC and broadcasts every state transition to
//! subscribed clients.

pub mod bus;
pub mod controller;
pub mod dataplane;
pub mod ipc_handler;
pub mod registry;
pub mod tunnel_config;

pub use bus::{NotificationBus, Subscription};
pub use controller::{validate_name, ControllerResult, LifecycleController};
pub use dataplane::{Dataplane, DataplaneError, DataplaneResult, NullDataplane, ScriptDataplane};
pub use ipc_handler::IpcServer;
pub use registry::TunnelRegistry;
pub use tunnel_config::{ConfigParseError, ConfigParser, IniConfigParser, TunnelConfig};
