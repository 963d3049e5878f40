//! Front-end side of the tunnel service protocol.
//!
//! [`ServiceClient`] issues lifecycle commands; [`MirrorSession`] keeps a
//! [`ClientMirror`] converged with the service's state for presentation.

pub mod mirror;
pub mod service_comms;
pub mod session;

pub use mirror::{ClientMirror, MirrorChange};
pub use service_comms::{ClientError, ClientResult, EventStream, ServiceClient};
pub use session::MirrorSession;
