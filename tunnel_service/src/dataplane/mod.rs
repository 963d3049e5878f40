//! Dataplane collaborator.
//!
//! The service never touches packets itself; it asks a [`Dataplane`] to bring
//! tunnels up and down and to report tunnels that were already running when
//! the service started.

mod script;

pub use script::ScriptDataplane;

use crate::tunnel_config::TunnelConfig;
use async_trait::async_trait;
use shared_utils::config::{DataplaneConfig, DataplaneKind};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Errors reported by a dataplane.
#[derive(Debug, Error)]
pub enum DataplaneError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("command `{command}` exited with code {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("command `{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("{0}")]
    Other(String),
}

pub type DataplaneResult<T> = Result<T, DataplaneError>;

/// Operations the lifecycle controller delegates to the packet dataplane.
#[async_trait]
pub trait Dataplane: Send + Sync {
    /// Activate the tunnel described by `config`.
    async fn bring_up(&self, name: &str, config: &TunnelConfig) -> DataplaneResult<()>;

    /// Deactivate a running tunnel.
    async fn tear_down(&self, name: &str) -> DataplaneResult<()>;

    /// Tunnels already running at service start, with their configuration
    /// when it can be recovered.
    async fn discover(&self) -> DataplaneResult<Vec<(String, TunnelConfig)>> {
        Ok(Vec::new())
    }

    /// Forget any state kept for a deleted tunnel.
    async fn release(&self, _name: &str) -> DataplaneResult<()> {
        Ok(())
    }
}

/// Dataplane that accepts every request without doing anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDataplane;

#[async_trait]
impl Dataplane for NullDataplane {
    async fn bring_up(&self, name: &str, _config: &TunnelConfig) -> DataplaneResult<()> {
        debug!(tunnel = name, "Null dataplane bring-up");
        Ok(())
    }

    async fn tear_down(&self, name: &str) -> DataplaneResult<()> {
        debug!(tunnel = name, "Null dataplane tear-down");
        Ok(())
    }
}

/// Build the dataplane selected in the configuration.
pub fn from_config(config: &DataplaneConfig) -> DataplaneResult<Arc<dyn Dataplane>> {
    match config.kind {
        DataplaneKind::Null => {
            info!("Using null dataplane");
            Ok(Arc::new(NullDataplane))
        }
        DataplaneKind::Script => {
            let dataplane = ScriptDataplane::from_config(config)?;
            info!(config_dir = %dataplane.config_dir().display(), "Using script dataplane");
            Ok(Arc::new(dataplane))
        }
    }
}
