//! Lifecycle command execution.
//!
//! The controller validates each command against the current state, drives
//! the dataplane and records every resulting transition in the registry,
//! which broadcasts it. No lock is held while the dataplane works: the
//! transitional states (`Starting`, `Stopping`, `Deleting`) are what keep a
//! second command on the same tunnel out.

use crate::bus::Subscription;
use crate::dataplane::Dataplane;
use crate::registry::TunnelRegistry;
use crate::tunnel_config::ConfigParser;
use std::sync::Arc;
use tokio::sync::{watch, RwLock, RwLockReadGuard};
use tracing::{debug, error, info, warn};
use tunnel_ipc::{Command, ServiceError, ServiceEvent, TunnelSnapshot, TunnelState, TunnelUpdate};

pub type ControllerResult<T> = Result<T, ServiceError>;

/// Longest accepted tunnel name.
pub const MAX_NAME_LEN: usize = 32;

/// Check a tunnel name: 1 to 32 characters from `[A-Za-z0-9_=+.-]`.
pub fn validate_name(name: &str) -> ControllerResult<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '=' | '+' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(ServiceError::InvalidName(name.to_string()))
    }
}

pub struct LifecycleController {
    registry: Arc<TunnelRegistry>,
    dataplane: Arc<dyn Dataplane>,
    parser: Arc<dyn ConfigParser>,
    /// `true` once the service has halted. Commands hold a read guard for
    /// their whole run so that quitting waits for them.
    gate: RwLock<bool>,
    shutdown_tx: watch::Sender<bool>,
}

impl LifecycleController {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        dataplane: Arc<dyn Dataplane>,
        parser: Arc<dyn ConfigParser>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            registry,
            dataplane,
            parser,
            gate: RwLock::new(false),
            shutdown_tx,
        }
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    /// Register on the notification bus.
    pub fn subscribe(&self) -> Subscription {
        self.registry.bus().subscribe()
    }

    /// Flips to `true` when a quit succeeds.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    async fn enter(&self) -> ControllerResult<RwLockReadGuard<'_, bool>> {
        let gate = self.gate.read().await;
        if *gate {
            return Err(ServiceError::ShuttingDown);
        }
        Ok(gate)
    }

    /// Register a new `Stopped` tunnel.
    pub async fn create(&self, name: &str, config_text: &str) -> ControllerResult<TunnelUpdate> {
        let _gate = self.enter().await?;

        validate_name(name)?;
        let config = self
            .parser
            .parse(config_text)
            .map_err(|e| ServiceError::InvalidConfig(e.to_string()))?;
        let public_key = config.public_key();

        let update = self.registry.insert(name, config, TunnelState::Stopped)?;
        match public_key {
            Some(key) => info!(tunnel = name, public_key = %key, seq = update.seq, "Created tunnel"),
            None => info!(tunnel = name, seq = update.seq, "Created tunnel"),
        }
        Ok(update)
    }

    /// Bring a `Stopped` tunnel up.
    pub async fn start(&self, name: &str) -> ControllerResult<TunnelUpdate> {
        let _gate = self.enter().await?;

        self.registry
            .transition(name, TunnelState::Starting, Command::Start)?;
        let config = self
            .registry
            .config(name)
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;

        info!(tunnel = name, "Starting tunnel");
        match self.dataplane.bring_up(name, &config).await {
            Ok(()) => {
                let update = self
                    .registry
                    .transition(name, TunnelState::Started, Command::Start)?;
                info!(tunnel = name, seq = update.seq, "Tunnel started");
                Ok(update)
            }
            Err(e) => {
                error!(tunnel = name, error = %e, "Bring-up failed");
                self.registry
                    .transition(name, TunnelState::Stopped, Command::Start)?;
                Err(ServiceError::BringUpFailed {
                    name: name.to_string(),
                    detail: e.to_string(),
                })
            }
        }
    }

    /// Tear a `Started` tunnel down. A stop issued while the tunnel is still
    /// `Starting` waits for the start to settle first.
    pub async fn stop(&self, name: &str) -> ControllerResult<TunnelUpdate> {
        let _gate = self.enter().await?;
        self.stop_unguarded(name).await
    }

    async fn stop_unguarded(&self, name: &str) -> ControllerResult<TunnelUpdate> {
        let mut queued = false;
        loop {
            match self
                .registry
                .transition(name, TunnelState::Stopping, Command::Stop)
            {
                Ok(_) => break,
                Err(ServiceError::InvalidTransition { from, .. })
                    if from == TunnelState::Starting
                        || (queued && from == TunnelState::Stopping) =>
                {
                    debug!(tunnel = name, %from, "Stop queued behind in-flight command");
                    queued = true;
                    self.settle(name, from).await?;
                }
                Err(ServiceError::InvalidTransition {
                    from: TunnelState::Stopped,
                    ..
                }) if queued => {
                    debug!(tunnel = name, "Tunnel settled as stopped");
                    return self
                        .registry
                        .get(name)
                        .ok_or_else(|| ServiceError::NotFound(name.to_string()));
                }
                Err(e) => return Err(e),
            }
        }

        info!(tunnel = name, "Stopping tunnel");
        let result = self.dataplane.tear_down(name).await;
        let update = self
            .registry
            .transition(name, TunnelState::Stopped, Command::Stop)?;

        match result {
            Ok(()) => {
                info!(tunnel = name, seq = update.seq, "Tunnel stopped");
                Ok(update)
            }
            Err(e) => {
                error!(tunnel = name, error = %e, "Tear-down failed");
                Err(ServiceError::TeardownFailed {
                    name: name.to_string(),
                    detail: e.to_string(),
                })
            }
        }
    }

    /// Wait until the tunnel leaves `from`.
    async fn settle(&self, name: &str, from: TunnelState) -> ControllerResult<()> {
        let mut state = self
            .registry
            .watch_state(name)
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;
        state
            .wait_for(|current| *current != from)
            .await
            .map_err(|_| ServiceError::NotFound(name.to_string()))?;
        Ok(())
    }

    /// Remove a `Stopped` tunnel.
    pub async fn delete(&self, name: &str) -> ControllerResult<()> {
        let _gate = self.enter().await?;

        self.registry
            .transition(name, TunnelState::Deleting, Command::Delete)?;
        if let Err(e) = self.dataplane.release(name).await {
            warn!(tunnel = name, error = %e, "Failed to release dataplane state");
        }
        self.registry.remove(name)?;
        info!(tunnel = name, "Deleted tunnel");
        Ok(())
    }

    pub fn list(&self) -> TunnelSnapshot {
        self.registry.snapshot()
    }

    pub fn state(&self, name: &str) -> ControllerResult<TunnelUpdate> {
        self.registry
            .get(name)
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))
    }

    /// Halt the service.
    ///
    /// Waits for in-flight commands, then optionally stops every `Started`
    /// tunnel. If any of those stops fails the service keeps running and
    /// `ShutdownAborted` names the tunnel.
    pub async fn quit(&self, stop_outstanding: bool) -> ControllerResult<()> {
        let mut gate = self.gate.write().await;
        if *gate {
            return Err(ServiceError::ShuttingDown);
        }

        if stop_outstanding {
            for name in self.registry.names_in(TunnelState::Started) {
                if let Err(e) = self.stop_unguarded(&name).await {
                    warn!(tunnel = %name, error = %e, "Shutdown aborted");
                    return Err(ServiceError::ShutdownAborted(name));
                }
            }
        }

        *gate = true;
        info!(stop_outstanding, "Service shutting down");
        // Flip before publishing: a subscriber registered after the event
        // is then guaranteed to see the flag
        self.shutdown_tx.send_replace(true);
        self.registry.bus().publish(ServiceEvent::ShuttingDown);
        Ok(())
    }

    /// Register tunnels the dataplane reports as already running. Returns
    /// the number adopted.
    pub async fn adopt_running(&self) -> ControllerResult<usize> {
        let found = self
            .dataplane
            .discover()
            .await
            .map_err(|e| ServiceError::Internal(format!("discovery failed: {e}")))?;

        let mut adopted = 0;
        for (name, config) in found {
            if let Err(e) = validate_name(&name) {
                warn!(error = %e, "Ignoring discovered tunnel");
                continue;
            }
            match self.registry.insert(&name, config, TunnelState::Started) {
                Ok(update) => {
                    info!(tunnel = %name, seq = update.seq, "Adopted running tunnel");
                    adopted += 1;
                }
                Err(e) => warn!(tunnel = %name, error = %e, "Could not adopt tunnel"),
            }
        }
        Ok(adopted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        for name in ["wg0", "office-vpn", "a.b_c+d=e", &"x".repeat(MAX_NAME_LEN)] {
            assert!(validate_name(name).is_ok(), "{name} should be valid");
        }
        for name in ["", "with space", "slash/name", "ünïcode", &"x".repeat(MAX_NAME_LEN + 1)] {
            assert_eq!(
                validate_name(name),
                Err(ServiceError::InvalidName(name.to_string()))
            );
        }
    }
}
