//! Authoritative table of tunnels.
//!
//! Every mutation assigns the next value of a single service-wide sequence
//! counter and publishes the matching event on the [`NotificationBus`]
//! before the table lock is released, so subscribers observe events in
//! sequence order and a snapshot taken at `as_of = n` reflects exactly the
//! events numbered `<= n`.

use crate::bus::NotificationBus;
use crate::tunnel_config::TunnelConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info};
use tunnel_ipc::{Command, Seq, ServiceError, ServiceEvent, TunnelSnapshot, TunnelState, TunnelUpdate};

struct TunnelRecord {
    config: Arc<TunnelConfig>,
    state: TunnelState,
    seq: Seq,
    /// Wakes commands waiting for this tunnel to settle
    state_tx: watch::Sender<TunnelState>,
}

impl TunnelRecord {
    fn update(&self, name: &str) -> TunnelUpdate {
        TunnelUpdate {
            name: name.to_string(),
            state: self.state,
            seq: self.seq,
        }
    }
}

#[derive(Default)]
struct Inner {
    tunnels: HashMap<String, TunnelRecord>,
    last_seq: Seq,
}

impl Inner {
    fn next_seq(&mut self) -> Seq {
        self.last_seq += 1;
        self.last_seq
    }
}

/// Mapping from tunnel name to its state, configuration and sequence number.
pub struct TunnelRegistry {
    inner: Mutex<Inner>,
    bus: NotificationBus,
}

impl TunnelRegistry {
    pub fn new(bus: NotificationBus) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            bus,
        }
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a tunnel in `state`. Fails if the name is taken.
    pub fn insert(
        &self,
        name: &str,
        config: TunnelConfig,
        state: TunnelState,
    ) -> Result<TunnelUpdate, ServiceError> {
        let mut inner = self.lock();
        if inner.tunnels.contains_key(name) {
            return Err(ServiceError::AlreadyExists(name.to_string()));
        }

        let seq = inner.next_seq();
        let (state_tx, _) = watch::channel(state);
        let record = TunnelRecord {
            config: Arc::new(config),
            state,
            seq,
            state_tx,
        };
        let update = record.update(name);
        inner.tunnels.insert(name.to_string(), record);

        info!(tunnel = name, %state, seq, "Registered tunnel");
        self.bus.publish(ServiceEvent::StateChanged(update.clone()));
        Ok(update)
    }

    /// Move a tunnel to `to` if the state machine allows it from its current
    /// state. `command` names the operation in the error.
    pub fn transition(
        &self,
        name: &str,
        to: TunnelState,
        command: Command,
    ) -> Result<TunnelUpdate, ServiceError> {
        let mut inner = self.lock();
        let seq = inner.last_seq + 1;
        let record = inner
            .tunnels
            .get_mut(name)
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;

        let from = record.state;
        if !from.can_transition_to(to) {
            debug!(tunnel = name, %from, %to, %command, "Rejected transition");
            return Err(ServiceError::InvalidTransition {
                name: name.to_string(),
                from,
                command,
            });
        }

        record.state = to;
        record.seq = seq;
        record.state_tx.send_replace(to);
        let update = record.update(name);
        inner.last_seq = seq;

        debug!(tunnel = name, %from, %to, seq, "Tunnel transitioned");
        self.bus.publish(ServiceEvent::StateChanged(update.clone()));
        Ok(update)
    }

    /// Drop a tunnel that has finished deleting and announce its removal.
    pub fn remove(&self, name: &str) -> Result<Seq, ServiceError> {
        let mut inner = self.lock();
        match inner.tunnels.get(name).map(|record| record.state) {
            None => return Err(ServiceError::NotFound(name.to_string())),
            Some(TunnelState::Deleting) => {}
            Some(from) => {
                return Err(ServiceError::InvalidTransition {
                    name: name.to_string(),
                    from,
                    command: Command::Delete,
                })
            }
        }

        inner.tunnels.remove(name);
        let seq = inner.next_seq();

        info!(tunnel = name, seq, "Removed tunnel");
        self.bus.publish(ServiceEvent::Removed {
            name: name.to_string(),
            seq,
        });
        Ok(seq)
    }

    pub fn get(&self, name: &str) -> Option<TunnelUpdate> {
        self.lock().tunnels.get(name).map(|record| record.update(name))
    }

    pub fn config(&self, name: &str) -> Option<Arc<TunnelConfig>> {
        self.lock()
            .tunnels
            .get(name)
            .map(|record| Arc::clone(&record.config))
    }

    /// Watch the state of a tunnel. The sender closes when the tunnel is
    /// removed.
    pub fn watch_state(&self, name: &str) -> Option<watch::Receiver<TunnelState>> {
        self.lock()
            .tunnels
            .get(name)
            .map(|record| record.state_tx.subscribe())
    }

    /// Consistent copy of the whole table, sorted by name.
    pub fn snapshot(&self) -> TunnelSnapshot {
        let inner = self.lock();
        let mut tunnels: Vec<TunnelUpdate> = inner
            .tunnels
            .iter()
            .map(|(name, record)| record.update(name))
            .collect();
        tunnels.sort_by(|a, b| a.name.cmp(&b.name));

        TunnelSnapshot {
            tunnels,
            as_of: inner.last_seq,
        }
    }

    /// Names of tunnels currently in `state`.
    pub fn names_in(&self, state: TunnelState) -> Vec<String> {
        let inner = self.lock();
        let mut names: Vec<String> = inner
            .tunnels
            .iter()
            .filter(|(_, record)| record.state == state)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.lock().tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
