//! Tunnel lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle phase of a single tunnel.
///
/// The service is the only writer of this value. Clients hold copies that
/// they reconcile through sequence numbers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelState {
    /// No active dataplane. Initial state of every created tunnel.
    Stopped,
    /// Dataplane is being brought up.
    Starting,
    /// Dataplane is active.
    Started,
    /// Dataplane is being torn down.
    Stopping,
    /// Registry entry is being removed; no further transitions follow.
    Deleting,
}

impl TunnelState {
    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: TunnelState) -> bool {
        use TunnelState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Started)
                | (Starting, Stopped)
                | (Started, Stopping)
                | (Stopping, Stopped)
                | (Stopped, Deleting)
        )
    }

    /// States in which a lifecycle command is in flight.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            TunnelState::Starting | TunnelState::Stopping | TunnelState::Deleting
        )
    }

    /// States in which the dataplane is (or is becoming) active.
    pub fn is_active(self) -> bool {
        matches!(self, TunnelState::Starting | TunnelState::Started)
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelState::Stopped => "stopped",
            TunnelState::Starting => "starting",
            TunnelState::Started => "started",
            TunnelState::Stopping => "stopping",
            TunnelState::Deleting => "deleting",
        };
        f.pad(s)
    }
}

#[cfg(test)]
mod tests {
    use super::TunnelState::*;
    use super::*;

    const ALL: [TunnelState; 5] = [Stopped, Starting, Started, Stopping, Deleting];

    #[test]
    fn test_lifecycle_edges() {
        let edges = [
            (Stopped, Starting),
            (Starting, Started),
            (Starting, Stopped),
            (Started, Stopping),
            (Stopping, Stopped),
            (Stopped, Deleting),
        ];

        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    edges.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_deleting_is_terminal() {
        assert!(ALL.iter().all(|s| !Deleting.can_transition_to(*s)));
    }

    #[test]
    fn test_state_helpers() {
        assert!(Starting.is_transitional());
        assert!(Stopping.is_transitional());
        assert!(Deleting.is_transitional());
        assert!(!Stopped.is_transitional());
        assert!(!Started.is_transitional());

        assert!(Started.is_active());
        assert!(Starting.is_active());
        assert!(!Stopping.is_active());
    }
}
