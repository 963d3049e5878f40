//! Client-side copy of the service's tunnel table.
//!
//! Updates come from two unordered sources: live notifications and list
//! snapshots. Both are applied with the same rule: an entry only moves
//! forward in sequence order. Replaying, duplicating or reordering inputs
//! therefore never moves a tunnel backwards.

use std::collections::{BTreeMap, HashMap};
use tunnel_ipc::{Seq, TunnelSnapshot, TunnelState, TunnelUpdate};

/// A visible change to the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorChange {
    Updated(TunnelUpdate),
    Removed { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    state: TunnelState,
    seq: Seq,
}

#[derive(Debug, Default, Clone)]
pub struct ClientMirror {
    tunnels: BTreeMap<String, Entry>,
    /// Sequence numbers of removals not yet covered by a snapshot
    tombstones: HashMap<String, Seq>,
    /// Highest `as_of` of any applied snapshot. An unseen tunnel with a
    /// sequence number at or below it is stale: the snapshot would have
    /// listed it otherwise.
    floor: Seq,
}

impl ClientMirror {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_stale(&self, name: &str, seq: Seq) -> bool {
        if let Some(entry) = self.tunnels.get(name) {
            return seq <= entry.seq;
        }
        if self.tombstones.get(name).is_some_and(|&removed| seq <= removed) {
            return true;
        }
        seq <= self.floor
    }

    /// Apply one `(name, state, seq)` observation.
    pub fn apply_update(&mut self, update: TunnelUpdate) -> Option<MirrorChange> {
        if self.is_stale(&update.name, update.seq) {
            return None;
        }

        self.tombstones.remove(&update.name);
        self.tunnels.insert(
            update.name.clone(),
            Entry {
                state: update.state,
                seq: update.seq,
            },
        );
        Some(MirrorChange::Updated(update))
    }

    /// Apply a removal notice.
    pub fn apply_removal(&mut self, name: &str, seq: Seq) -> Option<MirrorChange> {
        if self.is_stale(name, seq) {
            return None;
        }

        self.tombstones.insert(name.to_string(), seq);
        self.tunnels
            .remove(name)
            .map(|_| MirrorChange::Removed {
                name: name.to_string(),
            })
    }

    /// Merge a snapshot. Tunnels missing from it are dropped unless the
    /// mirror already holds something newer than the snapshot.
    pub fn apply_snapshot(&mut self, snapshot: TunnelSnapshot) -> Vec<MirrorChange> {
        let as_of = snapshot.as_of;
        let listed: Vec<String> = snapshot.tunnels.iter().map(|t| t.name.clone()).collect();

        let mut changes: Vec<MirrorChange> = snapshot
            .tunnels
            .into_iter()
            .filter_map(|update| self.apply_update(update))
            .collect();

        let vanished: Vec<String> = self
            .tunnels
            .iter()
            .filter(|(name, entry)| entry.seq <= as_of && !listed.contains(name))
            .map(|(name, _)| name.clone())
            .collect();
        for name in vanished {
            self.tunnels.remove(&name);
            changes.push(MirrorChange::Removed { name });
        }

        self.floor = self.floor.max(as_of);
        self.tombstones.retain(|_, &mut removed| removed > as_of);
        changes
    }

    pub fn get(&self, name: &str) -> Option<TunnelUpdate> {
        self.tunnels.get(name).map(|entry| TunnelUpdate {
            name: name.to_string(),
            state: entry.state,
            seq: entry.seq,
        })
    }

    pub fn state(&self, name: &str) -> Option<TunnelState> {
        self.tunnels.get(name).map(|entry| entry.state)
    }

    /// All tunnels, sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = TunnelUpdate> + '_ {
        self.tunnels.iter().map(|(name, entry)| TunnelUpdate {
            name: name.clone(),
            state: entry.state,
            seq: entry.seq,
        })
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TunnelState::*;

    fn update(name: &str, state: TunnelState, seq: Seq) -> TunnelUpdate {
        TunnelUpdate {
            name: name.to_string(),
            state,
            seq,
        }
    }

    fn snapshot(tunnels: Vec<TunnelUpdate>, as_of: Seq) -> TunnelSnapshot {
        TunnelSnapshot { tunnels, as_of }
    }

    fn view(mirror: &ClientMirror) -> Vec<(String, TunnelState)> {
        mirror.iter().map(|t| (t.name, t.state)).collect()
    }

    #[test]
    fn test_older_or_equal_sequence_is_ignored() {
        let mut mirror = ClientMirror::new();
        assert!(mirror.apply_update(update("t1", Starting, 5)).is_some());

        assert_eq!(mirror.apply_update(update("t1", Stopped, 4)), None);
        assert_eq!(mirror.apply_update(update("t1", Started, 5)), None);
        assert_eq!(mirror.state("t1"), Some(Starting));

        assert_eq!(
            mirror.apply_update(update("t1", Started, 6)),
            Some(MirrorChange::Updated(update("t1", Started, 6)))
        );
    }

    #[test]
    fn test_snapshot_older_than_notification_does_not_regress() {
        let mut mirror = ClientMirror::new();
        mirror.apply_update(update("t1", Started, 7));

        // A list computed before the notification arrives late
        let changes = mirror.apply_snapshot(snapshot(vec![update("t1", Starting, 6)], 6));
        assert!(changes.is_empty());
        assert_eq!(mirror.state("t1"), Some(Started));
    }

    #[test]
    fn test_snapshot_drops_missing_tunnels() {
        let mut mirror = ClientMirror::new();
        mirror.apply_update(update("gone", Deleting, 3));
        mirror.apply_update(update("kept", Stopped, 4));
        mirror.apply_update(update("newer", Stopped, 9));

        let changes = mirror.apply_snapshot(snapshot(vec![update("kept", Stopped, 4)], 8));
        assert_eq!(
            changes,
            vec![MirrorChange::Removed {
                name: "gone".to_string()
            }]
        );
        // "newer" was created after the snapshot was taken
        assert_eq!(
            view(&mirror),
            vec![("kept".to_string(), Stopped), ("newer".to_string(), Stopped)]
        );
    }

    #[test]
    fn test_removal_is_not_resurrected_by_stale_snapshot() {
        let mut mirror = ClientMirror::new();
        mirror.apply_update(update("t1", Deleting, 10));
        assert_eq!(
            mirror.apply_removal("t1", 11),
            Some(MirrorChange::Removed {
                name: "t1".to_string()
            })
        );

        let changes = mirror.apply_snapshot(snapshot(vec![update("t1", Stopped, 9)], 9));
        assert!(changes.is_empty());
        assert!(mirror.is_empty());

        // A new tunnel of the same name has a larger sequence number
        assert!(mirror.apply_update(update("t1", Stopped, 12)).is_some());
        assert_eq!(mirror.state("t1"), Some(Stopped));
    }

    #[test]
    fn test_stale_events_after_snapshot_are_ignored() {
        let mut mirror = ClientMirror::new();
        mirror.apply_snapshot(snapshot(vec![], 20));

        // Buffered notifications for a tunnel deleted before the snapshot
        assert_eq!(mirror.apply_update(update("old", Deleting, 18)), None);
        assert_eq!(mirror.apply_removal("old", 19), None);
        assert!(mirror.is_empty());
    }

    #[test]
    fn test_removal_of_older_incarnation_is_ignored() {
        let mut mirror = ClientMirror::new();
        mirror.apply_snapshot(snapshot(vec![update("t1", Stopped, 15)], 15));

        assert_eq!(mirror.apply_removal("t1", 12), None);
        assert_eq!(mirror.state("t1"), Some(Stopped));
    }

    #[test]
    fn test_replay_is_idempotent() {
        let inputs = vec![
            update("a", Stopped, 1),
            update("b", Stopped, 2),
            update("a", Starting, 3),
            update("a", Started, 4),
            update("b", Deleting, 5),
        ];

        let mut once = ClientMirror::new();
        for input in inputs.clone() {
            once.apply_update(input);
        }
        let mut twice = once.clone();
        for input in inputs {
            assert_eq!(twice.apply_update(input), None);
        }
        assert_eq!(view(&once), view(&twice));
    }

    #[test]
    fn test_mirrors_converge_regardless_of_order() {
        let notifications = vec![
            update("a", Stopped, 1),
            update("a", Starting, 2),
            update("b", Stopped, 3),
            update("a", Started, 4),
            update("b", Deleting, 5),
        ];
        let final_snapshot = snapshot(vec![update("a", Started, 4)], 6);

        let mut forward = ClientMirror::new();
        for n in notifications.clone() {
            forward.apply_update(n);
        }
        forward.apply_removal("b", 6);
        forward.apply_snapshot(final_snapshot.clone());

        let mut backward = ClientMirror::new();
        backward.apply_snapshot(final_snapshot);
        backward.apply_removal("b", 6);
        for n in notifications.into_iter().rev() {
            backward.apply_update(n);
        }

        assert_eq!(view(&forward), view(&backward));
        assert_eq!(view(&forward), vec![("a".to_string(), Started)]);
    }
}
