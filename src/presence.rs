//! Who else is here, and what do they have selected.
//!
//! The tracker keeps one local record (mutated only by this client)
//! and a mirror of every remote participant, keyed by connection id.
//! Remote records exist purely at the server's pleasure: an `UPDATE`
//! upserts, a `REMOVE` deletes, and there is no timeout-based expiry —
//! a silent peer simply keeps its last record until the server says
//! otherwise.

use std::collections::HashMap;

use crate::document::ObjectId;
use crate::protocol::{ConnectionId, ControlFrame, PresenceState};

pub struct PresenceTracker {
    local: PresenceState,
    remotes: HashMap<ConnectionId, PresenceState>,
}

impl PresenceTracker {
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            local: PresenceState::new(connection_id),
            remotes: HashMap::new(),
        }
    }

    /// This client's record, as peers will see it.
    pub fn local(&self) -> &PresenceState {
        &self.local
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.local.connection_id
    }

    /// Update the local display name. Returns whether anything
    /// changed, so the caller knows to broadcast.
    pub fn set_name(&mut self, name: Option<String>) -> bool {
        if self.local.name == name {
            return false;
        }
        self.local.name = name;
        true
    }

    /// Replace the local selection. Returns whether anything changed.
    pub fn set_selection(&mut self, selected: Vec<ObjectId>) -> bool {
        if self.local.selected_object_ids == selected {
            return false;
        }
        self.local.selected_object_ids = selected;
        true
    }

    /// Fold one inbound control frame into the remote mirror. Returns
    /// whether the mirror changed. Frames echoing our own connection
    /// id are skipped.
    pub fn apply(&mut self, frame: &ControlFrame) -> bool {
        match frame {
            ControlFrame::Update(state) => {
                if state.connection_id == self.local.connection_id {
                    return false;
                }
                let previous = self.remotes.insert(state.connection_id, state.clone());
                previous.as_ref() != Some(state)
            }
            ControlFrame::Remove(id) => {
                if *id == self.local.connection_id {
                    return false;
                }
                self.remotes.remove(id).is_some()
            }
            ControlFrame::Ignored => false,
        }
    }

    /// Remote participants, sorted by connection id for a stable UI
    /// order.
    pub fn remotes(&self) -> Vec<&PresenceState> {
        let mut peers: Vec<&PresenceState> = self.remotes.values().collect();
        peers.sort_by_key(|p| p.connection_id);
        peers
    }

    pub fn remote_count(&self) -> usize {
        self.remotes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn update(id: ConnectionId, name: &str, selected: &[&str]) -> ControlFrame {
        let mut state = PresenceState::new(id);
        state.name = Some(name.to_string());
        state.selected_object_ids = selected.iter().map(|s| s.to_string()).collect();
        ControlFrame::Update(state)
    }

    #[test]
    fn test_upsert_and_remove() {
        let mut tracker = PresenceTracker::new(Uuid::new_v4());
        let peer = Uuid::new_v4();

        assert!(tracker.apply(&update(peer, "Bob", &["n1"])));
        assert_eq!(tracker.remote_count(), 1);
        assert_eq!(tracker.remotes()[0].name.as_deref(), Some("Bob"));

        // Full-record replacement, not a patch.
        assert!(tracker.apply(&update(peer, "Bob", &[])));
        assert!(tracker.remotes()[0].selected_object_ids.is_empty());

        assert!(tracker.apply(&ControlFrame::Remove(peer)));
        assert_eq!(tracker.remote_count(), 0);
    }

    #[test]
    fn test_identical_update_reports_unchanged() {
        let mut tracker = PresenceTracker::new(Uuid::new_v4());
        let peer = Uuid::new_v4();
        assert!(tracker.apply(&update(peer, "Bob", &["n1"])));
        assert!(!tracker.apply(&update(peer, "Bob", &["n1"])));
    }

    #[test]
    fn test_own_frames_are_skipped() {
        let me = Uuid::new_v4();
        let mut tracker = PresenceTracker::new(me);
        assert!(!tracker.apply(&update(me, "Echo", &["n1"])));
        assert_eq!(tracker.remote_count(), 0);
        assert!(!tracker.apply(&ControlFrame::Remove(me)));
    }

    #[test]
    fn test_remove_unknown_peer_is_noop() {
        let mut tracker = PresenceTracker::new(Uuid::new_v4());
        assert!(!tracker.apply(&ControlFrame::Remove(Uuid::new_v4())));
    }

    #[test]
    fn test_ignored_frame_changes_nothing() {
        let mut tracker = PresenceTracker::new(Uuid::new_v4());
        assert!(!tracker.apply(&ControlFrame::Ignored));
    }

    #[test]
    fn test_local_mutations_report_changes() {
        let mut tracker = PresenceTracker::new(Uuid::new_v4());
        assert!(tracker.set_name(Some("Alice".to_string())));
        assert!(!tracker.set_name(Some("Alice".to_string())));
        assert!(tracker.set_selection(vec!["n1".to_string()]));
        assert!(!tracker.set_selection(vec!["n1".to_string()]));
        assert!(tracker.set_selection(Vec::new()));
    }

    #[test]
    fn test_remotes_sorted_by_connection_id() {
        let mut tracker = PresenceTracker::new(Uuid::new_v4());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        tracker.apply(&update(a, "A", &[]));
        tracker.apply(&update(b, "B", &[]));
        let ids: Vec<ConnectionId> = tracker.remotes().iter().map(|p| p.connection_id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }
}
