//! Replicated document store for the workflow canvas.
//!
//! A `FlowDocument` is a grow-only graph of content-addressed changes:
//!
//! ```text
//!             ┌────────┐
//!   deps ────▶│ change │──▶ SHA-256 ──▶ ChangeHash
//!             └────────┘
//!                 │ ops folded at integration time
//!                 ▼
//!           CanvasState (LWW registers) ──▶ CanvasView
//! ```
//!
//! The "heads" — changes nothing else depends on yet — identify a
//! document version. Lamport clocks are derived when a change is
//! integrated (`1 + max(dep clocks)`), so replicas that hold the same
//! change set always agree on every stamp and therefore on the folded
//! canvas. Changes whose dependencies have not arrived yet are parked
//! in a pending set and integrated once the gap closes.

pub mod change;
mod canvas;

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

pub use canvas::{CanvasView, EdgeView, NodeView};
pub use change::{
    ActorId, CanvasOp, Change, ChangeDraft, ChangeHash, CommitOptions, NodeData, ObjectId,
    Position, Stamp,
};

use crate::history::HistoryEntry;
use canvas::CanvasState;
use uuid::Uuid;

/// Document-layer errors.
#[derive(Debug, Clone)]
pub enum DocumentError {
    /// A delta could not be decoded. Fatal for that message only.
    CorruptDelta(String),
    /// A requested head is not part of this document's change graph.
    UnknownHead(ChangeHash),
    /// A persisted snapshot could not be decoded or is incomplete.
    CorruptSnapshot(String),
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CorruptDelta(e) => write!(f, "Corrupt delta: {e}"),
            Self::UnknownHead(h) => write!(f, "Unknown head: {h}"),
            Self::CorruptSnapshot(e) => write!(f, "Corrupt snapshot: {e}"),
        }
    }
}

impl std::error::Error for DocumentError {}

/// Result of feeding one remote delta into the document.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// The change (and possibly previously deferred changes unblocked
    /// by it) was folded into the canvas.
    Integrated { applied: Vec<ChangeHash> },
    /// Already known; nothing to do.
    Duplicate,
    /// Dependencies missing; parked until they arrive.
    Deferred,
}

/// Opaque persisted form of a document, history included.
#[derive(Clone)]
pub struct DocumentSnapshot {
    content: Vec<u8>,
}

impl DocumentSnapshot {
    pub fn new(content: Vec<u8>) -> Self {
        Self { content }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.content
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.content
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

impl std::fmt::Debug for DocumentSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSnapshot")
            .field("bytes", &self.content.len())
            .finish()
    }
}

#[derive(Debug, Clone)]
struct StoredChange {
    change: Change,
    lamport: u64,
}

/// The replicated document: change graph plus folded canvas.
#[derive(Debug, Clone)]
pub struct FlowDocument {
    actor: ActorId,
    seq: u64,
    changes: HashMap<ChangeHash, StoredChange>,
    /// Sorted; changes no other integrated change depends on.
    heads: Vec<ChangeHash>,
    /// Decoded changes waiting for missing dependencies.
    pending: Vec<(ChangeHash, Change)>,
    state: CanvasState,
}

impl FlowDocument {
    pub fn new() -> Self {
        Self::with_actor(Uuid::new_v4())
    }

    pub fn with_actor(actor: ActorId) -> Self {
        Self {
            actor,
            seq: 0,
            changes: HashMap::new(),
            heads: Vec::new(),
            pending: Vec::new(),
            state: CanvasState::default(),
        }
    }

    pub fn actor(&self) -> ActorId {
        self.actor
    }

    /// Current heads, sorted. Two replicas with equal heads hold the
    /// same document.
    pub fn heads(&self) -> &[ChangeHash] {
        &self.heads
    }

    pub fn contains(&self, hash: &ChangeHash) -> bool {
        self.changes.contains_key(hash)
    }

    pub fn change_count(&self) -> usize {
        self.changes.len()
    }

    /// Number of changes parked waiting for dependencies.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Start collecting ops for a commit.
    pub fn begin(&self) -> ChangeDraft {
        ChangeDraft::default()
    }

    /// Commit a draft against the current heads.
    ///
    /// An empty draft with no message is a no-op and returns `None`.
    /// An empty draft WITH a message still records a change, so
    /// annotation-only commits show up in the history log.
    pub fn commit(&mut self, draft: ChangeDraft, opts: CommitOptions) -> Option<ChangeHash> {
        if draft.is_empty() && opts.message.is_none() {
            return None;
        }
        Some(self.commit_ops(draft.into_ops(), opts.message, opts.author))
    }

    /// Record a local change unconditionally. Shared by `commit` and
    /// `restore`.
    fn commit_ops(
        &mut self,
        ops: Vec<CanvasOp>,
        message: Option<String>,
        author: Option<String>,
    ) -> ChangeHash {
        let change = Change {
            actor: self.actor,
            seq: self.seq + 1,
            deps: self.heads.clone(),
            timestamp: now_ms(),
            message,
            author,
            ops,
        };
        self.seq += 1;
        let hash = change.hash();
        self.integrate(hash, change);
        hash
    }

    /// Feed one remote delta into the document.
    ///
    /// Safe against anything the network delivers: malformed bytes are
    /// a per-message error, duplicates are absorbed, out-of-order
    /// deliveries are parked until their dependencies arrive.
    pub fn merge_change(&mut self, bytes: &[u8]) -> Result<MergeOutcome, DocumentError> {
        let change = Change::decode(bytes)?;
        Ok(self.merge_decoded(change))
    }

    fn merge_decoded(&mut self, change: Change) -> MergeOutcome {
        let hash = change.hash();
        if self.changes.contains_key(&hash) || self.pending.iter().any(|(h, _)| *h == hash) {
            return MergeOutcome::Duplicate;
        }
        if !self.deps_satisfied(&change) {
            log::debug!("Deferring change {} (missing deps)", hash.short());
            self.pending.push((hash, change));
            return MergeOutcome::Deferred;
        }

        let mut applied = vec![hash];
        self.integrate(hash, change);

        // Integrating one change can unblock a chain of deferred ones.
        loop {
            let ready = self
                .pending
                .iter()
                .position(|(_, c)| self.deps_satisfied(c));
            match ready {
                Some(i) => {
                    let (h, c) = self.pending.remove(i);
                    self.integrate(h, c);
                    applied.push(h);
                }
                None => break,
            }
        }
        MergeOutcome::Integrated { applied }
    }

    fn deps_satisfied(&self, change: &Change) -> bool {
        change.deps.iter().all(|d| self.changes.contains_key(d))
    }

    /// Fold an integration-ready change into the canvas and advance
    /// the heads. All deps must already be integrated.
    fn integrate(&mut self, hash: ChangeHash, change: Change) {
        let lamport = 1 + change
            .deps
            .iter()
            .filter_map(|d| self.changes.get(d))
            .map(|s| s.lamport)
            .max()
            .unwrap_or(0);

        for (i, op) in change.ops.iter().enumerate() {
            let stamp = Stamp {
                lamport,
                change: hash,
                op: i as u32,
            };
            self.state.apply(stamp, op);
        }

        self.heads.retain(|h| !change.deps.contains(h));
        self.heads.push(hash);
        self.heads.sort();
        self.changes.insert(hash, StoredChange { change, lamport });
    }

    /// Encoded changes outside the ancestor closure of `baseline`, in
    /// causal order. With an empty baseline this is the full history.
    pub fn changes_since(&self, baseline: &[ChangeHash]) -> Vec<Vec<u8>> {
        let covered = self.closure(baseline);
        let mut missing: Vec<(u64, ChangeHash)> = self
            .changes
            .iter()
            .filter(|(h, _)| !covered.contains(*h))
            .map(|(h, s)| (s.lamport, *h))
            .collect();
        missing.sort();
        missing
            .into_iter()
            .map(|(_, h)| self.changes[&h].change.encode())
            .collect()
    }

    /// Ancestor closure of the given heads. Unknown hashes contribute
    /// nothing, which makes a foreign baseline equivalent to an empty
    /// one.
    fn closure(&self, heads: &[ChangeHash]) -> HashSet<ChangeHash> {
        let mut seen = HashSet::new();
        let mut stack: Vec<ChangeHash> = heads.to_vec();
        while let Some(h) = stack.pop() {
            if let Some(stored) = self.changes.get(&h) {
                if seen.insert(h) {
                    stack.extend(stored.change.deps.iter().copied());
                }
            }
        }
        seen
    }

    /// Live canvas.
    pub fn view(&self) -> CanvasView {
        self.state.view()
    }

    /// Canvas as of an earlier set of heads. Pure: the live state is
    /// untouched.
    pub fn view_at(&self, heads: &[ChangeHash]) -> Result<CanvasView, DocumentError> {
        for h in heads {
            if !self.changes.contains_key(h) {
                return Err(DocumentError::UnknownHead(*h));
            }
        }
        let covered = self.closure(heads);
        let mut state = CanvasState::default();
        for h in &covered {
            let stored = &self.changes[h];
            for (i, op) in stored.change.ops.iter().enumerate() {
                let stamp = Stamp {
                    lamport: stored.lamport,
                    change: *h,
                    op: i as u32,
                };
                state.apply(stamp, op);
            }
        }
        Ok(state.view())
    }

    /// Bring back an earlier version as a NEW forward change.
    ///
    /// The committed ops rewrite the live canvas into a full copy of
    /// the canvas at `heads`; nothing is truncated, so the history log
    /// keeps every change including the one this creates.
    pub fn restore(
        &mut self,
        heads: &[ChangeHash],
        author: Option<String>,
    ) -> Result<ChangeHash, DocumentError> {
        let target = self.view_at(heads)?;
        let current = self.state.view();

        let mut ops = Vec::new();
        for edge in &current.edges {
            if target.edge(&edge.id).is_none() {
                ops.push(CanvasOp::RemoveEdge {
                    id: edge.id.clone(),
                });
            }
        }
        for node in &current.nodes {
            if target.node(&node.id).is_none() {
                ops.push(CanvasOp::RemoveNode {
                    id: node.id.clone(),
                });
            }
        }
        for node in &target.nodes {
            ops.push(CanvasOp::AddNode {
                id: node.id.clone(),
                position: node.position,
                data: node.data.clone(),
            });
        }
        for edge in &target.edges {
            ops.push(CanvasOp::AddEdge {
                id: edge.id.clone(),
                source: edge.source.clone(),
                target: edge.target.clone(),
            });
        }

        let label = heads
            .iter()
            .map(|h| h.short())
            .collect::<Vec<_>>()
            .join("+");
        let message = format!("Restored version {label}");
        log::info!("Restoring canvas to {label} ({} op(s))", ops.len());
        Ok(self.commit_ops(ops, Some(message), author))
    }

    /// Full-fidelity persisted form: every integrated change, in
    /// causal order. Deferred changes are not included.
    pub fn snapshot(&self) -> DocumentSnapshot {
        let mut ordered: Vec<(u64, ChangeHash)> = self
            .changes
            .iter()
            .map(|(h, s)| (s.lamport, *h))
            .collect();
        ordered.sort();
        let changes: Vec<&Change> = ordered
            .iter()
            .map(|(_, h)| &self.changes[h].change)
            .collect();
        let content = bincode::serde::encode_to_vec(&changes, bincode::config::standard())
            .unwrap_or_default();
        DocumentSnapshot { content }
    }

    /// Rebuild a document from a snapshot, replaying changes through
    /// the same dependency-gated path network merges use.
    pub fn from_snapshot(
        actor: ActorId,
        snapshot: &DocumentSnapshot,
    ) -> Result<Self, DocumentError> {
        let (changes, _): (Vec<Change>, _) =
            bincode::serde::decode_from_slice(&snapshot.content, bincode::config::standard())
                .map_err(|e| DocumentError::CorruptSnapshot(e.to_string()))?;

        let mut doc = Self::with_actor(actor);
        for change in changes {
            doc.merge_decoded(change);
        }
        if !doc.pending.is_empty() {
            return Err(DocumentError::CorruptSnapshot(
                "snapshot is missing change dependencies".to_string(),
            ));
        }
        // Resume the per-actor counter if the same actor reopens.
        doc.seq = doc
            .changes
            .values()
            .filter(|s| s.change.actor == actor)
            .map(|s| s.change.seq)
            .max()
            .unwrap_or(0);
        Ok(doc)
    }

    /// History log for the time-travel UI, in causal order. Viewing
    /// an entry means calling [`view_at`](Self::view_at) with the
    /// entry's hash as the single head.
    pub fn log(&self) -> Vec<HistoryEntry> {
        let mut ordered: Vec<(u64, ChangeHash)> = self
            .changes
            .iter()
            .map(|(h, s)| (s.lamport, *h))
            .collect();
        ordered.sort();
        ordered
            .into_iter()
            .map(|(_, h)| {
                let c = &self.changes[&h].change;
                HistoryEntry {
                    hash: h,
                    message: c.message.clone(),
                    author: c.author.clone(),
                    timestamp: c.timestamp,
                }
            })
            .collect()
    }
}

impl Default for FlowDocument {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_node(doc: &mut FlowDocument, id: &str, x: f64, y: f64) -> ChangeHash {
        let mut draft = doc.begin();
        draft.add_node(id, Position::new(x, y), NodeData::empty());
        doc.commit(draft, CommitOptions::with_message(format!("Added {id}")))
            .unwrap()
    }

    #[test]
    fn test_commit_applies_ops() {
        let mut doc = FlowDocument::new();
        add_node(&mut doc, "n1", 1.0, 2.0);
        let view = doc.view();
        assert_eq!(view.nodes.len(), 1);
        assert_eq!(view.node("n1").unwrap().position, Position::new(1.0, 2.0));
        assert_eq!(doc.heads().len(), 1);
    }

    #[test]
    fn test_empty_draft_without_message_is_noop() {
        let mut doc = FlowDocument::new();
        let draft = doc.begin();
        assert!(doc.commit(draft, CommitOptions::default()).is_none());
        assert_eq!(doc.change_count(), 0);
        assert!(doc.heads().is_empty());
    }

    #[test]
    fn test_empty_draft_with_message_is_recorded() {
        let mut doc = FlowDocument::new();
        let draft = doc.begin();
        let hash = doc
            .commit(draft, CommitOptions::with_message("Milestone"))
            .unwrap();
        assert!(doc.contains(&hash));
        assert!(doc.view().is_empty());
        let log = doc.log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].message.as_deref(), Some("Milestone"));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut a = FlowDocument::new();
        add_node(&mut a, "n1", 0.0, 0.0);
        let delta = a.changes_since(&[]).remove(0);

        let mut b = FlowDocument::new();
        match b.merge_change(&delta).unwrap() {
            MergeOutcome::Integrated { applied } => assert_eq!(applied.len(), 1),
            other => panic!("Expected Integrated, got {other:?}"),
        }
        assert_eq!(b.merge_change(&delta).unwrap(), MergeOutcome::Duplicate);
        assert_eq!(b.view(), a.view());
    }

    #[test]
    fn test_merge_is_commutative() {
        let mut origin = FlowDocument::new();
        add_node(&mut origin, "n1", 0.0, 0.0);
        add_node(&mut origin, "n2", 5.0, 5.0);
        let deltas = origin.changes_since(&[]);
        assert_eq!(deltas.len(), 2);

        let mut forward = FlowDocument::new();
        for d in &deltas {
            forward.merge_change(d).unwrap();
        }
        let mut backward = FlowDocument::new();
        for d in deltas.iter().rev() {
            backward.merge_change(d).unwrap();
        }

        assert_eq!(forward.view(), backward.view());
        assert_eq!(forward.heads(), backward.heads());
    }

    #[test]
    fn test_out_of_order_delivery_defers() {
        let mut origin = FlowDocument::new();
        add_node(&mut origin, "n1", 0.0, 0.0);
        add_node(&mut origin, "n2", 5.0, 5.0);
        let deltas = origin.changes_since(&[]);

        let mut replica = FlowDocument::new();
        // Second change first: its dep is missing.
        assert_eq!(
            replica.merge_change(&deltas[1]).unwrap(),
            MergeOutcome::Deferred
        );
        assert_eq!(replica.pending_count(), 1);
        assert!(replica.view().is_empty());

        // The missing dep unblocks the deferred change.
        match replica.merge_change(&deltas[0]).unwrap() {
            MergeOutcome::Integrated { applied } => assert_eq!(applied.len(), 2),
            other => panic!("Expected Integrated, got {other:?}"),
        }
        assert_eq!(replica.pending_count(), 0);
        assert_eq!(replica.view(), origin.view());
    }

    #[test]
    fn test_corrupt_delta_leaves_document_intact() {
        let mut doc = FlowDocument::new();
        add_node(&mut doc, "n1", 0.0, 0.0);
        let before = doc.view();
        let result = doc.merge_change(&[0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(matches!(result, Err(DocumentError::CorruptDelta(_))));
        assert_eq!(doc.view(), before);
    }

    #[test]
    fn test_changes_since_baseline() {
        let mut doc = FlowDocument::new();
        add_node(&mut doc, "n1", 0.0, 0.0);
        let baseline = doc.heads().to_vec();
        add_node(&mut doc, "n2", 1.0, 1.0);
        add_node(&mut doc, "n3", 2.0, 2.0);

        assert_eq!(doc.changes_since(&[]).len(), 3);
        assert_eq!(doc.changes_since(&baseline).len(), 2);
        assert!(doc.changes_since(doc.heads()).is_empty());
    }

    #[test]
    fn test_view_at_is_pure() {
        let mut doc = FlowDocument::new();
        add_node(&mut doc, "n1", 0.0, 0.0);
        let old_heads = doc.heads().to_vec();
        add_node(&mut doc, "n2", 1.0, 1.0);

        let old_view = doc.view_at(&old_heads).unwrap();
        assert_eq!(old_view.nodes.len(), 1);
        assert!(old_view.node("n2").is_none());
        // Live canvas untouched.
        assert_eq!(doc.view().nodes.len(), 2);
    }

    #[test]
    fn test_view_at_unknown_head() {
        let doc = FlowDocument::new();
        let result = doc.view_at(&[ChangeHash([9u8; 32])]);
        assert!(matches!(result, Err(DocumentError::UnknownHead(_))));
    }

    #[test]
    fn test_restore_is_additive() {
        let mut doc = FlowDocument::new();
        add_node(&mut doc, "n1", 0.0, 0.0);
        let early = doc.heads().to_vec();
        add_node(&mut doc, "n2", 1.0, 1.0);
        let count_before = doc.change_count();

        let hash = doc.restore(&early, Some("Alice".to_string())).unwrap();

        // Canvas matches the restored version...
        let view = doc.view();
        assert_eq!(view.nodes.len(), 1);
        assert!(view.node("n1").is_some());
        // ...but history only grew.
        assert_eq!(doc.change_count(), count_before + 1);
        assert!(doc.contains(&hash));
        let last = doc.log().pop().unwrap();
        assert_eq!(last.hash, hash);
        assert!(last.message.unwrap().starts_with("Restored"));
        assert_eq!(last.author.as_deref(), Some("Alice"));
        // The pre-restore version is still viewable.
        assert_eq!(doc.view_at(&early).unwrap().nodes.len(), 1);
    }

    #[test]
    fn test_restore_then_restore_back() {
        let mut doc = FlowDocument::new();
        add_node(&mut doc, "n1", 0.0, 0.0);
        let v1 = doc.heads().to_vec();
        add_node(&mut doc, "n2", 1.0, 1.0);
        let v2 = doc.heads().to_vec();

        doc.restore(&v1, None).unwrap();
        assert_eq!(doc.view().nodes.len(), 1);
        doc.restore(&v2, None).unwrap();
        assert_eq!(doc.view().nodes.len(), 2);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut doc = FlowDocument::new();
        add_node(&mut doc, "n1", 0.0, 0.0);
        add_node(&mut doc, "n2", 3.0, 4.0);

        let snapshot = doc.snapshot();
        let restored = FlowDocument::from_snapshot(Uuid::new_v4(), &snapshot).unwrap();

        assert_eq!(restored.view(), doc.view());
        assert_eq!(restored.heads(), doc.heads());
        assert_eq!(restored.log().len(), doc.log().len());
    }

    #[test]
    fn test_snapshot_resumes_actor_seq() {
        let actor = Uuid::new_v4();
        let mut doc = FlowDocument::with_actor(actor);
        add_node(&mut doc, "n1", 0.0, 0.0);
        add_node(&mut doc, "n2", 1.0, 1.0);

        let mut reopened = FlowDocument::from_snapshot(actor, &doc.snapshot()).unwrap();
        let hash = add_node(&mut reopened, "n3", 2.0, 2.0);
        // The new change must not collide with the persisted ones.
        assert!(reopened.contains(&hash));
        assert_eq!(reopened.change_count(), 3);
    }

    #[test]
    fn test_corrupt_snapshot() {
        let snapshot = DocumentSnapshot::new(vec![0xFF; 8]);
        let result = FlowDocument::from_snapshot(Uuid::new_v4(), &snapshot);
        assert!(matches!(result, Err(DocumentError::CorruptSnapshot(_))));
    }

    #[test]
    fn test_concurrent_replicas_converge() {
        let mut origin = FlowDocument::new();
        add_node(&mut origin, "base", 0.0, 0.0);
        let seed = origin.changes_since(&[]);

        let mut a = FlowDocument::new();
        let mut b = FlowDocument::new();
        for d in &seed {
            a.merge_change(d).unwrap();
            b.merge_change(d).unwrap();
        }

        // Concurrent edits on both sides.
        let a_base = a.heads().to_vec();
        let b_base = b.heads().to_vec();
        add_node(&mut a, "from-a", 1.0, 1.0);
        add_node(&mut b, "from-b", 2.0, 2.0);

        for d in a.changes_since(&a_base) {
            b.merge_change(&d).unwrap();
        }
        for d in b.changes_since(&b_base) {
            a.merge_change(&d).unwrap();
        }

        assert_eq!(a.heads(), b.heads());
        assert_eq!(a.view(), b.view());
        assert_eq!(a.view().nodes.len(), 3);
    }

    #[test]
    fn test_log_is_causally_ordered() {
        let mut doc = FlowDocument::new();
        add_node(&mut doc, "n1", 0.0, 0.0);
        add_node(&mut doc, "n2", 1.0, 1.0);
        add_node(&mut doc, "n3", 2.0, 2.0);

        let log = doc.log();
        let messages: Vec<Option<&str>> = log.iter().map(|e| e.message.as_deref()).collect();
        assert_eq!(
            messages,
            vec![Some("Added n1"), Some("Added n2"), Some("Added n3")]
        );
    }
}
