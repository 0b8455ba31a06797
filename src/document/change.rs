//! Change records: the unit of replication.
//!
//! Every edit to the canvas is captured as a `Change` — a batch of ops
//! with causal dependencies on the heads it was made against. Changes
//! are content-addressed: a `ChangeHash` is the SHA-256 of the change's
//! bincode encoding, so identical changes collide and replicas can
//! detect duplicates without coordination.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::DocumentError;

/// Node and edge identifiers are caller-supplied opaque strings.
pub type ObjectId = String;

/// A replica identity. One per open document handle.
pub type ActorId = Uuid;

/// Canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Opaque node payload, held as raw JSON text.
///
/// The sync layer never inspects node contents; keeping the payload as
/// a string means the binary delta encoding stays self-contained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeData(String);

impl NodeData {
    /// Empty payload (`{}`).
    pub fn empty() -> Self {
        Self("{}".to_string())
    }

    /// Wrap pre-serialized JSON text without validating it.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn from_value(value: &serde_json::Value) -> Self {
        Self(value.to_string())
    }

    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.0)
    }

    pub fn as_raw(&self) -> &str {
        &self.0
    }
}

/// Content address of a change: SHA-256 over its bincode encoding.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChangeHash(pub [u8; 32]);

impl ChangeHash {
    pub const ZERO: ChangeHash = ChangeHash([0u8; 32]);

    /// Short hex form for logs and history UIs.
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl std::fmt::Debug for ChangeHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChangeHash({})", self.short())
    }
}

impl std::fmt::Display for ChangeHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Canvas operations carried inside a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CanvasOp {
    AddNode {
        id: ObjectId,
        position: Position,
        data: NodeData,
    },
    MoveNode {
        id: ObjectId,
        position: Position,
    },
    SetNodeData {
        id: ObjectId,
        data: NodeData,
    },
    RemoveNode {
        id: ObjectId,
    },
    AddEdge {
        id: ObjectId,
        source: ObjectId,
        target: ObjectId,
    },
    RemoveEdge {
        id: ObjectId,
    },
}

/// A committed batch of ops with causal metadata.
///
/// `deps` are the document heads at commit time, sorted; `seq` is a
/// per-actor counter. Lamport clocks are NOT stored in the change —
/// every replica derives them at integration time from the dep graph,
/// which keeps the wire format free of replica-local state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub actor: ActorId,
    pub seq: u64,
    pub deps: Vec<ChangeHash>,
    /// Unix milliseconds at commit time. Informational only; ordering
    /// never depends on wall clocks.
    pub timestamp: u64,
    pub message: Option<String>,
    pub author: Option<String>,
    pub ops: Vec<CanvasOp>,
}

impl Change {
    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).unwrap_or_default()
    }

    /// Deserialize from the binary wire format.
    ///
    /// Malformed input is a per-message error, never fatal to the
    /// document.
    pub fn decode(bytes: &[u8]) -> Result<Self, DocumentError> {
        let (change, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| DocumentError::CorruptDelta(e.to_string()))?;
        Ok(change)
    }

    /// Content address of this change.
    pub fn hash(&self) -> ChangeHash {
        let mut hasher = Sha256::new();
        hasher.update(self.encode());
        ChangeHash(hasher.finalize().into())
    }
}

/// Total order on op applications.
///
/// `(lamport, change, op)` — lamport first so causally-later edits win,
/// the change hash as an arbitrary-but-deterministic tiebreak between
/// concurrent changes, and the op index to order ops within one change.
/// Two distinct ops never share a stamp, so last-writer-wins merges
/// have no tie case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stamp {
    pub lamport: u64,
    pub change: ChangeHash,
    pub op: u32,
}

impl Stamp {
    /// Sorts before every real stamp; used for slots created by ops
    /// whose `AddNode` has not arrived yet.
    pub const ZERO: Stamp = Stamp {
        lamport: 0,
        change: ChangeHash::ZERO,
        op: 0,
    };
}

/// Accumulates ops for a single commit.
///
/// Obtained from [`FlowDocument::begin`](super::FlowDocument::begin),
/// handed back to [`FlowDocument::commit`](super::FlowDocument::commit).
/// A draft with no ops and no commit message produces no change at all.
#[derive(Debug, Default)]
pub struct ChangeDraft {
    ops: Vec<CanvasOp>,
}

impl ChangeDraft {
    pub fn add_node(&mut self, id: impl Into<ObjectId>, position: Position, data: NodeData) {
        self.ops.push(CanvasOp::AddNode {
            id: id.into(),
            position,
            data,
        });
    }

    pub fn move_node(&mut self, id: impl Into<ObjectId>, position: Position) {
        self.ops.push(CanvasOp::MoveNode {
            id: id.into(),
            position,
        });
    }

    pub fn set_node_data(&mut self, id: impl Into<ObjectId>, data: NodeData) {
        self.ops.push(CanvasOp::SetNodeData { id: id.into(), data });
    }

    pub fn remove_node(&mut self, id: impl Into<ObjectId>) {
        self.ops.push(CanvasOp::RemoveNode { id: id.into() });
    }

    pub fn add_edge(
        &mut self,
        id: impl Into<ObjectId>,
        source: impl Into<ObjectId>,
        target: impl Into<ObjectId>,
    ) {
        self.ops.push(CanvasOp::AddEdge {
            id: id.into(),
            source: source.into(),
            target: target.into(),
        });
    }

    pub fn remove_edge(&mut self, id: impl Into<ObjectId>) {
        self.ops.push(CanvasOp::RemoveEdge { id: id.into() });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub(super) fn into_ops(self) -> Vec<CanvasOp> {
        self.ops
    }
}

/// Commit metadata, mirrored into the history log.
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    pub message: Option<String>,
    pub author: Option<String>,
}

impl CommitOptions {
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            author: None,
        }
    }
}
