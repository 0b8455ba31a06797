//! Canvas state fold: ops in, materialized view out.
//!
//! Every mutable field is a last-writer-wins register keyed by a
//! [`Stamp`]. Because stamps are globally unique and totally ordered,
//! folding the same set of ops in any order produces the same state —
//! which is what makes merges commutative at the document layer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::change::{CanvasOp, NodeData, ObjectId, Position, Stamp};

/// LWW register: keeps the value with the highest stamp seen.
#[derive(Debug, Clone)]
struct Register<T> {
    stamp: Stamp,
    value: T,
}

impl<T> Register<T> {
    fn new(stamp: Stamp, value: T) -> Self {
        Self { stamp, value }
    }

    fn merge(&mut self, stamp: Stamp, value: T) {
        if stamp > self.stamp {
            self.stamp = stamp;
            self.value = value;
        }
    }
}

#[derive(Debug, Clone)]
struct NodeSlot {
    /// Smallest add stamp seen; fixes the node's place in the listing
    /// order across all replicas.
    created: Stamp,
    alive: Register<bool>,
    position: Register<Position>,
    data: Register<NodeData>,
}

impl NodeSlot {
    /// Slot for a node referenced before its `AddNode` arrived. Not
    /// alive until the add shows up; the zero alive-stamp loses to any
    /// real op.
    fn latent(created: Stamp) -> Self {
        Self {
            created,
            alive: Register::new(Stamp::ZERO, false),
            position: Register::new(Stamp::ZERO, Position::new(0.0, 0.0)),
            data: Register::new(Stamp::ZERO, NodeData::empty()),
        }
    }
}

#[derive(Debug, Clone)]
struct EdgeSlot {
    created: Stamp,
    alive: Register<bool>,
    endpoints: Register<(ObjectId, ObjectId)>,
}

impl EdgeSlot {
    fn latent(created: Stamp) -> Self {
        Self {
            created,
            alive: Register::new(Stamp::ZERO, false),
            endpoints: Register::new(Stamp::ZERO, (String::new(), String::new())),
        }
    }
}

/// The folded canvas. Owned by `FlowDocument`; never exposed mutably.
#[derive(Debug, Clone, Default)]
pub(super) struct CanvasState {
    nodes: HashMap<ObjectId, NodeSlot>,
    edges: HashMap<ObjectId, EdgeSlot>,
}

impl CanvasState {
    /// Apply one op at the given stamp. Idempotent for a fixed stamp
    /// and order-independent across stamps.
    pub(super) fn apply(&mut self, stamp: Stamp, op: &CanvasOp) {
        match op {
            CanvasOp::AddNode { id, position, data } => {
                let slot = self
                    .nodes
                    .entry(id.clone())
                    .or_insert_with(|| NodeSlot::latent(stamp));
                slot.created = slot.created.min(stamp);
                slot.alive.merge(stamp, true);
                slot.position.merge(stamp, *position);
                slot.data.merge(stamp, data.clone());
            }
            CanvasOp::MoveNode { id, position } => {
                let slot = self
                    .nodes
                    .entry(id.clone())
                    .or_insert_with(|| NodeSlot::latent(stamp));
                slot.position.merge(stamp, *position);
            }
            CanvasOp::SetNodeData { id, data } => {
                let slot = self
                    .nodes
                    .entry(id.clone())
                    .or_insert_with(|| NodeSlot::latent(stamp));
                slot.data.merge(stamp, data.clone());
            }
            CanvasOp::RemoveNode { id } => {
                let slot = self
                    .nodes
                    .entry(id.clone())
                    .or_insert_with(|| NodeSlot::latent(stamp));
                slot.alive.merge(stamp, false);
            }
            CanvasOp::AddEdge { id, source, target } => {
                let slot = self
                    .edges
                    .entry(id.clone())
                    .or_insert_with(|| EdgeSlot::latent(stamp));
                slot.created = slot.created.min(stamp);
                slot.alive.merge(stamp, true);
                slot.endpoints.merge(stamp, (source.clone(), target.clone()));
            }
            CanvasOp::RemoveEdge { id } => {
                let slot = self
                    .edges
                    .entry(id.clone())
                    .or_insert_with(|| EdgeSlot::latent(stamp));
                slot.alive.merge(stamp, false);
            }
        }
    }

    /// Materialize the live objects, sorted by creation stamp so every
    /// replica lists concurrent inserts identically.
    pub(super) fn view(&self) -> CanvasView {
        let mut nodes: Vec<(&Stamp, NodeView)> = self
            .nodes
            .iter()
            .filter(|(_, slot)| slot.alive.value)
            .map(|(id, slot)| {
                (
                    &slot.created,
                    NodeView {
                        id: id.clone(),
                        position: slot.position.value,
                        data: slot.data.value.clone(),
                    },
                )
            })
            .collect();
        nodes.sort_by(|a, b| a.0.cmp(b.0));

        let mut edges: Vec<(&Stamp, EdgeView)> = self
            .edges
            .iter()
            .filter(|(_, slot)| slot.alive.value && !slot.endpoints.value.0.is_empty())
            .map(|(id, slot)| {
                (
                    &slot.created,
                    EdgeView {
                        id: id.clone(),
                        source: slot.endpoints.value.0.clone(),
                        target: slot.endpoints.value.1.clone(),
                    },
                )
            })
            .collect();
        edges.sort_by(|a, b| a.0.cmp(b.0));

        CanvasView {
            nodes: nodes.into_iter().map(|(_, n)| n).collect(),
            edges: edges.into_iter().map(|(_, e)| e).collect(),
        }
    }
}

/// A node as the UI sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeView {
    pub id: ObjectId,
    pub position: Position,
    pub data: NodeData,
}

/// An edge as the UI sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeView {
    pub id: ObjectId,
    pub source: ObjectId,
    pub target: ObjectId,
}

/// Immutable projection of the canvas at some set of heads.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CanvasView {
    pub nodes: Vec<NodeView>,
    pub edges: Vec<EdgeView>,
}

impl CanvasView {
    pub fn node(&self, id: &str) -> Option<&NodeView> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn edge(&self, id: &str) -> Option<&EdgeView> {
        self.edges.iter().find(|e| e.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}
