//! # flow-collab — Real-time sync engine for workflow canvas documents
//!
//! Keeps a node-and-edge canvas continuously synchronized across
//! every client editing it, with change history, time travel, and
//! live presence.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   binary: deltas    ┌─────────────┐
//! │ CollabSession│ ◄──────────────────► │ sync relay  │
//! │  (per doc)   │   text: presence     │ (external)  │
//! └──────┬───────┘                      └─────────────┘
//!        │ owns
//!        ▼
//! ┌──────────────┐  ┌───────────────┐  ┌───────────────┐
//! │ FlowDocument │  │PresenceTracker│  │ Channel (WS)  │
//! │ change graph │  │ local+remotes │  │ state machine │
//! └──────┬───────┘  └───────────────┘  └───────────────┘
//!        │ debounced snapshots
//!        ▼
//! ┌──────────────────┐
//! │DocumentPersistence│ (embedder-supplied)
//! └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`document`] — replicated document store: content-addressed
//!   change graph, LWW canvas fold, history, snapshots
//! - [`protocol`] — wire frames: JSON auth/presence, binary deltas
//! - [`channel`] — WebSocket channel with auth handshake
//! - [`presence`] — who is here and what they have selected
//! - [`scheduler`] — immediate delta flushing, debounced saves
//! - [`history`] — history entries and the session view pointer
//! - [`collaborators`] — identity / credential / persistence seams
//! - [`session`] — `CollabSession`, the owning object
//!
//! Edits propagate per keystroke; durable saves wait for a 500 ms
//! quiet window. Merges are commutative and idempotent, so delivery
//! order and duplicates from the relay never matter.

pub mod channel;
pub mod collaborators;
pub mod document;
pub mod history;
pub mod presence;
pub mod protocol;
pub mod scheduler;
pub mod session;

// Re-exports for convenience
pub use channel::{Channel, ChannelConfig, ChannelError, ChannelEvent, ChannelState};
pub use collaborators::{
    CredentialError, CredentialProvider, DocumentPersistence, IdentityProvider, PersistenceError,
    UserProfile,
};
pub use document::{
    ActorId, CanvasOp, CanvasView, Change, ChangeDraft, ChangeHash, CommitOptions, DocumentError,
    DocumentSnapshot, EdgeView, FlowDocument, MergeOutcome, NodeData, NodeView, ObjectId,
    Position,
};
pub use history::{HistoryEntry, ViewState};
pub use presence::PresenceTracker;
pub use protocol::{AuthFrame, ConnectionId, ControlFrame, PresenceState};
pub use scheduler::{ChangeScheduler, SaveDebouncer, SAVE_DEBOUNCE_WINDOW};
pub use session::{CollabSession, SessionConfig, SessionError, SessionUpdate};
