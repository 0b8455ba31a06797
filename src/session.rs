//! One open document, end to end.
//!
//! `CollabSession` owns the document, the presence tracker, the
//! channel and the schedulers, and is the only writer to any of them:
//!
//! ```text
//!   UI edits ──▶ apply_local_change ──▶ FlowDocument ──▶ deltas out
//!                                           │                │
//!                                      watch channel    Channel (WS)
//!                                           │                │
//!   UI reads ◀── current_view / peers   SaveDebouncer    pump() ◀── inbound
//! ```
//!
//! All document and presence operations are synchronous; the only
//! suspension points are connecting, collaborator calls, and waiting
//! for inbound events in [`pump`](CollabSession::pump). The embedder
//! drives `pump` in a loop and redraws on the returned updates.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::channel::{Channel, ChannelConfig, ChannelError, ChannelEvent, ChannelState};
use crate::collaborators::{
    CredentialError, CredentialProvider, DocumentPersistence, IdentityProvider,
};
use crate::document::{
    CanvasView, ChangeDraft, ChangeHash, CommitOptions, DocumentError, DocumentSnapshot,
    FlowDocument, MergeOutcome, ObjectId,
};
use crate::history::{HistoryEntry, ViewState};
use crate::presence::PresenceTracker;
use crate::protocol::{self, ConnectionId, PresenceState};
use crate::scheduler::{ChangeScheduler, SaveDebouncer, SAVE_DEBOUNCE_WINDOW};

/// Where the session's document lives.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub base_url: String,
    pub project: String,
    pub document_id: String,
    /// Trailing window for durable saves.
    pub save_window: Duration,
}

impl SessionConfig {
    pub fn new(
        base_url: impl Into<String>,
        project: impl Into<String>,
        document_id: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            project: project.into(),
            document_id: document_id.into(),
            save_window: SAVE_DEBOUNCE_WINDOW,
        }
    }
}

#[derive(Debug)]
pub enum SessionError {
    /// Local edits are rejected while a history preview is active.
    PreviewActive,
    Connect(ChannelError),
    Credential(CredentialError),
    Document(DocumentError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreviewActive => write!(f, "A history preview is active"),
            Self::Connect(e) => write!(f, "{e}"),
            Self::Credential(e) => write!(f, "{e}"),
            Self::Document(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ChannelError> for SessionError {
    fn from(e: ChannelError) -> Self {
        Self::Connect(e)
    }
}

impl From<CredentialError> for SessionError {
    fn from(e: CredentialError) -> Self {
        Self::Credential(e)
    }
}

impl From<DocumentError> for SessionError {
    fn from(e: DocumentError) -> Self {
        Self::Document(e)
    }
}

/// What changed, from the embedder's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// Remote edits were folded into the document.
    Document,
    /// A participant appeared, changed, or left.
    Presence,
    /// The channel went down. Reconnect via [`CollabSession::connect`].
    Disconnected { failed: bool },
}

pub struct CollabSession {
    doc: FlowDocument,
    presence: PresenceTracker,
    channel: Channel,
    scheduler: ChangeScheduler,
    debouncer: SaveDebouncer,
    doc_tx: watch::Sender<FlowDocument>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    view: ViewState,
    identity: Arc<dyn IdentityProvider>,
    credentials: Arc<dyn CredentialProvider>,
}

impl CollabSession {
    /// Open a document, optionally from a persisted snapshot. Offline
    /// until [`connect`](Self::connect) is called; edits made before
    /// then are flushed on the first successful connect.
    ///
    /// Must be called inside a tokio runtime (background tasks are
    /// spawned immediately).
    pub fn open(
        snapshot: Option<&DocumentSnapshot>,
        identity: Arc<dyn IdentityProvider>,
        credentials: Arc<dyn CredentialProvider>,
        persistence: Arc<dyn DocumentPersistence>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let connection_id = Uuid::new_v4();
        let doc = match snapshot {
            Some(s) => FlowDocument::from_snapshot(connection_id, s)?,
            None => FlowDocument::with_actor(connection_id),
        };
        // The relay is assumed to hold everything the snapshot holds.
        let scheduler = ChangeScheduler::new(doc.heads().to_vec());
        let (doc_tx, doc_rx) = watch::channel(doc.clone());
        let debouncer = SaveDebouncer::spawn(persistence, doc_rx, config.save_window);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel = Channel::new(ChannelConfig {
            base_url: config.base_url,
            project: config.project,
            document_id: config.document_id,
        });

        Ok(Self {
            doc,
            presence: PresenceTracker::new(connection_id),
            channel,
            scheduler,
            debouncer,
            doc_tx,
            events_tx,
            events_rx,
            view: ViewState::Live,
            identity,
            credentials,
        })
    }

    /// Dial the relay: token, handshake, presence announce, then an
    /// immediate flush of any diff accumulated while offline.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        let token = self.credentials.bearer_token().await?;
        self.channel
            .connect(self.presence.connection_id(), &token, self.events_tx.clone())
            .await?;

        // Resolve identity and announce our full record so peers see
        // us without waiting for a selection change.
        let user = self.identity.current_user().await;
        self.presence.set_name(user.map(|u| u.display_name));
        self.channel
            .send_presence(protocol::presence_update(self.presence.local()));

        for delta in self.scheduler.take_deltas(&self.doc) {
            self.channel.send_delta(delta);
        }
        Ok(())
    }

    /// Re-resolve the current user. The embedder calls this on its
    /// own cadence; a changed name is broadcast immediately.
    pub async fn refresh_identity(&mut self) -> bool {
        let user = self.identity.current_user().await;
        let changed = self.presence.set_name(user.map(|u| u.display_name));
        if changed && self.channel.is_open() {
            self.channel
                .send_presence(protocol::presence_update(self.presence.local()));
        }
        changed
    }

    /// Commit a local edit: build a draft, apply it, send the delta
    /// (if connected) and schedule a durable save.
    ///
    /// Returns `Ok(None)` when the edit turned out to be empty and
    /// carried no message — nothing was recorded or sent. Rejected
    /// while a history preview is active.
    pub fn apply_local_change(
        &mut self,
        edit: impl FnOnce(&mut ChangeDraft),
        message: Option<String>,
    ) -> Result<Option<ChangeHash>, SessionError> {
        if !self.view.is_live() {
            return Err(SessionError::PreviewActive);
        }
        let mut draft = self.doc.begin();
        edit(&mut draft);
        let opts = CommitOptions {
            message,
            author: self.presence.local().name.clone(),
        };
        match self.doc.commit(draft, opts) {
            Some(hash) => {
                self.after_local_commit();
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    fn after_local_commit(&mut self) {
        self.doc_tx.send_replace(self.doc.clone());
        self.debouncer.schedule();
        if self.channel.is_open() {
            for delta in self.scheduler.take_deltas(&self.doc) {
                self.channel.send_delta(delta);
            }
        }
    }

    /// Replace the local selection and broadcast it if it changed.
    pub fn set_selection(&mut self, selected: Vec<ObjectId>) {
        if self.presence.set_selection(selected) && self.channel.is_open() {
            self.channel
                .send_presence(protocol::presence_update(self.presence.local()));
        }
    }

    /// Wait for the next meaningful inbound update. Returns `None`
    /// only if the session's event channel is gone (never in normal
    /// operation, since the session holds a sender itself).
    pub async fn pump(&mut self) -> Option<SessionUpdate> {
        while let Some(event) = self.events_rx.recv().await {
            if let Some(update) = self.handle_event(event) {
                return Some(update);
            }
        }
        None
    }

    fn handle_event(&mut self, event: ChannelEvent) -> Option<SessionUpdate> {
        match event {
            ChannelEvent::Delta(bytes) => match self.doc.merge_change(&bytes) {
                Ok(MergeOutcome::Integrated { applied }) => {
                    log::debug!("Integrated {} remote change(s)", applied.len());
                    self.doc_tx.send_replace(self.doc.clone());
                    if self.channel.is_open() {
                        // The relay already has these; don't echo them
                        // on the next flush.
                        self.scheduler.mark_synced(&self.doc);
                    }
                    Some(SessionUpdate::Document)
                }
                Ok(MergeOutcome::Duplicate) | Ok(MergeOutcome::Deferred) => None,
                Err(e) => {
                    log::warn!("Discarding inbound delta: {e}");
                    None
                }
            },
            ChannelEvent::Control(frame) => {
                if self.presence.apply(&frame) {
                    Some(SessionUpdate::Presence)
                } else {
                    None
                }
            }
            ChannelEvent::Closed { failed, epoch } => {
                if self.channel.handle_closed(failed, epoch) {
                    Some(SessionUpdate::Disconnected { failed })
                } else {
                    None
                }
            }
        }
    }

    // ─── History / time travel ──────────────────────────────────

    /// The change log, oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.doc.log()
    }

    /// Pin the canvas at an earlier version. Read-only: local edits
    /// fail until [`close_preview`](Self::close_preview) or
    /// [`restore_to`](Self::restore_to). Remote deltas keep merging
    /// underneath; the pinned view is unaffected by them.
    pub fn preview_at(&mut self, heads: Vec<ChangeHash>) -> Result<CanvasView, SessionError> {
        let view = self.doc.view_at(&heads)?;
        self.view = ViewState::Viewing(heads);
        Ok(view)
    }

    /// Back to the live canvas.
    pub fn close_preview(&mut self) {
        self.view = ViewState::Live;
    }

    /// Commit a forward change that copies an earlier version over
    /// the live canvas, then leave preview mode. Propagates and saves
    /// like any other local commit.
    pub fn restore_to(&mut self, heads: &[ChangeHash]) -> Result<ChangeHash, SessionError> {
        let author = self.presence.local().name.clone();
        let hash = self.doc.restore(heads, author)?;
        self.view = ViewState::Live;
        self.after_local_commit();
        Ok(hash)
    }

    /// The canvas the UI should draw right now: live state, or the
    /// pinned version while previewing.
    pub fn current_view(&self) -> Result<CanvasView, SessionError> {
        match &self.view {
            ViewState::Live => Ok(self.doc.view()),
            ViewState::Viewing(heads) => Ok(self.doc.view_at(heads)?),
        }
    }

    pub fn view_state(&self) -> &ViewState {
        &self.view
    }

    // ─── Accessors ──────────────────────────────────────────────

    pub fn document(&self) -> &FlowDocument {
        &self.doc
    }

    /// Immutable document values for observers outside the session.
    pub fn watch_document(&self) -> watch::Receiver<FlowDocument> {
        self.doc_tx.subscribe()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.presence.connection_id()
    }

    pub fn connection_state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn local_presence(&self) -> &PresenceState {
        self.presence.local()
    }

    /// Remote participants, sorted by connection id.
    pub fn peers(&self) -> Vec<PresenceState> {
        self.presence.remotes().into_iter().cloned().collect()
    }

    /// Announce departure and drop the connection. Pending debounced
    /// saves are cancelled without flushing when the session is
    /// dropped.
    pub fn close(&mut self) {
        if self.channel.is_open() {
            self.channel
                .send_presence(protocol::presence_remove(self.presence.connection_id()));
        }
        self.channel.close();
    }
}
