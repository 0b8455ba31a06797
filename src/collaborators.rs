//! Seams to the embedding application.
//!
//! The engine never fetches tokens, looks up users, or talks to a
//! storage backend itself — the embedder supplies those through these
//! traits. All three are object-safe so sessions can hold them as
//! `Arc<dyn ...>`.

use async_trait::async_trait;

use crate::document::DocumentSnapshot;

/// The signed-in user, as shown to other participants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub display_name: String,
    pub email: Option<String>,
}

/// Resolves the current user for presence and change attribution.
///
/// `None` means identity could not be determined; the session stays
/// anonymous rather than failing.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_user(&self) -> Option<UserProfile>;
}

/// Supplies the bearer token for the connect-time auth handshake.
///
/// Consumed once per `connect`; an already-open channel is never
/// re-authenticated.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String, CredentialError>;
}

/// Durable storage for debounced document saves.
///
/// Saves are fire-and-forget from the session's point of view;
/// failures are logged, never retried by the engine.
#[async_trait]
pub trait DocumentPersistence: Send + Sync {
    async fn save_document(&self, snapshot: DocumentSnapshot) -> Result<(), PersistenceError>;
}

#[derive(Debug, Clone)]
pub enum CredentialError {
    TokenUnavailable(String),
}

impl std::fmt::Display for CredentialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TokenUnavailable(e) => write!(f, "Token unavailable: {e}"),
        }
    }
}

impl std::error::Error for CredentialError {}

#[derive(Debug, Clone)]
pub enum PersistenceError {
    SaveFailed(String),
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SaveFailed(e) => write!(f, "Save failed: {e}"),
        }
    }
}

impl std::error::Error for PersistenceError {}
