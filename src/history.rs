//! History log entries and the session's view pointer.

use serde::{Deserialize, Serialize};

use crate::document::ChangeHash;

/// One row of the time-travel list: a change's identity plus the
/// metadata stamped at commit time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub hash: ChangeHash,
    pub message: Option<String>,
    pub author: Option<String>,
    /// Unix milliseconds at commit time.
    pub timestamp: u64,
}

/// What the session currently shows.
///
/// `Live` tracks the folded head state; `Viewing` pins a read-only
/// projection at an earlier set of heads. Local edits are rejected
/// while viewing — the way back to editing is closing the preview or
/// restoring.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewState {
    Live,
    Viewing(Vec<ChangeHash>),
}

impl ViewState {
    pub fn is_live(&self) -> bool {
        matches!(self, ViewState::Live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_state() {
        assert!(ViewState::Live.is_live());
        assert!(!ViewState::Viewing(vec![ChangeHash([1u8; 32])]).is_live());
    }
}
