//! When edits leave the process.
//!
//! Two very different cadences share this module:
//!
//! - deltas go out IMMEDIATELY — `ChangeScheduler` tracks the last
//!   heads the relay has seen and hands over everything newer;
//! - durable saves are DEBOUNCED — `SaveDebouncer` waits for a quiet
//!   trailing window, then persists whatever the document looks like
//!   at that moment.
//!
//! The scheduler's baseline only ever advances when deltas are
//! actually taken for an open channel. While disconnected nothing
//! moves, so the first flush after a reconnect carries the whole
//! accumulated diff.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::collaborators::DocumentPersistence;
use crate::document::{ChangeHash, FlowDocument};

/// Default trailing window for durable saves.
pub const SAVE_DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// Tracks which part of the document the relay already has.
#[derive(Debug, Clone)]
pub struct ChangeScheduler {
    baseline: Vec<ChangeHash>,
}

impl ChangeScheduler {
    /// `baseline` is what the relay is assumed to hold already — the
    /// snapshot heads for a freshly opened document.
    pub fn new(baseline: Vec<ChangeHash>) -> Self {
        Self { baseline }
    }

    /// Everything the relay has not seen, encoded and in causal
    /// order, advancing the baseline to the document's current heads.
    /// Only call this with deltas actually going out on an open
    /// channel — taking and then dropping them would lose the diff.
    pub fn take_deltas(&mut self, doc: &FlowDocument) -> Vec<Vec<u8>> {
        let deltas = doc.changes_since(&self.baseline);
        self.baseline = doc.heads().to_vec();
        deltas
    }

    /// Advance the baseline without emitting anything. Used after
    /// integrating a REMOTE change: the relay already has it, so it
    /// must not be echoed back on the next flush.
    pub fn mark_synced(&mut self, doc: &FlowDocument) {
        self.baseline = doc.heads().to_vec();
    }

    pub fn baseline(&self) -> &[ChangeHash] {
        &self.baseline
    }
}

/// Trailing-edge debouncer for durable saves.
///
/// Each `schedule` call (re)starts the window; when it elapses with no
/// further calls, the CURRENT document is snapshotted and handed to
/// the persistence collaborator. A burst of edits therefore collapses
/// into a single save of the final state. Dropping the debouncer
/// cancels a pending window without flushing.
pub struct SaveDebouncer {
    trigger: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl SaveDebouncer {
    pub fn spawn(
        store: Arc<dyn DocumentPersistence>,
        doc_rx: watch::Receiver<FlowDocument>,
        window: Duration,
    ) -> Self {
        let (trigger, mut trigger_rx) = mpsc::unbounded_channel::<()>();
        let task = tokio::spawn(async move {
            loop {
                if trigger_rx.recv().await.is_none() {
                    return;
                }
                // Any further trigger restarts the window.
                loop {
                    tokio::select! {
                        more = trigger_rx.recv() => {
                            if more.is_none() {
                                return;
                            }
                        }
                        _ = tokio::time::sleep(window) => break,
                    }
                }
                // Snapshot taken at fire time, so the save always
                // covers every edit in the burst.
                let snapshot = { doc_rx.borrow().snapshot() };
                log::debug!("Debounce window elapsed, saving {} bytes", snapshot.len());
                if let Err(e) = store.save_document(snapshot).await {
                    log::warn!("Durable save failed: {e}");
                }
            }
        });
        Self { trigger, task }
    }

    /// Note that the document changed. Starts or extends the window.
    pub fn schedule(&self) {
        let _ = self.trigger.send(());
    }
}

impl Drop for SaveDebouncer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::PersistenceError;
    use crate::document::{CommitOptions, DocumentSnapshot, NodeData, Position};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use uuid::Uuid;

    fn add_node(doc: &mut FlowDocument, id: &str) {
        let mut draft = doc.begin();
        draft.add_node(id, Position::new(0.0, 0.0), NodeData::empty());
        doc.commit(draft, CommitOptions::default());
    }

    #[test]
    fn test_scheduler_advances_on_take() {
        let mut doc = FlowDocument::new();
        let mut scheduler = ChangeScheduler::new(Vec::new());

        add_node(&mut doc, "n1");
        assert_eq!(scheduler.take_deltas(&doc).len(), 1);
        assert!(scheduler.take_deltas(&doc).is_empty());

        add_node(&mut doc, "n2");
        assert_eq!(scheduler.take_deltas(&doc).len(), 1);
    }

    #[test]
    fn test_scheduler_accumulates_while_disconnected() {
        let mut doc = FlowDocument::new();
        let mut scheduler = ChangeScheduler::new(Vec::new());

        add_node(&mut doc, "n1");
        scheduler.take_deltas(&doc);

        // Channel down: commits happen but nothing is taken.
        add_node(&mut doc, "n2");
        add_node(&mut doc, "n3");

        // First flush after reconnect carries the whole diff.
        assert_eq!(scheduler.take_deltas(&doc).len(), 2);
    }

    #[test]
    fn test_scheduler_starts_from_snapshot_heads() {
        let mut doc = FlowDocument::new();
        add_node(&mut doc, "n1");

        let mut scheduler = ChangeScheduler::new(doc.heads().to_vec());
        assert!(scheduler.take_deltas(&doc).is_empty());
    }

    #[test]
    fn test_mark_synced_prevents_echo() {
        let mut origin = FlowDocument::new();
        add_node(&mut origin, "n1");
        let delta = origin.changes_since(&[]).remove(0);

        let mut doc = FlowDocument::new();
        let mut scheduler = ChangeScheduler::new(Vec::new());
        doc.merge_change(&delta).unwrap();
        scheduler.mark_synced(&doc);

        // The remote change must not go back out.
        assert!(scheduler.take_deltas(&doc).is_empty());
    }

    struct RecordingStore {
        saves: Mutex<Vec<DocumentSnapshot>>,
    }

    impl RecordingStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                saves: Mutex::new(Vec::new()),
            })
        }

        fn save_count(&self) -> usize {
            self.saves.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DocumentPersistence for RecordingStore {
        async fn save_document(&self, snapshot: DocumentSnapshot) -> Result<(), PersistenceError> {
            self.saves.lock().unwrap().push(snapshot);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_one_save_of_final_state() {
        let store = RecordingStore::new();
        let mut doc = FlowDocument::new();
        let (doc_tx, doc_rx) = watch::channel(doc.clone());
        let debouncer = SaveDebouncer::spawn(store.clone(), doc_rx, SAVE_DEBOUNCE_WINDOW);

        // Three edits inside one window.
        for id in ["n1", "n2", "n3"] {
            add_node(&mut doc, id);
            doc_tx.send_replace(doc.clone());
            debouncer.schedule();
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        assert_eq!(store.save_count(), 0);

        // Quiet period: exactly one save, of the final state.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(store.save_count(), 1);

        let saved = store.saves.lock().unwrap().remove(0);
        let restored = FlowDocument::from_snapshot(Uuid::new_v4(), &saved).unwrap();
        assert_eq!(restored.view().nodes.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_bursts_save_separately() {
        let store = RecordingStore::new();
        let doc = FlowDocument::new();
        let (_doc_tx, doc_rx) = watch::channel(doc);
        let debouncer = SaveDebouncer::spawn(store.clone(), doc_rx, SAVE_DEBOUNCE_WINDOW);

        debouncer.schedule();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(store.save_count(), 1);

        debouncer.schedule();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(store.save_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_pending_save() {
        let store = RecordingStore::new();
        let doc = FlowDocument::new();
        let (_doc_tx, doc_rx) = watch::channel(doc);
        let debouncer = SaveDebouncer::spawn(store.clone(), doc_rx, SAVE_DEBOUNCE_WINDOW);

        debouncer.schedule();
        drop(debouncer);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_save_without_schedule() {
        let store = RecordingStore::new();
        let doc = FlowDocument::new();
        let (_doc_tx, doc_rx) = watch::channel(doc);
        let _debouncer = SaveDebouncer::spawn(store.clone(), doc_rx, SAVE_DEBOUNCE_WINDOW);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.save_count(), 0);
    }
}
