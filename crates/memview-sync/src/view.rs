use chrono::{DateTime, Utc};
use memview_core::{DerivedMetrics, MemoryBlock};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViewSource {
    Empty,
    Channel,
    Fetch,
}

/// The whole client-side view: blocks in server order plus their metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewSnapshot {
    pub revision: u64,
    pub source: ViewSource,
    pub received_at: Option<DateTime<Utc>>,
    pub blocks: Vec<MemoryBlock>,
    pub metrics: DerivedMetrics,
}

impl ViewSnapshot {
    fn empty() -> Self {
        Self {
            revision: 0,
            source: ViewSource::Empty,
            received_at: None,
            blocks: Vec::new(),
            metrics: DerivedMetrics::default(),
        }
    }

    pub fn holds_pid(&self, pid: &str) -> bool {
        self.blocks
            .iter()
            .any(|block| block.occupant_pid() == Some(pid))
    }
}

/// Write side of the view. Owned by the connection driver; each publish
/// replaces the previous snapshot wholesale.
pub(crate) struct SharedView {
    tx: watch::Sender<Arc<ViewSnapshot>>,
}

impl SharedView {
    pub(crate) fn new() -> (Self, ViewReader) {
        let (tx, rx) = watch::channel(Arc::new(ViewSnapshot::empty()));
        (Self { tx }, ViewReader { rx })
    }

    pub(crate) fn publish(
        &self,
        blocks: Vec<MemoryBlock>,
        source: ViewSource,
    ) -> Arc<ViewSnapshot> {
        let revision = self.tx.borrow().revision + 1;
        let metrics = DerivedMetrics::compute(&blocks);
        let snapshot = Arc::new(ViewSnapshot {
            revision,
            source,
            received_at: Some(Utc::now()),
            blocks,
            metrics,
        });
        self.tx.send_replace(snapshot.clone());
        snapshot
    }
}

#[derive(Debug, Clone)]
pub struct ViewReader {
    rx: watch::Receiver<Arc<ViewSnapshot>>,
}

impl ViewReader {
    pub fn current(&self) -> Arc<ViewSnapshot> {
        self.rx.borrow().clone()
    }

    /// Waits for the next publish. `None` once the owning connection is gone.
    pub async fn changed(&mut self) -> Option<Arc<ViewSnapshot>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    pub async fn wait_for<F>(&mut self, mut predicate: F) -> Option<Arc<ViewSnapshot>>
    where
        F: FnMut(&ViewSnapshot) -> bool,
    {
        let snapshot = self.rx.wait_for(|snapshot| predicate(snapshot.as_ref())).await.ok()?;
        Some(snapshot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_replaces_snapshot_and_recomputes_metrics() {
        let (view, reader) = SharedView::new();
        assert_eq!(reader.current().source, ViewSource::Empty);

        view.publish(
            vec![
                MemoryBlock::free(0, 99).expect("block"),
                MemoryBlock::used(100, 149, "P2").expect("block"),
            ],
            ViewSource::Channel,
        );
        let first = reader.current();
        assert_eq!(first.revision, 1);
        assert_eq!(first.metrics.used, 50);
        assert!(first.holds_pid("P2"));

        view.publish(vec![MemoryBlock::free(0, 149).expect("block")], ViewSource::Fetch);
        let second = reader.current();
        assert_eq!(second.revision, 2);
        assert_eq!(second.blocks.len(), 1);
        assert_eq!(second.metrics.used, 0);
        assert!(!second.holds_pid("P2"));
    }

    #[tokio::test]
    async fn reader_ends_when_view_is_dropped() {
        let (view, mut reader) = SharedView::new();
        view.publish(Vec::new(), ViewSource::Fetch);
        let seen = reader.changed().await.expect("first publish");
        assert_eq!(seen.revision, 1);
        drop(view);
        assert!(reader.changed().await.is_none());
        assert_eq!(reader.current().revision, 1);
    }
}
