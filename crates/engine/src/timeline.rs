//! Lazy, restartable reads of a run's event timeline.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use spire_core::{RunId, Sequence};
use spire_execution::{Event, TimelineEntry};
use spire_ports::{PortsError, Store};

/// Default events fetched per store round trip.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Pages through [`EventTimeline::read_events`](spire_ports::EventTimeline::read_events)
/// on demand.
///
/// A stream ends at the last event present when its final page was fetched.
/// Restart it from the last seen sequence to pick up newer events.
#[derive(Clone)]
pub struct TimelineReader {
    store: Arc<dyn Store>,
    page_size: usize,
}

struct Cursor {
    store: Arc<dyn Store>,
    run_id: RunId,
    after: Sequence,
    page_size: usize,
    buffered: VecDeque<Event>,
    exhausted: bool,
}

impl TimelineReader {
    /// Reader over `store` with [`DEFAULT_PAGE_SIZE`] pages.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Fetch `page_size` events per round trip.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Events of `run_id` with a sequence greater than `after`, ascending.
    pub fn stream(&self, run_id: RunId, after: Sequence) -> BoxStream<'static, Result<Event, PortsError>> {
        let cursor = Cursor {
            store: Arc::clone(&self.store),
            run_id,
            after,
            page_size: self.page_size,
            buffered: VecDeque::new(),
            exhausted: false,
        };
        stream::try_unfold(cursor, |mut cursor| async move {
            if cursor.buffered.is_empty() && !cursor.exhausted {
                let page = cursor
                    .store
                    .read_events(cursor.run_id, cursor.after, cursor.page_size)
                    .await?;
                cursor.exhausted = page.len() < cursor.page_size;
                cursor.buffered.extend(page);
            }
            Ok(cursor.buffered.pop_front().map(|event| {
                cursor.after = event.sequence;
                (event, cursor)
            }))
        })
        .boxed()
    }

    /// Typed entries of `run_id`, decoding each payload.
    pub fn entries(&self, run_id: RunId, after: Sequence) -> BoxStream<'static, Result<(Sequence, TimelineEntry), PortsError>> {
        self.stream(run_id, after)
            .and_then(|event| async move {
                let entry = TimelineEntry::from_event(&event)?;
                Ok((event.sequence, entry))
            })
            .boxed()
    }

    /// Every event of `run_id`.
    pub async fn collect(&self, run_id: RunId) -> Result<Vec<Event>, PortsError> {
        self.stream(run_id, Sequence::ZERO).try_collect().await
    }
}

impl std::fmt::Debug for TimelineReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineReader")
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use spire_core::{TenantId, WorkflowId};
    use spire_execution::EventKind;
    use spire_ports::NewRun;
    use spire_store_memory::MemoryStore;

    async fn seeded(events: u64) -> (Arc<dyn Store>, RunId) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let run = store
            .create_run(NewRun {
                run_id: RunId::v4(),
                tenant_id: TenantId::v4(),
                workflow_id: WorkflowId::new("timeline").unwrap(),
                parent_run_id: None,
                priority: 0,
                input: json!({}),
            })
            .await
            .unwrap();
        for n in 0..events {
            store
                .append_event(run.run_id, EventKind::StepCompleted, json!({ "n": n }))
                .await
                .unwrap();
        }
        (store, run.run_id)
    }

    #[tokio::test]
    async fn pages_through_every_event_in_order() {
        let (store, run_id) = seeded(7).await;
        let reader = TimelineReader::new(store).with_page_size(3);
        let seqs: Vec<u64> = reader
            .stream(run_id, Sequence::ZERO)
            .map_ok(|e| e.sequence.get())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(seqs, (1..=7).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn restarts_after_a_sequence() {
        let (store, run_id) = seeded(5).await;
        let reader = TimelineReader::new(store).with_page_size(2);
        let events: Vec<Event> = reader
            .stream(run_id, Sequence::new(3))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].payload, json!({ "n": 3 }));
    }

    #[tokio::test]
    async fn empty_timeline_ends_immediately() {
        let (store, run_id) = seeded(0).await;
        assert!(TimelineReader::new(store).collect(run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exact_page_multiple_needs_one_empty_fetch() {
        let (store, run_id) = seeded(4).await;
        let reader = TimelineReader::new(store).with_page_size(2);
        assert_eq!(reader.collect(run_id).await.unwrap().len(), 4);
    }
}
