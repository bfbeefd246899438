use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use futures_util::future::ready;
use futures_util::stream::{self, BoxStream};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use super::document::{DocumentUpdate, ExchangeDocument, IllegalTransition};

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("exchange {0} not found")]
    NotFound(String),
    #[error("exchange {id}: {reason}")]
    Illegal {
        id: String,
        reason: IllegalTransition,
    },
    #[error("change feed fell behind by {0} events")]
    Lagged(u64),
    #[error("store codec error: {0}")]
    Codec(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Opaque position in a store's change feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResumeToken(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
}

/// One entry of the change feed, carrying the full document after the change.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub token: ResumeToken,
    pub kind: ChangeKind,
    pub document: ExchangeDocument,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchFilter {
    Inserts,
    Updates { id: String },
}

impl WatchFilter {
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match self {
            WatchFilter::Inserts => event.kind == ChangeKind::Insert,
            WatchFilter::Updates { id } => {
                event.kind == ChangeKind::Update && event.document.id == *id
            }
        }
    }
}

/// A subscription to a store's change feed.
pub struct ChangeStream {
    start: ResumeToken,
    events: BoxStream<'static, Result<ChangeEvent, StoreError>>,
}

impl ChangeStream {
    pub fn new(
        start: ResumeToken,
        events: BoxStream<'static, Result<ChangeEvent, StoreError>>,
    ) -> Self {
        Self { start, events }
    }

    /// Feed position at the moment the watch was opened.
    pub fn start_token(&self) -> &ResumeToken {
        &self.start
    }

    pub async fn next(&mut self) -> Option<Result<ChangeEvent, StoreError>> {
        self.events.next().await
    }
}

/// Storage primitives the distributed call queue is built on.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Documents older than this are invisible and eventually removed.
    fn ttl(&self) -> Duration;

    async fn insert(&self, doc: ExchangeDocument) -> Result<(), StoreError>;

    async fn update(
        &self,
        id: &str,
        update: DocumentUpdate,
    ) -> Result<ExchangeDocument, StoreError>;

    /// Oldest unexpired document for `host` that nobody answered yet.
    async fn find_unanswered(&self, host: &str) -> Result<Option<ExchangeDocument>, StoreError>;

    /// Opens a change feed for `host`. Events already recorded after
    /// `resume_after` are replayed first.
    async fn watch(
        &self,
        host: &str,
        filter: WatchFilter,
        resume_after: Option<ResumeToken>,
    ) -> Result<ChangeStream, StoreError>;
}

const CHANGE_LOG_CAPACITY: usize = 1024;

/// In-process [`DocumentStore`] with a bounded, replayable change log per
/// host.
pub struct MemoryDocumentStore {
    ttl: Duration,
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    docs: HashMap<String, (u64, ExchangeDocument)>,
    feeds: HashMap<String, HostFeed>,
    seq: u64,
}

struct HostFeed {
    log: VecDeque<(u64, ChangeEvent)>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl HostFeed {
    fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_LOG_CAPACITY);
        Self {
            log: VecDeque::new(),
            changes,
        }
    }
}

impl MemoryDocumentStore {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            ttl,
            state: Mutex::new(StoreState::default()),
        })
    }

    fn record(&self, state: &mut StoreState, kind: ChangeKind, document: ExchangeDocument) {
        state.seq += 1;
        let seq = state.seq;
        let event = ChangeEvent {
            token: ResumeToken(seq.to_string()),
            kind,
            document,
        };
        let feed = state
            .feeds
            .entry(event.document.host.clone())
            .or_insert_with(HostFeed::new);
        feed.log.push_back((seq, event.clone()));
        while feed.log.len() > CHANGE_LOG_CAPACITY {
            feed.log.pop_front();
        }
        let _ = feed.changes.send(event);
    }

    fn purge(&self, state: &mut StoreState) {
        let now = Utc::now();
        let ttl = self.ttl;
        state.docs.retain(|_, (_, doc)| !doc.is_expired(now, ttl));
        let docs = &state.docs;
        state.feeds.retain(|host, feed| {
            feed.changes.receiver_count() > 0 || docs.values().any(|(_, doc)| doc.host == *host)
        });
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn insert(&self, doc: ExchangeDocument) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        self.purge(&mut state);
        if state.docs.contains_key(&doc.id) {
            return Err(StoreError::Backend(format!("duplicate exchange {}", doc.id)));
        }
        let order = state.seq;
        state.docs.insert(doc.id.clone(), (order, doc.clone()));
        self.record(&mut state, ChangeKind::Insert, doc);
        Ok(())
    }

    async fn update(
        &self,
        id: &str,
        update: DocumentUpdate,
    ) -> Result<ExchangeDocument, StoreError> {
        let mut state = self.state.lock();
        self.purge(&mut state);
        let (_, doc) = state
            .docs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        doc.apply(update).map_err(|reason| StoreError::Illegal {
            id: id.to_string(),
            reason,
        })?;
        let snapshot = doc.clone();
        self.record(&mut state, ChangeKind::Update, snapshot.clone());
        Ok(snapshot)
    }

    async fn find_unanswered(&self, host: &str) -> Result<Option<ExchangeDocument>, StoreError> {
        let mut state = self.state.lock();
        self.purge(&mut state);
        Ok(state
            .docs
            .values()
            .filter(|(_, doc)| doc.host == host && doc.is_unanswered())
            .min_by_key(|(order, _)| *order)
            .map(|(_, doc)| doc.clone()))
    }

    async fn watch(
        &self,
        host: &str,
        filter: WatchFilter,
        resume_after: Option<ResumeToken>,
    ) -> Result<ChangeStream, StoreError> {
        let resume_after = resume_after
            .map(|token| {
                token
                    .0
                    .parse::<u64>()
                    .map_err(|err| StoreError::Codec(format!("resume token {:?}: {err}", token.0)))
            })
            .transpose()?;

        let (receiver, start, backlog) = {
            let mut state = self.state.lock();
            let start = state.seq;
            let feed = state
                .feeds
                .entry(host.to_string())
                .or_insert_with(HostFeed::new);
            let receiver = feed.changes.subscribe();
            let backlog: Vec<ChangeEvent> = match resume_after {
                Some(after) => feed
                    .log
                    .iter()
                    .filter(|(seq, _)| *seq > after)
                    .map(|(_, event)| event.clone())
                    .collect(),
                None => Vec::new(),
            };
            (receiver, start, backlog)
        };

        let live = stream::unfold(receiver, |mut receiver| async move {
            match receiver.recv().await {
                Ok(event) => Some((Ok(event), receiver)),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    Some((Err(StoreError::Lagged(missed)), receiver))
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });
        let host = host.to_string();
        let events = stream::iter(backlog.into_iter().map(Ok))
            .chain(live)
            .filter(move |item| {
                ready(match item {
                    Ok(event) => event.document.host == host && filter.matches(event),
                    Err(_) => true,
                })
            })
            .boxed();
        Ok(ChangeStream::new(ResumeToken(start.to_string()), events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, host: &str) -> ExchangeDocument {
        ExchangeDocument::new(id.into(), host.into(), "offer".into(), false, Utc::now())
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn watch_sees_inserts_for_its_host_only() {
        let store = MemoryDocumentStore::new(Duration::from_secs(10));
        let mut watch = store
            .watch("a", WatchFilter::Inserts, None)
            .await
            .unwrap();
        store.insert(doc("1", "b")).await.unwrap();
        store.insert(doc("2", "a")).await.unwrap();

        let event = watch.next().await.unwrap().unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.document.id, "2");
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn resuming_replays_missed_updates() {
        let store = MemoryDocumentStore::new(Duration::from_secs(10));
        let inserts = store
            .watch("a", WatchFilter::Inserts, None)
            .await
            .unwrap();
        let token = inserts.start_token().clone();
        store.insert(doc("1", "a")).await.unwrap();
        store
            .update("1", DocumentUpdate::CallerDone)
            .await
            .unwrap();

        let mut updates = store
            .watch(
                "a",
                WatchFilter::Updates { id: "1".into() },
                Some(token),
            )
            .await
            .unwrap();
        let event = updates.next().await.unwrap().unwrap();
        assert_eq!(event.kind, ChangeKind::Update);
        assert!(!event.document.caller.phase.is_active());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn busy_neighbours_do_not_make_a_watcher_lag() {
        let store = MemoryDocumentStore::new(Duration::from_secs(10));
        let mut watch = store
            .watch("quiet", WatchFilter::Inserts, None)
            .await
            .unwrap();
        for n in 0..CHANGE_LOG_CAPACITY * 2 {
            store.insert(doc(&format!("busy-{n}"), "busy")).await.unwrap();
        }
        store.insert(doc("mine", "quiet")).await.unwrap();

        let event = watch.next().await.unwrap().unwrap();
        assert_eq!(event.document.id, "mine");
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn find_unanswered_returns_oldest_live_document() {
        let store = MemoryDocumentStore::new(Duration::from_secs(10));
        let mut stale = doc("stale", "a");
        stale.started_at = Utc::now() - chrono::Duration::seconds(60);
        store.insert(stale).await.unwrap();
        store.insert(doc("first", "a")).await.unwrap();
        store.insert(doc("second", "a")).await.unwrap();

        let found = store.find_unanswered("a").await.unwrap().unwrap();
        assert_eq!(found.id, "first");

        store
            .update(
                "first",
                DocumentUpdate::AnswererInit {
                    sdp: "answer".into(),
                },
            )
            .await
            .unwrap();
        let found = store.find_unanswered("a").await.unwrap().unwrap();
        assert_eq!(found.id, "second");
        assert!(matches!(
            store.update("stale", DocumentUpdate::CallerDone).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
