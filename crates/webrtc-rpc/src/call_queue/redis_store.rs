use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use futures_util::stream;
use redis::AsyncCommands;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};

use super::IceCandidate;
use super::document::{AnswererSide, CallerSide, DocumentUpdate, ExchangeDocument, SidePhase};
use super::store::{
    ChangeEvent, ChangeKind, ChangeStream, DocumentStore, ResumeToken, StoreError, WatchFilter,
};

const KEY_PREFIX: &str = "webrtc-rpc";
const CHANGE_STREAM_MAXLEN: usize = 10_000;
const WATCH_BLOCK_MS: usize = 1_000;
const WATCH_BATCH: usize = 64;

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Codec(err.to_string())
    }
}

/// Redis-backed [`DocumentStore`].
///
/// Layout per exchange: a hash with scalar fields, one list per side for
/// candidates, a per-host sorted set of exchange ids scored by start time,
/// and a per-host Redis Stream used as the change feed. Every key expires
/// after the store TTL.
pub struct RedisDocumentStore {
    client: redis::Client,
    conn: ConnectionManager,
    ttl: Duration,
}

impl RedisDocumentStore {
    pub async fn connect(url: &str, ttl: Duration) -> Result<Arc<Self>, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Arc::new(Self { client, conn, ttl }))
    }

    fn ttl_secs(&self) -> i64 {
        self.ttl.as_secs().max(1) as i64
    }

    fn doc_key(id: &str) -> String {
        format!("{KEY_PREFIX}:exchange:{id}")
    }

    fn candidates_key(id: &str, side: &str) -> String {
        format!("{KEY_PREFIX}:exchange:{id}:{side}_candidates")
    }

    fn host_index_key(host: &str) -> String {
        format!("{KEY_PREFIX}:host:{host}:exchanges")
    }

    fn changes_key(host: &str) -> String {
        format!("{KEY_PREFIX}:host:{host}:changes")
    }

    async fn load(&self, id: &str) -> Result<ExchangeDocument, StoreError> {
        let mut conn = self.conn.clone();
        let (fields, caller, answerer): (HashMap<String, String>, Vec<String>, Vec<String>) =
            redis::pipe()
                .atomic()
                .cmd("HGETALL")
                .arg(Self::doc_key(id))
                .cmd("LRANGE")
                .arg(Self::candidates_key(id, "caller"))
                .arg(0)
                .arg(-1)
                .cmd("LRANGE")
                .arg(Self::candidates_key(id, "answerer"))
                .arg(0)
                .arg(-1)
                .query_async(&mut conn)
                .await?;
        if fields.is_empty() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        decode_document(id, &fields, &caller, &answerer)
    }

    async fn publish(&self, kind: ChangeKind, doc: &ExchangeDocument) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = Self::changes_key(&doc.host);
        let payload = serde_json::to_string(doc)?;
        let kind = match kind {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
        };
        redis::pipe()
            .cmd("XADD")
            .arg(&key)
            .arg("MAXLEN")
            .arg("~")
            .arg(CHANGE_STREAM_MAXLEN)
            .arg("*")
            .arg("kind")
            .arg(kind)
            .arg("doc")
            .arg(&payload)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl_secs())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn tail_id(&self, key: &str) -> Result<String, StoreError> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = redis::cmd("XREVRANGE")
            .arg(key)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await?;
        Ok(reply
            .ids
            .first()
            .map(|entry| entry.id.clone())
            .unwrap_or_else(|| "0-0".to_string()))
    }
}

#[async_trait]
impl DocumentStore for RedisDocumentStore {
    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn insert(&self, doc: ExchangeDocument) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = Self::doc_key(&doc.id);
        let index = Self::host_index_key(&doc.host);
        let started_ms = doc.started_at.timestamp_millis();
        let (caller_done, caller_error) = match &doc.caller.phase {
            SidePhase::Active => ("0", String::new()),
            SidePhase::Done => ("1", String::new()),
            SidePhase::Failed(error) => ("1", error.clone()),
        };
        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&key)
            .arg("host")
            .arg(&doc.host)
            .arg("started_at")
            .arg(started_ms)
            .arg("caller_sdp")
            .arg(&doc.caller.sdp)
            .arg("disable_trickle")
            .arg(if doc.caller.disable_trickle { "1" } else { "0" })
            .arg("caller_done")
            .arg(caller_done)
            .arg("caller_error")
            .arg(caller_error)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl_secs())
            .ignore()
            .cmd("ZADD")
            .arg(&index)
            .arg(started_ms)
            .arg(&doc.id)
            .ignore()
            .cmd("EXPIRE")
            .arg(&index)
            .arg(self.ttl_secs())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        self.publish(ChangeKind::Insert, &doc).await
    }

    async fn update(
        &self,
        id: &str,
        update: DocumentUpdate,
    ) -> Result<ExchangeDocument, StoreError> {
        // validation against the current snapshot is best effort; each side
        // only ever writes its own fields
        let mut current = self.load(id).await?;
        current
            .apply(update.clone())
            .map_err(|reason| StoreError::Illegal {
                id: id.to_string(),
                reason,
            })?;

        let mut conn = self.conn.clone();
        let key = Self::doc_key(id);
        let mut pipe = redis::pipe();
        pipe.atomic();
        match &update {
            DocumentUpdate::CallerCandidate { candidate } => {
                let list = Self::candidates_key(id, "caller");
                pipe.cmd("RPUSH")
                    .arg(&list)
                    .arg(serde_json::to_string(candidate)?)
                    .ignore()
                    .cmd("EXPIRE")
                    .arg(&list)
                    .arg(self.ttl_secs())
                    .ignore();
            }
            DocumentUpdate::CallerDone => {
                pipe.cmd("HSET").arg(&key).arg("caller_done").arg("1").ignore();
            }
            DocumentUpdate::CallerError { error } => {
                pipe.cmd("HSET")
                    .arg(&key)
                    .arg("caller_done")
                    .arg("1")
                    .arg("caller_error")
                    .arg(error)
                    .ignore();
            }
            DocumentUpdate::AnswererInit { sdp } => {
                pipe.cmd("HSET")
                    .arg(&key)
                    .arg("answered")
                    .arg("1")
                    .arg("answerer_sdp")
                    .arg(sdp)
                    .ignore();
            }
            DocumentUpdate::AnswererCandidate { candidate } => {
                let list = Self::candidates_key(id, "answerer");
                pipe.cmd("RPUSH")
                    .arg(&list)
                    .arg(serde_json::to_string(candidate)?)
                    .ignore()
                    .cmd("EXPIRE")
                    .arg(&list)
                    .arg(self.ttl_secs())
                    .ignore();
            }
            DocumentUpdate::AnswererDone => {
                pipe.cmd("HSET").arg(&key).arg("answerer_done").arg("1").ignore();
            }
            DocumentUpdate::AnswererError { error } => {
                pipe.cmd("HSET")
                    .arg(&key)
                    .arg("answerer_done")
                    .arg("1")
                    .arg("answerer_error")
                    .arg(error)
                    .ignore();
            }
        }
        pipe.query_async::<()>(&mut conn).await?;

        let fresh = self.load(id).await?;
        self.publish(ChangeKind::Update, &fresh).await?;
        Ok(fresh)
    }

    async fn find_unanswered(&self, host: &str) -> Result<Option<ExchangeDocument>, StoreError> {
        let mut conn = self.conn.clone();
        let index = Self::host_index_key(host);
        let oldest_live = (Utc::now()
            - chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::zero()))
        .timestamp_millis();
        let _: () = conn
            .zrembyscore(&index, "-inf", format!("({oldest_live}"))
            .await?;
        let ids: Vec<String> = conn.zrangebyscore(&index, oldest_live, "+inf").await?;
        for id in ids {
            match self.load(&id).await {
                Ok(doc) if doc.is_unanswered() && !doc.is_expired(Utc::now(), self.ttl) => {
                    return Ok(Some(doc));
                }
                Ok(_) | Err(StoreError::NotFound(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    async fn watch(
        &self,
        host: &str,
        filter: WatchFilter,
        resume_after: Option<ResumeToken>,
    ) -> Result<ChangeStream, StoreError> {
        let key = Self::changes_key(host);
        let start = match resume_after {
            Some(token) => token.0,
            None => self.tail_id(&key).await?,
        };
        // XREAD BLOCK would stall every other caller on a shared connection
        let conn = self.client.get_multiplexed_async_connection().await?;

        let state = WatchState {
            conn,
            key,
            last_id: start.clone(),
            buffered: VecDeque::new(),
            filter,
        };
        let events = stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.buffered.pop_front() {
                    return Some((Ok(event), state));
                }
                match state.read_batch().await {
                    Ok(()) => continue,
                    Err(err) => return Some((Err(err), state)),
                }
            }
        })
        .boxed();
        Ok(ChangeStream::new(ResumeToken(start), events))
    }
}

struct WatchState {
    conn: MultiplexedConnection,
    key: String,
    last_id: String,
    buffered: VecDeque<ChangeEvent>,
    filter: WatchFilter,
}

impl WatchState {
    async fn read_batch(&mut self) -> Result<(), StoreError> {
        let opts = StreamReadOptions::default()
            .count(WATCH_BATCH)
            .block(WATCH_BLOCK_MS);
        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[&self.key], &[&self.last_id], &opts)
            .await?;
        let Some(reply) = reply else {
            return Ok(());
        };
        for stream_reply in reply.keys {
            for entry in stream_reply.ids {
                self.last_id = entry.id.clone();
                if let Some(event) = decode_event(&entry)? {
                    if self.filter.matches(&event) {
                        self.buffered.push_back(event);
                    }
                }
            }
        }
        Ok(())
    }
}

fn decode_event(entry: &StreamId) -> Result<Option<ChangeEvent>, StoreError> {
    let kind = match entry.map.get("kind") {
        Some(value) => redis::from_redis_value::<String>(value)?,
        None => return Ok(None),
    };
    let kind = match kind.as_str() {
        "insert" => ChangeKind::Insert,
        "update" => ChangeKind::Update,
        _ => return Ok(None),
    };
    let Some(value) = entry.map.get("doc") else {
        return Ok(None);
    };
    let payload = redis::from_redis_value::<String>(value)?;
    let document: ExchangeDocument = serde_json::from_str(&payload)?;
    Ok(Some(ChangeEvent {
        token: ResumeToken(entry.id.clone()),
        kind,
        document,
    }))
}

fn decode_document(
    id: &str,
    fields: &HashMap<String, String>,
    caller: &[String],
    answerer: &[String],
) -> Result<ExchangeDocument, StoreError> {
    let field = |name: &str| fields.get(name).map(String::as_str).unwrap_or_default();
    let flag = |name: &str| field(name) == "1";
    let candidates = |raw: &[String]| -> Result<Vec<IceCandidate>, StoreError> {
        raw.iter()
            .map(|item| serde_json::from_str(item).map_err(StoreError::from))
            .collect()
    };

    let started_ms: i64 = field("started_at")
        .parse()
        .map_err(|_| StoreError::Codec(format!("exchange {id}: bad started_at")))?;
    let started_at: DateTime<Utc> = Utc
        .timestamp_millis_opt(started_ms)
        .single()
        .ok_or_else(|| StoreError::Codec(format!("exchange {id}: bad started_at")))?;

    let caller_phase = match (flag("caller_done"), field("caller_error")) {
        (_, error) if !error.is_empty() => SidePhase::Failed(error.to_string()),
        (true, _) => SidePhase::Done,
        (false, _) => SidePhase::Active,
    };
    let answerer_error = field("answerer_error");
    let answerer_side = if flag("answered") {
        AnswererSide::Answered {
            sdp: field("answerer_sdp").to_string(),
            candidates: candidates(answerer)?,
            phase: if !answerer_error.is_empty() {
                SidePhase::Failed(answerer_error.to_string())
            } else if flag("answerer_done") {
                SidePhase::Done
            } else {
                SidePhase::Active
            },
        }
    } else if !answerer_error.is_empty() {
        AnswererSide::Failed {
            error: answerer_error.to_string(),
        }
    } else {
        AnswererSide::Unanswered
    };

    Ok(ExchangeDocument {
        id: id.to_string(),
        host: field("host").to_string(),
        started_at,
        caller: CallerSide {
            sdp: field("caller_sdp").to_string(),
            disable_trickle: flag("disable_trickle"),
            candidates: candidates(caller)?,
            phase: caller_phase,
        },
        answerer: answerer_side,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_queue::{CallAnswer, CallQueue, DistributedCallQueue, OfferSignaler};
    use tokio_util::sync::CancellationToken;

    #[test_timeout::timeout]
    fn flat_fields_decode_into_phases() {
        let mut fields = HashMap::new();
        fields.insert("host".to_string(), "yeehaw".to_string());
        fields.insert("started_at".to_string(), "1700000000000".to_string());
        fields.insert("caller_sdp".to_string(), "offer".to_string());
        fields.insert("caller_done".to_string(), "1".to_string());
        fields.insert("answered".to_string(), "1".to_string());
        fields.insert("answerer_sdp".to_string(), "answer".to_string());
        fields.insert("answerer_done".to_string(), "1".to_string());
        fields.insert("answerer_error".to_string(), "boom".to_string());

        let doc = decode_document("id", &fields, &[], &[]).unwrap();
        assert_eq!(doc.host, "yeehaw");
        assert_eq!(doc.caller.phase, SidePhase::Done);
        assert_eq!(
            doc.answerer,
            AnswererSide::Answered {
                sdp: "answer".into(),
                candidates: Vec::new(),
                phase: SidePhase::Failed("boom".into()),
            }
        );
    }

    #[test_timeout::tokio_timeout_test(30)]
    #[ignore]
    async fn redis_queue_round_trip() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into());
        let store = RedisDocumentStore::connect(&url, Duration::from_secs(10))
            .await
            .expect("redis available");
        let queue = DistributedCallQueue::new(store);
        let host = format!("redis-test-{}", uuid::Uuid::new_v4());

        let sender = {
            let queue = queue.clone();
            let host = host.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                queue.send_offer(&host, "hello", &cancel).await
            })
        };
        let cancel = CancellationToken::new();
        let exchange = queue.recv_offer(&host, &cancel).await.unwrap();
        assert_eq!(exchange.sdp(), "hello");
        exchange
            .respond(CallAnswer::Init("world".into()))
            .await
            .unwrap();
        exchange.answerer_done().await.unwrap();
        assert_eq!(sender.await.unwrap().unwrap(), "world");
    }
}
