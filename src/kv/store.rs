//! The coordination store trait: a linearizable, watchable KV store
//! with compare-and-swap transactions and lease-scoped keys. `kv::etcd`
//! and `kv::mock` are the two implementations.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

/// Opaque lease handle. All keys bound to a lease vanish when it expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(pub i64);

/// A stored key/value pair with its etcd-style bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision of the last write to this key.
    pub mod_revision: i64,
    /// Number of times this key has been written since creation.
    pub version: i64,
    pub lease: Option<LeaseId>,
}

/// A live lease session: kept alive by a background heartbeat until
/// `close` is called or the TTL elapses without one.
#[async_trait]
pub trait Session: Send + Sync {
    fn lease(&self) -> LeaseId;
    /// Revoke the lease early, deleting every key bound to it.
    async fn close(&self) -> crate::error::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct RangeOptions {
    pub sort: SortOrder,
    pub limit: usize,
    /// Page continues from this revision if set, pinning a long scan to
    /// a point-in-time snapshot (`fromSameRev`).
    pub from_rev: Option<i64>,
}

impl Default for RangeOptions {
    fn default() -> Self {
        Self {
            sort: SortOrder::Asc,
            limit: 100,
            from_rev: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RangePage {
    pub items: Vec<KeyValue>,
    /// Revision the page was read at; pass back via `RangeOptions::from_rev`
    /// to continue the same snapshot.
    pub revision: i64,
    pub more: bool,
}

/// A single guard in a transaction's `If` clause.
#[derive(Debug, Clone)]
pub enum Compare {
    KeyExists(String),
    KeyMissing(String),
    VersionEquals(String, i64),
    ModRevisionLessOrEqual(String, i64),
}

/// A single mutation in a transaction's `Then`/`Else` clause.
#[derive(Debug, Clone)]
pub enum TxnOp {
    Put {
        key: String,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    },
    Delete {
        key: String,
    },
    Get {
        key: String,
    },
}

#[derive(Debug, Clone)]
pub enum TxnOpResponse {
    Put,
    Delete { existed: bool },
    Get { value: Option<KeyValue> },
}

#[derive(Debug, Clone, Default)]
pub struct TxnRequest {
    pub ifs: Vec<Compare>,
    pub then: Vec<TxnOp>,
    pub or_else: Vec<TxnOp>,
}

#[derive(Debug, Clone)]
pub struct TxnResponse {
    pub succeeded: bool,
    pub revision: i64,
    pub responses: Vec<TxnOpResponse>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
}

/// A batch of events delivered in revision order, or a restart sentinel
/// signaling the consumer must drop any local cache, refetch via
/// `GetAll`, and resume watching.
#[derive(Debug, Clone)]
pub enum WatchMessage {
    Events { revision: i64, events: Vec<WatchEvent> },
    Restart,
}

#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    pub from_rev: Option<i64>,
    pub with_prev_value: bool,
}

pub type WatchStream = BoxStream<'static, crate::error::Result<WatchMessage>>;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> crate::error::Result<Option<KeyValue>>;

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> crate::error::Result<i64>;

    /// Returns `(true, revision)` on success, `(false, current_revision)` if the key already existed.
    async fn put_if_not_exists(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> crate::error::Result<(bool, i64)>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> crate::error::Result<bool>;

    async fn range_get(&self, prefix: &str, opts: RangeOptions) -> crate::error::Result<RangePage>;

    async fn txn(&self, req: TxnRequest) -> crate::error::Result<TxnResponse>;

    fn watch(&self, prefix: &str, opts: WatchOptions) -> WatchStream;

    async fn new_session(&self, ttl: Duration) -> crate::error::Result<Box<dyn Session>>;
}
