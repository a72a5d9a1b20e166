//! In-memory coordination store used by this crate's own test suite and
//! by downstream integrators who want to unit test against the `kv`
//! API without a running etcd cluster.
//!
//! Revisions are a single global counter, exactly as etcd's are; lease
//! expiry is driven by a background reaper so lease-bound keys really do
//! vanish when a session's heartbeat stops, letting crash-recovery
//! scenarios be exercised under `tokio::time::pause`.

use super::store::*;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct WatchBroadcast {
    revision: i64,
    events: Vec<WatchEvent>,
}

struct LeaseInfo {
    ttl: Duration,
    last_renew: Instant,
    keys: HashSet<String>,
}

struct Inner {
    data: BTreeMap<String, KeyValue>,
    revision: i64,
    leases: HashMap<i64, LeaseInfo>,
}

pub struct MockStore {
    inner: Arc<Mutex<Inner>>,
    tx: broadcast::Sender<WatchBroadcast>,
    next_lease: AtomicI64,
    _reaper: tokio::task::JoinHandle<()>,
}

impl MockStore {
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(1024);
        let inner = Arc::new(Mutex::new(Inner {
            data: BTreeMap::new(),
            revision: 0,
            leases: HashMap::new(),
        }));

        let reaper_inner = inner.clone();
        let reaper_tx = tx.clone();
        let reaper = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let mut guard = reaper_inner.lock().await;
                let now = Instant::now();
                let expired: Vec<i64> = guard
                    .leases
                    .iter()
                    .filter(|(_, l)| now.duration_since(l.last_renew) > l.ttl)
                    .map(|(id, _)| *id)
                    .collect();
                if expired.is_empty() {
                    continue;
                }
                let mut events = Vec::new();
                let rev = guard.revision + 1;
                for lease_id in expired {
                    if let Some(lease) = guard.leases.remove(&lease_id) {
                        for key in lease.keys {
                            if let Some(kv) = guard.data.remove(&key) {
                                events.push(WatchEvent {
                                    kind: EventKind::Delete,
                                    kv: kv.clone(),
                                    prev_kv: Some(kv),
                                });
                            }
                        }
                    }
                }
                if !events.is_empty() {
                    guard.revision = rev;
                    let _ = reaper_tx.send(WatchBroadcast { revision: rev, events });
                }
            }
        });

        Arc::new(Self {
            inner,
            tx,
            next_lease: AtomicI64::new(1),
            _reaper: reaper,
        })
    }

    fn eval_compare(inner: &Inner, cmp: &Compare) -> bool {
        match cmp {
            Compare::KeyExists(k) => inner.data.contains_key(k),
            Compare::KeyMissing(k) => !inner.data.contains_key(k),
            Compare::VersionEquals(k, v) => {
                inner.data.get(k).map(|kv| kv.version).unwrap_or(0) == *v
            }
            Compare::ModRevisionLessOrEqual(k, v) => {
                inner.data.get(k).map(|kv| kv.mod_revision <= *v).unwrap_or(true)
            }
        }
    }
}

#[async_trait]
impl KvStore for MockStore {
    async fn get(&self, key: &str) -> crate::error::Result<Option<KeyValue>> {
        Ok(self.inner.lock().await.data.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> crate::error::Result<i64> {
        let resp = self
            .txn(TxnRequest {
                ifs: vec![],
                then: vec![TxnOp::Put {
                    key: key.to_string(),
                    value,
                    lease,
                }],
                or_else: vec![],
            })
            .await?;
        Ok(resp.revision)
    }

    async fn put_if_not_exists(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> crate::error::Result<(bool, i64)> {
        let resp = self
            .txn(TxnRequest {
                ifs: vec![Compare::KeyMissing(key.to_string())],
                then: vec![TxnOp::Put {
                    key: key.to_string(),
                    value,
                    lease,
                }],
                or_else: vec![],
            })
            .await?;
        Ok((resp.succeeded, resp.revision))
    }

    async fn delete(&self, key: &str) -> crate::error::Result<bool> {
        let resp = self
            .txn(TxnRequest {
                ifs: vec![],
                then: vec![TxnOp::Delete { key: key.to_string() }],
                or_else: vec![],
            })
            .await?;
        match resp.responses.first() {
            Some(TxnOpResponse::Delete { existed }) => Ok(*existed),
            _ => Ok(false),
        }
    }

    async fn range_get(&self, prefix: &str, opts: RangeOptions) -> crate::error::Result<RangePage> {
        let inner = self.inner.lock().await;
        let mut items: Vec<KeyValue> = inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v.clone())
            .collect();
        if opts.sort == SortOrder::Desc {
            items.reverse();
        }
        let more = items.len() > opts.limit;
        items.truncate(opts.limit);
        Ok(RangePage {
            items,
            revision: opts.from_rev.unwrap_or(inner.revision),
            more,
        })
    }

    async fn txn(&self, req: TxnRequest) -> crate::error::Result<TxnResponse> {
        let mut inner = self.inner.lock().await;
        let succeeded = req.ifs.iter().all(|c| Self::eval_compare(&inner, c));
        let ops = if succeeded { &req.then } else { &req.or_else };

        let mut responses = Vec::with_capacity(ops.len());
        let mut events = Vec::new();
        let mut mutated = false;
        let candidate_rev = inner.revision + 1;

        for op in ops {
            match op {
                TxnOp::Put { key, value, lease } => {
                    let existing = inner.data.get(key).cloned();
                    let version = existing.as_ref().map(|kv| kv.version + 1).unwrap_or(1);
                    let kv = KeyValue {
                        key: key.clone(),
                        value: value.clone(),
                        mod_revision: candidate_rev,
                        version,
                        lease: *lease,
                    };
                    inner.data.insert(key.clone(), kv.clone());
                    if let Some(lease_id) = lease {
                        if let Some(info) = inner.leases.get_mut(&lease_id.0) {
                            info.keys.insert(key.clone());
                        }
                    }
                    events.push(WatchEvent {
                        kind: if existing.is_some() { EventKind::Update } else { EventKind::Create },
                        kv,
                        prev_kv: existing,
                    });
                    responses.push(TxnOpResponse::Put);
                    mutated = true;
                }
                TxnOp::Delete { key } => {
                    let removed = inner.data.remove(key);
                    let existed = removed.is_some();
                    if let Some(kv) = removed {
                        if let Some(lease_id) = kv.lease {
                            if let Some(info) = inner.leases.get_mut(&lease_id.0) {
                                info.keys.remove(key);
                            }
                        }
                        events.push(WatchEvent {
                            kind: EventKind::Delete,
                            kv: kv.clone(),
                            prev_kv: Some(kv),
                        });
                        mutated = true;
                    }
                    responses.push(TxnOpResponse::Delete { existed });
                }
                TxnOp::Get { key } => {
                    responses.push(TxnOpResponse::Get {
                        value: inner.data.get(key).cloned(),
                    });
                }
            }
        }

        if mutated {
            inner.revision = candidate_rev;
        }
        let out_revision = inner.revision;
        drop(inner);

        if !events.is_empty() {
            let _ = self.tx.send(WatchBroadcast {
                revision: out_revision,
                events,
            });
        }

        Ok(TxnResponse {
            succeeded,
            revision: out_revision,
            responses,
        })
    }

    fn watch(&self, prefix: &str, _opts: WatchOptions) -> WatchStream {
        let prefix = prefix.to_string();
        let rx = self.tx.subscribe();
        stream::unfold(rx, move |mut rx| {
            let prefix = prefix.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(batch) => {
                            let filtered: Vec<_> = batch
                                .events
                                .into_iter()
                                .filter(|e| e.kv.key.starts_with(&prefix))
                                .collect();
                            if filtered.is_empty() {
                                continue;
                            }
                            return Some((
                                Ok(WatchMessage::Events {
                                    revision: batch.revision,
                                    events: filtered,
                                }),
                                rx,
                            ));
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            return Some((Ok(WatchMessage::Restart), rx));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed()
    }

    async fn new_session(&self, ttl: Duration) -> crate::error::Result<Box<dyn Session>> {
        let lease_id = self.next_lease.fetch_add(1, Ordering::SeqCst);
        {
            let mut inner = self.inner.lock().await;
            inner.leases.insert(
                lease_id,
                LeaseInfo {
                    ttl,
                    last_renew: Instant::now(),
                    keys: HashSet::new(),
                },
            );
        }

        let keepalive_inner = self.inner.clone();
        let keepalive_handle = tokio::spawn(async move {
            let period = ttl / 3;
            loop {
                tokio::time::sleep(period).await;
                let mut inner = keepalive_inner.lock().await;
                if let Some(info) = inner.leases.get_mut(&lease_id) {
                    info.last_renew = Instant::now();
                } else {
                    return;
                }
            }
        });

        Ok(Box::new(MockSession {
            lease_id,
            inner: self.inner.clone(),
            tx: self.tx.clone(),
            keepalive_handle: Some(keepalive_handle),
        }))
    }
}

struct MockSession {
    lease_id: i64,
    inner: Arc<Mutex<Inner>>,
    tx: broadcast::Sender<WatchBroadcast>,
    keepalive_handle: Option<tokio::task::JoinHandle<()>>,
}

#[async_trait]
impl Session for MockSession {
    fn lease(&self) -> LeaseId {
        LeaseId(self.lease_id)
    }

    async fn close(&self) -> crate::error::Result<()> {
        if let Some(handle) = &self.keepalive_handle {
            handle.abort();
        }
        let mut inner = self.inner.lock().await;
        if let Some(lease) = inner.leases.remove(&self.lease_id) {
            let rev = inner.revision + 1;
            let mut events = Vec::new();
            for key in lease.keys {
                if let Some(kv) = inner.data.remove(&key) {
                    events.push(WatchEvent {
                        kind: EventKind::Delete,
                        kv: kv.clone(),
                        prev_kv: Some(kv),
                    });
                }
            }
            if !events.is_empty() {
                inner.revision = rev;
                let _ = self.tx.send(WatchBroadcast { revision: rev, events });
            }
        }
        Ok(())
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        // A dropped handle with no explicit `close()` models a crashed
        // node: its keepalive task is aborted, but the lease and its
        // keys are left for the reaper to expire after the TTL.
        if let Some(handle) = self.keepalive_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_if_not_exists_guards_double_create() {
        let store = MockStore::new();
        let (ok1, _) = store.put_if_not_exists("k", b"a".to_vec(), None).await.unwrap();
        assert!(ok1);
        let (ok2, _) = store.put_if_not_exists("k", b"b".to_vec(), None).await.unwrap();
        assert!(!ok2);
        assert_eq!(store.get("k").await.unwrap().unwrap().value, b"a");
    }

    #[tokio::test]
    async fn range_get_respects_prefix_and_sort() {
        let store = MockStore::new();
        for k in ["a/1", "a/2", "a/3", "b/1"] {
            store.put(k, vec![], None).await.unwrap();
        }
        let page = store
            .range_get("a/", RangeOptions { sort: SortOrder::Desc, limit: 10, from_rev: None })
            .await
            .unwrap();
        let keys: Vec<_> = page.items.iter().map(|kv| kv.key.clone()).collect();
        assert_eq!(keys, vec!["a/3", "a/2", "a/1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn lease_expires_and_deletes_bound_keys() {
        let store = MockStore::new();
        let session = store.new_session(Duration::from_millis(300)).await.unwrap();
        store
            .put("lock/x", b"node-a".to_vec(), Some(session.lease()))
            .await
            .unwrap();
        assert!(store.get("lock/x").await.unwrap().is_some());

        // Simulate a crash: drop the session without calling close(), so
        // the keepalive heartbeat stops.
        drop(session);

        tokio::time::advance(Duration::from_millis(500)).await;
        // Let the reaper task observe the advanced time.
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;

        assert!(store.get("lock/x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn watch_delivers_put_events_for_matching_prefix() {
        let store = MockStore::new();
        let mut stream = store.watch("a/", WatchOptions::default());
        store.put("a/1", b"x".to_vec(), None).await.unwrap();
        store.put("b/1", b"y".to_vec(), None).await.unwrap();

        let msg = stream.next().await.unwrap().unwrap();
        match msg {
            WatchMessage::Events { events, .. } => {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].kv.key, "a/1");
            }
            WatchMessage::Restart => panic!("unexpected restart"),
        }
    }
}
