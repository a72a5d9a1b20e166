//! Real coordination store backend, built on `etcd-client`. Compiled
//! only under the `etcd` feature so a pure in-process test build never
//! needs a running cluster.

use super::store::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use etcd_client::{Client, Compare as EtcdCompare, CompareOp, GetOptions, PutOptions, SortOrder as EtcdSortOrder, Txn as EtcdTxn, TxnOp as EtcdTxnOp, WatchOptions as EtcdWatchOptions};
use futures::stream::{self, StreamExt};
use std::time::Duration;
use tracing::{debug, warn};

pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|e| Error::Unavailable(format!("connecting to coordination store: {e}")))?;
        Ok(Self { client })
    }

    /// Every client error is treated as a transient `Unavailable`: this
    /// is a coordination store, and callers already retry through
    /// `kv::retry` rather than branching on gRPC status codes here.
    fn map_err(e: etcd_client::Error) -> Error {
        Error::Unavailable(e.to_string())
    }
}

fn to_keyvalue(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
        mod_revision: kv.mod_revision(),
        version: kv.version(),
        lease: if kv.lease() == 0 { None } else { Some(LeaseId(kv.lease())) },
    }
}

fn compare_to_etcd(c: &Compare) -> EtcdCompare {
    match c {
        Compare::KeyExists(k) => EtcdCompare::create_revision(k.as_str(), CompareOp::Greater, 0),
        Compare::KeyMissing(k) => EtcdCompare::create_revision(k.as_str(), CompareOp::Equal, 0),
        Compare::VersionEquals(k, v) => EtcdCompare::version(k.as_str(), CompareOp::Equal, *v),
        Compare::ModRevisionLessOrEqual(k, v) => {
            EtcdCompare::mod_revision(k.as_str(), CompareOp::LessOrEqual, *v)
        }
    }
}

fn op_to_etcd(op: &TxnOp) -> EtcdTxnOp {
    match op {
        TxnOp::Put { key, value, lease } => {
            let mut opts = PutOptions::new();
            if let Some(l) = lease {
                opts = opts.with_lease(l.0);
            }
            EtcdTxnOp::put(key.as_str(), value.clone(), Some(opts))
        }
        TxnOp::Delete { key } => EtcdTxnOp::delete(key.as_str(), None),
        TxnOp::Get { key } => EtcdTxnOp::get(key.as_str(), None),
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let mut client = self.client.kv_client();
        let resp = client.get(key, None).await.map_err(Self::map_err)?;
        Ok(resp.kvs().first().map(to_keyvalue))
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<i64> {
        let mut client = self.client.kv_client();
        let opts = lease.map(|l| PutOptions::new().with_lease(l.0));
        let resp = client.put(key, value, opts).await.map_err(Self::map_err)?;
        Ok(resp.header().map(|h| h.revision()).unwrap_or_default())
    }

    async fn put_if_not_exists(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<(bool, i64)> {
        let resp = self
            .txn(TxnRequest {
                ifs: vec![Compare::KeyMissing(key.to_string())],
                then: vec![TxnOp::Put { key: key.to_string(), value, lease }],
                or_else: vec![],
            })
            .await?;
        Ok((resp.succeeded, resp.revision))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut client = self.client.kv_client();
        let resp = client.delete(key, None).await.map_err(Self::map_err)?;
        Ok(resp.deleted() > 0)
    }

    async fn range_get(&self, prefix: &str, opts: RangeOptions) -> Result<RangePage> {
        let mut client = self.client.kv_client();
        let mut get_opts = GetOptions::new()
            .with_prefix()
            .with_limit(opts.limit as i64 + 1)
            .with_sort(
                etcd_client::SortTarget::Key,
                match opts.sort {
                    SortOrder::Asc => EtcdSortOrder::Ascend,
                    SortOrder::Desc => EtcdSortOrder::Descend,
                },
            );
        if let Some(rev) = opts.from_rev {
            get_opts = get_opts.with_revision(rev);
        }
        let resp = client.get(prefix, Some(get_opts)).await.map_err(Self::map_err)?;
        let mut items: Vec<KeyValue> = resp.kvs().iter().map(to_keyvalue).collect();
        let more = items.len() > opts.limit;
        items.truncate(opts.limit);
        Ok(RangePage {
            items,
            revision: resp.header().map(|h| h.revision()).unwrap_or_default(),
            more,
        })
    }

    async fn txn(&self, req: TxnRequest) -> Result<TxnResponse> {
        let mut client = self.client.kv_client();
        let etcd_txn = EtcdTxn::new()
            .when(req.ifs.iter().map(compare_to_etcd).collect::<Vec<_>>())
            .and_then(req.then.iter().map(op_to_etcd).collect::<Vec<_>>())
            .or_else(req.or_else.iter().map(op_to_etcd).collect::<Vec<_>>());

        let resp = client.txn(etcd_txn).await.map_err(Self::map_err)?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
        let succeeded = resp.succeeded();
        let ops = if succeeded { &req.then } else { &req.or_else };
        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            responses.push(match op {
                TxnOp::Put { .. } => TxnOpResponse::Put,
                TxnOp::Delete { .. } => TxnOpResponse::Delete { existed: true },
                TxnOp::Get { key } => TxnOpResponse::Get { value: self.get(key).await.ok().flatten() },
            });
        }
        Ok(TxnResponse { succeeded, revision, responses })
    }

    fn watch(&self, prefix: &str, opts: WatchOptions) -> WatchStream {
        let mut client = self.client.clone();
        let prefix = prefix.to_string();
        stream::once(async move {
            let mut watch_opts = EtcdWatchOptions::new().with_prefix().with_prev_key();
            if let Some(rev) = opts.from_rev {
                watch_opts = watch_opts.with_start_revision(rev);
            }
            match client.watch(prefix.as_str(), Some(watch_opts)).await {
                Ok((_watcher, stream)) => stream::unfold(stream, |mut stream| async move {
                    match stream.message().await {
                        Ok(Some(resp)) => {
                            if resp.canceled() || resp.compact_revision() > 0 {
                                warn!("coordination store watch restarted: compaction or cancellation");
                                return Some((Ok(WatchMessage::Restart), stream));
                            }
                            let events = resp
                                .events()
                                .iter()
                                .filter_map(|e| {
                                    let kv = e.kv()?;
                                    let kind = match e.event_type() {
                                        etcd_client::EventType::Put if e.is_create() => EventKind::Create,
                                        etcd_client::EventType::Put => EventKind::Update,
                                        etcd_client::EventType::Delete => EventKind::Delete,
                                    };
                                    Some(WatchEvent {
                                        kind,
                                        kv: to_keyvalue(kv),
                                        prev_kv: e.prev_kv().map(to_keyvalue),
                                    })
                                })
                                .collect::<Vec<_>>();
                            debug!(count = events.len(), "coordination store watch events");
                            Some((
                                Ok(WatchMessage::Events {
                                    revision: resp.header().map(|h| h.revision()).unwrap_or_default(),
                                    events,
                                }),
                                stream,
                            ))
                        }
                        Ok(None) => None,
                        Err(e) => Some((Err(Self::map_err(e)), stream)),
                    }
                })
                .boxed(),
                Err(e) => stream::once(async move { Err::<WatchMessage, _>(Self::map_err(e)) }).boxed(),
            }
        })
        .flatten()
        .boxed()
    }

    async fn new_session(&self, ttl: Duration) -> Result<Box<dyn Session>> {
        let mut lease_client = self.client.lease_client();
        let grant = lease_client
            .grant(ttl.as_secs().max(1) as i64, None)
            .await
            .map_err(Self::map_err)?;
        let lease_id = grant.id();

        let (mut keeper, mut keep_alive_stream) =
            lease_client.keep_alive(lease_id).await.map_err(Self::map_err)?;
        let keepalive_handle = tokio::spawn(async move {
            let period = ttl / 3;
            loop {
                tokio::time::sleep(period).await;
                if keeper.keep_alive().await.is_err() {
                    return;
                }
                match keep_alive_stream.message().await {
                    Ok(Some(_)) => {}
                    _ => return,
                }
            }
        });

        Ok(Box::new(EtcdSession {
            lease_id,
            client: self.client.clone(),
            keepalive_handle: Some(keepalive_handle),
        }))
    }
}

struct EtcdSession {
    lease_id: i64,
    client: Client,
    keepalive_handle: Option<tokio::task::JoinHandle<()>>,
}

#[async_trait]
impl Session for EtcdSession {
    fn lease(&self) -> LeaseId {
        LeaseId(self.lease_id)
    }

    async fn close(&self) -> Result<()> {
        if let Some(handle) = &self.keepalive_handle {
            handle.abort();
        }
        let mut lease_client = self.client.lease_client();
        lease_client.revoke(self.lease_id).await.map_err(EtcdStore::map_err)?;
        Ok(())
    }
}

impl Drop for EtcdSession {
    fn drop(&mut self) {
        if let Some(handle) = self.keepalive_handle.take() {
            handle.abort();
        }
    }
}
