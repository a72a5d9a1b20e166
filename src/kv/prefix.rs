//! Typed key prefixes: a thin, generic layer over `KvStore` that decodes
//! JSON values into domain types and turns raw watch events into typed
//! ones, without ever letting a single bad record kill the stream.

use super::store::{
    EventKind, KeyValue, KvStore, RangeOptions, SortOrder, WatchEvent, WatchMessage, WatchOptions,
};
use crate::error::{Error, Result};
use futures::stream::{BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

/// A typed value paired with its key and store bookkeeping.
#[derive(Debug, Clone)]
pub struct TypedKv<T> {
    pub key: String,
    pub value: T,
    pub mod_revision: i64,
    pub version: i64,
}

fn decode<T: DeserializeOwned>(kv: &KeyValue) -> Result<T> {
    serde_json::from_slice(&kv.value).map_err(Error::from)
}

fn decode_typed<T: DeserializeOwned>(kv: &KeyValue) -> Result<TypedKv<T>> {
    Ok(TypedKv {
        key: kv.key.clone(),
        value: decode(kv)?,
        mod_revision: kv.mod_revision,
        version: kv.version,
    })
}

/// A typed watch event. `DecodeError` is surfaced instead of aborting
/// the stream, mirroring the raw store's "skip and keep watching"
/// behavior for records a reader's schema can't parse.
#[derive(Debug, Clone)]
pub enum TypedEvent<T> {
    Create(TypedKv<T>),
    Update(TypedKv<T>),
    Delete { key: String },
    DecodeError { key: String, error: String },
}

#[derive(Debug, Clone)]
pub enum TypedWatchMessage<T> {
    Events { revision: i64, events: Vec<TypedEvent<T>> },
    Restart,
}

fn convert_event<T: DeserializeOwned>(event: WatchEvent) -> TypedEvent<T> {
    match event.kind {
        EventKind::Delete => TypedEvent::Delete { key: event.kv.key },
        EventKind::Create => match decode_typed(&event.kv) {
            Ok(v) => TypedEvent::Create(v),
            Err(e) => TypedEvent::DecodeError { key: event.kv.key, error: e.to_string() },
        },
        EventKind::Update => match decode_typed(&event.kv) {
            Ok(v) => TypedEvent::Update(v),
            Err(e) => TypedEvent::DecodeError { key: event.kv.key, error: e.to_string() },
        },
    }
}

/// A key prefix scoped to values of type `T`, e.g. `file/all/<project>/<branch>/...`.
#[derive(Clone)]
pub struct PrefixT<T> {
    store: Arc<dyn KvStore>,
    prefix: String,
    _marker: PhantomData<T>,
}

impl<T> PrefixT<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(store: Arc<dyn KvStore>, prefix: impl Into<String>) -> Self {
        Self { store, prefix: prefix.into(), _marker: PhantomData }
    }

    /// A sub-prefix nested under this one, e.g. moving from `file/all/`
    /// to `file/all/<sink>/`.
    pub fn sub(&self, suffix: &str) -> Self {
        Self::new(self.store.clone(), format!("{}{}", self.prefix, suffix))
    }

    pub fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    pub async fn get(&self, suffix: &str) -> Result<Option<TypedKv<T>>> {
        match self.store.get(&self.key(suffix)).await? {
            Some(kv) => Ok(Some(decode_typed(&kv)?)),
            None => Ok(None),
        }
    }

    pub async fn put(&self, suffix: &str, value: &T) -> Result<i64> {
        let bytes = serde_json::to_vec(value)?;
        self.store.put(&self.key(suffix), bytes, None).await
    }

    pub async fn delete(&self, suffix: &str) -> Result<bool> {
        self.store.delete(&self.key(suffix)).await
    }

    /// Fetch every value under this prefix, sorted ascending, paging
    /// transparently through the store's range limit.
    pub async fn get_all(&self) -> Result<Vec<TypedKv<T>>> {
        let mut out = Vec::new();
        let mut last_key: Option<String> = None;
        loop {
            let from = match &last_key {
                Some(k) => format!("{k}\0"),
                None => self.prefix.clone(),
            };
            let page = self
                .store
                .range_get(&from, RangeOptions { sort: SortOrder::Asc, limit: 1000, from_rev: None })
                .await?;
            let mut saw_any = false;
            for kv in &page.items {
                if !kv.key.starts_with(&self.prefix) {
                    continue;
                }
                saw_any = true;
                last_key = Some(kv.key.clone());
                match decode_typed(kv) {
                    Ok(v) => out.push(v),
                    Err(_) => continue,
                }
            }
            if !page.more || !saw_any {
                break;
            }
        }
        Ok(out)
    }

    /// Snapshot the prefix, then watch it for changes. The returned
    /// stream never terminates on a decode error — it yields
    /// `DecodeError` for that one record and keeps going. On
    /// compaction or transport loss it yields `Restart` and the caller
    /// is expected to call `get_all` again.
    pub fn get_all_and_watch(&self) -> BoxStream<'static, Result<TypedWatchMessage<T>>> {
        let raw = self.store.watch(&self.prefix, WatchOptions::default());
        raw.map(|msg| {
            msg.map(|m| match m {
                WatchMessage::Events { revision, events } => TypedWatchMessage::Events {
                    revision,
                    events: events.into_iter().map(convert_event::<T>).collect(),
                },
                WatchMessage::Restart => TypedWatchMessage::Restart,
            })
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::mock::MockStore;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Widget {
        name: String,
    }

    #[tokio::test]
    async fn put_get_roundtrips_through_json() {
        let store = MockStore::new();
        let prefix: PrefixT<Widget> = PrefixT::new(store, "widget/");
        prefix.put("a", &Widget { name: "one".into() }).await.unwrap();
        let got = prefix.get("a").await.unwrap().unwrap();
        assert_eq!(got.value, Widget { name: "one".into() });
    }

    #[tokio::test]
    async fn get_all_skips_undecodable_records_but_keeps_others() {
        let store = MockStore::new();
        store.put("widget/bad", b"not json".to_vec(), None).await.unwrap();
        let prefix: PrefixT<Widget> = PrefixT::new(store.clone(), "widget/");
        prefix.put("good", &Widget { name: "ok".into() }).await.unwrap();

        let all = prefix.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].value.name, "ok");
    }

    #[tokio::test]
    async fn watch_surfaces_decode_error_without_ending_stream() {
        let store = MockStore::new();
        let prefix: PrefixT<Widget> = PrefixT::new(store.clone(), "widget/");
        let mut stream = prefix.get_all_and_watch();

        store.put("widget/bad", b"not json".to_vec(), None).await.unwrap();
        let msg = stream.next().await.unwrap().unwrap();
        match msg {
            TypedWatchMessage::Events { events, .. } => {
                assert!(matches!(events[0], TypedEvent::DecodeError { .. }));
            }
            TypedWatchMessage::Restart => panic!("unexpected restart"),
        }

        prefix.put("good", &Widget { name: "ok".into() }).await.unwrap();
        let msg = stream.next().await.unwrap().unwrap();
        match msg {
            TypedWatchMessage::Events { events, .. } => {
                assert!(matches!(&events[0], TypedEvent::Create(v) if v.value.name == "ok"));
            }
            TypedWatchMessage::Restart => panic!("unexpected restart"),
        }
    }
}
