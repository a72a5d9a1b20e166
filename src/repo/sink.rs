//! Read-mostly view over sink definitions, including the per-sink
//! rotation config (`maxFileAge`, `maxFileBytes`, volume assignment)
//! the scheduler reads on every tick; see [`crate::repo::branch`].

use crate::ids::SinkKey;
use crate::kv::{KvStore, PrefixT, TypedWatchMessage};
use crate::repo::model::Sink;
use crate::repo::schema;
use futures::stream::BoxStream;
use std::sync::Arc;

pub struct SinkRepository {
    prefix: PrefixT<Sink>,
}

impl SinkRepository {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { prefix: PrefixT::new(store, schema::DEFINITION_SINK) }
    }

    pub async fn get(&self, key: &SinkKey) -> crate::error::Result<Option<Sink>> {
        Ok(self.prefix.get(&key.path()).await?.map(|kv| kv.value))
    }

    pub async fn list(&self) -> crate::error::Result<Vec<Sink>> {
        Ok(self.prefix.get_all().await?.into_iter().map(|kv| kv.value).collect())
    }

    /// Writes a sink definition. Sink CRUD lives outside this crate in
    /// production; this exists for fixtures and tests that need to seed
    /// one directly against the store.
    pub async fn put(&self, sink: &Sink) -> crate::error::Result<()> {
        let key = SinkKey {
            source: crate::ids::SourceKey {
                branch: crate::ids::BranchKey { project_id: sink.project_id.clone(), branch_id: sink.branch_id.clone() },
                source_id: sink.source_id.clone(),
            },
            sink_id: sink.sink_id.clone(),
        };
        self.prefix.put(&key.path(), sink).await?;
        Ok(())
    }

    pub fn watch_all(&self) -> BoxStream<'static, crate::error::Result<TypedWatchMessage<Sink>>> {
        self.prefix.get_all_and_watch()
    }
}
