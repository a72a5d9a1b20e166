//! Read-mostly view over branch definitions. Branches, sources, and
//! sinks are configured entities owned by a surface this crate doesn't
//! implement (see the source/sink repositories); the core only watches
//! them to know what to route and rotate.

use crate::ids::{BranchKey, ProjectId};
use crate::kv::{KvStore, PrefixT};
use crate::repo::model::Branch;
use crate::repo::schema;
use std::sync::Arc;

pub struct BranchRepository {
    prefix: PrefixT<Branch>,
}

impl BranchRepository {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { prefix: PrefixT::new(store, schema::DEFINITION_BRANCH) }
    }

    pub async fn get(&self, key: &BranchKey) -> crate::error::Result<Option<Branch>> {
        Ok(self.prefix.get(&key.path()).await?.map(|kv| kv.value))
    }

    pub async fn list(&self, project_id: &ProjectId) -> crate::error::Result<Vec<Branch>> {
        let all = self.prefix.get_all().await?;
        Ok(all
            .into_iter()
            .filter(|kv| kv.value.project_id == *project_id)
            .map(|kv| kv.value)
            .collect())
    }
}
