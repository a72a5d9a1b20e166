//! Read-mostly view over source definitions; see [`crate::repo::branch`].

use crate::ids::SourceKey;
use crate::kv::{KvStore, PrefixT};
use crate::repo::model::Source;
use crate::repo::schema;
use std::sync::Arc;

pub struct SourceRepository {
    prefix: PrefixT<Source>,
}

impl SourceRepository {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { prefix: PrefixT::new(store, schema::DEFINITION_SOURCE) }
    }

    pub async fn get(&self, key: &SourceKey) -> crate::error::Result<Option<Source>> {
        Ok(self.prefix.get(&key.path()).await?.map(|kv| kv.value))
    }
}
