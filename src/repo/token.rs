//! Staging credentials attached to a Sink, refreshed out of band by
//! whatever manages warehouse auth, read by upload tasks.

use crate::clock::format_ts;
use crate::error::{Error, Result};
use crate::ids::SinkKey;
use crate::kv::KvStore;
use crate::repo::model::Token;
use crate::repo::schema;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub struct TokenRepository {
    store: Arc<dyn KvStore>,
}

fn decode(bytes: &[u8]) -> Result<Token> {
    serde_json::from_slice(bytes).map_err(Error::from)
}

impl TokenRepository {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, sink: &SinkKey) -> Result<Token> {
        let kv = self
            .store
            .get(&schema::token_key(sink))
            .await?
            .ok_or_else(|| Error::NotFound(format!("token for {}", sink.path())))?;
        decode(&kv.value)
    }

    pub async fn put(&self, token: &Token) -> Result<()> {
        let sink = SinkKey {
            source: crate::ids::SourceKey {
                branch: crate::ids::BranchKey { project_id: token.project_id.clone(), branch_id: token.branch_id.clone() },
                source_id: token.source_id.clone(),
            },
            sink_id: token.sink_id.clone(),
        };
        self.store.put(&schema::token_key(&sink), serde_json::to_vec(token)?, None).await?;
        Ok(())
    }

    pub async fn refresh(&self, sink: &SinkKey, new_value: String, now: DateTime<Utc>) -> Result<Token> {
        let mut token = self.get(sink).await?;
        token.token = new_value;
        token.refreshed_at = format_ts(now);
        self.put(&token).await?;
        Ok(token)
    }
}
