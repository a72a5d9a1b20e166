//! Volume registration: lease-scoped presence under
//! `storage/volume/{writer|reader}/<volumeID>`. Entries vanish the
//! moment a node's session lease expires, so a crashed node stops
//! being offered to `FileRepository::rotate` without anyone cleaning
//! up explicitly.

use crate::error::{Error, Result};
use crate::kv::{KvStore, LeaseId, RangeOptions, SortOrder};
use crate::repo::model::Volume;
use crate::repo::schema;
use std::sync::Arc;

pub struct VolumeRepository {
    store: Arc<dyn KvStore>,
}

fn decode(bytes: &[u8]) -> Result<Volume> {
    serde_json::from_slice(bytes).map_err(Error::from)
}

impl VolumeRepository {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn register_writer_volume(&self, volume: &Volume, lease: LeaseId) -> Result<()> {
        let key = schema::volume_writer_key(volume.volume_id.as_str());
        self.store.put(&key, serde_json::to_vec(volume)?, Some(lease)).await?;
        Ok(())
    }

    pub async fn register_reader_volume(&self, volume: &Volume, lease: LeaseId) -> Result<()> {
        let key = schema::volume_reader_key(volume.volume_id.as_str());
        self.store.put(&key, serde_json::to_vec(volume)?, Some(lease)).await?;
        Ok(())
    }

    pub async fn writer_volumes(&self) -> Result<Vec<Volume>> {
        let page = self
            .store
            .range_get(schema::VOLUME_WRITER, RangeOptions { sort: SortOrder::Asc, limit: 10_000, from_rev: None })
            .await?;
        page.items.iter().map(|kv| decode(&kv.value)).collect()
    }

    pub async fn reader_volumes(&self) -> Result<Vec<Volume>> {
        let page = self
            .store
            .range_get(schema::VOLUME_READER, RangeOptions { sort: SortOrder::Asc, limit: 10_000, from_rev: None })
            .await?;
        page.items.iter().map(|kv| decode(&kv.value)).collect()
    }
}
