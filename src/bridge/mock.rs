//! In-memory `WarehouseBridge` for tests: records every call it
//! receives and lets a test script failures in with `fail_next`.

use crate::bridge::{BridgeError, BridgeResult, StagingCredentials, TableKey, WarehouseBridge};
use crate::ids::SinkKey;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateFileResource(SinkKey),
    UploadSlice { credentials: String, len: usize },
    EnsureTable(TableKey),
    LoadTable { table: TableKey, staged_files: Vec<String> },
}

#[derive(Default)]
struct Inner {
    calls: Vec<Call>,
    queued_failures: VecDeque<BridgeError>,
    ensured_tables: Vec<TableKey>,
}

/// Test double for [`WarehouseBridge`]. Call [`MockBridge::fail_next`]
/// before an operation to have it return that error instead of
/// succeeding; the queue drains one error per call.
pub struct MockBridge {
    inner: Mutex<Inner>,
}

impl MockBridge {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }

    pub fn fail_next(&self, error: BridgeError) {
        self.inner.lock().queued_failures.push_back(error);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().calls.clone()
    }

    fn take_failure(&self, inner: &mut Inner) -> Option<BridgeError> {
        inner.queued_failures.pop_front()
    }
}

impl Default for MockBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WarehouseBridge for MockBridge {
    async fn create_file_resource(&self, sink: &SinkKey) -> BridgeResult<StagingCredentials> {
        let mut inner = self.inner.lock();
        inner.calls.push(Call::CreateFileResource(sink.clone()));
        if let Some(e) = self.take_failure(&mut inner) {
            return Err(e);
        }
        Ok(StagingCredentials {
            credentials: format!("staging-token-{}", sink.path()),
            expires_at: "2999-01-01T00:00:00.000Z".to_string(),
        })
    }

    async fn upload_slice(&self, credentials: &str, bytes: Vec<u8>) -> BridgeResult<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(Call::UploadSlice { credentials: credentials.to_string(), len: bytes.len() });
        if let Some(e) = self.take_failure(&mut inner) {
            return Err(e);
        }
        Ok(())
    }

    async fn ensure_table(&self, table: &TableKey, _columns: &[String], _primary_key: &[String]) -> BridgeResult<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(Call::EnsureTable(table.clone()));
        if let Some(e) = self.take_failure(&mut inner) {
            return Err(e);
        }
        if !inner.ensured_tables.contains(table) {
            inner.ensured_tables.push(table.clone());
        }
        Ok(())
    }

    async fn load_table(
        &self,
        table: &TableKey,
        staged_files: &[String],
        _columns: &[String],
        _primary_key: &[String],
    ) -> BridgeResult<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(Call::LoadTable { table: table.clone(), staged_files: staged_files.to_vec() });
        if let Some(e) = self.take_failure(&mut inner) {
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ErrorCode;
    use crate::ids::{BranchKey, ProjectId, SourceKey};

    fn sink() -> SinkKey {
        SinkKey {
            source: SourceKey {
                branch: BranchKey { project_id: ProjectId::from("p"), branch_id: "b".into() },
                source_id: "s".into(),
            },
            sink_id: "k".into(),
        }
    }

    #[tokio::test]
    async fn records_calls_in_order() {
        let bridge = MockBridge::new();
        bridge.create_file_resource(&sink()).await.unwrap();
        bridge.upload_slice("tok", vec![1, 2, 3]).await.unwrap();
        assert_eq!(bridge.calls().len(), 2);
    }

    #[tokio::test]
    async fn queued_failure_surfaces_once() {
        let bridge = MockBridge::new();
        bridge.fail_next(BridgeError::new(ErrorCode::CREDENTIALS_EXPIRED, "expired"));
        let err = bridge.create_file_resource(&sink()).await.unwrap_err();
        assert!(err.code.is_credentials_expired());

        bridge.create_file_resource(&sink()).await.unwrap();
    }
}
