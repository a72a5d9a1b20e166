//! A small builder over `TxnRequest` that lets independent guards and
//! mutations be composed with `.then_put`/`.then_delete` before a
//! single round trip to the store. `FileRepository` and
//! `SliceRepository` build every mutation through this rather than a
//! literal `TxnRequest`, appending whatever an in-flight retry
//! discovers (e.g. a predecessor file to close) onto the same `Txn`.
//!
//! This does not replicate a fully general transaction monad with
//! per-branch partial-else routing: every mutation merges its `If`s,
//! `Then`s, and `Else`s into one flat request, which is all any call
//! site here needs (the `Else` branch only ever runs because the whole
//! commit failed, never because one specific sub-guard failed).

use super::store::{Compare, KvStore, LeaseId, TxnOp, TxnRequest, TxnResponse};
use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct Txn {
    ifs: Vec<Compare>,
    then_ops: Vec<TxnOp>,
    else_ops: Vec<TxnOp>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn if_cond(mut self, c: Compare) -> Self {
        self.ifs.push(c);
        self
    }

    pub fn then_put(mut self, key: impl Into<String>, value: Vec<u8>, lease: Option<LeaseId>) -> Self {
        self.then_ops.push(TxnOp::Put { key: key.into(), value, lease });
        self
    }

    pub fn then_delete(mut self, key: impl Into<String>) -> Self {
        self.then_ops.push(TxnOp::Delete { key: key.into() });
        self
    }

    pub fn else_put(mut self, key: impl Into<String>, value: Vec<u8>, lease: Option<LeaseId>) -> Self {
        self.else_ops.push(TxnOp::Put { key: key.into(), value, lease });
        self
    }

    pub fn else_delete(mut self, key: impl Into<String>) -> Self {
        self.else_ops.push(TxnOp::Delete { key: key.into() });
        self
    }

    /// Merge another transaction's guards and mutations into this one.
    pub fn and(mut self, other: Txn) -> Self {
        self.ifs.extend(other.ifs);
        self.then_ops.extend(other.then_ops);
        self.else_ops.extend(other.else_ops);
        self
    }

    pub fn into_request(self) -> TxnRequest {
        TxnRequest { ifs: self.ifs, then: self.then_ops, or_else: self.else_ops }
    }

    pub async fn commit(self, store: &dyn KvStore) -> Result<TxnResponse> {
        store.txn(self.into_request()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::mock::MockStore;
    use crate::kv::store::KvStore as _;

    #[tokio::test]
    async fn and_merges_guards_from_both_sides() {
        let store = MockStore::new();
        store.put("a", b"1".to_vec(), None).await.unwrap();

        let txn = Txn::new()
            .if_cond(Compare::KeyExists("a".into()))
            .and(Txn::new().if_cond(Compare::KeyMissing("b".into())).then_put("b", b"2".to_vec(), None));

        let resp = txn.commit(store.as_ref()).await.unwrap();
        assert!(resp.succeeded);
        assert_eq!(store.get("b").await.unwrap().unwrap().value, b"2");
    }

    #[tokio::test]
    async fn failed_guard_runs_merged_else_branch() {
        let store = MockStore::new();
        let txn = Txn::new()
            .if_cond(Compare::KeyExists("missing".into()))
            .then_put("a", b"1".to_vec(), None)
            .and(Txn::new().else_put("fallback", b"yes".to_vec(), None));

        let resp = txn.commit(store.as_ref()).await.unwrap();
        assert!(!resp.succeeded);
        assert_eq!(store.get("fallback").await.unwrap().unwrap().value, b"yes");
        assert!(store.get("a").await.unwrap().is_none());
    }
}
