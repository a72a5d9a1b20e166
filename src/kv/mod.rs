//! Coordination store access layer: the `KvStore` trait, its mock and
//! (optionally) real etcd implementations, typed prefixes, a small
//! transaction builder, and the shared retry policy every mutation
//! routes through.

pub mod mock;
pub mod prefix;
pub mod retry;
pub mod store;
pub mod txn;

#[cfg(feature = "etcd")]
pub mod etcd;

pub use prefix::{PrefixT, TypedEvent, TypedKv, TypedWatchMessage};
pub use store::{
    Compare, EventKind, KeyValue, KvStore, LeaseId, RangeOptions, RangePage, Session, SortOrder,
    TxnOp, TxnOpResponse, TxnRequest, TxnResponse, WatchEvent, WatchMessage, WatchOptions, WatchStream,
};
pub use txn::Txn;
