// src/lib.rs

//! silorunner — ingestion buffer core
//!
//! Routes, slices, and batches incoming records into Files ready for a
//! warehouse load: a coordination-store-backed definition/state
//! repository, a cluster-wide task runner, and a File/Slice lifecycle
//! engine built on top of both.
//!
//! # Architecture
//!
//! - `kv`: the coordination store trait (`KvStore`), a typed-prefix
//!   layer, a transaction builder, and two backends (`mock`, `etcd`).
//! - `repo`: one repository per entity (File, Slice, Volume, Token,
//!   Branch, Source, Sink), each compiling its mutations to a single
//!   merged transaction.
//! - `tasks`: `TaskRunner`, the cluster-wide at-most-one task executor
//!   every background job in this crate is built on.
//! - `engine`: the scheduler, the local slice writer pool, and the
//!   watcher that turns state transitions into upload/import tasks.
//! - `bridge`: the warehouse-side trait boundary (`WarehouseBridge`)
//!   this crate calls into but does not implement.
//!
//! No binary ships from this crate — it exposes no command surface of
//! its own; a caller constructs an `EngineConfig`, wires the pieces
//! together, and drives them from its own process.

pub mod bridge;
pub mod clock;
pub mod config;
pub mod engine;
mod error;
pub mod ids;
pub mod kv;
pub mod repo;
pub mod tasks;

pub use clock::{Clock, MockClock, SystemClock};
pub use config::{BackoffPolicy, EngineConfig};
pub use engine::{LifecycleWatcher, Scheduler, WriterPool};
pub use error::{Error, Result};
pub use tasks::{TaskOutcome, TaskRunner};
