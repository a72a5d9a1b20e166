//! File/Slice lifecycle engine: the wall-clock scheduler, the local
//! slice writer pool, and the watcher that drives upload/import tasks
//! off the `level/local` and `level/staging` indices.

pub mod lifecycle;
pub mod scheduler;
pub mod writer;

pub use lifecycle::LifecycleWatcher;
pub use scheduler::Scheduler;
pub use writer::WriterPool;
