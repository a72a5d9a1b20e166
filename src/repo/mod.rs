//! Definition & state repository: one typed repository per entity
//! kind, each compiling its mutations to a single merged transaction
//! and exposing watchable prefixes for the kinds the lifecycle engine
//! drives.

pub mod branch;
pub mod file;
pub mod model;
pub mod schema;
pub mod sink;
pub mod slice;
pub mod source;
pub mod token;
pub mod volume;

pub use branch::BranchRepository;
pub use file::FileRepository;
pub use sink::SinkRepository;
pub use slice::SliceRepository;
pub use source::SourceRepository;
pub use token::TokenRepository;
pub use volume::VolumeRepository;
