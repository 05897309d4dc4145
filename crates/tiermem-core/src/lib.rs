//! Tiered tagged memory for an LLM agent.
//!
//! Values live in one of three layers (working, disk, archived), each backed
//! by a flat arena of `<key:NAME>` framed entries, and are described by a
//! metadata directory carrying importance and recency. On top sit a ranked
//! query engine, paging policy driven by agent state or LLM directives, and
//! JSON persistence with timestamped backups.

pub mod arena;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod directory;
pub mod error;
pub mod memory;
pub mod paging;
pub mod persist;
pub mod query;
pub mod shared;
pub mod state;
pub mod stats;
pub mod telemetry;

pub use arena::{Arena, EntrySpan};
pub use buffer::{Buffer, MAX_BUFFER_CAPACITY};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::MemoryConfig;
pub use directory::{
    validate_key_name, ContextKey, KeyDirectory, Layer, ListOrder, MAX_IMPORTANCE,
    MAX_KEY_NAME_LEN,
};
pub use error::{MemoryError, MemoryResult};
pub use memory::TaggedMemory;
pub use paging::{
    analyze_context, content_similarity, evaluate_importance, identify_keys, parse_directives,
    BudgetReport, Compressor, ContextWindowInfo, Directive, DirectiveReport, DiskCompactReport,
    StorageReport, VerifyReport, WhitespaceCollapse,
};
pub use persist::{BackupReport, RecoveryReport, ValidationReport};
pub use query::{QueryCriteria, QueryResult};
pub use shared::SharedMemory;
pub use state::AgentState;
pub use stats::MemoryStats;
pub use telemetry::init_tracing;
