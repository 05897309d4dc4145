//! Paging and lifecycle policy.
//!
//! Everything here is composed from [`TaggedMemory`](crate::TaggedMemory)
//! primitives. Moves always go through `relocate`, so bytes follow
//! metadata between arenas.

pub mod cleanup;
pub mod compress;
pub mod context_window;
pub mod directives;
pub mod disk;

pub use cleanup::{content_similarity, StorageReport};
pub use compress::{Compressor, WhitespaceCollapse};
pub use context_window::{context_priority, estimate_tokens, ContextWindowInfo};
pub use directives::{
    analyze_context, evaluate_importance, identify_keys, parse_directives, Directive,
    DirectiveReport,
};
pub use disk::{BudgetReport, DiskCompactReport, VerifyReport, DISK_IMPORTANCE};
