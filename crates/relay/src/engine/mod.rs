//! Sync-run orchestration engine
//!
//! - [`lifecycle`]: run state machine and post-commit notifications
//! - [`executor`]: chunked extract-and-write pipeline
//! - [`tracker`]: per-record fingerprints
//! - [`discard`]: soft-delete cascade from syncs to runs
//! - [`orchestrator`]: the entry point tying them together

pub mod discard;
pub mod executor;
pub mod lifecycle;
pub mod notify;
pub mod orchestrator;
pub mod tracker;

pub use discard::DiscardPropagator;
pub use executor::{Executor, RunOutcome, RunPlan, RunSummary, max_cursor};
pub use lifecycle::{InvalidTransition, Lifecycle, RunEvent, next_status};
pub use notify::{LogNotifier, MemoryNotifier, NoticeKind, Notifier, RunNotice, select_notice};
pub use orchestrator::Orchestrator;
pub use tracker::{RecordTracker, fingerprint, primary_key_of};
