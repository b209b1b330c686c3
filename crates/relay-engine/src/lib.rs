//! Crash-resilient pipeline execution engine.
//!
//! Worker processes coordinate through files under a state directory instead
//! of shared memory: a DOT pipeline graph mutated only by the
//! [`TransitionEngine`], signal files consumed exactly once, an identity
//! registry, per-identity hooks for crash resumption, and a strictly serial
//! [`MergeQueue`].

pub mod audit;
pub mod checkpoint;
pub mod config;
pub mod fsio;
pub mod graph;
pub mod guard;
pub mod hook;
pub mod identity;
pub mod integrator;
pub mod lock;
pub mod merge_queue;
pub mod readiness;
pub mod retry;
pub mod signal;
pub mod transition;
pub mod validation;

pub use audit::{AuditLog, AuditRecord};
pub use checkpoint::{latest_checkpoint, list_checkpoints, save_checkpoint};
pub use config::{RelayConfig, StateLayout};
pub use graph::{
    EdgeCondition, Handler, NodeKind, NodeStatus, PipelineEdge, PipelineGraph, PipelineNode,
};
pub use hook::{build_resumption_brief, Hook, HookManager, Phase};
pub use identity::{is_process_alive, Identity, IdentityMeta, IdentityRegistry, IdentityStatus};
pub use integrator::{GitIntegrator, Integrator, RebaseOutcome, TestOutcome};
pub use merge_queue::{ArchivedEntry, EntryStatus, MergeOutcome, MergeQueue, MergeQueueEntry};
pub use readiness::{dispatchable, summarize, PipelineSummary};
pub use retry::{BackoffPolicy, LockPolicy};
pub use signal::{await_signal, emit, AwaitOutcome, Signal, SignalFilter, SignalType};
pub use transition::{TransitionEngine, TransitionRequest};
pub use validation::{validate, validate_or_raise, Diagnostic, Severity, ValidationReport};

/// Current UTC time as RFC 3339 with microseconds, so that timestamps compare
/// lexically.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
