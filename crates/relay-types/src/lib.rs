//! Shared error taxonomy for the Relay pipeline engine.
//!
//! Every fallible operation in the workspace returns [`Result`], whose error
//! side is [`RelayError`]. The variants split into three groups:
//! - graph input problems (`ParseError`, `UnresolvedReference`, `ValidationError`)
//! - handled domain outcomes (`IllegalTransition`, `RetriesExhausted`, guard
//!   rails, registry and queue lookups, lock contention)
//! - unexpected failures (`Io`, `Json`, `Git`, `Other`)

/// Unified error type for all Relay subsystems.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    // === Graph input ===
    #[error("DOT parse error at line {line}, col {col}: {message}")]
    ParseError {
        line: usize,
        col: usize,
        message: String,
        source_snippet: Option<String>,
    },

    #[error("Unresolved reference '{reference}': {message}")]
    UnresolvedReference { reference: String, message: String },

    #[error("Pipeline validation failed: {0}")]
    ValidationError(String),

    // === State machine ===
    #[error("Node '{node}' not found in graph")]
    NodeNotFound { node: String },

    #[error("Illegal transition for node '{node}': {from} -> {to}")]
    IllegalTransition {
        node: String,
        from: String,
        to: String,
    },

    #[error("Guard rail '{rule}' rejected transition of node '{node}': {message}")]
    GuardRail {
        node: String,
        rule: String,
        message: String,
    },

    #[error("Max retries exhausted for node '{node}' after {attempts} attempts")]
    RetriesExhausted { node: String, attempts: u32 },

    #[error("Could not lock {path} after {attempts} attempts")]
    LockContention { path: String, attempts: usize },

    // === Registry ===
    #[error("Invalid id '{0}': ids may not contain path separators or '..'")]
    InvalidId(String),

    #[error("Identity '{0}' not found")]
    IdentityNotFound(String),

    #[error("Identity {role}/{name} is already active as '{id}'")]
    IdentityActive {
        role: String,
        name: String,
        id: String,
    },

    #[error("No hook recorded for identity '{0}'")]
    HookNotFound(String),

    #[error("Hook for identity '{0}' already exists")]
    HookExists(String),

    #[error("Hook for identity '{identity}' was already consumed by '{consumed_by}'")]
    HookConsumed {
        identity: String,
        consumed_by: String,
    },

    // === Merge queue ===
    #[error("No merge queue entry for branch '{0}'")]
    QueueEntryNotFound(String),

    #[error("Branch '{0}' is already in the merge queue")]
    DuplicateQueueEntry(String),

    #[error("git {command} failed: {message}")]
    Git { command: String, message: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl RelayError {
    /// Returns `true` if the error is transient and the caller may retry the
    /// whole operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelayError::LockContention { .. })
    }

    /// Returns `true` for errors that describe a handled domain outcome rather
    /// than an unexpected failure of the engine or its environment.
    pub fn is_domain(&self) -> bool {
        !matches!(
            self,
            RelayError::Io(_) | RelayError::Json(_) | RelayError::Git { .. } | RelayError::Other(_)
        )
    }

    /// Process exit code for the CLI: `1` for domain errors, `2` otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.is_domain() {
            1
        } else {
            2
        }
    }

    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::ParseError { .. } => "parse_error",
            RelayError::UnresolvedReference { .. } => "parse_error",
            RelayError::ValidationError(_) => "validation_error",
            RelayError::NodeNotFound { .. } => "node_not_found",
            RelayError::IllegalTransition { .. } => "illegal_transition",
            RelayError::GuardRail { .. } => "guard_rail",
            RelayError::RetriesExhausted { .. } => "retries_exhausted",
            RelayError::LockContention { .. } => "lock_contention",
            RelayError::InvalidId(_) => "invalid_id",
            RelayError::IdentityNotFound(_) => "identity_not_found",
            RelayError::IdentityActive { .. } => "identity_active",
            RelayError::HookNotFound(_) => "hook_not_found",
            RelayError::HookExists(_) => "hook_exists",
            RelayError::HookConsumed { .. } => "hook_consumed",
            RelayError::QueueEntryNotFound(_) => "queue_entry_not_found",
            RelayError::DuplicateQueueEntry(_) => "duplicate_queue_entry",
            RelayError::Git { .. } => "git",
            RelayError::Io(_) => "io",
            RelayError::Json(_) => "json",
            RelayError::Other(_) => "other",
        }
    }
}

/// A convenience alias for `Result<T, RelayError>`.
pub type Result<T> = std::result::Result<T, RelayError>;
