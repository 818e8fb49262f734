//! Error types for the LVM CSI plugin
//!
//! Provides a single structured error type for every component, the
//! protocol status taxonomy those errors map onto, and a separate channel
//! for non-fatal diagnostics raised by best-effort side actions.

use std::fmt;
use thiserror::Error;
use tracing::warn;

/// Unified error type for the plugin
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Request Validation Errors
    // =========================================================================
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported datapath: {0}")]
    UnsupportedDatapath(String),

    #[error("Invalid volume layout: {0}")]
    InvalidLayout(String),

    #[error("Unexpected parameters: {0:?}")]
    UnexpectedParameters(Vec<String>),

    #[error("Pagination is not supported (starting token {0:?})")]
    PaginationUnsupported(String),

    // =========================================================================
    // Lookup Errors
    // =========================================================================
    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    #[error("Volume {name} already exists and does not satisfy the request")]
    VolumeAlreadyExists { name: String },

    // =========================================================================
    // Capacity Errors
    // =========================================================================
    #[error("Insufficient capacity: requested {requested} bytes, available {available} bytes")]
    InsufficientCapacity { requested: u64, available: u64 },

    #[error("Volume capacity must be a multiple of {}MiB", extent_size >> 20)]
    ExtentSizeMismatch { extent_size: u64 },

    #[error("The volume group does not have enough physical devices for the requested RAID layout")]
    TooFewDisks,

    // =========================================================================
    // Mount State Errors
    // =========================================================================
    #[error("Requested filesystem {requested} does not match existing filesystem {existing}")]
    MismatchedFilesystem { requested: String, existing: String },

    #[error("Unexpected device already mounted at {0}")]
    TargetOccupied(String),

    #[error("Target path {0} is already mounted read-only")]
    TargetReadOnly(String),

    #[error("Target path {0} is already mounted read-write")]
    TargetReadWrite(String),

    #[error("Mount failed at {path}: {reason}")]
    MountFailed { path: String, reason: String },

    #[error("Unmount failed at {path}: {reason}")]
    UnmountFailed { path: String, reason: String },

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Mount table parse error: {0}")]
    MountTableParse(String),

    // =========================================================================
    // Admission Errors
    // =========================================================================
    #[error("Request cancelled before it was admitted")]
    Cancelled,

    #[error("Request deadline exceeded before it was admitted")]
    DeadlineExceeded,

    #[error("Too many pending requests, retry later")]
    TooManyRequests,

    #[error("{0} is not implemented")]
    Unimplemented(String),

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    #[error("Volume group error: {0}")]
    VolumeGroup(String),

    #[error("Transport broker error: {0}")]
    Broker(String),

    #[error("Command {command} failed: {reason}")]
    Command { command: String, reason: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("System call failed: {0}")]
    Errno(#[from] nix::errno::Errno),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Protocol status category reported to the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    OutOfRange,
    FailedPrecondition,
    Internal,
    Unimplemented,
    Cancelled,
    DeadlineExceeded,
    ResourceExhausted,
    Aborted,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::InvalidArgument => "invalid_argument",
            Code::NotFound => "not_found",
            Code::AlreadyExists => "already_exists",
            Code::OutOfRange => "out_of_range",
            Code::FailedPrecondition => "failed_precondition",
            Code::Internal => "internal",
            Code::Unimplemented => "unimplemented",
            Code::Cancelled => "cancelled",
            Code::DeadlineExceeded => "deadline_exceeded",
            Code::ResourceExhausted => "resource_exhausted",
            Code::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Status category for this error
    pub fn code(&self) -> Code {
        match self {
            Error::InvalidArgument(_)
            | Error::UnsupportedDatapath(_)
            | Error::InvalidLayout(_)
            | Error::UnexpectedParameters(_)
            | Error::MismatchedFilesystem { .. }
            | Error::TargetOccupied(_)
            | Error::TargetReadOnly(_)
            | Error::TargetReadWrite(_) => Code::InvalidArgument,

            Error::VolumeNotFound(_) => Code::NotFound,

            Error::VolumeAlreadyExists { .. } => Code::AlreadyExists,

            Error::InsufficientCapacity { .. }
            | Error::ExtentSizeMismatch { .. }
            | Error::TooFewDisks => Code::OutOfRange,

            Error::MountFailed { .. }
            | Error::UnmountFailed { .. }
            | Error::FailedPrecondition(_) => Code::FailedPrecondition,

            Error::PaginationUnsupported(_) => Code::Aborted,

            Error::Cancelled => Code::Cancelled,
            Error::DeadlineExceeded => Code::DeadlineExceeded,
            Error::TooManyRequests => Code::ResourceExhausted,

            Error::Unimplemented(_) => Code::Unimplemented,

            Error::Configuration(_) => Code::FailedPrecondition,

            Error::MountTableParse(_)
            | Error::VolumeGroup(_)
            | Error::Broker(_)
            | Error::Command { .. }
            | Error::Internal(_)
            | Error::Http(_)
            | Error::JsonParse(_)
            | Error::Errno(_)
            | Error::Io(_) => Code::Internal,
        }
    }

    /// Check if the orchestrator may retry the call unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code(),
            Code::Cancelled
                | Code::DeadlineExceeded
                | Code::ResourceExhausted
                | Code::Aborted
                | Code::Internal
        )
    }

    /// Create an [`Error::Internal`] from anything displayable
    pub fn internal<E: fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Create an [`Error::Broker`] from anything displayable
    pub fn broker<E: fmt::Display>(e: E) -> Self {
        Self::Broker(e.to_string())
    }

    /// Create an [`Error::VolumeGroup`] from anything displayable
    pub fn volume_group<E: fmt::Display>(e: E) -> Self {
        Self::VolumeGroup(e.to_string())
    }
}

/// Result type alias for the plugin
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Non-fatal Diagnostics
// =============================================================================

/// A best-effort side action that failed without failing the call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Short name of the side action, e.g. `"qos-tag"`
    pub action: &'static str,
    /// Human-readable failure detail
    pub detail: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.action, self.detail)
    }
}

/// Diagnostics collected while serving one call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a swallowed failure and log it
    pub fn record(&mut self, action: &'static str, detail: impl fmt::Display) {
        let detail = detail.to_string();
        warn!(action, %detail, "best-effort action failed");
        self.entries.push(Diagnostic { action, detail });
    }

    /// Merge another set of diagnostics into this one
    pub fn extend(&mut self, other: Diagnostics) {
        self.entries.extend(other.entries);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }

    /// Check whether an action reported a failure
    pub fn contains(&self, action: &str) -> bool {
        self.entries.iter().any(|d| d.action == action)
    }
}
