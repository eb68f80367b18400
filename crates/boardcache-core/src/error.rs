//! Error types for boardcache-core
//!
//! Every terminal error from `ensure` names the board and tier, and the
//! acquisition variants carry the captured tool output, so an operator can tell
//! rejected credentials apart from a broken tool or environment.

use crate::acquisition::Diagnostic;
use crate::capability::CapabilityTier;
use std::path::PathBuf;
use thiserror::Error;

/// Core error type for boardcache operations
#[derive(Error, Debug)]
pub enum CoreError {
    // ===================
    // Input Errors
    // ===================
    #[error("Invalid capability tier: {value:?} (expected one of layouts, catalog, geometry, logbook)")]
    InvalidTier { value: String },

    #[error("Invalid board identifier {board:?}: {reason}")]
    InvalidBoard { board: String, reason: String },

    // ===================
    // Orchestrator Errors
    // ===================
    #[error("Board '{board}' requires credentials for tier {tier}: missing {missing}")]
    Precondition {
        board: String,
        tier: CapabilityTier,
        missing: &'static str,
    },

    #[error("Acquisition failed for board '{board}' (tier {tier}): {reason}")]
    Acquisition {
        board: String,
        tier: CapabilityTier,
        reason: String,
        diagnostic: Diagnostic,
    },

    #[error(
        "Acquisition produced incapable database for board '{board}' (tier {tier}): missing relations [{}]",
        .missing.join(", ")
    )]
    IncapableResult {
        board: String,
        tier: CapabilityTier,
        missing: Vec<String>,
        diagnostic: Diagnostic,
    },

    #[error("Build for board '{board}' (tier {tier}) was cancelled")]
    Cancelled { board: String, tier: CapabilityTier },

    // ===================
    // Store Errors
    // ===================
    #[error("Local cache I/O failed ({operation}) at {path}")]
    StoreIo {
        path: PathBuf,
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    // ===================
    // Config Errors
    // ===================
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl CoreError {
    pub(crate) fn store_io(
        path: impl Into<PathBuf>,
        operation: &'static str,
        source: std::io::Error,
    ) -> Self {
        CoreError::StoreIo {
            path: path.into(),
            operation,
            source,
        }
    }

    /// Stable machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidTier { .. } => "invalid_tier",
            CoreError::InvalidBoard { .. } => "invalid_board",
            CoreError::Precondition { .. } => "precondition",
            CoreError::Acquisition { .. } => "acquisition_failure",
            CoreError::IncapableResult { .. } => "incapable_result",
            CoreError::Cancelled { .. } => "cancelled",
            CoreError::StoreIo { .. } => "store_io",
            CoreError::InvalidConfig { .. } => "invalid_config",
        }
    }

    /// Whether repeating the same call may succeed without new input
    ///
    /// `IncapableResult` is excluded: it only clears with different credentials.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Acquisition { .. } | CoreError::Cancelled { .. }
        )
    }

    /// Captured acquisition tool output, when the error has one
    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        match self {
            CoreError::Acquisition { diagnostic, .. }
            | CoreError::IncapableResult { diagnostic, .. } => Some(diagnostic),
            _ => None,
        }
    }

    /// Actionable hint for the operator
    pub fn suggestion(&self) -> Option<String> {
        match self {
            CoreError::InvalidTier { .. } => {
                Some("Use one of: layouts, catalog, geometry, logbook".to_string())
            }
            CoreError::Precondition { board, .. } => Some(format!(
                "Supply both username and password for '{}'",
                board
            )),
            CoreError::Acquisition { diagnostic, .. } => Some(if diagnostic.exit_code.is_none() {
                "The acquisition tool did not run to completion: check that boardlib is installed \
                 for the configured interpreter and that the origin API is reachable"
                    .to_string()
            } else {
                "The acquisition tool exited with an error: inspect its stderr in the diagnostic"
                    .to_string()
            }),
            CoreError::IncapableResult { board, .. } => Some(format!(
                "The build succeeded but is missing tables; the origin most likely rejected the \
                 credentials for '{}'. Retry with different credentials",
                board
            )),
            CoreError::StoreIo { path, .. } => Some(format!(
                "Check that the cache directory is writable: ls -ld {}",
                path.parent().unwrap_or(path).display()
            )),
            _ => None,
        }
    }
}
