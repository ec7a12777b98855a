use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CdmError {
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        suggestion: String
    },

    #[error("Backing store unavailable: {message}")]
    StoreUnavailable {
        message: String,
        suggestion: String
    },

    #[error("Write to {table} failed: {message}")]
    WriteFailed {
        table: String,
        message: String
    },

    #[error("Parameter '{id}' holds a non-integer value '{value}'")]
    InvalidParameter {
        id: String,
        value: String
    },

    #[error("Failed to launch job: {message}")]
    LaunchFailed {
        message: String,
        suggestion: String
    },

    #[error("Job supervision failed: {message}")]
    Supervision {
        message: String
    },

    #[error("Job still stalled after {restarts} restarts")]
    RestartsExhausted {
        restarts: u32
    },

    #[error("Command template error: {message}")]
    Template {
        message: String,
        placeholders: Vec<String>
    },
}

impl CdmError {
    /// Create a configuration error with suggestion
    pub fn config(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Config { message: message.into(), suggestion: suggestion.into() }
    }

    /// Create a missing environment error naming every required variable
    pub fn missing_env(missing: &[&str], required: &[&str]) -> Self {
        let message = format!(
            "Missing required environment variables: {}",
            missing.join(", ")
        );
        let listing = required
            .iter()
            .map(|name| format!("- {}", name))
            .collect::<Vec<_>>()
            .join("\n");
        let suggestion = format!("Please ensure the following are set:\n{}", listing);
        Self::Config { message, suggestion }
    }

    /// Create a missing bundle error
    pub fn bundle_not_found(path: PathBuf) -> Self {
        let message = format!("Connection bundle not found at: {}", path.display());
        let suggestion = "Point CDM_BUNDLE_PATH at an existing bundle, or run 'cdm-pacer init' first".to_string();
        Self::Config { message, suggestion }
    }

    /// Create a store unavailable error
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        let message = message.into();
        let suggestion = "Check store reachability and credentials, then re-run; the cursor was not moved".to_string();
        Self::StoreUnavailable { message, suggestion }
    }

    /// Create a failed write error for the given table
    pub fn write_failed(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::WriteFailed { table: table.into(), message: message.into() }
    }

    /// Create a launch failure error
    pub fn launch_failed(message: impl Into<String>) -> Self {
        let message = message.into();
        let suggestion = "Verify the job command template and that its executable is on PATH".to_string();
        Self::LaunchFailed { message, suggestion }
    }

    /// Create a template error listing unresolved placeholders
    pub fn template(message: impl Into<String>, placeholders: Vec<String>) -> Self {
        Self::Template { message: message.into(), placeholders }
    }

    /// Get recovery suggestions for this error
    pub fn suggestions(&self) -> Vec<String> {
        match self {
            Self::Config { suggestion, .. } => vec![suggestion.clone()],
            Self::StoreUnavailable { suggestion, .. } => vec![suggestion.clone()],
            Self::WriteFailed { table, .. } => {
                vec![format!("Inspect {} before resuming; the run stopped to avoid lost or repeated progress", table)]
            }
            Self::InvalidParameter { id, .. } => {
                vec![format!("Fix the '{}' row in cdm_run_parameters to hold an integer", id)]
            }
            Self::LaunchFailed { suggestion, .. } => vec![suggestion.clone()],
            Self::Supervision { .. } => vec![],
            Self::RestartsExhausted { .. } => {
                vec!["Raise max_restarts or investigate why the job stalls".to_string()]
            }
            Self::Template { placeholders, .. } => {
                vec![format!("Unresolved placeholders: {}", placeholders.join(", "))]
            }
        }
    }
}

/// Result type for orchestrator operations
pub type CdmResult<T> = std::result::Result<T, CdmError>;
