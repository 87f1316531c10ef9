//! Error types for the scripting crate

use tickscript_core::HostError;
use tickscript_data::DataValue;

/// Script-specific error types
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    /// Malformed source, detected before execution
    #[error("{message}")]
    Syntax {
        message: String,
        location: Option<String>,
    },

    /// Exception raised while the script ran
    #[error("{message}")]
    Runtime {
        message: String,
        location: Option<String>,
    },

    /// Unexpected failure in host glue
    #[error("Host error: {0}")]
    HostInternal(String),

    /// Script asked to stop. Not a failure.
    #[error("Script requested exit")]
    GracefulExit,

    /// A host result could not be turned into a script value
    #[error("Failed to convert host result: {0}")]
    BridgeConversion(String),

    /// Settlement arrived for a context that has since been reset
    #[error("Stale context: recorded generation {recorded}, live generation {current}")]
    StaleContext { recorded: u64, current: u64 },

    /// The context was torn down by a reset before it could be entered
    #[error("Execution context generation {0} has been retired")]
    Retired(u64),

    /// Import specifier could not be resolved or loaded
    #[error("Cannot resolve module '{specifier}': {message}")]
    ModuleResolution { specifier: String, message: String },

    /// Operation not supported on a virtual path
    #[error("Unsupported operation on virtual module {0}")]
    Unsupported(String),

    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Script cannot be run in its current state
    #[error("Script refused: {0}")]
    Refused(String),
}

impl ScriptError {
    /// Source location (`file:line`) when the engine reported one
    pub fn location(&self) -> Option<&str> {
        match self {
            ScriptError::Syntax { location, .. } | ScriptError::Runtime { location, .. } => {
                location.as_deref()
            }
            _ => None,
        }
    }
}

impl From<rquickjs::Error> for ScriptError {
    fn from(err: rquickjs::Error) -> Self {
        ScriptError::HostInternal(err.to_string())
    }
}

impl From<ScriptError> for HostError {
    fn from(err: ScriptError) -> Self {
        match err {
            ScriptError::ModuleResolution { .. } => HostError::Module(err.to_string()),
            ScriptError::Io(io) => HostError::Io(io),
            other => HostError::Script(other.to_string()),
        }
    }
}

/// Result type for scripting operations
pub type Result<T> = std::result::Result<T, ScriptError>;

/// Outcome of running a script, as surfaced to callers
///
/// `message` is safe to show to users. `cause` keeps the full error for
/// logging.
#[derive(Debug)]
pub enum ScriptResult {
    Success(DataValue),
    Error { message: String, cause: ScriptError },
}

impl ScriptResult {
    pub fn error(message: impl Into<String>, cause: ScriptError) -> Self {
        ScriptResult::Error {
            message: message.into(),
            cause,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ScriptResult::Success(_))
    }

    pub fn value(&self) -> Option<&DataValue> {
        match self {
            ScriptResult::Success(value) => Some(value),
            ScriptResult::Error { .. } => None,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            ScriptResult::Success(_) => None,
            ScriptResult::Error { message, .. } => Some(message),
        }
    }

    pub fn cause(&self) -> Option<&ScriptError> {
        match self {
            ScriptResult::Success(_) => None,
            ScriptResult::Error { cause, .. } => Some(cause),
        }
    }

    pub fn into_result(self) -> Result<DataValue> {
        match self {
            ScriptResult::Success(value) => Ok(value),
            ScriptResult::Error { cause, .. } => Err(cause),
        }
    }
}
