//! Command error types

use tickscript_core::HostError;
use tickscript_scripting::ScriptError;

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Required argument '{argument}' of '{command}' cannot follow optional argument '{optional}'")]
    RequiredAfterOptional {
        command: String,
        argument: String,
        optional: String,
    },

    #[error("Argument '{argument}' of '{command}' cannot follow greedy argument '{greedy}'")]
    ArgumentAfterGreedy {
        command: String,
        argument: String,
        greedy: String,
    },

    #[error("Duplicate argument '{argument}' in '{command}'")]
    DuplicateArgument { command: String, argument: String },

    #[error("Command '{0}' can only run utility scripts")]
    NotUtility(String),

    #[error("You do not have permission to use '{0}'")]
    PermissionDenied(String),

    #[error("Missing argument '{argument}' for '{command}'")]
    MissingArgument { command: String, argument: String },

    #[error("Invalid {expected} '{value}' for argument '{argument}'")]
    InvalidArgument {
        argument: String,
        value: String,
        expected: &'static str,
    },

    #[error("Too many arguments for '{0}'")]
    TooManyArguments(String),

    #[error("Command '{0}' has no executor")]
    NoExecutor(String),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Script(#[from] ScriptError),
}

impl From<CommandError> for HostError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Script(script) => script.into(),
            other => HostError::Command(other.to_string()),
        }
    }
}

/// Result type for command operations
pub type Result<T> = std::result::Result<T, CommandError>;
