//! Core error types for TickScript

#[derive(thiserror::Error, Debug)]
pub enum HostError {
    #[error("Script error: {0}")]
    Script(String),

    #[error("Module error: {0}")]
    Module(String),

    #[error("Command error: {0}")]
    Command(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, HostError>;
