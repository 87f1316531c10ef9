//! Core type definitions

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Correlation ID for a bridged promise (64-bit unsigned)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(pub u64);

impl CorrelationId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for CorrelationId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Script category
///
/// The category decides which capability sets a script sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScriptCategory {
    /// One-time initialization scripts
    Bootstrap,
    /// Long-lived scripts that register event handlers
    Server,
    /// Command-invoked scripts, receive caller and argv
    Utility,
    /// Importable only, never evaluated directly
    Module,
}

impl ScriptCategory {
    pub const ALL: [ScriptCategory; 4] = [
        ScriptCategory::Bootstrap,
        ScriptCategory::Server,
        ScriptCategory::Utility,
        ScriptCategory::Module,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::Server => "server",
            Self::Utility => "utility",
            Self::Module => "module",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "bootstrap" => Some(Self::Bootstrap),
            "server" => Some(Self::Server),
            "utility" => Some(Self::Utility),
            "module" | "modules" => Some(Self::Module),
            _ => None,
        }
    }

    /// Whether scripts of this category may be evaluated directly
    pub fn is_executable(&self) -> bool {
        !matches!(self, Self::Module)
    }
}

/// Script status as reported by discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptStatus {
    Loaded,
    Error,
    Disabled,
}

/// A discovered script
///
/// Produced by discovery, consumed read-only by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptHandle {
    pub name: String,
    pub location: PathBuf,
    pub category: ScriptCategory,
    pub status: ScriptStatus,
    pub last_modified: SystemTime,
}

impl ScriptHandle {
    /// Create a loaded handle stamped with the current time
    pub fn new(name: impl Into<String>, location: impl Into<PathBuf>, category: ScriptCategory) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
            category,
            status: ScriptStatus::Loaded,
            last_modified: SystemTime::now(),
        }
    }

    pub fn with_status(mut self, status: ScriptStatus) -> Self {
        self.status = status;
        self
    }

    pub fn location(&self) -> &Path {
        &self.location
    }
}
