//! Command descriptors
//!
//! A descriptor is plain data: the registry owns the durable copy and
//! builders edit clones of it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use tickscript_core::ScriptHandle;
use tickscript_data::DataValue;

use crate::error::Result;

/// Who is running a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSource {
    pub name: String,
    pub permissions: BTreeSet<String>,
    /// The console passes every permission check
    pub console: bool,
}

impl CommandSource {
    pub fn console() -> Self {
        Self {
            name: "console".into(),
            permissions: BTreeSet::new(),
            console: true,
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            permissions: BTreeSet::new(),
            console: false,
        }
    }

    pub fn with_permission(mut self, node: impl Into<String>) -> Self {
        self.permissions.insert(node.into());
        self
    }

    /// Check a permission node
    ///
    /// `*` grants everything; `admin.*` grants `admin.reload` and deeper nodes.
    pub fn has_permission(&self, node: &str) -> bool {
        if self.console || self.permissions.contains(node) || self.permissions.contains("*") {
            return true;
        }

        self.permissions.iter().any(|granted| {
            granted
                .strip_suffix(".*")
                .and_then(|prefix| node.strip_prefix(prefix))
                .map_or(false, |rest| rest.starts_with('.'))
        })
    }
}

/// Access rule for a command
#[derive(Clone)]
pub enum Permission {
    /// A permission node the source must hold
    Node(String),
    /// Arbitrary check against the source
    Predicate(Arc<dyn Fn(&CommandSource) -> bool + Send + Sync>),
}

impl Permission {
    pub fn predicate<F>(check: F) -> Self
    where
        F: Fn(&CommandSource) -> bool + Send + Sync + 'static,
    {
        Permission::Predicate(Arc::new(check))
    }

    pub fn allows(&self, source: &CommandSource) -> bool {
        match self {
            Permission::Node(node) => source.has_permission(node),
            Permission::Predicate(check) => check(source),
        }
    }
}

impl fmt::Debug for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Node(node) => f.debug_tuple("Node").field(node).finish(),
            Permission::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl From<&str> for Permission {
    fn from(node: &str) -> Self {
        Permission::Node(node.into())
    }
}

impl From<String> for Permission {
    fn from(node: String) -> Self {
        Permission::Node(node)
    }
}

/// How an argument token is parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentType {
    /// A single token
    Word,
    /// Every remaining token, joined with spaces
    Text,
    Integer,
    Float,
    Boolean,
}

impl ArgumentType {
    pub fn expected(&self) -> &'static str {
        match self {
            ArgumentType::Word => "word",
            ArgumentType::Text => "text",
            ArgumentType::Integer => "integer",
            ArgumentType::Float => "number",
            ArgumentType::Boolean => "boolean",
        }
    }

    /// Parse one token, `None` if it does not fit the type
    pub fn parse(&self, token: &str) -> Option<DataValue> {
        match self {
            ArgumentType::Word | ArgumentType::Text => Some(DataValue::from(token)),
            ArgumentType::Integer => token.parse::<i64>().ok().map(DataValue::Int),
            ArgumentType::Float => token
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .map(DataValue::Float),
            ArgumentType::Boolean => match token.to_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Some(DataValue::Bool(true)),
                "false" | "no" | "off" | "0" => Some(DataValue::Bool(false)),
                _ => None,
            },
        }
    }
}

/// One declared argument
#[derive(Debug, Clone, PartialEq)]
pub struct ArgumentSpec {
    pub name: String,
    pub ty: ArgumentType,
    pub optional: bool,
    /// Used when an optional argument is omitted
    pub default: Option<DataValue>,
}

impl ArgumentSpec {
    pub fn required(name: impl Into<String>, ty: ArgumentType) -> Self {
        Self {
            name: name.into(),
            ty,
            optional: false,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, ty: ArgumentType) -> Self {
        Self {
            name: name.into(),
            ty,
            optional: true,
            default: None,
        }
    }

    pub fn with_default(mut self, value: impl Into<DataValue>) -> Self {
        self.optional = true;
        self.default = Some(value.into());
        self
    }
}

/// What a native executor sees
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub source: CommandSource,
    /// Space-separated path of the command that matched, e.g. `admin reload`
    pub command: String,
    pub arguments: BTreeMap<String, DataValue>,
    /// Argument tokens as typed, after the command path
    pub raw: Vec<String>,
    /// Generation of the execution context the registry was refreshed against
    pub generation: u64,
}

impl CommandContext {
    pub fn argument(&self, name: &str) -> Option<&DataValue> {
        self.arguments.get(name)
    }
}

pub type NativeExecutor = Arc<dyn Fn(&CommandContext) -> Result<DataValue> + Send + Sync>;

/// Candidate completions for an argument, given the partial input
pub type SuggestionProvider = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;

#[derive(Clone)]
pub enum Executor {
    Native(NativeExecutor),
    /// A `Utility` script run with the caller and argv tokens
    Script(ScriptHandle),
}

impl Executor {
    pub fn native<F>(run: F) -> Self
    where
        F: Fn(&CommandContext) -> Result<DataValue> + Send + Sync + 'static,
    {
        Executor::Native(Arc::new(run))
    }

    pub fn script(handle: ScriptHandle) -> Self {
        Executor::Script(handle)
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Executor::Native(_) => f.write_str("Native(..)"),
            Executor::Script(handle) => f.debug_tuple("Script").field(&handle.name).finish(),
        }
    }
}

/// A command and its subcommands
#[derive(Clone, Default)]
pub struct CommandDescriptor {
    pub name: String,
    pub description: String,
    pub permission: Option<Permission>,
    pub arguments: Vec<ArgumentSpec>,
    pub executor: Option<Executor>,
    pub subcommands: BTreeMap<String, CommandDescriptor>,
    pub suggestions: BTreeMap<String, SuggestionProvider>,
}

impl CommandDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn argument(&self, name: &str) -> Option<&ArgumentSpec> {
        self.arguments.iter().find(|arg| arg.name == name)
    }

    /// Walk to a nested subcommand
    pub fn descend(&self, path: &[String]) -> Option<&CommandDescriptor> {
        path.iter()
            .try_fold(self, |node, name| node.subcommands.get(name))
    }

    /// Walk to a nested subcommand, creating missing levels
    pub(crate) fn descend_mut(&mut self, path: &[String]) -> &mut CommandDescriptor {
        path.iter().fold(self, |node, name| {
            node.subcommands
                .entry(name.clone())
                .or_insert_with(|| CommandDescriptor::new(name.clone()))
        })
    }

    /// Usage line, e.g. `give <player> <count> [reason]`
    pub fn usage(&self) -> String {
        let mut usage = self.name.clone();
        for arg in &self.arguments {
            if arg.optional {
                usage.push_str(&format!(" [{}]", arg.name));
            } else {
                usage.push_str(&format!(" <{}>", arg.name));
            }
        }
        if !self.subcommands.is_empty() {
            let names: Vec<&str> = self.subcommands.keys().map(String::as_str).collect();
            usage.push_str(&format!(" {{{}}}", names.join("|")));
        }
        usage
    }
}

impl fmt::Debug for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDescriptor")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("permission", &self.permission)
            .field("arguments", &self.arguments)
            .field("executor", &self.executor)
            .field("subcommands", &self.subcommands)
            .field("suggestions", &self.suggestions.keys().collect::<Vec<_>>())
            .finish()
    }
}
