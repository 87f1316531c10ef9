//! Command dispatch and completion

use std::collections::BTreeMap;

use tickscript_data::DataValue;
use tickscript_scripting::{Bindings, Invocation, ScriptResult};

use crate::descriptor::{
    ArgumentSpec, ArgumentType, CommandContext, CommandDescriptor, CommandSource, Executor,
};
use crate::error::{CommandError, Result};
use crate::registry::CommandRegistry;

/// Split a command line into tokens
///
/// Double quotes group words and are removed; a backslash escapes the next
/// character. An unterminated quote runs to the end of the line.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quoted = false;
    let mut escape_next = false;

    for ch in line.chars() {
        if escape_next {
            current.push(ch);
            escape_next = false;
            continue;
        }

        match ch {
            '\\' => escape_next = true,
            '"' => {
                in_quotes = !in_quotes;
                quoted = true;
            }
            ' ' | '\t' if !in_quotes => {
                if !current.is_empty() || quoted {
                    tokens.push(std::mem::take(&mut current));
                    quoted = false;
                }
            }
            _ => current.push(ch),
        }
    }

    if escape_next {
        current.push('\\');
    }
    if !current.is_empty() || quoted {
        tokens.push(current);
    }

    tokens
}

/// Bind argument tokens to declared arguments
fn bind_arguments(
    command: &str,
    specs: &[ArgumentSpec],
    tokens: &[String],
) -> Result<BTreeMap<String, DataValue>> {
    let mut values = BTreeMap::new();
    let mut rest = tokens;

    for spec in specs {
        if rest.is_empty() {
            if !spec.optional {
                return Err(CommandError::MissingArgument {
                    command: command.to_string(),
                    argument: spec.name.clone(),
                });
            }
            if let Some(default) = &spec.default {
                values.insert(spec.name.clone(), default.clone());
            }
            continue;
        }

        let (raw, tail) = match spec.ty {
            ArgumentType::Text => (rest.join(" "), &rest[rest.len()..]),
            _ => (rest[0].clone(), &rest[1..]),
        };
        let value = spec.ty.parse(&raw).ok_or_else(|| CommandError::InvalidArgument {
            argument: spec.name.clone(),
            value: raw.clone(),
            expected: spec.ty.expected(),
        })?;
        values.insert(spec.name.clone(), value);
        rest = tail;
    }

    if !rest.is_empty() {
        return Err(CommandError::TooManyArguments(command.to_string()));
    }

    Ok(values)
}

impl CommandRegistry {
    /// Parse and run a command line on behalf of `source`
    ///
    /// A leading `/` is ignored. Subcommands are matched greedily before
    /// argument binding; every permission on the walked path must pass.
    /// Script executors always receive the raw argument tokens as argv.
    pub fn dispatch(&self, source: &CommandSource, input: &str) -> Result<DataValue> {
        let input = input.trim();
        let tokens = tokenize(input.strip_prefix('/').unwrap_or(input));
        let Some((name, mut rest)) = tokens.split_first() else {
            return Err(CommandError::UnknownCommand(String::new()));
        };

        let root = self
            .get(name)
            .ok_or_else(|| CommandError::UnknownCommand(name.clone()))?;

        let mut node: &CommandDescriptor = &root;
        let mut path = vec![root.name.clone()];
        loop {
            if let Some(permission) = &node.permission {
                if !permission.allows(source) {
                    tracing::debug!("{} denied '{}'", source.name, path.join(" "));
                    return Err(CommandError::PermissionDenied(path.join(" ")));
                }
            }

            let child = rest
                .first()
                .and_then(|token| node.subcommands.get(&token.to_lowercase()));
            match child {
                Some(child) => {
                    node = child;
                    path.push(child.name.clone());
                    rest = &rest[1..];
                }
                None => break,
            }
        }

        let command = path.join(" ");
        let executor = node
            .executor
            .clone()
            .ok_or_else(|| CommandError::NoExecutor(command.clone()))?;

        // Scripts without declared arguments parse their own argv
        let free_argv = matches!(executor, Executor::Script(_)) && node.arguments.is_empty();
        let arguments = if free_argv {
            BTreeMap::new()
        } else {
            bind_arguments(&command, &node.arguments, rest)?
        };

        let generation = self.ensure_fresh()?;
        tracing::debug!("{} runs '{}' (generation {})", source.name, command, generation);

        match executor {
            Executor::Native(run) => run(&CommandContext {
                source: source.clone(),
                command,
                arguments,
                raw: rest.to_vec(),
                generation,
            }),
            Executor::Script(handle) => {
                let invocation = Invocation::new(source.name.clone(), rest.to_vec());
                let bindings = Bindings::new().with_invocation(invocation);
                match self.host().execute_script(&handle, &bindings) {
                    ScriptResult::Success(value) => Ok(value),
                    ScriptResult::Error { message, .. } => Err(CommandError::Failed(message)),
                }
            }
        }
    }

    /// Completions for one argument of a command
    ///
    /// `command` may name a subcommand path (`admin warp`). Candidates are
    /// filtered by case-insensitive prefix and sorted. Boolean arguments
    /// without a provider complete to `false`/`true`.
    pub fn suggest(&self, command: &str, argument: &str, partial: &str) -> Vec<String> {
        let tokens = tokenize(command);
        let Some((name, path)) = tokens.split_first() else {
            return Vec::new();
        };
        let Some(root) = self.get(name) else {
            return Vec::new();
        };
        let lowered: Vec<String> = path.iter().map(|segment| segment.to_lowercase()).collect();
        let Some(node) = root.descend(&lowered) else {
            return Vec::new();
        };

        let candidates = match node.suggestions.get(argument) {
            Some(provider) => provider(partial),
            None => match node.argument(argument).map(|spec| spec.ty) {
                Some(ArgumentType::Boolean) => vec!["false".into(), "true".into()],
                _ => Vec::new(),
            },
        };

        let prefix = partial.to_lowercase();
        let mut matches: Vec<String> = candidates
            .into_iter()
            .filter(|candidate| candidate.to_lowercase().starts_with(&prefix))
            .collect();
        matches.sort();
        matches.dedup();
        matches
    }
}
