//! Fluent command builder
//!
//! Every call reads the registry's descriptor, edits a working copy, writes
//! it back and hands out a new view bound to the same command. Dropping a
//! view loses nothing.

use std::sync::Arc;

use tickscript_core::ScriptCategory;

use crate::descriptor::{
    ArgumentSpec, ArgumentType, CommandDescriptor, Executor, Permission, SuggestionProvider,
};
use crate::error::{CommandError, Result};
use crate::registry::CommandRegistry;

pub struct CommandBuilder {
    registry: Arc<CommandRegistry>,
    root: String,
    path: Vec<String>,
}

impl CommandBuilder {
    pub(crate) fn new(registry: Arc<CommandRegistry>, root: String, path: Vec<String>) -> Self {
        Self { registry, root, path }
    }

    /// Full command path, e.g. `admin warp`
    pub fn qualified_name(&self) -> String {
        std::iter::once(self.root.as_str())
            .chain(self.path.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Current stored state of the command this view is bound to
    pub fn descriptor(&self) -> Option<CommandDescriptor> {
        self.registry.get(&self.root)?.descend(&self.path).cloned()
    }

    pub fn description(self, text: impl Into<String>) -> Self {
        let text = text.into();
        self.update(|descriptor| descriptor.description = text)
    }

    pub fn permission(self, permission: impl Into<Permission>) -> Self {
        let permission = permission.into();
        self.update(|descriptor| descriptor.permission = Some(permission))
    }

    /// Declare the next argument
    ///
    /// A required argument after an optional one, anything after a greedy
    /// `Text` argument, or a repeated name is rejected and nothing is stored.
    pub fn argument(self, spec: ArgumentSpec) -> Result<Self> {
        let command = self.qualified_name();
        self.try_update(|descriptor| {
            if descriptor.argument(&spec.name).is_some() {
                return Err(CommandError::DuplicateArgument {
                    command,
                    argument: spec.name,
                });
            }

            if let Some(greedy) = descriptor.arguments.iter().find(|arg| arg.ty == ArgumentType::Text) {
                return Err(CommandError::ArgumentAfterGreedy {
                    command,
                    argument: spec.name,
                    greedy: greedy.name.clone(),
                });
            }

            if !spec.optional {
                if let Some(optional) = descriptor.arguments.iter().find(|arg| arg.optional) {
                    return Err(CommandError::RequiredAfterOptional {
                        command,
                        argument: spec.name,
                        optional: optional.name.clone(),
                    });
                }
            }

            descriptor.arguments.push(spec);
            Ok(())
        })
    }

    /// Attach a completion source for one argument
    pub fn suggestions<F>(self, argument: impl Into<String>, provider: F) -> Self
    where
        F: Fn(&str) -> Vec<String> + Send + Sync + 'static,
    {
        let argument = argument.into();
        let provider: SuggestionProvider = Arc::new(provider);
        self.update(|descriptor| {
            descriptor.suggestions.insert(argument, provider);
        })
    }

    /// Set what runs when the command is dispatched
    ///
    /// Refreshes the registry's context reference if a reset happened since
    /// the last refresh.
    pub fn executor(self, executor: Executor) -> Result<Self> {
        if let Executor::Script(handle) = &executor {
            if handle.category != ScriptCategory::Utility {
                return Err(CommandError::NotUtility(self.qualified_name()));
            }
        }

        let builder = self.update(|descriptor| descriptor.executor = Some(executor));
        builder.registry.refresh_if_stale();
        Ok(builder)
    }

    /// Define a subcommand; `configure` receives a view bound to it
    ///
    /// Returns a view bound to this command again.
    pub fn subcommand<F>(self, name: &str, configure: F) -> Result<Self>
    where
        F: FnOnce(CommandBuilder) -> Result<CommandBuilder>,
    {
        let name = name.to_lowercase();
        let mut path = self.path.clone();
        path.push(name);

        // Persist the (possibly empty) child before handing out its view
        let child = CommandBuilder::new(self.registry.clone(), self.root.clone(), path).update(|_| {});
        configure(child)?;

        Ok(self.view())
    }

    fn view(&self) -> Self {
        Self::new(self.registry.clone(), self.root.clone(), self.path.clone())
    }

    fn update<F>(self, edit: F) -> Self
    where
        F: FnOnce(&mut CommandDescriptor),
    {
        let mut working = self.registry.working_copy(&self.root);
        edit(working.descend_mut(&self.path));
        self.registry.persist(working);
        self.view()
    }

    fn try_update<F>(self, edit: F) -> Result<Self>
    where
        F: FnOnce(&mut CommandDescriptor) -> Result<()>,
    {
        let mut working = self.registry.working_copy(&self.root);
        edit(working.descend_mut(&self.path))?;
        self.registry.persist(working);
        Ok(self.view())
    }
}
