//! # TickScript Commands
//!
//! Registry of named commands built through a fluent builder and dispatched
//! from text input. Executors are native closures or `Utility` scripts run
//! through the [`EngineHost`](tickscript_scripting::EngineHost).
//!
//! ```text
//! registry.command("give")
//!     .permission("admin.give")
//!     .argument(ArgumentSpec::required("player", ArgumentType::Word))?
//!     .argument(ArgumentSpec::optional("count", ArgumentType::Integer).with_default(1))?
//!     .executor(Executor::script(handle))?;
//!
//! registry.dispatch(&source, "/give bob 3")?;
//! ```
//!
//! The registry survives engine resets: descriptors and the dispatcher are
//! kept, and the cached context is refreshed before the next executor runs.

pub mod error;
pub mod descriptor;
pub mod registry;
pub mod builder;
pub mod dispatch;

pub use builder::CommandBuilder;
pub use descriptor::{
    ArgumentSpec, ArgumentType, CommandContext, CommandDescriptor, CommandSource, Executor,
    NativeExecutor, Permission, SuggestionProvider,
};
pub use dispatch::tokenize;
pub use error::{CommandError, Result};
pub use registry::{CommandDispatcher, CommandRegistry};
