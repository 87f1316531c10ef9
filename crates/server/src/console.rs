//! Console commands

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use tickscript_commands::{
    ArgumentSpec, ArgumentType, CommandDescriptor, CommandDispatcher, CommandError, CommandRegistry,
    CommandSource, Executor,
};
use tickscript_core::{ScriptCategory, ScriptHandle};
use tickscript_data::DataValue;
use tracing::{debug, info, warn};

use crate::scripts;

/// Logs what the registry publishes
pub struct ConsoleDispatcher;

impl CommandDispatcher for ConsoleDispatcher {
    fn publish(&self, descriptor: &CommandDescriptor) {
        debug!("Command available: /{}", descriptor.usage());
    }

    fn retract(&self, name: &str) {
        debug!("Command removed: /{}", name);
    }
}

/// Register every utility script as a command named after its file
pub fn register_utilities(
    registry: &Arc<CommandRegistry>,
    scripts: &[ScriptHandle],
) -> Result<usize, CommandError> {
    let mut registered = 0;
    for handle in scripts.iter().filter(|handle| handle.category == ScriptCategory::Utility) {
        let Some(name) = scripts::command_name(handle) else {
            continue;
        };
        if registry.get(&name).map_or(false, |existing| matches!(existing.executor, Some(Executor::Native(_)))) {
            warn!("Utility script {} shadows a built-in command, skipped", handle.name);
            continue;
        }

        registry
            .command(&name)
            .description(format!("Run {}", handle.name))
            .permission(format!("scripts.{}", name))
            .executor(Executor::script(handle.clone()))?;
        registered += 1;
    }
    Ok(registered)
}

/// Discover, then run bootstrap and server scripts in that order
pub fn start_scripts(
    registry: &Arc<CommandRegistry>,
    folder: &Path,
) -> Result<Vec<ScriptHandle>, CommandError> {
    let scripts = scripts::discover(folder);
    info!("Discovered {} scripts in {}", scripts.len(), folder.display());

    let host = registry.host();
    scripts::run_category(host, &scripts, ScriptCategory::Bootstrap);
    scripts::run_category(host, &scripts, ScriptCategory::Server);

    let registered = register_utilities(registry, &scripts)?;
    info!("Registered {} utility commands", registered);

    let handlers = host.dispatch_event("start", &DataValue::Null)?;
    debug!("'start' reached {} handlers", handlers);
    Ok(scripts)
}

/// Reset the engine and rerun bootstrap and server scripts
///
/// Returns the new generation and the number of scripts discovered.
pub fn reload(registry: &Arc<CommandRegistry>, folder: &Path) -> Result<(u64, usize), CommandError> {
    let generation = registry.host().reset();
    let scripts = start_scripts(registry, folder)?;
    Ok((generation, scripts.len()))
}

/// Reload once the engine has run enough scripts to be recycled
pub fn recycle_if_due(registry: &Arc<CommandRegistry>, folder: &Path) -> Result<bool, CommandError> {
    let host = registry.host();
    if !host.recycle_due() {
        return Ok(false);
    }

    info!("Recycling engine after {} script runs", host.runs_since_reset());
    let (generation, scripts) = reload(registry, folder)?;
    debug!("Recycled into generation {} with {} scripts", generation, scripts);
    Ok(true)
}

/// Install the built-in console commands
pub fn register_builtins(registry: &Arc<CommandRegistry>, folder: PathBuf) -> Result<(), CommandError> {
    let weak: Weak<CommandRegistry> = Arc::downgrade(registry);
    registry
        .command("help")
        .description("List commands")
        .executor(Executor::native(move |_| {
            let Some(registry) = weak.upgrade() else {
                return Ok(DataValue::Null);
            };
            let lines: Vec<DataValue> = registry
                .names()
                .into_iter()
                .filter_map(|name| registry.get(&name))
                .map(|descriptor| {
                    DataValue::from(format!("/{} - {}", descriptor.usage(), descriptor.description))
                })
                .collect();
            Ok(DataValue::from(lines))
        }))?;

    let scripts_folder = folder.clone();
    registry
        .command("scripts")
        .description("List discovered scripts")
        .executor(Executor::native(move |_| {
            let names: Vec<DataValue> = scripts::discover(&scripts_folder)
                .iter()
                .map(|handle| DataValue::from(format!("{} [{:?}]", handle.name, handle.status)))
                .collect();
            Ok(DataValue::from(names))
        }))?;

    let weak: Weak<CommandRegistry> = Arc::downgrade(registry);
    registry
        .command("reload")
        .description("Reset the engine and rerun bootstrap and server scripts")
        .permission("admin.reload")
        .executor(Executor::native(move |_| {
            let Some(registry) = weak.upgrade() else {
                return Ok(DataValue::Null);
            };
            let (generation, scripts) = reload(&registry, &folder)?;
            Ok(DataValue::from(format!(
                "Reloaded {} scripts (generation {})",
                scripts, generation
            )))
        }))?;

    let host = registry.host().clone();
    registry
        .command("event")
        .description("Fire a script event")
        .permission("admin.event")
        .argument(ArgumentSpec::required("name", ArgumentType::Word))?
        .argument(ArgumentSpec::optional("payload", ArgumentType::Text))?
        .executor(Executor::native(move |ctx| {
            let name = ctx.argument("name").and_then(DataValue::as_str).unwrap_or_default();
            let payload = ctx
                .argument("payload")
                .and_then(DataValue::as_str)
                .map(parse_payload)
                .unwrap_or_default();
            let handlers = host.dispatch_event(name, &payload)?;
            Ok(DataValue::from(handlers as u64))
        }))?;

    let host = registry.host().clone();
    registry
        .command("store")
        .description("Show the host store, or one path of it")
        .argument(ArgumentSpec::optional("path", ArgumentType::Word))?
        .executor(Executor::native(move |ctx| {
            let store = host.store();
            match ctx.argument("path").and_then(DataValue::as_str) {
                Some(path) => Ok(tickscript_data::get(&store, path).cloned().unwrap_or_default()),
                None => Ok(store),
            }
        }))?;

    Ok(())
}

/// JSON if it parses, otherwise the raw text
fn parse_payload(text: &str) -> DataValue {
    serde_json::from_str::<serde_json::Value>(text)
        .map(DataValue::from)
        .unwrap_or_else(|_| DataValue::from(text))
}

/// Run one console line
pub fn handle_line(registry: &CommandRegistry, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    match registry.dispatch(&CommandSource::console(), line) {
        Ok(DataValue::Null) => {}
        Ok(DataValue::List(items)) => {
            for item in items.iter() {
                info!("{}", item);
            }
        }
        Ok(value) => info!("{}", value),
        Err(e) => warn!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tickscript_scripting::{EngineConfig, EngineHost, TickScheduler};

    struct Fixture {
        _runtime: tokio::runtime::Runtime,
        dir: tempfile::TempDir,
        registry: Arc<CommandRegistry>,
    }

    fn fixture() -> Fixture {
        fixture_with(EngineConfig::default())
    }

    fn fixture_with(config: EngineConfig) -> Fixture {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            working_root: dir.path().to_path_buf(),
            ..config
        };
        let host = Arc::new(EngineHost::new(
            config,
            Arc::new(TickScheduler::new()),
            runtime.handle().clone(),
        ));
        let registry = CommandRegistry::new(host);
        registry.set_dispatcher(Arc::new(ConsoleDispatcher));
        register_builtins(&registry, dir.path().to_path_buf()).unwrap();
        Fixture {
            _runtime: runtime,
            dir,
            registry,
        }
    }

    fn write(root: &Path, relative: &str, source: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, source).unwrap();
    }

    #[test]
    fn test_parse_payload() {
        assert_eq!(parse_payload(r#"{"hp": 3}"#).to_json(), json!({"hp": 3}));
        assert_eq!(parse_payload("plain words").to_json(), json!("plain words"));
    }

    #[test]
    fn test_start_scripts_and_commands() {
        let fixture = fixture();
        write(
            fixture.dir.path(),
            "bootstrap/setup.js",
            r#"import Bootstrap from "Bootstrap"; Bootstrap.define("motd", "hello");"#,
        );
        write(
            fixture.dir.path(),
            "server/events.js",
            r#"
            import Events from "Events";
            Events.on("greet", (payload) => { globalThis.greeted = payload.name; });
            "#,
        );
        write(
            fixture.dir.path(),
            "utility/whoami.js",
            r#"import Invocation from "Invocation"; export default Invocation.caller;"#,
        );

        let scripts = start_scripts(&fixture.registry, fixture.dir.path()).unwrap();
        assert_eq!(scripts.len(), 3);

        let console = CommandSource::console();
        let motd = fixture.registry.dispatch(&console, "store motd").unwrap();
        assert_eq!(motd.as_str(), Some("hello"));

        let reached = fixture
            .registry
            .dispatch(&console, r#"event greet {"name": "alice"}"#)
            .unwrap();
        assert_eq!(reached.as_i64(), Some(1));

        let caller = fixture.registry.dispatch(&console, "whoami").unwrap();
        assert_eq!(caller.as_str(), Some("console"));

        let player = CommandSource::named("bob");
        assert!(matches!(
            fixture.registry.dispatch(&player, "whoami"),
            Err(CommandError::PermissionDenied(_))
        ));
        let allowed = CommandSource::named("bob").with_permission("scripts.*");
        let caller = fixture.registry.dispatch(&allowed, "whoami").unwrap();
        assert_eq!(caller.as_str(), Some("bob"));
    }

    #[test]
    fn test_reload_resets_and_reruns() {
        let fixture = fixture();
        write(
            fixture.dir.path(),
            "server/counter.js",
            "globalThis.runs = (globalThis.runs || 0) + 1;",
        );
        write(
            fixture.dir.path(),
            "utility/runs.js",
            "export default globalThis.runs;",
        );
        start_scripts(&fixture.registry, fixture.dir.path()).unwrap();

        let console = CommandSource::console();
        fixture.registry.dispatch(&console, "reload").unwrap();
        // fresh context: the server script ran once more on a clean global
        let runs = fixture.registry.dispatch(&console, "runs").unwrap();
        assert_eq!(runs.as_i64(), Some(1));
    }

    #[test]
    fn test_recycle_after_run_limit() {
        let fixture = fixture_with(EngineConfig {
            recycle_after: 3,
            ..EngineConfig::default()
        });
        write(
            fixture.dir.path(),
            "server/counter.js",
            "globalThis.runs = (globalThis.runs || 0) + 1;",
        );
        write(fixture.dir.path(), "utility/runs.js", "export default globalThis.runs;");
        start_scripts(&fixture.registry, fixture.dir.path()).unwrap();

        let host = fixture.registry.host();
        let console = CommandSource::console();
        assert!(!recycle_if_due(&fixture.registry, fixture.dir.path()).unwrap());
        fixture.registry.dispatch(&console, "runs").unwrap();
        fixture.registry.dispatch(&console, "runs").unwrap();
        assert!(host.recycle_due());

        let generation = host.generation();
        assert!(recycle_if_due(&fixture.registry, fixture.dir.path()).unwrap());
        assert_eq!(host.generation(), generation + 1);
        // the server script ran again on the fresh context
        assert_eq!(host.runs_since_reset(), 1);
        let runs = fixture.registry.dispatch(&console, "runs").unwrap();
        assert_eq!(runs.as_i64(), Some(1));
    }

    #[test]
    fn test_utility_cannot_shadow_builtin() {
        let fixture = fixture();
        write(fixture.dir.path(), "utility/help.js", "export default 1;");
        let scripts = scripts::discover(fixture.dir.path());
        assert_eq!(register_utilities(&fixture.registry, &scripts).unwrap(), 0);
        assert!(matches!(
            fixture.registry.get("help").unwrap().executor,
            Some(Executor::Native(_))
        ));
    }
}
