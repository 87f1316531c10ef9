//! TickScript - scripting host demo binary
//!
//! Loads the options file, runs bootstrap and server scripts, exposes
//! utility scripts as console commands and drains the tick queue on a fixed
//! interval.

mod console;
mod scripts;

use std::sync::Arc;

use anyhow::Context;
use tickscript_commands::CommandRegistry;
use tickscript_config::{HostConfig, DEFAULT_OPTIONS_PATH};
use tickscript_data::DataValue;
use tickscript_scripting::{EngineConfig, EngineHost, TickQueue, TickScheduler};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options_path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_OPTIONS_PATH.to_string());
    let loaded = HostConfig::load_from_file(&options_path);
    let config = loaded.as_ref().cloned().unwrap_or_default();

    // RUST_LOG wins over the options file
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("TickScript host starting up...");
    match &loaded {
        Ok(_) => info!("Configuration loaded from {}", options_path),
        Err(e) => {
            warn!("{}", e);
            warn!("Using default configuration");
        }
    }
    config.display();

    let scheduler = Arc::new(TickScheduler::new());
    let engine_config = EngineConfig {
        working_root: config.module_root.clone(),
        memory_limit: config.memory_limit,
        max_stack_size: config.max_stack_size,
        recycle_after: config.recycle_after,
    };
    let host = Arc::new(EngineHost::new(
        engine_config,
        scheduler.clone(),
        tokio::runtime::Handle::current(),
    ));

    let registry = CommandRegistry::new(host.clone());
    registry.set_dispatcher(Arc::new(console::ConsoleDispatcher));
    console::register_builtins(&registry, config.scripts_folder.clone())
        .context("registering console commands")?;

    let scripts = console::start_scripts(&registry, &config.scripts_folder)
        .context("starting scripts")?;
    info!(
        "Host ready: {} scripts, {} commands, tick every {} ms",
        scripts.len(),
        registry.len(),
        config.tick_rate
    );

    let mut ticker = tokio::time::interval(config.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let ran = scheduler.drain();
                if ran > 0 {
                    debug!("Tick {} ran {} callbacks", scheduler.current_tick(), ran);
                }
                if let Err(e) = console::recycle_if_due(&registry, &config.scripts_folder) {
                    error!("Engine recycle failed: {}", e);
                }
            }
            line = lines.next_line(), if console_open => match line {
                Ok(Some(line)) => console::handle_line(&registry, &line),
                Ok(None) => {
                    debug!("Console closed");
                    console_open = false;
                }
                Err(e) => {
                    warn!("Console read failed: {}", e);
                    console_open = false;
                }
            },
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("Signal handler failed: {}", e);
                }
                break;
            }
        }
    }

    info!("Shutting down");
    if let Err(e) = host.dispatch_event("stop", &DataValue::Null) {
        warn!("'stop' event failed: {}", e);
    }
    let ran = scheduler.drain();
    debug!("Final drain ran {} callbacks", ran);
    info!(
        "Bridge: {} settled, {} dropped, {} outstanding",
        host.bridge().settled(),
        host.bridge().dropped(),
        host.bridge().outstanding()
    );
    Ok(())
}
