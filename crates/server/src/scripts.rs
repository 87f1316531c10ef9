//! Script folder discovery
//!
//! Layout: `<scripts>/<category>/<name>.js`, one folder per category.

use std::fs;
use std::path::Path;

use tickscript_core::{ScriptCategory, ScriptHandle};
use tickscript_scripting::{Bindings, EngineHost, ScriptResult};
use tracing::{debug, info};

const SOURCE_EXTENSIONS: [&str; 2] = ["js", "mjs"];

/// Find every script under the scripts folder, sorted by name
pub fn discover(folder: &Path) -> Vec<ScriptHandle> {
    let mut scripts = Vec::new();

    for category in ScriptCategory::ALL {
        let dir = folder.join(category.as_str());
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => {
                debug!("No {} scripts ({} not readable)", category.as_str(), dir.display());
                continue;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let is_source = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map_or(false, |ext| SOURCE_EXTENSIONS.contains(&ext));
            if !is_source || !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };

            let name = format!("{}/{}", category.as_str(), file_name);
            let mut handle = ScriptHandle::new(name, path.clone(), category);
            if let Ok(modified) = entry.metadata().and_then(|meta| meta.modified()) {
                handle.last_modified = modified;
            }
            scripts.push(handle);
        }
    }

    scripts.sort_by(|a, b| a.name.cmp(&b.name));
    scripts
}

/// Run every script of one category, returning how many succeeded
pub fn run_category(host: &EngineHost, scripts: &[ScriptHandle], category: ScriptCategory) -> usize {
    let mut succeeded = 0;
    let mut total = 0;

    for handle in scripts.iter().filter(|handle| handle.category == category) {
        total += 1;
        // failures are already logged by the host
        if let ScriptResult::Success(_) = host.execute_script(handle, &Bindings::new()) {
            succeeded += 1;
        }
    }

    info!("Ran {}/{} {} scripts", succeeded, total, category.as_str());
    succeeded
}

/// Command name for a utility script: its file stem, lowercased
pub fn command_name(handle: &ScriptHandle) -> Option<String> {
    handle
        .location()
        .file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_lowercase)
}
