//! Module resolution
//!
//! Import specifiers fall into three groups:
//!
//! - **Bare built-ins** (`import World from "World"`) resolve to a virtual
//!   path under [`VIRTUAL_ROOT`]. Reading that path synthesizes a tiny module
//!   whose default export forwards every access to the global capability
//!   slot, so it always sees the capability installed for the running
//!   script. Nothing is ever written to disk, and the engine declares each
//!   built-in once per context.
//! - **Relative** specifiers (`./util.js`, `../lib/math.mjs`) are joined to
//!   the importing module's directory and must carry a source extension.
//! - Everything else is resolved against the module working root and handed
//!   to the real filesystem, where it may fail.
//!
//! User modules carry the current run epoch (`util.js?epoch=12`), so every
//! run evaluates its own copy and nothing one run captured is served to the
//! next. The engine keeps every declared module until the context is reset.

use crate::error::{Result, ScriptError};
use parking_lot::RwLock;
use rquickjs::loader::{Loader, Resolver};
use rquickjs::module::Declared;
use rquickjs::{Ctx, Module, Object};
use std::collections::BTreeSet;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Prefix of every synthesized module path
pub const VIRTUAL_ROOT: &str = "/@tickscript/";

/// Global object holding the capability objects visible to the current script
pub const CAPABILITY_SLOT: &str = "__tickscript";

/// Size reported for every virtual module
pub const SYNTHETIC_SIZE: u64 = 4096;

/// Extensions recognized as script source
pub const SOURCE_EXTENSIONS: &[&str] = &["js", "mjs"];

/// How an import specifier will be resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecifierKind {
    /// Known built-in capability, by name
    Builtin(String),
    /// `./` or `../` path relative to the importer
    Relative,
    /// Anything else, passed to the filesystem as-is
    Native,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttributes {
    pub size: u64,
    pub kind: FileKind,
    pub modified: Option<SystemTime>,
    pub is_virtual: bool,
}

/// Filesystem operations the resolver needs
pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> io::Result<String>;
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()>;
    fn metadata(&self, path: &Path) -> io::Result<FileAttributes>;
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;
}

/// The real filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct StdFileSystem;

impl FileSystem for StdFileSystem {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        std::fs::write(path, contents)
    }

    fn metadata(&self, path: &Path) -> io::Result<FileAttributes> {
        let meta = std::fs::symlink_metadata(path)?;
        let kind = if meta.file_type().is_symlink() {
            FileKind::Symlink
        } else if meta.is_dir() {
            FileKind::Directory
        } else {
            FileKind::Regular
        };
        Ok(FileAttributes {
            size: meta.len(),
            kind,
            modified: meta.modified().ok(),
            is_virtual: false,
        })
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = std::fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<io::Result<Vec<_>>>()?;
        entries.sort();
        Ok(entries)
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        std::fs::read_link(path)
    }
}

/// Classify an import specifier
///
/// A specifier is a bare built-in iff it contains no `./` or `../` marker,
/// and its final path component, after stripping any scheme, query and
/// fragment, exactly matches a known built-in name without a source
/// extension.
pub fn classify(specifier: &str, builtins: &BTreeSet<String>) -> SpecifierKind {
    if specifier.starts_with("./") || specifier.starts_with("../") {
        return SpecifierKind::Relative;
    }
    if specifier.contains("./") {
        return SpecifierKind::Native;
    }

    let last = final_component(specifier);
    if has_source_extension(last) {
        return SpecifierKind::Native;
    }
    if builtins.contains(last) {
        return SpecifierKind::Builtin(last.to_string());
    }
    SpecifierKind::Native
}

/// Last path component with scheme, query and fragment removed
fn final_component(specifier: &str) -> &str {
    let without_fragment = specifier.split('#').next().unwrap_or(specifier);
    let without_query = without_fragment.split('?').next().unwrap_or(without_fragment);
    let without_scheme = match without_query.find(':') {
        Some(colon) if !without_query[..colon].contains('/') => &without_query[colon + 1..],
        _ => without_query,
    };
    without_scheme.rsplit('/').next().unwrap_or(without_scheme)
}

fn has_source_extension(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SOURCE_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// Drop a `?query` / `#fragment` suffix from a module name
pub fn strip_query(name: &str) -> &str {
    let end = name.find(['?', '#']).unwrap_or(name.len());
    &name[..end]
}

/// Lexically normalize `.` and `..` components
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Synthesized source for a built-in module
///
/// The default export is a proxy that looks the capability up on every
/// access. A reference kept past its run throws once the capability is
/// withdrawn instead of reaching the old object.
pub fn virtual_module_source(name: &str) -> String {
    format!(
        r#"const current = () => {{
  const capability = globalThis[{slot:?}] && globalThis[{slot:?}][{name:?}];
  if (capability === undefined) {{
    throw new ReferenceError("Capability '{name}' is not available to this script");
  }}
  return capability;
}};
export default new Proxy(Object.create(null), {{
  get: (_, key) => Reflect.get(current(), key),
  set: (_, key, value) => Reflect.set(current(), key, value),
  has: (_, key) => Reflect.has(current(), key),
  ownKeys: () => Reflect.ownKeys(current()),
  getOwnPropertyDescriptor: (_, key) => {{
    const descriptor = Reflect.getOwnPropertyDescriptor(current(), key);
    return descriptor && {{ ...descriptor, configurable: true }};
  }},
}});
"#,
        slot = CAPABILITY_SLOT,
        name = name,
    )
}

/// Virtual filesystem layered over a real one
///
/// Built-in names resolve to synthesized modules; every other path goes to
/// the delegate unchanged.
pub struct ModuleResolver {
    delegate: Arc<dyn FileSystem>,
    builtins: RwLock<BTreeSet<String>>,
    root: PathBuf,
    epoch: AtomicU64,
}

impl ModuleResolver {
    pub fn new(root: impl Into<PathBuf>, delegate: Arc<dyn FileSystem>) -> Self {
        Self {
            delegate,
            builtins: RwLock::new(BTreeSet::new()),
            root: root.into(),
            epoch: AtomicU64::new(0),
        }
    }

    /// Start a new run; later user module imports get fresh module names
    pub fn advance_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Module working root
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn add_builtin(&self, name: impl Into<String>) {
        self.builtins.write().insert(name.into());
    }

    pub fn builtins(&self) -> BTreeSet<String> {
        self.builtins.read().clone()
    }

    pub fn is_builtin(&self, name: &str) -> bool {
        self.builtins.read().contains(name)
    }

    pub fn classify(&self, specifier: &str) -> SpecifierKind {
        classify(specifier, &self.builtins.read())
    }

    /// Virtual path for a built-in name
    pub fn virtual_path(name: &str) -> PathBuf {
        PathBuf::from(format!("{}{}", VIRTUAL_ROOT, name))
    }

    /// Built-in name behind a virtual path, if it is one
    pub fn virtual_name(&self, path: &Path) -> Option<String> {
        let text = path.to_str()?;
        let name = strip_query(text.strip_prefix(VIRTUAL_ROOT)?);
        self.is_builtin(name).then(|| name.to_string())
    }

    pub fn is_virtual(&self, path: &Path) -> bool {
        self.virtual_name(path).is_some()
    }

    /// Resolve `specifier` imported from module `base`
    pub fn resolve(&self, base: &str, specifier: &str) -> Result<String> {
        self.resolve_scoped(base, specifier, |_| true)
    }

    /// Resolve `specifier`, refusing built-ins for which `available` is false
    pub fn resolve_scoped<F>(&self, base: &str, specifier: &str, available: F) -> Result<String>
    where
        F: Fn(&str) -> bool,
    {
        let resolved = match self.classify(specifier) {
            SpecifierKind::Builtin(name) => {
                if !available(&name) {
                    return Err(ScriptError::ModuleResolution {
                        specifier: specifier.to_string(),
                        message: format!("capability '{}' is not available to this script", name),
                    });
                }
                return Ok(format!("{}{}", VIRTUAL_ROOT, name));
            }
            SpecifierKind::Relative => {
                if !has_source_extension(final_component(specifier)) {
                    return Err(ScriptError::ModuleResolution {
                        specifier: specifier.to_string(),
                        message: format!(
                            "relative imports must name a .{} file",
                            SOURCE_EXTENSIONS.join(" or .")
                        ),
                    });
                }
                let base = Path::new(strip_query(base));
                let dir = base.parent().unwrap_or_else(|| Path::new(""));
                normalize(&dir.join(specifier))
            }
            SpecifierKind::Native => {
                let candidate = normalize(&self.root.join(specifier));
                self.delegate
                    .metadata(&candidate)
                    .map_err(|e| ScriptError::ModuleResolution {
                        specifier: specifier.to_string(),
                        message: e.to_string(),
                    })?;
                candidate
            }
        };

        tracing::trace!("Resolved '{}' from '{}' to {}", specifier, base, resolved.display());
        Ok(format!("{}?epoch={}", resolved.to_string_lossy(), self.epoch()))
    }
}

impl FileSystem for ModuleResolver {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        match self.virtual_name(path) {
            Some(name) => Ok(virtual_module_source(&name)),
            None => self.delegate.read_to_string(path),
        }
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        if self.is_virtual(path) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                ScriptError::Unsupported(path.display().to_string()).to_string(),
            ));
        }
        self.delegate.write(path, contents)
    }

    fn metadata(&self, path: &Path) -> io::Result<FileAttributes> {
        if self.is_virtual(path) {
            return Ok(FileAttributes {
                size: SYNTHETIC_SIZE,
                kind: FileKind::Regular,
                modified: None,
                is_virtual: true,
            });
        }
        self.delegate.metadata(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        self.delegate.read_dir(path)
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        self.delegate.read_link(path)
    }
}

/// Engine-facing resolver and loader backed by a [`ModuleResolver`]
#[derive(Clone)]
pub struct EngineLoader {
    resolver: Arc<ModuleResolver>,
}

impl EngineLoader {
    pub fn new(resolver: Arc<ModuleResolver>) -> Self {
        Self { resolver }
    }
}

impl Resolver for EngineLoader {
    fn resolve<'js>(&mut self, ctx: &Ctx<'js>, base: &str, name: &str) -> rquickjs::Result<String> {
        let installed: Object = ctx.globals().get(CAPABILITY_SLOT)?;
        self.resolver
            .resolve_scoped(base, name, |capability| installed.contains_key(capability).unwrap_or(false))
            .map_err(|e| rquickjs::Error::new_resolving_message(base, name, e.to_string()))
    }
}

impl Loader for EngineLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js, Declared>> {
        let source = self
            .resolver
            .read_to_string(Path::new(strip_query(name)))
            .map_err(|e| rquickjs::Error::new_loading_message(name, e.to_string()))?;
        Module::declare(ctx.clone(), name, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builtins() -> BTreeSet<String> {
        ["World", "Data", "Log"].iter().map(|s| s.to_string()).collect()
    }

    fn resolver(root: &Path) -> ModuleResolver {
        let resolver = ModuleResolver::new(root, Arc::new(StdFileSystem));
        for name in builtins() {
            resolver.add_builtin(name);
        }
        resolver
    }

    #[test]
    fn test_classify_builtin() {
        let names = builtins();
        assert_eq!(classify("World", &names), SpecifierKind::Builtin("World".into()));
        assert_eq!(classify("tickscript:World", &names), SpecifierKind::Builtin("World".into()));
        assert_eq!(classify("World?v=2#top", &names), SpecifierKind::Builtin("World".into()));
    }

    #[test]
    fn test_classify_not_builtin() {
        let names = builtins();
        assert_eq!(classify("./World.js", &names), SpecifierKind::Relative);
        assert_eq!(classify("../x/World", &names), SpecifierKind::Relative);
        assert_eq!(classify("World.js", &names), SpecifierKind::Native);
        assert_eq!(classify("lib/./World", &names), SpecifierKind::Native);
        assert_eq!(classify("Worlds", &names), SpecifierKind::Native);
        assert_eq!(classify("world", &names), SpecifierKind::Native);
    }

    #[test]
    fn test_virtual_module_is_synthesized() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver(dir.path());
        let path = ModuleResolver::virtual_path("World");

        let first = resolver.read_to_string(&path).unwrap();
        let second = resolver.read_to_string(&path).unwrap();
        assert_eq!(first, second);
        assert!(first.contains(CAPABILITY_SLOT));
        assert!(first.contains("export default new Proxy"));
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_virtual_attributes_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver(dir.path());
        let path = ModuleResolver::virtual_path("Data");

        let attrs = resolver.metadata(&path).unwrap();
        assert_eq!(attrs.size, SYNTHETIC_SIZE);
        assert_eq!(attrs.kind, FileKind::Regular);
        assert!(attrs.is_virtual);

        let err = resolver.write(&path, b"nope").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn test_unknown_virtual_name_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver(dir.path());
        let path = ModuleResolver::virtual_path("Missing");
        assert!(!resolver.is_virtual(&path));
        assert!(resolver.metadata(&path).is_err());
    }

    #[test]
    fn test_real_paths_delegate() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver(dir.path());
        let file = dir.path().join("util.js");

        resolver.write(&file, b"export const x = 1;").unwrap();
        assert_eq!(resolver.read_to_string(&file).unwrap(), "export const x = 1;");
        assert_eq!(resolver.metadata(&file).unwrap().kind, FileKind::Regular);
        assert_eq!(resolver.read_dir(dir.path()).unwrap(), vec![file]);
    }

    #[test]
    fn test_resolve_relative() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver(dir.path());
        let base = dir.path().join("scripts/utility/heal.js?run=4");
        let base = base.to_str().unwrap();

        let resolved = resolver.resolve(base, "../lib/math.js").unwrap();
        assert!(resolved.ends_with("?epoch=0"), "{}", resolved);
        assert_eq!(PathBuf::from(strip_query(&resolved)), dir.path().join("scripts/lib/math.js"));

        let err = resolver.resolve(base, "./math").unwrap_err();
        assert!(matches!(err, ScriptError::ModuleResolution { .. }));
    }

    #[test]
    fn test_resolve_builtin_and_native() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver(dir.path());
        std::fs::write(dir.path().join("shared.js"), "export default 1;").unwrap();

        assert_eq!(resolver.resolve("main.js", "World").unwrap(), "/@tickscript/World");
        let shared = resolver.resolve("main.js", "shared.js").unwrap();
        assert_eq!(shared, format!("{}?epoch=0", dir.path().join("shared.js").display()));

        // Built-ins keep one name per context, user modules move with the run
        resolver.advance_epoch();
        let world = resolver.resolve("main.js", "World").unwrap();
        assert_eq!(world, "/@tickscript/World");
        assert!(resolver.is_virtual(Path::new(&world)));
        let shared = resolver.resolve("main.js", "shared.js").unwrap();
        assert!(shared.ends_with("shared.js?epoch=1"), "{}", shared);
        assert!(resolver.resolve("main.js", "missing.js").is_err());
    }

    #[test]
    fn test_unavailable_builtin_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver(dir.path());
        let only_data = |name: &str| name == "Data";

        assert_eq!(resolver.resolve_scoped("main.js", "Data", only_data).unwrap(), "/@tickscript/Data");
        let err = resolver.resolve_scoped("main.js", "World", only_data).unwrap_err();
        match err {
            ScriptError::ModuleResolution { specifier, message } => {
                assert_eq!(specifier, "World");
                assert!(message.contains("not available"), "{}", message);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
