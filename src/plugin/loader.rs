//! One plugin's lifecycle: discover candidates on disk, load a dynamic
//! library, resolve its entry point.
//!
//! Kept deliberately dumb: this module knows nothing about fan-out,
//! fault isolation, or the open-connections replay rule — that's
//! [`super::manager`]'s job. This module only answers "what's on disk"
//! and "given a path, give me a live `Arc<dyn PluginHooks>`".

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use libloading::{Library, Symbol};

use super::PluginHooks;

/// Extension (without the leading dot) a module-style plugin source
/// file must carry to be discovered. `libloading::library_filename`
/// maps a logical library name to the platform's actual
/// `.so`/`.dylib`/`.dll` name; discovery itself works on this one
/// logical extension regardless of host OS.
pub const PLUGIN_EXTENSION: &str = "plugin";

/// Marker file identifying a subdirectory as a package-style plugin.
const PACKAGE_MARKER: &str = "plugin.toml";

/// C-ABI entry point every plugin dynamic library must export.
/// Ownership of the returned pointer transfers to the caller, which
/// immediately re-boxes it.
const ENTRY_POINT: &[u8] = b"_wireward_plugin_create";

type PluginCreateFn = unsafe extern "C" fn() -> *mut dyn PluginHooks;

/// A plugin candidate found on disk, not yet loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSource {
    /// Stable name: the package directory's name, or the module file's
    /// stem.
    pub name: String,
    /// Package directory or module source file.
    pub path: PathBuf,
}

/// A loaded plugin: its name, its hook implementation, and the library
/// handle it was loaded from. The handle must outlive every call
/// through `hooks`, so it's kept alongside even though nothing reads
/// it directly.
pub struct LoadedPlugin {
    /// Stable name, matching the [`PluginSource`] it was loaded from.
    pub name: String,
    /// The plugin's hook implementation.
    pub hooks: Arc<dyn PluginHooks>,
    source: PluginSource,
    // `None` only for in-process test plugins built via `load_for_test`,
    // which have no backing dynamic library to keep mapped.
    _library: Option<Arc<Library>>,
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("name", &self.name)
            .field("path", &self.source.path)
            .finish()
    }
}

impl LoadedPlugin {
    /// Load the plugin at `source` from scratch.
    pub fn load(source: &PluginSource) -> Result<Self> {
        let library_path = resolve_library_path(&source.path)?;

        // SAFETY: loading a dynamic library runs its initializer code;
        // we trust the plugin directory is operator-controlled, not
        // attacker-controlled (see the plugin isolation non-goal).
        let library = unsafe { Library::new(&library_path) }
            .with_context(|| format!("failed to load plugin library at {}", library_path.display()))?;

        let hooks = unsafe {
            let create: Symbol<'_, PluginCreateFn> = library.get(ENTRY_POINT).with_context(|| {
                format!(
                    "plugin {} is missing entry point {}",
                    source.name,
                    String::from_utf8_lossy(ENTRY_POINT)
                )
            })?;
            let raw = create();
            anyhow::ensure!(!raw.is_null(), "plugin {} entry point returned a null instance", source.name);
            Arc::from(Box::from_raw(raw))
        };

        Ok(LoadedPlugin {
            name: source.name.clone(),
            hooks,
            source: source.clone(),
            _library: Some(Arc::new(library)),
        })
    }

    /// Reload this plugin from its original source path, producing a
    /// fresh instance. The caller swaps it in atomically and drops the
    /// old one.
    pub fn reload(&self) -> Result<Self> {
        Self::load(&self.source)
    }

    /// Build a `LoadedPlugin` directly from an in-process hook
    /// implementation, bypassing dynamic loading entirely. Only for
    /// exercising [`super::manager::PluginManager`]'s dispatch logic
    /// in tests without building real cdylib fixtures.
    #[cfg(test)]
    pub fn load_for_test(name: &str, hooks: impl PluginHooks + 'static) -> Self {
        LoadedPlugin {
            name: name.to_string(),
            hooks: Arc::new(hooks),
            source: PluginSource { name: name.to_string(), path: PathBuf::new() },
            _library: None,
        }
    }
}

/// Map a discovered source path to the concrete dynamic library
/// `libloading` should open: the file itself for a module-style
/// plugin, or the conventionally-named library inside a package-style
/// plugin directory.
fn resolve_library_path(source_path: &Path) -> Result<PathBuf> {
    if source_path.is_dir() {
        let name = source_path
            .file_name()
            .and_then(OsStr::to_str)
            .context("package plugin directory has no name")?;
        Ok(source_path.join(libloading::library_filename(name)))
    } else {
        Ok(source_path.to_path_buf())
    }
}

/// Scan `dir` for plugin candidates. A subdirectory containing
/// [`PACKAGE_MARKER`] is a package-style plugin named after the
/// directory; a file with extension [`PLUGIN_EXTENSION`] is a
/// module-style plugin named after its stem. Symlinks, dotfiles, and
/// anything else are ignored. A missing directory yields an empty
/// list rather than an error — the manager starts with no plugins
/// until one is dropped in.
pub fn discover(dir: &Path) -> Result<Vec<PluginSource>> {
    let mut found = Vec::new();

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e).with_context(|| format!("failed to read plugin directory {}", dir.display())),
    };

    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to stat {}", path.display()))?;

        if file_type.is_symlink() {
            continue;
        }

        if file_type.is_dir() {
            if path.join(PACKAGE_MARKER).is_file() {
                if let Some(name) = path.file_name().and_then(OsStr::to_str) {
                    found.push(PluginSource { name: name.to_string(), path });
                }
            }
            continue;
        }

        let Some(file_name) = path.file_name().and_then(OsStr::to_str) else {
            continue;
        };
        if file_name.starts_with('.') {
            continue;
        }
        if path.extension().and_then(OsStr::to_str) == Some(PLUGIN_EXTENSION) {
            if let Some(stem) = path.file_stem().and_then(OsStr::to_str) {
                found.push(PluginSource { name: stem.to_string(), path });
            }
        }
    }

    found.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn discover_empty_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let found = discover(dir.path()).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn discover_missing_dir_is_empty() {
        let found = discover(Path::new("/nonexistent/wireward/plugins")).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn discover_finds_module_style_plugin() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("alert.plugin"), b"").unwrap();
        fs::write(dir.path().join("notes.txt"), b"").unwrap();
        fs::write(dir.path().join(".hidden.plugin"), b"").unwrap();

        let found = discover(dir.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "alert");
    }

    #[test]
    fn discover_finds_package_style_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("tls_terminate");
        fs::create_dir(&pkg).unwrap();
        fs::write(pkg.join("plugin.toml"), b"").unwrap();

        let bare = dir.path().join("not_a_plugin");
        fs::create_dir(&bare).unwrap();

        let found = discover(dir.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "tls_terminate");
    }

    #[test]
    fn discover_sorts_by_name() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("zeta.plugin"), b"").unwrap();
        fs::write(dir.path().join("alpha.plugin"), b"").unwrap();

        let found = discover(dir.path()).unwrap();
        let names: Vec<_> = found.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn resolve_library_path_keeps_module_file_as_is() {
        let path = Path::new("/plugins/alert.plugin");
        assert_eq!(resolve_library_path(path).unwrap(), path);
    }
}
