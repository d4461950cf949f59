//! Plugin registry: native plugin entry points, resolved by name.
//!
//! Each plugin exports a single initialization entry that receives the root
//! and registers one or more modules. Entries live in a process-wide table;
//! `load_plugin` resolves a path's file stem against it, so startup code and
//! scripts keep the familiar load-by-path call shape without the runtime
//! doing any dynamic library loading itself.

use std::collections::HashMap;
use std::path::Path;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::root::Root;

/// A plugin's initialization entry.
pub type PluginInit = fn(&Root) -> Result<()>;

static REGISTRY: Lazy<RwLock<HashMap<&'static str, PluginInit>>> = Lazy::new(|| {
    let mut builtins: HashMap<&'static str, PluginInit> = HashMap::new();
    builtins.insert("file", crate::file::plugin_init as PluginInit);
    RwLock::new(builtins)
});

/// Registers a plugin entry point under `name`.
pub fn register_plugin(name: &'static str, init: PluginInit) -> Result<()> {
    let mut registry = REGISTRY.write();
    if registry.contains_key(name) {
        return Err(Error::AlreadyExists(name.to_string()));
    }
    registry.insert(name, init);
    Ok(())
}

/// Loads the plugin whose name matches the file stem of `path` (a leading
/// "lib" is ignored) and runs its initialization entry against `root`.
pub fn load_plugin(root: &Root, path: &str) -> Result<()> {
    let stem = Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::InvalidArgument(format!("bad plugin path \"{}\"", path)))?;
    let stem = stem.strip_prefix("lib").unwrap_or(stem);
    let init = REGISTRY
        .read()
        .get(stem)
        .copied()
        .ok_or_else(|| Error::NotFound(stem.to_string()))?;
    log::debug!("loading plugin {}", stem);
    init(root)
}

/// Loads every registered plugin found in `dir`. Unknown files are skipped;
/// returns the number of plugins loaded.
pub fn load_plugin_from_dir(root: &Root, dir: &str) -> Result<usize> {
    let mut loaded = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(path) = path.to_str() else { continue };
        match load_plugin(root, path) {
            Ok(()) => loaded += 1,
            Err(Error::NotFound(_)) => {}
            Err(err) => {
                log::warn!("failed to load plugin from {}: {}", path, err);
            }
        }
    }
    Ok(loaded)
}

// =============================================================================
// Tests
// =============================================================================
