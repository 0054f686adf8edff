//! Modules linked into the host binary, served under virtual paths.
//!
//! [`MemoryOpener`] maps paths to entry points so statically linked modules
//! go through the same load/negotiate/unload cycle as native libraries.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{DynamicLibrary, EntryPoints, LibraryOpener};

#[derive(Default)]
struct Table {
    modules: HashMap<PathBuf, EntryPoints>,
    open: HashSet<PathBuf>,
}

/// In-memory [`LibraryOpener`]. Clones share one table.
#[derive(Clone, Default)]
pub struct MemoryOpener {
    table: Arc<Mutex<Table>>,
}

impl MemoryOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `entry_points` under `path`.
    pub fn insert(&self, path: impl Into<PathBuf>, entry_points: EntryPoints) -> &Self {
        self.table.lock().modules.insert(path.into(), entry_points);
        self
    }

    /// Stop serving `path`. Already opened libraries stay usable.
    pub fn remove(&self, path: &Path) -> bool {
        self.table.lock().modules.remove(path).is_some()
    }

    /// Whether `path` is currently open.
    pub fn is_open(&self, path: &Path) -> bool {
        self.table.lock().open.contains(path)
    }
}

impl LibraryOpener for MemoryOpener {
    fn open(&self, path: &Path) -> std::result::Result<Box<dyn DynamicLibrary>, String> {
        let mut table = self.table.lock();
        let entry_points = table
            .modules
            .get(path)
            .copied()
            .ok_or_else(|| format!("no module registered at {}", path.display()))?;
        table.open.insert(path.to_path_buf());
        Ok(Box::new(MemoryLibrary {
            path: path.to_path_buf(),
            entry_points,
            table: self.table.clone(),
        }))
    }
}

struct MemoryLibrary {
    path: PathBuf,
    entry_points: EntryPoints,
    table: Arc<Mutex<Table>>,
}

impl DynamicLibrary for MemoryLibrary {
    fn entry_points(&self) -> EntryPoints {
        self.entry_points
    }

    fn close(self: Box<Self>) -> std::result::Result<(), String> {
        self.table.lock().open.remove(&self.path);
        Ok(())
    }
}
