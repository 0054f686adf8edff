//! Native dynamic libraries through `libloading`.

use std::path::Path;

use libloading::Library;

use super::{DynamicLibrary, EntryPoints, LibraryOpener};
use crate::module::{ModuleInfoFn, SetObjectCreatorFn, MODULE_INFO_SYMBOL, SET_OBJECT_CREATOR_SYMBOL};

/// Opens `.so` / `.dylib` / `.dll` files with the platform loader.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeOpener;

impl LibraryOpener for NativeOpener {
    fn open(&self, path: &Path) -> std::result::Result<Box<dyn DynamicLibrary>, String> {
        // SAFETY: loading runs the library's initialisers; modules are trusted.
        let library = unsafe { Library::new(path) }.map_err(|e| e.to_string())?;
        Ok(Box::new(NativeLibrary { library }))
    }
}

struct NativeLibrary {
    library: Library,
}

impl DynamicLibrary for NativeLibrary {
    fn entry_points(&self) -> EntryPoints {
        // SAFETY: the symbol types match what `export_module!` emits, provided
        // the module was built with the same toolchain and apf-core.
        let module_info = unsafe { self.library.get::<ModuleInfoFn>(MODULE_INFO_SYMBOL) }
            .map(|symbol| *symbol)
            .ok();
        let set_object_creator =
            unsafe { self.library.get::<SetObjectCreatorFn>(SET_OBJECT_CREATOR_SYMBOL) }
                .map(|symbol| *symbol)
                .ok();
        EntryPoints {
            module_info,
            set_object_creator,
        }
    }

    fn close(self: Box<Self>) -> std::result::Result<(), String> {
        self.library.close().map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("missing.{}", std::env::consts::DLL_EXTENSION));
        assert!(NativeOpener.open(&path).is_err());
    }
}
