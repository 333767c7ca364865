use std::path::Path;

#[cfg(unix)]
use libloading::os::unix::{Library, RTLD_LOCAL, RTLD_NOW};
#[cfg(windows)]
use libloading::os::windows::{Library, LOAD_WITH_ALTERED_SEARCH_PATH};

use super::Loader;
use crate::Error;

/// Loader backed directly by the host OS loader facility.
#[derive(Debug)]
pub struct NativeLoader;

impl Loader for NativeLoader {
    type Library = Library;

    fn open(path: &Path) -> Result<Library, Error> {
        // SAFETY: the J-Link library runs no initialisers with preconditions on load.
        #[cfg(unix)]
        let result = unsafe { Library::open(Some(path), RTLD_NOW | RTLD_LOCAL) };
        #[cfg(windows)]
        let result = unsafe { Library::load_with_flags(path, LOAD_WITH_ALTERED_SEARCH_PATH) };

        result.map_err(|source| Error::LoadFailure {
            name: path.display().to_string(),
            source,
        })
    }

    unsafe fn resolve<T: Copy>(library: &Library, symbol: &'static str) -> Result<T, Error> {
        let resolved = unsafe { library.get::<T>(symbol.as_bytes()) }
            .map_err(|source| Error::SymbolNotFound { symbol, source })?;
        Ok(*resolved)
    }

    fn close(library: Library) {
        if let Err(error) = library.close() {
            tracing::warn!("Failed to unload probe library: {error}");
        }
    }
}
