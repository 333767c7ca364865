use std::path::Path;

use libloading::Library;

use super::Loader;
use crate::Error;

/// Loader backed by the platform independent [`libloading::Library`].
#[derive(Debug)]
pub struct PortableLoader;

impl Loader for PortableLoader {
    type Library = Library;

    fn open(path: &Path) -> Result<Library, Error> {
        // SAFETY: the J-Link library runs no initialisers with preconditions on load.
        unsafe { Library::new(path) }.map_err(|source| Error::LoadFailure {
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
