//! Loading the vendor probe library and resolving its entry points.
//!
//! Two interchangeable loaders implement [`Loader`]:
//!
//! * [`NativeLoader`] talks to the host OS loader facility directly (`dlopen` with explicit
//!   flags on Unix, `LoadLibraryExW` on Windows).
//! * [`PortableLoader`] uses the platform independent [`libloading::Library`].
//!
//! Which one backs [`ActiveLoader`] is decided at build time: Windows targets and builds with
//! the `native-loader` feature use the native loader, everything else the portable one.

mod native;
mod portable;

pub use native::NativeLoader;
pub use portable::PortableLoader;

use std::path::{Path, PathBuf};

use crate::Error;

/// Capability interface over a dynamic loader.
pub trait Loader {
    /// Handle to a mapped library. Dropping it unmaps the library.
    type Library: Send + Sync;

    /// Maps the library at `path`.
    fn open(path: &Path) -> Result<Self::Library, Error>;

    /// Looks up `symbol` and returns a copy of it, typically a function pointer.
    ///
    /// # Safety
    ///
    /// `T` must match the actual type of the exported symbol, and the returned value must not
    /// be used after `library` has been closed.
    unsafe fn resolve<T: Copy>(library: &Self::Library, symbol: &'static str) -> Result<T, Error>;

    /// Unmaps the library. Failures are logged, there is nothing a caller could do about them.
    fn close(library: Self::Library);
}

/// The loader selected for this build.
#[cfg(any(windows, feature = "native-loader"))]
pub type ActiveLoader = NativeLoader;

/// The loader selected for this build.
#[cfg(not(any(windows, feature = "native-loader")))]
pub type ActiveLoader = PortableLoader;

/// Host platform families with distinct library install conventions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    /// Library found through the loader search order.
    Windows,
    /// Library under `/opt/SEGGER/JLink`.
    Linux,
    /// Library under `/Applications/SEGGER/JLink`.
    MacOs,
}

impl Platform {
    /// The platform this crate was compiled for.
    pub const fn host() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }

    fn library_file_name(self) -> &'static str {
        match self {
            Platform::Windows if cfg!(target_pointer_width = "32") => "JLinkARM.dll",
            Platform::Windows => "JLink_x64.dll",
            Platform::Linux => "libjlinkarm.so",
            Platform::MacOs => "libjlinkarm.dylib",
        }
    }

    fn install_dir(self) -> Option<&'static str> {
        match self {
            // The OS loader search order already covers the executable directory and PATH.
            Platform::Windows => None,
            Platform::Linux => Some("/opt/SEGGER/JLink"),
            Platform::MacOs => Some("/Applications/SEGGER/JLink"),
        }
    }
}

/// Picks the probe library path for `platform`.
///
/// A copy next to the executable (`exe_dir`) wins over the vendor install directory. On
/// Windows the bare file name is returned and resolved through the loader's search order.
pub fn resolve_library_path(
    platform: Platform,
    exe_dir: Option<&Path>,
    exists: impl Fn(&Path) -> bool,
) -> PathBuf {
    let file_name = platform.library_file_name();

    let Some(install_dir) = platform.install_dir() else {
        return PathBuf::from(file_name);
    };

    if let Some(local) = exe_dir.map(|dir| dir.join(file_name)) {
        if exists(&local) {
            return local;
        }
    }

    Path::new(install_dir).join(file_name)
}

/// Picks the probe library path for the running executable on the host platform.
pub fn library_path() -> PathBuf {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));

    let path = resolve_library_path(Platform::host(), exe_dir.as_deref(), Path::exists);
    tracing::debug!("Using probe library {}", path.display());
    path
}
