//! Loading driver modules from shared libraries.
//!
//! ```text
//! search path ──► scan_directory ──► lib*.so ──► DriverModule::load
//!                                                   │ dlopen(RTLD_NOW)
//!                                                   │ dlsym × 4   ─ missing ─► DriverMissingRegistrationExports
//!                                                   │ abi_version ─ differs ─► IncompatibleAbi
//!                                                   │ install_dispatch (if exported)
//!                                                   ▼
//!                                      (name, AllocateFn, DeallocateFn)
//! ```
//!
//! The allocate/deallocate closures keep the library mapped; it is unloaded
//! once the driver is unregistered and its last instance is gone.

use crate::driver::{
    AbiVersionEntry, AllocateEntry, AllocateFn, DeallocateEntry, DeallocateFn, Device,
    DriverNameEntry, InstallDispatchEntry, allocation_from_raw, into_raw_device,
};
use devsup_common::consts::{DRIVER_ABI_VERSION, DRIVER_SYMBOLS, SYMBOL_INSTALL_DISPATCH};
use devsup_common::error::{DriverError, FactoryError};
use devsup_common::params::Parameters;
use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::ffi::{CStr, CString, c_void};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::debug;

// ─── Shared library handle ──────────────────────────────────────────

/// An open shared library, closed on drop.
#[derive(Debug)]
pub struct DynamicModule {
    handle: NonNull<c_void>,
    path: PathBuf,
}

// SAFETY: dlopen handles are process-global and the dl* functions are thread-safe.
unsafe impl Send for DynamicModule {}
// SAFETY: see above; the handle is never mutated after open.
unsafe impl Sync for DynamicModule {}

impl DynamicModule {
    /// `dlopen` the library with `RTLD_NOW | RTLD_LOCAL`.
    pub fn open(path: &Path) -> Result<Self, FactoryError> {
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            FactoryError::ModuleLoadFailed {
                path: path.to_path_buf(),
                reason: "path contains a NUL byte".to_string(),
            }
        })?;
        // SAFETY: c_path is a valid NUL-terminated string.
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        let handle = NonNull::new(handle).ok_or_else(|| FactoryError::ModuleLoadFailed {
            path: path.to_path_buf(),
            reason: last_dl_error(),
        })?;
        debug!(path = %path.display(), "module opened");
        Ok(Self {
            handle,
            path: path.to_path_buf(),
        })
    }

    /// Address of an exported symbol.
    pub fn symbol(&self, name: &str) -> Option<NonNull<c_void>> {
        let name = CString::new(name).ok()?;
        // SAFETY: handle is open; name is NUL-terminated.
        NonNull::new(unsafe { libc::dlsym(self.handle.as_ptr(), name.as_ptr()) })
    }

    /// Path the library was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DynamicModule {
    fn drop(&mut self) {
        // SAFETY: handle came from dlopen and is closed exactly once.
        unsafe {
            libc::dlclose(self.handle.as_ptr());
        }
        debug!(path = %self.path.display(), "module closed");
    }
}

fn last_dl_error() -> String {
    // SAFETY: dlerror returns null or a thread-local NUL-terminated string.
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        "unknown dynamic loader error".to_string()
    } else {
        // SAFETY: checked non-null above.
        unsafe { CStr::from_ptr(message) }
            .to_string_lossy()
            .into_owned()
    }
}

// ─── Driver module ──────────────────────────────────────────────────

/// A loaded and ABI-checked driver module.
pub struct DriverModule {
    library: Arc<DynamicModule>,
    name: String,
    allocate: AllocateEntry,
    deallocate: DeallocateEntry,
}

impl DriverModule {
    /// Open `path` and resolve every driver entry point.
    ///
    /// # Errors
    ///
    /// - `ModuleLoadFailed` if the library cannot be opened or names no driver
    /// - `DriverMissingRegistrationExports` naming the first absent symbol
    /// - `IncompatibleAbi` if the module was built for another ABI version
    pub fn load(path: &Path) -> Result<Self, FactoryError> {
        let library = DynamicModule::open(path)?;

        let mut entries = [std::ptr::null_mut::<c_void>(); DRIVER_SYMBOLS.len()];
        for (entry, symbol) in entries.iter_mut().zip(DRIVER_SYMBOLS) {
            *entry = library
                .symbol(symbol)
                .ok_or_else(|| FactoryError::DriverMissingRegistrationExports {
                    path: path.to_path_buf(),
                    symbol,
                })?
                .as_ptr();
        }
        let [abi_version, driver_name, allocate, deallocate] = entries;

        // SAFETY: symbols exported by export_driver! with these signatures.
        let (abi_version, driver_name, allocate, deallocate) = unsafe {
            (
                std::mem::transmute::<*mut c_void, AbiVersionEntry>(abi_version),
                std::mem::transmute::<*mut c_void, DriverNameEntry>(driver_name),
                std::mem::transmute::<*mut c_void, AllocateEntry>(allocate),
                std::mem::transmute::<*mut c_void, DeallocateEntry>(deallocate),
            )
        };

        // SAFETY: entry point takes no arguments.
        let found = unsafe { abi_version() };
        if found != DRIVER_ABI_VERSION {
            return Err(FactoryError::IncompatibleAbi {
                path: path.to_path_buf(),
                found,
                expected: DRIVER_ABI_VERSION,
            });
        }

        share_dispatcher(&library);

        // SAFETY: entry point returns a static NUL-terminated string or null.
        let name_ptr = unsafe { driver_name() };
        let name = if name_ptr.is_null() {
            String::new()
        } else {
            // SAFETY: checked non-null; the string lives as long as the library.
            unsafe { CStr::from_ptr(name_ptr) }
                .to_string_lossy()
                .into_owned()
        };
        if name.is_empty() {
            return Err(FactoryError::ModuleLoadFailed {
                path: path.to_path_buf(),
                reason: "module exports an empty driver name".to_string(),
            });
        }

        Ok(Self {
            library: Arc::new(library),
            name,
            allocate,
            deallocate,
        })
    }

    /// Driver name exported by the module.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Library path.
    pub fn path(&self) -> &Path {
        self.library.path()
    }

    /// Split into registry entries. Both closures keep the library mapped.
    pub fn into_entries(self) -> (String, AllocateFn, DeallocateFn, Arc<DynamicModule>) {
        let Self {
            library,
            name,
            allocate,
            deallocate,
        } = self;

        let mapped = library.clone();
        let allocate_fn: AllocateFn = Arc::new(move |instance: &str, parameters: &Parameters| {
            let _mapped = &mapped;
            let instance = CString::new(instance)
                .map_err(|_| DriverError::new("instance name contains a NUL byte"))?;
            let json = serde_json::to_string(parameters)
                .map_err(|e| DriverError::new(format!("cannot encode parameters: {e}")))?;
            let json = CString::new(json)
                .map_err(|_| DriverError::new("parameters contain a NUL byte"))?;
            // SAFETY: both arguments are valid C strings for the duration of the call.
            let raw = unsafe { allocate(instance.as_ptr(), json.as_ptr()) };
            if raw.is_null() {
                return Err(DriverError::new("allocate entry point returned null"));
            }
            // SAFETY: raw was produced by the module's allocate entry point.
            unsafe { allocation_from_raw(raw) }
        });

        let mapped = library.clone();
        let deallocate_fn: DeallocateFn = Arc::new(move |device: Box<dyn Device>| {
            let _mapped = &mapped;
            // SAFETY: the device was allocated by this module and is released once.
            unsafe { deallocate(into_raw_device(device)) }
        });

        (name, allocate_fn, deallocate_fn, library)
    }
}

/// Hand the calling thread's log dispatcher to a module exporting
/// `devsup_install_dispatch`.
fn share_dispatcher(library: &DynamicModule) {
    let Some(symbol) = library.symbol(SYMBOL_INSTALL_DISPATCH) else {
        return;
    };
    let dispatch = tracing::dispatcher::get_default(|d| d.clone());
    if dispatch.is::<tracing::subscriber::NoSubscriber>() {
        return;
    }
    // SAFETY: symbol exported by export_driver! with this signature.
    let install = unsafe {
        std::mem::transmute::<*mut c_void, InstallDispatchEntry>(symbol.as_ptr())
    };
    // SAFETY: dispatch outlives the call; the module clones what it keeps.
    let installed = unsafe { install((&raw const dispatch).cast()) };
    debug!(path = %library.path().display(), installed, "log dispatcher shared");
}

impl std::fmt::Debug for DriverModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverModule")
            .field("name", &self.name)
            .field("path", &self.library.path())
            .finish()
    }
}

// ─── Search paths ───────────────────────────────────────────────────

/// True for `lib*.so` (platform prefix and suffix) files.
pub fn is_driver_library(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| {
            n.len() > DLL_PREFIX.len() + DLL_SUFFIX.len()
                && n.starts_with(DLL_PREFIX)
                && n.ends_with(DLL_SUFFIX)
        })
}

/// Library file name a driver is looked up under, e.g. `libthermo.so`.
pub fn candidate_file_name(driver: &str) -> String {
    format!("{DLL_PREFIX}{driver}{DLL_SUFFIX}")
}

/// Driver libraries directly inside `dir`, sorted by path.
///
/// # Errors
///
/// `DirectoryNotFound` if `dir` is not a readable directory.
pub fn scan_directory(dir: &Path) -> Result<Vec<PathBuf>, FactoryError> {
    let entries =
        std::fs::read_dir(dir).map_err(|_| FactoryError::DirectoryNotFound(dir.to_path_buf()))?;
    let mut found: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_driver_library(path))
        .collect();
    found.sort();
    Ok(found)
}

/// Split a search-path list. Entries are separated by `:`, `;` or
/// whitespace; double quotes protect separators inside an entry.
pub fn split_search_paths(list: &str) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in list.chars() {
        match c {
            '"' => quoted = !quoted,
            ':' | ';' if !quoted => push_entry(&mut paths, &mut current),
            c if c.is_whitespace() && !quoted => push_entry(&mut paths, &mut current),
            c => current.push(c),
        }
    }
    push_entry(&mut paths, &mut current);
    paths
}

fn push_entry(paths: &mut Vec<PathBuf>, current: &mut String) {
    if !current.is_empty() {
        paths.push(PathBuf::from(std::mem::take(current)));
    }
}
