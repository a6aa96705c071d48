//! Driver-side contract and the C entry points of driver modules.
//!
//! A driver is any type implementing [`Driver`]. Compiled into the host it is
//! registered with [`DriverRegistry::register`](crate::registry::DriverRegistry::register);
//! compiled as a `cdylib` it exports its entry points with [`export_driver!`].
//!
//! # Module ABI (version [`DRIVER_ABI_VERSION`])
//!
//! | Symbol | Signature |
//! |--------|-----------|
//! | `devsup_driver_abi_version` | `fn() -> u32` |
//! | `devsup_driver_name` | `fn() -> *const c_char` |
//! | `devsup_allocate_device` | `fn(instance: *const c_char, params_json: *const c_char) -> *mut c_void` |
//! | `devsup_deallocate_device` | `fn(device: *mut c_void)` |
//! | `devsup_install_dispatch` (optional) | `fn(dispatch: *const c_void) -> bool` |
//!
//! `devsup_allocate_device` returns a `Box<AllocationResult>` turned into a
//! raw pointer; the host takes ownership with [`allocation_from_raw`].
//! A successful result carries a `Box<dyn Device>` that travels back to the
//! module through `devsup_deallocate_device` as `Box<Box<dyn Device>>`.
//! Host and module must be built by the same compiler with the same
//! `devsup_core`, which the ABI version only partially guards.
//!
//! A module links its own copy of `tracing` and of every `devsup_core`
//! static, so its events do not reach the host's subscriber on their own.
//! Right after the ABI check the loader passes its current
//! `tracing::Dispatch` to `devsup_install_dispatch`, which makes it the
//! module's global default. A module that already installed a subscriber
//! keeps it, and none is passed while the host has no subscriber.

use crate::node::Node;
use devsup_common::error::DriverError;
use devsup_common::params::Parameters;
use std::ffi::c_char;
use std::sync::Arc;

#[doc(inline)]
pub use devsup_common::consts::DRIVER_ABI_VERSION;

/// A live device instance: the root of its node tree.
pub trait Device: Send + Sync + 'static {
    /// Root node, normally a port named after the instance.
    fn root(&self) -> &Arc<Node>;
}

/// A device type the registry can allocate by name.
pub trait Driver: Device + Sized {
    /// Registry key.
    const NAME: &'static str;

    /// Build an instance. The registry initializes the returned tree.
    fn allocate(instance: &str, parameters: &Parameters) -> Result<Self, DriverError>;
}

/// Allocation entry of a registered driver.
pub type AllocateFn =
    Arc<dyn Fn(&str, &Parameters) -> Result<Box<dyn Device>, DriverError> + Send + Sync>;

/// Deallocation entry of a registered driver.
pub type DeallocateFn = Arc<dyn Fn(Box<dyn Device>) + Send + Sync>;

/// Value crossing the allocate entry point.
pub type AllocationResult = Result<Box<dyn Device>, DriverError>;

/// `devsup_driver_abi_version`.
pub type AbiVersionEntry = unsafe extern "C" fn() -> u32;
/// `devsup_driver_name`.
pub type DriverNameEntry = unsafe extern "C" fn() -> *const c_char;
/// `devsup_allocate_device`.
pub type AllocateEntry =
    unsafe extern "C" fn(*const c_char, *const c_char) -> *mut std::ffi::c_void;
/// `devsup_deallocate_device`.
pub type DeallocateEntry = unsafe extern "C" fn(*mut std::ffi::c_void);
/// `devsup_install_dispatch`.
pub type InstallDispatchEntry = unsafe extern "C" fn(*const std::ffi::c_void) -> bool;

/// Helpers used by [`export_driver!`]. Not part of the stable API.
#[doc(hidden)]
pub mod ffi {
    use super::{AllocationResult, Device, Driver};
    use devsup_common::error::DriverError;
    use devsup_common::params::Parameters;
    use std::ffi::{CStr, c_char, c_void};

    /// Body of `devsup_allocate_device`.
    ///
    /// # Safety
    ///
    /// `instance` and `params_json` must be null or valid NUL-terminated strings.
    pub unsafe fn allocate<D: Driver>(instance: *const c_char, params_json: *const c_char) -> *mut c_void {
        let result: AllocationResult = (|| {
            // SAFETY: forwarded caller contract.
            let instance = unsafe { read_str(instance) }?;
            // SAFETY: forwarded caller contract.
            let json = unsafe { read_str(params_json) }?;
            let parameters: Parameters = if json.is_empty() {
                Parameters::new()
            } else {
                serde_json::from_str(json)
                    .map_err(|e| DriverError::new(format!("invalid parameters: {e}")))?
            };
            let device = D::allocate(instance, &parameters)?;
            Ok(Box::new(device) as Box<dyn Device>)
        })();
        Box::into_raw(Box::new(result)).cast()
    }

    /// Body of `devsup_deallocate_device`.
    ///
    /// # Safety
    ///
    /// `device` must come from [`super::into_raw_device`] and not be used again.
    pub unsafe fn deallocate(device: *mut c_void) {
        if !device.is_null() {
            // SAFETY: pointer produced by Box::into_raw on a Box<Box<dyn Device>>.
            drop(unsafe { Box::from_raw(device.cast::<Box<dyn Device>>()) });
        }
    }

    /// Body of `devsup_install_dispatch`. False if this copy of `tracing`
    /// already has a global default.
    ///
    /// # Safety
    ///
    /// `dispatch` must point to a live `tracing::Dispatch` from a host built
    /// with the same `tracing`.
    pub unsafe fn install_dispatch(dispatch: *const c_void) -> bool {
        if dispatch.is_null() {
            return false;
        }
        // SAFETY: forwarded caller contract; only borrowed for the clone.
        let dispatch = unsafe { &*dispatch.cast::<tracing::Dispatch>() }.clone();
        tracing::dispatcher::set_global_default(dispatch).is_ok()
    }

    unsafe fn read_str<'a>(ptr: *const c_char) -> Result<&'a str, DriverError> {
        if ptr.is_null() {
            return Ok("");
        }
        // SAFETY: caller guarantees a valid NUL-terminated string.
        unsafe { CStr::from_ptr(ptr) }
            .to_str()
            .map_err(|e| DriverError::new(format!("argument is not UTF-8: {e}")))
    }
}

/// Take ownership of the value returned by `devsup_allocate_device`.
///
/// # Safety
///
/// `raw` must be a non-null pointer returned by an allocate entry point of
/// a module built against the same ABI, and must not be reused.
pub unsafe fn allocation_from_raw(raw: *mut std::ffi::c_void) -> AllocationResult {
    // SAFETY: see function contract.
    *unsafe { Box::from_raw(raw.cast::<AllocationResult>()) }
}

/// Hand a device back across the deallocate entry point.
pub fn into_raw_device(device: Box<dyn Device>) -> *mut std::ffi::c_void {
    Box::into_raw(Box::new(device)).cast()
}

/// Export the module entry points for a [`Driver`] type.
///
/// ```rust,ignore
/// devsup_core::export_driver!(Thermometer);
/// ```
#[macro_export]
macro_rules! export_driver {
    ($driver:ty) => {
        #[doc(hidden)]
        #[unsafe(no_mangle)]
        pub extern "C" fn devsup_driver_abi_version() -> u32 {
            $crate::driver::DRIVER_ABI_VERSION
        }

        #[doc(hidden)]
        #[unsafe(no_mangle)]
        pub extern "C" fn devsup_driver_name() -> *const ::std::ffi::c_char {
            static NAME: ::std::sync::OnceLock<::std::ffi::CString> = ::std::sync::OnceLock::new();
            NAME.get_or_init(|| {
                ::std::ffi::CString::new(<$driver as $crate::driver::Driver>::NAME)
                    .unwrap_or_default()
            })
            .as_ptr()
        }

        #[doc(hidden)]
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn devsup_allocate_device(
            instance: *const ::std::ffi::c_char,
            params_json: *const ::std::ffi::c_char,
        ) -> *mut ::std::ffi::c_void {
            // SAFETY: the host passes NUL-terminated strings.
            unsafe { $crate::driver::ffi::allocate::<$driver>(instance, params_json) }
        }

        #[doc(hidden)]
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn devsup_deallocate_device(device: *mut ::std::ffi::c_void) {
            // SAFETY: the host passes back what allocate handed out.
            unsafe { $crate::driver::ffi::deallocate(device) }
        }

        #[doc(hidden)]
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn devsup_install_dispatch(dispatch: *const ::std::ffi::c_void) -> bool {
            // SAFETY: the host passes its own live dispatcher.
            unsafe { $crate::driver::ffi::install_dispatch(dispatch) }
        }
    };
}
