//! Production host: GNU make's exported `gmk_*` functions
//!
//! Resolved at runtime from the running make binary (`dlopen(NULL)`), so the
//! loadable object carries no link-time dependency on make.

use core::ffi::c_void;
use core::ptr::NonNull;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_uint, c_ulong};

use tracing::debug;

use super::{Evaluation, FunctionDescriptor, Host, Location};
use crate::errors::{BridgeError, SymbolError};

/// `gmk_func_ptr` from gnumake.h
pub type GmkFunc =
    unsafe extern "C" fn(name: *const c_char, argc: c_uint, argv: *mut *mut c_char) -> *mut c_char;

/// `gmk_floc` from gnumake.h
#[repr(C)]
pub struct GmkFloc {
    pub filenm: *const c_char,
    pub lineno: c_ulong,
}

type AddFunctionFn = unsafe extern "C" fn(*const c_char, GmkFunc, c_uint, c_uint, c_uint);
type AllocFn = unsafe extern "C" fn(c_uint) -> *mut c_char;
type FreeFn = unsafe extern "C" fn(*mut c_char);
type EvalFn = unsafe extern "C" fn(*const c_char, *const GmkFloc);
type ExpandFn = unsafe extern "C" fn(*const c_char) -> *mut c_char;

/// Resolved make API
#[derive(Clone, Copy)]
pub struct GmkApi {
    add_function: AddFunctionFn,
    alloc: AllocFn,
    free: FreeFn,
    eval: EvalFn,
    expand: ExpandFn,
    /// Entry point make calls for every function registered through this host
    dispatch: GmkFunc,
}

impl GmkApi {
    /// Resolve all five symbols from the current process.
    ///
    /// Fails on the first missing symbol; nothing is partially loaded.
    pub fn load(dispatch: GmkFunc) -> Result<Self, BridgeError> {
        let process = ProcessSymbols::open()?;

        unsafe {
            let api = Self {
                add_function: core::mem::transmute::<*mut c_void, AddFunctionFn>(
                    process.resolve("gmk_add_function")?,
                ),
                alloc: core::mem::transmute::<*mut c_void, AllocFn>(process.resolve("gmk_alloc")?),
                free: core::mem::transmute::<*mut c_void, FreeFn>(process.resolve("gmk_free")?),
                expand: core::mem::transmute::<*mut c_void, ExpandFn>(
                    process.resolve("gmk_expand")?,
                ),
                eval: core::mem::transmute::<*mut c_void, EvalFn>(process.resolve("gmk_eval")?),
                dispatch,
            };
            debug!(event = "host_loaded", "GNU make API resolved");
            Ok(api)
        }
    }
}

impl Host for GmkApi {
    fn add_function(&self, descriptor: &FunctionDescriptor) {
        unsafe {
            (self.add_function)(
                descriptor.name().as_ptr(),
                self.dispatch,
                descriptor.min_args() as c_uint,
                descriptor.max_args() as c_uint,
                descriptor.flags(),
            )
        }
    }

    fn alloc(&self, size: usize) -> *mut c_char {
        match c_uint::try_from(size) {
            Ok(size) => unsafe { (self.alloc)(size) },
            Err(_) => core::ptr::null_mut(),
        }
    }

    unsafe fn free(&self, ptr: *mut c_char) {
        (self.free)(ptr)
    }

    fn expand(&self, text: &CStr) -> *mut c_char {
        unsafe { (self.expand)(text.as_ptr()) }
    }

    fn eval(&self, text: &CStr, location: Option<&Location>) -> Evaluation {
        let floc = location.map(|loc| GmkFloc {
            filenm: loc.filename.as_ptr(),
            lineno: loc.lineno as c_ulong,
        });
        let floc_ptr = floc
            .as_ref()
            .map_or(core::ptr::null(), |f| f as *const GmkFloc);

        // On error make exits inside this call.
        unsafe { (self.eval)(text.as_ptr(), floc_ptr) };
        Evaluation::Returned
    }
}

/// Handle on the running program's own symbol table
struct ProcessSymbols {
    handle: NonNull<c_void>,
}

impl ProcessSymbols {
    fn open() -> Result<Self, BridgeError> {
        let handle = unsafe { libc::dlopen(core::ptr::null(), libc::RTLD_LAZY) };
        NonNull::new(handle)
            .map(|handle| Self { handle })
            .ok_or(BridgeError::HostUnavailable)
    }

    fn resolve(&self, name: &'static str) -> Result<*mut c_void, BridgeError> {
        let cname = CString::new(name).map_err(|_| BridgeError::Symbol {
            name,
            error: SymbolError::InvalidName,
        })?;

        let ptr = unsafe { libc::dlsym(self.handle.as_ptr(), cname.as_ptr()) };
        if ptr.is_null() {
            Err(BridgeError::Symbol {
                name,
                error: SymbolError::NotFound,
            })
        } else {
            Ok(ptr)
        }
    }
}

impl Drop for ProcessSymbols {
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.handle.as_ptr());
        }
    }
}
