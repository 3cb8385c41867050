//! Host API - the five GNU make entry points the bridge depends on
//!
//! Design: everything that touches make goes through the `Host` trait so the
//! bridge can run against a real make process (`GmkApi`) or an in-memory
//! stand-in (`MemoryHost`).
//!
//! Memory rule: a string handed to make is allocated with make's allocator
//! and freed by make. `HostString` owns such a buffer until `into_raw`
//! transfers it.

mod gmk;
mod memory;

pub use gmk::{GmkApi, GmkFloc, GmkFunc};
pub use memory::{CallRejected, MemoryHost};

use core::ptr::NonNull;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_uint};

use crate::errors::{BridgeError, MAX_FUNCTION_NAME};

/// `GMK_FUNC_NOEXPAND` from gnumake.h
pub const GMK_FUNC_NOEXPAND: c_uint = 0x01;
pub const GMK_FUNC_DEFAULT: c_uint = 0x00;

/// Result of handing text to make's evaluator.
///
/// Make handles evaluation errors (`$(error ...)`, syntax errors) by exiting.
/// A real make therefore only ever returns `Returned`; `Diverged` is how a
/// host that cannot exit reports that control would not have come back.
/// Code after an `eval` must not assume it runs.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    Returned,
    Diverged,
}

impl Evaluation {
    #[inline]
    pub fn diverged(self) -> bool {
        matches!(self, Self::Diverged)
    }
}

/// The build tool side of the bridge
pub trait Host: Send + Sync {
    /// Expose `descriptor` as a make function that dispatches into the bridge
    fn add_function(&self, descriptor: &FunctionDescriptor);

    /// Allocate `size` bytes with make's allocator. Null on failure.
    fn alloc(&self, size: usize) -> *mut c_char;

    /// Release a buffer obtained from `alloc` or `expand`
    ///
    /// # Safety
    /// `ptr` must come from this host and must not be used afterwards.
    unsafe fn free(&self, ptr: *mut c_char);

    /// Expand `text` by make's rules. The result is owned by the caller and
    /// may be null when make produced nothing.
    fn expand(&self, text: &CStr) -> *mut c_char;

    /// Evaluate `text` as makefile syntax, attributing errors to `location`
    fn eval(&self, text: &CStr, location: Option<&Location>) -> Evaluation;
}

/// A make function exported by the bridge. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDescriptor {
    name: CString,
    min_args: u8,
    max_args: u8,
    expand: bool,
}

impl FunctionDescriptor {
    /// Validate arity bounds, then the encoded name.
    pub fn new(
        name: Vec<u8>,
        min_args: i64,
        max_args: i64,
        expand: bool,
    ) -> Result<Self, BridgeError> {
        let (min_args, max_args) = validate_arity(min_args, max_args)?;

        if name.len() > MAX_FUNCTION_NAME {
            return Err(BridgeError::NameTooLong(name.len()));
        }
        let name = CString::new(name).map_err(|_| BridgeError::NulByte { what: "name" })?;

        Ok(Self {
            name,
            min_args,
            max_args,
            expand,
        })
    }

    pub fn name(&self) -> &CStr {
        &self.name
    }

    pub fn min_args(&self) -> u8 {
        self.min_args
    }

    /// Zero means unlimited
    pub fn max_args(&self) -> u8 {
        self.max_args
    }

    pub fn expands(&self) -> bool {
        self.expand
    }

    pub fn flags(&self) -> c_uint {
        if self.expand {
            GMK_FUNC_DEFAULT
        } else {
            GMK_FUNC_NOEXPAND
        }
    }

    /// Host-side arity check; the bridge itself never re-validates
    pub fn accepts(&self, argc: usize) -> bool {
        argc >= self.min_args as usize && (self.max_args == 0 || argc <= self.max_args as usize)
    }
}

/// Check `min_args <= 255`, `max_args <= 255`, and `max_args == 0 || max_args >= min_args`
pub fn validate_arity(min_args: i64, max_args: i64) -> Result<(u8, u8), BridgeError> {
    let invalid = || BridgeError::InvalidArity { min_args, max_args };

    let min = u8::try_from(min_args).map_err(|_| invalid())?;
    let max = u8::try_from(max_args).map_err(|_| invalid())?;

    if max != 0 && max < min {
        return Err(invalid());
    }

    Ok((min, max))
}

/// Makefile position used by make to attribute evaluation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub filename: CString,
    pub lineno: u64,
}

impl Location {
    /// Both parts or neither: one without the other is a contract error.
    pub fn from_parts(
        filename: Option<Vec<u8>>,
        lineno: Option<u64>,
    ) -> Result<Option<Self>, BridgeError> {
        match (filename, lineno) {
            (None, None) => Ok(None),
            (Some(filename), Some(lineno)) => {
                let filename = CString::new(filename)
                    .map_err(|_| BridgeError::NulByte { what: "filename" })?;
                Ok(Some(Self { filename, lineno }))
            }
            _ => Err(BridgeError::IncompleteLocation),
        }
    }
}

/// NUL-terminated buffer allocated by the host.
///
/// Freed through the host on drop unless ownership is handed back to make
/// with `into_raw`.
pub struct HostString<'h> {
    host: &'h dyn Host,
    ptr: NonNull<c_char>,
    len: usize,
}

impl<'h> HostString<'h> {
    /// Copy `bytes` into a host buffer and append the terminator.
    ///
    /// `None` when the host allocator fails.
    pub fn from_bytes(host: &'h dyn Host, bytes: &[u8]) -> Option<Self> {
        let ptr = NonNull::new(host.alloc(bytes.len() + 1))?;
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr() as *mut u8, bytes.len());
            *ptr.as_ptr().add(bytes.len()) = 0;
        }
        Some(Self {
            host,
            ptr,
            len: bytes.len(),
        })
    }

    /// Take ownership of a NUL-terminated buffer the host allocated.
    ///
    /// # Safety
    /// `ptr` must be null or a live, NUL-terminated allocation from `host`.
    pub unsafe fn from_raw(host: &'h dyn Host, ptr: *mut c_char) -> Option<Self> {
        let ptr = NonNull::new(ptr)?;
        let len = CStr::from_ptr(ptr.as_ptr()).to_bytes().len();
        Some(Self { host, ptr, len })
    }

    /// Expand `text` through the host; `None` when make produced no output.
    pub fn expand(host: &'h dyn Host, text: &CStr) -> Option<Self> {
        let raw = host.expand(text);
        unsafe { Self::from_raw(host, raw) }
    }

    /// Payload without the terminator. May contain interior NULs when built
    /// from a raw buffer; make stops reading at the first one.
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr() as *const u8, self.len) }
    }

    pub fn as_bytes_with_nul(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr() as *const u8, self.len + 1) }
    }

    /// The text make will read: up to the first NUL
    pub fn as_c_str(&self) -> &CStr {
        unsafe { CStr::from_ptr(self.ptr.as_ptr()) }
    }

    /// Hand the buffer to make, which will free it.
    pub fn into_raw(self) -> *mut c_char {
        let ptr = self.ptr.as_ptr();
        core::mem::forget(self);
        ptr
    }
}

impl Drop for HostString<'_> {
    fn drop(&mut self) {
        unsafe { self.host.free(self.ptr.as_ptr()) }
    }
}

impl core::fmt::Debug for HostString<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("HostString")
            .field(&String::from_utf8_lossy(self.as_bytes()))
            .finish()
    }
}
