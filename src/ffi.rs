//! C ABI exports for non-Rust hosts.
//!
//! Every `pyhook_*` function follows this contract:
//!
//! 1. Clears the last error
//! 2. Runs the operation on the process-wide [`RuntimeHandle`]
//! 3. On error: stores the message and kind via `set_last_error`, returns a sentinel
//! 4. On success: returns the result
//!
//! **Sentinel values:**
//! - Status functions (`-> i32`): `-1` means error, `0` means success
//! - String functions (`-> cstr`): `""` means error (check `pyhook_last_error`)
//!
//! **Memory:**
//! - Returned `cstr` pointers use a TLS buffer, valid until the next
//!   string-returning `pyhook_*` call on the same thread. Copy before reuse.
//! - Values cross the boundary as JSON (see [`NativeValue`]'s serde form).

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::sync::OnceLock;

use crate::error::{clear_last_error, set_last_error, Error, Result};
use crate::invoke::CallDescriptor;
use crate::runtime::RuntimeHandle;
use crate::value::NativeValue;

static RUNTIME: OnceLock<RuntimeHandle> = OnceLock::new();

/// The handle behind the C ABI, configured from the environment.
pub fn runtime() -> &'static RuntimeHandle {
    RUNTIME.get_or_init(RuntimeHandle::new)
}

// ==================== TLS String Buffer ====================

thread_local! {
    static RETURN_BUF: RefCell<CString> = RefCell::new(CString::default());
}

/// Store a string in the TLS buffer and return a pointer to it.
fn set_return_str(s: String) -> *const c_char {
    RETURN_BUF.with(|cell| {
        let cstr = CString::new(s)
            .unwrap_or_else(|_| CString::from(c"<string contains null byte>"));
        *cell.borrow_mut() = cstr;
        cell.borrow().as_ptr()
    })
}

// ==================== Internal Helpers ====================

/// Read a C string argument.
///
/// # Safety
/// `ptr` must be null or valid and null-terminated.
unsafe fn arg_str<'a>(ptr: *const c_char, what: &str) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(Error::InvalidInput(format!("null {what}")));
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|e| Error::InvalidInput(format!("{what} is not valid UTF-8: {e}")))
}

/// Run `f`, return status (0=ok, -1=error).
fn status(f: impl FnOnce() -> Result<()>) -> i32 {
    clear_last_error();
    match f() {
        Ok(()) => 0,
        Err(e) => {
            set_last_error(&e);
            -1
        }
    }
}

/// Run `f`, return 1/0 for true/false, -1 on error.
fn flag(f: impl FnOnce() -> Result<bool>) -> i32 {
    clear_last_error();
    match f() {
        Ok(b) => i32::from(b),
        Err(e) => {
            set_last_error(&e);
            -1
        }
    }
}

/// Run `f`, return its string via the TLS buffer ("" on error).
fn string(f: impl FnOnce() -> Result<String>) -> *const c_char {
    clear_last_error();
    match f() {
        Ok(s) => set_return_str(s),
        Err(e) => {
            set_last_error(&e);
            set_return_str(String::new())
        }
    }
}

fn parse_args(json: Option<&str>) -> Result<Vec<NativeValue>> {
    match json.map(str::trim) {
        None | Some("") => Ok(Vec::new()),
        Some(json) => serde_json::from_str::<Vec<NativeValue>>(json)
            .map_err(|e| Error::InvalidInput(format!("arguments must be a JSON array: {e}"))),
    }
}

// ==================== Lifecycle ====================

/// Start the embedded interpreter. Idempotent.
#[no_mangle]
pub extern "C" fn pyhook_init() -> i32 {
    status(|| runtime().start())
}

/// Finalize the interpreter. Only after every calling thread has joined.
#[no_mangle]
pub extern "C" fn pyhook_finalize() {
    clear_last_error();
    runtime().stop();
}

#[no_mangle]
pub extern "C" fn pyhook_is_initialized() -> i32 {
    i32::from(runtime().is_initialized())
}

// ==================== Paths & Modules ====================

/// Put a directory at the front of `sys.path` (no-op if present).
///
/// # Safety
/// `path` must be null or a valid null-terminated string.
#[no_mangle]
pub unsafe extern "C" fn pyhook_add_search_path(path: *const c_char) -> i32 {
    status(|| {
        let path = unsafe { arg_str(path, "path") }?;
        runtime().add_search_path(path)
    })
}

/// `1` if the module imports, `0` if not, `-1` on bad input.
///
/// # Safety
/// `module` must be null or a valid null-terminated string.
#[no_mangle]
pub unsafe extern "C" fn pyhook_module_available(module: *const c_char) -> i32 {
    flag(|| {
        let module = unsafe { arg_str(module, "module name") }?;
        Ok(runtime().is_module_available(module))
    })
}

// ==================== Calls ====================

/// Call `module.function(*args)`; `args_json` is a JSON array (or null for
/// no arguments). Returns the JSON-encoded result via the TLS buffer.
///
/// # Safety
/// All pointers must be null or valid null-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn pyhook_call_json(
    module: *const c_char,
    function: *const c_char,
    args_json: *const c_char,
) -> *const c_char {
    string(|| {
        let module = unsafe { arg_str(module, "module name") }?;
        let function = unsafe { arg_str(function, "function name") }?;
        let args = if args_json.is_null() {
            None
        } else {
            Some(unsafe { arg_str(args_json, "arguments") }?)
        };
        let call = CallDescriptor::new(module, function).args(parse_args(args)?);
        let result = runtime().call(&call)?;
        serde_json::to_string(&result).map_err(|e| Error::ResultConversion {
            site: call.site(),
            detail: e.to_string(),
        })
    })
}
