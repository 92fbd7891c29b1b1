//! Error translation for the bridge.
//!
//! Every Python exception that surfaces while importing, looking up or calling
//! something is caught at the call site and turned into an [`Error`] carrying
//! the call site and the Python diagnostic. Nothing raised by Python reaches a
//! caller as a `PyErr`.
//!
//! The C ABI keeps a thread-local "last error" slot: every
//! `pyhook_*` function clears it on entry and fills it on failure.

use std::cell::RefCell;
use std::ffi::CString;
use std::fmt;
use std::os::raw::c_char;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// `module` or `module.function`, used to label errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    pub module: String,
    pub function: Option<String>,
}

impl CallSite {
    pub fn module(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            function: None,
        }
    }

    pub fn function(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            function: Some(function.into()),
        }
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function {
            Some(function) => write!(f, "{}.{}", self.module, function),
            None => f.write_str(&self.module),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The interpreter could not be booted, or was already finalized.
    #[error("Failed to start Python runtime: {reason}")]
    RuntimeBoot { reason: String },

    #[error("Failed to import {site}: {diagnostic}")]
    ModuleNotFound { site: CallSite, diagnostic: String },

    #[error("Failed to get attribute {site}: {diagnostic}")]
    AttributeNotFound { site: CallSite, diagnostic: String },

    #[error("Failed to call {site}: argument {index}: {detail}")]
    ArgumentConversion {
        site: CallSite,
        index: usize,
        detail: String,
    },

    #[error("Failed to call {site}: argument {index}: {detail}")]
    ShapeMismatch {
        site: CallSite,
        index: usize,
        detail: String,
    },

    /// Raised inside the called function's own logic.
    #[error("Failed to call {site}: {diagnostic}")]
    ForeignExecution { site: CallSite, diagnostic: String },

    #[error("Failed to add Python path {path}: {diagnostic}")]
    SearchPath { path: String, diagnostic: String },

    #[error("Failed to convert result of {site}: {detail}")]
    ResultConversion { site: CallSite, detail: String },

    /// Malformed input at the C ABI or CLI boundary (null pointers, bad JSON).
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Fieldless discriminant of [`Error`], stable across the C ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorKind {
    RuntimeBoot = 1,
    ModuleNotFound = 2,
    AttributeNotFound = 3,
    ArgumentConversion = 4,
    ShapeMismatch = 5,
    ForeignExecution = 6,
    ResultConversion = 7,
    InvalidInput = 8,
}

impl ErrorKind {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::RuntimeBoot { .. } => ErrorKind::RuntimeBoot,
            Error::ModuleNotFound { .. } => ErrorKind::ModuleNotFound,
            Error::AttributeNotFound { .. } => ErrorKind::AttributeNotFound,
            Error::ArgumentConversion { .. } => ErrorKind::ArgumentConversion,
            Error::ShapeMismatch { .. } => ErrorKind::ShapeMismatch,
            Error::ForeignExecution { .. } | Error::SearchPath { .. } => {
                ErrorKind::ForeignExecution
            }
            Error::ResultConversion { .. } => ErrorKind::ResultConversion,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }

    /// Only a failed boot is unrecoverable; everything else may be retried
    /// with different inputs.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::RuntimeBoot
    }

    pub(crate) fn boot(reason: impl Into<String>) -> Self {
        Error::RuntimeBoot {
            reason: reason.into(),
        }
    }
}

// ==================== C ABI last-error slot ====================

struct LastError {
    message: CString,
    kind: ErrorKind,
}

thread_local! {
    static LAST_ERROR: RefCell<Option<LastError>> = const { RefCell::new(None) };
}

/// Store an error in thread-local storage for `pyhook_last_error()`.
pub fn set_last_error(err: &Error) {
    let message = CString::new(err.to_string())
        .unwrap_or_else(|_| CString::from(c"<error message contains null byte>"));
    LAST_ERROR.with(|cell| {
        *cell.borrow_mut() = Some(LastError {
            message,
            kind: err.kind(),
        });
    });
}

pub fn clear_last_error() {
    LAST_ERROR.with(|cell| {
        *cell.borrow_mut() = None;
    });
}

/// Message of the last error on this thread, or null if none.
///
/// The pointer stays valid until the next `pyhook_*` call on this thread.
/// Do NOT free it.
#[no_mangle]
pub extern "C" fn pyhook_last_error() -> *const c_char {
    LAST_ERROR.with(|cell| {
        cell.borrow()
            .as_ref()
            .map_or(std::ptr::null(), |last| last.message.as_ptr())
    })
}

/// [`ErrorKind`] code of the last error on this thread, `0` if none.
#[no_mangle]
pub extern "C" fn pyhook_last_error_kind() -> i32 {
    LAST_ERROR.with(|cell| cell.borrow().as_ref().map_or(0, |last| last.kind.code()))
}

#[no_mangle]
pub extern "C" fn pyhook_last_error_clear() {
    clear_last_error();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    #[test]
    fn call_site_renders_module_and_function() {
        assert_eq!(CallSite::module("numpy").to_string(), "numpy");
        assert_eq!(
            CallSite::function("pkg.mod", "add").to_string(),
            "pkg.mod.add"
        );
    }

    #[test]
    fn messages_name_operation_site_and_diagnostic() {
        let err = Error::ModuleNotFound {
            site: CallSite::function("missing", "f"),
            diagnostic: "ModuleNotFoundError: No module named 'missing'".into(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to import missing.f: ModuleNotFoundError: No module named 'missing'"
        );

        let err = Error::AttributeNotFound {
            site: CallSite::function("math", "nope"),
            diagnostic: "AttributeError: nope".into(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to get attribute math.nope: AttributeError: nope"
        );

        let err = Error::ForeignExecution {
            site: CallSite::function("m", "f"),
            diagnostic: "ValueError: bad".into(),
        };
        assert_eq!(err.to_string(), "Failed to call m.f: ValueError: bad");
    }

    #[test]
    fn search_path_failures_count_as_foreign_execution() {
        let err = Error::SearchPath {
            path: "/x".into(),
            diagnostic: "boom".into(),
        };
        assert_eq!(err.kind(), ErrorKind::ForeignExecution);
        assert!(!err.is_fatal());
        assert!(Error::boot("no").is_fatal());
    }

    #[test]
    fn last_error_slot_round_trips() {
        clear_last_error();
        assert!(pyhook_last_error().is_null());
        assert_eq!(pyhook_last_error_kind(), 0);

        set_last_error(&Error::InvalidInput("null module name".into()));
        let msg = unsafe { CStr::from_ptr(pyhook_last_error()) };
        assert_eq!(msg.to_str().unwrap(), "Invalid input: null module name");
        assert_eq!(pyhook_last_error_kind(), ErrorKind::InvalidInput.code());

        pyhook_last_error_clear();
        assert!(pyhook_last_error().is_null());
    }
}
