//! Interpreter lifecycle and `sys.path` registration.
//!
//! A [`RuntimeHandle`] boots CPython on first use and finalizes it on an
//! explicit [`RuntimeHandle::stop`]. Start and stop are idempotent.
//!
//! **External discipline:** `start`/`stop` are not serialized against calls in
//! flight on other threads. Stop only after every thread that calls through
//! the handle has joined.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use pyo3::prelude::*;
use pyo3::types::PyList;

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::marshal::pyerr_to_string;

/// Serializes the "is an interpreter live? boot one" decision across handles.
static BOOT_LOCK: Mutex<()> = Mutex::new(());

/// Set once CPython has been finalized; it cannot be booted again.
static FINALIZED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Default)]
struct RuntimeState {
    initialized: bool,
    /// This handle booted the interpreter and is the one to finalize it.
    owns_interpreter: bool,
    search_path_root: Option<PathBuf>,
}

#[derive(Debug)]
pub struct RuntimeHandle {
    config: BridgeConfig,
    state: Mutex<RuntimeState>,
}

impl RuntimeHandle {
    /// A handle configured from the environment (see [`BridgeConfig::from_env`]).
    pub fn new() -> Self {
        Self::with_config(BridgeConfig::from_env())
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RuntimeState::default()),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Boot the interpreter if needed and register the configured paths.
    ///
    /// Repeated calls are no-ops. Fails if CPython cannot be brought up (which
    /// includes any start after the interpreter was finalized) or a configured
    /// path cannot be registered; the handle then stays unstarted.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state();
        if state.initialized {
            return Ok(());
        }
        // Ownership sticks across a failed start so a retry can still finalize.
        state.owns_interpreter |= boot_interpreter(self.config.promote_libpython)?;
        for path in self.config.startup_paths() {
            insert_search_path(path)?;
        }

        state.initialized = true;
        state.search_path_root = self.config.search_path_root.clone();
        log::debug!(
            "Python runtime started (owner: {}, root: {:?})",
            state.owns_interpreter,
            state.search_path_root
        );
        Ok(())
    }

    /// Tear the interpreter down if this handle booted it.
    ///
    /// Safe to call before `start` and more than once. A handle that attached
    /// to an interpreter someone else booted only marks itself stopped.
    pub fn stop(&self) {
        let mut state = self.state();
        if !state.initialized {
            log::debug!("stop on a runtime that is not started; nothing to do");
            return;
        }
        if state.owns_interpreter {
            finalize_interpreter();
        } else {
            log::warn!("handle does not own the interpreter; leaving it running");
        }
        *state = RuntimeState::default();
    }

    pub fn is_initialized(&self) -> bool {
        self.state().initialized
    }

    /// The root registered on start, if any.
    pub fn search_path_root(&self) -> Option<PathBuf> {
        self.state().search_path_root.clone()
    }

    /// Implicit start used by every operation that touches Python. Also
    /// catches handles still marked started after another handle finalized.
    pub(crate) fn ensure_started(&self) -> Result<()> {
        self.start()?;
        ensure_live()
    }

    /// Put `path` at the front of `sys.path` unless it is already present.
    pub fn add_search_path(&self, path: impl AsRef<Path>) -> Result<()> {
        self.ensure_started()?;
        insert_search_path(path.as_ref())
    }

    /// Snapshot of `sys.path`; non-string entries are skipped.
    pub fn search_paths(&self) -> Result<Vec<String>> {
        self.ensure_started()?;
        Python::with_gil(|py| {
            let entries = sys_path(py).map_err(|e| Error::SearchPath {
                path: String::new(),
                diagnostic: pyerr_to_string(py, e),
            })?;
            Ok(entries
                .iter()
                .filter_map(|entry| entry.extract::<String>().ok())
                .collect())
        })
    }
}

impl Default for RuntimeHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Fail fast instead of touching a finalized or never-booted interpreter.
pub(crate) fn ensure_live() -> Result<()> {
    if FINALIZED.load(Ordering::Acquire) {
        return Err(Error::boot("the Python runtime was finalized"));
    }
    // SAFETY: `Py_IsInitialized` may be called at any time, with or without the GIL.
    if unsafe { pyo3::ffi::Py_IsInitialized() } == 0 {
        return Err(Error::boot("the Python runtime is not started"));
    }
    Ok(())
}

/// Returns whether this call booted the interpreter.
fn boot_interpreter(promote_libpython: bool) -> Result<bool> {
    let _guard = BOOT_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    if FINALIZED.load(Ordering::Acquire) {
        return Err(Error::boot(
            "the Python runtime was finalized and cannot be restarted in this process",
        ));
    }
    // SAFETY: see `ensure_live`.
    if unsafe { pyo3::ffi::Py_IsInitialized() } != 0 {
        return Ok(false);
    }

    if promote_libpython {
        promote_libpython_symbols();
    }
    // Initializes without installing signal handlers and releases the GIL.
    pyo3::prepare_freethreaded_python();

    // SAFETY: see `ensure_live`.
    if unsafe { pyo3::ffi::Py_IsInitialized() } == 0 {
        return Err(Error::boot("Py_InitializeEx did not bring the interpreter up"));
    }
    Ok(true)
}

fn finalize_interpreter() {
    let _guard = BOOT_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    // SAFETY: the interpreter is live (we booted it and FINALIZED is unset).
    // The GIL is taken through the C API because pyo3's guard would try to
    // release it again after the interpreter is gone.
    let status = unsafe {
        pyo3::ffi::PyGILState_Ensure();
        pyo3::ffi::Py_FinalizeEx()
    };
    FINALIZED.store(true, Ordering::Release);
    if status < 0 {
        log::warn!("Py_FinalizeEx reported an error while flushing buffered data");
    }
    log::debug!("Python runtime finalized");
}

/// On Linux, make `libpython` symbols globally visible so C extensions
/// (NumPy, PyTorch) loaded later can resolve them.
#[cfg(target_os = "linux")]
fn promote_libpython_symbols() {
    use libc::{dlopen, RTLD_GLOBAL, RTLD_NOLOAD, RTLD_NOW};
    use std::os::raw::c_char;

    let candidates: &[&[u8]] = &[
        b"libpython3.so\0",
        b"libpython3.13.so\0",
        b"libpython3.12.so\0",
        b"libpython3.11.so\0",
        b"libpython3.10.so\0",
    ];
    for name in candidates {
        // SAFETY: every candidate is a null-terminated byte string.
        unsafe {
            let loaded = dlopen(name.as_ptr() as *const c_char, RTLD_NOW | RTLD_NOLOAD);
            if !loaded.is_null() {
                dlopen(name.as_ptr() as *const c_char, RTLD_NOW | RTLD_GLOBAL);
                let name = String::from_utf8_lossy(&name[..name.len() - 1]);
                log::debug!("promoted {name} to RTLD_GLOBAL");
                return;
            }
        }
    }
    log::warn!("no loaded libpython found to promote; C extensions may fail to import");
}

#[cfg(not(target_os = "linux"))]
fn promote_libpython_symbols() {}

fn sys_path<'py>(py: Python<'py>) -> PyResult<Bound<'py, PyList>> {
    let sys = py.import("sys")?;
    Ok(sys.getattr("path")?.downcast_into::<PyList>()?)
}

fn insert_search_path(path: &Path) -> Result<()> {
    ensure_live()?;
    let display = path.display().to_string();
    let path = path.to_str().ok_or_else(|| {
        Error::InvalidInput(format!("search path {display} is not valid UTF-8"))
    })?;

    Python::with_gil(|py| {
        let result: PyResult<bool> = (|| {
            let entries = sys_path(py)?;
            for entry in entries.iter() {
                if entry.extract::<String>().is_ok_and(|existing| existing == path) {
                    return Ok(false);
                }
            }
            entries.insert(0, path)?;
            Ok(true)
        })();
        match result {
            Ok(true) => {
                log::debug!("added {path} to sys.path");
                Ok(())
            }
            Ok(false) => {
                log::trace!("{path} already on sys.path");
                Ok(())
            }
            Err(e) => Err(Error::SearchPath {
                path: display,
                diagnostic: pyerr_to_string(py, e),
            }),
        }
    })
}
