//! Bridge configuration: where to find script modules.

use std::ffi::OsString;
use std::path::PathBuf;

/// Run-time override for the script root.
pub const PYTHON_PATH_ENV: &str = "PYHOOK_PYTHON_PATH";

/// Script root baked in by `build.rs` from `PYHOOK_DEFAULT_PYTHON_PATH`.
pub const DEFAULT_PYTHON_PATH: Option<&str> = option_env!("PYHOOK_DEFAULT_PYTHON_PATH");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Registered first on start; reported by `RuntimeHandle::search_path_root`.
    pub search_path_root: Option<PathBuf>,
    /// Registered after the root, in order. Each goes to the front of
    /// `sys.path`, so later entries take priority over earlier ones and
    /// over the root.
    pub extra_paths: Vec<PathBuf>,
    /// Re-open `libpython` with `RTLD_GLOBAL` before booting (Linux only).
    pub promote_libpython: bool,
}

impl BridgeConfig {
    /// No search paths at all; imports rely on the interpreter's defaults.
    pub fn empty() -> Self {
        Self {
            search_path_root: None,
            extra_paths: Vec::new(),
            promote_libpython: true,
        }
    }

    /// `PYHOOK_PYTHON_PATH` wins over the compile-time default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var_os(key))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<OsString>) -> Self {
        let root = lookup(PYTHON_PATH_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .or_else(|| DEFAULT_PYTHON_PATH.map(PathBuf::from));
        Self {
            search_path_root: root,
            ..Self::empty()
        }
    }

    pub fn with_search_path_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.search_path_root = Some(root.into());
        self
    }

    pub fn with_extra_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.extra_paths.push(path.into());
        self
    }

    pub fn with_promote_libpython(mut self, promote: bool) -> Self {
        self.promote_libpython = promote;
        self
    }

    /// Every path registered on start, in registration order (root first).
    pub fn startup_paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.search_path_root.iter().chain(&self.extra_paths)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
