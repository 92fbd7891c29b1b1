//! Module resolution and owned references to Python objects.

use pyo3::prelude::*;
use pyo3::types::PyTuple;

use crate::error::{CallSite, Error, Result};
use crate::marshal::{self, pyerr_to_string, MarshalError};
use crate::runtime::{ensure_live, RuntimeHandle};
use crate::value::NativeValue;

/// Import `name` (a dotted path). The GIL must be held.
pub(crate) fn import<'py>(py: Python<'py>, name: &str) -> PyResult<Bound<'py, PyModule>> {
    py.import(name)
}

impl RuntimeHandle {
    /// Import a module by dotted name.
    ///
    /// A returned handle always refers to a usable module; any failure during
    /// resolution (missing module, exception at import time) is
    /// [`Error::ModuleNotFound`].
    pub fn import_module(&self, name: &str) -> Result<ForeignHandle> {
        self.ensure_started()?;
        log::debug!("importing {name}");
        Python::with_gil(|py| {
            let module = import(py, name).map_err(|e| Error::ModuleNotFound {
                site: CallSite::module(name),
                diagnostic: pyerr_to_string(py, e),
            })?;
            Ok(ForeignHandle::new(module.into_any(), name))
        })
    }

    /// Whether `name` imports cleanly. Never fails.
    pub fn is_module_available(&self, name: &str) -> bool {
        match self.import_module(name) {
            Ok(_) => true,
            Err(err) => {
                log::debug!("{err}");
                false
            }
        }
    }
}

/// An owned reference to a Python object.
///
/// Every method takes the GIL for its own duration only. The handle must not
/// be used after the interpreter was stopped; methods then fail with
/// [`Error::RuntimeBoot`].
pub struct ForeignHandle {
    object: Py<PyAny>,
    label: String,
}

impl ForeignHandle {
    pub(crate) fn new(object: Bound<'_, PyAny>, label: impl Into<String>) -> Self {
        Self {
            object: object.unbind(),
            label: label.into(),
        }
    }

    /// `module` or `module.attr.attr`, as the handle was reached.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Run `f` against the object with the GIL held.
    pub fn with_bound<R>(&self, f: impl for<'py> FnOnce(&Bound<'py, PyAny>) -> R) -> Result<R> {
        ensure_live()?;
        Ok(Python::with_gil(|py| f(self.object.bind(py))))
    }

    pub fn getattr(&self, name: &str) -> Result<ForeignHandle> {
        ensure_live()?;
        Python::with_gil(|py| {
            let attr = self
                .object
                .bind(py)
                .getattr(name)
                .map_err(|e| Error::AttributeNotFound {
                    site: CallSite::function(self.label.as_str(), name),
                    diagnostic: pyerr_to_string(py, e),
                })?;
            Ok(ForeignHandle::new(attr, format!("{}.{name}", self.label)))
        })
    }

    /// Call the object positionally and convert the result.
    pub fn call(&self, args: &[NativeValue]) -> Result<NativeValue> {
        ensure_live()?;
        let site = CallSite::module(self.label.as_str());
        Python::with_gil(|py| {
            let args = marshal_args(py, args, &site)?;
            let result = self
                .object
                .bind(py)
                .call1(args)
                .map_err(|e| Error::ForeignExecution {
                    site: site.clone(),
                    diagnostic: pyerr_to_string(py, e),
                })?;
            convert_result(&result, &site)
        })
    }

    pub fn to_native(&self) -> Result<NativeValue> {
        ensure_live()?;
        let site = CallSite::module(self.label.as_str());
        Python::with_gil(|py| convert_result(self.object.bind(py), &site))
    }
}

impl std::fmt::Debug for ForeignHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForeignHandle")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Marshal positional arguments in order, naming the failing index.
pub(crate) fn marshal_args<'py>(
    py: Python<'py>,
    args: &[NativeValue],
    site: &CallSite,
) -> Result<Bound<'py, PyTuple>> {
    let converted = args
        .iter()
        .enumerate()
        .map(|(index, arg)| {
            marshal::to_foreign(py, arg).map_err(|err| match err {
                MarshalError::ShapeMismatch(detail) => Error::ShapeMismatch {
                    site: site.clone(),
                    index,
                    detail,
                },
                other => Error::ArgumentConversion {
                    site: site.clone(),
                    index,
                    detail: other.to_string(),
                },
            })
        })
        .collect::<Result<Vec<_>>>()?;
    PyTuple::new(py, converted).map_err(|e| Error::ArgumentConversion {
        site: site.clone(),
        index: 0,
        detail: pyerr_to_string(py, e),
    })
}

pub(crate) fn convert_result(result: &Bound<'_, PyAny>, site: &CallSite) -> Result<NativeValue> {
    marshal::from_foreign(result).map_err(|err| Error::ResultConversion {
        site: site.clone(),
        detail: err.to_string(),
    })
}
