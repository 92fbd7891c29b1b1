//! The generic `module.function(*args)` invoker.
//!
//! Every call follows the same contract:
//!
//! 1. Implicitly start the runtime
//! 2. Acquire the GIL (for this call only)
//! 3. Import the module, look up the function, marshal the arguments
//! 4. Call positionally and convert the result into an owned [`NativeValue`]
//! 5. On any Python exception: translate it to an [`Error`] naming the call site
//!
//! Every Python object created along the way is dropped before the GIL is
//! released, on success and failure alike.

use pyo3::prelude::*;

use crate::error::{CallSite, Error, Result};
use crate::marshal::pyerr_to_string;
use crate::resolver::{convert_result, import, marshal_args};
use crate::runtime::RuntimeHandle;
use crate::value::NativeValue;

/// `(module, function, args)` for one call. Arguments are positional only,
/// in the order the target function declares them.
#[derive(Debug, Clone, PartialEq)]
pub struct CallDescriptor {
    module: String,
    function: String,
    args: Vec<NativeValue>,
}

impl CallDescriptor {
    pub fn new(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            args: Vec::new(),
        }
    }

    /// Append one positional argument.
    pub fn arg(mut self, value: impl Into<NativeValue>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args(mut self, values: impl IntoIterator<Item = NativeValue>) -> Self {
        self.args.extend(values);
        self
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn arguments(&self) -> &[NativeValue] {
        &self.args
    }

    pub fn site(&self) -> CallSite {
        CallSite::function(self.module.as_str(), self.function.as_str())
    }
}

impl RuntimeHandle {
    /// Call `module.function(*args)` and convert the result.
    pub fn call(&self, descriptor: &CallDescriptor) -> Result<NativeValue> {
        self.ensure_started()?;
        let site = descriptor.site();
        log::debug!("calling {site} with {} argument(s)", descriptor.args.len());

        Python::with_gil(|py| {
            let module = import(py, &descriptor.module).map_err(|e| Error::ModuleNotFound {
                site: site.clone(),
                diagnostic: pyerr_to_string(py, e),
            })?;
            let function = module
                .getattr(descriptor.function.as_str())
                .map_err(|e| Error::AttributeNotFound {
                    site: site.clone(),
                    diagnostic: pyerr_to_string(py, e),
                })?;
            let args = marshal_args(py, &descriptor.args, &site)?;
            let result = function
                .call1(args)
                .map_err(|e| Error::ForeignExecution {
                    site: site.clone(),
                    diagnostic: pyerr_to_string(py, e),
                })?;
            convert_result(&result, &site)
        })
        .inspect_err(|err| log::debug!("{err}"))
    }

    /// Shorthand for [`RuntimeHandle::call`] without building a descriptor.
    pub fn call_with(
        &self,
        module: &str,
        function: &str,
        args: impl IntoIterator<Item = NativeValue>,
    ) -> Result<NativeValue> {
        self.call(&CallDescriptor::new(module, function).args(args))
    }

    /// Read a module attribute, e.g. `numpy.__version__`.
    pub fn get_attr(&self, module: &str, name: &str) -> Result<NativeValue> {
        self.ensure_started()?;
        let site = CallSite::function(module, name);
        Python::with_gil(|py| {
            let module = import(py, module).map_err(|e| Error::ModuleNotFound {
                site: site.clone(),
                diagnostic: pyerr_to_string(py, e),
            })?;
            let value = module
                .getattr(name)
                .map_err(|e| Error::AttributeNotFound {
                    site: site.clone(),
                    diagnostic: pyerr_to_string(py, e),
                })?;
            convert_result(&value, &site)
        })
    }
}
