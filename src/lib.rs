//! pyhook: drive an embedded CPython runtime from Rust.
//!
//! The crate boots an interpreter (via PyO3), extends `sys.path`, imports
//! modules by dotted name and calls `module.function(*args)` with native
//! arguments, converting results and exceptions back into Rust values and
//! [`Error`]s.
//!
//! - [`RuntimeHandle`]: lifecycle (`start`/`stop`), search paths, imports, calls
//! - [`CallDescriptor`]: one positional call
//! - [`NativeValue`] / [`NumericBuffer`]: owned values crossing the boundary
//! - [`Error`]: every Python failure, translated once at the call site
//!
//! ```no_run
//! use pyhook::{CallDescriptor, RuntimeHandle};
//!
//! let runtime = RuntimeHandle::new();
//! runtime.add_search_path("./python")?;
//! let sum = runtime.call(
//!     &CallDescriptor::new("numpy_ext.numpy_samples", "add_arrays")
//!         .arg(vec![1.0, 2.0, 3.0])
//!         .arg(vec![4.0, 5.0, 6.0]),
//! )?;
//! assert_eq!(sum.as_f64_vec(), Some(vec![5.0, 7.0, 9.0]));
//! # Ok::<(), pyhook::Error>(())
//! ```
//!
//! The `cdylib` build exposes the same operations through `pyhook_*` C
//! functions (see [`ffi`]).

pub mod config;
pub mod error;
pub mod ffi;
pub mod invoke;
pub mod marshal;
pub mod resolver;
pub mod runtime;
pub mod value;

pub use config::BridgeConfig;
pub use error::{CallSite, Error, ErrorKind, Result};
pub use invoke::CallDescriptor;
pub use resolver::ForeignHandle;
pub use runtime::RuntimeHandle;
pub use value::{BufferData, ElementType, NativeValue, NumericBuffer};
