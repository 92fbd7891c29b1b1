//! Conversion between [`NativeValue`] and Python objects.
//!
//! All functions take a `Python<'py>` token (or a `Bound<'py, _>`), so they can
//! only run with the GIL held. Numeric sequences travel to Python as shaped
//! buffers: a `numpy.ndarray` when NumPy is importable, a `memoryview`
//! otherwise. Buffers coming back are copied into Rust-owned storage.

use std::collections::BTreeMap;
use std::convert::Infallible;

use pyo3::buffer::PyBuffer;
use pyo3::prelude::*;
use pyo3::sync::GILOnceCell;
use pyo3::types::*;

use crate::value::{BufferData, BufferElement, ElementType, NativeValue, NumericBuffer};

/// Nesting limit for recursive conversions; guards self-referential lists.
const MAX_DEPTH: usize = 64;

#[derive(thiserror::Error, Debug)]
pub enum MarshalError {
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("unsupported value: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Foreign(String),
}

impl MarshalError {
    fn foreign(py: Python<'_>, err: PyErr) -> Self {
        MarshalError::Foreign(pyerr_to_string(py, err))
    }
}

// ==================== Python Error Formatting ====================

/// Convert a `PyErr` into a human-readable string, traceback first when
/// one is attached.
pub fn pyerr_to_string(py: Python<'_>, err: PyErr) -> String {
    let msg = format!("{err}");
    if let Some(tb) = err.traceback(py) {
        if let Ok(formatted) = tb.format() {
            return format!("{formatted}{msg}");
        }
    }
    msg
}

// ==================== NumPy probe ====================

static NUMPY: GILOnceCell<Option<Py<PyModule>>> = GILOnceCell::new();

/// The `numpy` module, probed once per process.
fn numpy(py: Python<'_>) -> Option<&Bound<'_, PyModule>> {
    NUMPY
        .get_or_init(py, || match py.import("numpy") {
            Ok(module) => Some(module.unbind()),
            Err(_) => {
                log::debug!("numpy not importable; buffers are passed as memoryview");
                None
            }
        })
        .as_ref()
        .map(|module| module.bind(py))
}

fn infallible<T>(result: Result<T, Infallible>) -> T {
    match result {
        Ok(value) => value,
        Err(never) => match never {},
    }
}

// ==================== Native → Python ====================

/// Convert a native value into a Python object.
pub fn to_foreign<'py>(
    py: Python<'py>,
    value: &NativeValue,
) -> Result<Bound<'py, PyAny>, MarshalError> {
    to_foreign_at(py, value, 0)
}

fn to_foreign_at<'py>(
    py: Python<'py>,
    value: &NativeValue,
    depth: usize,
) -> Result<Bound<'py, PyAny>, MarshalError> {
    if depth > MAX_DEPTH {
        return Err(MarshalError::Unsupported(format!(
            "nesting deeper than {MAX_DEPTH} levels"
        )));
    }
    let obj = match value {
        NativeValue::None => py.None().into_bound(py),
        NativeValue::Bool(b) => PyBool::new(py, *b).to_owned().into_any(),
        NativeValue::Int(i) => infallible(i.into_pyobject(py)).into_any(),
        NativeValue::Float(f) => PyFloat::new(py, *f).into_any(),
        NativeValue::Str(s) => PyString::new(py, s).into_any(),
        NativeValue::Buffer(buf) => buffer_to_foreign(py, buf)?,
        NativeValue::Sequence(items) => match numeric_layout(items)? {
            Some(buf) => {
                log::trace!("sequence of {} marshaled as {:?} buffer", items.len(), buf.shape());
                buffer_to_foreign(py, &buf)?
            }
            None => {
                let converted = items
                    .iter()
                    .map(|item| to_foreign_at(py, item, depth + 1))
                    .collect::<Result<Vec<_>, _>>()?;
                PyList::new(py, converted)
                    .map_err(|e| MarshalError::foreign(py, e))?
                    .into_any()
            }
        },
        NativeValue::Map(map) => {
            let dict = PyDict::new(py);
            for (key, item) in map {
                let item = to_foreign_at(py, item, depth + 1)?;
                dict.set_item(key, item)
                    .map_err(|e| MarshalError::foreign(py, e))?;
            }
            dict.into_any()
        }
    };
    Ok(obj)
}

/// Decide whether a sequence is a uniform numeric vector or matrix.
///
/// Returns `Ok(None)` for sequences that travel as plain lists: anything with
/// a row that is not a non-empty all-`Int` or all-`Float` sequence. Only a
/// sequence made entirely of numeric rows can fail, on unequal lengths or
/// differing element types.
fn numeric_layout(items: &[NativeValue]) -> Result<Option<NumericBuffer>, MarshalError> {
    if let Some(flat) = numeric_row(items) {
        return Ok(Some(flat));
    }
    let Some(rows) = items
        .iter()
        .map(|item| item.as_sequence().and_then(numeric_row))
        .collect::<Option<Vec<_>>>()
    else {
        return Ok(None);
    };
    let Some(first) = rows.first() else {
        return Ok(None);
    };
    let (element, cols) = (first.element(), first.len());

    let mut data = match element {
        ElementType::I64 => BufferData::I64(Vec::with_capacity(rows.len() * cols)),
        _ => BufferData::F64(Vec::with_capacity(rows.len() * cols)),
    };
    for (i, row) in rows.into_iter().enumerate() {
        if row.len() != cols {
            return Err(MarshalError::ShapeMismatch(format!(
                "row {i} has {} elements, expected {cols}",
                row.len()
            )));
        }
        match (&mut data, row.into_data()) {
            (BufferData::I64(out), BufferData::I64(r)) => out.extend(r),
            (BufferData::F64(out), BufferData::F64(r)) => out.extend(r),
            (_, other) => {
                return Err(MarshalError::Unsupported(format!(
                    "row {i} holds {} elements, expected {element}",
                    other.element()
                )))
            }
        }
    }
    let rows = data.len() / cols;
    NumericBuffer::new(vec![rows, cols], data).map(Some)
}

/// A non-empty run of all-`Int` or all-`Float` items as a 1-D buffer.
fn numeric_row(items: &[NativeValue]) -> Option<NumericBuffer> {
    match items.first()? {
        NativeValue::Int(_) => items
            .iter()
            .map(NativeValue::as_i64)
            .collect::<Option<Vec<_>>>()
            .map(NumericBuffer::from_vec),
        NativeValue::Float(_) => items
            .iter()
            .map(|item| match item {
                NativeValue::Float(f) => Some(*f),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .map(NumericBuffer::from_vec),
        _ => None,
    }
}

fn buffer_to_foreign<'py>(
    py: Python<'py>,
    buf: &NumericBuffer,
) -> Result<Bound<'py, PyAny>, MarshalError> {
    let err = |e| MarshalError::foreign(py, e);
    let format = buf.element().format();
    let bytes = PyBytes::new(py, &buf.data().to_ne_bytes());
    // Shaped casts must start from the byte view, not from another typed view.
    let raw = PyMemoryView::from(bytes.as_any()).map_err(err)?;
    let flat = raw.call_method1("cast", (format,)).map_err(err)?;

    if let Some(np) = numpy(py) {
        return np
            .call_method1("array", (flat,))
            .and_then(|array| array.call_method1("reshape", (buf.shape().to_vec(),)))
            .map_err(err);
    }
    match buf.shape() {
        [] => Ok(buf
            .get(&[])
            .map(|scalar| to_foreign(py, &scalar))
            .transpose()?
            .unwrap_or_else(|| py.None().into_bound(py))),
        // memoryview refuses zero-sized shapes; keep the flat empty view.
        shape if buf.is_empty() || shape.len() == 1 => Ok(flat),
        shape => raw
            .call_method1("cast", (format, shape.to_vec()))
            .map_err(err),
    }
}

// ==================== Python → Native ====================

/// Convert a Python object into an owned native value.
pub fn from_foreign(obj: &Bound<'_, PyAny>) -> Result<NativeValue, MarshalError> {
    from_foreign_at(obj, 0)
}

fn from_foreign_at(obj: &Bound<'_, PyAny>, depth: usize) -> Result<NativeValue, MarshalError> {
    let py = obj.py();
    if depth > MAX_DEPTH {
        return Err(MarshalError::Unsupported(format!(
            "nesting deeper than {MAX_DEPTH} levels"
        )));
    }
    if obj.is_none() {
        return Ok(NativeValue::None);
    }
    if let Ok(b) = obj.downcast::<PyBool>() {
        return Ok(NativeValue::Bool(b.is_true()));
    }
    if obj.is_instance_of::<PyInt>() {
        return obj
            .extract::<i64>()
            .map(NativeValue::Int)
            .map_err(|_| MarshalError::Unsupported(format!("integer {obj} does not fit in i64")));
    }
    if let Ok(f) = obj.downcast::<PyFloat>() {
        return Ok(NativeValue::Float(f.value()));
    }
    if let Ok(s) = obj.downcast::<PyString>() {
        return s
            .to_str()
            .map(|s| NativeValue::Str(s.to_owned()))
            .map_err(|e| MarshalError::foreign(py, e));
    }
    if let Ok(dict) = obj.downcast::<PyDict>() {
        let mut map = BTreeMap::new();
        for (key, item) in dict.iter() {
            let key = key.downcast::<PyString>().map_err(|_| {
                MarshalError::Unsupported(format!("dict key {key} is not a string"))
            })?;
            let key = key.to_str().map_err(|e| MarshalError::foreign(py, e))?;
            map.insert(key.to_owned(), from_foreign_at(&item, depth + 1)?);
        }
        return Ok(NativeValue::Map(map));
    }
    if supports_buffer(obj) {
        if let Some(buf) = buffer_from_foreign(obj)? {
            if buf.ndim() == 0 {
                return buf
                    .get(&[])
                    .ok_or_else(|| MarshalError::Unsupported("empty 0-d buffer".into()));
            }
            return Ok(NativeValue::Buffer(buf));
        }
        log::trace!("buffer of unsupported format, falling back to tolist()");
    }
    if let Ok(list) = obj.downcast::<PyList>() {
        return sequence_from_foreign(list.iter(), depth);
    }
    if let Ok(tuple) = obj.downcast::<PyTuple>() {
        return sequence_from_foreign(tuple.iter(), depth);
    }
    if obj.hasattr("tolist").unwrap_or(false) {
        let plain = obj
            .call_method0("tolist")
            .map_err(|e| MarshalError::foreign(py, e))?;
        return from_foreign_at(&plain, depth + 1);
    }
    if let Ok(seq) = obj.downcast::<PySequence>() {
        let items = seq
            .to_list()
            .map_err(|e| MarshalError::foreign(py, e))?;
        return sequence_from_foreign(items.iter(), depth);
    }
    let type_name = obj
        .get_type()
        .name()
        .map(|name| name.to_string())
        .unwrap_or_else(|_| "<unknown>".to_owned());
    Err(MarshalError::Unsupported(format!(
        "cannot convert Python {type_name} to a native value"
    )))
}

fn sequence_from_foreign<'py>(
    items: impl Iterator<Item = Bound<'py, PyAny>>,
    depth: usize,
) -> Result<NativeValue, MarshalError> {
    items
        .map(|item| from_foreign_at(&item, depth + 1))
        .collect::<Result<Vec<_>, _>>()
        .map(NativeValue::Sequence)
}

fn supports_buffer(obj: &Bound<'_, PyAny>) -> bool {
    // SAFETY: `obj` is a live object and the GIL is held through its token.
    unsafe { pyo3::ffi::PyObject_CheckBuffer(obj.as_ptr()) == 1 }
}

/// Copy a buffer-protocol object into a [`NumericBuffer`], `None` if its
/// element format is not one we carry.
fn buffer_from_foreign(obj: &Bound<'_, PyAny>) -> Result<Option<NumericBuffer>, MarshalError> {
    fn copy<T: BufferElement>(
        obj: &Bound<'_, PyAny>,
    ) -> Result<Option<NumericBuffer>, MarshalError> {
        let py = obj.py();
        let Ok(buf) = PyBuffer::<T>::get(obj) else {
            return Ok(None);
        };
        let shape = buf.shape().to_vec();
        let values = buf.to_vec(py).map_err(|e| MarshalError::foreign(py, e))?;
        buf.release(py);
        NumericBuffer::new(shape, T::wrap(values)).map(Some)
    }

    if let Some(buf) = copy::<f64>(obj)? {
        return Ok(Some(buf));
    }
    if let Some(buf) = copy::<f32>(obj)? {
        return Ok(Some(buf));
    }
    if let Some(buf) = copy::<i64>(obj)? {
        return Ok(Some(buf));
    }
    if let Some(buf) = copy::<i32>(obj)? {
        return Ok(Some(buf));
    }
    copy::<u8>(obj)
}
