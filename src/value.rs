//! Native values exchanged with the Python runtime.
//!
//! [`NativeValue`] owns all of its data. Numeric buffers are copied out of
//! Python at marshal time, so a value never points into memory the
//! interpreter may reclaim.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::marshal::MarshalError;

/// Element type of a [`NumericBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    F64,
    F32,
    I64,
    I32,
    U8,
}

impl ElementType {
    /// `struct`-module format character used for the buffer protocol.
    pub fn format(self) -> &'static str {
        match self {
            ElementType::F64 => "d",
            ElementType::F32 => "f",
            ElementType::I64 => "q",
            ElementType::I32 => "i",
            ElementType::U8 => "B",
        }
    }

    pub fn size(self) -> usize {
        match self {
            ElementType::F64 | ElementType::I64 => 8,
            ElementType::F32 | ElementType::I32 => 4,
            ElementType::U8 => 1,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::F64 => "f64",
            ElementType::F32 => "f32",
            ElementType::I64 => "i64",
            ElementType::I32 => "i32",
            ElementType::U8 => "u8",
        };
        f.write_str(name)
    }
}

/// Flat, row-major element storage.
#[derive(Debug, Clone, PartialEq)]
pub enum BufferData {
    F64(Vec<f64>),
    F32(Vec<f32>),
    I64(Vec<i64>),
    I32(Vec<i32>),
    U8(Vec<u8>),
}

impl BufferData {
    pub fn element(&self) -> ElementType {
        match self {
            BufferData::F64(_) => ElementType::F64,
            BufferData::F32(_) => ElementType::F32,
            BufferData::I64(_) => ElementType::I64,
            BufferData::I32(_) => ElementType::I32,
            BufferData::U8(_) => ElementType::U8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            BufferData::F64(v) => v.len(),
            BufferData::F32(v) => v.len(),
            BufferData::I64(v) => v.len(),
            BufferData::I32(v) => v.len(),
            BufferData::U8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get_f64(&self, offset: usize) -> Option<f64> {
        match self {
            BufferData::F64(v) => v.get(offset).copied(),
            BufferData::F32(v) => v.get(offset).map(|&x| f64::from(x)),
            BufferData::I64(v) => v.get(offset).map(|&x| x as f64),
            BufferData::I32(v) => v.get(offset).map(|&x| f64::from(x)),
            BufferData::U8(v) => v.get(offset).map(|&x| f64::from(x)),
        }
    }

    /// Element at `offset` as a scalar value of its own type.
    fn scalar(&self, offset: usize) -> Option<NativeValue> {
        match self {
            BufferData::F64(v) => v.get(offset).map(|&x| NativeValue::Float(x)),
            BufferData::F32(v) => v.get(offset).map(|&x| NativeValue::Float(f64::from(x))),
            BufferData::I64(v) => v.get(offset).map(|&x| NativeValue::Int(x)),
            BufferData::I32(v) => v.get(offset).map(|&x| NativeValue::Int(i64::from(x))),
            BufferData::U8(v) => v.get(offset).map(|&x| NativeValue::Int(i64::from(x))),
        }
    }

    fn slice(&self, start: usize, end: usize) -> BufferData {
        match self {
            BufferData::F64(v) => BufferData::F64(v[start..end].to_vec()),
            BufferData::F32(v) => BufferData::F32(v[start..end].to_vec()),
            BufferData::I64(v) => BufferData::I64(v[start..end].to_vec()),
            BufferData::I32(v) => BufferData::I32(v[start..end].to_vec()),
            BufferData::U8(v) => BufferData::U8(v[start..end].to_vec()),
        }
    }

    /// Native-endian bytes, the layout the buffer protocol expects.
    pub(crate) fn to_ne_bytes(&self) -> Vec<u8> {
        match self {
            BufferData::F64(v) => v.iter().flat_map(|x| x.to_ne_bytes()).collect(),
            BufferData::F32(v) => v.iter().flat_map(|x| x.to_ne_bytes()).collect(),
            BufferData::I64(v) => v.iter().flat_map(|x| x.to_ne_bytes()).collect(),
            BufferData::I32(v) => v.iter().flat_map(|x| x.to_ne_bytes()).collect(),
            BufferData::U8(v) => v.clone(),
        }
    }
}

/// Rust element types that can back a [`NumericBuffer`].
pub trait BufferElement: Copy + pyo3::buffer::Element {
    const ELEMENT: ElementType;
    fn wrap(values: Vec<Self>) -> BufferData;
    fn unwrap(data: &BufferData) -> Option<&[Self]>;
}

macro_rules! buffer_element {
    ($ty:ty, $variant:ident) => {
        impl BufferElement for $ty {
            const ELEMENT: ElementType = ElementType::$variant;

            fn wrap(values: Vec<Self>) -> BufferData {
                BufferData::$variant(values)
            }

            fn unwrap(data: &BufferData) -> Option<&[Self]> {
                match data {
                    BufferData::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

buffer_element!(f64, F64);
buffer_element!(f32, F32);
buffer_element!(i64, I64);
buffer_element!(i32, I32);
buffer_element!(u8, U8);

/// A dense numeric array with an explicit row-major shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BufferRepr", into = "BufferRepr")]
pub struct NumericBuffer {
    shape: Vec<usize>,
    data: BufferData,
}

impl NumericBuffer {
    pub fn new(shape: Vec<usize>, data: BufferData) -> Result<Self, MarshalError> {
        let Some(expected) = shape.iter().try_fold(1usize, |n, &dim| n.checked_mul(dim)) else {
            return Err(MarshalError::ShapeMismatch(format!(
                "shape {shape:?} has more elements than fit in memory"
            )));
        };
        if expected != data.len() {
            return Err(MarshalError::ShapeMismatch(format!(
                "shape {shape:?} needs {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// One-dimensional buffer over `values`.
    pub fn from_vec<T: BufferElement>(values: Vec<T>) -> Self {
        Self {
            shape: vec![values.len()],
            data: T::wrap(values),
        }
    }

    /// Two-dimensional buffer, one row per element of `rows`.
    pub fn from_rows<T: BufferElement>(rows: &[Vec<T>]) -> Result<Self, MarshalError> {
        let cols = rows.first().map_or(0, Vec::len);
        let mut flat = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != cols {
                return Err(MarshalError::ShapeMismatch(format!(
                    "row {i} has {} elements, expected {cols}",
                    row.len()
                )));
            }
            flat.extend_from_slice(row);
        }
        Ok(Self {
            shape: vec![rows.len(), cols],
            data: T::wrap(flat),
        })
    }

    pub fn element(&self) -> ElementType {
        self.data.element()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &BufferData {
        &self.data
    }

    pub fn into_data(self) -> BufferData {
        self.data
    }

    /// Typed view of the flat storage, `None` if `T` is not the element type.
    pub fn as_slice<T: BufferElement>(&self) -> Option<&[T]> {
        T::unwrap(&self.data)
    }

    /// Row-major flat offset of a multi-dimensional index.
    pub fn offset(&self, index: &[usize]) -> Option<usize> {
        if index.len() != self.shape.len() {
            return None;
        }
        let mut offset: usize = 0;
        for (&i, &dim) in index.iter().zip(&self.shape) {
            if i >= dim {
                return None;
            }
            offset = offset.checked_mul(dim)?.checked_add(i)?;
        }
        Some(offset)
    }

    pub fn get(&self, index: &[usize]) -> Option<NativeValue> {
        self.data.scalar(self.offset(index)?)
    }

    pub fn get_f64(&self, index: &[usize]) -> Option<f64> {
        self.data.get_f64(self.offset(index)?)
    }

    /// Row `i` of a 2-D buffer as a 1-D buffer.
    pub fn row(&self, i: usize) -> Option<NumericBuffer> {
        let [rows, cols] = self.shape[..] else {
            return None;
        };
        if i >= rows {
            return None;
        }
        Some(Self {
            shape: vec![cols],
            data: self.data.slice(i * cols, (i + 1) * cols),
        })
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        (0..self.len()).filter_map(|i| self.data.get_f64(i)).collect()
    }

    /// Rows of a 2-D buffer widened to `f64`.
    pub fn to_f64_rows(&self) -> Option<Vec<Vec<f64>>> {
        let [rows, _] = self.shape[..] else {
            return None;
        };
        (0..rows).map(|i| self.row(i).map(|r| r.to_f64_vec())).collect()
    }
}

/// Serialized form: `{"dtype": "f64", "shape": [2, 2], "data": [...]}`.
#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct BufferRepr {
    dtype: ElementType,
    shape: Vec<usize>,
    data: Vec<serde_json::Value>,
}

impl From<NumericBuffer> for BufferRepr {
    fn from(buf: NumericBuffer) -> Self {
        let dtype = buf.element();
        let data = match buf.data {
            BufferData::F64(v) => v.into_iter().map(serde_json::Value::from).collect(),
            BufferData::F32(v) => v
                .into_iter()
                .map(|x| serde_json::Value::from(f64::from(x)))
                .collect(),
            BufferData::I64(v) => v.into_iter().map(serde_json::Value::from).collect(),
            BufferData::I32(v) => v.into_iter().map(serde_json::Value::from).collect(),
            BufferData::U8(v) => v.into_iter().map(serde_json::Value::from).collect(),
        };
        Self {
            dtype,
            shape: buf.shape,
            data,
        }
    }
}

impl TryFrom<BufferRepr> for NumericBuffer {
    type Error = MarshalError;

    fn try_from(repr: BufferRepr) -> Result<Self, Self::Error> {
        fn each<T>(
            values: &[serde_json::Value],
            f: impl Fn(&serde_json::Value) -> Option<T>,
        ) -> Result<Vec<T>, MarshalError> {
            values
                .iter()
                .map(|v| {
                    f(v).ok_or_else(|| MarshalError::Unsupported(format!("bad element {v}")))
                })
                .collect()
        }

        // `null` stands in for NaN, which JSON cannot carry.
        let float = |v: &serde_json::Value| match v {
            serde_json::Value::Null => Some(f64::NAN),
            other => other.as_f64(),
        };
        let data = match repr.dtype {
            ElementType::F64 => BufferData::F64(each(&repr.data, float)?),
            ElementType::F32 => BufferData::F32(each(&repr.data, |v| float(v).map(|x| x as f32))?),
            ElementType::I64 => BufferData::I64(each(&repr.data, serde_json::Value::as_i64)?),
            ElementType::I32 => BufferData::I32(each(&repr.data, |v| {
                v.as_i64().and_then(|x| i32::try_from(x).ok())
            })?),
            ElementType::U8 => BufferData::U8(each(&repr.data, |v| {
                v.as_u64().and_then(|x| u8::try_from(x).ok())
            })?),
        };
        NumericBuffer::new(repr.shape, data)
    }
}

/// A value in Rust's own terms, used for both arguments and results.
///
/// Serializes to plain JSON; buffers use the `{"dtype", "shape", "data"}`
/// object form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NativeValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Buffer(NumericBuffer),
    Sequence(Vec<NativeValue>),
    Map(BTreeMap<String, NativeValue>),
}

impl NativeValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            NativeValue::None => "none",
            NativeValue::Bool(_) => "bool",
            NativeValue::Int(_) => "int",
            NativeValue::Float(_) => "float",
            NativeValue::Str(_) => "str",
            NativeValue::Buffer(_) => "buffer",
            NativeValue::Sequence(_) => "sequence",
            NativeValue::Map(_) => "map",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, NativeValue::None)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            NativeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            NativeValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Integers widen; floats pass through.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            NativeValue::Int(i) => Some(*i as f64),
            NativeValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            NativeValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, NativeValue>> {
        match self {
            NativeValue::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[NativeValue]> {
        match self {
            NativeValue::Sequence(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&NumericBuffer> {
        match self {
            NativeValue::Buffer(buf) => Some(buf),
            _ => None,
        }
    }

    /// Lookup in a map value.
    pub fn get(&self, key: &str) -> Option<&NativeValue> {
        self.as_map()?.get(key)
    }

    /// Flat numbers from a 1-D buffer or a sequence of numbers.
    pub fn as_f64_vec(&self) -> Option<Vec<f64>> {
        match self {
            NativeValue::Buffer(buf) if buf.ndim() == 1 => Some(buf.to_f64_vec()),
            NativeValue::Sequence(items) => items.iter().map(NativeValue::as_f64).collect(),
            _ => None,
        }
    }

    /// Rows of numbers from a 2-D buffer or a sequence of numeric sequences.
    pub fn as_f64_rows(&self) -> Option<Vec<Vec<f64>>> {
        match self {
            NativeValue::Buffer(buf) => buf.to_f64_rows(),
            NativeValue::Sequence(rows) => rows.iter().map(NativeValue::as_f64_vec).collect(),
            _ => None,
        }
    }
}

impl From<bool> for NativeValue {
    fn from(b: bool) -> Self {
        NativeValue::Bool(b)
    }
}

impl From<i64> for NativeValue {
    fn from(i: i64) -> Self {
        NativeValue::Int(i)
    }
}

impl From<i32> for NativeValue {
    fn from(i: i32) -> Self {
        NativeValue::Int(i64::from(i))
    }
}

impl From<u32> for NativeValue {
    fn from(i: u32) -> Self {
        NativeValue::Int(i64::from(i))
    }
}

impl From<f64> for NativeValue {
    fn from(f: f64) -> Self {
        NativeValue::Float(f)
    }
}

impl From<&str> for NativeValue {
    fn from(s: &str) -> Self {
        NativeValue::Str(s.to_owned())
    }
}

impl From<String> for NativeValue {
    fn from(s: String) -> Self {
        NativeValue::Str(s)
    }
}

impl From<NumericBuffer> for NativeValue {
    fn from(buf: NumericBuffer) -> Self {
        NativeValue::Buffer(buf)
    }
}

impl From<BTreeMap<String, NativeValue>> for NativeValue {
    fn from(map: BTreeMap<String, NativeValue>) -> Self {
        NativeValue::Map(map)
    }
}

impl<T: Into<NativeValue>> From<Vec<T>> for NativeValue {
    fn from(items: Vec<T>) -> Self {
        NativeValue::Sequence(items.into_iter().map(Into::into).collect())
    }
}

/// `None` becomes the Python `None`; there is no sentinel encoding.
impl<T: Into<NativeValue>> From<Option<T>> for NativeValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(NativeValue::None, Into::into)
    }
}

impl fmt::Display for NativeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "<{}>", self.type_name()),
        }
    }
}
