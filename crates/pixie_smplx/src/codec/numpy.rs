//! Rebuilds numpy arrays from decoded pickle values and writes ``float64``
//! arrays back in the layout numpy itself pickles.
use super::{pickle::Value, pickle_writer::PickleWriter};
use log::debug;
use ndarray as nd;
use ndarray::ShapeBuilder;
use thiserror::Error;

const MULTIARRAY_MODULES: [&str; 2] = ["numpy.core.multiarray", "numpy._core.multiarray"];
const NUMERIC_MODULES: [&str; 2] = ["numpy.core.numeric", "numpy._core.numeric"];

#[derive(Debug, Error)]
pub enum NumpyError {
    #[error("malformed array state: {0}")]
    BadState(&'static str),
    #[error("malformed dtype: {0}")]
    BadDType(String),
    #[error("array data holds {found} bytes, shape and dtype need {expected}")]
    ByteCount { expected: usize, found: usize },
    #[error("array data is a string with characters outside latin-1")]
    NotLatin1,
    #[error("object array element is {0}, expected a number")]
    NonNumericElement(&'static str),
    #[error("shape {0:?} does not match the data")]
    Shape(Vec<usize>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalarKind {
    Float,
    Int,
    UInt,
    Bool,
    Object,
}

/// Element type of an array, as far as numeric decoding cares
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DType {
    pub kind: ScalarKind,
    pub size: usize,
    pub order: ByteOrder,
}

impl DType {
    /// Parses a type code such as ``f8``, ``<i4`` or ``b1``. Returns None for
    /// kinds that have no numeric meaning (strings, complex, datetimes, ...).
    pub fn parse(code: &str) -> Option<Self> {
        let (order, rest) = match code.as_bytes().first()? {
            b'<' | b'=' | b'|' => (ByteOrder::Little, &code[1..]),
            b'>' | b'!' => (ByteOrder::Big, &code[1..]),
            _ => (ByteOrder::Little, code),
        };
        let mut chars = rest.chars();
        let kind_char = chars.next()?;
        let size_str = chars.as_str();
        let size = if size_str.is_empty() { None } else { Some(size_str.parse::<usize>().ok()?) };
        let (kind, size) = match (kind_char, size) {
            ('f', Some(s @ (2 | 4 | 8))) => (ScalarKind::Float, s),
            ('d', None) => (ScalarKind::Float, 8),
            ('i', Some(s @ (1 | 2 | 4 | 8))) => (ScalarKind::Int, s),
            ('u', Some(s @ (1 | 2 | 4 | 8))) => (ScalarKind::UInt, s),
            ('b', Some(1)) | ('?', None) => (ScalarKind::Bool, 1),
            ('O', _) => (ScalarKind::Object, 8),
            _ => return None,
        };
        Some(Self { kind, size, order })
    }

    /// Reads a pickled ``numpy.dtype(code, align, copy)`` object. The byte
    /// order lives in the second entry of the build state.
    /// # Errors
    /// Will return an error if the value is not a dtype object
    pub fn from_value(value: &Value) -> Result<Option<Self>, NumpyError> {
        let Value::Object { callable, args, state } = value else {
            return Err(NumpyError::BadDType(format!("expected a dtype object, found {}", value.kind())));
        };
        if !callable.is_global("numpy", "dtype") {
            return Err(NumpyError::BadDType(format!("unexpected constructor {callable:?}")));
        }
        let code = match args.as_ref() {
            Value::Tuple(items) => items.first().and_then(Value::as_str),
            _ => None,
        }
        .ok_or_else(|| NumpyError::BadDType("missing type code".to_string()))?;
        let Some(mut dtype) = Self::parse(code) else {
            debug!("dtype `{code}` has no numeric decoding");
            return Ok(None);
        };
        if let Some(Value::Tuple(items)) = state.as_deref() {
            match items.get(1).and_then(Value::as_str) {
                Some(">" | "!") => dtype.order = ByteOrder::Big,
                Some("<" | "=" | "|") | None => dtype.order = ByteOrder::Little,
                Some(other) => return Err(NumpyError::BadDType(format!("unknown byte order `{other}`"))),
            }
        }
        Ok(Some(dtype))
    }

    /// Callers check that ``raw`` holds a whole number of elements
    #[allow(clippy::cast_precision_loss)]
    fn decode(&self, raw: &[u8]) -> Result<Vec<f64>, NumpyError> {
        if self.kind == ScalarKind::Object {
            return Err(NumpyError::BadState("object arrays carry a list, not raw bytes"));
        }
        let values = raw
            .chunks_exact(self.size)
            .map(|chunk| {
                let mut buf = [0u8; 8];
                match self.order {
                    ByteOrder::Little => buf[..self.size].copy_from_slice(chunk),
                    ByteOrder::Big => {
                        for (dst, src) in buf.iter_mut().zip(chunk.iter().rev()) {
                            *dst = *src;
                        }
                    }
                }
                let unsigned = u64::from_le_bytes(buf);
                match (self.kind, self.size) {
                    (ScalarKind::Float, 2) => half_to_f64(unsigned as u16),
                    (ScalarKind::Float, 4) => f64::from(f32::from_bits(unsigned as u32)),
                    (ScalarKind::Float, _) => f64::from_bits(unsigned),
                    (ScalarKind::Int, size) => {
                        // sign extend from the element width
                        let shift = 64 - 8 * size as u32;
                        (((unsigned << shift) as i64) >> shift) as f64
                    }
                    (ScalarKind::Bool, _) => f64::from(u8::from(unsigned != 0)),
                    (ScalarKind::UInt | ScalarKind::Object, _) => unsigned as f64,
                }
            })
            .collect();
        Ok(values)
    }
}

/// IEEE 754 binary16 to f64
fn half_to_f64(bits: u16) -> f64 {
    let sign = if bits & 0x8000 == 0 { 1.0 } else { -1.0 };
    let exponent = i32::from((bits >> 10) & 0x1f);
    let mantissa = f64::from(bits & 0x3ff);
    match exponent {
        0 => sign * mantissa * 2f64.powi(-24),
        0x1f if mantissa == 0.0 => sign * f64::INFINITY,
        0x1f => f64::NAN,
        _ => sign * (1.0 + mantissa / 1024.0) * 2f64.powi(exponent - 15),
    }
}

/// Turns a decoded pickle value into an ``f64`` array when it holds numbers:
/// numpy arrays and scalars, Python numbers and rectangular (nested) lists of
/// numbers. Anything else gives ``Ok(None)``.
/// # Errors
/// Will return an error if the value is a numpy array whose state cannot be
/// decoded
pub fn value_to_array(value: &Value) -> Result<Option<nd::ArrayD<f64>>, NumpyError> {
    match value {
        Value::Object { callable, args, state } => {
            if MULTIARRAY_MODULES.iter().any(|m| callable.is_global(m, "_reconstruct")) {
                let state = state.as_deref().ok_or(NumpyError::BadState("ndarray without state"))?;
                return ndarray_from_state(state);
            }
            if MULTIARRAY_MODULES.iter().any(|m| callable.is_global(m, "scalar")) {
                return scalar_from_args(args);
            }
            if NUMERIC_MODULES.iter().any(|m| callable.is_global(m, "_frombuffer")) {
                return ndarray_from_buffer_args(args);
            }
            Ok(None)
        }
        _ => Ok(nested_numbers(value).and_then(|(shape, data)| nd::ArrayD::from_shape_vec(nd::IxDyn(&shape), data).ok())),
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Float(f) => Some(*f),
        #[allow(clippy::cast_precision_loss)]
        Value::Int(i) => Some(*i as f64),
        Value::Bool(b) => Some(f64::from(u8::from(*b))),
        _ => None,
    }
}

/// Shape and row-major values of a rectangular nest of lists/tuples
fn nested_numbers(value: &Value) -> Option<(Vec<usize>, Vec<f64>)> {
    if let Some(x) = number(value) {
        return Some((Vec::new(), vec![x]));
    }
    let items = match value {
        Value::List(items) | Value::Tuple(items) => items,
        _ => return None,
    };
    let mut data = Vec::new();
    let mut inner: Option<Vec<usize>> = None;
    for item in items {
        let (shape, values) = nested_numbers(item)?;
        match &inner {
            Some(expected) if *expected != shape => return None,
            Some(_) => {}
            None => inner = Some(shape),
        }
        data.extend(values);
    }
    let mut shape = vec![items.len()];
    shape.extend(inner.unwrap_or_default());
    Some((shape, data))
}

fn shape_from_value(value: &Value) -> Result<Vec<usize>, NumpyError> {
    let Value::Tuple(dims) = value else {
        return Err(NumpyError::BadState("shape is not a tuple"));
    };
    dims.iter()
        .map(|d| match d {
            Value::Int(n) => usize::try_from(*n).map_err(|_| NumpyError::BadState("negative dimension")),
            _ => Err(NumpyError::BadState("dimension is not an integer")),
        })
        .collect()
}

/// Raw element bytes, which older pickles store as a latin-1 string
fn raw_bytes(value: &Value) -> Result<Vec<u8>, NumpyError> {
    match value {
        Value::Bytes(b) => Ok(b.clone()),
        Value::Str(s) => s.chars().map(|c| u8::try_from(u32::from(c)).map_err(|_| NumpyError::NotLatin1)).collect(),
        _ => Err(NumpyError::BadState("array data is neither bytes nor str")),
    }
}

/// Number of elements of ``shape``, failing on overflow
fn element_count(shape: &[usize]) -> Result<usize, NumpyError> {
    shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| NumpyError::Shape(shape.to_vec()))
}

/// Checks that ``raw`` holds exactly ``shape`` elements of ``dtype``
fn check_byte_count(shape: &[usize], dtype: &DType, raw: &[u8]) -> Result<(), NumpyError> {
    let expected = element_count(shape)?
        .checked_mul(dtype.size)
        .ok_or_else(|| NumpyError::Shape(shape.to_vec()))?;
    if raw.len() != expected {
        return Err(NumpyError::ByteCount { expected, found: raw.len() });
    }
    Ok(())
}

fn build_array(shape: Vec<usize>, data: Vec<f64>, fortran: bool) -> Result<nd::ArrayD<f64>, NumpyError> {
    if data.len() != element_count(&shape)? {
        return Err(NumpyError::Shape(shape));
    }
    let dims = nd::IxDyn(&shape);
    let array = if fortran {
        nd::ArrayD::from_shape_vec(dims.f(), data)
    } else {
        nd::ArrayD::from_shape_vec(dims, data)
    };
    array.map_err(|_| NumpyError::Shape(shape))
}

/// ``ndarray.__setstate__`` takes ``(version, shape, dtype, is_fortran, data)``,
/// very old pickles leave the version out
fn ndarray_from_state(state: &Value) -> Result<Option<nd::ArrayD<f64>>, NumpyError> {
    let Value::Tuple(items) = state else {
        return Err(NumpyError::BadState("state is not a tuple"));
    };
    let fields = match items.as_slice() {
        [_, shape, dtype, fortran, data] | [shape, dtype, fortran, data] => (shape, dtype, fortran, data),
        _ => return Err(NumpyError::BadState("unexpected state length")),
    };
    let (shape, dtype, fortran, data) = fields;
    let shape = shape_from_value(shape)?;
    let Some(dtype) = DType::from_value(dtype)? else {
        return Ok(None);
    };
    let fortran = match fortran {
        Value::Bool(b) => *b,
        Value::Int(i) => *i != 0,
        _ => return Err(NumpyError::BadState("is_fortran is not a bool")),
    };
    let values = if dtype.kind == ScalarKind::Object {
        let Value::List(elems) = data else {
            return Err(NumpyError::BadState("object array data is not a list"));
        };
        elems
            .iter()
            .map(|e| number(e).ok_or_else(|| NumpyError::NonNumericElement(e.kind())))
            .collect::<Result<Vec<_>, _>>()?
    } else {
        let raw = raw_bytes(data)?;
        check_byte_count(&shape, &dtype, &raw)?;
        dtype.decode(&raw)?
    };
    build_array(shape, values, fortran).map(Some)
}

/// ``multiarray.scalar(dtype, raw)``, a numpy scalar such as ``np.float32(1)``
fn scalar_from_args(args: &Value) -> Result<Option<nd::ArrayD<f64>>, NumpyError> {
    let Value::Tuple(items) = args else {
        return Err(NumpyError::BadState("scalar arguments are not a tuple"));
    };
    let [dtype, data, ..] = items.as_slice() else {
        return Err(NumpyError::BadState("scalar needs a dtype and data"));
    };
    let Some(dtype) = DType::from_value(dtype)? else {
        return Ok(None);
    };
    if dtype.kind == ScalarKind::Object {
        return Ok(number(data).map(|x| nd::arr0(x).into_dyn()));
    }
    let raw = raw_bytes(data)?;
    check_byte_count(&[], &dtype, &raw)?;
    build_array(Vec::new(), dtype.decode(&raw)?, false).map(Some)
}

/// Protocol 5 pickles use ``_frombuffer(buffer, dtype, shape, order)``
fn ndarray_from_buffer_args(args: &Value) -> Result<Option<nd::ArrayD<f64>>, NumpyError> {
    let Value::Tuple(items) = args else {
        return Err(NumpyError::BadState("_frombuffer arguments are not a tuple"));
    };
    let [data, dtype, shape, order] = items.as_slice() else {
        return Err(NumpyError::BadState("_frombuffer needs buffer, dtype, shape and order"));
    };
    let Some(dtype) = DType::from_value(dtype)? else {
        return Ok(None);
    };
    let shape = shape_from_value(shape)?;
    let raw = raw_bytes(data)?;
    check_byte_count(&shape, &dtype, &raw)?;
    let fortran = order.as_str() == Some("F");
    build_array(shape, dtype.decode(&raw)?, fortran).map(Some)
}

/// Writes ``array`` as a C-ordered little-endian ``float64`` ndarray, the same
/// opcodes ``pickle.dumps(arr, 3)`` emits (minus the memo)
pub fn write_ndarray<S, D>(writer: &mut PickleWriter, array: &nd::ArrayBase<S, D>)
where
    S: nd::Data<Elem = f64>,
    D: nd::Dimension,
{
    writer.global("numpy.core.multiarray", "_reconstruct");
    writer.global("numpy", "ndarray");
    writer.int(0);
    writer.tuple(1);
    writer.bytes(b"b");
    writer.tuple(3);
    writer.reduce();

    writer.mark();
    writer.int(1);
    writer.mark();
    for &dim in array.shape() {
        writer.int(i64::try_from(dim).unwrap_or(i64::MAX));
    }
    writer.tuple_from_mark();
    write_f8_dtype(writer);
    writer.bool(false);
    let raw: Vec<u8> = array.iter().flat_map(|v| v.to_le_bytes()).collect();
    writer.bytes(&raw);
    writer.tuple_from_mark();
    writer.build();
}

fn write_f8_dtype(writer: &mut PickleWriter) {
    writer.global("numpy", "dtype");
    writer.unicode("f8");
    writer.bool(false);
    writer.bool(true);
    writer.tuple(3);
    writer.reduce();
    // (version, byteorder, subarray, names, fields, elsize, alignment, flags)
    writer.mark();
    writer.int(3);
    writer.unicode("<");
    writer.none();
    writer.none();
    writer.none();
    writer.int(-1);
    writer.int(-1);
    writer.int(0);
    writer.tuple_from_mark();
    writer.build();
}
