//! # Typed RPC Values
//!
//! Parameters and return values of a request are sequences of tagged values.
//! There are eight scalar kinds, each with a single and an array form, named by
//! one ASCII letter (lowercase single, uppercase array):
//!
//! | kind   | single | array |
//! |--------|--------|-------|
//! | int8   | `b`    | `B`   |
//! | int16  | `h`    | `H`   |
//! | int32  | `i`    | `I`   |
//! | int64  | `l`    | `L`   |
//! | float  | `f`    | `F`   |
//! | double | `d`    | `D`   |
//! | string | `s`    | `S`   |
//! | data   | `x`    | `X`   |
//!
//! ## Wire Format
//! ```text
//! Values:  [count: u32] [tag: u8 x count] [value] [value] ...
//! scalar:  raw big-endian (little-endian for REVERSE packets)
//! string:  [len: u32] [utf-8 bytes]
//! data:    [len: u32] [bytes]
//! array:   [n: u32] [element] x n
//! ```

use bytes::BufMut;

use crate::error::DecodeError;

/// Byte order of a packet payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// Network order, the default.
    #[default]
    Big,
    /// Used for packets carrying the REVERSE flag.
    Little,
}

/// Cursor over received bytes that never reads past the end.
pub struct WireReader<'a> {
    src: &'a [u8],
    order: ByteOrder,
}

macro_rules! read_number {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self) -> Result<$ty, DecodeError> {
            let raw = self.take(std::mem::size_of::<$ty>())?;
            let arr = raw.try_into().map_err(|_| DecodeError::Insufficient {
                needed: std::mem::size_of::<$ty>(),
                available: raw.len(),
            })?;
            Ok(match self.order {
                ByteOrder::Big => <$ty>::from_be_bytes(arr),
                ByteOrder::Little => <$ty>::from_le_bytes(arr),
            })
        }
    };
}

impl<'a> WireReader<'a> {
    pub fn new(src: &'a [u8], order: ByteOrder) -> Self {
        Self { src, order }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.src.len()
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    /// Take exactly `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.src.len() < n {
            return Err(DecodeError::Insufficient {
                needed: n,
                available: self.src.len(),
            });
        }
        let (head, tail) = self.src.split_at(n);
        self.src = tail;
        Ok(head)
    }

    /// Fail unless at least `count * elem` more bytes are present.
    fn require(&self, count: usize, elem: usize) -> Result<(), DecodeError> {
        let needed = count.checked_mul(elem).unwrap_or(usize::MAX);
        if self.src.len() < needed {
            return Err(DecodeError::Insufficient {
                needed,
                available: self.src.len(),
            });
        }
        Ok(())
    }

    read_number!(u8, u8);
    read_number!(i8, i8);
    read_number!(u16, u16);
    read_number!(i16, i16);
    read_number!(u32, u32);
    read_number!(i32, i32);
    read_number!(i64, i64);
    read_number!(f32, f32);
    read_number!(f64, f64);

    fn len_prefix(&mut self) -> Result<usize, DecodeError> {
        Ok(self.u32()? as usize)
    }

    fn blob(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.len_prefix()?;
        self.take(len)
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let raw = self.blob()?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8)
    }
}

/// Write helpers honouring the payload byte order.
pub(crate) fn put_u32(dst: &mut impl BufMut, v: u32, order: ByteOrder) {
    match order {
        ByteOrder::Big => dst.put_u32(v),
        ByteOrder::Little => dst.put_u32_le(v),
    }
}

fn put_len(dst: &mut impl BufMut, len: usize, order: ByteOrder) {
    put_u32(dst, len as u32, order);
}

fn put_blob(dst: &mut impl BufMut, bytes: &[u8], order: ByteOrder) {
    put_len(dst, bytes.len(), order);
    dst.put_slice(bytes);
}

/// Wire type of a [`Value`], identified by its one-letter tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueType {
    Int8 = b'b',
    Int8Array = b'B',
    Int16 = b'h',
    Int16Array = b'H',
    Int32 = b'i',
    Int32Array = b'I',
    Int64 = b'l',
    Int64Array = b'L',
    Float = b'f',
    FloatArray = b'F',
    Double = b'd',
    DoubleArray = b'D',
    String = b's',
    StringArray = b'S',
    Data = b'x',
    DataArray = b'X',
}

impl ValueType {
    /// One-letter type tag.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Look up a type by tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        use ValueType::*;
        Some(match tag {
            b'b' => Int8,
            b'B' => Int8Array,
            b'h' => Int16,
            b'H' => Int16Array,
            b'i' => Int32,
            b'I' => Int32Array,
            b'l' => Int64,
            b'L' => Int64Array,
            b'f' => Float,
            b'F' => FloatArray,
            b'd' => Double,
            b'D' => DoubleArray,
            b's' => String,
            b'S' => StringArray,
            b'x' => Data,
            b'X' => DataArray,
            _ => return None,
        })
    }

    pub fn is_array(self) -> bool {
        self.tag().is_ascii_uppercase()
    }
}

/// A single typed RPC value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int8(i8),
    Int8Array(Vec<i8>),
    Int16(i16),
    Int16Array(Vec<i16>),
    Int32(i32),
    Int32Array(Vec<i32>),
    Int64(i64),
    Int64Array(Vec<i64>),
    Float(f32),
    FloatArray(Vec<f32>),
    Double(f64),
    DoubleArray(Vec<f64>),
    String(String),
    StringArray(Vec<String>),
    Data(Vec<u8>),
    DataArray(Vec<Vec<u8>>),
}

macro_rules! put_numbers {
    ($dst:expr, $items:expr, $order:expr, $be:ident, $le:ident) => {{
        put_len($dst, $items.len(), $order);
        for v in $items {
            match $order {
                ByteOrder::Big => $dst.$be(*v),
                ByteOrder::Little => $dst.$le(*v),
            }
        }
    }};
}

macro_rules! get_numbers {
    ($src:expr, $read:ident, $ty:ty) => {{
        let n = $src.len_prefix()?;
        $src.require(n, std::mem::size_of::<$ty>())?;
        let mut items = Vec::with_capacity(n);
        for _ in 0..n {
            items.push($src.$read()?);
        }
        items
    }};
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Int8(_) => ValueType::Int8,
            Value::Int8Array(_) => ValueType::Int8Array,
            Value::Int16(_) => ValueType::Int16,
            Value::Int16Array(_) => ValueType::Int16Array,
            Value::Int32(_) => ValueType::Int32,
            Value::Int32Array(_) => ValueType::Int32Array,
            Value::Int64(_) => ValueType::Int64,
            Value::Int64Array(_) => ValueType::Int64Array,
            Value::Float(_) => ValueType::Float,
            Value::FloatArray(_) => ValueType::FloatArray,
            Value::Double(_) => ValueType::Double,
            Value::DoubleArray(_) => ValueType::DoubleArray,
            Value::String(_) => ValueType::String,
            Value::StringArray(_) => ValueType::StringArray,
            Value::Data(_) => ValueType::Data,
            Value::DataArray(_) => ValueType::DataArray,
        }
    }

    /// Number of elements: 1 for scalars (including a single string),
    /// the element count for arrays.
    pub fn count(&self) -> usize {
        match self {
            Value::Int8Array(v) => v.len(),
            Value::Int16Array(v) => v.len(),
            Value::Int32Array(v) => v.len(),
            Value::Int64Array(v) => v.len(),
            Value::FloatArray(v) => v.len(),
            Value::DoubleArray(v) => v.len(),
            Value::StringArray(v) => v.len(),
            Value::DataArray(v) => v.len(),
            _ => 1,
        }
    }

    /// Exact encoded size in bytes (excluding the type tag).
    pub fn bytes(&self) -> usize {
        match self {
            Value::Int8(_) => 1,
            Value::Int16(_) => 2,
            Value::Int32(_) | Value::Float(_) => 4,
            Value::Int64(_) | Value::Double(_) => 8,
            Value::Int8Array(v) => 4 + v.len(),
            Value::Int16Array(v) => 4 + v.len() * 2,
            Value::Int32Array(v) => 4 + v.len() * 4,
            Value::FloatArray(v) => 4 + v.len() * 4,
            Value::Int64Array(v) => 4 + v.len() * 8,
            Value::DoubleArray(v) => 4 + v.len() * 8,
            Value::String(s) => 4 + s.len(),
            Value::Data(d) => 4 + d.len(),
            Value::StringArray(v) => 4 + v.iter().map(|s| 4 + s.len()).sum::<usize>(),
            Value::DataArray(v) => 4 + v.iter().map(|d| 4 + d.len()).sum::<usize>(),
        }
    }

    /// Append the encoded value (without its tag).
    pub fn encode(&self, dst: &mut impl BufMut, order: ByteOrder) {
        match self {
            Value::Int8(v) => dst.put_i8(*v),
            Value::Int16(v) => match order {
                ByteOrder::Big => dst.put_i16(*v),
                ByteOrder::Little => dst.put_i16_le(*v),
            },
            Value::Int32(v) => match order {
                ByteOrder::Big => dst.put_i32(*v),
                ByteOrder::Little => dst.put_i32_le(*v),
            },
            Value::Int64(v) => match order {
                ByteOrder::Big => dst.put_i64(*v),
                ByteOrder::Little => dst.put_i64_le(*v),
            },
            Value::Float(v) => match order {
                ByteOrder::Big => dst.put_f32(*v),
                ByteOrder::Little => dst.put_f32_le(*v),
            },
            Value::Double(v) => match order {
                ByteOrder::Big => dst.put_f64(*v),
                ByteOrder::Little => dst.put_f64_le(*v),
            },
            Value::Int8Array(v) => {
                put_len(dst, v.len(), order);
                for b in v {
                    dst.put_i8(*b);
                }
            }
            Value::Int16Array(v) => put_numbers!(dst, v, order, put_i16, put_i16_le),
            Value::Int32Array(v) => put_numbers!(dst, v, order, put_i32, put_i32_le),
            Value::Int64Array(v) => put_numbers!(dst, v, order, put_i64, put_i64_le),
            Value::FloatArray(v) => put_numbers!(dst, v, order, put_f32, put_f32_le),
            Value::DoubleArray(v) => put_numbers!(dst, v, order, put_f64, put_f64_le),
            Value::String(s) => put_blob(dst, s.as_bytes(), order),
            Value::Data(d) => put_blob(dst, d, order),
            Value::StringArray(v) => {
                put_len(dst, v.len(), order);
                for s in v {
                    put_blob(dst, s.as_bytes(), order);
                }
            }
            Value::DataArray(v) => {
                put_len(dst, v.len(), order);
                for d in v {
                    put_blob(dst, d, order);
                }
            }
        }
    }

    /// Decode one value of the given type.
    pub fn decode(ty: ValueType, src: &mut WireReader<'_>) -> Result<Value, DecodeError> {
        Ok(match ty {
            ValueType::Int8 => Value::Int8(src.i8()?),
            ValueType::Int16 => Value::Int16(src.i16()?),
            ValueType::Int32 => Value::Int32(src.i32()?),
            ValueType::Int64 => Value::Int64(src.i64()?),
            ValueType::Float => Value::Float(src.f32()?),
            ValueType::Double => Value::Double(src.f64()?),
            ValueType::Int8Array => Value::Int8Array(get_numbers!(src, i8, i8)),
            ValueType::Int16Array => Value::Int16Array(get_numbers!(src, i16, i16)),
            ValueType::Int32Array => Value::Int32Array(get_numbers!(src, i32, i32)),
            ValueType::Int64Array => Value::Int64Array(get_numbers!(src, i64, i64)),
            ValueType::FloatArray => Value::FloatArray(get_numbers!(src, f32, f32)),
            ValueType::DoubleArray => Value::DoubleArray(get_numbers!(src, f64, f64)),
            ValueType::String => Value::String(src.string()?),
            ValueType::Data => Value::Data(src.blob()?.to_vec()),
            ValueType::StringArray => {
                let n = src.len_prefix()?;
                src.require(n, 4)?;
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(src.string()?);
                }
                Value::StringArray(items)
            }
            ValueType::DataArray => {
                let n = src.len_prefix()?;
                src.require(n, 4)?;
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(src.blob()?.to_vec());
                }
                Value::DataArray(items)
            }
        })
    }

    pub fn as_i8(&self) -> Option<i8> {
        match self {
            Value::Int8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> Option<i16> {
        match self {
            Value::Int16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            Value::Data(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_string_array(&self) -> Option<&[String]> {
        match self {
            Value::StringArray(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

/// Ordered sequence of values: the parameters or return values of a request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Values {
    values: Vec<Value>,
}

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: impl Into<Value>) -> &mut Self {
        self.values.push(value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.values.iter()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Compact type string, one tag per value.
    pub fn type_string(&self) -> String {
        self.values
            .iter()
            .map(|v| v.value_type().tag() as char)
            .collect()
    }

    /// Check the values against a type string.
    ///
    /// Tags must match positionally. Lengths must match exactly unless the
    /// type string ends with `*`, which accepts any number of trailing values.
    pub fn satisfies(&self, types: &str) -> bool {
        let (required, open) = match types.strip_suffix('*') {
            Some(prefix) => (prefix.as_bytes(), true),
            None => (types.as_bytes(), false),
        };
        if self.values.len() < required.len() || (!open && self.values.len() != required.len()) {
            return false;
        }
        required
            .iter()
            .zip(&self.values)
            .all(|(tag, value)| *tag == value.value_type().tag())
    }

    /// Exact encoded size in bytes.
    pub fn bytes(&self) -> usize {
        4 + self.values.len() + self.values.iter().map(Value::bytes).sum::<usize>()
    }

    pub fn encode(&self, dst: &mut impl BufMut, order: ByteOrder) {
        put_len(dst, self.values.len(), order);
        for v in &self.values {
            dst.put_u8(v.value_type().tag());
        }
        for v in &self.values {
            v.encode(dst, order);
        }
    }

    pub fn decode(src: &mut WireReader<'_>) -> Result<Values, DecodeError> {
        let n = src.len_prefix()?;
        let tags = src.take(n)?;
        let mut values = Vec::with_capacity(n);
        for &tag in tags {
            let ty = ValueType::from_tag(tag).ok_or(DecodeError::UnknownType(tag))?;
            values.push(Value::decode(ty, src)?);
        }
        Ok(Values { values })
    }
}

impl std::ops::Index<usize> for Values {
    type Output = Value;

    fn index(&self, idx: usize) -> &Value {
        &self.values[idx]
    }
}

impl From<Vec<Value>> for Values {
    fn from(values: Vec<Value>) -> Self {
        Self { values }
    }
}

impl FromIterator<Value> for Values {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Values {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

impl<'a> IntoIterator for &'a Values {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Value> {
        vec![
            Value::Int8(-3),
            Value::Int8Array(vec![]),
            Value::Int16(-300),
            Value::Int16Array(vec![1, -2, 3]),
            Value::Int32(42),
            Value::Int32Array(vec![i32::MIN, 0, i32::MAX]),
            Value::Int64(-1),
            Value::Int64Array(vec![7; 5]),
            Value::Float(1.5),
            Value::FloatArray(vec![0.25, -8.0]),
            Value::Double(std::f64::consts::PI),
            Value::DoubleArray(vec![]),
            Value::String(String::new()),
            Value::StringArray(vec!["a".into(), String::new(), "\u{00e5}".into()]),
            Value::Data(vec![0, 255, 1]),
            Value::DataArray(vec![vec![], vec![9, 9]]),
        ]
    }

    #[test]
    fn test_roundtrip_every_type_both_orders() {
        let values: Values = sample().into_iter().collect();
        for order in [ByteOrder::Big, ByteOrder::Little] {
            let mut buf = Vec::new();
            values.encode(&mut buf, order);
            assert_eq!(buf.len(), values.bytes());
            let mut reader = WireReader::new(&buf, order);
            let decoded = Values::decode(&mut reader).expect("decode");
            assert_eq!(reader.remaining(), 0);
            assert_eq!(decoded, values);
        }
    }

    #[test]
    fn test_reverse_swaps_element_bytes() {
        let value = Value::Int16Array(vec![0x0102]);
        let mut big = Vec::new();
        let mut little = Vec::new();
        value.encode(&mut big, ByteOrder::Big);
        value.encode(&mut little, ByteOrder::Little);
        assert_eq!(big, vec![0, 0, 0, 1, 0x01, 0x02]);
        assert_eq!(little, vec![1, 0, 0, 0, 0x02, 0x01]);
    }

    #[test]
    fn test_count_semantics() {
        assert_eq!(Value::String("hello".into()).count(), 1);
        assert_eq!(Value::StringArray(vec!["a".into(), "b".into()]).count(), 2);
        assert_eq!(Value::Data(vec![1, 2, 3]).count(), 1);
        assert_eq!(Value::Int32Array(vec![]).count(), 0);
    }

    #[test]
    fn test_satisfies() {
        let mut two = Values::new();
        two.add(1i32).add(2i32);
        assert!(two.satisfies("ii"));
        assert!(!two.satisfies("i"));
        assert!(!two.satisfies("iii"));
        assert!(!two.satisfies("il"));
        assert!(two.satisfies("i*"));
        assert!(two.satisfies("ii*"));
        assert!(two.satisfies("*"));

        let mut mixed = Values::new();
        mixed.add("x").add(1i32);
        assert!(!mixed.satisfies("i*"));
        assert!(mixed.satisfies("s*"));

        assert!(Values::new().satisfies(""));
        assert!(!Values::new().satisfies("i*"));
        assert!(Values::new().satisfies("*"));
    }

    #[test]
    fn test_truncated_is_insufficient() {
        let mut values = Values::new();
        values.add("hello");
        let mut buf = Vec::new();
        values.encode(&mut buf, ByteOrder::Big);
        for cut in 0..buf.len() {
            let err = Values::decode(&mut WireReader::new(&buf[..cut], ByteOrder::Big))
                .expect_err("truncated input must fail");
            assert!(!err.is_fatal(), "cut at {cut}: {err}");
        }
    }

    #[test]
    fn test_unknown_tag_is_fatal() {
        let buf = [0, 0, 0, 1, b'?', 0, 0, 0, 0];
        let err = Values::decode(&mut WireReader::new(&buf, ByteOrder::Big)).unwrap_err();
        assert_eq!(err, DecodeError::UnknownType(b'?'));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_huge_array_count_does_not_allocate() {
        let buf = [0, 0, 0, 1, b'L', 0xFF, 0xFF, 0xFF, 0xFF];
        let err = Values::decode(&mut WireReader::new(&buf, ByteOrder::Big)).unwrap_err();
        assert!(matches!(err, DecodeError::Insufficient { .. }));
    }

    #[test]
    fn test_invalid_utf8_string() {
        let buf = [0, 0, 0, 1, b's', 0, 0, 0, 1, 0xFF];
        let err = Values::decode(&mut WireReader::new(&buf, ByteOrder::Big)).unwrap_err();
        assert_eq!(err, DecodeError::InvalidUtf8);
    }
}
