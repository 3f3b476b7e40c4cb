use byteorder::ByteOrder;
use byteorder::LittleEndian;

use super::ErrorKind;
use super::Result;

/// Element types supported by the `NDArray` wire message.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Float16,
    Float32,
    Float64,
    Int8,
    Int16,
    Int32,
    Int64,
}

impl Dtype {
    /// Size of one element, in bytes.
    pub fn width(self) -> usize {
        match self {
            Dtype::Int8 => 1,
            Dtype::Float16 | Dtype::Int16 => 2,
            Dtype::Float32 | Dtype::Int32 => 4,
            Dtype::Float64 | Dtype::Int64 => 8,
        }
    }
}

/// N-dimensional numeric array wire message.
///
/// Decoding prefers the packed `content` bytes and falls back to the typed
/// value lists, defaulting the dtype per list (`float_val` -> float32,
/// `double_val` -> float64, `int_val` -> int32, `long_val` -> int64).
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct NDArray {
    pub dtype: Dtype,

    #[serde(default)]
    pub shape: Vec<usize>,

    #[serde(default, with = "base64_bytes", skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub float_val: Vec<f32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub double_val: Vec<f64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub int_val: Vec<i32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub long_val: Vec<i64>,
}

/// Decoded, typed form of an `NDArray` payload.
#[derive(Clone, PartialEq, Debug)]
pub enum ArrayData {
    F16(Vec<u16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl ArrayData {
    pub fn dtype(&self) -> Dtype {
        match self {
            ArrayData::F16(_) => Dtype::Float16,
            ArrayData::F32(_) => Dtype::Float32,
            ArrayData::F64(_) => Dtype::Float64,
            ArrayData::I8(_) => Dtype::Int8,
            ArrayData::I16(_) => Dtype::Int16,
            ArrayData::I32(_) => Dtype::Int32,
            ArrayData::I64(_) => Dtype::Int64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayData::F16(v) => v.len(),
            ArrayData::F32(v) => v.len(),
            ArrayData::F64(v) => v.len(),
            ArrayData::I8(v) => v.len(),
            ArrayData::I16(v) => v.len(),
            ArrayData::I32(v) => v.len(),
            ArrayData::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cast every element to f32 (the element type kNN backends operate on).
    pub fn cast_f32(&self) -> Vec<f32> {
        match self {
            ArrayData::F16(v) => v.iter().map(|bits| f16_to_f32(*bits)).collect(),
            ArrayData::F32(v) => v.clone(),
            ArrayData::F64(v) => v.iter().map(|x| *x as f32).collect(),
            ArrayData::I8(v) => v.iter().map(|x| f32::from(*x)).collect(),
            ArrayData::I16(v) => v.iter().map(|x| f32::from(*x)).collect(),
            ArrayData::I32(v) => v.iter().map(|x| *x as f32).collect(),
            ArrayData::I64(v) => v.iter().map(|x| *x as f32).collect(),
        }
    }
}

impl NDArray {
    /// Pack typed data into a wire message with `content` bytes.
    pub fn encode(data: &ArrayData, shape: &[usize]) -> Result<NDArray> {
        let elements: usize = shape.iter().product();
        if shape.is_empty() {
            return Err(ErrorKind::serialize("missing attribute shape").into());
        }
        if elements != data.len() {
            return Err(ErrorKind::serialize(format!(
                "shape {:?} does not match {} elements",
                shape,
                data.len()
            ))
            .into());
        }
        let dtype = data.dtype();
        let mut content = vec![0; data.len() * dtype.width()];
        match data {
            ArrayData::F16(v) => LittleEndian::write_u16_into(v, &mut content),
            ArrayData::F32(v) => LittleEndian::write_f32_into(v, &mut content),
            ArrayData::F64(v) => LittleEndian::write_f64_into(v, &mut content),
            ArrayData::I8(v) => {
                for (slot, value) in content.iter_mut().zip(v.iter()) {
                    *slot = *value as u8;
                }
            }
            ArrayData::I16(v) => LittleEndian::write_i16_into(v, &mut content),
            ArrayData::I32(v) => LittleEndian::write_i32_into(v, &mut content),
            ArrayData::I64(v) => LittleEndian::write_i64_into(v, &mut content),
        };
        Ok(NDArray {
            dtype,
            shape: shape.to_vec(),
            content: Some(content),
            float_val: Vec::new(),
            double_val: Vec::new(),
            int_val: Vec::new(),
            long_val: Vec::new(),
        })
    }

    /// Shorthand to encode an f32 matrix.
    pub fn from_f32<S: Into<Vec<usize>>>(data: Vec<f32>, shape: S) -> Result<NDArray> {
        NDArray::encode(&ArrayData::F32(data), &shape.into())
    }

    /// Decode the message back into typed data plus its shape.
    pub fn decode(&self) -> Result<(ArrayData, Vec<usize>)> {
        if self.shape.is_empty() {
            return Err(ErrorKind::deserialize("missing attribute shape").into());
        }
        let elements: usize = self.shape.iter().product();
        let data = match self.content {
            Some(ref content) => decode_content(self.dtype, content)?,
            None => self.decode_values()?,
        };
        if data.len() != elements {
            return Err(ErrorKind::deserialize(format!(
                "{} elements do not fill shape {:?}",
                data.len(),
                self.shape
            ))
            .into());
        }
        Ok((data, self.shape.clone()))
    }

    /// Decode into an f32 row matrix, reshaping a 1-d vector into one row.
    pub fn as_f32_matrix(&self) -> Result<(Vec<f32>, usize, usize)> {
        let (data, shape) = self.decode()?;
        let data = data.cast_f32();
        match shape.len() {
            1 => {
                let cols = shape[0];
                Ok((data, 1, cols))
            }
            2 => Ok((data, shape[0], shape[1])),
            _ => Err(ErrorKind::deserialize(format!(
                "expected a 1-d or 2-d array, got shape {:?}",
                shape
            ))
            .into()),
        }
    }

    /// Typed-list fallback, applying the per-list dtype defaults.
    fn decode_values(&self) -> Result<ArrayData> {
        if !self.float_val.is_empty() {
            return Ok(retype(ArrayData::F32(self.float_val.clone()), self.dtype));
        }
        if !self.double_val.is_empty() {
            return Ok(retype(ArrayData::F64(self.double_val.clone()), self.dtype));
        }
        if !self.int_val.is_empty() {
            return Ok(retype(ArrayData::I32(self.int_val.clone()), self.dtype));
        }
        if !self.long_val.is_empty() {
            return Ok(retype(ArrayData::I64(self.long_val.clone()), self.dtype));
        }
        Err(ErrorKind::deserialize("missing value attribute").into())
    }
}

fn decode_content(dtype: Dtype, content: &[u8]) -> Result<ArrayData> {
    if content.len() % dtype.width() != 0 {
        return Err(ErrorKind::deserialize(format!(
            "{} content bytes do not align to {:?}",
            content.len(),
            dtype
        ))
        .into());
    }
    let elements = content.len() / dtype.width();
    let data = match dtype {
        Dtype::Float16 => {
            let mut out = vec![0; elements];
            LittleEndian::read_u16_into(content, &mut out);
            ArrayData::F16(out)
        }
        Dtype::Float32 => {
            let mut out = vec![0.0; elements];
            LittleEndian::read_f32_into(content, &mut out);
            ArrayData::F32(out)
        }
        Dtype::Float64 => {
            let mut out = vec![0.0; elements];
            LittleEndian::read_f64_into(content, &mut out);
            ArrayData::F64(out)
        }
        Dtype::Int8 => ArrayData::I8(content.iter().map(|b| *b as i8).collect()),
        Dtype::Int16 => {
            let mut out = vec![0; elements];
            LittleEndian::read_i16_into(content, &mut out);
            ArrayData::I16(out)
        }
        Dtype::Int32 => {
            let mut out = vec![0; elements];
            LittleEndian::read_i32_into(content, &mut out);
            ArrayData::I32(out)
        }
        Dtype::Int64 => {
            let mut out = vec![0; elements];
            LittleEndian::read_i64_into(content, &mut out);
            ArrayData::I64(out)
        }
    };
    Ok(data)
}

/// Re-tag typed-list data when the message carries an explicit dtype.
///
/// Only the dtype tag changes; values are not converted. The searcher casts
/// to f32 anyway and exotic mismatches are rejected there by length checks.
fn retype(data: ArrayData, dtype: Dtype) -> ArrayData {
    if data.dtype() == dtype {
        return data;
    }
    match (data, dtype) {
        (ArrayData::F32(v), Dtype::Float64) => {
            ArrayData::F64(v.into_iter().map(f64::from).collect())
        }
        (ArrayData::F64(v), Dtype::Float32) => {
            ArrayData::F32(v.into_iter().map(|x| x as f32).collect())
        }
        (ArrayData::I32(v), Dtype::Int64) => ArrayData::I64(v.into_iter().map(i64::from).collect()),
        (ArrayData::I64(v), Dtype::Int32) => {
            ArrayData::I32(v.into_iter().map(|x| x as i32).collect())
        }
        (data, _) => data,
    }
}

/// Decode an IEEE 754 half-precision value stored as raw bits.
pub fn f16_to_f32(bits: u16) -> f32 {
    let sign = u32::from(bits >> 15) << 31;
    let exponent = u32::from((bits >> 10) & 0x1f);
    let mantissa = u32::from(bits & 0x3ff);
    let value = match (exponent, mantissa) {
        (0, 0) => sign,
        (0, _) => {
            // Subnormal: renormalise into the f32 exponent range.
            let shift = mantissa.leading_zeros() - 21;
            let exponent = 113 - shift;
            let mantissa = (mantissa << shift) & 0x3ff;
            sign | (exponent << 23) | (mantissa << 13)
        }
        (0x1f, 0) => sign | 0x7f80_0000,
        (0x1f, _) => sign | 0x7f80_0000 | (mantissa << 13),
        _ => sign | ((exponent + 127 - 15) << 23) | (mantissa << 13),
    };
    f32::from_bits(value)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::de::Error;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map(Some)
                .map_err(D::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json;

    use super::super::ErrorKind;
    use super::ArrayData;
    use super::Dtype;
    use super::NDArray;

    fn round_trip(data: ArrayData, shape: &[usize]) {
        let proto = NDArray::encode(&data, shape).unwrap();
        let json = serde_json::to_string(&proto).unwrap();
        let back: NDArray = serde_json::from_str(&json).unwrap();
        let (decoded, decoded_shape) = back.decode().unwrap();
        assert_eq!(decoded, data);
        assert_eq!(decoded_shape, shape);
    }

    #[test]
    fn round_trip_floats() {
        round_trip(ArrayData::F32(vec![1.5, -2.25, 0.0, 3.125]), &[2, 2]);
        round_trip(ArrayData::F64(vec![1.5e300, -2.25, 0.125]), &[3]);
        round_trip(
            ArrayData::F16(vec![0x3c00, 0x4000, 0xc000, 0x0000]),
            &[4],
        );
    }

    #[test]
    fn round_trip_ints() {
        round_trip(ArrayData::I8(vec![-128, 0, 127]), &[3]);
        round_trip(ArrayData::I16(vec![-32768, 42, 32767]), &[3]);
        round_trip(ArrayData::I32(vec![i32::min_value(), 7, i32::max_value()]), &[3]);
        round_trip(ArrayData::I64(vec![i64::min_value(), 7, i64::max_value()]), &[3]);
    }

    #[test]
    fn missing_shape() {
        let proto = NDArray {
            dtype: Dtype::Float32,
            shape: Vec::new(),
            content: None,
            float_val: vec![1.0],
            double_val: Vec::new(),
            int_val: Vec::new(),
            long_val: Vec::new(),
        };
        match proto.decode() {
            Err(error) => match error.kind() {
                ErrorKind::Deserialize(reason) => {
                    assert_eq!(reason, "missing attribute shape")
                }
                kind => panic!("unexpected error kind: {:?}", kind),
            },
            Ok(_) => panic!("expected decode to fail"),
        };
    }

    #[test]
    fn missing_values() {
        let proto = NDArray {
            dtype: Dtype::Float32,
            shape: vec![2],
            content: None,
            float_val: Vec::new(),
            double_val: Vec::new(),
            int_val: Vec::new(),
            long_val: Vec::new(),
        };
        match proto.decode() {
            Err(error) => match error.kind() {
                ErrorKind::Deserialize(reason) => {
                    assert_eq!(reason, "missing value attribute")
                }
                kind => panic!("unexpected error kind: {:?}", kind),
            },
            Ok(_) => panic!("expected decode to fail"),
        };
    }

    #[test]
    fn typed_list_fallback() {
        let proto = NDArray {
            dtype: Dtype::Float32,
            shape: vec![2, 2],
            content: None,
            float_val: vec![1.0, 2.0, 3.0, 4.0],
            double_val: Vec::new(),
            int_val: Vec::new(),
            long_val: Vec::new(),
        };
        let (data, shape) = proto.decode().unwrap();
        assert_eq!(data, ArrayData::F32(vec![1.0, 2.0, 3.0, 4.0]));
        assert_eq!(shape, vec![2, 2]);
    }

    #[test]
    fn typed_list_dtype_upgrade() {
        let proto = NDArray {
            dtype: Dtype::Int64,
            shape: vec![2],
            content: None,
            float_val: Vec::new(),
            double_val: Vec::new(),
            int_val: vec![3, 4],
            long_val: Vec::new(),
        };
        let (data, _) = proto.decode().unwrap();
        assert_eq!(data, ArrayData::I64(vec![3, 4]));
    }

    #[test]
    fn matrix_reshapes_vector() {
        let proto = NDArray::from_f32(vec![1.0, 2.0, 3.0], vec![3]).unwrap();
        let (data, rows, cols) = proto.as_f32_matrix().unwrap();
        assert_eq!(data, vec![1.0, 2.0, 3.0]);
        assert_eq!((rows, cols), (1, 3));
    }

    #[test]
    fn shape_element_mismatch() {
        let result = NDArray::from_f32(vec![1.0, 2.0, 3.0], vec![2, 2]);
        assert!(result.is_err());
    }

    #[test]
    fn half_precision_decode() {
        assert_eq!(super::f16_to_f32(0x3c00), 1.0);
        assert_eq!(super::f16_to_f32(0xc000), -2.0);
        assert_eq!(super::f16_to_f32(0x3800), 0.5);
        assert_eq!(super::f16_to_f32(0x0000), 0.0);
        assert!(super::f16_to_f32(0x7c00).is_infinite());
        assert!(super::f16_to_f32(0x7e00).is_nan());
        // Smallest subnormal.
        assert!((super::f16_to_f32(0x0001) - 5.960_464_5e-8).abs() < 1e-12);
    }
}
