//! In-memory NIfTI image: header plus voxel data.
//!
//! Loaded images keep the raw file bytes (memory map or inflated gzip buffer)
//! and decode them on demand; constructed images own a typed array. Arrays
//! are always Fortran ordered to match the on-disk layout.

use super::header::{DataType, NiftiHeader};
use crate::error::{Error, Result};
use crate::transforms::Affine;
use ndarray::{Array3, ArrayD, Axis, Ix3, IxDyn, ShapeBuilder};
use std::sync::Arc;

/// Shared read-only byte buffer backing a loaded image.
pub(crate) type SharedBytes = Arc<dyn AsRef<[u8]> + Send + Sync>;

/// Element types that can be stored in a NIfTI file.
pub trait NiftiElement: Copy + Send + Sync + 'static {
    /// Datatype code written to the header.
    const DATA_TYPE: DataType;

    /// Decode one element from its on-disk bytes.
    fn from_bytes(bytes: &[u8], little_endian: bool) -> Self;

    /// Append the little-endian encoding of `self`.
    fn write_le(self, out: &mut Vec<u8>);

    /// Widen to `f64`.
    fn to_f64(self) -> f64;

    /// Narrow from `f64`, truncating toward zero and saturating at the type bounds.
    fn from_f64(value: f64) -> Self;

    /// Wrap a typed array.
    fn into_data(array: ArrayD<Self>) -> ArrayData;
}

macro_rules! impl_element {
    ($t:ty, $variant:ident, $dtype:ident) => {
        impl NiftiElement for $t {
            const DATA_TYPE: DataType = DataType::$dtype;

            #[inline]
            fn from_bytes(bytes: &[u8], little_endian: bool) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(bytes);
                if little_endian {
                    <$t>::from_le_bytes(raw)
                } else {
                    <$t>::from_be_bytes(raw)
                }
            }

            #[inline]
            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn from_f64(value: f64) -> Self {
                value as $t
            }

            fn into_data(array: ArrayD<Self>) -> ArrayData {
                ArrayData::$variant(array)
            }
        }
    };
}

impl_element!(u8, U8, UInt8);
impl_element!(i8, I8, Int8);
impl_element!(i16, I16, Int16);
impl_element!(u16, U16, UInt16);
impl_element!(i32, I32, Int32);
impl_element!(u32, U32, UInt32);
impl_element!(i64, I64, Int64);
impl_element!(u64, U64, UInt64);
impl_element!(f32, F32, Float32);
impl_element!(f64, F64, Float64);

/// Voxel data in its stored element type.
#[derive(Debug, Clone)]
pub enum ArrayData {
    U8(ArrayD<u8>),
    I8(ArrayD<i8>),
    I16(ArrayD<i16>),
    U16(ArrayD<u16>),
    I32(ArrayD<i32>),
    U32(ArrayD<u32>),
    I64(ArrayD<i64>),
    U64(ArrayD<u64>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
}

macro_rules! dispatch {
    ($data:expr, $arr:ident => $body:expr) => {
        match $data {
            ArrayData::U8($arr) => $body,
            ArrayData::I8($arr) => $body,
            ArrayData::I16($arr) => $body,
            ArrayData::U16($arr) => $body,
            ArrayData::I32($arr) => $body,
            ArrayData::U32($arr) => $body,
            ArrayData::I64($arr) => $body,
            ArrayData::U64($arr) => $body,
            ArrayData::F32($arr) => $body,
            ArrayData::F64($arr) => $body,
        }
    };
}

fn f_order<T>(shape: &[usize], values: Vec<T>) -> Result<ArrayD<T>> {
    ArrayD::from_shape_vec(IxDyn(shape).f(), values)
        .map_err(|e| Error::ShapeMismatch(e.to_string()))
}

fn decode<T: NiftiElement>(
    bytes: &[u8],
    shape: &[usize],
    little_endian: bool,
) -> Result<ArrayD<T>> {
    let size = std::mem::size_of::<T>();
    let values = bytes
        .chunks_exact(size)
        .map(|chunk| T::from_bytes(chunk, little_endian))
        .collect();
    f_order(shape, values)
}

fn cast_from_f64<T: NiftiElement>(source: &ArrayD<f64>) -> Result<ArrayD<T>> {
    // Reversed-axis view iterates in Fortran order.
    let values = source.t().iter().map(|&v| T::from_f64(v)).collect();
    f_order(source.shape(), values)
}

impl ArrayData {
    /// Datatype of the stored elements.
    pub fn dtype(&self) -> DataType {
        match self {
            Self::U8(_) => DataType::UInt8,
            Self::I8(_) => DataType::Int8,
            Self::I16(_) => DataType::Int16,
            Self::U16(_) => DataType::UInt16,
            Self::I32(_) => DataType::Int32,
            Self::U32(_) => DataType::UInt32,
            Self::I64(_) => DataType::Int64,
            Self::U64(_) => DataType::UInt64,
            Self::F32(_) => DataType::Float32,
            Self::F64(_) => DataType::Float64,
        }
    }

    /// Array extents.
    pub fn shape(&self) -> &[usize] {
        dispatch!(self, a => a.shape())
    }

    /// Convert to `f64`, applying `value * slope + inter`.
    pub fn to_f64_scaled(&self, slope: f64, inter: f64) -> ArrayD<f64> {
        dispatch!(self, a => a.mapv(|v| v.to_f64() * slope + inter))
    }

    /// Convert to `f32`, applying `value * slope + inter`.
    pub fn to_f32_scaled(&self, slope: f64, inter: f64) -> ArrayD<f32> {
        dispatch!(self, a => a.mapv(|v| (v.to_f64() * slope + inter) as f32))
    }

    /// Build an array of `dtype` from `f64` values with truncating, saturating casts.
    pub fn from_f64(source: &ArrayD<f64>, dtype: DataType) -> Result<Self> {
        Ok(match dtype {
            DataType::UInt8 => Self::U8(cast_from_f64(source)?),
            DataType::Int8 => Self::I8(cast_from_f64(source)?),
            DataType::Int16 => Self::I16(cast_from_f64(source)?),
            DataType::UInt16 => Self::U16(cast_from_f64(source)?),
            DataType::Int32 => Self::I32(cast_from_f64(source)?),
            DataType::UInt32 => Self::U32(cast_from_f64(source)?),
            DataType::Int64 => Self::I64(cast_from_f64(source)?),
            DataType::UInt64 => Self::U64(cast_from_f64(source)?),
            DataType::Float32 => Self::F32(cast_from_f64(source)?),
            DataType::Float64 => Self::F64(cast_from_f64(source)?),
        })
    }

    /// Little-endian bytes in Fortran order.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        dispatch!(self, a => {
            let mut out = Vec::with_capacity(a.len() * self.dtype().byte_size());
            for &v in a.t().iter() {
                v.write_le(&mut out);
            }
            out
        })
    }

    fn decode_raw(bytes: &[u8], header: &NiftiHeader) -> Result<Self> {
        let shape = header.shape();
        let le = header.is_little_endian();
        Ok(match header.datatype {
            DataType::UInt8 => Self::U8(decode(bytes, &shape, le)?),
            DataType::Int8 => Self::I8(decode(bytes, &shape, le)?),
            DataType::Int16 => Self::I16(decode(bytes, &shape, le)?),
            DataType::UInt16 => Self::U16(decode(bytes, &shape, le)?),
            DataType::Int32 => Self::I32(decode(bytes, &shape, le)?),
            DataType::UInt32 => Self::U32(decode(bytes, &shape, le)?),
            DataType::Int64 => Self::I64(decode(bytes, &shape, le)?),
            DataType::UInt64 => Self::U64(decode(bytes, &shape, le)?),
            DataType::Float32 => Self::F32(decode(bytes, &shape, le)?),
            DataType::Float64 => Self::F64(decode(bytes, &shape, le)?),
        })
    }
}

#[derive(Clone)]
enum Storage {
    Owned(ArrayData),
    Shared {
        bytes: SharedBytes,
        offset: usize,
        len: usize,
    },
}

/// A NIfTI volume.
#[derive(Clone)]
pub struct NiftiImage {
    header: NiftiHeader,
    shape: Vec<usize>,
    storage: Storage,
}

impl std::fmt::Debug for NiftiImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NiftiImage")
            .field("shape", &self.shape)
            .field("dtype", &self.header.datatype)
            .field("zooms", &self.header.zooms())
            .finish_non_exhaustive()
    }
}

impl NiftiImage {
    /// Create an image from a typed array and a voxel-to-world affine.
    ///
    /// Spacing is derived from the affine's column norms.
    pub fn from_array<T: NiftiElement>(data: ArrayD<T>, affine: Affine) -> Self {
        let mut header = NiftiHeader {
            datatype: T::DATA_TYPE,
            ..NiftiHeader::default()
        };
        set_shape(&mut header, data.shape());
        header.set_affine(affine);
        Self {
            shape: data.shape().to_vec(),
            header,
            storage: Storage::Owned(T::into_data(data)),
        }
    }

    /// Combine an existing header with new data.
    ///
    /// The header's datatype is updated to match `data`; its shape must agree.
    pub fn from_parts(mut header: NiftiHeader, data: ArrayData) -> Result<Self> {
        if header.shape() != data.shape() {
            return Err(Error::ShapeMismatch(format!(
                "header shape {:?} does not match data shape {:?}",
                header.shape(),
                data.shape()
            )));
        }
        header.datatype = data.dtype();
        Ok(Self {
            shape: data.shape().to_vec(),
            header,
            storage: Storage::Owned(data),
        })
    }

    /// New image on the same grid as `template`: geometry, spacing and
    /// descriptive fields are copied, shape and datatype come from `data`,
    /// intensity scaling is reset.
    pub fn from_template(template: &NiftiHeader, data: ArrayData) -> Result<Self> {
        let mut header = template.clone();
        set_shape(&mut header, data.shape());
        header.datatype = data.dtype();
        header.scl_slope = 1.0;
        header.scl_inter = 0.0;
        header.vox_offset = header.version.default_vox_offset();
        header.validate()?;
        Ok(Self {
            shape: data.shape().to_vec(),
            header,
            storage: Storage::Owned(data),
        })
    }

    pub(crate) fn from_shared_bytes(
        header: NiftiHeader,
        bytes: SharedBytes,
        offset: usize,
        len: usize,
    ) -> Self {
        Self {
            shape: header.shape(),
            header,
            storage: Storage::Shared { bytes, offset, len },
        }
    }

    /// Image header.
    pub fn header(&self) -> &NiftiHeader {
        &self.header
    }

    /// Array extents.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Stored datatype.
    pub fn dtype(&self) -> DataType {
        self.header.datatype
    }

    /// Voxel-to-world transform.
    pub fn affine(&self) -> Affine {
        self.header.affine()
    }

    /// Spatial voxel sizes as stored in the header.
    pub fn zooms(&self) -> [f64; 3] {
        self.header.zooms()
    }

    /// Decoded data in its stored type (no scaling).
    pub fn data(&self) -> Result<ArrayData> {
        match &self.storage {
            Storage::Owned(data) => Ok(data.clone()),
            Storage::Shared { bytes, offset, len } => {
                let raw = (**bytes).as_ref();
                let slice = raw.get(*offset..*offset + *len).ok_or_else(|| {
                    Error::InvalidFileFormat(format!(
                        "voxel data [{}..{}] outside buffer of {} bytes",
                        offset,
                        offset + len,
                        raw.len()
                    ))
                })?;
                ArrayData::decode_raw(slice, &self.header)
            }
        }
    }

    fn scaling(&self) -> (f64, f64) {
        if self.header.has_scaling() {
            let slope = if self.header.scl_slope == 0.0 {
                1.0
            } else {
                self.header.scl_slope
            };
            (slope, self.header.scl_inter)
        } else {
            (1.0, 0.0)
        }
    }

    /// Scaled intensities as `f32`.
    pub fn to_f32(&self) -> Result<ArrayD<f32>> {
        let (slope, inter) = self.scaling();
        Ok(self.data()?.to_f32_scaled(slope, inter))
    }

    /// Scaled intensities as `f64`.
    pub fn to_f64(&self) -> Result<ArrayD<f64>> {
        let (slope, inter) = self.scaling();
        Ok(self.data()?.to_f64_scaled(slope, inter))
    }

    /// Scaled intensities as a 3-D `f32` volume.
    ///
    /// A trailing singleton fourth axis is dropped; any other non 3-D image
    /// is rejected.
    pub fn volume_f32(&self) -> Result<Array3<f32>> {
        into_volume(self.to_f32()?)
    }

    /// Scaled intensities as a 3-D `f64` volume.
    pub fn volume_f64(&self) -> Result<Array3<f64>> {
        into_volume(self.to_f64()?)
    }

    /// Little-endian voxel bytes in Fortran order, ready to write.
    pub fn data_to_bytes(&self) -> Result<Vec<u8>> {
        match &self.storage {
            Storage::Shared { bytes, offset, len } if self.header.is_little_endian() => (**bytes)
                .as_ref()
                .get(*offset..*offset + *len)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| Error::InvalidFileFormat("voxel data outside buffer".into())),
            _ => Ok(self.data()?.to_le_bytes()),
        }
    }
}

fn set_shape(header: &mut NiftiHeader, shape: &[usize]) {
    header.ndim = shape.len() as u8;
    header.dim = [1; 7];
    for (slot, &extent) in header.dim.iter_mut().zip(shape) {
        *slot = extent as i64;
    }
}

/// Squeeze a trailing singleton axis and check for three dimensions.
pub(crate) fn into_volume<T>(array: ArrayD<T>) -> Result<Array3<T>> {
    let array = if matches!(array.shape(), [_, _, _, 1]) {
        array.index_axis_move(Axis(3), 0)
    } else {
        array
    };
    let shape = array.shape().to_vec();
    array.into_dimensionality::<Ix3>().map_err(|_| {
        Error::InvalidDimensions(format!("expected a 3-D volume, got shape {:?}", shape))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDENTITY: Affine = [
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ];

    #[test]
    fn test_from_array_sets_header() {
        let data = ArrayD::<i16>::zeros(IxDyn(&[4, 5, 6]).f());
        let affine = [
            [2.0, 0.0, 0.0, -4.0],
            [0.0, 2.0, 0.0, -5.0],
            [0.0, 0.0, 3.0, -9.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        let img = NiftiImage::from_array(data, affine);
        assert_eq!(img.shape(), &[4, 5, 6]);
        assert_eq!(img.dtype(), DataType::Int16);
        assert_eq!(img.zooms(), [2.0, 2.0, 3.0]);
        assert_eq!(img.affine(), affine);
    }

    #[test]
    fn test_bytes_are_fortran_order() {
        let mut data = ArrayD::<u8>::zeros(IxDyn(&[2, 2, 1]));
        data[[1, 0, 0]] = 1;
        data[[0, 1, 0]] = 2;
        data[[1, 1, 0]] = 3;
        let img = NiftiImage::from_array(data, IDENTITY);
        assert_eq!(img.data_to_bytes().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_scaling_applied_to_float_views() {
        let data = ArrayD::from_elem(IxDyn(&[2, 2, 2]).f(), 10i16);
        let img = NiftiImage::from_array(data, IDENTITY);
        let mut header = img.header().clone();
        header.scl_slope = 0.5;
        header.scl_inter = 1.0;
        let scaled = NiftiImage::from_parts(header, img.data().unwrap()).unwrap();
        assert!(scaled.to_f32().unwrap().iter().all(|&v| v == 6.0));
    }

    #[test]
    fn test_zero_slope_means_unscaled() {
        let data = ArrayD::from_elem(IxDyn(&[2, 2, 2]).f(), 7u8);
        let img = NiftiImage::from_array(data, IDENTITY);
        let mut header = img.header().clone();
        header.scl_slope = 0.0;
        let img = NiftiImage::from_parts(header, img.data().unwrap()).unwrap();
        assert!(img.to_f64().unwrap().iter().all(|&v| v == 7.0));
    }

    #[test]
    fn test_volume_squeezes_singleton_time_axis() {
        let data = ArrayD::<f32>::ones(IxDyn(&[3, 4, 5, 1]).f());
        let img = NiftiImage::from_array(data, IDENTITY);
        assert_eq!(img.volume_f32().unwrap().shape(), &[3, 4, 5]);

        let data = ArrayD::<f32>::ones(IxDyn(&[3, 4, 5, 2]).f());
        let img = NiftiImage::from_array(data, IDENTITY);
        assert!(matches!(img.volume_f32(), Err(Error::InvalidDimensions(_))));
    }

    #[test]
    fn test_from_f64_truncates_and_saturates() {
        let source = ArrayD::from_shape_vec(IxDyn(&[4]), vec![-3.7, 2.9, 300.0, f64::NAN]).unwrap();
        match ArrayData::from_f64(&source, DataType::UInt8).unwrap() {
            ArrayData::U8(a) => {
                assert_eq!(a.iter().copied().collect::<Vec<_>>(), vec![0, 2, 255, 0])
            }
            other => panic!("unexpected dtype {}", other.dtype()),
        }
        match ArrayData::from_f64(&source, DataType::Int16).unwrap() {
            ArrayData::I16(a) => {
                assert_eq!(a.iter().copied().collect::<Vec<_>>(), vec![-3, 2, 300, 0])
            }
            other => panic!("unexpected dtype {}", other.dtype()),
        }
    }

    #[test]
    fn test_from_template_keeps_geometry() {
        let data = ArrayD::<f32>::zeros(IxDyn(&[4, 4, 4]).f());
        let affine = [
            [-0.9, 0.0, 0.0, 10.0],
            [0.0, 0.9, 0.0, -20.0],
            [0.0, 0.0, 1.1, 5.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        let img = NiftiImage::from_array(data, affine);
        let mask = ArrayD::<u8>::ones(IxDyn(&[4, 4, 4]).f());
        let out = NiftiImage::from_template(img.header(), ArrayData::U8(mask)).unwrap();
        assert_eq!(out.dtype(), DataType::UInt8);
        assert_eq!(out.affine(), affine);
        assert_eq!(out.zooms(), img.zooms());
    }

    #[test]
    fn test_from_parts_shape_mismatch() {
        let img = NiftiImage::from_array(ArrayD::<u8>::zeros(IxDyn(&[2, 2, 2])), IDENTITY);
        let other = ArrayData::U8(ArrayD::zeros(IxDyn(&[3, 3, 3])));
        assert!(matches!(
            NiftiImage::from_parts(img.header().clone(), other),
            Err(Error::ShapeMismatch(_))
        ));
    }
}
