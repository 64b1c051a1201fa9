//! `NIfTI` header parsing and representation.
//!
//! Reads NIfTI-1 (348-byte) and NIfTI-2 (540-byte) headers in either byte
//! order. Headers are always written little-endian in the version they were
//! read with, so a segmentation output keeps the format of its input.

use crate::error::{Error, Result};
use crate::transforms::Affine;
use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// NIfTI format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NiftiVersion {
    /// NIfTI-1 format (348-byte header, 16-bit dimensions)
    #[default]
    Nifti1,
    /// NIfTI-2 format (540-byte header, 64-bit dimensions)
    Nifti2,
}

impl NiftiVersion {
    /// Header size in bytes for this version.
    pub const fn header_size(self) -> usize {
        match self {
            Self::Nifti1 => 348,
            Self::Nifti2 => 540,
        }
    }

    /// Offset of the voxel data when no extensions are present.
    pub const fn default_vox_offset(self) -> i64 {
        match self {
            Self::Nifti1 => 352,
            Self::Nifti2 => 544,
        }
    }
}

mod offsets_v1 {
    pub const DIM: usize = 40;
    pub const INTENT_CODE: usize = 68;
    pub const DATATYPE: usize = 70;
    pub const BITPIX: usize = 72;
    pub const PIXDIM: usize = 76;
    pub const VOX_OFFSET: usize = 108;
    pub const SCL_SLOPE: usize = 112;
    pub const SCL_INTER: usize = 116;
    pub const XYZT_UNITS: usize = 123;
    pub const DESCRIP: usize = 148;
    pub const QFORM_CODE: usize = 252;
    pub const SFORM_CODE: usize = 254;
    pub const QUATERN_B: usize = 256;
    pub const QOFFSET_X: usize = 268;
    pub const SROW_X: usize = 280;
    pub const MAGIC: usize = 344;
}

mod offsets_v2 {
    pub const MAGIC: usize = 4;
    pub const DATATYPE: usize = 12;
    pub const BITPIX: usize = 14;
    pub const DIM: usize = 16;
    pub const PIXDIM: usize = 104;
    pub const VOX_OFFSET: usize = 168;
    pub const SCL_SLOPE: usize = 176;
    pub const SCL_INTER: usize = 184;
    pub const DESCRIP: usize = 240;
    pub const QFORM_CODE: usize = 344;
    pub const SFORM_CODE: usize = 348;
    pub const QUATERN_B: usize = 352;
    pub const QOFFSET_X: usize = 376;
    pub const SROW_X: usize = 400;
    pub const XYZT_UNITS: usize = 500;
    pub const INTENT_CODE: usize = 504;
}

const DESCRIP_LEN: usize = 80;

/// `NIfTI` data type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum DataType {
    /// Unsigned 8-bit integer
    UInt8 = 2,
    /// Signed 16-bit integer
    Int16 = 4,
    /// Signed 32-bit integer
    Int32 = 8,
    /// 32-bit floating point
    Float32 = 16,
    /// 64-bit floating point
    Float64 = 64,
    /// Signed 8-bit integer
    Int8 = 256,
    /// Unsigned 16-bit integer
    UInt16 = 512,
    /// Unsigned 32-bit integer
    UInt32 = 768,
    /// Signed 64-bit integer
    Int64 = 1024,
    /// Unsigned 64-bit integer
    UInt64 = 1280,
}

impl DataType {
    /// Parse from `NIfTI` datatype code.
    pub fn from_code(code: i16) -> Result<Self> {
        match code {
            2 => Ok(Self::UInt8),
            4 => Ok(Self::Int16),
            8 => Ok(Self::Int32),
            16 => Ok(Self::Float32),
            64 => Ok(Self::Float64),
            256 => Ok(Self::Int8),
            512 => Ok(Self::UInt16),
            768 => Ok(Self::UInt32),
            1024 => Ok(Self::Int64),
            1280 => Ok(Self::UInt64),
            _ => Err(Error::UnsupportedDataType(code)),
        }
    }

    /// Size of each element in bytes.
    pub const fn byte_size(self) -> usize {
        match self {
            Self::UInt8 | Self::Int8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
        }
    }

    /// Whether values of this type are stored as floating point.
    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    /// Rust spelling of the element type.
    pub const fn type_name(self) -> &'static str {
        match self {
            Self::UInt8 => "u8",
            Self::Int8 => "i8",
            Self::Int16 => "i16",
            Self::UInt16 => "u16",
            Self::Int32 => "i32",
            Self::UInt32 => "u32",
            Self::Int64 => "i64",
            Self::UInt64 => "u64",
            Self::Float32 => "f32",
            Self::Float64 => "f64",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Unified header for both NIfTI versions.
///
/// Dimensions are kept as `i64` and floating fields as `f64` so that NIfTI-2
/// headers survive a round trip; NIfTI-1 writes downcast them.
#[derive(Debug, Clone)]
pub struct NiftiHeader {
    /// NIfTI format version.
    pub version: NiftiVersion,
    /// Number of dimensions (1-7).
    pub ndim: u8,
    /// Extent along each dimension.
    pub dim: [i64; 7],
    /// Stored element type.
    pub datatype: DataType,
    /// qfac at index 0, voxel spacing at 1..=ndim.
    pub pixdim: [f64; 8],
    /// Byte offset of the voxel data.
    pub vox_offset: i64,
    /// Intensity scaling slope (0 means unscaled).
    pub scl_slope: f64,
    /// Intensity scaling intercept.
    pub scl_inter: f64,
    /// Raw spatial/temporal unit code.
    pub xyzt_units: u8,
    /// Intent code.
    pub intent_code: i32,
    /// Free-form description.
    pub descrip: String,
    /// qform transform code.
    pub qform_code: i32,
    /// sform transform code.
    pub sform_code: i32,
    /// Quaternion b, c, d.
    pub quatern: [f64; 3],
    /// qform translation.
    pub qoffset: [f64; 3],
    /// sform rows.
    pub srow: [[f64; 4]; 3],
    pub(crate) little_endian: bool,
}

impl Default for NiftiHeader {
    fn default() -> Self {
        Self {
            version: NiftiVersion::Nifti1,
            ndim: 3,
            dim: [1; 7],
            datatype: DataType::Float32,
            pixdim: [1.0; 8],
            vox_offset: NiftiVersion::Nifti1.default_vox_offset(),
            scl_slope: 1.0,
            scl_inter: 0.0,
            // millimetres
            xyzt_units: 2,
            intent_code: 0,
            descrip: String::new(),
            qform_code: 0,
            sform_code: 1,
            quatern: [0.0; 3],
            qoffset: [0.0; 3],
            srow: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
            ],
            little_endian: true,
        }
    }
}

fn read_f32s<E: ByteOrder, const N: usize>(bytes: &[u8], offset: usize) -> [f64; N] {
    std::array::from_fn(|i| E::read_f32(&bytes[offset + i * 4..]) as f64)
}

fn read_f64s<E: ByteOrder, const N: usize>(bytes: &[u8], offset: usize) -> [f64; N] {
    std::array::from_fn(|i| E::read_f64(&bytes[offset + i * 8..]))
}

fn read_text(bytes: &[u8], offset: usize, len: usize) -> String {
    String::from_utf8_lossy(&bytes[offset..offset + len])
        .trim_end_matches('\0')
        .to_string()
}

fn write_text(buf: &mut [u8], offset: usize, len: usize, text: &str) {
    let raw = text.as_bytes();
    let n = raw.len().min(len - 1);
    buf[offset..offset + n].copy_from_slice(&raw[..n]);
}

impl NiftiHeader {
    /// Read a header, detecting version and byte order from `sizeof_hdr`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "header too short to detect version",
            )));
        }

        let (version, little_endian) = match (
            LittleEndian::read_i32(&bytes[..4]),
            BigEndian::read_i32(&bytes[..4]),
        ) {
            (348, _) => (NiftiVersion::Nifti1, true),
            (_, 348) => (NiftiVersion::Nifti1, false),
            (540, _) => (NiftiVersion::Nifti2, true),
            (_, 540) => (NiftiVersion::Nifti2, false),
            _ => return Err(Error::InvalidMagic([bytes[0], bytes[1], bytes[2], bytes[3]])),
        };

        if bytes.len() < version.header_size() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "header too short: got {} bytes, need {} for {:?}",
                    bytes.len(),
                    version.header_size(),
                    version
                ),
            )));
        }

        let header = match (version, little_endian) {
            (NiftiVersion::Nifti1, true) => Self::parse_v1::<LittleEndian>(bytes)?,
            (NiftiVersion::Nifti1, false) => Self::parse_v1::<BigEndian>(bytes)?,
            (NiftiVersion::Nifti2, true) => Self::parse_v2::<LittleEndian>(bytes)?,
            (NiftiVersion::Nifti2, false) => Self::parse_v2::<BigEndian>(bytes)?,
        };
        let header = Self {
            little_endian,
            ..header
        };
        header.validate()?;
        Ok(header)
    }

    #[allow(clippy::wildcard_imports)]
    fn parse_v1<E: ByteOrder>(bytes: &[u8]) -> Result<Self> {
        use offsets_v1::*;

        let magic = &bytes[MAGIC..MAGIC + 4];
        if magic != b"n+1\0" && magic != b"ni1\0" {
            return Err(Error::InvalidMagic([magic[0], magic[1], magic[2], magic[3]]));
        }

        let ndim = check_ndim(E::read_i16(&bytes[DIM..]) as i64)?;
        let mut dim = [0i64; 7];
        for (i, d) in dim.iter_mut().enumerate() {
            *d = E::read_i16(&bytes[DIM + 2 + i * 2..]) as i64;
        }

        let datatype = DataType::from_code(E::read_i16(&bytes[DATATYPE..]))?;
        check_bitpix(datatype, E::read_i16(&bytes[BITPIX..]))?;

        let vox_offset = E::read_f32(&bytes[VOX_OFFSET..]);
        if !vox_offset.is_finite() || vox_offset.fract() != 0.0 {
            return Err(Error::InvalidDimensions(format!(
                "vox_offset must be a finite integer, got {}",
                vox_offset
            )));
        }

        let srow_x = read_f32s::<E, 4>(bytes, SROW_X);
        let srow_y = read_f32s::<E, 4>(bytes, SROW_X + 16);
        let srow_z = read_f32s::<E, 4>(bytes, SROW_X + 32);

        Ok(Self {
            version: NiftiVersion::Nifti1,
            ndim,
            dim,
            datatype,
            pixdim: read_f32s::<E, 8>(bytes, PIXDIM),
            vox_offset: vox_offset as i64,
            scl_slope: E::read_f32(&bytes[SCL_SLOPE..]) as f64,
            scl_inter: E::read_f32(&bytes[SCL_INTER..]) as f64,
            xyzt_units: bytes[XYZT_UNITS],
            intent_code: E::read_i16(&bytes[INTENT_CODE..]) as i32,
            descrip: read_text(bytes, DESCRIP, DESCRIP_LEN),
            qform_code: E::read_i16(&bytes[QFORM_CODE..]) as i32,
            sform_code: E::read_i16(&bytes[SFORM_CODE..]) as i32,
            quatern: read_f32s::<E, 3>(bytes, QUATERN_B),
            qoffset: read_f32s::<E, 3>(bytes, QOFFSET_X),
            srow: [srow_x, srow_y, srow_z],
            little_endian: true,
        })
    }

    #[allow(clippy::wildcard_imports)]
    fn parse_v2<E: ByteOrder>(bytes: &[u8]) -> Result<Self> {
        use offsets_v2::*;

        let magic = &bytes[MAGIC..MAGIC + 8];
        if magic != b"n+2\0\r\n\x1a\n" && magic != b"ni2\0\r\n\x1a\n" {
            return Err(Error::InvalidMagic([magic[0], magic[1], magic[2], magic[3]]));
        }

        let ndim = check_ndim(E::read_i64(&bytes[DIM..]))?;
        let mut dim = [0i64; 7];
        for (i, d) in dim.iter_mut().enumerate() {
            *d = E::read_i64(&bytes[DIM + 8 + i * 8..]);
        }

        let datatype = DataType::from_code(E::read_i16(&bytes[DATATYPE..]))?;
        check_bitpix(datatype, E::read_i16(&bytes[BITPIX..]))?;

        Ok(Self {
            version: NiftiVersion::Nifti2,
            ndim,
            dim,
            datatype,
            pixdim: read_f64s::<E, 8>(bytes, PIXDIM),
            vox_offset: E::read_i64(&bytes[VOX_OFFSET..]),
            scl_slope: E::read_f64(&bytes[SCL_SLOPE..]),
            scl_inter: E::read_f64(&bytes[SCL_INTER..]),
            xyzt_units: E::read_i32(&bytes[XYZT_UNITS..]) as u8,
            intent_code: E::read_i32(&bytes[INTENT_CODE..]),
            descrip: read_text(bytes, DESCRIP, DESCRIP_LEN),
            qform_code: E::read_i32(&bytes[QFORM_CODE..]),
            sform_code: E::read_i32(&bytes[SFORM_CODE..]),
            quatern: read_f64s::<E, 3>(bytes, QUATERN_B),
            qoffset: read_f64s::<E, 3>(bytes, QOFFSET_X),
            srow: [
                read_f64s::<E, 4>(bytes, SROW_X),
                read_f64s::<E, 4>(bytes, SROW_X + 32),
                read_f64s::<E, 4>(bytes, SROW_X + 64),
            ],
            little_endian: true,
        })
    }

    /// Serialize the header (little-endian, same version as `self.version`).
    pub fn to_bytes(&self) -> Vec<u8> {
        match self.version {
            NiftiVersion::Nifti1 => self.to_bytes_v1(),
            NiftiVersion::Nifti2 => self.to_bytes_v2(),
        }
    }

    #[allow(clippy::wildcard_imports)]
    fn to_bytes_v1(&self) -> Vec<u8> {
        use offsets_v1::*;
        type E = LittleEndian;

        let mut buf = vec![0u8; NiftiVersion::Nifti1.header_size()];
        E::write_i32(&mut buf[0..4], 348);

        E::write_i16(&mut buf[DIM..], self.ndim as i16);
        for (i, &d) in self.dim.iter().enumerate() {
            E::write_i16(&mut buf[DIM + 2 + i * 2..], d.min(i16::MAX as i64) as i16);
        }
        E::write_i16(&mut buf[INTENT_CODE..], self.intent_code as i16);
        E::write_i16(&mut buf[DATATYPE..], self.datatype as i16);
        E::write_i16(&mut buf[BITPIX..], (self.datatype.byte_size() * 8) as i16);
        for (i, &p) in self.pixdim.iter().enumerate() {
            E::write_f32(&mut buf[PIXDIM + i * 4..], p as f32);
        }
        E::write_f32(&mut buf[VOX_OFFSET..], self.vox_offset as f32);
        E::write_f32(&mut buf[SCL_SLOPE..], self.scl_slope as f32);
        E::write_f32(&mut buf[SCL_INTER..], self.scl_inter as f32);
        buf[XYZT_UNITS] = self.xyzt_units;
        write_text(&mut buf, DESCRIP, DESCRIP_LEN, &self.descrip);
        E::write_i16(&mut buf[QFORM_CODE..], self.qform_code as i16);
        E::write_i16(&mut buf[SFORM_CODE..], self.sform_code as i16);
        for i in 0..3 {
            E::write_f32(&mut buf[QUATERN_B + i * 4..], self.quatern[i] as f32);
            E::write_f32(&mut buf[QOFFSET_X + i * 4..], self.qoffset[i] as f32);
        }
        for (r, row) in self.srow.iter().enumerate() {
            for (c, &v) in row.iter().enumerate() {
                E::write_f32(&mut buf[SROW_X + r * 16 + c * 4..], v as f32);
            }
        }
        buf[MAGIC..MAGIC + 4].copy_from_slice(b"n+1\0");
        buf
    }

    #[allow(clippy::wildcard_imports)]
    fn to_bytes_v2(&self) -> Vec<u8> {
        use offsets_v2::*;
        type E = LittleEndian;

        let mut buf = vec![0u8; NiftiVersion::Nifti2.header_size()];
        E::write_i32(&mut buf[0..4], 540);
        buf[MAGIC..MAGIC + 8].copy_from_slice(b"n+2\0\r\n\x1a\n");
        E::write_i16(&mut buf[DATATYPE..], self.datatype as i16);
        E::write_i16(&mut buf[BITPIX..], (self.datatype.byte_size() * 8) as i16);
        E::write_i64(&mut buf[DIM..], self.ndim as i64);
        for (i, &d) in self.dim.iter().enumerate() {
            E::write_i64(&mut buf[DIM + 8 + i * 8..], d);
        }
        for (i, &p) in self.pixdim.iter().enumerate() {
            E::write_f64(&mut buf[PIXDIM + i * 8..], p);
        }
        E::write_i64(&mut buf[VOX_OFFSET..], self.vox_offset);
        E::write_f64(&mut buf[SCL_SLOPE..], self.scl_slope);
        E::write_f64(&mut buf[SCL_INTER..], self.scl_inter);
        write_text(&mut buf, DESCRIP, DESCRIP_LEN, &self.descrip);
        E::write_i32(&mut buf[QFORM_CODE..], self.qform_code);
        E::write_i32(&mut buf[SFORM_CODE..], self.sform_code);
        for i in 0..3 {
            E::write_f64(&mut buf[QUATERN_B + i * 8..], self.quatern[i]);
            E::write_f64(&mut buf[QOFFSET_X + i * 8..], self.qoffset[i]);
        }
        for (r, row) in self.srow.iter().enumerate() {
            for (c, &v) in row.iter().enumerate() {
                E::write_f64(&mut buf[SROW_X + r * 32 + c * 8..], v);
            }
        }
        E::write_i32(&mut buf[XYZT_UNITS..], self.xyzt_units as i32);
        E::write_i32(&mut buf[INTENT_CODE..], self.intent_code);
        buf
    }

    /// Voxel-to-world transform: sform, then qform, then the base affine.
    pub fn affine(&self) -> Affine {
        if self.sform_code > 0 {
            let [x, y, z] = self.srow;
            [x, y, z, [0.0, 0.0, 0.0, 1.0]]
        } else if self.qform_code > 0 {
            self.qform_affine()
        } else {
            self.base_affine()
        }
    }

    /// Radiological scaling centred on the volume: x flipped, voxel
    /// `(dim - 1) / 2` at world origin.
    pub fn base_affine(&self) -> Affine {
        let zooms = [-self.pixdim[1], self.pixdim[2], self.pixdim[3]];
        let mut affine = [
            [zooms[0], 0.0, 0.0, 0.0],
            [0.0, zooms[1], 0.0, 0.0],
            [0.0, 0.0, zooms[2], 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        for axis in 0..3 {
            let extent = if axis < self.ndim as usize {
                self.dim[axis]
            } else {
                1
            };
            affine[axis][3] = -zooms[axis] * (extent - 1) as f64 / 2.0;
        }
        affine
    }

    /// Store `affine` as the sform and derive spacing from its column norms.
    pub fn set_affine(&mut self, affine: Affine) {
        self.srow = [affine[0], affine[1], affine[2]];
        self.sform_code = 1;
        for axis in 0..3 {
            self.pixdim[axis + 1] = (0..3)
                .map(|row| affine[row][axis] * affine[row][axis])
                .sum::<f64>()
                .sqrt();
        }
    }

    /// Overwrite the spatial voxel sizes, leaving the affine untouched.
    pub fn set_zooms(&mut self, zooms: [f64; 3]) {
        self.pixdim[1..4].copy_from_slice(&zooms);
    }

    #[allow(clippy::many_single_char_names)]
    fn qform_affine(&self) -> Affine {
        let [b, c, d] = self.quatern;
        let a = (1.0 - b * b - c * c - d * d).max(0.0).sqrt();
        let qfac = if self.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let [i, j, k] = [self.pixdim[1], self.pixdim[2], self.pixdim[3] * qfac];

        [
            [
                (a * a + b * b - c * c - d * d) * i,
                2.0 * (b * c - a * d) * j,
                2.0 * (b * d + a * c) * k,
                self.qoffset[0],
            ],
            [
                2.0 * (b * c + a * d) * i,
                (a * a - b * b + c * c - d * d) * j,
                2.0 * (c * d - a * b) * k,
                self.qoffset[1],
            ],
            [
                2.0 * (b * d - a * c) * i,
                2.0 * (c * d + a * b) * j,
                (a * a - b * b - c * c + d * d) * k,
                self.qoffset[2],
            ],
            [0.0, 0.0, 0.0, 1.0],
        ]
    }

    /// Extents of the `ndim` leading dimensions.
    pub fn shape(&self) -> Vec<usize> {
        self.dim[..self.ndim as usize]
            .iter()
            .map(|&d| d as usize)
            .collect()
    }

    /// Spatial voxel sizes (`pixdim[1..=3]`), as stored.
    pub fn zooms(&self) -> [f64; 3] {
        [self.pixdim[1], self.pixdim[2], self.pixdim[3]]
    }

    /// Total number of voxels.
    pub fn num_voxels(&self) -> usize {
        self.shape().iter().product()
    }

    /// Size of the voxel payload in bytes.
    pub fn data_size(&self) -> usize {
        self.num_voxels() * self.datatype.byte_size()
    }

    /// Returns true if the source file was little endian.
    pub fn is_little_endian(&self) -> bool {
        self.little_endian
    }

    /// Whether a stored value must be transformed by slope/intercept.
    pub fn has_scaling(&self) -> bool {
        (self.scl_slope != 0.0 && self.scl_slope != 1.0) || self.scl_inter != 0.0
    }

    /// Validate the invariants every readable or writable header must hold.
    pub fn validate(&self) -> Result<()> {
        check_ndim(self.ndim as i64)?;

        let mut voxels: usize = 1;
        for i in 0..self.ndim as usize {
            if self.dim[i] <= 0 {
                return Err(Error::InvalidDimensions(format!(
                    "dimension {} must be positive, got {}",
                    i, self.dim[i]
                )));
            }
            voxels = voxels
                .checked_mul(self.dim[i] as usize)
                .ok_or_else(|| Error::InvalidDimensions("dimension product overflow".into()))?;
        }
        voxels
            .checked_mul(self.datatype.byte_size())
            .ok_or_else(|| Error::InvalidDimensions("data size overflow".into()))?;

        for i in 1..=self.ndim.min(3) as usize {
            let spacing = self.pixdim[i];
            if !spacing.is_finite() || spacing <= 0.0 {
                return Err(Error::InvalidDimensions(format!(
                    "pixdim[{}] must be finite and > 0, got {}",
                    i, spacing
                )));
            }
        }

        let min_offset = self.version.header_size() as i64;
        if self.vox_offset < min_offset {
            return Err(Error::InvalidDimensions(format!(
                "vox_offset {} before header end ({})",
                self.vox_offset, min_offset
            )));
        }

        Ok(())
    }
}

fn check_ndim(ndim: i64) -> Result<u8> {
    if (1..=7).contains(&ndim) {
        Ok(ndim as u8)
    } else {
        Err(Error::InvalidDimensions(format!(
            "ndim must be 1..=7, got {}",
            ndim
        )))
    }
}

fn check_bitpix(datatype: DataType, bitpix: i16) -> Result<()> {
    let expected = (datatype.byte_size() * 8) as i16;
    if bitpix == expected {
        Ok(())
    } else {
        Err(Error::InvalidDimensions(format!(
            "bitpix {} does not match datatype {} (expected {})",
            bitpix, datatype, expected
        )))
    }
}
