//! NIfTI file I/O.
//!
//! `.nii` files are memory mapped; `.nii.gz` files are inflated in one pass
//! with libdeflate, falling back to a streaming decoder for multi-member
//! archives or payloads whose size trailer is unreliable. Writes compress
//! large payloads in parallel with gzp.

use super::header::NiftiHeader;
use super::image::NiftiImage;
use crate::error::{Error, Result};
use flate2::bufread::MultiGzDecoder;
use gzp::deflate::Gzip;
use gzp::par::compress::ParCompressBuilder;
use gzp::ZWriter;
use libdeflater::{CompressionLvl, Compressor, DecompressionError, Decompressor};
use memmap2::Mmap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

thread_local! {
    static DECOMPRESSOR: std::cell::RefCell<Decompressor> = std::cell::RefCell::new(Decompressor::new());
}

/// 256KB buffer for streaming decompression.
const GZIP_BUFFER_SIZE: usize = 256 * 1024;

/// Payloads at least this large are compressed with the parallel writer.
const PARALLEL_THRESHOLD: usize = 1024 * 1024;

const MAX_HEADER_SIZE: usize = 540;

fn is_gzipped(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "gz")
}

#[cfg(target_os = "linux")]
fn read_file_with_readahead(path: &Path) -> Result<Vec<u8>> {
    use std::os::unix::io::AsRawFd;

    let file = File::open(path)?;
    let len = file.metadata()?.len() as usize;

    // SAFETY: advisory call on a descriptor we own for the duration of the call.
    unsafe {
        libc::posix_fadvise(
            file.as_raw_fd(),
            0,
            len as libc::off_t,
            libc::POSIX_FADV_SEQUENTIAL,
        );
    }

    let mut buffer = Vec::with_capacity(len);
    BufReader::with_capacity(GZIP_BUFFER_SIZE, file).read_to_end(&mut buffer)?;
    Ok(buffer)
}

#[cfg(not(target_os = "linux"))]
fn read_file_with_readahead(path: &Path) -> Result<Vec<u8>> {
    Ok(std::fs::read(path)?)
}

/// ISIZE per RFC 1952: original size modulo 2^32, exact only for
/// single-member archives below 4GB.
fn gzip_isize(compressed: &[u8]) -> usize {
    match compressed.len().checked_sub(4) {
        Some(start) => {
            let trailer = &compressed[start..];
            u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]) as usize
        }
        None => 0,
    }
}

fn decompress_streaming(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = MultiGzDecoder::new(BufReader::with_capacity(GZIP_BUFFER_SIZE, compressed));
    let mut output = Vec::with_capacity(gzip_isize(compressed));
    decoder
        .read_to_end(&mut output)
        .map_err(|e| Error::Decompression(format!("gzip stream decode failed: {e}")))?;
    Ok(output)
}

fn decompress(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut output = vec![0u8; gzip_isize(compressed).max(MAX_HEADER_SIZE)];
    let result = DECOMPRESSOR.with(|d| d.borrow_mut().gzip_decompress(compressed, &mut output));

    match result {
        Ok(written) => {
            output.truncate(written);
            Ok(output)
        }
        Err(DecompressionError::InsufficientSpace) => {
            debug!("gzip size trailer too small, using streaming decoder");
            decompress_streaming(compressed)
        }
        Err(e) => Err(Error::Decompression(e.to_string())),
    }
}

fn check_payload(bytes: &[u8], header: &NiftiHeader) -> Result<(usize, usize)> {
    let offset = usize::try_from(header.vox_offset)
        .map_err(|_| Error::InvalidDimensions(format!("vox_offset {}", header.vox_offset)))?;
    let data_size = header.data_size();
    if bytes.len() < offset + data_size {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!(
                "file truncated: {} bytes, need {} (offset {} + data {})",
                bytes.len(),
                offset + data_size,
                offset,
                data_size
            ),
        )));
    }
    Ok((offset, data_size))
}

/// Load a NIfTI image from `.nii` or `.nii.gz`.
///
/// Header extensions are skipped; voxel data is located via `vox_offset`.
#[must_use = "this function returns a loaded image that should be used"]
pub fn load<P: AsRef<Path>>(path: P) -> Result<NiftiImage> {
    let path = path.as_ref();
    if is_gzipped(path) {
        load_gzipped(path)
    } else {
        load_uncompressed(path)
    }
}

#[allow(unsafe_code)]
fn load_uncompressed(path: &Path) -> Result<NiftiImage> {
    let file = File::open(path)?;
    // SAFETY: read-only mapping of a file we just opened; external modification
    // can change the contents but not the mapping's validity.
    let mmap = unsafe { Mmap::map(&file)? };

    let header = NiftiHeader::from_bytes(&mmap)?;
    let (offset, data_size) = check_payload(&mmap, &header)?;
    Ok(NiftiImage::from_shared_bytes(
        header,
        Arc::new(mmap),
        offset,
        data_size,
    ))
}

fn load_gzipped(path: &Path) -> Result<NiftiImage> {
    let compressed = read_file_with_readahead(path)?;
    let mut output = decompress(&compressed)?;
    let mut header = NiftiHeader::from_bytes(&output)?;

    // A multi-member archive can inflate to exactly its last member's ISIZE.
    if output.len() < header.vox_offset as usize + header.data_size() {
        output = decompress_streaming(&compressed)?;
        header = NiftiHeader::from_bytes(&output)?;
    }

    let (offset, data_size) = check_payload(&output, &header)?;
    Ok(NiftiImage::from_shared_bytes(
        header,
        Arc::new(output),
        offset,
        data_size,
    ))
}

/// Load only the header from a NIfTI file.
#[allow(unsafe_code)]
pub fn load_header<P: AsRef<Path>>(path: P) -> Result<NiftiHeader> {
    let path = path.as_ref();
    if is_gzipped(path) {
        let reader = BufReader::new(File::open(path)?);
        let mut buf = Vec::with_capacity(MAX_HEADER_SIZE);
        MultiGzDecoder::new(reader)
            .take(MAX_HEADER_SIZE as u64)
            .read_to_end(&mut buf)
            .map_err(|e| Error::Decompression(format!("gzip header decode failed: {e}")))?;
        NiftiHeader::from_bytes(&buf)
    } else {
        let file = File::open(path)?;
        // SAFETY: read-only mapping, see `load_uncompressed`.
        let mmap = unsafe { Mmap::map(&file)? };
        NiftiHeader::from_bytes(&mmap)
    }
}

/// Save a NIfTI image; gzip is chosen by a `.gz` extension.
///
/// Output is little-endian, keeps the header's version and carries no
/// extensions.
pub fn save<P: AsRef<Path>>(image: &NiftiImage, path: P) -> Result<()> {
    let mut header = image.header().clone();
    header.vox_offset = header.version.default_vox_offset();
    header.validate()?;

    let path = path.as_ref();
    let data = image.data_to_bytes()?;
    if data.len() != header.data_size() {
        return Err(Error::ShapeMismatch(format!(
            "{} data bytes for a header describing {}",
            data.len(),
            header.data_size()
        )));
    }

    let mut prefix = header.to_bytes();
    // Four zero bytes: no extensions follow.
    prefix.resize(header.vox_offset as usize, 0u8);

    if is_gzipped(path) {
        save_gzipped(&prefix, &data, path)
    } else {
        save_uncompressed(&prefix, &data, path)
    }
}

fn save_uncompressed(prefix: &[u8], data: &[u8], path: &Path) -> Result<()> {
    let mut writer = BufWriter::with_capacity(1024 * 1024, File::create(path)?);
    writer.write_all(prefix)?;
    writer.write_all(data)?;
    writer.flush()?;
    Ok(())
}

fn save_gzipped(prefix: &[u8], data: &[u8], path: &Path) -> Result<()> {
    let mut uncompressed = Vec::with_capacity(prefix.len() + data.len());
    uncompressed.extend_from_slice(prefix);
    uncompressed.extend_from_slice(data);

    if uncompressed.len() >= PARALLEL_THRESHOLD {
        let writer = BufWriter::with_capacity(1024 * 1024, File::create(path)?);
        let mut parz = ParCompressBuilder::<Gzip>::new().from_writer(writer);
        parz.write_all(&uncompressed).map_err(|e| {
            Error::Io(std::io::Error::other(format!(
                "parallel compression failed: {e}"
            )))
        })?;
        parz.finish().map_err(|e| {
            Error::Io(std::io::Error::other(format!(
                "parallel compression finish failed: {e}"
            )))
        })?;
    } else {
        let mut compressor = Compressor::new(CompressionLvl::fastest());
        let mut compressed = vec![0u8; compressor.gzip_compress_bound(uncompressed.len())];
        let size = compressor
            .gzip_compress(&uncompressed, &mut compressed)
            .map_err(|e| Error::Io(std::io::Error::other(format!("compression failed: {e:?}"))))?;
        compressed.truncate(size);
        File::create(path)?.write_all(&compressed)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nifti::DataType;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use ndarray::{ArrayD, IxDyn, ShapeBuilder};
    use tempfile::tempdir;

    fn create_f_order_array(data: Vec<f32>, shape: Vec<usize>) -> ArrayD<f32> {
        let c_order = ArrayD::from_shape_vec(shape.clone(), data).unwrap();
        let mut f_order = ArrayD::zeros(IxDyn(&shape).f());
        f_order.assign(&c_order);
        f_order
    }

    const AFFINE: [[f64; 4]; 4] = [
        [2.0, 0.0, 0.0, -10.0],
        [0.0, 2.0, 0.0, -10.0],
        [0.0, 0.0, 2.0, -10.0],
        [0.0, 0.0, 0.0, 1.0],
    ];

    #[test]
    fn test_roundtrip_uncompressed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.nii");

        let data = create_f_order_array((0..1000).map(|i| i as f32).collect(), vec![10, 10, 10]);
        let img = NiftiImage::from_array(data.clone(), AFFINE);

        save(&img, &path).unwrap();
        let loaded = load(&path).unwrap();

        assert_eq!(loaded.shape(), &[10, 10, 10]);
        assert_eq!(loaded.affine(), AFFINE);
        assert_eq!(loaded.to_f32().unwrap(), data);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 352 + 4000);
    }

    #[test]
    fn test_roundtrip_gzipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.nii.gz");

        let data = create_f_order_array((0..1000).map(|i| i as f32).collect(), vec![10, 10, 10]);
        let img = NiftiImage::from_array(data.clone(), AFFINE);

        save(&img, &path).unwrap();
        let loaded = load(&path).unwrap();

        assert_eq!(loaded.shape(), &[10, 10, 10]);
        assert_eq!(loaded.affine(), AFFINE);
        assert_eq!(loaded.to_f32().unwrap(), data);
    }

    #[test]
    fn test_roundtrip_gzipped_parallel() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("large.nii.gz");

        let shape = vec![64, 64, 80];
        let data =
            ArrayD::from_shape_fn(IxDyn(&shape).f(), |idx| (idx[0] + idx[1] * idx[2]) as i32);
        let img = NiftiImage::from_array(data.clone(), AFFINE);

        save(&img, &path).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.dtype(), DataType::Int32);
        assert_eq!(loaded.to_f64().unwrap(), data.mapv(f64::from));
    }

    #[test]
    fn test_multimember_gzip_fallback() {
        let dir = tempdir().unwrap();
        let base_path = dir.path().join("base.nii");
        let path = dir.path().join("multi.nii.gz");

        let data = create_f_order_array((0..1000).map(|i| i as f32).collect(), vec![10, 10, 10]);
        save(&NiftiImage::from_array(data.clone(), AFFINE), &base_path).unwrap();

        let bytes = std::fs::read(&base_path).unwrap();
        let split = bytes.len() / 2;

        let mut multi_member = Vec::new();
        for part in [&bytes[..split], &bytes[split..]] {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
            encoder.write_all(part).unwrap();
            multi_member.extend(encoder.finish().unwrap());
        }
        std::fs::write(&path, multi_member).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.shape(), &[10, 10, 10]);
        assert_eq!(loaded.to_f32().unwrap(), data);
    }

    #[test]
    fn test_extensions_are_skipped() {
        let dir = tempdir().unwrap();
        let plain = dir.path().join("plain.nii");
        let extended = dir.path().join("extended.nii");

        let data = create_f_order_array((0..27).map(|i| i as f32).collect(), vec![3, 3, 3]);
        save(&NiftiImage::from_array(data.clone(), AFFINE), &plain).unwrap();

        // Splice a 16-byte extension between header and data.
        let bytes = std::fs::read(&plain).unwrap();
        let mut spliced = bytes[..348].to_vec();
        spliced[108..112].copy_from_slice(&(368.0f32).to_le_bytes());
        spliced.extend_from_slice(&[1, 0, 0, 0]);
        spliced.extend_from_slice(&16i32.to_le_bytes());
        spliced.extend_from_slice(&4i32.to_le_bytes());
        spliced.extend_from_slice(&[0u8; 8]);
        spliced.extend_from_slice(&bytes[352..]);
        std::fs::write(&extended, spliced).unwrap();

        let loaded = load(&extended).unwrap();
        assert_eq!(loaded.to_f32().unwrap(), data);
    }

    #[test]
    fn test_truncated_file_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.nii");
        let data = create_f_order_array(vec![1.0; 1000], vec![10, 10, 10]);
        save(&NiftiImage::from_array(data, AFFINE), &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();
        assert!(matches!(load(&path), Err(Error::Io(_))));
    }

    #[test]
    fn test_load_header_gzipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hdr.nii.gz");
        let data = create_f_order_array(vec![0.0; 24], vec![2, 3, 4]);
        save(&NiftiImage::from_array(data, AFFINE), &path).unwrap();

        let header = load_header(&path).unwrap();
        assert_eq!(header.shape(), vec![2, 3, 4]);
        assert_eq!(header.zooms(), [2.0, 2.0, 2.0]);
    }
}
