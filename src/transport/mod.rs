//! Shared-image transport: zero-copy locally, packed bytes remotely.
//!
//! A client asking for a named image takes one of two paths. On the same
//! host it maps the shared region directly and asks the server to release
//! the name - one round-trip plus a memory map, no copies. Across hosts the
//! server packs the image: a little-endian `u16` header length, a JSON
//! header `(dtype, shape, order)`, then the raw or compressed pixel bytes.
//! Host locality is decided by comparing hostnames at connect time.
//!
//! Supported compressors: none, zlib (optional level), and LZ4 block
//! compression for fast links.

use std::io::Write;
use std::sync::Arc;

use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use ism_buffer::{BufferRegistry, IsmArray, Order, DTYPE_U16_LE};
use serde::{Deserialize, Serialize};

use crate::error::{ScopeError, ScopeResult};

/// Compression applied to the pixel payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum Compressor {
    /// Raw pixel bytes.
    None,
    /// zlib/DEFLATE; `level` 0-9, library default when unset.
    Zlib {
        /// Compression level.
        #[serde(default)]
        level: Option<u32>,
    },
    /// LZ4 block compression (size-prepended).
    Lz4,
}

fn transport_err(message: impl Into<String>) -> ScopeError {
    ScopeError::Transport(message.into())
}

fn compress(compressor: &Compressor, payload: &[u8]) -> ScopeResult<Vec<u8>> {
    match compressor {
        Compressor::None => Ok(payload.to_vec()),
        Compressor::Zlib { level } => {
            if let Some(level) = level {
                if *level > 9 {
                    return Err(transport_err(format!("invalid zlib level {level}")));
                }
            }
            let compression = level.map_or_else(Compression::default, Compression::new);
            let mut encoder = ZlibEncoder::new(Vec::new(), compression);
            encoder
                .write_all(payload)
                .and_then(|()| encoder.finish())
                .map_err(|e| transport_err(format!("zlib compression failed: {e}")))
        }
        Compressor::Lz4 => Ok(lz4_flex::compress_prepend_size(payload)),
    }
}

fn decompress(compressor: &Compressor, payload: &[u8]) -> ScopeResult<Vec<u8>> {
    match compressor {
        Compressor::None => Ok(payload.to_vec()),
        Compressor::Zlib { .. } => {
            let mut decoder = ZlibDecoder::new(Vec::new());
            decoder
                .write_all(payload)
                .and_then(|()| decoder.finish())
                .map_err(|e| transport_err(format!("zlib decompression failed: {e}")))
        }
        Compressor::Lz4 => lz4_flex::decompress_size_prepended(payload)
            .map_err(|e| transport_err(format!("lz4 decompression failed: {e}"))),
    }
}

/// An image received over the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnpackedImage {
    /// `(width, height)`.
    pub shape: (usize, usize),
    /// Memory layout of `data`.
    pub order: Order,
    /// Pixels, flattened in `order`.
    pub data: Vec<u16>,
}

impl UnpackedImage {
    /// Pixel at `(x, y)`.
    pub fn pixel(&self, x: usize, y: usize) -> u16 {
        let (w, h) = self.shape;
        let index = match self.order {
            Order::F => x + y * w,
            Order::C => x * h + y,
        };
        self.data[index]
    }
}

/// Server-side transport surface over the buffer registry.
pub struct ImageTransfer {
    registry: Arc<BufferRegistry>,
    node: String,
}

impl ImageTransfer {
    /// Wrap a registry.
    pub fn new(registry: Arc<BufferRegistry>) -> Self {
        Self {
            registry,
            node: local_node(),
        }
    }

    /// Host identifier clients compare against their own to pick the local
    /// or remote path.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Release a pending transfer without returning data (the same-host
    /// client already mapped the region itself).
    pub fn release(&self, name: &str) -> ScopeResult<()> {
        self.registry.release(name)?;
        Ok(())
    }

    /// Pack the named image for a remote client, releasing the name.
    ///
    /// `downsample` keeps only every n-th pixel in both dimensions before
    /// serialization.
    pub fn pack(
        &self,
        name: &str,
        compressor: &Compressor,
        downsample: Option<usize>,
    ) -> ScopeResult<Vec<u8>> {
        let array = self.registry.release(name)?;
        pack_array(&array, compressor, downsample)
    }
}

/// Serialize an image array into the wire format.
pub fn pack_array(
    array: &IsmArray,
    compressor: &Compressor,
    downsample: Option<usize>,
) -> ScopeResult<Vec<u8>> {
    let step = downsample.unwrap_or(1).max(1);
    let (width, height) = array.shape();
    let (out_width, out_height) = (width.div_ceil(step), height.div_ceil(step));

    let mut pixels = Vec::with_capacity(out_width * out_height);
    match array.order() {
        Order::F => {
            for y in (0..height).step_by(step) {
                for x in (0..width).step_by(step) {
                    pixels.push(array.pixel(x, y));
                }
            }
        }
        Order::C => {
            for x in (0..width).step_by(step) {
                for y in (0..height).step_by(step) {
                    pixels.push(array.pixel(x, y));
                }
            }
        }
    }

    let header = serde_json::to_vec(&(
        DTYPE_U16_LE,
        (out_width, out_height),
        array.order().as_char().to_string(),
    ))
    .map_err(|e| transport_err(format!("header encoding failed: {e}")))?;
    let header_len = u16::try_from(header.len())
        .map_err(|_| transport_err("header too long for the u16 length prefix"))?;

    let mut payload = Vec::with_capacity(pixels.len() * 2);
    for pixel in pixels {
        payload.extend_from_slice(&pixel.to_le_bytes());
    }
    let body = compress(compressor, &payload)?;

    let mut output = Vec::with_capacity(2 + header.len() + body.len());
    output.extend_from_slice(&header_len.to_le_bytes());
    output.extend_from_slice(&header);
    output.extend_from_slice(&body);
    Ok(output)
}

/// Reverse [`pack_array`] on the client side. The compressor must match the
/// one the server used.
pub fn unpack(buf: &[u8], compressor: &Compressor) -> ScopeResult<UnpackedImage> {
    if buf.len() < 2 {
        return Err(transport_err("packed image shorter than its length prefix"));
    }
    let header_len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < 2 + header_len {
        return Err(transport_err("packed image truncated inside its header"));
    }
    let (dtype, shape, order): (String, (usize, usize), String) =
        serde_json::from_slice(&buf[2..2 + header_len])
            .map_err(|e| transport_err(format!("bad image header: {e}")))?;
    if dtype != DTYPE_U16_LE {
        return Err(transport_err(format!("unsupported image dtype {dtype}")));
    }
    let order = order
        .chars()
        .next()
        .and_then(Order::from_char)
        .ok_or_else(|| transport_err(format!("unsupported array order {order}")))?;

    let payload = decompress(compressor, &buf[2 + header_len..])?;
    let expected = shape.0 * shape.1 * 2;
    if payload.len() != expected {
        return Err(transport_err(format!(
            "payload is {} bytes, expected {expected} for shape {shape:?}",
            payload.len()
        )));
    }
    let data = payload
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Ok(UnpackedImage {
        shape,
        order,
        data,
    })
}

/// This machine's host identifier.
pub fn local_node() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string())
}

/// Whether a server reporting `server_node` shares this host, and can thus
/// serve images through shared memory instead of the wire.
pub fn is_local(server_node: &str) -> bool {
    server_node == local_node()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_transfer() -> (tempfile::TempDir, Arc<BufferRegistry>, ImageTransfer) {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(BufferRegistry::with_dir(dir.path().to_path_buf()));
        let transfer = ImageTransfer::new(registry.clone());
        (dir, registry, transfer)
    }

    fn ascending_image(registry: &BufferRegistry, name: &str, shape: (usize, usize)) {
        let mut array = registry.create(name, shape, Order::F).expect("create");
        for (i, px) in array.as_mut_slice().iter_mut().enumerate() {
            *px = i as u16;
        }
        registry.register_for_transfer(Arc::new(array));
    }

    #[test]
    fn round_trip_every_compressor() {
        let (_dir, registry, transfer) = test_transfer();
        for (i, compressor) in [
            Compressor::None,
            Compressor::Zlib { level: None },
            Compressor::Zlib { level: Some(9) },
            Compressor::Lz4,
        ]
        .iter()
        .enumerate()
        {
            let name = format!("img-{i}");
            ascending_image(&registry, &name, (16, 8));
            let packed = transfer.pack(&name, compressor, None).expect("pack");
            let image = unpack(&packed, compressor).expect("unpack");
            assert_eq!(image.shape, (16, 8));
            assert_eq!(image.order, Order::F);
            let expected: Vec<u16> = (0..16 * 8).map(|v| v as u16).collect();
            assert_eq!(image.data, expected);
        }
    }

    #[test]
    fn pack_releases_the_pending_transfer() {
        let (_dir, registry, transfer) = test_transfer();
        ascending_image(&registry, "once", (4, 4));
        assert_eq!(registry.pending("once"), 1);
        transfer
            .pack("once", &Compressor::None, None)
            .expect("pack");
        assert_eq!(registry.pending("once"), 0);
        assert!(transfer.pack("once", &Compressor::None, None).is_err());
    }

    #[test]
    fn downsample_keeps_the_stride_subarray() {
        let (_dir, registry, transfer) = test_transfer();
        ascending_image(&registry, "down", (8, 8));
        let packed = transfer
            .pack("down", &Compressor::Zlib { level: Some(2) }, Some(2))
            .expect("pack");
        let image = unpack(&packed, &Compressor::Zlib { level: Some(2) }).expect("unpack");
        assert_eq!(image.shape, (4, 4));
        for y in 0..4 {
            for x in 0..4 {
                // source pixel (2x, 2y) of the F-ordered ascending image
                assert_eq!(image.pixel(x, y), (2 * x + 2 * y * 8) as u16);
            }
        }
    }

    #[test]
    fn header_length_is_little_endian() {
        let (_dir, registry, transfer) = test_transfer();
        ascending_image(&registry, "hdr", (2, 2));
        let packed = transfer.pack("hdr", &Compressor::None, None).expect("pack");
        let header_len = u16::from_le_bytes([packed[0], packed[1]]) as usize;
        let header: serde_json::Value =
            serde_json::from_slice(&packed[2..2 + header_len]).expect("json header");
        assert_eq!(header[0], DTYPE_U16_LE);
        assert_eq!(header[2], "F");
    }

    #[test]
    fn truncated_input_is_rejected() {
        assert!(unpack(&[0x05], &Compressor::None).is_err());
        assert!(unpack(&[0xFF, 0x00, b'{'], &Compressor::None).is_err());
    }

    #[test]
    fn mismatched_payload_size_is_rejected() {
        let (_dir, registry, transfer) = test_transfer();
        ascending_image(&registry, "short", (4, 4));
        let mut packed = transfer.pack("short", &Compressor::None, None).expect("pack");
        packed.truncate(packed.len() - 2);
        assert!(unpack(&packed, &Compressor::None).is_err());
    }

    #[test]
    fn invalid_zlib_level_is_rejected() {
        let (_dir, registry, transfer) = test_transfer();
        ascending_image(&registry, "lvl", (2, 2));
        assert!(transfer
            .pack("lvl", &Compressor::Zlib { level: Some(99) }, None)
            .is_err());
    }

    #[test]
    fn locality_compares_hostnames() {
        assert!(is_local(&local_node()));
        assert!(!is_local("definitely-some-other-host"));
    }
}
