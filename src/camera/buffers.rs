//! Raw-buffer handling: queueing, conversion, and the metadata trailer.
//!
//! Raw device buffers end with a sequence of metadata chunks laid out as
//! `[payload][chunk_id: u32 LE][length: u32 LE]`, where `length` covers
//! payload + chunk id. Parsing walks backward from the end of the buffer.
//! Chunk id 1 carries the frame timestamp: 8 bytes of little-endian unsigned
//! sensor-clock ticks.

use std::sync::Arc;

use ism_buffer::{BufferRegistry, IsmArray, Order};

use crate::camera::driver::CameraDriver;
use crate::error::ScopeResult;

/// Chunk id of the frame timestamp.
pub const TIMESTAMP_CHUNK_ID: u32 = 1;

/// Find `desired_id` in the metadata trailer and return its payload.
pub fn parse_buffer_metadata(buffer: &[u8], desired_id: u32) -> Option<&[u8]> {
    let mut offset = buffer.len();
    while offset >= 8 {
        let length_start = offset - 4;
        let cid_start = length_start - 4;
        let length = u32::from_le_bytes(buffer[length_start..offset].try_into().ok()?) as usize;
        let chunk_id = u32::from_le_bytes(buffer[cid_start..length_start].try_into().ok()?);
        // length includes the chunk id word
        let payload_len = length.checked_sub(4)?;
        let chunk_start = cid_start.checked_sub(payload_len)?;
        if chunk_id == desired_id {
            return Some(&buffer[chunk_start..cid_start]);
        }
        offset = chunk_start;
    }
    None
}

/// Extract the sensor-clock timestamp, if the trailer carries one.
pub fn parse_timestamp(buffer: &[u8]) -> Option<u64> {
    let payload = parse_buffer_metadata(buffer, TIMESTAMP_CHUNK_ID)?;
    let bytes: [u8; 8] = payload.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

/// Append one metadata chunk in trailer layout. Used by the mock driver and
/// by round-trip tests; real hardware writes the same layout itself.
pub fn write_buffer_metadata(buffer: &mut Vec<u8>, chunk_id: u32, payload: &[u8]) {
    buffer.extend_from_slice(payload);
    buffer.extend_from_slice(&chunk_id.to_le_bytes());
    let length = payload.len() as u32 + 4;
    buffer.extend_from_slice(&length.to_le_bytes());
}

/// Append a timestamp chunk.
pub fn write_timestamp(buffer: &mut Vec<u8>, ticks: u64) {
    write_buffer_metadata(buffer, TIMESTAMP_CHUNK_ID, &ticks.to_le_bytes());
}

/// Converts raw device buffers into named shared-memory images.
///
/// Snapshots the AOI geometry and pixel encoding at creation time (they are
/// fixed for the duration of an acquisition), allocates raw buffers for the
/// driver queue, and hands out sequentially-named output arrays.
pub struct BufferFactory {
    driver: Arc<dyn CameraDriver>,
    registry: Arc<BufferRegistry>,
    namebase: String,
    shape: (usize, usize),
    stride: usize,
    input_encoding: String,
    image_bytes: usize,
    single_name: bool,
    converted: u64,
    queued: usize,
}

impl BufferFactory {
    /// Snapshot the current geometry. `single_name` collapses the name
    /// sequence to just `namebase` for one-shot acquisitions.
    pub fn new(
        driver: Arc<dyn CameraDriver>,
        registry: Arc<BufferRegistry>,
        namebase: impl Into<String>,
        frame_count: Option<u64>,
    ) -> ScopeResult<Self> {
        let width = driver.get_int("AOIWidth")? as usize;
        let height = driver.get_int("AOIHeight")? as usize;
        let stride = driver.get_int("AOIStride")? as usize;
        let encoding_index = driver.enum_index("PixelEncoding")?;
        let input_encoding = driver.enum_string_by_index("PixelEncoding", encoding_index)?;
        let image_bytes = driver.get_int("ImageSizeBytes")? as usize;
        Ok(Self {
            driver,
            registry,
            namebase: namebase.into(),
            shape: (width, height),
            stride,
            input_encoding,
            image_bytes,
            single_name: frame_count == Some(1),
            converted: 0,
            queued: 0,
        })
    }

    /// `(width, height)` of the output images.
    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// Bytes per raw device buffer.
    pub fn image_bytes(&self) -> usize {
        self.image_bytes
    }

    fn next_name(&self) -> String {
        if self.single_name {
            self.namebase.clone()
        } else {
            format!("{}{}", self.namebase, self.converted)
        }
    }

    /// Allocate and queue one raw buffer.
    pub fn queue_buffer(&mut self) -> ScopeResult<()> {
        self.driver.queue_buffer(vec![0u8; self.image_bytes])?;
        self.queued += 1;
        Ok(())
    }

    /// Queue a buffer only if none is outstanding.
    pub fn queue_if_needed(&mut self) -> ScopeResult<()> {
        if self.queued == 0 {
            self.queue_buffer()?;
        }
        Ok(())
    }

    /// Convert a filled raw buffer into the next named output array. The
    /// array is created column-major so the `(width, height)` shape matches
    /// sensor readout, and is *not* yet registered for transfer.
    pub fn convert_buffer(&mut self, raw: &[u8]) -> ScopeResult<(Arc<IsmArray>, Option<u64>)> {
        let name = self.next_name();
        let mut array = self.registry.create(&name, self.shape, Order::F)?;
        let timestamp = parse_timestamp(raw);
        self.driver.convert_buffer(
            raw,
            array.as_mut_slice(),
            self.shape.0,
            self.shape.1,
            self.stride,
            &self.input_encoding,
        )?;
        self.converted += 1;
        self.queued = self.queued.saturating_sub(1);
        Ok((Arc::new(array), timestamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_round_trips_through_the_trailer() {
        let mut buffer = vec![0u8; 64];
        write_timestamp(&mut buffer, 123_456_789_012);
        assert_eq!(parse_timestamp(&buffer), Some(123_456_789_012));
    }

    #[test]
    fn parser_walks_past_later_chunks() {
        let mut buffer = vec![0u8; 32];
        write_timestamp(&mut buffer, 42);
        // a later chunk of another kind sits closer to the end
        write_buffer_metadata(&mut buffer, 7, b"frameinfo");
        assert_eq!(parse_timestamp(&buffer), Some(42));
        assert_eq!(
            parse_buffer_metadata(&buffer, 7),
            Some(b"frameinfo".as_slice())
        );
    }

    #[test]
    fn missing_chunk_yields_none() {
        let buffer = vec![0u8; 16];
        assert_eq!(parse_timestamp(&buffer), None);
    }

    #[test]
    fn truncated_trailer_is_rejected() {
        let mut buffer = Vec::new();
        write_timestamp(&mut buffer, 99);
        // chop off part of the payload; the backward walk must not panic
        let truncated = &buffer[4..];
        assert_eq!(parse_timestamp(truncated), None);
    }
}
