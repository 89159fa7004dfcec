//! Named shared-memory image buffers.
//!
#![allow(unsafe_code)] // mmap-backed pixel views require raw slices - intentional and documented
//! Acquired frames are handed to clients by *name* rather than by value: the
//! server writes pixels into a shared-memory region identified by a string,
//! and a client on the same host maps the same region with zero copies. The
//! [`BufferRegistry`] tracks which named regions still have an outstanding
//! transfer pending, so the backing memory is only reclaimed once the server
//! and every interested client have let go.
//!
//! Each region is self-describing: a small JSON header (dtype, shape, order)
//! is stored in front of the pixel data, so `open()` needs nothing but the
//! name.
//!
//! # Lifecycle
//!
//! 1. `registry.create(name, shape, order)` allocates the region and returns
//!    a writable array.
//! 2. The producer fills the pixels, then `register_for_transfer()` parks an
//!    `Arc` of the array under its name. Registration must happen before the
//!    name is announced to any other process.
//! 3. A consumer either maps the region directly (same host) or asks the
//!    server to serialize it, and finally `release()`s the name.
//! 4. When the last `Arc` drops, the creating side unlinks the backing file.
//!    Already-mapped clients keep a valid mapping; the kernel reclaims the
//!    pages when the final mapping goes away.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::MmapMut;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

/// Magic bytes identifying a shared image region.
const MAGIC: &[u8; 4] = b"ISMB";

/// Pixel data is aligned to this boundary within the region.
const DATA_ALIGN: usize = 8;

/// Numpy-style dtype descriptor for the 16-bit little-endian pixels the
/// sensors produce. The header carries it so the wire format and remote
/// clients agree on the element type without further negotiation.
pub const DTYPE_U16_LE: &str = "<u2";

/// Errors from shared-buffer creation, mapping, and registry operations.
#[derive(Error, Debug)]
pub enum IsmError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No buffer registered under name '{0}'")]
    UnknownName(String),

    #[error("Shared region '{0}' has an invalid header: {1}")]
    BadHeader(String, String),

    #[error("Buffer name '{0}' contains illegal characters")]
    BadName(String),
}

/// Convenience alias for registry results.
pub type IsmResult<T> = std::result::Result<T, IsmError>;

/// Memory layout of a 2-D array.
///
/// Images coming off the sensor are stored column-major (`F`) so that the
/// (width, height) shape matches the readout geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Order {
    /// Row-major (first index slowest).
    C,
    /// Column-major (first index fastest).
    F,
}

impl Order {
    /// Single-character code used in serialized headers.
    pub fn as_char(self) -> char {
        match self {
            Order::C => 'C',
            Order::F => 'F',
        }
    }

    /// Parse the single-character header code.
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'C' => Some(Order::C),
            'F' => Some(Order::F),
            _ => None,
        }
    }
}

/// Directory that holds the backing files for shared regions.
///
/// `/dev/shm` keeps the pages purely in RAM on Linux; elsewhere the system
/// temp dir is used.
pub fn shm_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

fn region_path(dir: &Path, name: &str) -> IsmResult<PathBuf> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(IsmError::BadName(name.to_string()));
    }
    Ok(dir.join(format!("ism-{name}")))
}

fn data_offset(header_len: usize) -> usize {
    let unaligned = MAGIC.len() + 2 + header_len;
    unaligned.div_ceil(DATA_ALIGN) * DATA_ALIGN
}

/// A named, shared-memory-backed 2-D array of 16-bit pixels.
///
/// The mapping stays valid for the lifetime of this value even if the
/// creating process unlinks the backing file.
pub struct IsmArray {
    name: String,
    path: PathBuf,
    map: MmapMut,
    shape: (usize, usize),
    order: Order,
    data_start: usize,
    /// The creating side unlinks the file on drop; openers never do.
    owner: bool,
}

impl IsmArray {
    /// Allocate a new shared region under `name` and return a zeroed,
    /// writable array of the given `(width, height)` shape.
    pub fn create(dir: &Path, name: &str, shape: (usize, usize), order: Order) -> IsmResult<Self> {
        let path = region_path(dir, name)?;
        let header = serde_json::to_vec(&(
            DTYPE_U16_LE,
            (shape.0, shape.1),
            order.as_char().to_string(),
        ))
        .map_err(|e| IsmError::BadHeader(name.to_string(), e.to_string()))?;
        let start = data_offset(header.len());
        let total = start + shape.0 * shape.1 * 2;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(total as u64)?;
        // SAFETY: the file was just created with the required length and is
        // only shared through this named-region protocol.
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        map[..MAGIC.len()].copy_from_slice(MAGIC);
        let len = u16::try_from(header.len())
            .map_err(|_| IsmError::BadHeader(name.to_string(), "header too long".into()))?;
        map[MAGIC.len()..MAGIC.len() + 2].copy_from_slice(&len.to_le_bytes());
        map[MAGIC.len() + 2..MAGIC.len() + 2 + header.len()].copy_from_slice(&header);

        debug!(name, ?shape, bytes = total, "created shared image region");
        Ok(Self {
            name: name.to_string(),
            path,
            map,
            shape,
            order,
            data_start: start,
            owner: true,
        })
    }

    /// Map an existing shared region by name, reading its geometry from the
    /// embedded header.
    pub fn open(dir: &Path, name: &str) -> IsmResult<Self> {
        let path = region_path(dir, name)?;
        let file = File::options().read(true).write(true).open(&path)?;
        // SAFETY: mapping length is taken from the file itself; the header is
        // validated before any typed access.
        let map = unsafe { MmapMut::map_mut(&file)? };
        if map.len() < MAGIC.len() + 2 || &map[..MAGIC.len()] != MAGIC {
            return Err(IsmError::BadHeader(name.to_string(), "bad magic".into()));
        }
        let header_len = u16::from_le_bytes([map[4], map[5]]) as usize;
        if map.len() < MAGIC.len() + 2 + header_len {
            return Err(IsmError::BadHeader(name.to_string(), "truncated header".into()));
        }
        let header = &map[MAGIC.len() + 2..MAGIC.len() + 2 + header_len];
        let (dtype, shape, order): (String, (usize, usize), String) =
            serde_json::from_slice(header)
                .map_err(|e| IsmError::BadHeader(name.to_string(), e.to_string()))?;
        if dtype != DTYPE_U16_LE {
            return Err(IsmError::BadHeader(
                name.to_string(),
                format!("unsupported dtype {dtype}"),
            ));
        }
        let order = order
            .chars()
            .next()
            .and_then(Order::from_char)
            .ok_or_else(|| IsmError::BadHeader(name.to_string(), format!("bad order {order}")))?;
        let start = data_offset(header_len);
        if map.len() < start + shape.0 * shape.1 * 2 {
            return Err(IsmError::BadHeader(name.to_string(), "region too small".into()));
        }
        Ok(Self {
            name: name.to_string(),
            path,
            map,
            shape,
            order,
            data_start: start,
            owner: false,
        })
    }

    /// The registry name of this buffer.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `(width, height)` of the image.
    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// Memory layout of the pixel data.
    pub fn order(&self) -> Order {
        self.order
    }

    /// Number of pixels.
    pub fn len(&self) -> usize {
        self.shape.0 * self.shape.1
    }

    /// True when the image has zero pixels.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read-only view of the pixels.
    pub fn as_slice(&self) -> &[u16] {
        let bytes = &self.map[self.data_start..self.data_start + self.len() * 2];
        // SAFETY: data_start is 8-byte aligned within a page-aligned mapping,
        // and the length was validated against the mapping on create/open.
        unsafe { std::slice::from_raw_parts(bytes.as_ptr().cast::<u16>(), self.len()) }
    }

    /// Mutable view of the pixels. Requires unique access, which confines
    /// writes to the producer before the array is shared via the registry.
    pub fn as_mut_slice(&mut self) -> &mut [u16] {
        let len = self.len();
        let bytes = &mut self.map[self.data_start..self.data_start + len * 2];
        // SAFETY: as for as_slice; &mut self guarantees exclusivity on this
        // side of the mapping.
        unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr().cast::<u16>(), len) }
    }

    /// Fetch pixel `(x, y)` honoring the array order.
    pub fn pixel(&self, x: usize, y: usize) -> u16 {
        let (w, h) = self.shape;
        let idx = match self.order {
            Order::F => x + y * w,
            Order::C => x * h + y,
        };
        self.as_slice()[idx]
    }
}

impl Drop for IsmArray {
    fn drop(&mut self) {
        if self.owner {
            if let Err(e) = std::fs::remove_file(&self.path) {
                // Already-unlinked regions are fine; anything else is worth a log line.
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(name = %self.name, error = %e, "failed to unlink shared image region");
                }
            }
        }
    }
}

impl std::fmt::Debug for IsmArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsmArray")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .field("order", &self.order)
            .field("owner", &self.owner)
            .finish()
    }
}

/// Process-wide map from buffer names to their pending transfers.
///
/// Each name holds a stack of `Arc<IsmArray>`: the same name can be queued
/// several times when multiple clients request the same live frame, and the
/// stack length is exactly the number of outstanding deliveries. The mutex is
/// held only around map mutation, never across I/O.
pub struct BufferRegistry {
    dir: PathBuf,
    entries: Mutex<HashMap<String, Vec<Arc<IsmArray>>>>,
}

impl BufferRegistry {
    /// Registry using the default shared-memory directory.
    pub fn new() -> Self {
        Self::with_dir(shm_dir())
    }

    /// Registry with an explicit backing directory (tests point this at a
    /// tempdir).
    pub fn with_dir(dir: PathBuf) -> Self {
        Self {
            dir,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Directory holding the backing files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Allocate a fresh writable array under `name`. The array is *not*
    /// registered for transfer until the producer has filled it.
    pub fn create(&self, name: &str, shape: (usize, usize), order: Order) -> IsmResult<IsmArray> {
        IsmArray::create(&self.dir, name, shape, order)
    }

    /// Map an existing region by name (same-host client path).
    pub fn open(&self, name: &str) -> IsmResult<IsmArray> {
        IsmArray::open(&self.dir, name)
    }

    /// Park `array` under its name for a pending transfer. May be called for
    /// the same name repeatedly; each call adds one outstanding delivery.
    pub fn register_for_transfer(&self, array: Arc<IsmArray>) {
        let mut entries = self.entries.lock();
        entries.entry(array.name().to_string()).or_default().push(array);
    }

    /// Pop the most recently registered array for `name`, dropping the entry
    /// when no deliveries remain.
    pub fn release(&self, name: &str) -> IsmResult<Arc<IsmArray>> {
        let mut entries = self.entries.lock();
        let stack = entries
            .get_mut(name)
            .ok_or_else(|| IsmError::UnknownName(name.to_string()))?;
        let array = stack
            .pop()
            .ok_or_else(|| IsmError::UnknownName(name.to_string()))?;
        if stack.is_empty() {
            entries.remove(name);
        }
        Ok(array)
    }

    /// The most recently registered array for `name`, left in place for a
    /// later transfer.
    pub fn borrow(&self, name: &str) -> IsmResult<Arc<IsmArray>> {
        let entries = self.entries.lock();
        entries
            .get(name)
            .and_then(|stack| stack.last())
            .cloned()
            .ok_or_else(|| IsmError::UnknownName(name.to_string()))
    }

    /// Number of outstanding deliveries for `name` (0 when absent).
    pub fn pending(&self, name: &str) -> usize {
        self.entries.lock().get(name).map_or(0, Vec::len)
    }
}

impl Default for BufferRegistry {
    fn default() -> Self {
        Self::new()
    }
}
