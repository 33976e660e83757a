//! Pinned access to piece-sized storage regions.
//!
//! The engine never owns piece bytes; it pins them. [`ChunkStore`] is the
//! seam the host implements: [`ChunkStore::get`] pins a piece and hands back
//! a [`ChunkHandle`], transfers copy block data through the handle, and the
//! pin is dropped strictly before the owning connection goes away. Hash
//! verification also lives behind this seam ([`ChunkStore::finish_piece`]),
//! so the engine only ever learns a boolean verdict per piece.
//!
//! [`MemoryChunkStore`] is the in-memory reference implementation, used by
//! the tests and suitable for small hosts.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Size of one scatter/gather memory area inside a piece.
const MEMORY_AREA_SIZE: u32 = 64 * 1024;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("piece {0} out of range")]
    OutOfRange(u32),

    #[error("write through read-only handle for piece {0}")]
    ReadOnly(u32),

    #[error("block outside piece: piece {piece}, offset {offset}, length {length}")]
    OutOfBounds { piece: u32, offset: u32, length: u32 },

    #[error("pin refused for piece {piece}: {reason}")]
    Refused { piece: u32, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Host-implemented piece storage.
pub trait ChunkStore: Send + Sync + 'static {
    fn piece_count(&self) -> u32;

    /// Size in bytes of the given piece (the last one may be short).
    fn piece_size(&self, index: u32) -> u32;

    /// Pins a piece and returns a handle to its memory areas.
    fn get(&self, index: u32, writable: bool) -> Result<ChunkHandle, ChunkError>;

    /// Hash-checks a fully downloaded piece. `Ok(true)` means the piece
    /// verified; `Ok(false)` means the data was bad and will be re-fetched.
    fn finish_piece(&self, index: u32) -> Result<bool, ChunkError>;

    /// Unpins a handle. Dropping the handle has the same effect; this form
    /// exists for call sites that want the release to read explicitly.
    fn release(&self, handle: ChunkHandle) {
        drop(handle);
    }
}

/// The memory areas of one piece, segmented the way a file-backed store
/// would hand out mapped regions.
#[derive(Debug)]
struct PieceMemory {
    length: u32,
    areas: Mutex<Vec<Vec<u8>>>,
}

impl PieceMemory {
    fn zeroed(length: u32) -> Self {
        let mut areas = Vec::new();
        let mut remaining = length;
        while remaining > 0 {
            let size = remaining.min(MEMORY_AREA_SIZE);
            areas.push(vec![0u8; size as usize]);
            remaining -= size;
        }
        Self {
            length,
            areas: Mutex::new(areas),
        }
    }

    fn digest(&self) -> [u8; 20] {
        let areas = self.areas.lock();
        let mut hasher = Sha1::new();
        for area in areas.iter() {
            hasher.update(area);
        }
        hasher.finalize().into()
    }
}

/// A pinned piece. Cloning is not offered; one handle per transfer.
///
/// The pin is held for the handle's whole lifetime and released on drop.
pub struct ChunkHandle {
    index: u32,
    writable: bool,
    memory: Arc<PieceMemory>,
    _pin: Arc<()>,
}

impl ChunkHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Piece length in bytes.
    pub fn len(&self) -> u32 {
        self.memory.length
    }

    pub fn is_empty(&self) -> bool {
        self.memory.length == 0
    }

    /// Copies `data` into the piece at `offset`, walking the underlying
    /// memory areas.
    pub fn write_at(&self, offset: u32, data: &[u8]) -> Result<(), ChunkError> {
        if !self.writable {
            return Err(ChunkError::ReadOnly(self.index));
        }
        self.check_span(offset, data.len() as u32)?;

        let mut areas = self.memory.areas.lock();
        let mut pos = offset;
        let mut src = data;

        while !src.is_empty() {
            let area = (pos / MEMORY_AREA_SIZE) as usize;
            let within = (pos % MEMORY_AREA_SIZE) as usize;
            let target = &mut areas[area];
            let count = src.len().min(target.len() - within);

            target[within..within + count].copy_from_slice(&src[..count]);
            src = &src[count..];
            pos += count as u32;
        }

        Ok(())
    }

    /// Copies `length` bytes out of the piece starting at `offset`.
    pub fn read_at(&self, offset: u32, length: u32) -> Result<Bytes, ChunkError> {
        self.check_span(offset, length)?;

        let areas = self.memory.areas.lock();
        let mut out = Vec::with_capacity(length as usize);
        let mut pos = offset;

        while out.len() < length as usize {
            let area = (pos / MEMORY_AREA_SIZE) as usize;
            let within = (pos % MEMORY_AREA_SIZE) as usize;
            let source = &areas[area];
            let count = (length as usize - out.len()).min(source.len() - within);

            out.extend_from_slice(&source[within..within + count]);
            pos += count as u32;
        }

        Ok(Bytes::from(out))
    }

    fn check_span(&self, offset: u32, length: u32) -> Result<(), ChunkError> {
        if u64::from(offset) + u64::from(length) > u64::from(self.memory.length) {
            return Err(ChunkError::OutOfBounds {
                piece: self.index,
                offset,
                length,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for ChunkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkHandle")
            .field("index", &self.index)
            .field("writable", &self.writable)
            .field("len", &self.memory.length)
            .finish()
    }
}

struct StoreState {
    pieces: Vec<Option<Arc<PieceMemory>>>,
    pins: HashMap<u32, Arc<()>>,
}

/// In-memory [`ChunkStore`] holding every piece in RAM, verifying against
/// the torrent's SHA-1 piece digests.
pub struct MemoryChunkStore {
    piece_length: u32,
    total_length: u64,
    hashes: Vec<[u8; 20]>,
    state: Mutex<StoreState>,
}

impl MemoryChunkStore {
    /// An empty store for a torrent with the given piece digests.
    pub fn new(piece_length: u32, total_length: u64, hashes: Vec<[u8; 20]>) -> Arc<Self> {
        let piece_count = hashes.len();
        Arc::new(Self {
            piece_length,
            total_length,
            hashes,
            state: Mutex::new(StoreState {
                pieces: (0..piece_count).map(|_| None).collect(),
                pins: HashMap::new(),
            }),
        })
    }

    /// A store pre-filled with `data`, hashing each piece. Used to stand up
    /// seed-side peers in tests.
    pub fn seeded(piece_length: u32, data: &[u8]) -> Arc<Self> {
        let total_length = data.len() as u64;
        let mut hashes = Vec::new();
        let mut pieces = Vec::new();

        for chunk in data.chunks(piece_length as usize) {
            let mut hasher = Sha1::new();
            hasher.update(chunk);
            hashes.push(hasher.finalize().into());

            let memory = PieceMemory::zeroed(chunk.len() as u32);
            {
                let mut areas = memory.areas.lock();
                let mut offset = 0usize;
                for area in areas.iter_mut() {
                    let len = area.len();
                    area.copy_from_slice(&chunk[offset..offset + len]);
                    offset += len;
                }
            }
            pieces.push(Some(Arc::new(memory)));
        }

        Arc::new(Self {
            piece_length,
            total_length,
            hashes,
            state: Mutex::new(StoreState {
                pieces,
                pins: HashMap::new(),
            }),
        })
    }

    /// Number of live pins on a piece.
    pub fn pin_count(&self, index: u32) -> usize {
        let state = self.state.lock();
        state
            .pins
            .get(&index)
            .map_or(0, |pin| Arc::strong_count(pin).saturating_sub(1))
    }
}

impl ChunkStore for MemoryChunkStore {
    fn piece_count(&self) -> u32 {
        self.hashes.len() as u32
    }

    fn piece_size(&self, index: u32) -> u32 {
        piece_size(self.piece_length, self.total_length, self.hashes.len() as u32, index)
    }

    fn get(&self, index: u32, writable: bool) -> Result<ChunkHandle, ChunkError> {
        if index >= self.piece_count() {
            return Err(ChunkError::OutOfRange(index));
        }

        let length = self.piece_size(index);
        let mut state = self.state.lock();

        let memory = state.pieces[index as usize]
            .get_or_insert_with(|| Arc::new(PieceMemory::zeroed(length)))
            .clone();
        let pin = state.pins.entry(index).or_insert_with(|| Arc::new(())).clone();

        Ok(ChunkHandle {
            index,
            writable,
            memory,
            _pin: pin,
        })
    }

    fn finish_piece(&self, index: u32) -> Result<bool, ChunkError> {
        if index >= self.piece_count() {
            return Err(ChunkError::OutOfRange(index));
        }

        let memory = {
            let state = self.state.lock();
            match &state.pieces[index as usize] {
                Some(memory) => memory.clone(),
                None => return Ok(false),
            }
        };

        let ok = memory.digest() == self.hashes[index as usize];
        if !ok {
            tracing::debug!(piece = index, "piece failed hash check");
        }
        Ok(ok)
    }
}

/// Size of piece `index` for a torrent of `total_length` bytes.
pub fn piece_size(piece_length: u32, total_length: u64, piece_count: u32, index: u32) -> u32 {
    if piece_count == 0 || index >= piece_count {
        return 0;
    }
    if index + 1 < piece_count {
        return piece_length;
    }
    let remainder = total_length % u64::from(piece_length);
    if remainder == 0 {
        piece_length
    } else {
        remainder as u32
    }
}
