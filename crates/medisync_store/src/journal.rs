//! Append-only record journal with CRC-framed CBOR records.

use crate::error::{StoreError, StoreResult};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Size of the frame header: 4-byte length + 4-byte CRC32.
const FRAME_HEADER: usize = 8;

/// A byte sink for journal frames.
///
/// Backends are opaque byte stores. The journal owns all framing and
/// record interpretation; backends only append, read back, and replace.
pub trait JournalBackend: Send {
    /// Appends raw frame bytes to the end of the journal.
    fn append(&mut self, frame: &[u8]) -> StoreResult<()>;

    /// Ensures all appended bytes are durable.
    fn sync(&mut self) -> StoreResult<()>;

    /// Returns the full journal contents for replay.
    fn contents(&self) -> StoreResult<Vec<u8>>;

    /// Atomically replaces the journal contents (compaction).
    fn replace(&mut self, frames: &[u8]) -> StoreResult<()>;
}

/// An in-memory journal backend for tests and ephemeral stores.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    data: Vec<u8>,
}

impl MemoryJournal {
    /// Creates a new empty in-memory journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a journal pre-seeded with raw bytes.
    ///
    /// Useful for testing recovery from torn or corrupt tails.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl JournalBackend for MemoryJournal {
    fn append(&mut self, frame: &[u8]) -> StoreResult<()> {
        self.data.extend_from_slice(frame);
        Ok(())
    }

    fn sync(&mut self) -> StoreResult<()> {
        Ok(())
    }

    fn contents(&self) -> StoreResult<Vec<u8>> {
        Ok(self.data.clone())
    }

    fn replace(&mut self, frames: &[u8]) -> StoreResult<()> {
        self.data = frames.to_vec();
        Ok(())
    }
}

/// A file-backed journal backend.
///
/// `replace` writes a sibling temp file and renames it over the journal,
/// so a crash during compaction leaves either the old or the new journal.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    file: File,
}

impl FileJournal {
    /// Opens or creates a journal file at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Returns the journal file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl JournalBackend for FileJournal {
    fn append(&mut self, frame: &[u8]) -> StoreResult<()> {
        self.file.write_all(frame)?;
        Ok(())
    }

    fn sync(&mut self) -> StoreResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn contents(&self) -> StoreResult<Vec<u8>> {
        let mut file = File::open(&self.path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn replace(&mut self, frames: &[u8]) -> StoreResult<()> {
        let tmp = self.path.with_extension("journal.tmp");
        {
            let mut out = File::create(&tmp)?;
            out.write_all(frames)?;
            out.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        let file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        self.file = file;
        self.file.seek(SeekFrom::End(0))?;
        Ok(())
    }
}

/// A typed record journal.
///
/// Records are serialized to CBOR and framed as
/// `[len: u32 LE][crc32: u32 LE][payload]`. Replay decodes frames in
/// order and stops at the first torn or corrupt frame, which recovers
/// cleanly from a crash mid-append.
pub struct Journal<R> {
    backend: Mutex<Box<dyn JournalBackend>>,
    appended: AtomicUsize,
    _marker: PhantomData<fn(R) -> R>,
}

impl<R: Serialize + DeserializeOwned> Journal<R> {
    /// Opens a journal over the given backend and replays its records.
    pub fn open(backend: Box<dyn JournalBackend>) -> StoreResult<(Self, Vec<R>)> {
        let records = replay(backend.contents()?.as_slice());
        let journal = Self {
            backend: Mutex::new(backend),
            appended: AtomicUsize::new(records.len()),
            _marker: PhantomData,
        };
        Ok((journal, records))
    }

    /// Appends one record and makes it durable.
    pub fn append(&self, record: &R) -> StoreResult<()> {
        let frame = encode_frame(record)?;
        let mut backend = self.backend.lock();
        backend.append(&frame)?;
        backend.sync()?;
        self.appended.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Appends a batch of records under one sync.
    pub fn append_all(&self, records: &[R]) -> StoreResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut frames = Vec::new();
        for record in records {
            frames.extend_from_slice(&encode_frame(record)?);
        }
        let mut backend = self.backend.lock();
        backend.append(&frames)?;
        backend.sync()?;
        self.appended.fetch_add(records.len(), Ordering::Relaxed);
        Ok(())
    }

    /// Rewrites the journal from the given live records (compaction).
    pub fn rewrite(&self, records: &[R]) -> StoreResult<()> {
        let mut frames = Vec::new();
        for record in records {
            frames.extend_from_slice(&encode_frame(record)?);
        }
        let mut backend = self.backend.lock();
        backend.replace(&frames)?;
        backend.sync()?;
        self.appended.store(records.len(), Ordering::Relaxed);
        Ok(())
    }

    /// Returns the number of records written since open or last rewrite.
    pub fn record_count(&self) -> usize {
        self.appended.load(Ordering::Relaxed)
    }
}

impl<R> std::fmt::Debug for Journal<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("appended", &self.appended.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn encode_frame<R: Serialize>(record: &R) -> StoreResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::ser::into_writer(record, &mut payload)
        .map_err(|e| StoreError::Encode(e.to_string()))?;

    let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&compute_crc32(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes frames in order, stopping at the first torn or corrupt frame.
fn replay<R: DeserializeOwned>(bytes: &[u8]) -> Vec<R> {
    let mut records = Vec::new();
    let mut cursor = 0usize;

    while bytes.len() - cursor >= FRAME_HEADER {
        let len =
            u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap_or([0; 4])) as usize;
        let crc = u32::from_le_bytes(bytes[cursor + 4..cursor + 8].try_into().unwrap_or([0; 4]));
        let start = cursor + FRAME_HEADER;

        if start + len > bytes.len() {
            tracing::warn!(offset = cursor, "torn frame at journal tail, ending replay");
            break;
        }

        let payload = &bytes[start..start + len];
        if compute_crc32(payload) != crc {
            tracing::warn!(offset = cursor, "CRC mismatch at journal tail, ending replay");
            break;
        }

        match ciborium::de::from_reader(payload) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!(offset = cursor, error = %e, "undecodable frame, ending replay");
                break;
            }
        }

        cursor = start + len;
    }

    records
}

/// Computes a CRC32 checksum (IEEE polynomial), half a byte at a time
/// over a 16-entry table.
fn compute_crc32(data: &[u8]) -> u32 {
    const NIBBLE_TABLE: [u32; 16] = {
        let mut table = [0u32; 16];
        let mut nibble = 0u32;
        while nibble < 16 {
            let mut crc = nibble;
            let mut round = 0;
            while round < 4 {
                crc = (crc >> 1) ^ if crc & 1 != 0 { 0xEDB8_8320 } else { 0 };
                round += 1;
            }
            table[nibble as usize] = crc;
            nibble += 1;
        }
        table
    };

    let step = |crc: u32, nibble: u32| {
        NIBBLE_TABLE[((crc ^ nibble) & 0xF) as usize] ^ (crc >> 4)
    };

    !data.iter().fold(0xFFFF_FFFF_u32, |crc, &byte| {
        let crc = step(crc, u32::from(byte));
        step(crc, u32::from(byte) >> 4)
    })
}
