//! Chunk files: fixed-size, zero-initialised blocks of rows.
//!
//! A chunk holds `chunk_rows` rows of one array as little-endian `i32`. Files
//! are created at full size, so a row's byte range inside a chunk never moves
//! and writers touching different rows never touch the same bytes.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut};

use crate::{Result, StoreError};

pub(crate) const ELEM_BYTES: usize = std::mem::size_of::<i32>();

pub(crate) fn chunk_path(array_dir: &Path, chunk: usize) -> PathBuf {
    array_dir.join(format!("c{chunk}.bin"))
}

pub(crate) fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Create (or truncate) a zero-filled chunk file of `len` bytes.
pub(crate) fn create(path: &Path, len: usize) -> Result<()> {
    let file = File::create(path).map_err(io_err(path))?;
    file.set_len(len as u64).map_err(io_err(path))
}

pub(crate) fn map_read(path: &Path) -> Result<Mmap> {
    let file = File::open(path).map_err(io_err(path))?;
    // SAFETY: chunk files are only written while a store is being built; a store
    // is opened for reading after the build has completed.
    unsafe { Mmap::map(&file) }.map_err(io_err(path))
}

/// Write `values` into the chunk starting at element offset `elem_offset`.
pub(crate) fn write_at(path: &Path, elem_offset: usize, values: &[i32]) -> Result<()> {
    if values.is_empty() {
        return Ok(());
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(io_err(path))?;
    // SAFETY: concurrent writers map the same file but each one writes a
    // disjoint row range, so no byte is written by two threads.
    let mut map = unsafe { MmapMut::map_mut(&file) }.map_err(io_err(path))?;

    let start = elem_offset * ELEM_BYTES;
    let end = start + values.len() * ELEM_BYTES;
    if end > map.len() {
        return Err(StoreError::Shape {
            name: path.display().to_string(),
            message: format!("write of bytes {start}..{end} past chunk end {}", map.len()),
        });
    }
    for (dst, v) in map[start..end].chunks_exact_mut(ELEM_BYTES).zip(values) {
        dst.copy_from_slice(&v.to_le_bytes());
    }
    map.flush_range(start, end - start).map_err(io_err(path))
}

pub(crate) fn decode(bytes: &[u8], out: &mut Vec<i32>) {
    out.extend(
        bytes
            .chunks_exact(ELEM_BYTES)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]])),
    );
}

pub(crate) fn encode(values: &[i32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * ELEM_BYTES);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Replace a chunk file with `bytes` via a temp file and rename.
pub(crate) fn replace(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("bin.tmp");
    fs::write(&tmp, bytes).map_err(io_err(&tmp))?;
    fs::rename(&tmp, path).map_err(io_err(path))
}
