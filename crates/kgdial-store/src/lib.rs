//! kgdial Chunked Array Store
//!
//! A directory of named, row-aligned `i32` arrays, each split along the row
//! dimension into fixed-size chunk files:
//!
//! ```text
//! trainset.kgd/
//! ├── manifest.json          version, state, chunk_rows, array shapes
//! ├── post/
//! │   ├── c0.bin             rows [0, chunk_rows)
//! │   └── c1.bin             rows [chunk_rows, 2 * chunk_rows)
//! └── triple/
//!     └── ...
//! ```
//!
//! ## Lifecycle
//!
//! 1. `create` pre-allocates every array at an oversized shape (state `building`).
//! 2. Writers call `write_rows` at absolute row offsets. Disjoint row ranges map
//!    to disjoint bytes, so writers need no coordination.
//! 3. `resize` shrinks arrays to their true shape.
//! 4. `mark_complete` flips the manifest to `complete`.
//! 5. Readers `open` the directory, `validate` it, and read rows through lazily
//!    mapped chunks.

pub mod array;
mod chunk;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};

pub use array::IntArray;

use chunk::{io_err, ELEM_BYTES};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const STORE_FORMAT_VERSION: u32 = 1;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid manifest {path}: {message}")]
    Manifest { path: PathBuf, message: String },
    #[error("unknown array `{0}`")]
    UnknownArray(String),
    #[error("array `{name}`: {message}")]
    Shape { name: String, message: String },
    #[error("store at {0} was not completed")]
    Incomplete(PathBuf),
    #[error("store already exists at {0}")]
    AlreadyExists(PathBuf),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

// ============================================================================
// Manifest
// ============================================================================

/// Name and initial shape of one array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArraySpec {
    pub name: String,
    pub shape: Vec<usize>,
}

impl ArraySpec {
    pub fn new(name: impl Into<String>, shape: &[usize]) -> Self {
        Self {
            name: name.into(),
            shape: shape.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreState {
    Building,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    state: StoreState,
    chunk_rows: usize,
    arrays: BTreeMap<String, ArrayMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArrayMeta {
    shape: Vec<usize>,
}

impl ArrayMeta {
    fn rows(&self) -> usize {
        self.shape[0]
    }

    fn row_len(&self) -> usize {
        self.shape[1..].iter().product()
    }

    fn chunks(&self, chunk_rows: usize) -> usize {
        self.rows().div_ceil(chunk_rows)
    }

    fn chunk_bytes(&self, chunk_rows: usize) -> usize {
        chunk_rows * self.row_len() * ELEM_BYTES
    }
}

impl Manifest {
    fn load(root: &Path) -> Result<Self> {
        let path = root.join(MANIFEST_FILE);
        let text = fs::read_to_string(&path).map_err(io_err(&path))?;
        let manifest: Manifest =
            serde_json::from_str(&text).map_err(|e| StoreError::Manifest {
                path: path.clone(),
                message: e.to_string(),
            })?;
        if manifest.version != STORE_FORMAT_VERSION {
            return Err(StoreError::Manifest {
                path,
                message: format!("unsupported store version {}", manifest.version),
            });
        }
        if manifest.chunk_rows == 0 {
            return Err(StoreError::Manifest {
                path,
                message: "chunk_rows must be positive".to_string(),
            });
        }
        for (name, meta) in &manifest.arrays {
            check_shape(name, &meta.shape).map_err(|e| StoreError::Manifest {
                path: path.clone(),
                message: e.to_string(),
            })?;
        }
        Ok(manifest)
    }

    fn save(&self, root: &Path) -> Result<()> {
        let path = root.join(MANIFEST_FILE);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(self).map_err(|e| StoreError::Manifest {
            path: path.clone(),
            message: e.to_string(),
        })?;
        fs::write(&tmp, bytes).map_err(io_err(&tmp))?;
        fs::rename(&tmp, &path).map_err(io_err(&path))
    }
}

fn check_shape(name: &str, shape: &[usize]) -> Result<()> {
    if shape.is_empty() {
        return Err(StoreError::Shape {
            name: name.to_string(),
            message: "shape needs at least a row dimension".to_string(),
        });
    }
    if shape[1..].contains(&0) {
        return Err(StoreError::Shape {
            name: name.to_string(),
            message: format!("inner dimensions of {shape:?} must be positive"),
        });
    }
    Ok(())
}

// ============================================================================
// Store
// ============================================================================

/// A set of row-aligned chunked arrays rooted at one directory.
pub struct ArrayStore {
    root: PathBuf,
    manifest: Manifest,
    /// Read-side chunk maps, created on first access.
    mapped: DashMap<(String, usize), Arc<Mmap>>,
}

impl std::fmt::Debug for ArrayStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayStore")
            .field("root", &self.root)
            .field("state", &self.manifest.state)
            .field("chunk_rows", &self.manifest.chunk_rows)
            .finish()
    }
}

impl ArrayStore {
    /// Whether a manifest is present at `root`. Says nothing about completeness.
    pub fn exists(root: &Path) -> bool {
        root.join(MANIFEST_FILE).is_file()
    }

    /// Pre-allocate a new store with every array zero-filled at `specs` shapes.
    pub fn create(root: &Path, chunk_rows: usize, specs: &[ArraySpec]) -> Result<Self> {
        if root.exists() {
            return Err(StoreError::AlreadyExists(root.to_path_buf()));
        }
        if chunk_rows == 0 {
            return Err(StoreError::Manifest {
                path: root.join(MANIFEST_FILE),
                message: "chunk_rows must be positive".to_string(),
            });
        }
        let mut arrays = BTreeMap::new();
        for spec in specs {
            check_shape(&spec.name, &spec.shape)?;
            arrays.insert(
                spec.name.clone(),
                ArrayMeta {
                    shape: spec.shape.clone(),
                },
            );
        }

        fs::create_dir_all(root).map_err(io_err(root))?;
        for (name, meta) in &arrays {
            let dir = root.join(name);
            fs::create_dir_all(&dir).map_err(io_err(&dir))?;
            for c in 0..meta.chunks(chunk_rows) {
                chunk::create(&chunk::chunk_path(&dir, c), meta.chunk_bytes(chunk_rows))?;
            }
        }

        let manifest = Manifest {
            version: STORE_FORMAT_VERSION,
            state: StoreState::Building,
            chunk_rows,
            arrays,
        };
        manifest.save(root)?;
        tracing::debug!(root = %root.display(), chunk_rows, "created array store");

        Ok(Self {
            root: root.to_path_buf(),
            manifest,
            mapped: DashMap::new(),
        })
    }

    /// Open an existing store. Chunks are mapped lazily on first read.
    pub fn open(root: &Path) -> Result<Self> {
        let manifest = Manifest::load(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            manifest,
            mapped: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> StoreState {
        self.manifest.state
    }

    pub fn chunk_rows(&self) -> usize {
        self.manifest.chunk_rows
    }

    pub fn array_names(&self) -> impl Iterator<Item = &str> {
        self.manifest.arrays.keys().map(String::as_str)
    }

    pub fn shape(&self, name: &str) -> Result<&[usize]> {
        Ok(&self.meta(name)?.shape)
    }

    /// Row count of the store (the row count of its first array).
    pub fn rows(&self) -> usize {
        self.manifest
            .arrays
            .values()
            .next()
            .map_or(0, ArrayMeta::rows)
    }

    fn meta(&self, name: &str) -> Result<&ArrayMeta> {
        self.manifest
            .arrays
            .get(name)
            .ok_or_else(|| StoreError::UnknownArray(name.to_string()))
    }

    fn array_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Write `values` into rows `start_row..start_row + values.rows()`.
    ///
    /// Safe to call concurrently from several threads or processes as long as
    /// their row ranges do not overlap.
    pub fn write_rows(&self, name: &str, start_row: usize, values: &IntArray) -> Result<()> {
        let meta = self.meta(name)?;
        if values.inner_shape() != &meta.shape[1..] {
            return Err(StoreError::Shape {
                name: name.to_string(),
                message: format!(
                    "row shape {:?} does not match array row shape {:?}",
                    values.inner_shape(),
                    &meta.shape[1..]
                ),
            });
        }
        let end = start_row + values.rows();
        if end > meta.rows() {
            return Err(StoreError::Shape {
                name: name.to_string(),
                message: format!("rows {start_row}..{end} exceed {} rows", meta.rows()),
            });
        }

        let chunk_rows = self.manifest.chunk_rows;
        let row_len = meta.row_len();
        let dir = self.array_dir(name);
        let data = values.data();
        let mut row = start_row;
        while row < end {
            let c = row / chunk_rows;
            let in_chunk = row % chunk_rows;
            let n = (end - row).min(chunk_rows - in_chunk);
            let src = (row - start_row) * row_len;
            chunk::write_at(
                &chunk::chunk_path(&dir, c),
                in_chunk * row_len,
                &data[src..src + n * row_len],
            )?;
            row += n;
        }
        Ok(())
    }

    /// Shrink an array to `new_shape`. Every dimension must be no larger than
    /// the current one.
    pub fn resize(&mut self, name: &str, new_shape: &[usize]) -> Result<()> {
        check_shape(name, new_shape)?;
        let chunk_rows = self.manifest.chunk_rows;
        let old = self.meta(name)?.clone();
        if new_shape.len() != old.shape.len() {
            return Err(StoreError::Shape {
                name: name.to_string(),
                message: format!("cannot change rank {:?} -> {new_shape:?}", old.shape),
            });
        }
        if new_shape.iter().zip(&old.shape).any(|(new, old)| new > old) {
            return Err(StoreError::Shape {
                name: name.to_string(),
                message: format!("cannot grow {:?} -> {new_shape:?}", old.shape),
            });
        }

        let new = ArrayMeta {
            shape: new_shape.to_vec(),
        };
        let dir = self.array_dir(name);
        self.mapped.retain(|(array, _), _| array != name);

        if new.shape[1..] != old.shape[1..] {
            let (old_len, new_len) = (old.row_len(), new.row_len());
            for c in 0..new.chunks(chunk_rows) {
                let path = chunk::chunk_path(&dir, c);
                let bytes = fs::read(&path).map_err(io_err(&path))?;
                let mut src = Vec::with_capacity(bytes.len() / ELEM_BYTES);
                chunk::decode(&bytes, &mut src);

                let live_rows = (new.rows() - c * chunk_rows).min(chunk_rows);
                let mut dst = vec![0i32; chunk_rows * new_len];
                for r in 0..live_rows {
                    array::copy_region(
                        &src[r * old_len..(r + 1) * old_len],
                        &old.shape[1..],
                        &mut dst[r * new_len..(r + 1) * new_len],
                        &new.shape[1..],
                    );
                }
                chunk::replace(&path, &chunk::encode(&dst))?;
            }
        }
        for c in new.chunks(chunk_rows)..old.chunks(chunk_rows) {
            let path = chunk::chunk_path(&dir, c);
            fs::remove_file(&path).map_err(io_err(&path))?;
        }

        tracing::debug!(array = name, from = ?old.shape, to = ?new.shape, "resized array");
        self.manifest.arrays.insert(name.to_string(), new);
        self.manifest.save(&self.root)
    }

    /// Mark the build finished. Readers refuse stores that never reach this.
    pub fn mark_complete(&mut self) -> Result<()> {
        self.manifest.state = StoreState::Complete;
        self.manifest.save(&self.root)
    }

    /// Delete the store directory.
    pub fn destroy(self) -> Result<()> {
        fs::remove_dir_all(&self.root).map_err(io_err(&self.root))
    }

    // ========================================================================
    // Reads
    // ========================================================================

    fn mapped_chunk(&self, name: &str, c: usize) -> Result<Arc<Mmap>> {
        let key = (name.to_string(), c);
        if let Some(map) = self.mapped.get(&key) {
            return Ok(Arc::clone(map.value()));
        }
        let map = Arc::new(chunk::map_read(&chunk::chunk_path(
            &self.array_dir(name),
            c,
        ))?);
        Ok(Arc::clone(self.mapped.entry(key).or_insert(map).value()))
    }

    fn check_row(&self, name: &str, meta: &ArrayMeta, row: usize) -> Result<()> {
        if row >= meta.rows() {
            return Err(StoreError::Shape {
                name: name.to_string(),
                message: format!("row {row} out of bounds for {} rows", meta.rows()),
            });
        }
        Ok(())
    }

    fn read_span(
        &self,
        name: &str,
        meta: &ArrayMeta,
        start: usize,
        count: usize,
        out: &mut Vec<i32>,
    ) -> Result<()> {
        let chunk_rows = self.manifest.chunk_rows;
        let row_bytes = meta.row_len() * ELEM_BYTES;
        let end = start + count;
        let mut row = start;
        while row < end {
            let c = row / chunk_rows;
            let in_chunk = row % chunk_rows;
            let n = (end - row).min(chunk_rows - in_chunk);
            let map = self.mapped_chunk(name, c)?;
            let from = in_chunk * row_bytes;
            let to = from + n * row_bytes;
            if to > map.len() {
                return Err(StoreError::Shape {
                    name: name.to_string(),
                    message: format!("chunk {c} is truncated ({} bytes)", map.len()),
                });
            }
            chunk::decode(&map[from..to], out);
            row += n;
        }
        Ok(())
    }

    /// Read rows `start..start + count`.
    pub fn read_rows(&self, name: &str, start: usize, count: usize) -> Result<IntArray> {
        let meta = self.meta(name)?;
        if start + count > meta.rows() {
            return Err(StoreError::Shape {
                name: name.to_string(),
                message: format!(
                    "rows {start}..{} out of bounds for {} rows",
                    start + count,
                    meta.rows()
                ),
            });
        }
        let mut data = Vec::with_capacity(count * meta.row_len());
        self.read_span(name, meta, start, count, &mut data)?;
        let mut shape = meta.shape.clone();
        shape[0] = count;
        IntArray::from_vec(&shape, data)
    }

    pub fn read_row(&self, name: &str, row: usize) -> Result<IntArray> {
        self.read_rows(name, row, 1)
    }

    /// Gather arbitrary rows, in the order given.
    pub fn read_rows_at(&self, name: &str, rows: &[usize]) -> Result<IntArray> {
        let meta = self.meta(name)?;
        let mut data = Vec::with_capacity(rows.len() * meta.row_len());
        for &row in rows {
            self.check_row(name, meta, row)?;
            self.read_span(name, meta, row, 1, &mut data)?;
        }
        let mut shape = meta.shape.clone();
        shape[0] = rows.len();
        IntArray::from_vec(&shape, data)
    }

    // ========================================================================
    // Validation
    // ========================================================================

    /// Check that a store is safe to serve: it was completed, all arrays share
    /// one row count, and every chunk file exists at its exact size.
    pub fn validate(&self) -> Result<()> {
        if self.manifest.state != StoreState::Complete {
            return Err(StoreError::Incomplete(self.root.clone()));
        }
        let rows = self.rows();
        let chunk_rows = self.manifest.chunk_rows;
        for (name, meta) in &self.manifest.arrays {
            check_shape(name, &meta.shape)?;
            if meta.rows() != rows {
                return Err(StoreError::Shape {
                    name: name.clone(),
                    message: format!("has {} rows, store has {rows}", meta.rows()),
                });
            }
            let dir = self.array_dir(name);
            let expected = meta.chunk_bytes(chunk_rows) as u64;
            for c in 0..meta.chunks(chunk_rows) {
                let path = chunk::chunk_path(&dir, c);
                let len = fs::metadata(&path).map_err(io_err(&path))?.len();
                if len != expected {
                    return Err(StoreError::Shape {
                        name: name.clone(),
                        message: format!(
                            "chunk {} is {len} bytes, expected {expected}",
                            path.display()
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}
