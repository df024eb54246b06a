//! Corpus packer: raw shards -> chunked array store.
//!
//! ```text
//! {split}set_pieces/            PartitionPlan                {split}set.kgd/
//!   a.jsonl  (4 records)  ──►  a: rows [0, 4)    ──worker──►  rows 0..4
//!   b.jsonl  (4 records)  ──►  b: rows [4, 8)    ──worker──►  rows 4..8
//!   c.jsonl  (3 records)  ──►  c: rows [8, 11)   ──worker──►  rows 8..11
//! ```
//!
//! The plan is computed up front: every worker gets an immutable
//! `(shard, offset, rows)` assignment and writes only inside it, so the
//! workers share nothing but the pre-allocated store. The store is created
//! at a worst-case shape (rows rounded up to the chunk size, sequence and
//! fan-out dimensions at their configured maxima) and shrunk to the observed
//! maxima once every worker has returned.

use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use rayon::prelude::*;

use kgdial_store::{ArraySpec, ArrayStore, StoreError};
use kgdial_vocab::{BootstrapError, TripleCatalog, Vocabulary};

use crate::collate::FIELDS;
use crate::config::DatasetConfig;
use crate::record::{stack_records, EncodedRecord, LookupMisses, RawRecord, RecordEncoder};
use crate::PackingError;

type Result<T, E = PackingError> = std::result::Result<T, E>;

// ============================================================================
// Partition plan
// ============================================================================

/// One worker's share of the split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardAssignment {
    pub shard: PathBuf,
    /// First store row of this shard
    pub offset: usize,
    pub rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    /// Records across all shards
    pub total_rows: usize,
    /// `total_rows` rounded up to a whole number of chunks
    pub padded_rows: usize,
    pub assignments: Vec<ShardAssignment>,
}

impl PartitionPlan {
    /// Plan from `(shard, record count)` pairs, offsets in the given order.
    pub fn from_counts(counts: Vec<(PathBuf, usize)>, chunk_rows: usize) -> Self {
        let mut offset = 0;
        let assignments = counts
            .into_iter()
            .map(|(shard, rows)| {
                let assignment = ShardAssignment {
                    shard,
                    offset,
                    rows,
                };
                offset += rows;
                assignment
            })
            .collect();
        Self {
            total_rows: offset,
            padded_rows: offset.div_ceil(chunk_rows) * chunk_rows,
            assignments,
        }
    }

    /// Count the records of every shard and plan over them.
    pub fn for_shards(shards: &[PathBuf], chunk_rows: usize) -> Result<Self> {
        let counts = shards
            .iter()
            .map(|shard| Ok((shard.clone(), count_records(shard)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_counts(counts, chunk_rows))
    }
}

/// Regular files in `dir`, sorted by name.
pub fn list_shards(dir: &Path) -> Result<Vec<PathBuf>> {
    let shard_err = |source| PackingError::Shard {
        path: dir.to_path_buf(),
        source,
    };
    let mut shards = Vec::new();
    for entry in fs::read_dir(dir).map_err(shard_err)? {
        let entry = entry.map_err(shard_err)?;
        if entry.file_type().map_err(shard_err)?.is_file() {
            shards.push(entry.path());
        }
    }
    shards.sort();
    Ok(shards)
}

/// Number of non-blank lines in a shard.
pub fn count_records(path: &Path) -> Result<usize> {
    let shard_err = |source| PackingError::Shard {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(shard_err)?;
    let mut count = 0;
    for line in BufReader::new(file).lines() {
        if !line.map_err(shard_err)?.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

// ============================================================================
// Workers
// ============================================================================

/// Largest lengths a worker saw in its shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardMaxima {
    pub post_len: usize,
    pub response_len: usize,
    pub fan_out: usize,
}

impl ShardMaxima {
    pub fn merge(self, other: Self) -> Self {
        Self {
            post_len: self.post_len.max(other.post_len),
            response_len: self.response_len.max(other.response_len),
            fan_out: self.fan_out.max(other.fan_out),
        }
    }
}

/// Encode one shard into its assigned rows, flushing every `chunk_rows`
/// records to keep memory bounded.
fn pack_shard(
    store: &ArrayStore,
    encoder: &RecordEncoder<'_>,
    assignment: &ShardAssignment,
) -> Result<ShardMaxima> {
    let path = &assignment.shard;
    let shard_err = |source| PackingError::Shard {
        path: path.clone(),
        source,
    };
    let record_err = |line: usize, message: String| PackingError::Record {
        path: path.clone(),
        line,
        message,
    };

    let flush_rows = store.chunk_rows();
    let (msl, mtl) = (encoder.max_sentence_len(), encoder.max_triple_len());
    let mut maxima = ShardMaxima::default();
    let mut misses = LookupMisses::default();
    let mut pending = Vec::with_capacity(flush_rows);
    let mut next_row = assignment.offset;
    let end_row = assignment.offset + assignment.rows;

    let flush = |pending: &mut Vec<EncodedRecord>, next_row: &mut usize| -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let block = stack_records(pending, msl, mtl)?;
        for (name, array) in block.fields() {
            store.write_rows(name, *next_row, array)?;
        }
        *next_row += pending.len();
        pending.clear();
        Ok(())
    };

    let file = File::open(path).map_err(shard_err)?;
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(shard_err)?;
        if line.trim().is_empty() {
            continue;
        }
        if next_row + pending.len() >= end_row {
            return Err(record_err(i + 1, "shard grew after it was counted".to_string()));
        }
        let raw: RawRecord = serde_json::from_str(&line)
            .map_err(|e| record_err(i + 1, format!("invalid record: {e}")))?;
        let encoded = encoder
            .encode(&raw, &mut misses)
            .map_err(|message| record_err(i + 1, message))?;

        maxima = maxima.merge(ShardMaxima {
            post_len: encoded.post_length as usize,
            response_len: encoded.response_length as usize,
            fan_out: encoded.fan_out,
        });
        pending.push(encoded);
        if pending.len() == flush_rows {
            flush(&mut pending, &mut next_row)?;
        }
    }
    flush(&mut pending, &mut next_row)?;

    if next_row != end_row {
        return Err(PackingError::Record {
            path: path.clone(),
            line: 0,
            message: format!(
                "expected {} records, found {}",
                assignment.rows,
                next_row - assignment.offset
            ),
        });
    }
    if misses.total() > 0 {
        tracing::warn!(
            shard = %path.display(),
            unknown_tokens = misses.tokens,
            unknown_entities = misses.entities,
            unknown_triples = misses.triples,
            "lookup misses replaced by UNK/NAF"
        );
    }
    tracing::debug!(shard = %path.display(), rows = assignment.rows, offset = assignment.offset, "shard packed");
    Ok(maxima)
}

// ============================================================================
// Split packing
// ============================================================================

fn store_specs(rows: usize, msl: usize, mtl: usize) -> Vec<ArraySpec> {
    vec![
        ArraySpec::new("post", &[rows, msl]),
        ArraySpec::new("post_length", &[rows]),
        ArraySpec::new("response", &[rows, msl]),
        ArraySpec::new("response_length", &[rows]),
        ArraySpec::new("triple", &[rows, msl, mtl, 3]),
        ArraySpec::new("entity", &[rows, msl, mtl]),
        ArraySpec::new("response_triple", &[rows, msl, 3]),
    ]
}

/// Pack `split` from its shards into a new store.
///
/// Any failure removes the half-built store directory.
pub fn pack_split(
    config: &DatasetConfig,
    split: &str,
    vocab: &Vocabulary,
    catalog: &TripleCatalog,
) -> Result<ArrayStore> {
    let shard_dir = config.shard_dir(split);
    let shards = list_shards(&shard_dir)?;
    let plan = PartitionPlan::for_shards(&shards, config.chunk_rows)?;
    if plan.total_rows == 0 {
        return Err(PackingError::NoShards(shard_dir));
    }

    let (msl, mtl) = (config.max_sentence_len, config.max_triple_len);
    let mut store = ArrayStore::create(
        &config.store_dir(split),
        config.chunk_rows,
        &store_specs(plan.padded_rows, msl, mtl),
    )?;
    tracing::info!(
        split,
        shards = shards.len(),
        rows = plan.total_rows,
        "packing split"
    );

    match fill(config, &plan, vocab, catalog, &mut store) {
        Ok(maxima) => {
            tracing::info!(
                split,
                rows = plan.total_rows,
                max_post_len = maxima.post_len,
                max_response_len = maxima.response_len,
                max_triple_len = maxima.fan_out,
                "split packed"
            );
            Ok(store)
        }
        Err(e) => {
            let root = store.root().to_path_buf();
            if let Err(cleanup) = store.destroy() {
                tracing::warn!(store = %root.display(), error = %cleanup, "cannot remove partial store");
            }
            Err(e)
        }
    }
}

fn fill(
    config: &DatasetConfig,
    plan: &PartitionPlan,
    vocab: &Vocabulary,
    catalog: &TripleCatalog,
    store: &mut ArrayStore,
) -> Result<ShardMaxima> {
    let encoder = RecordEncoder::new(
        &vocab.words,
        &vocab.entities,
        catalog,
        config.max_sentence_len,
        config.max_triple_len,
    );
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers_for(plan.assignments.len()))
        .build()?;

    let shared: &ArrayStore = store;
    let maxima = pool
        .install(|| {
            plan.assignments
                .par_iter()
                .map(|assignment| pack_shard(shared, &encoder, assignment))
                .collect::<Result<Vec<_>>>()
        })?
        .into_iter()
        .fold(ShardMaxima::default(), ShardMaxima::merge);

    let n = plan.total_rows;
    let (pl, rl, tl) = (maxima.post_len, maxima.response_len, maxima.fan_out);
    store.resize("post", &[n, pl])?;
    store.resize("post_length", &[n])?;
    store.resize("response", &[n, rl])?;
    store.resize("response_length", &[n])?;
    store.resize("triple", &[n, pl, tl, 3])?;
    store.resize("entity", &[n, pl, tl])?;
    store.resize("response_triple", &[n, rl, 3])?;
    store.mark_complete()?;
    Ok(maxima)
}

/// Check that `store` holds exactly the dataset fields with consistent inner
/// dimensions: `post`, `triple` and `entity` share the post width, `response`
/// and `response_triple` the response width, `triple` and `entity` the
/// fan-out.
pub fn check_layout(store: &ArrayStore) -> Result<(), StoreError> {
    let mut names: Vec<&str> = store.array_names().collect();
    names.sort_unstable();
    let mut expected = FIELDS.to_vec();
    expected.sort_unstable();
    if names != expected {
        return Err(StoreError::Shape {
            name: "<store>".to_string(),
            message: format!("expected arrays {expected:?}, found {names:?}"),
        });
    }

    let n = store.rows();
    let post = store.shape("post")?;
    let response = store.shape("response")?;
    let triple = store.shape("triple")?;
    let (pl, rl) = (post.get(1).copied(), response.get(1).copied());
    let tl = triple.get(2).copied();
    let layout = [
        ("post", vec![Some(n), pl]),
        ("post_length", vec![Some(n)]),
        ("response", vec![Some(n), rl]),
        ("response_length", vec![Some(n)]),
        ("triple", vec![Some(n), pl, tl, Some(3)]),
        ("entity", vec![Some(n), pl, tl]),
        ("response_triple", vec![Some(n), rl, Some(3)]),
    ];
    for (name, dims) in layout {
        let shape = store.shape(name)?;
        let matches = shape.len() == dims.len()
            && shape.iter().zip(&dims).all(|(&d, want)| Some(d) == *want);
        if !matches {
            return Err(StoreError::Shape {
                name: name.to_string(),
                message: format!("shape {shape:?} does not fit the dataset layout"),
            });
        }
    }
    Ok(())
}

/// Open the packed store for `split`, packing it first when it is missing
/// or fails validation. `catalog` is only called when packing.
pub fn ensure_packed(
    config: &DatasetConfig,
    split: &str,
    vocab: &Vocabulary,
    catalog: impl FnOnce() -> Result<TripleCatalog, BootstrapError>,
) -> Result<ArrayStore> {
    let root = config.store_dir(split);
    if root.exists() {
        let reusable = ArrayStore::open(&root).and_then(|store| {
            store.validate()?;
            check_layout(&store)?;
            Ok(store)
        });
        match reusable {
            Ok(store) => {
                tracing::info!(split, store = %root.display(), rows = store.rows(), "reusing packed store");
                return Ok(store);
            }
            Err(e) => {
                tracing::warn!(split, store = %root.display(), error = %e, "discarding unusable store");
                fs::remove_dir_all(&root).map_err(|source| PackingError::Shard {
                    path: root.clone(),
                    source,
                })?;
            }
        }
    }
    let catalog = catalog()?;
    pack_split(config, split, vocab, &catalog)
}
