//! kgdial dataset pipeline
//!
//! Turns sharded, knowledge-annotated dialogue records into packed array
//! stores and serves them to distributed training replicas.
//!
//! ```text
//!  glove + resource.txt ──► Vocabulary ─┐
//!  relation.txt ──────────► RelationIndex ─┤
//!                                        ▼
//!  {split}set_pieces/*  ──► packer ──► {split}set.kgd  (ArrayStore)
//!                                        │
//!      DistributedSampler ──► DialDataset::fetch_rows ──► collate ──► Batch
//!
//!  KnowledgeRetriever ──► GraphQueryService   (lazily, per training step)
//! ```
//!
//! Everything the components share (vocabulary, relation index, config) is
//! built once and passed in by reference.

pub mod collate;
pub mod config;
pub mod dataset;
pub mod loader;
pub mod packer;
pub mod record;
pub mod retriever;
pub mod sampler;

use std::path::PathBuf;

pub use kgdial_store::{ArrayStore, IntArray, StoreError};
pub use kgdial_vocab::{
    BootstrapError, IndexTriple, TokenId, DEFAULT_VOCAB, EOS_IDX, NAF_IDX, NAF_TRIPLE, PAD_IDX,
    SOS_IDX, UNK_IDX,
};

pub use collate::{collate, Batch, RowBlock, FIELDS};
pub use config::DatasetConfig;
pub use dataset::{DialDataset, Split};
pub use loader::{BatchLoader, LoaderOptions};
pub use packer::{
    check_layout, ensure_packed, pack_split, PartitionPlan, ShardAssignment, ShardMaxima,
};
pub use record::{EncodedRecord, RawRecord, RecordEncoder};
pub use retriever::{Direction, GraphQueryService, KnowledgeRetriever, RedisGraphService};
pub use sampler::DistributedSampler;

// ============================================================================
// Errors
// ============================================================================

/// Failure while building a packed store. The half-built store is removed.
#[derive(Debug, thiserror::Error)]
pub enum PackingError {
    #[error("cannot read shard {path}: {source}")]
    Shard {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: {message}")]
    Record {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("no shard files in {0}")]
    NoShards(PathBuf),
    #[error("cannot start packing workers: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
}

/// Graph-query service failure. Never retried here.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("graph service error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("graph service unavailable: {0}")]
    Unavailable(String),
    #[error("malformed graph reply: {0}")]
    Reply(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("unknown split `{0}` (expected train, valid or test)")]
    UnknownSplit(String),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("cannot load config {path}: {message}")]
    ConfigFile { path: PathBuf, message: String },
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    Packing(#[from] PackingError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
}

pub type Result<T, E = DataError> = std::result::Result<T, E>;
