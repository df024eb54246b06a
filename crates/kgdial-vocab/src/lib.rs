//! kgdial id spaces
//!
//! Bootstraps the integer id spaces every other kgdial component works in:
//!
//! - **Words** (`WordVocabulary`): special tokens, then pretrained-embedding
//!   tokens in file order, then knowledge-graph entity names.
//! - **Entities** (`EntityIndex`): knowledge-resource entity id -> word id.
//! - **Relations** (`RelationIndex`): rebuilt from the relation file on every
//!   start, never persisted.
//! - **Triples** (`TripleCatalog`, `KnowledgeDict`): numeric triple ids and the
//!   per-entity adjacency of known facts, resolved into index triples.
//!
//! Lookups never fail: unknown tokens resolve to `UNK_IDX`, unknown entities,
//! relations and triples to `NAF_IDX` / `NAF_TRIPLE`. Structural problems in
//! the source files are `BootstrapError`s.

pub mod literal;
pub mod relation;
pub mod resource;
pub mod triples;
pub mod vocab;

use std::path::{Path, PathBuf};

pub use literal::{parse_literal, Literal, LiteralError};
pub use relation::RelationIndex;
pub use resource::KnowledgeResource;
pub use triples::{KnowledgeDict, TripleCatalog, TripleNames};
pub use vocab::{EntityIndex, Vocabulary, WordVocabulary};

// ============================================================================
// Reserved ids
// ============================================================================

/// Integer id of a word, entity or relation.
pub type TokenId = i32;

/// A `(head, relation, tail)` fact in id form.
pub type IndexTriple = [TokenId; 3];

pub const DEFAULT_VOCAB: [&str; 5] = ["_PAD", "_NAF", "_UNK", "_SOS", "_EOS"];
pub const PAD_IDX: TokenId = 0;
pub const NAF_IDX: TokenId = 1;
pub const UNK_IDX: TokenId = 2;
pub const SOS_IDX: TokenId = 3;
pub const EOS_IDX: TokenId = 4;
pub const NAF_TRIPLE: IndexTriple = [NAF_IDX, NAF_IDX, NAF_IDX];

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed literal in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: LiteralError,
    },
    #[error("schema violation in {path}: {message}")]
    Schema { path: PathBuf, message: String },
    #[error("corrupt vocabulary file {path}: {message}")]
    CorruptVocabulary { path: PathBuf, message: String },
}

impl BootstrapError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn schema(path: &Path, message: impl Into<String>) -> Self {
        Self::Schema {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }
}

pub type Result<T, E = BootstrapError> = std::result::Result<T, E>;
