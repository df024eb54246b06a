//! Dataset configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{DataError, Result};

/// Where the corpus lives and how it is packed and served.
///
/// Every field has a default, so a JSON config only needs the fields it
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Root holding the resource files, shard directories and packed stores
    pub data_dir: PathBuf,
    /// Pretrained embedding lines read into the vocabulary
    pub n_glove_vocab: usize,
    /// Padded sequence length, including SOS/EOS
    pub max_sentence_len: usize,
    /// Padded knowledge fan-out per token
    pub max_triple_len: usize,
    /// Rows per store chunk
    pub chunk_rows: usize,
    /// Consecutive rows fetched (and sampled) as one block
    pub batch_access: usize,
    /// Packing threads; `None` uses every available core
    pub num_workers: Option<usize>,
    pub glove_file: String,
    pub resource_file: String,
    pub relation_file: String,
    pub vocab_file: String,
    pub graph_url: String,
    pub graph_name: String,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            n_glove_vocab: 30000,
            max_sentence_len: 150,
            max_triple_len: 50,
            chunk_rows: 1024,
            batch_access: 1,
            num_workers: None,
            glove_file: "glove.840B.300d.txt".to_string(),
            resource_file: "resource.txt".to_string(),
            relation_file: "relation.txt".to_string(),
            vocab_file: "vocab.bin".to_string(),
            graph_url: "redis://127.0.0.1/".to_string(),
            graph_name: "CCM".to_string(),
        }
    }
}

impl DatasetConfig {
    /// Load a JSON config. Missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| DataError::ConfigFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| DataError::ConfigFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Override fields from `KGDIAL_*` environment variables.
    pub fn apply_env(mut self) -> Result<Self> {
        if let Ok(dir) = std::env::var("KGDIAL_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var("KGDIAL_GRAPH_URL") {
            self.graph_url = url;
        }
        if let Ok(name) = std::env::var("KGDIAL_GRAPH_NAME") {
            self.graph_name = name;
        }
        if let Ok(workers) = std::env::var("KGDIAL_WORKERS") {
            let n = workers
                .parse()
                .map_err(|_| DataError::Config(format!("KGDIAL_WORKERS={workers:?} is not a count")))?;
            self.num_workers = Some(n);
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_rows == 0 {
            return Err(DataError::Config("chunk_rows must be positive".into()));
        }
        if self.batch_access == 0 {
            return Err(DataError::Config("batch_access must be positive".into()));
        }
        if self.max_sentence_len < 2 {
            return Err(DataError::Config(
                "max_sentence_len must leave room for SOS and EOS".into(),
            ));
        }
        if self.max_triple_len == 0 {
            return Err(DataError::Config("max_triple_len must be positive".into()));
        }
        if self.num_workers == Some(0) {
            return Err(DataError::Config("num_workers must be positive".into()));
        }
        Ok(())
    }

    pub fn glove_path(&self) -> PathBuf {
        self.data_dir.join(&self.glove_file)
    }

    pub fn resource_path(&self) -> PathBuf {
        self.data_dir.join(&self.resource_file)
    }

    pub fn relation_path(&self) -> PathBuf {
        self.data_dir.join(&self.relation_file)
    }

    pub fn vocab_path(&self) -> PathBuf {
        self.data_dir.join(&self.vocab_file)
    }

    /// Directory of raw shards for `split`.
    pub fn shard_dir(&self, split: &str) -> PathBuf {
        self.data_dir.join(format!("{split}set_pieces"))
    }

    /// Packed store directory for `split`.
    pub fn store_dir(&self, split: &str) -> PathBuf {
        self.data_dir.join(format!("{split}set.kgd"))
    }

    /// Worker count for `shards` shard files.
    pub fn workers_for(&self, shards: usize) -> usize {
        let cores = self.num_workers.unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        });
        cores.min(shards).max(1)
    }
}
