//! Dataset facade: bootstraps the id spaces, makes sure a split is packed,
//! and serves rows from its store.

use std::fmt;
use std::str::FromStr;

use kgdial_store::ArrayStore;
use kgdial_vocab::{
    KnowledgeDict, KnowledgeResource, RelationIndex, TokenId, TripleCatalog, Vocabulary,
};

use crate::collate::RowBlock;
use crate::config::DatasetConfig;
use crate::packer::{check_layout, ensure_packed};
use crate::retriever::{GraphQueryService, KnowledgeRetriever};
use crate::{DataError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Valid,
    Test,
}

impl Split {
    pub fn name(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Valid => "valid",
            Split::Test => "test",
        }
    }
}

impl FromStr for Split {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "train" => Ok(Split::Train),
            "valid" => Ok(Split::Valid),
            "test" => Ok(Split::Test),
            other => Err(DataError::UnknownSplit(other.to_string())),
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One packed split plus the id spaces needed to interpret it.
#[derive(Debug)]
pub struct DialDataset {
    config: DatasetConfig,
    split: Split,
    vocab: Vocabulary,
    relations: RelationIndex,
    knowledge: KnowledgeDict,
    store: ArrayStore,
}

impl DialDataset {
    /// Open `split` (`train`, `valid` or `test`), bootstrapping whatever is
    /// missing on disk.
    pub fn open(config: &DatasetConfig, split: &str) -> Result<Self> {
        Self::open_split(config, split.parse()?)
    }

    pub fn open_split(config: &DatasetConfig, split: Split) -> Result<Self> {
        config.validate()?;

        // rebuilt on every start; never cached
        let relations = RelationIndex::from_file(&config.relation_path())?;
        let resource = KnowledgeResource::load(&config.resource_path())?;
        let vocab = Vocabulary::load_or_build(&config.vocab_path(), || {
            Vocabulary::build(&config.glove_path(), config.n_glove_vocab, &resource.entities)
        })?;

        let store = ensure_packed(config, split.name(), &vocab, || {
            TripleCatalog::build(&resource, &vocab.words, &relations)
        })?;
        store.validate()?;
        check_layout(&store)?;
        let knowledge = KnowledgeDict::build(&resource, &vocab.words, &relations)?;

        tracing::info!(
            split = %split,
            rows = store.rows(),
            words = vocab.words.len(),
            relations = relations.len(),
            "dataset ready"
        );
        Ok(Self {
            config: config.clone(),
            split,
            vocab,
            relations,
            knowledge,
            store,
        })
    }

    pub fn len(&self) -> usize {
        self.store.rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn split(&self) -> Split {
        self.split
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn batch_access(&self) -> usize {
        self.config.batch_access
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn relations(&self) -> &RelationIndex {
        &self.relations
    }

    pub fn knowledge(&self) -> &KnowledgeDict {
        &self.knowledge
    }

    pub fn store(&self) -> &ArrayStore {
        &self.store
    }

    /// Corpus id of `token`, see [`kgdial_vocab::WordVocabulary::get_word_idx`].
    pub fn get_word_idx(&self, token: &str) -> TokenId {
        self.vocab.words.get_word_idx(token)
    }

    /// Rows `index..index + batch_access`, clipped at the end of the split.
    pub fn fetch(&self, index: usize) -> Result<RowBlock> {
        let count = self.batch_access().min(self.len().saturating_sub(index)).max(1);
        Ok(RowBlock::try_from_fields(|name| {
            self.store.read_rows(name, index, count)
        })?)
    }

    /// The given rows, in the given order.
    pub fn fetch_rows(&self, rows: &[usize]) -> Result<RowBlock> {
        Ok(RowBlock::try_from_fields(|name| {
            self.store.read_rows_at(name, rows)
        })?)
    }

    /// A retriever over this dataset's id spaces.
    pub fn retriever<'a, G: GraphQueryService + ?Sized>(
        &'a self,
        service: &'a G,
    ) -> KnowledgeRetriever<'a, G> {
        KnowledgeRetriever::new(
            service,
            &self.vocab.words,
            &self.vocab.entities,
            &self.relations,
        )
    }
}
